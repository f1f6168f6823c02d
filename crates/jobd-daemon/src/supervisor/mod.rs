//! Process supervisor.
//!
//! Owns the job table and implements the four client-facing operations.
//! Jobs are launched through the runner binary, which installs resource
//! limits on itself before exec'ing the user command; the supervisor only
//! ever sees the runner as its direct child.
//!
//! The job table is guarded by a single mutex with short critical sections:
//! no I/O and no awaits happen under the lock. The output buffer has its
//! own synchronization and is always a leaf in the lock order.

mod job;

pub use job::{Job, JobId, JobState};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jobd_core::limits::ResourceLimits;
use jobd_core::outbuf::{OutputBuffer, OutputReader};
use jobd_core::perms::{Operation, PermissionTable};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Errors surfaced by supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// `start` was called with an empty path.
    #[error("no command to run")]
    EmptyPath,

    /// The client lacks the permission the operation requires.
    #[error("permission denied")]
    PermissionDenied,

    /// Unknown job id, or a job owned by another client. The two cases are
    /// indistinguishable on purpose.
    #[error("job not found")]
    NotFound,

    /// Delivering a signal to the job's process group failed.
    #[error("failed to signal job: {0}")]
    Signal(#[from] nix::Error),
}

/// The supervisor: job table, permission table, launcher configuration.
pub struct Supervisor {
    jobs: Mutex<HashMap<JobId, Job>>,
    perms: PermissionTable,
    runner: PathBuf,
    limits: ResourceLimits,
}

impl Supervisor {
    /// Create a supervisor that launches jobs through the runner binary at
    /// `runner`.
    #[must_use]
    pub fn new(perms: PermissionTable, runner: PathBuf, limits: ResourceLimits) -> Arc<Self> {
        Arc::new(Self {
            jobs: Mutex::new(HashMap::new()),
            perms,
            runner,
            limits,
        })
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorize(&self, client: &str, op: Operation) -> Result<(), SupervisorError> {
        if self.perms.allows(client, op) {
            Ok(())
        } else {
            debug!(client = %client, op = %op, "permission denied");
            Err(SupervisorError::PermissionDenied)
        }
    }

    /// Number of jobs in the table (all states).
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs().len()
    }

    /// Start `path args…` on behalf of `client`.
    ///
    /// The job record is inserted before the launcher is spawned, so an
    /// immediate `status` may observe `NotStarted`. The returned id is
    /// resolvable until the daemon exits.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::PermissionDenied`] without the `start` grant and
    /// [`SupervisorError::EmptyPath`] for an empty path. Launch failures are
    /// not errors here; they surface as `Stopped` with exit code 1.
    pub fn start(
        self: &Arc<Self>,
        client: &str,
        path: &str,
        args: &[String],
    ) -> Result<JobId, SupervisorError> {
        self.authorize(client, Operation::Start)?;
        if path.is_empty() {
            return Err(SupervisorError::EmptyPath);
        }

        let id = JobId::new();
        let output = OutputBuffer::new();
        self.jobs()
            .insert(id, Job::new(client, Arc::clone(&output)));

        let mut cmd = Command::new(&self.runner);
        cmd.arg("start")
            .arg(format!("worker-{id}"))
            .arg(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(false);
        for (key, value) in self.limits.to_env() {
            cmd.env(key, value);
        }

        let command_line = if args.is_empty() {
            path.to_string()
        } else {
            format!("{path} {}", args.join(" "))
        };
        info!(job_id = %id, client = %client, command = %command_line, "starting job");

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.supervise(id, cmd, output, command_line).await;
        });

        Ok(id)
    }

    /// Kill the job's whole process group with SIGKILL.
    ///
    /// Best-effort and asynchronous: the call returns once the signal is
    /// sent; the terminal state is recorded when the child is reaped. A job
    /// that is not running is left untouched and the call succeeds.
    ///
    /// # Errors
    ///
    /// Permission and lookup failures as usual; [`SupervisorError::Signal`]
    /// when the kernel refuses the signal for a live group.
    pub fn stop(&self, client: &str, id: &str) -> Result<(), SupervisorError> {
        self.authorize(client, Operation::Stop)?;
        let jobs = self.jobs();
        let job = find(&jobs, client, id)?;
        if job.state.is_running() {
            if let Some(pgid) = job.pgid {
                info!(job_id = %id, client = %client, "killing process group {pgid}");
                match killpg(pgid, Signal::SIGKILL) {
                    // The group died between the state check and the kill.
                    Err(Errno::ESRCH) => {}
                    other => other?,
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the job's lifecycle state.
    ///
    /// # Errors
    ///
    /// Permission and lookup failures as for [`stop`](Self::stop).
    pub fn status(&self, client: &str, id: &str) -> Result<JobState, SupervisorError> {
        self.authorize(client, Operation::Status)?;
        let jobs = self.jobs();
        find(&jobs, client, id).map(|job| job.state)
    }

    /// Subscribe to the job's combined output from offset zero.
    ///
    /// # Errors
    ///
    /// Permission and lookup failures as for [`stop`](Self::stop).
    pub fn subscribe(&self, client: &str, id: &str) -> Result<OutputReader, SupervisorError> {
        self.authorize(client, Operation::Stream)?;
        let jobs = self.jobs();
        find(&jobs, client, id).map(|job| job.output.subscribe())
    }

    /// Drive one job from spawn to reap.
    async fn supervise(
        self: Arc<Self>,
        id: JobId,
        mut cmd: Command,
        output: Arc<OutputBuffer>,
        command_line: String,
    ) {
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(job_id = %id, "failed to start {command_line:?}: {e}");
                self.finish(id, 1, 0);
                return;
            }
        };

        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        {
            let mut jobs = self.jobs();
            if let Some(job) = jobs.get_mut(&id) {
                job.pgid = pgid;
                job.state = JobState::Running;
            }
        }

        // Drain both pipes to EOF before reaping so every captured byte is
        // in the buffer when the state flips to Stopped.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::join!(
            pump(stdout, Arc::clone(&output)),
            pump(stderr, Arc::clone(&output)),
        );

        let (exit_code, signal) = match child.wait().await {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                match (status.code(), status.signal()) {
                    (code, Some(signal)) => (code.unwrap_or(-1), signal),
                    (Some(code), None) => (code, 0),
                    (None, None) => {
                        warn!(job_id = %id, "no exit status for {command_line:?}");
                        (1, 0)
                    }
                }
            }
            Err(e) => {
                warn!(job_id = %id, "failed to run {command_line:?}: {e}");
                (1, 0)
            }
        };

        info!(job_id = %id, exit_code, signal, "job stopped");
        self.finish(id, exit_code, signal);
    }

    /// Record the terminal state and close the output buffer, both under
    /// the table mutex, in that order. The terminal state is written at
    /// most once.
    fn finish(&self, id: JobId, exit_code: i32, signal: i32) {
        let mut jobs = self.jobs();
        if let Some(job) = jobs.get_mut(&id) {
            if !job.state.has_stopped() {
                job.state = JobState::Stopped { exit_code, signal };
                job.output.close();
            }
        }
    }
}

/// Resolve `id` for `client`. An unparsable id, an unknown id and a job
/// owned by someone else all collapse into [`SupervisorError::NotFound`] so
/// foreign jobs cannot be probed for existence.
fn find<'a>(
    jobs: &'a HashMap<JobId, Job>,
    client: &str,
    id: &str,
) -> Result<&'a Job, SupervisorError> {
    let id: JobId = id.parse().map_err(|_| SupervisorError::NotFound)?;
    match jobs.get(&id) {
        Some(job) if job.owner == client => Ok(job),
        _ => Err(SupervisorError::NotFound),
    }
}

/// Copy one pipe into the shared buffer until EOF.
async fn pump<R>(src: Option<R>, buf: Arc<OutputBuffer>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut src) = src else { return };
    let mut chunk = [0u8; 4096];
    loop {
        match src.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.write(&chunk[..n]).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("output pipe read failed: {e}");
                break;
            }
        }
    }
}
