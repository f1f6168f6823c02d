//! Job identity and lifecycle state.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jobd_core::outbuf::OutputBuffer;
use nix::unistd::Pid;
use uuid::Uuid;

/// Opaque unique identifier for a job. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of one job.
///
/// Transitions are monotone: `NotStarted` → `Running` → `Stopped`, with a
/// failed launch jumping straight to `Stopped`. `Stopped` is terminal and
/// written exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Inserted into the table, launcher not yet spawned.
    NotStarted,

    /// The launcher spawned successfully and has not been reaped.
    Running,

    /// The job exited or was killed.
    Stopped {
        /// Exit code; `-1` when the job died from a signal.
        exit_code: i32,
        /// Terminating signal number, `0` when not signalled.
        signal: i32,
    },
}

impl JobState {
    /// Whether the job is currently running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the job reached its terminal state.
    #[must_use]
    pub const fn has_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Stopped { exit_code, signal } => {
                if *signal != 0 {
                    write!(f, "stopped (signal: {signal})")
                } else {
                    write!(f, "stopped (exit code: {exit_code})")
                }
            }
        }
    }
}

/// One entry in the job table.
#[derive(Debug)]
pub struct Job {
    /// Client identity that created the job; the only identity allowed to
    /// observe or affect it.
    pub owner: String,

    /// Current lifecycle state.
    pub state: JobState,

    /// Process-group id of the launcher, set once the spawn succeeds.
    /// Signals go to the whole group so forked descendants die too.
    pub pgid: Option<Pid>,

    /// Captured combined stdout + stderr.
    pub output: Arc<OutputBuffer>,
}

impl Job {
    /// Fresh record for `owner`, not yet launched.
    #[must_use]
    pub fn new(owner: impl Into<String>, output: Arc<OutputBuffer>) -> Self {
        Self {
            owner: owner.into(),
            state: JobState::NotStarted,
            pgid: None,
            output,
        }
    }
}
