//! jobd-runner - resource-limited launcher.
//!
//! The daemon never execs user commands directly; it spawns this helper,
//! which installs kernel-side constraints on *itself* so the user program
//! inherits them:
//!
//! 1. `start` mode unshares a PID namespace and re-execs this same binary
//!    in `cgr` mode. The re-exec'd child is PID 1 of the fresh namespace;
//!    the parent waits and propagates its exit code.
//! 2. `cgr` mode creates the per-job cgroup, enrolls itself, and execs the
//!    user command in place.
//!
//! Any failure before the exec exits non-zero, which the daemon records as
//! a normal job exit. Limits arrive from the daemon via `JOBD_MEMORY_MB`
//! and `JOBD_CPU_SHARES`, defaulting to the stock values when unset.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{self, Command};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobd_core::cgroup;
use jobd_core::limits::ResourceLimits;
use nix::sched::{unshare, CloneFlags};

/// jobd-runner - resource-limited job launcher
#[derive(Parser, Debug)]
#[command(name = "jobd-runner")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Enter a fresh PID namespace, then delegate to `cgr`.
    Start {
        /// Per-job cgroup directory name.
        tag: String,
        /// Program to run.
        path: String,
        /// Program arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Enroll in the per-job cgroup, then exec the program in place.
    Cgr {
        /// Per-job cgroup directory name.
        tag: String,
        /// Program to run.
        path: String,
        /// Program arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() {
    let args = Args::parse();
    let code = match args.mode {
        Mode::Start { tag, path, args } => match start(&tag, &path, &args) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("jobd-runner: {e:#}");
                1
            }
        },
        Mode::Cgr { tag, path, args } => match cgr(&tag, &path, &args) {
            // cgr only returns when something failed before or at the exec.
            Err(e) => {
                eprintln!("jobd-runner: {e:#}");
                1
            }
            Ok(()) => 0,
        },
    };
    process::exit(code);
}

/// Re-exec this binary in `cgr` mode inside a fresh PID namespace.
///
/// `unshare(CLONE_NEWPID)` affects children created afterwards, so the
/// re-exec'd process sees itself as PID 1. Its exit code is propagated.
fn start(tag: &str, path: &str, args: &[String]) -> Result<i32> {
    unshare(CloneFlags::CLONE_NEWPID).context("failed to unshare PID namespace")?;

    let status = Command::new("/proc/self/exe")
        .arg("cgr")
        .arg(tag)
        .arg(path)
        .args(args)
        .status()
        .context("failed to re-exec launcher")?;

    Ok(status.code().unwrap_or(1))
}

/// Install cgroup limits on this process, then exec the user command.
fn cgr(tag: &str, path: &str, args: &[String]) -> Result<()> {
    let limits = ResourceLimits::from_env();
    cgroup::install(
        Path::new(cgroup::DEFAULT_ROOT),
        tag,
        &limits,
        process::id(),
    )
    .context("failed to install cgroup limits")?;

    // Replaces the process image; only returns on failure.
    let err = Command::new(path).args(args).exec();
    Err(err).with_context(|| format!("failed to exec {path:?}"))
}
