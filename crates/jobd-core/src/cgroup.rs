//! Cgroup installation for the launcher.
//!
//! The launcher enrolls *itself* into a per-job cgroup before exec'ing the
//! user program, so the limits are inherited by everything the job forks.
//! Both hierarchy layouts are supported: v1 with split `memory` and `cpu`
//! controllers, and the unified v2 tree. The hierarchy is detected at the
//! configured root, which also makes the module testable against a
//! temporary directory.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::limits::ResourceLimits;

/// Where the kernel mounts the cgroup filesystem.
pub const DEFAULT_ROOT: &str = "/sys/fs/cgroup";

/// Errors raised while installing cgroup limits.
#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    /// Creating a cgroup directory failed.
    #[error("failed to create cgroup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Writing a controller file failed.
    #[error("failed to write {path}: {source}")]
    WriteControl {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Which cgroup layout is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hierarchy {
    /// Split per-controller trees (`memory/`, `cpu/`).
    V1,
    /// Unified tree (`cgroup.controllers` present at the root).
    V2,
}

/// Detect the mounted hierarchy at `root`.
#[must_use]
pub fn detect_hierarchy(root: &Path) -> Hierarchy {
    if root.join("cgroup.controllers").exists() {
        Hierarchy::V2
    } else {
        Hierarchy::V1
    }
}

/// Convert v1 `cpu.shares` to a v2 `cpu.weight`.
///
/// Kernel-documented mapping: shares in [2, 262144] onto weight in
/// [1, 10000].
#[must_use]
pub const fn cpu_shares_to_weight(shares: u64) -> u64 {
    1 + ((shares.saturating_sub(2)) * 9999) / 262142
}

/// Create the per-job cgroup(s) under `root`, apply `limits`, and enroll
/// `pid`.
///
/// `tag` is the per-job directory name (`worker-<uuid>`). Directories are
/// created with mode 0755; controller values are written in decimal text
/// form.
///
/// # Errors
///
/// Any failure is fatal to the launch: the caller exits non-zero before the
/// user program runs.
pub fn install(
    root: &Path,
    tag: &str,
    limits: &ResourceLimits,
    pid: u32,
) -> Result<(), CgroupError> {
    match detect_hierarchy(root) {
        Hierarchy::V1 => install_v1(root, tag, limits, pid),
        Hierarchy::V2 => install_v2(root, tag, limits, pid),
    }
}

fn install_v1(
    root: &Path,
    tag: &str,
    limits: &ResourceLimits,
    pid: u32,
) -> Result<(), CgroupError> {
    let memory = root.join("memory").join(tag);
    let cpu = root.join("cpu").join(tag);

    create_dir(&memory)?;
    create_dir(&cpu)?;

    write_control(&memory.join("memory.limit_in_bytes"), limits.memory_bytes())?;
    write_control(&cpu.join("cpu.shares"), limits.cpu_shares)?;

    write_control(&memory.join("cgroup.procs"), pid)?;
    write_control(&cpu.join("cgroup.procs"), pid)?;

    Ok(())
}

fn install_v2(
    root: &Path,
    tag: &str,
    limits: &ResourceLimits,
    pid: u32,
) -> Result<(), CgroupError> {
    let dir = root.join(tag);
    create_dir(&dir)?;

    write_control(&dir.join("memory.max"), limits.memory_bytes())?;
    write_control(&dir.join("cpu.weight"), cpu_shares_to_weight(limits.cpu_shares))?;
    write_control(&dir.join("cgroup.procs"), pid)?;

    Ok(())
}

fn create_dir(path: &Path) -> Result<(), CgroupError> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|source| CgroupError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

fn write_control(path: &Path, value: impl ToString) -> Result<(), CgroupError> {
    std::fs::write(path, value.to_string()).map_err(|source| CgroupError::WriteControl {
        path: path.to_path_buf(),
        source,
    })
}
