//! Core building blocks for the jobd remote job worker.
//!
//! This crate holds everything shared between the daemon, the launcher and
//! the client:
//!
//! - [`outbuf`]: the fan-out output buffer (one writer, many readers)
//! - [`perms`]: the per-client permission table
//! - [`auth`]: mutual TLS configuration and peer identity extraction
//! - [`limits`]: resource limit defaults and the daemon/runner env contract
//! - [`cgroup`]: cgroup v1/v2 installation used by the launcher
//! - [`config`]: `jobd.toml` parsing
//! - [`wire`]: protocol messages and the length-prefixed frame codec

pub mod auth;
pub mod cgroup;
pub mod config;
pub mod limits;
pub mod outbuf;
pub mod perms;
pub mod wire;
