//! jobd daemon library.
//!
//! The daemon supervises jobs started over the mTLS RPC endpoint:
//!
//! - [`supervisor`]: job table, launch via the runner binary, signal
//!   delivery and reap bookkeeping
//! - [`server`]: TCP accept loop with graceful shutdown
//! - [`conn`]: per-connection request dispatch and the stream pump
//!
//! TLS configuration and identity extraction live in [`jobd_core::auth`],
//! shared with the client.

pub mod conn;
pub mod server;
pub mod supervisor;
