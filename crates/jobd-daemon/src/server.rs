//! TCP accept loop with graceful shutdown.
//!
//! Connections are TLS-accepted and handled on their own tasks. Cancelling
//! the shutdown token stops the accept loop; in-flight connections are then
//! drained (active streams end cleanly via the same token). Running jobs
//! are left alive across a shutdown and reparent to init rather than being
//! killed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::conn;
use crate::supervisor::Supervisor;

/// How long a peer may take to complete the TLS handshake.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept and serve connections until `shutdown` is cancelled, then drain
/// in-flight connections.
///
/// # Errors
///
/// Returns an error only for listener-level failures; per-connection
/// failures (handshake included) are logged and close that connection.
pub async fn run(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr().context("listener has no address")?;
    info!("listening on {local_addr}");

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("failed to accept connection: {e}");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let supervisor = Arc::clone(&supervisor);
                let shutdown = shutdown.clone();
                tracker.spawn(async move {
                    let tls_stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => tls_stream,
                        Ok(Err(e)) => {
                            debug!(peer = %peer, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            debug!(peer = %peer, "TLS handshake timed out");
                            return;
                        }
                    };
                    if let Err(e) = conn::handle_connection(tls_stream, supervisor, shutdown).await {
                        debug!(peer = %peer, "connection error: {e}");
                    }
                });
            }
            () = shutdown.cancelled() => break,
        }
    }

    info!("shutting down, draining in-flight connections");
    tracker.close();
    tracker.wait().await;
    info!("all connections drained");
    Ok(())
}
