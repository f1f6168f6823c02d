//! jobd - remote job worker daemon.
//!
//! Listens on a mutually-authenticated TLS endpoint and runs arbitrary
//! commands for authorized clients, each in its own process group with
//! cgroup limits and a private PID namespace installed by the runner
//! binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use jobd_core::auth;
use jobd_core::config::Config;
use jobd_daemon::server;
use jobd_daemon::supervisor::Supervisor;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// jobd - remote job worker daemon
#[derive(Parser, Debug)]
#[command(name = "jobd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "jobd.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Path to the runner binary (overrides the config file)
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    auth::install_crypto_provider();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!("no config file at {:?}, using defaults", args.config);
        Config::default()
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(runner) = args.runner {
        config.server.runner = runner;
    }

    let supervisor = Supervisor::new(
        config.permission_table(),
        config.server.runner.clone(),
        config.limits,
    );

    let tls_config =
        auth::server_config(&config.server.cert, &config.server.key, &config.server.ca)
            .context("failed to build TLS configuration")?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_shutdown.cancel();
    });

    server::run(listener, acceptor, supervisor, shutdown).await?;
    info!("server stopped");
    Ok(())
}
