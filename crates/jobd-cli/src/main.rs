//! jobctl - command-line client for the jobd daemon.
//!
//! Four subcommands mapping 1:1 to the daemon's operations. TLS material
//! comes from flags or the `CLIENT_CERT`/`CLIENT_KEY`/`CA_CERT`
//! environment variables. Exits 0 on success, 1 on any error with the
//! message on stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use jobd_core::auth;
use jobd_core::wire::{self, FrameCodec, JobRef, ProcStatus, StartRequest};
use prost::Message;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// jobctl - jobd client
#[derive(Parser, Debug)]
#[command(name = "jobctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "localhost:12345")]
    addr: String,

    /// Client certificate filepath
    #[arg(long = "cln.crt", env = "CLIENT_CERT", value_name = "PATH")]
    client_cert: PathBuf,

    /// Client key filepath
    #[arg(long = "cln.key", env = "CLIENT_KEY", value_name = "PATH")]
    client_key: PathBuf,

    /// CA certificate path
    #[arg(long = "ca.crt", env = "CA_CERT", value_name = "PATH")]
    ca_cert: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a command on the worker
    Start {
        /// Program path or name
        path: String,
        /// Program arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Kill a running job
    Stop {
        /// Job id returned by `start`
        id: String,
    },

    /// Show a job's status
    Status {
        /// Job id returned by `start`
        id: String,
    },

    /// Stream a job's combined output
    Stream {
        /// Job id returned by `start`
        id: String,
    },
}

type Connection = Framed<TlsStream<TcpStream>, FrameCodec>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    auth::install_crypto_provider();

    let mut conn = connect(&cli).await?;
    match cli.command {
        Commands::Start { path, args } => {
            let request = wire::Request {
                op: Some(wire::request::Op::Start(StartRequest { path, args })),
            };
            match call(&mut conn, request).await? {
                wire::response::Body::Started(job) => println!("Process UID: {}", job.id),
                other => bail!("unexpected response: {other:?}"),
            }
        }
        Commands::Stop { id } => {
            let request = wire::Request {
                op: Some(wire::request::Op::Stop(JobRef { id })),
            };
            match call(&mut conn, request).await? {
                wire::response::Body::Stopped(_) => println!("Done"),
                other => bail!("unexpected response: {other:?}"),
            }
        }
        Commands::Status { id } => {
            let request = wire::Request {
                op: Some(wire::request::Op::Status(JobRef { id })),
            };
            match call(&mut conn, request).await? {
                wire::response::Body::Status(status) => print_status(&status),
                other => bail!("unexpected response: {other:?}"),
            }
        }
        Commands::Stream { id } => {
            let request = wire::Request {
                op: Some(wire::request::Op::Stream(JobRef { id })),
            };
            stream_output(&mut conn, request).await?;
        }
    }

    Ok(())
}

/// Open the mutually-authenticated connection.
async fn connect(cli: &Cli) -> Result<Connection> {
    let tls_config = auth::client_config(&cli.client_cert, &cli.client_key, &cli.ca_cert)
        .context("failed to build TLS configuration")?;
    let connector = TlsConnector::from(Arc::new(tls_config));

    let host = cli.addr.split(':').next().unwrap_or("localhost");
    let server_name =
        ServerName::try_from(host.to_string()).context("invalid server host name")?;

    let tcp = TcpStream::connect(&cli.addr)
        .await
        .with_context(|| format!("failed to connect to {}", cli.addr))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .context("TLS handshake failed")?;

    Ok(Framed::new(tls, FrameCodec::new()))
}

/// Send one request and decode the single response to a unary operation.
async fn call(conn: &mut Connection, request: wire::Request) -> Result<wire::response::Body> {
    conn.send(Bytes::from(request.encode_to_vec())).await?;
    let frame = conn
        .next()
        .await
        .context("connection closed by server")??;
    let response = wire::Response::decode(frame.as_ref())?;
    match response.body {
        Some(wire::response::Body::Error(e)) => bail!("{}", e.message),
        Some(body) => Ok(body),
        None => bail!("empty response from server"),
    }
}

/// Send a stream request and copy output frames to stdout until `end`.
async fn stream_output(conn: &mut Connection, request: wire::Request) -> Result<()> {
    conn.send(Bytes::from(request.encode_to_vec())).await?;

    let mut stdout = std::io::stdout();
    loop {
        let Some(frame) = conn.next().await else {
            bail!("connection closed by server");
        };
        let response = wire::Response::decode(frame?.as_ref())?;
        match response.body {
            Some(wire::response::Body::Data(chunk)) => {
                stdout.write_all(&chunk.data)?;
                stdout.flush()?;
            }
            Some(wire::response::Body::End(_)) => return Ok(()),
            Some(wire::response::Body::Error(e)) => bail!("{}", e.message),
            other => bail!("unexpected response: {other:?}"),
        }
    }
}

fn print_status(status: &wire::StatusReply) {
    let proc_status =
        ProcStatus::try_from(status.proc_status).unwrap_or(ProcStatus::NotStarted);
    println!("Process status: {proc_status}");
    if proc_status == ProcStatus::Stopped {
        println!("Exit code: {}", status.exit_code);
        if status.signal != 0 {
            println!("Signal: {}", status.signal);
        }
    }
}
