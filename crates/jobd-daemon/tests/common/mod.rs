//! Shared fixtures: a throwaway PKI, a fake runner, and a minimal wire
//! client.

// Each integration test binary compiles this module and uses a subset.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use jobd_core::auth;
use jobd_core::limits::ResourceLimits;
use jobd_core::perms::PermissionTable;
use jobd_core::wire::{self, FrameCodec, JobRef, ProcStatus, StartRequest};
use jobd_daemon::supervisor::Supervisor;
use jobd_daemon::server;
use prost::Message;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub type Connection = Framed<TlsStream<TcpStream>, FrameCodec>;

/// Certificates for one server and a handful of clients, written as PEM
/// files under a temp dir the way a deployment would lay them out.
pub struct TestPki {
    pub dir: TempDir,
}

impl TestPki {
    /// Mint a CA, a `localhost` server certificate, and client
    /// certificates for `client1`, `client2`, `client3` plus one with no
    /// CN at all.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "jobd test ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.path().join("ca.crt"), ca_cert.pem()).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params =
            CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();
        std::fs::write(dir.path().join("server.crt"), server_cert.pem()).unwrap();
        std::fs::write(dir.path().join("server.key"), server_key.serialize_pem()).unwrap();

        for cn in ["client1", "client2", "client3"] {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name.push(DnType::CommonName, cn);
            let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();
            std::fs::write(dir.path().join(format!("{cn}.crt")), cert.pem()).unwrap();
            std::fs::write(dir.path().join(format!("{cn}.key")), key.serialize_pem()).unwrap();
        }

        // A certificate that verifies but names nobody.
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();
        std::fs::write(dir.path().join("nocn.crt"), cert.pem()).unwrap();
        std::fs::write(dir.path().join("nocn.key"), key.serialize_pem()).unwrap();

        Self { dir }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Write a stand-in for the runner binary: a shell shim that drops the
/// `start <tag>` prefix and execs the payload directly. Lifecycle,
/// process-group and output behaviour match the real launcher without
/// needing root or cgroupfs.
pub fn write_runner_shim(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("runner-shim.sh");
    std::fs::write(&path, "#!/bin/sh\nshift 2\nexec \"$@\"\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Supervisor wired to the shim runner and the reference permission
/// matrix.
pub fn test_supervisor(shim_dir: &Path) -> Arc<Supervisor> {
    Supervisor::new(
        PermissionTable::reference(),
        write_runner_shim(shim_dir),
        ResourceLimits::default(),
    )
}

/// Bind an ephemeral port and serve `supervisor` behind mTLS. Returns the
/// bound address and the shutdown token.
pub async fn start_server(
    pki: &TestPki,
    supervisor: Arc<Supervisor>,
) -> (std::net::SocketAddr, CancellationToken) {
    auth::install_crypto_provider();

    let tls_config = auth::server_config(
        &pki.path("server.crt"),
        &pki.path("server.key"),
        &pki.path("ca.crt"),
    )
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server::run(listener, acceptor, supervisor, server_shutdown)
            .await
            .unwrap();
    });

    (addr, shutdown)
}

/// Connect to `addr` presenting the named client certificate.
pub async fn connect(
    pki: &TestPki,
    addr: std::net::SocketAddr,
    client: &str,
) -> Connection {
    let tls_config = auth::client_config(
        &pki.path(&format!("{client}.crt")),
        &pki.path(&format!("{client}.key")),
        &pki.path("ca.crt"),
    )
    .unwrap();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = ServerName::try_from("localhost".to_string()).unwrap();
    let tls = connector.connect(server_name, tcp).await.unwrap();
    Framed::new(tls, FrameCodec::new())
}

/// Send one request and read one response frame.
pub async fn call(conn: &mut Connection, request: wire::Request) -> wire::Response {
    conn.send(Bytes::from(request.encode_to_vec()))
        .await
        .unwrap();
    let frame = conn.next().await.expect("server closed early").unwrap();
    wire::Response::decode(frame.as_ref()).unwrap()
}

pub fn start_request(path: &str, args: &[&str]) -> wire::Request {
    wire::Request {
        op: Some(wire::request::Op::Start(StartRequest {
            path: path.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
        })),
    }
}

pub fn stop_request(id: &str) -> wire::Request {
    wire::Request {
        op: Some(wire::request::Op::Stop(JobRef { id: id.to_string() })),
    }
}

pub fn status_request(id: &str) -> wire::Request {
    wire::Request {
        op: Some(wire::request::Op::Status(JobRef { id: id.to_string() })),
    }
}

pub fn stream_request(id: &str) -> wire::Request {
    wire::Request {
        op: Some(wire::request::Op::Stream(JobRef { id: id.to_string() })),
    }
}

/// Unwrap a `started` response into the job id.
pub fn started_id(response: wire::Response) -> String {
    match response.body {
        Some(wire::response::Body::Started(job)) => job.id,
        other => panic!("expected started, got {other:?}"),
    }
}

/// Unwrap a `status` response.
pub fn status_body(response: wire::Response) -> wire::StatusReply {
    match response.body {
        Some(wire::response::Body::Status(status)) => status,
        other => panic!("expected status, got {other:?}"),
    }
}

/// Unwrap an `error` response.
pub fn error_body(response: wire::Response) -> wire::ErrorReply {
    match response.body {
        Some(wire::response::Body::Error(error)) => error,
        other => panic!("expected error, got {other:?}"),
    }
}

/// Poll `status` over `conn` until the job reports `Stopped`.
pub async fn wait_stopped(conn: &mut Connection, id: &str) -> wire::StatusReply {
    for _ in 0..200 {
        let status = status_body(call(conn, status_request(id)).await);
        if status.proc_status == ProcStatus::Stopped as i32 {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} did not stop in time");
}

/// Poll `status` over `conn` until the job reports `Running`.
pub async fn wait_running(conn: &mut Connection, id: &str) {
    for _ in 0..200 {
        let status = status_body(call(conn, status_request(id)).await);
        if status.proc_status == ProcStatus::Running as i32 {
            return;
        }
        assert_ne!(
            status.proc_status,
            ProcStatus::Stopped as i32,
            "job {id} stopped before it was seen running"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {id} did not start in time");
}

/// Send a `stream` request without waiting for the first frame.
pub async fn open_stream(conn: &mut Connection, id: &str) {
    conn.send(Bytes::from(stream_request(id).encode_to_vec()))
        .await
        .unwrap();
}

/// Read stream frames until `end`, returning the concatenated bytes.
pub async fn collect_stream(conn: &mut Connection) -> Vec<u8> {
    let mut collected = Vec::new();
    loop {
        let frame = conn.next().await.expect("server closed early").unwrap();
        let response = wire::Response::decode(frame.as_ref()).unwrap();
        match response.body {
            Some(wire::response::Body::Data(chunk)) => collected.extend(chunk.data),
            Some(wire::response::Body::End(_)) => return collected,
            other => panic!("unexpected stream frame: {other:?}"),
        }
    }
}
