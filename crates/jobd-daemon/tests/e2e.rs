//! End-to-end tests over the real mTLS endpoint.
//!
//! Each test mints its own throwaway PKI, serves on an ephemeral port and
//! drives the wire protocol the way the client binary does.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{
    call, collect_stream, connect, error_body, open_stream, start_request, start_server,
    started_id, status_body, status_request, stop_request, stream_request, test_supervisor,
    wait_running, wait_stopped, TestPki,
};
use futures::{SinkExt, StreamExt};
use jobd_core::wire::{self, ErrorCode, ProcStatus};
use prost::Message;
use tokio::time::timeout;

#[tokio::test]
async fn sync_echo_round_trip() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(call(&mut conn, start_request("echo", &["HelloWorld"])).await);

    let status = wait_stopped(&mut conn, &id).await;
    assert_eq!(status.exit_code, 0);
    assert_eq!(status.signal, 0);

    let mut stream_conn = connect(&pki, addr, "client1").await;
    open_stream(&mut stream_conn, &id).await;
    assert_eq!(collect_stream(&mut stream_conn).await, b"HelloWorld\n");
}

#[tokio::test]
async fn kill_terminates_stream_and_reports_the_signal() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(
        call(
            &mut conn,
            start_request("/bin/sh", &["-c", "while :; do echo tick; sleep 1; done"]),
        )
        .await,
    );
    wait_running(&mut conn, &id).await;

    // Open the stream and prove it is live before the kill.
    let mut stream_conn = connect(&pki, addr, "client1").await;
    open_stream(&mut stream_conn, &id).await;
    let first = timeout(Duration::from_secs(5), stream_conn.next())
        .await
        .expect("no output before kill")
        .unwrap()
        .unwrap();
    let first = wire::Response::decode(first.as_ref()).unwrap();
    assert!(matches!(first.body, Some(wire::response::Body::Data(_))));

    match call(&mut conn, stop_request(&id)).await.body {
        Some(wire::response::Body::Stopped(_)) => {}
        other => panic!("unexpected stop response: {other:?}"),
    }

    // The stream must terminate cleanly within five seconds of the kill.
    let rest = timeout(Duration::from_secs(5), collect_stream(&mut stream_conn))
        .await
        .expect("stream did not terminate after stop");
    assert!(rest.is_empty() || rest.ends_with(b"tick\n"));

    let status = wait_stopped(&mut conn, &id).await;
    assert_eq!(status.exit_code, -1);
    assert_eq!(status.signal, 9);
}

#[tokio::test]
async fn cross_tenant_jobs_are_invisible() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut owner = connect(&pki, addr, "client2").await;
    let id = started_id(call(&mut owner, start_request("sleep", &["60"])).await);

    let mut intruder = connect(&pki, addr, "client1").await;
    let status_err = error_body(call(&mut intruder, status_request(&id)).await);
    assert_eq!(status_err.code, ErrorCode::NotFound as i32);
    let stop_err = error_body(call(&mut intruder, stop_request(&id)).await);
    assert_eq!(stop_err.code, ErrorCode::NotFound as i32);
    let stream_err = error_body(call(&mut intruder, stream_request(&id)).await);
    assert_eq!(stream_err.code, ErrorCode::NotFound as i32);

    // The owner still controls the job.
    match call(&mut owner, stop_request(&id)).await.body {
        Some(wire::response::Body::Stopped(_)) => {}
        other => panic!("unexpected stop response: {other:?}"),
    }
}

#[tokio::test]
async fn permission_gating_is_independent_of_the_job() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    // client2 owns the job but holds no status grant.
    let mut owner = connect(&pki, addr, "client2").await;
    let id = started_id(call(&mut owner, start_request("sleep", &["60"])).await);
    let err = error_body(call(&mut owner, status_request(&id)).await);
    assert_eq!(err.code, ErrorCode::PermissionDenied as i32);

    // An authenticated but unknown client can do nothing.
    let mut unknown = connect(&pki, addr, "client3").await;
    let err = error_body(call(&mut unknown, start_request("echo", &["hi"])).await);
    assert_eq!(err.code, ErrorCode::PermissionDenied as i32);

    // A certificate without a CN authenticates as nobody.
    let mut anonymous = connect(&pki, addr, "nocn").await;
    let err = error_body(call(&mut anonymous, start_request("echo", &["hi"])).await);
    assert_eq!(err.code, ErrorCode::PermissionDenied as i32);

    call(&mut owner, stop_request(&id)).await;
}

#[tokio::test]
async fn empty_path_is_a_bad_argument() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let err = error_body(call(&mut conn, start_request("", &[])).await);
    assert_eq!(err.code, ErrorCode::BadArgument as i32);
}

#[tokio::test]
async fn late_subscriber_replays_everything_then_ends() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(
        call(
            &mut conn,
            start_request("/bin/sh", &["-c", "printf A; printf B; printf C"]),
        )
        .await,
    );
    wait_stopped(&mut conn, &id).await;

    let mut stream_conn = connect(&pki, addr, "client1").await;
    open_stream(&mut stream_conn, &id).await;
    assert_eq!(collect_stream(&mut stream_conn).await, b"ABC");
}

#[tokio::test]
async fn two_streams_observe_identical_bytes() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(
        call(
            &mut conn,
            start_request("/bin/sh", &["-c", "while :; do echo tick; sleep 1; done"]),
        )
        .await,
    );
    wait_running(&mut conn, &id).await;

    let mut first = connect(&pki, addr, "client1").await;
    open_stream(&mut first, &id).await;
    let mut second = connect(&pki, addr, "client1").await;
    open_stream(&mut second, &id).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    call(&mut conn, stop_request(&id)).await;

    let (a, b) = tokio::join!(
        timeout(Duration::from_secs(5), collect_stream(&mut first)),
        timeout(Duration::from_secs(5), collect_stream(&mut second)),
    );
    let a = a.expect("first stream did not end");
    let b = b.expect("second stream did not end");
    assert_eq!(a, b);
}

#[tokio::test]
async fn inbound_frame_cancels_an_active_stream() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(
        call(
            &mut conn,
            start_request("/bin/sh", &["-c", "while :; do echo tick; sleep 1; done"]),
        )
        .await,
    );
    wait_running(&mut conn, &id).await;

    let mut stream_conn = connect(&pki, addr, "client1").await;
    open_stream(&mut stream_conn, &id).await;
    let first = timeout(Duration::from_secs(5), stream_conn.next())
        .await
        .expect("no output before cancel")
        .unwrap()
        .unwrap();
    let first = wire::Response::decode(first.as_ref()).unwrap();
    assert!(matches!(first.body, Some(wire::response::Body::Data(_))));

    // Any further frame on a streaming connection is the cancellation
    // signal; it is consumed without a reply.
    stream_conn
        .send(Bytes::from(status_request(&id).encode_to_vec()))
        .await
        .unwrap();

    // The pump must hand the connection back to the request loop: a
    // follow-up request is answered normally. Data frames the pump had
    // already queued before seeing the cancel may still arrive first,
    // but no `end` frame does.
    stream_conn
        .send(Bytes::from(status_request(&id).encode_to_vec()))
        .await
        .unwrap();
    let status = timeout(Duration::from_secs(5), async {
        loop {
            let frame = stream_conn
                .next()
                .await
                .expect("server closed early")
                .unwrap();
            let response = wire::Response::decode(frame.as_ref()).unwrap();
            match response.body {
                Some(wire::response::Body::Data(_)) => {}
                Some(wire::response::Body::Status(status)) => return status,
                other => panic!("unexpected frame after cancel: {other:?}"),
            }
        }
    })
    .await
    .expect("stream was not cancelled");
    assert_eq!(status.proc_status, ProcStatus::Running as i32);

    call(&mut conn, stop_request(&id)).await;
}

#[tokio::test]
async fn dropped_stream_connection_does_not_disturb_the_job() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(
        call(
            &mut conn,
            start_request("/bin/sh", &["-c", "while :; do echo tick; sleep 1; done"]),
        )
        .await,
    );
    wait_running(&mut conn, &id).await;

    // Subscriber connects, sees live output, then goes away mid-stream.
    let mut stream_conn = connect(&pki, addr, "client1").await;
    open_stream(&mut stream_conn, &id).await;
    let first = timeout(Duration::from_secs(5), stream_conn.next())
        .await
        .expect("no output before disconnect")
        .unwrap()
        .unwrap();
    let first = wire::Response::decode(first.as_ref()).unwrap();
    assert!(matches!(first.body, Some(wire::response::Body::Data(_))));
    drop(stream_conn);

    // The server keeps serving and the job is untouched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = status_body(call(&mut conn, status_request(&id)).await);
    assert_eq!(status.proc_status, ProcStatus::Running as i32);

    let mut late = connect(&pki, addr, "client1").await;
    open_stream(&mut late, &id).await;
    let replay = timeout(Duration::from_secs(5), late.next())
        .await
        .expect("no output for a fresh subscriber")
        .unwrap()
        .unwrap();
    let replay = wire::Response::decode(replay.as_ref()).unwrap();
    assert!(matches!(replay.body, Some(wire::response::Body::Data(_))));

    call(&mut conn, stop_request(&id)).await;
}

#[tokio::test]
async fn malformed_frames_get_a_structured_error() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    conn.send(Bytes::from_static(&[0x0c, 0xff, 0xff]))
        .await
        .unwrap();
    let frame = conn.next().await.unwrap().unwrap();
    let response = wire::Response::decode(frame.as_ref()).unwrap();
    let err = error_body(response);
    assert_eq!(err.code, ErrorCode::BadArgument as i32);

    // The connection survives and still serves real requests.
    let id = started_id(call(&mut conn, start_request("echo", &["ok"])).await);
    wait_stopped(&mut conn, &id).await;
}

#[tokio::test]
async fn shutdown_ends_streams_and_spares_jobs() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, shutdown) = start_server(&pki, Arc::clone(&sup)).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(
        call(
            &mut conn,
            start_request("/bin/sh", &["-c", "echo ready; exec sleep 60"]),
        )
        .await,
    );
    wait_running(&mut conn, &id).await;

    // Sync on the first output frame so the pump is live before the
    // shutdown fires.
    let mut stream_conn = connect(&pki, addr, "client1").await;
    open_stream(&mut stream_conn, &id).await;
    let first = timeout(Duration::from_secs(5), stream_conn.next())
        .await
        .expect("no output before shutdown")
        .unwrap()
        .unwrap();
    let first = wire::Response::decode(first.as_ref()).unwrap();
    assert!(matches!(first.body, Some(wire::response::Body::Data(_))));

    shutdown.cancel();

    // The open stream terminates with a clean end frame.
    let collected = timeout(Duration::from_secs(5), collect_stream(&mut stream_conn))
        .await
        .expect("stream did not end on shutdown");
    assert!(collected.is_empty());

    // The job is left running; only the RPC surface went away.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sup.status("client1", &id).unwrap().is_running());

    sup.stop("client1", &id).unwrap();
}

#[tokio::test]
async fn status_immediately_after_start_is_well_formed() {
    let pki = TestPki::new();
    let sup = test_supervisor(pki.dir.path());
    let (addr, _shutdown) = start_server(&pki, sup).await;

    let mut conn = connect(&pki, addr, "client1").await;
    let id = started_id(call(&mut conn, start_request("echo", &["hi"])).await);

    // NotStarted or Running are both legal this early; a Stopped snapshot
    // only appears once the reap has actually happened.
    let status = status_body(call(&mut conn, status_request(&id)).await);
    assert!(ProcStatus::try_from(status.proc_status).is_ok());
    wait_stopped(&mut conn, &id).await;
}
