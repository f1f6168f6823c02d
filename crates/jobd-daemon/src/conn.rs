//! Per-connection request handling.
//!
//! Each accepted connection runs one of these handlers. The client identity
//! is captured once from the verified certificate chain; every request on
//! the connection is authorized as that identity. Requests are processed
//! one at a time: unary operations answer with a single response, `stream`
//! turns the connection over to the pump until end-of-stream, client
//! cancellation, or daemon shutdown.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use jobd_core::auth;
use jobd_core::outbuf::OutputReader;
use jobd_core::wire::{
    self, Ack, ErrorCode, ErrorReply, FrameCodec, JobRef, LogData, ProcStatus, StatusReply,
    WireError,
};
use prost::Message;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::supervisor::{JobState, Supervisor, SupervisorError};

/// Read size for the stream pump.
const STREAM_CHUNK: usize = 512;

type TlsFramed = Framed<TlsStream<TcpStream>, FrameCodec>;
type Sink = SplitSink<TlsFramed, Bytes>;
type Stream = SplitStream<TlsFramed>;

/// Serve one authenticated connection until the peer disconnects or the
/// daemon shuts down.
///
/// # Errors
///
/// Transport-level failures only; protocol-level problems are answered
/// with structured [`ErrorReply`] frames.
pub async fn handle_connection(
    stream: TlsStream<TcpStream>,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) -> Result<(), WireError> {
    let client = {
        let (_, session) = stream.get_ref();
        session
            .peer_certificates()
            .and_then(auth::peer_common_name)
            .unwrap_or_default()
    };
    debug!(client = %client, "connection established");

    let (mut sink, mut inbound) = Framed::new(stream, FrameCodec::new()).split();

    loop {
        let frame = tokio::select! {
            frame = inbound.next() => match frame {
                Some(frame) => frame?,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };

        let request = match wire::Request::decode(frame.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                debug!(client = %client, "malformed request: {e}");
                send_error(&mut sink, ErrorCode::BadArgument, "malformed request").await?;
                continue;
            }
        };

        match request.op {
            None => {
                send_error(&mut sink, ErrorCode::BadArgument, "empty request").await?;
            }
            Some(wire::request::Op::Start(req)) => {
                info!(client = %client, path = %req.path, "StartProcess");
                let body = match supervisor.start(&client, &req.path, &req.args) {
                    Ok(id) => wire::response::Body::Started(JobRef { id: id.to_string() }),
                    Err(e) => error_body(&e),
                };
                send(&mut sink, body).await?;
            }
            Some(wire::request::Op::Stop(req)) => {
                info!(client = %client, job_id = %req.id, "StopProcess");
                let body = match supervisor.stop(&client, &req.id) {
                    Ok(()) => wire::response::Body::Stopped(Ack {}),
                    Err(e) => error_body(&e),
                };
                send(&mut sink, body).await?;
            }
            Some(wire::request::Op::Status(req)) => {
                info!(client = %client, job_id = %req.id, "GetProcessStatus");
                let body = match supervisor.status(&client, &req.id) {
                    Ok(state) => wire::response::Body::Status(status_reply(state)),
                    Err(e) => error_body(&e),
                };
                send(&mut sink, body).await?;
            }
            Some(wire::request::Op::Stream(req)) => {
                info!(client = %client, job_id = %req.id, "StreamOutput");
                match supervisor.subscribe(&client, &req.id) {
                    Ok(reader) => {
                        pump_stream(&mut sink, &mut inbound, reader, &shutdown).await?;
                    }
                    Err(e) => send(&mut sink, error_body(&e)).await?,
                }
            }
        }
    }

    debug!(client = %client, "connection closed");
    Ok(())
}

/// Forward buffer contents to the client until end-of-stream, client
/// cancellation, or daemon shutdown.
///
/// Cancellation is any inbound frame, or the client closing its half of
/// the connection; the pump simply stops without an error. End-of-stream
/// and shutdown are answered with a clean `end` frame.
async fn pump_stream(
    sink: &mut Sink,
    inbound: &mut Stream,
    mut reader: OutputReader,
    shutdown: &CancellationToken,
) -> Result<(), WireError> {
    let mut chunk = [0u8; STREAM_CHUNK];
    loop {
        tokio::select! {
            n = reader.read(&mut chunk) => {
                if n == 0 {
                    send(sink, wire::response::Body::End(Ack {})).await?;
                    return Ok(());
                }
                let data = LogData { data: chunk[..n].to_vec() };
                send(sink, wire::response::Body::Data(data)).await?;
            }
            frame = inbound.next() => {
                debug!(cancelled = frame.is_some(), "stream cancelled by client");
                return Ok(());
            }
            () = shutdown.cancelled() => {
                send(sink, wire::response::Body::End(Ack {})).await?;
                return Ok(());
            }
        }
    }
}

async fn send(sink: &mut Sink, body: wire::response::Body) -> Result<(), WireError> {
    let response = wire::Response { body: Some(body) };
    sink.send(Bytes::from(response.encode_to_vec())).await
}

async fn send_error(sink: &mut Sink, code: ErrorCode, message: &str) -> Result<(), WireError> {
    send(
        sink,
        wire::response::Body::Error(ErrorReply {
            code: code as i32,
            message: message.to_string(),
        }),
    )
    .await
}

fn error_body(err: &SupervisorError) -> wire::response::Body {
    let code = match err {
        SupervisorError::EmptyPath => ErrorCode::BadArgument,
        SupervisorError::PermissionDenied => ErrorCode::PermissionDenied,
        SupervisorError::NotFound => ErrorCode::NotFound,
        SupervisorError::Signal(_) => ErrorCode::Internal,
    };
    wire::response::Body::Error(ErrorReply {
        code: code as i32,
        message: err.to_string(),
    })
}

fn status_reply(state: JobState) -> StatusReply {
    match state {
        JobState::NotStarted => StatusReply {
            proc_status: ProcStatus::NotStarted as i32,
            exit_code: 0,
            signal: 0,
        },
        JobState::Running => StatusReply {
            proc_status: ProcStatus::Running as i32,
            exit_code: 0,
            signal: 0,
        },
        JobState::Stopped { exit_code, signal } => StatusReply {
            proc_status: ProcStatus::Stopped as i32,
            exit_code,
            signal,
        },
    }
}
