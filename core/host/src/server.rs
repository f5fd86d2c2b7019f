//! Socket server: one JSON request per connection, newline terminated.
//!
//! Every request gets exactly one response line. `subscribe` is the only
//! method that keeps the connection: the stream is handed to the
//! notification hub, which writes the ok response as it registers it.

use chrono::{DateTime, Utc};
use moped_protocol::{
    parse_files, parse_notification, parse_subscribe, ErrorInfo, HealthInfo, Method, Request,
    Response, APP_IDENTIFIER, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coordinator::WaitCoordinator;
use crate::documents::DocumentRegistry;
use crate::hub::NotificationHub;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

pub struct HostContext {
    pub hub: Arc<NotificationHub>,
    pub documents: Arc<DocumentRegistry>,
    pub coordinator: Arc<WaitCoordinator>,
    pub started_at: DateTime<Utc>,
}

enum Reply {
    Respond(Response),
    Stream(Response, Vec<String>),
}

pub fn serve(listener: UnixListener, context: Arc<HostContext>) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let context = Arc::clone(&context);
                thread::spawn(move || handle_connection(stream, context));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept connection");
            }
        }
    }
}

pub fn handle_connection(mut stream: UnixStream, context: Arc<HostContext>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let _ = write_response(&mut stream, Response::error_with_info(None, err));
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Request received");
    match handle_request(request, &context) {
        Reply::Respond(response) => {
            let _ = write_response(&mut stream, response);
        }
        Reply::Stream(response, names) => {
            let ack = match encode_line(&response) {
                Ok(ack) => ack,
                Err(err) => {
                    warn!(error = %err, "Failed to encode subscribe acknowledgment");
                    return;
                }
            };
            let _ = stream.set_read_timeout(None);
            if let Err(err) = context.hub.subscribe(names, stream, &ack) {
                debug!(error = %err, "Subscriber went away before acknowledgment");
            }
        }
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, context: &HostContext) -> Reply {
    if request.protocol_version != PROTOCOL_VERSION {
        return Reply::Respond(Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        ));
    }

    let id = request.id;
    let params = request.params;
    match request.method {
        Method::GetHealth => Reply::Respond(health(id, context)),
        Method::Post => Reply::Respond(post(id, params, context)),
        Method::Subscribe => {
            let parsed = match require_params(params).and_then(parse_subscribe) {
                Ok(parsed) => parsed,
                Err(err) => return Reply::Respond(Response::error_with_info(id, err)),
            };
            let data = serde_json::json!({ "subscribed": parsed.names.clone() });
            Reply::Stream(Response::ok(id, data), parsed.names)
        }
        Method::OpenFiles => Reply::Respond(open_files(id, params, context)),
        Method::CloseFiles => Reply::Respond(close_files(id, params, context)),
    }
}

fn require_params(params: Option<Value>) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))
}

fn health(id: Option<String>, context: &HostContext) -> Response {
    let pending_sessions = context
        .coordinator
        .snapshot()
        .map(|snapshot| snapshot.sessions.len())
        .unwrap_or(0);
    let info = HealthInfo {
        status: "ok".to_string(),
        app_id: APP_IDENTIFIER.to_string(),
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        started_at: context.started_at.to_rfc3339(),
        pending_sessions,
        open_documents: context.documents.len(),
    };
    match serde_json::to_value(info) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize health: {}", err),
        ),
    }
}

fn post(id: Option<String>, params: Option<Value>, context: &HostContext) -> Response {
    let notification = match require_params(params).and_then(parse_notification) {
        Ok(notification) => notification,
        Err(err) => return Response::error_with_info(id, err),
    };

    let delivered = context.hub.broadcast(&notification);
    info!(name = %notification.name, delivered, "Notification posted");
    Response::ok(id, serde_json::json!({ "delivered": delivered }))
}

fn open_files(id: Option<String>, params: Option<Value>, context: &HostContext) -> Response {
    let files = match require_params(params).and_then(parse_files) {
        Ok(parsed) => parsed.files,
        Err(err) => return Response::error_with_info(id, err),
    };

    let outcome = context.documents.open(&files);
    if outcome.opened.is_empty() {
        return Response::error(id, "open_failed", "no file could be opened");
    }
    Response::ok(
        id,
        serde_json::json!({ "opened": outcome.opened, "rejected": outcome.rejected }),
    )
}

fn close_files(id: Option<String>, params: Option<Value>, context: &HostContext) -> Response {
    let files = match require_params(params).and_then(parse_files) {
        Ok(parsed) => parsed.files,
        Err(err) => return Response::error_with_info(id, err),
    };

    let outcome = context.documents.close(&files);
    Response::ok(
        id,
        serde_json::json!({ "closed": outcome.closed, "not_open": outcome.not_open }),
    )
}

fn encode_line(response: &Response) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    Ok(line)
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
