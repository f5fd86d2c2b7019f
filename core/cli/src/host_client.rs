//! Client side of the Moped socket.
//!
//! Every call opens a fresh connection, writes one request line and reads one
//! response line. `subscribe` is the exception: the connection is kept and
//! returned so the caller can read the notification stream.

use moped_protocol::{
    HealthInfo, Method, Notification, Request, Response, MAX_REQUEST_BYTES,
};
use rand::RngCore;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ClientError;

const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;

#[derive(Debug, Clone)]
pub struct HostClient {
    socket: PathBuf,
}

impl HostClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn health(&self) -> Result<HealthInfo, ClientError> {
        let data = self.call(Method::GetHealth, None)?;
        serde_json::from_value(data)
            .map_err(|err| ClientError::InvalidResponse(format!("health: {}", err)))
    }

    /// Posts a notification. Returns once the host has handed it to its
    /// local observers.
    pub fn post(&self, notification: &Notification) -> Result<u64, ClientError> {
        let params = serde_json::to_value(notification)
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        let data = self.call(Method::Post, Some(params))?;
        Ok(data
            .get("delivered")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0))
    }

    pub fn open_files(&self, files: &[String]) -> Result<(), ClientError> {
        self.call(
            Method::OpenFiles,
            Some(serde_json::json!({ "files": files })),
        )
        .map(|_| ())
    }

    /// Subscribes to `names` and returns the live notification stream.
    ///
    /// The stream has no read timeout; the reader blocks until a line
    /// arrives or the host goes away.
    pub fn subscribe(&self, names: &[&str]) -> Result<BufReader<UnixStream>, ClientError> {
        let request = Request::new(
            Method::Subscribe,
            Some(make_request_id()),
            Some(serde_json::json!({ "names": names })),
        );
        let mut stream = self.connect()?;
        write_request(&mut stream, &request)?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => {
                return Err(ClientError::InvalidResponse(
                    "connection closed before subscribe response".to_string(),
                ))
            }
            Ok(_) => {}
            Err(err) if is_timeout(&err) => return Err(ClientError::Timeout),
            Err(err) => return Err(ClientError::Io(err)),
        }
        let response: Response = serde_json::from_str(line.trim_end())
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        into_data(response)?;

        reader.get_ref().set_read_timeout(None)?;
        Ok(reader)
    }

    fn call(
        &self,
        method: Method,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        let request = Request::new(method, Some(make_request_id()), params);
        let mut stream = self.connect()?;
        write_request(&mut stream, &request)?;
        into_data(read_response(&mut stream)?)
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let stream = UnixStream::connect(&self.socket).map_err(ClientError::Connect)?;
        let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
        let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
        Ok(stream)
    }
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), ClientError> {
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| ClientError::Io(std::io::Error::from(err)))?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::TooLarge);
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if is_timeout(&err) => return Err(ClientError::Timeout),
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::InvalidResponse(
            "response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::InvalidResponse(err.to_string()))
}

fn into_data(response: Response) -> Result<serde_json::Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(serde_json::Value::Null));
    }
    Err(ClientError::Rejected(response.error.unwrap_or_else(|| {
        moped_protocol::ErrorInfo::new("unknown", "no error detail")
    })))
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn make_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    format!(
        "req-{}-{}-{:x}",
        millis,
        std::process::id(),
        rand::thread_rng().next_u64()
    )
}
