use moped_protocol::{
    marker_file_name, HealthInfo, Method, Notification, Request, Response, WaitComplete,
    WaitRequest, APP_IDENTIFIER, SESSION_ID_KEY, WAIT_COMPLETE_NOTIFICATION,
    WAIT_REQUEST_NOTIFICATION,
};
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct HostGuard {
    child: Child,
}

impl Drop for HostGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_host(home: &Path) -> HostGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_moped-host"))
        .env("HOME", home)
        .env_remove("MOPED_SOCKET")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn moped-host");
    HostGuard { child }
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".moped").join("moped.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for host socket at {}", path.display());
}

fn write_request(stream: &mut UnixStream, request: &Request) {
    serde_json::to_writer(&mut *stream, request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to host socket");
    write_request(&mut stream, &request);
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut byte = [0u8; 1];

    // Byte at a time so nothing past the response line is consumed.
    loop {
        let n = stream.read(&mut byte).expect("Failed to read response");
        if n == 0 || byte[0] == b'\n' {
            break;
        }
        buffer.push(byte[0]);
    }

    serde_json::from_slice(&buffer).expect("Failed to parse response JSON")
}

fn subscribe(socket: &Path, names: &[&str]) -> BufReader<UnixStream> {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to host socket");
    write_request(
        &mut stream,
        &Request::new(
            Method::Subscribe,
            Some("sub".to_string()),
            Some(json!({ "names": names })),
        ),
    );
    let response = read_response(&mut stream);
    assert!(response.ok, "subscribe failed: {:?}", response.error);
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("set read timeout");
    BufReader::new(stream)
}

fn next_notification(reader: &mut BufReader<UnixStream>) -> Option<Notification> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => serde_json::from_str(line.trim()).ok(),
    }
}

fn post(socket: &Path, notification: &Notification) -> Response {
    send_request(
        socket,
        Request::new(
            Method::Post,
            Some("post".to_string()),
            Some(serde_json::to_value(notification).expect("notification json")),
        ),
    )
}

fn files_request(socket: &Path, method: Method, files: &[String]) -> Response {
    send_request(
        socket,
        Request::new(method, None, Some(json!({ "files": files }))),
    )
}

fn health(socket: &Path) -> HealthInfo {
    let response = send_request(socket, Request::new(Method::GetHealth, None, None));
    assert!(response.ok, "health response was not ok");
    serde_json::from_value(response.data.expect("health data")).expect("health info")
}

#[test]
fn host_reports_health() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = spawn_host(home.path());
    wait_for_socket(&socket, Duration::from_secs(3));

    let info = health(&socket);
    assert!(info.is_moped());
    assert_eq!(info.app_id, APP_IDENTIFIER);
    assert_eq!(info.pending_sessions, 0);
    assert!(chrono::DateTime::parse_from_rfc3339(&info.started_at).is_ok());
}

#[test]
fn closing_the_last_file_completes_the_session_and_removes_the_marker() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = spawn_host(home.path());
    wait_for_socket(&socket, Duration::from_secs(3));

    let file_a = home.path().join("a.txt");
    let file_b = home.path().join("b.txt");
    std::fs::write(&file_a, "a").expect("write a");
    std::fs::write(&file_b, "b").expect("write b");
    let files = vec![
        file_a.to_string_lossy().to_string(),
        file_b.to_string_lossy().to_string(),
    ];

    let marker_dir = home.path().join(".moped").join("cli");
    std::fs::create_dir_all(&marker_dir).expect("marker dir");
    let marker = marker_dir.join(marker_file_name("session-1"));
    std::fs::write(&marker, "").expect("marker");

    let mut listener = subscribe(&socket, &[WAIT_COMPLETE_NOTIFICATION]);

    let opened = files_request(&socket, Method::OpenFiles, &files);
    assert!(opened.ok, "open_files failed: {:?}", opened.error);

    let posted = post(
        &socket,
        &WaitRequest {
            session_id: "session-1".to_string(),
            files: files.clone(),
            session_file_path: Some(marker.to_string_lossy().to_string()),
        }
        .to_notification(),
    );
    assert!(posted.ok);
    assert_eq!(health(&socket).pending_sessions, 1);

    let closed = files_request(&socket, Method::CloseFiles, &files[1..]);
    assert!(closed.ok);
    assert!(marker.exists(), "marker removed before every file closed");
    assert_eq!(health(&socket).pending_sessions, 1);

    let closed = files_request(&socket, Method::CloseFiles, &files[..1]);
    assert!(closed.ok);

    let notification = next_notification(&mut listener).expect("completion notification");
    let complete = WaitComplete::from_notification(&notification).expect("wait complete");
    assert_eq!(complete.session_id, "session-1");
    assert!(!marker.exists(), "marker should be removed on completion");
    assert_eq!(health(&socket).pending_sessions, 0);
}

#[test]
fn malformed_wait_request_is_ignored() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = spawn_host(home.path());
    wait_for_socket(&socket, Duration::from_secs(3));

    let mut user_info = serde_json::Map::new();
    user_info.insert("files".to_string(), json!(["/tmp/whatever.txt"]));
    let posted = post(
        &socket,
        &Notification::new(WAIT_REQUEST_NOTIFICATION, user_info),
    );
    assert!(posted.ok, "post itself is delivered");

    let info = health(&socket);
    assert_eq!(info.pending_sessions, 0);
}

#[test]
fn invalid_requests_get_error_responses() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let _guard = spawn_host(home.path());
    wait_for_socket(&socket, Duration::from_secs(3));

    let mut stream = UnixStream::connect(&socket).expect("connect");
    stream.write_all(b"not json\n").expect("write");
    let response = read_response(&mut stream);
    assert!(!response.ok);
    assert_eq!(response.error.expect("error").code, "invalid_json");

    let response = files_request(&socket, Method::OpenFiles, &["relative.txt".to_string()]);
    assert!(!response.ok);
    assert_eq!(response.error.expect("error").code, "open_failed");

    assert!(health(&socket).is_moped());
}

#[test]
fn terminating_the_host_completes_pending_sessions() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    let socket = socket_path(home.path());
    let mut guard = spawn_host(home.path());
    wait_for_socket(&socket, Duration::from_secs(3));

    let file = home.path().join("held.txt");
    std::fs::write(&file, "x").expect("write");
    let files = vec![file.to_string_lossy().to_string()];
    let marker = home.path().join("held.wait");
    std::fs::write(&marker, "").expect("marker");

    let mut listener = subscribe(&socket, &[WAIT_COMPLETE_NOTIFICATION]);
    assert!(files_request(&socket, Method::OpenFiles, &files).ok);
    assert!(post(
        &socket,
        &WaitRequest {
            session_id: "held".to_string(),
            files,
            session_file_path: Some(marker.to_string_lossy().to_string()),
        }
        .to_notification(),
    )
    .ok);

    let status = Command::new("kill")
        .arg("-TERM")
        .arg(guard.child.id().to_string())
        .status()
        .expect("send SIGTERM");
    assert!(status.success());

    let notification = next_notification(&mut listener).expect("completion on terminate");
    assert_eq!(notification.name, WAIT_COMPLETE_NOTIFICATION);
    assert_eq!(
        notification
            .user_info
            .get(SESSION_ID_KEY)
            .and_then(|value| value.as_str()),
        Some("held")
    );

    let exit = guard.child.wait().expect("host exit");
    assert!(exit.success());
    assert!(!marker.exists());
    assert!(!socket.exists());
}
