//! `moped --wait`: open files, then block until the editor reports every one
//! of them closed.
//!
//! The wait ends on the first of:
//! - the editor's completion notification for this session,
//! - the marker file disappearing (the editor deletes it on completion),
//! - the editor process going away (exit, zombie, reused pid, or the
//!   notification stream closing).

use moped_protocol::{marker_file_name, WaitRequest, WAIT_COMPLETE_NOTIFICATION};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{marker_dir, CliConfig};
use crate::error::CliError;
use crate::host_client::HostClient;
use crate::launcher;
use crate::listener::{CompletionListener, ListenerEvent};
use crate::process::HostProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    MarkerRemoved,
    HostExited,
}

pub fn new_session_id() -> String {
    ulid::Ulid::new().to_string()
}

pub fn run(
    config: &CliConfig,
    client: &HostClient,
    files: &[String],
) -> Result<WaitOutcome, CliError> {
    let session_id = new_session_id();
    info!(session_id = %session_id, files = ?files, "Starting wait session");

    let health = launcher::ensure_running(config, client)?;
    let host = HostProcess::capture(health.pid);

    // The host registers the subscription before it acknowledges it, so a
    // completion broadcast after the ack reaches this listener.
    let stream = client
        .subscribe(&[WAIT_COMPLETE_NOTIFICATION])
        .map_err(|err| {
            warn!(error = %err, "Failed to subscribe to completions");
            CliError::Launch
        })?;
    let mut listener = CompletionListener::start(stream, session_id.clone()).map_err(|err| {
        warn!(error = %err, "Failed to start completion listener");
        CliError::Launch
    })?;

    let marker = create_marker(&session_id).map_err(|err| {
        warn!(error = %err, "Failed to create marker file");
        CliError::Marker
    })?;

    if let Err(err) = client.open_files(files) {
        warn!(error = %err, "Moped refused to open files");
        listener.stop();
        remove_marker(&marker);
        return Err(CliError::Open);
    }

    let request = WaitRequest {
        session_id: session_id.clone(),
        files: files.to_vec(),
        session_file_path: Some(marker.to_string_lossy().to_string()),
    };
    match client.post(&request.to_notification()) {
        Ok(delivered) => debug!(delivered, "Wait request acknowledged"),
        Err(err) => {
            warn!(error = %err, "Failed to post wait request");
            listener.stop();
            remove_marker(&marker);
            return Err(CliError::Open);
        }
    }

    let outcome = wait_for_completion(listener.events(), &marker, config.wait_slice(), || {
        host.is_alive()
    });
    info!(session_id = %session_id, outcome = ?outcome, pid = host.pid(), "Wait finished");

    remove_marker(&marker);
    listener.stop();
    Ok(outcome)
}

/// Blocks in `slice`-sized receives until one of the exit conditions holds.
pub fn wait_for_completion<F>(
    events: &Receiver<ListenerEvent>,
    marker: &Path,
    slice: Duration,
    mut host_alive: F,
) -> WaitOutcome
where
    F: FnMut() -> bool,
{
    loop {
        match events.recv_timeout(slice) {
            Ok(ListenerEvent::Completed) => return WaitOutcome::Completed,
            Ok(ListenerEvent::Disconnected) | Err(RecvTimeoutError::Disconnected) => {
                return WaitOutcome::HostExited
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !marker.exists() {
            return WaitOutcome::MarkerRemoved;
        }
        if !host_alive() {
            return WaitOutcome::HostExited;
        }
    }
}

fn create_marker(session_id: &str) -> std::io::Result<PathBuf> {
    let dir = marker_dir().map_err(std::io::Error::other)?;
    fs_err::create_dir_all(&dir)?;
    let marker = dir.join(marker_file_name(session_id));
    fs_err::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)?;
    Ok(marker)
}

fn remove_marker(marker: &Path) {
    match fs_err::remove_file(marker) {
        Ok(()) => debug!(path = %marker.display(), "Removed marker file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => debug!(error = %err, "Failed to remove marker file"),
    }
}
