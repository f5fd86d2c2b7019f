//! Finding a running editor, launching one, and the fire-and-forget open.

use moped_protocol::HealthInfo;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CliConfig;
use crate::error::CliError;
use crate::host_client::HostClient;

/// Returns the running editor's health, if one answers on the socket.
pub fn probe(client: &HostClient) -> Option<HealthInfo> {
    match client.health() {
        Ok(info) if info.is_moped() => Some(info),
        Ok(info) => {
            warn!(app_id = %info.app_id, "Socket answered for a different application");
            None
        }
        Err(err) => {
            debug!(error = %err, socket = %client.socket().display(), "Moped not reachable");
            None
        }
    }
}

/// Makes sure an editor is running, launching one when needed, and returns
/// its health once it answers.
pub fn ensure_running(config: &CliConfig, client: &HostClient) -> Result<HealthInfo, CliError> {
    if let Some(info) = probe(client) {
        return Ok(info);
    }

    let command = config.app_command();
    if let Err(err) = spawn_detached(&command, &[]) {
        warn!(error = %err, command = %command.display(), "Failed to launch Moped");
        return Err(CliError::Launch);
    }

    let deadline = Instant::now() + config.launch_timeout();
    loop {
        if let Some(info) = probe(client) {
            info!(pid = info.pid, "Moped is ready");
            return Ok(info);
        }
        if Instant::now() >= deadline {
            warn!(
                timeout_ms = config.launch_timeout_ms,
                "Moped did not become ready in time"
            );
            return Err(CliError::Launch);
        }
        thread::sleep(config.launch_poll());
    }
}

/// Opens `files` without waiting. A running editor is asked over the socket;
/// otherwise one is launched with the files as arguments.
pub fn open_without_waiting(
    config: &CliConfig,
    client: &HostClient,
    files: &[String],
) -> Result<(), CliError> {
    if probe(client).is_some() {
        return client.open_files(files).map_err(|err| {
            warn!(error = %err, "Moped refused to open files");
            CliError::Open
        });
    }

    let command = config.app_command();
    spawn_detached(&command, files).map_err(|err| {
        warn!(error = %err, command = %command.display(), "Failed to launch Moped with files");
        CliError::Open
    })
}

/// Starts the editor in its own process group so it outlives this command
/// and does not receive the terminal's signals.
fn spawn_detached(command: &Path, args: &[String]) -> std::io::Result<()> {
    let child = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;
    info!(pid = child.id(), command = %command.display(), "Launched Moped");
    Ok(())
}
