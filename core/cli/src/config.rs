//! CLI settings: the `[cli]` table of `~/.moped/config.toml` plus the
//! environment overrides.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use moped_host::config::{default_config_path, moped_home};

pub const APP_ENV: &str = "MOPED_APP";
const HOST_BINARY: &str = "moped-host";
const MARKER_DIR: &str = "cli";
const LOG_DIR: &str = "logs";

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    cli: CliConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub launch_timeout_ms: u64,
    pub launch_poll_ms: u64,
    pub wait_slice_ms: u64,
    pub app_command: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            launch_timeout_ms: 5_000,
            launch_poll_ms: 100,
            wait_slice_ms: 100,
            app_command: None,
        }
    }
}

impl CliConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn launch_poll(&self) -> Duration {
        Duration::from_millis(self.launch_poll_ms.max(10))
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms.max(10))
    }

    /// Program used to launch the editor.
    ///
    /// `MOPED_APP` wins, then `app_command`, then a `moped-host` next to this
    /// executable, then `moped-host` on `PATH`.
    pub fn app_command(&self) -> PathBuf {
        if let Ok(value) = env::var(APP_ENV) {
            if !value.trim().is_empty() {
                return PathBuf::from(value);
            }
        }
        if let Some(command) = self
            .app_command
            .as_deref()
            .filter(|value| !value.trim().is_empty())
        {
            return PathBuf::from(command);
        }
        sibling_host_binary().unwrap_or_else(|| PathBuf::from(HOST_BINARY))
    }
}

fn sibling_host_binary() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    let candidate = exe.parent()?.join(HOST_BINARY);
    candidate.is_file().then_some(candidate)
}

pub fn load_config(path: Option<&Path>) -> Result<CliConfig, String> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(CliConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)
        .map_err(|err| format!("Failed to read Moped config: {}", err))?;
    toml::from_str::<ConfigFile>(&content)
        .map(|file| file.cli)
        .map_err(|err| {
            format!(
                "Failed to parse Moped config {}: {}",
                config_path.display(),
                err
            )
        })
}

/// Directory holding the per-session marker files.
pub fn marker_dir() -> Result<PathBuf, String> {
    Ok(moped_home()?.join(MARKER_DIR))
}

pub fn log_dir() -> Result<PathBuf, String> {
    Ok(moped_home()?.join(LOG_DIR))
}
