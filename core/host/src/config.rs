//! Host runtime configuration (`~/.moped/config.toml`, `[host]` table).

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::DEFAULT_POLL_INTERVAL;

pub const SOCKET_ENV: &str = "MOPED_SOCKET";
const SOCKET_NAME: &str = "moped.sock";
const CONFIG_NAME: &str = "config.toml";
const MIN_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MopedConfig {
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl HostConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

pub fn moped_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".moped"))
}

pub fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(moped_home()?.join(SOCKET_NAME))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(moped_home()?.join(CONFIG_NAME))
}

pub fn load_config(path: Option<PathBuf>) -> Result<MopedConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(MopedConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read Moped config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<MopedConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse Moped config {}: {}",
            config_path.display(),
            err
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_config_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("missing.toml"))).expect("load");
        assert_eq!(config.host.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn load_config_reads_host_table_and_ignores_cli_table() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
[host]
poll_interval_ms = 250

[cli]
wait_slice_ms = 50
"#,
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load");
        assert_eq!(config.host.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let config = HostConfig {
            poll_interval_ms: 1,
        };
        assert_eq!(
            config.poll_interval(),
            Duration::from_millis(MIN_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn malformed_config_is_an_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "[host]\npoll_interval_ms = \"soon\"\n").expect("write");
        assert!(load_config(Some(path)).is_err());
    }
}
