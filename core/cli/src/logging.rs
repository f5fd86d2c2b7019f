//! File logging for the CLI.
//!
//! stderr belongs to the one-line user diagnostic, so tracing output goes to
//! `~/.moped/logs/moped-cli.log`. The returned guard flushes the non-blocking
//! writer and must live until `main` returns.

use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::log_dir;

const LOG_FILE: &str = "moped-cli.log";
const DEBUG_LOG_ENV: &str = "MOPED_DEBUG_LOG";

pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir().ok()?;
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}
