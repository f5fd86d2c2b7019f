//! Error types for the `moped` command.
//!
//! `CliError` is what reaches the user: its `Display` is the single line
//! printed to stderr before exiting 1. `ClientError` carries the detail of a
//! failed host conversation and only ever shows up in the log file.

use moped_protocol::ErrorInfo;

pub const USAGE: &str = "Usage: moped [--wait] <file>...";

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{}", USAGE)]
    Usage,

    #[error("Unable to launch Moped.")]
    Launch,

    #[error("Unable to open files in Moped.")]
    Open,

    #[error("Unable to create wait session file.")]
    Marker,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Home directory not found")]
    NoHome,

    #[error("Failed to connect to Moped socket: {0}")]
    Connect(#[source] std::io::Error),

    #[error("I/O error talking to Moped: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for Moped response")]
    Timeout,

    #[error("Moped response exceeded maximum size")]
    TooLarge,

    #[error("Invalid response from Moped: {0}")]
    InvalidResponse(String),

    #[error("Moped rejected the request: {0}")]
    Rejected(ErrorInfo),
}
