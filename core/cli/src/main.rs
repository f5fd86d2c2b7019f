//! moped: open files in the Moped editor from a shell.
//!
//! `moped <file>...` hands the files to the editor and exits. With `--wait`
//! the command blocks until every file's document has been closed, which
//! makes it usable as `$EDITOR`.

mod config;
mod error;
mod host_client;
mod launcher;
mod listener;
mod logging;
mod paths;
mod process;
mod wait;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use std::env;
use std::path::PathBuf;

use crate::error::CliError;
use crate::host_client::HostClient;

#[derive(Parser, Debug)]
#[command(name = "moped")]
#[command(about = "Open files in Moped")]
#[command(version)]
struct Cli {
    /// Block until every file has been closed in Moped
    #[arg(long, action = ArgAction::SetTrue, overrides_with = "wait")]
    wait: bool,

    /// Files to open
    #[arg(value_name = "FILE", allow_hyphen_values = true)]
    files: Vec<String>,
}

impl Cli {
    /// Once the file list has started, clap keeps hyphen values as files;
    /// `--wait` still counts wherever it appears.
    fn normalize(mut self) -> Self {
        let before = self.files.len();
        self.files.retain(|file| file != "--wait");
        self.wait |= self.files.len() != before;
        self
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli.normalize(),
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(_) => fail(CliError::Usage),
    };
    if cli.files.is_empty() {
        fail(CliError::Usage);
    }

    let logging_guard = logging::init();

    if let Err(err) = run(cli) {
        tracing::error!(error = %err, "moped failed");
        drop(logging_guard);
        fail(err);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Failed to load Moped config; using defaults");
            config::CliConfig::default()
        }
    };

    let socket = moped_host::config::socket_path().map_err(|err| {
        tracing::warn!(error = %err, "Failed to resolve Moped socket path");
        if cli.wait {
            CliError::Launch
        } else {
            CliError::Open
        }
    })?;
    let client = HostClient::new(socket);

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let home = dirs::home_dir();
    let files = paths::resolve_all(&cli.files, &cwd, home.as_deref());
    tracing::debug!(files = ?files, wait = cli.wait, "Resolved command-line files");

    if !cli.wait {
        return launcher::open_without_waiting(&config, &client, &files);
    }

    wait::run(&config, &client, &files).map(|_| ())
}

fn fail(err: CliError) -> ! {
    eprintln!("{}", err);
    std::process::exit(1);
}
