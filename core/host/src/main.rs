//! Headless Moped host.
//!
//! Listens on the Moped socket, keeps a document registry, and runs the wait
//! coordinator. SIGINT/SIGTERM are treated as app termination: every pending
//! wait session is completed before the process exits.

use clap::Parser;
use fs_err as fs;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use moped_host::config::{self, MopedConfig};
use moped_host::server::{self, HostContext};
use moped_host::start_host;

const DEBUG_LOG_ENV: &str = "MOPED_DEBUG_LOG";

#[derive(Parser, Debug)]
#[command(name = "moped-host", version, about = "Headless Moped editor host")]
struct Args {
    /// Config file (defaults to ~/.moped/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Files to open as documents at launch
    files: Vec<String>,
}

fn main() {
    let args = Args::parse();
    init_logging();

    let config = match config::load_config(args.config) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load Moped config; using defaults");
            MopedConfig::default()
        }
    };

    let socket_path = match config::socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve Moped socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind socket");
            std::process::exit(1);
        }
    };

    let context = start_host(&config.host);
    info!(
        path = %socket_path.display(),
        poll_interval_ms = config.host.poll_interval().as_millis() as u64,
        "Moped host started"
    );

    open_launch_files(&context, &args.files);

    if let Err(err) = spawn_termination_handler(Arc::clone(&context), socket_path.clone()) {
        error!(error = %err, "Failed to install signal handler");
        std::process::exit(1);
    }

    server::serve(listener, context);
}

fn init_logging() {
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
        .with_writer(std::io::stderr)
        .init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn open_launch_files(context: &HostContext, files: &[String]) {
    if files.is_empty() {
        return;
    }
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    let absolute: Vec<String> = files
        .iter()
        .map(|file| cwd.join(file).to_string_lossy().to_string())
        .collect();
    let outcome = context.documents.open(&absolute);
    if !outcome.rejected.is_empty() {
        warn!(rejected = ?outcome.rejected, "Some launch files could not be opened");
    }
}

fn spawn_termination_handler(context: Arc<HostContext>, socket_path: PathBuf) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Moped host terminating");
            context.coordinator.app_will_terminate();
            let _ = fs::remove_file(&socket_path);
            std::process::exit(0);
        }
    });
    Ok(())
}
