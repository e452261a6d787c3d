pub mod gateway;
pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use gateway::config::{load_dotenv, resolve_config_path, FileConfigStore};
use gateway::{ConfigStore, WorkerSupervisor};
use server::GatewayServer;

/// Command-line options for the `mcphub` binary.
#[derive(Parser, Debug)]
#[command(name = "mcphub", version, about = "Aggregating gateway for stdio MCP servers")]
pub struct Cli {
    /// Path to the worker configuration (JSON, or YAML by extension)
    #[arg(long, env = "MCPHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format on stderr
    #[arg(long, value_enum, env = "MCPHUB_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    /// Write logs to this file instead of stderr (rotated on startup)
    #[arg(long, env = "MCPHUB_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Previous gateway logs kept next to the live one.
const LOG_GENERATIONS: u32 = 3;

/// Initialize the tracing subscriber.
///
/// Stdout carries the protocol, so logs go to stderr, or to `log_file`
/// when given. A log file is rotated on each startup.
pub fn init_tracing(format: LogFormat, log_file: Option<&Path>) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcphub=info,warn"));

    // `File` is unbuffered, so every event is on disk before the client
    // can kill the gateway.
    let file_writer = log_file.and_then(|path| match open_log_file(path) {
        Ok(file) => Some(std::sync::Mutex::new(file)),
        Err(e) => {
            eprintln!("mcphub: cannot open log file {}: {e}", path.display());
            None
        }
    });

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    match (format, file_writer) {
        (LogFormat::Json, Some(writer)) => builder.json().with_writer(writer).init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).init(),
        (LogFormat::Text, Some(writer)) => builder.with_writer(writer).init(),
        (LogFormat::Text, None) => builder.with_writer(std::io::stderr).init(),
    }
}

/// Archive the previous run's log and open a fresh one.
fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    archive_previous_logs(path, LOG_GENERATIONS);
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// `gateway.log.{n}`; generation 0 is the live file.
fn log_generation(path: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift every archived log up one generation, dropping the oldest.
/// Gaps in the chain are fine.
fn archive_previous_logs(path: &Path, generations: u32) {
    let _ = std::fs::remove_file(log_generation(path, generations));
    for n in (0..generations).rev() {
        let from = log_generation(path, n);
        if from.exists() {
            let _ = std::fs::rename(&from, log_generation(path, n + 1));
        }
    }
}

/// Load configuration, serve on stdio, and tear every worker down on exit.
///
/// Only an unreadable or invalid configuration aborts startup.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = resolve_config_path(cli.config.as_deref());
    if let Some(env_file) = load_dotenv(&config_path) {
        tracing::info!(path = %env_file.display(), "loaded environment file");
    }

    let store = FileConfigStore::new(&config_path);
    let config = store
        .load()
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        services = config.services.len(),
        pid = std::process::id(),
        "=== mcphub starting ==="
    );

    let supervisor = WorkerSupervisor::new(config.services, Arc::new(store));
    let server = GatewayServer::new(Arc::clone(&supervisor));

    tokio::select! {
        served = server.serve(tokio::io::stdin(), tokio::io::stdout()) => {
            if let Err(e) = served {
                tracing::warn!(error = %e, "client connection failed");
            }
        }
        () = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    supervisor.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM (ctrl-c where SIGTERM does not exist).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
