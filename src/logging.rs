//! Tracing setup: the server logs to a file and stderr, other commands to
//! stderr only

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Open `path` for appending and mark where this run starts
fn open_with_banner(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file at {}", path.display()))?;

    let rule = "=".repeat(80);
    let started = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    write!(file, "\n{rule}\nLanshare Server Started - {started}\n{rule}\n\n")?;
    file.flush()?;
    Ok(file)
}

/// Log to `log_file` and stderr at `info` unless `RUST_LOG` says otherwise.
/// File output stops when the returned guard is dropped.
pub fn init_server_logging<P: AsRef<Path>>(log_file: P) -> Result<WorkerGuard> {
    let log_path = log_file.as_ref();
    let (file_writer, guard) = tracing_appender::non_blocking(open_with_banner(log_path)?);

    tracing_subscriber::registry()
        .with(filter_or("info"))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::info!(log_file = %log_path.display(), "Logging initialized");
    Ok(guard)
}

pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter_or("warn"))
        .with_target(false)
        .try_init();
}
