//! Tracing setup for the CLI

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Per-run log file name, e.g. `serialturn_03-14-2025_1741960800.log`
pub fn log_file_name(now: DateTime<Local>) -> String {
    format!("serialturn_{}_{}.log", now.format("%m-%d-%Y"), now.timestamp())
}

/// Where to write the log. A directory gets a date-stamped file inside it.
pub fn log_file_path(target: &Path, now: DateTime<Local>) -> PathBuf {
    if target.is_dir() {
        target.join(log_file_name(now))
    } else {
        target.to_path_buf()
    }
}

/// Install the global subscriber. Logs go to stderr so that stdout carries
/// only received data. `RUST_LOG` overrides the default level.
pub fn init(verbose: bool, log_file: Option<&Path>) -> Result<Option<PathBuf>> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("serialturn={level},serialturn_core={level},warn")));

    let (file_layer, path) = match log_file {
        Some(target) => {
            let path = log_file_path(target, Local::now());
            let file = File::create(&path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(path)
}
