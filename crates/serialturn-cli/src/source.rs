//! Command sources for the terminal

use anyhow::{Context, Result};
use serialturn_core::prelude::*;
use std::io::{self, BufRead, Write};
use std::path::Path;

/// Interactive prompt on stdin
pub struct StdinSource {
    prompt: &'static str,
}

impl StdinSource {
    pub fn new() -> Self {
        Self { prompt: "> " }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandSource for StdinSource {
    fn next_command(&mut self, stop: &StopSignal) -> Option<String> {
        if stop.is_set() {
            return None;
        }

        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(self.prompt.as_bytes());
        let _ = stdout.flush();
        drop(stdout);

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => {
                tracing::debug!("stdin closed");
                None
            }
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from stdin");
                None
            }
        }
    }
}

/// Parse a command script: one command per line, blank lines and `#`
/// comments skipped.
pub fn parse_commands(text: &str) -> QueueSource {
    QueueSource::new(
        text.lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#')),
    )
}

/// Load a command script from a file
pub fn load_commands(path: &Path) -> Result<QueueSource> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read command file {}", path.display()))?;
    let commands = parse_commands(&text);
    tracing::info!(path = %path.display(), count = commands.len(), "loaded commands");
    Ok(commands)
}
