//! serialturn
//!
//! Half-duplex serial terminal: one thread reads and prints lines, the other
//! sends commands typed at the prompt (or read from a file), and the two take
//! turns on the port.
//!
//! # Usage
//!
//! ```bash
//! # List available serial ports
//! serialturn --list
//!
//! # Talk to a modem with RTS/CTS gating and CR line endings
//! serialturn ttyUSB0 --baud 9600 --rtscts --line-ending cr
//!
//! # Try it without hardware
//! serialturn --demo
//! ```

mod logging;
mod source;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serialturn_core::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use source::{load_commands, StdinSource};

/// Half-duplex serial terminal
#[derive(Parser, Debug)]
#[command(name = "serialturn")]
#[command(version)]
#[command(about = "Half-duplex serial terminal with reader/writer turn-taking and RTS/CTS gating")]
struct Cli {
    /// Serial device (e.g. /dev/ttyUSB0, ttyUSB0, COM3)
    device: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Gate every write on an RTS/CTS handshake
    #[arg(long)]
    rtscts: bool,

    /// Let the driver do hardware flow control instead
    #[arg(long, conflicts_with = "rtscts")]
    driver_rtscts: bool,

    /// Assert DTR when the port opens
    #[arg(long)]
    dsrdtr: bool,

    /// Line ending appended to commands: cr, lf, crlf or no_crlf
    #[arg(short = 'e', long)]
    line_ending: Option<String>,

    /// Give up on a write if CTS is not asserted within this many milliseconds
    #[arg(long)]
    cts_timeout_ms: Option<u64>,

    /// Pause after each write, in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// JSON session configuration; command-line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Send commands from a file instead of the prompt
    #[arg(long)]
    commands: Option<PathBuf>,

    /// Print received data as hex chunks instead of lines
    #[arg(long)]
    raw: bool,

    /// Run against a simulated AT modem
    #[arg(long, conflicts_with = "device")]
    demo: bool,

    /// List serial ports and exit
    #[arg(short, long)]
    list: bool,

    /// Debug logging and control-line snapshots around every read and write
    #[arg(short, long)]
    verbose: bool,

    /// Also log to this file (a directory gets a date-stamped file)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Config file first, then command-line overrides
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => SessionConfig::default(),
        };

        if let Some(device) = &self.device {
            config.link.device = device.clone();
        }
        if self.demo {
            config.link.device = "demo".to_string();
        } else if config.link.device.is_empty() {
            bail!("no device given; pass a DEVICE, set link.device in --config, or use --demo");
        }

        if let Some(baud) = self.baud {
            config.link.baud_rate = baud;
        }
        if self.rtscts {
            config.flow.enabled = true;
        }
        if self.driver_rtscts {
            config.link.driver_rtscts = true;
        }
        if self.dsrdtr {
            config.link.dsrdtr = true;
        }
        if let Some(ending) = &self.line_ending {
            config.line_ending = ending.parse().context("invalid --line-ending")?;
        }
        if let Some(timeout) = self.cts_timeout_ms {
            config.flow.cts_timeout_ms = Some(timeout);
        }
        if let Some(settle) = self.settle_ms {
            config.settle_ms = settle;
        }
        if self.raw {
            config.framer.mode = FrameMode::Raw;
        }
        if self.verbose {
            config.verbose = true;
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn print_ports() {
    let ports = list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" [{:04x}:{:04x}]", vid, pid),
            _ => String::new(),
        };
        let product = port.product.as_deref().unwrap_or("");
        println!("{}{} {}", port.name, usb, product);
    }
}

async fn run<L: Link + 'static>(link: L, config: SessionConfig, commands: Option<&Path>) -> Result<()> {
    let device = config.link.device.clone();
    let raw = config.framer.mode == FrameMode::Raw;

    let session = Arc::new(Session::new(link, config).context("invalid configuration")?);
    if raw {
        session.on_chunk(|chunk| println!("{}", hex::encode(chunk)));
    } else {
        session.on_line(|line| println!("{line}"));
    }

    let source: Box<dyn CommandSource> = match commands {
        Some(path) => Box::new(load_commands(path)?),
        None => Box::new(StdinSource::new()),
    };
    session
        .start(source)
        .with_context(|| format!("failed to start session on {device}"))?;

    let waiter = Arc::clone(&session);
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            tracing::info!("interrupted");
        }
        _ = tokio::task::spawn_blocking(move || waiter.wait()) => {}
    }

    session.stop().context("session ended with an error")?;
    let stats = session.turn_stats();
    tracing::debug!(
        reads = stats.read_acquired,
        writes = stats.write_acquired,
        "session finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(path) = logging::init(cli.verbose, cli.log_file.as_deref())? {
        tracing::info!(path = %path.display(), "logging to file");
    }

    if cli.list {
        print_ports();
        return Ok(());
    }

    let config = cli.session_config()?;
    tracing::debug!(?config, "session configuration");

    if cli.demo {
        run(MockLink::at_modem(), config, cli.commands.as_deref()).await
    } else {
        let link = SerialLink::new(config.link.clone());
        run(link, config, cli.commands.as_deref()).await
    }
}
