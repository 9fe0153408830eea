//! Session configuration
//!
//! All settings are grouped in [`SessionConfig`], which can be built in code,
//! loaded from a JSON file, or assembled by a command-line front end. Every
//! field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::ending::LineEnding;
use crate::{Result, TransportError, DEFAULT_BAUD_RATE, DEFAULT_MAX_LINE_LEN, DEFAULT_READ_TIMEOUT_MS};

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Device path (e.g. "/dev/ttyUSB0" or "COM3")
    pub device: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout for blocking reads in milliseconds
    pub read_timeout_ms: u64,
    /// Let the driver handle RTS/CTS (mutually exclusive with the flow gate)
    pub driver_rtscts: bool,
    /// Assert DTR while the link is open
    pub dsrdtr: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            driver_rtscts: false,
            dsrdtr: false,
        }
    }
}

impl LinkConfig {
    /// Link settings for a device at the default baud rate
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Default::default()
        }
    }

    /// Set the baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Blocking read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Software RTS/CTS handshake settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowGateConfig {
    /// Perform the handshake around every write
    pub enabled: bool,
    /// Give up waiting for CTS after this many milliseconds (None waits forever)
    pub cts_timeout_ms: Option<u64>,
    /// Delay between CTS polls in microseconds (0 spins)
    pub cts_poll_us: u64,
}

impl Default for FlowGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cts_timeout_ms: None,
            cts_poll_us: 0,
        }
    }
}

/// How received bytes are delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// Delimiter-terminated lines
    #[default]
    Lines,
    /// Each drained chunk, unframed
    Raw,
}

/// Line framing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramerConfig {
    /// Frame delimiter byte
    pub delimiter: u8,
    /// Longest unterminated line before a forced frame
    pub max_line_len: usize,
    /// Delivery mode
    pub mode: FrameMode,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            delimiter: b'\n',
            max_line_len: DEFAULT_MAX_LINE_LEN,
            mode: FrameMode::Lines,
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial link
    pub link: LinkConfig,
    /// RTS/CTS flow gate
    pub flow: FlowGateConfig,
    /// Line framing
    pub framer: FramerConfig,
    /// Terminator appended to commands
    pub line_ending: LineEnding,
    /// Reader sleep between empty polls in milliseconds
    pub poll_interval_ms: u64,
    /// Consecutive write turns allowed while the reader waits
    pub write_burst_limit: u32,
    /// Pause after each write before releasing the turn, in milliseconds
    pub settle_ms: u64,
    /// Bounded join on shutdown, in milliseconds
    pub join_timeout_ms: u64,
    /// Log control-line snapshots around every read and write cycle
    pub verbose: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            flow: FlowGateConfig::default(),
            framer: FramerConfig::default(),
            line_ending: LineEnding::default(),
            poll_interval_ms: 10,
            write_burst_limit: 4,
            settle_ms: 0,
            join_timeout_ms: 2000,
            verbose: false,
        }
    }
}

impl SessionConfig {
    /// Configuration for a device with defaults everywhere else
    pub fn for_device(device: impl Into<String>) -> Self {
        Self {
            link: LinkConfig::new(device),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TransportError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&contents)
    }

    /// Parse a configuration from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TransportError::Configuration(format!("invalid configuration: {}", e)))
    }

    /// Reject values no session can run with
    pub fn validate(&self) -> Result<()> {
        if self.link.baud_rate == 0 {
            return Err(TransportError::Configuration(
                "baud rate must be greater than zero".to_string(),
            ));
        }
        if self.link.driver_rtscts && self.flow.enabled {
            return Err(TransportError::Configuration(
                "driver RTS/CTS and the software flow gate cannot both be enabled".to_string(),
            ));
        }
        if self.flow.cts_timeout_ms == Some(0) {
            return Err(TransportError::Configuration(
                "CTS timeout must be greater than zero (omit it to wait forever)".to_string(),
            ));
        }
        if self.framer.max_line_len == 0 {
            return Err(TransportError::Configuration(
                "maximum line length must be greater than zero".to_string(),
            ));
        }
        if self.write_burst_limit == 0 {
            return Err(TransportError::Configuration(
                "write burst limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Reader sleep between empty polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Bounded join on shutdown
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Pause after each write, if any
    pub fn settle(&self) -> Option<Duration> {
        (self.settle_ms > 0).then(|| Duration::from_millis(self.settle_ms))
    }
}
