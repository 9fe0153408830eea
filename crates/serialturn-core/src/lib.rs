//! # serialturn Core Library
//!
//! Half-duplex serial transport coordination.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A byte-oriented serial link abstraction with control-line access
//! - A turn coordinator that grants the link to exactly one of a reader or a
//!   writer at a time
//! - An optional RTS/CTS flow gate around writes
//! - Delimiter-based line framing with bounded buffering
//! - Reader and writer loops with cooperative shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use serialturn_core::prelude::*;
//!
//! let mut config = SessionConfig::default();
//! config.link.device = "/dev/ttyUSB0".into();
//! config.line_ending = "crlf".parse()?;
//!
//! let link = SerialLink::new(config.link.clone());
//! let session = Session::new(link, config)?;
//! session.on_line(|line| println!("{line}"));
//! session.start(QueueSource::new(["AT", "AT+GMR", "q"]))?;
//! session.wait();
//! session.stop()?;
//! ```

pub mod config;
pub mod ending;
pub mod error;
pub mod flow;
pub mod framer;
pub mod link;
pub mod reader;
pub mod session;
pub mod stop;
pub mod turn;
pub mod writer;

pub use error::{Result, TransportError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{FrameMode, FramerConfig, FlowGateConfig, LinkConfig, SessionConfig};
    pub use crate::ending::LineEnding;
    pub use crate::error::{Result, TransportError};
    pub use crate::flow::FlowGate;
    pub use crate::framer::LineFramer;
    pub use crate::link::mock::{MockHandle, MockLink};
    pub use crate::link::serial::{list_ports, PortInfo, SerialLink};
    pub use crate::link::{ControlSignals, Link};
    pub use crate::reader::ReaderState;
    pub use crate::session::Session;
    pub use crate::stop::StopSignal;
    pub use crate::turn::{TurnCoordinator, TurnState, TurnStats};
    pub use crate::writer::{ChannelSource, CommandSource, QueueSource, WriteOutcome};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default baud rate for serial links
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default blocking read timeout in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default maximum unterminated line length before a forced frame
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;
