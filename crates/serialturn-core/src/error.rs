//! Transport errors

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur on a serial transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device could not be opened
    #[error("Link unavailable: {device}: {reason}")]
    LinkUnavailable {
        /// Device path that was requested
        device: String,
        /// Driver-reported reason
        reason: String,
    },

    /// I/O was attempted after the link was closed
    #[error("Link closed")]
    LinkClosed,

    /// A read or write failed momentarily
    #[error("Transient I/O error: {0}")]
    TransientIo(#[source] io::Error),

    /// Invalid or contradictory configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Clear-to-send was not asserted by the peer in time
    #[error("Flow control timeout: CTS not asserted within {0:?}")]
    FlowControlTimeout(Duration),

    /// The operation was cut short because the session is stopping
    #[error("Session stopped")]
    Stopped,

    /// Driver-level serial port error
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Unrecoverable I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Wrap an I/O error, classifying momentary failures as transient
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                TransportError::TransientIo(err)
            }
            _ => TransportError::Io(err),
        }
    }

    /// Whether the failed operation may simply be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::TransientIo(_))
    }

    /// Whether the error must end the loop that observed it.
    ///
    /// Both loops use this one classification. Everything is fatal except
    /// momentary I/O failures, a CTS timeout on a single write, and the
    /// stop itself.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::TransientIo(_)
                | TransportError::FlowControlTimeout(_)
                | TransportError::Stopped
        )
    }
}

impl From<serialport::Error> for TransportError {
    fn from(err: serialport::Error) -> Self {
        match err.kind() {
            serialport::ErrorKind::Io(kind) => TransportError::from_io(io::Error::new(kind, err)),
            _ => TransportError::Serial(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_out_is_transient() {
        let err = TransportError::from_io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_broken_pipe_is_fatal() {
        let err = TransportError::from_io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!err.is_transient());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_flow_control_timeout_is_recoverable() {
        let err = TransportError::FlowControlTimeout(Duration::from_millis(250));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_driver_error_is_fatal() {
        let err = TransportError::Serial("device reports readiness but returned no data".to_string());
        assert!(!err.is_transient());
        assert!(err.is_fatal());
        assert!(!TransportError::Stopped.is_fatal());
    }

    #[test]
    fn test_link_unavailable_display() {
        let err = TransportError::LinkUnavailable {
            device: "/dev/ttyUSB9".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Link unavailable: /dev/ttyUSB9: No such file or directory"
        );
    }
}
