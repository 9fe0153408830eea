//! Serial link abstraction
//!
//! A [`Link`] is a raw byte-oriented connection with control-line access.
//! Links are owned by a [`TurnCoordinator`](crate::turn::TurnCoordinator) and
//! are only reachable through a held turn, so implementations never need to
//! synchronize internally.

pub mod mock;
pub mod serial;

use serde::Serialize;
use std::fmt;

use crate::Result;

/// Byte-oriented serial connection
pub trait Link: Send {
    /// Short display name of the device
    fn name(&self) -> &str;

    /// Open the device. Opening an open link is a no-op.
    fn open(&mut self) -> Result<()>;

    /// Whether the device is currently open
    fn is_open(&self) -> bool;

    /// Close the device. Closing a closed link is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Hand bytes to the driver. Returns once the driver accepted all of them.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Block until the output queue has drained
    fn flush(&mut self) -> Result<()>;

    /// Return whatever is buffered by the driver without blocking
    fn read_available(&mut self) -> Result<Vec<u8>>;

    /// Blocking read of up to `size` bytes, bounded by the read timeout.
    ///
    /// Returns fewer bytes when the timeout expires first.
    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Number of bytes waiting in the input buffer
    fn bytes_to_read(&mut self) -> Result<u32>;

    /// Number of bytes waiting in the output buffer
    fn bytes_to_write(&mut self) -> Result<u32>;

    /// Last level written to the RTS line
    fn rts(&self) -> bool;

    /// Drive the RTS line
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Sample the CTS line
    fn cts(&mut self) -> Result<bool>;

    /// Last level written to the DTR line
    fn dtr(&self) -> bool {
        false
    }

    /// Sample the DSR line
    fn dsr(&mut self) -> Result<bool> {
        Ok(false)
    }

    /// Sample all control lines and buffer counters
    fn signals(&mut self) -> Result<ControlSignals> {
        if !self.is_open() {
            return Ok(ControlSignals {
                rts: self.rts(),
                dtr: self.dtr(),
                ..Default::default()
            });
        }
        Ok(ControlSignals {
            rts: self.rts(),
            cts: self.cts()?,
            dtr: self.dtr(),
            dsr: self.dsr()?,
            bytes_waiting_in: self.bytes_to_read()?,
            bytes_waiting_out: self.bytes_to_write()?,
            is_open: true,
        })
    }
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        (**self).read_available()
    }

    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        (**self).read_exact(size)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        (**self).bytes_to_read()
    }

    fn bytes_to_write(&mut self) -> Result<u32> {
        (**self).bytes_to_write()
    }

    fn rts(&self) -> bool {
        (**self).rts()
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }

    fn cts(&mut self) -> Result<bool> {
        (**self).cts()
    }

    fn dtr(&self) -> bool {
        (**self).dtr()
    }

    fn dsr(&mut self) -> Result<bool> {
        (**self).dsr()
    }

    fn signals(&mut self) -> Result<ControlSignals> {
        (**self).signals()
    }
}

/// Snapshot of control lines and buffer counters
///
/// Sampled on demand and never cached. A snapshot taken outside a turn is
/// racy and is only fit for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControlSignals {
    /// Request-to-send (local output)
    pub rts: bool,
    /// Clear-to-send (peer input)
    pub cts: bool,
    /// Data-terminal-ready (local output)
    pub dtr: bool,
    /// Data-set-ready (peer input)
    pub dsr: bool,
    /// Bytes waiting in the input buffer
    pub bytes_waiting_in: u32,
    /// Bytes waiting in the output buffer
    pub bytes_waiting_out: u32,
    /// Whether the link was open when sampled
    pub is_open: bool,
}

impl fmt::Display for ControlSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "open={} rts={} cts={} dtr={} dsr={} in={} out={}",
            self.is_open,
            self.rts,
            self.cts,
            self.dtr,
            self.dsr,
            self.bytes_waiting_in,
            self.bytes_waiting_out
        )
    }
}
