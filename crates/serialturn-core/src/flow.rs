//! RTS/CTS flow gate around writes
//!
//! When enabled, every write is bracketed by a handshake: RTS is asserted, the
//! gate waits for the peer to raise CTS, the data goes out, then RTS drops.
//! When disabled, both halves return immediately. The gate only touches
//! control lines, never the data stream.

use std::time::{Duration, Instant};

use crate::config::FlowGateConfig;
use crate::link::Link;
use crate::stop::StopSignal;
use crate::{Result, TransportError};

/// Software RTS/CTS handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowGate {
    enabled: bool,
    cts_timeout: Option<Duration>,
    poll: Duration,
}

impl FlowGate {
    /// Build a gate from configuration
    pub fn new(config: &FlowGateConfig) -> Self {
        Self {
            enabled: config.enabled,
            cts_timeout: config.cts_timeout_ms.map(Duration::from_millis),
            poll: Duration::from_micros(config.cts_poll_us),
        }
    }

    /// A pass-through gate
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            cts_timeout: None,
            poll: Duration::ZERO,
        }
    }

    /// An enabled gate
    pub fn enabled(cts_timeout: Option<Duration>) -> Self {
        Self {
            enabled: true,
            cts_timeout,
            poll: Duration::ZERO,
        }
    }

    /// Whether the handshake is performed
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Put RTS in its idle (deasserted) state
    pub fn prepare<L: Link + ?Sized>(&self, link: &mut L) -> Result<()> {
        if self.enabled && link.rts() {
            link.set_rts(false)?;
            tracing::debug!(device = %link.name(), "RTS deasserted, link idle");
        }
        Ok(())
    }

    /// Request to send and wait for the peer to clear us.
    ///
    /// Without a CTS timeout this waits until CTS rises or `stop` is raised.
    /// On failure RTS is deasserted again before returning.
    pub fn before_write<L: Link + ?Sized>(&self, link: &mut L, stop: &StopSignal) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        link.set_rts(true)?;
        tracing::debug!(device = %link.name(), "RTS asserted, waiting for CTS");

        match self.wait_for_cts(link, stop) {
            Ok(waited) => {
                tracing::debug!(device = %link.name(), waited_us = waited.as_micros() as u64, "CTS asserted");
                Ok(())
            }
            Err(e) => {
                if let Err(release) = link.set_rts(false) {
                    tracing::warn!(device = %link.name(), error = %release, "failed to deassert RTS");
                }
                Err(e)
            }
        }
    }

    /// Drop the request to send
    pub fn after_write<L: Link + ?Sized>(&self, link: &mut L) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        link.set_rts(false)?;
        tracing::debug!(device = %link.name(), "RTS deasserted");
        Ok(())
    }

    fn wait_for_cts<L: Link + ?Sized>(&self, link: &mut L, stop: &StopSignal) -> Result<Duration> {
        let started = Instant::now();
        loop {
            if link.cts()? {
                return Ok(started.elapsed());
            }
            if stop.is_set() {
                return Err(TransportError::Stopped);
            }
            if let Some(timeout) = self.cts_timeout {
                if started.elapsed() >= timeout {
                    tracing::warn!(device = %link.name(), ?timeout, "peer never asserted CTS");
                    return Err(TransportError::FlowControlTimeout(timeout));
                }
            }
            if self.poll.is_zero() {
                std::thread::yield_now();
            } else {
                std::thread::sleep(self.poll);
            }
        }
    }
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use pretty_assertions::assert_eq;
    use std::thread;

    #[test]
    fn test_disabled_gate_leaves_lines_alone() {
        let mut link = MockLink::new();
        let handle = link.handle();
        let gate = FlowGate::disabled();
        let stop = StopSignal::new();

        gate.before_write(&mut link, &stop).unwrap();
        gate.after_write(&mut link).unwrap();
        assert!(handle.rts_history().is_empty());
    }

    #[test]
    fn test_handshake_with_ready_peer() {
        let mut link = MockLink::new();
        let handle = link.handle();
        handle.set_auto_cts(true);
        let gate = FlowGate::enabled(None);
        let stop = StopSignal::new();

        gate.before_write(&mut link, &stop).unwrap();
        assert!(handle.rts());
        gate.after_write(&mut link).unwrap();
        assert_eq!(handle.rts_history(), vec![true, false]);
    }

    #[test]
    fn test_waits_for_late_cts() {
        let mut link = MockLink::new();
        let handle = link.handle();
        let gate = FlowGate::enabled(Some(Duration::from_secs(5)));
        let stop = StopSignal::new();

        let peer = handle.clone();
        let raiser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            peer.set_cts(true);
        });

        gate.before_write(&mut link, &stop).unwrap();
        raiser.join().unwrap();
        assert!(handle.rts());
    }

    #[test]
    fn test_timeout_deasserts_rts() {
        let mut link = MockLink::new();
        let handle = link.handle();
        let gate = FlowGate::enabled(Some(Duration::from_millis(20)));
        let stop = StopSignal::new();

        let err = gate.before_write(&mut link, &stop).unwrap_err();
        assert!(matches!(err, TransportError::FlowControlTimeout(_)));
        assert!(!handle.rts());
        assert_eq!(handle.rts_history(), vec![true, false]);
    }

    #[test]
    fn test_stop_interrupts_unbounded_wait() {
        let mut link = MockLink::new();
        let gate = FlowGate::enabled(None);
        let stop = StopSignal::new();

        let remote = stop.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set();
        });

        let err = gate.before_write(&mut link, &stop).unwrap_err();
        assert!(matches!(err, TransportError::Stopped));
        stopper.join().unwrap();
    }

    #[test]
    fn test_prepare_deasserts_rts() {
        let mut link = MockLink::new();
        let handle = link.handle();
        link.set_rts(true).unwrap();
        FlowGate::enabled(None).prepare(&mut link).unwrap();
        assert!(!handle.rts());
    }

    #[test]
    fn test_from_config() {
        let gate = FlowGate::new(&FlowGateConfig {
            enabled: true,
            cts_timeout_ms: Some(250),
            cts_poll_us: 100,
        });
        assert!(gate.is_enabled());
        assert_eq!(gate.cts_timeout, Some(Duration::from_millis(250)));
        assert_eq!(gate.poll, Duration::from_micros(100));
    }
}
