//! Reader loop
//!
//! Runs on its own thread for the life of a session. Each cycle takes the read
//! turn, drains whatever the driver has buffered, frames it and hands the
//! results to subscribers before giving the turn back. When nothing is waiting
//! it releases the turn and sleeps for the poll interval.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::FrameMode;
use crate::framer::LineFramer;
use crate::link::Link;
use crate::session::SessionContext;
use crate::TransportError;

/// Reader loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReaderState {
    /// Not polling: not started yet, or sleeping between polls
    Idle,
    /// Holding the read turn, checking for input
    Polling,
    /// Holding the read turn, draining and delivering input
    Draining,
    /// Paused by the session; no read turns are taken
    Paused,
    /// Stop observed, loop finished
    Stopped,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReaderState::Polling,
            2 => ReaderState::Draining,
            3 => ReaderState::Stopped,
            4 => ReaderState::Paused,
            _ => ReaderState::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ReaderState::Idle => 0,
            ReaderState::Polling => 1,
            ReaderState::Draining => 2,
            ReaderState::Stopped => 3,
            ReaderState::Paused => 4,
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderState::Idle => "idle",
            ReaderState::Polling => "polling",
            ReaderState::Draining => "draining",
            ReaderState::Stopped => "stopped",
            ReaderState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Atomically shared [`ReaderState`]
#[derive(Debug, Default)]
pub(crate) struct SharedReaderState(AtomicU8);

impl SharedReaderState {
    pub(crate) fn get(&self) -> ReaderState {
        ReaderState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ReaderState) {
        let previous = self.0.swap(state.as_u8(), Ordering::AcqRel);
        if previous != state.as_u8() {
            tracing::trace!(%state, "reader state");
        }
    }
}

/// Handler invoked for each completed line
pub type LineCallback = Box<dyn FnMut(&str) + Send>;

/// Handler invoked for each raw chunk
pub type ChunkCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Registered line and chunk handlers
#[derive(Default)]
pub(crate) struct Subscribers {
    lines: Mutex<Vec<LineCallback>>,
    chunks: Mutex<Vec<ChunkCallback>>,
}

impl Subscribers {
    pub(crate) fn add_line(&self, callback: LineCallback) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn add_chunk(&self, callback: ChunkCallback) {
        self.chunks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    pub(crate) fn emit_line(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in lines.iter_mut() {
            callback(line);
        }
    }

    pub(crate) fn emit_chunk(&self, chunk: &[u8]) {
        let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in chunks.iter_mut() {
            callback(chunk);
        }
    }
}

/// Body of the reader thread
pub(crate) fn run<L: Link>(ctx: &SessionContext<L>) {
    let config = &ctx.config;
    let mut framer = LineFramer::new(config.framer.delimiter, config.framer.max_line_len);
    let poll_interval = config.poll_interval();

    tracing::info!(mode = ?config.framer.mode, ?poll_interval, "reader started");

    while !ctx.stop.is_set() {
        if ctx.is_paused() {
            ctx.reader_state.set(ReaderState::Paused);
            ctx.stop.wait_timeout(poll_interval);
            continue;
        }

        ctx.reader_state.set(ReaderState::Polling);
        let mut turn = ctx.coordinator.acquire_read();
        // Paused while queued for the turn
        if ctx.is_paused() {
            drop(turn);
            continue;
        }

        let waiting = match turn.bytes_to_read() {
            Ok(waiting) => waiting,
            Err(e) => {
                drop(turn);
                if !recover(ctx, e) {
                    break;
                }
                ctx.reader_state.set(ReaderState::Idle);
                ctx.stop.wait_timeout(poll_interval);
                continue;
            }
        };

        if waiting == 0 {
            drop(turn);
            ctx.reader_state.set(ReaderState::Idle);
            ctx.stop.wait_timeout(poll_interval);
            continue;
        }

        ctx.reader_state.set(ReaderState::Draining);
        if config.verbose {
            if let Ok(signals) = turn.signals() {
                tracing::debug!(%signals, "before read");
            }
        }

        match turn.read_available() {
            Ok(bytes) => {
                tracing::trace!(bytes = bytes.len(), "drained");
                match config.framer.mode {
                    FrameMode::Lines => {
                        for line in framer.feed(&bytes) {
                            tracing::debug!(%line, "rx");
                            ctx.subscribers.emit_line(&line);
                        }
                    }
                    FrameMode::Raw => ctx.subscribers.emit_chunk(&bytes),
                }
                if config.verbose {
                    if let Ok(signals) = turn.signals() {
                        tracing::debug!(%signals, "after read");
                    }
                }
                drop(turn);
            }
            Err(e) => {
                drop(turn);
                if !recover(ctx, e) {
                    break;
                }
                ctx.reader_state.set(ReaderState::Idle);
                ctx.stop.wait_timeout(poll_interval);
            }
        }
    }

    if let Some(line) = framer.flush() {
        tracing::debug!(%line, "rx (unterminated)");
        ctx.subscribers.emit_line(&line);
    }
    ctx.reader_state.set(ReaderState::Stopped);
    tracing::info!("reader stopped");
}

/// Decide whether the loop survives an error. Returns `false` to exit.
fn recover<L: Link>(ctx: &SessionContext<L>, error: TransportError) -> bool {
    if !error.is_fatal() {
        tracing::warn!(%error, "read error, retrying");
        return true;
    }
    if ctx.stop.is_set() {
        // Shutdown closed the link under us
        tracing::debug!(%error, "read failed during shutdown");
        return false;
    }
    tracing::error!(%error, "reader failed");
    ctx.fail(error);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_state_round_trip() {
        let shared = SharedReaderState::default();
        assert_eq!(shared.get(), ReaderState::Idle);
        for state in [
            ReaderState::Polling,
            ReaderState::Draining,
            ReaderState::Paused,
            ReaderState::Idle,
            ReaderState::Stopped,
        ] {
            shared.set(state);
            assert_eq!(shared.get(), state);
        }
    }

    #[test]
    fn test_subscribers_receive_in_registration_order() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&seen);
        subscribers.add_line(Box::new(move |line| {
            first.lock().unwrap().push(format!("first:{line}"))
        }));
        let second = Arc::clone(&seen);
        subscribers.add_line(Box::new(move |line| {
            second.lock().unwrap().push(format!("second:{line}"))
        }));

        subscribers.emit_line("OK");
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:OK".to_string(), "second:OK".to_string()]
        );
    }

    #[test]
    fn test_chunk_subscribers() {
        let subscribers = Subscribers::default();
        let total = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&total);
        subscribers.add_chunk(Box::new(move |chunk| *counter.lock().unwrap() += chunk.len()));
        subscribers.emit_chunk(&[0xC0, 0x01, 0xC0]);
        assert_eq!(*total.lock().unwrap(), 3);
    }
}
