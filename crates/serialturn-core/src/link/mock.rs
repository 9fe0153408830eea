//! In-memory link for tests and demo mode
//!
//! [`MockLink`] behaves like an open serial port whose peer is scripted
//! through a [`MockHandle`]: inbound bytes, CTS level and injected faults are
//! set from the handle, and everything the link wrote can be inspected there.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Link;
use crate::{Result, TransportError};

/// Produces peer output in response to bytes written to the link
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    closed: bool,
    open_calls: usize,
    close_calls: usize,
    fail_open: Option<String>,
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    writes: Vec<Vec<u8>>,
    flushes: usize,
    rts: bool,
    rts_history: Vec<bool>,
    cts: bool,
    auto_cts: bool,
    dsr: bool,
    transient_reads: usize,
    transient_writes: usize,
    write_fault: Option<String>,
    rts_on_open: bool,
    responder: Option<Responder>,
}

/// In-memory [`Link`]
pub struct MockLink {
    name: String,
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockLink`]
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLink {
    /// Create a closed mock link
    pub fn new() -> Self {
        Self::named("mock")
    }

    /// Create a closed mock link with a display name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// A mock peer that answers each terminated command like an AT modem:
    /// the command is echoed, followed by `OK`.
    pub fn at_modem() -> Self {
        let link = Self::named("demo");
        let mut pending: Vec<u8> = Vec::new();
        link.handle().set_responder(move |bytes| {
            pending.extend_from_slice(bytes);
            let mut reply = Vec::new();
            while let Some(pos) = pending.iter().position(|&b| b == b'\r' || b == b'\n') {
                let command: Vec<u8> = pending.drain(..=pos).collect();
                let command = &command[..command.len() - 1];
                if command.is_empty() {
                    continue;
                }
                reply.extend_from_slice(command);
                reply.extend_from_slice(b"\r\nOK\r\n");
            }
            (!reply.is_empty()).then_some(reply)
        });
        link
    }

    /// Handle for scripting and inspecting this link
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn ensure_open(state: &mut MockState) -> Result<()> {
        if state.closed {
            return Err(TransportError::LinkClosed);
        }
        if !state.open {
            state.open_calls += 1;
            if let Some(reason) = &state.fail_open {
                return Err(TransportError::LinkUnavailable {
                    device: "mock".to_string(),
                    reason: reason.clone(),
                });
            }
            state.open = true;
            if state.rts_on_open {
                state.rts = true;
            }
        }
        Ok(())
    }
}

impl Link for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.open {
            return Ok(());
        }
        state.closed = false;
        Self::ensure_open(&mut state)
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn close(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        state.close_calls += 1;
        state.open = false;
        state.closed = true;
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        if let Some(reason) = &state.write_fault {
            return Err(TransportError::Serial(reason.clone()));
        }
        if state.transient_writes > 0 {
            state.transient_writes -= 1;
            return Err(TransportError::from_io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "mock driver busy",
            )));
        }
        state.tx.extend_from_slice(bytes);
        state.writes.push(bytes.to_vec());
        let reply = state.responder.as_mut().and_then(|respond| respond(bytes));
        if let Some(reply) = reply {
            state.rx.extend(reply);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        state.flushes += 1;
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        if state.transient_reads > 0 {
            state.transient_reads -= 1;
            return Err(TransportError::from_io(io::Error::new(
                io::ErrorKind::TimedOut,
                "mock read timed out",
            )));
        }
        Ok(state.rx.drain(..).collect())
    }

    fn read_exact(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        let n = size.min(state.rx.len());
        Ok(state.rx.drain(..n).collect())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        Ok(state.rx.len() as u32)
    }

    fn bytes_to_write(&mut self) -> Result<u32> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        Ok(0)
    }

    fn rts(&self) -> bool {
        lock(&self.state).rts
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        state.rts = level;
        state.rts_history.push(level);
        if state.auto_cts {
            state.cts = level;
        }
        Ok(())
    }

    fn cts(&mut self) -> Result<bool> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        Ok(state.cts)
    }

    fn dsr(&mut self) -> Result<bool> {
        let mut state = lock(&self.state);
        Self::ensure_open(&mut state)?;
        Ok(state.dsr)
    }
}

impl MockHandle {
    /// Queue bytes as if the peer had sent them
    pub fn push_rx(&self, bytes: &[u8]) {
        lock(&self.state).rx.extend(bytes.iter().copied());
    }

    /// Every byte written so far
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).tx.clone()
    }

    /// Each write call's payload, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Number of flush calls
    pub fn flushes(&self) -> usize {
        lock(&self.state).flushes
    }

    /// Drive the peer's CTS output
    pub fn set_cts(&self, level: bool) {
        lock(&self.state).cts = level;
    }

    /// Mirror RTS onto CTS, like a peer that is always ready
    pub fn set_auto_cts(&self, enabled: bool) {
        lock(&self.state).auto_cts = enabled;
    }

    /// Drive the peer's DSR output
    pub fn set_dsr(&self, level: bool) {
        lock(&self.state).dsr = level;
    }

    /// Current RTS level
    pub fn rts(&self) -> bool {
        lock(&self.state).rts
    }

    /// Every RTS level written, in order
    pub fn rts_history(&self) -> Vec<bool> {
        lock(&self.state).rts_history.clone()
    }

    /// Fail the next `n` reads with a transient error
    pub fn fail_next_reads(&self, n: usize) {
        lock(&self.state).transient_reads = n;
    }

    /// Fail the next `n` writes with a transient error
    pub fn fail_next_writes(&self, n: usize) {
        lock(&self.state).transient_writes = n;
    }

    /// Fail every write from now on with a driver error
    pub fn fail_writes_with(&self, reason: impl Into<String>) {
        lock(&self.state).write_fault = Some(reason.into());
    }

    /// Raise RTS when the device opens, the way most OS drivers do
    pub fn raise_rts_on_open(&self) {
        lock(&self.state).rts_on_open = true;
    }

    /// Make opening fail as if the device did not exist
    pub fn fail_open(&self, reason: impl Into<String>) {
        lock(&self.state).fail_open = Some(reason.into());
    }

    /// Install a peer that replies to written bytes
    pub fn set_responder<F>(&self, respond: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(respond));
    }

    /// Whether the link is currently open
    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Number of times the device was actually opened (or attempted)
    pub fn open_calls(&self) -> usize {
        lock(&self.state).open_calls
    }

    /// Number of close calls
    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    /// Close the link from the peer side; later I/O fails with `LinkClosed`
    pub fn hang_up(&self) {
        let mut state = lock(&self.state);
        state.open = false;
        state.closed = true;
    }
}
