//! Writer loop and command sources
//!
//! The writer pulls commands from a [`CommandSource`], and for each one takes
//! the write turn, runs the flow gate handshake, writes the command with its
//! line ending and flushes. The stop sentinel `q` ends the session without
//! touching the link.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::link::Link;
use crate::session::SessionContext;
use crate::stop::StopSignal;
use crate::{Result, TransportError};

/// Command that stops the session instead of being transmitted
pub const STOP_SENTINEL: &str = "q";

/// Whether a command is the stop sentinel
pub fn is_sentinel(command: &str) -> bool {
    command.trim().eq_ignore_ascii_case(STOP_SENTINEL)
}

/// Result of handing one command to the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The command and its line ending reached the driver
    Sent {
        /// Bytes written, line ending included
        bytes: usize,
    },
    /// The command was the stop sentinel; nothing was written
    Stop,
}

/// Where the writer loop gets its commands
pub trait CommandSource: Send {
    /// Next command to transmit, or `None` once the source is exhausted.
    ///
    /// Implementations that wait for input should give up and return `None`
    /// once `stop` is raised.
    fn next_command(&mut self, stop: &StopSignal) -> Option<String>;
}

impl<S: CommandSource + ?Sized> CommandSource for Box<S> {
    fn next_command(&mut self, stop: &StopSignal) -> Option<String> {
        (**self).next_command(stop)
    }
}

/// A fixed list of commands
#[derive(Debug, Clone, Default)]
pub struct QueueSource {
    commands: VecDeque<String>,
}

impl QueueSource {
    /// Queue commands in order
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
        }
    }

    /// Append a command
    pub fn push(&mut self, command: impl Into<String>) {
        self.commands.push_back(command.into());
    }

    /// Commands not yet taken
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether every command has been taken
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl CommandSource for QueueSource {
    fn next_command(&mut self, _stop: &StopSignal) -> Option<String> {
        self.commands.pop_front()
    }
}

/// Commands fed from other threads through a channel.
///
/// This is also how a line handler answers the peer: handlers run inside the
/// read turn and must not call [`Session::write`](crate::session::Session::write)
/// themselves, but they can push into the channel.
pub struct ChannelSource {
    rx: Receiver<String>,
    poll: Duration,
}

impl ChannelSource {
    /// Wrap an existing receiver
    pub fn new(rx: Receiver<String>) -> Self {
        Self {
            rx,
            poll: Duration::from_millis(50),
        }
    }

    /// Create a connected sender and source
    pub fn channel() -> (Sender<String>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self::new(rx))
    }
}

impl CommandSource for ChannelSource {
    fn next_command(&mut self, stop: &StopSignal) -> Option<String> {
        loop {
            if stop.is_set() {
                return None;
            }
            match self.rx.recv_timeout(self.poll) {
                Ok(command) => return Some(command),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Write one command under the write turn.
///
/// The turn is released on every path, and RTS is dropped again whenever the
/// handshake raised it.
pub(crate) fn transmit<L: Link>(ctx: &SessionContext<L>, command: &str) -> Result<WriteOutcome> {
    if is_sentinel(command) {
        tracing::info!("stop sentinel received");
        ctx.stop.set();
        return Ok(WriteOutcome::Stop);
    }

    let payload = ctx.config.line_ending.encode(command);
    let mut turn = ctx.coordinator.acquire_write();
    let sent = send(ctx, &mut *turn, &payload);
    drop(turn);

    sent?;
    tracing::debug!(%command, bytes = payload.len(), "tx");
    Ok(WriteOutcome::Sent {
        bytes: payload.len(),
    })
}

/// Send a command and read up to `response_len` reply bytes in the same
/// write turn, so the reader cannot take the reply first.
///
/// The stop sentinel stops the session and yields [`TransportError::Stopped`].
pub(crate) fn exchange<L: Link>(
    ctx: &SessionContext<L>,
    command: &str,
    response_len: usize,
) -> Result<Vec<u8>> {
    if is_sentinel(command) {
        tracing::info!("stop sentinel received");
        ctx.stop.set();
        return Err(TransportError::Stopped);
    }

    let payload = ctx.config.line_ending.encode(command);
    let mut turn = ctx.coordinator.acquire_write();
    let reply = send(ctx, &mut *turn, &payload).and_then(|()| turn.read_exact(response_len));
    drop(turn);

    let reply = reply?;
    tracing::debug!(%command, sent = payload.len(), received = reply.len(), "exchange");
    Ok(reply)
}

/// Gate, write, flush and settle on a link the caller holds the write turn for
fn send<L: Link>(ctx: &SessionContext<L>, link: &mut L, payload: &[u8]) -> Result<()> {
    if ctx.config.verbose {
        if let Ok(signals) = link.signals() {
            tracing::debug!(%signals, "before write");
        }
    }

    ctx.gate.before_write(link, &ctx.stop)?;

    let written = link.write(payload).and_then(|()| link.flush());
    if written.is_ok() {
        if let Some(settle) = ctx.config.settle() {
            ctx.stop.wait_timeout(settle);
        }
    }
    let lowered = ctx.gate.after_write(link);

    if ctx.config.verbose {
        if let Ok(signals) = link.signals() {
            tracing::debug!(%signals, "after write");
        }
    }

    written?;
    lowered
}

/// Body of the writer thread
pub(crate) fn run<L: Link>(ctx: &SessionContext<L>, mut source: Box<dyn CommandSource>) {
    tracing::info!(line_ending = %ctx.config.line_ending, "writer started");

    while !ctx.stop.is_set() {
        let Some(command) = source.next_command(&ctx.stop) else {
            tracing::info!("command source exhausted");
            break;
        };
        if ctx.stop.is_set() {
            break;
        }

        match transmit(ctx, &command) {
            Ok(WriteOutcome::Sent { .. }) => {}
            Ok(WriteOutcome::Stop) | Err(TransportError::Stopped) => break,
            Err(error) if error.is_fatal() => {
                if !ctx.stop.is_set() {
                    tracing::error!(%error, "writer failed");
                    ctx.fail(error);
                }
                break;
            }
            Err(error) => {
                tracing::warn!(%error, %command, "command not sent");
            }
        }
    }

    tracing::info!("writer stopped");
}
