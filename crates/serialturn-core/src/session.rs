//! Session lifecycle
//!
//! A [`Session`] owns the link (through its turn coordinator), the stop signal
//! and the two worker threads. Everything the workers need lives in one shared
//! context handed to the loop functions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::SessionConfig;
use crate::flow::FlowGate;
use crate::link::{ControlSignals, Link};
use crate::reader::{self, ReaderState, SharedReaderState, Subscribers};
use crate::stop::StopSignal;
use crate::turn::{TurnCoordinator, TurnState, TurnStats};
use crate::writer::{self, CommandSource, WriteOutcome};
use crate::{Result, TransportError};

/// State shared between a session and its worker threads
pub(crate) struct SessionContext<L> {
    pub(crate) coordinator: TurnCoordinator<L>,
    pub(crate) stop: StopSignal,
    pub(crate) config: SessionConfig,
    pub(crate) gate: FlowGate,
    pub(crate) subscribers: Subscribers,
    pub(crate) reader_state: SharedReaderState,
    paused: AtomicBool,
    fault: Mutex<Option<TransportError>>,
}

impl<L: Link> SessionContext<L> {
    /// Record a loop-fatal error and bring the session down.
    ///
    /// Only the first fault is kept.
    pub(crate) fn fail(&self, error: TransportError) {
        {
            let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
            if fault.is_none() {
                *fault = Some(error);
            }
        }
        self.stop.set();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn take_fault(&self) -> Option<TransportError> {
        self.fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Running worker threads
struct Workers {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    done: Receiver<&'static str>,
}

/// Reports a worker's exit, including by panic
struct ExitNotice {
    name: &'static str,
    tx: Sender<&'static str>,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(self.name);
    }
}

/// A half-duplex serial session: one reader thread, one writer thread, one link.
///
/// Line handlers registered with [`on_line`](Session::on_line) run on the
/// reader thread while it holds the read turn. They must not call
/// [`write`](Session::write) (the write turn cannot be granted until they
/// return); feed a [`ChannelSource`](crate::writer::ChannelSource) instead.
pub struct Session<L: Link + 'static> {
    ctx: Arc<SessionContext<L>>,
    workers: Mutex<Option<Workers>>,
    started: AtomicBool,
}

impl<L: Link + 'static> Session<L> {
    /// Create a session over `link`. The configuration is validated here, so
    /// a bad configuration never reaches the loops.
    pub fn new(link: L, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let gate = FlowGate::new(&config.flow);
        let coordinator = TurnCoordinator::new(link, config.write_burst_limit);

        Ok(Self {
            ctx: Arc::new(SessionContext {
                coordinator,
                stop: StopSignal::new(),
                config,
                gate,
                subscribers: Subscribers::default(),
                reader_state: SharedReaderState::default(),
                paused: AtomicBool::new(false),
                fault: Mutex::new(None),
            }),
            workers: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// Register a handler for each completed line
    pub fn on_line<F>(&self, callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.ctx.subscribers.add_line(Box::new(callback));
    }

    /// Register a handler for each raw chunk (raw framing mode only)
    pub fn on_chunk<F>(&self, callback: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.ctx.subscribers.add_chunk(Box::new(callback));
    }

    /// Open the link and start the reader and a writer fed by `source`
    pub fn start<S>(&self, source: S) -> Result<()>
    where
        S: CommandSource + 'static,
    {
        self.launch(Some(Box::new(source)))
    }

    /// Open the link and start only the reader.
    ///
    /// Commands are then sent by the caller through [`write`](Session::write),
    /// which makes the calling thread the session's writer.
    pub fn start_reader(&self) -> Result<()> {
        self.launch(None)
    }

    fn launch(&self, source: Option<Box<dyn CommandSource>>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Configuration(
                "session already started".to_string(),
            ));
        }

        let ctx = &self.ctx;
        if ctx.coordinator.is_closed() {
            return Err(TransportError::LinkClosed);
        }
        ctx.stop.clear();
        let device = ctx.coordinator.link_name();

        {
            let mut turn = ctx.coordinator.acquire_write();
            if let Err(e) = turn.open().and_then(|()| ctx.gate.prepare(&mut *turn)) {
                drop(turn);
                tracing::error!(%device, error = %e, "failed to open link");
                ctx.stop.set();
                return Err(e);
            }
        }
        tracing::info!(%device, flow_gate = ctx.gate.is_enabled(), "link open");

        let (done_tx, done) = mpsc::channel();
        let mut handles = Vec::with_capacity(2);

        let reader_ctx = Arc::clone(ctx);
        let notice = ExitNotice {
            name: "reader",
            tx: done_tx.clone(),
        };
        let reader = thread::Builder::new()
            .name("serialturn-reader".to_string())
            .spawn(move || {
                let _notice = notice;
                reader::run(&reader_ctx);
            });
        match reader {
            Ok(handle) => handles.push(("reader", handle)),
            Err(e) => {
                ctx.stop.set();
                return Err(TransportError::Io(e));
            }
        }

        if let Some(source) = source {
            let writer_ctx = Arc::clone(ctx);
            let notice = ExitNotice {
                name: "writer",
                tx: done_tx,
            };
            let writer = thread::Builder::new()
                .name("serialturn-writer".to_string())
                .spawn(move || {
                    let _notice = notice;
                    writer::run(&writer_ctx, source);
                });
            match writer {
                Ok(handle) => handles.push(("writer", handle)),
                Err(e) => {
                    ctx.stop.set();
                    *self.lock_workers() = Some(Workers { handles, done });
                    return Err(TransportError::Io(e));
                }
            }
        }

        *self.lock_workers() = Some(Workers { handles, done });
        Ok(())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Option<Workers>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send one command from the calling thread.
    ///
    /// Blocks for the write turn. The stop sentinel stops the session and
    /// returns [`WriteOutcome::Stop`] without writing.
    pub fn write(&self, command: &str) -> Result<WriteOutcome> {
        writer::transmit(&self.ctx, command)
    }

    /// Send one command and read up to `response_len` reply bytes before
    /// anyone else gets the link.
    ///
    /// The read is bounded by the link's read timeout, so a short reply comes
    /// back truncated rather than blocking. Pair with
    /// [`pause_reader`](Session::pause_reader) for a run of such exchanges.
    pub fn exchange(&self, command: &str, response_len: usize) -> Result<Vec<u8>> {
        writer::exchange(&self.ctx, command, response_len)
    }

    /// Stop the reader from taking read turns.
    ///
    /// Input stays buffered in the driver and is delivered after
    /// [`resume_reader`](Session::resume_reader). A read turn already held
    /// finishes first.
    pub fn pause_reader(&self) {
        if !self.ctx.paused.swap(true, Ordering::AcqRel) {
            tracing::debug!("reader paused");
        }
    }

    /// Let the reader take read turns again
    pub fn resume_reader(&self) {
        if self.ctx.paused.swap(false, Ordering::AcqRel) {
            tracing::debug!("reader resumed");
        }
    }

    /// Whether the reader has been paused
    pub fn is_reader_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    /// Racy control-line snapshot; `None` while a turn holder has the link
    pub fn signals(&self) -> Result<Option<ControlSignals>> {
        self.ctx.coordinator.peek_signals()
    }

    /// Control-line snapshot taken under the read turn
    pub fn sample_signals(&self) -> Result<ControlSignals> {
        let mut turn = self.ctx.coordinator.acquire_read();
        turn.signals()
    }

    /// Block until the session is asked to stop
    pub fn wait(&self) {
        self.ctx.stop.wait();
    }

    /// Handle to the stop signal, for stopping from another context
    pub fn stop_signal(&self) -> StopSignal {
        self.ctx.stop.clone()
    }

    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        self.ctx.stop.is_set()
    }

    /// Current reader loop state
    pub fn reader_state(&self) -> ReaderState {
        self.ctx.reader_state.get()
    }

    /// Current holder of the link
    pub fn turn_state(&self) -> TurnState {
        self.ctx.coordinator.state()
    }

    /// Turn acquire/release counters
    pub fn turn_stats(&self) -> TurnStats {
        self.ctx.coordinator.stats()
    }

    /// Configuration in effect
    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    /// Stop both loops and close the link.
    ///
    /// Safe to call any number of times from any thread; the link is closed
    /// exactly once. Workers that do not finish within the join timeout are
    /// detached, and if one of them still holds a turn the close happens when
    /// that turn ends. Returns the error that brought the session down, if a loop
    /// failed.
    pub fn stop(&self) -> Result<()> {
        let mut workers = self.lock_workers();
        if self.ctx.stop.set() {
            tracing::info!("stop requested");
        }

        let deadline = Instant::now() + self.ctx.config.join_timeout();
        if let Some(running) = workers.take() {
            self.join(running, deadline);
        }
        drop(workers);

        // A detached worker may still hold a turn; never wait past the deadline
        if self.ctx.coordinator.close_link_by(deadline)? {
            tracing::info!(device = %self.ctx.coordinator.link_name(), "link closed");
        }

        match self.ctx.take_fault() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn join(&self, workers: Workers, deadline: Instant) {
        let mut remaining = workers.handles.len();

        while remaining > 0 {
            let wait = deadline.saturating_duration_since(Instant::now());
            match workers.done.recv_timeout(wait) {
                Ok(name) => {
                    tracing::debug!(worker = name, "worker exited");
                    remaining -= 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for (name, handle) in workers.handles {
            if handle.is_finished() {
                if handle.join().is_err() {
                    tracing::error!(worker = name, "worker panicked");
                }
            } else {
                tracing::warn!(
                    worker = name,
                    timeout = ?self.ctx.config.join_timeout(),
                    "worker did not stop in time, detaching"
                );
            }
        }
    }
}

impl<L: Link + 'static> Drop for Session<L> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::debug!(error = %e, "session dropped after failure");
        }
    }
}
