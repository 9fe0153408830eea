//! Read/write turn coordination
//!
//! The [`TurnCoordinator`] owns the link and hands it out one turn at a time.
//! A turn is either a read turn or a write turn; holding a [`Turn`] is the only
//! way to reach the link, and dropping it returns the coordinator to
//! [`TurnState::Idle`].
//!
//! State machine:
//!
//! ```text
//!            acquire_read            acquire_write
//!  ReadHeld <------------- Idle -------------> WriteHeld
//!           -------------->     <-------------
//!              release                release
//! ```
//!
//! Waiting writers enter before a waiting reader, so an interactive command
//! goes out ahead of the reader's next poll. After `write_burst_limit`
//! consecutive write turns with a reader waiting, the reader gets the next
//! turn.

use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::link::{ControlSignals, Link};
use crate::Result;

/// Which actor, if any, holds the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnState {
    /// Nobody holds the link
    Idle,
    /// The reader holds the link
    ReadHeld,
    /// The writer holds the link
    WriteHeld,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Idle => write!(f, "idle"),
            TurnState::ReadHeld => write!(f, "read"),
            TurnState::WriteHeld => write!(f, "write"),
        }
    }
}

/// Kind of turn held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// Read turn
    Read,
    /// Write turn
    Write,
}

/// Acquire/release counters.
///
/// Counts every turn granted through the coordinator, including the write
/// turn a session takes to open the link at start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnStats {
    /// Read turns granted
    pub read_acquired: u64,
    /// Read turns returned
    pub read_released: u64,
    /// Write turns granted, the opening turn included
    pub write_acquired: u64,
    /// Write turns returned
    pub write_released: u64,
}

impl TurnStats {
    /// Whether every granted turn has been returned
    pub fn balanced(&self) -> bool {
        self.read_acquired == self.read_released && self.write_acquired == self.write_released
    }
}

struct Turns {
    state: TurnState,
    waiting_readers: usize,
    waiting_writers: usize,
    /// Write turns granted since the last read turn
    write_burst: u32,
    stats: TurnStats,
}

impl Turns {
    fn reader_may_enter(&self, burst_limit: u32) -> bool {
        self.state == TurnState::Idle
            && (self.waiting_writers == 0 || self.write_burst >= burst_limit)
    }

    fn writer_may_enter(&self, burst_limit: u32) -> bool {
        self.state == TurnState::Idle
            && (self.waiting_readers == 0 || self.write_burst < burst_limit)
    }
}

/// Mutual exclusion between the reader and the writer over one link
pub struct TurnCoordinator<L> {
    turns: Mutex<Turns>,
    changed: Condvar,
    link: Mutex<L>,
    burst_limit: u32,
    closed: AtomicBool,
    /// Close handed to the current turn holder
    close_deferred: AtomicBool,
}

impl<L: Link> TurnCoordinator<L> {
    /// Take ownership of a link
    pub fn new(link: L, write_burst_limit: u32) -> Self {
        Self {
            turns: Mutex::new(Turns {
                state: TurnState::Idle,
                waiting_readers: 0,
                waiting_writers: 0,
                write_burst: 0,
                stats: TurnStats::default(),
            }),
            changed: Condvar::new(),
            link: Mutex::new(link),
            burst_limit: write_burst_limit.max(1),
            closed: AtomicBool::new(false),
            close_deferred: AtomicBool::new(false),
        }
    }

    fn lock_turns(&self) -> MutexGuard<'_, Turns> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_link(&self) -> MutexGuard<'_, L> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the read turn is granted
    pub fn acquire_read(&self) -> Turn<'_, L> {
        let mut turns = self.lock_turns();
        turns.waiting_readers += 1;
        while !turns.reader_may_enter(self.burst_limit) {
            turns = self
                .changed
                .wait(turns)
                .unwrap_or_else(PoisonError::into_inner);
        }
        turns.waiting_readers -= 1;
        turns.state = TurnState::ReadHeld;
        turns.write_burst = 0;
        turns.stats.read_acquired += 1;
        drop(turns);
        tracing::trace!("read turn acquired");

        Turn {
            coordinator: self,
            kind: TurnKind::Read,
            link: self.lock_link(),
        }
    }

    /// Block until the write turn is granted
    pub fn acquire_write(&self) -> Turn<'_, L> {
        let mut turns = self.lock_turns();
        turns.waiting_writers += 1;
        while !turns.writer_may_enter(self.burst_limit) {
            turns = self
                .changed
                .wait(turns)
                .unwrap_or_else(PoisonError::into_inner);
        }
        turns.waiting_writers -= 1;
        turns.state = TurnState::WriteHeld;
        turns.write_burst = turns.write_burst.saturating_add(1);
        turns.stats.write_acquired += 1;
        drop(turns);
        tracing::trace!("write turn acquired");

        Turn {
            coordinator: self,
            kind: TurnKind::Write,
            link: self.lock_link(),
        }
    }

    fn release(&self, kind: TurnKind) {
        let mut turns = self.lock_turns();
        match kind {
            TurnKind::Read => {
                debug_assert_eq!(turns.state, TurnState::ReadHeld);
                turns.stats.read_released += 1;
            }
            TurnKind::Write => {
                debug_assert_eq!(turns.state, TurnState::WriteHeld);
                turns.stats.write_released += 1;
            }
        }
        turns.state = TurnState::Idle;
        drop(turns);
        self.changed.notify_all();
        tracing::trace!(?kind, "turn released");
    }

    /// Current holder of the link
    pub fn state(&self) -> TurnState {
        self.lock_turns().state
    }

    /// Acquire/release counters
    pub fn stats(&self) -> TurnStats {
        self.lock_turns().stats
    }

    /// Sample control lines without taking a turn.
    ///
    /// Returns `Ok(None)` while a turn holder is using the link. The snapshot
    /// is racy and must never gate a read or write decision.
    pub fn peek_signals(&self) -> Result<Option<ControlSignals>> {
        match self.link.try_lock() {
            Ok(mut link) => link.signals().map(Some),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().signals().map(Some),
            Err(TryLockError::WouldBlock) => Ok(None),
        }
    }

    /// Close the link without waiting for it past `deadline`. Only the first
    /// call reaches the link.
    ///
    /// If a turn holder still has the link at the deadline, the close is left
    /// to that turn and happens when it is released. Returns `true` only when
    /// this call closed the link itself.
    pub fn close_link_by(&self, deadline: Instant) -> Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        loop {
            match self.link.try_lock() {
                Ok(mut link) => return link.close().map(|()| true),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return poisoned.into_inner().close().map(|()| true)
                }
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TryLockError::WouldBlock) => break,
            }
        }

        self.close_deferred.store(true, Ordering::Release);
        // The holder may have let go between the last attempt and the store
        if let Ok(mut link) = self.link.try_lock() {
            if self.close_deferred.swap(false, Ordering::AcqRel) {
                return link.close().map(|()| true);
            }
        }
        tracing::warn!("link busy at shutdown, closing when the current turn ends");
        Ok(false)
    }

    /// Whether [`close_link_by`](Self::close_link_by) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Display name of the owned link
    pub fn link_name(&self) -> String {
        self.lock_link().name().to_string()
    }
}

/// A held read or write turn. Dereferences to the link.
pub struct Turn<'a, L: Link> {
    coordinator: &'a TurnCoordinator<L>,
    kind: TurnKind,
    link: MutexGuard<'a, L>,
}

impl<L: Link> Turn<'_, L> {
    /// Kind of turn held
    pub fn kind(&self) -> TurnKind {
        self.kind
    }

    /// Give the turn back
    pub fn release(self) {}
}

impl<L: Link> Deref for Turn<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.link
    }
}

impl<L: Link> DerefMut for Turn<'_, L> {
    fn deref_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

impl<L: Link> Drop for Turn<'_, L> {
    fn drop(&mut self) {
        if self.coordinator.close_deferred.swap(false, Ordering::AcqRel) {
            match self.link.close() {
                Ok(()) => tracing::info!(device = %self.link.name(), "link closed after turn"),
                Err(e) => tracing::warn!(error = %e, "deferred link close failed"),
            }
        }
        self.coordinator.release(self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_transitions_pass_through_idle() {
        let coordinator = TurnCoordinator::new(MockLink::new(), 4);
        assert_eq!(coordinator.state(), TurnState::Idle);

        let read = coordinator.acquire_read();
        assert_eq!(coordinator.state(), TurnState::ReadHeld);
        read.release();
        assert_eq!(coordinator.state(), TurnState::Idle);

        let write = coordinator.acquire_write();
        assert_eq!(coordinator.state(), TurnState::WriteHeld);
        drop(write);
        assert_eq!(coordinator.state(), TurnState::Idle);

        assert!(coordinator.stats().balanced());
    }

    #[test]
    fn test_turn_gives_link_access() {
        let link = MockLink::new();
        let handle = link.handle();
        let coordinator = TurnCoordinator::new(link, 4);

        let mut write = coordinator.acquire_write();
        write.write(b"AT\r\n").unwrap();
        drop(write);
        assert_eq!(handle.written(), b"AT\r\n".to_vec());
    }

    #[test]
    fn test_writer_blocks_while_reader_holds() {
        let coordinator = Arc::new(TurnCoordinator::new(MockLink::new(), 4));
        let read = coordinator.acquire_read();

        let remote = Arc::clone(&coordinator);
        let writer = thread::spawn(move || {
            let turn = remote.acquire_write();
            remote.state() == TurnState::WriteHeld && turn.kind() == TurnKind::Write
        });

        thread::sleep(Duration::from_millis(30));
        assert_eq!(coordinator.state(), TurnState::ReadHeld);
        drop(read);
        assert!(writer.join().unwrap());
        assert_eq!(coordinator.state(), TurnState::Idle);
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let coordinator = Arc::new(TurnCoordinator::new(MockLink::new(), 2));
        let active = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for i in 0..6 {
            let coordinator = Arc::clone(&coordinator);
            let active = Arc::clone(&active);
            let violations = Arc::clone(&violations);
            workers.push(thread::spawn(move || {
                for _ in 0..200 {
                    let turn = if i % 2 == 0 {
                        coordinator.acquire_read()
                    } else {
                        coordinator.acquire_write()
                    };
                    if active.fetch_add(1, Ordering::SeqCst) != 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    let expected = match turn.kind() {
                        TurnKind::Read => TurnState::ReadHeld,
                        TurnKind::Write => TurnState::WriteHeld,
                    };
                    if coordinator.state() != expected {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(turn);
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        let stats = coordinator.stats();
        assert!(stats.balanced());
        assert_eq!(stats.read_acquired, 600);
        assert_eq!(stats.write_acquired, 600);
    }

    #[test]
    fn test_waiting_reader_gets_turn_after_burst() {
        let coordinator = Arc::new(TurnCoordinator::new(MockLink::new(), 2));
        let write = coordinator.acquire_write();

        let remote = Arc::clone(&coordinator);
        let reader = thread::spawn(move || {
            let _turn = remote.acquire_read();
            remote.stats().write_acquired
        });

        // Queue a second writer behind the first
        let remote = Arc::clone(&coordinator);
        let writer = thread::spawn(move || {
            let _turn = remote.acquire_write();
        });

        thread::sleep(Duration::from_millis(30));
        drop(write);

        writer.join().unwrap();
        let writes_before_read = reader.join().unwrap();
        assert!(writes_before_read <= 2);
        assert!(coordinator.stats().balanced());
    }

    #[test]
    fn test_turn_released_on_panic() {
        let coordinator = Arc::new(TurnCoordinator::new(MockLink::new(), 4));
        let remote = Arc::clone(&coordinator);
        let result = thread::spawn(move || {
            let _turn = remote.acquire_write();
            panic!("writer failed mid-turn");
        })
        .join();
        assert!(result.is_err());

        assert_eq!(coordinator.state(), TurnState::Idle);
        let _read = coordinator.acquire_read();
        assert_eq!(coordinator.stats().write_released, 1);
    }

    #[test]
    fn test_close_deferred_to_busy_turn() {
        let mut link = MockLink::new();
        link.open().unwrap();
        let handle = link.handle();
        let coordinator = TurnCoordinator::new(link, 4);

        let turn = coordinator.acquire_read();
        let started = Instant::now();
        assert!(!coordinator
            .close_link_by(Instant::now() + Duration::from_millis(20))
            .unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(coordinator.is_closed());
        assert_eq!(handle.close_calls(), 0);

        drop(turn);
        assert_eq!(handle.close_calls(), 1);
        assert!(!handle.is_open());

        // Later turns see a closed link and nothing closes it again
        let mut turn = coordinator.acquire_read();
        assert!(turn.bytes_to_read().is_err());
        drop(turn);
        assert_eq!(handle.close_calls(), 1);
    }

    #[test]
    fn test_close_link_once() {
        let link = MockLink::new();
        let handle = link.handle();
        let coordinator = TurnCoordinator::new(link, 4);
        assert!(coordinator.close_link_by(Instant::now()).unwrap());
        assert!(!coordinator.close_link_by(Instant::now()).unwrap());
        assert!(coordinator.is_closed());
        assert_eq!(handle.close_calls(), 1);
    }

    #[test]
    fn test_peek_signals_while_turn_held() {
        let mut link = MockLink::new();
        link.open().unwrap();
        link.handle().push_rx(b"OK\r\n");
        let coordinator = TurnCoordinator::new(link, 4);

        let turn = coordinator.acquire_read();
        assert!(coordinator.peek_signals().unwrap().is_none());
        drop(turn);

        let signals = coordinator.peek_signals().unwrap().unwrap();
        assert_eq!(signals.bytes_waiting_in, 4);
    }
}
