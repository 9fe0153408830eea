//! Shutdown and turn accounting under concurrency

use serialturn_core::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("serialturn_core=debug")
        .with_test_writer()
        .try_init();
}

fn config() -> SessionConfig {
    init_tracing();
    let mut config = SessionConfig::for_device("mock");
    config.poll_interval_ms = 1;
    config.join_timeout_ms = 1000;
    config
}

#[test]
fn test_concurrent_stop_closes_link_once() {
    let link = MockLink::new();
    let handle = link.handle();
    let session = Arc::new(Session::new(link, config()).unwrap());
    let (tx, source) = ChannelSource::channel();
    session.start(source).unwrap();
    tx.send("AT".to_string()).unwrap();
    thread::sleep(Duration::from_millis(20));

    let started = Instant::now();
    let stoppers: Vec<_> = (0..2)
        .map(|_| {
            let session = Arc::clone(&session);
            thread::spawn(move || session.stop())
        })
        .collect();
    for stopper in stoppers {
        stopper.join().unwrap().unwrap();
    }

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.close_calls(), 1);
    assert!(!handle.is_open());
    assert_eq!(session.reader_state(), ReaderState::Stopped);

    session.stop().unwrap();
    assert_eq!(handle.close_calls(), 1);
}

#[test]
fn test_stop_interrupts_unbounded_cts_wait() {
    let link = MockLink::new();
    let handle = link.handle();
    let mut config = config();
    config.flow.enabled = true;
    config.flow.cts_timeout_ms = None;

    let session = Session::new(link, config).unwrap();
    session.start(QueueSource::new(["AT"])).unwrap();

    // The writer is now spinning on CTS while holding the write turn
    let deadline = Instant::now() + Duration::from_secs(2);
    while session.turn_state() != TurnState::WriteHeld && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(session.turn_state(), TurnState::WriteHeld);

    let started = Instant::now();
    session.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(handle.written().is_empty());
    assert!(!handle.rts());
    assert_eq!(session.turn_state(), TurnState::Idle);
}

#[test]
fn test_no_turn_leaks_under_faults() {
    let link = MockLink::at_modem();
    let handle = link.handle();
    let mut config = config();
    config.flow.enabled = true;
    config.flow.cts_timeout_ms = Some(5);

    let session = Arc::new(Session::new(link, config).unwrap());
    let (tx, source) = ChannelSource::channel();
    session.start(source).unwrap();

    // Alternate between a ready and a silent peer while faults are injected
    for i in 0..40 {
        handle.set_auto_cts(i % 3 != 0);
        if i % 5 == 0 {
            handle.fail_next_writes(1);
        }
        if i % 7 == 0 {
            handle.fail_next_reads(2);
        }
        tx.send(format!("AT+N={i}")).unwrap();
        if i % 4 == 0 {
            let _ = session.write("AT");
        }
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(50));

    session.stop().unwrap();
    let stats = session.turn_stats();
    assert!(stats.balanced(), "unbalanced turns: {:?}", stats);
    assert!(stats.write_acquired > 0);
    assert!(stats.read_acquired > 0);
    assert_eq!(session.turn_state(), TurnState::Idle);
    assert!(!handle.rts());
}

#[test]
fn test_writer_blocked_on_source_is_detached() {
    struct Stuck;

    impl CommandSource for Stuck {
        fn next_command(&mut self, _stop: &StopSignal) -> Option<String> {
            thread::sleep(Duration::from_secs(3));
            None
        }
    }

    let link = MockLink::new();
    let handle = link.handle();
    let mut config = config();
    config.join_timeout_ms = 50;

    let session = Session::new(link, config).unwrap();
    session.start(Stuck).unwrap();

    let started = Instant::now();
    session.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handle.close_calls(), 1);
}

#[test]
fn test_stop_bounded_while_handler_holds_read_turn() {
    let link = MockLink::new();
    let handle = link.handle();
    let mut config = config();
    config.join_timeout_ms = 50;

    let session = Session::new(link, config).unwrap();
    let entered = StopSignal::new();
    let signal = entered.clone();
    session.on_line(move |_| {
        signal.set();
        thread::sleep(Duration::from_millis(1500));
    });
    session.start_reader().unwrap();
    handle.push_rx(b"RING\r\n");
    assert!(entered.wait_timeout(Duration::from_secs(2)));
    assert_eq!(session.turn_state(), TurnState::ReadHeld);

    let started = Instant::now();
    session.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(handle.close_calls(), 0);

    // The close happens once the handler lets go of the turn
    let deadline = Instant::now() + Duration::from_secs(5);
    while (handle.close_calls() == 0 || session.turn_state() != TurnState::Idle)
        && Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(handle.close_calls(), 1);
    assert!(!handle.is_open());
    assert_eq!(session.turn_state(), TurnState::Idle);
}
