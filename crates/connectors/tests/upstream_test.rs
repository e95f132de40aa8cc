//! Upstream connector tests against a fake upstream source.
//!
//! The fake upstream is a plain blocking `TcpListener` on an ephemeral port;
//! the operator runs through `OperatorDriver` exactly as a host would drive
//! it.
//!
//! Run with: cargo test -p sluice-connectors --test upstream_test

use sluice_api::prelude::*;
use sluice_connectors::upstream::{
    adopt_addresses, decode, Address, Command, ConnectionStatusListener, DataMessage,
    ReconnectConfig, RecoveryMarker, StaticDiscovery, UpstreamConfig, UpstreamInput,
};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

struct FakeUpstream {
    listener: TcpListener,
}

impl FakeUpstream {
    fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        Self { listener }
    }

    fn address(&self) -> Address {
        Address::new("127.0.0.1", self.listener.local_addr().unwrap().port())
    }

    fn accept(&self) -> Peer {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
                    return Peer { stream };
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock && Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("connector did not connect: {}", e),
            }
        }
    }
}

struct Peer {
    stream: TcpStream,
}

impl Peer {
    fn read_frame(&mut self) -> Vec<u8> {
        let mut length = [0u8; 4];
        self.stream.read_exact(&mut length).unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(length) as usize];
        self.stream.read_exact(&mut body).unwrap();
        body
    }

    fn read_command(&mut self) -> Command {
        Command::decode(&self.read_frame()).unwrap()
    }

    fn write_frame(&mut self, body: &[u8]) {
        self.stream.write_all(&(body.len() as u32).to_be_bytes()).unwrap();
        self.stream.write_all(body).unwrap();
    }

    fn send(&mut self, offset: i64, payload: &str) {
        self.write_frame(&DataMessage::new(offset, payload.to_string()).to_bytes());
    }
}

fn config(address: Address) -> UpstreamConfig {
    UpstreamConfig::new(address)
        .with_idle_backoff(Duration::from_millis(1))
        .with_reconnect(ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..Default::default()
        })
}

fn driver(address: Address, collector: &Collector<String>) -> OperatorDriver<UpstreamInput<String>> {
    let mut input = UpstreamInput::new(config(address), decode::utf8());
    input.output.connect(collector.sink());
    OperatorDriver::new(input, OperatorContext::new(1, "upstream"))
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Emit until `count` records were collected. Must be called inside a window.
fn emit_until(driver: &mut OperatorDriver<UpstreamInput<String>>, collector: &Collector<String>, count: usize) {
    let deadline = Instant::now() + TIMEOUT;
    while collector.len() < count {
        assert!(Instant::now() < deadline, "records not delivered in time");
        driver.emit_tuples().unwrap();
    }
}

fn shutdown(driver: &mut OperatorDriver<UpstreamInput<String>>) {
    driver.deactivate().unwrap();
    driver.teardown().unwrap();
}

#[test]
fn test_seek_from_beginning_on_first_connect() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut driver = driver(upstream.address(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    assert_eq!(peer.read_command(), Command::Seek { offset: 0 });
    wait_until(|| driver.operator().is_connected());

    shutdown(&mut driver);
}

#[test]
fn test_end_to_end_emit_and_commit() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut driver = driver(upstream.address(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    assert_eq!(peer.read_command(), Command::Seek { offset: 0 });
    peer.send(42, "hello");

    driver.begin_window(1).unwrap();
    emit_until(&mut driver, &collector, 1);
    driver.end_window().unwrap();

    assert_eq!(collector.drain(), vec!["hello"]);
    assert_eq!(
        driver.operator().ledger().latest(),
        Some(&RecoveryMarker::new(1, 42))
    );
    match peer.read_command() {
        Command::Windowed { event_count, .. } => assert_eq!(event_count, 1),
        other => panic!("expected WINDOWED, got {}", other),
    }

    let batch = driver.take_stats();
    let status = batch.latest_custom_stats().unwrap();
    assert!(status.connected);
    assert_eq!(status.address(), upstream.address());

    driver.committed(1).unwrap();
    assert_eq!(peer.read_command(), Command::Committed { offset: 42 });
    assert!(driver.operator().ledger().is_empty());

    shutdown(&mut driver);
}

#[test]
fn test_commit_sends_only_the_committed_window_offset() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut driver = driver(upstream.address(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    peer.read_command();
    for (window_id, offset) in [(1, 100), (2, 150), (3, 200)] {
        peer.send(offset, &format!("event-{}", offset));
        driver.begin_window(window_id).unwrap();
        emit_until(&mut driver, &collector, window_id as usize);
        driver.end_window().unwrap();
        assert!(matches!(peer.read_command(), Command::Windowed { event_count: 1, .. }));
    }

    driver.committed(2).unwrap();
    assert_eq!(peer.read_command(), Command::Committed { offset: 150 });
    assert_eq!(driver.operator().ledger().len(), 1);
    assert_eq!(
        driver.operator().ledger().latest(),
        Some(&RecoveryMarker::new(3, 200))
    );
    assert_eq!(driver.operator().origin_offset(), 150);

    // window 1 was pruned silently, so the next command is the next window
    driver.run_window(4, 1).unwrap();
    assert_eq!(
        peer.read_command(),
        Command::Windowed {
            event_count: 0,
            idle_count: 1
        }
    );

    shutdown(&mut driver);
}

#[test]
fn test_disconnect_during_blocked_handover_fails_the_window() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut input = UpstreamInput::new(
        config(upstream.address()).with_handover_capacity(1),
        decode::utf8(),
    );
    input.output.connect(collector.sink());
    let mut driver = OperatorDriver::new(input, OperatorContext::new(1, "upstream"));
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    peer.read_command();
    peer.send(1, "queued");
    peer.send(2, "blocked");
    wait_until(|| driver.operator().pending() == 1);
    // give the event loop time to read the second frame and block on the full queue
    std::thread::sleep(Duration::from_millis(100));

    driver.deactivate().unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(peer.stream.read(&mut buf).unwrap(), 0);

    driver.activate().unwrap();
    driver.begin_window(1).unwrap();
    let mut result = Ok(());
    wait_until(|| {
        result = driver.emit_tuples();
        result.is_err()
    });
    assert!(matches!(result, Err(sluice_api::Error::Fatal(_))));
    assert_eq!(driver.state(), LifecycleState::Failed);
    assert!(!collector.drain().contains(&"blocked".to_string()));

    shutdown(&mut driver);
}

#[test]
fn test_idle_ticks_are_reported() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut driver = driver(upstream.address(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    peer.read_command();
    wait_until(|| driver.operator().is_connected());

    driver.run_window(1, 5).unwrap();
    assert_eq!(
        peer.read_command(),
        Command::Windowed {
            event_count: 0,
            idle_count: 5
        }
    );
    assert!(collector.is_empty());

    shutdown(&mut driver);
}

#[test]
fn test_reconnect_seeks_newest_marker() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut driver = driver(upstream.address(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    peer.read_command();
    for (window_id, offset) in [(1, 10), (2, 20)] {
        peer.send(offset, &format!("event-{}", offset));
        driver.begin_window(window_id).unwrap();
        emit_until(&mut driver, &collector, window_id as usize);
        driver.end_window().unwrap();
    }
    driver.committed(1).unwrap();

    drop(peer);
    let mut peer = upstream.accept();
    assert_eq!(peer.read_command(), Command::Seek { offset: 20 });
    wait_until(|| driver.operator().is_connected());

    // replayed from the resume point
    peer.send(20, "event-20");
    peer.send(21, "event-21");
    driver.begin_window(3).unwrap();
    emit_until(&mut driver, &collector, 4);
    driver.end_window().unwrap();
    assert_eq!(
        collector.drain(),
        vec!["event-10", "event-20", "event-20", "event-21"]
    );
    assert_eq!(
        driver.operator().ledger().latest(),
        Some(&RecoveryMarker::new(3, 21))
    );

    shutdown(&mut driver);
}

#[test]
fn test_malformed_frame_forces_reconnect() {
    let upstream = FakeUpstream::bind();
    let collector = Collector::new();
    let mut driver = driver(upstream.address(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    peer.read_command();
    peer.send(5, "fine");
    peer.write_frame(&[0, 0, 1]);

    let mut peer = upstream.accept();
    assert_eq!(peer.read_command(), Command::Seek { offset: 0 });

    driver.begin_window(1).unwrap();
    emit_until(&mut driver, &collector, 1);
    driver.end_window().unwrap();
    assert_eq!(collector.drain(), vec!["fine"]);

    shutdown(&mut driver);
}

#[test]
fn test_recovered_instance_seeks_checkpointed_offset() {
    let upstream = FakeUpstream::bind();
    let backend = MemoryStateBackend::new();
    let collector = Collector::new();

    let mut first = driver(upstream.address(), &collector);
    first.setup().unwrap();
    first.activate().unwrap();
    let mut peer = upstream.accept();
    peer.read_command();
    peer.send(7, "seven");
    first.begin_window(1).unwrap();
    emit_until(&mut first, &collector, 1);
    first.end_window().unwrap();
    first.checkpoint(1, &backend).unwrap();
    shutdown(&mut first);
    drop(peer);

    let fresh = UpstreamInput::new(UpstreamConfig::default(), decode::utf8());
    let (mut recovered, window) =
        OperatorDriver::recover(fresh, OperatorContext::new(1, "upstream"), &backend).unwrap();
    assert_eq!(window, Some(1));
    assert_eq!(recovered.operator().connect_addresses(), &[upstream.address()]);

    recovered.setup().unwrap();
    recovered.activate().unwrap();
    let mut peer = upstream.accept();
    assert_eq!(peer.read_command(), Command::Seek { offset: 7 });
    assert!(recovered.begin_window(1).is_err());

    shutdown(&mut recovered);
}

#[test]
fn test_lost_upstream_triggers_adoption_of_discovered_address() {
    let upstream = FakeUpstream::bind();
    let address = upstream.address();
    let collector = Collector::new();
    let mut driver = driver(address.clone(), &collector);
    driver.setup().unwrap();
    driver.activate().unwrap();

    let mut peer = upstream.accept();
    peer.read_command();
    peer.send(3, "last");
    driver.begin_window(1).unwrap();
    emit_until(&mut driver, &collector, 1);
    driver.end_window().unwrap();

    drop(peer);
    drop(upstream);
    wait_until(|| !driver.operator().is_connected());
    driver.run_window(2, 1).unwrap();

    let replacement = Address::new("127.0.0.1", 1);
    let mut listener =
        ConnectionStatusListener::new(StaticDiscovery::new(vec![address.clone(), replacement.clone()]));
    let response = listener.process_stats(&driver.take_stats());
    assert!(response.repartition_required);
    assert_eq!(response.discovered, vec![replacement.clone()]);
    assert!(!listener.status(1).unwrap().connected);

    // reported again until the address is known to be served
    let again = listener.process_stats(&driver.take_stats());
    assert_eq!(again.discovered, vec![replacement.clone()]);

    shutdown(&mut driver);
    let mut partitions = vec![Partition::new(driver.into_operator())];
    assert_eq!(adopt_addresses(&mut partitions, &response.discovered).unwrap(), 1);
    assert_eq!(partitions[1].instance().connect_addresses(), &[replacement]);
    assert!(partitions[1].instance().ledger().is_empty());
    assert_eq!(partitions[0].instance().resume_offset(), 3);

    listener.add_known(response.discovered);
    let settled = listener.process_stats(&BatchedOperatorStats::new(1, Vec::new()));
    assert!(!settled.repartition_required);
}
