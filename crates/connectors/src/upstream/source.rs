//! The upstream input operator.
//!
//! [`UpstreamInput`] implements the host contract on top of an
//! [`EventLoop`] connection. The processing thread only ever touches the
//! handover receiver, the ledger and the window counters; the event loop
//! only sees the resume position and the connectivity flag.

use super::codec::Command;
use super::config::{Address, UpstreamConfig};
use super::connection::{Client, Connection, EventLoop, FailureSlot, ResumePosition, StatusSink};
use super::decode::DecodeFn;
use super::handover::{self, HandoverReceiver, HandoverSender};
use super::ledger::{RecoveryLedger, RecoveryMarker};
use super::status::ConnectionStatus;
use serde::{Deserialize, Serialize};
use sluice_api::{InputOperator, OperatorContext, OutputPort, Snapshot};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Event and idle counts of one window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowCounters {
    pub window_id: u64,
    pub event_count: u32,
    pub idle_count: u32,
}

/// Persistent state of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCheckpoint {
    pub connect_addresses: Vec<Address>,
    pub ledger: RecoveryLedger,
    /// Offset to resume from when the ledger is empty.
    pub origin_offset: i64,
}

struct Window {
    counters: WindowCounters,
    marker: RecoveryMarker,
}

/// Resources held between `setup` and `teardown`.
struct Runtime<T> {
    event_loop: EventLoop,
    sender: HandoverSender<T>,
    handover: HandoverReceiver<T>,
    resume: ResumePosition,
    failure: FailureSlot,
    status: Arc<dyn StatusSink>,
}

/// Recoverable input operator reading from one upstream address.
pub struct UpstreamInput<T> {
    /// Decoded records, in upstream order.
    pub output: OutputPort<T>,
    config: UpstreamConfig,
    decode: DecodeFn<T>,
    ledger: RecoveryLedger,
    origin_offset: i64,
    /// Offset of the newest emitted record, carried into the next window.
    last_offset: i64,
    window: Option<Window>,
    last_window: Option<WindowCounters>,
    runtime: Option<Runtime<T>>,
    connection: Option<Connection>,
}

impl<T: Send + 'static> UpstreamInput<T> {
    pub fn new(config: UpstreamConfig, decode: DecodeFn<T>) -> Self {
        Self {
            output: OutputPort::new(),
            config,
            decode,
            ledger: RecoveryLedger::new(),
            origin_offset: 0,
            last_offset: 0,
            window: None,
            last_window: None,
            runtime: None,
            connection: None,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    pub fn connect_addresses(&self) -> &[Address] {
        &self.config.connect_addresses
    }

    pub fn ledger(&self) -> &RecoveryLedger {
        &self.ledger
    }

    pub fn origin_offset(&self) -> i64 {
        self.origin_offset
    }

    /// Offset sent with `SEEK` on the next (re)connect: the newest ledger
    /// marker, or the origin offset when the ledger is empty.
    pub fn resume_offset(&self) -> i64 {
        self.ledger
            .latest()
            .map_or(self.origin_offset, |m| m.last_offset)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_connected)
    }

    /// Counters of the window in progress.
    pub fn current_window(&self) -> Option<&WindowCounters> {
        self.window.as_ref().map(|w| &w.counters)
    }

    /// Counters of the most recently ended window.
    pub fn last_window(&self) -> Option<&WindowCounters> {
        self.last_window.as_ref()
    }

    /// Payloads waiting in the handover queue.
    pub fn pending(&self) -> usize {
        self.runtime.as_ref().map_or(0, |r| r.handover.len())
    }

    pub fn checkpoint_state(&self) -> UpstreamCheckpoint {
        UpstreamCheckpoint {
            connect_addresses: self.config.connect_addresses.clone(),
            ledger: self.ledger.clone(),
            origin_offset: self.origin_offset,
        }
    }

    pub fn restore_state(&mut self, checkpoint: UpstreamCheckpoint) {
        self.config.connect_addresses = checkpoint.connect_addresses;
        self.ledger = checkpoint.ledger;
        self.origin_offset = checkpoint.origin_offset;
        self.last_offset = self.resume_offset();
        self.publish_resume();
    }

    /// A fresh, not yet set up instance bound to `address` with the given
    /// recovery state. Configuration and decoder are shared with `self`.
    pub(crate) fn spawn_partition(
        &self,
        address: Address,
        ledger: RecoveryLedger,
        origin_offset: i64,
    ) -> Self {
        let config = self.config.clone().with_addresses(vec![address]);
        let mut instance = Self::new(config, self.decode.clone());
        instance.ledger = ledger;
        instance.origin_offset = origin_offset;
        instance.last_offset = instance.resume_offset();
        instance
    }

    fn publish_resume(&self) {
        if let Some(runtime) = &self.runtime {
            runtime.resume.set(self.resume_offset());
        }
    }

    fn check_failure(&self) -> sluice_api::Result<()> {
        match self.runtime.as_ref().and_then(|r| r.failure.take()) {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn idle_tick(&mut self) {
        if let Some(window) = self.window.as_mut() {
            window.counters.idle_count = window.counters.idle_count.saturating_add(1);
        }
        if !self.config.idle_backoff.is_zero() {
            std::thread::sleep(self.config.idle_backoff);
        }
    }
}

impl<T: Send + 'static> InputOperator for UpstreamInput<T> {
    type Stats = ConnectionStatus;

    fn setup(&mut self, ctx: &OperatorContext<ConnectionStatus>) -> sluice_api::Result<()> {
        let event_loop = EventLoop::start(format!("EventLoop-{}", ctx.id()))?;
        let (sender, handover) = handover::channel(self.config.handover_capacity);
        self.runtime = Some(Runtime {
            event_loop,
            sender,
            handover,
            resume: ResumePosition::new(self.resume_offset()),
            failure: FailureSlot::default(),
            status: Arc::new(ctx.clone()),
        });
        info!(
            operator = ctx.id(),
            capacity = self.config.handover_capacity,
            resume_offset = self.resume_offset(),
            "upstream input set up"
        );
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
        if let Some(runtime) = self.runtime.take() {
            let Runtime {
                event_loop,
                mut handover,
                ..
            } = runtime;
            handover.close();
            event_loop.stop();
        }
    }

    fn activate(&mut self, ctx: &OperatorContext<ConnectionStatus>) -> sluice_api::Result<()> {
        let address = self.config.single_address()?.clone();
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| sluice_api::Error::Runtime("activate before setup".to_string()))?;

        let resume_offset = self.resume_offset();
        runtime.resume.set(resume_offset);
        let client = Client {
            address: address.clone(),
            decode: self.decode.clone(),
            handover: runtime.sender.clone(),
            resume: runtime.resume.clone(),
            status: runtime.status.clone(),
            failure: runtime.failure.clone(),
        };
        self.connection = Some(runtime.event_loop.connect(client, &self.config)?);
        info!(operator = ctx.id(), address = %address, resume_offset, "upstream input activated");
        Ok(())
    }

    fn deactivate(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect();
        }
        if let Some(window) = self.window.take() {
            warn!(window_id = window.counters.window_id, "deactivated inside a window");
        }
    }

    fn begin_window(&mut self, window_id: u64) {
        self.window = Some(Window {
            counters: WindowCounters {
                window_id,
                ..Default::default()
            },
            marker: RecoveryMarker::new(window_id, self.last_offset),
        });
    }

    fn emit_tuples(&mut self) -> sluice_api::Result<()> {
        self.check_failure()?;
        let (Some(runtime), Some(window)) = (self.runtime.as_mut(), self.window.as_mut()) else {
            return Ok(());
        };

        let mut drained: u32 = 0;
        for payload in runtime.handover.drain() {
            self.output.emit(payload.record);
            window.marker.last_offset = payload.location;
            drained += 1;
        }

        if drained == 0 {
            self.idle_tick();
        } else {
            window.counters.event_count = window.counters.event_count.saturating_add(drained);
            self.last_offset = window.marker.last_offset;
        }
        Ok(())
    }

    fn end_window(&mut self) -> sluice_api::Result<()> {
        self.check_failure()?;
        let Some(Window { counters, marker }) = self.window.take() else {
            return Ok(());
        };

        if let Some(connection) = &self.connection {
            connection.write(Command::Windowed {
                event_count: counters.event_count,
                idle_count: counters.idle_count,
            });
        }
        self.ledger.append(marker);
        self.publish_resume();
        self.last_window = Some(counters);

        debug!(
            window_id = counters.window_id,
            events = counters.event_count,
            idle = counters.idle_count,
            last_offset = marker.last_offset,
            "window ended"
        );
        Ok(())
    }

    fn handle_idle_time(&mut self) -> sluice_api::Result<()> {
        self.check_failure()?;
        self.idle_tick();
        Ok(())
    }

    fn checkpointed(&mut self, window_id: u64) {
        debug!(window_id, markers = self.ledger.len(), "checkpointed");
    }

    fn committed(&mut self, window_id: u64) {
        let outcome = self.ledger.commit(window_id);
        if let Some(discarded) = outcome.last_discarded {
            self.origin_offset = self.origin_offset.max(discarded.last_offset);
        }
        if let Some(marker) = outcome.exact {
            let sent = self.connection.as_ref().is_some_and(|c| {
                c.write(Command::Committed {
                    offset: marker.last_offset,
                })
            });
            debug!(window_id, offset = marker.last_offset, sent, "window committed");
        }
        self.publish_resume();
    }
}

impl<T: Send + 'static> Snapshot for UpstreamInput<T> {
    fn snapshot(&self) -> sluice_api::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.checkpoint_state())?)
    }

    fn restore(&mut self, data: &[u8]) -> sluice_api::Result<()> {
        let checkpoint: UpstreamCheckpoint = serde_json::from_slice(data)?;
        self.restore_state(checkpoint);
        Ok(())
    }
}

impl<T> std::fmt::Debug for UpstreamInput<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamInput")
            .field("connect_addresses", &self.config.connect_addresses)
            .field("ledger", &self.ledger)
            .field("origin_offset", &self.origin_offset)
            .field("set_up", &self.runtime.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::decode;
    use crate::upstream::error::Error;
    use crate::upstream::handover::Payload;
    use sluice_api::{Collector, OperatorDriver};
    use std::time::Duration;

    fn input() -> UpstreamInput<String> {
        let config = UpstreamConfig::new(Address::new("127.0.0.1", 1)).with_idle_backoff(Duration::ZERO);
        UpstreamInput::new(config, decode::utf8())
    }

    fn hand_over(input: &UpstreamInput<String>, offsets: &[i64]) {
        let sender = input.runtime.as_ref().unwrap().sender.clone();
        futures::executor::block_on(async {
            for &offset in offsets {
                sender
                    .put(Payload::new(format!("event-{}", offset), offset))
                    .await
                    .unwrap();
            }
        });
    }

    #[test]
    fn test_window_records_marker_and_counters() {
        let collector = Collector::new();
        let mut input = input();
        input.output.connect(collector.sink());
        input.setup(&OperatorContext::new(1, "upstream")).unwrap();

        input.begin_window(1);
        hand_over(&input, &[40, 41, 42]);
        input.emit_tuples().unwrap();
        input.emit_tuples().unwrap();
        input.end_window().unwrap();

        assert_eq!(collector.drain(), vec!["event-40", "event-41", "event-42"]);
        assert_eq!(
            input.last_window(),
            Some(&WindowCounters {
                window_id: 1,
                event_count: 3,
                idle_count: 1
            })
        );
        assert_eq!(input.ledger().latest(), Some(&RecoveryMarker::new(1, 42)));
        assert_eq!(input.resume_offset(), 42);

        // an empty window carries the previous offset forward
        input.begin_window(2);
        input.emit_tuples().unwrap();
        input.end_window().unwrap();
        assert_eq!(input.ledger().latest(), Some(&RecoveryMarker::new(2, 42)));

        input.teardown();
    }

    #[test]
    fn test_commit_prunes_and_moves_origin() {
        let mut input = input();
        input.setup(&OperatorContext::new(1, "upstream")).unwrap();
        for (window, offset) in [(1, 100), (2, 150), (3, 200)] {
            input.begin_window(window);
            hand_over(&input, &[offset]);
            input.emit_tuples().unwrap();
            input.end_window().unwrap();
        }

        // not connected: pruned without sending anything
        input.committed(2);
        assert_eq!(input.ledger().len(), 1);
        assert_eq!(input.origin_offset(), 150);
        assert_eq!(input.resume_offset(), 200);

        input.committed(3);
        assert!(input.ledger().is_empty());
        assert_eq!(input.resume_offset(), 200);
        assert_eq!(input.runtime.as_ref().unwrap().resume.get(), 200);

        input.teardown();
    }

    #[test]
    fn test_commit_past_every_marker_keeps_resume_offset() {
        let mut input = input();
        input.setup(&OperatorContext::new(1, "upstream")).unwrap();
        for (window, offset) in [(1, 100), (2, 150)] {
            input.begin_window(window);
            hand_over(&input, &[offset]);
            input.emit_tuples().unwrap();
            input.end_window().unwrap();
        }

        input.committed(3);
        assert!(input.ledger().is_empty());
        assert_eq!(input.origin_offset(), 150);
        assert_eq!(input.resume_offset(), 150);
        assert_eq!(input.runtime.as_ref().unwrap().resume.get(), 150);

        input.teardown();
    }

    #[test]
    fn test_snapshot_restores_ledger_and_resume_offset() {
        let mut input = input();
        input.setup(&OperatorContext::new(1, "upstream")).unwrap();
        input.begin_window(7);
        hand_over(&input, &[9]);
        input.emit_tuples().unwrap();
        input.end_window().unwrap();
        let data = input.snapshot().unwrap();
        input.teardown();

        let mut restored = UpstreamInput::new(UpstreamConfig::default(), decode::utf8());
        restored.restore(&data).unwrap();
        assert_eq!(restored.connect_addresses(), &[Address::new("127.0.0.1", 1)]);
        assert_eq!(restored.ledger().latest(), Some(&RecoveryMarker::new(7, 9)));
        assert_eq!(restored.resume_offset(), 9);

        let checkpoint = restored.checkpoint_state();
        assert_eq!(checkpoint.origin_offset, 0);
        assert!(restored.restore(b"{not json").is_err());
    }

    #[test]
    fn test_activate_requires_exactly_one_address() {
        let config = UpstreamConfig::default()
            .with_addresses(vec![Address::new("a", 1), Address::new("b", 2)]);
        let mut driver = OperatorDriver::new(
            UpstreamInput::new(config, decode::utf8()),
            OperatorContext::new(3, "upstream"),
        );
        driver.setup().unwrap();
        assert!(matches!(driver.activate(), Err(sluice_api::Error::Config(_))));
        driver.teardown().unwrap();
    }

    #[test]
    fn test_event_loop_failure_fails_the_window() {
        let mut input = input();
        input.setup(&OperatorContext::new(1, "upstream")).unwrap();
        input.begin_window(1);
        input
            .runtime
            .as_ref()
            .unwrap()
            .failure
            .record(Error::Interrupted("test".to_string()));

        assert!(matches!(input.emit_tuples(), Err(sluice_api::Error::Fatal(_))));
        input.teardown();
    }
}
