//! Event loop and upstream connections.
//!
//! All socket I/O of an operator runs on one [`EventLoop`]: a current-thread
//! Tokio runtime driven by a dedicated OS thread. Each [`Connection`] is a
//! task on that loop that owns the socket to one upstream address:
//!
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTED -> ...
//! ```
//!
//! On connect it writes `SEEK` with the current resume offset, then
//! forwards decoded payloads into the handover queue. A full queue parks
//! the task, so nothing more is read off the socket until the processing
//! thread drains it. I/O failures only ever surface as a disconnect; the
//! processing thread observes connectivity through [`Connection::is_connected`].

use super::codec::{Command, DataMessage, FrameCodec};
use super::config::{Address, ReconnectConfig, UpstreamConfig};
use super::decode::DecodeFn;
use super::error::{Error, Result};
use super::handover::{HandoverSender, Payload};
use super::status::ConnectionStatus;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use sluice_api::OperatorContext;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// How long a stopping event loop waits for its connections to wind down.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Receives connectivity changes of a connection.
pub trait StatusSink: Send + Sync + 'static {
    fn publish(&self, status: ConnectionStatus);
}

impl StatusSink for OperatorContext<ConnectionStatus> {
    fn publish(&self, status: ConnectionStatus) {
        self.set_custom_stats(status);
    }
}

/// Offset to send with `SEEK` on the next connect.
///
/// Written by the processing thread at window boundaries, read by the event
/// loop when a connection comes up.
#[derive(Debug, Clone, Default)]
pub struct ResumePosition(Arc<AtomicI64>);

impl ResumePosition {
    pub fn new(offset: i64) -> Self {
        Self(Arc::new(AtomicI64::new(offset)))
    }

    pub fn set(&self, offset: i64) {
        self.0.store(offset, Ordering::Release);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Holds the first fatal error raised on the event loop until the
/// processing thread picks it up.
#[derive(Debug, Clone, Default)]
pub struct FailureSlot(Arc<Mutex<Option<Error>>>);

impl FailureSlot {
    pub fn record(&self, e: Error) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    pub fn take(&self) -> Option<Error> {
        self.0.lock().take()
    }
}

/// Everything a connection needs to turn frames into payloads and report
/// on itself.
pub struct Client<T> {
    pub address: Address,
    pub decode: DecodeFn<T>,
    pub handover: HandoverSender<T>,
    pub resume: ResumePosition,
    pub status: Arc<dyn StatusSink>,
    pub failure: FailureSlot,
}

impl<T> Client<T> {
    /// Decode one data frame into a payload.
    fn on_message(&self, frame: Bytes) -> Result<Payload<T>> {
        let message = DataMessage::decode(frame)?;
        let record = (self.decode)(&message.payload).map_err(|source| Error::Decode {
            offset: message.offset,
            source,
        })?;
        Ok(Payload::new(record, message.offset))
    }

    fn publish(&self, connected: bool) {
        self.status.publish(ConnectionStatus::new(&self.address, connected));
    }
}

/// Shared single-threaded I/O loop.
pub struct EventLoop {
    name: String,
    handle: Handle,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start an event loop on a new thread named `name`.
    pub fn start(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let thread = {
            let tracker = tracker.clone();
            let shutdown = shutdown.clone();
            let name = name.clone();
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    runtime.block_on(async move {
                        shutdown.cancelled().await;
                        tracker.close();
                        if tokio::time::timeout(STOP_GRACE, tracker.wait()).await.is_err() {
                            warn!(event_loop = %name, "connections did not stop in time");
                        }
                    });
                })?
        };

        info!(event_loop = %name, "event loop started");
        Ok(Self {
            name,
            handle,
            tracker,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start connecting `client` to its address. Returns immediately.
    pub fn connect<T: Send + 'static>(
        &self,
        client: Client<T>,
        config: &UpstreamConfig,
    ) -> Result<Connection> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let cancel = self.shutdown.child_token();
        let address = client.address.clone();

        let task = ConnectionTask {
            client,
            outbound: outbound_rx,
            connected: connected.clone(),
            cancel: cancel.clone(),
            connect_timeout: config.connect_timeout,
            max_frame_size: config.max_frame_size,
            backoff: Backoff::new(config.reconnect.clone()),
        };
        self.tracker.spawn_on(task.run(), &self.handle);

        debug!(event_loop = %self.name, address = %address, "connecting");
        Ok(Connection {
            address,
            outbound: outbound_tx,
            connected,
            cancel,
        })
    }

    /// Stop the loop and wait for its thread. Live connections are cancelled.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(event_loop = %self.name, "event loop thread panicked");
            }
            info!(event_loop = %self.name, "event loop stopped");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.name)
            .field("connections", &self.tracker.len())
            .field("stopped", &self.shutdown.is_cancelled())
            .finish()
    }
}

/// Processing-thread handle to one upstream connection.
#[derive(Debug)]
pub struct Connection {
    address: Address,
    outbound: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a command for the upstream. Fire-and-forget: returns `false`
    /// and drops the command while disconnected.
    pub fn write(&self, command: Command) -> bool {
        if !self.is_connected() {
            debug!(address = %self.address, %command, "not connected, skipping write");
            return false;
        }
        self.outbound.send(command).is_ok()
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// Upstream closed the stream.
    Closed,
    /// I/O or protocol failure; the connection is dropped.
    Failed(Error),
    /// Unrecoverable; the operator must terminate.
    Fatal(Error),
    /// Disconnect requested.
    Cancelled,
}

struct ConnectionTask<T> {
    client: Client<T>,
    outbound: mpsc::UnboundedReceiver<Command>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    connect_timeout: Duration,
    max_frame_size: usize,
    backoff: Backoff,
}

impl<T: Send + 'static> ConnectionTask<T> {
    async fn run(mut self) {
        let address = self.client.address.clone();
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((address.host(), address.port())),
                ) => attempt,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    self.backoff.reset();
                    let end = self.session(stream).await;

                    self.connected.store(false, Ordering::Release);
                    self.client.publish(false);

                    match end {
                        SessionEnd::Cancelled => {
                            info!(address = %address, "disconnected");
                            break;
                        }
                        SessionEnd::Fatal(e) => {
                            error!(address = %address, error = %e, "fatal connection error");
                            self.client.failure.record(e);
                            break;
                        }
                        SessionEnd::Closed => info!(address = %address, "upstream closed the connection"),
                        SessionEnd::Failed(e @ Error::Io(_)) => {
                            warn!(address = %address, error = %e, "connection lost")
                        }
                        SessionEnd::Failed(e) => {
                            error!(address = %address, error = %e, "dropping connection")
                        }
                    }
                }
                Ok(Err(e)) => warn!(address = %address, error = %e, "connect failed"),
                Err(_) => warn!(
                    address = %address,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "connect timed out"
                ),
            }

            let Some(delay) = self.backoff.next_delay() else {
                warn!(address = %address, "not reconnecting");
                break;
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(address = %address, "connection task finished");
    }

    async fn session(&mut self, stream: TcpStream) -> SessionEnd {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new(self.max_frame_size)).split();

        // Writes queued for an earlier session are meaningless now.
        while self.outbound.try_recv().is_ok() {}

        let offset = self.client.resume.get();
        if let Err(e) = sink.send(Command::Seek { offset }.to_bytes()).await {
            return SessionEnd::Failed(e);
        }
        self.connected.store(true, Ordering::Release);
        self.client.publish(true);
        info!(address = %self.client.address, offset, "connected hence sent SEEK");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                Some(command) = self.outbound.recv() => {
                    debug!(address = %self.client.address, %command, "writing");
                    if let Err(e) = sink.send(command.to_bytes()).await {
                        return SessionEnd::Failed(e);
                    }
                }
                frame = frames.next() => {
                    let frame = match frame {
                        None => return SessionEnd::Closed,
                        Some(Err(e)) => return SessionEnd::Failed(e),
                        Some(Ok(frame)) => frame,
                    };
                    let payload = match self.client.on_message(frame) {
                        Ok(payload) => payload,
                        Err(e) => return SessionEnd::Failed(e),
                    };
                    let location = payload.location;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return SessionEnd::Fatal(Error::Interrupted(format!(
                                "disconnected while handing over payload at offset {}",
                                location
                            )));
                        }
                        result = self.client.handover.put(payload) => {
                            if let Err(e) = result {
                                return SessionEnd::Fatal(e);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Exponential reconnection backoff.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            current_delay,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resets the retry state after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Delay before the next attempt, or `None` when reconnection is
    /// disabled or the retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }
        if self.config.max_retries.is_some_and(|max| self.attempt >= max) {
            return None;
        }

        self.attempt += 1;
        let delay = self.current_delay;
        let next = delay.mul_f64(self.config.backoff_multiplier.max(1.0));
        self.current_delay = next.min(self.config.max_delay);

        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnection attempt");
        Some(delay)
    }
}
