//! Upstream input connector.
//!
//! Pulls offset-tagged events from an upstream event source over one
//! persistent TCP connection per instance and emits them window by window.
//!
//! ## Recovery
//!
//! At the end of every window the instance records the newest offset it
//! emitted in its [`RecoveryLedger`]. When the host commits a window, the
//! matching marker is pruned and its offset reported upstream with
//! `COMMITTED`, so upstream can discard data up to it. After a reconnect or
//! a restore from checkpoint, the connector sends `SEEK` with the newest
//! ledger offset and upstream replays from there. Delivery is
//! at-least-once.
//!
//! ## Threads
//!
//! Socket I/O runs on a per-instance [`EventLoop`]; the host's processing
//! thread drains the bounded handover queue during `emit_tuples`. A full
//! queue stops the event loop from reading, which propagates backpressure
//! to the upstream through TCP flow control.
//!
//! ## Partitioning
//!
//! Each instance is bound to exactly one upstream address. See
//! [`redefine_partitions`] and [`adopt_addresses`].

mod codec;
mod config;
mod connection;
pub mod decode;
mod error;
mod handover;
mod ledger;
mod partition;
mod source;
mod status;

pub use codec::{Command, DataMessage, FrameCodec};
pub use config::{Address, ReconnectConfig, UpstreamConfig, DEFAULT_HANDOVER_CAPACITY};
pub use connection::{Backoff, Client, Connection, EventLoop, FailureSlot, ResumePosition, StatusSink};
pub use decode::DecodeFn;
pub use error::{DecodeError, Error, Result};
pub use handover::{channel as handover_channel, HandoverReceiver, HandoverSender, Payload};
pub use ledger::{CommitOutcome, RecoveryLedger, RecoveryMarker};
pub use partition::{adopt_addresses, redefine_partitions};
pub use source::{UpstreamCheckpoint, UpstreamInput, WindowCounters};
pub use status::{
    ConnectionStatus, ConnectionStatusListener, Discovery, StaticDiscovery, StatusListenerConfig,
};
