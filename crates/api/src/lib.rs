//! Sluice Operator API
//!
//! This crate provides the host-engine contract that windowed input
//! operators implement, similar to the operator API of a batch-windowed
//! streaming engine.
//!
//! The host drives every operator through the same callback sequence:
//!
//! ```text
//! setup -> activate -> (begin_window -> emit_tuples* -> end_window)* -> deactivate -> teardown
//! ```
//!
//! interleaved with `checkpointed` / `committed` notifications and
//! `handle_idle_time` calls when the scheduler has nothing else to do.
//! [`OperatorDriver`] reifies that sequence as an explicit state machine so
//! operators can be driven from tests without a real scheduler.
//!
//! # Example
//!
//! ```ignore
//! use sluice_api::prelude::*;
//!
//! let mut driver = OperatorDriver::new(operator, OperatorContext::new(1, "input"));
//! driver.setup()?;
//! driver.activate()?;
//! driver.run_window(1, 10)?;
//! driver.committed(1)?;
//! driver.deactivate()?;
//! driver.teardown()?;
//! ```

pub mod context;
pub mod lifecycle;
pub mod operator;
pub mod port;
pub mod prelude;
pub mod stats;

pub use context::{MemoryStateBackend, OperatorContext, StateBackend};
pub use lifecycle::{LifecycleState, OperatorDriver};
pub use operator::{InputOperator, Partition, Partitionable, Snapshot};
pub use port::{Collector, OutputPort};
pub use stats::{BatchedOperatorStats, OperatorStats, Response, StatsListener};

/// Result type for Sluice operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while hosting an operator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("State error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    /// A host callback arrived in a state that does not allow it.
    #[error("Lifecycle error: cannot {event} while {state}")]
    Lifecycle {
        event: &'static str,
        state: LifecycleState,
    },

    /// Unrecoverable failure; the operator instance must be terminated.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
