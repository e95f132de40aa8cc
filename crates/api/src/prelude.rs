//! Prelude module - common imports for Sluice operators.
//!
//! ```ignore
//! use sluice_api::prelude::*;
//! ```

// Operator contract
pub use crate::operator::{InputOperator, Partition, Partitionable, Snapshot};

// Lifecycle
pub use crate::lifecycle::{LifecycleState, OperatorDriver};

// Context and state
pub use crate::context::{MemoryStateBackend, OperatorContext, StateBackend};

// Ports
pub use crate::port::{Collector, OutputPort};

// Stats
pub use crate::stats::{BatchedOperatorStats, OperatorStats, Response, StatsListener};

// Error and Result
pub use crate::{Error, Result};

// Re-exports
pub use serde::{de::DeserializeOwned, Deserialize, Serialize};
