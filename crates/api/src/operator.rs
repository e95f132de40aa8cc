//! Operator traits implemented by hosted input operators.
//!
//! The host calls these hooks on one processing thread, one window at a
//! time, never re-entrantly. All hooks have no-op defaults so an operator
//! only overrides the ones it cares about.

use crate::context::OperatorContext;
use crate::Result;

/// An input operator driven window-by-window by the host scheduler.
pub trait InputOperator: Send + 'static {
    /// Custom stats type published through the [`OperatorContext`].
    type Stats: Clone + Send + 'static;

    /// Acquire long-lived resources. Called once before `activate`.
    fn setup(&mut self, _ctx: &OperatorContext<Self::Stats>) -> Result<()> {
        Ok(())
    }

    /// Release everything acquired in `setup`.
    fn teardown(&mut self) {}

    /// Start live processing (open connections and the like).
    fn activate(&mut self, _ctx: &OperatorContext<Self::Stats>) -> Result<()> {
        Ok(())
    }

    /// Stop live processing.
    fn deactivate(&mut self) {}

    /// A new window starts.
    fn begin_window(&mut self, _window_id: u64) {}

    /// Emit whatever is ready. Called repeatedly within a window.
    fn emit_tuples(&mut self) -> Result<()> {
        Ok(())
    }

    /// The current window ends.
    fn end_window(&mut self) -> Result<()> {
        Ok(())
    }

    /// The scheduler has no pending work for this operator.
    fn handle_idle_time(&mut self) -> Result<()> {
        Ok(())
    }

    /// State up to and including `window_id` has been checkpointed.
    fn checkpointed(&mut self, _window_id: u64) {}

    /// Window `window_id` has been committed by every downstream operator.
    fn committed(&mut self, _window_id: u64) {}
}

/// Operators whose state the host persists at checkpoints.
pub trait Snapshot {
    /// Serialize the persistent part of the operator.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the persistent part of the operator. Called before `setup`.
    fn restore(&mut self, data: &[u8]) -> Result<()>;
}

/// One parallel instance of an operator, not yet set up.
#[derive(Debug)]
pub struct Partition<T> {
    instance: T,
}

impl<T> Partition<T> {
    pub fn new(instance: T) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &T {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut T {
        &mut self.instance
    }

    pub fn into_instance(self) -> T {
        self.instance
    }
}

/// Operators that can reshape their own parallelism.
pub trait Partitionable: Sized {
    /// Redefine `partitions` given a requested capacity change.
    ///
    /// Implementations must leave `partitions` untouched when they return
    /// an error.
    fn define_partitions(
        &self,
        partitions: &mut Vec<Partition<Self>>,
        incremental_capacity: usize,
    ) -> Result<()>;
}
