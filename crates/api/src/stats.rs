//! Operator statistics and the listeners that react to them.

/// Stats recorded for one operator during one window.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorStats<S> {
    pub window_id: u64,
    /// Custom stats published by the operator during the window, if any.
    pub custom_stats: Option<S>,
}

/// Stats for one operator accumulated since the last report.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchedOperatorStats<S> {
    pub operator_id: u32,
    pub last_windowed_stats: Vec<OperatorStats<S>>,
}

impl<S> BatchedOperatorStats<S> {
    pub fn new(operator_id: u32, last_windowed_stats: Vec<OperatorStats<S>>) -> Self {
        Self {
            operator_id,
            last_windowed_stats,
        }
    }

    /// Most recent custom stats value in the batch.
    pub fn latest_custom_stats(&self) -> Option<&S> {
        self.last_windowed_stats
            .iter()
            .rev()
            .find_map(|s| s.custom_stats.as_ref())
    }
}

/// Listener's verdict after looking at a batch of stats.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<A> {
    /// The host should call `define_partitions` for this operator.
    pub repartition_required: bool,
    /// Endpoints the listener learned about that no partition serves yet.
    pub discovered: Vec<A>,
}

impl<A> Default for Response<A> {
    fn default() -> Self {
        Self {
            repartition_required: false,
            discovered: Vec::new(),
        }
    }
}

/// Receives batched operator stats on every reporting cycle.
pub trait StatsListener<S> {
    /// What the listener hands back with a repartition request.
    type Discovered;

    fn process_stats(&mut self, stats: &BatchedOperatorStats<S>) -> Response<Self::Discovered>;
}
