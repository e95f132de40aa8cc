//! Explicit lifecycle state machine for hosted operators.
//!
//! [`OperatorDriver`] owns an operator plus its context and accepts the
//! host callbacks as method calls. Each call is validated against the
//! current [`LifecycleState`] before it reaches the operator:
//!
//! ```text
//!  Created --setup--> Ready --activate--> Active --begin_window--> InWindow
//!                       ^                   |  ^                     |
//!                       +----deactivate-----+  +-----end_window------+
//!  Ready --teardown--> TornDown
//! ```
//!
//! An operator error moves the driver to `Failed`; from there only
//! `deactivate` and `teardown` are accepted.

use crate::context::{OperatorContext, StateBackend};
use crate::operator::{InputOperator, Snapshot};
use crate::stats::{BatchedOperatorStats, OperatorStats};
use crate::{Error, Result};
use std::fmt;
use tracing::{debug, error, info};

/// Where an operator is in its host-driven lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Ready,
    Active,
    InWindow(u64),
    Failed,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Ready => write!(f, "ready"),
            Self::Active => write!(f, "active"),
            Self::InWindow(id) => write!(f, "in window {}", id),
            Self::Failed => write!(f, "failed"),
            Self::TornDown => write!(f, "torn down"),
        }
    }
}

/// Drives one operator instance through the host callback sequence.
pub struct OperatorDriver<O: InputOperator> {
    operator: O,
    context: OperatorContext<O::Stats>,
    state: LifecycleState,
    last_window: Option<u64>,
    stats: Vec<OperatorStats<O::Stats>>,
}

impl<O: InputOperator> OperatorDriver<O> {
    pub fn new(operator: O, context: OperatorContext<O::Stats>) -> Self {
        Self {
            operator,
            context,
            state: LifecycleState::Created,
            last_window: None,
            stats: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn operator_mut(&mut self) -> &mut O {
        &mut self.operator
    }

    pub fn context(&self) -> &OperatorContext<O::Stats> {
        &self.context
    }

    /// Hand the operator back, whatever state it is in.
    pub fn into_operator(self) -> O {
        self.operator
    }

    pub fn setup(&mut self) -> Result<()> {
        self.expect("setup", |s| s == LifecycleState::Created)?;
        let result = self.operator.setup(&self.context);
        self.transition(result, LifecycleState::Ready)
    }

    pub fn activate(&mut self) -> Result<()> {
        self.expect("activate", |s| s == LifecycleState::Ready)?;
        let result = self.operator.activate(&self.context);
        self.transition(result, LifecycleState::Active)
    }

    pub fn begin_window(&mut self, window_id: u64) -> Result<()> {
        self.expect("begin window", |s| s == LifecycleState::Active)?;
        if let Some(last) = self.last_window {
            if window_id <= last {
                return Err(Error::Runtime(format!(
                    "window {} does not follow window {}",
                    window_id, last
                )));
            }
        }
        self.operator.begin_window(window_id);
        self.last_window = Some(window_id);
        self.state = LifecycleState::InWindow(window_id);
        Ok(())
    }

    pub fn emit_tuples(&mut self) -> Result<()> {
        let state = self.expect("emit tuples", |s| matches!(s, LifecycleState::InWindow(_)))?;
        let result = self.operator.emit_tuples();
        self.transition(result, state)
    }

    pub fn handle_idle_time(&mut self) -> Result<()> {
        let state = self.expect("handle idle time", |s| matches!(s, LifecycleState::InWindow(_)))?;
        let result = self.operator.handle_idle_time();
        self.transition(result, state)
    }

    pub fn end_window(&mut self) -> Result<()> {
        let state = self.expect("end window", |s| matches!(s, LifecycleState::InWindow(_)))?;
        let result = self.operator.end_window();
        if let LifecycleState::InWindow(window_id) = state {
            self.stats.push(OperatorStats {
                window_id,
                custom_stats: self.context.take_custom_stats(),
            });
        }
        self.transition(result, LifecycleState::Active)
    }

    /// Run one complete window with `ticks` emit calls.
    pub fn run_window(&mut self, window_id: u64, ticks: usize) -> Result<()> {
        self.begin_window(window_id)?;
        for _ in 0..ticks {
            self.emit_tuples()?;
        }
        self.end_window()
    }

    pub fn checkpointed(&mut self, window_id: u64) -> Result<()> {
        self.expect("checkpoint", Self::between_windows)?;
        self.operator.checkpointed(window_id);
        Ok(())
    }

    pub fn committed(&mut self, window_id: u64) -> Result<()> {
        self.expect("commit", Self::between_windows)?;
        debug!(operator = self.context.id(), window_id, "committed");
        self.operator.committed(window_id);
        Ok(())
    }

    pub fn deactivate(&mut self) -> Result<()> {
        self.expect("deactivate", |s| {
            matches!(s, LifecycleState::Active | LifecycleState::Failed)
        })?;
        self.operator.deactivate();
        self.state = LifecycleState::Ready;
        Ok(())
    }

    pub fn teardown(&mut self) -> Result<()> {
        self.expect("teardown", |s| {
            matches!(s, LifecycleState::Ready | LifecycleState::Failed)
        })?;
        self.operator.teardown();
        self.state = LifecycleState::TornDown;
        info!(operator = self.context.id(), "operator torn down");
        Ok(())
    }

    /// Stats recorded since the last call, batched for a stats listener.
    pub fn take_stats(&mut self) -> BatchedOperatorStats<O::Stats> {
        BatchedOperatorStats::new(self.context.id(), std::mem::take(&mut self.stats))
    }

    fn between_windows(state: LifecycleState) -> bool {
        matches!(state, LifecycleState::Ready | LifecycleState::Active)
    }

    fn expect(
        &self,
        event: &'static str,
        allowed: impl Fn(LifecycleState) -> bool,
    ) -> Result<LifecycleState> {
        if allowed(self.state) {
            Ok(self.state)
        } else {
            Err(Error::Lifecycle {
                event,
                state: self.state,
            })
        }
    }

    fn transition(&mut self, result: Result<()>, next: LifecycleState) -> Result<()> {
        match result {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                error!(operator = self.context.id(), error = %e, "operator failed");
                self.state = LifecycleState::Failed;
                Err(e)
            }
        }
    }
}

impl<O: InputOperator + Snapshot> OperatorDriver<O> {
    /// Persist the operator's state for `window_id`, then notify it.
    pub fn checkpoint(&mut self, window_id: u64, backend: &dyn StateBackend) -> Result<()> {
        self.expect("checkpoint", Self::between_windows)?;
        let data = self.operator.snapshot()?;
        backend.put_bytes(&checkpoint_key(&self.context, window_id), data)?;
        self.operator.checkpointed(window_id);
        Ok(())
    }

    /// Restore `operator` from its most recent checkpoint in `backend`.
    ///
    /// Returns the checkpointed window id, or `None` when nothing was found
    /// and the operator starts fresh.
    pub fn recover(
        mut operator: O,
        context: OperatorContext<O::Stats>,
        backend: &dyn StateBackend,
    ) -> Result<(Self, Option<u64>)> {
        let prefix = checkpoint_prefix(&context);
        let latest = backend.keys_with_prefix(&prefix)?.into_iter().next_back();

        let mut recovered = None;
        if let Some(key) = latest {
            if let Some(data) = backend.get_bytes(&key)? {
                operator.restore(&data)?;
                recovered = key[prefix.len()..].parse::<u64>().ok();
                info!(operator = context.id(), window_id = ?recovered, "restored from checkpoint");
            }
        }

        let mut driver = Self::new(operator, context);
        driver.last_window = recovered;
        Ok((driver, recovered))
    }
}

fn checkpoint_prefix<S>(context: &OperatorContext<S>) -> String {
    format!("{}/{}/", context.name(), context.id())
}

// Zero-padded so lexical key order matches window order.
fn checkpoint_key<S>(context: &OperatorContext<S>, window_id: u64) -> String {
    format!("{}{:020}", checkpoint_prefix(context), window_id)
}
