//! Context and state storage for hosted operators.
//!
//! The [`OperatorContext`] is handed to an operator at `setup` and
//! `activate`. Operators publish custom stats through it from any thread;
//! the host collects them once per window.

use crate::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-instance context shared between the host and the operator.
///
/// Cloning is cheap; every clone refers to the same stats slot.
#[derive(Debug)]
pub struct OperatorContext<S> {
    id: u32,
    name: Arc<str>,
    custom_stats: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for OperatorContext<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            custom_stats: self.custom_stats.clone(),
        }
    }
}

impl<S> OperatorContext<S> {
    /// Create a context for the operator instance `id`.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Arc::from(name.into()),
            custom_stats: Arc::new(Mutex::new(None)),
        }
    }

    /// Physical operator id assigned by the host.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Operator name, used for thread names and logging.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a custom stats value. Replaces any value not yet collected.
    pub fn set_custom_stats(&self, stats: S) {
        *self.custom_stats.lock() = Some(stats);
    }

    /// Take the pending custom stats value, if any.
    pub fn take_custom_stats(&self) -> Option<S> {
        self.custom_stats.lock().take()
    }
}

/// State backend trait for checkpointed operator state.
///
/// Note: Uses bytes for values to be object-safe (dyn compatible).
pub trait StateBackend: Send + Sync + 'static {
    /// Get raw bytes from state.
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Put raw bytes into state.
    fn put_bytes(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Get all keys with a given prefix.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory state backend for testing.
#[derive(Default)]
pub struct MemoryStateBackend {
    state: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryStateBackend {
    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.read().get(key).cloned())
    }

    fn put_bytes(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.state.write().insert(key.to_string(), value);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .state
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
