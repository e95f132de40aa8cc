//! Output ports connecting an operator to its downstream.

use parking_lot::Mutex;
use std::sync::Arc;

type SinkFn<T> = Box<dyn FnMut(T) + Send>;

/// Downstream output port of an operator.
///
/// Tuples emitted on an unconnected port are discarded.
pub struct OutputPort<T> {
    sink: Option<SinkFn<T>>,
    emitted: u64,
}

impl<T> Default for OutputPort<T> {
    fn default() -> Self {
        Self {
            sink: None,
            emitted: 0,
        }
    }
}

impl<T> OutputPort<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the port to a downstream sink.
    pub fn connect(&mut self, sink: impl FnMut(T) + Send + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    /// Emit one tuple downstream.
    pub fn emit(&mut self, tuple: T) {
        self.emitted += 1;
        if let Some(sink) = self.sink.as_mut() {
            sink(tuple);
        }
    }

    /// Total tuples emitted on this port.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

impl<T> std::fmt::Debug for OutputPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort")
            .field("connected", &self.is_connected())
            .field("emitted", &self.emitted)
            .finish()
    }
}

/// Shareable in-memory sink.
///
/// # Example
///
/// ```ignore
/// let collector = Collector::new();
/// operator.output.connect(collector.sink());
/// // ... run windows ...
/// let records = collector.drain();
/// ```
#[derive(Debug)]
pub struct Collector<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Send + 'static> Collector<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink closure feeding this collector, for [`OutputPort::connect`].
    pub fn sink(&self) -> impl FnMut(T) + Send + 'static {
        let items = self.items.clone();
        move |tuple| items.lock().push(tuple)
    }

    /// Take everything collected so far.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
