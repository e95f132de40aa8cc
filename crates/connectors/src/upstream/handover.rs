//! Bounded handover between the event-loop thread and the processing
//! thread.
//!
//! The event loop `put`s decoded payloads and waits while the queue is
//! full, which stops it from reading further bytes off the socket. The
//! processing thread `poll`s without blocking, once per emit tick.

use super::error::{Error, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// A decoded record plus the upstream offset it originated at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload<T> {
    pub record: T,
    pub location: i64,
}

impl<T> Payload<T> {
    pub fn new(record: T, location: i64) -> Self {
        Self { record, location }
    }
}

/// Create a handover queue holding at most `capacity` payloads.
pub fn channel<T>(capacity: usize) -> (HandoverSender<T>, HandoverReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (HandoverSender { tx }, HandoverReceiver { rx })
}

/// Event-loop side of the handover.
#[derive(Debug)]
pub struct HandoverSender<T> {
    tx: mpsc::Sender<Payload<T>>,
}

impl<T> Clone for HandoverSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> HandoverSender<T> {
    /// Hand a payload over, waiting while the queue is full.
    ///
    /// Fails only when the processing side is gone; the payload is lost in
    /// that case and callers must treat it as fatal.
    pub async fn put(&self, payload: Payload<T>) -> Result<()> {
        let location = payload.location;
        self.tx.send(payload).await.map_err(|_| {
            Error::Interrupted(format!(
                "processing side closed, payload at offset {} dropped",
                location
            ))
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Processing-thread side of the handover.
#[derive(Debug)]
pub struct HandoverReceiver<T> {
    rx: mpsc::Receiver<Payload<T>>,
}

impl<T> HandoverReceiver<T> {
    /// Take one payload if one is available.
    pub fn poll(&mut self) -> Option<Payload<T>> {
        match self.rx.try_recv() {
            Ok(payload) => Some(payload),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Number of payloads currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Take the payloads buffered at call time, leaving later arrivals for
    /// the next tick.
    pub fn drain(&mut self) -> impl Iterator<Item = Payload<T>> + '_ {
        let available = self.len();
        (0..available).map_while(move |_| self.poll())
    }

    /// Stop accepting payloads. Pending and future `put`s fail.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
