//! Recovery ledger: per-window recovery markers awaiting commit.

use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The upstream offset reached by the end of one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMarker {
    pub window_id: u64,
    pub last_offset: i64,
}

impl RecoveryMarker {
    pub fn new(window_id: u64, last_offset: i64) -> Self {
        Self {
            window_id,
            last_offset,
        }
    }
}

/// What a [`RecoveryLedger::commit`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// The marker of exactly the committed window, if present.
    pub exact: Option<RecoveryMarker>,
    /// The newest marker removed, exact match or not.
    pub last_discarded: Option<RecoveryMarker>,
}

/// Markers of completed windows that are not committed yet, ordered by
/// non-decreasing window id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<RecoveryMarker>", into = "Vec<RecoveryMarker>")]
pub struct RecoveryLedger {
    markers: VecDeque<RecoveryMarker>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted markers, rejecting out-of-order
    /// input.
    pub fn from_markers(markers: Vec<RecoveryMarker>) -> Result<Self> {
        if let Some(pair) = markers.windows(2).find(|w| w[0].window_id > w[1].window_id) {
            return Err(Error::Partition(format!(
                "recovery markers out of order: window {} before window {}",
                pair[0].window_id, pair[1].window_id
            )));
        }
        Ok(Self {
            markers: markers.into(),
        })
    }

    /// Record the marker of a completed window.
    ///
    /// A marker older than the newest one would break the ordering, so the
    /// caller must append windows in the order they complete.
    pub fn append(&mut self, marker: RecoveryMarker) {
        debug_assert!(self
            .markers
            .back()
            .map_or(true, |last| last.window_id <= marker.window_id));
        self.markers.push_back(marker);
    }

    /// Prune every marker up to and including `window_id`.
    ///
    /// The exact match, if any, carries the offset upstream may now
    /// discard. Scanning stops at the first newer marker.
    pub fn commit(&mut self, window_id: u64) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();
        while self.markers.front().is_some_and(|m| m.window_id <= window_id) {
            if let Some(marker) = self.markers.pop_front() {
                if marker.window_id == window_id {
                    outcome.exact = Some(marker);
                }
                outcome.last_discarded = Some(marker);
            }
        }
        outcome
    }

    /// Newest marker, the position to resume from after a reconnect.
    pub fn latest(&self) -> Option<&RecoveryMarker> {
        self.markers.back()
    }

    pub fn markers(&self) -> impl Iterator<Item = &RecoveryMarker> {
        self.markers.iter()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

impl TryFrom<Vec<RecoveryMarker>> for RecoveryLedger {
    type Error = Error;

    fn try_from(markers: Vec<RecoveryMarker>) -> Result<Self> {
        Self::from_markers(markers)
    }
}

impl From<RecoveryLedger> for Vec<RecoveryMarker> {
    fn from(ledger: RecoveryLedger) -> Self {
        ledger.markers.into()
    }
}
