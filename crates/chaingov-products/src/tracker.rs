//! Sliding window of proposals that count toward participation.

use alloy_primitives::U256;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};

use crate::ProductError;

/// How many concluded proposals participation looks back over.
pub const RECENTLY_COMPLETED_CAP: usize = 10;

/// Two bounded lists and their change flags.
///
/// `ending_in_future` holds every tracked proposal that has not concluded,
/// sorted by end block. `recently_completed` holds the newest concluded ones
/// (by end block) up to [`RECENTLY_COMPLETED_CAP`]. An id is never in both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParticipationRateStateTracker {
    ending_in_future: Vec<(u64, U256)>,
    recently_completed: VecDeque<(u64, U256)>,
    future_changed: bool,
    completed_changed: bool,
}

impl ParticipationRateStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a not-yet-concluded proposal.
    pub fn track(&mut self, id: U256, end_block: u64) {
        if self.contains(id) {
            return;
        }
        let pos = self.ending_in_future.partition_point(|(e, _)| *e <= end_block);
        self.ending_in_future.insert(pos, (end_block, id));
        self.future_changed = true;
    }

    /// Roll every proposal whose end block has passed into the completed list.
    pub fn advance(&mut self, current_block: u64) {
        let passed = self
            .ending_in_future
            .partition_point(|(end, _)| *end < current_block);
        if passed == 0 {
            return;
        }
        for entry in self.ending_in_future.drain(..passed) {
            let pos = self.recently_completed.partition_point(|(e, _)| *e <= entry.0);
            self.recently_completed.insert(pos, entry);
        }
        while self.recently_completed.len() > RECENTLY_COMPLETED_CAP {
            self.recently_completed.pop_front();
        }
        self.future_changed = true;
        self.completed_changed = true;
    }

    /// Drop a canceled proposal from the future list.
    pub fn cancel(&mut self, id: U256) {
        let before = self.ending_in_future.len();
        self.ending_in_future.retain(|(_, p)| *p != id);
        if self.ending_in_future.len() != before {
            self.future_changed = true;
        }
    }

    /// Re-derive both lists from scratch.
    ///
    /// `eligible` yields `(id, end_block)` for every non-canceled,
    /// non-optimistic proposal. Flags are only raised on actual change.
    pub fn rebuild(&mut self, eligible: impl IntoIterator<Item = (U256, u64)>, current_block: u64) {
        let mut future = Vec::new();
        let mut completed = Vec::new();
        for (id, end) in eligible {
            if end < current_block {
                completed.push((end, id));
            } else {
                future.push((end, id));
            }
        }
        future.sort();
        completed.sort();
        let skip = completed.len().saturating_sub(RECENTLY_COMPLETED_CAP);
        let completed: VecDeque<_> = completed.into_iter().skip(skip).collect();

        if future != self.ending_in_future {
            self.ending_in_future = future;
            self.future_changed = true;
        }
        if completed != self.recently_completed {
            self.recently_completed = completed;
            self.completed_changed = true;
        }
    }

    /// Disjointness and cap.
    pub fn check_integrity(&self) -> Result<(), ProductError> {
        if self.recently_completed.len() > RECENTLY_COMPLETED_CAP {
            return Err(ProductError::Integrity(format!(
                "{} completed proposals exceed cap {}",
                self.recently_completed.len(),
                RECENTLY_COMPLETED_CAP
            )));
        }
        let future: HashSet<U256> = self.ending_in_future.iter().map(|(_, id)| *id).collect();
        if let Some((_, id)) = self.recently_completed.iter().find(|(_, id)| future.contains(id)) {
            return Err(ProductError::Integrity(format!(
                "proposal {id} is both completed and ending in future"
            )));
        }
        Ok(())
    }

    pub fn contains(&self, id: U256) -> bool {
        self.ending_in_future.iter().any(|(_, p)| *p == id)
            || self.recently_completed.iter().any(|(_, p)| *p == id)
    }

    pub fn ending_in_future(&self) -> impl Iterator<Item = U256> + '_ {
        self.ending_in_future.iter().map(|(_, id)| *id)
    }

    /// Oldest first.
    pub fn recently_completed(&self) -> impl Iterator<Item = U256> + '_ {
        self.recently_completed.iter().map(|(_, id)| *id)
    }

    pub fn future_len(&self) -> usize {
        self.ending_in_future.len()
    }

    pub fn completed_len(&self) -> usize {
        self.recently_completed.len()
    }

    /// `(future_changed, completed_changed)`, clearing both flags.
    pub fn take_changes(&mut self) -> (bool, bool) {
        let out = (self.future_changed, self.completed_changed);
        self.future_changed = false;
        self.completed_changed = false;
        out
    }
}
