//! Phase → count summary of an array.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::phase::TaskPhase;

/// Number of subtasks in each phase.
///
/// Zero counts are never stored: a phase with no subtasks is absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArraySummary {
    counts: BTreeMap<TaskPhase, i64>,
}

impl ArraySummary {
    /// Creates an empty summary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adjusts `phase` by a signed `delta`, dropping the entry when it reaches zero.
    pub fn inc_by_count(&mut self, phase: TaskPhase, delta: i64) {
        if delta == 0 {
            return;
        }
        let next = self.count(phase) + delta;
        if next == 0 {
            self.counts.remove(&phase);
        } else {
            self.counts.insert(phase, next);
        }
    }

    /// Adds one subtask to `phase`.
    pub fn inc(&mut self, phase: TaskPhase) {
        self.inc_by_count(phase, 1);
    }

    /// Removes one subtask from `phase`.
    pub fn dec(&mut self, phase: TaskPhase) {
        self.inc_by_count(phase, -1);
    }

    /// Returns the count for `phase` (zero when absent).
    #[must_use]
    pub fn count(&self, phase: TaskPhase) -> i64 {
        self.counts.get(&phase).copied().unwrap_or(0)
    }

    /// Returns the sum of all counts.
    #[must_use]
    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }

    /// Returns true when no phase has a count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates `(phase, count)` pairs in phase order.
    pub fn iter(&self) -> impl Iterator<Item = (TaskPhase, i64)> + '_ {
        self.counts.iter().map(|(phase, count)| (*phase, *count))
    }

    /// Makes `self` equal to `other` and reports whether anything changed.
    ///
    /// The return value is a persistence hint only.
    pub fn merge_from(&mut self, other: &Self) -> bool {
        let mut updated = false;

        for (phase, count) in other.iter() {
            if count == 0 {
                updated |= self.counts.remove(&phase).is_some();
            } else if self.counts.insert(phase, count) != Some(count) {
                updated = true;
            }
        }

        let before = self.counts.len();
        self.counts.retain(|phase, _| other.counts.contains_key(phase));
        updated || self.counts.len() != before
    }
}

impl FromIterator<(TaskPhase, i64)> for ArraySummary {
    fn from_iter<I: IntoIterator<Item = (TaskPhase, i64)>>(iter: I) -> Self {
        let mut summary = Self::new();
        for (phase, count) in iter {
            summary.inc_by_count(phase, count);
        }
        summary
    }
}
