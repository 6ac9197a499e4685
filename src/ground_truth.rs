//! Ground-truth lookup used to seed the estimator.
//!
//! The pipeline only asks "what was the state at this timestamp?". Where the
//! answer comes from (a dataset, a motion-capture stream) is up to the caller.

use crate::types::{NavState, Timestamp};
use std::collections::BTreeMap;

/// Source of ground-truth states.
pub trait GroundTruthSource: Send {
    /// State at `timestamp`, or `None` if unavailable.
    fn state_at(&self, timestamp: Timestamp) -> Option<NavState>;
}

/// Timestamp-indexed table of ground-truth states.
///
/// Lookups accept the closest entry within `tolerance` nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct GroundTruthTable {
    states: BTreeMap<Timestamp, NavState>,
    tolerance: Timestamp,
}

impl GroundTruthTable {
    pub fn new(tolerance: Timestamp) -> Self {
        Self {
            states: BTreeMap::new(),
            tolerance: tolerance.max(0),
        }
    }

    /// Insert a state, keyed by its own timestamp.
    pub fn insert(&mut self, state: NavState) {
        self.states.insert(state.timestamp, state);
    }

    pub fn with_state(mut self, state: NavState) -> Self {
        self.insert(state);
        self
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl GroundTruthSource for GroundTruthTable {
    fn state_at(&self, timestamp: Timestamp) -> Option<NavState> {
        let lo = timestamp.saturating_sub(self.tolerance);
        let hi = timestamp.saturating_add(self.tolerance);
        self.states
            .range(lo..=hi)
            .min_by_key(|(ts, _)| (*ts - timestamp).abs())
            .map(|(_, state)| state.at(timestamp))
    }
}

impl<F> GroundTruthSource for F
where
    F: Fn(Timestamp) -> Option<NavState> + Send,
{
    fn state_at(&self, timestamp: Timestamp) -> Option<NavState> {
        self(timestamp)
    }
}
