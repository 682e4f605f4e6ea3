use log::debug;
use serde::{Deserialize, Serialize};

use super::{BackedUpJsonResource, JsonStore};
use crate::error::{Result, ResultExt};

/// Persisted state of an [`AverageAccumulator`], stored as
/// `{"count": n, "sum": s}`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorState {
    pub count: u64,
    pub sum: f64,
}

impl AccumulatorState {
    /// Count `value` `weight` times.
    pub fn add(&mut self, value: f64, weight: u64) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    /// `sum / count`, or 0 when nothing has been accumulated.
    /// Average of the persisted state.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Running weighted average that survives reboots.
///
/// Every update is written through to a [`BackedUpJsonResource`], so a
/// partially filled tracker bucket is not lost when power goes away. State
/// that cannot be read (first boot, both slots corrupt) counts as empty.
pub struct AverageAccumulator {
    resource: BackedUpJsonResource,
}

impl AverageAccumulator {
    pub fn new(resource: BackedUpJsonResource) -> Self {
        Self { resource }
    }

    /// Last persisted state, empty if unreadable.
    pub fn state(&self) -> AccumulatorState {
        self.resource.load().unwrap_or_else(|e| {
            debug!("Accumulator {} starts empty: {}", self.resource.path(), e);
            AccumulatorState::default()
        })
    }

    /// Add one value with weight 1.
    pub fn add(&mut self, value: f64) -> Result<f64> {
        self.add_weighted(value, 1)
    }

    /// Add `value` counted `weight` times, persist, and return the new average.
    pub fn add_weighted(&mut self, value: f64, weight: u64) -> Result<f64> {
        let mut state = self.state();
        state.add(value, weight);
        self.store(&state)?;
        Ok(state.average())
    }

    /// Persist `state` as is, for callers that fold several updates into a
    /// single write.
    pub fn store(&mut self, state: &AccumulatorState) -> Result<()> {
        self.resource
            .store(state)
            .context("updating accumulator")
    }

    /// Average of the persisted state.
    pub fn average(&self) -> f64 {
        self.state().average()
    }

    /// Total weight of the persisted state.
    pub fn count(&self) -> u64 {
        self.state().count
    }

    /// Persist an empty state.
    pub fn reset(&mut self) -> Result<()> {
        self.resource
            .store(&AccumulatorState::default())
            .context("resetting accumulator")
    }

    /// Remove both slots.
    pub fn erase(&mut self) -> Result<()> {
        self.resource.erase()
    }
}
