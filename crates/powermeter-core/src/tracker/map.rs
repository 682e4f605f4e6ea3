use alloc::collections::BTreeMap;
use alloc::string::String;

use log::{error, warn};
use serde_json::{Map, Value};

use super::Tracker;
use crate::error::{Error, Result, ResultExt};

/// Trackers by id (`"<duration_s>_<sampleCount>"` by convention).
///
/// Built by [`TrackerLoader`](crate::config::TrackerLoader) and shared between
/// the tracking task and the REST handlers behind a
/// [`ValueMutex`](crate::sync::ValueMutex).
#[derive(Default)]
pub struct TrackerMap {
    trackers: BTreeMap<String, Tracker>,
}

impl TrackerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tracker, returning the one previously stored under `id`.
    pub fn insert(&mut self, id: impl Into<String>, tracker: Tracker) -> Option<Tracker> {
        self.trackers.insert(id.into(), tracker)
    }

    /// The tracker served under `id`, for `GET /trackers/<id>`.
    pub fn get(&self, id: &str) -> Option<&Tracker> {
        self.trackers.get(id)
    }

    /// Number of trackers.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    /// Tracker ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.trackers.keys().map(String::as_str)
    }

    /// Track `value` on every tracker.
    ///
    /// A failing tracker does not stop the others; every failure is logged
    /// and the first one is returned.
    pub fn track_all(&mut self, value: f64) -> Result<()> {
        let mut first = None;
        for (id, tracker) in self.trackers.iter_mut() {
            if let Err(e) = tracker.track(value) {
                error!("Failed to track value on {}: {}", id, e);
                first.get_or_insert(e.context(alloc::format!("tracker {}", id)));
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// `{ "<id>": <TrackerData>, ... }`. A tracker whose data cannot be
    /// rendered is logged and left out.
    pub fn data(&self) -> Value {
        let mut map = Map::new();
        for (id, tracker) in &self.trackers {
            match serde_json::to_value(tracker.data()) {
                Ok(data) => {
                    map.insert(id.clone(), data);
                }
                Err(e) => warn!("Failed to render data of tracker {}: {}", id, e),
            }
        }
        Value::Object(map)
    }

    /// Apply `{ "<id>": {"data": [...]}, ... }` and return the updated
    /// trackers' data. Ids without a tracker are skipped.
    pub fn set_data(&mut self, json: &Value) -> Result<Value> {
        let entries = json
            .as_object()
            .ok_or_else(|| Error::InvalidData("expected an object of trackers".into()))?;

        let mut updated = Map::new();
        for (id, body) in entries {
            let Some(tracker) = self.trackers.get_mut(id) else {
                warn!("Ignoring data for unknown tracker {}", id);
                continue;
            };
            tracker
                .set_data(body)
                .with_context(|| alloc::format!("tracker {}", id))?;
            let data = serde_json::to_value(tracker.data())
                .map_err(|e| Error::InvalidData(alloc::string::ToString::to_string(&e)))?;
            updated.insert(id.clone(), data);
        }
        Ok(Value::Object(updated))
    }

    /// Erase the persisted state of every tracker.
    pub fn erase_all(&mut self) -> Result<()> {
        let mut first = None;
        for (id, tracker) in self.trackers.iter_mut() {
            if let Err(e) = tracker.erase() {
                error!("Failed to erase tracker {}: {}", id, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
