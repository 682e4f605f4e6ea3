//! Fixed-capacity, fixed-resolution rolling histories
//!
//! A [`Tracker`] splits its window of `duration_s` seconds into `sample_count`
//! buckets of `duration_s / sample_count` seconds each. Values handed to
//! [`Tracker::track`] are averaged, weighted by the seconds they were held,
//! and every time a bucket boundary passes the average is appended to the
//! persisted history. Buckets that passed without any input (device off,
//! task stalled) are recorded as explicit `null` entries so the history
//! always lines up with wall-clock time.

mod map;

pub use map::TrackerMap;

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, Timestamp};
use crate::config::TrackerConfig;
use crate::error::{Error, Result, ResultExt};
use crate::storage::{
    AccumulatorState, AverageAccumulator, BackedUpJsonResource, JsonStore, Persistence, join,
};

/// One bucket of a history: the average, or `None` for "no data".
pub type Sample = Option<f64>;

/// Snapshot of a tracker as served by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerData {
    pub title: String,
    /// Capacity of `data`.
    #[serde(rename = "sampleCount")]
    pub sample_count: u32,
    /// Window length in seconds.
    pub duration_s: u32,
    /// Oldest first.
    pub data: Vec<Sample>,
}

/// A rolling history of one measured value, persisted below its own
/// directory.
pub struct Tracker {
    title: String,
    duration_s: u32,
    sample_count: u32,
    clock: Arc<dyn Clock>,
    data: BackedUpJsonResource,
    last_input: BackedUpJsonResource,
    last_sample: BackedUpJsonResource,
    accumulator: AverageAccumulator,
}

impl Tracker {
    /// Create a tracker persisting its state below `dir`.
    pub fn new(config: &TrackerConfig, dir: &str, persistence: &Persistence) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            title: config.title.clone(),
            duration_s: config.duration_s,
            sample_count: config.sample_count,
            clock: persistence.clock.clone(),
            data: persistence.backed_up(join(dir, "data.json")),
            last_input: persistence.backed_up(join(dir, "lastInputTimestamp.json")),
            last_sample: persistence.backed_up(join(dir, "lastSampleTimestamp.json")),
            accumulator: persistence.accumulator(join(dir, "accumulator.json")),
        })
    }

    /// Human-readable name shown by the UI.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Length of the whole window in seconds.
    pub fn duration_s(&self) -> u32 {
        self.duration_s
    }

    /// Capacity of the history.
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Width of one bucket in seconds.
    pub fn bucket_width(&self) -> u32 {
        self.duration_s / self.sample_count
    }

    /// Feed the value that has been current since the previous call.
    ///
    /// The value is weighted by the whole seconds elapsed since the last
    /// input. The very first call after creation only records the time, and a
    /// call without clock advance does nothing. Once one or more bucket
    /// boundaries have passed, the buckets without input are appended as
    /// `None` followed by the accumulated average, and the accumulator starts
    /// over.
    ///
    /// A storage failure aborts the call; the next call retries from the
    /// persisted state.
    pub fn track(&mut self, value: f64) -> Result<()> {
        let value = if value.is_finite() { value } else { 0.0 };
        let now = self.clock.now();

        let last_input = match self.last_input.load::<Timestamp>() {
            Ok(timestamp) => timestamp,
            Err(e) => {
                debug!("{}: no last input timestamp ({}), starting at {}", self.title, e, now);
                self.last_input
                    .store(&now)
                    .context("storing last input timestamp")?;
                now
            }
        };

        let elapsed = now - last_input;
        if elapsed <= 0 {
            return Ok(());
        }

        self.last_input
            .store(&now)
            .context("storing last input timestamp")?;
        let mut state = self.accumulator.state();
        state.add(value, elapsed as u64);

        let last_sample = match self.last_sample.load::<Timestamp>() {
            Ok(timestamp) => timestamp,
            Err(_) => {
                self.last_sample
                    .store(&now)
                    .context("storing last sample timestamp")?;
                now
            }
        };

        let buckets = (now - last_sample) / Timestamp::from(self.bucket_width());
        if buckets <= 0 {
            return self.accumulator.store(&state);
        }

        // An outage longer than the whole window replaces the entire history.
        let buckets = buckets.min(Timestamp::from(self.sample_count)) as usize;
        let mut samples: Vec<Sample> = Vec::with_capacity(buckets);
        samples.resize(buckets - 1, None);
        samples.push(Some(state.average()));
        if buckets > 1 {
            debug!("{}: {} buckets without input", self.title, buckets - 1);
        }

        self.update_data(samples)?;
        // One accumulator write per call: two writes within the same second
        // would leave both slots with equal modification times.
        self.accumulator.store(&AccumulatorState::default())?;
        self.last_sample
            .store(&now)
            .context("storing last sample timestamp")
    }

    /// Append `samples` and drop the oldest entries beyond `sample_count`.
    pub fn update_data(&mut self, samples: Vec<Sample>) -> Result<()> {
        let capacity = self.sample_count as usize;
        let mut data: VecDeque<Sample> = self.stored_data().into();
        data.extend(samples);
        while data.len() > capacity {
            data.pop_front();
        }

        if data.len() > capacity {
            let e = Error::CapacityExceeded {
                title: self.title.clone(),
                len: data.len(),
                capacity,
            };
            error!("{}", e);
            return Err(e);
        }

        let data: Vec<Sample> = data.into();
        self.data.store(&data).context("storing tracker data")
    }

    fn stored_data(&self) -> Vec<Sample> {
        self.data.load().unwrap_or_else(|e| {
            debug!("{}: no readable history ({}), starting empty", self.title, e);
            Vec::new()
        })
    }

    /// Current configuration and history; an unreadable history is empty.
    pub fn data(&self) -> TrackerData {
        TrackerData {
            title: self.title.clone(),
            sample_count: self.sample_count,
            duration_s: self.duration_s,
            data: self.stored_data(),
        }
    }

    /// Replace the persisted history with the `data` member of `json`, e.g. to
    /// restore a backup. The length is not checked; the next bucket rollover
    /// trims it to capacity.
    pub fn set_data(&mut self, json: &Value) -> Result<()> {
        let data = json
            .get("data")
            .ok_or_else(|| Error::InvalidData("missing \"data\" member".into()))?;
        let samples: Vec<Sample> = serde_json::from_value(data.clone())
            .map_err(|e| Error::InvalidData(e.to_string()))
            .with_context(|| alloc::format!("setting data of {}", self.title))?;
        self.data.store(&samples).context("storing tracker data")
    }

    /// Remove every persisted trace of this tracker. All resources are
    /// attempted; the first failure is returned.
    pub fn erase(&mut self) -> Result<()> {
        let results = [
            self.data.erase(),
            self.last_input.erase(),
            self.last_sample.erase(),
            self.accumulator.erase(),
        ];
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use alloc::vec;
    use serde_json::json;

    fn tracker(duration_s: u32, sample_count: u32) -> (Tracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        let persistence = Persistence::new(storage, clock.clone());
        let config = TrackerConfig::new("Test", duration_s, sample_count);
        let tracker = Tracker::new(&config, "/Trackers/test", &persistence).unwrap();
        (tracker, clock)
    }

    #[test]
    fn test_first_call_only_bootstraps() {
        let (mut tracker, clock) = tracker(60, 6);
        tracker.track(5.0).unwrap();
        assert_eq!(tracker.accumulator.count(), 0);
        assert_eq!(tracker.last_input.load::<Timestamp>().unwrap(), clock.now());
        assert!(tracker.data().data.is_empty());
    }

    #[test]
    fn test_values_are_time_weighted() {
        let (mut tracker, clock) = tracker(60, 6);
        tracker.track(0.0).unwrap();

        clock.advance(2);
        tracker.track(1.0).unwrap();
        clock.advance(6);
        tracker.track(3.0).unwrap();

        // (1.0 * 2 + 3.0 * 6) / 8
        assert_eq!(tracker.accumulator.average(), 2.5);
    }

    #[test]
    fn test_non_finite_values_count_as_zero() {
        let (mut tracker, clock) = tracker(60, 6);
        tracker.track(0.0).unwrap();
        clock.advance(1);
        tracker.track(f64::NAN).unwrap();
        clock.advance(1);
        tracker.track(f64::INFINITY).unwrap();
        clock.advance(1);
        tracker.track(3.0).unwrap();
        assert_eq!(tracker.accumulator.average(), 1.0);
    }

    #[test]
    fn test_backwards_clock_is_ignored() {
        let (mut tracker, clock) = tracker(60, 6);
        tracker.track(1.0).unwrap();
        clock.advance(5);
        tracker.track(1.0).unwrap();
        clock.advance(-3);
        tracker.track(100.0).unwrap();
        assert_eq!(tracker.accumulator.count(), 5);
    }

    #[test]
    fn test_bucket_rollover_appends_average() {
        let (mut tracker, clock) = tracker(60, 6);
        tracker.track(0.0).unwrap();
        clock.advance(1);
        tracker.track(2.0).unwrap(); // last sample timestamp starts here
        for _ in 0..10 {
            clock.advance(1);
            tracker.track(4.0).unwrap();
        }

        // (2 * 1 + 4 * 10) / 11
        let expected = 42.0 / 11.0;
        assert_eq!(tracker.data().data, vec![Some(expected)]);
        assert_eq!(tracker.accumulator.count(), 0);
    }

    #[test]
    fn test_update_data_trims_oldest() {
        let (mut tracker, _) = tracker(30, 3);
        tracker.update_data(vec![Some(1.0), Some(2.0)]).unwrap();
        tracker.update_data(vec![None, Some(4.0)]).unwrap();
        assert_eq!(tracker.data().data, vec![Some(2.0), None, Some(4.0)]);
    }

    #[test]
    fn test_set_data_validates_payload() {
        let (mut tracker, _) = tracker(30, 3);
        tracker
            .set_data(&json!({"data": [1.5, null, 2.0, 3.0]}))
            .unwrap();
        assert_eq!(
            tracker.data().data,
            vec![Some(1.5), None, Some(2.0), Some(3.0)]
        );

        assert!(tracker.set_data(&json!({"values": []})).is_err());
        assert!(tracker.set_data(&json!({"data": ["a"]})).is_err());
        assert_eq!(tracker.data().data.len(), 4);
    }

    #[test]
    fn test_data_serializes_with_api_keys() {
        let (tracker, _) = tracker(3600, 60);
        assert_eq!(
            serde_json::to_value(tracker.data()).unwrap(),
            json!({"title": "Test", "sampleCount": 60, "duration_s": 3600, "data": []})
        );
    }

    #[test]
    fn test_erase_forgets_everything() {
        let (mut tracker, clock) = tracker(2, 2);
        tracker.track(1.0).unwrap();
        clock.advance(3);
        tracker.track(1.0).unwrap();
        clock.advance(3);
        tracker.track(1.0).unwrap();
        assert!(!tracker.data().data.is_empty());

        tracker.erase().unwrap();
        assert!(tracker.data().data.is_empty());
        assert!(tracker.last_input.try_deserialize().is_err());
        assert!(tracker.last_sample.try_deserialize().is_err());
    }
}
