#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use embedded_hal_async::delay::DelayNs;
use powermeter_core::clock::{Clock, ManualClock};
use powermeter_core::config::TrackerConfig;
use powermeter_core::error::StorageError;
use powermeter_core::storage::{MemoryStorage, Persistence, Storage};
use powermeter_core::tracker::Tracker;

pub const START: i64 = 1_700_000_000;

/// A storage medium plus manual clock, with helpers to build resources on it
/// as a freshly booted device would.
pub struct Device {
    pub clock: Arc<ManualClock>,
    pub storage: Arc<MemoryStorage>,
}

impl Device {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let storage = Arc::new(MemoryStorage::with_clock(clock.clone()));
        Self { clock, storage }
    }

    /// New persistence context: empty freshness table, nothing cached.
    pub fn boot(&self) -> Persistence {
        Persistence::new(self.storage.clone(), self.clock.clone())
    }

    pub fn tracker(&self, duration_s: u32, sample_count: u32) -> Tracker {
        self.tracker_on(&self.boot(), duration_s, sample_count)
    }

    pub fn tracker_on(&self, persistence: &Persistence, duration_s: u32, sample_count: u32) -> Tracker {
        let config = TrackerConfig::new("Test", duration_s, sample_count);
        Tracker::new(&config, &format!("/Trackers/{}", config.default_id()), persistence)
            .expect("valid tracker config")
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }
}

/// Delay that advances a manual clock by whole seconds instead of sleeping.
pub struct ClockDelay {
    pub clock: Arc<ManualClock>,
}

impl DelayNs for ClockDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.clock.advance(i64::from(ns / 1_000_000_000));
        embassy_futures::yield_now().await;
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.clock.advance(i64::from(ms / 1_000));
        embassy_futures::yield_now().await;
    }
}

/// Memory storage whose writes below a chosen prefix fail, as if the card had
/// been pulled.
pub struct FlakyStorage {
    pub inner: MemoryStorage,
    failing: Mutex<Option<String>>,
}

impl FlakyStorage {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryStorage::with_clock(clock),
            failing: Mutex::new(None),
        }
    }

    /// Fail every write below `prefix` (`"/"` for all of them).
    pub fn fail_writes_under(&self, prefix: &str) {
        *self.failing.lock().unwrap() = Some(prefix.into());
    }

    fn check(&self, path: &str) -> Result<(), StorageError> {
        match self.failing.lock().unwrap().as_deref() {
            Some(prefix) if path.starts_with(prefix) => Err(StorageError::Io {
                path: path.into(),
                reason: "card removed".into(),
            }),
            _ => Ok(()),
        }
    }
}

impl Storage for FlakyStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.read(path)
    }
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.check(path)?;
        self.inner.write(path, bytes)
    }
    fn exists(&self, path: &str) -> bool {
        self.inner.exists(path)
    }
    fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.check(path)?;
        self.inner.remove(path)
    }
    fn last_modified(&self, path: &str) -> Option<i64> {
        self.inner.last_modified(path)
    }
    fn list_dir(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list_dir(path)
    }
    fn remove_dir(&self, path: &str) -> Result<(), StorageError> {
        self.check(path)?;
        self.inner.remove_dir(path)
    }
}
