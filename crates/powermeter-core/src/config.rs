//! Persisted configuration
//!
//! Configuration documents carry a semantic `version`. A stored document whose
//! major version differs from the firmware's default is replaced by the
//! default, so incompatible layouts never reach the deserializers twice.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::{Clock, Timestamp};
use crate::error::{Error, Result, ResultExt};
use crate::storage::{JsonStore, Persistence, Storage, StorageError, join};
use crate::tracker::{Tracker, TrackerMap};

pub const TRACKERS_CONFIG_PATH: &str = "/Config/Trackers.json";
pub const CLOCK_CONFIG_PATH: &str = "/Config/Clock.json";
pub const TRACKERS_ROOT: &str = "/Trackers";

/// A configuration document with a semantic version.
pub trait VersionedConfig: Serialize + DeserializeOwned + Default {
    fn version(&self) -> &str;
}

/// Major component of a `major.minor.patch` version string.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Load a configuration document, falling back to (and persisting) the
/// default when the stored one is missing, unreadable, or of another major
/// version.
pub fn load_config<T: VersionedConfig>(resource: &mut impl JsonStore) -> Result<T> {
    let default = T::default();
    match resource.load::<T>() {
        Ok(config) if major_version(config.version()) == major_version(default.version()) => {
            Ok(config)
        }
        Ok(config) => {
            warn!(
                "{} has version {}, replacing it with defaults {}",
                resource.path(),
                config.version(),
                default.version()
            );
            resource
                .store(&default)
                .with_context(|| format!("writing default {}", resource.path()))?;
            Ok(default)
        }
        Err(e) => {
            info!("Writing default {}: {}", resource.path(), e);
            resource
                .store(&default)
                .with_context(|| format!("writing default {}", resource.path()))?;
            Ok(default)
        }
    }
}

/// Apply an RFC 7386 JSON merge patch: objects merge recursively, `null`
/// removes a member, anything else replaces the target.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.as_str()).or_insert(Value::Null), value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Trackers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub title: String,
    pub duration_s: u32,
    #[serde(rename = "sampleCount")]
    pub sample_count: u32,
}

impl TrackerConfig {
    pub fn new(title: impl Into<String>, duration_s: u32, sample_count: u32) -> Self {
        Self {
            title: title.into(),
            duration_s,
            sample_count,
        }
    }

    /// `"<duration_s>_<sampleCount>"`, the id the REST API assigns.
    pub fn default_id(&self) -> String {
        format!("{}_{}", self.duration_s, self.sample_count)
    }

    /// A tracker needs at least one bucket, and buckets of at least a second.
    pub fn validate(&self) -> Result<()> {
        if self.sample_count == 0 {
            return Err(Error::InvalidConfig(format!(
                "tracker {:?} has a sample count of 0",
                self.title
            )));
        }
        if self.duration_s / self.sample_count == 0 {
            return Err(Error::InvalidConfig(format!(
                "tracker {:?}: {} samples over {} s is less than a second per sample",
                self.title, self.sample_count, self.duration_s
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackersConfig {
    pub version: String,
    pub trackers: BTreeMap<String, TrackerConfig>,
}

impl Default for TrackersConfig {
    fn default() -> Self {
        let trackers = [
            ("Last 60 Minutes", 3_600, 60),
            ("Last 24 Hours", 86_400, 24),
            ("Last 7 Days", 604_800, 7),
            ("Last 30 Days", 2_592_000, 30),
            ("Last 12 Months", 31_104_000, 12),
        ]
        .into_iter()
        .map(|(title, duration_s, sample_count)| {
            let config = TrackerConfig::new(title, duration_s, sample_count);
            (config.default_id(), config)
        })
        .collect();

        Self {
            version: "0.0.0".into(),
            trackers,
        }
    }
}

impl VersionedConfig for TrackersConfig {
    fn version(&self) -> &str {
        &self.version
    }
}

impl TrackersConfig {
    pub fn validate(&self) -> Result<()> {
        for (id, tracker) in &self.trackers {
            tracker.validate().with_context(|| format!("tracker {}", id))?;
        }
        Ok(())
    }

    /// Add (or replace) a tracker under its default id, which is returned.
    pub fn add_tracker(&mut self, tracker: TrackerConfig) -> Result<String> {
        tracker.validate()?;
        let id = tracker.default_id();
        self.trackers.insert(id.clone(), tracker);
        Ok(id)
    }

    /// Remove trackers by id. Nothing is removed if any id is unknown.
    pub fn remove_trackers<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<()> {
        let ids: Vec<&str> = ids.iter().map(|id| id.as_ref()).collect();
        if let Some(unknown) = ids.iter().find(|id| !self.trackers.contains_key(**id)) {
            return Err(Error::UnknownTracker((*unknown).into()));
        }
        for id in ids {
            self.trackers.remove(id);
        }
        Ok(())
    }

    /// Apply a JSON merge patch, e.g. `{"trackers": {"60_6": null}}`. The
    /// configuration is left untouched if the result is invalid.
    pub fn merge_patch(&mut self, patch: &Value) -> Result<()> {
        let mut document =
            serde_json::to_value(&*self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        merge_patch(&mut document, patch);
        let patched: Self =
            serde_json::from_value(document).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        patched.validate()?;
        *self = patched;
        Ok(())
    }
}

/// Builds [`TrackerMap`]s from configuration on one storage medium.
///
/// Every tracker lives in `<root>/<id>/`. Directories below `root` that no
/// longer correspond to a configured tracker are only deleted by [`prune`],
/// which callers run once the configuration is persisted.
///
/// [`prune`]: TrackerLoader::prune
pub struct TrackerLoader {
    persistence: Persistence,
    root: String,
}

impl TrackerLoader {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            persistence: Persistence::new(storage, clock),
            root: TRACKERS_ROOT.into(),
        }
    }

    /// Keep tracker directories below `root` instead of [`TRACKERS_ROOT`].
    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    /// Storage, freshness table and clock shared by every built tracker.
    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Stored tracker configuration, or the (persisted) default.
    pub fn load_config(&self) -> Result<TrackersConfig> {
        let mut resource = self.persistence.backed_up(TRACKERS_CONFIG_PATH);
        let config: TrackersConfig = load_config(&mut resource)?;
        config.validate().context("stored tracker configuration")?;
        Ok(config)
    }

    pub fn save_config(&self, config: &TrackersConfig) -> Result<()> {
        config.validate()?;
        self.persistence
            .backed_up(TRACKERS_CONFIG_PATH)
            .store(config)
    }

    /// Build one tracker per configured entry. Nothing on storage is touched.
    pub fn build(&self, config: &TrackersConfig) -> Result<TrackerMap> {
        let mut map = TrackerMap::new();
        for (id, tracker_config) in &config.trackers {
            let dir = join(&self.root, id);
            let tracker = Tracker::new(tracker_config, &dir, &self.persistence)
                .with_context(|| format!("tracker {}", id))?;
            map.insert(id.clone(), tracker);
        }
        info!("Built {} trackers", map.len());
        Ok(map)
    }

    /// Load the stored configuration, build its trackers and prune stale
    /// tracker directories.
    pub fn load(&self) -> Result<TrackerMap> {
        let config = self.load_config()?;
        let map = self.build(&config)?;
        self.prune(&config)?;
        Ok(map)
    }

    /// Delete the directories of trackers `config` no longer lists.
    pub fn prune(&self, config: &TrackersConfig) -> Result<()> {
        self.prune_except(config.trackers.keys().map(String::as_str).collect())
    }

    fn prune_except(&self, keep: BTreeSet<&str>) -> Result<()> {
        let existing = match self.persistence.storage.list_dir(&self.root) {
            Ok(names) => names,
            Err(StorageError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(Error::from(e).context("listing tracker directories")),
        };

        let stale: Vec<String> = existing
            .into_iter()
            .filter(|name| !keep.contains(name.as_str()))
            .collect();
        for name in stale {
            let dir = join(&self.root, &name);
            info!("Removing stale tracker directory {}", dir);
            self.persistence
                .storage
                .remove_dir(&dir)
                .with_context(|| format!("removing {}", dir))?;
            self.persistence.freshness.forget_dir(&dir);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockKind {
    #[default]
    System,
    Simulation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationClockConfig {
    pub start_timestamp: Timestamp,
    pub fast_forward: f64,
}

impl Default for SimulationClockConfig {
    fn default() -> Self {
        Self {
            // 2024-01-01T00:00:00Z
            start_timestamp: 1_704_067_200,
            fast_forward: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockOptions {
    #[serde(rename = "System", default)]
    pub system: Map<String, Value>,
    #[serde(rename = "Simulation", default)]
    pub simulation: SimulationClockConfig,
}

/// `{"version", "selected": "System" | "Simulation", "options": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockConfig {
    pub version: String,
    pub selected: ClockKind,
    #[serde(default)]
    pub options: ClockOptions,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            version: "0.0.0".into(),
            selected: ClockKind::System,
            options: ClockOptions::default(),
        }
    }
}

impl VersionedConfig for ClockConfig {
    fn version(&self) -> &str {
        &self.version
    }
}

#[cfg(feature = "std")]
impl ClockConfig {
    /// Instantiate the selected clock.
    pub fn build(&self) -> Arc<dyn Clock> {
        use crate::clock::{SimulationClock, SystemClock};

        match self.selected {
            ClockKind::System => Arc::new(SystemClock),
            ClockKind::Simulation => {
                let options = &self.options.simulation;
                Arc::new(SimulationClock::new(
                    options.start_timestamp,
                    options.fast_forward,
                ))
            }
        }
    }
}
