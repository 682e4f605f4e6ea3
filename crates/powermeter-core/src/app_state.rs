//! Application-wide shared state

use alloc::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::clock::SharedClock;
use crate::config::{TrackerLoader, TrackersConfig};
use crate::error::{Result, ResultExt};
use crate::measurement::MeasurementList;
use crate::sync::ValueMutex;
use crate::tracker::TrackerMap;

/// State shared by the measuring task, the tracking task and the REST
/// handlers. Every member is independently locked.
pub struct AppState {
    pub clock: Arc<SharedClock>,
    pub measurements: ValueMutex<MeasurementList>,
    pub trackers: ValueMutex<TrackerMap>,
}

impl AppState {
    pub fn new(clock: Arc<SharedClock>, trackers: TrackerMap) -> Self {
        Self {
            clock,
            measurements: ValueMutex::new(MeasurementList::new()),
            trackers: ValueMutex::new(trackers),
        }
    }

    /// `GET /trackers`
    pub async fn tracker_data(&self) -> Value {
        self.trackers.get().await.data()
    }

    /// `PUT /trackers`
    pub async fn set_tracker_data(&self, json: &Value) -> Result<Value> {
        self.trackers.get().await.set_data(json)
    }

    /// Persist a new tracker configuration and install the trackers built from
    /// it. The tracker lock is held throughout, so no tracking pass writes to a
    /// directory that is being pruned.
    ///
    /// Directories of removed trackers are only deleted once the new
    /// configuration is stored and installed; on any earlier failure the
    /// running trackers and their history stay as they were.
    pub async fn reconfigure_trackers(
        &self,
        loader: &TrackerLoader,
        config: &TrackersConfig,
    ) -> Result<()> {
        let mut trackers = self.trackers.get().await;
        let rebuilt = loader
            .build(config)
            .context("rebuilding trackers")?;
        loader
            .save_config(config)
            .context("saving tracker configuration")?;
        *trackers = rebuilt;
        info!("Installed {} trackers", trackers.len());

        // Stale directories are pruned again on the next load.
        if let Err(e) = loader.prune(config) {
            warn!("Failed to prune removed trackers: {}", e);
        }
        Ok(())
    }
}
