//! Bodies of the two long-running tasks
//!
//! The measuring task publishes every new [`MeasurementList`] through a
//! [`ValueMutex`]; the tracking task periodically picks up the latest one and
//! feeds its tracker value to every tracker. The two only meet at the
//! mutexes, so they can run at different rates, priorities and cores.

use embedded_hal_async::delay::DelayNs;
use log::{debug, warn};

use crate::error::{Result, ResultExt};
use crate::measurement::{MeasurementList, MeasuringUnit};
use crate::sync::ValueMutex;
use crate::tracker::TrackerMap;

/// Default pause between two measurements.
pub const MEASURING_PERIOD_MS: u32 = 500;

/// Default pause between two tracking passes.
pub const TRACKING_PERIOD_MS: u32 = 1_000;

/// Measure forever, publishing each result into `latest`.
///
/// A failing measurement ends the loop with the error, which the task
/// supervisor logs before cancelling the task.
pub async fn run_measuring<U, D>(
    unit: &mut U,
    latest: &ValueMutex<MeasurementList>,
    delay: &mut D,
    period_ms: u32,
) -> Result<()>
where
    U: MeasuringUnit,
    D: DelayNs,
{
    loop {
        let measurements = unit.measure().await.context("measuring")?;
        latest.assign(measurements).await;
        delay.delay_ms(period_ms).await;
    }
}

/// Track the latest measurement forever.
///
/// Failed passes are logged and retried on the next period; the trackers
/// resume from their persisted state.
pub async fn run_tracking<D: DelayNs>(
    latest: &ValueMutex<MeasurementList>,
    trackers: &ValueMutex<TrackerMap>,
    delay: &mut D,
    period_ms: u32,
) -> Result<()> {
    loop {
        if let Err(e) = track_latest(latest, trackers).await {
            warn!("Tracking pass failed, retrying next period: {}", e);
        }
        delay.delay_ms(period_ms).await;
    }
}

/// One tracking pass. Returns whether there was a measurement to track.
pub async fn track_latest(
    latest: &ValueMutex<MeasurementList>,
    trackers: &ValueMutex<TrackerMap>,
) -> Result<bool> {
    // Copy the value out so the measurement lock is not held during I/O.
    let value = latest.get().await.tracker_value();
    let Some(value) = value else {
        debug!("No measurement yet, skipping tracking pass");
        return Ok(false);
    };

    trackers
        .get()
        .await
        .track_all(value)
        .context("tracking pass")?;
    Ok(true)
}
