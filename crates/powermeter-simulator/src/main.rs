//! Desktop simulator for the powermeter-rs tracking pipeline.
//!
//! Runs the measuring and tracking tasks against a synthetic AC front end and
//! persists everything under a data directory on the host filesystem, using
//! the same layout the device uses on its flash partition.
//!
//! # Usage
//!
//! ```text
//! powermeter-simulator [DATA_DIR] [RUN_SECS]
//! ```
//!
//! | Argument   | Default            | Meaning                              |
//! |------------|--------------------|--------------------------------------|
//! | `DATA_DIR` | `./powermeter-data`| Root of the simulated flash          |
//! | `RUN_SECS` | `30`               | Wall-clock seconds before shutdown   |
//!
//! Select the simulation clock in `Config/Clock.json` to fast-forward time:
//!
//! ```json
//! {"version": "0.0.0", "selected": "Simulation",
//!  "options": {"Simulation": {"startTimestamp": 1704067200, "fastForward": 60.0}}}
//! ```
//!
//! Set `RUST_LOG=debug` to see every tracker rollover.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use powermeter_core::Result;
use powermeter_core::app_state::AppState;
use powermeter_core::clock::{Clock, SharedClock, SystemClock};
use powermeter_core::config::{CLOCK_CONFIG_PATH, ClockConfig, TrackerLoader, load_config};
use powermeter_core::measurement::{AcPower, MeasurementList, MeasuringUnit};
use powermeter_core::sampling::{
    MEASURING_PERIOD_MS, TRACKING_PERIOD_MS, run_measuring, run_tracking,
};
use powermeter_core::storage::{FsStorage, Persistence, Storage};
use powermeter_core::task::{
    CpuCore, StdDelay, Task, TaskConfig, TaskHandle, TaskSpawner, ThreadSpawner,
};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

const DEFAULT_DATA_DIR: &str = "./powermeter-data";

const DEFAULT_RUN_SECS: u64 = 30;

/// Interval between two tracker dumps in the log.
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period for the tasks to observe cancellation.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Mock AC front end
// ---------------------------------------------------------------------------

/// Generates a slowly varying single-phase load.
struct SimulatedMeter {
    clock: Arc<dyn Clock>,
    voltage_v: (f64, f64),
    current_a: (f64, f64),
    power_factor: (f64, f64),
}

impl SimulatedMeter {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            voltage_v: (225.0, 235.0),
            current_a: (0.5, 8.0),
            power_factor: (0.8, 1.0),
        }
    }

    /// Map a sine of period `period_s` onto `(min, max)`.
    fn wave((min, max): (f64, f64), t: f64, period_s: f64) -> f64 {
        let phase = (t / period_s * core::f64::consts::TAU).sin();
        min + (max - min) * (phase + 1.0) / 2.0
    }

    fn sample(&self) -> AcPower {
        let t = self.clock.now() as f64;

        // Mains wanders slowly, the load follows a daily cycle with a faster ripple.
        let voltage = Self::wave(self.voltage_v, t, 600.0);
        let current = 0.8 * Self::wave(self.current_a, t, 86_400.0)
            + 0.2 * Self::wave(self.current_a, t, 300.0);
        let power_factor = Self::wave(self.power_factor, t, 3_600.0);

        AcPower::new(voltage, current, voltage * current * power_factor)
    }
}

impl MeasuringUnit for SimulatedMeter {
    async fn measure(&mut self) -> Result<MeasurementList> {
        Ok(self.sample().measurements())
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

struct Args {
    data_dir: PathBuf,
    run_for: Duration,
}

fn parse_args() -> Args {
    let mut args = std::env::args().skip(1);
    let data_dir = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let run_secs = match args.next() {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid run time {:?}", raw);
            DEFAULT_RUN_SECS
        }),
        None => DEFAULT_RUN_SECS,
    };

    Args {
        data_dir,
        run_for: Duration::from_secs(run_secs),
    }
}

/// Load the clock configuration and install the selected clock.
///
/// The configuration itself lives on storage stamped by the shared clock, so
/// the system clock is used until the configured one is known.
fn install_clock(storage: Arc<dyn Storage>, shared: &Arc<SharedClock>) -> Result<()> {
    let persistence = Persistence::new(storage, shared.clone());
    let mut resource = persistence.backed_up(CLOCK_CONFIG_PATH);
    let config: ClockConfig = load_config(&mut resource)?;

    info!("Using {:?} clock", config.selected);
    shared.replace(config.build());
    Ok(())
}

fn start(args: &Args) -> Result<(Arc<AppState>, Vec<TaskHandle>)> {
    let clock = Arc::new(SharedClock::new(Arc::new(SystemClock)));
    let storage: Arc<dyn Storage> =
        Arc::new(FsStorage::with_clock(args.data_dir.clone(), clock.clone()));

    install_clock(storage.clone(), &clock)?;

    let loader = TrackerLoader::new(storage, clock.clone());
    let trackers = loader.load()?;
    info!(
        "Loaded trackers: {}",
        trackers.ids().collect::<Vec<_>>().join(", ")
    );

    let state = Arc::new(AppState::new(clock.clone(), trackers));
    let spawner = ThreadSpawner;
    let mut handles = Vec::new();

    let measuring_state = state.clone();
    let measuring_clock: Arc<dyn Clock> = clock.clone();
    let measuring = Task::new(
        TaskConfig::new("measuring")
            .priority(2)
            .pinned_to(CpuCore::Core1),
        move |_handle| async move {
            let mut meter = SimulatedMeter::new(measuring_clock);
            run_measuring(
                &mut meter,
                &measuring_state.measurements,
                &mut StdDelay,
                MEASURING_PERIOD_MS,
            )
            .await
        },
    );
    handles.push(spawner.spawn(measuring)?);

    let tracking_state = state.clone();
    let tracking = Task::new(TaskConfig::new("tracking"), move |_handle| async move {
        run_tracking(
            &tracking_state.measurements,
            &tracking_state.trackers,
            &mut StdDelay,
            TRACKING_PERIOD_MS,
        )
        .await
    });
    handles.push(spawner.spawn(tracking)?);

    Ok((state, handles))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    let args = parse_args();
    info!("Starting powermeter-rs simulator");
    info!(
        "Data directory: {} (running for {} s)",
        args.data_dir.display(),
        args.run_for.as_secs()
    );

    let (state, handles) = match start(&args) {
        Ok(started) => started,
        Err(e) => {
            error!("Startup failed: {}", e);
            return;
        }
    };

    let started = Instant::now();
    while started.elapsed() < args.run_for {
        std::thread::sleep(REPORT_INTERVAL.min(args.run_for.saturating_sub(started.elapsed())));

        if let Some(failed) = handles.iter().find(|h| h.state().is_done()) {
            error!("Task {} stopped early ({:?})", failed.name(), failed.state());
            break;
        }

        let latest = embassy_futures::block_on(state.measurements.cloned());
        if let Some(power) = latest.tracker_value() {
            info!("Latest active power: {:.1} W", power);
        }
        match serde_json::to_string(&embassy_futures::block_on(state.tracker_data())) {
            Ok(json) => info!("Trackers: {}", json),
            Err(e) => warn!("Failed to render tracker data: {}", e),
        }
    }

    info!("Shutting down");
    for handle in &handles {
        handle.cancel();
    }

    let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
    while handles.iter().any(|h| !h.state().is_done()) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    for handle in &handles {
        info!("Task {} finished as {:?}", handle.name(), handle.state());
    }
}
