//! Time sources
//!
//! All persisted timestamps are whole seconds since the Unix epoch. The
//! trackers only ever see the [`Clock`] trait; which implementation backs it
//! is decided by configuration and may change at runtime through
//! [`SharedClock`].

use alloc::sync::Arc;
use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// A clock that only moves when told to. Used by tests and by the simulated
/// delay that drives the sampling loops.
pub struct ManualClock {
    now: BlockingMutex<CriticalSectionRawMutex, Cell<Timestamp>>,
}

impl ManualClock {
    pub const fn new(start: Timestamp) -> Self {
        Self {
            now: BlockingMutex::new(Cell::new(start)),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.lock(|cell| cell.set(now));
    }

    /// Move the clock forward (or backward, for negative `secs`).
    pub fn advance(&self, secs: i64) {
        self.now.lock(|cell| cell.set(cell.get() + secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.lock(Cell::get)
    }
}

/// Holds the clock implementation currently in use.
///
/// Everything that needs the time keeps an `Arc<SharedClock>` (usually as
/// `Arc<dyn Clock>`), and a configuration change swaps the implementation
/// underneath with [`SharedClock::replace`].
pub struct SharedClock {
    current: BlockingMutex<CriticalSectionRawMutex, RefCell<Arc<dyn Clock>>>,
}

impl SharedClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            current: BlockingMutex::new(RefCell::new(clock)),
        }
    }

    /// Install a new implementation, returning the previous one.
    pub fn replace(&self, clock: Arc<dyn Clock>) -> Arc<dyn Clock> {
        self.current.lock(|current| current.replace(clock))
    }

    pub fn current(&self) -> Arc<dyn Clock> {
        self.current.lock(|current| current.borrow().clone())
    }
}

impl Clock for SharedClock {
    fn now(&self) -> Timestamp {
        // Query outside the lock; the implementation may take its own.
        self.current().now()
    }
}

#[cfg(feature = "std")]
pub use self::wall::{SimulationClock, SystemClock};

#[cfg(feature = "std")]
mod wall {
    use super::{Clock, Timestamp};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    /// The host's real-time clock (set by SNTP on the device).
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> Timestamp {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as Timestamp)
                .unwrap_or_default()
        }
    }

    /// Starts at a configured timestamp and runs `fast_forward` times faster
    /// than real time.
    #[derive(Debug, Clone)]
    pub struct SimulationClock {
        start_timestamp: Timestamp,
        fast_forward: f64,
        started: Instant,
    }

    impl SimulationClock {
        pub fn new(start_timestamp: Timestamp, fast_forward: f64) -> Self {
            let fast_forward = if fast_forward.is_finite() && fast_forward > 0.0 {
                fast_forward
            } else {
                1.0
            };
            Self {
                start_timestamp,
                fast_forward,
                started: Instant::now(),
            }
        }

        pub fn fast_forward(&self) -> f64 {
            self.fast_forward
        }
    }

    impl Clock for SimulationClock {
        fn now(&self) -> Timestamp {
            let elapsed = self.started.elapsed().as_secs_f64() * self.fast_forward;
            self.start_timestamp + elapsed as Timestamp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(60);
        assert_eq!(clock.now(), 1_060);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn test_shared_clock_swaps_implementation() {
        let first = Arc::new(ManualClock::new(10));
        let shared = SharedClock::new(first.clone());
        assert_eq!(shared.now(), 10);

        first.advance(5);
        assert_eq!(shared.now(), 15);

        let previous = shared.replace(Arc::new(ManualClock::new(99)));
        assert_eq!(previous.now(), 15);
        assert_eq!(shared.now(), 99);
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_simulation_clock_starts_at_configured_time() {
        let clock = SimulationClock::new(1_700_000_000, 1.0);
        let now = clock.now();
        assert!((1_700_000_000..1_700_000_005).contains(&now));
    }

    #[cfg(feature = "std")]
    #[test]
    fn test_simulation_clock_rejects_bad_fast_forward() {
        assert_eq!(SimulationClock::new(0, -3.0).fast_forward(), 1.0);
        assert_eq!(SimulationClock::new(0, f64::NAN).fast_forward(), 1.0);
    }
}
