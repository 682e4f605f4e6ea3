//! Shared state between tasks
//!
//! A [`ValueMutex`] owns one value and hands out scoped guards, in the same
//! way the firmware's application state sits behind an embassy
//! `Mutex<CriticalSectionRawMutex, _>`. Guards release on drop; there is no
//! manual unlock to forget.
//!
//! Keep guards short-lived: never hold one across a delay.

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::mutex::{Mutex, MutexGuard};

/// A value that can only be accessed while holding its lock.
///
/// # Example
///
/// ```rust,ignore
/// static MEASUREMENTS: ValueMutex<MeasurementList> = ValueMutex::new(MeasurementList::new());
///
/// // Producer
/// MEASUREMENTS.assign(unit.measure().await?).await;
///
/// // Consumer
/// let value = MEASUREMENTS.get().await.tracker_value();
/// ```
pub struct ValueMutex<T, M: RawMutex = CriticalSectionRawMutex> {
    inner: Mutex<M, T>,
}

impl<T, M: RawMutex> ValueMutex<T, M> {
    /// Wrap `value`. Usable in `static` initialisers.
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Wait for the lock and borrow the value exclusively until the guard is
    /// dropped.
    pub async fn get(&self) -> MutexGuard<'_, M, T> {
        self.inner.lock().await
    }

    /// Borrow the value if nobody else holds the lock.
    pub fn try_get(&self) -> Option<MutexGuard<'_, M, T>> {
        self.inner.try_lock().ok()
    }

    /// Replace the value. The previous value is dropped after the lock is
    /// released.
    pub async fn assign(&self, value: T) {
        let previous = {
            let mut guard = self.inner.lock().await;
            core::mem::replace(&mut *guard, value)
        };
        drop(previous);
    }

    /// Copy the value out under the lock.
    pub async fn cloned(&self) -> T
    where
        T: Clone,
    {
        self.inner.lock().await.clone()
    }

    /// Take the value out, consuming the mutex.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default, M: RawMutex> Default for ValueMutex<T, M> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_futures::yield_now;

    #[test]
    fn test_get_and_assign() {
        let shared = ValueMutex::<u32>::new(1);
        block_on(async {
            *shared.get().await += 1;
            assert_eq!(shared.cloned().await, 2);

            shared.assign(10).await;
            assert_eq!(*shared.get().await, 10);
        });
    }

    #[test]
    fn test_try_get_fails_while_locked() {
        let shared = ValueMutex::<u32>::new(0);
        block_on(async {
            let guard = shared.get().await;
            assert!(shared.try_get().is_none());
            drop(guard);
            assert!(shared.try_get().is_some());
        });
    }

    #[test]
    fn test_guard_excludes_other_futures() {
        let shared = ValueMutex::<Vec<u32>>::new(Vec::new());
        let writer = |id: u32| {
            let shared = &shared;
            async move {
                for _ in 0..3 {
                    let mut guard = shared.get().await;
                    guard.push(id);
                    // Another future runs here, but cannot get the lock.
                    yield_now().await;
                    guard.push(id);
                }
            }
        };

        block_on(join(writer(1), writer(2)));

        let values = shared.into_inner();
        assert_eq!(values.len(), 12);
        for pair in values.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
        assert_eq!(values.iter().filter(|v| **v == 1).count(), 6);
    }
}
