use core::cell::RefCell;

/// Optional in-memory mirror of a persisted value.
///
/// Reads are served from memory once populated; writes go to storage first
/// and only update the mirror after the store succeeded, so a failed write
/// never leaves the cache ahead of the medium.
#[derive(Debug)]
pub struct CachedValue<T> {
    value: RefCell<Option<T>>,
    enabled: bool,
}

impl<T: Clone> Default for CachedValue<T> {
    fn default() -> Self {
        Self::new(true)
    }
}

impl<T: Clone> CachedValue<T> {
    pub const fn new(enabled: bool) -> Self {
        Self {
            value: RefCell::new(None),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabling the cache also drops whatever it currently holds.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.invalidate();
        }
    }

    /// The cached value, if any.
    pub fn get(&self) -> Option<T> {
        self.value.borrow().clone()
    }

    pub fn is_populated(&self) -> bool {
        self.value.borrow().is_some()
    }

    /// Return the cached value, or run `load` and remember its result.
    pub fn get_or_try_load<E>(&self, load: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        if let Some(value) = self.get() {
            return Ok(value);
        }

        let value = load()?;
        if self.enabled {
            *self.value.borrow_mut() = Some(value.clone());
        }
        Ok(value)
    }

    /// Write `value` through `store`, then mirror it.
    pub fn set<E>(&self, value: T, store: impl FnOnce(&T) -> Result<(), E>) -> Result<(), E> {
        store(&value)?;
        if self.enabled {
            *self.value.borrow_mut() = Some(value);
        }
        Ok(())
    }

    pub fn invalidate(&self) {
        self.value.borrow_mut().take();
    }
}
