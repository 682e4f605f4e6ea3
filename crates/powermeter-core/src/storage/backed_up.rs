use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};
use serde_json::Value;

use super::{JsonResource, JsonStore, Storage, slot_path};
use crate::clock::{Clock, Timestamp};
use crate::error::{Error, Result, ResultExt};

/// One half of a redundant resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Token inserted into the file name of this slot.
    pub const fn token(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// Which slot of each redundant resource holds the most recent good write,
/// keyed by logical path.
///
/// Probing both slots costs two reads, so the answer is remembered after the
/// first use and updated on every successful write. Clones share the same
/// table; create one per storage medium and hand it to every resource on it.
#[derive(Clone)]
pub struct FreshnessTable {
    slots: Arc<BlockingMutex<CriticalSectionRawMutex, RefCell<BTreeMap<String, Slot>>>>,
}

impl Default for FreshnessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FreshnessTable {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(BlockingMutex::new(RefCell::new(BTreeMap::new()))),
        }
    }

    pub fn get(&self, path: &str) -> Option<Slot> {
        self.slots.lock(|slots| slots.borrow().get(path).copied())
    }

    pub fn mark(&self, path: &str, slot: Slot) {
        self.slots
            .lock(|slots| slots.borrow_mut().insert(path.into(), slot));
    }

    pub fn forget(&self, path: &str) {
        self.slots.lock(|slots| slots.borrow_mut().remove(path));
    }

    /// Forget every path below `dir`, used when a tracker directory is pruned.
    pub fn forget_dir(&self, dir: &str) {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.slots.lock(|slots| {
            slots
                .borrow_mut()
                .retain(|path, _| !path.starts_with(prefix.as_str()))
        });
    }

    pub fn len(&self) -> usize {
        self.slots.lock(|slots| slots.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A JSON resource stored twice, as `name.a.ext` and `name.b.ext`.
///
/// Writes always go to the slot that does *not* hold the freshest value, and
/// that slot only becomes the freshest once the write returned successfully.
/// Power loss in the middle of a write therefore corrupts at most the stale
/// copy, and the previous value stays readable from the other slot.
///
/// On first use the freshest slot is found by probing both: a readable slot
/// beats an unreadable one, and between two readable slots the later
/// modification time wins. Modification times in the future (RTC reset) are
/// clamped to the current time; remaining ties go to slot A.
///
/// # Example
///
/// ```rust,ignore
/// let freshness = FreshnessTable::new();
/// let mut resource =
///     BackedUpJsonResource::new(storage, "/Trackers/3600_60/data.json", freshness, clock);
///
/// resource.serialize(&json!([1.0, null, 2.5]))?;
/// assert_eq!(resource.deserialize(), json!([1.0, null, 2.5]));
/// ```
pub struct BackedUpJsonResource {
    path: String,
    slots: [JsonResource; 2],
    freshness: FreshnessTable,
    clock: Arc<dyn Clock>,
}

impl BackedUpJsonResource {
    pub fn new(
        storage: Arc<dyn Storage>,
        path: impl Into<String>,
        freshness: FreshnessTable,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let path = path.into();
        let slots = [
            JsonResource::new(storage.clone(), slot_path(&path, Slot::A)),
            JsonResource::new(storage, slot_path(&path, Slot::B)),
        ];
        Self {
            path,
            slots,
            freshness,
            clock,
        }
    }

    pub fn slot(&self, slot: Slot) -> &JsonResource {
        &self.slots[slot.index()]
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut JsonResource {
        &mut self.slots[slot.index()]
    }

    /// The slot currently holding the most recent good write.
    pub fn freshest(&self) -> Slot {
        if let Some(slot) = self.freshness.get(&self.path) {
            return slot;
        }
        let slot = self.probe();
        debug!("Probed {}: slot {} is freshest", self.path, slot.token());
        self.freshness.mark(&self.path, slot);
        slot
    }

    fn probe(&self) -> Slot {
        let now = self.clock.now();
        let rank = |slot: Slot| -> (bool, Option<Timestamp>) {
            let resource = self.slot(slot);
            let valid = resource.try_deserialize().is_ok();
            let modified = resource
                .storage()
                .last_modified(resource.path())
                .map(|modified| modified.min(now));
            (valid, modified)
        };

        let (a_valid, a_modified) = rank(Slot::A);
        let (b_valid, b_modified) = rank(Slot::B);
        match (a_valid, b_valid) {
            (true, false) => Slot::A,
            (false, true) => Slot::B,
            _ if b_modified > a_modified => Slot::B,
            _ => Slot::A,
        }
    }
}

impl JsonStore for BackedUpJsonResource {
    fn path(&self) -> &str {
        &self.path
    }

    /// Read the freshest slot, falling back to the other one. Fails with
    /// [`Error::NoData`] only when neither slot is readable.
    fn try_deserialize(&self) -> Result<Value> {
        let freshest = self.freshest();
        let e = match self.slot(freshest).try_deserialize() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let backup = freshest.other();
        match self.slot(backup).try_deserialize() {
            Ok(value) => {
                warn!(
                    "Slot {} of {} is unreadable ({}), recovered from slot {}",
                    freshest.token(),
                    self.path,
                    e,
                    backup.token()
                );
                // The next write must not overwrite the only good copy.
                self.freshness.mark(&self.path, backup);
                Ok(value)
            }
            Err(_) => Err(Error::NoData {
                path: self.path.clone(),
            }),
        }
    }

    fn serialize(&mut self, value: &Value) -> Result<()> {
        let target = self.freshest().other();
        let path = self.path.clone();
        self.slot_mut(target)
            .serialize(value)
            .with_context(|| format!("writing {} (slot {})", path, target.token()))?;
        self.freshness.mark(&self.path, target);
        Ok(())
    }

    /// Erase both slots. Both are attempted even if the first one fails.
    fn erase(&mut self) -> Result<()> {
        let a = self.slot_mut(Slot::A).erase();
        let b = self.slot_mut(Slot::B).erase();
        self.freshness.forget(&self.path);
        a.and(b).with_context(|| format!("erasing {}", self.path))
    }
}
