//! Persistent storage
//!
//! The layers, from the medium upwards:
//!
//! - [`Storage`]: capability interface over a flat, path-addressed medium
//!   ([`MemoryStorage`], and [`FsStorage`] with the `std` feature)
//! - [`JsonResource`]: one JSON document (or a member inside one) at a path
//! - [`BackedUpJsonResource`]: an A/B pair of resources that keeps the last
//!   good value readable when power is lost mid-write
//! - [`AverageAccumulator`]: a persisted running average on top of the pair

pub mod accumulator;
pub mod backed_up;
pub mod cached;
#[cfg(feature = "std")]
pub mod file;
pub mod memory;
pub mod resource;

pub use accumulator::{AccumulatorState, AverageAccumulator};
pub use backed_up::{BackedUpJsonResource, FreshnessTable, Slot};
pub use cached::CachedValue;
#[cfg(feature = "std")]
pub use file::FsStorage;
pub use memory::MemoryStorage;
pub use resource::{JsonResource, JsonStore};

pub use crate::error::StorageError;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::clock::{Clock, Timestamp};

/// A medium holding byte blobs addressed by `/`-separated paths.
///
/// Backends make no atomicity promise: a write interrupted by power loss may
/// leave the file truncated or garbled. [`BackedUpJsonResource`] is what turns
/// this into crash-safe storage.
pub trait Storage: Send + Sync {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace the content of `path`, creating parent directories as needed.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn exists(&self, path: &str) -> bool;

    /// Remove a file. Removing a missing file reports [`StorageError::NotFound`].
    fn remove(&self, path: &str) -> Result<(), StorageError>;

    /// Last modification time of `path`, if the medium records one.
    fn last_modified(&self, path: &str) -> Option<Timestamp>;

    /// Names (not full paths) of the direct children of a directory.
    fn list_dir(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Recursively remove a directory and everything below it.
    fn remove_dir(&self, path: &str) -> Result<(), StorageError>;
}

/// A storage medium together with the freshness table and clock that every
/// redundant resource on it shares.
#[derive(Clone)]
pub struct Persistence {
    pub storage: Arc<dyn Storage>,
    pub freshness: FreshnessTable,
    pub clock: Arc<dyn Clock>,
}

impl Persistence {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            freshness: FreshnessTable::new(),
            clock,
        }
    }

    pub fn backed_up(&self, path: impl Into<String>) -> BackedUpJsonResource {
        BackedUpJsonResource::new(
            self.storage.clone(),
            path,
            self.freshness.clone(),
            self.clock.clone(),
        )
    }

    pub fn accumulator(&self, path: impl Into<String>) -> AverageAccumulator {
        AverageAccumulator::new(self.backed_up(path))
    }
}

/// Join a directory and a name with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    let mut path = String::with_capacity(dir.len() + name.len() + 1);
    path.push_str(dir);
    path.push('/');
    path.push_str(name);
    path
}

/// Path of one slot of a redundant resource: the slot token is inserted before
/// the final extension of the file name, so `data.json` becomes `data.a.json`.
/// A name without an extension gets the token appended (`data` -> `data.a`).
pub fn slot_path(path: &str, slot: Slot) -> String {
    let name_start = path.rfind('/').map_or(0, |i| i + 1);
    let (dir, name) = path.split_at(name_start);
    let mut out = String::with_capacity(path.len() + 2);
    out.push_str(dir);

    match name.rfind('.') {
        Some(dot) if dot > 0 => {
            out.push_str(&name[..dot]);
            out.push('.');
            out.push_str(slot.token());
            out.push_str(&name[dot..]);
        }
        _ => {
            out.push_str(name);
            out.push('.');
            out.push_str(slot.token());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_path_inserts_token_before_extension() {
        assert_eq!(
            slot_path("/Trackers/3600_60/data.json", Slot::A),
            "/Trackers/3600_60/data.a.json"
        );
        assert_eq!(
            slot_path("/Trackers/3600_60/data.json", Slot::B),
            "/Trackers/3600_60/data.b.json"
        );
        assert_eq!(slot_path("/Config/archive.tar.json", Slot::B), "/Config/archive.tar.b.json");
    }

    #[test]
    fn test_slot_path_without_extension() {
        assert_eq!(slot_path("/state/counter", Slot::A), "/state/counter.a");
        assert_eq!(slot_path("/state/.hidden", Slot::B), "/state/.hidden.b");
        assert_eq!(slot_path("plain", Slot::A), "plain.a");
    }

    #[test]
    fn test_slot_path_ignores_dots_in_directories() {
        assert_eq!(slot_path("/v1.2/config", Slot::A), "/v1.2/config.a");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/Trackers", "3600_60"), "/Trackers/3600_60");
        assert_eq!(join("/Trackers/", "/data.json"), "/Trackers/data.json");
    }
}
