use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use super::{Storage, StorageError};
use crate::clock::{Clock, Timestamp};

struct Entry {
    bytes: Vec<u8>,
    modified: Option<Timestamp>,
}

/// RAM-backed [`Storage`], used by tests and as a scratch medium.
///
/// When built with [`MemoryStorage::with_clock`] every write stamps the file
/// with the clock's current time, which is what the A/B freshness probe reads.
pub struct MemoryStorage {
    files: BlockingMutex<CriticalSectionRawMutex, RefCell<BTreeMap<String, Entry>>>,
    clock: Option<Arc<dyn Clock>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Storage without modification times.
    pub fn new() -> Self {
        Self {
            files: BlockingMutex::new(RefCell::new(BTreeMap::new())),
            clock: None,
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock: Some(clock),
            ..Self::new()
        }
    }

    /// Overwrite a file's modification time, e.g. to simulate an RTC reset.
    pub fn set_modified(&self, path: &str, modified: Option<Timestamp>) {
        self.files.lock(|files| {
            if let Some(entry) = files.borrow_mut().get_mut(path) {
                entry.modified = modified;
            }
        });
    }

    /// All stored paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.lock(|files| files.borrow().keys().cloned().collect())
    }

    fn dir_prefix(path: &str) -> String {
        let mut prefix = path.trim_end_matches('/').to_string();
        prefix.push('/');
        prefix
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.files.lock(|files| {
            files
                .borrow()
                .get(path)
                .map(|entry| entry.bytes.clone())
                .ok_or_else(|| StorageError::NotFound(path.into()))
        })
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let modified = self.clock.as_ref().map(|clock| clock.now());
        self.files.lock(|files| {
            files.borrow_mut().insert(
                path.into(),
                Entry {
                    bytes: bytes.to_vec(),
                    modified,
                },
            );
        });
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.files.lock(|files| files.borrow().contains_key(path))
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        self.files.lock(|files| {
            files
                .borrow_mut()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(path.into()))
        })
    }

    fn last_modified(&self, path: &str) -> Option<Timestamp> {
        self.files
            .lock(|files| files.borrow().get(path).and_then(|entry| entry.modified))
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let prefix = Self::dir_prefix(path);
        let children: BTreeSet<String> = self.files.lock(|files| {
            files
                .borrow()
                .keys()
                .filter_map(|key| key.strip_prefix(prefix.as_str()))
                .filter_map(|rest| rest.split('/').next())
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect()
        });

        if children.is_empty() {
            return Err(StorageError::NotFound(path.into()));
        }
        Ok(children.into_iter().collect())
    }

    fn remove_dir(&self, path: &str) -> Result<(), StorageError> {
        let prefix = Self::dir_prefix(path);
        self.files.lock(|files| {
            files.borrow_mut().retain(|key, _| !key.starts_with(prefix.as_str()));
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_read_write_remove() {
        let storage = MemoryStorage::new();
        assert!(!storage.exists("/a.json"));
        assert_eq!(
            storage.read("/a.json"),
            Err(StorageError::NotFound("/a.json".into()))
        );

        storage.write("/a.json", b"{}").unwrap();
        assert!(storage.exists("/a.json"));
        assert_eq!(storage.read("/a.json").unwrap(), b"{}");
        assert_eq!(storage.last_modified("/a.json"), None);

        storage.remove("/a.json").unwrap();
        assert!(storage.remove("/a.json").is_err());
    }

    #[test]
    fn test_writes_are_stamped_by_clock() {
        let clock = Arc::new(ManualClock::new(500));
        let storage = MemoryStorage::with_clock(clock.clone());

        storage.write("/x", b"1").unwrap();
        clock.advance(10);
        storage.write("/y", b"2").unwrap();

        assert_eq!(storage.last_modified("/x"), Some(500));
        assert_eq!(storage.last_modified("/y"), Some(510));

        storage.set_modified("/x", Some(9_999));
        assert_eq!(storage.last_modified("/x"), Some(9_999));
    }

    #[test]
    fn test_list_and_remove_dir() {
        let storage = MemoryStorage::new();
        storage.write("/Trackers/3600_60/data.a.json", b"[]").unwrap();
        storage.write("/Trackers/3600_60/data.b.json", b"[]").unwrap();
        storage.write("/Trackers/old/data.a.json", b"[]").unwrap();
        storage.write("/Trackersfile.json", b"[]").unwrap();

        assert_eq!(
            storage.list_dir("/Trackers").unwrap(),
            ["3600_60", "old"]
        );

        storage.remove_dir("/Trackers/old").unwrap();
        assert_eq!(storage.list_dir("/Trackers/").unwrap(), ["3600_60"]);
        assert!(storage.exists("/Trackersfile.json"));
        assert!(storage.list_dir("/Nothing").is_err());
    }
}
