use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{Storage, StorageError};
use crate::clock::{Clock, Timestamp};

/// [`Storage`] on a mounted filesystem (LittleFS through the ESP-IDF VFS on
/// the device, a plain directory on the host).
///
/// Storage paths are resolved relative to `root`, so `/Trackers/x/data.a.json`
/// lands in `<root>/Trackers/x/data.a.json`. Every write is flushed with
/// `sync_all` before it is reported as done.
///
/// The RTC and the filesystem's notion of time can disagree (no SNTP yet, a
/// simulated clock). With [`FsStorage::with_clock`] each written file gets its
/// modification time set from that clock instead, keeping the A/B freshness
/// probe consistent with the timestamps the trackers use.
pub struct FsStorage {
    root: PathBuf,
    clock: Option<Arc<dyn Clock>>,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock: None,
        }
    }

    pub fn with_clock(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock: Some(clock),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn map_err(path: &str, e: std::io::Error) -> StorageError {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(path.into())
        } else {
            StorageError::io(path, e)
        }
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        fs::read(self.resolve(path)).map_err(|e| Self::map_err(path, e))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(path, e))?;
        }

        let mut file = fs::File::create(&target).map_err(|e| StorageError::io(path, e))?;
        file.write_all(bytes)
            .map_err(|e| StorageError::io(path, e))?;

        if let Some(clock) = &self.clock {
            let secs = u64::try_from(clock.now()).unwrap_or_default();
            file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
                .map_err(|e| StorageError::io(path, e))?;
        }

        file.sync_all().map_err(|e| StorageError::io(path, e))
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn remove(&self, path: &str) -> Result<(), StorageError> {
        fs::remove_file(self.resolve(path)).map_err(|e| Self::map_err(path, e))
    }

    fn last_modified(&self, path: &str) -> Option<Timestamp> {
        let modified = fs::metadata(self.resolve(path)).ok()?.modified().ok()?;
        match modified.duration_since(UNIX_EPOCH) {
            Ok(since) => Some(since.as_secs() as Timestamp),
            // Before the epoch: an unset RTC. Treat it as the oldest possible time.
            Err(_) => Some(0),
        }
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let entries = fs::read_dir(self.resolve(path)).map_err(|e| Self::map_err(path, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(path, e))?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(String::from(name));
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove_dir(&self, path: &str) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }
}

impl core::fmt::Debug for FsStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FsStorage")
            .field("root", &self.root)
            .field("clock", &self.clock.is_some())
            .finish()
    }
}
