use std::sync::Arc;

use powermeter_core::clock::ManualClock;
use powermeter_core::config::TrackerLoader;
use powermeter_core::error::StorageError;
use powermeter_core::storage::{FsStorage, JsonStore, Persistence, Slot, Storage};
use serde_json::json;
use tempfile::TempDir;

fn storage(dir: &TempDir, clock: &Arc<ManualClock>) -> Arc<FsStorage> {
    Arc::new(FsStorage::with_clock(dir.path(), clock.clone()))
}

#[test]
fn test_write_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let storage = FsStorage::new(dir.path());

    storage.write("/Trackers/3600_60/data.a.json", b"[]").unwrap();
    assert!(dir.path().join("Trackers/3600_60/data.a.json").is_file());
    assert_eq!(storage.read("/Trackers/3600_60/data.a.json").unwrap(), b"[]");
    assert_eq!(storage.list_dir("/Trackers").unwrap(), ["3600_60"]);
}

#[test]
fn test_missing_paths_report_not_found() {
    let dir = TempDir::new().unwrap();
    let storage = FsStorage::new(dir.path());

    assert_eq!(
        storage.read("/nope.json"),
        Err(StorageError::NotFound("/nope.json".into()))
    );
    assert!(matches!(
        storage.remove("/nope.json"),
        Err(StorageError::NotFound(_))
    ));
    assert!(matches!(
        storage.list_dir("/nope"),
        Err(StorageError::NotFound(_))
    ));
    storage.remove_dir("/nope").unwrap();
    assert_eq!(storage.last_modified("/nope.json"), None);
}

#[test]
fn test_modification_time_follows_clock() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let storage = storage(&dir, &clock);

    storage.write("/a.json", b"1").unwrap();
    clock.advance(3_600);
    storage.write("/b.json", b"2").unwrap();

    assert_eq!(storage.last_modified("/a.json"), Some(1_000_000));
    assert_eq!(storage.last_modified("/b.json"), Some(1_003_600));
}

#[test]
fn test_backed_up_resource_across_reboots() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000));

    {
        let persistence = Persistence::new(storage(&dir, &clock), clock.clone());
        let mut resource = persistence.backed_up("/Config/Clock.json");
        for i in 0..4 {
            clock.advance(1);
            resource.serialize(&json!({"generation": i})).unwrap();
        }
        assert_eq!(resource.freshest(), Slot::A);
    }

    // Power fails while generation 4 is being written to slot B.
    std::fs::write(dir.path().join("Config/Clock.b.json"), b"{\"generation\": 4, \"x").unwrap();

    let persistence = Persistence::new(storage(&dir, &clock), clock.clone());
    let resource = persistence.backed_up("/Config/Clock.json");
    assert_eq!(resource.deserialize(), json!({"generation": 3}));
}

#[test]
fn test_loader_on_filesystem() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    let loader = TrackerLoader::new(storage(&dir, &clock), clock.clone());

    let mut trackers = loader.load().unwrap();
    assert_eq!(trackers.len(), 5);
    for _ in 0..120 {
        trackers.track_all(230.0).unwrap();
        clock.advance(1);
    }

    assert!(dir.path().join("Config/Trackers.b.json").is_file());
    assert!(dir.path().join("Trackers/3600_60/data.b.json").is_file());
    assert_eq!(trackers.data()["3600_60"]["data"], json!([230.0]));
}
