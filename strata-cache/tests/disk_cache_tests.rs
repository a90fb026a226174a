use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_cache::{
    DiskCache, DiskCacheConfig, JsonCodec, KvStorage, RawCodec, StorageMode,
};
use tempfile::TempDir;

fn config(dir: &TempDir, inline_threshold: usize) -> DiskCacheConfig {
    DiskCacheConfig {
        path: dir.path().join("disk"),
        inline_threshold,
        auto_trim_interval_secs: 0.0,
        ..Default::default()
    }
}

fn blob_files(root: &Path) -> usize {
    fs::read_dir(root.join("blobs"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[test]
fn test_set_then_get_returns_value() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 64), RawCodec).unwrap();

    for (i, size) in [0usize, 1, 64, 65, 4096].into_iter().enumerate() {
        let value: Vec<u8> = (0..size).map(|b| (b % 251) as u8).collect();
        let key = format!("item_{}", i);
        assert!(cache.set(&key, &value));
        assert_eq!(cache.get(&key), Some(value));
    }
    assert_eq!(cache.total_count(), 5);
}

#[test]
fn test_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let cache = DiskCache::open(config(&dir, 16), RawCodec).unwrap();
        cache.set("small", &vec![1; 8]);
        cache.set("large", &vec![2; 1024]);
    }

    let cache = DiskCache::open(config(&dir, 16), RawCodec).unwrap();
    assert_eq!(cache.get("small"), Some(vec![1; 8]));
    assert_eq!(cache.get("large"), Some(vec![2; 1024]));
}

#[test]
fn test_trim_to_count_removes_least_recently_used() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 1024), RawCodec).unwrap();

    for i in 0..10 {
        cache.set(&format!("k{}", i), &vec![i as u8]);
    }
    // Touch the two oldest so they become the most recent
    assert!(cache.get("k0").is_some());
    assert!(cache.get("k1").is_some());

    assert_eq!(cache.trim_to_count(5), 5);
    assert_eq!(cache.total_count(), 5);
    for evicted in ["k2", "k3", "k4", "k5", "k6"] {
        assert!(!cache.contains_key(evicted), "{} should be evicted", evicted);
    }
    for kept in ["k0", "k1", "k7", "k8", "k9"] {
        assert!(cache.contains_key(kept), "{} should remain", kept);
    }
}

#[test]
fn test_trim_to_age() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 1024), RawCodec).unwrap();

    cache.set("old", &vec![1]);
    std::thread::sleep(Duration::from_millis(80));
    cache.set("new", &vec![2]);

    assert_eq!(cache.trim_to_age(Duration::from_millis(40)), 1);
    assert!(!cache.contains_key("old"));
    assert!(cache.contains_key("new"));
    assert_eq!(cache.trim_to_age(Duration::MAX), 0);
}

#[test]
fn test_mixed_mode_placement() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 100), RawCodec).unwrap();
    let root = dir.path().join("disk");
    assert_eq!(cache.mode(), StorageMode::Mixed { inline_threshold: 100 });

    cache.set("at_threshold", &vec![0; 100]);
    assert_eq!(blob_files(&root), 0);

    cache.set("over_threshold", &vec![0; 101]);
    assert_eq!(blob_files(&root), 1);

    // Shrinking a file-placed value moves it inline and deletes the file
    cache.set("over_threshold", &vec![0; 10]);
    assert_eq!(blob_files(&root), 0);
    assert_eq!(cache.get("over_threshold"), Some(vec![0; 10]));
}

#[test]
fn test_file_and_inline_modes() {
    let dir = TempDir::new().unwrap();

    let files = DiskCache::open(config(&dir, 0), RawCodec).unwrap();
    assert_eq!(files.mode(), StorageMode::File);
    files.set("tiny", &vec![1]);
    assert_eq!(blob_files(&dir.path().join("disk")), 1);

    let inline_dir = TempDir::new().unwrap();
    let inline = DiskCache::open(config(&inline_dir, usize::MAX), RawCodec).unwrap();
    assert_eq!(inline.mode(), StorageMode::Inline);
    inline.set("huge", &vec![1; 256 * 1024]);
    assert_eq!(blob_files(&inline_dir.path().join("disk")), 0);
}

#[test]
fn test_progress_is_monotonic_and_complete() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 32), RawCodec).unwrap();
    for i in 0..100 {
        let size = if i % 2 == 0 { 16 } else { 64 };
        cache.set(&format!("k{}", i), &vec![0; size]);
    }

    let reports = Arc::new(Mutex::new(Vec::new()));
    let ended = Arc::new(Mutex::new(Vec::new()));
    let (seen, finished) = (Arc::clone(&reports), Arc::clone(&ended));
    cache.remove_all_with_progress(
        move |removed, total| seen.lock().unwrap().push((removed, total)),
        move |ok| finished.lock().unwrap().push(ok),
    );

    let reports = reports.lock().unwrap();
    assert!(!reports.is_empty());
    assert!(reports.windows(2).all(|w| w[0].0 <= w[1].0));
    assert_eq!(*reports.last().unwrap(), (100, 100));
    assert_eq!(*ended.lock().unwrap(), vec![true]);
    assert_eq!(cache.total_count(), 0);
    assert_eq!(blob_files(&dir.path().join("disk")), 0);
}

#[tokio::test]
async fn test_async_writes_apply_in_call_order() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 64), RawCodec).unwrap();

    let first = cache.set_async("k", &vec![1]);
    let second = cache.set_async("k", &vec![2; 128]);
    // Awaiting out of order does not reorder the writes
    assert!(second.await);
    assert!(first.await);

    assert_eq!(cache.get_async("k").await, Some(vec![2; 128]));
}

#[tokio::test]
async fn test_dropped_completion_still_runs() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 64), RawCodec).unwrap();

    drop(cache.set_async("k", &vec![9]));
    assert_eq!(cache.get_async("k").await, Some(vec![9]));
    assert_eq!(cache.total_count_async().await, 1);
}

#[test]
fn test_undecodable_value_is_a_miss() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk");
    {
        let mut storage = KvStorage::open(&path, StorageMode::Inline).unwrap();
        storage.save("bad", b"not json", None, None).unwrap();
    }

    let cache = DiskCache::open(
        DiskCacheConfig {
            path,
            auto_trim_interval_secs: 0.0,
            error_logs_enabled: false,
            ..Default::default()
        },
        JsonCodec::<Vec<u32>>::new(),
    )
    .unwrap();

    assert_eq!(cache.get("bad"), None);
    assert!(cache.contains_key("bad"));
    assert!(cache.set("good", &vec![1, 2]));
    assert_eq!(cache.get("good"), Some(vec![1, 2]));
}

#[test]
fn test_missing_blob_is_a_miss_and_drops_row() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 0), RawCodec).unwrap();
    cache.set("k", &vec![1, 2, 3]);

    let info = cache.get_info("k").unwrap();
    let blob = dir
        .path()
        .join("disk/blobs")
        .join(info.filename.unwrap());
    fs::remove_file(blob).unwrap();

    assert_eq!(cache.get("k"), None);
    assert!(!cache.contains_key("k"));
    assert_eq!(cache.total_count(), 0);
}

#[test]
fn test_sweep_repairs_orphans_and_dangling_rows() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 0), RawCodec).unwrap();
    let blobs = dir.path().join("disk/blobs");

    cache.set("kept", &vec![1]);
    cache.set("dangling", &vec![2]);
    let dangling = cache.get_info("dangling").unwrap().filename.unwrap();
    fs::remove_file(blobs.join(dangling)).unwrap();
    fs::write(blobs.join("stray"), b"orphan").unwrap();
    fs::write(blobs.join(".tmp-interrupted"), b"partial").unwrap();

    let report = cache.sweep();
    assert_eq!(report.orphan_files, 1);
    assert_eq!(report.dangling_rows, 1);
    assert_eq!(report.temp_files, 1);

    assert_eq!(cache.total_count(), 1);
    assert_eq!(cache.get("kept"), Some(vec![1]));
    assert_eq!(blob_files(&dir.path().join("disk")), 1);
}

#[test]
fn test_remove_all_is_immediate() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 16), RawCodec).unwrap();
    for i in 0..20 {
        cache.set(&format!("k{}", i), &vec![0; 8 + i * 4]);
    }

    assert!(cache.remove_all());
    assert_eq!(cache.total_count(), 0);
    assert_eq!(cache.total_cost(), 0);
    assert_eq!(blob_files(&dir.path().join("disk")), 0);

    cache.set("again", &vec![5; 64]);
    assert_eq!(cache.get("again"), Some(vec![5; 64]));
}

#[test]
fn test_free_disk_space_reported() {
    let dir = TempDir::new().unwrap();
    let cache = DiskCache::open(config(&dir, 16), RawCodec).unwrap();
    assert!(cache.free_disk_space().is_some());

    // A limit no volume can meet evicts everything on the next pass
    cache.set("a", &vec![0; 64]);
    cache.set_free_disk_space_limit(u64::MAX);
    assert_eq!(cache.trim_to_limits(), 1);
    assert_eq!(cache.total_count(), 0);
}
