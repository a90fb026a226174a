use std::sync::Arc;
use strata_cache::{
    BincodeCodec, CacheConfig, CacheRegistry, MemoryCache, MemoryCacheConfig, RawCodec,
    TieredCache,
};
use tempfile::TempDir;

fn config(dir: &TempDir) -> CacheConfig {
    let mut config = CacheConfig::default();
    config.disk.path = dir.path().to_path_buf();
    config.disk.auto_trim_interval_secs = 0.0;
    config.memory.auto_trim_interval_secs = 0.0;
    config
}

#[test]
fn test_promotion_after_memory_eviction() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.disk.path = dir.path().join("tiered");
    let cache = TieredCache::open("promo", config, BincodeCodec::<String>::new()).unwrap();

    cache.set("a", "alpha".to_string());
    cache.set("b", "beta".to_string());
    cache.memory().trim_to_count(0);
    assert_eq!(cache.memory().total_count(), 0);

    assert_eq!(cache.get("a").as_deref(), Some("alpha"));
    assert!(cache.memory().contains_key(&"a".to_string()));
    assert!(!cache.memory().contains_key(&"b".to_string()));
}

#[test]
fn test_memory_limit_does_not_lose_disk_copy() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.disk.path = dir.path().join("tiered");
    config.memory.count_limit = Some(2);
    let cache = TieredCache::open("bounded", config, RawCodec).unwrap();

    for i in 0..5u8 {
        cache.set(&format!("k{}", i), vec![i]);
    }
    cache.memory().flush_housekeeping();

    assert_eq!(cache.memory().total_count(), 2);
    assert_eq!(cache.disk().total_count(), 5);
    for i in 0..5u8 {
        assert_eq!(cache.get(&format!("k{}", i)), Some(vec![i]));
    }
}

#[test]
fn test_progress_wipe_clears_both_tiers() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.disk.path = dir.path().join("tiered");
    let cache = TieredCache::open("wipe", config, RawCodec).unwrap();
    for i in 0..40u8 {
        cache.set(&format!("k{}", i), vec![i; 32]);
    }

    let (tx, rx) = std::sync::mpsc::channel();
    cache.remove_all_with_progress(|_, _| {}, move |ok| tx.send(ok).unwrap());

    assert!(rx.recv().unwrap());
    assert_eq!(cache.memory().total_count(), 0);
    assert!(!cache.contains_key("k0"));
}

#[test]
fn test_registry_shares_instances_by_name() {
    let dir = TempDir::new().unwrap();
    let registry = CacheRegistry::new();

    let first: Arc<TieredCache<Vec<u8>>> = registry.shared("thumbs", config(&dir), RawCodec).unwrap();
    first.set("k", vec![1, 2]);

    let again: Arc<TieredCache<Vec<u8>>> = registry.shared("thumbs", config(&dir), RawCodec).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(again.get("k"), Some(vec![1, 2]));

    let other: Arc<TieredCache<Vec<u8>>> = registry.shared("avatars", config(&dir), RawCodec).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(other.get("k"), None);
}

#[test]
fn test_memory_cache_trims_exact_lru_order() {
    let cache: MemoryCache<u32, String> = MemoryCache::new(MemoryCacheConfig {
        auto_trim_interval_secs: 0.0,
        ..Default::default()
    })
    .unwrap();
    for i in 0..8 {
        cache.set(i, i.to_string());
    }
    cache.get(&0);
    cache.get(&3);

    assert_eq!(cache.trim_to_count(3), 5);
    assert_eq!(cache.keys(), vec![3, 0, 7]);
}
