//! Named, process-wide cache instances
//!
//! Callers that agree on a name and a value type get the same
//! [`TieredCache`]. Instances are built on first use while the registry lock
//! is held, so two racing callers never open the same directory twice.
//! Removed instances are remembered weakly for the same reason.

use super::codec::Codec;
use super::tiered::TieredCache;
use crate::config::CacheConfig;
use crate::core::Result;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::info;

type Entry = Arc<dyn Any + Send + Sync>;
type Slot = (String, TypeId);

lazy_static! {
    static ref GLOBAL: CacheRegistry = CacheRegistry::new();
}

#[derive(Default)]
pub struct CacheRegistry {
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    live: HashMap<Slot, Entry>,
    /// Removed caches that callers may still hold
    retired: HashMap<Slot, Weak<dyn Any + Send + Sync>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry
    pub fn global() -> &'static CacheRegistry {
        &GLOBAL
    }

    /// Shared cache named `name`, opened from `config` on first use
    ///
    /// The disk tier lives in `config.disk.path/<name>`. Later calls return
    /// the existing instance and ignore their `config` and `codec`. A cache
    /// dropped by [`remove`](Self::remove) or [`reset`](Self::reset) while
    /// handles to it are still alive is registered again instead of opening
    /// its directory a second time.
    pub fn shared<V, C>(&self, name: &str, config: CacheConfig, codec: C) -> Result<Arc<TieredCache<V>>>
    where
        V: Clone + Send + Sync + 'static,
        C: Codec<V> + 'static,
    {
        let slot = (name.to_string(), TypeId::of::<V>());
        let mut slots = self.slots.lock();

        if let Some(existing) = slots.live.get(&slot) {
            if let Ok(cache) = Arc::clone(existing).downcast::<TieredCache<V>>() {
                return Ok(cache);
            }
        }

        if let Some(retired) = slots.retired.remove(&slot) {
            if let Some(cache) = retired
                .upgrade()
                .and_then(|entry| entry.downcast::<TieredCache<V>>().ok())
            {
                slots.live.insert(slot, cache.clone() as Entry);
                info!("Re-registered shared cache {} still in use", name);
                return Ok(cache);
            }
        }

        let mut config = config;
        config.disk.path = config.disk.path.join(name);
        let cache = Arc::new(TieredCache::open(name, config, codec)?);
        slots.live.insert(slot, cache.clone() as Entry);
        info!("Registered shared cache {}", name);
        Ok(cache)
    }

    /// Whether a cache named `name` holding `V` is registered
    pub fn contains<V: 'static>(&self, name: &str) -> bool {
        self.slots
            .lock()
            .live
            .contains_key(&(name.to_string(), TypeId::of::<V>()))
    }

    /// Forget every cache named `name`; returns how many were dropped
    ///
    /// Handles already given out stay usable. Until the last of them is
    /// dropped, [`shared`](Self::shared) hands the same instance back rather
    /// than opening another cache on its directory.
    pub fn remove(&self, name: &str) -> usize {
        let mut slots = self.slots.lock();
        let names: Vec<Slot> = slots
            .live
            .keys()
            .filter(|(cached, _)| cached == name)
            .cloned()
            .collect();
        for slot in &names {
            if let Some(cache) = slots.live.remove(slot) {
                slots.retired.insert(slot.clone(), Arc::downgrade(&cache));
            }
        }
        slots.retired.retain(|_, cache| cache.strong_count() > 0);
        names.len()
    }

    /// Forget every cache
    pub fn reset(&self) {
        let mut slots = self.slots.lock();
        let dropped: Vec<(Slot, Entry)> = slots.live.drain().collect();
        for (slot, cache) in &dropped {
            slots.retired.insert(slot.clone(), Arc::downgrade(cache));
        }
        slots.retired.retain(|_, cache| cache.strong_count() > 0);
        info!("Cache registry reset ({} caches)", dropped.len());
    }

    pub fn len(&self) -> usize {
        self.slots.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
