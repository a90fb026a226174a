//! Memory + disk facade
//!
//! Reads go to memory first and fall through to disk; a disk hit is promoted
//! back into memory unless a newer value got there first. Writes go to memory
//! synchronously, then to disk.

use super::codec::Codec;
use super::disk::DiskCache;
use super::memory::MemoryCache;
use crate::config::CacheConfig;
use crate::core::Result;
use tracing::debug;

/// Two-tier cache keyed by string
pub struct TieredCache<V> {
    name: String,
    memory: MemoryCache<String, V>,
    disk: DiskCache<V>,
}

impl<V> Clone for TieredCache<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            memory: self.memory.clone(),
            disk: self.disk.clone(),
        }
    }
}

impl<V> TieredCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Build both tiers from one configuration
    ///
    /// Tier names default to `name` when the configuration leaves them unset.
    pub fn open(name: &str, mut config: CacheConfig, codec: impl Codec<V> + 'static) -> Result<Self> {
        config.memory.name.get_or_insert_with(|| name.to_string());
        config.disk.name.get_or_insert_with(|| name.to_string());

        let memory = MemoryCache::new(config.memory)?;
        let disk = DiskCache::open(config.disk, codec)?;
        Ok(Self::from_parts(name, memory, disk))
    }

    pub fn from_parts(name: &str, memory: MemoryCache<String, V>, disk: DiskCache<V>) -> Self {
        Self {
            name: name.to_string(),
            memory,
            disk,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> &MemoryCache<String, V> {
        &self.memory
    }

    pub fn disk(&self) -> &DiskCache<V> {
        &self.disk
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.memory.contains_key(&key.to_string()) || self.disk.contains_key(key)
    }

    pub async fn contains_key_async(&self, key: &str) -> bool {
        if self.memory.contains_key(&key.to_string()) {
            return true;
        }
        self.disk.contains_key_async(key).await
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let owned = key.to_string();
        if let Some(value) = self.memory.get(&owned) {
            return Some(value);
        }
        let value = self.disk.get(key)?;
        self.promote(owned, &value);
        Some(value)
    }

    pub async fn get_async(&self, key: &str) -> Option<V> {
        let owned = key.to_string();
        if let Some(value) = self.memory.get(&owned) {
            return Some(value);
        }
        let value = self.disk.get_async(key).await?;
        self.promote(owned, &value);
        Some(value)
    }

    fn promote(&self, key: String, value: &V) {
        // A set racing with the disk read already holds the newer value
        if self.memory.set_if_absent(key.clone(), value.clone()) {
            debug!("Cache {} promoted {} to memory", self.name, key);
        }
    }

    /// Write to both tiers; returns whether the disk write succeeded
    ///
    /// When the disk write fails the key is dropped from memory as well, so
    /// the facade does not serve a value its durable tier never accepted.
    pub fn set(&self, key: &str, value: V) -> bool {
        let disk = self.disk.set_async(key, &value);
        self.memory.set(key.to_string(), value);
        let stored = disk.wait();
        if !stored {
            self.forget_unstored(key);
        }
        stored
    }

    pub async fn set_async(&self, key: &str, value: V) -> bool {
        let disk = self.disk.set_async(key, &value);
        self.memory.set(key.to_string(), value);
        let stored = disk.await;
        if !stored {
            self.forget_unstored(key);
        }
        stored
    }

    fn forget_unstored(&self, key: &str) {
        debug!("Cache {} dropped {} from memory after a failed disk write", self.name, key);
        self.memory.remove(&key.to_string());
    }

    /// Returns whether either tier held `key`
    pub fn remove(&self, key: &str) -> bool {
        let in_memory = self.memory.remove(&key.to_string());
        self.disk.remove(key) || in_memory
    }

    pub async fn remove_async(&self, key: &str) -> bool {
        let in_memory = self.memory.remove(&key.to_string());
        self.disk.remove_async(key).await || in_memory
    }

    pub fn remove_all(&self) -> bool {
        self.memory.remove_all();
        self.disk.remove_all()
    }

    pub async fn remove_all_async(&self) -> bool {
        self.memory.remove_all();
        self.disk.remove_all_async().await
    }

    /// Memory is cleared at once; the callbacks report the disk wipe
    pub fn remove_all_with_progress<P, E>(&self, progress: P, end: E)
    where
        P: FnMut(usize, usize) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        self.memory.remove_all();
        self.disk.remove_all_with_progress(progress, end);
    }

    pub async fn remove_all_with_progress_async<P, E>(&self, progress: P, end: E)
    where
        P: FnMut(usize, usize) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        self.memory.remove_all();
        self.disk.remove_all_with_progress_async(progress, end).await;
    }
}
