//! Disk tier
//!
//! Policy layer over [`KvStorage`]: limits, periodic trimming, value codecs
//! and sync/async execution. The storage engine lives on a dedicated worker
//! thread and every operation is one job on that thread's queue, so jobs
//! apply in the order they were called.
//!
//! Operations never return errors. A failed write behaves as if it never
//! happened and a failed read is a miss; failures are logged when
//! `error_logs_enabled` is set.

use super::codec::{Annotated, Codec, CostMetric, FilenameStrategy};
use super::executor::{Completion, SerialExecutor, Ticker};
use super::memory::timer_period;
use crate::config::{DiskCacheConfig, secs, secs_or_max};
use crate::core::{ItemInfo, Result, StorageMode, unix_millis};
use crate::storage::{KvStorage, SweepReport};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rows examined per step when trimming by a custom cost metric
const COST_BATCH: usize = 32;

#[derive(Clone)]
struct Limits {
    count: usize,
    cost: u64,
    age: Duration,
    free_disk_space: u64,
    auto_trim_interval: Duration,
    error_logs: bool,
}

/// Per-call snapshot of the settings a job needs on the worker
#[derive(Clone)]
struct Policy {
    name: Arc<str>,
    error_logs: bool,
    free_disk_space: u64,
    cost_metric: Option<CostMetric>,
}

impl Policy {
    /// Unwrap a job result, logging and substituting the default on failure
    fn or_log<T: Default>(&self, op: &str, result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(e) => {
                if self.error_logs {
                    error!("Disk cache {} {} failed: {}", self.name, op, e);
                }
                T::default()
            }
        }
    }
}

struct Inner<V> {
    name: Arc<str>,
    path: PathBuf,
    mode: StorageMode,
    worker: SerialExecutor<KvStorage>,
    codec: Arc<dyn Codec<V>>,
    filenames: RwLock<Option<Arc<dyn FilenameStrategy>>>,
    cost_metric: RwLock<Option<CostMetric>>,
    limits: RwLock<Limits>,
}

impl<V: Send + 'static> Inner<V> {
    fn policy(&self) -> Policy {
        let limits = self.limits.read();
        Policy {
            name: Arc::clone(&self.name),
            error_logs: limits.error_logs,
            free_disk_space: limits.free_disk_space,
            cost_metric: self.cost_metric.read().clone(),
        }
    }

    /// Queue a trim to every configured limit
    fn schedule_auto_trim(&self) {
        let limits = self.limits.read().clone();
        let policy = self.policy();
        self.worker.execute(move |storage| {
            let removed = policy.or_log("auto trim", trim_to_limits(storage, &limits, &policy));
            if removed > 0 {
                debug!("Disk cache {} auto trim removed {} items", policy.name, removed);
            }
        });
    }
}

/// Persistent cache of `V` values backed by a [`KvStorage`] directory
///
/// Cloning yields another handle to the same cache. The synchronous methods
/// block until the worker answers and must not be called from inside an
/// async task; use the `_async` forms there.
pub struct DiskCache<V> {
    inner: Arc<Inner<V>>,
    ticker: Arc<Ticker>,
}

impl<V> Clone for DiskCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            ticker: Arc::clone(&self.ticker),
        }
    }
}

impl<V: Send + 'static> DiskCache<V> {
    /// Open or create the cache directory at `config.path`
    ///
    /// The storage mode is picked from `inline_threshold`: `0` for file-only,
    /// `usize::MAX` for inline-only, anything else for mixed placement.
    pub fn open(config: DiskCacheConfig, codec: impl Codec<V> + 'static) -> Result<Self> {
        let mode = StorageMode::from_threshold(config.inline_threshold);
        let storage = KvStorage::open(&config.path, mode)?;
        let name: Arc<str> = config
            .name
            .clone()
            .unwrap_or_else(|| config.path.display().to_string())
            .into();

        let limits = Limits {
            count: config.count_limit.unwrap_or(usize::MAX),
            cost: config.cost_limit.unwrap_or(u64::MAX),
            age: secs_or_max(config.age_limit_secs),
            free_disk_space: config.free_disk_space_limit,
            auto_trim_interval: timer_period(secs(config.auto_trim_interval_secs)),
            error_logs: config.error_logs_enabled,
        };
        let interval = limits.auto_trim_interval;

        let inner = Arc::new(Inner {
            worker: SerialExecutor::spawn(&format!("strata-disk-{}", thread_suffix(&name)), storage)?,
            name,
            path: config.path.clone(),
            mode,
            codec: Arc::new(codec),
            filenames: RwLock::new(None),
            cost_metric: RwLock::new(None),
            limits: RwLock::new(limits),
        });

        let weak: Weak<Inner<V>> = Arc::downgrade(&inner);
        let ticker = Ticker::spawn(
            &format!("strata-disk-trim-{}", thread_suffix(&inner.name)),
            interval,
            move || {
                let inner = weak.upgrade()?;
                inner.schedule_auto_trim();
                let next = inner.limits.read().auto_trim_interval;
                Some(next)
            },
        )?;

        info!(
            "Disk cache {} opened at {:?} (mode={:?}, auto trim every {:?})",
            inner.name, inner.path, mode, interval
        );

        Ok(Self {
            inner,
            ticker: Arc::new(ticker),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn mode(&self) -> StorageMode {
        self.inner.mode
    }

    /// Free bytes on the volume holding the cache directory
    pub fn free_disk_space(&self) -> Option<u64> {
        fs2::available_space(&self.inner.path).ok()
    }

    pub fn set_count_limit(&self, limit: usize) {
        self.inner.limits.write().count = limit;
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.inner.limits.write().cost = limit;
    }

    pub fn set_age_limit(&self, limit: Duration) {
        self.inner.limits.write().age = limit;
    }

    pub fn set_free_disk_space_limit(&self, bytes: u64) {
        self.inner.limits.write().free_disk_space = bytes;
    }

    /// Restarts the timer with the new period; zero disables auto trim
    pub fn set_auto_trim_interval(&self, interval: Duration) {
        let period = timer_period(interval);
        self.inner.limits.write().auto_trim_interval = period;
        self.ticker.reschedule(period);
    }

    pub fn set_error_logs_enabled(&self, enabled: bool) {
        self.inner.limits.write().error_logs = enabled;
    }

    /// Name blob files with `strategy` instead of the hashed key
    pub fn set_filename_strategy(&self, strategy: Option<Arc<dyn FilenameStrategy>>) {
        *self.inner.filenames.write() = strategy;
    }

    /// Measure cost with `metric` instead of stored byte size
    pub fn set_cost_metric(&self, metric: Option<CostMetric>) {
        *self.inner.cost_metric.write() = metric;
    }

    fn submit<T, F>(&self, job: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut KvStorage, &Policy) -> T + Send + 'static,
    {
        let policy = self.inner.policy();
        self.inner.worker.submit(move |storage| job(storage, &policy))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.contains_key_async(key).wait()
    }

    pub fn contains_key_async(&self, key: &str) -> Completion<bool> {
        let key = key.to_string();
        self.submit(move |storage, policy| policy.or_log("contains", storage.item_exists(&key)))
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_async(key).wait()
    }

    pub fn get_async(&self, key: &str) -> Completion<Option<V>> {
        let key = key.to_string();
        let codec = Arc::clone(&self.inner.codec);
        self.submit(move |storage, policy| {
            let bytes = policy.or_log("get", storage.get_value(&key))?;
            decode(&*codec, policy, &key, &bytes)
        })
    }

    /// Value together with the extended data stored beside it
    pub fn get_annotated(&self, key: &str) -> Option<Annotated<V>> {
        self.get_annotated_async(key).wait()
    }

    pub fn get_annotated_async(&self, key: &str) -> Completion<Option<Annotated<V>>> {
        let key = key.to_string();
        let codec = Arc::clone(&self.inner.codec);
        self.submit(move |storage, policy| {
            let item = policy.or_log("get", storage.get(&key))?;
            let value = decode(&*codec, policy, &key, &item.value)?;
            Some(Annotated {
                value,
                extended_data: item.info.extended_data,
            })
        })
    }

    /// Metadata only, without reading the value or refreshing recency
    pub fn get_info(&self, key: &str) -> Option<ItemInfo> {
        let key = key.to_string();
        self.submit(move |storage, policy| policy.or_log("info", storage.get_info(&key)))
            .wait()
    }

    /// Store `value` under `key`; returns false if nothing was written
    pub fn set(&self, key: &str, value: &V) -> bool {
        self.set_async(key, value).wait()
    }

    /// The value is encoded on the calling thread, before the job is queued
    pub fn set_async(&self, key: &str, value: &V) -> Completion<bool> {
        self.save_async(key, value, None)
    }

    pub fn set_annotated(&self, key: &str, value: &Annotated<V>) -> bool {
        self.set_annotated_async(key, value).wait()
    }

    pub fn set_annotated_async(&self, key: &str, value: &Annotated<V>) -> Completion<bool> {
        self.save_async(key, &value.value, value.extended_data.clone())
    }

    fn save_async(&self, key: &str, value: &V, extended_data: Option<Vec<u8>>) -> Completion<bool> {
        let encoded = self.inner.codec.encode(value);
        let filename = self
            .inner
            .filenames
            .read()
            .as_ref()
            .map(|strategy| strategy.filename_for(key));
        let key = key.to_string();

        self.submit(move |storage, policy| {
            let bytes = match encoded {
                Ok(bytes) => bytes,
                Err(e) => return policy.or_log::<bool>("encode", Err(e)),
            };
            let saved = save_with_retry(
                storage,
                policy,
                &key,
                &bytes,
                filename.as_deref(),
                extended_data.as_deref(),
            );
            policy.or_log("set", saved.map(|()| true))
        })
    }

    pub fn remove(&self, key: &str) -> bool {
        self.remove_async(key).wait()
    }

    pub fn remove_async(&self, key: &str) -> Completion<bool> {
        let key = key.to_string();
        self.submit(move |storage, policy| policy.or_log("remove", storage.remove(&key)))
    }

    pub fn remove_all(&self) -> bool {
        self.remove_all_async().wait()
    }

    pub fn remove_all_async(&self) -> Completion<bool> {
        self.submit(|storage, policy| policy.or_log("remove all", storage.remove_all().map(|()| true)))
    }

    /// Remove every item in batches
    ///
    /// Both callbacks run on the worker thread. `progress(removed, total)`
    /// follows each batch; `end(success)` runs exactly once, with `false` if
    /// the worker could not run the wipe at all.
    pub fn remove_all_with_progress<P, E>(&self, progress: P, end: E)
    where
        P: FnMut(usize, usize) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        self.remove_all_with_progress_async(progress, end).wait()
    }

    pub fn remove_all_with_progress_async<P, E>(&self, progress: P, end: E) -> Completion<()>
    where
        P: FnMut(usize, usize) + Send + 'static,
        E: FnOnce(bool) + Send + 'static,
    {
        let guard = EndGuard { end: Some(end) };
        self.submit(move |storage, _| {
            storage.remove_all_with_progress(progress, |success| guard.finish(success));
        })
    }

    pub fn total_count(&self) -> usize {
        self.total_count_async().wait()
    }

    pub fn total_count_async(&self) -> Completion<usize> {
        self.submit(|storage, policy| policy.or_log("count", storage.count()))
    }

    /// Stored byte size, or the sum of the cost metric when one is set
    pub fn total_cost(&self) -> u64 {
        self.total_cost_async().wait()
    }

    pub fn total_cost_async(&self) -> Completion<u64> {
        self.submit(|storage, policy| policy.or_log("cost", total_cost(storage, policy)))
    }

    /// Evict least recently used items until at most `count` remain
    pub fn trim_to_count(&self, count: usize) -> usize {
        self.trim_to_count_async(count).wait()
    }

    pub fn trim_to_count_async(&self, count: usize) -> Completion<usize> {
        self.submit(move |storage, policy| {
            policy.or_log("trim to count", storage.remove_to_fit_count(count))
        })
    }

    /// Evict least recently used items until total cost is at most `cost`
    pub fn trim_to_cost(&self, cost: u64) -> usize {
        self.trim_to_cost_async(cost).wait()
    }

    pub fn trim_to_cost_async(&self, cost: u64) -> Completion<usize> {
        self.submit(move |storage, policy| {
            policy.or_log("trim to cost", trim_to_cost(storage, policy, cost))
        })
    }

    /// Remove items last written more than `age` ago
    pub fn trim_to_age(&self, age: Duration) -> usize {
        self.trim_to_age_async(age).wait()
    }

    pub fn trim_to_age_async(&self, age: Duration) -> Completion<usize> {
        self.submit(move |storage, policy| policy.or_log("trim to age", trim_to_age(storage, age)))
    }

    /// Delete orphan blobs, stale temp files and rows whose blob is missing
    pub fn sweep(&self) -> SweepReport {
        self.sweep_async().wait()
    }

    pub fn sweep_async(&self) -> Completion<SweepReport> {
        self.submit(|storage, policy| policy.or_log("sweep", storage.sweep()))
    }

    /// Run one auto-trim pass now and wait for it
    pub fn trim_to_limits(&self) -> usize {
        let limits = self.inner.limits.read().clone();
        self.submit(move |storage, policy| {
            policy.or_log("trim", trim_to_limits(storage, &limits, policy))
        })
        .wait()
    }
}

/// Calls `end(false)` if dropped before the wipe reports, e.g. when the job
/// never runs because the worker is gone
struct EndGuard<E: FnOnce(bool)> {
    end: Option<E>,
}

impl<E: FnOnce(bool)> EndGuard<E> {
    fn finish(mut self, success: bool) {
        if let Some(end) = self.end.take() {
            end(success);
        }
    }
}

impl<E: FnOnce(bool)> Drop for EndGuard<E> {
    fn drop(&mut self) {
        if let Some(end) = self.end.take() {
            end(false);
        }
    }
}

fn thread_suffix(name: &str) -> String {
    // Linux truncates thread names; keep the tail, which is the most specific part
    let tail: Vec<char> = name.chars().rev().take(24).collect();
    tail.into_iter().rev().collect()
}

fn decode<V>(codec: &dyn Codec<V>, policy: &Policy, key: &str, bytes: &[u8]) -> Option<V> {
    match codec.decode(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            if policy.error_logs {
                error!("Disk cache {} could not decode {}: {}", policy.name, key, e);
            }
            None
        }
    }
}

fn save_with_retry(
    storage: &mut KvStorage,
    policy: &Policy,
    key: &str,
    bytes: &[u8],
    filename: Option<&str>,
    extended_data: Option<&[u8]>,
) -> Result<()> {
    match storage.save(key, bytes, filename, extended_data) {
        Err(e) if e.is_storage_full() => {
            warn!(
                "Disk cache {} is full while saving {}, reclaiming space",
                policy.name, key
            );
            let wanted = policy.free_disk_space.saturating_add(bytes.len() as u64);
            reclaim_free_space(storage, wanted)?;
            storage.save(key, bytes, filename, extended_data)
        }
        other => other,
    }
}

fn trim_to_limits(storage: &mut KvStorage, limits: &Limits, policy: &Policy) -> Result<usize> {
    let mut removed = 0;
    if limits.cost < u64::MAX {
        removed += trim_to_cost(storage, policy, limits.cost)?;
    }
    if limits.count < usize::MAX {
        removed += storage.remove_to_fit_count(limits.count)?;
    }
    removed += trim_to_age(storage, limits.age)?;
    if limits.free_disk_space > 0 {
        removed += reclaim_free_space(storage, limits.free_disk_space)?;
    }
    Ok(removed)
}

fn total_cost(storage: &KvStorage, policy: &Policy) -> Result<u64> {
    match &policy.cost_metric {
        None => storage.total_size(),
        Some(metric) => {
            let mut total: u64 = 0;
            storage.visit_infos(|info| total = total.saturating_add(metric(info)))?;
            Ok(total)
        }
    }
}

fn trim_to_cost(storage: &mut KvStorage, policy: &Policy, max_cost: u64) -> Result<usize> {
    let Some(metric) = &policy.cost_metric else {
        return storage.remove_to_fit_size(max_cost);
    };

    let mut total = total_cost(storage, policy)?;
    let mut removed = 0;
    while total > max_cost {
        let batch = storage.least_recent_infos(COST_BATCH)?;
        if batch.is_empty() {
            break;
        }
        let mut keys = Vec::with_capacity(batch.len());
        for info in &batch {
            if total <= max_cost {
                break;
            }
            total = total.saturating_sub(metric(info));
            keys.push(info.key.clone());
        }
        let n = storage.remove_batch(&keys)?;
        if n == 0 {
            break;
        }
        removed += n;
    }
    Ok(removed)
}

fn trim_to_age(storage: &mut KvStorage, age: Duration) -> Result<usize> {
    let Ok(age_ms) = i64::try_from(age.as_millis()) else {
        return Ok(0);
    };
    match unix_millis().checked_sub(age_ms) {
        Some(cutoff) => storage.remove_older_than(cutoff),
        None => Ok(0),
    }
}

/// Evict LRU items until the volume has `wanted` free bytes, or the cache is empty
fn reclaim_free_space(storage: &mut KvStorage, wanted: u64) -> Result<usize> {
    let free = fs2::available_space(storage.path())?;
    if free >= wanted {
        return Ok(0);
    }
    let total = storage.total_size()?;
    let target = total.saturating_sub(wanted - free);
    let removed = storage.remove_to_fit_size(target)?;
    if removed > 0 {
        info!(
            "Evicted {} items at {:?} to keep {} bytes free",
            removed,
            storage.path(),
            wanted
        );
    }
    Ok(removed)
}
