//! Memory tier
//!
//! Bounded in-process LRU cache of arbitrary values. Every operation holds a
//! single mutex for an O(1) map and list splice; evicted values are released
//! outside the lock according to the configured [`ReleaseMode`].

use super::executor::{SerialExecutor, Ticker};
use super::lru::LruMap;
use crate::config::{MemoryCacheConfig, secs, secs_or_max};
use crate::core::{CacheStats, Result};
use parking_lot::{Mutex, RwLock};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Where evicted values are dropped
pub trait ReleasePolicy<V>: Send + Sync {
    fn release(&self, values: Vec<V>);
}

/// Hands evicted values to an owning thread over a channel
///
/// For values that must be dropped on a particular thread: that thread keeps
/// the receiver and drops what arrives.
pub struct ChannelRelease<V> {
    tx: mpsc::UnboundedSender<Vec<V>>,
}

impl<V> ChannelRelease<V> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<V>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<V: Send> ReleasePolicy<V> for ChannelRelease<V> {
    fn release(&self, values: Vec<V>) {
        // A closed receiver means the owner is gone; drop here instead
        let _ = self.tx.send(values);
    }
}

/// Deallocation policy for removed values
pub enum ReleaseMode<V> {
    /// Drop on the thread that removed them
    Inline,
    /// Drop on the cache's housekeeping thread
    Background,
    Custom(Arc<dyn ReleasePolicy<V>>),
}

impl<V> Clone for ReleaseMode<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Inline => Self::Inline,
            Self::Background => Self::Background,
            Self::Custom(policy) => Self::Custom(Arc::clone(policy)),
        }
    }
}

/// Notification hook for memory warnings and backgrounding
pub type MemoryHook<K, V> = Arc<dyn Fn(&MemoryCache<K, V>) + Send + Sync>;

struct Limits {
    count: usize,
    cost: usize,
    age: Duration,
    auto_trim_interval: Duration,
    remove_all_on_memory_warning: bool,
    remove_all_on_background: bool,
}

impl Limits {
    fn from_config(config: &MemoryCacheConfig) -> Self {
        Self {
            count: config.count_limit.unwrap_or(usize::MAX),
            cost: config.cost_limit.unwrap_or(usize::MAX),
            age: secs_or_max(config.age_limit_secs),
            auto_trim_interval: timer_period(secs(config.auto_trim_interval_secs)),
            remove_all_on_memory_warning: config.remove_all_on_memory_warning,
            remove_all_on_background: config.remove_all_on_background,
        }
    }
}

/// A zero period disables the timer
pub(crate) fn timer_period(interval: Duration) -> Duration {
    if interval.is_zero() {
        Duration::MAX
    } else {
        interval
    }
}

struct State<K, V> {
    lru: LruMap<K, V>,
    limits: Limits,
    stats: CacheStats,
}

struct Hooks<K, V> {
    on_memory_warning: Option<MemoryHook<K, V>>,
    on_background: Option<MemoryHook<K, V>>,
}

struct Shared<K, V> {
    name: String,
    state: Mutex<State<K, V>>,
    release: RwLock<ReleaseMode<V>>,
    hooks: RwLock<Hooks<K, V>>,
    housekeeper: SerialExecutor<()>,
    trim_scheduled: AtomicBool,
}

impl<K, V> Shared<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn release(&self, values: Vec<V>) {
        if values.is_empty() {
            return;
        }
        let mode = self.release.read().clone();
        match mode {
            ReleaseMode::Inline => drop(values),
            ReleaseMode::Background => {
                // If the housekeeper is gone the closure, and the values, drop here
                self.housekeeper.execute(move |_| drop(values));
            }
            ReleaseMode::Custom(policy) => policy.release(values),
        }
    }

    /// Pop LRU entries one lock acquisition at a time while `over` holds
    fn evict_while<F>(&self, mut over: F) -> usize
    where
        F: FnMut(&State<K, V>) -> bool,
    {
        let mut released = Vec::new();
        loop {
            let mut state = self.state.lock();
            if !over(&*state) {
                break;
            }
            match state.lru.pop_tail() {
                Some(node) => {
                    state.stats.evictions += 1;
                    released.push(node.value);
                }
                None => break,
            }
        }
        let evicted = released.len();
        self.release(released);
        evicted
    }

    fn trim_to_count(&self, count: usize) -> usize {
        self.evict_while(|state| state.lru.len() > count)
    }

    fn trim_to_cost(&self, cost: usize) -> usize {
        self.evict_while(|state| state.lru.total_cost() > cost)
    }

    fn trim_to_age(&self, age: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(age) else {
            return 0;
        };
        self.evict_while(|state| {
            state
                .lru
                .peek_tail()
                .is_some_and(|node| node.time < cutoff)
        })
    }

    fn trim_to_limits(&self) -> usize {
        let (count, cost, age) = {
            let state = self.state.lock();
            (
                state.limits.count,
                state.limits.cost,
                state.limits.age,
            )
        };
        let evicted = self.trim_to_cost(cost) + self.trim_to_count(count) + self.trim_to_age(age);
        if evicted > 0 {
            debug!("Memory cache {} trimmed {} entries", self.name, evicted);
        }
        evicted
    }

    fn remove_all(&self) {
        let values = self.state.lock().lru.drain();
        debug!("Memory cache {} cleared ({} entries)", self.name, values.len());
        self.release(values);
    }
}

/// Bounded in-memory LRU cache
///
/// Cloning yields another handle to the same cache.
pub struct MemoryCache<K, V> {
    shared: Arc<Shared<K, V>>,
    ticker: Arc<Ticker>,
}

impl<K, V> Clone for MemoryCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            ticker: Arc::clone(&self.ticker),
        }
    }
}

impl<K, V> MemoryCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a cache and start its housekeeping thread and auto-trim timer
    pub fn new(config: MemoryCacheConfig) -> Result<Self> {
        let name = config.name.clone().unwrap_or_else(|| "memory".to_string());
        let limits = Limits::from_config(&config);
        let interval = limits.auto_trim_interval;
        let release = if config.release_asynchronously {
            ReleaseMode::Background
        } else {
            ReleaseMode::Inline
        };

        let shared = Arc::new(Shared {
            housekeeper: SerialExecutor::spawn(&format!("strata-mem-{}", name), ())?,
            name,
            state: Mutex::new(State {
                lru: LruMap::new(),
                limits,
                stats: CacheStats::default(),
            }),
            release: RwLock::new(release),
            hooks: RwLock::new(Hooks {
                on_memory_warning: None,
                on_background: None,
            }),
            trim_scheduled: AtomicBool::new(false),
        });

        let weak: Weak<Shared<K, V>> = Arc::downgrade(&shared);
        let ticker = Ticker::spawn(
            &format!("strata-mem-trim-{}", shared.name),
            interval,
            move || {
                let shared = weak.upgrade()?;
                shared.trim_to_limits();
                let next = shared.state.lock().limits.auto_trim_interval;
                Some(next)
            },
        )?;

        info!(
            "Memory cache {} created (auto trim every {:?})",
            shared.name, interval
        );

        Ok(Self {
            shared,
            ticker: Arc::new(ticker),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn total_count(&self) -> usize {
        self.shared.state.lock().lru.len()
    }

    pub fn total_cost(&self) -> usize {
        self.shared.state.lock().lru.total_cost()
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().stats.clone()
    }

    /// Does not refresh recency
    pub fn contains_key(&self, key: &K) -> bool {
        self.shared.state.lock().lru.contains(key)
    }

    /// Value for `key`, moving it to the most recently used position
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.shared.state.lock();
        match state.lru.get(key, Instant::now()) {
            Some(node) => {
                let value = node.value.clone();
                state.stats.hits += 1;
                Some(value)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_cost(key, value, 0);
    }

    /// Insert only when `key` is missing; returns whether `value` was stored
    ///
    /// The check and the insert happen under one lock, so a value stored
    /// concurrently through [`set`](Self::set) is never replaced.
    pub fn set_if_absent(&self, key: K, value: V) -> bool {
        let over_limit = {
            let mut state = self.shared.state.lock();
            if state.lru.contains(&key) {
                return false;
            }
            state.lru.insert(key, value, 0, Instant::now());
            state.stats.inserts += 1;
            state.lru.len() > state.limits.count || state.lru.total_cost() > state.limits.cost
        };

        if over_limit {
            self.schedule_trim();
        }
        true
    }

    /// Insert or replace with a caller-assigned cost
    ///
    /// If the cache is now over its count or cost limit, a trim is queued on
    /// the housekeeping thread; this call does not wait for it.
    pub fn set_with_cost(&self, key: K, value: V, cost: usize) {
        let (replaced, over_limit) = {
            let mut state = self.shared.state.lock();
            let replaced = state.lru.insert(key, value, cost, Instant::now());
            state.stats.inserts += 1;
            let over = state.lru.len() > state.limits.count
                || state.lru.total_cost() > state.limits.cost;
            (replaced, over)
        };

        if let Some(old) = replaced {
            self.shared.release(vec![old]);
        }
        if over_limit {
            self.schedule_trim();
        }
    }

    fn schedule_trim(&self) {
        if self.shared.trim_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.shared);
        let queued = self.shared.housekeeper.execute(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.trim_scheduled.store(false, Ordering::Release);
                shared.trim_to_limits();
            }
        });
        if !queued {
            self.shared.trim_scheduled.store(false, Ordering::Release);
        }
    }

    /// Wait until every queued trim and background release has run
    pub fn flush_housekeeping(&self) {
        self.shared.housekeeper.submit(|_| ()).wait();
    }

    /// Returns false if `key` was absent
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.shared.state.lock().lru.remove(key);
        match removed {
            Some(node) => {
                self.shared.release(vec![node.value]);
                true
            }
            None => false,
        }
    }

    pub fn remove_all(&self) {
        self.shared.remove_all();
    }

    /// Evict least recently used entries until at most `count` remain
    pub fn trim_to_count(&self, count: usize) -> usize {
        self.shared.trim_to_count(count)
    }

    /// Evict least recently used entries until total cost is at most `cost`
    pub fn trim_to_cost(&self, cost: usize) -> usize {
        self.shared.trim_to_cost(cost)
    }

    /// Evict entries not used within `age`
    pub fn trim_to_age(&self, age: Duration) -> usize {
        self.shared.trim_to_age(age)
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<K> {
        self.shared.state.lock().lru.keys()
    }

    pub fn set_count_limit(&self, limit: usize) {
        self.shared.state.lock().limits.count = limit;
    }

    pub fn set_cost_limit(&self, limit: usize) {
        self.shared.state.lock().limits.cost = limit;
    }

    pub fn set_age_limit(&self, limit: Duration) {
        self.shared.state.lock().limits.age = limit;
    }

    /// Restarts the timer with the new period; zero disables auto trim
    pub fn set_auto_trim_interval(&self, interval: Duration) {
        let period = timer_period(interval);
        self.shared.state.lock().limits.auto_trim_interval = period;
        self.ticker.reschedule(period);
    }

    pub fn set_remove_all_on_memory_warning(&self, enabled: bool) {
        self.shared.state.lock().limits.remove_all_on_memory_warning = enabled;
    }

    pub fn set_remove_all_on_background(&self, enabled: bool) {
        self.shared.state.lock().limits.remove_all_on_background = enabled;
    }

    pub fn set_release_mode(&self, mode: ReleaseMode<V>) {
        *self.shared.release.write() = mode;
    }

    pub fn set_on_memory_warning(&self, hook: Option<MemoryHook<K, V>>) {
        self.shared.hooks.write().on_memory_warning = hook;
    }

    pub fn set_on_background(&self, hook: Option<MemoryHook<K, V>>) {
        self.shared.hooks.write().on_background = hook;
    }

    /// Handle a low-memory signal from the host
    pub fn did_receive_memory_warning(&self) {
        if self.shared.state.lock().limits.remove_all_on_memory_warning {
            self.remove_all();
        }
        let hook = self.shared.hooks.read().on_memory_warning.clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// Handle the host application moving to the background
    pub fn did_enter_background(&self) {
        if self.shared.state.lock().limits.remove_all_on_background {
            self.remove_all();
        }
        let hook = self.shared.hooks.read().on_background.clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn cache() -> MemoryCache<String, Vec<u8>> {
        MemoryCache::new(MemoryCacheConfig::default()).unwrap()
    }

    #[test]
    fn test_set_get() {
        let cache = cache();
        cache.set("a".to_string(), vec![1, 2, 3]);

        assert_eq!(cache.get(&"a".to_string()), Some(vec![1, 2, 3]));
        assert_eq!(cache.get(&"b".to_string()), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_totals_track_replacements() {
        let cache = cache();
        cache.set_with_cost("a".to_string(), vec![], 10);
        cache.set_with_cost("b".to_string(), vec![], 5);
        cache.set_with_cost("a".to_string(), vec![], 2);

        assert_eq!(cache.total_count(), 2);
        assert_eq!(cache.total_cost(), 7);

        cache.remove(&"b".to_string());
        assert_eq!(cache.total_cost(), 2);
        assert!(!cache.remove(&"b".to_string()));
    }

    #[test]
    fn test_set_if_absent_keeps_existing_value() {
        let cache = cache();
        assert!(cache.set_if_absent("a".to_string(), vec![1]));
        assert!(!cache.set_if_absent("a".to_string(), vec![2]));
        assert_eq!(cache.get(&"a".to_string()), Some(vec![1]));
        assert_eq!(cache.total_count(), 1);
    }

    #[test]
    fn test_auto_trim_interval_change_wakes_disabled_timer() {
        let cache: MemoryCache<String, u32> = MemoryCache::new(MemoryCacheConfig {
            age_limit_secs: Some(0.01),
            auto_trim_interval_secs: 0.0,
            ..Default::default()
        })
        .unwrap();
        cache.set("a".to_string(), 1);

        cache.set_auto_trim_interval(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_count_limit_trims_in_background() {
        let cache = cache();
        cache.set_count_limit(2);

        cache.set("a".to_string(), vec![1]);
        cache.set("b".to_string(), vec![2]);
        cache.get(&"a".to_string());
        cache.set("c".to_string(), vec![3]);
        cache.flush_housekeeping();

        assert_eq!(cache.total_count(), 2);
        assert!(cache.contains_key(&"a".to_string()));
        assert!(!cache.contains_key(&"b".to_string()));
        assert!(cache.contains_key(&"c".to_string()));
    }

    #[test]
    fn test_trim_to_cost() {
        let cache = cache();
        for i in 0..10 {
            cache.set_with_cost(format!("k{}", i), vec![], 10);
        }
        assert_eq!(cache.trim_to_cost(35), 7);
        assert_eq!(cache.total_cost(), 30);
        assert_eq!(cache.keys(), vec!["k9", "k8", "k7"]);
    }

    #[test]
    fn test_trim_to_count_evicts_exactly_lru() {
        let cache = cache();
        for i in 0..5 {
            cache.set(format!("k{}", i), vec![]);
        }
        cache.get(&"k0".to_string());

        assert_eq!(cache.trim_to_count(2), 3);
        assert_eq!(cache.keys(), vec!["k0", "k4"]);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_trim_to_age() {
        let cache = cache();
        cache.set("old".to_string(), vec![]);
        std::thread::sleep(Duration::from_millis(60));
        cache.set("new".to_string(), vec![]);

        assert_eq!(cache.trim_to_age(Duration::from_millis(30)), 1);
        assert_eq!(cache.keys(), vec!["new"]);
        assert_eq!(cache.trim_to_age(Duration::MAX), 0);
    }

    #[test]
    fn test_auto_trim_applies_age_limit() {
        let cache: MemoryCache<String, u32> = MemoryCache::new(MemoryCacheConfig {
            age_limit_secs: Some(0.01),
            auto_trim_interval_secs: 0.02,
            ..Default::default()
        })
        .unwrap();
        cache.set("a".to_string(), 1);

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_memory_warning_purges_and_notifies() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        cache.set_on_memory_warning(Some(Arc::new(move |c: &MemoryCache<String, Vec<u8>>| {
            assert_eq!(c.total_count(), 0);
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        cache.set("a".to_string(), vec![1]);
        cache.did_receive_memory_warning();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn test_background_without_purge_still_notifies() {
        let cache = cache();
        cache.set_remove_all_on_background(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        cache.set_on_background(Some(Arc::new(move |_: &MemoryCache<String, Vec<u8>>| {
            seen.fetch_add(1, Ordering::SeqCst);
        })));

        cache.set("a".to_string(), vec![1]);
        cache.did_enter_background();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.total_count(), 1);
    }

    #[test]
    fn test_channel_release_delivers_to_owner() {
        let cache = cache();
        let (policy, mut rx) = ChannelRelease::new();
        cache.set_release_mode(ReleaseMode::Custom(Arc::new(policy)));

        cache.set("a".to_string(), vec![1]);
        cache.set("b".to_string(), vec![2]);
        cache.remove(&"a".to_string());
        cache.remove_all();

        let mut released: Vec<Vec<u8>> = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            released.extend(batch);
        }
        released.sort();
        assert_eq!(released, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_clone_shares_state() {
        let cache = cache();
        let other = cache.clone();
        cache.set("a".to_string(), vec![1]);
        assert_eq!(other.get(&"a".to_string()), Some(vec![1]));
    }
}
