use super::blobs::{self, BlobStore};
use super::index::{Index, Victim};
use crate::core::{CacheError, ItemInfo, MonotonicClock, Result, StorageMode, StoredItem};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Rows deleted per step of LRU eviction and progressive wipes
const BATCH_SIZE: usize = 32;

/// What a consistency sweep repaired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Blob files no row referenced
    pub orphan_files: usize,
    /// Rows whose blob file was missing
    pub dangling_rows: usize,
    /// Unfinished temp files from interrupted writes
    pub temp_files: usize,
}

/// Durable key → blob store
///
/// Not internally synchronized: every method takes `&mut self` or `&self` and
/// the owner is responsible for serializing access. `DiskCache` does this by
/// confining the engine to its serial executor thread.
pub struct KvStorage {
    path: PathBuf,
    mode: StorageMode,
    index: Index,
    blobs: BlobStore,
    clock: MonotonicClock,
}

impl KvStorage {
    /// Open or create a store rooted at `path`
    ///
    /// Empties the trash left by earlier wipes and runs a consistency sweep.
    pub fn open(path: impl AsRef<Path>, mode: StorageMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let index = Index::open(&path.join("index.db"))?;
        let blobs = BlobStore::open(&path)?;
        let clock = MonotonicClock::starting_after(index.latest_stamp()?);

        let mut storage = Self {
            path,
            mode,
            index,
            blobs,
            clock,
        };

        storage.blobs.empty_trash_in_background();
        let report = storage.sweep()?;
        if report != SweepReport::default() {
            warn!("Startup sweep at {:?} repaired {:?}", storage.path, report);
        }

        info!(
            "KV storage opened at {:?} (mode={:?}, items={})",
            storage.path,
            storage.mode,
            storage.index.count()?
        );
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Absolute path of a file-placed value's blob
    pub fn blob_path(&self, filename: &str) -> PathBuf {
        self.blobs.path_of(filename)
    }

    /// Save a value, fully replacing whatever `key` held before
    ///
    /// Placement follows the store mode. File-placed values use `filename` if
    /// given, otherwise a name derived from the key. When the key's current
    /// row already points at that name, the new bytes go to a fresh sibling
    /// (`<name>.<uuid>`) so the committed blob is never rewritten in place.
    /// A previous blob that the new row no longer references is deleted only
    /// after the row commits, so a failure leaves at worst an orphan file,
    /// never a dangling row or a row paired with the wrong bytes.
    pub fn save(
        &mut self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended_data: Option<&[u8]>,
    ) -> Result<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidArgument("empty key".to_string()));
        }

        let requested = if self.mode.uses_file(value.len()) {
            let name = match filename {
                Some(name) => {
                    blobs::validate_filename(name)?;
                    name.to_string()
                }
                None => blobs::default_filename(key),
            };
            Some(name)
        } else {
            None
        };

        let previous = self.index.info(key)?.and_then(|info| info.filename);

        let target = match requested {
            Some(name) if previous.as_deref() == Some(name.as_str()) => {
                Some(blobs::generation_name(&name))
            }
            other => other,
        };

        if let Some(name) = &target {
            self.blobs.write(name, value)?;
        }

        let now = self.clock.now();
        let info = ItemInfo {
            key: key.to_string(),
            filename: target.clone(),
            size: value.len() as u64,
            mod_time: now,
            access_time: now,
            extended_data: extended_data.map(<[u8]>::to_vec),
        };
        let inline = if target.is_none() { Some(value) } else { None };

        if let Err(e) = self.index.upsert(&info, inline) {
            // The old row is intact; drop the new blob unless another key shares it
            if let Some(name) = target {
                self.release_files([name]);
            }
            return Err(e);
        }

        if let Some(old) = previous {
            if target.as_deref() != Some(old.as_str()) {
                self.release_files([old]);
            }
        }

        debug!(
            "SAVE key={}, size={}, file={:?}",
            key,
            value.len(),
            info.filename
        );
        Ok(())
    }

    /// Delete blobs that no remaining row references
    ///
    /// Several keys may share one caller-chosen filename, so a blob is only
    /// removed once the last row pointing at it is gone. Failures leave an
    /// orphan for the next sweep.
    fn release_files<I: IntoIterator<Item = String>>(&self, names: I) {
        for name in names {
            match self.index.filename_referenced(&name) {
                Ok(false) => {
                    if let Err(e) = self.blobs.remove(&name) {
                        warn!("Failed to delete blob {}: {}", name, e);
                    }
                }
                Ok(true) => {}
                Err(e) => warn!("Failed to check blob {} references: {}", name, e),
            }
        }
    }

    fn delete_victims(&mut self, victims: Vec<Victim>) -> Result<usize> {
        if victims.is_empty() {
            return Ok(0);
        }
        let mut keys = Vec::with_capacity(victims.len());
        let mut files = Vec::new();
        for victim in victims {
            keys.push(victim.key);
            if let Some(name) = victim.filename {
                files.push(name);
            }
        }
        let removed = self.index.delete_many(&keys)?;
        self.release_files(files);
        Ok(removed)
    }

    fn reconcile_dangling(&mut self, key: &str, filename: &str) {
        let violation = CacheError::Consistency {
            key: key.to_string(),
            reason: format!("blob {} is missing", filename),
        };
        warn!("{}; dropping row", violation);
        if let Err(e) = self.index.delete(key) {
            warn!("Failed to drop dangling row {}: {}", key, e);
        }
    }

    /// Resolve a row's value bytes, reconciling a missing blob as a miss
    fn load_value(
        &mut self,
        info: &ItemInfo,
        inline: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        match &info.filename {
            Some(name) => match self.blobs.read(name)? {
                Some(data) => Ok(Some(data)),
                None => {
                    let name = name.clone();
                    self.reconcile_dangling(&info.key, &name);
                    Ok(None)
                }
            },
            None => Ok(Some(inline.unwrap_or_default())),
        }
    }

    fn touch(&mut self, key: &str) -> i64 {
        let now = self.clock.now();
        if let Err(e) = self.index.touch(key, now) {
            warn!("Failed to update access time for {}: {}", key, e);
        }
        now
    }

    /// Full item, refreshing its access time
    pub fn get(&mut self, key: &str) -> Result<Option<StoredItem>> {
        let Some((mut info, inline)) = self.index.row(key)? else {
            return Ok(None);
        };
        let Some(value) = self.load_value(&info, inline)? else {
            return Ok(None);
        };
        info.access_time = self.touch(key);
        Ok(Some(StoredItem { info, value }))
    }

    /// Metadata only; never reads a blob and does not count as an access
    pub fn get_info(&self, key: &str) -> Result<Option<ItemInfo>> {
        self.index.info(key)
    }

    /// Value bytes only, refreshing the access time
    pub fn get_value(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key)?.map(|item| item.value))
    }

    pub fn get_items(&mut self, keys: &[String]) -> Result<HashMap<String, StoredItem>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some((info, inline)) = self.index.row(key)? else {
                continue;
            };
            if let Some(value) = self.load_value(&info, inline)? {
                out.insert(key.clone(), StoredItem { info, value });
            }
        }

        if !out.is_empty() {
            let hit: Vec<String> = out.keys().cloned().collect();
            let now = self.clock.now();
            match self.index.touch_many(&hit, now) {
                Ok(()) => out.values_mut().for_each(|item| item.info.access_time = now),
                Err(e) => warn!("Failed to update access times: {}", e),
            }
        }
        Ok(out)
    }

    pub fn get_infos(&self, keys: &[String]) -> Result<HashMap<String, ItemInfo>> {
        Ok(self
            .index
            .infos(keys)?
            .into_iter()
            .map(|info| (info.key.clone(), info))
            .collect())
    }

    pub fn get_values(&mut self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        Ok(self
            .get_items(keys)?
            .into_iter()
            .map(|(key, item)| (key, item.value))
            .collect())
    }

    /// Remove one key; returns whether it existed
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let Some(info) = self.index.info(key)? else {
            return Ok(false);
        };
        self.index.delete(key)?;
        if let Some(name) = info.filename {
            self.release_files([name]);
        }
        debug!("REMOVE key={}", key);
        Ok(true)
    }

    pub fn remove_batch(&mut self, keys: &[String]) -> Result<usize> {
        let victims = self
            .index
            .infos(keys)?
            .into_iter()
            .map(|info| Victim {
                key: info.key,
                filename: info.filename,
                size: info.size,
            })
            .collect();
        self.delete_victims(victims)
    }

    pub fn remove_larger_than(&mut self, size: u64) -> Result<usize> {
        let victims = self.index.larger_than(size)?;
        let removed = self.delete_victims(victims)?;
        debug!("Removed {} items larger than {} bytes", removed, size);
        Ok(removed)
    }

    /// Remove items whose last write happened before `time` (epoch millis)
    pub fn remove_older_than(&mut self, time: i64) -> Result<usize> {
        let victims = self.index.modified_before(time)?;
        let removed = self.delete_victims(victims)?;
        debug!("Removed {} items modified before {}", removed, time);
        Ok(removed)
    }

    /// Evict least recently accessed items until the total size is at most `max_size`
    pub fn remove_to_fit_size(&mut self, max_size: u64) -> Result<usize> {
        let mut total = self.index.total_size()?;
        let mut removed = 0;

        while total > max_size {
            let batch = self.index.least_recent(BATCH_SIZE)?;
            if batch.is_empty() {
                break;
            }
            let mut victims = Vec::with_capacity(batch.len());
            for victim in batch {
                if total <= max_size {
                    break;
                }
                total = total.saturating_sub(victim.size);
                victims.push(victim);
            }
            removed += self.delete_victims(victims)?;
        }

        if removed > 0 {
            debug!("Evicted {} items to fit {} bytes", removed, max_size);
        }
        Ok(removed)
    }

    /// Evict least recently accessed items until at most `max_count` remain
    pub fn remove_to_fit_count(&mut self, max_count: usize) -> Result<usize> {
        let mut excess = self.index.count()?.saturating_sub(max_count);
        let mut removed = 0;

        while excess > 0 {
            let batch = self.index.least_recent(excess.min(BATCH_SIZE))?;
            if batch.is_empty() {
                break;
            }
            let n = self.delete_victims(batch)?;
            if n == 0 {
                break;
            }
            excess = excess.saturating_sub(n);
            removed += n;
        }

        if removed > 0 {
            debug!("Evicted {} items to fit {} entries", removed, max_count);
        }
        Ok(removed)
    }

    /// Drop every item at once
    ///
    /// Rows go in one statement; blobs are moved aside and deleted by a
    /// background thread so the caller never waits on a large directory.
    pub fn remove_all(&mut self) -> Result<()> {
        let removed = self.index.clear()?;
        self.blobs.move_all_to_trash()?;
        self.blobs.empty_trash_in_background();
        info!("Removed all {} items at {:?}", removed, self.path);
        Ok(())
    }

    /// Drop every item in bounded batches
    ///
    /// `progress(removed, total)` runs after each batch and `end(success)`
    /// runs exactly once.
    pub fn remove_all_with_progress<P, E>(&mut self, mut progress: P, end: E)
    where
        P: FnMut(usize, usize),
        E: FnOnce(bool),
    {
        let outcome = (|| -> Result<usize> {
            let total = self.index.count()?;
            let mut removed = 0;
            loop {
                let batch = self.index.first_rows(BATCH_SIZE)?;
                if batch.is_empty() {
                    break;
                }
                removed += self.delete_victims(batch)?;
                progress(removed.min(total), total);
            }
            Ok(removed)
        })();

        match outcome {
            Ok(removed) => {
                info!("Progressively removed {} items at {:?}", removed, self.path);
                end(true);
            }
            Err(e) => {
                warn!("Progressive removal at {:?} failed: {}", self.path, e);
                end(false);
            }
        }
    }

    pub fn item_exists(&self, key: &str) -> Result<bool> {
        self.index.exists(key)
    }

    pub fn count(&self) -> Result<usize> {
        self.index.count()
    }

    pub fn total_size(&self) -> Result<u64> {
        self.index.total_size()
    }

    /// Metadata of the next eviction candidates, least recently accessed first
    pub fn least_recent_infos(&self, limit: usize) -> Result<Vec<ItemInfo>> {
        self.index.least_recent_infos(limit)
    }

    /// Visit the metadata of every item, in no particular order
    pub fn visit_infos<F: FnMut(&ItemInfo)>(&self, visit: F) -> Result<()> {
        self.index.visit_infos(visit)
    }

    /// Reconcile the index with the blob directory
    ///
    /// Deletes blob files no row references, temp files from interrupted
    /// writes, and rows whose blob is missing.
    pub fn sweep(&mut self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let referenced = self.index.referenced_filenames()?;

        for name in self.blobs.list()? {
            let kind = if blobs::is_temp_file(&name) {
                &mut report.temp_files
            } else if !referenced.contains(&name) {
                &mut report.orphan_files
            } else {
                continue;
            };
            if self.blobs.remove(&name)? {
                *kind += 1;
            }
        }

        for (key, filename) in self.index.file_rows()? {
            if !self.blobs.exists(&filename) {
                self.reconcile_dangling(&key, &filename);
                report.dangling_rows += 1;
            }
        }

        debug!("Sweep at {:?}: {:?}", self.path, report);
        Ok(report)
    }
}
