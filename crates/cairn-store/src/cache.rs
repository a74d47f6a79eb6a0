use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use cairn_codec::{FromRecord, RecordReader};
use cairn_types::ContentHash;
use tracing::{debug, warn};

use crate::backoff::{Backoff, RetryPolicy};
use crate::error::{StoreError, StoreResult};
use crate::info::ContentInfo;
use crate::partition::AtomicPartitionTable;
use crate::stream::StreamStore;

/// Directory holding one append-only record file per bucket.
pub const INFO_DIR: &str = "info";

type Records = HashMap<ContentHash, ContentInfo>;

/// In-memory state of one bucket.
#[derive(Debug)]
enum Page {
    /// Nothing cached; the shard file is the only copy.
    Unloaded,
    /// One thread owns the bucket while it loads, appends or rewrites.
    Locked,
    /// Every record of the shard, immutable once published.
    Loaded(Records),
}

/// Shard-wise lazily loaded cache of [`ContentInfo`] records.
///
/// Each bucket moves between [`Page`] states by compare-and-set on its slot.
/// Only the thread that swapped a bucket to `Locked` may touch its shard
/// file or publish its next state; readers of a `Loaded` bucket never
/// coordinate. Waiting for a `Locked` bucket follows the configured
/// [`RetryPolicy`] and ends in [`StoreError::Contended`].
///
/// A `put` into a loaded bucket updates the cached page along with the
/// file; a `put` into an unloaded bucket leaves it unloaded. The number of
/// loaded buckets is capped: publishing a page beyond the cap evicts the
/// least recently used other page.
pub struct InfoCache {
    store: Arc<dyn StreamStore>,
    pages: AtomicPartitionTable<Page>,
    ticks: Box<[AtomicU64]>,
    clock: AtomicU64,
    loaded: AtomicUsize,
    max_loaded_pages: usize,
    policy: RetryPolicy,
}

impl InfoCache {
    /// Open the cache with every bucket unloaded. A `max_loaded_pages` of 0
    /// means no cap.
    pub fn open(
        store: Arc<dyn StreamStore>,
        key_length: usize,
        max_loaded_pages: usize,
        policy: RetryPolicy,
    ) -> StoreResult<Self> {
        store.ensure_dir(Path::new(INFO_DIR))?;
        let pages = AtomicPartitionTable::new(key_length, |_| Page::Unloaded)?;
        let ticks = (0..pages.bucket_count()).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            store,
            pages,
            ticks,
            clock: AtomicU64::new(0),
            loaded: AtomicUsize::new(0),
            max_loaded_pages,
            policy,
        })
    }

    /// Persist `info` to its shard.
    pub fn put(&self, info: &ContentInfo) -> StoreResult<()> {
        let bytes = info.encode()?;
        let index = self.pages.index_of(&info.hash);
        let previous = self.claim(index)?;

        if let Err(e) = self.append(index, &bytes) {
            warn!(hash = %info.hash.short_hex(), bucket = index, error = %e, "info append failed");
            self.publish(index, &previous, Page::Unloaded);
            return Err(e);
        }

        let next = match &*previous {
            Page::Loaded(records) => {
                let mut records = records.clone();
                records.insert(info.hash, info.clone());
                Page::Loaded(records)
            }
            _ => Page::Unloaded,
        };
        self.publish(index, &previous, next);
        debug!(hash = %info.hash.short_hex(), bucket = index, "info stored");
        Ok(())
    }

    /// Look up the record for `hash`, loading its shard if needed.
    pub fn get(&self, hash: &ContentHash) -> StoreResult<Option<ContentInfo>> {
        let index = self.pages.index_of(hash);
        let mut backoff = Backoff::new(&self.policy);
        loop {
            let current = self.pages.load_index(index);
            match &*current {
                Page::Loaded(records) => {
                    self.touch(index);
                    return Ok(records.get(hash).cloned());
                }
                Page::Unloaded => {
                    if self
                        .pages
                        .compare_and_set_index(index, &current, Arc::new(Page::Locked))
                    {
                        let records = self.load(index, &current)?;
                        let found = records.get(hash).cloned();
                        self.publish(index, &current, Page::Loaded(records));
                        return Ok(found);
                    }
                }
                Page::Locked => {}
            }
            if !backoff.snooze() {
                return Err(StoreError::Contended { bucket: index });
            }
        }
    }

    /// Drop the record for `hash` and rewrite its shard. Returns `false` if
    /// there was no such record.
    pub fn remove(&self, hash: &ContentHash) -> StoreResult<bool> {
        let index = self.pages.index_of(hash);
        let previous = self.claim(index)?;
        let mut records = match &*previous {
            Page::Loaded(records) => records.clone(),
            _ => self.load(index, &previous)?,
        };

        if records.remove(hash).is_none() {
            self.publish(index, &previous, Page::Loaded(records));
            return Ok(false);
        }

        if let Err(e) = self.rewrite(index, &records) {
            warn!(hash = %hash.short_hex(), bucket = index, error = %e, "info rewrite failed");
            self.publish(index, &previous, Page::Unloaded);
            return Err(e);
        }
        self.publish(index, &previous, Page::Loaded(records));
        debug!(hash = %hash.short_hex(), bucket = index, "info removed");
        Ok(true)
    }

    /// Number of buckets currently holding a loaded page.
    pub fn loaded_pages(&self) -> usize {
        self.loaded.load(Ordering::Acquire)
    }

    /// Whether the bucket `hash` falls in is loaded right now.
    pub fn is_loaded(&self, hash: &ContentHash) -> bool {
        matches!(*self.pages.load(hash), Page::Loaded(_))
    }

    pub fn bucket_count(&self) -> usize {
        self.pages.bucket_count()
    }

    // ---------------------------------------------------------------
    // Bucket ownership
    // ---------------------------------------------------------------

    /// Take ownership of a bucket that is not `Locked`. Returns the page it
    /// held, which the caller must hand back to [`publish`](Self::publish).
    fn claim(&self, index: usize) -> StoreResult<Arc<Page>> {
        let locked = Arc::new(Page::Locked);
        self.policy
            .retry(|| {
                let current = self.pages.load_index(index);
                if matches!(*current, Page::Locked) {
                    return None;
                }
                self.pages
                    .compare_and_set_index(index, &current, Arc::clone(&locked))
                    .then_some(current)
            })
            .ok_or(StoreError::Contended { bucket: index })
    }

    /// Release an owned bucket into its next state.
    fn publish(&self, index: usize, previous: &Page, next: Page) {
        let was_loaded = matches!(previous, Page::Loaded(_));
        let now_loaded = matches!(next, Page::Loaded(_));
        self.pages.store_index(index, Arc::new(next));

        match (was_loaded, now_loaded) {
            (false, true) => {
                self.loaded.fetch_add(1, Ordering::AcqRel);
                self.touch(index);
                self.evict_beyond_cap(index);
            }
            (true, true) => self.touch(index),
            (true, false) => {
                self.loaded.fetch_sub(1, Ordering::AcqRel);
            }
            (false, false) => {}
        }
    }

    /// Read an owned bucket's shard. On failure the bucket is released
    /// unloaded.
    fn load(&self, index: usize, previous: &Page) -> StoreResult<Records> {
        match self.read_shard(index) {
            Ok(records) => {
                debug!(bucket = index, records = records.len(), "info page loaded");
                Ok(records)
            }
            Err(e) => {
                warn!(bucket = index, error = %e, "info page load failed");
                self.publish(index, previous, Page::Unloaded);
                Err(e)
            }
        }
    }

    fn touch(&self, index: usize) {
        let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        self.ticks[index].store(tick, Ordering::Relaxed);
    }

    /// Unload least recently used pages, other than `keep`, until the cap
    /// holds. Pages that change state mid-scan are skipped.
    fn evict_beyond_cap(&self, keep: usize) {
        if self.max_loaded_pages == 0 {
            return;
        }
        let mut attempts = 0;
        while self.loaded.load(Ordering::Acquire) > self.max_loaded_pages
            && attempts < self.pages.bucket_count()
        {
            attempts += 1;
            let victim = (0..self.pages.bucket_count())
                .filter(|&i| i != keep)
                .filter_map(|i| {
                    let page = self.pages.load_index(i);
                    matches!(*page, Page::Loaded(_))
                        .then(|| (self.ticks[i].load(Ordering::Relaxed), i, page))
                })
                .min_by_key(|(tick, _, _)| *tick);

            let Some((_, index, page)) = victim else {
                break;
            };
            if self
                .pages
                .compare_and_set_index(index, &page, Arc::new(Page::Unloaded))
            {
                self.loaded.fetch_sub(1, Ordering::AcqRel);
                debug!(bucket = index, "info page evicted");
            }
        }
    }

    // ---------------------------------------------------------------
    // Shard files
    // ---------------------------------------------------------------

    fn shard_path(&self, index: usize) -> PathBuf {
        Path::new(INFO_DIR).join(self.pages.prefix_of(index))
    }

    /// Every record of the shard. A frame cut short at the end of the file
    /// is what an interrupted append leaves behind; it is dropped and the
    /// shard rewritten without it. Any other damage is an error.
    fn read_shard(&self, index: usize) -> StoreResult<Records> {
        let mut records = Records::new();
        let Some(reader) = self.store.open_read(&self.shard_path(index))? else {
            return Ok(records);
        };
        let mut frames = RecordReader::new(reader);
        while let Some(record) = frames.next() {
            match record {
                Ok(record) => {
                    let info = ContentInfo::from_record(&record)?;
                    records.insert(info.hash, info);
                }
                Err(e) if frames.is_torn() => {
                    warn!(bucket = index, error = %e, kept = records.len(), "torn shard tail; truncating");
                    drop(frames);
                    self.rewrite(index, &records)?;
                    return Ok(records);
                }
                Err(e) => return Err(StoreError::from_decode(e)),
            }
        }
        Ok(records)
    }

    fn append(&self, index: usize, bytes: &[u8]) -> StoreResult<()> {
        let mut writer = self.store.open_append(&self.shard_path(index))?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Replace the shard file with exactly `records`, via a temporary file
    /// and a rename.
    fn rewrite(&self, index: usize, records: &Records) -> StoreResult<()> {
        let path = self.shard_path(index);
        if records.is_empty() {
            self.store.delete(&path)?;
            return Ok(());
        }

        let mut infos: Vec<_> = records.values().collect();
        infos.sort_by_key(|info| info.hash);

        let tmp = path.with_extension("rewrite");
        let mut writer = self.store.open_truncate(&tmp)?;
        for info in infos {
            writer.write_all(&info.encode()?)?;
        }
        writer.flush()?;
        drop(writer);
        self.store.rename(&tmp, &path)?;
        Ok(())
    }
}

impl fmt::Debug for InfoCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfoCache")
            .field("buckets", &self.pages.bucket_count())
            .field("loaded_pages", &self.loaded_pages())
            .field("max_loaded_pages", &self.max_loaded_pages)
            .finish()
    }
}
