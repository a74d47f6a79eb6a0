use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use cairn_types::ContentHash;
use tracing::trace;

use crate::backoff::RetryPolicy;
use crate::error::StoreResult;
use crate::partition::PartitionTable;

/// Lock state for every hash routed to one bucket.
#[derive(Debug, Default)]
struct LockBucket {
    /// Single-flag locks used by the operation journal.
    exclusive: HashSet<ContentHash>,
    writers: HashSet<ContentHash>,
    /// Reader counts; an entry exists only while the count is non-zero.
    readers: HashMap<ContentHash, usize>,
}

/// Per-hash mutual exclusion, striped over a [`PartitionTable`].
///
/// Two independent lock domains are offered:
///
/// - a single exclusive flag per hash ([`lock`](Self::lock) /
///   [`unlock`](Self::unlock)), used to serialize journal operations;
/// - a reader/writer pair per hash ([`read_lock`](Self::read_lock) /
///   [`write_lock`](Self::write_lock)).
///
/// No call ever blocks waiting for another holder: acquisition returns
/// `false` when the lock is taken and the caller decides whether to retry
/// (see [`lock_with`](Self::lock_with)) or give up. Every operation on a hash
/// goes through its bucket's mutex, so hashes in different buckets never
/// contend.
#[derive(Debug)]
pub struct LockManager {
    buckets: PartitionTable<Mutex<LockBucket>>,
}

impl LockManager {
    pub fn new(key_length: usize) -> StoreResult<Self> {
        Ok(Self {
            buckets: PartitionTable::new(key_length, |_| Mutex::new(LockBucket::default()))?,
        })
    }

    fn bucket(&self, hash: &ContentHash) -> MutexGuard<'_, LockBucket> {
        self.buckets.get(hash).lock().expect("lock bucket poisoned")
    }

    /// Take the exclusive flag for `hash`. Returns `false` if already held.
    pub fn lock(&self, hash: &ContentHash) -> bool {
        let acquired = self.bucket(hash).exclusive.insert(*hash);
        trace!(hash = %hash.short_hex(), acquired, "lock");
        acquired
    }

    /// [`lock`](Self::lock), retried under `policy` until it succeeds or the
    /// policy gives up.
    pub fn lock_with(&self, hash: &ContentHash, policy: &RetryPolicy) -> bool {
        policy.retry(|| self.lock(hash).then_some(())).is_some()
    }

    /// Release the exclusive flag. Releasing a free hash does nothing.
    pub fn unlock(&self, hash: &ContentHash) {
        self.bucket(hash).exclusive.remove(hash);
        trace!(hash = %hash.short_hex(), "unlock");
    }

    pub fn is_locked(&self, hash: &ContentHash) -> bool {
        self.bucket(hash).exclusive.contains(hash)
    }

    /// Fails while any reader or writer holds `hash`.
    pub fn write_lock(&self, hash: &ContentHash) -> bool {
        let mut bucket = self.bucket(hash);
        if bucket.writers.contains(hash) || bucket.readers.contains_key(hash) {
            return false;
        }
        bucket.writers.insert(*hash)
    }

    pub fn write_unlock(&self, hash: &ContentHash) {
        self.bucket(hash).writers.remove(hash);
    }

    /// Fails only while a writer holds `hash`.
    pub fn read_lock(&self, hash: &ContentHash) -> bool {
        let mut bucket = self.bucket(hash);
        if bucket.writers.contains(hash) {
            return false;
        }
        *bucket.readers.entry(*hash).or_insert(0) += 1;
        true
    }

    /// Drop one reader. A no-op when no reader is registered.
    pub fn read_unlock(&self, hash: &ContentHash) {
        if let Entry::Occupied(mut readers) = self.bucket(hash).readers.entry(*hash) {
            if *readers.get() <= 1 {
                readers.remove();
            } else {
                *readers.get_mut() -= 1;
            }
        }
    }

    pub fn readers(&self, hash: &ContentHash) -> usize {
        self.bucket(hash).readers.get(hash).copied().unwrap_or(0)
    }

    pub fn is_write_locked(&self, hash: &ContentHash) -> bool {
        self.bucket(hash).writers.contains(hash)
    }
}
