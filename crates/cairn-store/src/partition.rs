use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use cairn_types::ContentHash;

use crate::error::{StoreError, StoreResult};

/// Largest supported prefix length (65 536 buckets).
pub const MAX_KEY_LENGTH: usize = 4;

fn check_key_length(key_length: usize) -> StoreResult<()> {
    if key_length == 0 || key_length > MAX_KEY_LENGTH {
        return Err(StoreError::Config(format!(
            "key length must be between 1 and {MAX_KEY_LENGTH}, got {key_length}"
        )));
    }
    Ok(())
}

/// Bucket index of `hash`: its first `key_length` hex digits read as a number.
pub fn bucket_index(hash: &ContentHash, key_length: usize) -> usize {
    (0..key_length).fold(0, |acc, i| acc * 16 + usize::from(hash.nibble(i)))
}

/// Hex prefix shared by every hash that lands in bucket `index`.
pub fn bucket_prefix(index: usize, key_length: usize) -> String {
    format!("{index:0key_length$x}")
}

/// Fixed fan-out of per-shard payloads keyed by hash prefix.
///
/// A table with key length `k` has `16^k` slots. Each slot's payload is
/// built by the factory on first access and lives as long as the table.
pub struct PartitionTable<T> {
    key_length: usize,
    slots: Box<[OnceLock<T>]>,
    factory: Box<dyn Fn(usize) -> T + Send + Sync>,
}

impl<T> PartitionTable<T> {
    pub fn new<F>(key_length: usize, factory: F) -> StoreResult<Self>
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        check_key_length(key_length)?;
        let slots = (0..16usize.pow(key_length as u32))
            .map(|_| OnceLock::new())
            .collect();
        Ok(Self {
            key_length,
            slots,
            factory: Box::new(factory),
        })
    }

    /// Payload for the bucket `hash` falls in, created if needed.
    pub fn get(&self, hash: &ContentHash) -> &T {
        self.get_index(self.index_of(hash))
    }

    /// Payload for bucket `index`.
    ///
    /// # Panics
    ///
    /// If `index >= bucket_count()`.
    pub fn get_index(&self, index: usize) -> &T {
        self.slots[index].get_or_init(|| (self.factory)(index))
    }

    pub fn index_of(&self, hash: &ContentHash) -> usize {
        bucket_index(hash, self.key_length)
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn prefix_of(&self, index: usize) -> String {
        bucket_prefix(index, self.key_length)
    }

    /// Buckets whose payload has been created so far.
    pub fn initialized(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.get().map(|t| (i, t)))
    }
}

impl<T> fmt::Debug for PartitionTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionTable")
            .field("key_length", &self.key_length)
            .field("buckets", &self.slots.len())
            .field("initialized", &self.initialized().count())
            .finish()
    }
}

/// Partition table whose slots hold swappable `Arc<T>` values.
///
/// Updates go through [`compare_and_set`](Self::compare_and_set), which
/// compares the current slot with `expected` by pointer identity. Each slot
/// has its own lock held only for the swap, so unrelated buckets never
/// contend.
pub struct AtomicPartitionTable<T> {
    key_length: usize,
    slots: Box<[RwLock<Arc<T>>]>,
}

impl<T> AtomicPartitionTable<T> {
    /// Create the table with every slot set to `init(index)`.
    pub fn new(key_length: usize, init: impl Fn(usize) -> T) -> StoreResult<Self> {
        check_key_length(key_length)?;
        let slots = (0..16usize.pow(key_length as u32))
            .map(|i| RwLock::new(Arc::new(init(i))))
            .collect();
        Ok(Self { key_length, slots })
    }

    pub fn load(&self, hash: &ContentHash) -> Arc<T> {
        self.load_index(self.index_of(hash))
    }

    pub fn load_index(&self, index: usize) -> Arc<T> {
        Arc::clone(&self.slots[index].read().expect("partition slot poisoned"))
    }

    /// Replace the slot with `new` if it still holds `expected`.
    pub fn compare_and_set(&self, hash: &ContentHash, expected: &Arc<T>, new: Arc<T>) -> bool {
        self.compare_and_set_index(self.index_of(hash), expected, new)
    }

    pub fn compare_and_set_index(&self, index: usize, expected: &Arc<T>, new: Arc<T>) -> bool {
        let mut slot = self.slots[index].write().expect("partition slot poisoned");
        if Arc::ptr_eq(&slot, expected) {
            *slot = new;
            true
        } else {
            false
        }
    }

    /// Unconditionally replace the slot.
    pub fn store(&self, hash: &ContentHash, new: Arc<T>) {
        self.store_index(self.index_of(hash), new);
    }

    pub fn store_index(&self, index: usize, new: Arc<T>) {
        *self.slots[index].write().expect("partition slot poisoned") = new;
    }

    pub fn index_of(&self, hash: &ContentHash) -> usize {
        bucket_index(hash, self.key_length)
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn prefix_of(&self, index: usize) -> String {
        bucket_prefix(index, self.key_length)
    }
}

impl<T> fmt::Debug for AtomicPartitionTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicPartitionTable")
            .field("key_length", &self.key_length)
            .field("buckets", &self.slots.len())
            .finish()
    }
}
