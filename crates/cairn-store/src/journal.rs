use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_codec::{decode, FromRecord};
use cairn_types::ContentHash;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::info::ContentInfo;
use crate::lock::LockManager;
use crate::stream::StreamStore;

/// Directory a journal marker lives in; the directory is the state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Pending,
    Completed,
    Deleted,
}

impl MarkerState {
    pub const ALL: [MarkerState; 3] = [Self::Pending, Self::Completed, Self::Deleted];

    pub fn dir(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for MarkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// Markers found by [`OperationJournal::recover`].
#[derive(Debug, Default)]
pub struct Recovery {
    /// Puts that began but never completed. Their locks are held.
    pub pending: Vec<ContentInfo>,
    /// Puts that completed but were never acknowledged. Their locks are held.
    pub completed: Vec<ContentInfo>,
    pub deleted: Vec<ContentHash>,
    /// Pending markers whose record could not be decoded, typically torn by
    /// a crash during `begin`. Their locks are held; see
    /// [`OperationJournal::discard`].
    pub unreadable: Vec<ContentHash>,
}

impl Recovery {
    pub fn is_clean(&self) -> bool {
        self.pending.is_empty() && self.completed.is_empty() && self.unreadable.is_empty()
    }
}

/// Releases a journal lock when dropped, whatever path the caller takes.
struct Release<'a> {
    locks: &'a LockManager,
    hash: ContentHash,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.locks.unlock(&self.hash);
    }
}

/// Crash-recoverable record of in-flight put and delete operations.
///
/// Each operation on a hash is a marker file named by the hash's hex form:
///
/// ```text
/// (absent) --begin-->  pending  --complete--> completed --clear--> (absent)
///                      pending  --abort-----> (absent)
/// (absent) --delete--> deleted
/// ```
///
/// `begin` takes the hash's exclusive lock and the lock stays held until
/// `abort` or `clear`, so two operations on the same hash never interleave.
/// The rename performed by `complete` is the commit point of a put: after a
/// crash, a marker in `pending` means the put did not happen and a marker in
/// `completed` means it did.
pub struct OperationJournal {
    store: Arc<dyn StreamStore>,
    locks: Arc<LockManager>,
}

impl OperationJournal {
    /// Open the journal, creating its directories if needed.
    pub fn open(store: Arc<dyn StreamStore>, locks: Arc<LockManager>) -> StoreResult<Self> {
        for state in MarkerState::ALL {
            store.ensure_dir(Path::new(state.dir()))?;
        }
        Ok(Self { store, locks })
    }

    fn marker(state: MarkerState, hash: &ContentHash) -> PathBuf {
        Path::new(state.dir()).join(hash.to_hex())
    }

    /// Start a put. Returns `Ok(false)` if another operation holds the hash.
    ///
    /// A `pending` marker left over from an earlier run fails with
    /// [`StoreError::MarkerExists`]. On any error the lock is released.
    pub fn begin(&self, info: &ContentInfo) -> StoreResult<bool> {
        let hash = info.hash;
        let bytes = info.encode()?;
        if !self.locks.lock(&hash) {
            debug!(hash = %hash.short_hex(), "begin rejected: operation in progress");
            return Ok(false);
        }
        let release = Release {
            locks: &self.locks,
            hash,
        };

        match self
            .store
            .create_new(&Self::marker(MarkerState::Pending, &hash), &bytes)
        {
            Ok(()) => {
                std::mem::forget(release);
                debug!(hash = %hash.short_hex(), length = info.length, "put begun");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn!(hash = %hash.short_hex(), "orphaned pending marker");
                Err(StoreError::MarkerExists(hash))
            }
            Err(e) => {
                warn!(hash = %hash.short_hex(), error = %e, "failed to write pending marker");
                Err(e.into())
            }
        }
    }

    /// Commit a put by moving its marker to `completed`. The lock stays held.
    pub fn complete(&self, info: &ContentInfo) -> StoreResult<()> {
        let hash = info.hash;
        match self.store.rename(
            &Self::marker(MarkerState::Pending, &hash),
            &Self::marker(MarkerState::Completed, &hash),
        ) {
            Ok(()) => {
                debug!(hash = %hash.short_hex(), "put completed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotPending(hash)),
            Err(e) => Err(e.into()),
        }
    }

    /// Cancel a put that has not completed. Always releases the lock.
    pub fn abort(&self, info: &ContentInfo) {
        self.discard(&info.hash);
    }

    /// Remove the `pending` marker for `hash` and release its lock, without
    /// needing its decoded record.
    pub fn discard(&self, hash: &ContentHash) {
        let _release = Release {
            locks: &self.locks,
            hash: *hash,
        };
        self.remove_marker(MarkerState::Pending, hash);
        debug!(hash = %hash.short_hex(), "put aborted");
    }

    /// Acknowledge a completed put. Always releases the lock.
    pub fn clear(&self, info: &ContentInfo) {
        let _release = Release {
            locks: &self.locks,
            hash: info.hash,
        };
        self.remove_marker(MarkerState::Completed, &info.hash);
        debug!(hash = %info.hash.short_hex(), "completed marker cleared");
    }

    /// Record a delete. Returns `Ok(false)` if another operation holds the
    /// hash. An existing `deleted` marker is left as is.
    ///
    /// On `Ok(true)` the lock stays held so the caller can remove the
    /// content before any put of the same hash starts; it must then call
    /// [`release`](Self::release). On error the lock is released.
    pub fn delete(&self, hash: &ContentHash) -> StoreResult<bool> {
        if !self.locks.lock(hash) {
            debug!(hash = %hash.short_hex(), "delete rejected: operation in progress");
            return Ok(false);
        }
        let release = Release {
            locks: &self.locks,
            hash: *hash,
        };

        match self
            .store
            .create_new(&Self::marker(MarkerState::Deleted, hash), &[])
        {
            Ok(()) => debug!(hash = %hash.short_hex(), "delete recorded"),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(hash = %hash.short_hex(), "delete already recorded")
            }
            Err(e) => return Err(e.into()),
        }
        std::mem::forget(release);
        Ok(true)
    }

    /// Release the lock on `hash` without touching its markers.
    pub fn release(&self, hash: &ContentHash) {
        self.locks.unlock(hash);
    }

    /// Where the marker for `hash` currently lives, if anywhere.
    pub fn state(&self, hash: &ContentHash) -> StoreResult<Option<MarkerState>> {
        for state in MarkerState::ALL {
            if self.store.exists(&Self::marker(state, hash))? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    pub fn pending(&self) -> StoreResult<Vec<ContentHash>> {
        self.list(MarkerState::Pending)
    }

    pub fn completed(&self) -> StoreResult<Vec<ContentHash>> {
        self.list(MarkerState::Completed)
    }

    pub fn deleted(&self) -> StoreResult<Vec<ContentHash>> {
        self.list(MarkerState::Deleted)
    }

    /// Decoded record of a `pending` or `completed` marker.
    pub fn read_marker(
        &self,
        state: MarkerState,
        hash: &ContentHash,
    ) -> StoreResult<Option<ContentInfo>> {
        let Some(mut reader) = self.store.open_read(&Self::marker(state, hash))? else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let record = decode(&bytes)?;
        Ok(Some(ContentInfo::from_record(&record)?))
    }

    /// Collect markers left by a previous run and take the locks of every
    /// unfinished put, so the caller can complete, abort or clear them.
    pub fn recover(&self) -> StoreResult<Recovery> {
        let mut recovery = Recovery::default();

        for hash in self.pending()? {
            self.relock(&hash);
            match self.read_marker(MarkerState::Pending, &hash) {
                Ok(Some(info)) => recovery.pending.push(info),
                Ok(None) => self.locks.unlock(&hash),
                Err(StoreError::Codec(e)) => {
                    warn!(hash = %hash.short_hex(), error = %e, "unreadable pending marker");
                    recovery.unreadable.push(hash);
                }
                Err(e) => return Err(e),
            }
        }

        for hash in self.completed()? {
            self.relock(&hash);
            match self.read_marker(MarkerState::Completed, &hash) {
                Ok(Some(info)) => recovery.completed.push(info),
                Ok(None) => self.locks.unlock(&hash),
                Err(StoreError::Codec(e)) => {
                    // The put itself finished; only its acknowledgement is lost.
                    warn!(hash = %hash.short_hex(), error = %e, "unreadable completed marker; dropping");
                    self.remove_marker(MarkerState::Completed, &hash);
                    self.locks.unlock(&hash);
                }
                Err(e) => return Err(e),
            }
        }

        recovery.deleted = self.deleted()?;

        info!(
            pending = recovery.pending.len(),
            completed = recovery.completed.len(),
            deleted = recovery.deleted.len(),
            unreadable = recovery.unreadable.len(),
            "journal recovered"
        );
        Ok(recovery)
    }

    fn relock(&self, hash: &ContentHash) {
        if !self.locks.lock(hash) {
            debug!(hash = %hash.short_hex(), "recovered marker already locked");
        }
    }

    fn remove_marker(&self, state: MarkerState, hash: &ContentHash) {
        match self.store.delete(&Self::marker(state, hash)) {
            Ok(true) => {}
            Ok(false) => debug!(hash = %hash.short_hex(), %state, "marker already gone"),
            Err(e) => warn!(hash = %hash.short_hex(), %state, error = %e, "failed to remove marker"),
        }
    }

    fn list(&self, state: MarkerState) -> StoreResult<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for name in self.store.list(Path::new(state.dir()))? {
            match ContentHash::from_hex(&name) {
                Ok(hash) => hashes.push(hash),
                Err(_) => debug!(%state, name = %name, "ignoring foreign file in journal"),
            }
        }
        Ok(hashes)
    }
}

impl fmt::Debug for OperationJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationJournal")
            .field("store", &self.store)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FsStreamStore, MemoryStreamStore};
    use cairn_codec::Record;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn StreamStore>,
        locks: Arc<LockManager>,
        journal: OperationJournal,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn StreamStore> = Arc::new(FsStreamStore::new(dir.path(), false));
        let locks = Arc::new(LockManager::new(1).unwrap());
        let journal = OperationJournal::open(Arc::clone(&store), Arc::clone(&locks)).unwrap();
        Fixture {
            _dir: dir,
            store,
            locks,
            journal,
        }
    }

    /// Reopen the same directory with fresh in-memory state, as after a crash.
    fn restart(f: &Fixture) -> (Arc<LockManager>, OperationJournal) {
        let locks = Arc::new(LockManager::new(1).unwrap());
        let journal = OperationJournal::open(Arc::clone(&f.store), Arc::clone(&locks)).unwrap();
        (locks, journal)
    }

    fn info(data: &[u8]) -> ContentInfo {
        ContentInfo::new(ContentHash::of(data), data.len() as u64)
            .with_metadata(Record::new().with("origin", "test"))
    }

    #[test]
    fn put_lifecycle() {
        let f = fixture();
        let i = info(b"data");

        assert_eq!(f.journal.state(&i.hash).unwrap(), None);
        assert!(f.journal.begin(&i).unwrap());
        assert_eq!(f.journal.state(&i.hash).unwrap(), Some(MarkerState::Pending));
        assert_eq!(
            f.journal.read_marker(MarkerState::Pending, &i.hash).unwrap(),
            Some(i.clone())
        );

        f.journal.complete(&i).unwrap();
        assert_eq!(f.journal.state(&i.hash).unwrap(), Some(MarkerState::Completed));
        assert!(f.journal.pending().unwrap().is_empty());
        assert_eq!(f.journal.completed().unwrap(), vec![i.hash]);
        assert!(f.locks.is_locked(&i.hash));

        f.journal.clear(&i);
        assert_eq!(f.journal.state(&i.hash).unwrap(), None);
        assert!(!f.locks.is_locked(&i.hash));
    }

    #[test]
    fn concurrent_begin_is_rejected() {
        let f = fixture();
        let i = info(b"dup");
        assert!(f.journal.begin(&i).unwrap());
        assert!(!f.journal.begin(&i).unwrap());
        f.journal.complete(&i).unwrap();
        assert!(!f.journal.begin(&i).unwrap());
    }

    #[test]
    fn abort_removes_marker_and_releases() {
        let f = fixture();
        let i = info(b"abort");
        assert!(f.journal.begin(&i).unwrap());
        f.journal.abort(&i);
        assert_eq!(f.journal.state(&i.hash).unwrap(), None);
        assert!(!f.locks.is_locked(&i.hash));

        // Nothing to remove: lock is still released.
        assert!(f.locks.lock(&i.hash));
        f.journal.abort(&i);
        assert!(!f.locks.is_locked(&i.hash));
    }

    #[test]
    fn complete_without_begin_is_not_pending() {
        let f = fixture();
        let i = info(b"never begun");
        assert!(matches!(
            f.journal.complete(&i),
            Err(StoreError::NotPending(h)) if h == i.hash
        ));
    }

    #[test]
    fn orphaned_marker_is_reported_and_lock_released() {
        let f = fixture();
        let i = info(b"orphan");
        assert!(f.journal.begin(&i).unwrap());

        let (locks, journal) = restart(&f);
        assert!(matches!(
            journal.begin(&i),
            Err(StoreError::MarkerExists(h)) if h == i.hash
        ));
        assert!(!locks.is_locked(&i.hash));
    }

    #[test]
    fn write_failure_releases_lock() {
        let f = fixture();
        std::fs::remove_dir(f._dir.path().join("pending")).unwrap();
        let i = info(b"io");
        assert!(matches!(f.journal.begin(&i), Err(StoreError::Io(_))));
        assert!(!f.locks.is_locked(&i.hash));
    }

    #[test]
    fn delete_records_terminal_marker() {
        let f = fixture();
        let h = ContentHash::of(b"gone");
        assert!(f.journal.delete(&h).unwrap());
        assert_eq!(f.journal.state(&h).unwrap(), Some(MarkerState::Deleted));
        assert!(f.locks.is_locked(&h));
        assert!(!f.journal.delete(&h).unwrap());
        assert!(!f.journal.begin(&info(b"gone")).unwrap());

        f.journal.release(&h);
        assert!(!f.locks.is_locked(&h));
        assert!(f.journal.delete(&h).unwrap());
        f.journal.release(&h);
        assert_eq!(f.journal.deleted().unwrap(), vec![h]);
    }

    #[test]
    fn failed_delete_releases_lock() {
        let f = fixture();
        std::fs::remove_dir(f._dir.path().join("deleted")).unwrap();
        let h = ContentHash::of(b"stuck");
        assert!(matches!(f.journal.delete(&h), Err(StoreError::Io(_))));
        assert!(!f.locks.is_locked(&h));
    }

    #[test]
    fn crash_between_begin_and_complete_is_recoverable() {
        let f = fixture();
        let interrupted = info(b"interrupted");
        let committed = info(b"committed");
        assert!(f.journal.begin(&interrupted).unwrap());
        assert!(f.journal.begin(&committed).unwrap());
        f.journal.complete(&committed).unwrap();
        f.journal.delete(&ContentHash::of(b"deleted")).unwrap();
        f.journal.release(&ContentHash::of(b"deleted"));

        let (locks, journal) = restart(&f);
        let recovery = journal.recover().unwrap();
        assert_eq!(recovery.pending, vec![interrupted.clone()]);
        assert_eq!(recovery.completed, vec![committed.clone()]);
        assert_eq!(recovery.deleted, vec![ContentHash::of(b"deleted")]);
        assert!(!recovery.is_clean());
        assert!(locks.is_locked(&interrupted.hash));
        assert!(locks.is_locked(&committed.hash));

        journal.abort(&interrupted);
        journal.clear(&committed);
        assert!(journal.recover().unwrap().is_clean());
        assert!(!locks.is_locked(&interrupted.hash));
    }

    #[test]
    fn torn_marker_is_unreadable() {
        let store = Arc::new(MemoryStreamStore::new());
        let locks = Arc::new(LockManager::new(1).unwrap());
        let journal =
            OperationJournal::open(Arc::clone(&store) as Arc<dyn StreamStore>, Arc::clone(&locks))
                .unwrap();
        let i = info(b"torn");
        let bytes = i.encode().unwrap();
        store
            .create_new(
                &Path::new("pending").join(i.hash.to_hex()),
                &bytes[..bytes.len() / 2],
            )
            .unwrap();

        let recovery = journal.recover().unwrap();
        assert_eq!(recovery.unreadable, vec![i.hash]);
        assert!(locks.is_locked(&i.hash));

        journal.discard(&i.hash);
        assert_eq!(journal.state(&i.hash).unwrap(), None);
        assert!(!locks.is_locked(&i.hash));
    }

    #[test]
    fn unreadable_completed_marker_is_dropped() {
        let f = fixture();
        let good = info(b"good");
        let torn = info(b"torn completed");
        assert!(f.journal.begin(&good).unwrap());
        f.journal.complete(&good).unwrap();
        let bytes = torn.encode().unwrap();
        f.store
            .create_new(
                &Path::new("completed").join(torn.hash.to_hex()),
                &bytes[..bytes.len() - 3],
            )
            .unwrap();

        let (locks, journal) = restart(&f);
        let recovery = journal.recover().unwrap();
        assert_eq!(recovery.completed, vec![good.clone()]);
        assert!(recovery.unreadable.is_empty());
        assert_eq!(journal.state(&torn.hash).unwrap(), None);
        assert!(!locks.is_locked(&torn.hash));
        assert!(locks.is_locked(&good.hash));
    }

    #[test]
    fn foreign_files_are_ignored() {
        let f = fixture();
        f.store
            .create_new(Path::new("pending/README"), b"not a marker")
            .unwrap();
        assert!(f.journal.pending().unwrap().is_empty());
    }
}
