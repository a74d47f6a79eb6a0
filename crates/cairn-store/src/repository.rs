use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_bus::{Message, MessageManager};
use cairn_codec::{decode, encode, CodecError, Record, Timestamp};
use cairn_types::{ContentHash, HashingWriter};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::InfoCache;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::info::ContentInfo;
use crate::journal::{OperationJournal, Recovery};
use crate::lock::LockManager;
use crate::message::{ContentEvent, ContentEventKind, RepositoryMessage};
use crate::stream::{FsStreamStore, StreamStore};

/// Record holding the repository's identity.
pub const REPOSITORY_FILE: &str = "repository";
/// Directory of content bytes, one file per hash.
pub const CONTENT_DIR: &str = "content";

const INGEST_PREFIX: &str = ".ingest-";

/// Result of a put.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Stored,
    /// Content with this hash was already stored; nothing changed.
    AlreadyPresent,
    /// Another operation on this hash is in progress.
    Busy,
}

impl fmt::Display for PutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stored => "stored",
            Self::AlreadyPresent => "already present",
            Self::Busy => "busy",
        })
    }
}

/// Point-in-time summary of a repository.
#[derive(Clone, Debug, Serialize)]
pub struct RepositoryStatus {
    pub guid: Uuid,
    pub root: PathBuf,
    pub pending: usize,
    pub completed: usize,
    pub deleted: usize,
    pub buckets: usize,
    pub loaded_pages: usize,
}

/// One node's content repository.
///
/// A put runs the journal protocol around a caller-supplied transfer:
/// lock and write a `pending` marker, move the bytes, commit the marker to
/// `completed`, record the [`ContentInfo`], then announce the change on the
/// bus. The hash stays locked until the completed marker is acknowledged,
/// either right away (`auto_acknowledge`) or by a subscriber calling
/// [`acknowledge`](Self::acknowledge).
pub struct Repository {
    guid: Uuid,
    root: PathBuf,
    auto_acknowledge: bool,
    store: Arc<dyn StreamStore>,
    locks: Arc<LockManager>,
    journal: OperationJournal,
    cache: InfoCache,
    bus: Arc<MessageManager>,
}

impl Repository {
    /// Open the repository under `config.root`, creating it if needed.
    pub fn open(config: &StoreConfig, bus: Arc<MessageManager>) -> StoreResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.root)?;
        let store = Arc::new(FsStreamStore::new(&config.root, config.sync_writes));
        Self::open_with_store(config, store, bus)
    }

    /// Open a repository over an arbitrary stream store.
    pub fn open_with_store(
        config: &StoreConfig,
        store: Arc<dyn StreamStore>,
        bus: Arc<MessageManager>,
    ) -> StoreResult<Self> {
        config.validate()?;
        store.ensure_dir(Path::new(CONTENT_DIR))?;
        let guid = load_or_create_guid(store.as_ref())?;

        let locks = Arc::new(LockManager::new(config.key_length)?);
        let journal = OperationJournal::open(Arc::clone(&store), Arc::clone(&locks))?;
        let cache = InfoCache::open(
            Arc::clone(&store),
            config.key_length,
            config.max_loaded_pages,
            config.retry.clone(),
        )?;

        let repository = Self {
            guid,
            root: config.root.clone(),
            auto_acknowledge: config.auto_acknowledge,
            store,
            locks,
            journal,
            cache,
            bus,
        };
        repository.sweep_ingest_files()?;
        let recovery = repository.journal.recover()?;
        repository.resume(recovery)?;

        info!(guid = %guid, root = %repository.root.display(), "repository opened");
        repository.announce(RepositoryMessage::Opened(guid));
        Ok(repository)
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn journal(&self) -> &OperationJournal {
        &self.journal
    }

    pub fn cache(&self) -> &InfoCache {
        &self.cache
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Store the content described by `info`, with `transfer` moving its
    /// bytes into place while the hash is locked.
    ///
    /// A failed transfer aborts the put and is returned as is. If the info
    /// record cannot be written after the put completed, the completed
    /// marker is kept for the next open to finish and the error returned.
    pub fn put_with<F>(&self, info: &ContentInfo, transfer: F) -> StoreResult<PutOutcome>
    where
        F: FnOnce() -> StoreResult<()>,
    {
        if self.cache.get(&info.hash)?.is_some() {
            return Ok(PutOutcome::AlreadyPresent);
        }
        if !self.journal.begin(info)? {
            return Ok(PutOutcome::Busy);
        }
        self.put_locked(info, transfer)
    }

    /// Rest of a put once `begin` holds the hash. Presence is checked again
    /// here because a put that finished after the unlocked check has
    /// already released the lock.
    fn put_locked<F>(&self, info: &ContentInfo, transfer: F) -> StoreResult<PutOutcome>
    where
        F: FnOnce() -> StoreResult<()>,
    {
        match self.cache.get(&info.hash) {
            Ok(None) => {}
            Ok(Some(_)) => {
                debug!(hash = %info.hash.short_hex(), "stored while waiting for the lock");
                self.journal.abort(info);
                return Ok(PutOutcome::AlreadyPresent);
            }
            Err(e) => {
                self.journal.abort(info);
                return Err(e);
            }
        }
        if let Err(e) = transfer() {
            warn!(hash = %info.hash.short_hex(), error = %e, "transfer failed; aborting put");
            self.journal.abort(info);
            return Err(e);
        }
        if let Err(e) = self.journal.complete(info) {
            self.journal.abort(info);
            return Err(e);
        }
        if let Err(e) = self.commit(info) {
            warn!(hash = %info.hash.short_hex(), error = %e, "info not recorded; completed marker kept for recovery");
            self.journal.release(&info.hash);
            return Err(e);
        }
        Ok(PutOutcome::Stored)
    }

    /// Stream `reader` into the repository, hashing it on the way.
    pub fn ingest<R: Read>(
        &self,
        mut reader: R,
        metadata: Record,
    ) -> StoreResult<(ContentInfo, PutOutcome)> {
        let tmp = Path::new(CONTENT_DIR).join(format!("{INGEST_PREFIX}{}", Uuid::now_v7()));
        let written = self
            .store
            .open_truncate(&tmp)
            .and_then(|sink| {
                let mut hashing = HashingWriter::wrap(sink);
                io::copy(&mut reader, &mut hashing)?;
                hashing.finish()
            });
        let (hash, length, sink) = match written {
            Ok(written) => written,
            Err(e) => {
                self.discard_file(&tmp);
                return Err(e.into());
            }
        };
        drop(sink);

        let mut metadata = metadata;
        if !metadata.contains_key("stored") {
            metadata.insert("stored", Timestamp::now());
        }
        let info = ContentInfo::new(hash, length).with_metadata(metadata);
        let target = content_path(&hash);

        let outcome = self.put_with(&info, || Ok(self.store.rename(&tmp, &target)?));
        if !matches!(outcome, Ok(PutOutcome::Stored)) {
            self.discard_file(&tmp);
        }
        let outcome = outcome?;
        debug!(hash = %hash.short_hex(), length, %outcome, "content ingested");
        Ok((info, outcome))
    }

    /// Release a completed put after downstream consumers are done with it.
    pub fn acknowledge(&self, info: &ContentInfo) {
        self.journal.clear(info);
    }

    /// Delete stored content. Returns `Ok(false)` if the hash is busy.
    ///
    /// The hash stays locked until both the info record and the bytes are
    /// gone, so a put of the same content cannot interleave with it.
    pub fn delete(&self, hash: &ContentHash) -> StoreResult<bool> {
        if self.cache.get(hash)?.is_none() {
            return Err(StoreError::NotFound(*hash));
        }
        if !self.journal.delete(hash)? {
            return Ok(false);
        }
        let removed = self.remove_content(hash);
        self.journal.release(hash);
        if !removed? {
            return Err(StoreError::NotFound(*hash));
        }

        info!(hash = %hash.short_hex(), "content deleted");
        self.announce(ContentEvent {
            guid: self.guid,
            hash: *hash,
            kind: ContentEventKind::Deleted,
        });
        self.announce(RepositoryMessage::NewEvent(self.guid));
        Ok(true)
    }

    pub fn info(&self, hash: &ContentHash) -> StoreResult<Option<ContentInfo>> {
        self.cache.get(hash)
    }

    /// Reader over the stored bytes of `hash`.
    pub fn open_content(&self, hash: &ContentHash) -> StoreResult<Option<Box<dyn Read + Send>>> {
        Ok(self.store.open_read(&content_path(hash))?)
    }

    pub fn status(&self) -> StoreResult<RepositoryStatus> {
        Ok(RepositoryStatus {
            guid: self.guid,
            root: self.root.clone(),
            pending: self.journal.pending()?.len(),
            completed: self.journal.completed()?.len(),
            deleted: self.journal.deleted()?.len(),
            buckets: self.cache.bucket_count(),
            loaded_pages: self.cache.loaded_pages(),
        })
    }

    pub fn close(self) {
        info!(guid = %self.guid, "repository closed");
        self.announce(RepositoryMessage::Closed(self.guid));
    }

    /// Close the repository and delete its directory.
    pub fn remove(self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(guid = %self.guid, root = %self.root.display(), "repository removed");
        self.announce(RepositoryMessage::Removed(self.guid));
        Ok(())
    }

    /// Drop the info record and bytes of `hash`. Returns `false` if another
    /// delete got there first.
    fn remove_content(&self, hash: &ContentHash) -> StoreResult<bool> {
        if !self.cache.remove(hash)? {
            return Ok(false);
        }
        self.store.delete(&content_path(hash))?;
        Ok(true)
    }

    /// Record a committed put and tell subscribers about it.
    fn commit(&self, info: &ContentInfo) -> StoreResult<()> {
        self.cache.put(info)?;
        info!(hash = %info.hash.short_hex(), length = info.length, "content stored");
        self.announce(ContentEvent {
            guid: self.guid,
            hash: info.hash,
            kind: ContentEventKind::Stored,
        });
        self.announce(RepositoryMessage::NewEvent(self.guid));
        if self.auto_acknowledge {
            self.journal.clear(info);
        }
        Ok(())
    }

    /// Finish what the previous run left in the journal.
    fn resume(&self, recovery: Recovery) -> StoreResult<()> {
        for info in &recovery.pending {
            warn!(hash = %info.hash.short_hex(), "discarding interrupted put");
            self.journal.abort(info);
        }
        for hash in &recovery.unreadable {
            warn!(hash = %hash.short_hex(), "discarding unreadable pending marker");
            self.journal.discard(hash);
        }
        for info in &recovery.completed {
            if self.cache.get(&info.hash)?.is_none() {
                self.commit(info)?;
            } else if self.auto_acknowledge {
                self.journal.clear(info);
            } else {
                self.announce(ContentEvent {
                    guid: self.guid,
                    hash: info.hash,
                    kind: ContentEventKind::Stored,
                });
            }
        }
        Ok(())
    }

    fn sweep_ingest_files(&self) -> StoreResult<()> {
        for name in self.store.list(Path::new(CONTENT_DIR))? {
            if name.starts_with(INGEST_PREFIX) {
                debug!(name = %name, "removing leftover ingest file");
                self.discard_file(&Path::new(CONTENT_DIR).join(name));
            }
        }
        Ok(())
    }

    fn discard_file(&self, path: &Path) {
        if let Err(e) = self.store.delete(path) {
            warn!(path = %path.display(), error = %e, "failed to remove temporary file");
        }
    }

    fn announce<M: Message>(&self, message: M) {
        if let Err(e) = self.bus.post(message) {
            warn!(guid = %self.guid, error = %e, "message not delivered");
        }
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("guid", &self.guid)
            .field("root", &self.root)
            .field("cache", &self.cache)
            .finish()
    }
}

/// Relative path of the stored bytes for `hash`.
pub fn content_path(hash: &ContentHash) -> PathBuf {
    Path::new(CONTENT_DIR).join(hash.to_hex())
}

fn load_or_create_guid(store: &dyn StreamStore) -> StoreResult<Uuid> {
    let path = Path::new(REPOSITORY_FILE);
    if let Some(mut reader) = store.open_read(path)? {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let record = decode(&bytes)?;
        let guid = Uuid::parse_str(record.str("guid")?).map_err(|e| CodecError::InvalidField {
            field: "guid".to_string(),
            reason: e.to_string(),
        })?;
        return Ok(guid);
    }

    let guid = Uuid::now_v7();
    let record = Record::new()
        .with("guid", guid.to_string())
        .with("created", Timestamp::now());
    store.create_new(path, &encode(&record)?)?;
    info!(guid = %guid, "repository created");
    Ok(guid)
}
