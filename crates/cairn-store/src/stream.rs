use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Byte-stream storage addressed by paths relative to a store root.
///
/// The journal and the info cache only touch persistent state through this
/// trait, so the backing medium can be swapped (for a transactional layer,
/// or for memory in tests) without changing either.
///
/// Writers returned by `open_append` and `open_truncate` buffer; data is
/// guaranteed to reach the store only after `flush`.
pub trait StreamStore: Send + Sync + fmt::Debug {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    fn open_truncate(&self, path: &Path) -> io::Result<Box<dyn Write + Send>>;

    /// `Ok(None)` when nothing exists at `path`.
    fn open_read(&self, path: &Path) -> io::Result<Option<Box<dyn Read + Send>>>;

    /// Create `path` with `contents`, failing with
    /// [`io::ErrorKind::AlreadyExists`] if it is already there.
    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Atomically move `from` to `to`, replacing `to`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Returns `false` when nothing existed at `path`.
    fn delete(&self, path: &Path) -> io::Result<bool>;

    fn exists(&self, path: &Path) -> io::Result<bool>;

    /// Names of the entries directly under `dir`, sorted. A missing
    /// directory lists as empty.
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;

    fn ensure_dir(&self, dir: &Path) -> io::Result<()>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// [`StreamStore`] over a directory on the local filesystem.
#[derive(Debug)]
pub struct FsStreamStore {
    root: PathBuf,
    sync: bool,
}

impl FsStreamStore {
    /// Store rooted at `root`. With `sync` set, creations and flushes are
    /// followed by an `fsync` of the file.
    pub fn new(root: impl Into<PathBuf>, sync: bool) -> Self {
        Self {
            root: root.into(),
            sync,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }

    fn writer(&self, file: File) -> Box<dyn Write + Send> {
        Box::new(FileStream {
            inner: BufWriter::new(file),
            sync: self.sync,
        })
    }
}

struct FileStream {
    inner: BufWriter<File>,
    sync: bool,
}

impl Write for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        if self.sync {
            self.inner.get_ref().sync_data()?;
        }
        Ok(())
    }
}

impl StreamStore for FsStreamStore {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resolve(path))?;
        Ok(self.writer(file))
    }

    fn open_truncate(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.resolve(path))?;
        Ok(self.writer(file))
    }

    fn open_read(&self, path: &Path) -> io::Result<Option<Box<dyn Read + Send>>> {
        match File::open(self.resolve(path)) {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(path))?;
        file.write_all(contents)?;
        if self.sync {
            file.sync_all()?;
        }
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(self.resolve(from), self.resolve(to))
    }

    fn delete(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        self.resolve(path).try_exists()
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.resolve(dir)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!(name = ?raw, "skipping non-UTF-8 entry"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn ensure_dir(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(self.resolve(dir))
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

type Files = Arc<Mutex<BTreeMap<PathBuf, Vec<u8>>>>;

/// [`StreamStore`] kept entirely in memory.
///
/// Directories are implicit: listing a directory returns the names of files
/// stored directly beneath it. Reads can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryStreamStore {
    files: Files,
    fail_reads: AtomicBool,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open_read` fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Raw contents stored at `path`.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("memory store poisoned")
            .get(path)
            .cloned()
    }
}

/// Writes land in the shared map as soon as they are made.
struct MemoryStream {
    files: Files,
    path: PathBuf,
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .expect("memory store poisoned")
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamStore for MemoryStreamStore {
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.files
            .lock()
            .expect("memory store poisoned")
            .entry(path.to_path_buf())
            .or_default();
        Ok(Box::new(MemoryStream {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        }))
    }

    fn open_truncate(&self, path: &Path) -> io::Result<Box<dyn Write + Send>> {
        self.files
            .lock()
            .expect("memory store poisoned")
            .insert(path.to_path_buf(), Vec::new());
        Ok(Box::new(MemoryStream {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        }))
    }

    fn open_read(&self, path: &Path) -> io::Result<Option<Box<dyn Read + Send>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        Ok(self
            .contents(path)
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>))
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut files = self.files.lock().expect("memory store poisoned");
        if files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        files.insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.lock().expect("memory store poisoned");
        let bytes = files.remove(from).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{} not found", from.display()))
        })?;
        files.insert(to.to_path_buf(), bytes);
        Ok(())
    }

    fn delete(&self, path: &Path) -> io::Result<bool> {
        Ok(self
            .files
            .lock()
            .expect("memory store poisoned")
            .remove(path)
            .is_some())
    }

    fn exists(&self, path: &Path) -> io::Result<bool> {
        Ok(self
            .files
            .lock()
            .expect("memory store poisoned")
            .contains_key(path))
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        let files = self.files.lock().expect("memory store poisoned");
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| p.file_name()?.to_str().map(str::to_string))
            .collect())
    }

    fn ensure_dir(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(store: &dyn StreamStore, path: &Path) -> Option<Vec<u8>> {
        store.open_read(path).unwrap().map(|mut r| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf).unwrap();
            buf
        })
    }

    fn exercise(store: &dyn StreamStore) {
        let dir = Path::new("pending");
        store.ensure_dir(dir).unwrap();
        let a = dir.join("a");
        let b = Path::new("done");

        assert!(read_all(store, &a).is_none());
        store.create_new(&a, b"one").unwrap();
        let err = store.create_new(&a, b"two").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        let mut w = store.open_append(&a).unwrap();
        w.write_all(b"+more").unwrap();
        w.flush().unwrap();
        drop(w);
        assert_eq!(read_all(store, &a).unwrap(), b"one+more");

        let mut w = store.open_truncate(&a).unwrap();
        w.write_all(b"fresh").unwrap();
        w.flush().unwrap();
        drop(w);
        assert_eq!(read_all(store, &a).unwrap(), b"fresh");

        assert_eq!(store.list(dir).unwrap(), vec!["a".to_string()]);
        store.rename(&a, b).unwrap();
        assert!(!store.exists(&a).unwrap());
        assert!(store.exists(b).unwrap());
        assert!(store.list(dir).unwrap().is_empty());

        assert!(store.delete(b).unwrap());
        assert!(!store.delete(b).unwrap());
        assert!(store.list(Path::new("missing")).unwrap().is_empty());
    }

    #[test]
    fn filesystem_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsStreamStore::new(dir.path(), false));
    }

    #[test]
    fn synced_filesystem_store_semantics() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsStreamStore::new(dir.path(), true));
    }

    #[test]
    fn memory_store_semantics() {
        exercise(&MemoryStreamStore::new());
    }

    #[test]
    fn memory_store_injects_read_failures() {
        let store = MemoryStreamStore::new();
        store.create_new(Path::new("x"), b"1").unwrap();
        store.fail_reads(true);
        assert!(store.open_read(Path::new("x")).is_err());
        store.fail_reads(false);
        assert_eq!(read_all(&store, Path::new("x")).unwrap(), b"1");
    }

    #[test]
    fn listing_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStreamStore::new(dir.path(), false);
        for name in ["c", "a", "b"] {
            store.create_new(Path::new(name), b"").unwrap();
        }
        assert_eq!(store.list(Path::new("")).unwrap(), vec!["a", "b", "c"]);
    }
}
