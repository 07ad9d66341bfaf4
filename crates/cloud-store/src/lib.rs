//! Object store interface consumed by the block layer.
//!
//! The core never talks to a concrete service directly; it goes through
//! [`ObjectStore`], which abstracts GET/PUT/DELETE/LIST over a key prefix and
//! hands out independent clones for worker threads. Network-style transient
//! failures are retried inside the backend until they succeed, with a bounded
//! sleep between attempts and a soft watchdog that logs when an operation has
//! been stuck for suspiciously long.
//!
//! Two reference backends are provided: [`MemStore`] (shared in-memory map,
//! with fault injection for retry tests) and [`FsStore`] (one file per object
//! under a root directory, atomic-rename writes). Real bucket drivers plug in
//! through the same trait and the [`open_backend`] factory.

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Credentials were rejected by the service.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// The named bucket does not exist.
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),
    /// An operation ran before `check_access()` succeeded.
    #[error("check_access() must be called first")]
    AccessNotChecked,
    /// No backend registered under this tag.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    /// A transient service failure; retried internally.
    #[error("transient: {0}")]
    Transient(String),
    /// The retry policy's elapsed bound was exceeded.
    #[error("gave up after {0:?}: {1}")]
    RetriesExhausted(Duration, String),
    /// A non-retryable I/O failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Whether the retry loop should keep going after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Retry behavior for transient failures.
///
/// The default keeps the original semantics: retry forever with a one second
/// pause, warning every watchdog period that the operation is still stuck.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Sleep between attempts.
    pub base_delay: Duration,
    /// How long an operation may be stuck before a warning is logged.
    pub watchdog: Duration,
    /// Optional hard bound on total elapsed time; `None` retries forever.
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            watchdog: Duration::from_secs(300),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy {
    /// Run `f` until it succeeds or fails permanently.
    ///
    /// Transient errors sleep and retry; every watchdog period a warning is
    /// emitted so a wedged connection is visible in the logs. When
    /// `max_elapsed` is set, expiry converts the last transient error into
    /// [`StoreError::RetriesExhausted`].
    pub fn run<T>(
        &self,
        op: &str,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let start = Instant::now();
        let mut next_bark = self.watchdog;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    let elapsed = start.elapsed();
                    if let Some(max) = self.max_elapsed {
                        if elapsed >= max {
                            return Err(StoreError::RetriesExhausted(elapsed, e.to_string()));
                        }
                    }
                    if elapsed >= next_bark {
                        warn!(op, elapsed_secs = elapsed.as_secs(), error = %e,
                              "store operation still retrying");
                        next_bark += self.watchdog;
                    } else {
                        debug!(op, error = %e, "transient store error; retrying");
                    }
                    std::thread::sleep(self.base_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// An object fetched from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    content: Vec<u8>,
}

impl StoredObject {
    /// Wrap raw object bytes.
    pub fn new(content: Vec<u8>) -> Self {
        Self { content }
    }

    /// The object payload.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Consume the object, returning its payload.
    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Abstract GET/PUT/DELETE/LIST over a volume's key prefix.
///
/// Implementations retry transient failures internally per their
/// [`RetryPolicy`]; callers only ever see permanent errors. `delete` is
/// idempotent: deleting a missing object succeeds.
pub trait ObjectStore: Send + Sync {
    /// Validate credentials and the existence of the backing bucket.
    fn check_access(&mut self) -> Result<(), StoreError>;

    /// Fetch an object; `None` when it does not exist.
    fn get(&self, path: &str) -> Result<Option<StoredObject>, StoreError>;

    /// Create or overwrite an object.
    fn put(&self, path: &str, content: &[u8]) -> Result<(), StoreError>;

    /// Remove an object; missing objects are not an error.
    fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Object paths under `prefix`, in unspecified but stable order.
    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = String> + Send>, StoreError>;

    /// An independent handle safe to move to a worker thread.
    fn try_clone(&self) -> Result<Box<dyn ObjectStore>, StoreError>;
}

/// Construct a backend from its registry tag.
///
/// `location` is backend-specific: ignored by `mem`, the root directory for
/// `fs`. Network drivers register their tags here as they are added.
pub fn open_backend(kind: &str, location: &str) -> Result<Box<dyn ObjectStore>, StoreError> {
    match kind {
        "mem" => Ok(Box::new(MemStore::new())),
        "fs" => Ok(Box::new(FsStore::new(PathBuf::from(location)))),
        other => Err(StoreError::UnknownBackend(other.to_string())),
    }
}

/// Shared in-memory backend.
///
/// Clones share the underlying map, which makes it behave like one remote
/// bucket observed from many handles, exactly what worker threads expect.
#[derive(Clone)]
pub struct MemStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    checked: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    retry: RetryPolicy,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// An empty store with the default retry policy.
    pub fn new() -> Self {
        Self {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            checked: Arc::new(AtomicBool::new(false)),
            fail_next: Arc::new(AtomicU32::new(0)),
            retry: RetryPolicy::default(),
        }
    }

    /// Same store, different retry policy (tests use millisecond delays).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.objects.lock().expect("store mutex poisoned").len()
    }

    fn ensure_access(&self) -> Result<(), StoreError> {
        if self.checked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::AccessNotChecked)
        }
    }

    fn maybe_fault(&self) -> Result<(), StoreError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_next
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(StoreError::Transient("injected fault".into()));
        }
        Ok(())
    }
}

impl ObjectStore for MemStore {
    fn check_access(&mut self) -> Result<(), StoreError> {
        self.checked.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<StoredObject>, StoreError> {
        self.ensure_access()?;
        self.retry.run("get", || {
            self.maybe_fault()?;
            let objects = self.objects.lock().expect("store mutex poisoned");
            Ok(objects.get(path).map(|bytes| StoredObject::new(bytes.clone())))
        })
    }

    fn put(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        self.ensure_access()?;
        self.retry.run("put", || {
            self.maybe_fault()?;
            let mut objects = self.objects.lock().expect("store mutex poisoned");
            objects.insert(path.to_string(), content.to_vec());
            Ok(())
        })
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.ensure_access()?;
        self.retry.run("delete", || {
            self.maybe_fault()?;
            let mut objects = self.objects.lock().expect("store mutex poisoned");
            objects.remove(path);
            Ok(())
        })
    }

    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = String> + Send>, StoreError> {
        self.ensure_access()?;
        let prefix = prefix.to_string();
        let names: Vec<String> = self.retry.run("list", || {
            self.maybe_fault()?;
            let objects = self.objects.lock().expect("store mutex poisoned");
            Ok(objects.keys().filter(|k| k.starts_with(&prefix)).cloned().collect())
        })?;
        Ok(Box::new(names.into_iter()))
    }

    fn try_clone(&self) -> Result<Box<dyn ObjectStore>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}

/// Directory-backed store: one file per object key, `/` in keys maps to
/// subdirectories. Writes go through a unique temp file and an atomic rename
/// so a crashed process never leaves a half-written object behind.
#[derive(Clone)]
pub struct FsStore {
    root: PathBuf,
    checked: Arc<AtomicBool>,
    retry: RetryPolicy,
}

impl FsStore {
    /// A store rooted at `root`. The directory must exist at
    /// `check_access()` time.
    pub fn new(root: PathBuf) -> Self {
        Self { root, checked: Arc::new(AtomicBool::new(false)), retry: RetryPolicy::default() }
    }

    /// Same store, different retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn ensure_access(&self) -> Result<(), StoreError> {
        if self.checked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::AccessNotChecked)
        }
    }

    fn key_path(&self, path: &str) -> Result<PathBuf, StoreError> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid object key '{path}'"),
            )));
        }
        Ok(self.root.join(path))
    }

    fn write_atomic(&self, target: &Path, content: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Unique temp file next to the target, then atomic rename.
        let (tmp_path, mut tmp) = {
            let mut i = 0u64;
            loop {
                let candidate = target.with_extension(format!("tmp-{i}"));
                match fs::OpenOptions::new().write(true).create_new(true).open(&candidate) {
                    Ok(f) => break (candidate, f),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        i = i.wrapping_add(1);
                    }
                    Err(e) => return Err(StoreError::Io(e)),
                }
            }
        };
        let written = tmp.write_all(content).and_then(|()| tmp.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io(e));
        }
        drop(tmp);
        if let Err(e) = fs::rename(&tmp_path, target) {
            let _ = fs::remove_file(&tmp_path);
            return Err(StoreError::Io(e));
        }
        Ok(())
    }

    fn walk(dir: &Path, rel: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let child_rel =
                if rel.is_empty() { name.to_string() } else { format!("{rel}/{name}") };
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, &child_rel, out)?;
            } else if !name.contains(".tmp-") {
                out.push(child_rel);
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsStore {
    fn check_access(&mut self) -> Result<(), StoreError> {
        if !self.root.is_dir() {
            return Err(StoreError::NoSuchBucket(self.root.display().to_string()));
        }
        self.checked.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<StoredObject>, StoreError> {
        self.ensure_access()?;
        let target = self.key_path(path)?;
        self.retry.run("get", || match fs::read(&target) {
            Ok(bytes) => Ok(Some(StoredObject::new(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        })
    }

    fn put(&self, path: &str, content: &[u8]) -> Result<(), StoreError> {
        self.ensure_access()?;
        let target = self.key_path(path)?;
        self.retry.run("put", || self.write_atomic(&target, content))
    }

    fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.ensure_access()?;
        let target = self.key_path(path)?;
        self.retry.run("delete", || match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        })
    }

    fn list(&self, prefix: &str) -> Result<Box<dyn Iterator<Item = String> + Send>, StoreError> {
        self.ensure_access()?;
        let mut names = Vec::new();
        match Self::walk(&self.root, "", &mut names) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        names.retain(|n| n.starts_with(prefix));
        names.sort();
        Ok(Box::new(names.into_iter()))
    }

    fn try_clone(&self) -> Result<Box<dyn ObjectStore>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            watchdog: Duration::from_secs(300),
            max_elapsed: None,
        }
    }

    fn mem() -> MemStore {
        let mut store = MemStore::new().with_retry(fast_retry());
        store.check_access().unwrap();
        store
    }

    #[test]
    fn requires_access_check() {
        let store = MemStore::new();
        assert!(matches!(store.get("x"), Err(StoreError::AccessNotChecked)));
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let store = mem();
        assert_eq!(store.get("blocks/0").unwrap(), None);
        store.put("blocks/0", b"abc").unwrap();
        assert_eq!(store.get("blocks/0").unwrap().unwrap().content(), b"abc");
        store.delete("blocks/0").unwrap();
        assert_eq!(store.get("blocks/0").unwrap(), None);
        // idempotent delete
        store.delete("blocks/0").unwrap();
    }

    #[test]
    fn list_filters_by_prefix() {
        let store = mem();
        store.put("blocks/0", b"a").unwrap();
        store.put("blocks/10", b"b").unwrap();
        store.put("config", b"c").unwrap();
        let blocks: Vec<String> = store.list("blocks/").unwrap().collect();
        assert_eq!(blocks, vec!["blocks/0".to_string(), "blocks/10".to_string()]);
    }

    #[test]
    fn clones_share_objects() {
        let store = mem();
        let other = store.try_clone().unwrap();
        store.put("k", b"v").unwrap();
        assert_eq!(other.get("k").unwrap().unwrap().content(), b"v");
    }

    #[test]
    fn transient_faults_are_retried() {
        let store = mem();
        store.fail_next(3);
        store.put("k", b"v").unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().content(), b"v");
    }

    #[test]
    fn bounded_retry_gives_up() {
        let mut store = MemStore::new().with_retry(RetryPolicy {
            base_delay: Duration::from_millis(1),
            watchdog: Duration::from_secs(300),
            max_elapsed: Some(Duration::from_millis(5)),
        });
        store.check_access().unwrap();
        store.fail_next(u32::MAX);
        assert!(matches!(store.get("k"), Err(StoreError::RetriesExhausted(..))));
    }

    #[test]
    fn unknown_backend_rejected() {
        assert!(matches!(open_backend("gs", ""), Err(StoreError::UnknownBackend(_))));
    }

    #[test]
    fn fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStore::new(dir.path().to_path_buf()).with_retry(fast_retry());
        store.check_access().unwrap();
        store.put("blocks/3", b"payload").unwrap();
        assert_eq!(store.get("blocks/3").unwrap().unwrap().content(), b"payload");
        let names: Vec<String> = store.list("blocks/").unwrap().collect();
        assert_eq!(names, vec!["blocks/3".to_string()]);
        store.delete("blocks/3").unwrap();
        assert_eq!(store.get("blocks/3").unwrap(), None);
        store.delete("blocks/3").unwrap();
    }

    #[test]
    fn fs_store_missing_root_is_no_such_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let mut store = FsStore::new(missing);
        assert!(matches!(store.check_access(), Err(StoreError::NoSuchBucket(_))));
    }

    #[test]
    fn fs_store_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsStore::new(dir.path().to_path_buf());
        store.check_access().unwrap();
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.put("/abs", b"x").is_err());
    }
}
