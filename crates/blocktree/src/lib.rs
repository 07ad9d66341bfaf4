//! The encrypted object layer between the byte-range mapper and the store.
//!
//! A [`BlockTree`] owns the codec, a cloneable object-store handle and the
//! [`cache::Cache`]. Reads descend through the cache and fault in via the
//! codec; writes land in the cache immediately and are drained by a pool of
//! writer threads in the background. `flush` is a barrier over the dirty
//! queue; `close` drains it and joins every worker. Sequential block reads
//! can schedule speculative read-ahead on a second, smaller pool.

#![deny(unsafe_code)]

pub mod cache;
pub mod mapper;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, warn};

use block_codec::{Codec, CodecError};
use cloud_store::{ObjectStore, StoreError};
use stratus_core::{
    block_path, parse_block_path, DEFAULT_READ_AHEAD, DEFAULT_WRITER_THREADS,
    WRITE_QUEUE_TO_FLUSH_RATIO, WRITE_TO_TOTAL_CACHE_RATIO,
};

pub use cache::{Cache, CacheLimits, QueueEmpty, Value};
pub use mapper::BlockMapper;

/// Errors surfaced by tree operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// The object store failed permanently.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Decoding or encoding an object failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A stored block decoded to the wrong number of bytes.
    #[error("object '{path}' decoded to {actual} bytes, expected {expected}")]
    BlockLength {
        /// Object path of the bad block.
        path: String,
        /// The volume block size.
        expected: usize,
        /// What the object actually decoded to.
        actual: usize,
    },
    /// Spawning a worker thread failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker-pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    /// Upload worker threads.
    pub writer_threads: usize,
    /// Blocks prefetched after a sequential read; also the reader thread
    /// count. Zero disables read-ahead.
    pub read_ahead: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self { writer_threads: DEFAULT_WRITER_THREADS, read_ahead: DEFAULT_READ_AHEAD }
    }
}

/// Transfer counters, updated atomically by workers and the read path.
#[derive(Default)]
struct TreeCounters {
    recv_count: AtomicU64,
    data_recv: AtomicU64,
    wire_recv: AtomicU64,
    sent_count: AtomicU64,
    data_sent: AtomicU64,
    wire_sent: AtomicU64,
    deleted_count: AtomicU64,
}

/// Point-in-time view of the tree counters plus cache gauges.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    /// GET requests issued.
    pub recv_count: u64,
    /// Plaintext bytes fetched.
    pub data_recv: u64,
    /// Ciphertext bytes fetched.
    pub wire_recv: u64,
    /// PUT requests issued.
    pub sent_count: u64,
    /// Plaintext bytes uploaded.
    pub data_sent: u64,
    /// Ciphertext bytes uploaded.
    pub wire_sent: u64,
    /// DELETE requests issued.
    pub deleted_count: u64,
    /// Entries currently cached.
    pub cache_entries: usize,
    /// Entries currently in the dirty queue.
    pub queue_entries: usize,
}

/// Deduplicating blocking queue feeding the read-ahead workers.
struct SyncQueue {
    inner: Mutex<SyncQueueInner>,
    available: Condvar,
}

struct SyncQueueInner {
    queue: VecDeque<String>,
    members: HashSet<String>,
    closed: bool,
}

impl SyncQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SyncQueueInner {
                queue: VecDeque::new(),
                members: HashSet::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue unless the key is already queued or in flight.
    fn push(&self, key: String) {
        let mut inner = self.inner.lock().expect("read queue lock poisoned");
        if inner.closed || inner.members.contains(&key) {
            return;
        }
        inner.members.insert(key.clone());
        inner.queue.push_back(key);
        drop(inner);
        self.available.notify_one();
    }

    /// Blocking pop; `None` once the queue is closed. The key stays in the
    /// dedupe set until [`SyncQueue::remove`] so it cannot be re-enqueued
    /// while a reader is working on it.
    fn pop(&self) -> Option<String> {
        let mut inner = self.inner.lock().expect("read queue lock poisoned");
        loop {
            if inner.closed {
                return None;
            }
            if let Some(key) = inner.queue.pop_front() {
                return Some(key);
            }
            inner = self.available.wait(inner).expect("read queue lock poisoned");
        }
    }

    fn remove(&self, key: &str) {
        let mut inner = self.inner.lock().expect("read queue lock poisoned");
        inner.members.remove(key);
        if let Some(pos) = inner.queue.iter().position(|k| k == key) {
            inner.queue.remove(pos);
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("read queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }
}

struct Shared {
    cache: Cache,
    codec: Codec,
    store: Box<dyn ObjectStore>,
    counters: TreeCounters,
    read_queue: SyncQueue,
}

/// Fetch and decode one object, accounting transfer stats. A missing object
/// is the absent sentinel, which the mapper reads as a zero block.
fn read_through(
    shared: &Shared,
    store: &dyn ObjectStore,
    path: &str,
) -> Result<Value, TreeError> {
    let obj = store.get(path)?;
    shared.counters.recv_count.fetch_add(1, Ordering::Relaxed);
    match obj {
        None => Ok(None),
        Some(obj) => {
            let wire_len = obj.len() as u64;
            let plain = shared.codec.decrypt(path, obj.content())?;
            shared.counters.data_recv.fetch_add(plain.len() as u64, Ordering::Relaxed);
            shared.counters.wire_recv.fetch_add(wire_len, Ordering::Relaxed);
            Ok(Some(Arc::new(plain)))
        }
    }
}

fn writer_loop(shared: &Shared, store: &dyn ObjectStore) {
    loop {
        let (path, value) = match shared.cache.dequeue() {
            Ok(item) => item,
            Err(QueueEmpty) => break,
        };
        let outcome: Result<(), TreeError> = (|| {
            match &value {
                None => {
                    store.delete(&path)?;
                    shared.counters.deleted_count.fetch_add(1, Ordering::Relaxed);
                }
                Some(data) => {
                    let ciphertext = shared.codec.encrypt(&path, data)?;
                    store.put(&path, &ciphertext)?;
                    shared.counters.sent_count.fetch_add(1, Ordering::Relaxed);
                    shared.counters.data_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                    shared
                        .counters
                        .wire_sent
                        .fetch_add(ciphertext.len() as u64, Ordering::Relaxed);
                }
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => shared.cache.unpin(&path),
            Err(e) => {
                // The key stays pinned; the queue stalls visibly instead of
                // losing the write.
                error!(path = %path, error = %e, "upload failed; writer aborting");
                break;
            }
        }
    }
    debug!("writer worker exiting");
}

fn reader_loop(shared: &Shared, store: &dyn ObjectStore) {
    while let Some(key) = shared.read_queue.pop() {
        if !shared.cache.contains(&key) {
            match read_through(shared, store, &key) {
                Ok(value) => {
                    shared.cache.install_clean(&key, value);
                }
                // Speculative read: a bad object will be reported if and
                // when a real read hits it.
                Err(TreeError::Codec(CodecError::Checksum(_) | CodecError::InvalidKey(_))) => {}
                Err(e) => warn!(key = %key, error = %e, "read-ahead fetch failed"),
            }
        }
        shared.read_queue.remove(&key);
    }
    debug!("read-ahead worker exiting");
}

/// Interface between the object store and the block layer. See the module
/// docs.
pub struct BlockTree {
    shared: Arc<Shared>,
    options: TreeOptions,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BlockTree {
    /// Build a tree over `store` with the given codec. Workers are not
    /// running until [`BlockTree::start`].
    pub fn new(codec: Codec, store: Box<dyn ObjectStore>, options: TreeOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache: Cache::new(CacheLimits::default()),
                codec,
                store,
                counters: TreeCounters::default(),
                read_queue: SyncQueue::new(),
            }),
            options,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Set cache bounds directly.
    pub fn set_cache_limits(&self, limits: CacheLimits) {
        self.shared.cache.set_limits(limits);
    }

    /// Derive cache bounds from a byte budget and the volume block size.
    pub fn calibrate_cache(&self, max_cache: u64, bs: u32) {
        let bs = u64::from(bs.max(1));
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limits = CacheLimits {
            total: usize::try_from(max_cache / bs).unwrap_or(usize::MAX).max(1),
            queue: ((max_cache as f64 * WRITE_TO_TOTAL_CACHE_RATIO / bs as f64) as usize).max(1),
            flush: ((max_cache as f64
                * WRITE_TO_TOTAL_CACHE_RATIO
                * WRITE_QUEUE_TO_FLUSH_RATIO
                / bs as f64) as usize)
                .max(1),
        };
        self.shared.cache.set_limits(limits);
    }

    /// Spawn the writer pool and, when read-ahead is enabled, the reader
    /// pool.
    pub fn start(&self) -> Result<(), TreeError> {
        let mut workers = self.workers.lock().expect("worker list poisoned");
        for i in 0..self.options.writer_threads {
            let shared = Arc::clone(&self.shared);
            let store = self.shared.store.try_clone()?;
            let handle = std::thread::Builder::new()
                .name(format!("stratus-writer-{i}"))
                .spawn(move || writer_loop(&shared, store.as_ref()))?;
            workers.push(handle);
        }
        for i in 0..self.options.read_ahead {
            let shared = Arc::clone(&self.shared);
            let store = self.shared.store.try_clone()?;
            let handle = std::thread::Builder::new()
                .name(format!("stratus-reader-{i}"))
                .spawn(move || reader_loop(&shared, store.as_ref()))?;
            workers.push(handle);
        }
        Ok(())
    }

    /// Read one object through the cache. A sequential block read schedules
    /// the following `read_ahead` blocks for prefetch, skipping ones already
    /// cached.
    pub fn get(&self, path: &str) -> Result<Value, TreeError> {
        if self.options.read_ahead > 0 {
            if let Some(index) = parse_block_path(path) {
                let last = index.saturating_add(self.options.read_ahead as u64);
                for ahead in index.saturating_add(1)..=last {
                    let key = block_path(ahead);
                    if !self.shared.cache.contains(&key) {
                        self.shared.read_queue.push(key);
                    }
                }
            }
        }
        self.shared
            .cache
            .get_or_load(path, || read_through(&self.shared, self.shared.store.as_ref(), path))
    }

    /// Queue an object for asynchronous upload. `None` requests deletion.
    /// Blocks when the dirty queue is full (client backpressure).
    pub fn set(&self, path: &str, value: Option<Vec<u8>>) {
        self.shared.cache.set(path, value.map(Arc::new));
    }

    /// Encrypt and upload synchronously, bypassing the cache. Only the
    /// `config` object is written this way.
    pub fn set_direct(&self, path: &str, data: &[u8]) -> Result<(), TreeError> {
        let ciphertext = self.shared.codec.encrypt(path, data)?;
        self.shared.store.put(path, &ciphertext)?;
        Ok(())
    }

    /// Barrier: returns once the dirty queue and the pin set are both empty.
    pub fn flush(&self) {
        self.shared.cache.flush();
    }

    /// Drain the dirty queue, stop all workers and join them. Idempotent.
    pub fn close(&self) {
        self.shared.cache.set_wait_on_empty(false);
        self.shared.read_queue.close();
        let handles = std::mem::take(&mut *self.workers.lock().expect("worker list poisoned"));
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked during close");
            }
        }
    }

    /// Point-in-time transfer and cache statistics.
    pub fn stats(&self) -> TreeStats {
        let (cache_entries, queue_entries) = self.shared.cache.stats();
        let c = &self.shared.counters;
        TreeStats {
            recv_count: c.recv_count.load(Ordering::Relaxed),
            data_recv: c.data_recv.load(Ordering::Relaxed),
            wire_recv: c.wire_recv.load(Ordering::Relaxed),
            sent_count: c.sent_count.load(Ordering::Relaxed),
            data_sent: c.data_sent.load(Ordering::Relaxed),
            wire_sent: c.wire_sent.load(Ordering::Relaxed),
            deleted_count: c.deleted_count.load(Ordering::Relaxed),
            cache_entries,
            queue_entries,
        }
    }
}

impl Drop for BlockTree {
    fn drop(&mut self) {
        self.close();
    }
}
