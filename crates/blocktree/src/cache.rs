//! Bounded cache that is simultaneously a read LRU, a write-coalescing dirty
//! queue and a flush barrier.
//!
//! One mutex serializes everything; two condition variables carry the
//! backpressure (`space_available` for setters, `work_available` for
//! dequeuers) and a third releases flush barriers. A cached value of `None`
//! means "this object does not exist on the store" on the read side and
//! "delete this object" once queued for upload.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Cached payload: `None` is the absent/zero sentinel and, when dirty, a
/// delete request. Payloads are shared so cache hits never copy.
pub type Value = Option<std::sync::Arc<Vec<u8>>>;

/// Returned by [`Cache::dequeue`] once draining is over and workers should
/// exit.
#[derive(Debug, thiserror::Error)]
#[error("dirty queue is empty")]
pub struct QueueEmpty;

/// Entry-count bounds of a cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Cap on total cached entries; unqueued LRU tail entries are dropped
    /// beyond it.
    pub total: usize,
    /// Dirty-queue capacity; setters block once it is reached.
    pub queue: usize,
    /// Workers sleep until the queue holds at least this many entries, so
    /// uploads happen in batches.
    pub flush: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self { total: 1, queue: 1, flush: 1 }
    }
}

struct Slot {
    value: Value,
    tick: u64,
}

struct Inner {
    map: HashMap<String, Slot>,
    queue: VecDeque<String>,
    queued: HashSet<String>,
    pinned: HashSet<String>,
    limits: CacheLimits,
    tick: u64,
    wait_on_empty: bool,
    greedy: bool,
}

impl Inner {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn drained(&self) -> bool {
        self.queue.is_empty() && self.pinned.is_empty()
    }

    /// Drop least-recently-written entries that are neither queued nor
    /// pinned until the total cap is met.
    fn trim(&mut self) {
        if self.map.len() <= self.limits.total {
            return;
        }
        let mut candidates: Vec<(u64, String)> = self
            .map
            .iter()
            .filter(|(k, _)| !self.queued.contains(*k) && !self.pinned.contains(*k))
            .map(|(k, slot)| (slot.tick, k.clone()))
            .collect();
        candidates.sort();
        let excess = self.map.len() - self.limits.total;
        for (_, key) in candidates.into_iter().take(excess) {
            self.map.remove(&key);
        }
    }

    /// Pop the oldest queued key that no worker owns, moving it to the pin
    /// set.
    fn pop_unpinned(&mut self) -> Option<String> {
        let pos = self.queue.iter().position(|k| !self.pinned.contains(k))?;
        let key = self.queue.remove(pos).expect("position came from iter");
        self.queued.remove(&key);
        self.pinned.insert(key.clone());
        Some(key)
    }
}

/// The shared cache. See the module docs for the moving parts.
pub struct Cache {
    inner: Mutex<Inner>,
    space_available: Condvar,
    work_available: Condvar,
    flush_done: Condvar,
}

impl Cache {
    /// An empty cache with the given bounds.
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                queue: VecDeque::new(),
                queued: HashSet::new(),
                pinned: HashSet::new(),
                limits,
                tick: 0,
                wait_on_empty: true,
                greedy: false,
            }),
            space_available: Condvar::new(),
            work_available: Condvar::new(),
            flush_done: Condvar::new(),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("cache lock poisoned")
    }

    /// Replace the entry-count bounds.
    pub fn set_limits(&self, limits: CacheLimits) {
        let mut inner = self.locked();
        inner.limits = limits;
        drop(inner);
        self.space_available.notify_all();
        self.work_available.notify_all();
    }

    /// Whether `key` currently has a cached value (including the absent
    /// sentinel).
    pub fn contains(&self, key: &str) -> bool {
        self.locked().map.contains_key(key)
    }

    /// Current `(total entries, dirty queue length)`.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.locked();
        (inner.map.len(), inner.queue.len())
    }

    /// Return the cached value for `key`, or run `loader` (outside the lock)
    /// and install its result. Concurrent loads of the same key may race;
    /// the first installed value wins.
    pub fn get_or_load<E>(
        &self,
        key: &str,
        loader: impl FnOnce() -> Result<Value, E>,
    ) -> Result<Value, E> {
        if let Some(slot) = self.locked().map.get(key) {
            return Ok(slot.value.clone());
        }
        let value = loader()?;
        Ok(self.install_clean(key, value))
    }

    /// Insert `value` without dirtying it, only if `key` is absent. Returns
    /// whichever value is resident afterwards. Used by read-through and
    /// read-ahead.
    pub fn install_clean(&self, key: &str, value: Value) -> Value {
        let mut inner = self.locked();
        if let Some(slot) = inner.map.get(key) {
            return slot.value.clone();
        }
        let tick = inner.touch();
        inner.map.insert(key.to_string(), Slot { value: value.clone(), tick });
        inner.trim();
        value
    }

    /// Write `value` and mark it dirty.
    ///
    /// Blocks while the dirty queue is full and `key` is not already in it;
    /// this is the backpressure that throttles the NBD client. A key that is
    /// already queued is coalesced: its payload is replaced and it moves to
    /// the back of the queue. A pinned key is re-queued so the newest payload
    /// is uploaded again after the in-flight one finishes.
    pub fn set(&self, key: &str, value: Value) {
        let mut inner = self.locked();
        while !inner.queued.contains(key) && inner.queue.len() == inner.limits.queue {
            inner = self.space_available.wait(inner).expect("cache lock poisoned");
        }
        let tick = inner.touch();
        inner.map.insert(key.to_string(), Slot { value, tick });
        if inner.queued.contains(key) {
            if let Some(pos) = inner.queue.iter().position(|k| k == key) {
                inner.queue.remove(pos);
            }
        } else {
            inner.queued.insert(key.to_string());
        }
        inner.queue.push_back(key.to_string());
        inner.trim();
        if inner.greedy || inner.queue.len() >= inner.limits.flush {
            self.work_available.notify_all();
        }
    }

    /// Take the oldest unpinned dirty key for upload, pinning it.
    ///
    /// Sleeps while the queue is below the flush threshold (unless a greedy
    /// flush is draining) or every queued entry is pinned. Once
    /// `set_wait_on_empty(false)` has been called an empty queue returns
    /// [`QueueEmpty`] instead of blocking, which is how workers are told to
    /// exit.
    pub fn dequeue(&self) -> Result<(String, Value), QueueEmpty> {
        let mut inner = self.locked();
        loop {
            if inner.wait_on_empty {
                let ready = if inner.greedy {
                    !inner.queue.is_empty()
                } else {
                    inner.queue.len() >= inner.limits.flush
                };
                if !ready {
                    inner = self.work_available.wait(inner).expect("cache lock poisoned");
                    continue;
                }
            } else if inner.queue.is_empty() {
                return Err(QueueEmpty);
            }
            match inner.pop_unpinned() {
                Some(key) => {
                    self.space_available.notify_all();
                    let value =
                        inner.map.get(&key).map(|slot| slot.value.clone()).unwrap_or_default();
                    return Ok((key, value));
                }
                None => {
                    inner = self.work_available.wait(inner).expect("cache lock poisoned");
                }
            }
        }
    }

    /// Release a pinned key after its upload finished. Ends greedy mode and
    /// wakes flush barriers once both the queue and the pin set are empty.
    pub fn unpin(&self, key: &str) {
        let mut inner = self.locked();
        if inner.pinned.remove(key) {
            self.work_available.notify_all();
        }
        if inner.greedy && inner.drained() {
            inner.greedy = false;
            self.flush_done.notify_all();
        }
    }

    /// Barrier: return once every dirty entry present at (or queued during)
    /// this call has been uploaded. Enables greedy dequeue so workers drain
    /// the queue regardless of the flush threshold.
    pub fn flush(&self) {
        let mut inner = self.locked();
        if inner.drained() {
            return;
        }
        inner.greedy = true;
        self.work_available.notify_all();
        while !inner.drained() {
            inner = self.flush_done.wait(inner).expect("cache lock poisoned");
        }
    }

    /// Toggle worker shutdown mode; see [`Cache::dequeue`].
    pub fn set_wait_on_empty(&self, wait: bool) {
        let mut inner = self.locked();
        inner.wait_on_empty = wait;
        drop(inner);
        self.work_available.notify_all();
    }
}
