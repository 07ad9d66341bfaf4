//! Volume lifecycle operations and the serve loop.
//!
//! A volume is a named unit of storage inside one bucket: an encrypted JSON
//! `config` object plus `blocks/<N>` payload objects. This crate provides the
//! operations that manage that lifecycle ([`init`], [`open`], [`resize`],
//! [`delete`], [`passwd`], [`info`]) and [`VolumeServer`], which exposes an
//! open volume to a kernel NBD client.
//!
//! Command-line parsing, credential prompting and daemonization live outside
//! this crate; everything here is plain library surface.

#![deny(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::Write as _;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt as tsfmt, layer::SubscriberExt, EnvFilter, Registry};

use block_codec::{Codec, CodecError, Compressor};
use blocktree::{BlockMapper, BlockTree, TreeError, TreeOptions, TreeStats};
use cloud_store::{ObjectStore, StoreError};
use nbd_server::{BlockDevice, Errno, NbdError, NbdServer, NbdStats, SessionEnd};
use stratus_core::config::{ConfigError, VolumeConfig};
use stratus_core::keys::{derive_pass_key, DataKey};
use stratus_core::{
    size_to_hum, BLOCKS_PREFIX, CONFIG_PATH, DEFAULT_BLOCK_SIZE, DEFAULT_DELETE_THREADS,
    DEFAULT_READ_AHEAD, DEFAULT_TOTAL_CACHE, DEFAULT_WRITER_THREADS,
};

/// Errors from volume operations.
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// Object store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Block layer failure.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// Codec failure outside the wrong-passphrase case.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Config object encoding/decoding failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// NBD session failure.
    #[error(transparent)]
    Nbd(#[from] NbdError),
    /// The supplied passphrase does not decrypt the config object.
    #[error("wrong passphrase")]
    WrongPassphrase,
    /// No config object exists under this volume's prefix.
    #[error("volume '{0}' does not exist")]
    NoSuchVolume(String),
    /// `init` found an existing config object.
    #[error("volume '{0}' already exists")]
    AlreadyExists(String),
    /// Another server holds this volume's advisory lock.
    #[error("volume '{0}' is already open")]
    AlreadyOpen(String),
    /// The volume is marked for deletion.
    #[error("volume '{0}' is set to be deleted")]
    Deleted(String),
    /// The volume requires capabilities this build does not have.
    #[error("unsupported capabilities required by the volume: {}", .0.join(", "))]
    Unsupported(Vec<String>),
    /// Filesystem-level failure (lock files and the like).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Install a JSON tracing subscriber with an env filter. `RUST_LOG` selects
/// levels, e.g. `info,blocktree=debug`.
pub fn init_json_logging() {
    let fmt_layer = tsfmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Cooperative shutdown signal shared between a signal handler and the serve
/// loop.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A fresh, untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn shared(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

/// Per-volume advisory lock: an exclusive, non-blocking file lock under the
/// system temp dir. Two servers can therefore never open the same volume on
/// one host.
pub struct VolumeLock {
    path: PathBuf,
    _file: fs::File,
}

impl VolumeLock {
    /// Acquire the lock for `name`, failing with
    /// [`VolumeError::AlreadyOpen`] when another process holds it.
    pub fn acquire(name: &str) -> Result<Self, VolumeError> {
        let tag: String =
            name.chars().map(|c| if c == '/' || c == ':' { '_' } else { c }).collect();
        let path = std::env::temp_dir().join(format!("stratus:{tag}:pid"));
        let mut file = fs::OpenOptions::new().create(true).truncate(false).write(true).open(&path)?;
        match file.try_lock() {
            Ok(()) => {
                file.set_len(0)?;
                write!(file, "{}", std::process::id())?;
                Ok(Self { path, _file: file })
            }
            Err(fs::TryLockError::WouldBlock) => Err(VolumeError::AlreadyOpen(name.to_string())),
            Err(fs::TryLockError::Error(e)) => Err(VolumeError::Io(e)),
        }
    }
}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        // the lock itself is released when the file closes
        let _ = fs::remove_file(&self.path);
    }
}

/// Parameters for [`init`].
#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Virtual disk length in bytes.
    pub size: u64,
    /// Block size in bytes; immutable after init.
    pub bs: u32,
}

impl InitOptions {
    /// Default block size, caller-chosen disk size.
    pub fn with_size(size: u64) -> Self {
        Self { size, bs: DEFAULT_BLOCK_SIZE }
    }
}

/// Parameters for [`open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Upload worker threads.
    pub threads: usize,
    /// Read-ahead window and reader thread count; zero disables.
    pub read_ahead: usize,
    /// Cache byte budget used to calibrate the cache limits.
    pub max_cache: u64,
    /// Advertise a different size than the config records (used after a
    /// resize that has not been picked up by the client yet).
    pub size_override: Option<u64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            threads: DEFAULT_WRITER_THREADS,
            read_ahead: DEFAULT_READ_AHEAD,
            max_cache: DEFAULT_TOTAL_CACHE,
            size_override: None,
        }
    }
}

/// Fetch and decrypt the config object; build the full codec from it.
///
/// The wrong-passphrase case is distinguished here: a magic mismatch on
/// `config` can only mean the supplied passphrase is not the volume's.
fn load_config(
    store: &dyn ObjectStore,
    name: &str,
    passphrase: &str,
) -> Result<(VolumeConfig, Codec), VolumeError> {
    let pass_key = derive_pass_key(passphrase);
    let probe = Codec::new(pass_key.clone(), None, Compressor::Plain);
    let raw = store
        .get(CONFIG_PATH)?
        .ok_or_else(|| VolumeError::NoSuchVolume(name.to_string()))?;
    let plain = match probe.decrypt(CONFIG_PATH, raw.content()) {
        Ok(plain) => plain,
        Err(CodecError::InvalidKey(_)) => return Err(VolumeError::WrongPassphrase),
        Err(e) => return Err(e.into()),
    };
    let config = VolumeConfig::from_json(&plain)?;
    let data_key = config.data_key()?;
    let compressor =
        Compressor::from_requirements(&config.requires).unwrap_or(Compressor::Plain);
    let codec = Codec::new(pass_key, Some(data_key), compressor);
    Ok((config, codec))
}

fn store_config(
    store: &dyn ObjectStore,
    codec: &Codec,
    config: &VolumeConfig,
) -> Result<(), VolumeError> {
    let ciphertext = codec.encrypt(CONFIG_PATH, &config.to_json()?)?;
    store.put(CONFIG_PATH, &ciphertext)?;
    Ok(())
}

/// Create a new volume: a fresh data key wrapped in an encrypted config
/// object. Refuses to touch a prefix that already carries a config object,
/// even one this passphrase cannot decrypt.
pub fn init(
    mut store: Box<dyn ObjectStore>,
    name: &str,
    passphrase: &str,
    opts: InitOptions,
) -> Result<(), VolumeError> {
    store.check_access()?;
    if store.get(CONFIG_PATH)?.is_some() {
        return Err(VolumeError::AlreadyExists(name.to_string()));
    }
    let data_key = DataKey::generate();
    let config = VolumeConfig::new(opts.size, opts.bs.max(1), &data_key);
    let codec = Codec::new(derive_pass_key(passphrase), Some(data_key), Compressor::Deflate);
    store_config(store.as_ref(), &codec, &config)?;
    info!(volume = name, size = config.size, bs = config.bs, "volume initialized");
    Ok(())
}

/// Summary returned by [`info`].
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    /// Virtual disk length in bytes.
    pub size: u64,
    /// Block size in bytes.
    pub bs: u32,
    /// Capability tags the volume requires.
    pub requires: Vec<String>,
}

/// Read a volume's metadata without opening it.
pub fn info(
    mut store: Box<dyn ObjectStore>,
    name: &str,
    passphrase: &str,
) -> Result<VolumeInfo, VolumeError> {
    store.check_access()?;
    let (config, _) = load_config(store.as_ref(), name, passphrase)?;
    if config.is_deleted() {
        return Err(VolumeError::Deleted(name.to_string()));
    }
    Ok(VolumeInfo {
        size: config.size,
        bs: config.bs,
        requires: config.requires.iter().cloned().collect(),
    })
}

/// Re-encrypt the config object under a new passphrase. Block objects are
/// untouched; they are encrypted with the data key, which does not change.
pub fn passwd(
    mut store: Box<dyn ObjectStore>,
    name: &str,
    old_passphrase: &str,
    new_passphrase: &str,
) -> Result<(), VolumeError> {
    store.check_access()?;
    let (config, _) = load_config(store.as_ref(), name, old_passphrase)?;
    let codec = Codec::new(derive_pass_key(new_passphrase), None, Compressor::Plain);
    store_config(store.as_ref(), &codec, &config)?;
    info!(volume = name, "passphrase changed");
    Ok(())
}

/// Delete `paths` across a small worker pool, each worker on its own store
/// handle. Returns how many deletes were issued.
fn bulk_delete(
    store: &dyn ObjectStore,
    paths: Vec<String>,
    threads: usize,
) -> Result<u64, VolumeError> {
    let queue = Arc::new(Mutex::new(VecDeque::from(paths)));
    let deleted = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for _ in 0..threads.max(1) {
        let worker_store = store.try_clone()?;
        let queue = Arc::clone(&queue);
        let deleted = Arc::clone(&deleted);
        handles.push(thread::spawn(move || loop {
            let next = queue.lock().expect("delete queue poisoned").pop_front();
            let Some(path) = next else { break };
            match worker_store.delete(&path) {
                Ok(()) => {
                    deleted.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(path = %path, error = %e, "bulk delete failed; worker stopping");
                    break;
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(deleted.load(Ordering::Relaxed))
}

/// Outcome of a [`resize`].
#[derive(Debug, Clone, Copy)]
pub struct ResizeReport {
    /// The size now recorded in the config object.
    pub size: u64,
    /// Block objects removed by cleanup.
    pub deleted_objects: u64,
}

/// Change the recorded size of a volume and optionally delete block objects
/// past the new end.
///
/// Cleanup is destructive: data beyond the new size is gone for good. One
/// trailing block past the strict end is deliberately kept, as earlier
/// writers also kept it.
pub fn resize(
    mut store: Box<dyn ObjectStore>,
    name: &str,
    passphrase: &str,
    new_size: Option<u64>,
    cleanup: bool,
    threads: usize,
) -> Result<ResizeReport, VolumeError> {
    store.check_access()?;
    let (mut config, codec) = load_config(store.as_ref(), name, passphrase)?;
    if config.is_deleted() {
        return Err(VolumeError::Deleted(name.to_string()));
    }
    if let Some(size) = new_size {
        info!(volume = name, from = %size_to_hum(config.size), to = %size_to_hum(size), "resizing");
        config.size = size;
        store_config(store.as_ref(), &codec, &config)?;
    }
    let mut deleted_objects = 0;
    if cleanup {
        let last_block = config.size / u64::from(config.bs) + 1;
        let stale: Vec<String> = store
            .list(BLOCKS_PREFIX)?
            .filter(|path| {
                stratus_core::parse_block_path(path).is_some_and(|index| index > last_block)
            })
            .collect();
        deleted_objects = bulk_delete(store.as_ref(), stale, threads)?;
        info!(volume = name, deleted_objects, "resize cleanup finished");
    }
    Ok(ResizeReport { size: config.size, deleted_objects })
}

/// Destroy a volume: mark it deleted first (so a crashed delete can never be
/// mistaken for a healthy volume), bulk-delete every block object, and
/// remove the config object last.
pub fn delete(
    mut store: Box<dyn ObjectStore>,
    name: &str,
    passphrase: &str,
    threads: usize,
) -> Result<u64, VolumeError> {
    store.check_access()?;
    let (mut config, codec) = load_config(store.as_ref(), name, passphrase)?;
    config.deleted = Some(true);
    store_config(store.as_ref(), &codec, &config)?;
    let blocks: Vec<String> = store.list(BLOCKS_PREFIX)?.collect();
    let workers = if threads == 0 { DEFAULT_DELETE_THREADS } else { threads };
    let deleted = bulk_delete(store.as_ref(), blocks, workers)?;
    store.delete(CONFIG_PATH)?;
    info!(volume = name, deleted, "volume deleted");
    Ok(deleted)
}

/// An open volume: loaded config, running block tree, held advisory lock.
pub struct Volume {
    name: String,
    config: VolumeConfig,
    tree: Arc<BlockTree>,
    size: u64,
    max_cache: u64,
    _lock: VolumeLock,
}

/// Open a volume for serving.
///
/// Acquires the per-volume lock, validates access and the passphrase, checks
/// capabilities and the deletion marker, then starts the worker pools with a
/// cache calibrated to `opts.max_cache`.
pub fn open(
    mut store: Box<dyn ObjectStore>,
    name: &str,
    passphrase: &str,
    opts: OpenOptions,
) -> Result<Volume, VolumeError> {
    let lock = VolumeLock::acquire(name)?;
    store.check_access()?;
    let (config, codec) = load_config(store.as_ref(), name, passphrase)?;
    let unsupported = config.unsupported_requirements();
    if !unsupported.is_empty() {
        return Err(VolumeError::Unsupported(unsupported));
    }
    if config.is_deleted() {
        return Err(VolumeError::Deleted(name.to_string()));
    }
    let tree = BlockTree::new(
        codec,
        store,
        TreeOptions { writer_threads: opts.threads, read_ahead: opts.read_ahead },
    );
    tree.calibrate_cache(opts.max_cache, config.bs);
    tree.start()?;
    let size = opts.size_override.unwrap_or(config.size);
    info!(volume = name, size, bs = config.bs, "volume open");
    Ok(Volume {
        name: name.to_string(),
        config,
        tree: Arc::new(tree),
        size,
        max_cache: opts.max_cache,
        _lock: lock,
    })
}

impl Volume {
    /// The size advertised to clients.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The volume block size.
    pub fn block_size(&self) -> u32 {
        self.config.bs
    }

    /// The loaded volume metadata.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// A byte-range mapper over this volume's tree.
    pub fn mapper(&self) -> BlockMapper {
        BlockMapper::new(Arc::clone(&self.tree), self.config.bs)
    }

    /// Barrier over the dirty queue.
    pub fn flush(&self) {
        self.tree.flush();
    }

    /// Drain pending writes and join all workers.
    pub fn close(&self) {
        self.tree.close();
    }

    /// Block-layer statistics snapshot.
    pub fn tree_stats(&self) -> TreeStats {
        self.tree.stats()
    }

    /// Bind an NBD endpoint for this volume.
    pub fn server<A: ToSocketAddrs>(&self, addr: A) -> Result<VolumeServer<'_>, VolumeError> {
        let server = NbdServer::bind(addr, self.size)?;
        let device = MapperDevice { mapper: self.mapper() };
        Ok(VolumeServer { volume: self, server, device })
    }
}

/// Adapts the byte-range mapper to the NBD device trait, converting data
/// errors to `EIO` without dropping the session.
struct MapperDevice {
    mapper: BlockMapper,
}

impl BlockDevice for MapperDevice {
    fn read(&mut self, offset: u64, length: usize) -> Result<Vec<u8>, Errno> {
        self.mapper.read(offset, length).map_err(|e| {
            warn!(offset, length, error = %e, "read failed");
            Errno::EIO
        })
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), Errno> {
        self.mapper.write(offset, data).map_err(|e| {
            warn!(offset, length = data.len(), error = %e, "write failed");
            Errno::EIO
        })
    }

    fn flush(&mut self) -> Result<(), Errno> {
        self.mapper.flush();
        Ok(())
    }

    fn trim(&mut self, offset: u64, length: u64) -> Result<(), Errno> {
        self.mapper.trim(offset, length).map_err(|e| {
            warn!(offset, length, error = %e, "trim failed");
            Errno::EIO
        })
    }
}

/// A bound NBD endpoint over an open volume.
pub struct VolumeServer<'v> {
    volume: &'v Volume,
    server: NbdServer,
    device: MapperDevice,
}

impl VolumeServer<'_> {
    /// Address the endpoint bound to (useful with port 0).
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, VolumeError> {
        Ok(self.server.local_addr()?)
    }

    /// Wire an external interrupt flag into the request loop.
    #[must_use]
    pub fn with_interrupt(mut self, flag: &ShutdownFlag) -> Self {
        self.server = self.server.with_interrupt(flag.shared());
        self
    }

    /// Per-command NBD counters.
    pub fn nbd_stats(&self) -> NbdStats {
        self.server.stats()
    }

    /// Combined statistics snapshot for reporting.
    pub fn stats(&self) -> VolumeStats {
        VolumeStats {
            nbd: self.server.stats(),
            tree: self.volume.tree_stats(),
            bs: self.volume.config.bs,
            max_cache: self.volume.max_cache,
        }
    }

    /// Accept and service exactly one client session, then commit the cache.
    /// The volume stays open for another session.
    pub fn serve_session(&mut self) -> Result<SessionEnd, VolumeError> {
        let result = self.server.serve_one(&mut self.device);
        match result {
            Ok(SessionEnd::Disconnected) => {
                info!(volume = %self.volume.name, "client disconnected; committing cache");
                self.volume.tree.flush();
                Ok(SessionEnd::Disconnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Serve clients until interrupted: one session at a time, committing
    /// the cache after each disconnect and re-accepting. On interrupt the
    /// cache is committed, workers are joined and the final NBD counters are
    /// returned.
    pub fn serve(&mut self) -> Result<NbdStats, VolumeError> {
        loop {
            match self.server.serve_one(&mut self.device) {
                Ok(SessionEnd::Disconnected) => {
                    info!(volume = %self.volume.name, "client disconnected; committing cache");
                    self.volume.tree.flush();
                }
                Err(NbdError::ClientClosed) => {
                    warn!(volume = %self.volume.name, "client vanished; committing cache");
                    self.volume.tree.flush();
                }
                Err(NbdError::Interrupted) => {
                    info!(volume = %self.volume.name, "interrupted; committing cache before closing");
                    break;
                }
                Err(e) => {
                    self.volume.tree.close();
                    return Err(e.into());
                }
            }
        }
        self.volume.tree.flush();
        self.volume.tree.close();
        Ok(self.server.stats())
    }
}

/// Combined NBD + block-layer statistics, rendered as the key-padded table
/// the stat reporter historically emitted.
#[derive(Debug, Clone, Copy)]
pub struct VolumeStats {
    /// Per-command NBD counters.
    pub nbd: NbdStats,
    /// Transfer and cache counters.
    pub tree: TreeStats,
    /// Volume block size.
    pub bs: u32,
    /// Configured cache byte budget.
    pub max_cache: u64,
}

impl fmt::Display for VolumeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bs = u64::from(self.bs);
        let rows = [
            ("cache-dirty", size_to_hum(self.tree.queue_entries as u64 * bs)),
            ("cache-limit", size_to_hum(self.max_cache)),
            ("cache-used", size_to_hum(self.tree.cache_entries as u64 * bs)),
            ("deleted-reqs", self.tree.deleted_count.to_string()),
            ("nbd-flushes", self.nbd.flushes.to_string()),
            ("nbd-reads", self.nbd.reads.to_string()),
            ("nbd-trims", self.nbd.trims.to_string()),
            ("nbd-writes", self.nbd.writes.to_string()),
            ("recv-actual", size_to_hum(self.tree.wire_recv)),
            ("recv-data", size_to_hum(self.tree.data_recv)),
            ("recv-reqs", self.tree.recv_count.to_string()),
            ("sent-actual", size_to_hum(self.tree.wire_sent)),
            ("sent-data", size_to_hum(self.tree.data_sent)),
            ("sent-reqs", self.tree.sent_count.to_string()),
        ];
        let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in rows {
            writeln!(f, "{key:<width$}   {value}")?;
        }
        Ok(())
    }
}

/// Periodically samples combined statistics and writes the rendered table to
/// a sink, the way the historical reporter fed its status FIFO. The
/// transport is the caller's business; anything [`std::io::Write`] works.
pub struct StatsReporter {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StatsReporter {
    /// Spawn the sampler thread. `sample` is called once per `interval`; its
    /// result is rendered and written followed by a blank line.
    pub fn spawn<W, F>(interval: std::time::Duration, mut sink: W, sample: F) -> Self
    where
        W: std::io::Write + Send + 'static,
        F: Fn() -> VolumeStats + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                let stats = sample();
                if writeln!(sink, "{stats}").and_then(|()| sink.flush()).is_err() {
                    // nobody is reading anymore
                    break;
                }
                thread::sleep(interval);
            }
        });
        Self { stop, handle: Some(handle) }
    }

    /// Stop the sampler and join its thread.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
