use crate::arena::{Arena, ArenaBlock, ArenaUsage};
use crate::backend::{MemoryBackend, StorageBackend};
use crate::config::EngineConfig;
use crate::error::{KvError, Result};
use crate::ops::{self, AsyncContext, Completion, Notify, MAX_VALUE_SIZE};
use crate::pool::{PoolStatus, ShutdownPolicy, Task, WorkerPool};
use crate::stats::{LatencyPercentiles, LatencyTracker, OpKind, StatsAggregator, StatsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Closing,
    Closed,
}

struct Handles<B: StorageBackend> {
    device: B::Device,
    keyspace: B::Keyspace,
}

struct Lifecycle<B: StorageBackend> {
    phase: Phase,
    handles: Option<Handles<B>>,
}

/// State reachable from both caller threads and pool workers.
struct Shared<B: StorageBackend> {
    backend: B,
    lifecycle: RwLock<Lifecycle<B>>,
    stats: StatsAggregator,
    latency: LatencyTracker,
    enable_stats: bool,
    next_op_id: AtomicU64,
}

impl<B: StorageBackend> Shared<B> {
    fn read_lifecycle(&self) -> RwLockReadGuard<'_, Lifecycle<B>> {
        self.lifecycle.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_lifecycle(&self) -> RwLockWriteGuard<'_, Lifecycle<B>> {
        self.lifecycle.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs `f` against the open keyspace while holding the lifecycle read
    /// guard. Queued work still drains while the engine is closing.
    fn with_keyspace<T>(
        &self,
        allow_closing: bool,
        f: impl FnOnce(&B::Keyspace) -> Result<T>,
    ) -> Result<T> {
        let lifecycle = self.read_lifecycle();
        match (lifecycle.phase, lifecycle.handles.as_ref()) {
            (Phase::Running, Some(handles)) => f(&handles.keyspace),
            (Phase::Closing, Some(handles)) if allow_closing => f(&handles.keyspace),
            _ => Err(KvError::NotInitialized),
        }
    }

    fn timed<T>(&self, operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.enable_stats {
            return f();
        }
        let start = Instant::now();
        let result = f();
        self.latency.record(operation, start.elapsed());
        result
    }

    fn record(&self, kind: OpKind, success: bool, bytes: usize) {
        if self.enable_stats {
            self.stats.record(kind, success, bytes);
        }
    }

    fn put(&self, keyspace: &B::Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
        let result = self.timed("store", || {
            self.backend
                .put(keyspace, key, value)
                .map_err(KvError::from)
        });
        self.record(OpKind::Write, result.is_ok(), value.len());
        result
    }

    fn get(&self, keyspace: &B::Keyspace, key: &[u8]) -> Result<Vec<u8>> {
        let result = self.timed("retrieve", || {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(MAX_VALUE_SIZE).map_err(|_| {
                KvError::NoMemory(format!("cannot allocate {} byte read buffer", MAX_VALUE_SIZE))
            })?;
            buffer.resize(MAX_VALUE_SIZE, 0);

            let len = self.backend.get(keyspace, key, &mut buffer)?;
            if len > buffer.len() {
                return Err(KvError::ValueTooLarge {
                    size: len,
                    limit: buffer.len(),
                });
            }
            buffer.truncate(len);
            buffer.shrink_to_fit();
            Ok(buffer)
        });
        let bytes = result.as_ref().map(Vec::len).unwrap_or(0);
        self.record(OpKind::Read, result.is_ok(), bytes);
        result
    }

    fn remove(&self, keyspace: &B::Keyspace, key: &[u8]) -> Result<()> {
        let result = self.timed("delete", || {
            self.backend.delete(keyspace, key).map_err(KvError::from)
        });
        self.record(OpKind::Delete, result.is_ok(), 0);
        result
    }

    // Latency only; existence checks are not counted as operations.
    fn contains(&self, keyspace: &B::Keyspace, key: &[u8]) -> Result<bool> {
        self.timed("exists", || {
            self.backend.exists(keyspace, key).map_err(KvError::from)
        })
    }
}

/// Key-value engine over a storage backend.
///
/// The `Engine` owns one scratch arena, one worker pool and one set of
/// statistics, plus the device and keyspace handles it opened on the
/// backend. Instances share nothing with each other.
///
/// # Architecture
///
/// - **Synchronous calls** validate their arguments and block the calling
///   thread on the backend
/// - **Async calls** validate on the caller's thread, copy key and value into
///   the arena, and queue a task; the outcome arrives through a notification
///   that fires exactly once on a worker thread
/// - **Shutdown** stops new work, drains (or discards) queued tasks, then
///   closes the keyspace and the device
///
/// # Example
///
/// ```
/// use nvmekv::{Engine, EngineConfig};
///
/// # fn main() -> nvmekv::Result<()> {
/// let engine = Engine::init(EngineConfig::new("/dev/kvemul"))?;
///
/// engine.store(b"user:1", b"Alice")?;
/// assert_eq!(engine.retrieve(b"user:1")?, b"Alice");
///
/// let pending = engine.store_deferred(b"user:2", b"Bob")?;
/// pending.wait()?;
/// assert!(engine.exists(b"user:2")?);
///
/// engine.cleanup();
/// # Ok(())
/// # }
/// ```
pub struct Engine<B: StorageBackend = MemoryBackend> {
    config: EngineConfig,
    shared: Arc<Shared<B>>,
    arena: Arc<Arena>,
    pool: Option<WorkerPool>,
}

impl Engine<MemoryBackend> {
    /// Starts an engine on the in-process device emulator.
    ///
    /// When `config.backend_config` is set, emulator settings are loaded
    /// from that JSON file first.
    pub fn init(config: EngineConfig) -> Result<Self> {
        let backend = match &config.backend_config {
            Some(path) => MemoryBackend::from_config_file(path)?,
            None => MemoryBackend::new(),
        };
        Self::with_backend(config, backend)
    }
}

impl<B: StorageBackend> Engine<B> {
    /// Starts an engine on the given backend.
    ///
    /// Initialization is all-or-nothing: on failure every resource acquired
    /// so far (device, keyspace, arena, worker threads) is released before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// - `Config` if the configuration does not validate
    /// - `DeviceOpen` if the device or the keyspace cannot be opened
    /// - `NoMemory` if the arena or a worker thread cannot be obtained
    pub fn with_backend(config: EngineConfig, backend: B) -> Result<Self> {
        config.validate()?;

        // Open device
        let device = backend.open_device(&config.device_path).map_err(|status| {
            tracing::error!("Cannot open device {}: {}", config.device_path, status);
            KvError::DeviceOpen(format!("{}: {}", config.device_path, status))
        })?;

        // Open or create keyspace
        let keyspace = match backend.open_or_create_keyspace(&device, &config.keyspace_name) {
            Ok(keyspace) => keyspace,
            Err(status) => {
                tracing::error!("Cannot open keyspace {}: {}", config.keyspace_name, status);
                unwind(&backend, &device, None);
                return Err(KvError::DeviceOpen(format!(
                    "keyspace {}: {}",
                    config.keyspace_name, status
                )));
            }
        };

        // Reserve arena
        let arena = match Arena::new(config.effective_arena_capacity()) {
            Ok(arena) => Arc::new(arena),
            Err(e) => {
                unwind(&backend, &device, Some(&keyspace));
                return Err(e);
            }
        };

        // Start workers
        let pool = if config.async_enabled() {
            match WorkerPool::new(config.worker_threads as usize) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    unwind(&backend, &device, Some(&keyspace));
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!(
            "Engine started on {} (keyspace {}, {} workers, {} byte arena)",
            config.device_path,
            config.keyspace_name,
            config.worker_threads,
            arena.capacity()
        );

        let shared = Arc::new(Shared {
            backend,
            lifecycle: RwLock::new(Lifecycle {
                phase: Phase::Running,
                handles: Some(Handles { device, keyspace }),
            }),
            stats: StatsAggregator::new(),
            latency: LatencyTracker::new(),
            enable_stats: config.enable_stats,
            next_op_id: AtomicU64::new(1),
        });

        Ok(Self {
            config,
            shared,
            arena,
            pool,
        })
    }

    /// Stores a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// - `InvalidParam` if the key is not 4-255 bytes long
    /// - `ValueTooLarge` if the value exceeds 2MB
    /// - `NotInitialized` after shutdown
    /// - Any mapped backend error
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<()> {
        ops::validate_key(key)?;
        ops::validate_value(value)?;
        self.shared
            .with_keyspace(false, |keyspace| self.shared.put(keyspace, key, value))
    }

    /// Returns an owned copy of the value stored under `key`.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if the key is absent
    /// - `ValueTooLarge` if the stored value does not fit the 2MB read buffer
    pub fn retrieve(&self, key: &[u8]) -> Result<Vec<u8>> {
        ops::validate_key(key)?;
        self.shared
            .with_keyspace(false, |keyspace| self.shared.get(keyspace, key))
    }

    /// Removes `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        ops::validate_key(key)?;
        self.shared
            .with_keyspace(false, |keyspace| self.shared.remove(keyspace, key))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        ops::validate_key(key)?;
        self.shared
            .with_keyspace(false, |keyspace| self.shared.contains(keyspace, key))
    }

    /// Queues a store and returns its operation id.
    ///
    /// `notify` runs exactly once on a worker thread, after the backend call
    /// returns. Validation failures are returned here and `notify` is never
    /// called for them.
    pub fn store_async<F>(&self, key: &[u8], value: &[u8], notify: F) -> Result<u64>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.submit_store(key, value, Box::new(notify))
    }

    /// Queues a retrieve; `notify` receives the value.
    pub fn retrieve_async<F>(&self, key: &[u8], notify: F) -> Result<u64>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.submit_retrieve(key, Box::new(notify))
    }

    pub fn delete_async<F>(&self, key: &[u8], notify: F) -> Result<u64>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.submit_delete(key, Box::new(notify))
    }

    /// Queues a store and returns a future of its outcome.
    pub fn store_deferred(&self, key: &[u8], value: &[u8]) -> Result<Completion<()>> {
        let (notify, rx) = Completion::pair();
        let id = self.submit_store(key, value, notify)?;
        Ok(Completion::new(id, rx))
    }

    pub fn retrieve_deferred(&self, key: &[u8]) -> Result<Completion<Vec<u8>>> {
        let (notify, rx) = Completion::pair();
        let id = self.submit_retrieve(key, notify)?;
        Ok(Completion::new(id, rx))
    }

    pub fn delete_deferred(&self, key: &[u8]) -> Result<Completion<()>> {
        let (notify, rx) = Completion::pair();
        let id = self.submit_delete(key, notify)?;
        Ok(Completion::new(id, rx))
    }

    fn submit_store(&self, key: &[u8], value: &[u8], notify: Notify<()>) -> Result<u64> {
        ops::validate_key(key)?;
        ops::validate_value(value)?;
        self.submit(OpKind::Write, key, Some(value), notify, |shared, keyspace, key, value| {
            shared.put(keyspace, key, value.unwrap_or_default())
        })
    }

    fn submit_retrieve(&self, key: &[u8], notify: Notify<Vec<u8>>) -> Result<u64> {
        ops::validate_key(key)?;
        self.submit(OpKind::Read, key, None, notify, |shared, keyspace, key, _| {
            shared.get(keyspace, key)
        })
    }

    fn submit_delete(&self, key: &[u8], notify: Notify<()>) -> Result<u64> {
        ops::validate_key(key)?;
        self.submit(OpKind::Delete, key, None, notify, |shared, keyspace, key, _| {
            shared.remove(keyspace, key)
        })
    }

    fn submit<T, Op>(
        &self,
        kind: OpKind,
        key: &[u8],
        value: Option<&[u8]>,
        notify: Notify<T>,
        op: Op,
    ) -> Result<u64>
    where
        T: Send + 'static,
        Op: FnOnce(&Shared<B>, &B::Keyspace, &[u8], Option<&[u8]>) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.as_ref().ok_or_else(|| {
            tracing::debug!("Async {} rejected: no worker threads configured", kind);
            KvError::NotInitialized
        })?;

        // Held until the task is queued so shutdown cannot close the queue
        // in between.
        let lifecycle = self.shared.read_lifecycle();
        if lifecycle.phase != Phase::Running {
            return Err(KvError::NotInitialized);
        }

        let (key_block, value_block) = self.stage(key, value)?;
        let id = self.shared.next_op_id.fetch_add(1, Ordering::Relaxed);
        let mut ctx = AsyncContext::new(id, kind, key_block, value_block, notify);

        let shared = Arc::clone(&self.shared);
        let task = Task::new(kind.as_str(), move || {
            ctx.begin();
            let result = shared.with_keyspace(true, |keyspace| {
                op(&shared, keyspace, ctx.key(), ctx.value())
            });
            ctx.complete(result);
        });

        pool.submit(task).map_err(|_| KvError::NotInitialized)?;
        drop(lifecycle);

        Ok(id)
    }

    /// Copies key and value into the arena, reclaiming an idle epoch once
    /// if the arena is full.
    fn stage(&self, key: &[u8], value: Option<&[u8]>) -> Result<(ArenaBlock, Option<ArenaBlock>)> {
        let copy = || -> Result<(ArenaBlock, Option<ArenaBlock>)> {
            let key_block = self.arena.alloc_copy(key)?;
            let value_block = value.map(|v| self.arena.alloc_copy(v)).transpose()?;
            Ok((key_block, value_block))
        };

        match copy() {
            Err(KvError::NoMemory(_)) if self.arena.reclaim_if_idle() => {
                tracing::debug!("Arena full, retrying in generation {}", self.arena.generation());
                copy()
            }
            result => result,
        }
    }

    /// Returns a copy of the operation counters.
    pub fn get_stats(&self) -> StatsSnapshot {
        let mut snapshot = self.shared.stats.snapshot();
        snapshot.avg_latency_us = self.shared.latency.mean_micros();
        snapshot
    }

    /// Zeroes counters and latency histograms.
    ///
    /// Excludes in-flight operations for the duration of the reset.
    pub fn reset_stats(&self) {
        let _guard = self.shared.write_lifecycle();
        self.shared.stats.reset();
        self.shared.latency.reset();
    }

    /// Latency percentiles per operation name (`store`, `retrieve`,
    /// `delete`, `exists`).
    pub fn latency_report(&self) -> HashMap<&'static str, LatencyPercentiles> {
        self.shared.latency.report()
    }

    /// Stops the engine.
    ///
    /// New operations are rejected with `NotInitialized` from the moment
    /// this is called. Queued async operations are run or dropped according
    /// to `policy`; dropped ones never notify, and their [`Completion`]s
    /// resolve to `NotInitialized`. The keyspace and device are closed last.
    /// Only the first call does anything.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParam` when called from a completion callback. A
    /// worker cannot join itself, so the drain could not be honored; the
    /// engine is left running.
    pub fn shutdown(&self, policy: ShutdownPolicy) -> Result<()> {
        if self.pool.as_ref().is_some_and(WorkerPool::is_worker_thread) {
            return Err(KvError::InvalidParam(
                "engine shutdown from a completion callback".to_string(),
            ));
        }

        {
            let mut lifecycle = self.shared.write_lifecycle();
            if lifecycle.phase != Phase::Running {
                return Ok(());
            }
            lifecycle.phase = Phase::Closing;
        }

        tracing::info!("Shutting down engine on {}", self.config.device_path);

        if let Some(pool) = &self.pool {
            let discarded = pool.shutdown(policy);
            if discarded > 0 {
                tracing::warn!("{} async operations abandoned", discarded);
            }
        }

        let handles = {
            let mut lifecycle = self.shared.write_lifecycle();
            lifecycle.phase = Phase::Closed;
            lifecycle.handles.take()
        };

        if let Some(handles) = handles {
            unwind(&self.shared.backend, &handles.device, Some(&handles.keyspace));
        }

        let stats = self.shared.stats.snapshot();
        tracing::info!(
            "Engine stopped: {} ops, {} failed",
            stats.total_ops,
            stats.failed_ops
        );
        Ok(())
    }

    /// Drains queued work and tears the engine down.
    pub fn cleanup(self) {
        if let Err(e) = self.shutdown(ShutdownPolicy::Drain) {
            tracing::error!("Engine cleanup failed: {}", e);
        }
    }

    /// Waits for the pool to go idle, then starts a fresh arena epoch.
    ///
    /// # Errors
    ///
    /// Returns `NoMemory` if arena blocks are still held, which can only
    /// happen while operations are being submitted concurrently.
    pub fn reset_arena(&mut self) -> Result<()> {
        if let Some(pool) = &self.pool {
            pool.wait_idle();
        }

        if let Some(arena) = Arc::get_mut(&mut self.arena) {
            arena.reset();
            return Ok(());
        }

        if self.arena.reclaim_if_idle() {
            Ok(())
        } else {
            Err(KvError::NoMemory(
                "arena blocks still outstanding".to_string(),
            ))
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.read_lifecycle().phase == Phase::Running
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Worker pool status, or `None` when async support is disabled.
    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.as_ref().map(WorkerPool::status)
    }

    pub fn arena_usage(&self) -> ArenaUsage {
        self.arena.usage()
    }
}

impl<B: StorageBackend> Drop for Engine<B> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(ShutdownPolicy::Drain) {
            tracing::error!("Engine dropped without shutdown: {}", e);
        }
    }
}

/// Closes whatever `with_backend` or `shutdown` got hold of, keyspace first.
fn unwind<B: StorageBackend>(backend: &B, device: &B::Device, keyspace: Option<&B::Keyspace>) {
    if let Some(keyspace) = keyspace {
        if let Err(status) = backend.close_keyspace(keyspace) {
            tracing::warn!("Failed to close keyspace: {}", status);
        }
    }
    if let Err(status) = backend.close_device(device) {
        tracing::warn!("Failed to close device: {}", status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, EmulatorConfig};
    use crate::error::ResultCode;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_engine(workers: u32) -> Engine {
        let config = EngineConfig::new("/dev/kvemul")
            .with_worker_threads(workers)
            .with_arena_capacity(4 * 1024 * 1024);
        Engine::init(config).unwrap()
    }

    fn shared_backend(config: EmulatorConfig) -> Arc<MemoryBackend> {
        Arc::new(MemoryBackend::with_config(config))
    }

    #[test]
    fn test_store_retrieve_delete_round_trip() {
        let engine = create_test_engine(2);

        engine.store(b"user:1", b"Alice").unwrap();
        assert_eq!(engine.retrieve(b"user:1").unwrap(), b"Alice");
        assert!(engine.exists(b"user:1").unwrap());

        engine.delete(b"user:1").unwrap();
        assert!(!engine.exists(b"user:1").unwrap());
        assert!(matches!(
            engine.retrieve(b"user:1"),
            Err(KvError::KeyNotFound)
        ));
    }

    #[test]
    fn test_update_existing_key() {
        let engine = create_test_engine(0);

        engine.store(b"key1", b"value1").unwrap();
        engine.store(b"key1", b"value2").unwrap();
        assert_eq!(engine.retrieve(b"key1").unwrap(), b"value2");
    }

    #[test]
    fn test_key_length_boundaries() {
        let engine = create_test_engine(0);

        assert!(matches!(
            engine.store(b"abc", b"v"),
            Err(KvError::InvalidParam(_))
        ));
        assert!(engine.store(&[b'k'; 4], b"v").is_ok());
        assert!(engine.store(&[b'k'; 255], b"v").is_ok());
        assert!(matches!(
            engine.store(&[b'k'; 256], b"v"),
            Err(KvError::InvalidParam(_))
        ));

        for result in [
            engine.retrieve(b"abc").map(|_| ()),
            engine.delete(b"abc"),
            engine.exists(b"abc").map(|_| ()),
        ] {
            assert_eq!(crate::error::result_code(&result), ResultCode::InvalidParam);
        }
    }

    #[test]
    fn test_value_size_boundaries() {
        let engine = create_test_engine(0);

        let max = vec![0xABu8; MAX_VALUE_SIZE];
        engine.store(b"big-key", &max).unwrap();
        assert_eq!(engine.retrieve(b"big-key").unwrap(), max);

        let too_big = vec![0u8; MAX_VALUE_SIZE + 1];
        assert!(matches!(
            engine.store(b"big-key", &too_big),
            Err(KvError::ValueTooLarge { .. })
        ));
    }

    #[test]
    fn test_empty_value() {
        let engine = create_test_engine(1);

        engine.store(b"empty", b"").unwrap();
        assert_eq!(engine.retrieve(b"empty").unwrap(), b"");

        engine.store_deferred(b"empty2", b"").unwrap().wait().unwrap();
        assert!(engine.exists(b"empty2").unwrap());
    }

    #[test]
    fn test_stats_counting() {
        let engine = create_test_engine(0);

        engine.store(b"key1", b"12345").unwrap();
        engine.retrieve(b"key1").unwrap();
        assert!(engine.retrieve(b"missing").is_err());
        engine.delete(b"key1").unwrap();
        engine.exists(b"key1").unwrap();
        // Rejected before reaching the backend
        assert!(engine.store(b"k", b"v").is_err());

        let stats = engine.get_stats();
        assert_eq!(stats.total_ops, 4);
        assert_eq!(stats.write_ops, 1);
        assert_eq!(stats.read_ops, 2);
        assert_eq!(stats.delete_ops, 1);
        assert_eq!(stats.failed_ops, 1);
        assert_eq!(stats.bytes_written, 5);
        assert_eq!(stats.bytes_read, 5);

        let report = engine.latency_report();
        assert_eq!(report["retrieve"].count, 2);
        assert_eq!(report["exists"].count, 1);

        engine.reset_stats();
        assert_eq!(engine.get_stats(), StatsSnapshot::default());
        assert!(engine.latency_report().is_empty());
    }

    #[test]
    fn test_stats_disabled() {
        let config = EngineConfig::new("/dev/kvemul").with_stats(false);
        let engine = Engine::init(config).unwrap();

        engine.store(b"key1", b"value").unwrap();
        engine.retrieve(b"key1").unwrap();

        assert_eq!(engine.get_stats(), StatsSnapshot::default());
        assert!(engine.latency_report().is_empty());
    }

    #[test]
    fn test_async_stores_all_visible() {
        let engine = create_test_engine(4);
        let (tx, rx) = mpsc::channel();

        let mut ids = Vec::new();
        for i in 0..10 {
            let tx = tx.clone();
            let key = format!("async-key-{}", i);
            let id = engine
                .store_async(key.as_bytes(), b"payload", move |result| {
                    tx.send(result).unwrap();
                })
                .unwrap();
            ids.push(id);
        }

        for _ in 0..10 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        }

        for i in 0..10 {
            let key = format!("async-key-{}", i);
            assert!(engine.exists(key.as_bytes()).unwrap());
        }

        // Ids are unique and increasing
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        let stats = engine.get_stats();
        assert_eq!(stats.write_ops, 10);
        assert_eq!(stats.bytes_written, 70);
    }

    #[test]
    fn test_async_notify_runs_on_worker() {
        let engine = create_test_engine(2);
        let (tx, rx) = mpsc::channel();

        engine
            .retrieve_async(b"missing", move |result| {
                let name = thread::current().name().map(str::to_string);
                tx.send((result.is_err(), name)).unwrap();
            })
            .unwrap();

        let (failed, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(failed);
        assert!(name.unwrap().starts_with("nvmekv-worker-"));
    }

    #[test]
    fn test_async_retrieve_and_delete() {
        let engine = create_test_engine(2);

        engine.store(b"key1", b"value1").unwrap();
        assert_eq!(
            engine.retrieve_deferred(b"key1").unwrap().wait().unwrap(),
            b"value1"
        );

        engine.delete_deferred(b"key1").unwrap().wait().unwrap();
        assert!(!engine.exists(b"key1").unwrap());
        assert!(matches!(
            engine.retrieve_deferred(b"key1").unwrap().wait(),
            Err(KvError::KeyNotFound)
        ));
    }

    #[test]
    fn test_async_validation_is_synchronous() {
        let engine = create_test_engine(2);
        let called = Arc::new(AtomicU64::new(0));

        let flag = Arc::clone(&called);
        let err = engine
            .store_async(b"abc", b"v", move |_| {
                flag.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap_err();
        assert!(err.is_validation());

        let too_big = vec![0u8; MAX_VALUE_SIZE + 1];
        assert!(matches!(
            engine.store_deferred(b"key1", &too_big),
            Err(KvError::ValueTooLarge { .. })
        ));

        engine.pool.as_ref().unwrap().wait_idle();
        assert_eq!(called.load(Ordering::SeqCst), 0);
        assert_eq!(engine.pool_status().unwrap().executed, 0);
        assert_eq!(engine.arena_usage().outstanding, 0);
    }

    #[test]
    fn test_zero_workers_rejects_async() {
        let engine = create_test_engine(0);

        assert!(engine.pool_status().is_none());
        assert!(matches!(
            engine.store_async(b"key1", b"v", |_| {}),
            Err(KvError::NotInitialized)
        ));
        engine.store(b"key1", b"v").unwrap();
    }

    #[tokio::test]
    async fn test_deferred_operations_await() {
        let engine = create_test_engine(2);

        let pending: Vec<_> = (0..5)
            .map(|i| {
                engine
                    .store_deferred(format!("deferred-{}", i).as_bytes(), b"value")
                    .unwrap()
            })
            .collect();
        for completion in pending {
            completion.await.unwrap();
        }

        let value = engine.retrieve_deferred(b"deferred-3").unwrap().await.unwrap();
        assert_eq!(value, b"value");
    }

    #[test]
    fn test_operations_after_shutdown() {
        let backend = shared_backend(EmulatorConfig::default());
        let engine =
            Engine::with_backend(EngineConfig::new("/dev/kvemul"), Arc::clone(&backend)).unwrap();
        engine.store(b"key1", b"value").unwrap();
        assert_eq!(backend.open_device_count(), 1);

        engine.shutdown(ShutdownPolicy::Drain).unwrap();
        assert!(!engine.is_running());
        assert_eq!(backend.open_device_count(), 0);
        assert_eq!(backend.open_keyspace_count(), 0);

        assert!(matches!(engine.store(b"key1", b"v"), Err(KvError::NotInitialized)));
        assert!(matches!(engine.retrieve(b"key1"), Err(KvError::NotInitialized)));
        assert!(matches!(engine.exists(b"key1"), Err(KvError::NotInitialized)));
        assert!(matches!(
            engine.delete_async(b"key1", |_| {}),
            Err(KvError::NotInitialized)
        ));

        // Second call is a no-op
        engine.shutdown(ShutdownPolicy::Drain).unwrap();
        assert_eq!(backend.open_device_count(), 0);
    }

    #[test]
    fn test_shutdown_drains_queued_operations() {
        let backend = shared_backend(EmulatorConfig::default());
        let config = EngineConfig::new("/dev/kvemul").with_worker_threads(2);
        let engine = Engine::with_backend(config, Arc::clone(&backend)).unwrap();

        let pending: Vec<_> = (0..50)
            .map(|i| {
                engine
                    .store_deferred(format!("drain-{:03}", i).as_bytes(), b"v")
                    .unwrap()
            })
            .collect();

        engine.cleanup();

        for completion in pending {
            completion.wait().unwrap();
        }

        let device = backend.open_device("/dev/kvemul").unwrap();
        let keyspace = backend.open_keyspace(&device, "nvme_kv_engine").unwrap();
        assert_eq!(keyspace.len(), 50);
    }

    #[test]
    fn test_shutdown_discard_abandons_queued_operations() {
        let engine = create_test_engine(1);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        engine
            .store_async(b"blocker", b"v", move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let pending: Vec<_> = (0..5)
            .map(|i| {
                engine
                    .store_deferred(format!("queued-{}", i).as_bytes(), b"v")
                    .unwrap()
            })
            .collect();

        // The worker is blocked, so only the discard can empty the queue
        let engine_ref = &engine;
        thread::scope(|s| {
            s.spawn(move || {
                while engine_ref.pool_status().is_some_and(|p| p.queued > 0) {
                    thread::yield_now();
                }
                release_tx.send(()).unwrap();
            });
            engine.shutdown(ShutdownPolicy::Discard).unwrap();
        });

        for completion in pending {
            assert!(matches!(completion.wait(), Err(KvError::NotInitialized)));
        }
        assert_eq!(engine.get_stats().write_ops, 1);
    }

    /// Delegates to the emulator but claims every value is longer than it is.
    struct OverreportingBackend(MemoryBackend);

    impl StorageBackend for OverreportingBackend {
        type Device = <MemoryBackend as StorageBackend>::Device;
        type Keyspace = <MemoryBackend as StorageBackend>::Keyspace;

        fn open_device(&self, path: &str) -> BackendResult<Self::Device> {
            self.0.open_device(path)
        }

        fn close_device(&self, device: &Self::Device) -> BackendResult<()> {
            self.0.close_device(device)
        }

        fn open_keyspace(&self, device: &Self::Device, name: &str) -> BackendResult<Self::Keyspace> {
            self.0.open_keyspace(device, name)
        }

        fn create_keyspace(&self, device: &Self::Device, name: &str) -> BackendResult<()> {
            self.0.create_keyspace(device, name)
        }

        fn close_keyspace(&self, keyspace: &Self::Keyspace) -> BackendResult<()> {
            self.0.close_keyspace(keyspace)
        }

        fn put(&self, keyspace: &Self::Keyspace, key: &[u8], value: &[u8]) -> BackendResult<()> {
            self.0.put(keyspace, key, value)
        }

        fn get(&self, keyspace: &Self::Keyspace, key: &[u8], buffer: &mut [u8]) -> BackendResult<usize> {
            self.0.get(keyspace, key, buffer)?;
            Ok(buffer.len() + 10)
        }

        fn delete(&self, keyspace: &Self::Keyspace, key: &[u8]) -> BackendResult<()> {
            self.0.delete(keyspace, key)
        }

        fn exists(&self, keyspace: &Self::Keyspace, key: &[u8]) -> BackendResult<bool> {
            self.0.exists(keyspace, key)
        }
    }

    #[test]
    fn test_retrieve_rejects_overreported_length() {
        let engine = Engine::with_backend(
            EngineConfig::new("/dev/kvemul").with_worker_threads(1),
            OverreportingBackend(MemoryBackend::new()),
        )
        .unwrap();
        engine.store(b"key1", b"abc").unwrap();

        assert!(matches!(
            engine.retrieve(b"key1"),
            Err(KvError::ValueTooLarge { limit, .. }) if limit == MAX_VALUE_SIZE
        ));
        assert!(matches!(
            engine.retrieve_deferred(b"key1").unwrap().wait(),
            Err(KvError::ValueTooLarge { .. })
        ));

        let stats = engine.get_stats();
        assert_eq!(stats.read_ops, 2);
        assert_eq!(stats.failed_ops, 2);
        assert_eq!(stats.bytes_read, 0);
    }

    #[test]
    fn test_shutdown_from_callback_is_rejected() {
        let engine = Arc::new(create_test_engine(1));
        let (tx, rx) = mpsc::channel();

        let inner = Arc::clone(&engine);
        engine
            .store_async(b"key1", b"value", move |_| {
                tx.send(inner.shutdown(ShutdownPolicy::Drain)).unwrap();
            })
            .unwrap();

        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(KvError::InvalidParam(_))));
        assert!(engine.is_running());
        assert_eq!(engine.retrieve(b"key1").unwrap(), b"value");

        engine.shutdown(ShutdownPolicy::Drain).unwrap();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_reset_arena_fails_while_blocks_outstanding() {
        let mut engine = create_test_engine(1);
        let held = engine.arena.alloc_copy(b"pinned").unwrap();

        assert!(matches!(engine.reset_arena(), Err(KvError::NoMemory(_))));
        drop(held);
        engine.reset_arena().unwrap();
        assert_eq!(engine.arena_usage().outstanding, 0);
    }

    #[test]
    fn test_init_fails_on_device_open() {
        let backend = shared_backend(EmulatorConfig {
            fail_open: true,
            ..EmulatorConfig::default()
        });

        let result = Engine::with_backend(EngineConfig::new("/dev/kvemul"), Arc::clone(&backend));
        assert!(matches!(result, Err(KvError::DeviceOpen(_))));
        assert_eq!(backend.open_device_count(), 0);
    }

    #[test]
    fn test_init_failure_closes_device() {
        let backend = shared_backend(EmulatorConfig {
            fail_keyspace_create: true,
            ..EmulatorConfig::default()
        });

        let result = Engine::with_backend(EngineConfig::new("/dev/kvemul"), Arc::clone(&backend));
        assert_eq!(
            crate::error::result_code(&result.map(|_| ())),
            ResultCode::DeviceOpen
        );
        assert_eq!(backend.open_device_count(), 0);
        assert_eq!(backend.open_keyspace_count(), 0);
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = EngineConfig::new("").with_worker_threads(2);
        assert!(matches!(Engine::init(config), Err(KvError::Config(_))));
    }

    #[test]
    fn test_init_with_backend_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kvssd_emul.json");
        std::fs::write(&path, r#"{"max_value_size": 64}"#).unwrap();

        let config = EngineConfig::new("/dev/kvemul").with_backend_config(&path);
        let engine = Engine::init(config).unwrap();
        assert_eq!(engine.backend().config().max_value_size, 64);

        // Device limit is below the engine limit
        assert!(matches!(
            engine.store(b"key1", &[0u8; 65]),
            Err(KvError::ValueTooLarge { size: 65, limit: 64 })
        ));
        assert_eq!(engine.get_stats().failed_ops, 1);
    }

    #[test]
    fn test_multiple_engines_are_independent() {
        let first = create_test_engine(2);
        let second = create_test_engine(2);

        first.store(b"shared-key", b"first").unwrap();
        assert!(!second.exists(b"shared-key").unwrap());

        second.store(b"shared-key", b"second").unwrap();
        assert_eq!(first.retrieve(b"shared-key").unwrap(), b"first");

        first.cleanup();
        assert_eq!(second.retrieve(b"shared-key").unwrap(), b"second");
        assert_eq!(second.get_stats().write_ops, 1);
    }

    #[test]
    fn test_concurrent_callers() {
        let engine = Arc::new(create_test_engine(4));
        let threads = 8;
        let per_thread = 100;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let engine = Arc::clone(&engine);
                thread::spawn(move || {
                    for i in 0..per_thread {
                        let key = format!("t{}-k{}", t, i);
                        engine.store(key.as_bytes(), b"value").unwrap();
                        engine
                            .store_deferred(format!("a{}-k{}", t, i).as_bytes(), b"value")
                            .unwrap()
                            .wait()
                            .unwrap();
                        assert_eq!(engine.retrieve(key.as_bytes()).unwrap(), b"value");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = engine.get_stats();
        let expected = (threads * per_thread) as u64;
        assert_eq!(stats.write_ops, 2 * expected);
        assert_eq!(stats.read_ops, expected);
        assert_eq!(
            stats.total_ops,
            stats.read_ops + stats.write_ops + stats.delete_ops
        );
        assert_eq!(stats.failed_ops, 0);
    }

    #[test]
    fn test_arena_epoch_reclaimed_when_full() {
        let config = EngineConfig::new("/dev/kvemul")
            .with_worker_threads(1)
            .with_arena_capacity(64);
        let engine = Engine::init(config).unwrap();

        // 8 byte key + 24 byte value fill half the arena each time
        for i in 0..5 {
            let key = format!("key-{:04}", i);
            engine
                .store_deferred(key.as_bytes(), &[i as u8; 24])
                .unwrap()
                .wait()
                .unwrap();
        }
        assert!(engine.arena_usage().generation >= 1);

        // Never fits, even in an empty epoch
        assert!(matches!(
            engine.store_deferred(b"key-huge", &[0u8; 100]),
            Err(KvError::NoMemory(_))
        ));
        assert_eq!(engine.arena_usage().outstanding, 0);
    }

    #[test]
    fn test_reset_arena() {
        let mut engine = create_test_engine(2);

        for i in 0..20 {
            engine
                .store_async(format!("key-{}", i).as_bytes(), b"value", |_| {})
                .unwrap();
        }

        engine.reset_arena().unwrap();
        let usage = engine.arena_usage();
        assert_eq!(usage.used, 0);
        assert_eq!(usage.outstanding, 0);
        assert_eq!(usage.generation, 1);
        assert_eq!(engine.get_stats().write_ops, 20);
    }
}
