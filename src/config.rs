use crate::error::{KvError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default arena capacity used when the configured value is 0 (16MB).
pub const DEFAULT_ARENA_CAPACITY: usize = 16 * 1024 * 1024;

/// Largest arena the engine will try to reserve (1GB).
pub const MAX_ARENA_CAPACITY: usize = 1024 * 1024 * 1024;

/// Upper bound on worker threads.
pub const MAX_WORKER_THREADS: u32 = 256;

/// Keyspace opened (or created) on the device at engine start.
pub const DEFAULT_KEYSPACE: &str = "nvme_kv_engine";

/// Configuration for the engine.
///
/// This structure contains all configurable parameters for nvmekv.
/// Use the builder pattern methods to customize settings.
///
/// # Example
///
/// ```
/// use nvmekv::EngineConfig;
///
/// let config = EngineConfig::new("/dev/kvemul")
///     .with_arena_capacity(32 * 1024 * 1024)  // 32MB
///     .with_worker_threads(8)
///     .with_queue_depth(128);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the key-value device (e.g. `/dev/nvme0n1` or `/dev/kvemul`).
    pub device_path: String,

    /// Optional backend configuration file (emulator settings).
    #[serde(default)]
    pub backend_config: Option<PathBuf>,

    /// Capacity of the scratch arena in bytes (default: 16MB).
    ///
    /// A value of 0 selects the default. Async operations copy their key
    /// and value into this arena for the lifetime of the task.
    pub arena_capacity: usize,

    /// I/O queue depth hint (default: 128).
    ///
    /// Informational: the task queue itself is unbounded.
    /// Valid range: 1 - 4096.
    pub queue_depth: u32,

    /// Number of async worker threads (default: 4).
    ///
    /// 0 disables async support; only synchronous calls are accepted.
    pub worker_threads: u32,

    /// Collect operation statistics (default: true).
    pub enable_stats: bool,

    /// Keyspace opened on the device.
    #[serde(default = "default_keyspace")]
    pub keyspace_name: String,
}

fn default_keyspace() -> String {
    DEFAULT_KEYSPACE.to_string()
}

impl EngineConfig {
    /// Creates a new configuration for the given device with default values.
    ///
    /// # Default Values
    ///
    /// - Arena capacity: 16MB
    /// - Queue depth: 128
    /// - Worker threads: 4
    /// - Stats: enabled
    /// - Keyspace: `nvme_kv_engine`
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
            backend_config: None,
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            queue_depth: 128,
            worker_threads: 4,
            enable_stats: true,
            keyspace_name: default_keyspace(),
        }
    }

    /// Validates the configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns `Config` if any parameter is invalid:
    /// - Empty device path
    /// - Arena capacity above 1GB
    /// - Queue depth < 1 or > 4096
    /// - More than 256 worker threads
    /// - Keyspace name empty or longer than 255 bytes
    pub fn validate(&self) -> Result<()> {
        if self.device_path.is_empty() {
            return Err(KvError::Config("device_path cannot be empty".to_string()));
        }

        if self.effective_arena_capacity() > MAX_ARENA_CAPACITY {
            return Err(KvError::Config(
                "arena_capacity cannot exceed 1GB".to_string(),
            ));
        }

        if self.queue_depth < 1 {
            return Err(KvError::Config(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.queue_depth > 4096 {
            return Err(KvError::Config(
                "queue_depth cannot exceed 4096".to_string(),
            ));
        }

        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(KvError::Config(format!(
                "worker_threads cannot exceed {}",
                MAX_WORKER_THREADS
            )));
        }

        if self.keyspace_name.is_empty() || self.keyspace_name.len() > 255 {
            return Err(KvError::Config(
                "keyspace_name must be 1-255 bytes".to_string(),
            ));
        }

        Ok(())
    }

    /// Arena capacity with the 0 = default rule applied.
    pub fn effective_arena_capacity(&self) -> usize {
        if self.arena_capacity == 0 {
            DEFAULT_ARENA_CAPACITY
        } else {
            self.arena_capacity
        }
    }

    /// True when the engine will start worker threads.
    pub fn async_enabled(&self) -> bool {
        self.worker_threads > 0
    }

    /// Loads a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            KvError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            KvError::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Set backend configuration file
    pub fn with_backend_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.backend_config = Some(path.into());
        self
    }

    /// Set arena capacity
    pub fn with_arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = bytes;
        self
    }

    /// Set queue depth
    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Set worker thread count
    pub fn with_worker_threads(mut self, threads: u32) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Enable or disable statistics
    pub fn with_stats(mut self, enable: bool) -> Self {
        self.enable_stats = enable;
        self
    }

    /// Set keyspace name
    pub fn with_keyspace(mut self, name: impl Into<String>) -> Self {
        self.keyspace_name = name.into();
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("/dev/kvemul")
    }
}
