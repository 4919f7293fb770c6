//! # nvmekv - Key-Value Engine over NVMe KV Devices
//!
//! nvmekv is a thin engine in front of a key-value storage device. It exposes
//! synchronous and asynchronous store/retrieve/delete/exists operations plus
//! aggregate performance counters, and leaves persistence to a pluggable
//! [`StorageBackend`].
//!
//! ## Architecture
//!
//! - **Arena**: fixed-capacity bump allocator holding the key/value copies of
//!   in-flight async operations
//! - **Worker Pool**: fixed set of threads draining a FIFO task queue
//! - **Stats**: lock-free operation counters and latency histograms
//! - **Async Operations**: validate, copy into the arena, queue, notify once
//! - **Engine**: owns all of the above plus the device and keyspace handles
//!
//! ## Example Usage
//!
//! ```
//! use nvmekv::{Engine, EngineConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Create configuration
//!     let config = EngineConfig::new("/dev/kvemul").with_worker_threads(2);
//!
//!     // Initialize engine on the built-in emulator
//!     let engine = Engine::init(config)?;
//!
//!     // Synchronous operations
//!     engine.store(b"key1", b"value1")?;
//!     assert_eq!(engine.retrieve(b"key1")?, b"value1");
//!
//!     // Asynchronous store, waited on from this thread
//!     engine.store_deferred(b"key2", b"value2")?.wait()?;
//!     assert!(engine.exists(b"key2")?);
//!
//!     // DELETE operation
//!     engine.delete(b"key1")?;
//!
//!     println!("{} operations", engine.get_stats().total_ops);
//!     engine.cleanup();
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: Engine facade and lifecycle
//! - [`ops`]: Async operation context and completions
//! - [`pool`]: Worker pool and task queue
//! - [`arena`]: Bump allocator for operation buffers
//! - [`stats`]: Operation counters and latency tracking
//! - [`backend`]: Storage backend capability and in-memory emulator
//! - [`config`]: Configuration structures
//! - [`error`]: Error types and result codes

/// Fixed-capacity bump arena
pub mod arena;

/// Storage backend capability and device emulator
pub mod backend;

/// Configuration structures and validation
pub mod config;

/// Engine facade
pub mod engine;

/// Async operation plumbing
pub mod ops;

/// Worker thread pool and task queue
pub mod pool;

/// Operation statistics and latency tracking
pub mod stats;

/// Command-line interface
pub mod cli;

/// Error types and result codes
pub mod error;

// Re-export commonly used types
pub use backend::{BackendStatus, MemoryBackend, StorageBackend};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{KvError, Result, ResultCode};
pub use ops::Completion;
pub use pool::ShutdownPolicy;
pub use stats::StatsSnapshot;
