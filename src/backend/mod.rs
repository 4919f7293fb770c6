//! Storage backend capability.
//!
//! The engine never talks to a device directly. It consumes a
//! [`StorageBackend`]: open/close a device, open or create a keyspace, and
//! store/retrieve/delete/check a key-value pair. Every call is synchronous
//! and blocking from the engine's point of view.
//!
//! Backends report failures as [`BackendStatus`] codes. [`map_status`] is the
//! one place those codes become [`KvError`]s.

pub mod memory;

pub use memory::{EmulatorConfig, MemoryBackend};

use crate::error::KvError;
use std::fmt;
use std::sync::Arc;

/// Status codes reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    /// An argument was rejected by the device.
    ParamInvalid,
    /// Device-level I/O failure.
    SysIo,
    KeyNotExist,
    KeyExists,
    /// The value is larger than the device accepts.
    ValueSize { size: usize, limit: usize },
    /// The stored value does not fit into the caller's buffer.
    BufferSmall { required: usize, available: usize },
    Timeout,
    DeviceNotOpen,
    KeyspaceNotExist,
    /// Vendor-specific code with no taxonomy counterpart.
    Other(u32),
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendStatus::ParamInvalid => write!(f, "invalid parameter"),
            BackendStatus::SysIo => write!(f, "device I/O error"),
            BackendStatus::KeyNotExist => write!(f, "key does not exist"),
            BackendStatus::KeyExists => write!(f, "key exists"),
            BackendStatus::ValueSize { size, limit } => {
                write!(f, "value size {} exceeds device limit {}", size, limit)
            }
            BackendStatus::BufferSmall { required, available } => {
                write!(f, "buffer too small: need {}, have {}", required, available)
            }
            BackendStatus::Timeout => write!(f, "timeout"),
            BackendStatus::DeviceNotOpen => write!(f, "device not open"),
            BackendStatus::KeyspaceNotExist => write!(f, "keyspace does not exist"),
            BackendStatus::Other(code) => write!(f, "backend status {:#x}", code),
        }
    }
}

/// Result of a backend call.
pub type BackendResult<T> = std::result::Result<T, BackendStatus>;

/// Maps a backend status onto the engine's error taxonomy.
///
/// Codes without a dedicated variant fall back to `Io`.
pub fn map_status(status: BackendStatus) -> KvError {
    match status {
        BackendStatus::ParamInvalid => KvError::InvalidParam(status.to_string()),
        BackendStatus::KeyNotExist => KvError::KeyNotFound,
        BackendStatus::KeyExists => KvError::KeyExists,
        BackendStatus::ValueSize { size, limit } => KvError::ValueTooLarge { size, limit },
        BackendStatus::BufferSmall {
            required,
            available,
        } => KvError::ValueTooLarge {
            size: required,
            limit: available,
        },
        BackendStatus::Timeout => KvError::Timeout,
        BackendStatus::SysIo
        | BackendStatus::DeviceNotOpen
        | BackendStatus::KeyspaceNotExist
        | BackendStatus::Other(_) => KvError::Io(status.to_string()),
    }
}

impl From<BackendStatus> for KvError {
    fn from(status: BackendStatus) -> Self {
        map_status(status)
    }
}

/// A key-value device the engine delegates persistence to.
///
/// Implementations must be usable from any thread; the engine calls them
/// from callers' threads (synchronous API) and from pool workers
/// (asynchronous API) at the same time.
pub trait StorageBackend: Send + Sync + 'static {
    /// Handle to an open device.
    type Device: Send + Sync + 'static;
    /// Handle to an open keyspace.
    type Keyspace: Send + Sync + 'static;

    fn open_device(&self, path: &str) -> BackendResult<Self::Device>;

    fn close_device(&self, device: &Self::Device) -> BackendResult<()>;

    fn open_keyspace(&self, device: &Self::Device, name: &str) -> BackendResult<Self::Keyspace>;

    fn create_keyspace(&self, device: &Self::Device, name: &str) -> BackendResult<()>;

    fn close_keyspace(&self, keyspace: &Self::Keyspace) -> BackendResult<()>;

    /// Stores a pair, overwriting any existing value.
    fn put(&self, keyspace: &Self::Keyspace, key: &[u8], value: &[u8]) -> BackendResult<()>;

    /// Copies the value into `buffer` and returns its length.
    ///
    /// A value longer than `buffer` must be reported as
    /// [`BackendStatus::BufferSmall`], never truncated.
    fn get(&self, keyspace: &Self::Keyspace, key: &[u8], buffer: &mut [u8]) -> BackendResult<usize>;

    /// Removes a pair. Deleting a missing key succeeds.
    fn delete(&self, keyspace: &Self::Keyspace, key: &[u8]) -> BackendResult<()>;

    fn exists(&self, keyspace: &Self::Keyspace, key: &[u8]) -> BackendResult<bool>;

    /// Opens `name`, creating it first when it does not exist yet.
    fn open_or_create_keyspace(
        &self,
        device: &Self::Device,
        name: &str,
    ) -> BackendResult<Self::Keyspace> {
        match self.open_keyspace(device, name) {
            Ok(keyspace) => Ok(keyspace),
            Err(_) => {
                self.create_keyspace(device, name)?;
                self.open_keyspace(device, name)
            }
        }
    }
}

/// Lets several owners (engines, tests, tools) share one backend instance.
impl<B: StorageBackend> StorageBackend for Arc<B> {
    type Device = B::Device;
    type Keyspace = B::Keyspace;

    fn open_device(&self, path: &str) -> BackendResult<Self::Device> {
        (**self).open_device(path)
    }

    fn close_device(&self, device: &Self::Device) -> BackendResult<()> {
        (**self).close_device(device)
    }

    fn open_keyspace(&self, device: &Self::Device, name: &str) -> BackendResult<Self::Keyspace> {
        (**self).open_keyspace(device, name)
    }

    fn create_keyspace(&self, device: &Self::Device, name: &str) -> BackendResult<()> {
        (**self).create_keyspace(device, name)
    }

    fn close_keyspace(&self, keyspace: &Self::Keyspace) -> BackendResult<()> {
        (**self).close_keyspace(keyspace)
    }

    fn put(&self, keyspace: &Self::Keyspace, key: &[u8], value: &[u8]) -> BackendResult<()> {
        (**self).put(keyspace, key, value)
    }

    fn get(&self, keyspace: &Self::Keyspace, key: &[u8], buffer: &mut [u8]) -> BackendResult<usize> {
        (**self).get(keyspace, key, buffer)
    }

    fn delete(&self, keyspace: &Self::Keyspace, key: &[u8]) -> BackendResult<()> {
        (**self).delete(keyspace, key)
    }

    fn exists(&self, keyspace: &Self::Keyspace, key: &[u8]) -> BackendResult<bool> {
        (**self).exists(keyspace, key)
    }

    fn open_or_create_keyspace(
        &self,
        device: &Self::Device,
        name: &str,
    ) -> BackendResult<Self::Keyspace> {
        (**self).open_or_create_keyspace(device, name)
    }
}
