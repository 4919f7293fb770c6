use super::{BackendResult, BackendStatus, StorageBackend};
use crate::error::{KvError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Settings of the in-process device emulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Total bytes of values the device holds before reporting I/O errors
    /// (default: 1GB).
    pub capacity_bytes: u64,

    /// Largest value the device accepts (default: 2MB).
    pub max_value_size: usize,

    /// Refuse every `open_device` call.
    pub fail_open: bool,

    /// Refuse every `create_keyspace` call.
    pub fail_keyspace_create: bool,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 1024 * 1024 * 1024,
            max_value_size: 2 * 1024 * 1024,
            fail_open: false,
            fail_keyspace_create: false,
        }
    }
}

impl EmulatorConfig {
    /// Loads emulator settings from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            KvError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

struct KeyspaceData {
    entries: DashMap<Vec<u8>, Vec<u8>>,
    bytes: AtomicU64,
}

struct EmulatedDevice {
    keyspaces: DashMap<String, Arc<KeyspaceData>>,
}

/// Open device handle issued by [`MemoryBackend`].
pub struct MemoryDevice {
    path: String,
    device: Arc<EmulatedDevice>,
    open: AtomicBool,
}

/// Open keyspace handle issued by [`MemoryBackend`].
pub struct MemoryKeyspace {
    name: String,
    data: Arc<KeyspaceData>,
    open: AtomicBool,
}

impl MemoryKeyspace {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of pairs currently stored.
    pub fn len(&self) -> usize {
        self.data.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Concurrent in-memory emulator of a key-value device.
///
/// Devices and keyspaces are named; data survives closing and reopening
/// them for as long as the backend itself lives.
pub struct MemoryBackend {
    config: EmulatorConfig,
    devices: DashMap<String, Arc<EmulatedDevice>>,
    open_devices: AtomicUsize,
    open_keyspaces: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_config(EmulatorConfig::default())
    }

    pub fn with_config(config: EmulatorConfig) -> Self {
        Self {
            config,
            devices: DashMap::new(),
            open_devices: AtomicUsize::new(0),
            open_keyspaces: AtomicUsize::new(0),
        }
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_config(EmulatorConfig::from_file(path)?))
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    /// Device handles opened and not yet closed.
    pub fn open_device_count(&self) -> usize {
        self.open_devices.load(Ordering::SeqCst)
    }

    /// Keyspace handles opened and not yet closed.
    pub fn open_keyspace_count(&self) -> usize {
        self.open_keyspaces.load(Ordering::SeqCst)
    }

    fn live<'a>(&self, keyspace: &'a MemoryKeyspace) -> BackendResult<&'a KeyspaceData> {
        if keyspace.open.load(Ordering::Acquire) {
            Ok(&keyspace.data)
        } else {
            Err(BackendStatus::DeviceNotOpen)
        }
    }

    /// Claims `add` bytes of capacity, failing without side effects if they
    /// do not fit.
    fn reserve(&self, bytes: &AtomicU64, add: u64) -> BackendResult<()> {
        let capacity = self.config.capacity_bytes;
        bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(add).filter(|total| *total <= capacity)
            })
            .map(|_| ())
            .map_err(|_| BackendStatus::SysIo)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryBackend {
    type Device = MemoryDevice;
    type Keyspace = MemoryKeyspace;

    fn open_device(&self, path: &str) -> BackendResult<MemoryDevice> {
        if path.is_empty() {
            return Err(BackendStatus::ParamInvalid);
        }
        if self.config.fail_open {
            return Err(BackendStatus::SysIo);
        }

        let device = Arc::clone(
            self.devices
                .entry(path.to_string())
                .or_insert_with(|| {
                    Arc::new(EmulatedDevice {
                        keyspaces: DashMap::new(),
                    })
                })
                .value(),
        );

        self.open_devices.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Emulated device {} opened", path);

        Ok(MemoryDevice {
            path: path.to_string(),
            device,
            open: AtomicBool::new(true),
        })
    }

    fn close_device(&self, device: &MemoryDevice) -> BackendResult<()> {
        if !device.open.swap(false, Ordering::AcqRel) {
            return Err(BackendStatus::DeviceNotOpen);
        }
        self.open_devices.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!("Emulated device {} closed", device.path);
        Ok(())
    }

    fn open_keyspace(&self, device: &MemoryDevice, name: &str) -> BackendResult<MemoryKeyspace> {
        if !device.open.load(Ordering::Acquire) {
            return Err(BackendStatus::DeviceNotOpen);
        }
        let data = device
            .device
            .keyspaces
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BackendStatus::KeyspaceNotExist)?;

        self.open_keyspaces.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryKeyspace {
            name: name.to_string(),
            data,
            open: AtomicBool::new(true),
        })
    }

    fn create_keyspace(&self, device: &MemoryDevice, name: &str) -> BackendResult<()> {
        if !device.open.load(Ordering::Acquire) {
            return Err(BackendStatus::DeviceNotOpen);
        }
        if name.is_empty() || name.len() > 255 {
            return Err(BackendStatus::ParamInvalid);
        }
        if self.config.fail_keyspace_create {
            return Err(BackendStatus::SysIo);
        }

        match device.device.keyspaces.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BackendStatus::Other(0x0B)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(KeyspaceData {
                    entries: DashMap::new(),
                    bytes: AtomicU64::new(0),
                }));
                tracing::debug!("Emulated keyspace {} created on {}", name, device.path);
                Ok(())
            }
        }
    }

    fn close_keyspace(&self, keyspace: &MemoryKeyspace) -> BackendResult<()> {
        if !keyspace.open.swap(false, Ordering::AcqRel) {
            return Err(BackendStatus::KeyspaceNotExist);
        }
        self.open_keyspaces.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn put(&self, keyspace: &MemoryKeyspace, key: &[u8], value: &[u8]) -> BackendResult<()> {
        let data = self.live(keyspace)?;
        if key.is_empty() {
            return Err(BackendStatus::ParamInvalid);
        }
        if value.len() > self.config.max_value_size {
            return Err(BackendStatus::ValueSize {
                size: value.len(),
                limit: self.config.max_value_size,
            });
        }

        let new_len = value.len() as u64;
        match data.entries.entry(key.to_vec()) {
            Entry::Occupied(mut entry) => {
                let old_len = entry.get().len() as u64;
                if new_len > old_len {
                    self.reserve(&data.bytes, new_len - old_len)?;
                } else {
                    data.bytes.fetch_sub(old_len - new_len, Ordering::AcqRel);
                }
                entry.insert(value.to_vec());
            }
            Entry::Vacant(entry) => {
                self.reserve(&data.bytes, new_len)?;
                entry.insert(value.to_vec());
            }
        }
        Ok(())
    }

    fn get(&self, keyspace: &MemoryKeyspace, key: &[u8], buffer: &mut [u8]) -> BackendResult<usize> {
        let data = self.live(keyspace)?;
        let value = data.entries.get(key).ok_or(BackendStatus::KeyNotExist)?;

        if value.len() > buffer.len() {
            return Err(BackendStatus::BufferSmall {
                required: value.len(),
                available: buffer.len(),
            });
        }
        buffer[..value.len()].copy_from_slice(value.value());
        Ok(value.len())
    }

    fn delete(&self, keyspace: &MemoryKeyspace, key: &[u8]) -> BackendResult<()> {
        let data = self.live(keyspace)?;
        if let Some((_, value)) = data.entries.remove(key) {
            data.bytes.fetch_sub(value.len() as u64, Ordering::AcqRel);
        }
        Ok(())
    }

    fn exists(&self, keyspace: &MemoryKeyspace, key: &[u8]) -> BackendResult<bool> {
        let data = self.live(keyspace)?;
        Ok(data.entries.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(backend: &MemoryBackend) -> (MemoryDevice, MemoryKeyspace) {
        let device = backend.open_device("/dev/kvemul").unwrap();
        let keyspace = backend.open_or_create_keyspace(&device, "test").unwrap();
        (device, keyspace)
    }

    #[test]
    fn test_put_get_delete() {
        let backend = MemoryBackend::new();
        let (_device, ks) = open(&backend);

        backend.put(&ks, b"key1", b"value1").unwrap();
        assert!(backend.exists(&ks, b"key1").unwrap());

        let mut buf = vec![0u8; 64];
        let len = backend.get(&ks, b"key1", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"value1");

        backend.delete(&ks, b"key1").unwrap();
        assert!(!backend.exists(&ks, b"key1").unwrap());
        assert_eq!(
            backend.get(&ks, b"key1", &mut buf),
            Err(BackendStatus::KeyNotExist)
        );
    }

    #[test]
    fn test_put_overwrites() {
        let backend = MemoryBackend::new();
        let (_device, ks) = open(&backend);

        backend.put(&ks, b"key1", b"first").unwrap();
        backend.put(&ks, b"key1", b"second").unwrap();

        let mut buf = vec![0u8; 16];
        let len = backend.get(&ks, b"key1", &mut buf).unwrap();
        assert_eq!(&buf[..len], b"second");
        assert_eq!(ks.len(), 1);
    }

    #[test]
    fn test_delete_missing_key_succeeds() {
        let backend = MemoryBackend::new();
        let (_device, ks) = open(&backend);
        assert!(backend.delete(&ks, b"ghost").is_ok());
    }

    #[test]
    fn test_get_reports_small_buffer() {
        let backend = MemoryBackend::new();
        let (_device, ks) = open(&backend);
        backend.put(&ks, b"key1", &[7u8; 100]).unwrap();

        let mut buf = vec![0u8; 10];
        assert_eq!(
            backend.get(&ks, b"key1", &mut buf),
            Err(BackendStatus::BufferSmall {
                required: 100,
                available: 10
            })
        );
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_value_size_limit() {
        let backend = MemoryBackend::with_config(EmulatorConfig {
            max_value_size: 16,
            ..EmulatorConfig::default()
        });
        let (_device, ks) = open(&backend);

        assert!(backend.put(&ks, b"key1", &[0u8; 16]).is_ok());
        assert_eq!(
            backend.put(&ks, b"key2", &[0u8; 17]),
            Err(BackendStatus::ValueSize { size: 17, limit: 16 })
        );
    }

    #[test]
    fn test_capacity_exhaustion() {
        let backend = MemoryBackend::with_config(EmulatorConfig {
            capacity_bytes: 100,
            ..EmulatorConfig::default()
        });
        let (_device, ks) = open(&backend);

        backend.put(&ks, b"key1", &[0u8; 60]).unwrap();
        assert_eq!(
            backend.put(&ks, b"key2", &[0u8; 60]),
            Err(BackendStatus::SysIo)
        );
        // Overwriting in place frees the old value first
        backend.put(&ks, b"key1", &[0u8; 90]).unwrap();
        backend.delete(&ks, b"key1").unwrap();
        backend.put(&ks, b"key2", &[0u8; 100]).unwrap();
    }

    #[test]
    fn test_concurrent_puts_respect_capacity() {
        let backend = MemoryBackend::with_config(EmulatorConfig {
            capacity_bytes: 64 * 100,
            ..EmulatorConfig::default()
        });
        let (_device, ks) = open(&backend);

        let stored = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for t in 0..8 {
                let (backend, ks, stored) = (&backend, &ks, &stored);
                s.spawn(move || {
                    for i in 0..50 {
                        let key = format!("t{}-{}", t, i);
                        if backend.put(ks, key.as_bytes(), &[0u8; 64]).is_ok() {
                            stored.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(stored.load(Ordering::SeqCst), 100);
        assert_eq!(ks.len(), 100);
    }

    #[test]
    fn test_keyspace_open_requires_creation() {
        let backend = MemoryBackend::new();
        let device = backend.open_device("/dev/kvemul").unwrap();

        assert!(matches!(
            backend.open_keyspace(&device, "missing"),
            Err(BackendStatus::KeyspaceNotExist)
        ));
        backend.create_keyspace(&device, "missing").unwrap();
        assert!(backend.open_keyspace(&device, "missing").is_ok());
        assert!(backend.create_keyspace(&device, "missing").is_err());
    }

    #[test]
    fn test_data_survives_reopen() {
        let backend = MemoryBackend::new();
        {
            let (device, ks) = open(&backend);
            backend.put(&ks, b"durable", b"yes").unwrap();
            backend.close_keyspace(&ks).unwrap();
            backend.close_device(&device).unwrap();
        }
        assert_eq!(backend.open_device_count(), 0);
        assert_eq!(backend.open_keyspace_count(), 0);

        let (_device, ks) = open(&backend);
        assert!(backend.exists(&ks, b"durable").unwrap());
    }

    #[test]
    fn test_closed_keyspace_rejects_io() {
        let backend = MemoryBackend::new();
        let (_device, ks) = open(&backend);
        backend.close_keyspace(&ks).unwrap();

        assert_eq!(
            backend.put(&ks, b"key1", b"v"),
            Err(BackendStatus::DeviceNotOpen)
        );
        assert!(backend.close_keyspace(&ks).is_err());
    }

    #[test]
    fn test_fail_open_switch() {
        let backend = MemoryBackend::with_config(EmulatorConfig {
            fail_open: true,
            ..EmulatorConfig::default()
        });
        assert!(backend.open_device("/dev/kvemul").is_err());
        assert_eq!(backend.open_device_count(), 0);
    }

    #[test]
    fn test_config_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("kvssd_emul.json");
        std::fs::write(&path, r#"{"capacity_bytes": 4096, "max_value_size": 512}"#).unwrap();

        let backend = MemoryBackend::from_config_file(&path).unwrap();
        assert_eq!(backend.config().capacity_bytes, 4096);
        assert_eq!(backend.config().max_value_size, 512);
        assert!(!backend.config().fail_open);
    }
}
