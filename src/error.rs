//! Error types for nvmekv.
//!
//! This module defines every error an engine operation can report, together
//! with the stable numeric result codes exposed by the device-facing API.

use thiserror::Error;

/// Result type alias for nvmekv operations.
///
/// This is a convenience alias for `Result<T, KvError>`.
pub type Result<T> = std::result::Result<T, KvError>;

/// Numeric result codes of the engine API.
///
/// These values are stable and match the codes handed to completion
/// callbacks by C-style front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    InvalidParam = -1,
    NoMemory = -2,
    DeviceOpen = -3,
    KeyNotFound = -4,
    KeyExists = -5,
    ValueTooLarge = -6,
    Timeout = -7,
    Io = -8,
    NotInitialized = -9,
}

impl ResultCode {
    /// Returns the raw integer value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Error types for engine operations.
///
/// Validation errors (`InvalidParam`, `ValueTooLarge` on the request side)
/// are reported synchronously at the call boundary. Everything coming back
/// from the storage backend is funnelled through
/// [`crate::backend::map_status`].
#[derive(Error, Debug)]
pub enum KvError {
    /// A parameter is missing, empty or out of range.
    ///
    /// Keys must be 4 to 255 bytes long.
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    /// Arena or backing buffer allocation failed.
    ///
    /// Also reported when the arena has no room left for an in-flight
    /// operation's key/value copy.
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// The backend device or keyspace could not be opened or created.
    #[error("Failed to open device: {0}")]
    DeviceOpen(String),

    /// The key does not exist in the keyspace.
    #[error("Key not found")]
    KeyNotFound,

    /// The key already exists and the backend refused to overwrite it.
    #[error("Key already exists")]
    KeyExists,

    /// A value exceeds the allowed size.
    ///
    /// On store this is the 2 MiB request limit; on retrieve it means the
    /// stored value did not fit into the retrieve buffer.
    #[error("Value too large: {size} bytes (limit {limit})")]
    ValueTooLarge {
        /// Size of the offending value, when known
        size: usize,
        /// Limit that was exceeded
        limit: usize,
    },

    /// The backend did not answer in time.
    #[error("Operation timed out")]
    Timeout,

    /// Generic backend failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The engine is not running (never initialized or already shut down).
    #[error("Engine not initialized")]
    NotInitialized,

    /// Configuration validation or loading failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON parsing or serialization of a configuration file failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KvError {
    /// Returns the numeric result code for this error.
    ///
    /// Configuration problems have no dedicated code and report
    /// `InvalidParam`.
    pub fn code(&self) -> ResultCode {
        match self {
            KvError::InvalidParam(_) => ResultCode::InvalidParam,
            KvError::NoMemory(_) => ResultCode::NoMemory,
            KvError::DeviceOpen(_) => ResultCode::DeviceOpen,
            KvError::KeyNotFound => ResultCode::KeyNotFound,
            KvError::KeyExists => ResultCode::KeyExists,
            KvError::ValueTooLarge { .. } => ResultCode::ValueTooLarge,
            KvError::Timeout => ResultCode::Timeout,
            KvError::Io(_) => ResultCode::Io,
            KvError::NotInitialized => ResultCode::NotInitialized,
            KvError::Config(_) | KvError::Json(_) => ResultCode::InvalidParam,
        }
    }

    /// True for errors raised by argument validation before any queue
    /// submission or backend call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            KvError::InvalidParam(_) | KvError::ValueTooLarge { .. } | KvError::Config(_)
        )
    }
}

/// Maps a unit result onto its numeric code.
pub fn result_code<T>(result: &Result<T>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Success,
        Err(e) => e.code(),
    }
}
