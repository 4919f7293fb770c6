//! Asynchronous operation plumbing.
//!
//! An async store/retrieve/delete is validated on the caller's thread, its
//! key (and value) are copied into the engine arena, and the resulting
//! [`AsyncContext`] travels inside a pool task. The context hands its arena
//! blocks back before the completion notification fires, and the
//! notification fires exactly once.

use crate::arena::ArenaBlock;
use crate::error::{KvError, Result};
use crate::stats::OpKind;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Shortest accepted key in bytes.
pub const MIN_KEY_LEN: usize = 4;

/// Longest accepted key in bytes.
pub const MAX_KEY_LEN: usize = 255;

/// Largest value accepted by `store` (2MB).
pub const MAX_VALUE_SIZE: usize = 2 * 1024 * 1024;

/// Checks the key length bound shared by every operation.
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(KvError::InvalidParam(format!(
            "key length {} outside {}..={}",
            key.len(),
            MIN_KEY_LEN,
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

pub fn validate_value(value: &[u8]) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            limit: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Progress of an async operation. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Submitted,
    Executing,
    Completed,
}

/// Completion notification of an async operation.
pub type Notify<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Per-operation record owned by the task that executes it.
pub struct AsyncContext<T> {
    id: u64,
    kind: OpKind,
    key: ArenaBlock,
    value: Option<ArenaBlock>,
    state: OpState,
    notify: Notify<T>,
}

impl<T> AsyncContext<T> {
    pub fn new(
        id: u64,
        kind: OpKind,
        key: ArenaBlock,
        value: Option<ArenaBlock>,
        notify: Notify<T>,
    ) -> Self {
        Self {
            id,
            kind,
            key,
            value,
            state: OpState::Submitted,
            notify,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn state(&self) -> OpState {
        self.state
    }

    pub fn key(&self) -> &[u8] {
        self.key.as_slice()
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_ref().map(ArenaBlock::as_slice)
    }

    /// Marks the operation as picked up by a worker.
    pub fn begin(&mut self) {
        debug_assert_eq!(self.state, OpState::Submitted);
        self.state = OpState::Executing;
        tracing::trace!("Async {} op {} executing", self.kind, self.id);
    }

    /// Releases the arena blocks, then delivers `result`.
    pub fn complete(mut self, result: Result<T>) {
        self.state = OpState::Completed;
        tracing::trace!(
            "Async {} op {} completed (ok = {})",
            self.kind,
            self.id,
            result.is_ok()
        );

        let AsyncContext {
            key, value, notify, ..
        } = self;
        drop(value);
        drop(key);
        notify(result);
    }
}

impl<T> fmt::Debug for AsyncContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("key_len", &self.key.len())
            .field("value_len", &self.value.as_ref().map(ArenaBlock::len))
            .finish()
    }
}

/// Future resolving to the outcome of an async operation.
///
/// Resolves to `NotInitialized` if the operation was dropped without
/// running, e.g. discarded by a shutdown.
pub struct Completion<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Creates the notification half and the future half of an operation.
    pub(crate) fn pair() -> (Notify<T>, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        let notify: Notify<T> = Box::new(move |result| {
            // Receiver gone means nobody is waiting
            let _ = tx.send(result);
        });
        (notify, rx)
    }

    pub(crate) fn new(id: u64, rx: oneshot::Receiver<Result<T>>) -> Self {
        Self { id, rx }
    }
}

impl<T> Completion<T> {
    /// Operation id assigned at submission.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks the current thread until the operation completes.
    ///
    /// Must not be called from inside an async runtime; `.await` instead.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(KvError::NotInitialized))
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(KvError::NotInitialized)))
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish()
    }
}
