//! Fixed-capacity bump arena for in-flight operation buffers.
//!
//! The arena owns one contiguous, 8-byte aligned byte buffer. Allocation
//! bumps a `used` offset under a mutex; there is no per-allocation free.
//! Space comes back only in bulk, either through [`Arena::reset`] (exclusive
//! access) or through [`Arena::reclaim_if_idle`] once every outstanding
//! block has been dropped.
//!
//! Callers never see raw pointers. An allocation is an [`ArenaBlock`]: an
//! `(offset, len, generation)` token that keeps the arena alive and is the
//! only path to the reserved bytes. A block cannot outlive the epoch it was
//! carved from, because neither reset path can run while it exists.

use crate::error::{KvError, Result};
use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

/// Alignment of every block handed out by the arena.
pub const ARENA_ALIGN: usize = 8;

/// Rounds `n` up to the next multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
pub fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    n.checked_add(align - 1).map(|v| v & !(align - 1))
}

struct ArenaState {
    used: usize,
    generation: u64,
    outstanding: usize,
}

/// Point-in-time view of arena occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaUsage {
    pub capacity: usize,
    pub used: usize,
    pub outstanding: usize,
    pub generation: u64,
}

/// Thread-safe bump allocator over a fixed buffer.
pub struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    state: Mutex<ArenaState>,
}

// The buffer is only reached through ArenaBlock tokens whose ranges never
// overlap, and both reset paths exclude live blocks.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserves a zeroed buffer of `capacity` bytes.
    ///
    /// # Errors
    ///
    /// - `InvalidParam` if `capacity` is 0
    /// - `NoMemory` if the buffer cannot be obtained
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(KvError::InvalidParam(
                "arena capacity must be greater than 0".to_string(),
            ));
        }

        let layout = Layout::from_size_align(capacity, ARENA_ALIGN).map_err(|_| {
            KvError::NoMemory(format!("invalid arena layout for {} bytes", capacity))
        })?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            KvError::NoMemory(format!("cannot reserve {} byte arena", capacity))
        })?;

        tracing::debug!("Arena created with capacity {} bytes", capacity);

        Ok(Self {
            base,
            layout,
            state: Mutex::new(ArenaState {
                used: 0,
                generation: 0,
                outstanding: 0,
            }),
        })
    }

    /// Total size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes consumed in the current epoch, alignment padding included.
    pub fn used(&self) -> usize {
        self.lock().used
    }

    /// Bytes still available in the current epoch.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Current epoch number. Bumped by every reset.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn usage(&self) -> ArenaUsage {
        let state = self.lock();
        ArenaUsage {
            capacity: self.capacity(),
            used: state.used,
            outstanding: state.outstanding,
            generation: state.generation,
        }
    }

    /// Reserves `align_up(size, 8)` bytes starting at an 8-byte boundary.
    ///
    /// Fails with `NoMemory` when the aligned request does not fit in the
    /// remaining space; `used` is left untouched in that case.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<ArenaBlock> {
        let mut state = self.lock();

        let exhausted = || {
            KvError::NoMemory(format!(
                "arena exhausted: requested {} bytes, {} of {} in use",
                size,
                state.used,
                self.capacity()
            ))
        };

        let start = align_up(state.used, ARENA_ALIGN).ok_or_else(exhausted)?;
        let reserved = align_up(size, ARENA_ALIGN).ok_or_else(exhausted)?;
        let end = match start.checked_add(reserved) {
            Some(end) if end <= self.capacity() => end,
            _ => return Err(exhausted()),
        };

        state.used = end;
        state.outstanding += 1;

        Ok(ArenaBlock {
            arena: Arc::clone(self),
            offset: start,
            len: size,
            generation: state.generation,
        })
    }

    /// Allocates a block and copies `data` into it.
    pub fn alloc_copy(self: &Arc<Self>, data: &[u8]) -> Result<ArenaBlock> {
        let mut block = self.allocate(data.len())?;
        block.as_mut_slice().copy_from_slice(data);
        Ok(block)
    }

    /// Starts a new epoch if no block is outstanding.
    ///
    /// Returns true when the arena is empty afterwards.
    pub fn reclaim_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.outstanding > 0 {
            return false;
        }
        if state.used > 0 {
            state.used = 0;
            state.generation += 1;
            tracing::debug!("Arena reclaimed, generation {}", state.generation);
        }
        true
    }

    /// Discards every allocation and starts a new epoch.
    ///
    /// Exclusive access guarantees no [`ArenaBlock`] exists: each block holds
    /// a clone of the `Arc` this arena lives in.
    pub fn reset(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        debug_assert_eq!(state.outstanding, 0);
        state.used = 0;
        state.generation += 1;
    }

    fn release(&self, generation: u64) {
        let mut state = self.lock();
        debug_assert_eq!(state.generation, generation);
        state.outstanding -= 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: base was returned by alloc_zeroed with this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = self.usage();
        f.debug_struct("Arena")
            .field("capacity", &usage.capacity)
            .field("used", &usage.used)
            .field("outstanding", &usage.outstanding)
            .field("generation", &usage.generation)
            .finish()
    }
}

/// A reserved range of the arena.
///
/// Dropping the block gives up its claim on the current epoch; the bytes
/// themselves are only reused after the next reset.
pub struct ArenaBlock {
    arena: Arc<Arena>,
    offset: usize,
    len: usize,
    generation: u64,
}

impl ArenaBlock {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [offset, offset + len) lies inside the buffer and is
        // reserved for this block until it is dropped.
        unsafe {
            std::slice::from_raw_parts(self.arena.base.as_ptr().add(self.offset), self.len)
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self makes the access exclusive.
        unsafe {
            std::slice::from_raw_parts_mut(self.arena.base.as_ptr().add(self.offset), self.len)
        }
    }
}

impl Drop for ArenaBlock {
    fn drop(&mut self) {
        self.arena.release(self.generation);
    }
}

impl fmt::Debug for ArenaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaBlock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("generation", &self.generation)
            .finish()
    }
}
