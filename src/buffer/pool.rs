//! Size-bounded pool of released pixel buffers.
//!
//! # Matching
//!
//! [`BufferPool::acquire`] prefers a buffer released with exactly the
//! requested dimensions. Failing that, it takes the smallest buffer of the
//! same format whose allocation is large enough.
//!
//! # Size-Based Eviction
//!
//! The pool tracks the bytes it retains. When a release would exceed the
//! budget, the least recently released buffers are freed until it fits. A
//! buffer larger than the whole budget is freed immediately.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::{debug, trace};

use crate::error::DecodeError;

use super::pixel::{PixelBuffer, PixelFormat};

/// Default pool capacity: 64MB
pub const DEFAULT_BUFFER_POOL_CAPACITY: usize = 64 * 1024 * 1024;

/// Upper bound on retained buffers, whatever their size
const MAX_POOLED_BUFFERS: usize = 256;

// =============================================================================
// Internal state
// =============================================================================

/// Raw storage parked in the pool.
pub(crate) struct PooledStorage {
    pub(super) data: Vec<u8>,
    pub(super) width: u32,
    pub(super) height: u32,
    pub(super) format: PixelFormat,
}

struct PoolState {
    /// Keyed by release sequence number; LRU order is release order
    entries: LruCache<u64, PooledStorage>,
    next_id: u64,
    current_size: usize,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    max_size: usize,
    disabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn put(&self, storage: PooledStorage) {
        if self.disabled.load(Ordering::Relaxed) {
            return;
        }

        let size = storage.data.capacity();
        if size == 0 {
            return;
        }
        if size > self.max_size {
            trace!(bytes = size, "buffer larger than pool budget, freeing");
            return;
        }

        let mut state = self.lock();
        while state.current_size + size > self.max_size {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.current_size = state.current_size.saturating_sub(evicted.data.capacity());
                }
                None => break,
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        if let Some((_, evicted)) = state.entries.push(id, storage) {
            // Entry-count bound reached
            state.current_size = state.current_size.saturating_sub(evicted.data.capacity());
        }
        state.current_size += size;
    }
}

// =============================================================================
// BufferPool
// =============================================================================

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub pooled_buffers: usize,
    pub pooled_bytes: usize,
    pub capacity: usize,
}

/// Thread-safe pool of reusable pixel buffers.
///
/// Cloning is cheap and yields a handle to the same pool. All bookkeeping
/// happens under a single mutex; pixel work never runs while it is held.
///
/// # Example
///
/// ```
/// use subsampling::buffer::{BufferPool, PixelFormat};
///
/// let pool = BufferPool::with_capacity(16 * 1024 * 1024);
///
/// let buffer = pool.allocate(256, 256, PixelFormat::Rgba8);
/// drop(buffer); // storage goes back to the pool
///
/// let reused = pool.acquire(256, 256, PixelFormat::Rgba8);
/// assert!(reused.is_some());
/// ```
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool with the default capacity (64MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_POOL_CAPACITY)
    }

    /// Create a pool retaining at most `max_size` bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        let max_entries = NonZeroUsize::new(MAX_POOLED_BUFFERS).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    entries: LruCache::new(max_entries),
                    next_id: 0,
                    current_size: 0,
                }),
                max_size,
                disabled: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool that never retains anything.
    pub fn disabled() -> Self {
        let pool = Self::with_capacity(0);
        pool.set_disabled(true);
        pool
    }

    pub(super) fn from_shared(shared: Arc<PoolShared>) -> Self {
        Self { shared }
    }

    /// Enable or disable reuse. Disabling frees everything currently pooled.
    pub fn set_disabled(&self, disabled: bool) {
        self.shared.disabled.store(disabled, Ordering::Relaxed);
        if disabled {
            self.clear();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.disabled.load(Ordering::Relaxed)
    }

    /// Take a pooled buffer able to hold `width` x `height` pixels.
    ///
    /// Returns `None` when nothing fits (or the pool is disabled); the
    /// caller then allocates, typically through [`BufferPool::allocate`].
    pub fn acquire(&self, width: u32, height: u32, format: PixelFormat) -> Option<PixelBuffer> {
        if self.is_disabled() {
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let needed = format.byte_count(width, height);
        let mut state = self.shared.lock();

        let exact = state
            .entries
            .iter()
            .find(|(_, s)| s.format == format && s.width == width && s.height == height)
            .map(|(id, _)| *id);

        let chosen = exact.or_else(|| {
            state
                .entries
                .iter()
                .filter(|(_, s)| s.format == format && s.data.capacity() >= needed)
                .min_by_key(|(_, s)| s.data.capacity())
                .map(|(id, _)| *id)
        });

        let storage = chosen.and_then(|id| state.entries.pop(&id));
        match storage {
            Some(storage) => {
                state.current_size = state.current_size.saturating_sub(storage.data.capacity());
                drop(state);
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                trace!(width, height, "buffer pool hit");
                Some(PixelBuffer::from_storage(
                    storage.data,
                    width,
                    height,
                    format,
                    Arc::downgrade(&self.shared),
                ))
            }
            None => {
                drop(state);
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Acquire a pooled buffer or allocate a fresh one attached to this pool.
    pub fn allocate(&self, width: u32, height: u32, format: PixelFormat) -> PixelBuffer {
        match self.try_allocate(width, height, format) {
            Ok(buffer) => buffer,
            Err(err) => {
                debug!(error = %err, "falling back to unpooled allocation");
                PixelBuffer::new(width, height, format)
            }
        }
    }

    /// Like [`BufferPool::allocate`], but reports allocation failure instead
    /// of aborting.
    pub fn try_allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<PixelBuffer, DecodeError> {
        if let Some(buffer) = self.acquire(width, height, format) {
            return Ok(buffer);
        }

        let bytes = format.byte_count(width, height);
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|_| DecodeError::PoolAllocationFailed { bytes })?;

        if self.is_disabled() {
            data.resize(bytes, 0);
            return PixelBuffer::from_vec(width, height, format, data)
                .ok_or(DecodeError::PoolAllocationFailed { bytes });
        }

        Ok(PixelBuffer::from_storage(
            data,
            width,
            height,
            format,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Return a buffer's storage to the pool, whether or not it came from it.
    pub fn release(&self, mut buffer: PixelBuffer) {
        let storage = buffer.take_storage();
        self.shared.put(storage);
    }

    /// Free every pooled buffer.
    pub fn clear(&self) {
        let mut state = self.shared.lock();
        state.entries.clear();
        state.current_size = 0;
    }

    /// Number of buffers currently pooled.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently retained.
    pub fn size(&self) -> usize {
        self.shared.lock().current_size
    }

    /// Maximum bytes retained.
    pub fn capacity(&self) -> usize {
        self.shared.max_size
    }

    pub fn stats(&self) -> PoolStats {
        let (pooled_buffers, pooled_bytes) = {
            let state = self.shared.lock();
            (state.entries.len(), state.current_size)
        };
        PoolStats {
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            pooled_buffers,
            pooled_bytes,
            capacity: self.shared.max_size,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
