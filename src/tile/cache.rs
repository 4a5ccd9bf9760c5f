//! Cache of decoded tiles.
//!
//! Keeps tiles that scrolled out of the load rectangle (or belong to a level
//! the viewport just left) so that coming back to them does not require a
//! new decode.
//!
//! # Cache Key
//!
//! Tiles are cached by [`TileKey`]:
//! - Image key (from the [`ImageSource`](crate::decode::ImageSource))
//! - Sample size
//! - Tile column
//! - Tile row
//!
//! # Size-Based Eviction
//!
//! The cache tracks the total pixel bytes of cached tiles and evicts
//! least-recently-used entries when the capacity is exceeded. Buffers are
//! shared with the tiles displaying them; an evicted buffer goes back to
//! its pool once the displayed tile lets go of it too.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;
use tracing::trace;

use crate::buffer::PixelBuffer;
use crate::decode::ImageInfo;

use super::state::TileKey;

/// Default cache capacity: 128MB
pub const DEFAULT_TILE_CACHE_CAPACITY: usize = 128 * 1024 * 1024;

/// Default maximum number of entries (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: NonZeroUsize = match NonZeroUsize::new(4_096) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

// =============================================================================
// Cached entry
// =============================================================================

/// A decoded tile plus the image it was decoded from.
#[derive(Debug, Clone)]
pub struct CachedTile {
    pub buffer: Arc<PixelBuffer>,
    pub image_url: Arc<str>,
    pub image_info: ImageInfo,
}

impl CachedTile {
    fn size(&self) -> usize {
        self.buffer.byte_count()
    }
}

// =============================================================================
// Tile Cache
// =============================================================================

struct CacheState {
    entries: LruCache<TileKey, CachedTile>,
    current_size: usize,
}

/// LRU cache for decoded tiles with size-based capacity.
///
/// # Thread Safety
///
/// The cache is thread-safe and can be shared across engines via `Arc`.
/// Locks are only held for bookkeeping.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use subsampling::buffer::{PixelBuffer, PixelFormat};
/// use subsampling::decode::ImageInfo;
/// use subsampling::grid::{SampleSize, TileCoord};
/// use subsampling::tile::{TileCache, TileKey};
///
/// let cache = TileCache::new();
/// let key = TileKey::new("file:///photo.jpg", SampleSize::ONE, TileCoord::new(1, 2));
/// let buffer = Arc::new(PixelBuffer::new(256, 256, PixelFormat::Rgba8));
/// let info = ImageInfo::new(8000, 6000, "image/jpeg");
///
/// cache.put(key.clone(), buffer, "file:///photo.jpg", info);
/// assert!(cache.get(&key).is_some());
/// ```
pub struct TileCache {
    state: Mutex<CacheState>,

    /// Maximum total size in bytes
    max_size: usize,
}

impl TileCache {
    /// Create a new tile cache with default capacity (128MB).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TILE_CACHE_CAPACITY)
    }

    /// Create a new tile cache with the specified capacity in bytes.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    /// Create a new tile cache with specified capacity and maximum entries.
    pub fn with_capacity_and_entries(max_size: usize, max_entries: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(max_entries),
                current_size: 0,
            }),
            max_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get a tile from the cache, marking it as recently used.
    pub fn get(&self, key: &TileKey) -> Option<CachedTile> {
        self.lock().entries.get(key).cloned()
    }

    /// Check if a tile is in the cache without updating LRU order.
    pub fn contains(&self, key: &TileKey) -> bool {
        self.lock().entries.contains(key)
    }

    /// Store a tile in the cache.
    ///
    /// If the cache is over capacity after insertion, least-recently-used
    /// entries are evicted until it fits. A tile larger than the whole
    /// capacity is not cached.
    pub fn put(
        &self,
        key: TileKey,
        buffer: Arc<PixelBuffer>,
        image_url: impl Into<Arc<str>>,
        image_info: ImageInfo,
    ) {
        let entry = CachedTile {
            buffer,
            image_url: image_url.into(),
            image_info,
        };
        let entry_size = entry.size();
        if entry_size > self.max_size {
            trace!(tile = %key, bytes = entry_size, "tile larger than cache capacity");
            return;
        }

        let mut state = self.lock();

        // If key exists, subtract old size first
        if let Some(old) = state.entries.peek(&key) {
            state.current_size = state.current_size.saturating_sub(old.size());
        }

        // Entry-count eviction done by the LRU itself
        if let Some((evicted_key, evicted)) = state.entries.push(key, entry) {
            if !state.entries.contains(&evicted_key) {
                state.current_size = state.current_size.saturating_sub(evicted.size());
            }
        }
        state.current_size += entry_size;

        // Evict entries until we're under capacity
        while state.current_size > self.max_size {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.current_size = state.current_size.saturating_sub(evicted.size());
                }
                None => break,
            }
        }
    }

    /// Remove a tile from the cache.
    pub fn remove(&self, key: &TileKey) -> Option<CachedTile> {
        let mut state = self.lock();
        let removed = state.entries.pop(key)?;
        state.current_size = state.current_size.saturating_sub(removed.size());
        Some(removed)
    }

    /// Drop every tile of one image. Returns the number removed.
    pub fn remove_image(&self, image_key: &str) -> usize {
        let mut state = self.lock();
        let keys: Vec<TileKey> = state
            .entries
            .iter()
            .filter(|(key, _)| &*key.image_key == image_key)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            if let Some(removed) = state.entries.pop(key) {
                state.current_size = state.current_size.saturating_sub(removed.size());
            }
        }
        keys.len()
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.current_size = 0;
    }

    /// Get the current number of cached tiles.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Get the current total size of cached tiles in bytes.
    pub fn size(&self) -> usize {
        self.lock().current_size
    }

    /// Get the maximum capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

impl Default for TileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TileCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("len", &self.len())
            .field("size", &self.size())
            .field("capacity", &self.max_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
