//! Test utilities for integration tests.
//!
//! This module provides in-memory image generators, a mock region decoder
//! with call tracking, and helpers for driving the engine.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use subsampling::buffer::{BufferPool, PixelBuffer, PixelFormat};
use subsampling::config::EngineConfig;
use subsampling::decode::{DecoderFactory, ImageInfo, ImageSource, RegionDecoder};
use subsampling::engine::{EngineSnapshot, SubsamplingEngine};
use subsampling::error::DecodeError;
use subsampling::geometry::{IntRect, IntSize, Orientation, OrientationTransform};
use subsampling::grid::SampleSize;
use subsampling::tile::TileCache;

// =============================================================================
// Image generators
// =============================================================================

/// Create a PNG whose pixel at (x, y) is `[x % 256, y % 256, 128, 255]`.
pub fn create_test_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("Failed to encode PNG");
    out
}

/// Create an RGB JPEG with a simple gradient.
pub fn create_test_jpeg(width: u32, height: u32, quality: u8) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode_image(&image)
        .expect("Failed to encode JPEG");
    buf
}

/// Bytes that sniff as an animated GIF.
pub fn create_gif_header() -> Vec<u8> {
    let mut bytes = b"GIF89a".to_vec();
    bytes.extend_from_slice(&[0x10, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00]);
    bytes.extend_from_slice(&[0u8; 48]);
    bytes
}

/// Write `data` to a unique file in the temp directory.
pub fn write_temp_file(name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("subsampling-{}-{}", std::process::id(), name));
    std::fs::write(&path, data).expect("Failed to write temp file");
    path
}

// =============================================================================
// Mock region decoder
// =============================================================================

/// Counters shared by every decoder a [`MockDecoderFactory`] creates.
#[derive(Debug, Default)]
pub struct MockStats {
    pub opens: AtomicUsize,
    pub instances: AtomicUsize,
    pub closes: AtomicUsize,
    pub decodes_started: AtomicUsize,
    pub decodes: AtomicUsize,
    pub failures: AtomicUsize,
    requested: Mutex<Vec<IntRect>>,
}

impl MockStats {
    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub fn decodes_started(&self) -> usize {
        self.decodes_started.load(Ordering::SeqCst)
    }

    /// Decoder instances created and not closed yet.
    pub fn live_instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst) - self.closes.load(Ordering::SeqCst)
    }

    /// Source-space rects passed to the codec, after un-rotation.
    pub fn requested_rects(&self) -> Vec<IntRect> {
        self.requested.lock().unwrap().clone()
    }
}

/// A latch that holds decodes until it is opened.
#[derive(Debug, Clone)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn closed() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn open(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }

    fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let mut open = lock.lock().unwrap();
        while !*open {
            open = condvar.wait(open).unwrap();
        }
    }
}

#[derive(Debug, Clone)]
struct MockSettings {
    info: ImageInfo,
    orientation: Orientation,
    delay: Duration,
    gate: Option<Gate>,
    /// Display-space rect origins whose decode fails
    failing: HashSet<(u32, u32)>,
}

/// Decoder factory producing [`MockRegionDecoder`]s for any source.
#[derive(Debug, Clone)]
pub struct MockDecoderFactory {
    settings: MockSettings,
    stats: Arc<MockStats>,
}

impl MockDecoderFactory {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            settings: MockSettings {
                info: ImageInfo::new(width, height, "image/png"),
                orientation: Orientation::Normal,
                delay: Duration::ZERO,
                gate: None,
                failing: HashSet::new(),
            },
            stats: Arc::new(MockStats::default()),
        }
    }

    pub fn with_mime_type(mut self, mime_type: &str) -> Self {
        self.settings.info.mime_type = mime_type.to_string();
        self
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.settings.orientation = orientation;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.settings.delay = delay;
        self
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.settings.gate = Some(gate);
        self
    }

    /// Fail decodes of the tile whose display-space rect starts at `(left, top)`.
    pub fn failing_at(mut self, left: u32, top: u32) -> Self {
        self.settings.failing.insert((left, top));
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl DecoderFactory for MockDecoderFactory {
    fn open(&self, _source: &dyn ImageSource) -> Result<Box<dyn RegionDecoder>, DecodeError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockRegionDecoder::new(
            self.settings.clone(),
            Arc::clone(&self.stats),
        )))
    }
}

/// Region decoder that fills each tile with a color derived from its rect.
///
/// Pixel (0, 0) of a decoded tile is `[left % 256, top % 256, sample, 255]`
/// of the stored-space rect.
pub struct MockRegionDecoder {
    settings: MockSettings,
    stats: Arc<MockStats>,
    closed: bool,
}

impl MockRegionDecoder {
    fn new(settings: MockSettings, stats: Arc<MockStats>) -> Self {
        stats.instances.fetch_add(1, Ordering::SeqCst);
        Self {
            settings,
            stats,
            closed: false,
        }
    }
}

impl RegionDecoder for MockRegionDecoder {
    fn image_info(&self) -> &ImageInfo {
        &self.settings.info
    }

    fn orientation(&self) -> Orientation {
        self.settings.orientation
    }

    fn decode_region(
        &mut self,
        _key: &str,
        rect: IntRect,
        sample_size: SampleSize,
        reuse: Option<PixelBuffer>,
    ) -> Result<PixelBuffer, DecodeError> {
        if self.closed {
            return Err(DecodeError::DecodeFailed {
                reason: "decoder closed".to_string(),
            });
        }
        self.stats.decodes_started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.settings.gate {
            gate.wait();
        }
        if !self.settings.delay.is_zero() {
            std::thread::sleep(self.settings.delay);
        }

        let transform = OrientationTransform::new(self.settings.orientation);
        let stored_size = self.settings.info.size();
        let display_size = transform.apply_to_size(stored_size, false);
        if !IntRect::from_size(display_size).contains_rect(&rect) {
            return Err(DecodeError::RegionOutOfBounds {
                rect,
                image_size: display_size,
            });
        }
        let source_rect = transform.apply_to_rect(rect, display_size, true);
        self.stats.requested.lock().unwrap().push(source_rect);

        if self.settings.failing.contains(&(rect.left, rect.top)) {
            self.stats.failures.fetch_add(1, Ordering::SeqCst);
            return Err(DecodeError::DecodeFailed {
                reason: format!("injected failure at {}", rect),
            });
        }

        let size = sample_size.scaled_size(source_rect.size());
        let mut buffer = match reuse {
            Some(mut buffer) if buffer.is_compatible(size.width, size.height, PixelFormat::Rgba8) => {
                buffer.reshape(size.width, size.height);
                buffer
            }
            _ => PixelBuffer::new(size.width, size.height, PixelFormat::Rgba8),
        };
        let color = [
            (source_rect.left % 256) as u8,
            (source_rect.top % 256) as u8,
            sample_size.get().min(255) as u8,
            255,
        ];
        for pixel in buffer.data_mut().chunks_exact_mut(4) {
            pixel.copy_from_slice(&color);
        }

        self.stats.decodes.fetch_add(1, Ordering::SeqCst);
        Ok(buffer)
    }

    fn try_clone(&self) -> Option<Box<dyn RegionDecoder>> {
        Some(Box::new(MockRegionDecoder::new(
            self.settings.clone(),
            Arc::clone(&self.stats),
        )))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockRegionDecoder {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Engine helpers
// =============================================================================

/// Engine config for tests: no fade-in so snapshots settle right after
/// the last decode.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_tile_animation_duration(Duration::ZERO)
        .with_decode_workers(4)
}

pub struct TestEngine {
    pub engine: SubsamplingEngine,
    pub buffers: BufferPool,
    pub cache: Arc<TileCache>,
}

pub fn create_engine(config: EngineConfig, factory: Arc<dyn DecoderFactory>) -> TestEngine {
    let buffers = BufferPool::with_capacity(config.buffer_pool_capacity);
    let cache = Arc::new(TileCache::with_capacity(config.tile_cache_capacity));
    let engine = SubsamplingEngine::new(config, factory, buffers.clone(), Arc::clone(&cache))
        .expect("Failed to create engine");
    TestEngine {
        engine,
        buffers,
        cache,
    }
}

/// Wait for a snapshot matching `predicate`, failing the test after 5s.
pub async fn wait_for(
    engine: &SubsamplingEngine,
    predicate: impl FnMut(&EngineSnapshot) -> bool,
) -> Arc<EngineSnapshot> {
    tokio::time::timeout(Duration::from_secs(5), engine.wait_for(predicate))
        .await
        .expect("Timed out waiting for engine state")
        .expect("Engine stopped")
}

/// Wait until every foreground tile is ready or failed and nothing is pending.
pub async fn wait_settled(engine: &SubsamplingEngine) -> Arc<EngineSnapshot> {
    wait_for(engine, |s| {
        s.is_settled() && !s.foreground_tiles.is_empty()
    })
    .await
}

/// Poll `condition` until it holds, failing the test after 5s.
pub async fn poll_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Size helper.
pub fn size(width: u32, height: u32) -> IntSize {
    IntSize::new(width, height)
}
