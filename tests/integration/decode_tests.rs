//! Region decode integration tests.
//!
//! Tests verify:
//! - The reference decoder reads PNG and JPEG files through a decoder pool
//! - Concurrent checkouts each get their own decoder instance
//! - Pooled buffers are reused across decodes
//! - Closing a pool stops further decodes

use std::sync::Arc;

use subsampling::buffer::{BufferPool, PixelFormat};
use subsampling::decode::{
    DecoderFactory, DecoderPool, FileImageSource, FormatSupport, ImageInfo, ImageRsDecoderFactory,
    ImageSource, MemoryImageSource,
};
use subsampling::error::DecodeError;
use subsampling::geometry::IntRect;
use subsampling::grid::SampleSize;

use super::test_utils::{create_gif_header, create_test_jpeg, create_test_png, write_temp_file};

fn factory() -> Arc<dyn DecoderFactory> {
    Arc::new(ImageRsDecoderFactory::new())
}

fn memory_source(key: &str, bytes: Vec<u8>) -> Arc<dyn ImageSource> {
    Arc::new(MemoryImageSource::new(key, bytes))
}

// =============================================================================
// Opening
// =============================================================================

#[test]
fn test_png_file_round_trip() {
    let path = write_temp_file("decode-file.png", &create_test_png(640, 480));
    let source: Arc<dyn ImageSource> = Arc::new(FileImageSource::new(&path));

    let pool = DecoderPool::open(factory(), source).unwrap();
    assert_eq!(pool.image_info(), &ImageInfo::new(640, 480, "image/png"));
    assert!(pool.key().starts_with("file://"));
    assert_eq!(pool.pixel_format(), PixelFormat::Rgba8);

    let buffer = {
        let mut decoder = pool.checkout().unwrap();
        decoder
            .decode_region(pool.key(), IntRect::new(300, 200, 556, 456), SampleSize::ONE, None)
            .unwrap()
    };
    assert_eq!((buffer.width(), buffer.height()), (256, 256));
    assert_eq!(&buffer.data()[..4], &[44, 200, 128, 255]);

    let _ = std::fs::remove_file(path);
}

#[test]
fn test_missing_file_is_unreadable() {
    let source: Arc<dyn ImageSource> =
        Arc::new(FileImageSource::new("/nonexistent/subsampling/photo.png"));
    let result = DecoderPool::open(factory(), source);
    assert!(matches!(result, Err(DecodeError::UnreadableSource { .. })));
}

#[test]
fn test_gif_is_rejected_before_decoding() {
    let result = DecoderPool::open(factory(), memory_source("mem://anim.gif", create_gif_header()));
    assert_eq!(
        result.err(),
        Some(DecodeError::UnsupportedFormat {
            mime_type: "image/gif".to_string()
        })
    );
}

#[test]
fn test_factory_support_table() {
    let factory = ImageRsDecoderFactory::new();
    assert_eq!(factory.check_support("image/jpeg"), FormatSupport::Supported);
    assert_eq!(factory.check_support("IMAGE/PNG"), FormatSupport::Supported);
    assert_eq!(factory.check_support("image/gif"), FormatSupport::Unsupported);
    assert_eq!(factory.check_support("image/x-unknown"), FormatSupport::Unknown);
}

#[test]
fn test_probe_matches_open() {
    let source = MemoryImageSource::new("mem://probe.jpg", create_test_jpeg(333, 222, 85));
    let factory = ImageRsDecoderFactory::new();
    let (probed, _) = factory.probe(&source).unwrap();
    let decoder = factory.open(&source).unwrap();
    assert_eq!(&probed, decoder.image_info());
    assert_eq!(probed.mime_type, "image/jpeg");
}

// =============================================================================
// Decoding
// =============================================================================

#[test]
fn test_jpeg_subsampled_region() {
    let pool = DecoderPool::open(factory(), memory_source("mem://photo.jpg", create_test_jpeg(512, 512, 90))).unwrap();
    let mut decoder = pool.checkout().unwrap();

    let sample = SampleSize::new(8).unwrap();
    let buffer = decoder
        .decode_region(pool.key(), IntRect::new(0, 0, 512, 300), sample, None)
        .unwrap();
    // 300 / 8 rounds up
    assert_eq!((buffer.width(), buffer.height()), (64, 38));
    assert_eq!(buffer.format(), PixelFormat::Rgba8);
    assert!(buffer.data().chunks_exact(4).all(|pixel| pixel[3] == 255));
}

#[test]
fn test_concurrent_checkouts_use_separate_instances() {
    let pool = DecoderPool::open(factory(), memory_source("mem://shared.png", create_test_png(512, 512))).unwrap();

    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4u32)
            .map(|i| {
                let pool = &pool;
                scope.spawn(move || {
                    let mut decoder = pool.checkout().unwrap();
                    let rect = IntRect::new(i * 128, 0, (i + 1) * 128, 128);
                    let buffer = decoder
                        .decode_region(pool.key(), rect, SampleSize::ONE, None)
                        .unwrap();
                    (i, buffer.data()[0])
                })
            })
            .collect();

        for handle in handles {
            let (i, red) = handle.join().unwrap();
            assert_eq!(red as u32, (i * 128) % 256);
        }
    });

    // Everything was returned, up to the idle limit
    assert!(pool.idle_count() >= 1);
}

#[test]
fn test_decode_into_pooled_buffer() {
    let pool = DecoderPool::open(factory(), memory_source("mem://pooled.png", create_test_png(256, 256))).unwrap();
    let buffers = BufferPool::with_capacity(4 * 1024 * 1024);

    let first = {
        let reuse = buffers.allocate(64, 64, PixelFormat::Rgba8);
        let mut decoder = pool.checkout().unwrap();
        decoder
            .decode_region(pool.key(), IntRect::new(0, 0, 64, 64), SampleSize::ONE, Some(reuse))
            .unwrap()
    };
    assert!(first.is_pooled());
    drop(first);
    assert_eq!(buffers.len(), 1);

    let reuse = buffers.acquire(64, 64, PixelFormat::Rgba8);
    assert!(reuse.is_some());
    let second = {
        let mut decoder = pool.checkout().unwrap();
        decoder
            .decode_region(pool.key(), IntRect::new(64, 64, 128, 128), SampleSize::ONE, reuse)
            .unwrap()
    };
    assert_eq!(&second.data()[..4], &[64, 64, 128, 255]);
    assert_eq!(buffers.stats().hits, 1);
}

#[test]
fn test_png_regions_need_no_whole_decode_budget() {
    let factory: Arc<dyn DecoderFactory> =
        Arc::new(ImageRsDecoderFactory::new().with_full_decode_limit(Some(1)));
    let pool = DecoderPool::open(Arc::clone(&factory), memory_source("mem://tight.png", create_test_png(640, 480)))
        .unwrap();
    let mut decoder = pool.checkout().unwrap();
    let buffer = decoder
        .decode_region(pool.key(), IntRect::new(600, 440, 640, 480), SampleSize::new(2).unwrap(), None)
        .unwrap();
    assert_eq!((buffer.width(), buffer.height()), (20, 20));
    // Mean of x 600..602 is 88.5 after wrapping at 256, y 440..442 is 184.5
    assert_eq!(&buffer.data()[..4], &[88, 184, 128, 255]);

    let jpeg = DecoderPool::open(factory, memory_source("mem://tight.jpg", create_test_jpeg(64, 64, 90)));
    assert_eq!(
        jpeg.err(),
        Some(DecodeError::UnsupportedFormat {
            mime_type: "image/jpeg".to_string()
        })
    );
}

#[test]
fn test_closed_pool_rejects_checkouts() {
    let pool = DecoderPool::open(factory(), memory_source("mem://closed.png", create_test_png(32, 32))).unwrap();
    pool.close_all();
    assert!(pool.is_closed());
    assert_eq!(pool.idle_count(), 0);
    assert!(matches!(pool.checkout(), Err(DecodeError::DecodeFailed { .. })));
}
