//! Engine integration tests.
//!
//! Tests verify:
//! - A viewport settles with every tile of the load rect decoded
//! - Results of superseded viewports never reach the foreground
//! - Pause stops new work and resume catches up with the latest viewport
//! - Unsupported formats are reported without decoding anything
//! - Destroy is terminal and releases decoders and tiles
//! - Per-tile failures stay contained to their tile

use std::sync::Arc;
use std::time::Duration;

use subsampling::decode::{ImageRsDecoderFactory, MemoryImageSource};
use subsampling::engine::{SubsamplingState, ViewportState};
use subsampling::error::{DecodeError, EngineError};
use subsampling::geometry::{IntRect, Orientation};
use subsampling::grid::{SampleSize, TileCoord};
use subsampling::tile::TileState;

use super::test_utils::{
    create_engine, create_gif_header, create_test_jpeg, create_test_png, poll_until, size, test_config, wait_for,
    wait_settled, Gate, MockDecoderFactory,
};

/// A 4000x4000 image laid out at 1000x1000 in a 1000x1000 view gives
/// 500x500 tiles. At scale 4 the full-resolution level is picked and each
/// viewport corner loads a 3x3 block of tiles.
fn source() -> Arc<MemoryImageSource> {
    Arc::new(MemoryImageSource::new("mem://huge.png", vec![0u8; 8]))
}

fn top_left() -> ViewportState {
    ViewportState::new(size(1000, 1000), IntRect::new(0, 0, 250, 250), 4.0)
}

fn bottom_right() -> ViewportState {
    ViewportState::new(size(1000, 1000), IntRect::new(750, 750, 1000, 1000), 4.0)
}

fn cols(snapshot: &subsampling::EngineSnapshot) -> Vec<u32> {
    let mut cols: Vec<u32> = snapshot.foreground_tiles.iter().map(|t| t.coordinate.col).collect();
    cols.sort_unstable();
    cols.dedup();
    cols
}

// =============================================================================
// Loading
// =============================================================================

#[tokio::test]
async fn test_viewport_settles_with_all_tiles_ready() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));

    let info = t.engine.set_image(source(), size(1000, 1000)).await.unwrap();
    assert_eq!((info.width, info.height), (4000, 4000));

    t.engine.set_viewport(top_left()).unwrap();
    let snapshot = wait_settled(&t.engine).await;

    assert_eq!(snapshot.state, SubsamplingState::Active);
    assert_eq!(snapshot.sample_size, Some(SampleSize::ONE));
    assert_eq!(snapshot.image_load_rect, IntRect::new(0, 0, 1500, 1500));
    assert_eq!(snapshot.foreground_tiles.len(), 9);
    assert!(snapshot.foreground_tiles.iter().all(|t| t.is_ready() && t.alpha == 255));
    assert!(snapshot.background_tiles.is_empty());
    assert_eq!(stats.decodes(), 9);
    assert_eq!(snapshot.tile_grid_size_map.get(&SampleSize::ONE), Some(&(8, 8)));

    // Row-major order
    assert_eq!(snapshot.foreground_tiles[0].coordinate, TileCoord::new(0, 0));
    assert_eq!(snapshot.foreground_tiles[1].coordinate, TileCoord::new(1, 0));
    assert_eq!(snapshot.foreground_tiles[3].coordinate, TileCoord::new(0, 1));

    // Tile pixels come from the decoder for that exact rect
    let tile = &snapshot.foreground_tiles[4];
    let buffer = tile.buffer.as_ref().unwrap();
    assert_eq!(buffer.size(), size(500, 500));
    assert_eq!(&buffer.data()[..4], &[(500 % 256) as u8, (500 % 256) as u8, 1, 255]);

    t.engine.destroy().await;
}

#[tokio::test]
async fn test_viewport_before_image_is_planned_on_attach() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let t = create_engine(test_config(), Arc::new(factory));

    t.engine.set_viewport(top_left()).unwrap();
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    let snapshot = wait_settled(&t.engine).await;
    assert_eq!(snapshot.foreground_tiles.len(), 9);
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_at_min_scale_no_tiles_are_loaded() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    let fit = ViewportState::new(size(1000, 1000), IntRect::new(0, 0, 1000, 1000), 1.0);
    t.engine.set_viewport(fit).unwrap();
    let snapshot = wait_for(&t.engine, |s| s.state == SubsamplingState::Active && s.is_settled()).await;

    assert!(snapshot.foreground_tiles.is_empty());
    assert_eq!(snapshot.sample_size, None);
    assert_eq!(stats.decodes(), 0);
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_small_image_does_not_need_subsampling() {
    let factory = MockDecoderFactory::new(800, 600);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(800, 600)).await.unwrap();
    t.engine
        .set_viewport(ViewportState::new(size(800, 600), IntRect::new(0, 0, 200, 150), 4.0))
        .unwrap();

    let snapshot = wait_for(&t.engine, |s| s.state == SubsamplingState::NotNeeded).await;
    assert!(snapshot.foreground_tiles.is_empty());
    assert_eq!(stats.decodes(), 0);
    t.engine.destroy().await;
}

// =============================================================================
// Request currency
// =============================================================================

#[tokio::test]
async fn test_stale_results_are_discarded() {
    let gate = Gate::closed();
    let factory = MockDecoderFactory::new(4000, 4000).with_gate(gate.clone());
    let stats = factory.stats();
    let t = create_engine(test_config().with_decode_workers(2), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    // Tiles of the first viewport are stuck in the decoder
    t.engine.set_viewport(top_left()).unwrap();
    let started = Arc::clone(&stats);
    poll_until(move || started.decodes_started() >= 1).await;

    // Move away, then let every decode finish
    t.engine.set_viewport(bottom_right()).unwrap();
    wait_for(&t.engine, |s| s.image_load_rect.left == 2500).await;
    gate.open();

    let snapshot = wait_for(&t.engine, |s| {
        s.is_settled() && s.foreground_tiles.iter().all(|t| t.is_ready())
    })
    .await;

    assert_eq!(cols(&snapshot), vec![5, 6, 7]);
    assert!(snapshot
        .foreground_tiles
        .iter()
        .all(|t| t.src_rect.left >= 2500 && t.src_rect.top >= 2500));

    // Stale buffers went back to the pool, and were possibly reused by later tiles
    poll_until(|| stats.decodes() > 9).await;
    poll_until(|| {
        let pool = t.buffers.stats();
        pool.hits as usize + pool.pooled_buffers >= 1
    })
    .await;

    t.engine.destroy().await;
}

#[tokio::test]
async fn test_bursts_of_viewports_are_coalesced() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    // A drag across the image, sent faster than the coordinator runs
    for step in 0..=30u32 {
        let offset = step * 25;
        t.engine
            .set_viewport(ViewportState::new(
                size(1000, 1000),
                IntRect::new(offset, offset, offset + 250, offset + 250),
                4.0,
            ))
            .unwrap();
    }

    let snapshot = wait_for(&t.engine, |s| {
        s.image_load_rect.left == 2500 && s.is_settled() && !s.foreground_tiles.is_empty()
    })
    .await;
    assert_eq!(cols(&snapshot), vec![5, 6, 7]);
    // Far fewer decodes than one 3x3 block per step
    assert!(stats.decodes() < 31 * 9);
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_tile_cache_serves_tiles_scrolled_back_into_view() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    t.engine.set_viewport(top_left()).unwrap();
    wait_settled(&t.engine).await;
    t.engine.set_viewport(bottom_right()).unwrap();
    wait_for(&t.engine, |s| s.image_load_rect.left == 2500 && s.is_settled()).await;
    assert_eq!(stats.decodes(), 18);
    assert_eq!(t.cache.len(), 18);

    t.engine.set_viewport(top_left()).unwrap();
    let snapshot = wait_for(&t.engine, |s| s.image_load_rect.left == 0 && s.is_settled()).await;
    assert_eq!(stats.decodes(), 18);
    assert!(snapshot.foreground_tiles.iter().all(|t| t.is_ready() && t.from_cache));

    t.engine.destroy().await;
}

#[tokio::test]
async fn test_disabled_tile_cache_decodes_again() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config().with_memory_cache(false), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    t.engine.set_viewport(top_left()).unwrap();
    wait_settled(&t.engine).await;
    t.engine.set_viewport(bottom_right()).unwrap();
    wait_for(&t.engine, |s| s.image_load_rect.left == 2500 && s.is_settled()).await;
    t.engine.set_viewport(top_left()).unwrap();
    wait_for(&t.engine, |s| s.image_load_rect.left == 0 && s.is_settled()).await;

    assert_eq!(stats.decodes(), 27);
    assert!(t.cache.is_empty());
    t.engine.destroy().await;
}

// =============================================================================
// Pause / resume
// =============================================================================

#[tokio::test]
async fn test_pause_blocks_new_work_and_resume_refreshes() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    t.engine.set_viewport(top_left()).unwrap();
    wait_settled(&t.engine).await;
    assert_eq!(stats.decodes(), 9);

    t.engine.pause().unwrap();
    t.engine.set_viewport(bottom_right()).unwrap();
    wait_for(&t.engine, |s| s.paused).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nothing new was decoded and the old tiles keep rendering
    assert_eq!(stats.decodes(), 9);
    let snapshot = t.engine.snapshot();
    assert_eq!(snapshot.image_load_rect, IntRect::new(0, 0, 1500, 1500));
    assert_eq!(snapshot.ready_tiles().count(), 9);

    t.engine.resume().unwrap();
    let snapshot = wait_for(&t.engine, |s| {
        !s.paused && s.image_load_rect.left == 2500 && s.is_settled()
    })
    .await;
    assert_eq!(cols(&snapshot), vec![5, 6, 7]);
    assert_eq!(snapshot.ready_tiles().count(), 9);
    assert_eq!(stats.decodes(), 18);

    t.engine.destroy().await;
}

#[tokio::test]
async fn test_in_flight_decodes_complete_while_paused() {
    let gate = Gate::closed();
    let factory = MockDecoderFactory::new(4000, 4000).with_gate(gate.clone());
    let stats = factory.stats();
    let config = test_config().with_tile_animation_duration(Duration::from_millis(500));
    let t = create_engine(config, Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    t.engine.set_viewport(top_left()).unwrap();
    let started = Arc::clone(&stats);
    poll_until(move || started.decodes_started() >= 1).await;

    t.engine.pause().unwrap();
    wait_for(&t.engine, |s| s.paused).await;
    gate.open();

    // Results land without a fade-in
    let snapshot = wait_for(&t.engine, |s| s.pending_decodes == 0).await;
    let ready: Vec<_> = snapshot.ready_tiles().collect();
    assert!(!ready.is_empty());
    assert!(ready.iter().all(|t| t.alpha == 255));
    assert!(!snapshot.animating);

    t.engine.destroy().await;
}

// =============================================================================
// Errors
// =============================================================================

#[tokio::test]
async fn test_unsupported_format_is_not_fatal() {
    let factory = MockDecoderFactory::new(4000, 4000).with_mime_type("image/gif");
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));

    let result = t.engine.set_image(source(), size(1000, 1000)).await;
    assert!(matches!(
        result,
        Err(EngineError::Decode(DecodeError::UnsupportedFormat { .. }))
    ));

    t.engine.set_viewport(top_left()).unwrap();
    let snapshot = wait_for(&t.engine, |s| s.state == SubsamplingState::Unsupported).await;
    assert!(matches!(snapshot.error, Some(DecodeError::UnsupportedFormat { .. })));
    assert!(snapshot.foreground_tiles.is_empty());
    assert_eq!(stats.decodes(), 0);
    assert_eq!(stats.live_instances(), 0);

    // The engine stays usable for the next image
    assert!(!t.engine.is_destroyed());
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_gif_bytes_are_unsupported_with_reference_decoder() {
    let t = create_engine(test_config(), Arc::new(ImageRsDecoderFactory::new()));
    let gif = Arc::new(MemoryImageSource::new("mem://anim.gif", create_gif_header()));

    let result = t.engine.set_image(gif, size(100, 100)).await;
    assert!(matches!(
        result,
        Err(EngineError::Decode(DecodeError::UnsupportedFormat { .. }))
    ));
    let snapshot = wait_for(&t.engine, |s| s.state == SubsamplingState::Unsupported).await;
    assert!(snapshot.foreground_tiles.is_empty());
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_jpeg_over_whole_decode_limit_keeps_thumbnail_and_png_streams() {
    // 512x512 RGB needs 768KB decoded
    let factory = ImageRsDecoderFactory::new().with_full_decode_limit(Some(64 * 1024));
    let t = create_engine(test_config(), Arc::new(factory));
    let jpeg = Arc::new(MemoryImageSource::new("mem://big.jpg", create_test_jpeg(512, 512, 80)));

    let result = t.engine.set_image(jpeg, size(128, 128)).await;
    assert!(matches!(
        result,
        Err(EngineError::Decode(DecodeError::UnsupportedFormat { .. }))
    ));
    let snapshot = wait_for(&t.engine, |s| s.state == SubsamplingState::Unsupported).await;
    assert!(snapshot.foreground_tiles.is_empty());

    // A PNG of the same size is read by rows and tiles normally
    let png = Arc::new(MemoryImageSource::new("mem://big.png", create_test_png(512, 512)));
    t.engine.set_image(png, size(128, 128)).await.unwrap();
    t.engine
        .set_viewport(ViewportState::new(size(128, 128), IntRect::new(0, 0, 32, 32), 4.0))
        .unwrap();
    let snapshot = wait_settled(&t.engine).await;
    assert_eq!(snapshot.state, SubsamplingState::Active);
    assert!(snapshot.ready_tiles().count() > 0);
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_unreadable_image_fails_then_next_image_loads() {
    let t = create_engine(test_config(), Arc::new(ImageRsDecoderFactory::new()));
    let junk = Arc::new(MemoryImageSource::new("mem://junk", vec![0u8; 64]));

    let result = t.engine.set_image(junk, size(100, 100)).await;
    assert!(matches!(
        result,
        Err(EngineError::Decode(DecodeError::UnreadableSource { .. }))
    ));
    wait_for(&t.engine, |s| s.state == SubsamplingState::Failed).await;

    let png = Arc::new(MemoryImageSource::new("mem://ok.png", create_test_png(1024, 1024)));
    t.engine.set_image(png, size(256, 256)).await.unwrap();
    t.engine
        .set_viewport(ViewportState::new(size(256, 256), IntRect::new(0, 0, 64, 64), 4.0))
        .unwrap();
    let snapshot = wait_settled(&t.engine).await;
    assert_eq!(snapshot.state, SubsamplingState::Active);
    assert!(snapshot.error.is_none());
    t.engine.destroy().await;
}

#[tokio::test]
async fn test_failed_tile_is_contained() {
    let factory = MockDecoderFactory::new(4000, 4000).failing_at(0, 0);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();

    t.engine.set_viewport(top_left()).unwrap();
    let snapshot = wait_settled(&t.engine).await;

    let failed: Vec<_> = snapshot
        .foreground_tiles
        .iter()
        .filter(|t| t.state == TileState::Error)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].coordinate, TileCoord::new(0, 0));
    assert_eq!(snapshot.ready_tiles().count(), 8);
    assert_eq!(snapshot.state, SubsamplingState::Active);
    assert_eq!(stats.failures.load(std::sync::atomic::Ordering::SeqCst), 1);

    // Not retried until the viewport changes
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stats.failures.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The next refresh, a small pan, retries it once
    t.engine
        .set_viewport(ViewportState::new(size(1000, 1000), IntRect::new(10, 10, 260, 260), 4.0))
        .unwrap();
    poll_until(|| stats.failures.load(std::sync::atomic::Ordering::SeqCst) == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stats.failures.load(std::sync::atomic::Ordering::SeqCst), 2);

    // Resume retries it
    t.engine.pause().unwrap();
    t.engine.resume().unwrap();
    poll_until(|| stats.failures.load(std::sync::atomic::Ordering::SeqCst) == 3).await;

    t.engine.destroy().await;
}

// =============================================================================
// Orientation
// =============================================================================

#[tokio::test]
async fn test_rotated_image_is_tiled_as_displayed() {
    // Stored 4000x2000, displayed 2000x4000
    let factory = MockDecoderFactory::new(4000, 2000).with_orientation(Orientation::Rotate90);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(500, 1000)).await.unwrap();

    t.engine
        .set_viewport(ViewportState::new(size(500, 1000), IntRect::new(0, 0, 125, 250), 4.0))
        .unwrap();
    let snapshot = wait_settled(&t.engine).await;

    assert_eq!(snapshot.tile_grid_size_map.get(&SampleSize::ONE), Some(&(8, 8)));
    assert!(snapshot.foreground_tiles.iter().all(|t| t.is_ready()));
    for tile in &snapshot.foreground_tiles {
        let buffer = tile.buffer.as_ref().unwrap();
        assert_eq!(buffer.size(), tile.sample_size.scaled_size(tile.src_rect.size()));
    }
    // The codec only ever saw stored-space rects inside the stored image
    let stored = IntRect::new(0, 0, 4000, 2000);
    assert!(stats
        .requested_rects()
        .iter()
        .all(|rect| stored.contains_rect(rect)));

    t.engine.destroy().await;
}

// =============================================================================
// Destroy
// =============================================================================

#[tokio::test]
async fn test_destroy_releases_everything() {
    let factory = MockDecoderFactory::new(4000, 4000);
    let stats = factory.stats();
    let t = create_engine(test_config(), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();
    t.engine.set_viewport(top_left()).unwrap();
    let snapshot = wait_settled(&t.engine).await;
    drop(snapshot);

    t.engine.destroy().await;

    let snapshot = t.engine.snapshot();
    assert_eq!(snapshot.state, SubsamplingState::Destroyed);
    assert!(snapshot.foreground_tiles.is_empty());
    assert!(snapshot.background_tiles.is_empty());
    assert_eq!(stats.live_instances(), 0);

    assert_eq!(t.engine.set_viewport(top_left()), Err(EngineError::Destroyed));
    assert_eq!(t.engine.resume(), Err(EngineError::Destroyed));
    assert_eq!(
        t.engine.set_image(source(), size(1000, 1000)).await,
        Err(EngineError::Destroyed)
    );
}

#[tokio::test]
async fn test_destroy_with_decodes_in_flight() {
    let factory = MockDecoderFactory::new(4000, 4000).with_delay(Duration::from_millis(20));
    let t = create_engine(test_config().with_decode_workers(1), Arc::new(factory));
    t.engine.set_image(source(), size(1000, 1000)).await.unwrap();
    t.engine.set_viewport(top_left()).unwrap();
    wait_for(&t.engine, |s| s.pending_decodes > 0).await;

    t.engine.destroy().await;
    assert!(t.engine.snapshot().is_destroyed());

    // Running decodes finish on their own; nothing is left once they do
    poll_until(|| t.engine.stats().in_flight_decodes == 0).await;
}
