//! Subsampling - inspect huge images and render viewports tile by tile.
//!
//! This binary drives the library the way a viewer would: it lays the
//! image out in a viewport, asks the engine for the tiles of one zoomed
//! view and composites them into a PNG.

use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbaImage;
use serde::Serialize;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use subsampling::{
    config::{Cli, Command, EngineArgs, InspectConfig, RenderConfig},
    grid::{calculate_tile_grid_map, can_use_subsampling, preferred_tile_size},
    BufferPool, DecodeError, DecoderFactory, EngineSnapshot, FileImageSource, FormatSupport,
    ImageInfo, ImageRsDecoderFactory, IntOffset, IntRect, IntSize, Orientation,
    OrientationTransform, PixelFormat, SampleSize, SubsamplingEngine, SubsamplingState,
    TileCache, TileGridSizeMap, ViewportState,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Inspect(config) => run_inspect(config).await,
        Command::Render(config) => run_render(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "subsampling=debug"
    } else {
        "subsampling=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Read image info and orientation from the file header.
async fn probe(path: &Path) -> Result<(ImageInfo, Orientation), DecodeError> {
    let source = FileImageSource::new(path);
    tokio::task::spawn_blocking(move || ImageRsDecoderFactory::new().probe(&source))
        .await
        .map_err(|e| DecodeError::Io(e.to_string()))?
}

fn tile_size_for(args: &EngineArgs) -> IntSize {
    args.tile_size
        .unwrap_or_else(|| preferred_tile_size(args.viewport))
}

// =============================================================================
// Inspect Command
// =============================================================================

#[derive(Debug, Serialize)]
struct InspectReport {
    path: String,
    info: ImageInfo,
    orientation: u16,
    display_size: IntSize,
    support: FormatSupport,
    viewport: IntSize,
    content_size: IntSize,
    subsampling: bool,
    tile_size: IntSize,
    grid: Vec<GridLevel>,
}

#[derive(Debug, Serialize)]
struct GridLevel {
    sample_size: SampleSize,
    cols: u32,
    rows: u32,
}

async fn run_inspect(config: InspectConfig) -> ExitCode {
    if config.engine.verbose {
        init_logging(true);
    }

    if let Err(e) = config.engine.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let (info, orientation) = match probe(&config.path).await {
        Ok(probed) => probed,
        Err(e) => {
            eprintln!("Error: {}: {}", config.path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let display_size = OrientationTransform::new(orientation).apply_to_size(info.size(), false);
    let content_size = display_size.fit_within(config.engine.viewport);
    let tile_size = tile_size_for(&config.engine);
    let engine_config = config.engine.engine_config();
    let grid = calculate_tile_grid_map(display_size, tile_size, engine_config.max_grid_size);

    let report = InspectReport {
        path: config.path.display().to_string(),
        support: ImageRsDecoderFactory::new().check_support(&info.mime_type),
        orientation: orientation.exif_code(),
        display_size,
        viewport: config.engine.viewport,
        content_size,
        subsampling: can_use_subsampling(display_size, content_size),
        tile_size,
        grid: grid_levels(&grid.grid_size_map()),
        info,
    };

    if config.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    print_report(&report);
    ExitCode::SUCCESS
}

fn grid_levels(map: &TileGridSizeMap) -> Vec<GridLevel> {
    map.iter()
        .rev()
        .map(|(sample_size, (cols, rows))| GridLevel {
            sample_size: *sample_size,
            cols: *cols,
            rows: *rows,
        })
        .collect()
}

fn print_report(report: &InspectReport) {
    println!("Image: {}", report.path);
    println!("═════════════════════════════════");
    println!("  Format:       {}", report.info.mime_type);
    println!("  Stored size:  {}x{}", report.info.width, report.info.height);
    println!("  Orientation:  {}", report.orientation);
    println!("  Display size: {}", report.display_size);
    match report.support {
        FormatSupport::Supported => println!("✓ Region decode: supported"),
        FormatSupport::Unknown => println!("? Region decode: unknown format, will be attempted"),
        FormatSupport::Unsupported => println!("✗ Region decode: unsupported"),
    }
    println!();
    println!("Viewport {} (content {})", report.viewport, report.content_size);
    if report.subsampling {
        println!("✓ Subsampling: needed");
    } else {
        println!("✗ Subsampling: not needed, the thumbnail is enough");
    }
    println!();
    println!("Tile pyramid (tile size {}):", report.tile_size);
    println!("─────────────────");
    let total: u64 = report
        .grid
        .iter()
        .map(|level| level.cols as u64 * level.rows as u64)
        .sum();
    for level in &report.grid {
        println!(
            "  {:>5}: {}x{} ({} tiles)",
            level.sample_size.to_string(),
            level.cols,
            level.rows,
            level.cols as u64 * level.rows as u64
        );
    }
    println!();
    println!("Total: {} level(s), {} tile(s)", report.grid.len(), total);
}

// =============================================================================
// Render Command
// =============================================================================

async fn run_render(config: RenderConfig) -> ExitCode {
    init_logging(config.engine.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let (info, orientation) = match probe(&config.path).await {
        Ok(probed) => probed,
        Err(e) => {
            error!("Failed to read {}: {}", config.path.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let display_size = OrientationTransform::new(orientation).apply_to_size(info.size(), false);
    let content_size = display_size.fit_within(config.engine.viewport);

    let engine_config = config.engine.engine_config();
    let engine = match SubsamplingEngine::new(
        engine_config.clone(),
        Arc::new(config.engine.decoder_factory()),
        BufferPool::with_capacity(engine_config.buffer_pool_capacity),
        Arc::new(TileCache::with_capacity(engine_config.tile_cache_capacity)),
    ) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        "Rendering {} ({} as displayed) at {}x around {:.2},{:.2}",
        config.path.display(),
        display_size,
        config.scale,
        config.focus.0,
        config.focus.1
    );

    let started = Instant::now();
    let source = Arc::new(FileImageSource::new(&config.path));
    if let Err(e) = engine.set_image(source, content_size).await {
        error!("Failed to open {}: {}", config.path.display(), e);
        engine.destroy().await;
        return ExitCode::FAILURE;
    }

    let viewport = ViewportState::focused(config.engine.viewport, content_size, config.scale, config.focus);
    if let Err(e) = engine.set_viewport(viewport) {
        error!("Failed to set viewport: {}", e);
        return ExitCode::FAILURE;
    }

    let timeout = Duration::from_millis(config.timeout_ms);
    let snapshot = match tokio::time::timeout(
        timeout,
        engine.wait_for(|s| s.state != SubsamplingState::Idle && s.is_settled()),
    )
    .await
    {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => {
            error!("Engine stopped: {}", e);
            return ExitCode::FAILURE;
        }
        Err(_) => {
            warn!("Timed out after {:?}, writing the tiles loaded so far", timeout);
            engine.snapshot()
        }
    };

    let stats = engine.stats();
    info!(
        "Loaded {} tile(s) at sample size {} in {:?}",
        snapshot.ready_tiles().count(),
        snapshot
            .sample_size
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
        started.elapsed()
    );
    if let Ok(json) = serde_json::to_string(&stats) {
        info!("Stats: {}", json);
    }

    let result = match snapshot.state {
        SubsamplingState::Active => write_composite(&snapshot, &config.output),
        other => Err(format!("nothing to render, engine state is {:?}", other)),
    };
    engine.destroy().await;

    match result {
        Ok(size) => {
            info!("Wrote {} ({})", config.output.display(), size);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Composite the ready foreground tiles at the current sample size and save
/// the result. The canvas covers the union of the tiles.
fn write_composite(snapshot: &EngineSnapshot, output: &Path) -> Result<IntSize, String> {
    let sample_size = snapshot
        .sample_size
        .ok_or_else(|| "no tiles planned for this viewport".to_string())?;
    let bounds = snapshot
        .ready_tiles()
        .map(|tile| tile.src_rect)
        .reduce(|a, b| {
            IntRect::new(
                a.left.min(b.left),
                a.top.min(b.top),
                a.right.max(b.right),
                a.bottom.max(b.bottom),
            )
        })
        .ok_or_else(|| "no tile finished decoding".to_string())?;
    let size = sample_size.scaled_size(bounds.size());

    let mut canvas = RgbaImage::new(size.width, size.height);
    for tile in snapshot.ready_tiles() {
        let Some(buffer) = tile.buffer.as_ref() else {
            continue;
        };
        if buffer.format() != PixelFormat::Rgba8 {
            warn!("Skipping tile {:?} in {:?}", tile.coordinate, buffer.format());
            continue;
        }
        let Some(pixels) = RgbaImage::from_raw(buffer.width(), buffer.height(), buffer.data().to_vec()) else {
            continue;
        };
        let relative = IntRect::new(
            tile.src_rect.left - bounds.left,
            tile.src_rect.top - bounds.top,
            tile.src_rect.right - bounds.left,
            tile.src_rect.bottom - bounds.top,
        );
        let offset = IntOffset::of_scaled_rect(&relative, sample_size.get());
        image::imageops::overlay(&mut canvas, &pixels, offset.x as i64, offset.y as i64);
    }

    canvas
        .save(output)
        .map_err(|e| format!("Failed to write {}: {}", output.display(), e))?;
    Ok(size)
}
