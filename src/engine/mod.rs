//! Engine facade.
//!
//! The [`SubsamplingEngine`] wires the tile manager, the decode workers
//! and the shared pools together, and publishes an [`EngineSnapshot`]
//! after every change.
//!
//! # Architecture
//!
//! ```text
//!  set_image / set_viewport / pause / resume / destroy
//!                      │
//!                      │ Command (mpsc, viewports coalesced)
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │            Coordinator task                 │
//! │  ┌─────────────┐        ┌───────────────┐   │
//! │  │ TileManager │──jobs─►│  WorkerPool   │───┼──► spawn_blocking
//! │  └─────────────┘        └───────────────┘   │        │
//! │         ▲                                   │        │ DecodeOutcome
//! │         └───────── apply_result ◄───────────┼────────┘
//! │                                             │
//! │  animation ticks (only while fading)        │
//! └──────────────────────┬──────────────────────┘
//!                        │ watch (Arc<EngineSnapshot>)
//!                        ▼
//!                     renderer
//! ```
//!
//! All tile state lives in the coordinator task; callers only ever see
//! snapshots. Decoders, buffers and cached tiles are the only things
//! touched from worker threads.

mod snapshot;
mod viewport;
mod worker;

pub use snapshot::{EngineSnapshot, EngineStats, SubsamplingState};
pub use viewport::{ContinuousTransformType, ContinuousTransformTypes, ViewportState};
pub use worker::WorkerPool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::buffer::BufferPool;
use crate::config::EngineConfig;
use crate::decode::{DecoderFactory, DecoderPool, ImageInfo, ImageSource};
use crate::error::{DecodeError, EngineError};
use crate::geometry::IntSize;
use crate::tile::{DecodeOutcome, RefreshOutcome, TileCache, TileManager};

// =============================================================================
// Commands
// =============================================================================

enum Command {
    Attach {
        decoders: Arc<DecoderPool>,
        content_size: IntSize,
        done: oneshot::Sender<()>,
    },
    ImageFailed {
        key: Arc<str>,
        error: DecodeError,
    },
    Viewport(ViewportState),
    Pause,
    Resume,
    Destroy,
}

/// Keep only the last of every run of consecutive viewport updates.
fn coalesce(batch: Vec<Command>) -> Vec<Command> {
    let mut commands: Vec<Command> = Vec::with_capacity(batch.len());
    for command in batch {
        if matches!(command, Command::Viewport(_))
            && matches!(commands.last(), Some(Command::Viewport(_)))
        {
            commands.pop();
        }
        commands.push(command);
    }
    commands
}

// =============================================================================
// SubsamplingEngine
// =============================================================================

/// Subsampling tile engine for one view.
///
/// Must be created inside a Tokio runtime. The buffer pool and tile cache
/// are injected so several engines can share them.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use subsampling::buffer::BufferPool;
/// use subsampling::config::EngineConfig;
/// use subsampling::decode::{FileImageSource, ImageRsDecoderFactory};
/// use subsampling::engine::{SubsamplingEngine, ViewportState};
/// use subsampling::geometry::{IntRect, IntSize};
/// use subsampling::tile::TileCache;
///
/// # async fn run() -> Result<(), subsampling::error::EngineError> {
/// let engine = SubsamplingEngine::new(
///     EngineConfig::default(),
///     Arc::new(ImageRsDecoderFactory::new()),
///     BufferPool::new(),
///     Arc::new(TileCache::new()),
/// )?;
///
/// let info = engine
///     .set_image(Arc::new(FileImageSource::new("huge.jpg")), IntSize::new(1080, 720))
///     .await?;
/// println!("{}x{}", info.width, info.height);
///
/// engine.set_viewport(ViewportState::new(
///     IntSize::new(1080, 720),
///     IntRect::new(0, 0, 540, 360),
///     2.0,
/// ))?;
/// let snapshot = engine.wait_for(|s| s.is_settled()).await?;
/// println!("{} tiles", snapshot.foreground_tiles.len());
/// # Ok(())
/// # }
/// ```
pub struct SubsamplingEngine {
    config: EngineConfig,
    factory: Arc<dyn DecoderFactory>,
    buffers: BufferPool,
    cache: Arc<TileCache>,
    workers: WorkerPool,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Arc<EngineSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SubsamplingEngine {
    /// Validate `config` and start the coordinator task.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] if validation fails or no Tokio
    /// runtime is running.
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn DecoderFactory>,
        buffers: BufferPool,
        cache: Arc<TileCache>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidConfig)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| EngineError::InvalidConfig(format!("no Tokio runtime: {}", err)))?;

        let workers = WorkerPool::new(config.decode_workers);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (results, result_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(EngineSnapshot::default()));

        let coordinator = Coordinator {
            manager: TileManager::new(
                &config,
                config.memory_cache_enabled.then(|| Arc::clone(&cache)),
            ),
            decoders: None,
            buffers: config.buffer_reuse_enabled.then(|| buffers.clone()),
            image_buffers: None,
            workers: workers.clone(),
            results,
            snapshots: snapshot_tx,
            viewport: None,
            image_error: None,
            frame_interval: config.frame_interval,
        };
        let task = runtime.spawn(coordinator.run(command_rx, result_rx));

        debug!(
            workers = workers.workers(),
            memory_cache = config.memory_cache_enabled,
            buffer_reuse = config.buffer_reuse_enabled,
            "subsampling engine started"
        );

        Ok(Self {
            config,
            factory,
            buffers,
            cache,
            workers,
            commands,
            snapshots,
            task: Mutex::new(Some(task)),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open `source` and make it the current image.
    ///
    /// `content_size` is the size at which the thumbnail is laid out. When
    /// it returns, the image is attached and the latest viewport, if any,
    /// has been planned against it.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Decode`] if the image cannot be opened or its
    ///   format has no region decode; the snapshot reports the failure too
    /// - [`EngineError::Destroyed`] after [`SubsamplingEngine::destroy`]
    pub async fn set_image(
        &self,
        source: Arc<dyn ImageSource>,
        content_size: IntSize,
    ) -> Result<ImageInfo, EngineError> {
        self.ensure_alive()?;
        let key: Arc<str> = Arc::from(source.key());
        let factory = Arc::clone(&self.factory);

        let opened = tokio::task::spawn_blocking(move || DecoderPool::open(factory, source))
            .await
            .map_err(|err| DecodeError::DecodeFailed {
                reason: format!("opening decoder failed: {}", err),
            })
            .and_then(|opened| opened);

        match opened {
            Ok(decoders) => {
                let info = decoders.image_info().clone();
                let (done, attached) = oneshot::channel();
                self.send(Command::Attach {
                    decoders: Arc::new(decoders),
                    content_size,
                    done,
                })?;
                attached.await.map_err(|_| EngineError::Destroyed)?;
                Ok(info)
            }
            Err(error) => {
                match &error {
                    DecodeError::UnsupportedFormat { .. } => {
                        info!(image = %key, error = %error, "subsampling not supported for image")
                    }
                    _ => warn!(image = %key, error = %error, "failed to open image"),
                }
                self.send(Command::ImageFailed {
                    key,
                    error: error.clone(),
                })?;
                Err(EngineError::Decode(error))
            }
        }
    }

    /// Report a new viewport. Bursts are coalesced; only the latest state
    /// of a burst is planned.
    pub fn set_viewport(&self, viewport: ViewportState) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.send(Command::Viewport(viewport))
    }

    /// Stop submitting decodes. Tiles on screen stay.
    pub fn pause(&self) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.send(Command::Pause)
    }

    /// Resume and plan the last viewport again.
    pub fn resume(&self) -> Result<(), EngineError> {
        self.ensure_alive()?;
        self.send(Command::Resume)
    }

    /// Cancel pending decodes, release every tile and stop the coordinator.
    /// Idempotent; every later call fails with [`EngineError::Destroyed`].
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.workers.cancel_pending();
        let _ = self.commands.send(Command::Destroy);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "coordinator task ended abnormally");
            }
        }
        info!("subsampling engine destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// The latest published state.
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Destroyed`] if the engine stops before that happens.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&EngineSnapshot) -> bool,
    ) -> Result<Arc<EngineSnapshot>, EngineError> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| EngineError::Destroyed)?;
        Ok(Arc::clone(&snapshot))
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            buffer_pool: self.buffers.stats(),
            tile_cache_entries: self.cache.len(),
            tile_cache_bytes: self.cache.size(),
            tile_cache_capacity: self.cache.capacity(),
            in_flight_decodes: self.workers.in_flight(),
        }
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.is_destroyed() {
            Err(EngineError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), EngineError> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::Destroyed)
    }
}

impl Drop for SubsamplingEngine {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.workers.cancel_pending();
            let _ = self.commands.send(Command::Destroy);
        }
    }
}

impl std::fmt::Debug for SubsamplingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsamplingEngine")
            .field("workers", &self.workers.workers())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct Coordinator {
    manager: TileManager,
    decoders: Option<Arc<DecoderPool>>,
    /// Pool handed to jobs when reuse is enabled
    buffers: Option<BufferPool>,
    /// Pool for the current image; `None` for hardware-backed decoders
    image_buffers: Option<BufferPool>,
    workers: WorkerPool,
    results: mpsc::UnboundedSender<DecodeOutcome>,
    snapshots: watch::Sender<Arc<EngineSnapshot>>,
    /// Kept across image switches so a new image is planned right away
    viewport: Option<ViewportState>,
    image_error: Option<DecodeError>,
    frame_interval: Duration,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut results: mpsc::UnboundedReceiver<DecodeOutcome>,
    ) {
        let mut ticker = tokio::time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let animating = self.manager.has_running_animations();
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.shutdown();
                        break;
                    };
                    let mut batch = vec![command];
                    while let Ok(next) = commands.try_recv() {
                        batch.push(next);
                    }
                    if !self.handle_batch(batch) {
                        break;
                    }
                }
                Some(outcome) = results.recv() => {
                    let now = Instant::now();
                    let mut changed = self.manager.apply_result(outcome, now);
                    while let Ok(outcome) = results.try_recv() {
                        changed |= self.manager.apply_result(outcome, now);
                    }
                    // Released background tiles or retried levels may need work
                    self.dispatch();
                    if changed {
                        self.publish();
                    }
                }
                _ = ticker.tick(), if animating => {
                    if self.manager.advance_animations(Instant::now()) {
                        self.publish();
                    }
                }
            }
        }
        trace!("coordinator stopped");
    }

    /// Returns `false` once the engine is destroyed.
    fn handle_batch(&mut self, batch: Vec<Command>) -> bool {
        for command in coalesce(batch) {
            match command {
                Command::Attach {
                    decoders,
                    content_size,
                    done,
                } => {
                    self.attach(decoders, content_size);
                    let _ = done.send(());
                }
                Command::ImageFailed { key, error } => {
                    self.release_image();
                    self.manager.detach();
                    debug!(image = %key, error = %error, "image failed");
                    self.image_error = Some(error);
                }
                Command::Viewport(viewport) => {
                    let outcome = self.manager.refresh(&viewport);
                    trace!(?outcome, "viewport refreshed");
                    self.viewport = Some(viewport);
                }
                Command::Pause => {
                    self.manager.pause();
                }
                Command::Resume => {
                    if let Some(outcome) = self.manager.resume() {
                        trace!(?outcome, "resumed");
                    }
                }
                Command::Destroy => {
                    self.shutdown();
                    return false;
                }
            }
        }
        self.dispatch();
        self.publish();
        true
    }

    fn attach(&mut self, decoders: Arc<DecoderPool>, content_size: IntSize) {
        self.release_image();
        self.image_error = None;
        self.image_buffers = if decoders.hardware_backed() {
            debug!(image = %decoders.key(), "hardware-backed decoder, buffer reuse disabled");
            None
        } else {
            self.buffers.clone()
        };
        self.manager.attach(
            Arc::clone(decoders.key()),
            decoders.image_info().clone(),
            decoders.orientation(),
            content_size,
        );
        self.decoders = Some(decoders);

        if let Some(viewport) = self.viewport.clone() {
            if let RefreshOutcome::Planned { queued, .. } = self.manager.refresh(&viewport) {
                trace!(queued, "planned new image");
            }
        }
    }

    /// Drop the current image's decoders; running jobs keep their own handle.
    fn release_image(&mut self) {
        self.workers.cancel_pending();
        if let Some(decoders) = self.decoders.take() {
            decoders.close_all();
        }
        self.image_buffers = None;
    }

    fn dispatch(&mut self) {
        let Some(decoders) = self.decoders.as_ref() else {
            return;
        };
        let jobs = self.manager.drain_jobs();
        if jobs.is_empty() {
            return;
        }
        trace!(jobs = jobs.len(), "dispatching decode jobs");
        for job in jobs {
            self.workers.submit(
                job,
                Arc::clone(decoders),
                self.image_buffers.clone(),
                self.results.clone(),
            );
        }
    }

    fn publish(&self) {
        let snapshot = EngineSnapshot::capture(
            &self.manager,
            self.image_error.as_ref(),
            self.manager.is_paused(),
        );
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    fn shutdown(&mut self) {
        self.release_image();
        self.manager.destroy();
        self.publish();
    }
}
