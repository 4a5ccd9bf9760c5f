use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{trace, warn};

use crate::buffer::BufferPool;
use crate::decode::DecoderPool;
use crate::error::DecodeError;
use crate::tile::{run_decode_job, DecodeJob, DecodeOutcome};

/// Bounded pool of blocking decode workers.
///
/// Every job waits for a permit, then runs on tokio's blocking threads.
/// Jobs submitted before [`WorkerPool::cancel_pending`] that have not
/// started yet are dropped; running ones finish and their results go
/// through the usual staleness check.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
    epoch: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            epoch: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Jobs submitted and not yet reported back.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Drop every job that has not started yet.
    pub fn cancel_pending(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Run `job` on a worker and send its outcome to `results`.
    pub fn submit(
        &self,
        job: DecodeJob,
        decoders: Arc<DecoderPool>,
        buffers: Option<BufferPool>,
        results: mpsc::UnboundedSender<DecodeOutcome>,
    ) {
        let permits = Arc::clone(&self.permits);
        let epoch = Arc::clone(&self.epoch);
        let in_flight = Arc::clone(&self.in_flight);
        let submitted_epoch = epoch.load(Ordering::Acquire);
        in_flight.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
            };

            if epoch.load(Ordering::Acquire) != submitted_epoch {
                trace!(tile = %job.key, "decode cancelled before start");
                in_flight.fetch_sub(1, Ordering::AcqRel);
                return;
            }

            let blocking_job = job.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                run_decode_job(&blocking_job, &decoders, buffers.as_ref())
            })
            .await;

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(tile = %job.key, error = %err, "decode worker panicked");
                    DecodeOutcome::failed(
                        &job,
                        DecodeError::DecodeFailed {
                            reason: format!("decode worker failed: {}", err),
                        },
                    )
                }
            };

            in_flight.fetch_sub(1, Ordering::AcqRel);
            // Receiver gone means the engine shut down; the buffer drops back to its pool
            let _ = results.send(outcome);
        });
    }
}
