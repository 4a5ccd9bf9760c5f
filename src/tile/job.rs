use tracing::{debug, warn};

use crate::buffer::{BufferPool, PixelBuffer};
use crate::decode::DecoderPool;
use crate::error::DecodeError;
use crate::geometry::OrientationTransform;
use crate::grid::TileSpec;

use super::state::TileKey;

/// Work item for one tile decode, stamped with the request generation.
#[derive(Debug, Clone)]
pub struct DecodeJob {
    pub key: TileKey,
    pub spec: TileSpec,
    pub generation: u64,
}

/// Result of a [`DecodeJob`], posted back to the tile manager.
#[derive(Debug)]
pub struct DecodeOutcome {
    pub key: TileKey,
    pub generation: u64,
    pub result: Result<PixelBuffer, DecodeError>,
}

impl DecodeOutcome {
    pub fn failed(job: &DecodeJob, error: DecodeError) -> Self {
        Self {
            key: job.key.clone(),
            generation: job.generation,
            result: Err(error),
        }
    }
}

/// Decode one tile. Blocking; runs on a worker thread.
///
/// A buffer is taken from `buffers` for the decoder to write into, the
/// region is decoded, and the orientation is applied to the pixels unless
/// the decoder already did it.
pub fn run_decode_job(job: &DecodeJob, decoders: &DecoderPool, buffers: Option<&BufferPool>) -> DecodeOutcome {
    let result = decode_tile(job, decoders, buffers);
    if let Err(err) = &result {
        debug!(tile = %job.key, generation = job.generation, error = %err, "tile decode failed");
    }
    DecodeOutcome {
        key: job.key.clone(),
        generation: job.generation,
        result,
    }
}

fn decode_tile(
    job: &DecodeJob,
    decoders: &DecoderPool,
    buffers: Option<&BufferPool>,
) -> Result<PixelBuffer, DecodeError> {
    let transform = OrientationTransform::new(decoders.orientation());
    let rotate_pixels = !decoders.bakes_orientation() && !transform.is_identity();

    // Decoders write stored-orientation pixels unless they bake it in
    let output_size = if rotate_pixels {
        transform.apply_to_size(job.spec.decoded_size(), true)
    } else {
        job.spec.decoded_size()
    };

    let reuse = match buffers {
        Some(pool) if !decoders.hardware_backed() => {
            match pool.try_allocate(output_size.width, output_size.height, decoders.pixel_format()) {
                Ok(buffer) => Some(buffer),
                Err(err) => {
                    warn!(tile = %job.key, error = %err, "buffer pool allocation failed, decoder allocates");
                    None
                }
            }
        }
        _ => None,
    };

    let mut decoder = decoders.checkout()?;
    let buffer = match decoder.decode_region(
        &job.key.image_key,
        job.spec.src_rect,
        job.spec.sample_size,
        reuse,
    ) {
        Ok(buffer) => buffer,
        Err(err) => {
            if matches!(err, DecodeError::DecodeFailed { .. }) {
                decoder.discard();
            }
            return Err(err);
        }
    };
    drop(decoder);

    if rotate_pixels {
        Ok(transform.apply_to_pixels(buffer, false))
    } else {
        Ok(buffer)
    }
}
