//! ELIC Image Decoder
//!
//! The decoder never sees the original latent. It reads the side information
//! first (its shape travels with the record), derives the hyper priors, and
//! then decodes the slices in order, anchor pass before non-anchor pass.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let record = BitstreamRecord::from_bytes(&std::fs::read("image.elic")?)?;
//! let mut decoder = ElicDecoder::new(model);
//! let image = decoder.decompress(&record)?;
//! ```

use std::sync::Arc;

use ndarray::Array4;
use tracing::info;

use super::bitstream::BitstreamRecord;
use super::config::ElicConfig;
use super::error::ElicError;
use super::model::ElicModel;
use super::profiler::{stages, timed, Profiler};

/// Decoder statistics
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    /// Decompress calls that succeeded
    pub calls: u64,
    /// Images decoded (batch items)
    pub images_decoded: u64,
    /// String bytes consumed
    pub total_bytes: u64,
}

/// Latent grid `(batch, h, w)` described by a record's header
///
/// Both the side-information grid and the latent grid must stay within
/// `max_latent_elements`.
fn latent_grid(
    record: &BitstreamRecord,
    config: &ElicConfig,
) -> Result<(usize, usize, usize), ElicError> {
    let (zh, zw) = record.shape;
    let limit = config.max_latent_elements;
    let oversized = || {
        ElicError::invalid_header(format!(
            "batch {} with side-information shape {}x{} exceeds {} latent elements",
            record.batch, zh, zw, limit
        ))
    };

    let h = zh.checked_mul(config.hyper_factor).ok_or_else(oversized)?;
    let w = zw.checked_mul(config.hyper_factor).ok_or_else(oversized)?;
    let elements = |channels: usize, h: usize, w: usize| {
        record
            .batch
            .checked_mul(channels)
            .and_then(|n| n.checked_mul(h))
            .and_then(|n| n.checked_mul(w))
            .filter(|&n| n <= limit)
    };
    elements(config.n, zh, zw).ok_or_else(oversized)?;
    elements(config.m, h, w).ok_or_else(oversized)?;

    Ok((record.batch, h, w))
}

/// Record to latent / image decoder
pub struct ElicDecoder {
    model: Arc<ElicModel>,
    profiler: Option<Profiler>,
    stats: DecoderStats,
}

impl ElicDecoder {
    /// Create a decoder over a shared model
    pub fn new(model: Arc<ElicModel>) -> Self {
        ElicDecoder {
            model,
            profiler: None,
            stats: DecoderStats::default(),
        }
    }

    /// Record stage timings into `profiler`
    pub fn with_profiler(mut self, profiler: Profiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// The model
    pub fn model(&self) -> &ElicModel {
        &self.model
    }

    /// The profiler, if any
    pub fn profiler(&self) -> Option<&Profiler> {
        self.profiler.as_ref()
    }

    /// Get decoding statistics
    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Decode a record to images, clamped to `[0, 1]`
    pub fn decompress(&mut self, record: &BitstreamRecord) -> Result<Array4<f32>, ElicError> {
        let y_hat = self.decompress_latent(record)?;
        let model = Arc::clone(&self.model);
        let x_hat = timed(self.profiler.as_mut(), stages::Y_DEC, || {
            model.synthesis(&y_hat.view())
        })?;
        Ok(x_hat.mapv(|v| v.clamp(0.0, 1.0)))
    }

    /// Decode a record to the latent grid
    pub fn decompress_latent(&mut self, record: &BitstreamRecord) -> Result<Array4<f32>, ElicError> {
        let model = Arc::clone(&self.model);
        let config = model.config();
        let (slices, side) = record.disassemble(config.num_slices())?;
        let expected = latent_grid(record, config)?;

        let bottleneck = model.bottleneck();
        let z_hat = timed(self.profiler.as_mut(), stages::ENTROPY_DECODE, || {
            bottleneck.decompress(&side, record.batch, record.shape)
        })?;
        let priors = timed(self.profiler.as_mut(), stages::Z_DEC, || {
            model.hyper_priors(&z_hat.view())
        })?;

        if priors.grid() != expected {
            let (b, h, w) = priors.grid();
            return Err(ElicError::shape_mismatch(
                "latent grid from side-information shape",
                &[expected.0, expected.1, expected.2],
                &[b, h, w],
            ));
        }

        let y_hat = match self.profiler.as_mut() {
            Some(profiler) => model
                .engine()
                .with_profiler(profiler)
                .decode_latent(&slices, &priors)?,
            None => model.engine().decode_latent(&slices, &priors)?,
        };

        let bytes = record.payload_len();
        info!(
            batch = record.batch,
            shape = ?y_hat.dim(),
            bytes,
            "decompressed latent"
        );

        self.stats.calls += 1;
        self.stats.images_decoded += record.batch as u64;
        self.stats.total_bytes += bytes as u64;

        Ok(y_hat)
    }
}

impl std::fmt::Debug for ElicDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElicDecoder")
            .field("groups", &self.model.config().groups)
            .field("profiling", &self.profiler.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
