//! ELIC Image Encoder
//!
//! ## Pipeline
//!
//! 1. **Analysis**: `y = g_a(x)`
//! 2. **Hyper analysis**: `z = h_a(y)`, coded by the entropy bottleneck
//! 3. **Hyper synthesis**: priors from the *decoded* side information
//! 4. **Slice coding**: two checkerboard passes per slice (see [`CodecEngine`])
//! 5. **Framing**: `2k + 1` strings plus the side-information shape
//!
//! [`CodecEngine`]: super::engine::CodecEngine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chandelier::codec::elic::{ElicConfig, ElicEncoder, ElicModel};
//!
//! let model = Arc::new(ElicModel::random(ElicConfig::default())?);
//! let mut encoder = ElicEncoder::new(model);
//! let encoded = encoder.compress(&image.view())?;
//! std::fs::write("image.elic", encoded.record.to_bytes()?)?;
//! ```

use std::sync::Arc;

use ndarray::{Array4, ArrayView4};
use tracing::info;

use super::bitstream::BitstreamRecord;
use super::error::ElicError;
use super::model::{check_priors_grid, ElicModel, IMAGE_CHANNELS};
use super::profiler::{stages, timed, Profiler};
use super::{align_dimension, image_alignment, is_valid_resolution};

/// Output of one compress call
#[derive(Debug, Clone)]
pub struct EncodedLatent {
    /// Strings and side-information shape
    pub record: BitstreamRecord,
    /// The latent the decoder will reconstruct
    pub y_hat: Array4<f32>,
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    /// Compress calls that succeeded
    pub calls: u64,
    /// Images encoded (batch items)
    pub images_encoded: u64,
    /// String bytes produced
    pub total_bytes: u64,
}

/// Image and latent encoder
pub struct ElicEncoder {
    model: Arc<ElicModel>,
    profiler: Option<Profiler>,
    stats: EncoderStats,
}

impl ElicEncoder {
    /// Create an encoder over a shared model
    pub fn new(model: Arc<ElicModel>) -> Self {
        ElicEncoder {
            model,
            profiler: None,
            stats: EncoderStats::default(),
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

    /// Get encoding statistics
    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }

    /// Compress a batch of images `(batch, 3, H, W)`
    ///
    /// `H` and `W` must be multiples of `16 * hyper_factor`.
    pub fn compress(&mut self, x: &ArrayView4<f32>) -> Result<EncodedLatent, ElicError> {
        let (b, c, h, w) = x.dim();
        let hyper_factor = self.model.config().hyper_factor;
        if c != IMAGE_CHANNELS || !is_valid_resolution(h, w, hyper_factor) {
            let alignment = image_alignment(hyper_factor);
            return Err(ElicError::shape_mismatch(
                format!("image (spatial size must be a multiple of {})", alignment),
                &[
                    b,
                    IMAGE_CHANNELS,
                    align_dimension(h, alignment),
                    align_dimension(w, alignment),
                ],
                x.shape(),
            ));
        }

        let model = Arc::clone(&self.model);
        let y = timed(self.profiler.as_mut(), stages::Y_ENC, || model.analysis(x))?;
        self.compress_latent(&y.view())
    }

    /// Compress a latent grid `(batch, M, h, w)`
    pub fn compress_latent(&mut self, y: &ArrayView4<f32>) -> Result<EncodedLatent, ElicError> {
        let model = Arc::clone(&self.model);
        let (b, _, _, _) = y.dim();

        let z = timed(self.profiler.as_mut(), stages::Z_ENC, || {
            model.hyper_analysis(y)
        })?;
        let (_, _, zh, zw) = z.dim();

        let bottleneck = model.bottleneck();
        let side = timed(self.profiler.as_mut(), stages::ENTROPY_ENCODE, || {
            bottleneck.compress(&z.view())
        })?;
        let z_hat = timed(self.profiler.as_mut(), stages::ENTROPY_DECODE, || {
            bottleneck.decompress(&side, b, (zh, zw))
        })?;

        let priors = timed(self.profiler.as_mut(), stages::Z_DEC, || {
            model.hyper_priors(&z_hat.view())
        })?;
        check_priors_grid(y, &priors)?;

        let (slices, y_hat) = match self.profiler.as_mut() {
            Some(profiler) => model
                .engine()
                .with_profiler(profiler)
                .encode_latent(y, &priors)?,
            None => model.engine().encode_latent(y, &priors)?,
        };

        let record = BitstreamRecord::from_parts(&slices, &side, (zh, zw), b);
        let bytes = record.payload_len();
        info!(
            batch = b,
            strings = record.strings.len(),
            side_bytes = side.len(),
            bytes,
            "compressed latent"
        );

        self.stats.calls += 1;
        self.stats.images_encoded += b as u64;
        self.stats.total_bytes += bytes as u64;

        Ok(EncodedLatent { record, y_hat })
    }
}

impl std::fmt::Debug for ElicEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElicEncoder")
            .field("groups", &self.model.config().groups)
            .field("profiling", &self.profiler.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
