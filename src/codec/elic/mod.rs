//! ELIC Learned Image Codec (entropy-coding core)
//!
//! Entropy coding for a learned image codec: the latent grid is cut into
//! uneven channel slices, and each slice is coded in two checkerboard passes.
//!
//! ## Features
//!
//! - **Uneven channel slices**: `[16, 16, 32, 64, 192]` channels by default
//! - **Bounded cross-slice context**: slice `i` reads slice 0 and slice `i-1` only
//! - **Checkerboard passes**: anchor positions first, non-anchor positions
//!   conditioned on the decoded anchors
//! - **ANS entropy coding** via `constriction`, with escape coding for
//!   residuals outside the tabulated range
//! - **Exact reconstruction**: the encoder decodes every string it writes,
//!   so encoder and decoder predictions are identical
//!
//! ## Architecture
//!
//! ```text
//! Encoder:
//!   x -> g_a -> y -> h_a -> z -> [bottleneck] -> side string
//!                              z_hat -> h_s -> priors
//!   for slice i: anchor pass -> string, non-anchor pass -> string
//!   -> [a_0, n_0, ..., a_{k-1}, n_{k-1}, side]
//!
//! Decoder:
//!   side string + (H, W) -> z_hat -> h_s -> priors
//!   for slice i: decode anchor, predict context, decode non-anchor
//!   -> y_hat -> g_s -> x_hat
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chandelier::codec::elic::{ElicConfig, ElicDecoder, ElicEncoder, ElicModel};
//!
//! let model = Arc::new(ElicModel::random(ElicConfig::default())?);
//! let mut encoder = ElicEncoder::new(Arc::clone(&model));
//! let mut decoder = ElicDecoder::new(model);
//!
//! let encoded = encoder.compress(&image.view())?;
//! let bytes = encoded.record.to_bytes()?;
//!
//! let record = BitstreamRecord::from_bytes(&bytes)?;
//! let x_hat = decoder.decompress(&record)?;
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

pub mod bitstream;
pub mod checkerboard;
pub mod config;
pub mod context;
pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod entropy;
pub mod error;
pub mod model;
pub mod profiler;
pub mod quantize;
pub mod slices;
pub mod transform;

// ─────────────────────────────────────────────────────────────────────────────
// Public Re-exports
// ─────────────────────────────────────────────────────────────────────────────

// Bitstream types
pub use bitstream::{assemble, disassemble, BitstreamRecord, SliceStrings, HEADER_SIZE, MAGIC};

// Checkerboard
pub use checkerboard::Parity;

// Configuration types
pub use config::{ElicConfig, ElicConfigBuilder, GroupTable, ScaleTableConfig};

// Context
pub use context::{ContextAggregator, HyperPriors, ParamPair};

// Encoder / Decoder
pub use decoder::{DecoderStats, ElicDecoder};
pub use encoder::{ElicEncoder, EncodedLatent, EncoderStats};

// Engine
pub use engine::{CodecEngine, Estimate, PassInput, PassOutput};

// Entropy coding types
pub use entropy::{EntropyBottleneck, GaussianConditional};

// Error types
pub use error::ElicError;

// Model types
pub use model::{ElicModel, ForwardOutput, ImageTransforms, IMAGE_CHANNELS, LATENT_SPATIAL_FACTOR};

// Profiling types
pub use profiler::{stages, ProfileStats, Profiler};

// Quantization
pub use quantize::{QuantizeMode, Quantizer};

// Slice schedule
pub use slices::SliceScheduler;

// Learned functions
pub use transform::{CheckerboardMaskedConv2d, Conv2d, Relu, Sequential, Transform, Upsample};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// ELIC codec identifier
pub const CODEC_ID: &str = "elic";

/// ELIC codec long name
pub const CODEC_LONG_NAME: &str = "ELIC Learned Image Codec";

// ─────────────────────────────────────────────────────────────────────────────
// Helper Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Image size multiple needed for a hyper path with `hyper_factor`
pub fn image_alignment(hyper_factor: usize) -> usize {
    LATENT_SPATIAL_FACTOR * hyper_factor
}

/// Round `dim` up to a multiple of `alignment` (at least one multiple)
pub fn align_dimension(dim: usize, alignment: usize) -> usize {
    dim.div_ceil(alignment).max(1) * alignment
}

/// Check whether an image of `height x width` can be coded
pub fn is_valid_resolution(height: usize, width: usize, hyper_factor: usize) -> bool {
    let alignment = image_alignment(hyper_factor);
    height > 0 && width > 0 && height % alignment == 0 && width % alignment == 0
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_resolution() {
        assert!(is_valid_resolution(64, 64, 4));
        assert!(is_valid_resolution(768, 512, 4));
        assert!(!is_valid_resolution(48, 64, 4));
        assert!(is_valid_resolution(48, 64, 1));
        assert!(!is_valid_resolution(0, 64, 4));
    }

    #[test]
    fn test_align_dimension() {
        assert_eq!(align_dimension(64, 64), 64);
        assert_eq!(align_dimension(65, 64), 128);
        assert_eq!(align_dimension(0, 64), 64);
    }

    #[test]
    fn test_default_layout() {
        let config = ElicConfig::default();
        assert_eq!(config.num_slices(), 5);
        assert_eq!(config.num_strings(), 11);
        assert_eq!(image_alignment(config.hyper_factor), 64);
        assert_eq!(CODEC_ID, "elic");
    }
}
