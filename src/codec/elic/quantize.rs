//! ELIC Quantization Module
//!
//! Quantization maps continuous latent values to the representation each
//! pipeline phase needs.
//!
//! ## Quantization Modes
//!
//! - **Noise**: Adds uniform noise in `[-0.5, 0.5)` (likelihood estimation only)
//! - **Ste**: Straight-through rounding; in this deterministic code it is `round`
//! - **Round**: Hard rounding, ties to even, matching the entropy coder
//!
//! Every rounding in this codec goes through [`round_half_even`] so that the
//! encoder's residual and the decoder's reconstruction agree bit for bit.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chandelier::codec::elic::quantize::{QuantizeMode, Quantizer};
//!
//! let mut quantizer = Quantizer::with_seed(42);
//! let y_hat = quantizer.quantize_around(&y, &means, QuantizeMode::Ste);
//! ```

use ndarray::{Array4, ArrayView4, Zip};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use std::fmt;
use std::str::FromStr;

use super::error::ElicError;

/// Round to nearest integer, ties to even
#[inline]
pub fn round_half_even(x: f32) -> f32 {
    x.round_ties_even()
}

/// Round a residual to its integer symbol
///
/// Non-finite residuals and residuals outside the `i32` range are a coding
/// error.
#[inline]
pub fn to_symbol(x: f32) -> Result<i32, ElicError> {
    let rounded = round_half_even(x);
    // -(i32::MIN as f32) is 2^31, the first value past i32::MAX
    if rounded.is_finite() && rounded >= i32::MIN as f32 && rounded < -(i32::MIN as f32) {
        Ok(rounded as i32)
    } else {
        Err(ElicError::coding(format!("residual {} cannot be coded", x)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Quantize Mode
// ─────────────────────────────────────────────────────────────────────────────

/// Representation produced by the quantizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuantizeMode {
    /// Additive uniform noise
    Noise,
    /// Straight-through rounding
    Ste,
    /// Hard rounding
    Round,
}

impl QuantizeMode {
    /// Mode name as used in configuration
    pub fn name(&self) -> &'static str {
        match self {
            QuantizeMode::Noise => "noise",
            QuantizeMode::Ste => "ste",
            QuantizeMode::Round => "round",
        }
    }

    /// Whether the mode is deterministic
    pub fn is_deterministic(&self) -> bool {
        !matches!(self, QuantizeMode::Noise)
    }
}

impl fmt::Display for QuantizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for QuantizeMode {
    type Err = ElicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "noise" => Ok(QuantizeMode::Noise),
            "ste" => Ok(QuantizeMode::Ste),
            "round" | "dequantize" => Ok(QuantizeMode::Round),
            other => Err(ElicError::invalid_config(format!(
                "unknown quantize mode '{}'",
                other
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Quantizer
// ─────────────────────────────────────────────────────────────────────────────

/// Quantizer with its own noise source
///
/// The deterministic modes never touch the RNG, so two quantizers with
/// different seeds agree on `Ste` and `Round`.
#[derive(Debug, Clone)]
pub struct Quantizer {
    rng: Xoshiro256StarStar,
}

impl Quantizer {
    /// Create a quantizer with a seeded noise source
    pub fn with_seed(seed: u64) -> Self {
        Quantizer {
            rng: Xoshiro256StarStar::seed_from_u64(seed),
        }
    }

    /// Quantize every element of `values`
    pub fn quantize(&mut self, values: &ArrayView4<f32>, mode: QuantizeMode) -> Array4<f32> {
        match mode {
            QuantizeMode::Noise => {
                let rng = &mut self.rng;
                values.mapv(|v| v + rng.gen_range(-0.5f32..0.5f32))
            }
            QuantizeMode::Ste | QuantizeMode::Round => values.mapv(round_half_even),
        }
    }

    /// Quantize `values - offsets` and add the offsets back
    ///
    /// This is the mean-centred quantization used for the latent slices and
    /// the median-centred quantization used for the side information.
    pub fn quantize_around(
        &mut self,
        values: &ArrayView4<f32>,
        offsets: &ArrayView4<f32>,
        mode: QuantizeMode,
    ) -> Result<Array4<f32>, ElicError> {
        if values.shape() != offsets.shape() {
            return Err(ElicError::shape_mismatch(
                "quantize offsets",
                values.shape(),
                offsets.shape(),
            ));
        }

        let centred = values - offsets;
        let quantized = self.quantize(&centred.view(), mode);
        Ok(quantized + offsets)
    }
}

impl Default for Quantizer {
    fn default() -> Self {
        Quantizer::with_seed(0)
    }
}

/// Deterministic mean-centred rounding, `round(values - means) + means`
pub fn round_around(
    values: &ArrayView4<f32>,
    means: &ArrayView4<f32>,
) -> Result<Array4<f32>, ElicError> {
    if values.shape() != means.shape() {
        return Err(ElicError::shape_mismatch(
            "round around means",
            values.shape(),
            means.shape(),
        ));
    }

    Ok(Zip::from(values)
        .and(means)
        .map_collect(|&v, &m| round_half_even(v - m) + m))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
