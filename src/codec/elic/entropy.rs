//! ELIC Entropy Coding Module
//!
//! This module implements the two entropy coders of the codec on top of the
//! `constriction` ANS stack coder:
//!
//! - **GaussianConditional**: codes latent residuals under a discretized
//!   Gaussian whose scale is picked from a fixed log-spaced table
//! - **EntropyBottleneck**: codes the side-information grid under a learned
//!   per-channel factorized prior (median + scale)
//!
//! ## Symbol model
//!
//! A residual `r = round(value - mean)` is coded under a `LeakyQuantizer`
//! over a zero-mean Gaussian with support `[-c, c + 1]`, where
//! `c = ceil(scale * -Φ⁻¹(tail_mass / 2))`. Residuals inside `[-c, c]` are
//! coded directly. Anything else is coded as the escape symbol `c + 1`
//! followed by its zig-zag value in raw 4-bit chunks:
//!
//! ```text
//!   escape | count (15 = continue) ... | chunk_0 (LSB) | chunk_1 | ...
//! ```
//!
//! Symbols are pushed in reverse so that the decoder reads them in order.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chandelier::codec::elic::entropy::GaussianConditional;
//!
//! let gc = GaussianConditional::from_config(&config)?;
//! let indexes = gc.build_indexes(&scales.view());
//! let bytes = gc.compress(&values.view(), &indexes.view(), &means.view())?;
//! let decoded = gc.decompress(&bytes, &indexes.view(), &means.view())?;
//! ```

use constriction::stream::model::{DefaultLeakyQuantizer, UniformModel};
use constriction::stream::stack::DefaultAnsCoder;
use constriction::stream::{Decode, Encode};
use ndarray::{Array4, ArrayView4, Zip};
use probability::distribution::{Distribution, Gaussian, Inverse};
use rand::Rng;
use tracing::{trace, warn};

use super::config::{ElicConfig, ScaleTableConfig};
use super::error::ElicError;
use super::quantize::{to_symbol, QuantizeMode, Quantizer};

// -------------------------------------------------------------------------
// Constants
// -------------------------------------------------------------------------

/// Bits per raw chunk of an escaped value
pub const ESCAPE_CHUNK_BITS: u32 = 4;

/// Alphabet size of the raw chunk model
const ESCAPE_CHUNK_RANGE: usize = 1 << ESCAPE_CHUNK_BITS;

/// Chunk count value meaning "more count values follow"
const ESCAPE_COUNT_CONTINUE: usize = ESCAPE_CHUNK_RANGE - 1;

/// Most chunks a zig-zagged 32-bit residual can need
const MAX_ESCAPE_CHUNKS: usize = (32 / ESCAPE_CHUNK_BITS) as usize;

/// Raw chunk model, uniform over `0..ESCAPE_CHUNK_RANGE`
type ChunkModel = UniformModel<u32, 24>;

#[inline]
fn chunk_model() -> ChunkModel {
    ChunkModel::new(ESCAPE_CHUNK_RANGE as u32)
}

// -------------------------------------------------------------------------
// Helper Functions
// -------------------------------------------------------------------------

/// Convert u32 words to bytes (little-endian)
fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for &word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to u32 words
fn bytes_to_words(bytes: &[u8]) -> Vec<u32> {
    let mut words = Vec::with_capacity(bytes.len().div_ceil(4));
    for chunk in bytes.chunks(4) {
        let mut arr = [0u8; 4];
        arr[..chunk.len()].copy_from_slice(chunk);
        words.push(u32::from_le_bytes(arr));
    }
    words
}

/// Map a signed residual to an unsigned one: 0, -1, 1, -2, 2 ... -> 0, 1, 2, 3, 4 ...
#[inline]
pub fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Inverse of [`zigzag`]
#[inline]
pub fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Standard normal CDF
#[inline]
fn std_normal_cdf(standard: &Gaussian, x: f64) -> f64 {
    standard.distribution(x)
}

/// Probability mass of the unit bin around a residual
///
/// Uses the symmetric form `Φ((0.5 - |r|) / s) - Φ((-0.5 - |r|) / s)`, which
/// stays accurate far in the tails.
fn bin_likelihood(standard: &Gaussian, residual: f32, scale: f32, bound: f32) -> f32 {
    let r = residual.abs() as f64;
    let s = scale as f64;
    let upper = std_normal_cdf(standard, (0.5 - r) / s);
    let lower = std_normal_cdf(standard, (-0.5 - r) / s);
    ((upper - lower) as f32).max(bound)
}

// -------------------------------------------------------------------------
// Escape Model
// -------------------------------------------------------------------------

/// Zero-mean discretized Gaussian with a trailing escape bin
#[derive(Debug, Clone, Copy)]
struct EscapeModel {
    sigma: f64,
    tail: i32,
}

impl EscapeModel {
    fn new(sigma: f64, tail_mass: f64) -> Self {
        let multiplier = -Gaussian::new(0.0, 1.0).inverse(tail_mass / 2.0);
        let tail = (sigma * multiplier).ceil().max(1.0) as i32;
        EscapeModel { sigma, tail }
    }

    #[inline]
    fn escape(&self) -> i32 {
        self.tail + 1
    }

    #[inline]
    fn quantizer(&self) -> DefaultLeakyQuantizer<f64, i32> {
        DefaultLeakyQuantizer::new(-self.tail..=self.escape())
    }

    #[inline]
    fn gaussian(&self) -> Gaussian {
        Gaussian::new(0.0, self.sigma)
    }
}

/// One coding operation in decode order
#[derive(Debug, Clone, Copy)]
enum CodeOp {
    Symbol { value: i32, model: EscapeModel },
    Raw(usize),
}

/// Append the operations for one residual
fn push_residual(ops: &mut Vec<CodeOp>, residual: i32, model: EscapeModel) -> bool {
    if (-model.tail..=model.tail).contains(&residual) {
        ops.push(CodeOp::Symbol {
            value: residual,
            model,
        });
        return false;
    }

    ops.push(CodeOp::Symbol {
        value: model.escape(),
        model,
    });

    let mut raw = zigzag(residual);
    let mut chunks = Vec::with_capacity(MAX_ESCAPE_CHUNKS);
    loop {
        chunks.push((raw & (ESCAPE_CHUNK_RANGE as u32 - 1)) as usize);
        raw >>= ESCAPE_CHUNK_BITS;
        if raw == 0 {
            break;
        }
    }

    let mut count = chunks.len();
    while count >= ESCAPE_COUNT_CONTINUE {
        ops.push(CodeOp::Raw(ESCAPE_COUNT_CONTINUE));
        count -= ESCAPE_COUNT_CONTINUE;
    }
    ops.push(CodeOp::Raw(count));
    ops.extend(chunks.into_iter().map(CodeOp::Raw));
    true
}

/// Entropy code residuals, one model per residual
fn encode_residuals(residuals: &[i32], models: &[EscapeModel]) -> Result<Vec<u8>, ElicError> {
    if residuals.len() != models.len() {
        return Err(ElicError::EntropyEncodingFailed {
            reason: format!(
                "Length mismatch: residuals={}, models={}",
                residuals.len(),
                models.len()
            ),
        });
    }
    if residuals.is_empty() {
        return Ok(Vec::new());
    }

    let mut ops = Vec::with_capacity(residuals.len());
    let mut escapes = 0usize;
    for (&residual, &model) in residuals.iter().zip(models.iter()) {
        if push_residual(&mut ops, residual, model) {
            escapes += 1;
        }
    }
    if escapes > 0 {
        warn!(escapes, total = residuals.len(), "residuals outside the coded range");
    }

    let mut coder = DefaultAnsCoder::new();
    let raw_model = chunk_model();

    // Encode in reverse order (ANS is LIFO)
    for op in ops.iter().rev() {
        match *op {
            CodeOp::Symbol { value, model } => {
                let quantized = model.quantizer().quantize(model.gaussian());
                coder
                    .encode_symbol(value, quantized)
                    .map_err(|e| ElicError::EntropyEncodingFailed {
                        reason: format!("ANS encode failed: {:?}", e),
                    })?;
            }
            CodeOp::Raw(chunk) => {
                coder
                    .encode_symbol(chunk as u32, raw_model)
                    .map_err(|e| ElicError::EntropyEncodingFailed {
                        reason: format!("ANS raw encode failed: {:?}", e),
                    })?;
            }
        }
    }

    let words = coder
        .into_compressed()
        .map_err(|e| ElicError::EntropyEncodingFailed {
            reason: format!("Failed to get compressed data: {:?}", e),
        })?;

    Ok(words_to_bytes(&words))
}

/// Decode residuals coded by [`encode_residuals`]
fn decode_residuals(data: &[u8], models: &[EscapeModel]) -> Result<Vec<i32>, ElicError> {
    if models.is_empty() {
        return Ok(Vec::new());
    }

    let mut coder = DefaultAnsCoder::from_compressed(bytes_to_words(data)).map_err(|_| {
        ElicError::EntropyDecodingFailed {
            reason: "Failed to initialize decoder: compressed data ends in a zero word"
                .to_string(),
        }
    })?;
    let raw_model = chunk_model();

    let read_raw = |coder: &mut DefaultAnsCoder| -> Result<usize, ElicError> {
        coder
            .decode_symbol(raw_model)
            .map(|chunk| chunk as usize)
            .map_err(|e| ElicError::EntropyDecodingFailed {
                reason: format!("ANS raw decode failed: {:?}", e),
            })
    };

    let mut residuals = Vec::with_capacity(models.len());
    for (position, model) in models.iter().enumerate() {
        let quantized = model.quantizer().quantize(model.gaussian());
        let symbol = coder
            .decode_symbol(quantized)
            .map_err(|e| ElicError::EntropyDecodingFailed {
                reason: format!("ANS decode failed: {:?}", e),
            })?;

        if symbol != model.escape() {
            residuals.push(symbol);
            continue;
        }

        let mut count = 0usize;
        loop {
            let part = read_raw(&mut coder)?;
            count += part;
            if part != ESCAPE_COUNT_CONTINUE {
                break;
            }
            if count > MAX_ESCAPE_CHUNKS {
                break;
            }
        }
        if count == 0 || count > MAX_ESCAPE_CHUNKS {
            return Err(ElicError::EntropyDecodingFailed {
                reason: format!(
                    "Escaped residual at position {} has {} chunks (max {})",
                    position, count, MAX_ESCAPE_CHUNKS
                ),
            });
        }

        let mut raw = 0u32;
        for i in 0..count {
            let chunk = read_raw(&mut coder)? as u32;
            raw |= chunk << (i as u32 * ESCAPE_CHUNK_BITS);
        }
        residuals.push(unzigzag(raw));
    }

    Ok(residuals)
}

// -------------------------------------------------------------------------
// Gaussian Conditional
// -------------------------------------------------------------------------

/// Scalar entropy coder for latent residuals
///
/// Scales are mapped to a fixed table of discretized Gaussians via
/// [`build_indexes`](Self::build_indexes); the same indexes and means must be
/// given to [`compress`](Self::compress) and [`decompress`](Self::decompress).
#[derive(Debug, Clone)]
pub struct GaussianConditional {
    scale_table: Vec<f32>,
    models: Vec<EscapeModel>,
    tail_mass: f64,
    likelihood_bound: f32,
    standard: Gaussian,
}

impl GaussianConditional {
    /// Create a coder over the table described by `table`
    pub fn new(
        table: &ScaleTableConfig,
        tail_mass: f64,
        likelihood_bound: f32,
    ) -> Result<Self, ElicError> {
        table.validate()?;
        let scale_table = table.build();
        let models = scale_table
            .iter()
            .map(|&s| EscapeModel::new(s as f64, tail_mass))
            .collect();
        Ok(GaussianConditional {
            scale_table,
            models,
            tail_mass,
            likelihood_bound,
            standard: Gaussian::new(0.0, 1.0),
        })
    }

    /// Create a coder from the codec configuration
    pub fn from_config(config: &ElicConfig) -> Result<Self, ElicError> {
        Self::new(&config.scale_table, config.tail_mass, config.likelihood_bound)
    }

    /// The scale table
    pub fn scale_table(&self) -> &[f32] {
        &self.scale_table
    }

    /// Smallest scale used for coding and likelihoods
    pub fn lower_bound_scale(&self) -> f32 {
        self.scale_table[0]
    }

    /// Tail mass outside the directly coded range
    pub fn tail_mass(&self) -> f64 {
        self.tail_mass
    }

    /// Directly coded half-range `c` for table entry `index`
    pub fn tail(&self, index: usize) -> Option<i32> {
        self.models.get(index).map(|m| m.tail)
    }

    /// Map one scale to its table index
    ///
    /// The scale is lower-bounded first; the index is the smallest table entry
    /// not below it, capped at the last entry.
    pub fn scale_index(&self, scale: f32) -> i32 {
        let scale = scale.max(self.lower_bound_scale());
        let last = self.scale_table.len() - 1;
        self.scale_table[..last].partition_point(|&s| s < scale) as i32
    }

    /// Map a scale grid to a table index grid
    pub fn build_indexes(&self, scales: &ArrayView4<f32>) -> Array4<i32> {
        scales.mapv(|s| self.scale_index(s))
    }

    fn models_for(&self, indexes: &ArrayView4<i32>) -> Result<Vec<EscapeModel>, ElicError> {
        indexes
            .iter()
            .map(|&index| {
                usize::try_from(index)
                    .ok()
                    .and_then(|i| self.models.get(i).copied())
                    .ok_or_else(|| {
                        ElicError::coding(format!(
                            "scale index {} outside table of {} entries",
                            index,
                            self.models.len()
                        ))
                    })
            })
            .collect()
    }

    fn check_shapes(
        context: &str,
        indexes: &ArrayView4<i32>,
        means: &ArrayView4<f32>,
        values: Option<&ArrayView4<f32>>,
    ) -> Result<(), ElicError> {
        if indexes.shape() != means.shape() {
            return Err(ElicError::shape_mismatch(
                format!("{} means", context),
                indexes.shape(),
                means.shape(),
            ));
        }
        if let Some(values) = values {
            if values.shape() != indexes.shape() {
                return Err(ElicError::shape_mismatch(
                    format!("{} values", context),
                    indexes.shape(),
                    values.shape(),
                ));
            }
        }
        Ok(())
    }

    /// Compress `round(values - means)` under the indexed distributions
    ///
    /// # Arguments
    ///
    /// * `values` - Values to code (any real values; only the rounded residual is kept)
    /// * `indexes` - Scale table indexes from [`build_indexes`](Self::build_indexes)
    /// * `means` - Predicted means
    ///
    /// # Returns
    ///
    /// One byte string; empty when there is nothing to code
    pub fn compress(
        &self,
        values: &ArrayView4<f32>,
        indexes: &ArrayView4<i32>,
        means: &ArrayView4<f32>,
    ) -> Result<Vec<u8>, ElicError> {
        Self::check_shapes("gaussian compress", indexes, means, Some(values))?;
        let models = self.models_for(indexes)?;
        let residuals = values
            .iter()
            .zip(means.iter())
            .map(|(&v, &m)| to_symbol(v - m))
            .collect::<Result<Vec<i32>, ElicError>>()?;

        let bytes = encode_residuals(&residuals, &models)?;
        trace!(symbols = residuals.len(), bytes = bytes.len(), "gaussian compress");
        Ok(bytes)
    }

    /// Decompress a string produced by [`compress`](Self::compress)
    ///
    /// Returns `residual + mean` at every position.
    pub fn decompress(
        &self,
        data: &[u8],
        indexes: &ArrayView4<i32>,
        means: &ArrayView4<f32>,
    ) -> Result<Array4<f32>, ElicError> {
        Self::check_shapes("gaussian decompress", indexes, means, None)?;
        let models = self.models_for(indexes)?;
        let residuals = decode_residuals(data, &models)?;

        let mut out = Array4::<f32>::zeros(means.raw_dim());
        for ((o, &m), &r) in out.iter_mut().zip(means.iter()).zip(residuals.iter()) {
            *o = r as f32 + m;
        }
        Ok(out)
    }

    /// Likelihood of each (already quantized) value under `N(mean, scale)`
    pub fn likelihood(
        &self,
        values: &ArrayView4<f32>,
        scales: &ArrayView4<f32>,
        means: &ArrayView4<f32>,
    ) -> Result<Array4<f32>, ElicError> {
        if values.shape() != scales.shape() || values.shape() != means.shape() {
            return Err(ElicError::shape_mismatch(
                "gaussian likelihood",
                values.shape(),
                if values.shape() != scales.shape() {
                    scales.shape()
                } else {
                    means.shape()
                },
            ));
        }

        let lower = self.lower_bound_scale();
        let bound = self.likelihood_bound;
        Ok(Zip::from(values)
            .and(scales)
            .and(means)
            .map_collect(|&v, &s, &m| bin_likelihood(&self.standard, v - m, s.max(lower), bound)))
    }

    /// Quantize values for estimation and return `(quantized, likelihood)`
    ///
    /// `Noise` adds uniform noise; `Ste`/`Round` round around the means.
    pub fn forward(
        &self,
        values: &ArrayView4<f32>,
        scales: &ArrayView4<f32>,
        means: &ArrayView4<f32>,
        mode: QuantizeMode,
        quantizer: &mut Quantizer,
    ) -> Result<(Array4<f32>, Array4<f32>), ElicError> {
        let quantized = match mode {
            QuantizeMode::Noise => quantizer.quantize(values, mode),
            QuantizeMode::Ste | QuantizeMode::Round => {
                quantizer.quantize_around(values, means, mode)?
            }
        };
        let likelihood = self.likelihood(&quantized.view(), scales, means)?;
        Ok((quantized, likelihood))
    }
}

// -------------------------------------------------------------------------
// Entropy Bottleneck
// -------------------------------------------------------------------------

/// Side-information coder with a factorized per-channel prior
///
/// Every channel `c` has a median and a scale. The median is the offset used
/// before rounding (see [`medians`](Self::medians)); the scale parameterizes
/// the channel's discretized Gaussian.
#[derive(Debug, Clone)]
pub struct EntropyBottleneck {
    medians: Vec<f32>,
    scales: Vec<f32>,
    models: Vec<EscapeModel>,
    likelihood_bound: f32,
    standard: Gaussian,
}

impl EntropyBottleneck {
    /// Create a bottleneck from per-channel medians and scales
    pub fn new(
        medians: Vec<f32>,
        scales: Vec<f32>,
        tail_mass: f64,
        likelihood_bound: f32,
    ) -> Result<Self, ElicError> {
        if medians.len() != scales.len() || medians.is_empty() {
            return Err(ElicError::invalid_config(format!(
                "bottleneck needs one median and one scale per channel, got {} and {}",
                medians.len(),
                scales.len()
            )));
        }
        if let Some(bad) = scales.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(ElicError::invalid_config(format!(
                "bottleneck scale {} is not positive",
                bad
            )));
        }

        let models = scales
            .iter()
            .map(|&s| EscapeModel::new(s as f64, tail_mass))
            .collect();
        Ok(EntropyBottleneck {
            medians,
            scales,
            models,
            likelihood_bound,
            standard: Gaussian::new(0.0, 1.0),
        })
    }

    /// Stand-in prior: medians in `[-0.5, 0.5)`, scales in `[0.5, 2.0)`
    pub fn with_random_prior<R: Rng>(
        channels: usize,
        tail_mass: f64,
        likelihood_bound: f32,
        rng: &mut R,
    ) -> Result<Self, ElicError> {
        let medians = (0..channels).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
        let scales = (0..channels).map(|_| rng.gen_range(0.5f32..2.0)).collect();
        Self::new(medians, scales, tail_mass, likelihood_bound)
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.medians.len()
    }

    /// Per-channel median offsets
    pub fn medians(&self) -> &[f32] {
        &self.medians
    }

    /// Per-channel scales
    pub fn scales(&self) -> &[f32] {
        &self.scales
    }

    /// Medians broadcast to a `(batch, channels, h, w)` grid
    pub fn median_grid(&self, batch: usize, height: usize, width: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, self.channels(), height, width), |(_, c, _, _)| {
            self.medians[c]
        })
    }

    fn check_channels(&self, z: &ArrayView4<f32>) -> Result<(), ElicError> {
        let (b, c, h, w) = z.dim();
        if c != self.channels() {
            return Err(ElicError::shape_mismatch(
                "bottleneck channels",
                &[b, self.channels(), h, w],
                z.shape(),
            ));
        }
        Ok(())
    }

    fn models_for(
        &self,
        batch: usize,
        height: usize,
        width: usize,
    ) -> Result<Vec<EscapeModel>, ElicError> {
        let per_channel = height.checked_mul(width);
        let total = per_channel
            .and_then(|n| n.checked_mul(self.channels()))
            .and_then(|n| n.checked_mul(batch));
        let (Some(per_channel), Some(total)) = (per_channel, total) else {
            return Err(ElicError::invalid_header(format!(
                "side-information grid {}x{}x{}x{} overflows",
                batch,
                self.channels(),
                height,
                width
            )));
        };

        let mut models = Vec::new();
        models
            .try_reserve_exact(total)
            .map_err(|e| ElicError::coding(format!("cannot allocate {} models: {}", total, e)))?;
        for _ in 0..batch {
            for model in &self.models {
                models.extend(std::iter::repeat(*model).take(per_channel));
            }
        }
        Ok(models)
    }

    /// Compress a side-information grid into one string
    pub fn compress(&self, z: &ArrayView4<f32>) -> Result<Vec<u8>, ElicError> {
        self.check_channels(z)?;
        let (b, _, h, w) = z.dim();
        let models = self.models_for(b, h, w)?;
        let residuals = z
            .indexed_iter()
            .map(|((_, c, _, _), &v)| to_symbol(v - self.medians[c]))
            .collect::<Result<Vec<i32>, ElicError>>()?;
        encode_residuals(&residuals, &models)
    }

    /// Decompress a `(batch, channels, h, w)` grid
    pub fn decompress(
        &self,
        data: &[u8],
        batch: usize,
        shape: (usize, usize),
    ) -> Result<Array4<f32>, ElicError> {
        let (h, w) = shape;
        let models = self.models_for(batch, h, w)?;
        let residuals = decode_residuals(data, &models)?;

        let mut z = Array4::<f32>::zeros((batch, self.channels(), h, w));
        for (((_, c, _, _), out), &r) in z.indexed_iter_mut().zip(residuals.iter()) {
            *out = r as f32 + self.medians[c];
        }
        Ok(z)
    }

    /// Quantize around the medians (`Noise` ignores them)
    pub fn quantize(
        &self,
        z: &ArrayView4<f32>,
        mode: QuantizeMode,
        quantizer: &mut Quantizer,
    ) -> Result<Array4<f32>, ElicError> {
        self.check_channels(z)?;
        match mode {
            QuantizeMode::Noise => Ok(quantizer.quantize(z, mode)),
            QuantizeMode::Ste | QuantizeMode::Round => {
                let (b, _, h, w) = z.dim();
                let medians = self.median_grid(b, h, w);
                quantizer.quantize_around(z, &medians.view(), mode)
            }
        }
    }

    /// Likelihood of each quantized value under its channel prior
    pub fn likelihood(&self, z_hat: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        self.check_channels(z_hat)?;
        let bound = self.likelihood_bound;
        let mut out = Array4::<f32>::zeros(z_hat.raw_dim());
        for (((_, c, _, _), o), &v) in out.indexed_iter_mut().zip(z_hat.iter()) {
            *o = bin_likelihood(&self.standard, v - self.medians[c], self.scales[c], bound);
        }
        Ok(out)
    }

    /// Quantize and return `(z_hat, likelihood)`
    pub fn forward(
        &self,
        z: &ArrayView4<f32>,
        mode: QuantizeMode,
        quantizer: &mut Quantizer,
    ) -> Result<(Array4<f32>, Array4<f32>), ElicError> {
        let z_hat = self.quantize(z, mode, quantizer)?;
        let likelihood = self.likelihood(&z_hat.view())?;
        Ok((z_hat, likelihood))
    }
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------
