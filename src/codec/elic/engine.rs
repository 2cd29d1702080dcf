//! ELIC Codec Engine
//!
//! Drives the slice schedule and the two checkerboard passes of every slice.
//!
//! ```text
//! for slice i in 0..k:
//!     support  = priors (+ cc_i(y_hat[0], y_hat[i-1]))
//!     anchor   : params(zeros, support)          -> code anchor positions
//!     non-anchor: params(ctx_i(anchor), support) -> code non-anchor positions
//!     y_hat[i] = anchor + non-anchor
//! ```
//!
//! Encoding and decoding share one pass routine. The encoder always decodes
//! the string it has just produced, so both sides feed identical values into
//! every later prediction.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut engine = CodecEngine::new(&aggregator, &gaussian);
//! let (slices, y_hat) = engine.encode_latent(&y.view(), &priors)?;
//! let decoded = engine.decode_latent(&slices, &priors)?;
//! assert_eq!(decoded, y_hat);
//! ```

use std::borrow::Cow;
use std::time::Instant;

use ndarray::{Array4, ArrayView4};
use tracing::{debug, trace};

use super::bitstream::SliceStrings;
use super::checkerboard::{mask, merge, pack, unpack, Parity};
use super::context::{ContextAggregator, HyperPriors, ParamPair};
use super::entropy::GaussianConditional;
use super::error::ElicError;
use super::profiler::{stages, timed, Profiler};
use super::quantize::{QuantizeMode, Quantizer};
use super::slices::concat_channels;

// ─────────────────────────────────────────────────────────────────────────────
// Pass Types
// ─────────────────────────────────────────────────────────────────────────────

/// What one pass works from
#[derive(Debug, Clone, Copy)]
pub enum PassInput<'v> {
    /// True slice values (full resolution)
    Encode(ArrayView4<'v, f32>),
    /// A string produced by the encoder for this pass
    Decode(&'v [u8]),
}

/// Result of coding one pass
#[derive(Debug, Clone)]
pub struct PassOutput<'v> {
    /// The pass string (borrowed from the input when decoding)
    pub string: Cow<'v, [u8]>,
    /// Reconstruction at full resolution, zero at the other parity
    pub y_hat: Array4<f32>,
    /// Half-width means and scales of this pass
    pub params: ParamPair,
}

/// Output of the likelihood-estimation path
#[derive(Debug, Clone)]
pub struct Estimate {
    /// Latent handed to the synthesis transform
    pub y_hat: Array4<f32>,
    /// Per-position likelihoods of the latent
    pub y_likelihoods: Array4<f32>,
}

#[derive(Clone, Copy)]
enum SliceInput<'v> {
    Encode(ArrayView4<'v, f32>),
    Decode(&'v SliceStrings),
}

impl<'v> SliceInput<'v> {
    fn for_pass(self, parity: Parity) -> PassInput<'v> {
        match (self, parity) {
            (SliceInput::Encode(values), _) => PassInput::Encode(values),
            (SliceInput::Decode(strings), Parity::Anchor) => PassInput::Decode(&strings.anchor),
            (SliceInput::Decode(strings), Parity::NonAnchor) => {
                PassInput::Decode(&strings.non_anchor)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// Slice-by-slice, pass-by-pass latent coder
pub struct CodecEngine<'a> {
    aggregator: &'a ContextAggregator,
    gaussian: &'a GaussianConditional,
    profiler: Option<&'a mut Profiler>,
}

impl<'a> CodecEngine<'a> {
    /// Create an engine over a context aggregator and a scalar coder
    pub fn new(aggregator: &'a ContextAggregator, gaussian: &'a GaussianConditional) -> Self {
        CodecEngine {
            aggregator,
            gaussian,
            profiler: None,
        }
    }

    /// Record entropy coding and parameter time into `profiler`
    pub fn with_profiler(mut self, profiler: &'a mut Profiler) -> Self {
        self.profiler = Some(profiler);
        self
    }

    /// Code one pass of slice `index`
    ///
    /// # Arguments
    ///
    /// * `index` - Slice index
    /// * `parity` - Which checkerboard class this pass codes
    /// * `support` - Support of the slice
    /// * `spatial_context` - Zeros for the anchor pass, predicted context otherwise
    /// * `input` - True values (encode) or the pass string (decode)
    ///
    /// # Returns
    ///
    /// The pass string, the reconstruction at this parity and the packed
    /// parameters that coded it
    pub fn code_pass<'v>(
        &mut self,
        index: usize,
        parity: Parity,
        support: &ArrayView4<f32>,
        spatial_context: &ArrayView4<f32>,
        input: PassInput<'v>,
    ) -> Result<PassOutput<'v>, ElicError> {
        let gaussian = self.gaussian;
        let params = self.aggregator.compute(index, support, spatial_context)?;
        let width = params.means.dim().3;

        let means = pack(&params.means.view(), parity)?;
        let scales = pack(&params.scales.view(), parity)?;
        let indexes = gaussian.build_indexes(&scales.view());

        let string: Cow<'v, [u8]> = match input {
            PassInput::Encode(values) => {
                params.validate_against(&values)?;
                let packed = pack(&values, parity)?;
                let bytes = timed(self.profiler.as_deref_mut(), stages::ENTROPY_ENCODE, || {
                    gaussian.compress(&packed.view(), &indexes.view(), &means.view())
                })?;
                Cow::Owned(bytes)
            }
            PassInput::Decode(data) => Cow::Borrowed(data),
        };

        let decoded = timed(self.profiler.as_deref_mut(), stages::ENTROPY_DECODE, || {
            gaussian.decompress(&string, &indexes.view(), &means.view())
        })?;
        let y_hat = unpack(&decoded.view(), parity, width)?;

        trace!(
            slice = index,
            pass = %parity,
            symbols = decoded.len(),
            bytes = string.len(),
            "coded pass"
        );

        Ok(PassOutput {
            string,
            y_hat,
            params: ParamPair::new(means, scales),
        })
    }

    fn code_slice(
        &mut self,
        index: usize,
        decoded: &[Array4<f32>],
        priors: &HyperPriors,
        input: SliceInput<'_>,
    ) -> Result<(SliceStrings, Array4<f32>), ElicError> {
        let aggregator = self.aggregator;
        let support = aggregator.support(index, decoded, priors)?;

        let zeros = aggregator.spatial_context(index, Parity::Anchor, priors, None)?;
        let anchor = self.code_pass(
            index,
            Parity::Anchor,
            &support.view(),
            &zeros.view(),
            input.for_pass(Parity::Anchor),
        )?;

        let context = aggregator.spatial_context(
            index,
            Parity::NonAnchor,
            priors,
            Some(&anchor.y_hat.view()),
        )?;
        let non_anchor = self.code_pass(
            index,
            Parity::NonAnchor,
            &support.view(),
            &context.view(),
            input.for_pass(Parity::NonAnchor),
        )?;

        let y_hat = merge(&anchor.y_hat.view(), &non_anchor.y_hat.view())?;
        let strings = SliceStrings::new(anchor.string.into_owned(), non_anchor.string.into_owned());
        Ok((strings, y_hat))
    }

    /// Encode a full latent grid into `k` string pairs
    ///
    /// Returns the strings and the reconstruction the decoder will produce.
    pub fn encode_latent(
        &mut self,
        y: &ArrayView4<f32>,
        priors: &HyperPriors,
    ) -> Result<(Vec<SliceStrings>, Array4<f32>), ElicError> {
        let start = Instant::now();
        let aggregator = self.aggregator;
        let scheduler = aggregator.scheduler();
        scheduler.check_latent(y)?;
        check_priors(y, priors)?;

        let k = scheduler.num_slices();
        let mut strings = Vec::with_capacity(k);
        let mut decoded: Vec<Array4<f32>> = Vec::with_capacity(k);

        for index in 0..k {
            let values = scheduler.slice(y, index);
            let (pair, y_hat) =
                self.code_slice(index, &decoded, priors, SliceInput::Encode(values))?;
            debug!(
                slice = index,
                channels = ?scheduler.channel_range(index),
                anchor_bytes = pair.anchor.len(),
                non_anchor_bytes = pair.non_anchor.len(),
                "encoded slice"
            );
            strings.push(pair);
            decoded.push(y_hat);
        }

        let y_hat = concat_channels(&decoded.iter().map(|d| d.view()).collect::<Vec<_>>())?;
        self.record_params(start);
        Ok((strings, y_hat))
    }

    /// Decode `k` string pairs into a latent grid
    ///
    /// The grid size comes from `priors`.
    pub fn decode_latent(
        &mut self,
        slices: &[SliceStrings],
        priors: &HyperPriors,
    ) -> Result<Array4<f32>, ElicError> {
        let start = Instant::now();
        let aggregator = self.aggregator;
        let scheduler = aggregator.scheduler();
        let k = scheduler.num_slices();
        if slices.len() != k {
            return Err(ElicError::framing(k, 2 * slices.len() + 1));
        }
        let (_, m, _, _) = priors.latent_means.dim();
        if m != scheduler.total_channels() {
            return Err(ElicError::shape_mismatch(
                "prior channels",
                &[scheduler.total_channels()],
                &[m],
            ));
        }

        let mut decoded: Vec<Array4<f32>> = Vec::with_capacity(k);
        for (index, pair) in slices.iter().enumerate() {
            let (_, y_hat) = self.code_slice(index, &decoded, priors, SliceInput::Decode(pair))?;
            debug!(
                slice = index,
                channels = ?scheduler.channel_range(index),
                "decoded slice"
            );
            decoded.push(y_hat);
        }

        let y_hat = concat_channels(&decoded.iter().map(|d| d.view()).collect::<Vec<_>>())?;
        self.record_params(start);
        Ok(y_hat)
    }

    fn record_params(&mut self, start: Instant) {
        if let Some(profiler) = self.profiler.as_deref_mut() {
            profiler.record(stages::PARAMS, start.elapsed());
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Likelihood estimation
    // ─────────────────────────────────────────────────────────────────────────

    /// Quantize the latent and estimate its likelihoods without coding
    ///
    /// With `noisequant` the coded values carry uniform noise and the
    /// synthesis input is rounded without means; otherwise both are rounded
    /// around the predicted means. Cross-slice and non-anchor context always
    /// read the coded values.
    pub fn estimate(
        &self,
        y: &ArrayView4<f32>,
        priors: &HyperPriors,
        noisequant: bool,
        quantizer: &mut Quantizer,
    ) -> Result<Estimate, ElicError> {
        let aggregator = self.aggregator;
        let scheduler = aggregator.scheduler();
        scheduler.check_latent(y)?;
        check_priors(y, priors)?;

        let k = scheduler.num_slices();
        let mut coded: Vec<Array4<f32>> = Vec::with_capacity(k);
        let mut for_synthesis: Vec<Array4<f32>> = Vec::with_capacity(k);
        let mut likelihoods: Vec<Array4<f32>> = Vec::with_capacity(k);

        for index in 0..k {
            let values = scheduler.slice(y, index);
            let support = aggregator.support(index, &coded, priors)?;
            let mut passes = Vec::with_capacity(2);
            let mut anchor_hat: Option<Array4<f32>> = None;

            for parity in Parity::ORDER {
                let context = aggregator.spatial_context(
                    index,
                    parity,
                    priors,
                    anchor_hat.as_ref().map(|a| a.view()).as_ref(),
                )?;
                let params = aggregator.compute(index, &support.view(), &context.view())?;
                params.validate_against(&values)?;

                let (hat, gs) = if noisequant {
                    (
                        quantizer.quantize(&values, QuantizeMode::Noise),
                        quantizer.quantize(&values, QuantizeMode::Ste),
                    )
                } else {
                    let hat =
                        quantizer.quantize_around(&values, &params.means.view(), QuantizeMode::Ste)?;
                    (hat.clone(), hat)
                };
                let hat = mask(&hat.view(), parity);
                let gs = mask(&gs.view(), parity);

                let width = values.dim().3;
                let likelihood = self.gaussian.likelihood(
                    &pack(&hat.view(), parity)?.view(),
                    &pack(&params.scales.view(), parity)?.view(),
                    &pack(&params.means.view(), parity)?.view(),
                )?;
                let likelihood = unpack(&likelihood.view(), parity, width)?;

                if parity == Parity::Anchor {
                    anchor_hat = Some(hat.clone());
                }
                passes.push((hat, gs, likelihood));
            }

            let [(a_hat, a_gs, a_lik), (n_hat, n_gs, n_lik)]: [_; 2] = passes
                .try_into()
                .map_err(|_| ElicError::coding(format!("slice {} did not run two passes", index)))?;
            coded.push(merge(&a_hat.view(), &n_hat.view())?);
            for_synthesis.push(merge(&a_gs.view(), &n_gs.view())?);
            likelihoods.push(merge(&a_lik.view(), &n_lik.view())?);
            trace!(slice = index, noisequant, "estimated slice");
        }

        Ok(Estimate {
            y_hat: concat_channels(&for_synthesis.iter().map(|d| d.view()).collect::<Vec<_>>())?,
            y_likelihoods: concat_channels(
                &likelihoods.iter().map(|d| d.view()).collect::<Vec<_>>(),
            )?,
        })
    }
}

fn check_priors(y: &ArrayView4<f32>, priors: &HyperPriors) -> Result<(), ElicError> {
    if priors.latent_means.shape() != y.shape() || priors.latent_scales.shape() != y.shape() {
        return Err(ElicError::shape_mismatch(
            "hyper priors vs latent",
            y.shape(),
            priors.latent_means.shape(),
        ));
    }
    Ok(())
}
