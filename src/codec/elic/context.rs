//! ELIC Context Aggregation
//!
//! For every (slice, pass) the aggregator turns the available context into a
//! [`ParamPair`] of Gaussian means and scales:
//!
//! ```text
//!   support(i)  = [cc_i(y_hat[0] | y_hat[i-1]) , latent_means, latent_scales]
//!   context     = zeros                          (anchor pass)
//!               = context_prediction_i(anchor)   (non-anchor pass)
//!   (mean, scale) = chunk2( aggregation_i([context, support]) )
//! ```
//!
//! Slice 0 has no cross-slice term; its support is the hyper priors alone.
//! The returned pair covers the whole slice, and callers keep only the
//! positions of the pass they are coding.

use ndarray::{Array4, ArrayView4};
use rand::Rng;
use tracing::trace;

use super::checkerboard::Parity;
use super::config::ElicConfig;
use super::error::ElicError;
use super::slices::{chunk_channels, concat_channels, SliceScheduler};
use super::transform::{CheckerboardMaskedConv2d, Conv2d, Relu, Sequential, Transform};

// ─────────────────────────────────────────────────────────────────────────────
// Parameter Types
// ─────────────────────────────────────────────────────────────────────────────

/// Predicted means and scales for one slice
#[derive(Debug, Clone, PartialEq)]
pub struct ParamPair {
    /// Gaussian means
    pub means: Array4<f32>,
    /// Gaussian scales (not yet lower-bounded)
    pub scales: Array4<f32>,
}

impl ParamPair {
    /// Create a new pair
    pub fn new(means: Array4<f32>, scales: Array4<f32>) -> Self {
        ParamPair { means, scales }
    }

    /// Shape of the parameterized grid
    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.means.dim()
    }

    /// Validate that means and scales agree with each other and with `values`
    pub fn validate_against(&self, values: &ArrayView4<f32>) -> Result<(), ElicError> {
        if self.means.dim() != self.scales.dim() {
            return Err(ElicError::shape_mismatch(
                "param pair means vs scales",
                self.means.shape(),
                self.scales.shape(),
            ));
        }
        if self.means.shape() != values.shape() {
            return Err(ElicError::shape_mismatch(
                "param pair vs slice",
                values.shape(),
                self.means.shape(),
            ));
        }
        Ok(())
    }
}

/// Hyper priors shared read-only by every slice
#[derive(Debug, Clone)]
pub struct HyperPriors {
    /// Per-position prior means (M channels)
    pub latent_means: Array4<f32>,
    /// Per-position prior scales (M channels)
    pub latent_scales: Array4<f32>,
}

impl HyperPriors {
    /// Split the `2M`-channel output of the hyper synthesis
    pub fn from_hyper_output(params: &ArrayView4<f32>) -> Result<Self, ElicError> {
        let (latent_means, latent_scales) = chunk_channels(params)?;
        Ok(HyperPriors {
            latent_means,
            latent_scales,
        })
    }

    /// `(batch, height, width)` of the latent grid these priors describe
    pub fn grid(&self) -> (usize, usize, usize) {
        let (b, _, h, w) = self.latent_means.dim();
        (b, h, w)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Context Aggregator
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-slice transforms, context predictors and parameter aggregators
pub struct ContextAggregator {
    scheduler: SliceScheduler,
    /// `cc_transforms[i - 1]` feeds slice `i`
    cc_transforms: Vec<Box<dyn Transform>>,
    context_prediction: Vec<Box<dyn Transform>>,
    aggregation: Vec<Box<dyn Transform>>,
}

impl std::fmt::Debug for ContextAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAggregator")
            .field("groups", self.scheduler.groups())
            .field("cc_transforms", &self.cc_transforms)
            .field("context_prediction", &self.context_prediction)
            .field("aggregation", &self.aggregation)
            .finish()
    }
}

impl ContextAggregator {
    /// Assemble an aggregator, checking every arity against the schedule
    pub fn new(
        scheduler: SliceScheduler,
        cc_transforms: Vec<Box<dyn Transform>>,
        context_prediction: Vec<Box<dyn Transform>>,
        aggregation: Vec<Box<dyn Transform>>,
    ) -> Result<Self, ElicError> {
        let k = scheduler.num_slices();
        check_count("cross-slice transforms", k - 1, cc_transforms.len())?;
        check_count("context predictors", k, context_prediction.len())?;
        check_count("parameter aggregators", k, aggregation.len())?;

        for (j, cc) in cc_transforms.iter().enumerate() {
            let i = j + 1;
            check_arity(
                cc.as_ref(),
                scheduler.cc_input_channels(i),
                scheduler.cc_output_channels(i),
            )?;
        }
        for (i, ctx) in context_prediction.iter().enumerate() {
            check_arity(ctx.as_ref(), scheduler.width(i), scheduler.context_channels(i))?;
        }
        for (i, agg) in aggregation.iter().enumerate() {
            check_arity(
                agg.as_ref(),
                scheduler.aggregation_input_channels(i),
                scheduler.aggregation_output_channels(i),
            )?;
        }

        Ok(ContextAggregator {
            scheduler,
            cc_transforms,
            context_prediction,
            aggregation,
        })
    }

    /// Build randomly initialized stand-in functions for `config`
    pub fn with_random_weights<R: Rng>(config: &ElicConfig, rng: &mut R) -> Result<Self, ElicError> {
        let scheduler = SliceScheduler::new(config.groups.clone());
        let k = scheduler.num_slices();
        let [cc0, cc1] = config.cc_hidden;
        let [agg0, agg1] = config.aggregation_hidden;

        let mut cc_transforms: Vec<Box<dyn Transform>> = Vec::with_capacity(k.saturating_sub(1));
        for i in 1..k {
            let name = format!("cc_transform_{}", i);
            cc_transforms.push(Box::new(Sequential::new(
                name.clone(),
                vec![
                    Box::new(Conv2d::kaiming(
                        format!("{}.0", name),
                        scheduler.cc_input_channels(i),
                        cc0,
                        5,
                        1,
                        2,
                        rng,
                    )?),
                    Box::new(Relu::new(cc0)),
                    Box::new(Conv2d::kaiming(format!("{}.2", name), cc0, cc1, 5, 1, 2, rng)?),
                    Box::new(Relu::new(cc1)),
                    Box::new(Conv2d::kaiming(
                        format!("{}.4", name),
                        cc1,
                        scheduler.cc_output_channels(i),
                        5,
                        1,
                        2,
                        rng,
                    )?),
                ],
            )?));
        }

        let mut context_prediction: Vec<Box<dyn Transform>> = Vec::with_capacity(k);
        for i in 0..k {
            context_prediction.push(Box::new(CheckerboardMaskedConv2d::kaiming(
                format!("context_prediction_{}", i),
                scheduler.width(i),
                scheduler.context_channels(i),
                config.context_kernel,
                rng,
            )?));
        }

        let mut aggregation: Vec<Box<dyn Transform>> = Vec::with_capacity(k);
        for i in 0..k {
            let name = format!("param_aggregation_{}", i);
            aggregation.push(Box::new(Sequential::new(
                name.clone(),
                vec![
                    Box::new(Conv2d::kaiming(
                        format!("{}.0", name),
                        scheduler.aggregation_input_channels(i),
                        agg0,
                        1,
                        1,
                        0,
                        rng,
                    )?),
                    Box::new(Relu::new(agg0)),
                    Box::new(Conv2d::kaiming(format!("{}.2", name), agg0, agg1, 1, 1, 0, rng)?),
                    Box::new(Relu::new(agg1)),
                    Box::new(Conv2d::kaiming(
                        format!("{}.4", name),
                        agg1,
                        scheduler.aggregation_output_channels(i),
                        1,
                        1,
                        0,
                        rng,
                    )?),
                ],
            )?));
        }

        ContextAggregator::new(scheduler, cc_transforms, context_prediction, aggregation)
    }

    /// The slice schedule
    pub fn scheduler(&self) -> &SliceScheduler {
        &self.scheduler
    }

    /// Support for slice `index` given the reconstructions of slices `0..index`
    pub fn support(
        &self,
        index: usize,
        decoded: &[Array4<f32>],
        priors: &HyperPriors,
    ) -> Result<Array4<f32>, ElicError> {
        let priors_only = [priors.latent_means.view(), priors.latent_scales.view()];
        let Some(cross) = self.scheduler.cross_slice_input(index, decoded)? else {
            return concat_channels(&priors_only);
        };

        let cc_out = self.cc_transforms[index - 1].forward(&cross.view())?;
        let (cc_means, cc_scales) = chunk_channels(&cc_out.view())?;
        concat_channels(&[
            cc_means.view(),
            cc_scales.view(),
            priors.latent_means.view(),
            priors.latent_scales.view(),
        ])
    }

    /// Spatial context for the anchor pass: all zeros
    pub fn anchor_context(&self, index: usize, priors: &HyperPriors) -> Array4<f32> {
        let (b, h, w) = priors.grid();
        Array4::zeros((b, self.scheduler.context_channels(index), h, w))
    }

    /// Spatial context for the non-anchor pass, predicted from the anchor grid
    ///
    /// `anchor_hat` is full resolution with zeros at non-anchor positions.
    pub fn non_anchor_context(
        &self,
        index: usize,
        anchor_hat: &ArrayView4<f32>,
    ) -> Result<Array4<f32>, ElicError> {
        self.context_prediction[index].forward(anchor_hat)
    }

    /// Spatial context for `parity`
    pub fn spatial_context(
        &self,
        index: usize,
        parity: Parity,
        priors: &HyperPriors,
        anchor_hat: Option<&ArrayView4<f32>>,
    ) -> Result<Array4<f32>, ElicError> {
        match (parity, anchor_hat) {
            (Parity::Anchor, _) => Ok(self.anchor_context(index, priors)),
            (Parity::NonAnchor, Some(anchor)) => self.non_anchor_context(index, anchor),
            (Parity::NonAnchor, None) => Err(ElicError::coding(format!(
                "non-anchor pass of slice {} started before its anchor pass",
                index
            ))),
        }
    }

    /// Run the parameter aggregation of slice `index`
    pub fn compute(
        &self,
        index: usize,
        support: &ArrayView4<f32>,
        spatial_context: &ArrayView4<f32>,
    ) -> Result<ParamPair, ElicError> {
        let input = concat_channels(&[spatial_context.view(), support.view()])?;
        let params = self.aggregation[index].forward(&input.view())?;
        let (means, scales) = chunk_channels(&params.view())?;
        trace!(slice = index, shape = ?means.dim(), "aggregated parameters");
        Ok(ParamPair::new(means, scales))
    }
}

fn check_count(what: &str, expected: usize, actual: usize) -> Result<(), ElicError> {
    if expected != actual {
        return Err(ElicError::invalid_config(format!(
            "expected {} {}, got {}",
            expected, what, actual
        )));
    }
    Ok(())
}

fn check_arity(f: &dyn Transform, input: usize, output: usize) -> Result<(), ElicError> {
    if f.in_channels() != input || f.out_channels() != output {
        return Err(ElicError::invalid_config(format!(
            "'{}' maps {} -> {} channels, schedule needs {} -> {}",
            f.name(),
            f.in_channels(),
            f.out_channels(),
            input,
            output
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::elic::config::GroupTable;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256StarStar;

    fn config() -> ElicConfig {
        ElicConfig::builder()
            .hyper_channels(4)
            .latent_channels(12)
            .groups(GroupTable::new(vec![0, 2, 2, 4, 4]).unwrap())
            .cc_hidden(6, 6)
            .aggregation_hidden(8, 8)
            .build()
            .unwrap()
    }

    fn aggregator() -> ContextAggregator {
        let mut rng = Xoshiro256StarStar::seed_from_u64(5);
        ContextAggregator::with_random_weights(&config(), &mut rng).unwrap()
    }

    fn priors() -> HyperPriors {
        let params = Array4::from_shape_fn((1, 24, 4, 4), |(_, c, h, w)| {
            ((c + h + w) % 5) as f32 * 0.3
        });
        HyperPriors::from_hyper_output(&params.view()).unwrap()
    }

    #[test]
    fn test_support_channels() {
        let agg = aggregator();
        let priors = priors();
        let decoded: Vec<Array4<f32>> = (0..4)
            .map(|i| Array4::from_elem((1, agg.scheduler().width(i), 4, 4), 1.0))
            .collect();

        for i in 0..4 {
            let support = agg.support(i, &decoded[..i], &priors).unwrap();
            assert_eq!(support.dim().1, agg.scheduler().support_channels(i));
        }
    }

    #[test]
    fn test_param_pair_shape() {
        let agg = aggregator();
        let priors = priors();
        let support = agg.support(0, &[], &priors).unwrap();
        let ctx = agg.anchor_context(0, &priors);
        let pair = agg.compute(0, &support.view(), &ctx.view()).unwrap();
        assert_eq!(pair.shape(), (1, 2, 4, 4));

        let values = Array4::<f32>::zeros((1, 2, 4, 4));
        assert!(pair.validate_against(&values.view()).is_ok());
        let wrong = Array4::<f32>::zeros((1, 3, 4, 4));
        assert!(pair.validate_against(&wrong.view()).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_non_anchor_requires_anchor() {
        let agg = aggregator();
        let err = agg
            .spatial_context(1, Parity::NonAnchor, &priors(), None)
            .unwrap_err();
        assert!(err.is_coding_error());
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let cfg = config();
        let scheduler = SliceScheduler::new(cfg.groups.clone());
        let mut rng = Xoshiro256StarStar::seed_from_u64(1);
        let good = ContextAggregator::with_random_weights(&cfg, &mut rng).unwrap();

        let mut ctx: Vec<Box<dyn Transform>> = Vec::new();
        for i in 0..4 {
            // one channel too many on every predictor
            ctx.push(Box::new(
                Conv2d::kaiming("ctx", scheduler.width(i) + 1, 2 * scheduler.width(i), 5, 1, 2, &mut rng)
                    .unwrap(),
            ));
        }
        let err = ContextAggregator::new(scheduler, good.cc_transforms, ctx, good.aggregation)
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
