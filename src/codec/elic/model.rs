//! ELIC Model
//!
//! Bundles every learned function of the codec with the two entropy coders.
//!
//! ## Architecture
//!
//! ```text
//!   x --g_a--> y --h_a--> z --bottleneck--> z_hat --h_s--> (latent_means, latent_scales)
//!                |                                                 |
//!                +-------- slice schedule + checkerboard ----------+
//!                                      |
//!                                    y_hat --g_s--> x_hat
//! ```
//!
//! - **g_a / g_s**: analysis and synthesis transforms (spatial factor 16)
//! - **h_a / h_s**: hyper analysis and synthesis (spatial factor `hyper_factor`)
//! - **aggregator**: cross-slice transforms, context predictors and parameter
//!   aggregators (see [`ContextAggregator`])
//!
//! [`ElicModel::random`] builds seeded stand-ins with the published ELIC layer
//! shapes; [`ElicModel::from_parts`] accepts any [`Transform`]
//! implementations and checks their arities against the configuration.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chandelier::codec::elic::{ElicConfig, ElicModel, Quantizer};
//!
//! let model = ElicModel::random(ElicConfig::default())?;
//! let out = model.forward(&image.view(), true, &mut Quantizer::with_seed(0))?;
//! println!("bpp = {:.3}", out.bpp(64 * 64));
//! ```

use ndarray::{Array4, ArrayView4};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256StarStar;
use tracing::debug;

use super::config::ElicConfig;
use super::context::{ContextAggregator, HyperPriors};
use super::engine::CodecEngine;
use super::entropy::{EntropyBottleneck, GaussianConditional};
use super::error::ElicError;
use super::quantize::{QuantizeMode, Quantizer};
use super::transform::{Conv2d, Relu, Sequential, Transform, Upsample};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Channels of the input image
pub const IMAGE_CHANNELS: usize = 3;

/// Spatial downsampling of the analysis transform (H/16, W/16)
pub const LATENT_SPATIAL_FACTOR: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Forward Output
// ─────────────────────────────────────────────────────────────────────────────

/// Output of the likelihood-estimation path
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Reconstructed image
    pub x_hat: Array4<f32>,
    /// Likelihoods of the latent
    pub y_likelihoods: Array4<f32>,
    /// Likelihoods of the side information
    pub z_likelihoods: Array4<f32>,
}

impl ForwardOutput {
    /// Estimated size in bits, `sum(-log2(likelihood))`
    pub fn bits(&self) -> f64 {
        self.y_likelihoods
            .iter()
            .chain(self.z_likelihoods.iter())
            .map(|&l| -(l as f64).log2())
            .sum()
    }

    /// Estimated bits per pixel over `num_pixels` pixels (batch included)
    pub fn bpp(&self, num_pixels: usize) -> f64 {
        if num_pixels == 0 {
            return 0.0;
        }
        self.bits() / num_pixels as f64
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────────────────────────────────────

/// The four image-level transforms
pub struct ImageTransforms {
    /// Analysis transform (3 -> M)
    pub g_a: Box<dyn Transform>,
    /// Synthesis transform (M -> 3)
    pub g_s: Box<dyn Transform>,
    /// Hyper analysis (M -> N)
    pub h_a: Box<dyn Transform>,
    /// Hyper synthesis (N -> 2M)
    pub h_s: Box<dyn Transform>,
}

/// Learned functions plus both entropy coders
pub struct ElicModel {
    config: ElicConfig,
    transforms: ImageTransforms,
    aggregator: ContextAggregator,
    gaussian: GaussianConditional,
    bottleneck: EntropyBottleneck,
}

impl std::fmt::Debug for ElicModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElicModel")
            .field("groups", &self.config.groups)
            .field("g_a", &self.transforms.g_a)
            .field("g_s", &self.transforms.g_s)
            .field("h_a", &self.transforms.h_a)
            .field("h_s", &self.transforms.h_s)
            .field("aggregator", &self.aggregator)
            .finish()
    }
}

impl ElicModel {
    /// Assemble a model, checking every arity against `config`
    pub fn from_parts(
        config: ElicConfig,
        transforms: ImageTransforms,
        aggregator: ContextAggregator,
        bottleneck: EntropyBottleneck,
    ) -> Result<Self, ElicError> {
        config.validate()?;

        let (n, m) = (config.n, config.m);
        check_arity(transforms.g_a.as_ref(), IMAGE_CHANNELS, m)?;
        check_arity(transforms.g_s.as_ref(), m, IMAGE_CHANNELS)?;
        check_arity(transforms.h_a.as_ref(), m, n)?;
        check_arity(transforms.h_s.as_ref(), n, 2 * m)?;

        if aggregator.scheduler().groups() != &config.groups {
            return Err(ElicError::invalid_config(format!(
                "aggregator built for groups {}, config has {}",
                aggregator.scheduler().groups(),
                config.groups
            )));
        }
        if bottleneck.channels() != n {
            return Err(ElicError::invalid_config(format!(
                "bottleneck has {} channels, hyper path has {}",
                bottleneck.channels(),
                n
            )));
        }

        let gaussian = GaussianConditional::from_config(&config)?;
        Ok(ElicModel {
            config,
            transforms,
            aggregator,
            gaussian,
            bottleneck,
        })
    }

    /// Seeded stand-in model with the published ELIC layer shapes
    pub fn random(config: ElicConfig) -> Result<Self, ElicError> {
        config.validate()?;
        if !config.hyper_factor.is_power_of_two() {
            return Err(ElicError::invalid_config(format!(
                "stand-in hyper transforms need a power-of-two factor, got {}",
                config.hyper_factor
            )));
        }

        let mut rng = Xoshiro256StarStar::seed_from_u64(config.seed);
        let (n, m) = (config.n, config.m);
        let hyper_stages = config.hyper_factor.trailing_zeros() as usize;

        let g_a = Sequential::new(
            "g_a",
            vec![
                Box::new(Conv2d::kaiming("g_a.0", IMAGE_CHANNELS, n, 5, 2, 2, &mut rng)?),
                Box::new(Relu::new(n)),
                Box::new(Conv2d::kaiming("g_a.2", n, n, 5, 2, 2, &mut rng)?),
                Box::new(Relu::new(n)),
                Box::new(Conv2d::kaiming("g_a.4", n, n, 5, 2, 2, &mut rng)?),
                Box::new(Relu::new(n)),
                Box::new(Conv2d::kaiming("g_a.6", n, m, 5, 2, 2, &mut rng)?),
            ],
        )?;

        let mut g_s_layers: Vec<Box<dyn Transform>> = Vec::new();
        let widths = [m, n, n, n, IMAGE_CHANNELS];
        for (i, pair) in widths.windows(2).enumerate() {
            if i > 0 {
                g_s_layers.push(Box::new(Relu::new(pair[0])));
            }
            g_s_layers.push(Box::new(Upsample::new(pair[0], 2)));
            g_s_layers.push(Box::new(Conv2d::kaiming(
                format!("g_s.{}", i),
                pair[0],
                pair[1],
                5,
                1,
                2,
                &mut rng,
            )?));
        }
        let g_s = Sequential::new("g_s", g_s_layers)?;

        let mut h_a_layers: Vec<Box<dyn Transform>> =
            vec![Box::new(Conv2d::kaiming("h_a.0", m, n, 3, 1, 1, &mut rng)?)];
        for stage in 0..hyper_stages {
            h_a_layers.push(Box::new(Relu::new(n)));
            h_a_layers.push(Box::new(Conv2d::kaiming(
                format!("h_a.{}", stage + 1),
                n,
                n,
                5,
                2,
                2,
                &mut rng,
            )?));
        }
        let h_a = Sequential::new("h_a", h_a_layers)?;

        let wide = n * 3 / 2;
        let mut h_s_layers: Vec<Box<dyn Transform>> = Vec::new();
        let mut channels = n;
        for stage in 0..hyper_stages {
            let out = if stage + 1 == hyper_stages { wide } else { n };
            h_s_layers.push(Box::new(Upsample::new(channels, 2)));
            h_s_layers.push(Box::new(Conv2d::kaiming(
                format!("h_s.{}", stage),
                channels,
                out,
                5,
                1,
                2,
                &mut rng,
            )?));
            h_s_layers.push(Box::new(Relu::new(out)));
            channels = out;
        }
        h_s_layers.push(Box::new(Conv2d::kaiming(
            format!("h_s.{}", hyper_stages),
            channels,
            2 * m,
            3,
            1,
            1,
            &mut rng,
        )?));
        let h_s = Sequential::new("h_s", h_s_layers)?;

        let aggregator = ContextAggregator::with_random_weights(&config, &mut rng)?;
        let bottleneck = EntropyBottleneck::with_random_prior(
            n,
            config.tail_mass,
            config.likelihood_bound,
            &mut rng,
        )?;

        debug!(
            n,
            m,
            slices = config.num_slices(),
            seed = config.seed,
            "built stand-in model"
        );

        Self::from_parts(
            config,
            ImageTransforms {
                g_a: Box::new(g_a),
                g_s: Box::new(g_s),
                h_a: Box::new(h_a),
                h_s: Box::new(h_s),
            },
            aggregator,
            bottleneck,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// The configuration
    pub fn config(&self) -> &ElicConfig {
        &self.config
    }

    /// The context aggregator
    pub fn aggregator(&self) -> &ContextAggregator {
        &self.aggregator
    }

    /// The scalar latent coder
    pub fn gaussian(&self) -> &GaussianConditional {
        &self.gaussian
    }

    /// The side-information coder
    pub fn bottleneck(&self) -> &EntropyBottleneck {
        &self.bottleneck
    }

    /// A codec engine over this model's aggregator and scalar coder
    pub fn engine(&self) -> CodecEngine<'_> {
        CodecEngine::new(&self.aggregator, &self.gaussian)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transforms
    // ─────────────────────────────────────────────────────────────────────────

    /// Image to latent
    pub fn analysis(&self, x: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        self.transforms.g_a.forward(x)
    }

    /// Latent to image (unclamped)
    pub fn synthesis(&self, y_hat: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        self.transforms.g_s.forward(y_hat)
    }

    /// Latent to side information
    pub fn hyper_analysis(&self, y: &ArrayView4<f32>) -> Result<Array4<f32>, ElicError> {
        self.transforms.h_a.forward(y)
    }

    /// Quantized side information to hyper priors
    pub fn hyper_priors(&self, z_hat: &ArrayView4<f32>) -> Result<HyperPriors, ElicError> {
        let params = self.transforms.h_s.forward(z_hat)?;
        HyperPriors::from_hyper_output(&params.view())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Estimation
    // ─────────────────────────────────────────────────────────────────────────

    /// Run the full model without producing a bitstream
    ///
    /// `noisequant` selects uniform noise for the coded values; otherwise all
    /// quantization is rounding around the predicted means.
    pub fn forward(
        &self,
        x: &ArrayView4<f32>,
        noisequant: bool,
        quantizer: &mut Quantizer,
    ) -> Result<ForwardOutput, ElicError> {
        let y = self.analysis(x)?;
        let z = self.hyper_analysis(&y.view())?;

        let mode = if noisequant {
            QuantizeMode::Noise
        } else {
            QuantizeMode::Ste
        };
        let (z_hat, z_likelihoods) = self.bottleneck.forward(&z.view(), mode, quantizer)?;
        let priors = self.hyper_priors(&z_hat.view())?;
        check_priors_grid(&y.view(), &priors)?;

        let estimate = self
            .engine()
            .estimate(&y.view(), &priors, noisequant, quantizer)?;
        let x_hat = self.synthesis(&estimate.y_hat.view())?;

        Ok(ForwardOutput {
            x_hat,
            y_likelihoods: estimate.y_likelihoods,
            z_likelihoods,
        })
    }

    /// Deterministic estimation: rounding everywhere
    pub fn inference(&self, x: &ArrayView4<f32>) -> Result<ForwardOutput, ElicError> {
        self.forward(x, false, &mut Quantizer::default())
    }
}

/// Check that hyper priors cover the latent grid position for position
pub(crate) fn check_priors_grid(y: &ArrayView4<f32>, priors: &HyperPriors) -> Result<(), ElicError> {
    let (b, _, h, w) = y.dim();
    if priors.grid() != (b, h, w) {
        let (pb, ph, pw) = priors.grid();
        return Err(ElicError::shape_mismatch(
            "hyper priors vs latent grid (batch, height, width)",
            &[b, h, w],
            &[pb, ph, pw],
        ));
    }
    Ok(())
}

fn check_arity(f: &dyn Transform, input: usize, output: usize) -> Result<(), ElicError> {
    if f.in_channels() != input || f.out_channels() != output {
        return Err(ElicError::invalid_config(format!(
            "'{}' maps {} -> {} channels, model needs {} -> {}",
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
    use rand::Rng;

    fn small_config() -> ElicConfig {
        ElicConfig::builder()
            .hyper_channels(4)
            .latent_channels(12)
            .groups(GroupTable::new(vec![0, 2, 2, 4, 4]).unwrap())
            .cc_hidden(6, 6)
            .aggregation_hidden(8, 8)
            .seed(3)
            .build()
            .unwrap()
    }

    fn image(seed: u64) -> Array4<f32> {
        let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
        Array4::from_shape_fn((1, 3, 64, 64), |_| rng.gen_range(0.0f32..1.0))
    }

    #[test]
    fn test_random_model_shapes() {
        let model = ElicModel::random(small_config()).unwrap();
        let x = image(1);
        let y = model.analysis(&x.view()).unwrap();
        assert_eq!(y.dim(), (1, 12, 4, 4));

        let z = model.hyper_analysis(&y.view()).unwrap();
        assert_eq!(z.dim(), (1, 4, 1, 1));

        let priors = model.hyper_priors(&z.view()).unwrap();
        assert_eq!(priors.grid(), (1, 4, 4));
        assert_eq!(model.synthesis(&y.view()).unwrap().dim(), (1, 3, 64, 64));
    }

    #[test]
    fn test_random_model_is_seeded() {
        let a = ElicModel::random(small_config()).unwrap();
        let b = ElicModel::random(small_config()).unwrap();
        let x = image(2);
        assert_eq!(
            a.analysis(&x.view()).unwrap(),
            b.analysis(&x.view()).unwrap()
        );
    }

    #[test]
    fn test_forward_outputs() {
        let model = ElicModel::random(small_config()).unwrap();
        let x = image(4);
        let out = model
            .forward(&x.view(), true, &mut Quantizer::with_seed(1))
            .unwrap();
        assert_eq!(out.x_hat.dim(), x.dim());
        assert_eq!(out.y_likelihoods.dim(), (1, 12, 4, 4));
        assert_eq!(out.z_likelihoods.dim(), (1, 4, 1, 1));
        assert!(out.bits() > 0.0);
        assert!(out.bpp(64 * 64) > 0.0);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let model = ElicModel::random(small_config()).unwrap();
        let x = image(5);
        let a = model.inference(&x.view()).unwrap();
        let b = model.inference(&x.view()).unwrap();
        assert_eq!(a.x_hat, b.x_hat);
        assert_eq!(a.y_likelihoods, b.y_likelihoods);
    }

    #[test]
    fn test_from_parts_rejects_wrong_arity() {
        let config = small_config();
        let mut rng = Xoshiro256StarStar::seed_from_u64(0);
        let conv = |i: usize, o: usize, rng: &mut Xoshiro256StarStar| -> Box<dyn Transform> {
            Box::new(Conv2d::kaiming("f", i, o, 1, 1, 0, rng).unwrap())
        };
        let transforms = ImageTransforms {
            g_a: conv(3, 12, &mut rng),
            g_s: conv(12, 3, &mut rng),
            h_a: conv(12, 5, &mut rng),
            h_s: conv(4, 24, &mut rng),
        };
        let aggregator = ContextAggregator::with_random_weights(&config, &mut rng).unwrap();
        let bottleneck = EntropyBottleneck::with_random_prior(4, 1e-9, 1e-9, &mut rng).unwrap();

        let err = ElicModel::from_parts(config, transforms, aggregator, bottleneck).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_random_rejects_odd_hyper_factor() {
        let mut config = small_config();
        config.hyper_factor = 3;
        assert!(ElicModel::random(config).unwrap_err().is_config_error());
    }
}
