//! Common test utilities for Chandelier integration tests
//!
//! Seeded configurations, grids and codec parts shared by the ELIC test suites.

#![allow(dead_code)]

use chandelier::codec::elic::{
    ContextAggregator, ElicConfig, GaussianConditional, GroupTable, HyperPriors,
};
use ndarray::Array4;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

// ============================================================================
// Configurations
// ============================================================================

/// Small configuration: N = 4, M = 12, slices [2, 2, 4, 4]
pub fn small_config() -> ElicConfig {
    config_with_groups(4, vec![0, 2, 2, 4, 4])
}

/// Small configuration with five slices: [2, 2, 2, 2, 4]
pub fn five_slice_config() -> ElicConfig {
    config_with_groups(4, vec![0, 2, 2, 2, 2, 4])
}

/// Configuration over an explicit group table with narrow hidden layers
pub fn config_with_groups(n: usize, groups: Vec<usize>) -> ElicConfig {
    let groups = GroupTable::new(groups).expect("valid group table");
    ElicConfig::builder()
        .hyper_channels(n)
        .latent_channels(groups.total())
        .groups(groups)
        .cc_hidden(8, 8)
        .aggregation_hidden(16, 16)
        .seed(7)
        .build()
        .expect("valid config")
}

// ============================================================================
// Grids
// ============================================================================

/// Uniformly random grid in `[low, high)`
pub fn random_grid(shape: (usize, usize, usize, usize), low: f32, high: f32, seed: u64) -> Array4<f32> {
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    Array4::from_shape_fn(shape, |_| rng.gen_range(low..high))
}

/// Random image batch in `[0, 1)`
pub fn random_image(batch: usize, height: usize, width: usize, seed: u64) -> Array4<f32> {
    random_grid((batch, 3, height, width), 0.0, 1.0, seed)
}

// ============================================================================
// Latent coding parts
// ============================================================================

/// Everything the codec engine needs for one latent grid
pub struct LatentSetup {
    pub aggregator: ContextAggregator,
    pub gaussian: GaussianConditional,
    pub priors: HyperPriors,
    pub y: Array4<f32>,
}

/// Seeded aggregator, coder, priors and latent for `config` over `(b, h, w)`
pub fn latent_setup(config: &ElicConfig, grid: (usize, usize, usize), seed: u64) -> LatentSetup {
    let (b, h, w) = grid;
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    let aggregator = ContextAggregator::with_random_weights(config, &mut rng).expect("aggregator");
    let gaussian = GaussianConditional::from_config(config).expect("gaussian");

    let hyper = random_grid((b, 2 * config.m, h, w), -1.0, 3.0, seed + 1);
    let priors = HyperPriors::from_hyper_output(&hyper.view()).expect("priors");
    let y = random_grid((b, config.m, h, w), -8.0, 8.0, seed + 2);

    LatentSetup {
        aggregator,
        gaussian,
        priors,
        y,
    }
}
