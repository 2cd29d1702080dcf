//! ELIC Context Tests
//!
//! Checkerboard partition and the bounded cross-slice context: the
//! parameters of slice `i` read slice 0 and slice `i - 1`, nothing else.

mod common;

use chandelier::codec::elic::checkerboard::{self, Parity};
use chandelier::codec::elic::{ContextAggregator, HyperPriors, ParamPair, SliceScheduler};
use ndarray::Array4;
use common::{five_slice_config, latent_setup, random_grid};

// ============================================================================
// Helpers
// ============================================================================

/// Anchor-pass parameters of slice `index` given the reconstructions before it
fn anchor_params(
    aggregator: &ContextAggregator,
    index: usize,
    decoded: &[Array4<f32>],
    priors: &HyperPriors,
) -> ParamPair {
    let support = aggregator.support(index, decoded, priors).unwrap();
    let context = aggregator.anchor_context(index, priors);
    aggregator
        .compute(index, &support.view(), &context.view())
        .unwrap()
}

fn decoded_slices(scheduler: &SliceScheduler, count: usize, seed: u64) -> Vec<Array4<f32>> {
    (0..count)
        .map(|i| {
            let width = scheduler.width(i);
            random_grid((1, width, 4, 6), -4.0, 4.0, seed + i as u64).mapv(f32::round)
        })
        .collect()
}

// ============================================================================
// Checkerboard Tests
// ============================================================================

#[test]
fn test_checkerboard_partitions_grid() {
    for (h, w) in [(1, 2), (3, 4), (4, 6), (5, 10)] {
        let grid = random_grid((2, 3, h, w), -10.0, 10.0, (h * w) as u64);

        let (anchor, non_anchor) = checkerboard::split(&grid.view());
        let merged = checkerboard::merge(&anchor.view(), &non_anchor.view()).unwrap();
        assert_eq!(merged, grid);

        for parity in [Parity::Anchor, Parity::NonAnchor] {
            let packed = checkerboard::pack(&grid.view(), parity).unwrap();
            assert_eq!(packed.dim(), (2, 3, h, w / 2));
            let unpacked = checkerboard::unpack(&packed.view(), parity, w).unwrap();
            assert_eq!(unpacked, checkerboard::mask(&grid.view(), parity));
        }
    }
}

#[test]
fn test_anchor_positions() {
    assert!(Parity::Anchor.contains(0, 0));
    assert!(Parity::Anchor.contains(1, 1));
    assert!(Parity::NonAnchor.contains(0, 1));
    assert!(Parity::NonAnchor.contains(1, 0));
    assert_eq!(Parity::Anchor.complement(), Parity::NonAnchor);
}

#[test]
fn test_odd_width_rejected() {
    let grid = Array4::<f32>::zeros((1, 1, 4, 5));
    let err = checkerboard::pack(&grid.view(), Parity::Anchor).unwrap_err();
    assert!(err.is_shape_error());
}

// ============================================================================
// Spatial Context Tests
// ============================================================================

#[test]
fn test_non_anchor_context_reads_only_anchors() {
    let config = five_slice_config();
    let setup = latent_setup(&config, (1, 4, 6), 41);
    let aggregator = &setup.aggregator;

    let grid = random_grid((1, 2, 4, 6), -3.0, 3.0, 42);
    let anchor_hat = checkerboard::mask(&grid.view(), Parity::Anchor);
    let base = aggregator.non_anchor_context(1, &anchor_hat.view()).unwrap();

    // Values at non-anchor positions never reach non-anchor outputs
    let noisy = aggregator.non_anchor_context(1, &grid.view()).unwrap();
    assert_eq!(
        checkerboard::mask(&base.view(), Parity::NonAnchor),
        checkerboard::mask(&noisy.view(), Parity::NonAnchor)
    );

    // while the anchors themselves do
    let shifted = anchor_hat.mapv(|v| v + 5.0);
    let moved = aggregator.non_anchor_context(1, &shifted.view()).unwrap();
    assert_ne!(
        checkerboard::mask(&base.view(), Parity::NonAnchor),
        checkerboard::mask(&moved.view(), Parity::NonAnchor)
    );
}

#[test]
fn test_anchor_context_is_zero() {
    let config = five_slice_config();
    let setup = latent_setup(&config, (1, 4, 6), 43);
    let context = setup.aggregator.anchor_context(3, &setup.priors);
    assert!(context.iter().all(|&v| v == 0.0));
}

// ============================================================================
// Cross-Slice Context Tests
// ============================================================================

#[test]
fn test_context_sources() {
    let scheduler = SliceScheduler::new(five_slice_config().groups);
    assert!(scheduler.context_sources(0).is_empty());
    assert_eq!(scheduler.context_sources(1), vec![0]);
    assert_eq!(scheduler.context_sources(2), vec![0, 1]);
    assert_eq!(scheduler.context_sources(4), vec![0, 3]);
}

#[test]
fn test_last_slice_ignores_middle_slices() {
    let config = five_slice_config();
    let setup = latent_setup(&config, (1, 4, 6), 44);
    let aggregator = &setup.aggregator;
    let decoded = decoded_slices(aggregator.scheduler(), 4, 45);

    let base = anchor_params(aggregator, 4, &decoded, &setup.priors);

    for untouched in [1, 2] {
        let mut perturbed = decoded.clone();
        perturbed[untouched].mapv_inplace(|v| v + 7.0);
        let params = anchor_params(aggregator, 4, &perturbed, &setup.priors);
        assert_eq!(params, base, "slice {} leaked into slice 4", untouched);
    }
}

#[test]
fn test_last_slice_reads_first_and_previous() {
    let config = five_slice_config();
    let setup = latent_setup(&config, (1, 4, 6), 46);
    let aggregator = &setup.aggregator;
    let decoded = decoded_slices(aggregator.scheduler(), 4, 47);

    let base = anchor_params(aggregator, 4, &decoded, &setup.priors);

    for source in [0, 3] {
        let mut perturbed = decoded.clone();
        perturbed[source].mapv_inplace(|v| v + 7.0);
        let params = anchor_params(aggregator, 4, &perturbed, &setup.priors);
        assert_ne!(params, base, "slice {} should feed slice 4", source);
    }
}

#[test]
fn test_first_slice_uses_priors_only() {
    let config = five_slice_config();
    let setup = latent_setup(&config, (1, 4, 6), 48);
    let aggregator = &setup.aggregator;

    let support = aggregator.support(0, &[], &setup.priors).unwrap();
    assert_eq!(support.dim(), (1, 2 * config.m, 4, 6));

    let decoded = decoded_slices(aggregator.scheduler(), 2, 49);
    let with_history = aggregator.support(0, &decoded, &setup.priors).unwrap();
    assert_eq!(support, with_history);
}

#[test]
fn test_support_requires_history() {
    let config = five_slice_config();
    let setup = latent_setup(&config, (1, 4, 6), 50);
    let decoded = decoded_slices(setup.aggregator.scheduler(), 2, 51);

    let err = setup
        .aggregator
        .support(3, &decoded, &setup.priors)
        .unwrap_err();
    assert!(err.is_shape_error());
}
