//! ELIC Roundtrip Tests
//!
//! End-to-end checks that the decoder reproduces exactly the latent the
//! encoder committed to, for the default slice layout and small layouts.

mod common;

use std::sync::Arc;

use chandelier::codec::elic::{
    BitstreamRecord, CodecEngine, ElicConfig, ElicDecoder, ElicEncoder, ElicModel, Profiler,
    stages,
};
use common::{latent_setup, random_grid, random_image, small_config};

// ============================================================================
// Helpers
// ============================================================================

/// Default slice layout (M = 320, slices [16, 16, 32, 64, 192]) with narrow hidden layers
fn default_layout_model() -> Arc<ElicModel> {
    let config = ElicConfig::builder()
        .hyper_channels(8)
        .cc_hidden(32, 32)
        .aggregation_hidden(32, 32)
        .build()
        .expect("valid config");
    Arc::new(ElicModel::random(config).expect("model"))
}

fn small_model() -> Arc<ElicModel> {
    Arc::new(ElicModel::random(small_config()).expect("model"))
}

// ============================================================================
// Latent Roundtrip Tests
// ============================================================================

#[test]
fn test_default_layout_latent_roundtrip() {
    let model = default_layout_model();
    assert_eq!(model.config().groups.widths(), &[16, 16, 32, 64, 192]);

    let y = random_grid((1, 320, 16, 16), -6.0, 6.0, 11);
    let mut encoder = ElicEncoder::new(Arc::clone(&model));
    let encoded = encoder.compress_latent(&y.view()).unwrap();
    assert_eq!(encoded.record.strings.len(), 11);
    assert_eq!(encoded.record.shape, (4, 4));
    assert_eq!(encoded.y_hat.dim(), (1, 320, 16, 16));

    let mut decoder = ElicDecoder::new(model);
    let y_hat = decoder.decompress_latent(&encoded.record).unwrap();
    assert_eq!(y_hat, encoded.y_hat);
}

#[test]
fn test_engine_roundtrip_small_layout() {
    let config = small_config();
    let setup = latent_setup(&config, (2, 6, 8), 3);

    let mut engine = CodecEngine::new(&setup.aggregator, &setup.gaussian);
    let (strings, y_hat) = engine.encode_latent(&setup.y.view(), &setup.priors).unwrap();
    assert_eq!(strings.len(), config.num_slices());

    let decoded = engine.decode_latent(&strings, &setup.priors).unwrap();
    assert_eq!(decoded, y_hat);

    // Every reconstructed value sits within half a step of the input
    for (&hat, &value) in y_hat.iter().zip(setup.y.iter()) {
        assert!((hat - value).abs() <= 0.5 + 1e-4, "{} vs {}", hat, value);
    }
}

#[test]
fn test_roundtrip_with_escaped_values() {
    let config = small_config();
    let mut setup = latent_setup(&config, (1, 4, 4), 5);
    setup.y.mapv_inplace(|v| v * 250.0);

    let mut engine = CodecEngine::new(&setup.aggregator, &setup.gaussian);
    let (strings, y_hat) = engine.encode_latent(&setup.y.view(), &setup.priors).unwrap();
    let decoded = engine.decode_latent(&strings, &setup.priors).unwrap();

    assert_eq!(decoded, y_hat);
    assert!(y_hat.iter().any(|v| v.abs() > 100.0));
}

// ============================================================================
// Image Roundtrip Tests
// ============================================================================

#[test]
fn test_image_roundtrip() {
    let model = small_model();
    let mut encoder = ElicEncoder::new(Arc::clone(&model));
    let mut decoder = ElicDecoder::new(model);

    let x = random_image(1, 64, 64, 21);
    let encoded = encoder.compress(&x.view()).unwrap();
    assert_eq!(encoded.record.strings.len(), 9);

    let y_hat = decoder.decompress_latent(&encoded.record).unwrap();
    assert_eq!(y_hat, encoded.y_hat);

    let x_hat = decoder.decompress(&encoded.record).unwrap();
    assert_eq!(x_hat.dim(), x.dim());
    assert!(x_hat.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_batch_roundtrip_through_bytes() {
    let model = small_model();
    let mut encoder = ElicEncoder::new(Arc::clone(&model));
    let mut decoder = ElicDecoder::new(model);

    let x = random_image(2, 64, 128, 22);
    let encoded = encoder.compress(&x.view()).unwrap();
    assert_eq!(encoded.record.batch, 2);

    let bytes = encoded.record.to_bytes().unwrap();
    let record = BitstreamRecord::from_bytes(&bytes).unwrap();
    let y_hat = decoder.decompress_latent(&record).unwrap();

    assert_eq!(y_hat, encoded.y_hat);
    assert_eq!(decoder.stats().images_decoded, 2);
}

#[test]
fn test_compression_is_deterministic() {
    let model = small_model();
    let x = random_image(1, 64, 64, 23);

    let first = ElicEncoder::new(Arc::clone(&model)).compress(&x.view()).unwrap();
    let second = ElicEncoder::new(model).compress(&x.view()).unwrap();

    assert_eq!(first.record.strings, second.record.strings);
    assert_eq!(first.y_hat, second.y_hat);
}

#[test]
fn test_seeded_models_interoperate() {
    let x = random_image(1, 64, 64, 24);
    let encoded = ElicEncoder::new(small_model()).compress(&x.view()).unwrap();

    // An independently built model with the same seed decodes the record
    let mut decoder = ElicDecoder::new(small_model());
    assert_eq!(decoder.decompress_latent(&encoded.record).unwrap(), encoded.y_hat);
}

// ============================================================================
// Profiling Tests
// ============================================================================

#[test]
fn test_decoder_profiling() {
    let model = small_model();
    let x = random_image(1, 64, 64, 25);
    let encoded = ElicEncoder::new(Arc::clone(&model)).compress(&x.view()).unwrap();

    let mut decoder = ElicDecoder::new(model).with_profiler(Profiler::enabled());
    decoder.decompress(&encoded.record).unwrap();

    let profiler = decoder.profiler().unwrap();
    assert_eq!(profiler.count(stages::Y_DEC), 1);
    assert_eq!(profiler.count(stages::Z_DEC), 1);
    assert_eq!(profiler.count(stages::PARAMS), 1);
    // side string plus two passes per slice
    assert_eq!(profiler.count(stages::ENTROPY_DECODE), 9);
    assert!(profiler.report().contains(stages::Y_DEC));
}
