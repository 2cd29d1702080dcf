//! Error handling tests for ELIC records
//!
//! Malformed, truncated or garbage input must come back as an error variant,
//! never as a panic.

mod common;

use std::panic;
use std::sync::Arc;

use chandelier::codec::elic::{
    BitstreamRecord, ElicDecoder, ElicEncoder, ElicError, ElicModel, HEADER_SIZE, MAGIC,
};
use chandelier::error::Error;
use common::{random_image, small_config};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse `data` and require an error without a panic
fn assert_rejected(data: &[u8], description: &str) -> ElicError {
    let owned = data.to_vec();
    match panic::catch_unwind(move || BitstreamRecord::from_bytes(&owned)) {
        Ok(Ok(_)) => panic!("{} was accepted", description),
        Ok(Err(err)) => err,
        Err(_) => panic!("Panic occurred during: {}", description),
    }
}

fn valid_bytes() -> Vec<u8> {
    BitstreamRecord::new(vec![vec![1, 2, 3], vec![], vec![4; 10]], (2, 3), 1)
        .to_bytes()
        .expect("serialize")
}

// ============================================================================
// Garbage Input
// ============================================================================

#[test]
fn test_empty_input() {
    let err = assert_rejected(&[], "empty input");
    assert!(matches!(err, ElicError::BitstreamCorrupted { offset: 0, .. }));
}

#[test]
fn test_random_garbage() {
    let mut rng = Xoshiro256StarStar::seed_from_u64(61);
    for len in [1, 7, HEADER_SIZE, 64, 1000] {
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let err = assert_rejected(&data, &format!("{} random bytes", len));
        assert!(err.is_framing_error());
    }
}

#[test]
fn test_garbage_after_magic() {
    let mut rng = Xoshiro256StarStar::seed_from_u64(62);
    for _ in 0..32 {
        let mut data = MAGIC.to_vec();
        data.push(1);
        data.push(0);
        data.extend((0..40).map(|_| rng.gen::<u8>()));
        assert_rejected(&data, "garbage header fields");
    }
}

#[test]
fn test_oversized_string_length() {
    let mut data = valid_bytes();
    // first string length sits right after the header
    data[HEADER_SIZE..HEADER_SIZE + 4].copy_from_slice(&u32::MAX.to_le_bytes());

    let err = assert_rejected(&data, "oversized string length");
    assert!(matches!(err, ElicError::BitstreamCorrupted { .. }));
}

// ============================================================================
// Header Fields
// ============================================================================

#[test]
fn test_unknown_version() {
    let mut data = valid_bytes();
    data[4] = 9;

    let err = assert_rejected(&data, "unknown version");
    assert_eq!(
        err,
        ElicError::UnsupportedBitstreamVersion {
            version: 9,
            min_supported: 1,
            max_supported: 1
        }
    );
}

#[test]
fn test_reserved_byte() {
    let mut data = valid_bytes();
    data[5] = 0xff;

    let err = assert_rejected(&data, "reserved byte");
    assert!(matches!(err, ElicError::InvalidHeader { .. }));
}

#[test]
fn test_every_truncation() {
    let data = valid_bytes();
    for cut in 0..data.len() {
        let err = assert_rejected(&data[..cut], &format!("truncation at {}", cut));
        assert!(err.is_framing_error(), "cut at {}: {}", cut, err);
    }
    assert!(BitstreamRecord::from_bytes(&data).is_ok());
}

// ============================================================================
// Decoder Input
// ============================================================================

/// Decode a record with a fresh small model and require an error without a panic
fn assert_decode_rejected(record: BitstreamRecord, description: &str) -> ElicError {
    let result = panic::catch_unwind(move || {
        let model = Arc::new(ElicModel::random(small_config()).expect("model"));
        ElicDecoder::new(model).decompress_latent(&record)
    });
    match result {
        Ok(Ok(_)) => panic!("{} was decoded", description),
        Ok(Err(err)) => err,
        Err(_) => panic!("Panic occurred during: {}", description),
    }
}

fn encoded_record() -> BitstreamRecord {
    let model = Arc::new(ElicModel::random(small_config()).expect("model"));
    let mut encoder = ElicEncoder::new(model);
    encoder
        .compress(&random_image(1, 64, 64, 71).view())
        .expect("encode")
        .record
}

#[test]
fn test_huge_side_shape_after_serialization() {
    let mut record = encoded_record();
    record.batch = u32::MAX as usize;
    record.shape = (u32::MAX as usize, u32::MAX as usize);
    let parsed = BitstreamRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
    assert_eq!(parsed.strings.len(), small_config().num_strings());

    let err = assert_decode_rejected(parsed, "batch and shape of u32::MAX");
    assert!(matches!(err, ElicError::InvalidHeader { .. }));
}

#[test]
fn test_large_side_shapes() {
    for (batch, shape) in [(1, (1 << 16, 1 << 16)), (1 << 20, (1, 1)), (1, (1 << 31, 1))] {
        let mut record = encoded_record();
        record.batch = batch;
        record.shape = shape;
        let err = assert_decode_rejected(record, &format!("batch {} shape {:?}", batch, shape));
        assert!(err.is_framing_error(), "{}", err);
    }
}

#[test]
fn test_damaged_strings_do_not_panic() {
    let mut rng = Xoshiro256StarStar::seed_from_u64(72);
    for i in 0..small_config().num_strings() {
        let mut record = encoded_record();
        record.strings[i] = (0..16).map(|_| rng.gen()).collect();
        let description = format!("random string {}", i);
        let result = panic::catch_unwind(move || {
            let model = Arc::new(ElicModel::random(small_config()).expect("model"));
            ElicDecoder::new(model).decompress_latent(&record)
        });
        assert!(result.is_ok(), "Panic occurred during: {}", description);
    }
}

// ============================================================================
// Crate Error
// ============================================================================

#[test]
fn test_codec_errors_convert() {
    fn parse(data: &[u8]) -> chandelier::Result<BitstreamRecord> {
        Ok(BitstreamRecord::from_bytes(data)?)
    }

    let err = parse(b"nope").unwrap_err();
    assert!(matches!(err, Error::Elic(_)));
    assert!(err.as_elic().is_some_and(|e| e.is_framing_error()));
}
