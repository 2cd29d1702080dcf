//! ELIC codec error types
//!
//! This module provides structured error types for the checkerboard slice
//! codec. Every failure in this codec is a programming or data-integrity
//! error; nothing here is retried.

use thiserror::Error;

/// ELIC-specific error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ElicError {
    // ─────────────────────────────────────────────────────────────────────────
    // Framing Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// The string list does not have the `2k + 1` layout
    #[error(
        "ELIC bitstream framing error: expected {expected} strings for {num_slices} slices, got {actual}"
    )]
    Framing {
        /// Expected number of strings (2k + 1)
        expected: usize,
        /// Number of strings actually present
        actual: usize,
        /// Number of slices the decoder was configured for
        num_slices: usize,
    },

    /// Invalid serialized record header
    #[error("Invalid ELIC record header: {reason}")]
    InvalidHeader {
        /// Reason for invalidity
        reason: String,
    },

    /// Record corrupted or truncated
    #[error(
        "ELIC record corrupted at offset {offset}: {reason}. \
        The data may be damaged or incomplete."
    )]
    BitstreamCorrupted {
        /// Byte offset where corruption was detected
        offset: usize,
        /// Reason for corruption detection
        reason: String,
    },

    /// Unsupported record version
    #[error(
        "Unsupported ELIC record version {version}. \
        This codec supports versions {min_supported}-{max_supported}."
    )]
    UnsupportedBitstreamVersion {
        /// Version found in the record
        version: u8,
        /// Minimum supported version
        min_supported: u8,
        /// Maximum supported version
        max_supported: u8,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid configuration (group table, arities, scale table)
    #[error("Invalid ELIC configuration: {reason}")]
    InvalidConfig {
        /// Reason for invalidity
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Entropy Coding Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Contract violation against the probability tables (index out of range)
    #[error("ELIC coding error: {reason}")]
    Coding {
        /// Reason for failure
        reason: String,
    },

    /// Entropy coding error during encoding
    #[error("ELIC entropy encoding error: {reason}")]
    EntropyEncodingFailed {
        /// Reason for failure
        reason: String,
    },

    /// Entropy coding error during decoding
    #[error("ELIC entropy decoding error: {reason}")]
    EntropyDecodingFailed {
        /// Reason for failure
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Shape / Transform Errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Two grids that must agree in shape do not
    #[error("ELIC shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// A learned function rejected its input
    #[error("ELIC transform '{name}' failed: {reason}")]
    TransformFailed {
        /// Transform name
        name: String,
        /// Reason for failure
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O
    // ─────────────────────────────────────────────────────────────────────────
    /// I/O error (stringified to keep the error `Clone`)
    #[error("ELIC I/O error: {0}")]
    Io(String),
}

impl ElicError {
    // ─────────────────────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        ElicError::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a coding (contract) error
    pub fn coding(reason: impl Into<String>) -> Self {
        ElicError::Coding {
            reason: reason.into(),
        }
    }

    /// Create a framing error for a string list of the wrong length
    pub fn framing(num_slices: usize, actual: usize) -> Self {
        ElicError::Framing {
            expected: 2 * num_slices + 1,
            actual,
            num_slices,
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: &[usize],
        actual: &[usize],
    ) -> Self {
        ElicError::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Create a transform failure
    pub fn transform(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ElicError::TransformFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid header error
    pub fn invalid_header(reason: impl Into<String>) -> Self {
        ElicError::InvalidHeader {
            reason: reason.into(),
        }
    }

    /// Create a corruption error
    pub fn corrupted(offset: usize, reason: impl Into<String>) -> Self {
        ElicError::BitstreamCorrupted {
            offset,
            reason: reason.into(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Error category checks
    // ─────────────────────────────────────────────────────────────────────────

    /// Check if this error comes from the record layout
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            ElicError::Framing { .. }
                | ElicError::InvalidHeader { .. }
                | ElicError::BitstreamCorrupted { .. }
                | ElicError::UnsupportedBitstreamVersion { .. }
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, ElicError::InvalidConfig { .. })
    }

    /// Check if this is an entropy coding error
    pub fn is_coding_error(&self) -> bool {
        matches!(
            self,
            ElicError::Coding { .. }
                | ElicError::EntropyEncodingFailed { .. }
                | ElicError::EntropyDecodingFailed { .. }
        )
    }

    /// Check if this is a shape error
    pub fn is_shape_error(&self) -> bool {
        matches!(
            self,
            ElicError::ShapeMismatch { .. } | ElicError::TransformFailed { .. }
        )
    }
}

impl From<std::io::Error> for ElicError {
    fn from(err: std::io::Error) -> Self {
        ElicError::Io(err.to_string())
    }
}

impl From<ndarray::ShapeError> for ElicError {
    fn from(err: ndarray::ShapeError) -> Self {
        ElicError::ShapeMismatch {
            context: err.to_string(),
            expected: Vec::new(),
            actual: Vec::new(),
        }
    }
}
