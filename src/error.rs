//! Error types for Chandelier

use thiserror::Error;

use crate::codec::elic::ElicError;

/// Result type alias for Chandelier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Chandelier
#[derive(Error, Debug)]
pub enum Error {
    /// Codec error
    #[error(transparent)]
    Elic(#[from] ElicError),

    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

impl Error {
    /// The codec error, if this is one
    pub fn as_elic(&self) -> Option<&ElicError> {
        match self {
            Error::Elic(e) => Some(e),
            _ => None,
        }
    }
}
