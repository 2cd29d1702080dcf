//! Chandelier - checkerboard slice-context entropy coding for learned image compression
//!
//! Chandelier implements the entropy-coding core of the ELIC learned image
//! codec: uneven channel slices with bounded cross-slice context, two-pass
//! checkerboard coding inside each slice, and the framing of the resulting
//! strings into a bitstream record.
//!
//! # Architecture
//!
//! - `codec::elic`: the codec (configuration, slice schedule, checkerboard,
//!   context aggregation, entropy coders, engine, encoder and decoder)
//! - `error`: crate-level error type
//!
//! The learned functions of the codec are plain [`codec::elic::Transform`]
//! implementations; the crate ships seeded stand-ins with the published
//! layer shapes so that every path can be exercised without trained weights.

pub mod codec;
pub mod error;

pub use error::{Error, Result};

/// Chandelier version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;

/// Configuration for the library
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Maximum number of threads used for batch-parallel convolutions
    pub max_threads: Option<usize>,
    /// Enable info-level logging
    pub verbose: bool,
    /// Enable debug-level logging
    pub debug: bool,
}

/// Initialize the thread pool and logging
///
/// Fails if a global thread pool or subscriber is already installed.
pub fn init(config: Config) -> Result<()> {
    if let Some(threads) = config.max_threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| Error::Init(format!("Failed to initialize thread pool: {}", e)))?;
    }

    if config.verbose || config.debug {
        let level = if config.debug { "debug" } else { "info" };
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(level))
            .try_init()
            .map_err(|e| Error::Init(format!("Failed to initialize logging: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION_MAJOR, 0);
        assert_eq!(VERSION_MINOR, 1);
        assert_eq!(VERSION_PATCH, 0);
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_threads, None);
        assert!(!config.verbose);
        assert!(!config.debug);
    }

    #[test]
    fn test_init_without_options() {
        assert!(init(Config::default()).is_ok());
    }
}
