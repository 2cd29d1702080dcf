//! ELIC codec configuration
//!
//! This module holds the slice group table, the scale table bounds used by the
//! Gaussian conditional coder, and the channel widths of the learned functions.
//! Configurations are validated once at construction time; the coding paths
//! never re-check them per call.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::ElicError;

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default channel count of the hyper (side-information) path
pub const DEFAULT_HYPER_CHANNELS: usize = 192;

/// Default channel count of the latent grid (M)
pub const DEFAULT_LATENT_CHANNELS: usize = 320;

/// Default uneven slice table: five slices of 16, 16, 32, 64 and 192 channels
pub const DEFAULT_GROUPS: [usize; 6] = [0, 16, 16, 32, 64, 192];

/// Lower bound of the scale table (and of every coded scale)
pub const DEFAULT_SCALES_MIN: f32 = 0.11;

/// Upper bound of the scale table
pub const DEFAULT_SCALES_MAX: f32 = 256.0;

/// Number of log-spaced scale levels
pub const DEFAULT_SCALES_LEVELS: usize = 64;

/// Probability mass left outside the coded symbol range
pub const DEFAULT_TAIL_MASS: f64 = 1e-9;

/// Smallest likelihood reported by the estimation path
pub const DEFAULT_LIKELIHOOD_BOUND: f32 = 1e-9;

/// Kernel size of the checkerboard context predictor
pub const DEFAULT_CONTEXT_KERNEL: usize = 5;

/// Spatial ratio between the latent grid and the side-information grid
pub const DEFAULT_HYPER_FACTOR: usize = 4;

/// Default seed for deterministic weights
pub const DEFAULT_SEED: u64 = 0x5EED_E11C;

/// Default cap on decoded latent elements per record (about 8192x8192 pixels)
pub const DEFAULT_MAX_LATENT_ELEMENTS: usize = 1 << 27;

// ─────────────────────────────────────────────────────────────────────────────
// Group Table
// ─────────────────────────────────────────────────────────────────────────────

/// Channel partition of the latent grid into slices
///
/// Stored as `[0, g1, g2, ..., gk]`: slice `i` (0-based) owns `g(i+1)`
/// channels starting at `g1 + ... + gi`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct GroupTable {
    entries: Vec<usize>,
}

impl GroupTable {
    /// Create a validated group table
    pub fn new(entries: Vec<usize>) -> Result<Self, ElicError> {
        if entries.len() < 2 {
            return Err(ElicError::invalid_config(format!(
                "group table needs a leading 0 and at least one slice, got {:?}",
                entries
            )));
        }
        if entries[0] != 0 {
            return Err(ElicError::invalid_config(format!(
                "group table must start with 0, got {}",
                entries[0]
            )));
        }
        if let Some(pos) = entries[1..].iter().position(|&g| g == 0) {
            return Err(ElicError::invalid_config(format!(
                "slice {} has zero width",
                pos
            )));
        }
        Ok(GroupTable { entries })
    }

    /// Raw entries including the leading 0
    pub fn entries(&self) -> &[usize] {
        &self.entries
    }

    /// Number of slices (k)
    pub fn num_slices(&self) -> usize {
        self.entries.len() - 1
    }

    /// Channel width of slice `index`
    pub fn width(&self, index: usize) -> usize {
        self.entries[index + 1]
    }

    /// First channel owned by slice `index`
    pub fn offset(&self, index: usize) -> usize {
        self.entries[1..=index].iter().sum()
    }

    /// Channel range `[start, end)` of slice `index`
    pub fn channel_range(&self, index: usize) -> std::ops::Range<usize> {
        let start = self.offset(index);
        start..start + self.width(index)
    }

    /// Total channel count (M)
    pub fn total(&self) -> usize {
        self.entries.iter().sum()
    }

    /// Slice widths without the leading 0
    pub fn widths(&self) -> &[usize] {
        &self.entries[1..]
    }
}

impl Default for GroupTable {
    fn default() -> Self {
        GroupTable {
            entries: DEFAULT_GROUPS.to_vec(),
        }
    }
}

impl TryFrom<Vec<usize>> for GroupTable {
    type Error = ElicError;

    fn try_from(value: Vec<usize>) -> Result<Self, Self::Error> {
        GroupTable::new(value)
    }
}

impl From<GroupTable> for Vec<usize> {
    fn from(table: GroupTable) -> Self {
        table.entries
    }
}

impl fmt::Display for GroupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.entries)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scale Table
// ─────────────────────────────────────────────────────────────────────────────

/// Bounds of the log-spaced scale table used by the Gaussian conditional coder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleTableConfig {
    /// Smallest scale (also the scale lower bound)
    pub min: f32,
    /// Largest scale
    pub max: f32,
    /// Number of levels
    pub levels: usize,
}

impl Default for ScaleTableConfig {
    fn default() -> Self {
        ScaleTableConfig {
            min: DEFAULT_SCALES_MIN,
            max: DEFAULT_SCALES_MAX,
            levels: DEFAULT_SCALES_LEVELS,
        }
    }
}

impl ScaleTableConfig {
    /// Build the table `exp(linspace(ln min, ln max, levels))`
    pub fn build(&self) -> Vec<f32> {
        let log_min = (self.min as f64).ln();
        let log_max = (self.max as f64).ln();
        let steps = (self.levels - 1).max(1) as f64;

        (0..self.levels)
            .map(|i| {
                let t = i as f64 / steps;
                (log_min + t * (log_max - log_min)).exp() as f32
            })
            .collect()
    }

    /// Validate the bounds
    pub fn validate(&self) -> Result<(), ElicError> {
        if !(self.min > 0.0 && self.min.is_finite()) {
            return Err(ElicError::invalid_config(format!(
                "scale table minimum must be positive, got {}",
                self.min
            )));
        }
        if !(self.max > self.min && self.max.is_finite()) {
            return Err(ElicError::invalid_config(format!(
                "scale table maximum {} must exceed minimum {}",
                self.max, self.min
            )));
        }
        if self.levels < 2 {
            return Err(ElicError::invalid_config(format!(
                "scale table needs at least 2 levels, got {}",
                self.levels
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Main Configuration Struct
// ─────────────────────────────────────────────────────────────────────────────

/// Complete ELIC codec configuration
///
/// Use the builder pattern via `ElicConfig::builder()` for ergonomic construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElicConfig {
    // ── Channel Layout ──
    /// Channel count of the hyper path (N)
    pub n: usize,

    /// Channel count of the latent grid (M)
    pub m: usize,

    /// Slice partition of the latent channels
    pub groups: GroupTable,

    // ── Entropy Model ──
    /// Scale table bounds
    pub scale_table: ScaleTableConfig,

    /// Tail mass excluded from the directly coded symbol range
    pub tail_mass: f64,

    /// Lower bound on estimated likelihoods
    pub likelihood_bound: f32,

    // ── Learned Function Widths ──
    /// Kernel size of the checkerboard context predictor
    pub context_kernel: usize,

    /// Hidden widths of each cross-slice context transform
    pub cc_hidden: [usize; 2],

    /// Hidden widths of each parameter aggregation function
    pub aggregation_hidden: [usize; 2],

    /// Latent size divided by side-information size
    pub hyper_factor: usize,

    /// Seed for deterministic weights
    pub seed: u64,

    // ── Limits ──
    /// Largest latent grid (`batch * M * h * w`) a record may describe
    pub max_latent_elements: usize,
}

impl Default for ElicConfig {
    fn default() -> Self {
        ElicConfig {
            n: DEFAULT_HYPER_CHANNELS,
            m: DEFAULT_LATENT_CHANNELS,
            groups: GroupTable::default(),
            scale_table: ScaleTableConfig::default(),
            tail_mass: DEFAULT_TAIL_MASS,
            likelihood_bound: DEFAULT_LIKELIHOOD_BOUND,
            context_kernel: DEFAULT_CONTEXT_KERNEL,
            cc_hidden: [224, 128],
            aggregation_hidden: [DEFAULT_LATENT_CHANNELS * 2, 512],
            hyper_factor: DEFAULT_HYPER_FACTOR,
            seed: DEFAULT_SEED,
            max_latent_elements: DEFAULT_MAX_LATENT_ELEMENTS,
        }
    }
}

impl ElicConfig {
    /// Create a configuration builder
    pub fn builder() -> ElicConfigBuilder {
        ElicConfigBuilder::default()
    }

    /// Number of slices (k)
    pub fn num_slices(&self) -> usize {
        self.groups.num_slices()
    }

    /// Number of strings in a bitstream record (2k + 1)
    pub fn num_strings(&self) -> usize {
        2 * self.num_slices() + 1
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ElicError> {
        if self.n == 0 || self.m == 0 {
            return Err(ElicError::invalid_config("channel counts cannot be zero"));
        }

        if self.groups.total() != self.m {
            return Err(ElicError::invalid_config(format!(
                "group table {} sums to {} but the latent grid has {} channels",
                self.groups,
                self.groups.total(),
                self.m
            )));
        }

        self.scale_table.validate()?;

        if !(self.tail_mass > 0.0 && self.tail_mass < 1.0) {
            return Err(ElicError::invalid_config(format!(
                "tail mass must be in (0, 1), got {}",
                self.tail_mass
            )));
        }

        if !(self.likelihood_bound > 0.0 && self.likelihood_bound < 1.0) {
            return Err(ElicError::invalid_config(format!(
                "likelihood bound must be in (0, 1), got {}",
                self.likelihood_bound
            )));
        }

        if self.context_kernel == 0 || self.context_kernel % 2 == 0 {
            return Err(ElicError::invalid_config(format!(
                "context kernel must be odd, got {}",
                self.context_kernel
            )));
        }

        if self.cc_hidden.contains(&0) || self.aggregation_hidden.contains(&0) {
            return Err(ElicError::invalid_config("hidden widths cannot be zero"));
        }

        if self.hyper_factor == 0 {
            return Err(ElicError::invalid_config("hyper factor cannot be zero"));
        }

        if self.max_latent_elements == 0 {
            return Err(ElicError::invalid_config("latent element limit cannot be zero"));
        }

        Ok(())
    }

    /// Load and validate a configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, ElicError> {
        let config: ElicConfig = serde_json::from_str(json)
            .map_err(|e| ElicError::invalid_config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to pretty JSON
    pub fn to_json(&self) -> Result<String, ElicError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ElicError::invalid_config(format!("failed to serialize config: {}", e)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for [`ElicConfig`]
#[derive(Debug, Default)]
pub struct ElicConfigBuilder {
    config: ElicConfig,
}

impl ElicConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hyper channel count (N)
    pub fn hyper_channels(mut self, n: usize) -> Self {
        self.config.n = n;
        self
    }

    /// Set the latent channel count (M); also resizes the first aggregation layer
    pub fn latent_channels(mut self, m: usize) -> Self {
        self.config.m = m;
        self.config.aggregation_hidden[0] = 2 * m;
        self
    }

    /// Set the slice group table
    pub fn groups(mut self, groups: GroupTable) -> Self {
        self.config.groups = groups;
        self
    }

    /// Set the scale table bounds
    pub fn scale_table(mut self, min: f32, max: f32, levels: usize) -> Self {
        self.config.scale_table = ScaleTableConfig { min, max, levels };
        self
    }

    /// Set the tail mass
    pub fn tail_mass(mut self, tail_mass: f64) -> Self {
        self.config.tail_mass = tail_mass;
        self
    }

    /// Set the likelihood lower bound
    pub fn likelihood_bound(mut self, bound: f32) -> Self {
        self.config.likelihood_bound = bound;
        self
    }

    /// Set the context predictor kernel size
    pub fn context_kernel(mut self, kernel: usize) -> Self {
        self.config.context_kernel = kernel;
        self
    }

    /// Set the hidden widths of the cross-slice transforms
    pub fn cc_hidden(mut self, first: usize, second: usize) -> Self {
        self.config.cc_hidden = [first, second];
        self
    }

    /// Set the hidden widths of the parameter aggregation functions
    pub fn aggregation_hidden(mut self, first: usize, second: usize) -> Self {
        self.config.aggregation_hidden = [first, second];
        self
    }

    /// Set the latent/side-information spatial ratio
    pub fn hyper_factor(mut self, factor: usize) -> Self {
        self.config.hyper_factor = factor;
        self
    }

    /// Set the weight seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Set the largest latent grid a decoded record may describe
    pub fn max_latent_elements(mut self, limit: usize) -> Self {
        self.config.max_latent_elements = limit;
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<ElicConfig, ElicError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation
    pub fn build_unchecked(self) -> ElicConfig {
        self.config
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_groups() {
        let groups = GroupTable::default();
        assert_eq!(groups.num_slices(), 5);
        assert_eq!(groups.total(), 320);
        assert_eq!(groups.channel_range(0), 0..16);
        assert_eq!(groups.channel_range(1), 16..32);
        assert_eq!(groups.channel_range(2), 32..64);
        assert_eq!(groups.channel_range(3), 64..128);
        assert_eq!(groups.channel_range(4), 128..320);
    }

    #[test]
    fn test_group_table_rejects_bad_tables() {
        assert!(GroupTable::new(vec![0]).is_err());
        assert!(GroupTable::new(vec![]).is_err());
        assert!(GroupTable::new(vec![1, 16]).is_err());
        assert!(GroupTable::new(vec![0, 16, 0, 8]).is_err());
        assert!(GroupTable::new(vec![0, 8]).is_ok());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ElicConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_slices(), 5);
        assert_eq!(config.num_strings(), 11);
    }

    #[test]
    fn test_sum_mismatch_is_config_error() {
        let err = ElicConfig::builder()
            .latent_channels(300)
            .build()
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_config_builder() {
        let config = ElicConfig::builder()
            .hyper_channels(8)
            .latent_channels(16)
            .groups(GroupTable::new(vec![0, 2, 2, 4, 8]).unwrap())
            .cc_hidden(8, 8)
            .aggregation_hidden(16, 16)
            .seed(7)
            .build()
            .unwrap();

        assert_eq!(config.n, 8);
        assert_eq!(config.m, 16);
        assert_eq!(config.num_slices(), 4);
        assert_eq!(config.aggregation_hidden, [16, 16]);
        assert_eq!(config.seed, 7);
    }

    #[test]
    fn test_config_validation() {
        let mut config = ElicConfig::default();
        config.context_kernel = 4;
        assert!(config.validate().is_err());

        let mut config = ElicConfig::default();
        config.tail_mass = 0.0;
        assert!(config.validate().is_err());

        let mut config = ElicConfig::default();
        config.scale_table.levels = 1;
        assert!(config.validate().is_err());

        let mut config = ElicConfig::default();
        config.max_latent_elements = 0;
        assert!(config.validate().unwrap_err().is_config_error());

        let config = ElicConfig::builder()
            .scale_table(1.0, 0.5, 64)
            .build_unchecked();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scale_table_endpoints() {
        let table = ScaleTableConfig::default().build();
        assert_eq!(table.len(), 64);
        assert!((table[0] - 0.11).abs() < 1e-6);
        assert!((table[63] - 256.0).abs() < 1e-3);
        assert!(table.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = ElicConfig::builder()
            .hyper_channels(8)
            .latent_channels(16)
            .groups(GroupTable::new(vec![0, 4, 12]).unwrap())
            .build()
            .unwrap();

        let json = config.to_json().unwrap();
        let loaded = ElicConfig::from_json(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_json_rejects_invalid_groups() {
        let json = r#"{ "m": 16, "groups": [0, 16, 0] }"#;
        assert!(ElicConfig::from_json(json).is_err());

        let json = r#"{ "m": 20, "groups": [0, 8, 8] }"#;
        let err = ElicConfig::from_json(json).unwrap_err();
        assert!(err.is_config_error());
    }
}
