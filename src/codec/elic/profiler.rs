//! ELIC Stage Timing
//!
//! Optional instrumentation for the encode and decode pipelines. Timings are
//! collected on the side and never travel in a return value; an encoder or
//! decoder without a profiler does no timing work at all.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chandelier::codec::elic::profiler::{stages, Profiler};
//!
//! let mut encoder = ElicEncoder::new(model).with_profiler(Profiler::enabled());
//! let encoded = encoder.compress(&image)?;
//!
//! if let Some(profiler) = encoder.profiler() {
//!     println!("{}", profiler.report());
//! }
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

// ─────────────────────────────────────────────────────────────────────────────
// Stage Name Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Stage names recorded by the encoder and decoder
pub mod stages {
    /// Analysis transform (image -> latent)
    pub const Y_ENC: &str = "y_enc";

    /// Hyper analysis (latent -> side information)
    pub const Z_ENC: &str = "z_enc";

    /// Hyper synthesis (side information -> priors)
    pub const Z_DEC: &str = "z_dec";

    /// Slice schedule: parameter prediction and coding of all slices
    pub const PARAMS: &str = "params";

    /// Synthesis transform (latent -> image)
    pub const Y_DEC: &str = "y_dec";

    /// Scalar and side-information compress calls
    pub const ENTROPY_ENCODE: &str = "entropy_encode";

    /// Scalar and side-information decompress calls
    pub const ENTROPY_DECODE: &str = "entropy_decode";
}

// ─────────────────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Timing statistics for one stage
#[derive(Debug, Clone)]
pub struct ProfileStats {
    /// Stage name
    pub stage: String,

    /// Number of samples
    pub count: usize,

    /// Total time in milliseconds
    pub total_ms: f64,

    /// Average time in milliseconds
    pub avg_ms: f64,

    /// Minimum time in milliseconds
    pub min_ms: f64,

    /// Maximum time in milliseconds
    pub max_ms: f64,

    /// Standard deviation in milliseconds
    pub std_dev_ms: f64,

    /// Percentage of all recorded time
    pub percent_of_total: f64,
}

impl ProfileStats {
    /// Summarize a list of durations
    pub fn from_durations(stage: &str, durations: &[Duration]) -> Self {
        let ms: Vec<f64> = durations.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        let count = ms.len();
        if count == 0 {
            return ProfileStats {
                stage: stage.to_string(),
                count: 0,
                total_ms: 0.0,
                avg_ms: 0.0,
                min_ms: 0.0,
                max_ms: 0.0,
                std_dev_ms: 0.0,
                percent_of_total: 0.0,
            };
        }

        let total_ms: f64 = ms.iter().sum();
        let avg_ms = total_ms / count as f64;
        let min_ms = ms.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = ms.iter().copied().fold(0.0, f64::max);
        let variance = ms.iter().map(|v| (v - avg_ms).powi(2)).sum::<f64>() / count as f64;

        ProfileStats {
            stage: stage.to_string(),
            count,
            total_ms,
            avg_ms,
            min_ms,
            max_ms,
            std_dev_ms: variance.sqrt(),
            percent_of_total: 0.0,
        }
    }

    /// Set the share of `total_time_ms` spent in this stage
    pub fn with_percent(mut self, total_time_ms: f64) -> Self {
        if total_time_ms > 0.0 {
            self.percent_of_total = (self.total_ms / total_time_ms) * 100.0;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Profiler
// ─────────────────────────────────────────────────────────────────────────────

/// Per-stage timing collector
#[derive(Debug, Clone, Default)]
pub struct Profiler {
    timings: HashMap<String, Vec<Duration>>,
    enabled: bool,
}

impl Profiler {
    /// Create a disabled profiler
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an enabled profiler
    pub fn enabled() -> Self {
        Profiler {
            timings: HashMap::new(),
            enabled: true,
        }
    }

    /// Enable or disable collection
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Check if collection is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Time a closure and record the duration
    pub fn time<T, F: FnOnce() -> T>(&mut self, name: &str, f: F) -> T {
        if !self.enabled {
            return f();
        }

        let start = Instant::now();
        let result = f();
        self.record(name, start.elapsed());
        result
    }

    /// Time a fallible closure, recording only successful runs
    pub fn time_result<T, E, F: FnOnce() -> Result<T, E>>(
        &mut self,
        name: &str,
        f: F,
    ) -> Result<T, E> {
        if !self.enabled {
            return f();
        }

        let start = Instant::now();
        let result = f();
        if result.is_ok() {
            self.record(name, start.elapsed());
        }
        result
    }

    /// Record a pre-measured duration
    pub fn record(&mut self, name: &str, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.timings
            .entry(name.to_string())
            .or_default()
            .push(duration);
    }

    /// Average duration of a stage
    pub fn average(&self, name: &str) -> Option<Duration> {
        self.timings.get(name).and_then(|durations| {
            let n = u32::try_from(durations.len()).ok().filter(|&n| n > 0)?;
            Some(durations.iter().sum::<Duration>() / n)
        })
    }

    /// Total duration of a stage
    pub fn total(&self, name: &str) -> Option<Duration> {
        self.timings.get(name).map(|durations| durations.iter().sum())
    }

    /// Number of samples of a stage
    pub fn count(&self, name: &str) -> usize {
        self.timings.get(name).map_or(0, |d| d.len())
    }

    /// Statistics of one stage
    pub fn stats(&self, name: &str) -> Option<ProfileStats> {
        self.timings
            .get(name)
            .map(|durations| ProfileStats::from_durations(name, durations))
    }

    /// Statistics of all stages, longest total first
    pub fn all_stats(&self) -> Vec<ProfileStats> {
        let total_time_ms: f64 = self
            .timings
            .values()
            .flatten()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();

        let mut stats: Vec<ProfileStats> = self
            .timings
            .iter()
            .map(|(name, durations)| {
                ProfileStats::from_durations(name, durations).with_percent(total_time_ms)
            })
            .collect();
        stats.sort_by(|a, b| b.total_ms.total_cmp(&a.total_ms));
        stats
    }

    /// Formatted table of all stages
    pub fn report(&self) -> String {
        let stats = self.all_stats();
        if stats.is_empty() {
            return "No profiling data collected.".to_string();
        }

        let mut report = String::from("=== ELIC Stage Timing ===\n\n");
        report.push_str(&format!(
            "{:<16} {:>6} {:>10} {:>10} {:>10} {:>10} {:>7}\n",
            "Stage", "Count", "Total(ms)", "Avg(ms)", "Min(ms)", "Max(ms)", "%"
        ));
        report.push_str(&"-".repeat(75));
        report.push('\n');
        for stat in &stats {
            report.push_str(&format!(
                "{:<16} {:>6} {:>10.2} {:>10.3} {:>10.3} {:>10.3} {:>6.1}%\n",
                stat.stage,
                stat.count,
                stat.total_ms,
                stat.avg_ms,
                stat.min_ms,
                stat.max_ms,
                stat.percent_of_total
            ));
        }
        report
    }

    /// Drop all samples
    pub fn reset(&mut self) {
        self.timings.clear();
    }

    /// The `n` stages with the longest average
    pub fn top_bottlenecks(&self, n: usize) -> Vec<ProfileStats> {
        let mut stats = self.all_stats();
        stats.sort_by(|a, b| b.avg_ms.total_cmp(&a.avg_ms));
        stats.truncate(n);
        stats
    }
}

/// Time `f` under `name` when a profiler is present
pub fn timed<T, F: FnOnce() -> T>(profiler: Option<&mut Profiler>, name: &str, f: F) -> T {
    match profiler {
        Some(p) => p.time(name, f),
        None => f(),
    }
}
