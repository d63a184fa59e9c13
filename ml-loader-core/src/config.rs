//! Loader configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Default number of worker contexts (0 runs everything on the caller's thread)
pub const DEFAULT_NUM_WORKERS: usize = 0;

/// Default maximum number of execution units copies may occupy
pub const DEFAULT_MAX_COPY_UNITS: usize = 6144;

/// Default look-ahead depth of the overlap buffer and prefetcher
pub const DEFAULT_BUFFER_SIZE: usize = 2;

/// Default number of items each worker may queue ahead of the consumer
pub const DEFAULT_PREFETCH_FACTOR: usize = 2;

/// Default grace period for background threads on shutdown, in milliseconds
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Configuration of a data loader and the rewrite passes it applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Number of worker contexts running the pre-fetch sub-pipeline
    pub num_workers: usize,

    /// Keep worker contexts alive across passes (only meaningful with workers)
    pub persistent_workers: bool,

    /// Overlap feature fetching with compute on an alternate stream
    pub overlap_feature_fetch: bool,

    /// Cap on execution units used by overlapped copies
    pub max_concurrent_copy_units: usize,

    /// Look-ahead depth of the overlap buffer and the device-copy prefetcher
    pub buffer_size: usize,

    /// Per-worker transport capacity
    pub prefetch_factor: usize,

    /// Time allowed for background threads to exit on close
    pub shutdown_grace_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            persistent_workers: true,
            overlap_feature_fetch: true,
            max_concurrent_copy_units: DEFAULT_MAX_COPY_UNITS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            prefetch_factor: DEFAULT_PREFETCH_FACTOR,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl LoaderConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("failed to parse loader config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Set the number of workers
    #[must_use]
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set whether workers persist across passes
    #[must_use]
    pub fn with_persistent_workers(mut self, persistent: bool) -> Self {
        self.persistent_workers = persistent;
        self
    }

    /// Enable or disable overlapped feature fetching
    #[must_use]
    pub fn with_overlap_feature_fetch(mut self, overlap: bool) -> Self {
        self.overlap_feature_fetch = overlap;
        self
    }

    /// Set the copy-unit cap
    #[must_use]
    pub fn with_max_concurrent_copy_units(mut self, units: usize) -> Self {
        self.max_concurrent_copy_units = units;
        self
    }

    /// Set the look-ahead depth
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the per-worker transport capacity
    #[must_use]
    pub fn with_prefetch_factor(mut self, prefetch_factor: usize) -> Self {
        self.prefetch_factor = prefetch_factor;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Check the configuration for values no loader can run with
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfiguration(
                "buffer_size must be a positive integer".into(),
            ));
        }
        if self.max_concurrent_copy_units == 0 {
            return Err(Error::InvalidConfiguration(
                "max_concurrent_copy_units must be a positive integer".into(),
            ));
        }
        if self.prefetch_factor == 0 {
            return Err(Error::InvalidConfiguration(
                "prefetch_factor must be a positive integer".into(),
            ));
        }

        let cores = num_cpus::get();
        if self.num_workers > cores {
            warn!(
                num_workers = self.num_workers,
                cores, "More workers requested than available cores"
            );
        }
        Ok(())
    }

    /// Whether workers actually persist: requires at least one worker
    pub fn effective_persistent(&self) -> bool {
        self.persistent_workers && self.num_workers > 0
    }

    /// Shutdown grace period as a duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
