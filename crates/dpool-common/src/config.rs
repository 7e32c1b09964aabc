//! Configuration types for dpool
//!
//! This module defines the configuration handed to the pool repository.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration of one pool repository
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Pool base directory holding `control/` and `data/`
    pub base_dir: PathBuf,
    /// fsync control and storage-info files before renaming them in place
    pub sync_writes: bool,
    /// Maximum repair actions the healer attempts for one entry
    pub max_repair_attempts: usize,
    /// Sticky expiration scheduler configuration
    pub sticky: StickyConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/dpool/pool"),
            sync_writes: true,
            max_repair_attempts: 2,
            sticky: StickyConfig::default(),
        }
    }
}

impl RepositoryConfig {
    /// Create config with a base directory
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }
}

/// Sticky expiration scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StickyConfig {
    /// Run the background expiration scheduler
    pub enabled: bool,
    /// Number of worker threads clearing expired pins
    pub workers: usize,
    /// Delay before retrying an expiration that removed nothing (milliseconds)
    pub clock_shift_ms: u64,
}

impl Default for StickyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 2,
            clock_shift_ms: 1000,
        }
    }
}

impl StickyConfig {
    /// Retry delay as a duration
    #[must_use]
    pub const fn clock_shift(&self) -> Duration {
        Duration::from_millis(self.clock_shift_ms)
    }
}
