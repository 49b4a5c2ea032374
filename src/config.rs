use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IrisError, Result};

/// Configuration for an online partition.
///
/// Controls which reopen recipe is used and the bounds of the optimized
/// (branch) reopen path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Use the branch recipe (Prepatch/RedoAndLock/SwitchBranch) for normal
    /// reopens instead of the join-segment recipe.
    pub enable_optimized_reopen: bool,

    /// Dump sealed realtime segments on a background worker.
    pub enable_async_dump_segment: bool,

    /// Maximum number of unlocked redo passes before giving up.
    pub max_redo_iterations: u32,

    /// Wall-clock bound for the unlocked redo loop, in milliseconds.
    pub max_redo_time_ms: u64,

    /// Initial number of replayed operations below which a redo pass counts
    /// as converged. Halved after every pass.
    pub redo_converge_threshold: usize,

    /// Reclaimable updatable-attribute memory (bytes) above which the
    /// current reader is swapped for a compacted one.
    pub max_cur_reader_reclaimable_mem: u64,

    /// Number of documents after which the building segment is sealed.
    pub building_segment_max_docs: usize,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        OnlineConfig {
            enable_optimized_reopen: false,
            enable_async_dump_segment: false,
            max_redo_iterations: 4,
            max_redo_time_ms: 1000,
            redo_converge_threshold: 64,
            max_cur_reader_reclaimable_mem: 64 * 1024 * 1024,
            building_segment_max_docs: 4096,
        }
    }
}

impl OnlineConfig {
    pub fn builder() -> OnlineConfigBuilder {
        OnlineConfigBuilder::default()
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: OnlineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn max_redo_time(&self) -> Duration {
        Duration::from_millis(self.max_redo_time_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_redo_iterations == 0 {
            return Err(IrisError::invalid_config(
                "max_redo_iterations must be at least 1",
            ));
        }
        if self.building_segment_max_docs == 0 {
            return Err(IrisError::invalid_config(
                "building_segment_max_docs must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct OnlineConfigBuilder {
    config: OnlineConfig,
}

impl OnlineConfigBuilder {
    pub fn enable_optimized_reopen(mut self, enable: bool) -> Self {
        self.config.enable_optimized_reopen = enable;
        self
    }

    pub fn enable_async_dump_segment(mut self, enable: bool) -> Self {
        self.config.enable_async_dump_segment = enable;
        self
    }

    pub fn max_redo_iterations(mut self, iterations: u32) -> Self {
        self.config.max_redo_iterations = iterations;
        self
    }

    pub fn max_redo_time(mut self, time: Duration) -> Self {
        self.config.max_redo_time_ms = time.as_millis() as u64;
        self
    }

    pub fn redo_converge_threshold(mut self, threshold: usize) -> Self {
        self.config.redo_converge_threshold = threshold;
        self
    }

    pub fn max_cur_reader_reclaimable_mem(mut self, bytes: u64) -> Self {
        self.config.max_cur_reader_reclaimable_mem = bytes;
        self
    }

    pub fn building_segment_max_docs(mut self, docs: usize) -> Self {
        self.config.building_segment_max_docs = docs;
        self
    }

    pub fn build(self) -> Result<OnlineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OnlineConfig::default();
        assert_eq!(config.max_redo_iterations, 4);
        assert_eq!(config.max_redo_time(), Duration::from_secs(1));
        assert!(!config.enable_optimized_reopen);
    }

    #[test]
    fn test_from_json_partial() {
        let config =
            OnlineConfig::from_json(r#"{"enable_optimized_reopen": true, "max_redo_time_ms": 5}"#)
                .unwrap();
        assert!(config.enable_optimized_reopen);
        assert_eq!(config.max_redo_time(), Duration::from_millis(5));
        assert_eq!(config.redo_converge_threshold, 64);
    }

    #[test]
    fn test_builder_validation() {
        assert!(OnlineConfig::builder().max_redo_iterations(0).build().is_err());
        assert!(
            OnlineConfig::builder()
                .building_segment_max_docs(0)
                .build()
                .is_err()
        );

        let config = OnlineConfig::builder()
            .max_redo_iterations(2)
            .max_redo_time(Duration::from_millis(3))
            .build()
            .unwrap();
        assert_eq!(config.max_redo_iterations, 2);
        assert_eq!(config.max_redo_time_ms, 3);
    }
}
