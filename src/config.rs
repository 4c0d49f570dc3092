//! Engine configuration.
//!
//! Every section is defaulted so an empty JSON object is a valid config.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub clustering: ClusteringConfig,
    pub feasibility: FeasibilityConfig,
    pub optimizer: OptimizerConfig,
    pub learning: LearningConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
    pub progress: ProgressConfig,
    pub job: JobConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub min_cluster_size: usize,
    pub max_cluster_size: usize,
    pub faculty_weight: f64,
    pub student_weight: f64,
    pub room_weight: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            max_cluster_size: 40,
            faculty_weight: 1.0,
            student_weight: 2.0,
            room_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeasibilityConfig {
    /// Merge-with-neighbour retries for an infeasible cluster.
    pub max_relax_attempts: usize,
    /// Run the exact ILP pass when the greedy pass fails.
    pub exact_fallback: bool,
    /// Skip the exact pass above this many decision variables.
    pub exact_max_variables: usize,
}

impl Default for FeasibilityConfig {
    fn default() -> Self {
        Self {
            max_relax_attempts: 2,
            exact_fallback: true,
            exact_max_variables: 50_000,
        }
    }
}

/// Soft objective weights; must total 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectiveWeights {
    pub compactness: f64,
    pub workload_balance: f64,
    pub room_utilization: f64,
    pub preference: f64,
    pub peak_spreading: f64,
    pub continuity: f64,
}

impl Default for ObjectiveWeights {
    fn default() -> Self {
        Self {
            compactness: 0.25,
            workload_balance: 0.15,
            room_utilization: 0.15,
            preference: 0.20,
            peak_spreading: 0.10,
            continuity: 0.15,
        }
    }
}

impl ObjectiveWeights {
    pub fn total(&self) -> f64 {
        self.compactness
            + self.workload_balance
            + self.room_utilization
            + self.preference
            + self.peak_spreading
            + self.continuity
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub population_size: usize,
    pub generations: usize,
    pub tournament_size: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    pub elite_fraction: f64,
    /// Stop once best fitness reaches this value.
    pub quality_threshold: f64,
    /// Stop after this many generations without improvement.
    pub patience: usize,
    /// Fitness penalty per hard conflict.
    pub conflict_penalty: f64,
    /// Smallest population worth moving to the dense device.
    pub gpu_min_population: usize,
    pub weights: ObjectiveWeights,
    pub seed: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            population_size: 60,
            generations: 150,
            tournament_size: 3,
            crossover_rate: 0.8,
            mutation_rate: 0.02,
            elite_fraction: 0.1,
            quality_threshold: 0.98,
            patience: 30,
            conflict_penalty: 1.0,
            gpu_min_population: 256,
            weights: ObjectiveWeights::default(),
            seed: 42,
        }
    }
}

/// Weights of the learner's context dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContextWeights {
    pub temporal: f64,
    pub behavioral: f64,
    pub curricular: f64,
    pub peer: f64,
    pub spatial: f64,
}

impl Default for ContextWeights {
    fn default() -> Self {
        Self {
            temporal: 0.25,
            behavioral: 0.15,
            curricular: 0.25,
            peer: 0.20,
            spatial: 0.15,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    pub episodes: usize,
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub epsilon_decay: f64,
    /// Similar institutions consulted for a transfer bootstrap.
    pub transfer_k: usize,
    /// Profile groups kept by periodic re-clustering.
    pub profile_groups: usize,
    /// Directory for the JSON policy store; in-memory when unset.
    pub store_dir: Option<String>,
    pub weights: ContextWeights,
    pub seed: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            episodes: 20,
            alpha: 0.3,
            gamma: 0.8,
            epsilon: 0.2,
            epsilon_decay: 0.9,
            transfer_k: 3,
            profile_groups: 4,
            store_dir: None,
            weights: ContextWeights::default(),
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// Lease on the per-key recompute lock.
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_poll_retries: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            lock_timeout_ms: 5_000,
            poll_interval_ms: 20,
            max_poll_retries: 50,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub poll_interval_ms: u64,
    pub elevated_ratio: f64,
    pub aggressive_ratio: f64,
    pub emergency_ratio: f64,
    /// Consecutive emergency readings before a job fails.
    pub emergency_polls: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            elevated_ratio: 0.75,
            aggressive_ratio: 0.85,
            emergency_ratio: 0.95,
            emergency_polls: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub publish_interval_ms: u64,
    pub channel_capacity: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 100,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobConfig {
    pub timeout_secs: u64,
    /// How long a timed-out job may take to reach a safe point before it is
    /// failed without waiting for the pipeline.
    pub cancel_grace_ms: u64,
    /// Finished jobs kept for status and result queries; older ones are
    /// dropped when new jobs are submitted.
    pub retain_finished: usize,
    /// Ranked solution variants returned on success.
    pub variants: usize,
    /// Emit a partial solution when some cluster stays infeasible.
    pub allow_partial: bool,
    /// Changed-course ratio under which the incremental strategy applies.
    pub incremental_delta: f64,
    pub data_retries: u32,
    pub data_backoff_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            cancel_grace_ms: 30_000,
            retain_finished: 256,
            variants: 3,
            allow_partial: true,
            incremental_delta: 0.2,
            data_retries: 3,
            data_backoff_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub data_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            data_file: None,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::InvalidInput(format!("reading {}: {e}", path.display())))?;
        let config: EngineConfig = serde_json::from_str(&raw)
            .map_err(|e| EngineError::InvalidInput(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let w = self.optimizer.weights.total();
        if (w - 1.0).abs() > 1e-6 {
            return Err(EngineError::InvalidInput(format!(
                "soft objective weights must total 1.0, got {w:.4}"
            )));
        }
        let c = &self.clustering;
        if c.min_cluster_size == 0 || c.min_cluster_size > c.max_cluster_size {
            return Err(EngineError::InvalidInput(format!(
                "cluster bounds invalid: min {} max {}",
                c.min_cluster_size, c.max_cluster_size
            )));
        }
        if self.optimizer.population_size < 2 {
            return Err(EngineError::InvalidInput("population size must be at least 2".into()));
        }
        if self.optimizer.tournament_size == 0 {
            return Err(EngineError::InvalidInput("tournament size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.optimizer.elite_fraction) {
            return Err(EngineError::InvalidInput("elite fraction must be within [0, 1]".into()));
        }
        let m = &self.memory;
        if !(m.elevated_ratio <= m.aggressive_ratio && m.aggressive_ratio <= m.emergency_ratio) {
            return Err(EngineError::InvalidInput("memory thresholds must be ascending".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
        assert!((ObjectiveWeights::default().total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_weights_not_summing_to_one() {
        let mut config = EngineConfig::default();
        config.optimizer.weights.preference = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("total 1.0"));
    }

    #[test]
    fn test_rejects_inverted_cluster_bounds() {
        let mut config = EngineConfig::default();
        config.clustering.min_cluster_size = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"optimizer": {{"population_size": 12}}, "job": {{"timeout_secs": 5}}}}"#).unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.optimizer.population_size, 12);
        assert_eq!(config.optimizer.generations, 150);
        assert_eq!(config.job.timeout_secs, 5);
        assert_eq!(config.cache.poll_interval_ms, 20);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = EngineConfig::load(Path::new("/nonexistent/timetable.json")).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }
}
