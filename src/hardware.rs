//! Hardware detection and strategy selection.
//!
//! Detection is a one-shot read of the machine; the resulting
//! [`HardwareProfile`] is an immutable value handed to the orchestrator.

use log::{debug, info};
use serde::Serialize;
use std::process::Command;

/// What the machine offers to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HardwareProfile {
    pub cpu_cores: usize,
    pub has_gpu: bool,
    /// Device memory in MiB, 0 without a GPU.
    pub gpu_memory: u64,
    pub distributed_worker_count: usize,
    pub has_prior_solution: bool,
}

/// Generation strategy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Cluster, solve, refine; adapts to CPU/GPU/distributed execution.
    Hierarchical,
    /// Re-solve only what changed since a prior solution.
    Incremental,
    /// Single cluster, single thread, CPU optimizer.
    Standard,
}

/// How cluster work is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    SingleThreaded,
    ThreadPool(usize),
    Distributed(usize),
}

const GPU_MEMORY_ENV: &str = "TIMETABLE_GPU_MEMORY_MB";
const WORKERS_ENV: &str = "TIMETABLE_DISTRIBUTED_WORKERS";

impl HardwareProfile {
    /// CPU-only profile with `cpu_cores` cores.
    pub fn cpu_only(cpu_cores: usize) -> Self {
        Self {
            cpu_cores: cpu_cores.max(1),
            has_gpu: false,
            gpu_memory: 0,
            distributed_worker_count: 0,
            has_prior_solution: false,
        }
    }

    /// Reads the local machine. Never fails; anything undetectable is absent.
    pub fn detect() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let gpu_memory = detect_gpu_memory();
        let distributed_worker_count = std::env::var(WORKERS_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let profile = Self {
            cpu_cores,
            has_gpu: gpu_memory > 0,
            gpu_memory,
            distributed_worker_count,
            has_prior_solution: false,
        };
        info!(
            "Detected {} CPU core(s), GPU: {} ({} MiB), distributed workers: {}",
            profile.cpu_cores, profile.has_gpu, profile.gpu_memory, profile.distributed_worker_count
        );
        profile
    }

    pub fn with_prior_solution(mut self, has_prior: bool) -> Self {
        self.has_prior_solution = has_prior;
        self
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.distributed_worker_count > 0 {
            ExecutionMode::Distributed(self.distributed_worker_count)
        } else if self.cpu_cores > 1 {
            ExecutionMode::ThreadPool(self.cpu_cores)
        } else {
            ExecutionMode::SingleThreaded
        }
    }

    /// Whether the dense device optimizer is worth its transfer cost.
    pub fn use_gpu_optimizer(&self, population: usize, min_population: usize) -> bool {
        self.has_gpu && population >= min_population
    }
}

fn detect_gpu_memory() -> u64 {
    if let Some(mb) = std::env::var(GPU_MEMORY_ENV).ok().and_then(|v| v.trim().parse().ok()) {
        return mb;
    }
    match Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
    {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            text.lines().filter_map(|l| l.trim().parse::<u64>().ok()).sum()
        }
        _ => {
            debug!("nvidia-smi unavailable, checking /proc/driver/nvidia");
            // driver present but memory unknown: report a nominal amount
            let present = std::fs::read_dir("/proc/driver/nvidia/gpus")
                .map(|mut d| d.next().is_some())
                .unwrap_or(false);
            if present { 1024 } else { 0 }
        }
    }
}

/// Picks the strategy for one job.
///
/// `change_ratio` is the fraction of courses that differ from the prior
/// solution, `None` when there is nothing to compare against.
pub fn select_strategy(profile: &HardwareProfile, change_ratio: Option<f64>, incremental_delta: f64) -> Strategy {
    if profile.has_prior_solution && change_ratio.is_some_and(|r| r <= incremental_delta) {
        return Strategy::Incremental;
    }
    let parallel = profile.cpu_cores > 1 || profile.has_gpu || profile.distributed_worker_count > 0;
    if parallel {
        Strategy::Hierarchical
    } else {
        Strategy::Standard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_never_fails() {
        let profile = HardwareProfile::detect();
        assert!(profile.cpu_cores >= 1);
        assert!(!profile.has_prior_solution);
        assert_eq!(profile.has_gpu, profile.gpu_memory > 0);
    }

    #[test]
    fn test_hierarchical_is_default_on_multicore() {
        let profile = HardwareProfile::cpu_only(8);
        assert_eq!(select_strategy(&profile, None, 0.2), Strategy::Hierarchical);
        assert_eq!(profile.execution_mode(), ExecutionMode::ThreadPool(8));
    }

    #[test]
    fn test_single_core_falls_back_to_standard() {
        let profile = HardwareProfile::cpu_only(1);
        assert_eq!(select_strategy(&profile, None, 0.2), Strategy::Standard);
        assert_eq!(profile.execution_mode(), ExecutionMode::SingleThreaded);
    }

    #[test]
    fn test_incremental_needs_prior_and_small_delta() {
        let profile = HardwareProfile::cpu_only(4).with_prior_solution(true);
        assert_eq!(select_strategy(&profile, Some(0.1), 0.2), Strategy::Incremental);
        assert_eq!(select_strategy(&profile, Some(0.5), 0.2), Strategy::Hierarchical);
        let no_prior = HardwareProfile::cpu_only(4);
        assert_eq!(select_strategy(&no_prior, Some(0.0), 0.2), Strategy::Hierarchical);
    }

    #[test]
    fn test_gpu_optimizer_needs_population() {
        let mut profile = HardwareProfile::cpu_only(4);
        assert!(!profile.use_gpu_optimizer(1000, 256));
        profile.has_gpu = true;
        profile.gpu_memory = 8192;
        assert!(profile.use_gpu_optimizer(512, 256));
        assert!(!profile.use_gpu_optimizer(64, 256));
    }

    #[test]
    fn test_distributed_workers_take_precedence() {
        let mut profile = HardwareProfile::cpu_only(4);
        profile.distributed_worker_count = 3;
        assert_eq!(profile.execution_mode(), ExecutionMode::Distributed(3));
    }
}
