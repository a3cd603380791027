//! Resource planning for the timelapse daemon
//!
//! Derives the encoder thread cap and the task concurrency ceiling from CPU
//! core count and configuration. Hosts are assumed to be small, so both stay low.

use crate::config::Config;

/// Resource plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Threads handed to each encoder process
    pub encoder_threads: u32,
    /// Maximum number of simultaneously active tasks
    pub max_concurrent_tasks: u32,
}

impl ResourcePlan {
    /// Derive a resource plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus
    /// - Derives encoder_threads: 1 below 4 cores, 2 otherwise (unless explicit)
    /// - Derives max_concurrent_tasks: 2 below 4 cores, 4 otherwise (unless explicit)
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_for_cores(cfg, num_cpus::get() as u32)
    }

    /// Derive a plan for a known core count
    pub fn derive_for_cores(cfg: &Config, total_cores: u32) -> Self {
        let encoder_threads = if cfg.encoder.threads > 0 {
            cfg.encoder.threads
        } else {
            derive_threads(total_cores)
        };

        let max_concurrent_tasks = if cfg.tasks.max_concurrent_tasks > 0 {
            cfg.tasks.max_concurrent_tasks
        } else {
            derive_max_tasks(total_cores)
        };

        Self {
            total_cores,
            encoder_threads,
            max_concurrent_tasks,
        }
    }
}

fn derive_threads(cores: u32) -> u32 {
    if cores >= 4 {
        2
    } else {
        1
    }
}

fn derive_max_tasks(cores: u32) -> u32 {
    if cores >= 4 {
        4
    } else {
        2
    }
}

/// Public function to derive a resource plan from configuration
pub fn derive_plan(cfg: &Config) -> ResourcePlan {
    ResourcePlan::derive(cfg)
}
