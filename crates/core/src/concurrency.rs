//! Concurrency planning module for mkv2cast
//!
//! Derives worker pool sizes for the integrity and encode stages from CPU
//! count, installed RAM and configuration. The plan is resolved once per run.

use crate::config::{Config, MAX_WORKERS};

/// RAM budget assumed per concurrent encode, in GiB.
const RAM_GB_PER_ENCODE: u64 = 4;

/// Upper bound for auto-derived integrity workers.
const MAX_AUTO_INTEGRITY: u32 = 4;

/// Worker plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPlan {
    /// Number of concurrent encode workers
    pub encode_workers: u32,
    /// Number of concurrent integrity/probe workers
    pub integrity_workers: u32,
    /// Capacity of the queue between the two stages
    pub handoff_capacity: usize,
}

impl WorkerPlan {
    /// Derive a worker plan from configuration and the detected machine
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus and RAM via sysinfo
    /// - Explicit (non-zero) worker counts are kept
    /// - encode = max(1, min(cpus / 2, ram_gb / 4))
    /// - integrity = min(4, cpus / 2, 2 * encode), at least 1
    /// - Every count is clamped to [1, 64]
    pub fn derive(cfg: &Config) -> Self {
        Self::derive_for(cfg, num_cpus::get() as u32, detect_ram_gb())
    }

    /// Derive a plan for a given machine shape.
    ///
    /// # Arguments
    /// * `cfg` - Configuration holding explicit worker counts (0 = auto)
    /// * `cpus` - Logical CPU count
    /// * `ram_gb` - Installed RAM in whole GiB
    pub fn derive_for(cfg: &Config, cpus: u32, ram_gb: u64) -> Self {
        let encode_workers = if cfg.workers.encode > 0 {
            cfg.workers.encode
        } else {
            derive_encode_workers(cpus, ram_gb)
        };
        let encode_workers = clamp_workers(encode_workers);

        let integrity_workers = if cfg.workers.integrity > 0 {
            cfg.workers.integrity
        } else {
            derive_integrity_workers(cpus, encode_workers)
        };
        let integrity_workers = clamp_workers(integrity_workers);

        let handoff_capacity = if cfg.workers.handoff_capacity > 0 {
            cfg.workers.handoff_capacity as usize
        } else {
            encode_workers as usize * 2
        };

        Self {
            encode_workers,
            integrity_workers,
            handoff_capacity,
        }
    }
}

/// Installed RAM in whole GiB; 8 when detection fails.
fn detect_ram_gb() -> u64 {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        8
    } else {
        total / (1024 * 1024 * 1024)
    }
}

fn derive_encode_workers(cpus: u32, ram_gb: u64) -> u32 {
    let by_ram = (ram_gb / RAM_GB_PER_ENCODE).min(u32::MAX as u64) as u32;
    (cpus / 2).min(by_ram).max(1)
}

fn derive_integrity_workers(cpus: u32, encode_workers: u32) -> u32 {
    MAX_AUTO_INTEGRITY
        .min(cpus / 2)
        .min(encode_workers.saturating_mul(2))
        .max(1)
}

/// Clamp a worker count to the valid range [1, 64]
fn clamp_workers(workers: u32) -> u32 {
    workers.clamp(1, MAX_WORKERS)
}

/// Public function to derive a worker plan from configuration
pub fn derive_plan(cfg: &Config) -> WorkerPlan {
    WorkerPlan::derive(cfg)
}
