//! Disk Guard Module
//!
//! Pre-encode admission check ensuring the estimated output fits the per-file
//! quota and the destination filesystem, counting space already promised to
//! in-flight encodes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of the disk guard check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiskGuardResult {
    /// Enough room for the estimated output
    Admit,
    /// Estimated output is larger than the per-file quota
    OverQuota { estimate_bytes: u64, quota_bytes: u64 },
    /// Destination filesystem would drop below the reserve
    InsufficientSpace {
        required_bytes: u64,
        free_bytes: u64,
    },
}

impl DiskGuardResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, DiskGuardResult::Admit)
    }

    /// Human readable rejection reason.
    pub fn reason(&self) -> Option<String> {
        match self {
            DiskGuardResult::Admit => None,
            DiskGuardResult::OverQuota {
                estimate_bytes,
                quota_bytes,
            } => Some(format!(
                "estimated output {} bytes exceeds quota of {} bytes",
                estimate_bytes, quota_bytes
            )),
            DiskGuardResult::InsufficientSpace {
                required_bytes,
                free_bytes,
            } => Some(format!(
                "needs {} bytes but only {} bytes free",
                required_bytes, free_bytes
            )),
        }
    }
}

/// Estimated output size for an input.
pub fn estimate_output_bytes(input_bytes: u64, ratio: f32) -> u64 {
    (input_bytes as f64 * ratio.max(0.0) as f64).ceil() as u64
}

/// Check whether an encode may start.
///
/// Rejects when `estimate > quota`, or when
/// `estimate + reserve + in_flight > free`.
///
/// # Arguments
/// * `estimate_bytes` - Estimated output size
/// * `quota_bytes` - Per-file quota, if any
/// * `free_bytes` - Free space on the destination filesystem, if known
/// * `reserve_bytes` - Space that must stay free
/// * `in_flight_bytes` - Space already reserved by running encodes
pub fn check_disk_guard(
    estimate_bytes: u64,
    quota_bytes: Option<u64>,
    free_bytes: Option<u64>,
    reserve_bytes: u64,
    in_flight_bytes: u64,
) -> DiskGuardResult {
    if let Some(quota) = quota_bytes {
        if estimate_bytes > quota {
            return DiskGuardResult::OverQuota {
                estimate_bytes,
                quota_bytes: quota,
            };
        }
    }

    if let Some(free) = free_bytes {
        let required = estimate_bytes
            .saturating_add(reserve_bytes)
            .saturating_add(in_flight_bytes);
        if required > free {
            return DiskGuardResult::InsufficientSpace {
                required_bytes: required,
                free_bytes: free,
            };
        }
    }

    DiskGuardResult::Admit
}

/// Source of free-space figures.
pub trait FreeSpace: Send + Sync {
    /// Free bytes on the filesystem holding `path`; `None` when unknown.
    fn free_bytes(&self, path: &Path) -> Option<u64>;
}

/// [`FreeSpace`] backed by sysinfo's mounted disk list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFreeSpace;

impl FreeSpace for SystemFreeSpace {
    fn free_bytes(&self, path: &Path) -> Option<u64> {
        use sysinfo::Disks;

        let target = std::fs::canonicalize(path)
            .or_else(|_| {
                path.parent()
                    .map(std::fs::canonicalize)
                    .unwrap_or_else(std::env::current_dir)
            })
            .ok()?;

        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Bytes promised to running encodes.
#[derive(Debug, Default, Clone)]
pub struct Reservations {
    in_flight: Arc<AtomicU64>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Reserve `bytes` until the returned guard is dropped.
    pub fn reserve(&self, bytes: u64) -> Reservation {
        self.in_flight.fetch_add(bytes, Ordering::SeqCst);
        Reservation {
            in_flight: Arc::clone(&self.in_flight),
            bytes,
        }
    }
}

/// RAII guard for reserved bytes.
#[derive(Debug)]
pub struct Reservation {
    in_flight: Arc<AtomicU64>,
    bytes: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}
