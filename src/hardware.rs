//! Host resource detection and budgeting.
//!
//! [`profile`] reads total/available memory and logical cores and maps them
//! onto a [`HardwareProfile`] that sizes embedding batches, the ingestion
//! worker pool and the vector cache.
//!
//! | Total memory | Class | Batch | Workers (max) | Cache entries |
//! |--------------|-------|-------|---------------|---------------|
//! | < 8 GB | `Conservative` | 8 | 2 | 2 000 |
//! | 8-16 GB | `Standard` | 32 | 4 | 20 000 |
//! | > 16 GB | `Large` | 64 | 8 | 100 000 |
//!
//! Detection never fails: when sysinfo reports nothing useful the
//! [`HardwareProfile::minimal`] profile is returned.

use serde::Serialize;
use sysinfo::System;

use crate::config::ResourceLimits;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileClass {
    Conservative,
    Standard,
    Large,
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareProfile {
    pub class: ProfileClass,
    pub total_memory_bytes: u64,
    pub logical_cores: usize,
    pub accelerator: Option<String>,
    /// Memory the engine is allowed to use for batches and caches.
    pub memory_budget_bytes: u64,
    pub cpu_workers: usize,
    pub batch_size: usize,
    /// Decoded vectors kept in memory per collection.
    pub cache_entries: usize,
}

impl HardwareProfile {
    /// Safe profile used when detection yields nothing.
    pub fn minimal() -> Self {
        Self {
            class: ProfileClass::Conservative,
            total_memory_bytes: 0,
            logical_cores: 1,
            accelerator: None,
            memory_budget_bytes: 512 * MIB,
            cpu_workers: 1,
            batch_size: 4,
            cache_entries: 1_000,
        }
    }

    /// Apply configured overrides. A memory ceiling also caps the batch size
    /// and cache so the two never disagree.
    pub fn with_limits(mut self, limits: &ResourceLimits) -> Self {
        if let Some(ceiling_mb) = limits.memory_ceiling_mb {
            let ceiling = ceiling_mb.saturating_mul(MIB);
            if ceiling < self.memory_budget_bytes || self.memory_budget_bytes == 0 {
                self.memory_budget_bytes = ceiling;
            }
            if ceiling < 2 * GIB {
                self.batch_size = self.batch_size.min(8);
                self.cache_entries = self.cache_entries.min(2_000);
            }
        }
        if let Some(batch) = limits.batch_size {
            self.batch_size = batch.max(1);
        }
        if let Some(workers) = limits.workers {
            self.cpu_workers = workers.max(1);
        }
        self
    }
}

/// Detect the host profile. Pure function of host state.
pub fn profile() -> HardwareProfile {
    let mut sys = System::new();
    sys.refresh_memory();
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut p = profile_for(sys.total_memory(), cores);
    p.accelerator = detect_accelerator();
    p
}

/// Map raw host figures onto a profile.
pub fn profile_for(total_memory_bytes: u64, logical_cores: usize) -> HardwareProfile {
    if total_memory_bytes == 0 || logical_cores == 0 {
        return HardwareProfile::minimal();
    }

    let (class, batch_size, max_workers, cache_entries) = if total_memory_bytes < 8 * GIB {
        (ProfileClass::Conservative, 8, 2, 2_000)
    } else if total_memory_bytes <= 16 * GIB {
        (ProfileClass::Standard, 32, 4, 20_000)
    } else {
        (ProfileClass::Large, 64, 8, 100_000)
    };

    // Leave one core for the OS and the embedding capability when possible.
    let usable = if logical_cores > 2 {
        logical_cores - 1
    } else {
        logical_cores
    };

    HardwareProfile {
        class,
        total_memory_bytes,
        logical_cores,
        accelerator: None,
        memory_budget_bytes: total_memory_bytes / 4,
        cpu_workers: usable.clamp(1, max_workers),
        batch_size,
        cache_entries,
    }
}

/// Whether the host is short on memory right now. `budget_bytes` is the
/// engine's ceiling; pressure is reported when available memory drops below
/// a quarter of it or below 5% of total memory.
pub fn memory_pressure(budget_bytes: u64) -> bool {
    let mut sys = System::new();
    sys.refresh_memory();
    under_pressure(sys.available_memory(), sys.total_memory(), budget_bytes)
}

fn under_pressure(available: u64, total: u64, budget_bytes: u64) -> bool {
    if total == 0 {
        return false;
    }
    available < budget_bytes / 4 || available < total / 20
}

fn detect_accelerator() -> Option<String> {
    if std::path::Path::new("/dev/nvidia0").exists() {
        return Some("cuda".to_string());
    }
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        return Some("metal".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_host_is_conservative() {
        let p = profile_for(4 * GIB, 8);
        assert_eq!(p.class, ProfileClass::Conservative);
        assert_eq!(p.batch_size, 8);
        assert!(p.cpu_workers <= 2);
    }

    #[test]
    fn mid_host_is_standard() {
        let p = profile_for(16 * GIB, 8);
        assert_eq!(p.class, ProfileClass::Standard);
        assert_eq!(p.batch_size, 32);
        assert_eq!(p.cpu_workers, 4);
    }

    #[test]
    fn large_host_gets_bigger_batches_and_workers() {
        let p = profile_for(64 * GIB, 32);
        assert_eq!(p.class, ProfileClass::Large);
        assert_eq!(p.batch_size, 64);
        assert_eq!(p.cpu_workers, 8);
        assert!(p.batch_size > profile_for(12 * GIB, 32).batch_size);
    }

    #[test]
    fn unknown_host_gets_minimal_profile() {
        let p = profile_for(0, 0);
        assert_eq!(p.cpu_workers, 1);
        assert_eq!(p.batch_size, 4);
    }

    #[test]
    fn detection_never_panics() {
        let p = profile();
        assert!(p.cpu_workers >= 1);
        assert!(p.batch_size >= 1);
    }

    #[test]
    fn limits_override_profile() {
        let limits = ResourceLimits {
            batch_size: Some(3),
            memory_ceiling_mb: Some(1024),
            workers: Some(6),
        };
        let p = profile_for(32 * GIB, 16).with_limits(&limits);
        assert_eq!(p.batch_size, 3);
        assert_eq!(p.cpu_workers, 6);
        assert_eq!(p.memory_budget_bytes, 1024 * MIB);
        assert!(p.cache_entries <= 2_000);
    }

    #[test]
    fn pressure_thresholds() {
        assert!(under_pressure(100 * MIB, 16 * GIB, 4 * GIB));
        assert!(!under_pressure(8 * GIB, 16 * GIB, 4 * GIB));
        assert!(!under_pressure(0, 0, 4 * GIB));
    }
}
