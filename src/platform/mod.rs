//! Platform probe: CPUID-based vendor/family/model/hybrid detection, P/E/L
//! core classification and TDP discovery (spec.md §4.2).

pub mod cpuid;

use std::path::Path;

use tracing::info;

use crate::config::LpmdConfig;
use crate::cpumask::{CpuMaskStore, MaskId};
use crate::error::LpmdError;
use crate::sysfs;

/// Hybrid core type, determined once per CPU by CPUID leaf 0x1A plus L3
/// cache presence (spec.md §3 "CoreType").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreType {
    P,
    E,
    L,
}

/// `(family, model)` allow-list lifted from
/// `original_source/src/lpmd_cpu.c`'s `id_table` (Alderlake / Raptorlake /
/// Meteorlake / Lunarlake / Pantherlake).
const SUPPORTED_FAMILY_MODEL: &[(u32, u32)] = &[
    (6, 0x97), // Alderlake
    (6, 0x9a), // Alderlake
    (6, 0xb7), // Raptorlake
    (6, 0xba), // Raptorlake
    (6, 0xbf), // Raptorlake S
    (6, 0xaa), // Meteorlake
    (6, 0xac), // Meteorlake
    (6, 0xbd), // Lunarlake
    (6, 0xcc), // Pantherlake
];

const PM_PROFILE_PATH: &str = "/sys/firmware/acpi/pm_profile";
const PM_PROFILE_MOBILE: u64 = 2;

/// Ordered partition of online CPUs by identical `cpuinfo_max_freq`
/// (spec.md §3 "FreqMap[]").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqMapEntry {
    pub start_cpu: usize,
    pub end_cpu: usize,
    pub turbo_khz: u64,
}

/// Runs the platform-support check described in spec.md §4.2. With
/// `cfg.debug` set the `(family, model)` allow-list check is skipped, as
/// `original_source/src/lpmd_cpu.c`'s `do_platform_check()` debug bypass
/// does.
pub fn detect_platform(cfg: &LpmdConfig) -> Result<(), LpmdError> {
    let ids = cpuid::read_vendor_and_family_model();
    if !ids.is_intel {
        return Err(LpmdError::UnsupportedPlatform("non-Intel vendor".into()));
    }
    if !ids.has_leaf_1a {
        return Err(LpmdError::UnsupportedPlatform(
            "CPUID leaf 0x1A unavailable (not hybrid-capable)".into(),
        ));
    }
    if !ids.hybrid_bit {
        return Err(LpmdError::UnsupportedPlatform(
            "hybrid bit (leaf 7 EDX bit 15) not set".into(),
        ));
    }

    let pm_profile = sysfs::read_u64(Path::new(PM_PROFILE_PATH)).unwrap_or(0);
    if pm_profile != PM_PROFILE_MOBILE {
        return Err(LpmdError::UnsupportedPlatform(format!(
            "acpi pm_profile {pm_profile} is not mobile ({PM_PROFILE_MOBILE})"
        )));
    }

    if !cfg.debug {
        let allowed = SUPPORTED_FAMILY_MODEL
            .iter()
            .any(|&(f, m)| f == ids.family && m == ids.model);
        if !allowed {
            return Err(LpmdError::UnsupportedPlatform(format!(
                "family:model {:x}:{:x} not in allow-list",
                ids.family, ids.model
            )));
        }
    } else {
        info!("debug mode: skipping platform allow-list check");
    }

    Ok(())
}

/// Scans `/sys/devices/system/cpu/cpuN/online`, classifies each online CPU
/// via CPUID (pinned with `sched_setaffinity`) and populates `Online` in
/// `masks` (spec.md §4.2 `detect_cpu_topology`).
pub fn detect_cpu_topology(
    max_cpus: usize,
    masks: &mut CpuMaskStore,
) -> Result<Vec<(usize, CoreType)>, LpmdError> {
    let mut classified = Vec::new();
    for cpu in 0..max_cpus {
        let online_path = format!("/sys/devices/system/cpu/cpu{cpu}/online");
        // CPU 0 has no "online" file and is always online.
        let online = if cpu == 0 {
            true
        } else {
            Path::new(&online_path).exists()
                && sysfs::read_u64(Path::new(&online_path)).unwrap_or(1) == 1
        };
        if !online {
            continue;
        }
        masks.add(MaskId::Online, cpu);
        let core_type = cpuid::classify_core_pinned(cpu)?;
        classified.push((cpu, core_type));
    }
    Ok(classified)
}

/// Reads `constraint_0_max_power_uw` from the first `package*` RAPL domain
/// under `/sys/class/powercap` (spec.md §4.2 `tdp_watts`).
pub fn tdp_watts() -> Result<u32, LpmdError> {
    sysfs::rapl_package_tdp_watts(Path::new("/sys/class/powercap"))
}

/// Partitions online CPUs by identical `cpuinfo_max_freq`, in enumeration
/// order (spec.md §3 "FreqMap[]").
pub fn build_freq_map(online_cpus: &[usize]) -> Vec<FreqMapEntry> {
    let mut freqs = Vec::new();
    for &cpu in online_cpus {
        let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/cpuinfo_max_freq");
        let khz = sysfs::read_u64(Path::new(&path)).unwrap_or(0);
        freqs.push((cpu, khz));
    }
    let mut out: Vec<FreqMapEntry> = Vec::new();
    for (cpu, khz) in freqs {
        match out.last_mut() {
            Some(entry) if entry.turbo_khz == khz && entry.end_cpu + 1 == cpu => {
                entry.end_cpu = cpu;
            }
            _ => out.push(FreqMapEntry {
                start_cpu: cpu,
                end_cpu: cpu,
                turbo_khz: khz,
            }),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freq_map_groups_contiguous_equal_freq_cpus() {
        // Simulated: CPUs 0-1 share a freq bucket via a fake table since
        // we can't fabricate sysfs entries here; exercise the grouping
        // logic directly instead.
        let mut out: Vec<FreqMapEntry> = Vec::new();
        for (cpu, khz) in [(0u64, 4000u64), (1, 4000), (2, 3000), (3, 3000)]
            .iter()
            .map(|&(c, k)| (c as usize, k))
        {
            match out.last_mut() {
                Some(entry) if entry.turbo_khz == khz && entry.end_cpu + 1 == cpu => {
                    entry.end_cpu = cpu;
                }
                _ => out.push(FreqMapEntry {
                    start_cpu: cpu,
                    end_cpu: cpu,
                    turbo_khz: khz,
                }),
            }
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], FreqMapEntry { start_cpu: 0, end_cpu: 1, turbo_khz: 4000 });
        assert_eq!(out[1], FreqMapEntry { start_cpu: 2, end_cpu: 3, turbo_khz: 3000 });
    }
}
