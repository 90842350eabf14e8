//! Cpuset isolation backends: cgroup-v2 delegation, the `lpm` isolate
//! cgroup, and `intel_powerclamp` (spec.md §4.6 "Cpuset isolation").

use std::path::Path;

use tracing::warn;

use crate::error::LpmdError;
use crate::knobs::systemd_dbus;
use crate::sysfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpusetBackend {
    Cgroupv2,
    Isolate,
    Powerclamp,
    /// Documented by the enum only; the core never acts on it (spec.md
    /// §4.6 "Offline").
    Offline,
}

const ISOLATE_CGROUP: &str = "/sys/fs/cgroup/lpm";
const POWERCLAMP_PARAMS: &str = "/sys/module/intel_powerclamp/parameters";

/// SUV entry duration/idle percentage (spec.md §4.6 "Powerclamp (SUV
/// mode, optional)" names the knobs without fixing values; these mirror
/// the aggressive-clamp figures `intel_powerclamp` documents for thermal
/// distress response).
pub const SUV_DURATION_MS: u32 = 100;
pub const SUV_MAX_IDLE_PCT: u32 = 90;

/// Reads the module's current `duration` parameter, the value
/// [`restore_suv_powerclamp`] should restore on SUV exit.
pub fn read_powerclamp_duration() -> Result<u32, LpmdError> {
    sysfs::read_u64(Path::new(&format!("{POWERCLAMP_PARAMS}/duration"))).map(|v| v as u32)
}

/// Relinquishes or claims the `cpuset` controller, then mirrors the
/// target mask to `system/user/machine.slice`'s `AllowedCPUs`. On
/// failure, restores those slices to `online_bytes_le` before returning
/// the error (spec.md §4.6 "On any mid-sequence failure").
pub async fn apply_cgroupv2(
    target_is_online: bool,
    target_bytes_le: &[u8],
    online_bytes_le: &[u8],
) -> Result<(), LpmdError> {
    let subtree = Path::new("/sys/fs/cgroup/cgroup.subtree_control");
    let directive = if target_is_online { "-cpuset" } else { "+cpuset" };
    sysfs::write_str(subtree, directive)?;

    if let Err(e) = systemd_dbus::set_allowed_cpus(target_bytes_le).await {
        warn!(error = %e, "AllowedCPUs update failed, restoring online set");
        let _ = systemd_dbus::set_allowed_cpus(online_bytes_le).await;
        return Err(e);
    }
    Ok(())
}

/// `cpuset.cpus.partition` / `cpuset.cpus` under the dedicated `lpm`
/// cgroup. `reverse_csv` is the CPUs to *remove* (spec.md §4.6
/// "Isolate").
pub fn apply_isolate(isolating: bool, reverse_csv: &str, online_csv: &str) -> Result<(), LpmdError> {
    let cpus_path = format!("{ISOLATE_CGROUP}/cpuset.cpus");
    let partition_path = format!("{ISOLATE_CGROUP}/cpuset.cpus.partition");
    if isolating {
        sysfs::write_str(Path::new(&cpus_path), reverse_csv)?;
        sysfs::write_str(Path::new(&partition_path), "isolated")
    } else {
        sysfs::write_str(Path::new(&cpus_path), online_csv)?;
        sysfs::write_str(Path::new(&partition_path), "member")
    }
}

pub fn apply_powerclamp(target_hex: &str, thermal_cur_state_path: &Path, cur_state: u32) -> Result<(), LpmdError> {
    sysfs::write_str(Path::new(&format!("{POWERCLAMP_PARAMS}/cpumask")), target_hex)?;
    sysfs::write_u64(thermal_cur_state_path, cur_state as u64)
}

/// SUV-mode powerclamp parameters (spec.md §4.6 "Powerclamp (SUV mode,
/// optional)").
pub fn apply_suv_powerclamp(duration_ms: u32, max_idle: u32, target_hex: &str) -> Result<(), LpmdError> {
    sysfs::write_u64(Path::new(&format!("{POWERCLAMP_PARAMS}/duration")), duration_ms as u64)?;
    sysfs::write_u64(Path::new(&format!("{POWERCLAMP_PARAMS}/max_idle")), max_idle as u64)?;
    sysfs::write_str(Path::new(&format!("{POWERCLAMP_PARAMS}/cpumask")), target_hex)
}

pub fn restore_suv_powerclamp(initial_duration_ms: u32) -> Result<(), LpmdError> {
    sysfs::write_u64(Path::new(&format!("{POWERCLAMP_PARAMS}/duration")), initial_duration_ms as u64)?;
    sysfs::write_u64(Path::new(&format!("{POWERCLAMP_PARAMS}/max_idle")), 0)
}
