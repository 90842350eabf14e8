//! CPU hotplug uevents: `NETLINK_KOBJECT_UEVENT` socket, `DEVPATH=`
//! parsing, and the freeze/restore reconciliation (spec.md §4.7
//! "Uevent readable").

use std::path::Path;

use netlink_sys::{protocols::NETLINK_KOBJECT_UEVENT, Socket, SocketAddr};

use crate::cpumask::{CpuMaskStore, MaskId};
use crate::error::LpmdError;
use crate::runtime::LpmdMode;
use crate::sysfs;

pub struct UeventSocket {
    socket: Socket,
}

impl UeventSocket {
    /// Binds with `nl_pid = pid`, `nl_groups = -1` (all groups), per
    /// spec.md §6.
    pub fn bind() -> Result<Self, LpmdError> {
        let mut socket =
            Socket::new(NETLINK_KOBJECT_UEVENT).map_err(|e| LpmdError::NetlinkInit(format!("uevent socket: {e}")))?;
        socket
            .bind(&SocketAddr::new(std::process::id(), 0xFFFF_FFFF))
            .map_err(|e| LpmdError::NetlinkInit(format!("uevent bind: {e}")))?;
        Ok(Self { socket })
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, LpmdError> {
        self.socket
            .recv(&mut &mut buf[..], 0)
            .map_err(|e| LpmdError::NetlinkInit(format!("uevent recv: {e}")))
    }
}

/// A uevent payload is NUL-separated `KEY=value` records; only
/// `DEVPATH` matters here.
pub fn parse_devpath(payload: &[u8]) -> Option<String> {
    payload
        .split(|&b| b == 0)
        .filter_map(|part| std::str::from_utf8(part).ok())
        .find_map(|s| s.strip_prefix("DEVPATH=").map(str::to_string))
}

/// Reconstructs the observed online set from `/proc/stat` and compares
/// it to the cached `Online` mask: a mismatch enters `Freeze`, a match
/// restores (spec.md §4.7, §7 "Hotplug inconsistency").
pub fn reconcile_hotplug(devpath: &str, masks: &CpuMaskStore, proc_stat_path: &Path, mode: LpmdMode) -> LpmdMode {
    if !devpath.starts_with("/devices/system/cpu/cpu") {
        return mode;
    }
    let Ok(rows) = sysfs::read_proc_stat(proc_stat_path) else {
        return mode;
    };
    let mut observed: Vec<usize> = rows
        .iter()
        .filter_map(|(label, _, _)| label.strip_prefix("cpu").and_then(|s| s.parse::<usize>().ok()))
        .collect();
    observed.sort_unstable();

    let cached = masks.cpus(MaskId::Online);
    if observed == cached {
        mode.restore()
    } else {
        LpmdMode::freeze(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_devpath_from_nul_separated_payload() {
        let payload = b"add@/devices/system/cpu/cpu5\0ACTION=add\0DEVPATH=/devices/system/cpu/cpu5\0SUBSYSTEM=cpu\0";
        assert_eq!(parse_devpath(payload), Some("/devices/system/cpu/cpu5".to_string()));
    }

    fn stat_line(label: &str) -> String {
        format!("{label} 0 0 0 0 0 0 0 0 0 0\n")
    }

    #[test]
    fn scenario_hotplug_freeze_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");

        let mut masks = CpuMaskStore::new(8);
        masks.parse("0-4", MaskId::Online).unwrap();

        // cpu5 just appeared: /proc/stat now reports 0..=5, which differs
        // from the cached 0..=4 online mask.
        let mut content = stat_line("cpu");
        for n in 0..=5 {
            content.push_str(&stat_line(&format!("cpu{n}")));
        }
        std::fs::write(&path, &content).unwrap();
        let mode = reconcile_hotplug("/devices/system/cpu/cpu5", &masks, &path, LpmdMode::Auto);
        assert!(mode.is_frozen());

        // A later uevent where /proc/stat has settled back to the
        // original 0..=4 set restores the saved mode.
        let mut settled = stat_line("cpu");
        for n in 0..=4 {
            settled.push_str(&stat_line(&format!("cpu{n}")));
        }
        std::fs::write(&path, &settled).unwrap();
        let restored = reconcile_hotplug("/devices/system/cpu/cpu5", &masks, &path, mode);
        assert_eq!(restored, LpmdMode::Auto);
    }

    #[test]
    fn ignores_non_cpu_devpaths() {
        let masks = CpuMaskStore::new(4);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        std::fs::write(&path, "cpu 0 0 0 0 0 0 0 0 0 0\n").unwrap();
        let mode = reconcile_hotplug("/devices/virtual/net/eth0", &masks, &path, LpmdMode::On);
        assert_eq!(mode, LpmdMode::On);
    }
}
