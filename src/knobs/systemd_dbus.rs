//! systemd `SetUnitProperties` client used by the cgroup-v2 cpuset
//! backend to publish `AllowedCPUs` (spec.md §4.6, §6 "systemd D-Bus").

use tracing::warn;
use zbus::zvariant::Value;
use zbus::Connection;

use crate::error::LpmdError;

const UNITS: &[&str] = &["system.slice", "user.slice", "machine.slice"];

/// Calls `org.freedesktop.systemd1.Manager.SetUnitProperties` for each
/// unit in [`UNITS`], setting `AllowedCPUs` to `cpus_le` (one byte per 8
/// CPUs, little-endian, per spec.md §6).
pub async fn set_allowed_cpus(cpus_le: &[u8]) -> Result<(), LpmdError> {
    let connection = Connection::system()
        .await
        .map_err(|e| LpmdError::DbusCall(format!("system bus connect: {e}")))?;

    for unit in UNITS {
        let props: Vec<(&str, Value)> = vec![("AllowedCPUs", Value::from(cpus_le.to_vec()))];
        let result: Result<(), zbus::Error> = connection
            .call_method(
                Some("org.freedesktop.systemd1"),
                "/org/freedesktop/systemd1",
                Some("org.freedesktop.systemd1.Manager"),
                "SetUnitProperties",
                &(*unit, true, props),
            )
            .await
            .map(|_| ());
        if let Err(e) = result {
            warn!(unit, error = %e, "SetUnitProperties failed");
            return Err(LpmdError::DbusCall(format!("{unit}: {e}")));
        }
    }
    Ok(())
}
