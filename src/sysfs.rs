//! Typed sysfs/procfs I/O helpers, MSR pread and RAPL energy-counter
//! access (spec.md §4.2/§6, "Sysfs/MSR I/O").
//!
//! Every write goes through [`write_str`] so a future dry-run mode can be
//! layered in one place; every failure is wrapped into [`LpmdError`] with
//! the offending path attached, matching the teacher's `anyhow::Context`
//! style of keeping the failing operation visible in the error message.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LpmdError;

pub fn read_to_string(path: &Path) -> Result<String, LpmdError> {
    std::fs::read_to_string(path).map_err(|source| LpmdError::SysfsRead {
        path: path.to_path_buf(),
        source,
    })
}

pub fn read_u64(path: &Path) -> Result<u64, LpmdError> {
    let s = read_to_string(path)?;
    s.trim()
        .parse()
        .map_err(|_| LpmdError::MalformedConfig(format!("{}: not an integer: {s:?}", path.display())))
}

pub fn write_str(path: &Path, value: &str) -> Result<(), LpmdError> {
    debug!(path = %path.display(), value, "sysfs write");
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| LpmdError::SysfsOpen {
            path: path.to_path_buf(),
            source,
        })?;
    f.write_all(value.as_bytes())
        .map_err(|source| LpmdError::SysfsWrite {
            path: path.to_path_buf(),
            source,
        })
}

pub fn write_u64(path: &Path, value: u64) -> Result<(), LpmdError> {
    write_str(path, &value.to_string())
}

/// Reads `/proc/stat`'s per-CPU `cpuN ...` lines plus the aggregate `cpu `
/// line, returning `(label, user+nice+system+irq+softirq+steal, idle+iowait)`
/// tuples in file order. Used by the system-load half of the sampler
/// (spec.md §4.3).
pub fn read_proc_stat(path: &Path) -> Result<Vec<(String, u64, u64)>, LpmdError> {
    let content = read_to_string(path)?;
    let mut out = Vec::new();
    for line in content.lines() {
        if !line.starts_with("cpu") {
            continue;
        }
        let mut fields = line.split_whitespace();
        let label = match fields.next() {
            Some(l) => l.to_string(),
            None => continue,
        };
        let nums: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
        if nums.len() < 5 {
            continue;
        }
        let idle = nums[3] + nums[4];
        let busy: u64 = nums.iter().sum::<u64>() - idle;
        out.push((label, busy, idle));
    }
    Ok(out)
}

/// Reads `constraint_0_max_power_uw` under an `intel-rapl*` "package*"
/// powercap node and returns watts (spec.md §4.2 `tdp_watts`).
pub fn rapl_package_tdp_watts(powercap_root: &Path) -> Result<u32, LpmdError> {
    let entries = std::fs::read_dir(powercap_root).map_err(|source| LpmdError::SysfsOpen {
        path: powercap_root.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name_path = path.join("name");
        let Ok(name) = read_to_string(&name_path) else {
            continue;
        };
        if !name.trim().starts_with("package") {
            continue;
        }
        let uw = read_u64(&path.join("constraint_0_max_power_uw"))?;
        return Ok((uw / 1_000_000) as u32);
    }
    Err(LpmdError::SysfsRead {
        path: powercap_root.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no package* rapl domain"),
    })
}

/// MSR access via `/dev/cpu/N/msr` pread, the fallback backend named in
/// spec.md §6 when the `perf_event_open` MSR PMU is unavailable.
pub struct MsrFile {
    file: File,
    path: PathBuf,
}

impl MsrFile {
    pub fn open(cpu: usize) -> Result<Self, LpmdError> {
        let path = PathBuf::from(format!("/dev/cpu/{cpu}/msr"));
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|source| LpmdError::SysfsOpen {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    pub fn read(&self, msr: u32) -> Result<u64, LpmdError> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact_at(&mut buf, msr as u64)
            .map_err(|source| LpmdError::MsrIo {
                path: self.path.clone(),
                source,
            })?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Reads a single line, seeking to 0 first -- the WLT-hint fd protocol
/// (spec.md §4.7 "WLT readable: seek-to-zero + read one small integer").
pub fn read_int_seek0(file: &mut File) -> Result<i32, LpmdError> {
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(0))
        .map_err(|source| LpmdError::SysfsRead {
            path: PathBuf::from("<wlt-hint-fd>"),
            source,
        })?;
    let mut s = String::new();
    file.read_to_string(&mut s)
        .map_err(|source| LpmdError::SysfsRead {
            path: PathBuf::from("<wlt-hint-fd>"),
            source,
        })?;
    s.trim()
        .parse()
        .map_err(|_| LpmdError::MalformedConfig(format!("wlt-hint-fd: not an integer: {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value");
        std::fs::File::create(&path).unwrap();
        write_u64(&path, 42).unwrap();
        assert_eq!(read_u64(&path).unwrap(), 42);
    }

    #[test]
    fn proc_stat_parses_busy_and_idle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "cpu  100 0 50 800 10 0 0 0 0 0").unwrap();
        writeln!(f, "cpu0 50 0 25 400 5 0 0 0 0 0").unwrap();
        writeln!(f, "intr 12345").unwrap();
        let rows = read_proc_stat(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "cpu");
        assert_eq!(rows[0].1, 150); // 100+0+50
        assert_eq!(rows[0].2, 810); // 800+10
    }

    #[test]
    fn rapl_finds_package_domain() {
        let dir = tempfile::tempdir().unwrap();
        let pkg = dir.path().join("intel-rapl:0");
        std::fs::create_dir(&pkg).unwrap();
        std::fs::write(pkg.join("name"), "package-0\n").unwrap();
        std::fs::write(pkg.join("constraint_0_max_power_uw"), "15000000\n").unwrap();
        assert_eq!(rapl_package_tdp_watts(dir.path()).unwrap(), 15);
    }
}
