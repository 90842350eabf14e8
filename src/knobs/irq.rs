//! IRQ-affinity migration: irqbalance socket when present, a native
//! `/proc/irq` writer otherwise (spec.md §4.6 "IRQ migration").

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixCredentials};
use nix::unistd::{getgid, getpid, getuid};

use crate::error::LpmdError;
use crate::sysfs;

fn irqbalance_socket_path() -> Option<std::path::PathBuf> {
    let dir = Path::new("/run/irqbalance");
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("irqbalance") && name.ends_with(".sock") {
            return Some(entry.path());
        }
    }
    None
}

/// Backend selected once at init by presence of an irqbalance socket
/// (spec.md §4.6).
pub enum IrqBackend {
    Irqbalance { socket_path: std::path::PathBuf },
    Native { saved_affinity: HashMap<u32, String> },
}

impl IrqBackend {
    pub fn detect() -> Self {
        match irqbalance_socket_path() {
            Some(socket_path) => IrqBackend::Irqbalance { socket_path },
            None => IrqBackend::Native {
                saved_affinity: HashMap::new(),
            },
        }
    }

    fn send_irqbalance_command(socket_path: &Path, command: &str) -> Result<(), LpmdError> {
        let socket = UnixDatagram::unbound().map_err(|e| {
            LpmdError::MalformedConfig(format!("irqbalance socket create: {e}"))
        })?;
        socket
            .connect(socket_path)
            .map_err(|e| LpmdError::MalformedConfig(format!("irqbalance connect: {e}")))?;
        let ucred = libc::ucred {
            pid: getpid().as_raw(),
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        };
        let cred = UnixCredentials::from(ucred);
        let iov = [std::io::IoSlice::new(command.as_bytes())];
        let cmsg = [ControlMessage::ScmCredentials(&cred)];
        sendmsg::<nix::sys::socket::UnixAddr>(
            socket.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(|e| LpmdError::MalformedConfig(format!("irqbalance sendmsg: {e}")))?;
        Ok(())
    }

    /// Applies `hex` as the new IRQ affinity target, or restores the
    /// prior state when `hex` is `None`.
    pub fn apply(&mut self, hex: Option<&str>) -> Result<(), LpmdError> {
        match self {
            IrqBackend::Irqbalance { socket_path } => {
                let command = match hex {
                    Some(h) => format!("settings cpus {h}"),
                    None => "settings cpus NULL".to_string(),
                };
                Self::send_irqbalance_command(socket_path, &command)
            }
            IrqBackend::Native { saved_affinity } => Self::apply_native(saved_affinity, hex),
        }
    }

    fn apply_native(saved: &mut HashMap<u32, String>, hex: Option<&str>) -> Result<(), LpmdError> {
        let irqs = enumerate_proc_interrupts()?;
        match hex {
            Some(h) => {
                for irq in irqs {
                    let path = format!("/proc/irq/{irq}/smp_affinity");
                    if let Ok(current) = sysfs::read_to_string(Path::new(&path)) {
                        saved.entry(irq).or_insert_with(|| current.trim().to_string());
                    }
                    sysfs::write_str(Path::new(&path), h)?;
                }
            }
            None => {
                for (irq, value) in saved.drain() {
                    let path = format!("/proc/irq/{irq}/smp_affinity");
                    sysfs::write_str(Path::new(&path), &value)?;
                }
            }
        }
        Ok(())
    }
}

/// Numeric IRQ numbers from `/proc/interrupts`'s leading column.
fn enumerate_proc_interrupts() -> Result<Vec<u32>, LpmdError> {
    let content = sysfs::read_to_string(Path::new("/proc/interrupts"))?;
    let mut out = Vec::new();
    for line in content.lines().skip(1) {
        let Some(first) = line.split(':').next() else { continue };
        if let Ok(n) = first.trim().parse::<u32>() {
            out.push(n);
        }
    }
    Ok(out)
}
