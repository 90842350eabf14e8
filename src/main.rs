//! Entry point: platform probe, config assembly, and the event loop
//! (spec.md §6 "Startup", §6 exit codes).

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lpmd::channel;
use lpmd::config::LpmdConfig;
use lpmd::cpumask::CpuMaskStore;
use lpmd::eventloop::{EventLoop, EventLoopChannels};
use lpmd::knobs::cpuset::CpusetBackend;
use lpmd::knobs::LiveKnobApplier;
use lpmd::platform;
use lpmd::sampler::UtilizationSampler;

const MAX_CPUS: usize = 512;

fn parse_args() -> LpmdConfig {
    let mut cfg = LpmdConfig::default();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--debug" | "-d" => cfg.debug = true,
            "--dry-run" => cfg.dry_run = true,
            _ => {}
        }
    }
    cfg
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let lpmd_cfg = parse_args();

    if let Err(e) = platform::detect_platform(&lpmd_cfg) {
        error!(error = %e, "platform not supported");
        return std::process::ExitCode::from(2);
    }

    match run(lpmd_cfg) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, "lpmd exited with error");
            std::process::ExitCode::from(1)
        }
    }
}

/// Everything after the platform gate, which gets its own exit code
/// (spec.md §6): topology detection, wiring, and the event loop itself
/// all fold into one `anyhow::Result` here, the same split the teacher
/// keeps between typed module errors and `anyhow::Result` in `main.rs`.
fn run(lpmd_cfg: LpmdConfig) -> anyhow::Result<()> {
    let mut masks = CpuMaskStore::new(MAX_CPUS);
    let classified =
        platform::detect_cpu_topology(MAX_CPUS, &mut masks).context("cpu topology detection failed")?;
    info!(cpus = classified.len(), "cpu topology detected");

    let masks = Rc::new(RefCell::new(masks));
    let sampler = Rc::new(RefCell::new(UtilizationSampler::new()));

    let cpuset_backend = if std::path::Path::new("/sys/fs/cgroup/cgroup.subtree_control").exists() {
        CpusetBackend::Cgroupv2
    } else {
        CpusetBackend::Offline
    };
    let applier = LiveKnobApplier::new(masks.clone(), sampler.clone(), cpuset_backend, lpmd_cfg.dry_run);

    // The command sender is the hook an external control surface (CLI,
    // D-Bus) would clone; wiring one up is out of scope here (spec.md §1
    // Non-goals), so the loop only ever sees what it sends itself.
    let (_sender, command_rx) = channel::channel();
    let (uevent_tx, uevent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (hfi_tx, hfi_rx) = tokio::sync::mpsc::unbounded_channel();

    spawn_uevent_reader(uevent_tx);
    // The HFI socket needs a resolved generic-netlink family id, which
    // requires the nlctrl handshake this daemon does not yet implement
    // (see hfi.rs); hfi_rx stays idle until that lands. The sender is
    // kept alive (rather than dropped) so the receiver blocks instead of
    // resolving to `None` on every poll.
    let _hfi_tx_keepalive = hfi_tx;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let event_loop = EventLoop::new(lpmd_cfg.core, masks, sampler, Box::new(applier), true);
    runtime.block_on(event_loop.run(EventLoopChannels {
        commands: command_rx,
        uevents: uevent_rx,
        hfi_events: hfi_rx,
    }));

    Ok(())
}

/// Reads `NETLINK_KOBJECT_UEVENT` on a dedicated blocking thread and
/// forwards parsed `DEVPATH` strings into the async reactor, since the
/// raw netlink socket has no async-ready wrapper here (spec.md §4.7
/// "Uevent readable").
fn spawn_uevent_reader(tx: tokio::sync::mpsc::UnboundedSender<String>) {
    std::thread::spawn(move || {
        let mut socket = match lpmd::uevent::UeventSocket::bind() {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "uevent socket bind failed, hotplug reconciliation disabled");
                return;
            }
        };
        let mut buf = [0u8; 4096];
        loop {
            let n = match socket.recv(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "uevent recv failed");
                    return;
                }
            };
            if let Some(devpath) = lpmd::uevent::parse_devpath(&buf[..n]) {
                if tx.send(devpath).is_err() {
                    return;
                }
            }
        }
    });
}
