//! The cooperative reactor: multiplexes the command channel, uevent and
//! HFI event streams, and a tick timer, driving the state engine
//! (spec.md §4.7).
//!
//! The original design is a single `poll(fds, n, polling_interval_ms)`
//! call; here a current-thread Tokio runtime's `select!` plays that
//! role, with `rt.polling_interval_ms` driving a `tokio::time::sleep`
//! instead of a poll timeout (documented resolution in SPEC_FULL.md).

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::channel::Command;
use crate::config::{Config, PollClass};
use crate::cpumask::{CpuMaskStore, MaskId};
use crate::engine::StateEngine;
use crate::hfi::{HfiEvent, HfiHandler, HfiTriple};
use crate::knobs::KnobApplier;
use crate::runtime::{LpmdMode, RuntimeData};
use crate::sampler::UtilizationSampler;
use crate::uevent::reconcile_hotplug;
use crate::wlt::{TickMetrics, WltProxy};

/// Fallback base/max polling bounds for the WLT proxy when the selected
/// config state does not carry its own (spec.md §4.4 defaults).
const PROXY_BASE_POLL_MS: u64 = 1000;
const PROXY_MAX_POLL_MS: u64 = 10_000;

pub struct EventLoopChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub uevents: mpsc::UnboundedReceiver<String>,
    pub hfi_events: mpsc::UnboundedReceiver<Vec<HfiTriple>>,
}

pub struct EventLoop {
    cfg: Config,
    mode: LpmdMode,
    rt: RuntimeData,
    masks: Rc<RefCell<CpuMaskStore>>,
    sampler: Rc<RefCell<UtilizationSampler>>,
    wlt_proxy: WltProxy,
    use_wlt_proxy: bool,
    engine: StateEngine,
    hfi_handler: HfiHandler,
    applier: Box<dyn KnobApplier>,
    proc_stat_path: PathBuf,
}

impl EventLoop {
    pub fn new(
        cfg: Config,
        masks: Rc<RefCell<CpuMaskStore>>,
        sampler: Rc<RefCell<UtilizationSampler>>,
        applier: Box<dyn KnobApplier>,
        use_wlt_proxy: bool,
    ) -> Self {
        let hfi_handler = HfiHandler::new(cfg.hfi_lpm_enable, cfg.hfi_suv_enable);
        Self {
            cfg,
            mode: LpmdMode::Auto,
            rt: RuntimeData::default(),
            masks,
            sampler,
            wlt_proxy: WltProxy::new(),
            use_wlt_proxy,
            engine: StateEngine::new(),
            hfi_handler,
            applier,
            proc_stat_path: PathBuf::from("/proc/stat"),
        }
    }

    pub async fn run(mut self, mut channels: EventLoopChannels) {
        loop {
            let timeout = self.rt.polling_interval_ms;
            tokio::select! {
                _ = sleep_or_forever(timeout) => {
                    self.on_tick();
                }
                Some(cmd) = channels.commands.recv() => {
                    if self.on_command(cmd) {
                        break;
                    }
                }
                Some(devpath) = channels.uevents.recv() => {
                    self.on_uevent(&devpath);
                }
                Some(triples) = channels.hfi_events.recv() => {
                    self.on_hfi(&triples);
                }
            }
        }
        self.on_shutdown();
    }

    fn on_tick(&mut self) {
        if self.mode.is_frozen() {
            self.engine
                .enter_next_state(&mut self.cfg, &mut self.mode, &mut self.rt, self.applier.as_mut(), true, false, None);
            return;
        }

        let applicable = self.masks.borrow().cpus(MaskId::Online);
        let sample = self.sampler.borrow_mut().tick(&applicable);
        self.rt.util_cpu = (sample.max_load_pct * 100.0).round() as u32;
        self.rt.worst_stall = sample.worst_stall;
        if let Some(util_sys) = self.sampler.borrow_mut().system_load_bp(&self.proc_stat_path) {
            self.rt.util_sys = util_sys;
        }

        let mut proxy_next_poll_ms = None;
        if self.use_wlt_proxy {
            let high_mt = !applicable.is_empty() && sample.min_load_pct > 10.0;
            let metrics = TickMetrics {
                max: sample.max_load_pct,
                second: sample.second_load_pct,
                third: sample.third_load_pct,
                sma1: sample.sma_avg1,
                sma2: sample.sma_avg2,
                sma3: sample.sma_avg3,
                stall: sample.worst_stall,
                high_mt,
            };
            let out = self.wlt_proxy.tick(&metrics, PROXY_BASE_POLL_MS, PROXY_MAX_POLL_MS, PollClass::Linear);
            self.rt.wlt_hint = Some(out.hint);
            proxy_next_poll_ms = Some(out.next_poll_ms);
        }

        self.engine.enter_next_state(
            &mut self.cfg,
            &mut self.mode,
            &mut self.rt,
            self.applier.as_mut(),
            true,
            self.use_wlt_proxy,
            proxy_next_poll_ms,
        );
    }

    /// Returns `true` when the loop should exit (spec.md §4.7
    /// "Cancellation").
    fn on_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Terminate => {
                self.mode = LpmdMode::Terminate;
                true
            }
            Command::ForceOn => {
                self.mode = LpmdMode::On;
                false
            }
            Command::ForceOff => {
                self.mode = LpmdMode::Off;
                false
            }
            Command::Auto => {
                self.mode = LpmdMode::Auto;
                false
            }
            Command::SuvEnter => {
                self.hfi_handler.set_suv_bit(true);
                false
            }
            Command::SuvExit => {
                self.hfi_handler.set_suv_bit(false);
                false
            }
            Command::HfiEvent(triples) => {
                self.on_hfi(&triples);
                false
            }
        }
    }

    fn on_uevent(&mut self, devpath: &str) {
        let mode = std::mem::replace(&mut self.mode, LpmdMode::Auto);
        self.mode = reconcile_hotplug(devpath, &self.masks.borrow(), &self.proc_stat_path, mode);
    }

    fn on_hfi(&mut self, triples: &[HfiTriple]) {
        let event = self.hfi_handler.process_batch(triples, &mut self.masks.borrow_mut());
        match event {
            HfiEvent::SuvEnter => {
                let hex = self.masks.borrow().to_hex_be(MaskId::HfiSuv);
                self.applier.apply_suv(true, &hex);
            }
            HfiEvent::SuvExit => {
                self.applier.apply_suv(false, "");
            }
            _ => {}
        }
        if !matches!(event, HfiEvent::None) {
            self.rt.has_hfi_update = true;
        }
    }

    /// Cleans up by forcing `DEFAULT_OFF` before the process exits
    /// (spec.md §5 "A shutdown sets mode = Terminate and exits after
    /// applying DEFAULT_OFF").
    fn on_shutdown(&mut self) {
        info!("event loop terminating, applying DEFAULT_OFF");
        self.engine
            .enter_next_state(&mut self.cfg, &mut self.mode, &mut self.rt, self.applier.as_mut(), false, false, None);
    }
}

async fn sleep_or_forever(ms: Option<u64>) {
    match ms {
        Some(ms) => tokio::time::sleep(Duration::from_millis(ms.max(1))).await,
        None => std::future::pending::<()>().await,
    }
}
