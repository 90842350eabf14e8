//! Knob appliers: EPP/EPB, ITMT, cpuset isolation, IRQ migration
//! (spec.md §4.6). Dispatch across backends is a match on a tagged
//! variant captured in config, not trait inheritance (spec.md §9).

pub mod cpuset;
pub mod epp_epb;
pub mod irq;
pub mod itmt;
pub mod systemd_dbus;

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use tracing::{error, warn};

use crate::config::{ActiveCpus, ConfigState, PpdDisposition, Setting};
use crate::cpumask::{CpuMaskStore, MaskId};
use crate::runtime::RuntimeData;
use crate::sampler::UtilizationSampler;
use cpuset::CpusetBackend;
use irq::IrqBackend;

/// One apply trait per state-transition, with the live backend and a
/// no-op test double both implementing it (spec.md §4.5 step 4).
pub trait KnobApplier {
    fn apply(&mut self, state: &ConfigState, rt: &RuntimeData);

    /// Drives the `intel_powerclamp` SUV knobs on `HFI_SUV_ENTER`/`EXIT`
    /// (spec.md §4.6 "Powerclamp (SUV mode, optional)").
    fn apply_suv(&mut self, entering: bool, target_hex: &str);
}

#[derive(Default)]
pub struct NullKnobApplier {
    pub applied: Vec<String>,
}

impl KnobApplier for NullKnobApplier {
    fn apply(&mut self, state: &ConfigState, _rt: &RuntimeData) {
        self.applied.push(state.name.clone());
    }

    fn apply_suv(&mut self, entering: bool, _target_hex: &str) {
        self.applied.push(if entering { "suv-enter".into() } else { "suv-exit".into() });
    }
}

pub struct LiveKnobApplier {
    masks: Rc<RefCell<CpuMaskStore>>,
    sampler: Rc<RefCell<UtilizationSampler>>,
    cpuset_backend: CpusetBackend,
    irq_backend: IrqBackend,
    itmt_saved_at_init: bool,
    suv_duration_saved_at_init: u32,
    ppd: PpdDisposition,
    dry_run: bool,
}

impl LiveKnobApplier {
    pub fn new(
        masks: Rc<RefCell<CpuMaskStore>>,
        sampler: Rc<RefCell<UtilizationSampler>>,
        cpuset_backend: CpusetBackend,
        dry_run: bool,
    ) -> Self {
        let itmt_saved_at_init = itmt::read_current().unwrap_or(false);
        let suv_duration_saved_at_init = cpuset::read_powerclamp_duration().unwrap_or(cpuset::SUV_DURATION_MS);
        Self {
            masks,
            sampler,
            cpuset_backend,
            irq_backend: IrqBackend::detect(),
            itmt_saved_at_init,
            suv_duration_saved_at_init,
            ppd: PpdDisposition::Auto,
            dry_run,
        }
    }

    pub fn set_ppd(&mut self, ppd: PpdDisposition) {
        self.ppd = ppd;
    }

    /// Resolves `state.active_cpus` to a concrete [`MaskId`], parsing a
    /// literal list into a freshly allocated user slot if needed.
    fn resolve_active_cpus(&self, state: &ConfigState) -> Option<MaskId> {
        match &state.active_cpus {
            Some(ActiveCpus::Mask(id)) => Some(*id),
            Some(ActiveCpus::Literal(csv)) => {
                let mut masks = self.masks.borrow_mut();
                let id = masks.alloc_user();
                if masks.parse(csv, id).is_err() {
                    warn!(csv, "literal active_cpus list failed to parse");
                    return None;
                }
                Some(id)
            }
            None => None,
        }
    }

    fn apply_cpuset(&mut self, target_id: MaskId) {
        let masks = self.masks.clone();
        let target_is_online = masks.borrow().equal(target_id, MaskId::Online);

        match self.cpuset_backend {
            CpusetBackend::Cgroupv2 => {
                let target_bytes = masks.borrow().to_bytes_le(target_id);
                let online_bytes = masks.borrow().to_bytes_le(MaskId::Online);
                tokio::spawn(async move {
                    if let Err(e) = cpuset::apply_cgroupv2(target_is_online, &target_bytes, &online_bytes).await {
                        error!(error = %e, "cgroupv2 AllowedCPUs update failed");
                    }
                });
            }
            CpusetBackend::Isolate => {
                let reverse_csv = masks.borrow().to_csv_reversed(target_id);
                let online_csv = masks.borrow().to_csv(MaskId::Online);
                if let Err(e) = cpuset::apply_isolate(!target_is_online, &reverse_csv, &online_csv) {
                    warn!(error = %e, "isolate cgroup update failed");
                }
            }
            CpusetBackend::Powerclamp => {
                let hex = masks.borrow().to_hex_be(target_id);
                let path = Path::new("/sys/class/thermal/thermal_zone0/cur_state");
                if let Err(e) = cpuset::apply_powerclamp(&hex, path, 1) {
                    warn!(error = %e, "powerclamp update failed");
                }
            }
            CpusetBackend::Offline => {}
        }
    }
}

impl KnobApplier for LiveKnobApplier {
    fn apply(&mut self, state: &ConfigState, _rt: &RuntimeData) {
        if self.dry_run {
            tracing::info!(state = %state.name, "dry-run: would apply knobs");
            return;
        }

        let online: Vec<usize> = self.masks.borrow().cpus(MaskId::Online);
        for cpu in &online {
            let saved_epp = self.sampler.borrow().saved_epp(*cpu);
            if let Err(e) = epp_epb::apply_epp(*cpu, state.epp, saved_epp, self.ppd) {
                warn!(cpu, error = %e, "epp apply failed");
            }
            let saved_epb = self.sampler.borrow().saved_epb(*cpu);
            if let Err(e) = epp_epb::apply_epb(*cpu, state.epb, saved_epb) {
                warn!(cpu, error = %e, "epb apply failed");
            }
        }

        if !matches!(state.itmt_state, Setting::Ignore) {
            if let Err(e) = itmt::apply(state.itmt_state, self.itmt_saved_at_init) {
                warn!(error = %e, "itmt apply failed");
            }
        }

        if let Some(target_id) = self.resolve_active_cpus(state) {
            self.apply_cpuset(target_id);
            let hex = self.masks.borrow().to_hex_be(target_id);
            if let Err(e) = self.irq_backend.apply(Some(&hex)) {
                warn!(error = %e, "irq migration failed");
            }
        }
    }

    fn apply_suv(&mut self, entering: bool, target_hex: &str) {
        if self.dry_run {
            tracing::info!(entering, "dry-run: would apply suv powerclamp");
            return;
        }
        if entering {
            if let Err(e) =
                cpuset::apply_suv_powerclamp(cpuset::SUV_DURATION_MS, cpuset::SUV_MAX_IDLE_PCT, target_hex)
            {
                warn!(error = %e, "suv powerclamp apply failed");
            }
        } else if let Err(e) = cpuset::restore_suv_powerclamp(self.suv_duration_saved_at_init) {
            warn!(error = %e, "suv powerclamp restore failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigState;

    #[test]
    fn null_applier_records_state_names() {
        let mut applier = NullKnobApplier::default();
        let rt = RuntimeData::default();
        applier.apply(&ConfigState { name: "a".into(), ..ConfigState::default() }, &rt);
        applier.apply(&ConfigState { name: "b".into(), ..ConfigState::default() }, &rt);
        assert_eq!(applier.applied, vec!["a".to_string(), "b".to_string()]);
    }
}
