//! State engine: target-state selection, system-load hysteresis and
//! polling-interval update (spec.md §4.5).

use tracing::{debug, info};

use crate::config::{Config, ConfigState};
use crate::knobs::KnobApplier;
use crate::runtime::{LpmdMode, RuntimeData};

/// Which config slot `enter_next_state` picked, so callers can tell a
/// built-in from a numbered configured state in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetId {
    DefaultOn,
    DefaultOff,
    DefaultHfi,
    Configured(usize),
}

pub struct StateEngine {
    current: Option<TargetId>,
}

impl StateEngine {
    pub fn new() -> Self {
        Self { current: None }
    }

    pub fn current(&self) -> Option<TargetId> {
        self.current
    }

    /// `config_state_match` predicate from spec.md §4.5, minus the
    /// system-load hysteresis term (handled separately since it needs
    /// `&mut` access to `entry_load_sys`).
    fn matches_without_load(state: &ConfigState, rt: &RuntimeData) -> bool {
        if !state.valid {
            return false;
        }
        if let Some(wanted) = state.wlt_type {
            if rt.wlt_hint != Some(wanted) {
                return false;
            }
        }
        if state.enter_cpu_load_thres != 0 && rt.util_cpu > state.enter_cpu_load_thres * 100 {
            return false;
        }
        if state.enter_gfx_load_thres != 0 && rt.util_gfx > state.enter_gfx_load_thres * 100 {
            return false;
        }
        true
    }

    /// System-load predicate with hysteresis (spec.md §4.5 "System-load
    /// predicate with hysteresis").
    fn system_load_passes(state: &ConfigState, util_sys: u32) -> bool {
        if state.entry_system_load_thres == 0 {
            return true;
        }
        if util_sys <= state.entry_system_load_thres * 100 {
            return true;
        }
        if state.exit_system_load_hyst == 0 {
            return false;
        }
        util_sys <= state.entry_load_sys + state.exit_system_load_hyst * 100
            && util_sys <= (state.entry_system_load_thres + state.exit_system_load_hyst) * 100
    }

    /// Chooses the target per spec.md §4.5 step 2, without mutating
    /// anything.
    fn choose_target(cfg: &Config, mode: &LpmdMode, rt: &RuntimeData) -> Option<TargetId> {
        match mode {
            LpmdMode::On => return Some(TargetId::DefaultOn),
            LpmdMode::Off | LpmdMode::Terminate => return Some(TargetId::DefaultOff),
            LpmdMode::Freeze { .. } => unreachable!("caller returns before choosing a target"),
            LpmdMode::Auto => {}
        }

        if cfg.default_hfi_enabled && rt.has_hfi_update {
            return Some(TargetId::DefaultHfi);
        }

        for (idx, state) in cfg.states.iter().enumerate() {
            if !Self::matches_without_load(state, rt) {
                continue;
            }
            if !Self::system_load_passes(state, rt.util_sys) {
                continue;
            }
            return Some(TargetId::Configured(idx));
        }
        None
    }

    fn state_ref<'a>(cfg: &'a Config, target: TargetId) -> &'a ConfigState {
        match target {
            TargetId::DefaultOn => &cfg.default_on,
            TargetId::DefaultOff => &cfg.default_off,
            TargetId::DefaultHfi => &cfg.default_hfi,
            TargetId::Configured(idx) => &cfg.states[idx],
        }
    }

    fn state_mut<'a>(cfg: &'a mut Config, target: TargetId) -> &'a mut ConfigState {
        match target {
            TargetId::DefaultOn => &mut cfg.default_on,
            TargetId::DefaultOff => &mut cfg.default_off,
            TargetId::DefaultHfi => &mut cfg.default_hfi,
            TargetId::Configured(idx) => &mut cfg.states[idx],
        }
    }

    fn is_builtin(target: TargetId) -> bool {
        !matches!(target, TargetId::Configured(_))
    }

    /// §4.5.1 polling-interval selection. `proxy_owns_polling` and
    /// `proxy_next_poll_ms` let the WLT proxy set the interval instead
    /// when it is enabled for the current state.
    fn update_polling_interval(
        state: &ConfigState,
        target: TargetId,
        target_changed: bool,
        polling_enabled: bool,
        proxy_owns_polling: bool,
        proxy_next_poll_ms: Option<u64>,
        rt: &RuntimeData,
    ) -> Option<u64> {
        if Self::is_builtin(target) {
            return None;
        }
        if !polling_enabled {
            return None;
        }
        if proxy_owns_polling {
            return proxy_next_poll_ms;
        }
        let interval = if target_changed {
            state.min_poll_interval_ms
        } else if state.poll_interval_increment_ms == Some(-1) {
            let raw = state.max_poll_interval_ms as u128 * (10_000 - rt.util_cpu.min(10_000) as u128) / 10_000;
            ((raw / 100) * 100) as u64
        } else if let Some(increment) = state.poll_interval_increment_ms {
            if increment > 0 {
                rt.polling_interval_ms.unwrap_or(state.min_poll_interval_ms) + increment as u64
            } else {
                rt.polling_interval_ms.unwrap_or(state.min_poll_interval_ms)
            }
        } else {
            rt.polling_interval_ms.unwrap_or(state.min_poll_interval_ms)
        };
        Some(interval.clamp(state.min_poll_interval_ms.max(1), state.max_poll_interval_ms.max(1)))
    }

    /// Runs one full tick of spec.md §4.5 `enter_next_state`. Returns
    /// `true` if a target change occurred (knobs were (re)applied).
    #[allow(clippy::too_many_arguments)]
    pub fn enter_next_state(
        &mut self,
        cfg: &mut Config,
        mode: &mut LpmdMode,
        rt: &mut RuntimeData,
        applier: &mut dyn KnobApplier,
        polling_enabled: bool,
        proxy_owns_polling: bool,
        proxy_next_poll_ms: Option<u64>,
    ) {
        if mode.is_frozen() {
            rt.polling_interval_ms = None;
            return;
        }

        let Some(target) = Self::choose_target(cfg, mode, rt) else {
            debug!("no config state matched; retaining previous polling interval");
            return;
        };

        let target_changed = self.current != Some(target);
        let interval = {
            let state = Self::state_ref(cfg, target);
            Self::update_polling_interval(
                state,
                target,
                target_changed,
                polling_enabled,
                proxy_owns_polling,
                proxy_next_poll_ms,
                rt,
            )
        };
        rt.polling_interval_ms = interval;

        if target_changed {
            info!(?target, "state engine: target changed");
            let state = Self::state_ref(cfg, target);
            applier.apply(state, rt);
        }

        let util_sys = rt.util_sys;
        let util_cpu = rt.util_cpu;
        let state = Self::state_mut(cfg, target);
        state.entry_load_sys = util_sys;
        state.entry_load_cpu = util_cpu;

        self.current = Some(target);
        rt.has_hfi_update = false;
    }
}

impl Default for StateEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActiveCpus, Setting};
    use crate::cpumask::MaskId;
    use crate::knobs::NullKnobApplier;

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.states.push(ConfigState {
            id: 0,
            name: "idle".into(),
            entry_system_load_thres: 20,
            enter_cpu_load_thres: 15,
            min_poll_interval_ms: 1000,
            max_poll_interval_ms: 1000,
            epp: Setting::Value(128),
            active_cpus: Some(ActiveCpus::Mask(MaskId::Util)),
            ..ConfigState::default()
        });
        cfg
    }

    #[test]
    fn scenario_auto_idle_entry_selects_configured_state() {
        let mut cfg = base_config();
        let mut mode = LpmdMode::Auto;
        let mut rt = RuntimeData {
            util_sys: 1500,
            util_cpu: 1000,
            ..RuntimeData::default()
        };
        let mut engine = StateEngine::new();
        let mut applier = NullKnobApplier::default();
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        assert_eq!(engine.current(), Some(TargetId::Configured(0)));
        assert_eq!(rt.polling_interval_ms, Some(1000));
        assert!(applier.applied.contains(&"idle".to_string()));
    }

    #[test]
    fn scenario_force_on_overrides_predicates() {
        let mut cfg = base_config();
        let mut mode = LpmdMode::On;
        let mut rt = RuntimeData::default();
        let mut engine = StateEngine::new();
        let mut applier = NullKnobApplier::default();
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        assert_eq!(engine.current(), Some(TargetId::DefaultOn));
        assert_eq!(rt.polling_interval_ms, None);
    }

    #[test]
    fn scenario_hysteresis_hold_then_drop() {
        let mut cfg = Config::default();
        cfg.states.push(ConfigState {
            entry_system_load_thres: 20,
            exit_system_load_hyst: 5,
            min_poll_interval_ms: 1000,
            max_poll_interval_ms: 1000,
            ..ConfigState::default()
        });
        let mut mode = LpmdMode::Auto;
        let mut engine = StateEngine::new();
        let mut applier = NullKnobApplier::default();

        let mut rt = RuntimeData { util_sys: 1800, ..RuntimeData::default() };
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        assert_eq!(engine.current(), Some(TargetId::Configured(0)));

        rt.util_sys = 2300;
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        assert_eq!(engine.current(), Some(TargetId::Configured(0)));

        rt.util_sys = 2600;
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        assert_eq!(
            engine.current(),
            Some(TargetId::Configured(0)),
            "no match leaves the previously-selected target in place"
        );
    }

    #[test]
    fn idempotent_on_unchanged_inputs() {
        let mut cfg = base_config();
        let mut mode = LpmdMode::Auto;
        let mut rt = RuntimeData { util_sys: 1500, util_cpu: 1000, ..RuntimeData::default() };
        let mut engine = StateEngine::new();
        let mut applier = NullKnobApplier::default();
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        applier.applied.clear();
        engine.enter_next_state(&mut cfg, &mut mode, &mut rt, &mut applier, true, false, None);
        assert!(applier.applied.is_empty(), "second tick must not reapply knobs");
    }
}
