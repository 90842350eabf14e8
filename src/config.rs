//! In-memory configuration model (spec.md §3 "Config"/"ConfigState", §6).
//!
//! The XML reader that populates these structs is an external
//! collaborator (spec.md §1 Non-goals); this module owns the struct
//! shapes, defaults and the bounds-validation spec.md names so a future
//! loader has somewhere correct to deposit parsed values.

use crate::cpumask::MaskId;
use crate::error::LpmdError;

pub const MAX_CONFIG_STATES: usize = 10;

/// Numeric setting that can also be "leave alone" or "restore the value
/// captured at daemon init" (spec.md §3 ConfigState "Action").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting<T> {
    Value(T),
    Ignore,
    Restore,
}

impl<T> Setting<T> {
    pub fn is_ignore(&self) -> bool {
        matches!(self, Setting::Ignore)
    }
}

/// Which of the three PPD-announced dispositions selects which built-in
/// state the daemon forces (spec.md §3 "Three PPD default dispositions").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpdDisposition {
    Off,
    Auto,
    On,
}

impl PpdDisposition {
    pub fn from_i32(v: i32) -> Result<Self, LpmdError> {
        match v {
            -1 => Ok(PpdDisposition::Off),
            0 => Ok(PpdDisposition::Auto),
            1 => Ok(PpdDisposition::On),
            other => Err(LpmdError::MalformedConfig(format!(
                "PPD disposition out of range (-1..1): {other}"
            ))),
        }
    }
}

/// Symbolic active-CPU set selector: either a named mask already resolved
/// by code that holds a `MaskId`, or a literal CPU list parsed at
/// config-load time (spec.md §3 ConfigState "Action").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveCpus {
    Mask(MaskId),
    Literal(String),
}

/// Per-island P/E core counts used to derive `active_cpus` when no
/// literal list is given (spec.md §3 ConfigState "Action").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IslandCores {
    pub p_cores: u32,
    pub e_cores: u32,
}

/// Polling-cadence class for the WLT proxy (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollClass {
    Zeroth,
    Linear,
    Quadratic,
    Cubic,
}

impl PollClass {
    pub fn order(self) -> i32 {
        match self {
            PollClass::Zeroth => 0,
            PollClass::Linear => 1,
            PollClass::Quadratic => 2,
            PollClass::Cubic => 3,
        }
    }
}

/// A single configured low-power state (spec.md §3 "ConfigState").
#[derive(Debug, Clone)]
pub struct ConfigState {
    pub id: u32,
    pub name: String,
    pub valid: bool,

    // --- predicate ---
    pub wlt_type: Option<crate::runtime::WltType>,
    /// 0 disables the predicate (spec.md §4.5 `config_state_match`).
    pub enter_cpu_load_thres: u32,
    pub entry_system_load_thres: u32,
    pub exit_system_load_hyst: u32,
    pub enter_gfx_load_thres: u32,

    // --- action ---
    pub epp: Setting<u8>,
    pub epb: Setting<u8>,
    pub itmt_state: Setting<bool>,
    pub irq_migrate: Setting<()>,
    pub active_cpus: Option<ActiveCpus>,
    pub islands: [IslandCores; 3],

    // --- polling policy ---
    pub min_poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    /// `-1` ("adaptive") is represented as `None`.
    pub poll_interval_increment_ms: Option<i64>,
    pub poll_class: PollClass,

    // --- transient, captured at entry (spec.md §3) ---
    pub entry_load_sys: u32,
    pub entry_load_cpu: u32,
}

impl ConfigState {
    /// Applies the `min==0 && max==0 -> 1000ms default` and
    /// `min <= max` invariants from spec.md §3.
    pub fn validate(&mut self) -> Result<(), LpmdError> {
        if self.min_poll_interval_ms == 0 && self.max_poll_interval_ms == 0 {
            self.min_poll_interval_ms = 1000;
            self.max_poll_interval_ms = 1000;
        }
        if self.min_poll_interval_ms > self.max_poll_interval_ms {
            return Err(LpmdError::MalformedConfig(format!(
                "state {}: min_poll_interval {} > max_poll_interval {}",
                self.name, self.min_poll_interval_ms, self.max_poll_interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            valid: true,
            wlt_type: None,
            enter_cpu_load_thres: 0,
            entry_system_load_thres: 0,
            exit_system_load_hyst: 0,
            enter_gfx_load_thres: 0,
            epp: Setting::Ignore,
            epb: Setting::Ignore,
            itmt_state: Setting::Ignore,
            irq_migrate: Setting::Ignore,
            active_cpus: None,
            islands: [IslandCores::default(); 3],
            min_poll_interval_ms: 1000,
            max_poll_interval_ms: 1000,
            poll_interval_increment_ms: None,
            poll_class: PollClass::Linear,
            entry_load_sys: 0,
            entry_load_cpu: 0,
        }
    }
}

/// Global knobs plus the bounded array of configured states and the
/// three built-ins (spec.md §3 "Config").
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: PpdDisposition,
    pub hfi_lpm_enable: bool,
    pub hfi_suv_enable: bool,
    pub entry_delay_ms: u32,
    pub exit_delay_ms: u32,
    pub util_entry_threshold: u32,
    pub util_exit_threshold: u32,
    pub entry_hyst_ms: u32,
    pub exit_hyst_ms: u32,
    pub lp_mode_epp: Option<u8>,
    pub ignore_itmt: bool,
    pub lp_mode_cpus: Option<String>,
    pub performance_def: PpdDisposition,
    pub balanced_def: PpdDisposition,
    pub powersaver_def: PpdDisposition,

    pub states: Vec<ConfigState>,

    pub default_on: ConfigState,
    pub default_off: ConfigState,
    pub default_hfi: ConfigState,
    pub default_hfi_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: PpdDisposition::Auto,
            hfi_lpm_enable: false,
            hfi_suv_enable: false,
            entry_delay_ms: 0,
            exit_delay_ms: 0,
            util_entry_threshold: 0,
            util_exit_threshold: 0,
            entry_hyst_ms: 0,
            exit_hyst_ms: 0,
            lp_mode_epp: None,
            ignore_itmt: false,
            lp_mode_cpus: None,
            performance_def: PpdDisposition::Auto,
            balanced_def: PpdDisposition::Auto,
            powersaver_def: PpdDisposition::Auto,
            states: Vec::new(),
            default_on: ConfigState {
                name: "DEFAULT_ON".into(),
                ..ConfigState::default()
            },
            default_off: ConfigState {
                name: "DEFAULT_OFF".into(),
                ..ConfigState::default()
            },
            default_hfi: ConfigState {
                name: "DEFAULT_HFI".into(),
                ..ConfigState::default()
            },
            default_hfi_enabled: false,
        }
    }
}

impl Config {
    /// Validates bounds named in spec.md §6 and §3: `EntryDelayMS` in
    /// `0..=5000`, thresholds in `0..=100`, hysteresis in `0..=10000`,
    /// `lp_mode_epp` in `-1..=255` (represented as `Option<u8>`), at most
    /// [`MAX_CONFIG_STATES`] states, and per-state invariants.
    pub fn validate(&mut self) -> Result<(), LpmdError> {
        if self.states.len() > MAX_CONFIG_STATES {
            return Err(LpmdError::MalformedConfig(format!(
                "too many states: {} > {}",
                self.states.len(),
                MAX_CONFIG_STATES
            )));
        }
        if self.entry_delay_ms > 5000 {
            return Err(LpmdError::MalformedConfig(
                "EntryDelayMS must be 0..=5000".into(),
            ));
        }
        if self.util_entry_threshold > 100 || self.util_exit_threshold > 100 {
            return Err(LpmdError::MalformedConfig(
                "util_{entry,exit}_threshold must be 0..=100".into(),
            ));
        }
        if self.entry_hyst_ms > 10000 || self.exit_hyst_ms > 10000 {
            return Err(LpmdError::MalformedConfig(
                "{Entry,Exit}HystMS must be 0..=10000".into(),
            ));
        }
        for state in &mut self.states {
            state.validate()?;
        }
        Ok(())
    }
}

/// Process-level settings layered on top of [`Config`] (spec.md
/// SPEC_FULL.md §3 "LpmdConfig"): things `original_source/src/lpmd_main.c`
/// takes from argv/env rather than the XML file.
#[derive(Debug, Clone)]
pub struct LpmdConfig {
    pub core: Config,
    /// Disables the platform allow-list check in `platform::detect_platform`.
    pub debug: bool,
    /// Skip sysfs/D-Bus/cgroup writes; log the knob application instead.
    pub dry_run: bool,
    pub poll_fallback_ms: u64,
}

impl Default for LpmdConfig {
    fn default() -> Self {
        Self {
            core: Config::default(),
            debug: false,
            dry_run: false,
            poll_fallback_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_zero_poll_interval_defaults_to_1000() {
        let mut state = ConfigState::default();
        state.min_poll_interval_ms = 0;
        state.max_poll_interval_ms = 0;
        state.validate().unwrap();
        assert_eq!(state.min_poll_interval_ms, 1000);
        assert_eq!(state.max_poll_interval_ms, 1000);
    }

    #[test]
    fn min_greater_than_max_rejected() {
        let mut state = ConfigState::default();
        state.min_poll_interval_ms = 500;
        state.max_poll_interval_ms = 100;
        assert!(state.validate().is_err());
    }

    #[test]
    fn too_many_states_rejected() {
        let mut cfg = Config::default();
        cfg.states = vec![ConfigState::default(); MAX_CONFIG_STATES + 1];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn threshold_bounds_enforced() {
        let mut cfg = Config::default();
        cfg.util_entry_threshold = 101;
        assert!(cfg.validate().is_err());
    }
}
