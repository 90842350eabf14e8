//! Live runtime state: sampler outputs and top-level mode (spec.md §3
//! "RuntimeData", "LpmdMode").

use serde::{Deserialize, Serialize};

/// Workload-type hint, produced either by the WLT proxy engine or read
/// from the firmware workload-hint fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WltType {
    Idle,
    BatteryLife,
    Sustained,
    Bursty,
}

/// Live sampler outputs, refreshed every tick (spec.md §3 "RuntimeData").
/// Loads are basis points (1/10000) for precision, per the GLOSSARY.
#[derive(Debug, Clone)]
pub struct RuntimeData {
    pub util_sys: u32,
    pub util_cpu: u32,
    pub util_gfx: u32,
    pub wlt_hint: Option<WltType>,
    pub worst_stall: f64,
    /// `None` means "no sampling wake-up" (the `-1` sentinel in spec.md).
    pub polling_interval_ms: Option<u64>,
    pub has_hfi_update: bool,
}

impl Default for RuntimeData {
    fn default() -> Self {
        Self {
            util_sys: 0,
            util_cpu: 0,
            util_gfx: 0,
            wlt_hint: None,
            worst_stall: 1.0,
            polling_interval_ms: Some(1000),
            has_hfi_update: false,
        }
    }
}

/// Top-level user intent (spec.md §3 "LpmdMode").
///
/// `Freeze` carries the mode it suspended so "Restore" is a pure pop
/// rather than the self-assignment bug spec.md §9 flags in the original
/// C state machine -- by construction there is nothing to self-assign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LpmdMode {
    On,
    Off,
    Auto,
    Freeze { saved: Box<LpmdMode> },
    Terminate,
}

impl LpmdMode {
    pub fn freeze(current: LpmdMode) -> LpmdMode {
        match current {
            LpmdMode::Freeze { .. } => current,
            other => LpmdMode::Freeze {
                saved: Box::new(other),
            },
        }
    }

    /// Pops back to the mode saved at the last `freeze()`, or leaves
    /// non-frozen modes untouched.
    pub fn restore(self) -> LpmdMode {
        match self {
            LpmdMode::Freeze { saved } => *saved,
            other => other,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, LpmdMode::Freeze { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_then_restore_round_trips() {
        let mode = LpmdMode::Auto;
        let frozen = LpmdMode::freeze(mode);
        assert!(frozen.is_frozen());
        let restored = frozen.restore();
        assert_eq!(restored, LpmdMode::Auto);
    }

    #[test]
    fn double_freeze_keeps_original_saved_mode() {
        let mode = LpmdMode::On;
        let frozen_once = LpmdMode::freeze(mode);
        let frozen_twice = LpmdMode::freeze(frozen_once);
        assert_eq!(frozen_twice.restore(), LpmdMode::On);
    }
}
