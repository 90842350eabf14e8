//! Workload-type proxy: an 8-state heuristic that infers a workload
//! type from per-tick load/stall aggregates when no firmware WLT hint
//! is available (spec.md §4.4).

use crate::config::PollClass;
use crate::runtime::WltType;

const STRIKEOUT_N: u32 = 10;
const STAY_COUNT_DEFAULT: u32 = 3;
const SPIKE_CAP_MS: u32 = 1000;
const SPIKE_LOAD_THRESHOLD: f64 = 90.0;
const BC_RESET_MIN_BASE_SECS: f64 = 120.0;
const BC_RESET_MIN_FLOOR_SECS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WltState {
    Init,
    Perf,
    Resp,
    Mdrt4E,
    Mdrt3E,
    Mdrt2E,
    Norm,
    Deep,
}

/// Per-tick sampler aggregates the proxy reasons over (spec.md §4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct TickMetrics {
    pub max: f64,
    pub second: f64,
    pub third: f64,
    pub sma1: f64,
    pub sma2: f64,
    pub sma3: f64,
    /// worst_stall, 0..1
    pub stall: f64,
    /// every applicable CPU's load > 10%
    pub high_mt: bool,
}

impl TickMetrics {
    fn sum_top3(&self) -> f64 {
        self.max + self.second + self.third
    }

    fn stall_low(&self) -> bool {
        self.stall * 100.0 <= 40.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyOutput {
    pub state: WltState,
    pub hint: WltType,
    pub next_poll_ms: u64,
}

/// Running proxy state machine: one instance per daemon, driven once per
/// tick by [`WltProxy::tick`].
pub struct WltProxy {
    state: WltState,
    strikeout: u32,
    stay_count: u32,
    total_spike_time_ms: u32,
    spike_burst_flag: bool,
    burst_count: u32,
    elapsed_ms: u64,
    ms_since_last_burst: u64,
    spike_rate_sum: f64,
    spike_rate_samples: u64,
}

impl WltProxy {
    pub fn new() -> Self {
        Self {
            state: WltState::Init,
            strikeout: STRIKEOUT_N,
            stay_count: STAY_COUNT_DEFAULT,
            total_spike_time_ms: 0,
            spike_burst_flag: false,
            burst_count: 0,
            elapsed_ms: 0,
            ms_since_last_burst: 0,
            spike_rate_sum: 0.0,
            spike_rate_samples: 0,
        }
    }

    pub fn state(&self) -> WltState {
        self.state
    }

    fn enter(&mut self, next: WltState) {
        if next != self.state {
            self.state = next;
            self.strikeout = STRIKEOUT_N;
            self.stay_count = STAY_COUNT_DEFAULT;
        }
    }

    fn spike_rate(&self) -> f64 {
        (self.total_spike_time_ms as f64 * 100.0 / SPIKE_CAP_MS as f64).min(100.0)
    }

    /// Updates `total_spike_time`, decaying on sub-threshold load and
    /// tracks bursts; returns the current `spike_rate` (spec.md §4.4
    /// "Spike tracking"/"Burst tracking").
    fn update_spike_and_burst(&mut self, m: &TickMetrics, poll_ms: u64) {
        if m.max > SPIKE_LOAD_THRESHOLD {
            self.total_spike_time_ms = (self.total_spike_time_ms + poll_ms as u32).min(SPIKE_CAP_MS);
        } else {
            self.total_spike_time_ms = self.total_spike_time_ms.saturating_sub(poll_ms as u32);
        }
        let rate = self.spike_rate();
        self.spike_rate_sum += rate;
        self.spike_rate_samples += 1;

        let was_flagged = self.spike_burst_flag;
        self.spike_burst_flag = rate > 0.0;
        if !was_flagged && self.spike_burst_flag {
            self.burst_count += 1;
            self.ms_since_last_burst = 0;
        } else {
            self.ms_since_last_burst += poll_ms;
        }

        self.elapsed_ms += poll_ms;

        let avg_rate = self.spike_rate_sum / self.spike_rate_samples.max(1) as f64;
        let bc_reset_min_secs = (BC_RESET_MIN_BASE_SECS - avg_rate).max(BC_RESET_MIN_FLOOR_SECS);
        if self.burst_count > 0 && self.ms_since_last_burst as f64 >= bc_reset_min_secs * 1000.0 {
            self.burst_count -= 1;
            self.ms_since_last_burst = 0;
        }
    }

    pub fn burst_count(&self) -> u32 {
        self.burst_count
    }

    fn burst_rate_per_min(&self) -> f64 {
        let minutes = self.elapsed_ms as f64 / 60_000.0;
        if minutes < f64::EPSILON {
            0.0
        } else {
            self.burst_count as f64 / minutes
        }
    }

    /// `state.base_poll_ms * ((100-u)/100)^order`, clamped to `[100,
    /// max]` and floored to multiples of 100 (spec.md §4.4).
    pub fn next_poll_interval_ms(base_poll_ms: u64, max_poll_ms: u64, class: PollClass, top_load_pct: f64) -> u64 {
        let order = class.order();
        let factor = ((100.0 - top_load_pct) / 100.0).max(0.0).powi(order);
        let raw = base_poll_ms as f64 * factor;
        let floored = (raw / 100.0).floor() * 100.0;
        (floored as u64).clamp(100, max_poll_ms)
    }

    fn hint_for(state: WltState) -> WltType {
        match state {
            WltState::Perf => WltType::Bursty,
            WltState::Resp | WltState::Norm => WltType::BatteryLife,
            WltState::Deep => WltType::Idle,
            _ => WltType::Sustained,
        }
    }

    /// Advances the proxy one tick and returns the (possibly unchanged)
    /// state, workload-type hint, and next polling interval (spec.md
    /// §4.4 transition table).
    pub fn tick(&mut self, m: &TickMetrics, base_poll_ms: u64, max_poll_ms: u64, class: PollClass) -> ProxyOutput {
        self.update_spike_and_burst(m, base_poll_ms);

        if self.strikeout > 0 {
            self.strikeout -= 1;
        } else {
            self.strikeout = STRIKEOUT_N;
        }
        if self.stay_count > 0 {
            self.stay_count -= 1;
        }

        let strikeout_done = self.strikeout == 0;
        let stay_done = self.stay_count == 0;
        let burst_breach = self.spike_burst_flag || self.burst_rate_per_min() >= 3.0;
        let sum_top3 = m.sum_top3();
        let perf_count = self.burst_count;

        let target = match self.state {
            WltState::Init => {
                if !m.high_mt {
                    WltState::Perf
                } else {
                    WltState::Init
                }
            }
            WltState::Perf => {
                if m.high_mt {
                    WltState::Init
                } else if burst_breach && self.stay_count > 0 {
                    WltState::Perf
                } else if sum_top3 <= 20.0 && m.sma1 <= 70.0 {
                    WltState::Resp
                } else if !burst_breach && m.max <= 10.0 {
                    WltState::Mdrt3E
                } else {
                    WltState::Perf
                }
            }
            WltState::Resp => {
                if m.max > 70.0 && m.sma1 > 40.0 {
                    WltState::Perf
                } else if perf_count > 0 && burst_breach {
                    WltState::Resp
                } else if !m.stall_low() {
                    WltState::Mdrt3E
                } else {
                    WltState::Resp
                }
            }
            WltState::Mdrt4E => {
                if m.stall_low() {
                    WltState::Resp
                } else if m.max > 90.0 && (burst_breach || strikeout_done) {
                    WltState::Perf
                } else if stay_done && m.sma1 <= 25.0 && m.sma2 <= 25.0 && sum_top3 <= 50.0 {
                    WltState::Norm
                } else {
                    WltState::Mdrt4E
                }
            }
            WltState::Mdrt3E => {
                if m.stall_low() {
                    WltState::Resp
                } else if m.max > 90.0 && (burst_breach || strikeout_done) {
                    WltState::Perf
                } else if m.sma1 >= 25.0 && m.sma2 >= 20.0 {
                    WltState::Mdrt4E
                } else if stay_done && m.sma1 > 4.0 && m.sma1 <= 25.0 && m.sma2 > 4.0 && m.sma2 <= 25.0 {
                    WltState::Mdrt2E
                } else if stay_done && m.sma1 <= 25.0 && m.sma2 <= 2.0 && m.sma3 <= 2.0 {
                    WltState::Norm
                } else {
                    WltState::Mdrt3E
                }
            }
            WltState::Mdrt2E => {
                if m.stall_low() {
                    WltState::Resp
                } else if (m.max > 90.0 || (m.sma1 >= 25.0 && m.sma2 >= 15.0)) && (burst_breach || strikeout_done) {
                    WltState::Mdrt3E
                } else if stay_done && m.sma1 > 4.0 && m.sma1 <= 25.0 && m.sma2 <= 25.0 {
                    WltState::Norm
                } else {
                    WltState::Mdrt2E
                }
            }
            WltState::Norm => {
                if m.stall_low() {
                    WltState::Resp
                } else if (m.max > 50.0 || m.sma1 > 40.0) && (burst_breach || strikeout_done) {
                    WltState::Mdrt2E
                } else if stay_done && ((m.max <= 10.0 && m.second <= 1.0) || m.sma1 <= 2.0) {
                    WltState::Deep
                } else {
                    WltState::Norm
                }
            }
            WltState::Deep => {
                if m.stall_low() {
                    WltState::Resp
                } else if m.max > 35.0 {
                    WltState::Norm
                } else {
                    WltState::Deep
                }
            }
        };

        self.enter(target);
        let hint = Self::hint_for(self.state);
        let next_poll_ms = Self::next_poll_interval_ms(base_poll_ms, max_poll_ms, class, m.max);

        ProxyOutput {
            state: self.state,
            hint,
            next_poll_ms,
        }
    }
}

impl Default for WltProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(max: f64, second: f64, third: f64, sma1: f64, sma2: f64, sma3: f64, stall: f64) -> TickMetrics {
        TickMetrics {
            max,
            second,
            third,
            sma1,
            sma2,
            sma3,
            stall,
            high_mt: false,
        }
    }

    #[test]
    fn init_moves_to_perf_when_not_high_mt() {
        let mut proxy = WltProxy::new();
        let out = proxy.tick(&metrics(5.0, 0.0, 0.0, 5.0, 0.0, 0.0, 1.0), 1000, 1000, PollClass::Linear);
        assert_eq!(out.state, WltState::Perf);
        assert_eq!(out.hint, WltType::Bursty);
    }

    #[test]
    fn norm_to_mdrt2e_on_high_max_load() {
        let mut proxy = WltProxy::new();
        proxy.state = WltState::Norm;
        proxy.strikeout = 0;
        let m = metrics(55.0, 10.0, 5.0, 45.0, 20.0, 5.0, 1.0);
        let out = proxy.tick(&m, 1000, 1000, PollClass::Linear);
        assert_eq!(out.state, WltState::Mdrt2E);
        assert_eq!(out.next_poll_ms, 400);
    }

    #[test]
    fn deep_stays_until_load_recovers() {
        let mut proxy = WltProxy::new();
        proxy.state = WltState::Deep;
        let out = proxy.tick(&metrics(5.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0), 1000, 1000, PollClass::Zeroth);
        assert_eq!(out.state, WltState::Deep);
        assert_eq!(out.hint, WltType::Idle);
    }

    #[test]
    fn burst_counter_decays_without_further_spikes() {
        let mut proxy = WltProxy::new();
        let m = metrics(95.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        proxy.tick(&m, 1000, 1000, PollClass::Linear);
        let count_after_spike = proxy.burst_count();
        assert!(count_after_spike >= 1);
        let quiet = metrics(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let mut last = count_after_spike;
        for _ in 0..200 {
            proxy.tick(&quiet, 1000, 1000, PollClass::Linear);
            assert!(proxy.burst_count() <= last);
            last = proxy.burst_count();
        }
    }
}
