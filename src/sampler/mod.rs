//! Utilization sampler: aperf/mperf/pperf/tsc-based per-CPU load, stall
//! and aggregate statistics with an SMA over the top-3 loaded CPUs
//! (spec.md §3 "PerCpuPerf", §4.3).

use std::collections::HashMap;
use std::path::Path;

use perf_event_open::config::sibling::Opts as SiblingOpts;
use perf_event_open::config::{Cpu, Opts, Proc};
use perf_event_open::count::group::CounterGroup;
use perf_event_open::count::Counter;
use perf_event_open::event::dp::DynamicPmu;
use tracing::warn;

use crate::cpumask::CpuMaskStore;
use crate::error::LpmdError;
use crate::platform::cpuid::rdtsc;
use crate::sysfs;

const SMA_LEN: usize = 25;
const MSR_PMU_DEVICE: &str = "/sys/bus/event_source/devices/msr";

/// Reads `/sys/bus/event_source/devices/msr/{type,events/<name>}` into a
/// [`DynamicPmu`] event descriptor (spec.md §6 "MSR PMU").
fn msr_event(name: &str) -> Result<DynamicPmu, LpmdError> {
    let ty = sysfs::read_u64(Path::new(&format!("{MSR_PMU_DEVICE}/type")))? as u32;
    let raw = sysfs::read_to_string(Path::new(&format!("{MSR_PMU_DEVICE}/events/{name}")))?;
    // Format is "event=0x3" (terminology-format string); only the single
    // `event=` term is supported for aperf/mperf/pperf/tsc.
    let config = raw
        .trim()
        .strip_prefix("event=")
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        .ok_or_else(|| LpmdError::PerfEventOpen(format!("unrecognised msr event format: {raw:?}")))?;
    Ok(DynamicPmu {
        ty,
        config,
        config1: 0,
        config2: 0,
        config3: 0,
    })
}

/// A grouped mperf-leader / {aperf, pperf}-sibling counter group for one
/// CPU, opened lazily on first sample (spec.md §3 "PerCpuPerf" lifetime).
struct PerfGroup {
    group: CounterGroup,
}

impl PerfGroup {
    fn open(cpu: usize) -> Result<Self, LpmdError> {
        let target = (Proc::ALL, Cpu(cpu as u32));
        let mperf = msr_event("mperf")?;
        let leader = Counter::new(mperf, target, Opts::default())
            .map_err(|e| LpmdError::PerfEventOpen(format!("mperf leader cpu{cpu}: {e}")))?;
        let mut group = CounterGroup::from(leader);
        group
            .add(msr_event("aperf")?, SiblingOpts::default())
            .map_err(|e| LpmdError::PerfEventOpen(format!("aperf sibling cpu{cpu}: {e}")))?;
        group
            .add(msr_event("pperf")?, SiblingOpts::default())
            .map_err(|e| LpmdError::PerfEventOpen(format!("pperf sibling cpu{cpu}: {e}")))?;
        group
            .leader()
            .enable()
            .map_err(|e| LpmdError::PerfEventOpen(format!("enable cpu{cpu}: {e}")))?;
        Ok(Self { group })
    }

    /// Returns `(mperf, aperf, pperf)` raw counter values.
    fn read(&self) -> Result<(u64, u64, u64), LpmdError> {
        let stat = self
            .group
            .leader()
            .stat()
            .map_err(|e| LpmdError::PerfEventOpen(format!("group stat: {e}")))?;
        if stat.siblings.len() < 2 {
            return Err(LpmdError::PerfEventOpen("missing sibling counts".into()));
        }
        Ok((stat.count, stat.siblings[0].count, stat.siblings[1].count))
    }
}

struct RawCounters {
    aperf: u64,
    mperf: u64,
    pperf: u64,
    tsc: u64,
}

/// Per-CPU cached deltas and derived values (spec.md §3 "PerCpuPerf").
pub struct PerCpuPerf {
    pub cpu: usize,
    group: Option<PerfGroup>,
    prev: Option<RawCounters>,
    pub load_bp: u32,
    pub scalability: f64,
    pub f0_khz: u64,
    pub saved_epp: Option<u8>,
    pub saved_epb: Option<u8>,
}

impl PerCpuPerf {
    fn new(cpu: usize) -> Self {
        Self {
            cpu,
            group: None,
            prev: None,
            load_bp: 0,
            scalability: 0.0,
            f0_khz: 0,
            saved_epp: None,
            saved_epb: None,
        }
    }

    /// `pperf`'s upper 32 bits are unreliable on ADL (spec.md §4.3
    /// "ADL errata"); when the new reading looks smaller than the old one
    /// treat it as a 32-bit unsigned wraparound instead of a real 64-bit
    /// decrease.
    fn diff_with_pperf_errata(prev: u64, cur: u64) -> u64 {
        if cur >= prev {
            cur - prev
        } else {
            (cur as u32).wrapping_sub(prev as u32) as u64
        }
    }

    fn sample(&mut self) -> Result<(), LpmdError> {
        if self.group.is_none() {
            self.group = Some(PerfGroup::open(self.cpu)?);
        }
        let group = self.group.as_ref().expect("just opened");
        let (mperf, aperf, pperf) = group.read()?;
        let tsc = rdtsc();

        let Some(prev) = self.prev.take() else {
            self.prev = Some(RawCounters { aperf, mperf, pperf, tsc });
            return Ok(());
        };

        let mperf_diff = mperf.saturating_sub(prev.mperf);
        let aperf_diff = aperf.saturating_sub(prev.aperf);
        let pperf_diff = Self::diff_with_pperf_errata(prev.pperf, pperf);
        let tsc_diff = tsc.saturating_sub(prev.tsc).max(1);

        // load_bp = 100 * 100 * mperf_diff / tsc_diff (basis points)
        self.load_bp = ((10_000u128 * mperf_diff as u128) / tsc_diff as u128) as u32;
        self.scalability = if aperf_diff == 0 {
            0.0
        } else {
            (pperf_diff as f64 / aperf_diff as f64).clamp(0.0, 1.0 - f64::EPSILON)
        };

        self.prev = Some(RawCounters { aperf, mperf, pperf, tsc });
        Ok(())
    }
}

/// Ring-buffer SMA over the last [`SMA_LEN`] ticks for the top-3
/// aggregate loads (spec.md §4.3 "SMA over the top-3 loaded CPUs").
struct Sma3 {
    ring: [[u32; SMA_LEN]; 3],
    sum: [u64; 3],
    pos: usize,
    filled: usize,
}

impl Sma3 {
    fn new() -> Self {
        Self {
            ring: [[0; SMA_LEN]; 3],
            sum: [0; 3],
            pos: 0,
            filled: 0,
        }
    }

    fn push(&mut self, top3: [u32; 3]) {
        for n in 0..3 {
            self.sum[n] -= self.ring[n][self.pos] as u64;
            self.ring[n][self.pos] = top3[n];
            self.sum[n] += top3[n] as u64;
        }
        self.pos = (self.pos + 1) % SMA_LEN;
        self.filled = (self.filled + 1).min(SMA_LEN);
    }

    /// `sma_avgN = sma_sum[N-1] / (25*100)` (spec.md §4.3); `N` is
    /// 1-indexed (1=max, 2=2nd, 3=3rd).
    fn avg(&self, n: usize) -> f64 {
        self.sum[n - 1] as f64 / (SMA_LEN as f64 * 100.0)
    }
}

/// One tick's aggregate output, consumed by the WLT proxy and state
/// engine.
#[derive(Debug, Clone, Default)]
pub struct SampleOutput {
    pub max_load_pct: f64,
    pub second_load_pct: f64,
    pub third_load_pct: f64,
    pub min_load_pct: f64,
    pub worst_stall: f64,
    pub worst_stall_cpu: Option<usize>,
    pub sma_avg1: f64,
    pub sma_avg2: f64,
    pub sma_avg3: f64,
}

pub struct UtilizationSampler {
    per_cpu: HashMap<usize, PerCpuPerf>,
    sma: Sma3,
    prev_proc_stat: Option<Vec<(String, u64, u64)>>,
}

impl UtilizationSampler {
    pub fn new() -> Self {
        Self {
            per_cpu: HashMap::new(),
            sma: Sma3::new(),
            prev_proc_stat: None,
        }
    }

    /// Samples every CPU set in `applicable` (spec.md §4.3 "for every CPU
    /// that is in the currently applicable set"). A failed read for one
    /// CPU is skipped, not fatal (spec.md §4.3 "Failure").
    pub fn tick(&mut self, applicable: &[usize]) -> SampleOutput {
        let mut loads: Vec<u32> = Vec::with_capacity(applicable.len());
        let mut worst_stall = 1.0f64;
        let mut worst_stall_cpu = None;

        for &cpu in applicable {
            let entry = self.per_cpu.entry(cpu).or_insert_with(|| PerCpuPerf::new(cpu));
            if let Err(e) = entry.sample() {
                warn!(cpu, error = %e, "utilization sample skipped");
                continue;
            }
            loads.push(entry.load_bp);
            if entry.scalability < worst_stall {
                worst_stall = entry.scalability;
                worst_stall_cpu = Some(cpu);
            }
        }

        loads.sort_unstable_by(|a, b| b.cmp(a));
        let top3 = [
            loads.first().copied().unwrap_or(0),
            loads.get(1).copied().unwrap_or(0),
            loads.get(2).copied().unwrap_or(0),
        ];
        self.sma.push(top3);

        SampleOutput {
            max_load_pct: top3[0] as f64 / 100.0,
            second_load_pct: top3[1] as f64 / 100.0,
            third_load_pct: top3[2] as f64 / 100.0,
            min_load_pct: loads.last().map(|&v| v as f64 / 100.0).unwrap_or(0.0),
            worst_stall,
            worst_stall_cpu,
            sma_avg1: self.sma.avg(1),
            sma_avg2: self.sma.avg(2),
            sma_avg3: self.sma.avg(3),
        }
    }

    /// System-wide load from `/proc/stat`, independent of the per-CPU
    /// perf-event path (spec.md §4.3). Returns basis points, or `None` on
    /// read failure (the tick keeps the previous value).
    pub fn system_load_bp(&mut self, path: &Path) -> Option<u32> {
        let rows = sysfs::read_proc_stat(path).ok()?;
        let prev = self.prev_proc_stat.replace(rows.clone())?;
        let (_, busy, idle) = rows.iter().find(|(label, _, _)| label == "cpu")?.clone();
        let (_, pbusy, pidle) = prev.iter().find(|(label, _, _)| label == "cpu")?.clone();
        let busy_diff = busy.saturating_sub(pbusy);
        let idle_diff = idle.saturating_sub(pidle);
        let total = busy_diff + idle_diff;
        if total == 0 {
            return Some(0);
        }
        Some(((busy_diff as u128 * 10_000) / total as u128) as u32)
    }

    /// Max per-CPU busy fraction (bp) over online CPUs only (spec.md
    /// §4.3 "CPU-wide max is max_i(busy_i) over online CPUs").
    pub fn cpu_wide_max_bp(&mut self, path: &Path, masks: &CpuMaskStore) -> Option<u32> {
        let rows = sysfs::read_proc_stat(path).ok()?;
        let prev = self.prev_proc_stat.as_ref()?;
        let mut max_bp = 0u32;
        for (label, busy, idle) in &rows {
            let Some(cpu_num) = label.strip_prefix("cpu").and_then(|s| s.parse::<usize>().ok()) else {
                continue;
            };
            if !masks.is_online(cpu_num) {
                continue;
            }
            let Some((_, pbusy, pidle)) = prev.iter().find(|(l, _, _)| l == label) else {
                continue;
            };
            let busy_diff = busy.saturating_sub(*pbusy);
            let idle_diff = idle.saturating_sub(*pidle);
            let total = busy_diff + idle_diff;
            if total == 0 {
                continue;
            }
            let bp = ((busy_diff as u128 * 10_000) / total as u128) as u32;
            max_bp = max_bp.max(bp);
        }
        Some(max_bp)
    }

    pub fn saved_epp(&self, cpu: usize) -> Option<u8> {
        self.per_cpu.get(&cpu).and_then(|p| p.saved_epp)
    }

    pub fn set_saved_epp(&mut self, cpu: usize, value: u8) {
        self.per_cpu
            .entry(cpu)
            .or_insert_with(|| PerCpuPerf::new(cpu))
            .saved_epp = Some(value);
    }

    pub fn saved_epb(&self, cpu: usize) -> Option<u8> {
        self.per_cpu.get(&cpu).and_then(|p| p.saved_epb)
    }

    pub fn set_saved_epb(&mut self, cpu: usize, value: u8) {
        self.per_cpu
            .entry(cpu)
            .or_insert_with(|| PerCpuPerf::new(cpu))
            .saved_epb = Some(value);
    }
}

impl Default for UtilizationSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pperf_errata_treats_decrease_as_32bit_wrap() {
        let prev = 0xFFFF_FFFFu64;
        let cur = 0x0000_0005u64;
        assert_eq!(PerCpuPerf::diff_with_pperf_errata(prev, cur), 6);
    }

    #[test]
    fn pperf_errata_normal_increase_is_plain_subtraction() {
        assert_eq!(PerCpuPerf::diff_with_pperf_errata(100, 150), 50);
    }

    #[test]
    fn sma_converges_to_constant_input() {
        let mut sma = Sma3::new();
        for _ in 0..SMA_LEN {
            sma.push([5000, 4000, 3000]);
        }
        assert!((sma.avg(1) - 50.0).abs() < 0.01);
        assert!((sma.avg(2) - 40.0).abs() < 0.01);
        assert!((sma.avg(3) - 30.0).abs() < 0.01);
    }

    #[test]
    fn system_load_needs_two_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        std::fs::write(&path, "cpu  100 0 50 800 10 0 0 0 0 0\n").unwrap();
        let mut sampler = UtilizationSampler::new();
        assert_eq!(sampler.system_load_bp(&path), None);
        std::fs::write(&path, "cpu  200 0 100 900 20 0 0 0 0 0\n").unwrap();
        let bp = sampler.system_load_bp(&path).unwrap();
        assert!(bp > 0);
    }
}
