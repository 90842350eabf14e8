//! CPU-mask store: canonical named CPU bitsets with memoized derived
//! encodings (spec.md §3 "CpuMask (named)" and §4.1).

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use crate::error::LpmdError;

/// Named mask slots. `User(n)` slots are allocated dynamically by the
/// engine/HFI handler via [`CpuMaskStore::alloc_user`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskId {
    LpmDefault,
    Online,
    Hfi,
    HfiBanned,
    HfiSuv,
    HfiLast,
    Util,
    User(u32),
}

impl fmt::Display for MaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskId::LpmDefault => write!(f, "Low Power"),
            MaskId::Online => write!(f, "Online"),
            MaskId::Hfi => write!(f, "HFI Low Power"),
            MaskId::HfiBanned => write!(f, "HFI BANNED"),
            MaskId::HfiSuv => write!(f, "HFI SUV"),
            MaskId::HfiLast => write!(f, "HFI LAST"),
            MaskId::Util => write!(f, "Util"),
            MaskId::User(n) => write!(f, "User{n}"),
        }
    }
}

/// Masks whose bits are permitted to escape the `Online` superset
/// (spec.md §8 universal invariant is scoped to "every MaskId other than
/// Online and Hfi*").
fn exempt_from_online_superset(id: MaskId) -> bool {
    matches!(
        id,
        MaskId::Online | MaskId::Hfi | MaskId::HfiBanned | MaskId::HfiSuv | MaskId::HfiLast
    )
}

#[derive(Default)]
struct Derived {
    csv: Option<String>,
    csv_reversed: Option<String>,
    hex_be: Option<String>,
    bytes_le: Option<Vec<u8>>,
}

struct Entry {
    bits: Vec<u64>,
    derived: RefCell<Derived>,
}

impl Entry {
    fn new(words: usize) -> Self {
        Self {
            bits: vec![0u64; words],
            derived: RefCell::new(Derived::default()),
        }
    }
}

/// The canonical CPU-mask store. One instance per running daemon,
/// constructed once `max_cpus` is known from platform/topology detection
/// (spec.md §5 "Global state").
pub struct CpuMaskStore {
    max_cpus: usize,
    words: usize,
    entries: HashMap<MaskId, Entry>,
    next_user: u32,
}

fn word_count(max_cpus: usize) -> usize {
    (max_cpus + 63) / 64
}

impl CpuMaskStore {
    pub fn new(max_cpus: usize) -> Self {
        let words = word_count(max_cpus);
        let mut entries = HashMap::new();
        for id in [
            MaskId::LpmDefault,
            MaskId::Online,
            MaskId::Hfi,
            MaskId::HfiBanned,
            MaskId::HfiSuv,
            MaskId::HfiLast,
            MaskId::Util,
        ] {
            entries.insert(id, Entry::new(words));
        }
        Self {
            max_cpus,
            words,
            entries,
            next_user: 0,
        }
    }

    pub fn max_cpus(&self) -> usize {
        self.max_cpus
    }

    /// Allocates a new dynamically-named user slot, mirroring
    /// `cpumask_alloc()` in `original_source/src/lpmd_cpumask.c`.
    pub fn alloc_user(&mut self) -> MaskId {
        let id = MaskId::User(self.next_user);
        self.next_user += 1;
        self.entries.insert(id, Entry::new(self.words));
        id
    }

    fn entry(&self, id: MaskId) -> &Entry {
        self.entries
            .get(&id)
            .unwrap_or_else(|| panic!("unknown cpumask slot {id}"))
    }

    fn entry_mut(&mut self, id: MaskId) -> &mut Entry {
        self.entries
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown cpumask slot {id}"))
    }

    fn invalidate(&mut self, id: MaskId) {
        *self.entry_mut(id).derived.borrow_mut() = Derived::default();
    }

    pub fn reset(&mut self, id: MaskId) {
        let words = self.words;
        let entry = self.entry_mut(id);
        entry.bits.iter_mut().for_each(|w| *w = 0);
        *entry.derived.borrow_mut() = Derived::default();
        debug_assert_eq!(entry.bits.len(), words);
    }

    pub fn is_online(&self, cpu: usize) -> bool {
        self.has_bit(MaskId::Online, cpu)
    }

    fn has_bit(&self, id: MaskId, cpu: usize) -> bool {
        if cpu >= self.max_cpus {
            return false;
        }
        let e = self.entry(id);
        (e.bits[cpu / 64] >> (cpu % 64)) & 1 == 1
    }

    /// Sets `cpu` in `id`. Silently ignored if `cpu` is not online and
    /// `id != Online` (spec.md §4.1).
    pub fn add(&mut self, id: MaskId, cpu: usize) {
        if cpu >= self.max_cpus {
            return;
        }
        if id != MaskId::Online && !self.is_online(cpu) {
            return;
        }
        let e = self.entry_mut(id);
        e.bits[cpu / 64] |= 1u64 << (cpu % 64);
        self.invalidate(id);
    }

    pub fn remove(&mut self, id: MaskId, cpu: usize) {
        if cpu >= self.max_cpus {
            return;
        }
        let e = self.entry_mut(id);
        e.bits[cpu / 64] &= !(1u64 << (cpu % 64));
        self.invalidate(id);
    }

    pub fn count(&self, id: MaskId) -> usize {
        self.entry(id)
            .bits
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    pub fn has(&self, id: MaskId) -> bool {
        self.count(id) > 0
    }

    pub fn equal(&self, a: MaskId, b: MaskId) -> bool {
        self.entry(a).bits == self.entry(b).bits
    }

    pub fn cpus(&self, id: MaskId) -> Vec<usize> {
        (0..self.max_cpus).filter(|&c| self.has_bit(id, c)).collect()
    }

    pub fn copy(&mut self, src: MaskId, dst: MaskId) {
        let bits = self.entry(src).bits.clone();
        let e = self.entry_mut(dst);
        e.bits = bits;
        self.invalidate(dst);
    }

    /// `dst := src \ exclude`.
    pub fn copy_excluding(&mut self, src: MaskId, dst: MaskId, exclude: MaskId) {
        let src_bits = self.entry(src).bits.clone();
        let excl_bits = self.entry(exclude).bits.clone();
        let e = self.entry_mut(dst);
        e.bits = src_bits
            .iter()
            .zip(excl_bits.iter())
            .map(|(s, x)| s & !x)
            .collect();
        self.invalidate(dst);
    }

    /// `dst := online \ banned`, the HFI banlist-to-active-set reduction
    /// used by spec.md §4.7.1 (`Hfi := Online \ HfiBanned`).
    pub fn set_to_online_excluding(&mut self, dst: MaskId, exclude: MaskId) {
        self.copy_excluding(MaskId::Online, dst, exclude);
    }

    /// Checks the "no bit outside Online" invariant for masks other than
    /// Online/Hfi* (spec.md §8).
    pub fn check_online_superset(&self, id: MaskId) -> bool {
        if exempt_from_online_superset(id) {
            return true;
        }
        let online = &self.entry(MaskId::Online).bits;
        let this = &self.entry(id).bits;
        this.iter().zip(online.iter()).all(|(m, o)| m & !o == 0)
    }

    /// Parses a CSV of decimal CPUs and inclusive ranges (`a-b` or `a..b`)
    /// into `id`, replacing its previous contents.
    pub fn parse(&mut self, s: &str, id: MaskId) -> Result<(), LpmdError> {
        self.reset(id);
        let s = s.trim();
        if s.is_empty() {
            return Ok(());
        }
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (lo, hi) = if let Some(idx) = token.find("..") {
                (&token[..idx], &token[idx + 2..])
            } else if let Some(idx) = token.find('-') {
                (&token[..idx], &token[idx + 1..])
            } else {
                (token, token)
            };
            let lo: i64 = lo
                .trim()
                .parse()
                .map_err(|_| LpmdError::MalformedCpuList(s.to_string()))?;
            let hi: i64 = hi
                .trim()
                .parse()
                .map_err(|_| LpmdError::MalformedCpuList(s.to_string()))?;
            if lo < 0 || hi < 0 || lo > hi {
                return Err(LpmdError::MalformedCpuList(s.to_string()));
            }
            for cpu in lo..=hi {
                let cpu = cpu as usize;
                if cpu >= self.max_cpus {
                    return Err(LpmdError::MalformedCpuList(s.to_string()));
                }
                // Online is the only slot parse() is allowed to populate
                // unconditionally; for every other slot `add` already
                // enforces the online-superset invariant.
                if id == MaskId::Online {
                    self.entry_mut(id).bits[cpu / 64] |= 1u64 << (cpu % 64);
                } else {
                    self.add(id, cpu);
                }
            }
        }
        self.invalidate(id);
        Ok(())
    }

    /// Flat decimal CSV, one CPU number per comma, matching
    /// `cpumask_to_str` in `original_source/src/lpmd_cpumask.c` (no range
    /// collapsing; spec.md's Glossary `0,2,4-7` example is a read-back
    /// format, not what this produces).
    pub fn to_csv(&self, id: MaskId) -> String {
        if let Some(cached) = &self.entry(id).derived.borrow().csv {
            return cached.clone();
        }
        let cpus = self.cpus(id);
        let s = encode_flat(&cpus);
        self.entry(id).derived.borrow_mut().csv = Some(s.clone());
        s
    }

    /// CSV of `Online XOR id`.
    pub fn to_csv_reversed(&self, id: MaskId) -> String {
        if let Some(cached) = &self.entry(id).derived.borrow().csv_reversed {
            return cached.clone();
        }
        let online = self.entry(MaskId::Online).bits.clone();
        let this = self.entry(id).bits.clone();
        let xor: Vec<u64> = online.iter().zip(this.iter()).map(|(o, m)| o ^ m).collect();
        let cpus: Vec<usize> = (0..self.max_cpus)
            .filter(|&c| (xor[c / 64] >> (c % 64)) & 1 == 1)
            .collect();
        let s = encode_flat(&cpus);
        self.entry(id).derived.borrow_mut().csv_reversed = Some(s.clone());
        s
    }

    /// Big-endian hex string, MSB (highest CPU) first, no leading zero
    /// padding beyond whole nibbles.
    pub fn to_hex_be(&self, id: MaskId) -> String {
        if let Some(cached) = &self.entry(id).derived.borrow().hex_be {
            return cached.clone();
        }
        let bytes = self.to_bytes_le(id);
        let mut be = bytes.clone();
        be.reverse();
        let mut s = String::with_capacity(be.len() * 2);
        for b in &be {
            s.push_str(&format!("{:02x}", b));
        }
        // Strip leading zero bytes' worth of nibbles, keep at least one digit.
        let trimmed = s.trim_start_matches('0');
        let out = if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        };
        self.entry(id).derived.borrow_mut().hex_be = Some(out.clone());
        out
    }

    /// One byte per 8 CPUs, little-endian (CPU 0 is bit 0 of byte 0).
    pub fn to_bytes_le(&self, id: MaskId) -> Vec<u8> {
        if let Some(cached) = &self.entry(id).derived.borrow().bytes_le {
            return cached.clone();
        }
        let nbytes = (self.max_cpus + 7) / 8;
        let mut out = vec![0u8; nbytes];
        for cpu in self.cpus(id) {
            out[cpu / 8] |= 1u8 << (cpu % 8);
        }
        self.entry(id).derived.borrow_mut().bytes_le = Some(out.clone());
        out
    }
}

fn encode_flat(cpus: &[usize]) -> String {
    cpus.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online_8() -> CpuMaskStore {
        let mut s = CpuMaskStore::new(8);
        s.parse("0-7", MaskId::Online).unwrap();
        s
    }

    #[test]
    fn parse_and_csv_roundtrip() {
        let mut s = online_8();
        s.parse("0,2,4-7", MaskId::Util).unwrap();
        assert_eq!(s.to_csv(MaskId::Util), "0,2,4,5,6,7");
        let again = s.to_csv(MaskId::Util);
        s.parse(&again, MaskId::LpmDefault).unwrap();
        assert!(s.equal(MaskId::Util, MaskId::LpmDefault));
    }

    #[test]
    fn add_outside_online_is_noop() {
        let mut s = CpuMaskStore::new(4);
        s.parse("0-1", MaskId::Online).unwrap();
        s.add(MaskId::Util, 3);
        assert!(!s.has(MaskId::Util));
    }

    #[test]
    fn online_superset_invariant() {
        let mut s = online_8();
        s.parse("1,3", MaskId::Util).unwrap();
        assert!(s.check_online_superset(MaskId::Util));
        assert!(s.count(MaskId::Util) <= s.count(MaskId::Online));
    }

    #[test]
    fn reversed_csv_is_xor_with_online() {
        let mut s = online_8();
        s.parse("0-3", MaskId::Util).unwrap();
        assert_eq!(s.to_csv_reversed(MaskId::Util), "4,5,6,7");
    }

    #[test]
    fn hex_and_bytes_are_consistent() {
        let mut s = online_8();
        s.parse("0,1", MaskId::Util).unwrap();
        // cpus {0,1}: byte0 = 0b0000_0011
        let bytes = s.to_bytes_le(MaskId::Util);
        assert_eq!(bytes[0], 0b0000_0011);
        let hex = s.to_hex_be(MaskId::Util);
        assert_eq!(hex, "3");
    }

    #[test]
    fn hex_be_is_byte_reversed_bytes_le() {
        let mut s = CpuMaskStore::new(20);
        s.parse("0-19", MaskId::Online).unwrap();
        s.parse("16", MaskId::Util).unwrap();
        let bytes = s.to_bytes_le(MaskId::Util);
        let mut reversed = bytes.clone();
        reversed.reverse();
        let rebuilt: String = reversed.iter().map(|b| format!("{:02x}", b)).collect();
        let trimmed = rebuilt.trim_start_matches('0');
        assert_eq!(s.to_hex_be(MaskId::Util), trimmed);
    }

    #[test]
    fn malformed_lists_rejected() {
        let mut s = online_8();
        assert!(s.parse("-1", MaskId::Util).is_err());
        assert!(s.parse("3-1", MaskId::Util).is_err());
        assert!(s.parse("a,b", MaskId::Util).is_err());
    }

    #[test]
    fn mutation_invalidates_derived_cache() {
        let mut s = online_8();
        s.parse("0", MaskId::Util).unwrap();
        assert_eq!(s.to_csv(MaskId::Util), "0");
        s.add(MaskId::Util, 1);
        assert_eq!(s.to_csv(MaskId::Util), "0,1");
    }
}
