//! HFI (Hardware Feedback Interface) capacity-change handling: banlist
//! and SUV classification, `Hfi`/`HfiLast` bookkeeping (spec.md §4.7.1).
//!
//! The wire socket is a generic-netlink family named `"thermal"`
//! (multicast group `"event"`, command `CAPACITY_CHANGE`, spec.md §6);
//! family/group ids are resolved once at init via the kernel's
//! `nlctrl` handshake and handed to [`HfiSocket::bind`].

use netlink_sys::{protocols::NETLINK_GENERIC, Socket, SocketAddr};
use tracing::debug;

use crate::cpumask::{CpuMaskStore, MaskId};
use crate::error::LpmdError;

/// One `(cpu, perf, eff)` triple from a `CAPACITY` attribute.
#[derive(Debug, Clone, Copy)]
pub struct HfiTriple {
    pub cpu: usize,
    pub perf: u32,
    pub eff: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfiEvent {
    Enter,
    SuvEnter,
    SuvExit,
    Exit,
    None,
}

/// `eff == 255*4` is the "full efficiency credit" sentinel the firmware
/// uses for LPM-eligible CPUs (spec.md §4.7.1).
const HFI_LPM_EFF_SENTINEL: u32 = 255 * 4;

pub struct HfiHandler {
    hfi_lpm_enabled: bool,
    hfi_suv_enabled: bool,
    suv_bit_set: bool,
    in_hfi_lpm: bool,
    in_suv_lpm: bool,
}

impl HfiHandler {
    pub fn new(hfi_lpm_enabled: bool, hfi_suv_enabled: bool) -> Self {
        Self {
            hfi_lpm_enabled,
            hfi_suv_enabled,
            suv_bit_set: false,
            in_hfi_lpm: false,
            in_suv_lpm: false,
        }
    }

    /// Toggled by the `SuvEnter`/`SuvExit` command messages (spec.md
    /// §4.7 pipe message list).
    pub fn set_suv_bit(&mut self, value: bool) {
        self.suv_bit_set = value;
    }

    /// Classifies one message's triples and updates `Hfi`/`HfiBanned`/
    /// `HfiSuv`/`HfiLast`, returning the event to fire (spec.md §4.7.1).
    pub fn process_batch(&mut self, triples: &[HfiTriple], masks: &mut CpuMaskStore) -> HfiEvent {
        masks.reset(MaskId::Hfi);
        masks.reset(MaskId::HfiBanned);
        masks.reset(MaskId::HfiSuv);

        for t in triples {
            let tag = if t.eff == HFI_LPM_EFF_SENTINEL && self.hfi_lpm_enabled {
                masks.add(MaskId::Hfi, t.cpu);
                "LPM"
            } else if t.perf == 0 && t.eff == 0 && self.hfi_suv_enabled && self.suv_bit_set {
                masks.add(MaskId::HfiSuv, t.cpu);
                "SUV"
            } else if t.perf == 0 && t.eff == 0 {
                masks.add(MaskId::HfiBanned, t.cpu);
                "BAN"
            } else {
                "NOR"
            };
            debug!(cpu = t.cpu, perf = t.perf, eff = t.eff, tag, "hfi triple classified");
        }

        if masks.has(MaskId::Hfi) && !masks.equal(MaskId::Hfi, MaskId::HfiLast) {
            masks.copy(MaskId::Hfi, MaskId::HfiLast);
            self.in_hfi_lpm = true;
            return HfiEvent::Enter;
        }
        if masks.has(MaskId::HfiSuv) {
            self.in_suv_lpm = true;
            return HfiEvent::SuvEnter;
        }
        if masks.has(MaskId::HfiBanned) {
            masks.set_to_online_excluding(MaskId::Hfi, MaskId::HfiBanned);
            if !masks.equal(MaskId::Hfi, MaskId::HfiLast) {
                masks.copy(MaskId::Hfi, MaskId::HfiLast);
                self.in_hfi_lpm = true;
                return HfiEvent::Enter;
            }
            return HfiEvent::None;
        }
        if self.in_hfi_lpm {
            masks.reset(MaskId::HfiLast);
            self.in_hfi_lpm = false;
            return HfiEvent::Exit;
        }
        if self.in_suv_lpm {
            self.in_suv_lpm = false;
            return HfiEvent::SuvExit;
        }
        HfiEvent::None
    }
}

/// Thin wrapper over the bound generic-netlink socket; decoding is
/// delegated to [`decode_capacity_change`].
pub struct HfiSocket {
    socket: Socket,
}

impl HfiSocket {
    pub fn bind(family_id: u16, mcast_group_id: u32) -> Result<Self, LpmdError> {
        let mut socket =
            Socket::new(NETLINK_GENERIC).map_err(|e| LpmdError::NetlinkInit(format!("hfi socket: {e}")))?;
        socket
            .bind(&SocketAddr::new(std::process::id(), 1 << mcast_group_id))
            .map_err(|e| LpmdError::NetlinkInit(format!("hfi bind: {e}")))?;
        let _ = family_id;
        Ok(Self { socket })
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, LpmdError> {
        self.socket
            .recv(&mut &mut buf[..], 0)
            .map_err(|e| LpmdError::NetlinkInit(format!("hfi recv: {e}")))
    }
}

/// Decodes a `CAPACITY_CHANGE` generic-netlink payload into triples.
/// The `CAPACITY` attribute is assumed to carry fixed-width
/// little-endian `(u32 cpu, u16 perf, u16 eff)` records back to back.
pub fn decode_capacity_change(payload: &[u8]) -> Vec<HfiTriple> {
    const RECORD_LEN: usize = 8;
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + RECORD_LEN <= payload.len() {
        let cpu = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
        let perf = u16::from_le_bytes(payload[offset + 4..offset + 6].try_into().unwrap()) as u32;
        let eff = u16::from_le_bytes(payload[offset + 6..offset + 8].try_into().unwrap()) as u32;
        out.push(HfiTriple { cpu, perf, eff });
        offset += RECORD_LEN;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online_4() -> CpuMaskStore {
        let mut m = CpuMaskStore::new(4);
        m.parse("0-3", MaskId::Online).unwrap();
        m
    }

    #[test]
    fn scenario_hfi_banlist_narrows_to_unbanned_online() {
        let mut masks = online_4();
        let mut handler = HfiHandler::new(true, false);
        let triples = [
            HfiTriple { cpu: 0, perf: 800, eff: 1020 },
            HfiTriple { cpu: 1, perf: 0, eff: 0 },
            HfiTriple { cpu: 2, perf: 800, eff: 1020 },
            HfiTriple { cpu: 3, perf: 0, eff: 0 },
        ];
        let event = handler.process_batch(&triples, &mut masks);
        assert_eq!(event, HfiEvent::Enter);
        assert_eq!(masks.to_csv(MaskId::HfiBanned), "1,3");
        assert_eq!(masks.to_csv(MaskId::Hfi), "0,2");
    }

    #[test]
    fn exit_fires_once_after_entering_lpm() {
        let mut masks = online_4();
        let mut handler = HfiHandler::new(true, false);
        let lpm_triple = [HfiTriple { cpu: 0, perf: 0, eff: HFI_LPM_EFF_SENTINEL }];
        assert_eq!(handler.process_batch(&lpm_triple, &mut masks), HfiEvent::Enter);

        let normal = [HfiTriple { cpu: 0, perf: 800, eff: 1020 }];
        assert_eq!(handler.process_batch(&normal, &mut masks), HfiEvent::Exit);
        assert_eq!(handler.process_batch(&normal, &mut masks), HfiEvent::None);
    }

    #[test]
    fn duplicate_hfi_set_is_suppressed() {
        let mut masks = online_4();
        let mut handler = HfiHandler::new(true, false);
        let lpm_triple = [HfiTriple { cpu: 0, perf: 0, eff: HFI_LPM_EFF_SENTINEL }];
        assert_eq!(handler.process_batch(&lpm_triple, &mut masks), HfiEvent::Enter);
        assert_eq!(handler.process_batch(&lpm_triple, &mut masks), HfiEvent::None);
    }

    #[test]
    fn decodes_fixed_width_records() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        let triples = decode_capacity_change(&payload);
        assert_eq!(triples.len(), 1);
        assert_eq!(triples[0].cpu, 1);
    }
}
