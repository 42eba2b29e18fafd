// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed views of the memory-mapped hardware registers the kernel drives,
//! and the pure encoders that build values for them.
//!
//! The blocks are `#[repr(C)]` overlays; the arch backend hands out
//! `&'static` references to them (the real windows on the target, leaked
//! per-thread copies in the simulation). Padding fields keep each register
//! at its documented offset, and the layout checks at the bottom of each
//! block keep them there.

use core::mem::offset_of;

use static_assertions::const_assert_eq;
use vcell::VolatileCell;

/// Cache and MMU control, P4 area.
pub const CCN_BASE: usize = 0xff00_0000;
pub const PMCR_BASE: usize = 0xff00_0084;
pub const PMCTR_BASE: usize = 0xff10_0004;
pub const BSC_BASE: usize = 0xff80_0000;
pub const INTC_BASE: usize = 0xffd0_0000;
pub const TMU_BASE: usize = 0xffd8_0000;
pub const SCIF_BASE: usize = 0xffe8_0000;
/// Holly system bus interrupt status and masks, uncached.
pub const ASIC_BASE: usize = 0xa05f_6900;
pub const MAPLE_BASE: usize = 0xa05f_6c00;

/// MMU and exception registers.
#[repr(C)]
pub struct CcnRegs {
    pub pteh: VolatileCell<u32>,
    pub ptel: VolatileCell<u32>,
    pub ttb: VolatileCell<u32>,
    pub tea: VolatileCell<u32>,
    pub mmucr: VolatileCell<u32>,
    pub basra: VolatileCell<u32>,
    pub basrb: VolatileCell<u32>,
    pub ccr: VolatileCell<u32>,
    pub tra: VolatileCell<u32>,
    pub expevt: VolatileCell<u32>,
    pub intevt: VolatileCell<u32>,
    _reserved: [u32; 2],
    pub ptea: VolatileCell<u32>,
    pub qacr0: VolatileCell<u32>,
    pub qacr1: VolatileCell<u32>,
}

const_assert_eq!(offset_of!(CcnRegs, mmucr), 0x10);
const_assert_eq!(offset_of!(CcnRegs, tra), 0x20);
const_assert_eq!(offset_of!(CcnRegs, intevt), 0x28);
const_assert_eq!(offset_of!(CcnRegs, ptea), 0x34);

/// Performance counter control.
#[repr(C)]
pub struct PmcrRegs {
    pub pmcr1: VolatileCell<u16>,
    _pad0: u16,
    pub pmcr2: VolatileCell<u16>,
    _pad1: u16,
}

const_assert_eq!(offset_of!(PmcrRegs, pmcr2), 0x4);

/// Performance counter values: 16 high bits, 32 low bits.
#[repr(C)]
pub struct PmctrRegs {
    pub pmctr1h: VolatileCell<u32>,
    pub pmctr1l: VolatileCell<u32>,
    pub pmctr2h: VolatileCell<u32>,
    pub pmctr2l: VolatileCell<u32>,
}

/// Bus state controller. The refresh registers are write-protected; see
/// [`bsc_protected`] and [`bsc_rfcr`].
#[repr(C)]
pub struct BscRegs {
    pub bcr1: VolatileCell<u32>,
    pub bcr2: VolatileCell<u16>,
    _pad0: u16,
    pub wcr1: VolatileCell<u32>,
    pub wcr2: VolatileCell<u32>,
    pub wcr3: VolatileCell<u32>,
    pub mcr: VolatileCell<u32>,
    pub pcr: VolatileCell<u16>,
    _pad1: u16,
    pub rtcsr: VolatileCell<u16>,
    _pad2: u16,
    pub rtcnt: VolatileCell<u16>,
    _pad3: u16,
    pub rtcor: VolatileCell<u16>,
    _pad4: u16,
    pub rfcr: VolatileCell<u16>,
    _pad5: u16,
}

const_assert_eq!(offset_of!(BscRegs, rtcsr), 0x1c);
const_assert_eq!(offset_of!(BscRegs, rfcr), 0x28);

/// Interrupt controller.
#[repr(C)]
pub struct IntcRegs {
    pub icr: VolatileCell<u16>,
    _pad0: u16,
    pub ipra: VolatileCell<u16>,
    _pad1: u16,
    pub iprb: VolatileCell<u16>,
    _pad2: u16,
    pub iprc: VolatileCell<u16>,
    _pad3: u16,
    pub iprd: VolatileCell<u16>,
    _pad4: u16,
}

const_assert_eq!(offset_of!(IntcRegs, iprc), 0x0c);

#[repr(C)]
pub struct TmuChannel {
    pub tcor: VolatileCell<u32>,
    pub tcnt: VolatileCell<u32>,
    pub tcr: VolatileCell<u16>,
    _pad: u16,
}

/// Timer unit: three down-counting channels.
#[repr(C)]
pub struct TmuRegs {
    pub tocr: VolatileCell<u8>,
    _pad0: [u8; 3],
    pub tstr: VolatileCell<u8>,
    _pad1: [u8; 3],
    pub ch: [TmuChannel; 3],
}

const_assert_eq!(offset_of!(TmuRegs, ch), 0x08);
const_assert_eq!(core::mem::size_of::<TmuChannel>(), 0x0c);

/// Serial port with FIFO (the debug port).
#[repr(C)]
pub struct ScifRegs {
    pub scsmr2: VolatileCell<u16>,
    _pad0: u16,
    pub scbrr2: VolatileCell<u8>,
    _pad1: [u8; 3],
    pub scscr2: VolatileCell<u16>,
    _pad2: u16,
    pub scftdr2: VolatileCell<u8>,
    _pad3: [u8; 3],
    pub scfsr2: VolatileCell<u16>,
    _pad4: u16,
    pub scfrdr2: VolatileCell<u8>,
    _pad5: [u8; 3],
    pub scfcr2: VolatileCell<u16>,
    _pad6: u16,
    pub scfdr2: VolatileCell<u16>,
    _pad7: u16,
    pub scsptr2: VolatileCell<u16>,
    _pad8: u16,
    pub sclsr2: VolatileCell<u16>,
    _pad9: u16,
}

const_assert_eq!(offset_of!(ScifRegs, scfsr2), 0x10);
const_assert_eq!(offset_of!(ScifRegs, sclsr2), 0x24);

/// Holly event status (write 1 to acknowledge) and per-level masks.
#[repr(C)]
pub struct AsicRegs {
    pub ack: [VolatileCell<u32>; 3],
    _pad0: u32,
    /// Events routed to IRL level 6.
    pub irq_lvl6: [VolatileCell<u32>; 3],
    _pad1: u32,
    pub irq_lvl4: [VolatileCell<u32>; 3],
    _pad2: u32,
    pub irq_lvl2: [VolatileCell<u32>; 3],
}

const_assert_eq!(offset_of!(AsicRegs, irq_lvl6), 0x10);
const_assert_eq!(offset_of!(AsicRegs, irq_lvl2), 0x30);

/// Maple DMA controller.
#[repr(C)]
pub struct MapleRegs {
    _pad0: u32,
    pub dmaaddr: VolatileCell<u32>,
    _pad1: [u32; 2],
    pub reset2: VolatileCell<u32>,
    pub enable: VolatileCell<u32>,
    pub state: VolatileCell<u32>,
    _pad2: [u32; 25],
    pub speed: VolatileCell<u32>,
    _pad3: [u32; 2],
    pub reset1: VolatileCell<u32>,
}

const_assert_eq!(offset_of!(MapleRegs, state), 0x18);
const_assert_eq!(offset_of!(MapleRegs, speed), 0x80);
const_assert_eq!(offset_of!(MapleRegs, reset1), 0x8c);

// MMUCR

pub const MMUCR_AT: u32 = 1 << 0;
pub const MMUCR_TI: u32 = 1 << 2;
pub const MMUCR_SV: u32 = 1 << 8;
pub const MMUCR_SQMD: u32 = 1 << 9;
pub const MMUCR_URC_SHIFT: u32 = 10;
pub const MMUCR_URC_MASK: u32 = 0x3f << MMUCR_URC_SHIFT;

// PTEL

pub const PTEL_WT: u32 = 1 << 0;
pub const PTEL_SH: u32 = 1 << 1;
pub const PTEL_D: u32 = 1 << 2;
pub const PTEL_C: u32 = 1 << 3;
pub const PTEL_SZ0: u32 = 1 << 4;
pub const PTEL_PR_SHIFT: u32 = 5;
pub const PTEL_PR_MASK: u32 = 3 << PTEL_PR_SHIFT;
pub const PTEL_SZ1: u32 = 1 << 7;
pub const PTEL_V: u32 = 1 << 8;
pub const PTEL_PPN_MASK: u32 = 0x1fff_fc00;

/// PTEL.PR encodings.
pub const PR_PRIV_RO: u32 = 0;
pub const PR_PRIV_RW: u32 = 1;
pub const PR_ALL_RO: u32 = 2;
pub const PR_ALL_RW: u32 = 3;

pub const PTEH_ASID_MASK: u32 = 0xff;
pub const PTEH_VPN_MASK: u32 = !0x3ff;

/// PTEH for the page containing `vaddr` in address space `asid`.
pub fn pteh(vaddr: u32, asid: u8) -> u32 {
    (vaddr & PTEH_VPN_MASK) | u32::from(asid)
}

/// Attribute half of a 4 KiB PTEL.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PtelBits {
    pub pr: u32,
    pub cacheable: bool,
    pub write_through: bool,
    pub shared: bool,
    pub dirty: bool,
}

/// PTEL for a valid 4 KiB page at physical address `paddr`.
pub fn ptel(paddr: u32, bits: PtelBits) -> u32 {
    let mut v = (paddr & PTEL_PPN_MASK)
        | PTEL_V
        | PTEL_SZ0
        | (bits.pr << PTEL_PR_SHIFT) & PTEL_PR_MASK;
    if bits.cacheable {
        v |= PTEL_C;
    }
    if bits.write_through {
        v |= PTEL_WT;
    }
    if bits.shared {
        v |= PTEL_SH;
    }
    if bits.dirty {
        v |= PTEL_D;
    }
    v
}

/// Decodes the attribute half of a PTEL.
pub fn ptel_bits(v: u32) -> PtelBits {
    PtelBits {
        pr: (v & PTEL_PR_MASK) >> PTEL_PR_SHIFT,
        cacheable: v & PTEL_C != 0,
        write_through: v & PTEL_WT != 0,
        shared: v & PTEL_SH != 0,
        dirty: v & PTEL_D != 0,
    }
}

// BSC

/// Value to write to a 16-bit write-protected refresh register
/// (RTCSR, RTCNT, RTCOR). The high byte is the protection key.
pub fn bsc_protected(v: u8) -> u16 {
    0xa500 | u16::from(v)
}

/// Value to write to the 10-bit refresh count register.
pub fn bsc_rfcr(v: u16) -> u16 {
    0xa400 | (v & 0x3ff)
}

// Performance counters

pub const PMCR_PMM_MASK: u16 = 0x003f;
/// Count the CPU/bus clock ratio rather than CPU cycles.
pub const PMCR_CLOCK_TYPE: u16 = 1 << 8;
pub const PMCR_CLR: u16 = 1 << 13;
pub const PMCR_PMST: u16 = 1 << 14;
pub const PMCR_PMENABLE: u16 = 1 << 15;
pub const PMCR_RUN: u16 = PMCR_PMENABLE | PMCR_PMST;

pub const PMCR_OPERAND_READ_ACCESS_MODE: u8 = 0x01;
pub const PMCR_OPERAND_WRITE_ACCESS_MODE: u8 = 0x02;
pub const PMCR_UTLB_MISS_MODE: u8 = 0x03;
pub const PMCR_OPERAND_CACHE_READ_MISS_MODE: u8 = 0x04;
pub const PMCR_OPERAND_CACHE_WRITE_MISS_MODE: u8 = 0x05;
pub const PMCR_INSTRUCTION_FETCH_MODE: u8 = 0x06;
pub const PMCR_INSTRUCTION_CACHE_MISS_MODE: u8 = 0x08;
pub const PMCR_BRANCH_ISSUED_MODE: u8 = 0x10;
pub const PMCR_BRANCH_TAKEN_MODE: u8 = 0x11;
pub const PMCR_SINGLE_INSTRUCTION_MODE: u8 = 0x13;
pub const PMCR_DUAL_INSTRUCTION_MODE: u8 = 0x14;
pub const PMCR_FPU_INSTRUCTION_MODE: u8 = 0x15;
pub const PMCR_INTERRUPT_COUNTER_MODE: u8 = 0x16;
pub const PMCR_TRAPA_COUNTER_MODE: u8 = 0x18;
pub const PMCR_ELAPSED_TIME_MODE: u8 = 0x23;

/// Control word that runs a counter in `mode`.
pub fn pmcr_word(mode: u8, ratio: bool) -> u16 {
    let mut v = PMCR_RUN | (u16::from(mode) & PMCR_PMM_MASK);
    if ratio {
        v |= PMCR_CLOCK_TYPE;
    }
    v
}

/// The counters are 48 bits wide.
pub const PMCTR_MASK: u64 = (1 << 48) - 1;

// INTC

/// Replaces the 4-bit priority field at `shift` in an IPR value.
pub fn ipr_update(old: u16, shift: u32, level: u8) -> u16 {
    (old & !(0xf << shift)) | (u16::from(level & 0xf) << shift)
}

// TMU

pub const TSTR_STR0: u8 = 1 << 0;
pub const TCR_UNF: u16 = 1 << 8;
pub const TCR_UNIE: u16 = 1 << 5;
/// Input clock Pφ/4.
pub const TCR_TPSC_DIV4: u16 = 0;
/// Counts per second with Pφ/4 (Pφ = 50 MHz).
pub const TMU_HZ: u64 = 12_500_000;
pub const TMU_NS_PER_COUNT: u64 = 1_000_000_000 / TMU_HZ;

/// Channel reload value for an interval of `ns`.
pub fn tmu_counts(ns: u64) -> u32 {
    (ns / TMU_NS_PER_COUNT).clamp(1, u64::from(u32::MAX)) as u32
}

// SCIF

pub const SCSCR2_TE: u16 = 1 << 5;
pub const SCSCR2_RE: u16 = 1 << 4;
pub const SCSCR2_RIE: u16 = 1 << 6;
pub const SCSCR2_TIE: u16 = 1 << 7;
pub const SCFSR2_DR: u16 = 1 << 0;
pub const SCFSR2_RDF: u16 = 1 << 1;
pub const SCFSR2_TDFE: u16 = 1 << 5;
pub const SCFSR2_TEND: u16 = 1 << 6;
pub const SCFCR2_RFRST: u16 = 1 << 1;
pub const SCFCR2_TFRST: u16 = 1 << 2;
pub const SCIF_PCLK: u32 = 50_000_000;

/// Bit rate register value for `baud` with the internal clock at Pφ.
pub fn scbrr(baud: u32) -> u8 {
    (SCIF_PCLK / (32 * baud.max(1))).saturating_sub(1).min(255) as u8
}

// Holly events (status register A)

pub const ASIC_EVT_VBLANK_IN: u32 = 1 << 3;
pub const ASIC_EVT_VBLANK_OUT: u32 = 1 << 4;
pub const ASIC_EVT_MAPLE_DMA: u32 = 1 << 12;

// Maple

pub const MAPLE_RESET1_MAGIC: u32 = 0x6155_404f;
pub const MAPLE_RESET2_MAGIC: u32 = 0;
pub const MAPLE_SPEED_2MBPS: u32 = 0;
pub const MAPLE_ENABLE_ENABLED: u32 = 1;
pub const MAPLE_ENABLE_DISABLED: u32 = 0;
pub const MAPLE_STATE_DMA: u32 = 1;

/// Response timeout field of the speed register, in units of 20 ns.
pub fn maple_speed_timeout(n: u16) -> u32 {
    u32::from(n) << 16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bsc_values_carry_the_protection_key() {
        assert_eq!(bsc_protected(0x08), 0xa508);
        assert_eq!(bsc_rfcr(0x7ff), 0xa7ff);
        assert_eq!(bsc_rfcr(0x123), 0xa523);
    }

    #[test]
    fn ptel_round_trips_attributes() {
        let bits = PtelBits {
            pr: PR_ALL_RW,
            cacheable: false,
            write_through: false,
            shared: true,
            dirty: true,
        };
        let v = ptel(0x0500_1000, bits);
        assert_eq!(v & PTEL_PPN_MASK, 0x0500_1000);
        assert_ne!(v & PTEL_V, 0);
        assert_ne!(v & PTEL_SZ0, 0);
        assert_eq!(v & PTEL_SZ1, 0);
        assert_eq!(ptel_bits(v), bits);
    }

    #[test]
    fn pteh_keeps_vpn_and_asid() {
        assert_eq!(pteh(0x0012_3456, 7), 0x0012_3407);
    }

    #[test]
    fn ipr_field_update_leaves_neighbours() {
        assert_eq!(ipr_update(0xffff, 12, 3), 0x3fff);
        assert_eq!(ipr_update(0x0000, 4, 0x1f), 0x00f0);
    }

    #[test]
    fn pmcr_elapsed_time() {
        assert_eq!(pmcr_word(PMCR_ELAPSED_TIME_MODE, false), 0xc023);
        assert_eq!(pmcr_word(PMCR_ELAPSED_TIME_MODE, true), 0xc123);
    }

    #[test]
    fn tmu_counts_are_clamped() {
        assert_eq!(tmu_counts(10_000_000), 125_000);
        assert_eq!(tmu_counts(0), 1);
        assert_eq!(tmu_counts(u64::MAX), u32::MAX);
    }

    #[test]
    fn scif_baud_divisor() {
        assert_eq!(scbrr(115_200), 12);
    }
}
