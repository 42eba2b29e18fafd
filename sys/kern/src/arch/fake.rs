// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated machine for running the kernel on a host.
//!
//! Each host thread gets its own machine: register blocks, a CPU cycle
//! counter that moves forward on every performance-counter read, the
//! interrupt mask, a 64-entry UTLB, sparse physical memory and the Holly
//! event latch. Tests drive it through the helpers at the bottom of this
//! file, standing in for the hardware that would otherwise raise
//! exceptions.

use core::mem::MaybeUninit;
use core::sync::atomic::Ordering;
use std::boxed::Box;
use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::arch::SavedState;
use crate::regs::{
    self, AsicRegs, BscRegs, CcnRegs, IntcRegs, MapleRegs, PmcrRegs,
    PmctrRegs, PtelBits, ScifRegs, TmuRegs,
};

macro_rules! uassert {
    ($cond:expr) => {
        assert!($cond)
    };
}

/// The maple transport on this backend.
pub type MapleDma = drv_maple::sim::SimBus;

pub const UTLB_ENTRIES: usize = 64;
const PAGE: usize = 4096;
/// A performance counter read costs this many CPU cycles unless a test
/// says otherwise.
const DEFAULT_CYCLES_PER_READ: u64 = 20;
/// Nanoseconds per CPU cycle at 200 MHz.
const NS_PER_CYCLE: u64 = 5;
/// Counts per CPU cycle in bus-ratio mode.
const RATIO_COUNTS_PER_CYCLE: u64 = 12;

/// Fake addresses for the code the arch layer provides on the target.
const THREAD_TRAMPOLINE: usize = 0x8c00_0100;
const SIGNAL_TRAMPOLINE: usize = 0x8c00_0200;

#[repr(C)]
struct FakeRegs {
    ccn: CcnRegs,
    pmcr: PmcrRegs,
    pmctr: PmctrRegs,
    bsc: BscRegs,
    intc: IntcRegs,
    tmu: TmuRegs,
    scif: ScifRegs,
    asic: AsicRegs,
    maple: MapleRegs,
}

#[derive(Copy, Clone, Debug, Default)]
struct Counter {
    running: bool,
    ratio: bool,
    base: u64,
    acc: u64,
}

impl Counter {
    fn control(&mut self, word: u16, now: u64) {
        if word & regs::PMCR_CLR != 0 {
            self.acc = 0;
            self.base = now;
        }
        let run = word & regs::PMCR_RUN == regs::PMCR_RUN;
        if run && !self.running {
            self.base = now;
        } else if !run && self.running {
            self.acc += now - self.base;
        }
        self.running = run;
        self.ratio = word & regs::PMCR_CLOCK_TYPE != 0;
    }

    fn value(&self, now: u64) -> u64 {
        let cycles = self.acc + if self.running { now - self.base } else { 0 };
        let counts = if self.ratio {
            cycles.wrapping_mul(RATIO_COUNTS_PER_CYCLE)
        } else {
            cycles
        };
        counts & regs::PMCTR_MASK
    }
}

#[derive(Copy, Clone, Debug)]
struct TlbEntry {
    vpn: u32,
    asid: u8,
    ppn: u32,
    bits: PtelBits,
}

/// Why a simulated access did not translate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TlbFault {
    Miss,
    Protection,
    InitialWrite,
}

struct Machine {
    cycles: u64,
    cycles_per_read: u64,
    counters: [Counter; 2],
    imask: u8,
    exception_depth: u32,
    in_kcall: bool,
    utlb: [Option<TlbEntry>; UTLB_ENTRIES],
    urc: usize,
    mem: BTreeMap<usize, Box<[u8; PAGE]>>,
    asic_pending: u32,
    asic_enabled: u32,
    current_gbr: usize,
    current_sp: usize,
    switches: u64,
}

impl Machine {
    fn new() -> Self {
        Self {
            cycles: 0,
            cycles_per_read: DEFAULT_CYCLES_PER_READ,
            counters: [Counter::default(); 2],
            // Reset state: everything masked.
            imask: 0xf,
            exception_depth: 0,
            in_kcall: false,
            utlb: [None; UTLB_ENTRIES],
            urc: 0,
            mem: BTreeMap::new(),
            asic_pending: 0,
            asic_enabled: 0,
            current_gbr: 0,
            current_sp: 0,
            switches: 0,
        }
    }
}

fn leak_regs() -> &'static FakeRegs {
    let b: Box<MaybeUninit<FakeRegs>> = Box::new(MaybeUninit::zeroed());
    // Safety: every field of every block is an integer or a VolatileCell of
    // one, for which all-zero bytes are a valid value.
    let r: &'static FakeRegs = unsafe { Box::leak(b).assume_init_ref() };
    // The transmit FIFO of the simulated serial port is always empty.
    r.scif.scfsr2.set(regs::SCFSR2_TDFE | regs::SCFSR2_TEND);
    r
}

std::thread_local! {
    static REGS: &'static FakeRegs = leak_regs();
    static MACHINE: RefCell<Machine> = RefCell::new(Machine::new());
}

fn regs() -> &'static FakeRegs {
    REGS.with(|r| *r)
}

fn with_machine<R>(f: impl FnOnce(&mut Machine) -> R) -> R {
    MACHINE.with(|m| f(&mut m.borrow_mut()))
}

pub fn ccn_regs() -> &'static CcnRegs {
    &regs().ccn
}

pub fn pmcr_regs() -> &'static PmcrRegs {
    &regs().pmcr
}

pub fn pmctr_regs() -> &'static PmctrRegs {
    &regs().pmctr
}

pub fn bsc_regs() -> &'static BscRegs {
    &regs().bsc
}

pub fn intc_regs() -> &'static IntcRegs {
    &regs().intc
}

pub fn tmu_regs() -> &'static TmuRegs {
    &regs().tmu
}

pub fn scif_regs() -> &'static ScifRegs {
    &regs().scif
}

pub fn asic_regs() -> &'static AsicRegs {
    &regs().asic
}

pub fn maple_regs() -> &'static MapleRegs {
    &regs().maple
}

pub fn maple_dma() -> MapleDma {
    drv_maple::sim::SimBus::new()
}

/// Masks all interrupts, returning the previous level.
pub fn irq_disable() -> u32 {
    with_machine(|m| u32::from(core::mem::replace(&mut m.imask, 0xf)))
}

pub fn irq_restore(old: u32) {
    with_machine(|m| m.imask = (old & 0xf) as u8);
}

pub fn irq_enable() {
    with_machine(|m| m.imask = 0);
}

pub fn irq_level() -> u32 {
    with_machine(|m| u32::from(m.imask))
}

pub fn exception_enter() {
    with_machine(|m| m.exception_depth += 1);
}

pub fn exception_leave() {
    with_machine(|m| m.exception_depth -= 1);
}

pub fn in_exception() -> bool {
    with_machine(|m| m.exception_depth > 0)
}

pub fn kcall_enter() {
    with_machine(|m| m.in_kcall = true);
}

pub fn kcall_leave() {
    with_machine(|m| m.in_kcall = false);
}

pub fn in_kcall() -> bool {
    with_machine(|m| m.in_kcall)
}

/// Threads never run on this backend; tests call `Kernel::yield_now`.
pub fn thread_yield() {}

/// Writes control word `word` to performance counter `n` (0 or 1).
pub fn perf_control(n: usize, word: u16) {
    let r = pmcr_regs();
    if n == 0 {
        r.pmcr1.set(word & !regs::PMCR_CLR);
    } else {
        r.pmcr2.set(word & !regs::PMCR_CLR);
    }
    with_machine(|m| {
        let now = m.cycles;
        m.counters[n].control(word, now);
    });
}

/// Reads the 48-bit value of performance counter `n`.
pub fn perf_read(n: usize) -> u64 {
    with_machine(|m| {
        m.cycles += m.cycles_per_read;
        m.counters[n].value(m.cycles)
    })
}

/// Loads a UTLB entry at the replacement counter.
pub fn tlb_load(pteh: u32, ptel: u32) {
    let c = ccn_regs();
    c.pteh.set(pteh);
    c.ptel.set(ptel);
    with_machine(|m| {
        let i = m.urc;
        m.utlb[i] = Some(TlbEntry {
            vpn: pteh & regs::PTEH_VPN_MASK & !0xfff,
            asid: (pteh & regs::PTEH_ASID_MASK) as u8,
            ppn: ptel & regs::PTEL_PPN_MASK,
            bits: regs::ptel_bits(ptel),
        });
        m.urc = (i + 1) % UTLB_ENTRIES;
    });
}

pub fn tlb_flush_all() {
    with_machine(|m| m.utlb = [None; UTLB_ENTRIES]);
}

/// Invalidates the non-shared entries tagged with `asid`.
pub fn tlb_flush_asid(asid: u8) {
    with_machine(|m| {
        for e in m.utlb.iter_mut() {
            if e.is_some_and(|t| t.asid == asid && !t.bits.shared) {
                *e = None;
            }
        }
    });
}

/// Invalidates the entry translating `vaddr` in `asid`, if any.
pub fn tlb_flush_page(vaddr: u32, asid: u8) {
    let vpn = vaddr & !0xfff;
    with_machine(|m| {
        for e in m.utlb.iter_mut() {
            if e.is_some_and(|t| t.vpn == vpn && (t.asid == asid || t.bits.shared)) {
                *e = None;
            }
        }
    });
}

pub fn set_asid(asid: u8) {
    let c = ccn_regs();
    c.pteh.set((c.pteh.get() & !regs::PTEH_ASID_MASK) | u32::from(asid));
}

pub fn mmu_control(mmucr: u32) {
    ccn_regs().mmucr.set(mmucr & !regs::MMUCR_TI);
    if mmucr & regs::MMUCR_TI != 0 {
        tlb_flush_all();
    }
}

/// Reads `buf.len()` bytes of physical memory at `paddr`.
pub fn phys_read(paddr: usize, buf: &mut [u8]) {
    with_machine(|m| {
        let mut at = paddr;
        for chunk in buf.chunks_mut(PAGE) {
            let mut done = 0;
            while done < chunk.len() {
                let off = at % PAGE;
                let n = (PAGE - off).min(chunk.len() - done);
                match m.mem.get(&(at - off)) {
                    Some(p) => chunk[done..done + n].copy_from_slice(&p[off..off + n]),
                    None => chunk[done..done + n].fill(0),
                }
                done += n;
                at += n;
            }
        }
    });
}

pub fn phys_write(paddr: usize, data: &[u8]) {
    with_machine(|m| {
        let mut at = paddr;
        let mut done = 0;
        while done < data.len() {
            let off = at % PAGE;
            let n = (PAGE - off).min(data.len() - done);
            let page = m
                .mem
                .entry(at - off)
                .or_insert_with(|| Box::new([0; PAGE]));
            page[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
            at += n;
        }
    });
}

pub fn asic_pending() -> u32 {
    with_machine(|m| m.asic_pending)
}

pub fn asic_ack(bits: u32) {
    with_machine(|m| m.asic_pending &= !bits);
}

pub fn asic_enable(bits: u32) {
    asic_regs().irq_lvl6[0].set(asic_regs().irq_lvl6[0].get() | bits);
    with_machine(|m| m.asic_enabled |= bits);
}

pub fn asic_disable(bits: u32) {
    asic_regs().irq_lvl6[0].set(asic_regs().irq_lvl6[0].get() & !bits);
    with_machine(|m| m.asic_enabled &= !bits);
}

/// Makes `state` the context restored on exception return.
///
/// # Safety
///
/// On the target `state` must stay put until the next call; here the
/// pointer is not kept.
pub unsafe fn set_current_context(state: &SavedState) {
    with_machine(|m| {
        m.current_gbr = state.gbr;
        m.current_sp = state.sp();
        m.switches += 1;
    });
}

/// The thread pointer register as the running code sees it.
pub fn current_tls_base() -> usize {
    with_machine(|m| m.current_gbr)
}

pub fn thread_trampoline() -> usize {
    THREAD_TRAMPOLINE
}

pub fn signal_trampoline() -> usize {
    SIGNAL_TRAMPOLINE
}

/// Issues a kernel call the way the `TRAPA` stub would: arguments in r4
/// and r5 of the current thread, result from r0.
pub fn kcall(f: crate::irq::KCall, arg: usize) -> usize {
    crate::startup::with_kernel(|k| {
        let s = k.sched.current_save_mut();
        s.set_arg(0, f as usize);
        s.set_arg(1, arg);
        set_trapa(crate::irq::TRAPA_KCALL);
        k.handle_exception(crate::irq::EXC_TRAPA);
        k.sched.current_save().ret()
    })
}

/// Waits for an interrupt.
pub fn idle_wait() {}

pub fn halt() -> ! {
    panic!("CPU halted");
}

impl crate::atomic::AtomicExt for core::sync::atomic::AtomicBool {
    type Primitive = bool;
    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive {
        self.swap(value, ordering)
    }
}

// Test controls for the simulated hardware.

/// Moves simulated time forward.
pub fn advance_ns(ns: u64) {
    with_machine(|m| m.cycles += ns.div_ceil(NS_PER_CYCLE));
}

/// Sets how far the clock moves per performance-counter read.
pub fn set_cycles_per_read(cycles: u64) {
    with_machine(|m| m.cycles_per_read = cycles);
}

/// Forces counter `n` to read `value` (before the cost of the read).
pub fn preset_counter(n: usize, value: u64) {
    with_machine(|m| {
        let c = &mut m.counters[n];
        c.acc = value;
        c.base = m.cycles;
    });
}

/// Latches Holly events.
pub fn raise_asic(bits: u32) {
    with_machine(|m| m.asic_pending |= bits);
}

pub fn asic_enabled() -> u32 {
    with_machine(|m| m.asic_enabled)
}

pub fn set_fault_address(vaddr: usize) {
    ccn_regs().tea.set(vaddr as u32);
}

pub fn set_trapa(n: u8) {
    ccn_regs().tra.set(u32::from(n) << 2);
}

/// Context switches performed so far.
pub fn switch_count() -> u64 {
    with_machine(|m| m.switches)
}

pub fn current_sp() -> usize {
    with_machine(|m| m.current_sp)
}

pub fn utlb_valid_entries() -> usize {
    with_machine(|m| m.utlb.iter().filter(|e| e.is_some()).count())
}

/// Translates `vaddr` through the UTLB the way a data access would.
pub fn utlb_translate(vaddr: usize, write: bool) -> Result<usize, TlbFault> {
    let asid = (ccn_regs().pteh.get() & regs::PTEH_ASID_MASK) as u8;
    let vpn = vaddr as u32 & !0xfff;
    let e = with_machine(|m| {
        m.utlb
            .iter()
            .flatten()
            .find(|t| t.vpn == vpn && (t.bits.shared || t.asid == asid))
            .copied()
    })
    .ok_or(TlbFault::Miss)?;
    if write {
        if e.bits.pr == regs::PR_PRIV_RO || e.bits.pr == regs::PR_ALL_RO {
            return Err(TlbFault::Protection);
        }
        if !e.bits.dirty {
            return Err(TlbFault::InitialWrite);
        }
    }
    Ok(e.ppn as usize | (vaddr & 0xfff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_runs_only_when_started() {
        assert_eq!(perf_read(1), 0);
        perf_control(1, regs::pmcr_word(regs::PMCR_ELAPSED_TIME_MODE, false));
        let a = perf_read(1);
        let b = perf_read(1);
        assert_eq!(b - a, DEFAULT_CYCLES_PER_READ);
        perf_control(1, 0);
        assert_eq!(perf_read(1), perf_read(1));
    }

    #[test]
    fn physical_memory_spans_pages() {
        let data: std::vec::Vec<u8> = (0..6000u32).map(|i| i as u8).collect();
        phys_write(0x0c00_0ff0, &data);
        let mut back = std::vec![0u8; 6000];
        phys_read(0x0c00_0ff0, &mut back);
        assert_eq!(back, data);
        let mut untouched = [0xffu8; 4];
        phys_read(0x0d00_0000, &mut untouched);
        assert_eq!(untouched, [0; 4]);
    }

    #[test]
    fn utlb_honours_asid_and_protection() {
        set_asid(3);
        let ro = PtelBits {
            pr: regs::PR_ALL_RO,
            cacheable: true,
            ..PtelBits::default()
        };
        tlb_load(regs::pteh(0x0040_0000, 3), regs::ptel(0x0c10_0000, ro));
        assert_eq!(utlb_translate(0x0040_0123, false), Ok(0x0c10_0123));
        assert_eq!(utlb_translate(0x0040_0123, true), Err(TlbFault::Protection));
        set_asid(4);
        assert_eq!(utlb_translate(0x0040_0123, false), Err(TlbFault::Miss));
        set_asid(3);
        tlb_flush_asid(3);
        assert_eq!(utlb_translate(0x0040_0123, false), Err(TlbFault::Miss));
    }
}
