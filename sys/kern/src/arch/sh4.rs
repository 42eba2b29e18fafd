// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SH-4 support.
//!
//! # Exceptions and context switching
//!
//! The vector stubs in `sh4/entry.s` (assembled and linked with the image)
//! save the interrupted registers into the `SavedState` named by
//! `CURRENT_CONTEXT`, then call `shkern_exception` with the event code read
//! from EXPEVT (general exceptions, VBR+0x100), INTEVT (interrupts,
//! VBR+0x600) or the fixed TLB-miss code (VBR+0x400). On return they reload
//! whatever `CURRENT_CONTEXT` points at by then, so a context switch is just
//! the scheduler calling `set_current_context` before the handler returns.
//! GBR is part of the saved context and therefore reloaded on every switch.
//!
//! Everything else the kernel needs is reachable through memory-mapped
//! registers, including the UTLB arrays, so the assembly is limited to the
//! handful of instructions with no memory-mapped equivalent.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use crate::arch::SavedState;
use crate::regs::{
    self, AsicRegs, BscRegs, CcnRegs, IntcRegs, MapleRegs, PmcrRegs,
    PmctrRegs, ScifRegs, TmuRegs,
};

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

pub const UTLB_ENTRIES: usize = 64;

/// UTLB address array; entry `n` at `+ (n << 8)`.
const UTLB_ADDR_ARRAY: usize = 0xf600_0000;
/// Associative write: invalidates whichever entry matches VPN and ASID.
const UTLB_ASSOC: usize = 0x80;
const UTLB_DATA_ARRAY1: usize = 0xf700_0000;
const UTLB_ADDR_V: u32 = 1 << 8;
const UTLB_ADDR_D: u32 = 1 << 9;

/// Uncached identity window onto physical memory.
const P2_BASE: usize = 0xa000_0000;
const PHYS_MASK: usize = 0x1fff_ffff;

extern "C" {
    fn shkern_sr_imask_set(level: u32) -> u32;
    fn shkern_sleep();
    fn shkern_dcache_flush_range(start: usize, len: usize);
    fn shkern_dcache_inval_range(start: usize, len: usize);
    fn shkern_thread_trampoline();
    fn shkern_signal_trampoline();
    fn shkern_yield();
    fn shkern_kcall(f: usize, arg: usize) -> usize;
}

/// The context the exception return path reloads. Read by `entry.s`.
#[no_mangle]
static CURRENT_CONTEXT: AtomicPtr<SavedState> =
    AtomicPtr::new(core::ptr::null_mut());

static EXCEPTION_DEPTH: AtomicU32 = AtomicU32::new(0);
static IN_KCALL: AtomicBool = AtomicBool::new(false);

/// The maple transport on this backend.
pub type MapleDma = Sh4Maple;

pub fn ccn_regs() -> &'static CcnRegs {
    // Safety: fixed on-chip register window, valid for the life of the
    // system and only ever accessed through volatile cells.
    unsafe { &*(regs::CCN_BASE as *const CcnRegs) }
}

pub fn pmcr_regs() -> &'static PmcrRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::PMCR_BASE as *const PmcrRegs) }
}

pub fn pmctr_regs() -> &'static PmctrRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::PMCTR_BASE as *const PmctrRegs) }
}

pub fn bsc_regs() -> &'static BscRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::BSC_BASE as *const BscRegs) }
}

pub fn intc_regs() -> &'static IntcRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::INTC_BASE as *const IntcRegs) }
}

pub fn tmu_regs() -> &'static TmuRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::TMU_BASE as *const TmuRegs) }
}

pub fn scif_regs() -> &'static ScifRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::SCIF_BASE as *const ScifRegs) }
}

pub fn asic_regs() -> &'static AsicRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::ASIC_BASE as *const AsicRegs) }
}

pub fn maple_regs() -> &'static MapleRegs {
    // Safety: as for `ccn_regs`.
    unsafe { &*(regs::MAPLE_BASE as *const MapleRegs) }
}

pub fn maple_dma() -> MapleDma {
    Sh4Maple
}

pub fn irq_disable() -> u32 {
    // Safety: only changes SR.IMASK.
    unsafe { shkern_sr_imask_set(0xf) }
}

pub fn irq_restore(old: u32) {
    // Safety: only changes SR.IMASK.
    unsafe {
        shkern_sr_imask_set(old & 0xf);
    }
}

pub fn irq_enable() {
    // Safety: only changes SR.IMASK.
    unsafe {
        shkern_sr_imask_set(0);
    }
}

pub fn irq_level() -> u32 {
    let old = irq_disable();
    irq_restore(old);
    old
}

pub fn exception_enter() {
    EXCEPTION_DEPTH.fetch_add(1, Ordering::Relaxed);
}

pub fn exception_leave() {
    EXCEPTION_DEPTH.fetch_sub(1, Ordering::Relaxed);
}

pub fn in_exception() -> bool {
    EXCEPTION_DEPTH.load(Ordering::Relaxed) > 0
}

/// Marks the exception being handled as a kernel call made by the current
/// thread rather than an interrupt.
pub fn kcall_enter() {
    IN_KCALL.store(true, Ordering::Relaxed);
}

pub fn kcall_leave() {
    IN_KCALL.store(false, Ordering::Relaxed);
}

pub fn in_kcall() -> bool {
    IN_KCALL.load(Ordering::Relaxed)
}

/// Gives up the CPU to the next runnable thread.
pub fn thread_yield() {
    // Safety: the trap saves and restores the whole context.
    unsafe { shkern_yield() }
}

/// Runs `f(kernel, arg)` on behalf of the calling thread and returns its
/// encoded result; see `irq::kcall_result`.
pub fn kcall(f: crate::irq::KCall, arg: usize) -> usize {
    // Safety: as above; the kernel reads `f` back out of r4.
    unsafe { shkern_kcall(f as usize, arg) }
}

pub fn perf_control(n: usize, word: u16) {
    let r = pmcr_regs();
    if n == 0 {
        r.pmcr1.set(word);
    } else {
        r.pmcr2.set(word);
    }
}

pub fn perf_read(n: usize) -> u64 {
    let r = pmctr_regs();
    let (hi, lo) = if n == 0 {
        (&r.pmctr1h, &r.pmctr1l)
    } else {
        (&r.pmctr2h, &r.pmctr2l)
    };
    // The halves are not latched together; reread until the high half is
    // stable across the low read.
    loop {
        let h = hi.get();
        let l = lo.get();
        if hi.get() == h {
            return (u64::from(h & 0xffff) << 32 | u64::from(l)) & regs::PMCTR_MASK;
        }
    }
}

fn utlb_addr(n: usize) -> *mut u32 {
    (UTLB_ADDR_ARRAY | n << 8) as *mut u32
}

fn utlb_data(n: usize) -> *mut u32 {
    (UTLB_DATA_ARRAY1 | n << 8) as *mut u32
}

/// Loads a UTLB entry at the replacement counter, through the
/// memory-mapped arrays.
pub fn tlb_load(pteh: u32, ptel: u32) {
    let c = ccn_regs();
    let mmucr = c.mmucr.get();
    let urc = ((mmucr & regs::MMUCR_URC_MASK) >> regs::MMUCR_URC_SHIFT) as usize;
    let mut addr = pteh | UTLB_ADDR_V;
    if ptel & regs::PTEL_D != 0 {
        addr |= UTLB_ADDR_D;
    }
    // Safety: the UTLB arrays are on-chip and entry `urc` is in range.
    unsafe {
        core::ptr::write_volatile(utlb_data(urc), ptel);
        core::ptr::write_volatile(utlb_addr(urc), addr);
    }
    let next = ((urc + 1) % UTLB_ENTRIES) as u32;
    c.mmucr.set((mmucr & !regs::MMUCR_URC_MASK) | next << regs::MMUCR_URC_SHIFT);
}

pub fn tlb_flush_all() {
    let c = ccn_regs();
    c.mmucr.set(c.mmucr.get() | regs::MMUCR_TI);
}

pub fn tlb_flush_asid(asid: u8) {
    for n in 0..UTLB_ENTRIES {
        // Safety: in-range entries of the on-chip UTLB arrays.
        unsafe {
            let a = core::ptr::read_volatile(utlb_addr(n));
            let d = core::ptr::read_volatile(utlb_data(n));
            if a & regs::PTEH_ASID_MASK == u32::from(asid) && d & regs::PTEL_SH == 0 {
                core::ptr::write_volatile(utlb_addr(n), a & !UTLB_ADDR_V);
            }
        }
    }
}

pub fn tlb_flush_page(vaddr: u32, asid: u8) {
    let v = regs::pteh(vaddr, asid);
    // Safety: associative writes to the address array only clear V on a
    // matching entry.
    unsafe {
        core::ptr::write_volatile((UTLB_ADDR_ARRAY | UTLB_ASSOC) as *mut u32, v);
    }
}

pub fn set_asid(asid: u8) {
    let c = ccn_regs();
    c.pteh.set((c.pteh.get() & !regs::PTEH_ASID_MASK) | u32::from(asid));
}

pub fn mmu_control(mmucr: u32) {
    ccn_regs().mmucr.set(mmucr);
}

pub fn phys_read(paddr: usize, buf: &mut [u8]) {
    let src = (P2_BASE | (paddr & PHYS_MASK)) as *const u8;
    for (i, b) in buf.iter_mut().enumerate() {
        // Safety: P2 covers all of physical memory; byte reads of a
        // device window are how callers asked to see it.
        *b = unsafe { core::ptr::read_volatile(src.add(i)) };
    }
}

pub fn phys_write(paddr: usize, data: &[u8]) {
    let dst = (P2_BASE | (paddr & PHYS_MASK)) as *mut u8;
    for (i, &b) in data.iter().enumerate() {
        // Safety: as for `phys_read`.
        unsafe { core::ptr::write_volatile(dst.add(i), b) };
    }
}

pub fn asic_pending() -> u32 {
    asic_regs().ack[0].get()
}

pub fn asic_ack(bits: u32) {
    asic_regs().ack[0].set(bits);
}

pub fn asic_enable(bits: u32) {
    let r = asic_regs();
    r.irq_lvl6[0].set(r.irq_lvl6[0].get() | bits);
}

pub fn asic_disable(bits: u32) {
    let r = asic_regs();
    r.irq_lvl6[0].set(r.irq_lvl6[0].get() & !bits);
}

/// Makes `state` the context restored on exception return.
///
/// # Safety
///
/// `state` must not move or be freed while it is current.
pub unsafe fn set_current_context(state: &SavedState) {
    CURRENT_CONTEXT.store(
        state as *const SavedState as *mut SavedState,
        Ordering::Release,
    );
}

pub fn current_tls_base() -> usize {
    let p = CURRENT_CONTEXT.load(Ordering::Acquire);
    if p.is_null() {
        return 0;
    }
    // Safety: the pointer was published by `set_current_context`.
    unsafe { (*p).gbr }
}

pub fn thread_trampoline() -> usize {
    shkern_thread_trampoline as usize
}

pub fn signal_trampoline() -> usize {
    shkern_signal_trampoline as usize
}

pub fn idle_wait() {
    // Safety: `sleep` returns on the next interrupt.
    unsafe { shkern_sleep() }
}

pub fn halt() -> ! {
    let _ = irq_disable();
    loop {
        // Safety: as above; with everything masked only NMI wakes us.
        unsafe { shkern_sleep() }
    }
}

impl crate::atomic::AtomicExt for core::sync::atomic::AtomicBool {
    type Primitive = bool;
    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive {
        // SH-4 has no atomic swap; the CPU is single-core so masking
        // interrupts is enough.
        let old = irq_disable();
        let prev = self.load(ordering_for_load(ordering));
        self.store(value, ordering_for_store(ordering));
        irq_restore(old);
        prev
    }
}

fn ordering_for_load(o: Ordering) -> Ordering {
    match o {
        Ordering::Release => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Acquire,
        o => o,
    }
}

fn ordering_for_store(o: Ordering) -> Ordering {
    match o {
        Ordering::Acquire => Ordering::Relaxed,
        Ordering::AcqRel => Ordering::Release,
        o => o,
    }
}

/// Exception entry, called from `entry.s` with the event code.
#[no_mangle]
extern "C" fn shkern_exception(code: u32) {
    crate::startup::with_kernel(|k| k.handle_exception(code));
}

/// Maple DMA controller.
pub struct Sh4Maple;

impl drv_maple::MapleHw for Sh4Maple {
    fn init(&mut self) {
        let r = maple_regs();
        r.reset1.set(regs::MAPLE_RESET1_MAGIC);
        r.reset2.set(regs::MAPLE_RESET2_MAGIC);
        r.speed.set(regs::MAPLE_SPEED_2MBPS | regs::maple_speed_timeout(50000));
        r.enable.set(regs::MAPLE_ENABLE_ENABLED);
    }

    fn shutdown(&mut self) {
        let r = maple_regs();
        r.enable.set(regs::MAPLE_ENABLE_DISABLED);
    }

    fn dma_addr(&self, buf: &drv_maple::RecvBuf) -> u32 {
        (buf as *const drv_maple::RecvBuf as usize & PHYS_MASK) as u32
    }

    fn start(&mut self, list: &[u32], recv: &mut [drv_maple::RecvBuf]) {
        // Safety: cache maintenance on memory we own; the controller reads
        // the list and writes the buffers behind the cache.
        unsafe {
            shkern_dcache_flush_range(list.as_ptr() as usize, core::mem::size_of_val(list));
            shkern_dcache_inval_range(recv.as_ptr() as usize, core::mem::size_of_val(recv));
        }
        let r = maple_regs();
        r.dmaaddr.set((list.as_ptr() as usize & PHYS_MASK) as u32);
        r.state.set(regs::MAPLE_STATE_DMA);
    }

    fn finish(&mut self, recv: &mut [drv_maple::RecvBuf]) {
        // Safety: drops stale lines over the buffers the controller wrote.
        unsafe {
            shkern_dcache_inval_range(recv.as_ptr() as usize, core::mem::size_of_val(recv));
        }
    }
}
