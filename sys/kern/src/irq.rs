// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exception and interrupt dispatch.
//!
//! Every exception, trap and interrupt arrives at `Kernel::handle_exception`
//! with its event code (EXPEVT or INTEVT), after the entry stub has saved
//! the interrupted thread's registers into its `SavedState`. Codes are
//! multiples of 0x20, so the handler table is indexed by `code >> 5`.
//! `TRAPA` gets a second table indexed by the trap number.
//!
//! Handlers run with interrupts masked on the exception stack and return a
//! scheduling hint; the switch, if any, happens once the handler is done.

use abi::{KernError, LogLevel};

use crate::arch;
use crate::err::{KernResult, Wait};
use crate::fail;
use crate::regs;
use crate::startup::Kernel;
use crate::thread::NextThread;

/// An exception handler: gets the kernel, the event code (or trap number
/// for `TRAPA` handlers) and the word given at registration.
pub type IrqHandler = fn(&mut Kernel, u32, usize) -> NextThread;

// General exception codes (EXPEVT).
pub const EXC_DTLB_MISS_READ: u32 = 0x040;
pub const EXC_DTLB_MISS_WRITE: u32 = 0x060;
pub const EXC_INITIAL_PAGE_WRITE: u32 = 0x080;
pub const EXC_DTLB_PV_READ: u32 = 0x0a0;
pub const EXC_DTLB_PV_WRITE: u32 = 0x0c0;
pub const EXC_DATA_ADDR_READ: u32 = 0x0e0;
pub const EXC_DATA_ADDR_WRITE: u32 = 0x100;
pub const EXC_FPU: u32 = 0x120;
pub const EXC_TRAPA: u32 = 0x160;
pub const EXC_ILLEGAL_INSTR: u32 = 0x180;
pub const EXC_SLOT_ILLEGAL_INSTR: u32 = 0x1a0;
pub const EXC_USER_BREAK: u32 = 0x1e0;
pub const EXC_GENERAL_FPU: u32 = 0x800;
pub const EXC_SLOT_FPU: u32 = 0x820;

// Interrupt codes (INTEVT).
pub const EXC_IRQ_LEVEL6: u32 = 0x320;
pub const EXC_IRQ_LEVEL4: u32 = 0x360;
pub const EXC_IRQ_LEVEL2: u32 = 0x3a0;
pub const EXC_TMU0_TUNI0: u32 = 0x400;
pub const EXC_TMU1_TUNI1: u32 = 0x420;
pub const EXC_TMU2_TUNI2: u32 = 0x440;

// Trap numbers used by the arch stubs.
pub const TRAPA_YIELD: u8 = 0x20;
pub const TRAPA_EXIT: u8 = 0x21;
pub const TRAPA_SIGRETURN: u8 = 0x22;
pub const TRAPA_KCALL: u8 = 0x23;

/// A kernel operation run on behalf of the calling thread through
/// `TRAPA_KCALL`.
pub type KCall = fn(&mut Kernel, usize) -> KernResult<Wait<usize>>;

const TABLE_LEN: usize = 0x1000 >> 5;

#[derive(Copy, Clone)]
struct Entry {
    f: IrqHandler,
    data: usize,
}

pub struct Irq {
    table: [Option<Entry>; TABLE_LEN],
    trapa: [Option<Entry>; 256],
    global: Option<Entry>,
    /// Codes the kernel services itself; `set_handler` refuses them.
    reserved: [bool; TABLE_LEN],
    dispatched: u64,
}

/// Saved interrupt mask from `disable`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub struct IrqState(u32);

/// Masks interrupts and returns the previous state.
pub fn disable() -> IrqState {
    IrqState(arch::irq_disable())
}

pub fn restore(state: IrqState) {
    arch::irq_restore(state.0);
}

pub fn enable() {
    arch::irq_enable();
}

/// Runs `f` with interrupts masked.
pub fn interrupt_free<R>(f: impl FnOnce() -> R) -> R {
    let s = disable();
    let r = f();
    restore(s);
    r
}

/// Whether we are running in an interrupt or exception handler. Kernel
/// calls made by a thread do not count.
pub fn inside_int() -> bool {
    arch::in_exception() && !arch::in_kcall()
}

/// Return register encoding of a kernel call result: the value, or the
/// negated errno.
pub fn kcall_reg(r: KernResult<usize>) -> usize {
    match r {
        Ok(v) => v,
        Err(e) => e.errno().wrapping_neg() as usize,
    }
}

/// Decodes a return register written by a kernel call or a wakeup.
pub fn kcall_result(reg: usize) -> KernResult<usize> {
    let v = reg as isize;
    if (-4095..0).contains(&v) {
        return Err(KernError::from_errno(-v as i32).unwrap_or(KernError::InvalidArgument));
    }
    Ok(reg)
}

fn kcall_trap(k: &mut Kernel, _n: u32, _data: usize) -> NextThread {
    let caller = k.sched.current_id();
    let (f, arg) = {
        let s = k.sched.current_save();
        (s.arg(0), s.arg(1))
    };
    // Safety: `arch::kcall` puts a `KCall` in r4, and nothing else issues
    // this trap.
    let f = unsafe { core::mem::transmute::<usize, KCall>(f) };
    arch::kcall_enter();
    let r = f(k, arg);
    arch::kcall_leave();
    let reg = match r {
        Ok(Wait::Done(v)) => kcall_reg(Ok(v)),
        Ok(Wait::Blocked) => return NextThread::Same,
        Err(e) => kcall_reg(Err(e)),
    };
    // The caller may have exited (cancellation) while in here.
    if let Ok(t) = k.sched.get_mut(caller) {
        t.save.set_ret(reg);
    }
    NextThread::Same
}

/// Peripheral interrupt sources with a priority field in IPRA-IPRC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqSource {
    Tmu0,
    Tmu1,
    Tmu2,
    Rtc,
    Wdt,
    Ref,
    Sci1,
    Gpio,
    Dmac,
    Scif,
    Udi,
}

#[derive(Copy, Clone)]
enum Ipr {
    A,
    B,
    C,
}

impl IrqSource {
    fn field(self) -> (Ipr, u32) {
        match self {
            Self::Tmu0 => (Ipr::A, 12),
            Self::Tmu1 => (Ipr::A, 8),
            Self::Tmu2 => (Ipr::A, 4),
            Self::Rtc => (Ipr::A, 0),
            Self::Wdt => (Ipr::B, 12),
            Self::Ref => (Ipr::B, 8),
            Self::Sci1 => (Ipr::B, 4),
            Self::Gpio => (Ipr::C, 12),
            Self::Dmac => (Ipr::C, 8),
            Self::Scif => (Ipr::C, 4),
            Self::Udi => (Ipr::C, 0),
        }
    }

    fn reg(ipr: Ipr) -> &'static vcell::VolatileCell<u16> {
        let r = arch::intc_regs();
        match ipr {
            Ipr::A => &r.ipra,
            Ipr::B => &r.iprb,
            Ipr::C => &r.iprc,
        }
    }
}

fn slot(code: u32) -> KernResult<usize> {
    if code & 0x1f != 0 || code as usize >= TABLE_LEN << 5 {
        return Err(KernError::InvalidArgument);
    }
    Ok((code >> 5) as usize)
}

impl Irq {
    pub const fn new() -> Self {
        Self {
            table: [None; TABLE_LEN],
            trapa: [None; 256],
            global: None,
            reserved: [false; TABLE_LEN],
            dispatched: 0,
        }
    }

    pub fn init(&mut self) {
        *self = Self::new();
        self.trapa[usize::from(TRAPA_KCALL)] = Some(Entry {
            f: kcall_trap,
            data: 0,
        });
        let r = arch::intc_regs();
        r.ipra.set(0);
        r.iprb.set(0);
        r.iprc.set(0);
    }

    pub fn shutdown(&mut self) {
        let _ = disable();
        *self = Self::new();
    }

    /// Installs (or with `None` removes) the handler for `code`.
    pub fn set_handler(
        &mut self,
        code: u32,
        f: Option<IrqHandler>,
        data: usize,
    ) -> KernResult<()> {
        let i = slot(code)?;
        if self.reserved[i] {
            return Err(KernError::NotPermitted);
        }
        self.table[i] = f.map(|f| Entry { f, data });
        Ok(())
    }

    /// Installs a handler for a code the kernel owns.
    pub(crate) fn set_kernel_handler(&mut self, code: u32, f: IrqHandler, data: usize) {
        match slot(code) {
            Ok(i) => {
                self.table[i] = Some(Entry { f, data });
                self.reserved[i] = true;
            }
            Err(_) => fail::die("bad kernel exception code"),
        }
    }

    pub(crate) fn clear_kernel_handler(&mut self, code: u32) {
        if let Ok(i) = slot(code) {
            self.table[i] = None;
            self.reserved[i] = false;
        }
    }

    pub fn handler(&self, code: u32) -> Option<(IrqHandler, usize)> {
        let i = slot(code).ok()?;
        self.table[i].map(|e| (e.f, e.data))
    }

    /// The handler for every code without one of its own.
    pub fn set_global_handler(&mut self, f: Option<IrqHandler>, data: usize) {
        self.global = f.map(|f| Entry { f, data });
    }

    pub fn set_trapa_handler(&mut self, n: u8, f: Option<IrqHandler>, data: usize) {
        self.trapa[usize::from(n)] = f.map(|f| Entry { f, data });
    }

    pub fn set_priority(&self, src: IrqSource, level: u8) -> KernResult<()> {
        if level > 15 {
            return Err(KernError::InvalidArgument);
        }
        let (ipr, shift) = src.field();
        let r = IrqSource::reg(ipr);
        interrupt_free(|| r.set(regs::ipr_update(r.get(), shift, level)));
        Ok(())
    }

    pub fn priority(&self, src: IrqSource) -> u8 {
        let (ipr, shift) = src.field();
        ((IrqSource::reg(ipr).get() >> shift) & 0xf) as u8
    }

    /// Exceptions dispatched since boot.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }
}

impl Default for Irq {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Entry point of every exception, trap and interrupt.
    pub fn handle_exception(&mut self, code: u32) {
        arch::exception_enter();
        let hint = self.dispatch_exception(code);
        arch::exception_leave();
        self.schedule(hint);
    }

    fn dispatch_exception(&mut self, code: u32) -> NextThread {
        self.irq.dispatched += 1;
        if code == EXC_TRAPA {
            let n = (arch::ccn_regs().tra.get() >> 2) as u8;
            if let Some(e) = self.irq.trapa[usize::from(n)] {
                return (e.f)(self, u32::from(n), e.data);
            }
        } else if let Some(e) = slot(code).ok().and_then(|i| self.irq.table[i]) {
            return (e.f)(self, code, e.data);
        }
        if let Some(e) = self.irq.global {
            return (e.f)(self, code, e.data);
        }
        self.unhandled_exception(code)
    }

    fn unhandled_exception(&mut self, code: u32) -> ! {
        let s = self.sched.current_save();
        dbglog!(
            LogLevel::Critical,
            "unhandled exception {:#05x} in thread {}: pc={:#010x} pr={:#010x} sr={:#010x} tea={:#010x}",
            code,
            self.sched.current_id(),
            s.pc,
            s.pr,
            s.sr,
            arch::ccn_regs().tea.get()
        );
        for (i, pair) in s.r.chunks(4).enumerate() {
            dbglog!(
                LogLevel::Critical,
                " r{:<2} {:#010x} {:#010x} {:#010x} {:#010x}",
                i * 4,
                pair[0],
                pair[1],
                pair[2],
                pair[3]
            );
        }
        fail::die(format_args!("unhandled exception {code:#05x}"))
    }
}
