// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CPU traps as POSIX signals.
//!
//! The trap map is fixed:
//!
//! | trap | signal |
//! |---|---|
//! | illegal instruction, illegal slot instruction, FPU disabled | `SIGILL` |
//! | FPU exception | `SIGFPE` |
//! | address error | `SIGSEGV` |
//! | TLB miss on an unmapped page, protection violation (MMU on) | `SIGSEGV` |
//! | `abort()` | `SIGABRT` |
//!
//! A handler runs on the trapping thread's own stack. Delivery pushes a
//! `SignalFrame` holding the trapping context below the thread's stack
//! pointer and redirects the thread into the handler, with the signal
//! number as its argument and the signal trampoline as its return address.
//! The trampoline traps back in with `TRAPA_SIGRETURN`, which reloads the
//! saved context. For a CPU trap that means retrying the faulting
//! instruction; handlers that want to get past it use `siglongjmp`.
//!
//! `Ignore` only applies to raised signals. A CPU trap cannot be ignored,
//! since resuming would fault again, so it gets the default action: the
//! thread is logged and killed (the kernel dies if the boot or idle thread
//! trapped).

use abi::{KernError, LogLevel, Signal, NSIG};
use num_traits::FromPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::arch::{self, SavedState, Word};
use crate::err::{KernResult, Wait};
use crate::fail;
use crate::irq;
use crate::startup::Kernel;
use crate::thread::{NextThread, ThreadFlags};
use crate::util::align_down;

pub type SigHandler = fn(i32);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SigAction {
    Default,
    Ignore,
    Handler(SigHandler),
}

/// Exit value of a thread killed by signal `n` is `SIGNAL_EXIT_BASE + n`.
pub const SIGNAL_EXIT_BASE: usize = 128;

const FRAME_MAGIC: u32 = 0x5349_4746;

#[repr(C)]
#[derive(Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SignalFrame {
    magic: u32,
    signo: i32,
    /// Kill the thread instead of resuming it when the handler returns.
    fatal: u32,
    _pad: u32,
    saved: SavedState,
}

/// The process-wide handler table.
pub struct Signals {
    table: [SigAction; NSIG],
    delivered: u32,
}

impl Signals {
    pub const fn new() -> Self {
        Self {
            table: [SigAction::Default; NSIG],
            delivered: 0,
        }
    }

    pub fn action(&self, signo: i32) -> SigAction {
        usize::try_from(signo)
            .ok()
            .and_then(|i| self.table.get(i).copied())
            .unwrap_or(SigAction::Default)
    }

    /// Signals delivered to handlers since boot.
    pub fn delivered(&self) -> u32 {
        self.delivered
    }
}

impl Default for Signals {
    fn default() -> Self {
        Self::new()
    }
}

fn valid(signo: i32) -> KernResult<usize> {
    match usize::try_from(signo) {
        Ok(i) if (1..NSIG).contains(&i) => Ok(i),
        _ => Err(KernError::InvalidArgument),
    }
}

const TRAP_MAP: [(u32, Signal); 7] = [
    (irq::EXC_ILLEGAL_INSTR, Signal::Ill),
    (irq::EXC_SLOT_ILLEGAL_INSTR, Signal::Ill),
    (irq::EXC_GENERAL_FPU, Signal::Ill),
    (irq::EXC_SLOT_FPU, Signal::Ill),
    (irq::EXC_FPU, Signal::Fpe),
    (irq::EXC_DATA_ADDR_READ, Signal::Segv),
    (irq::EXC_DATA_ADDR_WRITE, Signal::Segv),
];

fn trap_irq(k: &mut Kernel, code: u32, _: usize) -> NextThread {
    let sig = TRAP_MAP
        .iter()
        .find(|(c, _)| *c == code)
        .map_or(Signal::Segv, |&(_, s)| s);
    k.trap_signal(sig, code)
}

fn sigreturn_trap(k: &mut Kernel, _: u32, _: usize) -> NextThread {
    k.sigreturn()
}

/// A checkpoint for `siglongjmp`: the callee-saved registers and where to
/// continue.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JmpBuf {
    pc: Word,
    sp: Word,
    /// r8-r14.
    saved: [Word; 7],
    pr: Word,
    gbr: Word,
    imask: u8,
}

impl Kernel {
    pub(crate) fn signals_init(&mut self) {
        self.signals = Signals::new();
        for (code, _) in TRAP_MAP {
            self.irq.set_kernel_handler(code, trap_irq, 0);
        }
        self.irq
            .set_trapa_handler(irq::TRAPA_SIGRETURN, Some(sigreturn_trap), 0);
    }

    pub(crate) fn signals_shutdown(&mut self) {
        for (code, _) in TRAP_MAP {
            self.irq.clear_kernel_handler(code);
        }
        self.irq.set_trapa_handler(irq::TRAPA_SIGRETURN, None, 0);
        self.signals = Signals::new();
    }

    /// Installs `action` for `signo` and returns the previous one.
    pub fn signal(&mut self, signo: i32, action: SigAction) -> KernResult<SigAction> {
        let i = valid(signo)?;
        Ok(core::mem::replace(&mut self.signals.table[i], action))
    }

    /// Delivers `signo` to the current thread now. If a handler runs, the
    /// thread resumes after the `raise` once it returns.
    pub fn raise(&mut self, signo: i32) -> KernResult<()> {
        valid(signo)?;
        self.sched.current_save_mut().set_ret(0);
        let hint = match self.signals.action(signo) {
            SigAction::Ignore => NextThread::Same,
            SigAction::Default => self.kill_current(signo),
            SigAction::Handler(h) => self.push_handler(signo, h, false),
        };
        self.finish(hint);
        Ok(())
    }

    /// Raises `SIGABRT`. The thread does not come back from it: if a
    /// handler returns, the thread is killed anyway.
    pub fn abort(&mut self) {
        let signo = Signal::Abrt.number();
        let hint = match self.signals.action(signo) {
            SigAction::Handler(h) => self.push_handler(signo, h, true),
            _ => self.kill_current(signo),
        };
        self.finish(hint);
    }

    /// Reacts to a CPU trap in the current thread.
    pub(crate) fn trap_signal(&mut self, sig: Signal, code: u32) -> NextThread {
        let t = self.sched.current();
        dbglog!(
            LogLevel::Debug,
            "thread {}: exception {:#05x} at {:#010x}, {}",
            t.id(),
            code,
            t.save.pc,
            sig.name()
        );
        match self.signals.action(sig.number()) {
            SigAction::Handler(h) => self.push_handler(sig.number(), h, false),
            _ => self.kill_current(sig.number()),
        }
    }

    fn kill_current(&mut self, signo: i32) -> NextThread {
        let t = self.sched.current();
        let name = <Signal as FromPrimitive>::from_i32(signo).map_or("signal", Signal::name);
        if t.flags().intersects(ThreadFlags::BOOT | ThreadFlags::IDLE) {
            fail::die(format_args!(
                "{} {} in thread {} at {:#010x}",
                name,
                signo,
                t.label(),
                t.save.pc
            ));
        }
        dbglog!(
            LogLevel::Critical,
            "thread {} '{}' killed by {} {} at {:#010x}",
            t.id(),
            t.label(),
            name,
            signo,
            t.save.pc
        );
        let idx = self.sched.current_index();
        self.exit_thread(idx, SIGNAL_EXIT_BASE + signo as usize);
        NextThread::Other
    }

    /// Diverts the current thread into `h`, keeping its context in a frame
    /// on its stack.
    fn push_handler(&mut self, signo: i32, h: SigHandler, fatal: bool) -> NextThread {
        let t = self.sched.current();
        let size = core::mem::size_of::<SignalFrame>();
        let sp = t.save.sp();
        let (base, len) = t.stack();
        let room = if len == 0 { sp } else { sp.saturating_sub(base) };
        if room < size + 8 {
            fail::die(format_args!("no stack for a signal frame in thread {}", t.id()));
        }
        let at = align_down(sp - size, 8);
        let frame = SignalFrame {
            magic: FRAME_MAGIC,
            signo,
            fatal: u32::from(fatal),
            _pad: 0,
            saved: t.save.clone(),
        };
        // Safety: `at` lies within the thread's own stack, below its live
        // data, and the thread is not running while we are in here.
        let dst = unsafe { core::slice::from_raw_parts_mut(at as *mut u8, size) };
        dst.copy_from_slice(frame.as_bytes());

        let s = self.sched.current_save_mut();
        s.pc = h as usize;
        s.pr = arch::signal_trampoline();
        s.set_arg(0, signo as Word);
        s.set_sp(at);
        self.signals.delivered = self.signals.delivered.wrapping_add(1);
        NextThread::Same
    }

    /// Back from a handler: reloads the context saved in its frame.
    fn sigreturn(&mut self) -> NextThread {
        let t = self.sched.current();
        let sp = t.save.sp();
        let (base, len) = t.stack();
        let size = core::mem::size_of::<SignalFrame>();
        let in_stack = if len == 0 {
            sp != 0
        } else {
            sp >= base && sp + size <= base + len
        };
        if !in_stack {
            fail::die(format_args!("sigreturn with a wild stack in thread {}", t.id()));
        }
        // Safety: checked to lie within the thread's stack above.
        let src = unsafe { core::slice::from_raw_parts(sp as *const u8, size) };
        let frame = match SignalFrame::read_from_bytes(src) {
            Ok(f) if f.magic == FRAME_MAGIC => f,
            _ => fail::die(format_args!("corrupt signal frame in thread {}", t.id())),
        };
        if frame.fatal != 0 {
            return self.kill_current(frame.signo);
        }
        *self.sched.current_save_mut() = frame.saved;
        NextThread::Same
    }

    /// Records where `siglongjmp(env, ..)` should continue: right after this
    /// call, in the current thread. Returns 0.
    pub fn sigsetjmp(&self, env: &mut JmpBuf) -> usize {
        let s = self.sched.current_save();
        let mut saved = [0; 7];
        saved.copy_from_slice(&s.r[8..15]);
        *env = JmpBuf {
            pc: s.pc,
            sp: s.sp(),
            saved,
            pr: s.pr,
            gbr: s.gbr,
            imask: s.imask(),
        };
        0
    }

    /// Continues the current thread at `env`'s checkpoint, where the
    /// `sigsetjmp` appears to return `val` (1 if `val` is 0). Frames of
    /// handlers running above the checkpoint are abandoned.
    pub fn siglongjmp(&mut self, env: &JmpBuf, val: usize) -> usize {
        let val = if val == 0 { 1 } else { val };
        let s = self.sched.current_save_mut();
        s.pc = env.pc;
        s.set_sp(env.sp);
        s.r[8..15].copy_from_slice(&env.saved);
        s.pr = env.pr;
        s.gbr = env.gbr;
        s.set_imask(env.imask);
        s.set_ret(val);
        val
    }
}

/// `siglongjmp` as a kernel call, with the argument pointing at a
/// `(JmpBuf, usize)` pair.
pub fn kcall_siglongjmp(k: &mut Kernel, arg: usize) -> KernResult<Wait<usize>> {
    if arg == 0 {
        return Err(KernError::InvalidArgument);
    }
    // Safety: the calling thread passes a pointer to a live pair on its
    // own stack.
    let (env, val) = unsafe { &*(arg as *const (JmpBuf, usize)) };
    Ok(Wait::Done(k.siglongjmp(env, *val)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use core::sync::atomic::{AtomicI32, Ordering};

    const CHECKPOINT: Word = 0x8c01_0000;
    const FAULTING: Word = 0x8c01_0100;

    static CAUGHT: AtomicI32 = AtomicI32::new(0);

    fn on_fpe(signo: i32) {
        CAUGHT.store(signo, Ordering::SeqCst);
    }

    fn noop(_: i32) {}

    /// A thread of its own, so there is a real stack to push frames on.
    fn worker(k: &mut Kernel) -> abi::ThreadId {
        let w = testutil::spawn(k, "w");
        testutil::run(k, w);
        w
    }

    #[test]
    fn signal_returns_the_previous_action() {
        let mut k = testutil::boot();
        assert_eq!(k.signal(8, SigAction::Ignore), Ok(SigAction::Default));
        assert_eq!(k.signal(8, SigAction::Handler(noop)), Ok(SigAction::Ignore));
        assert_eq!(k.signal(0, SigAction::Ignore), Err(KernError::InvalidArgument));
        assert_eq!(k.signal(NSIG as i32, SigAction::Ignore), Err(KernError::InvalidArgument));
    }

    /// A handler catches a divide-by-zero trap and jumps back to a
    /// checkpoint taken before it.
    #[test]
    fn trap_handler_with_nonlocal_return() {
        let mut k = testutil::boot();
        let w = worker(&mut k);
        k.signal(Signal::Fpe.number(), SigAction::Handler(on_fpe)).unwrap();

        k.sched.current_save_mut().pc = CHECKPOINT;
        k.sched.current_save_mut().r[8] = 0x88;
        let mut env = JmpBuf::default();
        assert_eq!(k.sigsetjmp(&mut env), 0);
        let sp = k.sched.current_save().sp();

        // Carry on, then fault.
        k.sched.current_save_mut().pc = FAULTING;
        k.sched.current_save_mut().r[8] = 0x99;
        k.handle_exception(irq::EXC_FPU);
        assert_eq!(k.current(), w);
        let s = k.sched.current_save();
        assert_eq!(s.pc, on_fpe as usize);
        assert_eq!(s.arg(0), 8);
        assert_eq!(s.pr, arch::signal_trampoline());
        assert!(s.sp() < sp);

        // The handler body.
        on_fpe(s.arg(0) as i32);
        assert_eq!(k.siglongjmp(&env, 0), 1);

        assert_eq!(CAUGHT.load(Ordering::SeqCst), 8);
        let s = k.sched.current_save();
        assert_eq!(s.pc, CHECKPOINT);
        assert_eq!(s.sp(), sp);
        assert_eq!(s.r[8], 0x88);
        assert_eq!(s.ret(), 1);
        assert_eq!(k.signals.delivered(), 1);
    }

    #[test]
    fn siglongjmp_as_a_kernel_call() {
        let mut k = testutil::boot();
        worker(&mut k);
        k.sched.current_save_mut().pc = CHECKPOINT;
        let mut env = JmpBuf::default();
        k.sigsetjmp(&mut env);
        k.sched.current_save_mut().pc = FAULTING;
        let pair = (env, 7usize);
        let r = kcall_siglongjmp(&mut k, &pair as *const _ as usize);
        assert_eq!(r, Ok(Wait::Done(7)));
        assert_eq!(k.sched.current_save().pc, CHECKPOINT);
        assert_eq!(kcall_siglongjmp(&mut k, 0), Err(KernError::InvalidArgument));
    }

    #[test]
    fn handler_return_resumes_the_trapping_context() {
        let mut k = testutil::boot();
        worker(&mut k);
        k.signal(Signal::Segv.number(), SigAction::Handler(noop)).unwrap();
        k.sched.current_save_mut().pc = FAULTING;
        k.sched.current_save_mut().r[3] = 33;
        let before = k.sched.current_save().clone();

        k.handle_exception(irq::EXC_DATA_ADDR_WRITE);
        assert_eq!(k.sched.current_save().pc, noop as usize);
        k.sched.current_save_mut().r[3] = 0;

        arch::set_trapa(irq::TRAPA_SIGRETURN);
        k.handle_exception(irq::EXC_TRAPA);
        assert_eq!(*k.sched.current_save(), before);
    }

    #[test]
    fn default_action_kills_the_thread() {
        let mut k = testutil::boot();
        let main = k.current();
        let w = testutil::spawn(&mut k, "w");
        assert_eq!(k.thread_join(w), Ok(Wait::Blocked));
        assert_eq!(k.current(), w);
        k.handle_exception(irq::EXC_ILLEGAL_INSTR);
        assert_eq!(k.current(), main);
        assert_eq!(
            k.take_wake(),
            Some(crate::err::WakeResult::Ready(SIGNAL_EXIT_BASE + 4))
        );
    }

    #[test]
    fn traps_cannot_be_ignored() {
        let mut k = testutil::boot();
        let w = worker(&mut k);
        k.signal(Signal::Segv.number(), SigAction::Ignore).unwrap();
        k.handle_exception(irq::EXC_DATA_ADDR_READ);
        assert_eq!(k.thread_state(w), Ok(crate::thread::ThreadState::Zombie));
    }

    #[test]
    #[should_panic(expected = "CPU halted")]
    fn a_trap_in_the_boot_thread_is_fatal() {
        let mut k = testutil::boot();
        k.handle_exception(irq::EXC_SLOT_ILLEGAL_INSTR);
    }

    #[test]
    fn raise_runs_the_handler_then_returns() {
        let mut k = testutil::boot();
        worker(&mut k);
        k.signal(10, SigAction::Handler(noop)).unwrap();
        k.sched.current_save_mut().pc = CHECKPOINT;
        k.raise(10).unwrap();
        assert_eq!(k.sched.current_save().pc, noop as usize);
        arch::set_trapa(irq::TRAPA_SIGRETURN);
        k.handle_exception(irq::EXC_TRAPA);
        assert_eq!(k.sched.current_save().pc, CHECKPOINT);
        assert_eq!(k.sched.current_save().ret(), 0);

        k.signal(10, SigAction::Ignore).unwrap();
        k.raise(10).unwrap();
        assert_eq!(k.sched.current_save().pc, CHECKPOINT);
        assert_eq!(k.raise(40), Err(KernError::InvalidArgument));
    }

    #[test]
    fn abort_kills_even_if_the_handler_returns() {
        let mut k = testutil::boot();
        let main = k.current();
        let w = worker(&mut k);
        k.signal(Signal::Abrt.number(), SigAction::Handler(noop)).unwrap();
        k.abort();
        assert_eq!(k.current(), w);
        arch::set_trapa(irq::TRAPA_SIGRETURN);
        k.handle_exception(irq::EXC_TRAPA);
        assert_eq!(k.current(), main);
        assert_eq!(k.thread_state(w), Ok(crate::thread::ThreadState::Zombie));
    }
}
