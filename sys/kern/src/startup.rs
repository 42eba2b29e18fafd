// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup and shutdown.
//!
//! All kernel state hangs off one `Kernel`. Subsystems come up in a fixed
//! order, leaves first, and go down in the reverse order:
//!
//! 1. debug I/O (so everything after it can log)
//! 2. interrupt table
//! 3. program break
//! 4. clock
//! 5. scheduler (boot and idle threads)
//! 6. interval timer
//! 7. signals
//! 8. maple bus, if any peripheral was asked for
//! 9. interrupts on, if asked for
//!
//! Address translation is not part of this sequence. Programs that want
//! page tables call `mmu_init` themselves.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::{InitFlags, LogLevel};

use crate::arch;
use crate::atomic::AtomicExt;
use crate::brk::Brk;
use crate::clock::Clock;
use crate::dbgio::{self, DBGIO};
use crate::err::{KernResult, Wait};
use crate::fail;
use crate::irq::{self, Irq};
use crate::kconfig::{DEFAULT_HZ, KERNEL_STACK_RESERVE};
use crate::maple::MapleState;
use crate::mmu::Mmu;
use crate::signal::Signals;
use crate::thread::{Scheduler, ThreadEntry};
use crate::timer::Timer;
use crate::tls::TlsTemplate;

/// What the boot code knows about the loaded image.
#[derive(Copy, Clone, Debug)]
pub struct BootInfo {
    /// First byte past the image; the program break starts here.
    pub image_end: usize,
    /// First byte past RAM.
    pub ram_top: usize,
    /// The image's thread-local storage template.
    pub tls: TlsTemplate,
}

/// The kernel root.
pub struct Kernel {
    pub(crate) flags: InitFlags,
    pub irq: Irq,
    pub brk: Brk,
    pub mmu: Mmu,
    pub clock: Clock,
    pub timer: Timer,
    pub sched: Scheduler,
    pub signals: Signals,
    pub maple: MapleState,
    up: bool,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            flags: InitFlags::empty(),
            irq: Irq::new(),
            brk: Brk::new(),
            mmu: Mmu::new(),
            clock: Clock::new(),
            timer: Timer::new(),
            sched: Scheduler::new(),
            signals: Signals::new(),
            maple: MapleState::new(),
            up: false,
        }
    }

    pub fn flags(&self) -> InitFlags {
        self.flags
    }

    /// Brings the kernel up. On return the caller is the boot thread.
    pub fn init(&mut self, flags: InitFlags, boot: &BootInfo) -> KernResult<()> {
        if self.up {
            fail::die("kernel initialized twice");
        }
        self.flags = flags;

        #[cfg(feature = "dbgio-scif")]
        DBGIO.register(&dbgio::SCIF).ok();
        DBGIO.register(&dbgio::RING).ok();
        DBGIO.init()?;
        if flags.contains(InitFlags::QUIET) {
            DBGIO.disable();
        }

        self.irq.init();

        let brk_max = boot
            .ram_top
            .checked_sub(KERNEL_STACK_RESERVE)
            .filter(|&m| m >= boot.image_end)
            .unwrap_or_else(|| fail::die("no RAM left for the program break"));
        // Safety: the boot code vouches for everything between the end of
        // the image and the kernel stack reserve.
        unsafe { self.brk.init(boot.image_end, brk_max) };

        self.clock.init();

        let hz = if flags.contains(InitFlags::THD_PREEMPT) {
            DEFAULT_HZ
        } else {
            0
        };
        self.sched_init(boot.tls, hz != 0)?;
        self.timer_init(hz)?;
        self.signals_init();
        if flags.intersects(crate::maple::PERIPHERALS) {
            self.maple_init()?;
        }

        self.up = true;
        dbglog!(LogLevel::Info, "kernel up, flags {:#010x}", flags.bits());
        if flags.contains(InitFlags::IRQ) {
            irq::enable();
        }
        Ok(())
    }

    /// Takes everything down in reverse order. The caller stays the only
    /// thread.
    pub fn shutdown(&mut self) {
        if !self.up {
            return;
        }
        let _ = irq::disable();
        dbglog!(LogLevel::Info, "kernel shutting down");
        self.maple_shutdown();
        self.signals_shutdown();
        self.timer_shutdown();
        self.sched_shutdown();
        self.mmu_shutdown();
        self.clock.shutdown();
        self.brk = Brk::new();
        self.irq.shutdown();
        DBGIO.shutdown();
        self.up = false;
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks when a mutable reference to the kernel is floating around, to
/// prevent production of a second one.
///
/// Notice that this begins life initialized to `true`. This prevents use of
/// `with_kernel` before the kernel is properly started. We set it to `false`
/// late in `start_kernel`.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

static mut KERNEL: Kernel = Kernel::new();

/// Runs `body` with the kernel. Exception entry is the only caller; a
/// nested call means an exception was taken with the kernel mid-update.
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    if KERNEL_IN_USE.swap_polyfill(true, Ordering::Acquire) {
        fail::die("recursive use of the kernel");
    }
    // Safety: the flag above makes this the only reference.
    let r = body(unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) });
    KERNEL_IN_USE.store(false, Ordering::Release);
    r
}

fn kcall_shutdown(k: &mut Kernel, _: usize) -> KernResult<Wait<usize>> {
    k.shutdown();
    Ok(Wait::Done(0))
}

/// The main kernel entry point.
///
/// Brings the kernel up with `flags`, runs `main` as the boot thread, then
/// shuts down and halts with `main`'s return value in the epitaph.
///
/// # Safety
///
/// Must be called once, from the boot path, in privileged mode with the
/// stack inside the reserve below `ram_top`.
pub unsafe fn start_kernel(flags: InitFlags, boot: &BootInfo, main: ThreadEntry) -> ! {
    // Safety: nothing else has touched the kernel yet; `KERNEL_IN_USE` is
    // still set, so exception entry cannot either.
    let k = unsafe { &mut *core::ptr::addr_of_mut!(KERNEL) };
    if let Err(e) = k.init(flags, boot) {
        fail::die(format_args!("kernel init failed: {e}"));
    }
    KERNEL_IN_USE.store(false, Ordering::Release);

    let status = main(0);

    arch::kcall(kcall_shutdown, 0);
    fail::die(format_args!("main returned {status:#x}"))
}
