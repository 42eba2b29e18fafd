// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel for the SH-4 based console.
//!
//! This is the single-address-space core the rest of the system builds on:
//! preemptive threads with thread-local storage and the usual sync
//! primitives, interrupt dispatch, MMU page tables, the program break,
//! performance-counter time with interval timers and sleeps, CPU traps as
//! POSIX signals, the debug I/O plane, and the glue that runs the maple
//! peripheral bus (the bus logic itself lives in `drv-maple`).
//!
//! # Design principles
//!
//! 1. Static configuration. Table sizes are fixed when the kernel is built
//!    (see `build.rs`); nothing in here allocates except the program break
//!    and the per-thread stacks carved from it.
//! 2. One root. All kernel state lives in [`startup::Kernel`], which is
//!    initialized and shut down in a fixed order. The debug log is the one
//!    exception, so that anything can log.
//! 3. Operations that may suspend the caller return [`err::Wait`] and leave
//!    the actual switch to the scheduler, which makes the whole state machine
//!    drivable from host tests through the `fake` arch backend.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    ones; the tables involved are small.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;
#[macro_use]
pub mod dbgio;

pub mod atomic;
pub mod brk;
pub mod clock;
pub mod err;
pub mod fail;
pub mod irq;
pub mod maple;
pub mod mmu;
pub mod regs;
pub mod signal;
pub mod sleep;
pub mod startup;
pub mod sync;
pub mod thread;
pub mod time;
pub mod timer;
pub mod tls;
pub mod util;

/// Build-time kernel configuration.
pub mod kconfig {
    include!(concat!(env!("OUT_DIR"), "/kconfig.rs"));
}

#[cfg(test)]
mod testutil;

pub use startup::Kernel;
