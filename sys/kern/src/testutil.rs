// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host test fixtures: a booted kernel over a private RAM arena.

use core::ops::{Deref, DerefMut};
use std::boxed::Box;
use std::vec;
use std::vec::Vec;

use abi::{InitFlags, Priority, ThreadId};

use crate::kconfig::{DEFAULT_PRIORITY, KERNEL_STACK_RESERVE};
use crate::startup::{BootInfo, Kernel};
use crate::thread::ThreadAttrs;
use crate::tls::TlsTemplate;

/// Program break space for one test kernel: every thread slot's stack and
/// TLS with room to spare.
const ARENA: usize = 2 << 20;

/// A kernel that owns the memory its program break hands out.
pub struct Booted {
    // Dropped before the arena it points into.
    k: Box<Kernel>,
    _arena: Vec<u64>,
}

impl Deref for Booted {
    type Target = Kernel;
    fn deref(&self) -> &Kernel {
        &self.k
    }
}

impl DerefMut for Booted {
    fn deref_mut(&mut self) -> &mut Kernel {
        &mut self.k
    }
}

/// A cooperative kernel with interrupts on and no peripherals.
pub fn boot() -> Booted {
    boot_with(InitFlags::IRQ)
}

pub fn boot_with(flags: InitFlags) -> Booted {
    boot_tls(flags, TlsTemplate::EMPTY)
}

pub fn boot_tls(flags: InitFlags, tls: TlsTemplate) -> Booted {
    let mut arena = vec![0u64; ARENA / 8];
    let start = arena.as_mut_ptr() as usize;
    let info = BootInfo {
        image_end: start,
        ram_top: start + ARENA + KERNEL_STACK_RESERVE,
        tls,
    };
    let mut k = Box::new(Kernel::new());
    k.init(flags, &info).unwrap();
    Booted { k, _arena: arena }
}

/// Thread body for tests that never actually run thread code.
pub fn entry(arg: usize) -> usize {
    arg
}

pub fn spawn(k: &mut Kernel, label: &str) -> ThreadId {
    spawn_with(k, label, DEFAULT_PRIORITY, 0)
}

pub fn spawn_with(k: &mut Kernel, label: &str, priority: Priority, arg: usize) -> ThreadId {
    let attrs = ThreadAttrs {
        label,
        priority,
        ..ThreadAttrs::default()
    };
    k.thread_create(entry, arg, &attrs).unwrap()
}

/// Switches to `tid`, yielding around the run queue until it is current.
pub fn run(k: &mut Kernel, tid: ThreadId) {
    for _ in 0..crate::kconfig::MAX_THREADS * 2 {
        if k.current() == tid {
            return;
        }
        k.yield_now();
    }
    panic!("thread {tid} never got the CPU");
}
