// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives built on the scheduler's wait channels.
//!
//! The objects themselves are plain data owned by whoever uses them; every
//! operation is a `Kernel` method taking the object by `&mut`. Objects have
//! `const` constructors and only ask the scheduler for a wait channel the
//! first time somebody has to wait on them.
//!
//! Nothing here blocks in interrupt context. Where an operation would have
//! to wait, it returns `WouldBlock` instead.

mod barrier;
mod condvar;
mod mutex;
mod once;
mod semaphore;

pub use barrier::{Barrier, BARRIER_SERIAL};
pub use condvar::Condvar;
pub use mutex::{Mutex, MutexKind};
pub use once::Once;
pub use semaphore::Semaphore;

use crate::err::{KernError, KernResult};
use crate::irq;
use crate::startup::Kernel;
use crate::thread::WaitChan;

impl Kernel {
    /// The wait channel in `slot`, allocating it on first use.
    fn sync_chan(&mut self, slot: &mut Option<WaitChan>) -> WaitChan {
        *slot.get_or_insert_with(|| self.sched.new_chan())
    }

    fn sync_waiters(&self, slot: Option<WaitChan>) -> usize {
        slot.map_or(0, |c| self.sched.waiter_count(c))
    }
}

fn may_block() -> KernResult<()> {
    if irq::inside_int() {
        Err(KernError::WouldBlock)
    } else {
        Ok(())
    }
}
