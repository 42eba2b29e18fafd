// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::err::{KernError, KernResult, Wait, WakeResult};
use crate::startup::Kernel;
use crate::thread::WaitChan;
use crate::time::Timestamp;

use super::may_block;

/// A counting semaphore. `signal` with a waiter present passes the unit
/// straight to it, so the count only grows when nobody waits.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: usize,
    chan: Option<WaitChan>,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self { count, chan: None }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

impl Kernel {
    pub fn sem_wait(&mut self, s: &mut Semaphore) -> KernResult<Wait<()>> {
        self.sem_acquire(s, None)
    }

    pub fn sem_timed_wait(&mut self, s: &mut Semaphore, deadline: Timestamp) -> KernResult<Wait<()>> {
        self.sem_acquire(s, Some(deadline))
    }

    /// Takes a unit if one is there; `WouldBlock` otherwise. Usable from
    /// interrupt handlers.
    pub fn sem_try_wait(&mut self, s: &mut Semaphore) -> KernResult<()> {
        match s.count {
            0 => Err(KernError::WouldBlock),
            _ => {
                s.count -= 1;
                Ok(())
            }
        }
    }

    fn sem_acquire(&mut self, s: &mut Semaphore, deadline: Option<Timestamp>) -> KernResult<Wait<()>> {
        if self.sem_try_wait(s).is_ok() {
            return Ok(Wait::Done(()));
        }
        may_block()?;
        let chan = self.sync_chan(&mut s.chan);
        self.block_current(Some(chan), deadline)?;
        Ok(Wait::Blocked)
    }

    pub fn sem_signal(&mut self, s: &mut Semaphore) {
        if let Some(chan) = s.chan {
            let (woke, hint) = self.wake_one(chan, WakeResult::Ready(0));
            if woke.is_some() {
                self.finish(hint);
                return;
            }
        }
        s.count += 1;
    }
}
