// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::err::{KernError, KernResult, Wait, WakeResult};
use crate::startup::Kernel;
use crate::thread::WaitChan;
use crate::time::Timestamp;

use super::{may_block, Mutex};

/// A condition variable.
///
/// Waiting releases the mutex and blocks on the condvar in one step. The
/// mutex is *not* reacquired on wakeup: once the wait result arrives the
/// waiter calls `mutex_lock` again before looking at the shared state.
/// A recursive mutex held more than once is refused with `Busy`, since the
/// wait could not give it up.
#[derive(Debug, Default)]
pub struct Condvar {
    chan: Option<WaitChan>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self { chan: None }
    }
}

impl Kernel {
    pub fn cond_wait(&mut self, cv: &mut Condvar, m: &mut Mutex) -> KernResult<Wait<()>> {
        self.cond_block(cv, m, None)
    }

    pub fn cond_timed_wait(
        &mut self,
        cv: &mut Condvar,
        m: &mut Mutex,
        deadline: Timestamp,
    ) -> KernResult<Wait<()>> {
        self.cond_block(cv, m, Some(deadline))
    }

    fn cond_block(
        &mut self,
        cv: &mut Condvar,
        m: &mut Mutex,
        deadline: Option<Timestamp>,
    ) -> KernResult<Wait<()>> {
        may_block()?;
        if m.owner() != Some(self.sched.current_id()) {
            return Err(KernError::NotPermitted);
        }
        if m.depth() > 1 {
            return Err(KernError::Busy);
        }
        let chan = self.sync_chan(&mut cv.chan);
        // Release without switching; the block below does the switch.
        self.cond_release(m)?;
        self.block_current(Some(chan), deadline)?;
        Ok(Wait::Blocked)
    }

    fn cond_release(&mut self, m: &mut Mutex) -> KernResult<()> {
        let pre = self.sched.preempt_enabled();
        self.sched.set_preempt(false);
        let r = self.mutex_unlock(m);
        self.sched.set_preempt(pre);
        r
    }

    /// Wakes the longest waiter, if any.
    pub fn cond_signal(&mut self, cv: &mut Condvar) {
        if let Some(chan) = cv.chan {
            let (_, hint) = self.wake_one(chan, WakeResult::Ready(0));
            self.finish(hint);
        }
    }

    /// Wakes every waiter.
    pub fn cond_broadcast(&mut self, cv: &mut Condvar) -> usize {
        match cv.chan {
            Some(chan) => {
                let (n, hint) = self.wake_all(chan, WakeResult::Ready(0));
                self.finish(hint);
                n
            }
            None => 0,
        }
    }

    pub fn cond_destroy(&mut self, cv: &mut Condvar) -> KernResult<()> {
        if self.sync_waiters(cv.chan) > 0 {
            return Err(KernError::Busy);
        }
        cv.chan = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::irq;
    use crate::sync::MutexKind;
    use crate::testutil;

    #[test]
    fn wait_releases_the_mutex() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let b = testutil::spawn(&mut k, "b");
        let mut m = Mutex::new(MutexKind::Normal);
        let mut cv = Condvar::new();

        testutil::run(&mut k, a);
        k.mutex_lock(&mut m).unwrap();
        assert!(k.cond_wait(&mut cv, &mut m).unwrap().is_blocked());
        assert!(!m.is_locked());
        testutil::run(&mut k, b);
        k.mutex_lock(&mut m).unwrap();
        assert!(k.cond_wait(&mut cv, &mut m).unwrap().is_blocked());

        testutil::run(&mut k, main);
        assert_eq!(k.cond_destroy(&mut cv), Err(KernError::Busy));
        k.cond_signal(&mut cv);
        assert_eq!(k.cond_broadcast(&mut cv), 1);

        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(0)));
        assert_eq!(k.mutex_lock(&mut m), Ok(Wait::Done(())));
        k.mutex_unlock(&mut m).unwrap();
        k.cond_destroy(&mut cv).unwrap();
    }

    #[test]
    fn wait_needs_the_mutex() {
        let mut k = testutil::boot();
        let mut m = Mutex::new(MutexKind::Normal);
        let mut cv = Condvar::new();
        assert_eq!(k.cond_wait(&mut cv, &mut m), Err(KernError::NotPermitted));
    }

    #[test]
    fn nested_recursive_lock_cannot_wait() {
        let mut k = testutil::boot();
        let mut m = Mutex::new(MutexKind::Recursive);
        let mut cv = Condvar::new();
        k.mutex_lock(&mut m).unwrap();
        k.mutex_lock(&mut m).unwrap();
        assert_eq!(k.cond_wait(&mut cv, &mut m), Err(KernError::Busy));
        assert_eq!(m.depth(), 2);
        k.mutex_unlock(&mut m).unwrap();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        assert!(k.cond_wait(&mut cv, &mut m).unwrap().is_blocked());
        assert!(!m.is_locked());
        assert_eq!(k.current(), a);
        k.cond_signal(&mut cv);
        testutil::run(&mut k, main);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(0)));
    }

    #[test]
    fn interrupted_waiter_is_not_signalled() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let mut m = Mutex::new(MutexKind::Normal);
        let mut cv = Condvar::new();

        testutil::run(&mut k, a);
        k.mutex_lock(&mut m).unwrap();
        assert!(k.cond_wait(&mut cv, &mut m).unwrap().is_blocked());
        testutil::run(&mut k, main);
        assert_eq!(k.thread_interrupt(a), Ok(true));
        assert_eq!(k.cond_broadcast(&mut cv), 0);
        k.cond_destroy(&mut cv).unwrap();
        assert!(!m.is_locked());

        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::Interrupted));
        assert_eq!(k.mutex_lock(&mut m), Ok(Wait::Done(())));
    }

    #[test]
    fn timed_wait_expires() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let mut m = Mutex::new(MutexKind::Normal);
        let mut cv = Condvar::new();

        testutil::run(&mut k, a);
        k.mutex_lock(&mut m).unwrap();
        let at = k.clock.now().saturating_add_ns(5_000_000);
        assert!(k.cond_timed_wait(&mut cv, &mut m, at).unwrap().is_blocked());
        assert_eq!(k.current(), main);

        arch::advance_ns(6_000_000);
        k.handle_exception(irq::EXC_TMU0_TUNI0);
        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::TimedOut));
        // Nobody is left to signal.
        testutil::run(&mut k, main);
        k.cond_signal(&mut cv);
        k.cond_destroy(&mut cv).unwrap();
    }
}
