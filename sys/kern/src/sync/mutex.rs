// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use abi::ThreadId;

use crate::err::{KernError, KernResult, Wait, WakeResult};
use crate::startup::Kernel;
use crate::thread::WaitChan;
use crate::time::Timestamp;

use super::may_block;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MutexKind {
    Normal,
    /// Same checks as `Normal`; kept as a distinct kind for callers that
    /// name it.
    ErrorCheck,
    /// The owner may lock again; it has to unlock as many times.
    Recursive,
}

/// A sleeping lock with an owner.
///
/// Unlock hands the lock straight to the longest waiter, so a woken waiter
/// already owns it and never has to retry.
#[derive(Debug)]
pub struct Mutex {
    kind: MutexKind,
    owner: Option<ThreadId>,
    count: usize,
    chan: Option<WaitChan>,
    destroyed: bool,
}

impl Mutex {
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            kind,
            owner: None,
            count: 0,
            chan: None,
            destroyed: false,
        }
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }

    /// How many times the owner holds it.
    pub fn depth(&self) -> usize {
        self.count
    }

    fn live(&self) -> KernResult<()> {
        if self.destroyed {
            Err(KernError::BadHandle)
        } else {
            Ok(())
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new(MutexKind::Normal)
    }
}

impl Kernel {
    pub fn mutex_lock(&mut self, m: &mut Mutex) -> KernResult<Wait<()>> {
        self.mutex_acquire(m, None)
    }

    /// Like `mutex_lock`, but gives up with `TimedOut` at `deadline`.
    pub fn mutex_timed_lock(&mut self, m: &mut Mutex, deadline: Timestamp) -> KernResult<Wait<()>> {
        self.mutex_acquire(m, Some(deadline))
    }

    pub fn mutex_try_lock(&mut self, m: &mut Mutex) -> KernResult<()> {
        m.live()?;
        match self.mutex_take(m)? {
            true => Ok(()),
            false => Err(KernError::Busy),
        }
    }

    /// Takes `m` if it can be had right now. Errors for a relock the kind
    /// does not allow.
    fn mutex_take(&mut self, m: &mut Mutex) -> KernResult<bool> {
        let me = self.sched.current_id();
        match m.owner {
            None => {
                m.owner = Some(me);
                m.count = 1;
                Ok(true)
            }
            Some(o) if o == me => match m.kind {
                MutexKind::Recursive => {
                    m.count += 1;
                    Ok(true)
                }
                _ => Err(KernError::Deadlock),
            },
            Some(_) => Ok(false),
        }
    }

    fn mutex_acquire(&mut self, m: &mut Mutex, deadline: Option<Timestamp>) -> KernResult<Wait<()>> {
        m.live()?;
        if self.mutex_take(m)? {
            return Ok(Wait::Done(()));
        }
        may_block()?;
        let chan = self.sync_chan(&mut m.chan);
        self.block_current(Some(chan), deadline)?;
        Ok(Wait::Blocked)
    }

    pub fn mutex_unlock(&mut self, m: &mut Mutex) -> KernResult<()> {
        m.live()?;
        if m.owner != Some(self.sched.current_id()) {
            return Err(KernError::NotPermitted);
        }
        m.count -= 1;
        if m.count > 0 {
            return Ok(());
        }
        m.owner = None;
        if let Some(chan) = m.chan {
            let (next, hint) = self.wake_one(chan, WakeResult::Ready(0));
            if let Some(next) = next {
                m.owner = Some(next);
                m.count = 1;
            }
            self.finish(hint);
        }
        Ok(())
    }

    /// Retires `m`. Refused while it is held or waited on.
    pub fn mutex_destroy(&mut self, m: &mut Mutex) -> KernResult<()> {
        m.live()?;
        if m.is_locked() || self.sync_waiters(m.chan) > 0 {
            return Err(KernError::Busy);
        }
        m.destroyed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::irq;
    use crate::testutil;

    #[test]
    fn uncontended_lock_and_unlock() {
        let mut k = testutil::boot();
        let mut m = Mutex::default();
        assert_eq!(k.mutex_lock(&mut m), Ok(Wait::Done(())));
        assert_eq!(m.owner(), Some(k.current()));
        assert_eq!(k.mutex_lock(&mut m), Err(KernError::Deadlock));
        k.mutex_unlock(&mut m).unwrap();
        assert!(!m.is_locked());
        assert_eq!(k.mutex_unlock(&mut m), Err(KernError::NotPermitted));
    }

    #[test]
    fn recursive_mutex_counts() {
        let mut k = testutil::boot();
        let mut m = Mutex::new(MutexKind::Recursive);
        for _ in 0..3 {
            assert_eq!(k.mutex_lock(&mut m), Ok(Wait::Done(())));
        }
        k.mutex_try_lock(&mut m).unwrap();
        for _ in 0..3 {
            k.mutex_unlock(&mut m).unwrap();
            assert!(m.is_locked());
        }
        k.mutex_unlock(&mut m).unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn unlock_hands_off_to_the_oldest_waiter() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let b = testutil::spawn(&mut k, "b");
        let mut m = Mutex::new(MutexKind::ErrorCheck);
        k.mutex_lock(&mut m).unwrap();

        testutil::run(&mut k, a);
        assert_eq!(k.mutex_try_lock(&mut m), Err(KernError::Busy));
        assert_eq!(k.mutex_unlock(&mut m), Err(KernError::NotPermitted));
        assert!(k.mutex_lock(&mut m).unwrap().is_blocked());
        testutil::run(&mut k, b);
        assert!(k.mutex_lock(&mut m).unwrap().is_blocked());
        testutil::run(&mut k, main);

        assert_eq!(k.mutex_destroy(&mut m), Err(KernError::Busy));
        k.mutex_unlock(&mut m).unwrap();
        assert_eq!(m.owner(), Some(a));
        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(0)));
        k.mutex_unlock(&mut m).unwrap();
        assert_eq!(m.owner(), Some(b));
    }

    #[test]
    fn timed_lock_gives_up() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let mut m = Mutex::default();
        k.mutex_lock(&mut m).unwrap();

        testutil::run(&mut k, a);
        let at = k.clock.now().saturating_add_ns(1_000_000);
        assert!(k.mutex_timed_lock(&mut m, at).unwrap().is_blocked());
        assert_eq!(k.current(), main);

        arch::advance_ns(2_000_000);
        k.handle_exception(irq::EXC_TMU0_TUNI0);
        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::TimedOut));
        testutil::run(&mut k, main);
        k.mutex_unlock(&mut m).unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn interrupted_waiters_are_passed_over() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let b = testutil::spawn(&mut k, "b");
        let c = testutil::spawn(&mut k, "c");
        let mut m = Mutex::default();
        k.mutex_lock(&mut m).unwrap();

        for t in [a, b, c] {
            testutil::run(&mut k, t);
            assert!(k.mutex_lock(&mut m).unwrap().is_blocked());
        }
        testutil::run(&mut k, main);
        assert_eq!(k.thread_interrupt(a), Ok(true));
        k.thread_cancel(b).unwrap();

        k.mutex_unlock(&mut m).unwrap();
        assert_eq!(m.owner(), Some(c));
        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::Interrupted));
        assert_eq!(k.mutex_try_lock(&mut m), Err(KernError::Busy));
    }

    #[test]
    fn unlock_with_only_abandoned_waiters_frees_the_lock() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let mut m = Mutex::default();
        k.mutex_lock(&mut m).unwrap();
        testutil::run(&mut k, a);
        assert!(k.mutex_lock(&mut m).unwrap().is_blocked());
        testutil::run(&mut k, main);
        assert_eq!(k.thread_interrupt(a), Ok(true));
        k.mutex_unlock(&mut m).unwrap();
        assert!(!m.is_locked());
        k.mutex_destroy(&mut m).unwrap();
    }

    #[test]
    fn destroyed_mutexes_are_dead() {
        let mut k = testutil::boot();
        let mut m = Mutex::default();
        k.mutex_destroy(&mut m).unwrap();
        assert_eq!(k.mutex_lock(&mut m), Err(KernError::BadHandle));
        assert_eq!(k.mutex_destroy(&mut m), Err(KernError::BadHandle));
    }
}
