// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for time to pass.
//!
//! `spin_delay_*` burn the CPU against the performance counter and never
//! give it up, which is what hardware bring-up code wants for short
//! settle times. `sleep_*` put the calling thread to sleep on the timer
//! queue and only come back once the deadline has passed.

use abi::{KernError, Timespec};

use crate::err::{KernResult, Wait, WakeResult};
use crate::irq;
use crate::startup::Kernel;
use crate::time::Timestamp;

/// A sleep started by `nanosleep`, to be settled with `nanosleep_finish`.
#[must_use]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Nanosleep {
    until: Timestamp,
    wait: Wait<()>,
}

impl Nanosleep {
    pub fn until(&self) -> Timestamp {
        self.until
    }

    pub fn is_blocked(&self) -> bool {
        self.wait.is_blocked()
    }
}

impl Kernel {
    pub fn spin_delay_ns(&mut self, ns: u64) {
        let end = self.clock.ns64().saturating_add(ns);
        while self.clock.ns64() < end {
            core::hint::spin_loop();
        }
    }

    pub fn spin_delay_us(&mut self, us: u64) {
        self.spin_delay_ns(us.saturating_mul(1_000));
    }

    pub fn spin_delay_ms(&mut self, ms: u64) {
        self.spin_delay_ns(ms.saturating_mul(1_000_000));
    }

    /// Sleeps for at least `ns`. Zero just yields.
    pub fn sleep_ns(&mut self, ns: u64) -> KernResult<Wait<()>> {
        if irq::inside_int() {
            return Err(KernError::WouldBlock);
        }
        if ns == 0 {
            self.yield_now();
            return Ok(Wait::Done(()));
        }
        let until = self.clock.now().saturating_add_ns(ns);
        self.sleep_current(until)?;
        Ok(Wait::Blocked)
    }

    pub fn sleep_us(&mut self, us: u64) -> KernResult<Wait<()>> {
        self.sleep_ns(us.saturating_mul(1_000))
    }

    pub fn sleep_ms(&mut self, ms: u64) -> KernResult<Wait<()>> {
        self.sleep_ns(ms.saturating_mul(1_000_000))
    }

    pub fn usleep(&mut self, us: u32) -> KernResult<Wait<()>> {
        self.sleep_us(u64::from(us))
    }

    pub fn sleep(&mut self, secs: u32) -> KernResult<Wait<()>> {
        self.sleep_ns(u64::from(secs) * abi::NS_PER_SEC)
    }

    /// POSIX `nanosleep`. Refused with `Interrupted` in interrupt context,
    /// and with `InvalidArgument` for a malformed or zero request.
    pub fn nanosleep(&mut self, req: &Timespec) -> KernResult<Nanosleep> {
        if irq::inside_int() {
            return Err(KernError::Interrupted);
        }
        let ns = req.to_ns()?;
        if ns == 0 {
            return Err(KernError::InvalidArgument);
        }
        let until = self.clock.now().saturating_add_ns(ns);
        let wait = self.sleep_ns(ns)?;
        Ok(Nanosleep { until, wait })
    }

    /// Settles a `nanosleep` once the caller runs again. `rem` gets the time
    /// left: zero after a full sleep, the remainder when a signal cut it
    /// short (which also returns `Interrupted`).
    pub fn nanosleep_finish(&mut self, s: Nanosleep, rem: Option<&mut Timespec>) -> KernResult<()> {
        let left = match s.wait {
            Wait::Done(()) => Ok(0),
            Wait::Blocked => match self.take_wake() {
                Some(WakeResult::Interrupted) => {
                    Err(s.until.saturating_ns_since(self.clock.now()))
                }
                Some(_) => Ok(0),
                None => return Err(KernError::WouldBlock),
            },
        };
        let (ns, r) = match left {
            Ok(ns) => (ns, Ok(())),
            Err(ns) => (ns, Err(KernError::Interrupted)),
        };
        if let Some(rem) = rem {
            *rem = Timespec::from_ns(ns);
        }
        r
    }
}

/// `nanosleep` as a kernel call; the argument points at the request.
pub fn kcall_nanosleep(k: &mut Kernel, arg: usize) -> KernResult<Wait<usize>> {
    if arg == 0 {
        return Err(KernError::InvalidArgument);
    }
    // Safety: the caller passes a pointer to a live request.
    let req = unsafe { &*(arg as *const Timespec) };
    Ok(k.nanosleep(req)?.wait.map(|()| 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch;
    use crate::testutil;
    use crate::thread::ThreadState;
    use proptest::prelude::*;

    #[test]
    fn spin_delay_calibration() {
        let mut k = testutil::boot();
        for us in [1u64, 10, 100, 1000, 10000] {
            let t0 = k.clock.ns64();
            let switches = arch::switch_count();
            k.spin_delay_us(us);
            let elapsed = k.clock.ns64() - t0;
            let want = us * 1_000;
            assert!(elapsed >= want, "{us} us: {elapsed} ns");
            assert!(elapsed <= want + want / 20 + 5_000, "{us} us: {elapsed} ns");
            assert_eq!(arch::switch_count(), switches);
        }
    }

    /// Fires the timer in `step` increments until `tid` is runnable again.
    /// Returns the time at which it was.
    fn tick_until_awake(k: &mut Kernel, tid: abi::ThreadId, step: u64) -> u64 {
        for _ in 0..100_000 {
            arch::advance_ns(step);
            k.handle_exception(irq::EXC_TMU0_TUNI0);
            if k.thread_state(tid) != Ok(ThreadState::Sleeping) {
                return k.clock.ns64();
            }
        }
        panic!("{tid} never woke");
    }

    #[test]
    fn sleep_wakes_after_the_deadline() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        testutil::run(&mut k, a);
        let t0 = k.clock.ns64();
        assert!(k.sleep_ms(50).unwrap().is_blocked());
        assert_eq!(k.current(), main);
        assert_eq!(k.thread_state(a), Ok(ThreadState::Sleeping));

        let t1 = tick_until_awake(&mut k, a, 1_000_000);
        assert!(t1 - t0 >= 50_000_000);
        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(0)));
    }

    #[test]
    fn zero_sleep_yields() {
        let mut k = testutil::boot();
        let a = testutil::spawn(&mut k, "a");
        assert_eq!(k.sleep_ns(0), Ok(Wait::Done(())));
        assert_eq!(k.current(), a);
    }

    #[test]
    fn no_sleeping_in_interrupts() {
        let mut k = testutil::boot();
        let req = Timespec::from_ns(1_000);
        arch::exception_enter();
        assert_eq!(k.sleep_ms(1), Err(KernError::WouldBlock));
        assert_eq!(k.nanosleep(&req).err(), Some(KernError::Interrupted));
        arch::exception_leave();
    }

    #[test]
    fn nanosleep_rejects_bad_requests() {
        let mut k = testutil::boot();
        assert_eq!(k.nanosleep(&Timespec::ZERO).err(), Some(KernError::InvalidArgument));
        let neg = Timespec {
            tv_sec: -1,
            tv_nsec: 0,
        };
        assert_eq!(k.nanosleep(&neg).err(), Some(KernError::InvalidArgument));
        assert_eq!(kcall_nanosleep(&mut k, 0), Err(KernError::InvalidArgument));
    }

    #[test]
    fn nanosleep_clears_rem_on_a_full_sleep() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        testutil::run(&mut k, a);
        let req = Timespec {
            tv_sec: 0,
            tv_nsec: 2_000_000,
        };
        let s = k.nanosleep(&req).unwrap();
        assert!(s.is_blocked());
        assert_eq!(k.current(), main);
        tick_until_awake(&mut k, a, 500_000);
        testutil::run(&mut k, a);
        let mut rem = Timespec::from_ns(77);
        k.nanosleep_finish(s, Some(&mut rem)).unwrap();
        assert_eq!(rem, Timespec::ZERO);
    }

    #[test]
    fn interrupted_nanosleep_reports_the_remainder() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        testutil::run(&mut k, a);
        let s = k.nanosleep(&Timespec::from_ns(3 * abi::NS_PER_SEC)).unwrap();
        assert_eq!(k.current(), main);
        arch::advance_ns(1_000_000_000);
        assert_eq!(k.thread_interrupt(a), Ok(true));

        testutil::run(&mut k, a);
        let mut rem = Timespec::ZERO;
        assert_eq!(k.nanosleep_finish(s, Some(&mut rem)), Err(KernError::Interrupted));
        assert!(rem.tv_sec == 1 || rem.tv_sec == 2, "{rem:?}");
        assert!(rem.to_ns().unwrap() < 2 * abi::NS_PER_SEC);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn sleeps_never_end_early(ns in 1_000u64..20_000_000, step in 10_000u64..3_000_000) {
            let mut k = testutil::boot();
            let a = testutil::spawn(&mut k, "a");
            testutil::run(&mut k, a);
            let t0 = k.clock.ns64();
            prop_assert!(k.sleep_ns(ns).unwrap().is_blocked());
            let t1 = tick_until_awake(&mut k, a, step);
            prop_assert!(t1 - t0 >= ns);
        }
    }
}
