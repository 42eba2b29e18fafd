// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::err::{KernError, KernResult, Wait, WakeResult};
use crate::startup::Kernel;
use crate::thread::WaitChan;

use super::may_block;

/// What `barrier_wait` hands the one thread chosen per round. Everybody
/// else gets 0.
pub const BARRIER_SERIAL: usize = 1;

/// A reusable rendezvous for a fixed number of threads.
///
/// Arrivals are the threads still blocked on the channel, so a waiter that
/// is interrupted or cancelled out of its wait no longer counts.
#[derive(Debug)]
pub struct Barrier {
    count: usize,
    rounds: u64,
    chan: Option<WaitChan>,
}

impl Barrier {
    pub fn new(count: usize) -> KernResult<Self> {
        if count == 0 {
            return Err(KernError::InvalidArgument);
        }
        Ok(Self {
            count,
            rounds: 0,
            chan: None,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Completed rounds.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }
}

impl Kernel {
    /// Arrives at `b`. The last of `count` arrivals releases the round and
    /// returns `BARRIER_SERIAL` without blocking; the others block and wake
    /// with 0.
    pub fn barrier_wait(&mut self, b: &mut Barrier) -> KernResult<Wait<usize>> {
        may_block()?;
        if self.sync_waiters(b.chan) + 1 < b.count {
            let chan = self.sync_chan(&mut b.chan);
            self.block_current(Some(chan), None)?;
            return Ok(Wait::Blocked);
        }
        b.rounds += 1;
        if let Some(chan) = b.chan {
            let (_, hint) = self.wake_all(chan, WakeResult::Ready(0));
            self.finish(hint);
        }
        Ok(Wait::Done(BARRIER_SERIAL))
    }

    pub fn barrier_destroy(&mut self, b: &mut Barrier) -> KernResult<()> {
        if self.sync_waiters(b.chan) > 0 {
            return Err(KernError::Busy);
        }
        b.chan = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kconfig::MAX_THREADS;
    use crate::testutil;
    use proptest::prelude::*;

    #[derive(Copy, Clone, Default)]
    struct Progress {
        done: usize,
        waiting: bool,
    }

    #[derive(Default, Debug, Eq, PartialEq)]
    struct Tally {
        serial: usize,
        non_serial: usize,
        pre: usize,
        post: usize,
    }

    impl Tally {
        fn returned(&mut self, v: usize) {
            if v == BARRIER_SERIAL {
                self.serial += 1;
            } else {
                self.non_serial += 1;
            }
            self.post += 1;
        }
    }

    /// Runs `n` threads (the caller plus `n - 1` spawned) through `iters`
    /// barrier rounds, acting as each thread in turn whenever it holds the
    /// CPU.
    fn run_barrier(n: usize, iters: usize) -> Tally {
        let mut k = testutil::boot();
        let main = k.current();
        for i in 1..n {
            testutil::spawn_with(&mut k, "waiter", crate::kconfig::DEFAULT_PRIORITY, i);
        }
        let mut b = Barrier::new(n).unwrap();
        let mut tally = Tally::default();
        let mut prog = [Progress::default(); MAX_THREADS];

        for _ in 0..n * iters * 8 + 64 {
            let me = k.current();
            let p = &mut prog[me.index()];
            if p.waiting {
                p.waiting = false;
                match k.take_wake() {
                    Some(WakeResult::Ready(v)) => tally.returned(v),
                    other => panic!("waiter woke with {other:?}"),
                }
                p.done += 1;
            }
            if p.done < iters {
                tally.pre += 1;
                match k.barrier_wait(&mut b).unwrap() {
                    Wait::Done(v) => {
                        tally.returned(v);
                        prog[me.index()].done += 1;
                    }
                    Wait::Blocked => prog[me.index()].waiting = true,
                }
            } else if me == main {
                if prog.iter().all(|p| p.done == iters || p.done == 0 && !p.waiting)
                    && tally.post == n * iters
                {
                    k.barrier_destroy(&mut b).unwrap();
                    return tally;
                }
                k.yield_now();
            } else {
                k.thread_exit(0);
            }
        }
        panic!("barrier run did not finish: {tally:?}");
    }

    #[test]
    fn fifteen_threads_ten_rounds() {
        let t = run_barrier(15, 10);
        assert_eq!(
            t,
            Tally {
                serial: 10,
                non_serial: 140,
                pre: 150,
                post: 150,
            }
        );
    }

    #[test]
    fn zero_participants_is_invalid() {
        assert_eq!(Barrier::new(0).err(), Some(KernError::InvalidArgument));
    }

    #[test]
    fn a_lone_thread_is_always_serial() {
        let mut k = testutil::boot();
        let mut b = Barrier::new(1).unwrap();
        for _ in 0..3 {
            assert_eq!(k.barrier_wait(&mut b), Ok(Wait::Done(BARRIER_SERIAL)));
        }
        assert_eq!(b.rounds(), 3);
    }

    #[test]
    fn destroy_with_waiters_is_busy() {
        let mut k = testutil::boot();
        let a = testutil::spawn(&mut k, "a");
        let mut b = Barrier::new(2).unwrap();
        testutil::run(&mut k, a);
        assert!(k.barrier_wait(&mut b).unwrap().is_blocked());
        assert_eq!(k.barrier_destroy(&mut b), Err(KernError::Busy));
        assert_eq!(k.barrier_wait(&mut b), Ok(Wait::Done(BARRIER_SERIAL)));
        k.barrier_destroy(&mut b).unwrap();
    }

    #[test]
    fn interrupted_waiter_leaves_the_round() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let mut b = Barrier::new(2).unwrap();

        testutil::run(&mut k, a);
        assert!(k.barrier_wait(&mut b).unwrap().is_blocked());
        testutil::run(&mut k, main);
        assert_eq!(k.thread_interrupt(a), Ok(true));
        k.barrier_destroy(&mut b).unwrap();

        // Main alone does not make two.
        assert!(k.barrier_wait(&mut b).unwrap().is_blocked());
        assert_eq!(b.rounds(), 0);

        testutil::run(&mut k, a);
        assert_eq!(k.take_wake(), Some(WakeResult::Interrupted));
        assert_eq!(k.barrier_wait(&mut b), Ok(Wait::Done(BARRIER_SERIAL)));
        assert_eq!(b.rounds(), 1);

        testutil::run(&mut k, main);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(0)));
    }

    #[test]
    fn cancelled_waiter_leaves_the_round() {
        let mut k = testutil::boot();
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let mut b = Barrier::new(2).unwrap();

        testutil::run(&mut k, a);
        assert!(k.barrier_wait(&mut b).unwrap().is_blocked());
        testutil::run(&mut k, main);
        k.thread_cancel(a).unwrap();
        assert_eq!(k.barrier_destroy(&mut b), Ok(()));
        assert!(k.barrier_wait(&mut b).unwrap().is_blocked());
        assert_eq!(b.rounds(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn exactly_one_serial_per_round(n in 1usize..8, iters in 1usize..6) {
            let t = run_barrier(n, iters);
            prop_assert_eq!(t.serial, iters);
            prop_assert_eq!(t.non_serial, (n - 1) * iters);
            prop_assert_eq!(t.pre, n * iters);
        }
    }
}
