// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot and periodic timers, and the scheduler tick.
//!
//! Armed timers sit in a fixed slot table; a min-heap keyed by deadline
//! orders them. Cancelling only empties the slot: heap entries carry the
//! slot generation and arming sequence they were pushed with, and entries
//! that no longer match are dropped when they reach the top. When the heap
//! fills up with such leftovers it is rebuilt from the slot table.
//!
//! TMU channel 0 is programmed for whichever comes first, the next
//! scheduler tick or the next deadline, and the interrupt handler runs
//! everything that is due before programming it again.

use abi::{KernError, LogLevel, ThreadId};
use heapless::binary_heap::{BinaryHeap, Min};

use crate::arch;
use crate::err::{KernResult, WakeResult};
use crate::irq::{self, IrqSource};
use crate::kconfig::MAX_TIMERS;
use crate::regs;
use crate::startup::Kernel;
use crate::thread::NextThread;
use crate::time::Timestamp;

/// A timer callback, run in interrupt context.
pub type TimerFn = fn(&mut Kernel, usize) -> NextThread;

/// What happens when a timer expires.
#[derive(Copy, Clone, Debug)]
pub enum TimerAction {
    /// End a sleep.
    Wake(ThreadId, u64),
    /// End a timed wait with `TimedOut`.
    Timeout(ThreadId, u64),
    Callback(TimerFn, usize),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerHandle {
    index: u16,
    gen: u16,
}

/// Priority of the timer interrupt.
const TIMER_IRQ_LEVEL: u8 = 14;
/// Shortest interval the channel is programmed for.
const MIN_PROGRAM_NS: u64 = 1_000;
const HEAP_LEN: usize = 2 * MAX_TIMERS;

#[derive(Copy, Clone, Debug)]
struct Armed {
    deadline: Timestamp,
    period: Option<u64>,
    seq: u64,
    action: TimerAction,
}

#[derive(Copy, Clone, Debug)]
struct Slot {
    gen: u16,
    armed: Option<Armed>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct HeapEntry {
    deadline: Timestamp,
    seq: u64,
    index: u16,
    gen: u16,
}

pub struct Timer {
    slots: [Slot; MAX_TIMERS],
    heap: BinaryHeap<HeapEntry, Min, HEAP_LEN>,
    seq: u64,
    hz: u32,
    next_tick: Option<Timestamp>,
    ticks: u64,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            slots: [Slot {
                gen: 0,
                armed: None,
            }; MAX_TIMERS],
            heap: BinaryHeap::new(),
            seq: 0,
            hz: 0,
            next_tick: None,
            ticks: 0,
        }
    }

    /// Arms a one-shot timer.
    pub fn schedule_at(
        &mut self,
        deadline: Timestamp,
        action: TimerAction,
    ) -> KernResult<TimerHandle> {
        self.arm(deadline, None, action)
    }

    /// Arms a timer that first fires at `first` and then every `period_ns`.
    pub fn schedule_every(
        &mut self,
        first: Timestamp,
        period_ns: u64,
        action: TimerAction,
    ) -> KernResult<TimerHandle> {
        if period_ns == 0 {
            return Err(KernError::InvalidArgument);
        }
        self.arm(first, Some(period_ns), action)
    }

    fn arm(
        &mut self,
        deadline: Timestamp,
        period: Option<u64>,
        action: TimerAction,
    ) -> KernResult<TimerHandle> {
        let index = self
            .slots
            .iter()
            .position(|s| s.armed.is_none())
            .ok_or(KernError::ResourceExhausted)?;
        self.seq += 1;
        let armed = Armed {
            deadline,
            period,
            seq: self.seq,
            action,
        };
        self.slots[index].armed = Some(armed);
        let h = TimerHandle {
            index: index as u16,
            gen: self.slots[index].gen,
        };
        self.push(h, &armed);
        Ok(h)
    }

    fn push(&mut self, h: TimerHandle, a: &Armed) {
        let e = HeapEntry {
            deadline: a.deadline,
            seq: a.seq,
            index: h.index,
            gen: h.gen,
        };
        if self.heap.push(e).is_err() {
            self.compact();
        }
    }

    /// Rebuilds the heap from the armed slots, dropping stale entries.
    fn compact(&mut self) {
        self.heap.clear();
        for (i, s) in self.slots.iter().enumerate() {
            if let Some(a) = &s.armed {
                // Cannot fail: at most one entry per slot.
                self.heap
                    .push(HeapEntry {
                        deadline: a.deadline,
                        seq: a.seq,
                        index: i as u16,
                        gen: s.gen,
                    })
                    .ok();
            }
        }
    }

    fn entry_valid(&self, e: &HeapEntry) -> bool {
        let s = &self.slots[usize::from(e.index)];
        s.gen == e.gen && s.armed.is_some_and(|a| a.seq == e.seq)
    }

    fn slot(&self, h: TimerHandle) -> KernResult<usize> {
        let i = usize::from(h.index);
        match self.slots.get(i) {
            Some(s) if s.gen == h.gen && s.armed.is_some() => Ok(i),
            _ => Err(KernError::BadHandle),
        }
    }

    fn disarm(&mut self, i: usize) {
        let s = &mut self.slots[i];
        s.armed = None;
        s.gen = s.gen.wrapping_add(1);
    }

    /// Disarms `h`. A timer that already fired (and was not periodic) is
    /// gone, so cancelling it is `BadHandle`.
    pub fn cancel(&mut self, h: TimerHandle) -> KernResult<()> {
        let i = self.slot(h)?;
        self.disarm(i);
        Ok(())
    }

    pub fn is_armed(&self, h: TimerHandle) -> bool {
        self.slot(h).is_ok()
    }

    pub fn armed_count(&self) -> usize {
        self.slots.iter().filter(|s| s.armed.is_some()).count()
    }

    /// Takes the next timer due at `now`, re-arming it if it is periodic.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<TimerAction> {
        loop {
            let e = *self.heap.peek()?;
            if !self.entry_valid(&e) {
                self.heap.pop();
                continue;
            }
            if e.deadline > now {
                return None;
            }
            self.heap.pop();
            let i = usize::from(e.index);
            let a = self.slots[i].armed?;
            match a.period {
                Some(p) => {
                    // Missed periods are skipped rather than replayed.
                    let mut next = a.deadline.saturating_add_ns(p);
                    if next <= now {
                        next = now.saturating_add_ns(p);
                    }
                    self.seq += 1;
                    let rearmed = Armed {
                        deadline: next,
                        seq: self.seq,
                        ..a
                    };
                    self.slots[i].armed = Some(rearmed);
                    let h = TimerHandle {
                        index: e.index,
                        gen: e.gen,
                    };
                    self.push(h, &rearmed);
                }
                None => self.disarm(i),
            }
            return Some(a.action);
        }
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        while let Some(e) = self.heap.peek() {
            if self.entry_valid(e) {
                return Some(e.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Sets the scheduler tick rate; 0 stops the tick.
    pub fn set_hz(&mut self, hz: u32, now: Timestamp) {
        self.hz = hz;
        self.next_tick = self.tick_ns().map(|ns| now.saturating_add_ns(ns));
    }

    pub fn hz(&self) -> u32 {
        self.hz
    }

    fn tick_ns(&self) -> Option<u64> {
        (self.hz != 0).then(|| 1_000_000_000 / u64::from(self.hz))
    }

    /// Whether a tick is due at `now`; if so, accounts it.
    pub fn tick_due(&mut self, now: Timestamp) -> bool {
        let (Some(t), Some(ns)) = (self.next_tick, self.tick_ns()) else {
            return false;
        };
        if t > now {
            return false;
        }
        self.ticks += 1;
        let mut next = t.saturating_add_ns(ns);
        if next <= now {
            next = now.saturating_add_ns(ns);
        }
        self.next_tick = Some(next);
        true
    }

    /// The next time anything needs the timer interrupt.
    pub fn next_event(&mut self) -> Option<Timestamp> {
        match (self.next_tick, self.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Ticks accounted since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

fn tmu0() -> &'static regs::TmuChannel {
    &arch::tmu_regs().ch[0]
}

fn tmu0_stop() {
    let t = arch::tmu_regs();
    t.tstr.set(t.tstr.get() & !regs::TSTR_STR0);
}

fn timer_irq(k: &mut Kernel, _code: u32, _data: usize) -> NextThread {
    let ch = tmu0();
    ch.tcr.set(ch.tcr.get() & !regs::TCR_UNF);
    k.timer_expire()
}

impl Kernel {
    pub(crate) fn timer_init(&mut self, hz: u32) -> KernResult<()> {
        self.timer.reset();
        tmu0_stop();
        let t = arch::tmu_regs();
        t.tocr.set(0);
        tmu0().tcr.set(regs::TCR_TPSC_DIV4 | regs::TCR_UNIE);
        self.irq
            .set_kernel_handler(irq::EXC_TMU0_TUNI0, timer_irq, 0);
        self.irq.set_priority(IrqSource::Tmu0, TIMER_IRQ_LEVEL)?;
        self.set_hz(hz);
        dbglog!(LogLevel::Debug, "timer: up at {} Hz", hz);
        Ok(())
    }

    pub(crate) fn timer_shutdown(&mut self) {
        tmu0_stop();
        tmu0().tcr.set(0);
        self.irq.clear_kernel_handler(irq::EXC_TMU0_TUNI0);
        self.irq.set_priority(IrqSource::Tmu0, 0).ok();
        self.timer.reset();
    }

    /// Runs `f(kernel, data)` in interrupt context at `deadline`.
    pub fn timer_schedule_at(
        &mut self,
        deadline: Timestamp,
        f: TimerFn,
        data: usize,
    ) -> KernResult<TimerHandle> {
        let h = self
            .timer
            .schedule_at(deadline, TimerAction::Callback(f, data))?;
        self.timer_program();
        Ok(h)
    }

    /// Runs `f(kernel, data)` every `period_ns`, starting one period from
    /// now.
    pub fn timer_schedule_every(
        &mut self,
        period_ns: u64,
        f: TimerFn,
        data: usize,
    ) -> KernResult<TimerHandle> {
        let first = self.clock.now().saturating_add_ns(period_ns);
        let h = self.timer.schedule_every(
            first,
            period_ns,
            TimerAction::Callback(f, data),
        )?;
        self.timer_program();
        Ok(h)
    }

    pub fn timer_cancel(&mut self, h: TimerHandle) -> KernResult<()> {
        self.timer.cancel(h)?;
        self.timer_program();
        Ok(())
    }

    /// Sets the preemption tick rate. With 0 the scheduler only switches
    /// threads when they yield or block.
    pub fn set_hz(&mut self, hz: u32) {
        let now = self.clock.now();
        self.timer.set_hz(hz, now);
        self.sched.set_preempt(hz != 0);
        self.timer_program();
    }

    /// Programs TMU0 for the next timer event, or stops it if there is
    /// none.
    pub(crate) fn timer_program(&mut self) {
        tmu0_stop();
        let Some(at) = self.timer.next_event() else {
            return;
        };
        let now = self.clock.now();
        let delta = at.saturating_ns_since(now).max(MIN_PROGRAM_NS);
        let counts = regs::tmu_counts(delta);
        let ch = tmu0();
        ch.tcor.set(counts);
        ch.tcnt.set(counts);
        ch.tcr.set(regs::TCR_TPSC_DIV4 | regs::TCR_UNIE);
        let t = arch::tmu_regs();
        t.tstr.set(t.tstr.get() | regs::TSTR_STR0);
    }

    /// Runs every due timer and accounts the tick.
    pub(crate) fn timer_expire(&mut self) -> NextThread {
        let now = self.clock.now();
        let mut hint = NextThread::Same;
        while let Some(action) = self.timer.pop_expired(now) {
            hint = hint.combine(self.timer_fire(action));
        }
        if self.timer.tick_due(now) {
            hint = hint.combine(self.sched_tick());
        }
        self.timer_program();
        hint
    }

    fn timer_fire(&mut self, action: TimerAction) -> NextThread {
        match action {
            TimerAction::Wake(tid, seq) => {
                self.wake_if(tid, seq, WakeResult::Ready(0))
            }
            TimerAction::Timeout(tid, seq) => {
                self.wake_if(tid, seq, WakeResult::TimedOut)
            }
            TimerAction::Callback(f, data) => f(self, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::vec::Vec;

    std::thread_local! {
        static FIRED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    fn record(_: &mut Kernel, data: usize) -> NextThread {
        FIRED.with(|f| f.borrow_mut().push(data));
        NextThread::Same
    }

    fn fired() -> Vec<usize> {
        FIRED.with(|f| f.borrow().clone())
    }

    fn noop() -> TimerAction {
        TimerAction::Callback(record, 0)
    }

    #[test]
    fn callbacks_fire_in_deadline_order() {
        let mut k = testutil::boot();
        let now = k.clock.now();
        for (ms, tag) in [(3, 3), (1, 1), (2, 2)] {
            k.timer_schedule_at(now.saturating_add_ns(ms * 1_000_000), record, tag)
                .unwrap();
        }
        arch::advance_ns(1_500_000);
        k.handle_exception(irq::EXC_TMU0_TUNI0);
        assert_eq!(fired(), [1]);
        arch::advance_ns(5_000_000);
        k.handle_exception(irq::EXC_TMU0_TUNI0);
        assert_eq!(fired(), [1, 2, 3]);
        assert_eq!(k.timer.armed_count(), 0);
    }

    #[test]
    fn cancelled_timers_stay_quiet() {
        let mut k = testutil::boot();
        let at = k.clock.now().saturating_add_ns(1_000_000);
        let h = k.timer_schedule_at(at, record, 9).unwrap();
        k.timer_cancel(h).unwrap();
        assert_eq!(k.timer_cancel(h), Err(KernError::BadHandle));
        arch::advance_ns(2_000_000);
        k.handle_exception(irq::EXC_TMU0_TUNI0);
        assert!(fired().is_empty());
    }

    #[test]
    fn periodic_timers_rearm() {
        let mut k = testutil::boot();
        let h = k.timer_schedule_every(1_000_000, record, 4).unwrap();
        for _ in 0..3 {
            arch::advance_ns(1_000_000);
            k.handle_exception(irq::EXC_TMU0_TUNI0);
        }
        assert_eq!(fired(), [4, 4, 4]);
        assert!(k.timer.is_armed(h));
        assert_eq!(
            k.timer_schedule_every(0, record, 0),
            Err(KernError::InvalidArgument)
        );
    }

    #[test]
    fn channel_is_programmed_for_the_nearest_event() {
        let mut k = testutil::boot();
        let at = k.clock.now().saturating_add_ns(1_000_000);
        k.timer_schedule_at(at, record, 0).unwrap();
        let t = arch::tmu_regs();
        assert_ne!(t.tstr.get() & regs::TSTR_STR0, 0);
        let counts = t.ch[0].tcor.get();
        assert!((12_000..=12_500).contains(&counts), "{counts}");
        assert_ne!(t.ch[0].tcr.get() & regs::TCR_UNIE, 0);
    }

    #[test]
    fn idle_timer_stops_the_channel() {
        let mut k = testutil::boot();
        k.set_hz(0);
        assert_eq!(arch::tmu_regs().tstr.get() & regs::TSTR_STR0, 0);
        assert!(!k.sched.preempt_enabled());
    }

    #[test]
    fn ticks_drive_preemption() {
        let mut k = testutil::boot();
        k.set_hz(100);
        let a = testutil::spawn(&mut k, "a");
        for _ in 0..2 {
            arch::advance_ns(10_000_000);
            k.handle_exception(irq::EXC_TMU0_TUNI0);
        }
        assert_eq!(k.current(), a);
        assert_eq!(k.timer.ticks(), 2);
    }

    #[test]
    fn slots_run_out() {
        let mut t = Timer::new();
        for i in 0..MAX_TIMERS {
            t.schedule_at(Timestamp::from(i as u64), noop()).unwrap();
        }
        assert_eq!(
            t.schedule_at(Timestamp::ZERO, noop()).err(),
            Some(KernError::ResourceExhausted)
        );
    }

    #[test]
    fn heap_survives_churn() {
        let mut t = Timer::new();
        for i in 0..4 * HEAP_LEN as u64 {
            let h = t.schedule_at(Timestamp::from(i), noop()).unwrap();
            t.cancel(h).unwrap();
        }
        let keep = t.schedule_at(Timestamp::from(7), noop()).unwrap();
        assert_eq!(t.next_deadline(), Some(Timestamp::from(7)));
        assert!(t.pop_expired(Timestamp::from(7)).is_some());
        assert!(!t.is_armed(keep));
        assert_eq!(t.next_deadline(), None);
    }

    proptest! {
        #[test]
        fn expiry_is_ordered(deadlines in proptest::collection::vec(0u64..1_000_000, 1..MAX_TIMERS)) {
            let mut t = Timer::new();
            for (i, d) in deadlines.iter().enumerate() {
                t.schedule_at(Timestamp::from(*d), TimerAction::Callback(record, i)).unwrap();
            }
            let mut last = 0;
            let mut n = 0;
            while let Some(TimerAction::Callback(_, i)) = t.pop_expired(Timestamp::MAX) {
                prop_assert!(deadlines[i] >= last);
                last = deadlines[i];
                n += 1;
            }
            prop_assert_eq!(n, deadlines.len());
        }
    }
}
