// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads and the scheduler.
//!
//! Threads live in a fixed table; a `ThreadId` is the table index plus the
//! slot's generation, so stale ids are caught on use. The run queue is a
//! min-heap of `(priority, sequence, index)`: lower priority numbers run
//! first, and within a priority the lower sequence number wins. Putting a
//! thread at the back of its priority class takes a fresh increasing
//! sequence, putting it at the front (a preempted thread) a fresh
//! decreasing one. Entries are not removed when a thread leaves the queue;
//! they are recognized as stale by their sequence number instead.
//!
//! Blocked threads record the wait channel they sleep on. Waking a channel
//! picks its waiters in the order they blocked.
//!
//! Everything here runs with the interrupted thread's registers already
//! saved in its `SavedState`; "switching" means changing which state the
//! exception return path reloads.

use abi::{Generation, KernError, LogLevel, Priority, ThreadId};
use bitflags::bitflags;
use heapless::binary_heap::{BinaryHeap, Min};

use crate::arch::{self, SavedState};
use crate::err::{KernResult, Wait, WakeResult};
use crate::fail;
use crate::irq;
use crate::kconfig::{DEFAULT_PRIORITY, MAX_THREADS, MAX_TLS_KEYS, THREAD_STACK_SIZE};
use crate::mmu::ContextHandle;
use crate::startup::Kernel;
use crate::time::Timestamp;
use crate::timer::{TimerAction, TimerHandle};
use crate::tls::{KeyTable, TlsTemplate};
use crate::util::{align_down, align_up};

/// Thread entry point: gets the creation argument, returns the exit value.
pub type ThreadEntry = fn(usize) -> usize;

/// Exit value of a cancelled thread.
pub const CANCELED: usize = usize::MAX;
pub const LABEL_LEN: usize = 32;
/// Scheduler ticks a thread may run before its peers get a turn.
pub const QUANTUM_TICKS: u32 = 2;
/// Smallest stack a caller may supply.
pub const MIN_STACK_SIZE: usize = 0x400;

const RUNQ_LEN: usize = 2 * MAX_THREADS;
const BOOT_INDEX: usize = 0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Runnable,
    Running,
    Blocked,
    Sleeping,
    Zombie,
}

/// Something threads block on, allocated by the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitChan(u32);

/// Return value from operations that can have scheduling implications.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// It's fine to keep running whatever thread we were just running.
    Same,
    /// We need to switch threads, but this routine has not concluded which
    /// one should now run.
    Other,
    /// We need to switch to the thread in this table slot.
    Specific(usize),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific thread recommendations that *don't* agree get
            // downgraded to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ThreadFlags: u8 {
        /// Reclaimed on exit; cannot be joined.
        const DETACHED = 1 << 0;
        const CANCEL_PENDING = 1 << 1;
        const IDLE = 1 << 2;
        const BOOT = 1 << 3;
    }
}

/// Creation attributes.
#[derive(Clone, Debug)]
pub struct ThreadAttrs<'a> {
    pub label: &'a str,
    pub priority: Priority,
    pub detached: bool,
    /// Caller-provided stack as `(base, size)`.
    pub stack: Option<(usize, usize)>,
}

impl Default for ThreadAttrs<'_> {
    fn default() -> Self {
        Self {
            label: "",
            priority: DEFAULT_PRIORITY,
            detached: false,
            stack: None,
        }
    }
}

/// Internal representation of a thread.
#[derive(Debug)]
pub struct Thread {
    /// Saved machine state of the user program.
    pub save: SavedState,
    id: ThreadId,
    state: ThreadState,
    priority: Priority,
    flags: ThreadFlags,
    label: heapless::String<LABEL_LEN>,
    stack: (usize, usize),
    tls_base: usize,
    run_seq: i64,
    wait_chan: Option<WaitChan>,
    wait_seq: u64,
    timeout: Option<TimerHandle>,
    deadline: Option<Timestamp>,
    wake: Option<WakeResult>,
    joiner: Option<(ThreadId, u64)>,
    retval: usize,
    quantum: u32,
    pub(crate) specific: [usize; MAX_TLS_KEYS],
    mmu_ctx: Option<ContextHandle>,
}

impl Thread {
    fn new(id: ThreadId, label: &str, priority: Priority, flags: ThreadFlags) -> Self {
        let mut l = heapless::String::new();
        for c in label.chars() {
            if l.push(c).is_err() {
                break;
            }
        }
        Self {
            save: SavedState::default(),
            id,
            state: ThreadState::Runnable,
            priority,
            flags,
            label: l,
            stack: (0, 0),
            tls_base: 0,
            run_seq: 0,
            wait_chan: None,
            wait_seq: 0,
            timeout: None,
            deadline: None,
            wake: None,
            joiner: None,
            retval: 0,
            quantum: QUANTUM_TICKS,
            specific: [0; MAX_TLS_KEYS],
            mmu_ctx: None,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stack as `(base, size)`.
    pub fn stack(&self) -> (usize, usize) {
        self.stack
    }

    /// Address of the TLS block; GBR holds this while the thread runs.
    pub fn tls_base(&self) -> usize {
        self.tls_base
    }

    pub fn wait_chan(&self) -> Option<WaitChan> {
        self.wait_chan
    }

    /// Deadline of the current timed wait or sleep.
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn mmu_context(&self) -> Option<ContextHandle> {
        self.mmu_ctx
    }

    fn is_waiting(&self) -> bool {
        matches!(self.state, ThreadState::Blocked | ThreadState::Sleeping)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
struct RunEntry {
    prio: u8,
    seq: i64,
    index: u8,
}

/// Stack and TLS memory owned by a table slot, kept across reuse.
#[derive(Copy, Clone, Debug)]
struct SlotMem {
    base: usize,
    size: usize,
}

pub struct Scheduler {
    threads: [Option<Thread>; MAX_THREADS],
    generations: [Generation; MAX_THREADS],
    slot_mem: [Option<SlotMem>; MAX_THREADS],
    runq: BinaryHeap<RunEntry, Min, RUNQ_LEN>,
    current: usize,
    idle: usize,
    back_seq: i64,
    front_seq: i64,
    wait_seq: u64,
    next_chan: u32,
    preempt: bool,
    pub(crate) tls: TlsTemplate,
    pub(crate) keys: KeyTable,
}

impl Scheduler {
    pub const fn new() -> Self {
        const EMPTY: Option<Thread> = None;
        Self {
            threads: [EMPTY; MAX_THREADS],
            generations: [Generation::ZERO; MAX_THREADS],
            slot_mem: [None; MAX_THREADS],
            runq: BinaryHeap::new(),
            current: BOOT_INDEX,
            idle: BOOT_INDEX,
            back_seq: 0,
            front_seq: 0,
            wait_seq: 0,
            next_chan: 1,
            preempt: false,
            tls: TlsTemplate::EMPTY,
            keys: KeyTable::new(),
        }
    }

    /// Whether a timer tick or a wakeup may take the CPU away from the
    /// running thread.
    pub fn preempt_enabled(&self) -> bool {
        self.preempt
    }

    pub(crate) fn set_preempt(&mut self, on: bool) {
        self.preempt = on;
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &Thread {
        match &self.threads[self.current] {
            Some(t) => t,
            None => fail::die("no current thread"),
        }
    }

    pub fn current_mut(&mut self) -> &mut Thread {
        match &mut self.threads[self.current] {
            Some(t) => t,
            None => fail::die("no current thread"),
        }
    }

    pub fn current_id(&self) -> ThreadId {
        self.current().id
    }

    pub fn current_save(&self) -> &SavedState {
        &self.current().save
    }

    pub fn current_save_mut(&mut self) -> &mut SavedState {
        &mut self.current_mut().save
    }

    pub fn idle_index(&self) -> usize {
        self.idle
    }

    pub fn thread(&self, idx: usize) -> Option<&Thread> {
        self.threads.get(idx)?.as_ref()
    }

    pub fn thread_mut(&mut self, idx: usize) -> Option<&mut Thread> {
        self.threads.get_mut(idx)?.as_mut()
    }

    /// Resolves `tid` to a table index, checking the generation.
    pub fn lookup(&self, tid: ThreadId) -> KernResult<usize> {
        let i = tid.index();
        match self.thread(i) {
            Some(t) if t.id == tid => Ok(i),
            _ => Err(KernError::BadHandle),
        }
    }

    pub fn get(&self, tid: ThreadId) -> KernResult<&Thread> {
        let i = self.lookup(tid)?;
        self.thread(i).ok_or(KernError::BadHandle)
    }

    pub fn get_mut(&mut self, tid: ThreadId) -> KernResult<&mut Thread> {
        let i = self.lookup(tid)?;
        self.thread_mut(i).ok_or(KernError::BadHandle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thread> {
        self.threads.iter().flatten()
    }

    pub(crate) fn for_each_thread_mut(&mut self, mut f: impl FnMut(&mut Thread)) {
        self.threads.iter_mut().flatten().for_each(|t| f(t));
    }

    fn is_running(&self, idx: usize) -> bool {
        self.thread(idx)
            .is_some_and(|t| t.state == ThreadState::Running)
    }

    /// Allocates a fresh wait channel.
    pub fn new_chan(&mut self) -> WaitChan {
        let c = WaitChan(self.next_chan);
        self.next_chan = self.next_chan.wrapping_add(1).max(1);
        c
    }

    /// The thread that has waited longest on `chan`.
    pub fn first_waiter(&self, chan: WaitChan) -> Option<usize> {
        self.threads
            .iter()
            .enumerate()
            .filter_map(|(i, t)| Some((i, t.as_ref()?)))
            .filter(|(_, t)| t.is_waiting() && t.wait_chan == Some(chan))
            .min_by_key(|(_, t)| t.wait_seq)
            .map(|(i, _)| i)
    }

    pub fn waiter_count(&self, chan: WaitChan) -> usize {
        self.iter()
            .filter(|t| t.is_waiting() && t.wait_chan == Some(chan))
            .count()
    }

    /// Whether `j` is still blocked in the join numbered `seq`. An
    /// interrupted or cancelled joiner has moved on.
    fn joiner_waiting(&self, j: ThreadId, seq: u64) -> bool {
        self.get(j)
            .is_ok_and(|t| t.state == ThreadState::Blocked && t.wait_seq == seq)
    }

    /// Whether some thread is blocked joining slot `idx`.
    fn is_joined(&self, idx: usize) -> bool {
        self.thread(idx)
            .and_then(|t| t.joiner)
            .is_some_and(|(j, seq)| self.joiner_waiting(j, seq))
    }

    fn next_wait_seq(&mut self) -> u64 {
        self.wait_seq += 1;
        self.wait_seq
    }

    fn alloc_slot(&self) -> Option<usize> {
        self.threads.iter().position(Option::is_none)
    }

    /// Frees slot `idx`, invalidating outstanding ids for it.
    fn reclaim(&mut self, idx: usize) {
        self.threads[idx] = None;
        self.generations[idx] = self.generations[idx].next();
    }

    /// Puts a runnable thread on the run queue.
    fn enqueue(&mut self, idx: usize, front: bool) {
        let seq = if front {
            self.front_seq -= 1;
            self.front_seq
        } else {
            self.back_seq += 1;
            self.back_seq
        };
        let Some(t) = self.threads[idx].as_mut() else {
            return;
        };
        t.state = ThreadState::Runnable;
        t.run_seq = seq;
        let e = RunEntry {
            prio: t.priority.0,
            seq,
            index: idx as u8,
        };
        if self.runq.push(e).is_err() {
            self.rebuild_runq();
        }
    }

    /// Drops stale entries by rebuilding the queue from the thread table.
    /// Every runnable thread, including one just marked, gets its entry.
    fn rebuild_runq(&mut self) {
        self.runq.clear();
        for (i, t) in self.threads.iter().enumerate() {
            if let Some(t) = t {
                if t.state == ThreadState::Runnable {
                    // Cannot fail: there are fewer threads than entries.
                    self.runq
                        .push(RunEntry {
                            prio: t.priority.0,
                            seq: t.run_seq,
                            index: i as u8,
                        })
                        .ok();
                }
            }
        }
    }

    fn entry_valid(&self, e: &RunEntry) -> bool {
        self.thread(usize::from(e.index)).is_some_and(|t| {
            t.state == ThreadState::Runnable && t.run_seq == e.seq
        })
    }

    /// Priority of the best runnable thread.
    fn peek_priority(&mut self) -> Option<Priority> {
        while let Some(e) = self.runq.peek() {
            if self.entry_valid(e) {
                return Some(Priority(e.prio));
            }
            self.runq.pop();
        }
        None
    }

    /// Takes the best runnable thread off the queue and makes it current.
    fn select(&mut self) -> usize {
        while let Some(e) = self.runq.pop() {
            if !self.entry_valid(&e) {
                continue;
            }
            let idx = usize::from(e.index);
            if let Some(t) = self.threads[idx].as_mut() {
                t.state = ThreadState::Running;
                t.quantum = QUANTUM_TICKS;
            }
            self.current = idx;
            return idx;
        }
        fail::die("run queue empty")
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of the idle thread.
fn idle_main(_: usize) -> usize {
    loop {
        arch::idle_wait();
        arch::thread_yield();
    }
}

impl Kernel {
    /// Sets up the boot thread, which is whatever is running now, and the
    /// idle thread.
    pub(crate) fn sched_init(&mut self, tls: TlsTemplate, preempt: bool) -> KernResult<()> {
        self.sched = Scheduler::new();
        self.sched.tls = tls;
        self.sched.preempt = preempt;

        let mem = self.slot_memory(BOOT_INDEX, tls.block_size())?;
        // Safety: fresh memory from the program break.
        unsafe { tls.init_block(mem.base) };
        let id = ThreadId::for_index_and_gen(BOOT_INDEX, Generation::ZERO);
        let mut boot = Thread::new(id, "main", DEFAULT_PRIORITY, ThreadFlags::BOOT);
        boot.state = ThreadState::Running;
        boot.tls_base = mem.base;
        boot.save.sr = arch::context::SR_MD;
        boot.save.set_tls_base(mem.base);
        self.sched.threads[BOOT_INDEX] = Some(boot);
        self.sched.current = BOOT_INDEX;

        let attrs = ThreadAttrs {
            label: "idle",
            priority: Priority::IDLE,
            detached: true,
            stack: None,
        };
        let idle = self.spawn(idle_main, 0, &attrs, ThreadFlags::IDLE)?;
        self.sched.idle = idle.index();

        self.sched_traps();
        self.publish_current();
        dbglog!(
            LogLevel::Debug,
            "sched: up, preemption {}",
            if preempt { "on" } else { "off" }
        );
        Ok(())
    }

    pub(crate) fn sched_shutdown(&mut self) {
        let me = self.sched.current;
        for i in 0..MAX_THREADS {
            if i == me {
                continue;
            }
            if let Some(t) = self.sched.threads[i].as_mut() {
                if let Some(h) = t.timeout.take() {
                    self.timer.cancel(h).ok();
                }
                self.sched.reclaim(i);
            }
        }
        self.sched.runq.clear();
    }

    /// Memory for slot `idx`, reusing what the slot had when it is big
    /// enough.
    fn slot_memory(&mut self, idx: usize, need: usize) -> KernResult<SlotMem> {
        if let Some(m) = self.sched.slot_mem[idx] {
            if m.size >= need {
                return Ok(m);
            }
        }
        // The TLS block sits at the base and wants the template's alignment.
        let align = self.sched.tls.align.max(8);
        let size = align_up(need, 8);
        let ask = isize::try_from(size + align).map_err(|_| KernError::ResourceExhausted)?;
        let base = align_up(self.brk.sbrk(ask)?, align);
        let m = SlotMem { base, size };
        self.sched.slot_mem[idx] = Some(m);
        Ok(m)
    }

    fn spawn(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        attrs: &ThreadAttrs<'_>,
        flags: ThreadFlags,
    ) -> KernResult<ThreadId> {
        let idx = self
            .sched
            .alloc_slot()
            .ok_or(KernError::ResourceExhausted)?;
        let block = self.sched.tls.block_size();
        let (stack, tls_base) = match attrs.stack {
            Some(stack) => {
                let mem = self.slot_memory(idx, block)?;
                (stack, mem.base)
            }
            None => {
                let tls_len = align_up(block, 8);
                let mem = self.slot_memory(idx, tls_len + THREAD_STACK_SIZE)?;
                ((mem.base + tls_len, THREAD_STACK_SIZE), mem.base)
            }
        };
        // Safety: the block is part of this slot's memory.
        unsafe { self.sched.tls.init_block(tls_base) };

        let id = ThreadId::for_index_and_gen(idx, self.sched.generations[idx]);
        let mut t = Thread::new(id, attrs.label, attrs.priority, flags);
        if attrs.detached {
            t.flags |= ThreadFlags::DETACHED;
        }
        t.stack = stack;
        t.tls_base = tls_base;
        t.mmu_ctx = self.sched.thread(self.sched.current).and_then(|c| c.mmu_ctx);
        let sp = align_down(stack.0 + stack.1, 8);
        t.save = SavedState::for_thread(
            arch::thread_trampoline(),
            &[entry as usize, arg],
            sp,
            0,
            tls_base,
        );
        self.sched.threads[idx] = Some(t);
        self.sched.enqueue(idx, false);
        Ok(id)
    }

    /// Creates a thread running `entry(arg)`.
    pub fn thread_create(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        attrs: &ThreadAttrs<'_>,
    ) -> KernResult<ThreadId> {
        if attrs.priority == Priority::IDLE {
            return Err(KernError::InvalidArgument);
        }
        if let Some((base, size)) = attrs.stack {
            if base == 0 || base % 8 != 0 || size < MIN_STACK_SIZE {
                return Err(KernError::InvalidArgument);
            }
        }
        let id = self.spawn(entry, arg, attrs, ThreadFlags::empty())?;
        dbglog!(
            LogLevel::Debug,
            "thread {} '{}' created, priority {}",
            id,
            attrs.label,
            attrs.priority.0
        );
        let hint = self.wake_hint(id.index());
        self.finish(hint);
        Ok(id)
    }

    /// Ends the current thread with `retval`.
    pub fn thread_exit(&mut self, retval: usize) {
        let idx = self.sched.current;
        if idx == self.sched.idle {
            fail::die("idle thread exited");
        }
        self.exit_thread(idx, retval);
        self.schedule(NextThread::Other);
    }

    pub(crate) fn exit_thread(&mut self, idx: usize, retval: usize) {
        self.run_key_destructors(idx);
        let Some(t) = self.sched.threads[idx].as_mut() else {
            return;
        };
        if let Some(h) = t.timeout.take() {
            self.timer.cancel(h).ok();
        }
        t.state = ThreadState::Zombie;
        t.retval = retval;
        t.wait_chan = None;
        let id = t.id;
        let detached = t.flags.contains(ThreadFlags::DETACHED);
        let joiner = t.joiner.take();
        dbglog!(LogLevel::Debug, "thread {} exited with {:#x}", id, retval);
        match joiner {
            Some((j, seq)) if self.sched.joiner_waiting(j, seq) => {
                self.sched.reclaim(idx);
                // The caller switches away regardless.
                let _ = self.wake_if(j, seq, WakeResult::Ready(retval));
            }
            // A joiner that gave up leaves a zombie for the next join.
            _ if detached => self.sched.reclaim(idx),
            _ => {}
        }
    }

    /// Waits for `tid` to exit and returns its exit value.
    pub fn thread_join(&mut self, tid: ThreadId) -> KernResult<Wait<usize>> {
        if irq::inside_int() {
            return Err(KernError::WouldBlock);
        }
        let idx = self.sched.lookup(tid)?;
        if idx == self.sched.current {
            return Err(KernError::Deadlock);
        }
        let me = self.sched.current_id();
        if self.sched.is_joined(idx) {
            return Err(KernError::InvalidArgument);
        }
        let t = self.sched.thread(idx).ok_or(KernError::BadHandle)?;
        if t.flags.contains(ThreadFlags::DETACHED) {
            return Err(KernError::InvalidArgument);
        }
        if t.state == ThreadState::Zombie {
            let v = t.retval;
            self.sched.reclaim(idx);
            return Ok(Wait::Done(v));
        }
        let seq = self.block_current(None, None)?;
        if let Some(t) = self.sched.thread_mut(idx) {
            t.joiner = Some((me, seq));
        }
        Ok(Wait::Blocked)
    }

    /// Lets `tid` be reclaimed as soon as it exits.
    pub fn thread_detach(&mut self, tid: ThreadId) -> KernResult<()> {
        let idx = self.sched.lookup(tid)?;
        if self.sched.is_joined(idx) {
            return Err(KernError::InvalidArgument);
        }
        let t = self.sched.thread_mut(idx).ok_or(KernError::BadHandle)?;
        if t.flags.contains(ThreadFlags::DETACHED) {
            return Err(KernError::InvalidArgument);
        }
        t.joiner = None;
        if t.state == ThreadState::Zombie {
            self.sched.reclaim(idx);
        } else {
            t.flags |= ThreadFlags::DETACHED;
        }
        Ok(())
    }

    /// Requests cancellation of `tid`. The thread exits with `CANCELED` at
    /// its next cancellation point; a blocked thread is woken to get there.
    pub fn thread_cancel(&mut self, tid: ThreadId) -> KernResult<()> {
        let idx = self.sched.lookup(tid)?;
        let t = self.sched.thread_mut(idx).ok_or(KernError::BadHandle)?;
        if t.flags.contains(ThreadFlags::IDLE) {
            return Err(KernError::NotPermitted);
        }
        if t.state == ThreadState::Zombie {
            return Ok(());
        }
        t.flags |= ThreadFlags::CANCEL_PENDING;
        let hint = self.wake_thread(idx, WakeResult::Interrupted);
        self.finish(hint);
        Ok(())
    }

    /// Explicit cancellation point.
    pub fn test_cancel(&mut self) {
        self.cancellation_point().ok();
    }

    /// Exits the current thread if it has a cancellation request.
    fn cancellation_point(&mut self) -> KernResult<()> {
        if self
            .sched
            .current()
            .flags
            .contains(ThreadFlags::CANCEL_PENDING)
        {
            self.thread_exit(CANCELED);
            return Err(KernError::Interrupted);
        }
        Ok(())
    }

    /// Cuts a wait or sleep of `tid` short with `Interrupted`. Returns
    /// whether the thread was waiting.
    pub fn thread_interrupt(&mut self, tid: ThreadId) -> KernResult<bool> {
        let idx = self.sched.lookup(tid)?;
        let waiting = self.sched.thread(idx).is_some_and(Thread::is_waiting);
        let hint = self.wake_thread(idx, WakeResult::Interrupted);
        self.finish(hint);
        Ok(waiting)
    }

    pub fn thread_set_priority(&mut self, tid: ThreadId, prio: Priority) -> KernResult<()> {
        if prio == Priority::IDLE {
            return Err(KernError::InvalidArgument);
        }
        let idx = self.sched.lookup(tid)?;
        let t = self.sched.thread_mut(idx).ok_or(KernError::BadHandle)?;
        if t.flags.contains(ThreadFlags::IDLE) {
            return Err(KernError::NotPermitted);
        }
        t.priority = prio;
        let hint = match t.state {
            ThreadState::Runnable => {
                self.sched.enqueue(idx, false);
                self.wake_hint(idx)
            }
            ThreadState::Running => match self.sched.peek_priority() {
                Some(p) if self.sched.preempt && p.is_more_important_than(prio) => {
                    NextThread::Other
                }
                _ => NextThread::Same,
            },
            _ => NextThread::Same,
        };
        self.finish(hint);
        Ok(())
    }

    /// Runs `ctx`'s page tables whenever `tid` runs.
    pub fn thread_set_mmu_context(
        &mut self,
        tid: ThreadId,
        ctx: Option<ContextHandle>,
    ) -> KernResult<()> {
        if let Some(c) = ctx {
            self.mmu.context_asid(c)?;
        }
        self.sched.get_mut(tid)?.mmu_ctx = ctx;
        Ok(())
    }

    pub fn current(&self) -> ThreadId {
        self.sched.current_id()
    }

    pub fn thread_label(&self, tid: ThreadId) -> KernResult<&str> {
        Ok(self.sched.get(tid)?.label())
    }

    pub fn thread_state(&self, tid: ThreadId) -> KernResult<ThreadState> {
        Ok(self.sched.get(tid)?.state)
    }

    /// Visits every thread in table order.
    pub fn for_each_thread(&self, f: impl FnMut(&Thread)) {
        self.sched.iter().for_each(f);
    }

    /// Logs the thread table.
    pub fn thread_dump(&self) {
        dbglog!(LogLevel::Info, "tid    prio state     label");
        for t in self.sched.iter() {
            dbglog!(
                LogLevel::Info,
                "{:<6} {:<4} {:<9} {}",
                t.id,
                t.priority.0,
                state_name(t.state),
                t.label()
            );
        }
    }

    /// Gives the CPU to the next thread of the same or better priority.
    pub fn yield_now(&mut self) {
        let cur = self.sched.current;
        if self.sched.is_running(cur) {
            self.sched.enqueue(cur, false);
        }
        self.switch_to_next();
    }

    /// The result of the current thread's last wait.
    pub fn take_wake(&mut self) -> Option<WakeResult> {
        self.sched.current_mut().wake.take()
    }

    /// Applies a scheduling hint.
    pub fn schedule(&mut self, hint: NextThread) {
        let cur = self.sched.current;
        let running = self.sched.is_running(cur);
        if running && hint == NextThread::Same {
            return;
        }
        if running {
            self.sched.enqueue(cur, true);
        }
        self.switch_to_next();
    }

    /// Schedules now unless we are in an interrupt handler, whose hint the
    /// exception path applies on the way out.
    pub(crate) fn finish(&mut self, hint: NextThread) {
        if !irq::inside_int() {
            self.schedule(hint);
        }
    }

    fn switch_to_next(&mut self) {
        let next = self.sched.select();
        let ctx = self.sched.thread(next).and_then(|t| t.mmu_ctx);
        if let Some(ctx) = ctx {
            if self.mmu.current() != Some(ctx) && self.mmu.switch_context(ctx).is_err() {
                fail::die("thread has a dead MMU context");
            }
        }
        self.publish_current();
    }

    fn publish_current(&self) {
        let t = self.sched.current();
        // Safety: the thread table lives in the kernel, which stays put
        // once started, and the slot stays occupied while it is current.
        unsafe { arch::set_current_context(&t.save) }
    }

    /// Suspends the current thread on `chan` until woken, optionally with
    /// a deadline after which it wakes with `TimedOut`. Returns the wait's
    /// sequence number.
    pub(crate) fn block_current(
        &mut self,
        chan: Option<WaitChan>,
        deadline: Option<Timestamp>,
    ) -> KernResult<u64> {
        self.suspend(chan, ThreadState::Blocked, deadline)
    }

    /// Puts the current thread to sleep until `deadline`.
    pub(crate) fn sleep_current(&mut self, deadline: Timestamp) -> KernResult<u64> {
        self.suspend(None, ThreadState::Sleeping, Some(deadline))
    }

    fn suspend(
        &mut self,
        chan: Option<WaitChan>,
        state: ThreadState,
        deadline: Option<Timestamp>,
    ) -> KernResult<u64> {
        if irq::inside_int() {
            return Err(KernError::WouldBlock);
        }
        self.cancellation_point()?;
        let idx = self.sched.current;
        if idx == self.sched.idle {
            fail::die("idle thread tried to block");
        }
        let seq = self.sched.next_wait_seq();
        let id = self.sched.current_id();
        let timeout = match deadline {
            Some(d) => {
                let action = if state == ThreadState::Sleeping {
                    TimerAction::Wake(id, seq)
                } else {
                    TimerAction::Timeout(id, seq)
                };
                Some(self.timer.schedule_at(d, action)?)
            }
            None => None,
        };
        let t = self.sched.current_mut();
        t.state = state;
        t.wait_chan = chan;
        t.wait_seq = seq;
        t.timeout = timeout;
        t.deadline = deadline;
        t.wake = None;
        if timeout.is_some() {
            self.timer_program();
        }
        self.schedule(NextThread::Other);
        Ok(seq)
    }

    /// Makes a waiting thread runnable with `result`.
    pub(crate) fn wake_thread(&mut self, idx: usize, result: WakeResult) -> NextThread {
        let Some(t) = self.sched.thread_mut(idx) else {
            return NextThread::Same;
        };
        if !t.is_waiting() {
            return NextThread::Same;
        }
        t.wait_chan = None;
        t.deadline = None;
        t.wake = Some(result);
        t.save.set_ret(result.to_reg());
        if let Some(h) = t.timeout.take() {
            self.timer.cancel(h).ok();
        }
        self.sched.enqueue(idx, false);
        self.wake_hint(idx)
    }

    /// Wakes `tid` if it is still in the wait numbered `seq`.
    pub(crate) fn wake_if(&mut self, tid: ThreadId, seq: u64, result: WakeResult) -> NextThread {
        match self.sched.lookup(tid) {
            Ok(idx)
                if self
                    .sched
                    .thread(idx)
                    .is_some_and(|t| t.is_waiting() && t.wait_seq == seq) =>
            {
                self.wake_thread(idx, result)
            }
            _ => NextThread::Same,
        }
    }

    /// Wakes the longest waiter on `chan`.
    pub fn wake_one(&mut self, chan: WaitChan, result: WakeResult) -> (Option<ThreadId>, NextThread) {
        match self.sched.first_waiter(chan) {
            Some(idx) => {
                let id = self.sched.thread(idx).map(|t| t.id);
                (id, self.wake_thread(idx, result))
            }
            None => (None, NextThread::Same),
        }
    }

    /// Wakes every waiter on `chan`, oldest first.
    pub fn wake_all(&mut self, chan: WaitChan, result: WakeResult) -> (usize, NextThread) {
        let mut n = 0;
        let mut hint = NextThread::Same;
        while let Some(idx) = self.sched.first_waiter(chan) {
            hint = hint.combine(self.wake_thread(idx, result));
            n += 1;
        }
        (n, hint)
    }

    fn wake_hint(&self, idx: usize) -> NextThread {
        // The current slot is empty while an exiting thread is on its way
        // out.
        let Some(cur) = self.sched.thread(self.sched.current) else {
            return NextThread::Other;
        };
        if cur.flags.contains(ThreadFlags::IDLE) || cur.state != ThreadState::Running {
            return NextThread::Other;
        }
        match self.sched.thread(idx) {
            Some(t) if self.sched.preempt && t.priority.is_more_important_than(cur.priority) => {
                NextThread::Other
            }
            _ => NextThread::Same,
        }
    }

    /// Accounts one timer tick against the running thread's quantum.
    pub(crate) fn sched_tick(&mut self) -> NextThread {
        if !self.sched.preempt {
            return NextThread::Same;
        }
        let cur = self.sched.current;
        if !self.sched.is_running(cur) {
            return NextThread::Same;
        }
        let t = self.sched.current_mut();
        t.quantum = t.quantum.saturating_sub(1);
        if t.quantum > 0 {
            return NextThread::Same;
        }
        t.quantum = QUANTUM_TICKS;
        let prio = t.priority;
        match self.sched.peek_priority() {
            Some(p) if !prio.is_more_important_than(p) => {
                self.sched.enqueue(cur, false);
                NextThread::Other
            }
            _ => NextThread::Same,
        }
    }

    /// Installs the trap handlers threads use to yield and exit.
    pub(crate) fn sched_traps(&mut self) {
        self.irq
            .set_trapa_handler(irq::TRAPA_YIELD, Some(trap_yield), 0);
        self.irq.set_trapa_handler(irq::TRAPA_EXIT, Some(trap_exit), 0);
    }
}

fn trap_yield(k: &mut Kernel, _: u32, _: usize) -> NextThread {
    let cur = k.sched.current;
    if k.sched.is_running(cur) {
        k.sched.enqueue(cur, false);
    }
    NextThread::Other
}

fn trap_exit(k: &mut Kernel, _: u32, _: usize) -> NextThread {
    let idx = k.sched.current;
    if idx == k.sched.idle {
        fail::die("idle thread exited");
    }
    let retval = k.sched.current_save().arg(0);
    k.exit_thread(idx, retval);
    NextThread::Other
}

fn state_name(s: ThreadState) -> &'static str {
    match s {
        ThreadState::Runnable => "runnable",
        ThreadState::Running => "running",
        ThreadState::Blocked => "blocked",
        ThreadState::Sleeping => "sleeping",
        ThreadState::Zombie => "zombie",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, boot, spawn, spawn_with};

    #[test]
    fn boot_leaves_main_running_and_idle_queued() {
        let k = boot();
        assert_eq!(k.thread_label(k.current()), Ok("main"));
        assert_eq!(k.sched.current().state(), ThreadState::Running);
        let idle = k.sched.thread(k.sched.idle_index()).unwrap();
        assert_eq!(idle.priority(), Priority::IDLE);
        assert_eq!(idle.state(), ThreadState::Runnable);
        assert_eq!(arch::current_tls_base(), k.sched.current().tls_base());
    }

    #[test]
    fn new_thread_context_points_at_trampoline() {
        let mut k = boot();
        let id = spawn_with(&mut k, "w", DEFAULT_PRIORITY, 42);
        let t = k.sched.get(id).unwrap();
        assert_eq!(t.save.resume_pc(), arch::thread_trampoline());
        assert_eq!(t.save.arg(0), testutil::entry as usize);
        assert_eq!(t.save.arg(1), 42);
        let (base, size) = t.stack();
        assert_eq!(t.save.sp(), align_down(base + size, 8));
        assert_eq!(t.save.tls_base(), t.tls_base());
    }

    #[test]
    fn round_robin_within_priority() {
        let mut k = boot();
        let main = k.current();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        k.yield_now();
        assert_eq!(k.current(), a);
        k.yield_now();
        assert_eq!(k.current(), b);
        k.yield_now();
        assert_eq!(k.current(), main);
    }

    #[test]
    fn gbr_is_reloaded_on_every_switch() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        let before = arch::switch_count();
        k.yield_now();
        assert_eq!(arch::switch_count(), before + 1);
        assert_eq!(arch::current_tls_base(), k.sched.get(a).unwrap().tls_base());
    }

    #[test]
    fn more_important_thread_preempts_on_create() {
        let mut k = boot();
        k.sched.set_preempt(true);
        let hi = spawn_with(&mut k, "hi", Priority(1), 0);
        assert_eq!(k.current(), hi);
    }

    #[test]
    fn cooperative_mode_never_preempts() {
        let mut k = boot();
        k.sched.set_preempt(false);
        let main = k.current();
        let hi = spawn_with(&mut k, "hi", Priority(1), 0);
        assert_eq!(k.current(), main);
        k.yield_now();
        assert_eq!(k.current(), hi);
    }

    #[test]
    fn join_collects_exit_value() {
        let mut k = boot();
        let main = k.current();
        let w = spawn(&mut k, "w");
        assert!(k.thread_join(w).unwrap().is_blocked());
        assert_eq!(k.current(), w);
        k.thread_exit(99);
        assert_eq!(k.current(), main);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(99)));
        assert_eq!(k.thread_state(w), Err(KernError::BadHandle));
    }

    #[test]
    fn join_of_zombie_returns_at_once() {
        let mut k = boot();
        let w = spawn(&mut k, "w");
        k.yield_now();
        k.thread_exit(5);
        assert_eq!(k.thread_state(w), Ok(ThreadState::Zombie));
        assert_eq!(k.thread_join(w), Ok(Wait::Done(5)));
        assert_eq!(k.thread_join(w), Err(KernError::BadHandle));
    }

    #[test]
    fn interrupted_join_can_be_retried() {
        let mut k = boot();
        let main = k.current();
        let w = spawn(&mut k, "w");
        assert!(k.thread_join(w).unwrap().is_blocked());
        assert_eq!(k.current(), w);
        assert_eq!(k.thread_interrupt(main), Ok(true));

        testutil::run(&mut k, main);
        assert_eq!(k.take_wake(), Some(WakeResult::Interrupted));
        assert!(k.thread_join(w).unwrap().is_blocked());
        assert_eq!(k.current(), w);
        k.thread_exit(42);
        assert_eq!(k.current(), main);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(42)));
        assert_eq!(k.thread_state(w), Err(KernError::BadHandle));
    }

    #[test]
    fn target_outliving_an_abandoned_join_stays_joinable() {
        let mut k = boot();
        let main = k.current();
        let w = spawn(&mut k, "w");
        let other = spawn(&mut k, "other");
        assert!(k.thread_join(w).unwrap().is_blocked());
        testutil::run(&mut k, other);
        k.thread_cancel(main).unwrap();

        testutil::run(&mut k, w);
        k.thread_exit(9);
        assert_eq!(k.thread_state(w), Ok(ThreadState::Zombie));
        testutil::run(&mut k, other);
        assert_eq!(k.thread_join(w), Ok(Wait::Done(9)));
    }

    #[test]
    fn detach_after_an_abandoned_join() {
        let mut k = boot();
        let main = k.current();
        let w = spawn(&mut k, "w");
        assert!(k.thread_join(w).unwrap().is_blocked());
        assert_eq!(k.thread_interrupt(main), Ok(true));
        testutil::run(&mut k, main);
        assert_eq!(k.take_wake(), Some(WakeResult::Interrupted));
        k.thread_detach(w).unwrap();

        testutil::run(&mut k, w);
        k.thread_exit(0);
        assert_eq!(k.thread_state(w), Err(KernError::BadHandle));
    }

    #[test]
    fn join_misuse() {
        let mut k = boot();
        let me = k.current();
        assert_eq!(k.thread_join(me), Err(KernError::Deadlock));
        let w = spawn(&mut k, "w");
        k.thread_detach(w).unwrap();
        assert_eq!(k.thread_join(w), Err(KernError::InvalidArgument));
    }

    #[test]
    fn detached_threads_are_reclaimed_on_exit() {
        let mut k = boot();
        let w = spawn(&mut k, "w");
        k.thread_detach(w).unwrap();
        k.yield_now();
        k.thread_exit(0);
        assert_eq!(k.thread_state(w), Err(KernError::BadHandle));
        // The slot comes back with a new generation.
        let again = spawn(&mut k, "again");
        assert_eq!(again.index(), w.index());
        assert_ne!(again, w);
    }

    #[test]
    fn slots_run_out() {
        let mut k = boot();
        // Boot and idle take two slots.
        for _ in 2..MAX_THREADS {
            spawn(&mut k, "filler");
        }
        let r = k.thread_create(testutil::entry, 0, &ThreadAttrs::default());
        assert_eq!(r, Err(KernError::ResourceExhausted));
    }

    #[test]
    fn idle_priority_is_reserved() {
        let mut k = boot();
        let attrs = ThreadAttrs {
            priority: Priority::IDLE,
            ..ThreadAttrs::default()
        };
        assert_eq!(
            k.thread_create(testutil::entry, 0, &attrs),
            Err(KernError::InvalidArgument)
        );
    }

    #[test]
    fn cancel_takes_effect_at_a_cancellation_point() {
        let mut k = boot();
        let main = k.current();
        let w = spawn(&mut k, "w");
        k.yield_now();
        let chan = k.sched.new_chan();
        k.block_current(Some(chan), None).unwrap();
        assert_eq!(k.current(), main);
        k.thread_cancel(w).unwrap();
        assert_eq!(k.thread_state(w), Ok(ThreadState::Runnable));
        k.yield_now();
        assert_eq!(k.current(), w);
        assert_eq!(k.take_wake(), Some(WakeResult::Interrupted));
        assert_eq!(k.block_current(Some(chan), None), Err(KernError::Interrupted));
        assert_eq!(k.current(), main);
        assert_eq!(k.thread_join(w), Ok(Wait::Done(CANCELED)));
    }

    #[test]
    fn wakes_are_fifo() {
        let mut k = boot();
        let a = spawn(&mut k, "a");
        let b = spawn(&mut k, "b");
        let chan = k.sched.new_chan();
        k.yield_now();
        k.block_current(Some(chan), None).unwrap(); // a
        k.block_current(Some(chan), None).unwrap(); // b
        assert_eq!(k.sched.waiter_count(chan), 2);
        let (first, _) = k.wake_one(chan, WakeResult::Ready(1));
        assert_eq!(first, Some(a));
        let (n, _) = k.wake_all(chan, WakeResult::Ready(2));
        assert_eq!(n, 1);
        assert_eq!(k.thread_state(b), Ok(ThreadState::Runnable));
    }

    #[test]
    fn quantum_expiry_rotates_peers() {
        let mut k = boot();
        k.sched.set_preempt(true);
        let main = k.current();
        let a = spawn(&mut k, "a");
        for _ in 0..QUANTUM_TICKS - 1 {
            assert_eq!(k.sched_tick(), NextThread::Same);
        }
        let hint = k.sched_tick();
        assert_eq!(hint, NextThread::Other);
        k.schedule(hint);
        assert_eq!(k.current(), a);
        assert_eq!(k.thread_state(main), Ok(ThreadState::Runnable));
    }

    #[test]
    fn lower_priority_peers_do_not_steal_the_cpu() {
        let mut k = boot();
        k.sched.set_preempt(true);
        let main = k.current();
        spawn_with(&mut k, "low", Priority(200), 0);
        for _ in 0..QUANTUM_TICKS * 3 {
            let h = k.sched_tick();
            k.schedule(h);
        }
        assert_eq!(k.current(), main);
    }

    #[test]
    fn blocking_in_interrupt_context_is_refused() {
        let mut k = boot();
        let chan = k.sched.new_chan();
        arch::exception_enter();
        assert_eq!(k.block_current(Some(chan), None), Err(KernError::WouldBlock));
        arch::exception_leave();
    }

    #[test]
    fn set_priority_reorders() {
        let mut k = boot();
        k.sched.set_preempt(true);
        let w = spawn(&mut k, "w");
        k.thread_set_priority(w, Priority(0)).unwrap();
        assert_eq!(k.current(), w);
        let idle = k.sched.thread(k.sched.idle_index()).unwrap().id();
        assert_eq!(k.thread_set_priority(idle, Priority(3)), Err(KernError::NotPermitted));
    }

    #[test]
    fn labels_are_truncated() {
        let mut k = boot();
        let long = "a-very-long-thread-label-that-keeps-going";
        let attrs = ThreadAttrs {
            label: long,
            ..ThreadAttrs::default()
        };
        let id = k.thread_create(testutil::entry, 0, &attrs).unwrap();
        assert_eq!(k.thread_label(id), Ok(&long[..LABEL_LEN]));
        let mut n = 0;
        k.for_each_thread(|_| n += 1);
        assert_eq!(n, 3);
    }

    #[test]
    fn exit_trap_reads_r4() {
        let mut k = boot();
        let w = spawn(&mut k, "w");
        k.yield_now();
        k.sched.current_save_mut().set_arg(0, 17);
        arch::set_trapa(irq::TRAPA_EXIT);
        k.handle_exception(irq::EXC_TRAPA);
        assert_eq!(k.thread_join(w), Ok(Wait::Done(17)));
    }

    #[test]
    fn combine_hints() {
        use NextThread::*;
        assert_eq!(Same.combine(Same), Same);
        assert_eq!(Same.combine(Other), Other);
        assert_eq!(Specific(3).combine(Other), Specific(3));
        assert_eq!(Specific(3).combine(Specific(4)), Other);
    }
}
