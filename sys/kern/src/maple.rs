// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel side of the maple bus.
//!
//! The bus itself is `drv_maple::MapleBus`; this module owns the instance
//! and drives it. The level-6 Holly interrupt starts a cycle on vertical
//! blank and completes it on DMA end. Events the cycle produced are
//! delivered by the `maple` thread, which sleeps on a wait channel between
//! cycles, so user callbacks never run in interrupt context.

use abi::{InitFlags, KernError, LogLevel, Priority, ThreadId};
use drv_maple::{controller, keyboard, mouse, purupuru, MapleBus, MapleDriver};

use crate::arch::{self, MapleDma};
use crate::err::{KernResult, Wait, WakeResult};
use crate::irq;
use crate::kconfig::MAPLE_DETACH_THRESHOLD;
use crate::regs;
use crate::startup::Kernel;
use crate::thread::{NextThread, ThreadAttrs, WaitChan};

/// Init flags that ask for the bus.
pub const PERIPHERALS: InitFlags = InitFlags::CONTROLLER
    .union(InitFlags::KEYBOARD)
    .union(InitFlags::MOUSE)
    .union(InitFlags::LIGHTGUN)
    .union(InitFlags::VMU)
    .union(InitFlags::PURUPURU)
    .union(InitFlags::SIP)
    .union(InitFlags::DREAMEYE);

/// Drivers by the flag that selects them, in binding order. Flags without
/// an entry still bring the bus up; their devices attach unbound.
static DRIVERS: [(InitFlags, &MapleDriver); 4] = [
    (InitFlags::CONTROLLER, &controller::DRIVER),
    (InitFlags::KEYBOARD, &keyboard::DRIVER),
    (InitFlags::MOUSE, &mouse::DRIVER),
    (InitFlags::PURUPURU, &purupuru::DRIVER),
];

const ASIC_EVENTS: u32 = regs::ASIC_EVT_VBLANK_IN | regs::ASIC_EVT_MAPLE_DMA;

/// Event thread priority: ahead of ordinary threads, so input is not
/// starved by a busy main loop.
const EVENT_PRIORITY: Priority = Priority(5);

pub struct MapleState {
    bus: Option<MapleBus<MapleDma>>,
    chan: Option<WaitChan>,
    thread: Option<ThreadId>,
}

impl MapleState {
    pub const fn new() -> Self {
        Self {
            bus: None,
            chan: None,
            thread: None,
        }
    }

    pub fn bus(&self) -> Option<&MapleBus<MapleDma>> {
        self.bus.as_ref()
    }

    pub fn bus_mut(&mut self) -> Option<&mut MapleBus<MapleDma>> {
        self.bus.as_mut()
    }

    /// The thread delivering bus events.
    pub fn event_thread(&self) -> Option<ThreadId> {
        self.thread
    }
}

impl Default for MapleState {
    fn default() -> Self {
        Self::new()
    }
}

fn maple_log(level: LogLevel, args: core::fmt::Arguments<'_>) {
    crate::dbgio::DBGIO.log(level, args);
}

fn maple_irq(k: &mut Kernel, _: u32, _: usize) -> NextThread {
    let pending = arch::asic_pending() & ASIC_EVENTS;
    arch::asic_ack(pending);
    let Some(bus) = k.maple.bus.as_mut() else {
        return NextThread::Same;
    };
    if pending & regs::ASIC_EVT_MAPLE_DMA != 0 {
        bus.complete_cycle();
    }
    if pending & regs::ASIC_EVT_VBLANK_IN != 0 {
        bus.start_cycle();
    }
    if bus.pending_events() == 0 {
        return NextThread::Same;
    }
    match k.maple.chan {
        Some(chan) => k.wake_all(chan, WakeResult::Ready(0)).1,
        None => NextThread::Same,
    }
}

/// Body of the event thread.
fn event_main(_: usize) -> usize {
    loop {
        arch::kcall(kcall_maple_wait, 0);
    }
}

fn kcall_maple_wait(k: &mut Kernel, _: usize) -> KernResult<Wait<usize>> {
    k.maple_wait()
}

impl Kernel {
    pub(crate) fn maple_init(&mut self) -> KernResult<()> {
        let mut bus = MapleBus::new(arch::maple_dma());
        bus.set_log(maple_log);
        bus.set_detach_threshold(MAPLE_DETACH_THRESHOLD);
        for &(flag, driver) in DRIVERS.iter() {
            if self.flags.contains(flag) {
                bus.register_driver(driver)?;
            }
        }
        bus.init();
        self.maple.bus = Some(bus);
        self.maple.chan = Some(self.sched.new_chan());

        let attrs = ThreadAttrs {
            label: "maple",
            priority: EVENT_PRIORITY,
            detached: true,
            stack: None,
        };
        self.maple.thread = Some(self.thread_create(event_main, 0, &attrs)?);

        self.irq
            .set_kernel_handler(irq::EXC_IRQ_LEVEL6, maple_irq, 0);
        arch::asic_enable(ASIC_EVENTS);
        dbglog!(LogLevel::Info, "maple: up");
        Ok(())
    }

    /// Detaches everything and delivers the resulting events before the
    /// bus goes away.
    pub(crate) fn maple_shutdown(&mut self) {
        let Some(mut bus) = self.maple.bus.take() else {
            return;
        };
        arch::asic_disable(ASIC_EVENTS);
        self.irq.clear_kernel_handler(irq::EXC_IRQ_LEVEL6);
        bus.shutdown();
        bus.dispatch_events();
        if let Some(tid) = self.maple.thread.take() {
            self.thread_cancel(tid).ok();
        }
        self.maple.chan = None;
    }

    /// The bus, if a peripheral flag brought it up.
    pub fn maple_bus(&mut self) -> KernResult<&mut MapleBus<MapleDma>> {
        self.maple.bus.as_mut().ok_or(KernError::BadHandle)
    }

    /// Delivers queued bus events to user callbacks. Returns how many were
    /// delivered.
    pub fn maple_dispatch(&mut self) -> KernResult<usize> {
        if irq::inside_int() {
            return Err(KernError::WouldBlock);
        }
        Ok(self.maple_bus()?.dispatch_events())
    }

    /// One turn of the event thread: deliver what is queued, or wait for
    /// the next cycle that produces something.
    pub(crate) fn maple_wait(&mut self) -> KernResult<Wait<usize>> {
        let n = self.maple_dispatch()?;
        if n > 0 {
            return Ok(Wait::Done(n));
        }
        let chan = self.maple.chan.ok_or(KernError::BadHandle)?;
        self.block_current(Some(chan), None)?;
        Ok(Wait::Blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use crate::thread::ThreadState;
    use abi::MapleFunc;
    use core::sync::atomic::{AtomicU32, Ordering};
    use drv_maple::sim::SimDevice;
    use drv_maple::{DevInfo, MapleAddr};
    use proptest::prelude::*;

    /// Plays one video frame: vertical blank, then the DMA completion the
    /// simulated controller leaves pending.
    fn frame(k: &mut Kernel) {
        arch::raise_asic(regs::ASIC_EVT_VBLANK_IN);
        k.handle_exception(irq::EXC_IRQ_LEVEL6);
        let done = k
            .maple_bus()
            .map(|b| b.hw_mut().take_irq())
            .unwrap_or(false);
        if done {
            arch::raise_asic(regs::ASIC_EVT_MAPLE_DMA);
            k.handle_exception(irq::EXC_IRQ_LEVEL6);
        }
    }

    fn boot() -> testutil::Booted {
        testutil::boot_with(InitFlags::IRQ | InitFlags::CONTROLLER)
    }

    #[test]
    fn init_registers_the_interrupt_and_thread() {
        let k = boot();
        assert_eq!(arch::asic_enabled() & ASIC_EVENTS, ASIC_EVENTS);
        assert!(k.irq.handler(irq::EXC_IRQ_LEVEL6).is_some());
        let tid = k.maple.event_thread().unwrap();
        assert_eq!(k.thread_label(tid), Ok("maple"));
    }

    #[test]
    fn event_thread_sleeps_until_a_cycle_has_news() {
        let mut k = boot();
        let main = k.current();
        let ev = k.maple.event_thread().unwrap();
        testutil::run(&mut k, ev);
        assert!(k.maple_wait().unwrap().is_blocked());
        assert_eq!(k.current(), main);

        // An empty bus produces nothing to deliver.
        frame(&mut k);
        assert!(k.sched.get(ev).unwrap().wait_chan().is_some());

        let addr = MapleAddr::new(0, 0).unwrap();
        k.maple_bus().unwrap().hw_mut().plug(addr, SimDevice::controller());
        frame(&mut k);
        assert_eq!(k.current(), main);
        assert_eq!(k.sched.get(ev).unwrap().state(), ThreadState::Runnable);
        testutil::run(&mut k, ev);
        assert_eq!(k.take_wake(), Some(WakeResult::Ready(0)));
        assert_eq!(k.maple_wait(), Ok(Wait::Done(1)));
    }

    #[test]
    fn dispatch_is_refused_in_interrupt_context() {
        fn try_dispatch(k: &mut Kernel, _: u32, _: usize) -> NextThread {
            assert_eq!(k.maple_dispatch(), Err(KernError::WouldBlock));
            NextThread::Same
        }
        let mut k = boot();
        k.irq.set_handler(irq::EXC_TMU2_TUNI2, Some(try_dispatch), 0).unwrap();
        k.handle_exception(irq::EXC_TMU2_TUNI2);
    }

    std::thread_local! {
        static ATTACHED: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
        static DETACHED: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
    }

    fn on_attach(_: MapleAddr, _: &DevInfo) {
        ATTACHED.with(|c| c.set(c.get() + 1));
    }

    fn on_detach(_: MapleAddr, _: &DevInfo) {
        DETACHED.with(|c| c.set(c.get() + 1));
    }

    fn counts() -> (u32, u32) {
        (ATTACHED.with(|c| c.get()), DETACHED.with(|c| c.get()))
    }

    /// A controller unplugged and plugged back in is seen as one detach and
    /// a second attach.
    #[test]
    fn hot_plug() {
        let mut k = boot();
        let addr = MapleAddr::new(2, 0).unwrap();
        {
            let bus = k.maple_bus().unwrap();
            bus.attach_callback(MapleFunc::CONTROLLER, on_attach).unwrap();
            bus.detach_callback(MapleFunc::CONTROLLER, on_detach).unwrap();
            bus.hw_mut().plug(addr, SimDevice::controller());
        }
        for _ in 0..5 {
            frame(&mut k);
        }
        k.maple_dispatch().unwrap();
        assert_eq!(counts(), (1, 0));

        k.maple_bus().unwrap().hw_mut().unplug(addr);
        for _ in 0..u32::from(MAPLE_DETACH_THRESHOLD) + 1 {
            frame(&mut k);
        }
        k.maple_dispatch().unwrap();
        assert_eq!(counts(), (1, 1));

        k.maple_bus().unwrap().hw_mut().plug(addr, SimDevice::controller());
        for _ in 0..3 {
            frame(&mut k);
        }
        k.maple_dispatch().unwrap();
        assert_eq!(counts(), (2, 1));
    }

    static SHUTDOWN_DETACHES: AtomicU32 = AtomicU32::new(0);

    fn count_shutdown_detach(_: MapleAddr, _: &DevInfo) {
        SHUTDOWN_DETACHES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn shutdown_delivers_final_detaches() {
        let mut k = boot();
        {
            let bus = k.maple_bus().unwrap();
            bus.detach_callback(MapleFunc::empty(), count_shutdown_detach).unwrap();
            bus.hw_mut().plug(MapleAddr::new(1, 0).unwrap(), SimDevice::controller());
        }
        frame(&mut k);
        k.shutdown();
        assert_eq!(SHUTDOWN_DETACHES.load(Ordering::SeqCst), 1);
        assert_eq!(arch::asic_enabled() & ASIC_EVENTS, 0);
    }

    #[test]
    fn a_frame_still_in_flight_is_an_overrun() {
        let mut k = boot();
        k.maple_bus()
            .unwrap()
            .hw_mut()
            .plug(MapleAddr::new(0, 0).unwrap(), SimDevice::controller());
        arch::raise_asic(regs::ASIC_EVT_VBLANK_IN);
        k.handle_exception(irq::EXC_IRQ_LEVEL6);
        arch::raise_asic(regs::ASIC_EVT_VBLANK_IN);
        k.handle_exception(irq::EXC_IRQ_LEVEL6);
        assert_eq!(k.maple_bus().unwrap().overruns(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// A device that stays put is attached once and never detached, however
        /// many cycles run.
        #[test]
        fn steady_device_attaches_once(port in 0u8..4, cycles in 1usize..40) {
            ATTACHED.with(|c| c.set(0));
            DETACHED.with(|c| c.set(0));
            let mut k = boot();
            let addr = MapleAddr::new(port, 0).unwrap();
            {
                let bus = k.maple_bus().unwrap();
                bus.attach_callback(MapleFunc::empty(), on_attach).unwrap();
                bus.detach_callback(MapleFunc::empty(), on_detach).unwrap();
                bus.hw_mut().plug(addr, SimDevice::controller());
            }
            for _ in 0..cycles {
                frame(&mut k);
                k.maple_dispatch().unwrap();
            }
            prop_assert_eq!(counts(), (1, 0));
        }
    }
}
