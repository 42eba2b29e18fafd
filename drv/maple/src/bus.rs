// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus state machine: enumeration, hot-plug, status polling and event
//! delivery.

use abi::{KernError, LogLevel, MapleFunc};

use crate::devinfo::DevInfo;
use crate::driver::{Device, MapleDriver};
use crate::keyboard::KeyEvent;
use crate::proto::{
    list_words, DmaList, FrameReq, MapleAddr, RecvBuf, Response, ResponseCode,
    CMD_DEVINFO, PORTS, SLOTS,
};
use crate::{LogFn, MapleHw};

/// Most commands sent in one cycle: one per slot.
pub const MAX_FRAMES: usize = SLOTS;
pub const MAX_DRIVERS: usize = 8;
pub const MAX_CALLBACKS: usize = 8;
pub const EVENT_QUEUE: usize = 32;

/// Cycles a device may fail to answer before it is detached.
pub const DEFAULT_DETACH_THRESHOLD: u8 = 3;

macro_rules! buslog {
    ($state:expr, $level:expr, $($arg:tt)*) => {
        if let Some(log) = $state.log {
            log($level, format_args!($($arg)*));
        }
    };
}

/// Something that happened on the bus, queued in IRQ context and delivered
/// by `MapleBus::dispatch_events`.
#[derive(Copy, Clone, Debug)]
pub enum MapleEvent {
    Attached { addr: MapleAddr, info: DevInfo },
    Detached { addr: MapleAddr, info: DevInfo },
    /// A controller's buttons changed. `buttons` is the full set now held.
    Buttons {
        addr: MapleAddr,
        buttons: u32,
        changed: u32,
    },
    Key { addr: MapleAddr, event: KeyEvent },
}

/// Bounded event queue. When full, the oldest event is dropped.
pub struct Events {
    queue: heapless::Deque<MapleEvent, EVENT_QUEUE>,
    dropped: u32,
}

impl Events {
    const fn new() -> Self {
        Self {
            queue: heapless::Deque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, ev: MapleEvent) {
        if self.queue.is_full() {
            self.queue.pop_front();
            self.dropped = self.dropped.wrapping_add(1);
        }
        // Room was made above.
        let _ = self.queue.push_back(ev);
    }

    fn pop(&mut self) -> Option<MapleEvent> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

pub type DeviceFn = fn(MapleAddr, &DevInfo);
pub type ButtonFn = fn(MapleAddr, u32);
pub type KeyFn = fn(MapleAddr, KeyEvent);

#[derive(Copy, Clone)]
enum Callback {
    Attach(MapleFunc, DeviceFn),
    Detach(MapleFunc, DeviceFn),
    /// Fires when every button in the mask becomes held.
    Buttons(Option<MapleAddr>, u32, ButtonFn),
    Key(KeyFn),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Kind {
    /// Device info request to an empty slot.
    Probe,
    /// Device info request to an attached device without a poll routine.
    Liveness,
    /// The driver's status fetch.
    Status,
    /// A command queued by a driver or user.
    Queued,
}

#[derive(Copy, Clone, Debug)]
struct Planned {
    slot: u8,
    kind: Kind,
}

struct Slot {
    dev: Option<Device>,
    fails: u8,
    queued: Option<FrameReq>,
}

impl Slot {
    const EMPTY: Self = Self {
        dev: None,
        fails: 0,
        queued: None,
    };
}

/// Everything except the DMA area, so response handling can borrow the
/// buffers and the bookkeeping separately.
struct BusState {
    drivers: heapless::Vec<&'static MapleDriver, MAX_DRIVERS>,
    slots: [Slot; SLOTS],
    subunits: [u8; PORTS],
    events: Events,
    callbacks: heapless::Vec<Callback, MAX_CALLBACKS>,
    detach_threshold: u8,
    log: Option<LogFn>,
}

struct DmaArea {
    list: DmaList<{ list_words(MAX_FRAMES) }>,
    recv: [RecvBuf; MAX_FRAMES],
    plan: heapless::Vec<Planned, MAX_FRAMES>,
    in_flight: bool,
}

/// The maple bus and every device on it.
pub struct MapleBus<H> {
    hw: H,
    dma: DmaArea,
    state: BusState,
    cycles: u64,
    overruns: u32,
}

impl<H: MapleHw> MapleBus<H> {
    pub fn new(hw: H) -> Self {
        Self {
            hw,
            dma: DmaArea {
                list: DmaList::new(),
                recv: [RecvBuf::EMPTY; MAX_FRAMES],
                plan: heapless::Vec::new(),
                in_flight: false,
            },
            state: BusState {
                drivers: heapless::Vec::new(),
                slots: [Slot::EMPTY; SLOTS],
                subunits: [0; PORTS],
                events: Events::new(),
                callbacks: heapless::Vec::new(),
                detach_threshold: DEFAULT_DETACH_THRESHOLD,
                log: None,
            },
            cycles: 0,
            overruns: 0,
        }
    }

    pub fn set_log(&mut self, log: LogFn) {
        self.state.log = Some(log);
    }

    pub fn set_detach_threshold(&mut self, k: u8) {
        self.state.detach_threshold = k.max(1);
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn init(&mut self) {
        self.hw.init();
        buslog!(self.state, LogLevel::Debug, "maple: bus enabled");
    }

    /// Detaches everything and disables the bus. Detach events stay queued
    /// for a final `dispatch_events`.
    pub fn shutdown(&mut self) {
        for slot in 0..SLOTS {
            if self.state.slots[slot].dev.is_some() {
                self.state.detach(MapleAddr::from_slot(slot));
            }
        }
        self.dma.in_flight = false;
        self.hw.shutdown();
    }

    /// Adds a driver. Drivers registered earlier win ties.
    pub fn register_driver(
        &mut self,
        driver: &'static MapleDriver,
    ) -> Result<(), KernError> {
        if self
            .state
            .drivers
            .iter()
            .any(|d| core::ptr::eq(*d, driver))
        {
            return Err(KernError::InvalidArgument);
        }
        self.state
            .drivers
            .push(driver)
            .map_err(|_| KernError::ResourceExhausted)
    }

    pub fn unregister_driver(&mut self, driver: &'static MapleDriver) {
        self.state.drivers.retain(|d| !core::ptr::eq(*d, driver));
    }

    /// Begins a bus cycle. Returns `false` if nothing was sent, including
    /// when the previous cycle has not completed yet.
    pub fn start_cycle(&mut self) -> bool {
        if self.dma.in_flight {
            self.overruns = self.overruns.wrapping_add(1);
            return false;
        }
        let dma = &mut self.dma;
        dma.list.clear();
        dma.plan.clear();

        for slot in 0..SLOTS {
            let Some((req, kind)) = self.state.request_for(slot) else {
                continue;
            };
            let i = dma.plan.len();
            dma.recv[i] = RecvBuf::EMPTY;
            let addr = self.hw.dma_addr(&dma.recv[i]);
            if dma.list.push(&req, addr).is_err() {
                // Out of list space; a queued frame goes back for next time.
                if kind == Kind::Queued {
                    self.state.slots[slot].queued = Some(req);
                }
                break;
            }
            // One entry per slot, so this cannot overflow.
            let _ = dma.plan.push(Planned {
                slot: slot as u8,
                kind,
            });
        }

        if dma.list.is_empty() {
            return false;
        }
        dma.list.finish();
        let n = dma.plan.len();
        self.hw.start(dma.list.words(), &mut dma.recv[..n]);
        dma.in_flight = true;
        true
    }

    /// Completes the cycle started by `start_cycle`; call from the DMA
    /// completion interrupt.
    pub fn complete_cycle(&mut self) {
        if !self.dma.in_flight {
            return;
        }
        let n = self.dma.plan.len();
        self.hw.finish(&mut self.dma.recv[..n]);
        self.dma.in_flight = false;
        self.cycles += 1;

        for (planned, buf) in self.dma.plan.iter().zip(&self.dma.recv[..n]) {
            self.state.handle(*planned, buf);
        }
    }

    pub fn in_flight(&self) -> bool {
        self.dma.in_flight
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Delivers queued events to user callbacks. Must not be called from IRQ
    /// context. Returns the number of events delivered.
    pub fn dispatch_events(&mut self) -> usize {
        let mut n = 0;
        while let Some(ev) = self.state.events.pop() {
            n += 1;
            for cb in &self.state.callbacks {
                match (*cb, &ev) {
                    (
                        Callback::Attach(mask, f),
                        MapleEvent::Attached { addr, info },
                    )
                    | (
                        Callback::Detach(mask, f),
                        MapleEvent::Detached { addr, info },
                    ) => {
                        if mask.is_empty() || mask.intersects(info.functions()) {
                            f(*addr, info);
                        }
                    }
                    (
                        Callback::Buttons(filter, mask, f),
                        MapleEvent::Buttons {
                            addr,
                            buttons,
                            changed,
                        },
                    ) => {
                        let wanted = filter.map_or(true, |a| a == *addr);
                        let now_held = buttons & mask == mask;
                        let was_held = (buttons ^ changed) & mask == mask;
                        if wanted && now_held && !was_held {
                            f(*addr, *buttons);
                        }
                    }
                    (Callback::Key(f), MapleEvent::Key { addr, event }) => {
                        f(*addr, *event);
                    }
                    _ => (),
                }
            }
        }
        n
    }

    pub fn pending_events(&self) -> usize {
        self.state.events.len()
    }

    pub fn dropped_events(&self) -> u32 {
        self.state.events.dropped()
    }

    /// Calls `f` on attach of any device offering one of `functions` (all
    /// devices if empty).
    pub fn attach_callback(
        &mut self,
        functions: MapleFunc,
        f: DeviceFn,
    ) -> Result<(), KernError> {
        self.add_callback(Callback::Attach(functions, f))
    }

    pub fn detach_callback(
        &mut self,
        functions: MapleFunc,
        f: DeviceFn,
    ) -> Result<(), KernError> {
        self.add_callback(Callback::Detach(functions, f))
    }

    /// Calls `f(addr, buttons)` when every button in `mask` becomes held on
    /// the controller at `addr` (any controller if `None`).
    pub fn button_callback(
        &mut self,
        addr: Option<MapleAddr>,
        mask: u32,
        f: ButtonFn,
    ) -> Result<(), KernError> {
        if mask == 0 {
            return Err(KernError::InvalidArgument);
        }
        self.add_callback(Callback::Buttons(addr, mask, f))
    }

    pub fn key_callback(&mut self, f: KeyFn) -> Result<(), KernError> {
        self.add_callback(Callback::Key(f))
    }

    fn add_callback(&mut self, cb: Callback) -> Result<(), KernError> {
        self.state
            .callbacks
            .push(cb)
            .map_err(|_| KernError::ResourceExhausted)
    }

    /// Queues a command for the device at `addr`, sent next cycle in place
    /// of its status fetch.
    pub fn queue_frame(&mut self, frame: FrameReq) -> Result<(), KernError> {
        let slot = &mut self.state.slots[frame.addr.slot()];
        if slot.dev.is_none() {
            return Err(KernError::BadHandle);
        }
        if slot.queued.is_some() {
            return Err(KernError::WouldBlock);
        }
        slot.queued = Some(frame);
        Ok(())
    }

    /// Runs the bound driver's control routine and queues the command it
    /// produces.
    pub fn ioctl(
        &mut self,
        addr: MapleAddr,
        cmd: u32,
        arg: usize,
    ) -> Result<(), KernError> {
        let dev = self.device_mut(addr).ok_or(KernError::BadHandle)?;
        let ioctl = dev
            .driver
            .and_then(|d| d.ioctl)
            .ok_or(KernError::InvalidArgument)?;
        let frame = ioctl(dev, cmd, arg)?;
        self.queue_frame(frame)
    }

    pub fn device(&self, addr: MapleAddr) -> Option<&Device> {
        self.state.slots[addr.slot()].dev.as_ref()
    }

    pub fn device_mut(&mut self, addr: MapleAddr) -> Option<&mut Device> {
        self.state.slots[addr.slot()].dev.as_mut()
    }

    /// Attached devices, in port then unit order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> + '_ {
        self.state.slots.iter().filter_map(|s| s.dev.as_ref())
    }

    /// The `n`th attached device offering `func`.
    pub fn enum_type(&self, n: usize, func: MapleFunc) -> Option<&Device> {
        self.devices()
            .filter(|d| d.functions().contains(func))
            .nth(n)
    }
}

impl BusState {
    fn request_for(&mut self, slot: usize) -> Option<(FrameReq, Kind)> {
        let addr = MapleAddr::from_slot(slot);
        let s = &mut self.slots[slot];
        if let Some(frame) = s.queued.take() {
            return Some((frame, Kind::Queued));
        }
        match &s.dev {
            Some(dev) => match dev.driver.and_then(|d| d.poll) {
                Some(poll) => Some((poll(dev), Kind::Status)),
                None => Some((FrameReq::new(addr, CMD_DEVINFO), Kind::Liveness)),
            },
            None => {
                let present = addr.unit == 0
                    || self.subunits[usize::from(addr.port)] & 1 << (addr.unit - 1)
                        != 0;
                present.then(|| (FrameReq::new(addr, CMD_DEVINFO), Kind::Probe))
            }
        }
    }

    fn handle(&mut self, planned: Planned, buf: &RecvBuf) {
        let slot = usize::from(planned.slot);
        let addr = MapleAddr::from_slot(slot);
        let resp = Response::parse(buf);
        let answered = resp.answered();

        if addr.unit == 0 {
            self.subunits[usize::from(addr.port)] =
                if answered { resp.subunit_mask() } else { 0 };
        }

        if self.slots[slot].dev.is_none() {
            if planned.kind == Kind::Probe
                && resp.code() == Some(ResponseCode::DevInfo)
            {
                match DevInfo::parse(resp.bytes()) {
                    Some(info) => self.attach(addr, info),
                    None => {
                        buslog!(
                            self,
                            LogLevel::Warning,
                            "maple: {}: short device info",
                            addr
                        );
                    }
                }
            }
            return;
        }

        if !answered || resp.code() == Some(ResponseCode::Again) {
            let s = &mut self.slots[slot];
            s.fails = s.fails.saturating_add(1);
            if s.fails >= self.detach_threshold {
                self.detach(addr);
            }
            return;
        }

        let s = &mut self.slots[slot];
        s.fails = 0;
        if planned.kind == Kind::Status
            && resp.code() == Some(ResponseCode::DataTrf)
        {
            if let Some(dev) = s.dev.as_mut() {
                if let Some(driver) = dev.driver {
                    (driver.reply)(dev, &resp, &mut self.events);
                }
            }
        }
    }

    fn attach(&mut self, addr: MapleAddr, info: DevInfo) {
        let functions = info.functions();
        let driver = self
            .drivers
            .iter()
            .copied()
            .find(|d| d.functions.intersects(functions));
        let mut dev = Device::new(addr, info, driver);
        if let Some(d) = driver {
            if let Err(e) = (d.attach)(&mut dev) {
                buslog!(
                    self,
                    LogLevel::Warning,
                    "maple: {}: driver {} refused device: {}",
                    addr,
                    d.name,
                    e
                );
                dev.driver = None;
            }
        }
        buslog!(
            self,
            LogLevel::Info,
            "maple: attached {}: {} ({})",
            addr,
            info.name(),
            dev.driver.map_or("no driver", |d| d.name)
        );
        let s = &mut self.slots[addr.slot()];
        s.dev = Some(dev);
        s.fails = 0;
        self.events.push(MapleEvent::Attached { addr, info });
    }

    fn detach(&mut self, addr: MapleAddr) {
        let s = &mut self.slots[addr.slot()];
        s.fails = 0;
        s.queued = None;
        let Some(mut dev) = s.dev.take() else {
            return;
        };
        self.events.push(MapleEvent::Detached {
            addr,
            info: dev.info,
        });
        if let Some(d) = dev.driver {
            (d.detach)(&mut dev);
        }
        dev.clear_status();
        buslog!(
            self,
            LogLevel::Info,
            "maple: detached {}: {}",
            addr,
            dev.info.name()
        );
    }
}
