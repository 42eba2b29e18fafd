// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Debug I/O: a registry of byte transports with one selected at a time,
//! plus the leveled kernel log that writes through it.
//!
//! Handlers are tried in registration order; the null sink is always last
//! so that selection cannot fail. The registry is only written during boot
//! and shutdown, so reading it from an interrupt handler is fine.
//!
//! Messages at `Critical` and above skip the output lock so they get out
//! even if a thread died holding it. Everything else takes the lock, except
//! in interrupt context where it could only deadlock.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use abi::{KernError, LogLevel};
use heapless::{Deque, Vec};
use num_traits::FromPrimitive;
use spin::{Mutex, RwLock};

use crate::arch;
use crate::kconfig::DEFAULT_LOG_LEVEL;
use crate::regs;

pub const MAX_HANDLERS: usize = 8;
/// Capacity of the in-memory capture handler.
pub const RING_LEN: usize = 4096;
/// Polls of a FIFO status register before giving up on the hardware.
const SPIN_LIMIT: u32 = 100_000;
const NONE: usize = usize::MAX;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqMode {
    Polled,
    Interrupt,
}

/// A debug byte transport.
pub trait DbgIoHandler: Sync {
    fn name(&self) -> &'static str;
    /// Whether the transport is present.
    fn detect(&self) -> bool;
    fn init(&self) -> Result<(), KernError>;
    fn shutdown(&self) -> Result<(), KernError>;
    fn set_irq_mode(&self, mode: IrqMode) -> Result<(), KernError>;
    /// Returns a received byte, if one is waiting.
    fn read(&self) -> Option<u8>;
    fn write(&self, byte: u8) -> Result<(), KernError>;
    fn flush(&self) -> Result<(), KernError>;

    /// Writes `data`, expanding `\n` to `\r\n` when `xlat` is set.
    fn write_buffer(&self, data: &[u8], xlat: bool) -> Result<usize, KernError> {
        for &b in data {
            if xlat && b == b'\n' {
                self.write(b'\r')?;
            }
            self.write(b)?;
        }
        Ok(data.len())
    }

    /// Reads whatever is waiting, without blocking.
    fn read_buffer(&self, buf: &mut [u8]) -> Result<usize, KernError> {
        let mut n = 0;
        while n < buf.len() {
            match self.read() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 && !buf.is_empty() {
            return Err(KernError::WouldBlock);
        }
        Ok(n)
    }
}

pub struct DbgIo {
    handlers: RwLock<Vec<&'static dyn DbgIoHandler, MAX_HANDLERS>>,
    selected: AtomicUsize,
    enabled: AtomicBool,
    level: AtomicU8,
    out: Mutex<()>,
}

/// The kernel's debug console.
pub static DBGIO: DbgIo = DbgIo::new();

impl DbgIo {
    pub const fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            selected: AtomicUsize::new(NONE),
            enabled: AtomicBool::new(true),
            level: AtomicU8::new(DEFAULT_LOG_LEVEL as u8),
            out: Mutex::new(()),
        }
    }

    /// Adds a handler ahead of the null sink.
    pub fn register(&self, h: &'static dyn DbgIoHandler) -> Result<(), KernError> {
        let mut list = self.handlers.write();
        if list.iter().any(|x| x.name() == h.name()) {
            return Err(KernError::InvalidArgument);
        }
        let at = match list.last() {
            Some(last) if last.name() == NULL.name() => list.len() - 1,
            _ => list.len(),
        };
        list.push(h).map_err(|_| KernError::ResourceExhausted)?;
        list[at..].rotate_right(1);
        // Keep the selection pointing at the same handler.
        let sel = self.selected.load(Ordering::Acquire);
        if sel != NONE && sel >= at {
            self.selected.store(sel + 1, Ordering::Release);
        }
        Ok(())
    }

    /// Picks the first handler that detects and initializes.
    pub fn init(&self) -> Result<(), KernError> {
        {
            let mut list = self.handlers.write();
            if !list.iter().any(|x| x.name() == NULL.name()) {
                list.push(&NULL).map_err(|_| KernError::ResourceExhausted)?;
            }
        }
        let list = self.handlers.read();
        for (i, h) in list.iter().enumerate() {
            if h.detect() && h.init().is_ok() {
                self.selected.store(i, Ordering::Release);
                return Ok(());
            }
        }
        Err(KernError::BadHandle)
    }

    pub fn shutdown(&self) {
        let sel = self.selected.swap(NONE, Ordering::AcqRel);
        if sel != NONE {
            if let Some(h) = self.handlers.read().get(sel) {
                h.shutdown().ok();
            }
        }
    }

    /// Switches output to the handler called `name`.
    pub fn select(&self, name: &str) -> Result<(), KernError> {
        let list = self.handlers.read();
        let i = list
            .iter()
            .position(|h| h.name() == name)
            .ok_or(KernError::BadHandle)?;
        let h = list[i];
        if !h.detect() {
            return Err(KernError::InvalidArgument);
        }
        h.init()?;
        let old = self.selected.swap(i, Ordering::AcqRel);
        if old != NONE && old != i {
            if let Some(prev) = list.get(old) {
                prev.shutdown().ok();
            }
        }
        Ok(())
    }

    pub fn selected(&self) -> Option<&'static str> {
        self.with_selected(|h| h.name())
    }

    fn with_selected<R>(&self, f: impl FnOnce(&dyn DbgIoHandler) -> R) -> Option<R> {
        let sel = self.selected.load(Ordering::Acquire);
        if sel == NONE {
            return None;
        }
        self.handlers.read().get(sel).map(|h| f(*h))
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_irq_mode(&self, mode: IrqMode) -> Result<(), KernError> {
        self.with_selected(|h| h.set_irq_mode(mode))
            .unwrap_or(Err(KernError::BadHandle))
    }

    /// Sets the most verbose level that is still printed.
    pub fn set_level(&self, level: LogLevel) {
        if !cfg!(feature = "ndebug") {
            self.level.store(level as u8, Ordering::Release);
        }
    }

    pub fn level(&self) -> LogLevel {
        if cfg!(feature = "ndebug") {
            return LogLevel::Dead;
        }
        LogLevel::from_u8(self.level.load(Ordering::Acquire)).unwrap_or(LogLevel::Dead)
    }

    pub fn write(&self, byte: u8) -> Result<(), KernError> {
        self.output(|h| h.write(byte))
    }

    pub fn write_buffer(&self, data: &[u8], xlat: bool) -> Result<usize, KernError> {
        self.output(|h| h.write_buffer(data, xlat))
    }

    pub fn write_str(&self, s: &str) -> Result<usize, KernError> {
        self.write_buffer(s.as_bytes(), true)
    }

    pub fn flush(&self) -> Result<(), KernError> {
        self.output(|h| h.flush())
    }

    pub fn read(&self) -> Option<u8> {
        if !self.enabled() {
            return None;
        }
        self.with_selected(|h| h.read()).flatten()
    }

    pub fn read_buffer(&self, buf: &mut [u8]) -> Result<usize, KernError> {
        if !self.enabled() {
            return Err(KernError::WouldBlock);
        }
        self.with_selected(|h| h.read_buffer(buf))
            .unwrap_or(Err(KernError::BadHandle))
    }

    fn output<R: Default>(
        &self,
        f: impl FnOnce(&dyn DbgIoHandler) -> Result<R, KernError>,
    ) -> Result<R, KernError> {
        if !self.enabled() {
            return Ok(R::default());
        }
        self.with_selected(f).unwrap_or(Err(KernError::BadHandle))
    }

    /// Formatted output with no level and no trailing newline.
    pub fn write_fmt(&self, args: fmt::Arguments<'_>) -> Result<(), KernError> {
        let _guard = self.lock_for(LogLevel::Info);
        fmt::write(&mut Writer { io: self }, args).map_err(|_| KernError::WouldBlock)
    }

    /// Writes one log line if `level` passes the threshold.
    pub fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        if level > self.level() {
            return;
        }
        let _guard = self.lock_for(level);
        let mut w = Writer { io: self };
        if fmt::write(&mut w, args).is_ok() {
            fmt::Write::write_str(&mut w, "\n").ok();
        }
    }

    fn lock_for(&self, level: LogLevel) -> Option<spin::MutexGuard<'_, ()>> {
        if level.is_urgent() || arch::in_exception() {
            None
        } else {
            Some(self.out.lock())
        }
    }
}

impl Default for DbgIo {
    fn default() -> Self {
        Self::new()
    }
}

struct Writer<'a> {
    io: &'a DbgIo,
}

impl fmt::Write for Writer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.io
            .write_buffer(s.as_bytes(), true)
            .map(|_| ())
            .map_err(|_| fmt::Error)
    }
}

/// Logs through the kernel debug console.
#[macro_export]
macro_rules! dbglog {
    ($level:expr, $($arg:tt)+) => {
        $crate::dbgio::DBGIO.log($level, format_args!($($arg)+))
    };
}

/// The on-chip serial port, polled.
pub struct ScifHandler {
    baud: AtomicU32,
}

pub static SCIF: ScifHandler = ScifHandler::new(115_200);

impl ScifHandler {
    pub const fn new(baud: u32) -> Self {
        Self {
            baud: AtomicU32::new(baud),
        }
    }

    /// Takes effect at the next `init`.
    pub fn set_baud(&self, baud: u32) {
        self.baud.store(baud, Ordering::Relaxed);
    }

    fn tx_count() -> u16 {
        (arch::scif_regs().scfdr2.get() >> 8) & 0x1f
    }

    fn rx_count() -> u16 {
        arch::scif_regs().scfdr2.get() & 0x1f
    }
}

impl DbgIoHandler for ScifHandler {
    fn name(&self) -> &'static str {
        "scif"
    }

    fn detect(&self) -> bool {
        true
    }

    fn init(&self) -> Result<(), KernError> {
        let r = arch::scif_regs();
        r.scscr2.set(0);
        r.scfcr2.set(regs::SCFCR2_TFRST | regs::SCFCR2_RFRST);
        // 8N1, peripheral clock undivided.
        r.scsmr2.set(0);
        r.scbrr2.set(regs::scbrr(self.baud.load(Ordering::Relaxed)));
        r.scfsr2.set(0);
        r.scfcr2.set(0);
        r.scscr2.set(regs::SCSCR2_TE | regs::SCSCR2_RE);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), KernError> {
        self.flush()
    }

    fn set_irq_mode(&self, mode: IrqMode) -> Result<(), KernError> {
        match mode {
            IrqMode::Polled => Ok(()),
            IrqMode::Interrupt => Err(KernError::InvalidArgument),
        }
    }

    fn read(&self) -> Option<u8> {
        if Self::rx_count() == 0 {
            return None;
        }
        let r = arch::scif_regs();
        let b = r.scfrdr2.get();
        r.scfsr2.set(r.scfsr2.get() & !(regs::SCFSR2_RDF | regs::SCFSR2_DR));
        Some(b)
    }

    fn write(&self, byte: u8) -> Result<(), KernError> {
        let mut spins = 0;
        while Self::tx_count() >= 16 {
            spins += 1;
            if spins == SPIN_LIMIT {
                return Err(KernError::WouldBlock);
            }
        }
        let r = arch::scif_regs();
        r.scftdr2.set(byte);
        r.scfsr2.set(r.scfsr2.get() & !(regs::SCFSR2_TDFE | regs::SCFSR2_TEND));
        Ok(())
    }

    fn flush(&self) -> Result<(), KernError> {
        let mut spins = 0;
        while Self::tx_count() != 0 {
            spins += 1;
            if spins == SPIN_LIMIT {
                return Err(KernError::WouldBlock);
            }
        }
        Ok(())
    }
}

/// Keeps the most recent output in memory, dropping the oldest bytes.
pub struct RingHandler<const N: usize> {
    buf: Mutex<Deque<u8, N>>,
}

pub static RING: RingHandler<RING_LEN> = RingHandler::new();

impl<const N: usize> RingHandler<N> {
    pub const fn new() -> Self {
        Self {
            buf: Mutex::new(Deque::new()),
        }
    }

    /// Copies the captured bytes, oldest first, returning how many.
    pub fn contents(&self, out: &mut [u8]) -> usize {
        let buf = self.buf.lock();
        let mut n = 0;
        for (o, b) in out.iter_mut().zip(buf.iter()) {
            *o = *b;
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    pub fn clear(&self) {
        self.buf.lock().clear();
    }
}

impl<const N: usize> Default for RingHandler<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> DbgIoHandler for RingHandler<N> {
    fn name(&self) -> &'static str {
        "ring"
    }

    fn detect(&self) -> bool {
        true
    }

    fn init(&self) -> Result<(), KernError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), KernError> {
        Ok(())
    }

    fn set_irq_mode(&self, _mode: IrqMode) -> Result<(), KernError> {
        Ok(())
    }

    fn read(&self) -> Option<u8> {
        None
    }

    fn write(&self, byte: u8) -> Result<(), KernError> {
        let mut buf = self.buf.lock();
        if buf.is_full() {
            buf.pop_front();
        }
        buf.push_back(byte).ok();
        Ok(())
    }

    fn write_buffer(&self, data: &[u8], _xlat: bool) -> Result<usize, KernError> {
        for &b in data {
            self.write(b)?;
        }
        Ok(data.len())
    }

    fn flush(&self) -> Result<(), KernError> {
        Ok(())
    }
}

/// Swallows everything. Always present, always last.
pub struct NullHandler;

pub static NULL: NullHandler = NullHandler;

impl DbgIoHandler for NullHandler {
    fn name(&self) -> &'static str {
        "null"
    }

    fn detect(&self) -> bool {
        true
    }

    fn init(&self) -> Result<(), KernError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), KernError> {
        Ok(())
    }

    fn set_irq_mode(&self, _mode: IrqMode) -> Result<(), KernError> {
        Ok(())
    }

    fn read(&self) -> Option<u8> {
        None
    }

    fn write(&self, _byte: u8) -> Result<(), KernError> {
        Ok(())
    }

    fn write_buffer(&self, data: &[u8], _xlat: bool) -> Result<usize, KernError> {
        Ok(data.len())
    }

    fn flush(&self) -> Result<(), KernError> {
        Ok(())
    }
}
