// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MMU page tables.
//!
//! The hardware only has a 64-entry TLB; the tables here are the software
//! side the TLB-miss handler refills it from. A context is a two-level
//! table over the 2 GiB user area: a 1024-slot top level indexed by
//! `vaddr[30:21]` whose slots name sub-tables of 512 page entries indexed by
//! `vaddr[20:12]`. Sub-tables come from a fixed pool shared by all
//! contexts and go back to it when their last page is unmapped.
//!
//! Each context carries an ASID. The TLB is flushed lazily: changes to the
//! current context flush the affected pages at once, changes to any other
//! context bump its mapping generation, and `switch_context` flushes an
//! ASID only when what the TLB may hold for it is older than the context's
//! tables.
//!
//! There is no paging. Every mapping is fixed until it is unmapped.

use abi::{CachePolicy, KernError, LogLevel, Perm, Signal};

use crate::arch;
use crate::err::KernResult;
use crate::fail;
use crate::irq;
use crate::kconfig::{MAX_CONTEXTS, PAGE_SUBTABLES};
use crate::regs::{self, PtelBits};
use crate::startup::Kernel;
use crate::thread::NextThread;

pub const PAGESIZE_BITS: u32 = 12;
pub const PAGESIZE: usize = 1 << PAGESIZE_BITS;

const TOP_ENTRIES: usize = 1024;
const SUB_ENTRIES: usize = 512;
/// Virtual pages the tables can describe.
pub const VPAGES: usize = TOP_ENTRIES * SUB_ENTRIES;
/// Physical pages in the 29-bit physical address space.
pub const PPAGES: usize = 1 << (29 - PAGESIZE_BITS);

const NO_SUB: u16 = u16::MAX;

/// Physical windows that belong to devices. Mapping them cacheable would
/// let the cache sit between the CPU and the device.
const DEVICE_WINDOWS: &[(usize, usize)] = &[
    // System bus registers.
    (0x005f_0000, 0x0060_0000),
    // Sound RAM.
    (0x0080_0000, 0x00a0_0000),
    // Video RAM, 64-bit and 32-bit access areas.
    (0x0400_0000, 0x0480_0000),
    (0x0500_0000, 0x0580_0000),
];

/// Attributes of a mapped page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageAttrs {
    pub perm: Perm,
    pub cache: CachePolicy,
    /// Pre-set the dirty bit, so the first write does not fault.
    pub dirty: bool,
    /// Visible in every address space regardless of ASID.
    pub shared: bool,
}

impl PageAttrs {
    pub const fn new(perm: Perm, cache: CachePolicy) -> Self {
        Self {
            perm,
            cache,
            dirty: false,
            shared: false,
        }
    }

    fn writable(&self) -> bool {
        matches!(
            self.perm,
            Perm::ReadWrite | Perm::PrivReadWrite | Perm::AllReadWrite
        )
    }

    fn ptel_bits(&self) -> Option<PtelBits> {
        let pr = match self.perm {
            Perm::None => return None,
            Perm::ReadOnly => regs::PR_ALL_RO,
            Perm::ReadWrite | Perm::AllReadWrite => regs::PR_ALL_RW,
            Perm::PrivReadOnly => regs::PR_PRIV_RO,
            Perm::PrivReadWrite => regs::PR_PRIV_RW,
        };
        Some(PtelBits {
            pr,
            cacheable: self.cache != CachePolicy::NoCache,
            write_through: self.cache == CachePolicy::WriteThrough,
            shared: self.shared,
            dirty: self.dirty,
        })
    }
}

/// A page table entry: the physical address of the page in the upper bits,
/// attributes below. Zero is "not mapped".
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct PageEntry(u32);

impl PageEntry {
    const EMPTY: Self = Self(0);
    const VALID: u32 = 1 << 0;
    const PERM_SHIFT: u32 = 1;
    const CACHE_SHIFT: u32 = 4;
    const DIRTY: u32 = 1 << 6;
    const SHARED: u32 = 1 << 7;

    fn new(ppage: usize, a: &PageAttrs) -> Self {
        let perm = match a.perm {
            Perm::None => 0,
            Perm::ReadOnly => 1,
            Perm::ReadWrite => 2,
            Perm::PrivReadOnly => 3,
            Perm::PrivReadWrite => 4,
            Perm::AllReadWrite => 5,
        };
        let cache = match a.cache {
            CachePolicy::Cacheable => 0,
            CachePolicy::NoCache => 1,
            CachePolicy::WriteThrough => 2,
        };
        let mut v = (ppage as u32) << PAGESIZE_BITS
            | Self::VALID
            | perm << Self::PERM_SHIFT
            | cache << Self::CACHE_SHIFT;
        if a.dirty {
            v |= Self::DIRTY;
        }
        if a.shared {
            v |= Self::SHARED;
        }
        Self(v)
    }

    fn valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    fn ppage(self) -> usize {
        (self.0 >> PAGESIZE_BITS) as usize
    }

    fn attrs(self) -> PageAttrs {
        let perm = match (self.0 >> Self::PERM_SHIFT) & 7 {
            1 => Perm::ReadOnly,
            2 => Perm::ReadWrite,
            3 => Perm::PrivReadOnly,
            4 => Perm::PrivReadWrite,
            5 => Perm::AllReadWrite,
            _ => Perm::None,
        };
        let cache = match (self.0 >> Self::CACHE_SHIFT) & 3 {
            1 => CachePolicy::NoCache,
            2 => CachePolicy::WriteThrough,
            _ => CachePolicy::Cacheable,
        };
        PageAttrs {
            perm,
            cache,
            dirty: self.0 & Self::DIRTY != 0,
            shared: self.0 & Self::SHARED != 0,
        }
    }
}

#[derive(Copy, Clone)]
struct SubTable {
    entries: [PageEntry; SUB_ENTRIES],
    used: u16,
    in_use: bool,
}

impl SubTable {
    const FREE: Self = Self {
        entries: [PageEntry::EMPTY; SUB_ENTRIES],
        used: 0,
        in_use: false,
    };
}

struct Context {
    asid: u8,
    top: [u16; TOP_ENTRIES],
    /// Bumped whenever a mapping is removed or replaced while the context
    /// is not current.
    map_gen: u32,
}

/// Names a live context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ContextHandle {
    index: u8,
    gen: u16,
}

pub struct Mmu {
    contexts: [Option<Context>; MAX_CONTEXTS],
    gens: [u16; MAX_CONTEXTS],
    subs: [SubTable; PAGE_SUBTABLES],
    current: Option<ContextHandle>,
    /// What the TLB may hold for each ASID.
    loaded: [Option<(ContextHandle, u32)>; 256],
    enabled: bool,
}

fn split(vpage: usize) -> (usize, usize) {
    (vpage / SUB_ENTRIES, vpage % SUB_ENTRIES)
}

fn check_range(vpage: usize, count: usize, limit: usize) -> KernResult<()> {
    match vpage.checked_add(count) {
        Some(end) if count > 0 && end <= limit => Ok(()),
        _ => Err(KernError::InvalidArgument),
    }
}

impl Mmu {
    pub const fn new() -> Self {
        const NONE: Option<Context> = None;
        Self {
            contexts: [NONE; MAX_CONTEXTS],
            gens: [0; MAX_CONTEXTS],
            subs: [SubTable::FREE; PAGE_SUBTABLES],
            current: None,
            loaded: [None; 256],
            enabled: false,
        }
    }

    /// Turns address translation on with an empty TLB.
    pub fn init(&mut self) {
        *self = Self::new();
        arch::mmu_control(regs::MMUCR_AT | regs::MMUCR_TI);
        self.enabled = true;
        dbglog!(LogLevel::Debug, "mmu: translation on");
    }

    /// Turns translation off and drops every context.
    pub fn shutdown(&mut self) {
        arch::mmu_control(regs::MMUCR_TI);
        *self = Self::new();
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    fn lookup(&self, h: ContextHandle) -> KernResult<usize> {
        let i = usize::from(h.index);
        match self.contexts.get(i) {
            Some(Some(_)) if self.gens[i] == h.gen => Ok(i),
            _ => Err(KernError::BadHandle),
        }
    }

    fn ctx(&self, h: ContextHandle) -> KernResult<&Context> {
        let i = self.lookup(h)?;
        self.contexts[i].as_ref().ok_or(KernError::BadHandle)
    }

    fn ctx_mut(&mut self, h: ContextHandle) -> KernResult<&mut Context> {
        let i = self.lookup(h)?;
        self.contexts[i].as_mut().ok_or(KernError::BadHandle)
    }

    /// Creates an empty context tagged with `asid`.
    pub fn context_create(&mut self, asid: u8) -> KernResult<ContextHandle> {
        if self.contexts.iter().flatten().any(|c| c.asid == asid) {
            return Err(KernError::InvalidArgument);
        }
        let i = self
            .contexts
            .iter()
            .position(Option::is_none)
            .ok_or(KernError::ResourceExhausted)?;
        self.contexts[i] = Some(Context {
            asid,
            top: [NO_SUB; TOP_ENTRIES],
            map_gen: 0,
        });
        dbglog!(LogLevel::Debug, "mmu: context {} created, asid {}", i, asid);
        Ok(ContextHandle {
            index: i as u8,
            gen: self.gens[i],
        })
    }

    /// Destroys a context. Destroying the current context or one that no
    /// longer exists is fatal.
    pub fn context_destroy(&mut self, h: ContextHandle) {
        let Ok(i) = self.lookup(h) else {
            fail::die("mmu: destroying a dead context");
        };
        if self.current == Some(h) {
            fail::die("mmu: destroying the current context");
        }
        let Some(ctx) = self.contexts[i].take() else {
            fail::die("mmu: destroying a dead context");
        };
        for &s in ctx.top.iter().filter(|&&s| s != NO_SUB) {
            self.subs[usize::from(s)] = SubTable::FREE;
        }
        let asid = usize::from(ctx.asid);
        if self.loaded[asid].is_some_and(|(owner, _)| owner == h) {
            arch::tlb_flush_asid(ctx.asid);
            self.loaded[asid] = None;
        }
        self.gens[i] = self.gens[i].wrapping_add(1);
        dbglog!(LogLevel::Debug, "mmu: context {} destroyed", i);
    }

    pub fn context_asid(&self, h: ContextHandle) -> KernResult<u8> {
        Ok(self.ctx(h)?.asid)
    }

    pub fn current(&self) -> Option<ContextHandle> {
        self.current
    }

    /// Publishes `h`'s tables to the miss handler without touching the ASID
    /// or the TLB.
    pub fn use_table(&mut self, h: ContextHandle) -> KernResult<()> {
        let ctx = self.ctx(h)?;
        arch::ccn_regs().ttb.set(ctx.top.as_ptr() as usize as u32);
        self.current = Some(h);
        Ok(())
    }

    /// Makes `h` the running address space.
    pub fn switch_context(&mut self, h: ContextHandle) -> KernResult<()> {
        irq::interrupt_free(|| {
            self.use_table(h)?;
            let (asid, map_gen) = {
                let c = self.ctx(h)?;
                (c.asid, c.map_gen)
            };
            let slot = &mut self.loaded[usize::from(asid)];
            if *slot != Some((h, map_gen)) {
                if slot.is_some() {
                    arch::tlb_flush_asid(asid);
                }
                *slot = Some((h, map_gen));
            }
            arch::set_asid(asid);
            Ok(())
        })
    }

    /// Makes the TLB forget `vpage` in context `h`.
    fn invalidate(&mut self, h: ContextHandle, vpage: usize) {
        if self.current == Some(h) {
            if let Ok(asid) = self.context_asid(h) {
                arch::tlb_flush_page((vpage << PAGESIZE_BITS) as u32, asid);
            }
        } else if let Ok(c) = self.ctx_mut(h) {
            c.map_gen = c.map_gen.wrapping_add(1);
        }
    }

    fn alloc_sub(&mut self) -> u16 {
        match self.subs.iter().position(|s| !s.in_use) {
            Some(i) => {
                self.subs[i] = SubTable::FREE;
                self.subs[i].in_use = true;
                i as u16
            }
            None => fail::die("mmu: out of page sub-tables"),
        }
    }

    /// Maps `count` pages at `vpage` onto consecutive physical pages from
    /// `ppage`, replacing whatever was mapped there.
    pub fn page_map(
        &mut self,
        h: ContextHandle,
        vpage: usize,
        ppage: usize,
        count: usize,
        attrs: PageAttrs,
    ) -> KernResult<()> {
        let ci = self.lookup(h)?;
        check_range(vpage, count, VPAGES)?;
        check_range(ppage, count, PPAGES)?;
        if attrs.cache != CachePolicy::NoCache {
            let (start, end) = (ppage << PAGESIZE_BITS, (ppage + count) << PAGESIZE_BITS);
            if DEVICE_WINDOWS.iter().any(|&(lo, hi)| start < hi && lo < end) {
                fail::die(format_args!(
                    "mmu: cacheable mapping of device memory at {start:#010x}"
                ));
            }
        }
        for n in 0..count {
            let (t, s) = split(vpage + n);
            let mut sub = self.contexts[ci].as_ref().map_or(NO_SUB, |c| c.top[t]);
            if sub == NO_SUB {
                sub = self.alloc_sub();
                if let Some(c) = self.contexts[ci].as_mut() {
                    c.top[t] = sub;
                }
            }
            let table = &mut self.subs[usize::from(sub)];
            let old = table.entries[s];
            if !old.valid() {
                table.used += 1;
            }
            // One store per page: an interrupt sees the old entry or the
            // new one.
            table.entries[s] = PageEntry::new(ppage + n, &attrs);
            if old.valid() {
                self.invalidate(h, vpage + n);
            }
        }
        Ok(())
    }

    /// Unmaps `count` pages at `vpage`. Pages that were not mapped are
    /// skipped.
    pub fn page_unmap(
        &mut self,
        h: ContextHandle,
        vpage: usize,
        count: usize,
    ) -> KernResult<()> {
        let ci = self.lookup(h)?;
        check_range(vpage, count, VPAGES)?;
        for n in 0..count {
            let (t, s) = split(vpage + n);
            let sub = self.contexts[ci].as_ref().map_or(NO_SUB, |c| c.top[t]);
            if sub == NO_SUB {
                continue;
            }
            let table = &mut self.subs[usize::from(sub)];
            if !table.entries[s].valid() {
                continue;
            }
            table.entries[s] = PageEntry::EMPTY;
            table.used -= 1;
            if table.used == 0 {
                *table = SubTable::FREE;
                if let Some(c) = self.contexts[ci].as_mut() {
                    c.top[t] = NO_SUB;
                }
            }
            self.invalidate(h, vpage + n);
        }
        Ok(())
    }

    fn entry(&self, h: ContextHandle, vpage: usize) -> Option<PageEntry> {
        if vpage >= VPAGES {
            return None;
        }
        let (t, s) = split(vpage);
        let sub = self.ctx(h).ok()?.top[t];
        if sub == NO_SUB {
            return None;
        }
        let e = self.subs[usize::from(sub)].entries[s];
        e.valid().then_some(e)
    }

    /// The physical page and attributes `vpage` maps to.
    pub fn page_lookup(&self, h: ContextHandle, vpage: usize) -> Option<(usize, PageAttrs)> {
        self.entry(h, vpage).map(|e| (e.ppage(), e.attrs()))
    }

    pub fn virt_to_phys(&self, h: ContextHandle, vaddr: usize) -> Option<usize> {
        let (ppage, _) = self.page_lookup(h, vaddr >> PAGESIZE_BITS)?;
        Some(ppage << PAGESIZE_BITS | (vaddr & (PAGESIZE - 1)))
    }

    /// Walks `len` bytes at `vaddr` in `h` as physical chunks that do not
    /// cross pages.
    fn for_each_chunk(
        &self,
        h: ContextHandle,
        vaddr: usize,
        len: usize,
        mut f: impl FnMut(usize, core::ops::Range<usize>),
    ) -> KernResult<()> {
        self.lookup(h)?;
        let mut done = 0;
        while done < len {
            let va = vaddr + done;
            let n = (PAGESIZE - (va & (PAGESIZE - 1))).min(len - done);
            let pa = self.virt_to_phys(h, va).ok_or(KernError::InvalidArgument)?;
            f(pa, done..done + n);
            done += n;
        }
        Ok(())
    }

    /// Copies from `h`'s virtual range at `vaddr` into `buf`.
    pub fn copyin(&self, h: ContextHandle, vaddr: usize, buf: &mut [u8]) -> KernResult<()> {
        let len = buf.len();
        // Translate everything first, so a hole leaves `buf` untouched.
        self.for_each_chunk(h, vaddr, len, |_, _| ())?;
        self.for_each_chunk(h, vaddr, len, |pa, r| arch::phys_read(pa, &mut buf[r]))
    }

    /// Copies `data` into `h`'s virtual range at `vaddr`.
    pub fn copyout(&self, h: ContextHandle, vaddr: usize, data: &[u8]) -> KernResult<()> {
        self.for_each_chunk(h, vaddr, data.len(), |_, _| ())?;
        self.for_each_chunk(h, vaddr, data.len(), |pa, r| arch::phys_write(pa, &data[r]))
    }

    /// Refills the TLB for an access to `vaddr` that missed, or says which
    /// signal the access deserves.
    pub fn tlb_miss(&mut self, vaddr: usize, write: bool) -> Result<(), Signal> {
        let h = self.current.ok_or(Signal::Segv)?;
        let vpage = vaddr >> PAGESIZE_BITS;
        let entry = self.entry(h, vpage).ok_or(Signal::Segv)?;
        let mut attrs = entry.attrs();
        if write && !attrs.writable() {
            return Err(Signal::Segv);
        }
        if write && !attrs.dirty {
            attrs.dirty = true;
            self.set_entry(h, vpage, PageEntry::new(entry.ppage(), &attrs));
        }
        self.load(h, vpage, entry.ppage(), &attrs)
    }

    /// First write to a clean page: marks it dirty and reloads it.
    pub fn initial_write(&mut self, vaddr: usize) -> Result<(), Signal> {
        let h = self.current.ok_or(Signal::Segv)?;
        let vpage = vaddr >> PAGESIZE_BITS;
        let entry = self.entry(h, vpage).ok_or(Signal::Segv)?;
        let mut attrs = entry.attrs();
        if !attrs.writable() {
            return Err(Signal::Segv);
        }
        attrs.dirty = true;
        self.set_entry(h, vpage, PageEntry::new(entry.ppage(), &attrs));
        let asid = self.context_asid(h).map_err(|_| Signal::Segv)?;
        arch::tlb_flush_page((vpage << PAGESIZE_BITS) as u32, asid);
        self.load(h, vpage, entry.ppage(), &attrs)
    }

    fn set_entry(&mut self, h: ContextHandle, vpage: usize, e: PageEntry) {
        let (t, s) = split(vpage);
        if let Ok(c) = self.ctx(h) {
            let sub = c.top[t];
            if sub != NO_SUB {
                self.subs[usize::from(sub)].entries[s] = e;
            }
        }
    }

    fn load(
        &self,
        h: ContextHandle,
        vpage: usize,
        ppage: usize,
        attrs: &PageAttrs,
    ) -> Result<(), Signal> {
        let bits = attrs.ptel_bits().ok_or(Signal::Segv)?;
        let asid = self.context_asid(h).map_err(|_| Signal::Segv)?;
        let vaddr = (vpage << PAGESIZE_BITS) as u32;
        let paddr = (ppage << PAGESIZE_BITS) as u32;
        arch::tlb_load(regs::pteh(vaddr, asid), regs::ptel(paddr, bits));
        Ok(())
    }

    /// Sub-tables not in use.
    pub fn free_subtables(&self) -> usize {
        self.subs.iter().filter(|s| !s.in_use).count()
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

fn tlb_miss_irq(k: &mut Kernel, code: u32, _: usize) -> NextThread {
    let vaddr = arch::ccn_regs().tea.get() as usize;
    let r = match code {
        irq::EXC_INITIAL_PAGE_WRITE => k.mmu.initial_write(vaddr),
        irq::EXC_DTLB_PV_READ | irq::EXC_DTLB_PV_WRITE => Err(Signal::Segv),
        _ => k.mmu.tlb_miss(vaddr, code == irq::EXC_DTLB_MISS_WRITE),
    };
    match r {
        Ok(()) => NextThread::Same,
        Err(sig) => k.trap_signal(sig, code),
    }
}

const TLB_CODES: [u32; 5] = [
    irq::EXC_DTLB_MISS_READ,
    irq::EXC_DTLB_MISS_WRITE,
    irq::EXC_INITIAL_PAGE_WRITE,
    irq::EXC_DTLB_PV_READ,
    irq::EXC_DTLB_PV_WRITE,
];

impl Kernel {
    /// Turns on address translation and takes over the TLB exceptions.
    pub fn mmu_init(&mut self) {
        self.mmu.init();
        for code in TLB_CODES {
            self.irq.set_kernel_handler(code, tlb_miss_irq, 0);
        }
    }

    pub fn mmu_shutdown(&mut self) {
        if !self.mmu.enabled() {
            return;
        }
        for code in TLB_CODES {
            self.irq.clear_kernel_handler(code);
        }
        self.mmu.shutdown();
    }
}
