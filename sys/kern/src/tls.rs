// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread-local storage.
//!
//! Two mechanisms live here. Compiler-emitted thread locals use the image's
//! TLS template: every thread gets a block laid out as
//!
//! ```text
//! GBR -> [ TCB head, 8 bytes ][ pad ][ .tdata copy ][ .tbss zeroes ]
//! ```
//!
//! with the data part aligned to the template's alignment, and the GBR
//! register pointing at the head. Thread-specific data keys are the POSIX
//! flavor: a small table of optional destructors, with the values stored in
//! each thread's control block.

use abi::{KernError, LogLevel};

use crate::err::KernResult;
use crate::kconfig::MAX_TLS_KEYS;
use crate::startup::Kernel;
use crate::util::align_up;

/// Size of the thread control block head GBR points at.
pub const TCB_SIZE: usize = 8;

/// The image's initial TLS contents.
#[derive(Copy, Clone, Debug)]
pub struct TlsTemplate {
    pub tdata: &'static [u8],
    pub tbss_size: usize,
    /// Power of two.
    pub align: usize,
}

impl TlsTemplate {
    pub const EMPTY: Self = Self {
        tdata: &[],
        tbss_size: 0,
        align: 8,
    };

    fn align(&self) -> usize {
        self.align.max(TCB_SIZE)
    }

    /// Offset of the first thread-local variable from the block start.
    pub fn data_offset(&self) -> usize {
        align_up(TCB_SIZE, self.align())
    }

    pub fn block_size(&self) -> usize {
        align_up(
            self.data_offset() + self.tdata.len() + self.tbss_size,
            TCB_SIZE,
        )
    }

    /// Lays out a fresh block at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to the template and point at `block_size()`
    /// writable bytes that nothing else uses.
    pub unsafe fn init_block(&self, base: usize) {
        let p = base as *mut u8;
        let off = self.data_offset();
        // Safety: in bounds of the block, per the contract above.
        unsafe {
            core::ptr::write_bytes(p, 0, off);
            core::ptr::copy_nonoverlapping(
                self.tdata.as_ptr(),
                p.add(off),
                self.tdata.len(),
            );
            core::ptr::write_bytes(
                p.add(off + self.tdata.len()),
                0,
                self.block_size() - off - self.tdata.len(),
            );
        }
    }

    /// Address of the variable at `offset` in the thread whose GBR is `tp`.
    pub fn var_addr(&self, tp: usize, offset: usize) -> usize {
        tp + self.data_offset() + offset
    }
}

/// Destructor run on a key's non-null value when a thread exits.
pub type KeyDestructor = fn(usize);

/// Identifies a thread-specific data key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TlsKey(u8);

#[derive(Copy, Clone, Debug)]
struct KeySlot {
    destructor: Option<KeyDestructor>,
}

#[derive(Debug)]
pub struct KeyTable {
    slots: [Option<KeySlot>; MAX_TLS_KEYS],
}

impl KeyTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_TLS_KEYS],
        }
    }

    fn check(&self, key: TlsKey) -> KernResult<usize> {
        let i = usize::from(key.0);
        match self.slots.get(i) {
            Some(Some(_)) => Ok(i),
            _ => Err(KernError::BadHandle),
        }
    }

    pub(crate) fn destructors(&self) -> [Option<KeyDestructor>; MAX_TLS_KEYS] {
        let mut out = [None; MAX_TLS_KEYS];
        for (o, s) in out.iter_mut().zip(&self.slots) {
            *o = s.and_then(|s| s.destructor);
        }
        out
    }
}

impl Default for KeyTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Destructor passes made on exit before giving up on values that keep
/// coming back.
const DESTRUCTOR_ROUNDS: usize = 4;

impl Kernel {
    pub fn key_create(&mut self, destructor: Option<KeyDestructor>) -> KernResult<TlsKey> {
        let i = self
            .sched
            .keys
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernError::ResourceExhausted)?;
        self.sched.keys.slots[i] = Some(KeySlot { destructor });
        // A recycled key starts out null everywhere.
        self.sched.for_each_thread_mut(|t| t.specific[i] = 0);
        Ok(TlsKey(i as u8))
    }

    /// Deletes `key`. Destructors are not run for values still set.
    pub fn key_delete(&mut self, key: TlsKey) -> KernResult<()> {
        let i = self.sched.keys.check(key)?;
        self.sched.keys.slots[i] = None;
        Ok(())
    }

    pub fn set_specific(&mut self, key: TlsKey, value: usize) -> KernResult<()> {
        let i = self.sched.keys.check(key)?;
        self.sched.current_mut().specific[i] = value;
        Ok(())
    }

    pub fn get_specific(&self, key: TlsKey) -> KernResult<usize> {
        let i = self.sched.keys.check(key)?;
        Ok(self.sched.current().specific[i])
    }

    /// Runs key destructors for the thread in slot `idx`.
    pub(crate) fn run_key_destructors(&mut self, idx: usize) {
        let dtors = self.sched.keys.destructors();
        for _ in 0..DESTRUCTOR_ROUNDS {
            let mut ran = false;
            for (i, d) in dtors.iter().enumerate() {
                let Some(d) = d else { continue };
                let Some(t) = self.sched.thread_mut(idx) else { return };
                let v = core::mem::take(&mut t.specific[i]);
                if v != 0 {
                    d(v);
                    ran = true;
                }
            }
            if !ran {
                return;
            }
        }
        dbglog!(
            LogLevel::Warning,
            "tls: values survived {} destructor rounds",
            DESTRUCTOR_ROUNDS
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static TDATA: [u8; 3] = [5, 6, 7];

    #[test]
    fn block_layout_honours_alignment() {
        let t = TlsTemplate {
            tdata: &TDATA,
            tbss_size: 5,
            align: 32,
        };
        assert_eq!(t.data_offset(), 32);
        assert_eq!(t.block_size(), 40);
        let mut mem = [0xffu8; 64];
        let base = mem.as_mut_ptr() as usize;
        unsafe { t.init_block(base) };
        assert_eq!(&mem[..8], &[0; 8]);
        assert_eq!(&mem[32..35], &TDATA);
        assert_eq!(&mem[35..40], &[0; 5]);
        assert_eq!(mem[40], 0xff);
        assert_eq!(t.var_addr(base, 3), base + 35);
    }

    static DROPPED: AtomicUsize = AtomicUsize::new(0);

    fn drop_value(v: usize) {
        DROPPED.fetch_add(v, Ordering::SeqCst);
    }

    #[test]
    fn keys_are_per_thread_and_destructed_on_exit() {
        let mut k = testutil::boot();
        let key = k.key_create(Some(drop_value)).unwrap();
        let t = testutil::spawn(&mut k, "worker");
        k.set_specific(key, 7).unwrap();
        k.yield_now();
        assert_eq!(k.current(), t);
        assert_eq!(k.get_specific(key), Ok(0));
        k.set_specific(key, 100).unwrap();
        k.thread_exit(0);
        assert_eq!(DROPPED.load(Ordering::SeqCst), 100);
        assert_eq!(k.get_specific(key), Ok(7));
        k.key_delete(key).unwrap();
        assert_eq!(k.get_specific(key), Err(KernError::BadHandle));
    }

    /// `tdata` holds a `u32` starting at 5; the `u32` after it is `tbss`.
    static COUNTERS: [u8; 4] = [5, 0, 0, 0];
    const TDATA_VAR: usize = 0;
    const TBSS_VAR: usize = 4;

    fn counters() -> TlsTemplate {
        TlsTemplate {
            tdata: &COUNTERS,
            tbss_size: 4,
            align: 8,
        }
    }

    /// The variable at `offset` as the running thread sees it: through the
    /// thread pointer register.
    fn tls_var(k: &Kernel, offset: usize) -> *mut u32 {
        let tp = crate::arch::current_tls_base();
        assert_eq!(tp, k.sched.current().tls_base());
        k.sched.tls.var_addr(tp, offset) as *mut u32
    }

    fn bump(k: &Kernel, offset: usize) -> u32 {
        let p = tls_var(k, offset);
        // Safety: points into the current thread's live TLS block.
        unsafe {
            let v = p.read();
            p.write(v + 1);
            v
        }
    }

    #[test]
    fn tls_across_two_sleeping_threads() {
        use crate::err::Wait;
        use std::vec::Vec;

        let mut k = testutil::boot_tls(abi::InitFlags::IRQ, counters());
        let main = k.current();
        let a = testutil::spawn(&mut k, "a");
        let b = testutil::spawn(&mut k, "b");
        let mut seen: [(Vec<u32>, Vec<u32>); 2] = Default::default();
        let mut joined = 0;
        let mut joining = false;

        for _ in 0..10_000 {
            let me = k.current();
            if me == a || me == b {
                let (bss, data) = &mut seen[usize::from(me == b)];
                if bss.len() == 5 {
                    k.thread_exit(0);
                    continue;
                }
                k.take_wake();
                bss.push(bump(&k, TBSS_VAR));
                data.push(bump(&k, TDATA_VAR));
                assert!(k.sleep_ms(50).unwrap().is_blocked());
            } else if me == main {
                if core::mem::take(&mut joining) {
                    assert_eq!(k.take_wake(), Some(crate::err::WakeResult::Ready(0)));
                    joined += 1;
                }
                if joined == 2 {
                    break;
                }
                match k.thread_join([a, b][joined]).unwrap() {
                    Wait::Done(v) => {
                        assert_eq!(v, 0);
                        joined += 1;
                    }
                    Wait::Blocked => joining = true,
                }
            } else {
                crate::arch::advance_ns(10_000_000);
                k.handle_exception(crate::irq::EXC_TMU0_TUNI0);
            }
        }

        assert_eq!(joined, 2);
        for (bss, data) in &seen {
            assert_eq!(bss, &[0, 1, 2, 3, 4]);
            assert_eq!(data, &[5, 6, 7, 8, 9]);
        }
        // The boot thread's own copy is untouched.
        assert_eq!(unsafe { tls_var(&k, TDATA_VAR).read() }, 5);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

        /// Interleaved increments never leak between threads.
        #[test]
        fn thread_locals_stay_private(threads in 1usize..6, rounds in 1u32..8) {
            let mut k = testutil::boot_tls(abi::InitFlags::IRQ, counters());
            let main = k.current();
            let ids: std::vec::Vec<_> = (0..threads)
                .map(|_| testutil::spawn(&mut k, "inc"))
                .collect();
            let mut finals = std::vec::Vec::new();
            for _ in 0..threads * (rounds as usize + 2) * 4 + 16 {
                let me = k.current();
                if me == main {
                    if finals.len() == threads {
                        break;
                    }
                    k.yield_now();
                    continue;
                }
                proptest::prop_assert!(ids.contains(&me));
                if bump(&k, TDATA_VAR) + 1 == 5 + rounds {
                    // Safety: the thread's own block.
                    finals.push(unsafe { tls_var(&k, TDATA_VAR).read() });
                    k.thread_exit(0);
                } else {
                    k.yield_now();
                }
            }
            proptest::prop_assert_eq!(finals.len(), threads);
            proptest::prop_assert!(finals.iter().all(|&v| v == 5 + rounds));
        }
    }

    #[test]
    fn keys_run_out() {
        let mut k = testutil::boot();
        for _ in 0..MAX_TLS_KEYS {
            k.key_create(None).unwrap();
        }
        assert_eq!(k.key_create(None), Err(KernError::ResourceExhausted));
    }
}
