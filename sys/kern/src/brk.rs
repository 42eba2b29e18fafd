// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The program break.
//!
//! A bump arena from the end of the loaded image up to the top of RAM less
//! the kernel stack reserve. libc's malloc grows it through `sbrk`; the
//! kernel carves thread stacks and TLS blocks from it as well.
//!
//! ```text
//! start          current              end               max
//!   |  allocated  |   free capacity    |   held back     |
//! ```

use abi::KernError;

use crate::err::KernResult;
use crate::fail;
use crate::irq;
use crate::util::{align_up, checked_align_up};

/// Granularity of `sbrk`.
pub const BRK_ALIGN: usize = 4;

#[derive(Debug, Default)]
pub struct Brk {
    start: usize,
    current: usize,
    end: usize,
    max: usize,
    initialized: bool,
}

impl Brk {
    pub const fn new() -> Self {
        Self {
            start: 0,
            current: 0,
            end: 0,
            max: 0,
            initialized: false,
        }
    }

    /// Sets up the arena over `[start, max)` and zeroes it.
    ///
    /// # Safety
    ///
    /// The range must be RAM that nothing else uses.
    pub unsafe fn init(&mut self, start: usize, max: usize) {
        if self.initialized {
            fail::die("brk initialized twice");
        }
        let start = align_up(start, BRK_ALIGN);
        uassert!(start <= max);
        // Safety: the caller hands us the range.
        unsafe {
            core::ptr::write_bytes(start as *mut u8, 0, max - start);
        }
        *self = Self {
            start,
            current: start,
            end: max,
            max,
            initialized: true,
        };
        dbglog!(
            abi::LogLevel::Debug,
            "brk: {:#010x}..{:#010x}, {} KiB",
            start,
            max,
            (max - start) / 1024
        );
    }

    /// Moves the break by `delta` bytes, rounded up to `BRK_ALIGN`, and
    /// returns the old break. On failure nothing changes.
    pub fn sbrk(&mut self, delta: isize) -> KernResult<usize> {
        irq::interrupt_free(|| {
            let old = self.current;
            // Rounding toward positive infinity in both directions.
            let new = if delta >= 0 {
                let d = align_up(delta as usize, BRK_ALIGN);
                old.checked_add(d).ok_or(KernError::ResourceExhausted)?
            } else {
                let d = delta.unsigned_abs() & !(BRK_ALIGN - 1);
                old.checked_sub(d).ok_or(KernError::InvalidArgument)?
            };
            if new < self.start {
                return Err(KernError::InvalidArgument);
            }
            if new > self.end {
                return Err(KernError::ResourceExhausted);
            }
            self.current = new;
            Ok(old)
        })
    }

    pub fn brk_start(&self) -> usize {
        self.start
    }

    /// The current break.
    pub fn brk_end(&self) -> usize {
        self.current
    }

    pub fn brk_max(&self) -> usize {
        self.max
    }

    /// The capacity watermark.
    pub fn brk_capacity(&self) -> usize {
        self.end
    }

    pub fn brk_remaining(&self) -> usize {
        self.end - self.current
    }

    /// Sets the break to `start + n`.
    pub fn brk_set_size(&mut self, n: usize) -> KernResult<()> {
        irq::interrupt_free(|| {
            let new = checked_align_up(n, BRK_ALIGN)
                .and_then(|n| self.start.checked_add(n))
                .ok_or(KernError::ResourceExhausted)?;
            if new > self.end {
                return Err(KernError::ResourceExhausted);
            }
            self.current = new;
            Ok(())
        })
    }

    /// Sets the capacity watermark to `start + n`, which must lie between
    /// the current break and `max`.
    pub fn brk_set_capacity(&mut self, n: usize) -> KernResult<()> {
        irq::interrupt_free(|| {
            let new = self.start.checked_add(n).ok_or(KernError::InvalidArgument)?;
            if new < self.current || new > self.max {
                return Err(KernError::InvalidArgument);
            }
            self.end = new;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arena(len: usize) -> Brk {
        let mem: &'static mut [u32] = std::vec![0xdead_beef_u32; len / 4].leak();
        let base = mem.as_mut_ptr() as usize;
        let mut b = Brk::new();
        unsafe { b.init(base + 1, base + len) };
        b
    }

    #[test]
    fn start_is_aligned_and_zeroed() {
        let b = arena(256);
        assert_eq!(b.brk_start() % BRK_ALIGN, 0);
        let bytes = unsafe {
            core::slice::from_raw_parts(b.brk_start() as *const u8, b.brk_max() - b.brk_start())
        };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn sbrk_fails_without_side_effects() {
        let mut b = arena(64);
        let before = b.brk_end();
        assert_eq!(b.sbrk(1 << 20), Err(KernError::ResourceExhausted));
        assert_eq!(b.sbrk(-8), Err(KernError::InvalidArgument));
        assert_eq!(b.brk_end(), before);
    }

    #[test]
    fn negative_delta_rounds_toward_positive_infinity() {
        let mut b = arena(256);
        let a = b.sbrk(16).unwrap();
        assert_eq!(b.sbrk(-7).unwrap(), a + 16);
        // -7 shrinks by 4, not 8.
        assert_eq!(b.brk_end(), a + 12);
    }

    #[test]
    fn capacity_bounds_growth() {
        let mut b = arena(1024);
        b.brk_set_capacity(64).unwrap();
        assert_eq!(b.brk_remaining(), 64);
        assert_eq!(b.sbrk(65), Err(KernError::ResourceExhausted));
        b.sbrk(32).unwrap();
        assert_eq!(b.brk_set_capacity(16), Err(KernError::InvalidArgument));
        b.brk_set_size(0).unwrap();
        assert_eq!(b.brk_end(), b.brk_start());
    }

    #[test]
    fn huge_sizes_are_exhaustion() {
        let mut b = arena(64);
        let before = b.brk_end();
        for n in [usize::MAX, usize::MAX - 2, usize::MAX - b.brk_start() + 1] {
            assert_eq!(b.brk_set_size(n), Err(KernError::ResourceExhausted));
        }
        assert_eq!(b.brk_end(), before);
    }

    #[test]
    #[should_panic(expected = "CPU halted")]
    fn second_init_is_fatal() {
        let mut b = arena(64);
        let s = b.brk_start();
        unsafe { b.init(s, s + 16) };
    }

    proptest! {
        #[test]
        fn sbrk_is_monotonic(deltas in proptest::collection::vec(1isize..512, 1..64)) {
            let mut b = arena(64 * 1024);
            let mut prev: Option<(usize, isize)> = None;
            for d in deltas {
                let at = b.sbrk(d).unwrap();
                if let Some((p, pd)) = prev {
                    prop_assert!(at > p);
                    prop_assert_eq!(at - p, align_up(pd as usize, BRK_ALIGN));
                }
                prev = Some((at, d));
            }
        }
    }
}
