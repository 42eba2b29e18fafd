// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Saved register context of a thread.
//!
//! The exception entry path stores the interrupted thread's registers here
//! and the exit path reloads whichever context the scheduler leaves current.
//! The layout is shared with the assembly stubs, so field order matters.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// General registers are machine words; on the target that is 32 bits.
pub type Word = usize;

/// SR: privileged mode.
pub const SR_MD: Word = 1 << 30;
/// SR: register bank select.
pub const SR_RB: Word = 1 << 29;
/// SR: exceptions blocked.
pub const SR_BL: Word = 1 << 28;
/// SR: FPU disabled.
pub const SR_FD: Word = 1 << 15;
pub const SR_IMASK_SHIFT: u32 = 4;
pub const SR_IMASK: Word = 0xf << SR_IMASK_SHIFT;

/// Initial FPSCR of a new thread: round to nearest, denormals flushed,
/// single precision.
pub const FPSCR_INIT: Word = 0x0004_0001;

#[repr(C)]
#[derive(Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SavedState {
    /// r0-r15; r15 is the stack pointer.
    pub r: [Word; 16],
    pub pc: Word,
    pub pr: Word,
    pub sr: Word,
    /// Thread pointer; TLS accesses are relative to it.
    pub gbr: Word,
    pub mach: Word,
    pub macl: Word,
    pub fpscr: Word,
    pub fpul: Word,
    pub fr: [Word; 16],
}

static_assertions::const_assert_eq!(
    core::mem::offset_of!(SavedState, pc),
    16 * core::mem::size_of::<Word>()
);

impl SavedState {
    /// Context for a thread that starts at `pc` with `args` in r4..r7, the
    /// stack pointer at `sp`, returning into `ret` and with its TLS block at
    /// `tls`.
    pub fn for_thread(
        pc: Word,
        args: &[Word],
        sp: Word,
        ret: Word,
        tls: Word,
    ) -> Self {
        let mut s = Self {
            pc,
            pr: ret,
            // Privileged, bank 0, all interrupts enabled.
            sr: SR_MD,
            gbr: tls,
            fpscr: FPSCR_INIT,
            ..Self::default()
        };
        for (i, &a) in args.iter().take(4).enumerate() {
            s.set_arg(i, a);
        }
        s.set_sp(sp);
        s
    }

    /// Reads argument register `n` (r4 + n).
    pub fn arg(&self, n: usize) -> Word {
        self.r[4 + n]
    }

    pub fn set_arg(&mut self, n: usize, v: Word) {
        self.r[4 + n] = v;
    }

    /// Reads the return-value register (r0).
    pub fn ret(&self) -> Word {
        self.r[0]
    }

    pub fn set_ret(&mut self, v: Word) {
        self.r[0] = v;
    }

    pub fn sp(&self) -> Word {
        self.r[15]
    }

    pub fn set_sp(&mut self, v: Word) {
        self.r[15] = v;
    }

    pub fn tls_base(&self) -> Word {
        self.gbr
    }

    pub fn set_tls_base(&mut self, v: Word) {
        self.gbr = v;
    }

    /// Where execution resumes on exception return.
    pub fn resume_pc(&self) -> Word {
        self.pc
    }

    pub fn imask(&self) -> u8 {
        ((self.sr & SR_IMASK) >> SR_IMASK_SHIFT) as u8
    }

    pub fn set_imask(&mut self, level: u8) {
        self.sr = (self.sr & !SR_IMASK)
            | (Word::from(level & 0xf) << SR_IMASK_SHIFT);
    }
}
