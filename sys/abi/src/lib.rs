// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel, drivers and
//! applications.

#![no_std]

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of bits in a `ThreadId` used to hold the thread table index.
pub const THREAD_ID_INDEX_BITS: u32 = 8;

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines two fields, a thread table index and a generation
/// number. The generation number of a slot is incremented every time the slot
/// is reclaimed, so an id held after the thread it named has been joined (or
/// detached and exited) is recognizably stale and is rejected with
/// `KernError::BadHandle` instead of silently naming a newer thread.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << THREAD_ID_INDEX_BITS) - 1;

    /// Fabricates a `ThreadId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ThreadId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << THREAD_ID_INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> THREAD_ID_INDEX_BITS) as u8)
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation().0)
    }
}

/// Type used to track generation numbers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Indicates priority of a thread.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`, to
/// keep us from confusing ourselves on whether `>` means numerically greater /
/// less important, or more important / numerically smaller.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Priority given to threads created without an explicit one.
    pub const DEFAULT: Self = Self(10);
    /// Reserved for the idle thread; nothing else may use it.
    pub const IDLE: Self = Self(u8::MAX);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Errors surfaced to callers of kernel operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum KernError {
    /// Null or misaligned argument, out-of-range enumerator, zero or negative
    /// duration.
    InvalidArgument = 1,
    /// Out of memory, thread slots, timer slots, or table space.
    ResourceExhausted,
    /// The operation would have to block and the caller may not.
    WouldBlock,
    /// A timed wait reached its deadline.
    TimedOut,
    /// Unknown or stale thread, timer, context, key or device.
    BadHandle,
    /// Called from IRQ context where that is refused, or a wait was cut
    /// short by a signal or cancellation.
    Interrupted,
    /// The caller already holds the non-recursive lock it asked for.
    Deadlock,
    /// The caller does not own the object it tried to release.
    NotPermitted,
    /// The object has waiters and cannot be destroyed.
    Busy,
}

impl KernError {
    /// The newlib `errno` value for this error, for libc glue.
    pub fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => 22,
            Self::ResourceExhausted => 12,
            Self::WouldBlock => 11,
            Self::TimedOut => 116,
            Self::BadHandle => 3,
            Self::Interrupted => 4,
            Self::Deadlock => 45,
            Self::NotPermitted => 1,
            Self::Busy => 16,
        }
    }

    /// Inverse of `errno`.
    pub fn from_errno(errno: i32) -> Option<Self> {
        Some(match errno {
            22 => Self::InvalidArgument,
            12 => Self::ResourceExhausted,
            11 => Self::WouldBlock,
            116 => Self::TimedOut,
            3 => Self::BadHandle,
            4 => Self::Interrupted,
            45 => Self::Deadlock,
            1 => Self::NotPermitted,
            16 => Self::Busy,
            _ => return None,
        })
    }
}

impl core::fmt::Display for KernError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid argument",
            Self::ResourceExhausted => "resource exhausted",
            Self::WouldBlock => "operation would block",
            Self::TimedOut => "timed out",
            Self::BadHandle => "bad handle",
            Self::Interrupted => "interrupted",
            Self::Deadlock => "deadlock",
            Self::NotPermitted => "not permitted",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Signals raised by the kernel in response to CPU traps (and `abort`).
///
/// Numbering follows newlib.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(i32)]
pub enum Signal {
    Ill = 4,
    Abrt = 6,
    Fpe = 8,
    Segv = 11,
}

/// Size of the signal handler table; valid signal numbers are `1..NSIG`.
pub const NSIG: usize = 32;

impl Signal {
    pub fn number(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ill => "SIGILL",
            Self::Abrt => "SIGABRT",
            Self::Fpe => "SIGFPE",
            Self::Segv => "SIGSEGV",
        }
    }
}

bitflags::bitflags! {
    /// Subsystems brought up at boot.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct InitFlags: u32 {
        const IRQ = 1 << 0;
        const THD_PREEMPT = 1 << 1;
        const NET = 1 << 2;
        const MALLOCSTATS = 1 << 3;
        const QUIET = 1 << 4;
        const EXPORT = 1 << 5;
        const FS_ROMDISK = 1 << 6;

        const CONTROLLER = 1 << 16;
        const KEYBOARD = 1 << 17;
        const MOUSE = 1 << 18;
        const LIGHTGUN = 1 << 19;
        const VMU = 1 << 20;
        const PURUPURU = 1 << 21;
        const SIP = 1 << 22;
        const DREAMEYE = 1 << 23;

        /// Every peripheral driver.
        const ARCH_DEFAULTS = Self::CONTROLLER.bits()
            | Self::KEYBOARD.bits()
            | Self::MOUSE.bits()
            | Self::LIGHTGUN.bits()
            | Self::VMU.bits()
            | Self::PURUPURU.bits()
            | Self::SIP.bits()
            | Self::DREAMEYE.bits();

        const DEFAULT = Self::IRQ.bits()
            | Self::THD_PREEMPT.bits()
            | Self::FS_ROMDISK.bits()
            | Self::ARCH_DEFAULTS.bits();
    }
}

/// Debug log severity. Lower is more severe.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    FromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum LogLevel {
    Dead = 0,
    Critical = 1,
    Error = 2,
    Warning = 3,
    Notice = 4,
    Info = 5,
    Debug = 6,
    KDebug = 7,
}

impl LogLevel {
    /// Urgent messages skip the output lock so they get out during a crash.
    pub fn is_urgent(self) -> bool {
        self <= LogLevel::Critical
    }
}

/// Access permission of a page mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Perm {
    /// Mapped but inaccessible; any access faults.
    None,
    ReadOnly,
    ReadWrite,
    PrivReadOnly,
    PrivReadWrite,
    AllReadWrite,
}

/// Cache policy of a page mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    Cacheable,
    NoCache,
    WriteThrough,
}

bitflags::bitflags! {
    /// Peripheral-bus function codes, as reported by a device in its
    /// device-info record.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct MapleFunc: u32 {
        const PURUPURU = 0x0001_0000;
        const MOUSE = 0x0002_0000;
        const DREAMEYE = 0x0008_0000;
        const CONTROLLER = 0x0100_0000;
        const VMU = 0x0200_0000;
        const LCD = 0x0400_0000;
        const CLOCK = 0x0800_0000;
        const SIP = 0x1000_0000;
        const ARGUN = 0x2000_0000;
        const KEYBOARD = 0x4000_0000;
        const LIGHTGUN = 0x8000_0000;
    }
}

/// POSIX `struct timespec`, as passed to `nanosleep`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct Timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

pub const NS_PER_SEC: u64 = 1_000_000_000;

impl Timespec {
    pub const ZERO: Self = Self {
        tv_sec: 0,
        tv_nsec: 0,
    };

    pub fn from_ns(ns: u64) -> Self {
        Self {
            tv_sec: (ns / NS_PER_SEC) as i64,
            tv_nsec: (ns % NS_PER_SEC) as i64,
        }
    }

    /// Converts to nanoseconds. Negative fields, or a nanosecond field of a
    /// second or more, are invalid.
    pub fn to_ns(&self) -> Result<u64, KernError> {
        if self.tv_sec < 0
            || self.tv_nsec < 0
            || self.tv_nsec as u64 >= NS_PER_SEC
        {
            return Err(KernError::InvalidArgument);
        }
        (self.tv_sec as u64)
            .checked_mul(NS_PER_SEC)
            .and_then(|ns| ns.checked_add(self.tv_nsec as u64))
            .ok_or(KernError::InvalidArgument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn thread_id_packs_index_and_generation() {
        let id = ThreadId::for_index_and_gen(7, Generation::from(3));
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), Generation::from(3));
        assert_eq!(id.0, 7 | 3 << 8);
    }

    #[test]
    fn generation_wraps() {
        assert_eq!(Generation::from(255).next(), Generation::ZERO);
    }

    #[test]
    fn priority_zero_is_most_important() {
        assert!(Priority(0).is_more_important_than(Priority(1)));
        assert!(!Priority::IDLE.is_more_important_than(Priority::DEFAULT));
        assert!(!Priority(4).is_more_important_than(Priority(4)));
    }

    #[test]
    fn default_init_flags_include_every_peripheral() {
        let d = InitFlags::DEFAULT;
        assert!(d.contains(InitFlags::IRQ | InitFlags::THD_PREEMPT));
        assert!(d.contains(InitFlags::CONTROLLER | InitFlags::DREAMEYE));
        assert!(!d.contains(InitFlags::NET));
    }

    #[test]
    fn log_levels_round_trip_through_numbers() {
        assert_eq!(LogLevel::from_u8(0), Some(LogLevel::Dead));
        assert_eq!(LogLevel::from_u8(7), Some(LogLevel::KDebug));
        assert_eq!(LogLevel::from_u8(8), None);
        assert!(LogLevel::Critical.is_urgent());
        assert!(!LogLevel::Error.is_urgent());
    }

    #[test]
    fn timespec_rejects_bad_fields() {
        let bad = Timespec {
            tv_sec: 0,
            tv_nsec: NS_PER_SEC as i64,
        };
        assert_eq!(bad.to_ns(), Err(KernError::InvalidArgument));
        let neg = Timespec {
            tv_sec: -1,
            tv_nsec: 0,
        };
        assert_eq!(neg.to_ns(), Err(KernError::InvalidArgument));
        let ok = Timespec {
            tv_sec: 2,
            tv_nsec: 5,
        };
        assert_eq!(ok.to_ns(), Ok(2_000_000_005));
        assert_eq!(Timespec::from_ns(2_000_000_005), ok);
    }

    #[test]
    fn errors_map_to_newlib_errno() {
        assert_eq!(KernError::InvalidArgument.errno(), 22);
        assert_eq!(KernError::from_u32(2), Some(KernError::ResourceExhausted));
    }
}
