// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Fallible kernel operations return `KernResult`. Operations that may have
//! to suspend the calling thread additionally say whether they finished or
//! left the caller blocked; in the latter case the outcome arrives later as
//! a `WakeResult`, both in the thread's return register and in its control
//! block.

pub use abi::KernError;

pub type KernResult<T> = Result<T, KernError>;

/// Outcome of an operation that may suspend the calling thread.
#[must_use]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wait<T> {
    /// Completed without blocking.
    Done(T),
    /// The caller is blocked; another thread is current now.
    Blocked,
}

impl<T> Wait<T> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Wait::Blocked)
    }

    pub fn done(self) -> Option<T> {
        match self {
            Wait::Done(v) => Some(v),
            Wait::Blocked => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Wait<U> {
        match self {
            Wait::Done(v) => Wait::Done(f(v)),
            Wait::Blocked => Wait::Blocked,
        }
    }
}

/// Why a blocked thread became runnable again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WakeResult {
    /// The awaited condition happened; the value depends on the wait.
    Ready(usize),
    TimedOut,
    /// Cancelled, or interrupted by a signal.
    Interrupted,
}

impl WakeResult {
    /// Encoding for the return register: values as-is, errors as negated
    /// errno.
    pub fn to_reg(self) -> usize {
        match self {
            WakeResult::Ready(v) => v,
            WakeResult::TimedOut => KernError::TimedOut.errno().wrapping_neg() as usize,
            WakeResult::Interrupted => {
                KernError::Interrupted.errno().wrapping_neg() as usize
            }
        }
    }

    pub fn into_result(self) -> KernResult<usize> {
        match self {
            WakeResult::Ready(v) => Ok(v),
            WakeResult::TimedOut => Err(KernError::TimedOut),
            WakeResult::Interrupted => Err(KernError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_results_encode_as_negated_errno() {
        assert_eq!(WakeResult::Ready(7).to_reg(), 7);
        assert_eq!(WakeResult::TimedOut.to_reg() as isize, -116);
        assert_eq!(WakeResult::Interrupted.to_reg() as isize, -4);
        assert_eq!(WakeResult::TimedOut.into_result(), Err(KernError::TimedOut));
    }

    #[test]
    fn wait_map() {
        assert_eq!(Wait::Done(2).map(|v| v * 2), Wait::Done(4));
        assert!(Wait::<u8>::Blocked.map(|v| v + 1).is_blocked());
    }
}
