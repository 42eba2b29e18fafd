// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common utility functions used in various places in the kernel.

/// Rounds `v` up to a multiple of `align`, which must be a power of two.
#[inline(always)]
pub const fn align_up(v: usize, align: usize) -> usize {
    (v + align - 1) & !(align - 1)
}

/// `align_up` that reports overflow instead of wrapping.
#[inline(always)]
pub const fn checked_align_up(v: usize, align: usize) -> Option<usize> {
    match v.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

#[inline(always)]
pub const fn align_down(v: usize, align: usize) -> usize {
    v & !(align - 1)
}
