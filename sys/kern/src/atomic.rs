// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel atomic type support.

use core::sync::atomic::Ordering;

/// An atomic type with the operations we need in the kernel.
///
/// SH-4 has no atomic read-modify-write instructions, and `core` leaves
/// `swap` and friends out on such targets. This trait describes the
/// complement of atomic ops the kernel needs; on a single-core CPU they can
/// be built by masking interrupts around a load and a store.
///
/// Implementations of this trait are in the `arch::whatever` module for the
/// target architecture.
pub(crate) trait AtomicExt {
    type Primitive;
    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive;
}
