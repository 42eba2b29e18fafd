// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver framework for the maple peripheral bus.
//!
//! The maple bus is a four-port, daisy-chained serial bus. Each port hosts a
//! main unit (unit 0) which may announce up to five sub-units (1-5) plugged
//! into it. The host talks to devices by handing the bus controller a DMA
//! command list; the controller runs every command in order, writes each
//! response into a receive buffer, and raises a completion interrupt.
//!
//! # Bus cycle
//!
//! `MapleBus` is polled once per video frame:
//!
//! 1. `start_cycle` (vertical blank IRQ) builds the command list: a device
//!    info probe for every empty slot that could hold a device, and a status
//!    fetch (or liveness probe) for every attached device. The list and its
//!    receive buffers then belong to the hardware.
//! 2. `complete_cycle` (DMA completion IRQ) takes the buffers back and runs
//!    the attach pipeline for new devices, the status handlers of bound
//!    drivers, and the detach pipeline for devices that failed to answer for
//!    `detach_threshold` consecutive cycles.
//! 3. `dispatch_events` (bus event thread, outside IRQ context) delivers the
//!    queued attach, detach, button and key events to user callbacks.
//!
//! # Hardware seam
//!
//! The crate knows nothing about the kernel. Access to the controller goes
//! through the `MapleHw` trait; the kernel implements it over the real
//! registers, and the `sim` module provides a simulated bus for host builds
//! and tests.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod controller;
pub mod devinfo;
pub mod driver;
pub mod keyboard;
pub mod mouse;
pub mod proto;
pub mod purupuru;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use bus::{MapleBus, MapleEvent};
pub use devinfo::DevInfo;
pub use driver::{Device, MapleDriver};
pub use proto::{MapleAddr, RecvBuf};

/// Access to the bus controller's DMA engine.
///
/// The controller owns the command list and the receive buffers between
/// `start` and the completion interrupt; `MapleBus` does not touch either
/// until it has called `finish`.
pub trait MapleHw {
    /// Resets the controller and enables the bus.
    fn init(&mut self);

    /// Disables the bus.
    fn shutdown(&mut self);

    /// Bus address the controller should deliver a response to.
    fn dma_addr(&self, buf: &RecvBuf) -> u32;

    /// Hands `list` to the controller and starts the transfer. Responses
    /// land in `recv`, one buffer per command, in list order.
    fn start(&mut self, list: &[u32], recv: &mut [RecvBuf]);

    /// Called from the completion interrupt before any buffer is read, to
    /// make the controller's writes visible to the CPU.
    fn finish(&mut self, recv: &mut [RecvBuf]);
}

/// Logging hook installed by the kernel.
pub type LogFn = fn(abi::LogLevel, core::fmt::Arguments<'_>);
