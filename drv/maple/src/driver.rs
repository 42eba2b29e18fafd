// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver table entries and attached-device records.

use abi::{KernError, MapleFunc};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::bus::Events;
use crate::devinfo::DevInfo;
use crate::proto::{FrameReq, MapleAddr, Response};

/// Bytes of driver-owned status kept per attached device.
pub const STATUS_LEN: usize = 64;

/// A function driver.
///
/// The bus binds a newly attached device to the first registered driver
/// whose `functions` intersect the functions the device reports.
pub struct MapleDriver {
    pub name: &'static str,
    pub functions: MapleFunc,
    /// Prepares the device's status buffer. An error leaves the device
    /// attached but unbound.
    pub attach: fn(&mut Device) -> Result<(), KernError>,
    pub detach: fn(&mut Device),
    /// Builds the status fetch sent every cycle. Devices whose driver has no
    /// poll routine still get a liveness probe.
    pub poll: Option<fn(&Device) -> FrameReq>,
    /// Consumes the answer to `poll`.
    pub reply: fn(&mut Device, &Response<'_>, &mut Events),
    /// Driver-specific control.
    pub ioctl: Option<fn(&mut Device, u32, usize) -> Result<FrameReq, KernError>>,
}

impl core::fmt::Debug for MapleDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MapleDriver")
            .field("name", &self.name)
            .field("functions", &self.functions)
            .finish()
    }
}

/// An attached device.
pub struct Device {
    pub addr: MapleAddr,
    pub info: DevInfo,
    pub driver: Option<&'static MapleDriver>,
    /// Set once the driver has stored a status.
    pub status_valid: bool,
    status: [u8; STATUS_LEN],
}

impl Device {
    pub fn new(
        addr: MapleAddr,
        info: DevInfo,
        driver: Option<&'static MapleDriver>,
    ) -> Self {
        Self {
            addr,
            info,
            driver,
            status_valid: false,
            status: [0; STATUS_LEN],
        }
    }

    pub fn functions(&self) -> MapleFunc {
        self.info.functions()
    }

    /// Reads the driver's status record.
    pub fn status<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.status[..]).ok().map(|(t, _)| t)
    }

    /// Replaces the driver's status record.
    pub fn set_status<T: IntoBytes + Immutable>(&mut self, value: &T) {
        let bytes = value.as_bytes();
        let n = bytes.len().min(STATUS_LEN);
        self.status[..n].copy_from_slice(&bytes[..n]);
        self.status_valid = true;
    }

    pub fn clear_status(&mut self) {
        self.status = [0; STATUS_LEN];
        self.status_valid = false;
    }
}
