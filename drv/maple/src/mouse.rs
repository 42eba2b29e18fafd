// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mouse: buttons and relative motion.

use abi::{KernError, MapleFunc};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bus::{Events, MapleBus};
use crate::driver::{Device, MapleDriver};
use crate::proto::{FrameReq, MapleAddr, Response};
use crate::MapleHw;

pub const BUTTON_RIGHT: u32 = 1 << 1;
pub const BUTTON_LEFT: u32 = 1 << 2;
pub const BUTTON_SIDE: u32 = 1 << 3;

/// Axis readings are offsets from this value.
const AXIS_CENTER: i32 = 0x200;

#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawCond {
    buttons: u32,
    axes: [u16; 8],
}

#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct MouseState {
    pub buttons: u32,
    pub dx: i32,
    pub dy: i32,
    pub dz: i32,
}

fn attach(dev: &mut Device) -> Result<(), KernError> {
    dev.set_status(&MouseState::default());
    dev.status_valid = false;
    Ok(())
}

fn detach(_dev: &mut Device) {}

fn poll(dev: &Device) -> FrameReq {
    FrameReq::get_cond(dev.addr, MapleFunc::MOUSE)
}

fn reply(dev: &mut Device, resp: &Response<'_>, _events: &mut Events) {
    if resp.function() != Some(MapleFunc::MOUSE) {
        return;
    }
    let Ok((raw, _)) = RawCond::read_from_prefix(resp.cond_bytes()) else {
        return;
    };
    dev.set_status(&MouseState {
        buttons: !raw.buttons & 0xff,
        dx: i32::from(raw.axes[0]) - AXIS_CENTER,
        dy: i32::from(raw.axes[1]) - AXIS_CENTER,
        dz: i32::from(raw.axes[2]) - AXIS_CENTER,
    });
}

pub static DRIVER: MapleDriver = MapleDriver {
    name: "mouse",
    functions: MapleFunc::MOUSE,
    attach,
    detach,
    poll: Some(poll),
    reply,
    ioctl: None,
};

pub fn state<H: MapleHw>(bus: &MapleBus<H>, addr: MapleAddr) -> Option<MouseState> {
    let dev = bus.device(addr)?;
    if !dev.driver.is_some_and(|d| core::ptr::eq(d, &DRIVER)) || !dev.status_valid {
        return None;
    }
    dev.status()
}
