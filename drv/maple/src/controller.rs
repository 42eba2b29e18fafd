// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Standard controller: buttons, analog triggers and sticks.

use abi::{KernError, MapleFunc};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bus::{Events, MapleBus, MapleEvent};
use crate::driver::{Device, MapleDriver};
use crate::proto::{FrameReq, MapleAddr, Response};
use crate::MapleHw;

bitflags::bitflags! {
    /// Controller buttons, set while held.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct Buttons: u32 {
        const C = 1 << 0;
        const B = 1 << 1;
        const A = 1 << 2;
        const START = 1 << 3;
        const DPAD_UP = 1 << 4;
        const DPAD_DOWN = 1 << 5;
        const DPAD_LEFT = 1 << 6;
        const DPAD_RIGHT = 1 << 7;
        const Z = 1 << 8;
        const Y = 1 << 9;
        const X = 1 << 10;
        const D = 1 << 11;
        const DPAD2_UP = 1 << 12;
        const DPAD2_DOWN = 1 << 13;
        const DPAD2_LEFT = 1 << 14;
        const DPAD2_RIGHT = 1 << 15;
    }
}

/// Condition block as the controller sends it. Buttons are active low;
/// stick axes are centered on 128.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawCond {
    buttons: u16,
    rtrig: u8,
    ltrig: u8,
    joyx: u8,
    joyy: u8,
    joy2x: u8,
    joy2y: u8,
}

/// Decoded controller state, kept in the device's status buffer.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ContState {
    pub buttons: u32,
    pub ltrig: u8,
    pub rtrig: u8,
    pub joyx: i8,
    pub joyy: i8,
    pub joy2x: i8,
    pub joy2y: i8,
    _pad: [u8; 2],
}

impl ContState {
    pub fn buttons(&self) -> Buttons {
        Buttons::from_bits_truncate(self.buttons)
    }
}

fn centered(raw: u8) -> i8 {
    raw.wrapping_sub(128) as i8
}

fn attach(dev: &mut Device) -> Result<(), KernError> {
    dev.set_status(&ContState::default());
    dev.status_valid = false;
    Ok(())
}

fn detach(_dev: &mut Device) {}

fn poll(dev: &Device) -> FrameReq {
    FrameReq::get_cond(dev.addr, MapleFunc::CONTROLLER)
}

fn reply(dev: &mut Device, resp: &Response<'_>, events: &mut Events) {
    if resp.function() != Some(MapleFunc::CONTROLLER) {
        return;
    }
    let Ok((raw, _)) = RawCond::read_from_prefix(resp.cond_bytes()) else {
        return;
    };
    let old = dev.status::<ContState>().unwrap_or_default();
    let new = ContState {
        buttons: u32::from(!raw.buttons),
        ltrig: raw.ltrig,
        rtrig: raw.rtrig,
        joyx: centered(raw.joyx),
        joyy: centered(raw.joyy),
        joy2x: centered(raw.joy2x),
        joy2y: centered(raw.joy2y),
        _pad: [0; 2],
    };
    dev.set_status(&new);
    let changed = old.buttons ^ new.buttons;
    if changed != 0 {
        events.push(MapleEvent::Buttons {
            addr: dev.addr,
            buttons: new.buttons,
            changed,
        });
    }
}

pub static DRIVER: MapleDriver = MapleDriver {
    name: "controller",
    functions: MapleFunc::CONTROLLER,
    attach,
    detach,
    poll: Some(poll),
    reply,
    ioctl: None,
};

/// Latest state of the controller at `addr`, once one has been received.
pub fn state<H: MapleHw>(bus: &MapleBus<H>, addr: MapleAddr) -> Option<ContState> {
    let dev = bus.device(addr)?;
    if !dev.driver.is_some_and(|d| core::ptr::eq(d, &DRIVER)) || !dev.status_valid {
        return None;
    }
    dev.status()
}
