// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Vibration pack. It has no status to poll; effects are sent as queued
//! `SETCOND` commands.

use abi::{KernError, MapleFunc};

use crate::bus::{Events, MapleBus};
use crate::driver::{Device, MapleDriver};
use crate::proto::{FrameReq, MapleAddr, Response, CMD_SETCOND};
use crate::MapleHw;

/// `ioctl` command: start the effect given as the argument.
pub const IOCTL_RUMBLE: u32 = 1;

/// A vibration effect.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Effect {
    pub duration: u8,
    pub effect2: u8,
    pub effect1: u8,
    pub special: u8,
}

impl Effect {
    pub fn raw(self) -> u32 {
        u32::from(self.duration) << 24
            | u32::from(self.effect2) << 16
            | u32::from(self.effect1) << 8
            | u32::from(self.special)
    }
}

fn attach(_dev: &mut Device) -> Result<(), KernError> {
    Ok(())
}

fn detach(_dev: &mut Device) {}

fn reply(_dev: &mut Device, _resp: &Response<'_>, _events: &mut Events) {}

fn ioctl(dev: &mut Device, cmd: u32, arg: usize) -> Result<FrameReq, KernError> {
    match cmd {
        IOCTL_RUMBLE => FrameReq::with_payload(
            dev.addr,
            CMD_SETCOND,
            &[MapleFunc::PURUPURU.bits(), arg as u32],
        ),
        _ => Err(KernError::InvalidArgument),
    }
}

pub static DRIVER: MapleDriver = MapleDriver {
    name: "purupuru",
    functions: MapleFunc::PURUPURU,
    attach,
    detach,
    poll: None,
    reply,
    ioctl: Some(ioctl),
};

/// Starts `effect` on the vibration pack at `addr` on the next bus cycle.
pub fn rumble<H: MapleHw>(
    bus: &mut MapleBus<H>,
    addr: MapleAddr,
    effect: u32,
) -> Result<(), KernError> {
    bus.ioctl(addr, IOCTL_RUMBLE, effect as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_packs_fields_high_to_low() {
        let e = Effect {
            duration: 0x10,
            effect2: 0x3a,
            effect1: 0x07,
            special: 0x01,
        };
        assert_eq!(e.raw(), 0x103a_0701);
    }
}
