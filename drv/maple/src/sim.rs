// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated bus controller and devices.
//!
//! `SimBus` walks a command list exactly as the controller would and writes
//! the answers of whatever devices are plugged in. Transfers complete
//! immediately; the completion interrupt is left pending for the owner to
//! collect with `take_irq`.

use abi::MapleFunc;

use crate::devinfo::DevInfo;
use crate::proto::{
    MapleAddr, RecvBuf, ResponseCode, CMD_DEVINFO, CMD_GETCOND, CMD_SETCOND,
    PORTS, UNITS,
};
use crate::MapleHw;

/// A device on the simulated bus.
#[derive(Clone, Debug)]
pub struct SimDevice {
    pub info: DevInfo,
    /// Condition words returned after the function word of a `GETCOND`.
    pub cond: heapless::Vec<u32, 8>,
    setconds: heapless::Vec<u32, 8>,
}

impl SimDevice {
    pub fn new(info: DevInfo) -> Self {
        Self {
            info,
            cond: heapless::Vec::new(),
            setconds: heapless::Vec::new(),
        }
    }

    pub fn controller() -> Self {
        let mut d = Self::new(DevInfo::new(
            MapleFunc::CONTROLLER,
            "Dreamcast Controller",
            "Produced By or Under License From SEGA ENTERPRISES,LTD.",
        ));
        d.set_controller(0, 0, 0, 128, 128);
        d
    }

    pub fn keyboard() -> Self {
        let mut d = Self::new(DevInfo::new(MapleFunc::KEYBOARD, "Keyboard", ""));
        d.set_keyboard(0, [0; 6]);
        d
    }

    pub fn mouse() -> Self {
        let mut d = Self::new(DevInfo::new(MapleFunc::MOUSE, "Mouse", ""));
        d.set_mouse(0, 0, 0, 0);
        d
    }

    pub fn purupuru() -> Self {
        Self::new(DevInfo::new(MapleFunc::PURUPURU, "Puru Puru Pack", ""))
    }

    pub fn set_cond_bytes(&mut self, bytes: &[u8]) {
        self.cond.clear();
        for chunk in bytes.chunks(4) {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            let _ = self.cond.push(u32::from_le_bytes(w));
        }
    }

    /// `buttons` are active high here; the device reports them inverted.
    pub fn set_controller(
        &mut self,
        buttons: u32,
        ltrig: u8,
        rtrig: u8,
        joyx: u8,
        joyy: u8,
    ) {
        let raw = (!buttons as u16).to_le_bytes();
        self.set_cond_bytes(&[raw[0], raw[1], rtrig, ltrig, joyx, joyy, 128, 128]);
    }

    pub fn set_keyboard(&mut self, modifiers: u8, keys: [u8; 6]) {
        let mut b = [0u8; 8];
        b[0] = modifiers;
        b[2..].copy_from_slice(&keys);
        self.set_cond_bytes(&b);
    }

    pub fn set_mouse(&mut self, buttons: u32, dx: i16, dy: i16, dz: i16) {
        let mut b = [0u8; 20];
        b[..4].copy_from_slice(&(!buttons).to_le_bytes());
        for (i, d) in [dx, dy, dz].into_iter().enumerate() {
            let v = (0x200 + d) as u16;
            b[4 + 2 * i..6 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
        for i in 3..8 {
            b[4 + 2 * i..6 + 2 * i].copy_from_slice(&0x200u16.to_le_bytes());
        }
        self.set_cond_bytes(&b);
    }

    /// The effect word of the most recent `SETCOND`.
    pub fn last_setcond(&self) -> Option<u32> {
        self.setconds.get(1).copied()
    }
}

pub struct SimBus {
    ports: [[Option<SimDevice>; UNITS]; PORTS],
    enabled: bool,
    irq_pending: bool,
    last_commands: usize,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            ports: Default::default(),
            enabled: false,
            irq_pending: false,
            last_commands: 0,
        }
    }

    pub fn plug(&mut self, addr: MapleAddr, dev: SimDevice) {
        self.ports[usize::from(addr.port)][usize::from(addr.unit)] = Some(dev);
    }

    pub fn unplug(&mut self, addr: MapleAddr) -> Option<SimDevice> {
        self.ports[usize::from(addr.port)][usize::from(addr.unit)].take()
    }

    pub fn device_mut(&mut self, addr: MapleAddr) -> Option<&mut SimDevice> {
        self.ports[usize::from(addr.port)][usize::from(addr.unit)].as_mut()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Collects the pending completion interrupt.
    pub fn take_irq(&mut self) -> bool {
        core::mem::replace(&mut self.irq_pending, false)
    }

    pub fn irq_pending(&self) -> bool {
        self.irq_pending
    }

    /// Commands in the most recent list.
    pub fn last_commands(&self) -> usize {
        self.last_commands
    }

    fn respond(&mut self, port: u8, frame: u32, payload: &[u32], out: &mut RecvBuf) {
        let cmd = frame as u8;
        let addr = MapleAddr::from_wire((frame >> 8) as u8);
        let host = MapleAddr::host(port);
        let port_devs = &mut self.ports[usize::from(port)];

        // A main unit reports which sub-units are plugged into it.
        let subunits = port_devs[1..]
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_some())
            .fold(0u8, |m, (i, _)| m | 1 << i);

        let Some(dev) = port_devs[usize::from(addr.unit)].as_mut() else {
            *out = RecvBuf::EMPTY;
            return;
        };
        let src = if addr.unit == 0 {
            addr.wire() | subunits
        } else {
            addr.wire()
        };

        match cmd {
            CMD_DEVINFO => {
                out.fill(ResponseCode::DevInfo as i8, host, src, &dev.info.to_words());
            }
            CMD_GETCOND => {
                let func = payload.first().copied().unwrap_or(0);
                if dev.info.functions & func == 0 {
                    out.fill(ResponseCode::BadFunc as i8, host, src, &[]);
                    return;
                }
                let mut words = heapless::Vec::<u32, 9>::new();
                let _ = words.push(func);
                let _ = words.extend_from_slice(&dev.cond);
                out.fill(ResponseCode::DataTrf as i8, host, src, &words);
            }
            CMD_SETCOND => {
                dev.setconds.clear();
                let n = payload.len().min(dev.setconds.capacity());
                let _ = dev.setconds.extend_from_slice(&payload[..n]);
                out.fill(ResponseCode::Ok as i8, host, src, &[]);
            }
            _ => out.fill(ResponseCode::BadCmd as i8, host, src, &[]),
        }
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MapleHw for SimBus {
    fn init(&mut self) {
        self.enabled = true;
    }

    fn shutdown(&mut self) {
        self.enabled = false;
    }

    fn dma_addr(&self, buf: &RecvBuf) -> u32 {
        (buf as *const RecvBuf as usize as u32) & 0x1fff_ffff
    }

    fn start(&mut self, list: &[u32], recv: &mut [RecvBuf]) {
        let mut at = 0;
        let mut n = 0;
        while at + 3 <= list.len() && n < recv.len() {
            let header = list[at];
            let len = (header & 0xff) as usize;
            let port = ((header >> 16) & 3) as u8;
            let frame = list[at + 2];
            let end = (at + 3 + len).min(list.len());
            let payload = &list[at + 3..end];
            self.respond(port, frame, payload, &mut recv[n]);
            n += 1;
            at = end;
            if header & (1 << 31) != 0 {
                break;
            }
        }
        self.last_commands = n;
        self.irq_pending = true;
    }

    fn finish(&mut self, _recv: &mut [RecvBuf]) {}
}
