// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyboard: key state tracking, a per-device key-down queue with US-layout
//! translation, and key events.

use abi::{KernError, MapleFunc};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::bus::{Events, MapleBus, MapleEvent};
use crate::driver::{Device, MapleDriver};
use crate::proto::{FrameReq, MapleAddr, Response};
use crate::MapleHw;

pub const MOD_LCTRL: u8 = 1 << 0;
pub const MOD_LSHIFT: u8 = 1 << 1;
pub const MOD_LALT: u8 = 1 << 2;
pub const MOD_S1: u8 = 1 << 3;
pub const MOD_RCTRL: u8 = 1 << 4;
pub const MOD_RSHIFT: u8 = 1 << 5;
pub const MOD_RALT: u8 = 1 << 6;
pub const MOD_S2: u8 = 1 << 7;

/// Key codes below this are error reports rather than keys.
const FIRST_KEY: u8 = 0x04;
/// Reported in every key slot when too many keys are held.
const ERR_ROLLOVER: u8 = 0x01;

const QUEUE_LEN: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyEvent {
    pub key: u8,
    pub modifiers: u8,
    pub down: bool,
}

#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawCond {
    modifiers: u8,
    leds: u8,
    keys: [u8; 6],
}

/// Keyboard status kept in the device's status buffer.
#[derive(
    Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct KbdState {
    pub modifiers: u8,
    pub leds: u8,
    pub keys: [u8; 6],
    /// Key-down queue entries, `modifiers << 8 | key`.
    queue: [u16; QUEUE_LEN],
    head: u8,
    len: u8,
}

impl KbdState {
    fn enqueue(&mut self, entry: u16) {
        if usize::from(self.len) == QUEUE_LEN {
            // Full: drop the oldest.
            self.head = (self.head + 1) % QUEUE_LEN as u8;
            self.len -= 1;
        }
        let tail = (usize::from(self.head) + usize::from(self.len)) % QUEUE_LEN;
        self.queue[tail] = entry;
        self.len += 1;
    }

    fn dequeue(&mut self) -> Option<u16> {
        if self.len == 0 {
            return None;
        }
        let entry = self.queue[usize::from(self.head)];
        self.head = (self.head + 1) % QUEUE_LEN as u8;
        self.len -= 1;
        Some(entry)
    }

    pub fn is_held(&self, key: u8) -> bool {
        key >= FIRST_KEY && self.keys.contains(&key)
    }
}

// US layout, indexed by key code, without and with shift. Zero means no
// character.
const KEYMAP_LEN: usize = 0x39;
static US_PLAIN: [u8; KEYMAP_LEN] = *b"\0\0\0\0abcdefghijklmnopqrstuvwxyz1234567890\n\x1b\x08\t -=[]\\\0;'`,./";
static US_SHIFT: [u8; KEYMAP_LEN] = *b"\0\0\0\0ABCDEFGHIJKLMNOPQRSTUVWXYZ!@#$%^&*()\n\x1b\x08\t _+{}|\0:\"~<>?";

/// Translates a key code to ASCII under the US layout.
pub fn to_ascii(key: u8, modifiers: u8) -> Option<u8> {
    let shifted = modifiers & (MOD_LSHIFT | MOD_RSHIFT) != 0;
    let map = if shifted { &US_SHIFT } else { &US_PLAIN };
    match map.get(usize::from(key)) {
        Some(&0) | None => None,
        Some(&c) => Some(c),
    }
}

fn attach(dev: &mut Device) -> Result<(), KernError> {
    dev.set_status(&KbdState::default());
    dev.status_valid = false;
    Ok(())
}

fn detach(_dev: &mut Device) {}

fn poll(dev: &Device) -> FrameReq {
    FrameReq::get_cond(dev.addr, MapleFunc::KEYBOARD)
}

fn reply(dev: &mut Device, resp: &Response<'_>, events: &mut Events) {
    if resp.function() != Some(MapleFunc::KEYBOARD) {
        return;
    }
    let Ok((raw, _)) = RawCond::read_from_prefix(resp.cond_bytes()) else {
        return;
    };
    if raw.keys[0] == ERR_ROLLOVER {
        return;
    }
    let mut st = dev.status::<KbdState>().unwrap_or_default();
    let addr = dev.addr;

    for &key in raw.keys.iter().filter(|&&k| k >= FIRST_KEY) {
        if !st.is_held(key) {
            st.enqueue(u16::from(raw.modifiers) << 8 | u16::from(key));
            events.push(MapleEvent::Key {
                addr,
                event: KeyEvent {
                    key,
                    modifiers: raw.modifiers,
                    down: true,
                },
            });
        }
    }
    for &key in st.keys.iter().filter(|&&k| k >= FIRST_KEY) {
        if !raw.keys.contains(&key) {
            events.push(MapleEvent::Key {
                addr,
                event: KeyEvent {
                    key,
                    modifiers: raw.modifiers,
                    down: false,
                },
            });
        }
    }

    st.modifiers = raw.modifiers;
    st.leds = raw.leds;
    st.keys = raw.keys;
    dev.set_status(&st);
}

pub static DRIVER: MapleDriver = MapleDriver {
    name: "keyboard",
    functions: MapleFunc::KEYBOARD,
    attach,
    detach,
    poll: Some(poll),
    reply,
    ioctl: None,
};

fn keyboard<H: MapleHw>(
    bus: &mut MapleBus<H>,
    addr: MapleAddr,
) -> Result<&mut Device, KernError> {
    let dev = bus.device_mut(addr).ok_or(KernError::BadHandle)?;
    if !dev.driver.is_some_and(|d| core::ptr::eq(d, &DRIVER)) {
        return Err(KernError::BadHandle);
    }
    Ok(dev)
}

/// Takes the oldest key press from the keyboard at `addr`. With `xlat`, the
/// result is ASCII and presses with no character are skipped; otherwise it
/// is `modifiers << 8 | key`.
pub fn queue_pop<H: MapleHw>(
    bus: &mut MapleBus<H>,
    addr: MapleAddr,
    xlat: bool,
) -> Result<Option<u32>, KernError> {
    let dev = keyboard(bus, addr)?;
    let mut st = dev.status::<KbdState>().unwrap_or_default();
    let mut out = None;
    while let Some(entry) = st.dequeue() {
        if !xlat {
            out = Some(u32::from(entry));
            break;
        }
        if let Some(c) = to_ascii(entry as u8, (entry >> 8) as u8) {
            out = Some(u32::from(c));
            break;
        }
    }
    let valid = dev.status_valid;
    dev.set_status(&st);
    dev.status_valid = valid;
    Ok(out)
}

pub fn state<H: MapleHw>(
    bus: &mut MapleBus<H>,
    addr: MapleAddr,
) -> Result<Option<KbdState>, KernError> {
    let dev = keyboard(bus, addr)?;
    Ok(if dev.status_valid { dev.status() } else { None })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBus, SimDevice};

    const KEY_A: u8 = 0x04;
    const KEY_1: u8 = 0x1e;
    const KEY_ENTER: u8 = 0x28;
    const KEY_F1: u8 = 0x3a;

    fn setup() -> (MapleBus<SimBus>, MapleAddr) {
        let mut bus = MapleBus::new(SimBus::new());
        bus.register_driver(&DRIVER).unwrap();
        let addr = MapleAddr::new(0, 0).unwrap();
        bus.hw_mut().plug(addr, SimDevice::keyboard());
        bus.start_cycle();
        bus.complete_cycle();
        (bus, addr)
    }

    fn report(bus: &mut MapleBus<SimBus>, addr: MapleAddr, mods: u8, keys: [u8; 6]) {
        bus.hw_mut().device_mut(addr).unwrap().set_keyboard(mods, keys);
        bus.start_cycle();
        bus.complete_cycle();
    }

    #[test]
    fn translation_follows_us_layout() {
        assert_eq!(to_ascii(KEY_A, 0), Some(b'a'));
        assert_eq!(to_ascii(KEY_A, MOD_RSHIFT), Some(b'A'));
        assert_eq!(to_ascii(KEY_1, MOD_LSHIFT), Some(b'!'));
        assert_eq!(to_ascii(KEY_ENTER, 0), Some(b'\n'));
        assert_eq!(to_ascii(0x38, MOD_LSHIFT), Some(b'?'));
        assert_eq!(to_ascii(KEY_F1, 0), None);
    }

    #[test]
    fn held_key_queues_once() {
        let (mut bus, addr) = setup();
        report(&mut bus, addr, 0, [KEY_A, 0, 0, 0, 0, 0]);
        report(&mut bus, addr, 0, [KEY_A, 0, 0, 0, 0, 0]);
        report(&mut bus, addr, MOD_LSHIFT, [KEY_A, KEY_1, 0, 0, 0, 0]);
        assert_eq!(queue_pop(&mut bus, addr, true), Ok(Some(u32::from(b'a'))));
        assert_eq!(queue_pop(&mut bus, addr, true), Ok(Some(u32::from(b'!'))));
        assert_eq!(queue_pop(&mut bus, addr, true), Ok(None));
    }

    #[test]
    fn raw_queue_keeps_modifiers_and_untranslatable_keys() {
        let (mut bus, addr) = setup();
        report(&mut bus, addr, MOD_LCTRL, [KEY_F1, 0, 0, 0, 0, 0]);
        assert_eq!(
            queue_pop(&mut bus, addr, false),
            Ok(Some(u32::from(MOD_LCTRL) << 8 | u32::from(KEY_F1)))
        );
        report(&mut bus, addr, 0, [0; 6]);
        report(&mut bus, addr, 0, [KEY_F1, 0, 0, 0, 0, 0]);
        assert_eq!(queue_pop(&mut bus, addr, true), Ok(None));
    }

    #[test]
    fn rollover_reports_are_ignored() {
        let (mut bus, addr) = setup();
        report(&mut bus, addr, 0, [ERR_ROLLOVER; 6]);
        assert_eq!(queue_pop(&mut bus, addr, false), Ok(None));
    }

    #[test]
    fn press_and_release_produce_events() {
        let (mut bus, addr) = setup();
        let before = bus.pending_events();
        report(&mut bus, addr, 0, [KEY_A, 0, 0, 0, 0, 0]);
        report(&mut bus, addr, 0, [0; 6]);
        assert_eq!(bus.pending_events(), before + 2);
        let st = state(&mut bus, addr).unwrap().unwrap();
        assert!(!st.is_held(KEY_A));
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let mut st = KbdState::default();
        for k in 0..(QUEUE_LEN as u16 + 2) {
            st.enqueue(k);
        }
        assert_eq!(st.dequeue(), Some(2));
    }

    #[test]
    fn non_keyboards_are_refused() {
        let mut bus = MapleBus::new(SimBus::new());
        let addr = MapleAddr::new(0, 0).unwrap();
        assert_eq!(queue_pop(&mut bus, addr, true), Err(KernError::BadHandle));
    }
}
