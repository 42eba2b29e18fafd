// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device information record returned by `CMD_DEVINFO`.

use abi::MapleFunc;
use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Identity and capabilities of a maple device, exactly as it appears in a
/// `DevInfo` response payload.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct DevInfo {
    pub functions: u32,
    pub function_data: [u32; 3],
    pub area_code: u8,
    pub connector_direction: u8,
    pub product_name: [u8; 30],
    pub product_license: [u8; 60],
    /// Standby current draw, in units of 0.1 mA.
    pub standby_power: u16,
    /// Maximum current draw, in units of 0.1 mA.
    pub max_power: u16,
}

const_assert_eq!(core::mem::size_of::<DevInfo>(), 112);

/// Size of a `DevInfo` record in payload words.
pub const DEVINFO_WORDS: usize = core::mem::size_of::<DevInfo>() / 4;

impl DevInfo {
    /// Builds a record for a device offering `functions`. Strings are padded
    /// with spaces the way devices pad them.
    pub fn new(functions: MapleFunc, name: &str, license: &str) -> Self {
        let mut info = Self {
            functions: functions.bits(),
            function_data: [0; 3],
            area_code: 0xff,
            connector_direction: 0,
            product_name: [b' '; 30],
            product_license: [b' '; 60],
            standby_power: 0,
            max_power: 0,
        };
        copy_padded(&mut info.product_name, name);
        copy_padded(&mut info.product_license, license);
        info
    }

    /// Reads a record from the start of a response payload.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        Self::read_from_prefix(bytes).ok().map(|(info, _)| info)
    }

    pub fn functions(&self) -> MapleFunc {
        MapleFunc::from_bits_retain(self.functions)
    }

    pub fn name(&self) -> &str {
        trimmed(&self.product_name)
    }

    pub fn license(&self) -> &str {
        trimmed(&self.product_license)
    }

    /// The record as payload words, for simulated devices.
    pub fn to_words(&self) -> [u32; DEVINFO_WORDS] {
        let mut words = [0u32; DEVINFO_WORDS];
        for (w, chunk) in words.iter_mut().zip(self.as_bytes().chunks_exact(4)) {
            *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }
}

fn copy_padded(dest: &mut [u8], s: &str) {
    let n = s.len().min(dest.len());
    dest[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn trimmed(field: &[u8]) -> &str {
    let end = field
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    core::str::from_utf8(&field[..end]).unwrap_or("")
}
