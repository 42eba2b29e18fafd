// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire format of the maple command list and responses.
//!
//! A command list is a sequence of little-endian words. Each command is:
//!
//! ```text
//! word 0   bit 31: last command; bits 17:16: port; bits 7:0: payload words
//! word 1   bus address of the receive buffer
//! word 2   cmd | dst << 8 | src << 16 | payload words << 24
//! word 3.. payload
//! ```
//!
//! Each response starts with a frame word of the same shape as word 2,
//! where `cmd` is the signed response code, followed by the payload. A
//! port with nothing plugged in leaves the buffer's first word as all ones,
//! which reads back as `ResponseCode::None`.

use abi::{KernError, MapleFunc};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::IntoBytes;

pub const PORTS: usize = 4;
pub const UNITS: usize = 6;
pub const SLOTS: usize = PORTS * UNITS;

/// Largest payload a single command or response may carry.
pub const MAX_PAYLOAD_WORDS: usize = 255;
/// Size of a receive buffer: one frame word plus the largest payload.
pub const RECV_WORDS: usize = MAX_PAYLOAD_WORDS + 1;
/// Largest payload of a command the framework itself issues.
pub const MAX_SEND_WORDS: usize = 8;

pub const CMD_DEVINFO: u8 = 1;
pub const CMD_ALLINFO: u8 = 2;
pub const CMD_RESET: u8 = 3;
pub const CMD_KILL: u8 = 4;
pub const CMD_GETCOND: u8 = 9;
pub const CMD_GETMINFO: u8 = 10;
pub const CMD_BREAD: u8 = 11;
pub const CMD_BWRITE: u8 = 12;
pub const CMD_BSYNC: u8 = 13;
pub const CMD_SETCOND: u8 = 14;

/// Response codes, as the signed first byte of a response frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(i8)]
pub enum ResponseCode {
    FileErr = -5,
    Again = -4,
    BadCmd = -3,
    BadFunc = -2,
    None = -1,
    DevInfo = 5,
    AllInfo = 6,
    Ok = 7,
    DataTrf = 8,
}

const LAST_COMMAND: u32 = 1 << 31;

/// Position of a device on the bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MapleAddr {
    pub port: u8,
    pub unit: u8,
}

impl MapleAddr {
    pub fn new(port: u8, unit: u8) -> Result<Self, KernError> {
        if usize::from(port) >= PORTS || usize::from(unit) >= UNITS {
            return Err(KernError::InvalidArgument);
        }
        Ok(Self { port, unit })
    }

    /// Address byte as used in frame words.
    pub fn wire(self) -> u8 {
        let unit_bits = if self.unit == 0 {
            0x20
        } else {
            1 << (self.unit - 1)
        };
        self.port << 6 | unit_bits
    }

    /// Decodes an address byte. Sub-unit presence bits that a main unit
    /// ORs into its own address are ignored.
    pub fn from_wire(b: u8) -> Self {
        let port = b >> 6;
        let unit = if b & 0x20 != 0 {
            0
        } else {
            match b & 0x1f {
                0 => 0,
                bits => bits.trailing_zeros() as u8 + 1,
            }
        };
        Self { port, unit }
    }

    /// Host-side address of a port, used as the source of every command.
    pub fn host(port: u8) -> u8 {
        port << 6
    }

    pub fn slot(self) -> usize {
        usize::from(self.port) * UNITS + usize::from(self.unit)
    }

    pub fn from_slot(slot: usize) -> Self {
        Self {
            port: (slot / UNITS) as u8,
            unit: (slot % UNITS) as u8,
        }
    }
}

impl core::fmt::Display for MapleAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", char::from(b'A' + self.port), self.unit)
    }
}

/// A command waiting to be placed on the bus.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FrameReq {
    pub addr: MapleAddr,
    pub cmd: u8,
    pub payload: heapless::Vec<u32, MAX_SEND_WORDS>,
}

impl FrameReq {
    pub fn new(addr: MapleAddr, cmd: u8) -> Self {
        Self {
            addr,
            cmd,
            payload: heapless::Vec::new(),
        }
    }

    pub fn with_payload(
        addr: MapleAddr,
        cmd: u8,
        payload: &[u32],
    ) -> Result<Self, KernError> {
        let payload = heapless::Vec::from_slice(payload)
            .map_err(|_| KernError::InvalidArgument)?;
        Ok(Self { addr, cmd, payload })
    }

    /// Status fetch for one function of a device.
    pub fn get_cond(addr: MapleAddr, func: MapleFunc) -> Self {
        let mut f = Self::new(addr, CMD_GETCOND);
        // Capacity is at least one.
        let _ = f.payload.push(func.bits());
        f
    }
}

pub fn header_word(port: u8, payload_words: usize, last: bool) -> u32 {
    let last = if last { LAST_COMMAND } else { 0 };
    last | u32::from(port & 3) << 16 | (payload_words as u32 & 0xff)
}

pub fn frame_word(cmd: u8, dst: u8, src: u8, payload_words: usize) -> u32 {
    u32::from(cmd)
        | u32::from(dst) << 8
        | u32::from(src) << 16
        | (payload_words as u32 & 0xff) << 24
}

/// Words needed for a command list of `frames` commands of at most
/// `MAX_SEND_WORDS` payload each.
pub const fn list_words(frames: usize) -> usize {
    frames * (3 + MAX_SEND_WORDS)
}

/// A command list under construction.
pub struct DmaList<const N: usize> {
    words: heapless::Vec<u32, N>,
    last_header: Option<usize>,
}

impl<const N: usize> DmaList<N> {
    pub const fn new() -> Self {
        Self {
            words: heapless::Vec::new(),
            last_header: None,
        }
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.last_header = None;
    }

    pub fn is_empty(&self) -> bool {
        self.last_header.is_none()
    }

    /// Appends one command. Fails without side effect when the list is full.
    pub fn push(
        &mut self,
        frame: &FrameReq,
        recv_addr: u32,
    ) -> Result<(), KernError> {
        let len = frame.payload.len();
        if self.words.capacity() - self.words.len() < 3 + len {
            return Err(KernError::ResourceExhausted);
        }
        let at = self.words.len();
        let port = frame.addr.port;
        // Space was checked above.
        let _ = self.words.push(header_word(port, len, false));
        let _ = self.words.push(recv_addr);
        let _ = self.words.push(frame_word(
            frame.cmd,
            frame.addr.wire(),
            MapleAddr::host(port),
            len,
        ));
        let _ = self.words.extend_from_slice(&frame.payload);
        self.last_header = Some(at);
        Ok(())
    }

    /// Marks the final command so the controller stops there.
    pub fn finish(&mut self) {
        if let Some(at) = self.last_header {
            self.words[at] |= LAST_COMMAND;
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

impl<const N: usize> Default for DmaList<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A receive buffer. Aligned to a cache line so invalidation after DMA
/// cannot clip a neighbor.
#[derive(Copy, Clone)]
#[repr(C, align(32))]
pub struct RecvBuf(pub [u32; RECV_WORDS]);

impl RecvBuf {
    /// Contents before the controller writes anything: reads back as "no
    /// device".
    pub const EMPTY: Self = Self([!0; RECV_WORDS]);

    /// Writes a response; used by simulated hardware.
    pub fn fill(&mut self, code: i8, dst: u8, src: u8, payload: &[u32]) {
        let len = payload.len().min(MAX_PAYLOAD_WORDS);
        self.0[0] = frame_word(code as u8, dst, src, len);
        self.0[1..1 + len].copy_from_slice(&payload[..len]);
    }
}

/// A parsed view of a receive buffer.
#[derive(Copy, Clone, Debug)]
pub struct Response<'a> {
    raw_code: i8,
    pub dst: u8,
    pub src: u8,
    pub payload: &'a [u32],
}

impl<'a> Response<'a> {
    pub fn parse(buf: &'a RecvBuf) -> Self {
        let w = buf.0[0];
        let raw_code = w as u8 as i8;
        let len = if w == !0 {
            0
        } else {
            ((w >> 24) as usize).min(MAX_PAYLOAD_WORDS)
        };
        Self {
            raw_code,
            dst: (w >> 8) as u8,
            src: (w >> 16) as u8,
            payload: &buf.0[1..1 + len],
        }
    }

    pub fn code(&self) -> Option<ResponseCode> {
        ResponseCode::from_i8(self.raw_code)
    }

    /// Whether anything at the addressed position answered at all.
    pub fn answered(&self) -> bool {
        !matches!(self.code(), None | Some(ResponseCode::None))
    }

    /// Sub-units a main unit reports as present, as bits 0-4 for units 1-5.
    pub fn subunit_mask(&self) -> u8 {
        self.src & 0x1f
    }

    /// Function a status reply is about.
    pub fn function(&self) -> Option<MapleFunc> {
        self.payload.first().map(|&w| MapleFunc::from_bits_retain(w))
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.payload.as_bytes()
    }

    /// Status bytes following the function word of a `DataTrf` reply.
    pub fn cond_bytes(&self) -> &'a [u8] {
        self.bytes().get(4..).unwrap_or(&[])
    }
}
