//! RFC 4733 named telephone events

use std::fmt;

use bytes::{Buf, BufMut};

use crate::error::Error;
use crate::Result;

/// A DTMF tone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtmfTone {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    const ALL: [DtmfTone; 16] = [
        DtmfTone::Digit0,
        DtmfTone::Digit1,
        DtmfTone::Digit2,
        DtmfTone::Digit3,
        DtmfTone::Digit4,
        DtmfTone::Digit5,
        DtmfTone::Digit6,
        DtmfTone::Digit7,
        DtmfTone::Digit8,
        DtmfTone::Digit9,
        DtmfTone::Star,
        DtmfTone::Pound,
        DtmfTone::A,
        DtmfTone::B,
        DtmfTone::C,
        DtmfTone::D,
    ];

    /// Event code carried on the wire
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Tone for an event code, `None` for non-DTMF events
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Tone for a keypad character
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            '0'..='9' => Self::from_code(c as u8 - b'0'),
            '*' => Some(DtmfTone::Star),
            '#' => Some(DtmfTone::Pound),
            'A' => Some(DtmfTone::A),
            'B' => Some(DtmfTone::B),
            'C' => Some(DtmfTone::C),
            'D' => Some(DtmfTone::D),
            _ => None,
        }
    }

    /// Keypad character of the tone
    pub fn as_char(self) -> char {
        match self {
            DtmfTone::Star => '*',
            DtmfTone::Pound => '#',
            DtmfTone::A => 'A',
            DtmfTone::B => 'B',
            DtmfTone::C => 'C',
            DtmfTone::D => 'D',
            digit => (b'0' + digit.code()) as char,
        }
    }
}

impl fmt::Display for DtmfTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Payload of a telephone-event packet
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     event     |E|R| volume    |          duration             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfEventPayload {
    /// Event code
    pub event: u8,
    /// End of event flag
    pub end: bool,
    /// Power level, 0 to 63 (-dBm0)
    pub volume: u8,
    /// Duration in timestamp units
    pub duration: u16,
}

impl DtmfEventPayload {
    /// Size of the payload in bytes
    pub const SIZE: usize = 4;

    pub fn new(tone: DtmfTone, end: bool, volume: u8, duration: u16) -> Self {
        Self {
            event: tone.code(),
            end,
            volume: volume & 0x3F,
            duration,
        }
    }

    /// DTMF tone of the event, if it is one
    pub fn tone(&self) -> Option<DtmfTone> {
        DtmfTone::from_code(self.event)
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.len(),
            });
        }
        let event = buf.get_u8();
        let flags = buf.get_u8();
        let duration = buf.get_u16();
        Ok(Self {
            event,
            end: flags & 0x80 != 0,
            volume: flags & 0x3F,
            duration,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.event);
        buf.put_u8(if self.end { 0x80 } else { 0 } | (self.volume & 0x3F));
        buf.put_u16(self.duration);
        out
    }
}
