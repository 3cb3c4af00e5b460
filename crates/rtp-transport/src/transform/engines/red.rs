//! RTP payload for redundant audio data (RFC 2198)
//!
//! ```text
//!  0                   1                    2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |F|   block PT  |  timestamp offset         |   block length    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The last header is a single byte (`F` clear) describing the primary
//! encoding, whose data comes last.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use super::OptionalByte;
use crate::error::Error;
use crate::packet::RawPacket;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};
use crate::Result;

/// Primary encoding of a RED payload: its payload type and data range
fn primary_block(payload: &[u8]) -> Result<(u8, usize)> {
    let mut offset = 0;
    let mut redundant_len = 0;
    loop {
        let Some(&first) = payload.get(offset) else {
            return Err(Error::InvalidPacket("RED header truncated".into()));
        };
        if first & 0x80 == 0 {
            let start = offset + 1 + redundant_len;
            if start > payload.len() {
                return Err(Error::InvalidPacket("RED blocks exceed payload".into()));
            }
            return Ok((first & 0x7F, start));
        }
        if offset + 4 > payload.len() {
            return Err(Error::InvalidPacket("RED header truncated".into()));
        }
        let length = ((payload[offset + 2] as usize & 0x03) << 8) | payload[offset + 3] as usize;
        redundant_len += length;
        offset += 4;
    }
}

/// Encapsulates outgoing media in RED and unwraps incoming RED
pub struct RedEngine {
    payload_type: OptionalByte,
    encapsulate: AtomicBool,
}

impl RedEngine {
    pub fn new() -> Self {
        Self {
            payload_type: OptionalByte::default(),
            encapsulate: AtomicBool::new(false),
        }
    }

    pub fn set_payload_type(&self, pt: Option<u8>) {
        self.payload_type.set(pt);
    }

    pub fn payload_type(&self) -> Option<u8> {
        self.payload_type.get()
    }

    /// Whether outgoing packets are wrapped in RED
    pub fn set_encapsulate(&self, enabled: bool) {
        self.encapsulate.store(enabled, Ordering::Relaxed);
    }
}

impl Default for RedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTransformer for RedEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(red) = self.payload_type.get() else {
            return TransformOutcome::Continue;
        };
        if !self.encapsulate.load(Ordering::Relaxed) || pkt.is_invalid_rtp() || pkt.payload_type() == red {
            return TransformOutcome::Continue;
        }
        let mut wrapped = Vec::with_capacity(pkt.payload_length() + 1);
        wrapped.push(pkt.payload_type() & 0x7F);
        wrapped.extend_from_slice(pkt.payload());
        pkt.set_payload(&wrapped);
        pkt.set_payload_type(red);
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(red) = self.payload_type.get() else {
            return TransformOutcome::Continue;
        };
        if pkt.is_invalid_rtp() || pkt.payload_type() != red {
            return TransformOutcome::Continue;
        }
        match primary_block(pkt.payload()) {
            Ok((pt, start)) => {
                let primary = pkt.payload()[start..].to_vec();
                pkt.set_payload(&primary);
                pkt.set_payload_type(pt);
                TransformOutcome::Continue
            }
            Err(e) => {
                debug!("Dropping RED packet {}: {}", pkt.sequence_number(), e);
                TransformOutcome::Discard
            }
        }
    }
}

impl TransformEngine for RedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Red
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_rtp_packet;

    #[test]
    fn test_unwraps_primary_block() {
        let engine = RedEngine::new();
        engine.set_payload_type(Some(63));

        // one redundant block of 2 bytes (pt 0, offset 160), primary pt 0
        let payload = [0x80, 0x02, 0x80, 0x02, 0x00, 0xAA, 0xBB, 0x01, 0x02, 0x03];
        let mut pkt = build_rtp_packet(63, false, 1, 320, 1, &payload);
        assert_eq!(engine.reverse_transform(&mut pkt), TransformOutcome::Continue);
        assert_eq!(pkt.payload_type(), 0);
        assert_eq!(pkt.payload(), &[1, 2, 3]);
    }

    #[test]
    fn test_encapsulate_then_unwrap() {
        let engine = RedEngine::new();
        engine.set_payload_type(Some(63));
        let mut pkt = build_rtp_packet(8, false, 1, 0, 1, &[9, 9]);

        engine.transform(&mut pkt);
        assert_eq!(pkt.payload_type(), 8, "encapsulation is off by default");

        engine.set_encapsulate(true);
        engine.transform(&mut pkt);
        assert_eq!(pkt.payload_type(), 63);
        assert_eq!(pkt.payload(), &[8, 9, 9]);

        engine.reverse_transform(&mut pkt);
        assert_eq!(pkt.payload_type(), 8);
        assert_eq!(pkt.payload(), &[9, 9]);
    }

    #[test]
    fn test_truncated_red_is_dropped() {
        let engine = RedEngine::new();
        engine.set_payload_type(Some(63));
        let mut pkt = build_rtp_packet(63, false, 1, 0, 1, &[0x80, 0x02]);
        assert_eq!(engine.reverse_transform(&mut pkt), TransformOutcome::Discard);
    }
}
