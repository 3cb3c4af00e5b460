//! Client-to-mixer audio level (RFC 6464)
//!
//! The element is one byte: the V flag (0x80, voice activity) and the level
//! in -dBov, 0 being loudest and 127 silence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use super::OptionalByte;
use crate::packet::RawPacket;
use crate::session::RtpExtensionKind;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};
use crate::RtpSsrc;

/// Level of a silent packet
pub const SILENCE_LEVEL: u8 = 127;

const VOICE_FLAG: u8 = 0x80;

/// Stamps the local audio level and records the levels of remote sources
#[derive(Debug)]
pub struct SsrcAudioLevelEngine {
    extension_id: OptionalByte,
    level: AtomicU8,
    drop_silence: AtomicBool,
    received: RwLock<HashMap<RtpSsrc, (u8, bool)>>,
}

impl SsrcAudioLevelEngine {
    pub fn new() -> Self {
        Self {
            extension_id: OptionalByte::default(),
            level: AtomicU8::new(SILENCE_LEVEL),
            drop_silence: AtomicBool::new(false),
            received: RwLock::new(HashMap::new()),
        }
    }

    /// Level to stamp on the next packets, clamped to 0..=127
    pub fn set_level(&self, level: u8, voice: bool) {
        let byte = level.min(SILENCE_LEVEL) | if voice { VOICE_FLAG } else { 0 };
        self.level.store(byte, Ordering::Relaxed);
    }

    /// Discard received packets whose level is silence
    pub fn set_drop_silence(&self, drop: bool) {
        self.drop_silence.store(drop, Ordering::Relaxed);
    }

    /// Last level and voice flag received from `ssrc`
    pub fn last_level(&self, ssrc: RtpSsrc) -> Option<(u8, bool)> {
        self.received.read().get(&ssrc).copied()
    }
}

impl Default for SsrcAudioLevelEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTransformer for SsrcAudioLevelEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(id) = self.extension_id.get() else {
            return TransformOutcome::Continue;
        };
        if !pkt.is_invalid_rtp() {
            let byte = self.level.load(Ordering::Relaxed);
            if let Err(e) = pkt.set_header_extension(id, &[byte]) {
                trace!("Audio level not stamped: {}", e);
            }
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(id) = self.extension_id.get() else {
            return TransformOutcome::Continue;
        };
        let Some(byte) = pkt.header_extension(id).and_then(|data| data.first().copied()) else {
            return TransformOutcome::Continue;
        };
        let level = byte & !VOICE_FLAG;
        let voice = byte & VOICE_FLAG != 0;
        self.received.write().insert(pkt.ssrc(), (level, voice));

        if level == SILENCE_LEVEL && self.drop_silence.load(Ordering::Relaxed) {
            return TransformOutcome::Discard;
        }
        TransformOutcome::Continue
    }
}

impl TransformEngine for SsrcAudioLevelEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::SsrcAudioLevel
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }

    fn set_extension_id(&self, kind: RtpExtensionKind, id: Option<u8>) {
        if kind == RtpExtensionKind::SsrcAudioLevel {
            self.extension_id.set(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_rtp_packet;

    #[test]
    fn test_stamp_and_read_back() {
        let engine = SsrcAudioLevelEngine::new();
        let mut pkt = build_rtp_packet(0, false, 1, 0, 42, &[1, 2, 3]);

        // unassigned id leaves the packet alone
        engine.transform(&mut pkt);
        assert!(!pkt.has_extension());

        engine.set_extension_id(RtpExtensionKind::SsrcAudioLevel, Some(1));
        engine.set_level(30, true);
        engine.transform(&mut pkt);
        assert_eq!(pkt.header_extension(1), Some(vec![0x80 | 30]));
        assert_eq!(pkt.payload(), &[1, 2, 3]);

        assert_eq!(engine.reverse_transform(&mut pkt), TransformOutcome::Continue);
        assert_eq!(engine.last_level(42), Some((30, true)));
    }

    #[test]
    fn test_drop_silence() {
        let engine = SsrcAudioLevelEngine::new();
        engine.set_extension_id(RtpExtensionKind::SsrcAudioLevel, Some(3));
        engine.set_drop_silence(true);
        engine.set_level(200, false);

        let mut pkt = build_rtp_packet(0, false, 1, 0, 7, &[0]);
        engine.transform(&mut pkt);
        assert_eq!(engine.reverse_transform(&mut pkt), TransformOutcome::Discard);
        assert_eq!(engine.last_level(7), Some((SILENCE_LEVEL, false)));
    }
}
