use tracing::{debug, trace};

use crate::packet::rtcp::{serialize_compound, RtcpPacket};
use crate::packet::RawPacket;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};

/// Keeps locally terminated feedback (RTPFB/PSFB) from leaving the host
///
/// Used when the session relays RTCP: feedback is consumed here and must not
/// reach the other side.
#[derive(Debug, Default)]
pub struct RtcpTerminationEngine;

impl RtcpTerminationEngine {
    pub fn new() -> Self {
        Self
    }
}

impl PacketTransformer for RtcpTerminationEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let packets = match RtcpPacket::parse_compound(pkt.data()) {
            Ok(packets) => packets,
            Err(e) => {
                trace!("Leaving unparsable RTCP untouched: {}", e);
                return TransformOutcome::Continue;
            }
        };
        if !packets.iter().any(RtcpPacket::is_feedback) {
            return TransformOutcome::Continue;
        }

        let kept: Vec<RtcpPacket> = packets.into_iter().filter(|p| !p.is_feedback()).collect();
        if kept.is_empty() {
            return TransformOutcome::Discard;
        }
        match serialize_compound(&kept) {
            Ok(bytes) => {
                pkt.copy_from(&bytes);
                TransformOutcome::Continue
            }
            Err(e) => {
                debug!("Failed to rebuild RTCP without feedback: {}", e);
                TransformOutcome::Discard
            }
        }
    }

    fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }
}

impl TransformEngine for RtcpTerminationEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::RtcpTermination
    }

    fn rtcp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtcp::{RtcpNack, RtcpPli, RtcpReceiverReport};

    fn compound(packets: &[RtcpPacket]) -> RawPacket {
        RawPacket::from_slice(&serialize_compound(packets).unwrap())
    }

    #[test]
    fn test_strips_feedback() {
        let engine = RtcpTerminationEngine::new();
        let mut pkt = compound(&[
            RtcpPacket::ReceiverReport(RtcpReceiverReport::new(1)),
            RtcpPacket::Nack(RtcpNack::new(1, 2, vec![10])),
        ]);
        assert_eq!(engine.transform(&mut pkt), TransformOutcome::Continue);
        let left = RtcpPacket::parse_compound(pkt.data()).unwrap();
        assert_eq!(left, vec![RtcpPacket::ReceiverReport(RtcpReceiverReport::new(1))]);

        let mut only_feedback = compound(&[RtcpPacket::Pli(RtcpPli {
            sender_ssrc: 1,
            media_ssrc: 2,
        })]);
        assert_eq!(engine.transform(&mut only_feedback), TransformOutcome::Discard);
    }
}
