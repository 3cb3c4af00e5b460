use std::sync::Arc;

use tracing::trace;

use super::OptionalByte;
use crate::packet::RawPacket;
use crate::stats::MediaStreamStats;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};

/// Receive-side accounting of ULPFEC and FlexFEC packets
///
/// Recovery is not attempted: FEC packets are counted and taken off the
/// media path so the device never sees them.
pub struct FecEngine {
    ulpfec: OptionalByte,
    flexfec: OptionalByte,
    stats: Arc<MediaStreamStats>,
}

impl FecEngine {
    pub fn new(stats: Arc<MediaStreamStats>) -> Self {
        Self {
            ulpfec: OptionalByte::default(),
            flexfec: OptionalByte::default(),
            stats,
        }
    }

    pub fn set_ulpfec_payload_type(&self, pt: Option<u8>) {
        self.ulpfec.set(pt);
    }

    pub fn set_flexfec_payload_type(&self, pt: Option<u8>) {
        self.flexfec.set(pt);
    }

    pub fn ulpfec_payload_type(&self) -> Option<u8> {
        self.ulpfec.get()
    }

    pub fn flexfec_payload_type(&self) -> Option<u8> {
        self.flexfec.get()
    }

    fn is_fec(&self, pt: u8) -> bool {
        self.ulpfec.get() == Some(pt) || self.flexfec.get() == Some(pt)
    }
}

impl PacketTransformer for FecEngine {
    fn transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        if pkt.is_invalid_rtp() || !self.is_fec(pkt.payload_type()) {
            return TransformOutcome::Continue;
        }
        trace!("FEC packet {} from {:08x}", pkt.sequence_number(), pkt.ssrc());
        self.stats.record_fec();
        TransformOutcome::Discard
    }
}

impl TransformEngine for FecEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fec
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::packet::build_rtp_packet;

    #[test]
    fn test_counts_and_discards_fec() {
        let stats = Arc::new(MediaStreamStats::new(&TransportConfig::default()));
        let engine = FecEngine::new(stats.clone());
        let mut fec = build_rtp_packet(117, false, 1, 0, 1, &[0; 10]);
        assert_eq!(engine.reverse_transform(&mut fec), TransformOutcome::Continue);

        engine.set_ulpfec_payload_type(Some(117));
        assert_eq!(engine.reverse_transform(&mut fec), TransformOutcome::Discard);
        let mut media = build_rtp_packet(96, false, 2, 0, 1, &[0; 10]);
        assert_eq!(engine.reverse_transform(&mut media), TransformOutcome::Continue);
        assert_eq!(stats.snapshot().fec_packets_received, 1);

        engine.set_ulpfec_payload_type(None);
        assert_eq!(engine.reverse_transform(&mut fec), TransformOutcome::Continue);
    }
}
