use parking_lot::RwLock;
use tracing::warn;

use crate::packet::RawPacket;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};
use crate::RtpSsrc;

/// Writes the current contributing sources into outgoing RTP
#[derive(Debug, Default)]
pub struct CsrcEngine {
    csrcs: RwLock<Vec<RtpSsrc>>,
}

impl CsrcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the CSRC list; at most 15 entries are kept
    pub fn set_csrcs(&self, mut csrcs: Vec<RtpSsrc>) {
        csrcs.truncate(15);
        *self.csrcs.write() = csrcs;
    }

    pub fn csrcs(&self) -> Vec<RtpSsrc> {
        self.csrcs.read().clone()
    }
}

impl PacketTransformer for CsrcEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let csrcs = self.csrcs.read();
        if pkt.is_invalid_rtp() || (csrcs.is_empty() && pkt.csrc_count() == 0) {
            return TransformOutcome::Continue;
        }
        if let Err(e) = pkt.set_csrcs(&csrcs) {
            warn!("Failed to set CSRCs: {}", e);
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }
}

impl TransformEngine for CsrcEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Csrc
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
    fn test_stamps_and_clears_csrcs() {
        let engine = CsrcEngine::new();
        engine.set_csrcs(vec![1, 2]);
        let mut pkt = build_rtp_packet(0, false, 1, 1, 9, &[7, 7]);
        engine.transform(&mut pkt);
        assert_eq!(pkt.csrcs(), vec![1, 2]);
        assert_eq!(pkt.payload(), &[7, 7]);

        engine.set_csrcs(Vec::new());
        engine.transform(&mut pkt);
        assert_eq!(pkt.csrc_count(), 0);
        assert_eq!(pkt.payload(), &[7, 7]);
    }
}
