use std::collections::HashMap;

use parking_lot::RwLock;

use crate::packet::RawPacket;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};

/// Rewrites payload types of outgoing RTP
#[derive(Debug, Default)]
pub struct PayloadTypeOverrideEngine {
    overrides: RwLock<HashMap<u8, u8>>,
}

impl PayloadTypeOverrideEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_overrides(&self, overrides: HashMap<u8, u8>) {
        *self.overrides.write() = overrides;
    }
}

impl PacketTransformer for PayloadTypeOverrideEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        if pkt.is_invalid_rtp() {
            return TransformOutcome::Continue;
        }
        if let Some(pt) = self.overrides.read().get(&pkt.payload_type()) {
            pkt.set_payload_type(*pt);
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }
}

impl TransformEngine for PayloadTypeOverrideEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::PayloadTypeOverride
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }
}
