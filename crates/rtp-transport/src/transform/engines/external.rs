use std::sync::Arc;

use parking_lot::RwLock;

use crate::packet::RawPacket;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};

type Slot = RwLock<Option<Arc<dyn PacketTransformer>>>;

/// Runs user supplied transformers at the `External` position
///
/// The transformers can be swapped at any time; an empty slot passes
/// packets through.
#[derive(Default)]
pub struct ExternalEngine {
    rtp: ExternalSlot,
    rtcp: ExternalSlot,
}

#[derive(Default)]
struct ExternalSlot(Slot);

impl ExternalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rtp_transformer(&self, transformer: Option<Arc<dyn PacketTransformer>>) {
        *self.rtp.0.write() = transformer;
    }

    pub fn set_rtcp_transformer(&self, transformer: Option<Arc<dyn PacketTransformer>>) {
        *self.rtcp.0.write() = transformer;
    }
}

impl PacketTransformer for ExternalSlot {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let transformer = self.0.read().clone();
        transformer.map_or(TransformOutcome::Continue, |t| t.transform(pkt))
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let transformer = self.0.read().clone();
        transformer.map_or(TransformOutcome::Continue, |t| t.reverse_transform(pkt))
    }

    fn close(&self) {
        if let Some(transformer) = self.0.write().take() {
            transformer.close();
        }
    }
}

impl TransformEngine for ExternalEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::External
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(&self.rtp)
    }

    fn rtcp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(&self.rtcp)
    }
}
