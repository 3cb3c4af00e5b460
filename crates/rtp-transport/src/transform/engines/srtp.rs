use crate::session::RtpExtensionKind;
use crate::transform::{EngineKind, EngineRef, PacketTransformer, TransformEngine};

/// Places the engine of an SRTP control in the encryption slot
pub struct SrtpEngine {
    inner: EngineRef,
}

impl SrtpEngine {
    pub fn new(inner: EngineRef) -> Self {
        Self { inner }
    }
}

impl TransformEngine for SrtpEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Srtp
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        self.inner.rtp_transformer()
    }

    fn rtcp_transformer(&self) -> Option<&dyn PacketTransformer> {
        self.inner.rtcp_transformer()
    }

    fn set_extension_id(&self, kind: RtpExtensionKind, id: Option<u8>) {
        self.inner.set_extension_id(kind, id);
    }

    fn close(&self) {
        self.inner.close();
    }
}
