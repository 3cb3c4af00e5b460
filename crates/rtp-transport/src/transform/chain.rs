use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use super::{EngineKind, EngineRef, PacketTransformer, TransformOutcome};
use crate::packet::RawPacket;
use crate::session::RtpExtensionKind;

/// Protocol a chain transformer works on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Rtp,
    Rtcp,
}

/// Ordered, bidirectional list of transform engines
pub struct TransformEngineChain {
    engines: Vec<EngineRef>,
    closed: AtomicBool,
}

impl TransformEngineChain {
    /// Build a chain; engines are placed in [`EngineKind`] order whatever
    /// the order they are given in
    pub fn new(mut engines: Vec<EngineRef>) -> Self {
        engines.sort_by_key(|engine| engine.kind());
        debug!(
            "Transform chain: {:?}",
            engines.iter().map(|e| e.kind()).collect::<Vec<_>>()
        );
        Self {
            engines,
            closed: AtomicBool::new(false),
        }
    }

    pub fn engines(&self) -> &[EngineRef] {
        &self.engines
    }

    pub fn contains(&self, kind: EngineKind) -> bool {
        self.engines.iter().any(|e| e.kind() == kind)
    }

    fn transformer<'a>(engine: &'a EngineRef, protocol: Protocol) -> Option<&'a dyn PacketTransformer> {
        match protocol {
            Protocol::Rtp => engine.rtp_transformer(),
            Protocol::Rtcp => engine.rtcp_transformer(),
        }
    }

    /// Run the send direction, starting after `after` when given
    pub fn transform(&self, protocol: Protocol, pkt: &mut RawPacket, after: Option<EngineKind>) -> TransformOutcome {
        if self.closed.load(Ordering::Acquire) {
            return TransformOutcome::Discard;
        }
        for engine in &self.engines {
            if after.is_some_and(|after| engine.kind() <= after) {
                continue;
            }
            if let Some(t) = Self::transformer(engine, protocol) {
                if t.transform(pkt).is_discard() {
                    trace!("{:?} packet discarded by {} on send", protocol, engine.kind());
                    return TransformOutcome::Discard;
                }
            }
        }
        TransformOutcome::Continue
    }

    /// Run the receive direction
    pub fn reverse_transform(&self, protocol: Protocol, pkt: &mut RawPacket) -> TransformOutcome {
        if self.closed.load(Ordering::Acquire) {
            return TransformOutcome::Discard;
        }
        for engine in self.engines.iter().rev() {
            if let Some(t) = Self::transformer(engine, protocol) {
                if t.reverse_transform(pkt).is_discard() {
                    trace!("{:?} packet discarded by {} on receive", protocol, engine.kind());
                    return TransformOutcome::Discard;
                }
            }
        }
        TransformOutcome::Continue
    }

    /// Tell every engine about a header extension mapping
    pub fn set_extension_id(&self, kind: RtpExtensionKind, id: Option<u8>) {
        for engine in &self.engines {
            engine.set_extension_id(kind, id);
        }
    }

    /// Close every engine once
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for engine in &self.engines {
            engine.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Transformer running the whole chain for RTP
    pub fn rtp_transformer(self: &Arc<Self>) -> Arc<ChainTransformer> {
        Arc::new(ChainTransformer {
            chain: self.clone(),
            protocol: Protocol::Rtp,
        })
    }

    /// Transformer running the whole chain for RTCP
    pub fn rtcp_transformer(self: &Arc<Self>) -> Arc<ChainTransformer> {
        Arc::new(ChainTransformer {
            chain: self.clone(),
            protocol: Protocol::Rtcp,
        })
    }
}

impl fmt::Debug for TransformEngineChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.engines.iter().map(|e| e.kind())).finish()
    }
}

/// Adapter exposing one protocol of a chain as a [`PacketTransformer`]
pub struct ChainTransformer {
    chain: Arc<TransformEngineChain>,
    protocol: Protocol,
}

impl PacketTransformer for ChainTransformer {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.chain.transform(self.protocol, pkt, None)
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.chain.reverse_transform(self.protocol, pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_rtp_packet;
    use crate::transform::TransformEngine;
    use parking_lot::Mutex;

    /// Records its kind into a shared log and optionally vetoes
    struct Recorder {
        kind: EngineKind,
        log: Arc<Mutex<Vec<(EngineKind, bool)>>>,
        veto_receive: bool,
    }

    impl PacketTransformer for Recorder {
        fn transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
            self.log.lock().push((self.kind, true));
            TransformOutcome::Continue
        }

        fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
            self.log.lock().push((self.kind, false));
            if self.veto_receive {
                TransformOutcome::Discard
            } else {
                TransformOutcome::Continue
            }
        }
    }

    impl TransformEngine for Recorder {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
            Some(self)
        }
    }

    fn recorder(kind: EngineKind, log: &Arc<Mutex<Vec<(EngineKind, bool)>>>, veto: bool) -> EngineRef {
        Arc::new(Recorder {
            kind,
            log: log.clone(),
            veto_receive: veto,
        })
    }

    #[test]
    fn test_send_order_and_reverse_receive() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(vec![
            recorder(EngineKind::Srtp, &log, false),
            recorder(EngineKind::Csrc, &log, false),
            recorder(EngineKind::Dtmf, &log, false),
        ]);

        let mut pkt = build_rtp_packet(0, false, 1, 1, 1, &[0; 4]);
        assert_eq!(chain.transform(Protocol::Rtp, &mut pkt, None), TransformOutcome::Continue);
        assert_eq!(chain.reverse_transform(Protocol::Rtp, &mut pkt), TransformOutcome::Continue);
        // RTCP has no transformers here
        assert_eq!(chain.transform(Protocol::Rtcp, &mut pkt, None), TransformOutcome::Continue);

        assert_eq!(
            *log.lock(),
            vec![
                (EngineKind::Csrc, true),
                (EngineKind::Dtmf, true),
                (EngineKind::Srtp, true),
                (EngineKind::Srtp, false),
                (EngineKind::Dtmf, false),
                (EngineKind::Csrc, false),
            ]
        );
    }

    #[test]
    fn test_inject_after_skips_earlier_engines() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(vec![
            recorder(EngineKind::Csrc, &log, false),
            recorder(EngineKind::Rtx, &log, false),
            recorder(EngineKind::Srtp, &log, false),
        ]);

        let mut pkt = build_rtp_packet(0, false, 1, 1, 1, &[]);
        chain.transform(Protocol::Rtp, &mut pkt, Some(EngineKind::Rtx));
        assert_eq!(*log.lock(), vec![(EngineKind::Srtp, true)]);
    }

    #[test]
    fn test_receive_veto_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = TransformEngineChain::new(vec![
            recorder(EngineKind::Csrc, &log, false),
            recorder(EngineKind::Dtmf, &log, true),
        ]);

        let mut pkt = build_rtp_packet(101, false, 1, 1, 1, &[]);
        assert_eq!(chain.reverse_transform(Protocol::Rtp, &mut pkt), TransformOutcome::Discard);
        assert_eq!(*log.lock(), vec![(EngineKind::Dtmf, false)]);
    }

    #[test]
    fn test_closed_chain_discards() {
        let chain = Arc::new(TransformEngineChain::new(Vec::new()));
        let rtp = chain.rtp_transformer();
        let mut pkt = build_rtp_packet(0, false, 1, 1, 1, &[]);
        assert_eq!(rtp.transform(&mut pkt), TransformOutcome::Continue);

        chain.close();
        chain.close();
        assert!(chain.is_closed());
        assert_eq!(rtp.transform(&mut pkt), TransformOutcome::Discard);
    }
}
