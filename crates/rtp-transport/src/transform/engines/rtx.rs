//! Retransmission (RFC 4588)
//!
//! On an incoming NACK the lost packets are looked up in the
//! [`CachingEngine`] and sent again, as RTX packets when an RTX payload type
//! and SSRC are configured and as plain copies otherwise. Retransmissions
//! are injected after this engine so they are not cached twice.
//!
//! Incoming RTX packets are turned back into the original packet: the
//! original sequence number (OSN) is taken from the first two payload bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::CachingEngine;
use crate::packet::rtcp::RtcpPacket;
use crate::packet::{RawPacket, FLAG_RETRANSMISSION};
use crate::ssrc::random_ssrc;
use crate::transform::{EngineKind, PacketInjector, PacketTransformer, TransformEngine, TransformOutcome};
use crate::{RtpSequenceNumber, RtpSsrc};

/// Retransmission engine of a session
pub struct RtxEngine {
    rtp: RtxReceiver,
    rtcp: NackResponder,
}

/// RTX payload type per media payload type
type RtxPayloadTypes = RwLock<HashMap<u8, u8>>;

struct RtxReceiver {
    /// rtx pt -> media pt
    payload_types: RtxPayloadTypes,
    /// rtx ssrc -> media ssrc
    ssrcs: RwLock<HashMap<RtpSsrc, RtpSsrc>>,
}

struct NackResponder {
    cache: Arc<CachingEngine>,
    injector: RwLock<Option<Weak<dyn PacketInjector>>>,
    /// media pt -> rtx pt
    payload_types: RtxPayloadTypes,
    rtx_ssrc: RwLock<Option<RtpSsrc>>,
    next_seq: AtomicU16,
}

impl RtxEngine {
    pub fn new(cache: Arc<CachingEngine>) -> Self {
        Self {
            rtp: RtxReceiver {
                payload_types: RwLock::new(HashMap::new()),
                ssrcs: RwLock::new(HashMap::new()),
            },
            rtcp: NackResponder {
                cache,
                injector: RwLock::new(None),
                payload_types: RwLock::new(HashMap::new()),
                rtx_ssrc: RwLock::new(None),
                next_seq: AtomicU16::new(rand::random()),
            },
        }
    }

    /// Where retransmissions are sent
    pub fn set_injector(&self, injector: Weak<dyn PacketInjector>) {
        *self.rtcp.injector.write() = Some(injector);
    }

    /// Associate an RTX payload type with the media payload type it repairs
    pub fn add_payload_type(&self, rtx_pt: u8, media_pt: u8) {
        self.rtcp.payload_types.write().insert(media_pt, rtx_pt);
        self.rtp.payload_types.write().insert(rtx_pt, media_pt);
    }

    pub fn clear_payload_types(&self) {
        self.rtcp.payload_types.write().clear();
        self.rtp.payload_types.write().clear();
    }

    /// SSRC of outgoing RTX packets; `None` disables RTX encapsulation
    pub fn set_rtx_ssrc(&self, ssrc: Option<RtpSsrc>) {
        *self.rtcp.rtx_ssrc.write() = ssrc;
    }

    /// Generate an RTX SSRC if none is set, returning the one in use
    pub fn ensure_rtx_ssrc(&self) -> RtpSsrc {
        *self.rtcp.rtx_ssrc.write().get_or_insert_with(random_ssrc)
    }

    pub fn rtx_ssrc(&self) -> Option<RtpSsrc> {
        *self.rtcp.rtx_ssrc.read()
    }

    /// Map a remote RTX SSRC to the media SSRC it repairs
    pub fn add_remote_ssrc(&self, rtx_ssrc: RtpSsrc, media_ssrc: RtpSsrc) {
        self.rtp.ssrcs.write().insert(rtx_ssrc, media_ssrc);
    }
}

impl NackResponder {
    /// The packet to send again for `ssrc`/`seq`
    fn retransmission(&self, ssrc: RtpSsrc, seq: RtpSequenceNumber) -> Option<RawPacket> {
        let mut pkt = self.cache.get(ssrc, seq)?;
        let rtx_pt = self.payload_types.read().get(&pkt.payload_type()).copied();
        let rtx_ssrc = *self.rtx_ssrc.read();

        if let (Some(rtx_pt), Some(rtx_ssrc)) = (rtx_pt, rtx_ssrc) {
            let mut payload = Vec::with_capacity(pkt.payload_length() + 2);
            payload.extend_from_slice(&seq.to_be_bytes());
            payload.extend_from_slice(pkt.payload());
            pkt.set_payload(&payload);
            pkt.set_payload_type(rtx_pt);
            pkt.set_ssrc(rtx_ssrc);
            pkt.set_sequence_number(self.next_seq.fetch_add(1, Ordering::Relaxed));
        }
        pkt.add_flags(FLAG_RETRANSMISSION);
        Some(pkt)
    }
}

impl PacketTransformer for NackResponder {
    fn transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let injector = self.injector.read().as_ref().and_then(Weak::upgrade);
        let Some(injector) = injector else {
            return TransformOutcome::Continue;
        };
        let Ok(packets) = RtcpPacket::parse_compound(pkt.data()) else {
            return TransformOutcome::Continue;
        };

        for packet in packets {
            let RtcpPacket::Nack(nack) = packet else {
                continue;
            };
            let mut missing = 0;
            for seq in nack.lost {
                match self.retransmission(nack.media_ssrc, seq) {
                    Some(rtx) => injector.inject(rtx, Some(EngineKind::Rtx)),
                    None => missing += 1,
                }
            }
            if missing > 0 {
                debug!("{} NACKed packets of {:08x} no longer cached", missing, nack.media_ssrc);
            }
        }
        TransformOutcome::Continue
    }
}

impl PacketTransformer for RtxReceiver {
    fn transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        if pkt.is_invalid_rtp() {
            return TransformOutcome::Continue;
        }
        let Some(media_pt) = self.payload_types.read().get(&pkt.payload_type()).copied() else {
            return TransformOutcome::Continue;
        };
        if pkt.payload_length() < 2 {
            // padding-only probe
            return TransformOutcome::Discard;
        }

        let payload = pkt.payload();
        let osn = u16::from_be_bytes([payload[0], payload[1]]);
        let original = payload[2..].to_vec();
        pkt.set_payload(&original);
        pkt.set_sequence_number(osn);
        pkt.set_payload_type(media_pt);
        match self.ssrcs.read().get(&pkt.ssrc()) {
            Some(media_ssrc) => pkt.set_ssrc(*media_ssrc),
            None => trace!("RTX SSRC {:08x} has no media association", pkt.ssrc()),
        }
        pkt.add_flags(FLAG_RETRANSMISSION);
        TransformOutcome::Continue
    }
}

impl TransformEngine for RtxEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Rtx
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(&self.rtp)
    }

    fn rtcp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(&self.rtcp)
    }

    fn close(&self) {
        *self.rtcp.injector.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_rtp_packet;
    use crate::packet::rtcp::{serialize_compound, RtcpNack};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        packets: Mutex<Vec<(RawPacket, Option<EngineKind>)>>,
    }

    impl PacketInjector for Collector {
        fn inject(&self, pkt: RawPacket, after: Option<EngineKind>) {
            self.packets.lock().push((pkt, after));
        }
    }

    fn setup() -> (RtxEngine, Arc<CachingEngine>, Arc<Collector>) {
        let cache = Arc::new(CachingEngine::new(16));
        let engine = RtxEngine::new(cache.clone());
        let collector = Arc::new(Collector::default());
        let weak: Weak<dyn PacketInjector> = Arc::downgrade(&(collector.clone() as Arc<dyn PacketInjector>));
        engine.set_injector(weak);
        (engine, cache, collector)
    }

    fn nack(lost: Vec<u16>) -> RawPacket {
        RawPacket::from_slice(&serialize_compound(&[RtcpPacket::Nack(RtcpNack::new(2, 0x1111, lost))]).unwrap())
    }

    #[test]
    fn test_nack_answered_with_rtx() {
        let (engine, cache, collector) = setup();
        engine.add_payload_type(97, 96);
        engine.set_rtx_ssrc(Some(0x2222));
        let mut sent = build_rtp_packet(96, false, 500, 9000, 0x1111, &[1, 2, 3]);
        cache.transform(&mut sent);

        let mut feedback = nack(vec![500, 501]);
        assert_eq!(
            engine.rtcp_transformer().unwrap().reverse_transform(&mut feedback),
            TransformOutcome::Continue
        );

        let packets = collector.packets.lock();
        assert_eq!(packets.len(), 1);
        let (rtx, after) = &packets[0];
        assert_eq!(*after, Some(EngineKind::Rtx));
        assert_eq!(rtx.payload_type(), 97);
        assert_eq!(rtx.ssrc(), 0x2222);
        assert_eq!(rtx.timestamp(), 9000);
        assert_eq!(rtx.payload(), &[0x01, 0xF4, 1, 2, 3]);
        assert_ne!(rtx.flags() & FLAG_RETRANSMISSION, 0);
    }

    #[test]
    fn test_nack_without_rtx_resends_original() {
        let (engine, cache, collector) = setup();
        let mut sent = build_rtp_packet(0, false, 7, 160, 0x1111, &[4]);
        cache.transform(&mut sent);

        let mut feedback = nack(vec![7]);
        engine.rtcp_transformer().unwrap().reverse_transform(&mut feedback);
        let packets = collector.packets.lock();
        assert_eq!(packets[0].0.sequence_number(), 7);
        assert_eq!(packets[0].0.payload(), &[4]);
    }

    #[test]
    fn test_receive_restores_original() {
        let (engine, _cache, _collector) = setup();
        engine.add_payload_type(97, 96);
        engine.add_remote_ssrc(0x3333, 0x4444);
        let rtp = engine.rtp_transformer().unwrap();

        let mut pkt = build_rtp_packet(97, false, 1, 100, 0x3333, &[0x00, 0x2A, 9, 9]);
        assert_eq!(rtp.reverse_transform(&mut pkt), TransformOutcome::Continue);
        assert_eq!(pkt.sequence_number(), 42);
        assert_eq!(pkt.payload_type(), 96);
        assert_eq!(pkt.ssrc(), 0x4444);
        assert_eq!(pkt.payload(), &[9, 9]);

        let mut probe = build_rtp_packet(97, false, 2, 100, 0x3333, &[0]);
        assert_eq!(rtp.reverse_transform(&mut probe), TransformOutcome::Discard);
    }
}
