//! Send-side timing header extensions
//!
//! `abs-send-time` carries the 6.18 fixed point send time in seconds.
//! `transport-wide-cc` carries a 16-bit counter shared by every stream of the
//! transport; on receive the counter and arrival time are reported to an
//! optional callback for congestion control feedback.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::trace;

use super::OptionalByte;
use crate::packet::rtcp::NtpTimestamp;
use crate::packet::RawPacket;
use crate::session::RtpExtensionKind;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};

/// Receives the transport-wide sequence number and arrival time of packets
pub type ArrivalCallback = Arc<dyn Fn(u16, Instant) + Send + Sync>;

/// 24 bits of the NTP time: 6 bits of seconds, 18 of fraction
fn abs_send_time(now: NtpTimestamp) -> [u8; 3] {
    let value = (now.to_u64() >> 14) & 0x00FF_FFFF;
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Stamps `abs-send-time` on outgoing RTP
#[derive(Debug, Default)]
pub struct AbsSendTimeEngine {
    extension_id: OptionalByte,
}

impl AbsSendTimeEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketTransformer for AbsSendTimeEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(id) = self.extension_id.get() else {
            return TransformOutcome::Continue;
        };
        if !pkt.is_invalid_rtp() {
            if let Err(e) = pkt.set_header_extension(id, &abs_send_time(NtpTimestamp::now())) {
                trace!("abs-send-time not stamped: {}", e);
            }
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }
}

impl TransformEngine for AbsSendTimeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::AbsSendTime
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }

    fn set_extension_id(&self, kind: RtpExtensionKind, id: Option<u8>) {
        if kind == RtpExtensionKind::AbsSendTime {
            self.extension_id.set(id);
        }
    }
}

/// Stamps and reads transport-wide sequence numbers
pub struct TransportCcEngine {
    extension_id: OptionalByte,
    next_seq: AtomicU16,
    on_arrival: RwLock<Option<ArrivalCallback>>,
}

impl TransportCcEngine {
    pub fn new() -> Self {
        Self {
            extension_id: OptionalByte::default(),
            next_seq: AtomicU16::new(0),
            on_arrival: RwLock::new(None),
        }
    }

    pub fn set_arrival_callback(&self, callback: Option<ArrivalCallback>) {
        *self.on_arrival.write() = callback;
    }
}

impl Default for TransportCcEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTransformer for TransportCcEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(id) = self.extension_id.get() else {
            return TransformOutcome::Continue;
        };
        if pkt.is_invalid_rtp() {
            return TransformOutcome::Continue;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = pkt.set_header_extension(id, &seq.to_be_bytes()) {
            trace!("transport-cc not stamped: {}", e);
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(id) = self.extension_id.get() else {
            return TransformOutcome::Continue;
        };
        let callback = self.on_arrival.read().clone();
        let Some(callback) = callback else {
            return TransformOutcome::Continue;
        };
        if let Some(data) = pkt.header_extension(id) {
            if data.len() >= 2 {
                callback(u16::from_be_bytes([data[0], data[1]]), Instant::now());
            }
        }
        TransformOutcome::Continue
    }
}

impl TransformEngine for TransportCcEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::TransportCc
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }

    fn set_extension_id(&self, kind: RtpExtensionKind, id: Option<u8>) {
        if kind == RtpExtensionKind::TransportCc {
            self.extension_id.set(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_rtp_packet;
    use parking_lot::Mutex;

    #[test]
    fn test_abs_send_time_encoding() {
        // 1.5 s past a second boundary: 6 bits of seconds, 18 of fraction
        let ts = NtpTimestamp {
            seconds: 65,
            fraction: 0x8000_0000,
        };
        assert_eq!(abs_send_time(ts), [0x06, 0x00, 0x00]);
    }

    #[test]
    fn test_abs_send_time_stamped_when_mapped() {
        let engine = AbsSendTimeEngine::new();
        let mut pkt = build_rtp_packet(0, false, 1, 0, 1, &[5]);
        engine.transform(&mut pkt);
        assert!(pkt.header_extension(2).is_none());

        engine.set_extension_id(RtpExtensionKind::AbsSendTime, Some(2));
        engine.set_extension_id(RtpExtensionKind::TransportCc, None);
        engine.transform(&mut pkt);
        assert_eq!(pkt.header_extension(2).map(|d| d.len()), Some(3));
    }

    #[tokio::test]
    async fn test_transport_cc_sequence_and_arrival() {
        let engine = TransportCcEngine::new();
        engine.set_extension_id(RtpExtensionKind::TransportCc, Some(5));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set_arrival_callback(Some(Arc::new(move |seq, _| sink.lock().push(seq))));

        for _ in 0..3 {
            let mut pkt = build_rtp_packet(0, false, 1, 0, 1, &[5]);
            engine.transform(&mut pkt);
            engine.reverse_transform(&mut pkt);
        }
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }
}
