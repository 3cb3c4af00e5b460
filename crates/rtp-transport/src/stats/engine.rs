use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::MediaStreamStats;
use crate::events::MediaStreamEvent;
use crate::packet::rtcp::RtcpPacket;
use crate::packet::RawPacket;
use crate::time::ntp_short_now;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};

/// Callback for PLI and FIR requests
pub type KeyframeHandler = Arc<dyn Fn() + Send + Sync>;

/// Feeds [`MediaStreamStats`] from the packets crossing the chain
pub struct StatisticsEngine {
    rtp: RtpStatistics,
    rtcp: RtcpStatistics,
}

struct RtpStatistics {
    stats: Arc<MediaStreamStats>,
}

struct RtcpStatistics {
    stats: Arc<MediaStreamStats>,
    events: broadcast::Sender<MediaStreamEvent>,
    keyframe: RwLock<Option<KeyframeHandler>>,
}

impl StatisticsEngine {
    pub fn new(stats: Arc<MediaStreamStats>, events: broadcast::Sender<MediaStreamEvent>) -> Self {
        Self {
            rtp: RtpStatistics { stats: stats.clone() },
            rtcp: RtcpStatistics {
                stats,
                events,
                keyframe: RwLock::new(None),
            },
        }
    }

    pub fn stats(&self) -> &Arc<MediaStreamStats> {
        &self.rtp.stats
    }

    pub fn set_keyframe_handler(&self, handler: Option<KeyframeHandler>) {
        *self.rtcp.keyframe.write() = handler;
    }
}

impl TransformEngine for StatisticsEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Statistics
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(&self.rtp)
    }

    fn rtcp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(&self.rtcp)
    }
}

impl PacketTransformer for RtpStatistics {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.stats.record_sent(pkt.payload_length());
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.stats.receive_statistics().on_rtp(
            pkt.ssrc(),
            pkt.sequence_number(),
            pkt.timestamp(),
            self.stats.clock_rate(),
            pkt.payload_length(),
            Instant::now(),
        );
        TransformOutcome::Continue
    }
}

impl PacketTransformer for RtcpStatistics {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.stats.record_rtcp_sent(pkt.len());
        let packets = match RtcpPacket::parse_compound(pkt.data()) {
            Ok(packets) => packets,
            Err(e) => {
                trace!("Outgoing RTCP not parsed: {}", e);
                return TransformOutcome::Continue;
            }
        };

        for packet in &packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    self.stats
                        .record_sender_report_emission(sr.ntp_timestamp.to_ntp_short(), ntp_short_now());
                    for block in &sr.report_blocks {
                        self.stats.on_sent_report_block(block);
                    }
                }
                RtcpPacket::ReceiverReport(rr) => {
                    for block in &rr.report_blocks {
                        self.stats.on_sent_report_block(block);
                    }
                }
                _ => {}
            }
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.stats.record_rtcp_received(pkt.len());
        let packets = match RtcpPacket::parse_compound(pkt.data()) {
            Ok(packets) => packets,
            Err(e) => {
                debug!("Malformed RTCP ignored by statistics: {}", e);
                return TransformOutcome::Continue;
            }
        };

        let now = Instant::now();
        let now_ntp = ntp_short_now();
        for packet in packets {
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    self.stats
                        .receive_statistics()
                        .on_sender_report(sr.ssrc, sr.ntp_timestamp, now);
                    self.on_report_blocks(sr.ssrc, &sr.report_blocks, now_ntp);
                }
                RtcpPacket::ReceiverReport(rr) => {
                    self.on_report_blocks(rr.ssrc, &rr.report_blocks, now_ntp);
                }
                RtcpPacket::Nack(nack) => {
                    self.stats.record_nack();
                    let _ = self.events.send(MediaStreamEvent::NackReceived {
                        media_ssrc: nack.media_ssrc,
                        lost: nack.lost,
                    });
                }
                RtcpPacket::TransportCc(_) => self.stats.record_tcc(),
                RtcpPacket::Remb(remb) => {
                    self.stats.set_remb_bitrate(remb.bitrate);
                    let _ = self.events.send(MediaStreamEvent::RembReceived {
                        bitrate: remb.bitrate,
                        ssrcs: remb.ssrcs,
                    });
                }
                RtcpPacket::Pli(_) | RtcpPacket::Fir(_) => {
                    let handler = self.keyframe.read().clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
                _ => {}
            }
        }
        TransformOutcome::Continue
    }
}

impl RtcpStatistics {
    fn on_report_blocks(&self, sender: u32, blocks: &[crate::packet::rtcp::RtcpReportBlock], now_ntp: u32) {
        for block in blocks {
            let rtt = self.stats.on_received_report_block(block, now_ntp);
            let _ = self.events.send(MediaStreamEvent::RtcpReportReceived {
                ssrc: sender,
                rtt: rtt.map(|ms| Duration::from_secs_f64(ms / 1000.0)),
                jitter_ms: block.jitter as f64 * 1000.0 / self.stats.clock_rate() as f64,
                loss_percent: block.fraction_lost_percent(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::packet::build_rtp_packet;
    use crate::packet::rtcp::{RtcpNack, RtcpReceiverReport, RtcpRemb, RtcpReportBlock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine() -> (StatisticsEngine, broadcast::Receiver<MediaStreamEvent>) {
        let (tx, rx) = broadcast::channel(16);
        let stats = Arc::new(MediaStreamStats::new(&TransportConfig::default()));
        stats.set_local_ssrc(0xAAAA);
        (StatisticsEngine::new(stats, tx), rx)
    }

    fn rtcp(packets: &[RtcpPacket]) -> RawPacket {
        RawPacket::from_slice(&crate::packet::rtcp::serialize_compound(packets).unwrap())
    }

    #[tokio::test]
    async fn test_rtp_counters() {
        let (engine, _rx) = engine();
        let rtp = engine.rtp_transformer().unwrap();
        let mut pkt = build_rtp_packet(0, false, 1, 160, 0xBBBB, &[0; 160]);
        rtp.transform(&mut pkt);
        rtp.reverse_transform(&mut pkt);

        assert_eq!(engine.stats().sent_counters(), (1, 160));
        let source = engine.stats().receive_statistics().source(0xBBBB).unwrap();
        assert_eq!(source.bytes_received, 160);
    }

    #[tokio::test]
    async fn test_feedback_events() {
        let (engine, mut rx) = engine();
        let keyframes = Arc::new(AtomicUsize::new(0));
        let counter = keyframes.clone();
        engine.set_keyframe_handler(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        let mut rr = RtcpReceiverReport::new(0xBBBB);
        let mut block = RtcpReportBlock::new(0xAAAA);
        block.jitter = 160;
        rr.report_blocks.push(block);
        let mut pkt = rtcp(&[
            RtcpPacket::ReceiverReport(rr),
            RtcpPacket::Nack(RtcpNack::new(0xBBBB, 0xAAAA, vec![5, 6])),
            RtcpPacket::Remb(RtcpRemb {
                sender_ssrc: 0xBBBB,
                bitrate: 256_000,
                ssrcs: vec![0xAAAA],
            }),
            RtcpPacket::Pli(crate::packet::rtcp::RtcpPli {
                sender_ssrc: 0xBBBB,
                media_ssrc: 0xAAAA,
            }),
        ]);

        let rtcp = engine.rtcp_transformer().unwrap();
        assert_eq!(rtcp.reverse_transform(&mut pkt), TransformOutcome::Continue);

        match rx.try_recv().unwrap() {
            MediaStreamEvent::RtcpReportReceived { ssrc, rtt, jitter_ms, .. } => {
                assert_eq!(ssrc, 0xBBBB);
                assert_eq!(rtt, None);
                assert_eq!(jitter_ms, 20.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            MediaStreamEvent::NackReceived {
                media_ssrc: 0xAAAA,
                lost: vec![5, 6]
            }
        );
        assert!(matches!(rx.try_recv().unwrap(), MediaStreamEvent::RembReceived { bitrate: 256_000, .. }));

        let snapshot = engine.stats().snapshot();
        assert_eq!(snapshot.nacks_received, 1);
        assert_eq!(snapshot.remb_bitrate, Some(256_000));
        assert_eq!(snapshot.rtcp_packets_received, 1);
        assert_eq!(snapshot.upload.jitter_ms, 20.0);
        assert_eq!(keyframes.load(Ordering::Relaxed), 1);
    }
}
