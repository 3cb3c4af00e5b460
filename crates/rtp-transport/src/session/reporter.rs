//! Periodic RTCP reports
//!
//! While a session runs, a task emits one compound packet per interval: a
//! sender report when media was sent, a receiver report otherwise, each with
//! one block per known remote source, followed by the SDES CNAME.

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::stream::MediaStream;
use crate::packet::rtcp::{
    NtpTimestamp, RtcpPacket, RtcpReceiverReport, RtcpReportBlock, RtcpSenderReport, RtcpSourceDescription,
};
use crate::{RtpSsrc, RtpTimestamp};

/// Blocks a single SR or RR can carry
const MAX_REPORT_BLOCKS: usize = 31;

/// Sender section of a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderInfo {
    pub ntp_timestamp: NtpTimestamp,
    pub rtp_timestamp: RtpTimestamp,
    pub packet_count: u32,
    pub octet_count: u32,
}

/// Build the compound report of `ssrc`
pub fn build_report(
    ssrc: RtpSsrc,
    sender: Option<SenderInfo>,
    mut blocks: Vec<RtcpReportBlock>,
    cname: &str,
) -> Vec<RtcpPacket> {
    blocks.truncate(MAX_REPORT_BLOCKS);
    let report = match sender {
        Some(info) => {
            let mut sr = RtcpSenderReport::new(ssrc, info.ntp_timestamp, info.rtp_timestamp);
            sr.packet_count = info.packet_count;
            sr.octet_count = info.octet_count;
            sr.report_blocks = blocks;
            RtcpPacket::SenderReport(sr)
        }
        None => {
            let mut rr = RtcpReceiverReport::new(ssrc);
            rr.report_blocks = blocks;
            RtcpPacket::ReceiverReport(rr)
        }
    };
    vec![report, RtcpPacket::SourceDescription(RtcpSourceDescription::with_cname(ssrc, cname))]
}

/// Report loop of a session; ends on shutdown or when the session is gone
pub(crate) async fn report_loop(stream: Weak<MediaStream>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        let Some(stream) = stream.upgrade() else {
            break;
        };

        let expired = stream.expire_remote_sources(Instant::now());
        if !expired.is_empty() {
            trace!("Expired remote sources {:?}", expired);
        }
        if let Err(e) = stream.send_rtcp_report().await {
            debug!("RTCP report not sent: {}", e);
        }
    }
    trace!("RTCP report loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_or_receiver_report() {
        let info = SenderInfo {
            ntp_timestamp: NtpTimestamp { seconds: 10, fraction: 0 },
            rtp_timestamp: 8000,
            packet_count: 50,
            octet_count: 8000,
        };
        let packets = build_report(7, Some(info), vec![RtcpReportBlock::new(9)], "alice@host");
        match &packets[0] {
            RtcpPacket::SenderReport(sr) => {
                assert_eq!(sr.packet_count, 50);
                assert_eq!(sr.report_blocks.len(), 1);
            }
            other => panic!("unexpected packet {other:?}"),
        }
        match &packets[1] {
            RtcpPacket::SourceDescription(sdes) => assert_eq!(sdes.cname(7), Some("alice@host")),
            other => panic!("unexpected packet {other:?}"),
        }

        let blocks = (0..40).map(RtcpReportBlock::new).collect();
        let packets = build_report(7, None, blocks, "alice@host");
        match &packets[0] {
            RtcpPacket::ReceiverReport(rr) => assert_eq!(rr.report_blocks.len(), MAX_REPORT_BLOCKS),
            other => panic!("unexpected packet {other:?}"),
        }
    }
}
