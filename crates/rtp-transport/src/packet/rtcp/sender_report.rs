use bytes::{Buf, BufMut, BytesMut};

use super::ntp::NtpTimestamp;
use super::report_block::RtcpReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// RTCP Sender Report (RFC 3550 6.4.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpSenderReport {
    /// SSRC of the sender
    pub ssrc: RtpSsrc,

    /// Wall clock time the report was sent
    pub ntp_timestamp: NtpTimestamp,

    /// RTP timestamp corresponding to `ntp_timestamp`
    pub rtp_timestamp: RtpTimestamp,

    /// Packets sent since the start of transmission
    pub packet_count: u32,

    /// Payload octets sent since the start of transmission
    pub octet_count: u32,

    /// Reception report blocks
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpSenderReport {
    pub fn new(ssrc: RtpSsrc, ntp_timestamp: NtpTimestamp, rtp_timestamp: RtpTimestamp) -> Self {
        Self {
            ssrc,
            ntp_timestamp,
            rtp_timestamp,
            packet_count: 0,
            octet_count: 0,
            report_blocks: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        24 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    /// Serialize the body (everything after the common header)
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u32(self.ssrc);
        buf.put_u32(self.ntp_timestamp.seconds);
        buf.put_u32(self.ntp_timestamp.fraction);
        buf.put_u32(self.rtp_timestamp);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
        for block in &self.report_blocks {
            block.serialize(&mut buf);
        }
        buf
    }
}

/// Parse a sender report body
pub fn parse_sender_report(buf: &mut impl Buf, report_count: u8) -> Result<RtcpSenderReport> {
    if buf.remaining() < 24 {
        return Err(Error::BufferTooSmall {
            required: 24,
            available: buf.remaining(),
        });
    }

    let ssrc = buf.get_u32();
    let seconds = buf.get_u32();
    let fraction = buf.get_u32();
    let rtp_timestamp = buf.get_u32();
    let packet_count = buf.get_u32();
    let octet_count = buf.get_u32();

    let mut report_blocks = Vec::with_capacity(report_count as usize);
    for _ in 0..report_count {
        report_blocks.push(RtcpReportBlock::parse(buf)?);
    }

    Ok(RtcpSenderReport {
        ssrc,
        ntp_timestamp: NtpTimestamp { seconds, fraction },
        rtp_timestamp,
        packet_count,
        octet_count,
        report_blocks,
    })
}
