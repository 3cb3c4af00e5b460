use bytes::{Buf, BufMut, BytesMut};

use super::report_block::RtcpReportBlock;
use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP Receiver Report (RFC 3550 6.4.2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReceiverReport {
    /// SSRC of the receiver
    pub ssrc: RtpSsrc,

    /// Report blocks
    pub report_blocks: Vec<RtcpReportBlock>,
}

impl RtcpReceiverReport {
    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            report_blocks: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        4 + self.report_blocks.len() * RtcpReportBlock::SIZE
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_u32(self.ssrc);
        for block in &self.report_blocks {
            block.serialize(&mut buf);
        }
        buf
    }
}

/// Parse a receiver report body
pub fn parse_receiver_report(buf: &mut impl Buf, report_count: u8) -> Result<RtcpReceiverReport> {
    if buf.remaining() < 4 {
        return Err(Error::BufferTooSmall {
            required: 4,
            available: buf.remaining(),
        });
    }

    let ssrc = buf.get_u32();
    let mut report_blocks = Vec::with_capacity(report_count as usize);
    for _ in 0..report_count {
        report_blocks.push(RtcpReportBlock::parse(buf)?);
    }

    Ok(RtcpReceiverReport { ssrc, report_blocks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_receiver_report() {
        let rr = RtcpReceiverReport::new(0x1234_5678);
        assert_eq!(rr.size(), 4);
        let parsed = parse_receiver_report(&mut rr.serialize().freeze(), 0).unwrap();
        assert!(parsed.report_blocks.is_empty());
        assert_eq!(parsed.ssrc, 0x1234_5678);
    }

    #[test]
    fn test_receiver_report_with_blocks() {
        let mut rr = RtcpReceiverReport::new(1);
        let mut block = RtcpReportBlock::new(2);
        block.jitter = 80;
        rr.report_blocks.push(block);
        rr.report_blocks.push(RtcpReportBlock::new(3));

        let parsed = parse_receiver_report(&mut rr.serialize().freeze(), 2).unwrap();
        assert_eq!(parsed, rr);
    }
}
