use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// Report block in RTCP SR/RR packets (RFC 3550 6.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtcpReportBlock {
    /// Source this block reports on
    pub ssrc: RtpSsrc,

    /// Fraction lost since the previous report, 8-bit fixed point
    pub fraction_lost: u8,

    /// Cumulative number of packets lost (24 bits, signed on the wire)
    pub cumulative_lost: u32,

    /// Extended highest sequence number received
    pub highest_seq: u32,

    /// Interarrival jitter in timestamp units
    pub jitter: u32,

    /// Middle 32 bits of the last SR NTP timestamp (LSR)
    pub last_sr: u32,

    /// Delay since last SR in 1/65536 s (DLSR)
    pub delay_since_last_sr: u32,
}

impl RtcpReportBlock {
    /// Size of a report block in bytes
    pub const SIZE: usize = 24;

    pub fn new(ssrc: RtpSsrc) -> Self {
        Self {
            ssrc,
            ..Default::default()
        }
    }

    pub fn parse(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: buf.remaining(),
            });
        }

        let ssrc = buf.get_u32();
        let lost_word = buf.get_u32();

        Ok(Self {
            ssrc,
            fraction_lost: (lost_word >> 24) as u8,
            cumulative_lost: lost_word & 0x00FF_FFFF,
            highest_seq: buf.get_u32(),
            jitter: buf.get_u32(),
            last_sr: buf.get_u32(),
            delay_since_last_sr: buf.get_u32(),
        })
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        buf.reserve(Self::SIZE);
        buf.put_u32(self.ssrc);
        buf.put_u32((self.fraction_lost as u32) << 24 | (self.cumulative_lost & 0x00FF_FFFF));
        buf.put_u32(self.highest_seq);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }

    /// Fraction lost as a percentage
    pub fn fraction_lost_percent(&self) -> f64 {
        self.fraction_lost as f64 * 100.0 / 256.0
    }
}

/// 8-bit fixed point fraction of `lost` over `expected`
pub fn fraction_lost(expected: u32, lost: i64) -> u8 {
    if expected == 0 || lost <= 0 {
        return 0;
    }
    ((lost as u64 * 256) / expected as u64).min(255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_block_wire_format() {
        let block = RtcpReportBlock {
            ssrc: 0x1234_5678,
            fraction_lost: 42,
            cumulative_lost: 1000,
            highest_seq: 70_000,
            jitter: 100,
            last_sr: 0x8765_4321,
            delay_since_last_sr: 1500,
        };

        let mut buf = BytesMut::new();
        block.serialize(&mut buf);
        assert_eq!(buf.len(), RtcpReportBlock::SIZE);
        assert_eq!(&buf[4..8], &[42, 0x00, 0x03, 0xE8]);

        let parsed = RtcpReportBlock::parse(&mut buf.freeze()).unwrap();
        assert_eq!(parsed, block);
    }

    #[test]
    fn test_short_block() {
        let mut data = &[0u8; 10][..];
        assert!(matches!(
            RtcpReportBlock::parse(&mut data),
            Err(Error::BufferTooSmall { required: 24, available: 10 })
        ));
    }

    #[test]
    fn test_fraction_lost() {
        assert_eq!(fraction_lost(1000, 0), 0);
        assert_eq!(fraction_lost(1000, 250), 64);
        assert_eq!(fraction_lost(1000, 1000), 255);
        assert_eq!(fraction_lost(0, 5), 0);
        assert_eq!(fraction_lost(10, -3), 0);
    }
}
