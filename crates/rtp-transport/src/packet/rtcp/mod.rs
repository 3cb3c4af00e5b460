//! RTCP packets
//!
//! Parsing of compound RTCP packets (RFC 3550) with the feedback messages of
//! RFC 4585 / RFC 5104 and the REMB and transport-wide CC extensions, plus
//! serialization of everything the transport emits.

mod bye;
mod feedback;
mod ntp;
mod receiver_report;
mod report_block;
mod sdes;
mod sender_report;

pub use bye::{parse_bye, RtcpGoodbye};
pub use feedback::{
    parse_fir, parse_nack, parse_remb, parse_transport_cc, FirEntry, RtcpFir, RtcpNack, RtcpPli, RtcpRemb,
    RtcpTransportCc, FMT_AFB, FMT_FIR, FMT_NACK, FMT_PLI, FMT_TCC,
};
pub use ntp::NtpTimestamp;
pub use receiver_report::{parse_receiver_report, RtcpReceiverReport};
pub use report_block::{fraction_lost, RtcpReportBlock};
pub use sdes::{parse_sdes, RtcpSourceDescription, SdesChunk, SdesItem, SDES_CNAME};
pub use sender_report::{parse_sender_report, RtcpSenderReport};

use bytes::{BufMut, BytesMut};

use super::RTP_VERSION;
use crate::error::Error;
use crate::Result;

/// Sender report
pub const RTCP_SR: u8 = 200;
/// Receiver report
pub const RTCP_RR: u8 = 201;
/// Source description
pub const RTCP_SDES: u8 = 202;
/// Goodbye
pub const RTCP_BYE: u8 = 203;
/// Application defined
pub const RTCP_APP: u8 = 204;
/// Transport layer feedback
pub const RTCP_RTPFB: u8 = 205;
/// Payload specific feedback
pub const RTCP_PSFB: u8 = 206;
/// Extended report
pub const RTCP_XR: u8 = 207;

/// Whether a datagram multiplexed with RTP is RTCP (RFC 5761 section 4)
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] >> 6 == RTP_VERSION && (192..=223).contains(&data[1])
}

/// Common RTCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpHeader {
    pub padding: bool,
    /// Report count, source count or feedback FMT
    pub count: u8,
    pub packet_type: u8,
    /// Length in 32-bit words minus one
    pub length: u16,
}

impl RtcpHeader {
    pub const SIZE: usize = 4;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: data.len(),
            });
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(Error::InvalidPacket(format!("Invalid RTCP version: {}", data[0] >> 6)));
        }
        Ok(Self {
            padding: data[0] & 0x20 != 0,
            count: data[0] & 0x1F,
            packet_type: data[1],
            length: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Total packet size in bytes
    pub fn packet_size(&self) -> usize {
        (self.length as usize + 1) * 4
    }

    fn write(buf: &mut BytesMut, count: u8, packet_type: u8, body_len: usize) {
        buf.put_u8(RTP_VERSION << 6 | (count & 0x1F));
        buf.put_u8(packet_type);
        buf.put_u16((body_len / 4) as u16);
    }
}

/// One packet of a compound RTCP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(RtcpSenderReport),
    ReceiverReport(RtcpReceiverReport),
    SourceDescription(RtcpSourceDescription),
    Goodbye(RtcpGoodbye),
    Nack(RtcpNack),
    TransportCc(RtcpTransportCc),
    Pli(RtcpPli),
    Fir(RtcpFir),
    Remb(RtcpRemb),
    /// Anything else, kept undecoded
    Unknown {
        packet_type: u8,
        count: u8,
        body: Vec<u8>,
    },
}

impl RtcpPacket {
    /// Parse a compound packet
    pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>> {
        let mut packets = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let header = RtcpHeader::parse(rest)?;
            let size = header.packet_size();
            if size > rest.len() {
                return Err(Error::InvalidPacket(format!(
                    "RTCP length {} exceeds remaining {} bytes",
                    size,
                    rest.len()
                )));
            }

            let mut body_end = size;
            if header.padding {
                let pad = rest[size - 1] as usize;
                if pad == 0 || pad > size - RtcpHeader::SIZE {
                    return Err(Error::InvalidPacket(format!("Invalid RTCP padding {}", pad)));
                }
                body_end -= pad;
            }
            let body = &rest[RtcpHeader::SIZE..body_end];
            packets.push(Self::parse_body(&header, body)?);
            rest = &rest[size..];
        }

        Ok(packets)
    }

    fn parse_body(header: &RtcpHeader, body: &[u8]) -> Result<RtcpPacket> {
        let mut buf = body;
        let unknown = || RtcpPacket::Unknown {
            packet_type: header.packet_type,
            count: header.count,
            body: body.to_vec(),
        };

        let packet = match header.packet_type {
            RTCP_SR => RtcpPacket::SenderReport(parse_sender_report(&mut buf, header.count)?),
            RTCP_RR => RtcpPacket::ReceiverReport(parse_receiver_report(&mut buf, header.count)?),
            RTCP_SDES => RtcpPacket::SourceDescription(parse_sdes(&mut buf, header.count)?),
            RTCP_BYE => RtcpPacket::Goodbye(parse_bye(&mut buf, header.count)?),
            RTCP_RTPFB => match header.count {
                FMT_NACK => RtcpPacket::Nack(parse_nack(&mut buf)?),
                FMT_TCC => RtcpPacket::TransportCc(parse_transport_cc(&mut buf)?),
                _ => unknown(),
            },
            RTCP_PSFB => match header.count {
                FMT_PLI => {
                    let nack = parse_nack(&mut buf)?;
                    RtcpPacket::Pli(RtcpPli {
                        sender_ssrc: nack.sender_ssrc,
                        media_ssrc: nack.media_ssrc,
                    })
                }
                FMT_FIR => RtcpPacket::Fir(parse_fir(&mut buf)?),
                FMT_AFB => match parse_remb(&mut buf)? {
                    Some(remb) => RtcpPacket::Remb(remb),
                    None => unknown(),
                },
                _ => unknown(),
            },
            _ => unknown(),
        };
        Ok(packet)
    }

    /// RTCP packet type of this packet
    pub fn packet_type(&self) -> u8 {
        match self {
            RtcpPacket::SenderReport(_) => RTCP_SR,
            RtcpPacket::ReceiverReport(_) => RTCP_RR,
            RtcpPacket::SourceDescription(_) => RTCP_SDES,
            RtcpPacket::Goodbye(_) => RTCP_BYE,
            RtcpPacket::Nack(_) | RtcpPacket::TransportCc(_) => RTCP_RTPFB,
            RtcpPacket::Pli(_) | RtcpPacket::Fir(_) | RtcpPacket::Remb(_) => RTCP_PSFB,
            RtcpPacket::Unknown { packet_type, .. } => *packet_type,
        }
    }

    /// Whether this is an RTPFB or PSFB feedback message
    pub fn is_feedback(&self) -> bool {
        matches!(self.packet_type(), RTCP_RTPFB | RTCP_PSFB)
    }

    /// Serialize this packet with its header
    pub fn serialize_into(&self, buf: &mut BytesMut) -> Result<()> {
        let (count, body) = match self {
            RtcpPacket::SenderReport(sr) => (sr.report_blocks.len(), sr.serialize()),
            RtcpPacket::ReceiverReport(rr) => (rr.report_blocks.len(), rr.serialize()),
            RtcpPacket::SourceDescription(sdes) => (sdes.chunks.len(), sdes.serialize()),
            RtcpPacket::Goodbye(bye) => (bye.sources.len(), bye.serialize()),
            RtcpPacket::Nack(nack) => (FMT_NACK as usize, nack.serialize()),
            RtcpPacket::TransportCc(tcc) => (FMT_TCC as usize, tcc.serialize()),
            RtcpPacket::Pli(pli) => (FMT_PLI as usize, pli.serialize()),
            RtcpPacket::Fir(fir) => (FMT_FIR as usize, fir.serialize()),
            RtcpPacket::Remb(remb) => (FMT_AFB as usize, remb.serialize()),
            RtcpPacket::Unknown { count, body, .. } => (*count as usize, BytesMut::from(&body[..])),
        };

        if count > 31 {
            return Err(Error::InvalidPacket(format!("RTCP count {} exceeds 31", count)));
        }
        if body.len() % 4 != 0 {
            return Err(Error::InvalidPacket("RTCP body is not 32-bit aligned".to_string()));
        }

        buf.reserve(RtcpHeader::SIZE + body.len());
        RtcpHeader::write(buf, count as u8, self.packet_type(), body.len());
        buf.put_slice(&body);
        Ok(())
    }

    pub fn serialize(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.serialize_into(&mut buf)?;
        Ok(buf)
    }
}

/// Serialize a compound packet
pub fn serialize_compound(packets: &[RtcpPacket]) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    for packet in packets {
        packet.serialize_into(&mut buf)?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_compound() -> Vec<RtcpPacket> {
        let mut rr = RtcpReceiverReport::new(0x1111_1111);
        let mut block = RtcpReportBlock::new(0x2222_2222);
        block.fraction_lost = 25;
        block.last_sr = 0x0001_8000;
        rr.report_blocks.push(block);

        vec![
            RtcpPacket::ReceiverReport(rr),
            RtcpPacket::SourceDescription(RtcpSourceDescription::with_cname(0x1111_1111, "bob")),
            RtcpPacket::Nack(RtcpNack::new(0x1111_1111, 0x2222_2222, vec![10, 12])),
            RtcpPacket::Remb(RtcpRemb {
                sender_ssrc: 0x1111_1111,
                bitrate: 256_000,
                ssrcs: vec![0x2222_2222],
            }),
            RtcpPacket::Goodbye(RtcpGoodbye::new_for_source(0x1111_1111)),
        ]
    }

    #[test]
    fn test_compound_roundtrip_types() {
        let packets = sample_compound();
        let data = serialize_compound(&packets).unwrap();
        assert!(is_rtcp(&data));

        let parsed = RtcpPacket::parse_compound(&data).unwrap();
        assert_eq!(parsed, packets);
        assert!(parsed[2].is_feedback());
        assert!(!parsed[0].is_feedback());
    }

    #[test]
    fn test_truncated_compound_is_rejected() {
        let data = serialize_compound(&sample_compound()).unwrap();
        assert!(RtcpPacket::parse_compound(&data[..data.len() - 4]).is_err());
        assert!(RtcpPacket::parse_compound(&[0x40, 201, 0, 1]).is_err());
    }

    #[test]
    fn test_unknown_types_are_kept() {
        let app = RtcpPacket::Unknown {
            packet_type: RTCP_APP,
            count: 0,
            body: vec![0, 0, 0, 1, b'T', b'E', b'S', b'T'],
        };
        let data = app.serialize().unwrap();
        assert_eq!(RtcpPacket::parse_compound(&data).unwrap(), vec![app]);
    }

    #[test]
    fn test_rtp_is_not_rtcp() {
        // version 2, payload type 0 and 96
        assert!(!is_rtcp(&[0x80, 0x00, 0, 1]));
        assert!(!is_rtcp(&[0x80, 0x60, 0, 1]));
        assert!(is_rtcp(&[0x81, 200, 0, 6]));
    }
}
