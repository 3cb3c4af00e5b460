//! RTCP feedback messages: generic NACK and transport-wide CC (RFC 4585
//! transport layer), PLI, FIR (RFC 5104) and REMB (payload specific).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc};

/// Transport layer FMT: generic NACK
pub const FMT_NACK: u8 = 1;
/// Transport layer FMT: transport-wide congestion control
pub const FMT_TCC: u8 = 15;
/// Payload specific FMT: picture loss indication
pub const FMT_PLI: u8 = 1;
/// Payload specific FMT: full intra request
pub const FMT_FIR: u8 = 4;
/// Payload specific FMT: application layer (REMB)
pub const FMT_AFB: u8 = 15;

const REMB_IDENTIFIER: &[u8; 4] = b"REMB";

fn read_ssrcs(buf: &mut impl Buf) -> Result<(RtpSsrc, RtpSsrc)> {
    if buf.remaining() < 8 {
        return Err(Error::BufferTooSmall {
            required: 8,
            available: buf.remaining(),
        });
    }
    Ok((buf.get_u32(), buf.get_u32()))
}

/// Generic NACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpNack {
    pub sender_ssrc: RtpSsrc,
    pub media_ssrc: RtpSsrc,
    /// Sequence numbers reported lost
    pub lost: Vec<RtpSequenceNumber>,
}

impl RtcpNack {
    pub fn new(sender_ssrc: RtpSsrc, media_ssrc: RtpSsrc, lost: Vec<RtpSequenceNumber>) -> Self {
        Self {
            sender_ssrc,
            media_ssrc,
            lost,
        }
    }

    /// Pack the lost list into PID/BLP pairs
    fn fci_pairs(&self) -> Vec<(u16, u16)> {
        let mut pairs: Vec<(u16, u16)> = Vec::new();
        for &seq in &self.lost {
            if let Some((pid, blp)) = pairs.last_mut() {
                let delta = seq.wrapping_sub(*pid);
                if (1..=16).contains(&delta) {
                    *blp |= 1 << (delta - 1);
                    continue;
                }
            }
            pairs.push((seq, 0));
        }
        pairs
    }

    pub fn serialize(&self) -> BytesMut {
        let pairs = self.fci_pairs();
        let mut buf = BytesMut::with_capacity(8 + pairs.len() * 4);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        for (pid, blp) in pairs {
            buf.put_u16(pid);
            buf.put_u16(blp);
        }
        buf
    }
}

pub fn parse_nack(buf: &mut impl Buf) -> Result<RtcpNack> {
    let (sender_ssrc, media_ssrc) = read_ssrcs(buf)?;
    let mut lost = Vec::new();
    while buf.remaining() >= 4 {
        let pid = buf.get_u16();
        let blp = buf.get_u16();
        lost.push(pid);
        for bit in 0..16u16 {
            if blp & (1 << bit) != 0 {
                lost.push(pid.wrapping_add(bit + 1));
            }
        }
    }
    Ok(RtcpNack {
        sender_ssrc,
        media_ssrc,
        lost,
    })
}

/// Picture loss indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpPli {
    pub sender_ssrc: RtpSsrc,
    pub media_ssrc: RtpSsrc,
}

impl RtcpPli {
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf
    }
}

/// One FIR request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: RtpSsrc,
    pub seq_nr: u8,
}

/// Full intra request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpFir {
    pub sender_ssrc: RtpSsrc,
    pub entries: Vec<FirEntry>,
}

impl RtcpFir {
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(8 + self.entries.len() * 8);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(0);
        for entry in &self.entries {
            buf.put_u32(entry.ssrc);
            buf.put_u8(entry.seq_nr);
            buf.put_bytes(0, 3);
        }
        buf
    }
}

pub fn parse_fir(buf: &mut impl Buf) -> Result<RtcpFir> {
    let (sender_ssrc, _) = read_ssrcs(buf)?;
    let mut entries = Vec::new();
    while buf.remaining() >= 8 {
        let ssrc = buf.get_u32();
        let seq_nr = buf.get_u8();
        buf.advance(3);
        entries.push(FirEntry { ssrc, seq_nr });
    }
    Ok(RtcpFir { sender_ssrc, entries })
}

/// Receiver estimated maximum bitrate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpRemb {
    pub sender_ssrc: RtpSsrc,
    /// Estimated bitrate in bits per second
    pub bitrate: u64,
    /// Sources the estimate applies to
    pub ssrcs: Vec<RtpSsrc>,
}

impl RtcpRemb {
    pub fn serialize(&self) -> BytesMut {
        let mut exp = 0u32;
        let mut mantissa = self.bitrate;
        while mantissa > 0x3FFFF {
            mantissa >>= 1;
            exp += 1;
        }

        let mut buf = BytesMut::with_capacity(16 + self.ssrcs.len() * 4);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(0);
        buf.put_slice(REMB_IDENTIFIER);
        buf.put_u8(self.ssrcs.len().min(255) as u8);
        let packed = (exp << 18) | mantissa as u32;
        buf.put_u8((packed >> 16) as u8);
        buf.put_u16(packed as u16);
        for ssrc in self.ssrcs.iter().take(255) {
            buf.put_u32(*ssrc);
        }
        buf
    }
}

/// Parse an application layer feedback body, `None` if it is not REMB
pub fn parse_remb(buf: &mut impl Buf) -> Result<Option<RtcpRemb>> {
    let (sender_ssrc, _) = read_ssrcs(buf)?;
    if buf.remaining() < 8 {
        return Ok(None);
    }
    let mut identifier = [0u8; 4];
    buf.copy_to_slice(&mut identifier);
    if &identifier != REMB_IDENTIFIER {
        return Ok(None);
    }

    let num_ssrc = buf.get_u8() as usize;
    let b1 = buf.get_u8() as u32;
    let rest = buf.get_u16() as u32;
    let exp = b1 >> 2;
    let mantissa = ((b1 & 0x03) << 16) | rest;
    let bitrate = (mantissa as u64).checked_shl(exp).unwrap_or(u64::MAX);

    if buf.remaining() < num_ssrc * 4 {
        return Err(Error::BufferTooSmall {
            required: num_ssrc * 4,
            available: buf.remaining(),
        });
    }
    let ssrcs = (0..num_ssrc).map(|_| buf.get_u32()).collect();

    Ok(Some(RtcpRemb {
        sender_ssrc,
        bitrate,
        ssrcs,
    }))
}

/// Transport-wide congestion control feedback
///
/// Only the fixed part is decoded; packet status chunks and receive deltas
/// are kept as raw bytes for the congestion controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpTransportCc {
    pub sender_ssrc: RtpSsrc,
    pub media_ssrc: RtpSsrc,
    pub base_sequence: u16,
    pub packet_status_count: u16,
    /// Reference time in multiples of 64 ms (24 bits)
    pub reference_time: u32,
    pub feedback_packet_count: u8,
    pub chunks: Vec<u8>,
}

impl RtcpTransportCc {
    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(16 + self.chunks.len() + 3);
        buf.put_u32(self.sender_ssrc);
        buf.put_u32(self.media_ssrc);
        buf.put_u16(self.base_sequence);
        buf.put_u16(self.packet_status_count);
        buf.put_u32((self.reference_time << 8) | self.feedback_packet_count as u32);
        buf.put_slice(&self.chunks);
        while buf.len() % 4 != 0 {
            buf.put_u8(0);
        }
        buf
    }
}

pub fn parse_transport_cc(buf: &mut impl Buf) -> Result<RtcpTransportCc> {
    let (sender_ssrc, media_ssrc) = read_ssrcs(buf)?;
    if buf.remaining() < 8 {
        return Err(Error::BufferTooSmall {
            required: 8,
            available: buf.remaining(),
        });
    }
    let base_sequence = buf.get_u16();
    let packet_status_count = buf.get_u16();
    let word = buf.get_u32();
    let chunks = buf.copy_to_bytes(buf.remaining()).to_vec();

    Ok(RtcpTransportCc {
        sender_ssrc,
        media_ssrc,
        base_sequence,
        packet_status_count,
        reference_time: word >> 8,
        feedback_packet_count: word as u8,
        chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_packs_bitmask() {
        let nack = RtcpNack::new(1, 2, vec![100, 101, 103, 116, 117, 200]);
        let body = nack.serialize();
        // 100 with 101,103,116 in its mask; 117 and 200 start new pairs
        assert_eq!(body.len(), 8 + 3 * 4);

        let parsed = parse_nack(&mut body.freeze()).unwrap();
        assert_eq!(parsed.lost, vec![100, 101, 103, 116, 117, 200]);
    }

    #[test]
    fn test_nack_wraparound() {
        let nack = RtcpNack::new(1, 2, vec![65535, 0, 1]);
        let parsed = parse_nack(&mut nack.serialize().freeze()).unwrap();
        assert_eq!(parsed.lost, vec![65535, 0, 1]);
    }

    #[test]
    fn test_remb_bitrate() {
        let remb = RtcpRemb {
            sender_ssrc: 9,
            bitrate: 1_500_000,
            ssrcs: vec![0xAAAA_0001, 0xAAAA_0002],
        };
        let parsed = parse_remb(&mut remb.serialize().freeze()).unwrap().unwrap();
        assert_eq!(parsed.ssrcs, remb.ssrcs);
        // mantissa truncation loses at most 2^exp - 1 bps
        assert!(parsed.bitrate <= remb.bitrate && remb.bitrate - parsed.bitrate < 8);
    }

    #[test]
    fn test_non_remb_afb_is_ignored() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        body.put_u32(0);
        body.put_slice(b"XXXX");
        body.put_u32(0);
        assert_eq!(parse_remb(&mut body.freeze()).unwrap(), None);
    }

    #[test]
    fn test_fir_and_tcc() {
        let fir = RtcpFir {
            sender_ssrc: 5,
            entries: vec![FirEntry { ssrc: 6, seq_nr: 3 }],
        };
        assert_eq!(parse_fir(&mut fir.serialize().freeze()).unwrap(), fir);

        let tcc = RtcpTransportCc {
            sender_ssrc: 1,
            media_ssrc: 2,
            base_sequence: 400,
            packet_status_count: 2,
            reference_time: 0x00AB_CDEF,
            feedback_packet_count: 7,
            chunks: vec![0x20, 0x02, 0x04, 0x08],
        };
        assert_eq!(parse_transport_cc(&mut tcc.serialize().freeze()).unwrap(), tcc);
    }
}
