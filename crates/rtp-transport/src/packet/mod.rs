//! RTP packet buffers
//!
//! [`RawPacket`] is an owned byte buffer with an offset/length window. It is
//! handed out and taken back by value through a [`PacketPool`], so a packet
//! has exactly one owner at any time. Header accessors operate directly on
//! the bytes without parsing the whole packet.

pub mod dtmf;
pub mod extension;
pub mod pool;
pub mod rtcp;

pub use dtmf::{DtmfEventPayload, DtmfTone};
pub use extension::HeaderExtension;
pub use pool::PacketPool;

use crate::error::Error;
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// Size of the fixed RTP header
pub const RTP_FIXED_HEADER_SIZE: usize = 12;

/// Minimum size of an RTCP packet (header + sender SSRC)
pub const RTCP_MIN_SIZE: usize = 8;

/// Packet was produced locally and not read from the network
pub const FLAG_INJECTED: u32 = 0x01;

/// Packet is a retransmission
pub const FLAG_RETRANSMISSION: u32 = 0x02;

/// Packet was recovered or decapsulated by a receive transform
pub const FLAG_RECOVERED: u32 = 0x04;

/// An owned, reusable RTP/RTCP packet buffer
#[derive(Debug, Clone, Default)]
pub struct RawPacket {
    buffer: Vec<u8>,
    offset: usize,
    length: usize,
    flags: u32,
}

impl RawPacket {
    /// Create an empty packet with the given buffer capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            offset: 0,
            length: 0,
            flags: 0,
        }
    }

    /// Create a packet holding a copy of `data`
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            buffer: data.to_vec(),
            offset: 0,
            length: data.len(),
            flags: 0,
        }
    }

    /// Whole backing buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Whole backing buffer, mutable. Used by the receive loop to read into.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = flags;
    }

    pub fn add_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    /// Bytes of the packet
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.length]
    }

    /// Bytes of the packet, mutable
    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = self.offset + self.length;
        &mut self.buffer[self.offset..end]
    }

    /// Set the packet window inside the buffer
    pub fn set_window(&mut self, offset: usize, length: usize) -> Result<()> {
        if offset + length > self.buffer.len() {
            return Err(Error::BufferTooSmall {
                required: offset + length,
                available: self.buffer.len(),
            });
        }
        self.offset = offset;
        self.length = length;
        Ok(())
    }

    /// Set the packet length, keeping the offset
    pub fn set_len(&mut self, length: usize) -> Result<()> {
        self.set_window(self.offset, length)
    }

    /// Replace the packet contents with a copy of `data`
    pub fn copy_from(&mut self, data: &[u8]) {
        if self.buffer.len() < data.len() {
            self.buffer.resize(data.len(), 0);
        }
        self.buffer[..data.len()].copy_from_slice(data);
        self.offset = 0;
        self.length = data.len();
    }

    /// Forget the contents and flags so the buffer can be reused
    pub fn reset(&mut self) {
        self.offset = 0;
        self.length = 0;
        self.flags = 0;
    }

    /// Move the packet to offset 0 and make room for `extra` more bytes
    fn compact_and_grow(&mut self, extra: usize) {
        if self.offset > 0 {
            self.buffer.copy_within(self.offset..self.offset + self.length, 0);
            self.offset = 0;
        }
        let needed = self.length + extra;
        if self.buffer.len() < needed {
            self.buffer.resize(needed, 0);
        }
    }

    /// Insert `bytes` at `pos` (relative to the packet start)
    pub(crate) fn insert_bytes(&mut self, pos: usize, bytes: &[u8]) {
        self.compact_and_grow(bytes.len());
        let len = self.length;
        self.buffer.copy_within(pos..len, pos + bytes.len());
        self.buffer[pos..pos + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();
    }

    /// Remove `count` bytes at `pos` (relative to the packet start)
    pub(crate) fn remove_bytes(&mut self, pos: usize, count: usize) {
        let start = self.offset + pos;
        let end = self.offset + self.length;
        self.buffer.copy_within(start + count..end, start);
        self.length -= count;
    }

    // RTP header access

    /// Whether the packet is too short or malformed to be RTP
    pub fn is_invalid_rtp(&self) -> bool {
        self.length < RTP_FIXED_HEADER_SIZE
            || self.version() != RTP_VERSION
            || self.header_length() > self.length
    }

    /// Whether the packet is too short to be RTCP
    pub fn is_invalid_rtcp(&self) -> bool {
        self.length < RTCP_MIN_SIZE || self.version() != RTP_VERSION
    }

    pub fn version(&self) -> u8 {
        if self.length == 0 {
            return 0;
        }
        self.data()[0] >> 6
    }

    pub fn has_padding(&self) -> bool {
        self.length > 0 && self.data()[0] & 0x20 != 0
    }

    pub fn has_extension(&self) -> bool {
        self.length > 0 && self.data()[0] & 0x10 != 0
    }

    pub fn csrc_count(&self) -> usize {
        if self.length == 0 {
            return 0;
        }
        (self.data()[0] & 0x0F) as usize
    }

    pub fn marker(&self) -> bool {
        self.length > 1 && self.data()[1] & 0x80 != 0
    }

    pub fn set_marker(&mut self, marker: bool) {
        let b = &mut self.data_mut()[1];
        if marker {
            *b |= 0x80;
        } else {
            *b &= 0x7F;
        }
    }

    pub fn payload_type(&self) -> u8 {
        self.data()[1] & 0x7F
    }

    pub fn set_payload_type(&mut self, pt: u8) {
        let b = &mut self.data_mut()[1];
        *b = (*b & 0x80) | (pt & 0x7F);
    }

    pub fn sequence_number(&self) -> RtpSequenceNumber {
        let d = self.data();
        u16::from_be_bytes([d[2], d[3]])
    }

    pub fn set_sequence_number(&mut self, seq: RtpSequenceNumber) {
        self.data_mut()[2..4].copy_from_slice(&seq.to_be_bytes());
    }

    pub fn timestamp(&self) -> RtpTimestamp {
        let d = self.data();
        u32::from_be_bytes([d[4], d[5], d[6], d[7]])
    }

    pub fn set_timestamp(&mut self, ts: RtpTimestamp) {
        self.data_mut()[4..8].copy_from_slice(&ts.to_be_bytes());
    }

    /// SSRC of an RTP packet (also the sender SSRC of an RTCP packet)
    pub fn ssrc(&self) -> RtpSsrc {
        let d = self.data();
        u32::from_be_bytes([d[8], d[9], d[10], d[11]])
    }

    pub fn set_ssrc(&mut self, ssrc: RtpSsrc) {
        self.data_mut()[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    /// Sender SSRC of an RTCP packet
    pub fn rtcp_sender_ssrc(&self) -> RtpSsrc {
        let d = self.data();
        u32::from_be_bytes([d[4], d[5], d[6], d[7]])
    }

    /// CSRC identifiers
    pub fn csrcs(&self) -> Vec<RtpSsrc> {
        let d = self.data();
        (0..self.csrc_count())
            .map(|i| {
                let at = RTP_FIXED_HEADER_SIZE + i * 4;
                u32::from_be_bytes([d[at], d[at + 1], d[at + 2], d[at + 3]])
            })
            .collect()
    }

    /// Replace the CSRC list, shifting the rest of the packet
    pub fn set_csrcs(&mut self, csrcs: &[RtpSsrc]) -> Result<()> {
        if csrcs.len() > 15 {
            return Err(Error::InvalidPacket(format!("Too many CSRCs: {}", csrcs.len())));
        }
        let old = self.csrc_count();
        if old > 0 {
            self.remove_bytes(RTP_FIXED_HEADER_SIZE, old * 4);
        }
        if !csrcs.is_empty() {
            let bytes: Vec<u8> = csrcs.iter().flat_map(|c| c.to_be_bytes()).collect();
            self.insert_bytes(RTP_FIXED_HEADER_SIZE, &bytes);
        }
        let b = &mut self.data_mut()[0];
        *b = (*b & 0xF0) | csrcs.len() as u8;
        Ok(())
    }

    /// Length of the header extension block including its 4-byte preamble
    pub fn extension_block_length(&self) -> usize {
        if !self.has_extension() {
            return 0;
        }
        let at = RTP_FIXED_HEADER_SIZE + self.csrc_count() * 4;
        let d = self.data();
        if d.len() < at + 4 {
            return 0;
        }
        4 + u16::from_be_bytes([d[at + 2], d[at + 3]]) as usize * 4
    }

    /// Length of the full RTP header
    pub fn header_length(&self) -> usize {
        RTP_FIXED_HEADER_SIZE + self.csrc_count() * 4 + self.extension_block_length()
    }

    /// Number of padding bytes at the end of the packet
    pub fn padding_length(&self) -> usize {
        if !self.has_padding() || self.length == 0 {
            return 0;
        }
        self.data()[self.length - 1] as usize
    }

    /// Payload length, excluding padding
    pub fn payload_length(&self) -> usize {
        self.length
            .saturating_sub(self.header_length())
            .saturating_sub(self.padding_length())
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.header_length();
        &self.data()[start..start + self.payload_length()]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.header_length();
        let len = self.payload_length();
        &mut self.data_mut()[start..start + len]
    }

    /// Replace the payload, dropping any padding
    pub fn set_payload(&mut self, payload: &[u8]) {
        let header = self.header_length();
        if self.has_padding() {
            self.data_mut()[0] &= !0x20;
        }
        self.compact_and_grow(payload.len().saturating_sub(self.length - header));
        self.buffer[header..header + payload.len()].copy_from_slice(payload);
        self.length = header + payload.len();
    }
}

/// Build an RTP packet from header fields and payload
pub fn build_rtp_packet(
    payload_type: u8,
    marker: bool,
    seq: RtpSequenceNumber,
    timestamp: RtpTimestamp,
    ssrc: RtpSsrc,
    payload: &[u8],
) -> RawPacket {
    let mut data = Vec::with_capacity(RTP_FIXED_HEADER_SIZE + payload.len());
    data.push(RTP_VERSION << 6);
    data.push(if marker { 0x80 } else { 0 } | (payload_type & 0x7F));
    data.extend_from_slice(&seq.to_be_bytes());
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(&ssrc.to_be_bytes());
    data.extend_from_slice(payload);
    RawPacket::from_slice(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields() {
        let mut pkt = build_rtp_packet(0, true, 1000, 160, 0x1234_5678, &[1, 2, 3, 4]);

        assert!(!pkt.is_invalid_rtp());
        assert_eq!(pkt.version(), 2);
        assert!(pkt.marker());
        assert_eq!(pkt.payload_type(), 0);
        assert_eq!(pkt.sequence_number(), 1000);
        assert_eq!(pkt.timestamp(), 160);
        assert_eq!(pkt.ssrc(), 0x1234_5678);
        assert_eq!(pkt.payload(), &[1, 2, 3, 4]);

        pkt.set_marker(false);
        pkt.set_payload_type(101);
        pkt.set_sequence_number(65535);
        pkt.set_timestamp(u32::MAX);
        pkt.set_ssrc(42);
        assert!(!pkt.marker());
        assert_eq!(pkt.payload_type(), 101);
        assert_eq!(pkt.sequence_number(), 65535);
        assert_eq!(pkt.timestamp(), u32::MAX);
        assert_eq!(pkt.ssrc(), 42);
    }

    #[test]
    fn test_csrc_rewrite_shifts_payload() {
        let mut pkt = build_rtp_packet(8, false, 1, 2, 3, &[9, 9]);
        pkt.set_csrcs(&[10, 20]).unwrap();
        assert_eq!(pkt.csrc_count(), 2);
        assert_eq!(pkt.csrcs(), vec![10, 20]);
        assert_eq!(pkt.payload(), &[9, 9]);
        assert_eq!(pkt.len(), 12 + 8 + 2);

        pkt.set_csrcs(&[]).unwrap();
        assert_eq!(pkt.csrc_count(), 0);
        assert_eq!(pkt.payload(), &[9, 9]);
    }

    #[test]
    fn test_set_payload_grows_and_shrinks() {
        let mut pkt = build_rtp_packet(0, false, 1, 2, 3, &[0; 160]);
        pkt.set_payload(&[1, 2, 3, 4]);
        assert_eq!(pkt.payload(), &[1, 2, 3, 4]);
        assert_eq!(pkt.len(), 16);

        let big = vec![7u8; 300];
        pkt.set_payload(&big);
        assert_eq!(pkt.payload_length(), 300);
    }

    #[test]
    fn test_short_packet_is_invalid() {
        let pkt = RawPacket::from_slice(&[0x80, 0, 0]);
        assert!(pkt.is_invalid_rtp());
        assert!(pkt.is_invalid_rtcp());
    }

    #[test]
    fn test_window_bounds() {
        let mut pkt = RawPacket::with_capacity(16);
        assert!(pkt.set_window(4, 12).is_ok());
        assert!(matches!(pkt.set_window(8, 12), Err(Error::BufferTooSmall { .. })));
        pkt.reset();
        assert!(pkt.is_empty());
        assert_eq!(pkt.offset(), 0);
    }
}
