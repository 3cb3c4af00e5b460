use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// SDES item type for the canonical name
pub const SDES_CNAME: u8 = 1;

/// One SDES item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: u8,
    pub text: String,
}

/// Items describing one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: RtpSsrc,
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    fn size(&self) -> usize {
        let items: usize = self.items.iter().map(|i| 2 + i.text.len().min(255)).sum();
        // terminating null item, padded to 32 bits
        let unpadded = 4 + items + 1;
        (unpadded + 3) & !3
    }
}

/// RTCP Source Description (RFC 3550 6.5)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpSourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl RtcpSourceDescription {
    /// SDES with a single CNAME chunk
    pub fn with_cname(ssrc: RtpSsrc, cname: &str) -> Self {
        Self {
            chunks: vec![SdesChunk {
                ssrc,
                items: vec![SdesItem {
                    item_type: SDES_CNAME,
                    text: cname.to_string(),
                }],
            }],
        }
    }

    /// CNAME announced for `ssrc`
    pub fn cname(&self, ssrc: RtpSsrc) -> Option<&str> {
        self.chunks
            .iter()
            .find(|c| c.ssrc == ssrc)
            .and_then(|c| c.items.iter().find(|i| i.item_type == SDES_CNAME))
            .map(|i| i.text.as_str())
    }

    pub fn size(&self) -> usize {
        self.chunks.iter().map(SdesChunk::size).sum()
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        for chunk in &self.chunks {
            let start = buf.len();
            buf.put_u32(chunk.ssrc);
            for item in &chunk.items {
                let len = item.text.len().min(255);
                buf.put_u8(item.item_type);
                buf.put_u8(len as u8);
                buf.put_slice(&item.text.as_bytes()[..len]);
            }
            buf.put_u8(0);
            while (buf.len() - start) % 4 != 0 {
                buf.put_u8(0);
            }
        }
        buf
    }
}

/// Parse an SDES body containing `chunk_count` chunks
pub fn parse_sdes(buf: &mut impl Buf, chunk_count: u8) -> Result<RtcpSourceDescription> {
    let mut chunks = Vec::with_capacity(chunk_count as usize);

    for _ in 0..chunk_count {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall {
                required: 4,
                available: buf.remaining(),
            });
        }
        let ssrc = buf.get_u32();
        let mut consumed = 4;
        let mut items = Vec::new();

        loop {
            if !buf.has_remaining() {
                return Err(Error::InvalidPacket("SDES chunk not terminated".to_string()));
            }
            let item_type = buf.get_u8();
            consumed += 1;
            if item_type == 0 {
                break;
            }
            if !buf.has_remaining() {
                return Err(Error::InvalidPacket("SDES item truncated".to_string()));
            }
            let len = buf.get_u8() as usize;
            consumed += 1;
            if buf.remaining() < len {
                return Err(Error::BufferTooSmall {
                    required: len,
                    available: buf.remaining(),
                });
            }
            let mut text = vec![0u8; len];
            buf.copy_to_slice(&mut text);
            consumed += len;
            items.push(SdesItem {
                item_type,
                text: String::from_utf8_lossy(&text).into_owned(),
            });
        }

        // skip padding up to the next 32-bit boundary
        let padding = (4 - consumed % 4) % 4;
        buf.advance(padding.min(buf.remaining()));

        chunks.push(SdesChunk { ssrc, items });
    }

    Ok(RtcpSourceDescription { chunks })
}
