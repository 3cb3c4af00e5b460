use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::{Result, RtpSsrc};

/// RTCP Goodbye (RFC 3550 6.6)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtcpGoodbye {
    /// Sources leaving the session
    pub sources: Vec<RtpSsrc>,

    /// Optional reason for leaving
    pub reason: Option<String>,
}

impl RtcpGoodbye {
    pub fn new_for_source(ssrc: RtpSsrc) -> Self {
        Self {
            sources: vec![ssrc],
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn size(&self) -> usize {
        let reason = match &self.reason {
            Some(reason) => {
                let len = 1 + reason.len().min(255);
                (len + 3) & !3
            }
            None => 0,
        };
        self.sources.len() * 4 + reason
    }

    pub fn serialize(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        for ssrc in &self.sources {
            buf.put_u32(*ssrc);
        }
        if let Some(reason) = &self.reason {
            let len = reason.len().min(255);
            buf.put_u8(len as u8);
            buf.put_slice(&reason.as_bytes()[..len]);
            let padding = (4 - (1 + len) % 4) % 4;
            buf.put_bytes(0, padding);
        }
        buf
    }
}

/// Parse a BYE body listing `source_count` sources
pub fn parse_bye(buf: &mut impl Buf, source_count: u8) -> Result<RtcpGoodbye> {
    let required = source_count as usize * 4;
    if buf.remaining() < required {
        return Err(Error::BufferTooSmall {
            required,
            available: buf.remaining(),
        });
    }
    let sources = (0..source_count).map(|_| buf.get_u32()).collect();

    let reason = if buf.has_remaining() {
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return Err(Error::BufferTooSmall {
                required: len,
                available: buf.remaining(),
            });
        }
        let mut text = vec![0u8; len];
        buf.copy_to_slice(&mut text);
        let padding = (4 - (1 + len) % 4) % 4;
        buf.advance(padding.min(buf.remaining()));
        Some(String::from_utf8_lossy(&text).into_owned())
    } else {
        None
    };

    Ok(RtcpGoodbye { sources, reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bye_with_reason() {
        let bye = RtcpGoodbye::new_for_source(0xCAFE_BABE).with_reason("session closed");
        let body = bye.serialize();
        assert_eq!(body.len() % 4, 0);
        assert_eq!(body.len(), bye.size());

        let parsed = parse_bye(&mut body.freeze(), 1).unwrap();
        assert_eq!(parsed, bye);
    }

    #[test]
    fn test_bye_without_reason() {
        let bye = RtcpGoodbye::new_for_source(1);
        let parsed = parse_bye(&mut bye.serialize().freeze(), 1).unwrap();
        assert_eq!(parsed.reason, None);
    }
}
