//! RTP header extension table
//!
//! Maps negotiated extension ids to their URI and direction. The session
//! rebuilds the table on every negotiation and forwards each change to the
//! transform chain so the engines pick up the new ids.

use std::collections::BTreeMap;
use std::fmt;

use super::direction::MediaDirection;
use crate::error::Error;
use crate::Result;

pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const TRANSPORT_CC_URI: &str = "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const FRAME_MARKING_URI: &str = "http://tools.ietf.org/html/draft-ietf-avtext-framemarking-07";
pub const SSRC_AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
pub const CSRC_AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:csrc-audio-level";
pub const ORIGINAL_HEADER_BLOCK_URI: &str = "http://jitsi.org/experiment/original-header-block";

/// Extensions the transform engines know how to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RtpExtensionKind {
    AbsSendTime,
    TransportCc,
    FrameMarking,
    SsrcAudioLevel,
    CsrcAudioLevel,
    OriginalHeaderBlock,
    Other,
}

impl RtpExtensionKind {
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            ABS_SEND_TIME_URI => RtpExtensionKind::AbsSendTime,
            TRANSPORT_CC_URI => RtpExtensionKind::TransportCc,
            FRAME_MARKING_URI => RtpExtensionKind::FrameMarking,
            SSRC_AUDIO_LEVEL_URI => RtpExtensionKind::SsrcAudioLevel,
            CSRC_AUDIO_LEVEL_URI => RtpExtensionKind::CsrcAudioLevel,
            ORIGINAL_HEADER_BLOCK_URI => RtpExtensionKind::OriginalHeaderBlock,
            _ => RtpExtensionKind::Other,
        }
    }

    pub fn uri(self) -> Option<&'static str> {
        match self {
            RtpExtensionKind::AbsSendTime => Some(ABS_SEND_TIME_URI),
            RtpExtensionKind::TransportCc => Some(TRANSPORT_CC_URI),
            RtpExtensionKind::FrameMarking => Some(FRAME_MARKING_URI),
            RtpExtensionKind::SsrcAudioLevel => Some(SSRC_AUDIO_LEVEL_URI),
            RtpExtensionKind::CsrcAudioLevel => Some(CSRC_AUDIO_LEVEL_URI),
            RtpExtensionKind::OriginalHeaderBlock => Some(ORIGINAL_HEADER_BLOCK_URI),
            RtpExtensionKind::Other => None,
        }
    }
}

/// One negotiated header extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub uri: String,
    pub direction: MediaDirection,
}

impl RtpExtension {
    pub fn new(uri: impl Into<String>, direction: MediaDirection) -> Self {
        Self {
            uri: uri.into(),
            direction,
        }
    }

    pub fn kind(&self) -> RtpExtensionKind {
        RtpExtensionKind::from_uri(&self.uri)
    }
}

impl fmt::Display for RtpExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.uri, self.direction)
    }
}

/// Extension id to extension mapping
#[derive(Debug, Clone, Default)]
pub struct RtpExtensionTable {
    entries: BTreeMap<u8, RtpExtension>,
}

impl RtpExtensionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `id` to `extension`, returning the extension it replaces
    ///
    /// Ids are limited to the one-byte header range 1-14. An inactive
    /// extension removes the mapping instead.
    pub fn insert(&mut self, id: u8, extension: RtpExtension) -> Result<Option<RtpExtension>> {
        if !(1..=14).contains(&id) {
            return Err(Error::ConfigError(format!(
                "Invalid extension ID: {} (must be 1-14)",
                id
            )));
        }
        if extension.direction == MediaDirection::Inactive {
            return Ok(self.entries.remove(&id));
        }
        Ok(self.entries.insert(id, extension))
    }

    pub fn remove(&mut self, id: u8) -> Option<RtpExtension> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: u8) -> Option<&RtpExtension> {
        self.entries.get(&id)
    }

    /// Id currently mapped to an extension of `kind`
    pub fn id_of(&self, kind: RtpExtensionKind) -> Option<u8> {
        self.entries
            .iter()
            .find(|(_, ext)| ext.kind() == kind)
            .map(|(id, _)| *id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &RtpExtension)> {
        self.entries.iter().map(|(id, ext)| (*id, ext))
    }
}
