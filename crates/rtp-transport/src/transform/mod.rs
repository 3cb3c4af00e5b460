//! Packet transform engines
//!
//! A [`TransformEngine`] contributes an RTP and/or an RTCP
//! [`PacketTransformer`]. Engines are assembled into a
//! [`TransformEngineChain`]: outgoing packets traverse the engines in
//! [`EngineKind`] order, incoming packets in the reverse order.

mod chain;
pub mod engines;

pub use chain::{ChainTransformer, Protocol, TransformEngineChain};

use std::fmt;
use std::sync::Arc;

use crate::packet::RawPacket;
use crate::session::RtpExtensionKind;

/// Result of a transform step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutcome {
    /// Keep processing the packet
    Continue,
    /// Drop the packet; its owner returns it to the pool
    Discard,
}

impl TransformOutcome {
    pub fn is_discard(self) -> bool {
        self == TransformOutcome::Discard
    }
}

/// Transform of one protocol (RTP or RTCP) in both directions
pub trait PacketTransformer: Send + Sync {
    /// Applied to outgoing packets
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome;

    /// Applied to incoming packets
    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome;

    fn close(&self) {}
}

/// Position of an engine in the chain, in send order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineKind {
    Csrc,
    Dtmf,
    External,
    RtcpTermination,
    PayloadTypeOverride,
    Fec,
    Red,
    Statistics,
    Caching,
    Rtx,
    AbsSendTime,
    TransportCc,
    Srtp,
    SsrcAudioLevel,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A member of the transform chain
pub trait TransformEngine: Send + Sync {
    /// Where the engine sits in the chain
    fn kind(&self) -> EngineKind;

    /// RTP transformer, if the engine handles RTP
    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        None
    }

    /// RTCP transformer, if the engine handles RTCP
    fn rtcp_transformer(&self) -> Option<&dyn PacketTransformer> {
        None
    }

    /// A header extension was (re)mapped; `None` means unassigned
    fn set_extension_id(&self, _kind: RtpExtensionKind, _id: Option<u8>) {}

    fn close(&self) {
        if let Some(t) = self.rtp_transformer() {
            t.close();
        }
        if let Some(t) = self.rtcp_transformer() {
            t.close();
        }
    }
}

/// Hands locally produced packets back to the session's send path
///
/// `after` names the engine after which the chain resumes; `None` runs the
/// whole chain.
pub trait PacketInjector: Send + Sync {
    fn inject(&self, pkt: RawPacket, after: Option<EngineKind>);
}

/// Shared handle to an engine
pub type EngineRef = Arc<dyn TransformEngine>;
