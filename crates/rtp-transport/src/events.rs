//! Session events
//!
//! Published on a broadcast channel; subscribers that fall behind miss
//! events rather than slow the media path down.

use std::time::Duration;

use crate::packet::DtmfTone;
use crate::session::MediaDirection;
use crate::RtpSsrc;

/// Notifications emitted by a [`MediaStream`](crate::session::MediaStream)
#[derive(Debug, Clone, PartialEq)]
pub enum MediaStreamEvent {
    /// The local SSRC changed
    LocalSsrcChanged { old: Option<RtpSsrc>, new: RtpSsrc },
    /// A new remote source was seen
    RemoteSsrcAdded { ssrc: RtpSsrc },
    /// A remote source timed out or said goodbye
    RemoteSsrcRemoved { ssrc: RtpSsrc },
    /// Start of a received DTMF tone
    DtmfToneStarted { tone: DtmfTone, ssrc: RtpSsrc },
    /// End of a received DTMF tone
    DtmfToneEnded { tone: DtmfTone, ssrc: RtpSsrc },
    /// A sender or receiver report was processed
    RtcpReportReceived {
        ssrc: RtpSsrc,
        /// Round trip time, when the report allowed computing one
        rtt: Option<Duration>,
        /// Interarrival jitter reported by the peer, in milliseconds
        jitter_ms: f64,
        /// Loss reported by the peer, in percent
        loss_percent: f64,
    },
    /// Receiver estimated maximum bitrate
    RembReceived { bitrate: u64, ssrcs: Vec<RtpSsrc> },
    /// The peer asked for retransmissions
    NackReceived { media_ssrc: RtpSsrc, lost: Vec<u16> },
    /// The session direction changed
    DirectionChanged { old: MediaDirection, new: MediaDirection },
}

/// Capacity of the event channel of a session
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
