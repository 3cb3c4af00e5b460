//! Capture/render device boundary
//!
//! The transport core never touches audio or video hardware. A session is
//! handed a [`DeviceSession`] wrapping a [`MediaDevice`]: the device reports
//! what it can do, is started and stopped per direction and receives the
//! payloads of incoming packets.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::session::MediaDirection;
use crate::{Result, RtpSsrc, RtpTimestamp};

/// Media kind of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Audio => f.write_str("audio"),
            MediaType::Video => f.write_str("video"),
        }
    }
}

/// RTP media format, as negotiated for a payload type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaFormat {
    pub media_type: MediaType,
    /// Encoding name as it appears in `a=rtpmap`
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u8,
}

impl MediaFormat {
    pub fn audio(encoding: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            media_type: MediaType::Audio,
            encoding: encoding.into(),
            clock_rate,
            channels: 1,
        }
    }

    pub fn video(encoding: impl Into<String>) -> Self {
        Self {
            media_type: MediaType::Video,
            encoding: encoding.into(),
            clock_rate: 90_000,
            channels: 1,
        }
    }

    /// RFC 4733 telephone events
    pub fn telephone_event(clock_rate: u32) -> Self {
        Self::audio("telephone-event", clock_rate)
    }

    fn is(&self, name: &str) -> bool {
        self.encoding.eq_ignore_ascii_case(name)
    }

    pub fn is_telephone_event(&self) -> bool {
        self.is("telephone-event")
    }

    pub fn is_red(&self) -> bool {
        self.is("red")
    }

    pub fn is_ulpfec(&self) -> bool {
        self.is("ulpfec")
    }

    pub fn is_flexfec(&self) -> bool {
        self.is("flexfec-03") || self.is("flexfec")
    }

    pub fn is_rtx(&self) -> bool {
        self.is("rtx")
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.encoding, self.clock_rate)?;
        if self.channels > 1 {
            write!(f, "/{}", self.channels)?;
        }
        Ok(())
    }
}

/// A capture and/or render device driven by a session
pub trait MediaDevice: Send + Sync {
    fn media_type(&self) -> MediaType;

    /// Directions the device can handle
    fn supported_direction(&self) -> MediaDirection;

    /// Format the device currently produces
    fn format(&self) -> Option<MediaFormat>;

    /// Start capture and/or playback for the axes of `direction`
    fn start(&self, direction: MediaDirection) -> Result<()>;

    /// Stop capture and/or playback for the axes of `direction`
    fn stop(&self, direction: MediaDirection) -> Result<()>;

    /// A new remote source started sending
    fn add_receive_stream(&self, ssrc: RtpSsrc);

    fn remove_receive_stream(&self, ssrc: RtpSsrc);

    /// Payload of a received packet
    fn deliver(&self, ssrc: RtpSsrc, timestamp: RtpTimestamp, payload: &[u8]);

    /// Contributing sources of what the device sends, if it mixes
    fn csrcs(&self) -> Vec<RtpSsrc> {
        Vec::new()
    }

    /// The peer asked for a full picture
    fn request_keyframe(&self) {}
}

/// Audio specific device state
pub struct AudioSession {
    device: Arc<dyn MediaDevice>,
    muted: AtomicBool,
}

/// Video specific device state
pub struct VideoSession {
    device: Arc<dyn MediaDevice>,
    keyframe_requests: AtomicU64,
}

/// Device attached to a session, tagged by media kind
pub enum DeviceSession {
    Audio(AudioSession),
    Video(VideoSession),
}

impl DeviceSession {
    /// Wrap a device according to the kind it reports
    pub fn new(device: Arc<dyn MediaDevice>) -> Self {
        match device.media_type() {
            MediaType::Audio => DeviceSession::Audio(AudioSession {
                device,
                muted: AtomicBool::new(false),
            }),
            MediaType::Video => DeviceSession::Video(VideoSession {
                device,
                keyframe_requests: AtomicU64::new(0),
            }),
        }
    }

    pub fn device(&self) -> &Arc<dyn MediaDevice> {
        match self {
            DeviceSession::Audio(audio) => &audio.device,
            DeviceSession::Video(video) => &video.device,
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self {
            DeviceSession::Audio(_) => MediaType::Audio,
            DeviceSession::Video(_) => MediaType::Video,
        }
    }

    /// Mute outgoing audio. Video sessions ignore it.
    pub fn set_mute(&self, mute: bool) {
        match self {
            DeviceSession::Audio(audio) => audio.muted.store(mute, Ordering::Relaxed),
            DeviceSession::Video(_) => {}
        }
    }

    pub fn is_muted(&self) -> bool {
        match self {
            DeviceSession::Audio(audio) => audio.muted.load(Ordering::Relaxed),
            DeviceSession::Video(_) => false,
        }
    }

    /// Forward a PLI/FIR to the encoder. Audio sessions ignore it.
    pub fn request_keyframe(&self) {
        match self {
            DeviceSession::Audio(_) => {}
            DeviceSession::Video(video) => {
                video.keyframe_requests.fetch_add(1, Ordering::Relaxed);
                video.device.request_keyframe();
            }
        }
    }

    pub fn keyframe_requests(&self) -> u64 {
        match self {
            DeviceSession::Audio(_) => 0,
            DeviceSession::Video(video) => video.keyframe_requests.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("media_type", &self.media_type())
            .field("supported", &self.device().supported_direction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Camera;

    impl MediaDevice for Camera {
        fn media_type(&self) -> MediaType {
            MediaType::Video
        }
        fn supported_direction(&self) -> MediaDirection {
            MediaDirection::SendOnly
        }
        fn format(&self) -> Option<MediaFormat> {
            Some(MediaFormat::video("VP8"))
        }
        fn start(&self, _direction: MediaDirection) -> Result<()> {
            Ok(())
        }
        fn stop(&self, _direction: MediaDirection) -> Result<()> {
            Ok(())
        }
        fn add_receive_stream(&self, _ssrc: RtpSsrc) {}
        fn remove_receive_stream(&self, _ssrc: RtpSsrc) {}
        fn deliver(&self, _ssrc: RtpSsrc, _timestamp: RtpTimestamp, _payload: &[u8]) {}
    }

    #[test]
    fn test_kind_specific_operations() {
        let session = DeviceSession::new(Arc::new(Camera));
        assert_eq!(session.media_type(), MediaType::Video);
        session.set_mute(true);
        assert!(!session.is_muted());
        session.request_keyframe();
        assert_eq!(session.keyframe_requests(), 1);
    }

    #[test]
    fn test_format_names() {
        assert!(MediaFormat::telephone_event(8000).is_telephone_event());
        assert!(MediaFormat::audio("RED", 48000).is_red());
        assert!(MediaFormat::video("flexfec-03").is_flexfec());
        assert_eq!(MediaFormat::audio("opus", 48000).to_string(), "opus/48000");
    }
}
