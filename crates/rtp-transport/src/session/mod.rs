//! Media session: direction state, negotiated tables and the stream
//! orchestrating connector, transform chain and device

mod direction;
mod extensions;
mod payload_types;
mod reporter;
mod stream;

pub use direction::MediaDirection;
pub use extensions::{
    RtpExtension, RtpExtensionKind, RtpExtensionTable, ABS_SEND_TIME_URI, CSRC_AUDIO_LEVEL_URI, FRAME_MARKING_URI,
    ORIGINAL_HEADER_BLOCK_URI, SSRC_AUDIO_LEVEL_URI, TRANSPORT_CC_URI,
};
pub use payload_types::DynamicPayloadTypeTable;
pub use reporter::{build_report, SenderInfo};
pub use stream::{MediaStream, MediaStreamBuilder};
