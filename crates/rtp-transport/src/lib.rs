//! RTP/RTCP transport core for the rvoip stack
//!
//! This crate moves RTP and RTCP packets between sockets and media devices:
//!
//! - [`transport`]: UDP and TCP connectors with queued, paced output streams
//!   and pooled input streams
//! - [`transform`]: the ordered chain of packet transform engines (RED, FEC,
//!   RTX, header extensions, SRTP, ...)
//! - [`session`]: [`MediaStream`], which ties a connector, a device and a
//!   chain together and runs the direction state machine
//! - [`stats`]: per-stream send/receive statistics with EWMA smoothing
//! - [`dtmf`]: RFC 4733 telephone-event sending and detection
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_rtp_transport::prelude::*;
//!
//! # async fn run(device: Arc<dyn MediaDevice>) -> rvoip_rtp_transport::Result<()> {
//! let sockets = StreamConnector::bind_udp("0.0.0.0:10000".parse().unwrap(), "0.0.0.0:10001".parse().unwrap()).await?;
//! let runtime = MediaRuntime::current(TransportConfig::default())?;
//! let stream = MediaStreamBuilder::new(Connector::new(sockets, runtime), device).build()?;
//! stream.add_dynamic_rtp_payload_type(0, MediaFormat::audio("PCMU", 8000))?;
//! stream.add_target(Target::with_adjacent_control("192.0.2.1:20000".parse().unwrap()))?;
//! stream.start()?;
//! stream.send_media(&[0xFF; 160], 160, true).await?;
//! stream.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod dtmf;
pub mod error;
pub mod events;
pub mod logging;
pub mod packet;
pub mod security;
pub mod session;
pub mod ssrc;
pub mod stats;
pub mod time;
pub mod transform;
pub mod transport;

/// RTP synchronization source identifier
pub type RtpSsrc = u32;

/// RTP sequence number
pub type RtpSequenceNumber = u16;

/// RTP timestamp in units of the payload clock rate
pub type RtpTimestamp = u32;

pub use error::{Error, Result};

pub use config::{MediaRuntime, TransportConfig, TransportConfigBuilder};
pub use device::{DeviceSession, MediaDevice, MediaFormat, MediaType};
pub use events::MediaStreamEvent;
pub use packet::{DtmfTone, PacketPool, RawPacket};
pub use session::{MediaDirection, MediaStream, MediaStreamBuilder, RtpExtension};
pub use stats::{MediaStreamStats, StreamStatsSnapshot};
pub use transform::{EngineKind, PacketTransformer, TransformEngine, TransformEngineChain, TransformOutcome};
pub use transport::{Connector, StreamConnector, Target};

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        Connector, DtmfTone, EngineKind, Error, MediaDevice, MediaDirection, MediaFormat, MediaRuntime,
        MediaStream, MediaStreamBuilder, MediaStreamEvent, MediaType, PacketTransformer, RawPacket, Result,
        RtpExtension, RtpSsrc, StreamConnector, Target, TransformOutcome, TransportConfig,
        TransportConfigBuilder,
    };
}
