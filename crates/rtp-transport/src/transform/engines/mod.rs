//! Transform engines
//!
//! Each engine handles one concern of the media path. Engines are optional:
//! a session only puts into its chain the ones it needs.

mod audio_level;
mod caching;
mod csrc;
mod external;
mod fec;
mod header_ext;
mod payload_type;
mod red;
mod rtcp_termination;
mod rtx;
mod srtp;

pub use audio_level::{SsrcAudioLevelEngine, SILENCE_LEVEL};
pub use caching::{CachingEngine, DEFAULT_CACHE_SIZE};
pub use csrc::CsrcEngine;
pub use external::ExternalEngine;
pub use fec::FecEngine;
pub use header_ext::{AbsSendTimeEngine, ArrivalCallback, TransportCcEngine};
pub use payload_type::PayloadTypeOverrideEngine;
pub use red::RedEngine;
pub use rtcp_termination::RtcpTerminationEngine;
pub use rtx::RtxEngine;
pub use srtp::SrtpEngine;

use std::sync::atomic::{AtomicU8, Ordering};

/// Optional header extension id or payload type, `0xFF` meaning unassigned
#[derive(Debug)]
pub(crate) struct OptionalByte(AtomicU8);

impl OptionalByte {
    const UNSET: u8 = 0xFF;

    pub(crate) fn new(value: Option<u8>) -> Self {
        Self(AtomicU8::new(value.unwrap_or(Self::UNSET)))
    }

    pub(crate) fn get(&self) -> Option<u8> {
        match self.0.load(Ordering::Relaxed) {
            Self::UNSET => None,
            value => Some(value),
        }
    }

    pub(crate) fn set(&self, value: Option<u8>) {
        self.0.store(value.unwrap_or(Self::UNSET), Ordering::Relaxed);
    }
}

impl Default for OptionalByte {
    fn default() -> Self {
        Self::new(None)
    }
}
