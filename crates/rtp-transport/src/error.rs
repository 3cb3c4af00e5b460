//! Error types for the RTP transport core

use thiserror::Error;

use crate::session::MediaDirection;

/// Error type for RTP transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller supplied buffer cannot hold the pending packet
    #[error("Buffer too small: need {required} but have {available}")]
    BufferTooSmall {
        /// Bytes needed
        required: usize,
        /// Bytes available
        available: usize,
    },

    /// Requested direction is not supported by the device
    #[error("Invalid direction {requested}: device supports {supported}")]
    InvalidDirection {
        /// Direction the caller asked for
        requested: MediaDirection,
        /// Directions the device can handle
        supported: MediaDirection,
    },

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Packet injection or send failed
    #[error("Transmission failed: {0}")]
    TransmissionFailed(#[source] Box<Error>),

    /// Malformed RTP or RTCP data
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// No telephone-event payload type has been negotiated
    #[error("No telephone-event payload type negotiated")]
    DtmfNotNegotiated,

    /// The stream or session has been closed
    #[error("Stream closed")]
    StreamClosed,
}

impl Error {
    /// Wrap this error as a transmission failure
    pub fn into_transmission_failure(self) -> Self {
        match self {
            Error::TransmissionFailed(_) => self,
            other => Error::TransmissionFailed(Box::new(other)),
        }
    }
}

/// Result type for RTP transport operations
pub type Result<T> = std::result::Result<T, Error>;
