//! SRTP boundary
//!
//! Key exchange (SDES, ZRTP, DTLS-SRTP) lives outside this crate. A session
//! only needs an [`SrtpControl`] that is told about the connector, the
//! session and every local SSRC change, and that may supply the engine that
//! encrypts on send and decrypts on receive.

use std::sync::Arc;

use crate::transform::EngineRef;
use crate::transport::StreamConnector;
use crate::RtpSsrc;

/// Security control attached to a session
pub trait SrtpControl: Send + Sync {
    /// Sockets the key exchange may use
    fn set_connector(&self, connector: Option<Arc<StreamConnector>>);

    /// Called once the session exists; `session_id` identifies it in logs
    fn register_user(&self, session_id: &str);

    /// Encryption engine, placed in the `Srtp` slot of the chain
    fn transform_engine(&self) -> Option<EngineRef>;

    /// Local SSRC changed
    fn set_local_ssrc(&self, ssrc: RtpSsrc);

    /// The session is closing
    fn cleanup(&self, session_id: &str);
}

/// Control used when media is not encrypted
#[derive(Debug, Default)]
pub struct NullSrtpControl;

impl SrtpControl for NullSrtpControl {
    fn set_connector(&self, _connector: Option<Arc<StreamConnector>>) {}

    fn register_user(&self, _session_id: &str) {}

    fn transform_engine(&self) -> Option<EngineRef> {
        None
    }

    fn set_local_ssrc(&self, _ssrc: RtpSsrc) {}

    fn cleanup(&self, _session_id: &str) {}
}
