//! Transport configuration
//!
//! [`TransportConfig`] carries every tunable of the connector, the input and
//! output streams, the DTMF engine and the statistics engine. Sessions do not
//! read process-wide state: they receive a [`MediaRuntime`] which bundles the
//! configuration with the tokio runtime used to spawn background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::Result;

/// Default size of the datagram read buffer
pub const DEFAULT_RECEIVE_BUFFER_LENGTH: usize = 4096;

/// Default SO_RCVBUF request for data and control sockets
pub const DEFAULT_SOCKET_RECEIVE_BUFFER_SIZE: usize = 65535;

/// Default capacity of the output packet queue
pub const DEFAULT_PACKET_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of the packet pool
pub const DEFAULT_PACKET_POOL_CAPACITY: usize = 100;

/// Configuration of the RTP transport core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Size in bytes of the buffer a datagram is read into
    pub receive_buffer_length: usize,
    /// SO_RCVBUF requested on created sockets
    pub socket_receive_buffer_size: usize,
    /// Capacity of the queued output stream
    pub packet_queue_capacity: usize,
    /// Number of idle packets kept by each pool
    pub packet_pool_capacity: usize,
    /// Averaging window for the output bitrate counter
    pub average_bitrate_window_ms: u64,
    /// Queue outgoing packets and send them from a background task
    pub use_send_thread: bool,
    /// Pacing: at most this many packets per `pacing_interval_ms`
    pub max_packets_per_interval: Option<usize>,
    /// Pacing window
    pub pacing_interval_ms: u64,
    /// How long the send task waits on an empty queue before re-checking state
    pub send_queue_poll_timeout_ms: u64,
    /// Minimum duration of an outgoing DTMF tone
    pub dtmf_min_tone_duration_ms: u64,
    /// Maximum duration of an outgoing DTMF tone, `None` for unbounded
    pub dtmf_max_tone_duration_ms: Option<u64>,
    /// Volume carried in outgoing DTMF events (0 = -0 dBm0, 63 = -63 dBm0)
    pub dtmf_volume: u8,
    /// Packet interval used to synthesise EWMA steps while no packets flow
    pub nominal_packet_interval_ms: u64,
    /// EWMA shift per step
    pub ewma_step_coefficient: f64,
    /// RTT values at or above this bound are rejected
    pub max_valid_rtt_ms: u64,
    /// Interval between RTCP reports
    pub rtcp_interval_ms: u64,
    /// Silence after which a remote source is forgotten
    pub remote_source_timeout_ms: u64,
    /// Resolve LSR through the emission table instead of trusting it
    pub translator_mode: bool,
    /// Canonical name sent in RTCP SDES
    pub cname: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            receive_buffer_length: DEFAULT_RECEIVE_BUFFER_LENGTH,
            socket_receive_buffer_size: DEFAULT_SOCKET_RECEIVE_BUFFER_SIZE,
            packet_queue_capacity: DEFAULT_PACKET_QUEUE_CAPACITY,
            packet_pool_capacity: DEFAULT_PACKET_POOL_CAPACITY,
            average_bitrate_window_ms: 5000,
            use_send_thread: true,
            max_packets_per_interval: None,
            pacing_interval_ms: 1000,
            send_queue_poll_timeout_ms: 500,
            dtmf_min_tone_duration_ms: 70,
            dtmf_max_tone_duration_ms: None,
            dtmf_volume: 0,
            nominal_packet_interval_ms: 20,
            ewma_step_coefficient: 0.01,
            max_valid_rtt_ms: 3000,
            rtcp_interval_ms: 5000,
            remote_source_timeout_ms: 30_000,
            translator_mode: false,
            cname: format!("rvoip-{:08x}", rand::random::<u32>()),
        }
    }
}

impl TransportConfig {
    /// Check the configuration for values the streams cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.receive_buffer_length == 0 {
            return Err(Error::ConfigError("receive_buffer_length must be greater than 0".to_string()));
        }
        if self.packet_queue_capacity == 0 {
            return Err(Error::ConfigError("packet_queue_capacity must be greater than 0".to_string()));
        }
        if self.packet_pool_capacity == 0 {
            return Err(Error::ConfigError("packet_pool_capacity must be greater than 0".to_string()));
        }
        if self.average_bitrate_window_ms == 0 {
            return Err(Error::ConfigError("average_bitrate_window_ms must be greater than 0".to_string()));
        }
        if self.max_packets_per_interval.is_some() && self.pacing_interval_ms == 0 {
            return Err(Error::ConfigError("pacing_interval_ms must be at least 1".to_string()));
        }
        if self.nominal_packet_interval_ms == 0 {
            return Err(Error::ConfigError("nominal_packet_interval_ms must be greater than 0".to_string()));
        }
        if !(self.ewma_step_coefficient > 0.0 && self.ewma_step_coefficient <= 1.0) {
            return Err(Error::ConfigError(format!(
                "ewma_step_coefficient must be in (0, 1], got {}",
                self.ewma_step_coefficient
            )));
        }
        if self.dtmf_volume > 63 {
            return Err(Error::ConfigError(format!("dtmf_volume must be 0-63, got {}", self.dtmf_volume)));
        }
        if self.rtcp_interval_ms == 0 {
            return Err(Error::ConfigError("rtcp_interval_ms must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Timeout used by the send task when polling its queue
    pub fn send_queue_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.send_queue_poll_timeout_ms)
    }

    /// Interval between RTCP reports
    pub fn rtcp_interval(&self) -> Duration {
        Duration::from_millis(self.rtcp_interval_ms)
    }

    /// Silence after which a remote source is expired
    pub fn remote_source_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_source_timeout_ms)
    }
}

/// Builder for [`TransportConfig`]
#[derive(Debug, Clone)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a builder populated with the defaults
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
        }
    }

    /// Defaults tuned for a relay that forwards other parties' RTCP
    pub fn translator() -> Self {
        let mut builder = Self::new();
        builder.config.translator_mode = true;
        builder
    }

    pub fn receive_buffer_length(mut self, len: usize) -> Self {
        self.config.receive_buffer_length = len;
        self
    }

    pub fn socket_receive_buffer_size(mut self, size: usize) -> Self {
        self.config.socket_receive_buffer_size = size;
        self
    }

    pub fn packet_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.packet_queue_capacity = capacity;
        self
    }

    pub fn packet_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.packet_pool_capacity = capacity;
        self
    }

    pub fn average_bitrate_window_ms(mut self, window: u64) -> Self {
        self.config.average_bitrate_window_ms = window;
        self
    }

    /// Enable or disable the queued send task
    pub fn use_send_thread(mut self, enable: bool) -> Self {
        self.config.use_send_thread = enable;
        self
    }

    /// Limit sending to `max_packets` per `per_millis` milliseconds
    pub fn pacing(mut self, max_packets: usize, per_millis: u64) -> Self {
        self.config.max_packets_per_interval = Some(max_packets);
        self.config.pacing_interval_ms = per_millis;
        self
    }

    pub fn send_queue_poll_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.send_queue_poll_timeout_ms = timeout;
        self
    }

    /// Set the minimum and optional maximum DTMF tone duration
    pub fn dtmf_tone_duration(mut self, min_ms: u64, max_ms: Option<u64>) -> Self {
        self.config.dtmf_min_tone_duration_ms = min_ms;
        self.config.dtmf_max_tone_duration_ms = max_ms;
        self
    }

    pub fn dtmf_volume(mut self, volume: u8) -> Self {
        self.config.dtmf_volume = volume;
        self
    }

    pub fn nominal_packet_interval_ms(mut self, interval: u64) -> Self {
        self.config.nominal_packet_interval_ms = interval;
        self
    }

    pub fn ewma_step_coefficient(mut self, coefficient: f64) -> Self {
        self.config.ewma_step_coefficient = coefficient;
        self
    }

    pub fn max_valid_rtt_ms(mut self, rtt: u64) -> Self {
        self.config.max_valid_rtt_ms = rtt;
        self
    }

    pub fn rtcp_interval_ms(mut self, interval: u64) -> Self {
        self.config.rtcp_interval_ms = interval;
        self
    }

    pub fn remote_source_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.remote_source_timeout_ms = timeout;
        self
    }

    pub fn translator_mode(mut self, enable: bool) -> Self {
        self.config.translator_mode = enable;
        self
    }

    /// Set the RTCP canonical name
    pub fn cname(mut self, cname: impl Into<String>) -> Self {
        self.config.cname = cname.into();
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<TransportConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Context handed to connectors and sessions
///
/// Owns the shared configuration and the handle of the tokio runtime on which
/// receive, send, DTMF dispatch and RTCP tasks are spawned.
#[derive(Debug, Clone)]
pub struct MediaRuntime {
    config: Arc<TransportConfig>,
    handle: Handle,
}

impl MediaRuntime {
    /// Create a runtime context from a configuration and a runtime handle
    pub fn new(config: TransportConfig, handle: Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            handle,
        })
    }

    /// Create a runtime context bound to the runtime of the caller
    pub fn current(config: TransportConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::ConfigError(format!("No tokio runtime available: {}", e)))?;
        Self::new(config, handle)
    }

    /// Shared configuration
    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    /// Runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a background task on the media runtime
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.receive_buffer_length, 4096);
        assert_eq!(config.socket_receive_buffer_size, 65535);
        assert_eq!(config.packet_queue_capacity, 1024);
        assert_eq!(config.packet_pool_capacity, 100);
        assert_eq!(config.average_bitrate_window_ms, 5000);
        assert!(config.use_send_thread);
        assert_eq!(config.max_packets_per_interval, None);
        assert_eq!(config.dtmf_min_tone_duration_ms, 70);
        assert_eq!(config.dtmf_max_tone_duration_ms, None);
        assert_eq!(config.max_valid_rtt_ms, 3000);
        assert_eq!(config.nominal_packet_interval_ms, 20);
        assert!((config.ewma_step_coefficient - 0.01).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        let result = TransportConfigBuilder::new().packet_queue_capacity(0).build();
        assert!(matches!(result, Err(Error::ConfigError(_))));

        let result = TransportConfigBuilder::new().pacing(10, 0).build();
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = TransportConfigBuilder::translator()
            .pacing(5, 100)
            .dtmf_tone_duration(100, Some(2000))
            .cname("alice@example.com")
            .build()
            .unwrap();

        assert!(config.translator_mode);
        assert_eq!(config.max_packets_per_interval, Some(5));
        assert_eq!(config.pacing_interval_ms, 100);
        assert_eq!(config.dtmf_max_tone_duration_ms, Some(2000));
        assert_eq!(config.cname, "alice@example.com");
    }

    #[test]
    fn test_serde_partial_config() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"packet_queue_capacity": 16, "use_send_thread": false}"#).unwrap();
        assert_eq!(config.packet_queue_capacity, 16);
        assert!(!config.use_send_thread);
        assert_eq!(config.receive_buffer_length, 4096);
    }

    #[tokio::test]
    async fn test_media_runtime_current() {
        let runtime = MediaRuntime::current(TransportConfig::default()).unwrap();
        let value = runtime.spawn(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }
}
