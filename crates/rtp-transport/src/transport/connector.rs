//! Lazy owner of the four streams of a socket pair

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::input::InputStream;
use super::output::OutputStream;
use super::socket::{StreamChannel, StreamConnector};
use super::target::Target;
use crate::config::MediaRuntime;
use crate::error::Error;
use crate::packet::PacketPool;
use crate::session::MediaDirection;
use crate::Result;

/// Creates the input and output streams of a [`StreamConnector`] on first use
///
/// There is at most one stream per channel and direction. Streams are closed
/// exactly once, by [`Connector::close`].
pub struct Connector {
    sockets: Arc<StreamConnector>,
    runtime: MediaRuntime,
    input_pool: Arc<PacketPool>,
    output_pool: Arc<PacketPool>,
    data_input: Mutex<Option<Arc<InputStream>>>,
    control_input: Mutex<Option<Arc<InputStream>>>,
    data_output: Mutex<Option<Arc<OutputStream>>>,
    control_output: Mutex<Option<Arc<OutputStream>>>,
    closed: AtomicBool,
}

impl Connector {
    pub fn new(sockets: StreamConnector, runtime: MediaRuntime) -> Self {
        let config = runtime.config();
        let input_pool = Arc::new(PacketPool::new(config.packet_pool_capacity, config.receive_buffer_length));
        let output_pool = Arc::new(PacketPool::new(config.packet_pool_capacity, config.receive_buffer_length));
        Self {
            sockets: Arc::new(sockets),
            runtime,
            input_pool,
            output_pool,
            data_input: Mutex::new(None),
            control_input: Mutex::new(None),
            data_output: Mutex::new(None),
            control_output: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn stream_connector(&self) -> &Arc<StreamConnector> {
        &self.sockets
    }

    pub fn runtime(&self) -> &MediaRuntime {
        &self.runtime
    }

    /// Pool shared by the output streams, used for locally built packets
    pub fn output_pool(&self) -> &Arc<PacketPool> {
        &self.output_pool
    }

    fn input_slot(&self, channel: StreamChannel) -> &Mutex<Option<Arc<InputStream>>> {
        match channel {
            StreamChannel::Data => &self.data_input,
            StreamChannel::Control => &self.control_input,
        }
    }

    fn output_slot(&self, channel: StreamChannel) -> &Mutex<Option<Arc<OutputStream>>> {
        match channel {
            StreamChannel::Data => &self.data_output,
            StreamChannel::Control => &self.control_output,
        }
    }

    /// Input stream of `channel`; created only when `create` is set
    pub fn input_stream(&self, channel: StreamChannel, create: bool) -> Result<Option<Arc<InputStream>>> {
        let mut slot = self.input_slot(channel).lock();
        if slot.is_none() && create {
            self.check_open()?;
            let reader = self
                .sockets
                .reader(channel, self.runtime.config().socket_receive_buffer_size)?;
            let stream = InputStream::new(channel, reader, self.input_pool.clone(), self.runtime.clone());
            debug!("Created {} {} input stream", self.sockets.kind(), channel);
            *slot = Some(Arc::new(stream));
        }
        Ok(slot.clone())
    }

    /// Output stream of `channel`; created only when `create` is set
    pub fn output_stream(&self, channel: StreamChannel, create: bool) -> Result<Option<Arc<OutputStream>>> {
        let mut slot = self.output_slot(channel).lock();
        if slot.is_none() && create {
            self.check_open()?;
            let writer = self.sockets.writer(channel)?;
            let stream = OutputStream::new(channel, writer, self.output_pool.clone(), self.runtime.clone());
            debug!("Created {} {} output stream", self.sockets.kind(), channel);
            *slot = Some(Arc::new(stream));
        }
        Ok(slot.clone())
    }

    pub fn data_input_stream(&self, create: bool) -> Result<Option<Arc<InputStream>>> {
        self.input_stream(StreamChannel::Data, create)
    }

    pub fn control_input_stream(&self, create: bool) -> Result<Option<Arc<InputStream>>> {
        self.input_stream(StreamChannel::Control, create)
    }

    pub fn data_output_stream(&self, create: bool) -> Result<Option<Arc<OutputStream>>> {
        self.output_stream(StreamChannel::Data, create)
    }

    pub fn control_output_stream(&self, create: bool) -> Result<Option<Arc<OutputStream>>> {
        self.output_stream(StreamChannel::Control, create)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::StreamClosed)
        } else {
            Ok(())
        }
    }

    /// Add a destination to the control and then the data output stream
    pub fn add_target(&self, target: Target) -> Result<()> {
        if let Some(control) = target.control {
            if let Some(stream) = self.control_output_stream(true)? {
                stream.add_target(control)?;
            }
        }
        if let Some(stream) = self.data_output_stream(true)? {
            stream.add_target(target.data)?;
        }
        debug!("Added target {}", target);
        Ok(())
    }

    /// Remove a destination; unknown targets are ignored
    pub fn remove_target(&self, target: &Target) {
        if let Some(control) = target.control {
            if let Some(stream) = self.control_output.lock().as_ref() {
                stream.remove_target(control);
            }
        }
        if let Some(stream) = self.data_output.lock().as_ref() {
            stream.remove_target(target.data);
        }
    }

    pub fn remove_targets(&self) {
        for slot in [&self.control_output, &self.data_output] {
            if let Some(stream) = slot.lock().as_ref() {
                stream.remove_targets();
            }
        }
    }

    /// Enable the data streams the direction allows, without creating any
    pub fn set_direction(&self, direction: MediaDirection) {
        match self.data_input_stream(false) {
            Ok(Some(stream)) => stream.set_enabled(direction.allows_receiving()),
            Ok(None) => {}
            Err(e) => warn!("Cannot toggle data input stream for {}: {}", direction, e),
        }
        match self.data_output_stream(false) {
            Ok(Some(stream)) => stream.set_enabled(direction.allows_sending()),
            Ok(None) => {}
            Err(e) => warn!("Cannot toggle data output stream for {}: {}", direction, e),
        }
    }

    /// Close the output streams, the input streams and the sockets, once
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in [&self.data_output, &self.control_output] {
            if let Some(stream) = slot.lock().take() {
                stream.close();
            }
        }
        for slot in [&self.data_input, &self.control_input] {
            if let Some(stream) = slot.lock().take() {
                stream.close();
            }
        }
        self.sockets.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("sockets", &self.sockets)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    async fn connector() -> Connector {
        let sockets = StreamConnector::bind_udp("127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Connector::new(sockets, MediaRuntime::current(TransportConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_streams_are_lazy_and_cached() {
        let connector = connector().await;
        assert!(connector.data_input_stream(false).unwrap().is_none());

        let first = connector.data_input_stream(true).unwrap().unwrap();
        let second = connector.data_input_stream(false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(connector.control_output_stream(false).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_targets_and_direction() {
        let connector = connector().await;
        let target = Target::new("127.0.0.1:7000".parse().unwrap(), "127.0.0.1:7001".parse().unwrap());
        connector.add_target(target).unwrap();

        let data = connector.data_output_stream(false).unwrap().unwrap();
        let control = connector.control_output_stream(false).unwrap().unwrap();
        assert_eq!(data.targets(), vec![target.data]);
        assert_eq!(control.targets(), vec!["127.0.0.1:7001".parse().unwrap()]);

        connector.set_direction(MediaDirection::RecvOnly);
        assert!(!data.is_enabled());
        assert!(control.is_enabled());
        // never created by a direction change
        assert!(connector.data_input_stream(false).unwrap().is_none());

        connector.remove_target(&target);
        connector.remove_target(&target);
        assert!(data.targets().is_empty());
        assert!(control.targets().is_empty());
    }

    #[tokio::test]
    async fn test_close_once() {
        let connector = connector().await;
        let input = connector.data_input_stream(true).unwrap().unwrap();
        let output = connector.data_output_stream(true).unwrap().unwrap();

        connector.close();
        connector.close();
        assert!(input.is_closed());
        assert!(output.is_closed());
        assert!(connector.stream_connector().is_closed());
        assert!(matches!(connector.data_input_stream(true), Err(Error::StreamClosed)));
    }
}
