//! Media stream session
//!
//! [`MediaStream`] ties a [`Connector`] to a [`DeviceSession`] through a
//! [`TransformEngineChain`]. It keeps the direction state (what the stream
//! may do) apart from the started axes (what it currently does), owns the
//! negotiated payload type and header extension tables, allocates the local
//! SSRC and learns remote ones from incoming traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::reporter::{build_report, report_loop, SenderInfo};
use super::{DynamicPayloadTypeTable, MediaDirection, RtpExtension, RtpExtensionTable};
use crate::config::MediaRuntime;
use crate::device::{DeviceSession, MediaDevice, MediaFormat, MediaType};
use crate::dtmf::DtmfTransformEngine;
use crate::error::Error;
use crate::events::{MediaStreamEvent, EVENT_CHANNEL_CAPACITY};
use crate::packet::rtcp::{serialize_compound, NtpTimestamp, RtcpGoodbye, RtcpPacket, RtcpReceiverReport};
use crate::packet::{build_rtp_packet, DtmfTone, PacketPool, RawPacket};
use crate::security::{NullSrtpControl, SrtpControl};
use crate::ssrc::{SsrcCause, SsrcGenerator};
use crate::stats::{MediaStreamStats, StatisticsEngine, StreamStatsSnapshot};
use crate::transform::engines::{
    AbsSendTimeEngine, ArrivalCallback, CachingEngine, CsrcEngine, ExternalEngine, FecEngine,
    PayloadTypeOverrideEngine, RedEngine, RtcpTerminationEngine, RtxEngine, SrtpEngine, SsrcAudioLevelEngine,
    TransportCcEngine, DEFAULT_CACHE_SIZE,
};
use crate::transform::{
    ChainTransformer, EngineKind, EngineRef, PacketInjector, PacketTransformer, Protocol, TransformEngineChain,
    TransformOutcome,
};
use crate::transport::{Connector, InputStream, ReadOutcome, StreamChannel, Target};
use crate::{Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// Builder for [`MediaStream`]
pub struct MediaStreamBuilder {
    connector: Connector,
    device: Arc<dyn MediaDevice>,
    srtp: Arc<dyn SrtpControl>,
    initial_ssrc: Option<RtpSsrc>,
    direction: Option<MediaDirection>,
    cache_size: usize,
}

impl MediaStreamBuilder {
    pub fn new(connector: Connector, device: Arc<dyn MediaDevice>) -> Self {
        Self {
            connector,
            device,
            srtp: Arc::new(NullSrtpControl),
            initial_ssrc: None,
            direction: None,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }

    /// Security control; media is sent in the clear without one
    pub fn srtp_control(mut self, srtp: Arc<dyn SrtpControl>) -> Self {
        self.srtp = srtp;
        self
    }

    /// SSRC agreed in signaling, used as the first local SSRC
    pub fn initial_ssrc(mut self, ssrc: RtpSsrc) -> Self {
        self.initial_ssrc = Some(ssrc);
        self
    }

    /// Initial direction; defaults to what the device supports
    pub fn direction(mut self, direction: MediaDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Sent packets kept for retransmission
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn build(self) -> Result<Arc<MediaStream>> {
        let supported = self.device.supported_direction();
        let direction = self.direction.unwrap_or(supported);
        if !supported.contains(direction) {
            return Err(Error::InvalidDirection {
                requested: direction,
                supported,
            });
        }
        if self.connector.is_closed() {
            return Err(Error::StreamClosed);
        }

        let stream = Arc::new_cyclic(|weak| MediaStream::new(self, direction, weak.clone()));
        stream.change_local_ssrc(SsrcCause::SessionStart);
        info!(
            "Created {} media stream {} ({}, local SSRC {:08x})",
            stream.device.media_type(),
            stream.id,
            direction,
            stream.local_ssrc().unwrap_or_default()
        );
        Ok(stream)
    }
}

/// Engines a session configures after construction
struct Engines {
    csrc: Arc<CsrcEngine>,
    dtmf: Option<Arc<DtmfTransformEngine>>,
    external: Arc<ExternalEngine>,
    payload_type: Arc<PayloadTypeOverrideEngine>,
    fec: Arc<FecEngine>,
    red: Arc<RedEngine>,
    statistics: Arc<StatisticsEngine>,
    rtx: Arc<RtxEngine>,
    transport_cc: Arc<TransportCcEngine>,
    audio_level: Option<Arc<SsrcAudioLevelEngine>>,
}

#[derive(Debug, Default)]
struct DirectionState {
    /// Negotiated direction
    direction: MediaDirection,
    /// Axes currently running
    started: MediaDirection,
    /// Whether `start` was called and not undone by `stop`
    running: bool,
}

#[derive(Debug)]
struct SendState {
    sequence: RtpSequenceNumber,
    timestamp: RtpTimestamp,
}

/// An RTP session over one connector
pub struct MediaStream {
    id: String,
    runtime: MediaRuntime,
    connector: Connector,
    device: DeviceSession,
    srtp: Arc<dyn SrtpControl>,
    chain: Arc<TransformEngineChain>,
    engines: Engines,
    stats: Arc<MediaStreamStats>,
    events: broadcast::Sender<MediaStreamEvent>,
    ssrc_generator: SsrcGenerator,
    local_ssrc: Mutex<Option<RtpSsrc>>,
    remote_ssrcs: Mutex<Vec<RtpSsrc>>,
    payload_types: RwLock<DynamicPayloadTypeTable>,
    extensions: RwLock<RtpExtensionTable>,
    state: Mutex<DirectionState>,
    send_state: Mutex<SendState>,
    receive_pool: Arc<PacketPool>,
    reporter: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    weak_self: Weak<MediaStream>,
    closed: AtomicBool,
}

impl MediaStream {
    fn new(builder: MediaStreamBuilder, direction: MediaDirection, weak_self: Weak<MediaStream>) -> Self {
        let MediaStreamBuilder {
            connector,
            device,
            srtp,
            initial_ssrc,
            cache_size,
            ..
        } = builder;
        let runtime = connector.runtime().clone();
        let config = runtime.config().clone();
        let id = format!("{:08x}", rand::random::<u32>());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let device = DeviceSession::new(device);

        let stats = Arc::new(MediaStreamStats::new(&config));
        if let Some(format) = device.device().format() {
            stats.set_clock_rate(format.clock_rate);
        }

        let statistics = Arc::new(StatisticsEngine::new(stats.clone(), events.clone()));
        let keyframe_target = weak_self.clone();
        statistics.set_keyframe_handler(Some(Arc::new(move || {
            if let Some(stream) = keyframe_target.upgrade() {
                stream.device.request_keyframe();
            }
        })));

        let caching = Arc::new(CachingEngine::new(cache_size));
        let rtx = Arc::new(RtxEngine::new(caching.clone()));
        let injector: Weak<dyn PacketInjector> = weak_self.clone();
        rtx.set_injector(injector);

        let audio = device.media_type() == MediaType::Audio;
        let engines = Engines {
            csrc: Arc::new(CsrcEngine::new()),
            dtmf: audio.then(|| Arc::new(DtmfTransformEngine::new(&runtime, events.clone()))),
            external: Arc::new(ExternalEngine::new()),
            payload_type: Arc::new(PayloadTypeOverrideEngine::new()),
            fec: Arc::new(FecEngine::new(stats.clone())),
            red: Arc::new(RedEngine::new()),
            statistics,
            rtx,
            transport_cc: Arc::new(TransportCcEngine::new()),
            audio_level: audio.then(|| Arc::new(SsrcAudioLevelEngine::new())),
        };

        let mut chain: Vec<EngineRef> = vec![
            engines.csrc.clone(),
            engines.external.clone(),
            engines.payload_type.clone(),
            engines.fec.clone(),
            engines.red.clone(),
            engines.statistics.clone(),
            caching,
            engines.rtx.clone(),
            Arc::new(AbsSendTimeEngine::new()),
            engines.transport_cc.clone(),
        ];
        if let Some(dtmf) = &engines.dtmf {
            chain.push(dtmf.clone());
        }
        if let Some(audio_level) = &engines.audio_level {
            chain.push(audio_level.clone());
        }
        if config.translator_mode {
            chain.push(Arc::new(RtcpTerminationEngine::new()));
        }

        srtp.set_connector(Some(connector.stream_connector().clone()));
        srtp.register_user(&id);
        if let Some(engine) = srtp.transform_engine() {
            chain.push(Arc::new(SrtpEngine::new(engine)));
        }

        Self {
            id,
            receive_pool: Arc::new(PacketPool::new(config.packet_pool_capacity, config.receive_buffer_length)),
            runtime,
            connector,
            device,
            srtp,
            chain: Arc::new(TransformEngineChain::new(chain)),
            engines,
            stats,
            events,
            ssrc_generator: SsrcGenerator::new(initial_ssrc),
            local_ssrc: Mutex::new(None),
            remote_ssrcs: Mutex::new(Vec::new()),
            payload_types: RwLock::new(DynamicPayloadTypeTable::new()),
            extensions: RwLock::new(RtpExtensionTable::new()),
            state: Mutex::new(DirectionState {
                direction,
                ..Default::default()
            }),
            send_state: Mutex::new(SendState {
                sequence: rand::random(),
                timestamp: rand::random(),
            }),
            reporter: Mutex::new(None),
            weak_self,
            closed: AtomicBool::new(false),
        }
    }

    /// Identifier used in logs and towards the security control
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn device(&self) -> &DeviceSession {
        &self.device
    }

    pub fn chain(&self) -> &Arc<TransformEngineChain> {
        &self.chain
    }

    /// Receive the events of this session
    pub fn subscribe(&self) -> broadcast::Receiver<MediaStreamEvent> {
        self.events.subscribe()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::StreamClosed)
        } else {
            Ok(())
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Targets

    pub fn add_target(&self, target: Target) -> Result<()> {
        self.check_open()?;
        self.connector.add_target(target)
    }

    pub fn remove_target(&self, target: &Target) {
        self.connector.remove_target(target);
    }

    // Direction and lifecycle

    pub fn direction(&self) -> MediaDirection {
        self.state.lock().direction
    }

    /// Axes currently running
    pub fn started_direction(&self) -> MediaDirection {
        self.state.lock().started
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().running
    }

    /// Change the direction, starting and stopping axes of a running stream
    pub fn set_direction(&self, direction: MediaDirection) -> Result<()> {
        self.check_open()?;
        let supported = self.device.device().supported_direction();
        if !supported.contains(direction) {
            return Err(Error::InvalidDirection {
                requested: direction,
                supported,
            });
        }

        let mut state = self.state.lock();
        let old = state.direction;
        state.direction = direction;
        self.connector.set_direction(direction);
        if state.running {
            let to_stop = state.started.and_not(direction);
            self.stop_axes(&mut state, to_stop);
            let to_start = direction.and_not(state.started);
            self.start_axes(&mut state, to_start)?;
        }
        drop(state);

        if old != direction {
            debug!("Stream {} direction {} -> {}", self.id, old, direction);
            let _ = self.events.send(MediaStreamEvent::DirectionChanged { old, new: direction });
        }
        Ok(())
    }

    /// Start every axis the direction allows
    pub fn start(&self) -> Result<()> {
        let direction = self.direction();
        self.start_direction(direction)
    }

    /// Start the axes of `direction` that are not running yet
    ///
    /// The stream direction widens to include them, so starting `SendRecv`
    /// on an inactive stream runs both axes.
    pub fn start_direction(&self, direction: MediaDirection) -> Result<()> {
        self.check_open()?;
        let supported = self.device.device().supported_direction();
        if !supported.contains(direction) {
            return Err(Error::InvalidDirection {
                requested: direction,
                supported,
            });
        }

        let mut state = self.state.lock();
        if !state.running {
            self.open_control()?;
            self.start_reporter();
            state.running = true;
        }
        let old = state.direction;
        state.direction = old.or(direction);
        self.connector.set_direction(state.direction);
        let axes = direction.and_not(state.started);
        let started = self.start_axes(&mut state, axes);
        let new = state.direction;
        drop(state);

        if old != new {
            debug!("Stream {} direction {} -> {}", self.id, old, new);
            let _ = self.events.send(MediaStreamEvent::DirectionChanged { old, new });
        }
        started
    }

    /// Stop every axis
    pub fn stop(&self) {
        self.stop_direction(MediaDirection::SendRecv);
    }

    /// Stop the running axes of `direction`, leaving the others alone
    pub fn stop_direction(&self, direction: MediaDirection) {
        let mut state = self.state.lock();
        let axes = state.started.and(direction);
        self.stop_axes(&mut state, axes);
        if state.running && state.started == MediaDirection::Inactive {
            state.running = false;
            self.stop_reporter();
        }
    }

    fn start_axes(&self, state: &mut DirectionState, axes: MediaDirection) -> Result<()> {
        if axes.allows_sending() {
            self.start_sending()?;
            state.started = state.started.or(MediaDirection::SendOnly);
        }
        if axes.allows_receiving() {
            self.start_receiving()?;
            state.started = state.started.or(MediaDirection::RecvOnly);
        }
        if axes != MediaDirection::Inactive {
            debug!("Stream {} started {}, running {}", self.id, axes, state.started);
        }
        Ok(())
    }

    fn stop_axes(&self, state: &mut DirectionState, axes: MediaDirection) {
        if axes.allows_sending() {
            if let Ok(Some(output)) = self.connector.data_output_stream(false) {
                output.set_enabled(false);
            }
            if let Err(e) = self.device.device().stop(MediaDirection::SendOnly) {
                warn!("Failed to stop capture of stream {}: {}", self.id, e);
            }
            state.started = state.started.and_not(MediaDirection::SendOnly);
        }
        if axes.allows_receiving() {
            if let Ok(Some(input)) = self.connector.data_input_stream(false) {
                input.set_enabled(false);
            }
            if let Err(e) = self.device.device().stop(MediaDirection::RecvOnly) {
                warn!("Failed to stop playback of stream {}: {}", self.id, e);
            }
            state.started = state.started.and_not(MediaDirection::RecvOnly);
        }
        if axes != MediaDirection::Inactive {
            debug!("Stream {} stopped {}, running {}", self.id, axes, state.started);
        }
    }

    fn start_sending(&self) -> Result<()> {
        let output = self
            .connector
            .data_output_stream(true)?
            .ok_or_else(|| Error::InvalidState("no data output stream".into()))?;
        let transformer: Arc<dyn PacketTransformer> = self.chain.rtp_transformer();
        output.set_transformer(Some(transformer));
        output.set_enabled(true);
        self.device.device().start(MediaDirection::SendOnly)
    }

    fn start_receiving(&self) -> Result<()> {
        let input = self
            .connector
            .data_input_stream(true)?
            .ok_or_else(|| Error::InvalidState("no data input stream".into()))?;
        let transformer: Arc<dyn PacketTransformer> = Arc::new(ReceiveTransformer {
            chain: self.chain.rtp_transformer(),
            stats: self.stats.clone(),
        });
        input.set_transformer(Some(transformer));
        input.set_enabled(true);
        let stream = self.weak_self.clone();
        input.set_transfer_handler(Arc::new(move || {
            if let Some(stream) = stream.upgrade() {
                stream.on_data_available();
            }
        }));
        self.device.device().start(MediaDirection::RecvOnly)
    }

    /// RTCP flows whatever the direction
    fn open_control(&self) -> Result<()> {
        let transformer: Arc<dyn PacketTransformer> = self.chain.rtcp_transformer();
        if let Some(output) = self.connector.control_output_stream(true)? {
            output.set_transformer(Some(transformer.clone()));
        }
        if let Some(input) = self.connector.control_input_stream(true)? {
            input.set_transformer(Some(transformer));
            let stream = self.weak_self.clone();
            input.set_transfer_handler(Arc::new(move || {
                if let Some(stream) = stream.upgrade() {
                    stream.on_control_available();
                }
            }));
        }
        Ok(())
    }

    fn start_reporter(&self) {
        let mut reporter = self.reporter.lock();
        if reporter.is_some() {
            return;
        }
        let (shutdown, rx) = watch::channel(false);
        let interval = self.runtime.config().rtcp_interval();
        let handle = self.runtime.spawn(report_loop(self.weak_self.clone(), interval, rx));
        *reporter = Some((shutdown, handle));
    }

    /// Signal the report loop; the returned handle completes once it exits
    fn stop_reporter(&self) -> Option<JoinHandle<()>> {
        let (shutdown, handle) = self.reporter.lock().take()?;
        let _ = shutdown.send(true);
        Some(handle)
    }

    /// Stop, say goodbye and release everything, once
    ///
    /// The order is: axes and device, final statistics, BYE, security
    /// control, transform chain, targets, connector.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let reporter = self.stop_reporter();
        {
            let mut state = self.state.lock();
            let running = state.started;
            self.stop_axes(&mut state, running);
            state.running = false;
        }
        self.stats.update_stats(Instant::now());

        if let Err(e) = self.send_bye().await {
            debug!("BYE of stream {} not sent: {}", self.id, e);
        }

        self.srtp.cleanup(&self.id);
        self.srtp.set_connector(None);
        self.chain.close();
        if let Some(handle) = reporter {
            if let Err(e) = handle.await {
                warn!("RTCP report loop of stream {} failed: {}", self.id, e);
            }
        }
        if let Some(dtmf) = &self.engines.dtmf {
            dtmf.join().await;
        }
        self.connector.remove_targets();
        self.connector.close();
        info!("Closed media stream {}", self.id);
    }

    async fn send_bye(&self) -> Result<()> {
        let Some(ssrc) = self.local_ssrc() else {
            return Ok(());
        };
        let Some(control) = self.connector.control_output_stream(false)? else {
            return Ok(());
        };
        let packets = [
            RtcpPacket::ReceiverReport(RtcpReceiverReport::new(ssrc)),
            RtcpPacket::Goodbye(RtcpGoodbye::new_for_source(ssrc)),
        ];
        control.sync_write(&serialize_compound(&packets)?).await?;
        Ok(())
    }

    // SSRC

    pub fn local_ssrc(&self) -> Option<RtpSsrc> {
        *self.local_ssrc.lock()
    }

    /// Pick a fresh local SSRC, e.g. after renegotiation
    pub fn renew_local_ssrc(&self) -> RtpSsrc {
        self.change_local_ssrc(SsrcCause::Renegotiation)
    }

    fn change_local_ssrc(&self, cause: SsrcCause) -> RtpSsrc {
        let new = self.ssrc_generator.generate(cause);
        let old = self.local_ssrc.lock().replace(new);
        self.stats.set_local_ssrc(new);
        self.srtp.set_local_ssrc(new);
        if old.is_some() {
            debug!("Stream {} local SSRC {:08x} -> {:08x} ({:?})", self.id, old.unwrap_or_default(), new, cause);
        }
        let _ = self.events.send(MediaStreamEvent::LocalSsrcChanged { old, new });
        new
    }

    /// Remote sources in the order they were seen
    pub fn remote_ssrcs(&self) -> Vec<RtpSsrc> {
        self.remote_ssrcs.lock().clone()
    }

    /// Most recently seen remote source
    pub fn remote_ssrc(&self) -> Option<RtpSsrc> {
        self.remote_ssrcs.lock().last().copied()
    }

    fn learn_remote_source(&self, ssrc: RtpSsrc) {
        {
            let mut remote = self.remote_ssrcs.lock();
            if remote.contains(&ssrc) {
                return;
            }
            remote.push(ssrc);
        }
        debug!("Stream {} new remote SSRC {:08x}", self.id, ssrc);
        self.device.device().add_receive_stream(ssrc);
        let _ = self.events.send(MediaStreamEvent::RemoteSsrcAdded { ssrc });
    }

    fn remove_remote_source(&self, ssrc: RtpSsrc) {
        {
            let mut remote = self.remote_ssrcs.lock();
            let Some(index) = remote.iter().position(|s| *s == ssrc) else {
                return;
            };
            remote.remove(index);
        }
        self.stats.receive_statistics().remove(ssrc);
        self.device.device().remove_receive_stream(ssrc);
        debug!("Stream {} removed remote SSRC {:08x}", self.id, ssrc);
        let _ = self.events.send(MediaStreamEvent::RemoteSsrcRemoved { ssrc });
    }

    /// Remove remote sources silent for longer than the configured timeout
    pub fn expire_remote_sources(&self, now: Instant) -> Vec<RtpSsrc> {
        let timeout = self.runtime.config().remote_source_timeout();
        let expired = self.stats.receive_statistics().expire(timeout, now);
        for ssrc in &expired {
            self.remove_remote_source(*ssrc);
        }
        expired
    }

    // Receive path

    fn on_data_available(&self) {
        let Ok(Some(input)) = self.connector.data_input_stream(false) else {
            return;
        };
        if let Some(pkt) = self.read_packet(&input) {
            self.on_rtp(&pkt);
            self.receive_pool.release(pkt);
        }
    }

    fn on_control_available(&self) {
        let Ok(Some(input)) = self.connector.control_input_stream(false) else {
            return;
        };
        let Some(pkt) = self.read_packet(&input) else {
            return;
        };
        if let Ok(packets) = RtcpPacket::parse_compound(pkt.data()) {
            for packet in packets {
                if let RtcpPacket::Goodbye(bye) = packet {
                    for ssrc in bye.sources {
                        self.remove_remote_source(ssrc);
                    }
                }
            }
        }
        self.receive_pool.release(pkt);
    }

    fn read_packet(&self, input: &InputStream) -> Option<RawPacket> {
        let mut pkt = self.receive_pool.acquire(0);
        let read = input.read(pkt.buffer_mut());
        match read {
            Ok(ReadOutcome::Packet { len, flags }) if pkt.set_window(0, len).is_ok() => {
                pkt.set_flags(flags);
                return Some(pkt);
            }
            Ok(ReadOutcome::EndOfStream) => debug!("Stream {} {} input at end of stream", self.id, input.channel()),
            Ok(_) => {}
            Err(e) => warn!("Stream {} failed to read {}: {}", self.id, input.channel(), e),
        }
        self.receive_pool.release(pkt);
        None
    }

    fn on_rtp(&self, pkt: &RawPacket) {
        let ssrc = pkt.ssrc();
        if self.local_ssrc() == Some(ssrc) {
            warn!("Stream {} SSRC collision on {:08x}", self.id, ssrc);
            self.change_local_ssrc(SsrcCause::Collision);
        }
        self.learn_remote_source(ssrc);
        self.device.device().deliver(ssrc, pkt.timestamp(), pkt.payload());
    }

    // Send path

    /// Packetize one frame of the device's format and send it
    ///
    /// `samples` advances the RTP timestamp for the next frame. A muted
    /// audio stream advances the timestamp without sending.
    pub async fn send_media(&self, payload: &[u8], samples: u32, marker: bool) -> Result<()> {
        self.check_open()?;
        if !self.started_direction().allows_sending() {
            return Err(Error::InvalidState("send direction not started".into()));
        }
        let ssrc = self
            .local_ssrc()
            .ok_or_else(|| Error::InvalidState("no local SSRC".into()))?;
        let payload_type = self.send_payload_type()?;

        let (sequence, timestamp) = {
            let mut send = self.send_state.lock();
            let timestamp = send.timestamp;
            send.timestamp = send.timestamp.wrapping_add(samples);
            if self.device.is_muted() {
                return Ok(());
            }
            let sequence = send.sequence;
            send.sequence = send.sequence.wrapping_add(1);
            (sequence, timestamp)
        };

        self.engines.csrc.set_csrcs(self.device.device().csrcs());
        let pkt = build_rtp_packet(payload_type, marker, sequence, timestamp, ssrc, payload);
        let output = self
            .connector
            .data_output_stream(false)?
            .ok_or_else(|| Error::InvalidState("no data output stream".into()))?;
        output.write(pkt.data()).await?;
        Ok(())
    }

    fn send_payload_type(&self) -> Result<u8> {
        let format = self
            .device
            .device()
            .format()
            .ok_or_else(|| Error::InvalidState("device has no format".into()))?;
        self.payload_types
            .read()
            .find(|f| f.encoding.eq_ignore_ascii_case(&format.encoding) && f.clock_rate == format.clock_rate)
            .ok_or_else(|| Error::InvalidState(format!("no payload type for {}", format)))
    }

    /// Send the periodic report now
    pub async fn send_rtcp_report(&self) -> Result<()> {
        self.check_open()?;
        let ssrc = self
            .local_ssrc()
            .ok_or_else(|| Error::InvalidState("no local SSRC".into()))?;
        let (packets_sent, bytes_sent) = self.stats.sent_counters();
        let sender = (self.started_direction().allows_sending() && packets_sent > 0).then(|| SenderInfo {
            ntp_timestamp: NtpTimestamp::now(),
            rtp_timestamp: self.send_state.lock().timestamp,
            packet_count: packets_sent as u32,
            octet_count: bytes_sent as u32,
        });
        let blocks = self.stats.receive_statistics().report_blocks(Instant::now());
        let packets = build_report(ssrc, sender, blocks, &self.runtime.config().cname);

        let control = self
            .connector
            .control_output_stream(false)?
            .ok_or_else(|| Error::InvalidState("no control output stream".into()))?;
        control.write(&serialize_compound(&packets)?).await?;
        Ok(())
    }

    /// Send a prebuilt packet, running the chain after `after`
    pub async fn inject_packet(&self, pkt: RawPacket, protocol: Protocol, after: Option<EngineKind>) -> Result<()> {
        self.try_inject(pkt, protocol, after)
            .await
            .map_err(Error::into_transmission_failure)
    }

    async fn try_inject(&self, mut pkt: RawPacket, protocol: Protocol, after: Option<EngineKind>) -> Result<()> {
        self.check_open()?;
        let channel = match protocol {
            Protocol::Rtp => StreamChannel::Data,
            Protocol::Rtcp => StreamChannel::Control,
        };
        let output = self
            .connector
            .output_stream(channel, false)?
            .ok_or_else(|| Error::InvalidState(format!("no {} output stream", channel)))?;
        if self.chain.transform(protocol, &mut pkt, after).is_discard() {
            self.connector.output_pool().release(pkt);
            return Ok(());
        }
        output.send_transformed(pkt).await
    }

    // DTMF

    /// Start sending `tone`, ending the tone in progress
    pub fn start_sending_dtmf(&self, tone: DtmfTone) -> Result<()> {
        self.check_open()?;
        self.engines
            .dtmf
            .as_ref()
            .ok_or(Error::DtmfNotNegotiated)?
            .start_sending(tone)
    }

    pub fn stop_sending_dtmf(&self) {
        if let Some(dtmf) = &self.engines.dtmf {
            dtmf.stop_sending();
        }
    }

    // Negotiated tables

    /// Associate a payload type with a format
    ///
    /// RED, ULPFEC, FlexFEC and telephone-event formats also configure the
    /// matching engine.
    pub fn add_dynamic_rtp_payload_type(&self, payload_type: u8, format: MediaFormat) -> Result<()> {
        let previous = self.payload_types.write().insert(payload_type, format.clone())?;
        if let Some(previous) = previous {
            self.configure_payload_type(payload_type, &previous, false);
        }
        self.configure_payload_type(payload_type, &format, true);
        debug!("Stream {} payload type {} -> {}", self.id, payload_type, format);
        Ok(())
    }

    fn configure_payload_type(&self, payload_type: u8, format: &MediaFormat, assign: bool) {
        let value = assign.then_some(payload_type);
        if format.is_red() {
            self.engines.red.set_payload_type(value);
        } else if format.is_ulpfec() {
            self.engines.fec.set_ulpfec_payload_type(value);
        } else if format.is_flexfec() {
            self.engines.fec.set_flexfec_payload_type(value);
        } else if format.is_telephone_event() {
            if let Some(dtmf) = &self.engines.dtmf {
                dtmf.set_payload_type(value);
                if assign {
                    dtmf.set_clock_rate(format.clock_rate);
                }
            }
        }
    }

    /// Rewrite `original` to `replacement` on outgoing packets
    pub fn add_dynamic_rtp_payload_type_override(&self, original: u8, replacement: u8) -> Result<()> {
        let mut table = self.payload_types.write();
        table.add_override(original, replacement)?;
        self.engines.payload_type.set_overrides(table.overrides().clone());
        Ok(())
    }

    /// RTX payload type repairing `media_payload_type`
    pub fn add_rtx_payload_type(&self, rtx_payload_type: u8, media_payload_type: u8) -> Result<()> {
        if rtx_payload_type > 127 || media_payload_type > 127 {
            return Err(Error::ConfigError(format!(
                "Invalid RTX payload types {}/{}",
                rtx_payload_type, media_payload_type
            )));
        }
        self.engines.rtx.add_payload_type(rtx_payload_type, media_payload_type);
        self.engines.rtx.ensure_rtx_ssrc();
        Ok(())
    }

    /// Forget every association and reset the engines they configured
    pub fn clear_dynamic_rtp_payload_types(&self) {
        self.payload_types.write().clear();
        self.engines.red.set_payload_type(None);
        self.engines.fec.set_ulpfec_payload_type(None);
        self.engines.fec.set_flexfec_payload_type(None);
        if let Some(dtmf) = &self.engines.dtmf {
            dtmf.set_payload_type(None);
        }
        self.engines.rtx.clear_payload_types();
        self.engines.payload_type.set_overrides(Default::default());
    }

    pub fn dynamic_rtp_payload_types(&self) -> DynamicPayloadTypeTable {
        self.payload_types.read().clone()
    }

    /// Map a header extension and tell the engines about its id
    pub fn add_rtp_extension(&self, id: u8, extension: RtpExtension) -> Result<()> {
        let kind = extension.kind();
        let active = extension.direction != MediaDirection::Inactive;
        let previous = self.extensions.write().insert(id, extension)?;
        if let Some(previous) = previous {
            if previous.kind() != kind || !active {
                self.chain.set_extension_id(previous.kind(), None);
            }
        }
        if active {
            self.chain.set_extension_id(kind, Some(id));
        }
        Ok(())
    }

    pub fn remove_rtp_extension(&self, id: u8) -> Option<RtpExtension> {
        let removed = self.extensions.write().remove(id)?;
        self.chain.set_extension_id(removed.kind(), None);
        Some(removed)
    }

    pub fn clear_rtp_extensions(&self) {
        let table = std::mem::take(&mut *self.extensions.write());
        for (_, extension) in table.iter() {
            self.chain.set_extension_id(extension.kind(), None);
        }
    }

    pub fn rtp_extensions(&self) -> RtpExtensionTable {
        self.extensions.read().clone()
    }

    // Engines

    /// Install user transformers at the `External` position of the chain
    pub fn set_external_transformer(
        &self,
        rtp: Option<Arc<dyn PacketTransformer>>,
        rtcp: Option<Arc<dyn PacketTransformer>>,
    ) {
        self.engines.external.set_rtp_transformer(rtp);
        self.engines.external.set_rtcp_transformer(rtcp);
    }

    /// Called with the transport-wide sequence number of received packets
    pub fn set_transport_cc_callback(&self, callback: Option<ArrivalCallback>) {
        self.engines.transport_cc.set_arrival_callback(callback);
    }

    /// Map a remote RTX SSRC to the media SSRC it repairs
    pub fn add_remote_rtx_ssrc(&self, rtx_ssrc: RtpSsrc, media_ssrc: RtpSsrc) {
        self.engines.rtx.add_remote_ssrc(rtx_ssrc, media_ssrc);
    }

    /// Audio level engine, present on audio streams
    pub fn audio_level(&self) -> Option<&Arc<SsrcAudioLevelEngine>> {
        self.engines.audio_level.as_ref()
    }

    pub fn set_red_encapsulation(&self, enabled: bool) {
        self.engines.red.set_encapsulate(enabled);
    }

    pub fn set_mute(&self, mute: bool) {
        self.device.set_mute(mute);
    }

    /// The device switched format; pick up its clock rate
    pub fn device_format_changed(&self) {
        let Some(format) = self.device.device().format() else {
            return;
        };
        debug!("Stream {} device format is now {}", self.id, format);
        self.stats.set_clock_rate(format.clock_rate);
    }

    // Statistics

    pub fn stats(&self) -> &Arc<MediaStreamStats> {
        &self.stats
    }

    /// Advance the statistics; to be called periodically
    pub fn update_stats(&self, now: Instant) -> StreamStatsSnapshot {
        self.stats.update_stats(now);
        self.stats.snapshot()
    }
}

/// Data receive path: the RTP side of the chain, counting vetoed packets
struct ReceiveTransformer {
    chain: Arc<ChainTransformer>,
    stats: Arc<MediaStreamStats>,
}

impl PacketTransformer for ReceiveTransformer {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.chain.transform(pkt)
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let outcome = self.chain.reverse_transform(pkt);
        if outcome.is_discard() {
            self.stats.record_discarded();
        }
        outcome
    }
}

impl PacketInjector for MediaStream {
    fn inject(&self, pkt: RawPacket, after: Option<EngineKind>) {
        let stream = self.weak_self.clone();
        self.runtime.spawn(async move {
            let Some(stream) = stream.upgrade() else {
                return;
            };
            if let Err(e) = stream.inject_packet(pkt, Protocol::Rtp, after).await {
                debug!("Injected packet of stream {} lost: {}", stream.id, e);
            }
        });
    }
}
