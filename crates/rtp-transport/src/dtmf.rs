//! RFC 4733 DTMF transform engine
//!
//! On send, while a tone is active, outgoing audio packets are rewritten
//! into telephone-event packets: same sequence number, the event's base
//! timestamp, and a growing duration. Ending a tone emits three end packets.
//! Long tones are split into segments when the 16-bit duration overflows.
//!
//! On receive, telephone-event packets are taken off the media path and
//! handed to a dispatcher task which turns the packet stream into one start
//! and one end event per tone.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::config::MediaRuntime;
use crate::error::Error;
use crate::events::MediaStreamEvent;
use crate::packet::{DtmfEventPayload, DtmfTone, RawPacket};
use crate::time::ms_to_rtp_units;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};
use crate::{Result, RtpSsrc, RtpTimestamp};

/// Capacity of the received event queue
const RECEIVE_QUEUE_CAPACITY: usize = 100;

/// Redundant end packets sent after the first one
const END_PACKET_REPEATS: u8 = 2;

const NO_PAYLOAD_TYPE: u8 = 0xFF;

/// Sender state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfSendState {
    Idle,
    Sending,
    EndRequested,
    EndSequenceInitiated,
}

#[derive(Debug)]
struct DtmfSender {
    state: DtmfSendState,
    pending: VecDeque<DtmfTone>,
    stops_requested: usize,
    tone: Option<DtmfTone>,
    base_timestamp: RtpTimestamp,
    duration: u32,
    elapsed: u64,
    end_repeats: u8,
    min_duration: u64,
    max_duration: Option<u64>,
}

impl DtmfSender {
    fn new() -> Self {
        Self {
            state: DtmfSendState::Idle,
            pending: VecDeque::new(),
            stops_requested: 0,
            tone: None,
            base_timestamp: 0,
            duration: 0,
            elapsed: 0,
            end_repeats: 0,
            min_duration: 0,
            max_duration: None,
        }
    }

    /// Coalesce a stop with the tones not yet stopped
    fn request_stop(&mut self) {
        if self.pending.len() > self.stops_requested {
            self.stops_requested += 1;
        }
    }

    fn should_end(&self) -> bool {
        (self.stops_requested > 0 && self.elapsed >= self.min_duration)
            || self.max_duration.is_some_and(|max| self.elapsed >= max)
    }

    /// Advance by one packet
    ///
    /// Returns the event to carry, whether the marker bit is set and the
    /// timestamp of the event.
    fn next_packet(&mut self, timestamp: RtpTimestamp, spacing: u32) -> Option<(DtmfEventPayload, bool, RtpTimestamp)> {
        if self.state == DtmfSendState::Sending && self.should_end() {
            self.state = DtmfSendState::EndRequested;
        }

        match self.state {
            DtmfSendState::Idle => {
                let tone = *self.pending.front()?;
                self.tone = Some(tone);
                self.state = DtmfSendState::Sending;
                self.base_timestamp = timestamp;
                self.duration = spacing;
                self.elapsed = spacing as u64;
                Some((DtmfEventPayload::new(tone, false, 0, spacing as u16), true, timestamp))
            }
            DtmfSendState::Sending => {
                let tone = self.tone?;
                self.duration += spacing;
                self.elapsed += spacing as u64;
                if self.duration > 0xFFFF {
                    // close this segment; the next one starts here
                    let segment_start = self.base_timestamp;
                    self.base_timestamp = timestamp;
                    self.duration = 0;
                    return Some((DtmfEventPayload::new(tone, false, 0, 0xFFFF), false, segment_start));
                }
                Some((
                    DtmfEventPayload::new(tone, false, 0, self.duration as u16),
                    false,
                    self.base_timestamp,
                ))
            }
            DtmfSendState::EndRequested => {
                let tone = self.tone?;
                self.duration = (self.duration + spacing).min(0xFFFF);
                self.state = DtmfSendState::EndSequenceInitiated;
                self.end_repeats = END_PACKET_REPEATS;
                Some((
                    DtmfEventPayload::new(tone, true, 0, self.duration as u16),
                    false,
                    self.base_timestamp,
                ))
            }
            DtmfSendState::EndSequenceInitiated => {
                let tone = self.tone?;
                let event = DtmfEventPayload::new(tone, true, 0, self.duration as u16);
                let base = self.base_timestamp;
                self.end_repeats = self.end_repeats.saturating_sub(1);
                if self.end_repeats == 0 {
                    self.state = DtmfSendState::Idle;
                    self.tone = None;
                    self.pending.pop_front();
                    self.stops_requested = self.stops_requested.saturating_sub(1);
                }
                Some((event, false, base))
            }
        }
    }
}

/// A received telephone-event packet
#[derive(Debug, Clone, Copy)]
struct ReceivedEvent {
    payload: DtmfEventPayload,
    timestamp: RtpTimestamp,
    ssrc: RtpSsrc,
}

/// DTMF engine of a session
pub struct DtmfTransformEngine {
    sender: Mutex<DtmfSender>,
    payload_type: AtomicU8,
    clock_rate: AtomicU32,
    volume: u8,
    min_duration_ms: u64,
    max_duration_ms: Option<u64>,
    received: mpsc::Sender<ReceivedEvent>,
    shutdown: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DtmfTransformEngine {
    /// Create the engine and start its receive dispatcher on `runtime`
    pub fn new(runtime: &MediaRuntime, events: broadcast::Sender<MediaStreamEvent>) -> Self {
        let config = runtime.config();
        let (received, rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = runtime.spawn(dispatch_loop(rx, events, shutdown_rx));

        let min_duration_ms = config.dtmf_min_tone_duration_ms;
        let max_duration_ms = config.dtmf_max_tone_duration_ms.map(|max| max.max(min_duration_ms));

        Self {
            sender: Mutex::new(DtmfSender::new()),
            payload_type: AtomicU8::new(NO_PAYLOAD_TYPE),
            clock_rate: AtomicU32::new(8000),
            volume: config.dtmf_volume,
            min_duration_ms,
            max_duration_ms,
            received,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
            closed: AtomicBool::new(false),
        }
    }

    /// Negotiated telephone-event payload type
    pub fn set_payload_type(&self, payload_type: Option<u8>) {
        self.payload_type
            .store(payload_type.unwrap_or(NO_PAYLOAD_TYPE), Ordering::Relaxed);
    }

    pub fn payload_type(&self) -> Option<u8> {
        match self.payload_type.load(Ordering::Relaxed) {
            NO_PAYLOAD_TYPE => None,
            pt => Some(pt),
        }
    }

    /// Clock rate of the audio stream the events replace
    pub fn set_clock_rate(&self, clock_rate: u32) {
        if clock_rate > 0 {
            self.clock_rate.store(clock_rate, Ordering::Relaxed);
        }
    }

    /// Timestamp units per 20 ms packet
    fn spacing(&self) -> u32 {
        (self.clock_rate.load(Ordering::Relaxed) / 50).max(1)
    }

    /// Queue `tone`, stopping the tone currently playing
    pub fn start_sending(&self, tone: DtmfTone) -> Result<()> {
        if self.payload_type().is_none() {
            return Err(Error::DtmfNotNegotiated);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StreamClosed);
        }
        let clock_rate = self.clock_rate.load(Ordering::Relaxed);
        let mut sender = self.sender.lock();
        sender.min_duration = ms_to_rtp_units(self.min_duration_ms, clock_rate);
        sender.max_duration = self.max_duration_ms.map(|max| ms_to_rtp_units(max, clock_rate));
        sender.request_stop();
        sender.pending.push_back(tone);
        debug!("Queued DTMF tone {}", tone);
        Ok(())
    }

    /// Stop the oldest tone not yet stopped
    pub fn stop_sending(&self) {
        self.sender.lock().request_stop();
    }

    /// Wait for the receive dispatcher to exit; returns at once before close
    pub async fn join(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(handle) = self.dispatcher.lock().take() else {
            return;
        };
        if let Err(e) = handle.await {
            warn!("DTMF dispatcher failed: {}", e);
        }
    }

    pub fn send_state(&self) -> DtmfSendState {
        self.sender.lock().state
    }

    fn substitute(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(pt) = self.payload_type() else {
            return TransformOutcome::Continue;
        };
        if pkt.is_invalid_rtp() || pkt.payload_type() == pt {
            return TransformOutcome::Continue;
        }

        let next = self.sender.lock().next_packet(pkt.timestamp(), self.spacing());
        let Some((event, marker, timestamp)) = next else {
            return TransformOutcome::Continue;
        };
        let event = DtmfEventPayload {
            volume: self.volume,
            ..event
        };

        pkt.set_payload(&event.to_bytes());
        pkt.set_payload_type(pt);
        pkt.set_timestamp(timestamp);
        pkt.set_marker(marker);
        TransformOutcome::Continue
    }

    fn intercept(&self, pkt: &mut RawPacket) -> TransformOutcome {
        let Some(pt) = self.payload_type() else {
            return TransformOutcome::Continue;
        };
        if pkt.is_invalid_rtp() || pkt.payload_type() != pt {
            return TransformOutcome::Continue;
        }
        match DtmfEventPayload::parse(pkt.payload()) {
            Ok(payload) => {
                let event = ReceivedEvent {
                    payload,
                    timestamp: pkt.timestamp(),
                    ssrc: pkt.ssrc(),
                };
                if self.received.try_send(event).is_err() {
                    warn!("DTMF receive queue full, event dropped");
                }
            }
            Err(e) => debug!("Malformed telephone-event packet: {}", e),
        }
        TransformOutcome::Discard
    }
}

impl PacketTransformer for DtmfTransformEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.substitute(pkt)
    }

    fn reverse_transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        self.intercept(pkt)
    }
}

impl TransformEngine for DtmfTransformEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Dtmf
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<ReceivedEvent>,
    events: broadcast::Sender<MediaStreamEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_tone: Option<DtmfTone> = None;
    let mut last_start: Option<RtpTimestamp> = None;
    let mut last_end: Option<RtpTimestamp> = None;

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let Some(tone) = event.payload.tone() else {
            trace!("Ignoring telephone event {}", event.payload.event);
            continue;
        };

        if last_tone.is_none() && last_start != Some(event.timestamp) {
            last_tone = Some(tone);
            last_start = Some(event.timestamp);
            debug!("DTMF tone {} started", tone);
            let _ = events.send(MediaStreamEvent::DtmfToneStarted { tone, ssrc: event.ssrc });
        }

        if event.payload.end && last_end != Some(event.timestamp) && last_tone == Some(tone) {
            last_tone = None;
            last_end = Some(event.timestamp);
            debug!("DTMF tone {} ended", tone);
            let _ = events.send(MediaStreamEvent::DtmfToneEnded { tone, ssrc: event.ssrc });
        }
    }

    debug!("DTMF dispatcher finished");
}
