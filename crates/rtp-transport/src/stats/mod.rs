//! Stream statistics
//!
//! [`MediaStreamStats`] turns packet counters and RTCP feedback into the
//! figures a session exposes: per direction jitter, loss and bitrate, and the
//! round trip time. Loss and bitrate are smoothed with [`compute_ewma`],
//! weighted by the number of packets (steps) since the previous update.
//!
//! Received feedback describes what the peer got from us, so it updates the
//! upload side; the reports we send describe what we got, so they update the
//! download side.

mod engine;
mod receive;

pub use engine::{KeyframeHandler, StatisticsEngine};
pub use receive::{ReceiveStatistics, SourceStatistics};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::packet::rtcp::RtcpReportBlock;
use crate::time::ntp_short_to_ms;
use crate::RtpSsrc;

/// Entries kept in the SR emission table
pub const EMISSION_TABLE_CAPACITY: usize = 100;

/// Exponentially weighted moving average
///
/// The average moves `min(1, coefficient * steps)` of the way from `last`
/// to `new`.
pub fn compute_ewma(steps: u64, last: f64, new: f64, coefficient: f64) -> f64 {
    let c = (coefficient * steps as f64).min(1.0);
    last * (1.0 - c) + new * c
}

/// Percentage of `lost` in `lost_and_received`, 0 when nothing was expected
pub fn compute_percent_loss(lost_and_received: u64, lost: u64) -> f64 {
    if lost_and_received == 0 {
        0.0
    } else {
        100.0 * lost as f64 / lost_and_received as f64
    }
}

/// Bitrate in kbit/s of `bytes` over `interval_ms`
pub fn compute_rate_kbps(bytes: u64, interval_ms: u64) -> f64 {
    if interval_ms == 0 {
        0.0
    } else {
        bytes as f64 * 8.0 / interval_ms as f64
    }
}

/// Min/max/average of reported jitter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JitterSummary {
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub count: u64,
}

impl JitterSummary {
    fn add(&mut self, jitter_ms: f64) {
        if self.count == 0 {
            self.min_ms = jitter_ms;
            self.max_ms = jitter_ms;
        } else {
            self.min_ms = self.min_ms.min(jitter_ms);
            self.max_ms = self.max_ms.max(jitter_ms);
        }
        self.avg_ms = (self.avg_ms * self.count as f64 + jitter_ms) / (self.count + 1) as f64;
        self.count += 1;
    }
}

/// Figures of one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DirectionStats {
    pub packets: u64,
    pub bytes: u64,
    pub lost: u64,
    /// Smoothed loss in percent
    pub loss_percent: f64,
    /// Smoothed bitrate in kbit/s
    pub rate_kbps: f64,
    /// Latest jitter in milliseconds
    pub jitter_ms: f64,
}

/// Snapshot of [`MediaStreamStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StreamStatsSnapshot {
    pub download: DirectionStats,
    pub upload: DirectionStats,
    pub rtt_ms: Option<f64>,
    pub received_report_jitter: JitterSummary,
    pub sent_report_jitter: JitterSummary,
    pub discarded_percent: f64,
    pub remb_bitrate: Option<u64>,
    pub nacks_received: u64,
    pub tcc_packets_received: u64,
    pub fec_packets_received: u64,
    pub rtcp_packets_sent: u64,
    pub rtcp_bytes_sent: u64,
    pub rtcp_packets_received: u64,
    pub rtcp_bytes_received: u64,
}

/// Insertion ordered, bounded map of SR NTP short to local emission time
#[derive(Debug, Default)]
struct EmissionTable {
    times: HashMap<u32, u32>,
    order: VecDeque<u32>,
}

impl EmissionTable {
    fn insert(&mut self, sr_ntp_short: u32, emitted_at: u32) {
        if self.times.insert(sr_ntp_short, emitted_at).is_none() {
            self.order.push_back(sr_ntp_short);
            if self.order.len() > EMISSION_TABLE_CAPACITY {
                if let Some(oldest) = self.order.pop_front() {
                    self.times.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, sr_ntp_short: u32) -> Option<u32> {
        self.times.get(&sr_ntp_short).copied()
    }
}

#[derive(Debug)]
struct Counters {
    packets: u64,
    bytes: u64,
    lost: u64,
}

#[derive(Debug)]
struct StatsState {
    download: DirectionStats,
    upload: DirectionStats,
    rtt_ms: Option<f64>,
    received_report_jitter: JitterSummary,
    sent_report_jitter: JitterSummary,
    discarded_percent: f64,
    remb_bitrate: Option<u64>,
    last_update: Instant,
    last_download: Counters,
    last_upload: Counters,
    last_discarded: u64,
    /// Packets sent when the previous report about us arrived
    upload_packets_at_report: u64,
    emission: EmissionTable,
    invalid_rtt: u64,
}

/// Statistics of one media stream
#[derive(Debug)]
pub struct MediaStreamStats {
    receive: Arc<ReceiveStatistics>,
    state: Mutex<StatsState>,
    local_ssrc: AtomicU64,
    clock_rate: AtomicU32,
    ewma_coefficient: f64,
    nominal_interval: Duration,
    max_valid_rtt_ms: f64,
    translator: bool,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_discarded: AtomicU64,
    nacks_received: AtomicU64,
    tcc_packets_received: AtomicU64,
    fec_packets_received: AtomicU64,
    rtcp_packets_sent: AtomicU64,
    rtcp_bytes_sent: AtomicU64,
    rtcp_packets_received: AtomicU64,
    rtcp_bytes_received: AtomicU64,
}

const NO_SSRC: u64 = u64::MAX;

impl MediaStreamStats {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            receive: Arc::new(ReceiveStatistics::new()),
            state: Mutex::new(StatsState {
                download: DirectionStats::default(),
                upload: DirectionStats::default(),
                rtt_ms: None,
                received_report_jitter: JitterSummary::default(),
                sent_report_jitter: JitterSummary::default(),
                discarded_percent: 0.0,
                remb_bitrate: None,
                last_update: Instant::now(),
                last_download: Counters { packets: 0, bytes: 0, lost: 0 },
                last_upload: Counters { packets: 0, bytes: 0, lost: 0 },
                last_discarded: 0,
                upload_packets_at_report: 0,
                emission: EmissionTable::default(),
                invalid_rtt: 0,
            }),
            local_ssrc: AtomicU64::new(NO_SSRC),
            clock_rate: AtomicU32::new(8000),
            ewma_coefficient: config.ewma_step_coefficient,
            nominal_interval: Duration::from_millis(config.nominal_packet_interval_ms.max(1)),
            max_valid_rtt_ms: config.max_valid_rtt_ms as f64,
            translator: config.translator_mode,
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_discarded: AtomicU64::new(0),
            nacks_received: AtomicU64::new(0),
            tcc_packets_received: AtomicU64::new(0),
            fec_packets_received: AtomicU64::new(0),
            rtcp_packets_sent: AtomicU64::new(0),
            rtcp_bytes_sent: AtomicU64::new(0),
            rtcp_packets_received: AtomicU64::new(0),
            rtcp_bytes_received: AtomicU64::new(0),
        }
    }

    pub fn receive_statistics(&self) -> &Arc<ReceiveStatistics> {
        &self.receive
    }

    /// SSRC whose report blocks describe our upload
    pub fn set_local_ssrc(&self, ssrc: RtpSsrc) {
        self.local_ssrc.store(ssrc as u64, Ordering::Relaxed);
    }

    fn local_ssrc(&self) -> Option<RtpSsrc> {
        match self.local_ssrc.load(Ordering::Relaxed) {
            NO_SSRC => None,
            ssrc => Some(ssrc as RtpSsrc),
        }
    }

    /// Clock rate used to convert reported jitter to milliseconds
    pub fn set_clock_rate(&self, clock_rate: u32) {
        if clock_rate > 0 {
            self.clock_rate.store(clock_rate, Ordering::Relaxed);
        }
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate.load(Ordering::Relaxed)
    }

    fn jitter_to_ms(&self, jitter: u32) -> f64 {
        jitter as f64 * 1000.0 / self.clock_rate() as f64
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nack(&self) {
        self.nacks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcc(&self) {
        self.tcc_packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fec(&self) {
        self.fec_packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rtcp_sent(&self, bytes: usize) {
        self.rtcp_packets_sent.fetch_add(1, Ordering::Relaxed);
        self.rtcp_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_rtcp_received(&self, bytes: usize) {
        self.rtcp_packets_received.fetch_add(1, Ordering::Relaxed);
        self.rtcp_bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn set_remb_bitrate(&self, bitrate: u64) {
        self.state.lock().remb_bitrate = Some(bitrate);
    }

    /// Remember when a sender report with `sr_ntp_short` left this host
    pub fn record_sender_report_emission(&self, sr_ntp_short: u32, emitted_at: u32) {
        self.state.lock().emission.insert(sr_ntp_short, emitted_at);
    }

    /// Process a report block received from the peer
    ///
    /// Blocks about our own SSRC update the upload figures and, when LSR and
    /// DLSR are set, the RTT. Returns the RTT computed from this block.
    pub fn on_received_report_block(&self, block: &RtcpReportBlock, now_ntp_short: u32) -> Option<f64> {
        let jitter_ms = self.jitter_to_ms(block.jitter);
        let mut state = self.state.lock();
        state.received_report_jitter.add(jitter_ms);

        if self.local_ssrc().is_some_and(|ssrc| ssrc != block.ssrc) {
            return None;
        }

        state.upload.jitter_ms = jitter_ms;
        let sent = self.packets_sent.load(Ordering::Relaxed);
        let steps = sent.saturating_sub(state.upload_packets_at_report).max(1);
        state.upload_packets_at_report = sent;
        state.upload.loss_percent = compute_ewma(
            steps,
            state.upload.loss_percent,
            block.fraction_lost_percent(),
            self.ewma_coefficient,
        );
        state.upload.lost = block.cumulative_lost as u64;

        let rtt = self.compute_rtt(&mut state, block.last_sr, block.delay_since_last_sr, now_ntp_short);
        if let Some(rtt) = rtt {
            state.rtt_ms = Some(rtt);
        }
        rtt
    }

    /// RTT from LSR and DLSR, `None` when unavailable or out of bounds
    fn compute_rtt(&self, state: &mut StatsState, lsr: u32, dlsr: u32, now: u32) -> Option<f64> {
        if lsr == 0 || dlsr == 0 {
            return None;
        }
        let lsr = if self.translator {
            match state.emission.get(lsr) {
                Some(emitted) => emitted,
                None => {
                    debug!("No emission time for LSR {:08x}", lsr);
                    return None;
                }
            }
        } else {
            lsr
        };

        let rtt = now.wrapping_sub(lsr).wrapping_sub(dlsr) as i32;
        let rtt_ms = if rtt < 0 { -1.0 } else { ntp_short_to_ms(rtt as u32) };
        if rtt_ms < 0.0 || rtt_ms >= self.max_valid_rtt_ms {
            state.invalid_rtt += 1;
            let n = state.invalid_rtt;
            if n == 1 || n % 100 == 0 {
                warn!(
                    "Ignoring invalid RTT (now={:08x} lsr={:08x} dlsr={:08x}, {} so far)",
                    now, lsr, dlsr, n
                );
            }
            return None;
        }
        Some(rtt_ms)
    }

    /// Process a report block we are about to send about a remote source
    pub fn on_sent_report_block(&self, block: &RtcpReportBlock) {
        let jitter_ms = self.jitter_to_ms(block.jitter);
        let mut state = self.state.lock();
        state.sent_report_jitter.add(jitter_ms);
        state.download.jitter_ms = jitter_ms;
    }

    /// Periodic update of loss, bitrate and discard figures
    ///
    /// Must be called regularly even without traffic: when no packets moved,
    /// the elapsed time divided by the nominal packet interval is used as the
    /// step count, so the averages keep decaying.
    pub fn update_stats(&self, now: Instant) {
        let (received, lost, received_bytes) = self.receive.totals();
        let sent = self.packets_sent.load(Ordering::Relaxed);
        let sent_bytes = self.bytes_sent.load(Ordering::Relaxed);
        let discarded = self.packets_discarded.load(Ordering::Relaxed);

        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_update);
        if elapsed.is_zero() {
            return;
        }
        let elapsed_ms = elapsed.as_millis() as u64;
        let silent_steps = (elapsed.as_nanos() / self.nominal_interval.as_nanos()) as u64;
        let c = self.ewma_coefficient;

        // download
        let new_received = received.saturating_sub(state.last_download.packets);
        let new_lost = lost.saturating_sub(state.last_download.lost);
        let new_bytes = received_bytes.saturating_sub(state.last_download.bytes);
        let steps = match new_received + new_lost {
            0 => silent_steps,
            n => n,
        };
        let loss = compute_percent_loss(new_received + new_lost, new_lost);
        state.download.loss_percent = compute_ewma(steps, state.download.loss_percent, loss, c);
        let rate = compute_rate_kbps(new_bytes, elapsed_ms);
        state.download.rate_kbps = compute_ewma(steps, state.download.rate_kbps, rate, c);

        let discarded_new = discarded.saturating_sub(state.last_discarded);
        let discarded_pct = compute_percent_loss(new_received + discarded_new, discarded_new);
        state.discarded_percent = compute_ewma(steps, state.discarded_percent, discarded_pct, c);

        state.download.packets = received;
        state.download.bytes = received_bytes;
        state.download.lost = lost;
        state.last_download = Counters {
            packets: received,
            bytes: received_bytes,
            lost,
        };
        state.last_discarded = discarded;

        // upload
        let new_sent = sent.saturating_sub(state.last_upload.packets);
        let new_sent_bytes = sent_bytes.saturating_sub(state.last_upload.bytes);
        let steps = match new_sent {
            0 => silent_steps,
            n => n,
        };
        let rate = compute_rate_kbps(new_sent_bytes, elapsed_ms);
        state.upload.rate_kbps = compute_ewma(steps, state.upload.rate_kbps, rate, c);
        state.upload.packets = sent;
        state.upload.bytes = sent_bytes;
        state.last_upload = Counters {
            packets: sent,
            bytes: sent_bytes,
            lost: 0,
        };

        state.last_update = now;
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.state.lock().rtt_ms
    }

    pub fn snapshot(&self) -> StreamStatsSnapshot {
        let state = self.state.lock();
        StreamStatsSnapshot {
            download: state.download,
            upload: state.upload,
            rtt_ms: state.rtt_ms,
            received_report_jitter: state.received_report_jitter,
            sent_report_jitter: state.sent_report_jitter,
            discarded_percent: state.discarded_percent,
            remb_bitrate: state.remb_bitrate,
            nacks_received: self.nacks_received.load(Ordering::Relaxed),
            tcc_packets_received: self.tcc_packets_received.load(Ordering::Relaxed),
            fec_packets_received: self.fec_packets_received.load(Ordering::Relaxed),
            rtcp_packets_sent: self.rtcp_packets_sent.load(Ordering::Relaxed),
            rtcp_bytes_sent: self.rtcp_bytes_sent.load(Ordering::Relaxed),
            rtcp_packets_received: self.rtcp_packets_received.load(Ordering::Relaxed),
            rtcp_bytes_received: self.rtcp_bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Packets and payload octets sent, for sender reports
    pub fn sent_counters(&self) -> (u64, u64) {
        (
            self.packets_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
        )
    }
}
