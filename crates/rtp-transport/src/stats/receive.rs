//! Per-source reception statistics (RFC 3550 A.1, A.3 and A.8)

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::packet::rtcp::{fraction_lost, NtpTimestamp, RtcpReportBlock};
use crate::time::duration_to_ntp_short;
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

const RTP_SEQ_MOD: u32 = 1 << 16;
const MAX_DROPOUT: u16 = 3000;
const MAX_MISORDER: u16 = 100;

/// Snapshot of one remote source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceStatistics {
    pub ssrc: RtpSsrc,
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Expected minus received, never negative
    pub packets_lost: u64,
    pub extended_highest_seq: u32,
    /// Interarrival jitter in timestamp units
    pub jitter: f64,
    pub clock_rate: u32,
}

#[derive(Debug)]
struct SourceState {
    clock_rate: u32,
    max_seq: u16,
    cycles: u32,
    base_seq: u32,
    bad_seq: u32,
    received: u64,
    bytes: u64,
    expected_prior: u64,
    received_prior: u64,
    transit: Option<i64>,
    jitter: f64,
    last_sr: u32,
    last_sr_at: Option<Instant>,
    last_packet_at: Instant,
}

impl SourceState {
    fn new(seq: RtpSequenceNumber, clock_rate: u32, now: Instant) -> Self {
        Self {
            clock_rate,
            max_seq: seq,
            cycles: 0,
            base_seq: seq as u32,
            bad_seq: RTP_SEQ_MOD + 1,
            received: 0,
            bytes: 0,
            expected_prior: 0,
            received_prior: 0,
            transit: None,
            jitter: 0.0,
            last_sr: 0,
            last_sr_at: None,
            last_packet_at: now,
        }
    }

    fn restart(&mut self, seq: RtpSequenceNumber) {
        self.max_seq = seq;
        self.cycles = 0;
        self.base_seq = seq as u32;
        self.bad_seq = RTP_SEQ_MOD + 1;
        self.received = 0;
        self.expected_prior = 0;
        self.received_prior = 0;
    }

    /// Returns false for packets that do not count as received
    fn update_seq(&mut self, seq: RtpSequenceNumber) -> bool {
        let udelta = seq.wrapping_sub(self.max_seq);
        if udelta < MAX_DROPOUT {
            if seq < self.max_seq {
                self.cycles = self.cycles.wrapping_add(RTP_SEQ_MOD);
            }
            self.max_seq = seq;
        } else if udelta as u32 <= RTP_SEQ_MOD - MAX_MISORDER as u32 {
            // large jump: accept only if the next packet confirms it
            if seq as u32 == self.bad_seq {
                self.restart(seq);
            } else {
                self.bad_seq = (seq as u32 + 1) & (RTP_SEQ_MOD - 1);
                return false;
            }
        }
        // otherwise a duplicate or reordered packet
        self.received += 1;
        true
    }

    fn update_jitter(&mut self, timestamp: RtpTimestamp, arrival: i64) {
        let transit = arrival - timestamp as i64;
        if let Some(last) = self.transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    fn extended_max(&self) -> u32 {
        self.cycles.wrapping_add(self.max_seq as u32)
    }

    fn expected(&self) -> u64 {
        (self.extended_max() as u64 + 1).saturating_sub(self.base_seq as u64)
    }

    fn lost(&self) -> i64 {
        self.expected() as i64 - self.received as i64
    }
}

/// Reception statistics of every remote source
#[derive(Debug)]
pub struct ReceiveStatistics {
    sources: Mutex<HashMap<RtpSsrc, SourceState>>,
    epoch: Instant,
}

impl ReceiveStatistics {
    pub fn new() -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    /// Account for a received RTP packet. Returns true for a new source.
    pub fn on_rtp(
        &self,
        ssrc: RtpSsrc,
        seq: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        clock_rate: u32,
        bytes: usize,
        now: Instant,
    ) -> bool {
        let mut sources = self.sources.lock();
        let mut added = false;
        let state = sources.entry(ssrc).or_insert_with(|| {
            added = true;
            SourceState::new(seq, clock_rate, now)
        });

        if !added && !state.update_seq(seq) {
            return false;
        }
        if added {
            state.received = 1;
        }
        state.bytes += bytes as u64;
        state.last_packet_at = now;

        if clock_rate > 0 {
            state.clock_rate = clock_rate;
            let elapsed = now.saturating_duration_since(self.epoch);
            let arrival = (elapsed.as_secs_f64() * clock_rate as f64) as i64;
            state.update_jitter(timestamp, arrival);
        }
        added
    }

    /// Remember a sender report for LSR/DLSR of our next report block
    pub fn on_sender_report(&self, ssrc: RtpSsrc, ntp: NtpTimestamp, now: Instant) {
        if let Some(state) = self.sources.lock().get_mut(&ssrc) {
            state.last_sr = ntp.to_ntp_short();
            state.last_sr_at = Some(now);
        }
    }

    /// Report blocks for every source, advancing the per-interval counters
    pub fn report_blocks(&self, now: Instant) -> Vec<RtcpReportBlock> {
        let mut sources = self.sources.lock();
        let mut blocks: Vec<RtcpReportBlock> = sources
            .iter_mut()
            .map(|(ssrc, state)| {
                let expected = state.expected();
                let expected_interval = expected.saturating_sub(state.expected_prior);
                let received_interval = state.received.saturating_sub(state.received_prior);
                state.expected_prior = expected;
                state.received_prior = state.received;
                let lost_interval = expected_interval as i64 - received_interval as i64;

                let delay = match state.last_sr_at {
                    Some(at) => duration_to_ntp_short(now.saturating_duration_since(at)),
                    None => 0,
                };

                RtcpReportBlock {
                    ssrc: *ssrc,
                    fraction_lost: fraction_lost(expected_interval.min(u32::MAX as u64) as u32, lost_interval),
                    cumulative_lost: (state.lost().clamp(-0x80_0000, 0x7F_FFFF) as i32 as u32) & 0x00FF_FFFF,
                    highest_seq: state.extended_max(),
                    jitter: state.jitter as u32,
                    last_sr: state.last_sr,
                    delay_since_last_sr: delay,
                }
            })
            .collect();
        // RTCP allows at most 31 blocks per packet
        blocks.truncate(31);
        blocks
    }

    pub fn source(&self, ssrc: RtpSsrc) -> Option<SourceStatistics> {
        self.sources.lock().get(&ssrc).map(|state| snapshot(ssrc, state))
    }

    pub fn sources(&self) -> Vec<SourceStatistics> {
        self.sources
            .lock()
            .iter()
            .map(|(ssrc, state)| snapshot(*ssrc, state))
            .collect()
    }

    /// Totals over all sources: (received, lost, bytes)
    pub fn totals(&self) -> (u64, u64, u64) {
        self.sources.lock().values().fold((0, 0, 0), |(r, l, b), s| {
            (r + s.received, l + s.lost().max(0) as u64, b + s.bytes)
        })
    }

    pub fn remove(&self, ssrc: RtpSsrc) -> bool {
        self.sources.lock().remove(&ssrc).is_some()
    }

    /// Drop sources silent for longer than `timeout`, returning their SSRCs
    pub fn expire(&self, timeout: Duration, now: Instant) -> Vec<RtpSsrc> {
        let mut expired = Vec::new();
        self.sources.lock().retain(|ssrc, state| {
            let keep = now.saturating_duration_since(state.last_packet_at) < timeout;
            if !keep {
                expired.push(*ssrc);
            }
            keep
        });
        expired
    }
}

impl Default for ReceiveStatistics {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot(ssrc: RtpSsrc, state: &SourceState) -> SourceStatistics {
    SourceStatistics {
        ssrc,
        packets_received: state.received,
        bytes_received: state.bytes,
        packets_lost: state.lost().max(0) as u64,
        extended_highest_seq: state.extended_max(),
        jitter: state.jitter,
        clock_rate: state.clock_rate,
    }
}
