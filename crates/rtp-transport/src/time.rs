//! Time and clock utilities for RTP
//!
//! RTCP carries round-trip information in the 32-bit "NTP short" format: the
//! middle 32 bits of a 64-bit NTP timestamp, i.e. 16.16 fixed point seconds.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::packet::rtcp::NtpTimestamp;

/// Units of NTP short time per second
pub const NTP_SHORT_UNITS_PER_SECOND: f64 = 65536.0;

/// Current wall clock as NTP short
pub fn ntp_short_now() -> u32 {
    NtpTimestamp::now().to_ntp_short()
}

/// Convert an NTP short interval to milliseconds
pub fn ntp_short_to_ms(value: u32) -> f64 {
    value as f64 * 1000.0 / NTP_SHORT_UNITS_PER_SECOND
}

/// Convert milliseconds to an NTP short interval
pub fn ms_to_ntp_short(ms: f64) -> u32 {
    (ms * NTP_SHORT_UNITS_PER_SECOND / 1000.0).round() as u32
}

/// Convert a duration to an NTP short interval (used for DLSR)
pub fn duration_to_ntp_short(duration: Duration) -> u32 {
    let units = duration.as_secs_f64() * NTP_SHORT_UNITS_PER_SECOND;
    units.min(u32::MAX as f64) as u32
}

/// Convert RTP timestamp units to a duration at a given clock rate
pub fn rtp_timestamp_to_duration(timestamp: u32, clock_rate: u32) -> Duration {
    if clock_rate == 0 {
        return Duration::from_secs(0);
    }

    let seconds = timestamp / clock_rate;
    let remainder = timestamp % clock_rate;
    let nanos = ((remainder as u64) * 1_000_000_000) / (clock_rate as u64);

    Duration::new(seconds as u64, nanos as u32)
}

/// Convert a duration to RTP timestamp units at a given clock rate
pub fn duration_to_rtp_timestamp(duration: Duration, clock_rate: u32) -> u32 {
    let seconds = duration.as_secs();
    let nanos = duration.subsec_nanos();

    let whole = seconds * (clock_rate as u64);
    let fraction = ((nanos as u64) * (clock_rate as u64)) / 1_000_000_000;

    (whole + fraction) as u32
}

/// Convert a number of milliseconds to RTP timestamp units
pub fn ms_to_rtp_units(ms: u64, clock_rate: u32) -> u64 {
    ms * clock_rate as u64 / 1000
}

/// Milliseconds elapsed since the UNIX epoch
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// Typical clock rates
pub mod clock_rates {
    /// G.711, G.729, telephone-event (8kHz)
    pub const AUDIO_8KHZ: u32 = 8000;

    /// G.722 (16kHz)
    pub const AUDIO_16KHZ: u32 = 16000;

    /// Opus (48kHz)
    pub const AUDIO_48KHZ: u32 = 48000;

    /// Video (90kHz)
    pub const VIDEO_90KHZ: u32 = 90000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_short_conversions() {
        assert_eq!(ms_to_ntp_short(1000.0), 65536);
        assert!((ntp_short_to_ms(65536) - 1000.0).abs() < 1e-9);
        assert!((ntp_short_to_ms(ms_to_ntp_short(250.0)) - 250.0).abs() < 0.02);
        assert_eq!(duration_to_ntp_short(Duration::from_millis(500)), 32768);
    }

    #[test]
    fn test_rtp_timestamp_conversion() {
        let ts = duration_to_rtp_timestamp(Duration::from_millis(125), 8000);
        assert_eq!(ts, 1000);
        assert_eq!(rtp_timestamp_to_duration(ts, 8000).as_millis(), 125);
        assert_eq!(rtp_timestamp_to_duration(1, 0), Duration::from_secs(0));
        assert_eq!(ms_to_rtp_units(70, 8000), 560);
    }
}
