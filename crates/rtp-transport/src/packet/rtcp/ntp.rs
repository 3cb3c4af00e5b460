use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the NTP epoch (1900) and the UNIX epoch (1970)
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// 64-bit NTP timestamp as carried in RTCP sender reports (RFC 3550)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct NtpTimestamp {
    /// Seconds since January 1, 1900
    pub seconds: u32,

    /// Fraction of a second in units of 2^-32 s
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Current wall clock
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self::from_duration_since_unix_epoch(now)
    }

    pub fn to_u64(&self) -> u64 {
        (self.seconds as u64) << 32 | (self.fraction as u64)
    }

    pub fn from_u64(value: u64) -> Self {
        Self {
            seconds: (value >> 32) as u32,
            fraction: value as u32,
        }
    }

    /// Middle 32 bits, the "NTP short" used for LSR in report blocks
    pub fn to_ntp_short(&self) -> u32 {
        ((self.seconds & 0x0000_FFFF) << 16) | (self.fraction >> 16)
    }

    pub fn to_duration_since_unix_epoch(&self) -> Duration {
        let seconds = (self.seconds as u64).saturating_sub(NTP_UNIX_OFFSET);
        let nanos = ((self.fraction as u64) * 1_000_000_000) >> 32;
        Duration::new(seconds, nanos as u32)
    }

    pub fn from_duration_since_unix_epoch(duration: Duration) -> Self {
        let seconds = duration.as_secs() + NTP_UNIX_OFFSET;
        let fraction = ((duration.subsec_nanos() as u64) << 32) / 1_000_000_000;
        Self {
            seconds: seconds as u32,
            fraction: fraction as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_recent() {
        // Jan 1, 2020 in NTP time
        assert!(NtpTimestamp::now().seconds > 3_786_825_600);
    }

    #[test]
    fn test_ntp_short_takes_middle_bits() {
        let ts = NtpTimestamp {
            seconds: 0x1234_5678,
            fraction: 0x9ABC_DEF0,
        };
        assert_eq!(ts.to_ntp_short(), 0x5678_9ABC);
        assert_eq!(NtpTimestamp::from_u64(ts.to_u64()), ts);
    }

    #[test]
    fn test_unix_conversion() {
        let duration = Duration::new(1_577_836_800, 500_000_000);
        let ts = NtpTimestamp::from_duration_since_unix_epoch(duration);
        assert_eq!(ts.seconds, 3_786_825_600);
        assert_eq!(ts.fraction, 0x8000_0000);

        let back = ts.to_duration_since_unix_epoch();
        assert_eq!(back.as_secs(), 1_577_836_800);
        assert!(back.subsec_nanos() > 499_000_000 && back.subsec_nanos() < 501_000_000);
    }
}
