//! Local SSRC generation policy

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::RtpSsrc;

/// Returned when the stream owning the SSRC is being removed
pub const SSRC_REMOVED: RtpSsrc = u32::MAX;

/// Why a new SSRC is needed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrcCause {
    /// The session is allocating its first SSRC
    SessionStart,
    /// Another source uses our SSRC
    Collision,
    /// Signaling asked for a fresh source
    Renegotiation,
    /// The send stream goes away and its SSRC must not be reused
    StreamRemoved,
}

/// Hands out local SSRCs
///
/// The first call returns the configured initial SSRC, if any, so a
/// session can keep the value agreed in signaling across reconnects.
#[derive(Debug)]
pub struct SsrcGenerator {
    initial: Mutex<Option<RtpSsrc>>,
}

impl SsrcGenerator {
    pub fn new(initial: Option<RtpSsrc>) -> Self {
        Self {
            initial: Mutex::new(initial),
        }
    }

    pub fn generate(&self, cause: SsrcCause) -> RtpSsrc {
        if let Some(ssrc) = self.initial.lock().take() {
            debug!("Using initial SSRC {:08x} ({:?})", ssrc, cause);
            return ssrc;
        }
        if cause == SsrcCause::StreamRemoved {
            return SSRC_REMOVED;
        }
        random_ssrc()
    }
}

impl Default for SsrcGenerator {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Random SSRC, never equal to [`SSRC_REMOVED`]
pub fn random_ssrc() -> RtpSsrc {
    let mut rng = rand::thread_rng();
    loop {
        let ssrc: u32 = rng.gen();
        if ssrc != SSRC_REMOVED {
            return ssrc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value_first() {
        let generator = SsrcGenerator::new(Some(0x1234_5678));
        assert_eq!(generator.generate(SsrcCause::SessionStart), 0x1234_5678);
        assert_ne!(generator.generate(SsrcCause::Collision), 0x1234_5678);
    }

    #[test]
    fn test_stream_removed_sentinel() {
        let generator = SsrcGenerator::default();
        assert_eq!(generator.generate(SsrcCause::StreamRemoved), SSRC_REMOVED);
        assert_ne!(generator.generate(SsrcCause::Renegotiation), SSRC_REMOVED);
    }

    #[test]
    fn test_random_values_not_sequential() {
        let generator = SsrcGenerator::default();
        let values: Vec<u32> = (0..10_000).map(|_| generator.generate(SsrcCause::Collision)).collect();

        let increasing = values.windows(2).filter(|w| w[1] > w[0]).count();
        let consecutive = values.windows(2).filter(|w| w[1] == w[0].wrapping_add(1)).count();
        // roughly half the pairs increase for a uniform source
        assert!(increasing > 4_500 && increasing < 5_500, "increasing pairs: {increasing}");
        assert_eq!(consecutive, 0);
        assert!(!values.contains(&SSRC_REMOVED));
    }
}
