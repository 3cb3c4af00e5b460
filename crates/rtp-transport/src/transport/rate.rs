use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Sliding window byte counter
#[derive(Debug)]
pub struct RateStatistics {
    window: Duration,
    samples: VecDeque<(Instant, usize)>,
    total: usize,
}

impl RateStatistics {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms.max(1)),
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Record `bytes` sent at `now`
    pub fn update(&mut self, bytes: usize, now: Instant) {
        self.evict(now);
        self.samples.push_back((now, bytes));
        self.total += bytes;
    }

    /// Rate over the window in bits per second
    pub fn rate(&mut self, now: Instant) -> u64 {
        self.evict(now);
        (self.total as u64 * 8 * 1000) / self.window.as_millis() as u64
    }

    fn evict(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.saturating_duration_since(at) < self.window {
                break;
            }
            self.samples.pop_front();
            self.total -= bytes;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut stats = RateStatistics::new(1000);
        for i in 0..10 {
            stats.update(125, start + Duration::from_millis(i * 100));
        }
        // 1250 bytes in one second
        assert_eq!(stats.rate(start + Duration::from_millis(950)), 10_000);
        // the first five samples fell out of the window
        assert_eq!(stats.rate(start + Duration::from_millis(1450)), 5_000);
        assert_eq!(stats.rate(start + Duration::from_secs(10)), 0);
    }
}
