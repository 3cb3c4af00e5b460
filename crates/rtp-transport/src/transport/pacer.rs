use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Limits sending to `max_packets` in any window of `interval`
///
/// Keeps the send instants of the last `max_packets` packets; a new packet may
/// go out once the oldest of them is at least `interval` old.
#[derive(Debug)]
pub struct Pacer {
    max_packets: usize,
    interval: Duration,
    sent: VecDeque<Instant>,
}

impl Pacer {
    pub fn new(max_packets: usize, interval: Duration) -> Self {
        Self {
            max_packets: max_packets.max(1),
            interval,
            sent: VecDeque::with_capacity(max_packets),
        }
    }

    pub fn max_packets(&self) -> usize {
        self.max_packets
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Claim a send slot at `now`, or return how long to wait for one
    pub fn try_acquire(&mut self, now: Instant) -> Option<Duration> {
        if self.sent.len() >= self.max_packets {
            let oldest = self.sent[0];
            let elapsed = now.saturating_duration_since(oldest);
            if elapsed < self.interval {
                return Some(self.interval - elapsed);
            }
            self.sent.pop_front();
        }
        self.sent.push_back(now);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_limit() {
        let start = Instant::now();
        let mut pacer = Pacer::new(3, Duration::from_millis(100));

        assert_eq!(pacer.try_acquire(start), None);
        assert_eq!(pacer.try_acquire(start + Duration::from_millis(10)), None);
        assert_eq!(pacer.try_acquire(start + Duration::from_millis(20)), None);
        assert_eq!(
            pacer.try_acquire(start + Duration::from_millis(30)),
            Some(Duration::from_millis(70))
        );
        assert_eq!(pacer.try_acquire(start + Duration::from_millis(100)), None);
        assert_eq!(
            pacer.try_acquire(start + Duration::from_millis(100)),
            Some(Duration::from_millis(10))
        );
    }
}
