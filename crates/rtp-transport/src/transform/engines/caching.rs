use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::packet::RawPacket;
use crate::transform::{EngineKind, PacketTransformer, TransformEngine, TransformOutcome};
use crate::{RtpSequenceNumber, RtpSsrc};

/// Packets kept when no size is given
pub const DEFAULT_CACHE_SIZE: usize = 512;

#[derive(Debug, Default)]
struct Cache {
    packets: HashMap<(RtpSsrc, RtpSequenceNumber), Vec<u8>>,
    order: VecDeque<(RtpSsrc, RtpSequenceNumber)>,
}

/// Keeps copies of recently sent RTP for retransmission
///
/// The oldest packet is evicted once `capacity` packets are cached.
#[derive(Debug)]
pub struct CachingEngine {
    capacity: usize,
    cache: Mutex<Cache>,
}

impl CachingEngine {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            cache: Mutex::new(Cache::default()),
        }
    }

    /// Bytes of the packet sent with `ssrc` and `seq`, if still cached
    pub fn get(&self, ssrc: RtpSsrc, seq: RtpSequenceNumber) -> Option<RawPacket> {
        self.cache
            .lock()
            .packets
            .get(&(ssrc, seq))
            .map(|data| RawPacket::from_slice(data))
    }

    pub fn len(&self) -> usize {
        self.cache.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut cache = self.cache.lock();
        cache.packets.clear();
        cache.order.clear();
    }
}

impl Default for CachingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl PacketTransformer for CachingEngine {
    fn transform(&self, pkt: &mut RawPacket) -> TransformOutcome {
        if pkt.is_invalid_rtp() {
            return TransformOutcome::Continue;
        }
        let key = (pkt.ssrc(), pkt.sequence_number());
        let mut cache = self.cache.lock();
        if cache.packets.insert(key, pkt.data().to_vec()).is_none() {
            cache.order.push_back(key);
        }
        while cache.order.len() > self.capacity {
            if let Some(old) = cache.order.pop_front() {
                cache.packets.remove(&old);
            }
        }
        TransformOutcome::Continue
    }

    fn reverse_transform(&self, _pkt: &mut RawPacket) -> TransformOutcome {
        TransformOutcome::Continue
    }

    fn close(&self) {
        self.clear();
    }
}

impl TransformEngine for CachingEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Caching
    }

    fn rtp_transformer(&self) -> Option<&dyn PacketTransformer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_rtp_packet;

    #[test]
    fn test_evicts_oldest() {
        let engine = CachingEngine::new(2);
        for seq in 1..=3 {
            let mut pkt = build_rtp_packet(96, false, seq, 0, 5, &[seq as u8]);
            engine.transform(&mut pkt);
        }
        assert_eq!(engine.len(), 2);
        assert!(engine.get(5, 1).is_none());
        assert_eq!(engine.get(5, 3).unwrap().payload(), &[3]);

        TransformEngine::close(&engine);
        assert!(engine.is_empty());
    }
}
