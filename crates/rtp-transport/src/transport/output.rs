//! Output stream with optional send queue and pacing
//!
//! In queued mode `write` copies the bytes into a pooled packet and returns;
//! a send task drains the bounded queue, applies the pacer and fans each
//! packet out to every target. When the queue is full the oldest entry is
//! dropped. In synchronous mode packets are sent from the caller's task.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::pacer::Pacer;
use super::rate::RateStatistics;
use super::socket::{SocketWriter, StreamChannel};
use crate::config::MediaRuntime;
use crate::error::Error;
use crate::packet::{PacketPool, RawPacket};
use crate::transform::PacketTransformer;
use crate::Result;

/// Counters of an output stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStreamStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub packets_failed: u64,
    pub packets_discarded: u64,
}

/// A queued packet and whether the transformer still has to run on it
struct QueuedPacket {
    pkt: RawPacket,
    transform: bool,
}

struct SendQueue {
    items: Mutex<VecDeque<QueuedPacket>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl SendQueue {
    /// Push, dropping the oldest entry when full
    fn push(&self, item: QueuedPacket) -> Option<QueuedPacket> {
        let mut items = self.items.lock();
        let dropped = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<QueuedPacket> {
        self.items.lock().pop_front()
    }
}

/// Whether the n-th dropped packet gets a log line
fn log_drop(n: u64) -> bool {
    n == 1 || (n <= 1000 && n % 100 == 0) || n % 1000 == 0
}

struct OutputInner {
    channel: StreamChannel,
    runtime: MediaRuntime,
    writer: SocketWriter,
    pool: Arc<PacketPool>,
    targets: RwLock<Vec<SocketAddr>>,
    transformer: RwLock<Option<Arc<dyn PacketTransformer>>>,
    queue: Option<SendQueue>,
    pacer: Mutex<Option<Pacer>>,
    bitrate: Mutex<RateStatistics>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    enabled: AtomicBool,
    closed: AtomicBool,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_failed: AtomicU64,
    packets_discarded: AtomicU64,
    send_attempts: AtomicU64,
}

/// Output stream of one socket
pub struct OutputStream {
    inner: Arc<OutputInner>,
}

impl OutputStream {
    pub(crate) fn new(
        channel: StreamChannel,
        writer: SocketWriter,
        pool: Arc<PacketPool>,
        runtime: MediaRuntime,
    ) -> Self {
        let config = runtime.config().clone();
        let queue = config.use_send_thread.then(|| SendQueue {
            items: Mutex::new(VecDeque::with_capacity(config.packet_queue_capacity.min(64))),
            capacity: config.packet_queue_capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        let pacer = match (config.use_send_thread, config.max_packets_per_interval) {
            (true, Some(max)) if max > 0 => Some(Pacer::new(max, Duration::from_millis(config.pacing_interval_ms))),
            _ => None,
        };
        let (shutdown, _) = watch::channel(false);

        let stream = Self {
            inner: Arc::new(OutputInner {
                channel,
                runtime,
                writer,
                pool,
                targets: RwLock::new(Vec::new()),
                transformer: RwLock::new(None),
                queue,
                pacer: Mutex::new(pacer),
                bitrate: Mutex::new(RateStatistics::new(config.average_bitrate_window_ms)),
                task: Mutex::new(None),
                shutdown,
                enabled: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                packets_sent: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                packets_failed: AtomicU64::new(0),
                packets_discarded: AtomicU64::new(0),
                send_attempts: AtomicU64::new(0),
            }),
        };

        if stream.inner.queue.is_some() {
            let inner = stream.inner.clone();
            let shutdown = stream.inner.shutdown.subscribe();
            let task = stream.inner.runtime.spawn(send_loop(inner, shutdown));
            *stream.inner.task.lock() = Some(task);
        }
        stream
    }

    pub fn channel(&self) -> StreamChannel {
        self.inner.channel
    }

    /// Whether packets go through the send task
    pub fn is_queued(&self) -> bool {
        self.inner.queue.is_some()
    }

    /// Add a destination. Adding an existing one is a no-op.
    pub fn add_target(&self, target: SocketAddr) -> Result<()> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        let mut targets = self.inner.targets.write();
        if !targets.contains(&target) {
            targets.push(target);
            debug!("Added {} target {}", self.inner.channel, target);
        }
        Ok(())
    }

    /// Remove a destination. Returns whether it was present.
    pub fn remove_target(&self, target: SocketAddr) -> bool {
        let mut targets = self.inner.targets.write();
        let before = targets.len();
        targets.retain(|t| *t != target);
        targets.len() != before
    }

    pub fn remove_targets(&self) {
        self.inner.targets.write().clear();
    }

    pub fn targets(&self) -> Vec<SocketAddr> {
        self.inner.targets.read().clone()
    }

    /// Set the forward transformer applied before sending
    pub fn set_transformer(&self, transformer: Option<Arc<dyn PacketTransformer>>) {
        *self.inner.transformer.write() = transformer;
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.inner.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!("{} output stream {}", self.inner.channel, if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Limit the send task to `max_packets` per `per_millis` milliseconds
    ///
    /// `max_packets == 0` removes the limit. Returns `Ok(false)` when the
    /// stream has no send task to pace.
    pub fn set_max_packets_per_millis(&self, max_packets: usize, per_millis: u64) -> Result<bool> {
        if self.inner.queue.is_none() {
            return Ok(false);
        }
        let mut pacer = self.inner.pacer.lock();
        if max_packets == 0 {
            *pacer = None;
            return Ok(true);
        }
        if per_millis < 1 {
            return Err(Error::ConfigError(format!("per_millis must be at least 1, got {}", per_millis)));
        }
        *pacer = Some(Pacer::new(max_packets, Duration::from_millis(per_millis)));
        Ok(true)
    }

    /// Write `data` as one packet
    ///
    /// Returns once the packet is queued (queued mode) or sent (synchronous
    /// mode). A disabled stream accepts and discards the data.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !self.is_enabled() {
            return Ok(data.len());
        }
        let pkt = self.inner.pool.acquire_with(data);
        match &self.inner.queue {
            Some(_) => self.inner.enqueue(QueuedPacket { pkt, transform: true }),
            None => self.inner.send_packet(pkt, true).await,
        }
        Ok(data.len())
    }

    /// Write `data` bypassing the queue
    pub async fn sync_write(&self, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !self.is_enabled() {
            return Ok(data.len());
        }
        let pkt = self.inner.pool.acquire_with(data);
        self.inner.send_packet(pkt, true).await;
        Ok(data.len())
    }

    /// Send a packet that already went through the transform chain
    pub async fn send_transformed(&self, pkt: RawPacket) -> Result<()> {
        if let Err(e) = self.check_open() {
            self.inner.pool.release(pkt);
            return Err(e);
        }
        self.inner.send_packet(pkt, false).await;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::StreamClosed)
        } else {
            Ok(())
        }
    }

    /// Output bitrate in bits per second over the averaging window
    pub fn output_bitrate(&self, now: Instant) -> u64 {
        self.inner.bitrate.lock().rate(now)
    }

    /// Packets waiting in the send queue
    pub fn queued(&self) -> usize {
        self.inner.queue.as_ref().map_or(0, |q| q.items.lock().len())
    }

    pub fn stats(&self) -> OutputStreamStats {
        let i = &self.inner;
        OutputStreamStats {
            packets_sent: i.packets_sent.load(Ordering::Relaxed),
            bytes_sent: i.bytes_sent.load(Ordering::Relaxed),
            packets_dropped: i.queue.as_ref().map_or(0, |q| q.dropped.load(Ordering::Relaxed)),
            packets_failed: i.packets_failed.load(Ordering::Relaxed),
            packets_discarded: i.packets_discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop the send task and release queued packets
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        if let Some(queue) = &self.inner.queue {
            queue.notify.notify_one();
            let drained: Vec<_> = queue.items.lock().drain(..).collect();
            for item in drained {
                self.inner.pool.release(item.pkt);
            }
        }
        self.remove_targets();
        debug!("Closed {} output stream", self.inner.channel);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait for the send task to finish after `close`
    pub async fn join(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("channel", &self.inner.channel)
            .field("queued", &self.is_queued())
            .field("targets", &self.targets())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl OutputInner {
    fn enqueue(&self, item: QueuedPacket) {
        let Some(queue) = &self.queue else {
            self.pool.release(item.pkt);
            return;
        };
        if let Some(dropped) = queue.push(item) {
            self.pool.release(dropped.pkt);
            let n = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if log_drop(n) {
                warn!("{} send queue full, dropped oldest packet ({} dropped so far)", self.channel, n);
            }
        }
    }

    async fn send_packet(&self, mut pkt: RawPacket, transform: bool) {
        if transform {
            let transformer = self.transformer.read().clone();
            if let Some(transformer) = transformer {
                if transformer.transform(&mut pkt).is_discard() {
                    self.packets_discarded.fetch_add(1, Ordering::Relaxed);
                    self.pool.release(pkt);
                    return;
                }
            }
        }

        let attempt = self.send_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let mut failed = false;

        if self.writer.is_connected() {
            // connection oriented: the peer is fixed
            if let Err(e) = self.writer.send_to(pkt.data(), unspecified()).await {
                failed = true;
                if attempt % 100 == 1 {
                    warn!("Failed to send {} packet over TCP: {}", self.channel, e);
                }
            }
        } else {
            let targets = self.targets.read().clone();
            if targets.is_empty() {
                trace!("No {} targets, packet not sent", self.channel);
            }
            for target in targets {
                if let Err(e) = self.writer.send_to(pkt.data(), target).await {
                    failed = true;
                    if attempt % 100 == 1 {
                        warn!("Failed to send {} packet #{} to {}: {}", self.channel, attempt, target, e);
                    }
                }
            }
        }

        if failed {
            self.packets_failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent.fetch_add(pkt.len() as u64, Ordering::Relaxed);
        }
        self.bitrate.lock().update(pkt.len(), Instant::now());
        self.pool.release(pkt);
    }

    /// Wait until the pacer grants a send slot
    async fn pace(&self) {
        loop {
            let wait = match self.pacer.lock().as_mut() {
                Some(pacer) => pacer.try_acquire(Instant::now()),
                None => None,
            };
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => return,
            }
        }
    }
}

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

async fn send_loop(inner: Arc<OutputInner>, mut shutdown: watch::Receiver<bool>) {
    let poll_timeout = inner.runtime.config().send_queue_poll_timeout();
    let Some(queue) = inner.queue.as_ref() else {
        return;
    };

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        match queue.pop() {
            Some(item) => {
                inner.pace().await;
                if inner.closed.load(Ordering::SeqCst) {
                    inner.pool.release(item.pkt);
                    break;
                }
                inner.send_packet(item.pkt, item.transform).await;
            }
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep(poll_timeout) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("{} send task finished", inner.channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TransportConfig, TransportConfigBuilder};
    use tokio::net::UdpSocket;

    async fn output(config: TransportConfig) -> (OutputStream, UdpSocket) {
        let runtime = MediaRuntime::current(config).unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stream = OutputStream::new(
            StreamChannel::Data,
            SocketWriter::Udp(socket),
            Arc::new(PacketPool::new(16, 256)),
            runtime,
        );
        stream.add_target(receiver.local_addr().unwrap()).unwrap();
        (stream, receiver)
    }

    #[test]
    fn test_drop_log_schedule() {
        let logged: Vec<u64> = (1..=5000).filter(|n| log_drop(*n)).collect();
        assert_eq!(&logged[..3], &[1, 100, 200]);
        assert!(logged.contains(&1000));
        assert!(!logged.contains(&1100));
        assert!(logged.contains(&2000));
        assert_eq!(logged.len(), 1 + 10 + 4);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let queue = SendQueue {
            items: Mutex::new(VecDeque::new()),
            capacity: 2,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        };
        let item = |b: u8| QueuedPacket {
            pkt: RawPacket::from_slice(&[b]),
            transform: true,
        };

        assert!(queue.push(item(1)).is_none());
        assert!(queue.push(item(2)).is_none());
        let dropped = queue.push(item(3)).unwrap();
        assert_eq!(dropped.pkt.data(), &[1]);
        assert_eq!(queue.pop().unwrap().pkt.data(), &[2]);
        assert_eq!(queue.pop().unwrap().pkt.data(), &[3]);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_sync_mode_sends_to_every_target() {
        let config = TransportConfigBuilder::new().use_send_thread(false).build().unwrap();
        let (stream, receiver) = output(config).await;
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stream.add_target(second.local_addr().unwrap()).unwrap();
        stream.add_target(second.local_addr().unwrap()).unwrap();
        assert_eq!(stream.targets().len(), 2);

        assert_eq!(stream.write(&[1, 2, 3]).await.unwrap(), 3);

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let (n, _) = second.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        assert_eq!(stream.stats().packets_sent, 1);
        assert_eq!(stream.stats().bytes_sent, 3);
        assert!(stream.output_bitrate(Instant::now()) > 0);
        assert_eq!(stream.set_max_packets_per_millis(10, 100).unwrap(), false);
    }

    #[tokio::test]
    async fn test_queued_mode_preserves_order() {
        let (stream, receiver) = output(TransportConfig::default()).await;
        for i in 0..5u8 {
            stream.write(&[i]).await.unwrap();
        }
        let mut buf = [0u8; 4];
        for i in 0..5u8 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], &[i]);
        }
        stream.close();
        stream.join().await;
        assert!(matches!(stream.write(&[0]).await, Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_queue_overflow_counts_each_drop() {
        let config = TransportConfigBuilder::new().packet_queue_capacity(4).build().unwrap();
        let (stream, receiver) = output(config).await;

        // queued writes never yield, so the send task cannot drain in between
        for i in 0..4u8 {
            stream.write(&[i]).await.unwrap();
        }
        assert_eq!(stream.queued(), 4);
        assert_eq!(stream.stats().packets_dropped, 0);
        for i in 4..7u8 {
            stream.write(&[i]).await.unwrap();
            assert_eq!(stream.stats().packets_dropped, u64::from(i - 3));
            assert_eq!(stream.queued(), 4);
        }

        // the three oldest went away
        let mut buf = [0u8; 4];
        for i in 3..7u8 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..n], &[i]);
        }
        assert_eq!(stream.stats().packets_dropped, 3);
        stream.close();
        stream.join().await;
    }

    #[tokio::test]
    async fn test_disabled_stream_swallows_writes() {
        let (stream, _receiver) = output(TransportConfig::default()).await;
        stream.set_enabled(false);
        assert_eq!(stream.write(&[1, 2]).await.unwrap(), 2);
        assert_eq!(stream.queued(), 0);
        assert_eq!(stream.stats().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_pacing_configuration() {
        let (stream, _receiver) = output(TransportConfig::default()).await;
        assert!(stream.set_max_packets_per_millis(5, 100).unwrap());
        assert!(matches!(stream.set_max_packets_per_millis(5, 0), Err(Error::ConfigError(_))));
        assert!(stream.set_max_packets_per_millis(0, 0).unwrap());
    }
}
