//! Push-style input stream
//!
//! A background task reads datagrams into pooled packets, filters and
//! reverse-transforms them, and parks the result in a single pending slot.
//! A newer packet supersedes an unread one, which goes back to the pool. The
//! registered transfer handler is invoked after every arrival and pulls the
//! pending packet with [`InputStream::read`].

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::socket::{SocketReader, StreamChannel};
use crate::config::MediaRuntime;
use crate::error::Error;
use crate::packet::{PacketPool, RawPacket};
use crate::transform::PacketTransformer;
use crate::Result;

/// Predicate deciding whether a datagram is accepted
pub trait DatagramFilter: Send + Sync {
    fn accept(&self, data: &[u8], from: SocketAddr) -> bool;
}

impl<F> DatagramFilter for F
where
    F: Fn(&[u8], SocketAddr) -> bool + Send + Sync,
{
    fn accept(&self, data: &[u8], from: SocketAddr) -> bool {
        self(data, from)
    }
}

/// Callback invoked on the receive task whenever a packet is pending
pub type TransferHandler = Arc<dyn Fn() + Send + Sync>;

/// Result of [`InputStream::read`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A packet of `len` bytes was copied
    Packet { len: usize, flags: u32 },
    /// Nothing is pending
    Empty,
    /// The socket failed; no more packets will arrive
    EndOfStream,
}

/// Counters of an input stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStreamStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_rejected: u64,
    pub packets_invalid: u64,
    pub packets_superseded: u64,
    pub packets_discarded: u64,
}

struct InputInner {
    channel: StreamChannel,
    runtime: MediaRuntime,
    pool: Arc<PacketPool>,
    pending: Mutex<Option<RawPacket>>,
    filters: RwLock<Vec<Arc<dyn DatagramFilter>>>,
    transformer: RwLock<Option<Arc<dyn PacketTransformer>>>,
    handler: RwLock<Option<TransferHandler>>,
    reader: Mutex<Option<SocketReader>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    enabled: AtomicBool,
    closed: AtomicBool,
    io_error: AtomicBool,
    last_activity: Mutex<Option<Instant>>,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_rejected: AtomicU64,
    packets_invalid: AtomicU64,
    packets_superseded: AtomicU64,
    packets_discarded: AtomicU64,
}

/// Input stream of one socket
pub struct InputStream {
    inner: Arc<InputInner>,
}

impl InputStream {
    pub(crate) fn new(
        channel: StreamChannel,
        reader: SocketReader,
        pool: Arc<PacketPool>,
        runtime: MediaRuntime,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(InputInner {
                channel,
                runtime,
                pool,
                pending: Mutex::new(None),
                filters: RwLock::new(Vec::new()),
                transformer: RwLock::new(None),
                handler: RwLock::new(None),
                reader: Mutex::new(Some(reader)),
                task: Mutex::new(None),
                shutdown,
                enabled: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                io_error: AtomicBool::new(false),
                last_activity: Mutex::new(None),
                packets_received: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                packets_rejected: AtomicU64::new(0),
                packets_invalid: AtomicU64::new(0),
                packets_superseded: AtomicU64::new(0),
                packets_discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn channel(&self) -> StreamChannel {
        self.inner.channel
    }

    /// Register the consumer and start the receive task on first call
    pub fn set_transfer_handler(&self, handler: TransferHandler) {
        *self.inner.handler.write() = Some(handler);
        self.start_receiving();
    }

    fn start_receiving(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut task = self.inner.task.lock();
        if task.is_some() {
            return;
        }
        let Some(reader) = self.inner.reader.lock().take() else {
            return;
        };
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        *task = Some(self.inner.runtime.spawn(receive_loop(inner, reader, shutdown)));
        debug!("Started {} receive task", self.inner.channel);
    }

    /// Append a datagram filter
    pub fn add_filter(&self, filter: Arc<dyn DatagramFilter>) {
        self.inner.filters.write().push(filter);
    }

    /// Set the reverse transformer applied before a packet becomes pending
    pub fn set_transformer(&self, transformer: Option<Arc<dyn PacketTransformer>>) {
        *self.inner.transformer.write() = transformer;
    }

    /// Enable or disable acceptance of datagrams
    pub fn set_enabled(&self, enabled: bool) {
        if self.inner.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!("{} input stream {}", self.inner.channel, if enabled { "enabled" } else { "disabled" });
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Monotonic time of the last accepted datagram
    pub fn last_activity(&self) -> Option<Instant> {
        *self.inner.last_activity.lock()
    }

    /// Whether `accept` would take a datagram right now
    pub fn accept(&self, data: &[u8], from: SocketAddr) -> bool {
        self.inner.accept(data, from)
    }

    /// Copy the pending packet into `buf`
    ///
    /// Fails with [`Error::BufferTooSmall`] when `buf` cannot hold the
    /// packet; the packet then stays pending for the next read unless a newer
    /// one already took its place.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        if self.inner.io_error.load(Ordering::SeqCst) {
            return Ok(ReadOutcome::EndOfStream);
        }
        let Some(pkt) = self.inner.pending.lock().take() else {
            return Ok(ReadOutcome::Empty);
        };

        let len = pkt.len();
        if buf.len() < len {
            let mut pending = self.inner.pending.lock();
            if pending.is_none() {
                *pending = Some(pkt);
            } else {
                drop(pending);
                self.inner.pool.release(pkt);
            }
            return Err(Error::BufferTooSmall {
                required: len,
                available: buf.len(),
            });
        }

        buf[..len].copy_from_slice(pkt.data());
        let flags = pkt.flags();
        self.inner.pool.release(pkt);
        Ok(ReadOutcome::Packet { len, flags })
    }

    /// Whether a packet is waiting to be read
    pub fn has_pending(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    /// Whether the socket failed
    pub fn is_eof(&self) -> bool {
        self.inner.io_error.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> InputStreamStats {
        let i = &self.inner;
        InputStreamStats {
            packets_received: i.packets_received.load(Ordering::Relaxed),
            bytes_received: i.bytes_received.load(Ordering::Relaxed),
            packets_rejected: i.packets_rejected.load(Ordering::Relaxed),
            packets_invalid: i.packets_invalid.load(Ordering::Relaxed),
            packets_superseded: i.packets_superseded.load(Ordering::Relaxed),
            packets_discarded: i.packets_discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop the receive task and release the pending packet
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown.send(true);
        self.inner.reader.lock().take();
        if let Some(pkt) = self.inner.pending.lock().take() {
            self.inner.pool.release(pkt);
        }
        *self.inner.handler.write() = None;
        debug!("Closed {} input stream", self.inner.channel);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait for the receive task to finish after `close`
    pub async fn join(&self) {
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("channel", &self.inner.channel)
            .field("enabled", &self.is_enabled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl InputInner {
    fn accept(&self, data: &[u8], from: SocketAddr) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        *self.last_activity.lock() = Some(Instant::now());
        self.filters.read().iter().all(|filter| filter.accept(data, from))
    }

    fn is_invalid(&self, pkt: &RawPacket) -> bool {
        match self.channel {
            StreamChannel::Data => pkt.is_invalid_rtp(),
            StreamChannel::Control => pkt.is_invalid_rtcp(),
        }
    }

    /// Process one received datagram. Returns whether a packet became pending.
    fn on_datagram(&self, mut pkt: RawPacket, len: usize, from: SocketAddr) -> bool {
        if pkt.set_window(0, len).is_err() {
            self.pool.release(pkt);
            return false;
        }
        if !self.accept(pkt.data(), from) {
            self.packets_rejected.fetch_add(1, Ordering::Relaxed);
            self.pool.release(pkt);
            return false;
        }

        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

        if self.is_invalid(&pkt) {
            trace!("Dropping invalid {} packet of {} bytes from {}", self.channel, len, from);
            self.packets_invalid.fetch_add(1, Ordering::Relaxed);
            self.pool.release(pkt);
            return false;
        }

        let transformer = self.transformer.read().clone();
        if let Some(transformer) = transformer {
            if transformer.reverse_transform(&mut pkt).is_discard() {
                self.packets_discarded.fetch_add(1, Ordering::Relaxed);
                self.pool.release(pkt);
                return false;
            }
        }

        let superseded = self.pending.lock().replace(pkt);
        if let Some(old) = superseded {
            self.packets_superseded.fetch_add(1, Ordering::Relaxed);
            self.pool.release(old);
        }
        true
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

async fn receive_loop(inner: Arc<InputInner>, mut reader: SocketReader, mut shutdown: watch::Receiver<bool>) {
    let buffer_length = inner.runtime.config().receive_buffer_length;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        let mut pkt = inner.pool.acquire(buffer_length);

        let received = tokio::select! {
            changed = shutdown.changed() => Err(changed.is_err()),
            received = reader.recv(pkt.buffer_mut()) => Ok(received),
        };
        let received = match received {
            Ok(received) => received,
            Err(sender_gone) => {
                inner.pool.release(pkt);
                if sender_gone || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match received {
            Ok((len, from)) => {
                if inner.closed.load(Ordering::SeqCst) {
                    inner.pool.release(pkt);
                    break;
                }
                if inner.on_datagram(pkt, len, from) {
                    let handler = inner.handler.read().clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                }
            }
            Err(e) if is_transient(&e) => {
                inner.pool.release(pkt);
            }
            Err(e) => {
                inner.pool.release(pkt);
                if !inner.closed.load(Ordering::SeqCst) {
                    warn!("Failed to receive on {} socket: {}", inner.channel, e);
                }
                inner.io_error.store(true, Ordering::SeqCst);
                // wake the consumer so it observes end of stream
                let handler = inner.handler.read().clone();
                if let Some(handler) = handler {
                    handler();
                }
                break;
            }
        }
    }

    debug!("{} receive task finished", inner.channel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::packet::build_rtp_packet;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::Notify;

    async fn udp_input() -> (InputStream, Arc<PacketPool>, UdpSocket, SocketAddr) {
        let runtime = MediaRuntime::current(TransportConfig::default()).unwrap();
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let pool = Arc::new(PacketPool::new(4, 64));
        let input = InputStream::new(StreamChannel::Data, SocketReader::Udp(socket), pool.clone(), runtime);
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (input, pool, sender, addr)
    }

    fn push(input: &InputStream, pool: &PacketPool, pkt: &RawPacket) -> bool {
        let mut pooled = pool.acquire(64);
        pooled.buffer_mut()[..pkt.len()].copy_from_slice(pkt.data());
        input.inner.on_datagram(pooled, pkt.len(), "127.0.0.1:9".parse().unwrap())
    }

    #[tokio::test]
    async fn test_supersession_returns_old_packet_to_pool() {
        let (input, pool, _sender, _addr) = udp_input().await;

        for seq in 0..5u16 {
            let pkt = build_rtp_packet(0, false, seq, 0, 1, &[seq as u8; 20]);
            assert!(push(&input, &pool, &pkt));
        }
        assert_eq!(input.stats().packets_superseded, 4);

        let mut buf = [0u8; 64];
        match input.read(&mut buf).unwrap() {
            ReadOutcome::Packet { len, .. } => {
                let pkt = RawPacket::from_slice(&buf[..len]);
                assert_eq!(pkt.sequence_number(), 4);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(input.read(&mut buf).unwrap(), ReadOutcome::Empty);
        // the pool started empty; the superseded and the read packet both came back
        assert_eq!(pool.available(), 2);
        assert!(pool.available() <= pool.capacity());
    }

    #[tokio::test]
    async fn test_small_buffer_reinstates_packet() {
        let (input, pool, _sender, _addr) = udp_input().await;
        push(&input, &pool, &build_rtp_packet(0, false, 7, 0, 1, &[1; 40]));

        let mut small = [0u8; 16];
        assert!(matches!(
            input.read(&mut small),
            Err(Error::BufferTooSmall { required: 52, available: 16 })
        ));
        assert!(input.has_pending());

        let mut big = [0u8; 64];
        assert_eq!(input.read(&mut big).unwrap(), ReadOutcome::Packet { len: 52, flags: 0 });
    }

    #[tokio::test]
    async fn test_disabled_stream_rejects() {
        let (input, _pool, _sender, _addr) = udp_input().await;
        let from: SocketAddr = "127.0.0.1:9".parse().unwrap();

        assert!(input.accept(&[0x80, 0, 0, 0], from));
        assert!(input.last_activity().is_some());
        input.set_enabled(false);
        assert!(!input.accept(&[0x80, 0, 0, 0], from));

        input.set_enabled(true);
        input.add_filter(Arc::new(|_: &[u8], from: SocketAddr| from.port() != 9));
        assert!(!input.accept(&[0x80, 0, 0, 0], from));
    }

    #[tokio::test]
    async fn test_receive_task_delivers_and_drops_invalid() {
        let (input, _pool, sender, addr) = udp_input().await;
        let notify = Arc::new(Notify::new());
        let n = notify.clone();
        input.set_transfer_handler(Arc::new(move || n.notify_one()));

        sender.send_to(&[0x80, 0x00], addr).await.unwrap();
        let pkt = build_rtp_packet(0, true, 42, 160, 0xABCD, &[5; 10]);
        sender.send_to(pkt.data(), addr).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), notify.notified()).await.unwrap();
        let mut buf = [0u8; 128];
        let outcome = input.read(&mut buf).unwrap();
        assert_eq!(outcome, ReadOutcome::Packet { len: pkt.len(), flags: 0 });
        assert_eq!(&buf[..pkt.len()], pkt.data());

        let stats = input.stats();
        assert_eq!(stats.packets_invalid, 1);
        assert_eq!(stats.packets_received, 2);

        input.close();
        input.close();
        input.join().await;
        assert!(input.is_closed());
    }
}
