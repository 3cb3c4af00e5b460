//! Socket pair owned by a connector
//!
//! A [`StreamConnector`] holds the data (RTP) and control (RTCP) sockets of
//! one stream. UDP sockets are shared between the reading and the writing
//! side; TCP streams are split into halves and framed per RFC 4571.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::error::Error;
use crate::Result;

/// Transport protocol of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::Tcp => write!(f, "TCP"),
        }
    }
}

/// Which socket of the pair a stream is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamChannel {
    /// RTP
    Data,
    /// RTCP
    Control,
}

impl fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamChannel::Data => write!(f, "data"),
            StreamChannel::Control => write!(f, "control"),
        }
    }
}

/// One half-duplex view of a TCP connection with RFC 4571 framing
struct TcpChannel {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    local: SocketAddr,
    peer: SocketAddr,
}

enum StreamSocket {
    Udp(Arc<UdpSocket>),
    Tcp(TcpChannel),
}

impl StreamSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            StreamSocket::Udp(socket) => socket.local_addr(),
            StreamSocket::Tcp(channel) => Ok(channel.local),
        }
    }

    fn tcp(stream: TcpStream) -> Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(StreamSocket::Tcp(TcpChannel {
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(tokio::sync::Mutex::new(writer)),
            local,
            peer,
        }))
    }
}

/// The pair of transport endpoints of a stream
pub struct StreamConnector {
    kind: TransportKind,
    data: StreamSocket,
    control: StreamSocket,
    closed: AtomicBool,
}

impl StreamConnector {
    /// Wrap two bound UDP sockets
    pub fn udp(data: UdpSocket, control: UdpSocket) -> Self {
        Self {
            kind: TransportKind::Udp,
            data: StreamSocket::Udp(Arc::new(data)),
            control: StreamSocket::Udp(Arc::new(control)),
            closed: AtomicBool::new(false),
        }
    }

    /// Bind a UDP socket pair
    pub async fn bind_udp(data_addr: SocketAddr, control_addr: SocketAddr) -> Result<Self> {
        let data = UdpSocket::bind(data_addr).await?;
        let control = UdpSocket::bind(control_addr).await?;
        Ok(Self::udp(data, control))
    }

    /// Wrap two connected TCP streams
    pub fn tcp(data: TcpStream, control: TcpStream) -> Result<Self> {
        Ok(Self {
            kind: TransportKind::Tcp,
            data: StreamSocket::tcp(data)?,
            control: StreamSocket::tcp(control)?,
            closed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Local address of the data or control socket
    pub fn local_addr(&self, channel: StreamChannel) -> Result<SocketAddr> {
        Ok(self.socket(channel).local_addr()?)
    }

    pub fn data_local_addr(&self) -> Result<SocketAddr> {
        self.local_addr(StreamChannel::Data)
    }

    pub fn control_local_addr(&self) -> Result<SocketAddr> {
        self.local_addr(StreamChannel::Control)
    }

    fn socket(&self, channel: StreamChannel) -> &StreamSocket {
        match channel {
            StreamChannel::Data => &self.data,
            StreamChannel::Control => &self.control,
        }
    }

    /// Reading side of a socket. A TCP read half can be taken only once.
    pub(crate) fn reader(&self, channel: StreamChannel, receive_buffer_size: usize) -> Result<SocketReader> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        match self.socket(channel) {
            StreamSocket::Udp(socket) => {
                if let Err(e) = SockRef::from(socket.as_ref()).set_recv_buffer_size(receive_buffer_size) {
                    warn!("Failed to set SO_RCVBUF={} on {} socket: {}", receive_buffer_size, channel, e);
                }
                Ok(SocketReader::Udp(socket.clone()))
            }
            StreamSocket::Tcp(tcp) => {
                let half = tcp.reader.lock().take().ok_or_else(|| {
                    Error::InvalidState(format!("TCP {} read half already in use", channel))
                })?;
                Ok(SocketReader::Tcp { half, peer: tcp.peer })
            }
        }
    }

    /// Writing side of a socket
    pub(crate) fn writer(&self, channel: StreamChannel) -> Result<SocketWriter> {
        if self.is_closed() {
            return Err(Error::StreamClosed);
        }
        Ok(match self.socket(channel) {
            StreamSocket::Udp(socket) => SocketWriter::Udp(socket.clone()),
            StreamSocket::Tcp(tcp) => SocketWriter::Tcp(tcp.writer.clone()),
        })
    }

    /// Release the sockets. Streams still holding a socket keep it until
    /// their task exits.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for socket in [&self.data, &self.control] {
            if let StreamSocket::Tcp(tcp) = socket {
                tcp.reader.lock().take();
            }
        }
        debug!("Closed {} stream connector", self.kind);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for StreamConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnector")
            .field("kind", &self.kind)
            .field("data", &self.data.local_addr().ok())
            .field("control", &self.control.local_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving side of one socket
pub(crate) enum SocketReader {
    Udp(Arc<UdpSocket>),
    Tcp { half: OwnedReadHalf, peer: SocketAddr },
}

impl SocketReader {
    /// Receive one datagram or one RFC 4571 frame. Frames larger than `buf`
    /// are truncated, like oversized UDP datagrams.
    pub(crate) async fn recv(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            SocketReader::Udp(socket) => socket.recv_from(buf).await,
            SocketReader::Tcp { half, peer } => {
                let frame_len = half.read_u16().await? as usize;
                let keep = frame_len.min(buf.len());
                half.read_exact(&mut buf[..keep]).await?;
                let mut excess = frame_len - keep;
                let mut sink = [0u8; 512];
                while excess > 0 {
                    let n = excess.min(sink.len());
                    half.read_exact(&mut sink[..n]).await?;
                    excess -= n;
                }
                Ok((keep, *peer))
            }
        }
    }
}

/// Sending side of one socket
#[derive(Clone)]
pub(crate) enum SocketWriter {
    Udp(Arc<UdpSocket>),
    Tcp(Arc<tokio::sync::Mutex<OwnedWriteHalf>>),
}

impl SocketWriter {
    /// Whether the socket is connected and ignores target addresses
    pub(crate) fn is_connected(&self) -> bool {
        matches!(self, SocketWriter::Tcp(_))
    }

    pub(crate) async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<()> {
        match self {
            SocketWriter::Udp(socket) => socket.send_to(data, target).await.map(|_| ()),
            SocketWriter::Tcp(writer) => {
                let len = u16::try_from(data.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "packet exceeds RFC 4571 frame size")
                })?;
                let mut frame = Vec::with_capacity(2 + data.len());
                frame.extend_from_slice(&len.to_be_bytes());
                frame.extend_from_slice(data);
                writer.lock().await.write_all(&frame).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_udp_connector_addresses() {
        let connector = StreamConnector::bind_udp("127.0.0.1:0".parse().unwrap(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(connector.kind(), TransportKind::Udp);
        let data = connector.data_local_addr().unwrap();
        let control = connector.control_local_addr().unwrap();
        assert_ne!(data.port(), control.port());

        connector.close();
        assert!(connector.is_closed());
        assert!(matches!(connector.writer(StreamChannel::Data), Err(Error::StreamClosed)));
    }

    #[tokio::test]
    async fn test_tcp_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let client_half = StreamSocket::tcp(client).unwrap();
        let server_half = StreamSocket::tcp(server).unwrap();

        let writer = match &client_half {
            StreamSocket::Tcp(tcp) => SocketWriter::Tcp(tcp.writer.clone()),
            StreamSocket::Udp(_) => unreachable!(),
        };
        let mut reader = match &server_half {
            StreamSocket::Tcp(tcp) => SocketReader::Tcp {
                half: tcp.reader.lock().take().unwrap(),
                peer: tcp.peer,
            },
            StreamSocket::Udp(_) => unreachable!(),
        };

        writer.send_to(&[1, 2, 3, 4, 5], addr).await.unwrap();
        writer.send_to(&[9; 8], addr).await.unwrap();

        // second frame is truncated to the buffer size
        let mut buf = [0u8; 6];
        let (len, _) = reader.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3, 4, 5]);
        let (len, _) = reader.recv(&mut buf).await.unwrap();
        assert_eq!(len, 6);
        assert_eq!(buf, [9; 6]);
    }
}
