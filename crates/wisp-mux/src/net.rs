//! Outbound sockets.
//!
//! Each stream's socket lives in its own task. The task never touches the
//! stream table; it reports what happens on the socket as [`StreamEvent`]s
//! to the owning session, which applies them in order with the frames coming
//! off the transport.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::select;
use tracing::{debug, trace};

use crate::close::classify_io_error;
use crate::packet::{CloseReason, ConnectPacket, StreamType};

/// Largest payload a UDP datagram can carry over IPv4.
const MAX_DATAGRAM_SIZE: usize = 65507;

/// Why an outbound stream could not be opened or stopped working.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for {0}")]
    NoAddresses(String),
    #[error("destination {0} blocked by policy")]
    Blocked(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DialError {
    /// CLOSE reason reported to the client for this failure.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Resolve { .. } | Self::NoAddresses(_) => CloseReason::ServerStreamUnreachable,
            Self::Blocked(_) => CloseReason::ServerStreamBlockedAddress,
            Self::Io(err) => classify_io_error(err),
        }
    }
}

/// Opens outbound connections on behalf of a session.
///
/// Only `lookup` is required. `check` is where a server applies its
/// destination policy; it runs against every candidate address before a
/// socket is opened.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError>;

    fn check(&self, _stream_type: StreamType, _addr: SocketAddr) -> Result<(), DialError> {
        Ok(())
    }

    async fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let stream = TcpStream::connect(addr).await?;
        // Enable TCP_NODELAY for lower latency
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Bind an ephemeral socket and connect it to `addr`.
    async fn connect_udp(&self, addr: SocketAddr) -> Result<UdpSocket, DialError> {
        let bind_addr = if addr.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

/// Dialer with no policy, resolving through the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|source| DialError::Resolve {
                host: host.to_string(),
                source,
            })?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Parse `host` as a literal address, accepting bracketed IPv6.
pub fn literal_addr(host: &str, port: u16) -> Option<SocketAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, port))
}

/// Resolve `host` to the first address the dialer accepts.
pub async fn resolve(
    dialer: &dyn Dialer,
    stream_type: StreamType,
    host: &str,
    port: u16,
) -> Result<SocketAddr, DialError> {
    if let Some(addr) = literal_addr(host, port) {
        dialer.check(stream_type, addr)?;
        return Ok(addr);
    }

    let mut rejected = None;
    for ip in dialer.lookup(host).await? {
        let addr = SocketAddr::new(ip, port);
        match dialer.check(stream_type, addr) {
            Ok(()) => return Ok(addr),
            Err(err) => rejected = Some(err),
        }
    }
    Err(rejected.unwrap_or_else(|| DialError::NoAddresses(host.to_string())))
}

/// Something that happened on a stream's socket, or to a pending resolution.
///
/// `key` identifies the stream instance, so events from a socket that was
/// torn down are not applied to a later stream reusing its ID.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Connected {
        id: u32,
        key: u64,
    },
    Data {
        id: u32,
        key: u64,
        data: Bytes,
    },
    Failed {
        id: u32,
        key: u64,
        error: DialError,
    },
    Closed {
        id: u32,
        key: u64,
    },
    Resolved {
        id: u32,
        key: u64,
        target: ConnectPacket,
        result: Result<SocketAddr, DialError>,
    },
}

/// Sending side of the session's event channel, bound to one stream.
#[derive(Debug, Clone)]
pub(crate) struct StreamEvents {
    pub id: u32,
    pub key: u64,
    pub tx: flume::Sender<StreamEvent>,
}

impl StreamEvents {
    fn emit(&self, event: StreamEvent) {
        // The session is gone; nothing left to tell.
        let _ = self.tx.send(event);
    }

    fn connected(&self) {
        self.emit(StreamEvent::Connected {
            id: self.id,
            key: self.key,
        });
    }

    fn data(&self, data: Bytes) {
        self.emit(StreamEvent::Data {
            id: self.id,
            key: self.key,
            data,
        });
    }

    fn failed(&self, error: DialError) {
        self.emit(StreamEvent::Failed {
            id: self.id,
            key: self.key,
            error,
        });
    }

    fn closed(&self) {
        self.emit(StreamEvent::Closed {
            id: self.id,
            key: self.key,
        });
    }

    pub fn resolved(&self, target: ConnectPacket, result: Result<SocketAddr, DialError>) {
        self.emit(StreamEvent::Resolved {
            id: self.id,
            key: self.key,
            target,
            result,
        });
    }
}

/// Resolve, connect and pump a TCP stream until either side ends it.
pub(crate) async fn run_tcp(
    dialer: Arc<dyn Dialer>,
    target: ConnectPacket,
    events: StreamEvents,
    outbound: flume::Receiver<Bytes>,
    buffer_size: usize,
) {
    match forward_tcp(dialer.as_ref(), &target, &events, outbound, buffer_size).await {
        Ok(()) => events.closed(),
        Err(err) => {
            debug!(
                "stream {} to {}:{} failed: {}",
                events.id, target.host, target.port, err
            );
            events.failed(err);
        }
    }
}

async fn forward_tcp(
    dialer: &dyn Dialer,
    target: &ConnectPacket,
    events: &StreamEvents,
    outbound: flume::Receiver<Bytes>,
    buffer_size: usize,
) -> Result<(), DialError> {
    let addr = resolve(dialer, StreamType::Tcp, &target.host, target.port).await?;
    let mut stream = dialer.connect_tcp(addr).await?;
    trace!("stream {} connected to {}", events.id, addr);
    events.connected();

    let (mut tcp_read, mut tcp_write) = stream.split();
    let mut tcp_buf = vec![0u8; buffer_size];

    loop {
        select! {
            // Client -> TCP
            data = outbound.recv_async() => match data {
                Ok(data) => tcp_write.write_all(&data).await?,
                // The session dropped the stream.
                Err(_) => return Ok(()),
            },
            // TCP -> client
            result = tcp_read.read(&mut tcp_buf) => match result? {
                0 => return Ok(()),
                n => events.data(Bytes::copy_from_slice(&tcp_buf[..n])),
            },
        }
    }
}

/// Connect a UDP association to an already resolved address and pump
/// datagrams until it fails.
pub(crate) async fn run_udp(
    dialer: Arc<dyn Dialer>,
    addr: SocketAddr,
    events: StreamEvents,
    outbound: flume::Receiver<Bytes>,
) {
    match forward_udp(dialer.as_ref(), addr, &events, outbound).await {
        Ok(()) => events.closed(),
        Err(err) => {
            debug!("udp stream {} to {} failed: {}", events.id, addr, err);
            events.failed(err);
        }
    }
}

async fn forward_udp(
    dialer: &dyn Dialer,
    addr: SocketAddr,
    events: &StreamEvents,
    outbound: flume::Receiver<Bytes>,
) -> Result<(), DialError> {
    let socket = dialer.connect_udp(addr).await?;
    trace!("udp stream {} associated with {}", events.id, addr);
    events.connected();

    let mut udp_buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        select! {
            data = outbound.recv_async() => match data {
                Ok(data) => {
                    socket.send(&data).await?;
                }
                Err(_) => return Ok(()),
            },
            result = socket.recv(&mut udp_buf) => {
                let n = result?;
                events.data(Bytes::copy_from_slice(&udp_buf[..n]));
            }
        }
    }
}
