//! Session multiplexer.
//!
//! A [`Session`] owns one transport and every stream opened over it. All of
//! its work happens on one loop: frames from the transport and events from
//! the per-stream socket tasks are applied one at a time, and the loop is the
//! only writer to the transport, so frames never interleave.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::auth::Authenticator;
use crate::net::{self, literal_addr, DialError, Dialer, StreamEvent, StreamEvents};
use crate::packet::{
    AuthPacket, ClosePacket, CloseReason, ConnectPacket, ContinuePacket, Extension, FrameType,
    InfoPacket, StreamType, WispFrame, AUTH_EXTENSION_ID, DEFAULT_CREDIT, UDP_EXTENSION_ID,
};
use crate::table::{self, SocketHandle, StreamTable, ThrottleConfig};
use crate::WispError;

/// Per-session settings, fixed when the session is created.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the client's INFO before treating it as a
    /// legacy client. Also bounds the auth exchange.
    pub handshake_timeout: Duration,
    /// Credit granted on stream 0 and on every TCP refill.
    pub initial_credit: u32,
    /// Whether the UDP extension is offered.
    pub allow_udp: bool,
    pub throttle: Option<ThrottleConfig>,
    /// Read buffer for each outbound TCP socket.
    pub buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            initial_credit: DEFAULT_CREDIT,
            allow_udp: true,
            throttle: None,
            buffer_size: 16384,
        }
    }
}

/// A UDP CONNECT whose hostname lookup is still running.
///
/// Dropping it cancels the lookup.
struct PendingResolve {
    key: u64,
    task: JoinHandle<()>,
}

impl Drop for PendingResolve {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Authenticating,
    Routing,
    Closed,
}

/// The multiplexed state of one transport connection.
pub struct Session<R, W> {
    id: String,
    read: R,
    write: W,
    config: SessionConfig,
    dialer: Arc<dyn Dialer>,
    authenticator: Option<Arc<dyn Authenticator>>,
    state: State,
    streams: StreamTable,
    /// UDP CONNECTs waiting on DNS, by stream ID.
    resolving: FxHashMap<u32, PendingResolve>,
    udp_extension: bool,
    auth_extension: bool,
    events_tx: flume::Sender<StreamEvent>,
    events_rx: flume::Receiver<StreamEvent>,
}

impl<R, W> Session<R, W>
where
    R: Stream<Item = Result<Bytes, WispError>> + Unpin,
    W: Sink<Bytes, Error = WispError> + Unpin,
{
    pub fn new(read: R, write: W, config: SessionConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            id: "wisp".to_string(),
            read,
            write,
            config,
            dialer,
            authenticator: None,
            state: State::AwaitingHandshake,
            streams: StreamTable::new(),
            resolving: FxHashMap::default(),
            udp_extension: false,
            auth_extension: false,
            events_tx,
            events_rx,
        }
    }

    /// Require clients to authenticate; offers the auth extension.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Label used in this session's log lines.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Drive the session until the transport closes or the client breaks
    /// protocol. Every stream is torn down and the transport closed before
    /// this returns.
    pub async fn run(mut self) -> Result<(), WispError> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            warn!("[{}] Session aborted: {}", self.id, e);
        }
        self.shutdown().await;
        result
    }

    async fn run_inner(&mut self) -> Result<(), WispError> {
        self.send(WispFrame::continue_with(0, self.config.initial_credit))
            .await?;
        let info = InfoPacket::current(self.advertised_extensions());
        self.send(WispFrame::info(&info)).await?;

        let handshake = sleep(self.config.handshake_timeout);
        tokio::pin!(handshake);

        loop {
            select! {
                message = self.read.next() => match message {
                    Some(Ok(message)) => self.handle_message(message).await?,
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("[{}] Transport closed by client", self.id);
                        return Ok(());
                    }
                },
                Ok(event) = self.events_rx.recv_async() => self.handle_event(event).await?,
                () = &mut handshake, if matches!(self.state, State::AwaitingHandshake | State::Authenticating) => {
                    if self.state == State::Authenticating {
                        return Err(WispError::HandshakeTimedOut);
                    }
                    debug!(
                        "[{}] No INFO within {:?}, treating client as legacy",
                        self.id, self.config.handshake_timeout
                    );
                    self.fall_back_to_legacy()?;
                }
            }
        }
    }

    fn advertised_extensions(&self) -> Vec<Extension> {
        let mut extensions = Vec::new();
        if self.config.allow_udp {
            extensions.push(Extension::new(UDP_EXTENSION_ID));
        }
        if self.authenticator.is_some() {
            extensions.push(Extension::new(AUTH_EXTENSION_ID));
        }
        extensions
    }

    async fn handle_message(&mut self, message: Bytes) -> Result<(), WispError> {
        let frame = WispFrame::decode(message)?;
        trace!(
            "[{}] <- {:?} stream {} ({} bytes)",
            self.id,
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );

        match self.state {
            State::AwaitingHandshake if frame.frame_type == FrameType::Info => {
                self.handshake(&frame)
            }
            State::AwaitingHandshake => {
                debug!(
                    "[{}] First frame was {:?}, treating client as legacy",
                    self.id, frame.frame_type
                );
                self.fall_back_to_legacy()?;
                self.route(frame).await
            }
            State::Authenticating => self.authenticate(frame).await,
            State::Routing => self.route(frame).await,
            State::Closed => Ok(()),
        }
    }

    fn handshake(&mut self, frame: &WispFrame) -> Result<(), WispError> {
        if frame.stream_id != 0 {
            return Err(WispError::InvalidStreamId(frame.stream_id));
        }
        let info = InfoPacket::decode(&frame.payload)?;

        self.udp_extension = self.config.allow_udp && info.has_extension(UDP_EXTENSION_ID);
        self.auth_extension =
            self.authenticator.is_some() && info.has_extension(AUTH_EXTENSION_ID);
        if self.authenticator.is_some() && !self.auth_extension {
            return Err(WispError::AuthenticationRequired);
        }

        debug!(
            "[{}] Client speaks Wisp {}.{}, udp: {}, auth: {}",
            self.id, info.major, info.minor, self.udp_extension, self.auth_extension
        );
        self.state = if self.auth_extension {
            State::Authenticating
        } else {
            State::Routing
        };
        Ok(())
    }

    fn fall_back_to_legacy(&mut self) -> Result<(), WispError> {
        self.udp_extension = false;
        self.auth_extension = false;
        if self.authenticator.is_some() {
            return Err(WispError::AuthenticationRequired);
        }
        self.state = State::Routing;
        Ok(())
    }

    async fn authenticate(&mut self, frame: WispFrame) -> Result<(), WispError> {
        if frame.frame_type != FrameType::Info || frame.stream_id != 0 {
            trace!(
                "[{}] Ignoring {:?} while authenticating",
                self.id,
                frame.frame_type
            );
            return Ok(());
        }
        let Some(authenticator) = self.authenticator.clone() else {
            return Err(WispError::AuthenticationRequired);
        };

        let credentials = AuthPacket::decode(&frame.payload)?;
        let accepted = authenticator
            .verify(&credentials.username, &credentials.password)
            .await;
        self.send(WispFrame::auth_response(accepted)).await?;
        if !accepted {
            return Err(WispError::AuthenticationFailed(credentials.username));
        }

        info!("[{}] Authenticated as {:?}", self.id, credentials.username);
        self.state = State::Routing;
        Ok(())
    }

    async fn route(&mut self, frame: WispFrame) -> Result<(), WispError> {
        match frame.frame_type {
            FrameType::Connect => {
                if frame.stream_id == 0 {
                    return Err(WispError::InvalidStreamId(0));
                }
                let target = ConnectPacket::decode(&frame.payload)?;
                self.open_stream(frame.stream_id, target).await
            }
            FrameType::Data => {
                self.forward_data(frame.stream_id, frame.payload).await?;
                self.throttle().await
            }
            FrameType::Continue => {
                let packet = ContinuePacket::decode(&frame.payload)?;
                trace!(
                    "[{}] Ignoring CONTINUE({}) for stream {}",
                    self.id,
                    packet.buffer_remaining,
                    frame.stream_id
                );
                Ok(())
            }
            FrameType::Close => {
                let packet = ClosePacket::decode(&frame.payload)?;
                self.resolving.remove(&frame.stream_id);
                if self.streams.remove(frame.stream_id).is_some() {
                    debug!(
                        "[{}] Client closed stream {} ({:?})",
                        self.id, frame.stream_id, packet.reason
                    );
                }
                Ok(())
            }
            FrameType::Info => {
                debug!("[{}] Ignoring INFO after handshake", self.id);
                Ok(())
            }
        }
    }

    async fn open_stream(&mut self, id: u32, target: ConnectPacket) -> Result<(), WispError> {
        if self.streams.contains(id) || self.resolving.contains_key(&id) {
            warn!("[{}] CONNECT for stream {} which is still open", self.id, id);
            return self
                .send(WispFrame::close(id, CloseReason::ServerStreamInvalidInfo))
                .await;
        }
        debug!(
            "[{}] Stream {} requested: {:?} {}:{}",
            self.id, id, target.stream_type, target.host, target.port
        );

        match target.stream_type {
            StreamType::Tcp => {
                let key = self.streams.next_key();
                let (tx, rx) = flume::unbounded();
                let task = tokio::spawn(net::run_tcp(
                    self.dialer.clone(),
                    target,
                    self.stream_events(id, key),
                    rx,
                    self.config.buffer_size,
                ));
                let stream = table::Stream::tcp(
                    id,
                    key,
                    self.config.initial_credit,
                    SocketHandle::new(tx, task),
                );
                self.register(stream).await
            }
            StreamType::Udp if !self.udp_extension => {
                debug!("[{}] UDP stream {} rejected, extension not negotiated", self.id, id);
                self.send(WispFrame::close(id, CloseReason::ServerStreamInvalidInfo))
                    .await
            }
            StreamType::Udp => {
                let key = self.streams.next_key();
                if let Some(addr) = literal_addr(&target.host, target.port) {
                    let result = self.dialer.check(StreamType::Udp, addr).map(|()| addr);
                    return self.open_udp(id, key, &target, result).await;
                }

                let dialer = self.dialer.clone();
                let events = self.stream_events(id, key);
                let task = tokio::spawn(async move {
                    let result =
                        net::resolve(dialer.as_ref(), StreamType::Udp, &target.host, target.port)
                            .await;
                    events.resolved(target, result);
                });
                self.resolving.insert(id, PendingResolve { key, task });
                Ok(())
            }
        }
    }

    async fn open_udp(
        &mut self,
        id: u32,
        key: u64,
        target: &ConnectPacket,
        resolved: Result<std::net::SocketAddr, DialError>,
    ) -> Result<(), WispError> {
        match resolved {
            Ok(addr) => {
                trace!("[{}] Stream {} resolved {} to {}", self.id, id, target.host, addr);
                let (tx, rx) = flume::unbounded();
                let task = tokio::spawn(net::run_udp(
                    self.dialer.clone(),
                    addr,
                    self.stream_events(id, key),
                    rx,
                ));
                self.register(table::Stream::udp(id, key, SocketHandle::new(tx, task)))
                    .await
            }
            Err(e) => {
                warn!("[{}] Stream {} to {}: {}", self.id, id, target.host, e);
                self.send(WispFrame::close(id, e.close_reason())).await
            }
        }
    }

    async fn register(&mut self, stream: table::Stream) -> Result<(), WispError> {
        let id = stream.id;
        if self.streams.insert(stream).is_err() {
            return self
                .send(WispFrame::close(id, CloseReason::ServerStreamInvalidInfo))
                .await;
        }
        Ok(())
    }

    fn stream_events(&self, id: u32, key: u64) -> StreamEvents {
        StreamEvents {
            id,
            key,
            tx: self.events_tx.clone(),
        }
    }

    async fn forward_data(&mut self, id: u32, data: Bytes) -> Result<(), WispError> {
        let Some(stream) = self.streams.get_mut(id) else {
            trace!("[{}] Dropping DATA for unknown stream {}", self.id, id);
            return Ok(());
        };

        stream.record_transfer(data.len());
        // A socket task that is gone reports why through its own event.
        if !stream.socket.send(data) {
            trace!("[{}] Stream {} socket already gone, dropping DATA", self.id, id);
        }
        if let Some(credit) = stream.consume_credit(self.config.initial_credit) {
            self.send(WispFrame::continue_with(id, credit)).await?;
        }
        Ok(())
    }

    async fn throttle(&mut self) -> Result<(), WispError> {
        let Some(config) = self.config.throttle else {
            return Ok(());
        };
        for id in self.streams.throttle_sweep(Instant::now(), &config) {
            self.streams.remove(id);
            info!(
                "[{}] Stream {} moved over {} bytes in {:?}, closing",
                self.id, id, config.limit_bytes, config.interval
            );
            self.send(WispFrame::close(id, CloseReason::ServerStreamThrottled))
                .await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: StreamEvent) -> Result<(), WispError> {
        match event {
            StreamEvent::Connected { id, key } => {
                if let Some(stream) = self.streams.get_instance(id, key) {
                    stream.mark_connected();
                    trace!("[{}] Stream {} connected", self.id, id);
                }
            }
            StreamEvent::Data { id, key, data } => {
                if let Some(stream) = self.streams.get_instance(id, key) {
                    stream.record_transfer(data.len());
                    self.send(WispFrame::data(id, data)).await?;
                }
            }
            StreamEvent::Failed { id, key, error } => {
                if self.streams.remove_instance(id, key).is_some() {
                    warn!("[{}] Stream {} failed: {}", self.id, id, error);
                    self.send(WispFrame::close(id, error.close_reason()))
                        .await?;
                }
            }
            StreamEvent::Closed { id, key } => {
                if self.streams.remove_instance(id, key).is_some() {
                    debug!("[{}] Stream {} closed by remote", self.id, id);
                    self.send(WispFrame::close(id, CloseReason::Voluntary))
                        .await?;
                }
            }
            StreamEvent::Resolved {
                id,
                key,
                target,
                result,
            } => {
                // Closed or replaced while resolving.
                if self.resolving.get(&id).map(|pending| pending.key) != Some(key) {
                    return Ok(());
                }
                self.resolving.remove(&id);
                self.open_udp(id, key, &target, result).await?;
            }
        }
        Ok(())
    }

    async fn send(&mut self, frame: WispFrame) -> Result<(), WispError> {
        trace!(
            "[{}] -> {:?} stream {} ({} bytes)",
            self.id,
            frame.frame_type,
            frame.stream_id,
            frame.payload.len()
        );
        self.write.send(frame.encode()).await
    }

    async fn shutdown(&mut self) {
        self.state = State::Closed;
        let open = self.streams.len();
        self.streams.clear();
        self.resolving.clear();
        if let Err(e) = self.write.close().await {
            trace!("[{}] Error closing transport: {}", self.id, e);
        }
        debug!("[{}] Session closed, {} streams torn down", self.id, open);
    }
}
