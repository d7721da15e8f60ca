//! Axum WebSocket handler for Wisp protocol

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, trace};
use wisp_mux::{Dialer, Session, WispError};

use super::auth::StaticAuthenticator;
use super::config::WispConfig;
use super::dialer::PolicyDialer;

/// Application state for the Wisp handler
#[derive(Clone)]
pub struct WispState {
    pub config: Arc<WispConfig>,
    pub dialer: Arc<PolicyDialer>,
    pub authenticator: Option<Arc<StaticAuthenticator>>,
}

impl WispState {
    pub fn new(config: WispConfig) -> Self {
        let config = Arc::new(config);
        let dialer = Arc::new(PolicyDialer::new(config.clone()));
        let authenticator = config
            .auth_users
            .clone()
            .map(|users| Arc::new(StaticAuthenticator::new(users)));
        Self {
            config,
            dialer,
            authenticator,
        }
    }
}

impl Default for WispState {
    fn default() -> Self {
        Self::new(WispConfig::default())
    }
}

/// Axum handler for Wisp WebSocket connections
pub async fn wisp_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WispState>,
) -> impl IntoResponse {
    info!("New Wisp WebSocket connection");
    ws.on_upgrade(move |socket| handle_wisp_connection(socket, state))
}

/// Handle a single Wisp WebSocket connection
async fn handle_wisp_connection(socket: WebSocket, state: WispState) {
    let id = uuid::Uuid::new_v4().to_string();
    debug!("[{}] Wisp client connected", id);

    if let Err(e) = handle_wisp_inner(socket, state, &id).await {
        error!("[{}] Wisp connection error: {:#}", id, e);
    }

    debug!("[{}] Wisp client disconnected", id);
}

async fn handle_wisp_inner(socket: WebSocket, state: WispState, id: &str) -> anyhow::Result<()> {
    let ping_interval = Duration::from_secs(state.config.ping_interval_secs.max(1));
    let (read, write) = AxumWsTransport::new(socket).split(ping_interval);

    let dialer: Arc<dyn Dialer> = state.dialer.clone();
    let mut session =
        Session::new(read, write, state.config.session_config(), dialer).with_id(id);
    if let Some(authenticator) = &state.authenticator {
        session = session.with_authenticator(authenticator.clone());
    }

    session.run().await.context("Wisp session failed")
}

// ============================================================================
// WebSocket Transport Adapter
// ============================================================================

/// A WebSocket as the message transport a Wisp session runs over
pub struct AxumWsTransport {
    read: futures_util::stream::SplitStream<WebSocket>,
    write: futures_util::stream::SplitSink<WebSocket, Message>,
}

impl AxumWsTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (write, read) = socket.split();
        Self { read, write }
    }

    /// Split into the session's read and write halves
    pub fn split(self, ping_interval: Duration) -> (AxumWsRead, AxumWsWrite) {
        (
            AxumWsRead { inner: self.read },
            AxumWsWrite::new(self.write, ping_interval),
        )
    }
}

pin_project! {
    /// Read half: binary and text messages, each one Wisp frame
    pub struct AxumWsRead {
        #[pin]
        inner: futures_util::stream::SplitStream<WebSocket>,
    }
}

impl Stream for AxumWsRead {
    type Item = Result<Bytes, WispError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let msg = match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Poll::Ready(Some(Err(WispError::WsImplError(Box::new(e))))),
                None => return Poll::Ready(None),
            };
            match msg {
                Message::Binary(data) => return Poll::Ready(Some(Ok(data.into()))),
                Message::Text(text) => {
                    return Poll::Ready(Some(Ok(Bytes::from(text.into_bytes()))));
                }
                Message::Close(_) => return Poll::Ready(None),
                // axum answers pings itself
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

/// Write half: frames are queued to a single writer task
pub struct AxumWsWrite {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

enum WriteCommand {
    Send(Bytes),
    Close,
}

impl AxumWsWrite {
    fn new(
        write: futures_util::stream::SplitSink<WebSocket, Message>,
        ping_interval: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteCommand>();

        // Single writer: frames and keep-alive pings go out in order
        tokio::spawn(async move {
            let mut write = write;
            let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(WriteCommand::Send(data)) => {
                            if let Err(e) = write.send(Message::Binary(data.to_vec())).await {
                                trace!("WebSocket send error: {:?}", e);
                                break;
                            }
                        }
                        Some(WriteCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            let _ = write.close().await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        trace!("Sending WebSocket ping");
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { tx }
    }
}

impl Sink<Bytes> for AxumWsWrite {
    type Error = WispError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        self.tx
            .send(WriteCommand::Send(item))
            .map_err(|_| WispError::TransportClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // The writer task flushes
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let _ = self.tx.send(WriteCommand::Close);
        Poll::Ready(Ok(()))
    }
}
