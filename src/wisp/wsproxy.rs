//! Legacy wsproxy: one WebSocket piped straight to one TCP connection

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::select;
use tracing::{debug, error, info, trace};
use wisp_mux::{Dialer, StreamType};

use super::handler::WispState;

/// Split the `host:port` out of the last segment of a wsproxy path
pub fn parse_target(path: &str) -> Option<(&str, u16)> {
    let target = path.rsplit('/').next()?;
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Axum handler for `/wisp/*path`; the target is the path's last segment
pub async fn wsproxy_handler(
    ws: WebSocketUpgrade,
    Path(target): Path<String>,
    State(state): State<WispState>,
) -> impl IntoResponse {
    info!("New wsproxy connection to {}", target);
    ws.on_upgrade(move |socket| handle_wsproxy_connection(socket, target, state))
}

async fn handle_wsproxy_connection(mut socket: WebSocket, target: String, state: WispState) {
    let id = uuid::Uuid::new_v4().to_string();

    let dialer: Arc<dyn Dialer> = state.dialer.clone();
    let tcp = match connect(dialer.as_ref(), &target).await {
        Ok(tcp) => tcp,
        Err(e) => {
            error!("[{}] wsproxy connect failed: {:#}", id, e);
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    debug!("[{}] wsproxy connected to {}", id, target);
    if let Err(e) = forward_ws(socket, tcp, state.config.buffer_size).await {
        trace!("[{}] wsproxy ended with error: {:?}", id, e);
    }
    debug!("[{}] wsproxy to {} closed", id, target);
}

async fn connect(dialer: &dyn Dialer, target: &str) -> Result<TcpStream> {
    let (host, port) =
        parse_target(target).ok_or_else(|| anyhow!("Invalid wsproxy target: {}", target))?;
    let addr = wisp_mux::net::resolve(dialer, StreamType::Tcp, host, port)
        .await
        .with_context(|| format!("Failed to resolve {}", target))?;
    dialer
        .connect_tcp(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))
}

/// Copy bytes between the WebSocket and TCP until either side closes
async fn forward_ws(socket: WebSocket, mut tcp: TcpStream, buffer_size: usize) -> Result<()> {
    let (mut ws_write, mut ws_read) = socket.split();
    let (mut tcp_read, mut tcp_write) = tcp.split();

    let mut tcp_buf = vec![0u8; buffer_size];

    loop {
        select! {
            // WebSocket -> TCP
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => tcp_write.write_all(&data).await?,
                    Some(Ok(Message::Text(text))) => tcp_write.write_all(text.as_bytes()).await?,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        trace!("WebSocket read error: {:?}", e);
                        break;
                    }
                }
            }
            // TCP -> WebSocket
            result = tcp_read.read(&mut tcp_buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => ws_write.send(Message::Binary(tcp_buf[..n].to_vec())).await?,
                    Err(e) => {
                        trace!("TCP read error: {:?}", e);
                        break;
                    }
                }
            }
        }
    }

    let _ = ws_write.send(Message::Close(None)).await;
    let _ = tcp_write.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        assert_eq!(parse_target("example.com:443"), Some(("example.com", 443)));
        assert_eq!(parse_target("[::1]:8080"), Some(("[::1]", 8080)));
    }

    #[test]
    fn uses_last_path_segment() {
        assert_eq!(parse_target("v1/example.com:80"), Some(("example.com", 80)));
        assert_eq!(parse_target("a/b/10.0.0.1:22"), Some(("10.0.0.1", 22)));
        assert_eq!(parse_target("example.com:80/"), None);
    }

    #[test]
    fn rejects_malformed_targets() {
        assert_eq!(parse_target("example.com"), None);
        assert_eq!(parse_target(":443"), None);
        assert_eq!(parse_target("example.com:http"), None);
        assert_eq!(parse_target("example.com:70000"), None);
    }

    #[tokio::test]
    async fn blocked_targets_are_not_dialed() {
        let state = WispState::default();
        let dialer: Arc<dyn Dialer> = state.dialer.clone();
        // Loopback is off by default
        assert!(connect(dialer.as_ref(), "127.0.0.1:8080").await.is_err());
        assert!(connect(dialer.as_ref(), "not-a-target").await.is_err());
    }
}
