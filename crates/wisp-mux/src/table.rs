//! Per-session stream ownership.

use std::time::Duration;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Throttling extension settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Bytes a stream may move, in either direction, within one interval.
    pub limit_bytes: u64,
    pub interval: Duration,
}

/// Protocol-specific stream state, fixed at CONNECT time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// DATA frames the client may still send before it needs a CONTINUE.
    Tcp { send_credit: u32 },
    /// Whether the UDP association has completed.
    Udp { connected: bool },
}

/// Handle to the task that owns a stream's socket.
///
/// Dropping it tears the socket down.
#[derive(Debug)]
pub struct SocketHandle {
    outbound: flume::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl SocketHandle {
    pub fn new(outbound: flume::Sender<Bytes>, task: JoinHandle<()>) -> Self {
        Self { outbound, task }
    }

    /// Queue bytes for the socket. Returns false once the socket task is gone.
    pub fn send(&self, data: Bytes) -> bool {
        self.outbound.send(data).is_ok()
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
pub struct Stream {
    pub id: u32,
    /// Distinguishes this stream from earlier ones that used the same ID.
    pub key: u64,
    pub kind: StreamKind,
    pub socket: SocketHandle,
    pub bytes_transferred: u64,
    pub last_throttle_check: Instant,
}

impl Stream {
    pub fn tcp(id: u32, key: u64, send_credit: u32, socket: SocketHandle) -> Self {
        Self::new(id, key, StreamKind::Tcp { send_credit }, socket)
    }

    pub fn udp(id: u32, key: u64, socket: SocketHandle) -> Self {
        Self::new(id, key, StreamKind::Udp { connected: false }, socket)
    }

    fn new(id: u32, key: u64, kind: StreamKind, socket: SocketHandle) -> Self {
        Self {
            id,
            key,
            kind,
            socket,
            bytes_transferred: 0,
            last_throttle_check: Instant::now(),
        }
    }

    /// Account for one inbound DATA frame.
    ///
    /// Returns the credit to grant in a CONTINUE when the window is used up
    /// and has been refilled to `window`. UDP streams carry no credit.
    pub fn consume_credit(&mut self, window: u32) -> Option<u32> {
        match &mut self.kind {
            StreamKind::Tcp { send_credit } => {
                *send_credit = send_credit.saturating_sub(1);
                if *send_credit == 0 {
                    *send_credit = window;
                    Some(window)
                } else {
                    None
                }
            }
            StreamKind::Udp { .. } => None,
        }
    }

    pub fn mark_connected(&mut self) {
        if let StreamKind::Udp { connected } = &mut self.kind {
            *connected = true;
        }
    }

    pub fn record_transfer(&mut self, len: usize) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(len as u64);
    }
}

#[derive(Debug, Default)]
pub struct StreamTable {
    streams: FxHashMap<u32, Stream>,
    next_key: u64,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A key no stream in this table has used yet.
    pub fn next_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    /// Register a stream. Hands it back if its ID is already live.
    pub fn insert(&mut self, stream: Stream) -> Result<(), Stream> {
        if self.streams.contains_key(&stream.id) {
            return Err(stream);
        }
        self.streams.insert(stream.id, stream);
        Ok(())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// The stream with this ID, but only if it is the instance named by `key`.
    pub fn get_instance(&mut self, id: u32, key: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id).filter(|stream| stream.key == key)
    }

    pub fn remove(&mut self, id: u32) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn remove_instance(&mut self, id: u32, key: u64) -> Option<Stream> {
        match self.streams.get(&id) {
            Some(stream) if stream.key == key => self.streams.remove(&id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Tear down every stream.
    pub fn clear(&mut self) {
        self.streams.clear();
    }

    /// Run one throttle check at `now`.
    ///
    /// Every stream whose interval has elapsed starts a new window. Streams
    /// that moved `limit_bytes` or more in the window just ended are
    /// returned for teardown; the rest have their byte count reset.
    pub fn throttle_sweep(&mut self, now: Instant, config: &ThrottleConfig) -> Vec<u32> {
        let mut breached = Vec::new();
        for stream in self.streams.values_mut() {
            if now.saturating_duration_since(stream.last_throttle_check) < config.interval {
                continue;
            }
            stream.last_throttle_check = now;
            if stream.bytes_transferred >= config.limit_bytes {
                breached.push(stream.id);
            } else {
                stream.bytes_transferred = 0;
            }
        }
        breached
    }
}
