//! Server side of the Wisp protocol.
//!
//! Wisp multiplexes many TCP/UDP streams over one ordered, message-oriented
//! transport (usually a WebSocket). This crate owns the wire codec, the
//! per-session stream table and the session loop that routes frames to
//! outbound sockets. Upgrading a request into a transport is left to the
//! caller: anything that is a `Stream<Item = Result<Bytes, WispError>>` plus a
//! `Sink<Bytes, Error = WispError>` can drive a [`Session`].

pub mod auth;
pub mod close;
pub mod net;
pub mod packet;
pub mod session;
pub mod table;

use std::io;

use num_enum::TryFromPrimitiveError;
use thiserror::Error;

pub use auth::Authenticator;
pub use close::classify_io_error;
pub use net::{DialError, Dialer, DirectDialer};
pub use packet::{CloseReason, StreamType, WispFrame};
pub use session::{Session, SessionConfig};
pub use table::ThrottleConfig;

/// Errors that abort a session or fail to decode a frame.
#[derive(Debug, Error)]
pub enum WispError {
    /// The message or payload was shorter than its fixed header.
    #[error("Packet too small")]
    PacketTooSmall,
    #[error("Invalid packet type {0:#04x}")]
    InvalidPacketType(u8),
    #[error("Invalid stream type {0:#04x}")]
    InvalidStreamType(u8),
    /// A frame used a stream ID that is not valid for its type.
    #[error("Invalid stream id {0}")]
    InvalidStreamId(u32),
    #[error("Invalid UTF-8 in packet: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Incompatible protocol version {0}.{1}")]
    IncompatibleProtocolVersion(u8, u8),
    /// An extension record claimed more bytes than the INFO payload holds.
    #[error("Extension {0:#04x} truncated")]
    ExtensionTruncated(u8),
    #[error("Authentication failed for user {0:?}")]
    AuthenticationFailed(String),
    #[error("Authentication required but not negotiated by the client")]
    AuthenticationRequired,
    #[error("Handshake timed out")]
    HandshakeTimedOut,
    #[error("Transport closed")]
    TransportClosed,
    /// Error from the underlying WebSocket implementation.
    #[error("Transport error: {0}")]
    WsImplError(Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<TryFromPrimitiveError<packet::FrameType>> for WispError {
    fn from(err: TryFromPrimitiveError<packet::FrameType>) -> Self {
        Self::InvalidPacketType(err.number)
    }
}

impl From<TryFromPrimitiveError<StreamType>> for WispError {
    fn from(err: TryFromPrimitiveError<StreamType>) -> Self {
        Self::InvalidStreamType(err.number)
    }
}
