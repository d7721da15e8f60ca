//! Wisp wire codec.
//!
//! Every transport message carries exactly one frame:
//!
//! ```text
//! +------+---------------------+-------------------------+
//! | type | stream id (u32, LE) | payload (rest of frame) |
//! +------+---------------------+-------------------------+
//!  1 byte       4 bytes               variable
//! ```
//!
//! Stream ID 0 is reserved for session-level control: the initial credit
//! grant, the INFO handshake and the auth exchange.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::WispError;

/// Protocol major version spoken by this server.
pub const WISP_MAJOR_VERSION: u8 = 2;
pub const WISP_MINOR_VERSION: u8 = 0;

/// Credit granted on stream 0 at session start and on every TCP refill.
pub const DEFAULT_CREDIT: u32 = 127;

/// type(1) + stream id(4).
pub const HEADER_LEN: usize = 5;

/// Extension ID advertising UDP stream support.
pub const UDP_EXTENSION_ID: u8 = 0x01;
/// Extension ID advertising username/password authentication.
pub const AUTH_EXTENSION_ID: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Data = 0x02,
    Continue = 0x03,
    Close = 0x04,
    Info = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum StreamType {
    Tcp = 0x01,
    Udp = 0x02,
}

/// Reason byte carried by a CLOSE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CloseReason {
    /// Reason unspecified or not understood.
    Unknown = 0x01,
    /// Normal close.
    Voluntary = 0x02,
    /// Generic network error.
    Unexpected = 0x03,
    /// Client and server could not agree on extensions.
    IncompatibleExtensions = 0x04,
    /// Stream rejected: unsupported type, duplicate ID or disabled extension.
    ServerStreamInvalidInfo = 0x41,
    /// Destination could not be resolved or reached.
    ServerStreamUnreachable = 0x42,
    ServerStreamConnectionTimedOut = 0x43,
    ServerStreamConnectionRefused = 0x44,
    /// Destination refused by server policy.
    ServerStreamBlockedAddress = 0x48,
    /// Stream exceeded the throttling limit.
    ServerStreamThrottled = 0x49,
    ClientUnexpected = 0x81,
}

/// One decoded transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WispFrame {
    pub frame_type: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl WispFrame {
    pub fn new(frame_type: FrameType, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            stream_id,
            payload,
        }
    }

    /// Parse a whole transport message. The payload is not interpreted.
    pub fn decode(mut bytes: Bytes) -> Result<Self, WispError> {
        if bytes.len() < HEADER_LEN {
            return Err(WispError::PacketTooSmall);
        }
        let frame_type = FrameType::try_from(bytes.get_u8())?;
        let stream_id = bytes.get_u32_le();

        Ok(Self {
            frame_type,
            stream_id,
            payload: bytes,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type.into());
        buf.put_u32_le(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn connect(stream_id: u32, packet: &ConnectPacket) -> Self {
        Self::new(FrameType::Connect, stream_id, packet.encode())
    }

    pub fn data(stream_id: u32, data: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, data)
    }

    pub fn continue_with(stream_id: u32, buffer_remaining: u32) -> Self {
        Self::new(
            FrameType::Continue,
            stream_id,
            ContinuePacket { buffer_remaining }.encode(),
        )
    }

    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self::new(FrameType::Close, stream_id, ClosePacket { reason }.encode())
    }

    /// INFO frames always travel on stream 0.
    pub fn info(packet: &InfoPacket) -> Self {
        Self::new(FrameType::Info, 0, packet.encode())
    }

    pub fn auth_request(packet: &AuthPacket) -> Self {
        Self::new(FrameType::Info, 0, packet.encode())
    }

    /// Server verdict on an [`AuthPacket`]: a single success byte.
    pub fn auth_response(success: bool) -> Self {
        Self::new(FrameType::Info, 0, Bytes::from_static(if success { &[1u8] } else { &[0u8] }))
    }
}

/// Payload of a CONNECT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub stream_type: StreamType,
    pub port: u16,
    /// Literal IPv4/IPv6 address or DNS name; runs to the end of the payload.
    pub host: String,
}

impl ConnectPacket {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WispError> {
        if payload.len() < 3 {
            return Err(WispError::PacketTooSmall);
        }
        let stream_type = StreamType::try_from(payload.get_u8())?;
        let port = payload.get_u16_le();
        let host = std::str::from_utf8(payload)?.to_string();

        Ok(Self {
            stream_type,
            port,
            host,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.host.len());
        buf.put_u8(self.stream_type.into());
        buf.put_u16_le(self.port);
        buf.extend_from_slice(self.host.as_bytes());
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuePacket {
    pub buffer_remaining: u32,
}

impl ContinuePacket {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WispError> {
        if payload.len() < 4 {
            return Err(WispError::PacketTooSmall);
        }
        Ok(Self {
            buffer_remaining: payload.get_u32_le(),
        })
    }

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer_remaining.to_le_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePacket {
    pub reason: CloseReason,
}

impl ClosePacket {
    /// Reason bytes this server does not know decode as [`CloseReason::Unknown`].
    pub fn decode(payload: &[u8]) -> Result<Self, WispError> {
        let byte = *payload.first().ok_or(WispError::PacketTooSmall)?;
        Ok(Self {
            reason: CloseReason::try_from(byte).unwrap_or(CloseReason::Unknown),
        })
    }

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[u8::from(self.reason)])
    }
}

/// A capability record inside an INFO payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u8,
    pub payload: Bytes,
}

impl Extension {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            payload: Bytes::new(),
        }
    }
}

/// Handshake payload: version followed by extension records.
///
/// ```text
/// major(1) minor(1) { id(1) len(u32 LE) payload(len) }*
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPacket {
    pub major: u8,
    pub minor: u8,
    pub extensions: Vec<Extension>,
}

impl InfoPacket {
    /// An INFO packet for the version this server speaks.
    pub fn current(extensions: Vec<Extension>) -> Self {
        Self {
            major: WISP_MAJOR_VERSION,
            minor: WISP_MINOR_VERSION,
            extensions,
        }
    }

    /// Fails on any major version other than [`WISP_MAJOR_VERSION`] before
    /// looking at the extension list.
    pub fn decode(mut payload: &[u8]) -> Result<Self, WispError> {
        if payload.len() < 2 {
            return Err(WispError::PacketTooSmall);
        }
        let major = payload.get_u8();
        let minor = payload.get_u8();
        if major != WISP_MAJOR_VERSION {
            return Err(WispError::IncompatibleProtocolVersion(major, minor));
        }

        let mut extensions = Vec::new();
        while payload.has_remaining() {
            let id = payload.get_u8();
            if payload.remaining() < 4 {
                return Err(WispError::ExtensionTruncated(id));
            }
            let len = payload.get_u32_le() as usize;
            if payload.remaining() < len {
                return Err(WispError::ExtensionTruncated(id));
            }
            extensions.push(Extension {
                id,
                payload: Bytes::copy_from_slice(&payload[..len]),
            });
            payload.advance(len);
        }

        Ok(Self {
            major,
            minor,
            extensions,
        })
    }

    pub fn encode(&self) -> Bytes {
        let len = 2 + self
            .extensions
            .iter()
            .map(|ext| 5 + ext.payload.len())
            .sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.major);
        buf.put_u8(self.minor);
        for ext in &self.extensions {
            buf.put_u8(ext.id);
            buf.put_u32_le(ext.payload.len() as u32);
            buf.extend_from_slice(&ext.payload);
        }
        buf.freeze()
    }

    pub fn has_extension(&self, id: u8) -> bool {
        self.extensions.iter().any(|ext| ext.id == id)
    }
}

/// Credentials sent by the client once the auth extension is negotiated.
///
/// ```text
/// username_len(1) password_len(u16 LE) username password
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPacket {
    pub username: String,
    pub password: String,
}

impl AuthPacket {
    pub fn decode(mut payload: &[u8]) -> Result<Self, WispError> {
        if payload.len() < 3 {
            return Err(WispError::PacketTooSmall);
        }
        let username_len = payload.get_u8() as usize;
        let password_len = payload.get_u16_le() as usize;
        if payload.len() < username_len + password_len {
            return Err(WispError::PacketTooSmall);
        }
        let username = std::str::from_utf8(&payload[..username_len])?.to_string();
        let password =
            std::str::from_utf8(&payload[username_len..username_len + password_len])?.to_string();

        Ok(Self { username, password })
    }

    /// Usernames longer than 255 bytes or passwords longer than 65535 bytes
    /// are truncated to fit their length fields.
    pub fn encode(&self) -> Bytes {
        let username = &self.username.as_bytes()[..self.username.len().min(u8::MAX as usize)];
        let password = &self.password.as_bytes()[..self.password.len().min(u16::MAX as usize)];
        let mut buf = BytesMut::with_capacity(3 + username.len() + password.len());
        buf.put_u8(username.len() as u8);
        buf.put_u16_le(password.len() as u16);
        buf.extend_from_slice(username);
        buf.extend_from_slice(password);
        buf.freeze()
    }
}
