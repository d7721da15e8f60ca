//! Mapping from outbound socket failures to CLOSE reasons.

use std::io;

use crate::packet::CloseReason;

/// Classify an outbound socket error into the reason sent to the client.
///
/// `PermissionDenied` is what policy-enforcing dialers report for refused
/// destinations, so it maps to a blocked address.
pub fn classify_io_error(err: &io::Error) -> CloseReason {
    match err.kind() {
        io::ErrorKind::ConnectionReset => CloseReason::Voluntary,
        io::ErrorKind::HostUnreachable => CloseReason::ServerStreamUnreachable,
        io::ErrorKind::TimedOut => CloseReason::ServerStreamConnectionTimedOut,
        io::ErrorKind::ConnectionRefused => CloseReason::ServerStreamConnectionRefused,
        io::ErrorKind::PermissionDenied => CloseReason::ServerStreamBlockedAddress,
        _ => CloseReason::Unexpected,
    }
}

impl From<&io::Error> for CloseReason {
    fn from(err: &io::Error) -> Self {
        classify_io_error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(kind: io::ErrorKind) -> u8 {
        classify_io_error(&io::Error::from(kind)).into()
    }

    #[test]
    fn maps_socket_failures() {
        assert_eq!(reason(io::ErrorKind::ConnectionReset), 0x02);
        assert_eq!(reason(io::ErrorKind::HostUnreachable), 0x42);
        assert_eq!(reason(io::ErrorKind::TimedOut), 0x43);
        assert_eq!(reason(io::ErrorKind::ConnectionRefused), 0x44);
    }

    #[test]
    fn everything_else_is_a_network_error() {
        assert_eq!(reason(io::ErrorKind::BrokenPipe), 0x03);
        assert_eq!(reason(io::ErrorKind::AddrNotAvailable), 0x03);
        assert_eq!(reason(io::ErrorKind::Other), 0x03);
    }

    #[test]
    fn os_error_codes_are_classified_by_kind() {
        // ECONNREFUSED on Linux.
        #[cfg(target_os = "linux")]
        assert_eq!(
            CloseReason::from(&io::Error::from_raw_os_error(111)),
            CloseReason::ServerStreamConnectionRefused
        );
    }
}
