//! Connection policy for proxied TCP/UDP streams

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wisp_mux::{DialError, Dialer, StreamType};

use super::config::WispConfig;
use super::resolver::Resolver;

// IP validation helpers
fn ipv4_is_private(addr: Ipv4Addr) -> bool {
    addr.is_private() || addr.is_loopback() || addr.is_link_local()
}

fn ipv6_is_private(addr: Ipv6Addr) -> bool {
    addr.is_loopback()
        || (addr.segments()[0] & 0xfe00) == 0xfc00 // Unique local
        || (addr.segments()[0] & 0xffc0) == 0xfe80 // Link local
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => ipv4_is_private(v4),
        IpAddr::V6(v6) => ipv6_is_private(v6),
    }
}

/// Dialer that enforces the server's destination policy
pub struct PolicyDialer {
    config: Arc<WispConfig>,
    resolver: Resolver,
}

impl PolicyDialer {
    pub fn new(config: Arc<WispConfig>) -> Self {
        let resolver = Resolver::new(&config.dns_servers);
        Self { config, resolver }
    }
}

#[async_trait]
impl Dialer for PolicyDialer {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        self.resolver.lookup(host).await
    }

    fn check(&self, stream_type: StreamType, addr: SocketAddr) -> Result<(), DialError> {
        let config = &self.config;
        let allowed = match stream_type {
            StreamType::Tcp => config.allow_tcp,
            StreamType::Udp => config.allow_udp,
        };
        if !allowed {
            debug!("{:?} streams are disabled", stream_type);
            return Err(DialError::Blocked(addr.to_string()));
        }

        if config.is_port_blocked(addr.port()) {
            debug!("Port {} is blocked", addr.port());
            return Err(DialError::Blocked(addr.to_string()));
        }

        let ip = addr.ip();
        if ip.is_loopback() && !config.allow_loopback {
            return Err(DialError::Blocked(addr.to_string()));
        }
        if !ip.is_loopback() && is_private(ip) && !config.allow_private {
            return Err(DialError::Blocked(addr.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialer(config: WispConfig) -> PolicyDialer {
        PolicyDialer {
            config: Arc::new(config),
            resolver: Resolver::System,
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn blocked_ports_are_refused() {
        let dialer = dialer(WispConfig::default());
        assert!(dialer.check(StreamType::Tcp, addr("93.184.216.34:443")).is_ok());
        let err = dialer
            .check(StreamType::Tcp, addr("93.184.216.34:22"))
            .unwrap_err();
        assert_eq!(
            err.close_reason(),
            wisp_mux::CloseReason::ServerStreamBlockedAddress
        );
    }

    #[test]
    fn loopback_and_private_follow_config() {
        let dialer = dialer(WispConfig {
            allow_private: false,
            ..Default::default()
        });
        assert!(dialer.check(StreamType::Tcp, addr("127.0.0.1:80")).is_err());
        assert!(dialer.check(StreamType::Tcp, addr("10.1.2.3:80")).is_err());
        assert!(dialer.check(StreamType::Udp, addr("[fd00::1]:53")).is_err());
        assert!(dialer.check(StreamType::Udp, addr("1.1.1.1:53")).is_ok());
    }

    #[test]
    fn allowed_loopback_is_not_caught_by_private_check() {
        let dialer = dialer(WispConfig {
            allow_loopback: true,
            allow_private: false,
            ..Default::default()
        });
        assert!(dialer.check(StreamType::Tcp, addr("127.0.0.1:8080")).is_ok());
    }

    #[test]
    fn disabled_stream_types_are_refused() {
        let dialer = dialer(WispConfig {
            allow_udp: false,
            ..Default::default()
        });
        assert!(dialer.check(StreamType::Udp, addr("1.1.1.1:53")).is_err());
        assert!(dialer.check(StreamType::Tcp, addr("1.1.1.1:443")).is_ok());
    }

    #[tokio::test]
    async fn literal_hosts_skip_dns() {
        let dialer = dialer(WispConfig::default());
        let resolved = wisp_mux::net::resolve(&dialer, StreamType::Tcp, "1.1.1.1", 443)
            .await
            .unwrap();
        assert_eq!(resolved, addr("1.1.1.1:443"));
    }
}
