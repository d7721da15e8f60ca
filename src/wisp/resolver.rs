//! DNS lookups for outbound streams

use std::io;
use std::net::IpAddr;

use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use tracing::{trace, warn};
use wisp_mux::DialError;

/// Where hostname lookups go
pub enum Resolver {
    Hickory(Box<TokioResolver>),
    /// The OS resolver through `getaddrinfo`
    System,
}

impl Resolver {
    /// Use `dns_servers` when any of them parse, else the system configuration
    pub fn new(dns_servers: &[String]) -> Self {
        let servers: Vec<IpAddr> = dns_servers
            .iter()
            .filter_map(|server| match server.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!("Ignoring invalid DNS server {:?}", server);
                    None
                }
            })
            .collect();

        if servers.is_empty() {
            Self::from_system_conf()
        } else {
            Self::with_name_servers(&servers)
        }
    }

    fn with_name_servers(servers: &[IpAddr]) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(servers, 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        Self::Hickory(Box::new(
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build(),
        ))
    }

    fn from_system_conf() -> Self {
        match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, opts)) => Self::Hickory(Box::new(
                TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                    .with_options(opts)
                    .build(),
            )),
            Err(e) => {
                warn!("Unable to read system DNS config ({}), using getaddrinfo", e);
                Self::System
            }
        }
    }

    /// All addresses `host` resolves to, in resolver order
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DialError> {
        let resolve_error = |source: io::Error| DialError::Resolve {
            host: host.to_string(),
            source,
        };

        let addrs: Vec<IpAddr> = match self {
            Self::Hickory(resolver) => resolver
                .lookup_ip(host)
                .await
                .map_err(|e| resolve_error(io::Error::other(e)))?
                .into_iter()
                .collect(),
            Self::System => tokio::net::lookup_host((host, 0))
                .await
                .map_err(resolve_error)?
                .map(|addr| addr.ip())
                .collect(),
        };
        trace!("{} resolved to {:?}", host, addrs);
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn system_lookup_errors_are_resolve_failures() {
        let err = Resolver::System
            .lookup("name.invalid")
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Resolve { ref host, .. } if host == "name.invalid"));
        assert_eq!(
            err.close_reason(),
            wisp_mux::CloseReason::ServerStreamUnreachable
        );
    }
}
