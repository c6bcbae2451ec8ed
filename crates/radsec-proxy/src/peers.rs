//! Peer registry
//!
//! Clients and servers are resolved to their full address sets once at
//! startup and never refreshed. Incoming source addresses are matched
//! against every resolved address of every configured peer of the same
//! transport; first match wins. An IPv4-mapped IPv6 source compares as its
//! IPv4 form, so a peer configured by A record still matches on a
//! dual-stack socket.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::config::{PeerEntry, Transport};
use crate::error::{ConfigError, ConfigResult};

/// Resolve a host to its address set, blocking. Startup only.
pub fn resolve(host: &str, port: u16) -> ConfigResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ConfigError::Unresolvable {
            host: host.to_string(),
            port,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConfigError::Unresolvable {
            host: host.to_string(),
            port,
        });
    }
    Ok(addrs)
}

/// Normalize an address for comparison: IPv4-mapped IPv6 becomes IPv4.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

/// A resolved peer: the configured entry plus its frozen address set.
#[derive(Debug, Clone)]
pub struct ResolvedPeer {
    pub entry: PeerEntry,
    pub addrs: Vec<SocketAddr>,
}

impl ResolvedPeer {
    pub fn new(entry: PeerEntry, default_port: u16) -> ConfigResult<ResolvedPeer> {
        let port = entry.port.unwrap_or(default_port);
        let addrs = resolve(&entry.host, port)?;
        Ok(ResolvedPeer { entry, addrs })
    }

    pub fn matches(&self, src: IpAddr) -> bool {
        let src = canonical(src);
        self.addrs.iter().any(|a| canonical(a.ip()) == src)
    }
}

/// Index of the first peer of the given transport whose address set
/// contains `src`, or `None`.
pub fn find_peer<'a>(
    peers: impl IntoIterator<Item = &'a ResolvedPeer>,
    transport: Transport,
    src: IpAddr,
) -> Option<usize> {
    peers
        .into_iter()
        .position(|p| p.entry.transport == transport && p.matches(src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn entry(host: &str, transport: Transport) -> PeerEntry {
        PeerEntry {
            host: host.to_string(),
            transport,
            secret: "testing123".to_string(),
            port: None,
            tls: None,
            status_server: false,
        }
    }

    fn resolved(host: &str, transport: Transport, addrs: &[&str]) -> ResolvedPeer {
        ResolvedPeer {
            entry: entry(host, transport),
            addrs: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    #[test]
    fn test_resolve_literal() {
        let addrs = resolve("127.0.0.1", 1812).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1812".parse().unwrap()]);
    }

    #[test]
    fn test_resolve_failure() {
        assert!(resolve("no-such-host.invalid.", 1812).is_err());
    }

    #[test]
    fn test_v4_mapped_comparison() {
        let peer = resolved("nas", Transport::Udp, &["192.0.2.7:1812"]);
        let mapped: Ipv6Addr = "::ffff:192.0.2.7".parse().unwrap();
        assert!(peer.matches(IpAddr::V6(mapped)));
        assert!(peer.matches("192.0.2.7".parse().unwrap()));
        assert!(!peer.matches("192.0.2.8".parse().unwrap()));
    }

    #[test]
    fn test_find_peer_first_match_and_transport() {
        let peers = vec![
            resolved("tls-peer", Transport::Tls, &["192.0.2.1:2083"]),
            resolved("udp-a", Transport::Udp, &["192.0.2.1:1812"]),
            resolved("udp-b", Transport::Udp, &["192.0.2.1:1812", "192.0.2.2:1812"]),
        ];
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();

        assert_eq!(find_peer(&peers, Transport::Udp, ip("192.0.2.1")), Some(1));
        assert_eq!(find_peer(&peers, Transport::Udp, ip("192.0.2.2")), Some(2));
        assert_eq!(find_peer(&peers, Transport::Tls, ip("192.0.2.1")), Some(0));
        assert_eq!(find_peer(&peers, Transport::Udp, ip("198.51.100.1")), None);
    }
}
