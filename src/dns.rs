//! Domain resolution with a fallback chain and a process-local cache.
//!
//! Resolution order: cache, the operating system's resolver, a configured
//! resolver over the public nameserver list, then each nameserver queried
//! individually as a last resort. The first successful answer is cached for
//! the lifetime of the worker process and never refreshed.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfigGroup, ResolverConfig, ResolverOpts,
};
use hickory_resolver::Resolver;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

/// Public nameservers tried after the system resolver, in order.
pub const NAMESERVERS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(1, 0, 0, 1),
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);
const QUERY_ATTEMPTS: usize = 2;

/// All resolution methods were exhausted for a domain.
#[derive(Debug, Error)]
#[error("failed to resolve {domain}: {reason}")]
pub struct DnsError {
    pub domain: String,
    /// The last underlying error in the fallback chain.
    pub reason: String,
}

pub struct DnsResolver {
    cache: Mutex<HashMap<String, Ipv4Addr>>,
}

impl DnsResolver {
    pub fn new() -> Self {
        DnsResolver {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a domain to one IPv4 address, consulting the cache first.
    pub fn resolve(&self, domain: &str) -> Result<Ipv4Addr, DnsError> {
        if let Some(ip) = self.cache.lock().get(domain) {
            return Ok(*ip);
        }
        let ip = self.resolve_uncached(domain)?;
        self.cache_store(domain, ip);
        Ok(ip)
    }

    fn resolve_uncached(&self, domain: &str) -> Result<Ipv4Addr, DnsError> {
        let mut last_error;

        match system_lookup(domain) {
            Ok(ip) => return Ok(ip),
            Err(e) => {
                debug!("system resolver failed for {domain}: {e}");
                last_error = e;
            }
        }

        match nameserver_lookup(domain, &NAMESERVERS) {
            Ok(ip) => return Ok(ip),
            Err(e) => {
                debug!("configured resolver failed for {domain}: {e}");
                last_error = e;
            }
        }

        for ns in NAMESERVERS {
            match nameserver_lookup(domain, &[ns]) {
                Ok(ip) => return Ok(ip),
                Err(e) => {
                    debug!("nameserver {ns} failed for {domain}: {e}");
                    last_error = e;
                }
            }
        }

        Err(DnsError {
            domain: domain.to_string(),
            reason: last_error,
        })
    }

    /// First successful value wins; a later resolution never replaces it.
    fn cache_store(&self, domain: &str, ip: Ipv4Addr) {
        self.cache
            .lock()
            .entry(domain.to_string())
            .or_insert(ip);
    }
}

/// Resolve through the operating system (getaddrinfo), keeping IPv4 only.
fn system_lookup(domain: &str) -> Result<Ipv4Addr, String> {
    let addrs = (domain, 0u16)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| "no IPv4 addresses".to_string())
}

/// Resolve against an explicit nameserver set with bounded timeouts.
fn nameserver_lookup(domain: &str, servers: &[Ipv4Addr]) -> Result<Ipv4Addr, String> {
    let ips: Vec<IpAddr> = servers.iter().map(|ip| IpAddr::V4(*ip)).collect();
    let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
    let config = ResolverConfig::from_parts(None, vec![], group);

    let mut opts = ResolverOpts::default();
    opts.timeout = QUERY_TIMEOUT;
    opts.attempts = QUERY_ATTEMPTS;
    opts.ip_strategy = LookupIpStrategy::Ipv4Only;

    let resolver = Resolver::new(config, opts).map_err(|e| e.to_string())?;
    // Trailing dot: query the name as given, without search-domain expansion.
    let fqdn = format!("{domain}.");
    let lookup = resolver.lookup_ip(fqdn.as_str()).map_err(|e| e.to_string())?;
    lookup
        .iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| "no A records".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_hit_skips_resolution() {
        let resolver = DnsResolver::new();
        // A reserved TLD can never resolve; only the cache can answer.
        resolver.cache_store("cached.invalid", Ipv4Addr::new(10, 1, 2, 3));
        let ip = resolver.resolve("cached.invalid").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn test_cache_first_value_wins() {
        let resolver = DnsResolver::new();
        resolver.cache_store("host.invalid", Ipv4Addr::new(10, 0, 0, 1));
        resolver.cache_store("host.invalid", Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            resolver.resolve("host.invalid").unwrap(),
            Ipv4Addr::new(10, 0, 0, 1)
        );
    }

    #[test]
    fn test_system_lookup_localhost() {
        let ip = system_lookup("localhost").unwrap();
        assert!(ip.is_loopback());
    }

    #[test]
    fn test_resolve_localhost_via_system_resolver() {
        let resolver = DnsResolver::new();
        let ip = resolver.resolve("localhost").unwrap();
        assert!(ip.is_loopback());
        // Second call must come from the cache.
        assert_eq!(resolver.resolve("localhost").unwrap(), ip);
    }

    #[test]
    fn test_dns_error_carries_domain_and_reason() {
        let err = DnsError {
            domain: "missing.example".into(),
            reason: "no A records".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing.example"));
        assert!(msg.contains("no A records"));
    }

    #[test]
    fn test_nameserver_list_order() {
        assert_eq!(NAMESERVERS[0], Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(NAMESERVERS[1], Ipv4Addr::new(8, 8, 4, 4));
        assert_eq!(NAMESERVERS[2], Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(NAMESERVERS[3], Ipv4Addr::new(1, 0, 0, 1));
    }
}
