//! Network interface lookup and auto-selection.
//!
//! Workers verify at startup that the bind IP really belongs to a LAN-facing
//! interface; the CLI uses the same enumeration to pick an interface when
//! none is given.

use std::io;
use std::net::Ipv4Addr;

/// Interface name prefixes accepted as an egress target.
pub const ALLOWED_PREFIXES: &[&str] = &["en", "eth", "wlan", "wifi", "wlp", "wl"];

/// Loopback and virtual interfaces skipped during auto-selection.
const SKIP_PREFIXES: &[&str] = &["lo", "vmnet", "docker", "veth", "bridge", "utun"];

/// Wireless-looking names, preferred during auto-selection.
const WIRELESS_PREFIXES: &[&str] = &["wlan", "wifi", "wlp", "wl", "en", "ap"];

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Ipv4Addr,
}

/// Name of the interface carrying the given IPv4 address, if any.
pub fn interface_for_ip(ip: Ipv4Addr) -> io::Result<Option<String>> {
    for iface in if_addrs::get_if_addrs()? {
        if iface.ip() == std::net::IpAddr::V4(ip) {
            return Ok(Some(iface.name));
        }
    }
    Ok(None)
}

/// Is this interface name acceptable as an egress target?
pub fn is_allowed_interface_name(name: &str) -> bool {
    has_prefix(name, ALLOWED_PREFIXES)
}

/// Pick the most suitable interface: a connected wireless one if possible,
/// else any interface with a usable IPv4 address.
pub fn select_interface() -> io::Result<Option<NetworkInterface>> {
    let mut candidates = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if has_prefix(&iface.name, SKIP_PREFIXES) {
            continue;
        }
        if let std::net::IpAddr::V4(ip) = iface.ip() {
            candidates.push(NetworkInterface {
                name: iface.name,
                ip,
            });
        }
    }
    Ok(pick(candidates))
}

fn pick(candidates: Vec<NetworkInterface>) -> Option<NetworkInterface> {
    let wireless: Vec<&NetworkInterface> = candidates
        .iter()
        .filter(|iface| has_prefix(&iface.name, WIRELESS_PREFIXES))
        .collect();
    if let Some(connected) = wireless.iter().find(|iface| usable_ip(iface.ip)) {
        return Some((*connected).clone());
    }
    if let Some(first) = wireless.first() {
        return Some((*first).clone());
    }
    candidates.into_iter().find(|iface| usable_ip(iface.ip))
}

fn has_prefix(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p))
}

/// Loopback and link-local addresses are not routable egress addresses.
fn usable_ip(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local()
}
