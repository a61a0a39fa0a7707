//! Worker process: listener setup, accept loop, and SOCKS5 negotiation.
//!
//! Each worker binds its own listening socket on the shared `(ip, port)`
//! with `SO_REUSEADDR` + `SO_REUSEPORT`, so the kernel load-balances
//! accepted connections across the worker processes. Every accepted
//! connection gets its own handler thread which drives the handshake and,
//! on success, hands both sockets to the relay.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use crate::dns::DnsResolver;
use crate::iface;
use crate::relay::{self, IDLE_TIMEOUT};
use crate::socks::{self, AddrType, ReplyCode, SocksError};
use crate::stats::{format_bytes, ProxyStats};

/// Timeout for the outbound connect to the destination.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A client that stalls mid-negotiation is dropped after this long.
const NEGOTIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Listen backlog per worker.
const LISTEN_BACKLOG: i32 = 128;

/// Interval between worker stats log lines.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Dependencies a handler thread needs, shared across the worker.
pub struct ProxyContext {
    /// Local IP the outbound sockets bind to; pins egress to one interface.
    pub bind_ip: Ipv4Addr,
    pub dns: DnsResolver,
    pub stats: Arc<ProxyStats>,
}

/// Run one worker: pre-flight checks, bind, and the accept loop. Only
/// returns on a bind or pre-flight failure; the supervisor handles the
/// exit.
pub fn run_worker(bind_ip: Ipv4Addr, port: u16) -> io::Result<()> {
    preflight(bind_ip)?;

    let listener = bind_reuseport(bind_ip, port)?;
    info!("worker listening on {bind_ip}:{port}");

    let ctx = Arc::new(ProxyContext {
        bind_ip,
        dns: DnsResolver::new(),
        stats: Arc::new(ProxyStats::new()),
    });

    let stats = Arc::clone(&ctx.stats);
    thread::spawn(move || loop {
        thread::sleep(STATS_LOG_INTERVAL);
        let snap = stats.snapshot();
        debug!(
            active = snap.active_connections,
            sent = %format_bytes(snap.total_bytes_sent as f64),
            received = %format_bytes(snap.total_bytes_received as f64),
            bandwidth = %format_bytes(snap.bandwidth),
            "worker stats"
        );
    });

    for stream in listener.incoming() {
        match stream {
            Ok(client) => {
                let ctx = Arc::clone(&ctx);
                thread::spawn(move || handle_client(client, &ctx));
            }
            Err(e) => {
                warn!("failed to accept connection: {e}");
                thread::sleep(Duration::from_micros(64));
            }
        }
    }
    Ok(())
}

/// The bind IP must sit on an interface we recognize as a LAN/WiFi egress
/// target; loopback is allowed for local use. Missing root privileges are
/// worth a warning, not a refusal.
fn preflight(bind_ip: Ipv4Addr) -> io::Result<()> {
    if !bind_ip.is_loopback() {
        match iface::interface_for_ip(bind_ip)? {
            Some(name) if iface::is_allowed_interface_name(&name) => {
                info!(interface = %name, "egress interface verified");
            }
            Some(name) => {
                return Err(io::Error::other(format!(
                    "{bind_ip} belongs to interface {name}, which is not a usable egress interface"
                )));
            }
            None => {
                return Err(io::Error::other(format!(
                    "{bind_ip} is not assigned to any local interface"
                )));
            }
        }
    }
    if !is_root() {
        warn!("running without root privileges; binding or relaying may be limited");
    }
    Ok(())
}

fn is_root() -> bool {
    // Safety: geteuid has no failure mode and touches no memory.
    unsafe { libc::geteuid() == 0 }
}

/// Bind a listener with address and port reuse enabled, so several worker
/// processes can share one `(ip, port)`.
fn bind_reuseport(ip: Ipv4Addr, port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((ip, port)).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// One thread per accepted connection. Every exit path, panic included,
/// releases the active-connection count through the guard.
fn handle_client(mut client: TcpStream, ctx: &ProxyContext) {
    let peer = match client.peer_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };
    let _guard = ctx.stats.connection_guard();

    match negotiate(&mut client, ctx) {
        Ok((remote, target)) => {
            debug!(%peer, %target, "tunnel established");
            match relay::relay(client, remote, &ctx.stats, IDLE_TIMEOUT) {
                Ok(totals) => debug!(
                    %peer,
                    %target,
                    sent = %format_bytes(totals.sent as f64),
                    received = %format_bytes(totals.received as f64),
                    "connection closed"
                ),
                Err(e) => debug!(%peer, "relay setup failed: {e}"),
            }
        }
        Err(e) => {
            if let Some(code) = e.reply_code() {
                let _ = client.write_all(&socks::build_error_reply(code));
            }
            debug!(%peer, "negotiation failed: {e}");
        }
    }
}

/// Drive the SOCKS5 handshake and CONNECT request, returning the connected
/// remote socket and the destination it reached.
fn negotiate(
    client: &mut TcpStream,
    ctx: &ProxyContext,
) -> Result<(TcpStream, SocketAddrV4), SocksError> {
    client.set_read_timeout(Some(NEGOTIATE_TIMEOUT))?;
    client.set_write_timeout(Some(NEGOTIATE_TIMEOUT))?;

    // Greeting: VER NMETHODS, then the advertised methods. The methods are
    // read and discarded; the server only ever selects "no authentication".
    let mut head = [0u8; 2];
    client.read_exact(&mut head)?;
    let nmethods = socks::parse_greeting(head)?;
    let mut methods = vec![0u8; nmethods as usize];
    client.read_exact(&mut methods)?;
    client.write_all(&socks::build_greeting_reply())?;

    // Request: VER CMD RSV ATYP, address, big-endian port.
    let mut req = [0u8; 4];
    client.read_exact(&mut req)?;
    let atyp = socks::parse_request_head(req)?;

    let dest_ip = match atyp {
        AddrType::IPv4 => {
            let mut raw = [0u8; 4];
            client.read_exact(&mut raw)?;
            Ipv4Addr::from(raw)
        }
        AddrType::Domain => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len)?;
            let mut raw = vec![0u8; len[0] as usize];
            client.read_exact(&mut raw)?;
            let domain = std::str::from_utf8(&raw).map_err(|_| SocksError::BadDomain)?;
            ctx.dns.resolve(domain)?
        }
    };

    let mut port_bytes = [0u8; 2];
    client.read_exact(&mut port_bytes)?;
    let dest_port = u16::from_be_bytes(port_bytes);

    let remote =
        connect_remote(dest_ip, dest_port, ctx.bind_ip).map_err(SocksError::Connect)?;
    let bound = match remote.local_addr()? {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => {
            return Err(SocksError::Io(io::Error::other(
                "outbound socket has no IPv4 local address",
            )))
        }
    };

    client.write_all(&socks::build_reply(ReplyCode::Success, bound))?;

    // The relay manages its own timeouts from here on.
    client.set_read_timeout(None)?;
    client.set_write_timeout(None)?;

    Ok((remote, SocketAddrV4::new(dest_ip, dest_port)))
}

/// Open the outbound socket bound to the egress interface IP, then connect
/// with a bounded timeout. The local bind is what pins the traffic to the
/// chosen interface.
fn connect_remote(dest: Ipv4Addr, port: u16, bind_ip: Ipv4Addr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&SocketAddr::from((bind_ip, 0)).into())?;
    socket.connect_timeout(&SocketAddr::from((dest, port)).into(), CONNECT_TIMEOUT)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;

    #[test]
    fn test_bind_reuseport_allows_shared_bind() {
        // Two listeners on the same (ip, port) must both succeed; that is
        // the whole point of the multi-worker design.
        let first = bind_reuseport(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = bind_reuseport(Ipv4Addr::LOCALHOST, port).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_connect_remote_binds_local_ip() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream =
            connect_remote(Ipv4Addr::LOCALHOST, port, Ipv4Addr::LOCALHOST).unwrap();
        let local = stream.local_addr().unwrap();
        assert_eq!(local.ip(), std::net::IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_connect_remote_refused() {
        // Port 1 on loopback is essentially never listening.
        let err = connect_remote(Ipv4Addr::LOCALHOST, 1, Ipv4Addr::LOCALHOST).unwrap_err();
        assert_eq!(
            ReplyCode::from_io_error(&err),
            ReplyCode::ConnectionRefused
        );
    }

    #[test]
    fn test_preflight_allows_loopback() {
        preflight(Ipv4Addr::LOCALHOST).unwrap();
    }

    #[test]
    fn test_preflight_rejects_unassigned_ip() {
        // TEST-NET-1 (192.0.2.0/24) is never assigned to a local interface.
        let err = preflight(Ipv4Addr::new(192, 0, 2, 77)).unwrap_err();
        assert!(err.to_string().contains("192.0.2.77"));
    }
}
