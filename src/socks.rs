//! SOCKS5 wire protocol per RFC 1928: CONNECT-only, IPv4 and domain targets.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

use crate::dns::DnsError;

pub const SOCKS_VERSION: u8 = 5;

/// Method identifier for "no authentication required".
pub const NO_AUTH: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocksCommand {
    Connect = 1,
    Bind = 2,
    UdpAssociate = 3,
}

impl TryFrom<u8> for SocksCommand {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(SocksCommand::Connect),
            2 => Ok(SocksCommand::Bind),
            3 => Ok(SocksCommand::UdpAssociate),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddrType {
    IPv4 = 1,
    Domain = 3,
}

impl TryFrom<u8> for AddrType {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(AddrType::IPv4),
            3 => Ok(AddrType::Domain),
            other => Err(other),
        }
    }
}

/// Reply codes this server actually sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Success = 0,
    HostUnreachable = 4,
    ConnectionRefused = 5,
    CommandNotSupported = 7,
    AddrTypeNotSupported = 8,
}

impl ReplyCode {
    /// Map an outbound connect error to the closest reply code.
    pub fn from_io_error(e: &io::Error) -> ReplyCode {
        match e.kind() {
            io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            _ => {
                if let Some(code) = e.raw_os_error() {
                    match code {
                        101 | 113 => ReplyCode::HostUnreachable, // ENETUNREACH / EHOSTUNREACH
                        110 => ReplyCode::HostUnreachable,       // ETIMEDOUT
                        _ => ReplyCode::ConnectionRefused,
                    }
                } else {
                    ReplyCode::ConnectionRefused
                }
            }
        }
    }
}

/// Everything that can go wrong between accept and tunnel establishment.
#[derive(Debug, Error)]
pub enum SocksError {
    /// Greeting carried a version other than 5. Closed without a reply.
    #[error("unsupported protocol version {0} in greeting")]
    BadGreetingVersion(u8),
    /// Connect request carried a version other than 5.
    #[error("unsupported protocol version {0} in request")]
    BadRequestVersion(u8),
    #[error("unsupported command {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type {0}")]
    UnsupportedAddrType(u8),
    #[error("domain name is not valid UTF-8")]
    BadDomain,
    #[error(transparent)]
    Dns(#[from] DnsError),
    #[error("connect to destination failed: {0}")]
    Connect(#[source] io::Error),
    #[error("client i/o failed: {0}")]
    Io(#[from] io::Error),
}

impl SocksError {
    /// The failure reply owed to the client, if any. `None` means the
    /// connection is closed silently (bad greeting, or the client side
    /// itself is gone).
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            SocksError::BadGreetingVersion(_) => None,
            SocksError::BadRequestVersion(_) => Some(ReplyCode::CommandNotSupported),
            SocksError::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
            SocksError::UnsupportedAddrType(_) => Some(ReplyCode::AddrTypeNotSupported),
            SocksError::BadDomain => Some(ReplyCode::ConnectionRefused),
            SocksError::Dns(_) => Some(ReplyCode::HostUnreachable),
            SocksError::Connect(e) => Some(ReplyCode::from_io_error(e)),
            SocksError::Io(_) => None,
        }
    }
}

/// Parse the greeting header `VER NMETHODS`, returning the method count.
pub fn parse_greeting(head: [u8; 2]) -> Result<u8, SocksError> {
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::BadGreetingVersion(head[0]));
    }
    Ok(head[1])
}

/// The server always selects "no authentication".
pub fn build_greeting_reply() -> [u8; 2] {
    [SOCKS_VERSION, NO_AUTH]
}

/// Parse the connect request header `VER CMD RSV ATYP`.
///
/// The reserved byte is ignored on the way in; only CONNECT requests with a
/// known address type make it past this point.
pub fn parse_request_head(head: [u8; 4]) -> Result<AddrType, SocksError> {
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::BadRequestVersion(head[0]));
    }
    match SocksCommand::try_from(head[1]) {
        Ok(SocksCommand::Connect) => {}
        Ok(_) | Err(_) => return Err(SocksError::UnsupportedCommand(head[1])),
    }
    AddrType::try_from(head[3]).map_err(SocksError::UnsupportedAddrType)
}

/// Build a reply carrying the given bound address (the local endpoint of the
/// outbound socket on success, all zeros on failure).
pub fn build_reply(code: ReplyCode, bound: SocketAddrV4) -> [u8; 10] {
    let ip = bound.ip().octets();
    let port = bound.port().to_be_bytes();
    [
        SOCKS_VERSION,
        code as u8,
        0,
        AddrType::IPv4 as u8,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}

/// Build a failure reply with an all-zero bound address.
pub fn build_error_reply(code: ReplyCode) -> [u8; 10] {
    build_reply(code, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}
