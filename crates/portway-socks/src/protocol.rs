//! RFC 1928 / RFC 1929 wire codec.
//!
//! Result-typed parsers for the SOCKS5 greeting, the username/password
//! sub-negotiation and the CONNECT request, plus the writers for the
//! server's replies. Parse failures come back as [`ProtocolError`]; when the
//! protocol defines a reply code for the failure it is carried on the error
//! so the connection handler can send it before closing.
//!
//! # Wire formats
//!
//! ```text
//! greeting:  VER NMETHODS METHODS...        reply: VER METHOD
//! auth:      VER ULEN UNAME PLEN PASSWD     reply: VER STATUS
//! request:   VER CMD RSV ATYP DST.ADDR DST.PORT
//! reply:     VER REP RSV ATYP BND.ADDR BND.PORT
//! ```

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol constants from RFC 1928 and RFC 1929.
pub mod consts {
    pub const SOCKS5_VERSION: u8 = 0x05;
    pub const AUTH_SUBNEG_VERSION: u8 = 0x01;

    pub const METHOD_NO_AUTH: u8 = 0x00;
    pub const METHOD_USERNAME_PASSWORD: u8 = 0x02;
    pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;

    pub const AUTH_STATUS_SUCCESS: u8 = 0x00;
    pub const AUTH_STATUS_FAILURE: u8 = 0x01;
}

/// Reply codes defined by RFC 1928 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl ReplyCode {
    /// Wire value of the code.
    pub fn as_u8(self) -> u8 {
        match self {
            ReplyCode::Succeeded => 0x00,
            ReplyCode::GeneralFailure => 0x01,
            ReplyCode::ConnectionNotAllowed => 0x02,
            ReplyCode::NetworkUnreachable => 0x03,
            ReplyCode::HostUnreachable => 0x04,
            ReplyCode::ConnectionRefused => 0x05,
            ReplyCode::TtlExpired => 0x06,
            ReplyCode::CommandNotSupported => 0x07,
            ReplyCode::AddressTypeNotSupported => 0x08,
        }
    }
}

/// Request command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            consts::CMD_CONNECT => Ok(Command::Connect),
            consts::CMD_BIND => Ok(Command::Bind),
            consts::CMD_UDP_ASSOCIATE => Ok(Command::UdpAssociate),
            _ => Err(ProtocolError::UnsupportedCommand(value)),
        }
    }
}

/// Destination address of a CONNECT request.
///
/// IPv6 is parsed but outbound resolution is not guaranteed; the dial path
/// maps the failure to the appropriate reply code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(name) => write!(f, "{}", name),
            TargetAddr::Ipv6(addr) => write!(f, "{}", addr),
        }
    }
}

/// A fully parsed CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub addr: TargetAddr,
    pub port: u16,
}

impl fmt::Display for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            TargetAddr::Ipv6(addr) => write!(f, "[{}]:{}", addr, self.port),
            other => write!(f, "{}:{}", other, self.port),
        }
    }
}

/// Read the client greeting and return the offered method bytes.
pub async fn read_greeting<S>(stream: &mut S) -> Result<Vec<u8>, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != consts::SOCKS5_VERSION {
        return Err(ProtocolError::BadVersion(header[0]));
    }
    if header[1] == 0 {
        return Err(ProtocolError::Malformed("greeting offers zero methods"));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Select the method the server will use for this connection.
///
/// With `auth_required` only username/password is acceptable; without it
/// only no-auth is. Anything else gets `0xFF`.
pub fn select_method(offered: &[u8], auth_required: bool) -> u8 {
    let wanted = if auth_required {
        consts::METHOD_USERNAME_PASSWORD
    } else {
        consts::METHOD_NO_AUTH
    };
    if offered.contains(&wanted) {
        wanted
    } else {
        consts::METHOD_NO_ACCEPTABLE
    }
}

/// Write the method-selection reply.
pub async fn write_method_selection<S>(stream: &mut S, method: u8) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[consts::SOCKS5_VERSION, method])
        .await?;
    Ok(())
}

/// Read the RFC 1929 username/password sub-negotiation.
pub async fn read_userpass<S>(stream: &mut S) -> Result<(String, String), ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != consts::AUTH_SUBNEG_VERSION {
        return Err(ProtocolError::BadAuthVersion(version));
    }

    let ulen = stream.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    stream.read_exact(&mut uname).await?;

    let plen = stream.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    stream.read_exact(&mut passwd).await?;

    let username =
        String::from_utf8(uname).map_err(|_| ProtocolError::Malformed("username not UTF-8"))?;
    let password =
        String::from_utf8(passwd).map_err(|_| ProtocolError::Malformed("password not UTF-8"))?;
    Ok((username, password))
}

/// Write the RFC 1929 status reply.
pub async fn write_auth_status<S>(stream: &mut S, success: bool) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    let status = if success {
        consts::AUTH_STATUS_SUCCESS
    } else {
        consts::AUTH_STATUS_FAILURE
    };
    stream
        .write_all(&[consts::AUTH_SUBNEG_VERSION, status])
        .await?;
    Ok(())
}

/// Read and validate a CONNECT request.
///
/// Non-CONNECT commands and unknown address types come back as typed errors
/// carrying the RFC 1928 reply code to send.
pub async fn read_request<S>(stream: &mut S) -> Result<ConnectRequest, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != consts::SOCKS5_VERSION {
        return Err(ProtocolError::BadVersion(header[0]));
    }
    if header[2] != 0x00 {
        return Err(ProtocolError::Malformed("reserved byte not zero"));
    }

    match Command::try_from(header[1])? {
        Command::Connect => {}
        Command::Bind => return Err(ProtocolError::UnsupportedCommand(consts::CMD_BIND)),
        Command::UdpAssociate => {
            return Err(ProtocolError::UnsupportedCommand(consts::CMD_UDP_ASSOCIATE))
        }
    }

    let addr = match header[3] {
        consts::ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        consts::ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                return Err(ProtocolError::Malformed("empty domain name"));
            }
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| ProtocolError::Malformed("domain name not UTF-8"))?;
            TargetAddr::Domain(name)
        }
        consts::ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        other => return Err(ProtocolError::UnsupportedAddressType(other)),
    };

    let port = stream.read_u16().await?;
    Ok(ConnectRequest { addr, port })
}

/// Write a server reply with a zeroed IPv4 bound address.
///
/// The bound address is intentionally `0.0.0.0:0`; clients must not rely
/// on it.
pub async fn write_reply<S>(stream: &mut S, code: ReplyCode) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        consts::SOCKS5_VERSION,
        code.as_u8(),
        0x00,
        consts::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

/// Protocol-level failure while talking to a SOCKS5 client.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),

    #[error("unsupported auth sub-negotiation version {0:#04x}")]
    BadAuthVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("authentication failed")]
    AuthFailed,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Reply code to send before closing, when the protocol defines one.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            ProtocolError::UnsupportedCommand(_) => Some(ReplyCode::CommandNotSupported),
            ProtocolError::UnsupportedAddressType(_) => Some(ReplyCode::AddressTypeNotSupported),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn parse_request(bytes: &[u8]) -> Result<ConnectRequest, ProtocolError> {
        let mut cursor = std::io::Cursor::new(bytes.to_vec());
        read_request(&mut cursor).await
    }

    #[tokio::test]
    async fn test_greeting_round_trip() {
        let mut cursor = std::io::Cursor::new(vec![0x05, 0x02, 0x00, 0x02]);
        let methods = read_greeting(&mut cursor).await.unwrap();
        assert_eq!(methods, vec![0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_greeting_rejects_wrong_version() {
        let mut cursor = std::io::Cursor::new(vec![0x04, 0x01, 0x00]);
        assert!(matches!(
            read_greeting(&mut cursor).await,
            Err(ProtocolError::BadVersion(0x04))
        ));
    }

    #[tokio::test]
    async fn test_greeting_rejects_zero_methods() {
        let mut cursor = std::io::Cursor::new(vec![0x05, 0x00]);
        assert!(matches!(
            read_greeting(&mut cursor).await,
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_method_selection() {
        assert_eq!(select_method(&[0x00], false), 0x00);
        assert_eq!(select_method(&[0x00, 0x02], true), 0x02);
        // Client offering only no-auth against a server requiring credentials.
        assert_eq!(select_method(&[0x00], true), 0xFF);
        assert_eq!(select_method(&[0x02], false), 0xFF);
    }

    #[tokio::test]
    async fn test_userpass_parse() {
        let mut bytes = vec![0x01, 0x01];
        bytes.push(b'u');
        bytes.push(0x01);
        bytes.push(b'p');
        let mut cursor = std::io::Cursor::new(bytes);
        let (user, pass) = read_userpass(&mut cursor).await.unwrap();
        assert_eq!(user, "u");
        assert_eq!(pass, "p");
    }

    #[tokio::test]
    async fn test_request_ipv4() {
        let req = parse_request(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x4A, 0x38])
            .await
            .unwrap();
        assert_eq!(req.addr, TargetAddr::Ipv4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(req.port, 19000);
        assert_eq!(req.to_string(), "127.0.0.1:19000");
    }

    #[tokio::test]
    async fn test_request_domain() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x03, 0x09];
        bytes.extend_from_slice(b"localhost");
        bytes.extend_from_slice(&80u16.to_be_bytes());
        let req = parse_request(&bytes).await.unwrap();
        assert_eq!(req.addr, TargetAddr::Domain("localhost".into()));
        assert_eq!(req.port, 80);
    }

    #[tokio::test]
    async fn test_request_ipv6() {
        let mut bytes = vec![0x05, 0x01, 0x00, 0x04];
        bytes.extend_from_slice(&[0u8; 15]);
        bytes.push(1);
        bytes.extend_from_slice(&443u16.to_be_bytes());
        let req = parse_request(&bytes).await.unwrap();
        assert_eq!(req.addr, TargetAddr::Ipv6(Ipv6Addr::LOCALHOST));
        assert_eq!(req.to_string(), "[::1]:443");
    }

    #[tokio::test]
    async fn test_request_rejects_bind_and_udp() {
        for cmd in [0x02u8, 0x03] {
            let err = parse_request(&[0x05, cmd, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap_err();
            assert_eq!(err.reply_code(), Some(ReplyCode::CommandNotSupported));
        }
    }

    #[tokio::test]
    async fn test_request_rejects_unknown_atyp() {
        let err = parse_request(&[0x05, 0x01, 0x00, 0x05, 0, 0])
            .await
            .unwrap_err();
        assert_eq!(err.reply_code(), Some(ReplyCode::AddressTypeNotSupported));
    }

    #[tokio::test]
    async fn test_request_rejects_empty_domain() {
        let err = parse_request(&[0x05, 0x01, 0x00, 0x03, 0x00, 0, 80])
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(err.reply_code(), None);
    }

    #[tokio::test]
    async fn test_reply_bytes() {
        let mut buf = Vec::new();
        write_reply(&mut buf, ReplyCode::CommandNotSupported)
            .await
            .unwrap();
        assert_eq!(buf, vec![0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let mut buf = Vec::new();
        write_reply(&mut buf, ReplyCode::Succeeded).await.unwrap();
        assert_eq!(buf, vec![0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }
}
