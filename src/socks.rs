//! SOCKS5 front-end (§4.7, §6): RFC 1928 CONNECT only, plus the Tor
//! extension of passing `.onion` hostnames through unresolved.

use crate::error::{Result, TorError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<&TorError> for SocksReplyCode {
    fn from(e: &TorError) -> Self {
        match e {
            TorError::CircuitDestroyed { .. } | TorError::ConnectionFailed(_) => SocksReplyCode::ConnectionRefused,
            TorError::CircuitBuildFailed(_) => SocksReplyCode::HostUnreachable,
            TorError::Stream(_) => SocksReplyCode::HostUnreachable,
            _ => SocksReplyCode::GeneralFailure,
        }
    }
}

/// A parsed CONNECT request: target host (hostname, IPv4 literal, IPv6
/// literal, or `.onion`) plus an optional isolation key from username/password
/// sub-negotiation (consumed only for isolation, never checked as a real
/// credential — §4.7).
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
    pub isolation_key: Option<String>,
}

impl ConnectRequest {
    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }
}

/// Run the SOCKS5 handshake (greeting, optional userpass, CONNECT request) on
/// `stream`, returning the parsed target. The caller is responsible for
/// opening the actual circuit/stream and then calling [`reply_success`] or
/// [`reply_error`].
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<ConnectRequest> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.map_err(|e| TorError::Network(e.to_string()))?;
    if header[0] != SOCKS_VERSION {
        return Err(TorError::ProtocolError(format!("unsupported SOCKS version {}", header[0])));
    }
    let nmethods = header[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await.map_err(|e| TorError::Network(e.to_string()))?;

    let chosen = if methods.contains(&AUTH_USERPASS) {
        AUTH_USERPASS
    } else if methods.contains(&AUTH_NONE) {
        AUTH_NONE
    } else {
        stream
            .write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE])
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        return Err(TorError::ProtocolError("client offered no acceptable auth method".into()));
    };
    stream.write_all(&[SOCKS_VERSION, chosen]).await.map_err(|e| TorError::Network(e.to_string()))?;

    let isolation_key = if chosen == AUTH_USERPASS {
        Some(read_userpass(stream).await?)
    } else {
        None
    };

    let request = read_connect_request(stream).await?;
    Ok(ConnectRequest { isolation_key, ..request })
}

async fn read_userpass<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<String> {
    let mut ver_ulen = [0u8; 2];
    stream.read_exact(&mut ver_ulen).await.map_err(|e| TorError::Network(e.to_string()))?;
    let mut username = vec![0u8; ver_ulen[1] as usize];
    stream.read_exact(&mut username).await.map_err(|e| TorError::Network(e.to_string()))?;

    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await.map_err(|e| TorError::Network(e.to_string()))?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await.map_err(|e| TorError::Network(e.to_string()))?;

    // RFC 1929 status 0x00 always; we never reject on credential content.
    stream.write_all(&[0x01, 0x00]).await.map_err(|e| TorError::Network(e.to_string()))?;

    let mut key = username;
    key.push(b':');
    key.extend_from_slice(&password);
    Ok(String::from_utf8_lossy(&key).into_owned())
}

async fn read_connect_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<ConnectRequest> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(|e| TorError::Network(e.to_string()))?;
    let [version, cmd, _reserved, atyp] = header;
    if version != SOCKS_VERSION {
        return Err(TorError::ProtocolError(format!("unsupported SOCKS version {version}")));
    }
    if cmd != CMD_CONNECT {
        return Err(TorError::ProtocolError("only the CONNECT command is supported".into()));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.map_err(|e| TorError::Network(e.to_string()))?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await.map_err(|e| TorError::Network(e.to_string()))?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(|e| TorError::Network(e.to_string()))?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await.map_err(|e| TorError::Network(e.to_string()))?;
            String::from_utf8(domain).map_err(|e| TorError::ProtocolError(format!("invalid hostname: {e}")))?
        }
        other => return Err(TorError::ProtocolError(format!("unsupported address type {other}"))),
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await.map_err(|e| TorError::Network(e.to_string()))?;
    let port = u16::from_be_bytes(port_bytes);

    Ok(ConnectRequest { host, port, isolation_key: None })
}

pub async fn reply_success<S: AsyncWrite + Unpin>(stream: &mut S, bound_addr: std::net::SocketAddr) -> Result<()> {
    send_reply(stream, SocksReplyCode::Succeeded, bound_addr).await
}

pub async fn reply_error<S: AsyncWrite + Unpin>(stream: &mut S, code: SocksReplyCode) -> Result<()> {
    send_reply(stream, code, "0.0.0.0:0".parse().unwrap()).await
}

async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, code: SocksReplyCode, bound_addr: std::net::SocketAddr) -> Result<()> {
    let mut reply = vec![SOCKS_VERSION, code as u8, 0x00];
    match bound_addr {
        std::net::SocketAddr::V4(v4) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.ip().octets());
            reply.extend_from_slice(&v4.port().to_be_bytes());
        }
        std::net::SocketAddr::V6(v6) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.ip().octets());
            reply.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
    stream.write_all(&reply).await.map_err(|e| TorError::Network(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onion_hostnames_are_detected() {
        let req = ConnectRequest { host: "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion".into(), port: 80, isolation_key: None };
        assert!(req.is_onion());
        let req = ConnectRequest { host: "example.com".into(), port: 80, isolation_key: None };
        assert!(!req.is_onion());
    }

    #[test]
    fn connection_refused_maps_to_refused_code() {
        let err = TorError::ConnectionFailed("x".into());
        assert_eq!(SocksReplyCode::from(&err), SocksReplyCode::ConnectionRefused);
    }

    #[test]
    fn circuit_build_failure_maps_to_host_unreachable() {
        let err = TorError::CircuitBuildFailed("x".into());
        assert_eq!(SocksReplyCode::from(&err), SocksReplyCode::HostUnreachable);
    }

    #[tokio::test]
    async fn full_connect_handshake_parses_a_domain_target() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, 0x00]);

            let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
            req.extend_from_slice(b"example.com");
            req.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&req).await.unwrap();
        });

        let request = handshake(&mut server).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(request.host, "example.com");
        assert_eq!(request.port, 443);
        assert!(request.isolation_key.is_none());
    }

    #[tokio::test]
    async fn userpass_subnegotiation_becomes_the_isolation_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let client_task = tokio::spawn(async move {
            client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, 0x02]);

            let mut auth = vec![0x01, 4];
            auth.extend_from_slice(b"user");
            auth.push(4);
            auth.extend_from_slice(b"pass");
            client.write_all(&auth).await.unwrap();
            let mut auth_resp = [0u8; 2];
            client.read_exact(&mut auth_resp).await.unwrap();
            assert_eq!(auth_resp, [0x01, 0x00]);

            let mut req = vec![0x05, 0x01, 0x00, 0x03, 10];
            req.extend_from_slice(b"example.io");
            req.extend_from_slice(&9001u16.to_be_bytes());
            client.write_all(&req).await.unwrap();
        });

        let request = handshake(&mut server).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(request.isolation_key.as_deref(), Some("user:pass"));
    }

    #[tokio::test]
    async fn onion_target_is_not_resolved_locally() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let onion = "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion";
        let client_task = tokio::spawn({
            let onion = onion.to_string();
            async move {
                client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
                let mut resp = [0u8; 2];
                client.read_exact(&mut resp).await.unwrap();

                let mut req = vec![0x05, 0x01, 0x00, 0x03, onion.len() as u8];
                req.extend_from_slice(onion.as_bytes());
                req.extend_from_slice(&80u16.to_be_bytes());
                client.write_all(&req).await.unwrap();
            }
        });

        let request = handshake(&mut server).await.unwrap();
        client_task.await.unwrap();

        assert!(request.is_onion());
        assert_eq!(request.host, onion);
    }
}
