//! Directory consensus fetching (§4.5).
//!
//! Connects over a plain TCP socket (directory protocol is not tunneled
//! through TLS) to a directory authority or cache mirror and issues the
//! same HTTP/1.0 GET a real Tor client would, then hands the body to
//! [`ConsensusParser`] and [`ConsensusVerifier`].

use super::{Consensus, ConsensusParser, ConsensusVerifier};
use crate::error::{Result, TorError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Real-world directory authority bootstrap addresses (dir-spec `auth_dirs.inc`).
/// Used when `TorConfig::directory_mirrors` is empty.
pub const FALLBACK_AUTHORITIES: &[(&str, &str)] = &[
    ("moria1", "128.31.0.34:9131"),
    ("tor26", "193.23.244.244:80"),
    ("dizum", "45.66.33.45:80"),
    ("gabelmoo", "131.188.40.189:80"),
    ("dannenberg", "193.23.45.41:80"),
    ("maatuska", "171.25.193.9:443"),
    ("Faravahar", "154.35.175.225:80"),
    ("longclaw", "199.58.81.140:80"),
    ("bastet", "204.13.164.118:80"),
];

const MAX_RESPONSE_BYTES: usize = 32 * 1024 * 1024;

pub struct DirectoryManager {
    mirrors: Vec<SocketAddr>,
    verifier: ConsensusVerifier,
    fetch_timeout: Duration,
}

impl DirectoryManager {
    pub fn new(directory_mirrors: &[String], fetch_timeout: Duration) -> Self {
        let mut mirrors: Vec<SocketAddr> = directory_mirrors
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        if mirrors.is_empty() {
            mirrors = FALLBACK_AUTHORITIES
                .iter()
                .filter_map(|(_, addr)| addr.parse().ok())
                .collect();
        }
        Self { mirrors, verifier: ConsensusVerifier::new(), fetch_timeout }
    }

    /// Fetch and verify the current consensus, trying each mirror in turn.
    pub async fn fetch_consensus(&self) -> Result<Consensus> {
        let mut last_err = None;
        for addr in &self.mirrors {
            match timeout(self.fetch_timeout, self.fetch_from(*addr)).await {
                Ok(Ok(text)) => {
                    match self.verifier.verify_consensus(&text) {
                        Ok(sigs) => {
                            tracing::info!(authority_signatures = sigs, %addr, "consensus accepted");
                            return ConsensusParser::parse_text(&text);
                        }
                        Err(e) => {
                            tracing::warn!(%addr, error = %e, "consensus failed quorum check");
                            last_err = Some(e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(%addr, error = %e, "directory fetch failed");
                    last_err = Some(e);
                }
                Err(_) => {
                    tracing::debug!(%addr, "directory fetch timed out");
                    last_err = Some(TorError::Directory(format!("timed out fetching from {addr}")));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| TorError::Directory("no directory mirrors configured".into())))
    }

    async fn fetch_from(&self, addr: SocketAddr) -> Result<String> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TorError::Network(format!("connect to {addr} failed: {e}")))?;

        let request = format!(
            "GET /tor/status-vote/current/consensus HTTP/1.0\r\n\
             Host: {}\r\n\
             User-Agent: toronoe/0.1\r\n\
             \r\n",
            addr.ip()
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| TorError::Network(format!("write to {addr} failed: {e}")))?;
        stream
            .flush()
            .await
            .map_err(|e| TorError::Network(format!("flush to {addr} failed: {e}")))?;

        let mut response = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| TorError::Network(format!("read from {addr} failed: {e}")))?;
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.len() > MAX_RESPONSE_BYTES {
                return Err(TorError::Directory("consensus response exceeded size limit".into()));
            }
        }

        let body = parse_http_response(&response)?;
        String::from_utf8(body).map_err(|e| TorError::Directory(format!("invalid UTF-8 in consensus: {e}")))
    }
}

/// Extract the body from an HTTP/1.0 response. Shared with the onion-service
/// descriptor fetch, which speaks the same protocol over a BEGIN_DIR stream
/// instead of a raw TCP socket.
pub(crate) fn parse_http_response(response: &[u8]) -> Result<Vec<u8>> {
    let response_str = String::from_utf8_lossy(response);
    if !response_str.starts_with("HTTP/") {
        return Err(TorError::Directory("invalid HTTP response".into()));
    }

    let first_line = response_str.lines().next().unwrap_or("");
    if !first_line.contains(" 200 ") {
        return Err(TorError::Directory(format!("HTTP error: {first_line}")));
    }

    if let Some(body_start) = response.windows(4).position(|w| w == b"\r\n\r\n") {
        Ok(response[body_start + 4..].to_vec())
    } else if let Some(body_start) = response.windows(2).position(|w| w == b"\n\n") {
        Ok(response[body_start + 2..].to_vec())
    } else {
        Ok(response.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_http_response_extracts_body() {
        let response = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nBody content here";
        assert_eq!(parse_http_response(response).unwrap(), b"Body content here");
    }

    #[test]
    fn parse_http_response_rejects_error_status() {
        let response = b"HTTP/1.0 404 Not Found\r\n\r\n";
        assert!(parse_http_response(response).is_err());
    }

    #[test]
    fn falls_back_to_hardcoded_authorities_when_no_mirrors_configured() {
        let mgr = DirectoryManager::new(&[], Duration::from_secs(1));
        assert_eq!(mgr.mirrors.len(), FALLBACK_AUTHORITIES.len());
    }

    #[test]
    fn parses_configured_mirror_addresses() {
        let mgr = DirectoryManager::new(&["203.0.113.5:9030".to_string()], Duration::from_secs(1));
        assert_eq!(mgr.mirrors.len(), 1);
    }
}
