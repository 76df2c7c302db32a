//! TLS transport to a relay's ORPort.
//!
//! Relays present a fresh, usually self-signed, TLS certificate on every
//! connection; the normal WebPKI chain means nothing here; identity is
//! authenticated out-of-band by the link handshake's CERTS cell and its
//! Ed25519 signature chain (`crate::protocol::certs`). rustls is therefore
//! configured with a certificate verifier that accepts anything the relay
//! presents, and certs.rs owns the real security check.

use crate::error::{Result, TorError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

pub type TorTlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Open a TCP connection to `addr` and negotiate TLS, trusting whatever
/// certificate the relay presents.
pub async fn connect(addr: SocketAddr) -> Result<TorTlsStream> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|e| TorError::ConnectionFailed(format!("TCP connect to {addr} failed: {e}")))?;
    tcp.set_nodelay(true)
        .map_err(|e| TorError::ConnectionFailed(e.to_string()))?;

    let connector = TlsConnector::from(Arc::new(relay_client_config()?));
    let server_name = ServerName::IpAddress(addr.ip().into());

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TorError::ConnectionFailed(format!("TLS handshake with {addr} failed: {e}")))
}

fn relay_client_config() -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TorError::CertificateError(format!("unsupported TLS protocol set: {e}")))
        .map(|builder| {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyRelayCert))
                .with_no_client_auth()
        })
}

/// Accepts any certificate chain presented by the peer. Safe only because the
/// relay's real identity proof is the CERTS cell, verified separately by
/// [`crate::protocol::certs::CertificateVerifier`] once the link is up.
#[derive(Debug)]
struct AcceptAnyRelayCert;

impl ServerCertVerifier for AcceptAnyRelayCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builds_with_dangerous_verifier() {
        // Exercises the builder wiring without a network round trip: a relay
        // TLS config must always be constructible, never fail at runtime.
        relay_client_config().expect("relay TLS client config must build");
    }
}
