//! Error taxonomy for the Tor protocol engine.
//!
//! Every subsystem returns [`TorError`] through this module's [`Result`] alias.
//! Crypto and protocol violations are never silently swallowed: callers use
//! [`TorError::is_fatal`]/[`is_retryable`] to decide whether to close the
//! affected circuit, retry with a fresh relay choice, or propagate further.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Numeric error codes for structured logging and the stats/control interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Connection errors (1xx)
    ConnectionFailed = 100,
    ConnectionTimeout = 101,
    ConnectionRefused = 102,

    // Protocol errors (2xx)
    ProtocolViolation = 200,
    MalformedCell = 201,
    PayloadTooLarge = 202,
    NoCommonVersion = 203,
    DigestMismatch = 204,
    HandshakeFailed = 205,
    FlowControlViolation = 206,
    StreamEndReceived = 207,

    // Circuit errors (3xx)
    CircuitBuildFailed = 300,
    CircuitDestroyed = 301,
    AllRelaysFailed = 302,
    StreamFailed = 303,
    HandshakeTimeout = 304,

    // Security errors (4xx) - FATAL
    CertificateError = 400,
    ConsensusError = 401,
    EntropyError = 402,
    AuthVerificationFailed = 403,
    DescriptorRejected = 404,
    ChecksumMismatch = 405,

    // Cryptographic errors (5xx)
    CryptoError = 500,
    KeyDerivationFailed = 501,

    // Directory/Consensus errors (6xx)
    DirectoryError = 600,
    ConsensusStale = 601,
    NoRelaysAvailable = 602,
    ConsensusUnavailable = 603,
    NoSuitableRelay = 604,

    // Storage errors (7xx)
    StorageError = 700,

    // Configuration errors (8xx)
    ConfigError = 800,
    InvalidRelay = 801,
    InvalidUrl = 802,
    ConfigInvalid = 803,

    // Internal errors (9xx)
    InternalError = 900,
    NotBootstrapped = 901,
}

/// Main error type for the Tor protocol engine.
#[derive(Error, Debug, Clone)]
pub enum TorError {
    // ===== Connection Errors =====
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timeout")]
    Timeout,

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    // ===== Protocol / Cell Errors =====
    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("malformed cell: {0}")]
    MalformedCell(String),

    #[error("relay payload too large ({0} bytes)")]
    PayloadTooLarge(usize),

    #[error("no common link protocol version")]
    NoCommonVersion,

    #[error("unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("digest mismatch in relay cell")]
    DigestMismatch,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("handshake timed out: {0}")]
    HandshakeTimeout(String),

    #[error("flow control violation: {0}")]
    FlowControlViolation(String),

    #[error("stream ended by peer: {0}")]
    StreamEndReceived(String),

    // ===== Circuit Errors =====
    #[error("circuit build failed: {0}")]
    CircuitBuildFailed(String),

    #[error("circuit destroyed: reason={reason} ({reason_name})")]
    CircuitDestroyed { reason: u8, reason_name: String },

    #[error("all relay candidates failed")]
    AllRelaysFailed,

    #[error("circuit closed: {0}")]
    CircuitClosed(String),

    #[error("stream error: {0}")]
    Stream(String),

    // ===== Security Errors (FATAL) =====
    #[error("certificate verification failed: {0}")]
    CertificateError(String),

    #[error("consensus verification failed: {0}")]
    ConsensusError(String),

    #[error("entropy/RNG failure: {0}")]
    EntropyError(String),

    #[error("auth verification failed: {0}")]
    AuthVerificationFailed(String),

    #[error("onion descriptor rejected: {0}")]
    DescriptorRejected(String),

    #[error("onion address checksum mismatch")]
    ChecksumMismatch,

    // ===== Cryptographic Errors =====
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // ===== Directory/Consensus Errors =====
    #[error("directory error: {0}")]
    Directory(String),

    #[error("consensus is stale")]
    ConsensusStale,

    #[error("consensus unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("no relays available: {0}")]
    NoRelaysAvailable(String),

    #[error("no suitable relay for this selection: {0}")]
    NoSuitableRelay(String),

    // ===== Storage Errors =====
    #[error("storage error: {0}")]
    Storage(String),

    // ===== Configuration Errors =====
    #[error("invalid relay: {0}")]
    InvalidRelay(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("parse error: {0}")]
    ParseError(String),

    // ===== Network Errors =====
    #[error("network error: {0}")]
    Network(String),

    // ===== Internal Errors =====
    #[error("internal error: {0}")]
    Internal(String),

    #[error("client not bootstrapped")]
    NotBootstrapped,

    // ===== State Errors =====
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl TorError {
    /// Numeric code for structured logging / the control-protocol surface.
    pub fn code(&self) -> ErrorCode {
        match self {
            TorError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            TorError::Timeout => ErrorCode::ConnectionTimeout,
            TorError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,

            TorError::ProtocolError(_) => ErrorCode::ProtocolViolation,
            TorError::MalformedCell(_) => ErrorCode::MalformedCell,
            TorError::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,
            TorError::NoCommonVersion => ErrorCode::NoCommonVersion,
            TorError::UnexpectedCell { .. } => ErrorCode::ProtocolViolation,
            TorError::DigestMismatch => ErrorCode::DigestMismatch,
            TorError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            TorError::HandshakeTimeout(_) => ErrorCode::HandshakeTimeout,
            TorError::FlowControlViolation(_) => ErrorCode::FlowControlViolation,
            TorError::StreamEndReceived(_) => ErrorCode::StreamEndReceived,

            TorError::CircuitBuildFailed(_) => ErrorCode::CircuitBuildFailed,
            TorError::CircuitDestroyed { .. } => ErrorCode::CircuitDestroyed,
            TorError::AllRelaysFailed => ErrorCode::AllRelaysFailed,
            TorError::CircuitClosed(_) => ErrorCode::CircuitDestroyed,
            TorError::Stream(_) => ErrorCode::StreamFailed,

            TorError::CertificateError(_) => ErrorCode::CertificateError,
            TorError::ConsensusError(_) => ErrorCode::ConsensusError,
            TorError::EntropyError(_) => ErrorCode::EntropyError,
            TorError::AuthVerificationFailed(_) => ErrorCode::AuthVerificationFailed,
            TorError::DescriptorRejected(_) => ErrorCode::DescriptorRejected,
            TorError::ChecksumMismatch => ErrorCode::ChecksumMismatch,

            TorError::Crypto(_) => ErrorCode::CryptoError,
            TorError::KeyDerivationFailed(_) => ErrorCode::KeyDerivationFailed,

            TorError::Directory(_) => ErrorCode::DirectoryError,
            TorError::ConsensusStale => ErrorCode::ConsensusStale,
            TorError::ConsensusUnavailable(_) => ErrorCode::ConsensusUnavailable,
            TorError::NoRelaysAvailable(_) => ErrorCode::NoRelaysAvailable,
            TorError::NoSuitableRelay(_) => ErrorCode::NoSuitableRelay,

            TorError::Storage(_) => ErrorCode::StorageError,

            TorError::InvalidRelay(_) => ErrorCode::InvalidRelay,
            TorError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            TorError::ConfigInvalid(_) => ErrorCode::ConfigInvalid,
            TorError::ParseError(_) => ErrorCode::ConfigError,

            TorError::Network(_) => ErrorCode::ConnectionFailed,

            TorError::Internal(_) => ErrorCode::InternalError,
            TorError::NotBootstrapped => ErrorCode::NotBootstrapped,

            TorError::InvalidState(_) => ErrorCode::InternalError,
            TorError::ResourceExhausted(_) => ErrorCode::CircuitBuildFailed,
        }
    }

    /// Fatal errors indicate an attacker or a badly broken peer: the affected
    /// circuit (or the whole client, for consensus/certificate failures) must
    /// never be silently retried on the same material.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::CertificateError(_)
                | TorError::ConsensusError(_)
                | TorError::EntropyError(_)
                | TorError::AuthVerificationFailed(_)
                | TorError::DigestMismatch
                | TorError::FlowControlViolation(_)
        )
    }

    /// Retryable errors are resource-shaped (timeouts, unreachable relay) and
    /// may be retried with a freshly selected relay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Timeout
                | TorError::ConnectionRefused(_)
                | TorError::CircuitBuildFailed(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::CircuitClosed(_)
                | TorError::Network(_)
                | TorError::HandshakeFailed(_)
                | TorError::HandshakeTimeout(_)
                | TorError::Stream(_)
                | TorError::DescriptorRejected(_)
        )
    }

    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            TorError::NotBootstrapped
                | TorError::InvalidUrl(_)
                | TorError::InvalidRelay(_)
                | TorError::ConsensusStale
                | TorError::ConfigInvalid(_)
        )
    }

    /// Construct a `CircuitDestroyed` error, filling in the reason name from
    /// the wire reason code.
    pub fn circuit_destroyed(reason: u8) -> Self {
        let reason_name = match reason {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
        .to_string();

        TorError::CircuitDestroyed {
            reason,
            reason_name,
        }
    }
}

/// Error summary for the stats/control-protocol surface (§6).
#[derive(Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    pub message: String,
    pub is_fatal: bool,
    pub is_retryable: bool,
}

impl From<&TorError> for ErrorInfo {
    fn from(err: &TorError) -> Self {
        ErrorInfo {
            code: err.code() as u32,
            message: err.to_string(),
            is_fatal: err.is_fatal(),
            is_retryable: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(TorError::CertificateError("test".into()).is_fatal());
        assert!(TorError::ConsensusError("test".into()).is_fatal());
        assert!(TorError::EntropyError("test".into()).is_fatal());
        assert!(TorError::AuthVerificationFailed("test".into()).is_fatal());

        assert!(!TorError::ConnectionFailed("test".into()).is_fatal());
        assert!(!TorError::Timeout.is_fatal());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TorError::ConnectionFailed("test".into()).is_retryable());
        assert!(TorError::Timeout.is_retryable());
        assert!(TorError::CircuitBuildFailed("test".into()).is_retryable());

        assert!(!TorError::CertificateError("test".into()).is_retryable());
        assert!(!TorError::NotBootstrapped.is_retryable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TorError::ConnectionFailed("test".into()).code(),
            ErrorCode::ConnectionFailed
        );
        assert_eq!(TorError::Timeout.code(), ErrorCode::ConnectionTimeout);
        assert_eq!(
            TorError::CertificateError("test".into()).code(),
            ErrorCode::CertificateError
        );
    }

    #[test]
    fn test_circuit_destroyed() {
        let err = TorError::circuit_destroyed(1);
        if let TorError::CircuitDestroyed {
            reason,
            reason_name,
        } = err
        {
            assert_eq!(reason, 1);
            assert_eq!(reason_name, "PROTOCOL");
        } else {
            panic!("expected CircuitDestroyed");
        }
    }
}
