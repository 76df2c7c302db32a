//! Tor protocol implementation
//!
//! This module implements the actual Tor protocol, including:
//! - Directory consensus fetching and parsing
//! - Circuit building (3-hop onion routing)
//! - ntor handshake (key exchange)
//! - Stream management
//! - Cell protocol
//! - Certificate verification
//! - Path selection

mod certs;
mod circuit;
mod codec;
mod consensus;
mod consensus_verify;
mod crypto;
mod directory;
mod flow_control;
mod ntor;
mod path_selector;
mod relay;
mod stream;
mod tls;

pub use certs::{CertificateVerifier, CertsCell, Ed25519Certificate, VerifiedRelay};
pub use circuit::{Circuit, CircuitBuilder, CircuitState};
pub use codec::{Cell, CellCommand, RelayCell, RelayCommand, VarCellCommand};
pub use consensus::{Consensus, ConsensusParser};
pub use consensus_verify::DIRECTORY_AUTHORITIES;
pub use consensus_verify::{
    ConsensusVerifier, DirectoryAuthority, DirectorySignature, MIN_AUTHORITY_SIGNATURES,
};
pub use crypto::{CircuitKeys, HopCrypto};
pub use directory::DirectoryManager;
pub(crate) use directory::parse_http_response;
pub use flow_control::{CircuitFlowControl, StreamFlowControl};
pub use ntor::NtorHandshake;
pub use path_selector::{
    select_guard, select_middle, select_exit, select_path, select_path_to, BandwidthWeights, PathConstraints,
};
pub use relay::{Relay, RelayFlags};
pub use stream::{StreamBuilder, StreamEvent, StreamManager, TorStream};

/// Default HTTP port for directory queries
pub const DEFAULT_DIR_PORT: u16 = 80;

/// HTTP port variant used by some authorities
pub const FALLBACK_DIR_PORT: u16 = 9030;

/// HTTPS port for encrypted directory queries
pub const SECURE_DIR_PORT: u16 = 443;
