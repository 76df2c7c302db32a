//! Safe integer conversions for Tor's (mostly unsigned) wire types.
//!
//! Tor's wire format is overwhelmingly `uint16`/`uint32`. Rather than `as`
//! truncating casts, every length/count derived from a `usize` is funnelled
//! through `TryFrom` so an over-length buffer becomes a typed protocol error
//! instead of silent truncation or a panic.

use crate::error::{Result, TorError};

/// Convert a payload length to the wire `u16` length field, rejecting
/// anything that would not round-trip (§4.1 `PayloadTooLarge`).
pub fn len_to_u16(len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| TorError::PayloadTooLarge(len))
}

/// Convert a stream/circuit count into the field width used on the wire.
pub fn count_to_u16(count: usize) -> Result<u16> {
    u16::try_from(count).map_err(|_| TorError::ProtocolError(format!("count {count} exceeds u16")))
}

/// Parse a decimal field from consensus text into a `u64`, surfacing a
/// `Directory` error rather than panicking on malformed input.
pub fn parse_u64_field(field: &str, context: &str) -> Result<u64> {
    field
        .parse::<u64>()
        .map_err(|_| TorError::Directory(format!("invalid {context}: {field:?}")))
}

/// Parse a port number, rejecting 0 and out-of-range values explicitly.
pub fn parse_port(field: &str) -> Result<u16> {
    field
        .parse::<u16>()
        .map_err(|_| TorError::Directory(format!("invalid port: {field:?}")))
}
