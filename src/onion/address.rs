//! v3 onion address encode/decode (§4.9, glossary "Onion address (v3)").
//!
//! A v3 address is `base32(pubkey || checksum || version) + ".onion"` where
//! `checksum = SHA3-256(".onion checksum" || pubkey || version)[..2]`.

use crate::error::{Result, TorError};
use data_encoding::BASE32_NOPAD;
use sha3::{Digest, Sha3_256};

const VERSION: u8 = 0x03;
const CHECKSUM_CONSTANT: &[u8] = b".onion checksum";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionAddress {
    pub public_key: [u8; 32],
}

impl OnionAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let label = address.strip_suffix(".onion").unwrap_or(address);
        let decoded = BASE32_NOPAD
            .decode(label.to_uppercase().as_bytes())
            .map_err(|_| TorError::ChecksumMismatch)?;
        if decoded.len() != 35 {
            return Err(TorError::ChecksumMismatch);
        }

        let public_key: [u8; 32] = decoded[..32].try_into().unwrap();
        let checksum = &decoded[32..34];
        let version = decoded[34];

        if version != VERSION {
            return Err(TorError::ChecksumMismatch);
        }
        if compute_checksum(&public_key, version) != checksum {
            return Err(TorError::ChecksumMismatch);
        }

        Ok(Self { public_key })
    }

    pub fn encode(&self) -> String {
        let checksum = compute_checksum(&self.public_key, VERSION);
        let mut payload = Vec::with_capacity(35);
        payload.extend_from_slice(&self.public_key);
        payload.extend_from_slice(&checksum);
        payload.push(VERSION);
        format!("{}.onion", BASE32_NOPAD.encode(&payload).to_lowercase())
    }
}

fn compute_checksum(public_key: &[u8; 32], version: u8) -> [u8; 2] {
    let mut hasher = Sha3_256::new();
    hasher.update(CHECKSUM_CONSTANT);
    hasher.update(public_key);
    hasher.update([version]);
    let digest = hasher.finalize();
    [digest[0], digest[1]]
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN_ADDRESS: &str = "vww6ybal4bd7szmgncyruucpgfkqahzddi37ktceo3ah7ngmcopnpyyd.onion";

    #[test]
    fn known_address_parses_and_round_trips() {
        let parsed = OnionAddress::parse(KNOWN_ADDRESS).unwrap();
        assert_eq!(parsed.encode(), KNOWN_ADDRESS);
    }

    #[test]
    fn single_character_mutation_is_rejected() {
        let mut mutated: Vec<char> = KNOWN_ADDRESS.chars().collect();
        // Flip a base32 character in the body, not the ".onion" suffix.
        mutated[2] = if mutated[2] == 'a' { 'b' } else { 'a' };
        let mutated: String = mutated.into_iter().collect();
        assert!(matches!(OnionAddress::parse(&mutated), Err(TorError::ChecksumMismatch)));
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(matches!(OnionAddress::parse("short.onion"), Err(TorError::ChecksumMismatch)));
    }
}
