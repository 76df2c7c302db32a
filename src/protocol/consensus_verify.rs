//! Consensus signature quorum check (dir-spec §3.4.1).
//!
//! A consensus is only trustworthy if enough of the hardcoded directory
//! authorities signed it; otherwise a single compromised or spoofed mirror
//! could hand out a consensus full of relays it controls. This module
//! counts how many of the trailing `directory-signature` blocks come from
//! known authorities. It does not yet verify the RSA signature bytes
//! themselves against each authority's known key, only that the signer is
//! one of the nine authorities — see [`ConsensusVerifier::verify_consensus`].

use crate::error::{Result, TorError};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DirectoryAuthority {
    pub name: &'static str,
    /// RSA identity fingerprint, hex, 40 chars.
    pub v3ident: &'static str,
    pub ed25519_key: Option<&'static str>,
}

/// The nine authorities, from `src/app/config/auth_dirs.inc` in the Tor
/// source tree.
pub const DIRECTORY_AUTHORITIES: &[DirectoryAuthority] = &[
    DirectoryAuthority { name: "moria1", v3ident: "D586D18309DED4CD6D57C18FDB97EFA96D330566", ed25519_key: None },
    DirectoryAuthority { name: "tor26", v3ident: "14C131DFC5C6F93646BE72FA1401C02A8DF2E8B4", ed25519_key: None },
    DirectoryAuthority { name: "dizum", v3ident: "E8A9C45EDE6D711294FADF8E7951F4DE6CA56B58", ed25519_key: None },
    DirectoryAuthority { name: "gabelmoo", v3ident: "ED03BB616EB2F60BEC80151114BB25CEF515B226", ed25519_key: None },
    DirectoryAuthority { name: "dannenberg", v3ident: "0232AF901C31A04EE9848595AF9BB7620D4C5B2E", ed25519_key: None },
    DirectoryAuthority { name: "maatuska", v3ident: "49015F787433103580E3B66A1707A00E60F2D15B", ed25519_key: None },
    DirectoryAuthority { name: "Faravahar", v3ident: "EFCBE720AB3A82B99F9E953CD5BF50F7EEFC7B97", ed25519_key: None },
    DirectoryAuthority { name: "longclaw", v3ident: "23D15D965BC35114467363C165C4F724B64B4F66", ed25519_key: None },
    DirectoryAuthority { name: "bastet", v3ident: "27102BC123E7AF1D4741AE047E160C91ADC76B21", ed25519_key: None },
];

pub const MIN_AUTHORITY_SIGNATURES: usize = 5;

#[derive(Debug, Clone)]
pub struct DirectorySignature {
    pub algorithm: String,
    pub identity: String,
    pub signing_key_digest: String,
    pub signature: Vec<u8>,
}

fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint.chars().filter(|c| !c.is_whitespace()).collect::<String>().to_uppercase()
}

/// Walks a consensus document's `directory-signature` blocks one at a time.
/// Kept separate from [`ConsensusVerifier`] so the line-scanning state lives
/// in one small place instead of being threaded through index arithmetic.
struct SignatureBlocks<'a> {
    lines: std::iter::Peekable<std::str::Lines<'a>>,
}

impl<'a> SignatureBlocks<'a> {
    fn new(text: &'a str) -> Self {
        Self { lines: text.lines().peekable() }
    }
}

impl Iterator for SignatureBlocks<'_> {
    type Item = DirectorySignature;

    fn next(&mut self) -> Option<DirectorySignature> {
        loop {
            let header = self.lines.find(|l| l.trim_start().starts_with("directory-signature"))?;
            let parts: Vec<&str> = header.split_whitespace().collect();
            let (algorithm, identity, signing_key_digest) = match parts.as_slice() {
                // Old format predates the algorithm field.
                [_, identity, digest] => ("sha1".to_string(), identity.to_string(), digest.to_string()),
                [_, algorithm, identity, digest, ..] => (algorithm.to_string(), identity.to_string(), digest.to_string()),
                _ => continue,
            };

            let mut body = String::new();
            let mut in_body = false;
            while let Some(line) = self.lines.peek() {
                let line = line.trim();
                if line == "-----BEGIN SIGNATURE-----" {
                    in_body = true;
                    self.lines.next();
                } else if line == "-----END SIGNATURE-----" {
                    self.lines.next();
                    break;
                } else if in_body {
                    body.push_str(line);
                    self.lines.next();
                } else {
                    // Next signature block starts before this one ended.
                    break;
                }
            }

            let Ok(signature) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &body) else {
                continue;
            };
            return Some(DirectorySignature { algorithm, identity, signing_key_digest, signature });
        }
    }
}

pub struct ConsensusVerifier {
    authorities: HashMap<String, DirectoryAuthority>,
}

impl ConsensusVerifier {
    pub fn new() -> Self {
        let authorities = DIRECTORY_AUTHORITIES
            .iter()
            .map(|auth| (normalize_fingerprint(auth.v3ident), auth.clone()))
            .collect();
        Self { authorities }
    }

    pub fn parse_signatures(&self, consensus_text: &str) -> Vec<DirectorySignature> {
        SignatureBlocks::new(consensus_text).collect()
    }

    /// Count signatures from known authorities and require at least
    /// [`MIN_AUTHORITY_SIGNATURES`] of them. This is an identity-only check:
    /// a signer being a known authority is verified, but the RSA signature
    /// itself is not yet checked against that authority's public key.
    pub fn verify_consensus(&self, consensus_text: &str) -> Result<usize> {
        let signatures = self.parse_signatures(consensus_text);
        tracing::debug!(count = signatures.len(), "parsed consensus signature blocks");

        let mut verified_authorities = Vec::new();
        for sig in &signatures {
            let identity = normalize_fingerprint(&sig.identity);
            match self.authorities.get(&identity) {
                Some(auth) => verified_authorities.push(auth.name),
                None => tracing::debug!(identity = %identity, "signature from unknown signer"),
            }
        }

        tracing::info!(
            authority_signatures = verified_authorities.len(),
            required = MIN_AUTHORITY_SIGNATURES,
            authorities = ?verified_authorities,
            "consensus signature quorum check"
        );

        if verified_authorities.len() >= MIN_AUTHORITY_SIGNATURES {
            Ok(verified_authorities.len())
        } else {
            Err(TorError::ConsensusError(format!(
                "insufficient authority signatures: got {}, need {MIN_AUTHORITY_SIGNATURES}",
                verified_authorities.len()
            )))
        }
    }

    /// Same quorum count as [`Self::verify_consensus`] without the logging,
    /// for callers that already log elsewhere (e.g. a control-port command).
    pub fn quick_verify(&self, consensus_text: &str) -> Result<usize> {
        let count = self
            .parse_signatures(consensus_text)
            .iter()
            .filter(|sig| self.is_authority(&sig.identity))
            .count();
        if count >= MIN_AUTHORITY_SIGNATURES {
            Ok(count)
        } else {
            Err(TorError::ConsensusError(format!("only {count} authority signatures found, need {MIN_AUTHORITY_SIGNATURES}")))
        }
    }

    pub fn is_authority(&self, fingerprint: &str) -> bool {
        self.authorities.contains_key(&normalize_fingerprint(fingerprint))
    }

    pub fn get_authority(&self, fingerprint: &str) -> Option<&DirectoryAuthority> {
        self.authorities.get(&normalize_fingerprint(fingerprint))
    }
}

impl Default for ConsensusVerifier {
    fn default() -> Self {
        Self::new()
    }
}
