//! CERTS cell parsing and relay certificate verification (§4.2).
//!
//! The CERTS cell is the only thing standing between "this is the relay the
//! consensus told us about" and "this is whoever answered on that IP". A
//! relay presents an Ed25519 signing-key certificate (type 4) signed by its
//! identity key, plus (for the RSA/Ed25519 cross-cert chain) a type-7
//! certificate binding that identity to the fingerprint in the consensus.
//! [`CertificateVerifier`] checks that chain; [`super::circuit::link_handshake`]
//! treats any failure here as fatal to the handshake.

use crate::error::{Result, TorError};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use std::collections::HashSet;

/// Certificate types carried in a CERTS cell (§4.2). Only 4 and 7 matter to
/// this client; the RSA-only legacy types (1-3) are recorded but never used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CertType {
    RsaLink = 1,
    RsaId = 2,
    RsaAuth = 3,
    Ed25519SigningKey = 4,
    Ed25519TlsLink = 5,
    Ed25519AuthKey = 6,
    Ed25519Identity = 7,
}

impl CertType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(CertType::RsaLink),
            2 => Some(CertType::RsaId),
            3 => Some(CertType::RsaAuth),
            4 => Some(CertType::Ed25519SigningKey),
            5 => Some(CertType::Ed25519TlsLink),
            6 => Some(CertType::Ed25519AuthKey),
            7 => Some(CertType::Ed25519Identity),
            _ => None,
        }
    }
}

/// One still-undecoded certificate entry from a CERTS cell.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub cert_type: u8,
    pub data: Vec<u8>,
}

/// Tor's `tor-cert` format: `VERSION(1) CERT_TYPE(1) EXPIRATION(4,
/// hours-since-epoch) CERT_KEY_TYPE(1) CERTIFIED_KEY(32) N_EXTENSIONS(1)
/// extensions... SIGNATURE(64)`.
#[derive(Debug, Clone)]
pub struct Ed25519Certificate {
    pub version: u8,
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub cert_key_type: u8,
    pub certified_key: [u8; 32],
    /// Everything before the signature, i.e. what the signature covers.
    pub raw_data: Vec<u8>,
    pub signature: [u8; 64],
}

const CERT_HEADER_LEN: usize = 40;
const CERT_MIN_LEN: usize = CERT_HEADER_LEN + 64;

impl Ed25519Certificate {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CERT_MIN_LEN {
            return Err(TorError::CertificateError(format!(
                "certificate too short: {} bytes, need at least {CERT_MIN_LEN}",
                data.len()
            )));
        }

        let version = data[0];
        if version != 0x01 {
            return Err(TorError::CertificateError(format!("unknown certificate version {version}")));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let cert_key_type = data[6];
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = CERT_HEADER_LEN;
        for i in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(TorError::CertificateError(format!("extension {i} header truncated")));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            offset += 4 + ext_len;
        }

        if data.len() < offset + 64 {
            return Err(TorError::CertificateError(format!(
                "certificate truncated: expected signature at offset {offset}, have {} bytes",
                data.len()
            )));
        }
        let sig_start = data.len() - 64;
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[sig_start..]);
        let raw_data = data[..sig_start].to_vec();

        Ok(Self { version, cert_type, expiration_hours, cert_key_type, certified_key, raw_data, signature })
    }

    pub fn verify_signature(&self, signing_key: &[u8; 32]) -> Result<()> {
        let verifying_key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| TorError::CertificateError(format!("invalid signing key: {e}")))?;
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&self.raw_data, &signature)
            .map_err(|e| TorError::CertificateError(format!("signature verification failed: {e}")))
    }

    pub fn is_expired(&self) -> bool {
        let now_hours = (crate::time::unix_timestamp() / 3600) as u32;
        self.expiration_hours < now_hours
    }
}

/// A parsed CERTS cell with its type-4/type-7 keys already pulled out, since
/// those are the only two the link handshake ever looks at.
#[derive(Debug)]
pub struct CertsCell {
    pub certificates: Vec<Certificate>,
    pub ed25519_identity: Option<[u8; 32]>,
    pub ed25519_signing_key: Option<[u8; 32]>,
}

impl CertsCell {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let n_certs = *data.first().ok_or_else(|| TorError::CertificateError("empty CERTS cell".into()))? as usize;
        let mut offset = 1;
        let mut certificates = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(TorError::CertificateError(format!("CERTS cell truncated at certificate {i}")));
            }
            let cert_type = data[offset];
            let cert_len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;
            if offset + cert_len > data.len() {
                return Err(TorError::CertificateError(format!(
                    "certificate {i} truncated: need {cert_len} bytes, have {}",
                    data.len() - offset
                )));
            }
            certificates.push(Certificate { cert_type, data: data[offset..offset + cert_len].to_vec() });
            offset += cert_len;
        }

        let mut ed25519_identity = None;
        let mut ed25519_signing_key = None;
        for cert in &certificates {
            match cert.cert_type {
                4 => {
                    if let Ok(parsed) = Ed25519Certificate::parse(&cert.data) {
                        ed25519_signing_key = Some(parsed.certified_key);
                    }
                }
                7 => {
                    if let Ok(parsed) = Ed25519Certificate::parse(&cert.data) {
                        ed25519_identity = Some(parsed.certified_key);
                    }
                }
                _ => {}
            }
        }

        Ok(Self { certificates, ed25519_identity, ed25519_signing_key })
    }

    pub fn get_cert(&self, cert_type: u8) -> Option<&Certificate> {
        self.certificates.iter().find(|c| c.cert_type == cert_type)
    }
}

/// Checks a relay's CERTS cell against a consensus fingerprint set it was
/// seeded with. An empty set (as when verifying before a consensus is
/// loaded) skips the fingerprint-membership check but never the signature
/// chain — [`Self::quick_verify`] is the explicit opt-in for that case.
pub struct CertificateVerifier {
    consensus_fingerprints: HashSet<[u8; 20]>,
}

impl CertificateVerifier {
    pub fn new() -> Self {
        Self { consensus_fingerprints: HashSet::new() }
    }

    /// Seed the verifier with every fingerprint from a loaded consensus, so
    /// [`Self::verify_relay_certs`] can reject a relay not listed in it.
    pub fn from_consensus(consensus: &super::Consensus) -> Self {
        let mut verifier = Self::new();
        for relay in consensus.running_relays() {
            if let Ok(bytes) = hex::decode(&relay.fingerprint) {
                if bytes.len() == 20 {
                    let mut fp = [0u8; 20];
                    fp.copy_from_slice(&bytes);
                    verifier.add_fingerprint(fp);
                }
            }
        }
        verifier
    }

    pub fn add_fingerprint(&mut self, fingerprint: [u8; 20]) {
        self.consensus_fingerprints.insert(fingerprint);
    }

    pub fn add_fingerprints_from_hex(&mut self, fingerprints: &[&str]) -> Result<()> {
        for fp_hex in fingerprints {
            let bytes = hex::decode(fp_hex).map_err(|e| TorError::CertificateError(format!("invalid fingerprint hex: {e}")))?;
            if bytes.len() != 20 {
                return Err(TorError::CertificateError(format!("fingerprint must be 20 bytes, got {}", bytes.len())));
            }
            let mut fp = [0u8; 20];
            fp.copy_from_slice(&bytes);
            self.add_fingerprint(fp);
        }
        Ok(())
    }

    /// Full chain check: the type-4 signing-key cert must be unexpired and
    /// signed by the type-7 identity key, and that identity's fingerprint
    /// must be one this client actually expected to dial.
    pub fn verify_relay_certs(&self, certs_cell: &CertsCell, expected_fingerprint: &[u8; 20]) -> Result<VerifiedRelay> {
        let signing_key_cert = certs_cell
            .get_cert(4)
            .ok_or_else(|| TorError::CertificateError("missing Ed25519 signing key certificate (type 4)".into()))?;
        let signing_cert = Ed25519Certificate::parse(&signing_key_cert.data)?;
        if signing_cert.is_expired() {
            return Err(TorError::CertificateError("signing key certificate is expired".into()));
        }

        let identity_key = certs_cell
            .ed25519_identity
            .ok_or_else(|| TorError::CertificateError("could not extract Ed25519 identity from CERTS cell".into()))?;
        signing_cert.verify_signature(&identity_key)?;
        tracing::trace!("signing key certificate signature verified");

        if !self.consensus_fingerprints.is_empty() && !self.consensus_fingerprints.contains(expected_fingerprint) {
            return Err(TorError::CertificateError("relay fingerprint not found in consensus".into()));
        }

        Ok(VerifiedRelay {
            ed25519_identity: identity_key,
            ed25519_signing_key: signing_cert.certified_key,
            fingerprint: *expected_fingerprint,
        })
    }

    /// Lighter check used only when no consensus fingerprint is known yet
    /// (e.g. the very first directory-fetch connection): the signature
    /// chain still has to be internally consistent, just not matched
    /// against a specific expected identity.
    pub fn quick_verify(&self, certs_cell: &CertsCell) -> Result<()> {
        let signing_key_cert = certs_cell.get_cert(4).ok_or_else(|| TorError::CertificateError("missing signing key certificate".into()))?;
        let signing_cert = Ed25519Certificate::parse(&signing_key_cert.data)?;
        if signing_cert.is_expired() {
            return Err(TorError::CertificateError("signing key certificate is expired".into()));
        }
        let identity_key = certs_cell
            .ed25519_identity
            .or(certs_cell.ed25519_signing_key)
            .ok_or_else(|| TorError::CertificateError("could not extract any Ed25519 keys from certificates".into()))?;
        if certs_cell.ed25519_identity.is_some() {
            signing_cert.verify_signature(&identity_key)?;
        }
        tracing::trace!("quick certificate check passed");
        Ok(())
    }
}

impl Default for CertificateVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// A relay's identity as established by a verified certificate chain.
#[derive(Debug, Clone)]
pub struct VerifiedRelay {
    pub ed25519_identity: [u8; 32],
    pub ed25519_signing_key: [u8; 32],
    pub fingerprint: [u8; 20],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_certs_cell_is_rejected() {
        assert!(CertsCell::parse(&[]).is_err());
    }

    #[test]
    fn zero_certs_is_a_valid_empty_cell() {
        let cell = CertsCell::parse(&[0u8]).unwrap();
        assert_eq!(cell.certificates.len(), 0);
    }

    #[test]
    fn cert_type_round_trips_known_values() {
        assert_eq!(CertType::from_u8(4), Some(CertType::Ed25519SigningKey));
        assert_eq!(CertType::from_u8(7), Some(CertType::Ed25519Identity));
        assert_eq!(CertType::from_u8(99), None);
    }

    #[test]
    fn quick_verify_rejects_a_cell_with_no_signing_key_cert() {
        let cell = CertsCell { certificates: Vec::new(), ed25519_identity: None, ed25519_signing_key: None };
        let verifier = CertificateVerifier::new();
        assert!(verifier.quick_verify(&cell).is_err());
    }

    #[test]
    fn verify_relay_certs_rejects_a_fingerprint_outside_the_consensus_set() {
        use ed25519_dalek::{Signer, SigningKey};
        let identity = SigningKey::generate(&mut rand::rngs::OsRng);
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);

        let mut raw = vec![0x01, 0x04];
        raw.extend_from_slice(&u32::MAX.to_be_bytes());
        raw.push(0x01);
        raw.extend_from_slice(signing.verifying_key().as_bytes());
        raw.push(0x00);
        let signature = identity.sign(&raw);
        let cert_bytes = [raw.as_slice(), signature.to_bytes().as_slice()].concat();

        let cell = CertsCell {
            certificates: vec![Certificate { cert_type: 4, data: cert_bytes }],
            ed25519_identity: Some(*identity.verifying_key().as_bytes()),
            ed25519_signing_key: None,
        };

        let mut verifier = CertificateVerifier::new();
        verifier.add_fingerprint([0xAAu8; 20]);
        let err = verifier.verify_relay_certs(&cell, &[0xBBu8; 20]).unwrap_err();
        assert!(matches!(err, TorError::CertificateError(_)));
    }
}
