//! v3 onion service descriptor validation (§4.9).
//!
//! A descriptor is accepted only after its full signature chain checks out:
//! the service identity signs the descriptor-signing-key certificate, and
//! the signing key in turn signs the descriptor body. Any failure in that
//! chain, an expired cert, or a stale revision counter is `DescriptorRejected`
//! — there is no partial trust here.

use crate::error::{Result, TorError};
use crate::protocol::Ed25519Certificate;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// A relay advertised in a descriptor as reachable for introductions.
#[derive(Debug, Clone)]
pub struct IntroPoint {
    pub link_fingerprint: String,
    pub auth_key: [u8; 32],
    pub enc_key: [u8; 32],
}

/// A validated v3 onion service descriptor (§4.9, glossary "Descriptor (v3)").
#[derive(Debug, Clone)]
pub struct OnionDescriptor {
    pub signing_key_cert: Ed25519Certificate,
    pub revision_counter: u64,
    pub lifetime_secs: u32,
    pub introduction_points: Vec<IntroPoint>,
    body: Vec<u8>,
    signature: [u8; 64],
}

impl OnionDescriptor {
    /// Build a descriptor from its decoded fields, ready for validation.
    /// `body` is the exact byte range the descriptor signature covers.
    pub fn from_parts(
        signing_key_cert: Ed25519Certificate,
        revision_counter: u64,
        lifetime_secs: u32,
        introduction_points: Vec<IntroPoint>,
        body: Vec<u8>,
        signature: [u8; 64],
    ) -> Self {
        Self {
            signing_key_cert,
            revision_counter,
            lifetime_secs,
            introduction_points,
            body,
            signature,
        }
    }

    /// Parse the line-based descriptor text fetched from an HSDir.
    ///
    /// This is a simplified encoding, not byte-exact to the real Tor
    /// directory spec's descriptor format (no encrypted inner layers, no
    /// PEM-wrapped blocks): `descriptor-signing-key-cert` and `signature`
    /// carry base64 blobs, one `introduction-point` line per relay, and the
    /// Ed25519 signature covers every line before `signature` itself,
    /// joined with `\n`.
    pub fn parse(raw: &str) -> Result<Self> {
        let lines: Vec<&str> = raw.lines().collect();
        let sig_idx = lines
            .iter()
            .position(|l| l.starts_with("signature "))
            .ok_or_else(|| TorError::DescriptorRejected("descriptor has no signature line".into()))?;

        let body = lines[..sig_idx].join("\n").into_bytes();
        let signature = decode_fixed::<64>(lines[sig_idx].trim_start_matches("signature ").trim())?;

        let mut signing_key_cert = None;
        let mut revision_counter = None;
        let mut lifetime_secs = None;
        let mut introduction_points = Vec::new();

        for line in &lines[..sig_idx] {
            if let Some(rest) = line.strip_prefix("descriptor-signing-key-cert ") {
                let cert_bytes = base64::engine::general_purpose::STANDARD
                    .decode(rest.trim())
                    .map_err(|e| TorError::DescriptorRejected(format!("invalid signing key cert encoding: {e}")))?;
                signing_key_cert = Some(Ed25519Certificate::parse(&cert_bytes)?);
            } else if let Some(rest) = line.strip_prefix("revision-counter ") {
                revision_counter = Some(
                    rest.trim()
                        .parse::<u64>()
                        .map_err(|e| TorError::DescriptorRejected(format!("invalid revision-counter: {e}")))?,
                );
            } else if let Some(rest) = line.strip_prefix("descriptor-lifetime ") {
                lifetime_secs = Some(
                    rest.trim()
                        .parse::<u32>()
                        .map_err(|e| TorError::DescriptorRejected(format!("invalid descriptor-lifetime: {e}")))?,
                );
            } else if let Some(rest) = line.strip_prefix("introduction-point ") {
                let mut fields = rest.split_whitespace();
                let link_fingerprint = fields
                    .next()
                    .ok_or_else(|| TorError::DescriptorRejected("introduction-point missing link fingerprint".into()))?
                    .to_string();
                let auth_key = decode_fixed::<32>(fields.next().unwrap_or(""))?;
                let enc_key = decode_fixed::<32>(fields.next().unwrap_or(""))?;
                introduction_points.push(IntroPoint { link_fingerprint, auth_key, enc_key });
            }
        }

        let signing_key_cert =
            signing_key_cert.ok_or_else(|| TorError::DescriptorRejected("missing descriptor-signing-key-cert".into()))?;
        let revision_counter =
            revision_counter.ok_or_else(|| TorError::DescriptorRejected("missing revision-counter".into()))?;
        let lifetime_secs = lifetime_secs.unwrap_or(3 * 60 * 60);

        Ok(Self::from_parts(signing_key_cert, revision_counter, lifetime_secs, introduction_points, body, signature))
    }

    /// Verify the descriptor against the service's (unblinded) identity key
    /// and the highest revision counter previously cached for this address.
    pub fn validate(&self, identity_pubkey: &[u8; 32], cached_revision: Option<u64>) -> Result<()> {
        if self.signing_key_cert.is_expired() {
            return Err(TorError::DescriptorRejected(
                "descriptor-signing-key-cert is expired".into(),
            ));
        }

        self.signing_key_cert
            .verify_signature(identity_pubkey)
            .map_err(|e| TorError::DescriptorRejected(format!("identity did not sign signing key: {e}")))?;

        let signing_key = VerifyingKey::from_bytes(&self.signing_key_cert.certified_key)
            .map_err(|e| TorError::DescriptorRejected(format!("bad signing key: {e}")))?;
        let signature = Signature::from_bytes(&self.signature);
        signing_key
            .verify(&self.body, &signature)
            .map_err(|e| TorError::DescriptorRejected(format!("descriptor body signature invalid: {e}")))?;

        if let Some(cached) = cached_revision {
            if self.revision_counter < cached {
                return Err(TorError::DescriptorRejected(format!(
                    "revision counter {} is older than cached {}",
                    self.revision_counter, cached
                )));
            }
        }

        Ok(())
    }

    /// Uniform-random pick of one introduction point — never the first one
    /// in the list (§4.9 step 3).
    pub fn pick_introduction_point(&self) -> Option<&IntroPoint> {
        if self.introduction_points.is_empty() {
            return None;
        }
        use rand::rngs::OsRng;
        use rand::RngCore;
        let idx = (OsRng.next_u32() as usize) % self.introduction_points.len();
        self.introduction_points.get(idx)
    }
}

fn decode_fixed<const N: usize>(b64: &str) -> Result<[u8; N]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| TorError::DescriptorRejected(format!("invalid base64 field: {e}")))?;
    if bytes.len() != N {
        return Err(TorError::DescriptorRejected(format!("expected a {N}-byte field, got {}", bytes.len())));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{SigningKey, Signer};
    use rand::rngs::OsRng as DalekOsRng;

    fn signed_cert(identity: &SigningKey, signing_key: &VerifyingKey, expiration_hours: u32) -> Ed25519Certificate {
        let mut raw = Vec::new();
        raw.push(0x01); // version
        raw.push(0x04); // cert type: signing key
        raw.extend_from_slice(&expiration_hours.to_be_bytes());
        raw.push(0x01); // cert key type
        raw.extend_from_slice(signing_key.as_bytes());
        raw.push(0x00); // n_extensions

        let signature = identity.sign(&raw);
        Ed25519Certificate::parse(&[raw.as_slice(), signature.to_bytes().as_slice()].concat()).unwrap()
    }

    #[test]
    fn valid_chain_is_accepted() {
        let identity = SigningKey::generate(&mut DalekOsRng);
        let signing = SigningKey::generate(&mut DalekOsRng);
        let far_future_hours = u32::MAX;
        let cert = signed_cert(&identity, &signing.verifying_key(), far_future_hours);

        let body = b"descriptor body bytes".to_vec();
        let signature = signing.sign(&body).to_bytes();

        let descriptor = OnionDescriptor::from_parts(cert, 5, 3 * 60 * 60, Vec::new(), body, signature);

        assert!(descriptor.validate(identity.verifying_key().as_bytes(), Some(4)).is_ok());
    }

    #[test]
    fn wrong_identity_is_rejected() {
        let identity = SigningKey::generate(&mut DalekOsRng);
        let other = SigningKey::generate(&mut DalekOsRng);
        let signing = SigningKey::generate(&mut DalekOsRng);
        let cert = signed_cert(&identity, &signing.verifying_key(), u32::MAX);

        let body = b"descriptor body bytes".to_vec();
        let signature = signing.sign(&body).to_bytes();
        let descriptor = OnionDescriptor::from_parts(cert, 1, 3600, Vec::new(), body, signature);

        let err = descriptor.validate(other.verifying_key().as_bytes(), None).unwrap_err();
        assert!(matches!(err, TorError::DescriptorRejected(_)));
    }

    #[test]
    fn stale_revision_counter_is_rejected() {
        let identity = SigningKey::generate(&mut DalekOsRng);
        let signing = SigningKey::generate(&mut DalekOsRng);
        let cert = signed_cert(&identity, &signing.verifying_key(), u32::MAX);

        let body = b"descriptor body bytes".to_vec();
        let signature = signing.sign(&body).to_bytes();
        let descriptor = OnionDescriptor::from_parts(cert, 3, 3600, Vec::new(), body, signature);

        let err = descriptor
            .validate(identity.verifying_key().as_bytes(), Some(10))
            .unwrap_err();
        assert!(matches!(err, TorError::DescriptorRejected(_)));
    }

    #[test]
    fn parse_accepts_a_well_formed_descriptor_and_rejects_a_tampered_one() {
        let identity = SigningKey::generate(&mut DalekOsRng);
        let signing = SigningKey::generate(&mut DalekOsRng);
        let cert = signed_cert(&identity, &signing.verifying_key(), u32::MAX);
        let cert_bytes = [cert.raw_data.as_slice(), cert.signature.as_slice()].concat();
        let cert_b64 = base64::engine::general_purpose::STANDARD.encode(&cert_bytes);
        let ip_auth = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        let ip_enc = base64::engine::general_purpose::STANDARD.encode([8u8; 32]);

        let body = format!(
            "hs-descriptor 3\ndescriptor-signing-key-cert {cert_b64}\nrevision-counter 5\n\
             descriptor-lifetime 10800\nintroduction-point DEADBEEF {ip_auth} {ip_enc}"
        );
        let signature = signing.sign(body.as_bytes()).to_bytes();
        let sig_b64 = base64::engine::general_purpose::STANDARD.encode(signature);
        let text = format!("{body}\nsignature {sig_b64}\n");

        let descriptor = OnionDescriptor::parse(&text).unwrap();
        assert_eq!(descriptor.revision_counter, 5);
        assert_eq!(descriptor.introduction_points.len(), 1);
        assert!(descriptor.validate(identity.verifying_key().as_bytes(), None).is_ok());

        let tampered = text.replace("revision-counter 5", "revision-counter 6");
        let tampered_descriptor = OnionDescriptor::parse(&tampered).unwrap();
        assert!(tampered_descriptor.validate(identity.verifying_key().as_bytes(), None).is_err());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let identity = SigningKey::generate(&mut DalekOsRng);
        let signing = SigningKey::generate(&mut DalekOsRng);
        let cert = signed_cert(&identity, &signing.verifying_key(), u32::MAX);

        let signature = signing.sign(b"original body").to_bytes();
        let descriptor = OnionDescriptor::from_parts(cert, 1, 3600, Vec::new(), b"tampered body".to_vec(), signature);

        let err = descriptor.validate(identity.verifying_key().as_bytes(), None).unwrap_err();
        assert!(matches!(err, TorError::DescriptorRejected(_)));
    }
}
