//! Rendezvous handshake: ESTABLISH_RENDEZVOUS, INTRODUCE1/INTRODUCE_ACK, and
//! RENDEZVOUS2 completion (§4.9 steps 2-6).
//!
//! The client-to-service key exchange carried inside INTRODUCE1 is the
//! hs-ntor handshake: the same curve25519 + HKDF shape as the link-layer
//! ntor handshake in [`crate::protocol::NtorHandshake`], but keyed against
//! the introduction point's encryption key rather than a relay's onion key,
//! and SHA3-256 throughout in place of SHA-256 (`hs-ntor-curve25519-sha3-256-1`).

use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::Sha3_256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

type Aes128Ctr = Ctr128BE<Aes128>;
type HmacSha3_256 = Hmac<Sha3_256>;

const PROTOID: &[u8] = b"hs-ntor-curve25519-sha3-256-1";
const T_HSENC: &[u8] = b"hs-ntor-curve25519-sha3-256-1:hs_key_extract";
const T_HSMAC: &[u8] = b"hs-ntor-curve25519-sha3-256-1:hs_mac";
const M_HSEXPAND: &[u8] = b"hs-ntor-curve25519-sha3-256-1:hs_key_expand";

/// 20-byte value the client picks so the rendezvous point can match up the
/// two circuits meeting at it (§4.9 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousCookie(pub [u8; 20]);

impl RendezvousCookie {
    pub fn random() -> Self {
        let mut bytes = [0u8; 20];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// The INTRODUCE1 payload sent to the chosen introduction point (§4.9 step 4).
#[derive(Debug, Clone)]
pub struct Introduce1 {
    pub legacy_key_id: [u8; 20],
    pub auth_key_type: u8,
    pub auth_key: [u8; 32],
    pub encrypted_data: Vec<u8>,
}

impl Introduce1 {
    /// `legacy-key-id (20, zero for v3) || auth-key-type (1) || auth-key-len
    /// (2) || auth-key || extension-count (1, always 0) || encrypted-data`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + 1 + 2 + 32 + 1 + self.encrypted_data.len());
        out.extend_from_slice(&self.legacy_key_id);
        out.push(self.auth_key_type);
        out.extend_from_slice(&(self.auth_key.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.auth_key);
        out.push(0); // extension-count
        out.extend_from_slice(&self.encrypted_data);
        out
    }
}

/// Client-side hs-ntor state for one introduction attempt.
pub struct HsNtorClient {
    client_secret: StaticSecret,
    client_public: PublicKey,
}

impl HsNtorClient {
    pub fn new() -> Result<Self> {
        let client_secret = StaticSecret::random_from_rng(OsRng);
        let client_public = PublicKey::from(&client_secret);
        if client_public.as_bytes().iter().all(|&b| b == 0) {
            return Err(TorError::EntropyError("generated hs-ntor key has no entropy".into()));
        }
        Ok(Self { client_secret, client_public })
    }

    /// Build the INTRODUCE1 `encrypted-data`: an hs-ntor handshake against
    /// `ip_enc_key` whose plaintext carries the rendezvous point identity,
    /// the rendezvous cookie, and the client's own ephemeral public key.
    pub fn build_encrypted_data(
        &self,
        ip_enc_key: &PublicKey,
        rp_identity: &[u8; 20],
        rp_cookie: &RendezvousCookie,
    ) -> Result<Vec<u8>> {
        let shared = self.client_secret.diffie_hellman(ip_enc_key);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(ip_enc_key.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let prk = hmac_extract(T_HSENC, &secret_input);
        let hkdf = Hkdf::<Sha3_256>::from_prk(&prk)
            .map_err(|_| TorError::KeyDerivationFailed("invalid hs-ntor PRK length".into()))?;
        let mut okm = [0u8; 32];
        hkdf.expand(M_HSEXPAND, &mut okm)
            .map_err(|_| TorError::KeyDerivationFailed("hs-ntor HKDF expand failed".into()))?;
        let (enc_key, mac_key) = okm.split_at(16);

        let mut plaintext = Vec::with_capacity(20 + 20 + 32);
        plaintext.extend_from_slice(rp_identity);
        plaintext.extend_from_slice(&rp_cookie.0);
        plaintext.extend_from_slice(self.client_public.as_bytes());

        let mut key = [0u8; 16];
        key.copy_from_slice(enc_key);
        let mut cipher = Aes128Ctr::new(&key.into(), &[0u8; 16].into());
        cipher.apply_keystream(&mut plaintext);

        let mac = hmac_once(mac_key, &plaintext);

        let mut encrypted_data = Vec::with_capacity(32 + plaintext.len() + 32);
        encrypted_data.extend_from_slice(self.client_public.as_bytes());
        encrypted_data.extend_from_slice(&plaintext);
        encrypted_data.extend_from_slice(&mac);
        Ok(encrypted_data)
    }

    pub fn client_public_key(&self) -> &PublicKey {
        &self.client_public
    }

    /// Complete the handshake against the service's half carried in
    /// RENDEZVOUS2, verifying its auth tag and returning the resulting
    /// 32-byte key seed applied as a fourth hop on the rendezvous circuit
    /// (§4.9 step 6).
    pub fn complete(&self, service_public_key: &PublicKey, service_auth: &[u8; 32]) -> Result<[u8; 32]> {
        let shared = self.client_secret.diffie_hellman(service_public_key);

        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared.as_bytes());
        secret_input.extend_from_slice(self.client_public.as_bytes());
        secret_input.extend_from_slice(service_public_key.as_bytes());
        secret_input.extend_from_slice(PROTOID);

        let key_seed = hmac_extract(T_HSENC, &secret_input);
        let expected_auth = hmac_once(T_HSMAC, &secret_input);

        let ok: bool = expected_auth.ct_eq(service_auth).into();
        if !ok {
            return Err(TorError::AuthVerificationFailed("hs-ntor auth mismatch".into()));
        }
        Ok(key_seed)
    }
}

fn hmac_extract(key: &[u8], data: &[u8]) -> [u8; 32] {
    hmac_once(key, data)
}

fn hmac_once(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha3_256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Where a single onion-service reachability attempt stands (§4.9 steps 1-7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendezvousState {
    AwaitingEstablished,
    Established,
    IntroduceSent,
    AwaitingRendezvous2,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_is_20_bytes_and_varies() {
        let a = RendezvousCookie::random();
        let b = RendezvousCookie::random();
        assert_eq!(a.0.len(), 20);
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn introduce1_layout_matches_field_order() {
        let client = HsNtorClient::new().unwrap();
        let ip_secret = StaticSecret::random_from_rng(OsRng);
        let ip_public = PublicKey::from(&ip_secret);
        let rp_id = [4u8; 20];
        let cookie = RendezvousCookie::random();
        let encrypted_data = client.build_encrypted_data(&ip_public, &rp_id, &cookie).unwrap();

        let intro = Introduce1 {
            legacy_key_id: [0u8; 20],
            auth_key_type: 2,
            auth_key: [9u8; 32],
            encrypted_data,
        };
        let bytes = intro.to_bytes();
        assert_eq!(&bytes[0..20], &[0u8; 20]);
        assert_eq!(bytes[20], 2);
        assert_eq!(&bytes[21..23], &32u16.to_be_bytes());
        assert_eq!(&bytes[23..55], &[9u8; 32]);
        assert_eq!(bytes[55], 0);
    }

    #[test]
    fn full_round_trip_yields_matching_key_seed() {
        let client = HsNtorClient::new().unwrap();
        let service_secret = StaticSecret::random_from_rng(OsRng);
        let service_public = PublicKey::from(&service_secret);

        // Mirror the client's derivation to produce a genuine service reply.
        let shared = service_secret.diffie_hellman(client.client_public_key());
        let mut secret_input = Vec::new();
        secret_input.extend_from_slice(shared.as_bytes());
        secret_input.extend_from_slice(client.client_public_key().as_bytes());
        secret_input.extend_from_slice(service_public.as_bytes());
        secret_input.extend_from_slice(PROTOID);
        let expected_seed = hmac_extract(T_HSENC, &secret_input);
        let auth = hmac_once(T_HSMAC, &secret_input);

        let seed = client.complete(&service_public, &auth).unwrap();
        assert_eq!(seed, expected_seed);
    }

    #[test]
    fn tampered_auth_tag_is_rejected() {
        let client = HsNtorClient::new().unwrap();
        let service_secret = StaticSecret::random_from_rng(OsRng);
        let service_public = PublicKey::from(&service_secret);
        let mut bogus_auth = [0u8; 32];
        OsRng.fill_bytes(&mut bogus_auth);

        let err = client.complete(&service_public, &bogus_auth).unwrap_err();
        assert!(matches!(err, TorError::AuthVerificationFailed(_)));
    }
}
