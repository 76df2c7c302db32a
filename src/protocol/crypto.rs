//! Per-hop relay cryptography: key derivation from an ntor `KEY_SEED`, and
//! the persistent AES-128-CTR stream plus running SHA-1 digest each hop
//! maintains for the lifetime of a circuit (§4.2).
//!
//! `HopCrypto` owns the *only* copy of this state; there is deliberately no
//! separate per-cell digest abstraction; one hop's onion layer is peeled by
//! exactly one `HopCrypto` and correctness depends on that state persisting
//! across every cell sent or received on the circuit.

use crate::error::{Result, TorError};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes128Ctr = Ctr128BE<Aes128>;

/// The 72 bytes of key material an ntor handshake expands into: `Df(20) ||
/// Db(20) || Kf(16) || Kb(16)` (§4.3).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CircuitKeys {
    pub forward_key: [u8; 16],
    pub backward_key: [u8; 16],
    pub forward_digest_seed: [u8; 20],
    pub backward_digest_seed: [u8; 20],
}

const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

impl CircuitKeys {
    /// Expand an ntor `KEY_SEED` via HKDF-SHA256 using `KEY_SEED` directly as
    /// the pseudorandom key (RFC 5869's Extract step is a no-op here because
    /// `KEY_SEED` is already HMAC-SHA256 output).
    pub fn derive_from_key_seed(key_seed: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| TorError::KeyDerivationFailed("invalid PRK length".into()))?;

        let mut okm = [0u8; 72];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| TorError::KeyDerivationFailed("HKDF expand failed".into()))?;

        let mut forward_digest_seed = [0u8; 20];
        let mut backward_digest_seed = [0u8; 20];
        let mut forward_key = [0u8; 16];
        let mut backward_key = [0u8; 16];
        forward_digest_seed.copy_from_slice(&okm[0..20]);
        backward_digest_seed.copy_from_slice(&okm[20..40]);
        forward_key.copy_from_slice(&okm[40..56]);
        backward_key.copy_from_slice(&okm[56..72]);

        Ok(Self {
            forward_key,
            backward_key,
            forward_digest_seed,
            backward_digest_seed,
        })
    }
}

/// Live per-hop state: the two AES-CTR keystreams and the two running SHA-1
/// digests. Tor's AES-CTR IV is all-zero at handshake completion and the
/// stream advances monotonically for the circuit's lifetime — constructing a
/// fresh `Ctr128BE` per cell would silently reset the keystream and corrupt
/// every cell after the first.
pub struct HopCrypto {
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
    forward_digest: Sha1,
    backward_digest: Sha1,
}

impl HopCrypto {
    pub fn new(keys: &CircuitKeys) -> Self {
        let zero_iv = [0u8; 16];
        let mut forward_digest = Sha1::new();
        forward_digest.update(keys.forward_digest_seed);
        let mut backward_digest = Sha1::new();
        backward_digest.update(keys.backward_digest_seed);
        Self {
            forward_cipher: Aes128Ctr::new(&keys.forward_key.into(), &zero_iv.into()),
            backward_cipher: Aes128Ctr::new(&keys.backward_key.into(), &zero_iv.into()),
            forward_digest,
            backward_digest,
        }
    }

    /// Apply this hop's outward keystream layer in place (used when sending:
    /// the outermost hop is applied last).
    pub fn encrypt_forward(&mut self, data: &mut [u8]) {
        self.forward_cipher.apply_keystream(data);
    }

    /// Peel this hop's inward keystream layer in place (CTR mode: encrypt
    /// and decrypt are the same operation).
    pub fn decrypt_backward(&mut self, data: &mut [u8]) {
        self.backward_cipher.apply_keystream(data);
    }

    /// Advance the forward running digest over a relay payload (digest field
    /// zeroed) about to be sent from this client, and return the 4-byte tag
    /// to embed in the wire payload.
    pub fn next_forward_digest(&mut self, payload_digest_zeroed: &[u8]) -> [u8; 4] {
        self.forward_digest.update(payload_digest_zeroed);
        let snapshot = self.forward_digest.clone().finalize();
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&snapshot[0..4]);
        tag
    }

    /// Tentatively check whether `payload_digest_zeroed` (a relay payload
    /// just decrypted at this hop, with its digest field zeroed out for the
    /// computation) is the next cell in this hop's backward stream. On match
    /// the running digest state is committed; on mismatch state is left
    /// untouched so the caller can try peeling the next hop instead.
    pub fn try_backward_digest(&mut self, payload_digest_zeroed: &[u8], claimed: &[u8; 4]) -> bool {
        let mut trial = self.backward_digest.clone();
        trial.update(payload_digest_zeroed);
        let hash = trial.clone().finalize();
        if &hash[0..4] == claimed {
            self.backward_digest = trial;
            true
        } else {
            false
        }
    }
}
