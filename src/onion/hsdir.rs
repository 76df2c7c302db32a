//! Time-period key blinding, descriptor-ID derivation, and HSDir ring
//! selection (§4.9).

use crate::protocol::Relay;
use sha3::{Digest, Sha3_256};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const REPLICAS: u8 = 2;
const HSDIRS_PER_REPLICA: usize = 3;

const BLIND_DOMAIN: &[u8] = b"toronoe-hs-blind";
const DESCRIPTOR_ID_DOMAIN: &[u8] = b"toronoe-hs-descriptor-id";
const REPLICA_DOMAIN: &[u8] = b"toronoe-hs-replica";
const RING_DOMAIN: &[u8] = b"toronoe-hs-ring";

/// The daily epoch index used for key blinding, rolling over at 00:00 UTC.
pub fn time_period(unix_time: u64) -> u64 {
    unix_time / SECONDS_PER_DAY
}

/// Blind `identity_pubkey` for `period` so the unblinded service identity
/// never appears on the wire or in a directory query.
pub fn blinded_public_key(identity_pubkey: &[u8; 32], period: u64) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(BLIND_DOMAIN);
    hasher.update(identity_pubkey);
    hasher.update(period.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Descriptor ID for the current time period, published under
/// `/tor/hs/3/<descriptor-id>`.
pub fn descriptor_id(blinded_pubkey: &[u8; 32], period: u64) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(DESCRIPTOR_ID_DOMAIN);
    hasher.update(blinded_pubkey);
    hasher.update(period.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn ring_position(fingerprint: &str) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(RING_DOMAIN);
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Pick the HSDirs responsible for `descriptor_id`: for each of 2 replicas,
/// the 3 `HSDir`-flagged relays on the consensus ring closest in XOR
/// distance to `SHA3(descriptor_id || replica)`.
pub fn select_hsdirs<'a>(relays: &'a [Relay], descriptor_id: &[u8; 32]) -> Vec<&'a Relay> {
    let ring: Vec<(&Relay, [u8; 32])> = relays
        .iter()
        .filter(|r| r.flags.hs_dir)
        .map(|r| (r, ring_position(&r.fingerprint)))
        .collect();

    let mut chosen: Vec<&Relay> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for replica in 0..REPLICAS {
        let mut hasher = Sha3_256::new();
        hasher.update(REPLICA_DOMAIN);
        hasher.update(descriptor_id);
        hasher.update([replica]);
        let digest = hasher.finalize();
        let mut target = [0u8; 32];
        target.copy_from_slice(&digest);

        let mut ranked: Vec<&(&Relay, [u8; 32])> = ring.iter().collect();
        ranked.sort_by_key(|(_, pos)| xor_distance(pos, &target));

        for (relay, _) in ranked.into_iter().take(HSDIRS_PER_REPLICA) {
            if seen.insert(relay.fingerprint.clone()) {
                chosen.push(relay);
            }
        }
    }

    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RelayFlags;

    fn hsdir_relay(fp: &str) -> Relay {
        Relay {
            nickname: fp.to_string(),
            fingerprint: fp.to_string(),
            address: "1.2.3.4".parse().unwrap(),
            or_port: 443,
            dir_port: None,
            flags: RelayFlags { hs_dir: true, running: true, ..Default::default() },
            bandwidth: 1000,
            published: 0,
            ntor_onion_key: None,
            family: Vec::new(),
            exit_policy_summary: None,
        }
    }

    #[test]
    fn time_period_rolls_over_daily() {
        assert_eq!(time_period(0), 0);
        assert_eq!(time_period(SECONDS_PER_DAY - 1), 0);
        assert_eq!(time_period(SECONDS_PER_DAY), 1);
    }

    #[test]
    fn blinding_is_deterministic_and_period_dependent() {
        let identity = [9u8; 32];
        let a = blinded_public_key(&identity, 100);
        let b = blinded_public_key(&identity, 100);
        let c = blinded_public_key(&identity, 101);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn select_hsdirs_only_returns_hsdir_flagged_relays() {
        let relays: Vec<Relay> = (0..20).map(|i| hsdir_relay(&format!("FP{i}"))).collect();
        let id = descriptor_id(&[1u8; 32], 5);
        let chosen = select_hsdirs(&relays, &id);
        assert!(!chosen.is_empty());
        assert!(chosen.iter().all(|r| r.flags.hs_dir));
    }

    #[test]
    fn select_hsdirs_deduplicates_across_replicas() {
        let relays: Vec<Relay> = (0..6).map(|i| hsdir_relay(&format!("FP{i}"))).collect();
        let id = descriptor_id(&[2u8; 32], 7);
        let chosen = select_hsdirs(&relays, &id);
        let unique: std::collections::HashSet<&str> =
            chosen.iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(unique.len(), chosen.len());
    }
}
