//! Three-hop path selection: weighted-random choice of guard, middle and
//! exit relays from the current consensus (§4.6).
//!
//! Every random choice here draws from [`OsRng`] directly — path selection
//! is a value a network observer benefits from predicting, so a
//! non-cryptographic PRNG is never an acceptable substitute.

use crate::error::{Result, TorError};
use crate::protocol::relay::Relay;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashSet;

/// Bandwidth-weight fractions from the consensus `bw-weights` line (§4.5),
/// applied per relay role during selection. Tor ships ten of these (Wgg,
/// Wgd, Wmg, Wme, Wee, Wmm, ...); only the three this client's selection
/// path actually consumes are kept.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthWeights {
    pub wgg: u32,
    pub wee: u32,
    pub wmm: u32,
}

impl Default for BandwidthWeights {
    /// Neutral weights (10000 = 1.0 in Tor's fixed-point scale) used when the
    /// consensus carries no `bw-weights` line.
    fn default() -> Self {
        Self {
            wgg: 10_000,
            wee: 10_000,
            wmm: 10_000,
        }
    }
}

/// Relays already committed to a circuit being built, used to enforce the
/// same-family / same-subnet / no-repeat exclusion rules across hops.
#[derive(Debug, Default, Clone)]
pub struct PathConstraints {
    excluded_fingerprints: HashSet<String>,
    excluded_subnets: HashSet<[u8; 2]>,
}

impl PathConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a relay as part of the path, excluding its fingerprint, its
    /// subnet, and the fingerprints of everything in its `MyFamily` cluster
    /// from subsequent hop selection.
    pub fn commit(&mut self, relay: &Relay) {
        self.excluded_fingerprints.insert(relay.fingerprint.clone());
        for member in &relay.family {
            self.excluded_fingerprints.insert(member.clone());
        }
        if let Some(subnet) = relay.subnet_key() {
            self.excluded_subnets.insert(subnet);
        }
    }

    fn allows(&self, relay: &Relay) -> bool {
        if self.excluded_fingerprints.contains(&relay.fingerprint) {
            return false;
        }
        if let Some(subnet) = relay.subnet_key() {
            if self.excluded_subnets.contains(&subnet) {
                return false;
            }
        }
        true
    }
}

/// Pick one relay from `candidates` with probability proportional to
/// `weight(relay) * relay.bandwidth`, using a cryptographically secure RNG.
fn weighted_choice<'a>(
    candidates: &[&'a Relay],
    weight: impl Fn(&Relay) -> u64,
) -> Option<&'a Relay> {
    let total: u128 = candidates
        .iter()
        .map(|r| weight(r) as u128 * r.bandwidth.max(1) as u128)
        .sum();
    if total == 0 || candidates.is_empty() {
        return None;
    }
    let mut rng = OsRng;
    // Draw a uniform 64-bit value and reduce into [0, total) with a widening
    // multiply, avoiding modulo bias from naive `% total`.
    let draw = rng.next_u64() as u128;
    let target = (draw * total) >> 64;

    let mut acc: u128 = 0;
    for relay in candidates {
        acc += weight(relay) as u128 * relay.bandwidth.max(1) as u128;
        if target < acc {
            return Some(relay);
        }
    }
    candidates.last().copied()
}

/// Select a guard relay, excluding whatever `constraints` already rules out.
pub fn select_guard<'a>(
    relays: &'a [Relay],
    weights: &BandwidthWeights,
    constraints: &PathConstraints,
) -> Result<&'a Relay> {
    let candidates: Vec<&Relay> = relays
        .iter()
        .filter(|r| r.is_guard_eligible() && constraints.allows(r))
        .collect();
    weighted_choice(&candidates, |_| weights.wgg as u64)
        .ok_or_else(|| TorError::NoSuitableRelay("no eligible guard relay".into()))
}

/// Select a middle relay for the given `exclude` constraints.
pub fn select_middle<'a>(
    relays: &'a [Relay],
    weights: &BandwidthWeights,
    constraints: &PathConstraints,
) -> Result<&'a Relay> {
    let candidates: Vec<&Relay> = relays
        .iter()
        .filter(|r| r.is_middle_eligible() && constraints.allows(r))
        .collect();
    weighted_choice(&candidates, |_| weights.wmm as u64)
        .ok_or_else(|| TorError::NoSuitableRelay("no eligible middle relay".into()))
}

/// Select an exit relay whose policy permits `target_port`.
pub fn select_exit<'a>(
    relays: &'a [Relay],
    weights: &BandwidthWeights,
    constraints: &PathConstraints,
    target_port: u16,
) -> Result<&'a Relay> {
    let candidates: Vec<&Relay> = relays
        .iter()
        .filter(|r| {
            r.is_exit_eligible() && constraints.allows(r) && r.exit_policy_permits(target_port)
        })
        .collect();
    weighted_choice(&candidates, |_| weights.wee as u64)
        .ok_or_else(|| TorError::NoSuitableRelay("no eligible exit relay for target port".into()))
}

/// Select a full three-hop path (guard, middle, exit) honoring all
/// exclusion rules between hops.
pub fn select_path<'a>(
    relays: &'a [Relay],
    weights: &BandwidthWeights,
    target_port: u16,
) -> Result<[&'a Relay; 3]> {
    let mut constraints = PathConstraints::new();

    let guard = select_guard(relays, weights, &constraints)?;
    constraints.commit(guard);

    let exit = select_exit(relays, weights, &constraints, target_port)?;
    constraints.commit(exit);

    let middle = select_middle(relays, weights, &constraints)?;

    Ok([guard, middle, exit])
}

/// Select a three-hop path that terminates at a specific relay rather than a
/// weighted-random exit: used for circuits to an HSDir, introduction point,
/// or rendezvous point, which are chosen by the onion-service protocol, not
/// by exit-policy weighting. `last_hop` fills the role of the third hop
/// directly; only the guard and middle are drawn from the weighted pool.
pub fn select_path_to<'a>(
    relays: &'a [Relay],
    weights: &BandwidthWeights,
    last_hop: &'a Relay,
) -> Result<[&'a Relay; 3]> {
    let mut constraints = PathConstraints::new();

    let guard = select_guard(relays, weights, &constraints)?;
    constraints.commit(guard);

    constraints.commit(last_hop);
    let middle = select_middle(relays, weights, &constraints)?;

    Ok([guard, middle, last_hop])
}
