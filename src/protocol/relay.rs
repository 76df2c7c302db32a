//! Relay data model: one entry per consensus `r`/`s`/`w`/`p` record block (§3).
//!
//! Selection logic itself lives in [`crate::path_selector`]; this module only
//! owns the parsed shape and the flag predicates the selector consumes.

use crate::error::{Result, TorError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// A Tor relay as described by the current consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relay {
    pub nickname: String,
    /// Hex-encoded 20-byte identity fingerprint.
    pub fingerprint: String,
    pub address: IpAddr,
    pub or_port: u16,
    pub dir_port: Option<u16>,
    pub flags: RelayFlags,
    /// Consensus bandwidth weight (not necessarily real bytes/sec — a
    /// relative weight used directly in path-selection arithmetic).
    pub bandwidth: u64,
    pub published: u64,
    /// ntor onion key (curve25519, base64) if known from the consensus's
    /// inline `w`/`m` fields or a follow-up descriptor fetch.
    pub ntor_onion_key: Option<String>,
    /// Other relay fingerprints in the same `MyFamily` cluster.
    #[serde(default)]
    pub family: Vec<String>,
    /// Summarized exit policy: `accept`/`reject` plus a port set, e.g.
    /// `"accept 80,443"` or `"reject 1-65535"`. `None` means unknown/absent,
    /// treated as "rejects everything" for safety.
    #[serde(default)]
    pub exit_policy_summary: Option<String>,
}

impl Relay {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    /// Decode the hex `fingerprint` field into the raw 20-byte identity used
    /// in link specifiers and the rendezvous protocol.
    pub fn fingerprint_bytes(&self) -> Result<[u8; 20]> {
        let bytes = hex::decode(&self.fingerprint)
            .map_err(|e| TorError::ProtocolError(format!("invalid relay fingerprint: {e}")))?;
        if bytes.len() != 20 {
            return Err(TorError::ProtocolError("relay fingerprint must be 20 bytes".into()));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    pub fn is_guard_eligible(&self) -> bool {
        self.flags.guard && self.flags.fast && self.flags.stable && self.flags.running
    }

    pub fn is_exit_eligible(&self) -> bool {
        self.flags.fast && self.flags.running && !self.flags.bad_exit
    }

    pub fn is_middle_eligible(&self) -> bool {
        self.flags.fast && self.flags.running
    }

    pub fn is_running(&self) -> bool {
        self.flags.running
    }

    /// Exit-policy-permits-port check (§4.6 exit selection criterion).
    /// Summary grammar: `"accept <ports>"` or `"reject <ports>"` where
    /// `<ports>` is a comma-separated list of `N` or `N-M` ranges.
    pub fn exit_policy_permits(&self, port: u16) -> bool {
        let Some(summary) = &self.exit_policy_summary else {
            return false;
        };
        let mut parts = summary.split_whitespace();
        let verdict = parts.next().unwrap_or("reject");
        let ranges = parts.next().unwrap_or("");
        let in_ranges = ranges.split(',').any(|r| port_in_range(r, port));
        match verdict {
            "accept" => in_ranges,
            _ => !in_ranges,
        }
    }

    /// /16 IPv4 subnet, used for §4.6's same-subnet exclusion rule. IPv6
    /// relays are compared on the first 32 bits (/32) as a conservative
    /// analogue; returns `None` when no meaningful prefix applies.
    pub fn subnet_key(&self) -> Option<[u8; 2]> {
        match self.address {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Some([o[0], o[1]])
            }
            IpAddr::V6(_) => None,
        }
    }
}

fn port_in_range(spec: &str, port: u16) -> bool {
    let spec = spec.trim();
    if spec.is_empty() {
        return false;
    }
    if let Some((lo, hi)) = spec.split_once('-') {
        let lo: u16 = lo.trim().parse().unwrap_or(0);
        let hi: u16 = hi.trim().parse().unwrap_or(0);
        lo <= port && port <= hi
    } else {
        spec.parse::<u16>().map(|p| p == port).unwrap_or(false)
    }
}

/// Flags from a consensus `s` line (§4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub running: bool,
    pub stable: bool,
    pub v2_dir: bool,
    pub valid: bool,
}

impl RelayFlags {
    pub fn from_string(flags: &str) -> Self {
        let mut f = RelayFlags::default();
        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => f.authority = true,
                "BadExit" => f.bad_exit = true,
                "Exit" => f.exit = true,
                "Fast" => f.fast = true,
                "Guard" => f.guard = true,
                "HSDir" => f.hs_dir = true,
                "Running" => f.running = true,
                "Stable" => f.stable = true,
                "V2Dir" => f.v2_dir = true,
                "Valid" => f.valid = true,
                _ => {}
            }
        }
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_parsing() {
        let flags = RelayFlags::from_string("Fast Guard Running Stable Valid");
        assert!(flags.fast);
        assert!(flags.guard);
        assert!(flags.running);
        assert!(flags.stable);
        assert!(flags.valid);
        assert!(!flags.exit);
    }

    #[test]
    fn exit_policy_accept_list() {
        let relay = sample_relay(Some("accept 80,443,8000-8100"));
        assert!(relay.exit_policy_permits(80));
        assert!(relay.exit_policy_permits(8050));
        assert!(!relay.exit_policy_permits(22));
    }

    #[test]
    fn exit_policy_reject_list() {
        let relay = sample_relay(Some("reject 25"));
        assert!(!relay.exit_policy_permits(25));
        assert!(relay.exit_policy_permits(443));
    }

    #[test]
    fn missing_policy_rejects_everything() {
        let relay = sample_relay(None);
        assert!(!relay.exit_policy_permits(443));
    }

    fn sample_relay(policy: Option<&str>) -> Relay {
        Relay {
            nickname: "Test".into(),
            fingerprint: "AAAA".into(),
            address: "1.2.3.4".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags {
                fast: true,
                running: true,
                ..Default::default()
            },
            bandwidth: 1_000_000,
            published: 0,
            ntor_onion_key: None,
            family: Vec::new(),
            exit_policy_summary: policy.map(|s| s.to_string()),
        }
    }
}
