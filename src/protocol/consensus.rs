//! Directory consensus parsing (§4.5).
//!
//! Parses the network consensus document fetched from a directory authority
//! or mirror: per-relay `r`/`s`/`w`/`p` record blocks plus the document-level
//! validity window and bandwidth-weight table.

use super::path_selector::BandwidthWeights;
use super::relay::{Relay, RelayFlags};
use crate::error::{Result, TorError};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Parsed consensus document: relay list plus the parameters path selection
/// needs. Held behind `arc_swap::ArcSwap` by callers so readers never block
/// on a refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub valid_after: u64,
    pub fresh_until: u64,
    pub valid_until: u64,
    pub relays: Vec<Relay>,
    pub version: u32,
    #[serde(default)]
    pub weights: ConsensusWeights,
}

/// Serializable mirror of [`BandwidthWeights`] (kept separate since the
/// latter derives `Copy`/`Clone` only, not `Serialize`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsensusWeights {
    pub wgg: u32,
    pub wee: u32,
    pub wmm: u32,
}

impl Default for ConsensusWeights {
    fn default() -> Self {
        let defaults = BandwidthWeights::default();
        Self {
            wgg: defaults.wgg,
            wee: defaults.wee,
            wmm: defaults.wmm,
        }
    }
}

impl From<ConsensusWeights> for BandwidthWeights {
    fn from(w: ConsensusWeights) -> Self {
        BandwidthWeights {
            wgg: w.wgg,
            wee: w.wee,
            wmm: w.wmm,
        }
    }
}

impl Consensus {
    pub fn is_fresh(&self) -> bool {
        crate::time::unix_timestamp() < self.fresh_until
    }

    pub fn is_valid(&self) -> bool {
        crate::time::unix_timestamp() < self.valid_until
    }

    pub fn running_relays(&self) -> Vec<&Relay> {
        self.relays.iter().filter(|r| r.is_running()).collect()
    }
}

pub struct ConsensusParser;

impl ConsensusParser {
    pub fn parse(data: &[u8]) -> Result<Consensus> {
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| TorError::Directory(format!("invalid UTF-8 in consensus: {e}")))?;
        Self::parse_text(&text)
    }

    pub fn parse_text(text: &str) -> Result<Consensus> {
        let mut valid_after = 0;
        let mut fresh_until = 0;
        let mut valid_until = 0;
        let mut version = 3;
        let mut weights = ConsensusWeights::default();
        let mut relays = Vec::new();

        let mut current_relay: Option<RelayBuilder> = None;

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("network-status-version ") {
                version = rest.split_whitespace().next().and_then(|v| v.parse().ok()).unwrap_or(3);
            } else if let Some(rest) = line.strip_prefix("valid-after ") {
                valid_after = parse_consensus_timestamp(rest).unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("fresh-until ") {
                fresh_until = parse_consensus_timestamp(rest).unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("valid-until ") {
                valid_until = parse_consensus_timestamp(rest).unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("bw-weights ") {
                weights = parse_bw_weights(rest);
            } else if let Some(rest) = line.strip_prefix("r ") {
                if let Some(builder) = current_relay.take() {
                    relays.push(builder.build());
                }
                current_relay = Some(parse_r_line(rest)?);
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(builder) = current_relay.as_mut() {
                    builder.flags = Some(RelayFlags::from_string(rest));
                }
            } else if let Some(rest) = line.strip_prefix("w ") {
                if let Some(builder) = current_relay.as_mut() {
                    if let Some(bw) = parse_bandwidth(rest) {
                        builder.bandwidth = Some(bw);
                    }
                }
            } else if let Some(rest) = line.strip_prefix("p ") {
                if let Some(builder) = current_relay.as_mut() {
                    builder.exit_policy_summary = Some(rest.to_string());
                }
            } else if let Some(rest) = line.strip_prefix("id ed25519 ") {
                let _ = rest; // ed25519 identity is verified off the CERTS cell, not needed here.
            }
        }

        if let Some(builder) = current_relay {
            relays.push(builder.build());
        }

        Ok(Consensus {
            valid_after,
            fresh_until,
            valid_until,
            version,
            relays,
            weights,
        })
    }
}

/// `r` line: `r nickname identity digest published-date published-time IP ORPort DirPort`.
/// `identity` is base64 (no padding); everything downstream of this parser
/// expects hex, matching `Relay::fingerprint`'s documented format.
fn parse_r_line(rest: &str) -> Result<RelayBuilder> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    if parts.len() < 7 {
        return Err(TorError::Directory("malformed r line".into()));
    }

    let nickname = parts[0].to_string();
    let fingerprint = base64_identity_to_hex(parts[1])?;

    // parts[2] = digest, parts[3..5] = published date/time, parts[5] = IP,
    // parts[6] = ORPort, parts[7] = DirPort (optional).
    let address: IpAddr = parts[5]
        .parse()
        .map_err(|_| TorError::Directory("invalid relay IP address".into()))?;
    let or_port: u16 = parts[6]
        .parse()
        .map_err(|_| TorError::Directory("invalid OR port".into()))?;
    let dir_port = parts.get(7).and_then(|p| p.parse().ok()).filter(|p| *p != 0);
    let published = parse_consensus_timestamp(&format!("{} {}", parts[3], parts[4])).unwrap_or(0);

    Ok(RelayBuilder {
        nickname,
        fingerprint,
        address,
        or_port,
        dir_port,
        published,
        flags: None,
        bandwidth: None,
        ntor_onion_key: None,
        family: Vec::new(),
        exit_policy_summary: None,
    })
}

fn base64_identity_to_hex(identity: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(identity.trim_end_matches('='))
        .map_err(|e| TorError::Directory(format!("invalid relay identity encoding: {e}")))?;
    if bytes.len() != 20 {
        return Err(TorError::Directory("relay identity is not 20 bytes".into()));
    }
    Ok(hex::encode_upper(bytes))
}

fn parse_bandwidth(rest: &str) -> Option<u64> {
    rest.split_whitespace()
        .find_map(|part| part.strip_prefix("Bandwidth=").and_then(|v| v.parse().ok()))
}

fn parse_bw_weights(rest: &str) -> ConsensusWeights {
    let mut weights = ConsensusWeights::default();
    for part in rest.split_whitespace() {
        let Some((key, value)) = part.split_once('=') else { continue };
        let Ok(value) = value.parse::<u32>() else { continue };
        match key {
            "Wgg" => weights.wgg = value,
            "Wee" => weights.wee = value,
            "Wmm" => weights.wmm = value,
            _ => {}
        }
    }
    weights
}

/// `YYYY-MM-DD HH:MM:SS`, always UTC, always this shape (§4.5). A full
/// calendar crate is unwarranted for a format this fixed; days since the
/// epoch are counted directly via a Gregorian day-count.
fn parse_consensus_timestamp(text: &str) -> Option<u64> {
    let mut parts = text.trim().splitn(2, ' ');
    let date = parts.next()?;
    let time = parts.next()?;

    let mut date_parts = date.split('-');
    let year: i64 = date_parts.next()?.parse().ok()?;
    let month: i64 = date_parts.next()?.parse().ok()?;
    let day: i64 = date_parts.next()?.parse().ok()?;

    let mut time_parts = time.split(':');
    let hour: i64 = time_parts.next()?.parse().ok()?;
    let minute: i64 = time_parts.next()?.parse().ok()?;
    let second: i64 = time_parts.next()?.parse().ok()?;

    let days = days_from_civil(year, month, day);
    let seconds = days * 86_400 + hour * 3600 + minute * 60 + second;
    u64::try_from(seconds).ok()
}

/// Howard Hinnant's `days_from_civil`: proleptic Gregorian date to a day
/// count relative to 1970-01-01, valid for any year representable in `i64`.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

struct RelayBuilder {
    nickname: String,
    fingerprint: String,
    address: IpAddr,
    or_port: u16,
    dir_port: Option<u16>,
    published: u64,
    flags: Option<RelayFlags>,
    bandwidth: Option<u64>,
    ntor_onion_key: Option<String>,
    family: Vec<String>,
    exit_policy_summary: Option<String>,
}

impl RelayBuilder {
    fn build(self) -> Relay {
        Relay {
            nickname: self.nickname,
            fingerprint: self.fingerprint,
            address: self.address,
            or_port: self.or_port,
            dir_port: self.dir_port,
            flags: self.flags.unwrap_or_default(),
            bandwidth: self.bandwidth.unwrap_or(0),
            published: self.published,
            ntor_onion_key: self.ntor_onion_key,
            family: self.family,
            exit_policy_summary: self.exit_policy_summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parses_known_date() {
        // 2024-01-01 00:00:00 UTC is 1704067200.
        assert_eq!(parse_consensus_timestamp("2024-01-01 00:00:00"), Some(1_704_067_200));
    }

    #[test]
    fn timestamp_round_trips_epoch() {
        assert_eq!(parse_consensus_timestamp("1970-01-01 00:00:00"), Some(0));
    }

    #[test]
    fn parse_consensus_basic() {
        let identity = base64::engine::general_purpose::STANDARD_NO_PAD.encode([0xABu8; 20]);
        let sample = format!(
            "network-status-version 3\n\
             valid-after 2024-01-01 00:00:00\n\
             fresh-until 2024-01-01 01:00:00\n\
             valid-until 2024-01-01 03:00:00\n\
             bw-weights Wgg=9000 Wee=8000 Wmm=10000\n\
             r TestRelay {identity} digestdigest 2024-01-01 00:00:00 1.2.3.4 9001 9030\n\
             s Fast Guard Running Stable Valid\n\
             w Bandwidth=1000000\n\
             p accept 80,443\n"
        );

        let consensus = ConsensusParser::parse_text(&sample).unwrap();
        assert_eq!(consensus.version, 3);
        assert_eq!(consensus.relays.len(), 1);
        assert_eq!(consensus.weights.wgg, 9000);
        assert_eq!(consensus.weights.wee, 8000);

        let relay = &consensus.relays[0];
        assert_eq!(relay.nickname, "TestRelay");
        assert_eq!(relay.fingerprint, hex::encode_upper([0xABu8; 20]));
        assert_eq!(relay.or_port, 9001);
        assert!(relay.flags.fast);
        assert!(relay.flags.guard);
        assert_eq!(relay.exit_policy_summary.as_deref(), Some("accept 80,443"));
    }

    #[test]
    fn bw_weights_default_when_absent() {
        let consensus = ConsensusParser::parse_text("network-status-version 3\n").unwrap();
        assert_eq!(consensus.weights.wgg, 10_000);
    }
}
