//! Guard selection and lifecycle (§4.6).
//!
//! A small set of entry relays is kept stable across circuits to limit an
//! adversary's ability to eventually place itself on every circuit's first
//! hop. State here is a thin in-memory model; [`crate::persist`] handles the
//! on-disk `guards` file.

use crate::protocol::Relay;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;

pub const GUARD_LIFETIME_SECS: u64 = 30 * 24 * 60 * 60;
pub const MIN_GUARDS: usize = 1;
pub const MAX_GUARDS: usize = 3;
const CONSECUTIVE_FAILURES_TO_MARK_DOWN: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStatus {
    Untested,
    Confirmed,
    Down,
}

#[derive(Debug, Clone)]
pub struct GuardRecord {
    pub fingerprint: String,
    pub first_seen: u64,
    pub status: GuardStatus,
    pub confirmed_at: u64,
    consecutive_failures: u32,
}

impl GuardRecord {
    fn new(fingerprint: String, now: u64) -> Self {
        Self { fingerprint, first_seen: now, status: GuardStatus::Untested, confirmed_at: 0, consecutive_failures: 0 }
    }

    pub fn is_usable(&self) -> bool {
        !matches!(self.status, GuardStatus::Down)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.first_seen) > GUARD_LIFETIME_SECS
    }

    /// `fingerprint \t first_seen_unix \t status \t confirmed_at_unix`.
    pub fn to_line(&self) -> String {
        let status = match self.status {
            GuardStatus::Untested => "untested",
            GuardStatus::Confirmed => "confirmed",
            GuardStatus::Down => "down",
        };
        format!("{}\t{}\t{}\t{}", self.fingerprint, self.first_seen, status, self.confirmed_at)
    }

    pub fn from_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(4, '\t');
        let fingerprint = parts.next()?.to_string();
        let first_seen: u64 = parts.next()?.parse().ok()?;
        let status = match parts.next()? {
            "confirmed" => GuardStatus::Confirmed,
            "down" => GuardStatus::Down,
            _ => GuardStatus::Untested,
        };
        let confirmed_at: u64 = parts.next()?.parse().ok()?;
        Some(Self { fingerprint, first_seen, status, confirmed_at, consecutive_failures: 0 })
    }
}

/// The active guard set. `≤ NumGuards` at all times (§8 invariant).
pub struct GuardStore {
    guards: HashMap<String, GuardRecord>,
    num_guards: usize,
}

impl GuardStore {
    pub fn new(num_guards: usize) -> Self {
        Self { guards: HashMap::new(), num_guards: num_guards.clamp(MIN_GUARDS, MAX_GUARDS) }
    }

    pub fn from_records(records: Vec<GuardRecord>, num_guards: usize) -> Self {
        let mut store = Self::new(num_guards);
        for r in records {
            store.guards.insert(r.fingerprint.clone(), r);
        }
        store
    }

    pub fn records(&self) -> Vec<&GuardRecord> {
        self.guards.values().collect()
    }

    pub fn usable_fingerprints(&self) -> Vec<String> {
        self.guards.values().filter(|g| g.is_usable()).map(|g| g.fingerprint.clone()).collect()
    }

    pub fn needs_selection(&self) -> bool {
        self.guards.values().filter(|g| g.is_usable()).count() < self.num_guards
    }

    /// Pick fresh guard(s) from `candidates` (already filtered to Guard+Fast+Stable
    /// and weighted by the caller) until `num_guards` usable entries exist.
    pub fn fill_from(&mut self, candidates: &[&Relay], now: u64) {
        while self.needs_selection() {
            let remaining: Vec<&&Relay> = candidates
                .iter()
                .filter(|r| !self.guards.contains_key(&r.fingerprint))
                .collect();
            if remaining.is_empty() {
                break;
            }
            let idx = (OsRng.next_u32() as usize) % remaining.len();
            let chosen = remaining[idx];
            self.guards.insert(chosen.fingerprint.clone(), GuardRecord::new(chosen.fingerprint.clone(), now));
        }
        debug_assert!(self.guards.len() <= MAX_GUARDS);
    }

    pub fn mark_confirmed(&mut self, fingerprint: &str, now: u64) {
        if let Some(g) = self.guards.get_mut(fingerprint) {
            g.status = GuardStatus::Confirmed;
            g.confirmed_at = now;
            g.consecutive_failures = 0;
        }
    }

    pub fn mark_failure(&mut self, fingerprint: &str) {
        if let Some(g) = self.guards.get_mut(fingerprint) {
            g.consecutive_failures += 1;
            if g.consecutive_failures >= CONSECUTIVE_FAILURES_TO_MARK_DOWN {
                g.status = GuardStatus::Down;
            }
        }
    }

    pub fn expire_old(&mut self, now: u64) {
        self.guards.retain(|_, g| !g.is_expired(now));
    }

    pub fn to_persisted_text(&self) -> String {
        self.guards.values().map(GuardRecord::to_line).collect::<Vec<_>>().join("\n")
    }

    pub fn from_persisted_text(text: &str, num_guards: usize) -> Self {
        let records = text.lines().filter_map(GuardRecord::from_line).collect();
        Self::from_records(records, num_guards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_relay(fp: &str) -> Relay {
        Relay {
            nickname: fp.to_string(),
            fingerprint: fp.to_string(),
            address: "1.2.3.4".parse().unwrap(),
            or_port: 443,
            dir_port: None,
            flags: Default::default(),
            bandwidth: 1000,
            published: 0,
            ntor_onion_key: None,
            family: Vec::new(),
            exit_policy_summary: None,
        }
    }

    #[test]
    fn guard_count_never_exceeds_num_guards() {
        let relays = vec![sample_relay("A"), sample_relay("B"), sample_relay("C"), sample_relay("D")];
        let refs: Vec<&Relay> = relays.iter().collect();
        let mut store = GuardStore::new(2);
        store.fill_from(&refs, 0);
        assert_eq!(store.records().len(), 2);
        store.fill_from(&refs, 0);
        assert_eq!(store.records().len(), 2);
    }

    #[test]
    fn three_consecutive_failures_marks_guard_down() {
        let mut store = GuardStore::new(1);
        store.guards.insert("A".into(), GuardRecord::new("A".into(), 0));
        store.mark_failure("A");
        store.mark_failure("A");
        assert!(store.guards["A"].is_usable());
        store.mark_failure("A");
        assert!(!store.guards["A"].is_usable());
    }

    #[test]
    fn persisted_text_round_trips() {
        let mut store = GuardStore::new(2);
        store.guards.insert("ABCD".into(), GuardRecord::new("ABCD".into(), 100));
        store.mark_confirmed("ABCD", 200);
        let text = store.to_persisted_text();
        let reloaded = GuardStore::from_persisted_text(&text, 2);
        let rec = &reloaded.records()[0];
        assert_eq!(rec.fingerprint, "ABCD");
        assert_eq!(rec.first_seen, 100);
        assert_eq!(rec.status, GuardStatus::Confirmed);
        assert_eq!(rec.confirmed_at, 200);
    }

    #[test]
    fn expired_guards_are_dropped() {
        let mut store = GuardStore::new(2);
        store.guards.insert("OLD".into(), GuardRecord::new("OLD".into(), 0));
        store.expire_old(GUARD_LIFETIME_SECS + 1);
        assert!(store.records().is_empty());
    }
}
