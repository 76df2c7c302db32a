//! Statistical exercise of full three-hop path selection (§4.6) over a
//! larger synthetic network with multiple family clusters, confirming the
//! exclusion rules hold across many independent selections rather than just
//! one.

use std::collections::HashSet;
use toronoe::protocol::{select_path, BandwidthWeights, Relay, RelayFlags};

const TRIALS: usize = 5_000;

fn eligible_flags() -> RelayFlags {
    RelayFlags {
        fast: true,
        stable: true,
        running: true,
        guard: true,
        exit: true,
        ..Default::default()
    }
}

/// Build a network of `count` relays spread across `family_clusters` groups;
/// every relay in a cluster lists every other member of that cluster in
/// `family`, and each cluster sits on its own /16 subnet.
fn synthetic_network(count: usize, family_clusters: usize) -> Vec<Relay> {
    let cluster_size = count / family_clusters;
    let mut relays: Vec<Relay> = (0..count)
        .map(|i| {
            let cluster = i / cluster_size.max(1);
            Relay {
                nickname: format!("relay{i}"),
                fingerprint: format!("FP{i:04}"),
                address: std::net::IpAddr::V4(std::net::Ipv4Addr::new(10, cluster as u8, (i % 256) as u8, 1)),
                or_port: 9001,
                dir_port: None,
                flags: eligible_flags(),
                bandwidth: 1_000 + (i as u64 * 13) % 5_000,
                published: 0,
                ntor_onion_key: None,
                family: Vec::new(),
                exit_policy_summary: Some("accept 1-65535".into()),
            }
        })
        .collect();

    // Fill in family lists per cluster now that every relay exists.
    let clusters: Vec<Vec<usize>> = (0..family_clusters)
        .map(|c| (0..count).filter(|i| i / cluster_size.max(1) == c).collect())
        .collect();
    for cluster in &clusters {
        let fingerprints: Vec<String> = cluster.iter().map(|&i| relays[i].fingerprint.clone()).collect();
        for &i in cluster {
            relays[i].family = fingerprints
                .iter()
                .filter(|fp| **fp != relays[i].fingerprint)
                .cloned()
                .collect();
        }
    }
    relays
}

#[test]
fn selected_paths_never_combine_same_family_or_same_subnet_relays() {
    let relays = synthetic_network(60, 6);
    let weights = BandwidthWeights::default();

    for trial in 0..TRIALS {
        let path = select_path(&relays, &weights, 443)
            .unwrap_or_else(|e| panic!("trial {trial}: path selection failed: {e}"));

        let fingerprints: HashSet<&str> = path.iter().map(|r| r.fingerprint.as_str()).collect();
        assert_eq!(fingerprints.len(), 3, "trial {trial}: all three hops must be distinct relays");

        for (a_idx, a) in path.iter().enumerate() {
            for b in path.iter().skip(a_idx + 1) {
                assert!(
                    !a.family.contains(&b.fingerprint),
                    "trial {trial}: {} and {} share a family but were both selected",
                    a.fingerprint,
                    b.fingerprint
                );
                assert_ne!(
                    a.subnet_key(),
                    b.subnet_key(),
                    "trial {trial}: {} and {} share a /16 subnet but were both selected",
                    a.fingerprint,
                    b.fingerprint
                );
            }
        }
    }
}
