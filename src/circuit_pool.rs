//! Prebuilt general-purpose circuit pool (§4.8).
//!
//! Keeps `[min, max]` idle three-hop circuits ready so a SOCKS connection
//! rarely has to wait on a fresh circuit build. A background task tops the
//! pool up every 30s; callers needing a circuit either take an idle one or
//! build on demand.
//!
//! A `CircuitPool` only ever serves one isolation class. Streams that
//! present a SOCKS5 userpass credential get their own pool, built lazily and
//! without background top-up, so their circuits never mix with the shared
//! default pool or with another credential's circuits (`Orchestrator::pool_for`).

use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::protocol::{select_path, BandwidthWeights, Circuit, CircuitBuilder, Consensus};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::interval;

const REBUILD_INTERVAL: Duration = Duration::from_secs(30);
const HARD_CLOSE_AGE: Duration = Duration::from_secs(30 * 60);

pub struct CircuitPool {
    min_size: usize,
    max_size: usize,
    max_reuse_age: Duration,
    build_timeout: Duration,
    handshake_timeout: Duration,
    idle: Mutex<Vec<Arc<Circuit>>>,
    consensus: Arc<ArcSwap<Option<Consensus>>>,
    in_flight_builds: AtomicUsize,
}

impl CircuitPool {
    pub fn new(config: &TorConfig, consensus: Arc<ArcSwap<Option<Consensus>>>) -> Arc<Self> {
        Arc::new(Self {
            min_size: config.circuit_pool_min_size,
            max_size: config.circuit_pool_max_size,
            max_reuse_age: config.max_circuit_age,
            build_timeout: config.circuit_build_timeout,
            handshake_timeout: config.handshake_timeout,
            idle: Mutex::new(Vec::new()),
            consensus,
            in_flight_builds: AtomicUsize::new(0),
        })
    }

    /// Spawn the background top-up loop. Returns its `JoinHandle` so the
    /// orchestrator can abort it on shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(REBUILD_INTERVAL);
            loop {
                ticker.tick().await;
                pool.reap_and_refill().await;
            }
        })
    }

    async fn reap_and_refill(&self) {
        {
            let mut idle = self.idle.lock().await;
            idle.retain(|c| !c.is_destroyed() && c.age_secs() < HARD_CLOSE_AGE.as_secs());
        }
        let deficit = {
            let idle = self.idle.lock().await;
            self.min_size.saturating_sub(idle.len())
        };
        for _ in 0..deficit {
            if let Ok(circuit) = self.build_one().await {
                let mut idle = self.idle.lock().await;
                if idle.len() < self.max_size {
                    idle.push(circuit);
                }
            }
        }
    }

    async fn build_one(&self) -> Result<Arc<Circuit>> {
        let snapshot = self.consensus.load();
        let consensus = snapshot.as_ref().as_ref().ok_or_else(|| TorError::Directory("no consensus loaded".into()))?;
        let running: Vec<crate::protocol::Relay> = consensus.running_relays().into_iter().cloned().collect();
        let weights: BandwidthWeights = consensus.weights.into();
        let path = select_path(&running, &weights, 443)?;
        let builder = CircuitBuilder::new(self.handshake_timeout);
        builder.build(path, self.build_timeout).await
    }

    /// Hand out an idle circuit below the reuse-age cutoff, or build fresh.
    pub async fn get_circuit(&self) -> Result<Arc<Circuit>> {
        {
            let mut idle = self.idle.lock().await;
            while let Some(c) = idle.pop() {
                if !c.is_destroyed() && c.age_secs() < self.max_reuse_age.as_secs() {
                    return Ok(c);
                }
            }
        }
        self.in_flight_builds.fetch_add(1, Ordering::Relaxed);
        let result = self.build_one().await;
        self.in_flight_builds.fetch_sub(1, Ordering::Relaxed);
        result
    }

    /// Return a still-healthy circuit to the idle set if there is headroom.
    pub async fn return_circuit(&self, circuit: Arc<Circuit>) {
        if circuit.is_destroyed() {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_size {
            idle.push(circuit);
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_circuit_fails_cleanly_without_consensus() {
        let config = TorConfig::default();
        let consensus: Arc<ArcSwap<Option<Consensus>>> = Arc::new(ArcSwap::from_pointee(None));
        let pool = CircuitPool::new(&config, consensus);
        let err = pool.get_circuit().await.unwrap_err();
        assert!(matches!(err, TorError::Directory(_)));
    }

    #[tokio::test]
    async fn idle_pool_starts_empty() {
        let config = TorConfig::default();
        let consensus: Arc<ArcSwap<Option<Consensus>>> = Arc::new(ArcSwap::from_pointee(None));
        let pool = CircuitPool::new(&config, consensus);
        assert_eq!(pool.idle_count().await, 0);
    }
}
