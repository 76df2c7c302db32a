//! toronoe: a client-side Tor protocol engine.
//!
//! Accepts application traffic on a local SOCKS5 port, fetches and verifies
//! the network consensus, maintains a pool of prebuilt three-hop circuits
//! through volunteer relays, and multiplexes application streams over them.
//! v3 onion-service lookups (HSDir selection, descriptor validation,
//! rendezvous) extend the same circuit engine.
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 listener -> Orchestrator -> CircuitPool -> protocol::Circuit -> guard relay
//!                          |
//!                   DirectoryManager / GuardStore / DataStore
//! ```

pub mod config;
mod convert;
mod error;
mod time;

pub mod protocol;

mod circuit_pool;
pub mod guards;
mod onion;
mod onion_client;
mod persist;
pub mod socks;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};

pub use config::{LogLevel, TorConfig};
pub use error::{ErrorInfo, Result, TorError};
pub use onion::OnionAddress;

use circuit_pool::CircuitPool;
use guards::GuardStore;
use persist::DataStore;
use protocol::{Consensus, DirectoryManager};
use socks::SocksReplyCode;

const CONSENSUS_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notable lifecycle events, broadcast to anyone monitoring the client (e.g.
/// a future control-protocol server) via [`Orchestrator::subscribe`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Bootstrapped,
    ConsensusRefreshed,
    CircuitBuilt { circuit_id: u32 },
    CircuitBuildFailed { error: String },
    GuardMarkedDown { fingerprint: String },
}

/// Point-in-time snapshot for the stats/control-protocol surface (§6).
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub circuits_idle: usize,
    pub guards_usable: usize,
    pub has_consensus: bool,
    pub streams_opened: u64,
}

/// Owns every piece of long-lived client state and the background tasks that
/// keep it fresh: the directory client, the guard set, the circuit pool, and
/// the SOCKS5 front-end.
pub struct Orchestrator {
    config: TorConfig,
    data_store: DataStore,
    directory: DirectoryManager,
    consensus: Arc<ArcSwap<Option<Consensus>>>,
    guards: Mutex<GuardStore>,
    circuit_pool: Arc<CircuitPool>,
    /// Per-isolation-key circuit pools (SOCKS5 userpass credentials), built
    /// lazily on first use. Streams with no isolation credential share
    /// `circuit_pool` above; each distinct credential gets its own pool so
    /// its circuits never mix with anyone else's.
    isolated_pools: Mutex<HashMap<String, Arc<CircuitPool>>>,
    events: broadcast::Sender<ClientEvent>,
    streams_opened: AtomicU64,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("streams_opened", &self.streams_opened)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Run the full startup sequence (§4.1 / §6 control flow): validate
    /// config, open the data directory, load any cached consensus/guards,
    /// fetch a fresh consensus, fill the guard set, and start the
    /// background circuit-pool and consensus-refresh tasks.
    pub async fn bootstrap(config: TorConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let data_store = DataStore::open(config.data_directory.clone()).await?;
        let directory = DirectoryManager::new(&config.directory_mirrors, config.handshake_timeout);

        let consensus = match directory.fetch_consensus().await {
            Ok(fresh) => fresh,
            Err(fetch_err) => load_cached_consensus(&data_store)
                .await
                .filter(Consensus::is_valid)
                .ok_or(fetch_err)?,
        };
        if let Ok(encoded) = serde_json::to_vec(&consensus) {
            data_store.save_consensus(&encoded).await.ok();
        }

        let guard_candidates: Vec<protocol::Relay> = consensus
            .running_relays()
            .into_iter()
            .filter(|r| r.is_guard_eligible())
            .cloned()
            .collect();

        let mut guards = match data_store.load_guards().await {
            Some(text) => GuardStore::from_persisted_text(&text, config.num_guards),
            None => GuardStore::new(config.num_guards),
        };
        guards.expire_old(crate::time::unix_timestamp());
        let refs: Vec<&protocol::Relay> = guard_candidates.iter().collect();
        guards.fill_from(&refs, crate::time::unix_timestamp());
        data_store.save_guards(&guards.to_persisted_text()).await.ok();

        let consensus_cell: Arc<ArcSwap<Option<Consensus>>> = Arc::new(ArcSwap::from_pointee(Some(consensus)));
        let circuit_pool = CircuitPool::new(&config, Arc::clone(&consensus_cell));
        if config.enable_circuit_prebuilding {
            circuit_pool.spawn_maintenance();
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let orchestrator = Arc::new(Self {
            config,
            data_store,
            directory,
            consensus: consensus_cell,
            guards: Mutex::new(guards),
            circuit_pool,
            isolated_pools: Mutex::new(HashMap::new()),
            events,
            streams_opened: AtomicU64::new(0),
        });

        orchestrator.spawn_consensus_refresh();
        let _ = orchestrator.events.send(ClientEvent::Bootstrapped);
        tracing::info!(socks_port = orchestrator.config.socks_port, "bootstrap complete");
        Ok(orchestrator)
    }

    fn spawn_consensus_refresh(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONSENSUS_REFRESH_INTERVAL);
            ticker.tick().await; // first tick fires immediately; skip it, we just bootstrapped
            loop {
                ticker.tick().await;
                match this.directory.fetch_consensus().await {
                    Ok(fresh) => {
                        if let Ok(encoded) = serde_json::to_vec(&fresh) {
                            this.data_store.save_consensus(&encoded).await.ok();
                        }
                        this.consensus.store(Arc::new(Some(fresh)));
                        let _ = this.events.send(ClientEvent::ConsensusRefreshed);
                        tracing::info!("consensus refreshed");
                    }
                    Err(err) => {
                        tracing::warn!(%err, "periodic consensus refresh failed, keeping stale consensus");
                    }
                }
            }
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> ClientStats {
        ClientStats {
            circuits_idle: self.circuit_pool.idle_count().await,
            guards_usable: self.guards.lock().await.usable_fingerprints().len(),
            has_consensus: self.consensus.load().as_ref().is_some(),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
        }
    }

    /// Run the SOCKS5 accept loop until the process is asked to shut down.
    /// Each accepted connection is handled on its own task so one slow
    /// client never blocks another (§5 concurrency model).
    pub async fn run_socks_listener(self: Arc<Self>) -> Result<()> {
        let addr = ("127.0.0.1", self.config.socks_port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TorError::Internal(format!("cannot bind SOCKS5 port {}: {e}", self.config.socks_port)))?;
        tracing::info!(port = self.config.socks_port, "SOCKS5 listener open");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(%err, "SOCKS5 accept failed");
                    continue;
                }
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = this.handle_socks_connection(stream).await {
                    tracing::debug!(%peer, %err, "SOCKS5 connection ended with an error");
                }
            });
        }
    }

    async fn handle_socks_connection(self: &Arc<Self>, mut client: tokio::net::TcpStream) -> Result<()> {
        let request = match socks::handshake(&mut client).await {
            Ok(r) => r,
            Err(err) => {
                let _ = socks::reply_error(&mut client, SocksReplyCode::from(&err)).await;
                return Err(err);
            }
        };

        if request.is_onion() {
            return self.handle_onion_connection(&mut client, &request).await;
        }

        let pool = self.pool_for(&request.isolation_key).await;
        let circuit = match pool.get_circuit().await {
            Ok(c) => c,
            Err(err) => {
                let _ = socks::reply_error(&mut client, SocksReplyCode::from(&err)).await;
                return Err(err);
            }
        };

        let mut builder = protocol::StreamBuilder::new(Arc::clone(&circuit));
        let mut stream = match builder.connect(&request.host, request.port).await {
            Ok(s) => s,
            Err(err) => {
                let _ = socks::reply_error(&mut client, SocksReplyCode::from(&err)).await;
                pool.return_circuit(circuit).await;
                return Err(err);
            }
        };

        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        // The exit relay's bound address isn't meaningful to the client and
        // Tor doesn't expose it; report the conventional unspecified address.
        socks::reply_success(&mut client, "0.0.0.0:0".parse().unwrap()).await?;

        let result = tokio::io::copy_bidirectional(&mut client, &mut stream).await;
        pool.return_circuit(circuit).await;
        result.map(|_| ()).map_err(|e| TorError::Network(e.to_string()))
    }

    /// Connect to a `.onion` target via the rendezvous protocol (§4.9)
    /// instead of the regular circuit pool: the resulting circuit is
    /// single-use and built fresh for this stream, never shared.
    async fn handle_onion_connection(
        self: &Arc<Self>,
        client: &mut tokio::net::TcpStream,
        request: &socks::ConnectRequest,
    ) -> Result<()> {
        let address = match OnionAddress::parse(&request.host) {
            Ok(a) => a,
            Err(err) => {
                let _ = socks::reply_error(client, SocksReplyCode::from(&err)).await;
                return Err(err);
            }
        };

        let snapshot = self.consensus.load();
        let consensus = match snapshot.as_ref().as_ref() {
            Some(c) => c,
            None => {
                let err = TorError::Directory("no consensus loaded".into());
                let _ = socks::reply_error(client, SocksReplyCode::from(&err)).await;
                return Err(err);
            }
        };

        let onion_client =
            onion_client::OnionClient::new(consensus, self.config.handshake_timeout, self.config.circuit_build_timeout);
        let mut stream = match onion_client.connect(&address, request.port).await {
            Ok(s) => s,
            Err(err) => {
                let _ = socks::reply_error(client, SocksReplyCode::from(&err)).await;
                return Err(err);
            }
        };

        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        socks::reply_success(client, "0.0.0.0:0".parse().unwrap()).await?;

        let result = tokio::io::copy_bidirectional(client, &mut stream).await;
        result.map(|_| ()).map_err(|e| TorError::Network(e.to_string()))
    }

    /// The circuit pool for a stream's isolation credential (§5 stream
    /// isolation): streams with no credential share the prebuilt default
    /// pool, each distinct credential gets its own pool built on first use.
    async fn pool_for(self: &Arc<Self>, isolation_key: &Option<String>) -> Arc<CircuitPool> {
        let key = match isolation_key {
            None => return Arc::clone(&self.circuit_pool),
            Some(key) => key,
        };

        let mut pools = self.isolated_pools.lock().await;
        if let Some(pool) = pools.get(key) {
            return Arc::clone(pool);
        }
        let pool = CircuitPool::new(&self.config, Arc::clone(&self.consensus));
        pools.insert(key.clone(), Arc::clone(&pool));
        pool
    }
}

/// Load the last consensus this client persisted (§6), if any. Used as a
/// bootstrap fallback when every directory mirror is unreachable.
async fn load_cached_consensus(data_store: &DataStore) -> Option<Consensus> {
    let bytes = data_store.load_consensus().await?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_fails_fast_with_no_reachable_mirror() {
        let mut config = TorConfig::default();
        config.directory_mirrors = vec!["127.0.0.1:1".to_string()];
        config.data_directory = std::env::temp_dir().join(format!(
            "toronoe-lib-test-{}",
            std::process::id()
        ));
        let err = Orchestrator::bootstrap(config).await.unwrap_err();
        assert!(matches!(err, TorError::Directory(_) | TorError::Network(_)));
    }
}
