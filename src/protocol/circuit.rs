//! Circuit construction and the live multi-hop relay state (§4.2, §4.6).
//!
//! A `Circuit` owns one TLS connection to its guard relay and the onion
//! crypto for every hop extended onto it. Building a circuit means running
//! the link handshake once, then CREATE2 against the guard followed by one
//! EXTEND2 per additional hop; once all three hops are up a background task
//! takes over reading the link and demultiplexes RELAY cells by stream ID.

use super::certs::{CertificateVerifier, CertsCell};
use super::codec::{Cell, CellCommand, RelayCell, RelayCommand, VarCellCommand, MAX_CELL_PAYLOAD};
use super::crypto::{CircuitKeys, HopCrypto};
use super::flow_control::CircuitFlowControl;
use super::ntor::{self, NtorHandshake};
use super::relay::Relay;
use super::stream::StreamEvent;
use super::tls::{self, TorTlsStream};
use crate::error::{Result, TorError};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::timeout;
use x25519_dalek::PublicKey;

/// Link versions this client offers (§4.1); 4 and 5 are the only versions in
/// active use on the network.
const OUR_LINK_VERSIONS: [u16; 2] = [4, 5];

/// Any negotiated version below this indicates a downgrade attack rather
/// than a legitimately old relay.
const MINIMUM_SECURE_VERSION: u16 = 4;

/// RELAY_EARLY cells are capped per circuit to keep the circuit-extension
/// side channel from being abused for tagging attacks (§4.2).
pub const MAX_RELAY_EARLY: u8 = 8;

/// Build progress of a circuit, named by how many hops are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Idle,
    Hop1Open,
    Hop2Open,
    Hop3Open,
    Failed,
    Destroyed,
}

struct CircuitInner {
    relays: Vec<Relay>,
    state: CircuitState,
    crypto: Vec<HopCrypto>,
    streams: HashMap<u16, mpsc::Sender<StreamEvent>>,
    flow: CircuitFlowControl,
}

/// A built (or building) 3-hop circuit. Cheap to clone via `Arc`; every
/// method takes `&self` so the same handle can be shared across the streams
/// multiplexed onto it.
pub struct Circuit {
    id: u32,
    inner: StdMutex<CircuitInner>,
    writer: TokioMutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>,
    relay_early_sent: AtomicU8,
    created_at: u64,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("hop_count", &self.hop_count())
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl Circuit {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn hop_count(&self) -> usize {
        self.inner.lock().unwrap().crypto.len()
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.state(), CircuitState::Destroyed | CircuitState::Failed)
    }

    pub fn age_secs(&self) -> u64 {
        crate::time::unix_timestamp().saturating_sub(self.created_at)
    }

    /// Register a new stream ID, returning the receiver the stream reads
    /// demultiplexed events from.
    pub fn register_stream(&self, stream_id: u16) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().unwrap().streams.insert(stream_id, tx);
        rx
    }

    pub fn deregister_stream(&self, stream_id: u16) {
        self.inner.lock().unwrap().streams.remove(&stream_id);
    }

    /// Send an application-layer RELAY cell addressed through all hops.
    pub async fn send_relay_cell(&self, relay_cell: &RelayCell) -> Result<()> {
        self.send_relay_cell_as(relay_cell, CellCommand::Relay).await
    }

    async fn send_relay_early(&self, relay_cell: &RelayCell) -> Result<()> {
        let prior = self.relay_early_sent.fetch_add(1, Ordering::SeqCst);
        if prior >= MAX_RELAY_EARLY {
            self.relay_early_sent.fetch_sub(1, Ordering::SeqCst);
            return Err(TorError::ProtocolError(
                "RELAY_EARLY budget exhausted for this circuit".into(),
            ));
        }
        self.send_relay_cell_as(relay_cell, CellCommand::RelayEarly).await
    }

    /// Digest, encrypt, and send a relay cell. EXTEND2 (during circuit
    /// building) and every application command always address the last hop
    /// currently in the circuit: EXTEND2 because that is the hop being asked
    /// to extend the circuit, application cells because they are meant for
    /// the final hop in an already-built 3-hop circuit.
    async fn send_relay_cell_as(&self, relay_cell: &RelayCell, command: CellCommand) -> Result<()> {
        let mut payload = relay_cell.to_bytes()?;
        {
            let mut inner = self.inner.lock().unwrap();
            let last = inner
                .crypto
                .last_mut()
                .ok_or_else(|| TorError::InvalidState("circuit has no open hops".into()))?;
            let tag = last.next_forward_digest(&payload);
            payload[5..9].copy_from_slice(&tag);
            for hop in inner.crypto.iter_mut().rev() {
                hop.encrypt_forward(&mut payload);
            }
        }
        let cell = Cell::fixed(self.id, command, payload)?;
        self.write_cell(&cell).await
    }

    async fn write_cell(&self, cell: &Cell) -> Result<()> {
        let bytes = cell.to_bytes()?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        Ok(())
    }

    /// Extend the circuit by one hop via EXTEND2/EXTENDED2, reading the
    /// reply directly off `reader`. Used only during circuit building,
    /// before the background reader task takes ownership of the link.
    async fn extend_to<R>(&self, reader: &mut R, relay: &Relay) -> Result<()>
    where
        R: AsyncReadExt + Unpin,
    {
        let handshake = NtorHandshake::new()?;
        let (fingerprint, onion_key) = relay_ntor_identity(relay)?;
        let handshake_data =
            NtorHandshake::create_handshake_data(handshake.client_public_key(), &fingerprint, &onion_key);

        let mut extend2 = Vec::new();
        let link_specs = link_specifiers(relay)?;
        extend2.push(link_specs.len() as u8);
        for spec in &link_specs {
            extend2.extend_from_slice(spec);
        }
        extend2.extend_from_slice(&[0x00, 0x02]);
        extend2.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
        extend2.extend_from_slice(&handshake_data);

        let relay_cell = RelayCell::new(RelayCommand::Extend2, 0, extend2)?;
        self.send_relay_early(&relay_cell).await?;

        let (hop_idx, response) = self.read_and_peel_relay_cell(reader).await?;
        if response.command != RelayCommand::Extended2 {
            if response.command == RelayCommand::Truncated {
                return Err(TorError::CircuitBuildFailed(format!(
                    "hop {hop_idx} refused extension (TRUNCATED, reason {})",
                    response.data.first().copied().unwrap_or(0)
                )));
            }
            return Err(TorError::UnexpectedCell {
                expected: "EXTENDED2".into(),
                got: format!("{:?}", response.command),
            });
        }

        let (server_public, server_auth) = parse_handshake_reply(&response.data)?;
        let key_seed = handshake.complete(&fingerprint, &onion_key, &server_public, &server_auth)?;
        let keys = CircuitKeys::derive_from_key_seed(&key_seed)?;
        let hop = HopCrypto::new(&keys);

        let mut inner = self.inner.lock().unwrap();
        inner.relays.push(relay.clone());
        inner.crypto.push(hop);
        inner.state = match inner.crypto.len() {
            2 => CircuitState::Hop2Open,
            3 => CircuitState::Hop3Open,
            _ => inner.state,
        };
        Ok(())
    }

    async fn read_and_peel_relay_cell<R>(&self, reader: &mut R) -> Result<(usize, RelayCell)>
    where
        R: AsyncReadExt + Unpin,
    {
        let cell = read_cell(reader, Cell::CIRCID_SIZE).await?;
        match cell {
            Cell::Fixed { command, payload, .. } if command.is_relay() => {
                let mut inner = self.inner.lock().unwrap();
                peel_relay_cell(&mut inner.crypto, payload)
            }
            Cell::Fixed { command: CellCommand::Destroy, payload, .. } => {
                Err(TorError::circuit_destroyed(payload.first().copied().unwrap_or(0)))
            }
            other => Err(TorError::UnexpectedCell {
                expected: "RELAY".into(),
                got: format!("{other:?}"),
            }),
        }
    }

    fn mark_destroyed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Destroyed;
        // Dropping every stream sender closes the matching receivers, which
        // is how an open `TorStream` learns its circuit went away.
        inner.streams.clear();
    }

    async fn forward_to_stream(&self, stream_id: u16, event: StreamEvent) {
        let sender = {
            let inner = self.inner.lock().unwrap();
            inner.streams.get(&stream_id).cloned()
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(event).await;
            }
            None => tracing::debug!(circuit = self.id, stream_id, "cell for unknown stream"),
        }
    }

    async fn send_circuit_sendme(&self) {
        let Ok(cell) = RelayCell::new(RelayCommand::Sendme, 0, Vec::new()) else {
            return;
        };
        if let Err(err) = self.send_relay_cell(&cell).await {
            tracing::warn!(circuit = self.id, %err, "failed to send circuit-level SENDME");
        }
    }

    async fn dispatch(&self, relay_cell: RelayCell) {
        match relay_cell.command {
            RelayCommand::Connected => {
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::Connected).await
            }
            RelayCommand::Data => {
                let should_sendme = {
                    let mut inner = self.inner.lock().unwrap();
                    inner.flow.on_receive()
                };
                if should_sendme {
                    self.send_circuit_sendme().await;
                }
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::Data(relay_cell.data))
                    .await;
            }
            RelayCommand::End => {
                let reason = relay_cell.data.first().copied().unwrap_or(0);
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::End(reason)).await;
            }
            RelayCommand::Sendme => {
                if relay_cell.stream_id == 0 {
                    let mut inner = self.inner.lock().unwrap();
                    inner.flow.on_sendme_received();
                } else {
                    self.forward_to_stream(relay_cell.stream_id, StreamEvent::Sendme).await;
                }
            }
            RelayCommand::Truncated => {
                tracing::warn!(circuit = self.id, "circuit truncated upstream of us");
                self.mark_destroyed();
            }
            RelayCommand::RendezvousEstablished => {
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::RendezvousEstablished).await
            }
            RelayCommand::IntroEstablished => {
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::IntroEstablished).await
            }
            RelayCommand::IntroduceAck => {
                let accepted = relay_cell.data.first().copied().unwrap_or(1) == 0;
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::IntroduceAck(accepted)).await;
            }
            RelayCommand::Rendezvous2 => {
                self.forward_to_stream(relay_cell.stream_id, StreamEvent::Rendezvous2(relay_cell.data)).await
            }
            other => tracing::debug!(circuit = self.id, command = ?other, "unhandled relay command"),
        }
    }

    /// Apply the hs-ntor key seed from RENDEZVOUS2 as a fourth crypto hop
    /// (§4.9 step 6). There is no wire-level EXTEND2 for this hop: the
    /// rendezvous point has already spliced this circuit to the service's,
    /// so the only thing missing is the onion-encryption layer between
    /// client and service.
    pub fn extend_virtual_hop(&self, key_seed: &[u8; 32]) -> Result<()> {
        let keys = CircuitKeys::derive_from_key_seed(key_seed)?;
        let hop = HopCrypto::new(&keys);
        let mut inner = self.inner.lock().unwrap();
        if inner.crypto.len() != 3 {
            return Err(TorError::InvalidState(
                "virtual rendezvous hop can only be added to a completed 3-hop circuit".into(),
            ));
        }
        inner.crypto.push(hop);
        Ok(())
    }

    /// Owns the link from here on: reads cells until the connection closes
    /// or the relay sends DESTROY, dispatching RELAY cells to their stream.
    async fn run_reader_loop(self: Arc<Self>, mut reader: ReadHalf<TorTlsStream>) {
        loop {
            let cell = match read_cell(&mut reader, Cell::CIRCID_SIZE).await {
                Ok(cell) => cell,
                Err(err) => {
                    tracing::info!(circuit = self.id, %err, "circuit link closed");
                    self.mark_destroyed();
                    return;
                }
            };
            match cell {
                Cell::Fixed { command: CellCommand::Destroy, payload, .. } => {
                    let reason = payload.first().copied().unwrap_or(0);
                    tracing::info!(circuit = self.id, reason, "circuit destroyed by relay");
                    self.mark_destroyed();
                    return;
                }
                Cell::Fixed { command, payload, .. } if command.is_relay() => {
                    let peeled = {
                        let mut inner = self.inner.lock().unwrap();
                        peel_relay_cell(&mut inner.crypto, payload)
                    };
                    match peeled {
                        Ok((_, relay_cell)) => self.dispatch(relay_cell).await,
                        Err(err) => {
                            // A cell that fails to verify against every hop's
                            // running digest means either corruption or a
                            // tagging attack; either way this circuit's
                            // integrity can no longer be trusted and it must
                            // not be used for another cell.
                            tracing::error!(circuit = self.id, %err, "relay cell digest verification failed, destroying circuit");
                            self.mark_destroyed();
                            return;
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Peel a RELAY cell's onion layers hop-by-hop in forward order (guard
/// first), trying each hop's backward digest until one commits. The
/// `recognized` field is a cheap pre-filter: a hop this cell isn't meant for
/// will almost never decrypt to an all-zero recognized field, so most wrong
/// hops are rejected before the digest is even computed.
fn peel_relay_cell(crypto: &mut [HopCrypto], mut payload: Vec<u8>) -> Result<(usize, RelayCell)> {
    for (idx, hop) in crypto.iter_mut().enumerate() {
        hop.decrypt_backward(&mut payload);
        if payload.len() > 2 && payload[1] == 0 && payload[2] == 0 {
            let mut trial = payload.clone();
            let claimed = [trial[5], trial[6], trial[7], trial[8]];
            trial[5..9].fill(0);
            if hop.try_backward_digest(&trial, &claimed) {
                let relay_cell = RelayCell::from_bytes(&payload)?;
                return Ok((idx, relay_cell));
            }
        }
    }
    Err(TorError::DigestMismatch)
}

/// Builds circuits: connect, link handshake, CREATE2 against the guard, then
/// EXTEND2 for each remaining hop.
pub struct CircuitBuilder {
    handshake_timeout: std::time::Duration,
}

impl CircuitBuilder {
    pub fn new(handshake_timeout: std::time::Duration) -> Self {
        Self { handshake_timeout }
    }

    pub async fn build(&self, path: [&Relay; 3], build_timeout: std::time::Duration) -> Result<Arc<Circuit>> {
        match timeout(build_timeout, self.build_inner(path)).await {
            Ok(result) => result,
            Err(_) => Err(TorError::CircuitBuildFailed("circuit build timed out".into())),
        }
    }

    async fn build_inner(&self, path: [&Relay; 3]) -> Result<Arc<Circuit>> {
        let guard = path[0];
        let tls_stream = timeout(self.handshake_timeout, tls::connect(guard.socket_addr()))
            .await
            .map_err(|_| TorError::HandshakeTimeout("TLS connect".into()))??;
        let (mut reader, mut writer) = tokio::io::split(tls_stream);

        link_handshake(&mut reader, &mut writer, guard).await?;

        let mut circuit_id_bytes = [0u8; 4];
        OsRng.fill_bytes(&mut circuit_id_bytes);
        // Tor requires the client-chosen circuit ID to have its high bit set
        // once both ends negotiated link protocol 4+.
        let circuit_id = u32::from_be_bytes(circuit_id_bytes) | 0x8000_0000;

        let keys = timeout(
            self.handshake_timeout,
            guard_handshake(&mut reader, &mut writer, circuit_id, guard),
        )
        .await
        .map_err(|_| TorError::HandshakeTimeout("CREATE2/CREATED2".into()))??;
        let hop = HopCrypto::new(&keys);

        let circuit = Circuit {
            id: circuit_id,
            inner: StdMutex::new(CircuitInner {
                relays: vec![guard.clone()],
                state: CircuitState::Hop1Open,
                crypto: vec![hop],
                streams: HashMap::new(),
                flow: CircuitFlowControl::new(),
            }),
            writer: TokioMutex::new(Box::new(writer)),
            relay_early_sent: AtomicU8::new(0),
            created_at: crate::time::unix_timestamp(),
        };

        circuit.extend_to(&mut reader, path[1]).await?;
        circuit.extend_to(&mut reader, path[2]).await?;

        let circuit = Arc::new(circuit);
        tokio::spawn(Arc::clone(&circuit).run_reader_loop(reader));
        Ok(circuit)
    }
}

async fn write_all_flush<W: AsyncWriteExt + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .await
        .map_err(|e| TorError::Network(e.to_string()))?;
    writer.flush().await.map_err(|e| TorError::Network(e.to_string()))?;
    Ok(())
}

async fn read_cell<R: AsyncReadExt + Unpin>(reader: &mut R, circid_width: usize) -> Result<Cell> {
    let mut header = vec![0u8; circid_width + 1];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| TorError::Network(e.to_string()))?;
    let circuit_id = if circid_width == 2 {
        u16::from_be_bytes([header[0], header[1]]) as u32
    } else {
        u32::from_be_bytes([header[0], header[1], header[2], header[3]])
    };
    let command_byte = header[circid_width];

    if let Some(command) = CellCommand::from_u8(command_byte) {
        let mut payload = vec![0u8; Cell::FIXED_PAYLOAD_SIZE];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        return Cell::fixed(circuit_id, command, payload);
    }
    if let Some(command) = VarCellCommand::from_u8(command_byte) {
        let mut len_buf = [0u8; 2];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        let length = u16::from_be_bytes(len_buf) as usize;
        if length > MAX_CELL_PAYLOAD {
            return Err(TorError::MalformedCell(format!(
                "variable cell length {length} exceeds policy cap"
            )));
        }
        let mut payload = vec![0u8; length];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        return Cell::variable(circuit_id, command, payload);
    }
    Err(TorError::MalformedCell(format!("unknown cell command {command_byte}")))
}

fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(TorError::MalformedCell("VERSIONS payload has odd length".into()));
    }
    Ok(payload.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
}

fn negotiate_version(ours: &[u16], theirs: &[u16]) -> Result<u16> {
    let highest_common = ours.iter().filter(|v| theirs.contains(v)).copied().max();
    match highest_common {
        Some(v) if v >= MINIMUM_SECURE_VERSION => Ok(v),
        Some(v) => Err(TorError::ProtocolError(format!(
            "negotiated link version {v} is below the minimum secure version"
        ))),
        None => Err(TorError::NoCommonVersion),
    }
}

/// VERSIONS / CERTS / AUTH_CHALLENGE / NETINFO (§4.1). No client
/// authentication is attempted; we never send AUTHENTICATE.
async fn link_handshake<R, W>(reader: &mut R, writer: &mut W, guard: &Relay) -> Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut versions_payload = Vec::new();
    for v in OUR_LINK_VERSIONS {
        versions_payload.extend_from_slice(&v.to_be_bytes());
    }
    let versions_cell = Cell::variable(0, VarCellCommand::Versions, versions_payload)?;
    write_all_flush(writer, &versions_cell.to_bytes_with_circid_width(Cell::LEGACY_CIRCID_SIZE)?).await?;

    let relay_versions = match read_cell(reader, Cell::LEGACY_CIRCID_SIZE).await? {
        Cell::Variable { command: VarCellCommand::Versions, payload, .. } => parse_versions(&payload)?,
        other => {
            return Err(TorError::UnexpectedCell {
                expected: "VERSIONS".into(),
                got: format!("{other:?}"),
            })
        }
    };
    negotiate_version(&OUR_LINK_VERSIONS, &relay_versions)?;

    let verifier = CertificateVerifier::new();
    let expected_fingerprint = guard.fingerprint_bytes().ok();

    let mut saw_auth_challenge = false;
    loop {
        match read_cell(reader, Cell::CIRCID_SIZE).await? {
            Cell::Variable { command: VarCellCommand::Certs, payload, .. } => match CertsCell::parse(&payload) {
                Ok(parsed) => {
                    let verdict = match &expected_fingerprint {
                        Some(fp) => verifier.verify_relay_certs(&parsed, fp).map(|_| ()),
                        None => verifier.quick_verify(&parsed),
                    };
                    // certs.rs owns the real security check; a failure here
                    // means the far end is not who we dialed, so the
                    // handshake must not proceed to CREATE2 on this link.
                    if let Err(err) = verdict {
                        return Err(TorError::CertificateError(format!(
                            "relay {} failed certificate verification: {err}",
                            guard.nickname
                        )));
                    }
                }
                Err(err) => {
                    return Err(TorError::CertificateError(format!(
                        "relay {} sent an unparseable CERTS cell: {err}",
                        guard.nickname
                    )))
                }
            },
            Cell::Variable { command: VarCellCommand::AuthChallenge, .. } => {
                saw_auth_challenge = true;
                break;
            }
            Cell::Fixed { command: CellCommand::Netinfo, .. } => break,
            _ => {}
        }
    }

    if saw_auth_challenge {
        match read_cell(reader, Cell::CIRCID_SIZE).await? {
            Cell::Fixed { command: CellCommand::Netinfo, .. } => {}
            other => {
                return Err(TorError::UnexpectedCell {
                    expected: "NETINFO".into(),
                    got: format!("{other:?}"),
                })
            }
        }
    }

    let mut netinfo_payload = Vec::with_capacity(4 + 6 + 1 + 6);
    netinfo_payload.extend_from_slice(&(crate::time::unix_timestamp() as u32).to_be_bytes());
    netinfo_payload.push(0x04);
    netinfo_payload.push(4);
    netinfo_payload.extend_from_slice(&[127, 0, 0, 1]);
    netinfo_payload.push(1);
    netinfo_payload.push(0x04);
    netinfo_payload.push(4);
    netinfo_payload.extend_from_slice(&[127, 0, 0, 1]);
    let netinfo_cell = Cell::fixed(0, CellCommand::Netinfo, netinfo_payload)?;
    write_all_flush(writer, &netinfo_cell.to_bytes()?).await?;

    Ok(())
}

fn relay_ntor_identity(relay: &Relay) -> Result<([u8; 20], PublicKey)> {
    let fingerprint = relay
        .fingerprint_bytes()
        .map_err(|e| TorError::CircuitBuildFailed(e.to_string()))?;

    let ntor_b64 = relay.ntor_onion_key.as_deref().ok_or_else(|| {
        TorError::CircuitBuildFailed(format!("relay {} has no known ntor onion key", relay.nickname))
    })?;
    let ntor_bytes = base64::engine::general_purpose::STANDARD
        .decode(ntor_b64)
        .map_err(|e| TorError::CircuitBuildFailed(format!("invalid ntor onion key encoding: {e}")))?;
    if ntor_bytes.len() != 32 {
        return Err(TorError::CircuitBuildFailed("ntor onion key must be 32 bytes".into()));
    }
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&ntor_bytes);
    Ok((fingerprint, PublicKey::from(key_bytes)))
}

/// IPv4 and legacy-RSA-identity link specifiers (§4.6 EXTEND2 payload); the
/// two kinds every relay's consensus entry is guaranteed to support.
fn link_specifiers(relay: &Relay) -> Result<Vec<Vec<u8>>> {
    let mut specs = Vec::new();
    if let std::net::IpAddr::V4(v4) = relay.address {
        let mut spec = vec![0x00u8, 6];
        spec.extend_from_slice(&v4.octets());
        spec.extend_from_slice(&relay.or_port.to_be_bytes());
        specs.push(spec);
    }
    let fp_bytes = hex::decode(&relay.fingerprint)
        .map_err(|e| TorError::CircuitBuildFailed(format!("invalid relay fingerprint: {e}")))?;
    if fp_bytes.len() == 20 {
        let mut spec = vec![0x02u8, 20];
        spec.extend_from_slice(&fp_bytes);
        specs.push(spec);
    }
    if specs.is_empty() {
        return Err(TorError::CircuitBuildFailed(format!(
            "relay {} has no usable link specifier",
            relay.nickname
        )));
    }
    Ok(specs)
}

/// CREATE2 against the guard relay, returning the derived per-hop keys.
async fn guard_handshake<R, W>(reader: &mut R, writer: &mut W, circuit_id: u32, guard: &Relay) -> Result<CircuitKeys>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let handshake = NtorHandshake::new()?;
    let (fingerprint, onion_key) = relay_ntor_identity(guard)?;
    let handshake_data = NtorHandshake::create_handshake_data(handshake.client_public_key(), &fingerprint, &onion_key);

    let mut payload = Vec::with_capacity(4 + handshake_data.len());
    payload.extend_from_slice(&[0x00, 0x02]);
    payload.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
    payload.extend_from_slice(&handshake_data);

    let cell = Cell::fixed(circuit_id, CellCommand::Create2, payload)?;
    write_all_flush(writer, &cell.to_bytes()?).await?;

    let (server_public, server_auth) = match read_cell(reader, Cell::CIRCID_SIZE).await? {
        Cell::Fixed { command: CellCommand::Created2, payload, .. } => parse_handshake_reply(&payload)?,
        Cell::Fixed { command: CellCommand::Destroy, payload, .. } => {
            return Err(TorError::circuit_destroyed(payload.first().copied().unwrap_or(0)))
        }
        other => {
            return Err(TorError::UnexpectedCell {
                expected: "CREATED2".into(),
                got: format!("{other:?}"),
            })
        }
    };

    let key_seed = handshake.complete(&fingerprint, &onion_key, &server_public, &server_auth)?;
    CircuitKeys::derive_from_key_seed(&key_seed)
}

fn parse_handshake_reply(payload: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if payload.len() < 2 {
        return Err(TorError::MalformedCell("handshake reply payload too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < 64 || payload.len() < 2 + hlen {
        return Err(TorError::MalformedCell(format!(
            "handshake reply HLEN {hlen} inconsistent with payload of {} bytes",
            payload.len()
        )));
    }
    ntor::parse_created2_payload(&payload[2..2 + hlen])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayFlags;
    use aes::Aes128;
    use ctr::cipher::{KeyIvInit, StreamCipher};
    use ctr::Ctr128BE;
    use sha1::{Digest, Sha1};
    use tokio::io::AsyncWrite;

    #[test]
    fn negotiate_version_picks_highest_common() {
        assert_eq!(negotiate_version(&[4, 5], &[3, 4, 5, 6]).unwrap(), 5);
    }

    #[test]
    fn negotiate_version_rejects_downgrade() {
        let err = negotiate_version(&[4, 5], &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, TorError::ProtocolError(_)));
    }

    #[test]
    fn negotiate_version_rejects_no_common_version() {
        let err = negotiate_version(&[4, 5], &[6, 7]).unwrap_err();
        assert!(matches!(err, TorError::NoCommonVersion));
    }

    #[test]
    fn parse_versions_rejects_odd_length_payload() {
        assert!(parse_versions(&[0, 4, 0]).is_err());
    }

    fn sample_relay(fingerprint: &str) -> Relay {
        Relay {
            nickname: "TestRelay".into(),
            fingerprint: fingerprint.into(),
            address: "198.51.100.7".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags::default(),
            bandwidth: 1000,
            published: 0,
            ntor_onion_key: None,
            family: Vec::new(),
            exit_policy_summary: None,
        }
    }

    #[test]
    fn link_specifiers_cover_ipv4_and_legacy_identity() {
        let relay = sample_relay("0102030405060708090A0B0C0D0E0F1011121314");
        let specs = link_specifiers(&relay).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0][0], 0x00);
        assert_eq!(specs[0][1], 6);
        assert_eq!(specs[1][0], 0x02);
        assert_eq!(specs[1][1], 20);
    }

    #[test]
    fn link_specifiers_rejects_malformed_fingerprint() {
        let relay = sample_relay("not-hex");
        assert!(link_specifiers(&relay).is_err());
    }

    /// The core fix this module exists for: a RELAY cell meant for an
    /// interior hop must be identified by trying each hop's backward digest
    /// in turn, not assumed to always belong to the last hop.
    #[test]
    fn peel_relay_cell_identifies_the_originating_interior_hop() {
        let seeds: [[u8; 32]; 3] = [[1; 32], [2; 32], [3; 32]];
        let keys: Vec<CircuitKeys> = seeds
            .iter()
            .map(|s| CircuitKeys::derive_from_key_seed(s).unwrap())
            .collect();
        let mut crypto: Vec<HopCrypto> = keys.iter().map(HopCrypto::new).collect();

        let relay_cell = RelayCell::new(RelayCommand::Sendme, 0, Vec::new()).unwrap();
        let mut payload = relay_cell.to_bytes().unwrap();

        // Hop 1 (the middle relay) is the one "sending" this cell back: tag
        // it with hop 1's Db, matching what `HopCrypto::try_backward_digest`
        // will independently derive from the same CircuitKeys.
        let mut hop1_digest = Sha1::new();
        hop1_digest.update(keys[1].backward_digest_seed);
        hop1_digest.update(&payload);
        let tag = hop1_digest.finalize();
        payload[5..9].copy_from_slice(&tag[0..4]);

        // On the wire, hop 1 encrypts for the return trip first and hop 0
        // layers its own encryption on top, since the guard is the last to
        // touch the cell before it reaches the client.
        let mut hop1_backward = Ctr128BE::<Aes128>::new(&keys[1].backward_key.into(), &[0u8; 16].into());
        hop1_backward.apply_keystream(&mut payload);
        let mut hop0_backward = Ctr128BE::<Aes128>::new(&keys[0].backward_key.into(), &[0u8; 16].into());
        hop0_backward.apply_keystream(&mut payload);

        let (hop_idx, recovered) = peel_relay_cell(&mut crypto, payload).unwrap();
        assert_eq!(hop_idx, 1);
        assert_eq!(recovered.command, RelayCommand::Sendme);
    }

    #[test]
    fn peel_relay_cell_rejects_a_cell_no_hop_tagged() {
        let keys = CircuitKeys::derive_from_key_seed(&[9u8; 32]).unwrap();
        let mut crypto = vec![HopCrypto::new(&keys)];
        let mut garbage = vec![0u8; Cell::FIXED_PAYLOAD_SIZE];
        garbage[5..9].copy_from_slice(&[1, 2, 3, 4]);
        let err = peel_relay_cell(&mut crypto, garbage).unwrap_err();
        assert!(matches!(err, TorError::DigestMismatch));
    }

    fn test_circuit(hop_count: usize) -> (Circuit, tokio::io::DuplexStream) {
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let crypto: Vec<HopCrypto> = (0..hop_count)
            .map(|i| {
                let seed = [i as u8 + 1; 32];
                HopCrypto::new(&CircuitKeys::derive_from_key_seed(&seed).unwrap())
            })
            .collect();
        let circuit = Circuit {
            id: 1,
            inner: StdMutex::new(CircuitInner {
                relays: Vec::new(),
                state: CircuitState::Hop1Open,
                crypto,
                streams: HashMap::new(),
                flow: CircuitFlowControl::new(),
            }),
            writer: TokioMutex::new(Box::new(server_end) as Box<dyn AsyncWrite + Send + Unpin>),
            relay_early_sent: AtomicU8::new(0),
            created_at: 0,
        };
        (circuit, client_end)
    }

    #[tokio::test]
    async fn relay_early_budget_is_enforced() {
        let (circuit, _client_end) = test_circuit(1);
        for _ in 0..MAX_RELAY_EARLY {
            let cell = RelayCell::new(RelayCommand::Extend2, 0, Vec::new()).unwrap();
            circuit.send_relay_early(&cell).await.unwrap();
        }
        let cell = RelayCell::new(RelayCommand::Extend2, 0, Vec::new()).unwrap();
        let err = circuit.send_relay_early(&cell).await.unwrap_err();
        assert!(matches!(err, TorError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn send_relay_cell_on_empty_circuit_is_invalid_state() {
        let (circuit, _client_end) = test_circuit(0);
        let cell = RelayCell::new(RelayCommand::Data, 1, vec![1, 2, 3]).unwrap();
        let err = circuit.send_relay_cell(&cell).await.unwrap_err();
        assert!(matches!(err, TorError::InvalidState(_)));
    }

    #[tokio::test]
    async fn mark_destroyed_closes_registered_stream_channels() {
        let (circuit, _client_end) = test_circuit(1);
        let mut events = circuit.register_stream(7);
        circuit.mark_destroyed();
        assert_eq!(circuit.state(), CircuitState::Destroyed);
        assert!(events.recv().await.is_none());
    }
}
