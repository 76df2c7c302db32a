//! v3 onion-service connection flow (§4.9): HSDir lookup, descriptor fetch,
//! introduction, and rendezvous, producing an application [`TorStream`] the
//! same way a normal exit circuit would.
//!
//! Three separate circuits are involved and none of them are reused for
//! application data except the rendezvous circuit, which becomes the
//! returned stream's circuit once its virtual fourth hop is up:
//! one to an HSDir (descriptor fetch), one to the rendezvous point
//! (ESTABLISH_RENDEZVOUS / RENDEZVOUS2), and one to the introduction point
//! (INTRODUCE1 / INTRODUCE_ACK).

use crate::error::{Result, TorError};
use crate::onion::{
    blinded_public_key, descriptor_id, select_hsdirs, time_period, HsNtorClient, IntroPoint, OnionAddress,
    OnionDescriptor, RendezvousCookie,
};
use crate::protocol::{
    select_middle, select_path_to, BandwidthWeights, Circuit, CircuitBuilder, Consensus, PathConstraints, Relay,
    RelayCell, RelayCommand, StreamEvent, StreamManager, TorStream,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use x25519_dalek::PublicKey;

/// Runs one onion-service reachability attempt against a consensus snapshot.
/// Kept separate from `Orchestrator` so the flow only depends on what it
/// actually needs, not the whole client.
pub struct OnionClient<'a> {
    consensus: &'a Consensus,
    handshake_timeout: Duration,
    circuit_build_timeout: Duration,
}

impl<'a> OnionClient<'a> {
    pub fn new(consensus: &'a Consensus, handshake_timeout: Duration, circuit_build_timeout: Duration) -> Self {
        Self { consensus, handshake_timeout, circuit_build_timeout }
    }

    /// Run the full reachability flow and return an open stream to `port`
    /// on the service behind `address` (§4.9 steps 1-7).
    pub async fn connect(&self, address: &OnionAddress, port: u16) -> Result<TorStream> {
        let running: Vec<Relay> = self.consensus.running_relays().into_iter().cloned().collect();
        let weights: BandwidthWeights = self.consensus.weights.into();

        let period = time_period(crate::time::unix_timestamp());
        let blinded = blinded_public_key(&address.public_key, period);
        let desc_id = descriptor_id(&blinded, period);

        let hsdirs = select_hsdirs(&running, &desc_id);
        let hsdir = hsdirs
            .first()
            .copied()
            .ok_or_else(|| TorError::NoSuitableRelay("no HSDir available for this onion address".into()))?;

        let descriptor = self.fetch_descriptor(&running, &weights, hsdir, address).await?;
        let intro_point = descriptor
            .pick_introduction_point()
            .ok_or_else(|| TorError::DescriptorRejected("descriptor lists no introduction points".into()))?;
        let intro_relay = running
            .iter()
            .find(|r| r.fingerprint == intro_point.link_fingerprint)
            .ok_or_else(|| TorError::NoSuitableRelay("introduction point not present in current consensus".into()))?;

        let rendezvous_relay = select_middle(&running, &weights, &PathConstraints::new())?;
        let rendezvous_circuit = self.build_circuit_to(&running, &weights, rendezvous_relay).await?;
        let mut rendezvous_events = rendezvous_circuit.register_stream(0);

        let cookie = RendezvousCookie::random();
        let establish = RelayCell::new(RelayCommand::EstablishRendezvous, 0, cookie.0.to_vec())?;
        rendezvous_circuit.send_relay_cell(&establish).await?;
        match rendezvous_events.recv().await {
            Some(StreamEvent::RendezvousEstablished) => {}
            Some(_) => return Err(TorError::ProtocolError("unexpected cell awaiting RENDEZVOUS_ESTABLISHED".into())),
            None => return Err(TorError::ProtocolError("circuit closed before RENDEZVOUS_ESTABLISHED".into())),
        }
        tracing::debug!(onion = %address.encode(), "rendezvous point established");

        let hs_client = HsNtorClient::new()?;
        let ip_enc_key = PublicKey::from(intro_point.enc_key);
        let rp_identity = rendezvous_relay.fingerprint_bytes()?;
        let encrypted_data = hs_client.build_encrypted_data(&ip_enc_key, &rp_identity, &cookie)?;

        let intro_circuit = self.build_circuit_to(&running, &weights, intro_relay).await?;
        self.send_introduce1(&intro_circuit, intro_point, encrypted_data).await?;
        tracing::debug!(onion = %address.encode(), "introduction accepted");

        let (service_public, service_auth) = match rendezvous_events.recv().await {
            Some(StreamEvent::Rendezvous2(data)) => parse_rendezvous2(&data)?,
            Some(_) => return Err(TorError::ProtocolError("unexpected cell awaiting RENDEZVOUS2".into())),
            None => return Err(TorError::ProtocolError("circuit closed before RENDEZVOUS2".into())),
        };
        let key_seed = hs_client.complete(&service_public, &service_auth)?;
        rendezvous_circuit.extend_virtual_hop(&key_seed)?;
        tracing::debug!(onion = %address.encode(), "rendezvous handshake complete");

        let mut manager = StreamManager::new(rendezvous_circuit);
        manager.open_service_stream(port).await
    }

    async fn build_circuit_to(&self, running: &[Relay], weights: &BandwidthWeights, target: &Relay) -> Result<Arc<Circuit>> {
        let path = select_path_to(running, weights, target)?;
        let builder = CircuitBuilder::new(self.handshake_timeout);
        builder.build(path, self.circuit_build_timeout).await
    }

    async fn fetch_descriptor(
        &self,
        running: &[Relay],
        weights: &BandwidthWeights,
        hsdir: &Relay,
        address: &OnionAddress,
    ) -> Result<OnionDescriptor> {
        let circuit = self.build_circuit_to(running, weights, hsdir).await?;
        let mut manager = StreamManager::new(circuit);
        let mut stream = manager.open_dir_stream().await?;

        let request = format!(
            "GET /tor/hs/3/{} HTTP/1.0\r\nHost: {}\r\n\r\n",
            address.encode(),
            hsdir.nickname
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;
        stream.flush().await.map_err(|e| TorError::Network(e.to_string()))?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .await
            .map_err(|e| TorError::Network(e.to_string()))?;

        let body = crate::protocol::parse_http_response(&response)?;
        let text = String::from_utf8(body).map_err(|e| TorError::Directory(format!("invalid UTF-8 descriptor: {e}")))?;
        let descriptor = OnionDescriptor::parse(&text)?;
        descriptor.validate(&address.public_key, None)?;
        Ok(descriptor)
    }

    async fn send_introduce1(&self, circuit: &Arc<Circuit>, intro_point: &IntroPoint, encrypted_data: Vec<u8>) -> Result<()> {
        let mut events = circuit.register_stream(0);
        let intro = crate::onion::Introduce1 {
            legacy_key_id: [0u8; 20],
            auth_key_type: 2,
            auth_key: intro_point.auth_key,
            encrypted_data,
        };
        let cell = RelayCell::new(RelayCommand::Introduce1, 0, intro.to_bytes())?;
        circuit.send_relay_cell(&cell).await?;
        match events.recv().await {
            Some(StreamEvent::IntroduceAck(true)) => Ok(()),
            Some(StreamEvent::IntroduceAck(false)) => {
                Err(TorError::ProtocolError("introduction point rejected INTRODUCE1".into()))
            }
            Some(_) => Err(TorError::ProtocolError("unexpected cell awaiting INTRODUCE_ACK".into())),
            None => Err(TorError::ProtocolError("circuit closed before INTRODUCE_ACK".into())),
        }
    }
}

/// RENDEZVOUS2 payload (§4.9 step 6): `SERVER_PK (32) || AUTH (32)`.
fn parse_rendezvous2(data: &[u8]) -> Result<(PublicKey, [u8; 32])> {
    if data.len() < 64 {
        return Err(TorError::MalformedCell("RENDEZVOUS2 payload too short".into()));
    }
    let mut server_public = [0u8; 32];
    server_public.copy_from_slice(&data[..32]);
    let mut auth = [0u8; 32];
    auth.copy_from_slice(&data[32..64]);
    Ok((PublicKey::from(server_public), auth))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rendezvous2_rejects_short_payload() {
        let err = parse_rendezvous2(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, TorError::MalformedCell(_)));
    }

    #[test]
    fn parse_rendezvous2_splits_key_and_auth() {
        let mut payload = vec![1u8; 32];
        payload.extend(vec![2u8; 32]);
        let (pk, auth) = parse_rendezvous2(&payload).unwrap();
        assert_eq!(pk.as_bytes(), &[1u8; 32]);
        assert_eq!(auth, [2u8; 32]);
    }
}
