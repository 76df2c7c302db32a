//! Stream multiplexing over a built circuit (§4.4).
//!
//! A circuit's reader task demuxes incoming RELAY cells by stream ID into
//! one `mpsc` channel per open stream; `TorStream` only ever sees cells
//! belonging to it. Sends go back through the circuit's own locked sender,
//! so hop crypto and the running digest stay under one writer regardless of
//! how many streams share the circuit.

use super::{Circuit, RelayCell, RelayCommand};
use crate::protocol::flow_control::StreamFlowControl;
use crate::error::{Result, TorError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// One demultiplexed event destined for a particular stream.
///
/// The rendezvous variants never arrive on an application stream; they are
/// addressed to stream ID 0, which `StreamManager::allocate_stream_id` never
/// hands out, making it available as the circuit's onion-service control
/// channel.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Connected,
    Data(Vec<u8>),
    End(u8),
    Sendme,
    RendezvousEstablished,
    IntroEstablished,
    IntroduceAck(bool),
    Rendezvous2(Vec<u8>),
}

type SendFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Opens streams over a circuit and allocates their stream IDs.
pub struct StreamManager {
    circuit: Arc<Circuit>,
    next_stream_id: u16,
}

impl StreamManager {
    pub fn new(circuit: Arc<Circuit>) -> Self {
        Self {
            circuit,
            next_stream_id: 1,
        }
    }

    fn allocate_stream_id(&mut self) -> u16 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1);
        if self.next_stream_id == 0 {
            self.next_stream_id = 1;
        }
        id
    }

    /// Open a stream with a RELAY_BEGIN handshake (§4.4): `host:port\0`,
    /// no flags.
    pub async fn open_stream(&mut self, host: &str, port: u16) -> Result<TorStream> {
        let stream_id = self.allocate_stream_id();
        let span = tracing::info_span!("stream", id = stream_id, circuit = self.circuit.id());
        let _enter = span.enter();

        let mut events = self.circuit.register_stream(stream_id);

        let target = format!("{host}:{port}\0");
        let begin = RelayCell::new(RelayCommand::Begin, stream_id, target.into_bytes())?;
        self.circuit.send_relay_cell(&begin).await?;
        tracing::debug!("sent RELAY_BEGIN");

        match events.recv().await {
            Some(StreamEvent::Connected) => {
                tracing::debug!("stream opened");
                Ok(self.stream_from(stream_id, events))
            }
            Some(StreamEvent::End(reason)) => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream(format!(
                    "stream connection refused (reason {reason})"
                )))
            }
            None => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream("circuit closed before RELAY_CONNECTED".into()))
            }
            Some(_) => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream("unexpected cell before RELAY_CONNECTED".into()))
            }
        }
    }

    /// Open a directory-fetch stream (RELAY_BEGIN_DIR): used to pull an
    /// onion-service descriptor straight off an HSDir circuit, where the
    /// final hop already is the destination and no address is needed.
    pub async fn open_dir_stream(&mut self) -> Result<TorStream> {
        let stream_id = self.allocate_stream_id();
        let mut events = self.circuit.register_stream(stream_id);

        let begin = RelayCell::new(RelayCommand::BeginDir, stream_id, Vec::new())?;
        self.circuit.send_relay_cell(&begin).await?;

        match events.recv().await {
            Some(StreamEvent::Connected) => Ok(self.stream_from(stream_id, events)),
            Some(StreamEvent::End(reason)) => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream(format!("directory stream refused (reason {reason})")))
            }
            _ => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream("circuit closed before RELAY_CONNECTED".into()))
            }
        }
    }

    /// Open the application stream on a rendezvous circuit once its virtual
    /// fourth hop is up (§4.9 step 7). No address is sent: the circuit
    /// already terminates at the service, only the port needs naming.
    pub async fn open_service_stream(&mut self, port: u16) -> Result<TorStream> {
        let stream_id = self.allocate_stream_id();
        let mut events = self.circuit.register_stream(stream_id);

        let target = format!(":{port}\0");
        let begin = RelayCell::new(RelayCommand::Begin, stream_id, target.into_bytes())?;
        self.circuit.send_relay_cell(&begin).await?;

        match events.recv().await {
            Some(StreamEvent::Connected) => Ok(self.stream_from(stream_id, events)),
            Some(StreamEvent::End(reason)) => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream(format!("service refused stream (reason {reason})")))
            }
            _ => {
                self.circuit.deregister_stream(stream_id);
                Err(TorError::Stream("circuit closed before RELAY_CONNECTED".into()))
            }
        }
    }

    fn stream_from(&self, stream_id: u16, events: mpsc::Receiver<StreamEvent>) -> TorStream {
        TorStream {
            circuit: Arc::clone(&self.circuit),
            stream_id,
            events,
            flow: StreamFlowControl::new(stream_id),
            closed: false,
            read_leftover: Vec::new(),
            pending_send: None,
            pending_len: 0,
        }
    }
}

/// A single multiplexed stream over a circuit, exposed as an async byte
/// stream to the SOCKS5 front-end.
pub struct TorStream {
    circuit: Arc<Circuit>,
    stream_id: u16,
    events: mpsc::Receiver<StreamEvent>,
    flow: StreamFlowControl,
    closed: bool,
    read_leftover: Vec<u8>,
    pending_send: Option<SendFuture>,
    pending_len: usize,
}

impl TorStream {
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    pub fn circuit_id(&self) -> u32 {
        self.circuit.id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn send_sendme(&self) {
        let circuit = Arc::clone(&self.circuit);
        let stream_id = self.stream_id;
        tokio::spawn(async move {
            match RelayCell::new(RelayCommand::Sendme, stream_id, Vec::new()) {
                Ok(cell) => {
                    if let Err(err) = circuit.send_relay_cell(&cell).await {
                        tracing::warn!(stream_id, %err, "failed to send stream SENDME");
                    }
                }
                Err(err) => tracing::warn!(stream_id, %err, "failed to build stream SENDME cell"),
            }
        });
    }
}

impl AsyncRead for TorStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_leftover.is_empty() {
            let take = this.read_leftover.len().min(buf.remaining());
            let drained: Vec<u8> = this.read_leftover.drain(..take).collect();
            buf.put_slice(&drained);
            return Poll::Ready(Ok(()));
        }
        if this.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            return match this.events.poll_recv(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => {
                    this.closed = true;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(StreamEvent::End(_))) => {
                    this.closed = true;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Some(StreamEvent::Sendme)) => {
                    this.flow.on_sendme_received();
                    continue;
                }
                Poll::Ready(Some(StreamEvent::Data(data))) => {
                    let should_sendme = this.flow.on_receive_data();
                    if should_sendme {
                        this.send_sendme();
                    }
                    let take = data.len().min(buf.remaining());
                    buf.put_slice(&data[..take]);
                    if take < data.len() {
                        this.read_leftover.extend_from_slice(&data[take..]);
                    }
                    Poll::Ready(Ok(()))
                }
                // Rendezvous/introduction variants are addressed to stream ID 0
                // and never delivered to an application `TorStream` (see the
                // `StreamEvent` doc comment); nothing to do if one ever arrived.
                Poll::Ready(Some(
                    StreamEvent::Connected
                    | StreamEvent::RendezvousEstablished
                    | StreamEvent::IntroEstablished
                    | StreamEvent::IntroduceAck(_)
                    | StreamEvent::Rendezvous2(_),
                )) => continue,
            };
        }
    }
}

impl AsyncWrite for TorStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")));
        }
        if this.pending_send.is_none() {
            if !this.flow.can_send() {
                return Poll::Pending;
            }
            let to_send = buf.len().min(RelayCell::MAX_DATA_SIZE);
            let chunk = buf[..to_send].to_vec();
            let circuit = Arc::clone(&this.circuit);
            let stream_id = this.stream_id;
            this.flow.on_send().map_err(to_io_err)?;
            let fut: SendFuture = Box::pin(async move {
                let cell = RelayCell::new(RelayCommand::Data, stream_id, chunk)?;
                circuit.send_relay_cell(&cell).await
            });
            this.pending_send = Some(fut);
            this.pending_len = to_send;
        }

        let len = this.pending_len;
        let fut = this.pending_send.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.pending_send = None;
                match result {
                    Ok(()) => Poll::Ready(Ok(len)),
                    Err(err) => Poll::Ready(Err(to_io_err(err))),
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        this.closed = true;
        let circuit = Arc::clone(&this.circuit);
        let stream_id = this.stream_id;
        tokio::spawn(async move {
            if let Ok(cell) = RelayCell::new(RelayCommand::End, stream_id, vec![6]) {
                let _ = circuit.send_relay_cell(&cell).await;
            }
        });
        Poll::Ready(Ok(()))
    }
}

fn to_io_err(err: TorError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

impl Drop for TorStream {
    fn drop(&mut self) {
        if !self.closed {
            tracing::debug!(stream_id = self.stream_id, "stream dropped without explicit close");
            self.circuit.deregister_stream(self.stream_id);
        }
    }
}

/// Convenience wrapper mirroring [`StreamManager`] for call sites that only
/// ever open one stream at a time (SOCKS5 CONNECT handling).
pub struct StreamBuilder {
    manager: StreamManager,
}

impl StreamBuilder {
    pub fn new(circuit: Arc<Circuit>) -> Self {
        Self {
            manager: StreamManager::new(circuit),
        }
    }

    pub async fn connect(&mut self, host: &str, port: u16) -> Result<TorStream> {
        self.manager.open_stream(host, port).await
    }
}
