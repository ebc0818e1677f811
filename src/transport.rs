//! Reliable ordered datagram transport over UDP.
//!
//! Each message rides in one datagram stamped with a 32-bit sequence
//! number. Per peer, unacknowledged outbound frames sit in a send-side
//! [`SlidingWindow`] until the cumulative ack covers them, and inbound
//! frames are reordered through a receive-side window before delivery, so
//! the layer above sees every peer's messages exactly once and in order.
//! Retransmission is plain timer-driven; congestion control is out of
//! scope for this layer.
//!
//! All socket and window state lives in a single actor task. The public
//! handle talks to it over a command channel, which is what makes the
//! windows safe without locks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::messages::{deserialize_bounded, serialize};
use crate::window::SlidingWindow;

/// Slots per direction per peer.
const WINDOW_CAPACITY: usize = 64;

/// Largest datagram we will send or accept.
const MAX_DATAGRAM_SIZE: usize = 60 * 1024;

/// How often the actor scans for frames needing retransmission.
const RETRANSMIT_TICK: Duration = Duration::from_millis(100);

/// Age after which an unacked frame is resent.
const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(400);

/// Resends tolerated for one frame before the peer is declared down.
const MAX_FRAME_RETRANSMITS: u32 = 5;

/// Sequencing state for a quiet peer is dropped after this long, so a
/// restarted peer can resync from sequence zero.
const IDLE_EXPIRY: Duration = Duration::from_secs(120);

/// Depth of the inbound event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Inbound notifications from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    Message { peer: SocketAddr, bytes: Vec<u8> },
    ConnectionDown { peer: SocketAddr },
}

/// Datagram-level contract the RPC layer builds on.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind and start the receive loop. Returns the bound endpoint.
    async fn start_listening(&self, endpoint: SocketAddr) -> Result<SocketAddr, DhtError>;

    async fn stop_listening(&self);

    /// Deliver `bytes` to `to` reliably and in order relative to earlier
    /// sends to the same peer. Resolves once the peer acknowledged the
    /// frame, or fails with a transport-kind error.
    async fn send(&self, to: SocketAddr, bytes: Vec<u8>, timeout: Duration)
        -> Result<(), DhtError>;

    fn local_endpoint(&self) -> Option<SocketAddr>;

    /// The inbound event stream; yields `Some` exactly once.
    fn take_event_receiver(&self) -> Option<mpsc::Receiver<TransportEvent>>;
}

// ============================================================================
// Wire frames
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Data { seq: u32, payload: Vec<u8> },
    /// Cumulative: acknowledges every sequence number before `next`.
    Ack { next: u32 },
}

// ============================================================================
// Actor state
// ============================================================================

enum Command {
    Send {
        to: SocketAddr,
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), DhtError>>,
    },
}

#[derive(Default)]
struct SendSlot {
    payload: Vec<u8>,
    last_sent: Option<Instant>,
    retransmits: u32,
    waiter: Option<oneshot::Sender<Result<(), DhtError>>>,
}

#[derive(Default)]
struct RecvSlot {
    payload: Option<Vec<u8>>,
}

struct PeerState {
    send_window: SlidingWindow<SendSlot>,
    recv_window: SlidingWindow<RecvSlot>,
    last_activity: Instant,
}

impl PeerState {
    fn new() -> Self {
        Self {
            send_window: SlidingWindow::with_capacity(0, WINDOW_CAPACITY),
            recv_window: SlidingWindow::with_capacity(0, WINDOW_CAPACITY),
            last_activity: Instant::now(),
        }
    }
}

struct Actor {
    socket: UdpSocket,
    peers: HashMap<SocketAddr, PeerState>,
    events: mpsc::Sender<TransportEvent>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut tick = tokio::time::interval(RETRANSMIT_TICK);
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                        Err(err) => {
                            debug!(error = %err, "socket receive error");
                        }
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Send { to, bytes, done }) => {
                            self.handle_send(to, bytes, done).await;
                        }
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.retransmit_due().await;
                }
            }
        }
    }

    async fn handle_send(
        &mut self,
        to: SocketAddr,
        bytes: Vec<u8>,
        done: oneshot::Sender<Result<(), DhtError>>,
    ) {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            let _ = done.send(Err(DhtError::SendFailure("message exceeds datagram size".into())));
            return;
        }
        let peer = self.peers.entry(to).or_insert_with(PeerState::new);
        peer.last_activity = Instant::now();
        let seq = match peer.send_window.append() {
            Ok(seq) => seq,
            Err(_) => {
                let _ = done.send(Err(DhtError::SendFailure("send window full".into())));
                return;
            }
        };
        let frame = Frame::Data {
            seq,
            payload: bytes,
        };
        let encoded = match serialize(&frame) {
            Ok(encoded) => encoded,
            Err(err) => {
                // Roll the empty slot back off the window.
                let _ = peer.send_window.remove();
                let _ = done.send(Err(DhtError::SendFailure(err.to_string())));
                return;
            }
        };
        let slot = peer
            .send_window
            .get_mut(seq)
            .expect("freshly appended slot");
        slot.payload = encoded;
        slot.last_sent = Some(Instant::now());
        slot.waiter = Some(done);
        if let Err(err) = self.socket.send_to(&slot.payload, to).await {
            trace!(peer = %to, error = %err, "datagram send failed, leaving for retransmit");
        }
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let frame: Frame = match deserialize_bounded(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(peer = %from, error = %err, "dropping undecodable datagram");
                return;
            }
        };
        match frame {
            Frame::Ack { next } => self.handle_ack(from, next),
            Frame::Data { seq, payload } => self.handle_data(from, seq, payload).await,
        }
    }

    fn handle_ack(&mut self, from: SocketAddr, next: u32) {
        let Some(peer) = self.peers.get_mut(&from) else {
            return;
        };
        peer.last_activity = Instant::now();
        let advance = next.wrapping_sub(peer.send_window.begin()) as usize;
        if advance > peer.send_window.len() {
            // Stale or garbage ack.
            return;
        }
        for _ in 0..advance {
            let slot = peer.send_window.remove().expect("acked slot present");
            if let Some(waiter) = slot.waiter {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    async fn handle_data(&mut self, from: SocketAddr, seq: u32, payload: Vec<u8>) {
        let peer = self.peers.entry(from).or_insert_with(PeerState::new);
        peer.last_activity = Instant::now();
        let next = peer.recv_window.begin();
        let offset = seq.wrapping_sub(next);

        if offset as usize >= WINDOW_CAPACITY {
            // Behind the window: a duplicate of something already
            // delivered, so re-ack. Far ahead: drop, the sender's window
            // bounds how far ahead a legitimate peer can be.
            if offset >= u32::MAX / 2 {
                self.send_ack(from, next).await;
            }
            return;
        }

        while !peer.recv_window.contains(seq) {
            peer.recv_window
                .append()
                .expect("offset bounded by capacity");
        }
        peer.recv_window[seq].payload = Some(payload);

        // Deliver the in-order run at the front of the window.
        while peer
            .recv_window
            .get(peer.recv_window.begin())
            .is_some_and(|slot| slot.payload.is_some())
        {
            let slot = peer.recv_window.remove().expect("front slot filled");
            let bytes = slot.payload.expect("checked above");
            if self
                .events
                .send(TransportEvent::Message { peer: from, bytes })
                .await
                .is_err()
            {
                return;
            }
        }
        let ack = self.peers[&from].recv_window.begin();
        self.send_ack(from, ack).await;
    }

    async fn send_ack(&self, to: SocketAddr, next: u32) {
        let Ok(encoded) = serialize(&Frame::Ack { next }) else {
            return;
        };
        if let Err(err) = self.socket.send_to(&encoded, to).await {
            trace!(peer = %to, error = %err, "ack send failed");
        }
    }

    async fn retransmit_due(&mut self) {
        let now = Instant::now();
        let mut dead: Vec<SocketAddr> = Vec::new();

        for (addr, peer) in self.peers.iter_mut() {
            let begin = peer.send_window.begin();
            let len = peer.send_window.len();
            let mut give_up = false;
            for i in 0..len {
                let seq = begin.wrapping_add(i as u32);
                let slot = peer.send_window.get_mut(seq).expect("slot in window");
                let due = slot
                    .last_sent
                    .map_or(true, |sent| now.duration_since(sent) >= RETRANSMIT_TIMEOUT);
                if !due {
                    continue;
                }
                if slot.retransmits >= MAX_FRAME_RETRANSMITS {
                    give_up = true;
                    break;
                }
                slot.retransmits += 1;
                slot.last_sent = Some(now);
                if let Err(err) = self.socket.send_to(&slot.payload, *addr).await {
                    trace!(peer = %addr, error = %err, "retransmit failed");
                }
            }
            if give_up {
                dead.push(*addr);
            }
        }

        self.peers.retain(|_, peer| {
            !peer.send_window.is_empty() || now.duration_since(peer.last_activity) < IDLE_EXPIRY
        });

        for addr in dead {
            warn!(peer = %addr, "peer unresponsive, dropping transport state");
            if let Some(mut peer) = self.peers.remove(&addr) {
                while let Ok(slot) = peer.send_window.remove() {
                    if let Some(waiter) = slot.waiter {
                        let _ = waiter.send(Err(DhtError::RemoteUnreachable));
                    }
                }
            }
            let _ = self
                .events
                .send(TransportEvent::ConnectionDown { peer: addr })
                .await;
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

struct Running {
    cmd_tx: mpsc::Sender<Command>,
    local: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

/// The production [`Transport`]: sequenced, acknowledged UDP.
pub struct SequencedUdp {
    running: Mutex<Option<Running>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl SequencedUdp {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            running: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

impl Default for SequencedUdp {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SequencedUdp {
    async fn start_listening(&self, endpoint: SocketAddr) -> Result<SocketAddr, DhtError> {
        if self.running.lock().is_some() {
            return Err(DhtError::ListenError("already listening".into()));
        }
        let socket = UdpSocket::bind(endpoint)
            .await
            .map_err(|err| DhtError::BindError(err.to_string()))?;
        let local = socket
            .local_addr()
            .map_err(|err| DhtError::BindError(err.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let actor = Actor {
            socket,
            peers: HashMap::new(),
            events: self.events_tx.clone(),
        };
        let task = tokio::spawn(actor.run(cmd_rx));
        *self.running.lock() = Some(Running {
            cmd_tx,
            local,
            task,
        });
        debug!(%local, "transport listening");
        Ok(local)
    }

    async fn stop_listening(&self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
        }
    }

    async fn send(
        &self,
        to: SocketAddr,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), DhtError> {
        let cmd_tx = {
            let running = self.running.lock();
            match running.as_ref() {
                Some(running) => running.cmd_tx.clone(),
                None => return Err(DhtError::NoNetwork),
            }
        };
        let (done_tx, done_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                to,
                bytes,
                done: done_tx,
            })
            .await
            .map_err(|_| DhtError::SendFailure("transport stopped".into()))?;
        match tokio::time::timeout(timeout, done_rx).await {
            Err(_) => Err(DhtError::TimedOut),
            Ok(Err(_)) => Err(DhtError::SendFailure("transport stopped".into())),
            Ok(Ok(result)) => result,
        }
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local)
    }

    fn take_event_receiver(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}
