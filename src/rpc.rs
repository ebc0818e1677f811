//! RPC layer over the sequenced transport.
//!
//! [`RpcClient`] is the outbound half: it signs request envelopes, matches
//! responses by correlation id and enforces a deadline per call, reporting
//! transport-kind errors so callers can mark the destination down. The
//! inbound half is the dispatcher task, which routes responses back to
//! waiting calls and hands requests to the local [`Service`] when this node
//! is serving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::identity::{Contact, NodeId};
use crate::messages::{
    deserialize_bounded, serialize, RequestEnvelope, RequestPayload, ResponseEnvelope,
    ResponsePayload, WireError, WireMessage,
};
use crate::protocols::{FindValueReply, NodeRpc};
use crate::routing::RankInfo;
use crate::securifier::Securifier;
use crate::service::Service;
use crate::store::KeyValueSignature;
use crate::transport::{Transport, TransportEvent};

/// Default deadline for one request/response exchange.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the dispatcher waits to push a response onto the wire.
const RESPONSE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

type PendingCalls = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseEnvelope>>>>;

pub struct RpcClient {
    transport: Arc<dyn Transport>,
    securifier: Arc<Securifier>,
    own_contact: RwLock<Contact>,
    pending: PendingCalls,
    next_id: AtomicU64,
    rpc_timeout: Duration,
}

impl RpcClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        securifier: Arc<Securifier>,
        own_contact: Contact,
    ) -> Self {
        Self {
            transport,
            securifier,
            own_contact: RwLock::new(own_contact),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            rpc_timeout: RPC_TIMEOUT,
        }
    }

    /// Replace the advertised sender contact; join updates this once the
    /// listening endpoint is known.
    pub fn set_contact(&self, contact: Contact) {
        *self.own_contact.write() = contact;
    }

    pub fn contact(&self) -> Contact {
        self.own_contact.read().clone()
    }

    /// Start the task that consumes transport events: responses resolve
    /// pending calls, requests go to `service` (or are refused when this
    /// node is not serving).
    pub fn spawn_dispatcher(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        service: Option<Arc<Service>>,
    ) -> tokio::task::JoinHandle<()> {
        let pending = self.pending.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Message { peer, bytes } => {
                        let frame: WireMessage = match deserialize_bounded(&bytes) {
                            Ok(frame) => frame,
                            Err(err) => {
                                debug!(%peer, error = %err, "dropping undecodable message");
                                continue;
                            }
                        };
                        match frame {
                            WireMessage::Response { id, envelope } => {
                                if let Some(waiter) = pending.lock().remove(&id) {
                                    let _ = waiter.send(envelope);
                                } else {
                                    trace!(%peer, id, "response for unknown call");
                                }
                            }
                            WireMessage::Request { id, envelope } => {
                                let service = service.clone();
                                let transport = transport.clone();
                                tokio::spawn(async move {
                                    let result = match service {
                                        Some(service) => service.handle_request(envelope).await,
                                        None => ResponsePayload::Error {
                                            kind: WireError::NotServing,
                                        },
                                    };
                                    let response = WireMessage::Response {
                                        id,
                                        envelope: ResponseEnvelope {
                                            result,
                                            rtt_hint_ms: None,
                                        },
                                    };
                                    let Ok(bytes) = serialize(&response) else {
                                        warn!(%peer, "failed to encode response");
                                        return;
                                    };
                                    if let Err(err) =
                                        transport.send(peer, bytes, RESPONSE_SEND_TIMEOUT).await
                                    {
                                        debug!(%peer, error = %err, "failed to send response");
                                    }
                                });
                            }
                        }
                    }
                    TransportEvent::ConnectionDown { peer } => {
                        trace!(%peer, "transport reports peer down");
                    }
                }
            }
        })
    }

    async fn call(
        &self,
        to: &Contact,
        payload: RequestPayload,
    ) -> Result<(ResponsePayload, RankInfo), DhtError> {
        let payload_bytes =
            serialize(&payload).map_err(|err| DhtError::MalformedMessage(err.to_string()))?;
        let envelope = RequestEnvelope {
            sender: self.contact(),
            signing_key_id: self.securifier.signing_key_id(),
            signature: self.securifier.sign(&payload_bytes),
            payload,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = serialize(&WireMessage::Request { id, envelope })
            .map_err(|err| DhtError::MalformedMessage(err.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        let started = Instant::now();
        if let Err(err) = self
            .transport
            .send(to.primary_endpoint, bytes, self.rpc_timeout)
            .await
        {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.rpc_timeout, reply_rx).await {
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(DhtError::TimedOut)
            }
            Ok(Err(_)) => Err(DhtError::ReceiveFailure("dispatcher stopped".into())),
            Ok(Ok(envelope)) => {
                let elapsed = started.elapsed().as_millis();
                let rank_info = RankInfo {
                    rtt_ms: Some(elapsed.min(u128::from(u32::MAX)) as u32),
                };
                match envelope.result {
                    ResponsePayload::Error { kind } => Err(kind.into()),
                    other => Ok((other, rank_info)),
                }
            }
        }
    }
}

#[async_trait]
impl NodeRpc for RpcClient {
    async fn ping(&self, to: &Contact) -> Result<RankInfo, DhtError> {
        match self.call(to, RequestPayload::Ping).await? {
            (ResponsePayload::Pong, rank_info) => Ok(rank_info),
            _ => Err(DhtError::MalformedMessage("expected pong".into())),
        }
    }

    async fn find_nodes(
        &self,
        to: &Contact,
        target: NodeId,
    ) -> Result<(Vec<Contact>, RankInfo), DhtError> {
        match self.call(to, RequestPayload::FindNodes { target }).await? {
            (ResponsePayload::Nodes { contacts }, rank_info) => Ok((contacts, rank_info)),
            _ => Err(DhtError::MalformedMessage("expected contact list".into())),
        }
    }

    async fn find_value(&self, to: &Contact, key: NodeId) -> Result<FindValueReply, DhtError> {
        match self.call(to, RequestPayload::FindValue { key }).await? {
            (
                ResponsePayload::Value {
                    values,
                    contacts,
                    alternative_store_holder,
                },
                rank_info,
            ) => Ok(FindValueReply {
                values,
                closer: contacts,
                alternative_store_holder,
                rank_info,
            }),
            _ => Err(DhtError::MalformedMessage("expected value reply".into())),
        }
    }

    async fn store(
        &self,
        to: &Contact,
        kvs: KeyValueSignature,
        ttl: Duration,
    ) -> Result<RankInfo, DhtError> {
        let payload = RequestPayload::Store {
            kvs,
            ttl_secs: ttl.as_secs(),
        };
        match self.call(to, payload).await? {
            (ResponsePayload::Stored, rank_info) => Ok(rank_info),
            _ => Err(DhtError::MalformedMessage("expected store ack".into())),
        }
    }

    async fn delete(&self, to: &Contact, kvs: KeyValueSignature) -> Result<RankInfo, DhtError> {
        match self.call(to, RequestPayload::Delete { kvs }).await? {
            (ResponsePayload::Deleted, rank_info) => Ok(rank_info),
            _ => Err(DhtError::MalformedMessage("expected delete ack".into())),
        }
    }

    async fn store_refresh(
        &self,
        to: &Contact,
        original_request: Vec<u8>,
        original_signature: Vec<u8>,
    ) -> Result<RankInfo, DhtError> {
        let payload = RequestPayload::StoreRefresh {
            original_request,
            original_signature,
        };
        match self.call(to, payload).await? {
            (ResponsePayload::Refreshed, rank_info) => Ok(rank_info),
            _ => Err(DhtError::MalformedMessage("expected refresh ack".into())),
        }
    }
}
