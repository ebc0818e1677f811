//! Server side of the RPC layer.
//!
//! Every inbound request goes through the same gate: resolve the claimed
//! signing key, check the envelope signature, and only then admit the
//! sender into the routing table and dispatch the payload. A request that
//! fails the gate is answered with an error and leaves no trace in local
//! state.
//!
//! UPDATE has no inbound form: the originator expresses it as a STORE of
//! the new value followed by a DELETE of the old one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::DhtError;
use crate::identity::{Contact, NodeId};
use crate::messages::{
    deserialize_bounded, serialize, RequestEnvelope, RequestPayload, ResponsePayload, WireError,
};
use crate::protocols::AlternativeStore;
use crate::routing::{RankInfo, RoutingTable};
use crate::securifier::Securifier;
use crate::store::{DataStore, KeyValueSignature};

pub struct Service {
    routing: Arc<RoutingTable>,
    store: Arc<DataStore>,
    securifier: Arc<Securifier>,
    alternative_store: Option<Arc<dyn AlternativeStore>>,
    k: usize,
    node_contact: RwLock<Option<Contact>>,
    joined: AtomicBool,
}

impl Service {
    pub fn new(
        routing: Arc<RoutingTable>,
        store: Arc<DataStore>,
        securifier: Arc<Securifier>,
        alternative_store: Option<Arc<dyn AlternativeStore>>,
        k: usize,
    ) -> Self {
        Self {
            routing,
            store,
            securifier,
            alternative_store,
            k,
            node_contact: RwLock::new(None),
            joined: AtomicBool::new(false),
        }
    }

    pub fn set_node_joined(&self, joined: bool) {
        self.joined.store(joined, Ordering::SeqCst);
    }

    pub fn set_node_contact(&self, contact: Contact) {
        *self.node_contact.write() = Some(contact);
    }

    /// Validate and dispatch one inbound request.
    pub async fn handle_request(&self, envelope: RequestEnvelope) -> ResponsePayload {
        if !self.joined.load(Ordering::SeqCst) {
            return ResponsePayload::Error {
                kind: WireError::NotServing,
            };
        }

        let signer_id = envelope.signing_key_id;
        let Ok(payload_bytes) = serialize(&envelope.payload) else {
            return ResponsePayload::Error {
                kind: WireError::Malformed,
            };
        };

        // The sender's contact carries its own key material; learn it so
        // resolution below (and later contact validation) hits the cache.
        if envelope.sender.public_key_id == signer_id {
            self.securifier.learn_key(
                signer_id,
                envelope.sender.public_key.clone(),
                envelope.sender.signature.clone(),
            );
        }
        let Some(resolved) = self
            .securifier
            .get_public_key_and_validation(&signer_id)
            .await
        else {
            trace!(signer = %&signer_id.to_hex()[..16], "cannot resolve signer key");
            return ResponsePayload::Error {
                kind: WireError::SignatureInvalid,
            };
        };
        if !self.securifier.validate(
            &payload_bytes,
            &envelope.signature,
            &signer_id,
            &resolved.public_key,
            &resolved.validation,
        ) {
            debug!(signer = %&signer_id.to_hex()[..16], "rejecting request with bad signature");
            return ResponsePayload::Error {
                kind: WireError::SignatureInvalid,
            };
        }

        // Only now does the sender count as seen.
        self.routing
            .add_contact(envelope.sender.clone(), RankInfo::default());

        match envelope.payload {
            RequestPayload::Ping => ResponsePayload::Pong,
            RequestPayload::FindNodes { target } => ResponsePayload::Nodes {
                contacts: self.routing.get_close_contacts(&target, self.k, &[]),
            },
            RequestPayload::FindValue { key } => self.handle_find_value(&key),
            RequestPayload::Store { ref kvs, ttl_secs } => {
                let request_and_signature = match serialize(&envelope) {
                    Ok(bytes) => (bytes, envelope.signature.clone()),
                    Err(_) => {
                        return ResponsePayload::Error {
                            kind: WireError::Malformed,
                        }
                    }
                };
                self.apply_store(
                    kvs.clone(),
                    signer_id,
                    &resolved.public_key,
                    &resolved.validation,
                    request_and_signature,
                    Duration::from_secs(ttl_secs),
                    false,
                )
            }
            RequestPayload::Delete { ref kvs } => {
                if !self.securifier.validate(
                    &kvs.value,
                    &kvs.signature,
                    &signer_id,
                    &resolved.public_key,
                    &resolved.validation,
                ) {
                    return ResponsePayload::Error {
                        kind: WireError::SignatureInvalid,
                    };
                }
                match self
                    .store
                    .delete(&kvs.key, &kvs.value, &kvs.signature, &signer_id)
                {
                    Ok(()) => ResponsePayload::Deleted,
                    Err(err) => ResponsePayload::Error {
                        kind: wire_error(err),
                    },
                }
            }
            RequestPayload::StoreRefresh {
                ref original_request,
                ref original_signature,
            } => self
                .handle_store_refresh(original_request, original_signature)
                .await,
        }
    }

    fn handle_find_value(&self, key: &NodeId) -> ResponsePayload {
        let values = self.store.get_values(key);
        if !values.is_empty() {
            return ResponsePayload::Value {
                values,
                contacts: Vec::new(),
                alternative_store_holder: None,
            };
        }
        let holds_alternative = self
            .alternative_store
            .as_ref()
            .is_some_and(|alt| alt.has(key));
        if holds_alternative {
            // The data lives outside the record store; point the caller at
            // this node rather than at closer peers.
            return ResponsePayload::Value {
                values: Vec::new(),
                contacts: Vec::new(),
                alternative_store_holder: self.node_contact.read().clone(),
            };
        }
        ResponsePayload::Value {
            values: Vec::new(),
            contacts: self.routing.get_close_contacts(key, self.k, &[]),
            alternative_store_holder: None,
        }
    }

    /// Apply a STORE after checking the publisher's signature over the
    /// value itself.
    #[allow(clippy::too_many_arguments)]
    fn apply_store(
        &self,
        kvs: KeyValueSignature,
        signer_id: NodeId,
        public_key: &[u8],
        validation: &[u8],
        request_and_signature: (Vec<u8>, Vec<u8>),
        ttl: Duration,
        is_refresh: bool,
    ) -> ResponsePayload {
        if !self
            .securifier
            .validate(&kvs.value, &kvs.signature, &signer_id, public_key, validation)
        {
            return ResponsePayload::Error {
                kind: WireError::SignatureInvalid,
            };
        }
        match self
            .store
            .store(kvs, signer_id, request_and_signature, ttl, is_refresh)
        {
            Ok(()) => {
                if is_refresh {
                    ResponsePayload::Refreshed
                } else {
                    ResponsePayload::Stored
                }
            }
            Err(err) => ResponsePayload::Error {
                kind: wire_error(err),
            },
        }
    }

    /// STORE_REFRESH: the forwarder's own signature requirements are
    /// reduced; what matters is the original publisher's envelope carried
    /// inside the request.
    async fn handle_store_refresh(
        &self,
        original_request: &[u8],
        original_signature: &[u8],
    ) -> ResponsePayload {
        let Ok(original) = deserialize_bounded::<RequestEnvelope>(original_request) else {
            return ResponsePayload::Error {
                kind: WireError::Malformed,
            };
        };
        if original.signature != original_signature {
            return ResponsePayload::Error {
                kind: WireError::SignatureInvalid,
            };
        }
        let RequestPayload::Store { ref kvs, ttl_secs } = original.payload else {
            return ResponsePayload::Error {
                kind: WireError::Malformed,
            };
        };
        let original_signer = original.signing_key_id;
        let Ok(original_payload_bytes) = serialize(&original.payload) else {
            return ResponsePayload::Error {
                kind: WireError::Malformed,
            };
        };

        if original.sender.public_key_id == original_signer {
            self.securifier.learn_key(
                original_signer,
                original.sender.public_key.clone(),
                original.sender.signature.clone(),
            );
        }
        let Some(resolved) = self
            .securifier
            .get_public_key_and_validation(&original_signer)
            .await
        else {
            return ResponsePayload::Error {
                kind: WireError::SignatureInvalid,
            };
        };
        if !self.securifier.validate(
            &original_payload_bytes,
            &original.signature,
            &original_signer,
            &resolved.public_key,
            &resolved.validation,
        ) {
            return ResponsePayload::Error {
                kind: WireError::SignatureInvalid,
            };
        }

        self.apply_store(
            kvs.clone(),
            original_signer,
            &resolved.public_key,
            &resolved.validation,
            (original_request.to_vec(), original_signature.to_vec()),
            Duration::from_secs(ttl_secs),
            true,
        )
    }
}

fn wire_error(err: DhtError) -> WireError {
    match err {
        DhtError::SignerMismatch => WireError::SignerMismatch,
        DhtError::Replay => WireError::Replay,
        DhtError::KeyNotFound => WireError::KeyNotFound,
        DhtError::SignatureInvalid => WireError::SignatureInvalid,
        _ => WireError::Malformed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Keypair, NodeId};
    use crate::routing::RoutingTableEventStream;
    use crate::store::DEFAULT_REFRESH_INTERVAL;

    struct TestService {
        service: Service,
        events: RoutingTableEventStream,
    }

    fn service_for(keypair: &Keypair, k: usize) -> TestService {
        let (routing, events) = RoutingTable::new(keypair.node_id(), k);
        let service = Service::new(
            Arc::new(routing),
            Arc::new(DataStore::new(DEFAULT_REFRESH_INTERVAL)),
            Arc::new(Securifier::new(keypair.clone())),
            None,
            k,
        );
        service.set_node_joined(true);
        service.set_node_contact(Contact::new(
            keypair,
            "127.0.0.1:4700".parse().unwrap(),
            vec![],
        ));
        TestService { service, events }
    }

    fn seeded(index: u8) -> Keypair {
        let mut seed = [0u8; 32];
        seed[0] = index;
        Keypair::from_seed(seed)
    }

    fn signed_envelope(keypair: &Keypair, payload: RequestPayload) -> RequestEnvelope {
        let payload_bytes = serialize(&payload).unwrap();
        RequestEnvelope {
            sender: Contact::new(keypair, "127.0.0.1:4800".parse().unwrap(), vec![]),
            signing_key_id: keypair.node_id(),
            signature: keypair.sign(&payload_bytes),
            payload,
        }
    }

    fn signed_kvs(keypair: &Keypair, key: NodeId, value: &[u8]) -> KeyValueSignature {
        KeyValueSignature {
            key,
            value: value.to_vec(),
            signature: keypair.sign(value),
        }
    }

    #[tokio::test]
    async fn ping_answers_pong_and_queues_sender_for_validation() {
        let server = seeded(1);
        let client = seeded(2);
        let mut ts = service_for(&server, 8);

        let response = ts
            .service
            .handle_request(signed_envelope(&client, RequestPayload::Ping))
            .await;
        assert!(matches!(response, ResponsePayload::Pong));

        let queued = ts
            .events
            .validate_contact
            .try_recv()
            .expect("sender queued for validation");
        assert_eq!(queued.node_id, client.node_id());
    }

    #[tokio::test]
    async fn bad_envelope_signature_is_rejected_without_side_effects() {
        let server = seeded(3);
        let client = seeded(4);
        let mut ts = service_for(&server, 8);

        let mut envelope = signed_envelope(&client, RequestPayload::Ping);
        envelope.signature[0] ^= 0xFF;
        let response = ts.service.handle_request(envelope).await;
        assert!(matches!(
            response,
            ResponsePayload::Error {
                kind: WireError::SignatureInvalid
            }
        ));
        assert!(ts.events.validate_contact.try_recv().is_err());
    }

    #[tokio::test]
    async fn find_nodes_on_empty_table_returns_nothing() {
        let server = seeded(5);
        let client = seeded(6);
        let ts = service_for(&server, 8);

        let response = ts
            .service
            .handle_request(signed_envelope(
                &client,
                RequestPayload::FindNodes {
                    target: client.node_id(),
                },
            ))
            .await;
        match response {
            ResponsePayload::Nodes { contacts } => assert!(contacts.is_empty()),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn find_nodes_on_a_loaded_table_returns_the_k_closest() {
        let server = seeded(30);
        let client = seeded(31);
        let k = 8;
        let ts = service_for(&server, k);

        // Load the table with random validated contacts, none the client.
        let mut loaded: Vec<NodeId> = Vec::new();
        for _ in 0..(2 * k) {
            let id = NodeId::random();
            let kp = seeded(32);
            let contact = Contact {
                node_id: id,
                primary_endpoint: "127.0.0.1:5000".parse().unwrap(),
                local_endpoints: vec![],
                rendezvous_endpoint: None,
                public_key_id: id,
                public_key: kp.public_key().to_vec(),
                signature: kp.key_validation(),
            };
            ts.service
                .routing
                .add_contact(contact, crate::routing::RankInfo::default());
            ts.service.routing.set_validated(&id, true);
            loaded.push(id);
        }

        let target = client.node_id();
        let response = ts
            .service
            .handle_request(signed_envelope(&client, RequestPayload::FindNodes { target }))
            .await;
        let contacts = match response {
            ResponsePayload::Nodes { contacts } => contacts,
            other => panic!("unexpected response: {other:?}"),
        };
        assert_eq!(contacts.len(), k);
        assert!(contacts.iter().all(|c| c.node_id != client.node_id()));

        // No excluded contact is closer than the farthest returned one.
        let returned: Vec<NodeId> = contacts.iter().map(|c| c.node_id).collect();
        let farthest = returned.last().unwrap().xor_distance(&target);
        for id in &loaded {
            if !returned.contains(id) {
                let dist = id.xor_distance(&target);
                assert_ne!(
                    crate::identity::distance_cmp(&dist, &farthest),
                    std::cmp::Ordering::Less,
                    "closer contact was left out"
                );
            }
        }
    }

    #[tokio::test]
    async fn find_nodes_includes_the_requester_once_validated() {
        let server = seeded(33);
        let client = seeded(34);
        let k = 8;
        let ts = service_for(&server, k);

        let client_contact = Contact::new(&client, "127.0.0.1:5100".parse().unwrap(), vec![]);
        ts.service
            .routing
            .add_contact(client_contact.clone(), crate::routing::RankInfo::default());
        ts.service
            .routing
            .set_validated(&client_contact.node_id, true);

        let response = ts
            .service
            .handle_request(signed_envelope(
                &client,
                RequestPayload::FindNodes {
                    target: client.node_id(),
                },
            ))
            .await;
        match response {
            ResponsePayload::Nodes { contacts } => {
                assert!(contacts.iter().any(|c| c.node_id == client.node_id()));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_then_find_value_round_trips() {
        let server = seeded(7);
        let client = seeded(8);
        let ts = service_for(&server, 8);

        let key = NodeId::random();
        let kvs = signed_kvs(&client, key, b"value");
        let response = ts
            .service
            .handle_request(signed_envelope(
                &client,
                RequestPayload::Store {
                    kvs,
                    ttl_secs: 3600,
                },
            ))
            .await;
        assert!(matches!(response, ResponsePayload::Stored));

        let response = ts
            .service
            .handle_request(signed_envelope(&client, RequestPayload::FindValue { key }))
            .await;
        match response {
            ResponsePayload::Value { values, contacts, .. } => {
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].value, b"value");
                assert!(contacts.is_empty());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_with_forged_value_signature_is_rejected() {
        let server = seeded(9);
        let client = seeded(10);
        let ts = service_for(&server, 8);

        let key = NodeId::random();
        let mut kvs = signed_kvs(&client, key, b"value");
        kvs.signature[0] ^= 0xFF;
        let response = ts
            .service
            .handle_request(signed_envelope(
                &client,
                RequestPayload::Store {
                    kvs,
                    ttl_secs: 3600,
                },
            ))
            .await;
        assert!(matches!(
            response,
            ResponsePayload::Error {
                kind: WireError::SignatureInvalid
            }
        ));
        assert!(!ts.service.store.has_key(&key));
    }

    #[tokio::test]
    async fn delete_by_another_signer_is_refused() {
        let server = seeded(11);
        let owner = seeded(12);
        let intruder = seeded(13);
        let ts = service_for(&server, 8);

        let key = NodeId::random();
        let kvs = signed_kvs(&owner, key, b"value");
        ts.service
            .handle_request(signed_envelope(
                &owner,
                RequestPayload::Store {
                    kvs: kvs.clone(),
                    ttl_secs: 3600,
                },
            ))
            .await;

        // The intruder signs the same value with its own key.
        let forged = signed_kvs(&intruder, key, b"value");
        let response = ts
            .service
            .handle_request(signed_envelope(&intruder, RequestPayload::Delete { kvs: forged }))
            .await;
        assert!(matches!(
            response,
            ResponsePayload::Error {
                kind: WireError::SignerMismatch
            }
        ));
        assert!(ts.service.store.has_key(&key));
    }

    #[tokio::test]
    async fn store_refresh_applies_the_forwarded_request() {
        let server = seeded(14);
        let publisher = seeded(15);
        let forwarder = seeded(16);
        let ts = service_for(&server, 8);

        let key = NodeId::random();
        let original = signed_envelope(
            &publisher,
            RequestPayload::Store {
                kvs: signed_kvs(&publisher, key, b"value"),
                ttl_secs: 3600,
            },
        );
        let original_bytes = serialize(&original).unwrap();
        let original_signature = original.signature.clone();

        let response = ts
            .service
            .handle_request(signed_envelope(
                &forwarder,
                RequestPayload::StoreRefresh {
                    original_request: original_bytes,
                    original_signature,
                },
            ))
            .await;
        assert!(matches!(response, ResponsePayload::Refreshed));
        assert!(ts.service.store.has_key(&key));
    }

    #[tokio::test]
    async fn alternative_store_holder_is_advertised() {
        struct OneKey(NodeId);
        impl AlternativeStore for OneKey {
            fn has(&self, key: &NodeId) -> bool {
                key == &self.0
            }
        }

        let server = seeded(17);
        let client = seeded(18);
        let key = NodeId::random();
        let (routing, _events) = RoutingTable::new(server.node_id(), 8);
        let service = Service::new(
            Arc::new(routing),
            Arc::new(DataStore::new(DEFAULT_REFRESH_INTERVAL)),
            Arc::new(Securifier::new(server.clone())),
            Some(Arc::new(OneKey(key))),
            8,
        );
        service.set_node_joined(true);
        let own_contact = Contact::new(&server, "127.0.0.1:4900".parse().unwrap(), vec![]);
        service.set_node_contact(own_contact.clone());

        let response = service
            .handle_request(signed_envelope(&client, RequestPayload::FindValue { key }))
            .await;
        match response {
            ResponsePayload::Value {
                values,
                contacts,
                alternative_store_holder,
            } => {
                assert!(values.is_empty());
                assert!(contacts.is_empty());
                assert_eq!(
                    alternative_store_holder.map(|c| c.node_id),
                    Some(own_contact.node_id)
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn requests_before_join_are_refused() {
        let server = seeded(19);
        let client = seeded(20);
        let ts = service_for(&server, 8);
        ts.service.set_node_joined(false);

        let response = ts
            .service
            .handle_request(signed_envelope(&client, RequestPayload::Ping))
            .await;
        assert!(matches!(
            response,
            ResponsePayload::Error {
                kind: WireError::NotServing
            }
        ));
    }
}
