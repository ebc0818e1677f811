//! The node coordinator: lifecycle, background workers and event wiring.
//!
//! A [`Node`] assembles the transport, RPC stack, routing table, data
//! store, service and lookup engine, and owns the background tasks that
//! connect them:
//!
//! - the **ping-oldest worker** answers the routing table's full-bucket
//!   events by probing the oldest entry and deciding which contact stays;
//! - the **validate worker** resolves first-seen contacts' keys and
//!   delivers the verdict back to the routing table;
//! - the **downlist monitor** drains reports of unresponsive peers, records
//!   the failure and probes them once for a comeback;
//! - the **refresh worker** (running while joined) republishes records the
//!   data store declares due.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::DhtError;
use crate::identity::{Contact, Keypair, NodeId};
use crate::lookup::{
    FindValueResult, LookupConfig, LookupEngine, DEFAULT_ALPHA, DEFAULT_BETA,
};
use crate::protocols::{AlternativeStore, NodeRpc};
use crate::routing::{PingOldestEvent, RoutingTable, DEFAULT_K};
use crate::rpc::RpcClient;
use crate::securifier::Securifier;
use crate::service::Service;
use crate::store::{DataStore, KeyValueSignature, DEFAULT_REFRESH_INTERVAL};
use crate::transport::{SequencedUdp, Transport};

/// Cadence of the refresh worker's due-record sweep.
const REFRESH_TICK: Duration = Duration::from_secs(10);

/// Depth of the downlist queue.
const DOWNLIST_QUEUE_DEPTH: usize = 128;

pub struct NodeBuilder {
    keypair: Option<Keypair>,
    listen_addr: SocketAddr,
    client_only: bool,
    k: usize,
    alpha: usize,
    beta: usize,
    refresh_interval: Duration,
    alternative_store: Option<Arc<dyn AlternativeStore>>,
}

impl NodeBuilder {
    fn new() -> Self {
        Self {
            keypair: None,
            listen_addr: "0.0.0.0:0".parse().expect("valid default addr"),
            client_only: false,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            alternative_store: None,
        }
    }

    /// Use an existing identity instead of generating one.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Run without serving: the node issues RPCs and holds no records, and
    /// peers never learn it as a routable contact.
    pub fn client_only(mut self, client_only: bool) -> Self {
        self.client_only = client_only;
        self
    }

    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn beta(mut self, beta: usize) -> Self {
        self.beta = beta;
        self
    }

    /// Age after which a stored record becomes due for republication.
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn alternative_store(mut self, store: Arc<dyn AlternativeStore>) -> Self {
        self.alternative_store = Some(store);
        self
    }

    /// Bind the transport and assemble the node. The node is not part of
    /// any overlay until [`Node::join`] succeeds.
    pub async fn build(self) -> Result<Node, DhtError> {
        let keypair = self.keypair.unwrap_or_else(Keypair::generate);
        let node_id = keypair.node_id();
        let config = LookupConfig::new(self.k, self.alpha, self.beta);

        let transport: Arc<dyn Transport> = Arc::new(SequencedUdp::new());
        let local = transport.start_listening(self.listen_addr).await?;

        let contact = if self.client_only {
            Contact::anonymous(&keypair, local)
        } else {
            Contact::new(&keypair, local, vec![local])
        };

        let securifier = Arc::new(Securifier::new(keypair.clone()));
        let (routing, routing_events) = RoutingTable::new(node_id, self.k);
        let routing = Arc::new(routing);
        let store = Arc::new(DataStore::new(self.refresh_interval));
        let service = Arc::new(Service::new(
            routing.clone(),
            store.clone(),
            securifier.clone(),
            self.alternative_store,
            self.k,
        ));
        service.set_node_contact(contact.clone());

        let rpc = Arc::new(RpcClient::new(
            transport.clone(),
            securifier.clone(),
            contact.clone(),
        ));
        let transport_events = transport
            .take_event_receiver()
            .ok_or_else(|| DhtError::ListenError("transport events already taken".into()))?;
        let dispatcher = rpc.spawn_dispatcher(
            transport_events,
            (!self.client_only).then(|| service.clone()),
        );

        let (downlist_tx, downlist_rx) = mpsc::channel(DOWNLIST_QUEUE_DEPTH);
        let engine = LookupEngine::new(rpc.clone(), routing.clone(), config, downlist_tx.clone());

        let inner = Arc::new(NodeInner {
            keypair,
            config,
            client_only: self.client_only,
            securifier,
            transport,
            rpc,
            routing,
            store,
            service,
            engine,
            contact: RwLock::new(contact),
            joined: AtomicBool::new(false),
            core_tasks: Mutex::new(vec![dispatcher]),
            joined_tasks: Mutex::new(Vec::new()),
        });

        inner.spawn_event_workers(routing_events, downlist_rx);
        info!(node = %&node_id.to_hex()[..16], %local, "node assembled");
        Ok(Node { inner })
    }
}

struct NodeInner {
    keypair: Keypair,
    config: LookupConfig,
    client_only: bool,
    securifier: Arc<Securifier>,
    transport: Arc<dyn Transport>,
    rpc: Arc<RpcClient>,
    routing: Arc<RoutingTable>,
    store: Arc<DataStore>,
    service: Arc<Service>,
    engine: LookupEngine<RpcClient>,
    contact: RwLock<Contact>,
    joined: AtomicBool,
    /// Tasks alive for the node's whole lifetime.
    core_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Tasks started by join, stopped by leave.
    joined_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NodeInner {
    fn spawn_event_workers(
        self: &Arc<Self>,
        events: crate::routing::RoutingTableEventStream,
        downlist_rx: mpsc::Receiver<Contact>,
    ) {
        let mut tasks = self.core_tasks.lock();

        let ping_oldest = {
            let inner = self.clone();
            let mut rx = events.ping_oldest;
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    inner.handle_ping_oldest(event).await;
                }
            })
        };
        tasks.push(ping_oldest);

        let validate = {
            let inner = self.clone();
            let mut rx = events.validate_contact;
            tokio::spawn(async move {
                while let Some(contact) = rx.recv().await {
                    inner.handle_validate_contact(contact).await;
                }
            })
        };
        tasks.push(validate);

        let downlist = {
            let inner = self.clone();
            let mut rx = downlist_rx;
            tokio::spawn(async move {
                // Parks until a report arrives; leave drops nothing here,
                // the queue simply stays quiet while not joined.
                while let Some(contact) = rx.recv().await {
                    inner.handle_down_contact(contact).await;
                }
            })
        };
        tasks.push(downlist);
    }

    /// Full-bucket arbitration: probe the oldest entry; an answer keeps it
    /// and re-stamps its recency, silence evicts it in favour of the
    /// parked replacement.
    async fn handle_ping_oldest(&self, event: PingOldestEvent) {
        match self.rpc.ping(&event.oldest).await {
            Ok(rank_info) => {
                trace!(
                    oldest = %&event.oldest.node_id.to_hex()[..16],
                    "oldest contact answered, keeping it"
                );
                self.routing.add_contact(event.oldest, rank_info);
            }
            Err(err) => {
                debug!(
                    oldest = %&event.oldest.node_id.to_hex()[..16],
                    error = %err,
                    "oldest contact unresponsive, promoting replacement"
                );
                self.routing
                    .increment_failed_rpc_count(&event.oldest.node_id);
                self.routing
                    .increment_failed_rpc_count(&event.oldest.node_id);
                self.routing
                    .add_contact(event.replacement.clone(), event.replacement_rank_info);
                self.routing.set_validated(&event.replacement.node_id, true);
            }
        }
    }

    /// First-sight validation: check that the contact's key material
    /// re-derives its claimed ids.
    async fn handle_validate_contact(&self, contact: Contact) {
        self.securifier.learn_key(
            contact.public_key_id,
            contact.public_key.clone(),
            contact.signature.clone(),
        );
        let resolved = self
            .securifier
            .get_public_key_and_validation(&contact.public_key_id)
            .await;
        let valid = match resolved {
            Some(resolved) => {
                contact.node_id == contact.public_key_id
                    && self.securifier.validate(
                        b"",
                        b"",
                        &contact.public_key_id,
                        &resolved.public_key,
                        &resolved.validation,
                    )
            }
            None => false,
        };
        if !valid {
            debug!(contact = %&contact.node_id.to_hex()[..16], "contact failed validation");
        }
        self.routing.set_validated(&contact.node_id, valid);
    }

    /// A peer failed an RPC: record the failure, then probe once so a
    /// transient drop does not cost it its slot.
    async fn handle_down_contact(&self, contact: Contact) {
        self.routing.increment_failed_rpc_count(&contact.node_id);
        match self.rpc.ping(&contact).await {
            Ok(rank_info) => {
                self.routing.add_contact(contact, rank_info);
            }
            Err(_) => {
                self.routing.increment_failed_rpc_count(&contact.node_id);
            }
        }
    }

    /// Periodic republication of due records to their current k closest.
    async fn refresh_data_store(self: Arc<Self>) {
        let mut tick = tokio::time::interval(REFRESH_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if !self.joined.load(Ordering::SeqCst) {
                continue;
            }
            for candidate in self.store.refresh() {
                let contacts = match self.engine.find_nodes(candidate.kvs.key, &[]).await {
                    Ok(contacts) => contacts,
                    Err(err) => {
                        debug!(error = %err, "refresh lookup failed");
                        continue;
                    }
                };
                let own_id = self.keypair.node_id();
                let mut any_ok = false;
                for contact in contacts {
                    if contact.node_id == own_id {
                        continue;
                    }
                    let result = self
                        .rpc
                        .store_refresh(
                            &contact,
                            candidate.request_and_signature.0.clone(),
                            candidate.request_and_signature.1.clone(),
                        )
                        .await;
                    match result {
                        Ok(_) => any_ok = true,
                        Err(err) => {
                            if err.is_transport() {
                                self.handle_down_contact(contact).await;
                            }
                        }
                    }
                }
                self.store
                    .mark_refreshed(&candidate.kvs.key, &candidate.kvs.value, any_ok);
            }
        }
    }
}

/// A DHT node. Cheap to clone; all clones drive the same instance.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder() -> NodeBuilder {
        NodeBuilder::new()
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.keypair.node_id()
    }

    pub fn contact(&self) -> Contact {
        self.inner.contact.read().clone()
    }

    pub fn joined(&self) -> bool {
        self.inner.joined.load(Ordering::SeqCst)
    }

    pub fn k(&self) -> usize {
        self.inner.config.k
    }

    pub fn alpha(&self) -> usize {
        self.inner.config.alpha
    }

    pub fn beta(&self) -> usize {
        self.inner.config.beta
    }

    /// Sign a value with the node's key, producing the signature a
    /// [`store`](Self::store) of that value expects.
    pub fn sign(&self, value: &[u8]) -> Vec<u8> {
        self.inner.securifier.sign(value)
    }

    /// Join the overlay through the given bootstrap contacts.
    ///
    /// Bootstraps are tried nearest-first, one at a time, until one
    /// answers a FIND_NODE for this node's own id. A singleton bootstrap
    /// list naming this node itself founds a new network.
    pub async fn join(&self, bootstrap_contacts: Vec<Contact>) -> Result<(), DhtError> {
        if self.joined() {
            return Ok(());
        }
        if bootstrap_contacts.is_empty() {
            return Err(DhtError::NoBootstrapContacts);
        }
        if !self.inner.client_only && self.inner.transport.local_endpoint().is_none() {
            return Err(DhtError::ListenError("node has no listening endpoint".into()));
        }

        let own_id = self.node_id();
        if bootstrap_contacts.len() == 1 && bootstrap_contacts[0].node_id == own_id {
            info!("founding a new network");
            self.complete_join();
            return Ok(());
        }

        let mut sorted = bootstrap_contacts;
        sorted.sort_by(|a, b| {
            crate::identity::distance_cmp(
                &a.node_id.xor_distance(&own_id),
                &b.node_id.xor_distance(&own_id),
            )
        });

        for bootstrap in sorted {
            if bootstrap.node_id == own_id {
                continue;
            }
            match self.inner.engine.find_nodes(own_id, &[bootstrap.clone()]).await {
                Ok(found) => {
                    debug!(
                        via = %&bootstrap.node_id.to_hex()[..16],
                        learnt = found.len(),
                        "bootstrap lookup succeeded"
                    );
                    self.complete_join();
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        via = %&bootstrap.node_id.to_hex()[..16],
                        error = %err,
                        "bootstrap attempt failed"
                    );
                }
            }
        }
        Err(DhtError::NotEnoughContacts)
    }

    fn complete_join(&self) {
        self.inner.joined.store(true, Ordering::SeqCst);
        if !self.inner.client_only {
            self.inner.service.set_node_joined(true);
            let refresher = tokio::spawn(self.inner.clone().refresh_data_store());
            self.inner.joined_tasks.lock().push(refresher);
        }
        info!(node = %&self.node_id().to_hex()[..16], "joined the overlay");
    }

    /// Leave the overlay. Stops serving and republication and returns the
    /// surviving contacts as hints for a future join. Lookups still in
    /// flight are abandoned to their timeouts.
    pub async fn leave(&self) -> Vec<Contact> {
        self.inner.joined.store(false, Ordering::SeqCst);
        self.inner.service.set_node_joined(false);
        for task in self.inner.joined_tasks.lock().drain(..) {
            task.abort();
        }
        let hints = self.inner.routing.get_bootstrap_contacts();
        info!(hints = hints.len(), "left the overlay");
        hints
    }

    /// Stop everything, including the transport. The node cannot be
    /// reused afterwards.
    pub async fn shutdown(&self) {
        self.leave().await;
        for task in self.inner.core_tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.transport.stop_listening().await;
    }

    // ------------------------------------------------------------------
    // DHT operations
    // ------------------------------------------------------------------

    /// Converge on the k closest live contacts to `target`.
    pub async fn find_nodes(&self, target: NodeId) -> Result<Vec<Contact>, DhtError> {
        self.inner.engine.find_nodes(target, &[]).await
    }

    /// Look up values under `key`.
    pub async fn find_value(&self, key: NodeId) -> Result<FindValueResult, DhtError> {
        self.inner.engine.find_value(key).await
    }

    /// Replicate a signed value; resolves with the confirmed replica
    /// count once the quorum is reached.
    pub async fn store(
        &self,
        key: NodeId,
        value: Vec<u8>,
        signature: Vec<u8>,
        ttl: Duration,
    ) -> Result<usize, DhtError> {
        let kvs = KeyValueSignature {
            key,
            value,
            signature,
        };
        self.inner.engine.store(kvs, ttl).await
    }

    /// Tombstone a signed value across its replica set.
    pub async fn delete(
        &self,
        key: NodeId,
        value: Vec<u8>,
        signature: Vec<u8>,
    ) -> Result<usize, DhtError> {
        let kvs = KeyValueSignature {
            key,
            value,
            signature,
        };
        self.inner.engine.delete(kvs).await
    }

    /// Replace one signed value with another across the replica set.
    #[allow(clippy::too_many_arguments)]
    pub async fn update(
        &self,
        key: NodeId,
        new_value: Vec<u8>,
        new_signature: Vec<u8>,
        old_value: Vec<u8>,
        old_signature: Vec<u8>,
        ttl: Duration,
    ) -> Result<usize, DhtError> {
        let new_kvs = KeyValueSignature {
            key,
            value: new_value,
            signature: new_signature,
        };
        let old_kvs = KeyValueSignature {
            key,
            value: old_value,
            signature: old_signature,
        };
        self.inner.engine.update(new_kvs, old_kvs, ttl).await
    }

    /// Locate a specific node by id: a FIND_NODE whose delivered set is
    /// scanned for an exact match.
    pub async fn get_contact(&self, node_id: NodeId) -> Result<Contact, DhtError> {
        let closest = self.inner.engine.find_nodes(node_id, &[]).await?;
        closest
            .into_iter()
            .find(|c| c.node_id == node_id)
            .ok_or(DhtError::KeyNotFound)
    }

    /// Probe one peer directly.
    pub async fn ping(&self, contact: &Contact) -> Result<(), DhtError> {
        self.inner.rpc.ping(contact).await.map(|_| ())
    }

    /// Contacts suitable as bootstrap hints, most recently seen first.
    pub fn bootstrap_hints(&self) -> Vec<Contact> {
        self.inner.routing.get_bootstrap_contacts()
    }

    /// Number of validated contacts currently routable.
    pub fn known_contacts(&self) -> usize {
        self.inner.routing.contact_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_requires_bootstrap_contacts() {
        let node = Node::builder()
            .listen("127.0.0.1:0".parse().unwrap())
            .build()
            .await
            .unwrap();
        let err = node.join(Vec::new()).await.unwrap_err();
        assert_eq!(err, DhtError::NoBootstrapContacts);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn founder_join_skips_the_lookup() {
        let node = Node::builder()
            .listen("127.0.0.1:0".parse().unwrap())
            .build()
            .await
            .unwrap();
        node.join(vec![node.contact()]).await.unwrap();
        assert!(node.joined());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn join_fails_when_all_bootstraps_are_dead() {
        let node = Node::builder()
            .listen("127.0.0.1:0".parse().unwrap())
            .build()
            .await
            .unwrap();
        let ghost_keypair = Keypair::from_seed([42u8; 32]);
        let ghost = Contact::new(&ghost_keypair, "127.0.0.1:9".parse().unwrap(), vec![]);
        let err = node.join(vec![ghost]).await.unwrap_err();
        assert_eq!(err, DhtError::NotEnoughContacts);
        assert!(!node.joined());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn leave_returns_hints_and_stops_serving() {
        let node = Node::builder()
            .listen("127.0.0.1:0".parse().unwrap())
            .build()
            .await
            .unwrap();
        node.join(vec![node.contact()]).await.unwrap();
        let hints = node.leave().await;
        assert!(hints.is_empty());
        assert!(!node.joined());
        node.shutdown().await;
    }
}
