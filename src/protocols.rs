//! Capability traits at the seams between components.
//!
//! The lookup engine and coordinator depend on these traits rather than on
//! the concrete RPC stack, so tests drive them with an in-memory network
//! and alternative storage backends plug in without inheritance.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DhtError;
use crate::identity::{Contact, NodeId};
use crate::routing::RankInfo;
use crate::store::KeyValueSignature;

/// What a FIND_VALUE returned from one peer.
#[derive(Clone, Debug, Default)]
pub struct FindValueReply {
    pub values: Vec<KeyValueSignature>,
    pub closer: Vec<Contact>,
    pub alternative_store_holder: Option<Contact>,
    pub rank_info: RankInfo,
}

/// Client-side DHT RPC operations.
///
/// Every call is one request/response exchange with a deadline; a timeout
/// or transport failure surfaces as a transport-kind [`DhtError`] and the
/// peer should be treated as down. Successful calls return the transport
/// quality observed for the exchange.
#[async_trait]
pub trait NodeRpc: Send + Sync + 'static {
    /// Liveness probe.
    async fn ping(&self, to: &Contact) -> Result<RankInfo, DhtError>;

    /// Ask a peer for its k closest contacts to `target`.
    async fn find_nodes(
        &self,
        to: &Contact,
        target: NodeId,
    ) -> Result<(Vec<Contact>, RankInfo), DhtError>;

    /// Ask a peer for values under `key`, or failing that closer contacts.
    async fn find_value(&self, to: &Contact, key: NodeId) -> Result<FindValueReply, DhtError>;

    /// Store a signed value on a peer.
    async fn store(
        &self,
        to: &Contact,
        kvs: KeyValueSignature,
        ttl: Duration,
    ) -> Result<RankInfo, DhtError>;

    /// Tombstone a signed value on a peer.
    async fn delete(&self, to: &Contact, kvs: KeyValueSignature) -> Result<RankInfo, DhtError>;

    /// Forward an original store request for republication.
    async fn store_refresh(
        &self,
        to: &Contact,
        original_request: Vec<u8>,
        original_signature: Vec<u8>,
    ) -> Result<RankInfo, DhtError>;
}

/// Storage a node holds outside the DHT record store (a blob cache, a
/// filesystem index). FIND_VALUE consults it so the node can advertise
/// itself as a holder without copying data into the record store.
pub trait AlternativeStore: Send + Sync {
    fn has(&self, key: &NodeId) -> bool;
}
