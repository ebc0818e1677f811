//! # Kelpie - Kademlia DHT with signed records
//!
//! Kelpie is a peer-to-peer distributed hash table. Peers form an overlay
//! keyed by random 512-bit identifiers; signed `(key, value, ttl)` records
//! are replicated across the k XOR-closest live peers to each key and
//! located by an iterative, α-parallel lookup.
//!
//! ## Architecture
//!
//! Components communicate through typed channels and capability traits:
//! the routing table and data store emit events rather than performing
//! I/O, the lookup engine drives a [`protocols::NodeRpc`] implementation,
//! and the coordinator owns the background workers that tie them together.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API: lifecycle, workers, DHT operations |
//! | `identity` | Node ids, keypairs, contacts, XOR distance |
//! | `securifier` | Signing, verification, public-key resolution |
//! | `routing` | Splitting k-buckets with replacement caches |
//! | `store` | Signed records, tombstones, refresh queue |
//! | `lookup` | Iterative α/β search and mutation fan-out |
//! | `service` | Inbound RPC validation and dispatch |
//! | `rpc` | Outbound RPC with correlation and deadlines |
//! | `transport` | Sequenced, acknowledged UDP datagrams |
//! | `window` | Sliding window over the 32-bit sequence space |
//! | `messages` | Wire envelopes and bounded serialization |
//! | `protocols` | Capability traits between components |
//! | `error` | Stable error taxonomy |

pub mod error;
pub mod identity;
pub mod lookup;
pub mod messages;
pub mod node;
pub mod protocols;
pub mod routing;
pub mod rpc;
pub mod securifier;
pub mod service;
pub mod store;
pub mod transport;
pub mod window;

pub use error::DhtError;
pub use identity::{Contact, Keypair, NodeId, NODE_ID_BITS, NODE_ID_LEN};
pub use lookup::{FindValueResult, LookupConfig, DEFAULT_ALPHA, DEFAULT_BETA};
pub use node::{Node, NodeBuilder};
pub use routing::DEFAULT_K;
pub use store::KeyValueSignature;
