//! XOR-metric routing table: splitting k-buckets with replacement caches.
//!
//! Contacts are grouped by the length of the id prefix they share with the
//! holder. One bucket initially covers the whole keyspace; when the bucket
//! containing the holder's own range fills up it splits, so the table grows
//! deeper only around the holder where resolution matters.
//!
//! The table never performs I/O. Anything that needs the network (probing
//! the oldest entry of a full bucket, validating a first-seen contact) is
//! emitted as an event on a channel bound at construction; the coordinator
//! consumes those events and calls back in with the verdict.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::{distance_cmp, Contact, NodeId, NODE_ID_BITS, NODE_ID_LEN};

/// Default replication / closeness factor.
pub const DEFAULT_K: usize = 16;

/// Failed RPCs tolerated before a contact is dropped from its bucket. One
/// failure is forgiven; the unanswered probe of a ping-oldest round counts
/// twice and evicts.
pub const FAILED_RPC_TOLERANCE: u8 = 1;

/// Depth of the outbound event queues.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Transport-level quality information carried alongside a contact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RankInfo {
    pub rtt_ms: Option<u32>,
}

/// A live, validated entry in a bucket.
#[derive(Clone, Debug)]
pub struct RoutingTableEntry {
    pub contact: Contact,
    /// Common-prefix length between the contact and the holder, in bits.
    pub distance_to_holder: usize,
    pub rank_info: RankInfo,
    /// Failures since the last successful exchange.
    pub failed_rpc_count: u8,
    pub last_seen: Instant,
}

/// Emitted when a full, unsplittable bucket receives a new contact: the
/// coordinator pings `oldest` and decides which of the two survives.
#[derive(Clone, Debug)]
pub struct PingOldestEvent {
    pub oldest: Contact,
    pub replacement: Contact,
    pub replacement_rank_info: RankInfo,
}

/// Receiving ends of the table's outbound events.
pub struct RoutingTableEventStream {
    pub ping_oldest: mpsc::Receiver<PingOldestEvent>,
    pub validate_contact: mpsc::Receiver<Contact>,
}

struct EventSinks {
    ping_oldest: mpsc::Sender<PingOldestEvent>,
    validate_contact: mpsc::Sender<Contact>,
}

enum Outbound {
    PingOldest(PingOldestEvent),
    Validate(Contact),
}

// ============================================================================
// Buckets
// ============================================================================

struct KBucket {
    /// Inclusive lower bound of covered common-prefix lengths.
    low: usize,
    /// Exclusive upper bound.
    high: usize,
    /// Oldest-first; a refreshed entry moves to the back.
    entries: Vec<RoutingTableEntry>,
    /// Contacts waiting for a slot, newest at the back.
    cache: VecDeque<(Contact, RankInfo)>,
}

impl KBucket {
    fn new(low: usize, high: usize) -> Self {
        Self {
            low,
            high,
            entries: Vec::new(),
            cache: VecDeque::new(),
        }
    }

    fn covers(&self, prefix: usize) -> bool {
        self.low <= prefix && prefix < self.high
    }

    /// The holder's own prefix (all bits shared) always lands in the
    /// deepest bucket; only that bucket may split.
    fn covers_holder(&self) -> bool {
        self.high > NODE_ID_BITS
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.contact.node_id == *id)
    }
}

struct Inner {
    buckets: Vec<KBucket>,
    /// First-seen contacts awaiting key validation.
    pending: HashMap<NodeId, (Contact, RankInfo)>,
}

/// The routing table proper. All operations are bounded-time and lock-only;
/// events carry anything that needs the network.
pub struct RoutingTable {
    holder: NodeId,
    k: usize,
    inner: RwLock<Inner>,
    sinks: EventSinks,
}

impl RoutingTable {
    /// Build a table for `holder` with bucket capacity `k`. Returns the
    /// table and the receiving ends of its event channels.
    pub fn new(holder: NodeId, k: usize) -> (Self, RoutingTableEventStream) {
        let (ping_tx, ping_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let (validate_tx, validate_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let table = Self {
            holder,
            k,
            inner: RwLock::new(Inner {
                buckets: vec![KBucket::new(0, NODE_ID_BITS + 1)],
                pending: HashMap::new(),
            }),
            sinks: EventSinks {
                ping_oldest: ping_tx,
                validate_contact: validate_tx,
            },
        };
        (
            table,
            RoutingTableEventStream {
                ping_oldest: ping_rx,
                validate_contact: validate_rx,
            },
        )
    }

    pub fn holder(&self) -> NodeId {
        self.holder
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Admit a contact. Known contacts are refreshed in place; first-seen
    /// contacts go through the validation pipeline before becoming
    /// routable.
    pub fn add_contact(&self, contact: Contact, rank_info: RankInfo) {
        if contact.node_id == self.holder || contact.node_id.is_zero() {
            return;
        }
        let event = {
            let mut inner = self.inner.write();
            self.admit(&mut inner, contact, rank_info)
        };
        self.emit(event);
    }

    /// Deliver the verdict of the validation pipeline. `true` promotes the
    /// pending contact into its bucket; `false` discards it. A `false` for
    /// an already-live contact evicts it.
    pub fn set_validated(&self, id: &NodeId, valid: bool) {
        let event = {
            let mut inner = self.inner.write();
            let pending = inner.pending.remove(id);
            if !valid {
                if let Some(bucket) = bucket_for_mut(&mut inner.buckets, &self.holder, id) {
                    if let Some(pos) = bucket.position(id) {
                        bucket.entries.remove(pos);
                        debug!(id = %&id.to_hex()[..16], "dropped invalidated contact");
                    }
                }
                None
            } else if let Some((contact, rank_info)) = pending {
                self.insert_validated(&mut inner, contact, rank_info)
            } else {
                None
            }
        };
        self.emit(event);
    }

    /// Record one more failed RPC against a contact. Past the tolerance the
    /// contact is evicted and the freshest replacement-cache entry takes
    /// its slot.
    pub fn increment_failed_rpc_count(&self, id: &NodeId) {
        let mut inner = self.inner.write();
        let Some(bucket) = bucket_for_mut(&mut inner.buckets, &self.holder, id) else {
            return;
        };
        let Some(pos) = bucket.position(id) else {
            return;
        };
        bucket.entries[pos].failed_rpc_count += 1;
        if bucket.entries[pos].failed_rpc_count <= FAILED_RPC_TOLERANCE {
            return;
        }
        let evicted = bucket.entries.remove(pos);
        trace!(
            id = %&evicted.contact.node_id.to_hex()[..16],
            failures = evicted.failed_rpc_count,
            "evicted unresponsive contact"
        );
        if let Some((contact, rank_info)) = bucket.cache.pop_back() {
            let distance = self.holder.common_prefix_bits(&contact.node_id);
            bucket.entries.push(RoutingTableEntry {
                contact,
                distance_to_holder: distance,
                rank_info,
                failed_rpc_count: 0,
                last_seen: Instant::now(),
            });
        }
    }

    /// The `count` validated contacts closest to `target`, excluding any in
    /// `excludes`, ascending by XOR distance.
    pub fn get_close_contacts(
        &self,
        target: &NodeId,
        count: usize,
        excludes: &[NodeId],
    ) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        struct Ranked {
            dist: [u8; NODE_ID_LEN],
            contact: Contact,
        }
        impl PartialEq for Ranked {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }
        impl Eq for Ranked {}
        impl Ord for Ranked {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }
        impl PartialOrd for Ranked {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let inner = self.inner.read();
        let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(count + 1);
        for bucket in &inner.buckets {
            for entry in &bucket.entries {
                if excludes.contains(&entry.contact.node_id) {
                    continue;
                }
                let dist = entry.contact.node_id.xor_distance(target);
                if heap.len() < count {
                    heap.push(Ranked {
                        dist,
                        contact: entry.contact.clone(),
                    });
                } else if let Some(worst) = heap.peek() {
                    if distance_cmp(&dist, &worst.dist) == std::cmp::Ordering::Less {
                        heap.push(Ranked {
                            dist,
                            contact: entry.contact.clone(),
                        });
                        heap.pop();
                    }
                }
            }
        }
        let mut ranked: Vec<Ranked> = heap.into_vec();
        ranked.sort_by(|a, b| distance_cmp(&a.dist, &b.dist));
        ranked.into_iter().map(|r| r.contact).collect()
    }

    /// Exact lookup by id among validated contacts.
    pub fn get_contact(&self, id: &NodeId) -> Option<Contact> {
        let inner = self.inner.read();
        bucket_for(&inner.buckets, &self.holder, id)
            .and_then(|b| b.position(id).map(|pos| b.entries[pos].contact.clone()))
    }

    pub fn update_rank_info(&self, id: &NodeId, rank_info: RankInfo) {
        let mut inner = self.inner.write();
        if let Some(bucket) = bucket_for_mut(&mut inner.buckets, &self.holder, id) {
            if let Some(pos) = bucket.position(id) {
                bucket.entries[pos].rank_info = rank_info;
            }
        }
    }

    pub fn get_local_rank_info(&self, id: &NodeId) -> Option<RankInfo> {
        let inner = self.inner.read();
        bucket_for(&inner.buckets, &self.holder, id)
            .and_then(|b| b.position(id).map(|pos| b.entries[pos].rank_info))
    }

    pub fn get_all_contacts(&self) -> Vec<Contact> {
        let inner = self.inner.read();
        inner
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.contact.clone()))
            .collect()
    }

    /// Contacts worth persisting as hints for a future join: every live
    /// contact, most recently seen first.
    pub fn get_bootstrap_contacts(&self) -> Vec<Contact> {
        let inner = self.inner.read();
        let mut entries: Vec<&RoutingTableEntry> = inner
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .collect();
        entries.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        entries.into_iter().map(|e| e.contact.clone()).collect()
    }

    pub fn contact_count(&self) -> usize {
        let inner = self.inner.read();
        inner.buckets.iter().map(|b| b.entries.len()).sum()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn admit(&self, inner: &mut Inner, contact: Contact, rank_info: RankInfo) -> Option<Outbound> {
        let id = contact.node_id;
        if let Some(bucket) = bucket_for_mut(&mut inner.buckets, &self.holder, &id) {
            if let Some(pos) = bucket.position(&id) {
                // Known and live: re-stamp recency, forget past failures.
                let mut entry = bucket.entries.remove(pos);
                entry.contact = contact;
                entry.rank_info = rank_info;
                entry.failed_rpc_count = 0;
                entry.last_seen = Instant::now();
                bucket.entries.push(entry);
                return None;
            }
        }
        if let Some(slot) = inner.pending.get_mut(&id) {
            slot.1 = rank_info;
            return None;
        }
        inner.pending.insert(id, (contact.clone(), rank_info));
        Some(Outbound::Validate(contact))
    }

    fn insert_validated(
        &self,
        inner: &mut Inner,
        contact: Contact,
        rank_info: RankInfo,
    ) -> Option<Outbound> {
        let prefix = self.holder.common_prefix_bits(&contact.node_id);
        loop {
            let idx = inner
                .buckets
                .iter()
                .position(|b| b.covers(prefix))
                .expect("bucket ranges cover the keyspace");
            let bucket = &mut inner.buckets[idx];

            if bucket.position(&contact.node_id).is_some() {
                return None;
            }
            if bucket.entries.len() < self.k {
                bucket.entries.push(RoutingTableEntry {
                    contact,
                    distance_to_holder: prefix,
                    rank_info,
                    failed_rpc_count: 0,
                    last_seen: Instant::now(),
                });
                return None;
            }
            if bucket.covers_holder() && bucket.high - bucket.low > 1 {
                self.split_bucket(inner, idx);
                continue;
            }

            // Full and unsplittable: park the newcomer in the replacement
            // cache and ask the coordinator to probe the oldest entry.
            let oldest = bucket
                .entries
                .first()
                .expect("full bucket has entries")
                .contact
                .clone();
            bucket
                .cache
                .retain(|(cached, _)| cached.node_id != contact.node_id);
            bucket.cache.push_back((contact.clone(), rank_info));
            while bucket.cache.len() > self.k {
                bucket.cache.pop_front();
            }
            return Some(Outbound::PingOldest(PingOldestEvent {
                oldest,
                replacement: contact,
                replacement_rank_info: rank_info,
            }));
        }
    }

    fn split_bucket(&self, inner: &mut Inner, idx: usize) {
        let (low, high) = (inner.buckets[idx].low, inner.buckets[idx].high);
        let old = std::mem::replace(&mut inner.buckets[idx], KBucket::new(low, low + 1));
        let mut deeper = KBucket::new(low + 1, high);

        for entry in old.entries {
            if entry.distance_to_holder > low {
                deeper.entries.push(entry);
            } else {
                inner.buckets[idx].entries.push(entry);
            }
        }
        for (cached, rank) in old.cache {
            let prefix = self.holder.common_prefix_bits(&cached.node_id);
            if prefix > low {
                deeper.cache.push_back((cached, rank));
            } else {
                inner.buckets[idx].cache.push_back((cached, rank));
            }
        }
        trace!(low, high, "split bucket");
        inner.buckets.insert(idx + 1, deeper);
    }

    fn emit(&self, event: Option<Outbound>) {
        match event {
            Some(Outbound::PingOldest(ev)) => {
                if self.sinks.ping_oldest.try_send(ev).is_err() {
                    debug!("ping-oldest event queue full, dropping");
                }
            }
            Some(Outbound::Validate(contact)) => {
                if self.sinks.validate_contact.try_send(contact).is_err() {
                    debug!("validate-contact event queue full, dropping");
                }
            }
            None => {}
        }
    }
}

fn bucket_for<'a>(buckets: &'a [KBucket], holder: &NodeId, id: &NodeId) -> Option<&'a KBucket> {
    let prefix = holder.common_prefix_bits(id);
    buckets.iter().find(|b| b.covers(prefix))
}

fn bucket_for_mut<'a>(
    buckets: &'a mut [KBucket],
    holder: &NodeId,
    id: &NodeId,
) -> Option<&'a mut KBucket> {
    let prefix = holder.common_prefix_bits(id);
    buckets.iter_mut().find(|b| b.covers(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NODE_ID_LEN;

    fn contact_with_id(id: NodeId) -> Contact {
        let kp = crate::identity::Keypair::from_seed([9u8; 32]);
        Contact {
            node_id: id,
            primary_endpoint: "127.0.0.1:4000".parse().unwrap(),
            local_endpoints: vec![],
            rendezvous_endpoint: None,
            public_key_id: id,
            public_key: kp.public_key().to_vec(),
            signature: kp.key_validation(),
        }
    }

    fn id_with_prefix_byte(first: u8, tag: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = first;
        bytes[NODE_ID_LEN - 1] = tag;
        NodeId::from_bytes(bytes)
    }

    /// Admit and immediately validate, draining the validate queue.
    fn add_validated(table: &RoutingTable, contact: Contact) {
        let id = contact.node_id;
        table.add_contact(contact, RankInfo::default());
        table.set_validated(&id, true);
    }

    fn holder_zero() -> NodeId {
        NodeId::zero()
    }

    #[test]
    fn starts_with_one_bucket_covering_everything() {
        let (table, _events) = RoutingTable::new(holder_zero(), 4);
        assert_eq!(table.inner.read().buckets.len(), 1);
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn validation_pipeline_gates_routability() {
        let (table, mut events) = RoutingTable::new(holder_zero(), 4);
        let contact = contact_with_id(id_with_prefix_byte(0x80, 1));
        let id = contact.node_id;

        table.add_contact(contact, RankInfo::default());
        // Not routable until validated.
        assert!(table.get_contact(&id).is_none());
        let seen = events.validate_contact.try_recv().expect("validate event");
        assert_eq!(seen.node_id, id);

        table.set_validated(&id, true);
        assert!(table.get_contact(&id).is_some());

        table.set_validated(&id, false);
        assert!(table.get_contact(&id).is_none());
    }

    #[test]
    fn invalid_verdict_discards_pending_contact() {
        let (table, _events) = RoutingTable::new(holder_zero(), 4);
        let contact = contact_with_id(id_with_prefix_byte(0x80, 2));
        let id = contact.node_id;
        table.add_contact(contact, RankInfo::default());
        table.set_validated(&id, false);
        assert!(table.get_contact(&id).is_none());
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn full_holder_bucket_splits_instead_of_evicting() {
        let k = 2;
        let (table, mut events) = RoutingTable::new(holder_zero(), k);
        // Prefix 0 (first bit set) and prefix >= 1 contacts.
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x80, 1)));
        add_validated(&table, contact_with_id(id_with_prefix_byte(0xC0, 2)));
        // Third insertion with a deeper prefix forces a split rather than a
        // ping-oldest event.
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x40, 3)));
        assert!(events.ping_oldest.try_recv().is_err());
        assert!(table.inner.read().buckets.len() > 1);
        assert_eq!(table.contact_count(), 3);
    }

    #[test]
    fn full_far_bucket_emits_ping_oldest() {
        let k = 2;
        let (table, mut events) = RoutingTable::new(holder_zero(), k);
        // Force a split so the prefix-0 bucket is no longer the holder's.
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x80, 1)));
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x81, 2)));
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x40, 3)));
        while events.ping_oldest.try_recv().is_ok() {}

        // The prefix-0 bucket now holds ids 1 and 2; a third prefix-0
        // contact cannot split it again.
        let replacement = contact_with_id(id_with_prefix_byte(0x82, 4));
        add_validated(&table, replacement.clone());

        let ev = events.ping_oldest.try_recv().expect("ping-oldest event");
        assert_eq!(ev.oldest.node_id, id_with_prefix_byte(0x80, 1));
        assert_eq!(ev.replacement.node_id, replacement.node_id);
        // The newcomer is parked, not inserted.
        assert!(table.get_contact(&replacement.node_id).is_none());
    }

    #[test]
    fn eviction_promotes_replacement_from_cache() {
        let k = 2;
        let (table, _events) = RoutingTable::new(holder_zero(), k);
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x80, 1)));
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x81, 2)));
        add_validated(&table, contact_with_id(id_with_prefix_byte(0x40, 3)));
        let replacement = contact_with_id(id_with_prefix_byte(0x82, 4));
        add_validated(&table, replacement.clone());

        let oldest = id_with_prefix_byte(0x80, 1);
        for _ in 0..=FAILED_RPC_TOLERANCE {
            table.increment_failed_rpc_count(&oldest);
        }
        assert!(table.get_contact(&oldest).is_none());
        assert!(table.get_contact(&replacement.node_id).is_some());
    }

    #[test]
    fn readd_resets_failed_count_and_restamps_recency() {
        let (table, _events) = RoutingTable::new(holder_zero(), 4);
        let contact = contact_with_id(id_with_prefix_byte(0x80, 1));
        add_validated(&table, contact.clone());
        table.increment_failed_rpc_count(&contact.node_id);
        table.add_contact(contact.clone(), RankInfo { rtt_ms: Some(12) });

        let inner = table.inner.read();
        let entry = inner
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter())
            .find(|e| e.contact.node_id == contact.node_id)
            .expect("entry");
        assert_eq!(entry.failed_rpc_count, 0);
        assert_eq!(entry.rank_info.rtt_ms, Some(12));
    }

    #[test]
    fn close_contacts_match_brute_force() {
        let k = 8;
        let (table, _events) = RoutingTable::new(NodeId::random(), k);
        let mut all = Vec::new();
        for _ in 0..64 {
            let contact = contact_with_id(NodeId::random());
            all.push(contact.node_id);
            add_validated(&table, contact);
        }

        let target = NodeId::random();
        let got = table.get_close_contacts(&target, k, &[]);
        assert_eq!(got.len(), k);

        let mut expected = all.clone();
        expected.sort_by(|a, b| distance_cmp(&a.xor_distance(&target), &b.xor_distance(&target)));
        let expected: Vec<NodeId> = expected.into_iter().take(k).collect();
        let got_ids: Vec<NodeId> = got.iter().map(|c| c.node_id).collect();
        assert_eq!(got_ids, expected);
    }

    #[test]
    fn close_contacts_honor_excludes() {
        let (table, _events) = RoutingTable::new(holder_zero(), 4);
        let a = contact_with_id(id_with_prefix_byte(0x80, 1));
        let b = contact_with_id(id_with_prefix_byte(0x40, 2));
        add_validated(&table, a.clone());
        add_validated(&table, b.clone());

        let got = table.get_close_contacts(&a.node_id, 4, &[a.node_id]);
        assert!(!got.iter().any(|c| c.node_id == a.node_id));
        assert!(got.iter().any(|c| c.node_id == b.node_id));
    }

    #[test]
    fn holder_and_zero_ids_are_never_admitted() {
        let holder = NodeId::random();
        let (table, _events) = RoutingTable::new(holder, 4);
        table.add_contact(contact_with_id(holder), RankInfo::default());
        table.add_contact(contact_with_id(NodeId::zero()), RankInfo::default());
        assert_eq!(table.contact_count(), 0);
        assert!(table.inner.read().pending.is_empty());
    }

    #[test]
    fn bootstrap_contacts_are_recency_ordered() {
        let (table, _events) = RoutingTable::new(holder_zero(), 8);
        let a = contact_with_id(id_with_prefix_byte(0x80, 1));
        let b = contact_with_id(id_with_prefix_byte(0x40, 2));
        add_validated(&table, a.clone());
        add_validated(&table, b.clone());
        // Re-add `a` so it becomes the most recent.
        table.add_contact(a.clone(), RankInfo::default());

        let hints = table.get_bootstrap_contacts();
        assert_eq!(hints.first().map(|c| c.node_id), Some(a.node_id));
        assert_eq!(hints.len(), 2);
    }
}
