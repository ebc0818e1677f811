//! Iterative lookup engine: α-parallel convergent search plus the fan-out
//! phase of the mutating operations.
//!
//! A lookup owns a candidate set seeded from the routing table. Each
//! iteration picks the α closest untried candidates, marks them in-flight
//! and dispatches RPCs; the next iteration launches as soon as no more than
//! `α - β` of the current round are still pending, so one slow peer cannot
//! stall the search. The lookup completes when the k closest known
//! candidates have all been tried and nothing is in flight.
//!
//! STORE, DELETE and UPDATE run the same search first, then fan their
//! mutation out to every delivered contact and count successes against a
//! `3k/4` quorum. A failed store fans compensating deletes back out to
//! the destinations that did store, so no stranded replicas survive a
//! reported failure.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::error::DhtError;
use crate::identity::{Contact, NodeId, NODE_ID_LEN};
use crate::protocols::NodeRpc;
use crate::routing::{RankInfo, RoutingTable};
use crate::store::KeyValueSignature;

/// Default lookup parallelism.
pub const DEFAULT_ALPHA: usize = 3;
/// Default early-termination count; an iteration advances once no more
/// than `alpha - beta` of its probes are still pending.
pub const DEFAULT_BETA: usize = 2;

/// Progress of one candidate within a lookup. A candidate only ever moves
/// forward: `New → SelectedAlpha → {Contacted, Down}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SearchState {
    New,
    SelectedAlpha,
    Contacted,
    Down,
}

impl SearchState {
    /// Terminal states compare as siblings: neither outranks the other.
    fn rank(self) -> u8 {
        match self {
            SearchState::New => 0,
            SearchState::SelectedAlpha => 1,
            SearchState::Contacted | SearchState::Down => 2,
        }
    }
}

/// Lookup parameters, fixed at node construction.
#[derive(Clone, Copy, Debug)]
pub struct LookupConfig {
    pub k: usize,
    pub alpha: usize,
    pub beta: usize,
    /// Success quorum for mutating operations.
    pub threshold: usize,
}

impl LookupConfig {
    pub fn new(k: usize, alpha: usize, beta: usize) -> Self {
        assert!(k >= 1, "k must be positive");
        assert!(alpha >= 1, "alpha must be positive");
        assert!(beta >= 1 && beta <= alpha, "beta must be in 1..=alpha");
        Self {
            k,
            alpha,
            beta,
            threshold: ((k * 3) / 4).max(1),
        }
    }
}

/// Outcome of a FIND_VALUE lookup.
#[derive(Clone, Debug)]
pub enum FindValueResult {
    /// At least one peer returned values; the search stopped there.
    Found {
        values: Vec<KeyValueSignature>,
        closest: Vec<Contact>,
        alternative_store_holder: Option<Contact>,
    },
    /// The search converged without finding the key.
    Closest {
        contacts: Vec<Contact>,
        alternative_store_holder: Option<Contact>,
    },
}

// ============================================================================
// Candidate set
// ============================================================================

struct Candidate {
    contact: Contact,
    state: SearchState,
    round: u32,
}

/// Candidates of one lookup, indexed by id and iterable in distance order.
///
/// The distance index is keyed by the XOR distance alone: distances to a
/// fixed target are unique per id, and distance never changes, so state
/// transitions never disturb the ordering.
struct CandidateSet {
    target: NodeId,
    by_id: HashMap<NodeId, Candidate>,
    by_distance: BTreeMap<[u8; NODE_ID_LEN], NodeId>,
}

impl CandidateSet {
    fn new(target: NodeId) -> Self {
        Self {
            target,
            by_id: HashMap::new(),
            by_distance: BTreeMap::new(),
        }
    }

    /// Insert as `New`; ignored when the candidate is already tracked.
    fn insert_new(&mut self, contact: Contact) {
        let id = contact.node_id;
        if id.is_zero() || self.by_id.contains_key(&id) {
            return;
        }
        self.by_distance.insert(id.xor_distance(&self.target), id);
        self.by_id.insert(
            id,
            Candidate {
                contact,
                state: SearchState::New,
                round: 0,
            },
        );
    }

    /// Insert already in-flight; the mutation fan-out starts all its
    /// destinations this way.
    fn insert_selected(&mut self, contact: Contact) {
        self.insert_new(contact.clone());
        if let Some(candidate) = self.by_id.get_mut(&contact.node_id) {
            candidate.state = SearchState::SelectedAlpha;
        }
    }

    /// Advance a candidate's state. Transitions only move forward and the
    /// first terminal state sticks, so a late duplicate response cannot
    /// demote or resurrect a candidate.
    fn mark(&mut self, id: &NodeId, state: SearchState) {
        if let Some(candidate) = self.by_id.get_mut(id) {
            if state.rank() > candidate.state.rank() {
                candidate.state = state;
            }
        }
    }

    /// Select up to `alpha` `New` candidates in ascending distance, mark
    /// them in-flight and stamp them with `round`.
    fn select_alpha(&mut self, alpha: usize, round: u32) -> Vec<Contact> {
        let ids: Vec<NodeId> = self
            .by_distance
            .values()
            .filter(|id| self.by_id[*id].state == SearchState::New)
            .take(alpha)
            .copied()
            .collect();
        ids.iter()
            .map(|id| {
                let candidate = self.by_id.get_mut(id).expect("selected id tracked");
                candidate.state = SearchState::SelectedAlpha;
                candidate.round = round;
                candidate.contact.clone()
            })
            .collect()
    }

    fn count_state(&self, state: SearchState) -> usize {
        self.by_id.values().filter(|c| c.state == state).count()
    }

    fn pending_in_round(&self, round: u32) -> usize {
        self.by_id
            .values()
            .filter(|c| c.state == SearchState::SelectedAlpha && c.round == round)
            .count()
    }

    /// Among the k closest non-`Down` candidates: how many are untried,
    /// and how many there are at all.
    fn top_k_counts(&self, k: usize) -> (usize, usize) {
        let mut new_in_top = 0;
        let mut candidates_in_top = 0;
        for id in self.by_distance.values() {
            if candidates_in_top >= k {
                break;
            }
            let state = self.by_id[id].state;
            if state == SearchState::New {
                new_in_top += 1;
            }
            if state != SearchState::Down {
                candidates_in_top += 1;
            }
        }
        (new_in_top, candidates_in_top)
    }

    /// Up to `k` contacted candidates, closest first.
    fn closest_contacted(&self, k: usize) -> Vec<Contact> {
        self.by_distance
            .values()
            .filter(|id| self.by_id[*id].state == SearchState::Contacted)
            .take(k)
            .map(|id| self.by_id[id].contact.clone())
            .collect()
    }

    fn contacts_in_state(&self, state: SearchState) -> Vec<Contact> {
        self.by_distance
            .values()
            .filter(|id| self.by_id[*id].state == state)
            .map(|id| self.by_id[id].contact.clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Drives all iterative operations against a [`NodeRpc`] implementation.
pub struct LookupEngine<N: NodeRpc> {
    rpc: Arc<N>,
    routing: Arc<RoutingTable>,
    config: LookupConfig,
    report_down: mpsc::Sender<Contact>,
}

impl<N: NodeRpc> Clone for LookupEngine<N> {
    fn clone(&self) -> Self {
        Self {
            rpc: self.rpc.clone(),
            routing: self.routing.clone(),
            config: self.config,
            report_down: self.report_down.clone(),
        }
    }
}

impl<N: NodeRpc> LookupEngine<N> {
    /// `report_down` receives every contact that failed an RPC at the
    /// transport level; the coordinator feeds it into the downlist.
    pub fn new(
        rpc: Arc<N>,
        routing: Arc<RoutingTable>,
        config: LookupConfig,
        report_down: mpsc::Sender<Contact>,
    ) -> Self {
        Self {
            rpc,
            routing,
            config,
            report_down,
        }
    }

    pub fn config(&self) -> LookupConfig {
        self.config
    }

    fn report_down_contact(&self, contact: &Contact, error: &DhtError) {
        if !error.is_transport() {
            return;
        }
        if self.report_down.try_send(contact.clone()).is_err() {
            trace!("downlist queue full, dropping report");
        }
    }

    /// Decide whether the current iteration may advance and whether the
    /// lookup as a whole is complete.
    fn evaluate(&self, set: &CandidateSet, round: u32) -> (bool, bool) {
        let (new_in_top, candidates_in_top) = set.top_k_counts(self.config.k);
        let pending_round = set.pending_in_round(round);
        let pending_total = set.count_state(SearchState::SelectedAlpha);

        let mut iteration_done = pending_round <= self.config.alpha - self.config.beta;
        let called_back = new_in_top == 0 && pending_total == 0;
        // Once the top k are all tried or in flight, launching further
        // rounds cannot improve the result; wait the stragglers out.
        if candidates_in_top == self.config.k && pending_total > 0 {
            iteration_done = false;
        }
        (iteration_done, called_back)
    }

    // ------------------------------------------------------------------
    // FIND_NODE
    // ------------------------------------------------------------------

    /// Converge on the k closest live contacts to `target`.
    ///
    /// `extra_seeds` joins the routing table's closest as the initial
    /// candidate set; bootstrap attempts pass a single seed here.
    pub async fn find_nodes(
        &self,
        target: NodeId,
        extra_seeds: &[Contact],
    ) -> Result<Vec<Contact>, DhtError> {
        let mut set = CandidateSet::new(target);
        for contact in self.routing.get_close_contacts(&target, self.config.k, &[]) {
            set.insert_new(contact);
        }
        for contact in extra_seeds {
            if contact.node_id != self.routing.holder() {
                set.insert_new(contact.clone());
            }
        }

        let mut round: u32 = 0;
        let mut join: JoinSet<(Contact, Result<(Vec<Contact>, RankInfo), DhtError>)> =
            JoinSet::new();
        if self.dispatch_find_nodes(&mut set, &mut round, &mut join) == 0 {
            return Ok(Vec::new());
        }

        while let Some(joined) = join.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            match result {
                Ok((learnt, rank_info)) => {
                    self.routing.add_contact(contact.clone(), rank_info);
                    set.mark(&contact.node_id, SearchState::Contacted);
                    for new_contact in learnt {
                        if new_contact.node_id != self.routing.holder() {
                            set.insert_new(new_contact);
                        }
                    }
                }
                Err(err) => {
                    trace!(peer = %&contact.node_id.to_hex()[..16], error = %err, "probe failed");
                    set.mark(&contact.node_id, SearchState::Down);
                    self.report_down_contact(&contact, &err);
                    if set.len() == 1 {
                        // The lone seed is down; nothing to iterate over.
                        return Err(DhtError::NotEnoughContacts);
                    }
                }
            }

            let (iteration_done, called_back) = self.evaluate(&set, round);
            if called_back {
                return Ok(set.closest_contacted(self.config.k));
            }
            if iteration_done {
                self.dispatch_find_nodes(&mut set, &mut round, &mut join);
            }
        }
        Ok(set.closest_contacted(self.config.k))
    }

    fn dispatch_find_nodes(
        &self,
        set: &mut CandidateSet,
        round: &mut u32,
        join: &mut JoinSet<(Contact, Result<(Vec<Contact>, RankInfo), DhtError>)>,
    ) -> usize {
        let selected = set.select_alpha(self.config.alpha, *round + 1);
        if selected.is_empty() {
            return 0;
        }
        *round += 1;
        let count = selected.len();
        for contact in selected {
            let rpc = self.rpc.clone();
            let target = set.target;
            join.spawn(async move {
                let result = rpc.find_nodes(&contact, target).await;
                (contact, result)
            });
        }
        count
    }

    // ------------------------------------------------------------------
    // FIND_VALUE
    // ------------------------------------------------------------------

    /// Search for values under `key`, short-circuiting on the first peer
    /// that returns any.
    pub async fn find_value(&self, key: NodeId) -> Result<FindValueResult, DhtError> {
        let mut set = CandidateSet::new(key);
        for contact in self.routing.get_close_contacts(&key, self.config.k, &[]) {
            set.insert_new(contact);
        }

        let mut round: u32 = 0;
        let mut alternative_holder: Option<Contact> = None;
        let mut join: JoinSet<(Contact, Result<crate::protocols::FindValueReply, DhtError>)> =
            JoinSet::new();
        if self.dispatch_find_value(&mut set, &mut round, &mut join) == 0 {
            return Ok(FindValueResult::Closest {
                contacts: Vec::new(),
                alternative_store_holder: None,
            });
        }

        while let Some(joined) = join.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            match result {
                Ok(reply) => {
                    if !reply.values.is_empty() {
                        // A hit ends the search immediately.
                        set.mark(&contact.node_id, SearchState::Contacted);
                        self.routing.add_contact(contact, reply.rank_info);
                        join.abort_all();
                        // The hit preempts convergence: the result carries
                        // the values alone, no contact list.
                        return Ok(FindValueResult::Found {
                            values: reply.values,
                            closest: Vec::new(),
                            alternative_store_holder: reply
                                .alternative_store_holder
                                .or(alternative_holder),
                        });
                    }
                    self.routing.add_contact(contact.clone(), reply.rank_info);
                    set.mark(&contact.node_id, SearchState::Contacted);
                    if alternative_holder.is_none() {
                        alternative_holder = reply.alternative_store_holder;
                    }
                    for new_contact in reply.closer {
                        if new_contact.node_id != self.routing.holder() {
                            set.insert_new(new_contact);
                        }
                    }
                }
                Err(err) => {
                    set.mark(&contact.node_id, SearchState::Down);
                    self.report_down_contact(&contact, &err);
                }
            }

            let (iteration_done, called_back) = self.evaluate(&set, round);
            if called_back {
                return Ok(FindValueResult::Closest {
                    contacts: set.closest_contacted(self.config.k),
                    alternative_store_holder: alternative_holder,
                });
            }
            if iteration_done {
                self.dispatch_find_value(&mut set, &mut round, &mut join);
            }
        }
        Ok(FindValueResult::Closest {
            contacts: set.closest_contacted(self.config.k),
            alternative_store_holder: alternative_holder,
        })
    }

    fn dispatch_find_value(
        &self,
        set: &mut CandidateSet,
        round: &mut u32,
        join: &mut JoinSet<(Contact, Result<crate::protocols::FindValueReply, DhtError>)>,
    ) -> usize {
        let selected = set.select_alpha(self.config.alpha, *round + 1);
        if selected.is_empty() {
            return 0;
        }
        *round += 1;
        let count = selected.len();
        for contact in selected {
            let rpc = self.rpc.clone();
            let key = set.target;
            join.spawn(async move {
                let result = rpc.find_value(&contact, key).await;
                (contact, result)
            });
        }
        count
    }

    // ------------------------------------------------------------------
    // STORE / DELETE / UPDATE fan-out
    // ------------------------------------------------------------------

    /// Replicate a signed value onto the k closest live nodes.
    ///
    /// Succeeds with the number of confirmed replicas once it reaches the
    /// quorum. On failure, destinations that did store receive
    /// compensating deletes.
    pub async fn store(&self, kvs: KeyValueSignature, ttl: Duration) -> Result<usize, DhtError> {
        let targets = self.mutation_targets(kvs.key).await?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_store_fanout(targets, kvs, ttl, outcome_tx).await;
        });
        outcome_rx.await.map_err(|_| DhtError::Aborted)?
    }

    /// Tombstone a signed value on the k closest live nodes. Same quorum
    /// as [`store`](Self::store), no rollback.
    pub async fn delete(&self, kvs: KeyValueSignature) -> Result<usize, DhtError> {
        let targets = self.mutation_targets(kvs.key).await?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let mut join = JoinSet::new();
            let mut set = CandidateSet::new(kvs.key);
            for contact in targets {
                set.insert_selected(contact.clone());
                let rpc = engine.rpc.clone();
                let kvs = kvs.clone();
                join.spawn(async move {
                    let result = rpc.delete(&contact, kvs).await;
                    (contact, result)
                });
            }
            engine.drain_quorum(&mut join, &mut set, outcome_tx).await;
        });
        outcome_rx.await.map_err(|_| DhtError::Aborted)?
    }

    /// Store `new_kvs` and, on each destination that accepted it, delete
    /// `old_kvs`. A destination counts as succeeded only once both steps
    /// completed; a failed store skips the delete for that destination.
    pub async fn update(
        &self,
        new_kvs: KeyValueSignature,
        old_kvs: KeyValueSignature,
        ttl: Duration,
    ) -> Result<usize, DhtError> {
        let targets = self.mutation_targets(new_kvs.key).await?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let mut join = JoinSet::new();
            let mut set = CandidateSet::new(new_kvs.key);
            for contact in targets {
                set.insert_selected(contact.clone());
                let rpc = engine.rpc.clone();
                let new_kvs = new_kvs.clone();
                let old_kvs = old_kvs.clone();
                join.spawn(async move {
                    match rpc.store(&contact, new_kvs, ttl).await {
                        Err(err) => (contact, Err(err)),
                        Ok(_) => {
                            let result = rpc.delete(&contact, old_kvs).await;
                            (contact, result)
                        }
                    }
                });
            }
            engine.drain_quorum(&mut join, &mut set, outcome_tx).await;
        });
        outcome_rx.await.map_err(|_| DhtError::Aborted)?
    }

    /// Run the search phase of a mutating operation and check the quorum
    /// precondition.
    async fn mutation_targets(&self, key: NodeId) -> Result<Vec<Contact>, DhtError> {
        let closest = self.find_nodes(key, &[]).await?;
        if closest.len() < self.config.threshold {
            debug!(
                found = closest.len(),
                required = self.config.threshold,
                "not enough live contacts for mutation"
            );
            return Err(DhtError::NotEnoughContacts);
        }
        Ok(closest)
    }

    async fn run_store_fanout(
        &self,
        targets: Vec<Contact>,
        kvs: KeyValueSignature,
        ttl: Duration,
        outcome_tx: oneshot::Sender<Result<usize, DhtError>>,
    ) {
        let mut join = JoinSet::new();
        let mut set = CandidateSet::new(kvs.key);
        for contact in targets {
            set.insert_selected(contact.clone());
            let rpc = self.rpc.clone();
            let kvs = kvs.clone();
            join.spawn(async move {
                let result = rpc.store(&contact, kvs, ttl).await;
                (contact, result)
            });
        }
        self.drain_quorum(&mut join, &mut set, outcome_tx).await;

        // With every response in: a failed operation leaves no replicas
        // behind. Roll back the destinations that did store.
        let contacted = set.count_state(SearchState::Contacted);
        if contacted > 0 && contacted < self.config.threshold {
            self.rollback_store(&set, &kvs).await;
        }
    }

    /// Consume fan-out completions, updating the candidate set and firing
    /// the outcome as soon as either quorum condition is met. Runs to the
    /// last response so late completions still feed the routing table.
    async fn drain_quorum(
        &self,
        join: &mut JoinSet<(Contact, Result<RankInfo, DhtError>)>,
        set: &mut CandidateSet,
        outcome_tx: oneshot::Sender<Result<usize, DhtError>>,
    ) {
        let mut outcome_tx = Some(outcome_tx);
        while let Some(joined) = join.join_next().await {
            let Ok((contact, result)) = joined else {
                continue;
            };
            match result {
                Ok(rank_info) => {
                    self.routing.add_contact(contact.clone(), rank_info);
                    set.mark(&contact.node_id, SearchState::Contacted);
                }
                Err(err) => {
                    set.mark(&contact.node_id, SearchState::Down);
                    self.report_down_contact(&contact, &err);
                }
            }
            let contacted = set.count_state(SearchState::Contacted);
            let down = set.count_state(SearchState::Down);
            if let Some(tx) = outcome_tx.take() {
                if down > self.config.k - self.config.threshold {
                    // More failures than the quorum margin tolerates.
                    let _ = tx.send(Err(DhtError::NotEnoughStores {
                        contacted,
                        required: self.config.threshold,
                    }));
                } else if contacted >= self.config.threshold {
                    let _ = tx.send(Ok(contacted));
                } else {
                    outcome_tx = Some(tx);
                }
            }
        }
        if let Some(tx) = outcome_tx.take() {
            // Every response is in and neither condition fired on the way.
            let contacted = set.count_state(SearchState::Contacted);
            let result = if contacted >= self.config.threshold {
                Ok(contacted)
            } else {
                Err(DhtError::NotEnoughStores {
                    contacted,
                    required: self.config.threshold,
                })
            };
            let _ = tx.send(result);
        }
    }

    /// Compensating deletes for a failed store, sent to every destination
    /// that acknowledged the store.
    async fn rollback_store(&self, set: &CandidateSet, kvs: &KeyValueSignature) {
        let stored = set.contacts_in_state(SearchState::Contacted);
        if stored.is_empty() {
            return;
        }
        warn!(
            key = %&kvs.key.to_hex()[..16],
            replicas = stored.len(),
            "store quorum failed, rolling back partial replicas"
        );
        let mut join = JoinSet::new();
        for contact in stored {
            let rpc = self.rpc.clone();
            let kvs = kvs.clone();
            join.spawn(async move {
                let result = rpc.delete(&contact, kvs).await;
                (contact, result)
            });
        }
        while let Some(joined) = join.join_next().await {
            if let Ok((contact, Err(err))) = joined {
                self.report_down_contact(&contact, &err);
            }
        }
    }
}
