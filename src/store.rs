//! Local storage for signed DHT records.
//!
//! Every record carries the signature of the peer that published it, and a
//! key stays bound to its first signer: nobody else may add values under it
//! or delete them. Deletion leaves a tombstone so a replayed store of the
//! original request cannot resurrect the value. Expired records stop being
//! readable immediately and are physically evicted later.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::DhtError;
use crate::identity::NodeId;

/// Default interval after which a record becomes due for republication.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// A value and the publisher's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueSignature {
    pub key: NodeId,
    pub value: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A record due for republication, handed to the refresh worker.
#[derive(Clone, Debug)]
pub struct RefreshCandidate {
    pub kvs: KeyValueSignature,
    pub signer_id: NodeId,
    /// The original serialized store request and its signature, forwarded
    /// verbatim in STORE_REFRESH so replicas can check the publisher's
    /// intent without a fresh signature.
    pub request_and_signature: (Vec<u8>, Vec<u8>),
}

#[derive(Clone, Debug)]
struct Record {
    kvs: KeyValueSignature,
    request_and_signature: (Vec<u8>, Vec<u8>),
    ttl: Duration,
    stored_at: Instant,
    last_refreshed: Instant,
    deleted_at: Option<Instant>,
}

impl Record {
    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }

    /// Live and readable: not tombstoned, not past its ttl.
    fn is_visible(&self, now: Instant) -> bool {
        !self.is_deleted() && !self.is_expired(now)
    }

    /// Tombstones outlive the delete by at least the record ttl; everything
    /// else is evictable once expired.
    fn is_evictable(&self, now: Instant) -> bool {
        match self.deleted_at {
            Some(deleted_at) => now.duration_since(deleted_at) >= self.ttl,
            None => self.is_expired(now),
        }
    }
}

/// All records under one key share a signer.
struct KeyRecords {
    signer_id: NodeId,
    records: Vec<Record>,
}

pub struct DataStore {
    refresh_interval: Duration,
    inner: RwLock<HashMap<NodeId, KeyRecords>>,
}

impl DataStore {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Store a signed value.
    ///
    /// Rejects with [`DhtError::SignerMismatch`] when the key is already
    /// bound to a different signer and with [`DhtError::Replay`] when the
    /// exact value was deleted earlier. Re-storing a live value is
    /// idempotent: a refresh re-stamps `last_refreshed` only, a publisher
    /// store also renews the ttl.
    pub fn store(
        &self,
        kvs: KeyValueSignature,
        signer_id: NodeId,
        request_and_signature: (Vec<u8>, Vec<u8>),
        ttl: Duration,
        is_refresh: bool,
    ) -> Result<(), DhtError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let slot = inner.entry(kvs.key).or_insert_with(|| KeyRecords {
            signer_id,
            records: Vec::new(),
        });
        if slot.signer_id != signer_id {
            return Err(DhtError::SignerMismatch);
        }

        if let Some(existing) = slot.records.iter_mut().find(|r| r.kvs.value == kvs.value) {
            if existing.is_deleted() {
                return Err(DhtError::Replay);
            }
            existing.last_refreshed = now;
            if !is_refresh {
                existing.stored_at = now;
                existing.ttl = ttl;
                existing.request_and_signature = request_and_signature;
            }
            return Ok(());
        }

        trace!(key = %&kvs.key.to_hex()[..16], ttl_secs = ttl.as_secs(), "stored record");
        slot.records.push(Record {
            kvs,
            request_and_signature,
            ttl,
            stored_at: now,
            last_refreshed: now,
            deleted_at: None,
        });
        Ok(())
    }

    /// Tombstone a value. The caller has already verified the deletion
    /// request's signature; this checks only the signer binding and the
    /// stored signature match.
    pub fn delete(
        &self,
        key: &NodeId,
        value: &[u8],
        signature: &[u8],
        signer_id: &NodeId,
    ) -> Result<(), DhtError> {
        let mut inner = self.inner.write();
        let Some(slot) = inner.get_mut(key) else {
            return Err(DhtError::KeyNotFound);
        };
        if slot.signer_id != *signer_id {
            return Err(DhtError::SignerMismatch);
        }
        let Some(record) = slot
            .records
            .iter_mut()
            .find(|r| r.kvs.value == value && !r.is_deleted())
        else {
            return Err(DhtError::KeyNotFound);
        };
        if record.kvs.signature != signature {
            return Err(DhtError::SignatureInvalid);
        }
        record.deleted_at = Some(Instant::now());
        trace!(key = %&key.to_hex()[..16], "tombstoned record");
        Ok(())
    }

    /// Replace `old_kvs` with `new_kvs` under one lock so concurrent
    /// readers see either the old or the new value, never neither.
    pub fn update(
        &self,
        new_kvs: KeyValueSignature,
        old_kvs: &KeyValueSignature,
        signer_id: NodeId,
        request_and_signature: (Vec<u8>, Vec<u8>),
        ttl: Duration,
    ) -> Result<(), DhtError> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let Some(slot) = inner.get_mut(&new_kvs.key) else {
            return Err(DhtError::KeyNotFound);
        };
        if slot.signer_id != signer_id {
            return Err(DhtError::SignerMismatch);
        }
        if slot
            .records
            .iter()
            .any(|r| r.kvs.value == new_kvs.value && r.is_deleted())
        {
            return Err(DhtError::Replay);
        }

        let old = slot
            .records
            .iter_mut()
            .find(|r| r.kvs.value == old_kvs.value && !r.is_deleted());
        let Some(old) = old else {
            return Err(DhtError::KeyNotFound);
        };
        old.deleted_at = Some(now);

        if let Some(existing) = slot
            .records
            .iter_mut()
            .find(|r| r.kvs.value == new_kvs.value)
        {
            existing.last_refreshed = now;
            existing.stored_at = now;
            existing.ttl = ttl;
        } else {
            slot.records.push(Record {
                kvs: new_kvs,
                request_and_signature,
                ttl,
                stored_at: now,
                last_refreshed: now,
                deleted_at: None,
            });
        }
        Ok(())
    }

    pub fn has_key(&self, key: &NodeId) -> bool {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .get(key)
            .is_some_and(|slot| slot.records.iter().any(|r| r.is_visible(now)))
    }

    /// All live values under `key`, with their publisher signatures.
    pub fn get_values(&self, key: &NodeId) -> Vec<KeyValueSignature> {
        let now = Instant::now();
        let inner = self.inner.read();
        inner
            .get(key)
            .map(|slot| {
                slot.records
                    .iter()
                    .filter(|r| r.is_visible(now))
                    .map(|r| r.kvs.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records due for republication. Also evicts records whose tombstone
    /// retention or ttl has fully lapsed.
    pub fn refresh(&self) -> Vec<RefreshCandidate> {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let mut due = Vec::new();
        inner.retain(|_, slot| {
            slot.records.retain(|r| !r.is_evictable(now));
            for record in &slot.records {
                if record.is_visible(now)
                    && now.duration_since(record.last_refreshed) >= self.refresh_interval
                {
                    due.push(RefreshCandidate {
                        kvs: record.kvs.clone(),
                        signer_id: slot.signer_id,
                        request_and_signature: record.request_and_signature.clone(),
                    });
                }
            }
            !slot.records.is_empty()
        });
        due
    }

    /// Republication outcome for one record: success re-stamps
    /// `last_refreshed`, failure leaves it due for the next sweep.
    pub fn mark_refreshed(&self, key: &NodeId, value: &[u8], success: bool) {
        if !success {
            return;
        }
        let mut inner = self.inner.write();
        if let Some(slot) = inner.get_mut(key) {
            if let Some(record) = slot.records.iter_mut().find(|r| r.kvs.value == value) {
                record.last_refreshed = Instant::now();
            }
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.values().map(|s| s.records.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kvs(key: NodeId, value: &[u8]) -> KeyValueSignature {
        KeyValueSignature {
            key,
            value: value.to_vec(),
            signature: vec![0xAB; 64],
        }
    }

    fn request_sig() -> (Vec<u8>, Vec<u8>) {
        (b"request".to_vec(), b"sig".to_vec())
    }

    const TTL: Duration = Duration::from_secs(3600);

    #[test]
    fn store_twice_leaves_one_live_record() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        store
            .store(kvs(key, b"v"), signer, request_sig(), TTL, false)
            .unwrap();
        store
            .store(kvs(key, b"v"), signer, request_sig(), TTL, false)
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_values(&key).len(), 1);
    }

    #[test]
    fn second_signer_is_rejected() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        store
            .store(kvs(key, b"v1"), NodeId::random(), request_sig(), TTL, false)
            .unwrap();
        let err = store
            .store(kvs(key, b"v2"), NodeId::random(), request_sig(), TTL, false)
            .unwrap_err();
        assert_eq!(err, DhtError::SignerMismatch);
    }

    #[test]
    fn same_signer_may_hold_multiple_values() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        store
            .store(kvs(key, b"v1"), signer, request_sig(), TTL, false)
            .unwrap();
        store
            .store(kvs(key, b"v2"), signer, request_sig(), TTL, false)
            .unwrap();
        assert_eq!(store.get_values(&key).len(), 2);
    }

    #[test]
    fn delete_tombstones_and_blocks_replay() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        let record = kvs(key, b"v");
        store
            .store(record.clone(), signer, request_sig(), TTL, false)
            .unwrap();
        store
            .delete(&key, b"v", &record.signature, &signer)
            .unwrap();

        assert!(!store.has_key(&key));
        assert!(store.get_values(&key).is_empty());
        // The tombstone still occupies a slot and refuses the replay.
        let err = store
            .store(record, signer, request_sig(), TTL, false)
            .unwrap_err();
        assert_eq!(err, DhtError::Replay);
    }

    #[test]
    fn delete_by_wrong_signer_fails() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        let record = kvs(key, b"v");
        store
            .store(record.clone(), signer, request_sig(), TTL, false)
            .unwrap();
        let err = store
            .delete(&key, b"v", &record.signature, &NodeId::random())
            .unwrap_err();
        assert_eq!(err, DhtError::SignerMismatch);
        assert!(store.has_key(&key));
    }

    #[test]
    fn expired_records_are_hidden_before_eviction() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        store
            .store(
                kvs(key, b"v"),
                signer,
                request_sig(),
                Duration::from_millis(10),
                false,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert!(!store.has_key(&key));
        assert!(store.get_values(&key).is_empty());
        // Still physically present until a refresh sweep runs.
        assert_eq!(store.len(), 1);
        store.refresh();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn update_swaps_values_atomically() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        let old = kvs(key, b"old");
        store
            .store(old.clone(), signer, request_sig(), TTL, false)
            .unwrap();
        store
            .update(kvs(key, b"new"), &old, signer, request_sig(), TTL)
            .unwrap();

        let values = store.get_values(&key);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, b"new");
    }

    #[test]
    fn refresh_lists_due_records_once() {
        let store = DataStore::new(Duration::from_millis(10));
        let key = NodeId::random();
        let signer = NodeId::random();
        store
            .store(kvs(key, b"v"), signer, request_sig(), TTL, false)
            .unwrap();
        assert!(store.refresh().is_empty());

        std::thread::sleep(Duration::from_millis(25));
        let due = store.refresh();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].kvs.key, key);
        assert_eq!(due[0].signer_id, signer);

        // Successful republication clears the debt; failure keeps it due.
        store.mark_refreshed(&key, b"v", true);
        assert!(store.refresh().is_empty());
    }

    #[test]
    fn refresh_is_refresh_only_restamps() {
        let store = DataStore::new(DEFAULT_REFRESH_INTERVAL);
        let key = NodeId::random();
        let signer = NodeId::random();
        store
            .store(kvs(key, b"v"), signer, request_sig(), Duration::from_secs(100), false)
            .unwrap();
        // A refresh store must not shorten or renew the ttl.
        store
            .store(kvs(key, b"v"), signer, request_sig(), Duration::from_secs(5), true)
            .unwrap();
        let inner = store.inner.read();
        let record = &inner.get(&key).unwrap().records[0];
        assert_eq!(record.ttl, Duration::from_secs(100));
    }
}
