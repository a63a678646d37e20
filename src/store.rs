//! # Radius-Bounded Content Store
//!
//! Admission control, verification dispatch, and farthest-first eviction for
//! one sub-protocol's content namespace, on top of an external [`ContentDb`].
//!
//! ## Admission
//!
//! `admit` rejects content whose XOR distance from the local id exceeds the
//! radius, runs the sub-protocol verifier, and only then writes. Admission
//! is linearizable per content id: the store is owned by a single overlay
//! actor, and a second admit of an id already indexed is a no-op.
//!
//! ## Eviction
//!
//! When stored bytes exceed the configured budget, items are removed
//! farthest-first and the radius shrinks to the distance of the farthest
//! retained item. Freed headroom never grows the radius back; growth only
//! happens through explicit reconfiguration.
//!
//! ## Layout in the backing store
//!
//! Payloads live under the hex-encoded content id. Each payload has a
//! sidecar metadata record (`meta:` prefix) carrying the content key and
//! size, so the distance index can be rebuilt on startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::content::{content_id, distance, RawContentKey, Radius, SubProtocolId};
use crate::enr::NodeId;
use crate::events::ObserverSet;
use crate::error::StoreError;
use crate::protocols::{ContentDb, Verifier};

/// Prefix for sidecar metadata records.
const META_PREFIX: &str = "meta:";

/// Bound for metadata deserialization; a key plus framing never comes close.
const MAX_META_SIZE: u64 = 64 * 1024;

/// Sidecar record describing one stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMeta {
    key: Vec<u8>,
    size: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    id: B256,
    key: RawContentKey,
    size: u64,
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Stored,
    /// The id was already indexed; no second write happened.
    AlreadyStored,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// High watermark in bytes; eviction runs while above it.
    pub max_bytes: u64,
    pub initial_radius: Radius,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
            initial_radius: Radius::MAX,
        }
    }
}

pub struct ContentStore {
    protocol: SubProtocolId,
    local_id: NodeId,
    db: Arc<dyn ContentDb>,
    verifier: Arc<dyn Verifier>,
    observers: Arc<ObserverSet>,
    radius: Radius,
    max_bytes: u64,
    bytes_stored: u64,
    /// Distance-keyed index; the last entry is the farthest item.
    index: BTreeMap<U256, IndexEntry>,
}

impl ContentStore {
    pub fn new(
        protocol: SubProtocolId,
        local_id: NodeId,
        db: Arc<dyn ContentDb>,
        verifier: Arc<dyn Verifier>,
        observers: Arc<ObserverSet>,
        config: StoreConfig,
    ) -> Self {
        Self {
            protocol,
            local_id,
            db,
            verifier,
            observers,
            radius: config.initial_radius,
            max_bytes: config.max_bytes,
            bytes_stored: 0,
            index: BTreeMap::new(),
        }
    }

    pub fn radius(&self) -> Radius {
        self.radius
    }

    /// Explicit reconfiguration; the only way the radius grows.
    pub fn set_radius(&mut self, radius: Radius) {
        self.radius = radius;
    }

    pub fn bytes_stored(&self) -> u64 {
        self.bytes_stored
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether `id` is currently indexed.
    pub fn contains_id(&self, id: &B256) -> bool {
        let dist = distance(&self.local_id, id);
        self.index
            .get(&dist)
            .map(|e| e.id == *id)
            .unwrap_or(false)
    }

    pub fn contains(&self, key: &RawContentKey) -> bool {
        self.contains_id(&content_id(self.protocol, key))
    }

    /// Rebuild the distance index from sidecar records. Called once at
    /// startup before the overlay starts serving.
    pub async fn load_index(&mut self) -> Result<(), StoreError> {
        for db_key in self.db.keys().await? {
            let Some(hex_id) = db_key.strip_prefix(META_PREFIX) else {
                continue;
            };
            let Some(raw) = self.db.get(&db_key).await? else {
                continue;
            };
            let meta: StoredMeta = {
                use bincode::Options;
                bincode::DefaultOptions::new()
                    .with_limit(MAX_META_SIZE)
                    .with_fixint_encoding()
                    .deserialize(&raw)
                    .map_err(|_| StoreError::CorruptMetadata(db_key.clone()))?
            };
            let id_bytes = hex::decode(hex_id)
                .ok()
                .and_then(|b| <[u8; 32]>::try_from(b).ok())
                .ok_or_else(|| StoreError::CorruptMetadata(db_key.clone()))?;
            let id = B256::from(id_bytes);
            let dist = distance(&self.local_id, &id);
            self.bytes_stored += meta.size;
            self.index.insert(
                dist,
                IndexEntry {
                    id,
                    key: RawContentKey(meta.key),
                    size: meta.size,
                },
            );
        }
        info!(
            protocol = %self.protocol,
            items = self.index.len(),
            bytes = self.bytes_stored,
            "content index rebuilt"
        );
        Ok(())
    }

    /// Admit a payload: radius check, verification, write, events, eviction.
    pub async fn admit(
        &mut self,
        key: RawContentKey,
        payload: Vec<u8>,
    ) -> Result<AdmitOutcome, StoreError> {
        let id = content_id(self.protocol, &key);
        let dist = distance(&self.local_id, &id);
        if !self.radius.covers(dist) {
            debug!(
                protocol = %self.protocol,
                id = hex::encode(&id[..8]),
                "admission rejected: outside radius"
            );
            return Err(StoreError::OutsideRadius);
        }
        if self.contains_id(&id) {
            return Ok(AdmitOutcome::AlreadyStored);
        }

        let verified = match self.verifier.verify(key.as_slice(), &payload) {
            Ok(v) => {
                self.observers.verified(id, true);
                v
            }
            Err(e) => {
                self.observers.verified(id, false);
                warn!(
                    protocol = %self.protocol,
                    id = hex::encode(&id[..8]),
                    error = %e,
                    "content failed verification; discarded"
                );
                return Err(StoreError::Verification(e));
            }
        };

        let size = verified.len() as u64;
        let hex_id = hex::encode(id);
        let meta = StoredMeta {
            key: key.0.clone(),
            size,
        };
        let meta_bytes = bincode::serialize(&meta)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .batch(vec![
                (hex_id.clone(), Some(verified.clone())),
                (format!("{META_PREFIX}{hex_id}"), Some(meta_bytes)),
            ])
            .await?;

        self.bytes_stored += size;
        self.index.insert(dist, IndexEntry { id, key: key.clone(), size });
        self.observers.content_added(self.protocol, &key, &verified);
        debug!(
            protocol = %self.protocol,
            id = hex::encode(&id[..8]),
            size,
            "content admitted"
        );

        self.evict_to_budget().await?;
        Ok(AdmitOutcome::Stored)
    }

    /// Stored payload for `key`, or `None`.
    pub async fn lookup(&self, key: &RawContentKey) -> Result<Option<Vec<u8>>, StoreError> {
        let id = content_id(self.protocol, key);
        self.lookup_by_id(&id).await
    }

    pub async fn lookup_by_id(&self, id: &B256) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.contains_id(id) {
            return Ok(None);
        }
        self.db.get(&hex::encode(id)).await
    }

    /// Remove farthest items until under budget, then shrink the radius to
    /// the farthest retained distance.
    pub async fn evict_to_budget(&mut self) -> Result<(), StoreError> {
        if self.bytes_stored <= self.max_bytes {
            return Ok(());
        }
        let mut evicted = 0usize;
        while self.bytes_stored > self.max_bytes {
            let Some((&dist, _)) = self.index.iter().next_back() else {
                break;
            };
            let entry = self.index.remove(&dist).expect("entry just observed");
            let hex_id = hex::encode(entry.id);
            self.db
                .batch(vec![
                    (hex_id.clone(), None),
                    (format!("{META_PREFIX}{hex_id}"), None),
                ])
                .await?;
            self.bytes_stored = self.bytes_stored.saturating_sub(entry.size);
            evicted += 1;
        }
        if let Some((&farthest, _)) = self.index.iter().next_back() {
            self.radius = Radius(farthest);
        }
        info!(
            protocol = %self.protocol,
            evicted,
            bytes = self.bytes_stored,
            radius = %self.radius.0,
            "evicted to budget; radius lowered"
        );
        Ok(())
    }

    /// Keys of all indexed items, nearest first. Used by the snapshot task.
    pub fn indexed_keys(&self) -> Vec<RawContentKey> {
        self.index.values().map(|e| e.key.clone()).collect()
    }
}

/// In-memory [`ContentDb`] used by tests, simulations, and ephemeral nodes.
#[derive(Default)]
pub struct MemoryDb {
    inner: parking_lot::Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ContentDb for MemoryDb {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.inner.lock().remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<(String, Option<Vec<u8>>)>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for (key, value) in ops {
            match value {
                Some(v) => {
                    inner.insert(key, v);
                }
                None => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.lock().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    /// Accepts everything; the content engine's own tests cover real
    /// verifiers.
    struct AcceptAll;
    impl Verifier for AcceptAll {
        fn verify(&self, _key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
            Ok(payload.to_vec())
        }
    }

    struct RejectAll;
    impl Verifier for RejectAll {
        fn verify(&self, _key: &[u8], _payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
            Err(ValidationError::InvalidProof)
        }
    }

    fn store_with(verifier: Arc<dyn Verifier>, max_bytes: u64) -> ContentStore {
        ContentStore::new(
            SubProtocolId::History,
            NodeId::from_bytes([0u8; 32]),
            Arc::new(MemoryDb::new()),
            verifier,
            Arc::new(ObserverSet::new()),
            StoreConfig {
                max_bytes,
                initial_radius: Radius::MAX,
            },
        )
    }

    fn key(seed: u8) -> RawContentKey {
        RawContentKey(vec![0x00, seed, seed, seed])
    }

    #[tokio::test]
    async fn admit_and_lookup() {
        let mut store = store_with(Arc::new(AcceptAll), u64::MAX);
        let k = key(1);
        assert_eq!(
            store.admit(k.clone(), b"value".to_vec()).await.unwrap(),
            AdmitOutcome::Stored
        );
        assert_eq!(store.lookup(&k).await.unwrap(), Some(b"value".to_vec()));
        assert_eq!(store.lookup(&key(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_admit_writes_once() {
        let mut store = store_with(Arc::new(AcceptAll), u64::MAX);
        let k = key(1);
        store.admit(k.clone(), b"value".to_vec()).await.unwrap();
        assert_eq!(
            store.admit(k.clone(), b"other".to_vec()).await.unwrap(),
            AdmitOutcome::AlreadyStored
        );
        // First write wins.
        assert_eq!(store.lookup(&k).await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn outside_radius_rejected() {
        let mut store = store_with(Arc::new(AcceptAll), u64::MAX);
        store.set_radius(Radius(U256::ZERO));
        let err = store.admit(key(1), b"value".to_vec()).await.unwrap_err();
        assert_eq!(err, StoreError::OutsideRadius);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failed_verification_not_stored() {
        let mut store = store_with(Arc::new(RejectAll), u64::MAX);
        let err = store.admit(key(1), b"value".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::Verification(_)));
        assert!(store.is_empty());
        assert_eq!(store.bytes_stored(), 0);
    }

    #[tokio::test]
    async fn eviction_removes_farthest_and_lowers_radius() {
        // Budget fits roughly three 100-byte payloads.
        let mut store = store_with(Arc::new(AcceptAll), 350);
        for seed in 1..=5u8 {
            store.admit(key(seed), vec![seed; 100]).await.unwrap();
        }
        assert!(store.bytes_stored() <= 350);
        assert!(store.len() < 5);

        // Everything retained must be within the shrunken radius, and the
        // radius equals the farthest retained distance.
        let farthest = store.index.keys().next_back().copied().unwrap();
        assert_eq!(store.radius().0, farthest);

        // Headroom does not restore the radius.
        let before = store.radius();
        store.evict_to_budget().await.unwrap();
        assert_eq!(store.radius(), before);
    }

    #[tokio::test]
    async fn index_rebuild_from_sidecars() {
        let db = Arc::new(MemoryDb::new());
        let observers = Arc::new(ObserverSet::new());
        let mut store = ContentStore::new(
            SubProtocolId::History,
            NodeId::from_bytes([0u8; 32]),
            db.clone(),
            Arc::new(AcceptAll),
            observers.clone(),
            StoreConfig::default(),
        );
        let k = key(9);
        store.admit(k.clone(), b"persisted".to_vec()).await.unwrap();
        let bytes = store.bytes_stored();

        let mut reloaded = ContentStore::new(
            SubProtocolId::History,
            NodeId::from_bytes([0u8; 32]),
            db,
            Arc::new(AcceptAll),
            observers,
            StoreConfig::default(),
        );
        reloaded.load_index().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.bytes_stored(), bytes);
        assert!(reloaded.contains(&k));
        assert_eq!(
            reloaded.lookup(&k).await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }
}
