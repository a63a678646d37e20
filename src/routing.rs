//! # XOR-Metric Routing Table
//!
//! One table per sub-protocol: 256 buckets indexed by the count of leading
//! zero bits in the XOR distance between the local id and the entry's id.
//! Each bucket is an ordered sequence of up to K live entries (least-recent
//! first) plus a bounded replacement cache.
//!
//! ## Liveness
//!
//! Entries move to the most-recent position on every successful exchange.
//! When a full bucket receives a new record, the caller is handed the
//! least-recent entry to probe: a live response keeps it and shunts the
//! newcomer to the replacement cache; no response evicts it in favor of the
//! newcomer. Three consecutive failed exchanges evict an entry outright,
//! promoting from the replacement cache.
//!
//! ## Invariants
//!
//! - An entry's bucket index equals `256 - floor(log2(distance)) - 1`.
//! - The local id never appears in the table.
//! - Stored sequence numbers are monotonic non-decreasing per node id.

use std::time::{Duration, Instant};

use crate::content::Radius;
use crate::enr::{bucket_index, distance_cmp, Enr, NodeId};

/// Buckets per table; one per possible leading-zero count.
pub const BUCKET_COUNT: usize = 256;

/// Live entries per bucket (Kademlia K).
pub const BUCKET_SIZE: usize = 16;

/// Replacement-cache bound, equal to the bucket bound.
pub const REPLACEMENT_CACHE_SIZE: usize = BUCKET_SIZE;

/// Consecutive liveness failures before outright eviction.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Backoff before a peer that failed one probe is probed again.
pub const REPROBE_BACKOFF: Duration = Duration::from_secs(30);

/// A routing-table entry: the record plus liveness bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub enr: Enr,
    /// Last radius the peer advertised in a PONG, if any.
    pub radius: Option<Radius>,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

impl PeerEntry {
    fn new(enr: Enr) -> Self {
        Self {
            enr,
            radius: None,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Whether a failed peer is due for a re-probe.
    pub fn reprobe_due(&self) -> bool {
        match self.last_failure {
            Some(at) => at.elapsed() >= REPROBE_BACKOFF,
            None => true,
        }
    }
}

/// Outcome of offering a record to the table.
#[derive(Debug)]
pub enum InsertOutcome {
    /// Appended as the bucket's most-recent entry.
    Inserted,
    /// Already present; record and recency refreshed.
    Refreshed,
    /// Bucket full. The caller should probe `least_recent` and report the
    /// result through [`RoutingTable::resolve_probe`]; the incoming record
    /// waits in the replacement cache meanwhile.
    PendingProbe { least_recent: Box<Enr> },
    /// Rejected: local id, stale sequence number, or unusable record.
    Discarded,
}

#[derive(Debug, Default)]
struct Bucket {
    /// Least-recent first.
    entries: Vec<PeerEntry>,
    replacements: Vec<Enr>,
}

impl Bucket {
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.enr.node_id() == *id)
    }

    fn push_replacement(&mut self, enr: Enr) {
        self.replacements.retain(|e| e.node_id() != enr.node_id());
        self.replacements.push(enr);
        if self.replacements.len() > REPLACEMENT_CACHE_SIZE {
            self.replacements.remove(0);
        }
    }

    fn promote_replacement(&mut self) {
        if self.entries.len() < BUCKET_SIZE {
            if let Some(enr) = self.replacements.pop() {
                self.entries.push(PeerEntry::new(enr));
            }
        }
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Bucket::default);
        Self { local_id, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Offer a record to the table.
    ///
    /// Known ids only accept a strictly greater sequence number for the
    /// record itself, though recency is refreshed either way.
    pub fn insert(&mut self, enr: Enr) -> InsertOutcome {
        let id = enr.node_id();
        let Some(idx) = bucket_index(&self.local_id, &id) else {
            return InsertOutcome::Discarded;
        };
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.position(&id) {
            let mut entry = bucket.entries.remove(pos);
            if enr.seq() > entry.enr.seq() {
                entry.enr = enr;
            }
            entry.consecutive_failures = 0;
            entry.last_failure = None;
            bucket.entries.push(entry);
            return InsertOutcome::Refreshed;
        }

        if bucket.entries.len() < BUCKET_SIZE {
            bucket.entries.push(PeerEntry::new(enr));
            return InsertOutcome::Inserted;
        }

        // Full: hand back the least-recent entry for a liveness probe and
        // park the newcomer in the replacement cache.
        let least_recent = bucket.entries[0].enr.clone();
        bucket.push_replacement(enr);
        InsertOutcome::PendingProbe {
            least_recent: Box::new(least_recent),
        }
    }

    /// Report the result of a liveness probe issued for a full bucket.
    ///
    /// A live least-recent entry is kept and refreshed; a dead one is
    /// evicted and the most recently parked replacement takes its slot.
    pub fn resolve_probe(&mut self, probed: &NodeId, alive: bool) {
        let Some(idx) = bucket_index(&self.local_id, probed) else {
            return;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(probed) else {
            return;
        };
        if alive {
            let mut entry = bucket.entries.remove(pos);
            entry.consecutive_failures = 0;
            entry.last_failure = None;
            bucket.entries.push(entry);
        } else {
            bucket.entries.remove(pos);
            bucket.promote_replacement();
        }
    }

    /// Drop an entry and promote from the replacement cache.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let Some(idx) = bucket_index(&self.local_id, id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        match bucket.position(id) {
            Some(pos) => {
                bucket.entries.remove(pos);
                bucket.promote_replacement();
                true
            }
            None => false,
        }
    }

    /// Record a successful exchange: clears failures, refreshes recency.
    pub fn mark_success(&mut self, id: &NodeId) {
        if let Some(idx) = bucket_index(&self.local_id, id) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(id) {
                let mut entry = bucket.entries.remove(pos);
                entry.consecutive_failures = 0;
                entry.last_failure = None;
                bucket.entries.push(entry);
            }
        }
    }

    /// Record a failed exchange. After [`MAX_CONSECUTIVE_FAILURES`] the
    /// entry is evicted; returns `true` when that happened.
    pub fn mark_failure(&mut self, id: &NodeId) -> bool {
        let Some(idx) = bucket_index(&self.local_id, id) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        let Some(pos) = bucket.position(id) else {
            return false;
        };
        let entry = &mut bucket.entries[pos];
        entry.consecutive_failures += 1;
        entry.last_failure = Some(Instant::now());
        if entry.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            bucket.entries.remove(pos);
            bucket.promote_replacement();
            true
        } else {
            false
        }
    }

    /// Record the radius a peer advertised.
    pub fn set_radius(&mut self, id: &NodeId, radius: Radius) {
        if let Some(idx) = bucket_index(&self.local_id, id) {
            let bucket = &mut self.buckets[idx];
            if let Some(pos) = bucket.position(id) {
                bucket.entries[pos].radius = Some(radius);
            }
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerEntry> {
        let idx = bucket_index(&self.local_id, id)?;
        let bucket = &self.buckets[idx];
        bucket.position(id).map(|pos| &bucket.entries[pos])
    }

    /// Up to `k` records closest to `target` by XOR distance. Ordering is
    /// by distance ascending; insertion order breaks ties.
    pub fn nearest(&self, target: &[u8; 32], k: usize) -> Vec<Enr> {
        if k == 0 {
            return Vec::new();
        }
        let mut all: Vec<(usize, [u8; 32], &Enr)> = Vec::new();
        let mut order = 0usize;
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                let mut dist = entry.enr.node_id().raw();
                for (i, byte) in dist.iter_mut().enumerate() {
                    *byte ^= target[i];
                }
                all.push((order, dist, &entry.enr));
                order += 1;
            }
        }
        all.sort_by(|a, b| distance_cmp(&a.1, &b.1).then(a.0.cmp(&b.0)));
        all.into_iter().take(k).map(|(_, _, e)| e.clone()).collect()
    }

    /// Records whose log2-distance from the local id is `log_distance`.
    /// Log-distance 0 (the local record itself) is the overlay's concern.
    pub fn at_log_distance(&self, log_distance: u16) -> Vec<Enr> {
        if log_distance == 0 || log_distance > 256 {
            return Vec::new();
        }
        let idx = BUCKET_COUNT - log_distance as usize;
        self.buckets[idx]
            .entries
            .iter()
            .map(|e| e.enr.clone())
            .collect()
    }

    /// Entries whose advertised radius covers `distance_of`'s output.
    /// Used by gossip to select interested neighbors.
    pub fn interested_in<F>(&self, mut distance_of: F) -> Vec<Enr>
    where
        F: FnMut(&NodeId) -> alloy_primitives::U256,
    {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                if let Some(radius) = entry.radius {
                    let id = entry.enr.node_id();
                    if radius.covers(distance_of(&id)) {
                        out.push(entry.enr.clone());
                    }
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buckets that currently hold at least one entry.
    pub fn occupied_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.entries.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Every live entry, for snapshots and diagnostics.
    pub fn entries(&self) -> Vec<Enr> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.enr.clone()))
            .collect()
    }
}
