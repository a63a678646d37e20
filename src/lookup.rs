//! # Iterative Lookup Engines
//!
//! α-parallel iterative lookups over the overlay: FINDNODE converges on the
//! k records closest to a target id; FINDCONTENT does the same toward a
//! content id but short-circuits as soon as any probed peer returns a
//! payload that verifies.
//!
//! ## State
//!
//! A lookup tracks every record it has observed as a *candidate* in one of
//! four states (pending, queried, responded, failed), ordered by XOR
//! distance to the target, plus the running set of the k closest responded
//! nodes. A new probe is issued while fewer than α are outstanding and some
//! pending candidate could still improve the closest-k set.
//!
//! ## Termination
//!
//! FINDNODE terminates when no pending candidate can improve closest-k, on
//! deadline, or on candidate exhaustion. FINDCONTENT additionally
//! terminates on the first verified payload; a payload that fails
//! verification counts as no-answer from that peer and the lookup
//! continues. Each in-flight probe carries its own timeout; the lookup as a
//! whole carries a deadline.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

use crate::content::RawContentKey;
use crate::enr::{Enr, NodeId};
use crate::error::{LookupError, OverlayError, ValidationError};

/// Concurrent probes per lookup.
pub const ALPHA: usize = 3;

/// Closest-set size a FINDNODE lookup converges on.
pub const LOOKUP_K: usize = 16;

/// Per-probe timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Whole-lookup deadline.
pub const LOOKUP_DEADLINE: Duration = Duration::from_secs(60);

/// Response to a FINDCONTENT probe, after wire decoding.
#[derive(Debug, Clone)]
pub enum ContentResponse {
    /// Inline payload.
    Payload(Vec<u8>),
    /// Payload exceeds the packet ceiling; fetch over this connection id.
    Transfer(u16),
    /// Closer peers.
    Enrs(Vec<Enr>),
}

/// Probe operations a lookup drives. Implemented by the overlay handle.
#[async_trait]
pub trait LookupTransport: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    /// FINDNODES for records near the given log2-distances.
    async fn find_nodes(&self, to: &Enr, distances: Vec<u16>)
        -> Result<Vec<Enr>, OverlayError>;

    /// FINDCONTENT for a serialized content key.
    async fn find_content(
        &self,
        to: &Enr,
        key: &RawContentKey,
    ) -> Result<ContentResponse, OverlayError>;

    /// Complete a bulk transfer advertised in a CONTENT response.
    async fn fetch_transfer(&self, to: &Enr, conn_id: u16) -> Result<Vec<u8>, OverlayError>;

    /// Sub-protocol verification for retrieved payloads.
    fn verify(&self, key: &RawContentKey, payload: &[u8]) -> Result<Vec<u8>, ValidationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    Pending,
    Queried,
    Responded,
    Failed,
}

struct Candidate {
    enr: Enr,
    state: CandidateState,
}

/// Shared candidate bookkeeping for both lookup kinds.
struct LookupState {
    target: [u8; 32],
    local_id: NodeId,
    k: usize,
    /// Distance-ordered candidates; the map key is the XOR distance.
    candidates: BTreeMap<U256, Candidate>,
    seen: HashSet<NodeId>,
    probes_issued: usize,
}

impl LookupState {
    fn new(target: [u8; 32], local_id: NodeId, k: usize, seeds: Vec<Enr>) -> Self {
        let mut state = Self {
            target,
            local_id,
            k,
            candidates: BTreeMap::new(),
            seen: HashSet::new(),
            probes_issued: 0,
        };
        state.merge(seeds);
        state
    }

    fn merge(&mut self, enrs: Vec<Enr>) {
        for enr in enrs {
            let id = enr.node_id();
            if id == self.local_id || !self.seen.insert(id) {
                continue;
            }
            let dist = id.distance_to(&self.target);
            self.candidates.insert(
                dist,
                Candidate {
                    enr,
                    state: CandidateState::Pending,
                },
            );
        }
    }

    /// Distance of the k-th closest responded candidate, if k responded.
    fn kth_responded_distance(&self) -> Option<U256> {
        self.candidates
            .iter()
            .filter(|(_, c)| c.state == CandidateState::Responded)
            .nth(self.k - 1)
            .map(|(d, _)| *d)
    }

    /// Next pending candidate worth probing, by the improvement rule.
    fn next_probe(&mut self) -> Option<Enr> {
        let cutoff = self.kth_responded_distance();
        for (dist, candidate) in self.candidates.iter_mut() {
            if candidate.state != CandidateState::Pending {
                continue;
            }
            if let Some(cutoff) = cutoff {
                if *dist >= cutoff {
                    return None;
                }
            }
            candidate.state = CandidateState::Queried;
            self.probes_issued += 1;
            return Some(candidate.enr.clone());
        }
        None
    }

    fn mark(&mut self, id: &NodeId, state: CandidateState) {
        let dist = id.distance_to(&self.target);
        if let Some(candidate) = self.candidates.get_mut(&dist) {
            if candidate.enr.node_id() == *id {
                candidate.state = state;
            }
        }
    }

    /// The k closest responded records.
    fn closest(&self) -> Vec<Enr> {
        self.candidates
            .values()
            .filter(|c| c.state == CandidateState::Responded)
            .take(self.k)
            .map(|c| c.enr.clone())
            .collect()
    }
}

/// Requested log2-distances for a FINDNODES probe toward `target`: the
/// peer's bucket for the target plus its two neighbors.
fn probe_distances(peer: &NodeId, target: &[u8; 32]) -> Vec<u16> {
    let target_id = NodeId::from_bytes(*target);
    let Some(log2) = crate::enr::log2_distance(peer, &target_id) else {
        return vec![1];
    };
    let ld = (log2 + 1) as u16;
    let mut out = vec![ld];
    if ld > 1 {
        out.push(ld - 1);
    }
    if ld < 256 {
        out.push(ld + 1);
    }
    out
}

/// Result of a FINDNODE lookup.
#[derive(Debug)]
pub struct NodesFound {
    pub closest: Vec<Enr>,
    pub probes: usize,
}

/// Result of a FINDCONTENT lookup.
#[derive(Debug)]
pub struct ContentFound {
    pub payload: Vec<u8>,
    /// Peer that served the verified payload.
    pub source: NodeId,
    pub probes: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LookupConfig {
    pub alpha: usize,
    pub k: usize,
    pub probe_timeout: Duration,
    pub deadline: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            alpha: ALPHA,
            k: LOOKUP_K,
            probe_timeout: PROBE_TIMEOUT,
            deadline: LOOKUP_DEADLINE,
        }
    }
}

/// Iterative FINDNODE toward a 32-byte target.
pub async fn node_lookup<T: LookupTransport>(
    transport: Arc<T>,
    target: [u8; 32],
    seeds: Vec<Enr>,
    config: LookupConfig,
) -> NodesFound {
    let started = Instant::now();
    let mut state = LookupState::new(target, transport.local_id(), config.k, seeds);
    let mut probes: JoinSet<(NodeId, Result<Vec<Enr>, OverlayError>)> = JoinSet::new();

    loop {
        while probes.len() < config.alpha {
            let Some(enr) = state.next_probe() else { break };
            let transport = transport.clone();
            let distances = probe_distances(&enr.node_id(), &target);
            let probe_timeout = config.probe_timeout;
            probes.spawn(async move {
                let id = enr.node_id();
                let result = match timeout(probe_timeout, transport.find_nodes(&enr, distances))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(OverlayError::Transport(
                        crate::error::TransportError::Timeout,
                    )),
                };
                (id, result)
            });
        }

        if probes.is_empty() {
            break;
        }

        let remaining = config
            .deadline
            .saturating_sub(started.elapsed());
        if remaining.is_zero() {
            debug!(target = hex::encode(&target[..8]), "node lookup deadline");
            break;
        }
        match timeout(remaining, probes.join_next()).await {
            Ok(Some(Ok((id, Ok(found))))) => {
                state.mark(&id, CandidateState::Responded);
                state.merge(found);
            }
            Ok(Some(Ok((id, Err(_))))) => {
                state.mark(&id, CandidateState::Failed);
            }
            Ok(Some(Err(_))) | Ok(None) => {}
            Err(_) => {
                debug!(target = hex::encode(&target[..8]), "node lookup deadline");
                break;
            }
        }
    }

    let found = NodesFound {
        closest: state.closest(),
        probes: state.probes_issued,
    };
    trace!(
        target = hex::encode(&target[..8]),
        found = found.closest.len(),
        probes = found.probes,
        "node lookup completed"
    );
    found
}

enum ProbeOutcome {
    Verified(Vec<u8>),
    Closer(Vec<Enr>),
    NoAnswer,
}

/// Iterative FINDCONTENT; resolves with the first verified payload.
pub async fn content_lookup<T: LookupTransport>(
    transport: Arc<T>,
    key: RawContentKey,
    content_id: [u8; 32],
    seeds: Vec<Enr>,
    config: LookupConfig,
) -> Result<ContentFound, LookupError> {
    let started = Instant::now();
    let mut state = LookupState::new(content_id, transport.local_id(), config.k, seeds);
    let mut probes: JoinSet<(NodeId, ProbeOutcome)> = JoinSet::new();

    loop {
        while probes.len() < config.alpha {
            let Some(enr) = state.next_probe() else { break };
            let transport = transport.clone();
            let key = key.clone();
            let probe_timeout = config.probe_timeout;
            probes.spawn(async move {
                let id = enr.node_id();
                let response =
                    match timeout(probe_timeout, transport.find_content(&enr, &key)).await {
                        Ok(Ok(r)) => r,
                        Ok(Err(_)) | Err(_) => return (id, ProbeOutcome::NoAnswer),
                    };
                let outcome = match response {
                    ContentResponse::Payload(payload) => {
                        verify_payload(&*transport, &key, payload, &id)
                    }
                    ContentResponse::Transfer(conn_id) => {
                        // Transfers run to their own stall deadline rather
                        // than the probe timeout.
                        match transport.fetch_transfer(&enr, conn_id).await {
                            Ok(payload) => verify_payload(&*transport, &key, payload, &id),
                            Err(_) => ProbeOutcome::NoAnswer,
                        }
                    }
                    ContentResponse::Enrs(enrs) => ProbeOutcome::Closer(enrs),
                };
                (id, outcome)
            });
        }

        if probes.is_empty() {
            if state.probes_issued == 0 {
                return Err(LookupError::Exhausted);
            }
            return Err(LookupError::NotFound);
        }

        let remaining = config.deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(LookupError::DeadlineElapsed);
        }
        match timeout(remaining, probes.join_next()).await {
            Ok(Some(Ok((id, outcome)))) => match outcome {
                ProbeOutcome::Verified(payload) => {
                    state.mark(&id, CandidateState::Responded);
                    debug!(
                        source = %id,
                        probes = state.probes_issued,
                        bytes = payload.len(),
                        "content lookup resolved"
                    );
                    return Ok(ContentFound {
                        payload,
                        source: id,
                        probes: state.probes_issued,
                    });
                }
                ProbeOutcome::Closer(enrs) => {
                    state.mark(&id, CandidateState::Responded);
                    state.merge(enrs);
                }
                ProbeOutcome::NoAnswer => {
                    state.mark(&id, CandidateState::Failed);
                }
            },
            Ok(Some(Err(_))) | Ok(None) => {}
            Err(_) => return Err(LookupError::DeadlineElapsed),
        }
    }
}

fn verify_payload<T: LookupTransport + ?Sized>(
    transport: &T,
    key: &RawContentKey,
    payload: Vec<u8>,
    source: &NodeId,
) -> ProbeOutcome {
    match transport.verify(key, &payload) {
        Ok(verified) => ProbeOutcome::Verified(verified),
        Err(e) => {
            warn!(source = %source, error = %e, "payload failed verification; continuing");
            ProbeOutcome::NoAnswer
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::EnrBuilder;
    use parking_lot::Mutex;
    use secp256k1::SecretKey;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    fn test_enr(seed: u16) -> Enr {
        let mut key = [0u8; 32];
        key[30] = (seed >> 8) as u8;
        key[31] = (seed & 0xFF) as u8;
        key[0] = 3;
        let sk = SecretKey::from_slice(&key).unwrap();
        EnrBuilder::new()
            .ip4(Ipv4Addr::LOCALHOST)
            .udp4(20000 + seed)
            .build(&sk)
            .unwrap()
    }

    /// A simulated network: every node knows a handful of others; one node
    /// may hold the payload; some nodes serve a corrupt payload.
    struct SimNet {
        local: NodeId,
        neighbors: HashMap<NodeId, Vec<Enr>>,
        holder: Option<(NodeId, Vec<u8>)>,
        poisoned: HashSet<NodeId>,
        offline: HashSet<NodeId>,
        probes: Mutex<usize>,
    }

    #[async_trait]
    impl LookupTransport for SimNet {
        fn local_id(&self) -> NodeId {
            self.local
        }

        async fn find_nodes(
            &self,
            to: &Enr,
            _distances: Vec<u16>,
        ) -> Result<Vec<Enr>, OverlayError> {
            *self.probes.lock() += 1;
            if self.offline.contains(&to.node_id()) {
                return Err(OverlayError::Transport(
                    crate::error::TransportError::Timeout,
                ));
            }
            Ok(self
                .neighbors
                .get(&to.node_id())
                .cloned()
                .unwrap_or_default())
        }

        async fn find_content(
            &self,
            to: &Enr,
            _key: &RawContentKey,
        ) -> Result<ContentResponse, OverlayError> {
            *self.probes.lock() += 1;
            let id = to.node_id();
            if self.offline.contains(&id) {
                return Err(OverlayError::Transport(
                    crate::error::TransportError::Timeout,
                ));
            }
            if self.poisoned.contains(&id) {
                return Ok(ContentResponse::Payload(b"corrupt".to_vec()));
            }
            if let Some((holder, payload)) = &self.holder {
                if *holder == id {
                    return Ok(ContentResponse::Payload(payload.clone()));
                }
            }
            Ok(ContentResponse::Enrs(
                self.neighbors.get(&id).cloned().unwrap_or_default(),
            ))
        }

        async fn fetch_transfer(
            &self,
            _to: &Enr,
            _conn_id: u16,
        ) -> Result<Vec<u8>, OverlayError> {
            unreachable!("simulation serves inline payloads")
        }

        fn verify(
            &self,
            _key: &RawContentKey,
            payload: &[u8],
        ) -> Result<Vec<u8>, ValidationError> {
            if payload == b"corrupt" {
                Err(ValidationError::InvalidProof)
            } else {
                Ok(payload.to_vec())
            }
        }
    }

    fn build_network(n: u16) -> (Vec<Enr>, HashMap<NodeId, Vec<Enr>>) {
        let enrs: Vec<Enr> = (1..=n).map(test_enr).collect();
        let mut neighbors: HashMap<NodeId, Vec<Enr>> = HashMap::new();
        // Everyone knows the 12 nodes nearest to themselves by XOR, plus a
        // deterministic stripe of long-range links.
        for (i, enr) in enrs.iter().enumerate() {
            let me = enr.node_id();
            let mut others: Vec<Enr> =
                enrs.iter().filter(|e| e.node_id() != me).cloned().collect();
            others.sort_by_key(|e| e.node_id().distance_to(me.as_bytes()));
            let mut known: Vec<Enr> = others.iter().take(12).cloned().collect();
            for j in 0..6usize {
                let pick = &enrs[(i * 7 + j * 11) % enrs.len()];
                if pick.node_id() != me && !known.iter().any(|e| e.node_id() == pick.node_id())
                {
                    known.push(pick.clone());
                }
            }
            neighbors.insert(me, known);
        }
        (enrs, neighbors)
    }

    fn fast_config() -> LookupConfig {
        LookupConfig {
            probe_timeout: Duration::from_millis(200),
            deadline: Duration::from_secs(5),
            ..LookupConfig::default()
        }
    }

    #[tokio::test]
    async fn node_lookup_converges_on_closest() {
        let (enrs, neighbors) = build_network(30);
        let target = enrs[17].node_id().raw();
        let net = Arc::new(SimNet {
            local: NodeId::from_bytes([0u8; 32]),
            neighbors,
            holder: None,
            poisoned: HashSet::new(),
            offline: HashSet::new(),
            probes: Mutex::new(0),
        });

        let seeds = vec![enrs[0].clone(), enrs[1].clone()];
        let found = node_lookup(net, target, seeds, fast_config()).await;
        assert!(!found.closest.is_empty());
        // The target itself must be discovered and ranked first.
        assert_eq!(found.closest[0].node_id().raw(), target);
        for pair in found.closest.windows(2) {
            assert!(
                pair[0].node_id().distance_to(&target)
                    <= pair[1].node_id().distance_to(&target)
            );
        }
    }

    #[tokio::test]
    async fn content_lookup_finds_holder_within_probe_budget() {
        let (enrs, neighbors) = build_network(50);
        let holder = enrs[33].clone();
        let payload = b"the content".to_vec();
        let key = RawContentKey(vec![0x00, 0x01]);
        // Place the content at the holder's own id so the search gradient
        // leads to it.
        let content_id = holder.node_id().raw();

        let net = Arc::new(SimNet {
            local: NodeId::from_bytes([0u8; 32]),
            neighbors,
            holder: Some((holder.node_id(), payload.clone())),
            poisoned: HashSet::new(),
            offline: HashSet::new(),
            probes: Mutex::new(0),
        });

        let seeds = vec![enrs[0].clone()];
        let found = content_lookup(net.clone(), key, content_id, seeds, fast_config())
            .await
            .expect("content found");
        assert_eq!(found.payload, payload);
        assert_eq!(found.source, holder.node_id());
        // log2(50) ~ 5.6 rounds of alpha probes.
        assert!(
            found.probes <= 6 * ALPHA,
            "expected convergence within {} probes, used {}",
            6 * ALPHA,
            found.probes
        );
    }

    #[tokio::test]
    async fn failed_verification_continues_to_honest_holder() {
        let (enrs, neighbors) = build_network(20);
        let honest = enrs[10].clone();
        let poisoned: HashSet<NodeId> =
            enrs.iter().take(4).map(|e| e.node_id()).collect();
        let payload = b"verified payload".to_vec();
        let key = RawContentKey(vec![0x00, 0x02]);
        let content_id = honest.node_id().raw();

        let net = Arc::new(SimNet {
            local: NodeId::from_bytes([0u8; 32]),
            neighbors,
            holder: Some((honest.node_id(), payload.clone())),
            poisoned,
            offline: HashSet::new(),
            probes: Mutex::new(0),
        });

        let seeds: Vec<Enr> = enrs.iter().take(3).cloned().collect();
        let found = content_lookup(net, key, content_id, seeds, fast_config())
            .await
            .expect("content found despite poison");
        assert_eq!(found.payload, payload);
        assert_eq!(found.source, honest.node_id());
    }

    #[tokio::test]
    async fn missing_content_reports_not_found() {
        let (enrs, neighbors) = build_network(10);
        let net = Arc::new(SimNet {
            local: NodeId::from_bytes([0u8; 32]),
            neighbors,
            holder: None,
            poisoned: HashSet::new(),
            offline: HashSet::new(),
            probes: Mutex::new(0),
        });
        let key = RawContentKey(vec![0x00, 0x03]);
        let err = content_lookup(
            net,
            key,
            [0xEE; 32],
            vec![enrs[0].clone()],
            fast_config(),
        )
        .await
        .expect_err("nothing to find");
        assert_eq!(err, LookupError::NotFound);
    }

    #[tokio::test]
    async fn offline_seeds_exhaust_cleanly() {
        let (enrs, neighbors) = build_network(5);
        let offline: HashSet<NodeId> = enrs.iter().map(|e| e.node_id()).collect();
        let net = Arc::new(SimNet {
            local: NodeId::from_bytes([0u8; 32]),
            neighbors,
            holder: None,
            poisoned: HashSet::new(),
            offline,
            probes: Mutex::new(0),
        });
        let found = node_lookup(
            net,
            [0xAB; 32],
            enrs.iter().cloned().collect(),
            fast_config(),
        )
        .await;
        assert!(found.closest.is_empty());
        assert_eq!(found.probes, 5);
    }
}
