//! # Neighborhood Gossip
//!
//! Push-style propagation of newly admitted content: offer the content key
//! to a handful of peers whose advertised radius covers the content id, and
//! stream the payload to whoever accepts. Strictly best-effort: declined
//! offers, dead peers, and failed transfers are logged and forgotten; there
//! is no retry.
//!
//! A bounded de-duplication cache keeps one admission from re-offering the
//! same content id into the same neighborhood within its TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::B256;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::content::RawContentKey;
use crate::enr::Enr;
use crate::error::{OverlayError, UtpError};
use crate::wire::BitList;

/// Peers offered each newly admitted item.
pub const NEIGHBORHOOD_GOSSIP_FANOUT: usize = 4;

/// Content ids tracked for offer de-duplication.
const RECENT_CACHE_SIZE: usize = 4096;

/// How long a gossiped id stays suppressed.
const RECENT_TTL: Duration = Duration::from_secs(60);

/// ACCEPT data relevant to the offering side.
#[derive(Debug, Clone)]
pub struct AcceptResult {
    pub connection_id: u16,
    pub accepted: BitList,
}

/// Wire operations gossip drives. Implemented by the overlay handle.
#[async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    /// Send OFFER, await ACCEPT.
    async fn offer(
        &self,
        to: &Enr,
        keys: Vec<RawContentKey>,
    ) -> Result<AcceptResult, OverlayError>;

    /// Stream one accepted item over a bulk-transfer session.
    async fn stream_item(
        &self,
        to: &Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> Result<(), UtpError>;
}

/// Connection id for the `index`-th accepted item of an OFFER whose ACCEPT
/// advertised `base`. Items are spaced by two so each session's id pair
/// stays disjoint.
pub fn item_connection_id(base: u16, index: usize) -> u16 {
    base.wrapping_add((index * 2) as u16)
}

/// Order the radius-interested peers by distance to the content id and cap
/// at the gossip fanout.
pub fn select_neighbors(mut interested: Vec<Enr>, content_id: &B256, fanout: usize) -> Vec<Enr> {
    interested.sort_by_key(|e| e.node_id().distance_to(&content_id.0));
    interested.truncate(fanout);
    interested
}

pub struct NeighborhoodGossip {
    recent: Mutex<LruCache<B256, Instant>>,
    ttl: Duration,
    fanout: usize,
}

impl Default for NeighborhoodGossip {
    fn default() -> Self {
        Self::new()
    }
}

impl NeighborhoodGossip {
    pub fn new() -> Self {
        Self::with_ttl(RECENT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            recent: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            ttl,
            fanout: NEIGHBORHOOD_GOSSIP_FANOUT,
        }
    }

    /// Record `id` for gossip; `false` when it was already gossiped within
    /// the TTL.
    pub fn first_sighting(&self, id: &B256) -> bool {
        let mut recent = self.recent.lock();
        if let Some(at) = recent.get(id) {
            if at.elapsed() < self.ttl {
                return false;
            }
        }
        recent.put(*id, Instant::now());
        true
    }

    /// Offer one admitted item to its neighborhood and stream to acceptors.
    /// Returns the number of peers that accepted.
    pub async fn gossip_item<T: GossipTransport>(
        &self,
        transport: Arc<T>,
        interested: Vec<Enr>,
        key: RawContentKey,
        content_id: B256,
        payload: Vec<u8>,
    ) -> usize {
        if !self.first_sighting(&content_id) {
            trace!(
                id = hex::encode(&content_id[..8]),
                "content recently gossiped; suppressed"
            );
            return 0;
        }
        let neighbors = select_neighbors(interested, &content_id, self.fanout);
        if neighbors.is_empty() {
            trace!(
                id = hex::encode(&content_id[..8]),
                "no radius-interested neighbors"
            );
            return 0;
        }

        let mut tasks: JoinSet<bool> = JoinSet::new();
        for peer in neighbors {
            let transport = transport.clone();
            let key = key.clone();
            let payload = payload.clone();
            tasks.spawn(async move {
                let accept = match transport.offer(&peer, vec![key]).await {
                    Ok(accept) => accept,
                    Err(e) => {
                        debug!(peer = %peer.node_id(), error = %e, "offer failed");
                        return false;
                    }
                };
                if !accept.accepted.get(0) {
                    trace!(peer = %peer.node_id(), "offer declined");
                    return false;
                }
                let conn_id = item_connection_id(accept.connection_id, 0);
                match transport.stream_item(&peer, conn_id, payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(peer = %peer.node_id(), error = %e, "gossip transfer failed");
                        false
                    }
                }
            });
        }

        let mut accepted = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                accepted += 1;
            }
        }
        debug!(
            id = hex::encode(&content_id[..8]),
            accepted,
            "neighborhood gossip round complete"
        );
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::EnrBuilder;
    use secp256k1::SecretKey;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;

    fn test_enr(seed: u8) -> Enr {
        let mut key = [0u8; 32];
        key[31] = seed.max(1);
        key[0] = 4;
        let sk = SecretKey::from_slice(&key).unwrap();
        EnrBuilder::new()
            .ip4(Ipv4Addr::LOCALHOST)
            .udp4(30000 + seed as u16)
            .build(&sk)
            .unwrap()
    }

    struct Recording {
        accept: bool,
        fail_offer: HashSet<crate::enr::NodeId>,
        offers: Mutex<Vec<crate::enr::NodeId>>,
        streams: Mutex<Vec<(crate::enr::NodeId, u16, usize)>>,
    }

    impl Recording {
        fn new(accept: bool) -> Self {
            Self {
                accept,
                fail_offer: HashSet::new(),
                offers: Mutex::new(Vec::new()),
                streams: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GossipTransport for Recording {
        async fn offer(
            &self,
            to: &Enr,
            keys: Vec<RawContentKey>,
        ) -> Result<AcceptResult, OverlayError> {
            self.offers.lock().push(to.node_id());
            if self.fail_offer.contains(&to.node_id()) {
                return Err(OverlayError::Transport(
                    crate::error::TransportError::Timeout,
                ));
            }
            let mut bits = BitList::with_len(keys.len());
            if self.accept {
                for i in 0..keys.len() {
                    bits.set(i, true);
                }
            }
            Ok(AcceptResult {
                connection_id: 0x4000,
                accepted: bits,
            })
        }

        async fn stream_item(
            &self,
            to: &Enr,
            conn_id: u16,
            payload: Vec<u8>,
        ) -> Result<(), UtpError> {
            self.streams
                .lock()
                .push((to.node_id(), conn_id, payload.len()));
            Ok(())
        }
    }

    fn content() -> (RawContentKey, B256, Vec<u8>) {
        (
            RawContentKey(vec![0x00, 0xAA]),
            B256::from([0x11; 32]),
            vec![0xCD; 256],
        )
    }

    #[tokio::test]
    async fn offers_at_most_fanout_peers() {
        let gossip = NeighborhoodGossip::new();
        let transport = Arc::new(Recording::new(true));
        let peers: Vec<Enr> = (1..=10).map(test_enr).collect();
        let (key, id, payload) = content();

        let accepted = gossip
            .gossip_item(transport.clone(), peers, key, id, payload)
            .await;
        assert_eq!(accepted, NEIGHBORHOOD_GOSSIP_FANOUT);
        assert_eq!(
            transport.offers.lock().len(),
            NEIGHBORHOOD_GOSSIP_FANOUT
        );
        assert_eq!(
            transport.streams.lock().len(),
            NEIGHBORHOOD_GOSSIP_FANOUT
        );
        for (_, conn_id, len) in transport.streams.lock().iter() {
            assert_eq!(*conn_id, 0x4000);
            assert_eq!(*len, 256);
        }
    }

    #[tokio::test]
    async fn neighbors_are_closest_to_content() {
        let peers: Vec<Enr> = (1..=10).map(test_enr).collect();
        let id = B256::from([0x11; 32]);
        let selected = select_neighbors(peers.clone(), &id, 4);
        assert_eq!(selected.len(), 4);
        let mut sorted = peers;
        sorted.sort_by_key(|e| e.node_id().distance_to(&id.0));
        for (a, b) in selected.iter().zip(sorted.iter()) {
            assert_eq!(a.node_id(), b.node_id());
        }
    }

    #[tokio::test]
    async fn duplicate_admission_suppressed_within_ttl() {
        let gossip = NeighborhoodGossip::new();
        let transport = Arc::new(Recording::new(true));
        let peers: Vec<Enr> = (1..=4).map(test_enr).collect();
        let (key, id, payload) = content();

        let first = gossip
            .gossip_item(
                transport.clone(),
                peers.clone(),
                key.clone(),
                id,
                payload.clone(),
            )
            .await;
        assert!(first > 0);
        let second = gossip.gossip_item(transport.clone(), peers, key, id, payload).await;
        assert_eq!(second, 0);
        assert_eq!(transport.offers.lock().len(), first);
    }

    #[tokio::test]
    async fn declined_offer_streams_nothing() {
        let gossip = NeighborhoodGossip::new();
        let transport = Arc::new(Recording::new(false));
        let peers: Vec<Enr> = (1..=4).map(test_enr).collect();
        let (key, id, payload) = content();

        let accepted = gossip.gossip_item(transport.clone(), peers, key, id, payload).await;
        assert_eq!(accepted, 0);
        assert!(!transport.offers.lock().is_empty());
        assert!(transport.streams.lock().is_empty());
    }

    #[tokio::test]
    async fn one_dead_peer_does_not_block_others() {
        let gossip = NeighborhoodGossip::new();
        let mut recording = Recording::new(true);
        let peers: Vec<Enr> = (1..=4).map(test_enr).collect();
        recording.fail_offer.insert(peers[0].node_id());
        let transport = Arc::new(recording);
        let (key, id, payload) = content();

        let accepted = gossip
            .gossip_item(transport.clone(), peers, key, id, payload)
            .await;
        assert_eq!(accepted, 3);
    }

    #[tokio::test]
    async fn ttl_expiry_allows_regossip() {
        let gossip = NeighborhoodGossip::with_ttl(Duration::from_millis(10));
        let id = B256::from([0x22; 32]);
        assert!(gossip.first_sighting(&id));
        assert!(!gossip.first_sighting(&id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gossip.first_sighting(&id));
    }

    #[test]
    fn item_ids_are_disjoint_pairs() {
        assert_eq!(item_connection_id(100, 0), 100);
        assert_eq!(item_connection_id(100, 1), 102);
        assert_eq!(item_connection_id(0xFFFF, 1), 1);
    }
}
