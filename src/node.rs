//! # High-Level Node API
//!
//! A [`Node`] combines one overlay per enabled sub-protocol, a shared
//! bulk-transfer endpoint, and a plain-UDP discovery substrate into a
//! single entry point.
//!
//! ## Quick Start
//!
//! ```ignore
//! let mut config = NodeConfig::default();
//! config.bind_address = "0.0.0.0:9009".parse()?;
//! config.bootnodes = vec![Enr::from_hex(seed)?];
//! let node = Node::bind(config).await?;
//! node.start().await?;
//!
//! let key = HistoryContentKey::BlockHeader(hash).encode();
//! let found = node.history().unwrap().lookup_content(key).await?;
//! ```
//!
//! ## Socket Model
//!
//! One UDP socket, one reader task, one writer task. The reader
//! demultiplexes datagrams: request frames dispatch to the owning overlay,
//! response frames resolve the pending-request table by nonce (late
//! responses are discarded), transfer frames feed the shared uTP endpoint
//! by connection id. All writes funnel through a single send queue.
//!
//! The embedded substrate carries no handshake or session encryption; the
//! `node` transport wires it to a plain socket, while the `web` and
//! `mobile` transports expect the embedder to construct overlays over its
//! own [`Discovery`] implementation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{keccak256, B256};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use secp256k1::SecretKey;
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::content::{Radius, SubProtocolId};
use crate::enr::{Enr, EnrBuilder, NodeId};
use crate::error::{StoreError, TransportError, ValidationError};
use crate::events::{ObserverSet, OverlayObserver, SubscriptionId};
use crate::history::{HeaderCache, HistoryVerifier, MasterAccumulator};
use crate::overlay::{OverlayConfig, OverlayService};
use crate::protocols::{ContentDb, Discovery, InboundTalk, Verifier};
use crate::state::StateVerifier;
use crate::store::{MemoryDb, StoreConfig};
use crate::utp::{OutboundPacket, UtpEndpoint};

/// Frame tags on the embedded UDP substrate.
const FRAME_REQUEST: u8 = 0xF0;
const FRAME_RESPONSE: u8 = 0xF1;
const FRAME_TRANSFER: u8 = 0xF2;

/// Deadline for an outbound request.
const TALK_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for a local handler to produce a response.
const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer records remembered for addressing transfer frames.
const PEER_CACHE_SIZE: usize = 4096;

/// Reserved persistence key prefix for routing snapshots.
const SNAPSHOT_PREFIX: &str = "routing:";

/// Bound for snapshot deserialization.
const MAX_SNAPSHOT_SIZE: u64 = 4 * 1024 * 1024;

/// Socket abstraction variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Plain UDP socket owned by this process.
    #[default]
    Node,
    /// Browser build: the embedder supplies the substrate.
    Web,
    /// Mobile build: the embedder supplies the substrate.
    Mobile,
}

#[derive(Clone)]
pub struct NodeConfig {
    /// Which overlays to instantiate.
    pub supported_protocols: Vec<SubProtocolId>,
    /// Initial responsibility radius.
    pub radius: Radius,
    /// Seed records for table warm-up.
    pub bootnodes: Vec<Enr>,
    pub bind_address: SocketAddr,
    pub transport: TransportKind,
    /// Reload routing-table state from persistence on startup.
    pub rebuild_from_memory: bool,
    /// Content budget per overlay, bytes.
    pub storage_budget: u64,
    /// Master-accumulator epoch roots for pre-merge header verification.
    pub historical_epochs: Vec<B256>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            supported_protocols: vec![SubProtocolId::History, SubProtocolId::State],
            radius: Radius::MAX,
            bootnodes: Vec::new(),
            bind_address: "0.0.0.0:9009".parse().expect("static address parses"),
            transport: TransportKind::Node,
            rebuild_from_memory: false,
            storage_budget: 1024 * 1024 * 1024,
            historical_epochs: Vec::new(),
        }
    }
}

// ============================================================================
// Content-addressed verifiers for the thin namespaces
// ============================================================================

/// `sha256(payload)` must equal the key body. Used by the Beacon overlay.
pub struct Sha256Verifier;

impl Verifier for Sha256Verifier {
    fn verify(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
        let digest: [u8; 32] = key
            .get(1..)
            .and_then(|b| b.try_into().ok())
            .ok_or(ValidationError::MalformedKey)?;
        let computed: [u8; 32] = Sha256::digest(payload).into();
        if computed != digest {
            return Err(ValidationError::HashMismatch {
                expected: hex::encode(digest),
                computed: hex::encode(computed),
            });
        }
        Ok(payload.to_vec())
    }
}

/// `keccak256(payload)` must equal the key body. Used by CanonicalIndices.
pub struct KeccakVerifier;

impl Verifier for KeccakVerifier {
    fn verify(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
        let digest: [u8; 32] = key
            .get(1..)
            .and_then(|b| b.try_into().ok())
            .ok_or(ValidationError::MalformedKey)?;
        let computed = keccak256(payload);
        if computed.0 != digest {
            return Err(ValidationError::HashMismatch {
                expected: hex::encode(digest),
                computed: hex::encode(computed),
            });
        }
        Ok(payload.to_vec())
    }
}

// ============================================================================
// Embedded UDP discovery substrate
// ============================================================================

/// Plain-UDP request/response substrate with nonce correlation.
///
/// Frames:
///
/// | Tag | Layout |
/// |-----|--------|
/// | 0xF0 | nonce (8 LE) ++ protocol tag (2) ++ enr len (2 LE) ++ sender enr ++ payload |
/// | 0xF1 | nonce (8 LE) ++ payload |
/// | 0xF2 | sender node id (32) ++ transfer packet |
pub struct UdpDiscovery {
    local_enr: RwLock<Enr>,
    send_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<u8>>>>,
    next_nonce: AtomicU64,
    /// Peers we can address transfer frames from, learned both ways.
    peers: Mutex<LruCache<NodeId, Enr>>,
}

impl UdpDiscovery {
    fn new(local_enr: Enr, send_tx: mpsc::Sender<(SocketAddr, Vec<u8>)>) -> Self {
        Self {
            local_enr: RwLock::new(local_enr),
            send_tx,
            pending: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            peers: Mutex::new(LruCache::new(
                NonZeroUsize::new(PEER_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    fn remember(&self, enr: &Enr) {
        self.peers.lock().put(enr.node_id(), enr.clone());
    }

    fn peer(&self, id: &NodeId) -> Option<Enr> {
        self.peers.lock().get(id).cloned()
    }

    async fn enqueue(&self, to: SocketAddr, frame: Vec<u8>) -> Result<(), TransportError> {
        self.send_tx
            .send((to, frame))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Discovery for UdpDiscovery {
    fn local_enr(&self) -> Enr {
        self.local_enr.read().clone()
    }

    async fn talk(
        &self,
        to: &Enr,
        protocol: SubProtocolId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let addr = to.udp_socket().ok_or(TransportError::NoRoute)?;
        self.remember(to);
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(nonce, tx);

        let local = self.local_enr();
        let mut frame = Vec::with_capacity(13 + local.encoded().len() + payload.len());
        frame.push(FRAME_REQUEST);
        frame.extend_from_slice(&nonce.to_le_bytes());
        frame.extend_from_slice(&protocol.tag());
        frame.extend_from_slice(&(local.encoded().len() as u16).to_le_bytes());
        frame.extend_from_slice(local.encoded());
        frame.extend_from_slice(&payload);
        self.enqueue(addr, frame).await?;

        match tokio::time::timeout(TALK_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                // Expired: any late response for this nonce is discarded.
                self.pending.lock().remove(&nonce);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_raw(&self, to: &Enr, payload: Vec<u8>) -> Result<(), TransportError> {
        let addr = to.udp_socket().ok_or(TransportError::NoRoute)?;
        self.remember(to);
        let local_id = self.local_enr().node_id();
        let mut frame = Vec::with_capacity(33 + payload.len());
        frame.push(FRAME_TRANSFER);
        frame.extend_from_slice(local_id.as_bytes());
        frame.extend_from_slice(&payload);
        self.enqueue(addr, frame).await
    }
}

// ============================================================================
// Node
// ============================================================================

pub struct Node {
    config: NodeConfig,
    discovery: Arc<UdpDiscovery>,
    db: Arc<dyn ContentDb>,
    observers: Arc<ObserverSet>,
    overlays: HashMap<SubProtocolId, OverlayService<UdpDiscovery>>,
    local_addr: SocketAddr,
}

impl Node {
    /// Bind a node with a fresh identity and the default in-memory backend.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let secret = SecretKey::new(&mut OsRng);
        Self::bind_with(config, secret, Arc::new(MemoryDb::new())).await
    }

    /// Bind with an explicit identity key and persistence backend.
    pub async fn bind_with(
        config: NodeConfig,
        secret: SecretKey,
        db: Arc<dyn ContentDb>,
    ) -> Result<Self> {
        if config.transport != TransportKind::Node {
            // Fatal at startup: the embedded substrate only speaks UDP.
            return Err(anyhow!(
                "transport {:?} requires an embedder-supplied discovery substrate; \
                 build overlays over your own Discovery implementation instead",
                config.transport
            ));
        }
        if config.supported_protocols.is_empty() {
            return Err(anyhow!("no sub-protocols enabled"));
        }

        let socket = UdpSocket::bind(config.bind_address)
            .await
            .context("failed to bind UDP socket")?;
        let local_addr = socket.local_addr().context("failed to read local address")?;
        let socket = Arc::new(socket);

        let ip = match local_addr {
            SocketAddr::V4(v4) => *v4.ip(),
            SocketAddr::V6(_) => "127.0.0.1".parse().expect("static address parses"),
        };
        let local_enr = EnrBuilder::new()
            .ip4(ip)
            .udp4(local_addr.port())
            .build(&secret)
            .map_err(|e| anyhow!("failed to build local record: {e}"))?;
        info!(
            node_id = %local_enr.node_id(),
            addr = %local_addr,
            "node identity ready"
        );

        // Writer task: the single point of socket write access.
        let (send_tx, mut send_rx) = mpsc::channel::<(SocketAddr, Vec<u8>)>(1024);
        {
            let socket = socket.clone();
            tokio::spawn(async move {
                while let Some((addr, frame)) = send_rx.recv().await {
                    if let Err(e) = socket.send_to(&frame, addr).await {
                        trace!(error = %e, "socket send failed");
                    }
                }
            });
        }

        let discovery = Arc::new(UdpDiscovery::new(local_enr, send_tx));
        let observers = Arc::new(ObserverSet::new());

        // Shared transfer endpoint, drained through the discovery substrate.
        let (utp_tx, mut utp_rx) = mpsc::channel::<OutboundPacket>(1024);
        let utp = UtpEndpoint::new(utp_tx);
        {
            let discovery = discovery.clone();
            tokio::spawn(async move {
                while let Some(packet) = utp_rx.recv().await {
                    if let Err(e) = discovery.send_raw(&packet.to, packet.data).await {
                        trace!(error = %e, "transfer datagram send failed");
                    }
                }
            });
        }

        let mut overlays = HashMap::new();
        for protocol in &config.supported_protocols {
            let verifier = build_verifier(*protocol, &config, &observers);
            let overlay_config = OverlayConfig {
                protocol: *protocol,
                store: StoreConfig {
                    max_bytes: config.storage_budget,
                    initial_radius: config.radius,
                },
                ..OverlayConfig::new(*protocol)
            };
            let overlay = OverlayService::with_utp(
                overlay_config,
                discovery.clone(),
                db.clone(),
                verifier,
                observers.clone(),
                utp.clone(),
            );
            overlays.insert(*protocol, overlay);
        }

        let node = Self {
            config,
            discovery,
            db,
            observers,
            overlays,
            local_addr,
        };
        node.spawn_reader(socket, utp);
        Ok(node)
    }

    /// Socket reader: demultiplex by frame tag, then by nonce or
    /// connection id.
    fn spawn_reader(&self, socket: Arc<UdpSocket>, utp: UtpEndpoint) {
        let discovery = self.discovery.clone();
        let overlays = self.overlays.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (len, _from) = match socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "socket receive failed");
                        continue;
                    }
                };
                let datagram = &buf[..len];
                let Some((&tag, rest)) = datagram.split_first() else {
                    continue;
                };
                match tag {
                    FRAME_REQUEST => {
                        handle_request_frame(&discovery, &overlays, rest);
                    }
                    FRAME_RESPONSE => {
                        if rest.len() < 8 {
                            continue;
                        }
                        let nonce = u64::from_le_bytes(rest[..8].try_into().unwrap());
                        // Unknown nonce: a response whose deadline already
                        // resolved the awaiter. Discard.
                        if let Some(tx) = discovery.pending.lock().remove(&nonce) {
                            let _ = tx.send(rest[8..].to_vec());
                        }
                    }
                    FRAME_TRANSFER => {
                        if rest.len() < 32 {
                            continue;
                        }
                        let id = NodeId::from_bytes(rest[..32].try_into().unwrap());
                        match discovery.peer(&id) {
                            Some(enr) => utp.handle_inbound(&enr, &rest[32..]),
                            None => {
                                trace!(peer = %id, "transfer frame from unknown peer dropped")
                            }
                        }
                    }
                    other => {
                        trace!(tag = other, "unknown frame tag dropped");
                    }
                }
            }
        });
    }

    /// Warm up: optionally reload persisted routing state, rebuild content
    /// indexes, then bootstrap every overlay from the configured seeds.
    pub async fn start(&self) -> Result<()> {
        for (protocol, overlay) in &self.overlays {
            overlay
                .load_content_index()
                .await
                .map_err(|e| anyhow!("content index for {protocol}: {e}"))?;
            if self.config.rebuild_from_memory {
                match self.load_snapshot(*protocol).await {
                    Ok(enrs) => {
                        let count = enrs.len();
                        for enr in enrs {
                            overlay.add_enr(enr.clone()).await;
                            // Revalidate: snapshots go stale while offline.
                            let overlay = overlay.clone();
                            tokio::spawn(async move {
                                let _ = overlay.ping(&enr).await;
                            });
                        }
                        info!(protocol = %protocol, count, "routing snapshot reloaded");
                    }
                    Err(e) => debug!(protocol = %protocol, error = %e, "no usable snapshot"),
                }
            }
            overlay.bootstrap(&self.config.bootnodes).await;
        }
        Ok(())
    }

    pub fn local_enr(&self) -> Enr {
        self.discovery.local_enr()
    }

    pub fn node_id(&self) -> NodeId {
        self.discovery.local_enr().node_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn overlay(&self, protocol: SubProtocolId) -> Option<&OverlayService<UdpDiscovery>> {
        self.overlays.get(&protocol)
    }

    pub fn history(&self) -> Option<&OverlayService<UdpDiscovery>> {
        self.overlay(SubProtocolId::History)
    }

    pub fn state(&self) -> Option<&OverlayService<UdpDiscovery>> {
        self.overlay(SubProtocolId::State)
    }

    pub fn subscribe(&self, observer: Arc<dyn OverlayObserver>) -> SubscriptionId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.observers.unsubscribe(subscription)
    }

    /// Persist every overlay's routing table for `rebuild-from-memory`.
    pub async fn snapshot_routing(&self) -> Result<()> {
        for (protocol, overlay) in &self.overlays {
            let enrs = overlay.snapshot().await;
            let bytes = bincode::serialize(&enrs).context("snapshot encoding failed")?;
            self.db
                .put(&format!("{SNAPSHOT_PREFIX}{}", protocol.name()), bytes)
                .await
                .map_err(|e| anyhow!("snapshot write failed: {e}"))?;
            debug!(protocol = %protocol, "routing snapshot written");
        }
        Ok(())
    }

    async fn load_snapshot(&self, protocol: SubProtocolId) -> Result<Vec<Enr>, StoreError> {
        let key = format!("{SNAPSHOT_PREFIX}{}", protocol.name());
        let bytes = self
            .db
            .get(&key)
            .await?
            .ok_or_else(|| StoreError::Backend("no snapshot".into()))?;
        let blobs: Vec<Vec<u8>> = {
            use bincode::Options;
            bincode::DefaultOptions::new()
                .with_limit(MAX_SNAPSHOT_SIZE)
                .with_fixint_encoding()
                .deserialize(&bytes)
                .map_err(|_| StoreError::CorruptMetadata(key))?
        };
        Ok(blobs
            .iter()
            .filter_map(|blob| Enr::decode(blob).ok())
            .collect())
    }
}

/// Decode and dispatch one request frame.
fn handle_request_frame(
    discovery: &Arc<UdpDiscovery>,
    overlays: &HashMap<SubProtocolId, OverlayService<UdpDiscovery>>,
    rest: &[u8],
) {
    if rest.len() < 12 {
        return;
    }
    let nonce = u64::from_le_bytes(rest[..8].try_into().unwrap());
    let Some(protocol) = SubProtocolId::from_tag([rest[8], rest[9]]) else {
        trace!("request for unsupported sub-protocol dropped");
        return;
    };
    let enr_len = u16::from_le_bytes([rest[10], rest[11]]) as usize;
    if rest.len() < 12 + enr_len {
        return;
    }
    let Ok(from) = Enr::decode(&rest[12..12 + enr_len]) else {
        trace!("request with undecodable sender record dropped");
        return;
    };
    let payload = rest[12 + enr_len..].to_vec();
    let Some(overlay) = overlays.get(&protocol).cloned() else {
        trace!(protocol = %protocol, "request for disabled overlay dropped");
        return;
    };

    discovery.remember(&from);
    let discovery = discovery.clone();
    tokio::spawn(async move {
        let reply_addr = from.udp_socket();
        let (tx, rx) = oneshot::channel();
        overlay
            .handle_talk(InboundTalk {
                from,
                protocol,
                payload,
                respond: Some(tx),
            })
            .await;
        let Ok(Ok(reply)) = tokio::time::timeout(HANDLER_TIMEOUT, rx).await else {
            return;
        };
        let Some(addr) = reply_addr else { return };
        let mut frame = Vec::with_capacity(9 + reply.len());
        frame.push(FRAME_RESPONSE);
        frame.extend_from_slice(&nonce.to_le_bytes());
        frame.extend_from_slice(&reply);
        let _ = discovery.enqueue(addr, frame).await;
    });
}

fn build_verifier(
    protocol: SubProtocolId,
    config: &NodeConfig,
    observers: &Arc<ObserverSet>,
) -> Arc<dyn Verifier> {
    match protocol {
        SubProtocolId::History => {
            let headers = Arc::new(HeaderCache::new());
            observers.subscribe(headers.clone());
            Arc::new(HistoryVerifier::new(
                Arc::new(MasterAccumulator::new(config.historical_epochs.clone())),
                headers,
            ))
        }
        SubProtocolId::State => Arc::new(StateVerifier::new()),
        SubProtocolId::Beacon => Arc::new(Sha256Verifier),
        SubProtocolId::CanonicalIndices => Arc::new(KeccakVerifier),
    }
}
