//! # Overlay Service
//!
//! One service per sub-protocol, binding a routing table, a content store,
//! a content-id function, a verifier set, and the uniform dispatcher from
//! incoming wire messages to handlers.
//!
//! ## Actor Architecture
//!
//! - [`OverlayService`]: cheaply cloneable public handle
//! - `OverlayActor`: private actor owning the routing table and content
//!   store; commands arrive over an async channel and are processed
//!   sequentially, which makes table mutation and content admission
//!   linearizable without locks
//!
//! Network I/O never runs inside the actor: RPC methods live on the handle,
//! long-running transfers are spawned tasks, and the actor only touches
//! state.
//!
//! ## Inbound Dispatch
//!
//! | Message | Handling |
//! |---------|----------|
//! | PING | record sender + radius, answer PONG with local seq and radius |
//! | FINDNODES | records at the requested log2-distances, greedily packed |
//! | FINDCONTENT | payload inline, transfer connection id, or closer peers |
//! | OFFER | bitlist of wanted keys, transfer intake, admit + re-gossip |
//!
//! Responses (PONG, NODES, CONTENT, ACCEPT) arriving outside an exchange
//! are dropped.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::content::{content_id, distance, RawContentKey, Radius, SubProtocolId};
use crate::enr::{Enr, NodeId};
use crate::error::{LookupError, OverlayError, StoreError, TransportError, ValidationError};
use crate::events::ObserverSet;
use crate::gossip::{
    item_connection_id, AcceptResult, GossipTransport, NeighborhoodGossip,
};
use crate::lookup::{
    content_lookup, node_lookup, ContentFound, ContentResponse, LookupConfig, LookupTransport,
    NodesFound,
};
use crate::protocols::{ContentDb, Discovery, InboundTalk, Verifier};
use crate::routing::{InsertOutcome, RoutingTable};
use crate::store::{AdmitOutcome, ContentStore, StoreConfig};
use crate::utp::{OutboundPacket, UtpConfig, UtpEndpoint};
use crate::wire::{
    content_fits_inline, parse_radius_payload, radius_payload, Accept, BitList, Content,
    FindContent, FindNodes, Message, Nodes, Offer, Ping, Pong, MAX_DISCOVERY_PACKET,
    MAX_KEYS_PER_OFFER, NODES_LIMIT,
};

/// Closest records returned when FINDCONTENT misses.
const CONTENT_ENR_LIMIT: usize = 8;

/// Capacity of the actor command channel.
const COMMAND_BUFFER: usize = 256;

/// Interval of the background liveness probe.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness ticks between bucket-refresh lookups.
const REFRESH_EVERY_TICKS: u64 = 4;

#[derive(Clone)]
pub struct OverlayConfig {
    pub protocol: SubProtocolId,
    pub store: StoreConfig,
    pub lookup: LookupConfig,
    pub utp: UtpConfig,
    /// Disable the periodic liveness prober (simulations drive it manually).
    pub background_liveness: bool,
}

impl OverlayConfig {
    pub fn new(protocol: SubProtocolId) -> Self {
        Self {
            protocol,
            store: StoreConfig::default(),
            lookup: LookupConfig::default(),
            utp: UtpConfig::default(),
            background_liveness: true,
        }
    }
}

enum Command {
    InsertEnr {
        enr: Enr,
        reply: Option<oneshot::Sender<Option<Enr>>>,
    },
    ResolveProbe {
        id: NodeId,
        alive: bool,
    },
    MarkSuccess {
        id: NodeId,
    },
    MarkFailure {
        id: NodeId,
    },
    SetPeerRadius {
        id: NodeId,
        radius: Radius,
    },
    Nearest {
        target: [u8; 32],
        k: usize,
        reply: oneshot::Sender<Vec<Enr>>,
    },
    AtLogDistances {
        distances: Vec<u16>,
        reply: oneshot::Sender<Vec<Enr>>,
    },
    TableEntries {
        reply: oneshot::Sender<Vec<Enr>>,
    },
    TableLen {
        reply: oneshot::Sender<usize>,
    },
    LivenessTarget {
        reply: oneshot::Sender<Option<Enr>>,
    },
    OccupiedBuckets {
        reply: oneshot::Sender<Vec<usize>>,
    },
    LocalRadius {
        reply: oneshot::Sender<Radius>,
    },
    SetLocalRadius {
        radius: Radius,
    },
    Admit {
        key: RawContentKey,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<AdmitOutcome, StoreError>>,
    },
    ContentLookupLocal {
        id: B256,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, StoreError>>,
    },
    ContainsContent {
        id: B256,
        reply: oneshot::Sender<bool>,
    },
    ContentCount {
        reply: oneshot::Sender<usize>,
    },
    InterestedPeers {
        content_id: B256,
        reply: oneshot::Sender<Vec<Enr>>,
    },
    LoadIndex {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

struct OverlayActor {
    protocol: SubProtocolId,
    table: RoutingTable,
    store: ContentStore,
    observers: Arc<ObserverSet>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl OverlayActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            self.handle(cmd).await;
        }
        debug!(protocol = %self.protocol, "overlay actor stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::InsertEnr { enr, reply } => {
                let id = enr.node_id();
                let probe = match self.table.insert(enr) {
                    InsertOutcome::Inserted => {
                        self.observers.node_added(id, self.protocol);
                        None
                    }
                    InsertOutcome::PendingProbe { least_recent } => Some(*least_recent),
                    InsertOutcome::Refreshed | InsertOutcome::Discarded => None,
                };
                if let Some(reply) = reply {
                    let _ = reply.send(probe);
                }
            }
            Command::ResolveProbe { id, alive } => {
                self.table.resolve_probe(&id, alive);
                if !alive {
                    self.observers.node_removed(id, self.protocol);
                }
            }
            Command::MarkSuccess { id } => self.table.mark_success(&id),
            Command::MarkFailure { id } => {
                if self.table.mark_failure(&id) {
                    info!(protocol = %self.protocol, peer = %id, "peer evicted after repeated failures");
                    self.observers.node_removed(id, self.protocol);
                }
            }
            Command::SetPeerRadius { id, radius } => self.table.set_radius(&id, radius),
            Command::Nearest { target, k, reply } => {
                let _ = reply.send(self.table.nearest(&target, k));
            }
            Command::AtLogDistances { distances, reply } => {
                let mut out = Vec::new();
                for d in distances {
                    out.extend(self.table.at_log_distance(d));
                }
                let _ = reply.send(out);
            }
            Command::TableEntries { reply } => {
                let _ = reply.send(self.table.entries());
            }
            Command::TableLen { reply } => {
                let _ = reply.send(self.table.len());
            }
            Command::LivenessTarget { reply } => {
                let occupied = self.table.occupied_buckets();
                let target = if occupied.is_empty() {
                    None
                } else {
                    use rand::Rng;
                    let bucket = occupied[rand::thread_rng().gen_range(0..occupied.len())];
                    // The least-recent entry of the picked bucket is the one
                    // whose liveness is most in doubt.
                    self.table
                        .at_log_distance((256 - bucket) as u16)
                        .into_iter()
                        .next()
                };
                let _ = reply.send(target);
            }
            Command::OccupiedBuckets { reply } => {
                let _ = reply.send(self.table.occupied_buckets());
            }
            Command::LocalRadius { reply } => {
                let _ = reply.send(self.store.radius());
            }
            Command::SetLocalRadius { radius } => self.store.set_radius(radius),
            Command::Admit { key, payload, reply } => {
                let _ = reply.send(self.store.admit(key, payload).await);
            }
            Command::ContentLookupLocal { id, reply } => {
                let _ = reply.send(self.store.lookup_by_id(&id).await);
            }
            Command::ContainsContent { id, reply } => {
                let _ = reply.send(self.store.contains_id(&id));
            }
            Command::ContentCount { reply } => {
                let _ = reply.send(self.store.len());
            }
            Command::InterestedPeers { content_id, reply } => {
                let peers = self
                    .table
                    .interested_in(|peer| peer.distance_to(&content_id.0));
                let _ = reply.send(peers);
            }
            Command::LoadIndex { reply } => {
                let _ = reply.send(self.store.load_index().await);
            }
        }
    }
}

struct Inner<D: Discovery> {
    protocol: SubProtocolId,
    local_id: NodeId,
    discovery: Arc<D>,
    utp: UtpEndpoint,
    verifier: Arc<dyn Verifier>,
    observers: Arc<ObserverSet>,
    gossip: NeighborhoodGossip,
    lookup_config: LookupConfig,
    cmd_tx: mpsc::Sender<Command>,
}

/// Public handle for one sub-protocol overlay.
pub struct OverlayService<D: Discovery> {
    inner: Arc<Inner<D>>,
}

impl<D: Discovery> Clone for OverlayService<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Discovery> OverlayService<D> {
    /// Build an overlay with its own transfer endpoint, drained straight
    /// into the discovery substrate. Nodes hosting several overlays share
    /// one endpoint instead via [`OverlayService::with_utp`].
    pub fn new(
        config: OverlayConfig,
        discovery: Arc<D>,
        db: Arc<dyn ContentDb>,
        verifier: Arc<dyn Verifier>,
        observers: Arc<ObserverSet>,
    ) -> Self {
        let (utp_out_tx, mut utp_out_rx) = mpsc::channel::<OutboundPacket>(COMMAND_BUFFER);
        let utp = UtpEndpoint::with_config(utp_out_tx, config.utp.clone());
        {
            let discovery = discovery.clone();
            tokio::spawn(async move {
                while let Some(packet) = utp_out_rx.recv().await {
                    if let Err(e) = discovery.send_raw(&packet.to, packet.data).await {
                        trace!(error = %e, "transfer datagram send failed");
                    }
                }
            });
        }
        Self::with_utp(config, discovery, db, verifier, observers, utp)
    }

    /// Build an overlay on a shared transfer endpoint.
    pub fn with_utp(
        config: OverlayConfig,
        discovery: Arc<D>,
        db: Arc<dyn ContentDb>,
        verifier: Arc<dyn Verifier>,
        observers: Arc<ObserverSet>,
        utp: UtpEndpoint,
    ) -> Self {
        let local_id = discovery.local_enr().node_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

        let actor = OverlayActor {
            protocol: config.protocol,
            table: RoutingTable::new(local_id),
            store: ContentStore::new(
                config.protocol,
                local_id,
                db,
                verifier.clone(),
                observers.clone(),
                StoreConfig {
                    max_bytes: config.store.max_bytes,
                    initial_radius: config.store.initial_radius,
                },
            ),
            observers: observers.clone(),
            cmd_rx,
        };
        tokio::spawn(actor.run());

        let service = Self {
            inner: Arc::new(Inner {
                protocol: config.protocol,
                local_id,
                discovery,
                utp,
                verifier,
                observers,
                gossip: NeighborhoodGossip::new(),
                lookup_config: config.lookup,
                cmd_tx,
            }),
        };

        if config.background_liveness {
            service.spawn_liveness_task();
        }
        service
    }

    pub fn protocol(&self) -> SubProtocolId {
        self.inner.protocol
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn local_enr(&self) -> Enr {
        self.inner.discovery.local_enr()
    }

    pub fn observers(&self) -> &Arc<ObserverSet> {
        &self.inner.observers
    }

    /// Inbound transfer datagram from the socket demultiplexer.
    pub fn handle_transfer_packet(&self, from: &Enr, datagram: &[u8]) {
        self.inner.utp.handle_inbound(from, datagram);
    }

    /// Rebuild the content index from the persistence backend.
    pub async fn load_content_index(&self) -> Result<(), OverlayError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::LoadIndex { reply: tx }).await?;
        rx.await.map_err(|_| OverlayError::Closed)??;
        Ok(())
    }

    async fn command(&self, cmd: Command) -> Result<(), OverlayError> {
        self.inner
            .cmd_tx
            .send(cmd)
            .await
            .map_err(|_| OverlayError::Closed)
    }

    async fn query<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, OverlayError> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx)).await?;
        rx.await.map_err(|_| OverlayError::Closed)
    }

    /// Offer a record to the routing table; probes the displaced candidate
    /// when a bucket is full.
    pub async fn add_enr(&self, enr: Enr) {
        if enr.node_id() == self.inner.local_id {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self
            .command(Command::InsertEnr {
                enr,
                reply: Some(tx),
            })
            .await
            .is_err()
        {
            return;
        }
        if let Ok(Some(probe_target)) = rx.await {
            let this = self.clone();
            tokio::spawn(async move {
                let alive = this.ping(&probe_target).await.is_ok();
                let _ = this
                    .command(Command::ResolveProbe {
                        id: probe_target.node_id(),
                        alive,
                    })
                    .await;
            });
        }
    }

    pub async fn table_len(&self) -> usize {
        self.query(|tx| Command::TableLen { reply: tx })
            .await
            .unwrap_or(0)
    }

    /// Number of locally stored content items.
    pub async fn content_count(&self) -> usize {
        self.query(|tx| Command::ContentCount { reply: tx })
            .await
            .unwrap_or(0)
    }

    pub async fn table_entries(&self) -> Vec<Enr> {
        self.query(|tx| Command::TableEntries { reply: tx })
            .await
            .unwrap_or_default()
    }

    pub async fn nearest(&self, target: [u8; 32], k: usize) -> Vec<Enr> {
        self.query(|tx| Command::Nearest {
            target,
            k,
            reply: tx,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn radius(&self) -> Radius {
        self.query(|tx| Command::LocalRadius { reply: tx })
            .await
            .unwrap_or(Radius::MAX)
    }

    /// Explicit radius reconfiguration.
    pub async fn set_radius(&self, radius: Radius) {
        let _ = self.command(Command::SetLocalRadius { radius }).await;
    }

    /// Encoded records of every table entry, for the startup snapshot.
    pub async fn snapshot(&self) -> Vec<Vec<u8>> {
        self.table_entries()
            .await
            .into_iter()
            .map(|e| e.encoded().to_vec())
            .collect()
    }

    // ------------------------------------------------------------------
    // Outbound exchanges
    // ------------------------------------------------------------------

    async fn talk(&self, to: &Enr, message: Message) -> Result<Message, OverlayError> {
        let result = self
            .inner
            .discovery
            .talk(to, self.inner.protocol, message.encode())
            .await;
        let id = to.node_id();
        match result {
            Ok(bytes) => match Message::decode(&bytes) {
                Ok(decoded) => {
                    self.command(Command::MarkSuccess { id }).await.ok();
                    Ok(decoded)
                }
                Err(e) => {
                    warn!(peer = %id, error = %e, "malformed response");
                    Err(OverlayError::Wire(e))
                }
            },
            Err(e) => {
                self.command(Command::MarkFailure { id }).await.ok();
                Err(OverlayError::Transport(e))
            }
        }
    }

    /// PING the peer; on PONG, record its radius and record revision.
    pub async fn ping(&self, to: &Enr) -> Result<Pong, OverlayError> {
        let radius = self.radius().await;
        let message = Message::Ping(Ping {
            enr_seq: self.local_enr().seq(),
            custom_payload: radius_payload(radius),
        });
        match self.talk(to, message).await? {
            Message::Pong(pong) => {
                let id = to.node_id();
                self.command(Command::InsertEnr {
                    enr: to.clone(),
                    reply: None,
                })
                .await
                .ok();
                if let Some(peer_radius) = parse_radius_payload(&pong.custom_payload) {
                    self.command(Command::SetPeerRadius {
                        id,
                        radius: peer_radius,
                    })
                    .await
                    .ok();
                }
                Ok(pong)
            }
            other => {
                warn!(peer = %to.node_id(), got = other.kind(), "expected PONG");
                Err(OverlayError::Transport(TransportError::Send(
                    "unexpected response kind".into(),
                )))
            }
        }
    }

    /// FINDNODES at explicit log2-distances.
    pub async fn find_nodes_rpc(
        &self,
        to: &Enr,
        distances: Vec<u16>,
    ) -> Result<Vec<Enr>, OverlayError> {
        let message = Message::FindNodes(FindNodes { distances });
        match self.talk(to, message).await? {
            Message::Nodes(nodes) => {
                let decoded = decode_enrs(&nodes.enrs);
                for enr in &decoded {
                    self.add_enr(enr.clone()).await;
                }
                Ok(decoded)
            }
            other => {
                warn!(peer = %to.node_id(), got = other.kind(), "expected NODES");
                Err(OverlayError::Transport(TransportError::Send(
                    "unexpected response kind".into(),
                )))
            }
        }
    }

    /// FINDCONTENT for a serialized key; resolves the response union.
    pub async fn find_content_rpc(
        &self,
        to: &Enr,
        key: &RawContentKey,
    ) -> Result<ContentResponse, OverlayError> {
        let message = Message::FindContent(FindContent {
            content_key: key.0.clone(),
        });
        match self.talk(to, message).await? {
            Message::Content(Content::Payload(payload)) => {
                Ok(ContentResponse::Payload(payload))
            }
            Message::Content(Content::ConnectionId(conn_id)) => {
                Ok(ContentResponse::Transfer(conn_id))
            }
            Message::Content(Content::Enrs(blobs)) => {
                let decoded = decode_enrs(&blobs);
                for enr in &decoded {
                    self.add_enr(enr.clone()).await;
                }
                Ok(ContentResponse::Enrs(decoded))
            }
            other => {
                warn!(peer = %to.node_id(), got = other.kind(), "expected CONTENT");
                Err(OverlayError::Transport(TransportError::Send(
                    "unexpected response kind".into(),
                )))
            }
        }
    }

    /// OFFER keys; await ACCEPT.
    pub async fn offer_rpc(
        &self,
        to: &Enr,
        keys: Vec<RawContentKey>,
    ) -> Result<AcceptResult, OverlayError> {
        let message = Message::Offer(Offer {
            content_keys: keys.into_iter().map(|k| k.0).collect(),
        });
        match self.talk(to, message).await? {
            Message::Accept(accept) => Ok(AcceptResult {
                connection_id: accept.connection_id,
                accepted: accept.content_keys,
            }),
            other => {
                warn!(peer = %to.node_id(), got = other.kind(), "expected ACCEPT");
                Err(OverlayError::Transport(TransportError::Send(
                    "unexpected response kind".into(),
                )))
            }
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Iterative FINDNODE toward `target`.
    pub async fn lookup_nodes(&self, target: [u8; 32]) -> NodesFound {
        let seeds = self
            .nearest(target, self.inner.lookup_config.k)
            .await;
        node_lookup(
            Arc::new(self.clone()),
            target,
            seeds,
            self.inner.lookup_config,
        )
        .await
    }

    /// Recursive content retrieval: local store first, then the network.
    /// A verified network payload is admitted and gossiped.
    pub async fn lookup_content(
        &self,
        key: RawContentKey,
    ) -> Result<ContentFound, LookupError> {
        let id = content_id(self.inner.protocol, &key);
        if let Ok(Ok(Some(payload))) = self
            .query(|tx| Command::ContentLookupLocal { id, reply: tx })
            .await
            .map_err(|_| LookupError::Cancelled)
        {
            return Ok(ContentFound {
                payload,
                source: self.inner.local_id,
                probes: 0,
            });
        }

        let seeds = self.nearest(id.0, self.inner.lookup_config.k).await;
        let found = content_lookup(
            Arc::new(self.clone()),
            key.clone(),
            id.0,
            seeds,
            self.inner.lookup_config,
        )
        .await?;

        // Store-and-forward: content we just proved belongs to anyone whose
        // radius covers it, possibly including us.
        let this = self.clone();
        let payload = found.payload.clone();
        tokio::spawn(async move {
            let _ = this.admit_and_gossip(key, payload).await;
        });
        Ok(found)
    }

    /// Admit content locally (verifying it) and gossip to the neighborhood.
    pub async fn store_content(
        &self,
        key: RawContentKey,
        payload: Vec<u8>,
    ) -> Result<AdmitOutcome, OverlayError> {
        Ok(self.admit_and_gossip(key, payload).await?)
    }

    /// Stored payload for `key`, local only.
    pub async fn local_content(
        &self,
        key: &RawContentKey,
    ) -> Result<Option<Vec<u8>>, OverlayError> {
        let id = content_id(self.inner.protocol, key);
        Ok(self
            .query(|tx| Command::ContentLookupLocal { id, reply: tx })
            .await??)
    }

    async fn admit_and_gossip(
        &self,
        key: RawContentKey,
        payload: Vec<u8>,
    ) -> Result<AdmitOutcome, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Admit {
            key: key.clone(),
            payload: payload.clone(),
            reply: tx,
        })
        .await
        .map_err(|_| StoreError::Backend("overlay closed".into()))?;
        let outcome = rx
            .await
            .map_err(|_| StoreError::Backend("overlay closed".into()))??;

        if outcome == AdmitOutcome::Stored {
            let id = content_id(self.inner.protocol, &key);
            let interested = self
                .query(|tx| Command::InterestedPeers {
                    content_id: id,
                    reply: tx,
                })
                .await
                .unwrap_or_default();
            let this = self.clone();
            tokio::spawn(async move {
                this.inner
                    .gossip
                    .gossip_item(Arc::new(this.clone()), interested, key, id, payload)
                    .await;
            });
        }
        Ok(outcome)
    }

    /// Seed the table from bootnodes and run a self-lookup to populate
    /// nearby buckets.
    pub async fn bootstrap(&self, bootnodes: &[Enr]) {
        for enr in bootnodes {
            self.add_enr(enr.clone()).await;
            if let Err(e) = self.ping(enr).await {
                debug!(peer = %enr.node_id(), error = %e, "bootnode unreachable");
            }
        }
        let found = self.lookup_nodes(self.inner.local_id.raw()).await;
        info!(
            protocol = %self.inner.protocol,
            peers = found.closest.len(),
            probes = found.probes,
            "bootstrap lookup finished"
        );
    }

    fn spawn_liveness_task(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut tick = 0u64;
            loop {
                ticker.tick().await;
                tick += 1;
                let Ok(Some(target)) = this
                    .query(|tx| Command::LivenessTarget { reply: tx })
                    .await
                else {
                    continue;
                };
                if let Err(e) = this.ping(&target).await {
                    trace!(peer = %target.node_id(), error = %e, "liveness probe failed");
                }
                // Periodic self-healing: refresh a random occupied bucket
                // with a targeted lookup.
                if tick % REFRESH_EVERY_TICKS == 0 {
                    let occupied = this
                        .query(|tx| Command::OccupiedBuckets { reply: tx })
                        .await
                        .unwrap_or_default();
                    if !occupied.is_empty() {
                        use rand::Rng;
                        let bucket =
                            occupied[rand::thread_rng().gen_range(0..occupied.len())];
                        let target = crate::enr::random_id_in_bucket(
                            &this.inner.local_id,
                            bucket,
                        );
                        let _ = this.lookup_nodes(target.raw()).await;
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// Uniform dispatcher for one inbound Portal message.
    pub async fn handle_talk(&self, talk: InboundTalk) {
        let message = match Message::decode(&talk.payload) {
            Ok(m) => m,
            Err(e) => {
                // Malformed input does not affect the peer's liveness state.
                debug!(peer = %talk.from.node_id(), error = %e, "malformed message dropped");
                return;
            }
        };
        trace!(
            protocol = %self.inner.protocol,
            peer = %talk.from.node_id(),
            kind = message.kind(),
            "inbound message"
        );
        let reply = match message {
            Message::Ping(ping) => Some(self.on_ping(&talk.from, ping).await),
            Message::FindNodes(req) => Some(self.on_find_nodes(&talk.from, req).await),
            Message::FindContent(req) => Some(self.on_find_content(&talk.from, req).await),
            Message::Offer(offer) => self.on_offer(&talk.from, offer).await,
            // Responses outside an exchange.
            Message::Pong(_)
            | Message::Nodes(_)
            | Message::Content(_)
            | Message::Accept(_) => None,
        };
        if let (Some(respond), Some(reply)) = (talk.respond, reply) {
            let _ = respond.send(reply.encode());
        }
    }

    async fn on_ping(&self, from: &Enr, ping: Ping) -> Message {
        let id = from.node_id();
        self.command(Command::InsertEnr {
            enr: from.clone(),
            reply: None,
        })
        .await
        .ok();
        if let Some(radius) = parse_radius_payload(&ping.custom_payload) {
            self.command(Command::SetPeerRadius { id, radius }).await.ok();
        }
        let radius = self.radius().await;
        Message::Pong(Pong {
            enr_seq: self.local_enr().seq(),
            custom_payload: radius_payload(radius),
        })
    }

    async fn on_find_nodes(&self, from: &Enr, req: FindNodes) -> Message {
        let mut distances = req.distances;
        distances.sort_unstable();
        distances.dedup();

        let mut enrs: Vec<Vec<u8>> = Vec::new();
        let mut used = 16usize; // selector + total + offset + slack
        if distances.contains(&0) {
            let local = self.local_enr();
            used += 4 + local.encoded().len();
            enrs.push(local.encoded().to_vec());
        }
        let positive: Vec<u16> = distances.into_iter().filter(|d| *d != 0).collect();
        if !positive.is_empty() {
            let found = self
                .query(|tx| Command::AtLogDistances {
                    distances: positive,
                    reply: tx,
                })
                .await
                .unwrap_or_default();
            for enr in found {
                let cost = 4 + enr.encoded().len();
                if enrs.len() >= NODES_LIMIT || used + cost > MAX_DISCOVERY_PACKET {
                    break;
                }
                if enr.node_id() == from.node_id() {
                    continue;
                }
                used += cost;
                enrs.push(enr.encoded().to_vec());
            }
        }
        Message::Nodes(Nodes { total: 1, enrs })
    }

    async fn on_find_content(&self, from: &Enr, req: FindContent) -> Message {
        let key = RawContentKey(req.content_key);
        let id = content_id(self.inner.protocol, &key);
        let stored = self
            .query(|tx| Command::ContentLookupLocal { id, reply: tx })
            .await
            .ok()
            .and_then(|r| r.ok())
            .flatten();

        if let Some(payload) = stored {
            if content_fits_inline(payload.len()) {
                return Message::Content(Content::Payload(payload));
            }
            // Too large for the discovery channel: advertise a transfer.
            let conn_id = self.inner.utp.reserve_id(&from.node_id());
            let utp = self.inner.utp.clone();
            let peer = from.clone();
            tokio::spawn(async move {
                if let Err(e) = utp.serve_payload(peer, conn_id, payload).await {
                    debug!(error = %e, "content transfer failed");
                }
            });
            return Message::Content(Content::ConnectionId(conn_id));
        }

        // Not held here: answer with closer peers.
        let mut nearest = self.nearest(id.0, CONTENT_ENR_LIMIT + 1).await;
        nearest.retain(|e| e.node_id() != from.node_id());
        nearest.truncate(CONTENT_ENR_LIMIT);
        let mut blobs = Vec::new();
        let mut used = 16usize;
        for enr in nearest {
            let cost = 4 + enr.encoded().len();
            if used + cost > MAX_DISCOVERY_PACKET {
                break;
            }
            used += cost;
            blobs.push(enr.encoded().to_vec());
        }
        Message::Content(Content::Enrs(blobs))
    }

    /// OFFER intake: decide which keys are wanted, advertise a connection
    /// id, and spawn the transfer-and-admit pipeline for accepted items.
    async fn on_offer(&self, from: &Enr, offer: Offer) -> Option<Message> {
        if offer.content_keys.is_empty() || offer.content_keys.len() > MAX_KEYS_PER_OFFER {
            return None;
        }
        let radius = self.radius().await;
        let mut accepted = BitList::with_len(offer.content_keys.len());
        let mut wanted: Vec<(usize, RawContentKey)> = Vec::new();
        for (i, raw) in offer.content_keys.iter().enumerate() {
            let key = RawContentKey(raw.clone());
            let id = content_id(self.inner.protocol, &key);
            if !radius.covers(distance(&self.inner.local_id, &id)) {
                continue;
            }
            let already = self
                .query(|tx| Command::ContainsContent { id, reply: tx })
                .await
                .unwrap_or(true);
            if already {
                continue;
            }
            accepted.set(i, true);
            wanted.push((wanted.len(), key));
        }

        let conn_id = self.inner.utp.reserve_id(&from.node_id());
        if !wanted.is_empty() {
            let this = self.clone();
            let peer = from.clone();
            tokio::spawn(async move {
                for (index, key) in wanted {
                    let item_id = item_connection_id(conn_id, index);
                    match this.inner.utp.accept_payload(peer.clone(), item_id).await {
                        Ok(payload) => {
                            if let Err(e) = this.admit_and_gossip(key, payload).await {
                                debug!(error = %e, "offered content rejected");
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "offered content transfer failed");
                        }
                    }
                }
            });
        }
        Some(Message::Accept(Accept {
            connection_id: conn_id,
            content_keys: accepted,
        }))
    }
}

fn decode_enrs(blobs: &[Vec<u8>]) -> Vec<Enr> {
    let mut out = Vec::with_capacity(blobs.len());
    for blob in blobs {
        match Enr::decode(blob) {
            Ok(enr) => out.push(enr),
            Err(e) => trace!(error = %e, "undecodable record skipped"),
        }
    }
    out
}

// ----------------------------------------------------------------------
// Lookup / gossip transport wiring
// ----------------------------------------------------------------------

#[async_trait::async_trait]
impl<D: Discovery> LookupTransport for OverlayService<D> {
    fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    async fn find_nodes(
        &self,
        to: &Enr,
        distances: Vec<u16>,
    ) -> Result<Vec<Enr>, OverlayError> {
        self.find_nodes_rpc(to, distances).await
    }

    async fn find_content(
        &self,
        to: &Enr,
        key: &RawContentKey,
    ) -> Result<ContentResponse, OverlayError> {
        self.find_content_rpc(to, key).await
    }

    async fn fetch_transfer(&self, to: &Enr, conn_id: u16) -> Result<Vec<u8>, OverlayError> {
        Ok(self.inner.utp.receive_outbound(to.clone(), conn_id).await?)
    }

    fn verify(&self, key: &RawContentKey, payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
        self.inner.verifier.verify(key.as_slice(), payload)
    }
}

#[async_trait::async_trait]
impl<D: Discovery> GossipTransport for OverlayService<D> {
    async fn offer(
        &self,
        to: &Enr,
        keys: Vec<RawContentKey>,
    ) -> Result<AcceptResult, OverlayError> {
        self.offer_rpc(to, keys).await
    }

    async fn stream_item(
        &self,
        to: &Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> Result<(), crate::error::UtpError> {
        self.inner.utp.send_outbound(to.clone(), conn_id, payload).await
    }
}
