//! # Bulk Transfer Channel
//!
//! A sequenced, windowed, retransmitting stream over UDP, used whenever a
//! content payload exceeds the discovery packet ceiling. One session moves
//! one payload in one direction and then closes.
//!
//! ## Packet Format
//!
//! 20-byte header, big-endian fields:
//!
//! | Field | Size | Meaning |
//! |-------|------|---------|
//! | type/version | 1 | packet type in the high nibble, version (1) in the low |
//! | extension | 1 | always 0 |
//! | connection-id | 2 | demultiplexing key |
//! | timestamp | 4 | sender clock, microseconds |
//! | timestamp-diff | 4 | receiver clock minus sender timestamp |
//! | window | 4 | sender's spare receive buffer, bytes |
//! | seq-nr | 2 | sequence number of this packet |
//! | ack-nr | 2 | last in-order sequence received |
//!
//! Types: ST_DATA, ST_FIN, ST_STATE, ST_RESET, ST_SYN.
//!
//! ## Connection Ids
//!
//! The initiator's receive id is the advertised connection id `R`; the
//! counterpart receives on `R + 1`. ST_SYN is stamped `R`; the ST_STATE
//! handshake reply is stamped `R + 1`; every other packet is stamped with
//! the peer's receive id. The session registry maps both ids of a session
//! to the same slot, with a generation counter so a slot reused after
//! termination cannot be touched by the defunct session's cleanup.
//!
//! ## Reliability
//!
//! The sender keeps a congestion window (LEDBAT-style delay feedback) and
//! honors the receiver's advertised window. Retransmission triggers on
//! three duplicate ACKs or RTO expiry (`srtt + 4*rttvar`, bounded to
//! [500ms, 3s], doubled per successive retransmit of the same packet).
//! ST_FIN carries the final sequence number; the peer acks all data through
//! it before the session closes. ST_RESET aborts immediately. A stall
//! longer than the stall deadline resets the session.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::enr::{Enr, NodeId};
use crate::error::UtpError;

/// Wire size of the packet header.
pub const HEADER_SIZE: usize = 20;

/// Protocol version carried in the low nibble of the first byte.
pub const VERSION: u8 = 1;

/// Maximum ST_DATA payload per packet; header plus payload stays under the
/// path MTU (~1200 bytes).
pub const MAX_PACKET_PAYLOAD: usize = 1180;

/// Hard cap on a single transferred payload.
pub const MAX_TRANSFER_SIZE: usize = 16 * 1024 * 1024;

/// Receive buffer advertised to the peer.
const RECEIVE_WINDOW: u32 = 1024 * 1024;

/// Duplicate ACKs that trigger a fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// SYN retransmit attempts before the handshake fails.
const SYN_RETRIES: u32 = 3;

/// LEDBAT target queuing delay, microseconds.
const TARGET_DELAY_MICROS: u32 = 100_000;

/// Congestion-window gain applied per ACK round.
const CWND_GAIN: f64 = 3000.0;

/// Samples kept for the base-delay floor.
const BASE_DELAY_SAMPLES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Fin,
    State,
    Reset,
    Syn,
}

impl PacketType {
    fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }

    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: PacketType,
    pub connection_id: u16,
    pub timestamp_micros: u32,
    pub timestamp_diff_micros: u32,
    pub window: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.push((self.ptype.to_nibble() << 4) | VERSION);
        out.push(0); // extension
        out.extend_from_slice(&self.connection_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp_micros.to_be_bytes());
        out.extend_from_slice(&self.timestamp_diff_micros.to_be_bytes());
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&self.seq_nr.to_be_bytes());
        out.extend_from_slice(&self.ack_nr.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, UtpError> {
        if bytes.len() < HEADER_SIZE {
            return Err(UtpError::MalformedPacket);
        }
        let ptype =
            PacketType::from_nibble(bytes[0] >> 4).ok_or(UtpError::MalformedPacket)?;
        if bytes[0] & 0x0F != VERSION {
            return Err(UtpError::MalformedPacket);
        }
        if bytes[1] != 0 {
            // No extensions are negotiated on this channel.
            return Err(UtpError::MalformedPacket);
        }
        Ok(Packet {
            ptype,
            connection_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp_micros: u32::from_be_bytes(bytes[4..8].try_into().unwrap()),
            timestamp_diff_micros: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            window: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            seq_nr: u16::from_be_bytes([bytes[16], bytes[17]]),
            ack_nr: u16::from_be_bytes([bytes[18], bytes[19]]),
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }

    /// Quick check used by the socket demultiplexer: length and version.
    pub fn looks_like_utp(bytes: &[u8]) -> bool {
        bytes.len() >= HEADER_SIZE
            && bytes[0] & 0x0F == VERSION
            && PacketType::from_nibble(bytes[0] >> 4).is_some()
    }
}

fn now_micros() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u32
}

/// `a < b` in wrapping u16 sequence space.
fn seq_lt(a: u16, b: u16) -> bool {
    a != b && b.wrapping_sub(a) < 0x8000
}

// ============================================================================
// Round-trip and congestion bookkeeping
// ============================================================================

/// LEDBAT-style congestion window plus RFC-style RTO estimation.
struct Congestion {
    cwnd: f64,
    srtt: Option<f64>,
    rttvar: f64,
    base_delays: VecDeque<u32>,
}

/// RTO bounds per the failure semantics.
const RTO_MIN: Duration = Duration::from_millis(500);
const RTO_MAX: Duration = Duration::from_secs(3);

impl Congestion {
    fn new() -> Self {
        Self {
            cwnd: (2 * MAX_PACKET_PAYLOAD) as f64,
            srtt: None,
            rttvar: 0.0,
            base_delays: VecDeque::new(),
        }
    }

    fn window(&self) -> usize {
        self.cwnd as usize
    }

    fn rto(&self) -> Duration {
        let ms = match self.srtt {
            Some(srtt) => srtt + 4.0 * self.rttvar,
            None => 1000.0,
        };
        Duration::from_millis(ms as u64).clamp(RTO_MIN, RTO_MAX)
    }

    fn on_rtt_sample(&mut self, rtt: Duration) {
        let sample = rtt.as_secs_f64() * 1000.0;
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2.0;
            }
            Some(srtt) => {
                self.rttvar = 0.75 * self.rttvar + 0.25 * (srtt - sample).abs();
                self.srtt = Some(0.875 * srtt + 0.125 * sample);
            }
        }
    }

    /// Delay-based window update on every cumulative ACK.
    fn on_ack(&mut self, bytes_acked: usize, delay_micros: u32) {
        if delay_micros > 0 {
            self.base_delays.push_back(delay_micros);
            if self.base_delays.len() > BASE_DELAY_SAMPLES {
                self.base_delays.pop_front();
            }
        }
        let base = self.base_delays.iter().copied().min().unwrap_or(0);
        let queuing = delay_micros.saturating_sub(base);
        let off_target =
            (TARGET_DELAY_MICROS as f64 - queuing as f64) / TARGET_DELAY_MICROS as f64;
        let gain = CWND_GAIN * off_target * (bytes_acked as f64 / self.cwnd.max(1.0));
        self.cwnd = (self.cwnd + gain)
            .clamp(MAX_PACKET_PAYLOAD as f64, (RECEIVE_WINDOW as f64) * 2.0);
    }

    /// RTO expiry collapses the window to one packet.
    fn on_timeout(&mut self) {
        self.cwnd = MAX_PACKET_PAYLOAD as f64;
    }
}

// ============================================================================
// Session registry
// ============================================================================

/// Tunables. Defaults match the protocol; tests shrink the deadlines.
#[derive(Debug, Clone)]
pub struct UtpConfig {
    /// No-progress deadline after which the session resets.
    pub stall_timeout: Duration,
    /// Per-SYN handshake deadline.
    pub syn_timeout: Duration,
}

impl Default for UtpConfig {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(10),
            syn_timeout: Duration::from_secs(1),
        }
    }
}

/// Outbound datagram handed to the node's send queue.
#[derive(Debug)]
pub struct OutboundPacket {
    pub to: Enr,
    pub data: Vec<u8>,
}

struct Slot {
    generation: u64,
    tx: mpsc::Sender<Packet>,
}

/// Pending acceptor waiting for a SYN stamped with a known id.
struct Listener {
    generation: u64,
    on_syn: oneshot::Sender<Packet>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<(NodeId, u16), Slot>,
    listeners: HashMap<(NodeId, u16), Listener>,
    next_generation: u64,
}

/// Endpoint shared by every overlay on the node. Sessions run as tasks;
/// inbound packets are routed by (peer, connection-id).
#[derive(Clone)]
pub struct UtpEndpoint {
    registry: Arc<Mutex<Registry>>,
    outbound: mpsc::Sender<OutboundPacket>,
    config: UtpConfig,
}

impl UtpEndpoint {
    pub fn new(outbound: mpsc::Sender<OutboundPacket>) -> Self {
        Self::with_config(outbound, UtpConfig::default())
    }

    pub fn with_config(outbound: mpsc::Sender<OutboundPacket>, config: UtpConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            outbound,
            config,
        }
    }

    /// Pick a connection id with both slots free for `peer`.
    pub fn reserve_id(&self, peer: &NodeId) -> u16 {
        let registry = self.registry.lock();
        let mut rng = rand::thread_rng();
        loop {
            let id: u16 = rng.gen();
            let taken = registry.sessions.contains_key(&(*peer, id))
                || registry.sessions.contains_key(&(*peer, id.wrapping_add(1)))
                || registry.listeners.contains_key(&(*peer, id));
            if !taken {
                return id;
            }
        }
    }

    /// Route an inbound datagram. Unknown connection ids are dropped unless
    /// they are a SYN matching a registered listener.
    pub fn handle_inbound(&self, from: &Enr, datagram: &[u8]) {
        let packet = match Packet::decode(datagram) {
            Ok(p) => p,
            Err(_) => {
                trace!(peer = %from.node_id(), "malformed transfer packet dropped");
                return;
            }
        };
        let peer = from.node_id();
        let key = (peer, packet.connection_id);
        let mut registry = self.registry.lock();
        if packet.ptype == PacketType::Syn {
            if let Some(listener) = registry.listeners.remove(&key) {
                let _ = listener.on_syn.send(packet);
                return;
            }
        }
        if let Some(slot) = registry.sessions.get(&key) {
            let _ = slot.tx.try_send(packet);
            return;
        }
        trace!(
            peer = %peer,
            conn_id = packet.connection_id,
            kind = ?packet.ptype,
            "transfer packet for unknown session dropped"
        );
    }

    /// Initiate a session with receive id `conn_id` and stream `payload`.
    ///
    /// Used after an ACCEPT: the offering side connects with the accepted
    /// connection id and writes the content.
    pub async fn send_outbound(
        &self,
        peer: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> Result<(), UtpError> {
        if payload.len() > MAX_TRANSFER_SIZE {
            return Err(UtpError::PayloadTooLarge(payload.len()));
        }
        let (session, generation) = self.open_initiator(&peer, conn_id)?;
        let result = session.run_writer(payload).await;
        self.close(&peer.node_id(), conn_id, generation);
        result
    }

    /// Initiate a session with receive id `conn_id` and read one payload.
    ///
    /// Used after a CONTENT response elected the transfer arm: the requester
    /// connects with the supplied id and the content holder writes.
    pub async fn receive_outbound(&self, peer: Enr, conn_id: u16) -> Result<Vec<u8>, UtpError> {
        let (session, generation) = self.open_initiator(&peer, conn_id)?;
        let result = session.run_reader_connect().await;
        self.close(&peer.node_id(), conn_id, generation);
        result
    }

    /// Await a SYN stamped `conn_id` from `peer`, then stream `payload`.
    ///
    /// Used by the FINDCONTENT responder after advertising the id in a
    /// CONTENT reply.
    pub async fn serve_payload(
        &self,
        peer: Enr,
        conn_id: u16,
        payload: Vec<u8>,
    ) -> Result<(), UtpError> {
        if payload.len() > MAX_TRANSFER_SIZE {
            return Err(UtpError::PayloadTooLarge(payload.len()));
        }
        let (session, generation) = self.accept_session(&peer, conn_id).await?;
        let result = session.run_writer(payload).await;
        self.close(&peer.node_id(), conn_id, generation);
        result
    }

    /// Await a SYN stamped `conn_id` from `peer`, then read one payload.
    ///
    /// Used by the OFFER acceptor after advertising the id in ACCEPT.
    pub async fn accept_payload(&self, peer: Enr, conn_id: u16) -> Result<Vec<u8>, UtpError> {
        let (session, generation) = self.accept_session(&peer, conn_id).await?;
        let result = session.run_reader_accepted().await;
        self.close(&peer.node_id(), conn_id, generation);
        result
    }

    fn open_initiator(&self, peer: &Enr, conn_id: u16) -> Result<(Session, u64), UtpError> {
        let mut registry = self.registry.lock();
        let key = (peer.node_id(), conn_id);
        if registry.sessions.contains_key(&key) {
            return Err(UtpError::IdInUse(conn_id));
        }
        registry.next_generation += 1;
        let generation = registry.next_generation;
        let (tx, rx) = mpsc::channel(256);
        registry.sessions.insert(key, Slot { generation, tx: tx.clone() });
        // The handshake reply arrives stamped with our send id.
        registry
            .sessions
            .insert((peer.node_id(), conn_id.wrapping_add(1)), Slot { generation, tx });
        Ok((
            Session {
                peer: peer.clone(),
                recv_id: conn_id,
                send_id: conn_id.wrapping_add(1),
                initiator: true,
                inbound: rx,
                outbound: self.outbound.clone(),
                config: self.config.clone(),
                peer_seq: None,
                our_init_seq: rand::thread_rng().gen(),
            },
            generation,
        ))
    }

    async fn accept_session(
        &self,
        peer: &Enr,
        conn_id: u16,
    ) -> Result<(Session, u64), UtpError> {
        let (syn_tx, syn_rx) = oneshot::channel();
        let generation = {
            let mut registry = self.registry.lock();
            let key = (peer.node_id(), conn_id);
            if registry.listeners.contains_key(&key) || registry.sessions.contains_key(&key) {
                return Err(UtpError::IdInUse(conn_id));
            }
            registry.next_generation += 1;
            let generation = registry.next_generation;
            registry.listeners.insert(key, Listener { generation, on_syn: syn_tx });
            generation
        };

        let syn = match timeout(self.config.stall_timeout, syn_rx).await {
            Ok(Ok(packet)) => packet,
            _ => {
                let mut registry = self.registry.lock();
                if let Some(l) = registry.listeners.get(&(peer.node_id(), conn_id)) {
                    if l.generation == generation {
                        registry.listeners.remove(&(peer.node_id(), conn_id));
                    }
                }
                return Err(UtpError::SynTimeout);
            }
        };

        let (tx, rx) = mpsc::channel(256);
        {
            let mut registry = self.registry.lock();
            // The acceptor receives on conn_id + 1 but the initiator keeps
            // stamping data with our advertised id's successor; both ids map
            // to this session.
            registry
                .sessions
                .insert((peer.node_id(), conn_id.wrapping_add(1)), Slot { generation, tx: tx.clone() });
            registry
                .sessions
                .insert((peer.node_id(), conn_id), Slot { generation, tx });
        }
        let mut session = Session {
            peer: peer.clone(),
            recv_id: conn_id.wrapping_add(1),
            send_id: conn_id,
            initiator: false,
            inbound: rx,
            outbound: self.outbound.clone(),
            config: self.config.clone(),
            peer_seq: None,
            our_init_seq: rand::thread_rng().gen(),
        };
        session.peer_seq = Some(syn.seq_nr);
        // Handshake reply, stamped with our receive id; its seq-nr anchors
        // the sequence space of any data we send on this session.
        session
            .emit_seq(
                PacketType::State,
                session.recv_id,
                session.our_init_seq,
                syn.seq_nr,
                Bytes::new(),
            )
            .await?;
        Ok((session, generation))
    }

    fn close(&self, peer: &NodeId, primary_id: u16, generation: u64) {
        let mut registry = self.registry.lock();
        for id in [primary_id, primary_id.wrapping_add(1), primary_id.wrapping_sub(1)] {
            if let Some(slot) = registry.sessions.get(&(*peer, id)) {
                if slot.generation == generation {
                    registry.sessions.remove(&(*peer, id));
                }
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

struct Session {
    peer: Enr,
    recv_id: u16,
    send_id: u16,
    initiator: bool,
    inbound: mpsc::Receiver<Packet>,
    outbound: mpsc::Sender<OutboundPacket>,
    config: UtpConfig,
    /// Peer's initial sequence number (their SYN or handshake STATE seq).
    peer_seq: Option<u16>,
    /// Our initial sequence number; data starts one past it.
    our_init_seq: u16,
}

/// One in-flight ST_DATA awaiting acknowledgement.
struct InFlight {
    seq: u16,
    payload: Bytes,
    sent_at: Instant,
    first_sent_at: Instant,
    transmissions: u32,
}

impl Session {
    async fn emit(
        &self,
        ptype: PacketType,
        connection_id: u16,
        ack_nr: u16,
        payload: Bytes,
    ) -> Result<(), UtpError> {
        self.emit_seq(ptype, connection_id, 0, ack_nr, payload).await
    }

    async fn emit_seq(
        &self,
        ptype: PacketType,
        connection_id: u16,
        seq_nr: u16,
        ack_nr: u16,
        payload: Bytes,
    ) -> Result<(), UtpError> {
        let packet = Packet {
            ptype,
            connection_id,
            timestamp_micros: now_micros(),
            timestamp_diff_micros: 0,
            window: RECEIVE_WINDOW,
            seq_nr,
            ack_nr,
            payload,
        };
        self.outbound
            .send(OutboundPacket {
                to: self.peer.clone(),
                data: packet.encode(),
            })
            .await
            .map_err(|_| UtpError::Transport(crate::error::TransportError::Closed))
    }

    /// Initiator handshake: SYN stamped with our receive id, retried on the
    /// handshake deadline, until the ST_STATE reply arrives.
    async fn connect(&mut self) -> Result<(), UtpError> {
        for _attempt in 0..SYN_RETRIES {
            self.emit_seq(
                PacketType::Syn,
                self.recv_id,
                self.our_init_seq,
                0,
                Bytes::new(),
            )
            .await?;
            let deadline = self.config.syn_timeout;
            match timeout(deadline, self.inbound.recv()).await {
                Ok(Some(packet)) if packet.ptype == PacketType::State => {
                    self.peer_seq = Some(packet.seq_nr);
                    return Ok(());
                }
                Ok(Some(packet)) if packet.ptype == PacketType::Reset => {
                    return Err(UtpError::Reset);
                }
                Ok(Some(_)) | Err(_) => continue,
                Ok(None) => return Err(UtpError::Transport(
                    crate::error::TransportError::Closed,
                )),
            }
        }
        Err(UtpError::SynTimeout)
    }

    /// Stream a payload to the peer, then FIN.
    async fn run_writer(mut self, payload: Vec<u8>) -> Result<(), UtpError> {
        if self.initiator {
            self.connect().await?;
        }
        // Data begins one past the sequence anchored in the handshake.
        let our_seq = self.our_init_seq.wrapping_add(1);

        let payload = Bytes::from(payload);
        let mut chunks: VecDeque<(u16, Bytes)> = VecDeque::new();
        let mut offset = 0usize;
        let mut seq = our_seq;
        while offset < payload.len() {
            let end = (offset + MAX_PACKET_PAYLOAD).min(payload.len());
            chunks.push_back((seq, payload.slice(offset..end)));
            seq = seq.wrapping_add(1);
            offset = end;
        }
        let fin_seq = seq;

        let mut congestion = Congestion::new();
        let mut in_flight: Vec<InFlight> = Vec::new();
        let mut peer_window = RECEIVE_WINDOW as usize;
        let peer_ack_base = self.peer_seq.unwrap_or(0);
        let mut last_ack: Option<u16> = None;
        let mut dup_acks: u32 = 0;
        let mut last_progress = Instant::now();
        let mut fin_sent = false;
        let mut fin_sent_at: Option<Instant> = None;
        let mut fin_transmissions: u32 = 0;
        let ack_for_peer = peer_ack_base;

        loop {
            // Fill the window.
            let budget = congestion.window().min(peer_window);
            while !chunks.is_empty() {
                let next_len = chunks.front().map(|(_, c)| c.len()).unwrap_or(0);
                let bytes_now: usize = in_flight.iter().map(|p| p.payload.len()).sum();
                if bytes_now + next_len > budget && !in_flight.is_empty() {
                    break;
                }
                let (chunk_seq, chunk) = chunks.pop_front().expect("non-empty");
                self.emit_seq(
                    PacketType::Data,
                    self.send_id,
                    chunk_seq,
                    ack_for_peer,
                    chunk.clone(),
                )
                .await?;
                let now = Instant::now();
                in_flight.push(InFlight {
                    seq: chunk_seq,
                    payload: chunk,
                    sent_at: now,
                    first_sent_at: now,
                    transmissions: 1,
                });
            }

            // All data acked: move to FIN.
            if chunks.is_empty() && in_flight.is_empty() {
                let now = Instant::now();
                let resend_due = match fin_sent_at {
                    Some(at) => {
                        now.duration_since(at)
                            >= congestion.rto() * 2u32.saturating_pow(fin_transmissions.saturating_sub(1))
                    }
                    None => true,
                };
                if !fin_sent || resend_due {
                    if fin_transmissions >= SYN_RETRIES + 2 {
                        self.reset().await;
                        return Err(UtpError::Stalled);
                    }
                    self.emit_seq(
                        PacketType::Fin,
                        self.send_id,
                        fin_seq,
                        ack_for_peer,
                        Bytes::new(),
                    )
                    .await?;
                    fin_sent = true;
                    fin_sent_at = Some(now);
                    fin_transmissions += 1;
                }
            }

            if last_progress.elapsed() > self.config.stall_timeout {
                self.reset().await;
                return Err(UtpError::Stalled);
            }

            // Wake on inbound, or on the earliest retransmission deadline.
            let rto = congestion.rto();
            let next_deadline = in_flight
                .iter()
                .map(|p| {
                    p.sent_at
                        + rto * 2u32.saturating_pow(p.transmissions.saturating_sub(1))
                })
                .chain(fin_sent_at.map(|at| {
                    at + rto * 2u32.saturating_pow(fin_transmissions.saturating_sub(1))
                }))
                .min();
            let wait = next_deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(self.config.stall_timeout)
                .min(self.config.stall_timeout);

            let packet = match timeout(wait.max(Duration::from_millis(1)), self.inbound.recv())
                .await
            {
                Ok(Some(packet)) => Some(packet),
                Ok(None) => {
                    return Err(UtpError::Transport(crate::error::TransportError::Closed))
                }
                Err(_) => None,
            };

            match packet {
                Some(packet) => match packet.ptype {
                    PacketType::State => {
                        peer_window = packet.window as usize;
                        let ack = packet.ack_nr;
                        if fin_sent && ack == fin_seq {
                            debug!(peer = %self.peer.node_id(), "transfer complete");
                            return Ok(());
                        }
                        let before = in_flight.len();
                        let mut newly_acked_rtt: Option<Duration> = None;
                        let mut bytes_acked = 0usize;
                        in_flight.retain(|p| {
                            let acked = p.seq == ack || seq_lt(p.seq, ack);
                            if acked {
                                bytes_acked += p.payload.len();
                                if p.transmissions == 1 {
                                    newly_acked_rtt = Some(p.first_sent_at.elapsed());
                                }
                            }
                            !acked
                        });
                        if in_flight.len() != before {
                            last_progress = Instant::now();
                            dup_acks = 0;
                            if let Some(rtt) = newly_acked_rtt {
                                congestion.on_rtt_sample(rtt);
                            }
                            congestion.on_ack(bytes_acked, packet.timestamp_diff_micros);
                            last_ack = Some(ack);
                        } else if last_ack == Some(ack) && !in_flight.is_empty() {
                            dup_acks += 1;
                            if dup_acks >= DUP_ACK_THRESHOLD {
                                dup_acks = 0;
                                if let Some(first) = in_flight.first_mut() {
                                    trace!(
                                        seq = first.seq,
                                        "fast retransmit after duplicate acks"
                                    );
                                    first.sent_at = Instant::now();
                                    first.transmissions += 1;
                                    self.emit_seq(
                                        PacketType::Data,
                                        self.send_id,
                                        first.seq,
                                        ack_for_peer,
                                        first.payload.clone(),
                                    )
                                    .await?;
                                }
                            }
                        } else {
                            last_ack = Some(ack);
                        }
                    }
                    PacketType::Reset => return Err(UtpError::Reset),
                    PacketType::Fin | PacketType::Data | PacketType::Syn => {
                        // Writer side; nothing meaningful to do with these.
                        trace!(kind = ?packet.ptype, "ignoring packet in writer role");
                    }
                },
                None => {
                    // Retransmission pass for every expired packet.
                    let rto = congestion.rto();
                    let now = Instant::now();
                    let mut expired = false;
                    for p in in_flight.iter_mut() {
                        let deadline = p.sent_at
                            + rto * 2u32.saturating_pow(p.transmissions.saturating_sub(1));
                        if now >= deadline {
                            expired = true;
                            p.sent_at = now;
                            p.transmissions += 1;
                            self.emit_seq(
                                PacketType::Data,
                                self.send_id,
                                p.seq,
                                ack_for_peer,
                                p.payload.clone(),
                            )
                            .await?;
                        }
                    }
                    if expired {
                        congestion.on_timeout();
                    }
                }
            }
        }
    }

    /// Initiator that reads: connect, then collect until FIN.
    async fn run_reader_connect(mut self) -> Result<Vec<u8>, UtpError> {
        self.connect().await?;
        self.collect().await
    }

    /// Acceptor that reads: the handshake already happened in `accept_session`.
    async fn run_reader_accepted(self) -> Result<Vec<u8>, UtpError> {
        self.collect().await
    }

    /// Receive loop: reorder, ack, assemble, stop at FIN.
    async fn collect(mut self) -> Result<Vec<u8>, UtpError> {
        // The writer's data starts one past the sequence anchored in its
        // SYN or handshake STATE.
        let mut expected: Option<u16> = self.peer_seq.map(|s| s.wrapping_add(1));
        let mut assembled: Vec<u8> = Vec::new();
        let mut out_of_order: BTreeMap<u16, Bytes> = BTreeMap::new();
        let mut fin_seq: Option<u16> = None;
        let mut last_packet = Instant::now();
        let mut last_acked: Option<u16> = self.peer_seq;

        loop {
            if last_packet.elapsed() > self.config.stall_timeout {
                self.reset().await;
                return Err(UtpError::Stalled);
            }
            let packet = match timeout(self.config.stall_timeout, self.inbound.recv()).await {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    return Err(UtpError::Transport(crate::error::TransportError::Closed))
                }
                Err(_) => {
                    self.reset().await;
                    return Err(UtpError::Stalled);
                }
            };
            last_packet = Instant::now();

            match packet.ptype {
                PacketType::Data => {
                    let seq = packet.seq_nr;
                    let expect = *expected.get_or_insert(seq);
                    if seq == expect {
                        assembled.extend_from_slice(&packet.payload);
                        let mut next = seq.wrapping_add(1);
                        while let Some(chunk) = out_of_order.remove(&next) {
                            assembled.extend_from_slice(&chunk);
                            next = next.wrapping_add(1);
                        }
                        expected = Some(next);
                        if assembled.len() > MAX_TRANSFER_SIZE {
                            self.reset().await;
                            return Err(UtpError::PayloadTooLarge(assembled.len()));
                        }
                        last_acked = Some(next.wrapping_sub(1));
                    } else if seq_lt(expect, seq) {
                        out_of_order.insert(seq, packet.payload.clone());
                        // Duplicate ack to prod a fast retransmit.
                    }
                    if let Some(ack) = last_acked {
                        self.emit(PacketType::State, self.send_id, ack, Bytes::new())
                            .await?;
                    }
                    if let (Some(fin), Some(next)) = (fin_seq, expected) {
                        if next == fin {
                            self.emit(PacketType::State, self.send_id, fin, Bytes::new())
                                .await?;
                            return Ok(assembled);
                        }
                    }
                }
                PacketType::Fin => {
                    let fin = packet.seq_nr;
                    fin_seq = Some(fin);
                    let done = match expected {
                        Some(next) => next == fin,
                        // FIN before any data: empty payload transfer.
                        None => {
                            expected = Some(fin);
                            true
                        }
                    };
                    if done {
                        self.emit(PacketType::State, self.send_id, fin, Bytes::new())
                            .await?;
                        debug!(
                            peer = %self.peer.node_id(),
                            bytes = assembled.len(),
                            "transfer received"
                        );
                        return Ok(assembled);
                    }
                    // Data still missing: re-ack the last in-order sequence.
                    if let Some(ack) = last_acked {
                        self.emit(PacketType::State, self.send_id, ack, Bytes::new())
                            .await?;
                    }
                }
                PacketType::State => {
                    // Keep-alive / window update from the writer.
                }
                PacketType::Reset => return Err(UtpError::Reset),
                PacketType::Syn => {
                    // Duplicate SYN: re-ack the handshake.
                    if let Some(peer_seq) = self.peer_seq {
                        self.emit_seq(
                            PacketType::State,
                            self.recv_id,
                            self.our_init_seq,
                            peer_seq,
                            Bytes::new(),
                        )
                        .await?;
                    }
                }
            }
        }
    }

    async fn reset(&self) {
        let _ = self
            .emit(PacketType::Reset, self.send_id, 0, Bytes::new())
            .await;
        warn!(peer = %self.peer.node_id(), "transfer session reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::EnrBuilder;
    use secp256k1::SecretKey;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_enr(seed: u8) -> Enr {
        let mut key = [0u8; 32];
        key[31] = seed.max(1);
        key[0] = 2;
        let sk = SecretKey::from_slice(&key).unwrap();
        EnrBuilder::new()
            .ip4(Ipv4Addr::LOCALHOST)
            .udp4(40000 + seed as u16)
            .build(&sk)
            .unwrap()
    }

    fn fast_config() -> UtpConfig {
        UtpConfig {
            stall_timeout: Duration::from_millis(1500),
            syn_timeout: Duration::from_millis(200),
        }
    }

    /// Wire two endpoints back to back through in-memory channels, with an
    /// optional per-packet drop decision.
    fn linked_endpoints(
        drop_a_to_b: Arc<dyn Fn(usize, &[u8]) -> bool + Send + Sync>,
    ) -> (UtpEndpoint, UtpEndpoint, Enr, Enr) {
        let enr_a = test_enr(1);
        let enr_b = test_enr(2);
        let (tx_a, mut rx_a) = mpsc::channel::<OutboundPacket>(1024);
        let (tx_b, mut rx_b) = mpsc::channel::<OutboundPacket>(1024);
        let a = UtpEndpoint::with_config(tx_a, fast_config());
        let b = UtpEndpoint::with_config(tx_b, fast_config());

        {
            let b = b.clone();
            let from = enr_a.clone();
            tokio::spawn(async move {
                let counter = AtomicUsize::new(0);
                while let Some(pkt) = rx_a.recv().await {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if drop_a_to_b(n, &pkt.data) {
                        continue;
                    }
                    b.handle_inbound(&from, &pkt.data);
                }
            });
        }
        {
            let a = a.clone();
            let from = enr_b.clone();
            tokio::spawn(async move {
                while let Some(pkt) = rx_b.recv().await {
                    a.handle_inbound(&from, &pkt.data);
                }
            });
        }
        (a, b, enr_a, enr_b)
    }

    fn no_loss() -> Arc<dyn Fn(usize, &[u8]) -> bool + Send + Sync> {
        Arc::new(|_, _| false)
    }

    #[test]
    fn packet_header_roundtrip() {
        let packet = Packet {
            ptype: PacketType::Data,
            connection_id: 0xBEEF,
            timestamp_micros: 123_456,
            timestamp_diff_micros: 789,
            window: 65_535,
            seq_nr: 100,
            ack_nr: 99,
            payload: Bytes::from_static(b"chunk"),
        };
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        assert_eq!(bytes[0], (0 << 4) | VERSION);
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn packet_types_encode_in_high_nibble() {
        for (ptype, nibble) in [
            (PacketType::Data, 0u8),
            (PacketType::Fin, 1),
            (PacketType::State, 2),
            (PacketType::Reset, 3),
            (PacketType::Syn, 4),
        ] {
            let packet = Packet {
                ptype,
                connection_id: 1,
                timestamp_micros: 0,
                timestamp_diff_micros: 0,
                window: 0,
                seq_nr: 0,
                ack_nr: 0,
                payload: Bytes::new(),
            };
            assert_eq!(packet.encode()[0] >> 4, nibble);
        }
    }

    #[test]
    fn malformed_packets_rejected() {
        assert!(Packet::decode(&[0u8; 10]).is_err());
        let mut ok = Packet {
            ptype: PacketType::Syn,
            connection_id: 1,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window: 0,
            seq_nr: 1,
            ack_nr: 0,
            payload: Bytes::new(),
        }
        .encode();
        ok[0] = (7 << 4) | VERSION; // unknown type
        assert!(Packet::decode(&ok).is_err());
        ok[0] = (4 << 4) | 2; // wrong version
        assert!(Packet::decode(&ok).is_err());
    }

    #[test]
    fn seq_comparison_wraps() {
        assert!(seq_lt(1, 2));
        assert!(seq_lt(65_535, 0));
        assert!(seq_lt(65_000, 100));
        assert!(!seq_lt(2, 1));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn rto_stays_bounded() {
        let mut c = Congestion::new();
        assert!(c.rto() >= RTO_MIN && c.rto() <= RTO_MAX);
        c.on_rtt_sample(Duration::from_millis(1));
        assert_eq!(c.rto(), RTO_MIN);
        c.on_rtt_sample(Duration::from_secs(30));
        assert_eq!(c.rto(), RTO_MAX);
    }

    #[test]
    fn cwnd_collapses_on_timeout_and_grows_under_target() {
        let mut c = Congestion::new();
        let initial = c.window();
        c.on_ack(MAX_PACKET_PAYLOAD, 1_000);
        assert!(c.window() >= initial);
        c.on_timeout();
        assert_eq!(c.window(), MAX_PACKET_PAYLOAD);
    }

    #[tokio::test]
    async fn small_payload_transfers() {
        let (a, b, enr_a, enr_b) = linked_endpoints(no_loss());
        let conn_id = 100;
        let payload = b"hello bulk transfer".to_vec();

        let reader = {
            let b = b.clone();
            let from = enr_a.clone();
            tokio::spawn(async move { b.accept_payload(from, conn_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.send_outbound(enr_b.clone(), conn_id, payload.clone())
            .await
            .expect("send");
        let received = reader.await.unwrap().expect("receive");
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn multi_chunk_payload_transfers() {
        let (a, b, enr_a, enr_b) = linked_endpoints(no_loss());
        let conn_id = 7;
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();

        let reader = {
            let b = b.clone();
            let from = enr_a.clone();
            tokio::spawn(async move { b.accept_payload(from, conn_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.send_outbound(enr_b.clone(), conn_id, payload.clone())
            .await
            .expect("send");
        let received = reader.await.unwrap().expect("receive");
        assert_eq!(received.len(), payload.len());
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn serve_and_receive_roles() {
        // FINDCONTENT shape: requester connects, responder writes.
        let (a, b, enr_a, enr_b) = linked_endpoints(no_loss());
        let conn_id = 42;
        let payload = vec![0xAB; 5000];

        let server = {
            let b = b.clone();
            let from = enr_a.clone();
            let payload = payload.clone();
            tokio::spawn(async move { b.serve_payload(from, conn_id, payload).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let received = a
            .receive_outbound(enr_b.clone(), conn_id)
            .await
            .expect("receive");
        assert_eq!(received, payload);
        server.await.unwrap().expect("serve");
    }

    #[tokio::test]
    async fn lost_data_packet_is_retransmitted() {
        // Drop the first ST_DATA from the writer exactly once.
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped_clone = dropped.clone();
        let drop_fn: Arc<dyn Fn(usize, &[u8]) -> bool + Send + Sync> =
            Arc::new(move |_, data| {
                if data.len() >= HEADER_SIZE
                    && data[0] >> 4 == 0
                    && dropped_clone.fetch_add(1, Ordering::SeqCst) == 0
                {
                    return true;
                }
                false
            });
        let (a, b, enr_a, enr_b) = linked_endpoints(drop_fn);
        let conn_id = 9;
        let payload: Vec<u8> = (0..8000).map(|i| (i % 253) as u8).collect();

        let reader = {
            let b = b.clone();
            let from = enr_a.clone();
            tokio::spawn(async move { b.accept_payload(from, conn_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.send_outbound(enr_b.clone(), conn_id, payload.clone())
            .await
            .expect("send despite loss");
        let received = reader.await.unwrap().expect("receive despite loss");
        assert_eq!(received, payload);
        assert!(dropped.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn connect_without_peer_times_out() {
        let (tx, _rx) = mpsc::channel(64);
        let endpoint = UtpEndpoint::with_config(tx, fast_config());
        let err = endpoint
            .receive_outbound(test_enr(3), 5)
            .await
            .expect_err("no peer");
        assert_eq!(err, UtpError::SynTimeout);
    }

    #[tokio::test]
    async fn accept_without_syn_times_out() {
        let (tx, _rx) = mpsc::channel(64);
        let endpoint = UtpEndpoint::with_config(tx, fast_config());
        let err = endpoint
            .accept_payload(test_enr(3), 5)
            .await
            .expect_err("no syn");
        assert_eq!(err, UtpError::SynTimeout);
    }

    #[tokio::test]
    async fn duplicate_connection_id_rejected() {
        let (tx, _rx) = mpsc::channel(64);
        let endpoint = UtpEndpoint::with_config(tx, fast_config());
        let peer = test_enr(3);
        let first = {
            let endpoint = endpoint.clone();
            let peer = peer.clone();
            tokio::spawn(async move { endpoint.accept_payload(peer, 11).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = endpoint
            .accept_payload(peer, 11)
            .await
            .expect_err("id in use");
        assert_eq!(err, UtpError::IdInUse(11));
        let _ = first.await;
    }

    #[tokio::test]
    async fn reserve_id_avoids_live_sessions() {
        let (tx, _rx) = mpsc::channel(64);
        let endpoint = UtpEndpoint::with_config(tx, fast_config());
        let peer = test_enr(3);
        let peer_id = peer.node_id();
        let _pending = {
            let endpoint = endpoint.clone();
            let peer = peer.clone();
            tokio::spawn(async move { endpoint.accept_payload(peer, 500).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..64 {
            assert_ne!(endpoint.reserve_id(&peer_id), 500);
        }
    }

    #[tokio::test]
    async fn inbound_reset_aborts_reader() {
        let (tx, _rx) = mpsc::channel(64);
        let endpoint = UtpEndpoint::with_config(tx, fast_config());
        let peer = test_enr(4);
        let conn_id = 77;

        let reader = {
            let endpoint = endpoint.clone();
            let peer = peer.clone();
            tokio::spawn(async move { endpoint.accept_payload(peer, conn_id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Handshake, then an immediate reset.
        let syn = Packet {
            ptype: PacketType::Syn,
            connection_id: conn_id,
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window: RECEIVE_WINDOW,
            seq_nr: 1,
            ack_nr: 0,
            payload: Bytes::new(),
        };
        endpoint.handle_inbound(&peer, &syn.encode());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reset = Packet {
            ptype: PacketType::Reset,
            connection_id: conn_id.wrapping_add(1),
            timestamp_micros: 0,
            timestamp_diff_micros: 0,
            window: 0,
            seq_nr: 2,
            ack_nr: 0,
            payload: Bytes::new(),
        };
        endpoint.handle_inbound(&peer, &reset.encode());

        let err = reader.await.unwrap().expect_err("reset");
        assert_eq!(err, UtpError::Reset);
    }

    #[tokio::test]
    async fn stalled_writer_resets() {
        // Reader acks the handshake and then goes silent.
        let (tx, mut rx) = mpsc::channel::<OutboundPacket>(256);
        let endpoint = UtpEndpoint::with_config(tx, fast_config());
        let peer = test_enr(5);
        let conn_id: u16 = 300;

        let responder = {
            let endpoint = endpoint.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                while let Some(pkt) = rx.recv().await {
                    let packet = Packet::decode(&pkt.data).unwrap();
                    if packet.ptype == PacketType::Syn {
                        let ack = Packet {
                            ptype: PacketType::State,
                            connection_id: conn_id.wrapping_add(1),
                            timestamp_micros: 0,
                            timestamp_diff_micros: 0,
                            window: RECEIVE_WINDOW,
                            seq_nr: 900,
                            ack_nr: packet.seq_nr,
                            payload: Bytes::new(),
                        };
                        endpoint.handle_inbound(&peer, &ack.encode());
                    }
                    // Never ack data.
                }
            })
        };

        let err = endpoint
            .send_outbound(peer.clone(), conn_id, vec![0xFF; 4000])
            .await
            .expect_err("stall");
        assert!(matches!(err, UtpError::Stalled));
        responder.abort();
    }
}
