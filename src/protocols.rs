//! Trait definitions for the seams between the overlay core and its
//! external collaborators.
//!
//! The core consumes three capabilities it deliberately does not implement:
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Discovery substrate | [`Discovery`] | Authenticated request/response to a peer, inbound events |
//! | Persistence backend | [`ContentDb`] | Ordered key-value storage for content payloads |
//! | Verifiers | [`Verifier`] | Type-specific cryptographic validation of content |
//!
//! Traits are defined here separately from implementations so the overlay,
//! store, and lookup modules depend only on the capability, never on a
//! concrete transport or database.

use async_trait::async_trait;

use crate::content::SubProtocolId;
use crate::enr::Enr;
use crate::error::{StoreError, TransportError, ValidationError};

/// An inbound message delivered by the discovery substrate.
///
/// `from` is the sender's record as known to the substrate; `payload` is the
/// raw Portal message (selector byte plus body). For request messages the
/// substrate expects the reply bytes through `respond`.
pub struct InboundTalk {
    pub from: Enr,
    pub protocol: SubProtocolId,
    pub payload: Vec<u8>,
    pub respond: Option<tokio::sync::oneshot::Sender<Vec<u8>>>,
}

impl std::fmt::Debug for InboundTalk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTalk")
            .field("from", &self.from.node_id())
            .field("protocol", &self.protocol)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Node-discovery substrate consumed by the overlay.
///
/// The substrate owns session establishment, handshakes, and packet
/// authentication. The core only needs request/response semantics keyed by
/// sub-protocol tag plus the local signed record.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// The local node's current signed record.
    fn local_enr(&self) -> Enr;

    /// Send a Portal message to `to` under `protocol` and await the reply.
    ///
    /// Resolves with [`TransportError::Timeout`] when the peer does not
    /// answer within the substrate's request deadline.
    async fn talk(
        &self,
        to: &Enr,
        protocol: SubProtocolId,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Send a raw datagram outside the request/response pattern.
    ///
    /// Used by the bulk-transfer channel, which runs its own sequencing and
    /// acknowledgement on top.
    async fn send_raw(&self, to: &Enr, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Ordered key-value persistence backend.
///
/// Keys are hex-encoded content identifiers. The backend is free to be a
/// log-structured store, an embedded B-tree, or plain memory; the content
/// store only relies on get/put/del plus ordered iteration.
#[async_trait]
pub trait ContentDb: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Apply a batch of writes atomically. `None` value means delete.
    async fn batch(&self, ops: Vec<(String, Option<Vec<u8>>)>) -> Result<(), StoreError>;

    /// All keys in lexicographic order. Used for startup scans and snapshot
    /// reload; content sets are radius-bounded so the listing is bounded too.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Type-specific content validation.
///
/// A verifier is a pure function from (content key, candidate payload) to a
/// verified payload. Implementations must not trust the peer that supplied
/// the payload; everything is re-derived from the key and local knowledge.
pub trait Verifier: Send + Sync + 'static {
    /// Validate `payload` against `key`, returning the canonical bytes to
    /// store. Most verifiers return the input unchanged on success.
    fn verify(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationError>;
}
