//! Typed error taxonomy for the overlay core.
//!
//! Components return typed outcomes; nothing crosses a sub-protocol boundary
//! as an unmodeled panic. The taxonomy follows four recovery classes:
//! transient network failures (retry or drop), protocol violations (drop the
//! packet, never credit the peer), verification failures (discard the
//! payload), and storage failures (bubble to the caller).

use thiserror::Error;

/// Transient transport-level failures. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("no route to peer")]
    NoRoute,
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

/// Wire-format violations. The offending packet is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("empty message")]
    Empty,
    #[error("unknown message selector {0:#04x}")]
    UnknownSelector(u8),
    #[error("unknown union selector {0}")]
    UnknownUnion(u8),
    #[error("message truncated: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    #[error("variable-field offset {offset} out of bounds (len {len})")]
    BadOffset { offset: usize, len: usize },
    #[error("list exceeds limit: {got} > {limit}")]
    OverLimit { got: usize, limit: usize },
    #[error("bitlist missing sentinel bit")]
    MissingSentinel,
    #[error("trailing bytes after message body")]
    TrailingBytes,
}

/// Node-record parsing and signature failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnrError {
    #[error("record is not an RLP list")]
    NotAList,
    #[error("rlp: {0}")]
    Rlp(String),
    #[error("record exceeds 300-byte limit ({0} bytes)")]
    TooLarge(usize),
    #[error("record keys not sorted or duplicated")]
    UnsortedKeys,
    #[error("unsupported identity scheme {0:?}")]
    UnknownScheme(String),
    #[error("missing required key {0:?}")]
    MissingKey(&'static str),
    #[error("invalid secp256k1 public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    BadSignature,
}

impl From<alloy_rlp::Error> for EnrError {
    fn from(e: alloy_rlp::Error) -> Self {
        EnrError::Rlp(e.to_string())
    }
}

/// Content verification failures. The payload is discarded, never stored,
/// never gossiped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed content key")]
    MalformedKey,
    #[error("rlp decoding failed: {0}")]
    Decode(String),
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("root mismatch: expected {expected}, computed {computed}")]
    RootMismatch { expected: String, computed: String },
    #[error("merkle proof invalid")]
    InvalidProof,
    #[error("required header not available locally")]
    HeaderUnavailable,
    #[error("accumulator does not cover epoch {0}")]
    EpochOutOfRange(u64),
    #[error("trie proof invalid: {0}")]
    Trie(String),
}

/// Persistence-backend failures. Admission fails; gossip is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("backend: {0}")]
    Backend(String),
    #[error("content outside radius")]
    OutsideRadius,
    #[error("verification failed: {0}")]
    Verification(#[from] ValidationError),
    #[error("corrupt metadata for {0}")]
    CorruptMetadata(String),
}

/// Lookup outcomes that are not a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("content not found")]
    NotFound,
    #[error("lookup deadline elapsed")]
    DeadlineElapsed,
    #[error("candidate set exhausted")]
    Exhausted,
    #[error("lookup cancelled")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Bulk-transfer channel failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UtpError {
    #[error("connection reset by peer")]
    Reset,
    #[error("transfer stalled beyond the stall deadline")]
    Stalled,
    #[error("handshake timed out")]
    SynTimeout,
    #[error("connection id {0} already in use")]
    IdInUse(u16),
    #[error("payload exceeds transfer limit ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("malformed packet")]
    MalformedPacket,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Overlay-level request failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverlayError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error(transparent)]
    Utp(#[from] UtpError),
    #[error("overlay actor closed")]
    Closed,
}
