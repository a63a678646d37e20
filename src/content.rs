//! Content keys, content ids, and the responsibility radius.
//!
//! A content key is a tagged union encoded as `selector_byte || body`; the
//! grammar of the body is owned by each sub-protocol (see `history` and
//! `state`). This module owns what is common to all of them: the 2-byte
//! sub-protocol tags, the derivation of the 32-byte content id from the
//! serialized key, and distance/radius arithmetic over content ids.
//!
//! Placement in the overlay is `XOR(node_id, content_id)` interpreted as an
//! unsigned 256-bit integer; a node is responsible for content whose
//! distance from its own id is at most its radius.

use alloy_primitives::{keccak256, B256, U256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::enr::NodeId;

/// Logical overlay identifier carried on every wire exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubProtocolId {
    State,
    History,
    CanonicalIndices,
    Beacon,
}

impl SubProtocolId {
    /// 2-byte wire tag, big-endian.
    pub fn tag(&self) -> [u8; 2] {
        match self {
            SubProtocolId::State => [0x50, 0x0A],
            SubProtocolId::History => [0x50, 0x0B],
            SubProtocolId::CanonicalIndices => [0x50, 0x0C],
            SubProtocolId::Beacon => [0x50, 0x1A],
        }
    }

    pub fn from_tag(tag: [u8; 2]) -> Option<Self> {
        match tag {
            [0x50, 0x0A] => Some(SubProtocolId::State),
            [0x50, 0x0B] => Some(SubProtocolId::History),
            [0x50, 0x0C] => Some(SubProtocolId::CanonicalIndices),
            [0x50, 0x1A] => Some(SubProtocolId::Beacon),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubProtocolId::State => "state",
            SubProtocolId::History => "history",
            SubProtocolId::CanonicalIndices => "canonical-indices",
            SubProtocolId::Beacon => "beacon",
        }
    }
}

impl std::fmt::Display for SubProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A serialized content key: `selector_byte || body`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RawContentKey(pub Vec<u8>);

impl RawContentKey {
    pub fn selector(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn body(&self) -> &[u8] {
        if self.0.is_empty() {
            &[]
        } else {
            &self.0[1..]
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for RawContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey(0x{})", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for RawContentKey {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

/// Derive the 32-byte content id for a serialized key.
///
/// History, State, and CanonicalIndices hash the serialized key with
/// keccak-256; Beacon derives via sha256.
pub fn content_id(protocol: SubProtocolId, key: &RawContentKey) -> B256 {
    match protocol {
        SubProtocolId::History | SubProtocolId::State | SubProtocolId::CanonicalIndices => {
            keccak256(key.as_slice())
        }
        SubProtocolId::Beacon => {
            let digest = Sha256::digest(key.as_slice());
            B256::from_slice(&digest)
        }
    }
}

/// The responsibility radius: maximum XOR distance a node stores within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Radius(pub U256);

impl Radius {
    /// Radius covering the entire keyspace.
    pub const MAX: Radius = Radius(U256::MAX);

    pub fn covers(&self, distance: U256) -> bool {
        distance <= self.0
    }

    /// 32-byte little-endian encoding used in PING/PONG custom payloads.
    pub fn to_le_bytes(&self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Radius(U256::from_le_bytes(bytes))
    }
}

/// Distance between a node id and a content id.
pub fn distance(node: &NodeId, content: &B256) -> U256 {
    node.distance_to(&content.0)
}

/// Whether `node` is responsible for `content` under `radius`.
pub fn within_radius(node: &NodeId, content: &B256, radius: Radius) -> bool {
    radius.covers(distance(node, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn tags_roundtrip() {
        for proto in [
            SubProtocolId::State,
            SubProtocolId::History,
            SubProtocolId::CanonicalIndices,
            SubProtocolId::Beacon,
        ] {
            assert_eq!(SubProtocolId::from_tag(proto.tag()), Some(proto));
        }
        assert_eq!(SubProtocolId::from_tag([0x50, 0xFF]), None);
    }

    #[test]
    fn history_content_id_is_keccak_of_serialized_key() {
        // Mainnet block 1 hash, header key selector 0x00.
        let block_hash =
            hex!("88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6");
        let mut key = vec![0x00u8];
        key.extend_from_slice(&block_hash);
        let key = RawContentKey(key);

        let id = content_id(SubProtocolId::History, &key);
        assert_eq!(id, keccak256(key.as_slice()));
        // Deriving through the serialized form is the same operation.
        let reserialized = RawContentKey(key.as_slice().to_vec());
        assert_eq!(content_id(SubProtocolId::History, &reserialized), id);
    }

    #[test]
    fn beacon_content_id_uses_sha256() {
        let key = RawContentKey(vec![0x10, 0xAA, 0xBB]);
        let id = content_id(SubProtocolId::Beacon, &key);
        assert_eq!(id.as_slice(), Sha256::digest(key.as_slice()).as_slice());
        assert_ne!(id, keccak256(key.as_slice()));
    }

    #[test]
    fn radius_covers_boundary() {
        let radius = Radius(U256::from(1000u64));
        assert!(radius.covers(U256::from(1000u64)));
        assert!(radius.covers(U256::ZERO));
        assert!(!radius.covers(U256::from(1001u64)));
    }

    #[test]
    fn radius_le_bytes_roundtrip() {
        let radius = Radius(U256::MAX - U256::from(1u64));
        let bytes = radius.to_le_bytes();
        assert_eq!(bytes[0], 0xfe);
        assert!(bytes[1..].iter().all(|b| *b == 0xff));
        assert_eq!(Radius::from_le_bytes(bytes), radius);
    }

    #[test]
    fn distance_is_xor_of_id_and_content_id() {
        let node = NodeId::from_bytes([0u8; 32]);
        let mut content = [0u8; 32];
        content[31] = 0x0f;
        let content = B256::from(content);
        assert_eq!(distance(&node, &content), U256::from(0x0f));
        assert!(within_radius(&node, &content, Radius(U256::from(0x0f))));
        assert!(!within_radius(&node, &content, Radius(U256::from(0x0e))));
    }
}
