//! # Node Records and the XOR Metric
//!
//! This module defines the identity layer of the overlay:
//!
//! - [`NodeId`]: 32-byte identifier derived from the peer's signing key
//! - [`Enr`]: signed, versioned, revisable record advertising a peer's
//!   addresses and supported sub-protocols (EIP-778, "v4" identity scheme)
//! - Distance helpers: XOR distance, log2-distance, bucket index
//!
//! ## Identity Model
//!
//! A node id is `keccak256(uncompressed secp256k1 public key)`. Possession
//! of the private key proves ownership of the id; records are revisable and
//! each revision carries a monotonically increasing sequence number. The
//! highest observed sequence wins.
//!
//! ## Record Format
//!
//! An ENR is the RLP list `[signature, seq, k1, v1, k2, v2, ...]` with keys
//! sorted and unique. The signature is a 64-byte compact secp256k1 ECDSA
//! signature over `keccak256(rlp([seq, k1, v1, ...]))`. Records larger than
//! 300 bytes are invalid.
//!
//! ## Invariants
//!
//! - P1: `NodeId::from_bytes(b).raw() == b`
//! - P2: XOR distance is symmetric; `distance(a, a) == 0`
//! - P3: `Enr::decode` only yields records whose signature verifies
//! - P4: `bucket_index(a, b) == 256 - floor(log2(distance(a, b))) - 1`

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use alloy_primitives::{keccak256, U256};
use alloy_rlp::{Decodable, Encodable, Header};
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};
use serde::{Deserialize, Serialize};

use crate::error::EnrError;

/// Maximum encoded size of a record (EIP-778).
pub const MAX_ENR_SIZE: usize = 300;

/// Record key holding the identity scheme name.
const KEY_ID: &[u8] = b"id";
/// Record key holding the compressed secp256k1 public key.
const KEY_SECP256K1: &[u8] = b"secp256k1";
const KEY_IP: &[u8] = b"ip";
const KEY_UDP: &[u8] = b"udp";
const KEY_IP6: &[u8] = b"ip6";
const KEY_UDP6: &[u8] = b"udp6";

// ============================================================================
// NodeId and the XOR metric
// ============================================================================

/// 32-byte overlay identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const ZERO: NodeId = NodeId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the id from an uncompressed-form public key.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let uncompressed = key.serialize_uncompressed();
        Self(keccak256(&uncompressed[1..]).0)
    }

    pub fn raw(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bitwise XOR distance to `other`.
    pub fn xor_distance(&self, other: &NodeId) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// XOR distance as an unsigned 256-bit integer, for radius comparisons.
    pub fn distance_to(&self, target: &[u8; 32]) -> U256 {
        let mut d = [0u8; 32];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ target[i];
        }
        U256::from_be_bytes(d)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Total ordering on raw XOR distances.
pub fn distance_cmp(a: &[u8; 32], b: &[u8; 32]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// `floor(log2(distance(a, b)))`, or `None` when the ids are equal.
pub fn log2_distance(a: &NodeId, b: &NodeId) -> Option<usize> {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let bit_from_top = byte_idx * 8 + byte.leading_zeros() as usize;
            return Some(255 - bit_from_top);
        }
    }
    None
}

/// Bucket index for `other` relative to `local`:
/// `256 - floor(log2(distance)) - 1`, i.e. the count of leading zero bits
/// in the 256-bit distance. `None` when the ids are equal.
pub fn bucket_index(local: &NodeId, other: &NodeId) -> Option<usize> {
    log2_distance(local, other).map(|l| 255 - l)
}

/// A uniformly random id whose distance from `local` falls in `bucket`.
/// Used to refresh stale buckets with a targeted lookup.
pub fn random_id_in_bucket(local: &NodeId, bucket: usize) -> NodeId {
    use rand::RngCore;
    let bucket = bucket.min(255);
    let mut distance = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut distance);

    let byte_idx = bucket / 8;
    let bit_pos = bucket % 8;
    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }
    let top_bit = 0x80u8 >> bit_pos;
    distance[byte_idx] = top_bit | (distance[byte_idx] & top_bit.wrapping_sub(1));

    let mut target = local.raw();
    for (i, byte) in target.iter_mut().enumerate() {
        *byte ^= distance[i];
    }
    NodeId::from_bytes(target)
}

// ============================================================================
// ENR
// ============================================================================

/// A validated Ethereum Node Record.
///
/// Construction goes through [`Enr::decode`] (which verifies the signature)
/// or [`EnrBuilder::build`] (which creates one). Both paths uphold P3.
#[derive(Clone, PartialEq, Eq)]
pub struct Enr {
    signature: [u8; 64],
    seq: u64,
    /// Key to raw RLP item (header included), sorted per the record format.
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
    node_id: NodeId,
    encoded: Vec<u8>,
}

impl Enr {
    /// Decode and verify a record. Rejects oversized records, unsorted or
    /// duplicate keys, unknown identity schemes, and bad signatures.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnrError> {
        if bytes.len() > MAX_ENR_SIZE {
            return Err(EnrError::TooLarge(bytes.len()));
        }
        let mut outer = bytes;
        let header = Header::decode(&mut outer)?;
        if !header.list {
            return Err(EnrError::NotAList);
        }
        if header.payload_length != outer.len() {
            return Err(EnrError::Rlp("length mismatch".into()));
        }

        let mut payload = outer;
        let sig_bytes = Header::decode_bytes(&mut payload, false)?.to_vec();
        let signature: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| EnrError::Rlp("signature must be 64 bytes".into()))?;
        let seq = u64::decode(&mut payload)?;

        let mut pairs: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while !payload.is_empty() {
            let key = Header::decode_bytes(&mut payload, false)?.to_vec();
            if let Some(prev) = &last_key {
                if key <= *prev {
                    return Err(EnrError::UnsortedKeys);
                }
            }
            let (raw, rest) = split_raw_item(payload)?;
            pairs.insert(key.clone(), raw.to_vec());
            last_key = Some(key);
            payload = rest;
        }

        let record = Self::assemble(signature, seq, pairs)?;
        if record.encoded != bytes {
            // Non-canonical encodings are rejected outright.
            return Err(EnrError::Rlp("non-canonical record encoding".into()));
        }
        Ok(record)
    }

    /// Validate the scheme, verify the signature, and derive the node id.
    fn assemble(
        signature: [u8; 64],
        seq: u64,
        pairs: BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<Self, EnrError> {
        let scheme = pairs
            .get(KEY_ID)
            .map(|raw| decode_bytes(raw))
            .transpose()?
            .ok_or(EnrError::MissingKey("id"))?;
        if scheme != b"v4" {
            return Err(EnrError::UnknownScheme(
                String::from_utf8_lossy(&scheme).into_owned(),
            ));
        }

        let pk_bytes = pairs
            .get(KEY_SECP256K1)
            .map(|raw| decode_bytes(raw))
            .transpose()?
            .ok_or(EnrError::MissingKey("secp256k1"))?;
        let public_key =
            PublicKey::from_slice(&pk_bytes).map_err(|_| EnrError::InvalidPublicKey)?;

        let digest = signing_digest(seq, &pairs);
        let msg = Message::from_digest(digest);
        let sig = Signature::from_compact(&signature).map_err(|_| EnrError::BadSignature)?;
        SECP256K1
            .verify_ecdsa(&msg, &sig, &public_key)
            .map_err(|_| EnrError::BadSignature)?;

        let node_id = NodeId::from_public_key(&public_key);
        let encoded = encode_record(&signature, seq, &pairs);
        if encoded.len() > MAX_ENR_SIZE {
            return Err(EnrError::TooLarge(encoded.len()));
        }
        Ok(Self {
            signature,
            seq,
            pairs,
            node_id,
            encoded,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Raw RLP item stored under `key`, header included.
    pub fn get_raw(&self, key: &[u8]) -> Option<&[u8]> {
        self.pairs.get(key).map(|v| v.as_slice())
    }

    pub fn ip4(&self) -> Option<Ipv4Addr> {
        let raw = self.pairs.get(KEY_IP)?;
        let bytes = decode_bytes(raw).ok()?;
        let octets: [u8; 4] = bytes.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn udp4(&self) -> Option<u16> {
        let raw = self.pairs.get(KEY_UDP)?;
        u16::decode(&mut raw.as_slice()).ok()
    }

    pub fn ip6(&self) -> Option<Ipv6Addr> {
        let raw = self.pairs.get(KEY_IP6)?;
        let bytes = decode_bytes(raw).ok()?;
        let octets: [u8; 16] = bytes.as_slice().try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }

    pub fn udp6(&self) -> Option<u16> {
        let raw = self.pairs.get(KEY_UDP6)?;
        u16::decode(&mut raw.as_slice()).ok()
    }

    /// Reachable UDP endpoint, preferring IPv4.
    pub fn udp_socket(&self) -> Option<SocketAddr> {
        if let (Some(ip), Some(port)) = (self.ip4(), self.udp4()) {
            return Some(SocketAddr::new(IpAddr::V4(ip), port));
        }
        if let (Some(ip), Some(port)) = (self.ip6(), self.udp6()) {
            return Some(SocketAddr::new(IpAddr::V6(ip), port));
        }
        None
    }

    /// Full canonical encoding.
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.encoded)
    }

    pub fn from_hex(s: &str) -> Result<Self, EnrError> {
        let bytes = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| EnrError::Rlp(format!("hex: {e}")))?;
        Self::decode(&bytes)
    }
}

impl fmt::Debug for Enr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enr")
            .field("node_id", &self.node_id)
            .field("seq", &self.seq)
            .field("addr", &self.udp_socket())
            .finish()
    }
}

/// Builder for the local record.
pub struct EnrBuilder {
    seq: u64,
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Default for EnrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrBuilder {
    pub fn new() -> Self {
        Self {
            seq: 1,
            pairs: BTreeMap::new(),
        }
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn ip4(mut self, ip: Ipv4Addr) -> Self {
        self.pairs.insert(KEY_IP.to_vec(), encode_bytes(&ip.octets()));
        self
    }

    pub fn udp4(mut self, port: u16) -> Self {
        let mut out = Vec::new();
        port.encode(&mut out);
        self.pairs.insert(KEY_UDP.to_vec(), out);
        self
    }

    pub fn ip6(mut self, ip: Ipv6Addr) -> Self {
        self.pairs.insert(KEY_IP6.to_vec(), encode_bytes(&ip.octets()));
        self
    }

    pub fn udp6(mut self, port: u16) -> Self {
        let mut out = Vec::new();
        port.encode(&mut out);
        self.pairs.insert(KEY_UDP6.to_vec(), out);
        self
    }

    /// Arbitrary extension pair; `value` is stored as an RLP byte string.
    pub fn kv(mut self, key: &[u8], value: &[u8]) -> Self {
        self.pairs.insert(key.to_vec(), encode_bytes(value));
        self
    }

    /// Sign and assemble the record.
    pub fn build(mut self, secret: &SecretKey) -> Result<Enr, EnrError> {
        let public_key = secret.public_key(SECP256K1);
        self.pairs.insert(KEY_ID.to_vec(), encode_bytes(b"v4"));
        self.pairs
            .insert(KEY_SECP256K1.to_vec(), encode_bytes(&public_key.serialize()));

        let digest = signing_digest(self.seq, &self.pairs);
        let msg = Message::from_digest(digest);
        let signature = SECP256K1
            .sign_ecdsa(&msg, secret)
            .serialize_compact();

        Enr::assemble(signature, self.seq, self.pairs)
    }
}

/// Split one raw RLP item (header plus payload) off the front of `buf`.
fn split_raw_item(buf: &[u8]) -> Result<(&[u8], &[u8]), EnrError> {
    let mut probe = buf;
    let h = Header::decode(&mut probe)?;
    let consumed = buf.len() - probe.len();
    let total = consumed + h.payload_length;
    if total > buf.len() {
        return Err(EnrError::Rlp("truncated item".into()));
    }
    Ok((&buf[..total], &buf[total..]))
}

/// Decode a raw RLP item as a byte string.
fn decode_bytes(raw: &[u8]) -> Result<Vec<u8>, EnrError> {
    let mut slice = raw;
    Ok(Header::decode_bytes(&mut slice, false)?.to_vec())
}

/// Encode `value` as an RLP byte string item.
fn encode_bytes(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 2);
    value.encode(&mut out);
    out
}

/// `keccak256(rlp([seq, k1, v1, ...]))` — the signed content.
fn signing_digest(seq: u64, pairs: &BTreeMap<Vec<u8>, Vec<u8>>) -> [u8; 32] {
    let mut payload = Vec::new();
    seq.encode(&mut payload);
    for (key, raw_value) in pairs {
        key.as_slice().encode(&mut payload);
        payload.extend_from_slice(raw_value);
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    keccak256(&out).0
}

/// Canonical full encoding `rlp([signature, seq, k1, v1, ...])`.
fn encode_record(signature: &[u8; 64], seq: u64, pairs: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<u8> {
    let mut payload = Vec::new();
    signature.as_slice().encode(&mut payload);
    seq.encode(&mut payload);
    for (key, raw_value) in pairs {
        key.as_slice().encode(&mut payload);
        payload.extend_from_slice(raw_value);
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> SecretKey {
        SecretKey::new(&mut OsRng)
    }

    fn sample_enr(secret: &SecretKey, seq: u64) -> Enr {
        EnrBuilder::new()
            .seq(seq)
            .ip4(Ipv4Addr::new(127, 0, 0, 1))
            .udp4(9009)
            .build(secret)
            .expect("build")
    }

    #[test]
    fn build_decode_roundtrip() {
        let sk = keypair();
        let enr = sample_enr(&sk, 3);
        let decoded = Enr::decode(enr.encoded()).expect("decode");
        assert_eq!(decoded, enr);
        assert_eq!(decoded.seq(), 3);
        assert_eq!(decoded.node_id(), enr.node_id());
        assert_eq!(
            decoded.udp_socket(),
            Some("127.0.0.1:9009".parse().unwrap())
        );
    }

    #[test]
    fn node_id_matches_key_derivation() {
        let sk = keypair();
        let enr = sample_enr(&sk, 1);
        let expected = NodeId::from_public_key(&sk.public_key(SECP256K1));
        assert_eq!(enr.node_id(), expected);
    }

    #[test]
    fn tampered_record_rejected() {
        let sk = keypair();
        let enr = sample_enr(&sk, 1);
        let mut bytes = enr.encoded().to_vec();
        // Flip a bit inside the signed content region (the port).
        let n = bytes.len();
        bytes[n - 1] ^= 0x01;
        assert!(Enr::decode(&bytes).is_err());
    }

    #[test]
    fn oversized_record_rejected() {
        let sk = keypair();
        let result = EnrBuilder::new()
            .kv(b"blob", &[0xAA; 280])
            .build(&sk);
        assert!(matches!(result, Err(EnrError::TooLarge(_))));
    }

    #[test]
    fn hex_roundtrip() {
        let sk = keypair();
        let enr = sample_enr(&sk, 7);
        let restored = Enr::from_hex(&enr.to_hex()).expect("from_hex");
        assert_eq!(restored, enr);
    }

    #[test]
    fn xor_distance_symmetric_and_zero_on_self() {
        let a = NodeId::from_bytes([0x1f; 32]);
        let b = NodeId::from_bytes([0xf1; 32]);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);
        assert_eq!(log2_distance(&a, &a), None);
    }

    #[test]
    fn bucket_index_matches_log2_invariant() {
        // bucket-index == 256 - floor(log2(distance)) - 1 for assorted pairs.
        let local = NodeId::from_bytes([0u8; 32]);
        for bit in [0usize, 1, 7, 8, 100, 254, 255] {
            let mut other = [0u8; 32];
            other[bit / 8] = 0x80 >> (bit % 8);
            let other = NodeId::from_bytes(other);
            let log2 = log2_distance(&local, &other).unwrap();
            let idx = bucket_index(&local, &other).unwrap();
            assert_eq!(idx, 256 - log2 - 1);
            assert_eq!(idx, bit);
        }
    }

    #[test]
    fn distance_to_is_big_endian_xor() {
        let a = NodeId::from_bytes([0u8; 32]);
        let mut t = [0u8; 32];
        t[31] = 5;
        assert_eq!(a.distance_to(&t), U256::from(5u64));
        t = [0u8; 32];
        t[0] = 0x80;
        assert_eq!(a.distance_to(&t), U256::from(1u64) << 255);
    }

    #[test]
    fn random_bucket_ids_land_in_their_bucket() {
        let local = NodeId::from_bytes([0x5A; 32]);
        for bucket in [0usize, 1, 8, 100, 200, 255] {
            for _ in 0..4 {
                let id = random_id_in_bucket(&local, bucket);
                assert_eq!(bucket_index(&local, &id), Some(bucket));
            }
        }
    }

    #[test]
    fn seq_ordering_prefers_newer_records() {
        let sk = keypair();
        let old = sample_enr(&sk, 1);
        let new = sample_enr(&sk, 2);
        assert_eq!(old.node_id(), new.node_id());
        assert!(new.seq() > old.seq());
    }
}
