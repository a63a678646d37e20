//! # Portal Wire Codec
//!
//! Typed messages exchanged on the discovery channel, encoded byte-for-byte
//! per the Portal wire specification: a 1-byte selector followed by an
//! SSZ-style body (fixed region, then variable fields addressed by 4-byte
//! little-endian offsets).
//!
//! | Selector | Message | Body |
//! |----------|---------|------|
//! | 0x00 | PING | enr_seq (u64), custom_payload (byte list) |
//! | 0x01 | PONG | enr_seq (u64), custom_payload (byte list) |
//! | 0x02 | FINDNODES | distances (list of u16, max 256) |
//! | 0x03 | NODES | total (u8), enrs (list of byte lists) |
//! | 0x04 | FINDCONTENT | content_key (byte list) |
//! | 0x05 | CONTENT | union: connection id / inline payload / enr list |
//! | 0x06 | OFFER | content_keys (list of byte lists, max 64) |
//! | 0x07 | ACCEPT | connection_id (2 bytes), content_keys (bitlist) |
//!
//! The CONTENT union selector is 0 for a bulk-transfer connection id
//! (u16, big-endian), 1 for an inline payload, 2 for a list of closer peer
//! records. A payload that cannot fit the discovery ceiling must go through
//! the bulk-transfer arm.
//!
//! Decoding is strict: unknown selectors, out-of-range offsets, list-limit
//! violations, and trailing bytes are all rejected, and the offending packet
//! is dropped without affecting peer liveness state.

use crate::content::Radius;
use crate::error::WireError;

/// Discovery payload ceiling after handshake overhead.
pub const MAX_DISCOVERY_PACKET: usize = 1100;

/// Maximum records in a NODES response or a CONTENT enrs arm.
pub const NODES_LIMIT: usize = 32;

/// Maximum requested distances per FINDNODES.
pub const MAX_DISTANCES: usize = 256;

/// Maximum content keys per OFFER (and bits per ACCEPT).
pub const MAX_KEYS_PER_OFFER: usize = 64;

const SELECTOR_PING: u8 = 0x00;
const SELECTOR_PONG: u8 = 0x01;
const SELECTOR_FINDNODES: u8 = 0x02;
const SELECTOR_NODES: u8 = 0x03;
const SELECTOR_FINDCONTENT: u8 = 0x04;
const SELECTOR_CONTENT: u8 = 0x05;
const SELECTOR_OFFER: u8 = 0x06;
const SELECTOR_ACCEPT: u8 = 0x07;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub enr_seq: u64,
    pub custom_payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNodes {
    pub distances: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nodes {
    /// Number of response packets in the full reply (NODES pagination).
    pub total: u8,
    /// Encoded records.
    pub enrs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindContent {
    pub content_key: Vec<u8>,
}

/// The CONTENT response union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    /// Payload exceeds the discovery ceiling; retrieve over bulk transfer.
    ConnectionId(u16),
    /// Payload small enough to ride inline.
    Payload(Vec<u8>),
    /// Not held here; records of closer peers.
    Enrs(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub content_keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accept {
    pub connection_id: u16,
    pub content_keys: BitList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNodes(FindNodes),
    Nodes(Nodes),
    FindContent(FindContent),
    Content(Content),
    Offer(Offer),
    Accept(Accept),
}

impl Message {
    pub fn selector(&self) -> u8 {
        match self {
            Message::Ping(_) => SELECTOR_PING,
            Message::Pong(_) => SELECTOR_PONG,
            Message::FindNodes(_) => SELECTOR_FINDNODES,
            Message::Nodes(_) => SELECTOR_NODES,
            Message::FindContent(_) => SELECTOR_FINDCONTENT,
            Message::Content(_) => SELECTOR_CONTENT,
            Message::Offer(_) => SELECTOR_OFFER,
            Message::Accept(_) => SELECTOR_ACCEPT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Ping(_) => "PING",
            Message::Pong(_) => "PONG",
            Message::FindNodes(_) => "FINDNODES",
            Message::Nodes(_) => "NODES",
            Message::FindContent(_) => "FINDCONTENT",
            Message::Content(_) => "CONTENT",
            Message::Offer(_) => "OFFER",
            Message::Accept(_) => "ACCEPT",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.selector()];
        match self {
            Message::Ping(m) => encode_seq_and_payload(&mut out, m.enr_seq, &m.custom_payload),
            Message::Pong(m) => encode_seq_and_payload(&mut out, m.enr_seq, &m.custom_payload),
            Message::FindNodes(m) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                for d in &m.distances {
                    out.extend_from_slice(&d.to_le_bytes());
                }
            }
            Message::Nodes(m) => {
                out.push(m.total);
                out.extend_from_slice(&5u32.to_le_bytes());
                out.extend_from_slice(&encode_byte_lists(&m.enrs));
            }
            Message::FindContent(m) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&m.content_key);
            }
            Message::Content(m) => match m {
                Content::ConnectionId(id) => {
                    out.push(0);
                    out.extend_from_slice(&id.to_be_bytes());
                }
                Content::Payload(payload) => {
                    out.push(1);
                    out.extend_from_slice(payload);
                }
                Content::Enrs(enrs) => {
                    out.push(2);
                    out.extend_from_slice(&encode_byte_lists(enrs));
                }
            },
            Message::Offer(m) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&encode_byte_lists(&m.content_keys));
            }
            Message::Accept(m) => {
                out.extend_from_slice(&m.connection_id.to_be_bytes());
                out.extend_from_slice(&6u32.to_le_bytes());
                out.extend_from_slice(&m.content_keys.encode());
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
        let (&selector, body) = bytes.split_first().ok_or(WireError::Empty)?;
        match selector {
            SELECTOR_PING => {
                let (enr_seq, custom_payload) = decode_seq_and_payload(body)?;
                Ok(Message::Ping(Ping {
                    enr_seq,
                    custom_payload,
                }))
            }
            SELECTOR_PONG => {
                let (enr_seq, custom_payload) = decode_seq_and_payload(body)?;
                Ok(Message::Pong(Pong {
                    enr_seq,
                    custom_payload,
                }))
            }
            SELECTOR_FINDNODES => {
                let region = variable_region(body, 4)?;
                if region.len() % 2 != 0 {
                    return Err(WireError::Truncated {
                        needed: region.len() + 1,
                        had: region.len(),
                    });
                }
                let count = region.len() / 2;
                if count > MAX_DISTANCES {
                    return Err(WireError::OverLimit {
                        got: count,
                        limit: MAX_DISTANCES,
                    });
                }
                let distances = region
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Ok(Message::FindNodes(FindNodes { distances }))
            }
            SELECTOR_NODES => {
                if body.is_empty() {
                    return Err(WireError::Truncated { needed: 5, had: 0 });
                }
                let total = body[0];
                let region = variable_region(&body[1..], 4)?;
                let enrs = decode_byte_lists(region, NODES_LIMIT)?;
                Ok(Message::Nodes(Nodes { total, enrs }))
            }
            SELECTOR_FINDCONTENT => {
                let region = variable_region(body, 4)?;
                Ok(Message::FindContent(FindContent {
                    content_key: region.to_vec(),
                }))
            }
            SELECTOR_CONTENT => {
                let (&union, rest) = body.split_first().ok_or(WireError::Empty)?;
                let content = match union {
                    0 => {
                        let id: [u8; 2] =
                            rest.try_into().map_err(|_| WireError::Truncated {
                                needed: 2,
                                had: rest.len(),
                            })?;
                        Content::ConnectionId(u16::from_be_bytes(id))
                    }
                    1 => Content::Payload(rest.to_vec()),
                    2 => Content::Enrs(decode_byte_lists(rest, NODES_LIMIT)?),
                    other => return Err(WireError::UnknownUnion(other)),
                };
                Ok(Message::Content(content))
            }
            SELECTOR_OFFER => {
                let region = variable_region(body, 4)?;
                let content_keys = decode_byte_lists(region, MAX_KEYS_PER_OFFER)?;
                Ok(Message::Offer(Offer { content_keys }))
            }
            SELECTOR_ACCEPT => {
                if body.len() < 6 {
                    return Err(WireError::Truncated {
                        needed: 6,
                        had: body.len(),
                    });
                }
                let connection_id = u16::from_be_bytes([body[0], body[1]]);
                let region = variable_region(&body[2..], 4)?;
                let content_keys = BitList::decode(region, MAX_KEYS_PER_OFFER)?;
                Ok(Message::Accept(Accept {
                    connection_id,
                    content_keys,
                }))
            }
            other => Err(WireError::UnknownSelector(other)),
        }
    }
}

/// Whether an inline CONTENT reply carrying `payload_len` bytes fits the
/// discovery ceiling (selector + union byte + payload).
pub fn content_fits_inline(payload_len: usize) -> bool {
    2 + payload_len <= MAX_DISCOVERY_PACKET
}

/// PING/PONG custom payload carrying the sender's radius (32 bytes LE).
pub fn radius_payload(radius: Radius) -> Vec<u8> {
    radius.to_le_bytes().to_vec()
}

pub fn parse_radius_payload(payload: &[u8]) -> Option<Radius> {
    let bytes: [u8; 32] = payload.try_into().ok()?;
    Some(Radius::from_le_bytes(bytes))
}

fn encode_seq_and_payload(out: &mut Vec<u8>, enr_seq: u64, payload: &[u8]) {
    out.extend_from_slice(&enr_seq.to_le_bytes());
    out.extend_from_slice(&12u32.to_le_bytes());
    out.extend_from_slice(payload);
}

fn decode_seq_and_payload(body: &[u8]) -> Result<(u64, Vec<u8>), WireError> {
    if body.len() < 12 {
        return Err(WireError::Truncated {
            needed: 12,
            had: body.len(),
        });
    }
    let enr_seq = u64::from_le_bytes(body[..8].try_into().unwrap());
    let offset = u32::from_le_bytes(body[8..12].try_into().unwrap()) as usize;
    if offset != 12 || offset > body.len() {
        return Err(WireError::BadOffset {
            offset,
            len: body.len(),
        });
    }
    Ok((enr_seq, body[offset..].to_vec()))
}

/// A container whose single variable field must start at `expected_offset`.
fn variable_region(body: &[u8], expected_offset: usize) -> Result<&[u8], WireError> {
    if body.len() < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            had: body.len(),
        });
    }
    let offset = u32::from_le_bytes(body[..4].try_into().unwrap()) as usize;
    if offset != expected_offset || offset > body.len() {
        return Err(WireError::BadOffset {
            offset,
            len: body.len(),
        });
    }
    Ok(&body[offset..])
}

/// Encode a list of variable-length byte strings: an offset table (4 bytes
/// per element, relative to the start of the region) followed by the
/// concatenated payloads.
fn encode_byte_lists(items: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = 4 * items.len();
    for item in items {
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += item.len();
    }
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

fn decode_byte_lists(region: &[u8], limit: usize) -> Result<Vec<Vec<u8>>, WireError> {
    if region.is_empty() {
        return Ok(Vec::new());
    }
    if region.len() < 4 {
        return Err(WireError::Truncated {
            needed: 4,
            had: region.len(),
        });
    }
    let first = u32::from_le_bytes(region[..4].try_into().unwrap()) as usize;
    if first % 4 != 0 || first < 4 || first > region.len() {
        return Err(WireError::BadOffset {
            offset: first,
            len: region.len(),
        });
    }
    let count = first / 4;
    if count > limit {
        return Err(WireError::OverLimit { got: count, limit });
    }
    let mut offsets = Vec::with_capacity(count + 1);
    for i in 0..count {
        let off =
            u32::from_le_bytes(region[4 * i..4 * i + 4].try_into().unwrap()) as usize;
        offsets.push(off);
    }
    offsets.push(region.len());
    let mut items = Vec::with_capacity(count);
    for pair in offsets.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        if start > end || end > region.len() {
            return Err(WireError::BadOffset {
                offset: start,
                len: region.len(),
            });
        }
        items.push(region[start..end].to_vec());
    }
    Ok(items)
}

/// SSZ bitlist: bits packed LSB-first with a sentinel bit marking the length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitList {
    bits: Vec<bool>,
}

impl BitList {
    pub fn with_len(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn from_bools(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if let Some(slot) = self.bits.get_mut(index) {
            *slot = value;
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn count_set(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    pub fn encode(&self) -> Vec<u8> {
        let n = self.bits.len();
        let mut out = vec![0u8; n / 8 + 1];
        for (i, bit) in self.bits.iter().enumerate() {
            if *bit {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        // Sentinel marks the end of the list.
        out[n / 8] |= 1 << (n % 8);
        out
    }

    pub fn decode(bytes: &[u8], max_bits: usize) -> Result<Self, WireError> {
        let last = *bytes.last().ok_or(WireError::MissingSentinel)?;
        if last == 0 {
            return Err(WireError::MissingSentinel);
        }
        let sentinel = 7 - last.leading_zeros() as usize;
        let len = (bytes.len() - 1) * 8 + sentinel;
        if len > max_bits {
            return Err(WireError::OverLimit {
                got: len,
                limit: max_bits,
            });
        }
        let mut bits = Vec::with_capacity(len);
        for i in 0..len {
            bits.push(bytes[i / 8] & (1 << (i % 8)) != 0);
        }
        Ok(Self { bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use hex_literal::hex;

    #[test]
    fn ping_vector() {
        // enr_seq = 1, radius = 2^256 - 2.
        let msg = Message::Ping(Ping {
            enr_seq: 1,
            custom_payload: radius_payload(Radius(U256::MAX - U256::from(1u64))),
        });
        let expected = hex!(
            "0001000000000000000c000000feffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
        );
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn pong_vector() {
        let msg = Message::Pong(Pong {
            enr_seq: 1,
            custom_payload: radius_payload(Radius(U256::MAX - U256::from(1u64))),
        });
        let expected = hex!(
            "0101000000000000000c000000feffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff"
        );
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn findnodes_vector() {
        let msg = Message::FindNodes(FindNodes {
            distances: vec![256, 255],
        });
        let expected = hex!("02040000000001ff00");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn nodes_empty_vector() {
        let msg = Message::Nodes(Nodes {
            total: 1,
            enrs: vec![],
        });
        let expected = hex!("030105000000");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn findcontent_vector() {
        let msg = Message::FindContent(FindContent {
            content_key: b"portal".to_vec(),
        });
        let expected = hex!("0404000000706f7274616c");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn content_connection_id_vector() {
        let msg = Message::Content(Content::ConnectionId(0x0102));
        let expected = hex!("05000102");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn content_payload_vector() {
        let msg = Message::Content(Content::Payload(
            hex!("7468652063616b652069732061206c6965").to_vec(),
        ));
        let expected = hex!("05017468652063616b652069732061206c6965");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn offer_vector() {
        let msg = Message::Offer(Offer {
            content_keys: vec![hex!("010203").to_vec()],
        });
        let expected = hex!("060400000004000000010203");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn accept_vector() {
        // Bits 1 and 2 of eight accepted.
        let mut keys = BitList::with_len(8);
        keys.set(1, true);
        keys.set(2, true);
        let msg = Message::Accept(Accept {
            connection_id: 0x0102,
            content_keys: keys,
        });
        let expected = hex!("070102060000000601");
        assert_eq!(msg.encode(), expected);
        assert_eq!(Message::decode(&expected).unwrap(), msg);
    }

    #[test]
    fn content_enrs_roundtrip() {
        let msg = Message::Content(Content::Enrs(vec![
            vec![0xAA; 40],
            vec![],
            vec![0xBB; 7],
        ]));
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn every_variant_roundtrips() {
        let mut accepted = BitList::with_len(3);
        accepted.set(0, true);
        let messages = vec![
            Message::Ping(Ping {
                enr_seq: 42,
                custom_payload: radius_payload(Radius(U256::from(7u64))),
            }),
            Message::Pong(Pong {
                enr_seq: 43,
                custom_payload: vec![],
            }),
            Message::FindNodes(FindNodes { distances: vec![] }),
            Message::FindNodes(FindNodes {
                distances: vec![0, 1, 255, 256],
            }),
            Message::Nodes(Nodes {
                total: 2,
                enrs: vec![vec![1, 2, 3], vec![4]],
            }),
            Message::FindContent(FindContent {
                content_key: vec![0x00; 33],
            }),
            Message::Content(Content::ConnectionId(0)),
            Message::Content(Content::Payload(vec![0xCC; 900])),
            Message::Content(Content::Enrs(vec![])),
            Message::Offer(Offer {
                content_keys: vec![vec![0x01], vec![0x02; 34]],
            }),
            Message::Accept(Accept {
                connection_id: 0xFFFF,
                content_keys: accepted,
            }),
        ];
        for msg in messages {
            let bytes = msg.encode();
            assert_eq!(Message::decode(&bytes).unwrap(), msg, "{}", msg.kind());
        }
    }

    #[test]
    fn unknown_selector_rejected() {
        assert_eq!(
            Message::decode(&[0x09, 0x00]),
            Err(WireError::UnknownSelector(0x09))
        );
        assert_eq!(Message::decode(&[]), Err(WireError::Empty));
    }

    #[test]
    fn unknown_union_tag_rejected() {
        assert_eq!(
            Message::decode(&[0x05, 0x03, 0x00]),
            Err(WireError::UnknownUnion(3))
        );
    }

    #[test]
    fn bad_offsets_rejected() {
        // PING with offset pointing past the body.
        let mut bytes = hex!("0001000000000000000c000000").to_vec();
        bytes[9] = 0xFF;
        assert!(Message::decode(&bytes).is_err());
        // FINDCONTENT with a non-canonical offset.
        let bytes = hex!("0405000000aa");
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::BadOffset { .. })
        ));
    }

    #[test]
    fn truncated_messages_rejected() {
        let full = Message::Ping(Ping {
            enr_seq: 1,
            custom_payload: radius_payload(Radius::MAX),
        })
        .encode();
        for cut in 1..12 {
            assert!(Message::decode(&full[..cut]).is_err());
        }
    }

    #[test]
    fn offer_over_limit_rejected() {
        let msg = Message::Offer(Offer {
            content_keys: vec![vec![0x01]; MAX_KEYS_PER_OFFER + 1],
        });
        let bytes = msg.encode();
        assert!(matches!(
            Message::decode(&bytes),
            Err(WireError::OverLimit { .. })
        ));
    }

    #[test]
    fn bitlist_lengths_roundtrip() {
        for len in [0usize, 1, 7, 8, 9, 63, 64] {
            let mut bl = BitList::with_len(len);
            if len > 0 {
                bl.set(len - 1, true);
                bl.set(len / 2, true);
            }
            let bytes = bl.encode();
            let decoded = BitList::decode(&bytes, 64).unwrap();
            assert_eq!(decoded, bl, "len {len}");
        }
    }

    #[test]
    fn bitlist_without_sentinel_rejected() {
        assert!(BitList::decode(&[], 64).is_err());
        assert!(BitList::decode(&[0x06, 0x00], 64).is_err());
    }

    #[test]
    fn inline_fit_respects_ceiling() {
        assert!(content_fits_inline(MAX_DISCOVERY_PACKET - 2));
        assert!(!content_fits_inline(MAX_DISCOVERY_PACKET - 1));
    }

    #[test]
    fn radius_payload_roundtrip() {
        let r = Radius(U256::from(123456789u64));
        assert_eq!(parse_radius_payload(&radius_payload(r)), Some(r));
        assert_eq!(parse_radius_payload(&[0u8; 31]), None);
    }
}
