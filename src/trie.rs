//! # Merkle-Patricia Trie Operations
//!
//! Two capabilities the verifiers need, nothing more:
//!
//! - [`verify_proof`]: walk a proof-node chain from a claimed root to a leaf
//!   and return the proven value (or proven absence)
//! - [`ordered_root`]: the trie root of an index-keyed list, as used by the
//!   `transactionsRoot` and `receiptsRoot` header fields
//!
//! Nodes are RLP lists hashed with keccak-256; children shorter than 32
//! bytes are embedded inline, everything else is referenced by hash. Paths
//! use hex-prefix encoding with the leaf and odd-length flags.

use std::collections::HashMap;

use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Encodable, Header};

use crate::error::ValidationError;

/// Nibble expansion of a byte key.
fn nibbles(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 2);
    for b in key {
        out.push(b >> 4);
        out.push(b & 0x0F);
    }
    out
}

/// Decode a hex-prefix path: returns (nibbles, is_leaf).
fn decode_path(encoded: &[u8]) -> Result<(Vec<u8>, bool), ValidationError> {
    let Some(&first) = encoded.first() else {
        return Err(ValidationError::Trie("empty path".into()));
    };
    let flag = first >> 4;
    let is_leaf = flag & 0x2 != 0;
    let is_odd = flag & 0x1 != 0;
    if flag > 3 {
        return Err(ValidationError::Trie("bad path prefix".into()));
    }
    let mut path = Vec::new();
    if is_odd {
        path.push(first & 0x0F);
    }
    for b in &encoded[1..] {
        path.push(b >> 4);
        path.push(b & 0x0F);
    }
    Ok((path, is_leaf))
}

/// Hex-prefix encode a nibble path.
fn encode_path(path: &[u8], is_leaf: bool) -> Vec<u8> {
    let mut flag: u8 = if is_leaf { 0x2 } else { 0x0 };
    let odd = path.len() % 2 == 1;
    if odd {
        flag |= 0x1;
    }
    let mut out = Vec::with_capacity(path.len() / 2 + 1);
    if odd {
        out.push((flag << 4) | path[0]);
        for pair in path[1..].chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    } else {
        out.push(flag << 4);
        for pair in path.chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    }
    out
}

/// One decoded trie node: the raw RLP items it contains.
struct Node<'a> {
    items: Vec<&'a [u8]>,
}

fn split_item<'a>(buf: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), ValidationError> {
    let mut probe = buf;
    let header = Header::decode(&mut probe)
        .map_err(|e| ValidationError::Trie(format!("rlp: {e}")))?;
    let consumed = buf.len() - probe.len();
    let total = consumed + header.payload_length;
    if total > buf.len() {
        return Err(ValidationError::Trie("truncated node".into()));
    }
    Ok((&buf[..total], &buf[total..]))
}

/// Payload of a byte-string item (strips the RLP header).
fn string_payload(item: &[u8]) -> Result<&[u8], ValidationError> {
    let mut probe = item;
    let header = Header::decode(&mut probe)
        .map_err(|e| ValidationError::Trie(format!("rlp: {e}")))?;
    if header.list {
        return Err(ValidationError::Trie("expected string".into()));
    }
    Ok(&probe[..header.payload_length])
}

impl<'a> Node<'a> {
    fn decode(bytes: &'a [u8]) -> Result<Self, ValidationError> {
        let mut probe = bytes;
        let header = Header::decode(&mut probe)
            .map_err(|e| ValidationError::Trie(format!("rlp: {e}")))?;
        if !header.list {
            return Err(ValidationError::Trie("node is not a list".into()));
        }
        let mut payload = &probe[..header.payload_length];
        let mut items = Vec::new();
        while !payload.is_empty() {
            let (item, rest) = split_item(payload)?;
            items.push(item);
            payload = rest;
        }
        if items.len() != 2 && items.len() != 17 {
            return Err(ValidationError::Trie(format!(
                "node has {} items",
                items.len()
            )));
        }
        Ok(Self { items })
    }
}

/// Reference to a child: either a 32-byte hash or an embedded node.
enum ChildRef<'a> {
    Empty,
    Hash(B256),
    Inline(&'a [u8]),
}

fn child_ref<'a>(item: &'a [u8]) -> Result<ChildRef<'a>, ValidationError> {
    // A list item is an embedded node; a string item is empty or a hash.
    let mut probe = item;
    let header = Header::decode(&mut probe)
        .map_err(|e| ValidationError::Trie(format!("rlp: {e}")))?;
    if header.list {
        return Ok(ChildRef::Inline(item));
    }
    let payload = &probe[..header.payload_length];
    match payload.len() {
        0 => Ok(ChildRef::Empty),
        32 => Ok(ChildRef::Hash(B256::from_slice(payload))),
        _ => Err(ValidationError::Trie("bad child reference".into())),
    }
}

/// Verify a Merkle-Patricia proof chain.
///
/// `proof` is the list of RLP-encoded nodes on the path from `root` to the
/// key. Returns the proven value, or `None` for a valid exclusion proof.
pub fn verify_proof(
    root: &B256,
    key: &[u8],
    proof: &[Vec<u8>],
) -> Result<Option<Vec<u8>>, ValidationError> {
    let mut by_hash: HashMap<B256, &[u8]> = HashMap::with_capacity(proof.len());
    for node in proof {
        by_hash.insert(keccak256(node), node.as_slice());
    }

    let path = nibbles(key);
    let mut cursor: usize = 0;
    let mut current: &[u8] = by_hash
        .get(root)
        .copied()
        .ok_or(ValidationError::InvalidProof)?;

    loop {
        let node = Node::decode(current)?;
        if node.items.len() == 17 {
            if cursor == path.len() {
                let value = string_payload(node.items[16])?;
                return Ok(if value.is_empty() {
                    None
                } else {
                    Some(value.to_vec())
                });
            }
            let nibble = path[cursor] as usize;
            cursor += 1;
            match child_ref(node.items[nibble])? {
                ChildRef::Empty => return Ok(None),
                ChildRef::Hash(hash) => {
                    current = by_hash
                        .get(&hash)
                        .copied()
                        .ok_or(ValidationError::InvalidProof)?;
                }
                ChildRef::Inline(embedded) => current = embedded,
            }
        } else {
            let (node_path, is_leaf) = decode_path(string_payload(node.items[0])?)?;
            let remaining = &path[cursor..];
            if is_leaf {
                return Ok(if remaining == node_path.as_slice() {
                    Some(string_payload(node.items[1])?.to_vec())
                } else {
                    None
                });
            }
            // Extension node.
            if !remaining.starts_with(&node_path) {
                return Ok(None);
            }
            cursor += node_path.len();
            match child_ref(node.items[1])? {
                ChildRef::Empty => {
                    return Err(ValidationError::Trie("extension into empty".into()))
                }
                ChildRef::Hash(hash) => {
                    current = by_hash
                        .get(&hash)
                        .copied()
                        .ok_or(ValidationError::InvalidProof)?;
                }
                ChildRef::Inline(embedded) => current = embedded,
            }
        }
    }
}

// ============================================================================
// Trie construction for ordered lists
// ============================================================================

enum BuildNode {
    Empty,
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Box<BuildNode>,
    },
    Branch {
        children: Box<[BuildNode; 16]>,
        value: Option<Vec<u8>>,
    },
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Wrap `node` in an extension carrying `prefix`, unless the prefix is
/// empty.
fn under_prefix(prefix: &[u8], node: BuildNode) -> BuildNode {
    if prefix.is_empty() {
        node
    } else {
        BuildNode::Extension {
            path: prefix.to_vec(),
            child: Box::new(node),
        }
    }
}

impl BuildNode {
    fn empty_children() -> Box<[BuildNode; 16]> {
        Box::new(std::array::from_fn(|_| BuildNode::Empty))
    }

    fn insert(self, path: &[u8], value: Vec<u8>) -> BuildNode {
        match self {
            BuildNode::Empty => BuildNode::Leaf {
                path: path.to_vec(),
                value,
            },
            BuildNode::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path == path {
                    return BuildNode::Leaf {
                        path: leaf_path,
                        value,
                    };
                }
                // Split into a branch at the divergence point.
                let common = common_prefix(&leaf_path, path);
                let branch = BuildNode::Branch {
                    children: Self::empty_children(),
                    value: None,
                };
                let branch = branch.insert(&leaf_path[common..], leaf_value);
                let branch = branch.insert(&path[common..], value);
                under_prefix(&path[..common], branch)
            }
            BuildNode::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix(&ext_path, path);
                if common == ext_path.len() {
                    let child = child.insert(&path[common..], value);
                    return BuildNode::Extension {
                        path: ext_path,
                        child: Box::new(child),
                    };
                }
                // Split the extension at the divergence point.
                let sub = if ext_path.len() == common + 1 {
                    *child
                } else {
                    BuildNode::Extension {
                        path: ext_path[common + 1..].to_vec(),
                        child,
                    }
                };
                let mut children = Self::empty_children();
                children[ext_path[common] as usize] = sub;
                let branch = BuildNode::Branch {
                    children,
                    value: None,
                };
                let branch = branch.insert(&path[common..], value);
                under_prefix(&path[..common], branch)
            }
            BuildNode::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return BuildNode::Branch {
                        children,
                        value: Some(value),
                    };
                }
                let idx = path[0] as usize;
                let child = std::mem::replace(&mut children[idx], BuildNode::Empty);
                children[idx] = child.insert(&path[1..], value);
                BuildNode::Branch {
                    children,
                    value: branch_value,
                }
            }
        }
    }

    /// RLP encoding of this node as a child reference: inline when shorter
    /// than 32 bytes, keccak reference otherwise.
    fn reference(&self, out: &mut Vec<u8>) {
        let encoded = self.encode();
        if encoded.len() < 32 {
            out.extend_from_slice(&encoded);
        } else {
            keccak256(&encoded).as_slice().encode(out);
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            BuildNode::Empty => {
                let mut out = Vec::new();
                "".as_bytes().encode(&mut out);
                out
            }
            BuildNode::Leaf { path, value } => {
                let mut payload = Vec::new();
                encode_path(path, true).as_slice().encode(&mut payload);
                value.as_slice().encode(&mut payload);
                wrap_list(payload)
            }
            BuildNode::Extension { path, child } => {
                let mut payload = Vec::new();
                encode_path(path, false).as_slice().encode(&mut payload);
                child.reference(&mut payload);
                wrap_list(payload)
            }
            BuildNode::Branch { children, value } => {
                let mut payload = Vec::new();
                for child in children.iter() {
                    match child {
                        BuildNode::Empty => "".as_bytes().encode(&mut payload),
                        other => other.reference(&mut payload),
                    }
                }
                match value {
                    Some(v) => v.as_slice().encode(&mut payload),
                    None => "".as_bytes().encode(&mut payload),
                }
                wrap_list(payload)
            }
        }
    }
}

fn wrap_list(payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

/// Root of a trie keyed by `rlp(index)`, as Ethereum computes the
/// transactions and receipts roots.
pub fn ordered_root(items: &[Vec<u8>]) -> B256 {
    /// Root of the empty trie: `keccak256(rlp(""))`.
    const EMPTY_ROOT: [u8; 32] = [
        0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0,
        0xf8, 0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5,
        0xe3, 0x63, 0xb4, 0x21,
    ];
    if items.is_empty() {
        return B256::from(EMPTY_ROOT);
    }
    let mut root = BuildNode::Empty;
    for (i, item) in items.iter().enumerate() {
        let mut key = Vec::new();
        (i as u64).encode(&mut key);
        root = root.insert(&nibbles(&key), item.clone());
    }
    keccak256(root.encode())
}
