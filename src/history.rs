//! # History Sub-Protocol
//!
//! Execution-chain history as content-addressed artifacts: headers, bodies,
//! receipts, epoch accumulators, and pre-merge headers with accumulator
//! inclusion proofs.
//!
//! ## Content Keys
//!
//! | Selector | Key | Body |
//! |----------|-----|------|
//! | 0x00 | BlockHeader | 32-byte block hash |
//! | 0x01 | BlockBody | 32-byte block hash |
//! | 0x02 | Receipts | 32-byte block hash |
//! | 0x03 | EpochAccumulator | 32-byte epoch root |
//! | 0x04 | BlockHeaderWithProof | 32-byte block hash |
//!
//! ## Verification
//!
//! Every artifact re-derives its binding from the key: a header must hash
//! to the key's block hash, a body must reproduce the stored header's
//! transaction and ommer commitments, receipts must reproduce its receipts
//! root, an epoch accumulator must hash-tree-root to the key's epoch root,
//! and a pre-merge header proof must chain to the master accumulator's
//! epoch root at `gindex = 2 * EPOCH_SIZE * 2 + 2 * (number mod EPOCH_SIZE)`.

use std::num::NonZeroUsize;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_rlp::{Decodable, Header as RlpHeader};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::content::{RawContentKey, SubProtocolId};
use crate::error::ValidationError;
use crate::events::OverlayObserver;
use crate::protocols::Verifier;
use crate::trie::ordered_root;

/// Header records per epoch accumulator.
pub const EPOCH_SIZE: u64 = 8192;

/// Proof depth for a block-hash leaf: one level inside the record, thirteen
/// levels of the 8192-capacity record tree, one level of length mix-in.
pub const ACCUMULATOR_PROOF_DEPTH: usize = 15;

const SELECTOR_BLOCK_HEADER: u8 = 0x00;
const SELECTOR_BLOCK_BODY: u8 = 0x01;
const SELECTOR_RECEIPTS: u8 = 0x02;
const SELECTOR_EPOCH_ACCUMULATOR: u8 = 0x03;
const SELECTOR_HEADER_WITH_PROOF: u8 = 0x04;

/// Headers kept for body/receipt verification.
const HEADER_CACHE_SIZE: usize = 8192;

/// Typed history content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryContentKey {
    BlockHeader(B256),
    BlockBody(B256),
    Receipts(B256),
    EpochAccumulator(B256),
    BlockHeaderWithProof(B256),
}

impl HistoryContentKey {
    pub fn encode(&self) -> RawContentKey {
        let (selector, hash) = match self {
            HistoryContentKey::BlockHeader(h) => (SELECTOR_BLOCK_HEADER, h),
            HistoryContentKey::BlockBody(h) => (SELECTOR_BLOCK_BODY, h),
            HistoryContentKey::Receipts(h) => (SELECTOR_RECEIPTS, h),
            HistoryContentKey::EpochAccumulator(h) => (SELECTOR_EPOCH_ACCUMULATOR, h),
            HistoryContentKey::BlockHeaderWithProof(h) => (SELECTOR_HEADER_WITH_PROOF, h),
        };
        let mut out = Vec::with_capacity(33);
        out.push(selector);
        out.extend_from_slice(hash.as_slice());
        RawContentKey(out)
    }

    pub fn decode(raw: &RawContentKey) -> Result<Self, ValidationError> {
        let selector = raw.selector().ok_or(ValidationError::MalformedKey)?;
        let body: [u8; 32] = raw
            .body()
            .try_into()
            .map_err(|_| ValidationError::MalformedKey)?;
        let hash = B256::from(body);
        match selector {
            SELECTOR_BLOCK_HEADER => Ok(HistoryContentKey::BlockHeader(hash)),
            SELECTOR_BLOCK_BODY => Ok(HistoryContentKey::BlockBody(hash)),
            SELECTOR_RECEIPTS => Ok(HistoryContentKey::Receipts(hash)),
            SELECTOR_EPOCH_ACCUMULATOR => Ok(HistoryContentKey::EpochAccumulator(hash)),
            SELECTOR_HEADER_WITH_PROOF => Ok(HistoryContentKey::BlockHeaderWithProof(hash)),
            _ => Err(ValidationError::MalformedKey),
        }
    }
}

// ============================================================================
// Block structures
// ============================================================================

/// Decoded execution-chain block header. Post-London and post-merge fields
/// are tolerated; only the commitments the verifiers need are retained as
/// typed fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub ommers_hash: B256,
    pub beneficiary: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Vec<u8>,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: [u8; 8],
    pub base_fee_per_gas: Option<U256>,
}

impl BlockHeader {
    /// Decode from the canonical RLP encoding.
    pub fn decode_rlp(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mut outer = bytes;
        let header = RlpHeader::decode(&mut outer).map_err(decode_err)?;
        if !header.list || header.payload_length != outer.len() {
            return Err(ValidationError::Decode("header is not a plain list".into()));
        }
        let buf = &mut { outer };
        let decoded = Self {
            parent_hash: B256::decode(buf).map_err(decode_err)?,
            ommers_hash: B256::decode(buf).map_err(decode_err)?,
            beneficiary: Address::decode(buf).map_err(decode_err)?,
            state_root: B256::decode(buf).map_err(decode_err)?,
            transactions_root: B256::decode(buf).map_err(decode_err)?,
            receipts_root: B256::decode(buf).map_err(decode_err)?,
            logs_bloom: RlpHeader::decode_bytes(buf, false).map_err(decode_err)?.to_vec(),
            difficulty: U256::decode(buf).map_err(decode_err)?,
            number: u64::decode(buf).map_err(decode_err)?,
            gas_limit: u64::decode(buf).map_err(decode_err)?,
            gas_used: u64::decode(buf).map_err(decode_err)?,
            timestamp: u64::decode(buf).map_err(decode_err)?,
            extra_data: RlpHeader::decode_bytes(buf, false).map_err(decode_err)?.to_vec(),
            mix_hash: B256::decode(buf).map_err(decode_err)?,
            nonce: <[u8; 8]>::decode(buf).map_err(decode_err)?,
            base_fee_per_gas: if buf.is_empty() {
                None
            } else {
                Some(U256::decode(buf).map_err(decode_err)?)
            },
        };
        if decoded.logs_bloom.len() != 256 {
            return Err(ValidationError::Decode("logs bloom must be 256 bytes".into()));
        }
        // Post-merge extension fields (withdrawals root and later) pass
        // through undecoded; they are part of the hashed encoding either way.
        Ok(decoded)
    }
}

fn decode_err(e: alloy_rlp::Error) -> ValidationError {
    ValidationError::Decode(e.to_string())
}

/// Split the raw items of an RLP list.
fn list_items(bytes: &[u8]) -> Result<Vec<&[u8]>, ValidationError> {
    let mut outer = bytes;
    let header = RlpHeader::decode(&mut outer).map_err(decode_err)?;
    if !header.list || header.payload_length != outer.len() {
        return Err(ValidationError::Decode("expected a plain list".into()));
    }
    let mut items = Vec::new();
    let mut payload = outer;
    while !payload.is_empty() {
        let mut probe = payload;
        let h = RlpHeader::decode(&mut probe).map_err(decode_err)?;
        let consumed = payload.len() - probe.len();
        let total = consumed + h.payload_length;
        if total > payload.len() {
            return Err(ValidationError::Decode("truncated list item".into()));
        }
        items.push(&payload[..total]);
        payload = &payload[total..];
    }
    Ok(items)
}

/// Trie value for a transaction or receipt list item: legacy items (RLP
/// lists) enter the trie as-is, typed envelopes (RLP strings) enter as
/// their payload.
fn trie_value(item: &[u8]) -> Result<Vec<u8>, ValidationError> {
    let mut probe = item;
    let header = RlpHeader::decode(&mut probe).map_err(decode_err)?;
    if header.list {
        Ok(item.to_vec())
    } else {
        Ok(probe[..header.payload_length].to_vec())
    }
}

/// Decoded block body: raw transaction and ommer regions.
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    /// The raw ommers list item, as committed by `ommersHash`.
    pub ommers_rlp: Vec<u8>,
}

impl BlockBody {
    pub fn decode_rlp(bytes: &[u8]) -> Result<Self, ValidationError> {
        let parts = list_items(bytes)?;
        if parts.len() < 2 || parts.len() > 3 {
            return Err(ValidationError::Decode(format!(
                "body has {} parts",
                parts.len()
            )));
        }
        let transactions = list_items(parts[0])?
            .into_iter()
            .map(trie_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            transactions,
            ommers_rlp: parts[1].to_vec(),
        })
    }
}

// ============================================================================
// Epoch accumulator
// ============================================================================

/// One accumulator entry: a block hash and the running total difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRecord {
    pub block_hash: B256,
    pub total_difficulty: U256,
}

impl HeaderRecord {
    /// SSZ-encoded size: two 32-byte leaves.
    pub const SIZE: usize = 64;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.block_hash.as_slice());
        out.extend_from_slice(&self.total_difficulty.to_le_bytes::<32>());
    }

    /// Container root: `sha256(block_hash || total_difficulty)`.
    fn tree_root(&self) -> [u8; 32] {
        sha256_pair(&self.block_hash.0, &self.total_difficulty.to_le_bytes::<32>())
    }
}

/// An ordered list of up to [`EPOCH_SIZE`] header records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EpochAccumulator {
    pub records: Vec<HeaderRecord>,
}

impl EpochAccumulator {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.records.len() * HeaderRecord::SIZE);
        for record in &self.records {
            record.encode_into(&mut out);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        if bytes.len() % HeaderRecord::SIZE != 0 {
            return Err(ValidationError::Decode(
                "accumulator length not record-aligned".into(),
            ));
        }
        let count = bytes.len() / HeaderRecord::SIZE;
        if count as u64 > EPOCH_SIZE {
            return Err(ValidationError::Decode("accumulator overfull".into()));
        }
        let mut records = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(HeaderRecord::SIZE) {
            let mut td = [0u8; 32];
            td.copy_from_slice(&chunk[32..]);
            records.push(HeaderRecord {
                block_hash: B256::from_slice(&chunk[..32]),
                total_difficulty: U256::from_le_bytes(td),
            });
        }
        Ok(Self { records })
    }

    /// SSZ hash tree root: record roots merkleized over an 8192-leaf tree,
    /// with the list length mixed in.
    pub fn tree_hash_root(&self) -> B256 {
        let mut layer: Vec<[u8; 32]> =
            self.records.iter().map(|r| r.tree_root()).collect();
        let zeros = zero_hashes(14);
        let mut depth = 0usize;
        let mut width = EPOCH_SIZE as usize;
        while width > 1 {
            if layer.len() % 2 == 1 {
                layer.push(zeros[depth]);
            }
            layer = layer
                .chunks(2)
                .map(|pair| sha256_pair(&pair[0], &pair[1]))
                .collect();
            depth += 1;
            width /= 2;
        }
        let root = layer.first().copied().unwrap_or(zeros[13]);
        let mut len_leaf = [0u8; 32];
        len_leaf[..8].copy_from_slice(&(self.records.len() as u64).to_le_bytes());
        B256::from(sha256_pair(&root, &len_leaf))
    }
}

fn sha256_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// `zeros[i]` is the root of an empty subtree of height `i`.
fn zero_hashes(levels: usize) -> Vec<[u8; 32]> {
    let mut out = vec![[0u8; 32]];
    for i in 1..levels {
        let prev = out[i - 1];
        out.push(sha256_pair(&prev, &prev));
    }
    out
}

/// Index of a block's hash leaf within the record layer.
pub fn block_number_to_leaf_index(block_number: u64) -> u64 {
    2 * (block_number % EPOCH_SIZE)
}

/// Generalized index of a block's hash leaf in the accumulator tree.
pub fn block_number_to_gindex(block_number: u64) -> u64 {
    EPOCH_SIZE * 2 * 2 + block_number_to_leaf_index(block_number)
}

/// Verify a branch from a block-hash leaf to an epoch root.
pub fn verify_accumulator_branch(
    block_hash: &B256,
    proof: &[B256],
    epoch_root: &B256,
    gindex: u64,
) -> bool {
    if proof.len() != ACCUMULATOR_PROOF_DEPTH {
        return false;
    }
    let mut node = block_hash.0;
    let mut g = gindex;
    for sibling in proof {
        node = if g & 1 == 1 {
            sha256_pair(&sibling.0, &node)
        } else {
            sha256_pair(&node, &sibling.0)
        };
        g >>= 1;
    }
    g == 1 && node == epoch_root.0
}

/// The master accumulator: ordered roots of all completed pre-merge epochs.
#[derive(Debug, Clone, Default)]
pub struct MasterAccumulator {
    historical_epochs: Vec<B256>,
}

impl MasterAccumulator {
    pub fn new(historical_epochs: Vec<B256>) -> Self {
        Self { historical_epochs }
    }

    pub fn epoch_count(&self) -> usize {
        self.historical_epochs.len()
    }

    pub fn epoch_root_by_index(&self, index: usize) -> Result<B256, ValidationError> {
        self.historical_epochs
            .get(index)
            .copied()
            .ok_or(ValidationError::EpochOutOfRange(index as u64))
    }

    pub fn epoch_root_by_blocknumber(&self, block_number: u64) -> Result<B256, ValidationError> {
        self.epoch_root_by_index((block_number / EPOCH_SIZE) as usize)
    }
}

// ============================================================================
// Header with proof
// ============================================================================

/// A pre-merge header bundled with its accumulator inclusion branch.
///
/// Encoding: offset (4 bytes) to the variable header region, then the fixed
/// 15-element proof, then the RLP header bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderWithProof {
    pub header_rlp: Vec<u8>,
    pub proof: Vec<B256>,
}

impl HeaderWithProof {
    const FIXED: usize = 4 + ACCUMULATOR_PROOF_DEPTH * 32;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED + self.header_rlp.len());
        out.extend_from_slice(&(Self::FIXED as u32).to_le_bytes());
        for hash in &self.proof {
            out.extend_from_slice(hash.as_slice());
        }
        out.extend_from_slice(&self.header_rlp);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ValidationError> {
        if bytes.len() < Self::FIXED {
            return Err(ValidationError::Decode("header-with-proof too short".into()));
        }
        let offset = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        if offset != Self::FIXED || offset > bytes.len() {
            return Err(ValidationError::Decode("bad header offset".into()));
        }
        let mut proof = Vec::with_capacity(ACCUMULATOR_PROOF_DEPTH);
        for i in 0..ACCUMULATOR_PROOF_DEPTH {
            let start = 4 + i * 32;
            proof.push(B256::from_slice(&bytes[start..start + 32]));
        }
        Ok(Self {
            header_rlp: bytes[offset..].to_vec(),
            proof,
        })
    }
}

// ============================================================================
// Header source and verifier
// ============================================================================

/// Access to locally verified headers, needed to validate bodies and
/// receipts against their header commitments.
pub trait HeaderSource: Send + Sync + 'static {
    fn header_rlp(&self, block_hash: &B256) -> Option<Vec<u8>>;
}

/// Bounded cache of verified headers, fed by the overlay event surface.
pub struct HeaderCache {
    inner: Mutex<LruCache<B256, Vec<u8>>>,
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(HEADER_CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    pub fn insert(&self, block_hash: B256, header_rlp: Vec<u8>) {
        self.inner.lock().put(block_hash, header_rlp);
    }
}

impl HeaderSource for HeaderCache {
    fn header_rlp(&self, block_hash: &B256) -> Option<Vec<u8>> {
        self.inner.lock().get(block_hash).cloned()
    }
}

impl OverlayObserver for HeaderCache {
    fn on_content_added(
        &self,
        protocol: SubProtocolId,
        key: &RawContentKey,
        value: &[u8],
    ) {
        if protocol != SubProtocolId::History {
            return;
        }
        match HistoryContentKey::decode(key) {
            Ok(HistoryContentKey::BlockHeader(hash)) => {
                self.insert(hash, value.to_vec());
            }
            Ok(HistoryContentKey::BlockHeaderWithProof(hash)) => {
                if let Ok(hwp) = HeaderWithProof::decode(value) {
                    self.insert(hash, hwp.header_rlp);
                }
            }
            _ => {}
        }
    }
}

/// Verifier set for the history namespace.
pub struct HistoryVerifier {
    accumulator: Arc<MasterAccumulator>,
    headers: Arc<dyn HeaderSource>,
}

impl HistoryVerifier {
    pub fn new(accumulator: Arc<MasterAccumulator>, headers: Arc<dyn HeaderSource>) -> Self {
        Self {
            accumulator,
            headers,
        }
    }

    fn stored_header(&self, block_hash: &B256) -> Result<BlockHeader, ValidationError> {
        let rlp = self
            .headers
            .header_rlp(block_hash)
            .ok_or(ValidationError::HeaderUnavailable)?;
        BlockHeader::decode_rlp(&rlp)
    }

    fn verify_header(&self, hash: &B256, payload: &[u8]) -> Result<(), ValidationError> {
        BlockHeader::decode_rlp(payload)?;
        let computed = keccak256(payload);
        if computed != *hash {
            return Err(ValidationError::HashMismatch {
                expected: hex::encode(hash),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    fn verify_body(&self, hash: &B256, payload: &[u8]) -> Result<(), ValidationError> {
        let body = BlockBody::decode_rlp(payload)?;
        let header = self.stored_header(hash)?;
        let tx_root = ordered_root(&body.transactions);
        if tx_root != header.transactions_root {
            return Err(ValidationError::RootMismatch {
                expected: hex::encode(header.transactions_root),
                computed: hex::encode(tx_root),
            });
        }
        let ommers_hash = keccak256(&body.ommers_rlp);
        if ommers_hash != header.ommers_hash {
            return Err(ValidationError::HashMismatch {
                expected: hex::encode(header.ommers_hash),
                computed: hex::encode(ommers_hash),
            });
        }
        Ok(())
    }

    fn verify_receipts(&self, hash: &B256, payload: &[u8]) -> Result<(), ValidationError> {
        let items = list_items(payload)?
            .into_iter()
            .map(trie_value)
            .collect::<Result<Vec<_>, _>>()?;
        let header = self.stored_header(hash)?;
        let root = ordered_root(&items);
        if root != header.receipts_root {
            return Err(ValidationError::RootMismatch {
                expected: hex::encode(header.receipts_root),
                computed: hex::encode(root),
            });
        }
        Ok(())
    }

    fn verify_epoch_accumulator(
        &self,
        epoch_root: &B256,
        payload: &[u8],
    ) -> Result<(), ValidationError> {
        let accumulator = EpochAccumulator::decode(payload)?;
        let computed = accumulator.tree_hash_root();
        if computed != *epoch_root {
            return Err(ValidationError::RootMismatch {
                expected: hex::encode(epoch_root),
                computed: hex::encode(computed),
            });
        }
        Ok(())
    }

    fn verify_header_with_proof(
        &self,
        hash: &B256,
        payload: &[u8],
    ) -> Result<(), ValidationError> {
        let hwp = HeaderWithProof::decode(payload)?;
        self.verify_header(hash, &hwp.header_rlp)?;
        let header = BlockHeader::decode_rlp(&hwp.header_rlp)?;
        let epoch_root = self.accumulator.epoch_root_by_blocknumber(header.number)?;
        let gindex = block_number_to_gindex(header.number);
        if !verify_accumulator_branch(hash, &hwp.proof, &epoch_root, gindex) {
            return Err(ValidationError::InvalidProof);
        }
        Ok(())
    }
}

impl Verifier for HistoryVerifier {
    fn verify(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
        let key = HistoryContentKey::decode(&RawContentKey(key.to_vec()))?;
        trace!(key = ?key, bytes = payload.len(), "verifying history content");
        match &key {
            HistoryContentKey::BlockHeader(hash) => self.verify_header(hash, payload)?,
            HistoryContentKey::BlockBody(hash) => self.verify_body(hash, payload)?,
            HistoryContentKey::Receipts(hash) => self.verify_receipts(hash, payload)?,
            HistoryContentKey::EpochAccumulator(root) => {
                self.verify_epoch_accumulator(root, payload)?
            }
            HistoryContentKey::BlockHeaderWithProof(hash) => {
                self.verify_header_with_proof(hash, payload)?
            }
        }
        Ok(payload.to_vec())
    }
}
