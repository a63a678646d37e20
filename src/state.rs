//! # State Sub-Protocol
//!
//! Account tries, contract storage, and bytecode as content-addressed
//! artifacts, each carrying the Merkle-Patricia proof chain that binds it
//! to a state root.
//!
//! ## Content Keys
//!
//! | Selector | Key | Body |
//! |----------|-----|------|
//! | 0x00 | AccountTrieProof | address (20) ++ state root (32) |
//! | 0x01 | ContractStorageProof | address (20) ++ slot (32) ++ state root (32) |
//! | 0x02 | ContractBytecode | address (20) ++ code hash (32) |
//!
//! ## Payloads
//!
//! Proof payloads are RLP lists of proof-node byte strings; the storage
//! proof carries two such lists (account proof, then storage proof). The
//! bytecode payload is the raw code.
//!
//! ## Root Index
//!
//! The sub-protocol keeps an index from account address to the state roots
//! the account is proven under, used only to order those roots by
//! (nonce, balance) ascending. Balances compare as 256-bit integers; no
//! precision is dropped for large balance deltas.

use std::collections::HashMap;

use alloy_primitives::{keccak256, Address, B256, U256};
use alloy_rlp::{Decodable, Header as RlpHeader};
use parking_lot::RwLock;
use tracing::trace;

use crate::content::RawContentKey;
use crate::error::ValidationError;
use crate::protocols::Verifier;
use crate::trie::verify_proof;

const SELECTOR_ACCOUNT_TRIE_PROOF: u8 = 0x00;
const SELECTOR_CONTRACT_STORAGE_PROOF: u8 = 0x01;
const SELECTOR_CONTRACT_BYTECODE: u8 = 0x02;

/// Typed state content key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateContentKey {
    AccountTrieProof {
        address: Address,
        state_root: B256,
    },
    ContractStorageProof {
        address: Address,
        slot: U256,
        state_root: B256,
    },
    ContractBytecode {
        address: Address,
        code_hash: B256,
    },
}

impl StateContentKey {
    pub fn encode(&self) -> RawContentKey {
        let mut out = Vec::with_capacity(85);
        match self {
            StateContentKey::AccountTrieProof {
                address,
                state_root,
            } => {
                out.push(SELECTOR_ACCOUNT_TRIE_PROOF);
                out.extend_from_slice(address.as_slice());
                out.extend_from_slice(state_root.as_slice());
            }
            StateContentKey::ContractStorageProof {
                address,
                slot,
                state_root,
            } => {
                out.push(SELECTOR_CONTRACT_STORAGE_PROOF);
                out.extend_from_slice(address.as_slice());
                out.extend_from_slice(&slot.to_be_bytes::<32>());
                out.extend_from_slice(state_root.as_slice());
            }
            StateContentKey::ContractBytecode { address, code_hash } => {
                out.push(SELECTOR_CONTRACT_BYTECODE);
                out.extend_from_slice(address.as_slice());
                out.extend_from_slice(code_hash.as_slice());
            }
        }
        RawContentKey(out)
    }

    pub fn decode(raw: &RawContentKey) -> Result<Self, ValidationError> {
        let selector = raw.selector().ok_or(ValidationError::MalformedKey)?;
        let body = raw.body();
        match selector {
            SELECTOR_ACCOUNT_TRIE_PROOF => {
                if body.len() != 52 {
                    return Err(ValidationError::MalformedKey);
                }
                Ok(StateContentKey::AccountTrieProof {
                    address: Address::from_slice(&body[..20]),
                    state_root: B256::from_slice(&body[20..]),
                })
            }
            SELECTOR_CONTRACT_STORAGE_PROOF => {
                if body.len() != 84 {
                    return Err(ValidationError::MalformedKey);
                }
                Ok(StateContentKey::ContractStorageProof {
                    address: Address::from_slice(&body[..20]),
                    slot: U256::from_be_slice(&body[20..52]),
                    state_root: B256::from_slice(&body[52..]),
                })
            }
            SELECTOR_CONTRACT_BYTECODE => {
                if body.len() != 52 {
                    return Err(ValidationError::MalformedKey);
                }
                Ok(StateContentKey::ContractBytecode {
                    address: Address::from_slice(&body[..20]),
                    code_hash: B256::from_slice(&body[20..]),
                })
            }
            _ => Err(ValidationError::MalformedKey),
        }
    }
}

/// RLP account record: `[nonce, balance, storage_root, code_hash]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: B256,
    pub code_hash: B256,
}

impl AccountState {
    pub fn decode_rlp(bytes: &[u8]) -> Result<Self, ValidationError> {
        let mut outer = bytes;
        let header = RlpHeader::decode(&mut outer).map_err(decode_err)?;
        if !header.list || header.payload_length != outer.len() {
            return Err(ValidationError::Decode("account is not a plain list".into()));
        }
        let buf = &mut { outer };
        let account = Self {
            nonce: u64::decode(buf).map_err(decode_err)?,
            balance: U256::decode(buf).map_err(decode_err)?,
            storage_root: B256::decode(buf).map_err(decode_err)?,
            code_hash: B256::decode(buf).map_err(decode_err)?,
        };
        if !buf.is_empty() {
            return Err(ValidationError::Decode("trailing account fields".into()));
        }
        Ok(account)
    }
}

fn decode_err(e: alloy_rlp::Error) -> ValidationError {
    ValidationError::Decode(e.to_string())
}

/// Decode an RLP list of proof-node byte strings.
fn decode_proof_nodes(mut buf: &[u8]) -> Result<(Vec<Vec<u8>>, &[u8]), ValidationError> {
    let before = buf;
    let header = RlpHeader::decode(&mut buf).map_err(decode_err)?;
    if !header.list {
        return Err(ValidationError::Decode("proof is not a list".into()));
    }
    let consumed = before.len() - buf.len();
    let total = consumed + header.payload_length;
    if total > before.len() {
        return Err(ValidationError::Decode("truncated proof list".into()));
    }
    let mut payload = &before[consumed..total];
    let mut nodes = Vec::new();
    while !payload.is_empty() {
        let node = RlpHeader::decode_bytes(&mut payload, false)
            .map_err(decode_err)?
            .to_vec();
        nodes.push(node);
    }
    Ok((nodes, &before[total..]))
}

/// Payload of an account-trie proof: one proof-node list.
pub fn encode_account_proof(nodes: &[Vec<u8>]) -> Vec<u8> {
    encode_node_list(nodes)
}

/// Payload of a contract-storage proof: account proof, then storage proof.
pub fn encode_storage_proof(account_nodes: &[Vec<u8>], storage_nodes: &[Vec<u8>]) -> Vec<u8> {
    let mut out = encode_node_list(account_nodes);
    out.extend_from_slice(&encode_node_list(storage_nodes));
    out
}

fn encode_node_list(nodes: &[Vec<u8>]) -> Vec<u8> {
    use alloy_rlp::Encodable;
    let mut payload = Vec::new();
    for node in nodes {
        node.as_slice().encode(&mut payload);
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    RlpHeader {
        list: true,
        payload_length: payload.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&payload);
    out
}

// ============================================================================
// Account → state-root index
// ============================================================================

/// Ordering key for a proven account snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SnapshotOrder {
    nonce: u64,
    balance: U256,
}

/// Index from account address to the state roots it is proven under,
/// ordered by (nonce, balance) ascending with full-width balances.
#[derive(Default)]
pub struct AccountIndex {
    inner: RwLock<HashMap<Address, Vec<(SnapshotOrder, B256)>>>,
}

impl AccountIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `address` is proven under `state_root` with the given
    /// account fields.
    pub fn record(&self, address: Address, state_root: B256, nonce: u64, balance: U256) {
        let mut inner = self.inner.write();
        let entry = inner.entry(address).or_default();
        let order = SnapshotOrder { nonce, balance };
        if entry.iter().any(|(_, root)| *root == state_root) {
            return;
        }
        let pos = entry.partition_point(|(o, _)| *o <= order);
        entry.insert(pos, (order, state_root));
    }

    /// State roots for `address`, ordered by (nonce, balance) ascending.
    pub fn roots_for(&self, address: &Address) -> Vec<B256> {
        self.inner
            .read()
            .get(address)
            .map(|entries| entries.iter().map(|(_, root)| *root).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Verifier set for the state namespace. Feeds the account index as proofs
/// verify.
#[derive(Default)]
pub struct StateVerifier {
    index: AccountIndex,
}

impl StateVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn index(&self) -> &AccountIndex {
        &self.index
    }

    fn verify_account_proof(
        &self,
        address: &Address,
        state_root: &B256,
        payload: &[u8],
    ) -> Result<AccountState, ValidationError> {
        let (nodes, rest) = decode_proof_nodes(payload)?;
        if !rest.is_empty() {
            return Err(ValidationError::Decode("trailing proof bytes".into()));
        }
        let key = keccak256(address.as_slice());
        let account_rlp = verify_proof(state_root, key.as_slice(), &nodes)?
            .ok_or(ValidationError::InvalidProof)?;
        AccountState::decode_rlp(&account_rlp)
    }

    fn verify_storage_proof(
        &self,
        address: &Address,
        slot: &U256,
        state_root: &B256,
        payload: &[u8],
    ) -> Result<(), ValidationError> {
        let (account_nodes, rest) = decode_proof_nodes(payload)?;
        let (storage_nodes, tail) = decode_proof_nodes(rest)?;
        if !tail.is_empty() {
            return Err(ValidationError::Decode("trailing proof bytes".into()));
        }
        let account_key = keccak256(address.as_slice());
        let account_rlp = verify_proof(state_root, account_key.as_slice(), &account_nodes)?
            .ok_or(ValidationError::InvalidProof)?;
        let account = AccountState::decode_rlp(&account_rlp)?;

        let slot_key = keccak256(slot.to_be_bytes::<32>());
        verify_proof(&account.storage_root, slot_key.as_slice(), &storage_nodes)?;
        Ok(())
    }
}

impl Verifier for StateVerifier {
    fn verify(&self, key: &[u8], payload: &[u8]) -> Result<Vec<u8>, ValidationError> {
        let key = StateContentKey::decode(&RawContentKey(key.to_vec()))?;
        trace!(key = ?key, bytes = payload.len(), "verifying state content");
        match &key {
            StateContentKey::AccountTrieProof {
                address,
                state_root,
            } => {
                let account = self.verify_account_proof(address, state_root, payload)?;
                self.index
                    .record(*address, *state_root, account.nonce, account.balance);
            }
            StateContentKey::ContractStorageProof {
                address,
                slot,
                state_root,
            } => {
                self.verify_storage_proof(address, slot, state_root, payload)?;
            }
            StateContentKey::ContractBytecode { code_hash, .. } => {
                let computed = keccak256(payload);
                if computed != *code_hash {
                    return Err(ValidationError::HashMismatch {
                        expected: hex::encode(code_hash),
                        computed: hex::encode(computed),
                    });
                }
            }
        }
        Ok(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::Encodable;

    fn encode_account(account: &AccountState) -> Vec<u8> {
        let mut payload = Vec::new();
        account.nonce.encode(&mut payload);
        account.balance.encode(&mut payload);
        account.storage_root.encode(&mut payload);
        account.code_hash.encode(&mut payload);
        let mut out = Vec::new();
        RlpHeader {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Single-leaf trie proving `value` under `keccak(address)`.
    fn single_leaf_proof(key_hash: &B256, value: &[u8]) -> (B256, Vec<Vec<u8>>) {
        // Leaf node: [hex_prefix(full nibbles, leaf), value].
        let mut nibble_path = Vec::new();
        for b in key_hash.as_slice() {
            nibble_path.push(b >> 4);
            nibble_path.push(b & 0x0F);
        }
        let mut encoded_path = vec![0x20u8];
        for pair in nibble_path.chunks(2) {
            encoded_path.push((pair[0] << 4) | pair[1]);
        }
        let mut payload = Vec::new();
        encoded_path.as_slice().encode(&mut payload);
        value.encode(&mut payload);
        let mut node = Vec::new();
        RlpHeader {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut node);
        node.extend_from_slice(&payload);
        let root = keccak256(&node);
        (root, vec![node])
    }

    #[test]
    fn key_encoding_roundtrip() {
        let address = Address::from([0x11; 20]);
        for key in [
            StateContentKey::AccountTrieProof {
                address,
                state_root: B256::from([0x22; 32]),
            },
            StateContentKey::ContractStorageProof {
                address,
                slot: U256::from(7u64),
                state_root: B256::from([0x33; 32]),
            },
            StateContentKey::ContractBytecode {
                address,
                code_hash: B256::from([0x44; 32]),
            },
        ] {
            let raw = key.encode();
            assert_eq!(StateContentKey::decode(&raw).unwrap(), key);
        }
        assert!(StateContentKey::decode(&RawContentKey(vec![0x07, 0x00])).is_err());
        assert!(StateContentKey::decode(&RawContentKey(vec![0x00; 10])).is_err());
    }

    #[test]
    fn account_proof_verifies_and_feeds_index() {
        let address = Address::from([0xAA; 20]);
        let account = AccountState {
            nonce: 5,
            balance: U256::from(1_000_000u64),
            storage_root: B256::from([0x55; 32]),
            code_hash: B256::from([0x66; 32]),
        };
        let account_rlp = encode_account(&account);
        let key_hash = keccak256(address.as_slice());
        let (state_root, nodes) = single_leaf_proof(&key_hash, &account_rlp);

        let verifier = StateVerifier::new();
        let key = StateContentKey::AccountTrieProof {
            address,
            state_root,
        }
        .encode();
        let payload = encode_account_proof(&nodes);
        assert!(verifier.verify(key.as_slice(), &payload).is_ok());
        assert_eq!(verifier.index().roots_for(&address), vec![state_root]);

        // A proof against an unrelated root fails.
        let bad_key = StateContentKey::AccountTrieProof {
            address,
            state_root: B256::from([0x99; 32]),
        }
        .encode();
        assert!(verifier.verify(bad_key.as_slice(), &payload).is_err());
    }

    #[test]
    fn storage_proof_chains_through_account() {
        let address = Address::from([0xBB; 20]);
        let slot = U256::from(3u64);
        let slot_value = {
            let mut out = Vec::new();
            U256::from(42u64).encode(&mut out);
            out
        };
        let slot_hash = keccak256(slot.to_be_bytes::<32>());
        let (storage_root, storage_nodes) = single_leaf_proof(&slot_hash, &slot_value);

        let account = AccountState {
            nonce: 1,
            balance: U256::ZERO,
            storage_root,
            code_hash: B256::ZERO,
        };
        let account_rlp = encode_account(&account);
        let key_hash = keccak256(address.as_slice());
        let (state_root, account_nodes) = single_leaf_proof(&key_hash, &account_rlp);

        let verifier = StateVerifier::new();
        let key = StateContentKey::ContractStorageProof {
            address,
            slot,
            state_root,
        }
        .encode();
        let payload = encode_storage_proof(&account_nodes, &storage_nodes);
        assert!(verifier.verify(key.as_slice(), &payload).is_ok());

        // Swapping the storage proof for one under a different root fails.
        let (_, other_nodes) = single_leaf_proof(&slot_hash, b"other");
        let bad_payload = encode_storage_proof(&account_nodes, &other_nodes);
        assert!(verifier.verify(key.as_slice(), &bad_payload).is_err());
    }

    #[test]
    fn bytecode_binds_to_code_hash() {
        let code = vec![0x60, 0x80, 0x60, 0x40, 0x52];
        let verifier = StateVerifier::new();
        let key = StateContentKey::ContractBytecode {
            address: Address::from([0xCC; 20]),
            code_hash: keccak256(&code),
        }
        .encode();
        assert!(verifier.verify(key.as_slice(), &code).is_ok());

        let wrong = StateContentKey::ContractBytecode {
            address: Address::from([0xCC; 20]),
            code_hash: B256::from([0x01; 32]),
        }
        .encode();
        assert!(matches!(
            verifier.verify(wrong.as_slice(), &code),
            Err(ValidationError::HashMismatch { .. })
        ));
    }

    #[test]
    fn index_orders_by_nonce_then_balance_as_big_integers() {
        let index = AccountIndex::new();
        let address = Address::from([0xDD; 20]);
        let root = |b: u8| B256::from([b; 32]);

        // Balances differing only far above 2^64 must still order correctly.
        let small = U256::from(5u64);
        let huge = (U256::from(1u64) << 200) + U256::from(5u64);
        index.record(address, root(3), 2, small);
        index.record(address, root(1), 1, huge);
        index.record(address, root(2), 1, small);
        index.record(address, root(4), 2, huge);

        assert_eq!(
            index.roots_for(&address),
            vec![root(2), root(1), root(3), root(4)]
        );
    }

    #[test]
    fn index_deduplicates_roots() {
        let index = AccountIndex::new();
        let address = Address::from([0xEE; 20]);
        let root = B256::from([0x12; 32]);
        index.record(address, root, 1, U256::ZERO);
        index.record(address, root, 9, U256::MAX);
        assert_eq!(index.roots_for(&address).len(), 1);
    }

    #[test]
    fn unknown_account_has_no_roots() {
        let index = AccountIndex::new();
        assert!(index.roots_for(&Address::from([0x01; 20])).is_empty());
        assert!(index.is_empty());
    }
}
