//! # Portalium - Portal Network Overlay Client Core
//!
//! Portalium serves Ethereum execution-chain history and state as
//! content-addressed artifacts over a Kademlia-style overlay:
//!
//! - **Identity**: EIP-778 node records; node id = keccak of the signing key
//! - **Routing**: per-sub-protocol XOR-metric tables with liveness probing
//! - **Content**: radius-bounded admission, cryptographic verification of
//!   every served artifact, farthest-first eviction
//! - **Transfer**: a sequenced, windowed, retransmitting stream over UDP
//!   for payloads above the discovery packet ceiling
//! - **Gossip**: best-effort neighborhood OFFER/ACCEPT propagation
//!
//! ## Architecture
//!
//! Stateful components follow the **Actor Pattern**: a public handle that
//! is cheap to clone, a private actor that owns the mutable state, and
//! async channels between them. Network I/O stays out of the actors.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node` | High-level API combining overlays, socket demux, snapshots |
//! | `enr` | Node records, node ids, XOR distance |
//! | `content` | Sub-protocol tags, content keys/ids, radius arithmetic |
//! | `wire` | Portal wire messages, byte-exact |
//! | `routing` | 256-bucket XOR-metric table with replacement caches |
//! | `lookup` | Iterative FINDNODE / FINDCONTENT engines |
//! | `store` | Radius-bounded content store over a pluggable backend |
//! | `gossip` | Neighborhood OFFER/ACCEPT pipeline |
//! | `utp` | Reliable bulk-transfer channel |
//! | `overlay` | Per-sub-protocol service: dispatcher, RPCs, lookups |
//! | `history` | History keys, header/body/receipt/accumulator verifiers |
//! | `state` | State keys, trie-proof verifiers, account index |
//! | `trie` | Merkle-Patricia proof verification and ordered roots |
//! | `events` | Typed observer surface for upper layers |
//! | `protocols` | Traits for the discovery, persistence, verifier seams |
//! | `error` | Typed error taxonomy |

pub mod content;
pub mod enr;
pub mod error;
pub mod events;
pub mod gossip;
pub mod history;
pub mod lookup;
pub mod node;
pub mod overlay;
pub mod protocols;
pub mod routing;
pub mod state;
pub mod store;
pub mod trie;
pub mod utp;
pub mod wire;

pub use content::{content_id, RawContentKey, Radius, SubProtocolId};
pub use enr::{Enr, EnrBuilder, NodeId};
pub use events::{ObserverSet, OverlayObserver, SubscriptionId};
pub use history::{HistoryContentKey, MasterAccumulator};
pub use node::{Node, NodeConfig, TransportKind, UdpDiscovery};
pub use overlay::{OverlayConfig, OverlayService};
pub use protocols::{ContentDb, Discovery, InboundTalk, Verifier};
pub use state::StateContentKey;
pub use store::MemoryDb;
