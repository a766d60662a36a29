//! FedMesh peer discovery and trust federation
//!
//! A Kademlia-style distributed hash table over the FedMesh identity
//! primitives. The crate covers:
//! - 256-bucket XOR routing table holding up to K=20 nodes per bucket
//! - Iterative FIND_NODE lookups with ALPHA=3 parallel queries
//! - Bootstrap, announce and periodic bucket refresh
//! - A peer trust registry driven by challenge-response verification
//! - Signed + encrypted server-to-server messaging
//!
//! Transport and persistence are injected through the [`rpc::PeerRpc`],
//! [`persist::PersistentStore`] and [`peer::PeerRepository`] traits so the
//! crate stays independent of the HTTP layer that carries the RPCs.

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod kbucket;
pub mod lookup;
pub mod node;
pub mod peer;
pub mod persist;
pub mod routing_table;
pub mod rpc;

/// Kademlia replication parameter: maximum nodes per bucket
pub const K: usize = 20;

/// Kademlia concurrency parameter: parallel queries per lookup round
pub const ALPHA: usize = 3;

pub use channel::PeerSecureChannel;
pub use config::DhtConfig;
pub use error::{DhtError, Result};
pub use handler::RequestHandler;
pub use lookup::LookupEngine;
pub use node::{DhtNode, NodeManifest};
pub use peer::{MemoryPeerStore, Peer, PeerRepository, TrustLevel};
pub use persist::{BootstrapSeed, MemoryStore, PersistentStore, RoutingTableRecord};
pub use routing_table::RoutingTable;
pub use rpc::PeerRpc;
