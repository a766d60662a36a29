//! Persistence records and the storage collaborator trait
//!
//! The routing table is snapshotted after structural changes and reloaded
//! on start so a restarted node rejoins the mesh without a cold bootstrap.
//! The actual storage backend is injected; this module carries the record
//! shapes, the JSON helpers and an in-memory backend for tests.

use async_trait::async_trait;
use fedmesh_crypto::{IdentityRecord, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::node::DhtNode;

/// One persisted k-bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRecord {
    pub index: usize,
    pub last_refreshed: u64,
    pub nodes: Vec<DhtNode>,
}

/// Serialized routing table snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTableRecord {
    pub local_id: NodeId,
    pub buckets: Vec<BucketRecord>,
}

/// A configured entry point into the mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSeed {
    pub endpoint: String,
}

/// Encode a routing table snapshot as JSON
pub fn encode_snapshot(record: &RoutingTableRecord) -> Result<String> {
    Ok(serde_json::to_string(record)?)
}

/// Decode a routing table snapshot from JSON
pub fn decode_snapshot(data: &str) -> Result<RoutingTableRecord> {
    Ok(serde_json::from_str(data)?)
}

/// Storage backend for identity keys and routing table snapshots
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn save_identity(&self, record: &IdentityRecord) -> Result<()>;

    async fn load_identity(&self) -> Result<Option<IdentityRecord>>;

    async fn save_routing_table(&self, record: &RoutingTableRecord) -> Result<()>;

    async fn load_routing_table(&self) -> Result<Option<RoutingTableRecord>>;
}

/// In-memory store used by tests and single-process deployments
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn save_identity(&self, record: &IdentityRecord) -> Result<()> {
        let data = serde_json::to_string(record)?;
        self.entries.write().await.insert("identity".into(), data);
        Ok(())
    }

    async fn load_identity(&self) -> Result<Option<IdentityRecord>> {
        let entries = self.entries.read().await;
        match entries.get("identity") {
            Some(data) => Ok(Some(serde_json::from_str(data)?)),
            None => Ok(None),
        }
    }

    async fn save_routing_table(&self, record: &RoutingTableRecord) -> Result<()> {
        let data = encode_snapshot(record)?;
        self.entries
            .write()
            .await
            .insert("routing_table".into(), data);
        Ok(())
    }

    async fn load_routing_table(&self) -> Result<Option<RoutingTableRecord>> {
        let entries = self.entries.read().await;
        match entries.get("routing_table") {
            Some(data) => Ok(Some(decode_snapshot(data)?)),
            None => Ok(None),
        }
    }
}
