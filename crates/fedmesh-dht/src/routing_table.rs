//! Kademlia routing table

use fedmesh_crypto::NodeId;
use tracing::debug;

use crate::kbucket::KBucket;
use crate::node::{now, DhtNode};
use crate::persist::{BucketRecord, RoutingTableRecord};

/// Number of buckets: one per bit of the node id
const BUCKET_COUNT: usize = 256;

/// Kademlia routing table
///
/// Holds up to K nodes per distance band. All writes go through a single
/// owner; callers share it behind `Arc<tokio::sync::RwLock<_>>`.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our local node ID
    local_id: NodeId,

    /// 256 k-buckets (one per bit of node ID distance)
    buckets: Vec<KBucket>,

    /// A node unheard from for this long counts as stale
    staleness_secs: u64,

    /// Total nodes in the table
    node_count: usize,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(local_id: NodeId, staleness_secs: u64) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for i in 0..BUCKET_COUNT {
            buckets.push(KBucket::new(i));
        }

        RoutingTable {
            local_id,
            buckets,
            staleness_secs,
            node_count: 0,
        }
    }

    /// Get our local node ID
    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Get total number of nodes in the table
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Calculate bucket index for a node ID
    ///
    /// The index is the position of the first differing bit of the XOR
    /// distance: bucket 0 holds the most distant nodes, bucket 255 the
    /// closest. Self-inserts are rejected before this is called, so the
    /// all-zero distance never reaches the sentinel.
    fn bucket_index(&self, node_id: &NodeId) -> usize {
        let distance = self.local_id.distance(node_id);

        for (byte_idx, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                let msb_pos = byte.leading_zeros() as usize;
                return byte_idx * 8 + msb_pos;
            }
        }

        BUCKET_COUNT - 1
    }

    /// Insert a node, or refresh it if already known
    ///
    /// Returns true if the node is in the table afterwards. Our own id is
    /// never stored.
    pub fn insert(&mut self, node: DhtNode) -> bool {
        if node.node_id == self.local_id {
            return false;
        }

        let bucket_idx = self.bucket_index(&node.node_id);
        let bucket = &mut self.buckets[bucket_idx];

        let was_present = bucket.find(&node.node_id).is_some();
        let stored = bucket.insert_or_touch(node, now(), self.staleness_secs);

        if stored && !was_present {
            self.node_count += 1;
        }

        stored
    }

    /// Find a node by ID
    pub fn get(&self, node_id: &NodeId) -> Option<&DhtNode> {
        if node_id == &self.local_id {
            return None;
        }

        let bucket_idx = self.bucket_index(node_id);
        self.buckets[bucket_idx].find(node_id)
    }

    /// Find a node mutably
    pub fn get_mut(&mut self, node_id: &NodeId) -> Option<&mut DhtNode> {
        if node_id == &self.local_id {
            return None;
        }

        let bucket_idx = self.bucket_index(node_id);
        self.buckets[bucket_idx].find_mut(node_id)
    }

    /// Remove a node from the table
    pub fn remove(&mut self, node_id: &NodeId) -> Option<DhtNode> {
        let bucket_idx = self.bucket_index(node_id);
        let removed = self.buckets[bucket_idx].remove(node_id);
        if removed.is_some() {
            self.node_count -= 1;
        }
        removed
    }

    /// Get the k nodes closest to a target, by XOR distance
    pub fn find_closest(&self, target: &NodeId, k: usize) -> Vec<DhtNode> {
        let mut all_nodes: Vec<DhtNode> = self.all_nodes();

        all_nodes.sort_by_key(|node| target.distance(&node.node_id));

        all_nodes.truncate(k);
        all_nodes
    }

    /// Get all nodes in the table
    pub fn all_nodes(&self) -> Vec<DhtNode> {
        let mut all_nodes = Vec::with_capacity(self.node_count);
        for bucket in &self.buckets {
            all_nodes.extend(bucket.nodes().iter().cloned());
        }
        all_nodes
    }

    /// Record a successful contact with a node
    pub fn touch(&mut self, node_id: &NodeId) {
        if let Some(node) = self.get_mut(node_id) {
            node.touch();
        }
    }

    /// Record a failed contact attempt against a node
    pub fn record_failure(&mut self, node_id: &NodeId) {
        if let Some(node) = self.get_mut(node_id) {
            node.record_failure();
        }
    }

    /// Drop every node whose failed-ping count reached the threshold
    ///
    /// Returns the removed nodes.
    pub fn prune_failed(&mut self, threshold: u32) -> Vec<DhtNode> {
        let mut removed = Vec::new();
        for bucket in &mut self.buckets {
            removed.extend(bucket.prune_failed(threshold));
        }
        self.node_count -= removed.len();

        if !removed.is_empty() {
            debug!("Pruned {} unresponsive nodes", removed.len());
        }
        removed
    }

    /// Indices of non-empty buckets due for a refresh lookup
    pub fn buckets_needing_refresh(&self, refresh_secs: u64) -> Vec<usize> {
        let current = now();
        self.buckets
            .iter()
            .filter(|b| b.needs_refresh(current, refresh_secs))
            .map(|b| b.index)
            .collect()
    }

    /// Record that a refresh lookup covered a bucket
    pub fn mark_refreshed(&mut self, index: usize) {
        if let Some(bucket) = self.buckets.get_mut(index) {
            bucket.mark_refreshed(now());
        }
    }

    /// Snapshot the table for persistence
    pub fn to_record(&self) -> RoutingTableRecord {
        let buckets = self
            .buckets
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| BucketRecord {
                index: b.index,
                last_refreshed: b.last_refreshed,
                nodes: b.nodes().iter().cloned().collect(),
            })
            .collect();

        RoutingTableRecord {
            local_id: self.local_id,
            buckets,
        }
    }

    /// Rebuild a table from a persisted snapshot
    ///
    /// Nodes are re-bucketed through the normal insert path, so an
    /// oversized or malformed snapshot degrades to whatever fits.
    pub fn from_record(record: RoutingTableRecord, staleness_secs: u64) -> Self {
        let mut table = RoutingTable::new(record.local_id, staleness_secs);

        for bucket_record in record.buckets {
            for node in bucket_record.nodes {
                table.insert(node);
            }
            if let Some(bucket) = table.buckets.get_mut(bucket_record.index) {
                bucket.last_refreshed = bucket_record.last_refreshed;
            }
        }

        table
    }
}
