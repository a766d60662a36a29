//! K-bucket implementation for the Kademlia routing table

use fedmesh_crypto::NodeId;
use std::collections::VecDeque;

use crate::node::DhtNode;
use crate::K;

/// A k-bucket holding nodes at one distance band
///
/// Nodes are kept in least-recently-seen order: the front is the oldest
/// contact, the back the most recent. Long-lived nodes at the front are
/// preferred over newcomers, matching the Kademlia liveness heuristic.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Bucket index (0-255)
    pub index: usize,

    /// Nodes in this bucket (up to k)
    nodes: VecDeque<DhtNode>,

    /// Unix seconds of the last insert, touch or refresh lookup
    pub last_refreshed: u64,
}

impl KBucket {
    pub fn new(index: usize) -> Self {
        KBucket {
            index,
            nodes: VecDeque::with_capacity(K),
            last_refreshed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    /// Get all nodes in the bucket
    pub fn nodes(&self) -> &VecDeque<DhtNode> {
        &self.nodes
    }

    /// Find a node by ID
    pub fn find(&self, node_id: &NodeId) -> Option<&DhtNode> {
        self.nodes.iter().find(|n| &n.node_id == node_id)
    }

    /// Find a node mutably
    pub fn find_mut(&mut self, node_id: &NodeId) -> Option<&mut DhtNode> {
        self.nodes.iter_mut().find(|n| &n.node_id == node_id)
    }

    /// Insert a node, or refresh it if already present
    ///
    /// - Known node: updated with the new contact info and moved to the back.
    /// - Bucket has room: appended at the back.
    /// - Bucket full with a stale head: head evicted, newcomer appended.
    /// - Bucket full of live nodes: newcomer rejected.
    ///
    /// Returns true if the node is in the bucket afterwards.
    pub fn insert_or_touch(&mut self, node: DhtNode, now: u64, staleness_secs: u64) -> bool {
        if let Some(pos) = self.nodes.iter().position(|n| n.node_id == node.node_id) {
            self.nodes.remove(pos);
            self.nodes.push_back(node);
            self.last_refreshed = now;
            return true;
        }

        if !self.is_full() {
            self.nodes.push_back(node);
            self.last_refreshed = now;
            return true;
        }

        if let Some(head) = self.nodes.front() {
            if head.is_stale(staleness_secs) {
                self.nodes.pop_front();
                self.nodes.push_back(node);
                self.last_refreshed = now;
                return true;
            }
        }

        false
    }

    /// Remove a node from the bucket
    pub fn remove(&mut self, node_id: &NodeId) -> Option<DhtNode> {
        let pos = self.nodes.iter().position(|n| &n.node_id == node_id)?;
        self.nodes.remove(pos)
    }

    /// Drop nodes whose failed-ping count reached the threshold
    ///
    /// Returns the removed nodes.
    pub fn prune_failed(&mut self, threshold: u32) -> Vec<DhtNode> {
        let mut removed = Vec::new();
        self.nodes.retain(|node| {
            if node.failed_pings >= threshold {
                removed.push(node.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Whether this bucket has gone without activity long enough to warrant
    /// a refresh lookup. Empty buckets never need refreshing.
    pub fn needs_refresh(&self, now: u64, refresh_secs: u64) -> bool {
        !self.is_empty() && now.saturating_sub(self.last_refreshed) > refresh_secs
    }

    /// Record that a refresh lookup covered this bucket
    pub fn mark_refreshed(&mut self, now: u64) {
        self.last_refreshed = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::now;
    use fedmesh_crypto::{NodeIdentity, NODE_ID_SIZE};

    fn create_test_node(id: u8) -> DhtNode {
        fedmesh_crypto::init().unwrap();
        let identity = NodeIdentity::generate().unwrap();
        let mut node = DhtNode::new(
            NodeId::from_bytes([id; NODE_ID_SIZE]),
            format!("https://node-{}.example:8484", id),
            &identity.public_key,
        );
        node.server_id = node.node_id.server_id();
        node
    }

    #[test]
    fn test_empty_bucket() {
        let bucket = KBucket::new(0);
        assert!(bucket.is_empty());
        assert!(!bucket.is_full());
        assert_eq!(bucket.len(), 0);
    }

    #[test]
    fn test_insert_node() {
        let mut bucket = KBucket::new(0);
        let node = create_test_node(1);

        assert!(bucket.insert_or_touch(node, now(), 900));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn test_touch_moves_to_back() {
        let mut bucket = KBucket::new(0);
        let node1 = create_test_node(1);
        let node2 = create_test_node(2);

        bucket.insert_or_touch(node1.clone(), now(), 900);
        bucket.insert_or_touch(node2, now(), 900);

        // Re-inserting node1 should move it to the back
        bucket.insert_or_touch(node1.clone(), now(), 900);
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.nodes().back().unwrap().node_id, node1.node_id);
    }

    #[test]
    fn test_full_bucket_rejects_newcomer() {
        let mut bucket = KBucket::new(0);

        for i in 0..K {
            assert!(bucket.insert_or_touch(create_test_node(i as u8), now(), 900));
        }
        assert!(bucket.is_full());

        let extra = create_test_node(99);
        assert!(!bucket.insert_or_touch(extra, now(), 900));
        assert_eq!(bucket.len(), K);
    }

    #[test]
    fn test_full_bucket_evicts_stale_head() {
        let mut bucket = KBucket::new(0);

        let mut stale = create_test_node(1);
        stale.last_seen = 0;
        bucket.insert_or_touch(stale.clone(), now(), 900);

        for i in 2..=(K as u8) {
            bucket.insert_or_touch(create_test_node(i), now(), 900);
        }
        assert!(bucket.is_full());

        let newcomer = create_test_node(99);
        assert!(bucket.insert_or_touch(newcomer.clone(), now(), 900));
        assert_eq!(bucket.len(), K);
        assert!(bucket.find(&stale.node_id).is_none());
        assert!(bucket.find(&newcomer.node_id).is_some());
    }

    #[test]
    fn test_remove_node() {
        let mut bucket = KBucket::new(0);
        let node = create_test_node(1);
        let node_id = node.node_id;

        bucket.insert_or_touch(node, now(), 900);
        assert!(bucket.remove(&node_id).is_some());
        assert!(bucket.is_empty());
        assert!(bucket.remove(&node_id).is_none());
    }

    #[test]
    fn test_prune_failed() {
        let mut bucket = KBucket::new(0);

        let mut failing = create_test_node(1);
        failing.failed_pings = 3;
        bucket.insert_or_touch(failing.clone(), now(), 900);
        bucket.insert_or_touch(create_test_node(2), now(), 900);

        let removed = bucket.prune_failed(3);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].node_id, failing.node_id);
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn test_needs_refresh() {
        let mut bucket = KBucket::new(0);
        assert!(!bucket.needs_refresh(now(), 3600)); // empty

        bucket.insert_or_touch(create_test_node(1), 0, 900);
        assert!(bucket.needs_refresh(now(), 3600));

        bucket.mark_refreshed(now());
        assert!(!bucket.needs_refresh(now(), 3600));
    }
}
