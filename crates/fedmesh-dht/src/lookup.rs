//! Iterative lookup engine
//!
//! Implements the Kademlia discovery operations: iterative FIND_NODE,
//! bootstrap against configured seeds, announce fan-out and periodic
//! bucket refresh.

use fedmesh_crypto::{NodeId, NODE_ID_SIZE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::node::{DhtNode, NodeManifest};
use crate::persist::{BootstrapSeed, PersistentStore};
use crate::routing_table::RoutingTable;
use crate::rpc::{AnnounceRequest, FindNodeRequest, PeerRpc, PingRequest, generate_query_id};

/// State of a candidate during a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    /// Not queried yet
    Pending,
    /// Responded with its closest nodes
    Responded,
    /// Query failed or timed out
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    node: DhtNode,
    state: CandidateState,
    distance: [u8; NODE_ID_SIZE],
}

/// Tracks one iterative lookup
///
/// Pure state machine; the engine drives it and performs the RPCs.
struct LookupState {
    target: NodeId,
    candidates: HashMap<NodeId, Candidate>,
    k: usize,
    alpha: usize,
    max_rounds: usize,
    current_round: usize,
    found_exact: bool,
}

impl LookupState {
    fn new(target: NodeId, initial_nodes: Vec<DhtNode>, config: &DhtConfig) -> Self {
        let mut state = LookupState {
            target,
            candidates: HashMap::new(),
            k: config.k,
            alpha: config.alpha,
            max_rounds: config.max_lookup_rounds,
            current_round: 0,
            found_exact: false,
        };
        state.add_discovered(initial_nodes);
        state
    }

    /// Take up to alpha closest pending candidates for the next round
    fn next_query_batch(&mut self) -> Vec<DhtNode> {
        let mut pending: Vec<_> = self
            .candidates
            .values()
            .filter(|c| c.state == CandidateState::Pending)
            .collect();

        pending.sort_by(|a, b| a.distance.cmp(&b.distance));

        pending
            .iter()
            .take(self.alpha)
            .map(|c| c.node.clone())
            .collect()
    }

    /// Add newly discovered nodes as pending candidates
    fn add_discovered(&mut self, nodes: Vec<DhtNode>) {
        for node in nodes {
            if self.candidates.contains_key(&node.node_id) {
                continue;
            }

            if node.node_id == self.target {
                self.found_exact = true;
            }

            let distance = self.target.distance(&node.node_id);
            self.candidates.insert(
                node.node_id,
                Candidate {
                    node,
                    state: CandidateState::Pending,
                    distance,
                },
            );
        }
    }

    fn mark_responded(&mut self, node_id: &NodeId) {
        if let Some(candidate) = self.candidates.get_mut(node_id) {
            candidate.state = CandidateState::Responded;
        }
    }

    fn mark_failed(&mut self, node_id: &NodeId) {
        if let Some(candidate) = self.candidates.get_mut(node_id) {
            candidate.state = CandidateState::Failed;
        }
    }

    fn next_round(&mut self) {
        self.current_round += 1;
    }

    /// Whether the lookup can stop
    ///
    /// Stops on: exact target found, round budget exhausted, nothing left
    /// to query, or k responders with no pending candidate closer than the
    /// k-th of them (no further round can improve the result).
    fn is_complete(&self) -> bool {
        if self.found_exact {
            return true;
        }

        if self.current_round >= self.max_rounds {
            return true;
        }

        let has_pending = self
            .candidates
            .values()
            .any(|c| c.state == CandidateState::Pending);
        if !has_pending {
            return true;
        }

        let mut responded: Vec<_> = self
            .candidates
            .values()
            .filter(|c| c.state == CandidateState::Responded)
            .collect();

        if responded.len() >= self.k {
            responded.sort_by(|a, b| a.distance.cmp(&b.distance));

            if let Some(kth) = responded.get(self.k - 1) {
                let no_closer_pending = self
                    .candidates
                    .values()
                    .filter(|c| c.state == CandidateState::Pending)
                    .all(|c| c.distance > kth.distance);

                if no_closer_pending {
                    return true;
                }
            }
        }

        false
    }

    /// The k closest of everything discovered
    ///
    /// Discovered-but-unqueried candidates count: a lookup that ends the
    /// moment a hop hands back the exact target must still return that
    /// target. Only candidates that failed to answer are excluded.
    fn closest_nodes(&self) -> Vec<DhtNode> {
        let mut discovered: Vec<_> = self
            .candidates
            .values()
            .filter(|c| c.state != CandidateState::Failed)
            .collect();

        discovered.sort_by(|a, b| a.distance.cmp(&b.distance));

        discovered
            .iter()
            .take(self.k)
            .map(|c| c.node.clone())
            .collect()
    }
}

/// Generate a uniformly random lookup target
fn random_target() -> NodeId {
    NodeId::from_bytes(rand::random())
}

/// Drives discovery for the local node
///
/// The engine owns nothing but its handles: the routing table is shared
/// behind a lock, and transport and persistence are injected traits.
pub struct LookupEngine {
    manifest: NodeManifest,
    routing_table: Arc<RwLock<RoutingTable>>,
    rpc: Arc<dyn PeerRpc>,
    store: Arc<dyn PersistentStore>,
    seeds: Vec<BootstrapSeed>,
    config: DhtConfig,
    bootstrapped: AtomicBool,
}

impl LookupEngine {
    pub fn new(
        manifest: NodeManifest,
        routing_table: Arc<RwLock<RoutingTable>>,
        rpc: Arc<dyn PeerRpc>,
        store: Arc<dyn PersistentStore>,
        seeds: Vec<BootstrapSeed>,
        config: DhtConfig,
    ) -> Self {
        LookupEngine {
            manifest,
            routing_table,
            rpc,
            store,
            seeds,
            config,
            bootstrapped: AtomicBool::new(false),
        }
    }

    /// Whether bootstrap has completed since start
    pub fn is_bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    /// Shared handle to the routing table
    pub fn routing_table(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing_table
    }

    /// Load a persisted routing table snapshot, if one exists
    ///
    /// Corrupt or unreadable state is logged and ignored; the node starts
    /// with an empty table and re-discovers the mesh.
    pub async fn restore(&self) {
        match self.store.load_routing_table().await {
            Ok(Some(record)) => {
                let table = RoutingTable::from_record(record, self.config.node_staleness_secs);
                let count = table.node_count();
                *self.routing_table.write().await = table;
                info!("Restored routing table with {} nodes", count);
            }
            Ok(None) => debug!("No routing table snapshot to restore"),
            Err(e) => warn!("Discarding unreadable routing table snapshot: {}", e),
        }
    }

    /// Join the mesh: ping the configured seeds, then look up our own id
    /// to populate the buckets nearest to us
    ///
    /// With no seeds configured this succeeds trivially; the node simply
    /// waits to be contacted.
    pub async fn bootstrap(&self) -> Result<usize> {
        info!(
            server_id = %self.manifest.server_id,
            seeds = self.seeds.len(),
            "Bootstrapping"
        );

        let mut reachable = 0;
        for seed in &self.seeds {
            let request = PingRequest {
                query_id: generate_query_id(),
                sender: self.manifest.clone(),
            };

            let response = timeout(
                self.config.lookup_timeout,
                self.rpc.ping(&seed.endpoint, request),
            )
            .await;

            match response {
                Ok(Ok(pong)) => match pong.responder.to_node() {
                    Ok(node) => {
                        debug!("Seed {} answered as {}", seed.endpoint, node.server_id);
                        self.routing_table.write().await.insert(node);
                        reachable += 1;
                    }
                    Err(e) => warn!("Seed {} sent a bad manifest: {}", seed.endpoint, e),
                },
                Ok(Err(e)) => warn!("Seed {} unreachable: {}", seed.endpoint, e),
                Err(_) => warn!("Seed {} timed out", seed.endpoint),
            }
        }

        // Self-lookup fills the buckets around our own id
        self.find_node(self.manifest.node_id).await?;

        self.bootstrapped.store(true, Ordering::SeqCst);
        self.save_snapshot().await;

        let known = self.routing_table.read().await.node_count();
        info!(
            "Bootstrap complete: {}/{} seeds reachable, {} nodes known",
            reachable,
            self.seeds.len(),
            known
        );
        Ok(reachable)
    }

    /// Iterative FIND_NODE: return up to k nodes closest to the target
    ///
    /// Each round queries the alpha closest unqueried candidates in
    /// parallel and folds their answers back into the candidate set.
    /// Newly discovered nodes also land in the routing table.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<DhtNode>> {
        let initial_nodes = {
            let table = self.routing_table.read().await;
            table.find_closest(&target, self.config.k)
        };

        if initial_nodes.is_empty() {
            debug!("No known nodes for lookup of {}", target);
            return Ok(Vec::new());
        }

        debug!(
            "Looking up {} starting from {} nodes",
            target,
            initial_nodes.len()
        );

        let mut state = LookupState::new(target, initial_nodes, &self.config);

        while !state.is_complete() {
            let batch = state.next_query_batch();
            if batch.is_empty() {
                break;
            }

            let query_futures: Vec<_> = batch
                .iter()
                .map(|node| self.query_find_node(&target, node))
                .collect();

            let results = futures::future::join_all(query_futures).await;

            for (node, result) in batch.iter().zip(results) {
                match result {
                    Ok(mut discovered) => {
                        debug!("{} returned {} nodes", node.server_id, discovered.len());
                        state.mark_responded(&node.node_id);

                        // Nobody gets to hand us our own contact info
                        discovered.retain(|n| n.node_id != self.manifest.node_id);

                        {
                            let mut table = self.routing_table.write().await;
                            table.touch(&node.node_id);
                            for found in &discovered {
                                table.insert(found.clone());
                            }
                        }

                        state.add_discovered(discovered);
                    }
                    Err(e) => {
                        debug!("{} failed to answer lookup: {}", node.server_id, e);
                        state.mark_failed(&node.node_id);
                        self.routing_table.write().await.record_failure(&node.node_id);
                    }
                }
            }

            state.next_round();
        }

        let closest = state.closest_nodes();
        debug!(
            "Lookup of {} finished after {} rounds with {} nodes",
            target, state.current_round, closest.len()
        );

        self.save_snapshot().await;
        Ok(closest)
    }

    /// Publish our manifest to every node we know
    ///
    /// Fan-out is unbounded and independent: one unreachable peer never
    /// affects delivery to the rest.
    pub async fn announce(&self) -> Result<usize> {
        let nodes = self.routing_table.read().await.all_nodes();
        if nodes.is_empty() {
            debug!("Nobody to announce to");
            return Ok(0);
        }

        let announce_futures: Vec<_> = nodes
            .iter()
            .map(|node| {
                let request = AnnounceRequest {
                    query_id: generate_query_id(),
                    manifest: self.manifest.clone(),
                };
                timeout(
                    self.config.lookup_timeout,
                    self.rpc.announce(&node.endpoint, request),
                )
            })
            .collect();

        let results = futures::future::join_all(announce_futures).await;

        let mut accepted = 0;
        let mut table = self.routing_table.write().await;
        for (node, result) in nodes.iter().zip(results) {
            match result {
                Ok(Ok(ack)) if ack.accepted => {
                    table.touch(&node.node_id);
                    accepted += 1;
                }
                Ok(Ok(_)) => debug!("{} declined our announce", node.server_id),
                Ok(Err(e)) => {
                    debug!("Announce to {} failed: {}", node.server_id, e);
                    table.record_failure(&node.node_id);
                }
                Err(_) => {
                    debug!("Announce to {} timed out", node.server_id);
                    table.record_failure(&node.node_id);
                }
            }
        }
        drop(table);

        info!("Announced to {}/{} nodes", accepted, nodes.len());
        Ok(accepted)
    }

    /// Periodic maintenance: refresh quiet buckets, re-announce, prune
    ///
    /// Quiet buckets get a random-target lookup to pull fresh contacts in,
    /// then nodes that failed too many pings in a row are dropped.
    pub async fn refresh(&self) -> Result<()> {
        let stale = {
            let table = self.routing_table.read().await;
            table.buckets_needing_refresh(self.config.bucket_refresh_secs)
        };

        if !stale.is_empty() {
            debug!("Refreshing {} quiet buckets", stale.len());
        }

        for index in stale {
            self.find_node(random_target()).await?;
            self.routing_table.write().await.mark_refreshed(index);
        }

        self.announce().await?;

        let removed = {
            let mut table = self.routing_table.write().await;
            table.prune_failed(self.config.prune_failure_threshold)
        };
        for node in &removed {
            info!("Pruned unresponsive node {}", node.server_id);
        }

        self.save_snapshot().await;
        Ok(())
    }

    async fn query_find_node(&self, target: &NodeId, node: &DhtNode) -> Result<Vec<DhtNode>> {
        let request = FindNodeRequest::new(self.manifest.node_id, *target);

        match timeout(
            self.config.lookup_timeout,
            self.rpc.find_node(&node.endpoint, request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response.nodes),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DhtError::Timeout(format!(
                "find-node to {}",
                node.server_id
            ))),
        }
    }

    /// Persist the current routing table; failures are logged, never fatal
    async fn save_snapshot(&self) {
        let record = self.routing_table.read().await.to_record();
        if let Err(e) = self.store.save_routing_table(&record).await {
            warn!("Could not persist routing table snapshot: {}", e);
        }
    }
}
