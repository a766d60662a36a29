//! Inbound request handling
//!
//! Server-side counterpart of [`crate::rpc::PeerRpc`]: the HTTP layer
//! decodes a request body and hands it here. Every inbound contact also
//! feeds the routing table and creates first-contact peer records.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::node::NodeManifest;
use crate::peer::{Peer, PeerRepository};
use crate::routing_table::RoutingTable;
use crate::rpc::{
    AnnounceAck, AnnounceRequest, FindNodeRequest, FindNodeResponse, PingRequest, PingResponse,
};

/// Handles ping, find-node and announce requests from remote nodes
pub struct RequestHandler {
    manifest: NodeManifest,
    routing_table: Arc<RwLock<RoutingTable>>,
    peers: Arc<dyn PeerRepository>,
    config: DhtConfig,
}

impl RequestHandler {
    pub fn new(
        manifest: NodeManifest,
        routing_table: Arc<RwLock<RoutingTable>>,
        peers: Arc<dyn PeerRepository>,
        config: DhtConfig,
    ) -> Self {
        RequestHandler {
            manifest,
            routing_table,
            peers,
            config,
        }
    }

    /// Answer a liveness probe with our own manifest
    pub async fn handle_ping(&self, request: PingRequest) -> Result<PingResponse> {
        self.admit(&request.sender).await?;

        Ok(PingResponse {
            query_id: request.query_id,
            responder: self.manifest.clone(),
        })
    }

    /// Answer a FIND_NODE with our k closest known nodes to the target
    pub async fn handle_find_node(&self, request: FindNodeRequest) -> Result<FindNodeResponse> {
        let nodes = {
            let mut table = self.routing_table.write().await;
            table.touch(&request.requestor);
            table.find_closest(&request.target, self.config.k)
        };

        debug!(
            "Answering find-node for {} with {} nodes",
            request.target,
            nodes.len()
        );

        Ok(FindNodeResponse {
            query_id: request.query_id,
            nodes,
        })
    }

    /// Accept an announce and record the sender's manifest
    pub async fn handle_announce(&self, request: AnnounceRequest) -> Result<AnnounceAck> {
        let accepted = match self.admit(&request.manifest).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Rejected announce: {}", e);
                false
            }
        };

        Ok(AnnounceAck {
            query_id: request.query_id,
            accepted,
        })
    }

    /// Validate a manifest and fold it into the routing table and the
    /// peer registry
    ///
    /// The first manifest we accept pins the peer's public key; later
    /// contacts claiming the same id with a different key are rejected.
    async fn admit(&self, manifest: &NodeManifest) -> Result<()> {
        if manifest.node_id == self.manifest.node_id {
            return Ok(());
        }

        let node = manifest.to_node()?;

        match self.peers.get(&manifest.node_id).await? {
            Some(mut peer) => {
                if peer.public_key != manifest.public_key {
                    return Err(DhtError::PublicKeyMismatch(manifest.server_id.clone()));
                }
                if peer.is_blocked() {
                    return Err(DhtError::PeerBlocked(manifest.server_id.clone()));
                }
                peer.endpoint = manifest.endpoint.clone();
                peer.last_seen = crate::node::now();
                self.peers.upsert(peer).await?;
            }
            None => {
                debug!("First contact from {}", manifest.server_id);
                self.peers
                    .upsert(Peer::seen(
                        manifest.node_id,
                        manifest.public_key.clone(),
                        manifest.endpoint.clone(),
                    ))
                    .await?;
            }
        }

        self.routing_table.write().await.insert(node);
        Ok(())
    }
}
