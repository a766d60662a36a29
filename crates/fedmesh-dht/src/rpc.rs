//! Federation RPC payloads and the transport trait
//!
//! Every verb is a JSON body posted to the peer's endpoint. The crate
//! never opens sockets itself; an implementation of [`PeerRpc`] (HTTP in
//! production, in-memory in tests) carries the payloads.

use async_trait::async_trait;
use fedmesh_crypto::{NodeId, SealedEnvelope, Signature};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::node::{DhtNode, NodeManifest};

/// Unique identifier correlating a request with its response
pub type QueryId = u64;

/// Generate a random query ID
pub fn generate_query_id() -> QueryId {
    rand::random()
}

/// PING: liveness probe carrying both sides' contact info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub query_id: QueryId,
    pub sender: NodeManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub query_id: QueryId,
    pub responder: NodeManifest,
}

/// FIND_NODE: ask a peer for its closest known nodes to a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub query_id: QueryId,
    pub requestor: NodeId,
    pub target: NodeId,
}

impl FindNodeRequest {
    pub fn new(requestor: NodeId, target: NodeId) -> Self {
        FindNodeRequest {
            query_id: generate_query_id(),
            requestor,
            target,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub query_id: QueryId,
    pub nodes: Vec<DhtNode>,
}

/// ANNOUNCE: publish our manifest to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub query_id: QueryId,
    pub manifest: NodeManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceAck {
    pub query_id: QueryId,
    pub accepted: bool,
}

/// VERIFY step 1: hand the peer a challenge to sign
///
/// The responder proves its key by signing our challenge, and hands back a
/// counter-challenge so verification ends up mutual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub query_id: QueryId,
    pub requestor: NodeId,
    pub challenge: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub query_id: QueryId,
    pub responder: NodeId,
    /// Responder's public key, hex encoded
    pub public_key: String,
    /// Signature over our challenge
    pub signature: Signature,
    /// Challenge for us to sign in the second step
    pub counter_challenge: Vec<u8>,
}

/// VERIFY step 2: return our signature over the counter-challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub query_id: QueryId,
    pub requestor: NodeId,
    /// Requestor's public key, hex encoded
    pub public_key: String,
    pub signature: Signature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub query_id: QueryId,
    pub verified: bool,
}

/// MESSAGE: encrypted payload with a detached signature over the ciphertext
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMessageRequest {
    pub query_id: QueryId,
    pub sender: NodeId,
    pub envelope: SealedEnvelope,
    pub signature: Signature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMessageAck {
    pub query_id: QueryId,
    pub accepted: bool,
}

/// Transport abstraction for federation RPCs
///
/// Implementations address peers by endpoint; timeouts are applied by the
/// caller so transports stay simple.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    async fn ping(&self, endpoint: &str, request: PingRequest) -> Result<PingResponse>;

    async fn find_node(&self, endpoint: &str, request: FindNodeRequest)
        -> Result<FindNodeResponse>;

    async fn announce(&self, endpoint: &str, request: AnnounceRequest) -> Result<AnnounceAck>;

    async fn request_challenge(
        &self,
        endpoint: &str,
        request: ChallengeRequest,
    ) -> Result<ChallengeResponse>;

    async fn submit_verification(
        &self,
        endpoint: &str,
        request: VerifyRequest,
    ) -> Result<VerifyResponse>;

    async fn send_message(
        &self,
        endpoint: &str,
        request: SecureMessageRequest,
    ) -> Result<SecureMessageAck>;
}
