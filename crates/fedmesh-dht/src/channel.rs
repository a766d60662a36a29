//! Secure server-to-server channel
//!
//! Everything trust-sensitive lives here: mutual challenge-response
//! verification, signed and encrypted messaging, periodic health checks
//! and operator blocking. The channel consults the peer registry before
//! any contact; blocked peers are never spoken to.

use fedmesh_crypto::{
    decrypt_from, encrypt_for, generate_challenge, respond_to_challenge, sign_message,
    verify_response, verify_signature, NodeId, NodeIdentity, CHALLENGE_SIZE,
};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::sign::ed25519;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::node::{now, NodeManifest};
use crate::peer::{Peer, PeerRepository};
use crate::rpc::{
    generate_query_id, ChallengeRequest, ChallengeResponse, PeerRpc, PingRequest,
    SecureMessageRequest, VerifyRequest, VerifyResponse,
};

/// Trust and messaging layer over verified identities
pub struct PeerSecureChannel {
    identity: NodeIdentity,
    manifest: NodeManifest,
    peers: Arc<dyn PeerRepository>,
    rpc: Arc<dyn PeerRpc>,
    config: DhtConfig,

    /// Counter-challenges we issued, awaiting the requestor's signature.
    /// Entries expire after `challenge_max_age_ms` and are swept on every
    /// new issue, so abandoned handshakes cannot grow the map.
    issued_challenges: Mutex<HashMap<NodeId, IssuedChallenge>>,
}

struct IssuedChallenge {
    counter: [u8; CHALLENGE_SIZE],
    issued_at: u64,
}

/// Plaintext frame inside a sealed message
///
/// The sender tag and timestamp travel under the encryption; receivers
/// drop frames outside the freshness window, so a captured request stops
/// replaying once the window closes.
#[derive(Debug, Serialize, Deserialize)]
struct MessageBody {
    from: String,
    timestamp: u64,
    payload: Vec<u8>,
}

fn decode_public_key(hex_key: &str) -> Result<ed25519::PublicKey> {
    let bytes = hex::decode(hex_key).map_err(|e| DhtError::Serialization(e.to_string()))?;
    ed25519::PublicKey::from_slice(&bytes)
        .ok_or_else(|| DhtError::Protocol("malformed public key".into()))
}

fn as_challenge(bytes: &[u8]) -> Result<[u8; CHALLENGE_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| DhtError::Protocol(format!("challenge must be {} bytes", CHALLENGE_SIZE)))
}

impl PeerSecureChannel {
    pub fn new(
        identity: NodeIdentity,
        manifest: NodeManifest,
        peers: Arc<dyn PeerRepository>,
        rpc: Arc<dyn PeerRpc>,
        config: DhtConfig,
    ) -> Self {
        PeerSecureChannel {
            identity,
            manifest,
            peers,
            rpc,
            config,
            issued_challenges: Mutex::new(HashMap::new()),
        }
    }

    fn challenge_expired(&self, issued_at: u64) -> bool {
        now().saturating_sub(issued_at) * 1000 > self.config.challenge_max_age_ms
    }

    async fn known_peer(&self, node_id: &NodeId) -> Result<Peer> {
        let peer = self
            .peers
            .get(node_id)
            .await?
            .ok_or_else(|| DhtError::PeerNotFound(node_id.server_id()))?;

        if peer.is_blocked() {
            return Err(DhtError::PeerBlocked(node_id.server_id()));
        }

        Ok(peer)
    }

    /// Run the mutual verification handshake with a known peer
    ///
    /// Step 1: we hand the peer a fresh challenge; it returns its key,
    /// its signature over our challenge, and a counter-challenge.
    /// Step 2: we check the returned key against the pinned one, verify
    /// the signature, and send back our signature over the counter.
    /// Step 3: the peer confirms; only then do both sides mark Verified.
    ///
    /// A key that differs from the one on record aborts immediately with
    /// no trust change: that is an impersonation attempt, not a failed
    /// check.
    pub async fn verify_peer(&self, node_id: &NodeId) -> Result<bool> {
        let mut peer = self.known_peer(node_id).await?;

        let challenge = generate_challenge();
        let request = ChallengeRequest {
            query_id: generate_query_id(),
            requestor: self.identity.node_id,
            challenge: challenge.to_vec(),
        };

        let response = match timeout(
            self.config.lookup_timeout,
            self.rpc.request_challenge(&peer.endpoint, request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.record_failure(&mut peer).await?;
                return Err(e);
            }
            Err(_) => {
                self.record_failure(&mut peer).await?;
                return Err(DhtError::Timeout(format!(
                    "challenge to {}",
                    node_id.server_id()
                )));
            }
        };

        if response.public_key != peer.public_key {
            return Err(DhtError::PublicKeyMismatch(node_id.server_id()));
        }

        let peer_key = decode_public_key(&response.public_key)?;
        let proven = verify_response(
            &peer_key,
            &challenge,
            &response.signature,
            self.config.challenge_max_age_ms,
        )?;

        if !proven {
            warn!("{} failed our challenge", node_id.server_id());
            self.record_failure(&mut peer).await?;
            return Ok(false);
        }

        // Their identity holds; now prove ours over the counter-challenge
        let counter = as_challenge(&response.counter_challenge)?;
        let signature = respond_to_challenge(&self.identity, &counter)?;

        let request = VerifyRequest {
            query_id: generate_query_id(),
            requestor: self.identity.node_id,
            public_key: hex::encode(self.identity.public_key.as_ref()),
            signature,
        };

        let confirmation = match timeout(
            self.config.lookup_timeout,
            self.rpc.submit_verification(&peer.endpoint, request),
        )
        .await
        {
            Ok(Ok(confirmation)) => confirmation,
            Ok(Err(e)) => {
                self.record_failure(&mut peer).await?;
                return Err(e);
            }
            Err(_) => {
                self.record_failure(&mut peer).await?;
                return Err(DhtError::Timeout(format!(
                    "verification to {}",
                    node_id.server_id()
                )));
            }
        };

        if confirmation.verified {
            info!("Mutual verification with {} complete", node_id.server_id());
            peer.mark_verified();
            peer.record_success(self.config.health_success_gain);
        } else {
            warn!("{} rejected our verification", node_id.server_id());
            peer.record_failure(self.config.health_failure_penalty);
        }
        let verified = confirmation.verified;
        self.peers.upsert(peer).await?;
        Ok(verified)
    }

    /// Answer an inbound challenge: sign it and issue a counter-challenge
    pub async fn handle_challenge_request(
        &self,
        request: ChallengeRequest,
    ) -> Result<ChallengeResponse> {
        let challenge = as_challenge(&request.challenge)?;
        let signature = respond_to_challenge(&self.identity, &challenge)?;

        let counter = generate_challenge();
        {
            let mut issued = self.issued_challenges.lock().await;
            issued.retain(|_, entry| !self.challenge_expired(entry.issued_at));
            issued.insert(
                request.requestor,
                IssuedChallenge {
                    counter,
                    issued_at: now(),
                },
            );
        }

        debug!(
            "Signed challenge from {}, counter issued",
            request.requestor.server_id()
        );

        Ok(ChallengeResponse {
            query_id: request.query_id,
            responder: self.identity.node_id,
            public_key: hex::encode(self.identity.public_key.as_ref()),
            signature,
            counter_challenge: counter.to_vec(),
        })
    }

    /// Complete an inbound verification: check the requestor's signature
    /// over the counter-challenge we issued
    pub async fn handle_verification(&self, request: VerifyRequest) -> Result<VerifyResponse> {
        let issued = self
            .issued_challenges
            .lock()
            .await
            .remove(&request.requestor)
            .ok_or_else(|| {
                DhtError::Protocol(format!(
                    "no outstanding challenge for {}",
                    request.requestor.server_id()
                ))
            })?;

        if self.challenge_expired(issued.issued_at) {
            return Err(DhtError::Protocol(format!(
                "challenge for {} expired",
                request.requestor.server_id()
            )));
        }
        let counter = issued.counter;

        let public_key = decode_public_key(&request.public_key)?;

        // The claimed id must commit to the presented key
        if NodeIdentity::derive_node_id(&public_key) != request.requestor {
            return Err(DhtError::Protocol(
                "verification key does not match claimed node id".into(),
            ));
        }

        // A pinned key that differs is an impersonation attempt
        if let Some(peer) = self.peers.get(&request.requestor).await? {
            if peer.is_blocked() {
                return Err(DhtError::PeerBlocked(request.requestor.server_id()));
            }
            if peer.public_key != request.public_key {
                return Err(DhtError::PublicKeyMismatch(request.requestor.server_id()));
            }
        }

        let verified = verify_response(
            &public_key,
            &counter,
            &request.signature,
            self.config.challenge_max_age_ms,
        )?;

        if verified {
            info!("Verified inbound peer {}", request.requestor.server_id());
            let mut peer = match self.peers.get(&request.requestor).await? {
                Some(peer) => peer,
                None => Peer::seen(request.requestor, request.public_key.clone(), String::new()),
            };
            peer.mark_verified();
            self.peers.upsert(peer).await?;
        } else {
            warn!(
                "{} failed our counter-challenge",
                request.requestor.server_id()
            );
        }

        Ok(VerifyResponse {
            query_id: request.query_id,
            verified,
        })
    }

    /// Send an encrypted, signed payload to a verified peer
    ///
    /// The payload is framed with our server id and a timestamp, sealed
    /// for the peer's key, and the ciphertext is signed, so the receiver
    /// authenticates before decrypting and can reject stale frames.
    pub async fn send_secure_message(&self, node_id: &NodeId, payload: &[u8]) -> Result<()> {
        let mut peer = self.known_peer(node_id).await?;

        if !peer.is_verified() {
            return Err(DhtError::Protocol(format!(
                "peer {} has not been verified",
                node_id.server_id()
            )));
        }

        let body = MessageBody {
            from: self.manifest.server_id.clone(),
            timestamp: now(),
            payload: payload.to_vec(),
        };
        let plaintext = serde_json::to_vec(&body)?;

        let peer_key = decode_public_key(&peer.public_key)?;
        let envelope = encrypt_for(&self.identity, &peer_key, &plaintext)?;
        let signature = sign_message(&self.identity, &envelope.ciphertext)?;

        let request = SecureMessageRequest {
            query_id: generate_query_id(),
            sender: self.identity.node_id,
            envelope,
            signature,
        };

        let result = timeout(
            self.config.message_timeout,
            self.rpc.send_message(&peer.endpoint, request),
        )
        .await;

        match result {
            Ok(Ok(ack)) if ack.accepted => {
                peer.record_success(self.config.health_success_gain);
                self.peers.upsert(peer).await?;
                Ok(())
            }
            Ok(Ok(_)) => {
                self.record_failure(&mut peer).await?;
                Err(DhtError::Protocol(format!(
                    "{} refused the message",
                    node_id.server_id()
                )))
            }
            Ok(Err(e)) => {
                self.record_failure(&mut peer).await?;
                Err(e)
            }
            Err(_) => {
                self.record_failure(&mut peer).await?;
                Err(DhtError::Timeout(format!(
                    "message to {}",
                    node_id.server_id()
                )))
            }
        }
    }

    /// Authenticate and decrypt an inbound message
    ///
    /// Returns `Ok(None)` when the envelope fails decryption under the
    /// sender's key, when the inner frame is malformed or mislabelled,
    /// or when its timestamp falls outside the freshness window: all
    /// expected hostile input, logged and dropped without erroring the
    /// transport.
    pub async fn handle_message(&self, request: SecureMessageRequest) -> Result<Option<Vec<u8>>> {
        let peer = self.known_peer(&request.sender).await?;

        if !peer.is_verified() {
            return Err(DhtError::Protocol(format!(
                "unverified peer {} sent a message",
                request.sender.server_id()
            )));
        }

        let sender_key = decode_public_key(&peer.public_key)?;

        verify_signature(
            &sender_key,
            &request.envelope.ciphertext,
            &request.signature,
        )
        .map_err(|_| {
            DhtError::Protocol(format!(
                "bad message signature from {}",
                request.sender.server_id()
            ))
        })?;

        let plaintext = match decrypt_from(&self.identity, &sender_key, &request.envelope)? {
            Some(plaintext) => plaintext,
            None => {
                warn!(
                    "Dropping message from {} that failed decryption",
                    request.sender.server_id()
                );
                return Ok(None);
            }
        };

        let body: MessageBody = match serde_json::from_slice(&plaintext) {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    "Dropping malformed message frame from {}: {}",
                    request.sender.server_id(),
                    e
                );
                return Ok(None);
            }
        };

        if body.from != request.sender.server_id() {
            warn!(
                "Dropping message claiming to be from {} but sent by {}",
                body.from,
                request.sender.server_id()
            );
            return Ok(None);
        }

        if now().saturating_sub(body.timestamp) > self.config.message_max_age_secs {
            warn!(
                "Dropping stale message from {}",
                request.sender.server_id()
            );
            return Ok(None);
        }

        Ok(Some(body.payload))
    }

    /// One health sweep over every contactable peer
    ///
    /// Failures flag the peer and lower its score; nothing is ever
    /// removed here. Returns the number of healthy responses.
    pub async fn health_check_all(&self) -> Result<usize> {
        let peers: Vec<Peer> = self
            .peers
            .all()
            .await?
            .into_iter()
            .filter(|p| !p.is_blocked() && !p.endpoint.is_empty())
            .collect();

        let ping_futures: Vec<_> = peers
            .iter()
            .map(|peer| {
                let request = PingRequest {
                    query_id: generate_query_id(),
                    sender: self.manifest.clone(),
                };
                timeout(
                    self.config.lookup_timeout,
                    self.rpc.ping(&peer.endpoint, request),
                )
            })
            .collect();

        let results = futures::future::join_all(ping_futures).await;

        let mut healthy = 0;
        for (mut peer, result) in peers.into_iter().zip(results) {
            match result {
                Ok(Ok(_)) => {
                    peer.record_success(self.config.health_success_gain);
                    healthy += 1;
                }
                _ => {
                    peer.record_failure(self.config.health_failure_penalty);
                    if peer.failed_checks >= self.config.prune_failure_threshold {
                        warn!(
                            "Peer {} failed {} consecutive health checks",
                            peer.node_id.server_id(),
                            peer.failed_checks
                        );
                    }
                }
            }
            self.peers.upsert(peer).await?;
        }

        debug!("Health sweep: {} peers healthy", healthy);
        Ok(healthy)
    }

    /// Run health sweeps until the shutdown signal flips
    ///
    /// In-flight pings finish before the loop returns; only the timer is
    /// cancelled.
    pub async fn run_health_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh node does
        // not sweep an empty registry
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.health_check_all().await {
                        warn!("Health sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Health loop shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Operator action: block a peer permanently
    ///
    /// This is the only path to `TrustLevel::Blocked`; no automatic
    /// process ever assigns it.
    pub async fn block(&self, node_id: &NodeId, reason: &str) -> Result<()> {
        let mut peer = self
            .peers
            .get(node_id)
            .await?
            .ok_or_else(|| DhtError::PeerNotFound(node_id.server_id()))?;

        info!("Blocking {}: {}", node_id.server_id(), reason);
        peer.block(reason.to_string());
        self.peers.upsert(peer).await
    }

    async fn record_failure(&self, peer: &mut Peer) -> Result<()> {
        peer.record_failure(self.config.health_failure_penalty);
        self.peers.upsert(peer.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{MemoryPeerStore, TrustLevel};
    use crate::rpc::{
        AnnounceAck, AnnounceRequest, FindNodeRequest, FindNodeResponse, PingResponse,
        SecureMessageAck,
    };
    use std::time::Duration;

    fn test_identity() -> NodeIdentity {
        fedmesh_crypto::init().unwrap();
        NodeIdentity::generate().unwrap()
    }

    /// Routes RPCs straight into another channel's inbound handlers
    #[derive(Default)]
    struct Loopback {
        target: Mutex<Option<Arc<PeerSecureChannel>>>,
        delivered: Mutex<Vec<Vec<u8>>>,
        drop_pings: bool,
    }

    impl Loopback {
        async fn target(&self) -> Result<Arc<PeerSecureChannel>> {
            self.target
                .lock()
                .await
                .clone()
                .ok_or_else(|| DhtError::Network("unreachable".into()))
        }
    }

    #[async_trait::async_trait]
    impl PeerRpc for Loopback {
        async fn ping(&self, _endpoint: &str, request: PingRequest) -> Result<PingResponse> {
            if self.drop_pings {
                return Err(DhtError::Network("ping dropped".into()));
            }
            let target = self.target().await?;
            Ok(PingResponse {
                query_id: request.query_id,
                responder: target.manifest.clone(),
            })
        }

        async fn find_node(
            &self,
            _endpoint: &str,
            _request: FindNodeRequest,
        ) -> Result<FindNodeResponse> {
            Err(DhtError::Network("not supported".into()))
        }

        async fn announce(
            &self,
            _endpoint: &str,
            _request: AnnounceRequest,
        ) -> Result<AnnounceAck> {
            Err(DhtError::Network("not supported".into()))
        }

        async fn request_challenge(
            &self,
            _endpoint: &str,
            request: ChallengeRequest,
        ) -> Result<ChallengeResponse> {
            self.target().await?.handle_challenge_request(request).await
        }

        async fn submit_verification(
            &self,
            _endpoint: &str,
            request: VerifyRequest,
        ) -> Result<VerifyResponse> {
            self.target().await?.handle_verification(request).await
        }

        async fn send_message(
            &self,
            _endpoint: &str,
            request: SecureMessageRequest,
        ) -> Result<SecureMessageAck> {
            let query_id = request.query_id;
            let target = self.target().await?;
            match target.handle_message(request).await? {
                Some(payload) => {
                    self.delivered.lock().await.push(payload);
                    Ok(SecureMessageAck {
                        query_id,
                        accepted: true,
                    })
                }
                None => Ok(SecureMessageAck {
                    query_id,
                    accepted: false,
                }),
            }
        }
    }

    fn channel_for(identity: NodeIdentity, rpc: Arc<Loopback>) -> Arc<PeerSecureChannel> {
        let config = DhtConfig::default();
        let manifest = NodeManifest::local(
            &identity,
            format!("https://{}.example:8484", identity.server_id()),
            &config,
        );
        Arc::new(PeerSecureChannel::new(
            identity,
            manifest,
            Arc::new(MemoryPeerStore::new()),
            rpc,
            config,
        ))
    }

    /// Two channels wired to each other, each knowing the other at Seen
    async fn linked_pair() -> (
        Arc<PeerSecureChannel>,
        Arc<PeerSecureChannel>,
        Arc<Loopback>,
        Arc<Loopback>,
    ) {
        let alice_id = test_identity();
        let bob_id = test_identity();

        let to_bob = Arc::new(Loopback::default());
        let to_alice = Arc::new(Loopback::default());

        let alice = channel_for(alice_id, Arc::clone(&to_bob));
        let bob = channel_for(bob_id, Arc::clone(&to_alice));

        *to_bob.target.lock().await = Some(Arc::clone(&bob));
        *to_alice.target.lock().await = Some(Arc::clone(&alice));

        alice
            .peers
            .upsert(Peer::seen(
                bob.identity.node_id,
                hex::encode(bob.identity.public_key.as_ref()),
                bob.manifest.endpoint.clone(),
            ))
            .await
            .unwrap();
        bob.peers
            .upsert(Peer::seen(
                alice.identity.node_id,
                hex::encode(alice.identity.public_key.as_ref()),
                alice.manifest.endpoint.clone(),
            ))
            .await
            .unwrap();

        (alice, bob, to_bob, to_alice)
    }

    #[tokio::test]
    async fn test_mutual_verification() {
        let (alice, bob, _, _) = linked_pair().await;

        let verified = alice.verify_peer(&bob.identity.node_id).await.unwrap();
        assert!(verified);

        // Both registries now hold the other side at Verified
        let bob_in_alice = alice
            .peers
            .get(&bob.identity.node_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bob_in_alice.trust, TrustLevel::Verified);

        let alice_in_bob = bob
            .peers
            .get(&alice.identity.node_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice_in_bob.trust, TrustLevel::Verified);
    }

    #[tokio::test]
    async fn test_verify_unknown_peer_fails() {
        let (alice, _, _, _) = linked_pair().await;
        let stranger = test_identity();

        let result = alice.verify_peer(&stranger.node_id).await;
        assert!(matches!(result, Err(DhtError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_verify_rejects_substituted_key() {
        let (alice, bob, _, _) = linked_pair().await;

        // Poison the pinned key so Bob's real key no longer matches
        let mut pinned = alice
            .peers
            .get(&bob.identity.node_id)
            .await
            .unwrap()
            .unwrap();
        pinned.public_key = hex::encode(test_identity().public_key.as_ref());
        alice.peers.upsert(pinned).await.unwrap();

        let result = alice.verify_peer(&bob.identity.node_id).await;
        assert!(matches!(result, Err(DhtError::PublicKeyMismatch(_))));

        // No trust change on either side
        let peer = alice
            .peers
            .get(&bob.identity.node_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer.trust, TrustLevel::Seen);
        assert_eq!(peer.failed_checks, 0);
    }

    #[tokio::test]
    async fn test_verification_without_challenge_rejected() {
        let (alice, bob, _, _) = linked_pair().await;

        // Skip straight to step 2 without requesting a challenge
        let counter = generate_challenge();
        let signature = respond_to_challenge(&alice.identity, &counter).unwrap();
        let request = VerifyRequest {
            query_id: generate_query_id(),
            requestor: alice.identity.node_id,
            public_key: hex::encode(alice.identity.public_key.as_ref()),
            signature,
        };

        assert!(bob.handle_verification(request).await.is_err());
    }

    #[tokio::test]
    async fn test_secure_message_round_trip() {
        let (alice, bob, to_bob, _) = linked_pair().await;

        assert!(alice.verify_peer(&bob.identity.node_id).await.unwrap());

        alice
            .send_secure_message(&bob.identity.node_id, b"hello bob")
            .await
            .unwrap();

        let delivered = to_bob.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], b"hello bob");
    }

    #[tokio::test]
    async fn test_message_to_unverified_peer_rejected() {
        let (alice, bob, _, _) = linked_pair().await;

        let result = alice
            .send_secure_message(&bob.identity.node_id, b"too soon")
            .await;
        assert!(matches!(result, Err(DhtError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_message_with_forged_signature_rejected() {
        let (alice, bob, _, _) = linked_pair().await;
        assert!(alice.verify_peer(&bob.identity.node_id).await.unwrap());

        let peer_key = bob.identity.public_key;
        let envelope = encrypt_for(&alice.identity, &peer_key, b"payload").unwrap();
        // Signature from the wrong key
        let forger = test_identity();
        let signature = sign_message(&forger, &envelope.ciphertext).unwrap();

        let request = SecureMessageRequest {
            query_id: generate_query_id(),
            sender: alice.identity.node_id,
            envelope,
            signature,
        };

        assert!(bob.handle_message(request).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_message_dropped() {
        let (alice, bob, _, _) = linked_pair().await;
        assert!(alice.verify_peer(&bob.identity.node_id).await.unwrap());

        // A frame sealed well outside the freshness window, as a replayed
        // capture would be
        let body = MessageBody {
            from: alice.manifest.server_id.clone(),
            timestamp: now() - (bob.config.message_max_age_secs + 60),
            payload: b"old news".to_vec(),
        };
        let plaintext = serde_json::to_vec(&body).unwrap();
        let envelope = encrypt_for(&alice.identity, &bob.identity.public_key, &plaintext).unwrap();
        let signature = sign_message(&alice.identity, &envelope.ciphertext).unwrap();

        let request = SecureMessageRequest {
            query_id: generate_query_id(),
            sender: alice.identity.node_id,
            envelope,
            signature,
        };

        assert_eq!(bob.handle_message(request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_message_with_mislabelled_sender_dropped() {
        let (alice, bob, _, _) = linked_pair().await;
        assert!(alice.verify_peer(&bob.identity.node_id).await.unwrap());

        let body = MessageBody {
            from: "somebody-else".into(),
            timestamp: now(),
            payload: b"hello".to_vec(),
        };
        let plaintext = serde_json::to_vec(&body).unwrap();
        let envelope = encrypt_for(&alice.identity, &bob.identity.public_key, &plaintext).unwrap();
        let signature = sign_message(&alice.identity, &envelope.ciphertext).unwrap();

        let request = SecureMessageRequest {
            query_id: generate_query_id(),
            sender: alice.identity.node_id,
            envelope,
            signature,
        };

        assert_eq!(bob.handle_message(request).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_counter_challenge_rejected() {
        let (alice, bob, _, _) = linked_pair().await;

        // Bob issued this counter long ago and the requestor stalled
        let counter = generate_challenge();
        bob.issued_challenges.lock().await.insert(
            alice.identity.node_id,
            IssuedChallenge {
                counter,
                issued_at: now() - (bob.config.challenge_max_age_ms / 1000 + 60),
            },
        );

        let signature = respond_to_challenge(&alice.identity, &counter).unwrap();
        let request = VerifyRequest {
            query_id: generate_query_id(),
            requestor: alice.identity.node_id,
            public_key: hex::encode(alice.identity.public_key.as_ref()),
            signature,
        };

        assert!(bob.handle_verification(request).await.is_err());
        // The entry is consumed either way
        assert!(bob.issued_challenges.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_challenges_swept_on_issue() {
        let (alice, bob, _, _) = linked_pair().await;

        // Flood the map with abandoned handshakes
        for _ in 0..16 {
            bob.issued_challenges.lock().await.insert(
                test_identity().node_id,
                IssuedChallenge {
                    counter: generate_challenge(),
                    issued_at: now() - (bob.config.challenge_max_age_ms / 1000 + 60),
                },
            );
        }

        let request = ChallengeRequest {
            query_id: generate_query_id(),
            requestor: alice.identity.node_id,
            challenge: generate_challenge().to_vec(),
        };
        bob.handle_challenge_request(request).await.unwrap();

        // Only Alice's fresh counter survives
        let issued = bob.issued_challenges.lock().await;
        assert_eq!(issued.len(), 1);
        assert!(issued.contains_key(&alice.identity.node_id));
    }

    #[tokio::test]
    async fn test_message_from_blocked_peer_rejected() {
        let (alice, bob, _, _) = linked_pair().await;
        assert!(alice.verify_peer(&bob.identity.node_id).await.unwrap());

        bob.block(&alice.identity.node_id, "operator decision")
            .await
            .unwrap();

        let result = alice
            .send_secure_message(&bob.identity.node_id, b"hello?")
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_health_check_flags_unreachable_peer() {
        let alice_id = test_identity();
        let bob_id = test_identity();

        let rpc = Arc::new(Loopback {
            drop_pings: true,
            ..Default::default()
        });
        let alice = channel_for(alice_id, rpc);

        alice
            .peers
            .upsert(Peer::seen(
                bob_id.node_id,
                hex::encode(bob_id.public_key.as_ref()),
                "https://bob.example:8484".into(),
            ))
            .await
            .unwrap();

        for _ in 0..3 {
            let healthy = alice.health_check_all().await.unwrap();
            assert_eq!(healthy, 0);
        }

        // Flagged and degraded, but never removed
        let peer = alice.peers.get(&bob_id.node_id).await.unwrap().unwrap();
        assert_eq!(peer.failed_checks, 3);
        assert!(peer.health_score < 0.5);
    }

    #[tokio::test]
    async fn test_health_check_skips_blocked_peers() {
        let (alice, bob, _, _) = linked_pair().await;

        alice
            .block(&bob.identity.node_id, "operator decision")
            .await
            .unwrap();

        let before = alice
            .peers
            .get(&bob.identity.node_id)
            .await
            .unwrap()
            .unwrap();
        alice.health_check_all().await.unwrap();
        let after = alice
            .peers
            .get(&bob.identity.node_id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(before.health_score, after.health_score);
        assert_eq!(after.trust, TrustLevel::Blocked);
    }

    #[tokio::test]
    async fn test_health_loop_shutdown() {
        let (alice, _, _, _) = linked_pair().await;

        let (tx, rx) = watch::channel(false);
        let runner = {
            let alice = Arc::clone(&alice);
            tokio::spawn(async move { alice.run_health_loop(rx).await })
        };

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("health loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_block_requires_known_peer() {
        let (alice, _, _, _) = linked_pair().await;
        let stranger = test_identity();

        let result = alice.block(&stranger.node_id, "noise").await;
        assert!(matches!(result, Err(DhtError::PeerNotFound(_))));
    }
}
