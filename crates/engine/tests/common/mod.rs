//! In-process test network: N engine instances wired through a hub that
//! implements the transport seam, with per-node fault injection.

// Each test binary compiles this module on its own; not every binary uses
// every fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libp2p::{identity, PeerId};
use tokio::sync::{mpsc, oneshot};

use tss_common::ids::payload_hash;
use tss_common::TssConfig;
use tss_engine::mpc::dev::DevBackend;
use tss_engine::mpc::PartyBackend;
use tss_engine::relay::BroadcastConfirmMessage;
use tss_engine::TssServer;
use tss_network::bus::SubscriptionBus;
use tss_network::conversion::node_key_from_keypair;
use tss_network::messages::{
    InboundMessage, JoinPartyEvent, JoinPartyRequest, JoinPartyResponse, MessageType,
    WrappedMessage,
};
use tss_network::{Messenger, NetworkError};
use tss_storage::SqliteStateStore;

pub struct HubNode {
    bus: SubscriptionBus,
    join_sessions: Mutex<HashMap<String, mpsc::Sender<JoinPartyEvent>>>,
}

#[derive(Default)]
pub struct Hub {
    nodes: Mutex<HashMap<PeerId, Arc<HubNode>>>,
}

impl Hub {
    fn add_node(&self, peer: PeerId) -> Arc<HubNode> {
        let node = Arc::new(HubNode {
            bus: SubscriptionBus::new(),
            join_sessions: Mutex::new(HashMap::new()),
        });
        self.nodes.lock().unwrap().insert(peer, node.clone());
        node
    }

    fn node(&self, peer: &PeerId) -> Option<Arc<HubNode>> {
        self.nodes.lock().unwrap().get(peer).cloned()
    }

    fn all_peers(&self) -> Vec<PeerId> {
        self.nodes.lock().unwrap().keys().copied().collect()
    }
}

/// Outbound fault injection: what actually leaves this node for `to`.
pub trait SendPolicy: Send + Sync + 'static {
    fn transform(&self, to: &PeerId, msg: &WrappedMessage) -> Option<WrappedMessage>;
}

pub struct Passthrough;

impl SendPolicy for Passthrough {
    fn transform(&self, _: &PeerId, msg: &WrappedMessage) -> Option<WrappedMessage> {
        Some(msg.clone())
    }
}

/// Policy holder tests can swap mid-run (e.g. honest keygen, faulty sign).
pub struct SwitchPolicy {
    inner: Mutex<Arc<dyn SendPolicy>>,
}

impl SwitchPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Arc::new(Passthrough)),
        })
    }

    pub fn set(&self, policy: Arc<dyn SendPolicy>) {
        *self.inner.lock().unwrap() = policy;
    }
}

impl SendPolicy for SwitchPolicy {
    fn transform(&self, to: &PeerId, msg: &WrappedMessage) -> Option<WrappedMessage> {
        let inner = self.inner.lock().unwrap().clone();
        inner.transform(to, msg)
    }
}

/// Withhold every frame of one round (E3: refuse the unicast shares).
pub struct DropRound {
    pub message_type: MessageType,
    pub round_tag: &'static str,
}

impl SendPolicy for DropRound {
    fn transform(&self, _: &PeerId, msg: &WrappedMessage) -> Option<WrappedMessage> {
        if msg.message_type == self.message_type {
            if let Ok(confirm) = serde_json::from_slice::<BroadcastConfirmMessage>(&msg.payload) {
                if confirm.round_tag == self.round_tag {
                    return None;
                }
            }
        }
        Some(msg.clone())
    }
}

/// Send a conflicting-but-internally-consistent payload to one victim
/// (E5: equivocation).
pub struct Equivocate {
    pub message_type: MessageType,
    pub round_tag: &'static str,
    pub victim: PeerId,
}

impl SendPolicy for Equivocate {
    fn transform(&self, to: &PeerId, msg: &WrappedMessage) -> Option<WrappedMessage> {
        if *to != self.victim || msg.message_type != self.message_type {
            return Some(msg.clone());
        }
        let Ok(mut confirm) = serde_json::from_slice::<BroadcastConfirmMessage>(&msg.payload)
        else {
            return Some(msg.clone());
        };
        if confirm.round_tag != self.round_tag {
            return Some(msg.clone());
        }

        confirm.payload.push(0xff);
        confirm.hash = payload_hash(&confirm.payload);
        let payload = serde_json::to_vec(&confirm).unwrap();
        Some(WrappedMessage::new(
            msg.message_type,
            msg.msg_id.clone(),
            payload,
        ))
    }
}

pub struct HubMessenger {
    hub: Arc<Hub>,
    local: PeerId,
    node: Arc<HubNode>,
    policy: Arc<SwitchPolicy>,
}

impl HubMessenger {
    fn transmit(&self, to: PeerId, msg: WrappedMessage) {
        if to == self.local {
            return;
        }
        let Some(transformed) = self.policy.transform(&to, &msg) else {
            return;
        };
        if let Some(node) = self.hub.node(&to) {
            node.bus.deliver(InboundMessage {
                peer: self.local,
                wrapped: transformed,
            });
        }
    }
}

#[async_trait]
impl Messenger for HubMessenger {
    fn local_peer_id(&self) -> PeerId {
        self.local
    }

    async fn send_to_peer(&self, peer: PeerId, msg: WrappedMessage) {
        self.transmit(peer, msg);
    }

    async fn broadcast(&self, peers: Vec<PeerId>, msg: WrappedMessage) {
        let targets = if peers.is_empty() {
            self.hub.all_peers()
        } else {
            peers
        };
        for peer in targets {
            self.transmit(peer, msg.clone());
        }
    }

    async fn join_party(
        &self,
        leader: PeerId,
        request: JoinPartyRequest,
        timeout: Duration,
    ) -> Result<JoinPartyResponse, NetworkError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let session_tx = loop {
            if let Some(node) = self.hub.node(&leader) {
                let maybe = node
                    .join_sessions
                    .lock()
                    .unwrap()
                    .get(&request.msg_id)
                    .cloned();
                if let Some(tx) = maybe {
                    break tx;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(NetworkError::Timeout(format!(
                    "leader {} never accepted join-party requests",
                    leader
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        session_tx
            .send(JoinPartyEvent {
                from: self.local,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| NetworkError::ChannelClosed)?;

        match tokio::time::timeout(timeout + Duration::from_secs(5), reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            _ => Err(NetworkError::Timeout(
                "no join-party response from the leader".to_string(),
            )),
        }
    }

    async fn register_join_party(&self, msg_id: &str) -> mpsc::Receiver<JoinPartyEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.node
            .join_sessions
            .lock()
            .unwrap()
            .insert(msg_id.to_string(), tx);
        rx
    }

    async fn unregister_join_party(&self, msg_id: &str) {
        self.node.join_sessions.lock().unwrap().remove(msg_id);
    }

    fn subscribe(&self, types: &[MessageType], msg_id: &str) -> mpsc::Receiver<InboundMessage> {
        self.node.bus.subscribe(types, msg_id)
    }

    fn unsubscribe(&self, types: &[MessageType], msg_id: &str) {
        self.node.bus.unsubscribe(types, msg_id)
    }

    async fn peer_addresses(&self) -> Vec<String> {
        self.hub
            .all_peers()
            .iter()
            .map(|p| format!("/ip4/127.0.0.1/tcp/6668/p2p/{}", p))
            .collect()
    }
}

pub struct TestNode {
    pub node_key: String,
    pub peer_id: PeerId,
    pub policy: Arc<SwitchPolicy>,
    pub storage: Arc<SqliteStateStore>,
    pub server: Arc<TssServer<HubMessenger>>,
}

/// Build an n-node cluster sharing one in-process hub.
pub fn build_cluster(n: usize, conf: TssConfig) -> Vec<TestNode> {
    let hub = Arc::new(Hub::default());
    let mut nodes: Vec<TestNode> = (0..n)
        .map(|_| {
            let keypair = identity::Keypair::generate_secp256k1();
            let node_key = node_key_from_keypair(&keypair).unwrap();
            let peer_id = PeerId::from(keypair.public());
            let hub_node = hub.add_node(peer_id);
            let policy = SwitchPolicy::new();
            let messenger = Arc::new(HubMessenger {
                hub: hub.clone(),
                local: peer_id,
                node: hub_node,
                policy: policy.clone(),
            });
            let storage = Arc::new(SqliteStateStore::open_in_memory().unwrap());
            let backend: Arc<dyn PartyBackend> = Arc::new(DevBackend);
            let server = Arc::new(TssServer::new(
                conf.clone(),
                messenger,
                storage.clone(),
                backend,
                node_key.clone(),
            ));
            TestNode {
                node_key,
                peer_id,
                policy,
                storage,
                server,
            }
        })
        .collect();

    // Deterministic ordering simplifies signer selection in tests.
    nodes.sort_by(|a, b| a.node_key.cmp(&b.node_key));
    nodes
}

pub fn all_keys(nodes: &[TestNode]) -> Vec<String> {
    nodes.iter().map(|n| n.node_key.clone()).collect()
}

pub fn test_config(session_timeout: Duration) -> TssConfig {
    TssConfig {
        keygen_timeout: session_timeout,
        keysign_timeout: session_timeout,
        preparam_timeout: Duration::from_secs(300),
    }
}

/// Verify a response signature against the pool public key.
pub fn verify_signature(pub_key_hex: &str, sig: &tss_engine::Signature) {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use ed25519_dalek::{Signature as EdSignature, VerifyingKey};

    let pub_key: [u8; 32] = hex::decode(pub_key_hex).unwrap().try_into().unwrap();
    let verifying = VerifyingKey::from_bytes(&pub_key).unwrap();

    let m = STANDARD.decode(&sig.msg).unwrap();
    let r = STANDARD.decode(&sig.r).unwrap();
    let s = STANDARD.decode(&sig.s).unwrap();

    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(&r);
    raw[32..].copy_from_slice(&s);
    verifying
        .verify_strict(&m, &EdSignature::from_bytes(&raw))
        .expect("signature must verify against the pool key");
}
