//! Session orchestrator: the node's public `keygen` / `keysign` entry
//! points.
//!
//! Each call derives a session id, forms the quorum, drives the round relay
//! and reports either the artifact or a blame verdict. Protocol failures are
//! a successful response with `Fail` status; only storage failures and
//! invariant violations return an error.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use tss_common::{keygen_session_id, keysign_session_id, threshold, Status, TssConfig};
use tss_network::conversion::peer_id_from_node_key;
use tss_network::Messenger;
use tss_storage::{KeygenLocalState, LocalStateManager};

use crate::blame::{Blame, BLAME_TSS_COORDINATOR, TSS_SYNC_FAIL};
use crate::error::{EngineError, SessionError};
use crate::join_party::{form_party, FormPartyError};
use crate::keygen::generate_key;
use crate::keysign::sign_messages;
use crate::mpc::{PartyBackend, SignatureRecord};
use crate::notifier::SignatureNotifier;
use crate::roster::{PartyRoster, RosterError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenRequest {
    /// Node keys of every keygen participant, this node included.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenResponse {
    pub pub_key: String,
    pub status: Status,
    #[serde(default)]
    pub blame: Blame,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignRequest {
    pub pool_pub_key: String,
    pub signer_pub_keys: Vec<String>,
    /// Base64-encoded messages to sign.
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    /// Base64 of the signed message.
    pub msg: String,
    pub r: String,
    pub s: String,
}

impl Signature {
    fn from_record(record: &SignatureRecord) -> Self {
        Self {
            msg: BASE64.encode(&record.m),
            r: BASE64.encode(&record.r),
            s: BASE64.encode(&record.s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysignResponse {
    pub signatures: Vec<Signature>,
    pub status: Status,
    #[serde(default)]
    pub blame: Blame,
}

/// Rolling counters over the node's lifetime.
#[derive(Debug, Default)]
pub struct ServerStatus {
    pub succ_keygen: AtomicU64,
    pub failed_keygen: AtomicU64,
    pub succ_keysign: AtomicU64,
    pub failed_keysign: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub succ_keygen: u64,
    pub failed_keygen: u64,
    pub succ_keysign: u64,
    pub failed_keysign: u64,
}

pub struct TssServer<M: Messenger> {
    conf: TssConfig,
    messenger: Arc<M>,
    storage: Arc<dyn LocalStateManager>,
    backend: Arc<dyn PartyBackend>,
    notifier: SignatureNotifier<M>,
    local_node_key: String,
    stop_tx: watch::Sender<bool>,
    status: ServerStatus,
}

impl<M: Messenger> TssServer<M> {
    pub fn new(
        conf: TssConfig,
        messenger: Arc<M>,
        storage: Arc<dyn LocalStateManager>,
        backend: Arc<dyn PartyBackend>,
        local_node_key: String,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            conf,
            notifier: SignatureNotifier::new(messenger.clone()),
            messenger,
            storage,
            backend,
            local_node_key,
            stop_tx,
            status: ServerStatus::default(),
        }
    }

    pub fn local_node_key(&self) -> &str {
        &self.local_node_key
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.messenger.local_peer_id()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            succ_keygen: self.status.succ_keygen.load(AtomicOrdering::Relaxed),
            failed_keygen: self.status.failed_keygen.load(AtomicOrdering::Relaxed),
            succ_keysign: self.status.succ_keysign.load(AtomicOrdering::Relaxed),
            failed_keysign: self.status.failed_keysign.load(AtomicOrdering::Relaxed),
        }
    }

    /// Cancel every in-flight session; they unwind within one deadline.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run distributed key generation with the given participant set.
    pub async fn keygen(&self, req: KeygenRequest) -> Result<KeygenResponse, EngineError> {
        if req.keys.len() < 2 {
            return Err(EngineError::InvalidRequest(
                "keygen needs at least two participants".to_string(),
            ));
        }
        let msg_id = keygen_session_id(&req.keys);
        info!("keygen request for {} participants, session {}", req.keys.len(), msg_id);

        let roster = self.roster_for(&req.keys)?;
        let threshold = threshold(roster.len())
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;

        // Subscribe ahead of party formation: a fast peer's first round
        // frame may arrive before our own barrier call returns.
        let inbound = self.messenger.subscribe(&crate::keygen::SUBSCRIPTIONS, &msg_id);
        let result = self.keygen_session(&msg_id, &roster, threshold, inbound).await;
        self.messenger.unsubscribe(&crate::keygen::SUBSCRIPTIONS, &msg_id);
        result
    }

    async fn keygen_session(
        &self,
        msg_id: &str,
        roster: &PartyRoster,
        threshold: usize,
        inbound: tokio::sync::mpsc::Receiver<tss_network::messages::InboundMessage>,
    ) -> Result<KeygenResponse, EngineError> {
        let quorum = match form_party(
            &self.messenger,
            msg_id,
            roster.peers(),
            threshold,
            self.conf.keygen_timeout,
        )
        .await
        {
            Ok(quorum) => quorum,
            Err(e) => {
                self.status.failed_keygen.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(KeygenResponse {
                    pub_key: String::new(),
                    status: Status::Fail,
                    blame: self.join_party_blame(roster, e),
                });
            }
        };

        // Keygen needs every participant, not just a signing quorum.
        let absent: Vec<PeerId> = roster
            .peers()
            .iter()
            .filter(|p| !quorum.contains(p))
            .copied()
            .collect();
        if !absent.is_empty() {
            warn!("keygen {}: {} participants never joined", msg_id, absent.len());
            self.status.failed_keygen.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(KeygenResponse {
                pub_key: String::new(),
                status: Status::Fail,
                blame: Blame::new(TSS_SYNC_FAIL, self.node_keys_of(roster, &absent), false),
            });
        }

        match generate_key(
            &self.messenger,
            &self.backend,
            roster,
            threshold,
            msg_id,
            self.conf.keygen_timeout,
            inbound,
            self.stop_tx.subscribe(),
        )
        .await
        {
            Ok(output) => {
                let pub_key = hex::encode(&output.pub_key);
                self.storage.save_local_state(&KeygenLocalState {
                    pub_key: pub_key.clone(),
                    participant_keys: roster.node_keys().to_vec(),
                    local_party_key: self.local_node_key.clone(),
                    local_data: output.local_data,
                })?;
                self.save_address_book().await;

                self.status.succ_keygen.fetch_add(1, AtomicOrdering::Relaxed);
                info!("keygen {} complete, pool key {}", msg_id, pub_key);
                Ok(KeygenResponse {
                    pub_key,
                    status: Status::Success,
                    blame: Blame::default(),
                })
            }
            Err(e) => self.map_session_failure(e, &self.status.failed_keygen).map(|blame| {
                KeygenResponse {
                    pub_key: String::new(),
                    status: Status::Fail,
                    blame,
                }
            }),
        }
    }

    /// Sign a batch of messages under the given pool key.
    pub async fn keysign(&self, req: KeysignRequest) -> Result<KeysignResponse, EngineError> {
        if req.messages.is_empty() {
            return Err(EngineError::InvalidRequest("no messages to sign".to_string()));
        }
        if req.signer_pub_keys.is_empty() {
            return Err(EngineError::InvalidRequest("empty signer pub keys".to_string()));
        }

        let msg_id = keysign_session_id(&req.signer_pub_keys, &req.messages);
        info!(
            "keysign request: pool {}, {} signers, {} messages, session {}",
            req.pool_pub_key,
            req.signer_pub_keys.len(),
            req.messages.len(),
            msg_id
        );

        let mut messages = Vec::with_capacity(req.messages.len());
        for raw in &req.messages {
            let decoded = BASE64
                .decode(raw)
                .map_err(|e| EngineError::InvalidRequest(format!("message is not base64: {}", e)))?;
            messages.push(decoded);
        }

        let local_state = self.storage.get_local_state(&req.pool_pub_key)?;
        let threshold = threshold(local_state.participant_keys.len())
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        if req.signer_pub_keys.len() <= threshold {
            return Err(EngineError::NotEnoughSigners {
                threshold,
                signers: req.signer_pub_keys.len(),
            });
        }

        // Peers holding the key share, whether or not they sign this batch.
        let participants = self.peers_of(&local_state.participant_keys);

        if !req.signer_pub_keys.contains(&self.local_node_key) {
            info!("not selected for this signing quorum, waiting for the notifier");
            let sigs = self
                .notifier
                .wait_for_signature(&msg_id, 2 * self.conf.keysign_timeout)
                .await
                .map_err(|e| EngineError::SignatureNotObtained(e.to_string()))?;
            return Ok(self.success_response(sigs));
        }

        let roster = self.roster_for(&req.signer_pub_keys)?;

        let inbound = self.messenger.subscribe(&crate::keysign::SUBSCRIPTIONS, &msg_id);
        let result = self
            .keysign_session(
                &msg_id,
                &roster,
                threshold,
                &messages,
                &local_state,
                participants,
                inbound,
            )
            .await;
        self.messenger.unsubscribe(&crate::keysign::SUBSCRIPTIONS, &msg_id);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn keysign_session(
        &self,
        msg_id: &str,
        roster: &PartyRoster,
        threshold: usize,
        messages: &[Vec<u8>],
        local_state: &KeygenLocalState,
        participants: Vec<PeerId>,
        inbound: tokio::sync::mpsc::Receiver<tss_network::messages::InboundMessage>,
    ) -> Result<KeysignResponse, EngineError> {
        let quorum = match form_party(
            &self.messenger,
            msg_id,
            roster.peers(),
            threshold,
            self.conf.keysign_timeout,
        )
        .await
        {
            Ok(quorum) => quorum,
            Err(e) => {
                self.notifier.broadcast_failure(msg_id, participants).await;
                self.status.failed_keysign.fetch_add(1, AtomicOrdering::Relaxed);
                return Ok(KeysignResponse {
                    signatures: Vec::new(),
                    status: Status::Fail,
                    blame: self.join_party_blame(roster, e),
                });
            }
        };

        let absent: Vec<PeerId> = roster
            .peers()
            .iter()
            .filter(|p| !quorum.contains(p))
            .copied()
            .collect();
        if !absent.is_empty() {
            warn!("keysign {}: {} signers never joined", msg_id, absent.len());
            self.notifier.broadcast_failure(msg_id, participants).await;
            self.status.failed_keysign.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(KeysignResponse {
                signatures: Vec::new(),
                status: Status::Fail,
                blame: Blame::new(TSS_SYNC_FAIL, self.node_keys_of(roster, &absent), false),
            });
        }

        match sign_messages(
            &self.messenger,
            &self.backend,
            roster,
            threshold,
            msg_id,
            self.conf.keysign_timeout,
            messages,
            local_state,
            inbound,
            self.stop_tx.subscribe(),
        )
        .await
        {
            Ok(sigs) => {
                self.notifier
                    .broadcast_signature(msg_id, &sigs, participants)
                    .await;
                self.save_address_book().await;
                self.status.succ_keysign.fetch_add(1, AtomicOrdering::Relaxed);
                info!("keysign {} complete with {} signatures", msg_id, sigs.len());
                Ok(self.success_response(sigs))
            }
            Err(e) => {
                self.notifier.broadcast_failure(msg_id, participants).await;
                self.map_session_failure(e, &self.status.failed_keysign)
                    .map(|blame| KeysignResponse {
                        signatures: Vec::new(),
                        status: Status::Fail,
                        blame,
                    })
            }
        }
    }

    fn success_response(&self, mut sigs: Vec<SignatureRecord>) -> KeysignResponse {
        sigs.sort_by(|a, b| cmp_big_endian(&a.m, &b.m));
        KeysignResponse {
            signatures: sigs.iter().map(Signature::from_record).collect(),
            status: Status::Success,
            blame: Blame::default(),
        }
    }

    fn roster_for(&self, keys: &[String]) -> Result<PartyRoster, EngineError> {
        PartyRoster::new(keys, &self.local_node_key).map_err(|e| match e {
            RosterError::LocalKeyMissing(_) => EngineError::NotInParty,
            other => EngineError::InvalidRequest(other.to_string()),
        })
    }

    fn join_party_blame(&self, roster: &PartyRoster, err: FormPartyError) -> Blame {
        match err {
            FormPartyError::LeaderUnreachable { leader } => {
                let node = self.node_keys_of(roster, &[leader]);
                Blame::new(BLAME_TSS_COORDINATOR, node, false)
            }
            FormPartyError::Incomplete { leader, responders } => {
                let missing: Vec<PeerId> = roster
                    .peers()
                    .iter()
                    .filter(|p| !responders.contains(p))
                    .copied()
                    .collect();
                let mut blame = Blame::new(TSS_SYNC_FAIL, self.node_keys_of(roster, &missing), false);
                // The coordinator carries responsibility for the failed
                // barrier as well.
                blame.add_nodes(self.node_keys_of(roster, &[leader]));
                blame
            }
        }
    }

    fn map_session_failure(
        &self,
        err: SessionError,
        counter: &AtomicU64,
    ) -> Result<Blame, EngineError> {
        match err {
            SessionError::Timeout(blame) | SessionError::Abort(blame) => {
                counter.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(blame)
            }
            SessionError::Cancelled => Err(EngineError::Cancelled),
            SessionError::Party(reason) => {
                error!("local party failure: {}", reason);
                Err(EngineError::Internal(reason))
            }
        }
    }

    fn node_keys_of(&self, roster: &PartyRoster, peers: &[PeerId]) -> Vec<String> {
        peers
            .iter()
            .filter_map(|p| roster.index_of_peer(p))
            .filter_map(|i| roster.node_key(i))
            .map(|s| s.to_string())
            .collect()
    }

    fn peers_of(&self, node_keys: &[String]) -> Vec<PeerId> {
        node_keys
            .iter()
            .filter_map(|k| match peer_id_from_node_key(k) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    warn!("cannot derive peer id for participant {}: {}", k, e);
                    None
                }
            })
            .collect()
    }

    async fn save_address_book(&self) {
        let addresses = self.messenger.peer_addresses().await;
        if addresses.is_empty() {
            return;
        }
        if let Err(e) = self.storage.save_address_book(&addresses) {
            warn!("failed to persist the peer address book: {}", e);
        }
    }
}

/// Compare two byte strings as unsigned big-endian integers.
fn cmp_big_endian(a: &[u8], b: &[u8]) -> Ordering {
    let a = strip_leading_zeros(a);
    let b = strip_leading_zeros(b);
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_ordering_ignores_leading_zeros() {
        assert_eq!(cmp_big_endian(&[0, 0, 5], &[5]), Ordering::Equal);
        assert_eq!(cmp_big_endian(&[1, 0], &[0xff]), Ordering::Greater);
        assert_eq!(cmp_big_endian(&[2], &[1, 0]), Ordering::Less);
        assert_eq!(cmp_big_endian(&[], &[0]), Ordering::Equal);
    }

    #[test]
    fn signatures_sort_ascending_by_message_value() {
        let records = vec![
            SignatureRecord {
                m: vec![9, 9],
                r: vec![],
                s: vec![],
            },
            SignatureRecord {
                m: vec![1],
                r: vec![],
                s: vec![],
            },
            SignatureRecord {
                m: vec![0, 0xff],
                r: vec![],
                s: vec![],
            },
        ];
        let mut sorted = records.clone();
        sorted.sort_by(|a, b| cmp_big_endian(&a.m, &b.m));
        assert_eq!(sorted[0].m, vec![1]);
        assert_eq!(sorted[1].m, vec![0, 0xff]);
        assert_eq!(sorted[2].m, vec![9, 9]);
    }
}
