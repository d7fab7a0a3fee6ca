//! Signature notifier: out-of-band fan-out of final signatures.
//!
//! Key-share holders that were not picked for a signing quorum still need
//! the result. They wait under the `SignatureNotifier` message type; the
//! quorum pushes the signatures on success and an explicit failure frame on
//! failure so waiters abort promptly instead of running out their timeout.

use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tss_common::Status;
use tss_network::messages::{MessageType, WrappedMessage};
use tss_network::Messenger;

use crate::mpc::SignatureRecord;

/// Frame pushed to waiting peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierPayload {
    pub status: Status,
    pub signatures: Vec<SignatureRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("no signature notification arrived within {0:?}")]
    Timeout(Duration),
    #[error("the signing quorum reported failure")]
    KeysignFailed,
    #[error("malformed notification: {0}")]
    Malformed(String),
}

pub struct SignatureNotifier<M> {
    messenger: Arc<M>,
}

impl<M: Messenger> SignatureNotifier<M> {
    pub fn new(messenger: Arc<M>) -> Self {
        Self { messenger }
    }

    /// Wait for the quorum's notification for `msg_id`.
    pub async fn wait_for_signature(
        &self,
        msg_id: &str,
        timeout: Duration,
    ) -> Result<Vec<SignatureRecord>, NotifierError> {
        let types = [MessageType::SignatureNotifier];
        let mut rx = self.messenger.subscribe(&types, msg_id);

        let result = tokio::time::timeout(timeout, async {
            while let Some(msg) = rx.recv().await {
                match serde_json::from_slice::<NotifierPayload>(&msg.wrapped.payload) {
                    Ok(payload) => return Some(payload),
                    Err(e) => {
                        warn!("malformed signature notification from {}: {}", msg.peer, e);
                    }
                }
            }
            None
        })
        .await;

        self.messenger.unsubscribe(&types, msg_id);

        match result {
            Err(_) => Err(NotifierError::Timeout(timeout)),
            Ok(None) => Err(NotifierError::Malformed("notifier channel closed".to_string())),
            Ok(Some(payload)) => match payload.status {
                Status::Success => {
                    info!(
                        "received {} signatures for session {}",
                        payload.signatures.len(),
                        msg_id
                    );
                    Ok(payload.signatures)
                }
                Status::Fail => Err(NotifierError::KeysignFailed),
            },
        }
    }

    /// Push the final signatures to every key-share holder.
    pub async fn broadcast_signature(
        &self,
        msg_id: &str,
        signatures: &[SignatureRecord],
        peers: Vec<PeerId>,
    ) {
        let payload = NotifierPayload {
            status: Status::Success,
            signatures: signatures.to_vec(),
        };
        self.push(msg_id, &payload, peers).await;
    }

    /// Tell waiters the signing failed so they abort promptly.
    pub async fn broadcast_failure(&self, msg_id: &str, peers: Vec<PeerId>) {
        let payload = NotifierPayload {
            status: Status::Fail,
            signatures: Vec::new(),
        };
        self.push(msg_id, &payload, peers).await;
    }

    async fn push(&self, msg_id: &str, payload: &NotifierPayload, peers: Vec<PeerId>) {
        let bytes = match serde_json::to_vec(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!("failed to encode signature notification: {}", e);
                return;
            }
        };
        let wrapped = WrappedMessage::new(MessageType::SignatureNotifier, msg_id, bytes);
        self.messenger.broadcast(peers, wrapped).await;
    }
}
