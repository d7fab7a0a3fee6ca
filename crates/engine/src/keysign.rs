//! Keysign session driver.
//!
//! Batch signing runs one MPC sub-party per message. The sub-parties share
//! one subscription and one pair of channels; the moniker
//! `hex(hash(msg)):index` inside every envelope selects which party an
//! update belongs to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};

use tss_network::messages::{InboundMessage, MessageType};
use tss_network::Messenger;
use tss_storage::KeygenLocalState;

use crate::blame::BlameTable;
use crate::error::SessionError;
use crate::mpc::{PartyBackend, PartyContext, SignatureRecord};
use crate::relay::{run_session, SessionRuntime};
use crate::roster::PartyRoster;

/// Message types a keysign session subscribes to. The subscription is set up
/// by the orchestrator before party formation so no early round frame is
/// dropped.
pub const SUBSCRIPTIONS: [MessageType; 3] = [
    MessageType::TssKeysign,
    MessageType::TssKeysignVerify,
    MessageType::TssTaskDone,
];

/// Deterministic sub-party label for the i-th message of a batch.
pub fn moniker_for(message: &[u8], index: usize) -> String {
    format!("{}:{}", hex::encode(Sha256::digest(message)), index)
}

/// Sign a batch of messages with the agreed signer set.
#[allow(clippy::too_many_arguments)]
pub async fn sign_messages<M: Messenger>(
    messenger: &Arc<M>,
    backend: &Arc<dyn PartyBackend>,
    roster: &PartyRoster,
    threshold: usize,
    msg_id: &str,
    timeout: Duration,
    messages: &[Vec<u8>],
    local_state: &KeygenLocalState,
    inbound: mpsc::Receiver<InboundMessage>,
    stop: watch::Receiver<bool>,
) -> Result<Vec<SignatureRecord>, SessionError> {
    let n = roster.len();
    let batch = messages.len();
    let (out_tx, out_rx) = mpsc::channel(2 * n * batch);
    let (end_tx, end_rx) = mpsc::channel(n * batch);

    let mut parties = HashMap::with_capacity(batch);
    for (index, message) in messages.iter().enumerate() {
        let ctx = PartyContext {
            node_keys: roster.node_keys().to_vec(),
            local_index: roster.local_index(),
            threshold,
            moniker: moniker_for(message, index),
            message: Some(message.clone()),
            local_data: Some(local_state.local_data.clone()),
        };
        let party = backend.new_keysign_party(ctx, out_tx.clone(), end_tx.clone());
        parties.insert(party.moniker.clone(), party);
    }
    drop(out_tx);
    drop(end_tx);

    let mut blame = BlameTable::new(roster.clone());
    let rt = SessionRuntime {
        messenger,
        roster,
        threshold,
        msg_id,
        main_type: MessageType::TssKeysign,
        verify_type: MessageType::TssKeysignVerify,
        timeout,
        rounds: backend.keysign_rounds(),
    };

    run_session(rt, parties, out_rx, end_rx, batch, inbound, &mut blame, stop).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monikers_are_unique_per_message_and_index() {
        let a = moniker_for(b"msg-a", 0);
        let b = moniker_for(b"msg-b", 1);
        let a_again = moniker_for(b"msg-a", 0);
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        // Same bytes at a different batch position is a distinct party.
        assert_ne!(moniker_for(b"msg-a", 0), moniker_for(b"msg-a", 1));
    }
}
