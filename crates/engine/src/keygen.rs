//! Keygen session driver: one MPC party, one artifact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use tss_network::messages::{InboundMessage, MessageType};
use tss_network::Messenger;

use crate::blame::BlameTable;
use crate::error::SessionError;
use crate::mpc::{KeygenOutput, PartyBackend, PartyContext};
use crate::relay::{run_session, SessionRuntime};
use crate::roster::PartyRoster;

/// Message types a keygen session subscribes to. The subscription is set up
/// by the orchestrator before party formation so no early round frame is
/// dropped.
pub const SUBSCRIPTIONS: [MessageType; 3] = [
    MessageType::TssKeygen,
    MessageType::TssKeygenVerify,
    MessageType::TssTaskDone,
];

/// Run distributed key generation with the full participant set.
pub async fn generate_key<M: Messenger>(
    messenger: &Arc<M>,
    backend: &Arc<dyn PartyBackend>,
    roster: &PartyRoster,
    threshold: usize,
    msg_id: &str,
    timeout: Duration,
    inbound: mpsc::Receiver<InboundMessage>,
    stop: watch::Receiver<bool>,
) -> Result<KeygenOutput, SessionError> {
    let n = roster.len();
    let (out_tx, out_rx) = mpsc::channel(2 * n);
    let (end_tx, end_rx) = mpsc::channel(n);

    let ctx = PartyContext {
        node_keys: roster.node_keys().to_vec(),
        local_index: roster.local_index(),
        threshold,
        moniker: String::new(),
        message: None,
        local_data: None,
    };
    let party = backend.new_keygen_party(ctx, out_tx, end_tx);
    let mut parties = HashMap::new();
    parties.insert(party.moniker.clone(), party);

    let mut blame = BlameTable::new(roster.clone());
    let rt = SessionRuntime {
        messenger,
        roster,
        threshold,
        msg_id,
        main_type: MessageType::TssKeygen,
        verify_type: MessageType::TssKeygenVerify,
        timeout,
        rounds: backend.keygen_rounds(),
    };

    run_session(rt, parties, out_rx, end_rx, 1, inbound, &mut blame, stop)
        .await
        .map(|mut outputs| outputs.remove(0))
}
