//! Round relay: the bridge between the MPC parties and the network.
//!
//! Outbound party messages are wrapped into a confirm envelope carrying the
//! sender, round tag and payload hash. Inbound frames are deduplicated on
//! `(round, sender, moniker)`; the first payload wins and a conflicting hash
//! is an equivocation that aborts the session. Broadcast payloads are held
//! back until `threshold + 1` peers corroborated the same hash through
//! verify echoes, so an equivocating sender cannot split the honest
//! parties' views. Unicasts deliver immediately.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use tss_common::ids::payload_hash;
use tss_network::messages::{base64_bytes, InboundMessage, MessageType, WrappedMessage};
use tss_network::Messenger;

use crate::blame::BlameTable;
use crate::error::SessionError;
use crate::mpc::{OutboundPartyMessage, PartyHandle, RoundInfo};
use crate::roster::PartyRoster;

/// How long to wait for the rest of the quorum to report task completion.
pub const TASK_DONE_LINGER: Duration = Duration::from_secs(5);

/// Envelope around one MPC-round payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfirmMessage {
    pub from: u16,
    pub round_tag: String,
    pub moniker: String,
    /// SHA-256 hex of `payload`; the commitment the confirmation protocol
    /// corroborates.
    pub hash: String,
    pub is_broadcast: bool,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Echo confirming which hash a peer saw for one broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyMessage {
    pub origin: u16,
    pub round_tag: String,
    pub moniker: String,
    pub hash: String,
}

/// Static parameters of one relay run.
pub struct SessionRuntime<'a, M: Messenger> {
    pub messenger: &'a Arc<M>,
    pub roster: &'a PartyRoster,
    pub threshold: usize,
    pub msg_id: &'a str,
    pub main_type: MessageType,
    pub verify_type: MessageType,
    pub timeout: Duration,
    pub rounds: &'static [RoundInfo],
}

type MsgKey = (String, u16, String);
type ConfirmKey = (String, u16, String, String);

struct RelayState {
    /// First-seen hash per `(round, from, moniker)`.
    dedup: HashMap<MsgKey, String>,
    /// Broadcast payloads awaiting confirmation.
    pending: HashMap<MsgKey, Vec<u8>>,
    /// Peers corroborating `(round, origin, moniker, hash)`.
    confirmations: HashMap<ConfirmKey, HashSet<u16>>,
    delivered: HashSet<MsgKey>,
    done_peers: HashSet<u16>,
}

/// Drive one session to completion.
///
/// Every party's `Start` is issued before any inbound message is delivered.
/// The run ends when `expected_ends` artifacts arrived, the deadline fired
/// (timeout verdict), a peer equivocated (abort verdict), or the node is
/// shutting down.
#[allow(clippy::too_many_arguments)]
pub async fn run_session<M: Messenger, E>(
    rt: SessionRuntime<'_, M>,
    parties: HashMap<String, PartyHandle>,
    mut out_rx: mpsc::Receiver<OutboundPartyMessage>,
    mut end_rx: mpsc::Receiver<E>,
    expected_ends: usize,
    mut inbound: mpsc::Receiver<InboundMessage>,
    blame: &mut BlameTable,
    mut stop: watch::Receiver<bool>,
) -> Result<Vec<E>, SessionError> {
    for party in parties.values() {
        party.start().await;
    }

    let mut state = RelayState {
        dedup: HashMap::new(),
        pending: HashMap::new(),
        confirmations: HashMap::new(),
        delivered: HashSet::new(),
        done_peers: HashSet::new(),
    };
    let mut artifacts = Vec::with_capacity(expected_ends);

    let deadline = tokio::time::Instant::now() + rt.timeout;
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    // Closed party channels disarm their select branches; a dead party
    // surfaces through the deadline, not a spin.
    let mut out_open = true;
    let mut end_open = true;

    loop {
        tokio::select! {
            maybe_out = out_rx.recv(), if out_open => {
                match maybe_out {
                    Some(out) => relay_outbound(&rt, blame, out).await?,
                    None => out_open = false,
                }
            }
            maybe_end = end_rx.recv(), if end_open => {
                match maybe_end {
                    Some(artifact) => {
                        artifacts.push(artifact);
                        if artifacts.len() == expected_ends {
                            break;
                        }
                    }
                    None => end_open = false,
                }
            }
            maybe_in = inbound.recv() => {
                match maybe_in {
                    Some(msg) => handle_inbound(&rt, blame, &mut state, &parties, msg).await?,
                    None => return Err(SessionError::Cancelled),
                }
            }
            _ = &mut sleep => {
                warn!("session {} timed out after {:?}", rt.msg_id, rt.timeout);
                return Err(SessionError::Timeout(
                    blame.timeout_verdict(rt.rounds, rt.threshold),
                ));
            }
            _ = stop.changed() => return Err(SessionError::Cancelled),
        }
    }

    info!("session {} produced all {} artifacts", rt.msg_id, expected_ends);
    notify_task_done(&rt).await;
    linger_for_task_done(&rt, &mut state, &mut inbound, &mut stop).await;

    Ok(artifacts)
}

/// Wrap one party message and put it on the wire.
async fn relay_outbound<M: Messenger>(
    rt: &SessionRuntime<'_, M>,
    blame: &mut BlameTable,
    out: OutboundPartyMessage,
) -> Result<(), SessionError> {
    let local = rt.roster.local_index();
    let hash = payload_hash(&out.bytes);

    let confirm = BroadcastConfirmMessage {
        from: local,
        round_tag: out.round_tag.clone(),
        moniker: out.moniker.clone(),
        hash: hash.clone(),
        is_broadcast: out.is_broadcast,
        payload: out.bytes,
    };
    let payload = serde_json::to_vec(&confirm)
        .map_err(|e| SessionError::Party(format!("encode confirm message: {}", e)))?;
    let wrapped = WrappedMessage::new(rt.main_type, rt.msg_id, payload);

    blame.set_last_outbound(&out.round_tag, out.is_broadcast);

    if out.is_broadcast {
        // Our own commitment is evidence too.
        blame.record_broadcast(&out.round_tag, local, &hash);
        rt.messenger
            .broadcast(rt.roster.peers_excluding_self(), wrapped)
            .await;
    } else {
        for index in out.to {
            if index == local {
                continue;
            }
            match rt.roster.peer(index) {
                Some(peer) => rt.messenger.send_to_peer(peer, wrapped.clone()).await,
                None => warn!("party index {} has no peer in this session", index),
            }
        }
    }
    Ok(())
}

async fn handle_inbound<M: Messenger>(
    rt: &SessionRuntime<'_, M>,
    blame: &mut BlameTable,
    state: &mut RelayState,
    parties: &HashMap<String, PartyHandle>,
    msg: InboundMessage,
) -> Result<(), SessionError> {
    let Some(wire_index) = rt.roster.index_of_peer(&msg.peer) else {
        debug!("frame from {} who is not in this session, dropping", msg.peer);
        return Ok(());
    };

    match msg.wrapped.message_type {
        t if t == rt.main_type => {
            handle_round_message(rt, blame, state, parties, wire_index, &msg.wrapped.payload).await
        }
        t if t == rt.verify_type => {
            handle_verify_message(rt, blame, state, parties, wire_index, &msg.wrapped.payload).await
        }
        MessageType::TssTaskDone => {
            state.done_peers.insert(wire_index);
            Ok(())
        }
        other => {
            debug!("unexpected {} frame inside session {}", other, rt.msg_id);
            Ok(())
        }
    }
}

async fn handle_round_message<M: Messenger>(
    rt: &SessionRuntime<'_, M>,
    blame: &mut BlameTable,
    state: &mut RelayState,
    parties: &HashMap<String, PartyHandle>,
    wire_index: u16,
    payload: &[u8],
) -> Result<(), SessionError> {
    let confirm: BroadcastConfirmMessage = match serde_json::from_slice(payload) {
        Ok(c) => c,
        Err(e) => {
            warn!("malformed round message from party {}: {}", wire_index, e);
            return Ok(());
        }
    };
    if confirm.from != wire_index {
        warn!(
            "party {} claims to be {}, dropping frame",
            wire_index, confirm.from
        );
        return Ok(());
    }

    let key: MsgKey = (
        confirm.round_tag.clone(),
        confirm.from,
        confirm.moniker.clone(),
    );

    if let Some(first_hash) = state.dedup.get(&key) {
        if *first_hash == confirm.hash {
            debug!(
                "duplicate {} message from party {}, ignoring",
                confirm.round_tag, confirm.from
            );
            return Ok(());
        }
        warn!(
            "party {} equivocated in round {}: {} vs {}",
            confirm.from, confirm.round_tag, first_hash, confirm.hash
        );
        return Err(SessionError::Abort(blame.record_equivocation(confirm.from)));
    }
    state.dedup.insert(key.clone(), confirm.hash.clone());

    if !confirm.is_broadcast {
        blame.record_unicast(&confirm.round_tag, confirm.from);
        state.delivered.insert(key);
        deliver(parties, &confirm.moniker, confirm.from, &confirm.round_tag, confirm.payload).await;
        return Ok(());
    }

    // A verify echo that arrived ahead of the payload may already disagree.
    for ((round, origin, moniker, hash), _) in state.confirmations.iter() {
        if *round == confirm.round_tag
            && *origin == confirm.from
            && *moniker == confirm.moniker
            && *hash != confirm.hash
        {
            warn!(
                "earlier echoes for round {} disagree with payload from party {}",
                confirm.round_tag, confirm.from
            );
            return Err(SessionError::Abort(blame.record_equivocation(confirm.from)));
        }
    }

    blame.record_broadcast(&confirm.round_tag, confirm.from, &confirm.hash);
    state.pending.insert(key.clone(), confirm.payload);

    let confirm_key: ConfirmKey = (
        confirm.round_tag.clone(),
        confirm.from,
        confirm.moniker.clone(),
        confirm.hash.clone(),
    );
    let witnesses = state.confirmations.entry(confirm_key).or_default();
    // The sender vouches for its own payload, and we just saw it ourselves.
    witnesses.insert(confirm.from);
    witnesses.insert(rt.roster.local_index());

    let echo = VerifyMessage {
        origin: confirm.from,
        round_tag: confirm.round_tag.clone(),
        moniker: confirm.moniker.clone(),
        hash: confirm.hash.clone(),
    };
    let echo_payload = serde_json::to_vec(&echo)
        .map_err(|e| SessionError::Party(format!("encode verify message: {}", e)))?;
    rt.messenger
        .broadcast(
            rt.roster.peers_excluding_self(),
            WrappedMessage::new(rt.verify_type, rt.msg_id, echo_payload),
        )
        .await;

    try_deliver(rt, state, parties, &key).await;
    Ok(())
}

async fn handle_verify_message<M: Messenger>(
    rt: &SessionRuntime<'_, M>,
    blame: &mut BlameTable,
    state: &mut RelayState,
    parties: &HashMap<String, PartyHandle>,
    echoer: u16,
    payload: &[u8],
) -> Result<(), SessionError> {
    let verify: VerifyMessage = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed verify message from party {}: {}", echoer, e);
            return Ok(());
        }
    };
    if verify.origin == rt.roster.local_index() {
        // Peers confirming our own broadcast; nothing to deliver locally.
        return Ok(());
    }

    // If we already hold the origin's payload under a different hash, the
    // origin told different peers different things.
    if let Some(recorded) = blame.broadcast_hash(&verify.round_tag, verify.origin) {
        if recorded != verify.hash {
            warn!(
                "party {} echoes hash {} for round {} but party {} sent us {}",
                echoer, verify.hash, verify.round_tag, verify.origin, recorded
            );
            return Err(SessionError::Abort(blame.record_equivocation(verify.origin)));
        }
    }

    let confirm_key: ConfirmKey = (
        verify.round_tag.clone(),
        verify.origin,
        verify.moniker.clone(),
        verify.hash.clone(),
    );
    state.confirmations.entry(confirm_key).or_default().insert(echoer);

    let key: MsgKey = (verify.round_tag, verify.origin, verify.moniker);
    try_deliver(rt, state, parties, &key).await;
    Ok(())
}

/// Deliver a held broadcast once `threshold + 1` peers corroborate it.
async fn try_deliver<M: Messenger>(
    rt: &SessionRuntime<'_, M>,
    state: &mut RelayState,
    parties: &HashMap<String, PartyHandle>,
    key: &MsgKey,
) {
    if state.delivered.contains(key) || !state.pending.contains_key(key) {
        return;
    }
    let Some(hash) = state.dedup.get(key) else {
        return;
    };

    let confirm_key: ConfirmKey = (key.0.clone(), key.1, key.2.clone(), hash.clone());
    let witnesses = state
        .confirmations
        .get(&confirm_key)
        .map(|s| s.len())
        .unwrap_or(0);
    if witnesses < rt.threshold + 1 {
        return;
    }

    state.delivered.insert(key.clone());
    if let Some(payload) = state.pending.remove(key) {
        deliver(parties, &key.2, key.1, &key.0, payload).await;
    }
}

async fn deliver(
    parties: &HashMap<String, PartyHandle>,
    moniker: &str,
    from: u16,
    round_tag: &str,
    payload: Vec<u8>,
) {
    match parties.get(moniker) {
        Some(party) => party.update(from, round_tag, payload).await,
        None => warn!("no local party with moniker {:?}, dropping update", moniker),
    }
}

/// Tell the quorum we are done.
async fn notify_task_done<M: Messenger>(rt: &SessionRuntime<'_, M>) {
    let wrapped = WrappedMessage::new(MessageType::TssTaskDone, rt.msg_id, Vec::new());
    rt.messenger
        .broadcast(rt.roster.peers_excluding_self(), wrapped)
        .await;
}

/// Best-effort wait for the rest of the quorum to finish before tearing
/// the session down, so late verify echoes still find a subscriber.
async fn linger_for_task_done<M: Messenger>(
    rt: &SessionRuntime<'_, M>,
    state: &mut RelayState,
    inbound: &mut mpsc::Receiver<InboundMessage>,
    stop: &mut watch::Receiver<bool>,
) {
    let all_others = rt.roster.len() - 1;
    let deadline = tokio::time::Instant::now() + TASK_DONE_LINGER;
    while state.done_peers.len() < all_others {
        tokio::select! {
            maybe_in = inbound.recv() => {
                match maybe_in {
                    Some(msg) => {
                        if msg.wrapped.message_type == MessageType::TssTaskDone {
                            if let Some(idx) = rt.roster.index_of_peer(&msg.peer) {
                                state.done_peers.insert(idx);
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = stop.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirm_envelope_round_trips() {
        let msg = BroadcastConfirmMessage {
            from: 2,
            round_tag: "keysign.round1".to_string(),
            moniker: "ab:0".to_string(),
            hash: payload_hash(b"round bytes"),
            is_broadcast: true,
            payload: b"round bytes".to_vec(),
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: BroadcastConfirmMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.from, 2);
        assert_eq!(back.hash, msg.hash);
        assert_eq!(back.payload, msg.payload);
        assert_eq!(back.hash, payload_hash(&back.payload));
    }

    #[test]
    fn verify_echo_is_compact_json() {
        let echo = VerifyMessage {
            origin: 1,
            round_tag: "keygen.round3".to_string(),
            moniker: String::new(),
            hash: "aa".repeat(32),
        };
        let bytes = serde_json::to_vec(&echo).unwrap();
        let back: VerifyMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.origin, 1);
        assert_eq!(back.hash, echo.hash);
    }
}
