//! Party formation: a leader-elected barrier gathering the online quorum
//! before any MPC round starts.
//!
//! Discovery is eventually consistent, so a session first agrees on who is
//! actually present. The leader is a deterministic function of the candidate
//! set and the session id; followers check in over `/p2p/join-party` and the
//! leader answers every open stream with the same peer list. A silent leader
//! is blamed by every follower; a short quorum is blamed by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use tss_network::messages::{JoinPartyRequest, JoinPartyResponse, JoinPartyResult};
use tss_network::Messenger;

/// Why party formation failed.
#[derive(Debug)]
pub enum FormPartyError {
    /// The leader never answered; it owns the failure.
    LeaderUnreachable { leader: PeerId },
    /// The leader answered but the quorum was short; `responders` is who did
    /// check in.
    Incomplete {
        leader: PeerId,
        responders: Vec<PeerId>,
    },
}

/// Deterministic leader election: the candidate minimizing
/// `SHA-256(peer-id || session-id)`, compared lexicographically.
///
/// Total over any permutation of the candidate set, so every participant
/// elects the same leader without talking.
pub fn elect_leader(candidates: &[PeerId], session_id: &str) -> Option<PeerId> {
    candidates
        .iter()
        .min_by_key(|peer| {
            let mut hasher = Sha256::new();
            hasher.update(peer.to_bytes());
            hasher.update(session_id.as_bytes());
            hasher.finalize()
        })
        .copied()
}

/// Run the barrier and return the agreed participant set.
///
/// The leader replies `Success` the moment every candidate has checked in.
/// If the window closes first it still replies `Success` when at least
/// `threshold + 1` candidates (itself included) are present, and `Timeout`
/// with the peers seen otherwise.
pub async fn form_party<M: Messenger>(
    messenger: &Arc<M>,
    msg_id: &str,
    candidates: &[PeerId],
    threshold: usize,
    window: Duration,
) -> Result<Vec<PeerId>, FormPartyError> {
    let local = messenger.local_peer_id();
    let leader = elect_leader(candidates, msg_id).unwrap_or(local);

    if leader == local {
        lead(messenger, msg_id, candidates, threshold, window).await
    } else {
        follow(messenger, msg_id, leader, window).await
    }
}

async fn lead<M: Messenger>(
    messenger: &Arc<M>,
    msg_id: &str,
    candidates: &[PeerId],
    threshold: usize,
    window: Duration,
) -> Result<Vec<PeerId>, FormPartyError> {
    let local = messenger.local_peer_id();
    let mut rx = messenger.register_join_party(msg_id).await;
    let deadline = tokio::time::Instant::now() + window;

    // Open streams from followers, keyed by peer so a reconnect replaces the
    // stale stream.
    let mut open: HashMap<PeerId, oneshot::Sender<JoinPartyResponse>> = HashMap::new();
    let expected: Vec<PeerId> = candidates.iter().copied().filter(|p| *p != local).collect();

    let outcome = loop {
        if open.len() == expected.len() {
            break JoinPartyOutcome::Full;
        }
        tokio::select! {
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        if !expected.contains(&event.from) {
                            debug!("join-party request from non-candidate {}", event.from);
                            continue;
                        }
                        open.insert(event.from, event.reply);
                    }
                    None => break JoinPartyOutcome::Window,
                }
            }
            _ = tokio::time::sleep_until(deadline) => break JoinPartyOutcome::Window,
        }
    };

    let responders: Vec<PeerId> = open.keys().copied().collect();
    let quorum_size = responders.len() + 1;

    let result = match outcome {
        JoinPartyOutcome::Full => {
            info!("join-party {}: all {} candidates present", msg_id, candidates.len());
            Ok(sorted(candidates.to_vec()))
        }
        JoinPartyOutcome::Window if quorum_size >= threshold + 1 => {
            info!(
                "join-party {}: window closed with {} of {} candidates, quorum met",
                msg_id,
                quorum_size,
                candidates.len()
            );
            let mut quorum = responders.clone();
            quorum.push(local);
            Ok(sorted(quorum))
        }
        JoinPartyOutcome::Window => {
            warn!(
                "join-party {}: only {} of {} candidates checked in",
                msg_id,
                quorum_size,
                candidates.len()
            );
            let mut seen = responders.clone();
            seen.push(local);
            Err(sorted(seen))
        }
    };

    let response = match &result {
        Ok(quorum) => JoinPartyResponse::success(quorum.clone()),
        Err(seen) => JoinPartyResponse::timeout(seen.clone()),
    };
    for (_, reply) in open {
        let _ = reply.send(response.clone());
    }
    messenger.unregister_join_party(msg_id).await;

    match result {
        Ok(quorum) => Ok(quorum),
        Err(seen) => Err(FormPartyError::Incomplete {
            leader: local,
            responders: seen,
        }),
    }
}

enum JoinPartyOutcome {
    Full,
    Window,
}

async fn follow<M: Messenger>(
    messenger: &Arc<M>,
    msg_id: &str,
    leader: PeerId,
    window: Duration,
) -> Result<Vec<PeerId>, FormPartyError> {
    let request = JoinPartyRequest {
        msg_id: msg_id.to_string(),
    };
    match messenger.join_party(leader, request, window).await {
        Ok(response) => match response.result {
            JoinPartyResult::Success => Ok(sorted(response.peers())),
            JoinPartyResult::Timeout => Err(FormPartyError::Incomplete {
                leader,
                responders: response.peers(),
            }),
        },
        Err(e) => {
            warn!("join-party leader {} unreachable: {}", leader, e);
            Err(FormPartyError::LeaderUnreachable { leader })
        }
    }
}

fn sorted(mut peers: Vec<PeerId>) -> Vec<PeerId> {
    peers.sort();
    peers.dedup();
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_election_is_permutation_invariant() {
        let peers: Vec<PeerId> = (0..7).map(|_| PeerId::random()).collect();
        let leader = elect_leader(&peers, "session-a").unwrap();

        let mut reversed = peers.clone();
        reversed.reverse();
        assert_eq!(elect_leader(&reversed, "session-a").unwrap(), leader);

        let mut rotated = peers.clone();
        rotated.rotate_left(3);
        assert_eq!(elect_leader(&rotated, "session-a").unwrap(), leader);
    }

    #[test]
    fn leader_depends_on_the_session_id() {
        let peers: Vec<PeerId> = (0..16).map(|_| PeerId::random()).collect();
        // With 16 candidates it is overwhelmingly likely that at least one
        // of a handful of session ids elects a different leader.
        let leaders: std::collections::HashSet<PeerId> = (0..8)
            .map(|i| elect_leader(&peers, &format!("session-{}", i)).unwrap())
            .collect();
        assert!(leaders.len() > 1);
    }

    #[test]
    fn empty_candidate_set_has_no_leader() {
        assert!(elect_leader(&[], "session").is_none());
    }
}
