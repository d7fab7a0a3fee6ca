//! Blame assignment.
//!
//! During a session the relay feeds two evidence tables: who sent us their
//! unicast share per round, and who broadcast which commitment per round.
//! When a session fails, the tables are read back to name the peers
//! responsible. An accusation set larger than the threshold is inconclusive
//! and accuses no one.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::mpc::RoundInfo;
use crate::roster::PartyRoster;

pub const TSS_TIMEOUT: &str = "TssTimeout";
pub const TSS_SYNC_FAIL: &str = "TssSyncFail";
pub const HASH_INCONSISTENCY: &str = "HashInconsistency";
pub const BLAME_TSS_COORDINATOR: &str = "BlameTssCoordinator";
pub const MISSING_SHARE: &str = "MissingShare";
pub const BLAME_OVERFLOW: &str = "blame overflow";

/// Verdict naming the peers responsible for a failed session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: String,
    pub is_unicast: bool,
    /// Node keys of the accused peers.
    pub blame_nodes: Vec<String>,
}

impl Blame {
    pub fn new(reason: &str, nodes: Vec<String>, is_unicast: bool) -> Self {
        Self {
            fail_reason: reason.to_string(),
            is_unicast,
            blame_nodes: nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_empty() && self.blame_nodes.is_empty()
    }

    pub fn add_nodes(&mut self, nodes: impl IntoIterator<Item = String>) {
        for node in nodes {
            if !self.blame_nodes.contains(&node) {
                self.blame_nodes.push(node);
            }
        }
    }
}

/// What this node last put on the wire, consulted when a timeout fires
/// before any peer misbehaves visibly.
#[derive(Debug, Clone)]
pub struct LastOutbound {
    pub round_tag: String,
    pub is_broadcast: bool,
}

/// Per-session evidence tables, single-writer once the session is running.
pub struct BlameTable {
    roster: PartyRoster,
    /// round tag -> parties whose unicast share reached us.
    unicast_evidence: HashMap<String, HashSet<u16>>,
    /// round tag -> party -> broadcast commitment hash.
    broadcast_evidence: HashMap<String, HashMap<u16, String>>,
    last_outbound: Option<LastOutbound>,
    /// Set eagerly on equivocation; wins over any later analysis.
    verdict: Option<Blame>,
}

impl BlameTable {
    pub fn new(roster: PartyRoster) -> Self {
        Self {
            roster,
            unicast_evidence: HashMap::new(),
            broadcast_evidence: HashMap::new(),
            last_outbound: None,
            verdict: None,
        }
    }

    pub fn set_last_outbound(&mut self, round_tag: &str, is_broadcast: bool) {
        self.last_outbound = Some(LastOutbound {
            round_tag: round_tag.to_string(),
            is_broadcast,
        });
    }

    pub fn record_unicast(&mut self, round_tag: &str, from: u16) {
        self.unicast_evidence
            .entry(round_tag.to_string())
            .or_default()
            .insert(from);
    }

    /// Record a broadcast commitment. The first hash for `(round, from)`
    /// wins; a conflicting one is the caller's cue to report equivocation.
    pub fn record_broadcast(&mut self, round_tag: &str, from: u16, hash: &str) {
        self.broadcast_evidence
            .entry(round_tag.to_string())
            .or_default()
            .entry(from)
            .or_insert_with(|| hash.to_string());
    }

    pub fn broadcast_hash(&self, round_tag: &str, from: u16) -> Option<&str> {
        self.broadcast_evidence
            .get(round_tag)
            .and_then(|by_party| by_party.get(&from))
            .map(|s| s.as_str())
    }

    /// Convict a peer of sending conflicting payloads for one round.
    pub fn record_equivocation(&mut self, from: u16) -> Blame {
        let node = self
            .roster
            .node_key(from)
            .unwrap_or_default()
            .to_string();

        let evidence = serde_json::json!({
            "violation": HASH_INCONSISTENCY,
            "party_index": from,
            "node": &node,
            "broadcast_evidence": &self.broadcast_evidence,
        });
        warn!("equivocation evidence: {}", evidence);

        let blame = Blame::new(HASH_INCONSISTENCY, vec![node], false);
        self.verdict = Some(blame.clone());
        blame
    }

    /// Peers that never reciprocated our unicast for the round.
    fn unicast_shortfall(&self, round_tag: &str) -> Vec<u16> {
        let seen = self.unicast_evidence.get(round_tag);
        self.roster
            .indices_excluding_self()
            .into_iter()
            .filter(|i| !seen.map(|s| s.contains(i)).unwrap_or(false))
            .collect()
    }

    /// Peers whose broadcast for the round never reached us.
    fn broadcast_shortfall(&self, round_tag: &str) -> Vec<u16> {
        let seen = self.broadcast_evidence.get(round_tag);
        self.roster
            .indices_excluding_self()
            .into_iter()
            .filter(|i| !seen.map(|s| s.contains_key(i)).unwrap_or(false))
            .collect()
    }

    /// Across all protocol rounds, peers from which nothing at all arrived.
    fn missing_share_sweep(&self, rounds: &[RoundInfo]) -> (Vec<u16>, bool) {
        let mut missing = BTreeSet::new();
        let mut any_unicast_round = false;
        for round in rounds {
            let shortfall = if round.broadcast {
                self.broadcast_shortfall(round.tag)
            } else {
                self.unicast_shortfall(round.tag)
            };
            if !shortfall.is_empty() && !round.broadcast {
                any_unicast_round = true;
            }
            missing.extend(shortfall);
        }
        (missing.into_iter().collect(), any_unicast_round)
    }

    fn node_keys_of(&self, indices: &[u16]) -> Vec<String> {
        indices
            .iter()
            .filter_map(|i| self.roster.node_key(*i))
            .map(|s| s.to_string())
            .collect()
    }

    /// Build the verdict after a round timeout.
    ///
    /// Resolution order: a recorded equivocation wins outright; otherwise
    /// analyse the round of our last outbound message; otherwise sweep all
    /// rounds for peers that sent nothing. If the accusation set exceeds the
    /// threshold the verdict is inconclusive.
    pub fn timeout_verdict(&self, rounds: &[RoundInfo], threshold: usize) -> Blame {
        if let Some(verdict) = &self.verdict {
            return verdict.clone();
        }

        let mut blame = Blame::new(TSS_TIMEOUT, Vec::new(), false);

        if let Some(last) = &self.last_outbound {
            let shortfall = if last.is_broadcast {
                self.broadcast_shortfall(&last.round_tag)
            } else {
                self.unicast_shortfall(&last.round_tag)
            };
            blame.is_unicast = !last.is_broadcast;
            blame.add_nodes(self.node_keys_of(&shortfall));
        }

        if blame.blame_nodes.is_empty() {
            let (missing, is_unicast) = self.missing_share_sweep(rounds);
            if !missing.is_empty() {
                blame = Blame::new(MISSING_SHARE, self.node_keys_of(&missing), is_unicast);
            }
        }

        if blame.blame_nodes.len() > threshold {
            // Surface the raw tables instead of accusing anyone.
            let evidence = serde_json::json!({
                "violation": BLAME_OVERFLOW,
                "accused": &blame.blame_nodes,
                "threshold": threshold,
                "unicast_evidence": &self.unicast_evidence,
                "broadcast_evidence": &self.broadcast_evidence,
            });
            warn!("inconclusive verdict, accusation set exceeds the threshold: {}", evidence);
            return Blame::new(BLAME_OVERFLOW, Vec::new(), blame.is_unicast);
        }

        blame
    }

    /// The verdict recorded so far, if any (equivocation sets it eagerly).
    pub fn current_verdict(&self) -> Option<&Blame> {
        self.verdict.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity;
    use tss_network::conversion::node_key_from_keypair;

    const ROUNDS: &[RoundInfo] = &[
        RoundInfo {
            tag: "r1",
            broadcast: true,
        },
        RoundInfo {
            tag: "r2",
            broadcast: false,
        },
        RoundInfo {
            tag: "r3",
            broadcast: true,
        },
    ];

    fn roster(n: usize) -> PartyRoster {
        let keys: Vec<String> = (0..n)
            .map(|_| node_key_from_keypair(&identity::Keypair::generate_secp256k1()).unwrap())
            .collect();
        PartyRoster::new(&keys, &keys[0]).unwrap()
    }

    #[test]
    fn equivocation_names_exactly_the_offender() {
        let roster = roster(4);
        let culprit = 2u16;
        let culprit_key = roster.node_key(culprit).unwrap().to_string();

        let mut table = BlameTable::new(roster);
        table.record_broadcast("r1", culprit, "hash-a");
        let blame = table.record_equivocation(culprit);

        assert_eq!(blame.fail_reason, HASH_INCONSISTENCY);
        assert_eq!(blame.blame_nodes, vec![culprit_key]);
        assert!(!blame.is_unicast);

        // The eager verdict survives a later timeout analysis.
        let verdict = table.timeout_verdict(ROUNDS, 2);
        assert_eq!(verdict.fail_reason, HASH_INCONSISTENCY);
    }

    #[test]
    fn unicast_timeout_blames_the_silent_peer() {
        let roster = roster(3);
        let silent = 2u16;
        let silent_key = roster.node_key(silent).unwrap().to_string();

        let mut table = BlameTable::new(roster);
        // Round 1 broadcasts all arrived.
        table.record_broadcast("r1", 1, "h1");
        table.record_broadcast("r1", 2, "h2");
        // We sent our round-2 unicast; only party 1 reciprocated.
        table.set_last_outbound("r2", false);
        table.record_unicast("r2", 1);

        let verdict = table.timeout_verdict(ROUNDS, 1);
        assert_eq!(verdict.fail_reason, TSS_TIMEOUT);
        assert!(verdict.is_unicast);
        assert_eq!(verdict.blame_nodes, vec![silent_key]);
    }

    #[test]
    fn missing_share_sweep_catches_fully_silent_peers() {
        let roster = roster(4);
        let silent_key = roster.node_key(3).unwrap().to_string();

        let mut table = BlameTable::new(roster);
        // No outbound yet; parties 1 and 2 sent everything, party 3 nothing.
        for round in ["r1", "r3"] {
            table.record_broadcast(round, 1, "h");
            table.record_broadcast(round, 2, "h");
        }
        table.record_unicast("r2", 1);
        table.record_unicast("r2", 2);

        let verdict = table.timeout_verdict(ROUNDS, 2);
        assert_eq!(verdict.fail_reason, MISSING_SHARE);
        assert_eq!(verdict.blame_nodes, vec![silent_key]);
        assert!(verdict.is_unicast);
    }

    #[test]
    fn oversized_accusation_set_is_inconclusive() {
        let roster = roster(4);
        let mut table = BlameTable::new(roster);
        table.set_last_outbound("r1", true);
        // Nobody answered: three accused with threshold 2.
        let verdict = table.timeout_verdict(ROUNDS, 2);
        assert_eq!(verdict.fail_reason, BLAME_OVERFLOW);
        assert!(verdict.blame_nodes.is_empty());
    }
}
