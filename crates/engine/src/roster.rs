//! Per-session participant roster.
//!
//! Sessions index parties by position in the sorted node-key list, so every
//! participant derives the same `party index <-> peer id` bijection without
//! negotiation. The roster is built once at session start and is read-only
//! afterwards.

use libp2p::PeerId;
use thiserror::Error;

use tss_network::conversion::peer_id_from_node_key;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("participant key {0} is invalid: {1}")]
    InvalidKey(String, String),
    #[error("duplicate participant key {0}")]
    DuplicateKey(String),
    #[error("local key {0} is not in the participant set")]
    LocalKeyMissing(String),
}

#[derive(Debug, Clone)]
pub struct PartyRoster {
    node_keys: Vec<String>,
    peer_ids: Vec<PeerId>,
    local_index: u16,
}

impl PartyRoster {
    pub fn new(participants: &[String], local_key: &str) -> Result<Self, RosterError> {
        let mut node_keys = participants.to_vec();
        node_keys.sort();
        node_keys.dedup();
        if node_keys.len() != participants.len() {
            for key in participants {
                if participants.iter().filter(|k| *k == key).count() > 1 {
                    return Err(RosterError::DuplicateKey(key.clone()));
                }
            }
        }

        let mut peer_ids = Vec::with_capacity(node_keys.len());
        for key in &node_keys {
            let peer = peer_id_from_node_key(key)
                .map_err(|e| RosterError::InvalidKey(key.clone(), e.to_string()))?;
            peer_ids.push(peer);
        }

        let local_index = node_keys
            .iter()
            .position(|k| k == local_key)
            .ok_or_else(|| RosterError::LocalKeyMissing(local_key.to_string()))?
            as u16;

        Ok(Self {
            node_keys,
            peer_ids,
            local_index,
        })
    }

    pub fn len(&self) -> usize {
        self.node_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_keys.is_empty()
    }

    pub fn local_index(&self) -> u16 {
        self.local_index
    }

    pub fn local_key(&self) -> &str {
        &self.node_keys[self.local_index as usize]
    }

    /// Sorted participant node keys.
    pub fn node_keys(&self) -> &[String] {
        &self.node_keys
    }

    pub fn node_key(&self, index: u16) -> Option<&str> {
        self.node_keys.get(index as usize).map(|s| s.as_str())
    }

    pub fn peer(&self, index: u16) -> Option<PeerId> {
        self.peer_ids.get(index as usize).copied()
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peer_ids
    }

    pub fn index_of_peer(&self, peer: &PeerId) -> Option<u16> {
        self.peer_ids.iter().position(|p| p == peer).map(|i| i as u16)
    }

    /// Every peer in the session except this node.
    pub fn peers_excluding_self(&self) -> Vec<PeerId> {
        self.peer_ids
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.local_index as usize)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Party indices of every participant except this node.
    pub fn indices_excluding_self(&self) -> Vec<u16> {
        (0..self.node_keys.len() as u16)
            .filter(|i| *i != self.local_index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity;
    use tss_network::conversion::node_key_from_keypair;

    fn keys(n: usize) -> Vec<String> {
        (0..n)
            .map(|_| node_key_from_keypair(&identity::Keypair::generate_secp256k1()).unwrap())
            .collect()
    }

    #[test]
    fn roster_is_order_independent() {
        let ks = keys(4);
        let mut shuffled = ks.clone();
        shuffled.reverse();

        let a = PartyRoster::new(&ks, &ks[0]).unwrap();
        let b = PartyRoster::new(&shuffled, &ks[0]).unwrap();
        assert_eq!(a.node_keys(), b.node_keys());
        assert_eq!(a.local_index(), b.local_index());
    }

    #[test]
    fn peer_index_bijection_holds() {
        let ks = keys(3);
        let roster = PartyRoster::new(&ks, &ks[1]).unwrap();

        for i in 0..roster.len() as u16 {
            let peer = roster.peer(i).unwrap();
            assert_eq!(roster.index_of_peer(&peer), Some(i));
        }
        assert_eq!(roster.peers_excluding_self().len(), 2);
    }

    #[test]
    fn local_key_must_be_present() {
        let ks = keys(3);
        let stranger = keys(1).remove(0);
        assert!(matches!(
            PartyRoster::new(&ks, &stranger),
            Err(RosterError::LocalKeyMissing(_))
        ));
    }
}
