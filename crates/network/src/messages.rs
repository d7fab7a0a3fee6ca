//! Wire message types.
//!
//! Everything on the wire is a JSON-encoded [`WrappedMessage`] inside a
//! length-prefixed frame. The inner payload is opaque to this crate; the
//! engine interprets it per message type.

use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Routing tag for a frame. Together with the session id it selects the
/// subscriber that receives the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    JoinPartyRequest,
    JoinPartyResponse,
    TssKeygen,
    TssKeygenVerify,
    TssKeysign,
    TssKeysignVerify,
    TssControl,
    TssTaskDone,
    SignatureNotifier,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The unit on the wire: one frame carries exactly one wrapped message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMessage {
    pub message_type: MessageType,
    /// Session id (hex SHA-256 over the sorted participant set).
    pub msg_id: String,
    /// Opaque payload, base64 on the wire.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl WrappedMessage {
    pub fn new(message_type: MessageType, msg_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            msg_id: msg_id.into(),
            payload,
        }
    }
}

/// A frame received from the network, tagged with the remote peer that the
/// transport authenticated.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer: PeerId,
    pub wrapped: WrappedMessage,
}

/// Request a follower sends to the elected leader over `/p2p/join-party`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPartyRequest {
    pub msg_id: String,
}

/// Outcome of a join-party round as reported by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPartyResult {
    Success,
    Timeout,
}

/// Leader's reply on the open join-party stream.
///
/// On `Success`, `peer_ids` is the agreed quorum; on `Timeout` it is the set
/// of peers the leader heard from before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPartyResponse {
    pub result: JoinPartyResult,
    /// Base58 peer ids, sorted.
    pub peer_ids: Vec<String>,
}

impl JoinPartyResponse {
    pub fn success(mut peers: Vec<PeerId>) -> Self {
        peers.sort();
        Self {
            result: JoinPartyResult::Success,
            peer_ids: peers.iter().map(|p| p.to_base58()).collect(),
        }
    }

    pub fn timeout(mut peers: Vec<PeerId>) -> Self {
        peers.sort();
        Self {
            result: JoinPartyResult::Timeout,
            peer_ids: peers.iter().map(|p| p.to_base58()).collect(),
        }
    }

    /// Decode the peer id list. Unparseable entries are skipped.
    pub fn peers(&self) -> Vec<PeerId> {
        self.peer_ids
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

/// Inbound join-party request surfaced to the leader logic, with a one-shot
/// reply channel bound to the still-open stream.
#[derive(Debug)]
pub struct JoinPartyEvent {
    pub from: PeerId,
    pub request: JoinPartyRequest,
    pub reply: oneshot::Sender<JoinPartyResponse>,
}

/// Empty acknowledgement closing a `/p2p/tss` exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TssAck;

/// Serde helper encoding byte fields as base64 strings in JSON.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_message_json_round_trip_is_identity() {
        let msg = WrappedMessage::new(MessageType::TssKeysign, "abc123", vec![0, 1, 254, 255]);
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: WrappedMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn join_party_response_round_trips_peer_ids() {
        let peers = vec![PeerId::random(), PeerId::random(), PeerId::random()];
        let resp = JoinPartyResponse::success(peers.clone());
        assert_eq!(resp.result, JoinPartyResult::Success);

        let decoded = resp.peers();
        assert_eq!(decoded.len(), peers.len());
        for p in peers {
            assert!(decoded.contains(&p));
        }
    }

    #[test]
    fn message_type_is_stable_in_json() {
        let json = serde_json::to_string(&MessageType::TssKeygenVerify).unwrap();
        assert_eq!(json, "\"TssKeygenVerify\"");
    }
}
