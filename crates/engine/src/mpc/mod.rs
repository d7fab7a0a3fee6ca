//! The streaming MPC party abstraction.
//!
//! The round math lives in an external library; the engine only needs a
//! party it can start once, feed inbound round bytes to, and read outbound
//! messages and a final artifact from. Parties communicate through bounded
//! channels handed over at construction, one task per party.

pub mod dev;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One protocol round: its wire tag and whether it is broadcast or unicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub tag: &'static str,
    pub broadcast: bool,
}

/// A message the party wants on the wire.
#[derive(Debug, Clone)]
pub struct OutboundPartyMessage {
    /// Sub-party label for batch signing; empty for keygen.
    pub moniker: String,
    pub round_tag: String,
    pub is_broadcast: bool,
    /// Target party indices; ignored for broadcasts.
    pub to: Vec<u16>,
    pub bytes: Vec<u8>,
}

/// Input fed to a running party.
#[derive(Debug)]
pub enum PartyInput {
    /// Kick the party off. Sent exactly once, before any update.
    Start,
    /// One accepted inbound round message.
    Update {
        from: u16,
        round_tag: String,
        bytes: Vec<u8>,
    },
}

/// Handle to a spawned party task.
pub struct PartyHandle {
    pub moniker: String,
    input_tx: mpsc::Sender<PartyInput>,
}

impl PartyHandle {
    pub fn new(moniker: String, input_tx: mpsc::Sender<PartyInput>) -> Self {
        Self { moniker, input_tx }
    }

    pub async fn start(&self) {
        let _ = self.input_tx.send(PartyInput::Start).await;
    }

    pub async fn update(&self, from: u16, round_tag: &str, bytes: Vec<u8>) {
        let _ = self
            .input_tx
            .send(PartyInput::Update {
                from,
                round_tag: round_tag.to_string(),
                bytes,
            })
            .await;
    }
}

/// Final artifact of a keygen party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygenOutput {
    /// Compressed 32-byte public key of the generated pool key.
    pub pub_key: Vec<u8>,
    /// Opaque save blob this node must persist to sign later.
    pub local_data: Vec<u8>,
}

/// Final artifact of one keysign sub-party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    /// The signed message.
    pub m: Vec<u8>,
    pub r: Vec<u8>,
    pub s: Vec<u8>,
}

/// Context a backend needs to build one party.
#[derive(Debug, Clone)]
pub struct PartyContext {
    /// Sorted node keys of the session participants.
    pub node_keys: Vec<String>,
    pub local_index: u16,
    pub threshold: usize,
    /// Sub-party label; empty for keygen.
    pub moniker: String,
    /// Message to sign (keysign only).
    pub message: Option<Vec<u8>>,
    /// Persisted save blob from keygen (keysign only).
    pub local_data: Option<Vec<u8>>,
}

/// Factory for MPC parties. The engine is generic over the backend so the
/// round math stays external.
pub trait PartyBackend: Send + Sync + 'static {
    fn keygen_rounds(&self) -> &'static [RoundInfo];
    fn keysign_rounds(&self) -> &'static [RoundInfo];

    fn new_keygen_party(
        &self,
        ctx: PartyContext,
        out_tx: mpsc::Sender<OutboundPartyMessage>,
        end_tx: mpsc::Sender<KeygenOutput>,
    ) -> PartyHandle;

    fn new_keysign_party(
        &self,
        ctx: PartyContext,
        out_tx: mpsc::Sender<OutboundPartyMessage>,
        end_tx: mpsc::Sender<SignatureRecord>,
    ) -> PartyHandle;
}
