//! Deterministic development backend.
//!
//! Stands in for the external MPC library on local and mock networks. It
//! follows the streaming-party contract faithfully — three keygen rounds
//! (broadcast commitment, unicast share, broadcast digest) and three keysign
//! rounds — but derives the group key deterministically from the sorted
//! participant set, so every honest party ends with the same ed25519 key and
//! emits the same verifiable signature. All coordination paths (broadcast
//! confirmation, dedup, blame evidence, batching) see honest network
//! traffic.

use std::collections::HashMap;

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::error;

use super::{
    KeygenOutput, OutboundPartyMessage, PartyBackend, PartyContext, PartyHandle, PartyInput,
    RoundInfo, SignatureRecord,
};

pub const KEYGEN_ROUNDS: &[RoundInfo] = &[
    RoundInfo {
        tag: "keygen.round1",
        broadcast: true,
    },
    RoundInfo {
        tag: "keygen.round2",
        broadcast: false,
    },
    RoundInfo {
        tag: "keygen.round3",
        broadcast: true,
    },
];

pub const KEYSIGN_ROUNDS: &[RoundInfo] = &[
    RoundInfo {
        tag: "keysign.round1",
        broadcast: true,
    },
    RoundInfo {
        tag: "keysign.round2",
        broadcast: false,
    },
    RoundInfo {
        tag: "keysign.round3",
        broadcast: true,
    },
];

/// Save blob persisted after a dev keygen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevSaveData {
    pub seed: String,
    pub pub_key: String,
    pub local_party_key: String,
    pub participant_keys: Vec<String>,
}

/// The development backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct DevBackend;

impl PartyBackend for DevBackend {
    fn keygen_rounds(&self) -> &'static [RoundInfo] {
        KEYGEN_ROUNDS
    }

    fn keysign_rounds(&self) -> &'static [RoundInfo] {
        KEYSIGN_ROUNDS
    }

    fn new_keygen_party(
        &self,
        ctx: PartyContext,
        out_tx: mpsc::Sender<OutboundPartyMessage>,
        end_tx: mpsc::Sender<KeygenOutput>,
    ) -> PartyHandle {
        let (input_tx, mut input_rx) = mpsc::channel(1024);
        let moniker = ctx.moniker.clone();
        tokio::spawn(async move {
            let mut machine = KeygenMachine::new(ctx);
            while let Some(input) = input_rx.recv().await {
                match machine.step(input) {
                    Ok(step) => {
                        for msg in step.outbound {
                            if out_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        if let Some(output) = step.end {
                            let _ = end_tx.send(output).await;
                            return;
                        }
                    }
                    Err(e) => {
                        error!("keygen party aborted: {}", e);
                        return;
                    }
                }
            }
        });
        PartyHandle::new(moniker, input_tx)
    }

    fn new_keysign_party(
        &self,
        ctx: PartyContext,
        out_tx: mpsc::Sender<OutboundPartyMessage>,
        end_tx: mpsc::Sender<SignatureRecord>,
    ) -> PartyHandle {
        let (input_tx, mut input_rx) = mpsc::channel(1024);
        let moniker = ctx.moniker.clone();
        tokio::spawn(async move {
            let mut machine = match KeysignMachine::new(ctx) {
                Ok(m) => m,
                Err(e) => {
                    error!("keysign party failed to initialize: {}", e);
                    return;
                }
            };
            while let Some(input) = input_rx.recv().await {
                match machine.step(input) {
                    Ok(step) => {
                        for msg in step.outbound {
                            if out_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                        if let Some(output) = step.end {
                            let _ = end_tx.send(output).await;
                            return;
                        }
                    }
                    Err(e) => {
                        error!("keysign party aborted: {}", e);
                        return;
                    }
                }
            }
        });
        PartyHandle::new(moniker, input_tx)
    }
}

struct Step<T> {
    outbound: Vec<OutboundPartyMessage>,
    end: Option<T>,
}

impl<T> Step<T> {
    fn none() -> Self {
        Self {
            outbound: Vec::new(),
            end: None,
        }
    }

    fn send(outbound: Vec<OutboundPartyMessage>) -> Self {
        Self {
            outbound,
            end: None,
        }
    }
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

fn contribution(node_key: &str) -> [u8; 32] {
    sha256(&[b"tss-dev/contrib/", node_key.as_bytes()])
}

fn group_seed(sorted_keys: &[String]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"tss-dev/seed/");
    for key in sorted_keys {
        hasher.update(contribution(key));
    }
    hasher.finalize().into()
}

/// Per-round inbound buffer tolerating out-of-order delivery across rounds.
#[derive(Default)]
struct RoundBuffer {
    by_round: HashMap<String, HashMap<u16, Vec<u8>>>,
}

impl RoundBuffer {
    fn put(&mut self, round_tag: &str, from: u16, bytes: Vec<u8>) {
        self.by_round
            .entry(round_tag.to_string())
            .or_default()
            .entry(from)
            .or_insert(bytes);
    }

    fn complete(&self, round_tag: &str, expected: usize) -> bool {
        self.by_round
            .get(round_tag)
            .map(|m| m.len() >= expected)
            .unwrap_or(expected == 0)
    }

    fn round(&self, round_tag: &str) -> Option<&HashMap<u16, Vec<u8>>> {
        self.by_round.get(round_tag)
    }
}

struct KeygenMachine {
    ctx: PartyContext,
    started: bool,
    round: u8,
    buffer: RoundBuffer,
}

impl KeygenMachine {
    fn new(ctx: PartyContext) -> Self {
        Self {
            ctx,
            started: false,
            round: 0,
            buffer: RoundBuffer::default(),
        }
    }

    fn others(&self) -> usize {
        self.ctx.node_keys.len() - 1
    }

    fn my_contribution(&self) -> [u8; 32] {
        contribution(&self.ctx.node_keys[self.ctx.local_index as usize])
    }

    fn outbound(&self, round: &RoundInfo, bytes: Vec<u8>) -> OutboundPartyMessage {
        OutboundPartyMessage {
            moniker: self.ctx.moniker.clone(),
            round_tag: round.tag.to_string(),
            is_broadcast: round.broadcast,
            to: if round.broadcast {
                Vec::new()
            } else {
                (0..self.ctx.node_keys.len() as u16)
                    .filter(|i| *i != self.ctx.local_index)
                    .collect()
            },
            bytes,
        }
    }

    fn step(&mut self, input: PartyInput) -> Result<Step<KeygenOutput>, String> {
        match input {
            PartyInput::Start => {
                if self.started {
                    return Err("party started twice".to_string());
                }
                self.started = true;
                self.round = 1;
                let commit = sha256(&[&self.my_contribution()]);
                Ok(Step::send(vec![
                    self.outbound(&KEYGEN_ROUNDS[0], commit.to_vec())
                ]))
            }
            PartyInput::Update {
                from,
                round_tag,
                bytes,
            } => {
                self.buffer.put(&round_tag, from, bytes);
                self.advance()
            }
        }
    }

    fn advance(&mut self) -> Result<Step<KeygenOutput>, String> {
        let mut outbound = Vec::new();

        if self.round == 1 && self.buffer.complete(KEYGEN_ROUNDS[0].tag, self.others()) {
            self.round = 2;
            outbound.push(self.outbound(&KEYGEN_ROUNDS[1], self.my_contribution().to_vec()));
        }

        if self.round == 2 && self.buffer.complete(KEYGEN_ROUNDS[1].tag, self.others()) {
            let commits = self.buffer.round(KEYGEN_ROUNDS[0].tag).cloned().unwrap_or_default();
            let shares = self
                .buffer
                .round(KEYGEN_ROUNDS[1].tag)
                .ok_or_else(|| "round-2 buffer vanished".to_string())?;
            for (from, share) in shares {
                let commit = commits
                    .get(from)
                    .ok_or_else(|| format!("no commitment from party {}", from))?;
                if sha256(&[share]).as_slice() != commit.as_slice() {
                    return Err(format!("share from party {} does not match commitment", from));
                }
            }
            self.round = 3;
            let digest = group_seed(&self.ctx.node_keys);
            outbound.push(self.outbound(&KEYGEN_ROUNDS[2], digest.to_vec()));
        }

        if self.round == 3 && self.buffer.complete(KEYGEN_ROUNDS[2].tag, self.others()) {
            let my_digest = group_seed(&self.ctx.node_keys);
            let digests = self
                .buffer
                .round(KEYGEN_ROUNDS[2].tag)
                .ok_or_else(|| "round-3 buffer vanished".to_string())?;
            for (from, digest) in digests {
                if digest.as_slice() != my_digest.as_slice() {
                    return Err(format!("party {} derived a different group digest", from));
                }
            }

            let seed = group_seed(&self.ctx.node_keys);
            let signing_key = SigningKey::from_bytes(&seed);
            let pub_key = signing_key.verifying_key().to_bytes();

            let save = DevSaveData {
                seed: hex::encode(seed),
                pub_key: hex::encode(pub_key),
                local_party_key: self.ctx.node_keys[self.ctx.local_index as usize].clone(),
                participant_keys: self.ctx.node_keys.clone(),
            };
            let local_data =
                serde_json::to_vec(&save).map_err(|e| format!("encode save data: {}", e))?;

            return Ok(Step {
                outbound,
                end: Some(KeygenOutput {
                    pub_key: pub_key.to_vec(),
                    local_data,
                }),
            });
        }

        if outbound.is_empty() {
            Ok(Step::none())
        } else {
            Ok(Step::send(outbound))
        }
    }
}

struct KeysignMachine {
    ctx: PartyContext,
    save: DevSaveData,
    message: Vec<u8>,
    started: bool,
    round: u8,
    buffer: RoundBuffer,
}

impl KeysignMachine {
    fn new(ctx: PartyContext) -> Result<Self, String> {
        let local_data = ctx
            .local_data
            .as_ref()
            .ok_or_else(|| "keysign party needs keygen save data".to_string())?;
        let save: DevSaveData =
            serde_json::from_slice(local_data).map_err(|e| format!("decode save data: {}", e))?;
        let message = ctx
            .message
            .clone()
            .ok_or_else(|| "keysign party needs a message".to_string())?;
        Ok(Self {
            ctx,
            save,
            message,
            started: false,
            round: 0,
            buffer: RoundBuffer::default(),
        })
    }

    fn others(&self) -> usize {
        self.ctx.node_keys.len() - 1
    }

    fn nonce_for(&self, node_key: &str) -> [u8; 32] {
        sha256(&[
            b"tss-dev/nonce/",
            self.save.seed.as_bytes(),
            &self.message,
            node_key.as_bytes(),
        ])
    }

    fn my_nonce(&self) -> [u8; 32] {
        self.nonce_for(&self.ctx.node_keys[self.ctx.local_index as usize])
    }

    fn outbound(&self, round: &RoundInfo, bytes: Vec<u8>) -> OutboundPartyMessage {
        OutboundPartyMessage {
            moniker: self.ctx.moniker.clone(),
            round_tag: round.tag.to_string(),
            is_broadcast: round.broadcast,
            to: if round.broadcast {
                Vec::new()
            } else {
                (0..self.ctx.node_keys.len() as u16)
                    .filter(|i| *i != self.ctx.local_index)
                    .collect()
            },
            bytes,
        }
    }

    fn step(&mut self, input: PartyInput) -> Result<Step<SignatureRecord>, String> {
        match input {
            PartyInput::Start => {
                if self.started {
                    return Err("party started twice".to_string());
                }
                self.started = true;
                self.round = 1;
                let commit = sha256(&[&self.my_nonce()]);
                Ok(Step::send(vec![
                    self.outbound(&KEYSIGN_ROUNDS[0], commit.to_vec())
                ]))
            }
            PartyInput::Update {
                from,
                round_tag,
                bytes,
            } => {
                self.buffer.put(&round_tag, from, bytes);
                self.advance()
            }
        }
    }

    fn advance(&mut self) -> Result<Step<SignatureRecord>, String> {
        let mut outbound = Vec::new();

        if self.round == 1 && self.buffer.complete(KEYSIGN_ROUNDS[0].tag, self.others()) {
            self.round = 2;
            outbound.push(self.outbound(&KEYSIGN_ROUNDS[1], self.my_nonce().to_vec()));
        }

        if self.round == 2 && self.buffer.complete(KEYSIGN_ROUNDS[1].tag, self.others()) {
            let commits = self.buffer.round(KEYSIGN_ROUNDS[0].tag).cloned().unwrap_or_default();
            let nonces = self
                .buffer
                .round(KEYSIGN_ROUNDS[1].tag)
                .ok_or_else(|| "round-2 buffer vanished".to_string())?;
            for (from, nonce) in nonces {
                let commit = commits
                    .get(from)
                    .ok_or_else(|| format!("no nonce commitment from party {}", from))?;
                if sha256(&[nonce]).as_slice() != commit.as_slice() {
                    return Err(format!("nonce from party {} does not match commitment", from));
                }
            }

            self.round = 3;
            let mut hasher = Sha256::new();
            hasher.update(b"tss-dev/partial/");
            for key in &self.ctx.node_keys {
                hasher.update(self.nonce_for(key));
            }
            hasher.update(&self.message);
            let partial: [u8; 32] = hasher.finalize().into();
            outbound.push(self.outbound(&KEYSIGN_ROUNDS[2], partial.to_vec()));
        }

        if self.round == 3 && self.buffer.complete(KEYSIGN_ROUNDS[2].tag, self.others()) {
            let seed_bytes =
                hex::decode(&self.save.seed).map_err(|e| format!("corrupt seed: {}", e))?;
            let seed: [u8; 32] = seed_bytes
                .try_into()
                .map_err(|_| "corrupt seed length".to_string())?;
            let signing_key = SigningKey::from_bytes(&seed);
            let sig = signing_key.sign(&self.message).to_bytes();

            return Ok(Step {
                outbound,
                end: Some(SignatureRecord {
                    m: self.message.clone(),
                    r: sig[..32].to_vec(),
                    s: sig[32..].to_vec(),
                }),
            });
        }

        if outbound.is_empty() {
            Ok(Step::none())
        } else {
            Ok(Step::send(outbound))
        }
    }
}
