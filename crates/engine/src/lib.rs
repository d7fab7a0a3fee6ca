//! Coordination engine of the TSS node.
//!
//! Wires the external MPC party abstraction to the network: party formation,
//! the round-by-round message relay with broadcast confirmation, blame
//! assignment on failure, and out-of-band signature notification. The public
//! entry points are [`server::TssServer::keygen`] and
//! [`server::TssServer::keysign`].

pub mod blame;
pub mod error;
pub mod join_party;
pub mod keygen;
pub mod keysign;
pub mod mpc;
pub mod notifier;
pub mod relay;
pub mod roster;
pub mod server;

pub use blame::Blame;
pub use error::EngineError;
pub use roster::PartyRoster;
pub use server::{
    KeygenRequest, KeygenResponse, KeysignRequest, KeysignResponse, Signature, TssServer,
};
