//! Shared building blocks for the TSS node: configuration, session
//! identifiers, threshold arithmetic and logging setup.

pub mod config;
pub mod ids;
pub mod logging;

pub use config::{NodeConfig, P2pConfig, TssConfig};
pub use ids::{keygen_session_id, keysign_session_id, threshold};

use serde::{Deserialize, Serialize};

/// Outcome of a keygen or keysign session as reported to callers.
///
/// Protocol failures are a `Fail` response carrying a blame body, not an
/// error: only storage and invariant violations surface as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Fail,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Fail => write!(f, "fail"),
        }
    }
}
