//! Engine error taxonomy.
//!
//! Protocol failures (timeouts, equivocation, failed party formation) do not
//! surface here: they become a `Fail` response with a blame body. Only
//! storage failures and invariant violations escape to the caller as errors.

use thiserror::Error;

use crate::blame::Blame;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage failure: {0}")]
    Storage(#[from] tss_storage::StorageError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not enough signers: threshold is {threshold}, got {signers}")]
    NotEnoughSigners { threshold: usize, signers: usize },

    #[error("this node is not among the session participants")]
    NotInParty,

    #[error("failed to obtain signature from the signing quorum: {0}")]
    SignatureNotObtained(String),

    #[error("session cancelled by shutdown")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

/// How an in-flight session ended short of success. Mapped by the server
/// into a `Fail` response carrying the blame verdict.
#[derive(Debug)]
pub enum SessionError {
    /// The round deadline fired; the blame engine has produced a verdict.
    Timeout(Blame),
    /// A peer equivocated; the session aborted immediately.
    Abort(Blame),
    /// Process shutdown.
    Cancelled,
    /// A local party misbehaved (programmer error or corrupt save data).
    Party(String),
}
