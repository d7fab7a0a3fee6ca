//! Network error types.

use thiserror::Error;

/// Errors surfaced by the transport layer.
///
/// Dial, write and deadline failures inside a session are deliberately *not*
/// represented here: they are logged, turned into blame evidence and the
/// session keeps running. Only failures of the transport itself, or of a
/// request the caller is awaiting (join-party), become errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid secp256k1 key material.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Invalid multiaddr or peer id in configuration.
    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Failed to construct or start the libp2p host.
    #[error("failed to start p2p host: {0}")]
    HostSetup(String),

    /// The join-party request to the leader failed or got no reply in time.
    #[error("join-party request to {leader} failed: {reason}")]
    JoinPartyFailed { leader: String, reason: String },

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Internal command channel to the swarm task is gone.
    #[error("transport is shut down")]
    ChannelClosed,
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
