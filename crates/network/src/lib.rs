//! P2P transport for the TSS node.
//!
//! One libp2p host per process. Peers discover each other through a Kademlia
//! DHT under a shared rendezvous string; session traffic travels over two
//! request-response protocols, `/p2p/tss` for MPC frames and
//! `/p2p/join-party` for party formation. Every frame rides its own outbound
//! stream; inbound frames are routed to in-flight sessions by the
//! subscription bus.

pub mod bus;
pub mod codec;
pub mod communication;
pub mod conversion;
pub mod error;
pub mod messages;
pub mod messenger;

mod behaviour;

pub use bus::SubscriptionBus;
pub use communication::Communication;
pub use error::NetworkError;
pub use messages::{
    InboundMessage, JoinPartyEvent, JoinPartyRequest, JoinPartyResponse, JoinPartyResult,
    MessageType, WrappedMessage,
};
pub use messenger::Messenger;

use std::time::Duration;

/// Protocol id for MPC session traffic.
pub const TSS_PROTOCOL: &str = "/p2p/tss";
/// Protocol id for party formation.
pub const JOIN_PARTY_PROTOCOL: &str = "/p2p/join-party";

/// Maximum payload for a single frame. Larger frames drop the stream and the
/// peer is logged as abusive.
pub const MAX_PAYLOAD: usize = 81_920;
/// Deadline applied to each header read, body read and write.
pub const TIMEOUT_READ_WRITE: Duration = Duration::from_secs(10);
/// Overall deadline governing a logical broadcast.
pub const TIMEOUT_BROADCAST: Duration = Duration::from_secs(5 * 60);
/// Maximum time to wait for a peer connection to come up.
pub const TIMEOUT_CONNECTING: Duration = Duration::from_secs(60);
/// Depth of the per-session subscription channels.
pub const CHANNEL_DEPTH: usize = 1024;
