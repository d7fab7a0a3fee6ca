//! Transport seam between the coordination engine and the network.
//!
//! The engine only speaks to peers through this trait, so sessions can run
//! over the libp2p host in production and over an in-process hub in tests.

use std::time::Duration;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::mpsc;

use crate::error::NetworkError;
use crate::messages::{
    InboundMessage, JoinPartyEvent, JoinPartyRequest, JoinPartyResponse, MessageType,
    WrappedMessage,
};

#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// The transport identity of this node.
    fn local_peer_id(&self) -> PeerId;

    /// Send one frame to one peer. Failures are logged and become blame
    /// evidence; they never fail the session, so nothing is returned.
    async fn send_to_peer(&self, peer: PeerId, msg: WrappedMessage);

    /// Send one frame to each listed peer in parallel. An empty list targets
    /// every peer discovered under the rendezvous string. Self-sends are
    /// filtered.
    async fn broadcast(&self, peers: Vec<PeerId>, msg: WrappedMessage);

    /// Open a join-party stream to the leader and await its response.
    async fn join_party(
        &self,
        leader: PeerId,
        request: JoinPartyRequest,
        timeout: Duration,
    ) -> Result<JoinPartyResponse, NetworkError>;

    /// Start accepting join-party requests for a session this node leads.
    async fn register_join_party(&self, msg_id: &str) -> mpsc::Receiver<JoinPartyEvent>;

    /// Stop accepting join-party requests for the session.
    async fn unregister_join_party(&self, msg_id: &str);

    /// Subscribe one channel to all the given message types for a session.
    fn subscribe(&self, types: &[MessageType], msg_id: &str) -> mpsc::Receiver<InboundMessage>;

    /// Drop the session's subscriptions.
    fn unsubscribe(&self, types: &[MessageType], msg_id: &str);

    /// Multiaddrs of peers seen this run, for the persisted address book.
    async fn peer_addresses(&self) -> Vec<String>;
}
