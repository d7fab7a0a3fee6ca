//! Composed libp2p network behaviour for the TSS host.

use std::time::Duration;

use libp2p::kad::store::MemoryStore;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, identity, kad, ping, request_response, PeerId, StreamProtocol};

use crate::codec::{JoinPartyCodec, WireCodec};
use crate::{JOIN_PARTY_PROTOCOL, TIMEOUT_CONNECTING, TSS_PROTOCOL};

const IDENTIFY_PROTOCOL: &str = "/tss/id/1.0.0";

#[derive(NetworkBehaviour)]
pub struct TssBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub tss: request_response::Behaviour<WireCodec>,
    pub join_party: request_response::Behaviour<JoinPartyCodec>,
}

impl TssBehaviour {
    /// `join_party_timeout` must exceed the party-formation window: the
    /// leader holds the inbound stream open until it has a quorum.
    pub fn new(
        local_peer_id: PeerId,
        public_key: identity::PublicKey,
        join_party_timeout: Duration,
    ) -> Self {
        let mut kademlia = kad::Behaviour::new(local_peer_id, MemoryStore::new(local_peer_id));
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            public_key,
        ));

        let ping = ping::Behaviour::new(ping::Config::new());

        let tss = request_response::Behaviour::with_codec(
            WireCodec,
            std::iter::once((StreamProtocol::new(TSS_PROTOCOL), request_response::ProtocolSupport::Full)),
            request_response::Config::default().with_request_timeout(TIMEOUT_CONNECTING),
        );

        let join_party = request_response::Behaviour::with_codec(
            JoinPartyCodec,
            std::iter::once((
                StreamProtocol::new(JOIN_PARTY_PROTOCOL),
                request_response::ProtocolSupport::Full,
            )),
            request_response::Config::default().with_request_timeout(join_party_timeout),
        );

        Self {
            kademlia,
            identify,
            ping,
            tss,
            join_party,
        }
    }
}
