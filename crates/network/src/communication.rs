//! The libp2p host and its driver task.
//!
//! `Communication` is the process-wide transport: it owns the swarm task,
//! exposes the [`Messenger`] seam to the engine and feeds inbound frames to
//! the subscription bus. It is started once at process startup and lives
//! until shutdown; sessions come and go on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::kad::{self, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, identity, noise, tcp, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tss_common::P2pConfig;

use crate::behaviour::{TssBehaviour, TssBehaviourEvent};
use crate::bus::SubscriptionBus;
use crate::conversion::node_key_from_keypair;
use crate::error::NetworkError;
use crate::messages::{
    InboundMessage, JoinPartyEvent, JoinPartyRequest, JoinPartyResponse, MessageType, TssAck,
    WrappedMessage,
};
use crate::messenger::Messenger;

/// How often the driver re-queries the rendezvous key and refreshes the
/// routing table.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Extra slack on top of the party-formation window before a join-party
/// stream is considered dead.
pub const JOIN_PARTY_SLACK: Duration = Duration::from_secs(15);

enum Command {
    SendTss {
        peer: PeerId,
        msg: WrappedMessage,
    },
    Broadcast {
        peers: Vec<PeerId>,
        msg: WrappedMessage,
    },
    JoinParty {
        leader: PeerId,
        request: JoinPartyRequest,
        reply: oneshot::Sender<Result<JoinPartyResponse, NetworkError>>,
    },
    RegisterJoinParty {
        msg_id: String,
        sender: mpsc::Sender<JoinPartyEvent>,
    },
    UnregisterJoinParty {
        msg_id: String,
    },
    JoinPartyReply {
        token: u64,
        response: JoinPartyResponse,
    },
    JoinPartyAbandon {
        token: u64,
    },
    PeerAddresses {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown,
}

/// Handle to the running transport.
pub struct Communication {
    local_peer_id: PeerId,
    node_key: String,
    bus: Arc<SubscriptionBus>,
    cmd_tx: mpsc::Sender<Command>,
}

impl Communication {
    /// Build the host, start listening and advertising, and spawn the driver
    /// task. `join_party_window` is the longest party-formation wait the
    /// engine will request.
    pub async fn start(
        keypair: identity::Keypair,
        conf: &P2pConfig,
        join_party_window: Duration,
    ) -> Result<Arc<Self>, NetworkError> {
        let node_key = node_key_from_keypair(&keypair)?;
        let local_peer_id = PeerId::from(keypair.public());

        let mut swarm: Swarm<TssBehaviour> = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| NetworkError::HostSetup(format!("tcp transport: {}", e)))?
            .with_behaviour(|key| {
                TssBehaviour::new(
                    PeerId::from(key.public()),
                    key.public(),
                    join_party_window + JOIN_PARTY_SLACK,
                )
            })
            .map_err(|e| NetworkError::HostSetup(format!("behaviour: {}", e)))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(30)))
            .build();

        let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", conf.port)
            .parse()
            .map_err(|e| NetworkError::HostSetup(format!("listen addr: {}", e)))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::HostSetup(format!("listen: {}", e)))?;

        if let Some(ip) = &conf.external_ip {
            let external: Multiaddr = format!("/ip4/{}/tcp/{}", ip, conf.port)
                .parse()
                .map_err(|e: libp2p::multiaddr::Error| NetworkError::InvalidAddress {
                    address: ip.clone(),
                    reason: e.to_string(),
                })?;
            swarm.add_external_address(external);
        }

        for addr_str in &conf.bootstrap_peers {
            let addr: Multiaddr = addr_str
                .parse()
                .map_err(|e: libp2p::multiaddr::Error| NetworkError::InvalidAddress {
                    address: addr_str.clone(),
                    reason: e.to_string(),
                })?;
            let Some(Protocol::P2p(peer)) = addr.iter().last() else {
                return Err(NetworkError::InvalidAddress {
                    address: addr_str.clone(),
                    reason: "bootstrap multiaddr must end in /p2p/<peer-id>".to_string(),
                });
            };
            swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
            if let Err(e) = swarm.dial(addr.clone()) {
                warn!("failed to dial bootstrap peer {}: {}", addr, e);
            }
        }

        let rendezvous = RecordKey::new(&conf.rendezvous);
        if let Err(e) = swarm.behaviour_mut().kademlia.start_providing(rendezvous.clone()) {
            warn!("failed to announce rendezvous provider record: {}", e);
        }
        let _ = swarm.behaviour_mut().kademlia.bootstrap();

        info!(
            "p2p host up, we are {} on port {}, rendezvous {}",
            local_peer_id, conf.port, conf.rendezvous
        );

        let bus = Arc::new(SubscriptionBus::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(1024);

        let driver = SwarmDriver {
            swarm,
            local_peer_id,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            bus: bus.clone(),
            rendezvous,
            known_peers: HashSet::new(),
            addr_book: HashMap::new(),
            pending_outbound_join: HashMap::new(),
            inbound_join_streams: HashMap::new(),
            join_sessions: HashMap::new(),
            early_join_requests: HashMap::new(),
            next_stream_token: 0,
        };
        tokio::spawn(driver.run());

        Ok(Arc::new(Self {
            local_peer_id,
            node_key,
            bus,
            cmd_tx,
        }))
    }

    /// Hex node key of this host's transport identity.
    pub fn node_key(&self) -> &str {
        &self.node_key
    }

    /// Stop the driver task; in-flight sessions see closed channels.
    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
    }

    async fn send_command(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!("transport driver is gone, dropping command");
        }
    }
}

#[async_trait]
impl Messenger for Communication {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn send_to_peer(&self, peer: PeerId, msg: WrappedMessage) {
        self.send_command(Command::SendTss { peer, msg }).await;
    }

    async fn broadcast(&self, peers: Vec<PeerId>, msg: WrappedMessage) {
        self.send_command(Command::Broadcast { peers, msg }).await;
    }

    async fn join_party(
        &self,
        leader: PeerId,
        request: JoinPartyRequest,
        timeout: Duration,
    ) -> Result<JoinPartyResponse, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::JoinParty {
            leader,
            request,
            reply: reply_tx,
        })
        .await;

        match tokio::time::timeout(timeout + JOIN_PARTY_SLACK, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetworkError::ChannelClosed),
            Err(_) => Err(NetworkError::Timeout(format!(
                "no join-party response from leader {}",
                leader
            ))),
        }
    }

    async fn register_join_party(&self, msg_id: &str) -> mpsc::Receiver<JoinPartyEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.send_command(Command::RegisterJoinParty {
            msg_id: msg_id.to_string(),
            sender: tx,
        })
        .await;
        rx
    }

    async fn unregister_join_party(&self, msg_id: &str) {
        self.send_command(Command::UnregisterJoinParty {
            msg_id: msg_id.to_string(),
        })
        .await;
    }

    fn subscribe(&self, types: &[MessageType], msg_id: &str) -> mpsc::Receiver<InboundMessage> {
        self.bus.subscribe(types, msg_id)
    }

    fn unsubscribe(&self, types: &[MessageType], msg_id: &str) {
        self.bus.unsubscribe(types, msg_id)
    }

    async fn peer_addresses(&self) -> Vec<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(Command::PeerAddresses { reply: reply_tx })
            .await;
        reply_rx.await.unwrap_or_default()
    }
}

struct SwarmDriver {
    swarm: Swarm<TssBehaviour>,
    local_peer_id: PeerId,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    bus: Arc<SubscriptionBus>,
    rendezvous: RecordKey,
    /// Cohort peers learned from rendezvous provider queries.
    known_peers: HashSet<PeerId>,
    /// Listen addresses reported by identify, for the address book.
    addr_book: HashMap<PeerId, HashSet<Multiaddr>>,
    pending_outbound_join:
        HashMap<OutboundRequestId, oneshot::Sender<Result<JoinPartyResponse, NetworkError>>>,
    /// Open inbound join-party streams awaiting a leader decision.
    inbound_join_streams: HashMap<u64, ResponseChannel<JoinPartyResponse>>,
    join_sessions: HashMap<String, mpsc::Sender<JoinPartyEvent>>,
    /// Requests that raced ahead of the local session registration.
    early_join_requests: HashMap<String, Vec<(PeerId, JoinPartyRequest, u64)>>,
    next_stream_token: u64,
}

impl SwarmDriver {
    async fn run(mut self) {
        let mut discovery = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(cmd) => {
                            if self.handle_command(cmd) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = self.swarm.select_next_some() => self.handle_event(event),
                _ = discovery.tick() => {
                    self.swarm.behaviour_mut().kademlia.get_providers(self.rendezvous.clone());
                    let _ = self.swarm.behaviour_mut().kademlia.bootstrap();
                }
            }
        }
        info!("p2p driver stopped");
    }

    /// Returns true when the driver should shut down.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendTss { peer, msg } => {
                if peer != self.local_peer_id {
                    self.swarm.behaviour_mut().tss.send_request(&peer, msg);
                }
            }
            Command::Broadcast { peers, msg } => {
                let targets: Vec<PeerId> = if peers.is_empty() {
                    self.known_peers.iter().copied().collect()
                } else {
                    peers
                };
                for peer in targets {
                    if peer == self.local_peer_id {
                        continue;
                    }
                    self.swarm.behaviour_mut().tss.send_request(&peer, msg.clone());
                }
            }
            Command::JoinParty {
                leader,
                request,
                reply,
            } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .join_party
                    .send_request(&leader, request);
                self.pending_outbound_join.insert(id, reply);
            }
            Command::RegisterJoinParty { msg_id, sender } => {
                if let Some(early) = self.early_join_requests.remove(&msg_id) {
                    for (peer, request, token) in early {
                        self.forward_join_event(peer, request, token, sender.clone());
                    }
                }
                self.join_sessions.insert(msg_id, sender);
            }
            Command::UnregisterJoinParty { msg_id } => {
                self.join_sessions.remove(&msg_id);
                self.early_join_requests.remove(&msg_id);
            }
            Command::JoinPartyReply { token, response } => {
                if let Some(channel) = self.inbound_join_streams.remove(&token) {
                    if self
                        .swarm
                        .behaviour_mut()
                        .join_party
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!("join-party stream went away before the response was sent");
                    }
                }
            }
            Command::JoinPartyAbandon { token } => {
                self.inbound_join_streams.remove(&token);
            }
            Command::PeerAddresses { reply } => {
                let mut addrs = Vec::new();
                for (peer, peer_addrs) in &self.addr_book {
                    for addr in peer_addrs {
                        addrs.push(format!("{}/p2p/{}", addr, peer));
                    }
                }
                addrs.sort();
                let _ = reply.send(addrs);
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn handle_event(&mut self, event: SwarmEvent<TssBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(behaviour_event) => self.handle_behaviour_event(behaviour_event),
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("connection established with {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("connection with {} closed: {:?}", peer_id, cause);
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!("outgoing connection error to {:?}: {}", peer_id, error);
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                debug!("incoming connection error: {}", error);
            }
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: TssBehaviourEvent) {
        match event {
            TssBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                result:
                    kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                        providers,
                        ..
                    })),
                ..
            }) => {
                for peer in providers {
                    if peer != self.local_peer_id && self.known_peers.insert(peer) {
                        info!("discovered cohort peer {}", peer);
                    }
                }
            }
            TssBehaviourEvent::Kademlia(_) => {}
            TssBehaviourEvent::Identify(identify::Event::Received { peer_id, info }) => {
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    self.addr_book.entry(peer_id).or_default().insert(addr);
                }
            }
            TssBehaviourEvent::Identify(_) => {}
            TssBehaviourEvent::Ping(_) => {}
            TssBehaviourEvent::Tss(event) => self.handle_tss_event(event),
            TssBehaviourEvent::JoinParty(event) => self.handle_join_party_event(event),
        }
    }

    fn handle_tss_event(&mut self, event: request_response::Event<WrappedMessage, TssAck>) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.bus.deliver(InboundMessage {
                        peer,
                        wrapped: request,
                    });
                    let _ = self.swarm.behaviour_mut().tss.send_response(channel, TssAck);
                }
                request_response::Message::Response { .. } => {}
            },
            request_response::Event::OutboundFailure { peer, error, .. } => {
                // Not fatal to the session: the silent peer shows up in the
                // blame evidence instead.
                warn!("failed to deliver frame to {}: {}", peer, error);
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("inbound stream failure from {}: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_join_party_event(
        &mut self,
        event: request_response::Event<JoinPartyRequest, JoinPartyResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let token = self.next_stream_token;
                    self.next_stream_token += 1;
                    self.inbound_join_streams.insert(token, channel);

                    let session_tx = self.join_sessions.get(&request.msg_id).cloned();
                    match session_tx {
                        Some(tx) => {
                            self.forward_join_event(peer, request, token, tx);
                        }
                        None => {
                            debug!(
                                "join-party request from {} for unknown session {}, parking",
                                peer, request.msg_id
                            );
                            self.early_join_requests
                                .entry(request.msg_id.clone())
                                .or_default()
                                .push((peer, request, token));
                        }
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_outbound_join.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
            } => {
                if let Some(reply) = self.pending_outbound_join.remove(&request_id) {
                    let _ = reply.send(Err(NetworkError::JoinPartyFailed {
                        leader: peer.to_string(),
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("inbound join-party failure from {}: {}", peer, error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn forward_join_event(
        &mut self,
        peer: PeerId,
        request: JoinPartyRequest,
        token: u64,
        session_tx: mpsc::Sender<JoinPartyEvent>,
    ) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = JoinPartyEvent {
            from: peer,
            request,
            reply: reply_tx,
        };
        if session_tx.try_send(event).is_err() {
            warn!("join-party session channel full or gone, dropping request");
            self.inbound_join_streams.remove(&token);
            return;
        }

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            match reply_rx.await {
                Ok(response) => {
                    let _ = cmd_tx.send(Command::JoinPartyReply { token, response }).await;
                }
                Err(_) => {
                    let _ = cmd_tx.send(Command::JoinPartyAbandon { token }).await;
                }
            }
        });
    }
}
