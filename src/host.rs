/// Host Facade Module
///
/// libp2p's `Swarm` is single-owner and not `Sync`, so the probe host is an
/// actor: the swarm lives in a dedicated task and the cloneable [`Host`]
/// handle talks to it over a command channel with oneshot replies. Every
/// pending operation (dial, DHT query, wire request) is tracked in a map on
/// the actor and resolved from swarm events.
///
/// The same actor backs both the process-wide shared host and the ephemeral
/// hosts used for user-supplied-address probes; the latter carry no DHT and
/// shut down when the last handle is dropped.
use std::collections::{HashMap, HashSet};

use futures::StreamExt;
use libp2p::kad::{self, RecordKey};
use libp2p::request_response::{self, OutboundRequestId};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, Multiaddr, PeerId, Swarm};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::bitswap::{BitswapMessage, BitswapResponse};
use crate::error::{ProbeError, ProbeResult};
use crate::kad_wire::KadWireMessage;
use crate::network::{
    build_swarm, filter_public, HostConfig, PeerDescriptor, ProbeBehaviour, ProbeBehaviourEvent,
};

/// Commands accepted by the host actor.
enum HostCommand {
    /// Establish a connection to the peer over any of its dialable
    /// addresses.
    Dial {
        peer: PeerDescriptor,
        reply: oneshot::Sender<ProbeResult<()>>,
    },
    /// Open a block-exchange stream to verify protocol support; resolves to
    /// the negotiated protocol.
    OpenStream {
        peer: PeerId,
        reply: oneshot::Sender<ProbeResult<String>>,
    },
    /// One-shot block-exchange request.
    WantHave {
        peer: PeerId,
        message: BitswapMessage,
        reply: oneshot::Sender<ProbeResult<BitswapResponse>>,
    },
    /// Remote addresses of the currently established connections to a peer.
    ConnectionsTo {
        peer: PeerId,
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    /// Iterative DHT lookup for the closest peers to a key.
    ClosestPeers {
        key: PeerId,
        reply: oneshot::Sender<ProbeResult<Vec<PeerDescriptor>>>,
    },
    /// Direct FIND_NODE against one specific DHT server.
    FindNode {
        peer: PeerId,
        key: PeerId,
        reply: oneshot::Sender<ProbeResult<Vec<PeerDescriptor>>>,
    },
    /// Stream providers of a key into `tx` until the query finishes or the
    /// receiver is dropped.
    Providers {
        key: Vec<u8>,
        tx: mpsc::Sender<PeerDescriptor>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Cloneable handle to a probe host.
#[derive(Clone)]
pub struct Host {
    cmd_tx: mpsc::Sender<HostCommand>,
    local_peer_id: PeerId,
    ready_rx: watch::Receiver<bool>,
}

impl Host {
    /// Build the swarm for `cfg` and spawn its event loop.
    pub fn new(cfg: HostConfig) -> ProbeResult<Self> {
        let swarm = build_swarm(&cfg).map_err(|e| ProbeError::Bootstrap(e.to_string()))?;
        let local_peer_id = *swarm.local_peer_id();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        // Only the accelerated warm-up gates readiness.
        let warm_up = cfg.enable_dht && cfg.accelerated_dht;
        let (ready_tx, ready_rx) = watch::channel(!warm_up);

        let actor = HostActor {
            swarm,
            cmd_rx,
            ready_tx,
            warm_up,
            dht_enabled: cfg.enable_dht,
            allow_non_global: cfg.allow_non_global,
            blockstore: cfg.blockstore.clone(),
            provide: cfg.provide.clone(),
            connections: HashMap::new(),
            discovered: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_closest: HashMap::new(),
            pending_providers: HashMap::new(),
            pending_bitswap: HashMap::new(),
            pending_find_node: HashMap::new(),
            bootstrap_query: None,
        };
        tokio::spawn(actor.run());

        Ok(Self {
            cmd_tx,
            local_peer_id,
            ready_rx,
        })
    }

    /// An isolated host with the same gating policy and no DHT, used so a
    /// probe of a user-supplied address cannot be short-circuited by a
    /// pre-existing connection on the shared host. Dropping the handle
    /// releases the host.
    pub fn ephemeral(base: &HostConfig) -> ProbeResult<Self> {
        Self::new(base.ephemeral())
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Readiness of the DHT client. Immediately true unless the host was
    /// configured for the accelerated warm-up.
    pub fn ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until the DHT client reports ready.
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> HostCommand,
    ) -> ProbeResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| ProbeError::HostClosed)?;
        rx.await.map_err(|_| ProbeError::HostClosed)
    }

    /// Connect to any of the peer's dialable addresses. Succeeds
    /// immediately when a connection already exists.
    pub async fn connect(&self, peer: &PeerDescriptor) -> ProbeResult<()> {
        let peer = peer.clone();
        self.request(|reply| HostCommand::Dial { peer, reply })
            .await?
    }

    /// Open a block-exchange stream to the peer and return the negotiated
    /// protocol.
    pub async fn open_stream(&self, peer: PeerId) -> ProbeResult<String> {
        self.request(|reply| HostCommand::OpenStream { peer, reply })
            .await?
    }

    /// Send a block-exchange request and await the peer's reply.
    pub async fn want_have(
        &self,
        peer: PeerId,
        message: BitswapMessage,
    ) -> ProbeResult<BitswapResponse> {
        self.request(|reply| HostCommand::WantHave {
            peer,
            message,
            reply,
        })
        .await?
    }

    /// Remote multiaddrs of the established connections to the peer.
    pub async fn connections_to(&self, peer: PeerId) -> ProbeResult<Vec<Multiaddr>> {
        self.request(|reply| HostCommand::ConnectionsTo { peer, reply })
            .await
    }

    /// The K closest DHT peers to the key, with their addresses.
    pub async fn closest_peers(&self, key: PeerId) -> ProbeResult<Vec<PeerDescriptor>> {
        self.request(|reply| HostCommand::ClosestPeers { key, reply })
            .await?
    }

    /// Ask one specific DHT server for its closest peers to `key`.
    pub async fn find_node(&self, peer: PeerId, key: PeerId) -> ProbeResult<Vec<PeerDescriptor>> {
        self.request(|reply| HostCommand::FindNode { peer, key, reply })
            .await?
    }

    /// Stream providers for a key. Dropping the receiver cancels the
    /// underlying query.
    pub async fn providers(
        &self,
        key: Vec<u8>,
        buffer: usize,
    ) -> ProbeResult<mpsc::Receiver<PeerDescriptor>> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.cmd_tx
            .send(HostCommand::Providers { key, tx })
            .await
            .map_err(|_| ProbeError::HostClosed)?;
        Ok(rx)
    }

    pub async fn listen_addrs(&self) -> ProbeResult<Vec<Multiaddr>> {
        self.request(|reply| HostCommand::ListenAddrs { reply })
            .await
    }
}

enum PendingBitswap {
    Open(oneshot::Sender<ProbeResult<String>>),
    Probe(oneshot::Sender<ProbeResult<BitswapResponse>>),
}

struct HostActor {
    swarm: Swarm<ProbeBehaviour>,
    cmd_rx: mpsc::Receiver<HostCommand>,
    ready_tx: watch::Sender<bool>,
    warm_up: bool,
    dht_enabled: bool,
    allow_non_global: bool,
    blockstore: HashSet<Vec<u8>>,
    provide: Vec<Vec<u8>>,
    /// Established connections per peer, by connection id.
    connections: HashMap<PeerId, HashMap<ConnectionId, Multiaddr>>,
    /// Addresses learned through identify, queries and routing updates.
    discovered: HashMap<PeerId, HashSet<Multiaddr>>,
    pending_dials: HashMap<ConnectionId, oneshot::Sender<ProbeResult<()>>>,
    pending_closest: HashMap<kad::QueryId, oneshot::Sender<ProbeResult<Vec<PeerDescriptor>>>>,
    pending_providers: HashMap<kad::QueryId, mpsc::Sender<PeerDescriptor>>,
    pending_bitswap: HashMap<OutboundRequestId, PendingBitswap>,
    pending_find_node: HashMap<OutboundRequestId, oneshot::Sender<ProbeResult<Vec<PeerDescriptor>>>>,
    bootstrap_query: Option<kad::QueryId>,
}

impl HostActor {
    async fn run(mut self) {
        self.announce_provided_keys();
        self.start_bootstrap();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // Last handle gone: shut the host down and release all
                    // of its connections.
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
            }
        }
        debug!(peer = %self.swarm.local_peer_id(), "host event loop stopped");
    }

    /// Register the configured provider records with the local store.
    fn announce_provided_keys(&mut self) {
        let keys = std::mem::take(&mut self.provide);
        if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
            for key in keys {
                if let Err(e) = kad.start_providing(RecordKey::new(&key)) {
                    warn!("could not announce provider record: {}", e);
                }
            }
        }
    }

    /// Kick off the routing table refresh. The accelerated client gates
    /// readiness on the walk completing; the standard client refreshes in
    /// the background and is ready at once.
    fn start_bootstrap(&mut self) {
        if self.dht_enabled {
            match self.swarm.behaviour_mut().kad.as_mut() {
                Some(kad) => match kad.bootstrap() {
                    Ok(query_id) if self.warm_up => {
                        info!("warming the DHT routing table before reporting ready");
                        self.bootstrap_query = Some(query_id);
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("DHT bootstrap could not start: {}", e),
                },
                None => {}
            }
        }
        let _ = self.ready_tx.send(true);
    }

    fn handle_command(&mut self, cmd: HostCommand) {
        match cmd {
            HostCommand::Dial { peer, reply } => self.handle_dial(peer, reply),
            HostCommand::OpenStream { peer, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .bitswap
                    .send_request(&peer, BitswapMessage::empty());
                self.pending_bitswap
                    .insert(request_id, PendingBitswap::Open(reply));
            }
            HostCommand::WantHave {
                peer,
                message,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .bitswap
                    .send_request(&peer, message);
                self.pending_bitswap
                    .insert(request_id, PendingBitswap::Probe(reply));
            }
            HostCommand::ConnectionsTo { peer, reply } => {
                let addrs = self
                    .connections
                    .get(&peer)
                    .map(|conns| conns.values().cloned().collect())
                    .unwrap_or_default();
                let _ = reply.send(addrs);
            }
            HostCommand::ClosestPeers { key, reply } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let query_id = kad.get_closest_peers(key);
                        self.pending_closest.insert(query_id, reply);
                    }
                    None => {
                        let _ = reply.send(Err(ProbeError::DhtUnavailable));
                    }
                }
            }
            HostCommand::FindNode { peer, key, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .kad_wire
                    .send_request(&peer, KadWireMessage::find_node(&key));
                self.pending_find_node.insert(request_id, reply);
            }
            HostCommand::Providers { key, tx } => {
                match self.swarm.behaviour_mut().kad.as_mut() {
                    Some(kad) => {
                        let query_id = kad.get_providers(RecordKey::new(&key));
                        self.pending_providers.insert(query_id, tx);
                    }
                    // No DHT on this host: dropping the sender ends the
                    // stream with zero providers.
                    None => drop(tx),
                }
            }
            HostCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }

    fn handle_dial(&mut self, peer: PeerDescriptor, reply: oneshot::Sender<ProbeResult<()>>) {
        if self
            .connections
            .get(&peer.peer_id)
            .is_some_and(|conns| !conns.is_empty())
        {
            let _ = reply.send(Ok(()));
            return;
        }

        let dialable = if self.allow_non_global {
            peer.addrs.clone()
        } else {
            filter_public(&peer.addrs)
        };
        if dialable.is_empty() && !peer.addrs.is_empty() {
            // Every supplied address was refused by the gate; failing here
            // beats a false positive through the operator's own LAN.
            let _ = reply.send(Err(ProbeError::Unreachable(format!(
                "all {} supplied addresses are private, loopback or link-local",
                peer.addrs.len()
            ))));
            return;
        }

        let opts = if dialable.is_empty() {
            // Identity-only dial: let the DHT client supply the addresses.
            DialOpts::peer_id(peer.peer_id)
                .condition(PeerCondition::Always)
                .build()
        } else {
            DialOpts::peer_id(peer.peer_id)
                .condition(PeerCondition::Always)
                .addresses(dialable)
                .build()
        };
        let connection_id = opts.connection_id();
        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(ProbeError::Unreachable(e.to_string())));
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ProbeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let remote = endpoint.get_remote_address().clone();
                trace!(peer = %peer_id, %remote, "connection established");
                self.connections
                    .entry(peer_id)
                    .or_default()
                    .insert(connection_id, remote);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                if let Some(conns) = self.connections.get_mut(&peer_id) {
                    conns.remove(&connection_id);
                    if conns.is_empty() {
                        self.connections.remove(&peer_id);
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                error,
                ..
            } => {
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(ProbeError::Unreachable(error.to_string())));
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: ProbeBehaviourEvent) {
        match event {
            ProbeBehaviourEvent::Kad(event) => self.handle_kad_event(event),
            ProbeBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                for addr in info.listen_addrs {
                    if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                        kad.add_address(&peer_id, addr.clone());
                    }
                    self.discovered.entry(peer_id).or_default().insert(addr);
                }
            }
            ProbeBehaviourEvent::Identify(_) => {}
            ProbeBehaviourEvent::Ping(_) => {}
            ProbeBehaviourEvent::RelayClient(event) => {
                trace!(?event, "relay client");
            }
            ProbeBehaviourEvent::Dcutr(event) => {
                // A successful upgrade shows up as a second (direct)
                // connection next to the relayed one.
                debug!(?event, "dcutr");
            }
            ProbeBehaviourEvent::Bitswap(event) => self.handle_bitswap_event(event),
            ProbeBehaviourEvent::KadWire(event) => self.handle_kad_wire_event(event),
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => match result {
                kad::QueryResult::GetClosestPeers(result) => {
                    if !step.last {
                        return;
                    }
                    let peers = match result {
                        Ok(kad::GetClosestPeersOk { peers, .. }) => peers,
                        // A timed-out lookup still reports the peers found
                        // so far.
                        Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                    };
                    let descriptors: Vec<PeerDescriptor> = peers
                        .into_iter()
                        .map(|info| PeerDescriptor::new(info.peer_id, info.addrs))
                        .collect();
                    for desc in &descriptors {
                        self.remember_addrs(desc.peer_id, desc.addrs.iter().cloned());
                    }
                    if let Some(reply) = self.pending_closest.remove(&id) {
                        let _ = reply.send(Ok(descriptors));
                    }
                }
                kad::QueryResult::GetProviders(result) => {
                    let mut done = step.last;
                    if let Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) = result {
                        let mut dropped = false;
                        if let Some(tx) = self.pending_providers.get(&id) {
                            for peer in providers {
                                let addrs: Vec<Multiaddr> = self
                                    .discovered
                                    .get(&peer)
                                    .map(|set| set.iter().cloned().collect())
                                    .unwrap_or_default();
                                if tx.try_send(PeerDescriptor::new(peer, addrs)).is_err() {
                                    dropped = true;
                                    break;
                                }
                            }
                        }
                        if dropped {
                            // Consumer went away: tear the stream down.
                            done = true;
                            if let Some(kad) = self.swarm.behaviour_mut().kad.as_mut() {
                                if let Some(mut query) = kad.query_mut(&id) {
                                    query.finish();
                                }
                            }
                        }
                    }
                    if done {
                        self.pending_providers.remove(&id);
                    }
                }
                kad::QueryResult::Bootstrap(result) => {
                    if step.last && self.bootstrap_query == Some(id) {
                        self.bootstrap_query = None;
                        match result {
                            Ok(_) => info!("DHT routing table warm; host ready"),
                            Err(e) => warn!("DHT warm-up finished with error: {}", e),
                        }
                        let _ = self.ready_tx.send(true);
                    }
                }
                _ => {}
            },
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                self.remember_addrs(peer, addresses.into_vec().into_iter());
            }
            _ => {}
        }
    }

    fn handle_bitswap_event(
        &mut self,
        event: request_response::Event<BitswapMessage, BitswapResponse>,
    ) {
        match event {
            request_response::Event::Message { message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let reply = BitswapResponse::new(BitswapMessage::presence_reply(
                        &request,
                        &self.blockstore,
                    ));
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .bitswap
                        .send_response(channel, reply);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => match self.pending_bitswap.remove(&request_id) {
                    Some(PendingBitswap::Open(reply)) => {
                        let _ = reply.send(Ok(response.protocol));
                    }
                    Some(PendingBitswap::Probe(reply)) => {
                        let _ = reply.send(Ok(response));
                    }
                    None => {}
                },
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => match self.pending_bitswap.remove(&request_id) {
                Some(PendingBitswap::Open(reply)) => {
                    let _ = reply.send(Err(ProbeError::Negotiation(error.to_string())));
                }
                Some(PendingBitswap::Probe(reply)) => {
                    let _ = reply.send(Err(ProbeError::BlockProbe(error.to_string())));
                }
                None => {}
            },
            request_response::Event::InboundFailure { error, .. } => {
                trace!(%error, "inbound block exchange request failed");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_kad_wire_event(
        &mut self,
        event: request_response::Event<KadWireMessage, KadWireMessage>,
    ) {
        match event {
            request_response::Event::Message { message, .. } => match message {
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    let descriptors: Vec<PeerDescriptor> = response
                        .closer_peers
                        .iter()
                        .filter_map(|peer| {
                            let peer_id = peer.peer_id()?;
                            Some(PeerDescriptor::new(peer_id, peer.multiaddrs()))
                        })
                        .collect();
                    for desc in &descriptors {
                        self.remember_addrs(desc.peer_id, desc.addrs.iter().cloned());
                    }
                    if let Some(reply) = self.pending_find_node.remove(&request_id) {
                        let _ = reply.send(Ok(descriptors));
                    }
                }
                // The behaviour is registered outbound-only.
                request_response::Message::Request { .. } => {}
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some(reply) = self.pending_find_node.remove(&request_id) {
                    let _ = reply.send(Err(ProbeError::Unreachable(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { .. }
            | request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn remember_addrs(&mut self, peer: PeerId, addrs: impl Iterator<Item = Multiaddr>) {
        let known = self.discovered.entry(peer).or_default();
        for addr in addrs {
            known.insert(addr);
        }
    }
}
