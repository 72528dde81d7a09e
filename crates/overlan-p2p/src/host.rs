//! Overlay host
//!
//! The swarm runs on a background task behind a command channel. Cheap
//! observables (connections, peer store, observed addresses) are mirrored
//! into shared state the task keeps current; queries that need the swarm
//! itself (routing lookups, dials, trims) round-trip through commands.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::StreamExt;
use libp2p::kad::{self, QueryId};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{dial_opts::DialOpts, ConnectionId, DialError, SwarmEvent};
use libp2p::{autonat, identify, relay, upnp};
use libp2p::{Multiaddr, PeerId, StreamProtocol, Swarm};
use libp2p::identity::Keypair;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bandwidth::{BandwidthCounter, BandwidthStats};
use crate::behaviour::{build_swarm, OverlayBehaviour, OverlayBehaviourEvent};
use crate::connmgr::{ConnManager, ConnManagerConfig};
use crate::error::{P2pError, P2pResult};
use crate::reachability::{Reachability, ReachabilityObserver};
use crate::streams::{CountedStream, Direction, StreamAccountant};
use crate::EVENT_BUS_CAPACITY;

const COMMAND_CAP: usize = 32;
const RELAY_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
const RELAY_HOP_PROTOCOL: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// A peer id together with its known dialable addresses.
#[derive(Debug, Clone)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// One live connection to a peer.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub connection_id: ConnectionId,
    pub direction: Direction,
    pub remote_addr: Multiaddr,
    pub opened_at: Instant,
}

/// Events published on the host event bus.
#[derive(Debug, Clone)]
pub enum HostEvent {
    LocalReachabilityChanged(Reachability),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// Callback invoked from the swarm loop on connection changes. Keep it
/// short; it runs inline with event processing.
pub type ConnectionHook = Box<dyn Fn(PeerId, &ConnInfo) + Send + Sync>;

/// Relay tuning, a constructor parameter rather than process-global state.
#[derive(Debug, Clone)]
pub struct RelayTuning {
    /// How many concurrent relay reservations to hold while private.
    pub desired_relays: usize,
    /// How long to wait after startup before requesting reservations.
    pub boot_delay: Duration,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            desired_relays: 2,
            boot_delay: Duration::from_secs(10),
        }
    }
}

/// Host construction parameters.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub user_agent: String,
    pub conn_manager: ConnManagerConfig,
    pub relay: RelayTuning,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![
                "/ip4/0.0.0.0/tcp/0".parse().expect("static multiaddr"),
                "/ip4/0.0.0.0/udp/0/quic-v1".parse().expect("static multiaddr"),
            ],
            user_agent: concat!("overlan/", env!("CARGO_PKG_VERSION")).to_string(),
            conn_manager: ConnManagerConfig::default(),
            relay: RelayTuning::default(),
        }
    }
}

enum Command {
    FindPeer(PeerId, oneshot::Sender<P2pResult<PeerAddrInfo>>),
    Connect(PeerAddrInfo, oneshot::Sender<P2pResult<()>>),
    BootstrapDht(oneshot::Sender<P2pResult<()>>),
    AnnouncedAddrs(oneshot::Sender<Vec<Multiaddr>>),
    RoutingTableSize(oneshot::Sender<usize>),
    TrimOpenConns(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Default)]
struct ConnHooks {
    connected: Vec<ConnectionHook>,
    disconnected: Vec<ConnectionHook>,
}

#[derive(Default)]
struct SharedState {
    connections: RwLock<HashMap<PeerId, Vec<ConnInfo>>>,
    peer_store: RwLock<HashMap<PeerId, HashSet<Multiaddr>>>,
    observed_addrs: RwLock<Vec<Multiaddr>>,
    hooks: std::sync::Mutex<ConnHooks>,
}

/// Handle to the overlay host. Cheap to clone; every clone talks to the
/// same background swarm task.
#[derive(Clone)]
pub struct OverlayHost {
    local_peer_id: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    stream_control: libp2p_stream::Control,
    shared: Arc<SharedState>,
    conn_manager: Arc<ConnManager>,
    streams: Arc<StreamAccountant>,
    bandwidth: Arc<BandwidthCounter>,
    reachability: Arc<ReachabilityObserver>,
    events_tx: broadcast::Sender<HostEvent>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl OverlayHost {
    /// Construct the host: swarm with identity, transports, security,
    /// discovery and NAT traversal; listen addresses bound; accounting and
    /// the event bus wired; the swarm task running.
    pub async fn init(keypair: Keypair, config: HostConfig) -> P2pResult<Self> {
        let local_peer_id = keypair.public().to_peer_id();
        let mut swarm = build_swarm(&keypair, &config)?;

        for addr in &config.listen_addrs {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| P2pError::HostConstruct(format!("listen on {addr}: {e}")))?;
        }

        let stream_control = swarm.behaviour().stream.new_control();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAP);
        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let shared = Arc::new(SharedState::default());
        let conn_manager = Arc::new(ConnManager::new(config.conn_manager.clone()));
        let streams = Arc::new(StreamAccountant::new());
        let bandwidth = Arc::new(BandwidthCounter::new());
        let reachability = Arc::new(ReachabilityObserver::spawn(events_tx.subscribe()));

        let task = HostTask {
            swarm,
            cmd_rx,
            shared: Arc::clone(&shared),
            conn_manager: Arc::clone(&conn_manager),
            events_tx: events_tx.clone(),
            reachability: Reachability::Unknown,
            pending_dials: HashMap::new(),
            pending_lookups: HashMap::new(),
            pending_bootstrap: None,
            relay: AutoRelayState::new(config.relay.clone()),
        };
        let handle = tokio::spawn(task.run());

        debug!("overlay host created, we are: {}", local_peer_id);

        Ok(Self {
            local_peer_id,
            cmd_tx,
            stream_control,
            shared,
            conn_manager,
            streams,
            bandwidth,
            reachability,
            events_tx,
            task: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Subscribe to host events (reachability, peer connect/disconnect).
    pub fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.events_tx.subscribe()
    }

    /// Look a peer up in the DHT.
    pub async fn find_peer(&self, peer_id: PeerId) -> P2pResult<PeerAddrInfo> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::FindPeer(peer_id, tx))
            .await
            .map_err(|_| P2pError::HostClosed)?;
        rx.await.map_err(|_| P2pError::HostClosed)?
    }

    /// Dial a peer at its known addresses. Dials suppressed by backoff fail
    /// fast; use [`Self::clear_backoff`] to override.
    pub async fn connect_peer(&self, info: PeerAddrInfo) -> P2pResult<()> {
        if self.conn_manager.backoff_active(&info.peer_id) {
            return Err(P2pError::DialBackoff(info.peer_id));
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect(info, tx))
            .await
            .map_err(|_| P2pError::HostClosed)?;
        rx.await.map_err(|_| P2pError::HostClosed)?
    }

    /// Open an accounted stream to a connected peer.
    pub async fn new_stream(
        &self,
        peer_id: PeerId,
        protocol: StreamProtocol,
    ) -> P2pResult<CountedStream> {
        let mut control = self.stream_control.clone();
        let stream = control
            .open_stream(peer_id, protocol.clone())
            .await
            .map_err(|e| P2pError::OpenStream {
                peer: peer_id,
                reason: e.to_string(),
            })?;
        Ok(CountedStream::new(
            stream,
            peer_id,
            protocol,
            Direction::Outbound,
            Arc::clone(&self.streams),
            Arc::clone(&self.bandwidth),
        ))
    }

    /// Register a handler for inbound streams on `protocol`. The handler is
    /// invoked once per accepted stream and owns it from then on.
    pub fn set_stream_handler<F>(&self, protocol: StreamProtocol, handler: F) -> P2pResult<()>
    where
        F: Fn(PeerId, CountedStream) + Send + Sync + 'static,
    {
        let mut control = self.stream_control.clone();
        let mut incoming = control
            .accept(protocol.clone())
            .map_err(|e| P2pError::StreamHandler(e.to_string()))?;

        let streams = Arc::clone(&self.streams);
        let bandwidth = Arc::clone(&self.bandwidth);
        tokio::spawn(async move {
            while let Some((peer_id, stream)) = incoming.next().await {
                let counted = CountedStream::new(
                    stream,
                    peer_id,
                    protocol.clone(),
                    Direction::Inbound,
                    Arc::clone(&streams),
                    Arc::clone(&bandwidth),
                );
                handler(peer_id, counted);
            }
            debug!("stream handler task stopped");
        });
        Ok(())
    }

    pub async fn is_connected(&self, peer_id: PeerId) -> bool {
        self.shared.connections.read().await.contains_key(&peer_id)
    }

    pub async fn conns_to_peer(&self, peer_id: PeerId) -> Vec<ConnInfo> {
        self.shared
            .connections
            .read()
            .await
            .get(&peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn connected_peers_count(&self) -> usize {
        self.shared.connections.read().await.len()
    }

    /// Total live connections across all peers.
    pub async fn open_connections_count(&self) -> usize {
        self.shared
            .connections
            .read()
            .await
            .values()
            .map(Vec::len)
            .sum()
    }

    pub async fn routing_table_size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RoutingTableSize(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Peers we hold at least one address for.
    pub async fn peers_with_addrs_count(&self) -> usize {
        self.shared.peer_store.read().await.len()
    }

    /// Addresses the host announces: bound listeners plus confirmed
    /// external addresses.
    pub async fn announced_as(&self) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::AnnouncedAddrs(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Addresses other peers have observed us at.
    pub async fn own_observed_addrs(&self) -> Vec<Multiaddr> {
        self.shared.observed_addrs.read().await.clone()
    }

    /// The latest cached reachability.
    pub fn reachability(&self) -> Reachability {
        self.reachability.current()
    }

    pub fn open_streams_count(&self) -> i64 {
        self.streams.open_count()
    }

    pub fn total_streams_inbound(&self) -> u64 {
        self.streams.total_inbound()
    }

    pub fn total_streams_outbound(&self) -> u64 {
        self.streams.total_outbound()
    }

    /// Live streams grouped by protocol and direction.
    pub fn open_stream_stats(&self) -> HashMap<String, HashMap<&'static str, usize>> {
        self.streams.open_stats()
    }

    pub fn network_stats(&self) -> BandwidthStats {
        self.bandwidth.totals()
    }

    pub fn network_stats_by_protocol(&self) -> HashMap<String, BandwidthStats> {
        self.bandwidth.by_protocol()
    }

    pub fn network_stats_by_peer(&self) -> HashMap<PeerId, BandwidthStats> {
        self.bandwidth.by_peer()
    }

    pub fn network_stats_for_peer(&self, peer_id: PeerId) -> BandwidthStats {
        self.bandwidth.for_peer(&peer_id)
    }

    pub fn clear_backoff(&self, peer_id: PeerId) {
        self.conn_manager.clear_backoff(&peer_id);
    }

    pub fn change_protected_status(&self, peer_id: PeerId, tag: &str, protected: bool) {
        self.conn_manager.change_protected_status(peer_id, tag, protected);
    }

    /// Force a trim down to the low watermark. Returns how many
    /// connections were closed.
    pub async fn trim_open_connections(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::TrimOpenConns(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub fn connections_last_trim(&self) -> Option<SystemTime> {
        self.conn_manager.last_trim()
    }

    /// Install callbacks fired from the swarm loop when connections open
    /// and close.
    pub fn subscribe_connection_events(
        &self,
        on_connected: ConnectionHook,
        on_disconnected: ConnectionHook,
    ) {
        let mut hooks = self
            .shared
            .hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        hooks.connected.push(on_connected);
        hooks.disconnected.push(on_disconnected);
    }

    /// Trigger DHT self-bootstrap and wait for the query to finish.
    pub async fn bootstrap_dht(&self) -> P2pResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::BootstrapDht(tx))
            .await
            .map_err(|_| P2pError::HostClosed)?;
        rx.await.map_err(|_| P2pError::HostClosed)?
    }

    /// Shut the host down: fail outstanding DHT work, then stop the swarm.
    /// Safe to call from any handle; later calls report the host closed.
    pub async fn close(&self) -> P2pResult<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown(tx))
            .await
            .map_err(|_| P2pError::HostClose("host task is not running".into()))?;
        rx.await
            .map_err(|_| P2pError::DhtClose("host task dropped before the dht shut down".into()))?;
        if let Some(handle) = self.task.lock().await.take() {
            handle
                .await
                .map_err(|e| P2pError::HostClose(e.to_string()))?;
        }
        Ok(())
    }
}

struct AutoRelayState {
    tuning: RelayTuning,
    ticker: tokio::time::Interval,
    candidates: HashSet<PeerId>,
    pending: HashSet<PeerId>,
    active: HashSet<PeerId>,
}

impl AutoRelayState {
    fn new(tuning: RelayTuning) -> Self {
        let start = tokio::time::Instant::now() + tuning.boot_delay;
        let mut ticker = tokio::time::interval_at(start, RELAY_MAINTENANCE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            tuning,
            ticker,
            candidates: HashSet::new(),
            pending: HashSet::new(),
            active: HashSet::new(),
        }
    }
}

struct HostTask {
    swarm: Swarm<OverlayBehaviour>,
    cmd_rx: mpsc::Receiver<Command>,
    shared: Arc<SharedState>,
    conn_manager: Arc<ConnManager>,
    events_tx: broadcast::Sender<HostEvent>,
    reachability: Reachability,
    pending_dials: HashMap<ConnectionId, (PeerId, oneshot::Sender<P2pResult<()>>)>,
    pending_lookups: HashMap<QueryId, (PeerId, oneshot::Sender<P2pResult<PeerAddrInfo>>)>,
    pending_bootstrap: Option<oneshot::Sender<P2pResult<()>>>,
    relay: AutoRelayState,
}

impl HostTask {
    async fn run(mut self) {
        debug!("overlay host task started");
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("command channel closed, stopping host task");
                        break;
                    }
                },
                _ = self.relay.ticker.tick() => self.maintain_relays().await,
            }
        }
        debug!("overlay host task stopped");
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        // DHT first: fail its outstanding queries, then let the swarm (and
        // with it the host) go down when the task returns.
        for (_, (_, tx)) in self.pending_lookups.drain() {
            let _ = tx.send(Err(P2pError::HostClosed));
        }
        if let Some(tx) = self.pending_bootstrap.take() {
            let _ = tx.send(Err(P2pError::HostClosed));
        }
        for (_, (_, tx)) in self.pending_dials.drain() {
            let _ = tx.send(Err(P2pError::HostClosed));
        }
        let _ = reply.send(());
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::FindPeer(peer_id, reply) => {
                if self.shared.connections.read().await.contains_key(&peer_id) {
                    let addrs = Self::known_addrs(&self.shared, &peer_id).await;
                    let _ = reply.send(Ok(PeerAddrInfo { peer_id, addrs }));
                    return;
                }
                let query_id = self.swarm.behaviour_mut().kad.get_closest_peers(peer_id);
                self.pending_lookups.insert(query_id, (peer_id, reply));
            }
            Command::Connect(info, reply) => {
                for addr in &info.addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&info.peer_id, addr.clone());
                }
                let opts = DialOpts::peer_id(info.peer_id)
                    .addresses(info.addrs.clone())
                    .build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials
                            .insert(connection_id, (info.peer_id, reply));
                    }
                    // Already connected (or already dialing): success.
                    Err(DialError::DialPeerConditionFalse(_)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        self.conn_manager.record_dial_failure(&info.peer_id);
                        let _ = reply.send(Err(P2pError::Dial {
                            peer: info.peer_id,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::BootstrapDht(reply) => {
                match self.swarm.behaviour_mut().kad.bootstrap() {
                    Ok(_) => self.pending_bootstrap = Some(reply),
                    Err(e) => {
                        let _ = reply.send(Err(P2pError::BootstrapDht(e.to_string())));
                    }
                }
            }
            Command::AnnouncedAddrs(reply) => {
                let mut addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
                for addr in self.swarm.external_addresses() {
                    if !addrs.contains(addr) {
                        addrs.push(addr.clone());
                    }
                }
                let _ = reply.send(addrs);
            }
            Command::RoutingTableSize(reply) => {
                let size = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .kbuckets()
                    .map(|bucket| bucket.num_entries())
                    .sum();
                let _ = reply.send(size);
            }
            Command::TrimOpenConns(reply) => {
                let closed = self.trim_connections(true).await;
                let _ = reply.send(closed);
            }
            Command::Shutdown(_) => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<OverlayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {}", address);
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!("confirmed external address {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                num_established,
                ..
            } => {
                let conn = ConnInfo {
                    connection_id,
                    direction: if endpoint.is_dialer() {
                        Direction::Outbound
                    } else {
                        Direction::Inbound
                    },
                    remote_addr: endpoint.get_remote_address().clone(),
                    opened_at: Instant::now(),
                };
                self.shared
                    .connections
                    .write()
                    .await
                    .entry(peer_id)
                    .or_default()
                    .push(conn.clone());
                self.conn_manager.clear_backoff(&peer_id);
                if let Some((_, reply)) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(()));
                }
                if num_established.get() == 1 {
                    debug!("connection established with {}", peer_id);
                    let _ = self.events_tx.send(HostEvent::PeerConnected(peer_id));
                }
                self.fire_hooks(peer_id, &conn, true);
                self.trim_connections(false).await;
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                cause,
                ..
            } => {
                let removed = {
                    let mut connections = self.shared.connections.write().await;
                    let removed = connections.get_mut(&peer_id).and_then(|conns| {
                        let index = conns
                            .iter()
                            .position(|c| c.connection_id == connection_id)?;
                        Some(conns.swap_remove(index))
                    });
                    if connections.get(&peer_id).is_some_and(|conns| conns.is_empty()) {
                        connections.remove(&peer_id);
                    }
                    removed
                };
                if num_established == 0 {
                    debug!("connection closed with {}, cause: {:?}", peer_id, cause);
                    self.relay.active.remove(&peer_id);
                    self.relay.pending.remove(&peer_id);
                    let _ = self.events_tx.send(HostEvent::PeerDisconnected(peer_id));
                }
                if let Some(conn) = removed {
                    self.fire_hooks(peer_id, &conn, false);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                if let Some(peer_id) = peer_id {
                    self.conn_manager.record_dial_failure(&peer_id);
                }
                if let Some((peer, reply)) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(P2pError::Dial {
                        peer,
                        reason: error.to_string(),
                    }));
                } else {
                    debug!("outgoing connection error to {:?}: {}", peer_id, error);
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event).await,
            _ => {}
        }
    }

    async fn handle_behaviour_event(&mut self, event: OverlayBehaviourEvent) {
        match event {
            OverlayBehaviourEvent::Identify(identify::Event::Received {
                peer_id, info, ..
            }) => {
                {
                    let mut observed = self.shared.observed_addrs.write().await;
                    if !observed.contains(&info.observed_addr) {
                        observed.push(info.observed_addr.clone());
                    }
                }
                if !info.listen_addrs.is_empty() {
                    let mut peer_store = self.shared.peer_store.write().await;
                    peer_store
                        .entry(peer_id)
                        .or_default()
                        .extend(info.listen_addrs.iter().cloned());
                }
                for addr in &info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                }
                if info
                    .protocols
                    .iter()
                    .any(|p| p.as_ref() == RELAY_HOP_PROTOCOL)
                {
                    self.relay.candidates.insert(peer_id);
                }
            }
            OverlayBehaviourEvent::Identify(_) => {}
            OverlayBehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            }) => self.handle_kad_query(id, result, step.last).await,
            OverlayBehaviourEvent::Kad(kad::Event::RoutingUpdated {
                peer, addresses, ..
            }) => {
                let mut peer_store = self.shared.peer_store.write().await;
                peer_store
                    .entry(peer)
                    .or_default()
                    .extend(addresses.iter().cloned());
            }
            OverlayBehaviourEvent::Kad(_) => {}
            OverlayBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                let reachability = Reachability::from(&new);
                self.reachability = reachability;
                info!("reachability changed: {:?} -> {:?}", old, new);
                let _ = self
                    .events_tx
                    .send(HostEvent::LocalReachabilityChanged(reachability));
            }
            OverlayBehaviourEvent::Autonat(_) => {}
            OverlayBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
            ) => {
                self.relay.pending.remove(&relay_peer_id);
                self.relay.active.insert(relay_peer_id);
                info!("relay reservation accepted by {}", relay_peer_id);
            }
            OverlayBehaviourEvent::RelayClient(event) => {
                debug!("relay client event: {:?}", event);
            }
            OverlayBehaviourEvent::Dcutr(event) => {
                debug!(
                    "direct connection upgrade with {}: {:?}",
                    event.remote_peer_id, event.result
                );
            }
            OverlayBehaviourEvent::Upnp(event) => match event {
                upnp::Event::NewExternalAddr(addr) => info!("upnp mapped external address {}", addr),
                upnp::Event::ExpiredExternalAddr(addr) => {
                    debug!("upnp external address expired: {}", addr);
                }
                upnp::Event::GatewayNotFound => debug!("upnp gateway not found"),
                upnp::Event::NonRoutableGateway => debug!("upnp gateway is not routable"),
            },
            OverlayBehaviourEvent::Ping(_) => {}
            OverlayBehaviourEvent::Stream(_) => {}
        }
    }

    async fn handle_kad_query(&mut self, id: QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::GetClosestPeers(result) => {
                let peers = match result {
                    Ok(kad::GetClosestPeersOk { peers, .. }) => peers,
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                };
                {
                    let mut peer_store = self.shared.peer_store.write().await;
                    for peer in peers.iter().filter(|p| !p.addrs.is_empty()) {
                        peer_store
                            .entry(peer.peer_id)
                            .or_default()
                            .extend(peer.addrs.iter().cloned());
                    }
                }

                let Some((target, _)) = self.pending_lookups.get(&id) else {
                    return;
                };
                let target = *target;
                let found = peers
                    .into_iter()
                    .find(|p| p.peer_id == target && !p.addrs.is_empty());
                if found.is_some() || last {
                    if let Some((_, reply)) = self.pending_lookups.remove(&id) {
                        let _ = reply.send(match found {
                            Some(peer) => Ok(PeerAddrInfo {
                                peer_id: target,
                                addrs: peer.addrs,
                            }),
                            None => Err(P2pError::PeerNotFound(target)),
                        });
                    }
                }
            }
            kad::QueryResult::Bootstrap(result) => match result {
                Ok(_) => {
                    if last {
                        if let Some(reply) = self.pending_bootstrap.take() {
                            let _ = reply.send(Ok(()));
                        }
                    }
                }
                Err(e) => {
                    if let Some(reply) = self.pending_bootstrap.take() {
                        let _ = reply.send(Err(P2pError::BootstrapDht(e.to_string())));
                    }
                }
            },
            _ => {}
        }
    }

    async fn known_addrs(shared: &SharedState, peer_id: &PeerId) -> Vec<Multiaddr> {
        let mut addrs: Vec<Multiaddr> = shared
            .peer_store
            .read()
            .await
            .get(peer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for conn in shared
            .connections
            .read()
            .await
            .get(peer_id)
            .into_iter()
            .flatten()
        {
            if !addrs.contains(&conn.remote_addr) {
                addrs.push(conn.remote_addr.clone());
            }
        }
        addrs
    }

    fn fire_hooks(&self, peer_id: PeerId, conn: &ConnInfo, connected: bool) {
        let hooks = self
            .shared
            .hooks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let list = if connected {
            &hooks.connected
        } else {
            &hooks.disconnected
        };
        for hook in list.iter() {
            hook(peer_id, conn);
        }
    }

    /// Close connections past the watermarks. Returns the number closed.
    async fn trim_connections(&mut self, forced: bool) -> usize {
        let snapshot: Vec<(PeerId, ConnInfo)> = {
            let connections = self.shared.connections.read().await;
            connections
                .iter()
                .flat_map(|(peer, conns)| conns.iter().map(|c| (*peer, c.clone())))
                .collect()
        };
        let victims = self.conn_manager.select_victims(&snapshot, forced);
        if victims.is_empty() {
            if forced {
                self.conn_manager.mark_trimmed();
            }
            return 0;
        }

        let mut closed = 0;
        for (peer_id, connection_id) in victims {
            if self.swarm.close_connection(connection_id) {
                debug!("trimming connection to {}", peer_id);
                closed += 1;
            }
        }
        self.conn_manager.mark_trimmed();
        info!("trimmed {} open connections", closed);
        closed
    }

    /// While the host is private, hold reservations on up to the desired
    /// number of relay-capable peers.
    async fn maintain_relays(&mut self) {
        if self.relay.tuning.desired_relays == 0 || self.reachability != Reachability::Private {
            return;
        }
        let needed = self
            .relay
            .tuning
            .desired_relays
            .saturating_sub(self.relay.active.len() + self.relay.pending.len());
        if needed == 0 {
            return;
        }

        let picks: Vec<(PeerId, Multiaddr)> = {
            let peer_store = self.shared.peer_store.read().await;
            self.relay
                .candidates
                .iter()
                .filter(|p| !self.relay.active.contains(p) && !self.relay.pending.contains(p))
                .filter_map(|p| {
                    peer_store
                        .get(p)
                        .and_then(|addrs| addrs.iter().next().cloned())
                        .map(|addr| (*p, addr))
                })
                .take(needed)
                .collect()
        };

        for (peer_id, addr) in picks {
            let relay_addr = addr
                .with(Protocol::P2p(peer_id))
                .with(Protocol::P2pCircuit);
            match self.swarm.listen_on(relay_addr.clone()) {
                Ok(_) => {
                    debug!("requesting relay reservation via {}", peer_id);
                    self.relay.pending.insert(peer_id);
                }
                Err(e) => debug!("relay listen on {} failed: {}", relay_addr, e),
            }
        }
    }
}
