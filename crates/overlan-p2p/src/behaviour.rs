//! Composed network behaviour and swarm construction

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{autonat, dcutr, identify, kad, noise, ping, relay, tcp, tls, upnp, yamux};
use libp2p::{PeerId, StreamProtocol, Swarm};

use crate::error::{P2pError, P2pResult};
use crate::host::HostConfig;

/// Kademlia stream protocol under the overlay namespace.
const DHT_KAD_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/awl/kad/1.0.0");

/// Identify protocol id, shared with the wider libp2p ecosystem.
const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";

/// How long idle connections are kept before the swarm reaps them.
const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything the overlay host speaks on top of its transports.
#[derive(NetworkBehaviour)]
pub(crate) struct OverlayBehaviour {
    pub kad: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub autonat: autonat::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub upnp: upnp::tokio::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

impl OverlayBehaviour {
    fn new(key: &Keypair, relay_client: relay::client::Behaviour, user_agent: &str) -> Self {
        let local_peer_id = PeerId::from(key.public());

        let store = MemoryStore::new(local_peer_id);
        let kad_config = kad::Config::new(DHT_KAD_PROTOCOL);
        let mut kad = kad::Behaviour::with_config(local_peer_id, store, kad_config);
        kad.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                .with_agent_version(user_agent.to_string()),
        );

        Self {
            kad,
            identify,
            ping: ping::Behaviour::default(),
            autonat: autonat::Behaviour::new(local_peer_id, autonat::Config::default()),
            relay_client,
            dcutr: dcutr::Behaviour::new(local_peer_id),
            upnp: upnp::tokio::Behaviour::default(),
            stream: libp2p_stream::Behaviour::new(),
        }
    }
}

/// Build the swarm: TCP and QUIC transports (QUIC preferred for dials that
/// offer both), TLS-then-Noise security on TCP, relay client wired into
/// the behaviour for auto-relay.
pub(crate) fn build_swarm(
    keypair: &Keypair,
    config: &HostConfig,
) -> P2pResult<Swarm<OverlayBehaviour>> {
    let user_agent = config.user_agent.clone();
    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            (tls::Config::new, noise::Config::new),
            yamux::Config::default,
        )
        .map_err(|e| P2pError::HostConstruct(format!("tcp transport: {e}")))?
        .with_quic()
        .with_dns()
        .map_err(|e| P2pError::HostConstruct(format!("dns resolver: {e}")))?
        .with_relay_client((tls::Config::new, noise::Config::new), yamux::Config::default)
        .map_err(|e| P2pError::HostConstruct(format!("relay transport: {e}")))?
        .with_behaviour(|key, relay_client| {
            OverlayBehaviour::new(key, relay_client, &user_agent)
        })
        .map_err(|e| P2pError::HostConstruct(format!("behaviour: {e}")))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(IDLE_CONNECTION_TIMEOUT))
        .build();

    Ok(swarm)
}
