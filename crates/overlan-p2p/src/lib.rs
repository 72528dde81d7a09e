//! Overlan Overlay Host
//!
//! Peer-to-peer host lifecycle for the overlan LAN overlay:
//! - Persistent Ed25519 identity
//! - Kademlia DHT for peer discovery (protocol prefix `/awl`)
//! - TCP + QUIC transports, TLS 1.3 and Noise security, yamux muxing
//! - Connection manager with watermarks and grace period
//! - NAT traversal: AutoNAT reachability, UPnP port mapping, relay
//!   reservations with hole punching
//! - Stream and bandwidth accounting

mod behaviour;

pub mod bandwidth;
pub mod bootstrap;
pub mod connmgr;
pub mod error;
pub mod host;
pub mod identity;
pub mod reachability;
pub mod streams;

pub use bandwidth::{BandwidthCounter, BandwidthStats};
pub use bootstrap::Bootstrapper;
pub use connmgr::{ConnManager, ConnManagerConfig};
pub use error::{P2pError, P2pResult};
pub use host::{
    ConnInfo, ConnectionHook, HostConfig, HostEvent, OverlayHost, PeerAddrInfo, RelayTuning,
};
pub use identity::HostIdentity;
pub use reachability::{Reachability, ReachabilityObserver};
pub use streams::{CountedStream, Direction, StreamAccountant};

// Re-export the libp2p types that cross the crate boundary.
pub use libp2p::{identity::Keypair, Multiaddr, PeerId, StreamProtocol};

/// Namespace for every overlay protocol; DHT streams run on
/// `<prefix>/kad/1.0.0`.
pub const DHT_PROTOCOL_PREFIX: &str = "/awl";

/// Capacity of the host event bus.
pub const EVENT_BUS_CAPACITY: usize = 64;
