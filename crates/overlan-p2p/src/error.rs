//! Overlay host error types

use libp2p::PeerId;
use thiserror::Error;

/// Errors surfaced by the overlay host lifecycle
#[derive(Debug, Error)]
pub enum P2pError {
    /// A configured private key could not be unmarshalled
    #[error("load identity key: {0}")]
    IdentityLoad(String),

    /// A fresh identity key could not be produced or exported
    #[error("generate identity key: {0}")]
    IdentityGenerate(String),

    /// Building the swarm or binding listen addresses failed
    #[error("construct host: {0}")]
    HostConstruct(String),

    /// DHT self-bootstrap failed
    #[error("bootstrap dht: {0}")]
    BootstrapDht(String),

    /// A routing lookup completed without locating the peer
    #[error("peer {0} not found in the DHT")]
    PeerNotFound(PeerId),

    /// Dialing a peer failed
    #[error("dial {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },

    /// A dial was suppressed because the peer is in backoff
    #[error("dial to {0} suppressed by backoff")]
    DialBackoff(PeerId),

    /// Opening a stream to a connected peer failed
    #[error("open stream to {peer}: {reason}")]
    OpenStream { peer: PeerId, reason: String },

    /// A stream handler is already registered for the protocol
    #[error("register stream handler: {0}")]
    StreamHandler(String),

    /// The host task has already stopped
    #[error("host task is not running")]
    HostClosed,

    /// The DHT did not shut down cleanly
    #[error("close dht: {0}")]
    DhtClose(String),

    /// The host did not shut down cleanly
    #[error("close host: {0}")]
    HostClose(String),
}

/// Result type for overlay host operations
pub type P2pResult<T> = Result<T, P2pError>;
