//! Core error types

use thiserror::Error;

/// Errors surfaced by the lifecycle glue
#[derive(Debug, Error)]
pub enum CoreError {
    /// Overlay host failure
    #[error(transparent)]
    P2p(#[from] overlan_p2p::P2pError),

    /// TUN data-plane failure
    #[error(transparent)]
    Vpn(#[from] overlan_vpn::VpnError),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for lifecycle operations
pub type CoreResult<T> = Result<T, CoreError>;
