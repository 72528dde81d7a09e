//! Data-plane error types

use thiserror::Error;

/// Errors surfaced by the TUN data-plane
#[derive(Debug, Error)]
pub enum VpnError {
    /// Creating the kernel TUN interface failed
    #[error("failed to create TUN device: {0}")]
    TunCreate(String),

    /// Reading back the effective interface name failed
    #[error("failed to get TUN interface name: {0}")]
    TunQueryName(String),

    /// Reading back the effective interface MTU failed
    #[error("failed to get TUN mtu: {0}")]
    TunQueryMtu(String),

    /// Writing an injected packet to the device failed
    #[error("write packet to tun: {0}")]
    TunWrite(String),

    /// Reading from the device failed with something other than EOF
    #[error("read packet from tun: {0}")]
    TunRead(String),
}

/// Result type for data-plane operations
pub type VpnResult<T> = Result<T, VpnError>;
