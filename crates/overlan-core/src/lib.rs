//! Overlan Core
//!
//! Glue between the TUN data-plane and the overlay host:
//! - TOML configuration with identity write-back
//! - The packet tunnel (one overlay packet per stream)
//! - Lifecycle orchestration and shutdown ordering

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod tunnel;

pub use config::{Config, IdentityConfig, KnownPeer, P2pConfig, VpnConfig};
pub use error::{CoreError, CoreResult};
pub use orchestrator::Application;
pub use tunnel::{Tunnel, PACKET_PROTOCOL};
