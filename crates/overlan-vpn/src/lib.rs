//! Overlan TUN Data-Plane
//!
//! Zero-copy, pool-backed packet pipeline between the kernel TUN device
//! and the overlay network:
//! - Pooled packet buffers with IPv4/IPv6 address views
//! - IPv4 header and TCP/UDP checksum regeneration after address rewrite
//! - TUN device with background packet and event readers

pub mod checksum;
pub mod device;
pub mod error;
pub mod packet;

pub use device::{TunDevice, TunEvent};
pub use error::{VpnError, VpnResult};
pub use packet::{PacketBuffer, PacketPool};

/// Bytes reserved at the front of every buffer for the platform TUN header.
/// The data-plane never interprets them, only keeps them clear of payload.
pub const TUN_HEADER_OFFSET: usize = 4;

/// Offset of the header checksum field inside an IPv4 header.
pub const IPV4_CHECKSUM_OFFSET: usize = 10;

/// MTU requested when creating a new TUN interface.
pub const INTERFACE_MTU: i64 = 3500;

/// Backing buffer size: twice the interface MTU, headroom for future
/// encapsulation.
pub const MAX_CONTENT_SIZE: usize = (INTERFACE_MTU as usize) * 2;

/// Capacity of the outbound packet channel. Producers block when the
/// overlay falls behind, pushing backpressure into the kernel queue.
pub const OUTBOUND_CAP: usize = 50;

/// Minimum length of an IPv4 header.
pub const IPV4_HEADER_LEN: usize = 20;

/// Fixed length of an IPv6 header.
pub const IPV6_HEADER_LEN: usize = 40;
