//! Bootstrap: parallel dial barrier followed by DHT self-bootstrap

use std::time::Duration;

use futures::future::join_all;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::P2pResult;
use crate::host::{OverlayHost, PeerAddrInfo};

/// Deadline for the parallel bootstrap dials. Bounds startup latency while
/// giving the DHT at least one warm link before self-bootstrap.
pub const BOOTSTRAP_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Dials the configured bootstrap peers and seeds the DHT.
pub struct Bootstrapper {
    host: OverlayHost,
    peers: Vec<Multiaddr>,
}

impl Bootstrapper {
    pub fn new(host: OverlayHost, peers: Vec<Multiaddr>) -> Self {
        Self { host, peers }
    }

    /// Dial every bootstrap peer in parallel under a short deadline, then
    /// trigger DHT self-bootstrap.
    ///
    /// Unparseable addresses and failed dials are logged and skipped; only
    /// a DHT bootstrap failure is surfaced.
    pub async fn bootstrap(&self) -> P2pResult<()> {
        debug!("bootstrapping the DHT");

        let mut dials = Vec::new();
        for peer_addr in &self.peers {
            let Some((peer_id, addr)) = split_peer_addr(peer_addr) else {
                warn!("invalid addr info from bootstrap peer addr {}", peer_addr);
                continue;
            };

            let host = self.host.clone();
            dials.push(async move {
                let info = PeerAddrInfo {
                    peer_id,
                    addrs: vec![addr],
                };
                match timeout(BOOTSTRAP_DIAL_TIMEOUT, host.connect_peer(info)).await {
                    // The deadline cancels the dial; not worth reporting.
                    Err(_) => {}
                    Ok(Err(e)) => warn!("connect to bootstrap node: {}", e),
                    Ok(Ok(())) => {
                        info!("connection established with bootstrap node: {}", peer_id);
                    }
                }
            });
        }
        join_all(dials).await;
        debug!("bootstrap dial barrier complete");

        self.host.bootstrap_dht().await
    }
}

/// Split a full bootstrap multiaddress into the peer id and the dialable
/// remainder.
pub fn split_peer_addr(addr: &Multiaddr) -> Option<(PeerId, Multiaddr)> {
    let mut base = addr.clone();
    match base.pop() {
        Some(Protocol::P2p(peer_id)) => Some((peer_id, base)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_full_addresses() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/203.0.113.5/udp/4361/quic-v1/p2p/{peer_id}")
            .parse()
            .unwrap();

        let (id, base) = split_peer_addr(&addr).unwrap();
        assert_eq!(id, peer_id);
        assert_eq!(base, "/ip4/203.0.113.5/udp/4361/quic-v1".parse::<Multiaddr>().unwrap());
    }

    #[test]
    fn rejects_addresses_without_peer_id() {
        let addr: Multiaddr = "/ip4/203.0.113.5/tcp/4361".parse().unwrap();
        assert!(split_peer_addr(&addr).is_none());
    }

    #[test]
    fn rejects_empty_address() {
        let addr = Multiaddr::empty();
        assert!(split_peer_addr(&addr).is_none());
    }
}
