//! Packet tunnel
//!
//! Couples the TUN data-plane to the overlay: outbound packets leave on a
//! fresh stream per packet, inbound streams are read to EOF into a pooled
//! buffer and injected with the sender's overlay address. EOF is the
//! packet delimiter on both sides.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::AsyncWriteExt;
use overlan_p2p::{CountedStream, OverlayHost, PeerId, StreamProtocol};
use overlan_vpn::{PacketBuffer, TunDevice};
use tokio::sync::{watch, RwLock};
use tracing::{debug, trace, warn};

use crate::error::CoreResult;

/// Protocol id for overlay packet streams: one packet per stream.
pub const PACKET_PROTOCOL: StreamProtocol = StreamProtocol::new("/awl/tunnel/1.0.0");

/// Bidirectional pump between the TUN device and overlay streams.
pub struct Tunnel {
    host: OverlayHost,
    tun: Arc<TunDevice>,
    peer_by_ip: RwLock<HashMap<Ipv4Addr, PeerId>>,
    ip_by_peer: RwLock<HashMap<PeerId, Ipv4Addr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Tunnel {
    /// Register the inbound stream handler and start the outbound pump.
    pub fn start(host: OverlayHost, tun: Arc<TunDevice>) -> CoreResult<Arc<Self>> {
        let (shutdown_tx, _) = watch::channel(false);
        let tunnel = Arc::new(Self {
            host: host.clone(),
            tun,
            peer_by_ip: RwLock::new(HashMap::new()),
            ip_by_peer: RwLock::new(HashMap::new()),
            shutdown_tx,
        });

        let inbound = Arc::clone(&tunnel);
        host.set_stream_handler(PACKET_PROTOCOL, move |peer_id, stream| {
            let tunnel = Arc::clone(&inbound);
            tokio::spawn(async move {
                tunnel.handle_inbound_stream(peer_id, stream).await;
            });
        })?;

        tunnel.spawn_outbound_pump();
        Ok(tunnel)
    }

    /// Replace the overlay address mapping.
    pub async fn set_peers(&self, peers: Vec<(PeerId, Ipv4Addr)>) {
        let mut peer_by_ip = self.peer_by_ip.write().await;
        let mut ip_by_peer = self.ip_by_peer.write().await;
        peer_by_ip.clear();
        ip_by_peer.clear();
        for (peer_id, addr) in peers {
            peer_by_ip.insert(addr, peer_id);
            ip_by_peer.insert(peer_id, addr);
        }
    }

    /// Stop the outbound pump. Inbound streams stop with the host.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn handle_inbound_stream(&self, peer_id: PeerId, mut stream: CountedStream) {
        let mut packet = self.tun.get_temp_packet();

        match packet.read_from(&mut stream).await {
            Ok(_) => {}
            Err(e) => {
                debug!("reading packet stream from {}: {}", peer_id, e);
                self.tun.put_temp_packet(packet);
                return;
            }
        }
        if !packet.parse() {
            debug!("dropping unparseable ingress packet from {}", peer_id);
            self.tun.put_temp_packet(packet);
            return;
        }

        let sender_ip = self.ip_by_peer.read().await.get(&peer_id).copied();
        match sender_ip {
            None => debug!("dropping ingress packet from unknown peer {}", peer_id),
            Some(sender_ip) => {
                if let Err(e) = self.tun.write_packet(&mut packet, sender_ip).await {
                    warn!("{}", e);
                }
            }
        }
        self.tun.put_temp_packet(packet);
    }

    fn spawn_outbound_pump(self: &Arc<Self>) {
        let tunnel = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!("tunnel outbound pump started");
            let outbound = tunnel.tun.outbound_chan();

            loop {
                let packet = {
                    let mut outbound = outbound.lock().await;
                    tokio::select! {
                        packet = outbound.recv() => packet,
                        _ = shutdown_rx.changed() => None,
                    }
                };
                let Some(mut packet) = packet else { break };
                tunnel.forward_packet(&mut packet).await;
                tunnel.tun.put_temp_packet(packet);
            }

            debug!("tunnel outbound pump stopped");
        });
    }

    /// Deliver one rewritten packet to the peer owning its destination
    /// address. Unroutable packets are dropped.
    async fn forward_packet(&self, packet: &mut PacketBuffer) {
        if packet.is_ipv6() {
            trace!("dropping outbound ipv6 packet");
            return;
        }
        let Some(dst) = packet.dst().and_then(ipv4_from_view) else {
            return;
        };
        let peer_id = self.peer_by_ip.read().await.get(&dst).copied();
        let Some(peer_id) = peer_id else {
            trace!("no overlay peer owns {}, dropping packet", dst);
            return;
        };

        match self.host.new_stream(peer_id, PACKET_PROTOCOL).await {
            Ok(mut stream) => {
                if let Err(e) = stream.write_all(packet.packet()).await {
                    debug!("writing packet to {}: {}", peer_id, e);
                } else if let Err(e) = stream.close().await {
                    debug!("closing packet stream to {}: {}", peer_id, e);
                }
            }
            Err(e) => debug!("opening packet stream to {}: {}", peer_id, e),
        }
    }
}

fn ipv4_from_view(view: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = view.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_view_conversion() {
        assert_eq!(
            ipv4_from_view(&[10, 66, 0, 2]),
            Some(Ipv4Addr::new(10, 66, 0, 2))
        );
        assert_eq!(ipv4_from_view(&[1, 2, 3]), None);
        assert_eq!(ipv4_from_view(&[0u8; 16]), None);
    }
}
