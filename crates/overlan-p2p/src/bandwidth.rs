//! Bandwidth accounting
//!
//! Byte totals for the whole host plus per-peer and per-protocol splits,
//! fed by the counted stream layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use libp2p::{PeerId, StreamProtocol};

/// A snapshot of transferred byte totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthStats {
    pub total_in: u64,
    pub total_out: u64,
}

/// Process-wide bandwidth counter shared by every stream.
#[derive(Default)]
pub struct BandwidthCounter {
    total_in: AtomicU64,
    total_out: AtomicU64,
    by_peer: Mutex<HashMap<PeerId, BandwidthStats>>,
    by_protocol: Mutex<HashMap<String, BandwidthStats>>,
}

impl BandwidthCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_inbound(&self, peer: &PeerId, protocol: &StreamProtocol, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.total_in.fetch_add(bytes, Ordering::Relaxed);
        let mut by_peer = self.by_peer.lock().unwrap_or_else(PoisonError::into_inner);
        by_peer.entry(*peer).or_default().total_in += bytes;
        drop(by_peer);
        let mut by_protocol = self
            .by_protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        by_protocol
            .entry(protocol.as_ref().to_string())
            .or_default()
            .total_in += bytes;
    }

    pub(crate) fn record_outbound(&self, peer: &PeerId, protocol: &StreamProtocol, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.total_out.fetch_add(bytes, Ordering::Relaxed);
        let mut by_peer = self.by_peer.lock().unwrap_or_else(PoisonError::into_inner);
        by_peer.entry(*peer).or_default().total_out += bytes;
        drop(by_peer);
        let mut by_protocol = self
            .by_protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        by_protocol
            .entry(protocol.as_ref().to_string())
            .or_default()
            .total_out += bytes;
    }

    /// Byte totals for the whole host.
    pub fn totals(&self) -> BandwidthStats {
        BandwidthStats {
            total_in: self.total_in.load(Ordering::Relaxed),
            total_out: self.total_out.load(Ordering::Relaxed),
        }
    }

    /// Byte totals grouped by protocol.
    pub fn by_protocol(&self) -> HashMap<String, BandwidthStats> {
        self.by_protocol
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Byte totals grouped by peer.
    pub fn by_peer(&self) -> HashMap<PeerId, BandwidthStats> {
        self.by_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Byte totals for a single peer.
    pub fn for_peer(&self, peer: &PeerId) -> BandwidthStats {
        self.by_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .copied()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTO: StreamProtocol = StreamProtocol::new("/overlan/test/bw");

    #[test]
    fn records_totals_and_splits() {
        let counter = BandwidthCounter::new();
        let peer_a = PeerId::random();
        let peer_b = PeerId::random();

        counter.record_inbound(&peer_a, &PROTO, 100);
        counter.record_outbound(&peer_a, &PROTO, 40);
        counter.record_inbound(&peer_b, &PROTO, 7);
        counter.record_outbound(&peer_b, &PROTO, 0); // no-op

        assert_eq!(
            counter.totals(),
            BandwidthStats {
                total_in: 107,
                total_out: 40
            }
        );
        assert_eq!(
            counter.for_peer(&peer_a),
            BandwidthStats {
                total_in: 100,
                total_out: 40
            }
        );
        assert_eq!(counter.for_peer(&peer_b).total_in, 7);
        assert_eq!(counter.for_peer(&PeerId::random()), BandwidthStats::default());

        let by_protocol = counter.by_protocol();
        assert_eq!(by_protocol["/overlan/test/bw"].total_in, 107);
        assert_eq!(counter.by_peer().len(), 2);
    }
}
