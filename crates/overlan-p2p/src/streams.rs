//! Stream accounting
//!
//! Every stream the host opens or accepts is wrapped in a [`CountedStream`]
//! guard. The guard bumps the open count and the directional total when the
//! stream comes into existence and decrements the open count on drop, so
//! the counters cannot leak even when a handler panics.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncWrite};
use libp2p::{PeerId, Stream, StreamProtocol};

use crate::bandwidth::BandwidthCounter;

/// Direction of a stream or connection relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Atomic counters of currently open and historical streams.
#[derive(Default)]
pub struct StreamAccountant {
    open: AtomicI64,
    total_in: AtomicU64,
    total_out: AtomicU64,
    live: Mutex<HashMap<(String, Direction), usize>>,
}

impl StreamAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn on_opened(&self, protocol: &StreamProtocol, direction: Direction) {
        self.open.fetch_add(1, Ordering::SeqCst);
        match direction {
            Direction::Inbound => self.total_in.fetch_add(1, Ordering::SeqCst),
            Direction::Outbound => self.total_out.fetch_add(1, Ordering::SeqCst),
        };
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        *live
            .entry((protocol.as_ref().to_string(), direction))
            .or_insert(0) += 1;
    }

    pub(crate) fn on_closed(&self, protocol: &StreamProtocol, direction: Direction) {
        self.open.fetch_sub(1, Ordering::SeqCst);
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (protocol.as_ref().to_string(), direction);
        if let Some(count) = live.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                live.remove(&key);
            }
        }
    }

    /// Streams open right now.
    pub fn open_count(&self) -> i64 {
        self.open.load(Ordering::SeqCst)
    }

    /// Streams ever accepted from peers.
    pub fn total_inbound(&self) -> u64 {
        self.total_in.load(Ordering::SeqCst)
    }

    /// Streams ever opened towards peers.
    pub fn total_outbound(&self) -> u64 {
        self.total_out.load(Ordering::SeqCst)
    }

    /// Live streams grouped by protocol and direction.
    pub fn open_stats(&self) -> HashMap<String, HashMap<&'static str, usize>> {
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats: HashMap<String, HashMap<&'static str, usize>> = HashMap::new();
        for ((protocol, direction), count) in live.iter() {
            *stats
                .entry(protocol.clone())
                .or_default()
                .entry(direction.as_str())
                .or_insert(0) += count;
        }
        stats
    }
}

/// A libp2p stream wrapped with stream and bandwidth accounting.
///
/// Reads and writes flow into the host's [`BandwidthCounter`]; dropping the
/// stream settles the open-stream counter.
pub struct CountedStream {
    inner: Stream,
    peer: PeerId,
    protocol: StreamProtocol,
    direction: Direction,
    accountant: Arc<StreamAccountant>,
    bandwidth: Arc<BandwidthCounter>,
}

impl CountedStream {
    pub(crate) fn new(
        inner: Stream,
        peer: PeerId,
        protocol: StreamProtocol,
        direction: Direction,
        accountant: Arc<StreamAccountant>,
        bandwidth: Arc<BandwidthCounter>,
    ) -> Self {
        accountant.on_opened(&protocol, direction);
        Self {
            inner,
            peer,
            protocol,
            direction,
            accountant,
            bandwidth,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

impl AsyncRead for CountedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.bandwidth
                    .record_inbound(&this.peer, &this.protocol, n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.bandwidth
                    .record_outbound(&this.peer, &this.protocol, n as u64);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.accountant.on_closed(&self.protocol, self.direction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTO_A: StreamProtocol = StreamProtocol::new("/overlan/test/a");
    const PROTO_B: StreamProtocol = StreamProtocol::new("/overlan/test/b");

    #[test]
    fn counters_follow_open_close() {
        let accountant = StreamAccountant::new();

        accountant.on_opened(&PROTO_A, Direction::Inbound);
        accountant.on_opened(&PROTO_A, Direction::Outbound);
        accountant.on_opened(&PROTO_B, Direction::Outbound);

        assert_eq!(accountant.open_count(), 3);
        assert_eq!(accountant.total_inbound(), 1);
        assert_eq!(accountant.total_outbound(), 2);

        accountant.on_closed(&PROTO_A, Direction::Inbound);
        assert_eq!(accountant.open_count(), 2);
        // Totals are monotonic.
        assert_eq!(accountant.total_inbound(), 1);
        assert_eq!(accountant.total_outbound(), 2);

        accountant.on_closed(&PROTO_A, Direction::Outbound);
        accountant.on_closed(&PROTO_B, Direction::Outbound);
        assert_eq!(accountant.open_count(), 0);

        let open = accountant.open_count();
        assert!(open >= 0);
        assert!(accountant.total_inbound() + accountant.total_outbound() >= open as u64);
    }

    #[test]
    fn open_stats_group_by_protocol_and_direction() {
        let accountant = StreamAccountant::new();
        accountant.on_opened(&PROTO_A, Direction::Inbound);
        accountant.on_opened(&PROTO_A, Direction::Inbound);
        accountant.on_opened(&PROTO_A, Direction::Outbound);

        let stats = accountant.open_stats();
        let by_direction = &stats["/overlan/test/a"];
        assert_eq!(by_direction["inbound"], 2);
        assert_eq!(by_direction["outbound"], 1);

        accountant.on_closed(&PROTO_A, Direction::Inbound);
        accountant.on_closed(&PROTO_A, Direction::Inbound);
        accountant.on_closed(&PROTO_A, Direction::Outbound);
        assert!(accountant.open_stats().is_empty());
    }
}
