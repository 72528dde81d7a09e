//! Connection manager
//!
//! Watermark-based trimming with a grace period for young connections,
//! protected-peer tags, and a dial backoff registry. The manager only
//! decides; the swarm loop executes the closures it selects.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use libp2p::swarm::ConnectionId;
use libp2p::PeerId;

use crate::host::ConnInfo;

const BACKOFF_BASE: Duration = Duration::from_secs(10);
const BACKOFF_MAX: Duration = Duration::from_secs(600);

/// Watermarks and grace period for connection trimming.
#[derive(Debug, Clone)]
pub struct ConnManagerConfig {
    /// Trimming stops once the connection count is back at this level.
    pub low_watermark: usize,
    /// Trimming starts when the connection count exceeds this level.
    pub high_watermark: usize,
    /// Connections younger than this are never trimmed.
    pub grace_period: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_watermark: 50,
            high_watermark: 100,
            grace_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BackoffEntry {
    attempts: u32,
    until: Instant,
}

/// Shared connection-management state.
pub struct ConnManager {
    config: ConnManagerConfig,
    protected: Mutex<HashMap<PeerId, HashSet<String>>>,
    backoff: Mutex<HashMap<PeerId, BackoffEntry>>,
    last_trim: Mutex<Option<SystemTime>>,
}

impl ConnManager {
    pub fn new(config: ConnManagerConfig) -> Self {
        Self {
            config,
            protected: Mutex::new(HashMap::new()),
            backoff: Mutex::new(HashMap::new()),
            last_trim: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnManagerConfig {
        &self.config
    }

    /// Tag or untag a peer as protected. A peer stays protected while any
    /// tag remains.
    pub fn change_protected_status(&self, peer: PeerId, tag: &str, protected: bool) {
        let mut map = self.protected.lock().unwrap_or_else(PoisonError::into_inner);
        if protected {
            map.entry(peer).or_default().insert(tag.to_string());
        } else if let Some(tags) = map.get_mut(&peer) {
            tags.remove(tag);
            if tags.is_empty() {
                map.remove(&peer);
            }
        }
    }

    pub fn is_protected(&self, peer: &PeerId) -> bool {
        self.protected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(peer)
    }

    /// Pick the connections to close.
    ///
    /// Nothing is selected while the count sits at or below the high
    /// watermark, unless `forced`. Selection closes the oldest unprotected
    /// connections past the grace period until the count reaches the low
    /// watermark.
    pub fn select_victims(
        &self,
        connections: &[(PeerId, ConnInfo)],
        forced: bool,
    ) -> Vec<(PeerId, ConnectionId)> {
        let total = connections.len();
        if total <= self.config.low_watermark {
            return Vec::new();
        }
        if !forced && total <= self.config.high_watermark {
            return Vec::new();
        }

        let excess = total - self.config.low_watermark;
        let mut candidates: Vec<&(PeerId, ConnInfo)> = connections
            .iter()
            .filter(|(peer, conn)| {
                !self.is_protected(peer) && conn.opened_at.elapsed() >= self.config.grace_period
            })
            .collect();
        candidates.sort_by_key(|(_, conn)| conn.opened_at);
        candidates
            .into_iter()
            .take(excess)
            .map(|(peer, conn)| (*peer, conn.connection_id))
            .collect()
    }

    pub fn mark_trimmed(&self) {
        let mut last = self.last_trim.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(SystemTime::now());
    }

    /// When the last trim ran, if ever.
    pub fn last_trim(&self) -> Option<SystemTime> {
        *self.last_trim.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm (or escalate) dial backoff for a peer after a failed dial.
    pub fn record_dial_failure(&self, peer: &PeerId) {
        let mut map = self.backoff.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = map.entry(*peer).or_insert(BackoffEntry {
            attempts: 0,
            until: Instant::now(),
        });
        entry.attempts = entry.attempts.saturating_add(1);
        let delay = BACKOFF_BASE
            .saturating_mul(1u32 << (entry.attempts - 1).min(16))
            .min(BACKOFF_MAX);
        entry.until = Instant::now() + delay;
    }

    /// Whether dials to the peer are currently suppressed.
    pub fn backoff_active(&self, peer: &PeerId) -> bool {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(peer)
            .map(|entry| entry.until > Instant::now())
            .unwrap_or(false)
    }

    /// Forget any backoff state for a peer.
    pub fn clear_backoff(&self, peer: &PeerId) {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::Direction;

    fn conn(age: Duration) -> ConnInfo {
        ConnInfo {
            connection_id: ConnectionId::new_unchecked(rand_id()),
            direction: Direction::Outbound,
            remote_addr: "/ip4/127.0.0.1/tcp/4001".parse().unwrap(),
            opened_at: Instant::now() - age,
        }
    }

    fn rand_id() -> usize {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static NEXT: AtomicUsize = AtomicUsize::new(1);
        NEXT.fetch_add(1, Ordering::Relaxed)
    }

    fn manager(low: usize, high: usize, grace: Duration) -> ConnManager {
        ConnManager::new(ConnManagerConfig {
            low_watermark: low,
            high_watermark: high,
            grace_period: grace,
        })
    }

    #[test]
    fn no_trim_below_high_watermark() {
        let manager = manager(2, 4, Duration::ZERO);
        let conns: Vec<_> = (0..4)
            .map(|_| (PeerId::random(), conn(Duration::from_secs(120))))
            .collect();
        assert!(manager.select_victims(&conns, false).is_empty());
    }

    #[test]
    fn trims_oldest_down_to_low_watermark() {
        let manager = manager(2, 4, Duration::ZERO);
        let mut conns: Vec<_> = (0u64..5)
            .map(|i| (PeerId::random(), conn(Duration::from_secs(60 + i))))
            .collect();
        let oldest = conns
            .iter()
            .max_by_key(|(_, c)| Instant::now() - c.opened_at)
            .map(|(p, _)| *p)
            .unwrap();

        let victims = manager.select_victims(&conns, false);
        assert_eq!(victims.len(), 3);
        assert_eq!(victims[0].0, oldest);

        // Forced trim works below the high watermark too.
        conns.truncate(3);
        assert_eq!(manager.select_victims(&conns, true).len(), 1);
    }

    #[test]
    fn protected_and_young_connections_survive() {
        let manager = manager(0, 2, Duration::from_secs(30));
        let protected_peer = PeerId::random();
        manager.change_protected_status(protected_peer, "tunnel", true);

        let conns = vec![
            (protected_peer, conn(Duration::from_secs(120))),
            (PeerId::random(), conn(Duration::from_secs(1))), // inside grace
            (PeerId::random(), conn(Duration::from_secs(120))),
        ];
        let victims = manager.select_victims(&conns, false);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].0, conns[2].0);

        // Removing the tag unprotects the peer.
        manager.change_protected_status(protected_peer, "tunnel", false);
        assert!(!manager.is_protected(&protected_peer));
        assert_eq!(manager.select_victims(&conns, false).len(), 2);
    }

    #[test]
    fn backoff_arms_and_clears() {
        let manager = manager(50, 100, Duration::from_secs(60));
        let peer = PeerId::random();
        assert!(!manager.backoff_active(&peer));

        manager.record_dial_failure(&peer);
        assert!(manager.backoff_active(&peer));

        manager.clear_backoff(&peer);
        assert!(!manager.backoff_active(&peer));
    }

    #[test]
    fn last_trim_is_recorded() {
        let manager = manager(50, 100, Duration::from_secs(60));
        assert!(manager.last_trim().is_none());
        manager.mark_trimmed();
        assert!(manager.last_trim().is_some());
    }
}
