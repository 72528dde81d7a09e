//! Cached local reachability
//!
//! The host publishes reachability changes on its event bus; the observer
//! keeps the latest value in an atomic so readers never touch the bus.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use libp2p::autonat::NatStatus;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::host::HostEvent;

/// The host's belief about whether it is publicly dialable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Reachability {
    #[default]
    Unknown = 0,
    Public = 1,
    Private = 2,
}

impl From<&NatStatus> for Reachability {
    fn from(status: &NatStatus) -> Self {
        match status {
            NatStatus::Public(_) => Reachability::Public,
            NatStatus::Private => Reachability::Private,
            NatStatus::Unknown => Reachability::Unknown,
        }
    }
}

#[derive(Default)]
pub(crate) struct ReachabilityCache(AtomicU8);

impl ReachabilityCache {
    pub(crate) fn get(&self) -> Reachability {
        match self.0.load(Ordering::SeqCst) {
            1 => Reachability::Public,
            2 => Reachability::Private,
            _ => Reachability::Unknown,
        }
    }

    pub(crate) fn set(&self, reachability: Reachability) {
        self.0.store(reachability as u8, Ordering::SeqCst);
    }
}

/// Consumes reachability-change events and caches the latest value.
pub struct ReachabilityObserver {
    cache: Arc<ReachabilityCache>,
    task: JoinHandle<()>,
}

impl ReachabilityObserver {
    pub(crate) fn spawn(mut events: broadcast::Receiver<HostEvent>) -> Self {
        let cache = Arc::new(ReachabilityCache::default());
        let task_cache = Arc::clone(&cache);

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(HostEvent::LocalReachabilityChanged(reachability)) => {
                        task_cache.set(reachability);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("reachability observer lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self { cache, task }
    }

    /// The most recently observed reachability.
    pub fn current(&self) -> Reachability {
        self.cache.get()
    }
}

impl Drop for ReachabilityObserver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cache_round_trip() {
        let cache = ReachabilityCache::default();
        assert_eq!(cache.get(), Reachability::Unknown);
        cache.set(Reachability::Public);
        assert_eq!(cache.get(), Reachability::Public);
        cache.set(Reachability::Private);
        assert_eq!(cache.get(), Reachability::Private);
    }

    #[tokio::test]
    async fn observer_tracks_latest_event() {
        let (tx, rx) = broadcast::channel(crate::EVENT_BUS_CAPACITY);
        let observer = ReachabilityObserver::spawn(rx);
        assert_eq!(observer.current(), Reachability::Unknown);

        tx.send(HostEvent::LocalReachabilityChanged(Reachability::Public))
            .unwrap();
        // Let the observer task run.
        for _ in 0..50 {
            if observer.current() == Reachability::Public {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(observer.current(), Reachability::Public);
    }
}
