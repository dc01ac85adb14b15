//! The peer registry: every peer the trackers have ever reported, plus the
//! pools the scheduler and the connection watcher draw from.
//!
//! The registry map grows monotonically; peers are never removed, they just
//! stop being offered once their retry budget is spent. Each peer record is
//! guarded by its own async mutex and is only ever locked by the single task
//! that currently owns the peer (a session establishment task, a download
//! task, or the watcher).

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use crate::peer::Peer;

/// A shared handle to a peer record.
pub(crate) type PeerHandle = Arc<tokio::sync::Mutex<Peer>>;

/// An entry of the available pool. The downloaded count is snapshotted when
/// the peer is handed back so the pool can be ordered without locking every
/// peer.
struct AvailablePeer {
    peer: PeerHandle,
    pieces_downloaded: u32,
}

#[derive(Default)]
pub(crate) struct PeerRegistry {
    /// All peers ever observed, keyed by their `host:port` identity.
    peers: Mutex<HashMap<String, PeerHandle>>,
    /// Peers with a live session and nothing in flight, in the order they
    /// became available.
    available: Mutex<Vec<AvailablePeer>>,
    /// Peers whose connection attempts failed, awaiting a retry by the
    /// watcher.
    unreachable: Mutex<Vec<PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly reported peer address.
    ///
    /// Returns the new handle, or `None` if the address is already known; an
    /// address is only ever registered once.
    pub fn register(&self, addr: SocketAddr) -> Option<PeerHandle> {
        let mut peers = self.peers.lock().unwrap();
        let id = addr.to_string();
        if peers.contains_key(&id) {
            return None;
        }
        let peer = Arc::new(tokio::sync::Mutex::new(Peer::new(addr)));
        peers.insert(id, Arc::clone(&peer));
        Some(peer)
    }

    /// The number of peers ever registered.
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Puts a connected, idle peer (back) into the available pool.
    pub fn make_available(&self, peer: PeerHandle, pieces_downloaded: u32) {
        self.available.lock().unwrap().push(AvailablePeer {
            peer,
            pieces_downloaded,
        });
    }

    /// Takes the most promising available peer, if any.
    ///
    /// Peers are attempted in the order they became available, except that
    /// a peer with a higher downloaded-pieces count is preferred over
    /// slower ones; the sort is stable so equally proven peers keep their
    /// arrival order.
    pub fn take_available(&self) -> Option<PeerHandle> {
        let mut available = self.available.lock().unwrap();
        if available.is_empty() {
            return None;
        }
        available.sort_by_key(|entry| {
            std::cmp::Reverse(entry.pieces_downloaded)
        });
        Some(available.remove(0).peer)
    }

    /// The number of peers currently sitting in the available pool.
    pub fn available_count(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    /// Parks a peer whose connection failed until the watcher retries it.
    pub fn mark_unreachable(&self, peer: PeerHandle) {
        self.unreachable.lock().unwrap().push(peer);
    }

    /// Empties the unreachable list for a retry round.
    pub fn drain_unreachable(&self) -> Vec<PeerHandle> {
        self.unreachable.lock().unwrap().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = PeerRegistry::new();
        assert!(registry.register(addr(6881)).is_some());
        assert!(registry.register(addr(6881)).is_none());
        assert!(registry.register(addr(6882)).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_take_available_prefers_proven_peers() {
        let registry = PeerRegistry::new();
        let slow = registry.register(addr(1)).unwrap();
        let fast = registry.register(addr(2)).unwrap();
        registry.make_available(Arc::clone(&slow), 0);
        registry.make_available(Arc::clone(&fast), 3);

        let taken = registry.take_available().unwrap();
        assert!(Arc::ptr_eq(&taken, &fast));
        let taken = registry.take_available().unwrap();
        assert!(Arc::ptr_eq(&taken, &slow));
        assert!(registry.take_available().is_none());
    }

    #[test]
    fn test_take_available_keeps_arrival_order_among_equals() {
        let registry = PeerRegistry::new();
        let first = registry.register(addr(1)).unwrap();
        let second = registry.register(addr(2)).unwrap();
        registry.make_available(Arc::clone(&first), 1);
        registry.make_available(Arc::clone(&second), 1);

        let taken = registry.take_available().unwrap();
        assert!(Arc::ptr_eq(&taken, &first));
    }

    #[test]
    fn test_unreachable_round_trip() {
        let registry = PeerRegistry::new();
        let peer = registry.register(addr(1)).unwrap();
        registry.mark_unreachable(Arc::clone(&peer));
        let drained = registry.drain_unreachable();
        assert_eq!(drained.len(), 1);
        assert!(registry.drain_unreachable().is_empty());
    }
}
