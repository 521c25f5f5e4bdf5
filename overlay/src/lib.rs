//! Routed overlay topologies replacing naive O(N) broadcast.
//!
//! Two strategies ([`kademlia::Kademlia`], [`supernode::Supernode`]) and a
//! [`naive::NaiveBroadcast`] fallback all implement the same [`Overlay`]
//! seam; [`AutoOverlay`] switches automatically between a configured
//! strategy and the naive fallback by peer-count threshold.

pub mod kademlia;
pub mod naive;
pub mod supernode;

use chronicle::ids::PeerId;
use chronicle::error::{ChronicleError, Result};

pub use kademlia::Kademlia;
pub use naive::NaiveBroadcast;
pub use supernode::Supernode;

/// A single message moving through the overlay. `id` is assigned by the
/// originator and used for dedup by every relaying strategy; `ttl` is
/// decremented on each forward and a message is dropped once it reaches
/// zero.
#[derive(Clone, Debug)]
pub struct OverlayMessage {
    pub id: u64,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

/// Something able to move bytes to one peer, shared by every overlay
/// strategy below (the same seam [`chronicle::transport::PeerChannel`]
/// exposes at the hybrid-transport layer, reused here so a strategy never
/// needs to know whether it's relayed or direct).
pub trait Sender: Send {
    fn send_to(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<()>;
}

/// The common interface every overlay strategy implements: register/
/// unregister a peer, broadcast to the whole network, or unicast to one
/// target, all independent of how sends are physically carried out.
pub trait Overlay {
    fn register_peer(&mut self, peer: PeerId);
    fn unregister_peer(&mut self, peer: PeerId);
    fn broadcast(&mut self, sender: &mut dyn Sender, message: OverlayMessage) -> Result<()>;
    fn send(&mut self, sender: &mut dyn Sender, target: PeerId, message: OverlayMessage) -> Result<()>;
    fn peer_count(&self) -> usize;
}

/// Which structured strategy a network above the naive-broadcast threshold
/// should use. Selection between these (and the naive fallback) is
/// automatic in [`AutoOverlay`]; this type only distinguishes the two
/// structured options from one another.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    Kademlia,
    Supernode,
}

/// Wraps a naive broadcaster and one structured strategy, switching
/// between them by peer count: below `threshold`, every broadcast and
/// unicast goes through the naive O(N) path (cheap and simple for small
/// networks); at or above it, the structured strategy takes over.
pub struct AutoOverlay {
    threshold: usize,
    naive: NaiveBroadcast,
    structured: StructuredOverlay,
}

enum StructuredOverlay {
    Kademlia(Kademlia),
    Supernode(Supernode),
}

impl AutoOverlay {
    pub const DEFAULT_THRESHOLD: usize = 64;

    pub fn kademlia(threshold: usize, kademlia: Kademlia) -> Self {
        Self {
            threshold,
            naive: NaiveBroadcast::new(),
            structured: StructuredOverlay::Kademlia(kademlia),
        }
    }

    pub fn supernode(threshold: usize, supernode: Supernode) -> Self {
        Self {
            threshold,
            naive: NaiveBroadcast::new(),
            structured: StructuredOverlay::Supernode(supernode),
        }
    }

    fn active(&mut self) -> &mut dyn Overlay {
        let use_structured = self.naive.peer_count() >= self.threshold;
        if use_structured {
            match &mut self.structured {
                StructuredOverlay::Kademlia(k) => k as &mut dyn Overlay,
                StructuredOverlay::Supernode(s) => s as &mut dyn Overlay,
            }
        } else {
            &mut self.naive as &mut dyn Overlay
        }
    }
}

impl Overlay for AutoOverlay {
    fn register_peer(&mut self, peer: PeerId) {
        self.naive.register_peer(peer);
        match &mut self.structured {
            StructuredOverlay::Kademlia(k) => k.register_peer(peer),
            StructuredOverlay::Supernode(s) => s.register_peer(peer),
        }
    }

    fn unregister_peer(&mut self, peer: PeerId) {
        self.naive.unregister_peer(peer);
        match &mut self.structured {
            StructuredOverlay::Kademlia(k) => k.unregister_peer(peer),
            StructuredOverlay::Supernode(s) => s.unregister_peer(peer),
        }
    }

    fn broadcast(&mut self, sender: &mut dyn Sender, message: OverlayMessage) -> Result<()> {
        self.active().broadcast(sender, message)
    }

    fn send(&mut self, sender: &mut dyn Sender, target: PeerId, message: OverlayMessage) -> Result<()> {
        self.active().send(sender, target, message)
    }

    fn peer_count(&self) -> usize {
        self.naive.peer_count()
    }
}

fn unreachable(peer: PeerId) -> ChronicleError {
    ChronicleError::PeerUnreachable(peer.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub(crate) struct RecordingSender(pub Arc<Mutex<Vec<(PeerId, Vec<u8>)>>>);

    impl Sender for RecordingSender {
        fn send_to(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<()> {
            self.0.lock().unwrap().push((peer, bytes));
            Ok(())
        }
    }

    #[test]
    fn auto_overlay_uses_naive_below_threshold() {
        let mut overlay = AutoOverlay::kademlia(4, Kademlia::new(PeerId::generate(), 20, 3));
        let mut sender = RecordingSender::default();
        for _ in 0..3 {
            overlay.register_peer(PeerId::generate());
        }
        overlay
            .broadcast(&mut sender, OverlayMessage { id: 1, ttl: 10, payload: vec![1] })
            .unwrap();
        // Below threshold: every registered peer gets exactly one send.
        assert_eq!(sender.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn auto_overlay_switches_to_structured_at_threshold() {
        let mut overlay = AutoOverlay::kademlia(2, Kademlia::new(PeerId::generate(), 20, 3));
        for _ in 0..2 {
            overlay.register_peer(PeerId::generate());
        }
        assert_eq!(overlay.peer_count(), 2);
        // With peer_count >= threshold the active() picks the structured
        // strategy; we only assert it doesn't panic and routes through it.
        let mut sender = RecordingSender::default();
        overlay
            .broadcast(&mut sender, OverlayMessage { id: 2, ttl: 10, payload: vec![2] })
            .unwrap();
    }
}
