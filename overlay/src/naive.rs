//! The O(N) broadcast fallback every [`crate::AutoOverlay`] uses below its
//! peer-count threshold: every registered peer gets every message
//! directly, no routing structure at all.

use std::collections::HashSet;

use chronicle::error::Result;
use chronicle::ids::PeerId;

use crate::{Overlay, OverlayMessage, Sender};

#[derive(Default)]
pub struct NaiveBroadcast {
    peers: HashSet<PeerId>,
}

impl NaiveBroadcast {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Overlay for NaiveBroadcast {
    fn register_peer(&mut self, peer: PeerId) {
        self.peers.insert(peer);
    }

    fn unregister_peer(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    fn broadcast(&mut self, sender: &mut dyn Sender, message: OverlayMessage) -> Result<()> {
        for peer in self.peers.iter().copied() {
            sender.send_to(peer, message.payload.clone())?;
        }
        Ok(())
    }

    fn send(&mut self, sender: &mut dyn Sender, target: PeerId, message: OverlayMessage) -> Result<()> {
        sender.send_to(target, message.payload)
    }

    fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::RecordingSender;

    #[test]
    fn broadcast_reaches_every_registered_peer() {
        let mut naive = NaiveBroadcast::new();
        let peers: Vec<PeerId> = (0..5).map(|_| PeerId::generate()).collect();
        for peer in &peers {
            naive.register_peer(*peer);
        }
        let mut sender = RecordingSender::default();
        naive
            .broadcast(&mut sender, OverlayMessage { id: 1, ttl: 1, payload: vec![7] })
            .unwrap();
        assert_eq!(sender.0.lock().unwrap().len(), 5);
    }

    #[test]
    fn unregistered_peer_no_longer_receives_broadcasts() {
        let mut naive = NaiveBroadcast::new();
        let peer = PeerId::generate();
        naive.register_peer(peer);
        naive.unregister_peer(peer);
        let mut sender = RecordingSender::default();
        naive
            .broadcast(&mut sender, OverlayMessage { id: 1, ttl: 1, payload: vec![] })
            .unwrap();
        assert_eq!(sender.0.lock().unwrap().len(), 0);
    }
}
