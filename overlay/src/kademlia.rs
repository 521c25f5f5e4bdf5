//! Kademlia-style routed overlay.
//!
//! Peer ids are opaque 16-byte [`PeerId`]s with no cryptographic meaning;
//! this module hashes each one with
//! `blake3` into a 256-bit node id purely to get a uniform XOR-distance
//! metric over fixed-size keys, not as an identity claim. Buckets are
//! indexed by XOR-distance prefix length (0 = identical high bit, 255 =
//! differ only in the lowest bit), giving the canonical 256 k-buckets.
//!
//! This crate has no network transport of its own; `broadcast`/`send`
//! compute which peers *this* node should forward to and hand bytes to the
//! caller-supplied [`Sender`]. A node on the other end that receives a
//! forwarded [`OverlayMessage`] with `ttl > 0` and hasn't seen its `id`
//! calls `broadcast` again locally to continue the flood — that call site
//! lives in whatever owns the socket (the relay or room server), not here.

use std::collections::VecDeque;

use fnv::FnvHashSet;

use chronicle::error::Result;
use chronicle::ids::PeerId;

use crate::{unreachable, Overlay, OverlayMessage, Sender};

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_ALPHA: usize = 3;
const BUCKET_COUNT: usize = 256;
/// Bound on the dedup set so a long-running node doesn't accumulate every
/// message id it has ever seen; the oldest ids are evicted first.
const SEEN_CAPACITY: usize = 4096;

fn node_id(peer: PeerId) -> [u8; 32] {
    *blake3::hash(peer.to_string().as_bytes()).as_bytes()
}

fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// Index of the highest set bit in `distance`, i.e. the k-bucket a contact
/// at that distance belongs in (0 = farthest, 255 = nearest).
fn bucket_index(distance: &[u8; 32]) -> usize {
    for (byte_index, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            let leading = byte.leading_zeros() as usize;
            return BUCKET_COUNT - 1 - (byte_index * 8 + leading);
        }
    }
    0
}

struct Bucket {
    contacts: VecDeque<PeerId>,
}

impl Bucket {
    fn new() -> Self {
        Self { contacts: VecDeque::new() }
    }
}

pub struct Kademlia {
    self_id: PeerId,
    self_node_id: [u8; 32],
    k: usize,
    alpha: usize,
    buckets: Vec<Bucket>,
    seen: FnvHashSet<u64>,
    seen_order: VecDeque<u64>,
}

impl Kademlia {
    pub fn new(self_id: PeerId, k: usize, alpha: usize) -> Self {
        Self {
            self_id,
            self_node_id: node_id(self_id),
            k,
            alpha,
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::new()).collect(),
            seen: FnvHashSet::default(),
            seen_order: VecDeque::new(),
        }
    }

    fn mark_seen(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_CAPACITY {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Iterative node lookup, simplified: since this crate holds the full
    /// local routing table rather than driving real network round-trips,
    /// the "closest k peers stabilise" terminal state of the classic
    /// iterative procedure is exactly the closest `limit` contacts already
    /// known locally. `alpha` bounds how many of them a caller should probe
    /// concurrently if it does perform real queries on top of this.
    pub fn find_node(&self, target: PeerId, limit: usize) -> Vec<PeerId> {
        let target_id = node_id(target);
        let mut all: Vec<(Vec<u8>, PeerId)> = self
            .buckets
            .iter()
            .flat_map(|b| b.contacts.iter().copied())
            .map(|peer| (xor_distance(&node_id(peer), &target_id).to_vec(), peer))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all.truncate(limit);
        all.into_iter().map(|(_, peer)| peer).collect()
    }

    pub fn alpha(&self) -> usize {
        self.alpha
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Picks one contact from each non-empty bucket (diverse-bucket
    /// selection), bounding total fanout at `k` — this is what gives
    /// Kademlia broadcast its expected O(k·log N) message count per
    /// originator: `log N` buckets populated in a network of `N` peers,
    /// each contributing one forward.
    fn diverse_targets(&self) -> Vec<PeerId> {
        let mut targets = Vec::new();
        for bucket in &self.buckets {
            if let Some(peer) = bucket.contacts.front() {
                targets.push(*peer);
                if targets.len() >= self.k {
                    break;
                }
            }
        }
        targets
    }
}

impl Overlay for Kademlia {
    fn register_peer(&mut self, peer: PeerId) {
        if peer == self.self_id {
            return;
        }
        let distance = xor_distance(&self.self_node_id, &node_id(peer));
        let bucket = &mut self.buckets[bucket_index(&distance)];
        if bucket.contacts.contains(&peer) {
            return;
        }
        if bucket.contacts.len() >= self.k {
            // Evict the least-recently-seen contact (front of the queue)
            // in favour of the fresher one, per Kademlia's standard
            // bucket-refresh policy.
            bucket.contacts.pop_front();
        }
        bucket.contacts.push_back(peer);
    }

    fn unregister_peer(&mut self, peer: PeerId) {
        for bucket in &mut self.buckets {
            bucket.contacts.retain(|&p| p != peer);
        }
    }

    fn broadcast(&mut self, sender: &mut dyn Sender, mut message: OverlayMessage) -> Result<()> {
        if message.ttl == 0 || !self.mark_seen(message.id) {
            return Ok(());
        }
        message.ttl -= 1;
        for target in self.diverse_targets() {
            sender.send_to(target, message.payload.clone())?;
        }
        Ok(())
    }

    fn send(&mut self, sender: &mut dyn Sender, target: PeerId, message: OverlayMessage) -> Result<()> {
        if self.find_node(target, self.k).contains(&target) {
            return sender.send_to(target, message.payload);
        }
        let closest = self.find_node(target, self.alpha);
        if closest.is_empty() {
            return Err(unreachable(target));
        }
        for next_hop in closest {
            sender.send_to(next_hop, message.payload.clone())?;
        }
        Ok(())
    }

    fn peer_count(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::RecordingSender;

    #[test]
    fn registering_a_peer_places_it_in_exactly_one_bucket() {
        let mut kad = Kademlia::new(PeerId::generate(), DEFAULT_K, DEFAULT_ALPHA);
        let peer = PeerId::generate();
        kad.register_peer(peer);
        assert_eq!(kad.peer_count(), 1);
        let occupied = kad.buckets.iter().filter(|b| b.contacts.contains(&peer)).count();
        assert_eq!(occupied, 1);
    }

    #[test]
    fn find_node_returns_closest_known_contacts() {
        let mut kad = Kademlia::new(PeerId::generate(), DEFAULT_K, DEFAULT_ALPHA);
        let peers: Vec<PeerId> = (0..10).map(|_| PeerId::generate()).collect();
        for peer in &peers {
            kad.register_peer(*peer);
        }
        let target = PeerId::generate();
        let closest = kad.find_node(target, 3);
        assert_eq!(closest.len(), 3);
        for peer in &closest {
            assert!(peers.contains(peer));
        }
    }

    #[test]
    fn broadcast_does_not_redeliver_a_seen_message() {
        let mut kad = Kademlia::new(PeerId::generate(), DEFAULT_K, DEFAULT_ALPHA);
        for _ in 0..5 {
            kad.register_peer(PeerId::generate());
        }
        let mut sender = RecordingSender::default();
        let message = OverlayMessage { id: 42, ttl: 5, payload: vec![9] };
        kad.broadcast(&mut sender, message.clone()).unwrap();
        let first_count = sender.0.lock().unwrap().len();
        assert!(first_count > 0);
        kad.broadcast(&mut sender, message).unwrap();
        assert_eq!(sender.0.lock().unwrap().len(), first_count);
    }

    #[test]
    fn broadcast_stops_at_zero_ttl() {
        let mut kad = Kademlia::new(PeerId::generate(), DEFAULT_K, DEFAULT_ALPHA);
        kad.register_peer(PeerId::generate());
        let mut sender = RecordingSender::default();
        kad.broadcast(&mut sender, OverlayMessage { id: 1, ttl: 0, payload: vec![] }).unwrap();
        assert_eq!(sender.0.lock().unwrap().len(), 0);
    }

    #[test]
    fn unregister_removes_the_peer_from_its_bucket() {
        let mut kad = Kademlia::new(PeerId::generate(), DEFAULT_K, DEFAULT_ALPHA);
        let peer = PeerId::generate();
        kad.register_peer(peer);
        kad.unregister_peer(peer);
        assert_eq!(kad.peer_count(), 0);
    }
}
