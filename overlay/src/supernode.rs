//! Supernode overlay: a second routed-broadcast strategy alongside Kademlia.
//!
//! Ordinary nodes start as leaves; a scoring function over uptime,
//! bandwidth, reliability, and current connection count promotes a node to
//! `Candidate` once it crosses a threshold, and on to `Supernode` once a
//! caller confirms mesh capacity (`try_promote`) — e.g. the room/relay
//! layer decides whether the mesh still has room before finalizing a
//! promotion, which is why scoring and promotion are two separate calls
//! here rather than one.
//!
//! Broadcast fans out leaf → its supernodes → mesh of supernodes, each of
//! which also forwards to its own leaves, giving the expected O(√N)
//! messages per originator, at the cost (documented here, not hidden) that
//! unicast `send` to a peer this node has no direct knowledge of degrades
//! to a bounded flood rather than true routing, since this strategy —
//! unlike Kademlia — never publishes a global leaf-to-supernode directory.

use std::collections::{HashMap, HashSet, VecDeque};

use fnv::FnvHashSet;

use chronicle::error::Result;
use chronicle::ids::PeerId;

use crate::{unreachable, Overlay, OverlayMessage, Sender};

pub const DEFAULT_MESH_FANOUT: usize = 5;
pub const DEFAULT_LEAF_FANOUT: usize = 3;
pub const DEFAULT_MAX_LEAVES_PER_SUPERNODE: usize = 100;
pub const DEFAULT_PROMOTION_THRESHOLD: f64 = 0.7;
const SEEN_CAPACITY: usize = 4096;

#[derive(Clone, Copy, Debug, Default)]
pub struct NodeMetrics {
    pub uptime_secs: u64,
    pub bandwidth_kbps: u64,
    pub reliability: f64,
    pub connection_count: usize,
}

impl NodeMetrics {
    /// A weighted score in `[0, 1]`; the weights favor reliability and
    /// uptime since a high-bandwidth node that drops frequently makes a
    /// poor mesh relay.
    pub fn score(&self) -> f64 {
        let uptime_score = (self.uptime_secs as f64 / 3600.0).min(1.0);
        let bandwidth_score = (self.bandwidth_kbps as f64 / 10_000.0).min(1.0);
        let reliability_score = self.reliability.clamp(0.0, 1.0);
        let connections_score = (self.connection_count as f64 / 50.0).min(1.0);
        0.35 * reliability_score + 0.3 * uptime_score + 0.2 * bandwidth_score + 0.15 * connections_score
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeRole {
    Leaf,
    Candidate,
    Supernode,
}

struct NodeEntry {
    role: NodeRole,
    metrics: NodeMetrics,
}

pub struct Supernode {
    self_id: PeerId,
    self_role: NodeRole,
    promotion_threshold: f64,
    mesh_fanout: usize,
    leaf_fanout: usize,
    max_leaves_per_supernode: usize,
    nodes: HashMap<PeerId, NodeEntry>,
    /// Supernodes this node (as a leaf) is connected to, or — if this node
    /// is itself a supernode — the peer mesh it gossips with.
    uplinks: Vec<PeerId>,
    /// This node's own leaves, populated only while `self_role` is
    /// `Supernode`.
    leaves: HashSet<PeerId>,
    seen: FnvHashSet<u64>,
    seen_order: VecDeque<u64>,
}

impl Supernode {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            self_role: NodeRole::Leaf,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            mesh_fanout: DEFAULT_MESH_FANOUT,
            leaf_fanout: DEFAULT_LEAF_FANOUT,
            max_leaves_per_supernode: DEFAULT_MAX_LEAVES_PER_SUPERNODE,
            nodes: HashMap::new(),
            uplinks: Vec::new(),
            leaves: HashSet::new(),
            seen: FnvHashSet::default(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn with_promotion_threshold(mut self, threshold: f64) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    pub fn self_role(&self) -> NodeRole {
        self.self_role
    }

    pub fn role_of(&self, peer: PeerId) -> NodeRole {
        self.nodes.get(&peer).map(|e| e.role).unwrap_or(NodeRole::Leaf)
    }

    /// Records fresh metrics for `peer` and promotes it to `Candidate` if
    /// its score now crosses the threshold. Never demotes automatically —
    /// demotion is a policy decision left to the caller.
    pub fn update_metrics(&mut self, peer: PeerId, metrics: NodeMetrics) {
        let entry = self.nodes.entry(peer).or_insert(NodeEntry { role: NodeRole::Leaf, metrics });
        entry.metrics = metrics;
        if entry.role == NodeRole::Leaf && metrics.score() >= self.promotion_threshold {
            entry.role = NodeRole::Candidate;
        }
    }

    /// Finalizes a `Candidate` peer's promotion to `Supernode`, e.g. once
    /// the caller has confirmed the mesh still has fanout capacity. A
    /// no-op (returns `false`) for a peer not currently `Candidate`.
    pub fn try_promote(&mut self, peer: PeerId) -> bool {
        match self.nodes.get_mut(&peer) {
            Some(entry) if entry.role == NodeRole::Candidate => {
                entry.role = NodeRole::Supernode;
                true
            }
            _ => false,
        }
    }

    /// Connects this node to up to `leaf_fanout` known supernodes, as a
    /// leaf would on joining the network.
    pub fn connect_as_leaf(&mut self) {
        self.self_role = NodeRole::Leaf;
        let supernodes: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.role == NodeRole::Supernode)
            .map(|(peer, _)| *peer)
            .take(self.leaf_fanout)
            .collect();
        self.uplinks = supernodes;
    }

    /// Marks this node itself as a supernode (e.g. after being promoted
    /// elsewhere and confirmed locally), forming mesh links to up to
    /// `mesh_fanout` peer supernodes.
    pub fn become_supernode(&mut self) {
        self.self_role = NodeRole::Supernode;
        let mesh: Vec<PeerId> = self
            .nodes
            .iter()
            .filter(|(_, e)| e.role == NodeRole::Supernode)
            .map(|(peer, _)| *peer)
            .take(self.mesh_fanout)
            .collect();
        self.uplinks = mesh;
    }

    /// Accepts `leaf` onto this supernode, bounded by
    /// `max_leaves_per_supernode`. Returns `false` if full or if this node
    /// isn't currently a supernode.
    pub fn accept_leaf(&mut self, leaf: PeerId) -> bool {
        if self.self_role != NodeRole::Supernode || self.leaves.len() >= self.max_leaves_per_supernode {
            return false;
        }
        self.leaves.insert(leaf)
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
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
}

impl Overlay for Supernode {
    fn register_peer(&mut self, peer: PeerId) {
        self.nodes.entry(peer).or_insert(NodeEntry {
            role: NodeRole::Leaf,
            metrics: NodeMetrics::default(),
        });
    }

    fn unregister_peer(&mut self, peer: PeerId) {
        self.nodes.remove(&peer);
        self.uplinks.retain(|&p| p != peer);
        self.leaves.remove(&peer);
    }

    fn broadcast(&mut self, sender: &mut dyn Sender, mut message: OverlayMessage) -> Result<()> {
        if message.ttl == 0 || !self.mark_seen(message.id) {
            return Ok(());
        }
        message.ttl -= 1;
        match self.self_role {
            NodeRole::Leaf | NodeRole::Candidate => {
                for uplink in self.uplinks.clone() {
                    sender.send_to(uplink, message.payload.clone())?;
                }
            }
            NodeRole::Supernode => {
                for uplink in self.uplinks.clone() {
                    sender.send_to(uplink, message.payload.clone())?;
                }
                for leaf in self.leaves.clone() {
                    sender.send_to(leaf, message.payload.clone())?;
                }
            }
        }
        Ok(())
    }

    fn send(&mut self, sender: &mut dyn Sender, target: PeerId, message: OverlayMessage) -> Result<()> {
        if self.leaves.contains(&target) || self.uplinks.contains(&target) {
            return sender.send_to(target, message.payload);
        }
        if self.uplinks.is_empty() {
            return Err(unreachable(target));
        }
        // No directory of which supernode a remote leaf is homed to exists
        // in this strategy; relay through the mesh and let the flood's
        // per-hop dedup bound the cost instead.
        self.broadcast(sender, message)
    }

    fn peer_count(&self) -> usize {
        self.nodes.len()
    }
}
