//! The four primitive CRDTs a chronicle field can be backed by: a
//! last-writer-wins register, an observed-remove set, a PN-counter, and an
//! ordered list keyed by dense fractional positions.
//!
//! Every type here exposes `merge`, which must be associative, commutative
//! and idempotent — the properties that give replicas convergence.

use crate::dot::{lamport_wins, Dot, ReplicaId};
use crate::position::PositionId;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

/// A field whose concurrent writes resolve by `(timestamp, origin)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub struct LwwRegister<I: ReplicaId> {
    value: Json,
    timestamp: u64,
    origin: I,
}

impl<I: ReplicaId> LwwRegister<I> {
    pub fn new(value: Json, timestamp: u64, origin: I) -> Self {
        Self {
            value,
            timestamp,
            origin,
        }
    }

    pub fn get(&self) -> &Json {
        &self.value
    }

    /// Overwrites the register if `(timestamp, origin)` is not dominated by
    /// the current write.
    pub fn set(&mut self, value: Json, timestamp: u64, origin: I) {
        if lamport_wins((timestamp, origin), (self.timestamp, self.origin)) {
            self.value = value;
            self.timestamp = timestamp;
            self.origin = origin;
        }
    }

    pub fn merge(&mut self, other: &Self) {
        if lamport_wins((other.timestamp, other.origin), (self.timestamp, self.origin)) {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
            self.origin = other.origin;
        }
    }
}

/// An observed-remove set: an element is visible once added and stays
/// visible until a remove has observed that exact addition.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub struct OrSet<I: ReplicaId> {
    live: BTreeMap<Dot<I>, Json>,
    tombstones: BTreeSet<Dot<I>>,
}

impl<I: ReplicaId> Default for OrSet<I> {
    fn default() -> Self {
        Self {
            live: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<I: ReplicaId> OrSet<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: Json, dot: Dot<I>) {
        self.live.insert(dot, value);
    }

    /// Removes every live occurrence of `value`, tombstoning the dots that
    /// introduced it so a concurrent re-add is unaffected.
    pub fn remove(&mut self, value: &Json) {
        let dead: Vec<Dot<I>> = self
            .live
            .iter()
            .filter(|(_, v)| *v == value)
            .map(|(d, _)| *d)
            .collect();
        for dot in dead {
            self.live.remove(&dot);
            self.tombstones.insert(dot);
        }
    }

    pub fn contains(&self, value: &Json) -> bool {
        self.live.values().any(|v| v == value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Json> {
        self.live.values()
    }

    pub fn merge(&mut self, other: &Self) {
        for (dot, value) in &other.live {
            if !self.tombstones.contains(dot) {
                self.live.insert(*dot, value.clone());
            }
        }
        for dot in &other.tombstones {
            self.tombstones.insert(*dot);
            self.live.remove(dot);
        }
    }
}

/// A PN-counter: each replica tracks its own positive and negative
/// contribution so concurrent increments never clobber one another.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub struct Counter<I: ReplicaId> {
    positive: BTreeMap<I, u64>,
    negative: BTreeMap<I, u64>,
}

impl<I: ReplicaId> Default for Counter<I> {
    fn default() -> Self {
        Self {
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
        }
    }
}

impl<I: ReplicaId> Counter<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, actor: I, delta: i64) {
        if delta >= 0 {
            *self.positive.entry(actor).or_insert(0) += delta as u64;
        } else {
            *self.negative.entry(actor).or_insert(0) += (-delta) as u64;
        }
    }

    pub fn value(&self) -> i64 {
        let pos: u64 = self.positive.values().sum();
        let neg: u64 = self.negative.values().sum();
        pos as i64 - neg as i64
    }

    pub fn merge(&mut self, other: &Self) {
        for (actor, count) in &other.positive {
            let entry = self.positive.entry(*actor).or_insert(0);
            *entry = (*entry).max(*count);
        }
        for (actor, count) in &other.negative {
            let entry = self.negative.entry(*actor).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }
}

/// An ordered list keyed by dense fractional [`PositionId`]s, so inserts,
/// removes and moves merge deterministically without renumbering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub struct OrList<I: ReplicaId> {
    live: BTreeMap<PositionId<I>, Json>,
    tombstones: BTreeSet<Dot<I>>,
}

impl<I: ReplicaId> Default for OrList<I> {
    fn default() -> Self {
        Self {
            live: BTreeMap::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<I: ReplicaId> OrList<I> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Values in list order, front to back.
    pub fn values(&self) -> impl Iterator<Item = &Json> {
        self.live.values()
    }

    pub fn position_ids(&self) -> impl Iterator<Item = &PositionId<I>> {
        self.live.keys()
    }

    pub fn first_id(&self) -> Option<&PositionId<I>> {
        self.live.keys().next()
    }

    pub fn last_id(&self) -> Option<&PositionId<I>> {
        self.live.keys().next_back()
    }

    /// Inserts `value` between `left` and `right` (either end open),
    /// returning the allocated position id.
    pub fn insert_between(
        &mut self,
        left: Option<&PositionId<I>>,
        right: Option<&PositionId<I>>,
        dot: Dot<I>,
        value: Json,
    ) -> PositionId<I> {
        let id = PositionId::between(left, right, dot);
        self.live.insert(id, value);
        id
    }

    pub fn push_back(&mut self, dot: Dot<I>, value: Json) -> PositionId<I> {
        let left = self.last_id().copied();
        self.insert_between(left.as_ref(), None, dot, value)
    }

    pub fn push_front(&mut self, dot: Dot<I>, value: Json) -> PositionId<I> {
        let right = self.first_id().copied();
        self.insert_between(None, right.as_ref(), dot, value)
    }

    pub fn remove(&mut self, id: &PositionId<I>) -> Option<Json> {
        let value = self.live.remove(id);
        if value.is_some() {
            self.tombstones.insert(id.dot());
        }
        value
    }

    pub fn merge(&mut self, other: &Self) {
        for (id, value) in &other.live {
            if !self.tombstones.contains(&id.dot()) {
                self.live.insert(*id, value.clone());
            }
        }
        for dot in &other.tombstones {
            self.tombstones.insert(*dot);
            self.live.retain(|id, _| id.dot() != *dot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lww_register_resolves_by_lamport_order() {
        let mut a = LwwRegister::new(Json::from(1), 1, 10u8);
        let b = LwwRegister::new(Json::from(2), 1, 20u8);
        a.merge(&b);
        assert_eq!(a.get(), &Json::from(2));
    }

    #[test]
    fn orset_readd_after_concurrent_remove_survives() {
        let mut a = OrSet::<u8>::new();
        a.add(Json::from("x"), Dot::new(1, 0));
        let mut b = a.clone();
        b.remove(&Json::from("x"));
        a.add(Json::from("x"), Dot::new(2, 0));
        b.merge(&a);
        assert!(b.contains(&Json::from("x")));
    }

    #[test]
    fn counter_merge_is_idempotent() {
        let mut a = Counter::<u8>::new();
        a.add(1, 5);
        a.add(1, -2);
        let snapshot = a.clone();
        a.merge(&snapshot);
        assert_eq!(a.value(), 3);
    }

    #[test]
    fn orlist_preserves_order_after_merge() {
        let mut a = OrList::<u8>::new();
        let p0 = a.push_back(Dot::new(1, 0), Json::from("a"));
        let p1 = a.push_back(Dot::new(1, 1), Json::from("b"));
        let mut b = a.clone();
        b.insert_between(Some(&p0), Some(&p1), Dot::new(2, 0), Json::from("mid"));
        a.merge(&b);
        let values: Vec<_> = a.values().cloned().collect();
        assert_eq!(values, vec![Json::from("a"), Json::from("mid"), Json::from("b")]);
    }
}
