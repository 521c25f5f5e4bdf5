//! Vector clock used as both a per-peer sync cursor and a causal context.

use crate::dot::{Dot, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: Ord + Serialize + for<'d> Deserialize<'d>")]
pub struct Clock<I: Ord> {
    clock: BTreeMap<I, u64>,
    cloud: BTreeSet<Dot<I>>,
}

impl<I: Ord> Default for Clock<I> {
    fn default() -> Self {
        Self {
            clock: BTreeMap::new(),
            cloud: BTreeSet::new(),
        }
    }
}

impl<I: ReplicaId> Clock<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once every dot in the cloud has been folded into a contiguous
    /// run; a non-causal clock has observed a gap (a dot without its
    /// predecessors) and cannot yet report a single counter per actor.
    pub fn is_causal(&self) -> bool {
        self.cloud.is_empty()
    }

    pub fn contains(&self, dot: &Dot<I>) -> bool {
        if self.get(&dot.id) >= dot.counter + 1 {
            return true;
        }
        self.cloud.contains(dot)
    }

    /// Records a dot as observed, compacting the cloud into the contiguous
    /// clock whenever the dot closes a gap.
    pub fn insert(&mut self, dot: Dot<I>) {
        let current = self.get(&dot.id);
        if dot.counter == current {
            self.clock.insert(dot.id, current + 1);
            self.compact();
        } else if dot.counter > current {
            self.cloud.insert(dot);
        }
    }

    /// The next unseen counter for `actor`. All actors absent from the
    /// clock are implicitly at zero.
    pub fn get(&self, actor: &I) -> u64 {
        self.clock.get(actor).copied().unwrap_or(0)
    }

    pub fn next_dot(&self, actor: I) -> Dot<I> {
        Dot::new(actor, self.get(&actor))
    }

    pub fn union(&mut self, other: &Clock<I>) {
        for (actor, counter) in &other.clock {
            let entry = self.clock.entry(*actor).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
        for dot in &other.cloud {
            self.insert(*dot);
        }
        self.compact();
    }

    fn compact(&mut self) {
        loop {
            let mut progressed = false;
            let ready: Vec<Dot<I>> = self
                .cloud
                .iter()
                .filter(|dot| dot.counter == self.get(&dot.id))
                .copied()
                .collect();
            for dot in ready {
                self.cloud.remove(&dot);
                self.clock.insert(dot.id, dot.counter + 1);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_in_order_stays_causal() {
        let mut clock = Clock::new();
        clock.insert(Dot::new(1u8, 0));
        clock.insert(Dot::new(1u8, 1));
        assert!(clock.is_causal());
        assert_eq!(clock.get(&1), 2);
    }

    #[test]
    fn out_of_order_insert_then_compacts() {
        let mut clock = Clock::new();
        clock.insert(Dot::new(1u8, 1));
        assert!(!clock.is_causal());
        clock.insert(Dot::new(1u8, 0));
        assert!(clock.is_causal());
        assert_eq!(clock.get(&1), 2);
    }

    #[test]
    fn union_is_commutative() {
        let mut a = Clock::new();
        a.insert(Dot::new(1u8, 0));
        let mut b = Clock::new();
        b.insert(Dot::new(2u8, 0));

        let mut ab = a.clone();
        ab.union(&b);
        let mut ba = b.clone();
        ba.union(&a);
        assert_eq!(ab.get(&1), ba.get(&1));
        assert_eq!(ab.get(&2), ba.get(&2));
    }
}
