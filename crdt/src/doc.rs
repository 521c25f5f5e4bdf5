//! The replicated document: a map of named CRDT fields plus the causal
//! bookkeeping needed to apply remote operations exactly once.

use crate::dot::{Dot, ReplicaId};
use crate::op::{Causal, FieldId, Op};
use crate::value::{Counter, LwwRegister, OrList, OrSet};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

use crate::clock::Clock;

/// The CRDT backing a single named document field. Which variant a field
/// uses is decided once, by whichever domain type first creates it; a
/// mismatched op against an existing field is a programmer error in the
/// layer above and is rejected rather than silently coerced.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub enum Field<I: ReplicaId> {
    Register(LwwRegister<I>),
    Set(OrSet<I>),
    Counter(Counter<I>),
    List(OrList<I>),
}

impl<I: ReplicaId> Field<I> {
    fn kind(&self) -> &'static str {
        match self {
            Field::Register(_) => "register",
            Field::Set(_) => "set",
            Field::Counter(_) => "counter",
            Field::List(_) => "list",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub struct Document<I: ReplicaId> {
    fields: BTreeMap<FieldId, Field<I>>,
    #[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
    clock: Clock<I>,
}

impl<I: ReplicaId> Document<I> {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
            clock: Clock::new(),
        }
    }

    /// The next unused dot for `actor`, without advancing the clock; call
    /// [`Document::observe`] once the op carrying it is actually applied.
    pub fn next_dot(&self, actor: I) -> Dot<I> {
        self.clock.next_dot(actor)
    }

    pub fn observe(&mut self, dot: Dot<I>) {
        self.clock.insert(dot);
    }

    pub fn has_seen(&self, dot: &Dot<I>) -> bool {
        self.clock.contains(dot)
    }

    pub fn field(&self, name: &str) -> Option<&Field<I>> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldId, &Field<I>)> {
        self.fields.iter()
    }

    fn set_mut(&mut self, field: &str) -> &mut OrSet<I> {
        match self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| Field::Set(OrSet::new()))
        {
            Field::Set(s) => s,
            other => panic!("field {field} is a {} not a set", other.kind()),
        }
    }

    fn counter_mut(&mut self, field: &str) -> &mut Counter<I> {
        match self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| Field::Counter(Counter::new()))
        {
            Field::Counter(c) => c,
            other => panic!("field {field} is a {} not a counter", other.kind()),
        }
    }

    fn list_mut(&mut self, field: &str) -> &mut OrList<I> {
        match self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| Field::List(OrList::new()))
        {
            Field::List(l) => l,
            other => panic!("field {field} is a {} not a list", other.kind()),
        }
    }

    /// Applies a single op, creating the target field with the matching
    /// CRDT kind on first use. Returns an error rather than panicking if a
    /// later op addresses an existing field with the wrong kind — that is
    /// the one way `apply` can fail, and it signals a corrupt change set.
    pub fn apply(&mut self, op: Op<I>) -> Result<()> {
        if let Some(dot) = op.dot() {
            if self.has_seen(dot) {
                return Ok(());
            }
        }
        match op {
            Op::Set { field, value, dot } => {
                match self.fields.entry(field.clone()) {
                    std::collections::btree_map::Entry::Occupied(mut entry) => match entry.get_mut() {
                        Field::Register(r) => r.set(value, dot.counter, dot.id),
                        other => return Err(anyhow!("field {field} is a {} not a register", other.kind())),
                    },
                    std::collections::btree_map::Entry::Vacant(entry) => {
                        entry.insert(Field::Register(LwwRegister::new(value, dot.counter, dot.id)));
                    }
                }
                self.observe(dot);
            }
            Op::SetAdd { field, value, dot } => {
                if let Some(existing) = self.fields.get(&field) {
                    if !matches!(existing, Field::Set(_)) {
                        return Err(anyhow!("field {field} is not a set"));
                    }
                }
                self.set_mut(&field).add(value, dot);
                self.observe(dot);
            }
            Op::SetRemove { field, value } => {
                if let Some(Field::Set(s)) = self.fields.get_mut(&field) {
                    s.remove(&value);
                }
            }
            Op::CounterAdd { field, delta, dot } => {
                if let Some(existing) = self.fields.get(&field) {
                    if !matches!(existing, Field::Counter(_)) {
                        return Err(anyhow!("field {field} is not a counter"));
                    }
                }
                self.counter_mut(&field).add(dot.id, delta);
                self.observe(dot);
            }
            Op::ListInsert {
                field,
                left,
                right,
                value,
                dot,
            } => {
                if let Some(existing) = self.fields.get(&field) {
                    if !matches!(existing, Field::List(_)) {
                        return Err(anyhow!("field {field} is not a list"));
                    }
                }
                self.list_mut(&field)
                    .insert_between(left.as_ref(), right.as_ref(), dot, value);
                self.observe(dot);
            }
            Op::ListRemove { field, id } => {
                if let Some(Field::List(l)) = self.fields.get_mut(&field) {
                    l.remove(&id);
                }
            }
            Op::ListMove {
                field,
                id,
                left,
                right,
                new_dot,
            } => {
                if let Some(Field::List(l)) = self.fields.get_mut(&field) {
                    if let Some(value) = l.remove(&id) {
                        l.insert_between(left.as_ref(), right.as_ref(), new_dot, value);
                        self.observe(new_dot);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn apply_causal(&mut self, causal: &Causal<I>) -> Result<()> {
        for op in &causal.ops {
            self.apply(op.clone())?;
        }
        Ok(())
    }

    /// Merges a remote document wholesale (used for snapshot bootstrap and
    /// full-state sync rather than incremental op exchange).
    pub fn merge(&mut self, other: &Document<I>) {
        for (name, field) in &other.fields {
            match (self.fields.get_mut(name), field) {
                (Some(Field::Register(a)), Field::Register(b)) => a.merge(b),
                (Some(Field::Set(a)), Field::Set(b)) => a.merge(b),
                (Some(Field::Counter(a)), Field::Counter(b)) => a.merge(b),
                (Some(Field::List(a)), Field::List(b)) => a.merge(b),
                (None, field) => {
                    self.fields.insert(name.clone(), field.clone());
                }
                _ => tracing::warn!(field = %name, "skipping merge of mismatched field kind"),
            }
        }
        self.clock.union(&other.clock);
    }

    pub fn save(&self) -> Result<Vec<u8>>
    where
        I: Serialize,
    {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn load(bytes: &[u8]) -> Result<Self>
    where
        I: for<'d> Deserialize<'d>,
    {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_idempotent_for_duplicate_dots() {
        let mut doc = Document::<u8>::new();
        let dot = doc.next_dot(1);
        doc.apply(Op::CounterAdd {
            field: "round".into(),
            delta: 1,
            dot,
        })
        .unwrap();
        doc.apply(Op::CounterAdd {
            field: "round".into(),
            delta: 1,
            dot,
        })
        .unwrap();
        match doc.field("round").unwrap() {
            Field::Counter(c) => assert_eq!(c.value(), 1),
            _ => panic!("expected counter"),
        }
    }

    #[test]
    fn merge_of_disjoint_documents_is_commutative() {
        let mut a = Document::<u8>::new();
        let dot_a = a.next_dot(1);
        a.apply(Op::CounterAdd {
            field: "round".into(),
            delta: 1,
            dot: dot_a,
        })
        .unwrap();

        let mut b = Document::<u8>::new();
        let dot_b = b.next_dot(2);
        b.apply(Op::CounterAdd {
            field: "round".into(),
            delta: 2,
            dot: dot_b,
        })
        .unwrap();

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        let value = |d: &Document<u8>| match d.field("round").unwrap() {
            Field::Counter(c) => c.value(),
            _ => panic!(),
        };
        assert_eq!(value(&ab), value(&ba));
        assert_eq!(value(&ab), 3);
    }

    #[test]
    fn save_load_roundtrip_preserves_state() {
        let mut doc = Document::<u8>::new();
        let dot = doc.next_dot(1);
        doc.apply(Op::Set {
            field: "phase".into(),
            value: Json::from("setup"),
            dot,
        })
        .unwrap();
        let bytes = doc.save().unwrap();
        let restored = Document::<u8>::load(&bytes).unwrap();
        match restored.field("phase").unwrap() {
            Field::Register(r) => assert_eq!(r.get(), &Json::from("setup")),
            _ => panic!(),
        }
    }
}

/// Property tests for the convergence/commutativity laws: applying the
/// same set of concurrent ops to independent replicas, in any interleaving,
/// must leave every replica in the same resulting state.
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::collection::vec as pvec;
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Action {
        Add { actor: u8, delta: i64 },
    }

    fn action() -> impl Strategy<Value = Action> {
        (1u8..=4, -10i64..=10).prop_map(|(actor, delta)| Action::Add { actor, delta })
    }

    fn counter_value(doc: &Document<u8>) -> i64 {
        match doc.field("score") {
            Some(Field::Counter(c)) => c.value(),
            None => 0,
            _ => panic!("expected counter"),
        }
    }

    proptest! {
        /// However the same bag of concurrent counter adds is partitioned
        /// and merged back together across replicas, every replica ends up
        /// with the same total: merge is commutative and associative, and
        /// re-merging an already-seen dot is a no-op.
        #[test]
        fn counter_merge_converges_regardless_of_order(actions in pvec(action(), 1..20)) {
            let mut canonical = Document::<u8>::new();
            for a in &actions {
                let Action::Add { actor, delta } = a;
                let dot = canonical.next_dot(*actor);
                canonical.apply(Op::CounterAdd { field: "score".into(), delta: *delta, dot }).unwrap();
            }
            let expected = counter_value(&canonical);

            // Replay the same ops onto N per-actor replicas, each only
            // directly applying its own actor's ops, then merge pairwise in
            // a few different orders.
            let mut by_actor: BTreeMap<u8, Document<u8>> = BTreeMap::new();
            for a in &actions {
                let Action::Add { actor, delta } = a;
                let replica = by_actor.entry(*actor).or_insert_with(Document::new);
                let dot = replica.next_dot(*actor);
                replica.apply(Op::CounterAdd { field: "score".into(), delta: *delta, dot }).unwrap();
            }
            let replicas: Vec<Document<u8>> = by_actor.into_values().collect();

            let mut forward = Document::<u8>::new();
            for r in &replicas {
                forward.merge(r);
            }
            let mut backward = Document::<u8>::new();
            for r in replicas.iter().rev() {
                backward.merge(r);
            }
            // Merging twice must not double-count: every dot is already
            // observed on the second pass.
            let mut merged_twice = forward.clone();
            for r in &replicas {
                merged_twice.merge(r);
            }

            prop_assert_eq!(counter_value(&forward), expected);
            prop_assert_eq!(counter_value(&backward), expected);
            prop_assert_eq!(counter_value(&merged_twice), expected);
        }
    }
}
