//! The closed operation algebra the whole document is built from.
//!
//! Every mutation to a [`crate::doc::Document`] is expressed as one of the
//! [`Op`] variants below. `Document::apply` is total: given any `Op` and any
//! document it always produces a new, well-defined document, which is what
//! lets replicas exchange arbitrary logs of operations and converge.

use crate::dot::{Dot, ReplicaId};
use crate::position::PositionId;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Addresses a single field inside the document by name.
pub type FieldId = String;

/// One field-level mutation, tagged with the dot that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub enum Op<I: ReplicaId> {
    /// Last-writer-wins assignment of a register field.
    Set {
        field: FieldId,
        value: Json,
        dot: Dot<I>,
    },
    /// Adds `value` to a set field.
    SetAdd {
        field: FieldId,
        value: Json,
        dot: Dot<I>,
    },
    /// Removes every live occurrence of `value` from a set field.
    SetRemove { field: FieldId, value: Json },
    /// Adds `delta` to a counter field.
    CounterAdd {
        field: FieldId,
        delta: i64,
        dot: Dot<I>,
    },
    /// Inserts `value` into a list field between `left` and `right`.
    ListInsert {
        field: FieldId,
        left: Option<PositionId<I>>,
        right: Option<PositionId<I>>,
        value: Json,
        dot: Dot<I>,
    },
    /// Removes the element at `id` from a list field.
    ListRemove { field: FieldId, id: PositionId<I> },
    /// Moves the element at `id` to a new position, assigning `new_dot`.
    ListMove {
        field: FieldId,
        id: PositionId<I>,
        left: Option<PositionId<I>>,
        right: Option<PositionId<I>>,
        new_dot: Dot<I>,
    },
}

impl<I: ReplicaId> Op<I> {
    pub fn field(&self) -> &str {
        match self {
            Op::Set { field, .. }
            | Op::SetAdd { field, .. }
            | Op::SetRemove { field, .. }
            | Op::CounterAdd { field, .. }
            | Op::ListInsert { field, .. }
            | Op::ListRemove { field, .. }
            | Op::ListMove { field, .. } => field,
        }
    }

    pub fn dot(&self) -> Option<Dot<I>> {
        match self {
            Op::Set { dot, .. }
            | Op::SetAdd { dot, .. }
            | Op::CounterAdd { dot, .. }
            | Op::ListInsert { dot, .. } => Some(*dot),
            Op::ListMove { new_dot, .. } => Some(*new_dot),
            Op::SetRemove { .. } | Op::ListRemove { .. } => None,
        }
    }
}

/// A sealed batch of operations produced by one `Chronicle::change` call,
/// or received from a peer via `merge`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "I: ReplicaId + Serialize + for<'d> Deserialize<'d>")]
pub struct Causal<I: ReplicaId> {
    pub label: String,
    pub origin: I,
    pub timestamp: u64,
    pub ops: Vec<Op<I>>,
}
