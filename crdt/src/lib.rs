//! # chronicle-crdt
//!
//! The conflict-free replicated data types backing a chronicle document.
//!
//! A document is a flat map of named fields (`stack:deck:pile`,
//! `zone:battlefield`, `agent:p1:resources`, ...); each field is one of
//! four primitive CRDTs — [`value::LwwRegister`], [`value::OrSet`],
//! [`value::Counter`], [`value::OrList`] — addressed through the closed
//! [`op::Op`] algebra so that `Document::apply` is total: a finite,
//! explicitly tagged operation set rather than a dynamic per-field proxy.
//!
//! Ordering within a field resolves by `(timestamp, originId)`, the
//! Lamport tie-break every replica computes identically — see
//! [`dot::lamport_wins`].

pub mod clock;
pub mod dot;
pub mod doc;
pub mod op;
pub mod position;
pub mod value;

pub use clock::Clock;
pub use doc::{Document, Field};
pub use dot::{Dot, ReplicaId};
pub use op::{Causal, FieldId, Op};
pub use position::PositionId;
pub use value::{Counter, LwwRegister, OrList, OrSet};
