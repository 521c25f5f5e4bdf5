//! The replicated document container: `change`/`merge`/`save`/`load` plus
//! the event lifecycle the rest of the engine observes.
//!
//! Per Design Note 3, the pipeline the Engine/RuleEngine/Policies ride on
//! (synchronous, in-process) is kept separate from the subscription bus
//! external observers use — a slow or misbehaving external subscriber can
//! never stall a dispatch.

use chronicle_crdt::{Causal, Dot, Document, Field, Op, PositionId};
use serde_json::Value as Json;

use crate::error::{ChronicleError, Result};
use crate::ids::PeerId;

const SCHEMA_VERSION: u8 = 1;

/// Where a `state:changed` notification originated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeSource {
    Local,
    Merge,
    Load,
}

/// Events a `Chronicle` hands to its subscribers. Subscribers run
/// synchronously and must not block; slow work belongs on the other side of
/// a channel the subscriber owns.
#[derive(Clone, Debug)]
pub enum ChronicleEvent {
    StateChanged {
        source: ChangeSource,
    },
    SyncNeed {
        peer: Option<PeerId>,
        bytes: Vec<u8>,
    },
}

/// A mutable view of the document handed to a `change` mutator. Reads see
/// the document as it stood when the transaction opened; writes are
/// recorded as ops and applied only once the mutator returns successfully,
/// so a mutator that bails out midway leaves no trace.
pub struct ChangeCtx<'a> {
    doc: &'a Document<PeerId>,
    actor: PeerId,
    next_counter: u64,
    ops: Vec<Op<PeerId>>,
}

impl<'a> ChangeCtx<'a> {
    fn new(doc: &'a Document<PeerId>, actor: PeerId) -> Self {
        let next_counter = doc.next_dot(actor).counter;
        Self {
            doc,
            actor,
            next_counter,
            ops: Vec::new(),
        }
    }

    fn next_dot(&mut self) -> Dot<PeerId> {
        let dot = Dot::new(self.actor, self.next_counter);
        self.next_counter += 1;
        dot
    }

    /// Reads a field as it stood when this transaction opened.
    pub fn field(&self, name: &str) -> Option<&Field<PeerId>> {
        self.doc.field(name)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Json) {
        let dot = self.next_dot();
        self.ops.push(Op::Set {
            field: field.into(),
            value,
            dot,
        });
    }

    pub fn set_add(&mut self, field: impl Into<String>, value: Json) {
        let dot = self.next_dot();
        self.ops.push(Op::SetAdd {
            field: field.into(),
            value,
            dot,
        });
    }

    pub fn set_remove(&mut self, field: impl Into<String>, value: Json) {
        self.ops.push(Op::SetRemove {
            field: field.into(),
            value,
        });
    }

    pub fn counter_add(&mut self, field: impl Into<String>, delta: i64) {
        let dot = self.next_dot();
        self.ops.push(Op::CounterAdd {
            field: field.into(),
            delta,
            dot,
        });
    }

    pub fn list_insert(
        &mut self,
        field: impl Into<String>,
        left: Option<PositionId<PeerId>>,
        right: Option<PositionId<PeerId>>,
        value: Json,
    ) -> PositionId<PeerId> {
        let dot = self.next_dot();
        let id = PositionId::between(left.as_ref(), right.as_ref(), dot);
        self.ops.push(Op::ListInsert {
            field: field.into(),
            left,
            right,
            value,
            dot,
        });
        id
    }

    pub fn list_remove(&mut self, field: impl Into<String>, id: PositionId<PeerId>) {
        self.ops.push(Op::ListRemove {
            field: field.into(),
            id,
        });
    }

    pub fn list_move(
        &mut self,
        field: impl Into<String>,
        id: PositionId<PeerId>,
        left: Option<PositionId<PeerId>>,
        right: Option<PositionId<PeerId>>,
    ) -> PositionId<PeerId> {
        let new_dot = self.next_dot();
        let new_id = PositionId::between(left.as_ref(), right.as_ref(), new_dot);
        self.ops.push(Op::ListMove {
            field: field.into(),
            id,
            left,
            right,
            new_dot,
        });
        new_id
    }
}

type Subscriber = Box<dyn FnMut(&ChronicleEvent) + Send>;

/// Owns one replica's CRDT document and its change/merge/emit lifecycle.
pub struct Chronicle {
    document: Document<PeerId>,
    replica_id: PeerId,
    subscribers: Vec<Subscriber>,
}

impl Chronicle {
    pub fn new(replica_id: PeerId) -> Self {
        Self {
            document: Document::new(),
            replica_id,
            subscribers: Vec::new(),
        }
    }

    pub fn replica_id(&self) -> PeerId {
        self.replica_id
    }

    /// Read-only accessor; the returned reference is stable until the next
    /// `change`/`merge`/`load` call.
    pub fn state(&self) -> &Document<PeerId> {
        &self.document
    }

    pub fn subscribe(&mut self, subscriber: impl FnMut(&ChronicleEvent) + Send + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    fn notify(&mut self, event: ChronicleEvent) {
        for subscriber in &mut self.subscribers {
            subscriber(&event);
        }
    }

    /// Opens a transaction. `mutator` sees a read-only view of the current
    /// document plus recorder methods for the changes it wants to make. If
    /// `mutator` returns `Err`, nothing is applied and `InvalidMutation` is
    /// returned to the caller.
    pub fn change<F>(&mut self, label: &str, mutator: F) -> Result<()>
    where
        F: FnOnce(&mut ChangeCtx) -> anyhow::Result<()>,
    {
        let mut ctx = ChangeCtx::new(&self.document, self.replica_id);
        mutator(&mut ctx).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        let ops = ctx.ops;
        if ops.is_empty() {
            return Ok(());
        }
        for op in ops.clone() {
            self.document
                .apply(op)
                .map_err(|e| ChronicleError::InternalInvariantBroken(e.to_string()))?;
        }
        let causal = Causal {
            label: label.to_string(),
            origin: self.replica_id,
            timestamp: now_ms(),
            ops,
        };
        let bytes = encode_causal(&causal)?;
        self.notify(ChronicleEvent::StateChanged {
            source: ChangeSource::Local,
        });
        self.notify(ChronicleEvent::SyncNeed { peer: None, bytes });
        Ok(())
    }

    /// Applies a batch of remote operations. Idempotent: ops carrying a dot
    /// already observed by this replica's clock are silently skipped.
    pub fn merge(&mut self, bytes: &[u8]) -> Result<()> {
        let causal: Causal<PeerId> =
            rmp_serde::from_slice(bytes).map_err(|e| ChronicleError::CorruptChange(e.to_string()))?;
        self.document
            .apply_causal(&causal)
            .map_err(|e| ChronicleError::CorruptChange(e.to_string()))?;
        self.notify(ChronicleEvent::StateChanged {
            source: ChangeSource::Merge,
        });
        Ok(())
    }

    /// Merges another replica's document wholesale (snapshot bootstrap).
    pub fn merge_document(&mut self, other: &Document<PeerId>) {
        self.document.merge(other);
        self.notify(ChronicleEvent::StateChanged {
            source: ChangeSource::Merge,
        });
    }

    pub fn save(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![SCHEMA_VERSION];
        bytes.extend(
            self.document
                .save()
                .map_err(|e| ChronicleError::CorruptChange(e.to_string()))?,
        );
        Ok(bytes)
    }

    pub fn load(replica_id: PeerId, bytes: &[u8]) -> Result<Self> {
        let (version, rest) = bytes
            .split_first()
            .ok_or_else(|| ChronicleError::CorruptChange("empty snapshot".into()))?;
        if *version != SCHEMA_VERSION {
            return Err(ChronicleError::VersionDrift {
                expected: SCHEMA_VERSION as u32,
                found: *version as u32,
            });
        }
        let document = Document::load(rest).map_err(|e| ChronicleError::CorruptChange(e.to_string()))?;
        let mut chronicle = Self {
            document,
            replica_id,
            subscribers: Vec::new(),
        };
        chronicle.notify(ChronicleEvent::StateChanged {
            source: ChangeSource::Load,
        });
        Ok(chronicle)
    }

}

fn encode_causal(causal: &Causal<PeerId>) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(causal).map_err(|e| ChronicleError::CorruptChange(e.to_string()))
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_rolls_back_on_mutator_error() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        let result = chronicle.change("bad", |_ctx| anyhow::bail!("nope"));
        assert!(matches!(result, Err(ChronicleError::InvalidMutation(_))));
        assert!(chronicle.state().field("phase").is_none());
    }

    #[test]
    fn change_applies_ops_and_emits_sync_need() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut chronicle = Chronicle::new(PeerId::generate());
        let emitted = Arc::new(AtomicUsize::new(0));
        let counter = emitted.clone();
        chronicle.subscribe(move |event| {
            if let ChronicleEvent::SyncNeed { .. } = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        chronicle
            .change("setup", |ctx| {
                ctx.set("phase", Json::from("setup"));
                Ok(())
            })
            .unwrap();
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
        match chronicle.state().field("phase").unwrap() {
            Field::Register(r) => assert_eq!(r.get(), &Json::from("setup")),
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn save_load_roundtrip_preserves_state() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        chronicle
            .change("setup", |ctx| {
                ctx.counter_add("round", 1);
                Ok(())
            })
            .unwrap();
        let bytes = chronicle.save().unwrap();
        let restored = Chronicle::load(chronicle.replica_id(), &bytes).unwrap();
        match restored.state().field("round").unwrap() {
            Field::Counter(c) => assert_eq!(c.value(), 1),
            _ => panic!("expected counter"),
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let origin = PeerId::generate();
        let bytes = encode_causal(&Causal {
            label: "setup".into(),
            origin,
            timestamp: 0,
            ops: vec![Op::Set {
                field: "phase".into(),
                value: Json::from("setup"),
                dot: Dot::new(origin, 0),
            }],
        })
        .unwrap();
        let mut b = Chronicle::new(PeerId::generate());
        b.merge(&bytes).unwrap();
        b.merge(&bytes).unwrap();
        match b.state().field("phase").unwrap() {
            Field::Register(r) => assert_eq!(r.get(), &Json::from("setup")),
            _ => panic!("expected register"),
        }
    }
}
