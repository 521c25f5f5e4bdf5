//! Stack: an ordered draw/discard pile layered over a [`Chronicle`].
//!
//! Three list fields back one stack: `stack` (the draw pile, top = back of
//! the list), `drawn` (removed by `draw`, kept for history and `reset`),
//! and `discards`. A fourth, a register, freezes the original insertion
//! order so `reset` can restore it without replaying history.
//!
//! Every mutation routes through the CRDT list instead of a plain `Vec` so
//! concurrent draws on two replicas resolve deterministically (see
//! `Stack::draw`'s doc comment below).

use chronicle_crdt::{Field, PositionId};
use serde_json::Value as Json;

use crate::chronicle::Chronicle;
use crate::error::{ChronicleError, Result};
use crate::ids::PeerId;
use crate::token::Token;

/// A stack is identified by name; all its fields live under
/// `stack:<name>:*` in the chronicle document.
#[derive(Clone, Debug)]
pub struct Stack {
    name: String,
}

impl Stack {
    fn field(&self, role: &str) -> String {
        format!("stack:{}:{}", self.name, role)
    }

    /// Creates a stack, capturing `tokens` both as the live draw pile and
    /// as the frozen original order consulted by `reset`.
    pub fn create(chronicle: &mut Chronicle, name: impl Into<String>, tokens: Vec<Token>) -> Result<Self> {
        let stack = Self { name: name.into() };
        let field_stack = stack.field("stack");
        let field_original = stack.field("original");
        let original = serde_json::to_value(&tokens).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        chronicle
            .change("stack:create", |ctx| {
                ctx.set(field_original, original);
                let mut left = None;
                for token in &tokens {
                    let value = serde_json::to_value(token)?;
                    left = Some(ctx.list_insert(field_stack.clone(), left, None, value));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:create mutator cannot fail".into()))?;
        Ok(stack)
    }

    pub fn from_name(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self, chronicle: &Chronicle) -> usize {
        list_len(chronicle, &self.field("stack"))
    }

    pub fn remaining(&self, chronicle: &Chronicle) -> usize {
        self.size(chronicle)
    }

    pub fn peek(&self, chronicle: &Chronicle, n: usize) -> Vec<Token> {
        let values = list_values(chronicle, &self.field("stack"));
        let available = values.len();
        let take = n.min(available);
        values[available - take..]
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Removes the top `count` tokens from `stack` and appends them to
    /// `drawn`, returning them in draw order (bottom-most of the drawn run
    /// first).
    ///
    /// Concurrent draws on two replicas do not double-claim: each replica
    /// records which list-element ids it removed, and the list CRDT's
    /// merge resolves which replica's removal of a given id is authoritative
    /// by Lamport order. The losing replica's local view already shows the
    /// element gone (it removed its own copy too) so `Exhausted` is the
    /// only way the loser is told to retry.
    pub fn draw(&self, chronicle: &mut Chronicle, count: usize) -> Result<Vec<Token>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let field_stack = self.field("stack");
        let field_drawn = self.field("drawn");
        let entries = list_entries(chronicle, &field_stack);
        if entries.len() < count {
            return Err(ChronicleError::Exhausted);
        }
        let to_draw: Vec<(PositionId<PeerId>, Json)> = entries[entries.len() - count..].to_vec();
        let mut result = Vec::with_capacity(count);
        for (_, value) in &to_draw {
            result.push(
                serde_json::from_value(value.clone())
                    .map_err(|e| ChronicleError::CorruptChange(e.to_string()))?,
            );
        }
        chronicle
            .change("stack:draw", |ctx| {
                let mut left = match ctx.field(&field_drawn) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                for (id, value) in &to_draw {
                    ctx.list_remove(field_stack.clone(), *id);
                    left = Some(ctx.list_insert(field_drawn.clone(), left, None, value.clone()));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:draw mutator cannot fail".into()))?;
        Ok(result)
    }

    /// Like `draw` but the removed tokens land in `discards` and are not
    /// returned to the caller.
    pub fn burn(&self, chronicle: &mut Chronicle, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let field_stack = self.field("stack");
        let field_discards = self.field("discards");
        let entries = list_entries(chronicle, &field_stack);
        if entries.len() < count {
            return Err(ChronicleError::Exhausted);
        }
        let to_burn: Vec<(PositionId<PeerId>, Json)> = entries[entries.len() - count..].to_vec();
        chronicle
            .change("stack:burn", |ctx| {
                let mut left = match ctx.field(&field_discards) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                for (id, value) in &to_burn {
                    ctx.list_remove(field_stack.clone(), *id);
                    left = Some(ctx.list_insert(field_discards.clone(), left, None, value.clone()));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:burn mutator cannot fail".into()))?;
        Ok(())
    }

    /// Appends a token directly to `discards` (an agent voluntarily
    /// discarding from hand, say). The caller is responsible for having
    /// already removed the token from wherever else it lived.
    pub fn discard(&self, chronicle: &mut Chronicle, token: &Token) -> Result<()> {
        let field_discards = self.field("discards");
        let value = serde_json::to_value(token).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        chronicle
            .change("stack:discard", |ctx| {
                let left = match ctx.field(&field_discards) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                ctx.list_insert(field_discards.clone(), left, None, value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:discard mutator cannot fail".into()))?;
        Ok(())
    }

    /// Restores `stack` to its original insertion order, clearing `drawn`
    /// and `discards`.
    pub fn reset(&self, chronicle: &mut Chronicle) -> Result<()> {
        let field_stack = self.field("stack");
        let field_drawn = self.field("drawn");
        let field_discards = self.field("discards");
        let field_original = self.field("original");

        let original: Vec<Json> = match chronicle.state().field(&field_original) {
            Some(Field::Register(r)) => r.get().as_array().cloned().unwrap_or_default(),
            _ => Vec::new(),
        };
        let current_stack = list_entries(chronicle, &field_stack);
        let current_drawn = list_entries(chronicle, &field_drawn);
        let current_discards = list_entries(chronicle, &field_discards);

        chronicle
            .change("stack:reset", |ctx| {
                for (id, _) in &current_stack {
                    ctx.list_remove(field_stack.clone(), *id);
                }
                for (id, _) in &current_drawn {
                    ctx.list_remove(field_drawn.clone(), *id);
                }
                for (id, _) in &current_discards {
                    ctx.list_remove(field_discards.clone(), *id);
                }
                let mut left = None;
                for value in &original {
                    left = Some(ctx.list_insert(field_stack.clone(), left, None, value.clone()));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:reset mutator cannot fail".into()))?;
        Ok(())
    }

    /// Moves every token in `discards` back onto `stack`, in discard order,
    /// leaving `discards` empty. A "soft reset" — unlike `reset`, `drawn` and
    /// the original order are untouched, so a `Source`'s auto-reshuffle only
    /// recycles what has actually been discarded.
    pub fn restore_discards(&self, chronicle: &mut Chronicle) -> Result<()> {
        let field_stack = self.field("stack");
        let field_discards = self.field("discards");
        let discarded = list_entries(chronicle, &field_discards);
        if discarded.is_empty() {
            return Ok(());
        }
        chronicle
            .change("stack:restore_discards", |ctx| {
                for (id, _) in &discarded {
                    ctx.list_remove(field_discards.clone(), *id);
                }
                let mut left = match ctx.field(&field_stack) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                for (_, value) in &discarded {
                    left = Some(ctx.list_insert(field_stack.clone(), left, None, value.clone()));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:restore_discards mutator cannot fail".into()))?;
        Ok(())
    }

    /// Deterministic in-place permutation of `stack` using the seeded RNG.
    /// If `seed` is `None`, the caller is expected to have pulled one from
    /// Chronicle's `seed` field (see `Chronicle`'s `seed` reservation in
    /// the top-level document schema) so replicas agree.
    pub fn shuffle(&self, chronicle: &mut Chronicle, seed: &str) -> Result<()> {
        let field_stack = self.field("stack");
        let entries = list_entries(chronicle, &field_stack);
        if entries.len() <= 1 {
            return Ok(());
        }
        let mut values: Vec<Json> = entries.into_iter().map(|(_, v)| v).collect();
        crate::rng::Rng::from_seed_str(seed).shuffle(&mut values);
        chronicle
            .change("stack:shuffle", |ctx| {
                let ids: Vec<PositionId<PeerId>> = match ctx.field(&field_stack) {
                    Some(Field::List(list)) => list.position_ids().copied().collect(),
                    _ => Vec::new(),
                };
                for id in ids {
                    ctx.list_remove(field_stack.clone(), id);
                }
                let mut left = None;
                for value in &values {
                    left = Some(ctx.list_insert(field_stack.clone(), left, None, value.clone()));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("stack:shuffle mutator cannot fail".into()))?;
        Ok(())
    }
}

fn list_entries(chronicle: &Chronicle, field: &str) -> Vec<(PositionId<PeerId>, Json)> {
    match chronicle.state().field(field) {
        Some(Field::List(list)) => list
            .position_ids()
            .copied()
            .zip(list.values().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

fn list_values(chronicle: &Chronicle, field: &str) -> Vec<Json> {
    match chronicle.state().field(field) {
        Some(Field::List(list)) => list.values().cloned().collect(),
        _ => Vec::new(),
    }
}

fn list_len(chronicle: &Chronicle, field: &str) -> usize {
    match chronicle.state().field(field) {
        Some(Field::List(list)) => list.len(),
        _ => 0,
    }
}
