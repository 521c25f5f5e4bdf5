//! Tokens: immutable, identified game entities.
//!
//! A token is never mutated in place — "edits" construct a new token with
//! the same id and different fields. Equality is defined purely by id: two
//! tokens holding different labels can still be "the same card" for
//! comparison purposes, though engine handlers should avoid relying on that
//! to dedupe stale snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::{BTreeMap, BTreeSet};

use crate::ids::TokenId;

/// An immutable game entity. Clone liberally — a clone is the cheapest way
/// to snapshot a token's value at a point in time (see [`crate::placement::Placement`]).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub label: String,
    pub group: Option<String>,
    pub meta: BTreeMap<String, Json>,
    pub tags: BTreeSet<String>,
    pub attachments: Vec<TokenId>,
}

impl Token {
    pub fn new(id: impl Into<TokenId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            group: None,
            meta: BTreeMap::new(),
            tags: BTreeSet::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Json) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns a new token identical except for `label` — the only
    /// sanctioned way to "edit" a token already referenced by placements
    /// that captured a snapshot of the old value.
    pub fn relabel(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Token {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_with_same_id_are_equal_despite_differing_fields() {
        let a = Token::new("card-1", "Ace of Spades");
        let b = Token::new("card-1", "something else entirely").with_tag("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn relabel_preserves_identity_and_other_fields() {
        let original = Token::new("card-1", "Ace").with_group("spades");
        let relabeled = original.relabel("Ace of Spades");
        assert_eq!(relabeled.id, original.id);
        assert_eq!(relabeled.group, original.group);
        assert_eq!(relabeled.label, "Ace of Spades");
    }
}
