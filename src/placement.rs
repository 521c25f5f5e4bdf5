//! A placement: a token reference inside a zone at a point in time.
//!
//! `tokenSnapshot` freezes the token's value as of the placement, so a
//! later edit to the token (were that possible; tokens are immutable, see
//! [`crate::token::Token`]) or a replacement token sharing an id never
//! retroactively changes boards that already reference the old value.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ids::{PlacementId, TokenId};
use crate::token::Token;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub placement_id: PlacementId,
    pub token_id: TokenId,
    pub token_snapshot: Token,
    pub x: f64,
    pub y: f64,
    pub face_up: bool,
    pub locked: bool,
    pub tags: BTreeSet<String>,
}

impl Placement {
    pub fn new(placement_id: PlacementId, token: &Token, x: f64, y: f64, face_up: bool) -> Self {
        Self {
            placement_id,
            token_id: token.id.clone(),
            token_snapshot: token.clone(),
            x,
            y,
            face_up,
            locked: false,
            tags: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_id_always_matches_snapshot_id() {
        let token = Token::new("card-1", "Ace");
        let placement = Placement::new(PlacementId::generate(), &token, 0.0, 0.0, true);
        assert_eq!(placement.token_id, placement.token_snapshot.id);
    }
}
