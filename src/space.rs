//! Space: a board of named zones, each an ordered list of placements.
//!
//! Zone membership is an `OrSet` of zone names, each zone's placements are
//! an `OrList`, and each zone's lock flag and metadata are `LwwRegister`s —
//! all scoped under `space:<zone>:*` in the chronicle document, with a
//! single space-wide monotone counter minting placement ids.

use chronicle_crdt::{Field, PositionId};
use serde_json::Value as Json;

use crate::chronicle::Chronicle;
use crate::error::{ChronicleError, Result};
use crate::ids::{PeerId, PlacementId, TokenId};
use crate::placement::Placement;
use crate::token::Token;

const ZONES_FIELD: &str = "space:zones";
const PLACEMENT_SEQ_FIELD: &str = "space:placement_seq";

/// A space is a flat namespace of zones; there is one per chronicle
/// (user games that need several boards prefix zone names themselves).
#[derive(Clone, Debug, Default)]
pub struct Space;

impl Space {
    fn placements_field(zone: &str) -> String {
        format!("space:{zone}:placements")
    }
    fn locked_field(zone: &str) -> String {
        format!("space:{zone}:locked")
    }
    fn meta_field(zone: &str) -> String {
        format!("space:{zone}:meta")
    }

    pub fn has_zone(chronicle: &Chronicle, zone: &str) -> bool {
        match chronicle.state().field(ZONES_FIELD) {
            Some(Field::Set(set)) => set.contains(&Json::from(zone)),
            _ => false,
        }
    }

    pub fn create_zone(chronicle: &mut Chronicle, zone: &str, meta: Option<Json>) -> Result<()> {
        if Self::has_zone(chronicle, zone) {
            return Ok(());
        }
        let meta_field = Self::meta_field(zone);
        let meta_value = meta.unwrap_or(Json::Null);
        chronicle
            .change("space:create_zone", |ctx| {
                ctx.set_add(ZONES_FIELD, Json::from(zone));
                ctx.set(meta_field, meta_value);
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:create_zone mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn remove_zone(chronicle: &mut Chronicle, zone: &str) -> Result<()> {
        if !Self::has_zone(chronicle, zone) {
            return Err(ChronicleError::UnknownZone(zone.to_string()));
        }
        let placements_field = Self::placements_field(zone);
        let ids = Self::list_ids(chronicle, &placements_field);
        chronicle
            .change("space:remove_zone", |ctx| {
                for id in &ids {
                    ctx.list_remove(placements_field.clone(), *id);
                }
                ctx.set_remove(ZONES_FIELD, Json::from(zone));
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:remove_zone mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn is_locked(chronicle: &Chronicle, zone: &str) -> bool {
        match chronicle.state().field(&Self::locked_field(zone)) {
            Some(Field::Register(r)) => r.get().as_bool().unwrap_or(false),
            _ => false,
        }
    }

    pub fn lock_zone(chronicle: &mut Chronicle, zone: &str) -> Result<()> {
        Self::set_lock(chronicle, zone, true)
    }

    pub fn unlock_zone(chronicle: &mut Chronicle, zone: &str) -> Result<()> {
        Self::set_lock(chronicle, zone, false)
    }

    fn set_lock(chronicle: &mut Chronicle, zone: &str, locked: bool) -> Result<()> {
        if !Self::has_zone(chronicle, zone) {
            return Err(ChronicleError::UnknownZone(zone.to_string()));
        }
        let field = Self::locked_field(zone);
        chronicle
            .change("space:set_lock", |ctx| {
                ctx.set(field, Json::from(locked));
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:set_lock mutator cannot fail".into()))?;
        Ok(())
    }

    /// Every placement currently on the board, across all zones, paired
    /// with the token id it references. Used to enforce the
    /// one-location-per-token invariant.
    fn locate_token(chronicle: &Chronicle, token_id: &TokenId) -> Option<String> {
        let zones = Self::zone_names(chronicle);
        for zone in zones {
            let field = Self::placements_field(&zone);
            if Self::placements(chronicle, &field)
                .iter()
                .any(|p| &p.token_id == token_id)
            {
                return Some(zone);
            }
        }
        None
    }

    fn zone_names(chronicle: &Chronicle) -> Vec<String> {
        match chronicle.state().field(ZONES_FIELD) {
            Some(Field::Set(set)) => set
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn next_placement_id(chronicle: &Chronicle) -> u64 {
        match chronicle.state().field(PLACEMENT_SEQ_FIELD) {
            Some(Field::Counter(c)) => c.value().max(0) as u64,
            _ => 0,
        }
    }

    pub fn place(chronicle: &mut Chronicle, zone: &str, token: &Token, x: f64, y: f64, face_up: bool) -> Result<Placement> {
        if !Self::has_zone(chronicle, zone) {
            return Err(ChronicleError::UnknownZone(zone.to_string()));
        }
        if Self::is_locked(chronicle, zone) {
            return Err(ChronicleError::ZoneLocked(zone.to_string()));
        }
        if Self::locate_token(chronicle, &token.id).is_some() {
            return Err(ChronicleError::TokenAlreadyPlaced(token.id.to_string()));
        }
        let next_seq = Self::next_placement_id(chronicle);
        let placement_id = PlacementId::new(placement_id_bytes(next_seq));
        let placement = Placement::new(placement_id, token, x, y, face_up);
        let value = serde_json::to_value(&placement).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        let field = Self::placements_field(zone);
        chronicle
            .change("space:place", |ctx| {
                ctx.counter_add(PLACEMENT_SEQ_FIELD, 1);
                let left = match ctx.field(&field) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                ctx.list_insert(field.clone(), left, None, value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:place mutator cannot fail".into()))?;
        Ok(placement)
    }

    /// Moves a placement from one zone to another (or within the same
    /// zone, changing only `x`/`y`), atomically with respect to the
    /// one-location-per-token invariant.
    pub fn move_placement(
        chronicle: &mut Chronicle,
        from_zone: &str,
        to_zone: &str,
        placement_id: PlacementId,
        xy: Option<(f64, f64)>,
    ) -> Result<()> {
        if !Self::has_zone(chronicle, from_zone) {
            return Err(ChronicleError::UnknownZone(from_zone.to_string()));
        }
        if !Self::has_zone(chronicle, to_zone) {
            return Err(ChronicleError::UnknownZone(to_zone.to_string()));
        }
        if Self::is_locked(chronicle, from_zone) || Self::is_locked(chronicle, to_zone) {
            return Err(ChronicleError::ZoneLocked(from_zone.to_string()));
        }
        let from_field = Self::placements_field(from_zone);
        let to_field = Self::placements_field(to_zone);
        let (id, mut placement) = Self::find(chronicle, &from_field, placement_id)
            .ok_or_else(|| ChronicleError::UnknownPlacement(placement_id.to_string()))?;
        if let Some((x, y)) = xy {
            placement.x = x;
            placement.y = y;
        }
        let value = serde_json::to_value(&placement).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        chronicle
            .change("space:move", |ctx| {
                ctx.list_remove(from_field.clone(), id);
                let left = match ctx.field(&to_field) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                ctx.list_insert(to_field.clone(), left, None, value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:move mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn flip(chronicle: &mut Chronicle, zone: &str, placement_id: PlacementId) -> Result<()> {
        if !Self::has_zone(chronicle, zone) {
            return Err(ChronicleError::UnknownZone(zone.to_string()));
        }
        if Self::is_locked(chronicle, zone) {
            return Err(ChronicleError::ZoneLocked(zone.to_string()));
        }
        let field = Self::placements_field(zone);
        let (id, mut placement) = Self::find(chronicle, &field, placement_id)
            .ok_or_else(|| ChronicleError::UnknownPlacement(placement_id.to_string()))?;
        placement.face_up = !placement.face_up;
        let value = serde_json::to_value(&placement).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        // Flip is a pure in-place toggle: reinsert at the same spot rather
        // than at the list's front, so it never reorders the zone as a
        // side effect.
        let (left, right) = Self::neighbors(chronicle, &field, id);
        chronicle
            .change("space:flip", |ctx| {
                ctx.list_remove(field.clone(), id);
                ctx.list_insert(field.clone(), left, right, value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:flip mutator cannot fail".into()))?;
        Ok(())
    }

    /// Deterministic permutation of placement order within a zone (layout
    /// only — does not move placements between zones).
    pub fn shuffle_zone(chronicle: &mut Chronicle, zone: &str, seed: &str) -> Result<()> {
        if !Self::has_zone(chronicle, zone) {
            return Err(ChronicleError::UnknownZone(zone.to_string()));
        }
        if Self::is_locked(chronicle, zone) {
            return Err(ChronicleError::ZoneLocked(zone.to_string()));
        }
        let field = Self::placements_field(zone);
        let mut values: Vec<Json> = Self::placements(chronicle, &field)
            .iter()
            .map(|p| serde_json::to_value(p).unwrap())
            .collect();
        if values.len() <= 1 {
            return Ok(());
        }
        crate::rng::Rng::from_seed_str(seed).shuffle(&mut values);
        let ids = Self::list_ids(chronicle, &field);
        chronicle
            .change("space:shuffle_zone", |ctx| {
                for id in &ids {
                    ctx.list_remove(field.clone(), *id);
                }
                let mut left = None;
                for value in &values {
                    left = Some(ctx.list_insert(field.clone(), left, None, value.clone()));
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:shuffle_zone mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn clear_zone(chronicle: &mut Chronicle, zone: &str) -> Result<()> {
        if !Self::has_zone(chronicle, zone) {
            return Err(ChronicleError::UnknownZone(zone.to_string()));
        }
        let field = Self::placements_field(zone);
        let ids = Self::list_ids(chronicle, &field);
        chronicle
            .change("space:clear_zone", |ctx| {
                for id in &ids {
                    ctx.list_remove(field.clone(), *id);
                }
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("space:clear_zone mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn cards(chronicle: &Chronicle, zone: &str) -> Vec<Placement> {
        Self::placements(chronicle, &Self::placements_field(zone))
    }

    fn placements(chronicle: &Chronicle, field: &str) -> Vec<Placement> {
        match chronicle.state().field(field) {
            Some(Field::List(list)) => list
                .values()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    fn list_ids(chronicle: &Chronicle, field: &str) -> Vec<PositionId<PeerId>> {
        match chronicle.state().field(field) {
            Some(Field::List(list)) => list.position_ids().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// The position ids immediately before and after `id` in `field`'s
    /// current order, looked up before `id` is removed.
    fn neighbors(
        chronicle: &Chronicle,
        field: &str,
        id: PositionId<PeerId>,
    ) -> (Option<PositionId<PeerId>>, Option<PositionId<PeerId>>) {
        match chronicle.state().field(field) {
            Some(Field::List(list)) => {
                let ids: Vec<PositionId<PeerId>> = list.position_ids().copied().collect();
                match ids.iter().position(|i| *i == id) {
                    Some(index) => (
                        index.checked_sub(1).map(|i| ids[i]),
                        ids.get(index + 1).copied(),
                    ),
                    None => (None, None),
                }
            }
            _ => (None, None),
        }
    }

    fn find(chronicle: &Chronicle, field: &str, placement_id: PlacementId) -> Option<(PositionId<PeerId>, Placement)> {
        match chronicle.state().field(field) {
            Some(Field::List(list)) => list.position_ids().zip(list.values()).find_map(|(id, value)| {
                let placement: Placement = serde_json::from_value(value.clone()).ok()?;
                (placement.placement_id == placement_id).then(|| (*id, placement))
            }),
            _ => None,
        }
    }
}

fn placement_id_bytes(seq: u64) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[8..].copy_from_slice(&seq.to_be_bytes());
    bytes
}
