//! `RoomManager`: the non-networked bookkeeping for room lifecycle —
//! creation, membership, listing and per-peer/total room caps. Kept free
//! of any transport or `Engine` concern so it can be unit tested
//! in isolation; [`crate::server::RoomAuthoritativeServer`] pairs each room
//! with its own `Engine` and connection fan-out.

use std::collections::HashMap;

use chronicle::ids::PeerId;
use chronicle::{ChronicleError, Result};

use crate::room::{Room, RoomCode, RoomConfig};

#[derive(Clone, Debug)]
pub struct ManagerLimits {
    pub max_rooms_per_peer: usize,
    pub max_total_rooms: usize,
}

impl Default for ManagerLimits {
    fn default() -> Self {
        Self { max_rooms_per_peer: 10, max_total_rooms: 10_000 }
    }
}

pub struct RoomManager {
    limits: ManagerLimits,
    rooms: HashMap<RoomCode, Room>,
    owned_by: HashMap<PeerId, usize>,
    rng: rand::rngs::ThreadRng,
}

impl RoomManager {
    pub fn new(limits: ManagerLimits) -> Self {
        Self { limits, rooms: HashMap::new(), owned_by: HashMap::new(), rng: rand::thread_rng() }
    }

    pub fn room(&self, code: &RoomCode) -> Option<&Room> {
        self.rooms.get(code)
    }

    pub fn total_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn list_public(&self) -> Vec<&Room> {
        let mut rooms: Vec<&Room> = self.rooms.values().filter(|r| !r.config.is_private).collect();
        rooms.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        rooms
    }

    /// Creates a room owned by `creator`, enforcing both caps before
    /// drawing a fresh code by rejection sampling until it finds one not
    /// already in the table.
    pub fn create_room(&mut self, creator: PeerId, mut config: RoomConfig, created_at: u64) -> Result<RoomCode> {
        if self.rooms.len() >= self.limits.max_total_rooms {
            return Err(ChronicleError::Rejected("room capacity exhausted".into()));
        }
        let owned = self.owned_by.get(&creator).copied().unwrap_or(0);
        if owned >= self.limits.max_rooms_per_peer {
            return Err(ChronicleError::Rejected("too many rooms owned by this peer".into()));
        }
        if config.max_members == 0 {
            config.max_members = crate::room::DEFAULT_MAX_MEMBERS;
        }

        let code = loop {
            let candidate = RoomCode::generate(&mut self.rng);
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        self.rooms.insert(
            code.clone(),
            Room { id: code.clone(), created_by: creator, created_at, config, members: Vec::new() },
        );
        *self.owned_by.entry(creator).or_insert(0) += 1;
        Ok(code)
    }

    /// Adds `peer` to the room named by `code`. Fails with `RoomFull` or
    /// `InvalidPassword`; an unknown code is rejected generically since the
    /// closed error taxonomy has no dedicated "unknown room" kind (see
    /// DESIGN.md).
    pub fn join_room(&mut self, code: &RoomCode, peer: PeerId, password: Option<&str>) -> Result<&Room> {
        let room = self.rooms.get_mut(code).ok_or_else(|| ChronicleError::Rejected(format!("unknown room {code}")))?;
        if room.members.contains(&peer) {
            return Ok(room);
        }
        if room.is_full() {
            return Err(ChronicleError::RoomFull);
        }
        if !room.check_password(password) {
            return Err(ChronicleError::InvalidPassword);
        }
        room.members.push(peer);
        Ok(room)
    }

    /// Removes `peer` from `code`. Returns `true` if the room was just
    /// deleted (now empty — rooms auto-delete by default).
    pub fn leave_room(&mut self, code: &RoomCode, peer: PeerId) -> bool {
        let Some(room) = self.rooms.get_mut(code) else { return false };
        room.members.retain(|m| *m != peer);
        if room.members.is_empty() {
            let owner = room.created_by;
            self.rooms.remove(code);
            if let Some(count) = self.owned_by.get_mut(&owner) {
                *count = count.saturating_sub(1);
            }
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RoomManager {
        RoomManager::new(ManagerLimits::default())
    }

    #[test]
    fn create_then_join_adds_member() {
        let mut mgr = manager();
        let creator = PeerId::generate();
        let code = mgr.create_room(creator, RoomConfig::default(), 0).unwrap();
        let joiner = PeerId::generate();
        let room = mgr.join_room(&code, joiner, None).unwrap();
        assert_eq!(room.members, vec![joiner]);
    }

    #[test]
    fn join_full_room_fails() {
        let mut mgr = manager();
        let creator = PeerId::generate();
        let config = RoomConfig { max_members: 1, ..Default::default() };
        let code = mgr.create_room(creator, config, 0).unwrap();
        mgr.join_room(&code, PeerId::generate(), None).unwrap();
        let result = mgr.join_room(&code, PeerId::generate(), None);
        assert_eq!(result.err(), Some(ChronicleError::RoomFull));
    }

    #[test]
    fn join_with_wrong_password_fails() {
        let mut mgr = manager();
        let config = RoomConfig { password: Some("sesame".into()), ..Default::default() };
        let code = mgr.create_room(PeerId::generate(), config, 0).unwrap();
        let result = mgr.join_room(&code, PeerId::generate(), Some("nope"));
        assert_eq!(result.err(), Some(ChronicleError::InvalidPassword));
    }

    #[test]
    fn leave_room_deletes_once_empty() {
        let mut mgr = manager();
        let creator = PeerId::generate();
        let code = mgr.create_room(creator, RoomConfig::default(), 0).unwrap();
        mgr.join_room(&code, creator, None).unwrap();
        assert!(mgr.leave_room(&code, creator));
        assert!(mgr.room(&code).is_none());
    }

    #[test]
    fn per_peer_room_cap_is_enforced() {
        let mut mgr = RoomManager::new(ManagerLimits { max_rooms_per_peer: 1, max_total_rooms: 100 });
        let creator = PeerId::generate();
        mgr.create_room(creator, RoomConfig::default(), 0).unwrap();
        let result = mgr.create_room(creator, RoomConfig::default(), 0);
        assert!(result.is_err());
    }

    #[test]
    fn list_public_excludes_private_rooms() {
        let mut mgr = manager();
        let public = mgr.create_room(PeerId::generate(), RoomConfig::default(), 0).unwrap();
        mgr.create_room(PeerId::generate(), RoomConfig { is_private: true, ..Default::default() }, 0).unwrap();
        let listed: Vec<&RoomCode> = mgr.list_public().into_iter().map(|r| &r.id).collect();
        assert_eq!(listed, vec![&public]);
    }
}
