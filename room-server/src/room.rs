//! A `Room`: a named grouping of peers sharing one chronicle `Engine`. Room
//! identity is a human-friendly code drawn from an unambiguous alphabet (no
//! `I`/`O`/`0`/`1`) so it can be read aloud or typed without transcription
//! errors, in the familiar `XXXX-XXXX` shape (e.g. `ABCD-WXYZ`).

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use chronicle::ids::PeerId;

const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const GROUP_LEN: usize = 4;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Draws a fresh random code. Uniqueness against existing rooms is the
    /// caller's job (`RoomManager` rejection-samples until it finds one not
    /// already in its table).
    pub fn generate(rng: &mut impl Rng) -> Self {
        let mut s = String::with_capacity(GROUP_LEN * 2 + 1);
        for group in 0..2 {
            if group > 0 {
                s.push('-');
            }
            for _ in 0..GROUP_LEN {
                let idx = rng.gen_range(0..ALPHABET.len());
                s.push(ALPHABET[idx] as char);
            }
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RoomCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_uppercase()))
    }
}

/// Client-supplied room parameters from `{cmd:"room:create"}`.
#[derive(Clone, Debug, Default)]
pub struct RoomConfig {
    pub variant: Option<String>,
    pub max_members: usize,
    pub password: Option<String>,
    pub is_private: bool,
    pub metadata: Json,
}

pub const DEFAULT_MAX_MEMBERS: usize = 8;

pub struct Room {
    pub id: RoomCode,
    pub created_by: PeerId,
    pub created_at: u64,
    pub config: RoomConfig,
    pub members: Vec<PeerId>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.config.max_members
    }

    pub fn has_password(&self) -> bool {
        self.config.password.is_some()
    }

    pub fn check_password(&self, attempt: Option<&str>) -> bool {
        match &self.config.password {
            None => true,
            Some(expected) => attempt == Some(expected.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_codes_have_the_expected_shape() {
        let mut rng = rand::thread_rng();
        let code = RoomCode::generate(&mut rng);
        let s = code.as_str();
        assert_eq!(s.len(), 9);
        assert_eq!(s.chars().nth(4), Some('-'));
        for c in s.chars().filter(|c| *c != '-') {
            assert!(!"IO01".contains(c), "ambiguous character {c} in generated code");
        }
    }

    #[test]
    fn room_is_full_once_members_reach_the_cap() {
        let room = Room {
            id: RoomCode::from_str("ABCD-EFGH").unwrap(),
            created_by: PeerId::generate(),
            created_at: 0,
            config: RoomConfig { max_members: 1, ..Default::default() },
            members: vec![PeerId::generate()],
        };
        assert!(room.is_full());
    }

    #[test]
    fn password_check_accepts_only_the_configured_value() {
        let room = Room {
            id: RoomCode::from_str("ABCD-EFGH").unwrap(),
            created_by: PeerId::generate(),
            created_at: 0,
            config: RoomConfig { password: Some("sesame".into()), ..Default::default() },
            members: vec![],
        };
        assert!(!room.check_password(None));
        assert!(!room.check_password(Some("wrong")));
        assert!(room.check_password(Some("sesame")));
    }
}
