//! The authoritative/room server wire protocol: `{cmd:...}` frames in both
//! directions. Like the relay, a connection's first inbound frame
//! decides whether it stays on JSON text frames or switches to compact
//! MessagePack for the rest of the session.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use chronicle::engine::HistoryEntry;
use chronicle::ids::PeerId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    Json,
    Binary,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "cmd")]
pub enum ClientCommand {
    #[serde(rename = "room:create")]
    RoomCreate {
        #[serde(default)]
        variant: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(rename = "maxMembers", default)]
        max_members: Option<usize>,
        #[serde(rename = "isPrivate", default)]
        is_private: Option<bool>,
        #[serde(default)]
        metadata: Option<Json>,
    },
    #[serde(rename = "room:join")]
    RoomJoin {
        #[serde(rename = "roomCode")]
        room_code: String,
        #[serde(default)]
        password: Option<String>,
    },
    #[serde(rename = "room:leave")]
    RoomLeave,
    #[serde(rename = "room:list")]
    RoomList,
    #[serde(rename = "dispatch")]
    Dispatch {
        #[serde(rename = "type")]
        action: String,
        #[serde(default)]
        payload: Json,
    },
    #[serde(rename = "describe")]
    Describe,
    #[serde(rename = "history")]
    History {
        #[serde(rename = "fromIndex")]
        from_index: u64,
    },
}

#[derive(Clone, Debug, Serialize)]
pub struct RoomSummary {
    #[serde(rename = "roomCode")]
    pub room_code: String,
    pub variant: Option<String>,
    #[serde(rename = "memberCount")]
    pub member_count: usize,
    #[serde(rename = "maxMembers")]
    pub max_members: usize,
    pub metadata: Json,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "cmd")]
pub enum ServerFrame {
    #[serde(rename = "room:created")]
    RoomCreated {
        #[serde(rename = "roomCode")]
        room_code: String,
    },
    #[serde(rename = "room:error")]
    RoomError { message: String },
    #[serde(rename = "room:joined")]
    RoomJoined {
        #[serde(rename = "roomCode")]
        room_code: String,
        state: Json,
        seq: u64,
    },
    #[serde(rename = "room:left")]
    RoomLeft,
    #[serde(rename = "room:list")]
    RoomList { rooms: Vec<RoomSummary> },
    #[serde(rename = "peer:joined")]
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    #[serde(rename = "peer:left")]
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    #[serde(rename = "state")]
    State { state: Json, seq: u64 },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "history")]
    History { entries: Vec<HistoryEntry> },
}

impl ServerFrame {
    pub fn encode(&self, codec: Codec) -> anyhow::Result<Vec<u8>> {
        match codec {
            Codec::Json => Ok(serde_json::to_vec(self)?),
            Codec::Binary => Ok(rmp_serde::to_vec_named(self)?),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub rooms: usize,
    pub protocol: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

/// Close code sent when a connection exceeds its rate-limit window, shared
/// with the relay's choice since both binaries police the same
/// per-connection window/threshold shape.
pub const CLOSE_CODE_RATE_LIMIT: u16 = 4008;
