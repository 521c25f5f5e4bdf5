//! The relay's wire protocol: JSON/binary frame shapes for the external
//! WebSocket surface, plus the codec negotiation rule ("a client's first
//! inbound frame determines its mode for all subsequent outbound frames").

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use chronicle::ids::PeerId;

/// Which wire format a connection has settled on, decided by its first
/// inbound frame: a WebSocket text frame means JSON, a binary frame means
/// compact MessagePack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Codec {
    Json,
    Binary,
}

/// A frame sent by a client: an arbitrary application event (including the
/// signaling envelopes) the relay does not interpret beyond `targetPeerId`
/// routing.
#[derive(Clone, Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Json,
    #[serde(rename = "targetPeerId", default)]
    pub target_peer_id: Option<PeerId>,
}

/// Every frame the relay itself originates. `Relayed` wraps a forwarded
/// client frame with the sender's id attached, so the recipient can tell
/// who it came from — an addressing detail every broadcast relay needs in
/// practice, on top of the plain client-to-client payload shape.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "welcome")]
    Welcome { #[serde(rename = "peerId")] peer_id: PeerId, #[serde(rename = "clientCount")] client_count: usize },
    #[serde(rename = "peer:joined")]
    PeerJoined { #[serde(rename = "peerId")] peer_id: PeerId },
    #[serde(rename = "peer:left")]
    PeerLeft { #[serde(rename = "peerId")] peer_id: PeerId },
    #[serde(rename = "relayed")]
    Relayed {
        from: PeerId,
        #[serde(rename = "type")]
        kind: String,
        payload: Json,
    },
}

impl ServerFrame {
    pub fn encode(&self, codec: Codec) -> anyhow::Result<Vec<u8>> {
        match codec {
            Codec::Json => Ok(serde_json::to_vec(self)?),
            Codec::Binary => Ok(rmp_serde::to_vec_named(self)?),
        }
    }
}

/// Health/readiness payloads for the `GET /health` and `GET /ready` HTTP
/// surface.
#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub protocol: &'static str,
    pub rate_limit: RateLimitInfo,
}

#[derive(Clone, Debug, Serialize)]
pub struct RateLimitInfo {
    pub max_messages: u32,
    pub window_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
}

/// Close code sent when a connection exceeds its rate-limit window.
/// WebSocket close codes below 4000 are reserved by the protocol; 4008 sits
/// in the application-private range.
pub const CLOSE_CODE_RATE_LIMIT: u16 = 4008;
