//! The relay's central `Hub`: a single-owner store of connected clients,
//! serialized behind a `tokio::sync::Mutex` so every connect/disconnect/
//! message event is handled one at a time. Every
//! client here already holds a direct WebSocket connection to this
//! process, so fan-out is a plain O(N) broadcast over that connection set
//! — there is no multi-hop routing problem for a relay to solve, unlike
//! the peer-to-peer overlay strategies in the `chronicle-overlay` crate,
//! which exist for the engine's own peer mesh rather than this star hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use warp::ws::Message;

use chronicle::ids::PeerId;

use crate::protocol::{Codec, ServerFrame};
use crate::rate_limit::SlidingWindow;

struct ClientHandle {
    codec: Codec,
    outbound: mpsc::UnboundedSender<Message>,
    limiter: SlidingWindow,
}

#[derive(Clone)]
pub struct HubConfig {
    pub max_connections: usize,
    pub rate_limit_max_messages: u32,
    pub rate_limit_window: Duration,
}

pub struct Hub {
    config: HubConfig,
    clients: HashMap<PeerId, ClientHandle>,
    started_at: Instant,
}

pub type SharedHub = Arc<Mutex<Hub>>;

pub fn shared(config: HubConfig) -> SharedHub {
    Arc::new(Mutex::new(Hub { config, clients: HashMap::new(), started_at: Instant::now() }))
}

impl Hub {
    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.config.max_connections
    }

    pub fn rate_limit_max_messages(&self) -> u32 {
        self.config.rate_limit_max_messages
    }

    pub fn rate_limit_window_ms(&self) -> u64 {
        self.config.rate_limit_window.as_millis() as u64
    }

    /// Registers a newly-connected peer, tells the existing clients about
    /// it (`peer:joined`), and returns the current roster so the caller
    /// can send the newcomer its own `welcome` frame.
    pub fn connect(&mut self, peer: PeerId, codec: Codec, outbound: mpsc::UnboundedSender<Message>) -> Vec<PeerId> {
        let existing: Vec<PeerId> = self.clients.keys().copied().collect();
        self.clients.insert(
            peer,
            ClientHandle {
                codec,
                outbound,
                limiter: SlidingWindow::new(self.config.rate_limit_max_messages, self.config.rate_limit_window),
            },
        );
        info!(%peer, connections = self.clients.len(), "peer connected");
        self.broadcast_frame(peer, &ServerFrame::PeerJoined { peer_id: peer });
        existing
    }

    pub fn disconnect(&mut self, peer: PeerId) {
        if self.clients.remove(&peer).is_some() {
            info!(%peer, connections = self.clients.len(), "peer disconnected");
            self.broadcast_frame(peer, &ServerFrame::PeerLeft { peer_id: peer });
        }
    }

    /// Records one inbound message against `peer`'s rate limiter; `true`
    /// means the connection just tripped its limit and should be closed
    /// with [`crate::protocol::CLOSE_CODE_RATE_LIMIT`].
    pub fn record_message(&mut self, peer: PeerId, now: Instant) -> bool {
        match self.clients.get_mut(&peer) {
            Some(handle) => handle.limiter.record(now),
            None => false,
        }
    }

    /// Routes one relayed frame: to a single target if `target` names a
    /// connected peer, to every other client otherwise. The relay never
    /// interprets the envelope's contents — it only ever forwards
    /// `kind`/`payload` with the sender's id attached.
    pub fn route(&mut self, from: PeerId, target: Option<PeerId>, kind: String, payload: serde_json::Value) {
        let frame = ServerFrame::Relayed { from, kind, payload };
        match target {
            Some(target) => self.send_frame(target, &frame),
            None => self.broadcast_frame(from, &frame),
        }
    }

    pub fn welcome(&mut self, peer: PeerId) {
        let frame = ServerFrame::Welcome { peer_id: peer, client_count: self.clients.len() };
        self.send_frame(peer, &frame);
    }

    fn broadcast_frame(&mut self, exclude: PeerId, frame: &ServerFrame) {
        let targets: Vec<PeerId> = self.clients.keys().copied().filter(|p| *p != exclude).collect();
        for peer in targets {
            self.send_frame(peer, frame);
        }
    }

    fn send_frame(&mut self, peer: PeerId, frame: &ServerFrame) {
        let Some(handle) = self.clients.get(&peer) else { return };
        match frame.encode(handle.codec) {
            Ok(bytes) => {
                let message = match handle.codec {
                    Codec::Json => Message::text(String::from_utf8(bytes).unwrap_or_default()),
                    Codec::Binary => Message::binary(bytes),
                };
                if handle.outbound.send(message).is_err() {
                    debug!(%peer, "dropped frame: outbound channel closed");
                }
            }
            Err(err) => warn!(%peer, %err, "failed to encode relayed frame"),
        }
    }
}
