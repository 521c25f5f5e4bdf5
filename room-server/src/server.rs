//! `RoomAuthoritativeServer`: the multiplexed authoritative server — one
//! chronicle `Engine` per room, single-writer, broadcasting the post-dispatch
//! state to every member. Held separate from `main.rs`'s
//! WebSocket plumbing the same way the relay's `Hub` is, so the dispatch
//! logic is unit-testable without a socket in sight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use warp::ws::Message;

use chronicle::engine::Engine;
use chronicle::ids::PeerId;

use crate::manager::{ManagerLimits, RoomManager};
use crate::protocol::{ClientCommand, Codec, RoomSummary, ServerFrame};
use crate::rate_limit::SlidingWindow;
use crate::room::{RoomCode, RoomConfig};

/// Produces a fresh `Engine` for a newly created room. The core defines no
/// concrete game; a deployment wires its own action registry and rule
/// engine here before handing this closure to
/// [`RoomAuthoritativeServer::new`].
pub type EngineFactory = Arc<dyn Fn(PeerId) -> Engine + Send + Sync>;

/// Narrows a room's broadcast state per recipient, for hidden-info games
/// that need to hide per-client state from other members. Defaults to the
/// identity function (full visibility), which is what every core action set
/// that does not hide information wants.
pub type StateFilter = Arc<dyn Fn(&serde_json::Value, PeerId) -> serde_json::Value + Send + Sync>;

pub fn identity_filter() -> StateFilter {
    Arc::new(|state, _viewer| state.clone())
}

struct RoomRuntime {
    engine: Engine,
}

struct Connection {
    room: Option<RoomCode>,
    codec: Codec,
    outbound: tokio::sync::mpsc::UnboundedSender<Message>,
    limiter: SlidingWindow,
}

pub struct RoomAuthoritativeServer {
    manager: RoomManager,
    runtimes: HashMap<RoomCode, RoomRuntime>,
    connections: HashMap<PeerId, Connection>,
    engine_factory: EngineFactory,
    state_filter: StateFilter,
    rate_limit_max_messages: u32,
    rate_limit_window: Duration,
    started_at: Instant,
}

pub struct ServerConfig {
    pub limits: ManagerLimits,
    pub rate_limit_max_messages: u32,
    pub rate_limit_window: Duration,
}

impl RoomAuthoritativeServer {
    pub fn new(config: ServerConfig, engine_factory: EngineFactory, state_filter: StateFilter) -> Self {
        Self {
            manager: RoomManager::new(config.limits),
            runtimes: HashMap::new(),
            connections: HashMap::new(),
            engine_factory,
            state_filter,
            rate_limit_max_messages: config.rate_limit_max_messages,
            rate_limit_window: config.rate_limit_window,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.manager.total_rooms()
    }

    pub fn rate_limit_max_messages(&self) -> u32 {
        self.rate_limit_max_messages
    }

    pub fn rate_limit_window_ms(&self) -> u64 {
        self.rate_limit_window.as_millis() as u64
    }

    pub fn connect(&mut self, peer: PeerId, codec: Codec, outbound: tokio::sync::mpsc::UnboundedSender<Message>) {
        self.connections.insert(
            peer,
            Connection {
                room: None,
                codec,
                outbound,
                limiter: SlidingWindow::new(self.rate_limit_max_messages, self.rate_limit_window),
            },
        );
    }

    /// Records one inbound message against `peer`'s rate limiter; `true`
    /// means the caller should close the connection with the rate-limit
    /// close code.
    pub fn record_message(&mut self, peer: PeerId, now: Instant) -> bool {
        match self.connections.get_mut(&peer) {
            Some(conn) => conn.limiter.record(now),
            None => false,
        }
    }

    pub fn disconnect(&mut self, peer: PeerId) {
        let Some(conn) = self.connections.remove(&peer) else { return };
        if let Some(room) = conn.room {
            self.leave_room_internal(peer, &room);
        }
    }

    pub fn handle(&mut self, peer: PeerId, command: ClientCommand) {
        match command {
            ClientCommand::RoomCreate { variant, password, max_members, is_private, metadata } => {
                self.handle_create(peer, variant, password, max_members, is_private, metadata)
            }
            ClientCommand::RoomJoin { room_code, password } => self.handle_join(peer, room_code, password),
            ClientCommand::RoomLeave => self.handle_leave(peer),
            ClientCommand::RoomList => self.handle_list(peer),
            ClientCommand::Dispatch { action, payload } => self.handle_dispatch(peer, action, payload),
            ClientCommand::Describe => self.handle_describe(peer),
            ClientCommand::History { from_index } => self.handle_history(peer, from_index),
        }
    }

    fn handle_create(
        &mut self,
        peer: PeerId,
        variant: Option<String>,
        password: Option<String>,
        max_members: Option<usize>,
        is_private: Option<bool>,
        metadata: Option<serde_json::Value>,
    ) {
        let config = RoomConfig {
            variant,
            max_members: max_members.unwrap_or(0),
            password,
            is_private: is_private.unwrap_or(false),
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        };
        match self.manager.create_room(peer, config, now_ms()) {
            Ok(code) => {
                self.runtimes.insert(code.clone(), RoomRuntime { engine: (self.engine_factory)(peer) });
                info!(%peer, room = %code, "room created");
                self.send(peer, &ServerFrame::RoomCreated { room_code: code.to_string() });
            }
            Err(err) => self.send(peer, &ServerFrame::RoomError { message: err.to_string() }),
        }
    }

    fn handle_join(&mut self, peer: PeerId, room_code: String, password: Option<String>) {
        let code: RoomCode = room_code.parse().unwrap();
        match self.manager.join_room(&code, peer, password.as_deref()) {
            Ok(room) => {
                let members: Vec<PeerId> = room.members.iter().copied().filter(|m| *m != peer).collect();
                if let Some(conn) = self.connections.get_mut(&peer) {
                    conn.room = Some(code.clone());
                }
                let Some(runtime) = self.runtimes.get(&code) else {
                    self.send(peer, &ServerFrame::RoomError { message: "room has no engine".into() });
                    return;
                };
                let state = self.viewer_state(runtime, peer);
                let seq = runtime.engine.seq();
                self.send(peer, &ServerFrame::RoomJoined { room_code: code.to_string(), state, seq });
                for member in members {
                    self.send(member, &ServerFrame::PeerJoined { peer_id: peer });
                }
            }
            Err(err) => self.send(peer, &ServerFrame::RoomError { message: err.to_string() }),
        }
    }

    fn handle_leave(&mut self, peer: PeerId) {
        let Some(room) = self.connections.get(&peer).and_then(|c| c.room.clone()) else {
            self.send(peer, &ServerFrame::RoomError { message: "not in a room".into() });
            return;
        };
        self.leave_room_internal(peer, &room);
        if let Some(conn) = self.connections.get_mut(&peer) {
            conn.room = None;
        }
        self.send(peer, &ServerFrame::RoomLeft);
    }

    fn leave_room_internal(&mut self, peer: PeerId, code: &RoomCode) {
        let remaining: Vec<PeerId> =
            self.manager.room(code).map(|r| r.members.iter().copied().filter(|m| *m != peer).collect()).unwrap_or_default();
        let deleted = self.manager.leave_room(code, peer);
        if deleted {
            self.runtimes.remove(code);
        }
        for member in remaining {
            self.send(member, &ServerFrame::PeerLeft { peer_id: peer });
        }
    }

    fn handle_list(&mut self, peer: PeerId) {
        let rooms: Vec<RoomSummary> = self
            .manager
            .list_public()
            .into_iter()
            .map(|room| RoomSummary {
                room_code: room.id.to_string(),
                variant: room.config.variant.clone(),
                member_count: room.members.len(),
                max_members: room.config.max_members,
                metadata: room.config.metadata.clone(),
            })
            .collect();
        self.send(peer, &ServerFrame::RoomList { rooms });
    }

    fn handle_dispatch(&mut self, peer: PeerId, action: String, payload: serde_json::Value) {
        let Some(code) = self.connections.get(&peer).and_then(|c| c.room.clone()) else {
            self.send(peer, &ServerFrame::Error { message: "not in a room".into() });
            return;
        };
        let Some(runtime) = self.runtimes.get_mut(&code) else {
            self.send(peer, &ServerFrame::Error { message: "room has no engine".into() });
            return;
        };
        match runtime.engine.dispatch(&action, payload) {
            Ok(_) => {
                let members: Vec<PeerId> =
                    self.manager.room(&code).map(|r| r.members.clone()).unwrap_or_default();
                for member in members {
                    let runtime = self.runtimes.get(&code).expect("runtime present during broadcast");
                    let state = self.viewer_state(runtime, member);
                    let seq = runtime.engine.seq();
                    self.send(member, &ServerFrame::State { state, seq });
                }
            }
            Err(err) => {
                warn!(%peer, room = %code, %err, "dispatch rejected");
                self.send(peer, &ServerFrame::Error { message: err.to_string() });
            }
        }
    }

    fn handle_describe(&mut self, peer: PeerId) {
        let Some(code) = self.connections.get(&peer).and_then(|c| c.room.clone()) else {
            self.send(peer, &ServerFrame::Error { message: "not in a room".into() });
            return;
        };
        let Some(runtime) = self.runtimes.get(&code) else { return };
        let state = self.viewer_state(runtime, peer);
        let seq = runtime.engine.seq();
        self.send(peer, &ServerFrame::State { state, seq });
    }

    fn handle_history(&mut self, peer: PeerId, from_index: u64) {
        let Some(code) = self.connections.get(&peer).and_then(|c| c.room.clone()) else {
            self.send(peer, &ServerFrame::Error { message: "not in a room".into() });
            return;
        };
        let Some(runtime) = self.runtimes.get(&code) else { return };
        let entries = runtime
            .engine
            .history()
            .iter()
            .filter(|entry| entry.seq >= from_index)
            .cloned()
            .collect();
        self.send(peer, &ServerFrame::History { entries });
    }

    fn viewer_state(&self, runtime: &RoomRuntime, viewer: PeerId) -> serde_json::Value {
        let full = serde_json::to_value(runtime.engine.chronicle().state()).unwrap_or(serde_json::Value::Null);
        (self.state_filter)(&full, viewer)
    }

    fn send(&self, peer: PeerId, frame: &ServerFrame) {
        let Some(conn) = self.connections.get(&peer) else { return };
        match frame.encode(conn.codec) {
            Ok(bytes) => {
                let message = match conn.codec {
                    Codec::Json => Message::text(String::from_utf8(bytes).unwrap_or_default()),
                    Codec::Binary => Message::binary(bytes),
                };
                let _ = conn.outbound.send(message);
            }
            Err(err) => warn!(%peer, %err, "failed to encode server frame"),
        }
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle::Chronicle;

    fn engine_factory() -> EngineFactory {
        Arc::new(|_creator| Engine::new(Chronicle::new(PeerId::generate())))
    }

    fn server() -> RoomAuthoritativeServer {
        RoomAuthoritativeServer::new(
            ServerConfig {
                limits: ManagerLimits::default(),
                rate_limit_max_messages: 100,
                rate_limit_window: Duration::from_millis(1000),
            },
            engine_factory(),
            identity_filter(),
        )
    }

    fn connect(server: &mut RoomAuthoritativeServer, peer: PeerId) -> tokio::sync::mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        server.connect(peer, Codec::Json, tx);
        rx
    }

    fn recv_frame(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let message = rx.try_recv().expect("expected a frame");
        serde_json::from_str(message.to_str().unwrap()).unwrap()
    }

    #[test]
    fn create_then_join_then_dispatch_broadcasts_state() {
        let mut server = server();
        let owner = PeerId::generate();
        let mut owner_rx = connect(&mut server, owner);
        server.handle(owner, ClientCommand::RoomCreate {
            variant: None,
            password: None,
            max_members: None,
            is_private: None,
            metadata: None,
        });
        let created = recv_frame(&mut owner_rx);
        let room_code = created["roomCode"].as_str().unwrap().to_string();

        server.handle(owner, ClientCommand::RoomJoin { room_code: room_code.clone(), password: None });
        let joined = recv_frame(&mut owner_rx);
        assert_eq!(joined["cmd"], "room:joined");

        let other = PeerId::generate();
        let mut other_rx = connect(&mut server, other);
        server.handle(other, ClientCommand::RoomJoin { room_code: room_code.clone(), password: None });
        recv_frame(&mut other_rx); // room:joined
        let notified = recv_frame(&mut owner_rx);
        assert_eq!(notified["cmd"], "peer:joined");

        server.handle(owner, ClientCommand::Dispatch { action: "noop".into(), payload: serde_json::Value::Null });
        let owner_error = recv_frame(&mut owner_rx);
        assert_eq!(owner_error["cmd"], "error");
    }

    #[test]
    fn dispatch_outside_a_room_is_rejected() {
        let mut server = server();
        let peer = PeerId::generate();
        let mut rx = connect(&mut server, peer);
        server.handle(peer, ClientCommand::Dispatch { action: "noop".into(), payload: serde_json::Value::Null });
        let frame = recv_frame(&mut rx);
        assert_eq!(frame["cmd"], "error");
    }

    #[test]
    fn history_returns_entries_from_the_requested_index() {
        let mut server = server();
        let peer = PeerId::generate();
        let mut rx = connect(&mut server, peer);
        server.handle(peer, ClientCommand::RoomCreate {
            variant: None,
            password: None,
            max_members: None,
            is_private: None,
            metadata: None,
        });
        let created = recv_frame(&mut rx);
        let room_code = created["roomCode"].as_str().unwrap().to_string();
        server.handle(peer, ClientCommand::RoomJoin { room_code: room_code.clone(), password: None });
        recv_frame(&mut rx);
        server.handle(peer, ClientCommand::History { from_index: 0 });
        let history = recv_frame(&mut rx);
        assert_eq!(history["cmd"], "history");
        assert_eq!(history["entries"].as_array().unwrap().len(), 0);
    }
}
