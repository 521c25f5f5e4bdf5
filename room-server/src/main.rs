//! `chronicle-rooms`: the authoritative/room server — a thin
//! WebSocket front end over [`server::RoomAuthoritativeServer`], which owns
//! one chronicle `Engine` per room and is the single writer of that room's
//! document. Modeled directly on `chronicle-relay`'s binary shape (same
//! `warp` filter layout, same CLI-over-env config pattern) since both
//! processes are single-purpose WebSocket hubs.

mod manager;
mod protocol;
mod rate_limit;
mod room;
mod server;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use chronicle::ids::PeerId;
use chronicle::{Chronicle, Engine};

use manager::ManagerLimits;
use protocol::{Codec, HealthResponse, ReadyResponse, CLOSE_CODE_RATE_LIMIT};
use server::{identity_filter, RoomAuthoritativeServer, ServerConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "chronicle-rooms", about = "Room manager and authoritative server for chronicle engines")]
struct Opts {
    #[arg(long, env = "CHRONICLE_BIND", default_value = "0.0.0.0:9091")]
    bind: SocketAddr,

    #[arg(long, env = "CHRONICLE_BEARER_TOKEN")]
    bearer_token: Option<String>,

    #[arg(long, env = "CHRONICLE_VERBOSE")]
    verbose: bool,

    #[arg(long, env = "CHRONICLE_RATE_LIMIT_N", default_value_t = 100)]
    rate_limit_n: u32,

    #[arg(long, env = "CHRONICLE_RATE_LIMIT_WINDOW_MS", default_value_t = 1000)]
    rate_limit_window_ms: u64,

    #[arg(long, env = "CHRONICLE_MAX_ROOMS_PER_PEER", default_value_t = 10)]
    max_rooms_per_peer: usize,

    #[arg(long, env = "CHRONICLE_MAX_TOTAL_ROOMS", default_value_t = 10_000)]
    max_total_rooms: usize,
}

type SharedServer = Arc<Mutex<RoomAuthoritativeServer>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    log_panics::init();
    let opts = Opts::parse();

    let filter = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = ServerConfig {
        limits: ManagerLimits { max_rooms_per_peer: opts.max_rooms_per_peer, max_total_rooms: opts.max_total_rooms },
        rate_limit_max_messages: opts.rate_limit_n,
        rate_limit_window: Duration::from_millis(opts.rate_limit_window_ms),
    };
    // No concrete game rule set ships with the core; each room gets a bare
    // Engine whose registry a game layer would populate before handing
    // this binary its own `EngineFactory`.
    let engine_factory = Arc::new(|_creator: PeerId| Engine::new(Chronicle::new(PeerId::generate())));
    let rooms: SharedServer = Arc::new(Mutex::new(RoomAuthoritativeServer::new(config, engine_factory, identity_filter())));

    let bearer_token = opts.bearer_token.clone();
    let rooms_filter = warp::any().map({
        let rooms = rooms.clone();
        move || rooms.clone()
    });

    let health = warp::path("health").and(warp::get()).and(rooms_filter.clone()).and_then(health_handler);
    let ready = warp::path("ready").and(warp::get()).and_then(ready_handler);

    let ws_route = warp::path::end()
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(rooms_filter.clone())
        .map(move |ws: warp::ws::Ws, auth: Option<String>, rooms: SharedServer| {
            let token = bearer_token.clone();
            ws.on_upgrade(move |socket| handle_connection(socket, rooms, token, auth))
        });

    let routes = health.or(ready).or(ws_route);

    info!(bind = %opts.bind, "chronicle-rooms listening");
    warp::serve(routes).run(opts.bind).await;
    Ok(())
}

async fn health_handler(rooms: SharedServer) -> Result<impl warp::Reply, Infallible> {
    let rooms = rooms.lock().await;
    Ok(warp::reply::json(&HealthResponse {
        status: "ok",
        uptime_secs: rooms.uptime_secs(),
        connections: rooms.connection_count(),
        rooms: rooms.room_count(),
        protocol: "chronicle-rooms/1",
    }))
}

async fn ready_handler() -> Result<impl warp::Reply, Infallible> {
    Ok(warp::reply::json(&ReadyResponse { ready: true }))
}

fn authorized(expected: &Option<String>, header: &Option<String>) -> bool {
    match expected {
        None => true,
        Some(token) => header.as_deref() == Some(&format!("Bearer {token}")),
    }
}

async fn handle_connection(socket: WebSocket, rooms: SharedServer, bearer_token: Option<String>, auth_header: Option<String>) {
    if !authorized(&bearer_token, &auth_header) {
        let (mut tx, _rx) = socket.split();
        let _ = tx.close().await;
        return;
    }

    let (mut client_tx, mut client_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if client_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let peer = PeerId::generate();
    let mut codec: Option<Codec> = None;

    while let Some(next) = client_rx.next().await {
        let message = match next {
            Ok(m) => m,
            Err(err) => {
                warn!(%peer, %err, "websocket error");
                break;
            }
        };
        if message.is_close() {
            break;
        }
        if message.is_ping() || message.is_pong() {
            continue;
        }

        let this_codec = if message.is_binary() { Codec::Binary } else { Codec::Json };
        if codec.is_none() {
            codec = Some(this_codec);
            rooms.lock().await.connect(peer, this_codec, outbound_tx.clone());
        }

        let command: Option<protocol::ClientCommand> = if message.is_binary() {
            rmp_serde::from_slice(message.as_bytes()).ok()
        } else {
            message.to_str().ok().and_then(|s| serde_json::from_str(s).ok())
        };
        let Some(command) = command else {
            warn!(%peer, "dropping malformed frame");
            continue;
        };

        let mut guard = rooms.lock().await;
        if guard.record_message(peer, Instant::now()) {
            guard.disconnect(peer);
            drop(guard);
            let _ = outbound_tx.send(Message::close_with(CLOSE_CODE_RATE_LIMIT, "rate limit exceeded"));
            return;
        }
        guard.handle(peer, command);
    }

    rooms.lock().await.disconnect(peer);
}
