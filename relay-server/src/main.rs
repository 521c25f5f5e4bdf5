//! `chronicle-relay`: the signaling and broadcast relay — a thin
//! WebSocket hub that lets peers discover each other, exchange WebRTC
//! signaling envelopes, and fall back to relayed delivery when a direct
//! channel can't be established. It holds no chronicle document state of
//! its own; that lives in the room/authoritative server.

mod actor;
mod protocol;
mod rate_limit;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use warp::ws::{Message, WebSocket};
use warp::Filter;

use chronicle::ids::PeerId;

use actor::{shared, HubConfig, SharedHub};
use protocol::{ClientFrame, Codec, HealthResponse, RateLimitInfo, ReadyResponse, CLOSE_CODE_RATE_LIMIT};

/// CLI configuration, layered over environment variables: flag wins, then
/// env var, then the default shown here.
#[derive(Parser, Debug, Clone)]
#[command(name = "chronicle-relay", about = "Signaling and broadcast relay for chronicle peers")]
struct Opts {
    #[arg(long, env = "CHRONICLE_BIND", default_value = "0.0.0.0:9090")]
    bind: SocketAddr,

    /// Optional bearer token; when set, `Authorization: Bearer <token>` is
    /// required on the WebSocket upgrade request.
    #[arg(long, env = "CHRONICLE_BEARER_TOKEN")]
    bearer_token: Option<String>,

    #[arg(long, env = "CHRONICLE_VERBOSE")]
    verbose: bool,

    #[arg(long, env = "CHRONICLE_RATE_LIMIT_N", default_value_t = 40)]
    rate_limit_n: u32,

    #[arg(long, env = "CHRONICLE_RATE_LIMIT_WINDOW_MS", default_value_t = 1000)]
    rate_limit_window_ms: u64,

    #[arg(long, env = "CHRONICLE_MAX_CONNECTIONS", default_value_t = 10_000)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    log_panics::init();
    let opts = Opts::parse();

    let filter = if opts.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let hub = shared(HubConfig {
        max_connections: opts.max_connections,
        rate_limit_max_messages: opts.rate_limit_n,
        rate_limit_window: Duration::from_millis(opts.rate_limit_window_ms),
    });

    let bearer_token = opts.bearer_token.clone();
    let hub_filter = warp::any().map({
        let hub = hub.clone();
        move || hub.clone()
    });

    let health = warp::path("health").and(warp::get()).and(hub_filter.clone()).and_then(health_handler);
    let ready = warp::path("ready").and(warp::get()).and_then(ready_handler);

    let ws_route = warp::path::end()
        .and(warp::ws())
        .and(warp::header::optional::<String>("authorization"))
        .and(hub_filter.clone())
        .map(move |ws: warp::ws::Ws, auth: Option<String>, hub: SharedHub| {
            let token = bearer_token.clone();
            ws.on_upgrade(move |socket| handle_connection(socket, hub, token, auth))
        });

    let routes = health.or(ready).or(ws_route);

    info!(bind = %opts.bind, "chronicle-relay listening");
    warp::serve(routes).run(opts.bind).await;
    Ok(())
}

async fn health_handler(hub: SharedHub) -> Result<impl warp::Reply, Infallible> {
    let hub = hub.lock().await;
    Ok(warp::reply::json(&HealthResponse {
        status: "ok",
        uptime_secs: hub.uptime_secs(),
        connections: hub.connection_count(),
        protocol: "chronicle-relay/1",
        rate_limit: RateLimitInfo {
            max_messages: hub.rate_limit_max_messages(),
            window_ms: hub.rate_limit_window_ms(),
        },
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

async fn handle_connection(socket: WebSocket, hub: SharedHub, bearer_token: Option<String>, auth_header: Option<String>) {
    if !authorized(&bearer_token, &auth_header) {
        let (mut tx, _rx) = socket.split();
        let _ = tx.close().await;
        return;
    }

    {
        let hub_ref = hub.lock().await;
        if hub_ref.is_full() {
            drop(hub_ref);
            let (mut tx, _rx) = socket.split();
            let _ = tx.close().await;
            return;
        }
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
            let mut hub = hub.lock().await;
            let outbound = outbound_tx.clone();
            hub.connect(peer, this_codec, outbound);
            hub.welcome(peer);
        }

        let frame: Option<ClientFrame> = if message.is_binary() {
            rmp_serde::from_slice(message.as_bytes()).ok()
        } else {
            message.to_str().ok().and_then(|s| serde_json::from_str(s).ok())
        };
        let Some(frame) = frame else {
            warn!(%peer, "dropping malformed frame");
            continue;
        };

        let mut hub_guard = hub.lock().await;
        if hub_guard.record_message(peer, Instant::now()) {
            hub_guard.disconnect(peer);
            drop(hub_guard);
            let _ = outbound_tx.send(Message::close_with(CLOSE_CODE_RATE_LIMIT, "rate limit exceeded"));
            return;
        }
        hub_guard.route(peer, frame.target_peer_id, frame.kind, frame.payload);
    }

    hub.lock().await.disconnect(peer);
}
