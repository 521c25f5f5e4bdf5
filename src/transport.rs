//! The `send(peerId, bytes)` primitive [`crate::consensus::ConsensusCore`]
//! and application layers build on, expressed per Design Note 4's
//! encouragement to make implicit upgrade/fallback state explicit.
//!
//! A [`PeerChannel`] starts relayed through the Relay server and may
//! negotiate a direct channel; negotiation itself (ICE/WebRTC or an
//! equivalent NAT-traversal handshake) is out of scope for this crate, the
//! same boundary the upstream SDK draws around its own `datachannel`
//! transport — but the upgrade state machine, heartbeat/RTT tracking, and
//! fallback-on-failure are fully implemented here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{ChronicleError, Result};
use crate::ids::PeerId;

/// Where outbound bytes for a peer currently go.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// Routed through the Relay server; the baseline every peer starts in.
    Relayed,
    /// A direct-channel negotiation is in flight (signaling exchanged, not
    /// yet confirmed).
    Upgrading,
    /// A direct channel is live; traffic is rerouted to it.
    Direct,
}

/// A signaling envelope relayed through the server while two peers
/// negotiate a direct channel. The envelope's inner payload is opaque to
/// this crate (an ICE candidate or SDP blob, typically) — only the kind tag
/// and addressing matter here.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SignalingEnvelope {
    pub kind: SignalingKind,
    pub from: PeerId,
    pub to: PeerId,
    pub payload: serde_json::Value,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingKind {
    Offer,
    Answer,
    IceCandidate,
}

/// A primitive able to move bytes to one named peer. `RelayedChannel` is
/// the concrete implementation backed by a Relay connection; tests and
/// embedders may supply their own.
pub trait PeerChannel: Send {
    fn send(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<()>;
}

/// Per-peer bookkeeping the hybrid transport keeps: current channel state,
/// heartbeat timing, and whatever the peer's presence advertised about its
/// own direct-channel capability.
struct PeerLink {
    state: ChannelState,
    last_heartbeat_sent: Option<Instant>,
    last_heartbeat_ack: Option<Instant>,
    rtt: Option<Duration>,
    peer_supports_direct: bool,
}

impl PeerLink {
    fn new() -> Self {
        Self {
            state: ChannelState::Relayed,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            rtt: None,
            peer_supports_direct: false,
        }
    }
}

/// The default threshold beyond which a missed heartbeat is considered a
/// lost connection (`HeartbeatLost`).
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Gives callers a single `send` that may be relayed or direct depending on
/// what has been negotiated for each peer, plus the upgrade/heartbeat
/// machinery that decides which.
pub struct HybridTransport<R: PeerChannel, D: PeerChannel> {
    relayed: R,
    direct: HashMap<PeerId, D>,
    links: HashMap<PeerId, PeerLink>,
    heartbeat_timeout: Duration,
}

impl<R: PeerChannel, D: PeerChannel> HybridTransport<R, D> {
    pub fn new(relayed: R) -> Self {
        Self {
            relayed,
            direct: HashMap::new(),
            links: HashMap::new(),
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    fn link_mut(&mut self, peer: PeerId) -> &mut PeerLink {
        self.links.entry(peer).or_insert_with(PeerLink::new)
    }

    pub fn state_of(&self, peer: PeerId) -> ChannelState {
        self.links.get(&peer).map(|l| l.state).unwrap_or(ChannelState::Relayed)
    }

    /// Records that `peer`'s presence advertised direct-channel capability;
    /// callers consult this before attempting an upgrade.
    pub fn note_direct_capability(&mut self, peer: PeerId, supported: bool) {
        self.link_mut(peer).peer_supports_direct = supported;
    }

    /// Begins a direct-channel negotiation. No-op if already `Direct` or
    /// `Upgrading`, or if the peer never advertised support.
    pub fn begin_upgrade(&mut self, peer: PeerId) -> bool {
        let link = self.link_mut(peer);
        if link.state != ChannelState::Relayed || !link.peer_supports_direct {
            return false;
        }
        link.state = ChannelState::Upgrading;
        true
    }

    /// Completes a negotiation successfully: traffic to `peer` reroutes to
    /// the supplied direct channel.
    pub fn complete_upgrade(&mut self, peer: PeerId, channel: D) {
        self.direct.insert(peer, channel);
        self.link_mut(peer).state = ChannelState::Direct;
    }

    /// Reports a failed negotiation: the peer remains on the relayed
    /// channel, per the contract ("on failure, remain on the relayed
    /// channel").
    pub fn fail_upgrade(&mut self, peer: PeerId) {
        let link = self.link_mut(peer);
        if link.state == ChannelState::Upgrading {
            link.state = ChannelState::Relayed;
        }
    }

    /// Sends to `peer` over whichever channel is currently active. A
    /// failure on a direct channel degrades the link back to relayed and
    /// retries once over the relay, so a failed upgrade attempt falls back
    /// to the relayed channel rather than dropping the message.
    pub fn send(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<()> {
        match self.state_of(peer) {
            ChannelState::Direct => {
                let result = self
                    .direct
                    .get_mut(&peer)
                    .ok_or_else(|| ChronicleError::PeerUnreachable(peer.to_string()))
                    .and_then(|channel| channel.send(peer, bytes.clone()));
                match result {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        self.direct.remove(&peer);
                        self.link_mut(peer).state = ChannelState::Relayed;
                        self.relayed.send(peer, bytes)
                    }
                }
            }
            ChannelState::Relayed | ChannelState::Upgrading => self.relayed.send(peer, bytes),
        }
    }

    /// Marks a heartbeat as sent to `peer`, to be matched by
    /// [`HybridTransport::record_heartbeat_ack`] once the pong arrives.
    pub fn record_heartbeat_sent(&mut self, peer: PeerId, at: Instant) {
        self.link_mut(peer).last_heartbeat_sent = Some(at);
    }

    /// Records a heartbeat ack, computing RTT from the matching sent time.
    pub fn record_heartbeat_ack(&mut self, peer: PeerId, at: Instant) {
        let link = self.link_mut(peer);
        if let Some(sent) = link.last_heartbeat_sent {
            link.rtt = Some(at.saturating_duration_since(sent));
        }
        link.last_heartbeat_ack = Some(at);
    }

    pub fn rtt(&self, peer: PeerId) -> Option<Duration> {
        self.links.get(&peer).and_then(|l| l.rtt)
    }

    /// Evaluates whether `peer` has missed its heartbeat window as of `now`.
    pub fn check_heartbeat(&self, peer: PeerId, now: Instant) -> Result<()> {
        let link = self
            .links
            .get(&peer)
            .ok_or_else(|| ChronicleError::PeerUnreachable(peer.to_string()))?;
        if let Some(sent) = link.last_heartbeat_sent {
            let acked_since = link.last_heartbeat_ack.map(|a| a >= sent).unwrap_or(false);
            if !acked_since && now.saturating_duration_since(sent) > self.heartbeat_timeout {
                return Err(ChronicleError::HeartbeatLost(peer.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingChannel(Arc<Mutex<Vec<(PeerId, Vec<u8>)>>>);

    impl PeerChannel for RecordingChannel {
        fn send(&mut self, peer: PeerId, bytes: Vec<u8>) -> Result<()> {
            self.0.lock().unwrap().push((peer, bytes));
            Ok(())
        }
    }

    struct FailingChannel;
    impl PeerChannel for FailingChannel {
        fn send(&mut self, peer: PeerId, _bytes: Vec<u8>) -> Result<()> {
            Err(ChronicleError::PeerUnreachable(peer.to_string()))
        }
    }

    #[test]
    fn new_peer_defaults_to_relayed() {
        let transport = HybridTransport::<RecordingChannel, RecordingChannel>::new(RecordingChannel::default());
        let peer = PeerId::generate();
        assert_eq!(transport.state_of(peer), ChannelState::Relayed);
    }

    #[test]
    fn upgrade_requires_peer_support() {
        let mut transport = HybridTransport::<RecordingChannel, RecordingChannel>::new(RecordingChannel::default());
        let peer = PeerId::generate();
        assert!(!transport.begin_upgrade(peer));
        transport.note_direct_capability(peer, true);
        assert!(transport.begin_upgrade(peer));
        assert_eq!(transport.state_of(peer), ChannelState::Upgrading);
    }

    #[test]
    fn failed_upgrade_falls_back_to_relayed() {
        let mut transport = HybridTransport::<RecordingChannel, RecordingChannel>::new(RecordingChannel::default());
        let peer = PeerId::generate();
        transport.note_direct_capability(peer, true);
        transport.begin_upgrade(peer);
        transport.fail_upgrade(peer);
        assert_eq!(transport.state_of(peer), ChannelState::Relayed);
    }

    #[test]
    fn completed_upgrade_routes_sends_to_direct_channel() {
        let mut transport = HybridTransport::new(RecordingChannel::default());
        let peer = PeerId::generate();
        let direct = RecordingChannel::default();
        let sink = direct.0.clone();
        transport.note_direct_capability(peer, true);
        transport.begin_upgrade(peer);
        transport.complete_upgrade(peer, direct);
        transport.send(peer, b"hello".to_vec()).unwrap();
        assert_eq!(sink.lock().unwrap().len(), 1);
    }

    #[test]
    fn direct_send_failure_degrades_to_relayed_and_retries() {
        let relayed = RecordingChannel::default();
        let relayed_sink = relayed.0.clone();
        let mut transport: HybridTransport<RecordingChannel, FailingChannel> = HybridTransport::new(relayed);
        let peer = PeerId::generate();
        transport.note_direct_capability(peer, true);
        transport.begin_upgrade(peer);
        transport.complete_upgrade(peer, FailingChannel);
        transport.send(peer, b"hello".to_vec()).unwrap();
        assert_eq!(transport.state_of(peer), ChannelState::Relayed);
        assert_eq!(relayed_sink.lock().unwrap().len(), 1);
    }

    #[test]
    fn heartbeat_ack_computes_rtt() {
        let mut transport = HybridTransport::<RecordingChannel, RecordingChannel>::new(RecordingChannel::default());
        let peer = PeerId::generate();
        let t0 = Instant::now();
        transport.record_heartbeat_sent(peer, t0);
        transport.record_heartbeat_ack(peer, t0 + Duration::from_millis(42));
        assert_eq!(transport.rtt(peer), Some(Duration::from_millis(42)));
    }

    #[test]
    fn missed_heartbeat_past_timeout_reports_lost() {
        let mut transport = HybridTransport::<RecordingChannel, RecordingChannel>::new(RecordingChannel::default())
            .with_heartbeat_timeout(Duration::from_millis(10));
        let peer = PeerId::generate();
        let t0 = Instant::now();
        transport.record_heartbeat_sent(peer, t0);
        let result = transport.check_heartbeat(peer, t0 + Duration::from_millis(50));
        assert_eq!(result, Err(ChronicleError::HeartbeatLost(peer.to_string())));
    }
}
