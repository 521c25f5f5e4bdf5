//! The closed error taxonomy for the chronicle engine.
//!
//! Every fallible operation in this crate returns `Result<T, ChronicleError>`
//! (aliased as [`Result`]). Binaries built on top of this crate (the relay
//! and room servers) wrap these in `anyhow::Error` at their own boundary;
//! the library itself never depends on `anyhow` in its public API.

use thiserror::Error;

/// The complete set of error kinds this engine can surface, grouped by
/// category: input, consistency, concurrency, transport, and the single
/// fatal kind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChronicleError {
    // -- Input --
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("unknown zone: {0}")]
    UnknownZone(String),
    #[error("unknown placement: {0}")]
    UnknownPlacement(String),
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
    #[error("zone locked: {0}")]
    ZoneLocked(String),
    #[error("action rejected: {0}")]
    Rejected(String),
    #[error("room is full")]
    RoomFull,
    #[error("invalid password")]
    InvalidPassword,

    // -- Consistency --
    #[error("stack exhausted")]
    Exhausted,
    #[error("token already placed: {0}")]
    TokenAlreadyPlaced(String),
    #[error("version drift: expected {expected}, found {found}")]
    VersionDrift { expected: u32, found: u32 },
    #[error("corrupt change: {0}")]
    CorruptChange(String),

    // -- Concurrency --
    #[error("policy loop detected past depth {0}")]
    PolicyLoop(usize),
    #[error("worker timed out after {0:?}")]
    WorkerTimeout(std::time::Duration),

    // -- Transport --
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("rate limit exceeded")]
    RateLimit,
    #[error("heartbeat lost for peer: {0}")]
    HeartbeatLost(String),

    // -- Fatal --
    #[error("internal invariant broken: {0}")]
    InternalInvariantBroken(String),
}

impl ChronicleError {
    /// Fatal errors stop the dispatch loop and require external recovery
    /// (snapshot inspection, restart from the last good snapshot); every
    /// other kind is locally recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChronicleError::InternalInvariantBroken(_))
    }
}

pub type Result<T> = std::result::Result<T, ChronicleError>;
