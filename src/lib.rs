//! # chronicle
//!
//! The replicated game-state substrate and deterministic action pipeline for
//! a distributed multi-agent game simulation engine.
//!
//! Four layers, leaves first:
//!
//! - [`chronicle`] / [`chronicle_crdt`] — the CRDT document each replica owns.
//! - [`token`], [`placement`], [`stack`], [`space`], [`source`], [`agent`] —
//!   domain collections layered over a [`chronicle::Chronicle`].
//! - [`registry`], [`engine`], [`rules`], [`worker`] — the action dispatcher,
//!   its history/event lifecycle, and optional out-of-thread acceleration.
//! - [`consensus`], [`transport`] — peer sync for one document and the
//!   channel abstraction it sends bytes over. The relay, room and overlay
//!   binaries/crates in this workspace build network fabric on top of these.
//!
//! [`snapshot`] and [`bridge`] are cross-cutting: the former is the
//! save/restore wire format shared by the Engine and the authoritative
//! server, the latter is the closed set of types the external ML/RL bridge
//! protocol is made of (this crate does not implement that transport).

pub mod agent;
pub mod bridge;
pub mod chronicle;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod ids;
pub mod placement;
pub mod registry;
pub mod rng;
pub mod rules;
pub mod snapshot;
pub mod source;
pub mod space;
pub mod stack;
pub mod token;
pub mod transport;
pub mod worker;

pub use chronicle::Chronicle;
pub use engine::Engine;
pub use error::{ChronicleError, Result};
pub use ids::{AgentId, PeerId, PlacementId, TokenId};
pub use registry::Registry;
pub use token::Token;
