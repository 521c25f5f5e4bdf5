//! The Engine: the deterministic dispatch pipeline wrapped around a
//! [`Chronicle`] and its registered actions, policies and rules.
//!
//! The dispatch contract, in order: resolve the handler (`UnknownAction` if
//! missing) → run `beforeDispatch` guards (any rejection short-circuits,
//! mutating nothing) → invoke the handler → on failure, log `engine:error`
//! and rethrow without recording history → on success, append a
//! monotonically-numbered history entry and log `engine:action` → run
//! policies, dispatching any follow-up action they request under a depth
//! guard (`PolicyLoop` past `max_policy_depth`) → run rules in priority
//! order, logging `rule:error` for any effect failure without rolling back
//! the action that triggered it → return the handler's result.
//!
//! A fatal error (`ChronicleError::is_fatal`) halts the engine: the error is
//! latched and every subsequent `dispatch` returns it immediately without
//! touching the registry, history, or chronicle, until the engine is
//! replaced wholesale via `Engine::restore`.

use serde_json::Value as Json;

use crate::chronicle::Chronicle;
use crate::error::{ChronicleError, Result};
use crate::registry::Registry;
use crate::rules::{ActionContext, RuleEngine};

/// A policy-triggered follow-up is only ever allowed to recurse this many
/// times before the engine assumes it has found a loop.
pub const DEFAULT_MAX_POLICY_DEPTH: usize = 8;

type Guard = Box<dyn Fn(&str, &Json, &Chronicle) -> Result<()> + Send + Sync>;

/// One committed dispatch, kept for resync (`{cmd:"history", fromIndex}`)
/// and for the save/restore snapshot format.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub action: String,
    pub payload: Json,
    pub result: Json,
    pub timestamp_ms: u64,
}

pub struct Engine {
    chronicle: Chronicle,
    registry: Registry,
    rule_engine: RuleEngine,
    before_dispatch: Vec<Guard>,
    history: Vec<HistoryEntry>,
    seq: u64,
    max_policy_depth: usize,
    halted: Option<ChronicleError>,
}

impl Engine {
    pub fn new(chronicle: Chronicle) -> Self {
        Self {
            chronicle,
            registry: Registry::new(),
            rule_engine: RuleEngine::new(),
            before_dispatch: Vec::new(),
            history: Vec::new(),
            seq: 0,
            max_policy_depth: DEFAULT_MAX_POLICY_DEPTH,
            halted: None,
        }
    }

    pub fn with_max_policy_depth(mut self, depth: usize) -> Self {
        self.max_policy_depth = depth;
        self
    }

    pub fn chronicle(&self) -> &Chronicle {
        &self.chronicle
    }

    pub fn chronicle_mut(&mut self) -> &mut Chronicle {
        &mut self.chronicle
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn rule_engine_mut(&mut self) -> &mut RuleEngine {
        &mut self.rule_engine
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// `Some` once a fatal error has halted the dispatch loop: invariant
    /// violations require external intervention rather than continued
    /// dispatch. Clears only via [`Engine::restore`].
    pub fn halted(&self) -> Option<&ChronicleError> {
        self.halted.as_ref()
    }

    /// Registers a guard run before every dispatch, after the handler is
    /// resolved but before it runs. A guard returning `Err` rejects the
    /// action without mutating the document — this is where an
    /// authoritative server plugs in turn-order or permission checks.
    pub fn add_before_dispatch<F>(&mut self, guard: F)
    where
        F: Fn(&str, &Json, &Chronicle) -> Result<()> + Send + Sync + 'static,
    {
        self.before_dispatch.push(Box::new(guard));
    }

    /// Runs one action through the full dispatch contract described above.
    pub fn dispatch(&mut self, action: &str, payload: Json) -> Result<Json> {
        self.dispatch_at_depth(action, payload, 0)
    }

    fn dispatch_at_depth(&mut self, action: &str, payload: Json, depth: usize) -> Result<Json> {
        if let Some(halted) = &self.halted {
            return Err(halted.clone());
        }

        match self.dispatch_inner(action, payload, depth) {
            Ok(result) => Ok(result),
            Err(err) => {
                if err.is_fatal() {
                    tracing::error!(target: "chronicle::engine", action, error = %err, "engine:halted");
                    self.halted = Some(err.clone());
                }
                Err(err)
            }
        }
    }

    fn dispatch_inner(&mut self, action: &str, payload: Json, depth: usize) -> Result<Json> {
        let handler = self.registry.get(action)?;
        for guard in &self.before_dispatch {
            guard(action, &payload, &self.chronicle)?;
        }

        let result = match handler(&mut self.chronicle, &payload) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(target: "chronicle::engine", action, error = %err, "engine:error");
                return Err(err);
            }
        };

        self.seq += 1;
        let seq = self.seq;
        self.history.push(HistoryEntry {
            seq,
            action: action.to_string(),
            payload: payload.clone(),
            result: result.clone(),
            timestamp_ms: now_ms(),
        });
        tracing::info!(target: "chronicle::engine", seq, action, "engine:action");

        let ctx = ActionContext {
            seq,
            action: action.to_string(),
            payload,
            result: result.clone(),
        };
        self.run_policies(&ctx, depth)?;
        self.run_rules(&ctx);

        Ok(result)
    }

    fn run_policies(&mut self, ctx: &ActionContext, depth: usize) -> Result<()> {
        if depth >= self.max_policy_depth {
            return Err(ChronicleError::PolicyLoop(depth));
        }
        let follow_ups = self.rule_engine.run_policies(&mut self.chronicle, ctx)?;
        for (name, payload) in follow_ups {
            self.dispatch_at_depth(&name, payload, depth + 1)?;
        }
        Ok(())
    }

    fn run_rules(&mut self, ctx: &ActionContext) {
        for (rule, error) in self.rule_engine.run_rules(&mut self.chronicle, ctx) {
            tracing::warn!(target: "chronicle::engine", rule, error, "rule:error");
        }
    }

    /// Serializes the full snapshot (document + history tail + seq) per
    /// [`crate::snapshot`]'s format.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        crate::snapshot::Snapshot::capture(&self.chronicle, &self.history, self.seq)?.encode()
    }

    /// Rebuilds an `Engine` from a snapshot. `registry` and `rule_engine`
    /// are supplied fresh by the caller since handlers/policies/rules are
    /// runtime closures and are never part of the serialized state.
    pub fn restore(
        replica_id: crate::ids::PeerId,
        bytes: &[u8],
        registry: Registry,
        rule_engine: RuleEngine,
    ) -> Result<Self> {
        let snapshot = crate::snapshot::Snapshot::decode(bytes)?;
        let chronicle = snapshot.into_chronicle(replica_id)?;
        let seq = snapshot.seq;
        let history = snapshot.history_tail;
        Ok(Self {
            chronicle,
            registry,
            rule_engine,
            before_dispatch: Vec::new(),
            history,
            seq,
            max_policy_depth: DEFAULT_MAX_POLICY_DEPTH,
            halted: None,
        })
    }
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PeerId;
    use crate::rules::{Policy, Rule};

    fn engine() -> Engine {
        Engine::new(Chronicle::new(PeerId::generate()))
    }

    #[test]
    fn dispatch_unknown_action_fails_without_history() {
        let mut engine = engine();
        let result = engine.dispatch("nope:verb", Json::Null);
        assert_eq!(result, Err(ChronicleError::UnknownAction("nope:verb".into())));
        assert!(engine.history().is_empty());
    }

    #[test]
    fn before_dispatch_guard_can_reject() {
        let mut engine = engine();
        engine.registry_mut().register("noop", |_chronicle, _payload| Ok(Json::Null));
        engine.add_before_dispatch(|_action, _payload, _chronicle| Err(ChronicleError::Rejected("not your turn".into())));
        let result = engine.dispatch("noop", Json::Null);
        assert_eq!(result, Err(ChronicleError::Rejected("not your turn".into())));
        assert!(engine.history().is_empty());
    }

    #[test]
    fn successful_dispatch_appends_monotonic_history() {
        let mut engine = engine();
        engine.registry_mut().register("noop", |_chronicle, payload| Ok(payload.clone()));
        engine.dispatch("noop", Json::from(1)).unwrap();
        engine.dispatch("noop", Json::from(2)).unwrap();
        let seqs: Vec<u64> = engine.history().iter().map(|h| h.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn policy_follow_up_dispatches_and_runs_again() {
        let mut engine = engine();
        engine.registry_mut().register("a", |_chronicle, _payload| Ok(Json::from("a")));
        engine.registry_mut().register("b", |_chronicle, _payload| Ok(Json::from("b")));
        engine.rule_engine_mut().add_policy(Policy::new("chain_once", |_chronicle, ctx| {
            if ctx.action == "a" {
                Ok(Some(("b".to_string(), Json::Null)))
            } else {
                Ok(None)
            }
        }));
        engine.dispatch("a", Json::Null).unwrap();
        let actions: Vec<&str> = engine.history().iter().map(|h| h.action.as_str()).collect();
        assert_eq!(actions, vec!["a", "b"]);
    }

    #[test]
    fn policy_loop_is_bounded_by_max_depth() {
        let mut engine = engine().with_max_policy_depth(3);
        engine.registry_mut().register("loop", |_chronicle, _payload| Ok(Json::Null));
        engine.rule_engine_mut().add_policy(Policy::new("forever", |_chronicle, _ctx| {
            Ok(Some(("loop".to_string(), Json::Null)))
        }));
        let result = engine.dispatch("loop", Json::Null);
        assert!(matches!(result, Err(ChronicleError::PolicyLoop(_))));
    }

    #[test]
    fn rule_effect_failure_does_not_roll_back_the_action() {
        let mut engine = engine();
        engine.registry_mut().register("noop", |_chronicle, _payload| Ok(Json::Null));
        engine.rule_engine_mut().add_rule(Rule::new(
            "always_fails",
            0,
            false,
            |_chronicle, _ctx| true,
            |_chronicle, _ctx| Err(ChronicleError::Rejected("rule blew up".into())),
        ));
        let result = engine.dispatch("noop", Json::Null);
        assert!(result.is_ok());
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn a_fatal_handler_error_halts_all_future_dispatches() {
        let mut engine = engine();
        engine.registry_mut().register("noop", |_chronicle, _payload| Ok(Json::Null));
        engine.registry_mut().register("blow_up", |_chronicle, _payload| {
            Err(ChronicleError::InternalInvariantBroken("document corrupt".into()))
        });

        let first = engine.dispatch("blow_up", Json::Null);
        assert_eq!(first, Err(ChronicleError::InternalInvariantBroken("document corrupt".into())));
        assert!(engine.halted().is_some());

        let second = engine.dispatch("noop", Json::Null);
        assert_eq!(second, Err(ChronicleError::InternalInvariantBroken("document corrupt".into())));
        assert!(engine.history().is_empty());
    }
}
