//! The action registry: a name → handler map the [`crate::engine::Engine`]
//! dispatches against.
//!
//! The registry itself stays a thin, dynamically-populated wrapper —
//! callers register their own verbs
//! (`"stack:draw"`, `"agent:transferResource"`, a game's own
//! `"game:playCard"`) at startup. `chronicle` does not ship a closed action
//! enum; the domain collections in [`crate::stack`], [`crate::space`],
//! [`crate::source`] and [`crate::agent`] are the closed primitives a game
//! wires handlers up to.

use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::chronicle::Chronicle;
use crate::error::{ChronicleError, Result};

/// A registered action handler: given the live document and a JSON payload,
/// mutate the document and return a JSON result (or fail without mutating,
/// per `Chronicle::change`'s rollback-on-error contract).
pub type Handler = Arc<dyn Fn(&mut Chronicle, &Json) -> Result<Json> + Send + Sync>;

#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<String, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name` (conventionally `"domain:verb"`),
    /// replacing any handler already registered under that name.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut Chronicle, &Json) -> Result<Json> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn unregister(&mut self, name: &str) {
        self.handlers.remove(name);
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<Handler> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ChronicleError::UnknownAction(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PeerId;

    #[test]
    fn unknown_action_is_reported_by_name() {
        let registry = Registry::new();
        let err = registry.get("nope:verb").unwrap_err();
        assert_eq!(err, ChronicleError::UnknownAction("nope:verb".into()));
    }

    #[test]
    fn registered_handler_runs_and_can_be_replaced() {
        let mut registry = Registry::new();
        registry.register("echo", |_chronicle, payload| Ok(payload.clone()));
        let handler = registry.get("echo").unwrap();
        let mut chronicle = Chronicle::new(PeerId::generate());
        let result = handler(&mut chronicle, &Json::from("hi")).unwrap();
        assert_eq!(result, Json::from("hi"));

        registry.register("echo", |_chronicle, _payload| Ok(Json::from("replaced")));
        let handler = registry.get("echo").unwrap();
        assert_eq!(handler(&mut chronicle, &Json::Null).unwrap(), Json::from("replaced"));
    }
}
