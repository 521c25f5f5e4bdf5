//! Agent: a named participant owning resources and a hand of tokens.
//!
//! Resources must never go negative through public operations. Every
//! operation here that debits a resource validates sufficiency first and
//! fails atomically rather than clamping at zero, and transfers between two
//! agents are atomic: either both sides settle or neither does.

use serde_json::Value as Json;
use std::collections::BTreeSet;

use chronicle_crdt::Field;

use crate::chronicle::Chronicle;
use crate::error::{ChronicleError, Result};
use crate::ids::{AgentId, TokenId};
use crate::token::Token;

const AGENTS_FIELD: &str = "agent:_ids";

/// One side of a two-party [`Agent::trade`]: at most one resource debit and
/// at most one token hand-off.
#[derive(Clone, Debug, Default)]
pub struct TradeOffer {
    pub resource: Option<(String, i64)>,
    pub token: Option<TokenId>,
}

/// A participant identified by [`AgentId`]; fields live under
/// `agent:<id>:*` plus membership in the shared `agent:_ids` set.
#[derive(Clone, Debug)]
pub struct Agent {
    id: AgentId,
}

impl Agent {
    fn field(&self, suffix: &str) -> String {
        format!("agent:{}:{}", self.id, suffix)
    }

    fn resource_field(&self, resource: &str) -> String {
        format!("agent:{}:resource:{}", self.id, resource)
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    fn exists(chronicle: &Chronicle, id: &AgentId) -> bool {
        match chronicle.state().field(AGENTS_FIELD) {
            Some(Field::Set(set)) => set.iter().any(|v| v.as_str() == Some(id.as_str())),
            _ => false,
        }
    }

    /// Registers a new agent. Fails if `id` is already registered. Keys by
    /// id rather than name so renaming an agent later (not currently
    /// exposed, but plausible) would never break references held by
    /// placements or history entries.
    pub fn create(chronicle: &mut Chronicle, id: AgentId, name: impl Into<String>) -> Result<Self> {
        if Self::exists(chronicle, &id) {
            return Err(ChronicleError::InvalidMutation(format!("agent already exists: {id}")));
        }
        let agent = Self { id };
        let id_value = Json::from(agent.id.as_str());
        let name_field = agent.field("name");
        let name_value = Json::from(name.into());
        let active_field = agent.field("active");
        chronicle
            .change("agent:create", |ctx| {
                ctx.set_add(AGENTS_FIELD, id_value.clone());
                ctx.set(name_field.clone(), name_value.clone());
                ctx.set(active_field.clone(), Json::from(true));
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:create mutator cannot fail".into()))?;
        Ok(agent)
    }

    pub fn from_id(id: AgentId) -> Self {
        Self { id }
    }

    pub fn remove(&self, chronicle: &mut Chronicle) -> Result<()> {
        if !Self::exists(chronicle, &self.id) {
            return Err(ChronicleError::InvalidMutation(format!("unknown agent: {}", self.id)));
        }
        let id_value = Json::from(self.id.as_str());
        chronicle
            .change("agent:remove", |ctx| {
                ctx.set_remove(AGENTS_FIELD, id_value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:remove mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn name(&self, chronicle: &Chronicle) -> String {
        match chronicle.state().field(&self.field("name")) {
            Some(Field::Register(r)) => r.get().as_str().unwrap_or_default().to_string(),
            _ => String::new(),
        }
    }

    pub fn is_active(&self, chronicle: &Chronicle) -> bool {
        match chronicle.state().field(&self.field("active")) {
            Some(Field::Register(r)) => r.get().as_bool().unwrap_or(false),
            _ => false,
        }
    }

    pub fn set_active(&self, chronicle: &mut Chronicle, active: bool) -> Result<()> {
        let field = self.field("active");
        chronicle
            .change("agent:set_active", |ctx| {
                ctx.set(field.clone(), Json::from(active));
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:set_active mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn resource(&self, chronicle: &Chronicle, resource: &str) -> i64 {
        match chronicle.state().field(&self.resource_field(resource)) {
            Some(Field::Counter(c)) => c.value(),
            _ => 0,
        }
    }

    pub fn give_resource(&self, chronicle: &mut Chronicle, resource: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(ChronicleError::InvalidMutation("amount must be non-negative".into()));
        }
        let field = self.resource_field(resource);
        chronicle
            .change("agent:give_resource", |ctx| {
                ctx.counter_add(field.clone(), amount);
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:give_resource mutator cannot fail".into()))?;
        Ok(())
    }

    /// Debits `amount` from `resource`, failing without mutating anything if
    /// the agent does not hold enough.
    pub fn take_resource(&self, chronicle: &mut Chronicle, resource: &str, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(ChronicleError::InvalidMutation("amount must be non-negative".into()));
        }
        let available = self.resource(chronicle, resource);
        if available < amount {
            return Err(ChronicleError::Rejected(format!(
                "agent {} holds {available} of {resource}, cannot take {amount}"
            )));
        }
        let field = self.resource_field(resource);
        chronicle
            .change("agent:take_resource", |ctx| {
                ctx.counter_add(field.clone(), -amount);
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:take_resource mutator cannot fail".into()))?;
        Ok(())
    }

    fn hand_entries(&self, chronicle: &Chronicle) -> Vec<Token> {
        match chronicle.state().field(&self.field("hand")) {
            Some(Field::List(list)) => list
                .values()
                .filter_map(|v| serde_json::from_value(v.clone()).ok())
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn hand(&self, chronicle: &Chronicle) -> Vec<Token> {
        self.hand_entries(chronicle)
    }

    pub fn has_token(&self, chronicle: &Chronicle, token_id: &TokenId) -> bool {
        self.hand_entries(chronicle).iter().any(|t| &t.id == token_id)
    }

    pub fn add_token(&self, chronicle: &mut Chronicle, token: &Token) -> Result<()> {
        let field = self.field("hand");
        let value = serde_json::to_value(token).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        chronicle
            .change("agent:add_token", |ctx| {
                let left = match ctx.field(&field) {
                    Some(Field::List(list)) => list.last_id().copied(),
                    _ => None,
                };
                ctx.list_insert(field.clone(), left, None, value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:add_token mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn remove_token(&self, chronicle: &mut Chronicle, token_id: &TokenId) -> Result<Token> {
        let field = self.field("hand");
        let found = match chronicle.state().field(&field) {
            Some(Field::List(list)) => list
                .position_ids()
                .zip(list.values())
                .find_map(|(id, v)| {
                    let token: Token = serde_json::from_value(v.clone()).ok()?;
                    (&token.id == token_id).then_some((*id, token))
                }),
            _ => None,
        };
        let (id, token) = found.ok_or_else(|| ChronicleError::UnknownPlacement(token_id.to_string()))?;
        chronicle
            .change("agent:remove_token", |ctx| {
                ctx.list_remove(field.clone(), id);
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("agent:remove_token mutator cannot fail".into()))?;
        Ok(token)
    }

    /// Moves `amount` of `resource` from `self` to `other`, atomically —
    /// either both the debit and credit happen or neither does, since
    /// `take_resource` itself refuses to go negative before any mutation
    /// happens.
    pub fn transfer_resource(&self, chronicle: &mut Chronicle, other: &Agent, resource: &str, amount: i64) -> Result<()> {
        self.take_resource(chronicle, resource, amount)?;
        other.give_resource(chronicle, resource, amount)
    }

    pub fn transfer_token(&self, chronicle: &mut Chronicle, other: &Agent, token_id: &TokenId) -> Result<()> {
        let token = self.remove_token(chronicle, token_id)?;
        other.add_token(chronicle, &token)
    }

    /// Takes `min(available, amount)` of `resource` from `self` and gives it
    /// to `other`, failing only if nothing could be taken at all.
    pub fn steal_resource(&self, chronicle: &mut Chronicle, other: &Agent, resource: &str, amount: i64) -> Result<i64> {
        let available = self.resource(chronicle, resource);
        let stolen = available.min(amount.max(0));
        if stolen == 0 {
            return Err(ChronicleError::Rejected(format!("agent {} holds no {resource} to steal", self.id)));
        }
        self.take_resource(chronicle, resource, stolen)?;
        other.give_resource(chronicle, resource, stolen)?;
        Ok(stolen)
    }

    pub fn steal_token(&self, chronicle: &mut Chronicle, other: &Agent, token_id: &TokenId) -> Result<()> {
        self.transfer_token(chronicle, other, token_id)
    }

    /// Validates both sides of a trade before executing either — a trade
    /// never leaves one agent paid and the other unpaid.
    pub fn trade(chronicle: &mut Chronicle, a: &Agent, offer_a: &TradeOffer, b: &Agent, offer_b: &TradeOffer) -> Result<()> {
        if let Some((resource, amount)) = &offer_a.resource {
            if a.resource(chronicle, resource) < *amount {
                return Err(ChronicleError::Rejected(format!("agent {} cannot cover trade offer", a.id)));
            }
        }
        if let Some(token_id) = &offer_a.token {
            if !a.has_token(chronicle, token_id) {
                return Err(ChronicleError::UnknownPlacement(token_id.to_string()));
            }
        }
        if let Some((resource, amount)) = &offer_b.resource {
            if b.resource(chronicle, resource) < *amount {
                return Err(ChronicleError::Rejected(format!("agent {} cannot cover trade offer", b.id)));
            }
        }
        if let Some(token_id) = &offer_b.token {
            if !b.has_token(chronicle, token_id) {
                return Err(ChronicleError::UnknownPlacement(token_id.to_string()));
            }
        }

        if let Some((resource, amount)) = &offer_a.resource {
            a.transfer_resource(chronicle, b, resource, *amount)?;
        }
        if let Some(token_id) = &offer_a.token {
            a.transfer_token(chronicle, b, token_id)?;
        }
        if let Some((resource, amount)) = &offer_b.resource {
            b.transfer_resource(chronicle, a, resource, *amount)?;
        }
        if let Some(token_id) = &offer_b.token {
            b.transfer_token(chronicle, a, token_id)?;
        }
        Ok(())
    }

    pub fn all_ids(chronicle: &Chronicle) -> BTreeSet<AgentId> {
        match chronicle.state().field(AGENTS_FIELD) {
            Some(Field::Set(set)) => set
                .iter()
                .filter_map(|v| v.as_str().map(AgentId::from))
                .collect(),
            _ => BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PeerId;

    #[test]
    fn give_and_take_resource_round_trips() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        let agent = Agent::create(&mut chronicle, AgentId::from("p1"), "Alice").unwrap();
        agent.give_resource(&mut chronicle, "gold", 10).unwrap();
        agent.take_resource(&mut chronicle, "gold", 4).unwrap();
        assert_eq!(agent.resource(&chronicle, "gold"), 6);
    }

    #[test]
    fn take_resource_never_goes_negative() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        let agent = Agent::create(&mut chronicle, AgentId::from("p1"), "Alice").unwrap();
        agent.give_resource(&mut chronicle, "gold", 2).unwrap();
        let result = agent.take_resource(&mut chronicle, "gold", 5);
        assert!(result.is_err());
        assert_eq!(agent.resource(&chronicle, "gold"), 2);
    }

    #[test]
    fn transfer_resource_is_atomic_on_insufficient_funds() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        let a = Agent::create(&mut chronicle, AgentId::from("a"), "A").unwrap();
        let b = Agent::create(&mut chronicle, AgentId::from("b"), "B").unwrap();
        a.give_resource(&mut chronicle, "gold", 1).unwrap();
        let result = a.transfer_resource(&mut chronicle, &b, "gold", 5);
        assert!(result.is_err());
        assert_eq!(a.resource(&chronicle, "gold"), 1);
        assert_eq!(b.resource(&chronicle, "gold"), 0);
    }

    #[test]
    fn steal_resource_takes_at_most_available() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        let a = Agent::create(&mut chronicle, AgentId::from("a"), "A").unwrap();
        let b = Agent::create(&mut chronicle, AgentId::from("b"), "B").unwrap();
        a.give_resource(&mut chronicle, "gold", 3).unwrap();
        let stolen = b.steal_resource(&mut chronicle, &a, "gold", 10).unwrap();
        assert_eq!(stolen, 3);
        assert_eq!(a.resource(&chronicle, "gold"), 0);
        assert_eq!(b.resource(&chronicle, "gold"), 3);
    }

    #[test]
    fn trade_validates_both_sides_before_moving_anything() {
        let mut chronicle = Chronicle::new(PeerId::generate());
        let a = Agent::create(&mut chronicle, AgentId::from("a"), "A").unwrap();
        let b = Agent::create(&mut chronicle, AgentId::from("b"), "B").unwrap();
        a.give_resource(&mut chronicle, "gold", 5).unwrap();
        let offer_a = TradeOffer {
            resource: Some(("gold".into(), 5)),
            token: None,
        };
        let offer_b = TradeOffer {
            resource: Some(("silver".into(), 1)),
            token: None,
        };
        let result = Agent::trade(&mut chronicle, &a, &offer_a, &b, &offer_b);
        assert!(result.is_err());
        assert_eq!(a.resource(&chronicle, "gold"), 5);
    }
}
