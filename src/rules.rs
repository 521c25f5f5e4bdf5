//! Policies and rules: the two post-dispatch hooks the [`crate::engine::Engine`]
//! runs after every successful action.
//!
//! A `Policy` evaluates once per dispatched action and may ask the engine to
//! dispatch a follow-up action (auto-drawing a replacement card, say); the
//! engine reruns policies on the resulting state, bounded by a depth guard,
//! since a policy's own follow-up can itself trigger more policies. A `Rule`
//! is simpler: a condition/effect pair with a priority, run after policies
//! have settled, that mutates the document directly rather than by dispatch.
//! A rule marked `once` fires at most one time for the life of this engine
//! instance.

use serde_json::Value as Json;

use crate::chronicle::Chronicle;
use crate::error::Result;

/// Everything a condition/effect/policy closure is told about the action
/// that just ran.
#[derive(Clone, Debug)]
pub struct ActionContext {
    pub seq: u64,
    pub action: String,
    pub payload: Json,
    pub result: Json,
}

type Condition = Box<dyn Fn(&Chronicle, &ActionContext) -> bool + Send + Sync>;
type Effect = Box<dyn Fn(&mut Chronicle, &ActionContext) -> Result<()> + Send + Sync>;
type PolicyEval = Box<dyn Fn(&mut Chronicle, &ActionContext) -> Result<Option<(String, Json)>> + Send + Sync>;

/// A priority-ordered condition/effect pair. Ties in `priority` break by
/// registration order (insertion order into the owning [`RuleEngine`]).
pub struct Rule {
    pub name: String,
    pub priority: i32,
    pub once: bool,
    consumed: bool,
    condition: Condition,
    effect: Effect,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        once: bool,
        condition: impl Fn(&Chronicle, &ActionContext) -> bool + Send + Sync + 'static,
        effect: impl Fn(&mut Chronicle, &ActionContext) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            once,
            consumed: false,
            condition: Box::new(condition),
            effect: Box::new(effect),
        }
    }
}

/// A named evaluator run after every successful dispatch, in registration
/// order, that may request one follow-up action.
pub struct Policy {
    pub name: String,
    evaluate: PolicyEval,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        evaluate: impl Fn(&mut Chronicle, &ActionContext) -> Result<Option<(String, Json)>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            evaluate: Box::new(evaluate),
        }
    }
}

/// The holder of every registered policy and rule, owned by the `Engine`.
#[derive(Default)]
pub struct RuleEngine {
    policies: Vec<Policy>,
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_policy(&mut self, policy: Policy) {
        self.policies.push(policy);
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Runs every policy once, in registration order, collecting at most one
    /// follow-up action per policy. A policy whose `evaluate` errors is
    /// treated the same as a handler error would be — propagated to the
    /// caller, which per the engine's contract does *not* roll back the
    /// action that already committed.
    pub fn run_policies(&self, chronicle: &mut Chronicle, ctx: &ActionContext) -> Result<Vec<(String, Json)>> {
        let mut follow_ups = Vec::new();
        for policy in &self.policies {
            if let Some(follow_up) = (policy.evaluate)(chronicle, ctx)? {
                follow_ups.push(follow_up);
            }
        }
        Ok(follow_ups)
    }

    /// Walks rules in descending priority order (registration order breaks
    /// ties) and applies the `effect` of the *first* rule whose `condition`
    /// holds, then stops. A `once` rule is skipped on every future call
    /// after it first fires. An effect failure is reported as a
    /// `(rule name, message)` pair instead of propagated — a failing rule
    /// emits `rule:error` without rolling back the action that triggered it.
    pub fn run_rules(&mut self, chronicle: &mut Chronicle, ctx: &ActionContext) -> Vec<(String, String)> {
        let mut order: Vec<usize> = (0..self.rules.len()).collect();
        order.sort_by(|&a, &b| self.rules[b].priority.cmp(&self.rules[a].priority).then(a.cmp(&b)));

        let mut errors = Vec::new();
        for index in order {
            let fires = {
                let rule = &self.rules[index];
                !rule.consumed && (rule.condition)(chronicle, ctx)
            };
            if !fires {
                continue;
            }
            let result = (self.rules[index].effect)(chronicle, ctx);
            if self.rules[index].once {
                self.rules[index].consumed = true;
            }
            if let Err(err) = result {
                errors.push((self.rules[index].name.clone(), err.to_string()));
            }
            break;
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PeerId;

    fn ctx() -> ActionContext {
        ActionContext {
            seq: 1,
            action: "test:action".into(),
            payload: Json::Null,
            result: Json::Null,
        }
    }

    #[test]
    fn only_the_first_satisfied_rule_by_priority_fires() {
        let mut engine = RuleEngine::new();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        engine.add_rule(Rule::new("low", 1, false, |_, _| true, move |_, _| {
            o1.lock().unwrap().push("low");
            Ok(())
        }));
        let o2 = order.clone();
        engine.add_rule(Rule::new("high", 10, false, |_, _| true, move |_, _| {
            o2.lock().unwrap().push("high");
            Ok(())
        }));
        let mut chronicle = Chronicle::new(PeerId::generate());
        let errors = engine.run_rules(&mut chronicle, &ctx());
        assert!(errors.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["high"]);
    }

    #[test]
    fn an_unsatisfied_higher_priority_rule_lets_the_next_one_fire() {
        let mut engine = RuleEngine::new();
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        engine.add_rule(Rule::new("low", 1, false, |_, _| true, move |_, _| {
            o1.lock().unwrap().push("low");
            Ok(())
        }));
        engine.add_rule(Rule::new("high", 10, false, |_, _| false, |_, _| Ok(())));
        let mut chronicle = Chronicle::new(PeerId::generate());
        let errors = engine.run_rules(&mut chronicle, &ctx());
        assert!(errors.is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["low"]);
    }

    #[test]
    fn once_rule_fires_at_most_once() {
        let mut engine = RuleEngine::new();
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = count.clone();
        engine.add_rule(Rule::new("single", 0, true, |_, _| true, move |_, _| {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }));
        let mut chronicle = Chronicle::new(PeerId::generate());
        engine.run_rules(&mut chronicle, &ctx());
        engine.run_rules(&mut chronicle, &ctx());
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn rule_effect_failure_is_reported_not_propagated() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule::new("failing", 0, false, |_, _| true, |_, _| {
            Err(crate::error::ChronicleError::Rejected("nope".into()))
        }));
        let mut chronicle = Chronicle::new(PeerId::generate());
        let errors = engine.run_rules(&mut chronicle, &ctx());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "failing");
    }

    #[test]
    fn policy_can_request_a_follow_up_action() {
        let mut engine = RuleEngine::new();
        engine.add_policy(Policy::new("auto_draw", |_, ctx| {
            Ok(Some(("stack:draw".to_string(), ctx.payload.clone())))
        }));
        let mut chronicle = Chronicle::new(PeerId::generate());
        let follow_ups = engine.run_policies(&mut chronicle, &ctx()).unwrap();
        assert_eq!(follow_ups, vec![("stack:draw".to_string(), Json::Null)]);
    }
}
