//! Source: a multi-stack draw pool with a reshuffle policy.
//!
//! Draw/burn/shuffle over a pooled token list with a threshold-triggered
//! reshuffle, expressed as a thin coordinator over several
//! [`crate::stack::Stack`]s instead of its own flat token list, so the CRDT
//! convergence guarantees `Stack` already provides extend to the pooled
//! case without duplicating list-merge logic.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use chronicle_crdt::Field;

use crate::chronicle::Chronicle;
use crate::error::{ChronicleError, Result};
use crate::stack::Stack;

const SOURCE_STACKS_FIELD_SUFFIX: &str = "stacks";
const SOURCE_POLICY_FIELD_SUFFIX: &str = "policy";
const SOURCE_CURSOR_FIELD_SUFFIX: &str = "cursor";

/// When aggregate remaining count drops below `threshold`, either ask the
/// caller to reshuffle (`Manual`) or reshuffle automatically from discards.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReshuffleMode {
    Manual,
    Auto,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReshufflePolicy {
    pub threshold: usize,
    pub mode: ReshuffleMode,
    #[serde(default)]
    pub include_discards: bool,
}

impl Default for ReshufflePolicy {
    fn default() -> Self {
        Self {
            threshold: 0,
            mode: ReshuffleMode::Manual,
            include_discards: false,
        }
    }
}

/// How a `Source` picks which wrapped stack to act on next.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Cycle through wrapped stacks in order, one token at a time.
    RoundRobin,
    /// Prefer the stack with the most tokens remaining.
    Weighted,
}

/// Events a caller should react to after a `Source` operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SourceEvent {
    ReshuffleRequired,
}

/// A named coordinator over one or more [`Stack`]s sharing a reshuffle
/// policy. All fields live under `source:<name>:*` in the chronicle
/// document; the wrapped stacks keep their own independent `stack:<name>:*`
/// fields, so a `Source` can be built over stacks that already existed.
#[derive(Clone, Debug)]
pub struct Source {
    name: String,
    selection: SelectionMode,
}

impl Source {
    fn field(&self, suffix: &str) -> String {
        format!("source:{}:{}", self.name, suffix)
    }

    pub fn create(
        chronicle: &mut Chronicle,
        name: impl Into<String>,
        stacks: Vec<Stack>,
        policy: ReshufflePolicy,
        selection: SelectionMode,
    ) -> Result<Self> {
        let source = Self {
            name: name.into(),
            selection,
        };
        let stack_names: Vec<Json> = stacks.iter().map(|s| Json::from(s.name())).collect();
        let policy_value = serde_json::to_value(&policy).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        let stacks_field = source.field(SOURCE_STACKS_FIELD_SUFFIX);
        let policy_field = source.field(SOURCE_POLICY_FIELD_SUFFIX);
        chronicle
            .change("source:create", |ctx| {
                ctx.set(stacks_field.clone(), Json::Array(stack_names.clone()));
                ctx.set(policy_field.clone(), policy_value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("source:create mutator cannot fail".into()))?;
        Ok(source)
    }

    pub fn from_name(name: impl Into<String>, selection: SelectionMode) -> Self {
        Self {
            name: name.into(),
            selection,
        }
    }

    fn stack_names(&self, chronicle: &Chronicle) -> Vec<String> {
        match chronicle.state().field(&self.field(SOURCE_STACKS_FIELD_SUFFIX)) {
            Some(Field::Register(r)) => r
                .get()
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn policy(&self, chronicle: &Chronicle) -> ReshufflePolicy {
        match chronicle.state().field(&self.field(SOURCE_POLICY_FIELD_SUFFIX)) {
            Some(Field::Register(r)) => serde_json::from_value(r.get().clone()).unwrap_or_default(),
            _ => ReshufflePolicy::default(),
        }
    }

    pub fn stacks(&self, chronicle: &Chronicle) -> Vec<Stack> {
        self.stack_names(chronicle).into_iter().map(Stack::from_name).collect()
    }

    /// Aggregate remaining count across every wrapped stack.
    pub fn remaining(&self, chronicle: &Chronicle) -> usize {
        self.stacks(chronicle).iter().map(|s| s.remaining(chronicle)).sum()
    }

    fn next_cursor(&self, chronicle: &Chronicle) -> usize {
        match chronicle.state().field(&self.field(SOURCE_CURSOR_FIELD_SUFFIX)) {
            Some(Field::Counter(c)) => c.value().max(0) as usize,
            _ => 0,
        }
    }

    /// Picks the stacks (and how many tokens to take from each, in call
    /// order) needed to satisfy `count`, in priority order for this
    /// source's selection mode.
    ///
    /// `RoundRobin` interleaves one token per stack per round (stack A,
    /// stack B, stack A, stack B, ...), skipping any stack that has already
    /// run dry, starting from the stack at the persisted cursor; `Weighted`
    /// drains the stack with the most tokens remaining first, in one
    /// contiguous take per stack.
    fn plan(&self, chronicle: &Chronicle, count: usize) -> Vec<(Stack, usize)> {
        let mut stacks: Vec<(Stack, usize)> = self
            .stacks(chronicle)
            .into_iter()
            .map(|s| {
                let remaining = s.remaining(chronicle);
                (s, remaining)
            })
            .collect();
        match self.selection {
            SelectionMode::RoundRobin => {
                let cursor = self.next_cursor(chronicle);
                if !stacks.is_empty() {
                    stacks.rotate_left(cursor % stacks.len());
                }
                let mut plan = Vec::new();
                let mut remaining_needed = count;
                let mut available: Vec<usize> = stacks.iter().map(|(_, n)| *n).collect();
                while remaining_needed > 0 && available.iter().any(|&n| n > 0) {
                    for (i, (stack, _)) in stacks.iter().enumerate() {
                        if remaining_needed == 0 {
                            break;
                        }
                        if available[i] > 0 {
                            plan.push((stack.clone(), 1));
                            available[i] -= 1;
                            remaining_needed -= 1;
                        }
                    }
                }
                plan
            }
            SelectionMode::Weighted => {
                stacks.sort_by(|a, b| b.1.cmp(&a.1));
                let mut plan = Vec::new();
                let mut remaining_needed = count;
                for (stack, available) in stacks {
                    if remaining_needed == 0 {
                        break;
                    }
                    let take = available.min(remaining_needed);
                    if take > 0 {
                        plan.push((stack, take));
                        remaining_needed -= take;
                    }
                }
                plan
            }
        }
    }

    /// Draws `count` tokens, spread across wrapped stacks per the selection
    /// mode. Fails with `Exhausted` if the aggregate pool cannot satisfy the
    /// request even after checking the reshuffle policy once — the source
    /// is deliberately conservative here: it never retries a fresh draw
    /// after an automatic reshuffle within the same call. An implicit
    /// retry would hide a state mutation (the reshuffle) behind what looks
    /// like a pure read, so exhaustion always surfaces and lets the caller
    /// decide whether to retry.
    pub fn draw(&self, chronicle: &mut Chronicle, count: usize) -> Result<Vec<crate::token::Token>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.maybe_reshuffle(chronicle)?;
        let plan = self.plan(chronicle, count);
        let planned: usize = plan.iter().map(|(_, n)| n).sum();
        if planned < count {
            return Err(ChronicleError::Exhausted);
        }
        let mut drawn = Vec::with_capacity(count);
        for (stack, take) in &plan {
            drawn.extend(stack.draw(chronicle, *take)?);
        }
        let cursor_field = self.field(SOURCE_CURSOR_FIELD_SUFFIX);
        if self.selection == SelectionMode::RoundRobin {
            chronicle
                .change("source:advance_cursor", |ctx| {
                    ctx.counter_add(cursor_field.clone(), 1);
                    Ok(())
                })
                .map_err(|_| ChronicleError::InternalInvariantBroken("source:advance_cursor mutator cannot fail".into()))?;
        }
        Ok(drawn)
    }

    pub fn burn(&self, chronicle: &mut Chronicle, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.maybe_reshuffle(chronicle)?;
        let plan = self.plan(chronicle, count);
        let planned: usize = plan.iter().map(|(_, n)| n).sum();
        if planned < count {
            return Err(ChronicleError::Exhausted);
        }
        for (stack, take) in &plan {
            stack.burn(chronicle, *take)?;
        }
        Ok(())
    }

    /// Shuffles every wrapped stack with the same seed, so the draw order
    /// across the whole pool stays deterministic given that seed.
    pub fn shuffle(&self, chronicle: &mut Chronicle, seed: &str) -> Result<()> {
        for (i, stack) in self.stacks(chronicle).into_iter().enumerate() {
            stack.shuffle(chronicle, &format!("{seed}/{i}"))?;
        }
        Ok(())
    }

    /// Checks the reshuffle policy and, in `Auto` mode, pulls discards back
    /// into their stacks and reshuffles when the aggregate count has
    /// dropped below `threshold`. In `Manual` mode only the event is
    /// returned; nothing is mutated.
    pub fn maybe_reshuffle(&self, chronicle: &mut Chronicle) -> Result<Option<SourceEvent>> {
        let policy = self.policy(chronicle);
        if policy.threshold == 0 || self.remaining(chronicle) > policy.threshold {
            return Ok(None);
        }
        match policy.mode {
            ReshuffleMode::Manual => Ok(Some(SourceEvent::ReshuffleRequired)),
            ReshuffleMode::Auto => {
                if policy.include_discards {
                    for stack in self.stacks(chronicle) {
                        stack.restore_discards(chronicle)?;
                    }
                }
                let round = match chronicle.state().field("round") {
                    Some(Field::Counter(c)) => c.value(),
                    _ => 0,
                };
                self.shuffle(chronicle, &format!("source:{}/reshuffle/{round}", self.name))?;
                Ok(None)
            }
        }
    }

    pub fn set_reshuffle_policy(&self, chronicle: &mut Chronicle, policy: ReshufflePolicy) -> Result<()> {
        let field = self.field(SOURCE_POLICY_FIELD_SUFFIX);
        let value = serde_json::to_value(&policy).map_err(|e| ChronicleError::InvalidMutation(e.to_string()))?;
        chronicle
            .change("source:set_reshuffle_policy", |ctx| {
                ctx.set(field.clone(), value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("source:set_reshuffle_policy mutator cannot fail".into()))?;
        Ok(())
    }

    pub fn add_stack(&self, chronicle: &mut Chronicle, stack: &Stack) -> Result<()> {
        let mut names = self.stack_names(chronicle);
        names.push(stack.name().to_string());
        let field = self.field(SOURCE_STACKS_FIELD_SUFFIX);
        let value = Json::Array(names.into_iter().map(Json::from).collect());
        chronicle
            .change("source:add_stack", |ctx| {
                ctx.set(field.clone(), value.clone());
                Ok(())
            })
            .map_err(|_| ChronicleError::InternalInvariantBroken("source:add_stack mutator cannot fail".into()))?;
        Ok(())
    }
}
