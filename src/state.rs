//! Per-run agent state, updated functionally.
//!
//! Corresponds to spec §3 ("Agent state") and its invariant that a step
//! transition produces a new state value rather than mutating one in
//! place — every method here takes `self` by value and returns `Self`, so
//! the step loop reads as `state = state.decrement_steps().with_message(m)`
//! rather than a sequence of `&mut` calls. This mirrors the teacher's
//! preference for building up an `Agent`/`CrewAgentExecutor` through
//! explicit constructors over in-place mutation, generalized from a
//! single long-lived `Agent` struct to a state value that's cheap to
//! snapshot, branch (for sub-agent spawns), and hand to an event sink.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::agent_def::AgentDefinition;
use crate::message::Message;

/// Where an agent's run currently stands.
///
/// Corresponds to spec §4.1's terminal conditions: a normal `end_turn`
/// (`Done`), exhausting `steps_remaining` (`StepLimitReached`), external
/// cancellation, or an unrecoverable provider/config failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Running,
    Done,
    StepLimitReached,
    CostLimitReached,
    Cancelled,
    Failed,
}

/// A tool's schema and description as visible to one particular run.
///
/// Corresponds to spec §3's "a dictionary of tool metadata (schema and
/// description) visible to this run" — populated once, at state creation,
/// from whatever subset of the process-wide `ToolRegistry` the agent's
/// `tool_names` allow-list resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolMeta {
    pub description: String,
    pub input_schema: Value,
}

/// The full state of one agent instance at a point in the loop.
///
/// Corresponds to spec §3 ("Agent state"): a unique `run_id`, the
/// `agent_id` it was instantiated from, its parent (if any) and full
/// ancestor/child run-id lists, the message history, the effective system
/// prompt, a dictionary of visible tool metadata, an optional output,
/// `steps_remaining`, `credits_used`, and an opaque context dictionary.
#[derive(Debug, Clone)]
pub struct AgentState {
    /// Unique per invocation — never reused, even across retries.
    pub run_id: String,
    /// The `AgentDefinition::id` this run was instantiated from.
    pub agent_id: String,
    pub definition: Arc<AgentDefinition>,
    pub parent_id: Option<String>,
    /// Ordered root-to-here path of ancestor run ids, not including this
    /// run. Cycles are impossible: every spawn strictly increases depth
    /// (spec §3's invariant).
    pub ancestor_run_ids: Vec<String>,
    /// Run ids of children spawned from this state, in spawn order.
    pub child_run_ids: Vec<String>,
    pub history: Vec<Message>,
    pub effective_system_prompt: String,
    pub tool_metadata: HashMap<String, ToolMeta>,
    pub output: Option<Value>,
    pub steps_remaining: u32,
    /// Monotonically non-decreasing USD spend for this run (spec §3's
    /// invariant).
    pub credits_used: f64,
    pub context: HashMap<String, Value>,
    pub status: AgentStatus,
}

impl AgentState {
    /// A fresh, top-level (depth 0, no parent) agent instance.
    pub fn new_root(definition: Arc<AgentDefinition>) -> Self {
        let effective_system_prompt = definition.system_prompt.clone();
        Self {
            run_id: Uuid::new_v4().to_string(),
            agent_id: definition.id.clone(),
            steps_remaining: definition.max_steps,
            definition,
            parent_id: None,
            ancestor_run_ids: Vec::new(),
            child_run_ids: Vec::new(),
            history: Vec::new(),
            effective_system_prompt,
            tool_metadata: HashMap::new(),
            output: None,
            credits_used: 0.0,
            context: HashMap::new(),
            status: AgentStatus::Running,
        }
    }

    /// A child instance spawned from this one: ancestor path extended by
    /// this run's id, parent set to this run's id, its own fresh step
    /// budget (spec §4.4: "each sub-agent begins with its own
    /// `steps_remaining`, not a share of the parent's"), and — per the
    /// child definition's `include_message_history` flag — either an
    /// empty history or a copy of the parent's.
    pub fn spawn_child(&self, definition: Arc<AgentDefinition>) -> Self {
        let mut ancestor_run_ids = self.ancestor_run_ids.clone();
        ancestor_run_ids.push(self.run_id.clone());
        let history = if definition.include_message_history {
            self.history.clone()
        } else {
            Vec::new()
        };
        let effective_system_prompt = definition.system_prompt.clone();
        Self {
            run_id: Uuid::new_v4().to_string(),
            agent_id: definition.id.clone(),
            steps_remaining: definition.max_steps,
            definition,
            parent_id: Some(self.run_id.clone()),
            ancestor_run_ids,
            child_run_ids: Vec::new(),
            history,
            effective_system_prompt,
            tool_metadata: HashMap::new(),
            output: None,
            credits_used: 0.0,
            context: HashMap::new(),
            status: AgentStatus::Running,
        }
    }

    /// Depth is the length of the ancestor-run chain (spec §4.4's depth
    /// bound operates on this value).
    pub fn depth(&self) -> u32 {
        self.ancestor_run_ids.len() as u32
    }

    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.history.push(message);
        self
    }

    #[must_use]
    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.history.extend(messages);
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn with_tool_metadata(mut self, tool_metadata: HashMap<String, ToolMeta>) -> Self {
        self.tool_metadata = tool_metadata;
        self
    }

    #[must_use]
    pub fn decrement_steps(mut self) -> Self {
        self.steps_remaining = self.steps_remaining.saturating_sub(1);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Add `amount` USD to `credits_used`. `amount` is clamped to
    /// non-negative so a misbehaving cost calculation can never regress
    /// the invariant "monotonically non-decreasing" (spec §3).
    #[must_use]
    pub fn add_credits(mut self, amount: f64) -> Self {
        self.credits_used += amount.max(0.0);
        self
    }

    #[must_use]
    pub fn with_child_run_id(mut self, child_run_id: impl Into<String>) -> Self {
        self.child_run_ids.push(child_run_id.into());
        self
    }

    #[must_use]
    pub fn with_context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, AgentStatus::Running)
    }

    pub fn is_exhausted(&self) -> bool {
        self.steps_remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def() -> Arc<AgentDefinition> {
        Arc::new(AgentDefinition::new("a", "p", "m").with_max_steps(3))
    }

    #[test]
    fn new_root_has_no_parent_and_depth_zero() {
        let state = AgentState::new_root(def());
        assert_eq!(state.depth(), 0);
        assert!(state.parent_id.is_none());
        assert_eq!(state.steps_remaining, 3);
        assert_eq!(state.credits_used, 0.0);
    }

    #[test]
    fn spawn_child_extends_ancestor_path_and_sets_parent() {
        let parent = AgentState::new_root(def());
        let child = parent.spawn_child(def());
        assert_eq!(child.depth(), 1);
        assert_eq!(child.ancestor_run_ids, vec![parent.run_id.clone()]);
        assert_eq!(child.parent_id.as_deref(), Some(parent.run_id.as_str()));
        assert_ne!(child.run_id, parent.run_id);
    }

    #[test]
    fn grandchild_ancestor_path_has_both_ancestors_in_order() {
        let root = AgentState::new_root(def());
        let child = root.spawn_child(def());
        let grandchild = child.spawn_child(def());
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.ancestor_run_ids, vec![root.run_id.clone(), child.run_id.clone()]);
    }

    #[test]
    fn spawn_child_history_is_empty_unless_include_message_history_is_set() {
        let parent = AgentState::new_root(def()).with_message(Message::user("hi"));
        let isolated = parent.spawn_child(def());
        assert!(isolated.history.is_empty());

        let inheriting_def = Arc::new(AgentDefinition::new("b", "p", "m").with_include_message_history(true));
        let inheriting = parent.spawn_child(inheriting_def);
        assert_eq!(inheriting.history, parent.history);
    }

    #[test]
    fn decrement_steps_saturates_at_zero() {
        let mut state = AgentState::new_root(Arc::new(AgentDefinition::new("a", "p", "m").with_max_steps(1)));
        state = state.decrement_steps();
        assert_eq!(state.steps_remaining, 0);
        state = state.decrement_steps();
        assert_eq!(state.steps_remaining, 0);
        assert!(state.is_exhausted());
    }

    #[test]
    fn add_credits_is_monotonic() {
        let state = AgentState::new_root(def()).add_credits(1.5).add_credits(0.25);
        assert!((state.credits_used - 1.75).abs() < 1e-9);
    }

    #[test]
    fn with_message_appends_preserving_order() {
        let state = AgentState::new_root(def())
            .with_message(Message::user("first"))
            .with_message(Message::user("second"));
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.history[0], Message::user("first"));
    }

    #[test]
    fn is_terminal_reflects_status() {
        let state = AgentState::new_root(def());
        assert!(!state.is_terminal());
        let done = state.with_status(AgentStatus::Done);
        assert!(done.is_terminal());
    }

    #[test]
    fn child_run_ids_accumulate_in_spawn_order() {
        let state = AgentState::new_root(def())
            .with_child_run_id("child-1")
            .with_child_run_id("child-2");
        assert_eq!(state.child_run_ids, vec!["child-1".to_string(), "child-2".to_string()]);
    }
}
