//! The always-available turn-ending tools.
//!
//! Corresponds to spec §4.1 step 10's end-turn set: `end_turn` and
//! `task_completed` are always members regardless of an agent's declared
//! `tool_names`; `set_output` joins the set only for agents with
//! `set_output_ends_run = true`. The runtime (`crate::runtime`) registers
//! these three unconditionally and always includes their schemas in the
//! outgoing tool list, on top of whatever the agent's own allow-list
//! resolves to.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolContext};

/// Names the step loop checks a completed tool call against to decide
/// whether a turn has ended (spec §4.1 step 10).
pub mod names {
    pub const END_TURN: &str = "end_turn";
    pub const TASK_COMPLETED: &str = "task_completed";
    pub const SET_OUTPUT: &str = "set_output";
}

/// Ends the current turn, optionally carrying a closing message.
pub struct EndTurnTool;

#[async_trait]
impl Tool for EndTurnTool {
    fn name(&self) -> &str {
        names::END_TURN
    }

    fn description(&self) -> &str {
        "Ends the current turn. Call this once the task is fully handled."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
        })
    }

    fn ends_agent_step(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: ToolContext) -> Result<Value, String> {
        let message = ctx.input.get("message").and_then(Value::as_str).unwrap_or_default();
        Ok(json!({ "ended": true, "message": message }))
    }
}

/// Marks a delegated task as complete; semantically identical to
/// `end_turn`, kept as a distinct name for agents driven by a
/// task/subtask model rather than free-form conversation.
pub struct TaskCompletedTool;

#[async_trait]
impl Tool for TaskCompletedTool {
    fn name(&self) -> &str {
        names::TASK_COMPLETED
    }

    fn description(&self) -> &str {
        "Marks the assigned task as complete and ends the current turn."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
        })
    }

    fn ends_agent_step(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: ToolContext) -> Result<Value, String> {
        let message = ctx.input.get("message").and_then(Value::as_str).unwrap_or_default();
        Ok(json!({ "ended": true, "message": message }))
    }
}

/// Records the run's structured output. Echoes its input back under an
/// `output` key so the step loop's generic "does this result carry a
/// top-level `output` field" check (spec §4.1 step 9) picks it up without
/// any special-casing of this tool's name there.
pub struct SetOutputTool;

#[async_trait]
impl Tool for SetOutputTool {
    fn name(&self) -> &str {
        names::SET_OUTPUT
    }

    fn description(&self) -> &str {
        "Records the run's structured output."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, ctx: ToolContext) -> Result<Value, String> {
        Ok(json!({ "output": ctx.input }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::tools::ProjectContext;
    use std::sync::Arc;

    fn ctx(input: Value) -> ToolContext {
        let def = Arc::new(crate::agent_def::AgentDefinition::new("agent-1", "p", "m"));
        ToolContext::new(
            input,
            "call-1",
            "agent-1",
            crate::state::AgentState::new_root(def),
            Arc::new(ProjectContext {
                root: "/tmp".into(),
                cwd: "/tmp".into(),
            }),
            CancelToken::new(),
            None,
        )
    }

    #[tokio::test]
    async fn end_turn_echoes_message_and_sets_ended() {
        let out = EndTurnTool.execute(ctx(json!({"message": "done"}))).await.unwrap();
        assert_eq!(out, json!({"ended": true, "message": "done"}));
    }

    #[tokio::test]
    async fn set_output_wraps_input_under_output_key() {
        let out = SetOutputTool.execute(ctx(json!({"x": 1}))).await.unwrap();
        assert_eq!(out, json!({"output": {"x": 1}}));
    }

    #[test]
    fn end_turn_ends_agent_step() {
        assert!(EndTurnTool.ends_agent_step());
        assert!(TaskCompletedTool.ends_agent_step());
        assert!(!SetOutputTool.ends_agent_step());
    }
}
