//! The tool trait, registry, and execution context.
//!
//! Corresponds to spec §4.3 ("Tool"/"Registry"). Grounded on the teacher's
//! `tools::tool_calling`/`tools::base_tool` for the shape of a tool
//! invocation, generalized from CrewAI's `BaseTool` (Python-callable,
//! Pydantic-schema-derived) to the spec's plain async trait with an
//! explicit JSON input schema, and on `llms::base_llm`'s
//! `convert_tools_for_inference` for rendering tool schemas onto the wire.
//!
//! The teacher's own `base_tool.rs`, `structured_tool.rs`, `tool_calling.rs`,
//! `mcp_native_tool.rs`, `mcp_tool_wrapper.rs`, `cache_tools.rs`,
//! `tool_usage.rs`, `tool_types.rs`, `agent_tools/`, and `chess/` have no
//! counterpart in this crate's tool model (MCP bridging and the chess demo
//! tool are out of scope) and are left undeclared here pending removal.

pub mod builtin;
pub mod executor;
pub mod permissions;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventSink, ToolSideEvent};
use crate::provider::ToolSchema;
use crate::state::AgentState;
use permissions::ToolPermissions;

/// A project-root-relative view handed to every tool invocation.
///
/// Corresponds to spec §4.3's "project context" collaborator: a read-only
/// filesystem root and working directory, out of this crate's business to
/// interpret further.
#[derive(Debug, Clone)]
pub struct ProjectContext {
    pub root: std::path::PathBuf,
    pub cwd: std::path::PathBuf,
}

/// Emits side-band events for a single tool call, tagging them with the
/// call's id so the caller can correlate them.
#[derive(Clone)]
pub struct ToolEmitter {
    tool_call_id: String,
    sink: Option<EventSink>,
}

impl ToolEmitter {
    pub fn emit(&self, event: ToolSideEvent) {
        crate::events::emit(
            self.sink.as_ref(),
            Event::ToolEvent {
                tool_call_id: self.tool_call_id.clone(),
                event,
            },
        );
    }
}

/// Everything a tool's `execute` needs: its input, identity, a read-only
/// view of the calling agent's state, a read-only project view, the run's
/// cancellation token, and an emitter for side-band events.
///
/// Corresponds to spec §4.3's execution context fields.
pub struct ToolContext {
    pub input: Value,
    pub tool_call_id: String,
    pub agent_id: String,
    /// A snapshot of the state the agent was in when this tool was called.
    /// `AgentState` is an immutable, cloned-on-write value, so this is
    /// naturally a read-only view: nothing a tool does to its clone is
    /// visible back to the step loop.
    pub agent_state: AgentState,
    pub project_context: Arc<ProjectContext>,
    pub cancel: CancelToken,
    pub emit: ToolEmitter,
}

impl ToolContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: Value,
        tool_call_id: impl Into<String>,
        agent_id: impl Into<String>,
        agent_state: AgentState,
        project_context: Arc<ProjectContext>,
        cancel: CancelToken,
        sink: Option<EventSink>,
    ) -> Self {
        let tool_call_id = tool_call_id.into();
        Self {
            input,
            tool_call_id: tool_call_id.clone(),
            agent_id: agent_id.into(),
            agent_state,
            project_context,
            cancel,
            emit: ToolEmitter { tool_call_id, sink },
        }
    }
}

/// A tool an agent may call.
///
/// Corresponds to spec §4.3 ("Tool"): name, description, JSON input schema,
/// an `ends_agent_step` hint, a `requires_sequential` dispatch hint, an
/// advisory permission descriptor, and the `execute` entry point.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    /// If true, a call to this tool ends the current agent step regardless
    /// of what other tool calls accompanied it (spec §4.1 step 9).
    fn ends_agent_step(&self) -> bool {
        false
    }

    /// If true, this tool is dispatched alone, in request order, rather
    /// than concurrently with the rest of its batch (spec §4.3's dispatch
    /// rule).
    fn requires_sequential(&self) -> bool {
        false
    }

    fn permissions(&self) -> ToolPermissions {
        ToolPermissions::default()
    }

    /// Run the tool. A returned `Err` becomes a tool-result error, not a
    /// propagated failure (spec §4.3: "If a tool raises, the executor
    /// catches it").
    async fn execute(&self, ctx: ToolContext) -> std::result::Result<Value, String>;
}

/// The set of tools available to a run (or a particular agent within it).
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: DashMap::new() }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RuntimeError::DuplicateTool { name });
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Render the given tool names in the wire format a `Provider` expects
    /// (spec §4.6's `tools: Vec<ToolSchema>`). Unknown names are skipped.
    pub fn schemas_for(&self, names: &[String]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|entry| ToolSchema {
                name: entry.name().to_string(),
                description: entry.description().to_string(),
                input_schema: entry.input_schema(),
            })
            .collect()
    }

    /// Render every registered tool's schema.
    pub fn all_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .iter()
            .map(|entry| ToolSchema {
                name: entry.name().to_string(),
                description: entry.description().to_string(),
                input_schema: entry.input_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, ctx: ToolContext) -> std::result::Result<Value, String> {
            Ok(ctx.input)
        }
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let err = registry.register(Arc::new(Echo)).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateTool { .. }));
    }

    #[test]
    fn schemas_for_skips_unknown_names() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Echo)).unwrap();
        let schemas = registry.schemas_for(&["echo".to_string(), "missing".to_string()]);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "echo");
    }

    #[tokio::test]
    async fn execute_runs_the_tool() {
        let tool = Echo;
        let def = Arc::new(crate::agent_def::AgentDefinition::new("agent-1", "p", "m"));
        let ctx = ToolContext::new(
            json!({"x": 1}),
            "call-1",
            "agent-1",
            AgentState::new_root(def),
            Arc::new(ProjectContext {
                root: "/tmp".into(),
                cwd: "/tmp".into(),
            }),
            CancelToken::new(),
            None,
        );
        let out = tool.execute(ctx).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }
}
