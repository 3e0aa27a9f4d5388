//! The agent blueprint: the immutable, reusable definition a run
//! instantiates into per-run `AgentState`.
//!
//! Corresponds to spec §3 ("Agent definition"). Grounded on the teacher's
//! `agent::core::Agent` for the shape of a role/goal/backstory-driven
//! definition, radically trimmed and re-expanded to the spec's own field
//! list rather than CrewAI's feature surface (knowledge sources, code
//! execution modes, delegation, and the rest are out of scope here).

use std::sync::Arc;

use serde_json::Value;

use crate::step_generator::StepGenerator;
use crate::tools::permissions::PermissionPolicy;

/// How a run's final output is derived once the loop ends.
///
/// Corresponds to spec §3's "output mode selector".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The last assistant message's text.
    LastMessage,
    /// Every message in the run's history, concatenated by the caller.
    AllMessages,
    /// The JSON value set via the `set_output` tool.
    StructuredOutput,
}

/// An immutable agent blueprint. Many `AgentState` instances — across
/// concurrent runs, and across sub-agent spawns within one run — may share
/// the same `Arc<AgentDefinition>`.
///
/// Corresponds to spec §3's full field list: a stable identifier, display
/// name, model route, tool allow-list, spawnable sub-agent ids, three
/// optional prompt strings, the `include_message_history`/
/// `set_output_ends_run` flags, an optional programmatic step generator,
/// informational input/output schemas, and an output mode selector.
pub struct AgentDefinition {
    /// Stable identifier, looked up by the spawner and `AgentRegistry`.
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    /// Appended once, ahead of the first user prompt, tagged
    /// `INSTRUCTIONS_PROMPT` and never expiring (spec §3/§4.1).
    pub instructions_prompt: Option<String>,
    /// Appended fresh at the start of every step, tagged `STEP_PROMPT`
    /// with `time_to_live = agent_step` (spec §4.1 step 4).
    pub step_prompt: Option<String>,
    /// A `<provider>/<model>` route string, resolved by `ProviderRegistry`.
    pub model: String,
    /// Names looked up in the run's `ToolRegistry`; unknown names are
    /// simply unavailable to this agent rather than an error at
    /// definition time. Logically a set; kept as a `Vec` since tool order
    /// has no meaning but registry lookups are cheap either way.
    pub tool_names: Vec<String>,
    /// Agent ids this definition may spawn via `spawn_agents`.
    pub sub_agent_ids: Vec<String>,
    /// Whether a sub-agent run starts with the parent's message history
    /// instead of an empty one (spec §3's `include_message_history` flag).
    pub include_message_history: bool,
    /// Whether a `set_output` tool call also ends the turn, independent
    /// of whether `set_output` is itself in the always-on end-turn set
    /// (spec §9's Open Question: these are deliberately separate knobs).
    pub set_output_ends_run: bool,
    pub step_generator: Option<Arc<dyn StepGenerator>>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub output_mode: OutputMode,
    pub max_steps: u32,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub permission_policy: Arc<PermissionPolicy>,
}

impl std::fmt::Debug for AgentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("model", &self.model)
            .field("tool_names", &self.tool_names)
            .field("sub_agent_ids", &self.sub_agent_ids)
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            system_prompt: system_prompt.into(),
            instructions_prompt: None,
            step_prompt: None,
            model: model.into(),
            tool_names: Vec::new(),
            sub_agent_ids: Vec::new(),
            include_message_history: false,
            set_output_ends_run: false,
            step_generator: None,
            input_schema: None,
            output_schema: None,
            output_mode: OutputMode::LastMessage,
            max_steps: 25,
            temperature: None,
            max_tokens: None,
            permission_policy: Arc::new(PermissionPolicy::default()),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tool_names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tool_names = tool_names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_sub_agents(mut self, agent_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.sub_agent_ids = agent_ids.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_instructions_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.instructions_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_step_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.step_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_step_generator(mut self, generator: Arc<dyn StepGenerator>) -> Self {
        self.step_generator = Some(generator);
        self
    }

    #[must_use]
    pub fn with_include_message_history(mut self, include: bool) -> Self {
        self.include_message_history = include;
        self
    }

    #[must_use]
    pub fn with_set_output_ends_run(mut self, ends_run: bool) -> Self {
        self.set_output_ends_run = ends_run;
        self
    }

    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_permission_policy(mut self, policy: PermissionPolicy) -> Self {
        self.permission_policy = Arc::new(policy);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_set_expected_fields() {
        let def = AgentDefinition::new("coder", "you write code", "anthropic/claude-4")
            .with_tools(["read_file", "write_file"])
            .with_max_steps(10)
            .with_temperature(0.2);
        assert_eq!(def.tool_names, vec!["read_file".to_string(), "write_file".to_string()]);
        assert_eq!(def.max_steps, 10);
        assert_eq!(def.temperature, Some(0.2));
    }

    #[test]
    fn defaults_are_sane() {
        let def = AgentDefinition::new("a", "p", "m");
        assert!(def.max_steps > 0);
        assert!(def.tool_names.is_empty());
        assert!(def.step_generator.is_none());
        assert_eq!(def.output_mode, OutputMode::LastMessage);
        assert_eq!(def.name, "a");
    }

    #[test]
    fn sub_agent_ids_are_tracked() {
        let def = AgentDefinition::new("planner", "p", "m").with_sub_agents(["coder", "reviewer"]);
        assert!(def.sub_agent_ids.contains(&"coder".to_string()));
        assert!(def.sub_agent_ids.contains(&"reviewer".to_string()));
    }
}
