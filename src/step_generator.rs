//! The programmatic step generator contract.
//!
//! Corresponds to spec §4.2 and the "Coroutine step handler" design note in
//! spec §9: in a systems language without source-level generators, the
//! programmatic step is modelled as an explicit state machine behind a
//! trait, exposing `advance(resume_value) -> {STEP, STEP_ALL, Tool, Done}`.
//! This is spec.md's own suggested resolution of that ambiguity, not an
//! addition of this crate's own invention.

use async_trait::async_trait;
use serde_json::Value;

use crate::spawner::SpawnOutcome;
use crate::state::AgentState;

/// One sub-agent's folded result, handed back to the generator on the next
/// resume when the previous yield triggered spawns.
///
/// Corresponds to spec §4.2's "an optional list of sub-agent response
/// summaries" delivered with each resume.
pub type SubAgentResponseSummary = SpawnOutcome;

/// What a resumed generator yields.
///
/// Corresponds to spec §4.2's three yield shapes: the `STEP` token ("let
/// the LLM run one step"), the `STEP_ALL` token ("let the LLM run until it
/// ends the turn naturally"), and a direct tool-call descriptor.
#[derive(Debug, Clone)]
pub enum StepYield {
    Step,
    StepAll,
    Tool {
        tool_name: String,
        input: Value,
        /// If false, the synthesized tool-call/tool-result pair is *not*
        /// appended to history (spec §4.2: "unless `include_tool_call` is
        /// false").
        include_tool_call: bool,
    },
}

/// The outcome of one `advance` call: either a yield, or the generator
/// returning (which ends the turn, per spec §4.2's "Termination").
#[derive(Debug, Clone)]
pub enum StepAdvance {
    Yield(StepYield),
    Done,
}

/// What the runtime hands the generator on each resume.
///
/// Corresponds to spec §4.2's "Each resume delivers the current agent
/// state, a `steps_complete` flag, and an optional list of sub-agent
/// response summaries."
#[derive(Debug, Clone)]
pub struct ResumeValue {
    pub state: AgentState,
    pub steps_complete: bool,
    pub sub_agent_responses: Option<Vec<SubAgentResponseSummary>>,
}

/// A resumable coroutine driving the step loop deterministically.
///
/// Implementations typically close over their own progress counter (an
/// index into a fixed plan, a small state machine) since there is no
/// shared mutable cursor the runtime manages on their behalf — each
/// `advance` call is expected to be a self-contained step given the
/// `ResumeValue`.
#[async_trait]
pub trait StepGenerator: Send + Sync {
    async fn advance(&self, resume: ResumeValue) -> StepAdvance;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_def::AgentDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A generator that yields one direct tool call, then `STEP`, then ends.
    struct FixedPlan {
        cursor: AtomicUsize,
    }

    #[async_trait]
    impl StepGenerator for FixedPlan {
        async fn advance(&self, _resume: ResumeValue) -> StepAdvance {
            match self.cursor.fetch_add(1, Ordering::SeqCst) {
                0 => StepAdvance::Yield(StepYield::Tool {
                    tool_name: "read_files".to_string(),
                    input: serde_json::json!({"path": "a.txt"}),
                    include_tool_call: true,
                }),
                1 => StepAdvance::Yield(StepYield::Step),
                _ => StepAdvance::Done,
            }
        }
    }

    #[tokio::test]
    async fn advances_through_its_fixed_plan() {
        let plan = FixedPlan { cursor: AtomicUsize::new(0) };
        let def = Arc::new(AgentDefinition::new("a", "p", "m"));
        let state = AgentState::new_root(def);

        let resume = |s: &AgentState| ResumeValue {
            state: s.clone(),
            steps_complete: false,
            sub_agent_responses: None,
        };

        match plan.advance(resume(&state)).await {
            StepAdvance::Yield(StepYield::Tool { tool_name, .. }) => assert_eq!(tool_name, "read_files"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(plan.advance(resume(&state)).await, StepAdvance::Yield(StepYield::Step)));
        assert!(matches!(plan.advance(resume(&state)).await, StepAdvance::Done));
    }
}
