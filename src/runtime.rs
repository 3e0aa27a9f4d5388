//! The runtime: registries, public entry points, and the step loop.
//!
//! Corresponds to spec §4.1 ("Step Loop") and §6 ("Public operations
//! exposed by the runtime"). Grounded on the teacher's `Crew`/`Process`
//! orchestration loop for the overall shape of "own the registries, drive
//! one run to completion, fold sub-runs back in" — generalized from
//! CrewAI's task-list-driven crew execution to the spec's single-agent
//! step loop with an explicit 11-step algorithm, provider routing, and a
//! programmatic step generator escape hatch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agent_def::{AgentDefinition, OutputMode};
use crate::agent_registry::AgentRegistry;
use crate::cancel::CancelToken;
use crate::config::{ContextConfig, RuntimeConfig};
use crate::cost::{CostLimits, CostTracker, PricingTable, Usage as CostUsage};
use crate::error::{Result, RuntimeError};
use crate::events::{self, Event, EventSink};
use crate::message::{tags, Lifecycle, Message, TimeToLive, ToolCall, ToolContent};
use crate::provider::{CompletionRequest, Provider, ProviderRegistry, StreamChunk, StreamHandle};
use crate::pruner::{self, PruneTrigger};
use crate::rate_limiter::RateLimiter;
use crate::spawner::{self, SpawnOutcome, SpawnRequest, SpawnResult};
use crate::state::{AgentState, AgentStatus, ToolMeta};
use crate::step_generator::{ResumeValue, StepAdvance, StepYield};
use crate::tools::builtin::{self, EndTurnTool, SetOutputTool, TaskCompletedTool};
use crate::tools::{ProjectContext, Tool, ToolRegistry};
use crate::tracer::{SpanStatus, SpanType, Tracer};

/// The name a single "spawn a batch of children" tool call carries. Handled
/// by the runtime directly rather than through the generic `ToolRegistry`,
/// since it needs the agent registry, the depth/concurrency bounds, and a
/// recursive step-loop entry point that an ordinary `Tool` impl has no
/// access to (spec §4.4).
const SPAWN_AGENTS: &str = "spawn_agents";

/// The structured result of one `Runtime::run` call.
///
/// Corresponds to spec §4.1's "a structured result `{ success, message,
/// data? } | { error, message }`" — the `{error, message}` branch is
/// represented by `Runtime::run`'s `Err(RuntimeError)` instead, since it is
/// exactly spec §7's "catastrophic configuration errors ... escape to the
/// caller" case.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<Value>,
}

/// Corresponds to spec §6's `run(...) → {state, output, total_cost}`.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: AgentState,
    pub output: RunOutput,
    pub total_cost: f64,
}

/// Owns the process-wide registries and drives runs. One `Runtime` is
/// typically constructed once per process and shared (it is `Send + Sync`
/// via its `Arc`/`DashMap`-backed fields).
///
/// Corresponds to spec §5's "shared resources": provider/tool/agent
/// registries are read-mostly after start-up; the rate limiter and cost
/// tracker are shared across every run this `Runtime` drives (a deliberate
/// narrowing of spec §5's "per-run instances by default" — see DESIGN.md).
pub struct Runtime {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    agents: AgentRegistry,
    config: RuntimeConfig,
    cost_tracker: Arc<CostTracker>,
    rate_limiter: Arc<RateLimiter>,
    project_context: Arc<ProjectContext>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, pricing: PricingTable, project_context: ProjectContext) -> Self {
        let cost_limits = CostLimits {
            max_cost_per_run: config.cost.max_cost_per_run,
            max_cost_per_day: config.cost.max_cost_per_day,
            warning_fraction: None,
        };
        let rate_limiter = RateLimiter::new(config.rate_limit.into());

        let tools = ToolRegistry::new();
        tools.register(Arc::new(EndTurnTool)).expect("builtin end_turn registers once at construction");
        tools
            .register(Arc::new(TaskCompletedTool))
            .expect("builtin task_completed registers once at construction");
        tools.register(Arc::new(SetOutputTool)).expect("builtin set_output registers once at construction");

        Self {
            providers: ProviderRegistry::new(),
            tools,
            agents: AgentRegistry::new(),
            config,
            cost_tracker: Arc::new(CostTracker::new(pricing, cost_limits)),
            rate_limiter: Arc::new(rate_limiter),
            project_context: Arc::new(project_context),
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn Provider>) -> Result<()> {
        self.providers.register(provider)
    }

    pub fn set_fallback_provider(&self, provider: Arc<dyn Provider>) {
        self.providers.set_fallback(provider);
    }

    pub fn set_default_provider_name(&self, name: impl Into<String>) {
        self.providers.set_default_provider_name(name);
    }

    pub fn register_tool(&self, tool: Arc<dyn Tool>) -> Result<()> {
        self.tools.register(tool)
    }

    pub fn register_agent(&self, definition: Arc<AgentDefinition>) -> Result<()> {
        self.agents.register(definition)
    }

    /// Drive `definition` to completion on `prompt`.
    ///
    /// Corresponds to spec §6's `run(agent_definition, prompt, params?,
    /// cancel)`. `params?` has no defined shape in spec.md beyond "optional"
    /// and is left to a caller's own tool inputs / step-prompt templating
    /// rather than a field here (see DESIGN.md).
    pub async fn run(
        &self,
        definition: Arc<AgentDefinition>,
        prompt: Option<String>,
        cancel: CancelToken,
        sink: Option<EventSink>,
    ) -> Result<RunOutcome> {
        let mut state = AgentState::new_root(definition.clone());
        state.steps_remaining = self.config.max_steps;
        state = state.with_tool_metadata(self.tool_metadata_for(&definition));
        state = self.seed_prompt(state, prompt);

        let tracer = Tracer::new(state.agent_id.clone());
        let (final_state, output) = self.execute_loop(state, &tracer, cancel, sink.clone()).await?;
        let total_cost = final_state.credits_used;
        events::emit(
            sink.as_ref(),
            Event::RunComplete {
                agent_id: final_state.agent_id.clone(),
                output: final_state.output.clone(),
                total_cost,
            },
        );
        Ok(RunOutcome {
            state: final_state,
            output,
            total_cost,
        })
    }

    fn tool_metadata_for(&self, definition: &AgentDefinition) -> HashMap<String, ToolMeta> {
        self.tools
            .schemas_for(&self.visible_tool_names(definition))
            .into_iter()
            .map(|schema| {
                (
                    schema.name.clone(),
                    ToolMeta {
                        description: schema.description,
                        input_schema: schema.input_schema,
                    },
                )
            })
            .collect()
    }

    /// Names always offered to the provider regardless of the agent's own
    /// `tool_names` allow-list (spec §4.1 step 10's end-turn set is always
    /// present; `set_output` is the mechanism behind the generic "top-level
    /// `output` field" rule in step 9, so it is always callable too).
    fn visible_tool_names(&self, definition: &AgentDefinition) -> Vec<String> {
        let mut names = definition.tool_names.clone();
        for always in [builtin::names::END_TURN, builtin::names::TASK_COMPLETED, builtin::names::SET_OUTPUT] {
            if !names.iter().any(|n| n == always) {
                names.push(always.to_string());
            }
        }
        names
    }

    /// Whether any of `tool_calls` is in the end-turn set for `definition`
    /// (spec §4.1 step 10).
    fn ends_turn(&self, definition: &AgentDefinition, tool_calls: &[ToolCall]) -> bool {
        tool_calls.iter().any(|tc| {
            tc.tool_name == builtin::names::END_TURN
                || tc.tool_name == builtin::names::TASK_COMPLETED
                || (definition.set_output_ends_run && tc.tool_name == builtin::names::SET_OUTPUT)
        })
    }

    /// Inject the one-time instructions prompt and the initial user prompt
    /// into a freshly created state (spec §3/§4.1: the instructions prompt
    /// is tagged `INSTRUCTIONS_PROMPT` and never expires; the user prompt is
    /// tagged `USER_PROMPT`).
    fn seed_prompt(&self, mut state: AgentState, prompt: Option<String>) -> AgentState {
        if let Some(instructions) = state.definition.instructions_prompt.clone() {
            state = state.with_message(Message::user_with_lifecycle(
                instructions,
                Lifecycle::new().with_tag(tags::INSTRUCTIONS_PROMPT).with_ttl(TimeToLive::Forever).pinned(),
            ));
        }
        if let Some(prompt) = prompt {
            state = state.with_message(Message::user_with_lifecycle(
                prompt,
                Lifecycle::new().with_tag(tags::USER_PROMPT).with_ttl(TimeToLive::Forever),
            ));
        }
        state
    }

    /// Drive one agent state through the step loop to a terminal status.
    ///
    /// Used both for `run()`'s root state and, recursively, as each spawned
    /// child's entry point (spec §4.4: "spawning re-enters the step loop").
    /// Only a provider-routing failure escapes as `Err`; every other
    /// failure mode is folded into the returned state per spec §7.
    fn execute_loop<'a>(
        &'a self,
        mut state: AgentState,
        tracer: &'a Tracer,
        cancel: CancelToken,
        sink: Option<EventSink>,
    ) -> BoxFuture<'a, Result<(AgentState, RunOutput)>> {
        async move {
            let agent_span = tracer.start_span(state.definition.name.clone(), SpanType::Agent, HashMap::new());
            let mut bypass_generator = false;
            let mut step_number: u32 = 0;

            'steps: loop {
                step_number += 1;
                log::debug!("agent {} entering step {step_number} ({} remaining)", state.agent_id, state.steps_remaining);
                events::emit(
                    sink.as_ref(),
                    Event::StepStart {
                        step_number,
                        agent_id: state.agent_id.clone(),
                    },
                );
                let step_span = tracer.start_span(format!("step-{step_number}"), SpanType::Step, HashMap::new());

                if cancel.is_cancelled() {
                    log::debug!("agent {} cancelled at step {step_number}", state.agent_id);
                    state = state.with_status(AgentStatus::Cancelled);
                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                    break 'steps;
                }

                if state.steps_remaining == 0 {
                    log::warn!("agent {} hit its step limit at step {step_number}", state.agent_id);
                    events::emit(sink.as_ref(), Event::StepLimitReached { agent_id: state.agent_id.clone() });
                    state = state.with_status(AgentStatus::StepLimitReached);
                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                    break 'steps;
                }

                // Cost budget is the step loop's other hard stop (spec §5,
                // §4.8): exhausting it ends the run non-fatally with
                // whatever output already exists, exactly like the step
                // budget above.
                let admission = self.cost_tracker.check_admission(state.credits_used);
                if !admission.allowed {
                    let reason = admission.reason.unwrap_or_default();
                    log::warn!("agent {} hit its cost limit at step {step_number}: {reason}", state.agent_id);
                    events::emit(
                        sink.as_ref(),
                        Event::Error {
                            error: reason,
                            context: "cost_limit_reached".to_string(),
                        },
                    );
                    state = state.with_status(AgentStatus::CostLimitReached);
                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                    break 'steps;
                }

                // Step 2: programmatic step generator.
                if !bypass_generator {
                    if let Some(generator) = state.definition.step_generator.clone() {
                        let resume = ResumeValue {
                            state: state.clone(),
                            steps_complete: false,
                            sub_agent_responses: None,
                        };
                        match generator.advance(resume).await {
                            StepAdvance::Done => {
                                state = state.with_status(AgentStatus::Done);
                                tracer.end_span(&step_span, SpanStatus::Ok, None);
                                break 'steps;
                            }
                            StepAdvance::Yield(StepYield::Step) => {}
                            StepAdvance::Yield(StepYield::StepAll) => {
                                bypass_generator = true;
                            }
                            StepAdvance::Yield(StepYield::Tool {
                                tool_name,
                                input,
                                include_tool_call,
                            }) => {
                                state = self
                                    .run_direct_tool_yield(state, tracer, tool_name, input, include_tool_call, cancel.clone(), sink.clone())
                                    .await;
                                if state.is_terminal() {
                                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                                    break 'steps;
                                }
                                events::emit(sink.as_ref(), Event::StepEnd { step_number, should_continue: true });
                                tracer.end_span(&step_span, SpanStatus::Ok, None);
                                continue 'steps;
                            }
                        }
                    }
                }

                // Step 3: expire agent-step TTL messages.
                pruner::expire_ttl(&mut state.history, PruneTrigger::StepStart);

                // Step 4: per-step prompt.
                if let Some(step_prompt) = state.definition.step_prompt.clone() {
                    state = state.with_message(Message::user_with_lifecycle(
                        step_prompt,
                        Lifecycle::new().with_tag(tags::STEP_PROMPT).with_ttl(TimeToLive::AgentStep).pinned(),
                    ));
                }

                // Step 5: route the provider and build the outgoing request.
                let provider = match self.providers.route(&state.definition.model) {
                    Ok(provider) => provider,
                    Err(err) => {
                        tracer.end_span(&step_span, SpanStatus::Error, Some(err.to_string()));
                        tracer.end_span(&agent_span, SpanStatus::Error, Some(err.to_string()));
                        return Err(err);
                    }
                };

                self.enforce_context_budget(&mut state, cancel.clone()).await;

                let mut outgoing = Vec::with_capacity(state.history.len() + 1);
                outgoing.push(Message::system(state.effective_system_prompt.clone()));
                outgoing.extend(state.history.iter().cloned());
                let tool_schemas = self.tools.schemas_for(&self.visible_tool_names(&state.definition));

                log::debug!("agent {} sending {} messages to model {}", state.agent_id, outgoing.len(), state.definition.model);
                events::emit(
                    sink.as_ref(),
                    Event::LlmRequest {
                        model: state.definition.model.clone(),
                        message_count: outgoing.len(),
                    },
                );

                let request = CompletionRequest {
                    model: state.definition.model.clone(),
                    messages: outgoing,
                    tools: tool_schemas,
                    temperature: state.definition.temperature,
                    max_tokens: state.definition.max_tokens,
                    stop: Vec::new(),
                    cancel: cancel.clone(),
                };

                let _permit = self.rate_limiter.acquire().await;
                let llm_span = tracer.start_span("llm-call", SpanType::Llm, HashMap::new());

                // Step 6: open the streaming call.
                let stream = match provider.stream(request).await {
                    Ok(stream) => stream,
                    Err(message) => {
                        log::warn!("agent {} llm stream failed to start: {message}", state.agent_id);
                        events::emit(
                            sink.as_ref(),
                            Event::Error {
                                error: message.clone(),
                                context: "llm_stream_start".to_string(),
                            },
                        );
                        tracer.end_span(&llm_span, SpanStatus::Error, Some(message.clone()));
                        state = state.with_message(Message::user_with_lifecycle(
                            format!("[System] LLM error: {message}"),
                            Lifecycle::new().with_tag(tags::ERROR).with_ttl(TimeToLive::AgentStep),
                        ));
                        state = state.decrement_steps();
                        events::emit(sink.as_ref(), Event::StepEnd { step_number, should_continue: true });
                        tracer.end_span(&step_span, SpanStatus::Error, Some(message));
                        continue 'steps;
                    }
                };

                let model = state.definition.model.clone();
                let (outcome, usage_cost) = self.consume_stream(stream, &model, tracer, &llm_span, &cancel, sink.as_ref()).await;
                state = state.add_credits(usage_cost);
                tracer.end_span(&llm_span, SpanStatus::Ok, None);

                // Step 7: append the assistant message.
                log::debug!(
                    "agent {} received response with {} tool call(s)",
                    state.agent_id,
                    outcome.tool_calls.len()
                );
                state = state.with_message(Message::assistant(outcome.text.clone(), outcome.tool_calls.clone()));
                events::emit(
                    sink.as_ref(),
                    Event::LlmResponse {
                        content: outcome.text,
                        tool_calls: outcome.tool_calls.clone(),
                        usage: None,
                    },
                );

                if outcome.cancelled {
                    state = state.with_status(AgentStatus::Cancelled);
                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                    break 'steps;
                }

                // Step 8: no tool calls ends the turn.
                if outcome.tool_calls.is_empty() {
                    state = state.with_status(AgentStatus::Done);
                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                    break 'steps;
                }

                // Step 9: dispatch tool calls.
                let (tool_messages, spawn_cost) = self
                    .dispatch_tool_calls(&state, &outcome.tool_calls, tracer, Some(&step_span), cancel.clone(), sink.clone())
                    .await;
                state = state.add_credits(spawn_cost);
                for msg in &tool_messages {
                    if let Message::Tool { content, .. } = msg {
                        if let Some(output) = content.output_field() {
                            state = state.with_output(output);
                        }
                    }
                }
                state = state.with_messages(tool_messages);

                // Step 10: end-turn set.
                if self.ends_turn(&state.definition, &outcome.tool_calls) {
                    state = state.with_status(AgentStatus::Done);
                    tracer.end_span(&step_span, SpanStatus::Ok, None);
                    break 'steps;
                }

                // Step 11: decrement and loop.
                state = state.decrement_steps();
                events::emit(sink.as_ref(), Event::StepEnd { step_number, should_continue: true });
                tracer.end_span(&step_span, SpanStatus::Ok, None);
            }

            tracer.end_span(&agent_span, SpanStatus::Ok, None);
            let output = self.finish(&state);
            Ok((state, output))
        }
        .boxed()
    }

    /// Run a single direct tool yield from a programmatic step generator
    /// (spec §4.2): synthesize a tool-call id, dispatch exactly that tool,
    /// and — unless `include_tool_call` is false — append both the
    /// synthetic assistant tool-call message and its result.
    async fn run_direct_tool_yield(
        &self,
        mut state: AgentState,
        tracer: &Tracer,
        tool_name: String,
        input: Value,
        include_tool_call: bool,
        cancel: CancelToken,
        sink: Option<EventSink>,
    ) -> AgentState {
        let tool_call = ToolCall {
            tool_call_id: Uuid::new_v4().to_string(),
            tool_name,
            input,
        };
        let (messages, spawn_cost) = self
            .dispatch_tool_calls(&state, std::slice::from_ref(&tool_call), tracer, None, cancel, sink)
            .await;
        state = state.add_credits(spawn_cost);
        for msg in &messages {
            if let Message::Tool { content, .. } = msg {
                if let Some(output) = content.output_field() {
                    state = state.with_output(output);
                }
            }
        }
        if include_tool_call {
            state = state.with_message(Message::assistant(String::new(), vec![tool_call.clone()]));
            state = state.with_messages(messages);
        }
        if self.ends_turn(&state.definition, std::slice::from_ref(&tool_call)) {
            state = state.with_status(AgentStatus::Done);
        }
        state
    }

    /// Dispatch a batch of tool calls, handling `spawn_agents` calls
    /// through the spawner and everything else through the generic
    /// executor, preserving the original request order. Returns the
    /// tool-result messages and the total USD cost incurred by any spawned
    /// sub-agents.
    async fn dispatch_tool_calls(
        &self,
        state: &AgentState,
        tool_calls: &[ToolCall],
        tracer: &Tracer,
        parent_span: Option<&str>,
        cancel: CancelToken,
        sink: Option<EventSink>,
    ) -> (Vec<Message>, f64) {
        log::debug!("agent {} dispatching {} tool call(s)", state.agent_id, tool_calls.len());
        let mut results: Vec<Option<Message>> = (0..tool_calls.len()).map(|_| None).collect();
        let mut regular = Vec::new();
        let mut regular_indices = Vec::new();
        let mut spawn_cost = 0.0;

        for (index, call) in tool_calls.iter().enumerate() {
            if call.tool_name == SPAWN_AGENTS {
                events::emit(
                    sink.as_ref(),
                    Event::ToolStart {
                        tool_name: call.tool_name.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        input: call.input.clone(),
                    },
                );
                let tool_span = tracer.start_span_with_parent(
                    parent_span,
                    call.tool_name.clone(),
                    SpanType::Tool,
                    HashMap::from([("tool_name".to_string(), json!(call.tool_name))]),
                );
                let (message, cost) = self.handle_spawn_call(state, call, tracer, cancel.clone(), sink.clone()).await;
                spawn_cost += cost;
                if let Message::Tool { content, .. } = &message {
                    events::emit(
                        sink.as_ref(),
                        Event::ToolResult {
                            tool_call_id: call.tool_call_id.clone(),
                            result: match content {
                                ToolContent::Json(v) => v.clone(),
                                ToolContent::Text(t) => json!(t),
                            },
                        },
                    );
                }
                tracer.end_span(&tool_span, SpanStatus::Ok, None);
                results[index] = Some(message);
            } else {
                regular_indices.push(index);
                regular.push(call.clone());
            }
        }

        if !regular.is_empty() {
            let messages = crate::tools::executor::dispatch(
                &regular,
                &self.tools,
                &state.definition.permission_policy,
                self.project_context.clone(),
                &state.agent_id,
                state,
                cancel,
                sink,
                tracer,
                parent_span,
            )
            .await;
            for (index, message) in regular_indices.into_iter().zip(messages) {
                results[index] = Some(message);
            }
        }

        let messages = results.into_iter().map(|m| m.expect("every tool call produced exactly one result")).collect();
        (messages, spawn_cost)
    }

    /// Resolve and run one `spawn_agents` tool call's batch of requests.
    ///
    /// Input shape: `{"requests": [{"agent_id", "prompt"?}, ...]}`. An
    /// unresolvable `agent_id` fails that one request (spec §7: "unknown
    /// agent id ... returned as a failed `SpawnResult`") without touching
    /// the rest of the batch.
    async fn handle_spawn_call(
        &self,
        parent: &AgentState,
        call: &ToolCall,
        tracer: &Tracer,
        cancel: CancelToken,
        sink: Option<EventSink>,
    ) -> (Message, f64) {
        let requests_json = call.input.get("requests").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut outcomes: Vec<Option<SpawnOutcome>> = (0..requests_json.len()).map(|_| None).collect();
        let mut resolved = Vec::new();
        let mut resolved_positions = Vec::new();

        for (index, request) in requests_json.iter().enumerate() {
            let agent_id = request.get("agent_id").and_then(Value::as_str).unwrap_or_default().to_string();
            match self.agents.get(&agent_id) {
                Some(definition) => {
                    let mut spawn_request = SpawnRequest::new(definition);
                    if let Some(prompt) = request.get("prompt").and_then(Value::as_str) {
                        spawn_request = spawn_request.with_initial_message(Message::user(prompt));
                    }
                    resolved.push(spawn_request);
                    resolved_positions.push(index);
                }
                None => {
                    outcomes[index] = Some(SpawnOutcome {
                        run_id: String::new(),
                        agent_id: agent_id.clone(),
                        name: agent_id.clone(),
                        status: AgentStatus::Failed,
                        output: None,
                        error: Some(format!("unknown agent id '{agent_id}'")),
                        cost: 0.0,
                    });
                }
            }
        }

        let mut spawn_cost = 0.0;
        if !resolved.is_empty() {
            let run_child = move |child_state: AgentState, child_cancel: CancelToken| {
                let sink = sink.clone();
                async move {
                    let fallback = child_state.clone();
                    match self.execute_loop(child_state, tracer, child_cancel, sink).await {
                        Ok((state, _output)) => {
                            let cost = state.credits_used;
                            (state, cost)
                        }
                        Err(err) => (
                            fallback.with_status(AgentStatus::Failed).with_output(json!({ "error": err.to_string() })),
                            0.0,
                        ),
                    }
                }
            };

            let spawn_result = spawner::spawn_agents(
                parent,
                resolved,
                self.config.max_concurrent_agents,
                self.config.max_agent_depth,
                cancel,
                run_child,
            )
            .await
            .expect("spawn_agents only fails fatally on depth overflow, which it reports as a per-request outcome");

            spawn_cost = spawn_result.total_cost();
            for (position, outcome) in resolved_positions.into_iter().zip(spawn_result.outcomes) {
                outcomes[position] = Some(outcome);
            }
        }

        let outcomes: Vec<SpawnOutcome> = outcomes.into_iter().map(|o| o.expect("every request produced exactly one outcome")).collect();
        let folded = SpawnResult { outcomes }.fold_into_value();
        let message = Message::tool_result(call.tool_name.clone(), call.tool_call_id.clone(), ToolContent::Json(folded));
        (message, spawn_cost)
    }

    /// Consume a provider's stream to completion (or until cancelled),
    /// accumulating text, tool calls, and usage-derived cost (spec §4.1
    /// step 6).
    async fn consume_stream(
        &self,
        mut stream: Box<dyn StreamHandle>,
        model: &str,
        tracer: &Tracer,
        llm_span: &str,
        cancel: &CancelToken,
        sink: Option<&EventSink>,
    ) -> (StreamOutcome, f64) {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut cancelled = false;
        let mut total_cost = 0.0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    None
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };

            match chunk {
                StreamChunk::Text { content } => {
                    text.push_str(&content);
                    events::emit(sink, Event::LlmText { text: content });
                }
                StreamChunk::ToolCallStart { .. } | StreamChunk::ToolCallDelta { .. } => {}
                StreamChunk::ToolCallEnd { tool_call } => tool_calls.push(tool_call),
                StreamChunk::Usage { usage } => {
                    let cost = self.cost_tracker.record_usage(
                        model,
                        CostUsage {
                            prompt_tokens: usage.prompt_tokens,
                            completion_tokens: usage.completion_tokens,
                        },
                    );
                    total_cost += cost;
                    tracer.add_event(
                        llm_span,
                        "usage",
                        HashMap::from([
                            ("total_tokens".to_string(), json!(usage.total_tokens)),
                            ("cost".to_string(), json!(cost)),
                        ]),
                    );
                }
                StreamChunk::Done { .. } => break,
            }

            if cancelled {
                break;
            }
        }

        (StreamOutcome { text, tool_calls, cancelled }, total_cost)
    }

    /// Apply the pruner when the outgoing history exceeds `max_tokens`
    /// (spec §4.5): summarize via `summary_model` if configured and
    /// reachable, otherwise fall back to truncation.
    async fn enforce_context_budget(&self, state: &mut AgentState, cancel: CancelToken) {
        let cfg: ContextConfig = self.config.context.clone();
        if !pruner::over_budget(&state.history, &cfg) {
            return;
        }
        let selected = pruner::select_for_pruning(&state.history, &cfg);
        if selected.is_empty() {
            return;
        }
        log::debug!(
            "agent {} context over budget, pruning {} message(s)",
            state.agent_id,
            selected.len()
        );

        if let Some(summary_model) = cfg.summary_model.clone() {
            if let Ok(provider) = self.providers.route(&summary_model) {
                let prunable_text = selected
                    .iter()
                    .filter_map(|&index| state.history.get(index))
                    .map(message_text)
                    .collect::<Vec<_>>()
                    .join("\n");
                let request = CompletionRequest {
                    model: summary_model,
                    messages: vec![
                        Message::system("Summarize the conversation so far concisely, preserving facts needed to continue the task."),
                        Message::user(prunable_text),
                    ],
                    tools: Vec::new(),
                    temperature: None,
                    max_tokens: None,
                    stop: Vec::new(),
                    cancel,
                };
                if let Ok(response) = provider.complete(request).await {
                    pruner::summarize(&mut state.history, &selected, response.content);
                    return;
                }
                log::warn!("agent {} summary model call failed, falling back to truncation", state.agent_id);
            }
        }
        pruner::truncate(&mut state.history, &selected);
    }

    /// Select the final `RunOutput` once the loop has reached a terminal
    /// status (spec §4.1's "Termination & output selection").
    fn finish(&self, state: &AgentState) -> RunOutput {
        if let Some(data) = state.output.clone() {
            return RunOutput {
                success: true,
                message: Some("Agent completed with output".to_string()),
                data: Some(data),
            };
        }
        match state.definition.output_mode {
            OutputMode::LastMessage => RunOutput {
                success: true,
                message: last_assistant_text(&state.history),
                data: None,
            },
            OutputMode::AllMessages => RunOutput {
                success: true,
                message: Some(
                    state
                        .history
                        .iter()
                        .filter_map(|m| match m {
                            Message::Assistant { content, .. } if !content.is_empty() => Some(content.clone()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                data: None,
            },
            OutputMode::StructuredOutput => RunOutput {
                success: true,
                message: None,
                data: None,
            },
        }
    }
}

/// What one streamed LLM call produced.
struct StreamOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    cancelled: bool,
}

fn last_assistant_text(history: &[Message]) -> Option<String> {
    history.iter().rev().find_map(|m| match m {
        Message::Assistant { content, .. } if !content.is_empty() => Some(content.clone()),
        _ => None,
    })
}

fn message_text(msg: &Message) -> String {
    match msg {
        Message::System { content } => content.clone(),
        Message::User { content, .. } => content.as_text(),
        Message::Assistant { content, .. } => content.clone(),
        Message::Tool { content, .. } => content.as_text(),
    }
}
