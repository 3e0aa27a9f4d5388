//! Tool call dispatch.
//!
//! Corresponds to spec §4.3's dispatch rule: tools marked
//! `requires_sequential` run one at a time, in request order; every other
//! tool call in the batch runs concurrently. Errors — permission refusals,
//! unknown tool names, a tool's own `Err` return, or a panic inside
//! `execute` — become tool-result messages, never propagated failures.
//! Results are returned in the original request order regardless of which
//! future actually finished first.

use futures::future::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::permissions::{PermissionChecker, PermissionPolicy};
use super::{ProjectContext, Tool, ToolContext, ToolRegistry};
use crate::cancel::CancelToken;
use crate::events::{Event, EventSink};
use crate::message::{Message, ToolCall, ToolContent};
use crate::state::AgentState;
use crate::tracer::{SpanStatus, SpanType, Tracer};
use serde_json::json;
use std::collections::HashMap;

/// One tool call's outcome before it's folded into a `Message::Tool`.
struct Outcome {
    index: usize,
    tool_name: String,
    tool_call_id: String,
    result: Result<serde_json::Value, String>,
}

/// Run a batch of tool calls to completion and return their results as
/// `Message::Tool` entries, in the same order as `calls`.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch(
    calls: &[ToolCall],
    registry: &ToolRegistry,
    policy: &PermissionPolicy,
    project_context: Arc<ProjectContext>,
    agent_id: &str,
    state: &AgentState,
    cancel: CancelToken,
    sink: Option<EventSink>,
    tracer: &Tracer,
    parent_span: Option<&str>,
) -> Vec<Message> {
    let mut sequential_indices = Vec::new();
    let mut parallel_futures = Vec::new();
    let mut outcomes: Vec<Option<Outcome>> = (0..calls.len()).map(|_| None).collect();

    for (index, call) in calls.iter().enumerate() {
        match registry.get(&call.tool_name) {
            None => {
                outcomes[index] = Some(Outcome {
                    index,
                    tool_name: call.tool_name.clone(),
                    tool_call_id: call.tool_call_id.clone(),
                    result: Err(format!("Unknown tool: {}", call.tool_name)),
                });
            }
            Some(tool) => {
                if let Err(reason) = PermissionChecker::check(policy, &tool.permissions(), &call.input) {
                    outcomes[index] = Some(Outcome {
                        index,
                        tool_name: call.tool_name.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        result: Err(reason),
                    });
                } else if tool.requires_sequential() {
                    sequential_indices.push(index);
                } else {
                    parallel_futures.push(run_one(
                        index,
                        tool,
                        call.clone(),
                        project_context.clone(),
                        agent_id.to_string(),
                        state.clone(),
                        cancel.clone(),
                        sink.clone(),
                        tracer.clone(),
                        parent_span.map(str::to_string),
                    ));
                }
            }
        }
    }

    for outcome in futures::future::join_all(parallel_futures).await {
        let index = outcome.index;
        outcomes[index] = Some(outcome);
    }

    for index in sequential_indices {
        let call = &calls[index];
        if cancel.is_cancelled() {
            // Spec §4.3/§5: a cancellation mid-dispatch skips pending
            // sequential calls rather than running them.
            outcomes[index] = Some(Outcome {
                index,
                tool_name: call.tool_name.clone(),
                tool_call_id: call.tool_call_id.clone(),
                result: Err("cancelled".to_string()),
            });
            continue;
        }
        // Registry membership and permissions were already checked above;
        // re-fetch since `get` returns a fresh `Arc` clone.
        let tool = registry.get(&call.tool_name).expect("checked above");
        let outcome = run_one(
            index,
            tool,
            call.clone(),
            project_context.clone(),
            agent_id.to_string(),
            state.clone(),
            cancel.clone(),
            sink.clone(),
            tracer.clone(),
            parent_span.map(str::to_string),
        )
        .await;
        outcomes[index] = Some(outcome);
    }

    outcomes
        .into_iter()
        .map(|o| o.expect("every index produced exactly one outcome"))
        .map(|outcome| {
            let content = match outcome.result {
                Ok(value) => ToolContent::Json(value),
                Err(message) => ToolContent::Json(serde_json::json!({ "error": message })),
            };
            Message::tool_result(outcome.tool_name, outcome.tool_call_id, content)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    index: usize,
    tool: Arc<dyn Tool>,
    call: ToolCall,
    project_context: Arc<ProjectContext>,
    agent_id: String,
    state: AgentState,
    cancel: CancelToken,
    sink: Option<EventSink>,
    tracer: Tracer,
    parent_span: Option<String>,
) -> Outcome {
    crate::events::emit(
        sink.as_ref(),
        Event::ToolStart {
            tool_name: call.tool_name.clone(),
            tool_call_id: call.tool_call_id.clone(),
            input: call.input.clone(),
        },
    );

    let tool_span = tracer.start_span_with_parent(
        parent_span.as_deref(),
        call.tool_name.clone(),
        SpanType::Tool,
        HashMap::from([("tool_name".to_string(), json!(call.tool_name))]),
    );

    let ctx = ToolContext::new(
        call.input.clone(),
        call.tool_call_id.clone(),
        agent_id,
        state,
        project_context,
        cancel,
        sink.clone(),
    );

    let result = match AssertUnwindSafe(tool.execute(ctx)).catch_unwind().await {
        Ok(inner) => inner,
        Err(panic) => Err(panic_message(panic)),
    };

    if let Err(message) = &result {
        log::warn!("tool {} ({}) failed: {message}", call.tool_name, call.tool_call_id);
        tracer.end_span(&tool_span, SpanStatus::Error, Some(message.clone()));
    } else {
        log::debug!("tool {} ({}) completed", call.tool_name, call.tool_call_id);
        tracer.end_span(&tool_span, SpanStatus::Ok, None);
    }

    crate::events::emit(
        sink.as_ref(),
        Event::ToolResult {
            tool_call_id: call.tool_call_id.clone(),
            result: result.clone().unwrap_or_else(|e| serde_json::json!({ "error": e })),
        },
    );

    Outcome {
        index,
        tool_name: call.tool_name,
        tool_call_id: call.tool_call_id,
        result,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("tool panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("tool panicked: {s}")
    } else {
        "tool panicked".to_string()
    }
}
