//! The event stream a caller observes during a run.
//!
//! Corresponds to spec §6 ("Event stream") and the ordering guarantee in
//! §5 ("Events ... are emitted in the causal order they occur within the
//! loop; the event sink is expected to be non-blocking"). Deliberately a
//! plain per-run channel rather than the teacher's process-wide
//! `CrewAIEventsBus` singleton — see DESIGN.md for why.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::ToolCall;

/// A tool-emitted side-band event, forwarded inside `Event::ToolEvent`.
///
/// Corresponds to spec §4.3 ("an `emit` function for side-band events
/// (progress, file-changed, command-output)").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolSideEvent {
    Progress { message: String },
    FileChanged { path: String },
    CommandOutput { stream: String, chunk: String },
}

/// One entry in the ordered event stream delivered to the caller's sink.
///
/// Corresponds to spec §6's event table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StepStart {
        step_number: u32,
        agent_id: String,
    },
    StepEnd {
        step_number: u32,
        should_continue: bool,
    },
    LlmRequest {
        model: String,
        message_count: usize,
    },
    LlmText {
        text: String,
    },
    LlmResponse {
        content: String,
        tool_calls: Vec<ToolCall>,
        usage: Option<Value>,
    },
    ToolStart {
        tool_name: String,
        tool_call_id: String,
        input: Value,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
    },
    ToolEvent {
        tool_call_id: String,
        event: ToolSideEvent,
    },
    Error {
        error: String,
        context: String,
    },
    StepLimitReached {
        agent_id: String,
    },
    RunComplete {
        agent_id: String,
        output: Option<Value>,
        total_cost: f64,
    },
}

/// The sink a caller supplies to observe a run's event stream.
///
/// An `UnboundedSender` keeps `emit` non-blocking per spec §5; a dropped
/// receiver (caller no longer listening) is not an error for the loop.
pub type EventSink = tokio::sync::mpsc::UnboundedSender<Event>;

/// Send an event, silently ignoring a disconnected receiver.
pub fn emit(sink: Option<&EventSink>, event: Event) {
    if let Some(sink) = sink {
        let _ = sink.send(event);
    }
}
