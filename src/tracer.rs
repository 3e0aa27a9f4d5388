//! Per-run span tree tracer.
//!
//! Corresponds to spec §4.9. Grounded on the teacher's
//! `telemetry::Telemetry::create_span` / `SpanHandle`, generalized from a
//! single flat handle into a tree with parent/child linkage, span types,
//! timestamped events, and the `summary` aggregation spec.md requires.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    Agent,
    Step,
    Llm,
    Tool,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp_ms: u128,
    pub attributes: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub span_type: SpanType,
    pub attributes: HashMap<String, Value>,
    pub events: Vec<SpanEvent>,
    pub start_ms: u128,
    pub end_ms: Option<u128>,
    pub status: Option<SpanStatus>,
    pub error: Option<String>,
}

impl Span {
    pub fn duration_ms(&self) -> Option<u128> {
        self.end_ms.map(|end| end.saturating_sub(self.start_ms))
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

struct TracerState {
    trace_id: String,
    agent_id: String,
    start_ms: u128,
    open_stack: Vec<String>,
    spans: HashMap<String, Span>,
    order: Vec<String>,
}

/// A per-run tracer: a tree of spans plus a rolling stack of "currently
/// open" spans so `start_span` can nest under whatever is open.
///
/// Corresponds to spec §4.9's `start_span`/`end_span` pair.
#[derive(Clone)]
pub struct Tracer {
    state: Arc<Mutex<TracerState>>,
}

impl Tracer {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TracerState {
                trace_id: Uuid::new_v4().to_string(),
                agent_id: agent_id.into(),
                start_ms: now_ms(),
                open_stack: Vec::new(),
                spans: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    /// Open a new span whose parent is whatever span is currently open
    /// (or none, for a root span). Returns the new span's id.
    pub fn start_span(
        &self,
        name: impl Into<String>,
        span_type: SpanType,
        attributes: HashMap<String, Value>,
    ) -> String {
        let mut state = self.state.lock();
        let id = Uuid::new_v4().to_string();
        let parent_id = state.open_stack.last().cloned();
        let span = Span {
            id: id.clone(),
            parent_id,
            name: name.into(),
            span_type,
            attributes,
            events: Vec::new(),
            start_ms: now_ms(),
            end_ms: None,
            status: None,
            error: None,
        };
        state.order.push(id.clone());
        state.spans.insert(id.clone(), span);
        state.open_stack.push(id.clone());
        id
    }

    /// Open a span under an explicit parent, bypassing the open-stack that
    /// `start_span` uses to infer nesting. Needed wherever spans are opened
    /// from concurrently-running tasks (parallel tool dispatch, concurrent
    /// sub-agent spawns) — inferring "current" from a shared stack would
    /// race when two such tasks call `start_span` at once.
    pub fn start_span_with_parent(
        &self,
        parent_id: Option<&str>,
        name: impl Into<String>,
        span_type: SpanType,
        attributes: HashMap<String, Value>,
    ) -> String {
        let mut state = self.state.lock();
        let id = Uuid::new_v4().to_string();
        let span = Span {
            id: id.clone(),
            parent_id: parent_id.map(str::to_string),
            name: name.into(),
            span_type,
            attributes,
            events: Vec::new(),
            start_ms: now_ms(),
            end_ms: None,
            status: None,
            error: None,
        };
        state.order.push(id.clone());
        state.spans.insert(id.clone(), span);
        id
    }

    /// Record a timestamped event against the given span, if it is still open.
    pub fn add_event(&self, span_id: &str, name: impl Into<String>, attributes: HashMap<String, Value>) {
        let mut state = self.state.lock();
        if let Some(span) = state.spans.get_mut(span_id) {
            span.events.push(SpanEvent {
                name: name.into(),
                timestamp_ms: now_ms(),
                attributes,
            });
        }
    }

    /// Close a span and pop it (and its open descendants, if any leaked)
    /// off the open stack, restoring the parent as "current".
    pub fn end_span(&self, span_id: &str, status: SpanStatus, error: Option<String>) {
        let mut state = self.state.lock();
        let end = now_ms();
        if let Some(span) = state.spans.get_mut(span_id) {
            span.end_ms = Some(end);
            span.status = Some(status);
            span.error = error;
        }
        if let Some(pos) = state.open_stack.iter().rposition(|id| id == span_id) {
            state.open_stack.truncate(pos);
        }
    }

    /// Produce the JSON export document described in spec §4.9.
    pub fn export(&self) -> TraceExport {
        let state = self.state.lock();
        let end_ms = now_ms();
        let spans: Vec<Span> = state.order.iter().filter_map(|id| state.spans.get(id).cloned()).collect();
        let summary = summarize(&spans);
        TraceExport {
            trace_id: state.trace_id.clone(),
            agent_id: state.agent_id.clone(),
            start_ms: state.start_ms,
            end_ms,
            duration_ms: end_ms.saturating_sub(state.start_ms),
            spans,
            summary,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSummary {
    pub count: u64,
    pub total_duration_ms: u128,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub step_count: u64,
    pub llm_call_count: u64,
    pub tool_call_count: u64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub per_tool: HashMap<String, ToolSummary>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExport {
    pub trace_id: String,
    pub agent_id: String,
    pub start_ms: u128,
    pub end_ms: u128,
    pub duration_ms: u128,
    pub spans: Vec<Span>,
    pub summary: TraceSummary,
}

fn summarize(spans: &[Span]) -> TraceSummary {
    let mut summary = TraceSummary::default();
    for span in spans {
        match span.span_type {
            SpanType::Step => summary.step_count += 1,
            SpanType::Llm => {
                summary.llm_call_count += 1;
                // `consume_stream` records one "usage" event per `usage`
                // chunk on this span (a call may stream several), not a
                // span attribute — sum across all of them.
                for event in &span.events {
                    if event.name != "usage" {
                        continue;
                    }
                    if let Some(tokens) = event.attributes.get("total_tokens").and_then(|v| v.as_i64()) {
                        summary.total_tokens += tokens;
                    }
                    if let Some(cost) = event.attributes.get("cost").and_then(|v| v.as_f64()) {
                        summary.total_cost += cost;
                    }
                }
            }
            SpanType::Tool => {
                summary.tool_call_count += 1;
                let name = span
                    .attributes
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let entry = summary.per_tool.entry(name).or_default();
                entry.count += 1;
                entry.total_duration_ms += span.duration_ms().unwrap_or(0);
            }
            SpanType::Agent | SpanType::Custom => {}
        }
        if let Some(err) = &span.error {
            summary.errors.push(err.clone());
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_spans_restore_parent() {
        let tracer = Tracer::new("agent-1");
        let step = tracer.start_span("step-1", SpanType::Step, HashMap::new());
        let llm = tracer.start_span("llm-call", SpanType::Llm, HashMap::new());
        tracer.end_span(&llm, SpanStatus::Ok, None);
        let tool = tracer.start_span("tool-call", SpanType::Tool, HashMap::new());
        tracer.end_span(&tool, SpanStatus::Ok, None);
        tracer.end_span(&step, SpanStatus::Ok, None);

        let export = tracer.export();
        assert_eq!(export.spans.len(), 3);
        assert_eq!(export.summary.step_count, 1);
        assert_eq!(export.summary.llm_call_count, 1);
        assert_eq!(export.summary.tool_call_count, 1);

        let llm_span = export.spans.iter().find(|s| s.id == llm).unwrap();
        assert_eq!(llm_span.parent_id.as_deref(), Some(step.as_str()));
    }

    #[test]
    fn usage_events_roll_up_into_summary_tokens_and_cost() {
        let tracer = Tracer::new("agent-1");
        let llm = tracer.start_span("llm-call", SpanType::Llm, HashMap::new());
        tracer.add_event(
            &llm,
            "usage",
            HashMap::from([("total_tokens".to_string(), Value::from(10)), ("cost".to_string(), Value::from(0.02))]),
        );
        tracer.add_event(
            &llm,
            "usage",
            HashMap::from([("total_tokens".to_string(), Value::from(5)), ("cost".to_string(), Value::from(0.01))]),
        );
        tracer.end_span(&llm, SpanStatus::Ok, None);

        let export = tracer.export();
        assert_eq!(export.summary.total_tokens, 15);
        assert!((export.summary.total_cost - 0.03).abs() < 1e-9);
    }

    #[test]
    fn errors_are_collected_in_summary() {
        let tracer = Tracer::new("agent-1");
        let id = tracer.start_span("tool-call", SpanType::Tool, HashMap::new());
        tracer.end_span(&id, SpanStatus::Error, Some("boom".to_string()));
        let export = tracer.export();
        assert_eq!(export.summary.errors, vec!["boom".to_string()]);
    }
}
