//! The sub-agent spawner.
//!
//! Corresponds to spec §4.4 ("Spawner"). `spawn_agents` is the one
//! primitive: given a parent's state and a batch of child definitions, it
//! enforces `max_agent_depth`, schedules children with at most
//! `max_concurrent_agents` running at once, inherits the parent's
//! cancellation token, and folds the children's final states into a
//! `SpawnResult`. The spawner does not know how to run a single agent to
//! completion — that's `Runtime::run`'s job, passed in here as `run_child`
//! — so a sub-agent run and a root run share exactly one step-loop
//! implementation (spec §4.4: spawning re-enters the step loop, it is not
//! a special case of it).
//!
//! Grounded on the teacher's `Process`/`Crew` hierarchical-execution
//! pattern for the idea of bounding concurrent children, generalized from
//! CrewAI's manager-agent delegation model to the spec's flat batch-spawn
//! primitive with an explicit depth bound.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::agent_def::AgentDefinition;
use crate::cancel::CancelToken;
use crate::error::{Result, RuntimeError};
use crate::message::Message;
use crate::state::{AgentState, AgentStatus};

/// One child to spawn: its blueprint, and an optional seed message (e.g.
/// the sub-task description) appended to its otherwise-empty history
/// before it starts.
pub struct SpawnRequest {
    pub definition: Arc<AgentDefinition>,
    pub initial_message: Option<Message>,
}

impl SpawnRequest {
    pub fn new(definition: Arc<AgentDefinition>) -> Self {
        Self {
            definition,
            initial_message: None,
        }
    }

    #[must_use]
    pub fn with_initial_message(mut self, message: Message) -> Self {
        self.initial_message = Some(message);
        self
    }
}

/// A single child's final outcome, independent of how it got there.
#[derive(Debug, Clone)]
pub struct SpawnOutcome {
    pub run_id: String,
    pub agent_id: String,
    pub name: String,
    pub status: AgentStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub cost: f64,
}

/// The folded result of a batch spawn, in original request order
/// regardless of completion order.
#[derive(Debug, Clone)]
pub struct SpawnResult {
    pub outcomes: Vec<SpawnOutcome>,
}

impl SpawnResult {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| matches!(o.status, AgentStatus::Done))
    }

    pub fn total_cost(&self) -> f64 {
        self.outcomes.iter().map(|o| o.cost).sum()
    }

    /// Fold the batch's outcomes into a single JSON value, the shape a
    /// spawn-capable tool hands back as its own tool-result payload (spec
    /// §4.4: "the returned output, success flag, error message and cost
    /// are folded into the parent's `spawn_agents` tool result").
    pub fn fold_into_value(&self) -> Value {
        Value::Array(
            self.outcomes
                .iter()
                .map(|o| {
                    serde_json::json!({
                        "run_id": o.run_id,
                        "agent_id": o.agent_id,
                        "name": o.name,
                        "success": matches!(o.status, AgentStatus::Done),
                        "status": status_label(o.status),
                        "output": o.output,
                        "error": o.error,
                        "cost": o.cost,
                    })
                })
                .collect(),
        )
    }
}

fn status_label(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Running => "running",
        AgentStatus::Done => "done",
        AgentStatus::StepLimitReached => "step_limit_reached",
        AgentStatus::CostLimitReached => "cost_limit_reached",
        AgentStatus::Cancelled => "cancelled",
        AgentStatus::Failed => "failed",
    }
}

/// Construct the immediate-failure outcome for a request that can't be
/// spawned at all (depth exceeded, unknown agent id) — spec §4.4/§7:
/// "returned as a failed `SpawnResult` inside the `spawn_agents` tool
/// result", at zero cost, never aborting sibling requests.
pub fn depth_exceeded_outcome(definition: &AgentDefinition, max_agent_depth: u32) -> SpawnOutcome {
    SpawnOutcome {
        run_id: String::new(),
        agent_id: definition.id.clone(),
        name: definition.name.clone(),
        status: AgentStatus::Failed,
        output: None,
        error: Some(format!("Max agent depth ({max_agent_depth}) exceeded")),
        cost: 0.0,
    }
}

/// Spawn and run a batch of child agents under `parent`.
///
/// `run_child` drives one child's `AgentState` to a terminal status and
/// reports the cost it accumulated; it is the caller's step-loop entry
/// point, invoked once per child. At most `max_concurrent_agents` children
/// run at a time: the rest are scheduled as earlier ones finish (spec
/// §4.4's batched scheduling, not a strict barrier between batches).
///
/// If spawning at the parent's depth + 1 would reach or exceed
/// `max_agent_depth` (spec §4.4: "if the current depth equals the limit,
/// every request in the batch fails immediately"), every request in the
/// batch fails immediately at zero cost rather than returning `Err` — per
/// spec §4.4, this is a per-request outcome inside the batch result, not a
/// fatal error for the caller.
pub async fn spawn_agents<F, Fut>(
    parent: &AgentState,
    requests: Vec<SpawnRequest>,
    max_concurrent_agents: usize,
    max_agent_depth: u32,
    cancel: CancelToken,
    run_child: F,
) -> Result<SpawnResult>
where
    F: Fn(AgentState, CancelToken) -> Fut,
    Fut: Future<Output = (AgentState, f64)>,
{
    let child_depth = parent.depth() + 1;
    if child_depth >= max_agent_depth {
        log::warn!(
            "agent {} refusing to spawn {} child(ren) at depth {child_depth} (max {max_agent_depth})",
            parent.agent_id,
            requests.len()
        );
        let outcomes = requests
            .iter()
            .map(|req| depth_exceeded_outcome(&req.definition, max_agent_depth))
            .collect();
        return Ok(SpawnResult { outcomes });
    }

    log::debug!("agent {} spawning {} child(ren) at depth {child_depth}", parent.agent_id, requests.len());
    let children: Vec<AgentState> = requests
        .into_iter()
        .map(|req| {
            let mut child = parent.spawn_child(req.definition);
            if let Some(msg) = req.initial_message {
                child = child.with_message(msg);
            }
            child
        })
        .collect();

    let concurrency = max_concurrent_agents.max(1);
    let mut pending = children.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();

    for _ in 0..concurrency {
        match pending.next() {
            Some((idx, child)) => {
                let token = cancel.clone();
                in_flight.push(async move { (idx, run_child(child, token).await) });
            }
            None => break,
        }
    }

    let mut finished: Vec<Option<(AgentState, f64)>> = Vec::new();
    while let Some((idx, outcome)) = in_flight.next().await {
        if finished.len() <= idx {
            finished.resize_with(idx + 1, || None);
        }
        finished[idx] = Some(outcome);
        if let Some((next_idx, child)) = pending.next() {
            let token = cancel.clone();
            in_flight.push(async move { (next_idx, run_child(child, token).await) });
        }
    }

    let outcomes = finished
        .into_iter()
        .map(|entry| {
            let (state, cost) = entry.expect("every spawned index produced exactly one outcome");
            let error = match state.status {
                AgentStatus::Failed => Some("sub-agent run failed".to_string()),
                AgentStatus::Cancelled => Some("sub-agent run was cancelled".to_string()),
                _ => None,
            };
            SpawnOutcome {
                run_id: state.run_id,
                agent_id: state.agent_id,
                name: state.definition.name.clone(),
                status: state.status,
                output: state.output,
                error,
                cost,
            }
        })
        .collect();

    Ok(SpawnResult { outcomes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_def::AgentDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn def(name: &str) -> Arc<AgentDefinition> {
        Arc::new(AgentDefinition::new(name, "p", "m"))
    }

    #[tokio::test]
    async fn scenario_c_depth_at_limit_fails_every_request_at_zero_cost_without_calling_run_child() {
        // Scenario C's exact configuration: max_agent_depth=2, the
        // depth-1 run's own spawn call (which would produce a
        // depth-2 grandchild) must fail immediately instead of running.
        let root = AgentState::new_root(def("root"));
        let parent = root.spawn_child(def("mid"));
        assert_eq!(parent.depth(), 1);
        let requests = vec![SpawnRequest::new(def("child"))];
        let result = spawn_agents(&parent, requests, 4, 2, CancelToken::new(), |_state, _| async move {
            panic!("run_child should never be invoked once depth is exceeded")
        })
        .await
        .unwrap();
        assert_eq!(result.outcomes.len(), 1);
        assert!(matches!(result.outcomes[0].status, AgentStatus::Failed));
        assert_eq!(result.outcomes[0].error.as_deref(), Some("Max agent depth (2) exceeded"));
        assert_eq!(result.outcomes[0].cost, 0.0);
    }

    #[tokio::test]
    async fn depth_exceeded_fails_every_request_at_zero_cost_without_calling_run_child() {
        let root = AgentState::new_root(def("root"));
        let parent = root.spawn_child(def("mid")).spawn_child(def("mid2"));
        assert_eq!(parent.depth(), 2);
        let requests = vec![SpawnRequest::new(def("child"))];
        let result = spawn_agents(&parent, requests, 4, 2, CancelToken::new(), |_state, _| async move {
            panic!("run_child should never be invoked once depth is exceeded")
        })
        .await
        .unwrap();
        assert_eq!(result.outcomes.len(), 1);
        assert!(matches!(result.outcomes[0].status, AgentStatus::Failed));
        assert_eq!(result.outcomes[0].error.as_deref(), Some("Max agent depth (2) exceeded"));
        assert_eq!(result.outcomes[0].cost, 0.0);
    }

    #[tokio::test]
    async fn results_are_in_original_request_order_despite_completion_order() {
        let parent = AgentState::new_root(def("root"));
        let requests = vec![SpawnRequest::new(def("slow")), SpawnRequest::new(def("fast"))];
        let result = spawn_agents(&parent, requests, 4, 4, CancelToken::new(), |state, _| async move {
            let delay = if state.definition.name == "slow" { 20 } else { 0 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            (
                state.with_status(AgentStatus::Done).with_output(serde_json::json!(state.definition.name.clone())),
                0.0,
            )
        })
        .await
        .unwrap();
        assert_eq!(result.outcomes[0].name, "slow");
        assert_eq!(result.outcomes[1].name, "fast");
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_max_concurrent_agents() {
        let parent = AgentState::new_root(def("root"));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let requests = (0..5).map(|_| SpawnRequest::new(def("child"))).collect();

        let in_flight_c = in_flight.clone();
        let max_observed_c = max_observed.clone();
        let result = spawn_agents(&parent, requests, 2, 4, CancelToken::new(), move |state, _| {
            let in_flight = in_flight_c.clone();
            let max_observed = max_observed_c.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                (state.with_status(AgentStatus::Done), 0.0)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.outcomes.len(), 5);
        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn children_inherit_depth_and_parent_id() {
        let parent = AgentState::new_root(def("root"));
        let parent_run_id = parent.run_id.clone();
        let requests = vec![SpawnRequest::new(def("child"))];
        let result = spawn_agents(&parent, requests, 1, 4, CancelToken::new(), |state, _| async move {
            (state.with_status(AgentStatus::Done), 0.0)
        })
        .await
        .unwrap();
        let child = parent.spawn_child(def("child"));
        assert_eq!(child.depth(), 1);
        assert_eq!(child.parent_id, Some(parent_run_id));
        assert_eq!(result.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn one_siblings_failure_does_not_abort_others() {
        let parent = AgentState::new_root(def("root"));
        let requests = vec![SpawnRequest::new(def("bad")), SpawnRequest::new(def("good"))];
        let result = spawn_agents(&parent, requests, 4, 4, CancelToken::new(), |state, _| async move {
            if state.definition.name == "bad" {
                (state.with_status(AgentStatus::Failed), 0.0)
            } else {
                (state.with_status(AgentStatus::Done).with_output(serde_json::json!("ok")), 0.1)
            }
        })
        .await
        .unwrap();
        assert!(matches!(result.outcomes[0].status, AgentStatus::Failed));
        assert!(matches!(result.outcomes[1].status, AgentStatus::Done));
        assert_eq!(result.outcomes[1].output, Some(serde_json::json!("ok")));
    }
}
