//! Message-lifecycle and context-pruning engine.
//!
//! Corresponds to spec §4.5. Two independent passes act on a run's
//! history: TTL expiration (messages tagged to die at a specific trigger
//! are dropped outright) and budget enforcement (when estimated token
//! usage exceeds `max_tokens`, the oldest prunable messages are removed,
//! or collapsed into one summary message, until usage is back under
//! `target_tokens`). Grounded on the teacher's `llms::base_llm`
//! `format_messages`/token-accounting style for the estimate-then-trim
//! shape, generalized to the spec's tag/TTL/pin lifecycle model (the
//! teacher has no equivalent pruning pass of its own).

use std::collections::BTreeSet;

use crate::config::ContextConfig;
use crate::message::{tags, Lifecycle, Message, TimeToLive};

/// Which kind of TTL a pruning pass is expiring.
///
/// Corresponds to spec §3's `time_to_live` variants: `UserPrompt` expires
/// when a new user prompt arrives, `AgentStep` expires at the start of the
/// next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTrigger {
    NewUserPrompt,
    StepStart,
}

/// Drop every message whose `time_to_live` matches `trigger`. Returns the
/// number of messages removed. Relative order of the surviving messages is
/// unchanged.
pub fn expire_ttl(history: &mut Vec<Message>, trigger: PruneTrigger) -> usize {
    let expiring = match trigger {
        PruneTrigger::NewUserPrompt => TimeToLive::UserPrompt,
        PruneTrigger::StepStart => TimeToLive::AgentStep,
    };
    let before = history.len();
    history.retain(|m| m.time_to_live() != Some(expiring));
    before - history.len()
}

fn total_tokens(history: &[Message]) -> usize {
    history.iter().map(Message::estimate_tokens).sum()
}

/// Whether the history's estimated token usage exceeds `max_tokens`.
pub fn over_budget(history: &[Message], cfg: &ContextConfig) -> bool {
    total_tokens(history) > cfg.max_tokens
}

/// Tags that mark a message preserved regardless of recency or pin state
/// (spec §4.5: "tagged with a preserve tag such as `USER_PROMPT` or
/// `INSTRUCTIONS_PROMPT`").
const PRESERVE_TAGS: [&str; 2] = [tags::USER_PROMPT, tags::INSTRUCTIONS_PROMPT];

fn has_preserve_tag(msg: &Message) -> bool {
    PRESERVE_TAGS.iter().any(|tag| msg.has_tag(tag))
}

/// Select indices (oldest first) to remove in order to bring estimated
/// usage down to `target_tokens`, honoring:
/// - system messages are never selected (they carry no lifecycle),
/// - pinned (`keep_during_truncation`) messages are never selected,
/// - messages tagged `USER_PROMPT` or `INSTRUCTIONS_PROMPT` are never selected,
/// - the most recent `preserve_recent_messages` non-system messages are
///   never selected, regardless of pin state.
///
/// Returns an empty vector if already under budget. This is a pure
/// function: calling it twice on unchanged input yields the same
/// selection (testable property: idempotent pruner).
pub fn select_for_pruning(history: &[Message], cfg: &ContextConfig) -> Vec<usize> {
    let starting_total = total_tokens(history);
    if starting_total <= cfg.max_tokens {
        return Vec::new();
    }

    let non_system_indices: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, m)| !matches!(m, Message::System { .. }))
        .map(|(i, _)| i)
        .collect();
    let preserve_count = cfg.preserve_recent_messages.min(non_system_indices.len());
    let preserved: BTreeSet<usize> = non_system_indices[non_system_indices.len() - preserve_count..]
        .iter()
        .copied()
        .collect();

    let mut running = starting_total;
    let mut selected = Vec::new();
    for (i, msg) in history.iter().enumerate() {
        if running <= cfg.target_tokens {
            break;
        }
        if preserved.contains(&i) || msg.is_pinned() || has_preserve_tag(msg) || matches!(msg, Message::System { .. }) {
            continue;
        }
        selected.push(i);
        running -= msg.estimate_tokens();
    }
    selected
}

/// Remove the messages at `indices` outright.
pub fn truncate(history: &mut Vec<Message>, indices: &[usize]) {
    collapse(history, indices, None);
}

/// Remove the messages at `indices`, replacing them with a single pinned,
/// never-expiring summary message inserted at the position of the first
/// removed message.
///
/// The inserted message is tagged `CONTEXT_SUMMARY` and pinned, so a
/// subsequent `select_for_pruning` pass never selects it again — this is
/// what makes repeated pruning idempotent once a summary has replaced a
/// run of history.
pub fn summarize(history: &mut Vec<Message>, indices: &[usize], summary_text: impl Into<String>) {
    collapse(history, indices, Some(summary_text.into()));
}

fn collapse(history: &mut Vec<Message>, indices: &[usize], summary_text: Option<String>) {
    if indices.is_empty() {
        return;
    }
    let index_set: BTreeSet<usize> = indices.iter().copied().collect();
    let mut replaced = false;
    let mut next = Vec::with_capacity(history.len());
    for (i, msg) in history.drain(..).enumerate() {
        if index_set.contains(&i) {
            if !replaced {
                if let Some(text) = &summary_text {
                    next.push(summary_message(text.clone()));
                }
                replaced = true;
            }
            continue;
        }
        next.push(msg);
    }
    *history = next;
}

fn summary_message(text: String) -> Message {
    Message::user_with_lifecycle(
        text,
        Lifecycle::new().with_tag(tags::CONTEXT_SUMMARY).with_ttl(TimeToLive::Forever).pinned(),
    )
}

/// Truncate oldest-first until the history is back under `target_tokens`,
/// without summarization. The common path when no `summary_model` is
/// configured (spec §4.5's "summarization-or-truncation fallback").
pub fn enforce_budget_by_truncation(history: &mut Vec<Message>, cfg: &ContextConfig) -> usize {
    let indices = select_for_pruning(history, cfg);
    let removed = indices.len();
    truncate(history, &indices);
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolContent;

    fn cfg() -> ContextConfig {
        ContextConfig {
            max_tokens: 60,
            target_tokens: 30,
            preserve_recent_messages: 1,
            summary_model: None,
        }
    }

    fn sized_user(tag_len: usize) -> Message {
        Message::user("x".repeat(tag_len))
    }

    #[test]
    fn expire_ttl_removes_only_matching_trigger() {
        let mut history = vec![
            Message::user_with_lifecycle("a", Lifecycle::new().with_ttl(TimeToLive::UserPrompt)),
            Message::user_with_lifecycle("b", Lifecycle::new().with_ttl(TimeToLive::AgentStep)),
            Message::user_with_lifecycle("c", Lifecycle::new().with_ttl(TimeToLive::Forever)),
        ];
        let removed = expire_ttl(&mut history, PruneTrigger::NewUserPrompt);
        assert_eq!(removed, 1);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|m| m.time_to_live() != Some(TimeToLive::UserPrompt)));
    }

    #[test]
    fn select_for_pruning_is_empty_when_under_budget() {
        let history = vec![sized_user(4)];
        assert!(select_for_pruning(&history, &cfg()).is_empty());
    }

    #[test]
    fn select_for_pruning_preserves_recent_and_pinned() {
        let mut history = vec![
            sized_user(200),
            sized_user(200),
            Message::user_with_lifecycle("keep-me", Lifecycle::new().pinned()),
            sized_user(200),
        ];
        let selected = select_for_pruning(&history, &cfg());
        // The pinned message (index 2) and the last message (index 3,
        // within preserve_recent_messages=1) must never be selected.
        assert!(!selected.contains(&2));
        assert!(!selected.contains(&3));
        truncate(&mut history, &selected);
        assert!(total_tokens(&history) <= cfg().max_tokens || selected.is_empty());
    }

    #[test]
    fn pruning_is_idempotent_after_truncation() {
        let mut history = vec![sized_user(200), sized_user(200), sized_user(200)];
        let first = select_for_pruning(&history, &cfg());
        truncate(&mut history, &first);
        let second = select_for_pruning(&history, &cfg());
        assert!(second.is_empty(), "already under budget, nothing left to select");
    }

    #[test]
    fn summarize_inserts_pinned_forever_message_and_is_never_reselected() {
        let mut history = vec![sized_user(200), sized_user(200), sized_user(200)];
        let selected = select_for_pruning(&history, &cfg());
        summarize(&mut history, &selected, "summary of earlier turns");
        assert!(history.iter().any(|m| m.has_tag(tags::CONTEXT_SUMMARY) && m.is_pinned()));
        let reselected = select_for_pruning(&history, &cfg());
        assert!(!reselected.iter().any(|&i| history[i].has_tag(tags::CONTEXT_SUMMARY)));
    }

    #[test]
    fn messages_tagged_user_prompt_or_instructions_prompt_are_never_selected() {
        let history = vec![
            Message::user_with_lifecycle("earlier context", Lifecycle::new().with_tag(tags::INSTRUCTIONS_PROMPT)),
            sized_user(200),
            Message::user_with_lifecycle("do the thing", Lifecycle::new().with_tag(tags::USER_PROMPT)),
            sized_user(200),
            sized_user(200),
        ];
        let selected = select_for_pruning(&history, &cfg());
        assert!(!selected.contains(&0));
        assert!(!selected.contains(&2));
    }

    #[test]
    fn tool_messages_are_prunable_like_any_other_non_system_message() {
        let mut history = vec![
            Message::tool_result("t", "1", ToolContent::Text("x".repeat(200))),
            sized_user(200),
            sized_user(200),
        ];
        let selected = select_for_pruning(&history, &cfg());
        assert!(selected.contains(&0));
        truncate(&mut history, &selected);
        assert!(total_tokens(&history) <= cfg().max_tokens);
    }
}
