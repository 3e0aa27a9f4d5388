//! The immutable message model.
//!
//! Corresponds to spec §3 ("Message"). A message is one of four shapes
//! (system/user/assistant/tool); every non-system message additionally
//! carries the lifecycle attributes the pruner and TTL-expiration pass
//! (§4.5) act on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Well-known preserve/lifecycle tags. Callers may also use arbitrary
/// strings; these constants exist so the loop and pruner can refer to the
/// ones they set themselves without stringly-typed typos.
pub mod tags {
    pub const USER_PROMPT: &str = "USER_PROMPT";
    pub const INSTRUCTIONS_PROMPT: &str = "INSTRUCTIONS_PROMPT";
    pub const STEP_PROMPT: &str = "STEP_PROMPT";
    pub const ERROR: &str = "ERROR";
    pub const CONTEXT_SUMMARY: &str = "CONTEXT_SUMMARY";
}

/// When a message is automatically removed from history.
///
/// Corresponds to spec §3's `time_to_live` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeToLive {
    /// Removed the next time a new user prompt arrives.
    UserPrompt,
    /// Removed at the start of the next step.
    AgentStep,
    /// Never automatically removed.
    Forever,
}

/// An image reference within a user message part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePart {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// One part of a multi-part user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPart {
    Text { text: String },
    Image(ImagePart),
}

/// The content of a user message: either a plain string or an ordered
/// sequence of parts (text/image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Parts(Vec<UserPart>),
}

impl UserContent {
    /// Best-effort plain-text rendering, used for token estimation and for
    /// providers that don't distinguish parts.
    pub fn as_text(&self) -> String {
        match self {
            UserContent::Text(s) => s.clone(),
            UserContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    UserPart::Text { text } => Some(text.clone()),
                    UserPart::Image(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// The content of a tool-result message: a plain string or a structured
/// JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolContent {
    Text(String),
    Json(Value),
}

impl ToolContent {
    pub fn as_text(&self) -> String {
        match self {
            ToolContent::Text(s) => s.clone(),
            ToolContent::Json(v) => v.to_string(),
        }
    }

    /// The tool result's top-level `output` field, if present, per spec
    /// §4.1 step 9 ("if it contains a top-level `output` field...").
    pub fn output_field(&self) -> Option<Value> {
        match self {
            ToolContent::Json(Value::Object(map)) => map.get("output").cloned(),
            _ => None,
        }
    }
}

/// A tool-call descriptor as attached to an assistant message.
///
/// Corresponds to spec §3 ("Tool-call descriptor").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
}

/// Lifecycle attributes shared by every non-system message.
///
/// Corresponds to spec §3: `tags`, `time_to_live`, `keep_during_truncation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<TimeToLive>,
    #[serde(default)]
    pub keep_during_truncation: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_ttl(mut self, ttl: TimeToLive) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn pinned(mut self) -> Self {
        self.keep_during_truncation = true;
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// An immutable message in the conversation history.
///
/// Corresponds to spec §3 ("Message"): a four-shape variant type, plus the
/// lifecycle attributes on every non-system variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: UserContent,
        #[serde(flatten)]
        lifecycle: Lifecycle,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(flatten)]
        lifecycle: Lifecycle,
    },
    Tool {
        tool_name: String,
        tool_call_id: String,
        content: ToolContent,
        #[serde(flatten)]
        lifecycle: Lifecycle,
    },
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: UserContent::Text(content.into()),
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn user_with_lifecycle(content: impl Into<String>, lifecycle: Lifecycle) -> Self {
        Message::User {
            content: UserContent::Text(content.into()),
            lifecycle,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content: content.into(),
            tool_calls,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, tool_call_id: impl Into<String>, content: ToolContent) -> Self {
        Message::Tool {
            tool_name: tool_name.into(),
            tool_call_id: tool_call_id.into(),
            content,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn lifecycle(&self) -> Option<&Lifecycle> {
        match self {
            Message::System { .. } => None,
            Message::User { lifecycle, .. } => Some(lifecycle),
            Message::Assistant { lifecycle, .. } => Some(lifecycle),
            Message::Tool { lifecycle, .. } => Some(lifecycle),
        }
    }

    pub fn lifecycle_mut(&mut self) -> Option<&mut Lifecycle> {
        match self {
            Message::System { .. } => None,
            Message::User { lifecycle, .. } => Some(lifecycle),
            Message::Assistant { lifecycle, .. } => Some(lifecycle),
            Message::Tool { lifecycle, .. } => Some(lifecycle),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.lifecycle().map(|l| l.has_tag(tag)).unwrap_or(false)
    }

    pub fn time_to_live(&self) -> Option<TimeToLive> {
        self.lifecycle().and_then(|l| l.time_to_live)
    }

    pub fn is_pinned(&self) -> bool {
        self.lifecycle().map(|l| l.keep_during_truncation).unwrap_or(false)
    }

    /// Estimate the token cost of this message.
    ///
    /// Corresponds to spec §4.5's pruner formula: `ceil(text_length / 4) + 10`
    /// per message, using the serialised form for structured tool content.
    pub fn estimate_tokens(&self) -> usize {
        let text_len = match self {
            Message::System { content } => content.len(),
            Message::User { content, .. } => content.as_text().len(),
            Message::Assistant { content, tool_calls, .. } => {
                content.len()
                    + tool_calls
                        .iter()
                        .map(|tc| tc.input.to_string().len() + tc.tool_name.len())
                        .sum::<usize>()
            }
            Message::Tool { content, .. } => content.as_text().len(),
        };
        text_len.div_ceil(4) + 10
    }

    /// The assistant tool-call ids carried by this message, if any.
    pub fn tool_call_ids(&self) -> Vec<&str> {
        match self {
            Message::Assistant { tool_calls, .. } => {
                tool_calls.iter().map(|tc| tc.tool_call_id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn as_tool_result_id(&self) -> Option<&str> {
        match self {
            Message::Tool { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_matches_formula() {
        let msg = Message::system("a".repeat(40));
        assert_eq!(msg.estimate_tokens(), 40usize.div_ceil(4) + 10);
    }

    #[test]
    fn lifecycle_builder_sets_fields() {
        let lc = Lifecycle::new()
            .with_tag(tags::STEP_PROMPT)
            .with_ttl(TimeToLive::AgentStep)
            .pinned();
        assert!(lc.has_tag(tags::STEP_PROMPT));
        assert_eq!(lc.time_to_live, Some(TimeToLive::AgentStep));
        assert!(lc.keep_during_truncation);
    }

    #[test]
    fn tool_content_output_field() {
        let content = ToolContent::Json(serde_json::json!({"output": {"x": 1}}));
        assert_eq!(content.output_field(), Some(serde_json::json!({"x": 1})));
        let plain = ToolContent::Text("hi".into());
        assert_eq!(plain.output_field(), None);
    }

    #[test]
    fn serde_roundtrip() {
        let msg = Message::assistant(
            "hi",
            vec![ToolCall {
                tool_call_id: "abc".into(),
                tool_name: "end_turn".into(),
                input: serde_json::json!({"message": "done"}),
            }],
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
