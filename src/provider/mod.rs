//! The LLM provider abstraction: request/response, streaming chunks, and
//! model-string routing with a fallback provider.
//!
//! Corresponds to spec §4.6. The trait and chunk shapes are grounded on
//! the teacher's `llms::streaming` module (`StreamingLLM`, `StreamChunk`,
//! `ChannelStreamReceiver`, `StreamAccumulator`), generalized from a
//! CrewAI-specific `LLMMessage` map to the spec's richer `Message` type and
//! from five chunk kinds to the spec's six.

pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cancel::CancelToken;
use crate::message::{Message, ToolCall};

pub use registry::ProviderRegistry;

/// Why a completion (streaming or not) terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// A tool schema in the wire format expected by provider request bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A single LLM request, shared by `complete` and `stream`.
///
/// Corresponds to spec §4.6's request fields.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub cancel: CancelToken,
}

/// A complete (non-streaming) response.
///
/// Corresponds to spec §4.6's response fields.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// One chunk of a streaming response.
///
/// Corresponds to spec §4.6's six stream chunk variants, whose ordering is
/// total: all `text` chunks and `tool_call_*` chunks for a given id appear
/// in order; `tool_call_end` for id X appears after all deltas for X;
/// `done` is the final chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    Text { content: String },
    ToolCallStart { tool_call_id: String, tool_name: String },
    ToolCallDelta { tool_call_id: String, input_delta: String },
    ToolCallEnd { tool_call: ToolCall },
    Usage { usage: TokenUsage },
    Done { finish_reason: FinishReason },
}

/// A handle yielding `StreamChunk`s in order, abstracting over the
/// underlying transport (SSE, websocket, whatever the concrete vendor
/// client uses — out of scope for this crate).
#[async_trait]
pub trait StreamHandle: Send {
    async fn next(&mut self) -> Option<StreamChunk>;
}

/// A `StreamHandle` backed by a tokio mpsc channel; the default shape a
/// provider implementation pushes chunks through from a background task.
pub struct ChannelStream {
    rx: tokio::sync::mpsc::Receiver<StreamChunk>,
}

impl ChannelStream {
    pub fn pair(buffer: usize) -> (tokio::sync::mpsc::Sender<StreamChunk>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl StreamHandle for ChannelStream {
    async fn next(&mut self) -> Option<StreamChunk> {
        self.rx.recv().await
    }
}

/// A provider adapter: claims a set of model-string patterns under its
/// name, and offers `complete`/`stream`.
///
/// Corresponds to spec §4.6's provider contract. Vendor-specific request
/// and response shaping lives behind this trait, out of scope here.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name, used as the `<provider>` half of a model id.
    fn name(&self) -> &str;

    /// Whether this provider claims the given bare model name (the part
    /// after the slash, or the whole string if there was no slash).
    fn claims(&self, model: &str) -> bool;

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, String>;

    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<Box<dyn StreamHandle>, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_stream_yields_in_order() {
        let (tx, mut stream) = ChannelStream::pair(8);
        tx.send(StreamChunk::Text { content: "hi".into() }).await.unwrap();
        tx.send(StreamChunk::Done { finish_reason: FinishReason::Stop }).await.unwrap();
        drop(tx);

        match stream.next().await {
            Some(StreamChunk::Text { content }) => assert_eq!(content, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
        match stream.next().await {
            Some(StreamChunk::Done { finish_reason }) => assert_eq!(finish_reason, FinishReason::Stop),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }
}
