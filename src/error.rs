//! Crate-wide error type.
//!
//! The step loop never throws out of `run` (spec: tool failures and
//! transient LLM errors are folded back into message history as
//! tool-result payloads or synthetic system messages). `RuntimeError` is
//! reserved for the catastrophic, start-up-shaped failures that the spec
//! says *do* escape to the caller: an unknown model with no matching or
//! fallback provider, and registry/config misuse.

use thiserror::Error;

/// Errors that escape `Runtime::run` rather than being folded into the
/// conversation or a tool-result payload.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no provider registered for model '{model}' and no fallback provider configured")]
    NoProvider { model: String },

    #[error("provider '{name}' is already registered")]
    DuplicateProvider { name: String },

    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    #[error("agent '{id}' is already registered")]
    DuplicateAgent { id: String },

    #[error("unknown agent id '{id}'")]
    UnknownAgent { id: String },

    #[error("provider '{provider}' failed: {message}")]
    Provider { provider: String, message: String },

    #[error("invalid model identifier '{0}'")]
    InvalidModel(String),

    #[error("spawning at depth {depth} would exceed max_agent_depth {max}")]
    MaxAgentDepthExceeded { depth: u32, max: u32 },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
