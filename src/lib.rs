//! A runtime for autonomous coding agents.
//!
//! Drives a conversation between an LLM backend and a pool of external
//! tools: the step scheduler, the tool executor, the sub-agent spawner, the
//! message-lifecycle/pruning engine, the provider abstraction, and the rate
//! limiter, cost tracker, and tracer that constrain and observe it all. See
//! `SPEC_FULL.md` for the full requirements this crate implements.

pub mod agent_def;
pub mod agent_registry;
pub mod cancel;
pub mod config;
pub mod cost;
pub mod error;
pub mod events;
pub mod message;
pub mod provider;
pub mod pruner;
pub mod rate_limiter;
pub mod runtime;
pub mod spawner;
pub mod state;
pub mod step_generator;
pub mod tools;
pub mod tracer;

pub use agent_def::{AgentDefinition, OutputMode};
pub use cancel::CancelToken;
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use events::{Event, EventSink};
pub use message::Message;
pub use runtime::{RunOutcome, RunOutput, Runtime};
pub use state::{AgentState, AgentStatus};
