//! The runtime-scoped configuration surface.
//!
//! Corresponds to spec §6's configuration table. This crate does not read
//! config files itself (that's an external collaborator's job per spec
//! §1); `RuntimeConfig` is the plain, serde-friendly shape a caller
//! assembles however it likes and hands to `Runtime::new`.

use serde::{Deserialize, Serialize};

use crate::rate_limiter::RateLimitConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token budget above which the pruner kicks in.
    pub max_tokens: usize,
    /// Token budget the pruner trims down to.
    pub target_tokens: usize,
    /// Number of most-recent messages always preserved.
    pub preserve_recent_messages: usize,
    /// Model string used to summarise prunable messages, if configured.
    #[serde(default)]
    pub summary_model: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8_000,
            target_tokens: 6_000,
            preserve_recent_messages: 4,
            summary_model: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CostConfig {
    pub max_cost_per_run: Option<f64>,
    pub max_cost_per_day: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Initial `steps_remaining` for root runs.
    pub max_steps: u32,
    /// Batch width for `spawn_agents`.
    pub max_concurrent_agents: usize,
    /// Hard cap on ancestor-chain length.
    pub max_agent_depth: u32,
    pub cost: CostConfig,
    pub rate_limit: RateLimitConfigDto,
    pub context: ContextConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: 25,
            max_concurrent_agents: 4,
            max_agent_depth: 3,
            cost: CostConfig::default(),
            rate_limit: RateLimitConfigDto::default(),
            context: ContextConfig::default(),
        }
    }
}

/// Serde-friendly mirror of `RateLimitConfig` (which itself has no serde
/// derive since it's also constructed directly by code that doesn't go
/// through deserialization).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfigDto {
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    pub tokens_per_minute: Option<u32>,
    pub tokens_per_hour: Option<u32>,
    pub concurrent_requests: usize,
}

impl Default for RateLimitConfigDto {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            requests_per_minute: defaults.requests_per_minute,
            requests_per_hour: defaults.requests_per_hour,
            tokens_per_minute: defaults.tokens_per_minute,
            tokens_per_hour: defaults.tokens_per_hour,
            concurrent_requests: defaults.concurrent_requests,
        }
    }
}

impl From<RateLimitConfigDto> for RateLimitConfig {
    fn from(dto: RateLimitConfigDto) -> Self {
        RateLimitConfig {
            requests_per_minute: dto.requests_per_minute,
            requests_per_hour: dto.requests_per_hour,
            tokens_per_minute: dto.tokens_per_minute,
            tokens_per_hour: dto.tokens_per_hour,
            concurrent_requests: dto.concurrent_requests,
        }
    }
}
