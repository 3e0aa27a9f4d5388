//! Cost tracker: per-run and daily-rolling USD totals, pricing, admission.
//!
//! Corresponds to spec §4.8. The Open Question in spec §9 about which of
//! the two cost-rate tables is authoritative is resolved here: this
//! per-1K-token `Pricing` table is the single source of truth (see
//! DESIGN.md).

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Prompt/completion cost per 1,000 tokens, in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRate {
    pub prompt_cost_per_1k: f64,
    pub completion_cost_per_1k: f64,
}

#[derive(Debug, Clone)]
pub struct PricingTable {
    rates: HashMap<String, ModelRate>,
    default: ModelRate,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            rates: HashMap::new(),
            default: ModelRate {
                prompt_cost_per_1k: 0.0,
                completion_cost_per_1k: 0.0,
            },
        }
    }
}

impl PricingTable {
    pub fn new(default: ModelRate) -> Self {
        Self {
            rates: HashMap::new(),
            default,
        }
    }

    pub fn set_rate(&mut self, model: impl Into<String>, rate: ModelRate) {
        self.rates.insert(model.into(), rate);
    }

    pub fn rate_for(&self, model: &str) -> ModelRate {
        self.rates.get(model).copied().unwrap_or(self.default)
    }
}

/// Usage for a single LLM call, as reported by the provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct UsageRecord {
    pub cost: f64,
    pub timestamp_ms: i64,
}

struct CostState {
    daily_total: f64,
    daily_date: NaiveDate,
    history: Vec<UsageRecord>,
}

/// Configurable admission limits for the cost tracker.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostLimits {
    pub max_cost_per_run: Option<f64>,
    pub max_cost_per_day: Option<f64>,
    /// Fraction of either limit at which `warning` is set. Defaults to 0.8.
    pub warning_fraction: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warning: Option<String>,
}

/// Cost tracker: a UTC-daily-rolling total shared process-wide across every
/// run a `Runtime` drives, plus per-LLM-call pricing. The *run-scoped*
/// total spec §4.8 also names is not kept here — it lives on each run's own
/// `AgentState::credits_used` (accumulated via `record_usage`'s return
/// value), since a `CostTracker` instance is shared across concurrently
/// executing runs (a parent and its spawned children) and cannot own a
/// single "current run" total itself. `check_admission` takes the calling
/// run's own total as a parameter for exactly this reason.
///
/// Corresponds to spec §4.8.
pub struct CostTracker {
    pricing: PricingTable,
    limits: CostLimits,
    state: Mutex<CostState>,
}

const DEFAULT_WARNING_FRACTION: f64 = 0.8;

impl CostTracker {
    pub fn new(pricing: PricingTable, limits: CostLimits) -> Self {
        Self {
            pricing,
            limits,
            state: Mutex::new(CostState {
                daily_total: 0.0,
                daily_date: Utc::now().date_naive(),
                history: Vec::new(),
            }),
        }
    }

    fn roll_day_if_needed(&self, state: &mut CostState) {
        let today = Utc::now().date_naive();
        if today != state.daily_date {
            state.daily_date = today;
            state.daily_total = 0.0;
            state.history.clear();
        }
    }

    /// Record usage for one LLM call and return the cost it added.
    ///
    /// Corresponds to spec §4.8's `(prompt*rate + completion*rate)/1000` formula.
    pub fn record_usage(&self, model: &str, usage: Usage) -> f64 {
        let rate = self.pricing.rate_for(model);
        let cost = (usage.prompt_tokens as f64 * rate.prompt_cost_per_1k
            + usage.completion_tokens as f64 * rate.completion_cost_per_1k)
            / 1000.0;

        let mut state = self.state.lock();
        self.roll_day_if_needed(&mut state);
        state.daily_total += cost;
        state.history.push(UsageRecord {
            cost,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
        // Drop history entries older than 24h.
        let cutoff = Utc::now().timestamp_millis() - 24 * 60 * 60 * 1000;
        state.history.retain(|r| r.timestamp_ms >= cutoff);
        cost
    }

    pub fn daily_total(&self) -> f64 {
        let mut state = self.state.lock();
        self.roll_day_if_needed(&mut state);
        state.daily_total
    }

    /// Evaluate whether spending is still admissible given the configured
    /// limits, per spec §4.8. `run_total` is the calling run's own
    /// `AgentState::credits_used` (see the type-level doc above for why
    /// this tracker doesn't keep that total itself).
    pub fn check_admission(&self, run_total: f64) -> AdmissionDecision {
        let daily_total = self.daily_total();
        let warn_frac = self.limits.warning_fraction.unwrap_or(DEFAULT_WARNING_FRACTION);

        if let Some(max_run) = self.limits.max_cost_per_run {
            if run_total >= max_run {
                return AdmissionDecision {
                    allowed: false,
                    reason: Some(format!(
                        "run cost {run_total:.4} exceeds max_cost_per_run {max_run:.4}"
                    )),
                    warning: None,
                };
            }
        }
        if let Some(max_day) = self.limits.max_cost_per_day {
            if daily_total >= max_day {
                return AdmissionDecision {
                    allowed: false,
                    reason: Some(format!(
                        "daily cost {daily_total:.4} exceeds max_cost_per_day {max_day:.4}"
                    )),
                    warning: None,
                };
            }
        }

        let mut warning = None;
        if let Some(max_run) = self.limits.max_cost_per_run {
            if run_total >= max_run * warn_frac {
                warning = Some(format!(
                    "run cost {run_total:.4} is at {:.0}% of max_cost_per_run",
                    (run_total / max_run) * 100.0
                ));
            }
        }
        if warning.is_none() {
            if let Some(max_day) = self.limits.max_cost_per_day {
                if daily_total >= max_day * warn_frac {
                    warning = Some(format!(
                        "daily cost {daily_total:.4} is at {:.0}% of max_cost_per_day",
                        (daily_total / max_day) * 100.0
                    ));
                }
            }
        }

        AdmissionDecision {
            allowed: true,
            reason: None,
            warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(limits: CostLimits) -> CostTracker {
        let mut pricing = PricingTable::new(ModelRate {
            prompt_cost_per_1k: 1.0,
            completion_cost_per_1k: 2.0,
        });
        pricing.set_rate(
            "mock/echo",
            ModelRate {
                prompt_cost_per_1k: 1.0,
                completion_cost_per_1k: 2.0,
            },
        );
        CostTracker::new(pricing, limits)
    }

    #[test]
    fn record_usage_computes_expected_cost() {
        let tracker = tracker(CostLimits::default());
        let cost = tracker.record_usage(
            "mock/echo",
            Usage {
                prompt_tokens: 1000,
                completion_tokens: 500,
            },
        );
        assert!((cost - 2.0).abs() < 1e-9);
        assert!((tracker.daily_total() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn admission_denies_over_run_limit() {
        let tracker = tracker(CostLimits {
            max_cost_per_run: Some(1.0),
            ..Default::default()
        });
        let run_total = tracker.record_usage(
            "mock/echo",
            Usage {
                prompt_tokens: 1000,
                completion_tokens: 0,
            },
        );
        let decision = tracker.check_admission(run_total);
        assert!(!decision.allowed);
        assert!(decision.reason.is_some());
    }

    #[test]
    fn admission_warns_before_denying() {
        let tracker = tracker(CostLimits {
            max_cost_per_run: Some(1.0),
            ..Default::default()
        });
        let run_total = tracker.record_usage(
            "mock/echo",
            Usage {
                prompt_tokens: 900,
                completion_tokens: 0,
            },
        );
        let decision = tracker.check_admission(run_total);
        assert!(decision.allowed);
        assert!(decision.warning.is_some());
    }

    #[test]
    fn daily_total_accumulates_across_unrelated_runs_while_run_total_does_not() {
        let tracker = tracker(CostLimits {
            max_cost_per_run: Some(1.0),
            ..Default::default()
        });
        // Two separate "runs" each spend 0.5 — under the per-run limit
        // individually, even though the shared daily total climbs to 1.0.
        let run_a_total = tracker.record_usage(
            "mock/echo",
            Usage {
                prompt_tokens: 500,
                completion_tokens: 0,
            },
        );
        assert!(tracker.check_admission(run_a_total).allowed);
        let run_b_total = tracker.record_usage(
            "mock/echo",
            Usage {
                prompt_tokens: 500,
                completion_tokens: 0,
            },
        );
        assert!(tracker.check_admission(run_b_total).allowed);
        assert!((tracker.daily_total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn default_rate_used_for_unknown_model() {
        let tracker = tracker(CostLimits::default());
        let cost = tracker.record_usage(
            "unknown/model",
            Usage {
                prompt_tokens: 1000,
                completion_tokens: 1000,
            },
        );
        assert!((cost - 3.0).abs() < 1e-9);
    }
}
