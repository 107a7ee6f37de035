//! Failure classification: maps a raised failure plus the responding API
//! system's policy to a retry/abort/ignore decision.
//!
//! Dispositions short-circuit everything: an End-tagged failure is ignored
//! (the job completes, the workflow continues) and a Resolve-tagged failure
//! aborts straight to the rollback hook. Only Normal failures fall through
//! to code-based policy.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::domain::{Disposition, JobFailure};

/// Classification and throttle policy for one API system.
#[derive(Debug, Clone)]
pub struct ExceptionPolicy {
    /// Response codes that imply a hard ban (operator intervention required)
    pub forbidden_codes: HashSet<u16>,
    /// Response codes that imply a temporary backoff
    pub rate_limit_codes: HashSet<u16>,
    /// Cooldown applied when a rate-limit code is observed
    pub backoff_seconds: u64,
    /// Rate-limit window length
    pub window_seconds: u64,
    /// Calls allowed per window; None disables window-quota denial
    pub max_calls_per_window: Option<u32>,
}

impl Default for ExceptionPolicy {
    fn default() -> Self {
        Self {
            forbidden_codes: HashSet::from([403, 418]),
            rate_limit_codes: HashSet::from([429]),
            backoff_seconds: 10,
            window_seconds: 60,
            max_calls_per_window: None,
        }
    }
}

/// Per-system policy table with a default fallback, resolved once at startup.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, ExceptionPolicy>,
    default: ExceptionPolicy,
}

impl PolicyRegistry {
    pub fn new(policies: HashMap<String, ExceptionPolicy>) -> Self {
        Self {
            policies,
            default: ExceptionPolicy::default(),
        }
    }

    pub fn with_default(mut self, default: ExceptionPolicy) -> Self {
        self.default = default;
        self
    }

    /// Policy for a canonical API system name, falling back to the default.
    pub fn get(&self, api_system: &str) -> &ExceptionPolicy {
        self.policies.get(api_system).unwrap_or(&self.default)
    }
}

/// Backoff schedule for generic transient failures
#[derive(Debug, Clone)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before the next attempt, given how many attempts have run.
    /// A ±20% jitter keeps colliding workers from retrying in lockstep.
    pub fn delay(&self, attempts: u32) -> Duration {
        let raw = match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, cap } => {
                let exp = attempts.saturating_sub(1).min(16);
                let scaled = base.saturating_mul(2u32.saturating_pow(exp));
                scaled.min(*cap)
            }
        };
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        raw.mul_f64(jitter)
    }
}

/// Retry policy for failures not covered by a specific response code
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(300),
            },
        }
    }
}

/// What the executor should do with a failed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Return the record to the queue, not before `delay` has elapsed
    Retry { delay: Duration },
    /// Mark the record failed and invoke the resolution hook
    Abort,
    /// Mark the record completed anyway; keep the error for observability
    Ignore,
}

pub struct ExceptionClassifier {
    policies: PolicyRegistry,
    retry: RetryPolicy,
}

impl ExceptionClassifier {
    pub fn new(policies: PolicyRegistry, retry: RetryPolicy) -> Self {
        Self { policies, retry }
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }

    /// Classify a failure from `api_system` after `attempts` executions.
    pub fn classify(&self, api_system: &str, failure: &JobFailure, attempts: u32) -> Action {
        match failure.disposition {
            Disposition::End => return Action::Ignore,
            Disposition::Resolve => return Action::Abort,
            Disposition::Normal => {}
        }

        let policy = self.policies.get(api_system);
        if let Some(code) = failure.response_code {
            if policy.forbidden_codes.contains(&code) {
                debug!(api_system, code, "forbidden response code, aborting");
                return Action::Abort;
            }
            if policy.rate_limit_codes.contains(&code) {
                if attempts >= self.retry.max_attempts {
                    return Action::Abort;
                }
                return Action::Retry {
                    delay: Duration::from_secs(policy.backoff_seconds),
                };
            }
        }

        if attempts >= self.retry.max_attempts {
            Action::Abort
        } else {
            Action::Retry {
                delay: self.retry.backoff.delay(attempts),
            }
        }
    }
}
