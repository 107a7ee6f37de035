//! Per-(API system, account) throttle and cooldown state.
//!
//! Every API invocation passes `acquire` first and reports its observed
//! response code afterwards. A forbidden code bans the key until an operator
//! clears it; a rate-limit code starts a timed backoff. Mutation of a single
//! key is serialized behind one async mutex per key, so concurrent workers
//! sharing an account never double-grant past the intended throughput.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::classifier::PolicyRegistry;

/// Bans require operator intervention; "far in the future" is ten years.
const BAN_DURATION_DAYS: i64 = 3650;

/// Result of a slot request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Granted,
    Denied { retry_after: StdDuration },
}

impl Slot {
    pub fn is_granted(&self) -> bool {
        matches!(self, Slot::Granted)
    }
}

#[derive(Debug, Clone)]
struct LimiterState {
    calls_in_window: u32,
    window_reset_at: DateTime<Utc>,
    banned_until: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
}

impl LimiterState {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            calls_in_window: 0,
            // An already-elapsed window forces a reset on the first acquire
            window_reset_at: now,
            banned_until: None,
            backoff_until: None,
        }
    }

    /// Remaining cooldown, the later of ban and backoff. None when callable.
    fn cooldown_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let until = match (self.banned_until, self.backoff_until) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }?;
        (until > now).then(|| until - now)
    }
}

/// Per-account API throttle
pub struct RateLimiter {
    policies: Arc<PolicyRegistry>,
    states: DashMap<(String, String), Arc<Mutex<LimiterState>>>,
}

impl RateLimiter {
    pub fn new(policies: Arc<PolicyRegistry>) -> Self {
        Self {
            policies,
            states: DashMap::new(),
        }
    }

    fn state(&self, api_system: &str, account_id: &str, now: DateTime<Utc>) -> Arc<Mutex<LimiterState>> {
        self.states
            .entry((api_system.to_string(), account_id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(LimiterState::fresh(now))))
            .clone()
    }

    /// Request a call slot for the key.
    pub async fn acquire(&self, api_system: &str, account_id: &str) -> Slot {
        self.acquire_at(api_system, account_id, Utc::now()).await
    }

    /// Clock-injected variant of `acquire`.
    pub async fn acquire_at(&self, api_system: &str, account_id: &str, now: DateTime<Utc>) -> Slot {
        let policy = self.policies.get(api_system).clone();
        let cell = self.state(api_system, account_id, now);
        let mut state = cell.lock().await;

        if let Some(remaining) = state.cooldown_remaining(now) {
            debug!(
                api_system,
                account_id,
                retry_after_secs = remaining.num_seconds(),
                "slot denied: cooldown active"
            );
            return Slot::Denied {
                retry_after: remaining.to_std().unwrap_or_default(),
            };
        }

        if now >= state.window_reset_at {
            state.calls_in_window = 1;
            state.window_reset_at = now + Duration::seconds(policy.window_seconds as i64);
            return Slot::Granted;
        }

        if let Some(max) = policy.max_calls_per_window {
            if state.calls_in_window >= max {
                let remaining = state.window_reset_at - now;
                debug!(api_system, account_id, "slot denied: window quota exhausted");
                return Slot::Denied {
                    retry_after: remaining.to_std().unwrap_or_default(),
                };
            }
        }

        state.calls_in_window += 1;
        Slot::Granted
    }

    /// Record the response code observed by an API invocation attempt.
    pub async fn report(&self, api_system: &str, account_id: &str, response_code: Option<u16>) {
        self.report_at(api_system, account_id, response_code, Utc::now())
            .await
    }

    /// Clock-injected variant of `report`.
    pub async fn report_at(
        &self,
        api_system: &str,
        account_id: &str,
        response_code: Option<u16>,
        now: DateTime<Utc>,
    ) {
        let Some(code) = response_code else {
            return;
        };
        let policy = self.policies.get(api_system).clone();
        let cell = self.state(api_system, account_id, now);
        let mut state = cell.lock().await;

        if policy.forbidden_codes.contains(&code) {
            state.banned_until = Some(now + Duration::days(BAN_DURATION_DAYS));
            warn!(
                api_system,
                account_id, code, "forbidden response: account banned until operator clears it"
            );
        } else if policy.rate_limit_codes.contains(&code) {
            state.backoff_until = Some(now + Duration::seconds(policy.backoff_seconds as i64));
            debug!(
                api_system,
                account_id,
                code,
                backoff_secs = policy.backoff_seconds,
                "rate-limit response: backoff started"
            );
        }
    }

    /// Operator action: lift a ban on a key.
    pub async fn clear_ban(&self, api_system: &str, account_id: &str) {
        let now = Utc::now();
        let cell = self.state(api_system, account_id, now);
        let mut state = cell.lock().await;
        if state.banned_until.take().is_some() {
            warn!(api_system, account_id, "ban cleared by operator");
        }
    }

    /// Whether the key is currently banned.
    pub async fn is_banned(&self, api_system: &str, account_id: &str) -> bool {
        let now = Utc::now();
        let cell = self.state(api_system, account_id, now);
        let state = cell.lock().await;
        state.banned_until.is_some_and(|until| until > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ExceptionPolicy;
    use std::collections::{HashMap, HashSet};

    fn limiter() -> RateLimiter {
        let policy = ExceptionPolicy {
            forbidden_codes: HashSet::from([403]),
            rate_limit_codes: HashSet::from([429]),
            backoff_seconds: 10,
            window_seconds: 60,
            max_calls_per_window: Some(3),
        };
        let registry = PolicyRegistry::new(HashMap::from([("binance".to_string(), policy)]));
        RateLimiter::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn grants_until_window_quota_is_exhausted() {
        let limiter = limiter();
        let t0 = Utc::now();

        for _ in 0..3 {
            assert!(limiter.acquire_at("binance", "x", t0).await.is_granted());
        }
        let denied = limiter.acquire_at("binance", "x", t0).await;
        assert!(matches!(denied, Slot::Denied { .. }));

        // A fresh window grants again
        let t1 = t0 + Duration::seconds(61);
        assert!(limiter.acquire_at("binance", "x", t1).await.is_granted());
    }

    #[tokio::test]
    async fn quotas_are_per_account_and_per_system() {
        let limiter = limiter();
        let t0 = Utc::now();
        for _ in 0..3 {
            assert!(limiter.acquire_at("binance", "x", t0).await.is_granted());
        }
        assert!(limiter.acquire_at("binance", "y", t0).await.is_granted());
        assert!(limiter.acquire_at("kraken", "x", t0).await.is_granted());
    }

    #[tokio::test]
    async fn rate_limit_code_starts_backoff() {
        let limiter = limiter();
        let t0 = Utc::now();

        limiter.report_at("binance", "x", Some(429), t0).await;

        // Denied mid-backoff with the remaining duration
        let denied = limiter.acquire_at("binance", "x", t0 + Duration::seconds(5)).await;
        match denied {
            Slot::Denied { retry_after } => {
                assert!(retry_after >= StdDuration::from_secs(4));
                assert!(retry_after <= StdDuration::from_secs(5));
            }
            Slot::Granted => panic!("expected denial during backoff"),
        }

        // Granted once the backoff has elapsed
        assert!(limiter
            .acquire_at("binance", "x", t0 + Duration::seconds(11))
            .await
            .is_granted());
    }

    #[tokio::test]
    async fn forbidden_code_bans_until_cleared() {
        let limiter = limiter();
        let t0 = Utc::now();

        limiter.report_at("binance", "x", Some(403), t0).await;
        assert!(limiter.is_banned("binance", "x").await);

        // Still banned far in the future
        let far = t0 + Duration::days(30);
        assert!(matches!(
            limiter.acquire_at("binance", "x", far).await,
            Slot::Denied { .. }
        ));

        limiter.clear_ban("binance", "x").await;
        assert!(limiter.acquire_at("binance", "x", far).await.is_granted());
    }

    #[tokio::test]
    async fn success_and_unclassified_codes_do_not_throttle() {
        let limiter = limiter();
        let t0 = Utc::now();
        limiter.report_at("binance", "x", None, t0).await;
        limiter.report_at("binance", "x", Some(200), t0).await;
        limiter.report_at("binance", "x", Some(500), t0).await;
        assert!(limiter.acquire_at("binance", "x", t0).await.is_granted());
    }

    #[tokio::test]
    async fn ban_outlasts_backoff_in_retry_after() {
        let limiter = limiter();
        let t0 = Utc::now();
        limiter.report_at("binance", "x", Some(429), t0).await;
        limiter.report_at("binance", "x", Some(403), t0).await;

        match limiter.acquire_at("binance", "x", t0).await {
            Slot::Denied { retry_after } => {
                // retry_after reflects the ban, not the 10s backoff
                assert!(retry_after > StdDuration::from_secs(86_400));
            }
            Slot::Granted => panic!("expected denial while banned"),
        }
    }
}
