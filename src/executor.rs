//! Worker loop: claims due records, runs the sequencing and throttle gates,
//! invokes domain handlers, and applies the classified failure action.
//!
//! Deferrals (sequencing not satisfied, limiter denied) return the record to
//! the queue behind a `not_before` gate without counting an attempt, so the
//! worker moves on to other due records instead of re-claiming the same one.
//! Retryable failures count against attempts and re-queue behind a backoff
//! gate. Fatal failures mark the record failed and fire the resolution hook;
//! the sequencer then halts any downstream positions of the same block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::classifier::{Action, ExceptionClassifier};
use crate::error::{ConveyorError, Result};
use crate::handler::{HandlerRegistry, JobContext};
use crate::rate_limiter::{RateLimiter, Slot};
use crate::sequencer::Sequencer;
use crate::store::JobStore;

/// Configuration for a worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue lane this worker polls
    pub queue_name: String,
    /// Interval between polls when the queue is idle (milliseconds)
    pub poll_interval_ms: u64,
    /// Age after which an untouched due record is abandoned (seconds)
    pub stale_after_secs: u64,
    /// Run the stale sweep every this many poll ticks
    pub sweep_every_ticks: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            poll_interval_ms: 500,
            stale_after_secs: 600,
            sweep_every_ticks: 120,
        }
    }
}

/// What a single claim cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleResult {
    /// Nothing was due
    Idle,
    /// Record returned to the queue without an execution attempt
    Deferred,
    Completed,
    /// Failure classified Retry; record re-queued behind a backoff gate
    Retried,
    Failed,
    /// Failure classified Ignore; record completed with the error retained
    Ignored,
}

/// Deferred records re-poll at least hourly even when the limiter reports a
/// longer cooldown (a ban), so an operator clearing the ban unblocks them.
const MAX_DEFER_GATE_SECS: u64 = 3600;

/// Worker statistics
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub deferred: u64,
    pub ignored: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

/// A job executor polling one queue
pub struct Worker {
    store: Arc<dyn JobStore>,
    sequencer: Sequencer,
    rate_limiter: Arc<RateLimiter>,
    classifier: Arc<ExceptionClassifier>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    running: AtomicBool,
    stats: RwLock<WorkerStats>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn JobStore>,
        rate_limiter: Arc<RateLimiter>,
        classifier: Arc<ExceptionClassifier>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            sequencer: Sequencer::new(store.clone()),
            store,
            rate_limiter,
            classifier,
            registry,
            config,
            running: AtomicBool::new(false),
            stats: RwLock::new(WorkerStats::default()),
        }
    }

    pub async fn get_stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Claim and process at most one record.
    pub async fn run_once(&self) -> Result<CycleResult> {
        let Some(record) = self.store.claim_next_due(&self.config.queue_name).await? else {
            return Ok(CycleResult::Idle);
        };

        {
            let mut stats = self.stats.write().await;
            stats.claimed += 1;
            stats.last_cycle = Some(Utc::now());
        }

        let id = record.id;
        let job_type = record.job_type.clone();

        // Sequencing gate: a record whose predecessor is not completed goes
        // back to the queue with no attempt counted. The one-poll gate lets
        // the same tick reach unrelated records queued behind a stalled
        // block instead of re-claiming this one.
        if !self.sequencer.is_runnable(&record).await? {
            let gate =
                Utc::now() + Duration::milliseconds(self.config.poll_interval_ms as i64);
            self.store.reset_to_pending(id, Some(gate)).await?;
            self.bump(|s| s.deferred += 1).await;
            return Ok(CycleResult::Deferred);
        }

        // Throttle gate for API-bound jobs. Denial is a deferral, not a
        // failure.
        let api_key = match (record.api_system(), record.account_id()) {
            (Some(api), Some(account)) => Some((api.to_string(), account.to_string())),
            _ => None,
        };
        if let Some((api, account)) = &api_key {
            if let Slot::Denied { retry_after } = self.rate_limiter.acquire(api, account).await {
                debug!(
                    id,
                    job_type,
                    api_system = %api,
                    retry_after_secs = retry_after.as_secs(),
                    "rate limit denied, deferring"
                );
                let capped =
                    retry_after.min(std::time::Duration::from_secs(MAX_DEFER_GATE_SECS));
                let gate =
                    Utc::now() + Duration::from_std(capped).unwrap_or_else(|_| Duration::zero());
                self.store.reset_to_pending(id, Some(gate)).await?;
                self.bump(|s| s.deferred += 1).await;
                return Ok(CycleResult::Deferred);
            }
        }

        // From here on this is a genuine execution attempt.
        let attempts = self.store.increment_attempts(id).await? as u32;

        let Some(handler) = self.registry.get(&record.job_type) else {
            error!(id, job_type, "no handler registered");
            let err = ConveyorError::HandlerNotFound(job_type.clone());
            self.store.mark_failed(id, err.to_string()).await?;
            self.bump(|s| s.failed += 1).await;
            return Ok(CycleResult::Failed);
        };

        let ctx = JobContext::from_record(&record, attempts, self.rate_limiter.clone());

        match handler.execute(&ctx, &record.arguments).await {
            Ok(outcome) => {
                if let Some((api, account)) = &api_key {
                    self.rate_limiter
                        .report(api, account, outcome.response_code)
                        .await;
                }
                self.store.mark_completed(id, None).await?;
                for follow_up in outcome.follow_ups {
                    self.store.enqueue(follow_up).await?;
                }
                debug!(id, job_type, attempts, "job completed");
                self.bump(|s| s.completed += 1).await;
                Ok(CycleResult::Completed)
            }
            Err(failure) => {
                if let Some((api, account)) = &api_key {
                    self.rate_limiter
                        .report(api, account, failure.response_code)
                        .await;
                }

                let api_system = record.api_system().unwrap_or_default();
                match self.classifier.classify(api_system, &failure, attempts) {
                    Action::Retry { delay } => {
                        let gate = Utc::now()
                            + Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                        warn!(
                            id,
                            job_type,
                            attempts,
                            delay_secs = delay.as_secs(),
                            error = %failure,
                            "job failed, retrying"
                        );
                        self.store.reset_to_pending(id, Some(gate)).await?;
                        self.bump(|s| s.retried += 1).await;
                        Ok(CycleResult::Retried)
                    }
                    Action::Abort => {
                        error!(id, job_type, attempts, error = %failure, "job failed fatally");
                        self.store.mark_failed(id, failure.to_string()).await?;
                        handler.resolve(&ctx, &record.arguments).await;
                        self.bump(|s| s.failed += 1).await;
                        Ok(CycleResult::Failed)
                    }
                    Action::Ignore => {
                        info!(id, job_type, error = %failure, "job ended benignly");
                        self.store
                            .mark_completed(id, Some(failure.to_string()))
                            .await?;
                        self.bump(|s| s.ignored += 1).await;
                        Ok(CycleResult::Ignored)
                    }
                }
            }
        }
    }

    /// Process records until nothing is due. Deferred records carry a
    /// `not_before` gate, so the loop skips past them to whatever else is
    /// due rather than re-claiming the same record.
    pub async fn drain(&self) -> Result<WorkerStats> {
        while self.run_once().await? != CycleResult::Idle {}
        Ok(self.get_stats().await)
    }

    /// Start the polling loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(queue = %self.config.queue_name, "worker already running");
            return;
        }

        info!(
            queue = %self.config.queue_name,
            poll_interval_ms = self.config.poll_interval_ms,
            "worker started"
        );

        let worker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                worker.config.poll_interval_ms,
            ));
            let mut ticks = 0u32;

            while worker.running.load(Ordering::SeqCst) {
                interval.tick().await;
                ticks = ticks.wrapping_add(1);

                loop {
                    match worker.run_once().await {
                        Ok(CycleResult::Idle) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            error!(queue = %worker.config.queue_name, "worker cycle failed: {e}");
                            break;
                        }
                    }
                }

                if ticks % worker.config.sweep_every_ticks == 0 {
                    let threshold = Duration::seconds(worker.config.stale_after_secs as i64);
                    if let Err(e) = worker.store.abandon_stale(threshold).await {
                        error!("stale sweep failed: {e}");
                    }
                }
            }

            info!(queue = %worker.config.queue_name, "worker stopped");
        });
    }

    /// Request the polling loop to stop after the current cycle.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn bump(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.write().await;
        f(&mut stats);
    }
}
