//! End-to-end scenarios for the orchestration engine: ordered blocks,
//! throttling recovery, and full workflow chains over the in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

use conveyor::{
    Backoff, CycleResult, ExceptionClassifier, ExceptionPolicy, HandlerRegistry, JobContext,
    JobFailure, JobHandler, JobStatus, JobStore, MemoryJobStore, NewJob, Outcome, PolicyRegistry,
    RateLimiter, RetryPolicy, Worker, WorkerConfig, WorkflowBuilder,
};

fn binance_policy(backoff_seconds: u64) -> PolicyRegistry {
    PolicyRegistry::new(HashMap::from([(
        "binance".to_string(),
        ExceptionPolicy {
            forbidden_codes: HashSet::from([403]),
            rate_limit_codes: HashSet::from([429]),
            backoff_seconds,
            window_seconds: 60,
            max_calls_per_window: None,
        },
    )]))
}

struct Rig {
    store: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    registry: HandlerRegistry,
}

impl Rig {
    fn new(backoff_seconds: u64) -> Self {
        let policies = binance_policy(backoff_seconds);
        Self {
            store: Arc::new(MemoryJobStore::new()),
            limiter: Arc::new(RateLimiter::new(Arc::new(policies))),
            registry: HandlerRegistry::new(),
        }
    }

    fn worker(self, backoff_seconds: u64) -> (Arc<Worker>, Arc<dyn JobStore>, Arc<RateLimiter>) {
        let classifier = Arc::new(ExceptionClassifier::new(
            binance_policy(backoff_seconds),
            RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Fixed(StdDuration::from_millis(100)),
            },
        ));
        let worker = Arc::new(Worker::new(
            self.store.clone(),
            self.limiter.clone(),
            classifier,
            Arc::new(self.registry),
            WorkerConfig {
                queue_name: "orders".to_string(),
                poll_interval_ms: 10,
                ..WorkerConfig::default()
            },
        ));
        (worker, self.store, self.limiter)
    }
}

/// Handler that appends (step, phase) markers, optionally pausing between
/// start and end so overlapping execution would be visible.
struct Recording {
    events: Arc<Mutex<Vec<(u64, &'static str)>>>,
    hold_ms: u64,
}

#[async_trait]
impl JobHandler for Recording {
    async fn execute(
        &self,
        _ctx: &JobContext,
        arguments: &Value,
    ) -> Result<Outcome, JobFailure> {
        let step = arguments.get("step").and_then(|v| v.as_u64()).unwrap_or(0);
        self.events.lock().unwrap().push((step, "start"));
        if self.hold_ms > 0 {
            tokio::time::sleep(StdDuration::from_millis(self.hold_ms)).await;
        }
        self.events.lock().unwrap().push((step, "end"));
        Ok(Outcome::ok().with_code(200))
    }
}

fn block_args(account: &str, step: u64) -> Value {
    json!({ "account_id": account, "api_system": "binance", "step": step })
}

#[tokio::test]
async fn later_position_defers_until_predecessor_completes() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rig = Rig::new(10);
    rig.registry.register(
        "cancel_order",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 0,
        }),
    );
    rig.registry.register(
        "place_order",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 0,
        }),
    );
    let (worker, store, _) = rig.worker(10);

    let builder = WorkflowBuilder::new(store.clone(), "orders");
    let records = builder
        .block()
        .step("cancel_order", block_args("acct-1", 1))
        .step("place_order", block_args("acct-1", 2))
        .commit()
        .await
        .unwrap();

    // Hold position 1 in `running` so a claim reaches position 2 first
    let first = store.claim_next_due("orders").await.unwrap().unwrap();
    assert_eq!(first.id, records[0].id);

    // Position 2 must defer: its predecessor is not completed
    assert_eq!(worker.run_once().await.unwrap(), CycleResult::Deferred);
    let second = store.get(records[1].id).await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Reset);
    assert_eq!(second.attempts, 0);
    assert!(events.lock().unwrap().is_empty());

    // Completing position 1 unblocks position 2 on the next poll; the
    // deferral gated it for one 10ms poll interval
    store.mark_completed(first.id, None).await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(30)).await;
    assert_eq!(worker.run_once().await.unwrap(), CycleResult::Completed);
    let second = store.get(records[1].id).await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Completed);
}

#[tokio::test]
async fn concurrent_workers_never_run_block_positions_out_of_order() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rig = Rig::new(10);
    rig.registry.register(
        "order_step",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 20,
        }),
    );
    let (worker_a, store, limiter) = rig.worker(10);

    // Second worker over the same store and limiter
    let classifier = Arc::new(ExceptionClassifier::new(
        binance_policy(10),
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed(StdDuration::from_millis(100)),
        },
    ));
    let mut registry_b = HandlerRegistry::new();
    registry_b.register(
        "order_step",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 20,
        }),
    );
    let worker_b = Arc::new(Worker::new(
        store.clone(),
        limiter,
        classifier,
        Arc::new(registry_b),
        WorkerConfig {
            queue_name: "orders".to_string(),
            poll_interval_ms: 10,
            ..WorkerConfig::default()
        },
    ));

    let builder = WorkflowBuilder::new(store.clone(), "orders");
    let records = builder
        .block()
        .step("order_step", block_args("acct-1", 1))
        .step("order_step", block_args("acct-1", 2))
        .step("order_step", block_args("acct-1", 3))
        .commit()
        .await
        .unwrap();

    let completed = Arc::new(AtomicU64::new(0));
    let mut tasks = Vec::new();
    for worker in [worker_a, worker_b] {
        let completed = completed.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..400 {
                match worker.run_once().await.unwrap() {
                    CycleResult::Completed => {
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => tokio::time::sleep(StdDuration::from_millis(5)).await,
                }
                if completed.load(Ordering::SeqCst) >= 3 {
                    break;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for record in &records {
        let record = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed, "record {}", record.id);
    }

    // Position k must not start before position k-1 has ended
    let events = events.lock().unwrap();
    let mut ended = HashSet::new();
    for (step, phase) in events.iter() {
        match *phase {
            "start" => {
                if *step > 1 {
                    assert!(
                        ended.contains(&(step - 1)),
                        "position {step} started before {} ended; events: {events:?}",
                        step - 1
                    );
                }
            }
            "end" => {
                ended.insert(*step);
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(ended.len(), 3);
}

#[tokio::test]
async fn throttled_account_defers_then_recovers() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rig = Rig::new(1);
    rig.registry.register(
        "place_order",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 0,
        }),
    );
    let (worker, store, limiter) = rig.worker(1);

    // The exchange just told this account to slow down
    limiter.report("binance", "acct-1", Some(429)).await;

    store
        .enqueue(NewJob::unordered(
            "place_order",
            "orders",
            block_args("acct-1", 1),
        ))
        .await
        .unwrap();

    // Denied slot: deferral, no attempt, no handler call
    assert_eq!(worker.run_once().await.unwrap(), CycleResult::Deferred);
    assert!(events.lock().unwrap().is_empty());

    // After the 1s backoff the record becomes due and completes
    tokio::time::sleep(StdDuration::from_millis(1100)).await;
    assert_eq!(worker.run_once().await.unwrap(), CycleResult::Completed);
    assert_eq!(events.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn replace_order_workflow_runs_cancel_before_place() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let mut rig = Rig::new(10);
    rig.registry.register(
        "cancel_order",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 0,
        }),
    );
    rig.registry.register(
        "place_order",
        Arc::new(Recording {
            events: events.clone(),
            hold_ms: 0,
        }),
    );
    let (worker, store, _) = rig.worker(10);

    let builder = WorkflowBuilder::new(store.clone(), "orders");
    let records = builder
        .replace_order("acct-1", "binance", "10", "BTCUSDT", dec!(101.5), dec!(0.5))
        .await
        .unwrap();

    worker.drain().await.unwrap();

    for record in &records {
        let record = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 1);
    }

    let stats = worker.get_stats().await;
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);
}
