//! End-to-end behaviour of the worker pool against the in-memory and RocksDB backends

use async_trait::async_trait;
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use jobq_core::{
    Chunk, ErrorCode, HandlerOutcome, Job, JobKind, JobStatus, Task, TaskPayload, TaskStatus,
};
use jobq_persistence::{ChunkWrite, MemoryStore, ResultStore, RocksStore, RocksStoreConfig};
use jobq_queue::{MemoryQueue, Queue, QueueMessage};
use jobq_worker::{
    Backends, BatchHandler, CallbackConfig, CallbackPayload, HandlerRegistry, HealthTracker,
    JobMetrics, Ledger, LedgerDebitHandler, ProcessOutcome, RetryPolicy, TaskContext,
    TaskHandler, WorkerConfig, WorkerPool,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    pool: Arc<WorkerPool>,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    metrics: Arc<JobMetrics>,
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: Some("it-worker".to_string()),
        concurrency: 4,
        task_timeout_secs: 5,
        claim_lease_secs: 1,
        graceful_shutdown_timeout_secs: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            unclassified_max_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_ms: 0,
        },
        callback: CallbackConfig {
            max_attempts: 2,
            base_delay_ms: 10,
            request_timeout_secs: 2,
        },
        ..Default::default()
    }
}

fn harness(registry: HandlerRegistry, config: WorkerConfig) -> Harness {
    harness_with_visibility(registry, config, Duration::from_secs(30))
}

fn harness_with_visibility(
    registry: HandlerRegistry,
    config: WorkerConfig,
    visibility_timeout: Duration,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new(visibility_timeout));
    let metrics = Arc::new(JobMetrics::new().unwrap());
    let backends = Backends {
        queue: queue.clone(),
        store: store.clone(),
        dedup: store.clone(),
    };
    let pool = WorkerPool::new(
        config,
        registry,
        backends,
        metrics.clone(),
        Arc::new(HealthTracker::new(Duration::from_secs(60))),
    )
    .unwrap();

    Harness {
        pool: Arc::new(pool),
        store,
        queue,
        metrics,
    }
}

async fn submit(h: &Harness, task_type: &str, payload: Value, kind: JobKind, url: Option<String>) -> Task {
    let task = Task::builder(task_type, payload).build().unwrap();
    let job = Job::new(task.job_id, task.id, kind, url);
    h.store.create_job(job, task.clone()).unwrap();
    h.queue.publish(QueueMessage::for_task(&task)).await.unwrap();
    task
}

async fn wait_for_status(h: &Harness, task: &Task, expected: JobStatus) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if h.store.get_status(&task.job_id).unwrap() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job never reached {}", expected));
}

fn start(h: &Harness) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(h.pool.clone().run(shutdown.clone()));
    (shutdown, handle)
}

/// Counts invocations and sleeps a little so duplicates overlap
struct CountingHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(&self, _ctx: &TaskContext, payload: &TaskPayload) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        HandlerOutcome::Success(payload.clone())
    }
}

/// Fails transiently until `failures` attempts have been used up
struct FlakyTaskHandler {
    failures: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TaskHandler for FlakyTaskHandler {
    async fn handle(&self, ctx: &TaskContext, _payload: &TaskPayload) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt <= self.failures {
            HandlerOutcome::transient("downstream unavailable")
        } else {
            HandlerOutcome::Success(json!({"attempt": ctx.attempt}))
        }
    }
}

#[derive(Clone, Copy)]
enum Crash {
    /// Chunk 5 fails transiently on its first run
    Fail,
    /// Chunk 5 never returns on its first run
    Hang,
    /// The worker stops after chunk 3 committed, before chunk 4 does any work
    HaltBeforeFour,
}

/// Records every chunk it is given and crashes once
struct CrashingBatchHandler {
    seen: Arc<Mutex<HashMap<u64, u32>>>,
    crash: Crash,
    halted: Arc<AtomicBool>,
}

impl CrashingBatchHandler {
    fn new(seen: Arc<Mutex<HashMap<u64, u32>>>, crash: Crash) -> Self {
        CrashingBatchHandler {
            seen,
            crash,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BatchHandler for CrashingBatchHandler {
    async fn process_chunk(
        &self,
        _ctx: &TaskContext,
        chunk: &Chunk,
        records: &[Value],
    ) -> HandlerOutcome<Vec<ChunkWrite>> {
        if matches!(self.crash, Crash::HaltBeforeFour)
            && chunk.chunk_index == 4
            && !self.halted.swap(true, Ordering::SeqCst)
        {
            std::future::pending::<()>().await;
        }

        let runs = {
            let mut seen = self.seen.lock();
            let runs = seen.entry(chunk.chunk_index).or_insert(0);
            *runs += 1;
            *runs
        };

        if chunk.chunk_index == 5 && runs == 1 {
            match self.crash {
                Crash::Fail => return HandlerOutcome::transient("worker lost its connection"),
                Crash::Hang => std::future::pending::<()>().await,
                Crash::HaltBeforeFour => {}
            }
        }

        let writes = (chunk.record_range.start..)
            .zip(records)
            .map(|(offset, record)| ChunkWrite::new(format!("{:020}", offset), record.clone()))
            .collect();
        HandlerOutcome::Success(writes)
    }
}

fn thousand_records() -> (Value, JobKind) {
    let records: Vec<Value> = (0..1000).map(|i| json!(i)).collect();
    (
        json!({ "records": records }),
        JobKind::Bulk {
            total_records: 1000,
            chunk_size: 100,
        },
    )
}

fn assert_chunks_ran_once_except_five(seen: &HashMap<u64, u32>) {
    for index in 0..10u64 {
        let expected = if index == 5 { 2 } else { 1 };
        assert_eq!(seen.get(&index), Some(&expected), "chunk {}", index);
    }
}

#[tokio::test]
async fn test_duplicate_delivery_debits_once() {
    let ledger = Ledger::new();
    let registry = HandlerRegistry::builder()
        .task("ledger.debit", LedgerDebitHandler::new(ledger.clone()))
        .build();
    let h = harness(registry, fast_config());

    let task = submit(
        &h,
        "ledger.debit",
        json!({"account": "acct-1", "amount": 100}),
        JobKind::Simple,
        None,
    )
    .await;
    h.queue.publish(QueueMessage::for_task(&task)).await.unwrap();

    let (shutdown, handle) = start(&h);
    wait_for_status(&h, &task, JobStatus::Succeeded).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(ledger.balance("acct-1"), -100);
}

#[tokio::test]
async fn test_concurrent_duplicates_execute_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::builder()
        .task("count", CountingHandler { calls: calls.clone() })
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "count", json!({"n": 1}), JobKind::Simple, None).await;
    for _ in 0..4 {
        h.queue.publish(QueueMessage::for_task(&task)).await.unwrap();
    }

    let (shutdown, handle) = start(&h);
    wait_for_status(&h, &task, JobStatus::Succeeded).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.metrics.duplicates_total.get() + h.metrics.deferred_total.get() >= 1);
}

#[tokio::test]
async fn test_bulk_job_resumes_after_failed_chunk() {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let registry = HandlerRegistry::builder()
        .batch(
            "records.copy",
            CrashingBatchHandler::new(seen.clone(), Crash::Fail),
        )
        .build();
    let h = harness(registry, fast_config());

    let (payload, kind) = thousand_records();
    let task = submit(&h, "records.copy", payload, kind, None).await;

    let (shutdown, handle) = start(&h);
    wait_for_status(&h, &task, JobStatus::Succeeded).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_chunks_ran_once_except_five(&seen.lock());
    assert_eq!(h.store.chunk_outputs(&task.job_id).unwrap().len(), 1000);

    let job = h.store.get_job(&task.job_id).unwrap().unwrap();
    assert_eq!(job.checkpoint_offset, 10);
    assert_eq!(job.result, Some(json!({"recordsProcessed": 1000, "chunks": 10})));
    assert_eq!(h.store.get_task(&task.id).unwrap().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_bulk_job_resumes_after_worker_crash() {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let registry = HandlerRegistry::builder()
        .batch(
            "records.copy",
            CrashingBatchHandler::new(seen.clone(), Crash::Hang),
        )
        .build();
    let h = harness(registry, fast_config());

    let (payload, kind) = thousand_records();
    let task = submit(&h, "records.copy", payload, kind, None).await;

    // First worker commits chunks 0..5 and dies inside chunk 5
    let delivery = h.queue.receive().await.unwrap().unwrap();
    let pool = h.pool.clone();
    let crashed = tokio::spawn(async move { pool.handle_delivery("crashed#0", delivery).await });
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = h.store.get_job(&task.job_id).unwrap().unwrap();
            if job.checkpoint_offset == 5 && seen.lock().contains_key(&5) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    crashed.abort();

    // Restart: release the in-flight task and republish it
    let recovered = h.store.recover_in_flight().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].status, TaskStatus::Pending);
    h.queue
        .publish(QueueMessage::for_task(&recovered[0]))
        .await
        .unwrap();

    // The crashed claim holds the key until its lease lapses
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let Some(delivery) = h.queue.receive().await.unwrap() else {
                panic!("queue closed");
            };
            if delivery.message.task_id != task.id {
                continue;
            }
            match h.pool.handle_delivery("restarted#0", delivery).await.unwrap() {
                ProcessOutcome::DuplicateInFlight { .. } => continue,
                outcome => return outcome,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(outcome, ProcessOutcome::Succeeded);
    assert_chunks_ran_once_except_five(&seen.lock());
    assert_eq!(h.store.chunk_outputs(&task.job_id).unwrap().len(), 1000);
}

#[tokio::test]
async fn test_bulk_job_resumes_at_first_uncommitted_chunk() {
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let halted = Arc::new(AtomicBool::new(false));
    let registry = HandlerRegistry::builder()
        .batch(
            "records.copy",
            CrashingBatchHandler {
                seen: seen.clone(),
                crash: Crash::HaltBeforeFour,
                halted: halted.clone(),
            },
        )
        .build();
    let h = harness(registry, fast_config());

    let (payload, kind) = thousand_records();
    let task = submit(&h, "records.copy", payload, kind, None).await;

    // Chunks 0..4 commit, then the worker dies before chunk 4 does anything
    let delivery = h.queue.receive().await.unwrap().unwrap();
    let pool = h.pool.clone();
    let crashed = tokio::spawn(async move { pool.handle_delivery("crashed#0", delivery).await });
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = h.store.get_job(&task.job_id).unwrap().unwrap();
            if job.checkpoint_offset == 4 && halted.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    crashed.abort();

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        assert!((0..4u64).all(|index| seen.get(&index) == Some(&1)));
    }

    let recovered = h.store.recover_in_flight().unwrap();
    assert_eq!(recovered.len(), 1);
    h.queue
        .publish(QueueMessage::for_task(&recovered[0]))
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let Some(delivery) = h.queue.receive().await.unwrap() else {
                panic!("queue closed");
            };
            if delivery.message.task_id != task.id {
                continue;
            }
            match h.pool.handle_delivery("restarted#0", delivery).await.unwrap() {
                ProcessOutcome::DuplicateInFlight { .. } => continue,
                outcome => return outcome,
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(outcome, ProcessOutcome::Succeeded);
    let seen = seen.lock();
    for index in 0..10u64 {
        assert_eq!(seen.get(&index), Some(&1), "chunk {}", index);
    }
    assert_eq!(h.store.chunk_outputs(&task.job_id).unwrap().len(), 1000);
    assert_eq!(h.store.get_job(&task.job_id).unwrap().unwrap().checkpoint_offset, 10);
}

/// Takes `delay` per chunk and counts how often each chunk ran
struct SlowChunkHandler {
    runs: Arc<Mutex<HashMap<u64, u32>>>,
    delay: Duration,
}

#[async_trait]
impl BatchHandler for SlowChunkHandler {
    async fn process_chunk(
        &self,
        _ctx: &TaskContext,
        chunk: &Chunk,
        records: &[Value],
    ) -> HandlerOutcome<Vec<ChunkWrite>> {
        *self.runs.lock().entry(chunk.chunk_index).or_insert(0) += 1;
        tokio::time::sleep(self.delay).await;
        HandlerOutcome::Success(
            records
                .iter()
                .map(|r| ChunkWrite::new(format!("row-{}", chunk.chunk_index), r.clone()))
                .collect(),
        )
    }
}

fn six_slow_chunks() -> (Value, JobKind) {
    (
        json!({ "records": [0, 1, 2, 3, 4, 5] }),
        JobKind::Bulk {
            total_records: 6,
            chunk_size: 1,
        },
    )
}

fn slow_bulk_config() -> WorkerConfig {
    WorkerConfig {
        task_timeout_secs: 1,
        claim_lease_secs: 2,
        ..fast_config()
    }
}

#[tokio::test]
async fn test_long_bulk_job_keeps_its_claim() {
    let runs = Arc::new(Mutex::new(HashMap::new()));
    let registry = HandlerRegistry::builder()
        .batch(
            "records.slow",
            SlowChunkHandler {
                runs: runs.clone(),
                delay: Duration::from_millis(500),
            },
        )
        .build();
    let h = harness(registry, slow_bulk_config());

    let (payload, kind) = six_slow_chunks();
    let task = submit(&h, "records.slow", payload, kind, None).await;

    let first = h.queue.receive().await.unwrap().unwrap();
    let pool = h.pool.clone();
    let running = tokio::spawn(async move { pool.handle_delivery("slot#0", first).await });

    // A second copy arrives after the initial lease would have lapsed
    tokio::time::sleep(Duration::from_millis(2300)).await;
    h.queue.publish(QueueMessage::for_task(&task)).await.unwrap();
    let second = h.queue.receive().await.unwrap().unwrap();
    let outcome = h.pool.handle_delivery("slot#1", second).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::DuplicateInFlight { .. }));

    assert_eq!(running.await.unwrap().unwrap(), ProcessOutcome::Succeeded);
    let runs = runs.lock();
    for index in 0..6u64 {
        assert_eq!(runs.get(&index), Some(&1), "chunk {}", index);
    }
    assert_eq!(h.store.get_task(&task.id).unwrap().unwrap().attempts, 1);
}

#[tokio::test]
async fn test_long_bulk_job_is_not_redelivered() {
    let runs = Arc::new(Mutex::new(HashMap::new()));
    let registry = HandlerRegistry::builder()
        .batch(
            "records.slow",
            SlowChunkHandler {
                runs: runs.clone(),
                delay: Duration::from_millis(500),
            },
        )
        .build();
    let h = harness_with_visibility(registry, slow_bulk_config(), Duration::from_secs(1));

    let (payload, kind) = six_slow_chunks();
    let task = submit(&h, "records.slow", payload, kind, None).await;

    let (shutdown, handle) = start(&h);
    wait_for_status(&h, &task, JobStatus::Succeeded).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert!(runs.lock().values().all(|&n| n == 1));
    assert_eq!(h.metrics.deferred_total.get(), 0);
    assert_eq!(h.metrics.duplicates_total.get(), 0);
    assert_eq!(h.queue.depth(), 0);
}

#[tokio::test]
async fn test_permanent_failure_goes_straight_to_dead_letters() {
    let registry = HandlerRegistry::builder()
        .task("ledger.debit", LedgerDebitHandler::new(Ledger::new()))
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "ledger.debit", json!({"amount": -5}), JobKind::Simple, None).await;
    let delivery = h.queue.receive().await.unwrap().unwrap();
    let outcome = h.pool.handle_delivery("slot#0", delivery).await.unwrap();

    assert_eq!(
        outcome,
        ProcessOutcome::DeadLettered {
            code: ErrorCode::PermanentFailure
        }
    );
    let entries = h.store.list_dead_letters().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_task_id, task.id);
    assert_eq!(entries[0].attempts, 1);
    assert_eq!(h.metrics.retries_total.get(), 0);
    assert_eq!(h.store.get_status(&task.job_id).unwrap(), Some(JobStatus::Dead));
    assert_eq!(h.queue.depth(), 0);
}

#[tokio::test]
async fn test_transient_failure_retries_with_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = HandlerRegistry::builder()
        .task(
            "flaky",
            FlakyTaskHandler {
                failures: 2,
                calls: calls.clone(),
            },
        )
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "flaky", json!({}), JobKind::Simple, None).await;

    let first = h.queue.receive().await.unwrap().unwrap();
    let outcome = h.pool.handle_delivery("slot#0", first).await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Retried {
            delay: Duration::from_millis(20)
        }
    );

    let (shutdown, handle) = start(&h);
    wait_for_status(&h, &task, JobStatus::Succeeded).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.metrics.retries_total.get(), 2);
    assert_eq!(h.store.get_task(&task.id).unwrap().unwrap().attempts, 3);
}

#[tokio::test]
async fn test_transient_exhaustion_dead_letters() {
    let registry = HandlerRegistry::builder()
        .task(
            "flaky",
            FlakyTaskHandler {
                failures: u32::MAX,
                calls: Arc::new(AtomicU32::new(0)),
            },
        )
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "flaky", json!({}), JobKind::Simple, None).await;

    let (shutdown, handle) = start(&h);
    wait_for_status(&h, &task, JobStatus::Dead).await;
    shutdown.cancel();
    handle.await.unwrap();

    let entries = h.store.list_dead_letters().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].error_code, ErrorCode::TransientExhausted);
    assert_eq!(entries[0].attempts, 3);
}

#[derive(Clone)]
struct Receiver {
    calls: Arc<Mutex<Vec<CallbackPayload>>>,
    status: StatusCode,
}

async fn receive(State(receiver): State<Receiver>, Json(payload): Json<CallbackPayload>) -> StatusCode {
    receiver.calls.lock().push(payload);
    receiver.status
}

async fn serve(status: StatusCode) -> (String, Arc<Mutex<Vec<CallbackPayload>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().route("/hook", post(receive)).with_state(Receiver {
        calls: calls.clone(),
        status,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/hook", addr), calls)
}

async fn wait_for_calls(calls: &Arc<Mutex<Vec<CallbackPayload>>>, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.lock().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_callback_receives_terminal_status() {
    let (url, calls) = serve(StatusCode::OK).await;
    let registry = HandlerRegistry::builder()
        .task("count", CountingHandler {
            calls: Arc::new(AtomicU32::new(0)),
        })
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "count", json!({"v": 7}), JobKind::Simple, Some(url)).await;
    let delivery = h.queue.receive().await.unwrap().unwrap();
    h.pool.handle_delivery("slot#0", delivery).await.unwrap();

    wait_for_calls(&calls, 1).await;
    let received = calls.lock()[0].clone();
    assert_eq!(received.job_id, task.job_id);
    assert_eq!(received.status, JobStatus::Succeeded);
    assert_eq!(received.result, Some(json!({"v": 7})));
}

#[tokio::test]
async fn test_failing_callback_leaves_job_status_alone() {
    let (url, calls) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
    let registry = HandlerRegistry::builder()
        .task("count", CountingHandler {
            calls: Arc::new(AtomicU32::new(0)),
        })
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "count", json!({}), JobKind::Simple, Some(url)).await;
    let delivery = h.queue.receive().await.unwrap().unwrap();
    let outcome = h.pool.handle_delivery("slot#0", delivery).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Succeeded);

    wait_for_calls(&calls, 2).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.metrics.callback_failures_total.get() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        h.store.get_status(&task.job_id).unwrap(),
        Some(JobStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_requeue_from_dead_letters_runs_again() {
    let ledger = Ledger::new();
    let registry = HandlerRegistry::builder()
        .task("ledger.debit", LedgerDebitHandler::new(ledger.clone()))
        .build();
    let h = harness(registry, fast_config());

    let task = submit(&h, "ledger.debit", json!({"account": "a", "amount": 0}), JobKind::Simple, None).await;
    let delivery = h.queue.receive().await.unwrap().unwrap();
    h.pool.handle_delivery("slot#0", delivery).await.unwrap();

    let entry = h.store.list_dead_letters().unwrap().remove(0);
    let requeued = h.pool.governor().requeue(&entry.id).await.unwrap();
    assert_eq!(requeued.id, task.id);
    assert_eq!(requeued.attempts, 0);
    assert_eq!(h.store.get_status(&task.job_id).unwrap(), Some(JobStatus::Pending));

    // The handler still rejects the payload, so it lands back in the DLQ
    let delivery = h.queue.receive().await.unwrap().unwrap();
    let outcome = h.pool.handle_delivery("slot#0", delivery).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::DeadLettered { .. }));
    assert_eq!(h.store.list_dead_letters().unwrap().len(), 1);
}

#[tokio::test]
async fn test_bulk_resume_survives_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        Arc::new(
            RocksStore::open(RocksStoreConfig {
                data_dir: dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        )
    };
    let seen = Arc::new(Mutex::new(HashMap::new()));
    let registry = HandlerRegistry::builder()
        .batch(
            "records.copy",
            CrashingBatchHandler::new(seen.clone(), Crash::Fail),
        )
        .build();
    let pool_on = |store: Arc<RocksStore>, queue: Arc<MemoryQueue>| {
        WorkerPool::new(
            fast_config(),
            registry.clone(),
            Backends {
                queue,
                store: store.clone(),
                dedup: store,
            },
            Arc::new(JobMetrics::new().unwrap()),
            Arc::new(HealthTracker::new(Duration::from_secs(60))),
        )
        .unwrap()
    };

    let (payload, kind) = thousand_records();
    let task = Task::builder("records.copy", payload).build().unwrap();
    let job_id = task.job_id;

    // First process: chunks 0..5 commit, chunk 5 fails and the process exits
    {
        let store = open();
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
        store
            .create_job(Job::new(task.job_id, task.id, kind, None), task.clone())
            .unwrap();
        queue.publish(QueueMessage::for_task(&task)).await.unwrap();

        let pool = pool_on(store.clone(), queue.clone());
        let delivery = queue.receive().await.unwrap().unwrap();
        let outcome = pool.handle_delivery("first#0", delivery).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retried { .. }));
        assert_eq!(store.get_job(&job_id).unwrap().unwrap().checkpoint_offset, 5);
    }

    // Second process: a fresh queue, fed by recovery
    let store = open();
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let pending = store.recover_in_flight().unwrap();
    assert_eq!(pending.len(), 1);
    queue.publish(QueueMessage::for_task(&pending[0])).await.unwrap();

    let pool = pool_on(store.clone(), queue.clone());
    let delivery = queue.receive().await.unwrap().unwrap();
    let outcome = pool.handle_delivery("second#0", delivery).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Succeeded);
    assert_chunks_ran_once_except_five(&seen.lock());
    assert_eq!(store.chunk_outputs(&job_id).unwrap().len(), 1000);
    assert_eq!(store.get_job(&job_id).unwrap().unwrap().checkpoint_offset, 10);
}
