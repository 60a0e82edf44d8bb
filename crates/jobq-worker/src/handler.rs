use async_trait::async_trait;
use dashmap::DashMap;
use jobq_core::{Chunk, HandlerOutcome, JobId, TaskId, TaskPayload};
use jobq_persistence::ChunkWrite;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// What a handler knows about the execution it runs in
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_type: String,
    pub idempotency_key: String,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Handler for a task executed in one invocation
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext, payload: &TaskPayload) -> HandlerOutcome;
}

/// Handler for bulk jobs, invoked once per chunk.
///
/// The writes it returns are committed together with the chunk checkpoint, so
/// a chunk either lands completely or not at all.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn process_chunk(
        &self,
        ctx: &TaskContext,
        chunk: &Chunk,
        records: &[Value],
    ) -> HandlerOutcome<Vec<ChunkWrite>>;
}

#[derive(Clone)]
pub enum RegisteredHandler {
    Task(Arc<dyn TaskHandler>),
    Batch(Arc<dyn BatchHandler>),
}

impl RegisteredHandler {
    pub fn is_batch(&self) -> bool {
        matches!(self, RegisteredHandler::Batch(_))
    }
}

/// Task-type to handler mapping, frozen once built
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, RegisteredHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn get(&self, task_type: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(task_type)
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistryBuilder {
    pub fn task<H: TaskHandler + 'static>(mut self, task_type: impl Into<String>, handler: H) -> Self {
        self.handlers
            .insert(task_type.into(), RegisteredHandler::Task(Arc::new(handler)));
        self
    }

    pub fn batch<H: BatchHandler + 'static>(
        mut self,
        task_type: impl Into<String>,
        handler: H,
    ) -> Self {
        self.handlers
            .insert(task_type.into(), RegisteredHandler::Batch(Arc::new(handler)));
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}

/// Returns the payload unchanged
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, _ctx: &TaskContext, payload: &TaskPayload) -> HandlerOutcome {
        HandlerOutcome::Success(payload.clone())
    }
}

/// Simulates work by sleeping `{"ms": n}` milliseconds (default from config)
pub struct SleepHandler {
    default_ms: u64,
}

impl SleepHandler {
    pub fn new(default_ms: u64) -> Self {
        SleepHandler { default_ms }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, _ctx: &TaskContext, payload: &TaskPayload) -> HandlerOutcome {
        let ms = payload
            .get("ms")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        HandlerOutcome::Success(json!({ "sleptMs": ms }))
    }
}

/// In-memory account balances, shared with whoever inspects them
#[derive(Clone, Default)]
pub struct Ledger {
    balances: Arc<DashMap<String, i64>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, account: &str) -> i64 {
        self.balances.get(account).map(|b| *b).unwrap_or(0)
    }

    pub fn debit(&self, account: &str, amount: i64) -> i64 {
        let mut entry = self.balances.entry(account.to_string()).or_insert(0);
        *entry -= amount;
        *entry
    }
}

/// `ledger.debit`: subtract `amount` from `account`.
///
/// A non-positive or missing amount is a business-rule violation and fails
/// permanently.
pub struct LedgerDebitHandler {
    ledger: Ledger,
}

impl LedgerDebitHandler {
    pub fn new(ledger: Ledger) -> Self {
        LedgerDebitHandler { ledger }
    }
}

#[async_trait]
impl TaskHandler for LedgerDebitHandler {
    async fn handle(&self, _ctx: &TaskContext, payload: &TaskPayload) -> HandlerOutcome {
        let account = payload
            .get("account")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let amount = match payload.get("amount").and_then(Value::as_i64) {
            Some(amount) if amount > 0 => amount,
            _ => return HandlerOutcome::permanent("amount must be a positive integer"),
        };

        let balance = self.ledger.debit(account, amount);
        HandlerOutcome::Success(json!({ "account": account, "balance": balance }))
    }
}

/// `records.uppercase`: writes each string record upper-cased, keyed by its
/// record offset
pub struct UppercaseRecordsHandler;

#[async_trait]
impl BatchHandler for UppercaseRecordsHandler {
    async fn process_chunk(
        &self,
        _ctx: &TaskContext,
        chunk: &Chunk,
        records: &[Value],
    ) -> HandlerOutcome<Vec<ChunkWrite>> {
        let mut writes = Vec::with_capacity(records.len());
        for (offset, record) in (chunk.record_range.start..).zip(records) {
            let Some(text) = record.as_str() else {
                return HandlerOutcome::permanent(format!("record {} is not a string", offset));
            };
            writes.push(ChunkWrite::new(
                format!("{:020}", offset),
                Value::String(text.to_uppercase()),
            ));
        }
        HandlerOutcome::Success(writes)
    }
}
