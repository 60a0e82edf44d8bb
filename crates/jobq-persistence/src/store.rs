use crate::{
    apply_job_status, check_job_update, ChunkCommit, ChunkWrite, CommitOutcome, CreateOutcome,
    DedupCheck, DedupStore, PersistenceError, Result, ResultStore,
};
use chrono::{DateTime, Duration, Utc};
use jobq_core::{
    Chunk, ChunkStatus, DeadLetterEntry, DedupRecord, DedupState, ErrorCode, Job, JobId,
    JobStatus, ResultSummary, Task, TaskId, TaskStatus,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, Options,
    Transaction, TransactionDB, TransactionDBOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the RocksDB-backed store
#[derive(Debug, Clone)]
pub struct RocksStoreConfig {
    pub data_dir: PathBuf,
    /// How long a transaction waits on a row lock held by another one
    pub lock_timeout_ms: i64,
    /// Attempts for a transaction that lost a lock race
    pub max_txn_attempts: u32,
}

impl Default for RocksStoreConfig {
    fn default() -> Self {
        RocksStoreConfig {
            data_dir: PathBuf::from("./data"),
            lock_timeout_ms: 1000,
            max_txn_attempts: 3,
        }
    }
}

/// Column family names
const CF_TASKS: &str = "tasks";
const CF_IDEMPOTENCY: &str = "idempotency";
const CF_JOBS: &str = "jobs";
const CF_CHUNKS: &str = "chunks";
const CF_OUTPUTS: &str = "outputs";
const CF_DEAD_LETTERS: &str = "dead_letters";
const CF_DEDUP: &str = "dedup";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_TASKS,
    CF_IDEMPOTENCY,
    CF_JOBS,
    CF_CHUNKS,
    CF_OUTPUTS,
    CF_DEAD_LETTERS,
    CF_DEDUP,
];

type Txn<'a> = Transaction<'a, TransactionDB>;

fn chunk_key(job_id: &JobId, index: u64) -> Vec<u8> {
    let mut key = job_id.as_bytes().to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn output_key(job_id: &JobId, key: &str) -> Vec<u8> {
    let mut out = job_id.as_bytes().to_vec();
    out.extend_from_slice(key.as_bytes());
    out
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a row and lock it until the transaction ends
fn read_locked<T: DeserializeOwned>(
    txn: &Txn<'_>,
    cf: &ColumnFamily,
    key: &[u8],
) -> Result<Option<T>> {
    match txn.get_for_update_cf(cf, key, true)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

fn write<T: Serialize>(txn: &Txn<'_>, cf: &ColumnFamily, key: &[u8], value: &T) -> Result<()> {
    txn.put_cf(cf, key, serde_json::to_vec(value)?)?;
    Ok(())
}

/// Persistent store using a pessimistic RocksDB transaction database.
///
/// Every trait operation runs in one transaction that locks the rows it reads
/// with `get_for_update`, so concurrent workers serialise per row and a
/// failed step rolls the whole operation back.
pub struct RocksStore {
    db: TransactionDB,
    config: RocksStoreConfig,
}

impl RocksStore {
    /// Open or create the store
    pub fn open(config: RocksStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.data_dir.join("jobs");

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(config.lock_timeout_ms);

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db: TransactionDB =
            TransactionDB::open_cf_descriptors(&db_opts, &txn_opts, db_path, cf_descriptors)?;

        info!("Opened job store at {:?}", config.data_dir);

        Ok(RocksStore { db, config })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PersistenceError::Other(format!("CF {} not found", name)))
    }

    /// Run `f` in a transaction, committing when it returns Ok. Lock timeouts
    /// and busy conflicts are retried a bounded number of times.
    fn with_txn<T>(&self, mut f: impl FnMut(&Txn<'_>) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            let txn = self.db.transaction();
            let result = f(&txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            });

            match result {
                Err(PersistenceError::RocksDbError(e))
                    if matches!(e.kind(), ErrorKind::Busy | ErrorKind::TimedOut)
                        && attempt < self.config.max_txn_attempts =>
                {
                    debug!("Transaction conflict (attempt {}): {}", attempt, e);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf_name)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rows of a column family
    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            rows.push(decode(&value)?);
        }
        Ok(rows)
    }

    /// Rows whose key starts with `prefix`, in key order
    fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Box<[u8]>, T)>> {
        let cf = self.cf(cf_name)?;
        let mut rows = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key, decode(&value)?));
        }
        Ok(rows)
    }

    fn lock_task(&self, txn: &Txn<'_>, task_id: &TaskId) -> Result<Task> {
        read_locked(txn, self.cf(CF_TASKS)?, task_id.as_bytes())?
            .ok_or_else(|| PersistenceError::TaskNotFound(task_id.to_string()))
    }

    fn lock_job(&self, txn: &Txn<'_>, job_id: &JobId) -> Result<Job> {
        read_locked(txn, self.cf(CF_JOBS)?, job_id.as_bytes())?
            .ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()))
    }

    fn put_task(&self, txn: &Txn<'_>, task: &Task) -> Result<()> {
        write(txn, self.cf(CF_TASKS)?, task.id.as_bytes(), task)
    }

    fn put_job(&self, txn: &Txn<'_>, job: &Job) -> Result<()> {
        write(txn, self.cf(CF_JOBS)?, job.job_id.as_bytes(), job)
    }

    /// Set the status of the chunk the checkpoint points at, if it is in `from`
    fn mark_current_chunk(
        &self,
        txn: &Txn<'_>,
        job: &Job,
        from: ChunkStatus,
        to: ChunkStatus,
    ) -> Result<()> {
        if !job.kind.is_bulk() {
            return Ok(());
        }
        let cf = self.cf(CF_CHUNKS)?;
        let key = chunk_key(&job.job_id, job.checkpoint_offset);
        if let Some(mut chunk) = read_locked::<Chunk>(txn, cf, &key)? {
            if chunk.status == from {
                chunk.status = to;
                write(txn, cf, &key, &chunk)?;
            }
        }
        Ok(())
    }
}

impl DedupStore for RocksStore {
    fn check_and_mark(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<DedupCheck> {
        let cf = self.cf(CF_DEDUP)?;
        self.with_txn(|txn| {
            let now = Utc::now();
            let mut record = DedupRecord::in_flight(key, owner, lease, ttl);

            if let Some(existing) = read_locked::<DedupRecord>(txn, cf, key.as_bytes())? {
                if !existing.is_claimable(now) && !existing.is_owned_by(owner) {
                    return Ok(DedupCheck::Duplicate(existing));
                }
                if !existing.is_expired(now) {
                    debug!("Taking over dedup claim for {}", key);
                    record.first_seen_at = existing.first_seen_at;
                }
            }

            write(txn, cf, key.as_bytes(), &record)?;
            Ok(DedupCheck::New(record))
        })
    }

    fn renew(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        let cf = self.cf(CF_DEDUP)?;
        self.with_txn(|txn| match read_locked::<DedupRecord>(txn, cf, key.as_bytes())? {
            Some(mut record) if record.is_owned_by(owner) => {
                record.extend_lease(Utc::now(), lease);
                write(txn, cf, key.as_bytes(), &record)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn complete(
        &self,
        key: &str,
        owner: &str,
        summary: ResultSummary,
        ttl: Duration,
    ) -> Result<bool> {
        let cf = self.cf(CF_DEDUP)?;
        self.with_txn(|txn| {
            let now = Utc::now();
            let mut record = read_locked::<DedupRecord>(txn, cf, key.as_bytes())?
                .unwrap_or_else(|| DedupRecord::in_flight(key, owner, Duration::zero(), ttl));
            if !record.may_complete(owner) {
                return Ok(false);
            }
            record.state = DedupState::Completed;
            record.expires_at = now + ttl;
            record.result_summary = Some(summary.clone());
            write(txn, cf, key.as_bytes(), &record)?;
            Ok(true)
        })
    }

    fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let cf = self.cf(CF_DEDUP)?;
        self.with_txn(|txn| match read_locked::<DedupRecord>(txn, cf, key.as_bytes())? {
            Some(record) if record.is_owned_by(owner) => {
                txn.delete_cf(cf, key.as_bytes())?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn forget(&self, key: &str) -> Result<()> {
        self.db.delete_cf(self.cf(CF_DEDUP)?, key.as_bytes())?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<DedupRecord>> {
        self.get_json(CF_DEDUP, key.as_bytes())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cf = self.cf(CF_DEDUP)?;
        let expired: Vec<String> = self
            .scan::<DedupRecord>(CF_DEDUP)?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.idempotency_key)
            .collect();

        // Re-check under lock: a key may have been claimed again since the scan
        self.with_txn(|txn| {
            let mut count = 0;
            for key in &expired {
                if let Some(record) = read_locked::<DedupRecord>(txn, cf, key.as_bytes())? {
                    if record.is_expired(now) {
                        txn.delete_cf(cf, key.as_bytes())?;
                        count += 1;
                    }
                }
            }
            Ok(count)
        })
    }
}

impl ResultStore for RocksStore {
    fn create_job(&self, job: Job, task: Task) -> Result<CreateOutcome> {
        let idempotency_cf = self.cf(CF_IDEMPOTENCY)?;
        self.with_txn(|txn| {
            let key = task.idempotency_key.as_bytes();
            if let Some(existing) = txn.get_for_update_cf(idempotency_cf, key, true)? {
                let existing_id = Uuid::from_slice(&existing)
                    .map_err(|e| PersistenceError::Other(e.to_string()))?;
                let existing = self.lock_task(txn, &existing_id)?;
                let existing_job = self.lock_job(txn, &existing.job_id)?;
                return Ok(CreateOutcome::Existing {
                    job: existing_job,
                    task: existing,
                });
            }

            txn.put_cf(idempotency_cf, key, task.id.as_bytes())?;
            self.put_job(txn, &job)?;
            self.put_task(txn, &task)?;
            Ok(CreateOutcome::Created)
        })
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.get_json(CF_JOBS, job_id.as_bytes())
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.get_json(CF_TASKS, task_id.as_bytes())
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_IDEMPOTENCY)?, key.as_bytes())? else {
            return Ok(None);
        };
        let task_id =
            Uuid::from_slice(&bytes).map_err(|e| PersistenceError::Other(e.to_string()))?;
        self.get_task(&task_id)
    }

    fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        Ok(self.get_job(job_id)?.map(|job| job.status))
    }

    fn begin_attempt(&self, task_id: &TaskId) -> Result<(Task, Job)> {
        self.with_txn(|txn| {
            let mut task = self.lock_task(txn, task_id)?;
            let mut job = self.lock_job(txn, &task.job_id)?;

            task.begin_attempt()?;
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Running;
                job.updated_at = Utc::now();
            }

            self.put_task(txn, &task)?;
            self.put_job(txn, &job)?;
            Ok((task, job))
        })
    }

    fn record_retry(&self, task_id: &TaskId, error: &str) -> Result<Task> {
        self.with_txn(|txn| {
            let mut task = self.lock_task(txn, task_id)?;
            let mut job = self.lock_job(txn, &task.job_id)?;

            task.fail(error)?;
            task.retry()?;
            job.status = JobStatus::Pending;
            job.updated_at = Utc::now();

            self.put_task(txn, &task)?;
            self.put_job(txn, &job)?;
            Ok(task)
        })
    }

    fn record_result(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_code: Option<ErrorCode>,
    ) -> Result<Job> {
        self.with_txn(|txn| {
            let mut job = self.lock_job(txn, job_id)?;
            if job.status == status && job.is_terminal() {
                return Ok(job);
            }
            check_job_update(&job, status)?;

            let mut task = self.lock_task(txn, &job.task_id)?;
            apply_job_status(&mut task, status, error_code.map(|c| c.as_str()))?;

            job.status = status;
            job.result = result.clone();
            job.error_code = error_code;
            job.updated_at = Utc::now();

            self.put_task(txn, &task)?;
            self.put_job(txn, &job)?;
            Ok(job)
        })
    }

    fn request_cancel(&self, job_id: &JobId) -> Result<(Job, bool)> {
        self.with_txn(|txn| {
            let mut job = self.lock_job(txn, job_id)?;
            if job.is_terminal() {
                return Ok((job, false));
            }

            let mut task = self.lock_task(txn, &job.task_id)?;
            job.cancel_requested = true;
            job.updated_at = Utc::now();

            let cancelled_now = task.status == TaskStatus::Pending;
            if cancelled_now {
                task.cancel()?;
                job.status = JobStatus::Cancelled;
                job.error_code = Some(ErrorCode::Cancelled);
                self.put_task(txn, &task)?;
            }

            self.put_job(txn, &job)?;
            Ok((job, cancelled_now))
        })
    }

    fn plan_chunks(&self, job_id: &JobId, plan: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let cf = self.cf(CF_CHUNKS)?;
        self.with_txn(|txn| {
            // The job row lock serialises concurrent planners
            self.lock_job(txn, job_id)?;

            let existing = self.list_chunks(job_id)?;
            if !existing.is_empty() {
                return Ok(existing);
            }
            for chunk in &plan {
                write(txn, cf, &chunk_key(job_id, chunk.chunk_index), chunk)?;
            }
            Ok(plan.clone())
        })
    }

    fn list_chunks(&self, job_id: &JobId) -> Result<Vec<Chunk>> {
        Ok(self
            .scan_prefix::<Chunk>(CF_CHUNKS, job_id.as_bytes())?
            .into_iter()
            .map(|(_, chunk)| chunk)
            .collect())
    }

    fn record_chunk_checkpoint(&self, commit: ChunkCommit) -> Result<CommitOutcome> {
        let chunks_cf = self.cf(CF_CHUNKS)?;
        let outputs_cf = self.cf(CF_OUTPUTS)?;
        self.with_txn(|txn| {
            let mut job = self.lock_job(txn, &commit.job_id)?;

            if job.checkpoint_offset > commit.chunk_index {
                return Ok(CommitOutcome::AlreadyCommitted {
                    checkpoint_offset: job.checkpoint_offset,
                });
            }
            if job.checkpoint_offset < commit.chunk_index {
                return Err(PersistenceError::CheckpointCorruption {
                    job_id: job.job_id,
                    detail: format!(
                        "commit for chunk {} while checkpoint is {}",
                        commit.chunk_index, job.checkpoint_offset
                    ),
                });
            }

            let key = chunk_key(&commit.job_id, commit.chunk_index);
            let mut chunk: Chunk = read_locked(txn, chunks_cf, &key)?.ok_or_else(|| {
                PersistenceError::CheckpointCorruption {
                    job_id: job.job_id,
                    detail: format!("chunk {} was never planned", commit.chunk_index),
                }
            })?;
            if chunk.status == ChunkStatus::Succeeded {
                return Err(PersistenceError::CheckpointCorruption {
                    job_id: job.job_id,
                    detail: format!(
                        "chunk {} already committed but checkpoint is {}",
                        commit.chunk_index, job.checkpoint_offset
                    ),
                });
            }

            chunk.status = ChunkStatus::Succeeded;
            chunk.checkpoint_offset = chunk.record_range.end;
            job.checkpoint_offset += 1;
            job.updated_at = Utc::now();

            for w in &commit.writes {
                write(txn, outputs_cf, &output_key(&commit.job_id, &w.key), &w.value)?;
            }
            write(txn, chunks_cf, &key, &chunk)?;
            self.put_job(txn, &job)?;

            Ok(CommitOutcome::Committed {
                checkpoint_offset: job.checkpoint_offset,
            })
        })
    }

    fn chunk_outputs(&self, job_id: &JobId) -> Result<Vec<ChunkWrite>> {
        let prefix = job_id.as_bytes();
        self.scan_prefix::<serde_json::Value>(CF_OUTPUTS, prefix)?
            .into_iter()
            .map(|(key, value)| {
                let name = String::from_utf8(key[prefix.len()..].to_vec())
                    .map_err(|e| PersistenceError::Other(e.to_string()))?;
                Ok(ChunkWrite::new(name, value))
            })
            .collect()
    }

    fn dead_letter(
        &self,
        task_id: &TaskId,
        reason: &str,
        code: ErrorCode,
    ) -> Result<DeadLetterEntry> {
        let dlq_cf = self.cf(CF_DEAD_LETTERS)?;
        let entry = self.with_txn(|txn| {
            let mut task = self.lock_task(txn, task_id)?;
            let mut job = self.lock_job(txn, &task.job_id)?;

            if task.status == TaskStatus::Pending {
                task.resume()?;
            }
            if task.status == TaskStatus::InProgress {
                task.fail(reason)?;
            }
            task.bury()?;

            job.status = if code == ErrorCode::CheckpointCorruption {
                JobStatus::Failed
            } else {
                JobStatus::Dead
            };
            job.error_code = Some(code);
            job.updated_at = Utc::now();
            self.mark_current_chunk(txn, &job, ChunkStatus::Pending, ChunkStatus::Failed)?;

            let entry = DeadLetterEntry::from_task(&task, reason, code);
            write(txn, dlq_cf, entry.id.as_bytes(), &entry)?;
            self.put_task(txn, &task)?;
            self.put_job(txn, &job)?;
            Ok(entry)
        })?;

        info!("Task {} moved to dead letter queue", task_id);
        Ok(entry)
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut entries: Vec<DeadLetterEntry> = self.scan(CF_DEAD_LETTERS)?;
        entries.sort_by_key(|e| e.moved_at);
        Ok(entries)
    }

    fn requeue_dead_letter(&self, id: &Uuid) -> Result<Task> {
        let dlq_cf = self.cf(CF_DEAD_LETTERS)?;
        self.with_txn(|txn| {
            let entry: DeadLetterEntry = read_locked(txn, dlq_cf, id.as_bytes())?
                .ok_or_else(|| PersistenceError::DeadLetterNotFound(id.to_string()))?;
            let mut task = self.lock_task(txn, &entry.original_task_id)?;
            let mut job = self.lock_job(txn, &task.job_id)?;

            task.requeue()?;
            job.status = JobStatus::Pending;
            job.result = None;
            job.error_code = None;
            job.cancel_requested = false;
            job.updated_at = Utc::now();
            self.mark_current_chunk(txn, &job, ChunkStatus::Failed, ChunkStatus::Pending)?;

            txn.delete_cf(dlq_cf, id.as_bytes())?;
            self.put_task(txn, &task)?;
            self.put_job(txn, &job)?;
            Ok(task)
        })
    }

    fn recover_in_flight(&self) -> Result<Vec<Task>> {
        let in_flight: Vec<TaskId> = self
            .scan::<Task>(CF_TASKS)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect();

        for task_id in &in_flight {
            warn!("Recovering in-progress task {} (worker was likely dead)", task_id);
            self.with_txn(|txn| {
                let mut task = self.lock_task(txn, task_id)?;
                if task.status != TaskStatus::InProgress {
                    return Ok(());
                }
                task.release()?;
                let mut job = self.lock_job(txn, &task.job_id)?;
                job.status = JobStatus::Pending;
                self.put_task(txn, &task)?;
                self.put_job(txn, &job)
            })?;
        }

        let mut pending: Vec<Task> = self
            .scan::<Task>(CF_TASKS)?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Task> = self
            .scan::<Task>(CF_TASKS)?
            .into_iter()
            .filter(|t| matches!(t.status, TaskStatus::Succeeded | TaskStatus::Cancelled))
            .filter(|t| t.completed_at.is_some_and(|at| at < older_than))
            .collect();

        for task in &expired {
            let chunk_keys: Vec<Box<[u8]>> = self
                .scan_prefix::<Chunk>(CF_CHUNKS, task.job_id.as_bytes())?
                .into_iter()
                .map(|(key, _)| key)
                .collect();
            let output_keys: Vec<Box<[u8]>> = self
                .scan_prefix::<serde_json::Value>(CF_OUTPUTS, task.job_id.as_bytes())?
                .into_iter()
                .map(|(key, _)| key)
                .collect();

            self.with_txn(|txn| {
                txn.delete_cf(self.cf(CF_TASKS)?, task.id.as_bytes())?;
                txn.delete_cf(self.cf(CF_JOBS)?, task.job_id.as_bytes())?;
                txn.delete_cf(self.cf(CF_IDEMPOTENCY)?, task.idempotency_key.as_bytes())?;
                for key in &chunk_keys {
                    txn.delete_cf(self.cf(CF_CHUNKS)?, key)?;
                }
                for key in &output_keys {
                    txn.delete_cf(self.cf(CF_OUTPUTS)?, key)?;
                }
                Ok(())
            })?;
        }

        if !expired.is_empty() {
            info!("Purged {} terminal tasks", expired.len());
        }
        Ok(expired.len())
    }
}
