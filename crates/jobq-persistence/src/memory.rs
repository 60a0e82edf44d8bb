use crate::{
    apply_job_status, check_job_update, ChunkCommit, ChunkWrite, CommitOutcome, CreateOutcome,
    DedupCheck, DedupStore, PersistenceError, Result, ResultStore,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jobq_core::{
    Chunk, ChunkStatus, DeadLetterEntry, DedupRecord, DedupState, ErrorCode, Job, JobId,
    JobStatus, ResultSummary, Task, TaskId, TaskStatus,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    jobs: HashMap<JobId, Job>,
    idempotency: HashMap<String, TaskId>,
    chunks: BTreeMap<(JobId, u64), Chunk>,
    outputs: BTreeMap<(JobId, String), serde_json::Value>,
    dead_letters: HashMap<Uuid, DeadLetterEntry>,
}

impl State {
    fn task(&self, task_id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(task_id)
            .ok_or_else(|| PersistenceError::TaskNotFound(task_id.to_string()))
    }

    fn job(&self, job_id: &JobId) -> Result<&Job> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| PersistenceError::JobNotFound(job_id.to_string()))
    }

    fn chunks_of(&self, job_id: &JobId) -> Vec<Chunk> {
        self.chunks
            .range((*job_id, 0)..=(*job_id, u64::MAX))
            .map(|(_, chunk)| chunk.clone())
            .collect()
    }
}

/// In-process store backing both traits.
///
/// The result store serialises every operation behind one mutex; each
/// operation validates on copies and writes back only once every step
/// succeeded, so a rejected transition leaves no partial update. The dedup
/// ledger uses the dashmap entry API for per-key insert-if-absent.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    dedup: DashMap<String, DedupRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DedupStore for MemoryStore {
    fn check_and_mark(
        &self,
        key: &str,
        owner: &str,
        lease: Duration,
        ttl: Duration,
    ) -> Result<DedupCheck> {
        match self.dedup.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                let record = DedupRecord::in_flight(key, owner, lease, ttl);
                vacant.insert(record.clone());
                Ok(DedupCheck::New(record))
            }
            Entry::Occupied(mut occupied) => {
                let now = Utc::now();
                if occupied.get().is_claimable(now) || occupied.get().is_owned_by(owner) {
                    let mut record = DedupRecord::in_flight(key, owner, lease, ttl);
                    if !occupied.get().is_expired(now) {
                        record.first_seen_at = occupied.get().first_seen_at;
                    }
                    debug!("Taking over dedup claim for {}", key);
                    occupied.insert(record.clone());
                    Ok(DedupCheck::New(record))
                } else {
                    Ok(DedupCheck::Duplicate(occupied.get().clone()))
                }
            }
        }
    }

    fn renew(&self, key: &str, owner: &str, lease: Duration) -> Result<bool> {
        match self.dedup.get_mut(key) {
            Some(mut record) if record.is_owned_by(owner) => {
                record.extend_lease(Utc::now(), lease);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn complete(
        &self,
        key: &str,
        owner: &str,
        summary: ResultSummary,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut entry = self
            .dedup
            .entry(key.to_string())
            .or_insert_with(|| DedupRecord::in_flight(key, owner, Duration::zero(), ttl));
        if !entry.may_complete(owner) {
            return Ok(false);
        }
        entry.state = DedupState::Completed;
        entry.expires_at = now + ttl;
        entry.result_summary = Some(summary);
        Ok(true)
    }

    fn release(&self, key: &str, owner: &str) -> Result<bool> {
        Ok(self
            .dedup
            .remove_if(key, |_, record| record.is_owned_by(owner))
            .is_some())
    }

    fn forget(&self, key: &str) -> Result<()> {
        self.dedup.remove(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<DedupRecord>> {
        Ok(self.dedup.get(key).map(|r| r.clone()))
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.dedup.len();
        self.dedup.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.dedup.len()))
    }
}

impl ResultStore for MemoryStore {
    fn create_job(&self, job: Job, task: Task) -> Result<CreateOutcome> {
        let mut state = self.state.lock();

        if let Some(existing_id) = state.idempotency.get(&task.idempotency_key) {
            let existing = state.task(existing_id)?.clone();
            let existing_job = state.job(&existing.job_id)?.clone();
            return Ok(CreateOutcome::Existing {
                job: existing_job,
                task: existing,
            });
        }

        state
            .idempotency
            .insert(task.idempotency_key.clone(), task.id);
        state.jobs.insert(job.job_id, job);
        state.tasks.insert(task.id, task);
        Ok(CreateOutcome::Created)
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(job_id).cloned())
    }

    fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.state.lock().tasks.get(task_id).cloned())
    }

    fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Task>> {
        let state = self.state.lock();
        Ok(state
            .idempotency
            .get(key)
            .and_then(|id| state.tasks.get(id))
            .cloned())
    }

    fn get_status(&self, job_id: &JobId) -> Result<Option<JobStatus>> {
        Ok(self.state.lock().jobs.get(job_id).map(|j| j.status))
    }

    fn begin_attempt(&self, task_id: &TaskId) -> Result<(Task, Job)> {
        let mut state = self.state.lock();
        let mut task = state.task(task_id)?.clone();
        let mut job = state.job(&task.job_id)?.clone();

        task.begin_attempt()?;
        if job.status == JobStatus::Pending {
            job.status = JobStatus::Running;
            job.updated_at = Utc::now();
        }

        state.tasks.insert(task.id, task.clone());
        state.jobs.insert(job.job_id, job.clone());
        Ok((task, job))
    }

    fn record_retry(&self, task_id: &TaskId, error: &str) -> Result<Task> {
        let mut state = self.state.lock();
        let mut task = state.task(task_id)?.clone();
        let mut job = state.job(&task.job_id)?.clone();

        task.fail(error)?;
        task.retry()?;
        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();

        state.tasks.insert(task.id, task.clone());
        state.jobs.insert(job.job_id, job);
        Ok(task)
    }

    fn record_result(
        &self,
        job_id: &JobId,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_code: Option<ErrorCode>,
    ) -> Result<Job> {
        let mut state = self.state.lock();
        let mut job = state.job(job_id)?.clone();
        if job.status == status && job.is_terminal() {
            return Ok(job);
        }
        check_job_update(&job, status)?;

        let mut task = state.task(&job.task_id)?.clone();
        apply_job_status(&mut task, status, error_code.map(|c| c.as_str()))?;

        job.status = status;
        job.result = result;
        job.error_code = error_code;
        job.updated_at = Utc::now();

        state.tasks.insert(task.id, task);
        state.jobs.insert(job.job_id, job.clone());
        Ok(job)
    }

    fn request_cancel(&self, job_id: &JobId) -> Result<(Job, bool)> {
        let mut state = self.state.lock();
        let mut job = state.job(job_id)?.clone();
        if job.is_terminal() {
            return Ok((job, false));
        }

        let mut task = state.task(&job.task_id)?.clone();
        job.cancel_requested = true;
        job.updated_at = Utc::now();

        let cancelled_now = task.status == TaskStatus::Pending;
        if cancelled_now {
            task.cancel()?;
            job.status = JobStatus::Cancelled;
            job.error_code = Some(ErrorCode::Cancelled);
        }

        state.tasks.insert(task.id, task);
        state.jobs.insert(job.job_id, job.clone());
        Ok((job, cancelled_now))
    }

    fn plan_chunks(&self, job_id: &JobId, plan: Vec<Chunk>) -> Result<Vec<Chunk>> {
        let mut state = self.state.lock();
        state.job(job_id)?;

        let existing = state.chunks_of(job_id);
        if !existing.is_empty() {
            return Ok(existing);
        }
        for chunk in &plan {
            state
                .chunks
                .insert((*job_id, chunk.chunk_index), chunk.clone());
        }
        Ok(plan)
    }

    fn list_chunks(&self, job_id: &JobId) -> Result<Vec<Chunk>> {
        Ok(self.state.lock().chunks_of(job_id))
    }

    fn record_chunk_checkpoint(&self, commit: ChunkCommit) -> Result<CommitOutcome> {
        let mut state = self.state.lock();
        let mut job = state.job(&commit.job_id)?.clone();

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

        let key = (commit.job_id, commit.chunk_index);
        let mut chunk = state
            .chunks
            .get(&key)
            .cloned()
            .ok_or_else(|| PersistenceError::CheckpointCorruption {
                job_id: job.job_id,
                detail: format!("chunk {} was never planned", commit.chunk_index),
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

        for write in commit.writes {
            state.outputs.insert((commit.job_id, write.key), write.value);
        }
        state.chunks.insert(key, chunk);
        let checkpoint_offset = job.checkpoint_offset;
        state.jobs.insert(job.job_id, job);

        Ok(CommitOutcome::Committed { checkpoint_offset })
    }

    fn chunk_outputs(&self, job_id: &JobId) -> Result<Vec<ChunkWrite>> {
        let state = self.state.lock();
        Ok(state
            .outputs
            .range((*job_id, String::new())..)
            .take_while(|((id, _), _)| id == job_id)
            .map(|((_, key), value)| ChunkWrite::new(key.clone(), value.clone()))
            .collect())
    }

    fn dead_letter(
        &self,
        task_id: &TaskId,
        reason: &str,
        code: ErrorCode,
    ) -> Result<DeadLetterEntry> {
        let mut state = self.state.lock();
        let mut task = state.task(task_id)?.clone();
        let mut job = state.job(&task.job_id)?.clone();

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

        if job.kind.is_bulk() {
            let key = (job.job_id, job.checkpoint_offset);
            if let Some(chunk) = state.chunks.get_mut(&key) {
                if chunk.status == ChunkStatus::Pending {
                    chunk.status = ChunkStatus::Failed;
                }
            }
        }

        let entry = DeadLetterEntry::from_task(&task, reason, code);
        state.dead_letters.insert(entry.id, entry.clone());
        state.tasks.insert(task.id, task);
        state.jobs.insert(job.job_id, job);

        info!("Task {} moved to dead letter queue", task_id);
        Ok(entry)
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by_key(|e| e.moved_at);
        Ok(entries)
    }

    fn requeue_dead_letter(&self, id: &Uuid) -> Result<Task> {
        let mut state = self.state.lock();
        let entry = state
            .dead_letters
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::DeadLetterNotFound(id.to_string()))?;
        let mut task = state.task(&entry.original_task_id)?.clone();
        let mut job = state.job(&task.job_id)?.clone();

        task.requeue()?;
        job.status = JobStatus::Pending;
        job.result = None;
        job.error_code = None;
        job.cancel_requested = false;
        job.updated_at = Utc::now();

        let failed_chunk = (job.job_id, job.checkpoint_offset);
        if let Some(chunk) = state.chunks.get_mut(&failed_chunk) {
            if chunk.status == ChunkStatus::Failed {
                chunk.status = ChunkStatus::Pending;
            }
        }

        state.dead_letters.remove(id);
        state.tasks.insert(task.id, task.clone());
        state.jobs.insert(job.job_id, job);
        Ok(task)
    }

    fn recover_in_flight(&self) -> Result<Vec<Task>> {
        let mut state = self.state.lock();
        let in_flight: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .map(|t| t.id)
            .collect();

        for task_id in in_flight {
            let mut task = state.task(&task_id)?.clone();
            task.release()?;
            if let Some(job) = state.jobs.get_mut(&task.job_id) {
                job.status = JobStatus::Pending;
            }
            state.tasks.insert(task_id, task);
        }

        let mut pending: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        Ok(pending)
    }

    fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut state = self.state.lock();
        let expired: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Succeeded | TaskStatus::Cancelled))
            .filter(|t| t.completed_at.is_some_and(|at| at < older_than))
            .cloned()
            .collect();

        for task in &expired {
            state.tasks.remove(&task.id);
            state.jobs.remove(&task.job_id);
            state.idempotency.remove(&task.idempotency_key);
            state.chunks.retain(|(job_id, _), _| *job_id != task.job_id);
            state.outputs.retain(|(job_id, _), _| *job_id != task.job_id);
        }

        if !expired.is_empty() {
            info!("Purged {} terminal tasks", expired.len());
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::JobKind;
    use serde_json::json;
    use std::sync::Arc;

    fn submit(store: &MemoryStore, key: &str, kind: JobKind) -> (Job, Task) {
        let job_id = Uuid::new_v4();
        let task = Task::builder("echo", json!({"n": 1}))
            .job_id(job_id)
            .idempotency_key(key)
            .build()
            .unwrap();
        let job = Job::new(job_id, task.id, kind, None);
        assert_eq!(
            store.create_job(job.clone(), task.clone()).unwrap(),
            CreateOutcome::Created
        );
        (job, task)
    }

    fn lease() -> Duration {
        Duration::seconds(30)
    }

    fn ttl() -> Duration {
        Duration::hours(2)
    }

    #[test]
    fn test_idempotency_key_is_unique() {
        let store = MemoryStore::new();
        let (job, task) = submit(&store, "pay-1", JobKind::Simple);

        let again = Task::builder("echo", json!({}))
            .idempotency_key("pay-1")
            .build()
            .unwrap();
        let other_job = Job::new(again.job_id, again.id, JobKind::Simple, None);

        match store.create_job(other_job, again).unwrap() {
            CreateOutcome::Existing { job: j, task: t } => {
                assert_eq!(j.job_id, job.job_id);
                assert_eq!(t.id, task.id);
            }
            CreateOutcome::Created => panic!("duplicate key accepted"),
        }
    }

    #[test]
    fn test_dedup_insert_if_absent() {
        let store = MemoryStore::new();
        assert!(store.check_and_mark("k", "w1", lease(), ttl()).unwrap().is_new());
        assert!(!store.check_and_mark("k", "w2", lease(), ttl()).unwrap().is_new());
    }

    #[test]
    fn test_dedup_concurrent_claims_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .check_and_mark("race", &format!("w{}", i), lease(), ttl())
                        .unwrap()
                        .is_new()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_dedup_stale_claim_taken_over() {
        let store = MemoryStore::new();
        store
            .check_and_mark("k", "crashed", Duration::zero(), ttl())
            .unwrap();

        let check = store.check_and_mark("k", "w2", lease(), ttl()).unwrap();
        assert!(check.is_new());
        assert!(store.get("k").unwrap().unwrap().is_owned_by("w2"));
    }

    #[test]
    fn test_dedup_release_only_by_owner() {
        let store = MemoryStore::new();
        store.check_and_mark("k", "w1", lease(), ttl()).unwrap();

        assert!(!store.release("k", "w2").unwrap());
        assert!(store.release("k", "w1").unwrap());
        assert!(store.check_and_mark("k", "w2", lease(), ttl()).unwrap().is_new());
    }

    #[test]
    fn test_dedup_renew_and_owner_checked_complete() {
        let store = MemoryStore::new();
        let summary = ResultSummary {
            status: JobStatus::Succeeded,
            result: None,
            error_code: None,
        };
        store
            .check_and_mark("k", "w1", Duration::zero(), ttl())
            .unwrap();
        assert!(store.renew("k", "w1", lease()).unwrap());
        assert!(!store.check_and_mark("k", "w2", lease(), ttl()).unwrap().is_new());
        assert!(!store.renew("k", "w2", lease()).unwrap());

        // w2 takes over once w1 stops renewing
        store.check_and_mark("k", "w1", Duration::zero(), ttl()).unwrap();
        assert!(store.check_and_mark("k", "w2", lease(), ttl()).unwrap().is_new());
        assert!(!store.renew("k", "w1", lease()).unwrap());
        assert!(!store.complete("k", "w1", summary.clone(), ttl()).unwrap());
        assert!(store.get("k").unwrap().unwrap().is_owned_by("w2"));

        assert!(store.complete("k", "w2", summary, ttl()).unwrap());
        assert!(!store.renew("k", "w2", lease()).unwrap());
    }

    #[test]
    fn test_dedup_completed_is_duplicate_until_expiry() {
        let store = MemoryStore::new();
        store.check_and_mark("k", "w1", lease(), ttl()).unwrap();
        let summary = ResultSummary {
            status: JobStatus::Succeeded,
            result: Some(json!(1)),
            error_code: None,
        };
        store.complete("k", "w1", summary.clone(), ttl()).unwrap();

        match store.check_and_mark("k", "w2", lease(), ttl()).unwrap() {
            DedupCheck::Duplicate(record) => assert_eq!(record.result_summary, Some(summary)),
            DedupCheck::New(_) => panic!("completed key claimed again"),
        }

        let purged = store.purge_expired(Utc::now() + Duration::hours(3)).unwrap();
        assert_eq!(purged, 1);
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn test_attempt_retry_and_result() {
        let store = MemoryStore::new();
        let (job, task) = submit(&store, "k", JobKind::Simple);

        let (t, j) = store.begin_attempt(&task.id).unwrap();
        assert_eq!(t.attempts, 1);
        assert_eq!(j.status, JobStatus::Running);

        let t = store.record_retry(&task.id, "network").unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(store.get_status(&job.job_id).unwrap(), Some(JobStatus::Pending));

        store.begin_attempt(&task.id).unwrap();
        let j = store
            .record_result(&job.job_id, JobStatus::Succeeded, Some(json!("ok")), None)
            .unwrap();
        assert_eq!(j.result, Some(json!("ok")));
        assert_eq!(
            store.get_task(&task.id).unwrap().unwrap().status,
            TaskStatus::Succeeded
        );
    }

    #[test]
    fn test_terminal_status_not_overwritten() {
        let store = MemoryStore::new();
        let (job, task) = submit(&store, "k", JobKind::Simple);
        store.begin_attempt(&task.id).unwrap();
        store
            .record_result(&job.job_id, JobStatus::Succeeded, None, None)
            .unwrap();

        assert!(store
            .record_result(&job.job_id, JobStatus::Cancelled, None, None)
            .is_err());
        assert!(store
            .record_result(&job.job_id, JobStatus::Succeeded, None, None)
            .is_ok());
    }

    #[test]
    fn test_chunk_checkpoint_is_monotonic() {
        let store = MemoryStore::new();
        let kind = JobKind::Bulk {
            total_records: 30,
            chunk_size: 10,
        };
        let (job, _) = submit(&store, "bulk", kind);
        store.plan_chunks(&job.job_id, kind.plan(job.job_id)).unwrap();

        let commit = |index: u64| ChunkCommit {
            job_id: job.job_id,
            chunk_index: index,
            writes: vec![ChunkWrite::new(format!("r{}", index), json!(index))],
        };

        assert_eq!(
            store.record_chunk_checkpoint(commit(0)).unwrap(),
            CommitOutcome::Committed { checkpoint_offset: 1 }
        );
        assert_eq!(
            store.record_chunk_checkpoint(commit(0)).unwrap(),
            CommitOutcome::AlreadyCommitted { checkpoint_offset: 1 }
        );
        assert!(matches!(
            store.record_chunk_checkpoint(commit(2)),
            Err(PersistenceError::CheckpointCorruption { .. })
        ));
        assert_eq!(store.chunk_outputs(&job.job_id).unwrap().len(), 1);
    }

    #[test]
    fn test_plan_chunks_once() {
        let store = MemoryStore::new();
        let kind = JobKind::Bulk {
            total_records: 5,
            chunk_size: 2,
        };
        let (job, _) = submit(&store, "bulk", kind);

        let first = store.plan_chunks(&job.job_id, kind.plan(job.job_id)).unwrap();
        let second = store.plan_chunks(&job.job_id, Vec::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn test_dead_letter_and_requeue() {
        let store = MemoryStore::new();
        let (job, task) = submit(&store, "k", JobKind::Simple);
        store.begin_attempt(&task.id).unwrap();

        let entry = store
            .dead_letter(&task.id, "invalid amount", ErrorCode::PermanentFailure)
            .unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(store.get_status(&job.job_id).unwrap(), Some(JobStatus::Dead));
        assert_eq!(store.list_dead_letters().unwrap().len(), 1);

        let task = store.requeue_dead_letter(&entry.id).unwrap();
        assert_eq!(task.attempts, 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(store.list_dead_letters().unwrap().is_empty());
        assert_eq!(store.get_status(&job.job_id).unwrap(), Some(JobStatus::Pending));
    }

    #[test]
    fn test_cancel_pending_job_immediately() {
        let store = MemoryStore::new();
        let (job, _) = submit(&store, "k", JobKind::Simple);

        let (cancelled, now) = store.request_cancel(&job.job_id).unwrap();
        assert!(now);
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_running_job_is_deferred() {
        let store = MemoryStore::new();
        let (job, task) = submit(&store, "k", JobKind::Simple);
        store.begin_attempt(&task.id).unwrap();

        let (flagged, now) = store.request_cancel(&job.job_id).unwrap();
        assert!(!now);
        assert!(flagged.cancel_requested);
        assert_eq!(flagged.status, JobStatus::Running);
    }

    #[test]
    fn test_recover_releases_in_flight() {
        let store = MemoryStore::new();
        let (_, running) = submit(&store, "a", JobKind::Simple);
        let (_, waiting) = submit(&store, "b", JobKind::Simple);
        store.begin_attempt(&running.id).unwrap();

        let pending = store.recover_in_flight().unwrap();
        let ids: Vec<_> = pending.iter().map(|t| t.id).collect();
        assert!(ids.contains(&running.id));
        assert!(ids.contains(&waiting.id));
    }

    #[test]
    fn test_purge_terminal() {
        let store = MemoryStore::new();
        let (job, task) = submit(&store, "k", JobKind::Simple);
        store.begin_attempt(&task.id).unwrap();
        store
            .record_result(&job.job_id, JobStatus::Succeeded, None, None)
            .unwrap();

        assert_eq!(store.purge_terminal(Utc::now() - Duration::days(1)).unwrap(), 0);
        assert_eq!(store.purge_terminal(Utc::now() + Duration::seconds(1)).unwrap(), 1);
        assert!(store.get_job(&job.job_id).unwrap().is_none());
        assert!(store.find_by_idempotency_key("k").unwrap().is_none());
    }
}
