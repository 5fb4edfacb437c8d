//! In-memory [`JobQueue`] and [`ResultStore`].
//!
//! Same semantics as the Redis backend (FIFO, claim-moves-to-active,
//! heartbeat TTLs, orphan re-queue, result TTLs) inside one process. Used by
//! tests and by single-host deployments that want the durable code path
//! without external infrastructure.

use super::queue::{ClaimedJob, JobCommand, JobInfo, JobQueue, JobState, ResultStore};
use crate::error::{JobkitError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

fn check_available(flag: &AtomicBool, backend: &str) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(JobkitError::backend(backend, "backend marked unavailable"));
    }
    Ok(())
}

// ── Job queue ────────────────────────────────────────────────────────────

#[derive(Debug)]
struct JobRecord {
    command: JobCommand,
    state: JobState,
    worker: Option<String>,
    result_key: Option<String>,
    error: Option<String>,
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct QueueState {
    queued: VecDeque<String>,
    active: Vec<String>,
    jobs: HashMap<String, JobRecord>,
    workers: HashMap<String, Instant>,
}

impl QueueState {
    fn purge(&mut self, now: Instant) {
        self.jobs.retain(|_, job| job.expires.is_none_or(|at| at > now));
        self.workers.retain(|_, expires| *expires > now);
    }

    fn settle(&mut self, job_id: &str, worker_id: &str) -> Option<&mut JobRecord> {
        self.active.retain(|id| id != job_id);
        let job = self.jobs.get_mut(job_id)?;
        if job.worker.as_deref() != Some(worker_id) {
            tracing::warn!(job_id, worker_id, holder = ?job.worker, "settling a job held by another worker");
        }
        Some(job)
    }
}

/// A process-local job queue.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    unavailable: AtomicBool,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connectivity error, or recover.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        check_available(&self.unavailable, "memory-queue")
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn push(&self, job_id: &str, command: &JobCommand) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        state.jobs.insert(
            job_id.to_string(),
            JobRecord {
                command: command.clone(),
                state: JobState::Queued,
                worker: None,
                result_key: None,
                error: None,
                expires: None,
            },
        );
        state.queued.push_back(job_id.to_string());
        Ok(())
    }

    async fn queue_len(&self) -> Result<usize> {
        self.check()?;
        Ok(self.state.lock().queued.len())
    }

    async fn job_info(&self, job_id: &str) -> Result<Option<JobInfo>> {
        self.check()?;
        let mut state = self.state.lock();
        state.purge(Instant::now());
        let position = state
            .queued
            .iter()
            .position(|id| id == job_id)
            .map(|idx| idx + 1);
        Ok(state.jobs.get(job_id).map(|job| JobInfo {
            job_id: job_id.to_string(),
            state: job.state,
            position,
            result_key: job.result_key.clone(),
            error: job.error.clone(),
            worker: job.worker.clone(),
        }))
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        self.check()?;
        let mut state = self.state.lock();
        while let Some(job_id) = state.queued.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.state = JobState::Started;
            job.worker = Some(worker_id.to_string());
            let command = job.command.clone();
            state.active.push(job_id.clone());
            return Ok(Some(ClaimedJob { job_id, command }));
        }
        Ok(None)
    }

    async fn complete(&self, job_id: &str, worker_id: &str, result_key: &str, keep: Duration) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if let Some(job) = state.settle(job_id, worker_id) {
            job.state = JobState::Finished;
            job.result_key = Some(result_key.to_string());
            job.expires = Some(Instant::now() + keep);
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        job_state: JobState,
        error: &str,
        result_key: Option<&str>,
        keep: Duration,
    ) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock();
        if let Some(job) = state.settle(job_id, worker_id) {
            job.state = job_state;
            job.error = Some(error.to_string());
            job.result_key = result_key.map(str::to_string);
            job.expires = Some(Instant::now() + keep);
        }
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .workers
            .insert(worker_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn unregister(&self, worker_id: &str) -> Result<()> {
        self.check()?;
        self.state.lock().workers.remove(worker_id);
        Ok(())
    }

    async fn live_workers(&self) -> Result<usize> {
        self.check()?;
        let mut state = self.state.lock();
        state.purge(Instant::now());
        Ok(state.workers.len())
    }

    async fn requeue_orphans(&self) -> Result<usize> {
        self.check()?;
        let mut state = self.state.lock();
        state.purge(Instant::now());
        let QueueState {
            queued,
            active,
            jobs,
            workers,
        } = &mut *state;

        let mut orphans = Vec::new();
        active.retain(|job_id| {
            let alive = jobs
                .get(job_id)
                .and_then(|job| job.worker.as_ref())
                .is_some_and(|worker| workers.contains_key(worker));
            if !alive {
                orphans.push(job_id.clone());
            }
            alive
        });
        for job_id in orphans.iter().rev() {
            if let Some(job) = jobs.get_mut(job_id) {
                job.state = JobState::Queued;
                job.worker = None;
                queued.push_front(job_id.clone());
            }
        }
        Ok(orphans.len())
    }
}

// ── Result store ─────────────────────────────────────────────────────────

/// A process-local result store honouring TTLs.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    blobs: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn ping(&self) -> Result<()> {
        check_available(&self.unavailable, "memory-results")
    }

    async fn put(&self, key: &str, blob: Vec<u8>, ttl: Duration) -> Result<()> {
        check_available(&self.unavailable, "memory-results")?;
        self.blobs
            .lock()
            .insert(key.to_string(), (blob, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_available(&self.unavailable, "memory-results")?;
        let mut blobs = self.blobs.lock();
        let now = Instant::now();
        blobs.retain(|_, (_, expires)| *expires > now);
        Ok(blobs.get(key).map(|(blob, _)| blob.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvertOptions;
    use crate::error::ErrorKind;
    use crate::task::{Task, TaskTarget};

    fn command() -> JobCommand {
        JobCommand::convert(Task::new(vec![], ConvertOptions::default(), TaskTarget::InBody).payload())
    }

    const KEEP: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn fifo_claims_and_positions() {
        let q = MemoryJobQueue::new();
        q.push("a", &command()).await.unwrap();
        q.push("b", &command()).await.unwrap();
        assert_eq!(q.queue_len().await.unwrap(), 2);
        assert_eq!(q.job_info("b").await.unwrap().unwrap().position, Some(2));

        let claimed = q.claim("w1").await.unwrap().unwrap();
        assert_eq!(claimed.job_id, "a");
        let info = q.job_info("a").await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Started);
        assert_eq!(info.position, None);
        assert_eq!(info.worker.as_deref(), Some("w1"));
        assert_eq!(q.job_info("b").await.unwrap().unwrap().position, Some(1));
    }

    #[tokio::test]
    async fn complete_and_fail_record_outcomes() {
        let q = MemoryJobQueue::new();
        q.push("a", &command()).await.unwrap();
        q.push("b", &command()).await.unwrap();
        q.claim("w").await.unwrap();
        q.claim("w").await.unwrap();

        q.complete("a", "w", "results:a", KEEP).await.unwrap();
        q.fail("b", "w", JobState::Stopped, "timed out", None, KEEP)
            .await
            .unwrap();

        let a = q.job_info("a").await.unwrap().unwrap();
        assert_eq!(a.state, JobState::Finished);
        assert_eq!(a.result_key.as_deref(), Some("results:a"));
        let b = q.job_info("b").await.unwrap().unwrap();
        assert_eq!(b.state, JobState::Stopped);
        assert_eq!(b.error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn job_records_expire_after_keep() {
        let q = MemoryJobQueue::new();
        q.push("a", &command()).await.unwrap();
        q.claim("w").await.unwrap();
        q.complete("a", "w", "k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(q.job_info("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_worker_jobs_are_requeued_at_head() {
        let q = MemoryJobQueue::new();
        q.push("a", &command()).await.unwrap();
        q.push("b", &command()).await.unwrap();
        q.heartbeat("dead", Duration::from_millis(10)).await.unwrap();
        q.heartbeat("alive", Duration::from_secs(60)).await.unwrap();
        q.claim("dead").await.unwrap();
        assert_eq!(q.live_workers().await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.live_workers().await.unwrap(), 1);
        assert_eq!(q.requeue_orphans().await.unwrap(), 1);

        let info = q.job_info("a").await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Queued);
        assert_eq!(info.position, Some(1));
        assert_eq!(q.claim("alive").await.unwrap().unwrap().job_id, "a");
    }

    #[tokio::test]
    async fn unavailable_queue_reports_connectivity() {
        let q = MemoryJobQueue::new();
        q.set_unavailable(true);
        let err = q.ping().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connectivity);
        q.set_unavailable(false);
        q.ping().await.unwrap();
    }

    #[tokio::test]
    async fn results_expire() {
        let store = MemoryResultStore::new();
        store.put("k", vec![1, 2, 3], Duration::from_millis(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1, 2, 3]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }
}
