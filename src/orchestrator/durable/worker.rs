//! A durable-queue worker: claim a job, convert, store the result blob,
//! settle the job.
//!
//! ```text
//! loop:
//!   requeue_orphans ─▶ claim ──(none)──▶ sleep(poll_interval)
//!                        │
//!                        ▼
//!              process_task (≤ job_timeout)
//!                        │
//!          ┌─────────────┼──────────────────┐
//!          ▼             ▼                  ▼
//!      finished     failed + blob      stopped (timeout)
//! ```
//!
//! A heartbeat task refreshes the worker's liveness entry while it runs; the
//! entry is removed when the worker stops, so its claimed job is re-queued
//! by the next live worker instead of waiting for the entry to expire.
//! Workers share no memory: each owns its [`ConverterManager`].

use super::queue::{ClaimedJob, JobFunction, JobQueue, JobState, ResultBlob, ResultStore};
use crate::config::{ConvertOptions, DurableOrchestratorConfig};
use crate::convert::ConverterManager;
use crate::error::{ErrorKind, Result};
use crate::progress::TracingProgress;
use crate::result::{ResultKind, TaskResult};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A worker's liveness entry and the task refreshing it.
///
/// [`release`](Self::release) removes the entry; dropping the registration
/// unreleased (the worker was aborted) removes it in the background.
struct Registration {
    queue: Arc<dyn JobQueue>,
    worker_id: String,
    heartbeat: JoinHandle<()>,
    released: bool,
}

impl Registration {
    async fn release(mut self) {
        self.heartbeat.abort();
        self.released = true;
        unregister(self.queue.as_ref(), &self.worker_id).await;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if self.released {
            return;
        }
        let queue = Arc::clone(&self.queue);
        let worker_id = std::mem::take(&mut self.worker_id);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { unregister(queue.as_ref(), &worker_id).await });
            }
            Err(_) => warn!(worker = %worker_id, "no runtime left, liveness entry will expire"),
        }
    }
}

async fn unregister(queue: &dyn JobQueue, worker_id: &str) {
    match queue.unregister(worker_id).await {
        Ok(()) => info!(worker = %worker_id, "worker unregistered"),
        Err(e) => warn!(worker = %worker_id, error = %e, "could not unregister worker"),
    }
}

pub struct DurableWorker {
    id: String,
    config: DurableOrchestratorConfig,
    queue: Arc<dyn JobQueue>,
    results: Arc<dyn ResultStore>,
    manager: Arc<ConverterManager>,
}

impl std::fmt::Debug for DurableWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableWorker")
            .field("id", &self.id)
            .field("queue", &self.config.queue_name)
            .finish()
    }
}

impl DurableWorker {
    pub fn new(
        config: DurableOrchestratorConfig,
        queue: Arc<dyn JobQueue>,
        results: Arc<dyn ResultStore>,
        manager: Arc<ConverterManager>,
    ) -> Self {
        Self {
            id: format!("worker-{}-{}", std::process::id(), Uuid::new_v4().simple()),
            config,
            queue,
            results,
            manager,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register, warm up, then process jobs until cancelled.
    ///
    /// # Errors
    /// Only if the first heartbeat cannot be written; later queue errors are
    /// logged and retried after `poll_interval`.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stop once `shutdown` resolves and remove
    /// the liveness entry before returning. A job in flight is abandoned and
    /// goes back to the queue.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let ttl = self.config.heartbeat_ttl();
        self.queue.heartbeat(&self.id, ttl).await?;
        let registration = Registration {
            queue: Arc::clone(&self.queue),
            worker_id: self.id.clone(),
            heartbeat: tokio::spawn(heartbeat_loop(Arc::clone(&self.queue), self.id.clone(), ttl)),
            released: false,
        };
        info!(worker = %self.id, queue = %self.config.queue_name, "worker registered");

        tokio::select! {
            _ = self.serve() => {}
            _ = shutdown => info!(worker = %self.id, "worker shutting down"),
        }
        registration.release().await;
        Ok(())
    }

    async fn serve(&self) {
        if let Err(e) = self.manager.warm_up(&ConvertOptions::default()).await {
            warn!(worker = %self.id, error = %e, "engine warm-up failed");
        }

        let poll = self.config.poll_interval();
        loop {
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll).await,
                Err(e) => {
                    warn!(worker = %self.id, error = %e, "queue error, retrying");
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }

    /// Re-queue orphans, then claim and run at most one job. Returns
    /// whether a job was run.
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.requeue_orphans().await {
            Ok(0) => {}
            Ok(n) => info!(worker = %self.id, jobs = n, "re-queued jobs of dead workers"),
            Err(e) => warn!(worker = %self.id, error = %e, "orphan scan failed"),
        }
        let Some(job) = self.queue.claim(&self.id).await? else {
            return Ok(false);
        };
        self.execute(job).await?;
        Ok(true)
    }

    async fn execute(&self, job: ClaimedJob) -> Result<()> {
        let ClaimedJob { job_id, command } = job;
        let keep = self.config.results_ttl();
        let payload = match command.function {
            JobFunction::ConvertTask => command.task,
        };
        let task_id = payload.task_id;
        info!(worker = %self.id, %task_id, sources = payload.sources.len(), "job claimed");

        let started = Instant::now();
        let manager = Arc::clone(&self.manager);
        let handle =
            tokio::spawn(async move { manager.process_task(&payload, &TracingProgress).await });
        let abort = handle.abort_handle();

        let result = match tokio::time::timeout(self.config.job_timeout(), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => TaskResult::task_failed(
                ErrorKind::Internal,
                format!("job panicked: {e}"),
                started.elapsed().as_secs_f64(),
            ),
            Err(_) => {
                abort.abort();
                let message = format!("job exceeded {}s", self.config.job_timeout_secs);
                warn!(worker = %self.id, %task_id, "{message}");
                return self
                    .queue
                    .fail(&job_id, &self.id, JobState::Stopped, &message, None, keep)
                    .await;
            }
        };

        let key = self.config.result_key(&task_id);
        if let Err(e) = self.store(&key, &result).await {
            error!(worker = %self.id, %task_id, error = %e, "could not store result");
            return self
                .queue
                .fail(&job_id, &self.id, JobState::Failed, &e.to_string(), None, keep)
                .await;
        }

        match &result.result {
            ResultKind::TaskFailed { message, .. } => {
                self.queue
                    .fail(&job_id, &self.id, JobState::Failed, message, Some(&key), keep)
                    .await?;
            }
            _ => self.queue.complete(&job_id, &self.id, &key, keep).await?,
        }
        debug!(
            worker = %self.id,
            %task_id,
            succeeded = result.num_succeeded,
            failed = result.num_failed,
            "job settled"
        );
        Ok(())
    }

    async fn store(&self, key: &str, result: &TaskResult) -> Result<()> {
        let blob = ResultBlob::encode(result)?;
        self.results.put(key, blob, self.config.results_ttl()).await
    }
}

async fn heartbeat_loop(queue: Arc<dyn JobQueue>, worker_id: String, ttl: Duration) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(100)));
    loop {
        ticker.tick().await;
        if let Err(e) = queue.heartbeat(&worker_id, ttl).await {
            warn!(worker = %worker_id, error = %e, "heartbeat failed");
        }
    }
}
