//! Durable-queue orchestrator: jobs travel through an external queue to
//! worker processes that share no memory with the API process.
//!
//! ```text
//!  API process                       queue / store             worker process(es)
//! ┌──────────────────────┐      ┌──────────────────┐      ┌──────────────────────┐
//! │ enqueue ─ JobCommand ─┼─────▶│ queue (FIFO)     │◀─────┼─ claim               │
//! │                      │      │ job records      │      │ process_task         │
//! │ task_status ─ poll ──┼─────▶│ worker heartbeats│◀─────┼─ complete / fail     │
//! │ task_result ─ get ───┼─────▶│ result blobs+TTL │◀─────┼─ put(blob, ttl)      │
//! └──────────────────────┘      └──────────────────┘      └──────────────────────┘
//! ```
//!
//! Status is polled; staleness is bounded by the poll interval. Delivery is
//! at least once, so a job whose worker died is run again from scratch and
//! may re-upload artifacts to an object-store target.

pub mod memory;
pub mod queue;
#[cfg(feature = "redis")]
pub mod redis;
pub mod worker;

pub use memory::{MemoryJobQueue, MemoryResultStore};
pub use queue::{ClaimedJob, JobCommand, JobFunction, JobInfo, JobQueue, JobState, ResultBlob, ResultStore};
pub use worker::DurableWorker;

use super::{Orchestrator, RunningGuard, TaskRegistry};
use crate::config::{ConvertOptions, ConverterManagerConfig, DurableOrchestratorConfig};
use crate::connectors::ConnectorContext;
use crate::convert::ConverterManager;
use crate::engine::EngineFactory;
use crate::error::{JobkitError, Result};
use crate::result::TaskResult;
use crate::task::{ResultHandle, Task, TaskId, TaskSource, TaskStatus, TaskTarget};
use async_trait::async_trait;
use std::sync::atomic::AtomicBool;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What embedded workers need to build their own converter managers.
#[derive(Clone)]
struct EmbeddedWorkers {
    manager_config: ConverterManagerConfig,
    factory: Arc<dyn EngineFactory>,
    connectors: ConnectorContext,
}

/// Orchestrator backed by a [`JobQueue`] and a [`ResultStore`].
pub struct DurableOrchestrator {
    config: DurableOrchestratorConfig,
    queue: Arc<dyn JobQueue>,
    results: Arc<dyn ResultStore>,
    registry: TaskRegistry,
    embedded: Option<EmbeddedWorkers>,
    started: AtomicBool,
}

impl std::fmt::Debug for DurableOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableOrchestrator")
            .field("config", &self.config)
            .field("tasks", &self.registry.len())
            .field("embedded_workers", &self.embedded.is_some())
            .finish()
    }
}

impl DurableOrchestrator {
    /// An API-side orchestrator over the given backends. Workers run
    /// elsewhere unless [`with_embedded_workers`](Self::with_embedded_workers)
    /// is used.
    pub fn new(
        config: DurableOrchestratorConfig,
        queue: Arc<dyn JobQueue>,
        results: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            queue,
            results,
            registry: TaskRegistry::new(),
            embedded: None,
            started: AtomicBool::new(false),
        })
    }

    /// Let `process_queue` run `num_workers` workers in this process, each
    /// with its own converter manager.
    pub fn with_embedded_workers(
        mut self,
        manager_config: ConverterManagerConfig,
        factory: Arc<dyn EngineFactory>,
        connectors: ConnectorContext,
    ) -> Result<Self> {
        manager_config.validate()?;
        self.embedded = Some(EmbeddedWorkers {
            manager_config,
            factory,
            connectors,
        });
        Ok(self)
    }

    /// Connect to Redis at `config.redis_url` for both queue and results.
    #[cfg(feature = "redis")]
    pub async fn connect(config: DurableOrchestratorConfig) -> Result<Self> {
        let conn = self::redis::connect(&config.redis_url).await?;
        let queue = self::redis::RedisJobQueue::new(conn.clone(), config.queue_name.clone())
            .with_namespace(config.namespace.clone());
        let results = self::redis::RedisResultStore::new(conn);
        Self::new(config, Arc::new(queue), Arc::new(results))
    }

    pub fn config(&self) -> &DurableOrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// A standalone worker sharing this orchestrator's backends.
    pub fn worker(&self, manager: Arc<ConverterManager>) -> DurableWorker {
        DurableWorker::new(
            self.config.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.results),
            manager,
        )
    }

    /// Run the embedded workers until `shutdown` resolves. Each worker then
    /// leaves the queue's liveness set before this returns.
    pub async fn process_queue_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Some(embedded) = self.embedded.clone().filter(|_| !self.config.api_only) else {
            info!("api-only orchestrator, workers run in separate processes");
            return Ok(());
        };
        let workers = (0..self.config.num_workers)
            .map(|n| {
                let manager = ConverterManager::new(
                    embedded.manager_config.clone(),
                    Arc::clone(&embedded.factory),
                    embedded.connectors.clone(),
                )?;
                let worker = self.worker(Arc::new(manager));
                let id = format!("{}-{n}", worker.id());
                Ok(worker.with_id(id))
            })
            .collect::<Result<Vec<_>>>()?;
        let _running = RunningGuard::acquire(&self.started)?;

        let (stop, stopped) = watch::channel(false);
        let mut set = JoinSet::new();
        for worker in workers {
            let mut stopped = stopped.clone();
            set.spawn(async move {
                worker
                    .run_until(async move {
                        let _ = stopped.wait_for(|stop| *stop).await;
                    })
                    .await
            });
        }
        info!(workers = self.config.num_workers, "embedded workers started");

        tokio::pin!(shutdown);
        let mut stopping = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => error!(error = %e, "worker stopped"),
                    Some(Err(e)) => error!(error = %e, "worker exited abnormally"),
                },
                _ = &mut shutdown, if !stopping => {
                    stopping = true;
                    info!("stopping embedded workers");
                    let _ = stop.send(true);
                }
            }
        }
        Ok(())
    }

    /// Fold a job's queue state into the registry. Never moves a task
    /// backwards.
    fn apply(&self, task_id: &TaskId, info: &JobInfo) -> Result<()> {
        let next = info.state.task_status();
        if next.is_terminal() {
            let handle = info
                .result_key
                .clone()
                .map(|key| ResultHandle::Stored { key });
            if self.registry.finish(task_id, next, handle)? {
                match &info.error {
                    Some(error) => warn!(%task_id, state = %info.state, %error, "job ended"),
                    None => debug!(%task_id, state = %info.state, "job ended"),
                }
            }
        } else {
            self.registry.advance(task_id, next)?;
        }
        Ok(())
    }

    /// Fetch the job's state and reconcile the local view.
    async fn refresh(&self, task_id: &TaskId) -> Result<Task> {
        let task = self.registry.get(task_id)?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        if let Some(info) = self.queue.job_info(&task_id.to_string()).await? {
            self.apply(task_id, &info)?;
        }
        self.registry.get(task_id)
    }
}

#[async_trait]
impl Orchestrator for DurableOrchestrator {
    async fn enqueue(
        &self,
        sources: Vec<TaskSource>,
        options: ConvertOptions,
        target: TaskTarget,
    ) -> Result<Task> {
        let task = Task::new(sources, options, target);
        let command = JobCommand::convert(task.payload());
        self.queue.push(&task.task_id.to_string(), &command).await?;
        self.registry.insert(task.clone());
        info!(task_id = %task.task_id, queue = %self.config.queue_name, "job submitted");
        Ok(task)
    }

    async fn queue_size(&self) -> Result<usize> {
        self.queue.queue_len().await
    }

    async fn get_queue_position(&self, task_id: &TaskId) -> Option<usize> {
        if self.registry.status(task_id)?.is_terminal() {
            return None;
        }
        let info = match self.queue.job_info(&task_id.to_string()).await {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                warn!(%task_id, error = %e, "job status fetch failed");
                return None;
            }
        };
        if let Err(e) = self.apply(task_id, &info) {
            warn!(%task_id, error = %e, "could not record job state");
        }
        match info.state.task_status() {
            TaskStatus::Pending => info.position,
            TaskStatus::Started => Some(1),
            TaskStatus::Success | TaskStatus::Failure => None,
        }
    }

    async fn task_status(&self, task_id: &TaskId, wait: Duration) -> Result<Task> {
        let task = self.refresh(task_id).await?;
        if wait.is_zero() || task.status.is_terminal() {
            return Ok(task);
        }
        let from = task.status;
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return self.registry.get(task_id);
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
            let task = self.refresh(task_id).await?;
            if task.status != from {
                return Ok(task);
            }
        }
    }

    async fn task_result(&self, task_id: &TaskId) -> Result<Option<Arc<TaskResult>>> {
        let task = self.refresh(task_id).await?;
        let key = match task.result {
            Some(ResultHandle::Stored { key }) => key,
            Some(ResultHandle::Inline(result)) => return Ok(Some(result)),
            None => return Ok(None),
        };
        match self.results.get(&key).await? {
            Some(blob) => Ok(Some(Arc::new(ResultBlob::decode(&blob)?))),
            None => {
                debug!(%task_id, %key, "result blob expired or missing");
                Ok(None)
            }
        }
    }

    async fn process_queue(&self) -> Result<()> {
        self.process_queue_until(std::future::pending()).await
    }

    async fn warm_up_caches(&self) -> Result<()> {
        debug!("engine caches live in the workers, nothing to warm up here");
        Ok(())
    }

    async fn clear_converters(&self) -> Result<()> {
        debug!("engine caches live in the workers, nothing to clear here");
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        self.queue.ping().await?;
        self.results.ping().await?;
        if self.config.api_only {
            return Ok(());
        }
        let workers = self.queue.live_workers().await?;
        if workers == 0 {
            return Err(JobkitError::NoWorkers {
                queue: self.config.queue_name.clone(),
            });
        }
        debug!(workers, "live workers attached");
        Ok(())
    }
}
