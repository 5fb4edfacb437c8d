//! In-process orchestrator: a FIFO queue and `W` worker loops in one
//! runtime.
//!
//! ```text
//! enqueue ──▶ registry.insert ──▶ live.push ──▶ mpsc (unbounded, FIFO)
//!                                                 │
//!                     ┌───────────────┬───────────┴───┐
//!                     ▼               ▼               ▼
//!                  worker 0        worker 1   …    worker W-1
//!                  recv → STARTED → process_task → SUCCESS/FAILURE
//! ```
//!
//! Conversion runs on the blocking pool, so status polls stay responsive
//! while documents convert. A dispatched task cannot be cancelled: it runs
//! to a terminal status even if `process_queue` is dropped meanwhile. The
//! queue is unbounded; sustained overload grows the backlog.

use super::{Orchestrator, RunningGuard, TaskRegistry};
use crate::config::{ConvertOptions, ConverterManagerConfig, LocalOrchestratorConfig};
use crate::connectors::ConnectorContext;
use crate::convert::ConverterManager;
use crate::engine::text::TextEngineFactory;
use crate::engine::EngineFactory;
use crate::error::{ErrorKind, JobkitError, Result};
use crate::progress::TracingProgress;
use crate::result::TaskResult;
use crate::task::{ResultHandle, Task, TaskId, TaskSource, TaskStatus, TaskTarget};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

struct Inner {
    config: LocalOrchestratorConfig,
    registry: TaskRegistry,
    sender: mpsc::UnboundedSender<TaskId>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskId>>,
    /// Pending and running task ids, in admission order.
    live: Mutex<Vec<TaskId>>,
    /// Tasks enqueued but not yet picked up by a worker.
    waiting: AtomicUsize,
    /// One manager shared by every worker, or one per worker.
    managers: Vec<Arc<ConverterManager>>,
    started: AtomicBool,
}

/// Single-process orchestrator with a pool of cooperative workers.
#[derive(Clone)]
pub struct LocalOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalOrchestrator")
            .field("config", &self.inner.config)
            .field("tasks", &self.inner.registry.len())
            .field("waiting", &self.inner.waiting.load(Ordering::SeqCst))
            .finish()
    }
}

impl LocalOrchestrator {
    /// Build an orchestrator and its converter manager(s).
    ///
    /// With `shared_models` all workers share one engine cache; otherwise
    /// each worker gets its own.
    pub fn new(
        config: LocalOrchestratorConfig,
        manager_config: ConverterManagerConfig,
        factory: Arc<dyn EngineFactory>,
        connectors: ConnectorContext,
    ) -> Result<Self> {
        config.validate()?;
        let count = if config.shared_models {
            1
        } else {
            config.num_workers
        };
        let managers = (0..count)
            .map(|_| {
                ConverterManager::new(manager_config.clone(), Arc::clone(&factory), connectors.clone())
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_managers(config, managers))
    }

    /// An orchestrator using the built-in text engine and default settings.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            LocalOrchestratorConfig::default(),
            ConverterManagerConfig::default(),
            Arc::new(TextEngineFactory::new()),
            ConnectorContext::default(),
        )
    }

    /// Use an existing manager for every worker.
    pub fn with_manager(config: LocalOrchestratorConfig, manager: Arc<ConverterManager>) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_managers(config, vec![manager]))
    }

    fn from_managers(config: LocalOrchestratorConfig, managers: Vec<Arc<ConverterManager>>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                registry: TaskRegistry::new(),
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                live: Mutex::new(Vec::new()),
                waiting: AtomicUsize::new(0),
                managers,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }
}

impl Inner {
    fn manager_for(&self, worker: usize) -> Option<Arc<ConverterManager>> {
        self.managers.get(worker % self.managers.len().max(1)).cloned()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let Some(manager) = self.manager_for(worker) else {
            error!(worker, "no converter manager available");
            return;
        };
        debug!(worker, "worker started");
        loop {
            let next = self.receiver.lock().await.recv().await;
            let Some(task_id) = next else {
                break;
            };
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            self.run_task(worker, &manager, task_id).await;
        }
        debug!(worker, "worker stopped");
    }

    /// Run one task on its own tokio task. The outcome is recorded there, so
    /// it survives the worker loop being cancelled mid-task.
    async fn run_task(self: &Arc<Self>, worker: usize, manager: &Arc<ConverterManager>, task_id: TaskId) {
        let payload = match self.registry.get(&task_id) {
            Ok(task) => task.payload(),
            Err(e) => {
                error!(worker, %task_id, error = %e, "dequeued task is not registered");
                return;
            }
        };
        if let Err(e) = self.registry.advance(&task_id, TaskStatus::Started) {
            error!(worker, %task_id, error = %e, "could not mark task started");
        }
        info!(worker, %task_id, "running task");

        let inner = Arc::clone(self);
        let manager = Arc::clone(manager);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = AssertUnwindSafe(manager.process_task(&payload, &TracingProgress))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    TaskResult::task_failed(
                        ErrorKind::Internal,
                        "task panicked".to_string(),
                        started.elapsed().as_secs_f64(),
                    )
                });
            inner.record(worker, task_id, result);
        });
        if let Err(e) = handle.await {
            error!(worker, %task_id, error = %e, "task runner exited abnormally");
        }
    }

    fn record(&self, worker: usize, task_id: TaskId, result: TaskResult) {
        let status = if result.is_task_failure() {
            TaskStatus::Failure
        } else {
            TaskStatus::Success
        };
        self.live.lock().retain(|id| *id != task_id);
        if let Err(e) = self.registry.finish(
            &task_id,
            status,
            Some(ResultHandle::Inline(Arc::new(result))),
        ) {
            error!(worker, %task_id, error = %e, "could not record task result");
        }
        info!(worker, %task_id, %status, "task done");
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn enqueue(
        &self,
        sources: Vec<TaskSource>,
        options: ConvertOptions,
        target: TaskTarget,
    ) -> Result<Task> {
        let task = Task::new(sources, options, target);
        let task_id = task.task_id;
        self.inner.registry.insert(task.clone());
        self.inner.live.lock().push(task_id);
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        if self.inner.sender.send(task_id).is_err() {
            self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
            self.inner.live.lock().retain(|id| *id != task_id);
            return Err(JobkitError::Internal("task queue is closed".into()));
        }
        info!(%task_id, sources = task.sources.len(), "task enqueued");
        Ok(task)
    }

    async fn queue_size(&self) -> Result<usize> {
        Ok(self.inner.waiting.load(Ordering::SeqCst))
    }

    async fn get_queue_position(&self, task_id: &TaskId) -> Option<usize> {
        if self.inner.registry.status(task_id)?.is_terminal() {
            return None;
        }
        self.inner
            .live
            .lock()
            .iter()
            .position(|id| id == task_id)
            .map(|idx| idx + 1)
    }

    async fn task_status(&self, task_id: &TaskId, wait: Duration) -> Result<Task> {
        let task = self.inner.registry.get(task_id)?;
        if wait.is_zero() || task.status.is_terminal() {
            return Ok(task);
        }
        self.inner
            .registry
            .wait_for_change(task_id, task.status, wait)
            .await
    }

    async fn task_result(&self, task_id: &TaskId) -> Result<Option<Arc<TaskResult>>> {
        Ok(match self.inner.registry.result(task_id)? {
            Some(ResultHandle::Inline(result)) => Some(result),
            Some(ResultHandle::Stored { .. }) | None => None,
        })
    }

    async fn process_queue(&self) -> Result<()> {
        let _running = RunningGuard::acquire(&self.inner.started)?;
        let workers = self.inner.config.num_workers;
        info!(workers, shared_models = self.inner.config.shared_models, "starting workers");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(Arc::clone(&self.inner).worker_loop(worker));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker exited abnormally");
            }
        }
        Ok(())
    }

    async fn warm_up_caches(&self) -> Result<()> {
        let options = ConvertOptions::default();
        for manager in &self.inner.managers {
            manager.warm_up(&options).await?;
        }
        Ok(())
    }

    async fn clear_converters(&self) -> Result<()> {
        for manager in &self.inner.managers {
            manager.clear();
        }
        Ok(())
    }

    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultKind;

    fn file(name: &str, text: &str) -> TaskSource {
        TaskSource::File {
            content: text.as_bytes().to_vec(),
            filename: name.into(),
        }
    }

    #[tokio::test]
    async fn tasks_wait_until_workers_start() {
        let orch = LocalOrchestrator::with_defaults().unwrap();
        let a = orch
            .enqueue(vec![file("a.md", "a")], ConvertOptions::default(), TaskTarget::InBody)
            .await
            .unwrap();
        let b = orch
            .enqueue(vec![file("b.md", "b")], ConvertOptions::default(), TaskTarget::InBody)
            .await
            .unwrap();

        assert_eq!(orch.queue_size().await.unwrap(), 2);
        assert_eq!(orch.get_queue_position(&a.task_id).await, Some(1));
        assert_eq!(orch.get_queue_position(&b.task_id).await, Some(2));
        assert_eq!(orch.get_queue_position(&TaskId::new()).await, None);
        assert!(orch.task_result(&a.task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn workers_run_tasks_to_completion() {
        let orch = LocalOrchestrator::with_defaults().unwrap();
        let runner = orch.clone();
        let workers = tokio::spawn(async move { runner.process_queue().await });

        let task = orch
            .enqueue(vec![file("a.md", "# A")], ConvertOptions::default(), TaskTarget::InBody)
            .await
            .unwrap();
        let mut status = task.status;
        for _ in 0..100 {
            status = orch
                .task_status(&task.task_id, Duration::from_millis(100))
                .await
                .unwrap()
                .status;
            if status.is_terminal() {
                break;
            }
        }
        assert_eq!(status, TaskStatus::Success);
        assert_eq!(orch.get_queue_position(&task.task_id).await, None);

        let result = orch.task_result(&task.task_id).await.unwrap().unwrap();
        assert!(matches!(result.result, ResultKind::Export { .. }));
        assert_eq!(result.num_succeeded, 1);
        workers.abort();
    }

    #[tokio::test]
    async fn empty_task_fails_as_a_whole() {
        let orch = LocalOrchestrator::with_defaults().unwrap();
        let runner = orch.clone();
        let workers = tokio::spawn(async move { runner.process_queue().await });

        let task = orch
            .enqueue(vec![], ConvertOptions::default(), TaskTarget::InBody)
            .await
            .unwrap();
        let seen = orch
            .task_status(&task.task_id, Duration::from_secs(5))
            .await
            .unwrap();
        let seen = if seen.status.is_terminal() {
            seen
        } else {
            orch.task_status(&task.task_id, Duration::from_secs(5)).await.unwrap()
        };
        assert_eq!(seen.status, TaskStatus::Failure);
        let result = orch.task_result(&task.task_id).await.unwrap().unwrap();
        assert!(result.is_task_failure());
        workers.abort();
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let orch = LocalOrchestrator::with_defaults().unwrap();
        let err = orch
            .task_status(&TaskId::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(orch.task_result(&TaskId::new()).await.is_err());
    }

    #[tokio::test]
    async fn per_worker_managers() {
        let config = LocalOrchestratorConfig {
            num_workers: 3,
            shared_models: false,
        };
        let orch = LocalOrchestrator::new(
            config,
            ConverterManagerConfig::default(),
            Arc::new(TextEngineFactory::new()),
            ConnectorContext::default(),
        )
        .unwrap();
        assert_eq!(orch.inner.managers.len(), 3);
        orch.warm_up_caches().await.unwrap();
        assert!(orch.inner.managers.iter().all(|m| m.cached_engines().0 == 1));
        orch.clear_converters().await.unwrap();
        assert!(orch.inner.managers.iter().all(|m| m.cached_engines().0 == 0));
    }

    #[tokio::test]
    async fn process_queue_runs_once() {
        let orch = LocalOrchestrator::with_defaults().unwrap();
        let runner = orch.clone();
        let workers = tokio::spawn(async move { runner.process_queue().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(orch.process_queue().await.is_err());
        workers.abort();
    }
}
