//! Orchestrators: accept tasks, track their lifecycle, and run them on an
//! execution backend.
//!
//! ```text
//!            enqueue ──▶ TaskRegistry (id → Task, RwLock)
//!               │
//!     ┌─────────┴──────────┐
//!     ▼                    ▼
//!  local::LocalOrchestrator      durable::DurableOrchestrator
//!  in-process FIFO + W workers   external queue + worker processes
//!  shared ConverterManager(s)    result blobs under a TTL
//! ```
//!
//! Both backends implement [`Orchestrator`]; status is polled, never pushed.

pub mod durable;
pub mod local;

use crate::config::ConvertOptions;
use crate::error::{JobkitError, Result};
use crate::result::TaskResult;
use crate::task::{ResultHandle, Task, TaskId, TaskSource, TaskStatus, TaskTarget};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// The operations every execution backend provides.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Register a new task and submit it for execution. Does not wait for
    /// the task to run.
    async fn enqueue(
        &self,
        sources: Vec<TaskSource>,
        options: ConvertOptions,
        target: TaskTarget,
    ) -> Result<Task>;

    /// Number of tasks waiting to be picked up.
    async fn queue_size(&self) -> Result<usize>;

    /// 1-based position of a pending or running task; `None` when the task
    /// is unknown, finished, or the position cannot be determined.
    async fn get_queue_position(&self, task_id: &TaskId) -> Option<usize>;

    /// Current view of a task. With a non-zero `wait`, waits up to that long
    /// for the status to move before answering.
    ///
    /// # Errors
    /// [`JobkitError::TaskNotFound`] for unknown ids.
    async fn task_status(&self, task_id: &TaskId, wait: Duration) -> Result<Task>;

    /// The finished result, or `None` while the task runs or after the
    /// stored result expired. Never waits.
    ///
    /// # Errors
    /// [`JobkitError::TaskNotFound`] for unknown ids.
    async fn task_result(&self, task_id: &TaskId) -> Result<Option<Arc<TaskResult>>>;

    /// Start the backend's workers and run until cancelled.
    async fn process_queue(&self) -> Result<()>;

    async fn warm_up_caches(&self) -> Result<()>;

    async fn clear_converters(&self) -> Result<()>;

    /// Fail fast when backing infrastructure is unreachable.
    async fn check_connection(&self) -> Result<()>;
}

// ── Task registry ────────────────────────────────────────────────────────

/// The orchestrator's id → task map.
///
/// Readers (status polls) and the single writer of each task (its worker)
/// go through the read/write lock; every mutation wakes status waiters.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Task>>,
    changed: Notify,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        self.tasks.write().insert(task.task_id, task);
        self.changed.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, task_id: &TaskId) -> Result<Task> {
        self.tasks
            .read()
            .get(task_id)
            .cloned()
            .ok_or_else(|| not_found(task_id))
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.read().get(task_id).map(|t| t.status)
    }

    pub fn result(&self, task_id: &TaskId) -> Result<Option<ResultHandle>> {
        self.tasks
            .read()
            .get(task_id)
            .map(|t| t.result.clone())
            .ok_or_else(|| not_found(task_id))
    }

    /// Move a task forward. Returns whether the status changed.
    pub fn advance(&self, task_id: &TaskId, next: TaskStatus) -> Result<bool> {
        self.update(task_id, |task| task.advance(next))
    }

    /// Move a task to a terminal status with its result, once.
    pub fn finish(
        &self,
        task_id: &TaskId,
        next: TaskStatus,
        result: Option<ResultHandle>,
    ) -> Result<bool> {
        self.update(task_id, |task| task.finish(next, result))
    }

    fn update<R>(&self, task_id: &TaskId, f: impl FnOnce(&mut Task) -> R) -> Result<R> {
        let out = {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(task_id).ok_or_else(|| not_found(task_id))?;
            f(task)
        };
        self.changed.notify_waiters();
        Ok(out)
    }

    /// Wait until the task's status differs from `from`, or `wait` elapses.
    pub async fn wait_for_change(
        &self,
        task_id: &TaskId,
        from: TaskStatus,
        wait: Duration,
    ) -> Result<Task> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.get(task_id)?;
            if task.status != from || Instant::now() >= deadline {
                return Ok(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(task_id);
            }
        }
    }
}

/// Marks a `process_queue` call as running; the flag is cleared on drop,
/// including when the call is cancelled.
pub(crate) struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(JobkitError::InvalidConfig(
                "process_queue is already running".into(),
            ));
        }
        Ok(Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn not_found(task_id: &TaskId) -> JobkitError {
    JobkitError::TaskNotFound {
        task_id: task_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{ResultKind, TaskResult};

    fn task() -> Task {
        Task::new(vec![], ConvertOptions::default(), TaskTarget::InBody)
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let reg = TaskRegistry::new();
        let err = reg.get(&TaskId::new()).unwrap_err();
        assert!(matches!(err, JobkitError::TaskNotFound { .. }));
        assert!(reg.advance(&TaskId::new(), TaskStatus::Started).is_err());
    }

    #[test]
    fn terminal_tasks_are_frozen() {
        let reg = TaskRegistry::new();
        let t = task();
        let id = t.task_id;
        reg.insert(t);

        assert!(reg.advance(&id, TaskStatus::Started).unwrap());
        let result = Arc::new(TaskResult::from_kind(ResultKind::Export { documents: vec![] }, 0.1));
        assert!(reg
            .finish(&id, TaskStatus::Success, Some(ResultHandle::Inline(result)))
            .unwrap());
        assert!(!reg.finish(&id, TaskStatus::Failure, None).unwrap());
        assert!(!reg.advance(&id, TaskStatus::Started).unwrap());
        assert_eq!(reg.status(&id), Some(TaskStatus::Success));
        assert!(reg.result(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn waiters_wake_on_change() {
        let reg = Arc::new(TaskRegistry::new());
        let t = task();
        let id = t.task_id;
        reg.insert(t);

        let writer = Arc::clone(&reg);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.advance(&id, TaskStatus::Started).unwrap();
        });
        let seen = reg
            .wait_for_change(&id, TaskStatus::Pending, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(seen.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn wait_times_out_without_change() {
        let reg = TaskRegistry::new();
        let t = task();
        let id = t.task_id;
        reg.insert(t);
        let seen = reg
            .wait_for_change(&id, TaskStatus::Pending, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(seen.status, TaskStatus::Pending);
    }
}
