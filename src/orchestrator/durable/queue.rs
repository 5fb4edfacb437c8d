//! The contracts between the durable orchestrator, its workers, and the
//! infrastructure they share.
//!
//! Nothing here holds a closure or a live reference: a job is a
//! [`JobCommand`] naming the function to run by a stable string plus a
//! fully serialisable [`TaskPayload`], so it survives a process boundary.

use crate::error::{JobkitError, Result};
use crate::result::{ResultKind, TaskResult};
use crate::task::{TaskPayload, TaskStatus};
use async_trait::async_trait;
use rmp_serde as rmps;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ── Job state ────────────────────────────────────────────────────────────

/// Native job states of the external queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Scheduled,
    Deferred,
    Started,
    Finished,
    Stopped,
    Failed,
    Canceled,
}

impl JobState {
    /// Map onto the task lifecycle.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            JobState::Queued | JobState::Scheduled | JobState::Deferred => TaskStatus::Pending,
            JobState::Started => TaskStatus::Started,
            JobState::Finished => TaskStatus::Success,
            JobState::Stopped | JobState::Failed | JobState::Canceled => TaskStatus::Failure,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.task_status().is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Scheduled => "scheduled",
            JobState::Deferred => "deferred",
            JobState::Started => "started",
            JobState::Finished => "finished",
            JobState::Stopped => "stopped",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobkitError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "queued" => JobState::Queued,
            "scheduled" => JobState::Scheduled,
            "deferred" => JobState::Deferred,
            "started" => JobState::Started,
            "finished" => JobState::Finished,
            "stopped" => JobState::Stopped,
            "failed" => JobState::Failed,
            "canceled" => JobState::Canceled,
            other => return Err(JobkitError::Internal(format!("unknown job state '{other}'"))),
        })
    }
}

// ── Job messages ─────────────────────────────────────────────────────────

/// Functions a worker knows how to run, addressed by stable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobFunction {
    ConvertTask,
}

/// A job as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCommand {
    pub function: JobFunction,
    pub task: TaskPayload,
}

impl JobCommand {
    pub fn convert(task: TaskPayload) -> Self {
        Self {
            function: JobFunction::ConvertTask,
            task,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// What the queue knows about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    pub state: JobState,
    /// 1-based position while queued.
    pub position: Option<usize>,
    /// Key of the stored result blob, once written.
    pub result_key: Option<String>,
    pub error: Option<String>,
    pub worker: Option<String>,
}

/// A job handed to a worker by [`JobQueue::claim`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job_id: String,
    pub command: JobCommand,
}

// ── Backend traits ───────────────────────────────────────────────────────

/// A persistent, at-least-once job queue with worker liveness tracking.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Append a job at the tail of the queue.
    async fn push(&self, job_id: &str, command: &JobCommand) -> Result<()>;

    /// Jobs waiting to be claimed.
    async fn queue_len(&self) -> Result<usize>;

    /// `None` for unknown or expired jobs.
    async fn job_info(&self, job_id: &str) -> Result<Option<JobInfo>>;

    /// Atomically take the head job and mark it started by `worker_id`.
    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>>;

    /// Mark a job finished with its result key. The job record is kept
    /// for `keep`.
    async fn complete(&self, job_id: &str, worker_id: &str, result_key: &str, keep: Duration) -> Result<()>;

    /// Mark a job failed or stopped. A result key is recorded when the
    /// worker stored a result describing the failure.
    async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        state: JobState,
        error: &str,
        result_key: Option<&str>,
        keep: Duration,
    ) -> Result<()>;

    /// Register or refresh a worker; it counts as live for `ttl`.
    async fn heartbeat(&self, worker_id: &str, ttl: Duration) -> Result<()>;

    async fn unregister(&self, worker_id: &str) -> Result<()>;

    async fn live_workers(&self) -> Result<usize>;

    /// Put jobs held by workers whose heartbeat expired back at the head of
    /// the queue. Returns how many were re-queued.
    async fn requeue_orphans(&self) -> Result<usize>;
}

/// A shared key-value store for result blobs.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn put(&self, key: &str, blob: Vec<u8>, ttl: Duration) -> Result<()>;

    /// `None` when the key is absent or its TTL elapsed.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

// ── Result blob ──────────────────────────────────────────────────────────

/// The packed form of a [`TaskResult`] in the result store (MessagePack).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBlob {
    pub result: ResultKind,
    pub processing_time: f64,
    pub num_converted: usize,
    pub succeeded_count: usize,
    pub failed_count: usize,
}

impl ResultBlob {
    pub fn encode(result: &TaskResult) -> Result<Vec<u8>> {
        let blob = ResultBlob {
            result: result.result.clone(),
            processing_time: result.processing_time,
            num_converted: result.num_converted,
            succeeded_count: result.num_succeeded,
            failed_count: result.num_failed,
        };
        rmps::to_vec_named(&blob)
            .map_err(|e| JobkitError::Encoding(format!("result blob encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<TaskResult> {
        let blob: ResultBlob = rmps::from_slice(bytes)
            .map_err(|e| JobkitError::Encoding(format!("result blob decode: {e}")))?;
        Ok(TaskResult {
            result: blob.result,
            processing_time: blob.processing_time,
            num_converted: blob.num_converted,
            num_succeeded: blob.succeeded_count,
            num_failed: blob.failed_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvertOptions;
    use crate::error::{DocumentError, ErrorKind};
    use crate::result::{DocumentOutcome, DocumentStatus, ExportDocument, ExportedContent};
    use crate::task::{Task, TaskSource, TaskTarget};
    use pretty_assertions::assert_eq;

    #[test]
    fn job_states_map_onto_task_lifecycle() {
        use TaskStatus::*;
        let expected = [
            (JobState::Queued, Pending),
            (JobState::Scheduled, Pending),
            (JobState::Deferred, Pending),
            (JobState::Started, Started),
            (JobState::Finished, Success),
            (JobState::Stopped, Failure),
            (JobState::Failed, Failure),
            (JobState::Canceled, Failure),
        ];
        for (state, status) in expected {
            assert_eq!(state.task_status(), status, "{state}");
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("exploded".parse::<JobState>().is_err());
    }

    #[test]
    fn command_names_its_function() {
        let task = Task::new(
            vec![TaskSource::Http {
                url: "https://example.com/a.pdf".into(),
                headers: Default::default(),
            }],
            ConvertOptions::default(),
            TaskTarget::Zip,
        );
        let command = JobCommand::convert(task.payload());
        let json = command.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["function"], "convert_task");
        assert_eq!(JobCommand::from_json(&json).unwrap(), command);
    }

    #[test]
    fn result_blob_keeps_documents_and_counters() {
        let mut outcome = DocumentOutcome::failed(
            "b.pdf",
            DocumentError::UnsupportedFormat {
                document: "b.pdf".into(),
                format: "pdf".into(),
            },
            0.01,
        );
        outcome.processing_time = 0.5;
        let result = TaskResult::from_kind(
            ResultKind::Export {
                documents: vec![ExportDocument {
                    outcome,
                    content: ExportedContent {
                        json_content: Some(serde_json::json!({"pages": [1, 2]})),
                        ..Default::default()
                    },
                }],
            },
            1.25,
        );
        let decoded = ResultBlob::decode(&ResultBlob::encode(&result).unwrap()).unwrap();
        assert_eq!(decoded, result);
        assert_eq!(decoded.num_failed, 1);
        assert_eq!(decoded.documents()[0].status, DocumentStatus::Failure);
    }

    #[test]
    fn task_failure_blob_decodes() {
        let result = TaskResult::task_failed(ErrorKind::Validation, "task has no sources", 0.0);
        let decoded = ResultBlob::decode(&ResultBlob::encode(&result).unwrap()).unwrap();
        assert!(decoded.is_task_failure());
    }

    #[test]
    fn garbage_blob_is_an_encoding_error() {
        let err = ResultBlob::decode(b"\xc1\xc1").unwrap_err();
        assert!(matches!(err, JobkitError::Encoding(_)));
    }
}
