//! The unit of work and its lifecycle.
//!
//! ```text
//!            enqueue
//!               │
//!           PENDING ──► STARTED ──► SUCCESS
//!               │           │
//!               └───────────┴─────► FAILURE
//! ```
//!
//! Transitions only move forward. Once a task is terminal its status and
//! result never change again; [`Task::advance`] and [`Task::finish`] silently
//! refuse anything else, so a stale status poll cannot roll a task back.

use crate::config::ConvertOptions;
use crate::error::{JobkitError, Result};
use crate::result::TaskResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

// ── Identity ─────────────────────────────────────────────────────────────

/// Opaque, globally unique task identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = JobkitError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(TaskId)
            .map_err(|_| JobkitError::InvalidTaskId {
                value: s.to_string(),
            })
    }
}

// ── Status ───────────────────────────────────────────────────────────────

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Started => 1,
            TaskStatus::Success | TaskStatus::Failure => 2,
        }
    }

    /// Whether moving from `self` to `next` goes strictly forward.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Sources and targets ──────────────────────────────────────────────────

/// Location and credentials of an S3-compatible bucket prefix.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreCoordinates {
    /// Host (and optional port) of the service, without scheme.
    pub endpoint: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default)]
    pub region: Option<String>,
}

impl fmt::Debug for ObjectStoreCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreCoordinates")
            .field("endpoint", &self.endpoint)
            .field("verify_ssl", &self.verify_ssl)
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .field("bucket", &self.bucket)
            .field("key_prefix", &self.key_prefix)
            .field("region", &self.region)
            .finish()
    }
}

impl ObjectStoreCoordinates {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(JobkitError::InvalidCoordinates {
                detail: "endpoint is empty".into(),
            });
        }
        if self.bucket.trim().is_empty() {
            return Err(JobkitError::InvalidCoordinates {
                detail: "bucket is empty".into(),
            });
        }
        if self.endpoint.contains("://") {
            return Err(JobkitError::InvalidCoordinates {
                detail: format!("endpoint '{}' must not include a scheme", self.endpoint),
            });
        }
        Ok(())
    }

    /// Endpoint URL with scheme chosen from `verify_ssl`.
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.verify_ssl { "https" } else { "http" };
        format!("{scheme}://{}", self.endpoint)
    }

    /// The key prefix as a listing prefix: empty, or ending in `/`.
    pub fn listing_prefix(&self) -> String {
        let trimmed = self.key_prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        }
    }

    /// Whether both coordinates address the same bucket prefix.
    pub fn same_location(&self, other: &ObjectStoreCoordinates) -> bool {
        self.endpoint.eq_ignore_ascii_case(&other.endpoint)
            && self.bucket == other.bucket
            && self.listing_prefix() == other.listing_prefix()
    }
}

fn default_true() -> bool {
    true
}

fn default_pattern() -> String {
    "*".to_string()
}

/// Where a task's documents come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSource {
    /// Document bytes carried inline (base64 on the wire).
    File {
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
        filename: String,
    },
    /// A document downloaded over HTTP(S).
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// One object, or every object under the coordinate prefix when `key`
    /// is absent.
    ObjectStore {
        coordinates: ObjectStoreCoordinates,
        #[serde(default)]
        key: Option<String>,
    },
    /// A file, or the files under a directory matching `pattern`.
    LocalPath {
        path: PathBuf,
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_true")]
        recursive: bool,
    },
}

impl TaskSource {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskSource::File { .. } => "file",
            TaskSource::Http { .. } => "http",
            TaskSource::ObjectStore { .. } => "object_store",
            TaskSource::LocalPath { .. } => "local_path",
        }
    }
}

/// Where a task's converted output goes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTarget {
    /// Return exported content inside the task result.
    #[default]
    InBody,
    /// Pack exported files into a zip archive inside the task result.
    Zip,
    /// Upload exported files under the coordinate prefix.
    ObjectStore { coordinates: ObjectStoreCoordinates },
    /// Write exported files under a local directory.
    LocalPath { path: PathBuf },
}

// ── Task ─────────────────────────────────────────────────────────────────

/// How a finished task's result can be obtained.
#[derive(Debug, Clone)]
pub enum ResultHandle {
    /// The result lives in this process.
    Inline(Arc<TaskResult>),
    /// The result blob lives in a shared store under `key` until its TTL.
    Stored { key: String },
}

/// Everything a worker needs to run a task without access to the process
/// that enqueued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub task_id: TaskId,
    pub sources: Vec<TaskSource>,
    pub options: ConvertOptions,
    pub target: TaskTarget,
}

/// A unit of conversion work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: TaskId,
    pub sources: Vec<TaskSource>,
    pub options: ConvertOptions,
    pub target: TaskTarget,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub result: Option<ResultHandle>,
}

impl Task {
    pub fn new(sources: Vec<TaskSource>, options: ConvertOptions, target: TaskTarget) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            sources,
            options,
            target,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            result: None,
        }
    }

    pub fn payload(&self) -> TaskPayload {
        TaskPayload {
            task_id: self.task_id,
            sources: self.sources.clone(),
            options: self.options.clone(),
            target: self.target.clone(),
        }
    }

    /// Move to `next` if that is a forward transition. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Move to a terminal status and attach its result, once.
    pub fn finish(&mut self, next: TaskStatus, result: Option<ResultHandle>) -> bool {
        if !next.is_terminal() || !self.advance(next) {
            return false;
        }
        self.result = result;
        true
    }
}

/// Serde adapter storing bytes as a base64 string.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
