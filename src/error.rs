//! Error types for the edgequake-jobkit library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`JobkitError`]: **Fatal** to the operation that raised it: bad
//!   configuration, an unreachable queue, an unknown task id. Returned as
//!   `Err(JobkitError)` from orchestrator and connector calls.
//!
//! * [`DocumentError`]: **Non-fatal**: a single document in a task failed
//!   (download error, unsupported format, engine failure) while its siblings
//!   carried on. Stored inside [`crate::result::DocumentOutcome`] so a
//!   finished task can report "document N failed" separately from "the whole
//!   task failed to run".
//!
//! Both map onto the coarse [`ErrorKind`] taxonomy, which is what ends up in
//! serialised task results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, JobkitError>;

/// Coarse failure classification shared by fatal and per-document errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed configuration or coordinates, rejected before work starts.
    Validation,
    /// Queue, result store or object store unreachable.
    Connectivity,
    /// A document's pipeline failed.
    Conversion,
    /// Unknown task id or missing object.
    NotFound,
    /// An engine could not be provisioned within resource limits.
    Capacity,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Connectivity => "connectivity",
            ErrorKind::Conversion => "conversion",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All fatal errors returned by the edgequake-jobkit library.
///
/// Document-level failures use [`DocumentError`] and are stored in the task
/// result rather than propagated here.
#[derive(Debug, Error)]
pub enum JobkitError {
    // ── Validation errors ─────────────────────────────────────────────────
    /// Builder or request validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object-store coordinates are incomplete or contradictory.
    #[error("Invalid object-store coordinates: {detail}")]
    InvalidCoordinates { detail: String },

    /// A string could not be parsed as a task id.
    #[error("Invalid task id '{value}'")]
    InvalidTaskId { value: String },

    /// No engine could be built for the requested options.
    #[error("Engine unavailable: {detail}")]
    EngineUnavailable { detail: String },

    // ── Connectivity errors ───────────────────────────────────────────────
    /// The job queue or result store could not be reached.
    #[error("{backend} backend unreachable: {detail}")]
    BackendUnavailable { backend: String, detail: String },

    /// The durable queue is reachable but no worker is attached to it.
    #[error("No live workers attached to queue '{queue}'\nStart one with: jobkit worker")]
    NoWorkers { queue: String },

    /// An object-store call failed.
    #[error("Object store {operation} failed for '{key}': {detail}")]
    ObjectStore {
        operation: &'static str,
        key: String,
        detail: String,
    },

    /// HTTP download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// HTTP download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Not-found errors ──────────────────────────────────────────────────
    /// No task with this id is tracked by the orchestrator.
    #[error("Task '{task_id}' not found")]
    TaskNotFound { task_id: String },

    /// A source path does not exist.
    #[error("Source path not found: '{path}'")]
    SourceNotFound { path: PathBuf },

    /// A document id is not known to its source processor.
    #[error("Document '{id}' not found in source")]
    DocumentNotFound { id: String },

    // ── Capacity errors ───────────────────────────────────────────────────
    /// The engine cache was configured with no room for any engine.
    #[error("Engine cache capacity must be at least 1, got {capacity}")]
    CacheCapacity { capacity: usize },

    // ── I/O and encoding errors ───────────────────────────────────────────
    /// Reading or writing a local file failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON (de)serialisation failed.
    #[error("Serialisation error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary result blob could not be encoded or decoded.
    #[error("Result blob encoding error: {0}")]
    Encoding(String),

    /// Zip archive could not be written.
    #[error("Archive error: {0}")]
    Archive(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobkitError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobkitError::InvalidConfig(_)
            | JobkitError::InvalidCoordinates { .. }
            | JobkitError::InvalidTaskId { .. }
            | JobkitError::EngineUnavailable { .. } => ErrorKind::Validation,
            JobkitError::BackendUnavailable { .. }
            | JobkitError::NoWorkers { .. }
            | JobkitError::ObjectStore { .. }
            | JobkitError::DownloadFailed { .. }
            | JobkitError::DownloadTimeout { .. } => ErrorKind::Connectivity,
            JobkitError::TaskNotFound { .. }
            | JobkitError::SourceNotFound { .. }
            | JobkitError::DocumentNotFound { .. } => ErrorKind::NotFound,
            JobkitError::CacheCapacity { .. } => ErrorKind::Capacity,
            JobkitError::Io { .. }
            | JobkitError::Serialization(_)
            | JobkitError::Encoding(_)
            | JobkitError::Archive(_)
            | JobkitError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobkitError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn backend(backend: &str, detail: impl fmt::Display) -> Self {
        JobkitError::BackendUnavailable {
            backend: backend.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// A non-fatal error for a single document.
///
/// Stored in [`crate::result::DocumentOutcome`]. The task keeps going unless
/// `abort_on_error` is set.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentError {
    /// The document bytes could not be retrieved from its source.
    #[error("{document}: fetch failed: {detail}")]
    FetchFailed { document: String, detail: String },

    /// The engine does not handle this input format.
    #[error("{document}: unsupported format '{format}'")]
    UnsupportedFormat { document: String, format: String },

    /// The engine returned an error.
    #[error("{document}: conversion failed: {detail}")]
    ConversionFailed { document: String, detail: String },

    /// Converted output could not be written to the target.
    #[error("{document}: export failed: {detail}")]
    ExportFailed { document: String, detail: String },

    /// Chunking the converted document failed.
    #[error("{document}: chunking failed: {detail}")]
    ChunkingFailed { document: String, detail: String },

    /// The document exceeded its conversion time budget.
    #[error("{document}: timed out after {secs}s")]
    Timeout { document: String, secs: u64 },
}

impl DocumentError {
    /// Name of the document the error belongs to.
    pub fn document(&self) -> &str {
        match self {
            DocumentError::FetchFailed { document, .. }
            | DocumentError::UnsupportedFormat { document, .. }
            | DocumentError::ConversionFailed { document, .. }
            | DocumentError::ExportFailed { document, .. }
            | DocumentError::ChunkingFailed { document, .. }
            | DocumentError::Timeout { document, .. } => document,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DocumentError::FetchFailed { .. } => ErrorKind::Connectivity,
            DocumentError::UnsupportedFormat { .. } => ErrorKind::Validation,
            DocumentError::ConversionFailed { .. }
            | DocumentError::ExportFailed { .. }
            | DocumentError::ChunkingFailed { .. }
            | DocumentError::Timeout { .. } => ErrorKind::Conversion,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_workers_display_names_queue() {
        let e = JobkitError::NoWorkers {
            queue: "conversion_queue".into(),
        };
        assert!(e.to_string().contains("conversion_queue"));
        assert_eq!(e.kind(), ErrorKind::Connectivity);
    }

    #[test]
    fn not_found_kind() {
        let e = JobkitError::TaskNotFound {
            task_id: "abc".into(),
        };
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert!(e.to_string().contains("abc"));
    }

    #[test]
    fn capacity_kind() {
        assert_eq!(
            JobkitError::CacheCapacity { capacity: 0 }.kind(),
            ErrorKind::Capacity
        );
    }

    #[test]
    fn document_error_serializes_with_type_tag() {
        let e = DocumentError::Timeout {
            document: "a.pdf".into(),
            secs: 30,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "timeout");
        let back: DocumentError = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
        assert_eq!(e.kind(), ErrorKind::Conversion);
    }
}
