//! Output types for finished tasks.
//!
//! A [`TaskResult`] always says which of two things happened:
//!
//! * the task ran, and each document has its own [`DocumentOutcome`]
//!   (some may have failed), or
//! * the task could not run at all ([`ResultKind::TaskFailed`]): no sources,
//!   invalid options, an unreachable target.

use crate::error::{DocumentError, ErrorKind};
use crate::task::base64_bytes;
use serde::{Deserialize, Serialize};

/// Per-document status inside a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Converted and delivered.
    Success,
    /// Converted, but a later step (export, chunking) failed.
    PartialSuccess,
    /// Not converted.
    Failure,
    /// Not attempted because an earlier document failed with `abort_on_error`.
    Skipped,
}

/// What happened to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentOutcome {
    pub filename: String,
    pub status: DocumentStatus,
    #[serde(default)]
    pub errors: Vec<DocumentError>,
    /// Wall-clock seconds spent on this document.
    pub processing_time: f64,
}

impl DocumentOutcome {
    pub fn skipped(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: DocumentStatus::Skipped,
            errors: Vec::new(),
            processing_time: 0.0,
        }
    }

    pub fn failed(filename: impl Into<String>, error: DocumentError, processing_time: f64) -> Self {
        Self {
            filename: filename.into(),
            status: DocumentStatus::Failure,
            errors: vec![error],
            processing_time,
        }
    }

    /// Record a failure in a step after conversion.
    pub fn degrade(&mut self, error: DocumentError) {
        if self.status == DocumentStatus::Success {
            self.status = DocumentStatus::PartialSuccess;
        }
        self.errors.push(error);
    }
}

/// Exported content of one document, one field per requested format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportedContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doctags_content: Option<String>,
}

/// An in-body export of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub outcome: DocumentOutcome,
    pub content: ExportedContent,
}

/// One chunk of a converted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkItem {
    pub filename: String,
    pub chunk_index: usize,
    /// Chunk text prefixed with its heading context.
    pub contextualized_text: String,
    /// Chunk text alone, when `include_raw_text` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default)]
    pub headings: Vec<String>,
    #[serde(default)]
    pub page_numbers: Vec<u32>,
    pub num_tokens: usize,
}

/// The payload of a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultKind {
    /// Exported content returned in the result.
    Export { documents: Vec<ExportDocument> },
    /// A zip archive of exported files.
    Zip {
        #[serde(with = "base64_bytes")]
        content: Vec<u8>,
        documents: Vec<DocumentOutcome>,
    },
    /// Files were delivered to a remote or local target.
    RemoteTarget { documents: Vec<DocumentOutcome> },
    /// Chunks of every converted document.
    Chunked {
        chunks: Vec<ChunkItem>,
        documents: Vec<DocumentOutcome>,
    },
    /// The task as a whole failed to run.
    TaskFailed { error_kind: ErrorKind, message: String },
}

/// A finished task's result and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub result: ResultKind,
    /// Wall-clock seconds for the whole task.
    pub processing_time: f64,
    /// Documents attempted (not skipped).
    pub num_converted: usize,
    pub num_succeeded: usize,
    pub num_failed: usize,
}

impl TaskResult {
    /// A result for a task that could not run.
    pub fn task_failed(error_kind: ErrorKind, message: impl Into<String>, processing_time: f64) -> Self {
        Self {
            result: ResultKind::TaskFailed {
                error_kind,
                message: message.into(),
            },
            processing_time,
            num_converted: 0,
            num_succeeded: 0,
            num_failed: 0,
        }
    }

    /// Build a result and derive its counters from the document outcomes.
    pub fn from_kind(result: ResultKind, processing_time: f64) -> Self {
        let mut out = Self {
            result,
            processing_time,
            num_converted: 0,
            num_succeeded: 0,
            num_failed: 0,
        };
        for doc in out.documents() {
            match doc.status {
                DocumentStatus::Success => {
                    out.num_converted += 1;
                    out.num_succeeded += 1;
                }
                DocumentStatus::PartialSuccess | DocumentStatus::Failure => {
                    out.num_converted += 1;
                    out.num_failed += 1;
                }
                DocumentStatus::Skipped => {}
            }
        }
        out
    }

    pub fn is_task_failure(&self) -> bool {
        matches!(self.result, ResultKind::TaskFailed { .. })
    }

    /// Per-document outcomes in source order. Empty for a task failure.
    pub fn documents(&self) -> Vec<DocumentOutcome> {
        match &self.result {
            ResultKind::Export { documents } => {
                documents.iter().map(|d| d.outcome.clone()).collect()
            }
            ResultKind::Zip { documents, .. }
            | ResultKind::RemoteTarget { documents }
            | ResultKind::Chunked { documents, .. } => documents.clone(),
            ResultKind::TaskFailed { .. } => Vec::new(),
        }
    }
}
