//! Progress-callback trait for per-document task events.
//!
//! Pass an implementation to
//! [`crate::convert::ConverterManager::process_task`] to observe a task as
//! its documents are fetched, converted and delivered. Orchestrators use
//! [`TracingProgress`], which turns the events into `tracing` records.
//!
//! # Example
//!
//! ```rust
//! use edgequake_jobkit::{DocumentOutcome, TaskProgressCallback};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl TaskProgressCallback for Counter {
//!     fn on_document_complete(&self, _index: usize, _outcome: &DocumentOutcome) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::result::{DocumentOutcome, DocumentStatus};
use crate::task::TaskId;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Called by the task pipeline as it works through a task's documents.
///
/// Documents of one task are processed concurrently, so
/// `on_document_complete` may be called from several threads at once and
/// out of source order. All methods default to no-ops.
pub trait TaskProgressCallback: Send + Sync {
    /// Called once, before any document is fetched.
    ///
    /// # Arguments
    /// * `task_id`:      the task being processed
    /// * `source_count`: number of sources attached to the task
    fn on_task_start(&self, task_id: &TaskId, source_count: usize) {
        let _ = (task_id, source_count);
    }

    /// Called when one document reaches its final outcome.
    ///
    /// # Arguments
    /// * `index`:   0-based position of the document in enumeration order
    /// * `outcome`: the document's status and errors
    fn on_document_complete(&self, index: usize, outcome: &DocumentOutcome) {
        let _ = (index, outcome);
    }

    /// Called once after every document was attempted or skipped.
    fn on_task_complete(&self, task_id: &TaskId, succeeded: usize, failed: usize) {
        let _ = (task_id, succeeded, failed);
    }
}

/// Ignores every event.
pub struct NoopProgressCallback;

impl TaskProgressCallback for NoopProgressCallback {}

/// Logs every event through `tracing`.
pub struct TracingProgress;

impl TaskProgressCallback for TracingProgress {
    fn on_task_start(&self, task_id: &TaskId, source_count: usize) {
        info!(%task_id, source_count, "task started");
    }

    fn on_document_complete(&self, index: usize, outcome: &DocumentOutcome) {
        match outcome.status {
            DocumentStatus::Success | DocumentStatus::Skipped => debug!(
                index,
                filename = %outcome.filename,
                status = ?outcome.status,
                secs = outcome.processing_time,
                "document done"
            ),
            DocumentStatus::PartialSuccess | DocumentStatus::Failure => warn!(
                index,
                filename = %outcome.filename,
                status = ?outcome.status,
                errors = outcome.errors.len(),
                "document failed"
            ),
        }
    }

    fn on_task_complete(&self, task_id: &TaskId, succeeded: usize, failed: usize) {
        info!(%task_id, succeeded, failed, "task finished");
    }
}

/// Shared handle type.
pub type ProgressCallback = Arc<dyn TaskProgressCallback>;
