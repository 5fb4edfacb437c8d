//! # edgequake-jobkit
//!
//! Run document-conversion jobs in the background: accept a task, convert
//! every document in it, and hand back exported content, a zip archive,
//! chunks, or files written to a target.
//!
//! ## Why this crate?
//!
//! Conversion engines are heavy. Loading layout models or tokenizers per
//! request wastes seconds, and running conversions on the request path
//! blocks the callers that only want to poll a status. This crate separates
//! *accepting* work from *running* it, keeps engines warm in a bounded
//! cache, and offers two execution backends behind one trait: an in-process
//! worker pool and a durable queue with worker processes.
//!
//! ## Pipeline Overview
//!
//! ```text
//! enqueue(sources, options, target)
//!  │
//!  ├─ 1. Admit    Task{id, PENDING} → registry → queue (in-process or durable)
//!  ├─ 2. Claim    a worker dequeues, task → STARTED
//!  ├─ 3. Engines  converter/chunker from the LRU cache (canonical-hash key)
//!  ├─ 4. Fetch    file / http / object store / local path
//!  ├─ 5. Convert  concurrent, CPU work on the blocking pool
//!  ├─ 6. Export   md / json / html / text / doctags, chunks, zip, upload
//!  └─ 7. Settle   TaskResult stored, task → SUCCESS or FAILURE
//! ```
//!
//! [`reconcile::Reconciler`] computes which objects under a source prefix
//! still lack a converted counterpart and batches them for submission.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_jobkit::{ConvertOptions, LocalOrchestrator, Orchestrator, TaskSource, TaskTarget};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orch = LocalOrchestrator::with_defaults()?;
//!     let runner = orch.clone();
//!     tokio::spawn(async move { runner.process_queue().await });
//!
//!     let task = orch
//!         .enqueue(
//!             vec![TaskSource::Http { url: "https://example.com/notes.md".into(), headers: Default::default() }],
//!             ConvertOptions::default(),
//!             TaskTarget::InBody,
//!         )
//!         .await?;
//!     let task = orch.task_status(&task.task_id, Duration::from_secs(30)).await?;
//!     if let Some(result) = orch.task_result(&task.task_id).await? {
//!         eprintln!("{} converted, {} failed", result.num_succeeded, result.num_failed);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `jobkit` binary (clap + anyhow + tracing-subscriber) |
//! | `redis` | on      | Redis job queue and result store for the durable orchestrator |
//! | `s3`    | off     | S3-compatible object store for sources, targets and reconciliation |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod connectors;
pub mod convert;
pub mod engine;
pub mod error;
pub mod export;
pub mod orchestrator;
pub mod progress;
pub mod reconcile;
pub mod result;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ChunkingOptions, ConvertOptions, ConvertOptionsBuilder, ConverterManagerConfig,
    DurableOrchestratorConfig, InputFormat, LocalOrchestratorConfig, OutputFormat, TableMode,
};
pub use connectors::object_store::{MemoryObjectStoreFactory, ObjectStore, ObjectStoreFactory, PresignedUrl};
pub use connectors::ConnectorContext;
pub use convert::ConverterManager;
pub use engine::{DocumentChunker, DocumentConverter, EngineFactory};
pub use error::{DocumentError, ErrorKind, JobkitError, Result};
pub use orchestrator::durable::DurableOrchestrator;
pub use orchestrator::local::LocalOrchestrator;
pub use orchestrator::Orchestrator;
pub use progress::{ProgressCallback, TaskProgressCallback};
pub use reconcile::{partition, Reconciler, ReconcileSettings};
pub use result::{ChunkItem, DocumentOutcome, DocumentStatus, ResultKind, TaskResult};
pub use task::{ObjectStoreCoordinates, Task, TaskId, TaskSource, TaskStatus, TaskTarget};
