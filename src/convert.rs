//! The task pipeline: fetch, convert, export and deliver every document of
//! one task.
//!
//! ```text
//! TaskPayload
//!   │
//!   ├─ Step 1  validate (no sources, bad options → TaskFailed)
//!   ├─ Step 2  open target + engines (cached by configuration hash)
//!   ├─ Step 3  list document ids of every source
//!   ├─ Step 4  per document, concurrently:
//!   │            fetch → convert (spawn_blocking) → export → chunk → upload
//!   └─ Step 5  assemble the result for the target kind
//! ```
//!
//! A document failing never fails the task; it is recorded in its
//! [`DocumentOutcome`]. Only problems that stop the task from running at all
//! produce [`ResultKind::TaskFailed`].

use crate::config::{ChunkingOptions, ConvertOptions, ConverterManagerConfig};
use crate::connectors::{self, ConnectorContext, DocumentId, SourceProcessor, TargetProcessor};
use crate::engine::cache::EngineCache;
use crate::engine::{cache_key, ConvertedDocument, DocumentChunker, DocumentConverter, EngineFactory};
use crate::error::{DocumentError, JobkitError, Result};
use crate::export::{self, Artifact, StemAllocator, ZipBuilder};
use crate::progress::TaskProgressCallback;
use crate::result::{
    ChunkItem, DocumentOutcome, DocumentStatus, ExportDocument, ExportedContent, ResultKind,
    TaskResult,
};
use crate::task::{TaskPayload, TaskTarget};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Owns the engine caches and runs tasks through them.
///
/// One manager per worker (or one shared by all workers of a process); the
/// caches never cross a process boundary.
pub struct ConverterManager {
    config: ConverterManagerConfig,
    factory: Arc<dyn EngineFactory>,
    connectors: ConnectorContext,
    converters: Arc<EngineCache<dyn DocumentConverter>>,
    chunkers: Arc<EngineCache<dyn DocumentChunker>>,
}

impl std::fmt::Debug for ConverterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterManager")
            .field("config", &self.config)
            .field("converters", &self.converters.len())
            .field("chunkers", &self.chunkers.len())
            .finish()
    }
}

/// Everything produced for one document.
struct DocumentWork {
    index: usize,
    outcome: DocumentOutcome,
    content: ExportedContent,
    artifacts: Vec<Artifact>,
    chunks: Vec<ChunkItem>,
}

impl DocumentWork {
    fn new(index: usize, outcome: DocumentOutcome) -> Self {
        Self {
            index,
            outcome,
            content: ExportedContent::default(),
            artifacts: Vec::new(),
            chunks: Vec::new(),
        }
    }
}

/// Per-task state shared by the document futures.
struct TaskContext<'a> {
    options: &'a ConvertOptions,
    target: &'a TaskTarget,
    sources: &'a [Box<dyn SourceProcessor>],
    uploader: Option<&'a dyn TargetProcessor>,
    converter: Arc<dyn DocumentConverter>,
    chunker: Option<(Arc<dyn DocumentChunker>, ChunkingOptions)>,
    stems: StemAllocator,
    aborted: AtomicBool,
}

impl ConverterManager {
    /// # Errors
    /// [`JobkitError::InvalidConfig`] when `config` is out of range.
    pub fn new(
        config: ConverterManagerConfig,
        factory: Arc<dyn EngineFactory>,
        connectors: ConnectorContext,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            converters: Arc::new(EngineCache::new("converters", config.cache_size)?),
            chunkers: Arc::new(EngineCache::new("chunkers", config.cache_size)?),
            config,
            factory,
            connectors,
        })
    }

    pub fn config(&self) -> &ConverterManagerConfig {
        &self.config
    }

    pub fn connectors(&self) -> &ConnectorContext {
        &self.connectors
    }

    /// Number of cached (converter, chunker) engines.
    pub fn cached_engines(&self) -> (usize, usize) {
        (self.converters.len(), self.chunkers.len())
    }

    /// Return the converter for `options`, building it on first use.
    pub async fn get_converter(&self, options: &ConvertOptions) -> Result<Arc<dyn DocumentConverter>> {
        let engine_options = options.engine_options();
        let key = cache_key(&engine_options)?;
        let cache = Arc::clone(&self.converters);
        let factory = Arc::clone(&self.factory);
        tokio::task::spawn_blocking(move || {
            cache.get_or_create(&key, || factory.build_converter(&engine_options))
        })
        .await
        .map_err(|e| JobkitError::Internal(format!("converter construction panicked: {e}")))?
    }

    /// Return the chunker for `options`, building it on first use.
    pub async fn get_chunker(&self, options: &ChunkingOptions) -> Result<Arc<dyn DocumentChunker>> {
        let resolved = options.resolved(&self.config.default_tokenizer);
        let key = cache_key(&resolved)?;
        let cache = Arc::clone(&self.chunkers);
        let factory = Arc::clone(&self.factory);
        tokio::task::spawn_blocking(move || {
            cache.get_or_create(&key, || factory.build_chunker(&resolved))
        })
        .await
        .map_err(|e| JobkitError::Internal(format!("chunker construction panicked: {e}")))?
    }

    /// Build the engines `options` needs ahead of the first task.
    pub async fn warm_up(&self, options: &ConvertOptions) -> Result<()> {
        self.get_converter(options).await?;
        if let Some(ref chunking) = options.chunking {
            self.get_chunker(chunking).await?;
        }
        info!("engine caches warmed up");
        Ok(())
    }

    /// Drop every cached engine.
    pub fn clear(&self) {
        self.converters.clear();
        self.chunkers.clear();
    }

    /// Run one task to completion. Never returns an error: whole-task
    /// failures are reported as [`ResultKind::TaskFailed`].
    pub async fn process_task(
        &self,
        payload: &TaskPayload,
        progress: &dyn TaskProgressCallback,
    ) -> TaskResult {
        let started = Instant::now();
        progress.on_task_start(&payload.task_id, payload.sources.len());

        let result = match self.run_task(payload, progress, started).await {
            Ok(result) => result,
            Err(e) => {
                warn!(task_id = %payload.task_id, error = %e, "task failed to run");
                TaskResult::task_failed(e.kind(), e.to_string(), started.elapsed().as_secs_f64())
            }
        };
        progress.on_task_complete(&payload.task_id, result.num_succeeded, result.num_failed);
        result
    }

    async fn run_task(
        &self,
        payload: &TaskPayload,
        progress: &dyn TaskProgressCallback,
        started: Instant,
    ) -> Result<TaskResult> {
        let options = &payload.options;

        // ── Step 1: Validate ─────────────────────────────────────────────
        if payload.sources.is_empty() {
            return Err(JobkitError::InvalidConfig("task has no sources".into()));
        }
        options.validate()?;

        // ── Step 2: Target and engines ───────────────────────────────────
        let uploader = connectors::target_processor(&payload.target, &self.connectors)?;
        let converter = self.get_converter(options).await?;
        let chunker = match options.chunking {
            Some(ref chunking) => Some((
                self.get_chunker(chunking).await?,
                chunking.resolved(&self.config.default_tokenizer),
            )),
            None => None,
        };

        // ── Step 3: List documents ───────────────────────────────────────
        let download_timeout = Duration::from_secs(options.download_timeout_secs);
        let sources = payload
            .sources
            .iter()
            .map(|s| connectors::source_processor(s, &self.connectors, download_timeout))
            .collect::<Result<Vec<_>>>()?;

        let mut work: Vec<(usize, DocumentId)> = Vec::new();
        for (source_idx, source) in sources.iter().enumerate() {
            let ids: Vec<DocumentId> = source.list_document_ids().try_collect().await?;
            work.extend(ids.into_iter().map(|id| (source_idx, id)));
        }
        info!(
            task_id = %payload.task_id,
            sources = sources.len(),
            documents = work.len(),
            target = ?payload.target,
            "processing task"
        );

        // ── Step 4: Process documents ────────────────────────────────────
        let ctx = TaskContext {
            options,
            target: &payload.target,
            sources: &sources,
            uploader: uploader.as_deref(),
            converter,
            chunker,
            stems: StemAllocator::new(),
            aborted: AtomicBool::new(false),
        };
        // Skipping "the rest" after a failure is only well defined in order.
        let concurrency = if options.abort_on_error {
            1
        } else {
            self.config.max_concurrent_documents
        };
        let ctx_ref = &ctx;
        let mut docs: Vec<DocumentWork> = stream::iter(work.into_iter().enumerate().map(
            |(index, (source_idx, id))| async move {
                let doc = process_document(ctx_ref, index, source_idx, id).await;
                progress.on_document_complete(index, &doc.outcome);
                doc
            },
        ))
        .buffer_unordered(concurrency)
        .collect()
        .await;
        docs.sort_by_key(|d| d.index);

        // ── Step 5: Assemble ─────────────────────────────────────────────
        let kind = assemble(&payload.target, options, docs)?;
        Ok(TaskResult::from_kind(kind, started.elapsed().as_secs_f64()))
    }
}

/// Fetch, convert, export, chunk and deliver one document.
async fn process_document(
    ctx: &TaskContext<'_>,
    index: usize,
    source_idx: usize,
    id: DocumentId,
) -> DocumentWork {
    if ctx.aborted.load(Ordering::SeqCst) {
        return DocumentWork::new(index, DocumentOutcome::skipped(id.to_string()));
    }
    let started = Instant::now();

    let converted = convert_document(ctx, source_idx, &id).await;
    let doc = match converted {
        Ok(doc) => doc,
        Err(error) => {
            if ctx.options.abort_on_error {
                ctx.aborted.store(true, Ordering::SeqCst);
            }
            let filename = error.document().to_string();
            return DocumentWork::new(
                index,
                DocumentOutcome::failed(filename, error, started.elapsed().as_secs_f64()),
            );
        }
    };

    let mut work = DocumentWork::new(
        index,
        DocumentOutcome {
            filename: doc.name.clone(),
            status: DocumentStatus::Success,
            errors: Vec::new(),
            processing_time: 0.0,
        },
    );

    match export::export_document(&doc, &ctx.options.to_formats) {
        Ok(content) => work.content = content,
        Err(e) => work.outcome.degrade(e),
    }

    if let Some((ref chunker, ref chunking)) = ctx.chunker {
        match chunk_document(chunker, chunking, &doc).await {
            Ok(chunks) => work.chunks = chunks,
            Err(e) => work.outcome.degrade(e),
        }
    }

    if !matches!(ctx.target, TaskTarget::InBody) {
        let stem = ctx.stems.claim(doc.stem());
        match build_artifacts(&doc, &stem, &work) {
            Ok(artifacts) => work.artifacts = artifacts,
            Err(e) => work.outcome.degrade(e),
        }
        if let Some(uploader) = ctx.uploader {
            for artifact in std::mem::take(&mut work.artifacts) {
                if let Err(e) = uploader
                    .upload_object(artifact.bytes, &artifact.path, artifact.content_type)
                    .await
                {
                    work.outcome.degrade(DocumentError::ExportFailed {
                        document: doc.name.clone(),
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    work.outcome.processing_time = started.elapsed().as_secs_f64();
    debug!(document = %doc.name, status = ?work.outcome.status, "document processed");
    work
}

async fn convert_document(
    ctx: &TaskContext<'_>,
    source_idx: usize,
    id: &DocumentId,
) -> std::result::Result<ConvertedDocument, DocumentError> {
    let source = ctx
        .sources
        .get(source_idx)
        .ok_or_else(|| DocumentError::FetchFailed {
            document: id.to_string(),
            detail: "source vanished".into(),
        })?;
    let stream = source
        .fetch_document(id)
        .await
        .map_err(|e| DocumentError::FetchFailed {
            document: id.to_string(),
            detail: e.to_string(),
        })?;

    let name = stream.name.clone();
    let converter = Arc::clone(&ctx.converter);
    let handle = tokio::task::spawn_blocking(move || converter.convert(&stream));
    let joined = match ctx.options.document_timeout_secs {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), handle)
            .await
            .map_err(|_| DocumentError::Timeout {
                document: name.clone(),
                secs,
            })?,
        None => handle.await,
    };
    joined.map_err(|e| DocumentError::ConversionFailed {
        document: name,
        detail: format!("conversion panicked: {e}"),
    })?
}

async fn chunk_document(
    chunker: &Arc<dyn DocumentChunker>,
    options: &ChunkingOptions,
    doc: &ConvertedDocument,
) -> std::result::Result<Vec<ChunkItem>, DocumentError> {
    let chunker = Arc::clone(chunker);
    let owned = doc.clone();
    let chunks = tokio::task::spawn_blocking(move || chunker.chunk(&owned))
        .await
        .map_err(|e| DocumentError::ChunkingFailed {
            document: doc.name.clone(),
            detail: format!("chunking panicked: {e}"),
        })??;

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(chunk_index, chunk)| {
            let contextualized_text = if chunk.headings.is_empty() {
                chunk.text.clone()
            } else {
                format!("{}\n{}", chunk.headings.join("\n"), chunk.text)
            };
            ChunkItem {
                filename: doc.name.clone(),
                chunk_index,
                contextualized_text,
                raw_text: options.include_raw_text.then_some(chunk.text),
                headings: chunk.headings,
                page_numbers: chunk.page_numbers,
                num_tokens: chunk.num_tokens,
            }
        })
        .collect())
}

fn build_artifacts(
    doc: &ConvertedDocument,
    stem: &str,
    work: &DocumentWork,
) -> std::result::Result<Vec<Artifact>, DocumentError> {
    let mut out = export::artifacts(doc, stem, &work.content)?;
    if !work.chunks.is_empty() {
        out.push(export::chunk_artifact(&doc.name, stem, &work.chunks)?);
    }
    Ok(out)
}

fn assemble(
    target: &TaskTarget,
    options: &ConvertOptions,
    mut docs: Vec<DocumentWork>,
) -> Result<ResultKind> {
    Ok(match target {
        TaskTarget::InBody if options.chunking.is_some() => {
            let mut chunks = Vec::new();
            let mut documents = Vec::with_capacity(docs.len());
            for doc in docs {
                chunks.extend(doc.chunks);
                documents.push(doc.outcome);
            }
            ResultKind::Chunked { chunks, documents }
        }
        TaskTarget::InBody => ResultKind::Export {
            documents: docs
                .into_iter()
                .map(|d| ExportDocument {
                    outcome: d.outcome,
                    content: d.content,
                })
                .collect(),
        },
        TaskTarget::Zip => {
            let mut zip = ZipBuilder::new();
            for doc in &mut docs {
                for artifact in std::mem::take(&mut doc.artifacts) {
                    if let Err(e) = zip.add(&artifact) {
                        doc.outcome.degrade(DocumentError::ExportFailed {
                            document: doc.outcome.filename.clone(),
                            detail: e.to_string(),
                        });
                    }
                }
            }
            debug!(entries = zip.len(), "zip archive built");
            ResultKind::Zip {
                content: zip.finish()?,
                documents: docs.into_iter().map(|d| d.outcome).collect(),
            }
        }
        TaskTarget::ObjectStore { .. } | TaskTarget::LocalPath { .. } => ResultKind::RemoteTarget {
            documents: docs.into_iter().map(|d| d.outcome).collect(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InputFormat, OutputFormat};
    use crate::error::ErrorKind;
    use crate::engine::text::TextEngineFactory;
    use crate::progress::NoopProgressCallback;
    use crate::task::{TaskId, TaskSource};
    use std::sync::atomic::AtomicUsize;

    fn manager() -> ConverterManager {
        ConverterManager::new(
            ConverterManagerConfig::default(),
            Arc::new(TextEngineFactory::new()),
            ConnectorContext::default(),
        )
        .unwrap()
    }

    fn file(name: &str, text: &str) -> TaskSource {
        TaskSource::File {
            content: text.as_bytes().to_vec(),
            filename: name.into(),
        }
    }

    fn payload(sources: Vec<TaskSource>, options: ConvertOptions, target: TaskTarget) -> TaskPayload {
        TaskPayload {
            task_id: TaskId::new(),
            sources,
            options,
            target,
        }
    }

    #[tokio::test]
    async fn in_body_export_per_document() {
        let cm = manager();
        let p = payload(
            vec![file("a.md", "# A\n\nbody"), file("b.pdf", "%PDF-1.7")],
            ConvertOptions::default(),
            TaskTarget::InBody,
        );
        let result = cm.process_task(&p, &NoopProgressCallback).await;

        let ResultKind::Export { ref documents } = result.result else {
            panic!("expected export, got {:?}", result.result);
        };
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].outcome.status, DocumentStatus::Success);
        assert!(documents[0].content.md_content.as_deref().unwrap().starts_with("# A"));
        assert_eq!(documents[1].outcome.status, DocumentStatus::Failure);
        assert!(matches!(
            documents[1].outcome.errors[0],
            DocumentError::UnsupportedFormat { .. }
        ));
        assert_eq!((result.num_succeeded, result.num_failed), (1, 1));
    }

    #[tokio::test]
    async fn empty_sources_fail_the_task() {
        let cm = manager();
        let p = payload(vec![], ConvertOptions::default(), TaskTarget::InBody);
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        assert!(matches!(
            result.result,
            ResultKind::TaskFailed {
                error_kind: ErrorKind::Validation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn abort_on_error_skips_the_rest() {
        let cm = manager();
        let options = ConvertOptions::builder().abort_on_error(true).build().unwrap();
        let p = payload(
            vec![file("bad.pdf", "%PDF"), file("a.md", "x"), file("b.md", "y")],
            options,
            TaskTarget::InBody,
        );
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        let statuses: Vec<DocumentStatus> = result.documents().iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            [DocumentStatus::Failure, DocumentStatus::Skipped, DocumentStatus::Skipped]
        );
        assert_eq!(result.num_converted, 1);
    }

    #[tokio::test]
    async fn chunked_in_body_result() {
        let cm = manager();
        let options = ConvertOptions::builder()
            .chunking(ChunkingOptions::default())
            .build()
            .unwrap();
        let p = payload(
            vec![file("guide.md", "# Guide\n\n## Setup\n\nInstall it.\n\n## Use\n\nRun it.")],
            options,
            TaskTarget::InBody,
        );
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        let ResultKind::Chunked { ref chunks, .. } = result.result else {
            panic!("expected chunks, got {:?}", result.result);
        };
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].headings, ["Guide", "Setup"]);
        assert_eq!(chunks[0].contextualized_text, "Guide\nSetup\nInstall it.");
        assert_eq!(chunks[0].raw_text.as_deref(), Some("Install it."));
        assert_eq!(chunks[1].chunk_index, 1);
    }

    #[tokio::test]
    async fn zip_target_packs_artifacts() {
        let cm = manager();
        let options = ConvertOptions::builder()
            .to_formats([OutputFormat::Md, OutputFormat::Json])
            .build()
            .unwrap();
        let p = payload(vec![file("notes.txt", "hello")], options, TaskTarget::Zip);
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        let ResultKind::Zip { ref content, .. } = result.result else {
            panic!("expected zip, got {:?}", result.result);
        };
        let archive = zip::ZipArchive::new(std::io::Cursor::new(content.clone())).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["json/notes.json", "md/notes.md"]);
    }

    #[tokio::test]
    async fn zip_keeps_documents_sharing_a_stem() {
        let cm = manager();
        let p = payload(
            vec![
                file("report.md", "# From markdown"),
                file("report.txt", "from text"),
                file("summary.md", "# Summary"),
            ],
            ConvertOptions::default(),
            TaskTarget::Zip,
        );
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        let ResultKind::Zip { ref content, ref documents } = result.result else {
            panic!("expected zip, got {:?}", result.result);
        };
        assert!(documents.iter().all(|d| d.status == DocumentStatus::Success));
        assert_eq!((result.num_succeeded, result.num_failed), (3, 0));

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(content.clone())).unwrap();
        let mut names: Vec<String> = archive.file_names().map(String::from).collect();
        names.sort_unstable();
        assert_eq!(names, ["md/report.md", "md/report_1.md", "md/summary.md"]);

        let mut bodies = Vec::new();
        for name in ["md/report.md", "md/report_1.md"] {
            let mut body = String::new();
            std::io::Read::read_to_string(&mut archive.by_name(name).unwrap(), &mut body).unwrap();
            bodies.push(body);
        }
        bodies.sort_unstable();
        assert!(bodies[0].starts_with("# From markdown"));
        assert!(bodies[1].contains("from text"));
    }

    #[tokio::test]
    async fn local_path_target_keeps_documents_sharing_a_stem() {
        let dir = tempfile::tempdir().unwrap();
        let cm = manager();
        let p = payload(
            vec![file("a.md", "# One"), file("a.txt", "two")],
            ConvertOptions::default(),
            TaskTarget::LocalPath {
                path: dir.path().to_path_buf(),
            },
        );
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        assert_eq!(result.num_succeeded, 2);
        assert!(dir.path().join("md/a.md").is_file());
        assert!(dir.path().join("md/a_1.md").is_file());
    }

    #[tokio::test]
    async fn local_path_target_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let cm = manager();
        let p = payload(
            vec![file("a.md", "# A")],
            ConvertOptions::default(),
            TaskTarget::LocalPath {
                path: dir.path().to_path_buf(),
            },
        );
        let result = cm.process_task(&p, &NoopProgressCallback).await;
        assert!(matches!(result.result, ResultKind::RemoteTarget { .. }));
        let md = std::fs::read_to_string(dir.path().join("md/a.md")).unwrap();
        assert!(md.starts_with("# A"));
    }

    #[tokio::test]
    async fn engines_are_reused_across_tasks() {
        let cm = manager();
        let options = ConvertOptions::builder()
            .from_formats([InputFormat::Md])
            .build()
            .unwrap();
        for _ in 0..3 {
            let p = payload(vec![file("a.md", "x")], options.clone(), TaskTarget::InBody);
            cm.process_task(&p, &NoopProgressCallback).await;
        }
        assert_eq!(cm.cached_engines(), (1, 0));
        cm.clear();
        assert_eq!(cm.cached_engines(), (0, 0));
    }

    #[tokio::test]
    async fn progress_sees_every_document() {
        struct Count(AtomicUsize);
        impl TaskProgressCallback for Count {
            fn on_document_complete(&self, _index: usize, _outcome: &DocumentOutcome) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let cm = manager();
        let p = payload(
            vec![file("a.md", "x"), file("b.md", "y"), file("c.md", "z")],
            ConvertOptions::default(),
            TaskTarget::InBody,
        );
        let count = Count(AtomicUsize::new(0));
        cm.process_task(&p, &count).await;
        assert_eq!(count.0.load(Ordering::SeqCst), 3);
    }
}
