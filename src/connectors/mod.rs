//! Source and target connectors.
//!
//! Each [`TaskSource`] variant has a [`SourceProcessor`] that enumerates and
//! fetches its documents; each remote [`TaskTarget`] variant has a
//! [`TargetProcessor`] that stores exported files. [`source_processor`] and
//! [`target_processor`] are exhaustive matches over the variants, so adding a
//! connector kind is a compile error until every dispatcher handles it.
//!
//! Processors own their resources (HTTP clients, object-store handles) and
//! release them on drop, whichever way the task ends.

pub mod file;
pub mod http;
pub mod local_path;
pub mod object_store;
#[cfg(feature = "s3")]
pub mod s3;

use crate::engine::DocumentStream;
use crate::error::{JobkitError, Result};
use crate::task::{TaskSource, TaskTarget};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use object_store::ObjectStoreFactory;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Opaque identifier of a document within one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub String);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A contiguous slice of a source's document ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    /// 0-based position of this chunk in the enumeration.
    pub index: usize,
    pub ids: Vec<DocumentId>,
}

/// Enumerates and fetches the documents of one source.
#[async_trait]
pub trait SourceProcessor: Send + Sync {
    /// Number of documents the source currently holds.
    async fn count_documents(&self) -> Result<usize> {
        self.list_document_ids()
            .try_fold(0usize, |n, _| async move { Ok(n + 1) })
            .await
    }

    /// Lazily enumerate document ids. Each call starts from scratch.
    fn list_document_ids(&self) -> BoxStream<'_, Result<DocumentId>>;

    /// Fetch one document's bytes and name.
    async fn fetch_document(&self, id: &DocumentId) -> Result<DocumentStream>;

    /// Lazily fetch every document in enumeration order.
    fn iterate_documents(&self) -> BoxStream<'_, Result<DocumentStream>> {
        self.list_document_ids()
            .and_then(move |id| async move { self.fetch_document(&id).await })
            .boxed()
    }

    /// Enumerate ids in chunks of `chunk_size`, for fanning work out.
    fn iterate_document_chunks(&self, chunk_size: usize) -> BoxStream<'_, Result<DocumentChunk>> {
        if chunk_size == 0 {
            return stream::once(async {
                Err::<DocumentChunk, _>(JobkitError::InvalidConfig(
                    "chunk_size must be ≥ 1".into(),
                ))
            })
            .boxed();
        }
        self.list_document_ids()
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, ids)| -> Result<DocumentChunk> {
                let ids = ids.into_iter().collect::<Result<Vec<_>>>()?;
                Ok(DocumentChunk { index, ids })
            })
            .boxed()
    }
}

/// Stores exported files for one target.
#[async_trait]
pub trait TargetProcessor: Send + Sync {
    /// Store `content` under `target_filename` relative to the target root.
    async fn upload_object(
        &self,
        content: Vec<u8>,
        target_filename: &str,
        content_type: &str,
    ) -> Result<()>;

    /// Store the file at `source_path` under `target_filename`.
    async fn upload_file(
        &self,
        source_path: &Path,
        target_filename: &str,
        content_type: &str,
    ) -> Result<()> {
        let content = tokio::fs::read(source_path)
            .await
            .map_err(|e| JobkitError::io(source_path, e))?;
        self.upload_object(content, target_filename, content_type).await
    }
}

/// Shared dependencies for building processors.
#[derive(Clone)]
pub struct ConnectorContext {
    pub object_stores: Arc<dyn ObjectStoreFactory>,
}

impl fmt::Debug for ConnectorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectorContext")
            .field("object_stores", &"<dyn ObjectStoreFactory>")
            .finish()
    }
}

impl Default for ConnectorContext {
    fn default() -> Self {
        Self {
            object_stores: object_store::default_factory(),
        }
    }
}

impl ConnectorContext {
    pub fn new(object_stores: Arc<dyn ObjectStoreFactory>) -> Self {
        Self { object_stores }
    }
}

/// Build the processor for a source.
pub fn source_processor(
    source: &TaskSource,
    ctx: &ConnectorContext,
    download_timeout: Duration,
) -> Result<Box<dyn SourceProcessor>> {
    Ok(match source {
        TaskSource::File { content, filename } => {
            Box::new(file::FileSourceProcessor::new(filename.clone(), content.clone()))
        }
        TaskSource::Http { url, headers } => Box::new(http::HttpSourceProcessor::new(
            url.clone(),
            headers.clone(),
            download_timeout,
        )?),
        TaskSource::ObjectStore { coordinates, key } => {
            coordinates.validate()?;
            let store = ctx.object_stores.open(coordinates)?;
            Box::new(object_store::ObjectStoreSourceProcessor::new(
                store,
                coordinates.listing_prefix(),
                key.clone(),
            ))
        }
        TaskSource::LocalPath {
            path,
            pattern,
            recursive,
        } => Box::new(local_path::LocalPathSourceProcessor::new(
            path.clone(),
            pattern,
            *recursive,
        )?),
    })
}

/// Build the processor for a target. In-band targets (`InBody`, `Zip`)
/// have none.
pub fn target_processor(
    target: &TaskTarget,
    ctx: &ConnectorContext,
) -> Result<Option<Box<dyn TargetProcessor>>> {
    Ok(match target {
        TaskTarget::InBody | TaskTarget::Zip => None,
        TaskTarget::ObjectStore { coordinates } => {
            coordinates.validate()?;
            let store = ctx.object_stores.open(coordinates)?;
            Some(Box::new(object_store::ObjectStoreTargetProcessor::new(
                store,
                coordinates.listing_prefix(),
            )))
        }
        TaskTarget::LocalPath { path } => {
            Some(Box::new(local_path::LocalPathTargetProcessor::new(path.clone())))
        }
    })
}
