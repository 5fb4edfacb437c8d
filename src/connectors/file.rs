//! Inline file source: the document bytes travel with the task.

use super::{DocumentId, SourceProcessor};
use crate::engine::DocumentStream;
use crate::error::{JobkitError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Serves the single document embedded in a `File` source.
#[derive(Debug)]
pub struct FileSourceProcessor {
    filename: String,
    content: Vec<u8>,
}

impl FileSourceProcessor {
    pub fn new(filename: String, content: Vec<u8>) -> Self {
        Self { filename, content }
    }
}

#[async_trait]
impl SourceProcessor for FileSourceProcessor {
    async fn count_documents(&self) -> Result<usize> {
        Ok(1)
    }

    fn list_document_ids(&self) -> BoxStream<'_, Result<DocumentId>> {
        stream::once(async move { Ok(DocumentId(self.filename.clone())) }).boxed()
    }

    async fn fetch_document(&self, id: &DocumentId) -> Result<DocumentStream> {
        if id.0 != self.filename {
            return Err(JobkitError::DocumentNotFound { id: id.0.clone() });
        }
        Ok(DocumentStream {
            name: self.filename.clone(),
            bytes: self.content.clone(),
        })
    }
}
