//! Local filesystem source and target.

use super::{DocumentId, SourceProcessor, TargetProcessor};
use crate::engine::DocumentStream;
use crate::error::{JobkitError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use glob::Pattern;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Enumerates a single file, or the files under a directory whose name (or
/// relative path, for patterns containing `/`) matches a glob pattern.
///
/// The directory walk runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct LocalPathSourceProcessor {
    root: PathBuf,
    pattern: Pattern,
    recursive: bool,
}

impl LocalPathSourceProcessor {
    pub fn new(root: PathBuf, pattern: &str, recursive: bool) -> Result<Self> {
        let pattern = Pattern::new(pattern).map_err(|e| {
            JobkitError::InvalidConfig(format!("invalid glob pattern '{pattern}': {e}"))
        })?;
        Ok(Self {
            root,
            pattern,
            recursive,
        })
    }

    fn matches(&self, relative: &Path) -> bool {
        if self.pattern.as_str().contains('/') {
            return self.pattern.matches_path(relative);
        }
        relative
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| self.pattern.matches(name))
    }

    fn walk(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(JobkitError::SourceNotFound {
                path: self.root.clone(),
            });
        }
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
                JobkitError::io(path, source)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            if self.matches(relative) {
                files.push(entry.into_path());
            }
        }
        debug!(
            "Found {} files under {} matching '{}'",
            files.len(),
            self.root.display(),
            self.pattern
        );
        Ok(files)
    }
}

#[async_trait]
impl SourceProcessor for LocalPathSourceProcessor {
    fn list_document_ids(&self) -> BoxStream<'_, Result<DocumentId>> {
        let walker = self.clone();
        stream::once(async move {
            let files = tokio::task::spawn_blocking(move || walker.walk())
                .await
                .map_err(|e| JobkitError::Internal(format!("directory walk panicked: {e}")))??;
            Ok::<_, JobkitError>(stream::iter(files.into_iter().map(|p| {
                Ok::<_, JobkitError>(DocumentId(p.to_string_lossy().into_owned()))
            })))
        })
        .try_flatten()
        .boxed()
    }

    async fn fetch_document(&self, id: &DocumentId) -> Result<DocumentStream> {
        let path = PathBuf::from(&id.0);
        let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => JobkitError::DocumentNotFound { id: id.0.clone() },
            _ => JobkitError::io(&path, e),
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| id.0.clone());
        Ok(DocumentStream { name, bytes })
    }
}

/// Writes exported files under a local directory.
#[derive(Debug)]
pub struct LocalPathTargetProcessor {
    root: PathBuf,
}

impl LocalPathTargetProcessor {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve `target_filename` under the root, refusing paths that escape it.
    fn resolve(&self, target_filename: &str) -> Result<PathBuf> {
        let relative = Path::new(target_filename);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || target_filename.is_empty() {
            return Err(JobkitError::InvalidConfig(format!(
                "target filename '{target_filename}' must be a relative path inside the target"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl TargetProcessor for LocalPathTargetProcessor {
    async fn upload_object(
        &self,
        content: Vec<u8>,
        target_filename: &str,
        _content_type: &str,
    ) -> Result<()> {
        let path = self.resolve(target_filename)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| JobkitError::io(parent, e))?;
        }

        // Atomic write: write to temp, then rename
        let tmp_path = path.with_extension("part");
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|e| JobkitError::io(&tmp_path, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| JobkitError::io(&path, e))?;
        Ok(())
    }
}
