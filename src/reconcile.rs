//! Incremental work computation against an object-store target.
//!
//! ```text
//! source  {prefix}/a.pdf  {prefix}/b.pdf  {prefix}/c.pdf
//!            │ strip prefix + ".pdf"
//!            ▼
//!            a              b              c          ──┐
//!                                                      ├─ set difference → [b, c]
//! target  {target_prefix}/json/a.json                   │
//!            │ strip prefix + ".json"                   │
//!            ▼                                          │
//!            a                                        ──┘
//!
//! pending keys ──▶ (optional pre-signed URLs) ──▶ batches of K
//! ```
//!
//! Listings are paginated and may lag behind recent writes; reconciliation
//! is a best-effort snapshot, and a document converted twice is harmless.
//!
//! Ids keep whatever sits between the prefix and the extension, sub-directories
//! included. Exported files are named by stem alone (`json/{stem}.json`), so a
//! source nested below the prefix (`{prefix}/sub/a.pdf` → `sub/a`) never finds
//! its output (`json/a.json` → `a`) and stays pending on every run. Keep
//! sources flat under the prefix, or point the reconciler at each
//! sub-directory as its own prefix.

use crate::connectors::object_store::{list_all_keys, ObjectStore, PresignedUrl};
use crate::connectors::ConnectorContext;
use crate::error::{JobkitError, Result};
use crate::task::ObjectStoreCoordinates;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Pre-signed URLs are valid for one hour unless configured otherwise.
pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);

/// Concurrent pre-sign requests.
const PRESIGN_CONCURRENCY: usize = 16;

/// Naming conventions shared by sources and converted outputs.
///
/// Matching is by relative key: only flat source layouts line up with the
/// flat `{converted_dir}/{stem}{converted_extension}` output layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Extension stripped from source keys. Default: `.pdf`.
    pub source_extension: String,
    /// Directory under the target prefix holding converted documents.
    /// Default: `json`.
    pub converted_dir: String,
    /// Extension stripped from converted keys. Default: `.json`.
    pub converted_extension: String,
    /// Lifetime of pre-signed URLs. Default: 3600 s.
    pub presign_expiry: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            source_extension: ".pdf".to_string(),
            converted_dir: "json".to_string(),
            converted_extension: ".json".to_string(),
            presign_expiry: DEFAULT_PRESIGN_EXPIRY,
        }
    }
}

/// Reduce a key to the id used for source/target comparison.
///
/// Strips `prefix` when present at the start and `extension` when present
/// at the end; anything else, including sub-directories, is kept verbatim.
pub fn canonical_id<'a>(key: &'a str, prefix: &str, extension: &str) -> &'a str {
    let key = key.strip_prefix(prefix).unwrap_or(key);
    key.strip_suffix(extension).unwrap_or(key)
}

/// Split `items` into consecutive batches of `batch_size`; the last batch
/// holds the remainder.
///
/// # Errors
/// [`JobkitError::InvalidConfig`] if `batch_size` is zero.
pub fn partition<T>(items: Vec<T>, batch_size: usize) -> Result<Vec<Vec<T>>> {
    check_batch_size(batch_size)?;
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    Ok(batches)
}

fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(JobkitError::InvalidConfig("batch_size must be ≥ 1".into()));
    }
    Ok(())
}

/// Computes which source documents lack a converted counterpart.
pub struct Reconciler {
    source_store: Arc<dyn ObjectStore>,
    source: ObjectStoreCoordinates,
    target_store: Arc<dyn ObjectStore>,
    target: ObjectStoreCoordinates,
    settings: ReconcileSettings,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("source", &self.source)
            .field("target", &self.target)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Reconciler {
    /// # Errors
    /// [`JobkitError::InvalidCoordinates`] for malformed coordinates, and
    /// [`JobkitError::InvalidConfig`] when source and target resolve to the
    /// same location.
    pub fn new(
        source_store: Arc<dyn ObjectStore>,
        source: ObjectStoreCoordinates,
        target_store: Arc<dyn ObjectStore>,
        target: ObjectStoreCoordinates,
    ) -> Result<Self> {
        source.validate()?;
        target.validate()?;
        if source.same_location(&target) {
            return Err(JobkitError::InvalidConfig(format!(
                "source and target point to the same location ({}/{})",
                source.bucket, source.key_prefix
            )));
        }
        Ok(Self {
            source_store,
            source,
            target_store,
            target,
            settings: ReconcileSettings::default(),
        })
    }

    /// Open both stores through the context's factory.
    pub fn from_context(
        ctx: &ConnectorContext,
        source: ObjectStoreCoordinates,
        target: ObjectStoreCoordinates,
    ) -> Result<Self> {
        let source_store = ctx.object_stores.open(&source)?;
        let target_store = ctx.object_stores.open(&target)?;
        Self::new(source_store, source, target_store, target)
    }

    pub fn with_settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    /// `"{prefix}/"`, or empty for a bucket root.
    pub fn source_prefix(&self) -> String {
        self.source.listing_prefix()
    }

    /// `"{target_prefix}/{converted_dir}/"`.
    pub fn converted_prefix(&self) -> String {
        format!("{}{}/", self.target.listing_prefix(), self.settings.converted_dir)
    }

    /// Source keys without a converted counterpart, in listing order.
    pub async fn pending_keys(&self) -> Result<Vec<String>> {
        let source_prefix = self.source_prefix();
        let source_keys: Vec<String> = list_all_keys(self.source_store.as_ref(), &source_prefix)
            .await?
            .into_iter()
            .map(|k| k.key)
            .filter(|k| !k.ends_with('/'))
            .collect();
        if source_keys.is_empty() {
            info!(prefix = %source_prefix, "source is empty, nothing to reconcile");
            return Ok(Vec::new());
        }

        let converted_prefix = self.converted_prefix();
        let target_keys = list_all_keys(self.target_store.as_ref(), &converted_prefix).await?;
        if target_keys.is_empty() {
            info!(
                sources = source_keys.len(),
                "target has no converted documents, every source is pending"
            );
            return Ok(source_keys);
        }

        let converted: HashSet<&str> = target_keys
            .iter()
            .map(|k| canonical_id(&k.key, &converted_prefix, &self.settings.converted_extension))
            .collect();
        let total = source_keys.len();
        let pending: Vec<String> = source_keys
            .into_iter()
            .filter(|key| {
                let id = canonical_id(key, &source_prefix, &self.settings.source_extension);
                !converted.contains(id)
            })
            .collect();
        info!(
            total,
            converted = converted.len(),
            pending = pending.len(),
            "reconciled source against target"
        );
        Ok(pending)
    }

    /// Pending keys partitioned into batches of `batch_size`.
    pub async fn pending_batches(&self, batch_size: usize) -> Result<Vec<Vec<String>>> {
        check_batch_size(batch_size)?;
        partition(self.pending_keys().await?, batch_size)
    }

    /// Pending keys as freshly pre-signed URLs, partitioned into batches.
    ///
    /// URLs carry their expiry; they are generated on every call and must
    /// not be stored past [`PresignedUrl::expires_at`].
    pub async fn presigned_batches(&self, batch_size: usize) -> Result<Vec<Vec<PresignedUrl>>> {
        check_batch_size(batch_size)?;
        let keys = self.pending_keys().await?;
        let expiry = self.settings.presign_expiry;
        let store = self.source_store.as_ref();
        let urls: Vec<PresignedUrl> = stream::iter(keys)
            .map(|key| async move { store.presign_get(&key, expiry).await })
            .buffered(PRESIGN_CONCURRENCY)
            .try_collect()
            .await?;
        debug!(urls = urls.len(), expiry_secs = expiry.as_secs(), "pre-signed pending keys");
        partition(urls, batch_size)
    }
}
