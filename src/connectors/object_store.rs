//! Minimal object-store contract: paginated listing, get, put, pre-signed GET.
//!
//! The S3 implementation lives in [`super::s3`] (feature `s3`).
//! [`MemoryObjectStore`] backs tests and local experiments.

use super::{DocumentId, SourceProcessor, TargetProcessor};
use crate::engine::DocumentStream;
use crate::error::{JobkitError, Result};
use crate::task::ObjectStoreCoordinates;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Default page size requested from listings.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub keys: Vec<ObjectKey>,
    /// Token for the next page; `None` when the listing is exhausted.
    pub next: Option<String>,
}

/// A time-limited retrieval URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl PresignedUrl {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Operations this crate needs from an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix`, one page at a time.
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> Result<ListPage>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Create a URL that allows fetching `key` without credentials until it
    /// expires.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<PresignedUrl>;
}

/// Opens stores for coordinates.
pub trait ObjectStoreFactory: Send + Sync {
    fn open(&self, coordinates: &ObjectStoreCoordinates) -> Result<Arc<dyn ObjectStore>>;
}

/// Lazily list every key under `prefix`, following continuation tokens.
pub fn list_keys<'a>(
    store: &'a dyn ObjectStore,
    prefix: &'a str,
    page_size: usize,
) -> BoxStream<'a, Result<ObjectKey>> {
    // State: None = finished, Some(token) = next page to request.
    stream::try_unfold(Some(None::<String>), move |state| async move {
        let Some(token) = state else {
            return Ok::<_, JobkitError>(None);
        };
        let page = store.list_page(prefix, token, page_size).await?;
        Ok(Some((page.keys, page.next.map(Some))))
    })
    .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<ObjectKey, JobkitError>)))
    .try_flatten()
    .boxed()
}

/// Collect every key under `prefix`.
pub async fn list_all_keys(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<ObjectKey>> {
    list_keys(store, prefix, DEFAULT_PAGE_SIZE).try_collect().await
}

/// The factory used when none is supplied: S3 when compiled in.
pub fn default_factory() -> Arc<dyn ObjectStoreFactory> {
    #[cfg(feature = "s3")]
    {
        Arc::new(super::s3::S3ObjectStoreFactory)
    }
    #[cfg(not(feature = "s3"))]
    {
        Arc::new(UnavailableFactory)
    }
}

#[cfg(not(feature = "s3"))]
struct UnavailableFactory;

#[cfg(not(feature = "s3"))]
impl ObjectStoreFactory for UnavailableFactory {
    fn open(&self, coordinates: &ObjectStoreCoordinates) -> Result<Arc<dyn ObjectStore>> {
        Err(JobkitError::InvalidCoordinates {
            detail: format!(
                "no object store backend for '{}' (build with feature \"s3\")",
                coordinates.endpoint
            ),
        })
    }
}

// ── Source and target processors ─────────────────────────────────────────

/// Serves one object, or every object under a prefix.
pub struct ObjectStoreSourceProcessor {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    key: Option<String>,
}

impl ObjectStoreSourceProcessor {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: String, key: Option<String>) -> Self {
        Self { store, prefix, key }
    }
}

#[async_trait]
impl SourceProcessor for ObjectStoreSourceProcessor {
    fn list_document_ids(&self) -> BoxStream<'_, Result<DocumentId>> {
        if let Some(ref key) = self.key {
            let full = format!("{}{}", self.prefix, key.trim_start_matches('/'));
            return stream::once(async move { Ok(DocumentId(full)) }).boxed();
        }
        list_keys(self.store.as_ref(), &self.prefix, DEFAULT_PAGE_SIZE)
            .try_filter(|k| std::future::ready(!k.key.ends_with('/')))
            .map_ok(|k| DocumentId(k.key))
            .boxed()
    }

    async fn fetch_document(&self, id: &DocumentId) -> Result<DocumentStream> {
        let bytes = self.store.get_object(&id.0).await?;
        let name = id.0.rsplit('/').next().unwrap_or(&id.0).to_string();
        Ok(DocumentStream { name, bytes })
    }
}

/// Uploads exported files under a prefix.
pub struct ObjectStoreTargetProcessor {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreTargetProcessor {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: String) -> Self {
        Self { store, prefix }
    }
}

#[async_trait]
impl TargetProcessor for ObjectStoreTargetProcessor {
    async fn upload_object(
        &self,
        content: Vec<u8>,
        target_filename: &str,
        content_type: &str,
    ) -> Result<()> {
        let key = format!("{}{}", self.prefix, target_filename.trim_start_matches('/'));
        self.store.put_object(&key, content, content_type).await
    }
}

// ── In-memory store ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    last_modified: DateTime<Utc>,
}

/// An object store held in memory, with S3-like ordered, paginated listing.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    page_size: usize,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            page_size: DEFAULT_PAGE_SIZE,
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Cap pages at `page_size` keys regardless of what callers request.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.objects.write().insert(
            key.into(),
            StoredObject {
                body: body.into(),
                content_type: "application/octet-stream".to_string(),
                last_modified: Utc::now(),
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|o| o.content_type.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let limit = max_keys.clamp(1, self.page_size);
        let objects = self.objects.read();
        let mut keys: Vec<ObjectKey> = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .filter(|(k, _)| continuation.as_deref().is_none_or(|after| k.as_str() > after))
            .take(limit + 1)
            .map(|(k, o)| ObjectKey {
                key: k.clone(),
                size: Some(o.body.len() as u64),
                last_modified: Some(o.last_modified),
            })
            .collect();
        let next = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().map(|k| k.key.clone())
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| JobkitError::DocumentNotFound { id: key.to_string() })
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<PresignedUrl> {
        if !self.objects.read().contains_key(key) {
            return Err(JobkitError::DocumentNotFound { id: key.to_string() });
        }
        let expires_at = Utc::now()
            + chrono::Duration::from_std(expires_in)
                .map_err(|e| JobkitError::InvalidConfig(format!("presign expiry: {e}")))?;
        Ok(PresignedUrl {
            key: key.to_string(),
            url: format!(
                "memory://{}/{}?expires={}",
                self.bucket,
                key,
                expires_at.timestamp()
            ),
            expires_at,
        })
    }
}

/// Maps buckets to shared [`MemoryObjectStore`]s.
#[derive(Debug, Default)]
pub struct MemoryObjectStoreFactory {
    stores: RwLock<HashMap<String, Arc<MemoryObjectStore>>>,
}

impl MemoryObjectStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store for `bucket`, created on first use.
    pub fn bucket(&self, bucket: &str) -> Arc<MemoryObjectStore> {
        Arc::clone(
            self.stores
                .write()
                .entry(bucket.to_string())
                .or_insert_with(|| Arc::new(MemoryObjectStore::new(bucket))),
        )
    }
}

impl ObjectStoreFactory for MemoryObjectStoreFactory {
    fn open(&self, coordinates: &ObjectStoreCoordinates) -> Result<Arc<dyn ObjectStore>> {
        let store: Arc<dyn ObjectStore> = self.bucket(&coordinates.bucket);
        Ok(store)
    }
}
