//! S3-compatible object store backed by `aws-sdk-s3`.
//!
//! Clients are built per coordinates with static credentials and path-style
//! addressing, so MinIO and other S3-compatible endpoints work unchanged.

use super::object_store::{ListPage, ObjectKey, ObjectStore, ObjectStoreFactory, PresignedUrl};
use crate::error::{JobkitError, Result};
use crate::task::ObjectStoreCoordinates;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_REGION: &str = "us-east-1";

/// Opens an [`S3ObjectStore`] for each set of coordinates.
#[derive(Debug, Default, Clone, Copy)]
pub struct S3ObjectStoreFactory;

impl ObjectStoreFactory for S3ObjectStoreFactory {
    fn open(&self, coordinates: &ObjectStoreCoordinates) -> Result<Arc<dyn ObjectStore>> {
        coordinates.validate()?;
        Ok(Arc::new(S3ObjectStore::new(coordinates)))
    }
}

/// One bucket on an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(coordinates: &ObjectStoreCoordinates) -> Self {
        let credentials = Credentials::new(
            coordinates.access_key.clone(),
            coordinates.secret_key.clone(),
            None,
            None,
            "edgequake-jobkit",
        );
        let region = coordinates
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .endpoint_url(coordinates.endpoint_url())
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: coordinates.bucket.clone(),
        }
    }
}

fn map_sdk_error(
    operation: &'static str,
    key: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> JobkitError {
    JobkitError::ObjectStore {
        operation,
        key: key.to_string(),
        detail: aws_sdk_s3::error::DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(i32::try_from(max_keys).unwrap_or(i32::MAX))
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| map_sdk_error("list", prefix, e))?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|obj| {
                let key = obj.key()?.to_string();
                Some(ObjectKey {
                    key,
                    size: obj.size().and_then(|s| u64::try_from(s).ok()),
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                })
            })
            .collect();
        let next = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage { keys, next })
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("get", key, e))?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| map_sdk_error("get", key, e))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error("put", key, e))?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<PresignedUrl> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| JobkitError::InvalidConfig(format!("presign expiry: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| map_sdk_error("presign", key, e))?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(expires_in)
                .map_err(|e| JobkitError::InvalidConfig(format!("presign expiry: {e}")))?;
        Ok(PresignedUrl {
            key: key.to_string(),
            url: request.uri().to_string(),
            expires_at,
        })
    }
}
