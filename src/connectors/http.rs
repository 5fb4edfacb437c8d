//! HTTP(S) source: downloads one document per URL.

use super::{DocumentId, SourceProcessor};
use crate::engine::DocumentStream;
use crate::error::{JobkitError, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Downloads the document behind an `Http` source.
///
/// The client is created with the source and dropped with it.
pub struct HttpSourceProcessor {
    url: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpSourceProcessor {
    pub fn new(url: String, headers: BTreeMap<String, String>, timeout: Duration) -> Result<Self> {
        if !is_url(&url) {
            return Err(JobkitError::InvalidConfig(format!(
                "'{url}' is not an HTTP/HTTPS URL"
            )));
        }
        let mut header_map = HeaderMap::new();
        for (name, value) in &headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                JobkitError::InvalidConfig(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                JobkitError::InvalidConfig(format!("invalid value for header '{name}': {e}"))
            })?;
            header_map.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(header_map)
            .build()
            .map_err(|e| JobkitError::DownloadFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            url,
            client,
            timeout_secs: timeout.as_secs(),
        })
    }

    async fn download(&self) -> Result<DocumentStream> {
        info!("Downloading document from: {}", self.url);

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                JobkitError::DownloadTimeout {
                    url: self.url.clone(),
                    secs: self.timeout_secs,
                }
            } else {
                JobkitError::DownloadFailed {
                    url: self.url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(JobkitError::DownloadFailed {
                url: self.url.clone(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        let name = extract_filename(&self.url, response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| JobkitError::DownloadFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        debug!("Downloaded {} bytes as '{}'", bytes.len(), name);
        Ok(DocumentStream {
            name,
            bytes: bytes.to_vec(),
        })
    }
}

#[async_trait]
impl SourceProcessor for HttpSourceProcessor {
    async fn count_documents(&self) -> Result<usize> {
        Ok(1)
    }

    fn list_document_ids(&self) -> BoxStream<'_, Result<DocumentId>> {
        stream::once(async move { Ok(DocumentId(self.url.clone())) }).boxed()
    }

    async fn fetch_document(&self, id: &DocumentId) -> Result<DocumentStream> {
        if id.0 != self.url {
            return Err(JobkitError::DocumentNotFound { id: id.0.clone() });
        }
        self.download().await
    }
}

/// Extract a reasonable filename from the response headers or the URL.
fn extract_filename(url: &str, headers: &HeaderMap) -> String {
    if let Some(name) = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
    {
        return name;
    }

    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }

    "downloaded".to_string()
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let name = part.strip_prefix("filename=")?.trim_matches('"');
        let base = name.rsplit(['/', '\\']).next()?;
        (!base.is_empty()).then(|| base.to_string())
    })
}
