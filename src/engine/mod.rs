//! Conversion and chunking engines, and the cache that keeps them warm.
//!
//! The engine itself (layout analysis, OCR, table structure) sits outside
//! this crate, behind [`EngineFactory`]. What lives here:
//!
//! * the engine traits, [`DocumentConverter`] and [`DocumentChunker`];
//! * [`cache_key`], which turns any serialisable configuration into a
//!   stable, field-order-independent SHA-256 digest;
//! * [`cache::EngineCache`], the bounded LRU that maps those keys to engines;
//! * [`text`], a lightweight built-in engine for text-like inputs.
//!
//! Engines are synchronous and CPU-bound. Callers run them inside
//! `tokio::task::spawn_blocking` so a slow document cannot stall the runtime.

pub mod cache;
pub mod text;

use crate::config::{ChunkingOptions, EngineOptions, InputFormat};
use crate::error::{DocumentError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

// ── Documents ────────────────────────────────────────────────────────────

/// Raw document bytes with the name they arrived under.
#[derive(Debug, Clone)]
pub struct DocumentStream {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Structural role of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Title,
    Heading { level: u8 },
    Paragraph,
    ListItem,
    Code,
    /// One table; `text` holds rows separated by `\n`, cells by `\t`.
    Table,
}

/// One block of a converted document, in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentBlock {
    pub kind: BlockKind,
    pub text: String,
    /// 1-based page the block starts on.
    pub page: u32,
}

/// The engine's structured view of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub name: String,
    pub format: InputFormat,
    pub page_count: u32,
    pub blocks: Vec<DocumentBlock>,
}

impl ConvertedDocument {
    /// File name without its extension, used for exported artifacts.
    pub fn stem(&self) -> &str {
        let base = self.name.rsplit('/').next().unwrap_or(&self.name);
        match base.rfind('.') {
            Some(idx) if idx > 0 => &base[..idx],
            _ => base,
        }
    }
}

/// One chunk produced by a [`DocumentChunker`].
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub headings: Vec<String>,
    pub page_numbers: Vec<u32>,
    pub num_tokens: usize,
}

// ── Engine traits ────────────────────────────────────────────────────────

/// A ready-to-use conversion engine.
pub trait DocumentConverter: Send + Sync {
    fn convert(&self, document: &DocumentStream) -> std::result::Result<ConvertedDocument, DocumentError>;
}

/// A ready-to-use chunking engine.
pub trait DocumentChunker: Send + Sync {
    fn chunk(&self, document: &ConvertedDocument) -> std::result::Result<Vec<Chunk>, DocumentError>;

    /// Token count of `text` under this chunker's tokenizer.
    fn count_tokens(&self, text: &str) -> usize;
}

/// Builds engines. Construction may be expensive (model loading) and may
/// fail; failures are reported as
/// [`crate::error::JobkitError::EngineUnavailable`].
pub trait EngineFactory: Send + Sync {
    fn build_converter(&self, options: &EngineOptions) -> Result<Arc<dyn DocumentConverter>>;

    fn build_chunker(&self, options: &ChunkingOptions) -> Result<Arc<dyn DocumentChunker>>;
}

// ── Cache keys ───────────────────────────────────────────────────────────

/// Hex SHA-256 digest of a canonicalised configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Twelve hex digits are plenty to tell keys apart in logs.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// Compute the cache key of a configuration.
///
/// The value is serialised to JSON, object keys are sorted at every depth,
/// and the canonical text is hashed. Two configurations that differ in any
/// field get different keys; field order never matters.
pub fn cache_key<T: Serialize + ?Sized>(config: &T) -> Result<CacheKey> {
    let value = serde_json::to_value(config)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(CacheKey(format!("{digest:x}")))
}

fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<()> {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
