//! A test engine: the built-in text engine, slowed down, with a gauge of
//! how many conversions run at once.

#![allow(dead_code)]

use edgequake_jobkit::config::{ChunkingOptions, EngineOptions};
use edgequake_jobkit::engine::text::TextEngineFactory;
use edgequake_jobkit::engine::{ConvertedDocument, DocumentStream};
use edgequake_jobkit::{DocumentChunker, DocumentConverter, DocumentError, EngineFactory, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl Gauge {
    /// Most conversions seen running at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

pub struct SlowEngineFactory {
    inner: TextEngineFactory,
    delay: Duration,
    gauge: Arc<Gauge>,
}

impl SlowEngineFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: TextEngineFactory::new(),
            delay,
            gauge: Arc::new(Gauge::default()),
        }
    }

    pub fn gauge(&self) -> Arc<Gauge> {
        Arc::clone(&self.gauge)
    }
}

impl EngineFactory for SlowEngineFactory {
    fn build_converter(&self, options: &EngineOptions) -> Result<Arc<dyn DocumentConverter>> {
        Ok(Arc::new(SlowConverter {
            inner: self.inner.build_converter(options)?,
            delay: self.delay,
            gauge: Arc::clone(&self.gauge),
        }))
    }

    fn build_chunker(&self, options: &ChunkingOptions) -> Result<Arc<dyn DocumentChunker>> {
        self.inner.build_chunker(options)
    }
}

struct SlowConverter {
    inner: Arc<dyn DocumentConverter>,
    delay: Duration,
    gauge: Arc<Gauge>,
}

impl DocumentConverter for SlowConverter {
    fn convert(&self, document: &DocumentStream) -> std::result::Result<ConvertedDocument, DocumentError> {
        let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let converted = self.inner.convert(document);
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        self.gauge.finished.fetch_add(1, Ordering::SeqCst);
        converted
    }
}
