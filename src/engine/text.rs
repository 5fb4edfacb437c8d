//! Built-in engine for text-like inputs.
//!
//! Handles Markdown, plain text, AsciiDoc, HTML and CSV without any model
//! loading, which makes the orchestrators usable end-to-end out of the box.
//! Binary formats (PDF, Office, images) are reported as
//! [`DocumentError::UnsupportedFormat`] per document; plug a real engine in
//! through [`EngineFactory`] for those.
//!
//! The chunker walks blocks in reading order, tracks the heading path of
//! each block, splits blocks larger than the token budget, and optionally
//! merges small neighbours that share the same headings.

use super::{
    BlockKind, Chunk, ConvertedDocument, DocumentBlock, DocumentChunker, DocumentConverter,
    DocumentStream, EngineFactory,
};
use crate::config::{ChunkingOptions, EngineOptions, InputFormat};
use crate::error::{DocumentError, JobkitError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

// ── Patterns ─────────────────────────────────────────────────────────────

static MD_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*$").unwrap());
static ADOC_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(={1,6})\s+(.+)$").unwrap());
static LIST_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:[-*+]|\d+[.)])\s+(.+)$").unwrap());
static TABLE_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|?(\s*:?-{3,}:?\s*\|)+\s*:?-*:?\s*\|?$").unwrap());
static HTML_NOISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>").unwrap());
static HTML_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").unwrap());
static HTML_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(h[1-6]|p|li|pre|tr)\b[^>]*>(.*?)</(?:h[1-6]|p|li|pre|tr)\s*>").unwrap()
});
static HTML_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t[dh]\b[^>]*>(.*?)</t[dh]\s*>").unwrap());
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

// ── Factory ──────────────────────────────────────────────────────────────

/// Engine factory for the built-in text engine.
#[derive(Debug, Default, Clone)]
pub struct TextEngineFactory;

impl TextEngineFactory {
    pub fn new() -> Self {
        Self
    }
}

impl EngineFactory for TextEngineFactory {
    fn build_converter(&self, options: &EngineOptions) -> Result<Arc<dyn DocumentConverter>> {
        if options.from_formats.is_empty() {
            return Err(JobkitError::EngineUnavailable {
                detail: "no input formats enabled".into(),
            });
        }
        if !options.images_scale.is_finite() || options.images_scale <= 0.0 {
            return Err(JobkitError::EngineUnavailable {
                detail: format!("invalid images_scale {}", options.images_scale),
            });
        }
        Ok(Arc::new(TextConverter {
            accepted: options.from_formats.clone(),
        }))
    }

    fn build_chunker(&self, options: &ChunkingOptions) -> Result<Arc<dyn DocumentChunker>> {
        options.validate()?;
        let name = options.tokenizer.as_deref().unwrap_or("whitespace");
        let tokenizer = Tokenizer::from_name(name).ok_or_else(|| JobkitError::EngineUnavailable {
            detail: format!("unknown tokenizer '{name}' (available: whitespace, characters)"),
        })?;
        Ok(Arc::new(TextChunker {
            tokenizer,
            options: options.clone(),
        }))
    }
}

// ── Converter ────────────────────────────────────────────────────────────

/// Structural parser for text-like documents.
#[derive(Debug)]
pub struct TextConverter {
    accepted: Vec<InputFormat>,
}

impl DocumentConverter for TextConverter {
    fn convert(&self, document: &DocumentStream) -> std::result::Result<ConvertedDocument, DocumentError> {
        let format = detect_format(document);
        let Some(format) = format.filter(|f| self.accepted.contains(f)) else {
            return Err(DocumentError::UnsupportedFormat {
                document: document.name.clone(),
                format: format.map(|f| f.as_str()).unwrap_or("unknown").to_string(),
            });
        };

        let text = match format {
            InputFormat::Md
            | InputFormat::Text
            | InputFormat::Asciidoc
            | InputFormat::Html
            | InputFormat::Csv => std::str::from_utf8(&document.bytes).map_err(|e| {
                DocumentError::ConversionFailed {
                    document: document.name.clone(),
                    detail: format!("not valid UTF-8: {e}"),
                }
            })?,
            _ => {
                return Err(DocumentError::UnsupportedFormat {
                    document: document.name.clone(),
                    format: format.as_str().to_string(),
                })
            }
        };

        let blocks = match format {
            InputFormat::Md => parse_markdown(text),
            InputFormat::Html => parse_html(text),
            InputFormat::Csv => parse_csv(text),
            _ => parse_plain(text),
        };
        let page_count = blocks.iter().map(|b| b.page).max().unwrap_or(1);
        debug!(
            "Parsed {} as {}: {} blocks, {} pages",
            document.name,
            format.as_str(),
            blocks.len(),
            page_count
        );

        Ok(ConvertedDocument {
            name: document.name.clone(),
            format,
            page_count,
            blocks,
        })
    }
}

fn detect_format(document: &DocumentStream) -> Option<InputFormat> {
    if let Some(format) = InputFormat::from_filename(&document.name) {
        return Some(format);
    }
    if document.bytes.starts_with(b"%PDF") {
        return Some(InputFormat::Pdf);
    }
    if document.bytes.starts_with(b"PK\x03\x04") {
        return Some(InputFormat::Docx);
    }
    std::str::from_utf8(&document.bytes).ok().map(|text| {
        let head = text.trim_start().to_ascii_lowercase();
        if head.starts_with("<!doctype html") || head.starts_with("<html") {
            InputFormat::Html
        } else {
            InputFormat::Text
        }
    })
}

/// Accumulates lines into blocks while tracking the current page.
struct BlockBuilder {
    blocks: Vec<DocumentBlock>,
    page: u32,
    paragraph: Vec<String>,
    table: Vec<String>,
}

impl BlockBuilder {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            page: 1,
            paragraph: Vec::new(),
            table: Vec::new(),
        }
    }

    fn push(&mut self, kind: BlockKind, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.blocks.push(DocumentBlock {
            kind,
            text,
            page: self.page,
        });
    }

    fn flush(&mut self) {
        if !self.paragraph.is_empty() {
            let text = self.paragraph.join(" ");
            self.paragraph.clear();
            self.push(BlockKind::Paragraph, text);
        }
        if !self.table.is_empty() {
            let text = self.table.join("\n");
            self.table.clear();
            self.push(BlockKind::Table, text);
        }
    }

    /// Handle form feeds, which mark page breaks in text exports.
    fn page_breaks<'a>(&mut self, line: &'a str) -> &'a str {
        let breaks = line.matches('\u{c}').count() as u32;
        if breaks > 0 {
            self.flush();
            self.page += breaks;
            return line.trim_matches('\u{c}');
        }
        line
    }

    fn finish(mut self) -> Vec<DocumentBlock> {
        self.flush();
        self.blocks
    }
}

fn parse_markdown(text: &str) -> Vec<DocumentBlock> {
    let mut b = BlockBuilder::new();
    let mut code: Option<Vec<&str>> = None;

    for raw in text.lines() {
        let line = b.page_breaks(raw);

        if let Some(ref mut lines) = code {
            if line.trim_start().starts_with("```") {
                let body = lines.join("\n");
                code = None;
                b.push(BlockKind::Code, body);
            } else {
                lines.push(line);
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            b.flush();
            code = Some(Vec::new());
        } else if trimmed.is_empty() {
            b.flush();
        } else if let Some(caps) = MD_HEADING.captures(trimmed) {
            b.flush();
            b.push(BlockKind::Heading { level: caps[1].len() as u8 }, &caps[2]);
        } else if trimmed.starts_with('|') {
            if !b.paragraph.is_empty() {
                let text = b.paragraph.join(" ");
                b.paragraph.clear();
                b.push(BlockKind::Paragraph, text);
            }
            if !TABLE_SEPARATOR.is_match(trimmed) {
                let cells: Vec<&str> = trimmed.trim_matches('|').split('|').map(str::trim).collect();
                b.table.push(cells.join("\t"));
            }
        } else if let Some(caps) = LIST_ITEM.captures(trimmed) {
            b.flush();
            b.push(BlockKind::ListItem, &caps[1]);
        } else {
            if !b.table.is_empty() {
                b.flush();
            }
            b.paragraph.push(trimmed.to_string());
        }
    }

    if let Some(lines) = code {
        b.push(BlockKind::Code, lines.join("\n"));
    }
    b.finish()
}

fn parse_plain(text: &str) -> Vec<DocumentBlock> {
    let mut b = BlockBuilder::new();
    for raw in text.lines() {
        let line = b.page_breaks(raw);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            b.flush();
        } else if let Some(caps) = ADOC_HEADING.captures(trimmed) {
            b.flush();
            let level = caps[1].len() as u8;
            let kind = if level == 1 {
                BlockKind::Title
            } else {
                BlockKind::Heading { level: level - 1 }
            };
            b.push(kind, &caps[2]);
        } else {
            b.paragraph.push(trimmed.to_string());
        }
    }
    b.finish()
}

fn parse_html(text: &str) -> Vec<DocumentBlock> {
    let mut b = BlockBuilder::new();
    if let Some(caps) = HTML_TITLE.captures(text) {
        b.push(BlockKind::Title, clean_html_text(&caps[1]));
    }
    let body = HTML_NOISE.replace_all(text, "");

    for caps in HTML_BLOCK.captures_iter(&body) {
        let tag = caps[1].to_ascii_lowercase();
        let inner = &caps[2];
        if tag == "tr" {
            let cells: Vec<String> = HTML_CELL
                .captures_iter(inner)
                .map(|c| clean_html_text(&c[1]))
                .collect();
            if !cells.is_empty() {
                b.table.push(cells.join("\t"));
            }
            continue;
        }
        b.flush();
        let kind = match tag.as_str() {
            "p" => BlockKind::Paragraph,
            "li" => BlockKind::ListItem,
            "pre" => BlockKind::Code,
            h => BlockKind::Heading {
                level: h[1..].parse().unwrap_or(1),
            },
        };
        let content = if kind == BlockKind::Code {
            decode_entities(&HTML_TAG.replace_all(inner, ""))
        } else {
            clean_html_text(inner)
        };
        b.push(kind, content);
    }
    b.finish()
}

fn clean_html_text(fragment: &str) -> String {
    let stripped = HTML_TAG.replace_all(fragment, " ");
    let decoded = decode_entities(&stripped);
    WHITESPACE.replace_all(decoded.trim(), " ").into_owned()
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn parse_csv(text: &str) -> Vec<DocumentBlock> {
    let mut b = BlockBuilder::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        b.table.push(split_csv_line(line).join("\t"));
    }
    b.finish()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

// ── Chunker ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tokenizer {
    Whitespace,
    Characters,
}

impl Tokenizer {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "whitespace" => Some(Tokenizer::Whitespace),
            "characters" | "chars" => Some(Tokenizer::Characters),
            _ => None,
        }
    }

    fn count(&self, text: &str) -> usize {
        match self {
            Tokenizer::Whitespace => text.split_whitespace().count(),
            Tokenizer::Characters => text.chars().count(),
        }
    }

    /// Split `text` into windows of at most `max` tokens.
    fn windows(&self, text: &str, max: usize) -> Vec<String> {
        match self {
            Tokenizer::Whitespace => text
                .split_whitespace()
                .collect::<Vec<_>>()
                .chunks(max)
                .map(|w| w.join(" "))
                .collect(),
            Tokenizer::Characters => text
                .chars()
                .collect::<Vec<_>>()
                .chunks(max)
                .map(|w| w.iter().collect())
                .collect(),
        }
    }
}

/// Heading-aware chunker with a built-in tokenizer.
#[derive(Debug)]
pub struct TextChunker {
    tokenizer: Tokenizer,
    options: ChunkingOptions,
}

struct Piece {
    headings: Vec<String>,
    text: String,
    pages: BTreeSet<u32>,
}

impl DocumentChunker for TextChunker {
    fn chunk(&self, document: &ConvertedDocument) -> std::result::Result<Vec<Chunk>, DocumentError> {
        let max = self.options.max_tokens;
        let mut path: Vec<(u8, String)> = Vec::new();
        let mut pieces: Vec<Piece> = Vec::new();

        for block in &document.blocks {
            let text = match block.kind {
                BlockKind::Title => {
                    path.clear();
                    path.push((0, block.text.clone()));
                    continue;
                }
                BlockKind::Heading { level } => {
                    path.retain(|(l, _)| *l < level);
                    path.push((level, block.text.clone()));
                    continue;
                }
                BlockKind::Table => render_table(&block.text, self.options.use_markdown_tables),
                BlockKind::ListItem => format!("- {}", block.text),
                BlockKind::Paragraph | BlockKind::Code => block.text.clone(),
            };
            let headings: Vec<String> = path.iter().map(|(_, h)| h.clone()).collect();
            for window in self.tokenizer.windows(&text, max) {
                pieces.push(Piece {
                    headings: headings.clone(),
                    text: window,
                    pages: BTreeSet::from([block.page]),
                });
            }
        }

        if self.options.merge_peers {
            pieces = self.merge_peers(pieces);
        }

        Ok(pieces
            .into_iter()
            .map(|p| Chunk {
                num_tokens: self.tokenizer.count(&p.text),
                text: p.text,
                headings: p.headings,
                page_numbers: p.pages.into_iter().collect(),
            })
            .collect())
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }
}

impl TextChunker {
    fn merge_peers(&self, pieces: Vec<Piece>) -> Vec<Piece> {
        let max = self.options.max_tokens;
        let mut merged: Vec<Piece> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if let Some(last) = merged.last_mut() {
                if last.headings == piece.headings {
                    let candidate = format!("{}\n{}", last.text, piece.text);
                    if self.tokenizer.count(&candidate) <= max {
                        last.text = candidate;
                        last.pages.extend(piece.pages);
                        continue;
                    }
                }
            }
            merged.push(piece);
        }
        merged
    }
}

/// Render a tab/newline table either as Markdown or as `header = value` lines.
fn render_table(text: &str, markdown: bool) -> String {
    let rows: Vec<Vec<&str>> = text.lines().map(|r| r.split('\t').collect()).collect();
    let Some((header, body)) = rows.split_first() else {
        return String::new();
    };

    if markdown {
        let mut out = format!("| {} |\n", header.join(" | "));
        out.push_str(&format!("|{}\n", "---|".repeat(header.len())));
        for row in body {
            out.push_str(&format!("| {} |\n", row.join(" | ")));
        }
        return out.trim_end().to_string();
    }

    if body.is_empty() {
        return header.join(", ");
    }
    body.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| match header.get(i) {
                    Some(h) if !h.is_empty() => format!("{h} = {cell}"),
                    _ => (*cell).to_string(),
                })
                .collect::<Vec<_>>()
                .join(". ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConvertOptions;

    fn stream(name: &str, text: &str) -> DocumentStream {
        DocumentStream {
            name: name.into(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    fn converter() -> Arc<dyn DocumentConverter> {
        TextEngineFactory::new()
            .build_converter(&ConvertOptions::default().engine_options())
            .unwrap()
    }

    #[test]
    fn markdown_blocks() {
        let md = "# Title\n\nFirst line\ncontinues.\n\n- item one\n- item two\n\n```\nlet x = 1;\n```\n\n| a | b |\n|---|---|\n| 1 | 2 |\n";
        let doc = converter().convert(&stream("doc.md", md)).unwrap();
        let kinds: Vec<BlockKind> = doc.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BlockKind::Heading { level: 1 },
                BlockKind::Paragraph,
                BlockKind::ListItem,
                BlockKind::ListItem,
                BlockKind::Code,
                BlockKind::Table,
            ]
        );
        assert_eq!(doc.blocks[1].text, "First line continues.");
        assert_eq!(doc.blocks[5].text, "a\tb\n1\t2");
    }

    #[test]
    fn form_feed_starts_new_page() {
        let doc = converter()
            .convert(&stream("notes.txt", "page one\n\u{c}page two\n"))
            .unwrap();
        assert_eq!(doc.page_count, 2);
        assert_eq!(doc.blocks[1].page, 2);
    }

    #[test]
    fn html_blocks_and_tables() {
        let html = "<html><head><title>T</title></head><body><h2>Intro &amp; scope</h2><p>Hello <b>world</b></p><table><tr><th>k</th><th>v</th></tr><tr><td>a</td><td>1</td></tr></table></body></html>";
        let doc = converter().convert(&stream("page.html", html)).unwrap();
        assert_eq!(doc.blocks[0].kind, BlockKind::Title);
        assert_eq!(doc.blocks[1].text, "Intro & scope");
        assert_eq!(doc.blocks[2].text, "Hello world");
        assert_eq!(doc.blocks[3].kind, BlockKind::Table);
        assert_eq!(doc.blocks[3].text, "k\tv\na\t1");
    }

    #[test]
    fn csv_with_quotes() {
        let doc = converter()
            .convert(&stream("t.csv", "name,note\nann,\"a, b\"\n"))
            .unwrap();
        assert_eq!(doc.blocks[0].text, "name\tnote\nann\ta, b");
    }

    #[test]
    fn pdf_is_unsupported() {
        let err = converter()
            .convert(&DocumentStream {
                name: "scan.pdf".into(),
                bytes: b"%PDF-1.7".to_vec(),
            })
            .unwrap_err();
        assert!(matches!(err, DocumentError::UnsupportedFormat { ref format, .. } if format == "pdf"));
    }

    #[test]
    fn disabled_format_is_unsupported() {
        let options = ConvertOptions::builder()
            .from_formats([InputFormat::Html])
            .build()
            .unwrap();
        let conv = TextEngineFactory::new()
            .build_converter(&options.engine_options())
            .unwrap();
        assert!(conv.convert(&stream("a.md", "# x")).is_err());
    }

    #[test]
    fn unknown_tokenizer_fails_construction() {
        let options = ChunkingOptions {
            tokenizer: Some("bert-base".into()),
            ..Default::default()
        };
        let err = TextEngineFactory::new().build_chunker(&options).err().unwrap();
        assert!(err.to_string().contains("bert-base"));
    }

    #[test]
    fn chunks_carry_heading_path_and_respect_budget() {
        let md = "# Guide\n\n## Setup\n\none two three four five six\n\n## Usage\n\nseven eight\n";
        let doc = converter().convert(&stream("g.md", md)).unwrap();
        let chunker = TextEngineFactory::new()
            .build_chunker(&ChunkingOptions {
                max_tokens: 4,
                ..Default::default()
            })
            .unwrap();
        let chunks = chunker.chunk(&doc).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].headings, vec!["Guide", "Setup"]);
        assert_eq!(chunks[0].text, "one two three four");
        assert_eq!(chunks[1].text, "five six");
        assert_eq!(chunks[2].headings, vec!["Guide", "Usage"]);
        assert!(chunks.iter().all(|c| c.num_tokens <= 4));
    }

    #[test]
    fn merge_peers_joins_small_siblings() {
        let md = "## A\n\nx y\n\nz\n";
        let doc = converter().convert(&stream("m.md", md)).unwrap();
        let factory = TextEngineFactory::new();
        let merged = factory
            .build_chunker(&ChunkingOptions::default())
            .unwrap()
            .chunk(&doc)
            .unwrap();
        let separate = factory
            .build_chunker(&ChunkingOptions {
                merge_peers: false,
                ..Default::default()
            })
            .unwrap()
            .chunk(&doc)
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "x y\nz");
        assert_eq!(separate.len(), 2);
    }

    #[test]
    fn table_rendering_modes() {
        let t = "k\tv\na\t1";
        assert_eq!(render_table(t, false), "k = a. v = 1");
        assert_eq!(render_table(t, true), "| k | v |\n|---|---|\n| a | 1 |");
    }
}
