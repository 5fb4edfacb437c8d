//! Render converted documents into the requested output formats and lay
//! them out as files.
//!
//! ```text
//! ConvertedDocument ──▶ render(format) ──▶ ExportedContent   (in-body)
//!                                     └──▶ Artifact list     (zip / targets)
//!                                            md/{stem}.md
//!                                            json/{stem}.json
//!                                            txt/{stem}.txt
//!                                            html/{stem}.html
//!                                            doctags/{stem}.doctags.txt
//!                                            chunks/{stem}.json
//! ```
//!
//! Stems are unique within a task: when two documents share one, the later
//! claimant gets `{stem}_1`, `{stem}_2`, … (see [`StemAllocator`]).

use crate::config::OutputFormat;
use crate::engine::{BlockKind, ConvertedDocument};
use crate::error::{DocumentError, JobkitError, Result};
use crate::result::{ChunkItem, ExportedContent};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::{Cursor, Write};

/// One file to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Path relative to the target root, always `/`-separated.
    pub path: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Relative path of an exported file.
pub fn artifact_path(stem: &str, format: OutputFormat) -> String {
    let (dir, ext) = format.layout();
    format!("{dir}/{stem}.{ext}")
}

/// Hands out artifact stems that are unique within one task.
#[derive(Debug, Default)]
pub struct StemAllocator {
    taken: Mutex<HashSet<String>>,
}

impl StemAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `stem`, or the first free `{stem}_{n}` if it is taken.
    pub fn claim(&self, stem: &str) -> String {
        let mut taken = self.taken.lock();
        let mut candidate = stem.to_string();
        let mut n = 0;
        while taken.contains(&candidate) {
            n += 1;
            candidate = format!("{stem}_{n}");
        }
        taken.insert(candidate.clone());
        candidate
    }
}

/// Render every requested format into the in-body content shape.
pub fn export_document(
    doc: &ConvertedDocument,
    formats: &[OutputFormat],
) -> std::result::Result<ExportedContent, DocumentError> {
    let mut content = ExportedContent::default();
    for format in formats {
        match format {
            OutputFormat::Md => content.md_content = Some(render_markdown(doc)),
            OutputFormat::Json => {
                content.json_content =
                    Some(serde_json::to_value(doc).map_err(|e| DocumentError::ExportFailed {
                        document: doc.name.clone(),
                        detail: e.to_string(),
                    })?)
            }
            OutputFormat::Html => content.html_content = Some(render_html(doc)),
            OutputFormat::Text => content.text_content = Some(render_text(doc)),
            OutputFormat::Doctags => content.doctags_content = Some(render_doctags(doc)),
        }
    }
    Ok(content)
}

/// Lay out exported content as files named after `stem`.
pub fn artifacts(
    doc: &ConvertedDocument,
    stem: &str,
    content: &ExportedContent,
) -> std::result::Result<Vec<Artifact>, DocumentError> {
    let mut out = Vec::new();
    let mut push = |format: OutputFormat, bytes: Vec<u8>| {
        out.push(Artifact {
            path: artifact_path(stem, format),
            content_type: format.content_type(),
            bytes,
        })
    };
    if let Some(ref md) = content.md_content {
        push(OutputFormat::Md, md.clone().into_bytes());
    }
    if let Some(ref json) = content.json_content {
        let bytes = serde_json::to_vec_pretty(json).map_err(|e| DocumentError::ExportFailed {
            document: doc.name.clone(),
            detail: e.to_string(),
        })?;
        push(OutputFormat::Json, bytes);
    }
    if let Some(ref text) = content.text_content {
        push(OutputFormat::Text, text.clone().into_bytes());
    }
    if let Some(ref html) = content.html_content {
        push(OutputFormat::Html, html.clone().into_bytes());
    }
    if let Some(ref tags) = content.doctags_content {
        push(OutputFormat::Doctags, tags.clone().into_bytes());
    }
    Ok(out)
}

/// The chunk list of one document as a JSON file.
pub fn chunk_artifact(
    document: &str,
    stem: &str,
    chunks: &[ChunkItem],
) -> std::result::Result<Artifact, DocumentError> {
    let bytes = serde_json::to_vec_pretty(chunks).map_err(|e| DocumentError::ChunkingFailed {
        document: document.to_string(),
        detail: e.to_string(),
    })?;
    Ok(Artifact {
        path: format!("chunks/{stem}.json"),
        content_type: "application/json",
        bytes,
    })
}

// ── Renderers ────────────────────────────────────────────────────────────

pub fn render_markdown(doc: &ConvertedDocument) -> String {
    let mut parts = Vec::with_capacity(doc.blocks.len());
    for block in &doc.blocks {
        parts.push(match block.kind {
            BlockKind::Title => format!("# {}", block.text),
            BlockKind::Heading { level } => {
                format!("{} {}", "#".repeat(usize::from(level.clamp(1, 6))), block.text)
            }
            BlockKind::Paragraph => block.text.clone(),
            BlockKind::ListItem => format!("- {}", block.text),
            BlockKind::Code => format!("```\n{}\n```", block.text),
            BlockKind::Table => markdown_table(&block.text),
        });
    }
    let mut out = parts.join("\n\n");
    out.push('\n');
    out
}

fn markdown_table(text: &str) -> String {
    let mut lines = text.lines().map(|row| format!("| {} |", row.replace('\t', " | ")));
    let Some(header) = lines.next() else {
        return String::new();
    };
    let columns = text.lines().next().map_or(1, |r| r.split('\t').count());
    let mut out = vec![header, format!("|{}", "---|".repeat(columns))];
    out.extend(lines);
    out.join("\n")
}

pub fn render_text(doc: &ConvertedDocument) -> String {
    let mut out = doc
        .blocks
        .iter()
        .map(|b| match b.kind {
            BlockKind::Table => b.text.replace('\t', " "),
            _ => b.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

pub fn render_html(doc: &ConvertedDocument) -> String {
    let mut out = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
    out.push_str(&format!("<title>{}</title>\n</head>\n<body>\n", escape_html(doc.stem())));
    let mut in_list = false;
    for block in &doc.blocks {
        if in_list && block.kind != BlockKind::ListItem {
            out.push_str("</ul>\n");
            in_list = false;
        }
        let text = escape_html(&block.text);
        match block.kind {
            BlockKind::Title => out.push_str(&format!("<h1>{text}</h1>\n")),
            BlockKind::Heading { level } => {
                let level = level.clamp(1, 6);
                out.push_str(&format!("<h{level}>{text}</h{level}>\n"));
            }
            BlockKind::Paragraph => out.push_str(&format!("<p>{text}</p>\n")),
            BlockKind::ListItem => {
                if !in_list {
                    out.push_str("<ul>\n");
                    in_list = true;
                }
                out.push_str(&format!("<li>{text}</li>\n"));
            }
            BlockKind::Code => out.push_str(&format!("<pre><code>{text}</code></pre>\n")),
            BlockKind::Table => {
                out.push_str("<table>\n");
                for (i, row) in block.text.lines().enumerate() {
                    let tag = if i == 0 { "th" } else { "td" };
                    out.push_str("<tr>");
                    for cell in row.split('\t') {
                        out.push_str(&format!("<{tag}>{}</{tag}>", escape_html(cell)));
                    }
                    out.push_str("</tr>\n");
                }
                out.push_str("</table>\n");
            }
        }
    }
    if in_list {
        out.push_str("</ul>\n");
    }
    out.push_str("</body>\n</html>\n");
    out
}

/// DocTags: one tagged element per block with its page.
pub fn render_doctags(doc: &ConvertedDocument) -> String {
    let mut out = String::from("<doctag>");
    for block in &doc.blocks {
        let tag = match block.kind {
            BlockKind::Title => "title",
            BlockKind::Heading { .. } => "section_header",
            BlockKind::Paragraph => "text",
            BlockKind::ListItem => "list_item",
            BlockKind::Code => "code",
            BlockKind::Table => "otsl",
        };
        let body = match block.kind {
            BlockKind::Table => block
                .text
                .lines()
                .map(|row| {
                    row.split('\t')
                        .map(|c| format!("<fcel>{c}"))
                        .collect::<String>()
                })
                .collect::<Vec<_>>()
                .join("<nl>"),
            _ => block.text.clone(),
        };
        out.push_str(&format!("<{tag}><page_{}>{body}</{tag}>", block.page));
    }
    out.push_str("</doctag>\n");
    out
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── Zip archive ──────────────────────────────────────────────────────────

/// Builds an in-memory zip archive of artifacts.
pub struct ZipBuilder {
    writer: zip::ZipWriter<Cursor<Vec<u8>>>,
    entries: usize,
}

impl Default for ZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZipBuilder {
    pub fn new() -> Self {
        Self {
            writer: zip::ZipWriter::new(Cursor::new(Vec::new())),
            entries: 0,
        }
    }

    pub fn add(&mut self, artifact: &Artifact) -> Result<()> {
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        self.writer
            .start_file(artifact.path.as_str(), options)
            .map_err(|e| JobkitError::Archive(format!("{}: {e}", artifact.path)))?;
        self.writer
            .write_all(&artifact.bytes)
            .map_err(|e| JobkitError::Archive(format!("{}: {e}", artifact.path)))?;
        self.entries += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn finish(self) -> Result<Vec<u8>> {
        let cursor = self
            .writer
            .finish()
            .map_err(|e| JobkitError::Archive(e.to_string()))?;
        Ok(cursor.into_inner())
    }
}
