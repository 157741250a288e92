//! Chunking provider: splits a document's extracted text into ordered,
//! size-bounded chunks with semantic metadata.

use chrono::Utc;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::db::{Chunk, ChunkKind, Document};
use crate::error::{ChunkingError, ServiceResult};

/// Seam between the pipeline and the chunking implementation.
///
/// Pure function of the document's extracted text; returning zero chunks is a
/// valid, meaningful result (nothing to embed).
pub trait Chunker: Send + Sync {
    fn chunk_document(&self, document: &Document) -> ServiceResult<Vec<Chunk>>;
}

/// Heading-aware text chunker.
///
/// Splits on markdown-style headings into sections, then packs paragraphs
/// into windows bounded by the configured chunk size.
pub struct TextChunker {
    max_chunk_chars: usize,
    min_chunk_chars: usize,
    max_document_chars: usize,
}

struct Section {
    title: Option<String>,
    body: String,
}

impl TextChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            max_chunk_chars: config.max_chunk_chars.max(1),
            min_chunk_chars: config.min_chunk_chars,
            max_document_chars: config.max_document_chars,
        }
    }

    fn split_sections(text: &str) -> Vec<Section> {
        let mut sections: Vec<Section> = Vec::new();
        let mut current = Section {
            title: None,
            body: String::new(),
        };

        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                if !current.body.trim().is_empty() || current.title.is_some() {
                    sections.push(current);
                }
                current = Section {
                    title: Some(trimmed.trim_start_matches('#').trim().to_string()),
                    body: String::new(),
                };
            } else {
                current.body.push_str(line);
                current.body.push('\n');
            }
        }
        if !current.body.trim().is_empty() || current.title.is_some() {
            sections.push(current);
        }

        sections
    }

    /// Pack a section's paragraphs into windows of at most `max_chunk_chars`,
    /// merging short paragraphs up to `min_chunk_chars`.
    fn pack_windows(&self, body: &str) -> Vec<String> {
        let mut windows: Vec<String> = Vec::new();
        let mut current = String::new();

        for paragraph in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if !current.is_empty()
                && (current.len() >= self.min_chunk_chars
                    || current.len() + paragraph.len() + 2 > self.max_chunk_chars)
            {
                windows.push(std::mem::take(&mut current));
            }
            if paragraph.len() > self.max_chunk_chars {
                if !current.is_empty() {
                    windows.push(std::mem::take(&mut current));
                }
                windows.extend(hard_split(paragraph, self.max_chunk_chars));
            } else {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(paragraph);
            }
        }
        if !current.is_empty() {
            windows.push(current);
        }

        windows
    }
}

impl Chunker for TextChunker {
    fn chunk_document(&self, document: &Document) -> ServiceResult<Vec<Chunk>> {
        let text = document.extracted_text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        if text.len() > self.max_document_chars {
            return Err(ChunkingError::OversizeInput {
                chars: text.len(),
                max: self.max_document_chars,
            }
            .into());
        }

        let now = Utc::now();
        let mut chunks = Vec::new();

        for section in Self::split_sections(text) {
            for window in self.pack_windows(&section.body) {
                let index = chunks.len() as i64;
                let kind = classify_kind(&window);
                let keywords = extract_keywords(&window, 5);
                let importance = score_importance(index, section.title.is_some());
                chunks.push(Chunk {
                    id: Uuid::new_v4().to_string(),
                    document_id: document.id.clone(),
                    chunk_index: index,
                    content: window,
                    title: section.title.clone(),
                    section: section.title.clone(),
                    keywords,
                    importance,
                    kind,
                    embedding: None,
                    embedding_dim: None,
                    created_at: now,
                });
            }
        }

        Ok(chunks)
    }
}

/// Split an oversized paragraph on whitespace, keeping each piece under `max`.
fn hard_split(paragraph: &str, max: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();

    for word in paragraph.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > max {
            pieces.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

fn classify_kind(content: &str) -> ChunkKind {
    let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return ChunkKind::Other;
    }

    let list_lines = lines
        .iter()
        .filter(|l| {
            l.starts_with("- ")
                || l.starts_with("* ")
                || l.chars().next().is_some_and(|c| c.is_ascii_digit()) && l.contains(". ")
        })
        .count();
    let table_lines = lines.iter().filter(|l| l.starts_with('|')).count();

    if table_lines * 2 > lines.len() {
        ChunkKind::Table
    } else if list_lines * 2 > lines.len() {
        ChunkKind::List
    } else {
        ChunkKind::Paragraph
    }
}

/// Most frequent words longer than three characters, minus common stopwords.
fn extract_keywords(content: &str, max: usize) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "this", "that", "with", "from", "have", "been", "were", "will", "would", "their",
        "there", "which", "about", "into", "them", "then", "than", "these", "those", "when",
        "where", "what", "your", "other", "some", "more", "over", "such", "only", "also",
    ];

    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for word in content.split(|c: char| !c.is_alphanumeric()) {
        let word = word.to_lowercase();
        if word.len() > 3 && !STOPWORDS.contains(&word.as_str()) {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(max).map(|(w, _)| w).collect()
}

fn score_importance(index: i64, has_section: bool) -> f32 {
    let mut score: f32 = 0.5;
    if index == 0 {
        score += 0.2;
    }
    if has_section {
        score += 0.2;
    }
    score.min(1.0)
}
