//! Hierarchy-aware text chunker.
//!
//! Splitting happens in two stages. Stage A partitions the canonical text on
//! heading lines (`#` markers, numeric `1.` / `1.2` prefixes, or `第X章`
//! forms) while a stack tracks ancestor headings, so every section knows its
//! ` > `-joined hierarchy path. Stage B cuts each section's body into chunks
//! that respect `chunk_size`, trying separators from paragraph down to
//! single space and carrying `chunk_overlap` trailing characters into the
//! next chunk to preserve continuity.
//!
//! All length arithmetic is in characters, not bytes, so CJK text is cut at
//! the same budgets as ASCII.

use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::DocumentChunk;
use crate::token::estimate_tokens;

/// Heading lines recognized by Stage A.
static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(#{1,6}\s+.+|\d+\.\d*\s+.+|第[一二三四五六七八九十百]+[章节条款]\s*.*)$")
        .expect("heading pattern")
});

/// Separator ladder for Stage B, most to least structural.
const SEPARATORS: [&str; 13] = [
    "\n\n", "\n", "。", "！", "？", ".", "!", "?", "；", ";", "，", ",", " ",
];

/// A heading-delimited slice of the document.
#[derive(Debug, Clone)]
pub struct TextSection {
    /// The section's own title, cleaned of `#` markers.
    pub heading: Option<String>,
    /// Ancestor titles joined with ` > `, ending in this section's own.
    pub hierarchy: Option<String>,
    pub content: String,
}

/// Split canonical text into chunks for one document.
///
/// Chunk ids are fresh UUIDs; `chunk_index` is dense starting at 0 across
/// the whole document regardless of section boundaries.
pub fn chunk_text(document_id: &str, text: &str, config: &ChunkingConfig) -> Vec<DocumentChunk> {
    let mut chunks = Vec::new();
    if text.trim().is_empty() {
        return chunks;
    }

    let mut index: i64 = 0;
    for section in split_by_headings(text) {
        for content in recursive_character_split(
            &section.content,
            config.chunk_size,
            config.chunk_overlap,
            config.min_chunk_size,
        ) {
            let token_count = estimate_tokens(&content) as i64;
            chunks.push(DocumentChunk {
                id: Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_index: index,
                content,
                heading: section.heading.clone(),
                hierarchy: section.hierarchy.clone(),
                start_page: None,
                end_page: None,
                token_count,
                context_prefix: None,
                vector_id: None,
            });
            index += 1;
        }
    }

    tracing::info!(document_id, chunks = chunks.len(), "document chunked");
    chunks
}

/// Stage A: partition on heading lines, tracking the ancestor stack.
///
/// On a heading of level L the stack pops while its depth is >= L, then the
/// new heading is pushed; same-level headings therefore replace each other
/// rather than nesting.
pub fn split_by_headings(text: &str) -> Vec<TextSection> {
    let mut sections = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut current_heading: Option<String> = None;
    let mut last_end = 0usize;

    for m in HEADING.find_iter(text) {
        if last_end < m.start() {
            let content = text[last_end..m.start()].trim();
            if !content.is_empty() {
                sections.push(make_section(&stack, &current_heading, content));
            }
        }

        let raw = m.as_str().trim();
        let level = heading_level(raw);
        while stack.len() >= level {
            if stack.pop().is_none() {
                break;
            }
        }
        let cleaned = clean_heading(raw);
        stack.push(cleaned.clone());
        current_heading = Some(cleaned);
        last_end = m.end();
    }

    if last_end < text.len() {
        let content = text[last_end..].trim();
        if !content.is_empty() {
            sections.push(make_section(&stack, &current_heading, content));
        }
    }

    if sections.is_empty() && !text.trim().is_empty() {
        sections.push(TextSection {
            heading: None,
            hierarchy: None,
            content: text.trim().to_string(),
        });
    }

    sections
}

fn make_section(stack: &[String], current_heading: &Option<String>, content: &str) -> TextSection {
    let hierarchy = if stack.is_empty() {
        current_heading.clone()
    } else {
        Some(stack.join(" > "))
    };
    TextSection {
        heading: current_heading.clone(),
        hierarchy,
        content: content.to_string(),
    }
}

/// Heading depth: number of leading `#` for hash headings, numbering depth
/// for numeric ones (`1.` is level 1, `1.2` level 2), 1 otherwise.
fn heading_level(heading: &str) -> usize {
    if heading.starts_with('#') {
        return heading.chars().take_while(|&c| c == '#').count().clamp(1, 6);
    }
    if heading.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        let prefix = heading.split_whitespace().next().unwrap_or("");
        let dots = prefix.matches('.').count();
        // "1." carries a trailing dot but is still a single segment
        return if prefix.ends_with('.') {
            dots.max(1)
        } else {
            dots + 1
        };
    }
    1
}

/// Strip `#` markers from hash headings; numeric and CJK forms stay as-is.
fn clean_heading(heading: &str) -> String {
    if heading.starts_with('#') {
        heading.trim_start_matches('#').trim().to_string()
    } else {
        heading.to_string()
    }
}

/// Stage B: pack a section body into chunks of at most `chunk_size` chars.
pub fn recursive_character_split(
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
) -> Vec<String> {
    let text = text.trim();
    let char_len = text.chars().count();

    if char_len <= chunk_size {
        if char_len >= min_chunk_size {
            return vec![text.to_string()];
        }
        return Vec::new();
    }

    for sep in SEPARATORS {
        if text.contains(sep) {
            let chunks = split_by_separator(text, sep, chunk_size, chunk_overlap, min_chunk_size);
            if !chunks.is_empty() {
                return chunks;
            }
        }
    }

    // No separator present at all: fixed-width slices with overlap stride.
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if piece.chars().count() >= min_chunk_size {
            chunks.push(piece.to_string());
        }
        if end == chars.len() {
            break;
        }
        start = end - chunk_overlap;
    }
    chunks
}

/// Greedily pack separator-delimited segments up to `chunk_size`, seeding
/// each new chunk with the last `chunk_overlap` characters of the previous
/// one.
fn split_by_separator(
    text: &str,
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
) -> Vec<String> {
    let sep_len = separator.chars().count();
    let mut chunks = Vec::new();
    let mut current = String::new();

    for part in text.split(separator) {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }

        let current_len = current.chars().count();
        let part_len = trimmed.chars().count();

        if current_len + part_len + sep_len <= chunk_size {
            if !current.is_empty() {
                current.push_str(separator);
            }
            current.push_str(trimmed);
        } else {
            if current_len >= min_chunk_size {
                chunks.push(current.clone());
            }

            if chunk_overlap > 0 && current_len > chunk_overlap {
                let tail: String = current.chars().skip(current_len - chunk_overlap).collect();
                current = format!("{tail}{separator}{trimmed}");
            } else {
                current = trimmed.to_string();
            }
        }
    }

    if current.chars().count() >= min_chunk_size {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
            min_chunk_size,
        }
    }

    #[test]
    fn small_markdown_doc_two_sections() {
        let text = "# Intro\n\nHello world.\n\n# Usage\n\nRun it.";
        let chunks = chunk_text("doc1", text, &config(500, 50, 3));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].hierarchy.as_deref(), Some("Intro"));
        assert_eq!(chunks[0].content, "Hello world.");
        assert_eq!(chunks[1].hierarchy.as_deref(), Some("Usage"));
        assert_eq!(chunks[1].content, "Run it.");
    }

    #[test]
    fn sibling_headings_replace_each_other() {
        let text = "# A\n\nalpha body\n\n## B\n\nbeta body\n\n## C\n\ngamma body";
        let chunks = chunk_text("doc1", text, &config(500, 0, 1));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].hierarchy.as_deref(), Some("A"));
        assert_eq!(chunks[1].hierarchy.as_deref(), Some("A > B"));
        // B is popped when its sibling C arrives
        assert_eq!(chunks[2].hierarchy.as_deref(), Some("A > C"));
        assert_eq!(chunks[2].heading.as_deref(), Some("C"));
    }

    #[test]
    fn numeric_headings_nest_by_dot_count() {
        let text = "1. Basics\n\nintro text\n\n1.2 Volume\n\nvolume text";
        let sections = split_by_headings(text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].hierarchy.as_deref(), Some("1. Basics"));
        assert_eq!(
            sections[1].hierarchy.as_deref(),
            Some("1. Basics > 1.2 Volume")
        );
    }

    #[test]
    fn content_before_first_heading_has_no_hierarchy() {
        let text = "preamble text\n\n# First\n\nbody";
        let sections = split_by_headings(text);
        assert_eq!(sections[0].heading, None);
        assert_eq!(sections[0].hierarchy, None);
        assert_eq!(sections[0].content, "preamble text");
    }

    #[test]
    fn chunk_indices_are_dense_across_sections() {
        let text = "# A\n\none. two. three. four.\n\n# B\n\nfive. six.";
        let chunks = chunk_text("doc1", text, &config(12, 0, 1));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        assert!(chunks.len() > 2);
    }

    #[test]
    fn chunks_respect_size_bound() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let chunks = recursive_character_split(text, 20, 5, 1);
        for c in &chunks {
            assert!(c.chars().count() <= 20, "chunk too long: {:?}", c);
        }
    }

    #[test]
    fn overlap_seeds_next_chunk() {
        let text = "aaaa bbbb cccc dddd eeee";
        let chunks = recursive_character_split(text, 10, 4, 1);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let prev_tail: String = pair[0]
                .chars()
                .skip(pair[0].chars().count().saturating_sub(4))
                .collect();
            assert!(
                pair[1].starts_with(&prev_tail),
                "expected {:?} to start with {:?}",
                pair[1],
                prev_tail
            );
        }
    }

    #[test]
    fn cjk_sentences_split_on_full_stop() {
        let text = "第一句话很长很长很长。第二句话也很长很长。第三句话结束了。";
        let chunks = recursive_character_split(text, 14, 0, 2);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.chars().count() <= 14);
        }
    }

    #[test]
    fn separatorless_text_falls_back_to_fixed_width() {
        let text: String = std::iter::repeat('x').take(50).collect();
        let chunks = recursive_character_split(&text, 20, 5, 1);
        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));
        // every character of the input appears in some chunk
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 50);
    }

    #[test]
    fn tiny_fragments_below_min_are_dropped() {
        let chunks = recursive_character_split("hi", 100, 0, 10);
        assert!(chunks.is_empty());
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("doc1", "   \n  ", &config(100, 0, 1)).is_empty());
    }

    #[test]
    fn coverage_of_non_heading_text() {
        let text = "# Guide\n\nalpha beta gamma. delta epsilon zeta. eta theta iota.";
        let chunks = chunk_text("doc1", text, &config(25, 0, 1));
        let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
        for word in [
            "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota",
        ] {
            assert!(joined.contains(word), "missing {word}");
        }
    }
}
