//! Document parsers: binary upload in, canonical text out.
//!
//! Canonical text is Markdown-flavoured plain text: headings keep (or gain)
//! `#` markers so the chunker can recover the section tree, and everything
//! else reads as display-ready prose.
//!
//! | Format | Parser | Notes |
//! |--------|--------|-------|
//! | `pdf` | [`PdfParser`] | position-sorted extraction + structure pass |
//! | `md` / `markdown` / `txt` | [`MarkdownParser`] | event-walk, txt is markdown-lax |

use std::sync::LazyLock;

use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;

use crate::error::DocError;

/// A format-specific text extractor.
pub trait DocumentParser: Send + Sync {
    /// Whether this parser handles the given lowercased file extension.
    fn supports(&self, file_type: &str) -> bool;

    /// Extract canonical text from raw bytes.
    fn parse(&self, bytes: &[u8], filename: &str) -> Result<String, DocError>;
}

/// Find the parser responsible for a file type.
pub fn parser_for(file_type: &str) -> Result<Box<dyn DocumentParser>, DocError> {
    let parsers: Vec<Box<dyn DocumentParser>> =
        vec![Box::new(PdfParser), Box::new(MarkdownParser)];
    parsers
        .into_iter()
        .find(|p| p.supports(file_type))
        .ok_or_else(|| DocError::Process(format!("no parser for file type '{file_type}'")))
}

// ============ PDF ============

/// Bare page-number lines such as `- 12 -` or `3`.
static PAGE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\s*\d+\s*-?$").expect("page number pattern"));

/// Top-level headings: `1. Intro`, `第一章 总则`, `三、范围`.
static PDF_HEADING_L1: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+\.\s+.+|第[一二三四五六七八九十百]+[章节条款]\s*.+|[一二三四五六七八九十]+[、.]\s*.+)$")
        .expect("level-1 heading pattern")
});

/// Second-level headings: `1.2 Volume`, `1.2.3 Detail`.
static PDF_HEADING_L2: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+\.\d+\.?\s+.+|\d+\.\d+\.\d+\.?\s+.+)$").expect("level-2 heading pattern")
});

/// PDF parser built on position-sorted glyph extraction.
pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn supports(&self, file_type: &str) -> bool {
        file_type.eq_ignore_ascii_case("pdf")
    }

    fn parse(&self, bytes: &[u8], filename: &str) -> Result<String, DocError> {
        let raw = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| DocError::Process(format!("PDF extraction failed for {filename}: {e}")))?;
        let text = restructure_pdf_text(&raw);
        tracing::info!(filename, chars = text.len(), "PDF parsed");
        Ok(text)
    }
}

/// Rebuild document structure from flat PDF text.
///
/// Drops bare page numbers, promotes recognizable heading lines to `##` /
/// `###` (padded with blank lines), and normalizes bullet glyphs to `- `.
fn restructure_pdf_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());

    for line in raw.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            out.push('\n');
            continue;
        }
        if PAGE_NUMBER.is_match(trimmed) {
            continue;
        }

        if PDF_HEADING_L2.is_match(trimmed) {
            out.push_str("\n### ");
            out.push_str(trimmed);
            out.push_str("\n\n");
        } else if PDF_HEADING_L1.is_match(trimmed) {
            out.push_str("\n## ");
            out.push_str(trimmed);
            out.push_str("\n\n");
        } else if let Some(rest) = strip_bullet(trimmed) {
            out.push_str("- ");
            out.push_str(rest);
            out.push('\n');
        } else {
            out.push_str(trimmed);
            out.push('\n');
        }
    }

    out.trim().to_string()
}

fn strip_bullet(line: &str) -> Option<&str> {
    let mut chars = line.chars();
    match chars.next() {
        Some('●') | Some('•') | Some('-') | Some('○') => Some(chars.as_str().trim_start()),
        _ => None,
    }
}

// ============ Markdown / plain text ============

/// Markdown parser that walks the event stream and re-emits structure.
///
/// Text nodes come through verbatim, soft/hard breaks become `\n`,
/// paragraphs end with `\n\n`, and headings keep their `#` markers followed
/// by `\n`. Plain-text files go through the same walk (markdown-lax).
pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn supports(&self, file_type: &str) -> bool {
        matches!(
            file_type.to_ascii_lowercase().as_str(),
            "md" | "markdown" | "txt"
        )
    }

    fn parse(&self, bytes: &[u8], filename: &str) -> Result<String, DocError> {
        let source = std::str::from_utf8(bytes)
            .map_err(|e| DocError::Process(format!("{filename} is not valid UTF-8: {e}")))?;
        let text = markdown_to_text(source);
        tracing::info!(filename, chars = text.len(), "Markdown parsed");
        Ok(text)
    }
}

fn markdown_to_text(source: &str) -> String {
    let mut out = String::with_capacity(source.len());

    for event in Parser::new(source) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                if !out.is_empty() && !out.ends_with("\n\n") {
                    out.push('\n');
                }
                for _ in 0..heading_depth(level) {
                    out.push('#');
                }
                out.push(' ');
            }
            Event::End(TagEnd::Heading(_)) => out.push('\n'),
            Event::End(TagEnd::Paragraph) => out.push_str("\n\n"),
            Event::End(TagEnd::Item) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Text(t) => out.push_str(&t),
            Event::Code(t) => out.push_str(&t),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            _ => {}
        }
    }

    out.trim().to_string()
}

fn heading_depth(level: pulldown_cmark::HeadingLevel) -> usize {
    use pulldown_cmark::HeadingLevel::*;
    match level {
        H1 => 1,
        H2 => 2,
        H3 => 3,
        H4 => 4,
        H5 => 5,
        H6 => 6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_registry_dispatch() {
        assert!(parser_for("pdf").is_ok());
        assert!(parser_for("md").is_ok());
        assert!(parser_for("TXT").is_ok());
        assert!(parser_for("docx").is_err());
    }

    #[test]
    fn invalid_pdf_is_process_error() {
        let err = PdfParser.parse(b"not a pdf", "x.pdf").unwrap_err();
        assert!(matches!(err, DocError::Process(_)));
    }

    #[test]
    fn markdown_preserves_heading_markers() {
        let text = MarkdownParser
            .parse(b"# Intro\n\nHello world.\n\n## Usage\n\nRun it.", "x.md")
            .unwrap();
        assert!(text.contains("# Intro"));
        assert!(text.contains("## Usage"));
        assert!(text.contains("Hello world."));
    }

    #[test]
    fn markdown_paragraphs_are_blank_line_separated() {
        let text = MarkdownParser.parse(b"One.\n\nTwo.", "x.md").unwrap();
        assert_eq!(text, "One.\n\nTwo.");
    }

    #[test]
    fn markdown_rejects_invalid_utf8() {
        let err = MarkdownParser.parse(&[0xff, 0xfe, 0x00], "x.md").unwrap_err();
        assert!(matches!(err, DocError::Process(_)));
    }

    #[test]
    fn txt_goes_through_markdown_lax() {
        let text = MarkdownParser
            .parse(b"plain line one\nplain line two", "notes.txt")
            .unwrap();
        assert!(text.contains("plain line one"));
        assert!(text.contains("plain line two"));
    }

    #[test]
    fn pdf_structure_pass_strips_page_numbers() {
        let restructured = restructure_pdf_text("Intro text\n- 3 -\nMore text\n12\n");
        assert!(!restructured.contains("- 3 -"));
        assert!(!restructured.contains("12"));
        assert!(restructured.contains("Intro text"));
    }

    #[test]
    fn pdf_structure_pass_promotes_headings() {
        let restructured = restructure_pdf_text("1. Basics\nbody\n1.2 Volume\nmore\n第一章 总则\n");
        assert!(restructured.contains("## 1. Basics"));
        assert!(restructured.contains("### 1.2 Volume"));
        assert!(restructured.contains("## 第一章 总则"));
    }

    #[test]
    fn pdf_structure_pass_normalizes_bullets() {
        let restructured = restructure_pdf_text("● first\n• second\n○ third\n");
        let lines: Vec<&str> = restructured.lines().collect();
        assert_eq!(lines, vec!["- first", "- second", "- third"]);
    }
}
