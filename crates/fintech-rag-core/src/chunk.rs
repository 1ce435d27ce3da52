//! Paragraph-boundary splitter for long document payloads.
//!
//! Filings, research notes and other documents arrive as whole texts but are
//! indexed as one change event per chunk, so a re-upload of a 90-page PDF
//! only re-embeds the chunks whose text actually changed.
//!
//! # Algorithm
//!
//! 1. The token budget is converted to a character budget (4 chars/token).
//! 2. Paragraphs (`\n\n`-separated) are packed greedily into the current chunk.
//! 3. A paragraph larger than the budget is cut at the last newline or space
//!    before the budget, falling back to a hard cut on a char boundary.
//! 4. Non-empty input always yields at least one chunk; empty input yields none.
//!
//! ```rust
//! use fintech_rag_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Q3 revenue rose.\n\nGuidance unchanged.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

/// Rough characters-per-token ratio used to size chunks.
const CHARS_PER_TOKEN: usize = 4;

/// One piece of a document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Contiguous, 0-based position within the document.
    pub index: usize,
    pub text: String,
}

/// Split `text` into chunks of at most `max_tokens` (approximate).
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars));
            continue;
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| TextChunk { index, text })
        .collect()
}

/// Cut an oversized paragraph into pieces of at most `max_chars` bytes,
/// preferring whitespace boundaries.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;
    while !rest.is_empty() {
        if rest.len() <= max_chars {
            out.push(rest.trim().to_string());
            break;
        }
        let limit = floor_char_boundary(rest, max_chars);
        let cut = rest[..limit]
            .rfind(['\n', ' '])
            .map(|pos| pos + 1)
            .unwrap_or(limit);
        // a single char wider than max_chars still has to make progress
        let cut = if cut == 0 {
            rest.chars().next().map(char::len_utf8).unwrap_or(rest.len())
        } else {
            cut
        };
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }
    out.retain(|p| !p.is_empty());
    out
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
