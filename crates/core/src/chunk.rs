//! Text chunker (spec §3 Chunk invariant: "chunks of a file form a
//! contiguous cover; ordinal is 0-based and dense").
//!
//! Grounded on `codescope::semantic.rs::extract_chunks`, which slides a
//! fixed-size window with overlap over a file's lines and estimates tokens
//! by byte length. This generalizes that to arbitrary parsed text instead of
//! source lines.

use crate::types::{Chunk, DocumentFormat, ParsedContent};

/// Parameters controlling how text is split into chunks (§6
/// `processing.chunkSize`, `.overlap`).
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self { chunk_size: 500, overlap: 50 }
    }
}

/// Rough token estimate: ~4 bytes per token, matching
/// `codescope::tokenizer::BytesEstimateTokenizer`'s heuristic for contexts
/// where a real tokenizer is not yet loaded.
pub fn estimate_tokens(text: &str) -> u32 {
    ((text.len() as f32) / 4.0).ceil() as u32
}

/// Split `content` into a dense, 0-based, contiguous-cover sequence of
/// chunks keyed by `document_hash`. Empty text yields a single empty chunk
/// with `token_estimate = 0` (§4.D skip rule: "empty text yields a
/// zero-vector embedding with tokensUsed = 0 and success").
pub fn extract_chunks(document_hash: &str, content: &ParsedContent, params: ChunkParams) -> Vec<Chunk> {
    let text = &content.text;
    if text.is_empty() {
        return vec![Chunk {
            id: format!("{document_hash}:0"),
            document_hash: document_hash.to_string(),
            ordinal: 0,
            start_offset: 0,
            end_offset: 0,
            token_estimate: 0,
            text: String::new(),
        }];
    }

    let bytes = text.as_bytes();
    let step = params.chunk_size.saturating_sub(params.overlap).max(1);
    let mut chunks = Vec::new();
    let mut ordinal = 0u32;
    let mut start = 0usize;

    while start < bytes.len() {
        let mut end = (start + params.chunk_size).min(bytes.len());
        end = nearest_char_boundary(text, end);
        let chunk_text = text[start..end].to_string();
        chunks.push(Chunk {
            id: format!("{document_hash}:{ordinal}"),
            document_hash: document_hash.to_string(),
            ordinal,
            start_offset: start,
            end_offset: end,
            token_estimate: estimate_tokens(&chunk_text),
            text: chunk_text,
        });
        ordinal += 1;
        if end >= bytes.len() {
            break;
        }
        let next_start = start + step;
        start = nearest_char_boundary(text, next_start.max(start + 1));
    }

    chunks
}

fn nearest_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Drop files whose extension is not in the folder's allowed set, before
/// the parse stage ever runs (§4.D skip rule).
pub fn is_extension_allowed(path: &std::path::Path, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    allowed.iter().any(|a| a.eq_ignore_ascii_case(ext))
}

/// Read a file as UTF-8 text, tagging it with its format by extension. Real
/// per-format parsers (pdf, word, ...) are opaque collaborators out of scope
/// (§1); anything not plain-text-decodable is parsed as empty text so the
/// pipeline can still record a zero-vector embedding instead of failing the
/// whole file.
pub fn parse_as_text(path: &std::path::Path) -> std::io::Result<ParsedContent> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let format = DocumentFormat::from_extension(ext);
    let text = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_default(),
        Err(e) => return Err(e),
    };
    Ok(ParsedContent { text, format })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> ParsedContent {
        ParsedContent { text: text.to_string(), format: DocumentFormat::Text }
    }

    #[test]
    fn chunks_are_dense_and_zero_based() {
        let text = "a".repeat(1200);
        let chunks = extract_chunks("hash", &content(&text), ChunkParams { chunk_size: 500, overlap: 50 });
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.ordinal, i as u32);
        }
    }

    #[test]
    fn chunks_form_contiguous_cover() {
        let text = "x".repeat(1000);
        let chunks = extract_chunks("hash", &content(&text), ChunkParams { chunk_size: 300, overlap: 0 });
        assert_eq!(chunks.first().unwrap().start_offset, 0);
        assert_eq!(chunks.last().unwrap().end_offset, text.len());
        for window in chunks.windows(2) {
            assert_eq!(window[0].end_offset, window[1].start_offset);
        }
    }

    #[test]
    fn empty_text_yields_single_zero_token_chunk() {
        let chunks = extract_chunks("hash", &content(""), ChunkParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].token_estimate, 0);
    }

    #[test]
    fn extension_allowlist_is_case_insensitive() {
        let allowed = vec!["MD".to_string()];
        assert!(is_extension_allowed(std::path::Path::new("a.md"), &allowed));
        assert!(!is_extension_allowed(std::path::Path::new("a.txt"), &allowed));
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        assert!(is_extension_allowed(std::path::Path::new("a.bin"), &[]));
    }
}
