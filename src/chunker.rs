//! Token-bounded chunking of oversized embedding content.
//!
//! Splits text into line runs of at most `max_tokens` tokens with
//! `overlap_tokens` of trailing context carried into the next chunk. Spans
//! record line and character ranges so chunk hits can be promoted back onto
//! their parent with a precise matched range.

use std::sync::OnceLock;

use tiktoken_rs::CoreBPE;

/// A chunk of text with its position in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    /// 0-based index of this chunk within its parent.
    pub chunk_index: usize,
    /// 1-based start line (inclusive).
    pub start_line: usize,
    /// 1-based end line (inclusive).
    pub end_line: usize,
    /// 0-based char offset of the chunk start.
    pub start_char: usize,
    /// 0-based char offset one past the chunk end.
    pub end_char: usize,
    pub text: String,
}

static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();

fn tokenizer() -> &'static CoreBPE {
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().expect("failed to load cl100k_base tokenizer"))
}

/// Count tokens using the cl100k_base tokenizer.
pub fn count_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

struct Line {
    number: usize,
    start_char: usize,
    end_char: usize,
    tokens: usize,
    text: String,
}

/// Split `text` into token-bounded chunks along line boundaries.
///
/// A single line longer than `max_tokens` becomes its own oversized chunk
/// rather than being split mid-line.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<ChunkSpan> {
    if text.trim().is_empty() || max_tokens == 0 {
        return Vec::new();
    }

    let mut lines: Vec<Line> = Vec::new();
    let mut offset = 0usize;
    for (idx, raw) in text.split('\n').enumerate() {
        let len = raw.chars().count();
        lines.push(Line {
            number: idx + 1,
            start_char: offset,
            end_char: offset + len,
            tokens: count_tokens(raw),
            text: raw.to_string(),
        });
        offset += len + 1; // the newline
    }

    let mut chunks: Vec<ChunkSpan> = Vec::new();
    let mut current: Vec<usize> = Vec::new(); // indexes into lines
    let mut current_tokens = 0usize;

    let flush = |current: &[usize], chunks: &mut Vec<ChunkSpan>, lines: &[Line]| {
        if current.is_empty() {
            return;
        }
        let first = &lines[current[0]];
        let last = &lines[*current.last().unwrap()];
        let body: Vec<&str> = current.iter().map(|&i| lines[i].text.as_str()).collect();
        let text = body.join("\n");
        if text.trim().is_empty() {
            return;
        }
        chunks.push(ChunkSpan {
            chunk_index: chunks.len(),
            start_line: first.number,
            end_line: last.number,
            start_char: first.start_char,
            end_char: last.end_char,
            text,
        });
    };

    for (idx, line) in lines.iter().enumerate() {
        if current_tokens + line.tokens > max_tokens && !current.is_empty() {
            flush(&current, &mut chunks, &lines);

            // Carry trailing lines worth up to overlap_tokens into the next
            // chunk.
            let mut carried: Vec<usize> = Vec::new();
            let mut carried_tokens = 0usize;
            for &line_idx in current.iter().rev() {
                let t = lines[line_idx].tokens;
                if carried_tokens + t > overlap_tokens {
                    break;
                }
                carried_tokens += t;
                carried.push(line_idx);
            }
            carried.reverse();
            current = carried;
            current_tokens = carried_tokens;
        }
        current.push(idx);
        current_tokens += line.tokens;
    }
    flush(&current, &mut chunks, &lines);
    chunks
}
