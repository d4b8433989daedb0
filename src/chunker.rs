//! Content splitting strategies.
//!
//! Notes get the structural markdown splitter; attachment-extracted text,
//! which has no reliable structure, gets the fixed token window.

/// Structure-aware splitter for markdown note content.
///
/// Splits at ATX headings and blank-line paragraph boundaries, then greedily
/// packs consecutive blocks into chunks of at most `max_chars` characters.
/// A single block longer than `max_chars` is hard-wrapped at character
/// boundaries.
#[derive(Debug, Clone)]
pub struct MarkdownSplitter {
    pub max_chars: usize,
}

impl Default for MarkdownSplitter {
    fn default() -> Self {
        Self { max_chars: 1000 }
    }
}

impl MarkdownSplitter {
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let max_chars = self.max_chars.max(1);
        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut current_chars = 0usize;

        for block in blocks(text) {
            for segment in wrap_chars(&block, max_chars) {
                let seg_chars = segment.chars().count();
                if current_chars == 0 {
                    current = segment;
                    current_chars = seg_chars;
                } else if current_chars + 2 + seg_chars <= max_chars {
                    current.push_str("\n\n");
                    current.push_str(&segment);
                    current_chars += 2 + seg_chars;
                } else {
                    chunks.push(std::mem::take(&mut current));
                    current = segment;
                    current_chars = seg_chars;
                }
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

/// Group lines into structural blocks: a heading line always starts a new
/// block, a blank line ends the current one.
fn blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim_start().is_empty() {
            flush(&mut current, &mut blocks);
            continue;
        }
        if trimmed.trim_start().starts_with('#') {
            flush(&mut current, &mut blocks);
        }
        current.push(trimmed);
    }
    flush(&mut current, &mut blocks);
    blocks
}

fn flush(current: &mut Vec<&str>, blocks: &mut Vec<String>) {
    if !current.is_empty() {
        blocks.push(current.join("\n"));
        current.clear();
    }
}

/// Split `text` into pieces of at most `max_chars` characters, never inside
/// a UTF-8 code point.
fn wrap_chars(text: &str, max_chars: usize) -> Vec<String> {
    let total = text.chars().count();
    if total <= max_chars {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut piece = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        piece.push(ch);
        count += 1;
        if count == max_chars {
            pieces.push(std::mem::take(&mut piece));
            count = 0;
        }
    }
    if !piece.is_empty() {
        pieces.push(piece);
    }
    pieces
}

/// Fixed-window splitter over whitespace tokens, with overlap carried
/// between consecutive windows. Used for attachment-extracted text.
#[derive(Debug, Clone)]
pub struct TokenSplitter {
    pub chunk_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for TokenSplitter {
    fn default() -> Self {
        Self {
            chunk_tokens: 256,
            overlap_tokens: 32,
        }
    }
}

impl TokenSplitter {
    pub fn split_text(&self, text: &str) -> Vec<String> {
        let chunk_tokens = self.chunk_tokens.max(1);
        // Overlap must leave room for forward progress.
        let overlap = self.overlap_tokens.min(chunk_tokens - 1);

        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + chunk_tokens).min(words.len());
            chunks.push(words[start..end].join(" "));
            if end >= words.len() {
                break;
            }
            start = end - overlap;
        }
        chunks
    }
}
