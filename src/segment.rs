//! Script-aware text normalization.
//!
//! Latin-script text is left to the full-text tokenizers. Text containing
//! ideographic or syllabic scripts (no whitespace between words) is segmented
//! into words with jieba and re-joined with spaces, so that a plain whitespace
//! tokenizer sees one token per word. Those scripts additionally get a
//! char-gram form: one token per character, enabling single-character
//! substring matches.

use jieba_rs::Jieba;

/// Word segmenter shared by indexing and query normalization.
pub struct Segmenter {
    jieba: Jieba,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Segmenter {
    pub fn new() -> Self {
        Self {
            jieba: Jieba::new(),
        }
    }

    /// Segment `text` into a space-joined token string.
    ///
    /// Text without any non-whitespace-delimited script is returned as-is.
    pub fn segment(&self, text: &str) -> String {
        if !has_unspaced_script(text) {
            return text.to_string();
        }
        self.jieba
            .cut(text, true)
            .into_iter()
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Normalize a query into lowercase search tokens.
    ///
    /// Query syntax characters are stripped, duplicates removed, order kept.
    pub fn query_tokens(&self, query: &str) -> Vec<String> {
        let segmented = self.segment(query);
        let mut tokens: Vec<String> = Vec::new();
        for raw in segmented.split_whitespace() {
            for piece in raw.split(|c: char| !c.is_alphanumeric()) {
                if piece.is_empty() {
                    continue;
                }
                let token = piece.to_lowercase();
                if !tokens.contains(&token) {
                    tokens.push(token);
                }
            }
        }
        tokens
    }
}

impl std::fmt::Debug for Segmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segmenter").finish_non_exhaustive()
    }
}

/// Characters of scripts that do not separate words with whitespace.
pub fn is_unspaced_script(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0x0E00..=0x0E7F    // Thai
        | 0x20000..=0x2A6DF  // CJK Extension B
    )
}

pub fn has_unspaced_script(text: &str) -> bool {
    text.chars().any(is_unspaced_script)
}

/// One lowercase token per unspaced-script character, space-joined.
pub fn char_grams(text: &str) -> String {
    let mut out = String::new();
    for c in text.chars().filter(|c| is_unspaced_script(*c)) {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push(c);
    }
    out
}

/// Distinct unspaced-script characters of `text`, in order of appearance.
pub fn distinct_grams(text: &str) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for c in text.chars().filter(|c| is_unspaced_script(*c)) {
        let s = c.to_string();
        if !seen.contains(&s) {
            seen.push(s);
        }
    }
    seen
}
