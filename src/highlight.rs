//! Snippet extraction with highlighted keyword matches.
//!
//! Matching works on chars, not bytes. Keywords from unspaced scripts are
//! matched against the content with whitespace removed, because upstream
//! text extraction (PDF in particular) likes to put spaces between
//! ideographs. Latin-script keywords are matched in place and widened to
//! the whole word they occur in.

use crate::{config::IndexConfig, segment::is_unspaced_script};

/// Keywords beyond this many are ignored when scoring windows.
const MAX_KEYWORDS: usize = 64;

/// Stop collecting matches for a keyword after this many occurrences.
const MAX_MATCHES_PER_KEYWORD: usize = 256;

/// Extra window score for containing the literal query.
const LITERAL_BONUS: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snippet {
    pub text: String,
    /// At least one highlight marker was emitted.
    pub highlighted: bool,
    /// The content contains the literal query (case-insensitive).
    pub contains_query: bool,
}

#[derive(Debug, Clone)]
pub struct Highlighter {
    windows: usize,
    window_chars: usize,
    open: String,
    close: String,
}

#[derive(Debug, Clone, Copy)]
struct Match {
    start: usize,
    end: usize,
    keywords: u64,
    literal: bool,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: usize,
    end: usize,
    score: u32,
}

impl Default for Highlighter {
    fn default() -> Self {
        Self::from_config(&IndexConfig::default())
    }
}

impl Highlighter {
    pub fn new(
        windows: usize,
        window_chars: usize,
        open: impl Into<String>,
        close: impl Into<String>,
    ) -> Self {
        Self {
            windows: windows.max(1),
            window_chars: window_chars.max(1),
            open: open.into(),
            close: close.into(),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(
            config.snippet_windows,
            config.snippet_window_chars,
            config.highlight_open.clone(),
            config.highlight_close.clone(),
        )
    }

    pub fn open_marker(&self) -> &str {
        &self.open
    }

    /// Build a snippet of `content` around occurrences of `keywords` and of
    /// the literal `query`.
    ///
    /// Falls back to a plain leading excerpt when nothing matches.
    pub fn snippet(
        &self,
        content: &str,
        query: &str,
        keywords: &[String],
    ) -> Snippet {
        let chars: Vec<char> = content.chars().collect();
        if chars.is_empty() {
            return Snippet::default();
        }
        let lower: Vec<char> = chars.iter().map(|c| lower_char(*c)).collect();

        let (matches, contains_query) =
            collect_matches(&lower, query, keywords);
        if matches.is_empty() {
            return Snippet {
                text: self.leading_excerpt(&chars),
                highlighted: false,
                contains_query,
            };
        }

        let windows = self.select_windows(&chars, &matches);
        let mut parts = Vec::with_capacity(windows.len());
        for w in &windows {
            parts.push(self.render(&chars, &matches, w));
        }

        let mut text = String::new();
        if windows.first().is_some_and(|w| w.start > 0) {
            text.push_str("...");
        }
        text.push_str(&parts.join(" ... "));
        if windows.last().is_some_and(|w| w.end < chars.len()) {
            text.push_str("...");
        }

        Snippet {
            text,
            highlighted: true,
            contains_query,
        }
    }

    fn leading_excerpt(&self, chars: &[char]) -> String {
        let limit = self.window_chars * 2;
        let mut text: String =
            chars.iter().take(limit).map(|c| flatten(*c)).collect();
        if chars.len() > limit {
            text.push_str("...");
        }
        text
    }

    fn select_windows(&self, chars: &[char], matches: &[Match]) -> Vec<Window> {
        let len = chars.len();
        let width = self.window_chars;

        let mut candidates: Vec<Window> = matches
            .iter()
            .map(|m| {
                let center = (m.start + m.end) / 2;
                let mut start = center.saturating_sub(width / 2);
                let mut end = (start + width).min(len);
                if end - start < width {
                    start = end.saturating_sub(width);
                }
                end = end.max(m.end);
                start = start.min(m.start);
                Window {
                    start,
                    end,
                    score: window_score(matches, start, end),
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score.cmp(&a.score).then(a.start.cmp(&b.start))
        });

        let mut chosen: Vec<Window> = Vec::new();
        for c in candidates {
            if chosen.len() >= self.windows {
                break;
            }
            if chosen.iter().all(|w| c.end <= w.start || w.end <= c.start) {
                chosen.push(c);
            }
        }
        chosen.sort_by_key(|w| w.start);

        for w in &mut chosen {
            trim_to_punctuation(chars, matches, w);
        }
        chosen
    }

    fn render(&self, chars: &[char], matches: &[Match], w: &Window) -> String {
        let mut out = String::new();
        let mut pos = w.start;
        for m in matches {
            if m.end <= w.start || m.start >= w.end {
                continue;
            }
            let start = m.start.max(w.start);
            let end = m.end.min(w.end);
            out.extend(chars[pos..start].iter().map(|c| flatten(*c)));
            out.push_str(&self.open);
            out.extend(chars[start..end].iter().map(|c| flatten(*c)));
            out.push_str(&self.close);
            pos = end;
        }
        out.extend(chars[pos..w.end].iter().map(|c| flatten(*c)));
        out.trim().to_string()
    }
}

fn collect_matches(
    lower: &[char],
    query: &str,
    keywords: &[String],
) -> (Vec<Match>, bool) {
    let mut matches = Vec::new();

    // Non-whitespace chars and their positions, built on first use.
    let mut squeezed: Option<(Vec<char>, Vec<usize>)> = None;

    for (i, kw) in keywords.iter().take(MAX_KEYWORDS).enumerate() {
        let needle: Vec<char> = kw
            .chars()
            .map(lower_char)
            .filter(|c| !c.is_whitespace())
            .collect();
        if needle.is_empty() {
            continue;
        }
        let bit = 1u64 << i;

        if needle.iter().any(|c| is_unspaced_script(*c)) {
            let (sq, positions) = squeezed.get_or_insert_with(|| {
                let mut sq = Vec::new();
                let mut positions = Vec::new();
                for (idx, c) in lower.iter().enumerate() {
                    if !c.is_whitespace() {
                        sq.push(*c);
                        positions.push(idx);
                    }
                }
                (sq, positions)
            });
            for at in find_all(sq, &needle) {
                matches.push(Match {
                    start: positions[at],
                    end: positions[at + needle.len() - 1] + 1,
                    keywords: bit,
                    literal: false,
                });
            }
        } else {
            for at in find_all(lower, &needle) {
                let (start, end) = expand_word(lower, at, at + needle.len());
                matches.push(Match {
                    start,
                    end,
                    keywords: bit,
                    literal: false,
                });
            }
        }
    }

    let literal: Vec<char> = query.trim().chars().map(lower_char).collect();
    let mut contains_query = false;
    if !literal.is_empty() {
        for at in find_all(lower, &literal) {
            contains_query = true;
            matches.push(Match {
                start: at,
                end: at + literal.len(),
                keywords: 0,
                literal: true,
            });
        }
    }

    (merge(matches), contains_query)
}

/// Start offsets of non-overlapping occurrences of `needle` in `hay`.
fn find_all(hay: &[char], needle: &[char]) -> Vec<usize> {
    let mut found = Vec::new();
    if needle.is_empty() || needle.len() > hay.len() {
        return found;
    }
    let mut i = 0;
    while i + needle.len() <= hay.len() {
        if hay[i..i + needle.len()] == *needle {
            found.push(i);
            if found.len() >= MAX_MATCHES_PER_KEYWORD {
                break;
            }
            i += needle.len();
        } else {
            i += 1;
        }
    }
    found
}

fn is_word_char(c: char) -> bool {
    (c.is_alphanumeric() && !is_unspaced_script(c)) || c == '_'
}

fn expand_word(lower: &[char], mut start: usize, mut end: usize) -> (usize, usize) {
    while start > 0 && is_word_char(lower[start - 1]) {
        start -= 1;
    }
    while end < lower.len() && is_word_char(lower[end]) {
        end += 1;
    }
    (start, end)
}

fn merge(mut matches: Vec<Match>) -> Vec<Match> {
    matches.sort_by_key(|m| (m.start, m.end));
    let mut merged: Vec<Match> = Vec::with_capacity(matches.len());
    for m in matches {
        match merged.last_mut() {
            Some(last) if m.start < last.end => {
                last.end = last.end.max(m.end);
                last.keywords |= m.keywords;
                last.literal |= m.literal;
            }
            _ => merged.push(m),
        }
    }
    merged
}

fn window_score(matches: &[Match], start: usize, end: usize) -> u32 {
    let mut keywords = 0u64;
    let mut literal = false;
    for m in matches.iter().filter(|m| m.start >= start && m.end <= end) {
        keywords |= m.keywords;
        literal |= m.literal;
    }
    keywords.count_ones() + if literal { LITERAL_BONUS } else { 0 }
}

fn is_boundary(c: char) -> bool {
    matches!(
        c,
        '.' | '!' | '?' | ';' | ',' | ':' | '\n' | '。' | '！' | '？' | '；'
            | '，' | '：' | '、'
    )
}

/// Pull window edges in to the nearest punctuation that keeps every match
/// inside the window.
fn trim_to_punctuation(chars: &[char], matches: &[Match], w: &mut Window) {
    let inside = matches.iter().filter(|m| m.start < w.end && m.end > w.start);
    let (mut first, mut last) = (w.end, w.start);
    for m in inside {
        first = first.min(m.start.max(w.start));
        last = last.max(m.end.min(w.end));
    }
    if first >= last {
        return;
    }

    if w.start > 0
        && let Some(p) = chars[w.start..first].iter().rposition(|c| is_boundary(*c))
    {
        w.start += p + 1;
    }
    while w.start < first && chars[w.start].is_whitespace() {
        w.start += 1;
    }

    if w.end < chars.len()
        && let Some(p) = chars[last..w.end].iter().position(|c| is_boundary(*c))
    {
        w.end = last + p + 1;
    }
}

fn lower_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn flatten(c: char) -> char {
    if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hl() -> Highlighter {
        Highlighter::new(2, 40, "<b>", "</b>")
    }

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn highlights_keyword() {
        let s = hl().snippet("alpha beta gamma", "beta", &kw(&["beta"]));
        assert!(s.highlighted);
        assert!(s.contains_query);
        assert_eq!(s.text, "alpha <b>beta</b> gamma");
    }

    #[test]
    fn expands_latin_match_to_whole_word() {
        let s = hl().snippet("the programming language", "program", &kw(&["program"]));
        assert!(s.text.contains("<b>programming</b>"), "{}", s.text);
    }

    #[test]
    fn tolerates_spaces_between_ideographs() {
        let s = hl().snippet("这是 项 目 报 告 的内容", "报告", &kw(&["报告"]));
        assert!(s.highlighted);
        assert!(s.text.contains("<b>报 告</b>"), "{}", s.text);
    }

    #[test]
    fn literal_query_is_highlighted_without_tokens() {
        let s = hl().snippet("use c++ daily", "c++", &[]);
        assert!(s.highlighted);
        assert!(s.text.contains("<b>c++</b>"), "{}", s.text);
    }

    #[test]
    fn falls_back_to_leading_excerpt() {
        let content = "x".repeat(200);
        let s = hl().snippet(&content, "zzz", &kw(&["zzz"]));
        assert!(!s.highlighted);
        assert!(!s.contains_query);
        assert_eq!(s.text.len(), 80 + 3);
        assert!(s.text.ends_with("..."));
    }

    #[test]
    fn prefers_window_covering_more_keywords() {
        let filler = "lorem ipsum dolor sit amet ".repeat(10);
        let content =
            format!("rust alone here. {filler} rust and tantivy together. {filler}");
        let h = Highlighter::new(1, 40, "<b>", "</b>");
        let s = h.snippet(&content, "rust tantivy", &kw(&["rust", "tantivy"]));
        assert!(s.text.contains("<b>tantivy</b>"), "{}", s.text);
        assert!(s.text.contains("<b>rust</b>"), "{}", s.text);
    }

    #[test]
    fn windows_do_not_overlap() {
        let filler = "word ".repeat(30);
        let content = format!("key one. {filler} key two. {filler} key three.");
        let s = hl().snippet(&content, "key", &kw(&["key"]));
        assert_eq!(s.text.matches("<b>key</b>").count(), 2, "{}", s.text);
    }

    #[test]
    fn trims_window_start_to_punctuation() {
        let content = "Intro sentence here. The target word appears now and more";
        let h = Highlighter::new(1, 40, "[", "]");
        let s = h.snippet(content, "target", &kw(&["target"]));
        assert!(s.text.contains("The [target]"), "{}", s.text);
        assert!(!s.text.contains("Intro"), "{}", s.text);
    }

    #[test]
    fn empty_content_gives_empty_snippet() {
        assert_eq!(hl().snippet("", "q", &kw(&["q"])), Snippet::default());
    }
}
