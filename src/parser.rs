//! Text extraction seam.
//!
//! Format-specific extraction (PDF, office documents, ...) lives behind the
//! [`DocumentParser`] trait. The built-in [`TextFileParser`] handles plain
//! text formats by trying an ordered list of decoding strategies.

use std::path::{Path, PathBuf};

use crate::document::extension_of;

/// Prefix of the error string returned by text-returning extractors that
/// decline a file instead of failing.
pub const SENTINEL_PREFIX: &str = "error:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("could not decode text: {0}")]
    Undecodable(PathBuf),

    #[error("read failed for {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// An extractor answered with a sentinel string.
    #[error("extractor declined: {0}")]
    Declined(String),
}

impl ParseError {
    /// Whether `text` is a sentinel error rather than extracted content.
    pub fn is_sentinel(text: &str) -> bool {
        text.trim_start()
            .get(..SENTINEL_PREFIX.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(SENTINEL_PREFIX))
    }

    /// Turn a sentinel-style answer into a typed result.
    pub fn check(text: String) -> Result<String, ParseError> {
        if Self::is_sentinel(&text) {
            let reason = text.trim_start()[SENTINEL_PREFIX.len()..]
                .trim()
                .to_string();
            return Err(ParseError::Declined(reason));
        }
        Ok(text)
    }
}

/// Extracts indexable text from a file.
///
/// Implementations must not panic on content they do not handle; they
/// return a [`ParseError`] and the caller skips the file.
pub trait DocumentParser: Send + Sync {
    fn extract_text(&self, path: &Path) -> Result<String, ParseError>;
}

impl<F> DocumentParser for F
where
    F: Fn(&Path) -> Result<String, ParseError> + Send + Sync,
{
    fn extract_text(&self, path: &Path) -> Result<String, ParseError> {
        self(path)
    }
}

/// Extensions [`TextFileParser`] accepts.
pub const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "json", "xml", "html", "htm", "log", "rtf",
    "rst", "toml", "yaml", "yml",
];

type Decoder = fn(&[u8]) -> Option<String>;

/// Plain text parser with ordered decoding strategies: strict UTF-8, then
/// UTF-16 with a byte-order mark, then lossy UTF-8.
pub struct TextFileParser {
    strategies: Vec<(&'static str, Decoder)>,
}

impl Default for TextFileParser {
    fn default() -> Self {
        Self {
            strategies: vec![
                ("utf-8", decode_utf8),
                ("utf-16", decode_utf16_bom),
                ("utf-8-lossy", decode_lossy),
            ],
        }
    }
}

impl TextFileParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports(path: &Path) -> bool {
        TEXT_EXTENSIONS.contains(&extension_of(&path.to_string_lossy()).as_str())
    }

    fn decode(&self, path: &Path, bytes: &[u8]) -> Result<String, ParseError> {
        for (name, decode) in &self.strategies {
            if let Some(text) = decode(bytes) {
                tracing::trace!(path = %path.display(), strategy = name, "decoded");
                return Ok(text);
            }
        }
        Err(ParseError::Undecodable(path.to_path_buf()))
    }
}

impl DocumentParser for TextFileParser {
    fn extract_text(&self, path: &Path) -> Result<String, ParseError> {
        if !path.is_file() {
            return Err(ParseError::NotFound(path.to_path_buf()));
        }
        if !Self::supports(path) {
            return Err(ParseError::Unsupported(
                extension_of(&path.to_string_lossy()),
            ));
        }
        let bytes = std::fs::read(path).map_err(|e| ParseError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let text = self.decode(path, &bytes)?;

        let ext = extension_of(&path.to_string_lossy());
        if matches!(ext.as_str(), "html" | "htm" | "xml") {
            return Ok(strip_markup(&text));
        }
        Ok(text)
    }
}

fn decode_utf8(bytes: &[u8]) -> Option<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    std::str::from_utf8(bytes).ok().map(str::to_string)
}

fn decode_utf16_bom(bytes: &[u8]) -> Option<String> {
    let (body, little) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (rest, true),
        [0xFE, 0xFF, rest @ ..] => (rest, false),
        _ => return None,
    };
    if body.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

fn decode_lossy(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Drop tags and collapse the whitespace they leave behind.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
