use std::path::Path;

use serde::{Deserialize, Serialize};

/// A document as stored in the indexes. `path` is the unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDocument {
    pub path: String,
    pub filename: String,
    pub content: String,
    pub file_type: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub created_ts: u64,
    /// Seconds since the Unix epoch.
    pub modified_ts: u64,
    pub keywords: Vec<String>,
}

impl IndexedDocument {
    /// Build a document for `path` with the filename derived from it and
    /// everything else empty.
    pub fn new(path: &str, content: impl Into<String>) -> Self {
        let path = normalize_path(path);
        Self {
            filename: filename_of(&path),
            file_type: extension_of(&path),
            path,
            content: content.into(),
            size: 0,
            created_ts: 0,
            modified_ts: 0,
            keywords: Vec::new(),
        }
    }
}

/// Which retrieval mode produced a hit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Text,
    Vector,
    Hybrid,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Text => write!(f, "text"),
            Provenance::Vector => write!(f, "vector"),
            Provenance::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// A ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub filename: String,
    pub content: String,
    pub snippet: String,
    pub file_type: String,
    pub size: u64,
    pub modified_ts: u64,
    pub score: f32,
    pub provenance: Provenance,
    /// Whether the content or filename contains the literal query.
    pub has_query: bool,
}

/// Filters recognized by the retrieval contract.
///
/// Structural filters (`file_types`, date and size ranges) are applied per
/// result after fusion. `whole_word` and `filename_only` shape the full-text
/// query itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Allowed file types: either an extension (`pdf`, `.pdf`) or a
    /// `file_type` value as stored on the document.
    pub file_types: Vec<String>,
    pub modified_from: Option<u64>,
    pub modified_to: Option<u64>,
    pub size_min: Option<u64>,
    pub size_max: Option<u64>,
    pub whole_word: bool,
    pub filename_only: bool,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Check the structural predicates against one hit.
    pub fn matches(&self, hit: &SearchHit) -> bool {
        if !self.file_types.is_empty() {
            let ext = extension_of(&hit.path);
            let allowed = self.file_types.iter().any(|t| {
                let t = t.trim_start_matches('.').to_lowercase();
                t == ext || t == hit.file_type.to_lowercase()
            });
            if !allowed {
                return false;
            }
        }
        if self.modified_from.is_some_and(|from| hit.modified_ts < from) {
            return false;
        }
        if self.modified_to.is_some_and(|to| hit.modified_ts > to) {
            return false;
        }
        if self.size_min.is_some_and(|min| hit.size < min) {
            return false;
        }
        if self.size_max.is_some_and(|max| hit.size > max) {
            return false;
        }
        true
    }
}

/// Canonical string form of a path key: forward slashes, no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    while p.len() > 1 && p.ends_with('/') {
        p.pop();
    }
    p
}

pub fn filename_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Lowercase extension without the dot, or an empty string.
pub fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
