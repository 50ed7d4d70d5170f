//! Typed configuration, loaded from TOML and validated once.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable configuration. Components take the section they need by reference
//! instead of looking keys up at runtime.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Extensions indexed when the configuration does not override them.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "txt", "md", "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "csv",
    "json", "xml", "html", "htm", "rtf", "log",
];

pub const DEFAULT_EMBEDDING_MODEL: &str = "lightonai/GTE-ModernColBERT-v1";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub scanner: ScannerConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScannerConfig {
    pub roots: Vec<PathBuf>,
    pub extensions: Vec<String>,
    /// Glob patterns matched against full paths and single path components.
    pub exclude_patterns: Vec<String>,
    pub max_file_size_mb: u64,
    /// Worker threads for parse+index; 0 means available parallelism.
    pub workers: usize,
    pub fingerprint_capacity: usize,
    pub progress_every: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: DEFAULT_EXTENSIONS
                .iter()
                .map(|e| (*e).to_string())
                .collect(),
            exclude_patterns: Vec::new(),
            max_file_size_mb: 100,
            workers: 0,
            fingerprint_capacity: 100_000,
            progress_every: 10,
        }
    }
}

impl ScannerConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub writer_memory_bytes: usize,
    pub embedding_enabled: bool,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    /// Only this many leading characters of a document are embedded.
    pub embedding_max_chars: usize,
    pub snippet_windows: usize,
    pub snippet_window_chars: usize,
    pub highlight_open: String,
    pub highlight_close: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            writer_memory_bytes: 50_000_000,
            embedding_enabled: false,
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedding_dimension: 128,
            embedding_max_chars: 5000,
            snippet_windows: 3,
            snippet_window_chars: 120,
            highlight_open: "<mark>".to_string(),
            highlight_close: "</mark>".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub text_weight: f32,
    pub vector_weight: f32,
    pub hybrid_boost: f32,
    /// Added once per query token found in a result's filename.
    pub filename_bonus: f32,
    pub max_results: usize,
    /// Each retrieval mode fetches `max_results * candidate_multiplier` hits.
    pub candidate_multiplier: usize,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub cache_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_weight: 0.6,
            vector_weight: 0.4,
            hybrid_boost: 1.1,
            filename_bonus: 0.5,
            max_results: 50,
            candidate_multiplier: 3,
            cache_enabled: true,
            cache_ttl_secs: 3600,
            cache_size: 1000,
        }
    }
}

impl SearchConfig {
    /// Returns `(text_weight, vector_weight)` scaled to sum to one.
    ///
    /// A zero weight hands the whole share to the other mode; two zero
    /// weights are treated as an even split.
    pub fn normalized_weights(&self) -> (f32, f32) {
        let (t, v) = (self.text_weight.max(0.0), self.vector_weight.max(0.0));
        match (t == 0.0, v == 0.0) {
            (true, true) => (0.5, 0.5),
            (true, false) => (0.0, 1.0),
            (false, true) => (1.0, 0.0),
            (false, false) => (t / (t + v), v / (t + v)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Trees to watch; empty means "the scanner roots".
    pub roots: Vec<PathBuf>,
    pub ignored_patterns: Vec<String>,
    pub debounce_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            ignored_patterns: Vec::new(),
            debounce_ms: 500,
        }
    }
}

impl Config {
    /// Load and validate a configuration file. A missing file yields the
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "config file not found, using defaults"
            );
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        if !s.text_weight.is_finite() || s.text_weight < 0.0 {
            return Err(invalid("search.text_weight", "must be >= 0"));
        }
        if !s.vector_weight.is_finite() || s.vector_weight < 0.0 {
            return Err(invalid("search.vector_weight", "must be >= 0"));
        }
        if !s.hybrid_boost.is_finite() || s.hybrid_boost < 1.0 {
            return Err(invalid("search.hybrid_boost", "must be >= 1.0"));
        }
        if !s.filename_bonus.is_finite() || s.filename_bonus < 0.0 {
            return Err(invalid("search.filename_bonus", "must be >= 0"));
        }
        if s.max_results == 0 {
            return Err(invalid("search.max_results", "must be > 0"));
        }
        if s.candidate_multiplier == 0 {
            return Err(invalid("search.candidate_multiplier", "must be > 0"));
        }
        if self.scanner.max_file_size_mb == 0 {
            return Err(invalid("scanner.max_file_size_mb", "must be > 0"));
        }
        if self.scanner.fingerprint_capacity == 0 {
            return Err(invalid("scanner.fingerprint_capacity", "must be > 0"));
        }
        if self.scanner.progress_every == 0 {
            return Err(invalid("scanner.progress_every", "must be > 0"));
        }
        if self.index.embedding_dimension == 0 {
            return Err(invalid("index.embedding_dimension", "must be > 0"));
        }
        if self.index.writer_memory_bytes < 15_000_000 {
            return Err(invalid(
                "index.writer_memory_bytes",
                "must be at least 15000000",
            ));
        }
        if self.index.snippet_window_chars == 0 {
            return Err(invalid("index.snippet_window_chars", "must be > 0"));
        }
        for pattern in self
            .scanner
            .exclude_patterns
            .iter()
            .chain(&self.monitor.ignored_patterns)
        {
            globset::Glob::new(pattern).map_err(|e| {
                invalid("exclude pattern", &format!("{pattern:?}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Trees the monitor should watch.
    pub fn monitor_roots(&self) -> &[PathBuf] {
        if self.monitor.roots.is_empty() {
            &self.scanner.roots
        } else {
            &self.monitor.roots
        }
    }
}

fn invalid(key: &str, why: &str) -> Error {
    Error::Config(format!("{key}: {why}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.search.max_results, 50);
        assert_eq!(config.monitor.debounce_ms, 500);
        assert!(config.scanner.extensions.contains(&"md".to_string()));
        assert!(!config.index.embedding_enabled);
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            data_dir = "/tmp/docseek"

            [scanner]
            roots = ["/srv/docs"]
            exclude_patterns = ["*.log"]
            workers = 2

            [search]
            hybrid_boost = 1.5
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/docseek")));
        assert_eq!(config.scanner.roots, vec![PathBuf::from("/srv/docs")]);
        assert_eq!(config.scanner.worker_count(), 2);
        assert_eq!(config.search.hybrid_boost, 1.5);
        assert_eq!(config.monitor_roots(), &[PathBuf::from("/srv/docs")]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("[search]\nmystery = 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn hybrid_boost_below_one_is_invalid() {
        let err = Config::from_toml_str("[search]\nhybrid_boost = 0.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("search.hybrid_boost"));
    }

    #[test]
    fn bad_glob_is_invalid() {
        let err =
            Config::from_toml_str("[scanner]\nexclude_patterns = [\"a[\"]\n")
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn weights_are_normalized() {
        let mut search = SearchConfig::default();
        let (t, v) = search.normalized_weights();
        assert!((t - 0.6).abs() < 1e-6);
        assert!((v - 0.4).abs() < 1e-6);

        search.text_weight = 0.0;
        assert_eq!(search.normalized_weights(), (0.0, 1.0));

        search.vector_weight = 0.0;
        assert_eq!(search.normalized_weights(), (0.5, 0.5));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(config.search.cache_size, 1000);
    }
}
