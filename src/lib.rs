//! docseek - a local hybrid document retrieval engine.
//!
//! docseek keeps a full-text index ([Tantivy](https://github.com/quickwit-oss/tantivy))
//! and an optional vector index ([usearch](https://github.com/unum-cloud/usearch))
//! in sync with a set of directories, and answers queries by fusing both
//! rankings.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use docseek::{
//!     Config, DataDir, FileScanner, IndexManager, SearchEngine, SearchFilters,
//!     TextFileParser, embedding,
//! };
//!
//! let config = Config::default();
//! let data_dir = DataDir::resolve(None).unwrap();
//! let index = Arc::new(
//!     IndexManager::open(&data_dir, &config.index, embedding::from_config(&config.index))
//!         .unwrap(),
//! );
//!
//! let scanner = FileScanner::new(
//!     Arc::clone(&index),
//!     Arc::new(TextFileParser::new()),
//!     &config.scanner,
//! )
//! .unwrap();
//! scanner.add_root(std::path::Path::new("/home/me/notes"));
//! scanner.scan_and_index();
//!
//! let engine = SearchEngine::new(index, config.search.clone());
//! for hit in engine.search("quarterly report", &SearchFilters::default()) {
//!     println!("{} ({:.3}, {})", hit.path, hit.score, hit.provenance);
//! }
//! ```

pub mod config;
pub mod data_dir;
pub mod document;
pub mod embedding;
pub mod error;
pub mod fingerprint;
pub mod highlight;
pub mod index_manager;
pub mod monitor;
pub mod parser;
pub mod rules;
pub mod scanner;
pub mod search;
pub mod segment;
pub mod text_index;
pub mod vector_store;

pub use config::{
    Config,
    IndexConfig,
    MonitorConfig,
    ScannerConfig,
    SearchConfig,
};
pub use data_dir::DataDir;
pub use document::{IndexedDocument, Provenance, SearchFilters, SearchHit};
pub use embedding::{Embedder, HashingEmbedder};
pub use error::{Error, Result};
pub use index_manager::{IndexManager, IndexStats, IntegrityReport};
pub use monitor::{ChangeHandler, FileMonitor};
pub use parser::{DocumentParser, ParseError, TextFileParser};
pub use scanner::{FileOutcome, FileScanner, ScanStats};
pub use search::{SearchEngine, SearchReport};
