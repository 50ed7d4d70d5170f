use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docseek::SearchFilters;

#[derive(Debug, Parser)]
#[command(
    name = "docseek",
    about = "Hybrid full-text and semantic search over local documents"
)]
pub struct Cli {
    /// Configuration file (defaults to $XDG_CONFIG_HOME/docseek/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index new and changed files under the scan roots
    Scan(ScanArgs),
    /// Scan, then keep the index in sync with filesystem changes
    Watch(WatchArgs),
    /// Search the index
    Search(SearchArgs),
    /// Show document and vector counts and on-disk sizes
    Stats(JsonArgs),
    /// Drop both indexes and re-ingest every scan root
    Rebuild(ScanArgs),
    /// Check that the vector metadata and the full-text index agree
    Validate(JsonArgs),
}

#[derive(Debug, Parser)]
pub struct ScanArgs {
    /// Directories to scan in addition to the configured roots
    pub paths: Vec<PathBuf>,

    /// Do not draw a progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Print the scan statistics as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct WatchArgs {
    /// Directories to watch in addition to the configured roots
    pub paths: Vec<PathBuf>,

    /// Skip the initial scan
    #[arg(long)]
    pub no_scan: bool,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query, or a glob with --paths
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Match the query as a glob against indexed paths instead
    #[arg(long)]
    pub paths: bool,

    /// Only these file types (repeatable, e.g. -t md -t pdf)
    #[arg(short = 't', long = "type")]
    pub file_types: Vec<String>,

    /// Modified at or after this Unix timestamp
    #[arg(long)]
    pub modified_from: Option<u64>,

    /// Modified at or before this Unix timestamp
    #[arg(long)]
    pub modified_to: Option<u64>,

    /// Minimum size in bytes
    #[arg(long)]
    pub min_size: Option<u64>,

    /// Maximum size in bytes
    #[arg(long)]
    pub max_size: Option<u64>,

    /// Match whole words only
    #[arg(long)]
    pub whole_word: bool,

    /// Match against file names only
    #[arg(long)]
    pub filename_only: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Output only file paths (one per line)
    #[arg(long)]
    pub files: bool,
}

impl SearchArgs {
    pub fn filters(&self) -> SearchFilters {
        SearchFilters {
            file_types: self.file_types.clone(),
            modified_from: self.modified_from,
            modified_to: self.modified_to,
            size_min: self.min_size,
            size_max: self.max_size,
            whole_word: self.whole_word,
            filename_only: self.filename_only,
        }
    }
}

#[derive(Debug, Parser)]
pub struct JsonArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_filters() {
        let cli = Cli::parse_from([
            "docseek",
            "search",
            "quarterly report",
            "-t",
            "pdf",
            "-t",
            "md",
            "--max-size",
            "1000",
            "--whole-word",
        ]);
        match cli.command {
            Command::Search(args) => {
                let filters = args.filters();
                assert_eq!(args.query, "quarterly report");
                assert_eq!(filters.file_types, vec!["pdf", "md"]);
                assert_eq!(filters.size_max, Some(1000));
                assert!(filters.whole_word);
                assert!(!filters.filename_only);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_scan_defaults() {
        let cli = Cli::parse_from(["docseek", "-vv", "scan", "/docs"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Scan(args) => {
                assert_eq!(args.paths, vec![PathBuf::from("/docs")]);
                assert!(!args.no_progress);
            }
            _ => panic!("expected scan command"),
        }
    }
}
