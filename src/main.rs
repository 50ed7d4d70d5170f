use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
};

use clap::Parser;
use docseek::{
    ChangeHandler,
    Config,
    DataDir,
    FileMonitor,
    FileScanner,
    IndexManager,
    MonitorConfig,
    ScanStats,
    SearchEngine,
    TextFileParser,
    embedding,
    error::{Error, Result},
    search,
};
use kdam::{BarExt, tqdm};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, JsonArgs, ScanArgs, SearchArgs, WatchArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("DOCSEEK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = load_config(cli.config.as_deref())?;
    let data_dir = DataDir::resolve(
        cli.data_dir.as_deref().or(config.data_dir.as_deref()),
    )?;
    let index = Arc::new(IndexManager::open(
        &data_dir,
        &config.index,
        embedding::from_config(&config.index),
    )?);

    match cli.command {
        Command::Scan(args) => {
            let scanner = build_scanner(&config, &data_dir, index, &args.paths)?;
            cmd_scan(&scanner, &args);
        }
        Command::Rebuild(args) => {
            if !index.rebuild_index() {
                return Err(Error::Io(std::io::Error::other(
                    "index rebuild failed, see the log for details",
                )));
            }
            let scanner = build_scanner(&config, &data_dir, index, &args.paths)?;
            cmd_scan(&scanner, &args);
        }
        Command::Watch(args) => {
            cmd_watch(&config, &data_dir, index, &args)?;
        }
        Command::Search(args) => {
            cmd_search(&config, index, &args)?;
        }
        Command::Stats(JsonArgs { json }) => {
            let stats = index.get_index_stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Data directory: {}", data_dir.root().display());
                println!("Documents: {}", stats.documents);
                println!(
                    "Vectors: {} ({} slots)",
                    stats.vectors, stats.vector_slots
                );
                println!("Full-text size: {}", human_bytes(stats.text_bytes));
                println!("Vector size: {}", human_bytes(stats.vector_bytes));
                println!(
                    "Embeddings: {}",
                    if stats.embedding_enabled { "enabled" } else { "disabled" }
                );
            }
        }
        Command::Validate(JsonArgs { json }) => {
            let report = index.validate_index_integrity();
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Documents: {}", report.documents);
                println!("Duplicate paths: {}", report.duplicate_paths.len());
                println!("Orphan vectors: {}", report.orphan_vectors.len());
                if let Some(v) = &report.vectors {
                    println!(
                        "Vector slots: {} live, {} tombstoned, {} missing",
                        v.live,
                        v.tombstoned,
                        v.missing.len()
                    );
                }
                if report.is_consistent() {
                    println!("Index is consistent.");
                } else {
                    println!("Index is inconsistent; run `docseek rebuild`.");
                }
            }
        }
    }

    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(Error::NotFound {
                kind: "config file",
                name: path.display().to_string(),
            });
        }
        return Config::load(path);
    }
    match xdg::BaseDirectories::with_prefix("docseek")
        .find_config_file("config.toml")
    {
        Some(path) => Config::load(&path),
        None => {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn build_scanner(
    config: &Config,
    data_dir: &DataDir,
    index: Arc<IndexManager>,
    extra_roots: &[PathBuf],
) -> Result<FileScanner> {
    let scanner =
        FileScanner::new(index, Arc::new(TextFileParser::new()), &config.scanner)?
            .with_fingerprint_db(data_dir.fingerprints_db());
    for root in extra_roots {
        if !root.is_dir() {
            return Err(Error::NotFound {
                kind: "directory",
                name: root.display().to_string(),
            });
        }
        scanner.add_root(root);
    }
    if scanner.roots().is_empty() {
        return Err(Error::Config(
            "no scan roots: pass a directory or set scanner.roots".into(),
        ));
    }
    Ok(scanner)
}

/// Run a scan, drawing progress on the main thread.
fn run_scan(scanner: &FileScanner, progress: bool) -> ScanStats {
    if !progress {
        return scanner.scan_and_index();
    }

    let (tx, rx) = mpsc::channel::<u8>();
    std::thread::scope(|s| {
        let worker = s.spawn(move || {
            scanner.scan_and_index_with(|pct| {
                let _ = tx.send(pct);
            })
        });

        let mut pb = tqdm!(total = 100, desc = "Scanning");
        for pct in rx {
            let _ = pb.update_to(pct as usize);
        }
        eprintln!();

        worker.join().unwrap_or_else(|_| {
            tracing::error!("scan thread panicked");
            scanner.stats()
        })
    })
}

fn cmd_scan(scanner: &FileScanner, args: &ScanArgs) {
    let stats = run_scan(scanner, !args.no_progress && !args.json);
    if args.json {
        match serde_json::to_string_pretty(&stats) {
            Ok(out) => println!("{out}"),
            Err(e) => tracing::error!(error = %e, "could not encode stats"),
        }
        return;
    }
    println!(
        "Scanned {} file(s) in {:.1}s: {} indexed, {} unchanged, {} skipped ({})",
        stats.total_files_scanned,
        stats.elapsed.as_secs_f64(),
        stats.total_files_indexed,
        stats.total_files_unchanged,
        stats.total_files_skipped,
        human_bytes(stats.total_bytes_scanned),
    );
    if stats.cancelled {
        println!("Scan was cancelled.");
    }
}

fn cmd_watch(
    config: &Config,
    data_dir: &DataDir,
    index: Arc<IndexManager>,
    args: &WatchArgs,
) -> Result<()> {
    let scanner = Arc::new(build_scanner(config, data_dir, index, &args.paths)?);
    if !args.no_scan {
        let stats = run_scan(&scanner, true);
        println!(
            "Initial scan: {} indexed, {} unchanged, {} skipped",
            stats.total_files_indexed,
            stats.total_files_unchanged,
            stats.total_files_skipped
        );
    }

    let monitor_config = MonitorConfig {
        roots: Vec::new(),
        ..config.monitor.clone()
    };
    let handler: Arc<dyn ChangeHandler> = scanner.clone();
    let monitor = FileMonitor::new(
        handler,
        &monitor_config,
        &config.scanner.exclude_patterns,
    )?;
    let watched: Vec<PathBuf> = if config.monitor.roots.is_empty() {
        scanner.roots()
    } else {
        config.monitor.roots.clone()
    };
    for dir in watched.iter().chain(&args.paths) {
        monitor.add_directory(dir)?;
    }

    monitor.start()?;
    println!(
        "Watching {} director(ies). Press Enter to stop.",
        monitor.directories().len()
    );
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    monitor.stop()?;
    scanner.persist_fingerprints();
    Ok(())
}

fn cmd_search(
    config: &Config,
    index: Arc<IndexManager>,
    args: &SearchArgs,
) -> Result<()> {
    let mut search_config = config.search.clone();
    if let Some(count) = args.count {
        search_config.max_results = count.max(1);
    }
    let engine = SearchEngine::new(index, search_config);

    if args.paths {
        for path in engine.search_by_path(&args.query) {
            println!("{path}");
        }
        return Ok(());
    }

    let report = engine.search_with_stats(&args.query, &args.filters());
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if args.files {
        for hit in &report.results {
            println!("{}", hit.path);
        }
    } else {
        search::format_human(&report.results);
    }
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
