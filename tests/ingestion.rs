use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use docseek::{
    ChangeHandler,
    FileMonitor,
    FileScanner,
    HashingEmbedder,
    IndexConfig,
    IndexManager,
    MonitorConfig,
    ScannerConfig,
    SearchConfig,
    SearchEngine,
    SearchFilters,
    TextFileParser,
    monitor::{Change, apply},
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn scanner(root: &Path) -> Result<FileScanner, Box<dyn std::error::Error>> {
    let index = Arc::new(IndexManager::in_memory(
        &IndexConfig {
            writer_memory_bytes: 15_000_000,
            ..IndexConfig::default()
        },
        Some(Arc::new(HashingEmbedder::new(64))),
    )?);
    let config = ScannerConfig {
        workers: 2,
        exclude_patterns: vec!["private*".to_string()],
        ..ScannerConfig::default()
    };
    let scanner = FileScanner::new(index, Arc::new(TextFileParser::new()), &config)?;
    scanner.add_root(root);
    Ok(scanner)
}

fn fixture(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root.join("sub"))?;
    std::fs::write(root.join("alpha.txt"), "alpha apples")?;
    std::fs::write(root.join("beta.md"), "# Beta\n\nbananas")?;
    std::fs::write(root.join("gamma.csv"), "name,fruit\ngamma,cherries")?;
    std::fs::write(root.join("sub/delta.txt"), "delta dates")?;
    std::fs::write(root.join("sub/epsilon.log"), "epsilon elderberries")?;
    std::fs::write(root.join("private-notes.txt"), "do not index")?;
    std::fs::write(root.join("scratch.tmp"), "temporary")?;
    Ok(())
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    done()
}

#[test]
fn scan_counts_indexed_and_skipped_files() -> TestResult {
    let tmp = tempfile::tempdir()?;
    fixture(tmp.path())?;
    let scanner = scanner(tmp.path())?;

    let progress = Mutex::new(Vec::new());
    let stats = scanner.scan_and_index_with(|pct| {
        progress.lock().unwrap().push(pct);
    });

    assert_eq!(stats.total_files_indexed, 5);
    assert!(stats.total_files_skipped >= 2);
    assert_eq!(stats.total_files_scanned, 7);
    assert!(stats.total_bytes_scanned > 0);
    assert_eq!(scanner.index().get_index_stats().documents, 5);
    assert!(progress.lock().unwrap().contains(&100));
    assert_eq!(scanner.stats(), stats);
    Ok(())
}

#[test]
fn rescanning_unchanged_files_mutates_nothing() -> TestResult {
    let tmp = tempfile::tempdir()?;
    fixture(tmp.path())?;
    let scanner = scanner(tmp.path())?;
    scanner.scan_and_index();
    let before = scanner.index().get_index_stats();

    let stats = scanner.scan_and_index();
    assert_eq!(stats.total_files_indexed, 0);
    assert_eq!(stats.total_files_unchanged, 5);

    let after = scanner.index().get_index_stats();
    assert_eq!(after.documents, before.documents);
    assert_eq!(after.vector_slots, before.vector_slots);
    Ok(())
}

#[test]
fn changed_files_are_reindexed() -> TestResult {
    let tmp = tempfile::tempdir()?;
    fixture(tmp.path())?;
    let scanner = scanner(tmp.path())?;
    scanner.scan_and_index();

    std::fs::write(tmp.path().join("alpha.txt"), "alpha apricots and more")?;
    let stats = scanner.scan_and_index();
    assert_eq!(stats.total_files_indexed, 1);
    assert_eq!(stats.total_files_unchanged, 4);

    let none = SearchFilters::default();
    assert!(scanner.index().search_text("apples", 10, &none).is_empty());
    assert_eq!(scanner.index().search_text("apricots", 10, &none).len(), 1);
    Ok(())
}

#[test]
fn rebuild_forces_full_reingest() -> TestResult {
    let tmp = tempfile::tempdir()?;
    fixture(tmp.path())?;
    let scanner = scanner(tmp.path())?;
    scanner.scan_and_index();

    assert!(scanner.index().rebuild_index());
    assert_eq!(scanner.index().get_index_stats().documents, 0);
    let stats = scanner.scan_and_index();
    assert_eq!(stats.total_files_indexed, 5);
    Ok(())
}

#[test]
fn scanned_documents_are_searchable() -> TestResult {
    let tmp = tempfile::tempdir()?;
    fixture(tmp.path())?;
    let scanner = scanner(tmp.path())?;
    scanner.scan_and_index();

    let engine =
        SearchEngine::new(Arc::clone(scanner.index()), SearchConfig::default());
    let hits = engine.search("bananas", &SearchFilters::default());
    assert!(hits[0].path.ends_with("beta.md"));
    assert_eq!(hits[0].filename, "beta.md");
    assert_eq!(hits[0].file_type, "md");
    assert!(hits[0].size > 0);
    assert!(hits[0].modified_ts > 0);
    assert!(hits[0].snippet.contains("<mark>bananas</mark>"));
    Ok(())
}

#[derive(Default)]
struct Recorder {
    indexed: Mutex<Vec<PathBuf>>,
    removed: Mutex<Vec<PathBuf>>,
}

impl ChangeHandler for Recorder {
    fn index_path(&self, path: &Path) -> bool {
        self.indexed.lock().unwrap().push(path.to_path_buf());
        true
    }

    fn remove_path(&self, path: &Path) -> bool {
        self.removed.lock().unwrap().push(path.to_path_buf());
        true
    }
}

#[test]
fn rapid_modifications_are_applied_once() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().canonicalize()?;
    let file = root.join("draft.txt");
    std::fs::write(&file, "v0")?;

    let recorder = Arc::new(Recorder::default());
    let config = MonitorConfig {
        debounce_ms: 300,
        ..MonitorConfig::default()
    };
    let monitor = FileMonitor::new(recorder.clone(), &config, &[])?;
    monitor.add_directory(&root)?;
    monitor.start()?;
    assert!(monitor.is_running());

    for version in ["v1", "v22", "v333"] {
        std::fs::write(&file, version)?;
    }

    let calls = |r: &Recorder| {
        r.indexed
            .lock()
            .unwrap()
            .iter()
            .filter(|p| **p == file)
            .count()
    };
    assert!(wait_until(Duration::from_secs(5), || calls(&recorder) > 0));
    std::thread::sleep(Duration::from_millis(900));
    assert_eq!(calls(&recorder), 1);

    monitor.stop()?;
    assert!(!monitor.is_running());
    Ok(())
}

#[test]
fn monitor_keeps_index_in_sync() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().canonicalize()?;
    let scanner = Arc::new(scanner(&root)?);
    scanner.scan_and_index();

    let config = MonitorConfig {
        debounce_ms: 100,
        ..MonitorConfig::default()
    };
    let monitor = FileMonitor::new(scanner.clone(), &config, &[])?;
    monitor.add_directory(&root)?;
    monitor.start()?;

    let none = SearchFilters::default();
    let index = Arc::clone(scanner.index());
    std::fs::write(root.join("fresh.txt"), "kumquat season")?;
    assert!(wait_until(Duration::from_secs(5), || {
        index.search_text("kumquat", 10, &none).len() == 1
    }));

    std::fs::write(root.join("ignored.tmp"), "kumquat scratch")?;
    std::fs::remove_file(root.join("fresh.txt"))?;
    assert!(wait_until(Duration::from_secs(5), || {
        index.search_text("kumquat", 10, &none).is_empty()
    }));

    monitor.stop()?;
    Ok(())
}

#[test]
fn moved_in_directory_is_fully_indexed() -> TestResult {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().canonicalize()?;
    let scanner = scanner(&root)?;
    scanner.scan_and_index();

    let moved = root.join("moved_in");
    std::fs::create_dir(&moved)?;
    for i in 0..20 {
        std::fs::write(moved.join(format!("blob{i}.bin")), [0u8, 1, 2, 3])?;
    }
    std::fs::write(moved.join("notes.txt"), "quince notes")?;

    let applied = apply(&scanner, vec![(moved.clone(), Change::Upsert)], |_| false);
    assert_eq!(applied, 1);
    let notes = moved.join("notes.txt").to_string_lossy().to_string();
    assert_eq!(scanner.index().list_paths(), vec![notes]);
    Ok(())
}
