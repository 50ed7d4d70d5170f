//! Bulk ingestion: walk the scan roots and push every new or changed file
//! through the parse+index pipeline on a bounded worker pool.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        RwLock,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant, SystemTime},
};

use serde::Serialize;

use crate::{
    config::ScannerConfig,
    document::{IndexedDocument, extension_of, normalize_path},
    error::{Error, Result},
    fingerprint::{FingerprintCache, fingerprint},
    index_manager::IndexManager,
    parser::{DocumentParser, ParseError},
    rules::{ExcludeRules, is_system_file},
};

/// Counters for the most recent scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub total_files_scanned: usize,
    pub total_files_indexed: usize,
    pub total_files_skipped: usize,
    pub total_files_unchanged: usize,
    pub total_bytes_scanned: u64,
    pub elapsed: Duration,
    /// Seconds since the Unix epoch.
    pub finished_at: Option<u64>,
    pub cancelled: bool,
}

/// Why a file was not indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Unreadable(String),
    NotAFile,
    TooLarge(u64),
    Extension,
    Excluded,
    SystemFile,
    Parse(ParseError),
    IndexFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Indexed,
    Unchanged,
    Skipped(SkipReason),
}

pub struct FileScanner {
    index: Arc<IndexManager>,
    parser: Arc<dyn DocumentParser>,
    roots: RwLock<Vec<PathBuf>>,
    /// Lowercase, without the dot. Empty accepts every extension.
    extensions: HashSet<String>,
    rules: ExcludeRules,
    max_file_size: AtomicU64,
    pool: rayon::ThreadPool,
    fingerprints: Mutex<FingerprintCache>,
    fingerprint_db: Option<PathBuf>,
    stats: Mutex<ScanStats>,
    stop: AtomicBool,
    progress_every: usize,
}

impl std::fmt::Debug for FileScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileScanner")
            .field("roots", &self.roots)
            .field("extensions", &self.extensions)
            .field("workers", &self.pool.current_num_threads())
            .finish_non_exhaustive()
    }
}

impl FileScanner {
    pub fn new(
        index: Arc<IndexManager>,
        parser: Arc<dyn DocumentParser>,
        config: &ScannerConfig,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_count())
            .thread_name(|i| format!("docseek-scan-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("scanner worker pool: {e}")))?;

        let scanner = Self {
            index,
            parser,
            roots: RwLock::new(Vec::new()),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            rules: ExcludeRules::new(&config.exclude_patterns)?,
            max_file_size: AtomicU64::new(config.max_file_size_bytes()),
            pool,
            fingerprints: Mutex::new(FingerprintCache::new(
                config.fingerprint_capacity,
            )),
            fingerprint_db: None,
            stats: Mutex::new(ScanStats::default()),
            stop: AtomicBool::new(false),
            progress_every: config.progress_every.max(1),
        };
        for root in &config.roots {
            scanner.add_root(root);
        }
        Ok(scanner)
    }

    /// Persist fingerprints in a redb file so restarts skip unchanged files.
    ///
    /// An unreadable database is logged and replaced on the next save.
    pub fn with_fingerprint_db(mut self, db_path: PathBuf) -> Self {
        let capacity = self.fingerprints().map(|f| f.capacity()).unwrap_or(1);
        match FingerprintCache::load(&db_path, capacity) {
            Ok(cache) => {
                tracing::debug!(
                    entries = cache.len(),
                    path = %db_path.display(),
                    "fingerprints loaded"
                );
                self.fingerprints = Mutex::new(cache);
            }
            Err(e) => {
                tracing::warn!(
                    path = %db_path.display(),
                    error = %e,
                    "could not load fingerprints, starting empty"
                );
            }
        }
        self.fingerprint_db = Some(db_path);
        self
    }

    pub fn index(&self) -> &Arc<IndexManager> {
        &self.index
    }

    /// Add a scan root. Returns `false` if it was already present.
    pub fn add_root(&self, root: &Path) -> bool {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let Ok(mut roots) = self.roots.write() else {
            return false;
        };
        if roots.contains(&root) {
            return false;
        }
        tracing::debug!(root = %root.display(), "scan root added");
        roots.push(root);
        true
    }

    pub fn remove_root(&self, root: &Path) -> bool {
        let canonical =
            root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let Ok(mut roots) = self.roots.write() else {
            return false;
        };
        let before = roots.len();
        roots.retain(|r| r != &canonical && r != root);
        roots.len() != before
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        self.roots.read().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn set_max_file_size_mb(&self, mb: u64) {
        self.max_file_size
            .store(mb.saturating_mul(1024 * 1024), Ordering::SeqCst);
    }

    /// Sorted extension allow-list; empty means every extension.
    pub fn supported_extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.extensions.iter().cloned().collect();
        exts.sort();
        exts
    }

    /// Snapshot of the current (or last) scan's counters.
    pub fn stats(&self) -> ScanStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Ask a running scan to stop. Files already being processed finish.
    pub fn stop(&self) {
        tracing::info!("scan stop requested");
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn scan_and_index(&self) -> ScanStats {
        self.scan_and_index_with(|_| {})
    }

    /// Scan every root, reporting a 0-100 percentage to `progress`.
    pub fn scan_and_index_with<F>(&self, progress: F) -> ScanStats
    where
        F: Fn(u8) + Sync,
    {
        let started = Instant::now();
        self.stop.store(false, Ordering::SeqCst);
        if let Ok(mut stats) = self.stats.lock() {
            *stats = ScanStats::default();
        }

        if self.index.take_recreated()
            && let Ok(mut fingerprints) = self.fingerprints()
        {
            tracing::info!("indexes were recreated, forgetting fingerprints");
            fingerprints.clear();
        }

        let mut candidates = Vec::new();
        for root in self.roots() {
            if self.stopped() {
                break;
            }
            if !root.is_dir() {
                tracing::warn!(root = %root.display(), "scan root is not a directory");
                continue;
            }
            self.walk(&root, &root, &mut candidates);
        }
        let total = candidates.len();
        tracing::info!(files = total, "scan started");

        let processed = AtomicUsize::new(0);
        let indexed_keys = Mutex::new(Vec::new());
        self.index.begin_batch();
        self.pool.scope(|scope| {
            for (root, path) in &candidates {
                if self.stopped() {
                    break;
                }
                let processed = &processed;
                let progress = &progress;
                let indexed_keys = &indexed_keys;
                scope.spawn(move |_| {
                    if self.stopped() {
                        return;
                    }
                    let outcome = self.process_file(root, path);
                    if outcome == FileOutcome::Indexed
                        && let Ok(mut keys) = indexed_keys.lock()
                    {
                        keys.push(normalize_path(&path.to_string_lossy()));
                    }
                    self.record(path, &outcome);
                    let done = processed.fetch_add(1, Ordering::SeqCst) + 1;
                    if done % self.progress_every == 0 || done == total {
                        progress(percent(done, total));
                    }
                });
            }
        });
        if self.index.end_batch() {
            self.persist_fingerprints();
        } else {
            // Uncommitted files must be picked up again by the next scan.
            let keys = indexed_keys.into_inner().unwrap_or_default();
            tracing::error!(
                files = keys.len(),
                "final commit of the scan failed, forgetting their fingerprints"
            );
            if let Ok(mut fingerprints) = self.fingerprints() {
                for key in &keys {
                    fingerprints.remove(key);
                }
            }
        }

        let cancelled = self.stopped();
        if total == 0 && !cancelled {
            progress(100);
        }
        let mut stats = self.stats();
        stats.elapsed = started.elapsed();
        stats.finished_at = Some(unix_secs(SystemTime::now()));
        stats.cancelled = cancelled;
        if let Ok(mut shared) = self.stats.lock() {
            *shared = stats.clone();
        }
        tracing::info!(
            scanned = stats.total_files_scanned,
            indexed = stats.total_files_indexed,
            unchanged = stats.total_files_unchanged,
            skipped = stats.total_files_skipped,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            cancelled,
            "scan finished"
        );
        stats
    }

    /// Collect every regular file below `dir`, pruning hidden and excluded
    /// directories. Unreadable directories are logged and skipped.
    fn walk(&self, root: &Path, dir: &Path, out: &mut Vec<(PathBuf, PathBuf)>) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cannot read directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                if self.prune(root, &path) {
                    tracing::trace!(dir = %path.display(), "pruned");
                    continue;
                }
                self.walk(root, &path, out);
            } else if file_type.is_symlink() {
                let Ok(resolved) = path.canonicalize() else {
                    continue;
                };
                // Linked directories are not followed.
                if resolved.is_file() {
                    out.push((root.to_path_buf(), path));
                }
            } else if file_type.is_file() {
                out.push((root.to_path_buf(), path));
            }
        }
    }

    fn prune(&self, root: &Path, dir: &Path) -> bool {
        let relative = dir.strip_prefix(root).unwrap_or(dir);
        let hidden = dir
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        hidden || self.rules.is_excluded(relative)
    }

    fn accepts_extension(&self, path: &Path) -> bool {
        self.extensions.is_empty()
            || self
                .extensions
                .contains(&extension_of(&path.to_string_lossy()))
    }

    /// Run one file through the ingestion pipeline.
    pub fn process_file(&self, root: &Path, path: &Path) -> FileOutcome {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) => return FileOutcome::Skipped(SkipReason::Unreadable(e.to_string())),
        };
        if !metadata.is_file() {
            return FileOutcome::Skipped(SkipReason::NotAFile);
        }
        let size = metadata.len();
        if let Ok(mut stats) = self.stats.lock() {
            stats.total_bytes_scanned += size;
        }
        if size > self.max_file_size.load(Ordering::SeqCst) {
            return FileOutcome::Skipped(SkipReason::TooLarge(size));
        }
        if !self.accepts_extension(path) {
            return FileOutcome::Skipped(SkipReason::Extension);
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        if self.rules.is_excluded(relative) {
            return FileOutcome::Skipped(SkipReason::Excluded);
        }
        if is_system_file(path, root) {
            return FileOutcome::Skipped(SkipReason::SystemFile);
        }

        let key = normalize_path(&path.to_string_lossy());
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let mtime_nanos = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let print = fingerprint(&key, size, mtime_nanos);
        if let Ok(fingerprints) = self.fingerprints()
            && fingerprints.is_unchanged(&key, print)
        {
            return FileOutcome::Unchanged;
        }

        let content = match self.parser.extract_text(path) {
            Ok(text) => match ParseError::check(text) {
                Ok(text) => text,
                Err(e) => return FileOutcome::Skipped(SkipReason::Parse(e)),
            },
            Err(e) => return FileOutcome::Skipped(SkipReason::Parse(e)),
        };

        let mut doc = IndexedDocument::new(&key, content);
        doc.size = size;
        doc.modified_ts = unix_secs(modified);
        doc.created_ts = metadata
            .created()
            .map(unix_secs)
            .unwrap_or(doc.modified_ts);

        if !self.index.update_document(&doc) {
            return FileOutcome::Skipped(SkipReason::IndexFailed);
        }
        if let Ok(mut fingerprints) = self.fingerprints() {
            fingerprints.record(&key, print);
        }
        FileOutcome::Indexed
    }

    fn record(&self, path: &Path, outcome: &FileOutcome) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        stats.total_files_scanned += 1;
        match outcome {
            FileOutcome::Indexed => stats.total_files_indexed += 1,
            FileOutcome::Unchanged => stats.total_files_unchanged += 1,
            FileOutcome::Skipped(reason) => {
                stats.total_files_skipped += 1;
                match reason {
                    SkipReason::Extension
                    | SkipReason::Excluded
                    | SkipReason::SystemFile => {
                        tracing::trace!(path = %path.display(), ?reason, "skipped");
                    }
                    _ => {
                        tracing::warn!(path = %path.display(), ?reason, "skipped");
                    }
                }
            }
        }
    }

    /// Index a single file outside of a scan, e.g. for a filesystem event.
    ///
    /// The file is checked against the root that contains it, or against its
    /// parent directory when it lies outside every root.
    pub fn index_file(&self, path: &Path) -> FileOutcome {
        let root = self
            .roots()
            .into_iter()
            .find(|r| path.starts_with(r))
            .or_else(|| path.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        let outcome = self.process_file(&root, path);
        if let FileOutcome::Skipped(reason) = &outcome {
            tracing::debug!(path = %path.display(), ?reason, "not indexed");
        }
        outcome
    }

    /// Drop a file from the index and forget its fingerprint. A removed
    /// directory takes every document below it along.
    pub fn remove_file(&self, path: &Path) -> bool {
        let key = normalize_path(&path.to_string_lossy());
        let prefix = format!("{key}/");
        let mut keys: Vec<String> = self
            .index
            .list_paths()
            .into_iter()
            .filter(|p| p.starts_with(&prefix))
            .collect();
        keys.push(key);

        let mut ok = true;
        for key in &keys {
            if let Ok(mut fingerprints) = self.fingerprints() {
                fingerprints.remove(key);
            }
            ok &= self.index.delete_document(key);
        }
        ok
    }

    /// Save fingerprints to the configured database, if any.
    pub fn persist_fingerprints(&self) {
        let Some(db) = &self.fingerprint_db else {
            return;
        };
        let result = self.fingerprints().and_then(|f| f.save(db));
        if let Err(e) = result {
            tracing::warn!(path = %db.display(), error = %e, "could not save fingerprints");
        }
    }

    fn fingerprints(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FingerprintCache>> {
        self.fingerprints
            .lock()
            .map_err(|_| Error::Poisoned("fingerprint cache"))
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
