//! Live filesystem monitoring with debounced event application.
//!
//! OS notifications are buffered per path; only the latest change for each
//! path is applied once the trees have been quiet for the debounce interval.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc,
        Mutex,
        RwLock,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use notify::{
    Event,
    EventKind,
    RecommendedWatcher,
    RecursiveMode,
    Watcher,
    event::{ModifyKind, RenameMode},
};

use crate::{
    config::MonitorConfig,
    error::{Error, Result},
    rules::{ExcludeRules, is_hidden},
    scanner::{FileOutcome, FileScanner},
};

/// Receives the coalesced changes.
pub trait ChangeHandler: Send + Sync {
    /// Index or re-index the file at `path`.
    fn index_path(&self, path: &Path) -> bool;
    /// Drop `path`, and anything indexed below it, from the index.
    fn remove_path(&self, path: &Path) -> bool;
}

impl ChangeHandler for FileScanner {
    fn index_path(&self, path: &Path) -> bool {
        matches!(
            self.index_file(path),
            FileOutcome::Indexed | FileOutcome::Unchanged
        )
    }

    fn remove_path(&self, path: &Path) -> bool {
        self.remove_file(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Created or modified; indexed if it still exists at flush time.
    Upsert,
    Delete,
}

/// Map a notification to per-path changes. Renames become a delete of the
/// old path plus an upsert of the new one.
pub fn changes_for(event: &Event) -> Vec<(PathBuf, Change)> {
    match &event.kind {
        EventKind::Create(_) => upserts(&event.paths),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), Change::Delete))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match event.paths.as_slice() {
                [from, to, ..] => vec![
                    (from.clone(), Change::Delete),
                    (to.clone(), Change::Upsert),
                ],
                _ => upserts(&event.paths),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| (p.clone(), Change::Delete))
            .collect(),
        EventKind::Modify(_) => upserts(&event.paths),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

fn upserts(paths: &[PathBuf]) -> Vec<(PathBuf, Change)> {
    paths.iter().map(|p| (p.clone(), Change::Upsert)).collect()
}

/// Latest change per path, released once the stream goes quiet.
///
/// A steady stream of events still flushes after `max_wait`.
#[derive(Debug)]
pub struct EventBuffer {
    pending: HashMap<PathBuf, Change>,
    quiet: Duration,
    max_wait: Duration,
    first_event: Option<Instant>,
    last_event: Option<Instant>,
}

impl EventBuffer {
    pub fn new(quiet: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            quiet,
            max_wait: quiet.saturating_mul(10),
            first_event: None,
            last_event: None,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, path: PathBuf, change: Change, now: Instant) {
        self.pending.insert(path, change);
        self.first_event.get_or_insert(now);
        self.last_event = Some(now);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        let (Some(first), Some(last)) = (self.first_event, self.last_event)
        else {
            return false;
        };
        now.saturating_duration_since(last) >= self.quiet
            || now.saturating_duration_since(first) >= self.max_wait
    }

    /// Drain every pending change, ordered by path.
    pub fn take(&mut self) -> Vec<(PathBuf, Change)> {
        self.first_event = None;
        self.last_event = None;
        let mut changes: Vec<_> = self.pending.drain().collect();
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
    }
}

/// Apply flushed changes. Returns how many handler calls succeeded.
///
/// An upserted directory is indexed file by file; entries for which
/// `ignored` holds are pruned from that walk.
pub fn apply(
    handler: &dyn ChangeHandler,
    changes: Vec<(PathBuf, Change)>,
    ignored: impl Fn(&Path) -> bool,
) -> usize {
    let mut ok = 0;
    for (path, change) in changes {
        ok += match change {
            Change::Upsert if path.is_file() => usize::from(handler.index_path(&path)),
            Change::Upsert if path.is_dir() => {
                let mut files = Vec::new();
                files_under(&path, &ignored, &mut files);
                // A skipped file must not stop its siblings.
                files.iter().filter(|f| handler.index_path(f)).count()
            }
            // Gone again before the flush.
            Change::Upsert | Change::Delete => usize::from(handler.remove_path(&path)),
        };
    }
    ok
}

fn files_under(dir: &Path, ignored: &impl Fn(&Path) -> bool, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if ignored(&path) {
            continue;
        }
        match entry.file_type() {
            Ok(t) if t.is_dir() => files_under(&path, ignored, out),
            Ok(t) if t.is_file() => out.push(path),
            _ => {}
        }
    }
}

/// Whether `path` should never reach the handler.
fn is_ignored(rules: &ExcludeRules, roots: &[PathBuf], path: &Path) -> bool {
    let Some(root) = roots.iter().find(|r| path.starts_with(r)) else {
        return true;
    };
    let relative = path.strip_prefix(root).unwrap_or(path);
    is_hidden(path, root) || rules.is_excluded(relative)
}

enum Message {
    Event(Event),
    Stop,
}

struct Running {
    watcher: RecommendedWatcher,
    sender: mpsc::Sender<Message>,
    worker: JoinHandle<()>,
}

pub struct FileMonitor {
    handler: Arc<dyn ChangeHandler>,
    rules: ExcludeRules,
    debounce: Duration,
    directories: Arc<RwLock<Vec<PathBuf>>>,
    running: Mutex<Option<Running>>,
    active: Arc<AtomicBool>,
}

impl std::fmt::Debug for FileMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMonitor")
            .field("directories", &self.directories)
            .field("debounce", &self.debounce)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl FileMonitor {
    /// `extra_patterns` are usually the scanner's exclude patterns, so both
    /// ingestion paths ignore the same files.
    pub fn new(
        handler: Arc<dyn ChangeHandler>,
        config: &MonitorConfig,
        extra_patterns: &[String],
    ) -> Result<Self> {
        let patterns: Vec<String> = config
            .ignored_patterns
            .iter()
            .chain(extra_patterns)
            .cloned()
            .collect();
        let monitor = Self {
            handler,
            rules: ExcludeRules::new(&patterns)?,
            debounce: Duration::from_millis(config.debounce_ms),
            directories: Arc::new(RwLock::new(Vec::new())),
            running: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
        };
        for dir in &config.roots {
            monitor.add_directory(dir)?;
        }
        Ok(monitor)
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.directories.read().map(|d| d.clone()).unwrap_or_default()
    }

    /// Watch another tree. Takes effect immediately when running.
    pub fn add_directory(&self, dir: &Path) -> Result<bool> {
        let dir = dir.canonicalize().map_err(|_| Error::NotFound {
            kind: "directory",
            name: dir.display().to_string(),
        })?;
        if !dir.is_dir() {
            return Err(Error::NotFound {
                kind: "directory",
                name: dir.display().to_string(),
            });
        }
        {
            let mut dirs = self
                .directories
                .write()
                .map_err(|_| Error::Poisoned("monitor directories"))?;
            if dirs.contains(&dir) {
                return Ok(false);
            }
            dirs.push(dir.clone());
        }
        let mut running = self.state()?;
        if let Some(state) = running.as_mut() {
            state.watcher.watch(&dir, RecursiveMode::Recursive)?;
        }
        tracing::info!(dir = %dir.display(), "watching");
        Ok(true)
    }

    pub fn remove_directory(&self, dir: &Path) -> Result<bool> {
        let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        let removed = {
            let mut dirs = self
                .directories
                .write()
                .map_err(|_| Error::Poisoned("monitor directories"))?;
            let before = dirs.len();
            dirs.retain(|d| d != &canonical);
            dirs.len() != before
        };
        if removed {
            let mut running = self.state()?;
            if let Some(state) = running.as_mut()
                && let Err(e) = state.watcher.unwatch(&canonical)
            {
                tracing::warn!(dir = %canonical.display(), error = %e, "unwatch failed");
            }
            tracing::info!(dir = %canonical.display(), "stopped watching");
        }
        Ok(removed)
    }

    /// Start watching every configured directory. No-op when running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.state()?;
        if running.is_some() {
            return Ok(());
        }

        let (sender, receiver) = mpsc::channel();
        let events = sender.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    let _ = events.send(Message::Event(event));
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
        )?;
        for dir in self.directories() {
            watcher.watch(&dir, RecursiveMode::Recursive)?;
        }

        let worker = {
            let handler = Arc::clone(&self.handler);
            let rules = self.rules.clone();
            let directories = Arc::clone(&self.directories);
            let debounce = self.debounce;
            std::thread::Builder::new()
                .name("docseek-monitor".to_string())
                .spawn(move || {
                    run_worker(receiver, handler, rules, directories, debounce)
                })?
        };

        self.active.store(true, Ordering::SeqCst);
        *running = Some(Running {
            watcher,
            sender,
            worker,
        });
        tracing::info!(directories = self.directories().len(), "monitor started");
        Ok(())
    }

    /// Stop watching. Buffered changes are applied before this returns.
    pub fn stop(&self) -> Result<()> {
        let state = self.state()?.take();
        let Some(Running {
            watcher,
            sender,
            worker,
        }) = state
        else {
            return Ok(());
        };
        drop(watcher);
        let _ = sender.send(Message::Stop);
        if worker.join().is_err() {
            tracing::error!("monitor worker panicked");
        }
        self.active.store(false, Ordering::SeqCst);
        tracing::info!("monitor stopped");
        Ok(())
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, Option<Running>>> {
        self.running.lock().map_err(|_| Error::Poisoned("monitor state"))
    }
}

impl Drop for FileMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "monitor shutdown failed");
        }
    }
}

fn run_worker(
    receiver: mpsc::Receiver<Message>,
    handler: Arc<dyn ChangeHandler>,
    rules: ExcludeRules,
    directories: Arc<RwLock<Vec<PathBuf>>>,
    debounce: Duration,
) {
    let mut buffer = EventBuffer::new(debounce);
    let tick = (debounce / 2).max(Duration::from_millis(10));

    loop {
        let stop = match receiver.recv_timeout(tick) {
            Ok(Message::Event(event)) => {
                let roots = directories.read().map(|d| d.clone()).unwrap_or_default();
                let now = Instant::now();
                for (path, change) in changes_for(&event) {
                    if !is_ignored(&rules, &roots, &path) {
                        buffer.push(path, change, now);
                    }
                }
                false
            }
            Ok(Message::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        };

        if stop || buffer.is_due(Instant::now()) {
            let changes = buffer.take();
            if !changes.is_empty() {
                let total = changes.len();
                let roots = directories.read().map(|d| d.clone()).unwrap_or_default();
                let applied = apply(handler.as_ref(), changes, |p| {
                    is_ignored(&rules, &roots, p)
                });
                tracing::debug!(total, applied, "flushed changes");
            }
        }
        if stop {
            break;
        }
    }
}
