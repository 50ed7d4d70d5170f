//! Owns the full-text and vector indexes and every mutation of them.
//!
//! Public operations never return errors: failures are logged and reported
//! as `false` or as an empty result list, so ingestion and search keep
//! going when a single document or sub-query fails.

use std::{
    borrow::Cow,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use serde::Serialize;
use tantivy::IndexWriter;

use crate::{
    config::IndexConfig,
    data_dir::{DataDir, disk_usage, write_atomic},
    document::{
        IndexedDocument,
        Provenance,
        SearchFilters,
        SearchHit,
        normalize_path,
    },
    embedding::Embedder,
    error::{Error, Result},
    highlight::Highlighter,
    text_index::{OpenOutcome, SCHEMA_VERSION, TextIndex},
    vector_store::{VectorIntegrity, VectorMeta, VectorStore},
};

/// Document and vector counts plus on-disk size per component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub documents: u64,
    pub vectors: usize,
    pub vector_slots: usize,
    pub text_bytes: u64,
    pub vector_bytes: u64,
    pub embedding_enabled: bool,
    pub generation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub documents: usize,
    /// Paths stored more than once in the full-text index.
    pub duplicate_paths: Vec<String>,
    /// Live vectors whose path has no full-text record.
    pub orphan_vectors: Vec<String>,
    pub vectors: Option<VectorIntegrity>,
}

impl IntegrityReport {
    pub fn is_consistent(&self) -> bool {
        self.duplicate_paths.is_empty()
            && self.orphan_vectors.is_empty()
            && self.vectors.as_ref().is_none_or(|v| v.is_consistent())
    }
}

/// Number of per-path lock stripes serializing mutations of one path.
const PATH_STRIPES: usize = 64;

struct VectorSide {
    embedder: Arc<dyn Embedder>,
    store: Mutex<VectorStore>,
}

pub struct IndexManager {
    data_dir: Option<DataDir>,
    text: TextIndex,
    writer: RwLock<IndexWriter>,
    vectors: Option<VectorSide>,
    highlighter: Highlighter,
    embed_max_chars: usize,
    batch: AtomicBool,
    generation: AtomicU64,
    recreated: AtomicBool,
    path_locks: Box<[Mutex<()>]>,
}

impl IndexManager {
    /// Open (or create) the indexes under `data_dir`.
    ///
    /// A stale schema version, a corrupt full-text index or an unreadable
    /// vector store leave empty indexes behind; [`Self::take_recreated`]
    /// then reports `true` so callers know to re-ingest everything.
    pub fn open(
        data_dir: &DataDir,
        config: &IndexConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let mut recreated = false;

        let version_path = data_dir.schema_version();
        let stored_version = std::fs::read_to_string(&version_path)
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok());
        if stored_version.is_some_and(|v| v != SCHEMA_VERSION) {
            tracing::warn!(
                stored = ?stored_version,
                expected = SCHEMA_VERSION,
                "index schema changed, rebuilding"
            );
            remove_dir_if_exists(&data_dir.text_dir())?;
            remove_dir_if_exists(&data_dir.vector_dir())?;
            recreated = true;
        }
        write_atomic(&version_path, SCHEMA_VERSION.to_string().as_bytes())?;

        let (text, outcome) = TextIndex::open(&data_dir.text_dir())?;
        if outcome != OpenOutcome::Opened {
            tracing::info!(outcome = ?outcome, "full-text index initialized");
            recreated = true;
        }

        let vectors = match embedder {
            Some(embedder) => {
                let dimension = embedder.dimension();
                let meta_path = data_dir.vector_metadata();
                let had_vectors = meta_path.exists();
                let (store, vrec) = if outcome == OpenOutcome::Opened {
                    VectorStore::open(
                        &data_dir.vector_index(),
                        &meta_path,
                        dimension,
                    )?
                } else {
                    (VectorStore::new(dimension)?, had_vectors)
                };
                if vrec || (!had_vectors && text.num_docs() > 0) {
                    recreated = true;
                }
                Some(VectorSide {
                    embedder,
                    store: Mutex::new(store),
                })
            }
            None => None,
        };

        let writer = text.writer(config.writer_memory_bytes)?;
        tracing::debug!(
            dir = %data_dir.root().display(),
            documents = text.num_docs(),
            vectors = vectors.is_some(),
            "index manager ready"
        );

        Ok(Self {
            data_dir: Some(data_dir.clone()),
            text,
            writer: RwLock::new(writer),
            vectors,
            highlighter: Highlighter::from_config(config),
            embed_max_chars: config.embedding_max_chars,
            batch: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            recreated: AtomicBool::new(recreated),
            path_locks: path_stripes(),
        })
    }

    /// Indexes that live only in memory (for testing).
    pub fn in_memory(
        config: &IndexConfig,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let text = TextIndex::open_in_ram()?;
        let writer = text.writer(config.writer_memory_bytes)?;
        let vectors = match embedder {
            Some(embedder) => Some(VectorSide {
                store: Mutex::new(VectorStore::new(embedder.dimension())?),
                embedder,
            }),
            None => None,
        };
        Ok(Self {
            data_dir: None,
            text,
            writer: RwLock::new(writer),
            vectors,
            highlighter: Highlighter::from_config(config),
            embed_max_chars: config.embedding_max_chars,
            batch: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            recreated: AtomicBool::new(false),
            path_locks: path_stripes(),
        })
    }

    /// Whether the indexes were recreated or rebuilt since the last call.
    pub fn take_recreated(&self) -> bool {
        self.recreated.swap(false, Ordering::SeqCst)
    }

    pub fn embedding_enabled(&self) -> bool {
        self.vectors.is_some()
    }

    /// Incremented by every commit. Lets caches detect stale entries.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_batch_mode(&self) -> bool {
        self.batch.load(Ordering::SeqCst)
    }

    /// Add `doc`, replacing any record stored under the same path.
    pub fn add_document(&self, doc: &IndexedDocument) -> bool {
        self.report("add", &doc.path, self.try_add(doc))
    }

    /// Replace the stored record for `doc.path` with `doc`.
    ///
    /// The delete and the add are committed together, so a reader sees
    /// either the old record or the new one.
    pub fn update_document(&self, doc: &IndexedDocument) -> bool {
        self.report("update", &doc.path, self.try_add(doc))
    }

    /// Remove every record for `path`. Succeeds when nothing is stored.
    pub fn delete_document(&self, path: &str) -> bool {
        self.report("delete", path, self.try_delete(path))
    }

    fn report(&self, op: &'static str, path: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => {
                tracing::debug!(op, path, "index updated");
                true
            }
            Err(e) => {
                tracing::error!(op, path, error = %e, "index mutation failed");
                false
            }
        }
    }

    fn try_add(&self, doc: &IndexedDocument) -> Result<()> {
        let doc = normalized(doc);
        {
            let _path = self.lock_path(&doc.path)?;
            {
                let writer = self.read_writer()?;
                self.text.delete_document(&writer, &doc.path);
                self.text.add_document(&writer, &doc)?;
            }
            // Full-text completeness wins: a vector failure is logged only.
            if let Err(e) = self.store_vector(&doc) {
                tracing::warn!(path = %doc.path, error = %e, "vector step failed");
            }
        }
        self.after_mutation()
    }

    fn try_delete(&self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        {
            let _path = self.lock_path(&path)?;
            {
                let writer = self.read_writer()?;
                self.text.delete_document(&writer, &path);
            }
            if let Some(side) = &self.vectors {
                lock(&side.store, "vector store")?.remove_path(&path);
            }
        }
        self.after_mutation()
    }

    /// Serializes the delete-then-add of concurrent writers to one path.
    fn lock_path(&self, path: &str) -> Result<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let stripe = (hasher.finish() % self.path_locks.len() as u64) as usize;
        lock(&self.path_locks[stripe], "path lock")
    }

    fn store_vector(&self, doc: &IndexedDocument) -> Result<()> {
        let Some(side) = &self.vectors else {
            return Ok(());
        };
        let prefix: String = doc.content.chars().take(self.embed_max_chars).collect();
        let input = if prefix.trim().is_empty() { &doc.filename } else { &prefix };

        // Embedding dominates; keep it outside the lock.
        let embedded = side.embedder.embed(input);
        let mut store = lock(&side.store, "vector store")?;
        match embedded {
            Ok(vector) => {
                store.replace(
                    VectorMeta {
                        path: doc.path.clone(),
                        filename: doc.filename.clone(),
                        file_type: doc.file_type.clone(),
                        modified: doc.modified_ts,
                    },
                    &vector,
                )?;
                Ok(())
            }
            Err(e) => {
                // The old vector no longer describes the document.
                store.remove_path(&doc.path);
                Err(e)
            }
        }
    }

    fn after_mutation(&self) -> Result<()> {
        if self.is_batch_mode() {
            return Ok(());
        }
        self.commit()?;
        self.persist_vectors()
    }

    fn commit(&self) -> Result<()> {
        let mut writer = self
            .writer
            .write()
            .map_err(|_| Error::Poisoned("index writer"))?;
        writer.commit()?;
        self.text.reload()?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn persist_vectors(&self) -> Result<()> {
        let (Some(dir), Some(side)) = (&self.data_dir, &self.vectors) else {
            return Ok(());
        };
        let store = lock(&side.store, "vector store")?;
        store.save(&dir.vector_index(), &dir.vector_metadata())
    }

    fn read_writer(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, IndexWriter>> {
        self.writer.read().map_err(|_| Error::Poisoned("index writer"))
    }

    /// Defer commits and persistence until [`Self::end_batch`].
    pub fn begin_batch(&self) {
        self.batch.store(true, Ordering::SeqCst);
        tracing::debug!("batch mode on");
    }

    /// Leave batch mode with one commit and one save.
    pub fn end_batch(&self) -> bool {
        self.batch.store(false, Ordering::SeqCst);
        tracing::debug!("batch mode off");
        self.save()
    }

    /// Commit pending writes and persist the vector store.
    pub fn save(&self) -> bool {
        let result = self.commit().and_then(|_| self.persist_vectors());
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "saving indexes failed");
                false
            }
        }
    }

    /// Full-text search through the query cascade.
    pub fn search_text(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Vec<SearchHit> {
        let hits = match self.text.search(query, limit, filters) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::error!(query, error = %e, "text search failed");
                return Vec::new();
            }
        };
        let tokens = self.query_tokens(query);
        hits.into_iter()
            .map(|h| self.to_hit(h.doc, h.score, Provenance::Text, query, &tokens))
            .collect()
    }

    /// Nearest documents to the embedded query. Empty when vectors are
    /// disabled or the query cannot be embedded.
    pub fn search_vector(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let Some(side) = &self.vectors else {
            return Vec::new();
        };
        match self.try_search_vector(side, query, limit) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(query, error = %e, "vector search failed");
                Vec::new()
            }
        }
    }

    fn try_search_vector(
        &self,
        side: &VectorSide,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let vector = side.embedder.embed_query(query)?;
        let found = lock(&side.store, "vector store")?.search(&vector, limit)?;

        let tokens = self.query_tokens(query);
        let mut hits = Vec::with_capacity(found.len());
        for hit in found {
            match self.text.get_document(&hit.meta.path)? {
                Some(doc) => hits.push(self.to_hit(
                    doc,
                    hit.similarity,
                    Provenance::Vector,
                    query,
                    &tokens,
                )),
                None => tracing::debug!(
                    path = %hit.meta.path,
                    "vector without full-text record"
                ),
            }
        }
        Ok(hits)
    }

    pub fn query_tokens(&self, query: &str) -> Vec<String> {
        self.text.segmenter().query_tokens(query)
    }

    fn to_hit(
        &self,
        doc: IndexedDocument,
        score: f32,
        provenance: Provenance,
        query: &str,
        tokens: &[String],
    ) -> SearchHit {
        let snippet = self.highlighter.snippet(&doc.content, query, tokens);
        let needle = query.trim().to_lowercase();
        let has_query = snippet.contains_query
            || (!needle.is_empty()
                && doc.filename.to_lowercase().contains(&needle));
        SearchHit {
            path: doc.path,
            filename: doc.filename,
            content: doc.content,
            snippet: snippet.text,
            file_type: doc.file_type,
            size: doc.size,
            modified_ts: doc.modified_ts,
            score,
            provenance,
            has_query,
        }
    }

    /// Distinct indexed paths, sorted.
    pub fn list_paths(&self) -> Vec<String> {
        match self.text.list_paths() {
            Ok(mut paths) => {
                paths.dedup();
                paths
            }
            Err(e) => {
                tracing::error!(error = %e, "listing paths failed");
                Vec::new()
            }
        }
    }

    pub fn get_document(&self, path: &str) -> Option<IndexedDocument> {
        self.text.get_document(&normalize_path(path)).unwrap_or_else(|e| {
            tracing::error!(path, error = %e, "document fetch failed");
            None
        })
    }

    /// Destructively empty both indexes. Every document must be ingested
    /// again afterwards.
    pub fn rebuild_index(&self) -> bool {
        match self.try_rebuild() {
            Ok(()) => {
                tracing::info!("indexes rebuilt empty");
                self.recreated.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "rebuild failed");
                false
            }
        }
    }

    fn try_rebuild(&self) -> Result<()> {
        {
            let mut writer = self
                .writer
                .write()
                .map_err(|_| Error::Poisoned("index writer"))?;
            writer.delete_all_documents()?;
            writer.commit()?;
        }
        self.text.reload()?;
        self.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(side) = &self.vectors {
            let mut store = lock(&side.store, "vector store")?;
            *store = VectorStore::new(side.embedder.dimension())?;
        }
        if let Some(dir) = &self.data_dir {
            write_atomic(
                &dir.schema_version(),
                SCHEMA_VERSION.to_string().as_bytes(),
            )?;
        }
        self.persist_vectors()
    }

    pub fn get_index_stats(&self) -> IndexStats {
        let (vectors, vector_slots) = match &self.vectors {
            Some(side) => match lock(&side.store, "vector store") {
                Ok(store) => {
                    let integrity = store.integrity();
                    (integrity.live, integrity.slots)
                }
                Err(_) => (0, 0),
            },
            None => (0, 0),
        };
        let (text_bytes, vector_bytes) = match &self.data_dir {
            Some(dir) => (disk_usage(&dir.text_dir()), disk_usage(&dir.vector_dir())),
            None => (0, 0),
        };
        IndexStats {
            documents: self.text.num_docs(),
            vectors,
            vector_slots,
            text_bytes,
            vector_bytes,
            embedding_enabled: self.embedding_enabled(),
            generation: self.generation(),
        }
    }

    /// Cross-check the full-text records and the vector metadata.
    pub fn validate_index_integrity(&self) -> IntegrityReport {
        match self.try_validate() {
            Ok(report) => {
                if !report.is_consistent() {
                    tracing::warn!(?report, "index integrity problems found");
                }
                report
            }
            Err(e) => {
                tracing::error!(error = %e, "integrity check failed");
                IntegrityReport::default()
            }
        }
    }

    fn try_validate(&self) -> Result<IntegrityReport> {
        let all = self.text.list_paths()?;
        let mut duplicate_paths: Vec<String> = all
            .windows(2)
            .filter(|w| w[0] == w[1])
            .map(|w| w[0].clone())
            .collect();
        duplicate_paths.dedup();

        let mut distinct = all;
        distinct.dedup();

        let (vectors, orphan_vectors) = match &self.vectors {
            Some(side) => {
                let store = lock(&side.store, "vector store")?;
                let orphans = store
                    .live_paths()
                    .into_iter()
                    .filter(|p| distinct.binary_search(p).is_err())
                    .collect();
                (Some(store.integrity()), orphans)
            }
            None => (None, Vec::new()),
        };

        Ok(IntegrityReport {
            documents: distinct.len(),
            duplicate_paths,
            orphan_vectors,
            vectors,
        })
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("data_dir", &self.data_dir)
            .field("embedding", &self.embedding_enabled())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

fn path_stripes() -> Box<[Mutex<()>]> {
    (0..PATH_STRIPES).map(|_| Mutex::new(())).collect()
}

/// `doc` with its path in canonical form. Struct-literal documents may
/// carry a raw path.
fn normalized(doc: &IndexedDocument) -> Cow<'_, IndexedDocument> {
    let path = normalize_path(&doc.path);
    if path == doc.path {
        Cow::Borrowed(doc)
    } else {
        Cow::Owned(IndexedDocument {
            path,
            ..doc.clone()
        })
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| Error::Poisoned(what))
}

fn remove_dir_if_exists(dir: &std::path::Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn config() -> IndexConfig {
        IndexConfig {
            writer_memory_bytes: 15_000_000,
            ..Default::default()
        }
    }

    fn with_vectors() -> IndexManager {
        IndexManager::in_memory(&config(), Some(Arc::new(HashingEmbedder::new(64))))
            .unwrap()
    }

    fn paths(hits: &[SearchHit]) -> Vec<&str> {
        hits.iter().map(|h| h.path.as_str()).collect()
    }

    #[test]
    fn round_trip_add_search_delete() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        assert!(index.add_document(&IndexedDocument::new("/t/a.txt", "alpha beta gamma")));

        let hits = index.search_text("beta", 10, &SearchFilters::default());
        assert_eq!(paths(&hits), vec!["/t/a.txt"]);
        assert_eq!(hits[0].provenance, Provenance::Text);
        assert!(hits[0].snippet.contains("<mark>beta</mark>"));
        assert!(hits[0].has_query);

        assert!(index.delete_document("/t/a.txt"));
        assert!(index.search_text("beta", 10, &SearchFilters::default()).is_empty());
    }

    #[test]
    fn delete_of_missing_path_succeeds() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        assert!(index.delete_document("/nope"));
    }

    #[test]
    fn add_twice_keeps_one_record() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        let doc = IndexedDocument::new("/t/a.txt", "alpha");
        index.add_document(&doc);
        index.add_document(&doc);
        assert_eq!(index.get_index_stats().documents, 1);
        assert!(index.validate_index_integrity().is_consistent());
    }

    #[test]
    fn update_replaces_old_content() {
        let index = with_vectors();
        index.add_document(&IndexedDocument::new("/t/a.txt", "oldword here"));
        index.update_document(&IndexedDocument::new("/t/a.txt", "newword here"));

        let none = SearchFilters::default();
        assert!(index.search_text("oldword", 10, &none).is_empty());
        assert_eq!(paths(&index.search_text("newword", 10, &none)), vec!["/t/a.txt"]);

        let stats = index.get_index_stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.vectors, 1);
        assert_eq!(stats.vector_slots, 2);
    }

    #[test]
    fn vector_search_finds_similar_text() {
        let index = with_vectors();
        index.add_document(&IndexedDocument::new("/t/rust.txt", "rust memory safety ownership"));
        index.add_document(&IndexedDocument::new("/t/cake.txt", "banana bread recipe oven"));

        let hits = index.search_vector("ownership and memory safety", 5);
        assert_eq!(hits[0].path, "/t/rust.txt");
        assert_eq!(hits[0].provenance, Provenance::Vector);
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[test]
    fn deleted_paths_leave_no_vector_results() {
        let index = with_vectors();
        index.add_document(&IndexedDocument::new("/t/a.txt", "alpha beta"));
        index.add_document(&IndexedDocument::new("/t/b.txt", "alpha gamma"));
        index.delete_document("/t/a.txt");

        let hits = index.search_vector("alpha beta", 10);
        assert!(hits.iter().all(|h| h.path != "/t/a.txt"));
        assert_eq!(index.get_index_stats().vectors, 1);
        assert_eq!(index.validate_index_integrity().vectors.unwrap().tombstoned, 1);
    }

    #[test]
    fn vectors_disabled_gives_no_vector_hits() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        index.add_document(&IndexedDocument::new("/t/a.txt", "alpha"));
        assert!(index.search_vector("alpha", 5).is_empty());
        assert!(!index.embedding_enabled());
    }

    #[test]
    fn batch_mode_defers_visibility() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        index.begin_batch();
        index.add_document(&IndexedDocument::new("/t/a.txt", "alpha"));
        let before = index.generation();
        assert!(index.search_text("alpha", 10, &SearchFilters::default()).is_empty());

        assert!(index.end_batch());
        assert!(index.generation() > before);
        assert_eq!(index.search_text("alpha", 10, &SearchFilters::default()).len(), 1);
    }

    #[test]
    fn rebuild_empties_everything() {
        let index = with_vectors();
        index.add_document(&IndexedDocument::new("/t/a.txt", "alpha"));
        assert!(index.rebuild_index());
        assert!(index.take_recreated());
        assert!(!index.take_recreated());

        let stats = index.get_index_stats();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.vectors, 0);
        assert!(index.list_paths().is_empty());
    }

    #[test]
    fn reopen_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(32));
        {
            let index = IndexManager::open(&dir, &config(), Some(embedder.clone())).unwrap();
            assert!(index.take_recreated());
            index.add_document(&IndexedDocument::new("/t/a.txt", "alpha beta"));
        }
        assert!(dir.vector_metadata().exists());

        let index = IndexManager::open(&dir, &config(), Some(embedder)).unwrap();
        assert!(!index.take_recreated());
        assert_eq!(index.list_paths(), vec!["/t/a.txt"]);
        assert_eq!(index.search_vector("alpha beta", 3)[0].path, "/t/a.txt");

        let stats = index.get_index_stats();
        assert!(stats.text_bytes > 0);
        assert!(stats.vector_bytes > 0);
    }

    #[test]
    fn schema_version_change_rebuilds() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::resolve(Some(tmp.path())).unwrap();
        {
            let index = IndexManager::open(&dir, &config(), None).unwrap();
            index.add_document(&IndexedDocument::new("/t/a.txt", "alpha"));
        }
        std::fs::write(dir.schema_version(), "1").unwrap();

        let index = IndexManager::open(&dir, &config(), None).unwrap();
        assert!(index.take_recreated());
        assert_eq!(index.get_index_stats().documents, 0);
        assert_eq!(
            std::fs::read_to_string(dir.schema_version()).unwrap(),
            SCHEMA_VERSION.to_string()
        );
    }

    #[test]
    fn backslash_paths_are_deleted_by_their_raw_form() {
        let index = with_vectors();
        index.add_document(&IndexedDocument::new("C:\\docs\\a.txt", "alpha words"));
        assert_eq!(index.list_paths(), vec!["C:/docs/a.txt"]);
        assert!(index.get_document("C:\\docs\\a.txt").is_some());

        assert!(index.delete_document("C:\\docs\\a.txt"));
        assert!(index.search_text("alpha", 10, &SearchFilters::default()).is_empty());
        assert!(index.search_vector("alpha words", 10).is_empty());
        assert_eq!(index.get_index_stats().vectors, 0);
    }

    #[test]
    fn struct_literal_paths_are_normalized() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        let raw = IndexedDocument {
            path: "/t/dir\\a.txt".into(),
            ..IndexedDocument::new("/t/dir/a.txt", "alpha")
        };
        index.add_document(&raw);
        index.add_document(&IndexedDocument::new("/t/dir/a.txt", "alpha again"));
        assert_eq!(index.get_index_stats().documents, 1);
        assert_eq!(index.list_paths(), vec!["/t/dir/a.txt"]);
    }

    #[test]
    fn vector_failure_keeps_full_text_record() {
        let index = with_vectors();
        assert!(index.add_document(&IndexedDocument::new("/t/dots.txt", "...")));
        assert!(index.get_document("/t/dots.txt").is_some());

        let hits = index.search_text("dots", 10, &SearchFilters::default());
        assert_eq!(paths(&hits), vec!["/t/dots.txt"]);
        let stats = index.get_index_stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.vectors, 0);
    }

    #[test]
    fn concurrent_updates_of_one_path_keep_one_record() {
        let index = with_vectors();
        index.begin_batch();
        std::thread::scope(|s| {
            for worker in 0..8 {
                let index = &index;
                s.spawn(move || {
                    for round in 0..20 {
                        let body = format!("worker {worker} round {round}");
                        assert!(index.update_document(&IndexedDocument::new("/t/a.txt", body)));
                    }
                });
            }
        });
        assert!(index.end_batch());

        let stats = index.get_index_stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.vectors, 1);
        assert!(index.validate_index_integrity().is_consistent());
    }

    #[test]
    fn queries_use_query_encoding() {
        use std::sync::atomic::AtomicUsize;

        struct Counting {
            inner: HashingEmbedder,
            documents: AtomicUsize,
            queries: AtomicUsize,
        }

        impl Embedder for Counting {
            fn dimension(&self) -> usize {
                self.inner.dimension()
            }

            fn embed(&self, text: &str) -> Result<Vec<f32>> {
                self.documents.fetch_add(1, Ordering::SeqCst);
                self.inner.embed(text)
            }

            fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
                self.queries.fetch_add(1, Ordering::SeqCst);
                self.inner.embed(text)
            }
        }

        let embedder = Arc::new(Counting {
            inner: HashingEmbedder::new(32),
            documents: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
        });
        let index = IndexManager::in_memory(&config(), Some(embedder.clone())).unwrap();
        index.add_document(&IndexedDocument::new("/t/a.txt", "alpha beta"));
        assert_eq!(index.search_vector("alpha", 5)[0].path, "/t/a.txt");

        assert_eq!(embedder.documents.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_document_returns_stored_fields() {
        let index = IndexManager::in_memory(&config(), None).unwrap();
        let mut doc = IndexedDocument::new("/t/a.txt", "body");
        doc.size = 4;
        index.add_document(&doc);
        assert_eq!(index.get_document("/t/a.txt"), Some(doc));
        assert_eq!(index.get_document("/t/b.txt"), None);
    }
}
