use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    config::SearchConfig,
    document::{Provenance, SearchFilters, SearchHit},
    index_manager::IndexManager,
};

/// Score-fusion parameters, taken from [`SearchConfig`].
#[derive(Debug, Clone, Copy)]
pub struct FusionParams {
    pub text_weight: f32,
    pub vector_weight: f32,
    pub hybrid_boost: f32,
    pub filename_bonus: f32,
}

impl FusionParams {
    pub fn from_config(config: &SearchConfig) -> Self {
        let (text_weight, vector_weight) = config.normalized_weights();
        Self {
            text_weight,
            vector_weight,
            hybrid_boost: config.hybrid_boost,
            filename_bonus: config.filename_bonus,
        }
    }
}

/// Min and max of a score set.
fn bounds(hits: &[SearchHit]) -> (f32, f32) {
    hits.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), h| {
        (lo.min(h.score), hi.max(h.score))
    })
}

/// Min-max normalize `score` into `[0, 1]`. A degenerate range maps to 1.
fn normalize(score: f32, (lo, hi): (f32, f32)) -> f32 {
    if hi > lo { (score - lo) / (hi - lo) } else { 1.0 }
}

fn by_path(hits: Vec<SearchHit>) -> HashMap<String, SearchHit> {
    let mut map: HashMap<String, SearchHit> = HashMap::with_capacity(hits.len());
    for hit in hits {
        match map.get(&hit.path) {
            Some(existing) if existing.score >= hit.score => {}
            _ => {
                map.insert(hit.path.clone(), hit);
            }
        }
    }
    map
}

/// Fuse text and vector hits by path.
///
/// A path found by one mode keeps its native score. A path found by both
/// combines its normalized scores with a weighted geometric mean, rescaled
/// into the text score range, floored at its better native score and
/// multiplied by the hybrid boost. Every hit then gains the filename bonus
/// once per query token its filename contains. Sorted best first.
pub fn fuse(
    text: Vec<SearchHit>,
    vector: Vec<SearchHit>,
    params: &FusionParams,
    tokens: &[String],
) -> Vec<SearchHit> {
    let text_bounds = bounds(&text);
    let vector_bounds = bounds(&vector);
    let mut vector = by_path(vector);

    let mut fused: Vec<SearchHit> = Vec::with_capacity(text.len() + vector.len());
    for (path, mut hit) in by_path(text) {
        if let Some(other) = vector.remove(&path) {
            let tn = normalize(hit.score, text_bounds);
            let vn = normalize(other.score, vector_bounds);
            let geo = tn.powf(params.text_weight) * vn.powf(params.vector_weight);
            let (lo, hi) = text_bounds;
            let rescaled = lo + geo * (hi - lo);
            let floor = hit.score.max(other.score);
            hit.score = rescaled.max(floor) * params.hybrid_boost;
            hit.provenance = Provenance::Hybrid;
            hit.has_query |= other.has_query;
        }
        fused.push(hit);
    }
    fused.extend(vector.into_values());

    for hit in &mut fused {
        let filename = hit.filename.to_lowercase();
        let matched = tokens.iter().filter(|t| filename.contains(t.as_str())).count();
        hit.score += matched as f32 * params.filename_bonus;
    }

    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    fused
}

/// Keep the first (best) hit per case-insensitive path.
fn dedupe(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|h| seen.insert(h.path.to_lowercase()))
        .collect()
}

fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    filters: SearchFilters,
    generation: u64,
}

struct CacheEntry {
    results: Vec<SearchHit>,
    inserted: Instant,
    tick: u64,
}

/// LRU cache of fused results with a time-to-live.
struct QueryCache {
    entries: HashMap<CacheKey, CacheEntry>,
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
    capacity: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            capacity: capacity.max(1),
            ttl,
            hits: 0,
            misses: 0,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Vec<SearchHit>> {
        let fresh = self
            .entries
            .get(key)
            .map(|e| e.inserted.elapsed() < self.ttl);
        match fresh {
            Some(true) => {
                self.hits += 1;
                self.tick += 1;
                let tick = self.tick;
                let entry = self.entries.get_mut(key)?;
                self.order.remove(&entry.tick);
                entry.tick = tick;
                self.order.insert(tick, key.clone());
                Some(entry.results.clone())
            }
            Some(false) => {
                self.misses += 1;
                if let Some(old) = self.entries.remove(key) {
                    self.order.remove(&old.tick);
                }
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn put(&mut self, key: CacheKey, results: Vec<SearchHit>) {
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.tick);
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
        self.tick += 1;
        self.order.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                results,
                inserted: Instant::now(),
                tick: self.tick,
            },
        );
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Results plus how they were produced.
#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub result_count: usize,
    pub elapsed: Duration,
    pub cached: bool,
    pub text_hits: usize,
    pub vector_hits: usize,
    pub text_weight: f32,
    pub vector_weight: f32,
}

/// Queries both indexes, fuses, filters and caches results.
pub struct SearchEngine {
    index: Arc<IndexManager>,
    config: SearchConfig,
    params: FusionParams,
    cache: Mutex<QueryCache>,
}

impl SearchEngine {
    pub fn new(index: Arc<IndexManager>, config: SearchConfig) -> Self {
        let cache = QueryCache::new(
            config.cache_size,
            Duration::from_secs(config.cache_ttl_secs),
        );
        Self {
            index,
            params: FusionParams::from_config(&config),
            config,
            cache: Mutex::new(cache),
        }
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Ranked results for `query`, at most `max_results`, every one
    /// satisfying `filters`.
    pub fn search(&self, query: &str, filters: &SearchFilters) -> Vec<SearchHit> {
        self.search_with_stats(query, filters).results
    }

    pub fn search_with_stats(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> SearchReport {
        let started = Instant::now();
        let mut report = SearchReport {
            query: query.to_string(),
            results: Vec::new(),
            result_count: 0,
            elapsed: Duration::ZERO,
            cached: false,
            text_hits: 0,
            vector_hits: 0,
            text_weight: self.params.text_weight,
            vector_weight: self.params.vector_weight,
        };
        if query.trim().is_empty() {
            return report;
        }

        let key = CacheKey {
            query: normalize_query(query),
            filters: filters.clone(),
            generation: self.index.generation(),
        };
        if self.config.cache_enabled
            && let Some(results) = self.cache_lock().and_then(|mut c| c.get(&key))
        {
            tracing::debug!(query, "search answered from cache");
            report.result_count = results.len();
            report.results = results;
            report.cached = true;
            report.elapsed = started.elapsed();
            return report;
        }

        let candidates = self.config.max_results * self.config.candidate_multiplier;
        let text = if self.params.text_weight > 0.0 || !self.index.embedding_enabled() {
            self.index.search_text(query, candidates, filters)
        } else {
            Vec::new()
        };
        // Vector hits can satisfy neither flag.
        let vector = if self.params.vector_weight > 0.0
            && !filters.whole_word
            && !filters.filename_only
        {
            self.index.search_vector(query, candidates)
        } else {
            Vec::new()
        };
        report.text_hits = text.len();
        report.vector_hits = vector.len();

        let tokens = self.index.query_tokens(query);
        let fused = fuse(text, vector, &self.params, &tokens);
        let mut results = dedupe(fused.into_iter().filter(|h| filters.matches(h)).collect());
        results.truncate(self.config.max_results);

        if self.config.cache_enabled
            && let Some(mut cache) = self.cache_lock()
        {
            cache.put(key, results.clone());
        }

        report.elapsed = started.elapsed();
        tracing::debug!(
            query,
            text = report.text_hits,
            vector = report.vector_hits,
            results = results.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "search done"
        );
        report.result_count = results.len();
        report.results = results;
        report
    }

    /// Indexed paths matching a case-insensitive glob, sorted. A pattern
    /// without glob syntax matches as a substring.
    pub fn search_by_path(&self, pattern: &str) -> Vec<String> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Vec::new();
        }
        let glob = if pattern.contains(['*', '?', '[', '{']) {
            pattern.to_string()
        } else {
            format!("*{pattern}*")
        };
        let matcher = match globset::GlobBuilder::new(&glob)
            .case_insensitive(true)
            .build()
        {
            Ok(g) => g.compile_matcher(),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "invalid path pattern");
                return Vec::new();
            }
        };

        self.index
            .list_paths()
            .into_iter()
            .filter(|p| matcher.is_match(p))
            .take(self.config.max_results)
            .collect()
    }

    /// Distinct filenames of the best text hits for `query`.
    pub fn suggestions(&self, query: &str, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        let hits = self.index.search_text(
            query,
            limit * self.config.candidate_multiplier,
            &SearchFilters::default(),
        );
        let mut seen = HashSet::new();
        hits.into_iter()
            .map(|h| h.filename)
            .filter(|f| seen.insert(f.clone()))
            .take(limit)
            .collect()
    }

    pub fn clear_cache(&self) {
        if let Some(mut cache) = self.cache_lock() {
            cache.clear();
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        let Some(cache) = self.cache_lock() else {
            return CacheStats::default();
        };
        CacheStats {
            enabled: self.config.cache_enabled,
            entries: cache.entries.len(),
            capacity: cache.capacity,
            ttl_secs: cache.ttl.as_secs(),
            hits: cache.hits,
            misses: cache.misses,
        }
    }

    fn cache_lock(&self) -> Option<std::sync::MutexGuard<'_, QueryCache>> {
        match self.cache.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                tracing::warn!("query cache lock poisoned, bypassing cache");
                None
            }
        }
    }
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[SearchHit]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        println!("{:>3}. [{:.3}] ({}) {}", i + 1, r.score, r.provenance, r.path);
        if !r.snippet.is_empty() {
            println!("     {}", r.snippet);
        }
    }
    println!("\n{} result(s)", results.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::IndexConfig,
        document::IndexedDocument,
        embedding::HashingEmbedder,
    };

    fn hit(path: &str, score: f32, provenance: Provenance) -> SearchHit {
        SearchHit {
            path: path.to_string(),
            filename: crate::document::filename_of(path),
            content: String::new(),
            snippet: String::new(),
            file_type: crate::document::extension_of(path),
            size: 0,
            modified_ts: 0,
            score,
            provenance,
            has_query: false,
        }
    }

    fn params() -> FusionParams {
        FusionParams {
            text_weight: 0.6,
            vector_weight: 0.4,
            hybrid_boost: 1.1,
            filename_bonus: 0.0,
        }
    }

    fn rank_of(hits: &[SearchHit], path: &str) -> usize {
        hits.iter().position(|h| h.path == path).unwrap()
    }

    #[test]
    fn single_mode_hits_keep_native_scores() {
        let fused = fuse(
            vec![hit("/t.txt", 4.0, Provenance::Text)],
            vec![hit("/v.txt", 0.7, Provenance::Vector)],
            &params(),
            &[],
        );
        assert_eq!(fused[0].path, "/t.txt");
        assert_eq!(fused[0].score, 4.0);
        assert_eq!(fused[1].score, 0.7);
        assert_eq!(fused[1].provenance, Provenance::Vector);
    }

    #[test]
    fn shared_paths_become_hybrid() {
        let fused = fuse(
            vec![hit("/a", 2.0, Provenance::Text), hit("/b", 1.0, Provenance::Text)],
            vec![hit("/a", 0.9, Provenance::Vector)],
            &params(),
            &[],
        );
        let a = fused.iter().find(|h| h.path == "/a").unwrap();
        assert_eq!(a.provenance, Provenance::Hybrid);
        assert!(a.score >= 2.0 * 1.1 - 1e-6);
    }

    #[test]
    fn hybrid_rank_is_at_least_best_single_rank() {
        let text = vec![
            hit("/x", 5.0, Provenance::Text),
            hit("/h", 1.0, Provenance::Text),
            hit("/y", 3.0, Provenance::Text),
        ];
        let vector = vec![hit("/h", 0.2, Provenance::Vector), hit("/z", 0.9, Provenance::Vector)];

        let fused = fuse(text.clone(), vector.clone(), &params(), &[]);
        let alone = fuse(
            text.into_iter().filter(|h| h.path != "/h").chain([hit("/h", 1.0, Provenance::Text)]).collect(),
            vector.into_iter().filter(|h| h.path != "/h").collect(),
            &params(),
            &[],
        );
        assert!(rank_of(&fused, "/h") <= rank_of(&alone, "/h"));
    }

    #[test]
    fn filename_bonus_per_token() {
        let p = FusionParams {
            filename_bonus: 0.5,
            ..params()
        };
        let fused = fuse(
            vec![hit("/docs/budget_report.txt", 1.0, Provenance::Text)],
            Vec::new(),
            &p,
            &["budget".to_string(), "report".to_string(), "zzz".to_string()],
        );
        assert!((fused[0].score - 2.0).abs() < 1e-6);
    }

    #[test]
    fn dedupe_ignores_case() {
        let out = dedupe(vec![
            hit("/A.txt", 2.0, Provenance::Text),
            hit("/a.txt", 1.0, Provenance::Vector),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "/A.txt");
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = QueryCache::new(2, Duration::from_secs(60));
        let key = |q: &str| CacheKey {
            query: q.to_string(),
            filters: SearchFilters::default(),
            generation: 0,
        };
        cache.put(key("a"), Vec::new());
        cache.put(key("b"), Vec::new());
        assert!(cache.get(&key("a")).is_some());
        cache.put(key("c"), Vec::new());

        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn cache_entries_expire() {
        let mut cache = QueryCache::new(4, Duration::ZERO);
        let key = CacheKey {
            query: "q".into(),
            filters: SearchFilters::default(),
            generation: 0,
        };
        cache.put(key.clone(), Vec::new());
        assert!(cache.get(&key).is_none());
        assert!(cache.entries.is_empty());
    }

    fn engine(docs: &[(&str, &str)]) -> SearchEngine {
        let index = IndexManager::in_memory(
            &IndexConfig {
                writer_memory_bytes: 15_000_000,
                ..Default::default()
            },
            Some(Arc::new(HashingEmbedder::new(64))),
        )
        .unwrap();
        for (path, content) in docs {
            let mut doc = IndexedDocument::new(path, *content);
            doc.size = content.len() as u64;
            index.add_document(&doc);
        }
        SearchEngine::new(Arc::new(index), SearchConfig::default())
    }

    #[test]
    fn search_fuses_both_modes() {
        let engine = engine(&[
            ("/t/a.txt", "rust ownership and borrowing"),
            ("/t/b.txt", "gardening tips for spring"),
        ]);
        let report = engine.search_with_stats("rust ownership", &SearchFilters::default());
        assert_eq!(report.results[0].path, "/t/a.txt");
        assert_eq!(report.results[0].provenance, Provenance::Hybrid);
        assert!(report.text_hits >= 1);
        assert!(report.vector_hits >= 1);
    }

    #[test]
    fn repeated_search_hits_cache_until_index_changes() {
        let engine = engine(&[("/t/a.txt", "alpha beta")]);
        let none = SearchFilters::default();

        assert!(!engine.search_with_stats("alpha", &none).cached);
        assert!(engine.search_with_stats("  ALPHA ", &none).cached);

        engine.index().add_document(&IndexedDocument::new("/t/b.txt", "alpha"));
        let report = engine.search_with_stats("alpha", &none);
        assert!(!report.cached);
        assert_eq!(report.result_count, 2);

        let stats = engine.cache_stats();
        assert_eq!(stats.hits, 1);
        engine.clear_cache();
        assert_eq!(engine.cache_stats().entries, 0);
    }

    #[test]
    fn structural_filters_apply_to_every_result() {
        let engine = engine(&[
            ("/t/a.txt", "alpha"),
            ("/t/b.md", "alpha alpha alpha"),
            ("/t/c.txt", "alpha and a much longer body of text"),
        ]);
        let filters = SearchFilters {
            file_types: vec!["txt".into()],
            size_max: Some(10),
            ..Default::default()
        };
        let results = engine.search("alpha", &filters);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, "/t/a.txt");
        assert!(results.iter().all(|r| filters.matches(r)));
    }

    #[test]
    fn path_search_uses_globs_and_substrings() {
        let engine = engine(&[
            ("/docs/Report.PDF", "x"),
            ("/docs/notes.txt", "x"),
            ("/other/report-old.txt", "x"),
        ]);
        assert_eq!(
            engine.search_by_path("*.pdf"),
            vec!["/docs/Report.PDF".to_string()]
        );
        assert_eq!(
            engine.search_by_path("report"),
            vec!["/docs/Report.PDF".to_string(), "/other/report-old.txt".to_string()]
        );
        assert!(engine.search_by_path("[").is_empty());
    }

    #[test]
    fn suggestions_are_distinct_filenames() {
        let engine = engine(&[
            ("/a/plan.txt", "roadmap plan"),
            ("/b/plan.txt", "roadmap draft"),
            ("/c/other.txt", "roadmap"),
        ]);
        let s = engine.suggestions("roadmap", 5);
        assert_eq!(s.len(), 2);
        assert!(s.contains(&"plan.txt".to_string()));
        assert!(s.contains(&"other.txt".to_string()));
    }

    #[test]
    fn empty_query_returns_nothing() {
        let engine = engine(&[("/t/a.txt", "alpha")]);
        assert!(engine.search("   ", &SearchFilters::default()).is_empty());
    }
}
