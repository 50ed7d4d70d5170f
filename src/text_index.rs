use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
};

use tantivy::{
    DocAddress,
    Index,
    IndexReader,
    IndexWriter,
    TantivyDocument,
    Term,
    collector::{DocSetCollector, TopDocs},
    query::{
        AllQuery,
        BooleanQuery,
        BoostQuery,
        Occur,
        PhraseQuery,
        Query,
        QueryParser,
        TermQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
        WhitespaceTokenizer,
    },
};

use crate::{
    document::{IndexedDocument, SearchFilters},
    error::Result,
    segment::{Segmenter, char_grams, distinct_grams, has_unspaced_script},
};

/// Field names used in the schema.
pub mod fields {
    pub const PATH: &str = "path";
    pub const FILENAME: &str = "filename";
    pub const FILENAME_TOKENS: &str = "filename_tokens";
    pub const FILENAME_CHARS: &str = "filename_chars";
    pub const CONTENT: &str = "content";
    pub const CONTENT_TOKENS: &str = "content_tokens";
    pub const CONTENT_CHARS: &str = "content_chars";
    pub const KEYWORDS: &str = "keywords";
    pub const FILE_TYPE: &str = "file_type";
    pub const SIZE: &str = "size";
    pub const CREATED: &str = "created";
    pub const MODIFIED: &str = "modified";
}

/// Bumped whenever the field set changes; stored next to the index.
pub const SCHEMA_VERSION: u32 = 2;

const STEM_TOKENIZER: &str = "en_stem";
const EXACT_TOKENIZER: &str = "exact";
const GRAM_TOKENIZER: &str = "grams";

const PHRASE_BOOST: f32 = 3.0;
const SEGMENTED_BOOST: f32 = 2.0;
const ANY_TOKEN_BOOST: f32 = 1.0;
const CHAR_BOOST: f32 = 0.5;

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub path: Field,
    pub filename: Field,
    pub filename_tokens: Field,
    pub filename_chars: Field,
    pub content: Field,
    pub content_tokens: Field,
    pub content_chars: Field,
    pub keywords: Field,
    pub file_type: Field,
    pub size: Field,
    pub created: Field,
    pub modified: Field,
}

/// A full-text hit with its stored document.
#[derive(Debug, Clone)]
pub struct TextHit {
    pub score: f32,
    pub doc: IndexedDocument,
}

/// How [`TextIndex::open`] obtained its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Created,
    /// The on-disk index was unreadable or had another field set and was
    /// replaced by an empty one.
    Recreated,
}

fn text_field(tokenizer: &str, stored: bool) -> TextOptions {
    let opts = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(tokenizer)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    if stored { opts.set_stored() } else { opts }
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let path = builder.add_text_field(fields::PATH, STRING | STORED);
    let filename = builder.add_text_field(fields::FILENAME, STRING | STORED);
    let filename_tokens = builder
        .add_text_field(fields::FILENAME_TOKENS, text_field(STEM_TOKENIZER, false));
    let filename_chars = builder
        .add_text_field(fields::FILENAME_CHARS, text_field(GRAM_TOKENIZER, false));
    let content =
        builder.add_text_field(fields::CONTENT, text_field(EXACT_TOKENIZER, true));
    let content_tokens = builder
        .add_text_field(fields::CONTENT_TOKENS, text_field(STEM_TOKENIZER, false));
    let content_chars = builder
        .add_text_field(fields::CONTENT_CHARS, text_field(GRAM_TOKENIZER, false));
    let keywords =
        builder.add_text_field(fields::KEYWORDS, text_field(STEM_TOKENIZER, true));
    let file_type =
        builder.add_text_field(fields::FILE_TYPE, STRING | STORED | FAST);
    let size = builder.add_u64_field(fields::SIZE, STORED | FAST);
    let created = builder.add_u64_field(fields::CREATED, STORED | FAST);
    let modified = builder.add_u64_field(fields::MODIFIED, STORED | FAST);

    let schema = builder.build();
    let fields = SchemaFields {
        path,
        filename,
        filename_tokens,
        filename_chars,
        content,
        content_tokens,
        content_chars,
        keywords,
        file_type,
        size,
        created,
        modified,
    };

    (schema, fields)
}

fn register_tokenizers(index: &Index) {
    let en_stem = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build();
    index.tokenizers().register(STEM_TOKENIZER, en_stem);

    let exact = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .build();
    index.tokenizers().register(EXACT_TOKENIZER, exact);

    let grams = TextAnalyzer::builder(WhitespaceTokenizer::default())
        .filter(LowerCaser)
        .build();
    index.tokenizers().register(GRAM_TOKENIZER, grams);
}

fn field_names(schema: &Schema) -> BTreeSet<String> {
    schema
        .fields()
        .map(|(_, entry)| entry.name().to_string())
        .collect()
}

fn system_error(e: impl std::fmt::Display) -> tantivy::TantivyError {
    tantivy::TantivyError::SystemError(e.to_string())
}

/// Full-text index over [`IndexedDocument`]s, keyed by path.
///
/// Content is indexed three ways: an exact-token field with positions for
/// phrase matching, a stemmed field over word-segmented text, and a
/// per-character field for scripts without word separators.
pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    segmenter: Segmenter,
}

impl TextIndex {
    /// Open the index in `dir`, creating it if missing and replacing it if
    /// it cannot be opened or was built with a different field set.
    pub fn open(dir: &Path) -> Result<(Self, OpenOutcome)> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let outcome = match Self::open_existing(dir, &schema) {
            Ok(Some(index)) => {
                return Ok((Self::from_index(index, fields)?, OpenOutcome::Opened));
            }
            Ok(None) => OpenOutcome::Created,
            Err(e) => {
                tracing::warn!(
                    dir = %dir.display(),
                    error = %e,
                    "full-text index unusable, recreating"
                );
                std::fs::remove_dir_all(dir)?;
                std::fs::create_dir_all(dir)?;
                OpenOutcome::Recreated
            }
        };

        let mmap_dir =
            tantivy::directory::MmapDirectory::open(dir).map_err(system_error)?;
        let index = Index::create(
            mmap_dir,
            schema,
            tantivy::IndexSettings::default(),
        )?;
        Ok((Self::from_index(index, fields)?, outcome))
    }

    /// `Ok(None)` when there is no index yet, an error when the index is
    /// corrupt or has a different field set.
    fn open_existing(dir: &Path, schema: &Schema) -> Result<Option<Index>> {
        let mmap_dir =
            tantivy::directory::MmapDirectory::open(dir).map_err(system_error)?;
        if !Index::exists(&mmap_dir).map_err(system_error)? {
            return Ok(None);
        }
        let index = Index::open(mmap_dir)?;
        if field_names(&index.schema()) != field_names(schema) {
            return Err(system_error("schema field set changed").into());
        }
        Ok(Some(index))
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index.reader()?;
        Ok(Self {
            index,
            reader,
            fields,
            segmenter: Segmenter::new(),
        })
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    /// Create a writer with the given memory budget (in bytes).
    pub fn writer(&self, memory_budget: usize) -> Result<IndexWriter> {
        Ok(self.index.writer(memory_budget)?)
    }

    /// Queue `doc` on `writer`. Visible after the writer commits.
    pub fn add_document(
        &self,
        writer: &IndexWriter,
        doc: &IndexedDocument,
    ) -> Result<()> {
        let f = self.fields;
        let mut d = TantivyDocument::default();
        d.add_text(f.path, &doc.path);
        d.add_text(f.filename, &doc.filename);
        d.add_text(f.filename_tokens, self.segmenter.segment(&doc.filename));
        d.add_text(f.filename_chars, char_grams(&doc.filename));
        d.add_text(f.content, &doc.content);
        d.add_text(f.content_tokens, self.segmenter.segment(&doc.content));
        d.add_text(f.content_chars, char_grams(&doc.content));
        for keyword in &doc.keywords {
            d.add_text(f.keywords, keyword);
        }
        d.add_text(f.file_type, &doc.file_type);
        d.add_u64(f.size, doc.size);
        d.add_u64(f.created, doc.created_ts);
        d.add_u64(f.modified, doc.modified_ts);
        writer.add_document(d)?;
        Ok(())
    }

    /// Queue deletion of every record stored under `path`.
    pub fn delete_document(&self, writer: &IndexWriter, path: &str) {
        writer.delete_term(Term::from_field_text(self.fields.path, path));
    }

    /// Pick up the latest committed snapshot.
    pub fn reload(&self) -> Result<()> {
        Ok(self.reader.reload()?)
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    pub fn schema(&self) -> Schema {
        self.index.schema()
    }

    /// Fetch the stored document for `path`.
    pub fn get_document(&self, path: &str) -> Result<Option<IndexedDocument>> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.fields.path, path),
            IndexRecordOption::Basic,
        );
        let top = searcher.search(&query, &TopDocs::with_limit(1))?;
        match top.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                Ok(Some(self.to_document(&doc)))
            }
            None => Ok(None),
        }
    }

    /// Path of every live record, sorted. A path appears more than once
    /// only if the index holds duplicate records for it.
    pub fn list_paths(&self) -> Result<Vec<String>> {
        let searcher = self.reader.searcher();
        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;
        let mut paths = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            paths.push(extract_text(&doc, self.fields.path));
        }
        paths.sort();
        Ok(paths)
    }

    /// Run the query cascade and merge its hits.
    ///
    /// Stages, most precise first: exact phrase on raw content, segmented
    /// tokens with every token required, segmented tokens with any token,
    /// and every character on the char-gram fields. A failing stage is
    /// logged and skipped. Hits are merged by document, keeping the best
    /// score.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<TextHit>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let searcher = self.reader.searcher();
        let collector = TopDocs::with_limit(limit);

        let mut best: HashMap<DocAddress, f32> = HashMap::new();
        for (stage, built) in self.cascade(query, filters) {
            let query = match built {
                Ok(Some(q)) => q,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(stage, error = %e, "skipping sub-query");
                    continue;
                }
            };
            match searcher.search(&*query, &collector) {
                Ok(top) => {
                    tracing::trace!(stage, hits = top.len(), "sub-query done");
                    for (score, address) in top {
                        let entry = best.entry(address).or_insert(score);
                        *entry = entry.max(score);
                    }
                }
                Err(e) => {
                    tracing::warn!(stage, error = %e, "sub-query failed");
                }
            }
        }

        let mut ranked: Vec<(DocAddress, f32)> = best.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked.truncate(limit);

        let mut hits = Vec::with_capacity(ranked.len());
        for (address, score) in ranked {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push(TextHit {
                score,
                doc: self.to_document(&doc),
            });
        }
        Ok(hits)
    }

    fn cascade(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Vec<(&'static str, Result<Option<Box<dyn Query>>>)> {
        let tokens = self.segmenter.query_tokens(query);
        let mut stages = Vec::with_capacity(4);

        if !filters.filename_only {
            stages.push(("phrase", self.phrase_query(query, filters.whole_word)));
        }
        stages.push((
            "segmented",
            self.token_query(&tokens, true, filters.filename_only),
        ));
        stages.push((
            "any-token",
            self.token_query(&tokens, false, filters.filename_only),
        ));
        if !filters.whole_word {
            stages.push(("chars", Ok(self.char_query(query, filters.filename_only))));
        }
        stages
    }

    /// Char-gram phrase for unspaced scripts unless whole words are
    /// required, exact-token phrase otherwise.
    fn phrase_query(
        &self,
        query: &str,
        whole_word: bool,
    ) -> Result<Option<Box<dyn Query>>> {
        let f = self.fields;
        let terms: Vec<Term> = if has_unspaced_script(query) && !whole_word {
            char_grams(query)
                .split_whitespace()
                .map(|g| Term::from_field_text(f.content_chars, &g.to_lowercase()))
                .collect()
        } else {
            let mut analyzer = self.index.tokenizer_for_field(f.content)?;
            let mut stream = analyzer.token_stream(query);
            let mut terms = Vec::new();
            while stream.advance() {
                terms.push(Term::from_field_text(f.content, &stream.token().text));
            }
            terms
        };

        let query: Box<dyn Query> = match terms.len() {
            0 => return Ok(None),
            1 => Box::new(TermQuery::new(
                terms[0].clone(),
                IndexRecordOption::WithFreqs,
            )),
            _ => Box::new(PhraseQuery::new(terms)),
        };
        Ok(Some(Box::new(BoostQuery::new(query, PHRASE_BOOST))))
    }

    fn token_query(
        &self,
        tokens: &[String],
        conjunction: bool,
        filename_only: bool,
    ) -> Result<Option<Box<dyn Query>>> {
        if tokens.is_empty() {
            return Ok(None);
        }
        let f = self.fields;
        let targets = if filename_only {
            vec![f.filename_tokens]
        } else {
            vec![f.filename_tokens, f.content_tokens, f.keywords]
        };
        let mut parser = QueryParser::for_index(&self.index, targets);
        parser.set_field_boost(f.filename_tokens, 2.0);
        if conjunction {
            parser.set_conjunction_by_default();
        }

        let parsed = parser.parse_query(&tokens.join(" "))?;
        let boost = if conjunction { SEGMENTED_BOOST } else { ANY_TOKEN_BOOST };
        Ok(Some(Box::new(BoostQuery::new(parsed, boost))))
    }

    fn char_query(&self, query: &str, filename_only: bool) -> Option<Box<dyn Query>> {
        let grams = distinct_grams(&query.to_lowercase());
        if grams.is_empty() {
            return None;
        }
        let f = self.fields;
        let term = |field: Field, gram: &str| -> Box<dyn Query> {
            Box::new(TermQuery::new(
                Term::from_field_text(field, gram),
                IndexRecordOption::WithFreqs,
            ))
        };

        let clauses: Vec<(Occur, Box<dyn Query>)> = grams
            .iter()
            .map(|g| {
                let either: Box<dyn Query> = if filename_only {
                    term(f.filename_chars, g)
                } else {
                    Box::new(BooleanQuery::new(vec![
                        (Occur::Should, term(f.content_chars, g)),
                        (Occur::Should, term(f.filename_chars, g)),
                    ]))
                };
                (Occur::Must, either)
            })
            .collect();

        Some(Box::new(BoostQuery::new(
            Box::new(BooleanQuery::new(clauses)),
            CHAR_BOOST,
        )))
    }

    fn to_document(&self, doc: &TantivyDocument) -> IndexedDocument {
        let f = self.fields;
        IndexedDocument {
            path: extract_text(doc, f.path),
            filename: extract_text(doc, f.filename),
            content: extract_text(doc, f.content),
            file_type: extract_text(doc, f.file_type),
            size: extract_u64(doc, f.size),
            created_ts: extract_u64(doc, f.created),
            modified_ts: extract_u64(doc, f.modified),
            keywords: doc
                .get_all(f.keywords)
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect(),
        }
    }
}

impl std::fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str, content: &str) -> IndexedDocument {
        IndexedDocument::new(path, content)
    }

    fn indexed(docs: &[IndexedDocument]) -> TextIndex {
        let idx = TextIndex::open_in_ram().unwrap();
        let mut writer = idx.writer(15_000_000).unwrap();
        for d in docs {
            idx.add_document(&writer, d).unwrap();
        }
        writer.commit().unwrap();
        idx.reload().unwrap();
        idx
    }

    fn paths(hits: &[TextHit]) -> Vec<&str> {
        hits.iter().map(|h| h.doc.path.as_str()).collect()
    }

    #[test]
    fn single_token_round_trip() {
        let idx = indexed(&[doc("/t/a.txt", "alpha beta gamma")]);
        let hits = idx.search("beta", 10, &SearchFilters::default()).unwrap();
        assert_eq!(paths(&hits), vec!["/t/a.txt"]);
        assert_eq!(hits[0].doc.content, "alpha beta gamma");
    }

    #[test]
    fn phrase_outranks_scattered_tokens() {
        let idx = indexed(&[
            doc("/t/scattered.txt", "beta is here and alpha is there"),
            doc("/t/phrase.txt", "we found alpha beta together"),
        ]);
        let hits =
            idx.search("alpha beta", 10, &SearchFilters::default()).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc.path, "/t/phrase.txt");
    }

    #[test]
    fn any_token_stage_finds_partial_matches() {
        let idx = indexed(&[doc("/t/a.txt", "only alpha lives here")]);
        let hits =
            idx.search("alpha omega", 10, &SearchFilters::default()).unwrap();
        assert_eq!(paths(&hits), vec!["/t/a.txt"]);
    }

    #[test]
    fn stemming_matches_inflections() {
        let idx = indexed(&[doc("/t/a.txt", "the runners were running")]);
        let hits = idx.search("run", 10, &SearchFilters::default()).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn single_ideograph_matches_inside_words() {
        let idx = indexed(&[doc("/t/cn.txt", "这是一份项目报告")]);
        let hits = idx.search("报", 10, &SearchFilters::default()).unwrap();
        assert_eq!(paths(&hits), vec!["/t/cn.txt"]);

        let whole_word = SearchFilters {
            whole_word: true,
            ..Default::default()
        };
        let hits = idx.search("告", 10, &whole_word).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn filename_only_ignores_content() {
        let idx = indexed(&[
            doc("/t/budget.txt", "numbers"),
            doc("/t/notes.txt", "the budget is tight"),
        ]);
        let filters = SearchFilters {
            filename_only: true,
            ..Default::default()
        };
        let hits = idx.search("budget", 10, &filters).unwrap();
        assert_eq!(paths(&hits), vec!["/t/budget.txt"]);
    }

    #[test]
    fn query_syntax_is_harmless() {
        let idx = indexed(&[doc("/t/a.txt", "alpha beta")]);
        let hits = idx
            .search("alpha) AND (\"beta", 10, &SearchFilters::default())
            .unwrap();
        assert_eq!(paths(&hits), vec!["/t/a.txt"]);
    }

    #[test]
    fn delete_by_path() {
        let idx = indexed(&[doc("/t/a.txt", "alpha"), doc("/t/b.txt", "alpha")]);
        let mut writer = idx.writer(15_000_000).unwrap();
        idx.delete_document(&writer, "/t/a.txt");
        writer.commit().unwrap();
        idx.reload().unwrap();

        let hits = idx.search("alpha", 10, &SearchFilters::default()).unwrap();
        assert_eq!(paths(&hits), vec!["/t/b.txt"]);
        assert_eq!(idx.num_docs(), 1);
    }

    #[test]
    fn get_and_list_documents() {
        let mut d = doc("/t/a.md", "body");
        d.size = 4;
        d.modified_ts = 77;
        d.keywords = vec!["one".into(), "two".into()];
        let idx = indexed(&[d.clone(), doc("/t/b.md", "other")]);

        assert_eq!(idx.get_document("/t/a.md").unwrap(), Some(d));
        assert_eq!(idx.get_document("/t/zzz").unwrap(), None);
        assert_eq!(idx.list_paths().unwrap(), vec!["/t/a.md", "/t/b.md"]);
    }

    #[test]
    fn keywords_are_searchable() {
        let mut d = doc("/t/a.txt", "plain body");
        d.keywords = vec!["quarterly".into()];
        let idx = indexed(&[d]);
        let hits =
            idx.search("quarterly", 10, &SearchFilters::default()).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn reopen_keeps_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("text");
        {
            let (idx, outcome) = TextIndex::open(&dir).unwrap();
            assert_eq!(outcome, OpenOutcome::Created);
            let mut writer = idx.writer(15_000_000).unwrap();
            idx.add_document(&writer, &doc("/t/a.txt", "persistent data"))
                .unwrap();
            writer.commit().unwrap();
        }
        let (idx, outcome) = TextIndex::open(&dir).unwrap();
        assert_eq!(outcome, OpenOutcome::Opened);
        idx.reload().unwrap();
        assert_eq!(idx.num_docs(), 1);
    }

    #[test]
    fn corrupt_index_is_recreated() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("text");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("meta.json"), b"{ not json").unwrap();

        let (idx, outcome) = TextIndex::open(&dir).unwrap();
        assert_eq!(outcome, OpenOutcome::Recreated);
        assert_eq!(idx.num_docs(), 0);
    }
}
