use std::{
    collections::BTreeMap,
    path::Path,
};

use serde::{Deserialize, Serialize};
use usearch::{
    Index,
    ffi::{IndexOptions, MetricKind, ScalarKind},
};

use crate::{
    data_dir::{temp_sibling, write_atomic},
    error::{Error, Result},
};

/// What the vector store knows about a live vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorMeta {
    pub path: String,
    pub filename: String,
    pub file_type: String,
    pub modified: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub id: u64,
    /// Cosine similarity clamped to `[0, 1]`.
    pub similarity: f32,
    pub meta: VectorMeta,
}

/// Consistency report between the ANN structure and the metadata map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VectorIntegrity {
    pub live: usize,
    pub slots: usize,
    /// Slots whose metadata was removed. Reclaimed only by a rebuild.
    pub tombstoned: usize,
    /// Metadata ids with no vector in the ANN structure.
    pub missing: Vec<u64>,
    /// Metadata ids at or above `next_id`.
    pub out_of_range: Vec<u64>,
}

impl VectorIntegrity {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.out_of_range.is_empty()
    }
}

/// Persisted metadata document: `{metadata: {id: {...}}, next_id: N}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    metadata: BTreeMap<u64, VectorMeta>,
    next_id: u64,
    #[serde(default)]
    dimension: usize,
}

fn vector_error(e: impl std::fmt::Display) -> Error {
    Error::Vector(e.to_string())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        Error::Vector(format!("non UTF-8 path: {}", path.display()))
    })
}

/// Append-only HNSW index with an id→metadata map.
///
/// Ids come from a monotonic counter and are never reused. Deleting a
/// document only drops its metadata entry; the vector stays in the graph
/// and is filtered out of results.
pub struct VectorStore {
    index: Index,
    metadata: BTreeMap<u64, VectorMeta>,
    next_id: u64,
    dimension: usize,
}

impl VectorStore {
    pub fn new(dimension: usize) -> Result<Self> {
        Ok(Self {
            index: Self::new_index(dimension)?,
            metadata: BTreeMap::new(),
            next_id: 0,
            dimension,
        })
    }

    fn new_index(dimension: usize) -> Result<Index> {
        let options = IndexOptions {
            dimensions: dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: 0,
            expansion_add: 0,
            expansion_search: 0,
            multi: false,
        };
        Index::new(&options).map_err(vector_error)
    }

    /// Load a store saved with [`VectorStore::save`].
    ///
    /// Missing files give an empty store. Unreadable files, or files for
    /// another dimension, are discarded and also give an empty store; the
    /// second element of the result is `true` in that case.
    pub fn open(
        index_path: &Path,
        meta_path: &Path,
        dimension: usize,
    ) -> Result<(Self, bool)> {
        if !meta_path.exists() {
            return Ok((Self::new(dimension)?, false));
        }
        match Self::load(index_path, meta_path, dimension) {
            Ok(store) => Ok((store, false)),
            Err(e) => {
                tracing::warn!(
                    path = %index_path.display(),
                    error = %e,
                    "vector index unusable, recreating"
                );
                Ok((Self::new(dimension)?, true))
            }
        }
    }

    fn load(index_path: &Path, meta_path: &Path, dimension: usize) -> Result<Self> {
        let raw = std::fs::read_to_string(meta_path)?;
        let file: MetadataFile = serde_json::from_str(&raw)?;
        if file.dimension != 0 && file.dimension != dimension {
            return Err(Error::Vector(format!(
                "stored dimension {} differs from configured {dimension}",
                file.dimension
            )));
        }

        let index = Self::new_index(dimension)?;
        if index_path.exists() && std::fs::metadata(index_path)?.len() > 0 {
            index.load(path_str(index_path)?).map_err(vector_error)?;
        }
        if index.dimensions() != dimension {
            return Err(Error::Vector("index blob has another dimension".into()));
        }
        if let Some(max) = file.metadata.keys().next_back()
            && *max >= file.next_id
        {
            return Err(Error::Vector(format!(
                "metadata id {max} is not below next_id {}",
                file.next_id
            )));
        }

        Ok(Self {
            index,
            metadata: file.metadata,
            next_id: file.next_id,
            dimension,
        })
    }

    /// Write the index blob and the metadata document, each through a
    /// temporary file renamed into place.
    pub fn save(&self, index_path: &Path, meta_path: &Path) -> Result<()> {
        if let Some(parent) = index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = temp_sibling(index_path);
        self.index.save(path_str(&tmp)?).map_err(vector_error)?;
        std::fs::rename(&tmp, index_path)?;

        let file = MetadataFile {
            metadata: self.metadata.clone(),
            next_id: self.next_id,
            dimension: self.dimension,
        };
        write_atomic(meta_path, &serde_json::to_vec(&file)?)?;
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Number of live (non-deleted) vectors.
    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Append `vector` under a fresh id.
    pub fn add(&mut self, meta: VectorMeta, vector: &[f32]) -> Result<u64> {
        if vector.len() != self.dimension {
            return Err(Error::Vector(format!(
                "vector has {} dimensions, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        if self.index.size() + 1 > self.index.capacity() {
            let grown = (self.index.capacity() * 2).max(64);
            self.index.reserve(grown).map_err(vector_error)?;
        }

        let id = self.next_id;
        self.index.add(id, vector).map_err(vector_error)?;
        self.next_id += 1;
        self.metadata.insert(id, meta);
        Ok(id)
    }

    /// Drop every live entry for `path`. Returns how many were removed.
    pub fn remove_path(&mut self, path: &str) -> usize {
        let before = self.metadata.len();
        self.metadata.retain(|_, meta| meta.path != path);
        before - self.metadata.len()
    }

    /// Remove any entry for `meta.path` and append the new vector.
    pub fn replace(&mut self, meta: VectorMeta, vector: &[f32]) -> Result<u64> {
        self.remove_path(&meta.path);
        self.add(meta, vector)
    }

    /// Paths with a live vector, in id order.
    pub fn live_paths(&self) -> Vec<String> {
        self.metadata.values().map(|meta| meta.path.clone()).collect()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.metadata.values().any(|meta| meta.path == path)
    }

    /// Nearest live vectors to `query`, best first, at most `limit`.
    ///
    /// Asks the graph for twice as many neighbours as requested to make up
    /// for tombstoned slots.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if query.len() != self.dimension {
            return Err(Error::Vector(format!(
                "query has {} dimensions, expected {}",
                query.len(),
                self.dimension
            )));
        }
        let k = (2 * limit).min(self.index.size());
        if k == 0 || self.metadata.is_empty() {
            return Ok(Vec::new());
        }

        let matches = self.index.search(query, k).map_err(vector_error)?;
        let mut hits = Vec::with_capacity(matches.keys.len());
        for (id, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(meta) = self.metadata.get(id) {
                hits.push(VectorHit {
                    id: *id,
                    similarity: (1.0 - distance).clamp(0.0, 1.0),
                    meta: meta.clone(),
                });
            }
        }
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn integrity(&self) -> VectorIntegrity {
        let missing: Vec<u64> = self
            .metadata
            .keys()
            .copied()
            .filter(|id| !self.index.contains(*id))
            .collect();
        let out_of_range: Vec<u64> = self
            .metadata
            .keys()
            .copied()
            .filter(|id| *id >= self.next_id)
            .collect();
        let slots = self.index.size();
        VectorIntegrity {
            live: self.metadata.len(),
            slots,
            tombstoned: slots.saturating_sub(self.metadata.len() - missing.len()),
            missing,
            out_of_range,
        }
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dimension", &self.dimension)
            .field("live", &self.metadata.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}
