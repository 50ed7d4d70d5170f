use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    config::IndexConfig,
    error::{Error, Result},
    segment::is_unspaced_script,
};

/// Environment variable overriding the configured embedding model.
pub const MODEL_ENV_VAR: &str = "DOCSEEK_MODEL";

/// Upper bound on concurrently loaded model copies.
const MAX_MODEL_INSTANCES: usize = 4;

/// Turns text into a fixed-dimension, L2-normalized vector.
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a search query. Models with a distinct query encoding
    /// override this.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(text)
    }
}

/// Build the embedder described by `config`, or `None` when vectors are
/// disabled.
pub fn from_config(config: &IndexConfig) -> Option<Arc<dyn Embedder>> {
    if !config.embedding_enabled {
        return None;
    }
    let model_id = std::env::var(MODEL_ENV_VAR)
        .unwrap_or_else(|_| config.embedding_model.clone());
    let instances = std::thread::available_parallelism()
        .map_or(1, |n| n.get())
        .min(MAX_MODEL_INSTANCES);
    Some(Arc::new(
        ColbertEmbedder::new(model_id, config.embedding_dimension)
            .with_instances(instances),
    ))
}

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

/// Single-vector embeddings from a ColBERT model.
///
/// ColBERT produces one vector per token; they are mean-pooled into one
/// document vector. Models are loaded on first use, up to `instances`
/// copies, and each call checks one out so encoding runs unlocked.
pub struct ColbertEmbedder {
    model_id: String,
    dimension: usize,
    instances: usize,
    pool: Mutex<ModelPool>,
    returned: Condvar,
}

#[derive(Default)]
struct ModelPool {
    idle: Vec<ColBERT>,
    loaded: usize,
}

impl ColbertEmbedder {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
            instances: 1,
            pool: Mutex::new(ModelPool::default()),
            returned: Condvar::new(),
        }
    }

    /// Allow up to `instances` model copies to encode in parallel.
    pub fn with_instances(mut self, instances: usize) -> Self {
        self.instances = instances.max(1);
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn is_loaded(&self) -> bool {
        self.pool.lock().is_ok_and(|p| p.loaded > 0)
    }

    fn pool(&self) -> Result<MutexGuard<'_, ModelPool>> {
        self.pool
            .lock()
            .map_err(|_| Error::Embedding("model pool poisoned".into()))
    }

    /// Take an idle model, load a new one while under the limit, or wait.
    fn checkout(&self) -> Result<ColBERT> {
        let mut pool = self.pool()?;
        loop {
            if let Some(model) = pool.idle.pop() {
                return Ok(model);
            }
            if pool.loaded < self.instances {
                pool.loaded += 1;
                drop(pool);
                return self.load().inspect_err(|_| {
                    if let Ok(mut pool) = self.pool() {
                        pool.loaded -= 1;
                    }
                    self.returned.notify_one();
                });
            }
            pool = self
                .returned
                .wait(pool)
                .map_err(|_| Error::Embedding("model pool poisoned".into()))?;
        }
    }

    fn checkin(&self, model: ColBERT) {
        if let Ok(mut pool) = self.pool() {
            pool.idle.push(model);
        }
        self.returned.notify_one();
    }

    fn encode(&self, text: &str, is_query: bool) -> Result<Vec<f32>> {
        let mut model = self.checkout()?;
        let encoded = model.encode(&[text.to_string()], is_query);
        self.checkin(model);
        let tokens =
            encoded.map_err(|e| Error::Embedding(format!("encode failed: {e}")))?;

        // [1, T, D] -> [D]
        let pooled = tokens
            .squeeze(0)
            .and_then(|t| t.mean(0))
            .map_err(|e| Error::Embedding(format!("pooling failed: {e}")))?;
        let mut vector = tensor_to_vec(&pooled)?;

        if vector.len() != self.dimension {
            return Err(Error::Embedding(format!(
                "model produced {} dimensions, expected {}",
                vector.len(),
                self.dimension
            )));
        }
        normalize(&mut vector)?;
        Ok(vector)
    }

    fn load(&self) -> Result<ColBERT> {
        tracing::info!(model = %self.model_id, "loading embedding model");
        let loaded: std::result::Result<ColBERT, _> =
            ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into();
        loaded.map_err(|e| {
            Error::Embedding(format!("failed to load {}: {e}", self.model_id))
        })
    }
}

impl Embedder for ColbertEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text, false)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(text, true)
    }
}

fn tensor_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    tensor.to_vec1::<f32>().map_err(|e| {
        Error::Embedding(format!("failed to convert tensor to f32: {e}"))
    })
}

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Needs no model download. Texts sharing words get similar vectors, which
/// is enough for tests and for machines without the model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in hashing_tokens(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let slot = (h % self.dimension as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        normalize(&mut vector)?;
        Ok(vector)
    }
}

fn hashing_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if is_unspaced_script(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(c.to_string());
        } else if c.is_alphanumeric() {
            word.extend(c.to_lowercase());
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

/// Scale `vector` to unit length. A zero vector cannot be compared by
/// cosine and is an error.
fn normalize(vector: &mut [f32]) -> Result<()> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(Error::Embedding("text has no embeddable content".into()));
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    Ok(())
}
