use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

/// Embedding dimension for bge-small-en-v1.5.
pub const DIMENSIONS: usize = 384;

/// Turns text into dense vectors. The gateway owns one of these; tests
/// substitute a deterministic stub.
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("embedder returned no vector"))
    }
}

/// Wraps the fastembed TextEmbedding model (bge-small-en-v1.5, 384 dims).
/// Model is downloaded and cached on first use (~33MB, one-time).
///
/// The inner `TextEmbedding` session is protected by a `Mutex` so that
/// concurrent query embedding and background index writes are serialized,
/// preventing heap corruption in the ONNX Runtime C++ layer.
pub struct FastembedEmbedder {
    model: Mutex<TextEmbedding>,
}

impl FastembedEmbedder {
    /// Initialize the embedding model. Downloads on first run, cached afterwards.
    /// `cache_dir` is the directory where the ONNX model files are stored.
    pub fn new(cache_dir: &Path, show_progress: bool) -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(show_progress),
        )?;
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl Embedder for FastembedEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("model lock poisoned: {e}"))?;
        let results = model.embed(texts.to_vec(), None)?;
        Ok(results.into_iter().map(normalize).collect())
    }
}

/// L2-normalize a vector so cosine similarity == dot product.
/// bge-small-en-v1.5 outputs are already normalized, but the gateway's
/// scoring assumes unit vectors, so normalize here regardless of model.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-10 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    v
}
