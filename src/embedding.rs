//! Text embedding behind a small trait so tests and retrieval fallbacks can
//! substitute a deterministic implementation.

use anyhow::Result;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::info;

/// Fixed embedding dimension for AllMiniLM-L6-v2.
pub const EMBEDDING_DIM: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Lazy-loaded fastembed model. Nothing is downloaded until the first
/// `embed` call; the model then lives for the process lifetime.
pub struct FastEmbedder {
    model: tokio::sync::OnceCell<Mutex<TextEmbedding>>,
    cache_dir: PathBuf,
}

impl FastEmbedder {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            model: tokio::sync::OnceCell::new(),
            cache_dir,
        }
    }

    async fn get_model(&self) -> Result<&Mutex<TextEmbedding>> {
        self.model
            .get_or_try_init(|| async {
                info!("[Embedding] Loading AllMiniLM-L6-v2 (cache: {})", self.cache_dir.display());
                let model = TextEmbedding::try_new(
                    InitOptions::new(EmbeddingModel::AllMiniLML6V2)
                        .with_cache_dir(self.cache_dir.clone()),
                )?;
                info!("[Embedding] Model ready");
                Ok(Mutex::new(model))
            })
            .await
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.get_model().await?;
        let mut guard = model.lock().await;
        let embeddings = guard.embed(vec![text], None)?;
        Ok(embeddings[0].clone())
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Deterministic embedder for tests: hashes words into a sparse vector so
    /// that texts sharing words land close in cosine space.
    pub struct StubEmbedder;

    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut v = vec![0.0f32; EMBEDDING_DIM];
            for word in text.to_lowercase().split_whitespace() {
                let mut h: u64 = 1469598103934665603;
                for b in word.bytes() {
                    h ^= b as u64;
                    h = h.wrapping_mul(1099511628211);
                }
                v[(h % EMBEDDING_DIM as u64) as usize] += 1.0;
            }
            Ok(v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubEmbedder;
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, -0.2, 0.9];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        let a = vec![0.0; 4];
        let b = vec![1.0, 0.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[tokio::test]
    async fn stub_embedder_groups_similar_texts() {
        let e = StubEmbedder;
        let a = e.embed("the cat sat").await.unwrap();
        let b = e.embed("the cat slept").await.unwrap();
        let c = e.embed("quarterly revenue projections").await.unwrap();
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        assert_eq!(a.len(), EMBEDDING_DIM);
    }
}
