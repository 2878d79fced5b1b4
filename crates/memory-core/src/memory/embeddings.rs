//! ============================================================================
//! Embedding Service - Text to fixed-length vectors
//! ============================================================================
//! The built-in backend is a structural hash: text is split into chunks, each
//! chunk is hashed with SHA-256 and its bytes are scattered into vector slots,
//! then the vector is L2-normalized. It is deterministic but NOT semantic;
//! similar meanings do not land near each other. Swap in a real model by
//! implementing `Embedder`.
//! ============================================================================

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};

/// Default dimension, matching the sentence model the hash stands in for
pub const EMBEDDING_DIM: usize = 768;

/// Target number of chunks a text is split into
const TARGET_CHUNKS: usize = 100;
/// Slots filled per chunk (one SHA-256 digest)
const SLOTS_PER_CHUNK: usize = 32;

/// Text embedding backend
pub trait Embedder: Send + Sync {
    /// Total and deterministic. Empty text, or any internal failure, yields
    /// the zero vector.
    fn embed(&self, text: &str) -> Vec<f32>;

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;
}

/// Deterministic structural-hash embedder
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if text.is_empty() || self.dimension == 0 {
            return vector;
        }

        let chars: Vec<char> = text.chars().collect();
        let chunk_size = (chars.len() / TARGET_CHUNKS).max(1);
        let chunks: Vec<String> = chars
            .chunks(chunk_size)
            .map(|c| c.iter().collect())
            .collect();

        // Chunks past the end of the vector wrap around and accumulate
        for (i, chunk) in chunks.iter().enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(chunk.as_bytes());
            hasher.update(i.to_string().as_bytes());
            let digest = hasher.finalize();

            for (j, byte) in digest.iter().take(SLOTS_PER_CHUNK).enumerate() {
                let slot = (i * SLOTS_PER_CHUNK + j) % self.dimension;
                vector[slot] += *byte as f32 / 128.0 - 1.0;
            }
        }

        normalize(&mut vector);
        debug!("Embedded {} chars into {} dims", chars.len(), self.dimension);
        vector
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hash"
    }
}

/// Scale `v` to unit L2 norm in place; zero and non-finite vectors are zeroed
pub fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        v.iter_mut().for_each(|x| *x /= norm);
    } else {
        v.iter_mut().for_each(|x| *x = 0.0);
    }
}

/// A vector that cannot match anything (all zeros, or any NaN/inf)
pub fn is_degenerate(v: &[f32]) -> bool {
    v.is_empty() || v.iter().any(|x| !x.is_finite()) || v.iter().all(|x| *x == 0.0)
}

/// Create the configured embedding backend
pub fn create_embedder(config: &MemoryConfig) -> Result<Arc<dyn Embedder>> {
    match config.embedding_backend.as_str() {
        "hash" => {
            info!(
                "Using structural-hash embeddings ({} dims, not semantic)",
                config.embedding_dim
            );
            Ok(Arc::new(HashEmbedder::new(config.embedding_dim)))
        }
        other => Err(MemoryError::EmbeddingUnavailable(format!(
            "unknown embedding backend '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed("alan说你好;爱莉说很高兴认识你");
        let b = embedder.embed("alan说你好;爱莉说很高兴认识你");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
    }

    #[test]
    fn test_empty_is_zero() {
        let embedder = HashEmbedder::default();
        let v = embedder.embed("");
        assert!(v.iter().all(|x| *x == 0.0));
        assert!(is_degenerate(&v));
    }

    #[test]
    fn test_unit_norm() {
        let embedder = HashEmbedder::new(64);
        let long = "long text ".repeat(200);
        for text in ["a", "hello world", long.as_str()] {
            let v = embedder.embed(text);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4, "norm {} for {:?}", norm, text);
        }
    }

    #[test]
    fn test_different_text_differs() {
        let embedder = HashEmbedder::default();
        assert_ne!(embedder.embed("hi"), embedder.embed("bye"));
    }

    #[test]
    fn test_unknown_backend_unavailable() {
        let config = MemoryConfig {
            embedding_backend: "bert".into(),
            ..Default::default()
        };
        assert!(matches!(
            create_embedder(&config),
            Err(MemoryError::EmbeddingUnavailable(_))
        ));
    }

    #[test]
    fn test_degenerate_detection() {
        assert!(is_degenerate(&[]));
        assert!(is_degenerate(&[0.0, f32::NAN]));
        assert!(!is_degenerate(&[0.0, 1.0]));
    }
}
