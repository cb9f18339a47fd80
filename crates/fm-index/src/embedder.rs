use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Embedding model provider as the core sees it. Real providers call out to
/// a model service; the worker only needs a vector of the configured
/// dimension per chunk of text.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Deterministic hash-derived vectors; the offline default and the test
/// provider. Equal text always maps to an equal vector, so idempotence
/// checks hold without a model in the loop.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.dim);
        let mut counter: u32 = 0;
        let mut digest = Sha256::digest(text.as_bytes());
        let mut offset = 0;
        while out.len() < self.dim {
            if offset >= digest.len() {
                counter += 1;
                let mut hasher = Sha256::new();
                hasher.update(text.as_bytes());
                hasher.update(counter.to_le_bytes());
                digest = hasher.finalize();
                offset = 0;
            }
            // Map one byte onto [-1.0, 1.0].
            let byte = digest[offset];
            out.push((byte as f32 / 127.5) - 1.0);
            offset += 1;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vectors_match_requested_dimension() {
        for dim in [4, 32, 384] {
            let embedder = HashEmbedder::new(dim);
            let v = embedder.embed("hello").await.unwrap();
            assert_eq!(v.len(), dim);
            assert!(v.iter().all(|x| (-1.0..=1.0).contains(x)));
        }
    }

    #[tokio::test]
    async fn deterministic_and_text_sensitive() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("hello").await.unwrap();
        let b = embedder.embed("hello").await.unwrap();
        let c = embedder.embed("world").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
