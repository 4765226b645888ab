//! Deterministic token-hash embedder.
//!
//! Maps each lowercased alphanumeric token to a bucket via FNV-1a and
//! accumulates a signed count per bucket, then L2-normalizes. Texts
//! sharing tokens land near each other, which is enough for offline
//! use and for exercising the retrieval path in tests without a
//! network embedding provider.

use async_trait::async_trait;

use crate::embedding::Embedder;
use crate::error::EmbeddingError;

/// Model id recorded on generations built with this embedder. Bump if
/// the hashing scheme ever changes, so stale indexes are rejected.
pub const HASH_MODEL_ID: &str = "token-hash-v1";

pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in tokens(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(self.embed_sync(text))
    }

    fn model_id(&self) -> &str {
        HASH_MODEL_ID
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// FNV-1a 64-bit. Stable across platforms and releases, unlike the
/// std `DefaultHasher`, so persisted vectors stay comparable.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
