//! Semantic search over the active index generation.

use std::sync::Arc;

use tracing::debug;

use crate::embedding::{Embedder, cosine_similarity};
use crate::error::IndexError;
use crate::index::store::IndexStore;
use crate::mail::EmailRecord;

/// One search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: EmailRecord,
    pub score: f32,
}

/// Query-time engine: embeds the query with the live embedder and ranks
/// the active generation's vectors by cosine similarity.
pub struct SearchEngine {
    store: Arc<IndexStore>,
    embedder: Arc<dyn Embedder>,
}

impl SearchEngine {
    pub fn new(store: Arc<IndexStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Top-`k` matching emails rendered as delimited text blocks.
    ///
    /// An empty index yields an empty Vec. A generation built with a
    /// different embedding model, or one whose row count no longer
    /// matches its activation record, fails closed instead of returning
    /// misaligned results.
    pub async fn vector_search(&self, query: &str, k: usize) -> Result<Vec<String>, IndexError> {
        let hits = self.search(query, k).await?;
        Ok(hits.iter().map(|h| format_email_block(&h.record)).collect())
    }

    /// Structured variant of [`vector_search`](Self::vector_search).
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchHit>, IndexError> {
        let Some(generation) = self.store.active_generation().await? else {
            return Ok(Vec::new());
        };

        if generation.model_id != self.embedder.model_id() {
            return Err(IndexError::ModelMismatch {
                index_model: generation.model_id,
                active_model: self.embedder.model_id().to_string(),
            });
        }
        self.store.verify_generation(&generation).await?;

        let query_vector = self.embedder.embed(query).await?;

        let vectors = self.store.vectors(generation.id, generation.dimension).await?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }

        // Rank by descending similarity; ties fall back to ingestion
        // order so identical index state always yields identical output.
        let mut scored: Vec<(i64, f32)> = vectors
            .iter()
            .map(|(ordinal, v)| (*ordinal, cosine_similarity(&query_vector, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);

        let ordinals: Vec<i64> = scored.iter().map(|(o, _)| *o).collect();
        let records = self.store.records_by_ordinals(generation.id, &ordinals).await?;

        debug!(query_len = query.len(), hits = records.len(), "Vector search complete");

        Ok(records
            .into_iter()
            .zip(scored.iter().map(|(_, s)| *s))
            .map(|(record, score)| SearchHit { record, score })
            .collect())
    }
}

/// Render a record as the delimited block downstream parsers key on.
/// The field labels are a wire format; do not reword them.
pub fn format_email_block(record: &EmailRecord) -> String {
    format!(
        "<Email Start>\n\
         Date and Time: {}\n\
         Sender: {}\n\
         CC: {}\n\
         Subject: {}\n\
         Email Context: {}\n\
         <Email End>",
        record.timestamp.to_rfc3339(),
        record.sender,
        record.cc.join(", "),
        record.subject,
        record.body,
    )
}
