//! Persisted vector index: generation store, search, and ingestion.

pub mod ingest;
pub mod search;
pub mod store;

pub use ingest::{IngestReport, Indexer};
pub use search::SearchEngine;
pub use store::{Generation, IndexStore};
