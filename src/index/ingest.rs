//! Mailbox ingestion: fetch, normalize, embed, publish.
//!
//! `load_emails` always publishes a complete new generation and flips
//! it active in one transaction; a failure anywhere leaves the
//! previously committed generation untouched and searchable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::FetchMode;
use crate::embedding::Embedder;
use crate::error::IndexError;
use crate::index::store::IndexStore;
use crate::mail::{EmailRecord, MailSource, normalize};

/// Outcome of a successful ingestion run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    /// Messages fetched from the mailbox this run.
    pub fetched: usize,
    /// Newly embedded and indexed records.
    pub indexed: usize,
    /// Records carried forward from the previous generation.
    pub carried_forward: i64,
    /// Total rows in the now-active generation.
    pub total: i64,
}

/// Ingestion orchestrator. One instance per index; concurrent
/// `load_emails` calls are rejected, never interleaved.
pub struct Indexer {
    source: Arc<dyn MailSource>,
    embedder: Arc<dyn Embedder>,
    store: Arc<IndexStore>,
    fetch_mode: FetchMode,
    inflight: Arc<Mutex<()>>,
}

/// The single-flight claim on an ingestion run. Held for the duration
/// of the run; dropping it releases the slot.
pub struct IngestPermit {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Indexer {
    pub fn new(
        source: Arc<dyn MailSource>,
        embedder: Arc<dyn Embedder>,
        store: Arc<IndexStore>,
        fetch_mode: FetchMode,
    ) -> Self {
        Self {
            source,
            embedder,
            store,
            fetch_mode,
            inflight: Arc::new(Mutex::new(())),
        }
    }

    /// Claim the single-flight slot without starting work, so callers
    /// can report a rejection before handing the run to a background
    /// task. Fails with `IngestionInProgress` when a run holds it.
    pub fn try_begin(&self) -> Result<IngestPermit, IndexError> {
        let guard = Arc::clone(&self.inflight)
            .try_lock_owned()
            .map_err(|_| IndexError::IngestionInProgress)?;
        Ok(IngestPermit { _guard: guard })
    }

    /// Run one ingestion pass: fetch (full mailbox, or since the last
    /// marker in incremental mode), normalize, embed, and publish a
    /// new generation. The last-checked marker advances to the fetch
    /// start time only after the generation is active.
    pub async fn load_emails(&self) -> Result<IngestReport, IndexError> {
        let permit = self.try_begin()?;
        self.run(permit).await
    }

    /// Run one ingestion pass under an already claimed permit.
    pub async fn run(&self, _permit: IngestPermit) -> Result<IngestReport, IndexError> {
        let started_at = Utc::now();

        let since = match self.fetch_mode {
            FetchMode::Full => None,
            FetchMode::Incremental => self.store.last_checked().await?,
        };

        let raw_messages = self.source.fetch(since).await?;
        let fetched = raw_messages.len();
        info!(fetched, incremental = since.is_some(), "Mailbox fetch complete");

        let mut records: Vec<EmailRecord> = Vec::with_capacity(fetched);
        for raw in &raw_messages {
            match normalize(&raw.raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unparseable message"),
            }
        }

        let generation = self
            .store
            .begin_generation(self.embedder.model_id(), self.embedder.dimension())
            .await?;

        match self.build_generation(generation, records, fetched).await {
            Ok(report) => {
                self.store.advance_last_checked(started_at).await?;
                info!(
                    generation,
                    indexed = report.indexed,
                    total = report.total,
                    "Ingestion complete"
                );
                Ok(report)
            }
            Err(e) => {
                // Abandon the partial generation; the previous active
                // one stays committed.
                let _ = self.store.mark_failed(generation).await;
                Err(e)
            }
        }
    }

    async fn build_generation(
        &self,
        generation: i64,
        records: Vec<EmailRecord>,
        fetched: usize,
    ) -> Result<IngestReport, IndexError> {
        // Carry forward the previous generation's rows when its vectors
        // are still comparable (same embedding model).
        let mut carried_forward = 0i64;
        let mut seen_ids = std::collections::HashSet::new();
        if let Some(active) = self.store.active_generation().await? {
            if active.model_id == self.embedder.model_id()
                && active.dimension == self.embedder.dimension()
            {
                carried_forward = self
                    .store
                    .copy_generation_rows(active.id, generation)
                    .await?;
                seen_ids = self.store.message_ids(generation).await?;
            } else {
                warn!(
                    index_model = %active.model_id,
                    active_model = %self.embedder.model_id(),
                    "Embedding model changed; rebuilding index from this fetch only"
                );
            }
        }

        let mut fresh: Vec<EmailRecord> = Vec::new();
        for record in records {
            if seen_ids.insert(record.message_id.clone()) {
                fresh.push(record);
            }
        }

        let texts: Vec<String> = fresh.iter().map(|r| r.embedding_text()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        let mut ordinal = carried_forward;
        for (record, vector) in fresh.iter().zip(vectors.iter()) {
            self.store
                .append_record(generation, ordinal, record, vector)
                .await?;
            ordinal += 1;
        }

        let total = carried_forward + fresh.len() as i64;
        self.store.activate_generation(generation, total).await?;

        Ok(IngestReport {
            fetched,
            indexed: fresh.len(),
            carried_forward,
            total,
        })
    }

    /// Whether an ingestion run is currently holding the single-flight
    /// lock. Advisory only; `load_emails` re-checks atomically.
    pub fn ingestion_in_progress(&self) -> bool {
        self.inflight.try_lock().is_err()
    }

    /// Timestamp of the most recent successful ingestion.
    pub async fn last_checked(&self) -> Result<Option<DateTime<Utc>>, IndexError> {
        self.store.last_checked().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::error::MailError;
    use crate::index::SearchEngine;
    use crate::mail::RawMail;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn raw(message_id: &str, subject: &str, body: &str) -> RawMail {
        RawMail {
            raw: format!(
                "Message-ID: <{message_id}>\r\n\
                 From: alice@example.com\r\n\
                 To: me@example.com\r\n\
                 Subject: {subject}\r\n\
                 Date: Mon, 6 Jan 2025 10:30:00 +0000\r\n\
                 \r\n\
                 {body}\r\n"
            )
            .into_bytes(),
        }
    }

    /// Pops one pre-canned batch per fetch call.
    struct FakeSource {
        batches: StdMutex<Vec<Vec<RawMail>>>,
        delay: Option<Duration>,
    }

    impl FakeSource {
        fn new(batches: Vec<Vec<RawMail>>) -> Self {
            Self {
                batches: StdMutex::new(batches),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl MailSource for FakeSource {
        async fn fetch(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<RawMail>, MailError> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(batches.remove(0))
            }
        }
    }

    struct FailingSource;

    #[async_trait]
    impl MailSource for FailingSource {
        async fn fetch(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<RawMail>, MailError> {
            Err(MailError::Timeout)
        }
    }

    fn indexer(source: Arc<dyn MailSource>, store: Arc<IndexStore>, mode: FetchMode) -> Indexer {
        Indexer::new(source, Arc::new(HashEmbedder::new(64)), store, mode)
    }

    #[tokio::test]
    async fn full_ingestion_indexes_all_messages() {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());
        let source = Arc::new(FakeSource::new(vec![vec![
            raw("m1@x", "Invoice #42", "pay the invoice"),
            raw("m2@x", "Lunch", "sandwiches"),
        ]]));

        let indexer = indexer(source, Arc::clone(&store), FetchMode::Full);
        let report = indexer.load_emails().await.unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(report.indexed, 2);
        assert_eq!(report.total, 2);
        assert!(indexer.last_checked().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn incremental_run_carries_forward_and_dedups() {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());
        let source = Arc::new(FakeSource::new(vec![
            vec![raw("m1@x", "First", "one"), raw("m2@x", "Second", "two")],
            // Second fetch re-delivers m2 (day-granular SINCE) plus one new.
            vec![raw("m2@x", "Second", "two"), raw("m3@x", "Third", "three")],
        ]));

        let indexer = indexer(source, Arc::clone(&store), FetchMode::Incremental);

        let first = indexer.load_emails().await.unwrap();
        assert_eq!(first.total, 2);

        let second = indexer.load_emails().await.unwrap();
        assert_eq!(second.carried_forward, 2);
        assert_eq!(second.indexed, 1);
        assert_eq!(second.total, 3);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_previous_generation_searchable() {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());
        let good_source = Arc::new(FakeSource::new(vec![vec![raw(
            "m1@x",
            "Invoice #42",
            "pay the invoice",
        )]]));

        let good = indexer(good_source, Arc::clone(&store), FetchMode::Full);
        good.load_emails().await.unwrap();
        let marker = good.last_checked().await.unwrap();

        let bad = indexer(Arc::new(FailingSource), Arc::clone(&store), FetchMode::Full);
        let err = bad.load_emails().await.unwrap_err();
        assert!(matches!(err, IndexError::Mail(MailError::Timeout)));

        // Prior generation still serves results; marker did not move.
        let engine = SearchEngine::new(Arc::clone(&store), Arc::new(HashEmbedder::new(64)));
        let results = engine.vector_search("invoice", 25).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(bad.last_checked().await.unwrap(), marker);
    }

    #[tokio::test]
    async fn concurrent_ingestion_is_rejected() {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());
        let mut slow = FakeSource::new(vec![vec![raw("m1@x", "S", "b")]]);
        slow.delay = Some(Duration::from_millis(200));

        let indexer = Arc::new(indexer(Arc::new(slow), store, FetchMode::Full));

        let a = Arc::clone(&indexer);
        let first = tokio::spawn(async move { a.load_emails().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = indexer.load_emails().await;
        assert!(matches!(second, Err(IndexError::IngestionInProgress)));

        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unparseable_messages_are_skipped() {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());
        let source = Arc::new(FakeSource::new(vec![vec![
            raw("m1@x", "Good", "fine"),
            RawMail { raw: Vec::new() },
        ]]));

        let indexer = indexer(source, store, FetchMode::Full);
        let report = indexer.load_emails().await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.indexed, 1);
        assert_eq!(report.total, 1);
    }
}
