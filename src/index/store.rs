//! libSQL-backed index store.
//!
//! One row per ingested email holds both the metadata fields and the
//! embedding blob, so vectors and metadata cannot drift apart. Rows
//! belong to a *generation*: ingestion writes a fresh generation with
//! status `building` and publishes it by flipping it to `active` in a
//! single transaction. Searches only ever read the active generation,
//! and retired generations are pruned on the *next* activation, so an
//! in-flight reader never observes a torn index.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::mail::EmailRecord;

/// Metadata for one index generation.
#[derive(Debug, Clone)]
pub struct Generation {
    pub id: i64,
    pub model_id: String,
    pub dimension: usize,
    /// Row count recorded at activation; `None` while building.
    pub email_count: Option<i64>,
}

/// Persistent store for index generations, email rows, and the
/// last-checked marker.
pub struct IndexStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl IndexStore {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IndexError::Database(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| IndexError::Database(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| IndexError::Database(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Index store opened");
        Ok(store)
    }

    /// Create an in-memory store (for tests).
    pub async fn new_memory() -> Result<Self, IndexError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| IndexError::Database(format!("Failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| IndexError::Database(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS generations (
                    id           INTEGER PRIMARY KEY AUTOINCREMENT,
                    status       TEXT NOT NULL DEFAULT 'building',
                    model_id     TEXT NOT NULL,
                    dimension    INTEGER NOT NULL,
                    email_count  INTEGER,
                    created_at   TEXT NOT NULL,
                    activated_at TEXT,
                    retired_at   TEXT
                );
                CREATE TABLE IF NOT EXISTS emails (
                    generation_id INTEGER NOT NULL,
                    ordinal       INTEGER NOT NULL,
                    message_id    TEXT NOT NULL,
                    sender        TEXT NOT NULL,
                    recipients    TEXT NOT NULL,
                    cc            TEXT NOT NULL,
                    subject       TEXT NOT NULL,
                    timestamp     TEXT NOT NULL,
                    body          TEXT NOT NULL,
                    embedding     BLOB NOT NULL,
                    PRIMARY KEY (generation_id, ordinal),
                    UNIQUE (generation_id, message_id)
                );
                CREATE TABLE IF NOT EXISTS ingest_state (
                    id           INTEGER PRIMARY KEY CHECK (id = 1),
                    last_checked TEXT NOT NULL
                );",
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // ── Generation lifecycle ────────────────────────────────────────

    /// Start a new `building` generation and return its id.
    pub async fn begin_generation(
        &self,
        model_id: &str,
        dimension: usize,
    ) -> Result<i64, IndexError> {
        self.conn
            .execute(
                "INSERT INTO generations (status, model_id, dimension, created_at)
                 VALUES ('building', ?1, ?2, ?3)",
                params![model_id, dimension as i64, fmt_ts(Utc::now())],
            )
            .await
            .map_err(db_err)?;
        let id = self.conn.last_insert_rowid();
        debug!(generation = id, model = model_id, "Started index generation");
        Ok(id)
    }

    /// Append one record with its embedding at the next ordinal.
    pub async fn append_record(
        &self,
        generation: i64,
        ordinal: i64,
        record: &EmailRecord,
        embedding: &[f32],
    ) -> Result<(), IndexError> {
        let recipients = serde_json::to_string(&record.recipients)
            .map_err(|e| IndexError::Database(e.to_string()))?;
        let cc = serde_json::to_string(&record.cc)
            .map_err(|e| IndexError::Database(e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO emails
                 (generation_id, ordinal, message_id, sender, recipients, cc,
                  subject, timestamp, body, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    generation,
                    ordinal,
                    record.message_id.as_str(),
                    record.sender.as_str(),
                    recipients,
                    cc,
                    record.subject.as_str(),
                    fmt_ts(record.timestamp),
                    record.body.as_str(),
                    encode_vector(embedding),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Copy every row of `source` into `target`, preserving ordinals.
    /// Returns the number of rows copied. Used by incremental ingestion
    /// to carry forward already-embedded messages.
    pub async fn copy_generation_rows(
        &self,
        source: i64,
        target: i64,
    ) -> Result<i64, IndexError> {
        let copied = self
            .conn
            .execute(
                "INSERT INTO emails
                 (generation_id, ordinal, message_id, sender, recipients, cc,
                  subject, timestamp, body, embedding)
                 SELECT ?2, ordinal, message_id, sender, recipients, cc,
                        subject, timestamp, body, embedding
                 FROM emails WHERE generation_id = ?1",
                params![source, target],
            )
            .await
            .map_err(db_err)?;
        Ok(copied as i64)
    }

    /// Message ids present in a generation (for incremental dedup).
    pub async fn message_ids(&self, generation: i64) -> Result<HashSet<String>, IndexError> {
        let mut rows = self
            .conn
            .query(
                "SELECT message_id FROM emails WHERE generation_id = ?1",
                params![generation],
            )
            .await
            .map_err(db_err)?;

        let mut ids = HashSet::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            ids.insert(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(ids)
    }

    /// Publish a generation: cross-check its row count, retire the
    /// previously active generation while flipping this one to `active`
    /// in a single statement, and prune generations that no in-flight
    /// reader can still hold.
    ///
    /// Searches share this connection, so the swap must never leave a
    /// statement boundary with no active generation; the combined
    /// UPDATE retires the predecessor and activates the successor
    /// atomically, and a reader interleaving anywhere sees exactly the
    /// pre- or post-activation index.
    pub async fn activate_generation(
        &self,
        generation: i64,
        expected_count: i64,
    ) -> Result<(), IndexError> {
        let actual = self.count_rows(generation).await?;
        if actual != expected_count {
            self.mark_failed(generation).await?;
            return Err(IndexError::Corrupt {
                generation,
                reason: format!("expected {expected_count} rows, found {actual}"),
            });
        }

        if self.generation_status(generation).await?.as_deref() != Some("building") {
            return Err(IndexError::Database(format!(
                "generation {generation} not in building state"
            )));
        }

        // Generations retired before this activation are unreachable by
        // now: readers resolve the active generation per search call.
        self.conn
            .execute(
                "DELETE FROM emails WHERE generation_id IN
                 (SELECT id FROM generations WHERE status IN ('retired', 'failed'))",
                params![],
            )
            .await
            .map_err(db_err)?;
        self.conn
            .execute(
                "DELETE FROM generations WHERE status IN ('retired', 'failed')",
                params![],
            )
            .await
            .map_err(db_err)?;

        let now = fmt_ts(Utc::now());
        let updated = self
            .conn
            .execute(
                "UPDATE generations
                 SET status       = CASE WHEN id = ?2 THEN 'active' ELSE 'retired' END,
                     activated_at = CASE WHEN id = ?2 THEN ?1 ELSE activated_at END,
                     email_count  = CASE WHEN id = ?2 THEN ?3 ELSE email_count END,
                     retired_at   = CASE WHEN id = ?2 THEN NULL ELSE ?1 END
                 WHERE (id = ?2 AND status = 'building')
                    OR (status = 'active' AND id != ?2)",
                params![now, generation, expected_count],
            )
            .await
            .map_err(db_err)?;

        if updated == 0 {
            return Err(IndexError::Database(format!(
                "generation {generation} was not activated"
            )));
        }

        info!(generation, rows = expected_count, "Index generation activated");
        Ok(())
    }

    async fn generation_status(&self, generation: i64) -> Result<Option<String>, IndexError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM generations WHERE id = ?1",
                params![generation],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// Mark a generation as failed. Its rows are swept on the next
    /// successful activation.
    pub async fn mark_failed(&self, generation: i64) -> Result<(), IndexError> {
        self.conn
            .execute(
                "UPDATE generations SET status = 'failed' WHERE id = ?1",
                params![generation],
            )
            .await
            .map_err(db_err)?;
        warn!(generation, "Index generation marked failed");
        Ok(())
    }

    /// The currently active generation, if any.
    pub async fn active_generation(&self) -> Result<Option<Generation>, IndexError> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, model_id, dimension, email_count
                 FROM generations WHERE status = 'active'
                 ORDER BY activated_at DESC, id DESC LIMIT 1",
                params![],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let dimension = row.get::<i64>(2).map_err(db_err)?;
                Ok(Some(Generation {
                    id: row.get::<i64>(0).map_err(db_err)?,
                    model_id: row.get::<String>(1).map_err(db_err)?,
                    dimension: dimension.max(0) as usize,
                    email_count: row.get::<Option<i64>>(3).map_err(db_err)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Row count cross-check: the activation-time count must still
    /// match the table. Fails closed with `Corrupt` on drift.
    pub async fn verify_generation(&self, generation: &Generation) -> Result<(), IndexError> {
        let expected = generation.email_count.ok_or(IndexError::Corrupt {
            generation: generation.id,
            reason: "active generation has no recorded row count".to_string(),
        })?;
        let actual = self.count_rows(generation.id).await?;
        if actual != expected {
            return Err(IndexError::Corrupt {
                generation: generation.id,
                reason: format!("row count {actual} != recorded {expected}"),
            });
        }
        Ok(())
    }

    pub async fn count_rows(&self, generation: i64) -> Result<i64, IndexError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM emails WHERE generation_id = ?1",
                params![generation],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map_err(db_err),
            None => Ok(0),
        }
    }

    // ── Query paths ─────────────────────────────────────────────────

    /// All (ordinal, vector) pairs of a generation, in ordinal order.
    pub async fn vectors(
        &self,
        generation: i64,
        dimension: usize,
    ) -> Result<Vec<(i64, Vec<f32>)>, IndexError> {
        let mut rows = self
            .conn
            .query(
                "SELECT ordinal, embedding FROM emails
                 WHERE generation_id = ?1 ORDER BY ordinal",
                params![generation],
            )
            .await
            .map_err(db_err)?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let ordinal = row.get::<i64>(0).map_err(db_err)?;
            let blob = row.get::<Vec<u8>>(1).map_err(db_err)?;
            let vector = decode_vector(&blob, ordinal)?;
            if vector.len() != dimension {
                return Err(IndexError::InvalidVector {
                    ordinal,
                    reason: format!("dimension {} != generation {}", vector.len(), dimension),
                });
            }
            out.push((ordinal, vector));
        }
        Ok(out)
    }

    /// Resolve ordinals back to records, preserving the given order.
    pub async fn records_by_ordinals(
        &self,
        generation: i64,
        ordinals: &[i64],
    ) -> Result<Vec<EmailRecord>, IndexError> {
        let mut out = Vec::with_capacity(ordinals.len());
        for &ordinal in ordinals {
            let mut rows = self
                .conn
                .query(
                    "SELECT message_id, sender, recipients, cc, subject, timestamp, body
                     FROM emails WHERE generation_id = ?1 AND ordinal = ?2",
                    params![generation, ordinal],
                )
                .await
                .map_err(db_err)?;

            let row = rows.next().await.map_err(db_err)?.ok_or(IndexError::Corrupt {
                generation,
                reason: format!("ordinal {ordinal} has no metadata row"),
            })?;

            let recipients: Vec<String> =
                serde_json::from_str(&row.get::<String>(2).map_err(db_err)?)
                    .unwrap_or_default();
            let cc: Vec<String> = serde_json::from_str(&row.get::<String>(3).map_err(db_err)?)
                .unwrap_or_default();

            out.push(EmailRecord {
                message_id: row.get::<String>(0).map_err(db_err)?,
                sender: row.get::<String>(1).map_err(db_err)?,
                recipients,
                cc,
                subject: row.get::<String>(4).map_err(db_err)?,
                timestamp: parse_ts(&row.get::<String>(5).map_err(db_err)?),
                body: row.get::<String>(6).map_err(db_err)?,
            });
        }
        Ok(out)
    }

    // ── Last-checked marker ─────────────────────────────────────────

    /// Advance the last-checked marker. Monotone: an older timestamp
    /// never overwrites a newer one.
    pub async fn advance_last_checked(&self, ts: DateTime<Utc>) -> Result<(), IndexError> {
        self.conn
            .execute(
                "INSERT INTO ingest_state (id, last_checked) VALUES (1, ?1)
                 ON CONFLICT(id) DO UPDATE SET
                   last_checked = MAX(last_checked, excluded.last_checked)",
                params![fmt_ts(ts)],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Timestamp of the most recent successful ingestion, if any.
    pub async fn last_checked(&self) -> Result<Option<DateTime<Utc>>, IndexError> {
        let mut rows = self
            .conn
            .query("SELECT last_checked FROM ingest_state WHERE id = 1", params![])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(parse_ts(&row.get::<String>(0).map_err(db_err)?))),
            None => Ok(None),
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn db_err(e: libsql::Error) -> IndexError {
    IndexError::Database(e.to_string())
}

/// Canonical timestamp format: fixed-width RFC 3339 UTC, so SQL `MAX`
/// over the text column matches chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// f32 little-endian blob codec for embedding vectors.
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for x in vector {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn decode_vector(blob: &[u8], ordinal: i64) -> Result<Vec<f32>, IndexError> {
    if blob.len() % 4 != 0 {
        return Err(IndexError::InvalidVector {
            ordinal,
            reason: format!("blob length {} not a multiple of 4", blob.len()),
        });
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, subject: &str) -> EmailRecord {
        EmailRecord {
            message_id: id.to_string(),
            sender: "alice@example.com".to_string(),
            recipients: vec!["bob@example.com".to_string()],
            cc: vec![],
            subject: subject.to_string(),
            timestamp: Utc.with_ymd_and_hms(2025, 1, 6, 10, 30, 0).unwrap(),
            body: "body text".to_string(),
        }
    }

    #[test]
    fn vector_codec_round_trip() {
        let v = vec![0.5f32, -1.25, 3.75];
        let decoded = decode_vector(&encode_vector(&v), 0).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn vector_codec_rejects_bad_length() {
        assert!(decode_vector(&[1, 2, 3], 0).is_err());
    }

    #[tokio::test]
    async fn activate_records_count_and_serves_rows() {
        let store = IndexStore::new_memory().await.unwrap();
        let generation = store.begin_generation("test-model", 2).await.unwrap();

        store
            .append_record(generation, 0, &record("m1", "First"), &[1.0, 0.0])
            .await
            .unwrap();
        store
            .append_record(generation, 1, &record("m2", "Second"), &[0.0, 1.0])
            .await
            .unwrap();

        store.activate_generation(generation, 2).await.unwrap();

        let active = store.active_generation().await.unwrap().unwrap();
        assert_eq!(active.id, generation);
        assert_eq!(active.model_id, "test-model");
        assert_eq!(active.email_count, Some(2));
        store.verify_generation(&active).await.unwrap();

        let vectors = store.vectors(generation, 2).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].1, vec![1.0, 0.0]);

        let records = store.records_by_ordinals(generation, &[1, 0]).await.unwrap();
        assert_eq!(records[0].subject, "Second");
        assert_eq!(records[1].subject, "First");
    }

    #[tokio::test]
    async fn activation_rejects_count_mismatch() {
        let store = IndexStore::new_memory().await.unwrap();
        let generation = store.begin_generation("test-model", 2).await.unwrap();
        store
            .append_record(generation, 0, &record("m1", "Only"), &[1.0, 0.0])
            .await
            .unwrap();

        let err = store.activate_generation(generation, 5).await.unwrap_err();
        assert!(matches!(err, IndexError::Corrupt { .. }));
        assert!(store.active_generation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_activation_retires_previous() {
        let store = IndexStore::new_memory().await.unwrap();

        let first = store.begin_generation("test-model", 1).await.unwrap();
        store
            .append_record(first, 0, &record("m1", "Old"), &[1.0])
            .await
            .unwrap();
        store.activate_generation(first, 1).await.unwrap();

        let second = store.begin_generation("test-model", 1).await.unwrap();
        store
            .append_record(second, 0, &record("m1", "New"), &[1.0])
            .await
            .unwrap();
        store.activate_generation(second, 1).await.unwrap();

        let active = store.active_generation().await.unwrap().unwrap();
        assert_eq!(active.id, second);

        // Third activation sweeps the retired first generation.
        let third = store.begin_generation("test-model", 1).await.unwrap();
        store
            .append_record(third, 0, &record("m1", "Newer"), &[1.0])
            .await
            .unwrap();
        store.activate_generation(third, 1).await.unwrap();
        assert_eq!(store.count_rows(first).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reader_always_sees_an_active_generation_across_activations() {
        let store = Arc::new(IndexStore::new_memory().await.unwrap());

        let seed = store.begin_generation("test-model", 1).await.unwrap();
        store
            .append_record(seed, 0, &record("m1", "Seed"), &[1.0])
            .await
            .unwrap();
        store.activate_generation(seed, 1).await.unwrap();

        let writer_store = Arc::clone(&store);
        let writer = tokio::spawn(async move {
            for _ in 0..25 {
                let generation = writer_store
                    .begin_generation("test-model", 1)
                    .await
                    .unwrap();
                writer_store
                    .append_record(generation, 0, &record("m1", "Swap"), &[1.0])
                    .await
                    .unwrap();
                writer_store.activate_generation(generation, 1).await.unwrap();
            }
        });

        // Searches resolve the active generation per call; at no point
        // during the swaps may that resolution come up empty.
        while !writer.is_finished() {
            let active = store.active_generation().await.unwrap();
            let active = active.expect("activation exposed an empty index");
            assert_eq!(active.email_count, Some(1));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn failed_generation_leaves_active_untouched() {
        let store = IndexStore::new_memory().await.unwrap();

        let good = store.begin_generation("test-model", 1).await.unwrap();
        store
            .append_record(good, 0, &record("m1", "Good"), &[1.0])
            .await
            .unwrap();
        store.activate_generation(good, 1).await.unwrap();

        let bad = store.begin_generation("test-model", 1).await.unwrap();
        store.mark_failed(bad).await.unwrap();

        let active = store.active_generation().await.unwrap().unwrap();
        assert_eq!(active.id, good);
        store.verify_generation(&active).await.unwrap();
    }

    #[tokio::test]
    async fn copy_generation_preserves_rows() {
        let store = IndexStore::new_memory().await.unwrap();

        let first = store.begin_generation("test-model", 1).await.unwrap();
        store
            .append_record(first, 0, &record("m1", "Kept"), &[0.5])
            .await
            .unwrap();
        store.activate_generation(first, 1).await.unwrap();

        let second = store.begin_generation("test-model", 1).await.unwrap();
        let copied = store.copy_generation_rows(first, second).await.unwrap();
        assert_eq!(copied, 1);

        let ids = store.message_ids(second).await.unwrap();
        assert!(ids.contains("m1"));
    }

    #[tokio::test]
    async fn last_checked_is_monotone() {
        let store = IndexStore::new_memory().await.unwrap();
        assert!(store.last_checked().await.unwrap().is_none());

        let newer = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();

        store.advance_last_checked(newer).await.unwrap();
        store.advance_last_checked(older).await.unwrap();

        assert_eq!(store.last_checked().await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn reopening_a_local_store_keeps_the_active_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");

        {
            let store = IndexStore::new_local(&path).await.unwrap();
            let generation = store.begin_generation("test-model", 1).await.unwrap();
            store
                .append_record(generation, 0, &record("m1", "Persisted"), &[1.0])
                .await
                .unwrap();
            store.activate_generation(generation, 1).await.unwrap();
        }

        let reopened = IndexStore::new_local(&path).await.unwrap();
        let active = reopened.active_generation().await.unwrap().unwrap();
        assert_eq!(active.email_count, Some(1));
        let records = reopened.records_by_ordinals(active.id, &[0]).await.unwrap();
        assert_eq!(records[0].subject, "Persisted");
    }

    #[tokio::test]
    async fn last_checked_idempotent_read() {
        let store = IndexStore::new_memory().await.unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap();
        store.advance_last_checked(ts).await.unwrap();

        let a = store.last_checked().await.unwrap();
        let b = store.last_checked().await.unwrap();
        assert_eq!(a, b);
    }
}
