//! Upstream document sources.
//!
//! The pipeline only needs `fetch_unindexed`: a batch of vectorised documents
//! whose ids fall outside the window already scanned in this process.

use crate::model::Document;
use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Display-safe external identifier for an upstream row id.
pub fn encode_id(id: u64) -> String {
    let bytes = id.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    URL_SAFE_NO_PAD.encode(&bytes[first..])
}

/// Range of upstream ids the producer has already seen. Starts empty and only
/// ever widens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    pub min_seen: u64,
    pub max_seen: u64,
}

impl Default for ScanWindow {
    fn default() -> Self {
        Self { min_seen: u64::MAX, max_seen: 0 }
    }
}

impl ScanWindow {
    pub fn observe(&mut self, id: u64) {
        self.min_seen = self.min_seen.min(id);
        self.max_seen = self.max_seen.max(id);
    }

    pub fn is_empty(&self) -> bool {
        self.min_seen > self.max_seen
    }

    pub fn contains(&self, id: u64) -> bool {
        !self.is_empty() && id >= self.min_seen && id <= self.max_seen
    }
}

pub trait DocumentSource: Send + Sync + 'static {
    /// Up to `limit` documents with ids outside `window`, newest first.
    fn fetch_unindexed(
        &self,
        limit: usize,
        window: ScanWindow,
    ) -> impl Future<Output = Result<Vec<Document>>> + Send;
}

/// Reads the `documents` table of a SQLite database.
#[derive(Clone)]
pub struct SqliteSource {
    conn: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (
    id          INTEGER PRIMARY KEY,
    vector      TEXT,
    title       TEXT,
    summary     TEXT,
    categories  TEXT,
    created_at  INTEGER
)";

impl SqliteSource {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open document database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])
            .context("Failed to create documents table")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Stores `doc`, replacing any row with the same id. A pre-decoded
    /// vector is written as its vector-source string.
    pub fn insert(&self, doc: &Document) -> Result<()> {
        let vector = match (&doc.vector_source, &doc.vector) {
            (Some(source), _) => Some(source.clone()),
            (None, Some(v)) => Some(serde_json::to_string(v)?),
            (None, None) => None,
        };
        let categories = serde_json::to_string(&doc.categories)?;
        let id = i64::try_from(doc.id).context("Document id does not fit in SQLite INTEGER")?;

        self.conn.lock().execute(
            "INSERT OR REPLACE INTO documents (id, vector, title, summary, categories, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, vector, doc.title, doc.summary, categories, doc.created_at.timestamp()],
        )?;
        Ok(())
    }

    fn query_batch(conn: &Connection, limit: usize, window: ScanWindow) -> Result<Vec<Document>> {
        let below = i64::try_from(window.min_seen).unwrap_or(i64::MAX);
        let above = i64::try_from(window.max_seen).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare_cached(
            "SELECT id, vector, title, summary, categories, created_at
             FROM documents
             WHERE vector IS NOT NULL AND id >= 0 AND (id < ?1 OR id > ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![below, above, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;

        let mut docs = Vec::new();
        for row in rows {
            let (id, vector_source, title, summary, categories, created_at) = row?;
            let Ok(id) = u64::try_from(id) else {
                tracing::warn!(id, "Skipping document with negative id");
                continue;
            };
            let categories = match categories.as_deref() {
                None | Some("") => Vec::new(),
                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                    tracing::warn!(id, error = %e, "Ignoring malformed categories");
                    Vec::new()
                }),
            };
            docs.push(Document {
                id,
                vector: None,
                vector_source,
                title: title.unwrap_or_default(),
                summary: summary.unwrap_or_default(),
                categories,
                created_at: created_at
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now),
            });
        }
        Ok(docs)
    }
}

impl DocumentSource for SqliteSource {
    fn fetch_unindexed(
        &self,
        limit: usize,
        window: ScanWindow,
    ) -> impl Future<Output = Result<Vec<Document>>> + Send {
        let conn = Arc::clone(&self.conn);
        async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock();
                Self::query_batch(&conn, limit, window)
            })
            .await
            .context("Document fetch task panicked")?
        }
    }
}

/// In-process source, for tests and local runs. Can be told to fail a number
/// of upcoming fetches.
#[derive(Default)]
pub struct MemorySource {
    docs: Mutex<Vec<Document>>,
    failures: AtomicUsize,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new(docs: Vec<Document>) -> Self {
        Self { docs: Mutex::new(docs), ..Self::default() }
    }

    pub fn push(&self, doc: Document) {
        self.docs.lock().push(doc);
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn batch(&self, limit: usize, window: ScanWindow) -> Result<Vec<Document>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("simulated upstream failure");
        }

        let mut batch: Vec<Document> = self
            .docs
            .lock()
            .iter()
            .filter(|d| !window.contains(d.id))
            .cloned()
            .collect();
        batch.sort_by(|a, b| b.id.cmp(&a.id));
        batch.truncate(limit);
        Ok(batch)
    }
}

impl DocumentSource for MemorySource {
    fn fetch_unindexed(
        &self,
        limit: usize,
        window: ScanWindow,
    ) -> impl Future<Output = Result<Vec<Document>>> + Send {
        let result = self.batch(limit, window);
        async move { result }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: u64, vector: Option<&str>) -> Document {
        Document {
            id,
            vector: None,
            vector_source: vector.map(str::to_string),
            title: format!("Title {}", id),
            summary: "Summary".to_string(),
            categories: vec!["news".to_string()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_encode_id() {
        assert_eq!(encode_id(0), "AA");
        assert_eq!(encode_id(1), "AQ");
        assert_ne!(encode_id(256), encode_id(1));
        let encoded = encode_id(u64::MAX);
        assert!(encoded.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_scan_window() {
        let mut window = ScanWindow::default();
        assert!(window.is_empty());
        assert!(!window.contains(0));

        window.observe(10);
        window.observe(4);
        assert!(window.contains(4) && window.contains(7) && window.contains(10));
        assert!(!window.contains(3) && !window.contains(11));

        window.observe(7);
        assert_eq!(window, ScanWindow { min_seen: 4, max_seen: 10 });
    }

    #[tokio::test]
    async fn test_sqlite_fetch_skips_scanned_window() {
        let source = SqliteSource::in_memory().unwrap();
        for id in 1..=5 {
            source.insert(&doc(id, Some("[1.0, 0.0]"))).unwrap();
        }
        source.insert(&doc(6, None)).unwrap();

        let first = source.fetch_unindexed(2, ScanWindow::default()).await.unwrap();
        let ids: Vec<u64> = first.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![5, 4]);
        assert_eq!(first[0].vector_source.as_deref(), Some("[1.0, 0.0]"));
        assert_eq!(first[0].categories, vec!["news".to_string()]);

        let mut window = ScanWindow::default();
        for d in &first {
            window.observe(d.id);
        }
        source.insert(&doc(9, Some("[0.0, 1.0]"))).unwrap();

        let second = source.fetch_unindexed(10, window).await.unwrap();
        let ids: Vec<u64> = second.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![9, 3, 2, 1]);
    }

    #[tokio::test]
    async fn test_negative_ids_do_not_stall_the_scan() {
        let source = SqliteSource::in_memory().unwrap();
        source
            .conn
            .lock()
            .execute(
                "INSERT INTO documents (id, vector, title, summary, categories, created_at)
                 VALUES (-7, '[1.0, 0.0]', 'Negative', '', '[]', 0)",
                [],
            )
            .unwrap();
        source.insert(&doc(2, Some("[1.0, 0.0]"))).unwrap();

        let mut window = ScanWindow::default();
        let first = source.fetch_unindexed(10, window).await.unwrap();
        let ids: Vec<u64> = first.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![2]);
        for d in &first {
            window.observe(d.id);
        }

        source.insert(&doc(3, Some("[0.0, 1.0]"))).unwrap();
        let second = source.fetch_unindexed(10, window).await.unwrap();
        let ids: Vec<u64> = second.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[tokio::test]
    async fn test_memory_source_failures() {
        let source = MemorySource::new(vec![doc(1, Some("[1]"))]);
        source.fail_next(1);
        assert!(source.fetch_unindexed(10, ScanWindow::default()).await.is_err());
        assert_eq!(source.fetch_unindexed(10, ScanWindow::default()).await.unwrap().len(), 1);
        assert_eq!(source.fetch_count(), 2);
    }
}
