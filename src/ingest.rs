//! Ingestion pipeline.
//!
//! One producer task polls the upstream source and pushes documents into a
//! bounded queue; a fixed pool of workers drains it and writes each document
//! to the HNSW index, the exact index and the category store. A full queue
//! blocks the producer, which is the only flow control.

use crate::config::PipelineConfig;
use crate::errors::IndexError;
use crate::model::Document;
use crate::source::{DocumentSource, ScanWindow};
use crate::vector::{decode_vector_source, reduce_precision};
use crate::Indexes;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

const PROGRESS_EVERY: u64 = 10_000;

/// Counters shared by the producer and the workers.
#[derive(Debug, Default)]
pub struct IngestStats {
    processed: AtomicU64,
    enqueued: AtomicU64,
    fetch_errors: AtomicU64,
    empty_batches: AtomicU64,
    skipped_capacity: AtomicU64,
    skipped_no_vector: AtomicU64,
    skipped_bad_vector: AtomicU64,
    skipped_stale: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub processed: u64,
    pub enqueued: u64,
    pub fetch_errors: u64,
    pub empty_batches: u64,
    pub skipped_capacity: u64,
    pub skipped_no_vector: u64,
    pub skipped_bad_vector: u64,
    pub skipped_stale: u64,
    pub rejected: u64,
}

impl IngestStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            empty_batches: self.empty_batches.load(Ordering::Relaxed),
            skipped_capacity: self.skipped_capacity.load(Ordering::Relaxed),
            skipped_no_vector: self.skipped_no_vector.load(Ordering::Relaxed),
            skipped_bad_vector: self.skipped_bad_vector.load(Ordering::Relaxed),
            skipped_stale: self.skipped_stale.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// What a worker did with one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Indexed,
    /// The processed counter is within the admission margin of capacity.
    AtCapacity,
    NoVector,
    BadVector,
    Stale,
    /// An index registry refused a new identifier.
    Rejected,
}

/// Runs the per-document steps in order. Only fatal index errors are returned;
/// everything else is counted, logged and reported as an [`Outcome`].
pub fn process_document(
    doc: Document,
    indexes: &Indexes,
    config: &PipelineConfig,
    stats: &IngestStats,
) -> Result<Outcome, IndexError> {
    let processed = stats.processed.load(Ordering::Relaxed);
    if processed as usize + config.admission_margin >= config.max_elements {
        tracing::error!(elements = processed, "too many elements");
        stats.skipped_capacity.fetch_add(1, Ordering::Relaxed);
        return Ok(Outcome::AtCapacity);
    }

    let vector = match (doc.vector.as_ref(), doc.vector_source.as_deref()) {
        (Some(v), _) => v.clone(),
        (None, Some(source)) if !source.is_empty() => match decode_vector_source(source) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(id = doc.id, error = %e, "error converting vector");
                stats.skipped_bad_vector.fetch_add(1, Ordering::Relaxed);
                return Ok(Outcome::BadVector);
            }
        },
        _ => {
            stats.skipped_no_vector.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::NoVector);
        }
    };

    if vector.len() != indexes.dim() {
        tracing::warn!(
            id = doc.id,
            expected = indexes.dim(),
            actual = vector.len(),
            "vector has wrong dimension"
        );
        stats.skipped_bad_vector.fetch_add(1, Ordering::Relaxed);
        return Ok(Outcome::BadVector);
    }

    let vector = reduce_precision(&vector);
    if let Some(pos) = vector.iter().position(|f| !f.is_finite()) {
        tracing::warn!(id = doc.id, component = pos, "vector does not fit in 32-bit precision");
        stats.skipped_bad_vector.fetch_add(1, Ordering::Relaxed);
        return Ok(Outcome::BadVector);
    }

    if let Some(max_age) = config.max_age() {
        if Utc::now().signed_duration_since(doc.created_at) > max_age {
            stats.skipped_stale.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::Stale);
        }
    }

    let external = doc.external_id();
    let text = doc.text();

    match write_document(indexes, &external, &text, vector, doc.categories) {
        Ok(()) => {}
        Err(e) if !e.is_fatal() => {
            tracing::warn!(id = doc.id, error = %e, "error putting document");
            stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(Outcome::Rejected);
        }
        Err(e) => return Err(e),
    }

    let count = stats.processed.fetch_add(1, Ordering::Relaxed) + 1;
    if count % PROGRESS_EVERY == 0 {
        tracing::info!(count, "documents processed");
    }
    Ok(Outcome::Indexed)
}

fn write_document(
    indexes: &Indexes,
    external: &str,
    text: &str,
    vector: Vec<f32>,
    categories: Vec<String>,
) -> Result<(), IndexError> {
    if let Some(approximate) = &indexes.approximate {
        approximate.put(external, &vector)?;
    }
    let handle = indexes.exact.put(external, text, Some(vector))?;
    indexes.labels.set(handle, categories);
    Ok(())
}

pub struct Pipeline<S: DocumentSource> {
    source: Arc<S>,
    indexes: Indexes,
    config: PipelineConfig,
    stats: Arc<IngestStats>,
}

impl<S: DocumentSource> Pipeline<S> {
    pub fn new(source: Arc<S>, indexes: Indexes, config: PipelineConfig) -> Self {
        Self {
            source,
            indexes,
            config,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Polls the source until `shutdown` resolves, then lets the workers drain
    /// the queue and returns the final counters.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> IngestSnapshot {
        let (tx, rx) = mpsc::channel::<Document>(self.config.queue_capacity);
        let rx = Arc::new(AsyncMutex::new(rx));

        tracing::info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting ingestion pipeline"
        );

        let shared_config = Arc::new(self.config.clone());
        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let rx = Arc::clone(&rx);
            let indexes = self.indexes.clone();
            let config = Arc::clone(&shared_config);
            let stats = Arc::clone(&self.stats);
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, indexes, config, stats).await;
            }));
        }

        produce(self.source.as_ref(), tx, &self.config, &self.stats, shutdown).await;

        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::error!("ingestion worker panicked: {}", e);
            }
        }

        tracing::info!("loading graph stopped");
        self.stats.snapshot()
    }
}

async fn produce<S: DocumentSource>(
    source: &S,
    tx: mpsc::Sender<Document>,
    config: &PipelineConfig,
    stats: &IngestStats,
    shutdown: impl Future<Output = ()> + Send,
) {
    tokio::pin!(shutdown);
    let mut window = ScanWindow::default();

    'poll: loop {
        let fetched = tokio::select! {
            _ = &mut shutdown => break 'poll,
            fetched = source.fetch_unindexed(config.batch_size, window) => fetched,
        };

        let docs = match fetched {
            Ok(docs) if !docs.is_empty() => docs,
            Ok(_) => {
                stats.empty_batches.fetch_add(1, Ordering::Relaxed);
                if backoff(config.backoff(), &mut shutdown).await {
                    break 'poll;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %e, "error getting unindexed documents");
                stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                if backoff(config.backoff(), &mut shutdown).await {
                    break 'poll;
                }
                continue;
            }
        };

        for doc in docs {
            window.observe(doc.id);
            tokio::select! {
                _ = &mut shutdown => break 'poll,
                sent = tx.send(doc) => {
                    if sent.is_err() {
                        tracing::error!("all ingestion workers stopped");
                        break 'poll;
                    }
                    stats.enqueued.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    // Dropping `tx` closes the queue; workers exit once it is drained.
}

/// Sleeps for `delay`; true if shutdown arrived first.
async fn backoff<F: Future<Output = ()>>(delay: Duration, shutdown: &mut Pin<&mut F>) -> bool {
    tokio::select! {
        _ = shutdown.as_mut() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<Document>>>,
    indexes: Indexes,
    config: Arc<PipelineConfig>,
    stats: Arc<IngestStats>,
) {
    loop {
        let doc = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(doc) = doc else {
            return;
        };

        // Graph inserts are CPU-bound and run on the blocking pool.
        let id = doc.id;
        let (indexes, config, stats) = (indexes.clone(), Arc::clone(&config), Arc::clone(&stats));
        let processed =
            tokio::task::spawn_blocking(move || process_document(doc, &indexes, &config, &stats)).await;

        match processed {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!(worker_id, id, error = %e, "fatal index error, stopping worker");
                return;
            }
            Err(e) => {
                tracing::error!(worker_id, id, error = %e, "ingestion task panicked, stopping worker");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::source::MemorySource;
    use tokio::sync::oneshot;

    fn index_config() -> IndexConfig {
        IndexConfig {
            dim: 3,
            m: 16,
            ef_construction: 64,
            ef: 64,
            max_elements: 1000,
            admission_margin: 10,
            approximate_enabled: true,
        }
    }

    fn pipeline_config() -> PipelineConfig {
        PipelineConfig {
            workers: 4,
            queue_capacity: 8,
            batch_size: 5,
            backoff_ms: 10,
            max_age_secs: None,
            max_elements: 1000,
            admission_margin: 10,
        }
    }

    fn doc(id: u64, vector: Option<Vec<f64>>, source: Option<&str>) -> Document {
        Document {
            id,
            vector,
            vector_source: source.map(str::to_string),
            title: format!("Title {}", id),
            summary: "Some Summary".to_string(),
            categories: vec!["sports".to_string()],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_document_without_vector_is_not_written() {
        let indexes = Indexes::new(&index_config());
        let stats = IngestStats::default();
        let outcome = process_document(doc(1, None, None), &indexes, &pipeline_config(), &stats).unwrap();

        assert_eq!(outcome, Outcome::NoVector);
        assert_eq!(indexes.exact.len(), 0);
        assert_eq!(indexes.approximate.as_ref().unwrap().len(), 0);
        assert_eq!(stats.snapshot().skipped_no_vector, 1);
    }

    #[test]
    fn test_vector_source_is_decoded() {
        let indexes = Indexes::new(&index_config());
        let stats = IngestStats::default();
        let config = pipeline_config();

        let outcome = process_document(doc(7, None, Some("[0.0, 1.0, 0.0]")), &indexes, &config, &stats).unwrap();
        assert_eq!(outcome, Outcome::Indexed);

        let external = crate::source::encode_id(7);
        let record = indexes.exact.get(&external).unwrap();
        assert_eq!(record.text, "title 7 some summary");
        assert_eq!(record.vector, Some(vec![0.0, 1.0, 0.0]));

        let handle = indexes.exact.resolve(&external).unwrap();
        assert!(indexes.labels.has(handle, "sports"));
        assert!(indexes.approximate.as_ref().unwrap().resolve(&external).is_some());
    }

    #[test]
    fn test_bad_vectors_are_skipped() {
        let indexes = Indexes::new(&index_config());
        let stats = IngestStats::default();
        let config = pipeline_config();

        let garbage = process_document(doc(1, None, Some("not a vector")), &indexes, &config, &stats).unwrap();
        let wrong_dim = process_document(doc(2, Some(vec![1.0, 2.0]), None), &indexes, &config, &stats).unwrap();
        let overflow = process_document(doc(3, Some(vec![1.0, 1e39, 0.0]), None), &indexes, &config, &stats).unwrap();
        let overflow_source = process_document(doc(4, None, Some("[1.0, -1e39, 0.0]")), &indexes, &config, &stats).unwrap();
        assert_eq!(garbage, Outcome::BadVector);
        assert_eq!(wrong_dim, Outcome::BadVector);
        assert_eq!(overflow, Outcome::BadVector);
        assert_eq!(overflow_source, Outcome::BadVector);
        assert!(indexes.exact.is_empty());
        assert!(indexes.approximate.as_ref().unwrap().is_empty());
        assert_eq!(stats.snapshot().skipped_bad_vector, 4);
    }

    #[test]
    fn test_max_age() {
        let indexes = Indexes::new(&index_config());
        let stats = IngestStats::default();
        let mut config = pipeline_config();
        config.max_age_secs = Some(3600);

        let mut old = doc(1, Some(vec![1.0, 0.0, 0.0]), None);
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        let fresh = doc(2, Some(vec![1.0, 0.0, 0.0]), None);

        assert_eq!(process_document(old, &indexes, &config, &stats).unwrap(), Outcome::Stale);
        assert_eq!(process_document(fresh, &indexes, &config, &stats).unwrap(), Outcome::Indexed);
        assert_eq!(indexes.exact.len(), 1);
    }

    #[test]
    fn test_admission_control() {
        let indexes = Indexes::new(&index_config());
        let stats = IngestStats::default();
        let mut config = pipeline_config();
        config.max_elements = 13;

        let outcomes: Vec<Outcome> = (0..5)
            .map(|id| process_document(doc(id, Some(vec![1.0, id as f64, 0.0]), None), &indexes, &config, &stats).unwrap())
            .collect();
        assert_eq!(&outcomes[..3], &[Outcome::Indexed; 3]);
        assert_eq!(&outcomes[3..], &[Outcome::AtCapacity; 2]);
        assert_eq!(indexes.exact.len(), 3);
    }

    #[test]
    fn test_reingestion_updates_in_place() {
        let indexes = Indexes::new(&index_config());
        let stats = IngestStats::default();
        let config = pipeline_config();

        process_document(doc(1, Some(vec![1.0, 0.0, 0.0]), None), &indexes, &config, &stats).unwrap();
        let mut updated = doc(1, Some(vec![0.0, 0.0, 1.0]), None);
        updated.categories = vec!["politics".to_string()];
        process_document(updated, &indexes, &config, &stats).unwrap();

        assert_eq!(indexes.exact.list_ids().len(), 1);
        let external = crate::source::encode_id(1);
        let results = indexes.exact.search(&[], &[0.0, 0.0, 1.0], 10).unwrap();
        assert!(results.contains(&external));

        let handle = indexes.exact.resolve(&external).unwrap();
        assert!(indexes.labels.has(handle, "politics"));
        assert!(!indexes.labels.has(handle, "sports"));
    }

    async fn wait_for(stats: &IngestStats, processed: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while stats.processed() < processed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline did not catch up");
    }

    #[tokio::test]
    async fn test_pipeline_indexes_everything_once() {
        let docs: Vec<Document> = (1..=40)
            .map(|id| doc(id, Some(vec![1.0, id as f64, 0.5]), None))
            .collect();
        let source = Arc::new(MemorySource::new(docs));
        let indexes = Indexes::new(&index_config());
        let pipeline = Pipeline::new(Arc::clone(&source), indexes.clone(), pipeline_config());
        let stats = pipeline.stats();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(pipeline.run(async move {
            let _ = stop_rx.await;
        }));

        wait_for(&stats, 40).await;

        // Late arrivals above the scanned window are still picked up.
        source.push(doc(100, Some(vec![0.0, 0.0, 1.0]), None));
        wait_for(&stats, 41).await;

        stop_tx.send(()).unwrap();
        let snapshot = handle.await.unwrap();

        assert_eq!(snapshot.processed, 41);
        assert_eq!(snapshot.enqueued, 41);
        assert_eq!(indexes.exact.len(), 41);
        assert_eq!(indexes.approximate.as_ref().unwrap().len(), 41);
    }

    #[tokio::test]
    async fn test_producer_retries_after_failures() {
        let source = Arc::new(MemorySource::new(vec![doc(1, Some(vec![1.0, 0.0, 0.0]), None)]));
        source.fail_next(3);
        let indexes = Indexes::new(&index_config());
        let pipeline = Pipeline::new(Arc::clone(&source), indexes.clone(), pipeline_config());
        let stats = pipeline.stats();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(pipeline.run(async move {
            let _ = stop_rx.await;
        }));

        wait_for(&stats, 1).await;
        stop_tx.send(()).unwrap();
        let snapshot = handle.await.unwrap();

        assert_eq!(snapshot.fetch_errors, 3);
        assert_eq!(snapshot.processed, 1);
        assert!(source.fetch_count() >= 4);
    }

    #[tokio::test]
    async fn test_concurrent_workers_produce_unique_handles() {
        let docs: Vec<Document> = (0..500)
            .map(|id| doc(id, Some(vec![1.0, (id % 17) as f64, (id % 5) as f64]), None))
            .collect();
        let source = Arc::new(MemorySource::new(docs));
        let indexes = Indexes::new(&index_config());
        let mut config = pipeline_config();
        config.batch_size = 50;
        let pipeline = Pipeline::new(source, indexes.clone(), config);
        let stats = pipeline.stats();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(pipeline.run(async move {
            let _ = stop_rx.await;
        }));
        wait_for(&stats, 500).await;
        stop_tx.send(()).unwrap();
        handle.await.unwrap();

        let mut ids = indexes.exact.list_ids();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 500);
        assert_eq!(indexes.exact.len(), 500);
    }
}
