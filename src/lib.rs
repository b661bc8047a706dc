//! Hybrid Vector Search
//!
//! Nearest-neighbor search over a continuously growing document corpus. An
//! HNSW graph answers plain vector queries; an exact, brute-force index answers
//! small or filtered ones. Both are fed by a concurrent ingestion pipeline.

pub mod ann;
pub mod api;
pub mod approximate;
pub mod config;
pub mod exact;
pub mod ingest;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod query;
pub mod registry;
pub mod source;
pub mod vector;

pub use model::*;
pub use approximate::ApproximateIndex;
pub use exact::ExactIndex;
pub use labels::CategoryStore;
pub use query::QueryOrchestrator;

use std::sync::Arc;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The three stores a document is written to. Cheap to clone.
#[derive(Clone)]
pub struct Indexes {
    /// `None` when the HNSW backend is disabled.
    pub approximate: Option<Arc<ApproximateIndex>>,
    pub exact: Arc<ExactIndex>,
    pub labels: Arc<CategoryStore>,
}

impl Indexes {
    pub fn new(config: &config::IndexConfig) -> Self {
        let approximate = config.approximate_enabled.then(|| {
            let index = ApproximateIndex::new(&config.engine_params(), config.admission_margin);
            Arc::new(index)
        });
        Self {
            approximate,
            exact: Arc::new(ExactIndex::new(
                config.dim,
                config.max_elements,
                config.admission_margin,
            )),
            labels: Arc::new(CategoryStore::new()),
        }
    }

    pub fn dim(&self) -> usize {
        self.exact.dim()
    }
}

/// Default configuration values
pub mod defaults {
    pub const DIMENSION: usize = 768;
    pub const HNSW_M: usize = 40;
    pub const HNSW_EF_CONSTRUCTION: usize = 50;
    pub const HNSW_EF_SEARCH: usize = 200;
    pub const HNSW_MAX_LAYER: usize = 16;
    pub const MAX_ELEMENTS: usize = 5_000_000;

    /// New identifiers are refused once this close to `MAX_ELEMENTS`.
    pub const ADMISSION_MARGIN: usize = 10;

    pub const WORKER_COUNT: usize = 12;
    pub const QUEUE_CAPACITY: usize = 4000;
    pub const FETCH_BATCH_SIZE: usize = 400;
    pub const FETCH_BACKOFF_MS: u64 = 20_000;

    pub const MAX_TEXT_BYTES: usize = 1024;
    pub const EXACT_MAX_DISTANCE: f32 = 0.6;
    pub const TEXT_ONLY_DISTANCE: f32 = 0.5;

    pub const RESULT_COUNT: usize = 100;
    pub const MIN_DISTANCE: f32 = -1.0;
    pub const MAX_DISTANCE: f32 = 0.7;
    pub const QUERY_TIMEOUT_SECS: u64 = 30;

    pub const LISTEN_ADDR: &str = "0.0.0.0:8080";
}

/// Error types for the index core
pub mod errors {
    /// Failures raised by the indexes and their label registries.
    ///
    /// Everything except [`IndexError::CapacityExceeded`] is fatal: it signals a
    /// caller bug, an unsupported operation or a corrupted registry, and the
    /// affected worker must stop rather than keep writing.
    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    pub enum IndexError {
        #[error("Invalid dimension: expected {expected}, got {actual}")]
        DimensionMismatch { expected: usize, actual: usize },

        #[error("Vectors are not the same length: {left} != {right}")]
        LengthMismatch { left: usize, right: usize },

        #[error("Operation not implemented: {0}")]
        Unimplemented(&'static str),

        #[error("Label registry corrupted: {0}")]
        Corrupted(String),

        #[error("Index is full: {len} of {max_elements} labels allocated")]
        CapacityExceeded { len: usize, max_elements: usize },
    }

    impl IndexError {
        pub fn is_fatal(&self) -> bool {
            !matches!(self, IndexError::CapacityExceeded { .. })
        }
    }

    pub type IndexResult<T> = std::result::Result<T, IndexError>;

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_only_capacity_is_recoverable() {
            assert!(IndexError::DimensionMismatch { expected: 3, actual: 2 }.is_fatal());
            assert!(IndexError::LengthMismatch { left: 3, right: 2 }.is_fatal());
            assert!(IndexError::Unimplemented("delete").is_fatal());
            assert!(IndexError::Corrupted("missing".into()).is_fatal());
            assert!(!IndexError::CapacityExceeded { len: 10, max_elements: 10 }.is_fatal());
        }
    }
}
