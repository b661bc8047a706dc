use crate::errors::IndexError;
use crate::metrics::get_metrics_collector;
use crate::model::{SearchRequest, SearchResults};
use crate::{defaults, Indexes};

/// Rejected search requests. Everything except [`QueryError::Index`] is the
/// caller's fault.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("Either a vector or exact terms are required")]
    MissingQuery,

    #[error("Invalid vector dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid distance bounds: min {min} > max {max}")]
    InvalidDistanceBounds { min: f32, max: f32 },

    #[error("Result count must be positive")]
    ZeroResults,

    #[error(transparent)]
    Index(#[from] IndexError),
}

impl QueryError {
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, QueryError::Index(_))
    }
}

/// Routes a search to the exact or approximate index and applies the
/// distance and category post-filters.
#[derive(Clone)]
pub struct QueryOrchestrator {
    indexes: Indexes,
}

impl QueryOrchestrator {
    pub fn new(indexes: Indexes) -> Self {
        Self { indexes }
    }

    pub fn indexes(&self) -> &Indexes {
        &self.indexes
    }

    pub fn search(&self, req: &SearchRequest) -> Result<SearchResults, QueryError> {
        let _measurement = crate::measure_operation!("query.search");

        if req.vector.is_empty() && req.exact.is_empty() {
            return Err(QueryError::MissingQuery);
        }
        let dim = self.indexes.dim();
        if !req.vector.is_empty() && req.vector.len() != dim {
            return Err(QueryError::InvalidDimension { expected: dim, actual: req.vector.len() });
        }
        let result_count = req.results.unwrap_or(defaults::RESULT_COUNT);
        if result_count == 0 {
            return Err(QueryError::ZeroResults);
        }
        let min = req.min_distance.unwrap_or(defaults::MIN_DISTANCE);
        let max = req.max_distance.unwrap_or(defaults::MAX_DISTANCE);
        if min.is_nan() || max.is_nan() || min > max {
            return Err(QueryError::InvalidDistanceBounds { min, max });
        }

        let mut results = match &self.indexes.approximate {
            Some(approximate) if req.exact.is_empty() => {
                let mut results = approximate.search(&req.vector, result_count)?;
                results.retain(|_, distance| *distance >= min && *distance <= max);
                results
            }
            // Bounds do not apply here; text-only matches carry a placeholder distance.
            _ => {
                let terms: Vec<String> = req.exact.iter().map(|term| term.to_lowercase()).collect();
                self.indexes.exact.search(&terms, &req.vector, result_count)?
            }
        };

        if let Some(category) = req.category.as_deref() {
            let exact = &self.indexes.exact;
            let labels = &self.indexes.labels;
            results.retain(|id, _| {
                exact
                    .resolve(id)
                    .map(|handle| labels.has(handle, category))
                    .unwrap_or(false)
            });
        }

        get_metrics_collector().track_metric("query.results_returned", results.len() as f64);
        Ok(results)
    }
}
