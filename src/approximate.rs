use crate::ann::{AnnEngine, EngineParams, HnswEngine};
use crate::errors::{IndexError, IndexResult};
use crate::model::SearchResults;
use crate::registry::LabelRegistry;
use parking_lot::RwLock;

/// Approximate index: external identifiers on top of an [`AnnEngine`].
///
/// Scoring and graph traversal belong to the engine. This type owns the label
/// registry (its handle space is independent of the exact index's) and checks
/// dimensions before anything reaches the engine.
pub struct ApproximateIndex<E: AnnEngine = HnswEngine> {
    dim: usize,
    labels: RwLock<LabelRegistry>,
    engine: E,
}

impl ApproximateIndex<HnswEngine> {
    pub fn new(params: &EngineParams, margin: usize) -> Self {
        Self::with_engine(params.dim, params.max_elements, margin, HnswEngine::new(params))
    }
}

impl<E: AnnEngine> ApproximateIndex<E> {
    pub fn with_engine(dim: usize, max_elements: usize, margin: usize, engine: E) -> Self {
        Self {
            dim,
            labels: RwLock::new(LabelRegistry::new(max_elements, margin)),
            engine,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn set_ef(&self, ef: usize) {
        self.engine.set_ef(ef);
    }

    pub fn put(&self, external: &str, vector: &[f32]) -> IndexResult<u32> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch { expected: self.dim, actual: vector.len() });
        }

        let mut labels = self.labels.write();
        let handle = labels.resolve_or_create(external)?;
        self.engine.add_point(vector, handle)?;
        Ok(handle)
    }

    pub fn search(&self, query: &[f32], result_count: usize) -> IndexResult<SearchResults> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch { expected: self.dim, actual: query.len() });
        }

        let labels = self.labels.read();
        let hits = self.engine.search_knn(query, result_count);

        let mut results = SearchResults::with_capacity(hits.len());
        for (handle, distance) in hits {
            let external = labels.expect_reverse(handle)?;
            results.insert(external.to_string(), distance);
        }
        Ok(results)
    }

    pub fn resolve(&self, external: &str) -> Option<u32> {
        self.labels.read().resolve(external)
    }

    pub fn len(&self) -> usize {
        self.labels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.labels.read().external_ids()
    }

    pub fn delete(&self, _external: &str) -> IndexResult<()> {
        Err(IndexError::Unimplemented("approximate index delete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ann::SpaceType;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn params(dim: usize) -> EngineParams {
        EngineParams {
            dim,
            m: 16,
            ef_construction: 100,
            ef: 64,
            max_elements: 10_000,
            space: SpaceType::Cosine,
        }
    }

    /// Engine that reports a handle the registry never issued.
    struct RogueEngine {
        added: Mutex<Vec<u32>>,
    }

    impl AnnEngine for RogueEngine {
        fn add_point(&self, _vector: &[f32], handle: u32) -> IndexResult<()> {
            self.added.lock().push(handle);
            Ok(())
        }

        fn search_knn(&self, _vector: &[f32], _k: usize) -> Vec<(u32, f32)> {
            vec![(0, 0.1), (99, 0.2)]
        }

        fn set_ef(&self, _ef: usize) {}
    }

    #[test]
    fn test_put_and_search_by_external_id() {
        let idx = ApproximateIndex::new(&params(3), 10);
        idx.put("x", &[1.0, 0.0, 0.0]).unwrap();
        idx.put("y", &[0.0, 1.0, 0.0]).unwrap();
        idx.put("z", &[0.0, 0.0, 1.0]).unwrap();

        let results = idx.search(&[0.1, 1.0, 0.0], 1).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results.contains("y"));
        assert_eq!(idx.len(), 3);
    }

    #[test]
    fn test_reput_keeps_handle_and_moves_vector() {
        let idx = ApproximateIndex::new(&params(3), 10);
        let first = idx.put("doc", &[1.0, 0.0, 0.0]).unwrap();
        idx.put("other", &[0.0, 1.0, 0.0]).unwrap();
        let second = idx.put("doc", &[0.0, 0.0, 1.0]).unwrap();
        assert_eq!(first, second);
        assert_eq!(idx.len(), 2);

        let results = idx.search(&[0.0, 0.0, 1.0], 1).unwrap();
        assert!(results.get("doc").unwrap() < 1e-3);
    }

    #[test]
    fn test_dimension_checked_before_engine() {
        let engine = RogueEngine { added: Mutex::new(Vec::new()) };
        let idx = ApproximateIndex::with_engine(3, 100, 10, engine);
        assert!(idx.put("doc", &[1.0, 2.0, 3.0, 4.0]).is_err());
        assert!(idx.search(&[1.0], 5).is_err());
        assert!(idx.engine.added.lock().is_empty());
        assert!(idx.is_empty());
    }

    #[test]
    fn test_unknown_handle_is_corruption() {
        let engine = RogueEngine { added: Mutex::new(Vec::new()) };
        let idx = ApproximateIndex::with_engine(3, 100, 10, engine);
        idx.put("doc", &[1.0, 2.0, 3.0]).unwrap();

        let err = idx.search(&[1.0, 2.0, 3.0], 2).unwrap_err();
        assert!(matches!(err, IndexError::Corrupted(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_oversized_result_count() {
        let idx = ApproximateIndex::new(&params(3), 10);
        idx.put("x", &[1.0, 0.0, 0.0]).unwrap();
        idx.put("y", &[0.0, 1.0, 0.0]).unwrap();
        idx.put("x", &[1.0, 0.1, 0.0]).unwrap();

        let results = idx.search(&[1.0, 0.0, 0.0], usize::MAX).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_zero_vectors_match_at_distance_one() {
        let idx = ApproximateIndex::new(&params(3), 10);
        idx.put("a", &[1.0, 0.0, 0.0]).unwrap();
        idx.put("z", &[0.0, 0.0, 0.0]).unwrap();

        let results = idx.search(&[1.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(results.ranked()[0].0, "a");
        assert_eq!(results.get("z"), Some(1.0));

        let results = idx.search(&[0.0, 0.0, 0.0], 5).unwrap();
        assert_eq!(results.get("a"), Some(1.0));
        assert_eq!(results.get("z"), Some(1.0));
    }

    #[test]
    fn test_delete_is_unimplemented() {
        let idx = ApproximateIndex::new(&params(3), 10);
        let err = idx.delete("doc").unwrap_err();
        assert_eq!(err, IndexError::Unimplemented("approximate index delete"));
    }

    #[test]
    fn test_concurrent_puts() {
        let idx = Arc::new(ApproximateIndex::new(&params(4), 10));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let idx = Arc::clone(&idx);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let v = [1.0 + t as f32, i as f32, 1.0, 0.5];
                        idx.put(&format!("{}-{}", t, i), &v).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(idx.len(), 400);
        let mut ids = idx.list_ids();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }
}
