//! Exact, filter-capable index.
//!
//! Every query is a linear scan over all stored documents. It is the
//! complement of the HNSW index for substring-filtered and small queries, not
//! a high-throughput path.

use crate::defaults::{EXACT_MAX_DISTANCE, MAX_TEXT_BYTES, TEXT_ONLY_DISTANCE};
use crate::errors::{IndexError, IndexResult};
use crate::model::SearchResults;
use crate::registry::LabelRegistry;
use crate::vector::cosine_distance32;
use parking_lot::RwLock;
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Lower-cased, at most `MAX_TEXT_BYTES` long.
    pub text: String,
    /// `None` for documents without an embedding; they never match a vector query.
    pub vector: Option<Vec<f32>>,
}

struct ExactState {
    labels: LabelRegistry,
    /// Indexed by handle; always as long as `labels`.
    records: Vec<DocumentRecord>,
}

pub struct ExactIndex {
    dim: usize,
    state: RwLock<ExactState>,
}

impl ExactIndex {
    pub fn new(dim: usize, max_elements: usize, margin: usize) -> Self {
        Self {
            dim,
            state: RwLock::new(ExactState {
                labels: LabelRegistry::new(max_elements, margin),
                records: Vec::new(),
            }),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Inserts or replaces the document stored under `external` and returns
    /// its handle.
    pub fn put(&self, external: &str, text: &str, vector: Option<Vec<f32>>) -> IndexResult<u32> {
        if let Some(v) = &vector {
            if v.len() != self.dim {
                return Err(IndexError::DimensionMismatch { expected: self.dim, actual: v.len() });
            }
        }
        let record = DocumentRecord { text: normalize_text(text), vector };

        let mut state = self.state.write();
        let handle = state.labels.resolve_or_create(external)?;
        let slot = handle as usize;
        match slot.cmp(&state.records.len()) {
            Ordering::Less => state.records[slot] = record,
            Ordering::Equal => state.records.push(record),
            Ordering::Greater => {
                return Err(IndexError::Corrupted(format!(
                    "handle {} allocated past {} stored records",
                    handle,
                    state.records.len()
                )))
            }
        }
        Ok(handle)
    }

    /// Scans every document and returns at most `result_count` matches,
    /// closest first.
    ///
    /// A document matches when its text contains every term in `contains`
    /// (terms must already be lower-case). With an empty `query` each match
    /// gets the fixed distance `TEXT_ONLY_DISTANCE`; otherwise matches farther
    /// than `EXACT_MAX_DISTANCE` are dropped. Equal distances come back in no
    /// particular order.
    pub fn search(&self, contains: &[String], query: &[f32], result_count: usize) -> IndexResult<SearchResults> {
        if !query.is_empty() && query.len() != self.dim {
            return Err(IndexError::DimensionMismatch { expected: self.dim, actual: query.len() });
        }

        let state = self.state.read();
        let mut candidates: Vec<(u32, f32)> = Vec::new();

        for (slot, record) in state.records.iter().enumerate() {
            if !contains.iter().all(|term| record.text.contains(term.as_str())) {
                continue;
            }

            if query.is_empty() {
                candidates.push((slot as u32, TEXT_ONLY_DISTANCE));
                continue;
            }

            let Some(stored) = &record.vector else {
                continue;
            };
            let distance = cosine_distance32(query, stored)?;
            if distance <= EXACT_MAX_DISTANCE {
                candidates.push((slot as u32, distance));
            }
        }

        candidates.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        candidates.truncate(result_count);

        let mut results = SearchResults::with_capacity(candidates.len());
        for (handle, distance) in candidates {
            let external = state.labels.expect_reverse(handle)?;
            results.insert(external.to_string(), distance);
        }
        Ok(results)
    }

    pub fn resolve(&self, external: &str) -> Option<u32> {
        self.state.read().labels.resolve(external)
    }

    pub fn get(&self, external: &str) -> Option<DocumentRecord> {
        let state = self.state.read();
        let handle = state.labels.resolve(external)?;
        state.records.get(handle as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.state.read().labels.external_ids()
    }

    pub fn delete(&self, _external: &str) -> IndexResult<()> {
        Err(IndexError::Unimplemented("exact index delete"))
    }
}

/// Lower-cases `text` and cuts it to `MAX_TEXT_BYTES` on a char boundary.
pub fn normalize_text(text: &str) -> String {
    let mut lowered = text.to_lowercase();
    if lowered.len() > MAX_TEXT_BYTES {
        let mut end = MAX_TEXT_BYTES;
        while !lowered.is_char_boundary(end) {
            end -= 1;
        }
        lowered.truncate(end);
    }
    lowered
}
