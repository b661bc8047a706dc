//! Narrow interface to the approximate nearest neighbor engine, and the
//! `hnsw_rs` implementation used in production.
//!
//! Engines speak internal handles only; translating to external identifiers
//! is the job of [`crate::approximate::ApproximateIndex`].

use crate::errors::{IndexError, IndexResult};
use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Distance space an engine scores in. This service always configures `Cosine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceType {
    InnerProduct,
    Cosine,
    L2,
}

impl std::str::FromStr for SpaceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ip" | "dot" => Ok(SpaceType::InnerProduct),
            "cosine" | "angular" => Ok(SpaceType::Cosine),
            "l2" | "euclidean" => Ok(SpaceType::L2),
            other => Err(anyhow::anyhow!("Unsupported space type: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub dim: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef: usize,
    pub max_elements: usize,
    pub space: SpaceType,
}

pub trait AnnEngine: Send + Sync {
    /// Adds `vector` under `handle`, replacing whatever the handle held before.
    fn add_point(&self, vector: &[f32], handle: u32) -> IndexResult<()>;

    /// Up to `k` `(handle, distance)` pairs, closest first.
    fn search_knn(&self, vector: &[f32], k: usize) -> Vec<(u32, f32)>;

    fn set_ef(&self, ef: usize);
}

enum Graph {
    Cosine(Hnsw<'static, f32, DistCosine>),
    InnerProduct(Hnsw<'static, f32, DistDot>),
    L2(Hnsw<'static, f32, DistL2>),
}

impl Graph {
    fn insert(&self, vector: &[f32], point: usize) {
        match self {
            Graph::Cosine(h) => h.insert_slice((vector, point)),
            Graph::InnerProduct(h) => h.insert_slice((vector, point)),
            Graph::L2(h) => h.insert_slice((vector, point)),
        }
    }

    fn search(&self, vector: &[f32], k: usize, ef: usize) -> Vec<Neighbour> {
        match self {
            Graph::Cosine(h) => h.search(vector, k, ef),
            Graph::InnerProduct(h) => h.search(vector, k, ef),
            Graph::L2(h) => h.search(vector, k, ef),
        }
    }
}

/// Graph points written per handle. `hnsw_rs` cannot overwrite a point, so
/// re-adding a handle inserts a fresh point and retires the previous one.
#[derive(Default)]
struct PointTable {
    /// Point id → handle.
    owners: Vec<u32>,
    /// Handle → its live point id.
    live: Vec<Option<usize>>,
    /// Point id → whether the stored vector has zero magnitude.
    zero: Vec<bool>,
}

pub struct HnswEngine {
    graph: Graph,
    dim: usize,
    ef: AtomicUsize,
    points: RwLock<PointTable>,
    retired: AtomicUsize,
}

impl HnswEngine {
    pub fn new(params: &EngineParams) -> Self {
        let max_layer = crate::defaults::HNSW_MAX_LAYER;
        let graph = match params.space {
            SpaceType::Cosine => Graph::Cosine(Hnsw::new(
                params.m,
                params.max_elements,
                max_layer,
                params.ef_construction,
                DistCosine {},
            )),
            SpaceType::InnerProduct => Graph::InnerProduct(Hnsw::new(
                params.m,
                params.max_elements,
                max_layer,
                params.ef_construction,
                DistDot {},
            )),
            SpaceType::L2 => Graph::L2(Hnsw::new(
                params.m,
                params.max_elements,
                max_layer,
                params.ef_construction,
                DistL2 {},
            )),
        };

        tracing::info!(
            dim = params.dim,
            m = params.m,
            ef_construction = params.ef_construction,
            ef = params.ef,
            max_elements = params.max_elements,
            space = ?params.space,
            "Built HNSW engine"
        );

        Self {
            graph,
            dim: params.dim,
            ef: AtomicUsize::new(params.ef),
            points: RwLock::new(PointTable::default()),
            retired: AtomicUsize::new(0),
        }
    }

    pub fn ef(&self) -> usize {
        self.ef.load(Ordering::Relaxed)
    }

    /// `hnsw_rs` scores a zero-magnitude operand at cosine distance 0; the
    /// index contract is similarity 0, distance 1.
    fn zero_cosine(&self, vector: &[f32]) -> bool {
        matches!(self.graph, Graph::Cosine(_)) && vector.iter().all(|x| *x == 0.0)
    }
}

impl AnnEngine for HnswEngine {
    fn add_point(&self, vector: &[f32], handle: u32) -> IndexResult<()> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch { expected: self.dim, actual: vector.len() });
        }

        let mut points = self.points.write();
        let point = points.owners.len();
        points.owners.push(handle);
        points.zero.push(self.zero_cosine(vector));

        let slot = handle as usize;
        if points.live.len() <= slot {
            points.live.resize(slot + 1, None);
        }
        if points.live[slot].replace(point).is_some() {
            self.retired.fetch_add(1, Ordering::Relaxed);
        }

        self.graph.insert(vector, point);
        Ok(())
    }

    fn search_knn(&self, vector: &[f32], k: usize) -> Vec<(u32, f32)> {
        if k == 0 || vector.len() != self.dim {
            return Vec::new();
        }

        let points = self.points.read();
        // Never ask the graph for more than it holds; `k` comes from callers.
        let retired = self.retired.load(Ordering::Relaxed).min(points.owners.len());
        let k = k.min(points.owners.len() - retired);
        if k == 0 {
            return Vec::new();
        }

        // Over-fetch so retired points do not crowd out live ones.
        let want = k + retired.min(k);
        let ef = self.ef().max(want);
        let neighbours = self.graph.search(vector, want, ef);

        let query_zero = self.zero_cosine(vector);
        let mut hits = Vec::with_capacity(want);
        for n in neighbours {
            let Some(&handle) = points.owners.get(n.d_id) else {
                continue;
            };
            if points.live.get(handle as usize).copied().flatten() != Some(n.d_id) {
                continue;
            }
            let distance = if query_zero || points.zero.get(n.d_id).copied().unwrap_or(false) {
                1.0
            } else {
                n.distance
            };
            hits.push((handle, distance));
        }
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        hits
    }

    fn set_ef(&self, ef: usize) {
        self.ef.store(ef.max(1), Ordering::Relaxed);
    }
}
