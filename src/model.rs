use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A candidate document as read from the upstream source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Upstream row id. Also the key the producer's scan window advances on.
    pub id: u64,
    /// Pre-computed embedding, if the source already decoded one.
    #[serde(default)]
    pub vector: Option<Vec<f64>>,
    /// Serialized embedding, decoded by the ingestion workers.
    #[serde(default)]
    pub vector_source: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn external_id(&self) -> String {
        crate::source::encode_id(self.id)
    }

    /// Text the exact index matches substring terms against.
    pub fn text(&self) -> String {
        format!("{} {}", self.title, self.summary)
    }
}

/// `POST /search` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    #[serde(default)]
    pub vector: Vec<f32>,
    #[serde(default)]
    pub exact: Vec<String>,
    #[serde(default)]
    pub results: Option<usize>,
    #[serde(default)]
    pub min_distance: Option<f32>,
    #[serde(default)]
    pub max_distance: Option<f32>,
    #[serde(default)]
    pub category: Option<String>,
}

/// External identifier → distance. Serialized as a flat JSON object; callers
/// that need order sort by distance themselves, or use [`SearchResults::ranked`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchResults(HashMap<String, f32>);

impl SearchResults {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(HashMap::with_capacity(capacity))
    }

    pub fn insert(&mut self, id: String, distance: f32) {
        self.0.insert(id, distance);
    }

    pub fn get(&self, id: &str) -> Option<f32> {
        self.0.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f32)> {
        self.0.iter()
    }

    pub fn retain(&mut self, f: impl FnMut(&String, &mut f32) -> bool) {
        self.0.retain(f);
    }

    /// Results ascending by distance.
    pub fn ranked(&self) -> Vec<(String, f32)> {
        let mut ranked: Vec<(String, f32)> = self.0.iter().map(|(k, v)| (k.clone(), *v)).collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        ranked
    }
}

impl FromIterator<(String, f32)> for SearchResults {
    fn from_iter<I: IntoIterator<Item = (String, f32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
