use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Category tags per document handle, used only to post-filter search results.
///
/// Never consulted when deciding whether a document gets indexed.
#[derive(Default)]
pub struct CategoryStore {
    labels: RwLock<HashMap<u32, HashSet<String>>>,
}

impl CategoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the handle's categories. An empty list leaves the existing
    /// set untouched, so a partial update cannot wipe labels.
    pub fn set<I, S>(&self, handle: u32, categories: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let set: HashSet<String> = categories.into_iter().map(Into::into).collect();
        if set.is_empty() {
            return;
        }
        self.labels.write().insert(handle, set);
    }

    pub fn has(&self, handle: u32, category: &str) -> bool {
        self.labels
            .read()
            .get(&handle)
            .map(|set| set.contains(category))
            .unwrap_or(false)
    }

    pub fn categories(&self, handle: u32) -> Vec<String> {
        let mut out: Vec<String> = self
            .labels
            .read()
            .get(&handle)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.labels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
