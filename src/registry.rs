use crate::errors::{IndexError, IndexResult};
use std::collections::HashMap;

/// Bidirectional map between external identifiers and dense internal handles.
///
/// Handles are allocated sequentially from 0 and never reassigned, so the
/// reverse direction is a plain vector indexed by handle. The registry does no
/// locking of its own: it lives inside an index's `RwLock`, which gives
/// `&self` lookups shared access and `&mut self` allocation exclusive access.
#[derive(Debug)]
pub struct LabelRegistry {
    inner: HashMap<String, u32>,
    outer: Vec<String>,
    max_elements: usize,
    margin: usize,
}

impl LabelRegistry {
    pub fn new(max_elements: usize, margin: usize) -> Self {
        Self {
            inner: HashMap::new(),
            outer: Vec::new(),
            max_elements,
            margin,
        }
    }

    pub fn resolve(&self, external: &str) -> Option<u32> {
        self.inner.get(external).copied()
    }

    /// Returns the existing handle for `external`, allocating the next one if
    /// it has never been seen. New identifiers are refused once the registry
    /// is within the safety margin of its capacity.
    pub fn resolve_or_create(&mut self, external: &str) -> IndexResult<u32> {
        if let Some(handle) = self.inner.get(external) {
            return Ok(*handle);
        }

        if self.outer.len() + self.margin >= self.max_elements {
            return Err(IndexError::CapacityExceeded {
                len: self.outer.len(),
                max_elements: self.max_elements,
            });
        }

        let handle = u32::try_from(self.outer.len()).map_err(|_| IndexError::CapacityExceeded {
            len: self.outer.len(),
            max_elements: self.max_elements,
        })?;
        self.outer.push(external.to_string());
        self.inner.insert(external.to_string(), handle);
        Ok(handle)
    }

    pub fn reverse(&self, handle: u32) -> Option<&str> {
        self.outer.get(handle as usize).map(String::as_str)
    }

    /// Reverse lookup for a handle the caller obtained from this registry.
    /// A miss means the two maps have diverged.
    pub fn expect_reverse(&self, handle: u32) -> IndexResult<&str> {
        self.reverse(handle).ok_or_else(|| {
            IndexError::Corrupted(format!(
                "handle {} has no external label ({} allocated)",
                handle,
                self.outer.len()
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.outer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outer.is_empty()
    }

    pub fn external_ids(&self) -> Vec<String> {
        self.outer.clone()
    }
}
