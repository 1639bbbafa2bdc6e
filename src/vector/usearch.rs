//! Native usearch HNSW index.
//!
//! usearch keys are `u64`, so string ids are mapped to sequential keys. Keys
//! are never reused; a replaced id gets its old key removed and re-added.

use super::{AnnIndex, check_dimensions, normalize_cosine};
use crate::config::{AnnIndexKind, AnnIndexParams};
use crate::{Error, Result};
use std::collections::HashMap;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

const INITIAL_CAPACITY: usize = 1024;

/// usearch-backed HNSW index with cosine metric.
pub struct UsearchIndex {
    dimensions: usize,
    index: Index,
    id_to_key: HashMap<String, u64>,
    key_to_id: HashMap<u64, String>,
    next_key: u64,
}

impl UsearchIndex {
    /// Creates an empty native index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if usearch cannot allocate the index.
    pub fn new(dimensions: usize, params: &AnnIndexParams) -> Result<Self> {
        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: params.m,
            expansion_add: params.ef_construction,
            expansion_search: params.ef_search,
            multi: false,
        };
        let index = Index::new(&options).map_err(Error::storage("create_usearch_index"))?;
        index
            .reserve(INITIAL_CAPACITY)
            .map_err(Error::storage("reserve_usearch_capacity"))?;

        Ok(Self {
            dimensions,
            index,
            id_to_key: HashMap::new(),
            key_to_id: HashMap::new(),
            next_key: 1,
        })
    }

    fn ensure_capacity(&self) -> Result<()> {
        let capacity = self.index.capacity();
        if self.index.size() + 1 > capacity {
            self.index
                .reserve((capacity * 2).max(INITIAL_CAPACITY))
                .map_err(Error::storage("reserve_usearch_capacity"))?;
        }
        Ok(())
    }
}

impl AnnIndex for UsearchIndex {
    fn kind(&self) -> AnnIndexKind {
        AnnIndexKind::Usearch
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimensions(self.dimensions, vector)?;
        if let Some(&key) = self.id_to_key.get(id) {
            self.index
                .remove(key)
                .map_err(Error::storage("usearch_remove"))?;
        }
        self.ensure_capacity()?;

        let key = match self.id_to_key.get(id) {
            Some(&key) => key,
            None => {
                let key = self.next_key;
                self.next_key += 1;
                self.id_to_key.insert(id.to_string(), key);
                self.key_to_id.insert(key, id.to_string());
                key
            },
        };
        self.index
            .add(key, vector)
            .map_err(Error::storage("usearch_add"))
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(key) = self.id_to_key.remove(id) else {
            return false;
        };
        self.key_to_id.remove(&key);
        if let Err(e) = self.index.remove(key) {
            tracing::warn!(id, error = %e, "usearch remove failed");
        }
        true
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        check_dimensions(self.dimensions, query)?;
        if k == 0 || self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, k)
            .map_err(Error::storage("usearch_search"))?;

        // Cosine distance is `1 - cos`.
        Ok(matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .filter_map(|(key, distance)| {
                let id = self.key_to_id.get(key)?;
                Some((id.clone(), normalize_cosine(1.0 - distance)))
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.id_to_key.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.id_to_key.contains_key(id)
    }
}

impl std::fmt::Debug for UsearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsearchIndex")
            .field("dimensions", &self.dimensions)
            .field("len", &self.id_to_key.len())
            .finish_non_exhaustive()
    }
}
