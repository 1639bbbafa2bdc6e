//! Exact brute-force index.

use super::{AnnIndex, check_dimensions, normalize_cosine, unit_vector};
use crate::Result;
use crate::config::AnnIndexKind;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Linear scan over unit vectors. Exact, O(n) per query.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimensions: usize,
    vectors: HashMap<String, Vec<f32>>,
}

impl FlatIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            vectors: HashMap::new(),
        }
    }
}

impl AnnIndex for FlatIndex {
    fn kind(&self) -> AnnIndexKind {
        AnnIndexKind::Flat
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimensions(self.dimensions, vector)?;
        self.vectors.insert(id.to_string(), unit_vector(vector));
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        self.vectors.remove(id).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        check_dimensions(self.dimensions, query)?;
        if k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let query = unit_vector(query);
        let mut scored: Vec<(String, f32)> = self
            .vectors
            .iter()
            .map(|(id, v)| {
                let dot: f32 = v.iter().zip(&query).map(|(a, b)| a * b).sum();
                (id.clone(), normalize_cosine(dot))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.vectors.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_ordering() {
        let mut index = FlatIndex::new(2);
        index.insert("east", &[1.0, 0.0]).unwrap();
        index.insert("north", &[0.0, 1.0]).unwrap();
        index.insert("northeast", &[1.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.1], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["east", "northeast", "north"]);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_replace_and_remove() {
        let mut index = FlatIndex::new(2);
        index.insert("a", &[1.0, 0.0]).unwrap();
        index.insert("a", &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 1).unwrap();
        assert!((hits[0].1 - 1.0).abs() < 1e-6);

        assert!(index.remove("a"));
        assert!(!index.remove("a"));
        assert!(index.search(&[0.0, 1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = FlatIndex::new(3);
        assert!(index.insert("a", &[1.0]).is_err());
        assert!(index.search(&[1.0], 1).is_err());
    }
}
