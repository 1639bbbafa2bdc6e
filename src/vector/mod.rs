//! Approximate nearest-neighbor indexes over pattern embeddings.
//!
//! Every index implements [`AnnIndex`]. Scores are cosine similarity mapped
//! onto `[0, 1]`, where `1.0` is an identical direction and `0.5` orthogonal.
//!
//! | Kind | Type | Notes |
//! |------|------|-------|
//! | `hnsw` | [`HnswIndex`] | Pure Rust, default |
//! | `flat` | [`FlatIndex`] | Exact scan, small indexes and tests |
//! | `usearch` | `UsearchIndex` | Native, feature `usearch-hnsw` |
//!
//! Indexes are caches. They carry no durability of their own and are always
//! rebuildable from persisted pattern rows.

mod flat;
mod hnsw;
#[cfg(feature = "usearch-hnsw")]
mod usearch;

pub use flat::FlatIndex;
pub use hnsw::HnswIndex;
#[cfg(feature = "usearch-hnsw")]
pub use usearch::UsearchIndex;

use crate::config::{AnnIndexKind, AnnIndexParams};
use crate::{Error, Result};

/// A nearest-neighbor index keyed by string ids.
pub trait AnnIndex: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> AnnIndexKind;

    /// Fixed vector dimension.
    fn dimensions(&self) -> usize;

    /// Inserts a vector, replacing any existing vector under `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] on a dimension mismatch.
    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()>;

    /// Removes `id`. Returns `false` if it was not present.
    fn remove(&mut self, id: &str) -> bool;

    /// Returns up to `k` `(id, similarity)` pairs, most similar first.
    ///
    /// An empty index yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] on a dimension mismatch.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>>;

    /// Number of live vectors.
    fn len(&self) -> usize;

    /// Whether the index holds no live vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `id` is indexed.
    fn contains(&self, id: &str) -> bool;
}

/// Creates an empty index for `dimensions`-wide vectors.
///
/// # Errors
///
/// Returns [`Error::Validation`] if `usearch` is requested without the
/// `usearch-hnsw` feature, or if the native index cannot be created.
pub fn build_index(params: &AnnIndexParams, dimensions: usize) -> Result<Box<dyn AnnIndex>> {
    match params.kind {
        AnnIndexKind::Hnsw => Ok(Box::new(HnswIndex::new(dimensions, params))),
        AnnIndexKind::Flat => Ok(Box::new(FlatIndex::new(dimensions))),
        #[cfg(feature = "usearch-hnsw")]
        AnnIndexKind::Usearch => Ok(Box::new(UsearchIndex::new(dimensions, params)?)),
        #[cfg(not(feature = "usearch-hnsw"))]
        AnnIndexKind::Usearch => Err(Error::Validation(
            "ann kind 'usearch' requires the usearch-hnsw feature".to_string(),
        )),
    }
}

/// Fails with [`Error::Schema`] unless `vector` has `expected` components.
///
/// # Errors
///
/// Returns [`Error::Schema`] on a mismatch.
pub fn check_dimensions(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() == expected {
        Ok(())
    } else {
        Err(Error::Schema {
            expected,
            actual: vector.len(),
        })
    }
}

/// Cosine similarity mapped to `[0, 1]`.
///
/// Zero vectors score `0.5`, the same as orthogonal ones.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    let cosine = if denom > 0.0 { dot / denom } else { 0.0 };
    normalize_cosine(cosine)
}

/// Maps a raw cosine in `[-1, 1]` to `[0, 1]`.
#[must_use]
pub fn normalize_cosine(cosine: f32) -> f32 {
    f32::midpoint(cosine.clamp(-1.0, 1.0), 1.0)
}

/// Returns `vector` scaled to unit length, or all zeros if it has none.
#[must_use]
pub fn unit_vector(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        vector.iter().map(|x| x / norm).collect()
    } else {
        vec![0.0; vector.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_range() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]) - 0.5).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]) - 0.5).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0], &[1.0, 2.0]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unit_vector() {
        let v = unit_vector(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(unit_vector(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_check_dimensions() {
        assert!(check_dimensions(3, &[1.0, 2.0, 3.0]).is_ok());
        assert!(matches!(
            check_dimensions(3, &[1.0]),
            Err(Error::Schema {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_build_index_kinds() {
        let params = AnnIndexParams::default();
        assert_eq!(build_index(&params, 4).unwrap().kind(), AnnIndexKind::Hnsw);

        let flat = AnnIndexParams {
            kind: AnnIndexKind::Flat,
            ..params
        };
        let index = build_index(&flat, 4).unwrap();
        assert_eq!(index.kind(), AnnIndexKind::Flat);
        assert_eq!(index.dimensions(), 4);
        assert!(index.is_empty());
    }

    #[cfg(not(feature = "usearch-hnsw"))]
    #[test]
    fn test_usearch_requires_feature() {
        let params = AnnIndexParams {
            kind: AnnIndexKind::Usearch,
            ..AnnIndexParams::default()
        };
        assert!(matches!(build_index(&params, 4), Err(Error::Validation(_))));
    }
}
