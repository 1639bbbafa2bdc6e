//! Pure-Rust HNSW graph.
//!
//! Vectors are stored at unit length, so cosine distance is `1 - dot`.
//! Removal is soft: a removed node keeps its links for navigation but never
//! appears in results. A replaced id gets a fresh node. Tombstoned nodes are
//! dropped for good the next time the index is rebuilt from storage.

use super::{AnnIndex, check_dimensions, normalize_cosine, unit_vector};
use crate::Result;
use crate::config::{AnnIndexKind, AnnIndexParams};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Upper bound on node levels.
const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedF32(f32);

impl Eq for OrderedF32 {}

impl PartialOrd for OrderedF32 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF32 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// `SplitMix64`, used only for level assignment.
#[derive(Debug, Clone)]
struct SplitMix64(u64);

impl SplitMix64 {
    const fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform in `(0, 1]`.
    #[allow(clippy::cast_precision_loss)]
    fn next_open_unit(&mut self) -> f64 {
        ((self.next_u64() >> 11) + 1) as f64 / (1u64 << 53) as f64
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    vector: Vec<f32>,
    links: Vec<Vec<u32>>,
    removed: bool,
}

type Candidate = (OrderedF32, u32);

/// Hierarchical navigable small-world graph.
#[derive(Debug, Clone)]
pub struct HnswIndex {
    dimensions: usize,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    level_mult: f64,
    nodes: Vec<Node>,
    ids: HashMap<String, u32>,
    entry_point: Option<u32>,
    top_level: usize,
    rng: SplitMix64,
}

impl HnswIndex {
    /// Creates an empty graph.
    #[must_use]
    pub fn new(dimensions: usize, params: &AnnIndexParams) -> Self {
        let m = params.m.max(2);
        #[allow(clippy::cast_precision_loss)]
        let level_mult = 1.0 / (m as f64).ln();
        Self {
            dimensions,
            m,
            m_max0: m * 2,
            ef_construction: params.ef_construction.max(m),
            ef_search: params.ef_search.max(1),
            level_mult,
            nodes: Vec::new(),
            ids: HashMap::new(),
            entry_point: None,
            top_level: 0,
            rng: SplitMix64(params.seed),
        }
    }

    /// Nodes in the graph, including removed ones still used for navigation.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Removed nodes still held in the graph.
    #[must_use]
    pub fn removed_count(&self) -> usize {
        self.nodes.len() - self.ids.len()
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn random_level(&mut self) -> usize {
        let level = (-self.rng.next_open_unit().ln() * self.level_mult).floor();
        (level as usize).min(MAX_LEVEL)
    }

    fn distance(&self, query: &[f32], node: u32) -> OrderedF32 {
        let vector = &self.nodes[node as usize].vector;
        let dot: f32 = vector.iter().zip(query).map(|(a, b)| a * b).sum();
        OrderedF32(1.0 - dot)
    }

    fn greedy_closest(&self, query: &[f32], mut current: u32, level: usize) -> u32 {
        let mut best = self.distance(query, current);
        loop {
            let mut improved = false;
            if let Some(links) = self.nodes[current as usize].links.get(level) {
                for &neighbor in links {
                    let d = self.distance(query, neighbor);
                    if d < best {
                        best = d;
                        current = neighbor;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search on one layer. Returns candidates sorted nearest first.
    fn search_layer(&self, query: &[f32], entry: u32, ef: usize, level: usize) -> Vec<Candidate> {
        let mut visited = HashSet::new();
        visited.insert(entry);
        let first = (self.distance(query, entry), entry);
        let mut frontier = BinaryHeap::from([Reverse(first)]);
        let mut results = BinaryHeap::from([first]);

        while let Some(Reverse((dist, node))) = frontier.pop() {
            let worst = results.peek().map_or(OrderedF32(f32::MAX), |r| r.0);
            if dist > worst && results.len() >= ef {
                break;
            }
            let Some(links) = self.nodes[node as usize].links.get(level) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance(query, neighbor);
                let worst = results.peek().map_or(OrderedF32(f32::MAX), |r| r.0);
                if results.len() < ef || d < worst {
                    frontier.push(Reverse((d, neighbor)));
                    results.push((d, neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results.into_sorted_vec()
    }

    fn max_links(&self, level: usize) -> usize {
        if level == 0 { self.m_max0 } else { self.m }
    }

    /// Keeps the `limit` links of `node` closest to it.
    fn prune_links(&mut self, node: u32, level: usize) {
        let limit = self.max_links(level);
        let links = &self.nodes[node as usize].links[level];
        if links.len() <= limit {
            return;
        }
        let base = self.nodes[node as usize].vector.clone();
        let mut scored: Vec<Candidate> = links
            .iter()
            .map(|&n| (self.distance(&base, n), n))
            .collect();
        scored.sort_unstable();
        scored.truncate(limit);
        self.nodes[node as usize].links[level] = scored.into_iter().map(|(_, n)| n).collect();
    }

    fn insert_node(&mut self, id: &str, vector: Vec<f32>) {
        let level = self.random_level();
        let Ok(index) = u32::try_from(self.nodes.len()) else {
            tracing::warn!("HNSW node limit reached; vector not indexed");
            return;
        };
        self.nodes.push(Node {
            id: id.to_string(),
            vector,
            links: vec![Vec::new(); level + 1],
            removed: false,
        });
        self.ids.insert(id.to_string(), index);

        let Some(mut current) = self.entry_point else {
            self.entry_point = Some(index);
            self.top_level = level;
            return;
        };

        let query = self.nodes[index as usize].vector.clone();
        for l in (level + 1..=self.top_level).rev() {
            current = self.greedy_closest(&query, current, l);
        }

        for l in (0..=level.min(self.top_level)).rev() {
            let candidates = self.search_layer(&query, current, self.ef_construction, l);
            let neighbors: Vec<u32> = candidates
                .iter()
                .take(self.m)
                .map(|&(_, n)| n)
                .collect();
            for &neighbor in &neighbors {
                self.nodes[neighbor as usize].links[l].push(index);
                self.prune_links(neighbor, l);
            }
            self.nodes[index as usize].links[l] = neighbors;
            if let Some(&(_, nearest)) = candidates.first() {
                current = nearest;
            }
        }

        if level > self.top_level {
            self.top_level = level;
            self.entry_point = Some(index);
        }
    }
}

impl AnnIndex for HnswIndex {
    fn kind(&self) -> AnnIndexKind {
        AnnIndexKind::Hnsw
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn insert(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dimensions(self.dimensions, vector)?;
        self.remove(id);
        self.insert_node(id, unit_vector(vector));
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        match self.ids.remove(id) {
            Some(index) => {
                self.nodes[index as usize].removed = true;
                true
            },
            None => false,
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        check_dimensions(self.dimensions, query)?;
        let Some(mut current) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 || self.ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = unit_vector(query);
        for l in (1..=self.top_level).rev() {
            current = self.greedy_closest(&query, current, l);
        }
        // Widen the beam by the number of removed nodes that may crowd it.
        let ef = self.ef_search.max(k) + self.removed_count().min(self.ef_search);
        Ok(self
            .search_layer(&query, current, ef, 0)
            .into_iter()
            .filter(|&(_, n)| !self.nodes[n as usize].removed)
            .take(k)
            .map(|(dist, n)| {
                (
                    self.nodes[n as usize].id.clone(),
                    normalize_cosine(1.0 - dist.0),
                )
            })
            .collect())
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }
}
