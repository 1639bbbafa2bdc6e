//! Behavioral pattern types.

use super::Envelope;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternId(String);

impl PatternId {
    /// Creates a pattern ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PatternId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PatternId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Priority tier of a pattern, independent of its embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternTier {
    /// Kept for history only.
    Archive,
    /// Rarely reused.
    Cold,
    /// Default tier for new patterns.
    #[default]
    Warm,
    /// Frequently reused, preferred by planners.
    Hot,
}

impl PatternTier {
    /// Returns the tier as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Cold => "cold",
            Self::Warm => "warm",
            Self::Hot => "hot",
        }
    }

    /// Parses a tier string, defaulting to warm.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "archive" => Self::Archive,
            "cold" => Self::Cold,
            "hot" => Self::Hot,
            _ => Self::Warm,
        }
    }

    /// One tier up, saturating at hot.
    #[must_use]
    pub const fn promoted(self) -> Self {
        match self {
            Self::Archive => Self::Cold,
            Self::Cold => Self::Warm,
            Self::Warm | Self::Hot => Self::Hot,
        }
    }

    /// One tier down, saturating at archive.
    #[must_use]
    pub const fn demoted(self) -> Self {
        match self {
            Self::Hot => Self::Warm,
            Self::Warm => Self::Cold,
            Self::Cold | Self::Archive => Self::Archive,
        }
    }
}

impl fmt::Display for PatternTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reusable behavioral pattern with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    /// Unique identifier.
    pub id: PatternId,
    /// Fixed-dimension embedding.
    pub embedding: Vec<f32>,
    /// Confidence in `[0, 1]`, updated by EMA on reuse.
    pub confidence: f64,
    /// Number of recorded reuses.
    pub usage_count: u64,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Creation time, Unix milliseconds.
    pub created_at: u64,
    /// Agent that extracted the pattern.
    pub source_agent: String,
    /// Priority tier.
    pub tier: PatternTier,
    /// Last recorded reuse, Unix milliseconds.
    pub last_used_at: Option<u64>,
    /// Optional versioned metadata.
    pub metadata: Option<Envelope>,
}

/// A search hit: a pattern and its similarity to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    /// The matched pattern, loaded from durable storage.
    pub pattern: Pattern,
    /// Cosine similarity normalized to `[0, 1]`.
    pub similarity: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_moves_saturate() {
        assert_eq!(PatternTier::Warm.promoted(), PatternTier::Hot);
        assert_eq!(PatternTier::Hot.promoted(), PatternTier::Hot);
        assert_eq!(PatternTier::Cold.demoted(), PatternTier::Archive);
        assert_eq!(PatternTier::Archive.demoted(), PatternTier::Archive);
        assert!(PatternTier::Hot > PatternTier::Archive);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!(PatternTier::parse("HOT"), PatternTier::Hot);
        assert_eq!(PatternTier::parse("unknown"), PatternTier::Warm);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PatternId::generate();
        let b = PatternId::generate();
        assert_ne!(a, b);
    }
}
