//! Configuration management.
//!
//! The kernel is configured through a typed [`KernelConfig`]. Callers usually
//! build it in code, but it can also be read from a TOML file and adjusted
//! with `SWARMKERNEL_*` environment variables.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default interval between TTL sweeps (5 minutes).
pub const DEFAULT_TTL_SWEEP_INTERVAL_MS: u64 = 300_000;

/// Default number of deletions per sweep batch.
pub const DEFAULT_SWEEP_BATCH_LIMIT: usize = 1_000;

/// Default embedding dimensions (all-MiniLM-L6-v2).
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

/// Default TTL for blackboard hints (30 minutes).
pub const DEFAULT_HINT_TTL_SECONDS: u64 = 1_800;

/// Default audit retention for events (30 days).
pub const DEFAULT_EVENT_TTL_SECONDS: u64 = 30 * 24 * 3_600;

/// Main configuration for the kernel.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Path to the `SQLite` database. `None` keeps everything in memory.
    pub storage_path: Option<PathBuf>,
    /// Interval between background TTL sweeps, in milliseconds.
    pub ttl_sweep_interval_ms: u64,
    /// Maximum deletions per sweep batch.
    pub sweep_batch_limit: usize,
    /// Fixed embedding dimension for the pattern index.
    pub embedding_dimension: usize,
    /// ANN index parameters.
    pub ann: AnnIndexParams,
    /// Default TTL for blackboard hints.
    pub default_hint_ttl_seconds: u64,
    /// Namespace that holds blackboard hints.
    pub hint_namespace: String,
    /// Audit retention for persisted events.
    pub event_ttl_seconds: u64,
    /// How long tombstones are kept before the sweep purges them.
    pub tombstone_grace_seconds: u64,
    /// Broadcast buffer size for the event bus.
    pub event_bus_capacity: usize,
    /// Pattern index settings.
    pub patterns: PatternSettings,
    /// Consensus gate settings.
    pub consensus: ConsensusSettings,
}

/// Which ANN structure backs the pattern index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnIndexKind {
    /// Pure-Rust HNSW graph.
    #[default]
    Hnsw,
    /// Exact brute-force scan.
    Flat,
    /// Native usearch HNSW (requires the `usearch-hnsw` feature).
    Usearch,
}

impl AnnIndexKind {
    /// Parses a kind string, defaulting to HNSW.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "flat" | "exact" | "brute" => Self::Flat,
            "usearch" => Self::Usearch,
            _ => Self::Hnsw,
        }
    }

    /// Returns the kind as a string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hnsw => "hnsw",
            Self::Flat => "flat",
            Self::Usearch => "usearch",
        }
    }
}

/// Parameters for the approximate nearest-neighbor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnIndexParams {
    /// Index implementation.
    pub kind: AnnIndexKind,
    /// HNSW connectivity (M). Layer 0 allows `2 * m` links.
    pub m: usize,
    /// Candidate list size during construction.
    pub ef_construction: usize,
    /// Candidate list size during search.
    pub ef_search: usize,
    /// Seed for level assignment, so rebuilds are reproducible.
    pub seed: u64,
}

impl Default for AnnIndexParams {
    fn default() -> Self {
        Self {
            kind: AnnIndexKind::Hnsw,
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            seed: 0x5eed_cafe,
        }
    }
}

/// Pattern index settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternSettings {
    /// EMA weight applied to each usage outcome.
    pub ema_alpha: f64,
    /// Patterns below this confidence are GC candidates.
    pub confidence_floor: f64,
    /// Unused window after which low-confidence patterns are collected.
    pub retention_seconds: u64,
    /// Rows loaded per batch during rebuild.
    pub rebuild_batch_size: usize,
    /// How often the rebuild task checks for staleness.
    pub rebuild_check_interval_ms: u64,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            ema_alpha: 0.1,
            confidence_floor: 0.2,
            retention_seconds: 7 * 24 * 3_600,
            rebuild_batch_size: 1_000,
            rebuild_check_interval_ms: 60_000,
        }
    }
}

/// Consensus gate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsensusSettings {
    /// Whether a single rejecting vote vetoes a pending proposal.
    pub allow_veto: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            ttl_sweep_interval_ms: DEFAULT_TTL_SWEEP_INTERVAL_MS,
            sweep_batch_limit: DEFAULT_SWEEP_BATCH_LIMIT,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            ann: AnnIndexParams::default(),
            default_hint_ttl_seconds: DEFAULT_HINT_TTL_SECONDS,
            hint_namespace: "blackboard".to_string(),
            event_ttl_seconds: DEFAULT_EVENT_TTL_SECONDS,
            tombstone_grace_seconds: 0,
            event_bus_capacity: 1_024,
            patterns: PatternSettings::default(),
            consensus: ConsensusSettings::default(),
        }
    }
}

/// Configuration file structure (for TOML parsing).
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    /// Database path.
    pub storage_path: Option<String>,
    /// Sweep interval.
    pub ttl_sweep_interval_ms: Option<u64>,
    /// Sweep batch limit.
    pub sweep_batch_limit: Option<usize>,
    /// Embedding dimension.
    pub embedding_dimension: Option<usize>,
    /// Hint TTL.
    pub default_hint_ttl_seconds: Option<u64>,
    /// Hint namespace.
    pub hint_namespace: Option<String>,
    /// Event retention.
    pub event_ttl_seconds: Option<u64>,
    /// Tombstone grace.
    pub tombstone_grace_seconds: Option<u64>,
    /// Event bus capacity.
    pub event_bus_capacity: Option<usize>,
    /// ANN section.
    pub ann: Option<ConfigFileAnn>,
    /// Patterns section.
    pub patterns: Option<ConfigFilePatterns>,
    /// Consensus section.
    pub consensus: Option<ConfigFileConsensus>,
}

/// ANN section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileAnn {
    /// Index kind.
    pub kind: Option<String>,
    /// Connectivity.
    pub m: Option<usize>,
    /// Construction breadth.
    pub ef_construction: Option<usize>,
    /// Search breadth.
    pub ef_search: Option<usize>,
    /// Level seed.
    pub seed: Option<u64>,
}

/// Patterns section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFilePatterns {
    /// EMA weight.
    pub ema_alpha: Option<f64>,
    /// GC confidence floor.
    pub confidence_floor: Option<f64>,
    /// GC retention window.
    pub retention_seconds: Option<u64>,
    /// Rebuild batch size.
    pub rebuild_batch_size: Option<usize>,
    /// Rebuild check interval.
    pub rebuild_check_interval_ms: Option<u64>,
}

/// Consensus section in config file.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFileConsensus {
    /// Single-vote veto.
    pub allow_veto: Option<bool>,
}

impl KernelConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(Error::storage("read_config_file"))?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the TOML is malformed or invalid.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)
            .map_err(|e| Error::Validation(format!("invalid config file: {e}")))?;
        let config = Self::from_config_file(file);
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the default location.
    ///
    /// Checks the platform config dir (`swarmkernel/config.toml`), then
    /// `~/.config/swarmkernel/config.toml`. Returns defaults when neither
    /// exists or parses.
    #[must_use]
    pub fn load_default() -> Self {
        let Some(base_dirs) = directories::BaseDirs::new() else {
            return Self::default();
        };

        let candidates = [
            base_dirs.config_dir().join("swarmkernel").join("config.toml"),
            base_dirs
                .home_dir()
                .join(".config")
                .join("swarmkernel")
                .join("config.toml"),
        ];

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config file");
                },
            }
        }

        Self::default()
    }

    /// Applies `SWARMKERNEL_*` environment overrides.
    ///
    /// Reads:
    /// - `SWARMKERNEL_STORAGE_PATH`
    /// - `SWARMKERNEL_TTL_SWEEP_INTERVAL_MS`
    /// - `SWARMKERNEL_SWEEP_BATCH_LIMIT`
    /// - `SWARMKERNEL_EMBEDDING_DIMENSION`
    /// - `SWARMKERNEL_HINT_TTL_SECONDS`
    /// - `SWARMKERNEL_ALLOW_VETO`
    #[must_use]
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(path) = std::env::var("SWARMKERNEL_STORAGE_PATH") {
            self.storage_path = if path.is_empty() || path == ":memory:" {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(v) = parse_env("SWARMKERNEL_TTL_SWEEP_INTERVAL_MS") {
            self.ttl_sweep_interval_ms = v;
        }
        if let Some(v) = parse_env("SWARMKERNEL_SWEEP_BATCH_LIMIT") {
            self.sweep_batch_limit = v;
        }
        if let Some(v) = parse_env("SWARMKERNEL_EMBEDDING_DIMENSION") {
            self.embedding_dimension = v;
        }
        if let Some(v) = parse_env("SWARMKERNEL_HINT_TTL_SECONDS") {
            self.default_hint_ttl_seconds = v;
        }
        if let Some(v) = std::env::var("SWARMKERNEL_ALLOW_VETO")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            self.consensus.allow_veto = v;
        }
        self
    }

    /// Checks invariants the kernel relies on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(Error::Validation(
                "embedding_dimension must be at least 1".to_string(),
            ));
        }
        if self.sweep_batch_limit == 0 {
            return Err(Error::Validation(
                "sweep_batch_limit must be at least 1".to_string(),
            ));
        }
        if self.ttl_sweep_interval_ms == 0 {
            return Err(Error::Validation(
                "ttl_sweep_interval_ms must be positive".to_string(),
            ));
        }
        let alpha = self.patterns.ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(Error::Validation(format!(
                "patterns.ema_alpha must be in (0, 1], got {alpha}"
            )));
        }
        if !(0.0..=1.0).contains(&self.patterns.confidence_floor) {
            return Err(Error::Validation(
                "patterns.confidence_floor must be in [0, 1]".to_string(),
            ));
        }
        if self.patterns.rebuild_batch_size == 0 {
            return Err(Error::Validation(
                "patterns.rebuild_batch_size must be at least 1".to_string(),
            ));
        }
        if self.ann.m < 2 || self.ann.ef_construction == 0 || self.ann.ef_search == 0 {
            return Err(Error::Validation(
                "ann parameters require m >= 2 and positive ef values".to_string(),
            ));
        }
        if self.event_bus_capacity == 0 {
            return Err(Error::Validation(
                "event_bus_capacity must be at least 1".to_string(),
            ));
        }
        crate::models::validate_namespace(&self.hint_namespace)?;
        Ok(())
    }

    /// Converts a `ConfigFile` to `KernelConfig`.
    fn from_config_file(file: ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(path) = file.storage_path {
            config.storage_path = Some(PathBuf::from(path));
        }
        if let Some(v) = file.ttl_sweep_interval_ms {
            config.ttl_sweep_interval_ms = v;
        }
        if let Some(v) = file.sweep_batch_limit {
            config.sweep_batch_limit = v;
        }
        if let Some(v) = file.embedding_dimension {
            config.embedding_dimension = v;
        }
        if let Some(v) = file.default_hint_ttl_seconds {
            config.default_hint_ttl_seconds = v;
        }
        if let Some(v) = file.hint_namespace {
            config.hint_namespace = v;
        }
        if let Some(v) = file.event_ttl_seconds {
            config.event_ttl_seconds = v;
        }
        if let Some(v) = file.tombstone_grace_seconds {
            config.tombstone_grace_seconds = v;
        }
        if let Some(v) = file.event_bus_capacity {
            config.event_bus_capacity = v;
        }
        if let Some(ann) = file.ann {
            if let Some(kind) = ann.kind {
                config.ann.kind = AnnIndexKind::parse(&kind);
            }
            if let Some(v) = ann.m {
                config.ann.m = v;
            }
            if let Some(v) = ann.ef_construction {
                config.ann.ef_construction = v;
            }
            if let Some(v) = ann.ef_search {
                config.ann.ef_search = v;
            }
            if let Some(v) = ann.seed {
                config.ann.seed = v;
            }
        }
        if let Some(patterns) = file.patterns {
            if let Some(v) = patterns.ema_alpha {
                config.patterns.ema_alpha = v;
            }
            if let Some(v) = patterns.confidence_floor {
                config.patterns.confidence_floor = v;
            }
            if let Some(v) = patterns.retention_seconds {
                config.patterns.retention_seconds = v;
            }
            if let Some(v) = patterns.rebuild_batch_size {
                config.patterns.rebuild_batch_size = v;
            }
            if let Some(v) = patterns.rebuild_check_interval_ms {
                config.patterns.rebuild_check_interval_ms = v;
            }
        }
        if let Some(consensus) = file.consensus {
            if let Some(v) = consensus.allow_veto {
                config.consensus.allow_veto = v;
            }
        }

        config
    }

    /// Sets the database path.
    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Sets the embedding dimension.
    #[must_use]
    pub const fn with_embedding_dimension(mut self, dimension: usize) -> Self {
        self.embedding_dimension = dimension;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.ttl_sweep_interval_ms = interval_ms;
        self
    }

    /// Sets the sweep batch limit.
    #[must_use]
    pub const fn with_sweep_batch_limit(mut self, limit: usize) -> Self {
        self.sweep_batch_limit = limit;
        self
    }

    /// Sets the ANN parameters.
    #[must_use]
    pub const fn with_ann(mut self, ann: AnnIndexParams) -> Self {
        self.ann = ann;
        self
    }

    /// Enables or disables single-vote veto.
    #[must_use]
    pub const fn with_veto(mut self, allow_veto: bool) -> Self {
        self.consensus.allow_veto = allow_veto;
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
