//! Structured logging configuration.

use std::path::PathBuf;
use crate::{Error, Result};
use tracing_subscriber::EnvFilter;

/// Default filter when neither `SWARMKERNEL_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "swarmkernel=info,warn";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parses a format name, defaulting to pretty.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    /// Line format.
    pub format: LogFormat,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Builds configuration from the environment.
    ///
    /// Reads `SWARMKERNEL_LOG` (falling back to `RUST_LOG`),
    /// `SWARMKERNEL_LOG_FORMAT`, and `SWARMKERNEL_LOG_FILE`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(filter) = std::env::var("SWARMKERNEL_LOG")
            .ok()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .filter(|f| !f.trim().is_empty())
        {
            config.filter = filter;
        }
        if let Ok(format) = std::env::var("SWARMKERNEL_LOG_FORMAT") {
            config.format = LogFormat::parse(&format);
        }
        if let Ok(file) = std::env::var("SWARMKERNEL_LOG_FILE") {
            if !file.trim().is_empty() {
                config.file = Some(PathBuf::from(file));
            }
        }
        config
    }

    /// Sets the line format.
    #[must_use]
    pub const fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the filter directives.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    /// Writes logs to a file.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Parses the filter directives.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the directives do not parse.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        EnvFilter::try_new(&self.filter)
            .map_err(|e| Error::Validation(format!("invalid log filter '{}': {e}", self.filter)))
    }
}
