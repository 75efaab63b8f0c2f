//! Pipeline configuration.
//!
//! Loaded from TOML, then overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `SPYGLASS_WORKERS` | `worker_threads` |
//! | `SPYGLASS_LOG` | `log_filter` |
//!
//! ```toml
//! worker_threads = 8
//! catch_panics = true
//! log_filter = "spyglass_core=debug"
//! snapshot_path = "state/pipeline.json"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::{Error, Result};

/// Environment variable overriding `worker_threads`.
pub const ENV_WORKERS: &str = "SPYGLASS_WORKERS";
/// Environment variable overriding `log_filter`.
pub const ENV_LOG: &str = "SPYGLASS_LOG";

/// Runtime configuration of a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Threads for `populate`; `None` uses rayon's global pool.
    pub worker_threads: Option<usize>,
    /// Record panicking compute functions as failures instead of unwinding.
    pub catch_panics: bool,
    /// `EnvFilter` directive used by [`PipelineConfig::init_tracing`].
    pub log_filter: String,
    /// Snapshot file loaded at build time if it exists.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            catch_panics: true,
            log_filter: "spyglass_core=info".to_string(),
            snapshot_path: None,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Toml` on malformed input and `Config` on invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `SPYGLASS_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` if an override does not parse.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns `Config` if an override does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_WORKERS) {
            let workers = raw
                .trim()
                .parse::<usize>()
                .map_err(|e| Error::Config(format!("{ENV_WORKERS}={raw}: {e}")))?;
            self.worker_threads = Some(workers);
        }
        if let Some(filter) = lookup(ENV_LOG) {
            if !filter.trim().is_empty() {
                self.log_filter = filter;
            }
        }
        self.validate()
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `Config` if `worker_threads` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == Some(0) {
            return Err(Error::Config("worker_threads must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Install a global `tracing` subscriber filtered by `log_filter`.
    ///
    /// Returns `false` if a subscriber was already installed (the existing
    /// one is kept).
    ///
    /// # Errors
    ///
    /// Returns `Config` if `log_filter` is not a valid filter directive.
    pub fn init_tracing(&self) -> Result<bool> {
        let filter = EnvFilter::try_new(&self.log_filter)
            .map_err(|e| Error::Config(format!("log_filter '{}': {e}", self.log_filter)))?;
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        Ok(Registry::default()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert!(config.catch_panics);
        assert_eq!(config.worker_threads, None);
        assert_eq!(PipelineConfig::from_toml_str("").unwrap(), config);
    }

    #[test]
    fn test_parse_toml() {
        let config = PipelineConfig::from_toml_str(
            r#"
            worker_threads = 4
            catch_panics = false
            snapshot_path = "state.json"
            "#,
        )
        .unwrap();
        assert_eq!(config.worker_threads, Some(4));
        assert!(!config.catch_panics);
        assert_eq!(config.snapshot_path, Some(PathBuf::from("state.json")));
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("workers = 4"),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("worker_threads = 0"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut config = PipelineConfig::default();
        config
            .apply_overrides(|name| match name {
                ENV_WORKERS => Some("3".to_string()),
                ENV_LOG => Some("spyglass_core=trace".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.worker_threads, Some(3));
        assert_eq!(config.log_filter, "spyglass_core=trace");

        let bad = config.apply_overrides(|name| (name == ENV_WORKERS).then(|| "many".to_string()));
        assert!(matches!(bad, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_log_filter() {
        let config = PipelineConfig {
            log_filter: "spyglass_core=notalevel".to_string(),
            ..PipelineConfig::default()
        };
        assert!(config.init_tracing().is_err());
    }
}
