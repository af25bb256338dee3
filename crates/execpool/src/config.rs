//! Configuration resolution for execpool.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/execpool/config.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`EXECPOOL_*`)
//! 5. CLI arguments (applied by the binary, highest priority)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::spec::ProcessSpec;

/// Default number of pre-spawned workers.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default log level when neither config nor environment sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("no worker program configured")]
    MissingProgram,
}

/// Complete execpool configuration. Every field is optional so layers only
/// override what they set.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of pre-spawned workers.
    pub size: Option<usize>,
    /// Kill a checked-out worker that runs longer than this.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct WorkerConfig {
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub level: Option<String>,
    pub json: Option<bool>,
}

impl Config {
    pub fn pool_size(&self) -> usize {
        self.pool.size.unwrap_or(DEFAULT_POOL_SIZE)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.pool.timeout_ms.map(Duration::from_millis)
    }

    pub fn log_level(&self) -> &str {
        self.log.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_json(&self) -> bool {
        self.log.json.unwrap_or(false)
    }

    /// Build the worker spec described by the `[worker]` section.
    pub fn spec(&self) -> Result<ProcessSpec, ConfigError> {
        let program = self
            .worker
            .program
            .as_deref()
            .ok_or(ConfigError::MissingProgram)?;
        let mut spec = ProcessSpec::new(program)
            .args(&self.worker.args)
            .envs(&self.worker.env);
        if let Some(dir) = &self.worker.dir {
            spec = spec.current_dir(dir);
        }
        Ok(spec)
    }

    /// Overlay every field that `other` sets onto `self`.
    pub fn merge(&mut self, other: Self) {
        if other.pool.size.is_some() {
            self.pool.size = other.pool.size;
        }
        if other.pool.timeout_ms.is_some() {
            self.pool.timeout_ms = other.pool.timeout_ms;
        }

        // A new program brings its own argument list.
        if other.worker.program.is_some() {
            self.worker.program = other.worker.program;
            self.worker.args = other.worker.args;
        } else if !other.worker.args.is_empty() {
            self.worker.args = other.worker.args;
        }
        self.worker.env.extend(other.worker.env);
        if other.worker.dir.is_some() {
            self.worker.dir = other.worker.dir;
        }

        if other.log.level.is_some() {
            self.log.level = other.log.level;
        }
        if other.log.json.is_some() {
            self.log.json = other.log.json;
        }
    }
}

/// Load configuration with layered resolution.
///
/// `explicit` must exist when given; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Some(global) = global_config_path() {
        if global.exists() {
            config.merge(load_config_file(&global)?);
        }
    }

    if let Some(path) = explicit {
        config.merge(load_config_file(path)?);
    }

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("execpool").join("config.toml"))
}

pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `EXECPOOL_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("EXECPOOL_SIZE") {
        config.pool.size = Some(parse_env("EXECPOOL_SIZE", val)?);
    }
    if let Some(val) = lookup("EXECPOOL_TIMEOUT_MS") {
        config.pool.timeout_ms = Some(parse_env("EXECPOOL_TIMEOUT_MS", val)?);
    }
    if let Some(val) = lookup("EXECPOOL_PROGRAM") {
        config.worker.program = Some(val);
    }
    if let Some(val) = lookup("EXECPOOL_LOG_LEVEL") {
        config.log.level = Some(val);
    }
    if let Some(val) = lookup("EXECPOOL_LOG_JSON") {
        config.log.json = Some(parse_env("EXECPOOL_LOG_JSON", val)?);
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
