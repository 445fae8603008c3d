//! Pool configuration from `herd.toml`
//!
//! ```toml
//! size = 4
//! methods = ["ping", "echo"]
//! destroy_grace_ms = 2000
//!
//! [revive]
//! max_attempts = 10
//! base_delay_ms = 100
//! max_delay_ms = 30000
//! multiplier = 2.0
//! jitter = "full"
//! delay_first_attempt = true
//! ```
//!
//! Every field is optional. Environment variables override the file:
//! - `HERD_POOL_SIZE`
//! - `HERD_REVIVE_ATTEMPTS`
//! - `HERD_REVIVE_BASE_MS`
//! - `HERD_REVIVE_MAX_MS`

use crate::error::ConfigError;
use crate::pool::backoff::{BackoffPolicy, Jitter};
use crate::pool::manager::{PoolOptions, DEFAULT_DESTROY_GRACE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const POOL_SIZE_ENV: &str = "HERD_POOL_SIZE";
pub const REVIVE_ATTEMPTS_ENV: &str = "HERD_REVIVE_ATTEMPTS";
pub const REVIVE_BASE_MS_ENV: &str = "HERD_REVIVE_BASE_MS";
pub const REVIVE_MAX_MS_ENV: &str = "HERD_REVIVE_MAX_MS";

/// Jitter setting as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    #[default]
    Full,
    None,
}

impl From<JitterMode> for Jitter {
    fn from(mode: JitterMode) -> Self {
        match mode {
            JitterMode::Full => Jitter::Full,
            JitterMode::None => Jitter::None,
        }
    }
}

/// `[revive]` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReviveConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: JitterMode,
    pub delay_first_attempt: bool,
}

impl Default for ReviveConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter: JitterMode::Full,
            delay_first_attempt: policy.delay_first_attempt,
        }
    }
}

impl From<&ReviveConfig> for BackoffPolicy {
    fn from(config: &ReviveConfig) -> Self {
        BackoffPolicy {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter.into(),
            delay_first_attempt: config.delay_first_attempt,
        }
    }
}

/// Top-level pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of slots; the CPU count when absent
    pub size: Option<usize>,
    /// Methods declared on top of the lifecycle ones
    pub methods: Vec<String>,
    pub destroy_grace_ms: u64,
    pub revive: ReviveConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: None,
            methods: Vec::new(),
            destroy_grace_ms: DEFAULT_DESTROY_GRACE.as_millis() as u64,
            revive: ReviveConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Default location: `<config dir>/herd/herd.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("herd").join("herd.toml"))
    }

    /// Load from `path`, or from the default location if it exists
    ///
    /// A missing default file yields the defaults; a missing explicit file is
    /// an error. Environment overrides are applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.with_env_overrides()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded pool config");
        config.validated()
    }

    /// Apply `HERD_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parse_var(&lookup, POOL_SIZE_ENV)? {
            self.size = Some(size);
        }
        if let Some(attempts) = parse_var(&lookup, REVIVE_ATTEMPTS_ENV)? {
            self.revive.max_attempts = attempts;
        }
        if let Some(base) = parse_var(&lookup, REVIVE_BASE_MS_ENV)? {
            self.revive.base_delay_ms = base;
        }
        if let Some(max) = parse_var(&lookup, REVIVE_MAX_MS_ENV)? {
            self.revive.max_delay_ms = max;
        }
        self.validated()
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.size == Some(0) {
            return Err(ConfigError::Invalid("size must be at least 1".into()));
        }
        if self.revive.max_attempts == 0 {
            return Err(ConfigError::Invalid("revive.max_attempts must be at least 1".into()));
        }
        if !(self.revive.multiplier.is_finite() && self.revive.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "revive.multiplier must be a finite number >= 1, got {}",
                self.revive.multiplier
            )));
        }
        if self.revive.base_delay_ms > self.revive.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "revive.base_delay_ms ({}) exceeds revive.max_delay_ms ({})",
                self.revive.base_delay_ms, self.revive.max_delay_ms
            )));
        }
        Ok(self)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from(&self.revive)
    }

    pub fn to_options(&self) -> PoolOptions {
        let mut options = PoolOptions::default()
            .methods(self.methods.iter().cloned())
            .backoff(self.backoff())
            .destroy_grace(Duration::from_millis(self.destroy_grace_ms));
        options.size = self.size;
        options
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
    }
}
