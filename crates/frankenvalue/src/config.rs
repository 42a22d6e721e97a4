//! Cache tuning configuration.
//!
//! Defaults can be overridden through environment variables, read once per
//! process:
//! - `FRANKENVALUE_INITIAL_ENTRIES`: initial cache array length (power of two).
//! - `FRANKENVALUE_PROBE_LIMIT`: linear probe window used by lookup and eviction.
//! - `FRANKENVALUE_LOAD_LIMIT`: occupancy percentage that triggers load reduction.
//! - `FRANKENVALUE_MAX_ENTRIES`: hard cap on cache array length (power of two).
//!
//! An invalid environment never aborts: it is reported and the defaults win.

use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::identity::HASH_MASK;

/// Default cache array length for a fresh context.
pub const DEFAULT_INITIAL_ENTRIES: usize = 32;

/// Default probe window.
pub const DEFAULT_PROBE_LIMIT: usize = 6;

/// Default occupancy percentage (tombstones included) before load reduction.
pub const DEFAULT_LOAD_LIMIT_PERCENT: u8 = 67;

/// Largest array length a cache may grow to.
pub const DEFAULT_MAX_ENTRIES: usize = HASH_MASK as usize + 1;

const ENV_INITIAL_ENTRIES: &str = "FRANKENVALUE_INITIAL_ENTRIES";
const ENV_PROBE_LIMIT: &str = "FRANKENVALUE_PROBE_LIMIT";
const ENV_LOAD_LIMIT: &str = "FRANKENVALUE_LOAD_LIMIT";
const ENV_MAX_ENTRIES: &str = "FRANKENVALUE_MAX_ENTRIES";

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("probe limit must be in 1..={max}, got {value}")]
    ProbeLimit { value: usize, max: usize },
    #[error("load limit must be a percentage in 1..=100, got {0}")]
    LoadLimit(u8),
    #[error("max entries {max} is below initial entries {initial}")]
    MaxBelowInitial { initial: usize, max: usize },
    #[error("max entries {0} exceeds the cache hash range")]
    MaxTooLarge(usize),
    #[error("{name}: cannot parse {raw:?} as an integer")]
    Parse { name: &'static str, raw: String },
}

/// Tunables for one context's cache array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    /// Array length when the context's map is first created.
    pub initial_entries: usize,
    /// Maximum distance from the home slot searched or used for placement.
    pub probe_limit: usize,
    /// Occupied-slot percentage at which stale sweeping (then growth) kicks in.
    pub load_limit_percent: u8,
    /// The array never grows past this length.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            initial_entries: DEFAULT_INITIAL_ENTRIES,
            probe_limit: DEFAULT_PROBE_LIMIT,
            load_limit_percent: DEFAULT_LOAD_LIMIT_PERCENT,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.initial_entries.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "initial_entries",
                value: self.initial_entries,
            });
        }
        if !self.max_entries.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                name: "max_entries",
                value: self.max_entries,
            });
        }
        if self.probe_limit == 0 || self.probe_limit > self.initial_entries {
            return Err(ConfigError::ProbeLimit {
                value: self.probe_limit,
                max: self.initial_entries,
            });
        }
        if self.load_limit_percent == 0 || self.load_limit_percent > 100 {
            return Err(ConfigError::LoadLimit(self.load_limit_percent));
        }
        if self.max_entries < self.initial_entries {
            return Err(ConfigError::MaxBelowInitial {
                initial: self.initial_entries,
                max: self.max_entries,
            });
        }
        if self.max_entries > DEFAULT_MAX_ENTRIES {
            return Err(ConfigError::MaxTooLarge(self.max_entries));
        }
        Ok(())
    }

    /// Number of occupied slots an array of `len` may hold before load reduction.
    #[must_use]
    pub fn load_limit_for(&self, len: usize) -> usize {
        len.saturating_mul(usize::from(self.load_limit_percent)) / 100
    }

    /// Build from the process environment, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source (used by `from_env` and tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_INITIAL_ENTRIES) {
            config.initial_entries = parse_var(ENV_INITIAL_ENTRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PROBE_LIMIT) {
            config.probe_limit = parse_var(ENV_PROBE_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOAD_LIMIT) {
            config.load_limit_percent = parse_var(ENV_LOAD_LIMIT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_ENTRIES) {
            config.max_entries = parse_var(ENV_MAX_ENTRIES, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<N: std::str::FromStr>(name: &'static str, raw: &str) -> Result<N, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Parse {
        name,
        raw: raw.to_owned(),
    })
}

static PROCESS_CONFIG: OnceLock<CacheConfig> = OnceLock::new();

/// Process-wide default configuration (reads the environment on first call).
#[must_use]
pub fn cache_config() -> CacheConfig {
    *PROCESS_CONFIG.get_or_init(|| match CacheConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "ignoring invalid cache configuration from environment");
            CacheConfig::default()
        }
    })
}
