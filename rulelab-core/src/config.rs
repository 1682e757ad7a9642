//! Bot configuration - one TOML document, validated before any bar is processed.
//!
//! Every section has a `Default`, so a config file only needs the keys it
//! overrides. Load failures are fatal: the bot never starts on a config that
//! does not validate.

use crate::domain::OrderType;
use crate::leverage::LeverageConfig;
use crate::regime::RegimeConfig;
use crate::scoring::{EntryConfig, ExitConfig};
use crate::trailing::TrailingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Rule engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// RulePack file (TOML or JSON). Without one the bot runs on the scorer alone.
    pub rulepack_path: Option<PathBuf>,
    /// Maximum number of compiled programs kept in the cache.
    pub cache_capacity: usize,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            rulepack_path: None,
            cache_capacity: 512,
        }
    }
}

/// How entry intents are shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Notional per entry in quote currency (before leverage).
    pub order_notional: f64,
    pub order_type: OrderType,
    /// Cancel a pending entry that has not filled after this many bars.
    pub fill_timeout_bars: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_notional: 1_000.0,
            order_type: OrderType::Market,
            fill_timeout_bars: 3,
        }
    }
}

/// Optional out-of-band signal validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub enabled: bool,
    /// Results arriving later than this are discarded.
    pub timeout_ms: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 250,
        }
    }
}

/// Complete configuration for one bot instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bars consumed by `warmup_from_history` before decisions are emitted.
    pub warmup_bars: u64,
    pub entry: EntryConfig,
    pub regime: RegimeConfig,
    pub exit: ExitConfig,
    pub trailing: TrailingConfig,
    pub leverage: LeverageConfig,
    pub rules: RulesConfig,
    pub execution: ExecutionConfig,
    pub advisory: AdvisoryConfig,
}

impl BotConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: BotConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.entry.validate()?;
        self.regime.validate()?;
        self.exit.validate()?;
        self.trailing.validate()?;
        self.leverage.validate()?;
        if self.rules.cache_capacity == 0 {
            return Err(ConfigError::invalid("rules.cache_capacity", "must be >= 1"));
        }
        if !(self.execution.order_notional > 0.0) {
            return Err(ConfigError::invalid("execution.order_notional", "must be > 0"));
        }
        if self.execution.fill_timeout_bars == 0 {
            return Err(ConfigError::invalid("execution.fill_timeout_bars", "must be >= 1"));
        }
        Ok(())
    }

    /// Deterministic content hash of the full configuration.
    ///
    /// Two bots with the same hash make identical decisions on identical bars.
    pub fn config_hash(&self) -> Result<String, ConfigError> {
        let json = serde_json::to_vec(self)?;
        Ok(blake3::hash(&json).to_hex().to_string())
    }
}
