//! RulePack - declarative, versioned bundle of rule packs.
//!
//! A RulePack is loaded from TOML or JSON, validated as a whole (every
//! expression must compile, rule ids must be unique) and then treated as
//! read-only for the session. Reloading swaps an `Arc` between bars.

pub mod executor;
pub mod stats;

pub use executor::{
    EntryMatch, ExecutionSummary, PackEvalState, PackResult, RuleFailure, RuleOutcome, RulePackExecutor,
    RuleResult,
};
pub use stats::{most_triggered, RuleStats, StatsSnapshot};

use crate::domain::Side;
use crate::rules::{CompileError, RuleEngine};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RulePackError {
    #[error("failed to read rulepack '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rulepack TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("rulepack JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported rulepack format '{0}' (expected .toml or .json)")]
    UnsupportedFormat(PathBuf),

    #[error("rulepack metadata: {0}")]
    Metadata(String),

    #[error("duplicate rule id '{0}'")]
    DuplicateRuleId(String),

    #[error("entry rule '{0}' has no side")]
    MissingSide(String),

    #[error("rule '{rule_id}' does not compile: {source}")]
    Compile {
        rule_id: String,
        #[source]
        source: CompileError,
    },
}

/// Evaluation order: gate, entry, exit, risk, trailing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    Gate,
    Entry,
    Exit,
    Risk,
    Trailing,
}

impl PackType {
    pub const ALL: [PackType; 5] = [
        PackType::Gate,
        PackType::Entry,
        PackType::Exit,
        PackType::Risk,
        PackType::Trailing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PackType::Gate => "gate",
            PackType::Entry => "entry",
            PackType::Exit => "exit",
            PackType::Risk => "risk",
            PackType::Trailing => "trailing",
        }
    }
}

impl fmt::Display for PackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Only `fatal` aborts the remaining packs of a bar. Unrecognized values are
/// read as [`Severity::Unknown`], which is non-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
    Fatal,
    #[serde(other)]
    Unknown,
}

impl Severity {
    pub fn is_fatal(self) -> bool {
        self == Severity::Fatal
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub expression: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Direction of the entry an entry rule signals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pack {
    pub name: String,
    #[serde(rename = "type")]
    pub pack_type: PackType,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulePack {
    pub metadata: Metadata,
    #[serde(default)]
    pub packs: Vec<Pack>,
}

impl RulePack {
    pub fn from_toml_str(s: &str) -> Result<Self, RulePackError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, RulePackError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Parse a file, choosing the format by extension. Not validated.
    pub fn load(path: &Path) -> Result<Self, RulePackError> {
        let text = std::fs::read_to_string(path).map_err(|source| RulePackError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::from_toml_str(&text),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&text),
            _ => Err(RulePackError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Load and validate. Any failure rejects the whole file.
    pub fn load_validated(path: &Path, engine: &RuleEngine) -> Result<Self, RulePackError> {
        let pack = Self::load(path)?;
        pack.validate(engine)?;
        info!(
            name = %pack.metadata.name,
            version = %pack.metadata.version,
            rules = pack.rule_count(),
            "rulepack loaded"
        );
        Ok(pack)
    }

    /// Every expression compiles (warming the cache), ids are unique,
    /// entry rules carry a side.
    pub fn validate(&self, engine: &RuleEngine) -> Result<(), RulePackError> {
        if self.metadata.name.trim().is_empty() {
            return Err(RulePackError::Metadata("name is empty".into()));
        }
        if self.metadata.version.trim().is_empty() {
            return Err(RulePackError::Metadata("version is empty".into()));
        }
        let mut seen = HashSet::new();
        for pack in &self.packs {
            for rule in &pack.rules {
                if !seen.insert(rule.id.as_str()) {
                    return Err(RulePackError::DuplicateRuleId(rule.id.clone()));
                }
                if pack.pack_type == PackType::Entry && rule.side.is_none() {
                    return Err(RulePackError::MissingSide(rule.id.clone()));
                }
                engine
                    .compile(&rule.expression)
                    .map_err(|source| RulePackError::Compile {
                        rule_id: rule.id.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.packs.iter().map(|p| p.rules.len()).sum()
    }

    pub fn has_pack_type(&self, pack_type: PackType) -> bool {
        self.packs.iter().any(|p| p.pack_type == pack_type)
    }

    /// Packs in evaluation order. Stable within a type.
    pub fn ordered_packs(&self) -> Vec<&Pack> {
        let mut packs: Vec<&Pack> = self.packs.iter().collect();
        packs.sort_by_key(|p| p.pack_type);
        packs
    }
}

/// Shared slot holding the active RulePack.
///
/// Readers take an `Arc` snapshot once per bar; `replace` swaps the slot
/// atomically so an in-flight bar keeps evaluating the pack it started with.
#[derive(Debug, Clone, Default)]
pub struct RulePackHandle {
    slot: Arc<RwLock<Option<Arc<RulePack>>>>,
}

impl RulePackHandle {
    pub fn new(pack: Option<RulePack>) -> Self {
        Self {
            slot: Arc::new(RwLock::new(pack.map(Arc::new))),
        }
    }

    pub fn current(&self) -> Option<Arc<RulePack>> {
        self.slot.read().clone()
    }

    /// Validate `pack`, then swap it in. On error the active pack is kept.
    pub fn replace(&self, pack: RulePack, engine: &RuleEngine) -> Result<Option<Arc<RulePack>>, RulePackError> {
        pack.validate(engine)?;
        info!(
            name = %pack.metadata.name,
            version = %pack.metadata.version,
            "rulepack swapped"
        );
        Ok(self.slot.write().replace(Arc::new(pack)))
    }

    pub fn clear(&self) -> Option<Arc<RulePack>> {
        self.slot.write().take()
    }
}
