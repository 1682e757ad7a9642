//! Signal - an ephemeral entry candidate.
//!
//! Created by the entry scorer or an entry rule pack, consumed by exactly one
//! state-machine trigger, then dropped. A signal never outlives its bar; only
//! its id is remembered so late advisory results can be matched against it.

use super::position::Side;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-bot monotonically increasing signal identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalId(pub u64);

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig-{}", self.0)
    }
}

/// Where a signal came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalSource {
    Scorer,
    Rule { rule_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    pub symbol: String,
    pub side: Side,
    /// Entry score in 0.0..=1.0 (rule signals carry 1.0).
    pub score: f64,
    /// Confluence: the contributing reasons behind the score.
    pub reasons: Vec<String>,
    pub source: SignalSource,
    pub bar: u64,
    pub timestamp: DateTime<Utc>,
    pub reference_price: f64,
}

impl Signal {
    /// Whether `other` confirms this signal (same side, same symbol).
    pub fn confirms(&self, other: &Signal) -> bool {
        self.symbol == other.symbol && self.side == other.side
    }
}
