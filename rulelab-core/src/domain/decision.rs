//! BotDecision - the audit record produced by at most one trigger chain per bar.

use super::features::FeatureHash;
use super::intent::OrderIntent;
use super::position::Side;
use crate::machine::BotState;
use crate::regime::RegimeType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionAction {
    /// A new entry candidate was raised (FLAT -> SIGNAL).
    Signal,
    /// The candidate was confirmed and an entry order requested.
    Enter,
    /// The open position is being closed.
    Exit,
    /// The protective stop moved.
    AdjustStop,
    /// The pending entry was withdrawn (expired signal or fill timeout).
    Cancel,
}

/// Why a position was closed. Reasons are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TimeStop,
    MomentumReversal,
    RegimeReversal,
    RuleExit(String),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => f.write_str("STOP_LOSS"),
            ExitReason::TakeProfit => f.write_str("TAKE_PROFIT"),
            ExitReason::TimeStop => f.write_str("TIME_STOP"),
            ExitReason::MomentumReversal => f.write_str("MOMENTUM_REVERSAL"),
            ExitReason::RegimeReversal => f.write_str("REGIME_REVERSAL"),
            ExitReason::RuleExit(id) => write!(f, "RULE_EXIT({id})"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotDecision {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bar: u64,
    pub action: DecisionAction,
    pub side: Option<Side>,
    pub exit_reason: Option<ExitReason>,
    pub reasons: Vec<String>,
    pub score: Option<f64>,
    pub state_before: BotState,
    pub state_after: BotState,
    pub regime: RegimeType,
    /// Whether the rule engine (rather than the scorer/checker) drove the decision.
    pub rule_driven: bool,
    pub order_intent: Option<OrderIntent>,
    pub features_hash: FeatureHash,
}
