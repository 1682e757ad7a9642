//! Entry scorer - weighted confluence score per side, gated by regime.
//!
//! Each side is scored independently from five normalized components. The
//! active regime acts as a gate before weighting: it can block a side outright,
//! reduce it with a penalty multiplier, or boost it. The gate action and the
//! per-component reasons are always returned with the number.

use crate::config::ConfigError;
use crate::domain::{keys, FeatureVector, Side};
use crate::regime::{RegimeState, RegimeType};
use serde::{Deserialize, Serialize};
use tracing::debug;

const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Component weights. Must sum to ~1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryWeights {
    pub trend_alignment: f64,
    pub momentum: f64,
    pub trend_strength: f64,
    pub volatility: f64,
    pub volume: f64,
}

impl Default for EntryWeights {
    fn default() -> Self {
        Self {
            trend_alignment: 0.30,
            momentum: 0.25,
            trend_strength: 0.20,
            volatility: 0.10,
            volume: 0.15,
        }
    }
}

impl EntryWeights {
    pub fn sum(&self) -> f64 {
        self.trend_alignment + self.momentum + self.trend_strength + self.volatility + self.volume
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [
            ("entry.weights.trend_alignment", self.trend_alignment),
            ("entry.weights.momentum", self.momentum),
            ("entry.weights.trend_strength", self.trend_strength),
            ("entry.weights.volatility", self.volatility),
            ("entry.weights.volume", self.volume),
        ];
        for (field, w) in all {
            if !(w.is_finite() && w >= 0.0) {
                return Err(ConfigError::invalid(field, "weight must be a non-negative number"));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::invalid(
                "entry.weights",
                format!("weights must sum to 1.0 (got {sum:.4})"),
            ));
        }
        Ok(())
    }
}

/// How each regime gates a side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeGatePolicy {
    /// Block entries against an active trend (otherwise reduce by `counter_trend_multiplier`).
    pub block_counter_trend: bool,
    pub counter_trend_multiplier: f64,
    pub with_trend_bonus: f64,
    pub range_multiplier: f64,
    pub volatile_multiplier: f64,
    pub unknown_multiplier: f64,
}

impl Default for RegimeGatePolicy {
    fn default() -> Self {
        Self {
            block_counter_trend: true,
            counter_trend_multiplier: 0.5,
            with_trend_bonus: 1.15,
            range_multiplier: 0.8,
            volatile_multiplier: 0.6,
            unknown_multiplier: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Minimum final score for a side to produce a signal.
    pub threshold: f64,
    pub weights: EntryWeights,
    pub gate: RegimeGatePolicy,
    pub allow_short: bool,
    /// Require a second agreeing bar before the entry order is requested.
    pub require_confirmation: bool,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            weights: EntryWeights::default(),
            gate: RegimeGatePolicy::default(),
            allow_short: true,
            require_confirmation: true,
        }
    }
}

impl EntryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::invalid("entry.threshold", "must be within (0, 1]"));
        }
        let g = &self.gate;
        for (field, m) in [
            ("entry.gate.counter_trend_multiplier", g.counter_trend_multiplier),
            ("entry.gate.with_trend_bonus", g.with_trend_bonus),
            ("entry.gate.range_multiplier", g.range_multiplier),
            ("entry.gate.volatile_multiplier", g.volatile_multiplier),
            ("entry.gate.unknown_multiplier", g.unknown_multiplier),
        ] {
            if !(m.is_finite() && m >= 0.0) {
                return Err(ConfigError::invalid(field, "multiplier must be >= 0"));
            }
        }
        self.weights.validate()
    }
}

/// Regime gate verdict for one side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "multiplier", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateAction {
    Pass,
    Block,
    Reduce(f64),
    Boost(f64),
}

impl GateAction {
    pub fn multiplier(&self) -> f64 {
        match *self {
            GateAction::Pass => 1.0,
            GateAction::Block => 0.0,
            GateAction::Reduce(m) | GateAction::Boost(m) => m,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, GateAction::Block)
    }
}

/// Normalized component scores, each in 0.0..=1.0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    pub trend_alignment: f64,
    pub momentum: f64,
    pub trend_strength: f64,
    pub volatility: f64,
    pub volume: f64,
}

impl ComponentScores {
    fn scaled(self, m: f64) -> Self {
        let s = |v: f64| (v * m).clamp(0.0, 1.0);
        Self {
            trend_alignment: s(self.trend_alignment),
            momentum: s(self.momentum),
            trend_strength: s(self.trend_strength),
            volatility: s(self.volatility),
            volume: s(self.volume),
        }
    }

    fn weighted(&self, w: &EntryWeights) -> f64 {
        self.trend_alignment * w.trend_alignment
            + self.momentum * w.momentum
            + self.trend_strength * w.trend_strength
            + self.volatility * w.volatility
            + self.volume * w.volume
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryScore {
    pub side: Side,
    /// Final weighted score after gating, 0.0..=1.0.
    pub score: f64,
    /// Components before the gate multiplier.
    pub components: ComponentScores,
    pub gate: GateAction,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EntryScorer {
    config: EntryConfig,
}

impl EntryScorer {
    pub fn new(config: EntryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EntryConfig {
        &self.config
    }

    /// Regime gate for a side.
    pub fn gate(&self, side: Side, regime: &RegimeState) -> GateAction {
        let g = &self.config.gate;
        let with_trend = match side {
            Side::Long => RegimeType::TrendUp,
            Side::Short => RegimeType::TrendDown,
        };
        let to_action = |m: f64| {
            if m == 1.0 {
                GateAction::Pass
            } else if m > 1.0 {
                GateAction::Boost(m)
            } else if m == 0.0 {
                GateAction::Block
            } else {
                GateAction::Reduce(m)
            }
        };
        match regime.regime_type {
            t if t == with_trend => to_action(g.with_trend_bonus),
            RegimeType::TrendUp | RegimeType::TrendDown => {
                if g.block_counter_trend {
                    GateAction::Block
                } else {
                    to_action(g.counter_trend_multiplier)
                }
            }
            RegimeType::Range => to_action(g.range_multiplier),
            RegimeType::Volatile => to_action(g.volatile_multiplier),
            RegimeType::Unknown => to_action(g.unknown_multiplier),
        }
    }

    /// Score one side.
    pub fn score(&self, features: &FeatureVector, regime: &RegimeState, side: Side) -> EntryScore {
        let mut reasons = Vec::new();
        let components = ComponentScores {
            trend_alignment: trend_alignment(features, side, &mut reasons),
            momentum: momentum(features, side, &mut reasons),
            trend_strength: trend_strength(features, &mut reasons),
            volatility: volatility(features, &mut reasons),
            volume: volume(features, &mut reasons),
        };

        let gate = self.gate(side, regime);
        reasons.push(format!(
            "gate {:?} in {} regime",
            gate, regime.regime_type
        ));

        let score = if gate.is_blocked() {
            0.0
        } else {
            components
                .scaled(gate.multiplier())
                .weighted(&self.config.weights)
                .clamp(0.0, 1.0)
        };

        EntryScore {
            side,
            score,
            components,
            gate,
            reasons,
        }
    }

    /// Score both sides independently.
    pub fn score_both(&self, features: &FeatureVector, regime: &RegimeState) -> [EntryScore; 2] {
        [
            self.score(features, regime, Side::Long),
            self.score(features, regime, Side::Short),
        ]
    }

    /// The side clearing the threshold, if exactly one does.
    ///
    /// Two qualifying sides are contradictory and produce no candidate.
    pub fn best_candidate(&self, features: &FeatureVector, regime: &RegimeState) -> Option<EntryScore> {
        let threshold = self.config.threshold;
        let [long, short] = self.score_both(features, regime);
        let long_ok = long.score >= threshold;
        let short_ok = self.config.allow_short && short.score >= threshold;
        match (long_ok, short_ok) {
            (true, false) => Some(long),
            (false, true) => Some(short),
            (true, true) => {
                debug!(
                    long = long.score,
                    short = short.score,
                    "both sides above threshold, no entry"
                );
                None
            }
            (false, false) => None,
        }
    }
}

// ─── Components ─────────────────────────────────────────────────────

fn trend_alignment(f: &FeatureVector, side: Side, reasons: &mut Vec<String>) -> f64 {
    let (Some(fast), Some(slow)) = (f.get(keys::EMA_FAST), f.get(keys::EMA_SLOW)) else {
        reasons.push("trend_alignment: ema missing".into());
        return 0.0;
    };
    // Mirror prices for shorts so one ladder serves both sides.
    let s = side.sign();
    let (close, fast, slow) = (s * f.close, s * fast, s * slow);
    let value = if close > fast && fast > slow {
        1.0
    } else if fast > slow {
        0.6
    } else if close > slow {
        0.3
    } else {
        0.0
    };
    reasons.push(format!("trend_alignment={value:.2}"));
    value
}

fn momentum(f: &FeatureVector, side: Side, reasons: &mut Vec<String>) -> f64 {
    let rsi_part = f.get(keys::RSI).map(|rsi| {
        let (aligned, extreme) = match side {
            Side::Long => ((rsi - 45.0) / 25.0, rsi > 80.0),
            Side::Short => ((55.0 - rsi) / 25.0, rsi < 20.0),
        };
        // Exhausted momentum is worth half.
        if extreme {
            0.5
        } else {
            aligned.clamp(0.0, 1.0)
        }
    });
    let macd_part = f.get(keys::MACD_HIST).map(|h| {
        if side.sign() * h > 0.0 {
            1.0
        } else {
            0.0
        }
    });
    let value = match (rsi_part, macd_part) {
        (Some(r), Some(m)) => 0.7 * r + 0.3 * m,
        (Some(r), None) => r,
        (None, Some(m)) => m,
        (None, None) => {
            reasons.push("momentum: rsi/macd missing".into());
            return 0.0;
        }
    };
    reasons.push(format!("momentum={value:.2}"));
    value
}

fn trend_strength(f: &FeatureVector, reasons: &mut Vec<String>) -> f64 {
    match f.get(keys::ADX) {
        Some(adx) => {
            let value = ((adx - 15.0) / 25.0).clamp(0.0, 1.0);
            reasons.push(format!("trend_strength={value:.2} (adx {adx:.1})"));
            value
        }
        None => {
            reasons.push("trend_strength: adx missing".into());
            0.0
        }
    }
}

fn volatility(f: &FeatureVector, reasons: &mut Vec<String>) -> f64 {
    // Moderate volatility scores best; missing data is neutral.
    let value = match f.get(keys::ATR_PERCENTILE) {
        Some(p) => (1.0 - (p - 50.0).abs() / 50.0).clamp(0.0, 1.0),
        None => 0.5,
    };
    reasons.push(format!("volatility={value:.2}"));
    value
}

fn volume(f: &FeatureVector, reasons: &mut Vec<String>) -> f64 {
    match f.get(keys::VOLUME_AVG) {
        Some(avg) if avg > 0.0 => {
            let ratio = f.volume / avg;
            let value = ((ratio - 0.8) / 1.2).clamp(0.0, 1.0);
            reasons.push(format!("volume={value:.2} (ratio {ratio:.2})"));
            value
        }
        _ => {
            reasons.push("volume: average missing".into());
            0.0
        }
    }
}
