//! Leverage rules - bounded leverage for a new entry.
//!
//! The bound is built in four steps: asset tier maximum, regime multiplier,
//! volatility multiplier, and finally the cap implied by the stop distance.
//! The stop cap keeps the liquidation price beyond the protective stop, so a
//! stop-out always happens before a liquidation.

use crate::config::ConfigError;
use crate::domain::Side;
use crate::regime::{RegimeState, RegimeType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum LeverageError {
    #[error("invalid entry price {0}")]
    InvalidPrice(f64),

    #[error("stop {stop} is on the wrong side of entry {entry} for a {side} position")]
    StopOnWrongSide { side: Side, entry: f64, stop: f64 },

    #[error("stop {stop} is too far from entry {entry}: liquidation would come first at any leverage")]
    StopTooFar { entry: f64, stop: f64 },

    #[error("leverage {leverage} exceeds tier maximum {max}")]
    ExceedsTierMax { leverage: f64, max: f64 },

    #[error("leverage {0} is below 1x")]
    BelowMinimum(f64),

    #[error("liquidation price {liquidation} lies between entry {entry} and stop {stop}")]
    LiquidationInsideStop {
        entry: f64,
        stop: f64,
        liquidation: f64,
    },
}

/// One row of the asset tier table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetTier {
    pub name: String,
    pub symbols: Vec<String>,
    pub max_leverage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeMultipliers {
    pub trend: f64,
    pub range: f64,
    pub volatile: f64,
    pub unknown: f64,
}

impl Default for RegimeMultipliers {
    fn default() -> Self {
        Self {
            trend: 1.0,
            range: 0.7,
            volatile: 0.4,
            unknown: 0.5,
        }
    }
}

impl RegimeMultipliers {
    fn for_regime(&self, regime: RegimeType) -> f64 {
        match regime {
            RegimeType::TrendUp | RegimeType::TrendDown => self.trend,
            RegimeType::Range => self.range,
            RegimeType::Volatile => self.volatile,
            RegimeType::Unknown => self.unknown,
        }
    }
}

/// ATR as a percent of entry selects the volatility multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityScaling {
    pub elevated_atr_pct: f64,
    pub elevated_multiplier: f64,
    pub high_atr_pct: f64,
    pub high_multiplier: f64,
}

impl Default for VolatilityScaling {
    fn default() -> Self {
        Self {
            elevated_atr_pct: 1.5,
            elevated_multiplier: 0.75,
            high_atr_pct: 3.0,
            high_multiplier: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeverageConfig {
    pub tiers: Vec<AssetTier>,
    /// Maximum for symbols not listed in any tier.
    pub default_max_leverage: f64,
    pub regime_multipliers: RegimeMultipliers,
    pub volatility: VolatilityScaling,
    pub maintenance_margin_rate: f64,
    /// Extra distance required between stop and liquidation, as a fraction
    /// of the stop distance (0.5 = liquidation at least 1.5x as far as the stop).
    pub liquidation_buffer: f64,
}

impl Default for LeverageConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                AssetTier {
                    name: "major".into(),
                    symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
                    max_leverage: 10.0,
                },
                AssetTier {
                    name: "large_cap".into(),
                    symbols: vec!["SOLUSDT".into(), "BNBUSDT".into(), "XRPUSDT".into()],
                    max_leverage: 5.0,
                },
            ],
            default_max_leverage: 3.0,
            regime_multipliers: RegimeMultipliers::default(),
            volatility: VolatilityScaling::default(),
            maintenance_margin_rate: 0.005,
            liquidation_buffer: 0.5,
        }
    }
}

impl LeverageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tiers.iter().any(|t| !(t.max_leverage >= 1.0)) || !(self.default_max_leverage >= 1.0) {
            return Err(ConfigError::invalid("leverage.tiers", "tier maximum must be >= 1"));
        }
        let m = &self.regime_multipliers;
        if [m.trend, m.range, m.volatile, m.unknown]
            .iter()
            .any(|v| !(*v > 0.0 && *v <= 1.0))
        {
            return Err(ConfigError::invalid(
                "leverage.regime_multipliers",
                "multipliers must be within (0, 1]",
            ));
        }
        let v = &self.volatility;
        if !(v.elevated_atr_pct <= v.high_atr_pct)
            || !(v.elevated_multiplier > 0.0 && v.elevated_multiplier <= 1.0)
            || !(v.high_multiplier > 0.0 && v.high_multiplier <= 1.0)
        {
            return Err(ConfigError::invalid(
                "leverage.volatility",
                "thresholds must be ordered and multipliers within (0, 1]",
            ));
        }
        if !(0.0..0.5).contains(&self.maintenance_margin_rate) {
            return Err(ConfigError::invalid(
                "leverage.maintenance_margin_rate",
                "must be within [0, 0.5)",
            ));
        }
        if !(self.liquidation_buffer >= 0.0) {
            return Err(ConfigError::invalid("leverage.liquidation_buffer", "must be >= 0"));
        }
        Ok(())
    }
}

/// Which step produced the final bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeverageCap {
    Tier,
    Regime,
    Volatility,
    StopDistance,
    Minimum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageResult {
    pub symbol: String,
    pub leverage: f64,
    pub tier: String,
    pub tier_max: f64,
    pub regime_multiplier: f64,
    pub volatility_multiplier: f64,
    /// Highest leverage that keeps liquidation beyond the buffered stop.
    pub stop_cap: f64,
    pub liquidation_price: f64,
    pub capped_by: LeverageCap,
    pub reasons: Vec<String>,
}

/// Isolated-margin liquidation price.
pub fn liquidation_price(side: Side, entry: f64, leverage: f64, maintenance_margin_rate: f64) -> f64 {
    match side {
        Side::Long => entry * (1.0 - 1.0 / leverage + maintenance_margin_rate),
        Side::Short => entry * (1.0 + 1.0 / leverage - maintenance_margin_rate),
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeverageRulesEngine {
    config: LeverageConfig,
}

impl LeverageRulesEngine {
    pub fn new(config: LeverageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LeverageConfig {
        &self.config
    }

    /// Tier name and maximum for a symbol.
    pub fn tier_for(&self, symbol: &str) -> (&str, f64) {
        self.config
            .tiers
            .iter()
            .find(|t| t.symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol)))
            .map(|t| (t.name.as_str(), t.max_leverage))
            .unwrap_or(("default", self.config.default_max_leverage))
    }

    pub fn calculate_leverage(
        &self,
        symbol: &str,
        entry_price: f64,
        side: Side,
        stop_price: f64,
        regime: &RegimeState,
        atr: Option<f64>,
    ) -> Result<LeverageResult, LeverageError> {
        let stop_distance = checked_stop_distance(side, entry_price, stop_price)?;
        let cfg = &self.config;
        let mut reasons = Vec::new();

        let (tier, tier_max) = self.tier_for(symbol);
        reasons.push(format!("tier {tier} max {tier_max:.1}x"));

        let regime_multiplier = cfg.regime_multipliers.for_regime(regime.regime_type);
        let after_regime = tier_max * regime_multiplier;
        reasons.push(format!("regime {} x{regime_multiplier:.2}", regime.regime_type));

        let volatility_multiplier = match atr.filter(|a| a.is_finite() && *a > 0.0) {
            Some(a) => {
                let atr_pct = a / entry_price * 100.0;
                let m = if atr_pct >= cfg.volatility.high_atr_pct {
                    cfg.volatility.high_multiplier
                } else if atr_pct >= cfg.volatility.elevated_atr_pct {
                    cfg.volatility.elevated_multiplier
                } else {
                    1.0
                };
                reasons.push(format!("atr {atr_pct:.2}% x{m:.2}"));
                m
            }
            None => 1.0,
        };
        let after_volatility = after_regime * volatility_multiplier;

        let stop_cap =
            1.0 / (stop_distance * (1.0 + cfg.liquidation_buffer) + cfg.maintenance_margin_rate);
        reasons.push(format!("stop distance {:.2}% caps at {stop_cap:.2}x", stop_distance * 100.0));

        let mut capped_by = if regime_multiplier < 1.0 {
            LeverageCap::Regime
        } else {
            LeverageCap::Tier
        };
        if volatility_multiplier < 1.0 {
            capped_by = LeverageCap::Volatility;
        }
        let mut bound = after_volatility;
        if stop_cap < bound {
            bound = stop_cap;
            capped_by = LeverageCap::StopDistance;
        }

        let mut leverage = round_down_tenth(bound).min(tier_max);
        if leverage < 1.0 {
            leverage = 1.0;
            capped_by = LeverageCap::Minimum;
        }

        let liquidation = liquidation_price(side, entry_price, leverage, cfg.maintenance_margin_rate);
        if liquidation_inside(side, entry_price, stop_price, liquidation) {
            return Err(LeverageError::StopTooFar {
                entry: entry_price,
                stop: stop_price,
            });
        }

        debug!(symbol, leverage, ?capped_by, liquidation, "leverage computed");

        Ok(LeverageResult {
            symbol: symbol.to_string(),
            leverage,
            tier: tier.to_string(),
            tier_max,
            regime_multiplier,
            volatility_multiplier,
            stop_cap,
            liquidation_price: liquidation,
            capped_by,
            reasons,
        })
    }

    /// Pure re-check of a proposed leverage before an order is submitted.
    pub fn validate_leverage(
        &self,
        symbol: &str,
        entry_price: f64,
        side: Side,
        stop_price: f64,
        leverage: f64,
    ) -> Result<(), LeverageError> {
        checked_stop_distance(side, entry_price, stop_price)?;
        let (_, tier_max) = self.tier_for(symbol);
        if !(leverage >= 1.0) {
            return Err(LeverageError::BelowMinimum(leverage));
        }
        if leverage > tier_max {
            return Err(LeverageError::ExceedsTierMax {
                leverage,
                max: tier_max,
            });
        }
        let liquidation =
            liquidation_price(side, entry_price, leverage, self.config.maintenance_margin_rate);
        if liquidation_inside(side, entry_price, stop_price, liquidation) {
            return Err(LeverageError::LiquidationInsideStop {
                entry: entry_price,
                stop: stop_price,
                liquidation,
            });
        }
        Ok(())
    }
}

/// Stop distance as a fraction of entry. Errors on bad prices or a stop on the wrong side.
fn checked_stop_distance(side: Side, entry: f64, stop: f64) -> Result<f64, LeverageError> {
    if !(entry.is_finite() && entry > 0.0) {
        return Err(LeverageError::InvalidPrice(entry));
    }
    let distance = side.sign() * (entry - stop) / entry;
    if !(stop.is_finite() && distance > 0.0) {
        return Err(LeverageError::StopOnWrongSide { side, entry, stop });
    }
    Ok(distance)
}

/// True when the liquidation price is not strictly beyond the stop.
fn liquidation_inside(side: Side, entry: f64, stop: f64, liquidation: f64) -> bool {
    match side {
        Side::Long => liquidation >= stop && liquidation <= entry,
        Side::Short => liquidation <= stop && liquidation >= entry,
    }
}

fn round_down_tenth(v: f64) -> f64 {
    (v * 10.0).floor() / 10.0
}
