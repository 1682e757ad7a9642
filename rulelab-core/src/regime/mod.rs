//! Regime classification - labels each bar as trend, range or volatile.
//!
//! [`RegimeEngine::classify`] is stateless and deterministic. Hysteresis lives
//! in [`RegimeTracker`], which only accepts a new label after it has been
//! observed for `confirm_bars` consecutive bars.

pub mod tracker;

pub use tracker::{RegimeTracker, RegimeUpdate, TrackerSnapshot};

use crate::config::ConfigError;
use crate::domain::{keys, FeatureVector};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegimeType {
    TrendUp,
    TrendDown,
    Range,
    Volatile,
    Unknown,
}

impl RegimeType {
    pub fn as_str(self) -> &'static str {
        match self {
            RegimeType::TrendUp => "TREND_UP",
            RegimeType::TrendDown => "TREND_DOWN",
            RegimeType::Range => "RANGE",
            RegimeType::Volatile => "VOLATILE",
            RegimeType::Unknown => "UNKNOWN",
        }
    }

    pub fn is_trending(self) -> bool {
        matches!(self, RegimeType::TrendUp | RegimeType::TrendDown)
    }
}

impl fmt::Display for RegimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectionBias {
    Bullish,
    Bearish,
    Neutral,
}

impl DirectionBias {
    pub fn as_str(self) -> &'static str {
        match self {
            DirectionBias::Bullish => "BULLISH",
            DirectionBias::Bearish => "BEARISH",
            DirectionBias::Neutral => "NEUTRAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolatilityLevel {
    Low,
    Normal,
    High,
    Extreme,
}

impl VolatilityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            VolatilityLevel::Low => "LOW",
            VolatilityLevel::Normal => "NORMAL",
            VolatilityLevel::High => "HIGH",
            VolatilityLevel::Extreme => "EXTREME",
        }
    }
}

/// Immutable regime classification for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime_type: RegimeType,
    pub direction: DirectionBias,
    pub volatility: VolatilityLevel,
    /// 0.0..=1.0
    pub confidence: f64,
}

impl RegimeState {
    pub fn unknown() -> Self {
        Self {
            regime_type: RegimeType::Unknown,
            direction: DirectionBias::Neutral,
            volatility: VolatilityLevel::Normal,
            confidence: 0.0,
        }
    }
}

impl Default for RegimeState {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Which aspects of the regime changed between two classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegimeChange {
    pub type_changed: bool,
    pub direction_changed: bool,
}

impl RegimeChange {
    pub fn any(&self) -> bool {
        self.type_changed || self.direction_changed
    }
}

pub fn detect_regime_change(current: &RegimeState, previous: &RegimeState) -> RegimeChange {
    RegimeChange {
        type_changed: current.regime_type != previous.regime_type,
        direction_changed: current.direction != previous.direction,
    }
}

/// Classification thresholds and anti-flap parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// ADX at or above this value counts as trending.
    pub trend_adx_threshold: f64,
    /// ATR percentile at or above this value classifies the bar as volatile.
    pub volatile_atr_percentile: f64,
    pub high_vol_percentile: f64,
    pub low_vol_percentile: f64,
    pub confirm_bars: usize,
    pub cooldown_bars: usize,
    pub min_segment_bars: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_adx_threshold: 25.0,
            volatile_atr_percentile: 90.0,
            high_vol_percentile: 70.0,
            low_vol_percentile: 25.0,
            confirm_bars: 3,
            cooldown_bars: 2,
            min_segment_bars: 5,
        }
    }
}

impl RegimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.trend_adx_threshold > 0.0 && self.trend_adx_threshold < 100.0) {
            return Err(ConfigError::invalid(
                "regime.trend_adx_threshold",
                "must be within (0, 100)",
            ));
        }
        if !(self.low_vol_percentile <= self.high_vol_percentile
            && self.high_vol_percentile <= self.volatile_atr_percentile
            && self.volatile_atr_percentile <= 100.0)
        {
            return Err(ConfigError::invalid(
                "regime.volatile_atr_percentile",
                "percentiles must satisfy low <= high <= volatile <= 100",
            ));
        }
        if self.confirm_bars == 0 {
            return Err(ConfigError::invalid("regime.confirm_bars", "must be >= 1"));
        }
        Ok(())
    }
}

/// Stateless threshold classifier.
#[derive(Debug, Clone, Default)]
pub struct RegimeEngine {
    config: RegimeConfig,
}

impl RegimeEngine {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Classify one bar. Missing ADX yields `Unknown`.
    pub fn classify(&self, features: &FeatureVector) -> RegimeState {
        let volatility_pct = features.get(keys::ATR_PERCENTILE);
        let volatility = self.volatility_level(volatility_pct);
        let direction = direction_bias(features);

        if let Some(pct) = volatility_pct {
            if pct >= self.config.volatile_atr_percentile {
                let span = (100.0 - self.config.volatile_atr_percentile).max(1.0);
                return RegimeState {
                    regime_type: RegimeType::Volatile,
                    direction,
                    volatility,
                    confidence: clamp01(0.5 + (pct - self.config.volatile_atr_percentile) / (2.0 * span)),
                };
            }
        }

        let Some(adx) = features.get(keys::ADX) else {
            return RegimeState {
                volatility,
                direction,
                ..RegimeState::unknown()
            };
        };

        let threshold = self.config.trend_adx_threshold;
        let regime_type = if adx >= threshold {
            match direction {
                DirectionBias::Bullish => RegimeType::TrendUp,
                DirectionBias::Bearish => RegimeType::TrendDown,
                DirectionBias::Neutral => RegimeType::Range,
            }
        } else {
            RegimeType::Range
        };

        let confidence = if regime_type.is_trending() {
            clamp01(0.5 + (adx - threshold) / (2.0 * threshold))
        } else {
            clamp01(0.5 + (threshold - adx) / (2.0 * threshold))
        };

        RegimeState {
            regime_type,
            direction,
            volatility,
            confidence,
        }
    }

    fn volatility_level(&self, pct: Option<f64>) -> VolatilityLevel {
        match pct {
            None => VolatilityLevel::Normal,
            Some(p) if p >= self.config.volatile_atr_percentile => VolatilityLevel::Extreme,
            Some(p) if p >= self.config.high_vol_percentile => VolatilityLevel::High,
            Some(p) if p < self.config.low_vol_percentile => VolatilityLevel::Low,
            Some(_) => VolatilityLevel::Normal,
        }
    }
}

/// DI spread when available, otherwise EMA ordering, otherwise close vs slow EMA.
fn direction_bias(features: &FeatureVector) -> DirectionBias {
    let compare = |a: f64, b: f64| {
        if a > b {
            DirectionBias::Bullish
        } else if a < b {
            DirectionBias::Bearish
        } else {
            DirectionBias::Neutral
        }
    };
    if let (Some(plus), Some(minus)) = (features.get(keys::PLUS_DI), features.get(keys::MINUS_DI)) {
        return compare(plus, minus);
    }
    if let (Some(fast), Some(slow)) = (features.get(keys::EMA_FAST), features.get(keys::EMA_SLOW)) {
        return compare(fast, slow);
    }
    if let Some(slow) = features.get(keys::EMA_SLOW) {
        return compare(features.close, slow);
    }
    DirectionBias::Neutral
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar() -> FeatureVector {
        FeatureVector::new(
            "BTCUSDT",
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            100.0,
            101.0,
            99.0,
            100.5,
            1_000.0,
        )
    }

    #[test]
    fn trending_up_with_bullish_di() {
        let fv = bar()
            .with(keys::ADX, 32.0)
            .with(keys::PLUS_DI, 28.0)
            .with(keys::MINUS_DI, 12.0);
        let state = RegimeEngine::default().classify(&fv);
        assert_eq!(state.regime_type, RegimeType::TrendUp);
        assert_eq!(state.direction, DirectionBias::Bullish);
        assert!(state.confidence > 0.5);
    }

    #[test]
    fn trending_down_from_ema_ordering() {
        let fv = bar()
            .with(keys::ADX, 30.0)
            .with(keys::EMA_FAST, 95.0)
            .with(keys::EMA_SLOW, 99.0);
        let state = RegimeEngine::default().classify(&fv);
        assert_eq!(state.regime_type, RegimeType::TrendDown);
    }

    #[test]
    fn weak_adx_is_range() {
        let fv = bar().with(keys::ADX, 14.0).with(keys::PLUS_DI, 30.0).with(keys::MINUS_DI, 10.0);
        assert_eq!(RegimeEngine::default().classify(&fv).regime_type, RegimeType::Range);
    }

    #[test]
    fn extreme_atr_percentile_is_volatile() {
        let fv = bar().with(keys::ADX, 35.0).with(keys::ATR_PERCENTILE, 96.0);
        let state = RegimeEngine::default().classify(&fv);
        assert_eq!(state.regime_type, RegimeType::Volatile);
        assert_eq!(state.volatility, VolatilityLevel::Extreme);
    }

    #[test]
    fn missing_adx_is_unknown() {
        let state = RegimeEngine::default().classify(&bar());
        assert_eq!(state.regime_type, RegimeType::Unknown);
        assert_eq!(state.confidence, 0.0);
    }

    #[test]
    fn classification_is_deterministic() {
        let fv = bar().with(keys::ADX, 27.0).with(keys::PLUS_DI, 20.0).with(keys::MINUS_DI, 18.0);
        let engine = RegimeEngine::default();
        assert_eq!(engine.classify(&fv), engine.classify(&fv));
    }

    #[test]
    fn change_detection() {
        let a = RegimeState {
            regime_type: RegimeType::TrendUp,
            direction: DirectionBias::Bullish,
            volatility: VolatilityLevel::Normal,
            confidence: 0.7,
        };
        let b = RegimeState {
            regime_type: RegimeType::Range,
            ..a
        };
        let change = detect_regime_change(&b, &a);
        assert!(change.type_changed);
        assert!(!change.direction_changed);
        assert!(!detect_regime_change(&a, &a).any());
    }

    #[test]
    fn validate_rejects_zero_confirm_bars() {
        let cfg = RegimeConfig {
            confirm_bars: 0,
            ..RegimeConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
