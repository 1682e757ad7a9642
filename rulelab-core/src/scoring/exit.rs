//! Exit signal checker - fixed-priority exit reasons for an open position.
//!
//! Priority: stop loss, take profit, time stop, momentum reversal, regime
//! reversal. The first reason that fires wins; later checks are skipped.
//! The checker also derives the initial protective levels for a new entry.

use crate::config::ConfigError;
use crate::domain::{keys, ExitReason, FeatureVector, PositionState, Side};
use crate::regime::{RegimeState, RegimeType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Exit once `bars_held` exceeds this. `None` disables the time stop.
    pub max_bars_held: Option<u64>,
    pub rsi_extreme_high: f64,
    pub rsi_extreme_low: f64,
    pub momentum_exit: bool,
    pub regime_exit: bool,
    /// Opposite-trend regimes below this confidence are ignored.
    pub regime_exit_min_confidence: f64,

    // ── Initial protective levels ──
    pub initial_stop_atr_mult: f64,
    /// Stop distance in percent of entry, used when ATR is unavailable.
    pub initial_stop_pct: f64,
    /// Take-profit distance as a multiple of the stop distance. 0 disables it.
    pub reward_risk: f64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_bars_held: Some(48),
            rsi_extreme_high: 80.0,
            rsi_extreme_low: 20.0,
            momentum_exit: true,
            regime_exit: true,
            regime_exit_min_confidence: 0.6,
            initial_stop_atr_mult: 2.0,
            initial_stop_pct: 2.0,
            reward_risk: 2.0,
        }
    }
}

impl ExitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bars_held == Some(0) {
            return Err(ConfigError::invalid("exit.max_bars_held", "must be >= 1 when set"));
        }
        if !(self.rsi_extreme_low < self.rsi_extreme_high
            && self.rsi_extreme_low >= 0.0
            && self.rsi_extreme_high <= 100.0)
        {
            return Err(ConfigError::invalid(
                "exit.rsi_extreme_high",
                "rsi extremes must satisfy 0 <= low < high <= 100",
            ));
        }
        if !(0.0..=1.0).contains(&self.regime_exit_min_confidence) {
            return Err(ConfigError::invalid(
                "exit.regime_exit_min_confidence",
                "must be within [0, 1]",
            ));
        }
        if !(self.initial_stop_atr_mult > 0.0) {
            return Err(ConfigError::invalid("exit.initial_stop_atr_mult", "must be > 0"));
        }
        if !(self.initial_stop_pct > 0.0 && self.initial_stop_pct < 100.0) {
            return Err(ConfigError::invalid("exit.initial_stop_pct", "must be within (0, 100)"));
        }
        if !(self.reward_risk >= 0.0) {
            return Err(ConfigError::invalid("exit.reward_risk", "must be >= 0"));
        }
        Ok(())
    }
}

/// Stop and optional target attached to a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveLevels {
    pub stop: f64,
    pub take_profit: Option<f64>,
}

/// A triggered exit with the price it should be attributed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExitSignalChecker {
    config: ExitConfig,
}

impl ExitSignalChecker {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Initial stop and target for an entry at `price`.
    ///
    /// Uses `initial_stop_atr_mult * atr` when ATR is known, otherwise
    /// `initial_stop_pct` of the entry price.
    pub fn protective_levels(&self, side: Side, price: f64, atr: Option<f64>) -> ProtectiveLevels {
        let distance = match atr {
            Some(a) if a.is_finite() && a > 0.0 => a * self.config.initial_stop_atr_mult,
            _ => price * self.config.initial_stop_pct / 100.0,
        };
        let s = side.sign();
        let take_profit = if self.config.reward_risk > 0.0 {
            Some(price + s * distance * self.config.reward_risk)
        } else {
            None
        };
        ProtectiveLevels {
            stop: price - s * distance,
            take_profit,
        }
    }

    /// First exit reason that fires for `position` on this bar, if any.
    pub fn check(
        &self,
        features: &FeatureVector,
        regime: &RegimeState,
        position: &PositionState,
    ) -> Option<ExitSignal> {
        self.stop_hit(features, position)
            .or_else(|| self.target_hit(features, position))
            .or_else(|| self.time_stop(features, position))
            .or_else(|| self.momentum_reversal(features, position))
            .or_else(|| self.regime_reversal(features, regime, position))
    }

    /// Stop crossing only. Gaps through the stop fill at the open.
    pub fn stop_hit(&self, f: &FeatureVector, position: &PositionState) -> Option<ExitSignal> {
        let stop = position.stop_price();
        if !stop.is_finite() {
            return None;
        }
        let price = match position.side {
            Side::Long if f.low <= stop => f.open.min(stop),
            Side::Short if f.high >= stop => f.open.max(stop),
            _ => return None,
        };
        Some(ExitSignal {
            reason: ExitReason::StopLoss,
            price,
        })
    }

    fn target_hit(&self, f: &FeatureVector, position: &PositionState) -> Option<ExitSignal> {
        let tp = position.take_profit?;
        let price = match position.side {
            Side::Long if f.high >= tp => f.open.max(tp),
            Side::Short if f.low <= tp => f.open.min(tp),
            _ => return None,
        };
        Some(ExitSignal {
            reason: ExitReason::TakeProfit,
            price,
        })
    }

    fn time_stop(&self, f: &FeatureVector, position: &PositionState) -> Option<ExitSignal> {
        let max = self.config.max_bars_held?;
        (position.bars_held > max).then(|| ExitSignal {
            reason: ExitReason::TimeStop,
            price: f.close,
        })
    }

    /// RSI at the extreme in the position's favor while MACD histogram has
    /// turned against it (or is unavailable).
    fn momentum_reversal(&self, f: &FeatureVector, position: &PositionState) -> Option<ExitSignal> {
        if !self.config.momentum_exit {
            return None;
        }
        let rsi = f.get(keys::RSI)?;
        let hist_against = f
            .get(keys::MACD_HIST)
            .map_or(true, |h| position.side.sign() * h <= 0.0);
        let extreme = match position.side {
            Side::Long => rsi >= self.config.rsi_extreme_high,
            Side::Short => rsi <= self.config.rsi_extreme_low,
        };
        (extreme && hist_against).then(|| ExitSignal {
            reason: ExitReason::MomentumReversal,
            price: f.close,
        })
    }

    fn regime_reversal(
        &self,
        f: &FeatureVector,
        regime: &RegimeState,
        position: &PositionState,
    ) -> Option<ExitSignal> {
        if !self.config.regime_exit || regime.confidence < self.config.regime_exit_min_confidence {
            return None;
        }
        let against = match position.side {
            Side::Long => RegimeType::TrendDown,
            Side::Short => RegimeType::TrendUp,
        };
        (regime.regime_type == against).then(|| ExitSignal {
            reason: ExitReason::RegimeReversal,
            price: f.close,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::{DirectionBias, VolatilityLevel};
    use chrono::{TimeZone, Utc};

    fn bar(open: f64, high: f64, low: f64, close: f64) -> FeatureVector {
        FeatureVector::new(
            "BTCUSDT",
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            1_000.0,
        )
    }

    fn regime(t: RegimeType, confidence: f64) -> RegimeState {
        RegimeState {
            regime_type: t,
            direction: DirectionBias::Neutral,
            volatility: VolatilityLevel::Normal,
            confidence,
        }
    }

    fn long_position() -> PositionState {
        PositionState::open("BTCUSDT", Side::Long, 100.0, 1.0, 98.0, Some(106.0), 0)
    }

    #[test]
    fn long_stop_hit() {
        let checker = ExitSignalChecker::default();
        let exit = checker
            .check(&bar(99.0, 99.5, 97.5, 97.8), &RegimeState::unknown(), &long_position())
            .unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert_eq!(exit.price, 98.0);
    }

    #[test]
    fn gap_through_stop_fills_at_open() {
        let checker = ExitSignalChecker::default();
        let exit = checker
            .check(&bar(96.0, 96.5, 95.0, 96.2), &RegimeState::unknown(), &long_position())
            .unwrap();
        assert_eq!(exit.price, 96.0);
    }

    #[test]
    fn stop_beats_target_on_same_bar() {
        let checker = ExitSignalChecker::default();
        let exit = checker
            .check(&bar(100.0, 107.0, 97.0, 101.0), &RegimeState::unknown(), &long_position())
            .unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
    }

    #[test]
    fn short_take_profit() {
        let checker = ExitSignalChecker::default();
        let pos = PositionState::open("BTCUSDT", Side::Short, 100.0, 1.0, 103.0, Some(94.0), 0);
        let exit = checker
            .check(&bar(96.0, 97.0, 93.5, 94.5), &RegimeState::unknown(), &pos)
            .unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert_eq!(exit.price, 94.0);
    }

    #[test]
    fn time_stop_after_max_bars() {
        let checker = ExitSignalChecker::new(ExitConfig {
            max_bars_held: Some(3),
            ..ExitConfig::default()
        });
        let mut pos = long_position();
        pos.bars_held = 3;
        let quiet = bar(100.0, 101.0, 99.5, 100.5);
        assert!(checker.check(&quiet, &RegimeState::unknown(), &pos).is_none());
        pos.bars_held = 4;
        let exit = checker.check(&quiet, &RegimeState::unknown(), &pos).unwrap();
        assert_eq!(exit.reason, ExitReason::TimeStop);
    }

    #[test]
    fn momentum_reversal_needs_extreme_and_turn() {
        let checker = ExitSignalChecker::default();
        let pos = long_position();
        let still_rising = bar(102.0, 104.0, 101.5, 103.5)
            .with(keys::RSI, 84.0)
            .with(keys::MACD_HIST, 0.4);
        assert!(checker.check(&still_rising, &RegimeState::unknown(), &pos).is_none());

        let rolling_over = still_rising.with(keys::MACD_HIST, -0.1);
        let exit = checker.check(&rolling_over, &RegimeState::unknown(), &pos).unwrap();
        assert_eq!(exit.reason, ExitReason::MomentumReversal);
    }

    #[test]
    fn regime_reversal_respects_confidence() {
        let checker = ExitSignalChecker::default();
        let pos = long_position();
        let quiet = bar(100.0, 101.0, 99.5, 100.5);
        assert!(checker
            .check(&quiet, &regime(RegimeType::TrendDown, 0.4), &pos)
            .is_none());
        let exit = checker
            .check(&quiet, &regime(RegimeType::TrendDown, 0.8), &pos)
            .unwrap();
        assert_eq!(exit.reason, ExitReason::RegimeReversal);
    }

    #[test]
    fn protective_levels_from_atr_and_fallback() {
        let checker = ExitSignalChecker::default();
        let lv = checker.protective_levels(Side::Long, 100.0, Some(1.5));
        assert_eq!(lv.stop, 97.0);
        assert_eq!(lv.take_profit, Some(106.0));

        let lv = checker.protective_levels(Side::Short, 100.0, None);
        assert_eq!(lv.stop, 102.0);
        assert_eq!(lv.take_profit, Some(96.0));
    }

    #[test]
    fn validate_rejects_inverted_rsi_band() {
        let cfg = ExitConfig {
            rsi_extreme_low: 85.0,
            ..ExitConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
