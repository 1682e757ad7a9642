//! Trailing stop manager - proposes tighter stops for an open position.
//!
//! A candidate is computed from the best price since entry minus an ATR
//! multiple or a fixed percentage. An update is reported only when the
//! position has moved far enough in its favor, the cooldown since the last
//! update has elapsed, and the improvement clears the minimum step. Every
//! candidate still goes through [`enforce_monotonic_stop`].

pub mod ratchet;

pub use ratchet::{enforce_monotonic_stop, StopUpdate, TrailingState};

use crate::config::ConfigError;
use crate::domain::{keys, FeatureVector, PositionState, Side};
use crate::regime::{RegimeState, RegimeType};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the trailing distance is measured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrailingMode {
    /// Distance = `multiple * ATR`.
    Atr { multiple: f64 },
    /// Distance = `distance_pct` percent of the anchor price.
    Percent { distance_pct: f64 },
}

impl Default for TrailingMode {
    fn default() -> Self {
        TrailingMode::Atr { multiple: 2.0 }
    }
}

/// Percentages are in percent units (1.0 = 1%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub mode: TrailingMode,
    /// Favorable move from entry required before trailing arms.
    pub activation_pct: f64,
    /// Minimum improvement over the current stop, relative to price.
    pub min_step_pct: f64,
    pub update_cooldown_bars: u64,
    /// Widens the distance while the regime is volatile.
    pub volatile_distance_mult: Option<f64>,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            mode: TrailingMode::default(),
            activation_pct: 1.0,
            min_step_pct: 0.2,
            update_cooldown_bars: 1,
            volatile_distance_mult: None,
        }
    }
}

impl TrailingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            TrailingMode::Atr { multiple } if !(multiple > 0.0) => {
                return Err(ConfigError::invalid("trailing.mode.multiple", "must be > 0"));
            }
            TrailingMode::Percent { distance_pct } if !(distance_pct > 0.0 && distance_pct < 100.0) => {
                return Err(ConfigError::invalid(
                    "trailing.mode.distance_pct",
                    "must be within (0, 100)",
                ));
            }
            _ => {}
        }
        if !(self.activation_pct >= 0.0) {
            return Err(ConfigError::invalid("trailing.activation_pct", "must be >= 0"));
        }
        if !(self.min_step_pct >= 0.0) {
            return Err(ConfigError::invalid("trailing.min_step_pct", "must be >= 0"));
        }
        if let Some(m) = self.volatile_distance_mult {
            if !(m >= 1.0) {
                return Err(ConfigError::invalid(
                    "trailing.volatile_distance_mult",
                    "must be >= 1",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingReason {
    NotActivated,
    Cooldown,
    MissingAtr,
    /// Candidate would loosen or not move the stop.
    Loosening,
    StepTooSmall,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopResult {
    pub updated: bool,
    /// Stop in force after this bar if the result is applied.
    pub new_stop: f64,
    pub candidate: Option<f64>,
    /// Trailing is armed (already, or by this bar's favorable move).
    pub activated: bool,
    pub reason: TrailingReason,
}

#[derive(Debug, Clone, Default)]
pub struct TrailingStopManager {
    config: TrailingConfig,
}

impl TrailingStopManager {
    pub fn new(config: TrailingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrailingConfig {
        &self.config
    }

    /// Evaluate trailing for one bar. Pure: the position is not touched.
    pub fn calculate_trailing_stop(
        &self,
        features: &FeatureVector,
        position: &PositionState,
        regime: &RegimeState,
        current_bar: u64,
    ) -> TrailingStopResult {
        let current = position.stop_price();
        let side = position.side;
        let state = position.trailing();
        let activated = state.is_activated()
            || position.favorable_move_pct(features.close) >= self.config.activation_pct;

        let hold = |reason: TrailingReason, candidate: Option<f64>| TrailingStopResult {
            updated: false,
            new_stop: current,
            candidate,
            activated,
            reason,
        };

        if !activated {
            return hold(TrailingReason::NotActivated, None);
        }
        if let Some(last) = state.last_update_bar() {
            if current_bar.saturating_sub(last) < self.config.update_cooldown_bars {
                return hold(TrailingReason::Cooldown, None);
            }
        }

        let anchor = match side {
            Side::Long => position.max_favorable_price.max(features.high),
            Side::Short => position.max_favorable_price.min(features.low),
        };
        let Some(mut distance) = self.distance(features, anchor) else {
            return hold(TrailingReason::MissingAtr, None);
        };
        if regime.regime_type == RegimeType::Volatile {
            if let Some(m) = self.config.volatile_distance_mult {
                distance *= m;
            }
        }

        let candidate = anchor - side.sign() * distance;
        let improvement = side.sign() * (candidate - current);
        if !(improvement > 0.0) {
            debug!(
                symbol = %position.symbol,
                current,
                candidate,
                "trailing candidate would loosen stop"
            );
            return hold(TrailingReason::Loosening, Some(candidate));
        }
        if features.close > 0.0 && improvement / features.close * 100.0 < self.config.min_step_pct {
            return hold(TrailingReason::StepTooSmall, Some(candidate));
        }

        TrailingStopResult {
            updated: true,
            new_stop: enforce_monotonic_stop(side, current, candidate),
            candidate: Some(candidate),
            activated,
            reason: TrailingReason::Updated,
        }
    }

    /// Apply a result to the position: arm trailing and ratchet the stop.
    pub(crate) fn apply(
        position: &mut PositionState,
        result: &TrailingStopResult,
        bar: u64,
    ) -> Option<StopUpdate> {
        if result.activated {
            position.arm_trailing();
        }
        if !result.updated {
            return None;
        }
        let update = position.apply_stop_candidate(result.new_stop, bar);
        update.moved().then_some(update)
    }

    fn distance(&self, features: &FeatureVector, anchor: f64) -> Option<f64> {
        match self.config.mode {
            TrailingMode::Atr { multiple } => features
                .get(keys::ATR)
                .filter(|a| *a > 0.0)
                .map(|a| a * multiple),
            TrailingMode::Percent { distance_pct } => Some(anchor * distance_pct / 100.0),
        }
    }
}
