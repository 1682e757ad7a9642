//! Position state - the single open position a bot instance manages.

use crate::trailing::{StopUpdate, TrailingState};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Direction of a position or entry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for long, -1.0 for short.
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }

    /// Parse "long"/"buy" or "short"/"sell" (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Side::Long),
            "short" | "sell" => Some(Side::Short),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open position.
///
/// Created on a fill, destroyed on exit. The stop price lives inside the
/// owned [`TrailingState`] and can only be changed through the ratchet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub take_profit: Option<f64>,
    pub leverage: f64,

    // ── Lifecycle ──
    pub entry_bar: u64,
    pub bars_held: u64,

    // ── Mark-to-market ──
    pub last_price: f64,
    pub unrealized_pnl: f64,
    /// Best price seen since entry (highest for longs, lowest for shorts).
    pub max_favorable_price: f64,

    trailing: TrailingState,
}

impl PositionState {
    pub fn open(
        symbol: impl Into<String>,
        side: Side,
        entry_price: f64,
        quantity: f64,
        stop_price: f64,
        take_profit: Option<f64>,
        entry_bar: u64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            entry_price,
            quantity,
            take_profit,
            leverage: 1.0,
            entry_bar,
            bars_held: 0,
            last_price: entry_price,
            unrealized_pnl: 0.0,
            max_favorable_price: entry_price,
            trailing: TrailingState::new(stop_price),
        }
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = leverage;
        self
    }

    pub fn stop_price(&self) -> f64 {
        self.trailing.current_stop()
    }

    pub fn trailing(&self) -> &TrailingState {
        &self.trailing
    }

    pub fn is_long(&self) -> bool {
        self.side == Side::Long
    }

    /// Update the mark price, unrealized P&L and favorable excursion.
    pub fn mark(&mut self, price: f64) {
        if !price.is_finite() {
            return;
        }
        self.last_price = price;
        self.unrealized_pnl = self.side.sign() * (price - self.entry_price) * self.quantity;
        self.max_favorable_price = match self.side {
            Side::Long => self.max_favorable_price.max(price),
            Side::Short => self.max_favorable_price.min(price),
        };
    }

    /// Count one more bar in the position.
    pub fn tick_bar(&mut self) {
        self.bars_held += 1;
    }

    /// Favorable move since entry, in percent (negative when underwater).
    pub fn favorable_move_pct(&self, price: f64) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        self.side.sign() * (price - self.entry_price) / self.entry_price * 100.0
    }

    /// Unrealized return on entry notional, in percent.
    pub fn unrealized_pct(&self) -> f64 {
        self.favorable_move_pct(self.last_price)
    }

    pub(crate) fn arm_trailing(&mut self) {
        self.trailing.activate();
    }

    /// The only mutation path for the stop price. Clamped loosenings are
    /// logged for audit.
    pub(crate) fn apply_stop_candidate(&mut self, candidate: f64, bar: u64) -> StopUpdate {
        let update = self.trailing.tighten(self.side, candidate, bar);
        if update.clamped() {
            warn!(
                symbol = %self.symbol,
                side = %self.side,
                stop = update.effective,
                candidate,
                bar,
                "stop loosening clamped"
            );
        }
        update
    }
}
