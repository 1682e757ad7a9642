//! Order intents - what the decision core asks the execution layer to do.
//!
//! The core never places orders itself. Intents are handed to observers and
//! owned by the caller from the moment they are emitted.

use super::position::{PositionState, Side};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Order side that opens a position in `side`.
    pub fn opening(side: Side) -> Self {
        match side {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that closes a position in `side`.
    pub fn closing(side: Side) -> Self {
        Self::opening(side.opposite())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    #[default]
    Market,
    Limit,
    Stop,
}

/// Why the intent was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentPurpose {
    Entry,
    Exit,
    ModifyStop,
    CancelEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity_hint: f64,
    pub order_type: OrderType,
    pub reference_price: f64,
    pub purpose: IntentPurpose,
    /// Protective stop attached to an entry, or the new stop for a modification.
    pub stop_price: Option<f64>,
    pub take_profit: Option<f64>,
    pub leverage: Option<f64>,
}

impl OrderIntent {
    #[allow(clippy::too_many_arguments)]
    pub fn entry(
        symbol: impl Into<String>,
        side: Side,
        quantity_hint: f64,
        order_type: OrderType,
        reference_price: f64,
        stop_price: f64,
        take_profit: Option<f64>,
        leverage: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::opening(side),
            quantity_hint,
            order_type,
            reference_price,
            purpose: IntentPurpose::Entry,
            stop_price: Some(stop_price),
            take_profit,
            leverage: Some(leverage),
        }
    }

    /// Market close of the full position.
    pub fn exit(position: &PositionState, reference_price: f64) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: OrderSide::closing(position.side),
            quantity_hint: position.quantity,
            order_type: OrderType::Market,
            reference_price,
            purpose: IntentPurpose::Exit,
            stop_price: None,
            take_profit: None,
            leverage: None,
        }
    }

    /// Replace the resting protective stop.
    pub fn modify_stop(position: &PositionState) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: OrderSide::closing(position.side),
            quantity_hint: position.quantity,
            order_type: OrderType::Stop,
            reference_price: position.last_price,
            purpose: IntentPurpose::ModifyStop,
            stop_price: Some(position.stop_price()),
            take_profit: position.take_profit,
            leverage: None,
        }
    }

    /// Withdraw an unfilled entry order.
    pub fn cancel_entry(symbol: impl Into<String>, side: Side, reference_price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side: OrderSide::opening(side),
            quantity_hint: 0.0,
            order_type: OrderType::Market,
            reference_price,
            purpose: IntentPurpose::CancelEntry,
            stop_price: None,
            take_profit: None,
            leverage: None,
        }
    }
}
