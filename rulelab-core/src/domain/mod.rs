//! Domain types: feature snapshots, positions, signals, intents, decisions.

pub mod decision;
pub mod features;
pub mod intent;
pub mod position;
pub mod signal;

pub use decision::{BotDecision, DecisionAction, ExitReason};
pub use features::{keys, FeatureHash, FeatureVector};
pub use intent::{IntentPurpose, OrderIntent, OrderSide, OrderType};
pub use position::{PositionState, Side};
pub use signal::{Signal, SignalId, SignalSource};
