//! RuleLab Core - the trading decision core.
//!
//! Turns a stream of per-bar [`FeatureVector`](domain::FeatureVector)s into
//! position lifecycle transitions and order intents:
//! - Regime classification with anti-flap hysteresis
//! - Weighted entry scoring and prioritized exit checks
//! - Trailing stops behind a never-loosen ratchet
//! - An embedded expression language and declarative rule packs
//! - Leverage bounds that keep liquidation beyond the stop
//! - A lifecycle state machine owned by one controller per symbol
//!
//! Indicator calculation, market data, order execution and presentation
//! live outside this crate.

pub mod bot;
pub mod config;
pub mod domain;
pub mod leverage;
pub mod machine;
pub mod regime;
pub mod rulepack;
pub mod rules;
pub mod scoring;
pub mod trailing;

pub use bot::{BotError, BotObserver, BotSnapshot, TradingBot};
pub use config::{BotConfig, ConfigError};
pub use machine::{BotState, BotStateMachine, TransitionError, Trigger};
