//! One-way notifications from the bot to UI, logging and execution layers.
//!
//! Observers are called synchronously at the end of each step; their return
//! values are never consulted.

use crate::domain::{BotDecision, OrderIntent, Signal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::Level;

pub trait BotObserver: Send {
    fn on_signal(&mut self, _signal: &Signal) {}
    fn on_decision(&mut self, _decision: &BotDecision) {}
    fn on_order_intent(&mut self, _intent: &OrderIntent) {}
    fn on_log(&mut self, _level: Level, _message: &str) {}
    fn on_trading_blocked(&mut self, _reason: &str) {}
}

/// Everything an observer can be told, as data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BotEvent {
    Signal(Signal),
    Decision(BotDecision),
    OrderIntent(OrderIntent),
    Log { level: String, message: String },
    TradingBlocked { reason: String },
}

/// Observer that records every event into a shared buffer.
///
/// Clones share the buffer, so one clone can be handed to the bot while
/// another is kept for inspection.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<BotEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BotEvent> {
        self.events.lock().clone()
    }

    pub fn drain(&self) -> Vec<BotEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn push(&self, event: BotEvent) {
        self.events.lock().push(event);
    }
}

impl BotObserver for EventLog {
    fn on_signal(&mut self, signal: &Signal) {
        self.push(BotEvent::Signal(signal.clone()));
    }

    fn on_decision(&mut self, decision: &BotDecision) {
        self.push(BotEvent::Decision(decision.clone()));
    }

    fn on_order_intent(&mut self, intent: &OrderIntent) {
        self.push(BotEvent::OrderIntent(intent.clone()));
    }

    fn on_log(&mut self, level: Level, message: &str) {
        self.push(BotEvent::Log {
            level: level.to_string(),
            message: message.to_string(),
        });
    }

    fn on_trading_blocked(&mut self, reason: &str) {
        self.push(BotEvent::TradingBlocked {
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;
    impl BotObserver for Silent {}

    #[test]
    fn default_methods_are_no_ops() {
        let mut s = Silent;
        s.on_log(Level::INFO, "ignored");
        s.on_trading_blocked("ignored");
    }

    #[test]
    fn clones_share_buffer() {
        let log = EventLog::new();
        let mut handed_out: Box<dyn BotObserver> = Box::new(log.clone());
        handed_out.on_trading_blocked("gate: low_liquidity");
        handed_out.on_log(Level::WARN, "rule error");
        assert_eq!(log.len(), 2);
        assert!(matches!(&log.events()[0], BotEvent::TradingBlocked { reason } if reason == "gate: low_liquidity"));
        assert_eq!(log.drain().len(), 2);
        assert!(log.is_empty());
    }
}
