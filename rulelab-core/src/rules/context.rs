//! Evaluation context - a flat, namespaced map of values.
//!
//! Namespaces: `features.*` (indicators plus OHLCV), `bar.*` (OHLCV and
//! metadata), `trade.*` (open position), `regime.*` and `config.*`.

use super::value::Value;
use crate::domain::{FeatureVector, PositionState};
use crate::regime::RegimeState;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleContext {
    values: BTreeMap<String, Value>,
}

impl RuleContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Assembles a [`RuleContext`] from the core's domain types.
#[derive(Debug, Default)]
pub struct RuleContextBuilder {
    ctx: RuleContext,
}

impl RuleContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn features(mut self, f: &FeatureVector) -> Self {
        let c = &mut self.ctx;
        for (name, value) in &f.indicators {
            c.insert(format!("features.{name}"), *value);
        }
        for (name, value) in [
            ("open", f.open),
            ("high", f.high),
            ("low", f.low),
            ("close", f.close),
            ("volume", f.volume),
        ] {
            c.insert(format!("features.{name}"), value);
            c.insert(format!("bar.{name}"), value);
        }
        c.insert("bar.symbol", f.symbol.as_str());
        c.insert("bar.timestamp", f.timestamp.timestamp() as f64);
        self
    }

    /// Position fields. `trade.is_open` is always present.
    pub fn position(mut self, position: Option<&PositionState>) -> Self {
        let c = &mut self.ctx;
        let Some(p) = position else {
            c.insert("trade.is_open", false);
            return self;
        };
        c.insert("trade.is_open", true);
        c.insert("trade.side", p.side.as_str());
        c.insert("trade.entry_price", p.entry_price);
        c.insert("trade.quantity", p.quantity);
        c.insert("trade.stop_price", p.stop_price());
        c.insert("trade.take_profit", p.take_profit);
        c.insert("trade.leverage", p.leverage);
        c.insert("trade.bars_held", p.bars_held as f64);
        c.insert("trade.last_price", p.last_price);
        c.insert("trade.unrealized_pnl", p.unrealized_pnl);
        c.insert("trade.unrealized_pct", p.unrealized_pct());
        c.insert("trade.max_favorable_price", p.max_favorable_price);
        c.insert("trade.trailing_active", p.trailing().is_activated());
        self
    }

    pub fn regime(mut self, regime: &RegimeState) -> Self {
        let c = &mut self.ctx;
        c.insert("regime.type", regime.regime_type.as_str());
        c.insert("regime.direction", regime.direction.as_str());
        c.insert("regime.volatility", regime.volatility.as_str());
        c.insert("regime.confidence", regime.confidence);
        c.insert("regime.is_trending", regime.regime_type.is_trending());
        self
    }

    /// Static configuration values, exposed as `config.<key>`.
    pub fn config<'a>(mut self, values: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        for (key, value) in values {
            self.ctx.insert(format!("config.{key}"), value);
        }
        self
    }

    /// Raw variable, inserted under the exact name given.
    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ctx.insert(name, value);
        self
    }

    pub fn build(self) -> RuleContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{keys, Side};
    use chrono::{TimeZone, Utc};

    fn bar() -> FeatureVector {
        FeatureVector::new(
            "BTCUSDT",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            100.0,
            106.0,
            99.0,
            105.0,
            2_000.0,
        )
        .with(keys::RSI, 64.0)
        .with("highest_20", 100.0)
    }

    #[test]
    fn features_and_bar_namespaces() {
        let ctx = RuleContextBuilder::new().features(&bar()).build();
        assert_eq!(ctx.get("features.close"), Some(&Value::Number(105.0)));
        assert_eq!(ctx.get("bar.close"), Some(&Value::Number(105.0)));
        assert_eq!(ctx.get("features.highest_20"), Some(&Value::Number(100.0)));
        assert_eq!(ctx.get("bar.symbol"), Some(&Value::String("BTCUSDT".into())));
    }

    #[test]
    fn flat_position_only_sets_is_open() {
        let ctx = RuleContextBuilder::new().position(None).build();
        assert_eq!(ctx.get("trade.is_open"), Some(&Value::Bool(false)));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn open_position_fields() {
        let pos = PositionState::open("BTCUSDT", Side::Short, 100.0, 1.0, 103.0, None, 0);
        let ctx = RuleContextBuilder::new().position(Some(&pos)).build();
        assert_eq!(ctx.get("trade.side"), Some(&Value::String("short".into())));
        assert_eq!(ctx.get("trade.stop_price"), Some(&Value::Number(103.0)));
        assert_eq!(ctx.get("trade.take_profit"), Some(&Value::Null));
    }

    #[test]
    fn regime_and_config() {
        let ctx = RuleContextBuilder::new()
            .regime(&RegimeState::unknown())
            .config([("threshold", Value::Number(0.7))])
            .build();
        assert_eq!(ctx.get("regime.type"), Some(&Value::String("UNKNOWN".into())));
        assert_eq!(ctx.get("config.threshold"), Some(&Value::Number(0.7)));
    }
}
