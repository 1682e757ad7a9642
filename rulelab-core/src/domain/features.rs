//! FeatureVector - the immutable per-bar snapshot consumed by the decision core.
//!
//! Indicator computation happens upstream. The core only reads values by name,
//! treating NaN as missing, and never mutates a vector once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Well-known indicator names read by the regime engine, scorer and trailing manager.
///
/// Feature providers may publish any additional names; rule expressions can
/// reference them as `features.<name>`.
pub mod keys {
    pub const EMA_FAST: &str = "ema_fast";
    pub const EMA_SLOW: &str = "ema_slow";
    pub const ADX: &str = "adx";
    pub const PLUS_DI: &str = "plus_di";
    pub const MINUS_DI: &str = "minus_di";
    pub const RSI: &str = "rsi";
    pub const MACD_HIST: &str = "macd_hist";
    pub const ATR: &str = "atr";
    /// ATR rank over a trailing window, 0..=100.
    pub const ATR_PERCENTILE: &str = "atr_percentile";
    pub const VOLUME_AVG: &str = "volume_avg";
    pub const HIGHEST: &str = "highest";
    pub const LOWEST: &str = "lowest";
}

/// Content hash of a feature vector (BLAKE3, hex encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureHash(pub String);

impl fmt::Display for FeatureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable per-bar market snapshot: OHLCV plus named indicators.
///
/// `BTreeMap` keeps indicator iteration order deterministic, which the
/// content hash and the rule context both rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
}

impl FeatureVector {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            indicators: BTreeMap::new(),
        }
    }

    /// Builder-style indicator insertion, used when assembling a vector.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(name.into(), value);
        self
    }

    /// Indicator value by name. NaN and infinite values read as missing.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.indicators
            .get(name)
            .copied()
            .filter(|v| v.is_finite())
    }

    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// OHLC sanity: high >= low, high/low bracket open and close, prices positive.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }

    /// Stable content hash for audit and reproducibility.
    ///
    /// Fields are fed to the hasher in a fixed order with explicit separators;
    /// floats are hashed by their bit pattern so identical vectors always agree.
    pub fn content_hash(&self) -> FeatureHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.symbol.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update(&[0]);
        for v in [self.open, self.high, self.low, self.close, self.volume] {
            hasher.update(&v.to_bits().to_le_bytes());
        }
        for (name, value) in &self.indicators {
            hasher.update(name.as_bytes());
            hasher.update(&[0]);
            hasher.update(&value.to_bits().to_le_bytes());
        }
        FeatureHash(hasher.finalize().to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> FeatureVector {
        FeatureVector::new(
            "BTCUSDT",
            Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap(),
            100.0,
            105.0,
            98.0,
            103.0,
            5_000.0,
        )
        .with(keys::ADX, 27.5)
        .with(keys::RSI, 61.0)
    }

    #[test]
    fn sane_bar() {
        assert!(sample().is_sane());
    }

    #[test]
    fn detects_inverted_high_low() {
        let mut fv = sample();
        fv.high = 97.0;
        assert!(!fv.is_sane());
    }

    #[test]
    fn nan_indicator_reads_as_missing() {
        let fv = sample().with("macd_hist", f64::NAN);
        assert_eq!(fv.get("macd_hist"), None);
        assert_eq!(fv.get(keys::ADX), Some(27.5));
        assert_eq!(fv.get("nonexistent"), None);
    }

    #[test]
    fn hash_is_stable_and_content_sensitive() {
        let a = sample();
        let b = sample();
        assert_eq!(a.content_hash(), b.content_hash());

        let c = sample().with(keys::RSI, 61.5);
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn hash_survives_serde_roundtrip() {
        let fv = sample();
        let json = serde_json::to_string(&fv).unwrap();
        let back: FeatureVector = serde_json::from_str(&json).unwrap();
        assert_eq!(fv.content_hash(), back.content_hash());
    }
}
