//! Anti-flap hysteresis around the stateless regime classifier.
//!
//! A candidate regime must be classified `confirm_bars` times in a row before
//! it becomes active. Any dissenting bar resets the count. After a change,
//! `cooldown_bars` bars block further changes, and an accepted regime must
//! have lasted `min_segment_bars` before another flip is considered.

use super::{RegimeConfig, RegimeEngine, RegimeState, RegimeType};
use crate::domain::FeatureVector;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Result of feeding one bar to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeUpdate {
    /// What the stateless classifier said for this bar.
    pub raw: RegimeState,
    /// The regime in force after this bar.
    pub active: RegimeState,
    /// True only on the bar a new regime type was accepted.
    pub changed: bool,
    pub previous: RegimeType,
}

/// Hysteresis counters of a [`RegimeTracker`], for suspending a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub active: RegimeState,
    pub candidate: Option<RegimeType>,
    pub candidate_count: usize,
    pub cooldown_remaining: usize,
    pub segment_bars: usize,
    pub has_accepted: bool,
}

#[derive(Debug, Clone)]
pub struct RegimeTracker {
    engine: RegimeEngine,
    active: RegimeState,
    candidate: Option<RegimeType>,
    candidate_count: usize,
    cooldown_remaining: usize,
    segment_bars: usize,
    has_accepted: bool,
}

impl RegimeTracker {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            engine: RegimeEngine::new(config),
            active: RegimeState::unknown(),
            candidate: None,
            candidate_count: 0,
            cooldown_remaining: 0,
            segment_bars: 0,
            has_accepted: false,
        }
    }

    pub fn engine(&self) -> &RegimeEngine {
        &self.engine
    }

    pub fn active(&self) -> &RegimeState {
        &self.active
    }

    /// Pending candidate and its consecutive count, if any.
    pub fn candidate(&self) -> Option<(RegimeType, usize)> {
        self.candidate.map(|c| (c, self.candidate_count))
    }

    /// Classify `features` and feed the result through the hysteresis.
    pub fn update(&mut self, features: &FeatureVector) -> RegimeUpdate {
        let raw = self.engine.classify(features);
        self.observe(raw)
    }

    /// Feed an already-classified state.
    pub fn observe(&mut self, raw: RegimeState) -> RegimeUpdate {
        let config = self.engine.config();
        let previous = self.active.regime_type;
        self.segment_bars += 1;

        let changed = if raw.regime_type == self.active.regime_type {
            // Same label: refresh direction/confidence, drop any candidate.
            self.candidate = None;
            self.candidate_count = 0;
            self.active = raw;
            false
        } else {
            if self.candidate == Some(raw.regime_type) {
                self.candidate_count += 1;
            } else {
                self.candidate = Some(raw.regime_type);
                self.candidate_count = 1;
            }

            let confirmed = self.candidate_count >= config.confirm_bars;
            let cooled = self.cooldown_remaining == 0;
            let segment_done = !self.has_accepted || self.segment_bars >= config.min_segment_bars;

            if confirmed && cooled && segment_done {
                info!(
                    from = %previous,
                    to = %raw.regime_type,
                    confirmations = self.candidate_count,
                    "regime change accepted"
                );
                self.active = raw;
                self.candidate = None;
                self.candidate_count = 0;
                self.cooldown_remaining = config.cooldown_bars;
                self.segment_bars = 0;
                self.has_accepted = true;
                return RegimeUpdate {
                    raw,
                    active: self.active,
                    changed: true,
                    previous,
                };
            }
            false
        };

        self.cooldown_remaining = self.cooldown_remaining.saturating_sub(1);

        RegimeUpdate {
            raw,
            active: self.active,
            changed,
            previous,
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            active: self.active,
            candidate: self.candidate,
            candidate_count: self.candidate_count,
            cooldown_remaining: self.cooldown_remaining,
            segment_bars: self.segment_bars,
            has_accepted: self.has_accepted,
        }
    }

    /// Continue from `snapshot`. The classifier config is kept.
    pub fn restore(&mut self, snapshot: TrackerSnapshot) {
        self.active = snapshot.active;
        self.candidate = snapshot.candidate;
        self.candidate_count = snapshot.candidate_count;
        self.cooldown_remaining = snapshot.cooldown_remaining;
        self.segment_bars = snapshot.segment_bars;
        self.has_accepted = snapshot.has_accepted;
    }
}
