//! Per-rule counters, kept for the whole session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleStats {
    pub evaluations: u64,
    pub matches: u64,
    pub errors: u64,
    /// Cumulative evaluation time in nanoseconds.
    pub eval_nanos: u64,
}

impl RuleStats {
    pub(crate) fn record(&mut self, matched: bool, errored: bool, elapsed: Duration) {
        self.evaluations += 1;
        if matched {
            self.matches += 1;
        }
        if errored {
            self.errors += 1;
        }
        self.eval_nanos = self
            .eval_nanos
            .saturating_add(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Fold another session's counters into this one.
    pub fn merge(&mut self, other: &RuleStats) {
        self.evaluations += other.evaluations;
        self.matches += other.matches;
        self.errors += other.errors;
        self.eval_nanos = self.eval_nanos.saturating_add(other.eval_nanos);
    }

    pub fn match_rate(&self) -> f64 {
        if self.evaluations == 0 {
            0.0
        } else {
            self.matches as f64 / self.evaluations as f64
        }
    }

    pub fn mean_eval_micros(&self) -> f64 {
        if self.evaluations == 0 {
            0.0
        } else {
            self.eval_nanos as f64 / self.evaluations as f64 / 1_000.0
        }
    }
}

/// Serializable snapshot of all rule counters, keyed by rule id.
pub type StatsSnapshot = BTreeMap<String, RuleStats>;

/// Rules ordered by match count (descending), ties broken by id.
pub fn most_triggered(stats: &StatsSnapshot, n: usize) -> Vec<(String, RuleStats)> {
    let mut rows: Vec<(String, RuleStats)> = stats
        .iter()
        .filter(|(_, s)| s.matches > 0)
        .map(|(id, s)| (id.clone(), *s))
        .collect();
    rows.sort_by(|a, b| b.1.matches.cmp(&a.1.matches).then_with(|| a.0.cmp(&b.0)));
    rows.truncate(n);
    rows
}
