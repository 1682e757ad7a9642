//! Monotonic stop enforcement.
//!
//! **Core rule:** stops may tighten, never loosen. Every candidate stop, from
//! the trailing manager or from a trailing rule pack, passes through
//! [`enforce_monotonic_stop`] before it reaches a position.

use crate::domain::Side;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The single authoritative stop gate.
///
/// - Long positions: effective stop = `max(current, candidate)`
/// - Short positions: effective stop = `min(current, candidate)`
///
/// Non-finite candidates are ignored and the current stop is kept.
///
/// # Example
/// ```
/// use rulelab_core::domain::Side;
/// use rulelab_core::trailing::enforce_monotonic_stop;
///
/// // Tightening: 95 -> 100 (allowed)
/// assert_eq!(enforce_monotonic_stop(Side::Long, 95.0, 100.0), 100.0);
/// // Loosening: 98 -> 95 (blocked)
/// assert_eq!(enforce_monotonic_stop(Side::Long, 98.0, 95.0), 98.0);
/// ```
pub fn enforce_monotonic_stop(side: Side, current: f64, candidate: f64) -> f64 {
    if !candidate.is_finite() {
        debug!(?side, current, candidate, "ignoring non-finite stop candidate");
        return current;
    }
    if !current.is_finite() {
        return candidate;
    }
    let effective = match side {
        Side::Long => current.max(candidate),
        Side::Short => current.min(candidate),
    };
    effective
}

/// Outcome of routing one candidate through the ratchet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopUpdate {
    pub previous: f64,
    pub candidate: f64,
    pub effective: f64,
}

impl StopUpdate {
    /// True when the stop actually moved.
    pub fn moved(&self) -> bool {
        self.effective != self.previous
    }

    /// True when the candidate would have loosened the stop and was clamped.
    pub fn clamped(&self) -> bool {
        self.effective != self.candidate
    }
}

/// Trailing state owned by a position: current stop, last update bar, activation flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingState {
    current_stop: f64,
    last_update_bar: Option<u64>,
    activated: bool,
}

impl TrailingState {
    /// Trailing state seeded with the initial protective stop.
    pub fn new(initial_stop: f64) -> Self {
        Self {
            current_stop: initial_stop,
            last_update_bar: None,
            activated: false,
        }
    }

    pub fn current_stop(&self) -> f64 {
        self.current_stop
    }

    pub fn last_update_bar(&self) -> Option<u64> {
        self.last_update_bar
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Arm trailing. Once armed it stays armed for the life of the position.
    pub(crate) fn activate(&mut self) {
        self.activated = true;
    }

    /// Route a candidate through the ratchet and record the bar if the stop moved.
    pub(crate) fn tighten(&mut self, side: Side, candidate: f64, bar: u64) -> StopUpdate {
        let previous = self.current_stop;
        let effective = enforce_monotonic_stop(side, previous, candidate);
        if effective != previous {
            self.current_stop = effective;
            self.last_update_bar = Some(bar);
        }
        StopUpdate {
            previous,
            candidate,
            effective,
        }
    }
}
