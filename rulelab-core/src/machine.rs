//! Bot state machine - single owner of the position lifecycle.
//!
//! States: `FLAT → SIGNAL → WAITING_FILL → MANAGE → FLAT` on the happy path,
//! with `PAUSED` and `ERROR` reachable from every state.
//!
//! The machine owns the open [`PositionState`] (and through it the trailing
//! state) and the pending entry. Nothing else mutates them; every change goes
//! through a trigger or the stop ratchet. Every accepted transition is appended
//! to an audit history that is never truncated automatically.

use crate::domain::{PositionState, Side, SignalId};
use crate::trailing::{StopUpdate, TrailingStopManager, TrailingStopResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotState {
    Flat,
    Signal,
    WaitingFill,
    Manage,
    Paused,
    Error,
}

impl BotState {
    pub const ALL: [BotState; 6] = [
        BotState::Flat,
        BotState::Signal,
        BotState::WaitingFill,
        BotState::Manage,
        BotState::Paused,
        BotState::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BotState::Flat => "FLAT",
            BotState::Signal => "SIGNAL",
            BotState::WaitingFill => "WAITING_FILL",
            BotState::Manage => "MANAGE",
            BotState::Paused => "PAUSED",
            BotState::Error => "ERROR",
        }
    }

    /// New entries may only start from here.
    pub fn accepts_entries(self) -> bool {
        matches!(self, BotState::Flat | BotState::Signal)
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Trigger {
    CandleClose,
    Signal { confirmed: bool },
    OrderFill,
    OrderCancel,
    StopHit,
    ExitSignal,
    Pause,
    Resume,
    Error,
    ClearError,
}

impl Trigger {
    pub const ALL: [Trigger; 11] = [
        Trigger::CandleClose,
        Trigger::Signal { confirmed: false },
        Trigger::Signal { confirmed: true },
        Trigger::OrderFill,
        Trigger::OrderCancel,
        Trigger::StopHit,
        Trigger::ExitSignal,
        Trigger::Pause,
        Trigger::Resume,
        Trigger::Error,
        Trigger::ClearError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::CandleClose => "candle_close",
            Trigger::Signal { confirmed: false } => "signal",
            Trigger::Signal { confirmed: true } => "signal_confirmed",
            Trigger::OrderFill => "order_fill",
            Trigger::OrderCancel => "order_cancel",
            Trigger::StopHit => "stop_hit",
            Trigger::ExitSignal => "exit_signal",
            Trigger::Pause => "pause",
            Trigger::Resume => "resume",
            Trigger::Error => "error",
            Trigger::ClearError => "clear_error",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table.
///
/// `has_position` only matters when leaving PAUSED or ERROR: the machine
/// returns to MANAGE if a position is still open so it is never stranded.
pub fn transition_target(from: BotState, trigger: Trigger, has_position: bool) -> Option<BotState> {
    use BotState as S;
    use Trigger as T;

    let resume_to = if has_position { S::Manage } else { S::Flat };
    match (from, trigger) {
        (S::Paused, T::Pause) => Some(S::Paused),
        (S::Error, T::Error) => Some(S::Error),
        (S::Error, T::ClearError) => Some(resume_to),
        (S::Error, _) => match trigger {
            // A faulted bot still honours protective exits and broker fills.
            T::CandleClose | T::StopHit | T::ExitSignal | T::OrderCancel | T::OrderFill => Some(S::Error),
            _ => None,
        },
        (_, T::Pause) => Some(S::Paused),
        (_, T::Error) => Some(S::Error),

        (S::Flat, T::CandleClose) => Some(S::Flat),
        (S::Flat, T::Signal { confirmed: false }) => Some(S::Signal),

        (S::Signal, T::CandleClose) => Some(S::Flat),
        (S::Signal, T::Signal { confirmed: false }) => Some(S::Signal),
        (S::Signal, T::Signal { confirmed: true }) => Some(S::WaitingFill),

        (S::WaitingFill, T::CandleClose) => Some(S::WaitingFill),
        (S::WaitingFill, T::OrderFill) => Some(S::Manage),
        (S::WaitingFill, T::OrderCancel) => Some(S::Flat),

        (S::Manage, T::CandleClose) => Some(S::Manage),
        (S::Manage, T::StopHit | T::ExitSignal) => Some(S::Flat),

        (S::Paused, T::Resume) => Some(resume_to),
        (S::Paused, T::CandleClose | T::OrderFill | T::OrderCancel | T::StopHit | T::ExitSignal) => {
            Some(S::Paused)
        }

        _ => None,
    }
}

/// Whether `from --trigger--> to` is an edge of the table for some position state.
pub fn is_valid_edge(from: BotState, trigger: Trigger, to: BotState) -> bool {
    transition_target(from, trigger, false) == Some(to) || transition_target(from, trigger, true) == Some(to)
}

#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("invalid transition: {trigger} is not accepted in state {state}")]
    InvalidTransition { state: BotState, trigger: Trigger },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: BotState,
    pub to: BotState,
    pub trigger: Trigger,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A confirmed entry waiting for its fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub signal_id: SignalId,
    pub symbol: String,
    pub side: Side,
    pub reference_price: f64,
    pub quantity_hint: f64,
    pub stop_price: f64,
    pub take_profit: Option<f64>,
    pub leverage: f64,
    pub submitted_bar: u64,
}

/// Lossless serialized form of a [`BotStateMachine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub state: BotState,
    pub history: Vec<TransitionRecord>,
    pub position: Option<PositionState>,
    pub pending: Option<PendingEntry>,
    pub clock: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BotStateMachine {
    state: BotState,
    history: Vec<TransitionRecord>,
    position: Option<PositionState>,
    pending: Option<PendingEntry>,
    /// Timestamp stamped on new history records (the current bar time).
    clock: Option<DateTime<Utc>>,
}

impl Default for BotStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BotStateMachine {
    pub fn new() -> Self {
        Self {
            state: BotState::Flat,
            history: Vec::new(),
            position: None,
            pending: None,
            clock: None,
        }
    }

    pub fn state(&self) -> BotState {
        self.state
    }

    pub fn position(&self) -> Option<&PositionState> {
        self.position.as_ref()
    }

    pub fn pending(&self) -> Option<&PendingEntry> {
        self.pending.as_ref()
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    /// Stamp subsequent history records with `now` instead of wall-clock time.
    pub fn set_clock(&mut self, now: DateTime<Utc>) {
        self.clock = Some(now);
    }

    // ─── Transitions ────────────────────────────────────────────────────

    /// Fire `trigger`. Returns the new state.
    ///
    /// With `force`, an invalid trigger is swallowed: the current state is
    /// returned and nothing is recorded.
    pub fn trigger(
        &mut self,
        trigger: Trigger,
        data: Option<serde_json::Value>,
        force: bool,
    ) -> Result<BotState, TransitionError> {
        match transition_target(self.state, trigger, self.has_position()) {
            Some(to) => {
                let from = self.state;
                self.state = to;
                self.history.push(TransitionRecord {
                    timestamp: self.clock.unwrap_or_else(Utc::now),
                    from,
                    to,
                    trigger,
                    data: data.unwrap_or_default(),
                });
                debug!(%from, %to, %trigger, "state transition");
                Ok(to)
            }
            None if force => {
                debug!(state = %self.state, %trigger, "forced trigger ignored");
                Ok(self.state)
            }
            None => Err(TransitionError::InvalidTransition {
                state: self.state,
                trigger,
            }),
        }
    }

    pub fn can_transition(&self, trigger: Trigger) -> bool {
        transition_target(self.state, trigger, self.has_position()).is_some()
    }

    pub fn valid_triggers(&self) -> Vec<Trigger> {
        Trigger::ALL
            .into_iter()
            .filter(|t| self.can_transition(*t))
            .collect()
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    // ─── Lifecycle operations ───────────────────────────────────────────
    //
    // Each fires its trigger first; ownership changes only once the
    // transition has been accepted.

    /// SIGNAL → WAITING_FILL, remembering what was ordered.
    pub fn confirm_entry(
        &mut self,
        pending: PendingEntry,
        data: Option<serde_json::Value>,
    ) -> Result<BotState, TransitionError> {
        let state = self.trigger(Trigger::Signal { confirmed: true }, data, false)?;
        self.pending = Some(pending);
        Ok(state)
    }

    /// The entry filled: install the position.
    pub fn fill_entry(
        &mut self,
        position: PositionState,
        data: Option<serde_json::Value>,
    ) -> Result<BotState, TransitionError> {
        if self.has_position() {
            return Err(TransitionError::InvalidTransition {
                state: self.state,
                trigger: Trigger::OrderFill,
            });
        }
        let state = self.trigger(Trigger::OrderFill, data, false)?;
        self.pending = None;
        self.position = Some(position);
        Ok(state)
    }

    /// The pending entry was withdrawn. Returns it.
    pub fn cancel_entry(
        &mut self,
        data: Option<serde_json::Value>,
    ) -> Result<Option<PendingEntry>, TransitionError> {
        self.trigger(Trigger::OrderCancel, data, false)?;
        Ok(self.pending.take())
    }

    /// Close the position on `StopHit` or `ExitSignal`. Returns the closed position.
    pub fn close_position(
        &mut self,
        trigger: Trigger,
        data: Option<serde_json::Value>,
    ) -> Result<Option<PositionState>, TransitionError> {
        if !matches!(trigger, Trigger::StopHit | Trigger::ExitSignal) || !self.has_position() {
            return Err(TransitionError::InvalidTransition {
                state: self.state,
                trigger,
            });
        }
        self.trigger(trigger, data, false)?;
        Ok(self.position.take())
    }

    // ─── Position upkeep ────────────────────────────────────────────────

    /// Mark the open position to `price` and count the bar.
    pub fn mark_position(&mut self, price: f64) {
        if let Some(pos) = self.position.as_mut() {
            pos.mark(price);
            pos.tick_bar();
        }
    }

    /// Apply a trailing manager result through the ratchet.
    pub fn apply_trailing(&mut self, result: &TrailingStopResult, bar: u64) -> Option<StopUpdate> {
        let pos = self.position.as_mut()?;
        TrailingStopManager::apply(pos, result, bar)
    }

    /// Apply an externally produced stop candidate (rule packs) through the ratchet.
    pub fn apply_stop_candidate(&mut self, candidate: f64, bar: u64) -> Option<StopUpdate> {
        let pos = self.position.as_mut()?;
        let update = pos.apply_stop_candidate(candidate, bar);
        update.moved().then_some(update)
    }

    // ─── Snapshots ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            state: self.state,
            history: self.history.clone(),
            position: self.position.clone(),
            pending: self.pending.clone(),
            clock: self.clock,
        }
    }

    pub fn from_snapshot(snapshot: MachineSnapshot) -> Self {
        Self {
            state: snapshot.state,
            history: snapshot.history,
            position: snapshot.position,
            pending: snapshot.pending,
            clock: snapshot.clock,
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self.snapshot())
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value).map(Self::from_snapshot)
    }
}
