//! TradingBot - the per-symbol controller.
//!
//! One bot owns one state machine plus every component that feeds it. A
//! closed bar runs through a fixed chain:
//!
//! 1. regime tracker (hysteresis)
//! 2. rule packs, if loaded (snapshot of the active pack)
//! 3. exit checker / trailing manager for an open position, or
//!    entry scorer (or entry rules) when flat
//! 4. the state machine
//!
//! and yields at most one [`BotDecision`]. The chain never blocks except for
//! the bounded advisory wait on a confirmation bar.

pub mod advisory;
pub mod observer;

pub use advisory::{Advisor, AdvisoryOutcome, AdvisoryRequest, AdvisoryVerdict, AdvisoryWorker};
pub use observer::{BotEvent, BotObserver, EventLog};

use crate::config::{BotConfig, ConfigError};
use crate::domain::{
    keys, BotDecision, DecisionAction, ExitReason, FeatureVector, OrderIntent, PositionState, Side,
    Signal, SignalId, SignalSource,
};
use crate::leverage::{LeverageError, LeverageRulesEngine};
use crate::machine::{BotState, BotStateMachine, MachineSnapshot, PendingEntry, TransitionError, Trigger};
use crate::regime::{RegimeState, RegimeTracker, TrackerSnapshot};
use crate::rulepack::{
    ExecutionSummary, PackType, RulePack, RulePackError, RulePackExecutor, RulePackHandle, StatsSnapshot,
};
use crate::rules::{RuleContextBuilder, RuleEngine, Value};
use crate::scoring::{EntryScorer, ExitSignal, ExitSignalChecker};
use crate::trailing::TrailingStopManager;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn, Level};

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    RulePack(#[from] RulePackError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("no pending entry to fill")]
    NoPendingEntry,

    #[error("invalid fill: price {price}, quantity {quantity}")]
    InvalidFill { price: f64, quantity: f64 },

    #[error("snapshot belongs to {found}, not {expected}")]
    SymbolMismatch { expected: String, found: String },

    #[error("failed to start advisory worker: {0}")]
    Advisory(#[source] std::io::Error),
}

/// An entry candidate from the scorer or an entry rule.
#[derive(Debug, Clone)]
struct Candidate {
    side: Side,
    score: f64,
    reasons: Vec<String>,
    source: SignalSource,
}

/// The signal id (and little else) carried from the SIGNAL bar to the
/// confirmation bar. The [`Signal`] itself is dropped with its bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpenSignal {
    pub id: SignalId,
    pub side: Side,
}

/// Serialized session of one [`TradingBot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSnapshot {
    pub symbol: String,
    pub machine: MachineSnapshot,
    pub regime: TrackerSnapshot,
    pub rule_stats: StatsSnapshot,
    pub bar: u64,
    pub warmup_remaining: u64,
    pub next_signal_id: u64,
    pub open_signal: Option<OpenSignal>,
}

/// Rule-pack verdicts for one bar, present only when a pack ran without a
/// fatal abort.
struct RuleVerdict {
    summary: ExecutionSummary,
    has_entry_pack: bool,
}

pub struct TradingBot {
    symbol: String,
    config: BotConfig,

    // ── Components ──
    machine: BotStateMachine,
    regime: RegimeTracker,
    scorer: EntryScorer,
    exits: ExitSignalChecker,
    trailing: TrailingStopManager,
    leverage: LeverageRulesEngine,
    executor: RulePackExecutor,
    rulepack: RulePackHandle,

    // ── Outputs ──
    observers: Vec<Box<dyn BotObserver>>,
    advisory: Option<AdvisoryWorker>,

    // ── Per-session counters ──
    bar: u64,
    warmup_remaining: u64,
    next_signal_id: u64,
    open_signal: Option<OpenSignal>,
}

impl std::fmt::Debug for TradingBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingBot")
            .field("symbol", &self.symbol)
            .field("state", &self.machine.state())
            .field("bar", &self.bar)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

impl TradingBot {
    /// Build a bot with its own program cache. Loads `config.rules.rulepack_path` if set.
    pub fn new(symbol: impl Into<String>, config: BotConfig) -> Result<Self, BotError> {
        let engine = RuleEngine::with_capacity(config.rules.cache_capacity);
        Self::with_engine(symbol, config, engine)
    }

    /// Build a bot sharing `engine`'s program cache with other bots.
    pub fn with_engine(symbol: impl Into<String>, config: BotConfig, engine: RuleEngine) -> Result<Self, BotError> {
        config.validate()?;
        let pack = match &config.rules.rulepack_path {
            Some(path) => Some(RulePack::load_validated(path, &engine)?),
            None => None,
        };
        let symbol = symbol.into();
        info!(%symbol, pack = pack.as_ref().map(|p| p.metadata.name.as_str()), "bot created");
        Ok(Self {
            symbol,
            machine: BotStateMachine::new(),
            regime: RegimeTracker::new(config.regime.clone()),
            scorer: EntryScorer::new(config.entry.clone()),
            exits: ExitSignalChecker::new(config.exit.clone()),
            trailing: TrailingStopManager::new(config.trailing.clone()),
            leverage: LeverageRulesEngine::new(config.leverage.clone()),
            executor: RulePackExecutor::new(engine),
            rulepack: RulePackHandle::new(pack),
            observers: Vec::new(),
            advisory: None,
            bar: 0,
            warmup_remaining: config.warmup_bars,
            next_signal_id: 1,
            open_signal: None,
            config,
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn BotObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Validate new signals with `advisor`, on a worker thread.
    pub fn with_advisor(mut self, advisor: impl Advisor) -> Result<Self, BotError> {
        let timeout = Duration::from_millis(self.config.advisory.timeout_ms);
        self.advisory = Some(AdvisoryWorker::spawn(advisor, timeout).map_err(BotError::Advisory)?);
        Ok(self)
    }

    /// Use a shared pack slot (for reloading many bots at once).
    pub fn with_rulepack_handle(mut self, handle: RulePackHandle) -> Self {
        self.rulepack = handle;
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn BotObserver>) {
        self.observers.push(observer);
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn state(&self) -> BotState {
        self.machine.state()
    }

    pub fn machine(&self) -> &BotStateMachine {
        &self.machine
    }

    pub fn position(&self) -> Option<&PositionState> {
        self.machine.position()
    }

    pub fn regime(&self) -> &RegimeState {
        self.regime.active()
    }

    pub fn executor(&self) -> &RulePackExecutor {
        &self.executor
    }

    pub fn rulepack(&self) -> Option<Arc<RulePack>> {
        self.rulepack.current()
    }

    pub fn bars_processed(&self) -> u64 {
        self.bar
    }

    pub fn is_warming_up(&self) -> bool {
        self.warmup_remaining > 0
    }

    // ─── Bar processing ─────────────────────────────────────────────────

    /// Pre-fill rolling state (regime hysteresis, warmup counter) from
    /// history. Emits no decisions. Returns the number of bars consumed.
    pub fn warmup_from_history(&mut self, bars: &[FeatureVector]) -> usize {
        let mut consumed = 0;
        for f in bars {
            if f.symbol != self.symbol || !f.is_sane() {
                continue;
            }
            self.bar += 1;
            self.regime.update(f);
            self.warmup_remaining = self.warmup_remaining.saturating_sub(1);
            consumed += 1;
        }
        debug!(symbol = %self.symbol, consumed, regime = %self.regime.active().regime_type, "warmup complete");
        consumed
    }

    /// Process one closed bar. Returns the decision taken, if any.
    pub fn on_bar(&mut self, features: &FeatureVector) -> Option<BotDecision> {
        if features.symbol != self.symbol {
            warn!(expected = %self.symbol, got = %features.symbol, "bar for another symbol ignored");
            return None;
        }
        if !features.is_sane() {
            self.log(Level::WARN, format!("insane bar at {} ignored", features.timestamp));
            return None;
        }

        self.bar += 1;
        self.machine.set_clock(features.timestamp);

        let update = self.regime.update(features);
        if update.changed {
            self.log(
                Level::INFO,
                format!("regime {} -> {}", update.previous, update.active.regime_type),
            );
        }
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return None;
        }
        let regime = update.active;

        self.machine.mark_position(features.close);
        let rules = self.run_rules(features, &regime);

        let decision = if self.machine.has_position() {
            self.manage_position(features, &regime, rules.as_ref())
        } else if self.machine.pending().is_some() {
            self.check_fill_timeout(features, &regime)
        } else {
            match self.machine.state() {
                BotState::Flat => self.look_for_entry(features, &regime, rules.as_ref()),
                BotState::Signal => self.confirm_or_expire(features, &regime, rules.as_ref()),
                _ => None,
            }
        };

        if let Some(d) = &decision {
            for obs in &mut self.observers {
                obs.on_decision(d);
                if let Some(intent) = &d.order_intent {
                    obs.on_order_intent(intent);
                }
            }
        }
        decision
    }

    fn run_rules(&mut self, features: &FeatureVector, regime: &RegimeState) -> Option<RuleVerdict> {
        let pack = self.rulepack.current()?;
        let ctx = RuleContextBuilder::new()
            .features(features)
            .position(self.machine.position())
            .regime(regime)
            .config(self.config_vars())
            .var("bot.state", self.machine.state().as_str())
            .var("bot.bar", self.bar as f64)
            .build();
        let summary = self.executor.execute(&pack, &ctx, &[]);

        for failure in &summary.errors {
            self.log(
                Level::DEBUG,
                format!("rule {} failed: {}", failure.rule_id, failure.message),
            );
        }
        if let Some(rule) = &summary.aborted {
            self.log(
                Level::WARN,
                format!("fatal rule {rule} aborted rule packs, using scorer and checker this bar"),
            );
            return None;
        }
        Some(RuleVerdict {
            has_entry_pack: pack.has_pack_type(PackType::Entry),
            summary,
        })
    }

    fn config_vars(&self) -> [(&'static str, Value); 5] {
        [
            ("entry_threshold", self.config.entry.threshold.into()),
            ("max_bars_held", self.config.exit.max_bars_held.map(|b| b as f64).into()),
            ("order_notional", self.config.execution.order_notional.into()),
            ("trailing_activation_pct", self.config.trailing.activation_pct.into()),
            ("warmup_bars", (self.config.warmup_bars as f64).into()),
        ]
    }

    // ─── Position management ────────────────────────────────────────────

    fn manage_position(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        rules: Option<&RuleVerdict>,
    ) -> Option<BotDecision> {
        let position = self.machine.position()?;

        let exit = self.exits.check(features, regime, position).or_else(|| {
            rules
                .and_then(|r| r.summary.exit_rule())
                .map(|rule_id| ExitSignal {
                    reason: ExitReason::RuleExit(rule_id.to_string()),
                    price: features.close,
                })
        });
        if let Some(exit) = exit {
            return self.close(features, regime, exit, rules.is_some());
        }

        let result = self
            .trailing
            .calculate_trailing_stop(features, position, regime, self.bar);
        let mut moved = self.machine.apply_trailing(&result, self.bar);
        let mut rule_driven = false;
        if let Some(candidate) = rules.and_then(|r| r.summary.trailing_stop) {
            if let Some(update) = self.machine.apply_stop_candidate(candidate, self.bar) {
                moved = Some(update);
                rule_driven = true;
            }
        }
        let update = moved?;
        let position = self.machine.position()?;
        let state = self.machine.state();
        Some(BotDecision {
            symbol: self.symbol.clone(),
            timestamp: features.timestamp,
            bar: self.bar,
            action: DecisionAction::AdjustStop,
            side: Some(position.side),
            exit_reason: None,
            reasons: vec![format!(
                "stop {:.4} -> {:.4}",
                update.previous, update.effective
            )],
            score: None,
            state_before: state,
            state_after: state,
            regime: regime.regime_type,
            rule_driven,
            order_intent: Some(OrderIntent::modify_stop(position)),
            features_hash: features.content_hash(),
        })
    }

    fn close(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        exit: ExitSignal,
        rules_ran: bool,
    ) -> Option<BotDecision> {
        let trigger = if exit.reason == ExitReason::StopLoss {
            Trigger::StopHit
        } else {
            Trigger::ExitSignal
        };
        let state_before = self.machine.state();
        let data = json!({ "reason": exit.reason.to_string(), "price": exit.price });
        let position = match self.machine.close_position(trigger, Some(data)) {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(err) => {
                self.log(Level::ERROR, format!("exit rejected: {err}"));
                return None;
            }
        };
        let pnl = position.side.sign() * (exit.price - position.entry_price) * position.quantity;
        self.log(
            Level::INFO,
            format!(
                "{} {} closed at {:.4} ({}), pnl {:.4}",
                self.symbol, position.side, exit.price, exit.reason, pnl
            ),
        );
        let rule_driven = rules_ran && matches!(exit.reason, ExitReason::RuleExit(_));
        Some(BotDecision {
            symbol: self.symbol.clone(),
            timestamp: features.timestamp,
            bar: self.bar,
            action: DecisionAction::Exit,
            side: Some(position.side),
            reasons: vec![format!("{} at {:.4}", exit.reason, exit.price)],
            exit_reason: Some(exit.reason),
            score: None,
            state_before,
            state_after: self.machine.state(),
            regime: regime.regime_type,
            rule_driven,
            order_intent: Some(OrderIntent::exit(&position, exit.price)),
            features_hash: features.content_hash(),
        })
    }

    fn check_fill_timeout(&mut self, features: &FeatureVector, regime: &RegimeState) -> Option<BotDecision> {
        let pending = self.machine.pending()?;
        let waited = self.bar.saturating_sub(pending.submitted_bar);
        if waited < self.config.execution.fill_timeout_bars {
            return None;
        }
        let state_before = self.machine.state();
        let pending = match self.machine.cancel_entry(Some(json!({ "waited_bars": waited }))) {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(err) => {
                self.log(Level::ERROR, format!("cancel rejected: {err}"));
                return None;
            }
        };
        self.log(
            Level::INFO,
            format!("entry {} not filled after {waited} bars, cancelled", pending.signal_id),
        );
        Some(BotDecision {
            symbol: self.symbol.clone(),
            timestamp: features.timestamp,
            bar: self.bar,
            action: DecisionAction::Cancel,
            side: Some(pending.side),
            exit_reason: None,
            reasons: vec![format!("fill timeout after {waited} bars")],
            score: None,
            state_before,
            state_after: self.machine.state(),
            regime: regime.regime_type,
            rule_driven: false,
            order_intent: Some(OrderIntent::cancel_entry(
                pending.symbol,
                pending.side,
                pending.reference_price,
            )),
            features_hash: features.content_hash(),
        })
    }

    // ─── Entries ────────────────────────────────────────────────────────

    /// Rule entry packs replace the scorer when loaded; gate and risk packs
    /// can veto either source.
    fn entry_candidate(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        rules: Option<&RuleVerdict>,
    ) -> Option<Candidate> {
        if let Some(r) = rules {
            if !r.summary.entry_allowed() {
                let mut blockers = r.summary.gate_blocks.clone();
                blockers.extend(r.summary.risk_flags.iter().cloned());
                let reason = format!("entries blocked by rules: {}", blockers.join(", "));
                for obs in &mut self.observers {
                    obs.on_trading_blocked(&reason);
                }
                debug!(symbol = %self.symbol, %reason, "entry blocked");
                return None;
            }
            if r.has_entry_pack {
                let m = r.summary.entry.as_ref()?;
                if m.side == Side::Short && !self.config.entry.allow_short {
                    return None;
                }
                return Some(Candidate {
                    side: m.side,
                    score: 1.0,
                    reasons: vec![format!("rule {} matched", m.rule_id)],
                    source: SignalSource::Rule {
                        rule_id: m.rule_id.clone(),
                    },
                });
            }
        }
        self.scorer
            .best_candidate(features, regime)
            .map(|s| Candidate {
                side: s.side,
                score: s.score,
                reasons: s.reasons,
                source: SignalSource::Scorer,
            })
    }

    fn look_for_entry(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        rules: Option<&RuleVerdict>,
    ) -> Option<BotDecision> {
        let candidate = self.entry_candidate(features, regime, rules)?;
        let state_before = self.machine.state();

        let id = SignalId(self.next_signal_id);
        self.next_signal_id += 1;
        let signal = Signal {
            id,
            symbol: self.symbol.clone(),
            side: candidate.side,
            score: candidate.score,
            reasons: candidate.reasons.clone(),
            source: candidate.source.clone(),
            bar: self.bar,
            timestamp: features.timestamp,
            reference_price: features.close,
        };
        let data = json!({ "signal": id.to_string(), "side": candidate.side.as_str(), "score": candidate.score });
        if let Err(err) = self.machine.trigger(Trigger::Signal { confirmed: false }, Some(data), false) {
            self.log(Level::ERROR, format!("signal rejected: {err}"));
            return None;
        }
        for obs in &mut self.observers {
            obs.on_signal(&signal);
        }
        self.open_signal = Some(OpenSignal {
            id,
            side: candidate.side,
        });

        if !self.config.entry.require_confirmation {
            return self.enter(features, regime, id, &candidate, state_before);
        }

        if self.config.advisory.enabled {
            if let Some(worker) = self.advisory.as_mut() {
                worker.request(AdvisoryRequest {
                    signal_id: id,
                    symbol: self.symbol.clone(),
                    side: candidate.side,
                    score: candidate.score,
                    reasons: candidate.reasons.clone(),
                });
            }
        }

        Some(BotDecision {
            symbol: self.symbol.clone(),
            timestamp: features.timestamp,
            bar: self.bar,
            action: DecisionAction::Signal,
            side: Some(candidate.side),
            exit_reason: None,
            reasons: candidate.reasons,
            score: Some(candidate.score),
            state_before,
            state_after: self.machine.state(),
            regime: regime.regime_type,
            rule_driven: matches!(candidate.source, SignalSource::Rule { .. }),
            order_intent: None,
            features_hash: features.content_hash(),
        })
    }

    fn confirm_or_expire(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        rules: Option<&RuleVerdict>,
    ) -> Option<BotDecision> {
        let Some(open) = self.open_signal else {
            // Restored mid-signal without the signal itself: let it lapse.
            if let Err(err) = self.machine.trigger(Trigger::CandleClose, None, false) {
                self.log(Level::ERROR, format!("signal lapse rejected: {err}"));
            }
            return None;
        };
        let candidate = self.entry_candidate(features, regime, rules);
        let state_before = self.machine.state();

        let confirmed = match candidate {
            Some(c) if c.side == open.side => c,
            other => {
                let why = match other {
                    Some(c) => format!("{} not confirmed, {} scored instead", open.id, c.side),
                    None => format!("{} not confirmed", open.id),
                };
                return self.expire(features, regime, open, why, state_before);
            }
        };

        if let Some(worker) = self.advisory.as_mut() {
            match worker.resolve(open.id) {
                AdvisoryOutcome::Rejected(v) => {
                    let why = format!(
                        "{} rejected by advisory{}",
                        open.id,
                        v.note.map(|n| format!(": {n}")).unwrap_or_default()
                    );
                    return self.expire(features, regime, open, why, state_before);
                }
                AdvisoryOutcome::TimedOut => {
                    self.log(Level::INFO, format!("advisory for {} timed out, using technical score", open.id));
                }
                AdvisoryOutcome::Failed(e) => {
                    self.log(Level::WARN, format!("advisory for {} failed ({e}), using technical score", open.id));
                }
                AdvisoryOutcome::Approved(_) | AdvisoryOutcome::NotRequested => {}
            }
        }

        self.enter(features, regime, open.id, &confirmed, state_before)
    }

    /// SIGNAL → FLAT without an order.
    fn expire(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        open: OpenSignal,
        why: String,
        state_before: BotState,
    ) -> Option<BotDecision> {
        self.open_signal = None;
        if let Some(worker) = self.advisory.as_mut() {
            worker.abandon();
        }
        if let Err(err) = self
            .machine
            .trigger(Trigger::CandleClose, Some(json!({ "expired": open.id.to_string() })), false)
        {
            self.log(Level::ERROR, format!("signal expiry rejected: {err}"));
            return None;
        }
        self.log(Level::DEBUG, why.clone());
        Some(BotDecision {
            symbol: self.symbol.clone(),
            timestamp: features.timestamp,
            bar: self.bar,
            action: DecisionAction::Cancel,
            side: Some(open.side),
            exit_reason: None,
            reasons: vec![why],
            score: None,
            state_before,
            state_after: self.machine.state(),
            regime: regime.regime_type,
            rule_driven: false,
            order_intent: None,
            features_hash: features.content_hash(),
        })
    }

    /// Size, bound leverage and request the entry order (SIGNAL → WAITING_FILL).
    fn enter(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        signal_id: SignalId,
        candidate: &Candidate,
        state_before: BotState,
    ) -> Option<BotDecision> {
        let open = OpenSignal {
            id: signal_id,
            side: candidate.side,
        };
        let price = features.close;
        let atr = features.get(keys::ATR);
        let levels = self.exits.protective_levels(candidate.side, price, atr);
        let leverage = match self
            .leverage
            .calculate_leverage(&self.symbol, price, candidate.side, levels.stop, regime, atr)
        {
            Ok(l) => l,
            Err(err) => return self.leverage_blocked(features, regime, open, err, state_before),
        };

        let quantity = self.config.execution.order_notional * leverage.leverage / price;
        let intent = OrderIntent::entry(
            self.symbol.clone(),
            candidate.side,
            quantity,
            self.config.execution.order_type,
            price,
            levels.stop,
            levels.take_profit,
            leverage.leverage,
        );
        let pending = PendingEntry {
            signal_id,
            symbol: self.symbol.clone(),
            side: candidate.side,
            reference_price: price,
            quantity_hint: quantity,
            stop_price: levels.stop,
            take_profit: levels.take_profit,
            leverage: leverage.leverage,
            submitted_bar: self.bar,
        };
        let data = json!({ "signal": signal_id.to_string(), "leverage": leverage.leverage, "stop": levels.stop });
        if let Err(err) = self.machine.confirm_entry(pending, Some(data)) {
            self.log(Level::ERROR, format!("entry rejected: {err}"));
            return None;
        }
        self.open_signal = None;

        let mut reasons = candidate.reasons.clone();
        reasons.extend(leverage.reasons);
        info!(
            symbol = %self.symbol,
            side = %candidate.side,
            score = candidate.score,
            leverage = leverage.leverage,
            "entry requested"
        );
        Some(BotDecision {
            symbol: self.symbol.clone(),
            timestamp: features.timestamp,
            bar: self.bar,
            action: DecisionAction::Enter,
            side: Some(candidate.side),
            exit_reason: None,
            reasons,
            score: Some(candidate.score),
            state_before,
            state_after: self.machine.state(),
            regime: regime.regime_type,
            rule_driven: matches!(candidate.source, SignalSource::Rule { .. }),
            order_intent: Some(intent),
            features_hash: features.content_hash(),
        })
    }

    fn leverage_blocked(
        &mut self,
        features: &FeatureVector,
        regime: &RegimeState,
        open: OpenSignal,
        err: LeverageError,
        state_before: BotState,
    ) -> Option<BotDecision> {
        let reason = format!("leverage rejected entry: {err}");
        for obs in &mut self.observers {
            obs.on_trading_blocked(&reason);
        }
        self.expire(features, regime, open, reason, state_before)
    }

    // ─── External events ────────────────────────────────────────────────

    /// The pending entry order filled.
    pub fn on_order_fill(&mut self, price: f64, quantity: f64) -> Result<BotState, BotError> {
        if !(price > 0.0 && quantity > 0.0) {
            return Err(BotError::InvalidFill { price, quantity });
        }
        let pending = self.machine.pending().cloned().ok_or(BotError::NoPendingEntry)?;

        // Keep the planned stop unless the fill slipped through it.
        let s = pending.side.sign();
        let (stop, take_profit) = if s * (price - pending.stop_price) > 0.0 {
            (pending.stop_price, pending.take_profit)
        } else {
            let levels = self.exits.protective_levels(pending.side, price, None);
            (levels.stop, levels.take_profit)
        };
        let position = PositionState::open(
            self.symbol.clone(),
            pending.side,
            price,
            quantity,
            stop,
            take_profit,
            self.bar,
        )
        .with_leverage(pending.leverage);

        let data = json!({ "price": price, "quantity": quantity, "signal": pending.signal_id.to_string() });
        let state = self.machine.fill_entry(position, Some(data))?;
        self.log(
            Level::INFO,
            format!("{} {} filled {quantity} @ {price}, stop {stop:.4}", self.symbol, pending.side),
        );
        Ok(state)
    }

    /// The broker cancelled the pending entry.
    pub fn on_order_cancel(&mut self) -> Result<BotState, BotError> {
        if self.machine.pending().is_none() {
            return Err(BotError::NoPendingEntry);
        }
        self.machine.cancel_entry(Some(json!({ "by": "broker" })))?;
        self.log(Level::INFO, format!("{} pending entry cancelled", self.symbol));
        Ok(self.machine.state())
    }

    /// Stop accepting new entries. Open positions keep being managed. Idempotent.
    pub fn pause(&mut self) -> Result<BotState, BotError> {
        self.open_signal = None;
        if let Some(worker) = self.advisory.as_mut() {
            worker.abandon();
        }
        let state = self.machine.trigger(Trigger::Pause, None, false)?;
        self.log(Level::INFO, format!("{} paused", self.symbol));
        Ok(state)
    }

    /// Resume after `pause`. A no-op when not paused.
    ///
    /// An entry order still pending from before the pause is withdrawn.
    pub fn resume(&mut self) -> Result<BotState, BotError> {
        if self.machine.state() != BotState::Paused {
            return Ok(self.machine.state());
        }
        self.withdraw_pending("resume")?;
        let state = self.machine.trigger(Trigger::Resume, None, false)?;
        self.log(Level::INFO, format!("{} resumed in {state}", self.symbol));
        Ok(state)
    }

    /// Put the bot into ERROR. Protective exits keep running.
    pub fn report_error(&mut self, message: &str) -> Result<BotState, BotError> {
        self.open_signal = None;
        let state = self
            .machine
            .trigger(Trigger::Error, Some(json!({ "message": message })), false)?;
        self.log(Level::ERROR, format!("{} error: {message}", self.symbol));
        Ok(state)
    }

    /// Leave ERROR. An entry order still pending from before the fault is
    /// withdrawn; a fill that arrived meanwhile is managed as usual.
    pub fn clear_error(&mut self) -> Result<BotState, BotError> {
        if self.machine.state() == BotState::Error {
            self.withdraw_pending("clear_error")?;
        }
        let state = self.machine.trigger(Trigger::ClearError, None, false)?;
        self.log(Level::INFO, format!("{} error cleared, now {state}", self.symbol));
        Ok(state)
    }

    /// Cancel a stale pending entry and tell observers to pull the order.
    fn withdraw_pending(&mut self, by: &str) -> Result<(), BotError> {
        if self.machine.pending().is_none() {
            return Ok(());
        }
        if let Some(pending) = self.machine.cancel_entry(Some(json!({ "by": by })))? {
            self.log(
                Level::INFO,
                format!("entry {} withdrawn on {by}", pending.signal_id),
            );
            let intent = OrderIntent::cancel_entry(pending.symbol, pending.side, pending.reference_price);
            for obs in &mut self.observers {
                obs.on_order_intent(&intent);
            }
        }
        Ok(())
    }

    // ─── Session snapshots ──────────────────────────────────────────────

    /// Everything needed to suspend this bot and resume it later: lifecycle
    /// state with position and trailing stop, regime hysteresis, rule
    /// counters and session counters. Config, rule pack and observers are
    /// supplied again by whoever rebuilds the bot.
    pub fn snapshot(&self) -> BotSnapshot {
        BotSnapshot {
            symbol: self.symbol.clone(),
            machine: self.machine.snapshot(),
            regime: self.regime.snapshot(),
            rule_stats: self.executor.rule_stats(),
            bar: self.bar,
            warmup_remaining: self.warmup_remaining,
            next_signal_id: self.next_signal_id,
            open_signal: self.open_signal,
        }
    }

    /// Resume from [`snapshot`](Self::snapshot). The snapshot must belong to
    /// this bot's symbol.
    pub fn restore(&mut self, snapshot: BotSnapshot) -> Result<(), BotError> {
        if snapshot.symbol != self.symbol {
            return Err(BotError::SymbolMismatch {
                expected: self.symbol.clone(),
                found: snapshot.symbol,
            });
        }
        if let Some(worker) = self.advisory.as_mut() {
            worker.abandon();
        }
        self.machine = BotStateMachine::from_snapshot(snapshot.machine);
        self.regime.restore(snapshot.regime);
        self.executor.restore_stats(snapshot.rule_stats);
        self.bar = snapshot.bar;
        self.warmup_remaining = snapshot.warmup_remaining;
        self.next_signal_id = snapshot.next_signal_id;
        self.open_signal = snapshot.open_signal;
        let state = self.machine.state();
        self.log(
            Level::INFO,
            format!("{} restored at bar {} in {state}", self.symbol, self.bar),
        );
        Ok(())
    }

    /// Validate and atomically swap in a new RulePack. Takes effect next bar.
    pub fn reload_rulepack(&mut self, pack: RulePack) -> Result<(), BotError> {
        let label = format!("{} {}", pack.metadata.name, pack.metadata.version);
        self.rulepack.replace(pack, self.executor.engine())?;
        self.log(Level::INFO, format!("rulepack {label} loaded"));
        Ok(())
    }

    fn log(&mut self, level: Level, message: String) {
        if level == Level::ERROR {
            error!(symbol = %self.symbol, "{message}");
        } else if level == Level::WARN {
            warn!(symbol = %self.symbol, "{message}");
        } else if level == Level::INFO {
            info!(symbol = %self.symbol, "{message}");
        } else {
            debug!(symbol = %self.symbol, "{message}");
        }
        for obs in &mut self.observers {
            obs.on_log(level, &message);
        }
    }
}
