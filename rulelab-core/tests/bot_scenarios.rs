//! End-to-end bot scenarios: bars in, decisions and intents out.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rulelab_core::bot::{AdvisoryRequest, AdvisoryVerdict, BotEvent, EventLog};
use rulelab_core::domain::{keys, DecisionAction, ExitReason, FeatureVector, IntentPurpose, Side};
use rulelab_core::regime::RegimeType;
use rulelab_core::rulepack::RulePack;
use rulelab_core::trailing::{TrailingConfig, TrailingMode};
use rulelab_core::{BotConfig, BotError, BotSnapshot, BotState, TradingBot};

const SYMBOL: &str = "ETHUSDT";

fn ts(i: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(i)
}

/// Regime indicators only: strong ADX with bullish DI.
fn with_regime(f: FeatureVector) -> FeatureVector {
    f.with(keys::ADX, 35.0)
        .with(keys::PLUS_DI, 30.0)
        .with(keys::MINUS_DI, 10.0)
        .with(keys::ATR, 1.0)
        .with(keys::ATR_PERCENTILE, 50.0)
}

/// A bar every long-side component likes (score well above 0.7).
fn trend_bar(i: i64, close: f64) -> FeatureVector {
    with_regime(FeatureVector::new(
        SYMBOL,
        ts(i),
        close - 0.3,
        close + 0.1,
        close - 0.4,
        close,
        2_000.0,
    ))
    .with(keys::EMA_FAST, close - 0.5)
    .with(keys::EMA_SLOW, close - 1.0)
    .with(keys::RSI, 65.0)
    .with(keys::MACD_HIST, 0.5)
    .with(keys::VOLUME_AVG, 1_000.0)
}

/// Regime stays up but nothing supports a new entry.
fn quiet_bar(i: i64, close: f64) -> FeatureVector {
    with_regime(FeatureVector::new(SYMBOL, ts(i), close, close + 0.1, close - 0.1, close, 500.0))
}

fn ohlc_bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> FeatureVector {
    with_regime(FeatureVector::new(SYMBOL, ts(i), open, high, low, close, 1_000.0))
}

fn config() -> BotConfig {
    BotConfig {
        warmup_bars: 3,
        trailing: TrailingConfig {
            mode: TrailingMode::Percent { distance_pct: 1.0 },
            activation_pct: 1.0,
            min_step_pct: 0.2,
            update_cooldown_bars: 1,
            volatile_distance_mult: None,
        },
        ..BotConfig::default()
    }
}

fn bot_with_log(config: BotConfig) -> (TradingBot, EventLog) {
    let log = EventLog::new();
    let bot = TradingBot::new(SYMBOL, config)
        .unwrap()
        .with_observer(Box::new(log.clone()));
    (bot, log)
}

/// Warm up on three trend bars, raise a signal on bar 3, enter on bar 4.
fn enter_long(bot: &mut TradingBot) {
    for i in 0..3 {
        assert!(bot.on_bar(&trend_bar(i, 100.0)).is_none());
    }
    assert_eq!(bot.regime().regime_type, RegimeType::TrendUp);
    let signal = bot.on_bar(&trend_bar(3, 100.0)).unwrap();
    assert_eq!(signal.action, DecisionAction::Signal);
    let enter = bot.on_bar(&trend_bar(4, 100.0)).unwrap();
    assert_eq!(enter.action, DecisionAction::Enter);
}

fn filled_long() -> (TradingBot, EventLog) {
    let (mut bot, log) = bot_with_log(config());
    enter_long(&mut bot);
    assert_eq!(bot.on_order_fill(100.0, 10.0).unwrap(), BotState::Manage);
    (bot, log)
}

// ── Entry lifecycle ──────────────────────────────────────────────────

#[test]
fn signal_confirm_fill_reaches_manage() {
    let (mut bot, log) = bot_with_log(config());
    for i in 0..3 {
        assert!(bot.on_bar(&trend_bar(i, 100.0)).is_none());
    }
    assert!(!bot.is_warming_up());

    let signal = bot.on_bar(&trend_bar(3, 100.0)).unwrap();
    assert_eq!(signal.action, DecisionAction::Signal);
    assert_eq!(signal.side, Some(Side::Long));
    assert_eq!(signal.state_before, BotState::Flat);
    assert_eq!(signal.state_after, BotState::Signal);
    assert_eq!(signal.regime, RegimeType::TrendUp);
    assert!(signal.score.unwrap() >= 0.7);
    assert!(signal.order_intent.is_none());
    assert!(!signal.rule_driven);

    let enter = bot.on_bar(&trend_bar(4, 100.0)).unwrap();
    assert_eq!(enter.action, DecisionAction::Enter);
    assert_eq!(enter.state_after, BotState::WaitingFill);
    let intent = enter.order_intent.as_ref().unwrap();
    assert_eq!(intent.purpose, IntentPurpose::Entry);
    // ATR 1.0 x 2 below the close, target at twice the risk.
    assert_eq!(intent.stop_price, Some(98.0));
    assert_eq!(intent.take_profit, Some(104.0));
    let leverage = intent.leverage.unwrap();
    assert!((1.0..=10.0).contains(&leverage));

    assert_eq!(bot.on_order_fill(100.0, 10.0).unwrap(), BotState::Manage);
    let pos = bot.position().unwrap();
    assert_eq!(pos.side, Side::Long);
    assert_eq!(pos.stop_price(), 98.0);
    assert_eq!(pos.leverage, leverage);

    let events = log.events();
    assert!(events.iter().any(|e| matches!(e, BotEvent::Signal(s) if s.side == Side::Long)));
    let intents = events
        .iter()
        .filter(|e| matches!(e, BotEvent::OrderIntent(_)))
        .count();
    assert_eq!(intents, 1);
}

#[test]
fn unconfirmed_signal_expires_without_order() {
    let (mut bot, _log) = bot_with_log(config());
    for i in 0..4 {
        bot.on_bar(&trend_bar(i, 100.0));
    }
    assert_eq!(bot.state(), BotState::Signal);

    let cancel = bot.on_bar(&quiet_bar(4, 100.0)).unwrap();
    assert_eq!(cancel.action, DecisionAction::Cancel);
    assert_eq!(cancel.state_after, BotState::Flat);
    assert!(cancel.order_intent.is_none());
}

#[test]
fn unfilled_entry_is_cancelled_after_timeout() {
    let (mut bot, log) = bot_with_log(config());
    enter_long(&mut bot);
    log.drain();

    assert!(bot.on_bar(&quiet_bar(5, 100.0)).is_none());
    assert!(bot.on_bar(&quiet_bar(6, 100.0)).is_none());
    let cancel = bot.on_bar(&quiet_bar(7, 100.0)).unwrap();
    assert_eq!(cancel.action, DecisionAction::Cancel);
    assert_eq!(cancel.state_before, BotState::WaitingFill);
    assert_eq!(cancel.state_after, BotState::Flat);
    assert_eq!(
        cancel.order_intent.as_ref().map(|i| i.purpose),
        Some(IntentPurpose::CancelEntry)
    );
    assert!(bot.on_order_fill(100.0, 1.0).is_err());
}

#[test]
fn rejecting_advisor_expires_signal() {
    let mut cfg = config();
    cfg.advisory.enabled = true;
    cfg.advisory.timeout_ms = 2_000;
    let (bot, _log) = bot_with_log(cfg);
    let mut bot = bot
        .with_advisor(|_: &AdvisoryRequest| -> Result<AdvisoryVerdict, String> {
            Ok(AdvisoryVerdict {
                approve: false,
                note: Some("funding too high".into()),
            })
        })
        .unwrap();

    for i in 0..4 {
        bot.on_bar(&trend_bar(i, 100.0));
    }
    let d = bot.on_bar(&trend_bar(4, 100.0)).unwrap();
    assert_eq!(d.action, DecisionAction::Cancel);
    assert!(d.reasons[0].contains("funding too high"));
    assert_eq!(bot.state(), BotState::Flat);
}

// ── Position management ──────────────────────────────────────────────

#[test]
fn stop_hit_exits_to_flat() {
    let (mut bot, log) = filled_long();
    log.drain();

    let exit = bot.on_bar(&ohlc_bar(5, 99.0, 99.2, 97.5, 97.6)).unwrap();
    assert_eq!(exit.action, DecisionAction::Exit);
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(exit.state_before, BotState::Manage);
    assert_eq!(exit.state_after, BotState::Flat);
    let intent = exit.order_intent.as_ref().unwrap();
    assert_eq!(intent.purpose, IntentPurpose::Exit);
    assert_eq!(intent.reference_price, 98.0);
    assert!(bot.position().is_none());
}

#[test]
fn trailing_waits_for_activation_then_ratchets() {
    let (mut bot, _log) = filled_long();

    // +0.5%: below activation.
    assert!(bot.on_bar(&ohlc_bar(5, 100.2, 100.5, 100.1, 100.5)).is_none());
    assert_eq!(bot.position().unwrap().stop_price(), 98.0);

    // +1.5%: trails 1% under the bar high.
    let d = bot.on_bar(&ohlc_bar(6, 100.6, 101.5, 100.5, 101.5)).unwrap();
    assert_eq!(d.action, DecisionAction::AdjustStop);
    assert_eq!(d.state_after, BotState::Manage);
    let stop = bot.position().unwrap().stop_price();
    assert!((stop - 101.5 * 0.99).abs() < 1e-9);
    assert_eq!(
        d.order_intent.as_ref().and_then(|i| i.stop_price),
        Some(stop)
    );

    // Pullback: the stop holds.
    assert!(bot.on_bar(&ohlc_bar(7, 101.2, 101.3, 100.9, 101.0)).is_none());
    assert_eq!(bot.position().unwrap().stop_price(), stop);
}

#[test]
fn paused_bot_still_protects_position() {
    let (mut bot, _log) = filled_long();
    assert_eq!(bot.pause().unwrap(), BotState::Paused);
    assert_eq!(bot.pause().unwrap(), BotState::Paused);

    let exit = bot.on_bar(&ohlc_bar(5, 99.0, 99.2, 97.5, 97.6)).unwrap();
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(exit.state_before, BotState::Paused);
    assert_eq!(exit.state_after, BotState::Paused);
    assert!(bot.position().is_none());

    assert!(bot.on_bar(&trend_bar(6, 100.0)).is_none());
    assert_eq!(bot.resume().unwrap(), BotState::Flat);
}

#[test]
fn error_state_clears_back_to_manage() {
    let (mut bot, _log) = filled_long();
    assert_eq!(bot.report_error("exchange disconnected").unwrap(), BotState::Error);
    assert_eq!(bot.clear_error().unwrap(), BotState::Manage);
}

fn cancel_intents(log: &EventLog) -> usize {
    log.events()
        .iter()
        .filter(|e| matches!(e, BotEvent::OrderIntent(i) if i.purpose == IntentPurpose::CancelEntry))
        .count()
}

#[test]
fn resume_withdraws_entry_pending_since_pause() {
    let (mut bot, log) = bot_with_log(config());
    enter_long(&mut bot);
    log.drain();

    assert_eq!(bot.pause().unwrap(), BotState::Paused);
    assert_eq!(bot.resume().unwrap(), BotState::Flat);
    assert!(bot.machine().pending().is_none());
    assert_eq!(cancel_intents(&log), 1);
    assert!(matches!(bot.on_order_fill(100.0, 10.0), Err(BotError::NoPendingEntry)));
}

#[test]
fn fill_arriving_during_error_is_managed() {
    let (mut bot, log) = bot_with_log(config());
    enter_long(&mut bot);
    assert_eq!(bot.report_error("order stream lagging").unwrap(), BotState::Error);

    assert_eq!(bot.on_order_fill(100.0, 10.0).unwrap(), BotState::Error);
    assert_eq!(bot.position().unwrap().stop_price(), 98.0);

    let exit = bot.on_bar(&ohlc_bar(5, 99.0, 99.2, 97.5, 97.6)).unwrap();
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(exit.state_before, BotState::Error);
    assert!(bot.position().is_none());

    assert_eq!(bot.clear_error().unwrap(), BotState::Flat);
    assert_eq!(cancel_intents(&log), 0);
}

#[test]
fn clearing_error_withdraws_unfilled_entry() {
    let (mut bot, log) = bot_with_log(config());
    enter_long(&mut bot);
    log.drain();
    bot.report_error("order stream lagging").unwrap();

    assert_eq!(bot.clear_error().unwrap(), BotState::Flat);
    assert!(bot.machine().pending().is_none());
    assert_eq!(cancel_intents(&log), 1);

    // The bot trades again instead of waiting on the withdrawn order.
    let d = bot.on_bar(&trend_bar(5, 100.0)).unwrap();
    assert_eq!(d.action, DecisionAction::Signal);
}

// ── Rule packs ───────────────────────────────────────────────────────

const GATE_PACK: &str = r#"
[metadata]
name = "liquidity"
version = "1.0.0"

[[packs]]
name = "gate"
type = "gate"

[[packs.rules]]
id = "volume_spike"
expression = "volume > 1500"
"#;

#[test]
fn gate_rule_blocks_entry_until_reloaded() {
    let (mut bot, log) = bot_with_log(config());
    bot.reload_rulepack(RulePack::from_toml_str(GATE_PACK).unwrap())
        .unwrap();

    for i in 0..4 {
        assert!(bot.on_bar(&trend_bar(i, 100.0)).is_none());
    }
    assert_eq!(bot.state(), BotState::Flat);
    assert!(log
        .events()
        .iter()
        .any(|e| matches!(e, BotEvent::TradingBlocked { reason } if reason.contains("volume_spike"))));
    assert_eq!(bot.executor().rule_stats()["volume_spike"].matches, 1);

    let relaxed = GATE_PACK.replace("volume > 1500", "volume > 1000000");
    bot.reload_rulepack(RulePack::from_toml_str(&relaxed).unwrap())
        .unwrap();
    let d = bot.on_bar(&trend_bar(4, 100.0)).unwrap();
    assert_eq!(d.action, DecisionAction::Signal);
}

const FATAL_GATE_PACK: &str = r#"
[metadata]
name = "funding"
version = "1.0.0"

[[packs]]
name = "gate"
type = "gate"

[[packs.rules]]
id = "funding_guard"
expression = "funding > 0.05"
severity = "fatal"

[[packs]]
name = "entries"
type = "entry"

[[packs.rules]]
id = "moonshot"
expression = "close > 1000000"
side = "long"
"#;

#[test]
fn fatal_rule_falls_back_to_scorer_for_that_bar_only() {
    let (mut bot, _log) = bot_with_log(config());
    bot.reload_rulepack(RulePack::from_toml_str(FATAL_GATE_PACK).unwrap())
        .unwrap();
    for i in 0..3 {
        bot.on_bar(&trend_bar(i, 100.0));
    }

    // No funding column: the fatal gate errors and the scorer decides.
    let signal = bot.on_bar(&trend_bar(3, 100.0)).unwrap();
    assert_eq!(signal.action, DecisionAction::Signal);
    assert!(!signal.rule_driven);
    let stats = bot.executor().rule_stats();
    assert_eq!(stats["funding_guard"].errors, 1);
    assert!(!stats.contains_key("moonshot"));

    // Funding present: packs run again and the entry pack rejects the signal.
    let d = bot.on_bar(&trend_bar(4, 100.0).with("funding", 0.01)).unwrap();
    assert_eq!(d.action, DecisionAction::Cancel);
    assert_eq!(bot.state(), BotState::Flat);
    assert_eq!(bot.executor().rule_stats()["moonshot"].evaluations, 1);
}

#[test]
fn invalid_reload_keeps_previous_pack() {
    let (mut bot, _log) = bot_with_log(config());
    bot.reload_rulepack(RulePack::from_toml_str(GATE_PACK).unwrap())
        .unwrap();
    let broken = GATE_PACK.replace("volume > 1500", "volume >");
    assert!(bot
        .reload_rulepack(RulePack::from_toml_str(&broken).unwrap())
        .is_err());
    assert_eq!(bot.rulepack().unwrap().metadata.name, "liquidity");
}

#[test]
fn entry_rule_replaces_scorer() {
    let pack = r#"
[metadata]
name = "ema"
version = "1.0.0"

[[packs]]
name = "entries"
type = "entry"

[[packs.rules]]
id = "above_fast_ema"
expression = "close > ema_fast"
side = "long"
"#;
    let (mut bot, _log) = bot_with_log(config());
    bot.reload_rulepack(RulePack::from_toml_str(pack).unwrap())
        .unwrap();
    for i in 0..3 {
        bot.on_bar(&trend_bar(i, 100.0));
    }
    let d = bot.on_bar(&trend_bar(3, 100.0)).unwrap();
    assert_eq!(d.action, DecisionAction::Signal);
    assert!(d.rule_driven);
    assert_eq!(d.score, Some(1.0));
}

#[test]
fn exit_rule_closes_position() {
    let pack = r#"
[metadata]
name = "exits"
version = "1.0.0"

[[packs]]
name = "exits"
type = "exit"

[[packs.rules]]
id = "rsi_fade"
expression = "trade.is_open && rsi > 60"
"#;
    let (mut bot, _log) = filled_long();
    bot.reload_rulepack(RulePack::from_toml_str(pack).unwrap())
        .unwrap();
    let d = bot.on_bar(&trend_bar(5, 100.5)).unwrap();
    assert_eq!(d.action, DecisionAction::Exit);
    assert_eq!(d.exit_reason, Some(ExitReason::RuleExit("rsi_fade".into())));
    assert!(d.rule_driven);
    assert_eq!(bot.state(), BotState::Flat);
}

// ── Session snapshots ────────────────────────────────────────────────

#[test]
fn snapshot_restores_position_and_trailing_stop() {
    let (mut bot, _log) = filled_long();
    bot.on_bar(&ohlc_bar(5, 100.2, 100.5, 100.1, 100.5));
    let adjust = bot.on_bar(&ohlc_bar(6, 100.6, 101.5, 100.5, 101.5)).unwrap();
    assert_eq!(adjust.action, DecisionAction::AdjustStop);

    let text = serde_json::to_string(&bot.snapshot()).unwrap();
    let snapshot: BotSnapshot = serde_json::from_str(&text).unwrap();
    assert_eq!(snapshot, bot.snapshot());

    let (mut resumed, _log) = bot_with_log(config());
    resumed.restore(snapshot).unwrap();
    assert_eq!(resumed.state(), BotState::Manage);
    assert_eq!(resumed.bars_processed(), 7);
    assert_eq!(resumed.regime().regime_type, RegimeType::TrendUp);
    assert_eq!(
        resumed.position().unwrap().stop_price(),
        bot.position().unwrap().stop_price()
    );

    // Both sessions take the same trailed-stop exit.
    let pullback = ohlc_bar(7, 100.6, 100.7, 100.0, 100.1);
    let a = bot.on_bar(&pullback).unwrap();
    let b = resumed.on_bar(&pullback).unwrap();
    assert_eq!(a.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(serde_json::to_value(&a).unwrap(), serde_json::to_value(&b).unwrap());
    assert_eq!(bot.snapshot(), resumed.snapshot());
}

#[test]
fn snapshot_keeps_rule_counters_and_open_signal() {
    let (mut bot, _log) = bot_with_log(config());
    bot.reload_rulepack(RulePack::from_toml_str(FATAL_GATE_PACK).unwrap())
        .unwrap();
    for i in 0..4 {
        bot.on_bar(&trend_bar(i, 100.0));
    }
    assert_eq!(bot.state(), BotState::Signal);

    let (mut resumed, _log) = bot_with_log(config());
    resumed.restore(bot.snapshot()).unwrap();
    assert_eq!(resumed.state(), BotState::Signal);
    assert_eq!(resumed.executor().rule_stats(), bot.executor().rule_stats());
    assert_eq!(resumed.executor().rule_stats()["funding_guard"].errors, 1);

    let quiet_gate = GATE_PACK.replace("1500", "1000000");
    resumed
        .reload_rulepack(RulePack::from_toml_str(&quiet_gate).unwrap())
        .unwrap();
    let enter = resumed.on_bar(&trend_bar(4, 100.0)).unwrap();
    assert_eq!(enter.action, DecisionAction::Enter);
    assert_eq!(
        resumed.machine().pending().map(|p| p.signal_id.0),
        Some(1)
    );
}

#[test]
fn restored_signal_without_its_details_lapses() {
    let (mut bot, _log) = bot_with_log(config());
    for i in 0..4 {
        bot.on_bar(&trend_bar(i, 100.0));
    }
    let mut snapshot = bot.snapshot();
    snapshot.open_signal = None;

    let (mut resumed, _log) = bot_with_log(config());
    resumed.restore(snapshot).unwrap();
    assert_eq!(resumed.state(), BotState::Signal);
    assert!(resumed.on_bar(&trend_bar(4, 100.0)).is_none());
    assert_eq!(resumed.state(), BotState::Flat);
    assert!(resumed.machine().pending().is_none());
}

#[test]
fn snapshot_for_another_symbol_is_rejected() {
    let (bot, _log) = filled_long();
    let mut other = TradingBot::new("BTCUSDT", config()).unwrap();
    assert!(matches!(
        other.restore(bot.snapshot()),
        Err(BotError::SymbolMismatch { .. })
    ));
    assert_eq!(other.state(), BotState::Flat);
}

// ── Audit output ─────────────────────────────────────────────────────

#[test]
fn decisions_serialize_for_audit() {
    let (mut bot, _log) = bot_with_log(config());
    for i in 0..4 {
        bot.on_bar(&trend_bar(i, 100.0));
    }
    let enter = bot.on_bar(&trend_bar(4, 100.0)).unwrap();
    let json = serde_json::to_value(&enter).unwrap();
    assert_eq!(json["action"], "ENTER");
    assert_eq!(json["state_before"], "SIGNAL");
    assert_eq!(json["state_after"], "WAITING_FILL");
    assert_eq!(json["side"], "long");
    assert_eq!(json["regime"], "TREND_UP");
    assert_eq!(json["order_intent"]["purpose"], "entry");

    let history = bot.machine().history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].timestamp, ts(4));
}

#[test]
fn bars_for_other_symbols_are_ignored() {
    let (mut bot, _log) = bot_with_log(config());
    let foreign = FeatureVector::new("BTCUSDT", ts(0), 1.0, 1.0, 1.0, 1.0, 1.0);
    assert!(bot.on_bar(&foreign).is_none());
    assert_eq!(bot.bars_processed(), 0);
}

#[test]
fn warmup_from_history_skips_warmup_bars() {
    let (mut bot, _log) = bot_with_log(config());
    let history: Vec<_> = (0..3).map(|i| trend_bar(i, 100.0)).collect();
    assert_eq!(bot.warmup_from_history(&history), 3);
    assert!(!bot.is_warming_up());
    assert_eq!(bot.regime().regime_type, RegimeType::TrendUp);
    assert_eq!(
        bot.on_bar(&trend_bar(3, 100.0)).map(|d| d.action),
        Some(DecisionAction::Signal)
    );
}

#[test]
fn demo_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../demos/bot.toml");
    let cfg = BotConfig::load(&path).unwrap();
    assert_eq!(cfg.warmup_bars, 50);
    assert_eq!(cfg.trailing.mode, TrailingMode::Atr { multiple: 2.0 });
    assert!(TradingBot::new("BTCUSDT", cfg).is_ok());
}
