//! RulePack executor - walks packs in type order and folds rule results.
//!
//! Pack semantics:
//! - gate: match-any, a match (or an error) blocks new entries
//! - entry: first match wins, later entry rules and packs are skipped
//! - exit / risk: match-any, every enabled rule is evaluated
//! - trailing: numeric results are stop candidates, gated by the ratchet
//!
//! A rule error never aborts its pack unless the rule is `fatal`. A fatal
//! error stops the rest of the bar and marks the summary as aborted.

use super::stats::{most_triggered, RuleStats, StatsSnapshot};
use super::{Pack, PackType, Rule, RulePack, Severity};
use crate::domain::Side;
use crate::rules::{RuleContext, RuleEngine, Value};
use crate::trailing::enforce_monotonic_stop;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackEvalState {
    NotEvaluated,
    Matched,
    NotMatched,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RuleOutcome {
    Matched,
    NotMatched,
    Disabled,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub severity: Severity,
    pub outcome: RuleOutcome,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackResult {
    pub name: String,
    pub pack_type: PackType,
    pub state: PackEvalState,
    pub rules: Vec<RuleResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMatch {
    pub rule_id: String,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFailure {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

/// Everything one bar's rule evaluation produced. Never reused across bars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub packs: Vec<PackResult>,
    /// Gate rules that matched or failed.
    pub gate_blocks: Vec<String>,
    pub entry: Option<EntryMatch>,
    /// Exit rules that matched, in evaluation order.
    pub exits: Vec<String>,
    pub risk_flags: Vec<String>,
    /// Tightest trailing candidate after the monotonic gate, if it moves the stop.
    pub trailing_stop: Option<f64>,
    pub trailing_rule: Option<String>,
    /// Id of the fatal rule that aborted the bar.
    pub aborted: Option<String>,
    pub errors: Vec<RuleFailure>,
}

impl ExecutionSummary {
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn gate_blocked(&self) -> bool {
        !self.gate_blocks.is_empty()
    }

    /// No gate or risk rule objects to a new entry.
    pub fn entry_allowed(&self) -> bool {
        self.gate_blocks.is_empty() && self.risk_flags.is_empty()
    }

    pub fn exit_rule(&self) -> Option<&str> {
        self.exits.first().map(String::as_str)
    }

    pub fn pack_state(&self, name: &str) -> PackEvalState {
        self.packs
            .iter()
            .find(|p| p.name == name)
            .map_or(PackEvalState::NotEvaluated, |p| p.state)
    }
}

/// Stateless with respect to bars apart from the session rule counters.
#[derive(Debug, Clone, Default)]
pub struct RulePackExecutor {
    engine: RuleEngine,
    stats: BTreeMap<String, RuleStats>,
}

/// Per-rule evaluation result before it is folded into the pack.
enum Eval {
    Value(Value),
    Failed(String),
}

impl RulePackExecutor {
    pub fn new(engine: RuleEngine) -> Self {
        Self {
            engine,
            stats: BTreeMap::new(),
        }
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Evaluate the packs of `rulepack` whose type is in `pack_types`
    /// (all types when empty) against `ctx`.
    ///
    /// Trailing candidates are gated against `trade.stop_price` for the
    /// side in `trade.side`; without an open position they are ignored.
    pub fn execute(&mut self, rulepack: &RulePack, ctx: &RuleContext, pack_types: &[PackType]) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        let position = open_position(ctx);
        let mut best_stop = position.map(|(_, stop)| stop);

        for pack in rulepack.ordered_packs() {
            let selected = pack_types.is_empty() || pack_types.contains(&pack.pack_type);
            let skip_entry = pack.pack_type == PackType::Entry && summary.entry.is_some();
            if !selected || skip_entry || summary.is_aborted() {
                summary.packs.push(PackResult {
                    name: pack.name.clone(),
                    pack_type: pack.pack_type,
                    state: PackEvalState::NotEvaluated,
                    rules: Vec::new(),
                });
                continue;
            }
            let result = self.run_pack(pack, ctx, position, &mut best_stop, &mut summary);
            summary.packs.push(result);
        }

        if let (Some((_, current)), Some(best)) = (position, best_stop) {
            if best != current {
                summary.trailing_stop = Some(best);
            }
        }
        summary
    }

    fn run_pack(
        &mut self,
        pack: &Pack,
        ctx: &RuleContext,
        position: Option<(Side, f64)>,
        best_stop: &mut Option<f64>,
        summary: &mut ExecutionSummary,
    ) -> PackResult {
        let mut rules = Vec::with_capacity(pack.rules.len());
        let mut any_match = false;
        let mut any_error = false;

        for rule in &pack.rules {
            if !rule.enabled {
                rules.push(RuleResult {
                    rule_id: rule.id.clone(),
                    severity: rule.severity,
                    outcome: RuleOutcome::Disabled,
                    value: None,
                });
                continue;
            }

            let started = Instant::now();
            let eval = self.evaluate(rule, pack.pack_type, ctx);
            let elapsed = started.elapsed();

            let (outcome, value) = match eval {
                Eval::Failed(message) => {
                    any_error = true;
                    summary.errors.push(RuleFailure {
                        rule_id: rule.id.clone(),
                        severity: rule.severity,
                        message: message.clone(),
                    });
                    if pack.pack_type == PackType::Gate {
                        // Unknown gate state blocks entries.
                        summary.gate_blocks.push(rule.id.clone());
                    }
                    (RuleOutcome::Error(message), None)
                }
                Eval::Value(v) => {
                    let matched = self.fold_match(rule, pack.pack_type, &v, position, best_stop, summary);
                    any_match |= matched;
                    let outcome = if matched {
                        RuleOutcome::Matched
                    } else {
                        RuleOutcome::NotMatched
                    };
                    (outcome, Some(v))
                }
            };

            let matched = outcome == RuleOutcome::Matched;
            let errored = matches!(outcome, RuleOutcome::Error(_));
            self.stats
                .entry(rule.id.clone())
                .or_default()
                .record(matched, errored, elapsed);
            rules.push(RuleResult {
                rule_id: rule.id.clone(),
                severity: rule.severity,
                outcome,
                value,
            });

            if errored && rule.severity.is_fatal() {
                warn!(rule = %rule.id, pack = %pack.name, "fatal rule error, aborting remaining packs");
                summary.aborted = Some(rule.id.clone());
                break;
            }
            if matched && pack.pack_type == PackType::Entry {
                break;
            }
        }

        let state = if any_match {
            PackEvalState::Matched
        } else if any_error {
            PackEvalState::Error
        } else {
            PackEvalState::NotMatched
        };
        PackResult {
            name: pack.name.clone(),
            pack_type: pack.pack_type,
            state,
            rules,
        }
    }

    fn evaluate(&self, rule: &Rule, pack_type: PackType, ctx: &RuleContext) -> Eval {
        let value = match self.engine.evaluate(&rule.expression, ctx) {
            Ok(v) => v,
            Err(err) => {
                debug!(rule = %rule.id, error = %err, "rule evaluation error");
                return Eval::Failed(err.to_string());
            }
        };
        match (pack_type, &value) {
            (PackType::Trailing, Value::Number(_) | Value::Null) => Eval::Value(value),
            (PackType::Trailing, other) => Eval::Failed(format!(
                "trailing rule must yield a number or null, got {}",
                other.type_name()
            )),
            (_, Value::Bool(_)) => Eval::Value(value),
            (_, other) => Eval::Failed(format!("rule must yield a bool, got {}", other.type_name())),
        }
    }

    /// Record a successful evaluation in the summary. Returns whether it matched.
    fn fold_match(
        &self,
        rule: &Rule,
        pack_type: PackType,
        value: &Value,
        position: Option<(Side, f64)>,
        best_stop: &mut Option<f64>,
        summary: &mut ExecutionSummary,
    ) -> bool {
        if pack_type == PackType::Trailing {
            let (Value::Number(candidate), Some((side, _))) = (value, position) else {
                return false;
            };
            let current = best_stop.unwrap_or(*candidate);
            let effective = enforce_monotonic_stop(side, current, *candidate);
            if effective != current {
                *best_stop = Some(effective);
                summary.trailing_rule = Some(rule.id.clone());
            }
            return true;
        }

        if value != &Value::Bool(true) {
            return false;
        }
        match pack_type {
            PackType::Gate => summary.gate_blocks.push(rule.id.clone()),
            PackType::Entry => {
                if let Some(side) = rule.side {
                    summary.entry = Some(EntryMatch {
                        rule_id: rule.id.clone(),
                        side,
                    });
                }
            }
            PackType::Exit => summary.exits.push(rule.id.clone()),
            PackType::Risk => summary.risk_flags.push(rule.id.clone()),
            PackType::Trailing => {}
        }
        true
    }

    // ─── Stats ──────────────────────────────────────────────────────────

    pub fn rule_stats(&self) -> StatsSnapshot {
        self.stats.clone()
    }

    pub fn restore_stats(&mut self, snapshot: StatsSnapshot) {
        self.stats = snapshot;
    }

    pub fn clear_stats(&mut self) {
        self.stats.clear();
    }

    pub fn most_triggered(&self, n: usize) -> Vec<(String, RuleStats)> {
        most_triggered(&self.stats, n)
    }
}

/// Open position side and stop from the `trade.*` namespace.
fn open_position(ctx: &RuleContext) -> Option<(Side, f64)> {
    let side = ctx.get("trade.side").and_then(Value::as_str).and_then(Side::parse)?;
    let stop = ctx.get("trade.stop_price").and_then(Value::as_f64)?;
    Some((side, stop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rulepack::Metadata;

    fn rule(id: &str, expression: &str) -> Rule {
        Rule {
            id: id.into(),
            expression: expression.into(),
            severity: Severity::Warning,
            enabled: true,
            side: None,
            description: None,
        }
    }

    fn pack(name: &str, pack_type: PackType, rules: Vec<Rule>) -> Pack {
        Pack {
            name: name.into(),
            pack_type,
            rules,
        }
    }

    fn rulepack(packs: Vec<Pack>) -> RulePack {
        RulePack {
            metadata: Metadata {
                name: "test".into(),
                version: "1".into(),
                description: String::new(),
            },
            packs,
        }
    }

    fn ctx(close: f64) -> RuleContext {
        let mut c = RuleContext::new();
        c.insert("features.close", close);
        c.insert("features.rsi", 55.0);
        c
    }

    #[test]
    fn entry_first_match_wins() {
        let mut long = rule("long_a", "close > 100");
        long.side = Some(Side::Long);
        let mut long_b = rule("long_b", "close > 50");
        long_b.side = Some(Side::Long);
        let rp = rulepack(vec![pack("entries", PackType::Entry, vec![long, long_b])]);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &ctx(105.0), &[]);
        assert_eq!(s.entry.as_ref().unwrap().rule_id, "long_a");
        // Second rule never ran.
        assert_eq!(s.packs[0].rules.len(), 1);
        assert_eq!(exec.rule_stats().get("long_b"), None);
    }

    #[test]
    fn exit_pack_is_match_any() {
        let rp = rulepack(vec![pack(
            "exits",
            PackType::Exit,
            vec![rule("a", "close > 100"), rule("b", "rsi > 90"), rule("c", "rsi > 50")],
        )]);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &ctx(105.0), &[]);
        assert_eq!(s.exits, vec!["a", "c"]);
        assert_eq!(s.packs[0].rules.len(), 3);
        assert_eq!(s.pack_state("exits"), PackEvalState::Matched);
    }

    #[test]
    fn gate_error_blocks_entries() {
        let rp = rulepack(vec![pack("gate", PackType::Gate, vec![rule("g", "missing > 1")])]);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &ctx(105.0), &[]);
        assert!(s.gate_blocked());
        assert!(!s.entry_allowed());
        assert_eq!(s.pack_state("gate"), PackEvalState::Error);
        assert_eq!(exec.rule_stats()["g"].errors, 1);
    }

    #[test]
    fn non_bool_result_is_error() {
        let rp = rulepack(vec![pack("risk", PackType::Risk, vec![rule("r", "close + 1")])]);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &ctx(105.0), &[]);
        assert_eq!(s.errors.len(), 1);
        assert!(s.risk_flags.is_empty());
    }

    #[test]
    fn fatal_aborts_remaining_packs() {
        let mut fatal = rule("f", "missing > 1");
        fatal.severity = Severity::Fatal;
        let rp = rulepack(vec![
            pack("gate", PackType::Gate, vec![fatal, rule("after", "true")]),
            pack("exits", PackType::Exit, vec![rule("x", "true")]),
        ]);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &ctx(105.0), &[]);
        assert_eq!(s.aborted.as_deref(), Some("f"));
        assert!(s.exits.is_empty());
        assert_eq!(s.packs[0].rules.len(), 1);
        assert_eq!(s.pack_state("exits"), PackEvalState::NotEvaluated);
    }

    #[test]
    fn pack_type_filter() {
        let rp = rulepack(vec![
            pack("gate", PackType::Gate, vec![rule("g", "true")]),
            pack("exits", PackType::Exit, vec![rule("x", "true")]),
        ]);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &ctx(105.0), &[PackType::Exit]);
        assert!(!s.gate_blocked());
        assert_eq!(s.exits, vec!["x"]);
        assert_eq!(s.pack_state("gate"), PackEvalState::NotEvaluated);
    }

    #[test]
    fn trailing_candidates_are_ratcheted() {
        let rp = rulepack(vec![pack(
            "trail",
            PackType::Trailing,
            vec![rule("loose", "95"), rule("tight", "99.5"), rule("none", "null")],
        )]);
        let mut c = ctx(101.0);
        c.insert("trade.side", "long");
        c.insert("trade.stop_price", 98.0);
        let mut exec = RulePackExecutor::default();
        let s = exec.execute(&rp, &c, &[]);
        assert_eq!(s.trailing_stop, Some(99.5));
        assert_eq!(s.trailing_rule.as_deref(), Some("tight"));

        let only_loose = rulepack(vec![pack("trail", PackType::Trailing, vec![rule("loose", "95")])]);
        let s = exec.execute(&only_loose, &c, &[]);
        assert_eq!(s.trailing_stop, None);
    }

    #[test]
    fn stats_snapshot_roundtrip() {
        let rp = rulepack(vec![pack("exits", PackType::Exit, vec![rule("a", "close > 100")])]);
        let mut exec = RulePackExecutor::default();
        for close in [99.0, 101.0, 102.0] {
            exec.execute(&rp, &ctx(close), &[]);
        }
        let snap = exec.rule_stats();
        assert_eq!(snap["a"].evaluations, 3);
        assert_eq!(snap["a"].matches, 2);

        let json = serde_json::to_string(&snap).unwrap();
        let mut fresh = RulePackExecutor::default();
        fresh.restore_stats(serde_json::from_str(&json).unwrap());
        assert_eq!(fresh.rule_stats(), snap);
        assert_eq!(fresh.most_triggered(1)[0].0, "a");

        fresh.clear_stats();
        assert!(fresh.rule_stats().is_empty());
    }
}
