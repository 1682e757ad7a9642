//! Feature replay - drive independent bots from per-symbol feature CSVs.
//!
//! CSV layout: `symbol,timestamp,open,high,low,close,volume` followed by any
//! number of indicator columns. Timestamps are RFC 3339. Empty indicator
//! cells mean "not available".
//!
//! There is no exchange here: an entry still pending when the next bar
//! arrives is paper-filled at that bar's open.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rulelab_core::domain::{BotDecision, DecisionAction, FeatureVector};
use rulelab_core::rulepack::{RulePackHandle, RuleStats, StatsSnapshot};
use rulelab_core::rules::{ProgramCache, RuleEngine};
use rulelab_core::{BotConfig, BotState, TradingBot};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const REQUIRED: [&str; 7] = ["symbol", "timestamp", "open", "high", "low", "close", "volume"];

/// Outcome of replaying one symbol.
#[derive(Debug)]
pub struct SymbolReplay {
    pub symbol: String,
    pub bars: usize,
    pub decisions: Vec<BotDecision>,
    pub fills: usize,
    pub final_state: BotState,
    pub stats: StatsSnapshot,
}

/// Read one feature CSV file.
pub fn load_features(path: &Path) -> Result<Vec<FeatureVector>> {
    let file = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_features(file).with_context(|| format!("reading {}", path.display()))
}

pub fn read_features(reader: impl Read) -> Result<Vec<FeatureVector>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = rdr.headers()?.clone();

    let mut column = BTreeMap::new();
    for (i, name) in headers.iter().enumerate() {
        column.insert(name.to_string(), i);
    }
    for name in REQUIRED {
        if !column.contains_key(name) {
            bail!("missing required column '{name}'");
        }
    }
    let indicators: Vec<(usize, &str)> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| !REQUIRED.contains(h))
        .collect();

    let mut out = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record?;
        let line = row + 2;
        let field = |name: &str| record.get(column[name]).unwrap_or("");
        let number = |name: &str| -> Result<f64> {
            field(name)
                .parse::<f64>()
                .with_context(|| format!("line {line}: column '{name}' is not a number"))
        };

        let timestamp = DateTime::parse_from_rfc3339(field("timestamp"))
            .with_context(|| format!("line {line}: bad timestamp"))?
            .with_timezone(&Utc);
        let mut fv = FeatureVector::new(
            field("symbol"),
            timestamp,
            number("open")?,
            number("high")?,
            number("low")?,
            number("close")?,
            number("volume")?,
        );
        for &(i, name) in &indicators {
            let raw = record.get(i).unwrap_or("");
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw
                .parse()
                .with_context(|| format!("line {line}: column '{name}' is not a number"))?;
            fv = fv.with(name, value);
        }
        out.push(fv);
    }
    Ok(out)
}

/// Split bars by symbol, each series sorted by time.
pub fn group_by_symbol(bars: Vec<FeatureVector>) -> BTreeMap<String, Vec<FeatureVector>> {
    let mut grouped: BTreeMap<String, Vec<FeatureVector>> = BTreeMap::new();
    for bar in bars {
        grouped.entry(bar.symbol.clone()).or_default().push(bar);
    }
    for series in grouped.values_mut() {
        series.sort_by_key(|b| b.timestamp);
    }
    grouped
}

/// Replay every symbol on its own bot, in parallel. All bots share one
/// program cache and one rule pack slot.
pub fn replay_all(
    series: BTreeMap<String, Vec<FeatureVector>>,
    config: &BotConfig,
    rulepack: &RulePackHandle,
) -> Result<Vec<SymbolReplay>> {
    let cache = ProgramCache::shared(config.rules.cache_capacity);
    info!(symbols = series.len(), "replay starting");

    let results: Result<Vec<SymbolReplay>> = series
        .into_par_iter()
        .map(|(symbol, bars)| {
            let engine = RuleEngine::new(Arc::clone(&cache));
            let bot = TradingBot::with_engine(symbol.as_str(), config.clone(), engine)
                .with_context(|| format!("building bot for {symbol}"))?
                .with_rulepack_handle(rulepack.clone());
            Ok(replay_symbol(bot, &bars))
        })
        .collect();

    let stats = cache.stats();
    debug!(hits = stats.hits, misses = stats.misses, programs = stats.len, "program cache");
    results
}

fn replay_symbol(mut bot: TradingBot, bars: &[FeatureVector]) -> SymbolReplay {
    let mut decisions = Vec::new();
    let mut fills = 0;
    let mut pending_qty: Option<f64> = None;

    for bar in bars {
        if let Some(qty) = pending_qty.take() {
            if bot.state() == BotState::WaitingFill {
                match bot.on_order_fill(bar.open, qty) {
                    Ok(_) => fills += 1,
                    Err(err) => warn!(symbol = %bot.symbol(), %err, "paper fill rejected"),
                }
            }
        }
        if let Some(decision) = bot.on_bar(bar) {
            if decision.action == DecisionAction::Enter {
                pending_qty = decision.order_intent.as_ref().map(|i| i.quantity_hint);
            }
            decisions.push(decision);
        }
    }

    info!(
        symbol = %bot.symbol(),
        bars = bars.len(),
        decisions = decisions.len(),
        fills,
        state = %bot.state(),
        "replay finished"
    );
    SymbolReplay {
        symbol: bot.symbol().to_string(),
        bars: bars.len(),
        decisions,
        fills,
        final_state: bot.state(),
        stats: bot.executor().rule_stats(),
    }
}

/// Sum per-rule counters across symbols.
pub fn merge_stats<'a>(replays: impl IntoIterator<Item = &'a SymbolReplay>) -> StatsSnapshot {
    let mut total = StatsSnapshot::new();
    for r in replays {
        for (id, s) in &r.stats {
            total.entry(id.clone()).or_insert_with(RuleStats::default).merge(s);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use rulelab_core::domain::keys;

    const CSV: &str = "\
symbol,timestamp,open,high,low,close,volume,adx,rsi
ETHUSDT,2024-05-01T01:00:00Z,100,101,99,100.5,1000,30,
ETHUSDT,2024-05-01T00:00:00Z,99,100,98,99.5,900,28,55
BTCUSDT,2024-05-01T00:00:00Z,60000,60100,59900,60050,12,,61
";

    #[test]
    fn parses_required_and_optional_columns() {
        let bars = read_features(CSV.as_bytes()).unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].symbol, "ETHUSDT");
        assert_eq!(bars[0].close, 100.5);
        assert_eq!(bars[0].get(keys::ADX), Some(30.0));
        assert_eq!(bars[0].get(keys::RSI), None);
        assert_eq!(bars[2].get(keys::ADX), None);
    }

    #[test]
    fn groups_and_sorts_by_time() {
        let grouped = group_by_symbol(read_features(CSV.as_bytes()).unwrap());
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["BTCUSDT", "ETHUSDT"]);
        let eth = &grouped["ETHUSDT"];
        assert!(eth[0].timestamp < eth[1].timestamp);
    }

    #[test]
    fn missing_column_is_reported() {
        let err = read_features("symbol,timestamp,open\n".as_bytes()).unwrap_err();
        assert!(err.to_string().contains("high"));
    }

    #[test]
    fn bad_number_names_line_and_column() {
        let csv = "symbol,timestamp,open,high,low,close,volume\nX,2024-05-01T00:00:00Z,1,1,1,oops,1\n";
        let err = read_features(csv.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("line 2: column 'close'"));
    }

    #[test]
    fn replay_runs_each_symbol() {
        let grouped = group_by_symbol(read_features(CSV.as_bytes()).unwrap());
        let results = replay_all(grouped, &BotConfig::default(), &RulePackHandle::default()).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.final_state == BotState::Flat || r.final_state == BotState::Signal));
        assert_eq!(results.iter().map(|r| r.bars).sum::<usize>(), 3);
    }
}
