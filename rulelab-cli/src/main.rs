//! RuleLab CLI - rule pack checks, expression evaluation and feature replay.
//!
//! Commands:
//! - `check-pack` - load and validate a rule pack, print a summary
//! - `eval` - evaluate one expression against `--var` bindings
//! - `replay` - run feature CSVs through one bot per symbol, print decisions as JSON lines

mod replay;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rulelab_core::rulepack::{most_triggered, RulePack, RulePackHandle, StatsSnapshot};
use rulelab_core::rules::{RuleContext, RuleEngine, Value};
use rulelab_core::BotConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rulelab", about = "RuleLab CLI - rule-driven trading decision core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a rule pack (TOML or JSON).
    CheckPack {
        /// Path to the rule pack file.
        file: PathBuf,
    },
    /// Evaluate an expression.
    Eval {
        /// Expression text, e.g. "close > highest_20 && rsi < 70".
        expr: String,

        /// Variable binding `name=value`. Bare names go under `features.`.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
    },
    /// Replay feature CSVs through one bot per symbol.
    Replay {
        /// Feature CSV files (symbol,timestamp,open,high,low,close,volume,...).
        #[arg(long = "features", required = true, num_args = 1..)]
        features: Vec<PathBuf>,

        /// Bot configuration TOML. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Rule pack file. Overrides `rules.rulepack_path` from the config.
        #[arg(long)]
        rulepack: Option<PathBuf>,

        /// Number of rules to list in the closing stats table.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckPack { file } => run_check_pack(file),
        Commands::Eval { expr, vars } => run_eval(&expr, &vars),
        Commands::Replay {
            features,
            config,
            rulepack,
            top,
        } => run_replay(features, config, rulepack, top),
    }
}

/// JSON logs when `RUST_ENV=production`, pretty logs otherwise. Logs go to
/// stderr so stdout stays machine-readable.
fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rulelab=debug"));

    let is_production = std::env::var("RUST_ENV")
        .map(|v| v == "production")
        .unwrap_or(false);

    if is_production {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn run_check_pack(file: PathBuf) -> Result<()> {
    let engine = RuleEngine::default();
    let pack = RulePack::load_validated(&file, &engine)
        .with_context(|| format!("rule pack {} is invalid", file.display()))?;

    println!("Pack:     {} {}", pack.metadata.name, pack.metadata.version);
    if !pack.metadata.description.is_empty() {
        println!("About:    {}", pack.metadata.description);
    }
    println!("Rules:    {}", pack.rule_count());
    println!();
    println!("{:<10} {:<20} {:>6} {:>9}", "Type", "Pack", "Rules", "Enabled");
    println!("{}", "-".repeat(48));
    for p in pack.ordered_packs() {
        let enabled = p.rules.iter().filter(|r| r.enabled).count();
        println!(
            "{:<10} {:<20} {:>6} {:>9}",
            p.pack_type.as_str(),
            p.name,
            p.rules.len(),
            enabled
        );
    }
    Ok(())
}

fn run_eval(expr: &str, vars: &[String]) -> Result<()> {
    let ctx = parse_vars(vars)?;
    let engine = RuleEngine::default();
    let value = engine
        .evaluate(expr, &ctx)
        .with_context(|| format!("evaluating '{expr}'"))?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}

fn parse_vars(vars: &[String]) -> Result<RuleContext> {
    let mut ctx = RuleContext::new();
    for raw in vars {
        let Some((name, value)) = raw.split_once('=') else {
            bail!("--var expects NAME=VALUE, got '{raw}'");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("--var has an empty name: '{raw}'");
        }
        let key = if name.contains('.') {
            name.to_string()
        } else {
            format!("features.{name}")
        };
        ctx.insert(key, Value::parse_literal(value));
    }
    Ok(ctx)
}

fn run_replay(
    feature_files: Vec<PathBuf>,
    config_path: Option<PathBuf>,
    rulepack_path: Option<PathBuf>,
    top: usize,
) -> Result<()> {
    let mut config = match &config_path {
        Some(path) => BotConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => BotConfig::default(),
    };

    // The pack is loaded once here and shared; bots must not load it again.
    let pack_path = rulepack_path.or_else(|| config.rules.rulepack_path.take());
    let handle = match pack_path {
        Some(path) => {
            let engine = RuleEngine::with_capacity(config.rules.cache_capacity);
            let pack = RulePack::load_validated(&path, &engine)
                .with_context(|| format!("rule pack {} is invalid", path.display()))?;
            RulePackHandle::new(Some(pack))
        }
        None => RulePackHandle::default(),
    };

    let mut bars = Vec::new();
    for path in &feature_files {
        bars.extend(replay::load_features(path)?);
    }
    let series = replay::group_by_symbol(bars);
    if series.is_empty() {
        bail!("no bars found in {} file(s)", feature_files.len());
    }

    let results = replay::replay_all(series, &config, &handle)?;

    let mut decisions: Vec<_> = results.iter().flat_map(|r| r.decisions.iter()).collect();
    decisions.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.symbol.cmp(&b.symbol)));
    for d in decisions {
        println!("{}", serde_json::to_string(d)?);
    }

    eprintln!();
    eprintln!("=== Replay Summary ===");
    eprintln!("{:<12} {:>8} {:>10} {:>6} {:>13}", "Symbol", "Bars", "Decisions", "Fills", "Final State");
    eprintln!("{}", "-".repeat(53));
    for r in &results {
        eprintln!(
            "{:<12} {:>8} {:>10} {:>6} {:>13}",
            r.symbol,
            r.bars,
            r.decisions.len(),
            r.fills,
            r.final_state.as_str()
        );
    }

    let stats = replay::merge_stats(&results);
    if !stats.is_empty() {
        print_rule_stats(&stats, top);
    }
    Ok(())
}

fn print_rule_stats(stats: &StatsSnapshot, top: usize) {
    let errors: u64 = stats.values().map(|s| s.errors).sum();
    eprintln!();
    eprintln!("--- Rules ({} tracked, {errors} errors) ---", stats.len());
    eprintln!("{:<24} {:>8} {:>8} {:>7} {:>10}", "Rule", "Evals", "Matches", "Errors", "Mean us");
    for (id, s) in most_triggered(stats, top) {
        eprintln!(
            "{:<24} {:>8} {:>8} {:>7} {:>10.2}",
            id,
            s.evaluations,
            s.matches,
            s.errors,
            s.mean_eval_micros()
        );
    }
}
