//! Compiled programs and the engine facade over the shared cache.

use super::ast::Expr;
use super::cache::{program_hash, CacheStats, ProgramCache, ProgramHash};
use super::context::RuleContext;
use super::error::{CompileError, EvalError, RuleError};
use super::eval::eval;
use super::parser::parse;
use super::value::Value;
use std::sync::Arc;
use tracing::warn;

/// An immutable compiled expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    source: String,
    hash: ProgramHash,
    expr: Expr,
}

impl Program {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let expr = parse(source)?;
        Ok(Self {
            source: source.to_string(),
            hash: program_hash(source),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn hash_hex(&self) -> String {
        blake3::Hash::from(self.hash).to_hex().to_string()
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn variables(&self) -> Vec<&str> {
        self.expr.variables()
    }

    pub fn evaluate(&self, ctx: &RuleContext) -> Result<Value, EvalError> {
        eval(&self.expr, ctx)
    }
}

/// Compile-and-evaluate facade. Cheap to clone; clones share the cache.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    cache: Arc<ProgramCache>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(Arc::new(ProgramCache::default()))
    }
}

impl RuleEngine {
    pub fn new(cache: Arc<ProgramCache>) -> Self {
        Self { cache }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(ProgramCache::shared(capacity))
    }

    pub fn cache(&self) -> &Arc<ProgramCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn compile(&self, expr: &str) -> Result<Arc<Program>, CompileError> {
        self.cache.get_or_compile(expr)
    }

    /// Compile (cached) and evaluate. Pure with respect to `ctx`.
    pub fn evaluate(&self, expr: &str, ctx: &RuleContext) -> Result<Value, RuleError> {
        let program = self.compile(expr)?;
        Ok(program.evaluate(ctx)?)
    }

    /// Never fails: any compile or evaluation error is logged and `default` returned.
    pub fn evaluate_safe(&self, expr: &str, ctx: &RuleContext, default: Value) -> Value {
        match self.evaluate(expr, ctx) {
            Ok(v) => v,
            Err(err) => {
                warn!(expr, error = %err, "expression evaluation failed, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RuleContext {
        let mut c = RuleContext::new();
        c.insert("features.close", 105.0);
        c.insert("features.highest_20", 100.0);
        c.insert("features.volume", 2_000.0);
        c.insert("features.avg_volume_20", 1_000.0);
        c
    }

    #[test]
    fn breakout_matches() {
        let engine = RuleEngine::default();
        let v = engine
            .evaluate("close > highest_20 && volume > avg_volume_20 * 1.5", &ctx())
            .unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn evaluate_safe_returns_default() {
        let engine = RuleEngine::default();
        assert_eq!(
            engine.evaluate_safe("close / 0", &ctx(), Value::Bool(false)),
            Value::Bool(false)
        );
        assert_eq!(
            engine.evaluate_safe("close >", &ctx(), Value::Null),
            Value::Null
        );
    }

    #[test]
    fn clones_share_cache() {
        let a = RuleEngine::with_capacity(4);
        let b = a.clone();
        a.compile("close > 1").unwrap();
        b.compile("close > 1").unwrap();
        assert_eq!(a.cache_stats().misses, 1);
        assert_eq!(b.cache_stats().hits, 1);
    }

    #[test]
    fn program_metadata() {
        let p = Program::compile("close > highest_20").unwrap();
        assert_eq!(p.source(), "close > highest_20");
        assert_eq!(p.variables(), vec!["features.close", "features.highest_20"]);
        assert_eq!(p.hash_hex().len(), 64);
    }
}
