//! Embedded expression language.
//!
//! Source text is parsed once into an [`Expr`], wrapped in an immutable
//! [`Program`] and cached by content hash. Programs evaluate against a
//! [`RuleContext`] to a tagged [`Value`].

pub mod ast;
pub mod cache;
pub mod context;
pub mod engine;
pub mod error;
pub mod eval;
pub mod functions;
pub mod parser;
pub mod value;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use cache::{CacheStats, ProgramCache, DEFAULT_CACHE_CAPACITY};
pub use context::{RuleContext, RuleContextBuilder};
pub use engine::{Program, RuleEngine};
pub use error::{CompileError, EvalError, ParseError, RuleError};
pub use functions::Function;
pub use parser::parse;
pub use value::Value;
