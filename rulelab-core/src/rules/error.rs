//! Rule engine error types.

use thiserror::Error;

/// A parse error with the byte offset where parsing stopped.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    pub(crate) fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    /// The input with a caret under the error position.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!("{input}\n{caret}\n{self}")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown function '{name}' at position {position}")]
    UnknownFunction { name: String, position: usize },

    #[error("function '{name}' expects {expected} argument(s), got {found}")]
    Arity {
        name: &'static str,
        expected: String,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("type error in '{op}': expected {expected}, found {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("null operand in '{op}'")]
    NullOperand { op: &'static str },

    #[error("division by zero")]
    DivisionByZero,

    #[error("invalid argument to '{function}': {reason}")]
    InvalidArgument {
        function: &'static str,
        reason: String,
    },
}

/// Either phase of running an expression from source text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}
