//! AST interpreter.
//!
//! Evaluation is pure: it reads the context and never mutates it. Operators
//! are strict about tags. `&&` and `||` short-circuit and require booleans;
//! ordering comparisons and arithmetic reject null operands, so a missing
//! feature surfaces as an error instead of a silent `false`.

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::context::RuleContext;
use super::error::EvalError;
use super::value::Value;
use std::cmp::Ordering;

pub fn eval(expr: &Expr, ctx: &RuleContext) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(name) => Ok(ctx.get(name).cloned().unwrap_or(Value::Null)),
        Expr::List(items) => items
            .iter()
            .map(|e| eval(e, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        Expr::Unary { op, expr } => {
            let v = eval(expr, ctx)?;
            match (op, v) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Number(n)) => Ok(Value::Number(-n)),
                (UnaryOp::Not, Value::Null) => Err(EvalError::NullOperand { op: "!" }),
                (UnaryOp::Neg, Value::Null) => Err(EvalError::NullOperand { op: "-" }),
                (UnaryOp::Not, other) => Err(mismatch("!", "bool", &other)),
                (UnaryOp::Neg, other) => Err(mismatch("-", "number", &other)),
            }
        }
        Expr::And(lhs, rhs) => {
            if !boolean("&&", eval(lhs, ctx)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(boolean("&&", eval(rhs, ctx)?)?))
        }
        Expr::Or(lhs, rhs) => {
            if boolean("||", eval(lhs, ctx)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(boolean("||", eval(rhs, ctx)?)?))
        }
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if boolean("?:", eval(cond, ctx)?)? {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            binary(*op, l, r)
        }
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|e| eval(e, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            func.call(values)
        }
    }
}

fn binary(op: BinaryOp, l: Value, r: Value) -> Result<Value, EvalError> {
    let sym = op.symbol();
    match op {
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::In => membership(l, r).map(Value::Bool),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = compare(sym, &l, &r)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(a + &b)),
            (l, r) => {
                let (a, b) = numbers(sym, &l, &r)?;
                Ok(Value::Number(a + b))
            }
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = numbers(sym, &l, &r)?;
            let n = match op {
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div if b == 0.0 => return Err(EvalError::DivisionByZero),
                BinaryOp::Div => a / b,
                _ if b == 0.0 => return Err(EvalError::DivisionByZero),
                _ => a % b,
            };
            Ok(Value::Number(n))
        }
    }
}

fn compare(op: &'static str, l: &Value, r: &Value) -> Result<Ordering, EvalError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or(EvalError::NullOperand { op }),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Null, _) | (_, Value::Null) => Err(EvalError::NullOperand { op }),
        (Value::Number(_), other) | (other, Value::Number(_)) => Err(mismatch(op, "number", other)),
        (other, _) => Err(mismatch(op, "number or string", other)),
    }
}

fn numbers(op: &'static str, l: &Value, r: &Value) -> Result<(f64, f64), EvalError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok((*a, *b)),
        (Value::Null, _) | (_, Value::Null) => Err(EvalError::NullOperand { op }),
        (Value::Number(_), other) | (other, _) => Err(mismatch(op, "number", other)),
    }
}

fn membership(needle: Value, haystack: Value) -> Result<bool, EvalError> {
    match (needle, haystack) {
        (n, Value::List(items)) => Ok(items.contains(&n)),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        (_, Value::Null) => Err(EvalError::NullOperand { op: "in" }),
        (_, other) => Err(mismatch("in", "list or string", &other)),
    }
}

fn boolean(op: &'static str, v: Value) -> Result<bool, EvalError> {
    match v {
        Value::Bool(b) => Ok(b),
        Value::Null => Err(EvalError::NullOperand { op }),
        other => Err(mismatch(op, "bool", &other)),
    }
}

fn mismatch(op: &'static str, expected: &'static str, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op,
        expected,
        found: found.type_name(),
    }
}
