//! The closed set of built-in functions.
//!
//! Functions are resolved by name once, at compile time. An unknown name or a
//! wrong argument count is a compile error, never a runtime one.

use super::error::{CompileError, EvalError};
use super::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Percentile,
    Coalesce,
    Default,
    SafeDiv,
    Min,
    Max,
    Abs,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
}

/// Name lookup table.
const FUNCTIONS: &[(&str, Function)] = &[
    ("percentile", Function::Percentile),
    ("coalesce", Function::Coalesce),
    ("default", Function::Default),
    ("safe_div", Function::SafeDiv),
    ("min", Function::Min),
    ("max", Function::Max),
    ("abs", Function::Abs),
    ("clamp", Function::Clamp),
];

impl Function {
    pub fn from_name(name: &str) -> Option<Function> {
        FUNCTIONS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
    }

    pub fn name(self) -> &'static str {
        FUNCTIONS
            .iter()
            .find(|(_, f)| *f == self)
            .map(|(n, _)| *n)
            .unwrap_or("?")
    }

    pub fn all() -> impl Iterator<Item = Function> {
        FUNCTIONS.iter().map(|(_, f)| *f)
    }

    fn arity(self) -> Arity {
        match self {
            Function::Percentile | Function::Default => Arity::Exact(2),
            Function::SafeDiv | Function::Clamp => Arity::Exact(3),
            Function::Abs => Arity::Exact(1),
            Function::Coalesce | Function::Min | Function::Max => Arity::AtLeast(1),
        }
    }

    pub(crate) fn check_arity(self, found: usize) -> Result<(), CompileError> {
        let (ok, expected) = match self.arity() {
            Arity::Exact(n) => (found == n, n.to_string()),
            Arity::AtLeast(n) => (found >= n, format!("at least {n}")),
        };
        if ok {
            Ok(())
        } else {
            Err(CompileError::Arity {
                name: self.name(),
                expected,
                found,
            })
        }
    }

    /// Apply to already-evaluated arguments. Arity was checked at compile time.
    pub(crate) fn call(self, args: Vec<Value>) -> Result<Value, EvalError> {
        match self {
            Function::Coalesce => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
            Function::Default => {
                let mut it = args.into_iter();
                let x = it.next().unwrap_or(Value::Null);
                let d = it.next().unwrap_or(Value::Null);
                Ok(if x.is_null() { d } else { x })
            }
            Function::SafeDiv => {
                let a = number(self, &args[0])?;
                let d = args[2].clone();
                match &args[1] {
                    Value::Number(b) if *b != 0.0 => match a {
                        Some(a) => Ok(Value::Number(a / b)),
                        None => Ok(d),
                    },
                    Value::Number(_) | Value::Null => Ok(d),
                    other => Err(type_error(self, other)),
                }
            }
            Function::Abs => match &args[0] {
                Value::Number(n) => Ok(Value::Number(n.abs())),
                Value::Null => Err(EvalError::NullOperand { op: "abs" }),
                other => Err(type_error(self, other)),
            },
            Function::Clamp => {
                let x = required(self, &args[0])?;
                let lo = required(self, &args[1])?;
                let hi = required(self, &args[2])?;
                if lo > hi {
                    return Err(EvalError::InvalidArgument {
                        function: "clamp",
                        reason: format!("lower bound {lo} exceeds upper bound {hi}"),
                    });
                }
                Ok(Value::Number(x.clamp(lo, hi)))
            }
            Function::Min | Function::Max => {
                let numbers = flatten_numbers(self, &args)?;
                let pick: fn(f64, f64) -> f64 = if self == Function::Min { f64::min } else { f64::max };
                Ok(numbers
                    .into_iter()
                    .reduce(pick)
                    .map_or(Value::Null, Value::Number))
            }
            Function::Percentile => {
                let Value::List(items) = &args[0] else {
                    return Err(type_error(self, &args[0]));
                };
                let p = required(self, &args[1])?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(EvalError::InvalidArgument {
                        function: "percentile",
                        reason: format!("percentile {p} outside 0..=100"),
                    });
                }
                let mut numbers = flatten_numbers(self, items)?;
                if numbers.is_empty() {
                    return Ok(Value::Null);
                }
                numbers.sort_by(|a, b| a.total_cmp(b));
                Ok(Value::Number(interpolate(&numbers, p)))
            }
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Linear interpolation between closest ranks.
fn interpolate(sorted: &[f64], p: f64) -> f64 {
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Numbers from the arguments, expanding a single list argument. Nulls are skipped.
fn flatten_numbers(func: Function, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    let items: &[Value] = match args {
        [Value::List(inner)] => inner,
        _ => args,
    };
    let mut out = Vec::with_capacity(items.len());
    for v in items {
        match v {
            Value::Number(n) => out.push(*n),
            Value::Null => {}
            other => return Err(type_error(func, other)),
        }
    }
    Ok(out)
}

fn number(func: Function, v: &Value) -> Result<Option<f64>, EvalError> {
    match v {
        Value::Number(n) => Ok(Some(*n)),
        Value::Null => Ok(None),
        other => Err(type_error(func, other)),
    }
}

fn required(func: Function, v: &Value) -> Result<f64, EvalError> {
    number(func, v)?.ok_or(EvalError::NullOperand { op: func.name() })
}

fn type_error(func: Function, found: &Value) -> EvalError {
    EvalError::TypeMismatch {
        op: func.name(),
        expected: "number",
        found: found.type_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nums(v: &[f64]) -> Value {
        Value::List(v.iter().copied().map(Value::Number).collect())
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(Function::from_name("safe_div"), Some(Function::SafeDiv));
        assert_eq!(Function::from_name("sqrt"), None);
        assert_eq!(Function::Clamp.name(), "clamp");
        assert_eq!(Function::all().count(), 8);
    }

    #[test]
    fn arity_checked() {
        assert!(Function::Abs.check_arity(1).is_ok());
        assert!(Function::Abs.check_arity(2).is_err());
        assert!(Function::Max.check_arity(0).is_err());
        assert!(Function::Max.check_arity(5).is_ok());
    }

    #[test]
    fn percentile_interpolates() {
        let v = Function::Percentile
            .call(vec![nums(&[4.0, 1.0, 3.0, 2.0]), Value::Number(50.0)])
            .unwrap();
        assert_eq!(v, Value::Number(2.5));
        let v = Function::Percentile
            .call(vec![nums(&[10.0, 20.0]), Value::Number(100.0)])
            .unwrap();
        assert_eq!(v, Value::Number(20.0));
    }

    #[test]
    fn safe_div_defaults() {
        let d = Value::Number(-1.0);
        assert_eq!(
            Function::SafeDiv
                .call(vec![Value::Number(6.0), Value::Number(3.0), d.clone()])
                .unwrap(),
            Value::Number(2.0)
        );
        assert_eq!(
            Function::SafeDiv
                .call(vec![Value::Number(6.0), Value::Number(0.0), d.clone()])
                .unwrap(),
            d
        );
        assert_eq!(
            Function::SafeDiv
                .call(vec![Value::Null, Value::Number(2.0), d.clone()])
                .unwrap(),
            d
        );
    }

    #[test]
    fn coalesce_and_default() {
        assert_eq!(
            Function::Coalesce
                .call(vec![Value::Null, Value::Null, Value::Number(7.0)])
                .unwrap(),
            Value::Number(7.0)
        );
        assert_eq!(
            Function::Default.call(vec![Value::Null, Value::Bool(false)]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn min_max_accept_list_or_varargs() {
        assert_eq!(
            Function::Max.call(vec![nums(&[1.0, 9.0, 3.0])]).unwrap(),
            Value::Number(9.0)
        );
        assert_eq!(
            Function::Min
                .call(vec![Value::Number(2.0), Value::Null, Value::Number(-1.0)])
                .unwrap(),
            Value::Number(-1.0)
        );
    }

    #[test]
    fn clamp_rejects_inverted_bounds() {
        let err = Function::Clamp
            .call(vec![Value::Number(1.0), Value::Number(5.0), Value::Number(2.0)])
            .unwrap_err();
        assert!(matches!(err, EvalError::InvalidArgument { .. }));
    }
}
