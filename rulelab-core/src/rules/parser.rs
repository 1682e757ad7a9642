//! Recursive descent parser for rule expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! expr       := or ( '?' expr ':' expr )?
//! or         := and ( ('||' | 'or') and )*
//! and        := equality ( ('&&' | 'and') equality )*
//! equality   := comparison ( ('==' | '!=') comparison )*
//! comparison := additive ( ('<' | '<=' | '>' | '>=' | 'in') additive )*
//! additive   := term ( ('+' | '-') term )*
//! term       := unary ( ('*' | '/' | '%') unary )*
//! unary      := ('!' | 'not' | '-') unary | primary
//! primary    := number | string | 'true' | 'false' | 'null'
//!             | '[' (expr (',' expr)*)? ']' | '(' expr ')'
//!             | ident '(' args ')' | path
//! ```
//!
//! A path without a dot is shorthand for `features.<name>`.
//!
//! Nesting (parentheses, lists, call arguments, ternary branches, unary
//! prefixes) is capped at [`MAX_NESTING`] levels and an expression holds at
//! most [`MAX_OPERATORS`] operators, so the tree stays shallow enough for the
//! recursive evaluator.

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::error::{CompileError, ParseError};
use super::functions::Function;
use super::value::Value;

const KEYWORDS: &[&str] = &["and", "or", "not", "in", "true", "false", "null"];

pub const MAX_NESTING: usize = 64;
pub const MAX_OPERATORS: usize = 1024;

/// Parse a complete expression. Trailing input is an error.
pub fn parse(input: &str) -> Result<Expr, CompileError> {
    let mut parser = Parser::new(input);
    parser.skip_whitespace();
    if parser.peek().is_none() {
        return Err(ParseError::new("empty expression", 0).into());
    }
    let expr = parser.parse_expr()?;
    parser.skip_whitespace();
    if let Some(ch) = parser.peek() {
        return Err(ParseError::new(format!("unexpected '{ch}' after expression"), parser.pos).into());
    }
    Ok(expr)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
    operators: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            depth: 0,
            operators: 0,
        }
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::new(
                format!("expression nested deeper than {MAX_NESTING} levels"),
                self.pos,
            ));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn count_operator(&mut self) -> Result<(), ParseError> {
        self.operators += 1;
        if self.operators > MAX_OPERATORS {
            return Err(ParseError::new(
                format!("expression has more than {MAX_OPERATORS} operators"),
                self.pos,
            ));
        }
        Ok(())
    }

    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn found(&self) -> String {
        self.peek()
            .map(|c| format!("'{c}'"))
            .unwrap_or_else(|| "end of input".to_string())
    }

    fn expect_char(&mut self, expected: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        match self.peek() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            _ => Err(ParseError::new(
                format!("expected '{expected}', found {}", self.found()),
                self.pos,
            )),
        }
    }

    /// Consume an exact operator token. Whitespace is skipped first.
    fn consume_op(&mut self, op: &str) -> bool {
        self.skip_whitespace();
        if self.remaining().starts_with(op) {
            self.pos += op.len();
            true
        } else {
            false
        }
    }

    /// Keyword followed by a non-identifier character.
    fn consume_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace();
        let rest = self.remaining();
        if !rest.starts_with(keyword) {
            return false;
        }
        let boundary = rest[keyword.len()..]
            .chars()
            .next()
            .map_or(true, |c| !is_ident_char(c));
        if boundary {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.descend()?;
        let expr = self.parse_ternary();
        self.ascend();
        expr
    }

    fn parse_ternary(&mut self) -> Result<Expr, CompileError> {
        let cond = self.parse_or()?;
        if self.consume_op("?") {
            self.count_operator()?;
            let then = self.parse_expr()?;
            self.expect_char(':')?;
            let otherwise = self.parse_expr()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while self.consume_op("||") || self.consume_keyword("or") {
            self.count_operator()?;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_equality()?;
        while self.consume_op("&&") || self.consume_keyword("and") {
            self.count_operator()?;
            let rhs = self.parse_equality()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = if self.consume_op("==") {
                BinaryOp::Eq
            } else if self.consume_op("!=") {
                BinaryOp::Ne
            } else {
                return Ok(lhs);
            };
            self.count_operator()?;
            let rhs = self.parse_comparison()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_additive()?;
        loop {
            // Two-character operators first so `<=` is not read as `<`.
            let op = if self.consume_op("<=") {
                BinaryOp::Le
            } else if self.consume_op(">=") {
                BinaryOp::Ge
            } else if self.consume_op("<") {
                BinaryOp::Lt
            } else if self.consume_op(">") {
                BinaryOp::Gt
            } else if self.consume_keyword("in") {
                BinaryOp::In
            } else {
                return Ok(lhs);
            };
            self.count_operator()?;
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = if self.consume_op("+") {
                BinaryOp::Add
            } else if self.consume_op("-") {
                BinaryOp::Sub
            } else {
                return Ok(lhs);
            };
            self.count_operator()?;
            let rhs = self.parse_term()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.consume_op("*") {
                BinaryOp::Mul
            } else if self.consume_op("/") {
                BinaryOp::Div
            } else if self.consume_op("%") {
                BinaryOp::Rem
            } else {
                return Ok(lhs);
            };
            self.count_operator()?;
            let rhs = self.parse_unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        self.skip_whitespace();
        let op = if self.remaining().starts_with('!') && !self.remaining().starts_with("!=") {
            self.advance();
            Some(UnaryOp::Not)
        } else if self.consume_keyword("not") {
            Some(UnaryOp::Not)
        } else if self.consume_op("-") {
            Some(UnaryOp::Neg)
        } else {
            None
        };
        match op {
            Some(op) => {
                self.count_operator()?;
                self.descend()?;
                let expr = self.parse_unary();
                self.ascend();
                let expr = expr?;
                Ok(Expr::Unary {
                    op,
                    expr: Box::new(expr),
                })
            }
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        self.skip_whitespace();
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '.' => Ok(Expr::Literal(Value::Number(self.parse_number()?))),
            Some(q @ ('"' | '\'')) => Ok(Expr::Literal(Value::String(self.parse_string(q)?))),
            Some('(') => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_char(')')?;
                Ok(expr)
            }
            Some('[') => {
                self.advance();
                let items = self.parse_args(']')?;
                Ok(Expr::List(items))
            }
            Some(c) if is_ident_start(c) => {
                let path = self.parse_path()?;
                match path.as_str() {
                    "true" => return Ok(Expr::Literal(Value::Bool(true))),
                    "false" => return Ok(Expr::Literal(Value::Bool(false))),
                    "null" => return Ok(Expr::Literal(Value::Null)),
                    kw if KEYWORDS.contains(&kw) => {
                        return Err(ParseError::new(format!("unexpected keyword '{kw}'"), start).into());
                    }
                    _ => {}
                }
                self.skip_whitespace();
                if self.peek() == Some('(') {
                    let func = Function::from_name(&path).ok_or_else(|| CompileError::UnknownFunction {
                        name: path.clone(),
                        position: start,
                    })?;
                    self.advance();
                    let args = self.parse_args(')')?;
                    func.check_arity(args.len())?;
                    return Ok(Expr::Call { func, args });
                }
                if path.contains('.') {
                    Ok(Expr::Var(path))
                } else {
                    Ok(Expr::Var(format!("features.{path}")))
                }
            }
            _ => Err(ParseError::new(format!("expected expression, found {}", self.found()), start).into()),
        }
    }

    /// Comma separated expressions up to `close`. The opening bracket is already consumed.
    fn parse_args(&mut self, close: char) -> Result<Vec<Expr>, CompileError> {
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(close) {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.parse_expr()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(c) if c == close => {
                    self.advance();
                    return Ok(items);
                }
                _ => {
                    return Err(ParseError::new(
                        format!("expected ',' or '{close}', found {}", self.found()),
                        self.pos,
                    )
                    .into())
                }
            }
        }
    }

    fn parse_number(&mut self) -> Result<f64, ParseError> {
        let start = self.pos;
        let mut has_dot = false;
        let mut digits = 0;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                digits += 1;
                self.advance();
            } else if ch == '.' && !has_dot {
                has_dot = true;
                self.advance();
            } else {
                break;
            }
        }
        if digits == 0 {
            return Err(ParseError::new("expected number", start));
        }
        if self.peek().is_some_and(is_ident_start) {
            return Err(ParseError::new(
                format!("invalid number: {}{}", &self.input[start..self.pos], self.found()),
                start,
            ));
        }
        let text = &self.input[start..self.pos];
        text.parse::<f64>()
            .map_err(|_| ParseError::new(format!("invalid number: {text}"), start))
    }

    fn parse_string(&mut self, quote: char) -> Result<String, ParseError> {
        let start = self.pos;
        self.advance();
        let mut out = String::new();
        loop {
            match self.advance() {
                None => return Err(ParseError::new("unterminated string", start)),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.advance() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c @ ('\\' | '"' | '\'')) => out.push(c),
                    Some(c) => {
                        return Err(ParseError::new(format!("invalid escape '\\{c}'"), self.pos - c.len_utf8() - 1));
                    }
                    None => return Err(ParseError::new("unterminated string", start)),
                },
                Some(c) => out.push(c),
            }
        }
    }

    /// `ident ('.' ident)*`
    fn parse_path(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        loop {
            match self.peek() {
                Some(c) if is_ident_start(c) => {
                    while self.peek().is_some_and(is_ident_char) {
                        self.advance();
                    }
                }
                _ => {
                    return Err(ParseError::new(
                        format!("expected identifier, found {}", self.found()),
                        self.pos,
                    ))
                }
            }
            if self.peek() == Some('.') {
                self.advance();
            } else {
                return Ok(self.input[start..self.pos].to_string());
            }
        }
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
