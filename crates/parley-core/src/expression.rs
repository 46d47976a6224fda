//! Condition expressions.
//!
//! A small boolean language evaluated against an [`ExecutionContext`].
//! Identifiers resolve to derived facts first and to session variables
//! second:
//!
//! | identifier | value |
//! |---|---|
//! | `last_message` | content of the latest message |
//! | `last_speaker` | role id of the latest message |
//! | `round_index`, `round` | number of completed dialogue rounds |
//! | `message_count` | length of the message history |
//!
//! Dotted names (`verdict.score`) index into object variables. Functions:
//! `len(x)`, `contains(haystack, needle)`, `lower(s)`,
//! `starts_with(s, prefix)`, `ends_with(s, suffix)`.
//!
//! ```
//! use parley_core::Expression;
//!
//! let expr = Expression::parse("len(last_message) > 10 && !contains(lower(last_message), 'stop')")?;
//! assert_eq!(expr.source(), "len(last_message) > 10 && !contains(lower(last_message), 'stop')");
//! # Ok::<(), parley_core::ExpressionError>(())
//! ```

use crate::context::ExecutionContext;
use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// A syntax error in an expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {position}")]
pub struct ExpressionError {
    /// Byte offset into the source.
    pub position: usize,
    pub message: String,
}

impl From<ExpressionError> for FlowError {
    fn from(e: ExpressionError) -> Self {
        FlowError::Definition(format!("invalid expression: {e}"))
    }
}

/// A parsed condition expression.
///
/// Parsing happens once, when the flow is loaded; evaluation is pure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Expression {
    type Error = ExpressionError;

    fn try_from(source: String) -> Result<Self, Self::Error> {
        Expression::parse(source)
    }
}

impl From<Expression> for String {
    fn from(e: Expression) -> Self {
        e.source
    }
}

impl Expression {
    pub fn parse(source: impl Into<String>) -> Result<Self, ExpressionError> {
        let source = source.into();
        let tokens = lex(&source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser.parse_or()?;
        if parser.peek() != &Token::Eof {
            return Err(parser.err(format!("unexpected {}", parser.peek())));
        }
        Ok(Self { source, ast })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the expression.
    ///
    /// # Errors
    ///
    /// [`FlowError::ConditionEvaluation`] when a referenced variable is
    /// absent, an operand has the wrong type, or the result is not a
    /// boolean. No branch is ever guessed.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool, FlowError> {
        let scope = Scope {
            ctx,
            source: &self.source,
        };
        match scope.eval(&self.ast)? {
            Value::Bool(b) => Ok(b),
            other => Err(scope.fail(format!(
                "expected a boolean result, got {}",
                type_name(&other)
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    LParen,
    RParen,
    Comma,
    Minus,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
    Not,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::Str(s) => write!(f, "string \"{s}\""),
            Token::Num(n) => write!(f, "number {n}"),
            Token::True => f.write_str("'true'"),
            Token::False => f.write_str("'false'"),
            Token::Null => f.write_str("'null'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Minus => f.write_str("'-'"),
            Token::Eq => f.write_str("'=='"),
            Token::Neq => f.write_str("'!='"),
            Token::Lt => f.write_str("'<'"),
            Token::Lte => f.write_str("'<='"),
            Token::Gt => f.write_str("'>'"),
            Token::Gte => f.write_str("'>='"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Not => f.write_str("'!'"),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

fn lex(src: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let err = |position: usize, message: &str| ExpressionError {
        position,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut s = String::new();
            i += 1;
            loop {
                let Some(&(_, sc)) = chars.get(i) else {
                    return Err(err(pos, "unterminated string literal"));
                };
                i += 1;
                if sc == quote {
                    break;
                }
                if sc == '\\' {
                    let Some(&(_, escaped)) = chars.get(i) else {
                        return Err(err(pos, "unterminated escape in string"));
                    };
                    i += 1;
                    s.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                } else {
                    s.push(sc);
                }
            }
            tokens.push((Token::Str(s), pos));
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| err(pos, "malformed number"))?;
            tokens.push((Token::Num(n), pos));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '_' || chars[i].1 == '.')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
            let token = match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                _ => Token::Ident(word),
            };
            tokens.push((token, pos));
            continue;
        }

        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Neq, 2),
            ('<', Some('=')) => (Token::Lte, 2),
            ('>', Some('=')) => (Token::Gte, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('-', _) => (Token::Minus, 1),
            ('=', _) => return Err(err(pos, "single '=' is not an operator, use '=='")),
            _ => return Err(err(pos, &format!("unexpected character '{c}'"))),
        };
        tokens.push((token, pos));
        i += width;
    }

    tokens.push((Token::Eof, src.len()));
    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ident(String),
    Call(Function, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Len,
    Contains,
    Lower,
    StartsWith,
    EndsWith,
}

impl Function {
    fn lookup(name: &str) -> Option<(Self, usize)> {
        match name {
            "len" => Some((Function::Len, 1)),
            "contains" => Some((Function::Contains, 2)),
            "lower" => Some((Function::Lower, 1)),
            "starts_with" => Some((Function::StartsWith, 2)),
            "ends_with" => Some((Function::EndsWith, 2)),
            _ => None,
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn err(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError {
            position: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.peek() == &expected {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected {expected}, found {}", self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.peek() == &Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.peek() == &Token::And {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == &Token::Not {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Token::Eq => CompareOp::Eq,
            Token::Neq => CompareOp::Neq,
            Token::Lt => CompareOp::Lt,
            Token::Lte => CompareOp::Lte,
            Token::Gt => CompareOp::Gt,
            Token::Gte => CompareOp::Gte,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == &Token::Minus {
            self.advance();
            let inner = self.parse_operand()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let start = self.offset();
        match self.advance() {
            Token::Num(n) => Ok(Expr::Literal(Value::from(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) if self.peek() == &Token::LParen => {
                let (function, arity) = Function::lookup(&name).ok_or(ExpressionError {
                    position: start,
                    message: format!("unknown function '{name}'"),
                })?;
                self.advance();
                let mut args = Vec::new();
                if self.peek() != &Token::RParen {
                    loop {
                        args.push(self.parse_or()?);
                        if self.peek() != &Token::Comma {
                            break;
                        }
                        self.advance();
                    }
                }
                self.expect(Token::RParen)?;
                if args.len() != arity {
                    return Err(ExpressionError {
                        position: start,
                        message: format!(
                            "function '{name}' takes {arity} argument(s), got {}",
                            args.len()
                        ),
                    });
                }
                Ok(Expr::Call(function, args))
            }
            Token::Ident(name) => Ok(Expr::Ident(name)),
            other => Err(ExpressionError {
                position: start,
                message: format!("expected a value, found {other}"),
            }),
        }
    }
}

struct Scope<'a> {
    ctx: &'a ExecutionContext,
    source: &'a str,
}

impl Scope<'_> {
    fn fail(&self, details: impl Into<String>) -> FlowError {
        FlowError::condition(self.source, details)
    }

    fn eval(&self, expr: &Expr) -> Result<Value, FlowError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self.resolve(name),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner)?)),
            Expr::Neg(inner) => {
                let n = self.eval_number(inner)?;
                Ok(Value::from(-n))
            }
            Expr::And(l, r) => Ok(Value::Bool(self.eval_bool(l)? && self.eval_bool(r)?)),
            Expr::Or(l, r) => Ok(Value::Bool(self.eval_bool(l)? || self.eval_bool(r)?)),
            Expr::Compare(op, l, r) => {
                let left = self.eval(l)?;
                let right = self.eval(r)?;
                self.compare(*op, &left, &right).map(Value::Bool)
            }
            Expr::Call(function, args) => self.call(*function, args),
        }
    }

    fn eval_bool(&self, expr: &Expr) -> Result<bool, FlowError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            other => Err(self.fail(format!("expected a boolean, got {}", type_name(&other)))),
        }
    }

    fn eval_number(&self, expr: &Expr) -> Result<f64, FlowError> {
        let value = self.eval(expr)?;
        value
            .as_f64()
            .ok_or_else(|| self.fail(format!("expected a number, got {}", type_name(&value))))
    }

    fn eval_string(&self, expr: &Expr) -> Result<String, FlowError> {
        match self.eval(expr)? {
            Value::String(s) => Ok(s),
            other => Err(self.fail(format!("expected a string, got {}", type_name(&other)))),
        }
    }

    fn resolve(&self, name: &str) -> Result<Value, FlowError> {
        let ctx = self.ctx;
        match name {
            "last_message" => ctx
                .last_message()
                .map(|m| Value::String(m.content.clone()))
                .ok_or_else(|| self.fail("'last_message' is not available: no messages yet")),
            "last_speaker" => ctx
                .last_message()
                .map(|m| Value::String(m.role_id.to_string()))
                .ok_or_else(|| self.fail("'last_speaker' is not available: no messages yet")),
            "round_index" | "round" => Ok(Value::from(ctx.rounds())),
            "message_count" => Ok(Value::from(ctx.message_history().len() as u64)),
            _ => {
                let mut parts = name.split('.');
                let root = parts.next().unwrap_or(name);
                let mut value = ctx
                    .variable(root)
                    .ok_or_else(|| self.fail(format!("variable '{root}' is not defined")))?;
                for field in parts {
                    value = value.get(field).ok_or_else(|| {
                        self.fail(format!("variable '{name}' has no field '{field}'"))
                    })?;
                }
                Ok(value.clone())
            }
        }
    }

    fn call(&self, function: Function, args: &[Expr]) -> Result<Value, FlowError> {
        match (function, args) {
            (Function::Len, [arg]) => match self.eval(arg)? {
                Value::String(s) => Ok(Value::from(s.chars().count() as u64)),
                Value::Array(items) => Ok(Value::from(items.len() as u64)),
                Value::Object(map) => Ok(Value::from(map.len() as u64)),
                other => Err(self.fail(format!("len() of {}", type_name(&other)))),
            },
            (Function::Contains, [haystack, needle]) => match self.eval(haystack)? {
                Value::String(s) => Ok(Value::Bool(s.contains(&self.eval_string(needle)?))),
                Value::Array(items) => {
                    let needle = self.eval(needle)?;
                    Ok(Value::Bool(items.iter().any(|item| values_equal(item, &needle))))
                }
                other => Err(self.fail(format!("contains() on {}", type_name(&other)))),
            },
            (Function::Lower, [arg]) => Ok(Value::String(self.eval_string(arg)?.to_lowercase())),
            (Function::StartsWith, [s, prefix]) => Ok(Value::Bool(
                self.eval_string(s)?.starts_with(&self.eval_string(prefix)?),
            )),
            (Function::EndsWith, [s, suffix]) => Ok(Value::Bool(
                self.eval_string(s)?.ends_with(&self.eval_string(suffix)?),
            )),
            _ => Err(self.fail("wrong number of function arguments")),
        }
    }

    fn compare(&self, op: CompareOp, left: &Value, right: &Value) -> Result<bool, FlowError> {
        match op {
            CompareOp::Eq => return Ok(values_equal(left, right)),
            CompareOp::Neq => return Ok(!values_equal(left, right)),
            _ => {}
        }
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a
                .as_f64()
                .zip(b.as_f64())
                .and_then(|(a, b)| a.partial_cmp(&b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
        .ok_or_else(|| {
            self.fail(format!(
                "cannot order {} against {}",
                type_name(left),
                type_name(right)
            ))
        })?;
        Ok(match op {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Eq | CompareOp::Neq => false,
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Message, SessionId};
    use crate::step::StepId;
    use crate::traits::RoleId;
    use serde_json::json;

    fn ctx_with(messages: &[&str]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(SessionId::new("s1"));
        for content in messages {
            ctx.complete_round(Message::new(
                StepId::new("talk"),
                RoleId::new("host"),
                "Host",
                *content,
            ));
        }
        ctx
    }

    fn eval(src: &str, ctx: &ExecutionContext) -> Result<bool, FlowError> {
        Expression::parse(src).expect("valid expression").evaluate(ctx)
    }

    #[test]
    fn test_derived_facts() {
        let ctx = ctx_with(&["hello there", "twenty chars exactly"]);
        assert_eq!(eval("len(last_message) > 10", &ctx), Ok(true));
        assert_eq!(eval("round_index == 2 and message_count >= 2", &ctx), Ok(true));
        assert_eq!(eval("last_speaker == 'host'", &ctx), Ok(true));
        assert_eq!(eval("contains(last_message, \"exactly\")", &ctx), Ok(true));
        assert_eq!(eval("!(round < 2) || false", &ctx), Ok(true));
    }

    #[test]
    fn test_variables_and_nested_fields() {
        let mut ctx = ctx_with(&[]);
        ctx.set_variable("score", json!(7));
        ctx.set_variable("verdict", json!({ "label": "Agree", "tags": ["a", "b"] }));

        assert_eq!(eval("score >= 7.0", &ctx), Ok(true));
        assert_eq!(eval("score > -1", &ctx), Ok(true));
        assert_eq!(eval("lower(verdict.label) == 'agree'", &ctx), Ok(true));
        assert_eq!(eval("contains(verdict.tags, 'b') && len(verdict.tags) == 2", &ctx), Ok(true));
        assert_eq!(eval("starts_with(verdict.label, 'Ag')", &ctx), Ok(true));
    }

    #[test]
    fn test_missing_variable_fails_instead_of_guessing() {
        let ctx = ctx_with(&[]);
        let err = eval("consensus == true", &ctx).unwrap_err();
        assert!(matches!(
            err,
            FlowError::ConditionEvaluation { ref details, .. } if details == "variable 'consensus' is not defined"
        ));
        assert!(eval("len(last_message) > 0", &ctx).is_err());
    }

    #[test]
    fn test_short_circuit_skips_missing_right_side() {
        let ctx = ctx_with(&[]);
        assert_eq!(eval("false and missing", &ctx), Ok(false));
        assert_eq!(eval("true or missing", &ctx), Ok(true));
    }

    #[test]
    fn test_type_errors() {
        let mut ctx = ctx_with(&["hi"]);
        ctx.set_variable("flag", json!(true));
        assert!(eval("last_message > 3", &ctx).is_err());
        assert!(eval("len(flag) == 1", &ctx).is_err());
        // non-boolean result
        assert!(eval("round_index", &ctx).is_err());
        // mismatched equality is simply false
        assert_eq!(eval("flag == 'true'", &ctx), Ok(false));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expression::parse("a = 1").is_err());
        assert!(Expression::parse("len(a, b) > 1").is_err());
        assert!(Expression::parse("unknown(a)").is_err());
        assert!(Expression::parse("(a == 1").is_err());
        assert!(Expression::parse("'open").is_err());

        let err = Expression::parse("a == == b").unwrap_err();
        assert_eq!(err.position, 5);
    }

    #[test]
    fn test_serde_round_trips_through_source() {
        let expr: Expression =
            serde_json::from_value(json!("round >= 3")).expect("valid expression");
        assert_eq!(serde_json::to_value(&expr).expect("serializable"), json!("round >= 3"));
        assert!(serde_json::from_value::<Expression>(json!("round >=")).is_err());
    }
}
