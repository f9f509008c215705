//! A small recursive-descent boolean expression evaluator for
//! [`crate::alert::ExpressionRule`] predicates.
//!
//! Grammar (lowest to highest precedence):
//! `expr := or_expr`
//! `or_expr := and_expr ('||' and_expr)*`
//! `and_expr := cmp ('&&' cmp)*`
//! `cmp := unary (('==' | '!=' | '>' | '>=' | '<' | '<=' | 'contains') unary)?`
//! `unary := '!' unary | primary`
//! `primary := ident | string | number | bool | '(' expr ')'`
//!
//! Evaluation errors (unknown field, type mismatch) are never fatal — the
//! caller treats them as "rule does not match" rather than propagating.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone)]
pub enum Expr {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expression parse error: {}", self.0)
    }
}
impl std::error::Error for ParseError {}

pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError(format!("unexpected trailing tokens at {}", parser.pos)));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    AndAnd,
    OrOr,
    Not,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ParseError("unterminated string literal".to_string()));
                }
                i += 1;
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let slice: String = chars[start..i].iter().collect();
                let n: f64 = slice
                    .parse()
                    .map_err(|_| ParseError(format!("invalid number literal: {}", slice)))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "contains" => tokens.push(Token::Contains),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(ParseError(format!("unexpected character '{}'", other))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Contains) => Some(CmpOp::Contains),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_unary()?;
            Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
        } else {
            Ok(left)
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token::Ident(s)) => Ok(Expr::Ident(s)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Bool(b)) => Ok(Expr::Bool(b)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                if self.advance() != Some(Token::RParen) {
                    return Err(ParseError("expected closing parenthesis".to_string()));
                }
                Ok(inner)
            }
            other => Err(ParseError(format!("unexpected token: {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum EvalValue {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

fn field_value(fields: &HashMap<String, Value>, name: &str) -> EvalValue {
    match fields.get(name) {
        Some(Value::String(s)) => EvalValue::Str(s.clone()),
        Some(Value::Number(n)) => EvalValue::Num(n.as_f64().unwrap_or(0.0)),
        Some(Value::Bool(b)) => EvalValue::Bool(*b),
        _ => EvalValue::Null,
    }
}

fn eval_value(expr: &Expr, fields: &HashMap<String, Value>) -> Result<EvalValue, ParseError> {
    Ok(match expr {
        Expr::Ident(name) => field_value(fields, name),
        Expr::Str(s) => EvalValue::Str(s.clone()),
        Expr::Num(n) => EvalValue::Num(*n),
        Expr::Bool(b) => EvalValue::Bool(*b),
        _ => return Err(ParseError("non-value expression used as value".to_string())),
    })
}

/// Evaluates the predicate. Returns `Ok(false)` rather than propagating on
/// any type mismatch or unknown field — callers fold `Err` into "no match"
/// too, but most mismatches resolve here instead.
pub fn eval(expr: &Expr, fields: &HashMap<String, Value>) -> Result<bool, ParseError> {
    match expr {
        Expr::Not(inner) => Ok(!eval(inner, fields)?),
        Expr::And(l, r) => Ok(eval(l, fields)? && eval(r, fields)?),
        Expr::Or(l, r) => Ok(eval(l, fields)? || eval(r, fields)?),
        Expr::Bool(b) => Ok(*b),
        Expr::Cmp(l, op, r) => {
            let lv = eval_value(l, fields)?;
            let rv = eval_value(r, fields)?;
            Ok(compare(&lv, *op, &rv))
        }
        Expr::Ident(name) => Ok(matches!(field_value(fields, name), EvalValue::Bool(true))),
        Expr::Str(_) | Expr::Num(_) => Err(ParseError("literal used as predicate".to_string())),
    }
}

fn compare(l: &EvalValue, op: CmpOp, r: &EvalValue) -> bool {
    match (l, r) {
        (EvalValue::Num(a), EvalValue::Num(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Contains => false,
        },
        (EvalValue::Str(a), EvalValue::Str(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Contains => a.contains(b.as_str()),
            _ => false,
        },
        (EvalValue::Bool(a), EvalValue::Bool(b)) => match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            _ => false,
        },
        _ => false,
    }
}
