//! crates/story_engine_core/src/filter.rs
//!
//! The record-store filter dialect: `story="abc" && created>="2024-01-01T00:00:00Z"`.
//!
//! Filters cross the port boundary as strings, so every untrusted value must be
//! passed through [`escape_filter`] before it is interpolated. Adapters parse the
//! string back with [`parse_filter`] and either evaluate it in memory
//! ([`FilterExpr::matches`]) or translate it to their own query language.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

use crate::domain::Record;
use crate::ports::{PortError, PortResult};

//=========================================================================================
// Building Filters
//=========================================================================================

/// Escapes backslash, double quote and single quote so `s` stays one literal.
pub fn escape_filter(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\'")
}

/// `field="value"` with `value` escaped.
pub fn eq(field: &str, value: &str) -> String {
    format!("{field}=\"{}\"", escape_filter(value))
}

/// `field>="<rfc3339>"`.
pub fn since(field: &str, at: DateTime<Utc>) -> String {
    timestamp_clause(field, ">=", at)
}

/// `field<"<rfc3339>"`.
pub fn before(field: &str, at: DateTime<Utc>) -> String {
    timestamp_clause(field, "<", at)
}

/// `field="<rfc3339>"`.
pub fn exactly(field: &str, at: DateTime<Utc>) -> String {
    timestamp_clause(field, "=", at)
}

/// Rows strictly ahead of `record` in `(created, id)` order.
pub fn precedes(record: &Record) -> String {
    any_of([
        before("created", record.created),
        all_of([
            exactly("created", record.created),
            format!("id<\"{}\"", escape_filter(&record.id)),
        ]),
    ])
}

// Timestamps keep their full sub-second precision, or rows inside the same
// millisecond would slip past the bound.
fn timestamp_clause(field: &str, op: &str, at: DateTime<Utc>) -> String {
    format!(
        "{field}{op}\"{}\"",
        at.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
    )
}

/// Joins clauses with `&&`.
pub fn all_of<I, S>(clauses: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    join(clauses, " && ")
}

/// Joins clauses with `||`, parenthesized so it composes under `&&`.
pub fn any_of<I, S>(clauses: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = join(clauses, " || ");
    if joined.is_empty() {
        joined
    } else {
        format!("({joined})")
    }
}

fn join<I, S>(clauses: I, sep: &str) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    clauses
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

//=========================================================================================
// Filter AST
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// The empty filter.
    All,
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Comparison {
        field: String,
        op: CmpOp,
        value: FilterValue,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl FilterValue {
    /// The literal as a JSON value, for adapters that compare against JSON columns.
    pub fn to_json(&self) -> Value {
        match self {
            FilterValue::String(s) => Value::String(s.clone()),
            FilterValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FilterValue::Bool(b) => Value::Bool(*b),
            FilterValue::Null => Value::Null,
        }
    }

    /// Parses a string literal as an RFC 3339 timestamp.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FilterValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Row metadata columns that are not part of the field map.
pub fn is_system_field(field: &str) -> bool {
    matches!(field, "id" | "created" | "updated")
}

//=========================================================================================
// In-memory Evaluation
//=========================================================================================

#[derive(Debug)]
enum Resolved<'a> {
    Null,
    Bool(bool),
    Number(f64),
    String(&'a str),
    Timestamp(DateTime<Utc>),
    Unsupported,
}

fn resolve<'a>(record: &'a Record, field: &str) -> Resolved<'a> {
    match field {
        "id" => Resolved::String(&record.id),
        "created" => Resolved::Timestamp(record.created),
        "updated" => Resolved::Timestamp(record.updated),
        other => match record.data.get(other) {
            None | Some(Value::Null) => Resolved::Null,
            Some(Value::Bool(b)) => Resolved::Bool(*b),
            Some(Value::Number(n)) => n
                .as_f64()
                .map(Resolved::Number)
                .unwrap_or(Resolved::Unsupported),
            Some(Value::String(s)) => Resolved::String(s),
            Some(_) => Resolved::Unsupported,
        },
    }
}

fn compare(lhs: &Resolved<'_>, rhs: &FilterValue) -> Option<Ordering> {
    match (lhs, rhs) {
        (Resolved::Number(a), FilterValue::Number(b)) => a.partial_cmp(b),
        (Resolved::String(a), FilterValue::String(b)) => Some((*a).cmp(b.as_str())),
        (Resolved::Bool(a), FilterValue::Bool(b)) => Some(a.cmp(b)),
        (Resolved::Timestamp(a), literal) => literal.as_timestamp().map(|b| a.cmp(&b)),
        _ => None,
    }
}

fn equals(lhs: &Resolved<'_>, rhs: &FilterValue) -> bool {
    match (lhs, rhs) {
        (Resolved::Null, FilterValue::Null) => true,
        // An unset relation and an empty string are the same thing to the store.
        (Resolved::Null, FilterValue::String(s)) => s.is_empty(),
        (Resolved::String(s), FilterValue::Null) => s.is_empty(),
        _ => compare(lhs, rhs) == Some(Ordering::Equal),
    }
}

impl FilterExpr {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            FilterExpr::All => true,
            FilterExpr::And(children) => children.iter().all(|c| c.matches(record)),
            FilterExpr::Or(children) => children.iter().any(|c| c.matches(record)),
            FilterExpr::Comparison { field, op, value } => {
                let lhs = resolve(record, field);
                if matches!(lhs, Resolved::Unsupported) {
                    return false;
                }
                match op {
                    CmpOp::Eq => equals(&lhs, value),
                    CmpOp::Neq => !equals(&lhs, value),
                    CmpOp::Gt => compare(&lhs, value) == Some(Ordering::Greater),
                    CmpOp::Gte => matches!(
                        compare(&lhs, value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CmpOp::Lt => compare(&lhs, value) == Some(Ordering::Less),
                    CmpOp::Lte => matches!(
                        compare(&lhs, value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
        }
    }
}

//=========================================================================================
// Sorting
//=========================================================================================

/// A parsed sort spec such as `"-created,chapter_number"`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sort {
    pub keys: Vec<SortKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    pub fn parse(spec: &str) -> PortResult<Self> {
        let mut keys = Vec::new();
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (field, descending) = match part.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (part.strip_prefix('+').unwrap_or(part), false),
            };
            if field.is_empty() || !field.chars().all(is_identifier_part) {
                return Err(PortError::InvalidFilter(format!("invalid sort key '{part}'")));
            }
            keys.push(SortKey {
                field: field.to_string(),
                descending,
            });
        }
        Ok(Self { keys })
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for key in &self.keys {
            let ord = compare_resolved(&resolve(a, &key.field), &resolve(b, &key.field));
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

fn rank(value: &Resolved<'_>) -> u8 {
    match value {
        Resolved::Null | Resolved::Unsupported => 0,
        Resolved::Bool(_) => 1,
        Resolved::Number(_) => 2,
        Resolved::String(_) => 3,
        Resolved::Timestamp(_) => 4,
    }
}

fn compare_resolved(a: &Resolved<'_>, b: &Resolved<'_>) -> Ordering {
    match (a, b) {
        (Resolved::Bool(x), Resolved::Bool(y)) => x.cmp(y),
        (Resolved::Number(x), Resolved::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Resolved::String(x), Resolved::String(y)) => x.cmp(y),
        (Resolved::Timestamp(x), Resolved::Timestamp(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

//=========================================================================================
// Parser
//=========================================================================================

/// Parses a filter string. The empty string parses to [`FilterExpr::All`].
pub fn parse_filter(input: &str) -> PortResult<FilterExpr> {
    let tokens = Lexer::new(input).collect::<PortResult<Vec<_>>>()?;
    if tokens.is_empty() {
        return Ok(FilterExpr::All);
    }
    let mut parser = Parser { tokens, position: 0 };
    let expr = parser.parse_or()?;
    if parser.position != parser.tokens.len() {
        return Err(invalid(format!(
            "unexpected token {:?}",
            parser.tokens[parser.position]
        )));
    }
    Ok(expr)
}

fn invalid(message: impl Into<String>) -> PortError {
    PortError::InvalidFilter(message.into())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Literal(FilterValue),
    Op(CmpOp),
    And,
    Or,
    LParen,
    RParen,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn consume_if(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.next_char();
            true
        } else {
            false
        }
    }

    fn consume_whitespace(&mut self) {
        while matches!(self.peek_char(), Some(ch) if ch.is_whitespace()) {
            self.next_char();
        }
    }

    fn consume_identifier(&mut self) -> Token {
        let start = self.position;
        while matches!(self.peek_char(), Some(ch) if is_identifier_part(ch)) {
            self.next_char();
        }
        match &self.input[start..self.position] {
            "true" => Token::Literal(FilterValue::Bool(true)),
            "false" => Token::Literal(FilterValue::Bool(false)),
            "null" => Token::Literal(FilterValue::Null),
            ident => Token::Identifier(ident.to_string()),
        }
    }

    fn consume_string(&mut self, quote: char) -> PortResult<Token> {
        let mut value = String::new();
        while let Some(ch) = self.next_char() {
            if ch == quote {
                return Ok(Token::Literal(FilterValue::String(value)));
            }
            if ch == '\\' {
                let escaped = self
                    .next_char()
                    .ok_or_else(|| invalid("unterminated escape sequence"))?;
                value.push(escaped);
            } else {
                value.push(ch);
            }
        }
        Err(invalid("unterminated string literal"))
    }

    fn consume_number(&mut self) -> PortResult<Token> {
        let start = self.position;
        self.next_char();
        while matches!(self.peek_char(), Some(ch) if ch.is_ascii_digit() || ch == '.') {
            self.next_char();
        }
        let text = &self.input[start..self.position];
        text.parse::<f64>()
            .map(|n| Token::Literal(FilterValue::Number(n)))
            .map_err(|_| invalid(format!("invalid number '{text}'")))
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = PortResult<Token>;

    fn next(&mut self) -> Option<Self::Item> {
        self.consume_whitespace();
        let ch = self.peek_char()?;
        let token = if ch.is_ascii_alphabetic() || ch == '_' {
            Ok(self.consume_identifier())
        } else if ch == '"' || ch == '\'' {
            self.next_char();
            self.consume_string(ch)
        } else if ch.is_ascii_digit() || ch == '-' {
            self.consume_number()
        } else {
            self.next_char();
            match ch {
                '(' => Ok(Token::LParen),
                ')' => Ok(Token::RParen),
                '=' => Ok(Token::Op(CmpOp::Eq)),
                '!' if self.consume_if('=') => Ok(Token::Op(CmpOp::Neq)),
                '>' if self.consume_if('=') => Ok(Token::Op(CmpOp::Gte)),
                '>' => Ok(Token::Op(CmpOp::Gt)),
                '<' if self.consume_if('=') => Ok(Token::Op(CmpOp::Lte)),
                '<' => Ok(Token::Op(CmpOp::Lt)),
                '&' if self.consume_if('&') => Ok(Token::And),
                '|' if self.consume_if('|') => Ok(Token::Or),
                other => Err(invalid(format!("unexpected character '{other}'"))),
            }
        };
        Some(token)
    }
}

fn is_identifier_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '.'
}

/// Whether `name` is a valid field reference in filters and sort specs.
pub fn is_field_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_identifier_part)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn parse_or(&mut self) -> PortResult<FilterExpr> {
        let mut nodes = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            nodes.push(self.parse_and()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            FilterExpr::Or(nodes)
        })
    }

    fn parse_and(&mut self) -> PortResult<FilterExpr> {
        let mut nodes = vec![self.parse_primary()?];
        while self.peek() == Some(&Token::And) {
            self.advance();
            nodes.push(self.parse_primary()?);
        }
        Ok(if nodes.len() == 1 {
            nodes.remove(0)
        } else {
            FilterExpr::And(nodes)
        })
    }

    fn parse_primary(&mut self) -> PortResult<FilterExpr> {
        match self.advance() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(invalid("expected ')'")),
                }
            }
            Some(Token::Identifier(field)) => {
                let op = match self.advance() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(invalid(format!(
                            "expected operator after '{field}', found {other:?}"
                        )))
                    }
                };
                match self.advance() {
                    Some(Token::Literal(value)) => Ok(FilterExpr::Comparison { field, op, value }),
                    other => Err(invalid(format!(
                        "expected literal after '{field}', found {other:?}"
                    ))),
                }
            }
            other => Err(invalid(format!("unexpected token {other:?}"))),
        }
    }
}
