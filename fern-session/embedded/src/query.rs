// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! A tiny SQL dialect, answered without any storage.
//!
//! Supported statements are `SELECT` lists made of literals, parameters,
//! `pg_sleep(seconds)` and `generate_series(start, stop)`, along with
//! transaction control and settings commands, which are accepted and ignored.

use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;

use fern_pgwire_interfaces::{DataType, Field, Row, RowSource, SessionError, Value};

/// Name Postgres gives to columns computed from an expression.
const ANONYMOUS_COLUMN: &str = "?column?";

/// Highest parameter number a statement may reference.
pub(crate) const MAX_PARAMS: usize = u16::MAX as usize;

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    QuotedIdent(String),
    Number(String),
    Str(String),
    Param(usize),
    Comma,
    LParen,
    RParen,
    Minus,
    Semicolon,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Self::Word(word) | Self::QuotedIdent(word) | Self::Number(word) => word.clone(),
            Self::Str(value) => format!("'{}'", value),
            Self::Param(index) => format!("${}", index),
            Self::Comma => ",".to_string(),
            Self::LParen => "(".to_string(),
            Self::RParen => ")".to_string(),
            Self::Minus => "-".to_string(),
            Self::Semicolon => ";".to_string(),
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn syntax_error(near: impl Into<String>) -> SessionError {
    SessionError::Syntax(near.into())
}

fn execution_error(sql_state: &str, message: impl Into<String>) -> SessionError {
    SessionError::Execution {
        sql_state: sql_state.to_string(),
        message: message.into(),
    }
}

fn tokenize(query: &str) -> Result<Vec<Token>, SessionError> {
    let mut tokens = Vec::new();
    let mut chars = query.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '-' if query[pos..].starts_with("--") => {
                // Comment runs to the end of the line.
                while chars.next_if(|(_, c)| *c != '\n').is_some() {}
                continue;
            }
            '/' if query[pos..].starts_with("/*") => {
                let Some(end) = query[pos + 2..].find("*/") else {
                    return Err(execution_error("42601", "unterminated /* comment"));
                };
                let resume = pos + 2 + end + 2;
                while chars.next_if(|(idx, _)| *idx < resume).is_some() {}
                continue;
            }
            ',' => Token::Comma,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '-' => Token::Minus,
            ';' => Token::Semicolon,
            '\'' | '"' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => {
                            if chars.next_if(|(_, next)| *next == c).is_some() {
                                value.push(c);
                            } else {
                                break;
                            }
                        }
                        Some((_, other)) => value.push(other),
                        None => {
                            return Err(execution_error("42601", "unterminated quoted string"));
                        }
                    }
                }
                if c == '\'' {
                    Token::Str(value)
                } else {
                    Token::QuotedIdent(value)
                }
            }
            '$' => {
                let mut digits = String::new();
                while let Some((_, digit)) = chars.next_if(|(_, c)| c.is_ascii_digit()) {
                    digits.push(digit);
                }
                if digits.is_empty() {
                    return Err(syntax_error("$"));
                }
                match digits.parse::<usize>() {
                    Ok(index) if (1..=MAX_PARAMS).contains(&index) => Token::Param(index),
                    _ => {
                        return Err(execution_error(
                            "42P02",
                            format!("there is no parameter ${}", digits),
                        ))
                    }
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut number = c.to_string();
                while let Some((_, digit)) = chars.next_if(|(_, c)| c.is_ascii_digit() || *c == '.') {
                    number.push(digit);
                }
                if number == "." || number.matches('.').count() > 1 {
                    return Err(syntax_error(number));
                }
                Token::Number(number)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = c.to_string();
                while let Some((_, next)) = chars.next_if(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '$') {
                    word.push(next);
                }
                Token::Word(word)
            }
            other => return Err(syntax_error(other.to_string())),
        };
        tokens.push(token);
    }

    log::trace!("tokens: {:?}", tokens);
    Ok(tokens)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Parameter reference, numbered from `1`.
    Param(usize),
    Sleep(Box<Expr>),
    Series(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn default_name(&self) -> &'static str {
        match self {
            Self::Literal(_) | Self::Param(_) => ANONYMOUS_COLUMN,
            Self::Sleep(_) => "pg_sleep",
            Self::Series(..) => "generate_series",
        }
    }

    fn max_param(&self) -> usize {
        match self {
            Self::Literal(_) => 0,
            Self::Param(index) => *index,
            Self::Sleep(arg) => arg.max_param(),
            Self::Series(start, stop) => start.max_param().max(stop.max_param()),
        }
    }

    /// Type of the values of this expression, given the parameter types.
    fn data_type(&self, param_types: &[DataType]) -> DataType {
        let data_type = match self {
            Self::Literal(value) => value.data_type(),
            Self::Param(index) => param_types
                .get(index - 1)
                .copied()
                .unwrap_or(DataType::Unknown),
            // `void` results are sent as empty text.
            Self::Sleep(_) => DataType::Text,
            Self::Series(start, stop) => {
                if start.data_type(param_types) == DataType::BigInt
                    || stop.data_type(param_types) == DataType::BigInt
                {
                    DataType::BigInt
                } else {
                    DataType::Integer
                }
            }
        };

        match data_type {
            DataType::Unknown => DataType::Text,
            data_type => data_type,
        }
    }

    /// Evaluates an expression producing a single value.
    fn scalar(&self, params: &[Value]) -> Result<Value, SessionError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Param(index) => params
                .get(index - 1)
                .cloned()
                .ok_or_else(|| execution_error("42P02", format!("there is no parameter ${}", index))),
            Self::Sleep(_) | Self::Series(..) => Err(SessionError::Unsupported(format!(
                "{} is only supported as a column of its own",
                self.default_name()
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Column {
    name: String,
    expr: Expr,
}

/// A statement of the embedded dialect.
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Empty,
    Select(Vec<Column>),
    /// Transaction control and settings, accepted and ignored.
    Utility,
}

/// Commands accepted without any effect.
const UTILITY_COMMANDS: [&str; 5] = ["BEGIN", "COMMIT", "ROLLBACK", "SET", "RESET"];

impl Statement {
    pub fn parse(query: &str) -> Result<Statement, SessionError> {
        let mut tokens = tokenize(query)?;
        while tokens.last() == Some(&Token::Semicolon) {
            tokens.pop();
        }

        let Some(first) = tokens.first() else {
            return Ok(Statement::Empty);
        };
        if first.is_keyword("SELECT") {
            let mut parser = Parser { tokens, pos: 1 };
            return Ok(Statement::Select(parser.select_list()?));
        }
        if UTILITY_COMMANDS.iter().any(|cmd| first.is_keyword(cmd)) {
            return Ok(Statement::Utility);
        }
        Err(syntax_error(first.text()))
    }

    /// Number of parameters referenced by the statement.
    pub fn param_count(&self) -> usize {
        match self {
            Self::Select(columns) => columns
                .iter()
                .map(|column| column.expr.max_param())
                .max()
                .unwrap_or_default(),
            Self::Empty | Self::Utility => 0,
        }
    }

    /// Result columns, `None` for statements returning no rows.
    pub fn fields(&self, param_types: &[DataType]) -> Option<Vec<Field>> {
        match self {
            Self::Select(columns) => Some(
                columns
                    .iter()
                    .map(|column| Field::new(column.name.clone(), column.expr.data_type(param_types)))
                    .collect(),
            ),
            Self::Empty | Self::Utility => None,
        }
    }

    /// Runs the statement; `max_rows` of `0` means no limit.
    pub async fn execute(
        &self,
        params: &[Value],
        param_types: &[DataType],
        max_rows: usize,
    ) -> Result<RowSource, SessionError> {
        let columns = match self {
            Self::Select(columns) => columns,
            Self::Empty | Self::Utility => return Ok(RowSource::RowCount(0)),
        };

        let mut row = Vec::with_capacity(columns.len());
        let mut series = None;
        for (idx, column) in columns.iter().enumerate() {
            let value = match &column.expr {
                Expr::Sleep(arg) => {
                    let seconds = seconds(arg.scalar(params)?)?;
                    log::debug!("sleeping for {:?}", seconds);
                    tokio::time::sleep(seconds).await;
                    Value::Text(String::new())
                }
                Expr::Series(start, stop) => {
                    if series.is_some() {
                        return Err(SessionError::Unsupported(
                            "only one generate_series per query is supported".to_string(),
                        ));
                    }
                    let bigint = column.expr.data_type(param_types) == DataType::BigInt;
                    series = Some((idx, integer(start.scalar(params)?)?, integer(stop.scalar(params)?)?, bigint));
                    Value::Null
                }
                expr => expr.scalar(params)?,
            };
            row.push(value);
        }

        let fields = self.fields(param_types).unwrap_or_default();
        let rows: BoxStream<'static, Result<Row, SessionError>> = match series {
            None => stream::iter(std::iter::once(Ok::<_, SessionError>(row))).boxed(),
            Some((idx, start, stop, bigint)) => stream::iter((start..=stop).map(move |n| {
                let mut row = row.clone();
                row[idx] = match i32::try_from(n) {
                    Ok(n) if !bigint => Value::Int4(n),
                    _ => Value::Int8(n),
                };
                Ok::<_, SessionError>(row)
            }))
            .boxed(),
        };

        let rows = match max_rows {
            0 => rows,
            max_rows => rows.take(max_rows).boxed(),
        };
        Ok(RowSource::Rows { fields, rows })
    }
}

fn seconds(value: Value) -> Result<Duration, SessionError> {
    let seconds = match &value {
        Value::Null => 0.0,
        Value::Int2(n) => f64::from(*n),
        Value::Int4(n) => f64::from(*n),
        Value::Int8(n) => *n as f64,
        Value::Float4(n) => f64::from(*n),
        Value::Float8(n) => *n,
        Value::Numeric(text) | Value::Text(text) => text.trim().parse().map_err(|_| {
            execution_error(
                "22P02",
                format!("invalid input syntax for type double precision: \"{}\"", text),
            )
        })?,
        other => {
            return Err(execution_error(
                "42883",
                format!("function pg_sleep({}) does not exist", other.data_type()),
            ))
        }
    };

    if seconds.is_finite() && seconds > 0.0 {
        Ok(Duration::from_secs_f64(seconds))
    } else {
        Ok(Duration::ZERO)
    }
}

fn integer(value: Value) -> Result<i64, SessionError> {
    match &value {
        Value::Int2(n) => Ok(i64::from(*n)),
        Value::Int4(n) => Ok(i64::from(*n)),
        Value::Int8(n) => Ok(*n),
        Value::Numeric(text) | Value::Text(text) => text.trim().parse().map_err(|_| {
            execution_error("22P02", format!("invalid input syntax for type integer: \"{}\"", text))
        }),
        other => Err(execution_error(
            "42883",
            format!("function generate_series({}) does not exist", other.data_type()),
        )),
    }
}

fn number(digits: &str, negative: bool) -> Value {
    let text = if negative {
        format!("-{}", digits)
    } else {
        digits.to_string()
    };

    if text.contains('.') {
        return Value::Numeric(text);
    }
    if let Ok(n) = text.parse::<i32>() {
        Value::Int4(n)
    } else if let Ok(n) = text.parse::<i64>() {
        Value::Int8(n)
    } else {
        Value::Numeric(text)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, SessionError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| execution_error("42601", "syntax error at end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: Token) -> Result<(), SessionError> {
        match self.next()? {
            token if token == expected => Ok(()),
            token => Err(syntax_error(token.text())),
        }
    }

    fn select_list(&mut self) -> Result<Vec<Column>, SessionError> {
        let mut columns = vec![self.column()?];
        loop {
            match self.peek() {
                None => return Ok(columns),
                Some(Token::Comma) => {
                    self.pos += 1;
                    columns.push(self.column()?);
                }
                Some(token) if token.is_keyword("FROM") => {
                    return Err(SessionError::Unsupported("FROM clause is not supported".to_string()));
                }
                Some(token) => return Err(syntax_error(token.text())),
            }
        }
    }

    fn column(&mut self) -> Result<Column, SessionError> {
        let expr = self.expr()?;

        let alias = match self.peek() {
            Some(token) if token.is_keyword("AS") => {
                self.pos += 1;
                match self.next()? {
                    Token::Word(word) => Some(word.to_lowercase()),
                    Token::QuotedIdent(ident) => Some(ident),
                    token => return Err(syntax_error(token.text())),
                }
            }
            Some(Token::QuotedIdent(ident)) => {
                let alias = ident.clone();
                self.pos += 1;
                Some(alias)
            }
            Some(Token::Word(word)) if !word.eq_ignore_ascii_case("FROM") => {
                let alias = word.to_lowercase();
                self.pos += 1;
                Some(alias)
            }
            _ => None,
        };

        Ok(Column {
            name: alias.unwrap_or_else(|| expr.default_name().to_string()),
            expr,
        })
    }

    fn expr(&mut self) -> Result<Expr, SessionError> {
        let expr = match self.next()? {
            Token::Minus => match self.next()? {
                Token::Number(digits) => Expr::Literal(number(&digits, true)),
                token => return Err(syntax_error(token.text())),
            },
            Token::Number(digits) => Expr::Literal(number(&digits, false)),
            Token::Str(value) => Expr::Literal(Value::Text(value)),
            Token::Param(index) => Expr::Param(index),
            Token::LParen => {
                let expr = self.expr()?;
                self.expect(Token::RParen)?;
                expr
            }
            Token::Word(word) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                self.call(&word)?
            }
            Token::Word(word) => match word.to_ascii_uppercase().as_str() {
                "NULL" => Expr::Literal(Value::Null),
                "TRUE" => Expr::Literal(Value::Bool(true)),
                "FALSE" => Expr::Literal(Value::Bool(false)),
                _ => {
                    return Err(execution_error(
                        "42703",
                        format!("column \"{}\" does not exist", word.to_lowercase()),
                    ))
                }
            },
            token => return Err(syntax_error(token.text())),
        };
        Ok(expr)
    }

    /// Parses the arguments of function `name`, its `(` being consumed.
    fn call(&mut self, name: &str) -> Result<Expr, SessionError> {
        let expr = match name.to_ascii_lowercase().as_str() {
            "pg_sleep" => Expr::Sleep(Box::new(self.expr()?)),
            "generate_series" => {
                let start = self.expr()?;
                self.expect(Token::Comma)?;
                Expr::Series(Box::new(start), Box::new(self.expr()?))
            }
            other => {
                return Err(execution_error(
                    "42883",
                    format!("function {}() does not exist", other),
                ))
            }
        };
        self.expect(Token::RParen)?;
        Ok(expr)
    }
}
