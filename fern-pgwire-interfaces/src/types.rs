// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;

use crate::SessionError;

/// SQL types known to the engine, independently of their wire identifiers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DataType {
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Varchar,
    Text,
    Bytea,
    /// Type left for the server to infer, e.g. a parameter declared with OID `0`.
    Unknown,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boolean => "boolean",
            Self::SmallInt => "smallint",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Double => "double precision",
            Self::Numeric => "numeric",
            Self::Varchar => "character varying",
            Self::Text => "text",
            Self::Bytea => "bytea",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A single SQL value, as bound to a parameter or read from a row.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision number, kept in its canonical text form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
}

impl Value {
    /// Returns the natural type of this value, `Unknown` for `NULL`.
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Null => DataType::Unknown,
            Self::Bool(_) => DataType::Boolean,
            Self::Int2(_) => DataType::SmallInt,
            Self::Int4(_) => DataType::Integer,
            Self::Int8(_) => DataType::BigInt,
            Self::Float4(_) => DataType::Real,
            Self::Float8(_) => DataType::Double,
            Self::Numeric(_) => DataType::Numeric,
            Self::Text(_) => DataType::Text,
            Self::Bytea(_) => DataType::Bytea,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Encoding of a value on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FormatCode {
    #[default]
    Text,
    Binary,
}

impl FormatCode {
    /// Picks the format of the value at `index` from a list of format codes.
    ///
    /// An empty list means every value is in text format, and a single
    /// code applies to every value.
    pub fn select(codes: &[FormatCode], index: usize) -> FormatCode {
        match codes {
            [] => FormatCode::Text,
            [code] => *code,
            codes => codes.get(index).copied().unwrap_or_default(),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }
}

impl TryFrom<i16> for FormatCode {
    type Error = i16;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Text),
            1 => Ok(Self::Binary),
            other => Err(other),
        }
    }
}

/// Kind of object targeted by `Describe` and `Close`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetKind {
    Statement,
    Portal,
}

impl TryFrom<u8> for TargetKind {
    type Error = u8;

    fn try_from(target: u8) -> Result<Self, Self::Error> {
        match target {
            b'S' => Ok(Self::Statement),
            b'P' => Ok(Self::Portal),
            other => Err(other),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement => f.write_str("statement"),
            Self::Portal => f.write_str("portal"),
        }
    }
}

/// Description of a result column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    /// Number of fractional digits, for types that have one.
    pub scale: Option<i32>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            scale: None,
        }
    }
}

pub type Row = Vec<Value>;

/// Parameters and result columns of a statement or portal.
///
/// `fields` is `None` when the statement returns no rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DescribeResult {
    pub parameters: Vec<DataType>,
    pub fields: Option<Vec<Field>>,
}

/// Outcome of executing a statement.
pub enum RowSource {
    /// Statement without result set, along with the amount of affected rows.
    RowCount(u64),

    /// Statement producing rows, which are pulled lazily.
    Rows {
        fields: Vec<Field>,
        rows: BoxStream<'static, Result<Row, SessionError>>,
    },
}

impl RowSource {
    /// Builds a `RowSource` out of rows already in memory.
    pub fn from_rows(fields: Vec<Field>, rows: Vec<Row>) -> Self {
        RowSource::Rows {
            fields,
            rows: stream::iter(rows.into_iter().map(Ok)).boxed(),
        }
    }
}

impl fmt::Debug for RowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowCount(count) => f.debug_tuple("RowCount").field(count).finish(),
            Self::Rows { fields, .. } => f.debug_struct("Rows").field("fields", fields).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn format_code_selection() {
        use FormatCode::*;

        assert_eq!(Text, FormatCode::select(&[], 3));
        assert_eq!(Binary, FormatCode::select(&[Binary], 0));
        assert_eq!(Binary, FormatCode::select(&[Binary], 5));
        assert_eq!(Text, FormatCode::select(&[Binary, Text], 1));
        assert_eq!(Binary, FormatCode::select(&[Text, Binary], 1));
    }

    #[test]
    fn format_code_from_wire() {
        assert_eq!(Ok(FormatCode::Text), FormatCode::try_from(0));
        assert_eq!(Ok(FormatCode::Binary), FormatCode::try_from(1));
        assert_eq!(Err(7), FormatCode::try_from(7));
        assert_eq!(Err(-1), FormatCode::try_from(-1));
    }

    #[test]
    fn target_kind_from_wire() {
        assert_eq!(Ok(TargetKind::Statement), TargetKind::try_from(b'S'));
        assert_eq!(Ok(TargetKind::Portal), TargetKind::try_from(b'P'));
        assert_eq!(Err(b'X'), TargetKind::try_from(b'X'));
    }
}
