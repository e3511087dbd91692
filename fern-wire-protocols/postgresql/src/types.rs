// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Mapping between SQL types and PostgreSQL type OIDs, along with the
//! text and binary representations of values on the wire.
//!
//! See [Data Types] for the text formats, and the `*send`/`*recv`
//! functions of the PostgreSQL sources for binary formats.
//!
//! [Data Types]: https://www.postgresql.org/docs/current/datatype.html

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use fern_pgwire_interfaces::{DataType, FormatCode, Value};

/// OIDs of supported types, as found in `pg_type`.
pub mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const UNKNOWN: u32 = 705;
    pub const BPCHAR: u32 = 1042;
    pub const VARCHAR: u32 = 1043;
    pub const NUMERIC: u32 = 1700;
}

/// Largest precision of a `numeric`, used when only a scale is known.
const NUMERIC_MAX_PRECISION: i32 = 1000;

/// Header size PostgreSQL adds to variable length type modifiers.
const VARHDRSZ: i32 = 4;

/// Errors raised while converting values from or to their wire format.
#[derive(Debug, Error, PartialEq)]
pub enum ValueError {
    #[error("invalid input syntax for type {data_type}: \"{input}\"")]
    InvalidText { data_type: DataType, input: String },

    #[error("incorrect binary data format for type {0}")]
    InvalidBinary(DataType),

    #[error("binary format is not supported for type {0}")]
    UnsupportedBinary(DataType),

    #[error("invalid byte sequence for encoding \"UTF8\" in value of type {0}")]
    Encoding(DataType),
}

impl ValueError {
    /// SQLSTATE code reported to clients.
    pub fn sql_state(&self) -> &'static str {
        match self {
            Self::InvalidText { .. } => "22P02",
            Self::InvalidBinary(_) => "22P03",
            Self::UnsupportedBinary(_) => "0A000",
            Self::Encoding(_) => "22021",
        }
    }
}

/// Wire level description of a [`DataType`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PgType {
    pub data_type: DataType,
    pub oid: u32,
    /// `typlen`, negative for variable length types.
    pub size: i16,
    /// `atttypmod`, `-1` when not applicable.
    pub modifier: i32,
}

/// Maps a type OID sent by a client to a [`DataType`].
///
/// OIDs of unsupported types, and `0` (unspecified), map to `Unknown`.
pub fn oid_to_data_type(oid: u32) -> DataType {
    match oid {
        oid::BOOL => DataType::Boolean,
        oid::BYTEA => DataType::Bytea,
        oid::INT8 => DataType::BigInt,
        oid::INT2 => DataType::SmallInt,
        oid::INT4 => DataType::Integer,
        oid::TEXT | oid::BPCHAR => DataType::Text,
        oid::FLOAT4 => DataType::Real,
        oid::FLOAT8 => DataType::Double,
        oid::VARCHAR => DataType::Varchar,
        oid::NUMERIC => DataType::Numeric,
        _ => DataType::Unknown,
    }
}

/// Returns the wire description of `data_type`.
///
/// `scale` only matters for `numeric`, where it ends up in the type modifier.
pub fn pg_type(data_type: DataType, scale: Option<i32>) -> PgType {
    let (oid, size) = match data_type {
        DataType::Boolean => (oid::BOOL, 1),
        DataType::SmallInt => (oid::INT2, 2),
        DataType::Integer => (oid::INT4, 4),
        DataType::BigInt => (oid::INT8, 8),
        DataType::Real => (oid::FLOAT4, 4),
        DataType::Double => (oid::FLOAT8, 8),
        DataType::Numeric => (oid::NUMERIC, -1),
        DataType::Varchar => (oid::VARCHAR, -1),
        DataType::Text => (oid::TEXT, -1),
        DataType::Bytea => (oid::BYTEA, -1),
        DataType::Unknown => (oid::UNKNOWN, -2),
    };

    let modifier = match (data_type, scale) {
        (DataType::Numeric, Some(scale)) => ((NUMERIC_MAX_PRECISION << 16) | scale) + VARHDRSZ,
        _ => -1,
    };

    PgType {
        data_type,
        oid,
        size,
        modifier,
    }
}

impl PgType {
    /// Decodes a parameter value received in `format`.
    pub fn decode(&self, format: FormatCode, raw: &[u8]) -> Result<Value, ValueError> {
        match format {
            FormatCode::Text => self.decode_text(raw),
            FormatCode::Binary => self.decode_binary(raw),
        }
    }

    fn decode_text(&self, raw: &[u8]) -> Result<Value, ValueError> {
        let data_type = self.data_type;
        let text = std::str::from_utf8(raw).map_err(|_| ValueError::Encoding(data_type))?;
        let invalid = || ValueError::InvalidText {
            data_type,
            input: text.to_string(),
        };

        let value = match data_type {
            DataType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "yes" | "on" | "1" => Value::Bool(true),
                "f" | "false" | "n" | "no" | "off" | "0" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            DataType::SmallInt => Value::Int2(text.trim().parse().map_err(|_| invalid())?),
            DataType::Integer => Value::Int4(text.trim().parse().map_err(|_| invalid())?),
            DataType::BigInt => Value::Int8(text.trim().parse().map_err(|_| invalid())?),
            DataType::Real => Value::Float4(text.trim().parse().map_err(|_| invalid())?),
            DataType::Double => Value::Float8(text.trim().parse().map_err(|_| invalid())?),
            DataType::Numeric => {
                let number = text.trim();
                if !is_numeric_literal(number) {
                    return Err(invalid());
                }
                Value::Numeric(number.to_string())
            }
            DataType::Varchar | DataType::Text | DataType::Unknown => Value::Text(text.to_string()),
            DataType::Bytea => Value::Bytea(decode_bytea_text(raw)?),
        };
        Ok(value)
    }

    fn decode_binary(&self, raw: &[u8]) -> Result<Value, ValueError> {
        let data_type = self.data_type;
        let invalid = || ValueError::InvalidBinary(data_type);

        let value = match data_type {
            DataType::Boolean => match raw {
                [byte] => Value::Bool(*byte != 0),
                _ => return Err(invalid()),
            },
            DataType::SmallInt => Value::Int2(i16::from_be_bytes(raw.try_into().map_err(|_| invalid())?)),
            DataType::Integer => Value::Int4(i32::from_be_bytes(raw.try_into().map_err(|_| invalid())?)),
            DataType::BigInt => Value::Int8(i64::from_be_bytes(raw.try_into().map_err(|_| invalid())?)),
            DataType::Real => Value::Float4(f32::from_be_bytes(raw.try_into().map_err(|_| invalid())?)),
            DataType::Double => Value::Float8(f64::from_be_bytes(raw.try_into().map_err(|_| invalid())?)),
            DataType::Numeric => return Err(ValueError::UnsupportedBinary(data_type)),
            DataType::Varchar | DataType::Text | DataType::Unknown => {
                let text = std::str::from_utf8(raw).map_err(|_| ValueError::Encoding(data_type))?;
                Value::Text(text.to_string())
            }
            DataType::Bytea => Value::Bytea(raw.to_vec()),
        };
        Ok(value)
    }
}

/// Encodes a result value in `format`, `NULL` being encoded as `None`.
pub fn encode_value(value: &Value, format: FormatCode) -> Result<Option<Bytes>, ValueError> {
    let bytes = match format {
        _ if value.is_null() => return Ok(None),
        FormatCode::Text => Bytes::from(encode_text(value)),
        FormatCode::Binary => {
            let mut buf = BytesMut::new();
            match value {
                Value::Null => {}
                Value::Bool(b) => buf.put_u8(u8::from(*b)),
                Value::Int2(n) => buf.put_i16(*n),
                Value::Int4(n) => buf.put_i32(*n),
                Value::Int8(n) => buf.put_i64(*n),
                Value::Float4(n) => buf.put_f32(*n),
                Value::Float8(n) => buf.put_f64(*n),
                Value::Numeric(_) => return Err(ValueError::UnsupportedBinary(DataType::Numeric)),
                Value::Text(s) => buf.put_slice(s.as_bytes()),
                Value::Bytea(b) => buf.put_slice(b),
            }
            buf.freeze()
        }
    };
    Ok(Some(bytes))
}

fn encode_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "t".to_string(),
        Value::Bool(false) => "f".to_string(),
        Value::Int2(n) => n.to_string(),
        Value::Int4(n) => n.to_string(),
        Value::Int8(n) => n.to_string(),
        Value::Float4(n) => format_float(*n, FLOAT4_MAX_EXPONENT),
        Value::Float8(n) => format_float(*n, FLOAT8_MAX_EXPONENT),
        Value::Numeric(n) => n.clone(),
        Value::Text(s) => s.clone(),
        Value::Bytea(b) => {
            let mut hex = String::with_capacity(2 + 2 * b.len());
            hex.push_str("\\x");
            for byte in b {
                hex.push_str(&format!("{:02x}", byte));
            }
            hex
        }
    }
}

/// Largest decimal exponent printed positionally, per float width.
const FLOAT4_MAX_EXPONENT: i32 = 5;
const FLOAT8_MAX_EXPONENT: i32 = 14;

/// Formats the shortest digits reading back as `value`, laid out the way
/// PostgreSQL does: positional for decimal exponents from -4 to
/// `max_exponent`, scientific with a signed two digit exponent otherwise.
fn format_float<T>(value: T, max_exponent: i32) -> String
where
    T: Copy + Into<f64> + std::fmt::Display + std::fmt::LowerExp,
{
    let wide: f64 = value.into();
    if wide.is_nan() {
        return "NaN".to_string();
    } else if wide.is_infinite() {
        return if wide > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    let scientific = format!("{:e}", value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return value.to_string();
    };
    match exponent.parse::<i32>() {
        Ok(exponent) if exponent < -4 || exponent > max_exponent => {
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        _ => value.to_string(),
    }
}

fn is_numeric_literal(text: &str) -> bool {
    if text.eq_ignore_ascii_case("nan") {
        return true;
    }

    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(at) => (&unsigned[..at], Some(&unsigned[at + 1..])),
        None => (unsigned, None),
    };

    let mut parts = mantissa.splitn(2, '.');
    let integer = parts.next().unwrap_or_default();
    let fraction = parts.next().unwrap_or_default();
    let digits_only = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if integer.is_empty() && fraction.is_empty() {
        return false;
    }
    if !digits_only(integer) || !digits_only(fraction) {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && digits_only(exp)
        }
    }
}

/// Decodes `bytea` text input, either in hex or in escape format.
fn decode_bytea_text(raw: &[u8]) -> Result<Vec<u8>, ValueError> {
    let invalid = || ValueError::InvalidText {
        data_type: DataType::Bytea,
        input: String::from_utf8_lossy(raw).into_owned(),
    };

    if let Some(hex) = raw.strip_prefix(b"\\x") {
        let digits: Vec<u8> = hex.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        if digits.len() % 2 != 0 {
            return Err(invalid());
        }
        return digits
            .chunks(2)
            .map(|pair| {
                let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
                u8::from_str_radix(pair, 16).map_err(|_| invalid())
            })
            .collect();
    }

    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' {
            decoded.push(raw[i]);
            i += 1;
        } else if raw.get(i + 1) == Some(&b'\\') {
            decoded.push(b'\\');
            i += 2;
        } else {
            let octal = raw.get(i + 1..i + 4).ok_or_else(invalid)?;
            let octal = std::str::from_utf8(octal).map_err(|_| invalid())?;
            decoded.push(u8::from_str_radix(octal, 8).map_err(|_| invalid())?);
            i += 4;
        }
    }
    Ok(decoded)
}
