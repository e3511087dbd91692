// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Builders for backend Messages out of engine and session data.

use bytes::Bytes;

use fern_pgwire_interfaces::{DataType, Field, FormatCode, SessionError, Value};
use fern_protocol_postgresql::codec::backend::{ErrorField, Message, RowDescription};
use fern_protocol_postgresql::types::{encode_value, pg_type};

use crate::error::Severity;
use crate::Error;

/// Transaction status indicator: idle, not in a transaction block.
pub const TRANSACTION_IDLE: u8 = b'I';

pub fn ready_for_query() -> Message {
    Message::ReadyForQuery(TRANSACTION_IDLE)
}

pub fn parameter_status(parameter: &'static str, value: impl Into<String>) -> Message {
    Message::ParameterStatus {
        parameter: Bytes::from_static(parameter.as_bytes()),
        value: Bytes::from(value.into()),
    }
}

pub fn parameter_description(parameters: &[DataType]) -> Message {
    Message::ParameterDescription(parameters.iter().map(|dt| pg_type(*dt, None).oid).collect())
}

/// Describes result columns, as sent with `formats`.
pub fn row_description(fields: &[Field], formats: &[FormatCode]) -> Message {
    let columns = fields
        .iter()
        .enumerate()
        .map(|(idx, field)| {
            let pg_type = pg_type(field.data_type, field.scale);
            RowDescription {
                name: Bytes::from(field.name.clone()),
                table_oid: 0,
                column_attr: (idx + 1) as i16,
                data_type_oid: pg_type.oid,
                data_type_size: pg_type.size,
                type_modifier: pg_type.modifier,
                format: FormatCode::select(formats, idx).code(),
            }
        })
        .collect();

    Message::RowDescription(columns)
}

pub fn data_row(row: &[Value], formats: &[FormatCode]) -> Result<Message, Error> {
    let fields = row
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            encode_value(value, FormatCode::select(formats, idx))
                .map_err(|err| Error::Session(SessionError::Unsupported(err.to_string())))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Message::DataRow(fields))
}

/// Builds the tag of a `CommandComplete` for `query`, which affected `rows`.
pub fn command_tag(query: &str, rows: u64) -> String {
    let command = query
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .find(|word| !word.is_empty())
        .unwrap_or_default()
        .to_ascii_uppercase();

    match command.as_str() {
        "INSERT" => format!("INSERT 0 {}", rows),
        "SELECT" | "UPDATE" | "DELETE" | "FETCH" | "MOVE" | "COPY" => {
            format!("{} {}", command, rows)
        }
        // Tables and values lists produce rows as well.
        "VALUES" | "TABLE" | "WITH" => format!("SELECT {}", rows),
        _ => command,
    }
}

pub fn command_complete(query: &str, rows: u64) -> Message {
    Message::CommandComplete(Bytes::from(command_tag(query, rows)))
}

/// Reports `err` with `severity`, which may be raised above the error's own.
pub fn error_response(err: &Error, severity: Severity) -> Message {
    let severity = severity.as_str();

    let mut fields = vec![
        ErrorField::new(b'S', severity),
        ErrorField::new(b'V', severity),
        ErrorField::new(b'C', err.sql_state().to_string()),
        ErrorField::new(b'M', err.to_string()),
    ];
    if let Some(routine) = err.routine() {
        fields.push(ErrorField::new(b'R', routine));
    }

    Message::ErrorResponse(fields)
}
