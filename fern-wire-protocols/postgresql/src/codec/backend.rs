// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Messages a PostgreSQL server sends, and their [`Encoder`]/[`Decoder`].
//!
//! [`Encoder`]: tokio_util::codec::Encoder
//! [`Decoder`]: tokio_util::codec::Decoder

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::constants::*;
use crate::codec::utils::*;

const MESSAGE_ID_AUTHENTICATION: u8 = b'R';
const MESSAGE_ID_BACKEND_KEY_DATA: u8 = b'K';
const MESSAGE_ID_BIND_COMPLETE: u8 = b'2';
const MESSAGE_ID_CLOSE_COMPLETE: u8 = b'3';
const MESSAGE_ID_COMMAND_COMPLETE: u8 = b'C';
const MESSAGE_ID_DATA_ROW: u8 = b'D';
const MESSAGE_ID_EMPTY_QUERY_RESPONSE: u8 = b'I';
const MESSAGE_ID_ERROR_RESPONSE: u8 = b'E';
const MESSAGE_ID_NO_DATA: u8 = b'n';
const MESSAGE_ID_PARAMETER_DESCRIPTION: u8 = b't';
const MESSAGE_ID_PARAMETER_STATUS: u8 = b'S';
const MESSAGE_ID_PARSE_COMPLETE: u8 = b'1';
const MESSAGE_ID_READY_FOR_QUERY: u8 = b'Z';
const MESSAGE_ID_ROW_DESCRIPTION: u8 = b'T';

const AUTHENTICATION_OK: i32 = 0;
const AUTHENTICATION_CLEARTEXT_PASSWORD: i32 = 3;

/// Messages sent by a PostgreSQL server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    AuthenticationOk(),
    AuthenticationCleartextPassword(),
    BackendKeyData { process: u32, secret_key: u32 },
    BindComplete(),
    CloseComplete(),
    CommandComplete(Bytes),
    DataRow(Vec<Option<Bytes>>),
    EmptyQueryResponse(),
    ErrorResponse(Vec<ErrorField>),
    NoData(),
    ParameterDescription(Vec<u32>),
    ParameterStatus { parameter: Bytes, value: Bytes },
    ParseComplete(),
    ReadyForQuery(u8),
    RowDescription(Vec<RowDescription>),

    /// Single byte answer to an `SSLRequest` or a `GSSENCRequest`,
    /// sent without any message header.
    SSLResponse(u8),
}

/// A column description in a `RowDescription` message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowDescription {
    pub name: Bytes,
    pub table_oid: u32,
    pub column_attr: i16,
    pub data_type_oid: u32,
    pub data_type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// A field in an `ErrorResponse` message, identified by a single byte code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ErrorField {
    pub code: u8,
    pub value: Bytes,
}

impl ErrorField {
    pub fn new(code: u8, value: impl Into<Bytes>) -> Self {
        Self {
            code,
            value: value.into(),
        }
    }
}

/// Codec for messages flowing from a PostgreSQL server.
///
/// Servers only ever encode. Decoding serves clients and tests, which read
/// whole frames at once: unlike the frontend decoder, there is no need to
/// remember a pending frame length between calls.
#[derive(Debug, Clone)]
pub struct Codec {
    /// Next input is the bare byte answering an encryption request.
    encryption_response: bool,
}

impl Codec {
    /// Creates a codec decoding regular framed messages.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            encryption_response: false,
        }
    }

    /// Makes the decoder read the next byte as a bare `SSLResponse`,
    /// as sent after an `SSLRequest` or a `GSSENCRequest`.
    pub fn expect_encryption_response(&mut self) {
        self.encryption_response = true;
    }
}

fn get_list<T>(
    buf: &mut BytesMut,
    error_msg: &str,
    mut item: impl FnMut(&mut BytesMut) -> io::Result<T>,
) -> io::Result<Vec<T>> {
    let count = get_i16(buf, error_msg)?;
    let count = usize::try_from(count).map_err(|_| malformed(error_msg))?;
    (0..count).map(|_| item(buf)).collect()
}

fn get_row_description(buf: &mut BytesMut) -> io::Result<RowDescription> {
    const ERROR: &str = "malformed packet - invalid row description";
    Ok(RowDescription {
        name: get_cstr(buf)?,
        table_oid: get_u32(buf, ERROR)?,
        column_attr: get_i16(buf, ERROR)?,
        data_type_oid: get_u32(buf, ERROR)?,
        data_type_size: get_i16(buf, ERROR)?,
        type_modifier: get_i32(buf, ERROR)?,
        format: get_i16(buf, ERROR)?,
    })
}

fn get_error_fields(buf: &mut BytesMut) -> io::Result<Vec<ErrorField>> {
    let mut fields = Vec::new();
    loop {
        match get_u8(buf, "malformed packet - missing error fields terminator")? {
            0 => return Ok(fields),
            code => fields.push(ErrorField::new(code, get_cstr(buf)?)),
        }
    }
}

/// Parses the payload of a message of type `msg_id`.
fn parse_payload(msg_id: u8, payload: &mut BytesMut) -> io::Result<Message> {
    let msg = match msg_id {
        MESSAGE_ID_AUTHENTICATION => {
            match get_i32(payload, "malformed packet - invalid authentication data")? {
                AUTHENTICATION_OK => Message::AuthenticationOk(),
                AUTHENTICATION_CLEARTEXT_PASSWORD => Message::AuthenticationCleartextPassword(),
                _ => return Err(malformed("malformed packet - unsupported authentication request")),
            }
        }
        MESSAGE_ID_BACKEND_KEY_DATA => Message::BackendKeyData {
            process: get_u32(payload, "malformed packet - invalid key data")?,
            secret_key: get_u32(payload, "malformed packet - invalid key data")?,
        },
        MESSAGE_ID_BIND_COMPLETE => Message::BindComplete(),
        MESSAGE_ID_CLOSE_COMPLETE => Message::CloseComplete(),
        MESSAGE_ID_COMMAND_COMPLETE => Message::CommandComplete(get_cstr(payload)?),
        MESSAGE_ID_DATA_ROW => Message::DataRow(get_list(
            payload,
            "malformed packet - invalid data row",
            |buf| get_bytes(buf, "malformed packet - invalid field size"),
        )?),
        MESSAGE_ID_EMPTY_QUERY_RESPONSE => Message::EmptyQueryResponse(),
        MESSAGE_ID_ERROR_RESPONSE => Message::ErrorResponse(get_error_fields(payload)?),
        MESSAGE_ID_NO_DATA => Message::NoData(),
        MESSAGE_ID_PARAMETER_DESCRIPTION => {
            const ERROR: &str = "malformed packet - invalid parameter description";
            Message::ParameterDescription(get_list(payload, ERROR, |buf| get_u32(buf, ERROR))?)
        }
        MESSAGE_ID_PARAMETER_STATUS => Message::ParameterStatus {
            parameter: get_cstr(payload)?,
            value: get_cstr(payload)?,
        },
        MESSAGE_ID_PARSE_COMPLETE => Message::ParseComplete(),
        MESSAGE_ID_READY_FOR_QUERY => {
            match get_u8(payload, "malformed packet - missing status indicator")? {
                status @ (b'I' | b'T' | b'E') => Message::ReadyForQuery(status),
                _ => return Err(malformed("malformed packet - invalid status indicator")),
            }
        }
        MESSAGE_ID_ROW_DESCRIPTION => Message::RowDescription(get_list(
            payload,
            "malformed packet - invalid row description",
            get_row_description,
        )?),
        other => {
            log::trace!("unsupported message '{}': {:?}", other as char, payload);
            return Err(malformed("malformed packet - unsupported message id"));
        }
    };

    if !payload.is_empty() {
        log::trace!("trailing data: {:?}", payload);
        return Err(malformed("malformed packet - invalid message length"));
    }
    Ok(msg)
}

impl Decoder for Codec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        if self.encryption_response {
            if src.is_empty() {
                return Ok(None);
            }
            self.encryption_response = false;
            return Ok(Some(Message::SSLResponse(src.get_u8())));
        }

        if src.len() < BYTES_MESSAGE_HEADER {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if declared < BYTES_MESSAGE_SIZE {
            return Err(malformed("malformed packet - invalid message length"));
        }
        let frame_length = BYTES_MESSAGE_ID + declared;
        if src.len() < frame_length {
            log::trace!("awaiting {} more bytes", frame_length - src.len());
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(frame_length);
        let msg_id = payload.get_u8();
        payload.advance(BYTES_MESSAGE_SIZE);

        let msg = parse_payload(msg_id, &mut payload)?;
        log::debug!("decoded message frame: {:?}", msg);
        Ok(Some(msg))
    }
}

impl Encoder<Message> for Codec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        match msg {
            Message::AuthenticationOk() => {
                encode_header(MESSAGE_ID_AUTHENTICATION, 4, dst);
                dst.put_i32(AUTHENTICATION_OK);
            }
            Message::AuthenticationCleartextPassword() => {
                encode_header(MESSAGE_ID_AUTHENTICATION, 4, dst);
                dst.put_i32(AUTHENTICATION_CLEARTEXT_PASSWORD);
            }
            Message::BackendKeyData {
                process,
                secret_key,
            } => {
                encode_header(MESSAGE_ID_BACKEND_KEY_DATA, 4 + 4, dst);
                dst.put_u32(process);
                dst.put_u32(secret_key);
            }
            Message::BindComplete() => {
                encode_header(MESSAGE_ID_BIND_COMPLETE, 0, dst);
            }
            Message::CloseComplete() => {
                encode_header(MESSAGE_ID_CLOSE_COMPLETE, 0, dst);
            }
            Message::CommandComplete(command) => {
                encode_header(MESSAGE_ID_COMMAND_COMPLETE, command.len() + 1, dst);
                put_cstr(&command, dst);
            }
            Message::DataRow(fields) => {
                let msg_size = 2 + fields.iter().map(|f| bytes_len(f.as_ref())).sum::<usize>();

                encode_header(MESSAGE_ID_DATA_ROW, msg_size, dst);
                dst.put_i16(fields.len() as i16);

                for field in fields.iter() {
                    put_bytes(field.as_ref(), dst)
                }
            }
            Message::EmptyQueryResponse() => {
                encode_header(MESSAGE_ID_EMPTY_QUERY_RESPONSE, 0, dst);
            }
            Message::ErrorResponse(fields) => {
                let msg_size = fields.iter().map(|f| 1 + f.value.len() + 1).sum::<usize>() + 1;

                encode_header(MESSAGE_ID_ERROR_RESPONSE, msg_size, dst);
                for field in fields.iter() {
                    dst.put_u8(field.code);
                    put_cstr(&field.value, dst);
                }
                dst.put_u8(0); // fields list terminator
            }
            Message::NoData() => {
                encode_header(MESSAGE_ID_NO_DATA, 0, dst);
            }
            Message::ParameterDescription(oids) => {
                encode_header(MESSAGE_ID_PARAMETER_DESCRIPTION, 2 + 4 * oids.len(), dst);
                dst.put_i16(oids.len() as i16);
                for oid in oids {
                    dst.put_u32(oid);
                }
            }
            Message::ParameterStatus { parameter, value } => {
                encode_header(
                    MESSAGE_ID_PARAMETER_STATUS,
                    parameter.len() + 1 + value.len() + 1,
                    dst,
                );
                put_cstr(&parameter, dst);
                put_cstr(&value, dst);
            }
            Message::ParseComplete() => {
                encode_header(MESSAGE_ID_PARSE_COMPLETE, 0, dst);
            }
            Message::ReadyForQuery(status) => {
                encode_header(MESSAGE_ID_READY_FOR_QUERY, 1, dst);
                dst.put_u8(status);
            }
            Message::RowDescription(descriptions) => {
                let mut msg_size = 2;
                for column in descriptions.iter() {
                    msg_size += column.name.len() + 1 + 4 + 2 + 4 + 2 + 4 + 2;
                }

                encode_header(MESSAGE_ID_ROW_DESCRIPTION, msg_size, dst);
                dst.put_i16(descriptions.len() as i16);

                for column in descriptions.iter() {
                    put_cstr(&column.name, dst);
                    dst.put_u32(column.table_oid);
                    dst.put_i16(column.column_attr);
                    dst.put_u32(column.data_type_oid);
                    dst.put_i16(column.data_type_size);
                    dst.put_i32(column.type_modifier);
                    dst.put_i16(column.format);
                }
            }
            Message::SSLResponse(answer) => {
                dst.reserve(1);
                dst.put_u8(answer);
            }
        }

        Ok(())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}
