// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! Messages sent by a PostgreSQL client, and the codec framing them.
//!
//! Decoding is what a server does with these messages, encoding is mostly
//! useful to test clients.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::constants::*;
use crate::codec::utils::*;

const BYTES_STARTUP_MESSAGE_HEADER: usize = 8;
const BYTES_CANCEL_REQUEST: usize = 16;

pub const MESSAGE_ID_CANCEL_REQUEST: i32 = 80877102;
pub const MESSAGE_ID_SSL_REQUEST: i32 = 80877103;
pub const MESSAGE_ID_GSSENC_REQUEST: i32 = 80877104;
pub const MESSAGE_ID_STARTUP_MESSAGE: i32 = 196608;

const MESSAGE_ID_BIND: u8 = b'B';
const MESSAGE_ID_CLOSE: u8 = b'C';
const MESSAGE_ID_DESCRIBE: u8 = b'D';
const MESSAGE_ID_EXECUTE: u8 = b'E';
const MESSAGE_ID_FLUSH: u8 = b'H';
const MESSAGE_ID_PARSE: u8 = b'P';
const MESSAGE_ID_PASSWORD_MESSAGE: u8 = b'p';
const MESSAGE_ID_QUERY: u8 = b'Q';
const MESSAGE_ID_SYNC: u8 = b'S';
const MESSAGE_ID_TERMINATE: u8 = b'X';

/// Messages sent by a PostgreSQL client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Well-formed frame with a type this codec does not know about.
    NotImplemented(u8, Bytes),

    /// Frame discarded unparsed while ignoring messages until `Sync`.
    Skipped(u8),

    Bind {
        portal: Bytes,
        stmt_name: Bytes,
        param_formats: Vec<i16>,
        parameters: Vec<Option<Bytes>>,
        results_formats: Vec<i16>,
    },
    CancelRequest {
        process_id: u32,
        secret_key: u32,
    },
    Close {
        target: u8,
        name: Bytes,
    },
    Describe {
        target: u8,
        name: Bytes,
    },
    Execute {
        portal: Bytes,
        max_rows: u32,
    },
    Flush(),
    GSSENCRequest(),
    Parse {
        name: Bytes,
        query: Bytes,
        param_types: Vec<u32>,
    },
    /// Password in clear text, kept mutable so that it can be wiped in place.
    PasswordMessage(BytesMut),
    Query(Bytes),
    SSLRequest(),
    StartupMessage {
        frame_length: usize,
        parameters: Vec<Parameter>,
    },
    Sync(),
    Terminate(),
}

impl Message {
    /// Builds a `StartupMessage` for protocol 3.0, computing its frame length.
    pub fn startup(parameters: Vec<Parameter>) -> Self {
        let frame_length = BYTES_STARTUP_MESSAGE_HEADER
            + parameters
                .iter()
                .map(|p| p.name.len() + 1 + p.value.len() + 1)
                .sum::<usize>()
            + 1;

        Message::StartupMessage {
            frame_length,
            parameters,
        }
    }
}

/// A `name`/`value` pair from a `StartupMessage`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Parameter {
    pub name: Bytes,
    pub value: Bytes,
}

impl Parameter {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: Bytes::copy_from_slice(name.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }
}

/// Where the decoder stands in the byte stream.
#[derive(Debug, Clone)]
enum DecodeState {
    /// First message of the connection, framed without an identifier.
    Startup,
    /// Waiting for the identifier and length of the next frame.
    Head,
    /// Header known, waiting for the rest of a frame of the given size.
    Message(usize),
}

/// Codec for messages flowing from a PostgreSQL client.
///
/// The very first message of a connection uses a dedicated framing, with no
/// message identifier. The decoder starts in that mode, and switches to
/// regular framing once a `StartupMessage` has been decoded.
#[derive(Debug, Clone)]
pub struct Codec {
    state: DecodeState,

    /// Largest accepted frame, header included.
    max_message_size: usize,

    /// When set, regular frames other than `Sync` and `Terminate` are not parsed.
    ignore_till_sync: bool,
}

impl Codec {
    /// Creates a codec awaiting the startup sequence of a new connection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: DecodeState::Startup,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ignore_till_sync: false,
        }
    }

    /// Sets the largest frame the decoder accepts before failing.
    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Switches to regular framing, as if a `StartupMessage` had been decoded.
    pub fn startup_complete(&mut self) {
        self.state = DecodeState::Head;
    }

    /// Enables or disables discarding of every frame but `Sync` and `Terminate`.
    ///
    /// Discarded frames are consumed without their payload being parsed,
    /// and surface as [`Message::Skipped`].
    pub fn ignore_till_sync(&mut self, ignore: bool) {
        if self.ignore_till_sync != ignore {
            log::debug!("ignoring messages until sync: {}", ignore);
        }
        self.ignore_till_sync = ignore;
    }

    /// Reads the size of the next regular frame, identifier included,
    /// leaving `src` untouched.
    fn frame_size(&self, src: &BytesMut) -> io::Result<Option<usize>> {
        let Some(header) = src.get(..BYTES_MESSAGE_HEADER) else {
            return Ok(None);
        };

        let declared = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        // The declared length covers itself, which empty messages consist of.
        let Some(size) = usize::try_from(declared)
            .ok()
            .filter(|&len| len >= BYTES_MESSAGE_SIZE)
            .map(|len| len + BYTES_MESSAGE_ID)
        else {
            log::trace!("invalid declared length {} for '{}'", declared, header[0] as char);
            return Err(malformed("malformed packet - invalid message length"));
        };
        if size > self.max_message_size {
            return Err(malformed("malformed packet - message too large"));
        }

        Ok(Some(size))
    }

    /// Decodes the first message of a connection, which has no identifier.
    ///
    /// Besides a `StartupMessage`, a client can open a connection with an
    /// `SSLRequest` or a `GSSENCRequest`, or use a fresh connection to send a
    /// `CancelRequest` for a query running on another one.
    pub fn decode_startup_message(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        let Some(header) = src.get(..BYTES_STARTUP_MESSAGE_HEADER) else {
            return Ok(None);
        };

        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let frame_length = usize::try_from(declared)
            .ok()
            .filter(|len| (BYTES_STARTUP_MESSAGE_HEADER..=self.max_message_size).contains(len))
            .ok_or_else(|| malformed("malformed packet - invalid startup message length"))?;
        if src.len() < frame_length {
            src.reserve(frame_length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(frame_length);
        frame.advance(BYTES_MESSAGE_SIZE);
        let code = frame.get_i32();

        let msg = match code {
            MESSAGE_ID_STARTUP_MESSAGE => Message::StartupMessage {
                frame_length,
                parameters: get_parameters(&mut frame)?,
            },
            MESSAGE_ID_CANCEL_REQUEST if frame_length == BYTES_CANCEL_REQUEST => {
                Message::CancelRequest {
                    process_id: frame.get_u32(),
                    secret_key: frame.get_u32(),
                }
            }
            MESSAGE_ID_CANCEL_REQUEST => {
                return Err(malformed("malformed packet - invalid cancel request length"));
            }
            MESSAGE_ID_SSL_REQUEST | MESSAGE_ID_GSSENC_REQUEST if !frame.is_empty() => {
                return Err(malformed("malformed packet - invalid encryption request length"));
            }
            MESSAGE_ID_SSL_REQUEST => Message::SSLRequest(),
            MESSAGE_ID_GSSENC_REQUEST => Message::GSSENCRequest(),
            // Anything else is read as a startup message for another protocol version.
            _ => {
                log::trace!("unsupported startup code: {}", code);
                return Err(malformed("malformed packet - invalid protocol version"));
            }
        };

        log::debug!("decoded message frame: {:?}", msg);
        Ok(Some(msg))
    }
}

/// Reads `name`/`value` pairs up to the empty name ending the list.
fn get_parameters(frame: &mut BytesMut) -> io::Result<Vec<Parameter>> {
    let mut parameters = Vec::new();
    loop {
        if frame.is_empty() {
            return Err(malformed("malformed packet - missing parameter fields"));
        }
        let name = get_cstr(frame)?;
        if name.is_empty() {
            break;
        }
        let value = get_cstr(frame)?;
        parameters.push(Parameter { name, value });
    }

    if !frame.is_empty() {
        return Err(malformed("malformed packet - trailing data after parameters"));
    }
    Ok(parameters)
}

/// Reads an `Int16` count followed by that many items.
fn get_counted<T>(
    buf: &mut BytesMut,
    error_msg: &str,
    mut item: impl FnMut(&mut BytesMut) -> io::Result<T>,
) -> io::Result<Vec<T>> {
    let count = usize::try_from(get_i16(buf, error_msg)?).map_err(|_| malformed(error_msg))?;
    (0..count).map(|_| item(buf)).collect()
}

/// Parses the payload of a regular frame, which must be fully consumed.
fn parse_payload(msg_id: u8, payload: &mut BytesMut) -> io::Result<Message> {
    let msg = match msg_id {
        MESSAGE_ID_BIND => Message::Bind {
            portal: get_cstr(payload)?,
            stmt_name: get_cstr(payload)?,
            param_formats: get_i16_list(payload, "malformed packet - invalid bind formats")?,
            parameters: get_counted(payload, "malformed packet - invalid bind parameters", |buf| {
                get_bytes(buf, "malformed packet - invalid bind parameter")
            })?,
            results_formats: get_i16_list(payload, "malformed packet - invalid result formats")?,
        },
        MESSAGE_ID_CLOSE => Message::Close {
            target: get_u8(payload, "malformed packet - missing close target")?,
            name: get_cstr(payload)?,
        },
        MESSAGE_ID_DESCRIBE => Message::Describe {
            target: get_u8(payload, "malformed packet - missing describe target")?,
            name: get_cstr(payload)?,
        },
        MESSAGE_ID_EXECUTE => Message::Execute {
            portal: get_cstr(payload)?,
            max_rows: get_u32(payload, "malformed packet - invalid execute data")?,
        },
        MESSAGE_ID_FLUSH => Message::Flush(),
        MESSAGE_ID_PARSE => Message::Parse {
            name: get_cstr(payload)?,
            query: get_cstr(payload)?,
            param_types: get_counted(payload, "malformed packet - invalid parse data", |buf| {
                get_u32(buf, "malformed packet - invalid parameter type")
            })?,
        },
        // The whole payload is the password and its terminator.
        MESSAGE_ID_PASSWORD_MESSAGE => match payload.iter().position(|&b| b == 0) {
            Some(end) if end + 1 == payload.len() => {
                let password = payload.split_to(end);
                payload.clear();
                Message::PasswordMessage(password)
            }
            _ => return Err(malformed("malformed packet - invalid password data")),
        },
        MESSAGE_ID_QUERY => Message::Query(get_cstr(payload)?),
        MESSAGE_ID_SYNC => Message::Sync(),
        MESSAGE_ID_TERMINATE => Message::Terminate(),
        _ => Message::NotImplemented(msg_id, payload.split().freeze()),
    };

    if !payload.is_empty() {
        log::trace!("{} unread bytes after {:?}", payload.len(), msg);
        return Err(malformed("malformed packet - invalid message length"));
    }
    Ok(msg)
}

impl Decoder for Codec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let size = match self.state {
            // The startup phase may start with an encryption request, answered
            // before the client sends its actual `StartupMessage`.
            // https://www.postgresql.org/docs/current/protocol-flow.html#id-1.10.5.7.12
            DecodeState::Startup => {
                let msg = self.decode_startup_message(src)?;
                if let Some(Message::StartupMessage { .. }) = msg {
                    self.startup_complete();
                }
                return Ok(msg);
            }
            DecodeState::Head => {
                let Some(size) = self.frame_size(src)? else {
                    return Ok(None);
                };
                self.state = DecodeState::Message(size);
                size
            }
            DecodeState::Message(size) => size,
        };

        if src.len() < size {
            log::trace!("frame of {} bytes, {} buffered", size, src.len());
            src.reserve(size - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(size);
        self.state = DecodeState::Head;
        let msg_id = payload.get_u8();
        payload.advance(BYTES_MESSAGE_SIZE);

        if self.ignore_till_sync && msg_id != MESSAGE_ID_SYNC && msg_id != MESSAGE_ID_TERMINATE {
            log::trace!("skipping msg id: '{}'", msg_id as char);
            return Ok(Some(Message::Skipped(msg_id)));
        }

        let msg = parse_payload(msg_id, &mut payload)?;
        log::debug!("decoded message frame: {:?}", msg);
        Ok(Some(msg))
    }
}

impl Encoder<Message> for Codec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        match msg {
            Message::Bind { portal, stmt_name, param_formats, parameters, results_formats } => {
                let msg_size = portal.len() + 1
                    + stmt_name.len() + 1
                    + 2 + 2 * param_formats.len()
                    + 2 + parameters.iter().map(|p| bytes_len(p.as_ref())).sum::<usize>()
                    + 2 + 2 * results_formats.len();
                encode_header(MESSAGE_ID_BIND, msg_size, dst);
                put_cstr(&portal, dst);
                put_cstr(&stmt_name, dst);
                dst.put_i16(param_formats.len() as i16);
                for format in param_formats {
                    dst.put_i16(format);
                }
                dst.put_i16(parameters.len() as i16);
                for parameter in parameters.iter() {
                    put_bytes(parameter.as_ref(), dst);
                }
                dst.put_i16(results_formats.len() as i16);
                for format in results_formats {
                    dst.put_i16(format);
                }
            }
            Message::CancelRequest { process_id, secret_key } => {
                dst.reserve(BYTES_CANCEL_REQUEST);
                dst.put_i32(BYTES_CANCEL_REQUEST as i32);
                dst.put_i32(MESSAGE_ID_CANCEL_REQUEST);
                dst.put_u32(process_id);
                dst.put_u32(secret_key);
            }
            Message::Close { target, name } => {
                encode_header(MESSAGE_ID_CLOSE, 1 + name.len() + 1, dst);
                dst.put_u8(target);
                put_cstr(&name, dst);
            }
            Message::Describe { target, name } => {
                encode_header(MESSAGE_ID_DESCRIBE, 1 + name.len() + 1, dst);
                dst.put_u8(target);
                put_cstr(&name, dst);
            }
            Message::Execute { portal, max_rows } => {
                encode_header(MESSAGE_ID_EXECUTE, portal.len() + 1 + 4, dst);
                put_cstr(&portal, dst);
                dst.put_u32(max_rows);
            }
            Message::Flush() => {
                encode_header(MESSAGE_ID_FLUSH, 0, dst);
            }
            Message::GSSENCRequest() => {
                dst.reserve(BYTES_STARTUP_MESSAGE_HEADER);
                dst.put_i32(BYTES_STARTUP_MESSAGE_HEADER as i32);
                dst.put_i32(MESSAGE_ID_GSSENC_REQUEST);
            }
            Message::NotImplemented(msg_id, payload) => {
                encode_header(msg_id, payload.len(), dst);
                dst.put(payload);
            }
            Message::Parse { name, query, param_types } => {
                let msg_size = name.len() + 1 + query.len() + 1 + 2 + 4 * param_types.len();
                encode_header(MESSAGE_ID_PARSE, msg_size, dst);
                put_cstr(&name, dst);
                put_cstr(&query, dst);
                dst.put_i16(param_types.len() as i16);
                for oid in param_types {
                    dst.put_u32(oid);
                }
            }
            Message::PasswordMessage(password) => {
                encode_header(MESSAGE_ID_PASSWORD_MESSAGE, password.len() + 1, dst);
                put_cstr(&password, dst);
            }
            Message::Query(query) => {
                encode_header(MESSAGE_ID_QUERY, query.len() + 1, dst);
                put_cstr(&query, dst);
            }
            Message::Skipped(msg_id) => {
                let err = io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot encode skipped message '{}'", msg_id as char),
                );
                return Err(err);
            }
            Message::StartupMessage {
                frame_length,
                parameters,
            } => {
                dst.reserve(frame_length);
                dst.put_i32(frame_length as i32);
                dst.put_i32(MESSAGE_ID_STARTUP_MESSAGE);
                for parameter in &parameters {
                    put_cstr(&parameter.name, dst);
                    put_cstr(&parameter.value, dst);
                }
                dst.put_u8(0); // name/value pair terminator
            }
            Message::SSLRequest() => {
                dst.reserve(BYTES_STARTUP_MESSAGE_HEADER);
                dst.put_i32(BYTES_STARTUP_MESSAGE_HEADER as i32);
                dst.put_i32(MESSAGE_ID_SSL_REQUEST);
            }
            Message::Sync() => {
                encode_header(MESSAGE_ID_SYNC, 0, dst);
            }
            Message::Terminate() => {
                encode_header(MESSAGE_ID_TERMINATE, 0, dst);
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
