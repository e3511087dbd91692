// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

//! PostgreSQL protocol version 3 codecs, turning byte streams into
//! [`Stream`]s and [`Sink`]s of Messages through `tokio-util` framing.
//!
//! The [`frontend`] codec decodes what a client sends to a server, while the
//! [`backend`] codec encodes what a server answers. Both codecs also implement
//! the reverse direction, which is what clients and tests use.
//!
//! [`Stream`]: https://docs.rs/futures/*/futures/stream/trait.Stream.html
//! [`Sink`]: https://docs.rs/futures/*/futures/sink/trait.Sink.html

pub mod backend;
pub mod frontend;

/// Sizes of the regular framing: `byte type, int32 length`.
pub(crate) mod constants {
    pub const BYTES_MESSAGE_ID: usize = 1;

    /// The length field counts itself.
    pub const BYTES_MESSAGE_SIZE: usize = 4;

    pub const BYTES_MESSAGE_HEADER: usize = BYTES_MESSAGE_ID + BYTES_MESSAGE_SIZE;

    /// Largest frame accepted by default, header included.
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
}

pub use constants::DEFAULT_MAX_MESSAGE_SIZE;

/// Field readers and writers shared by both codecs.
///
/// Readers fail with [`io::ErrorKind::UnexpectedEof`] when a payload ends
/// before the field does, and with [`io::ErrorKind::InvalidInput`] when a
/// field holds an impossible value. Either way the frame is unusable.
///
/// [`io::ErrorKind::UnexpectedEof`]: std::io::ErrorKind::UnexpectedEof
/// [`io::ErrorKind::InvalidInput`]: std::io::ErrorKind::InvalidInput
pub(crate) mod utils {
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use std::io;

    use super::constants::*;

    pub(crate) fn malformed(msg: &str) -> io::Error {
        let err = io::Error::new(io::ErrorKind::InvalidInput, msg.to_string());
        log::error!("{}", err);
        err
    }

    fn truncated(error_msg: &str) -> io::Error {
        log::error!("{}", error_msg);
        io::Error::new(io::ErrorKind::UnexpectedEof, error_msg.to_string())
    }

    fn ensure(buf: &BytesMut, needed: usize, error_msg: &str) -> io::Result<()> {
        if buf.remaining() < needed {
            return Err(truncated(error_msg));
        }
        Ok(())
    }

    /// Reads an `int32` length-prefixed value, `-1` meaning SQL `NULL`.
    ///
    /// Found in `Bind` parameters and `DataRow` columns. The value shares
    /// the frame's memory rather than being copied.
    pub(crate) fn get_bytes(buf: &mut BytesMut, error_msg: &str) -> io::Result<Option<Bytes>> {
        let length = get_i32(buf, error_msg)?;
        log::trace!("value length: {}", length);

        match usize::try_from(length) {
            Ok(length) => {
                ensure(buf, length, error_msg)?;
                Ok(Some(buf.copy_to_bytes(length)))
            }
            Err(_) if length == -1 => Ok(None),
            Err(_) => Err(malformed(error_msg)),
        }
    }

    pub(crate) fn put_bytes(data: Option<&Bytes>, buf: &mut BytesMut) {
        match data {
            Some(data) => {
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
            None => buf.put_i32(-1),
        }
    }

    /// Size of what [`put_bytes`] writes.
    pub(crate) fn bytes_len(data: Option<&Bytes>) -> usize {
        4 + data.map_or(0, Bytes::len)
    }

    /// Reads a NUL-terminated string, consuming the terminator.
    ///
    /// A missing terminator is reported as [`io::ErrorKind::InvalidData`].
    pub(crate) fn get_cstr(buf: &mut BytesMut) -> io::Result<Bytes> {
        let Some(end) = buf.iter().position(|byte| *byte == 0) else {
            let err = io::Error::new(io::ErrorKind::InvalidData, "malformed packet - unterminated string");
            log::error!("{}", err);
            return Err(err);
        };

        let string = buf.copy_to_bytes(end);
        buf.advance(1);
        Ok(string)
    }

    /// Writes `string`, which must not contain NUL, and its terminator.
    pub(crate) fn put_cstr(string: &[u8], buf: &mut BytesMut) {
        buf.put_slice(string);
        buf.put_u8(0);
    }

    pub(crate) fn get_u32(buf: &mut BytesMut, error_msg: &str) -> io::Result<u32> {
        ensure(buf, 4, error_msg)?;
        Ok(buf.get_u32())
    }

    pub(crate) fn get_i32(buf: &mut BytesMut, error_msg: &str) -> io::Result<i32> {
        ensure(buf, 4, error_msg)?;
        Ok(buf.get_i32())
    }

    pub(crate) fn get_i16(buf: &mut BytesMut, error_msg: &str) -> io::Result<i16> {
        ensure(buf, 2, error_msg)?;
        Ok(buf.get_i16())
    }

    pub(crate) fn get_u8(buf: &mut BytesMut, error_msg: &str) -> io::Result<u8> {
        ensure(buf, 1, error_msg)?;
        Ok(buf.get_u8())
    }

    /// Reads an `int16` count followed by as many `int16` values.
    pub(crate) fn get_i16_list(buf: &mut BytesMut, error_msg: &str) -> io::Result<Vec<i16>> {
        let count = get_i16(buf, error_msg)?;
        let count = usize::try_from(count).map_err(|_| malformed(error_msg))?;

        (0..count).map(|_| get_i16(buf, error_msg)).collect()
    }

    /// Writes the type byte and length of a message with `msg_size` payload bytes.
    pub(crate) fn encode_header(msg_id: u8, msg_size: usize, dst: &mut BytesMut) {
        dst.reserve(BYTES_MESSAGE_HEADER + msg_size);
        dst.put_u8(msg_id);
        dst.put_u32((BYTES_MESSAGE_SIZE + msg_size) as u32);
    }
}
