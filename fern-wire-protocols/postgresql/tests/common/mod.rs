// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Feeds `data` to `codec` one byte at a time, as a fragmented stream would,
/// checking that no byte is consumed until a whole frame is available.
pub fn decode_byte_by_byte<C>(codec: &mut C, data: &[u8]) -> Vec<C::Item>
where
    C: Decoder,
    C::Error: std::fmt::Debug,
{
    let mut buf = BytesMut::new();
    let mut decoded = Vec::new();

    for byte in data {
        buf.extend_from_slice(&[*byte]);
        let buffered = buf.len();

        match codec.decode(&mut buf).unwrap() {
            Some(msg) => decoded.push(msg),
            None => assert_eq!(buffered, buf.len(), "bytes consumed from incomplete frame"),
        }
    }

    assert!(buf.is_empty(), "remaining bytes in read buffer");
    decoded
}
