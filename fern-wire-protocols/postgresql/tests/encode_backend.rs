// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

mod common;

mod encode_backend {

    use bytes::{Bytes, BytesMut};
    use test_log::test;
    use tokio_util::codec::{Decoder, Encoder};

    use fern_protocol_postgresql::codec::backend::{Codec, ErrorField, Message, RowDescription};

    /// Helper function to ease writing encoding tests.
    fn assert_encode(msg: Message) {
        let mut codec = Codec::new();
        let buf = &mut BytesMut::new();

        codec.encode(msg.clone(), buf).unwrap();
        assert_eq!(Some(msg), codec.decode(buf).unwrap());
        assert!(buf.is_empty());
    }

    fn assert_encode_bytes(msg: Message, expected: &[u8]) {
        let mut codec = Codec::new();
        let buf = &mut BytesMut::new();

        codec.encode(msg, buf).unwrap();
        assert_eq!(expected, &buf[..]);
    }

    #[test]
    #[rustfmt::skip]
    fn valid_authentication_ok() {
        let expected = [
            82,             // msg id: 'R'
            0, 0, 0, 8,     // payload length: 8
            0, 0, 0, 0,     // authentication case: ok
        ];

        assert_encode_bytes(Message::AuthenticationOk(), &expected);
    }

    #[test]
    #[rustfmt::skip]
    fn valid_ready_for_query() {
        let expected = [
            90,             // msg id: 'Z'
            0, 0, 0, 5,     // payload length: 5
            73,             // status: 'I' (idle)
        ];

        assert_encode_bytes(Message::ReadyForQuery(b'I'), &expected);
    }

    #[test]
    #[rustfmt::skip]
    fn valid_ssl_response_is_a_single_byte() {
        assert_encode_bytes(Message::SSLResponse(b'N'), &[78]);
    }

    #[test]
    #[rustfmt::skip]
    fn valid_data_row_with_null() {
        let expected = [
            68,                 // msg id: 'D'
            0, 0, 0, 15,        // payload length: 15
            0, 2,               // number of fields: 2
            0, 0, 0, 1,         // f1: length: 1
            49,                 // f1: value: "1"
            255, 255, 255, 255, // f2: NULL
        ];

        assert_encode_bytes(
            Message::DataRow(vec![Some(Bytes::from_static(b"1")), None]),
            &expected,
        );
    }

    #[test]
    #[rustfmt::skip]
    fn valid_error_response() {
        let expected = [
            69,                         // msg id: 'E'
            0, 0, 0, 25,                // payload length: 25
            83, 69, 82, 82, 79, 82, 0,  // severity: "ERROR\0"
            67, 52, 50, 54, 48, 49, 0,  // code: "42601\0"
            77, 98, 111, 111, 109, 0,   // message: "boom\0"
            0,                          // fields list terminator
        ];

        assert_encode_bytes(
            Message::ErrorResponse(vec![
                ErrorField::new(b'S', "ERROR"),
                ErrorField::new(b'C', "42601"),
                ErrorField::new(b'M', "boom"),
            ]),
            &expected,
        );
    }

    #[test]
    fn valid_startup_sequence_messages() {
        assert_encode(Message::AuthenticationCleartextPassword());
        assert_encode(Message::BackendKeyData {
            process: 7,
            secret_key: u32::MAX,
        });
        assert_encode(Message::ParameterStatus {
            parameter: Bytes::from_static(b"client_encoding"),
            value: Bytes::from_static(b"UTF8"),
        });
    }

    #[test]
    fn valid_extended_query_messages() {
        assert_encode(Message::ParseComplete());
        assert_encode(Message::BindComplete());
        assert_encode(Message::CloseComplete());
        assert_encode(Message::NoData());
        assert_encode(Message::EmptyQueryResponse());
        assert_encode(Message::ParameterDescription(vec![]));
        assert_encode(Message::ParameterDescription(vec![23, 1043]));
    }

    #[test]
    fn valid_row_description_multiple_columns() {
        assert_encode(Message::RowDescription(vec![
            RowDescription {
                name: Bytes::from_static(b"?column?"),
                table_oid: 0,
                column_attr: 1,
                data_type_oid: 1700,
                data_type_size: -1,
                type_modifier: (1000 << 16 | 2) + 4,
                format: 0,
            },
            RowDescription {
                name: Bytes::from_static(b"data"),
                table_oid: 0,
                column_attr: 2,
                data_type_oid: 17,
                data_type_size: -1,
                type_modifier: -1,
                format: 1,
            },
        ]));
        assert_encode(Message::CommandComplete(Bytes::from_static(b"SELECT 2")));
    }
}
