// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

mod common;

mod startup {
    use bytes::{Bytes, BytesMut};
    use test_log::test;

    use fern_pgwire_interfaces::ConnectionProperties;
    use fern_protocol_postgresql::codec::backend::Message;
    use fern_protocol_postgresql::codec::frontend;

    use crate::common::*;

    const PASSWORD_SETTINGS: &str = r#"
        [auth]
        method = "password"

        [auth.users]
        alice = "s3cret"
    "#;

    #[test(tokio::test)]
    async fn startup_sequence() {
        let engine = engine("");
        let mut client = TestClient::connect(&engine);

        client.send(startup("alice")).await;
        let messages = client.recv_until_ready().await;

        assert_eq!(9, messages.len(), "{:?}", messages);
        assert_eq!(Message::AuthenticationOk(), messages[0]);
        assert!(matches!(messages[1], Message::BackendKeyData { .. }));
        assert_eq!(
            Message::ParameterStatus {
                parameter: Bytes::from_static(b"server_version"),
                value: Bytes::from_static(b"10.5"),
            },
            messages[2]
        );
        assert!(messages[3..8]
            .iter()
            .all(|msg| matches!(msg, Message::ParameterStatus { .. })));
        assert_eq!(ready_for_query(), messages[8]);
        assert_eq!(1, engine.cancel_registry().len());
    }

    #[test(tokio::test)]
    async fn encryption_is_refused() {
        let engine = engine("");
        let mut client = TestClient::connect(&engine);

        client.send(frontend::Message::SSLRequest()).await;
        client.expect_encryption_response();
        assert_eq!(Message::SSLResponse(b'N'), client.recv().await);

        client.send(startup("alice")).await;
        let messages = client.recv_until_ready().await;
        assert_eq!(Message::AuthenticationOk(), messages[0]);
    }

    #[test(tokio::test)]
    async fn password_handshake() {
        let engine = engine(PASSWORD_SETTINGS);
        let mut client = TestClient::connect(&engine);

        client.send(startup("alice")).await;
        assert_eq!(Message::AuthenticationCleartextPassword(), client.recv().await);

        client
            .send(frontend::Message::PasswordMessage(BytesMut::from(&b"s3cret"[..])))
            .await;
        let messages = client.recv_until_ready().await;
        assert_eq!(Message::AuthenticationOk(), messages[0]);
    }

    #[test(tokio::test)]
    async fn wrong_password_is_fatal() {
        let engine = engine(PASSWORD_SETTINGS);
        let mut client = TestClient::connect(&engine);

        client.send(startup("alice")).await;
        assert_eq!(Message::AuthenticationCleartextPassword(), client.recv().await);
        client
            .send(frontend::Message::PasswordMessage(BytesMut::from(&b"guess"[..])))
            .await;

        let msg = client.recv().await;
        assert_error(&msg, "FATAL", "28000");
        assert_eq!(Some("ClientAuthentication".to_string()), error_field(&msg, b'R'));
        assert_eq!(
            Some("password authentication failed for user \"alice\"".to_string()),
            error_field(&msg, b'M')
        );
        client.assert_closed().await;
        assert!(engine.cancel_registry().is_empty());
    }

    #[test(tokio::test)]
    async fn missing_user_has_no_authentication_method() {
        let engine = engine("");
        let mut client = TestClient::connect(&engine);

        client
            .send(frontend::Message::startup(vec![frontend::Parameter::new("database", "fern")]))
            .await;

        let msg = client.recv().await;
        assert_error(&msg, "FATAL", "28000");
        assert_eq!(
            Some("No valid auth.host_based entry found for host \"[local]\", user \"\"".to_string()),
            error_field(&msg, b'M')
        );
        client.assert_closed().await;
    }

    #[test(tokio::test)]
    async fn unknown_method_refuses_startup() {
        let engine = engine(r#"auth.method = "passwrod""#);
        let mut client = TestClient::connect(&engine);

        client.send(startup("alice")).await;

        let msg = client.recv().await;
        assert_error(&msg, "FATAL", "28000");
        client.assert_closed().await;
    }

    #[test(tokio::test)]
    async fn address_not_allowed() {
        let engine = engine(r#"auth.trust_addresses = ["10.0.0.1"]"#);
        let properties = ConnectionProperties::new(Some("10.0.0.2:40000".parse().unwrap()));
        let mut client = TestClient::connect_from(&engine, properties);

        client.send(startup("alice")).await;

        let msg = client.recv().await;
        assert_error(&msg, "FATAL", "28000");
        assert_eq!(
            Some("No valid auth.host_based entry found for host \"10.0.0.2\", user \"alice\"".to_string()),
            error_field(&msg, b'M')
        );
        client.assert_closed().await;
    }

    #[test(tokio::test)]
    async fn unexpected_message_during_authentication() {
        let engine = engine(PASSWORD_SETTINGS);
        let mut client = TestClient::connect(&engine);

        client.send(startup("alice")).await;
        assert_eq!(Message::AuthenticationCleartextPassword(), client.recv().await);
        client.send(query("SELECT 1")).await;

        assert_error(&client.recv().await, "FATAL", "08P01");
        client.assert_closed().await;
    }

    #[test(tokio::test)]
    async fn unknown_database() {
        let engine = engine(r#"session.databases = ["other"]"#);
        let mut client = TestClient::connect(&engine);

        client.send(startup("alice")).await;

        assert_error(&client.recv().await, "FATAL", "3D000");
        client.assert_closed().await;
    }
}

mod simple_query {
    use bytes::Bytes;
    use test_log::test;

    use fern_protocol_postgresql::codec::backend::{Message, RowDescription};

    use crate::common::*;

    fn int4_column(name: &'static str) -> RowDescription {
        RowDescription {
            name: Bytes::from_static(name.as_bytes()),
            table_oid: 0,
            column_attr: 1,
            data_type_oid: 23,
            data_type_size: 4,
            type_modifier: -1,
            format: 0,
        }
    }

    #[test(tokio::test)]
    async fn single_statement() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client.send(query("SELECT 1 AS one")).await;

        assert_eq!(
            vec![
                Message::RowDescription(vec![int4_column("one")]),
                data_row(&[Some("1")]),
                command_complete("SELECT 1"),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }

    #[test(tokio::test)]
    async fn batch_stops_at_first_failure() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client.send(query("SELECT 1; BOGUS; SELECT 2;")).await;
        let messages = client.recv_until_ready().await;

        assert_eq!(5, messages.len(), "{:?}", messages);
        assert_eq!(Message::RowDescription(vec![int4_column("?column?")]), messages[0]);
        assert_eq!(data_row(&[Some("1")]), messages[1]);
        assert_eq!(command_complete("SELECT 1"), messages[2]);
        assert_error(&messages[3], "ERROR", "42601");
        assert_eq!(ready_for_query(), messages[4]);

        // Connection is still usable.
        client.send(query("SELECT 2")).await;
        let messages = client.recv_until_ready().await;
        assert_eq!(data_row(&[Some("2")]), messages[1]);
    }

    #[test(tokio::test)]
    async fn empty_statements() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client.send(query("")).await;
        assert_eq!(
            vec![Message::EmptyQueryResponse(), ready_for_query()],
            client.recv_until_ready().await
        );

        client.send(query(";")).await;
        assert_eq!(
            vec![Message::EmptyQueryResponse(), ready_for_query()],
            client.recv_until_ready().await
        );

        client.send(query("BEGIN; ; COMMIT;;")).await;
        assert_eq!(
            vec![
                command_complete("BEGIN"),
                command_complete("COMMIT"),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }

    #[test(tokio::test)]
    async fn rows_with_nulls() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client.send(query("SELECT generate_series(1, 3) AS n, NULL AS nothing")).await;
        let messages = client.recv_until_ready().await;

        assert_eq!(
            vec![
                data_row(&[Some("1"), None]),
                data_row(&[Some("2"), None]),
                data_row(&[Some("3"), None]),
                command_complete("SELECT 3"),
                ready_for_query(),
            ],
            messages[1..]
        );
    }
}

mod extended_query {
    use bytes::Bytes;
    use test_log::test;

    use fern_protocol_postgresql::codec::backend::{Message, RowDescription};
    use fern_protocol_postgresql::codec::frontend;

    use crate::common::*;

    #[test(tokio::test)]
    async fn happy_path() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "SELECT $1 AS n", vec![23]),
                bind("", "", vec![], vec![Some("42")]),
                describe(b'P', ""),
                execute(""),
                frontend::Message::Sync(),
            ])
            .await;

        assert_eq!(
            vec![
                Message::ParseComplete(),
                Message::BindComplete(),
                Message::RowDescription(vec![RowDescription {
                    name: Bytes::from_static(b"n"),
                    table_oid: 0,
                    column_attr: 1,
                    data_type_oid: 23,
                    data_type_size: 4,
                    type_modifier: -1,
                    format: 0,
                }]),
                data_row(&[Some("42")]),
                command_complete("SELECT 1"),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }

    #[test(tokio::test)]
    async fn describe_statement() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("s", "SELECT $1, 'a' AS b", vec![]),
                describe(b'S', "s"),
                parse("t", "BEGIN", vec![]),
                describe(b'S', "t"),
                frontend::Message::Sync(),
            ])
            .await;
        let messages = client.recv_until_ready().await;

        assert_eq!(7, messages.len(), "{:?}", messages);
        assert_eq!(Message::ParameterDescription(vec![25]), messages[1]);
        let Message::RowDescription(columns) = &messages[2] else {
            panic!("not a row description: {:?}", messages[2]);
        };
        assert_eq!(vec![25, 25], columns.iter().map(|c| c.data_type_oid).collect::<Vec<_>>());
        assert_eq!(Message::ParameterDescription(vec![]), messages[4]);
        assert_eq!(Message::NoData(), messages[5]);
    }

    #[test(tokio::test)]
    async fn binary_formats() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "SELECT $1", vec![23]),
                frontend::Message::Bind {
                    portal: Bytes::new(),
                    stmt_name: Bytes::new(),
                    param_formats: vec![1],
                    parameters: vec![Some(Bytes::from_static(&[0, 0, 1, 0]))],
                    results_formats: vec![1],
                },
                execute(""),
                frontend::Message::Sync(),
            ])
            .await;

        assert_eq!(
            vec![
                Message::ParseComplete(),
                Message::BindComplete(),
                Message::DataRow(vec![Some(Bytes::from_static(&[0, 0, 1, 0]))]),
                command_complete("SELECT 1"),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }

    #[test(tokio::test)]
    async fn error_then_resync() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "BOGUS", vec![]),
                bind("", "", vec![], vec![]),
                describe(b'P', ""),
                execute(""),
                frontend::Message::Sync(),
            ])
            .await;
        let messages = client.recv_until_ready().await;

        assert_eq!(2, messages.len(), "{:?}", messages);
        assert_error(&messages[0], "ERROR", "42601");
        assert_eq!(ready_for_query(), messages[1]);

        client
            .send_all(vec![
                parse("", "SELECT 1", vec![]),
                bind("", "", vec![], vec![]),
                execute(""),
                frontend::Message::Sync(),
            ])
            .await;
        let messages = client.recv_until_ready().await;
        assert_eq!(data_row(&[Some("1")]), messages[2]);
    }

    #[test(tokio::test)]
    async fn unsupported_format_code() {
        let (engine, bound) = engine_recording_binds();
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "SELECT $1", vec![23]),
                bind("p", "", vec![], vec![Some("1")]),
                bind("p", "", vec![7], vec![Some("2")]),
                execute("p"),
                frontend::Message::Sync(),
            ])
            .await;
        let messages = client.recv_until_ready().await;

        assert_eq!(4, messages.len(), "{:?}", messages);
        assert_eq!(Message::ParseComplete(), messages[0]);
        assert_eq!(Message::BindComplete(), messages[1]);
        assert_error(&messages[2], "ERROR", "22023");
        assert_eq!(
            Some("Unsupported format code '7' for param '0' of type 'integer'".to_string()),
            error_field(&messages[2], b'M')
        );

        // Only the first Bind reached the session.
        assert_eq!(vec!["p".to_string()], *bound.lock().unwrap());
    }

    #[test(tokio::test)]
    async fn unnamed_statement_is_replaced() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "SELECT 1", vec![]),
                parse("", "SELECT 2", vec![]),
                bind("", "", vec![], vec![]),
                execute(""),
                frontend::Message::Sync(),
            ])
            .await;

        assert_eq!(
            vec![
                Message::ParseComplete(),
                Message::ParseComplete(),
                Message::BindComplete(),
                data_row(&[Some("2")]),
                command_complete("SELECT 1"),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }

    #[test(tokio::test)]
    async fn close_is_idempotent() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("s", "SELECT 1", vec![]),
                close(b'S', "s"),
                close(b'S', "s"),
                close(b'P', "missing"),
                frontend::Message::Sync(),
            ])
            .await;
        assert_eq!(
            vec![
                Message::ParseComplete(),
                Message::CloseComplete(),
                Message::CloseComplete(),
                Message::CloseComplete(),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );

        client
            .send_all(vec![bind("", "s", vec![], vec![]), frontend::Message::Sync()])
            .await;
        assert_error(&client.recv().await, "ERROR", "26000");
    }

    #[test(tokio::test)]
    async fn max_rows_limits_output() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "SELECT generate_series(1, 10)", vec![]),
                bind("", "", vec![], vec![]),
                frontend::Message::Execute {
                    portal: Bytes::new(),
                    max_rows: 2,
                },
                frontend::Message::Sync(),
            ])
            .await;

        assert_eq!(
            vec![
                Message::ParseComplete(),
                Message::BindComplete(),
                data_row(&[Some("1")]),
                data_row(&[Some("2")]),
                command_complete("SELECT 2"),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }

    #[test(tokio::test)]
    async fn flush_sends_pending_responses() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![parse("", "SELECT 1", vec![]), frontend::Message::Flush()])
            .await;

        assert_eq!(Message::ParseComplete(), client.recv().await);
    }

    #[test(tokio::test)]
    async fn empty_portal() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "", vec![]),
                bind("", "", vec![], vec![]),
                execute(""),
                frontend::Message::Sync(),
            ])
            .await;

        assert_eq!(
            vec![
                Message::ParseComplete(),
                Message::BindComplete(),
                Message::EmptyQueryResponse(),
                ready_for_query(),
            ],
            client.recv_until_ready().await
        );
    }
}

mod errors {
    use bytes::BytesMut;
    use test_log::test;

    use fern_protocol_postgresql::codec::frontend;

    use crate::common::*;

    #[test(tokio::test)]
    async fn unsupported_message_type() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        // `FunctionCall`, with an empty payload.
        client.send_raw(&[b'F', 0, 0, 0, 4]).await;
        client.send(frontend::Message::Sync()).await;
        let messages = client.recv_until_ready().await;

        assert_eq!(2, messages.len(), "{:?}", messages);
        assert_error(&messages[0], "ERROR", "08P01");
        assert_eq!(
            Some("Unsupported messageType: F".to_string()),
            error_field(&messages[0], b'M')
        );
    }

    #[test(tokio::test)]
    async fn password_outside_authentication() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                frontend::Message::PasswordMessage(BytesMut::from(&b"late"[..])),
                frontend::Message::Sync(),
            ])
            .await;
        let messages = client.recv_until_ready().await;

        assert_eq!(2, messages.len(), "{:?}", messages);
        assert_error(&messages[0], "ERROR", "08P01");
    }

    #[test(tokio::test)]
    async fn malformed_frame_is_fatal() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        // Message length below the size of the length field itself.
        client.send_raw(&[b'Q', 0, 0, 0, 2]).await;

        assert_error(&client.recv().await, "FATAL", "08P01");
        client.assert_closed().await;
    }

    #[test(tokio::test)]
    async fn terminate_closes_connection() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;
        assert_eq!(1, engine.cancel_registry().len());

        client.send(frontend::Message::Terminate()).await;

        client.assert_closed().await;
        assert!(engine.cancel_registry().is_empty());
    }

    #[test(tokio::test)]
    async fn terminate_while_skipping() {
        let engine = engine("");
        let mut client = TestClient::ready(&engine).await;

        client
            .send_all(vec![
                parse("", "BOGUS", vec![]),
                execute(""),
                frontend::Message::Terminate(),
            ])
            .await;

        assert_error(&client.recv().await, "ERROR", "42601");
        client.assert_closed().await;
    }
}

mod cancel {
    use std::time::Duration;
    use test_log::test;

    use fern_protocol_postgresql::codec::backend::Message;
    use fern_protocol_postgresql::codec::frontend;

    use crate::common::*;

    /// Connects, returning the client along with its cancel key.
    async fn connect_with_key(engine: &std::sync::Arc<fern_pgwire::Engine>) -> (TestClient, u32, u32) {
        let mut client = TestClient::connect(engine);
        client.send(startup("alice")).await;

        let messages = client.recv_until_ready().await;
        let key = messages.iter().find_map(|msg| match msg {
            Message::BackendKeyData {
                process,
                secret_key,
            } => Some((*process, *secret_key)),
            _ => None,
        });
        let (process, secret_key) = key.unwrap();
        (client, process, secret_key)
    }

    #[test(tokio::test)]
    async fn cancel_running_query() {
        let engine = engine("");
        let (mut client, process_id, secret_key) = connect_with_key(&engine).await;

        client.send(query("SELECT pg_sleep(60)")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut canceller = TestClient::connect(&engine);
        canceller
            .send(frontend::Message::CancelRequest {
                process_id,
                secret_key,
            })
            .await;
        canceller.assert_closed().await;

        let messages = client.recv_until_ready().await;
        assert_eq!(2, messages.len(), "{:?}", messages);
        assert_error(&messages[0], "ERROR", "57014");
        assert_eq!(
            Some("canceling statement due to user request".to_string()),
            error_field(&messages[0], b'M')
        );
    }

    #[test(tokio::test)]
    async fn cancel_while_client_is_not_reading() {
        let engine = engine("");
        let (mut client, process_id, secret_key) = connect_with_key(&engine).await;

        client.send(query("SELECT generate_series(1, 300000)")).await;
        // Leave rows unread until the server has to wait for room.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut canceller = TestClient::connect(&engine);
        canceller
            .send(frontend::Message::CancelRequest {
                process_id,
                secret_key,
            })
            .await;
        canceller.assert_closed().await;

        let messages = client.recv_until_ready().await;
        let rows = messages
            .iter()
            .filter(|msg| matches!(msg, Message::DataRow(_)))
            .count();
        assert!(rows < 300000, "all {} rows were sent", rows);
        assert_error(&messages[messages.len() - 2], "ERROR", "57014");
        assert_eq!(ready_for_query(), messages[messages.len() - 1]);
    }

    #[test(tokio::test)]
    async fn cancel_requires_secret_key() {
        let engine = engine("");
        let (mut client, process_id, secret_key) = connect_with_key(&engine).await;

        client.send(query("SELECT pg_sleep(0.3)")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut canceller = TestClient::connect(&engine);
        canceller
            .send(frontend::Message::CancelRequest {
                process_id,
                secret_key: secret_key.wrapping_add(1),
            })
            .await;
        canceller.assert_closed().await;

        let messages = client.recv_until_ready().await;
        assert_eq!(command_complete("SELECT 1"), messages[messages.len() - 2]);
    }
}
